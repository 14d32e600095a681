use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

const HISTORY_TOKEN_KEY: &str = "history_token";
const AUTHOR_KEY: &str = "author";

/// An opaque, totally ordered position in a store's change stream.
///
/// Ordering is bytewise. Only the store that minted a cursor knows how to read it.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChangeCursor(Vec<u8>);

impl ChangeCursor {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_newer_than(&self, other: &ChangeCursor) -> bool {
        self > other
    }
}

impl fmt::Debug for ChangeCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChangeCursor(")?;
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

/// The signal a store emits after a durable write. A MessagePack map of byte strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    payload: Vec<u8>,
}

impl ChangeNotification {
    pub fn from_payload(payload: Vec<u8>) -> Self {
        Self { payload }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn for_cursor(cursor: &ChangeCursor, author: &str) -> Result<Self, CoreError> {
        let mut map: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        map.insert(HISTORY_TOKEN_KEY.to_string(), cursor.as_bytes().to_vec());
        map.insert(AUTHOR_KEY.to_string(), author.as_bytes().to_vec());
        let payload =
            rmp_serde::to_vec(&map).map_err(|e| CoreError::Serialization(e.to_string()))?;
        Ok(Self { payload })
    }

    fn decode(&self) -> Option<BTreeMap<String, Vec<u8>>> {
        rmp_serde::from_slice(&self.payload).ok()
    }

    /// The cursor carried by this signal. `None` for undecodable or token-less payloads.
    pub fn cursor(&self) -> Option<ChangeCursor> {
        let token = self.decode()?.remove(HISTORY_TOKEN_KEY)?;
        if token.is_empty() {
            return None;
        }
        Some(ChangeCursor::from_bytes(token))
    }

    pub fn author(&self) -> Option<String> {
        let raw = self.decode()?.remove(AUTHOR_KEY)?;
        String::from_utf8(raw).ok()
    }
}

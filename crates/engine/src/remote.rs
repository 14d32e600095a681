//! The shared remote record store. Only the contract lives here; transports implement
//! [`RemoteStore`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use cardgraph_core::records::{CardRecord, CollectionRecord};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    #[error("remote rejected save: {0}")]
    Rejected(String),

    #[error("no signed-in user")]
    NotAuthenticated,

    #[error("remote record not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteRecord {
    Collection(CollectionRecord),
    Card(CardRecord),
    User(UserRecord),
}

impl RemoteRecord {
    pub fn id(&self) -> &str {
        match self {
            Self::Collection(record) => &record.id,
            Self::Card(record) => &record.id,
            Self::User(record) => &record.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteQuery {
    Collection { id: String },
    CardsInCollection { collection_id: String },
    CurrentUser,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SavedRecords {
    pub record_ids: Vec<String>,
}

pub trait RemoteStore {
    /// Store every record or none of them.
    fn save(&mut self, records: Vec<RemoteRecord>) -> Result<SavedRecords, RemoteError>;

    fn query(&self, query: &RemoteQuery) -> Result<Vec<RemoteRecord>, RemoteError>;
}

/// What a successful publish produced on the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub collection_id: String,
    pub owner: String,
    pub card_count: usize,
}

//! Portable, ID-keyed records used at the system boundary (export files, publish
//! and download payloads). Foreign keys are plain strings.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::model::Formality;

pub const DOCUMENT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRecord {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardRecord {
    pub id: String,
    #[serde(rename = "collectionID")]
    pub collection_id: String,
    pub native: String,
    pub translation: String,
    #[serde(default)]
    pub formality: Formality,
    #[serde(default)]
    pub favorited: bool,
    #[serde(default)]
    pub note: String,
    #[serde(rename = "tagIDs", default)]
    pub tag_ids: Vec<String>,
    #[serde(rename = "tagNames", default, skip_serializing_if = "Vec::is_empty")]
    pub tag_names: Vec<String>,
    #[serde(rename = "relationshipIDs", default)]
    pub relationship_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRecord {
    pub id: String,
    pub name: String,
}

/// The export file: three ordered record lists plus an optional content checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortableDocument {
    pub version: u32,
    pub collections: Vec<CollectionRecord>,
    pub cards: Vec<CardRecord>,
    pub tags: Vec<TagRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[derive(Serialize)]
struct ChecksumView<'a> {
    collections: &'a [CollectionRecord],
    cards: &'a [CardRecord],
    tags: &'a [TagRecord],
}

impl PortableDocument {
    /// Build a document in canonical order: every list sorted by id, every id list sorted.
    pub fn new(
        mut collections: Vec<CollectionRecord>,
        mut cards: Vec<CardRecord>,
        mut tags: Vec<TagRecord>,
    ) -> Self {
        collections.sort_by(|a, b| a.id.cmp(&b.id));
        tags.sort_by(|a, b| a.id.cmp(&b.id));
        for card in &mut cards {
            card.tag_ids.sort();
            card.tag_names.sort();
            card.relationship_ids.sort();
        }
        cards.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            version: DOCUMENT_VERSION,
            collections,
            cards,
            tags,
            checksum: None,
        }
    }

    pub fn content_checksum(&self) -> Result<String, CoreError> {
        let view = ChecksumView {
            collections: &self.collections,
            cards: &self.cards,
            tags: &self.tags,
        };
        let bytes =
            serde_json::to_vec(&view).map_err(|e| CoreError::Serialization(e.to_string()))?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }

    pub fn with_checksum(mut self) -> Result<Self, CoreError> {
        self.checksum = Some(self.content_checksum()?);
        Ok(self)
    }

    /// Check the stored checksum, if any, against the document content.
    pub fn verify_checksum(&self) -> Result<(), CoreError> {
        let Some(expected) = &self.checksum else {
            return Ok(());
        };
        let actual = self.content_checksum()?;
        if &actual != expected {
            return Err(CoreError::ChecksumMismatch {
                expected: expected.clone(),
                actual,
            });
        }
        Ok(())
    }

    pub fn to_json_pretty(&self) -> Result<String, CoreError> {
        serde_json::to_string_pretty(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        let doc: PortableDocument =
            serde_json::from_str(json).map_err(|e| CoreError::Serialization(e.to_string()))?;
        if doc.version != DOCUMENT_VERSION {
            return Err(CoreError::InvalidData(format!(
                "unsupported document version {}",
                doc.version
            )));
        }
        Ok(doc)
    }
}

/// One collection plus its cards, keyed by identifiers minted for the remote namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishPayload {
    pub collection: CollectionRecord,
    pub cards: Vec<CardRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(id: &str, rels: &[&str]) -> CardRecord {
        CardRecord {
            id: id.into(),
            collection_id: "c1".into(),
            native: "uno".into(),
            translation: "one".into(),
            formality: Formality::Unspecified,
            favorited: false,
            note: String::new(),
            tag_ids: vec!["t2".into(), "t1".into()],
            tag_names: Vec::new(),
            relationship_ids: rels.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn card_record_uses_wire_field_names() {
        let json = serde_json::to_value(card("a", &["b"])).unwrap();
        assert_eq!(json["collectionID"], "c1");
        assert_eq!(json["relationshipIDs"][0], "b");
        assert!(json.get("tagNames").is_none());
    }

    #[test]
    fn new_document_is_canonically_ordered() {
        let cards = vec![card("b", &["z", "a"]), card("a", &[])];
        let doc = PortableDocument::new(Vec::new(), cards, Vec::new());
        assert_eq!(doc.cards[0].id, "a");
        assert_eq!(doc.cards[1].relationship_ids, vec!["a", "z"]);
        assert_eq!(doc.cards[1].tag_ids, vec!["t1", "t2"]);
    }

    #[test]
    fn tampered_document_fails_checksum() {
        let doc = PortableDocument::new(Vec::new(), vec![card("a", &[])], Vec::new())
            .with_checksum()
            .unwrap();
        assert!(doc.verify_checksum().is_ok());

        let mut tampered = doc.clone();
        tampered.cards[0].native = "dos".into();
        assert!(matches!(
            tampered.verify_checksum(),
            Err(CoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let json = r#"{"version":9,"collections":[],"cards":[],"tags":[]}"#;
        assert!(matches!(PortableDocument::from_json(json), Err(CoreError::InvalidData(_))));
    }
}

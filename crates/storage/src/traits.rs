use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use cardgraph_core::{
    change::ChangeSet,
    cursor::ChangeCursor,
    ids::EntityId,
    model::{EntityKind, FieldMap},
};

use crate::error::StorageError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRecord {
    pub entity_id: EntityId,
    pub kind: EntityKind,
    /// History sequence of the commit that created the entity.
    pub created_seq: i64,
    pub updated_seq: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryOp {
    Inserted,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryChange {
    pub entity_id: EntityId,
    pub kind: EntityKind,
    pub op: HistoryOp,
}

/// One durable commit as recorded in the store's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub cursor: ChangeCursor,
    pub author: String,
    pub committed_at_ms: i64,
    pub changes: Vec<HistoryChange>,
}

impl HistoryEntry {
    pub fn deleted_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.changes
            .iter()
            .filter(|c| c.op == HistoryOp::Deleted)
            .map(|c| c.entity_id)
    }

    pub fn touched_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.changes.iter().map(|c| c.entity_id)
    }
}

/// The durable root of the object graph.
pub trait Storage {
    fn get_entity(&self, entity_id: EntityId) -> Result<Option<EntityRecord>, StorageError>;

    fn get_fields(&self, entity_id: EntityId) -> Result<FieldMap, StorageError>;

    fn list_entities(&self, kind: EntityKind) -> Result<Vec<EntityId>, StorageError>;

    /// Cards related to `card_id`, from either side of the undirected edge.
    fn get_related(&self, card_id: EntityId) -> Result<BTreeSet<EntityId>, StorageError>;

    fn get_tags_of_card(&self, card_id: EntityId) -> Result<BTreeSet<EntityId>, StorageError>;

    fn get_cards_with_tag(&self, tag_id: EntityId) -> Result<BTreeSet<EntityId>, StorageError>;

    /// Apply a merged change set atomically and append one history entry for it.
    fn apply_changes(
        &mut self,
        changes: &ChangeSet,
        author: &str,
    ) -> Result<HistoryEntry, StorageError>;

    /// Cursor of the newest history entry, if any commit happened yet.
    fn current_cursor(&self) -> Result<Option<ChangeCursor>, StorageError>;

    /// History entries strictly newer than `after` (all entries when `None`), oldest first.
    fn history_after(
        &self,
        after: Option<&ChangeCursor>,
    ) -> Result<Vec<HistoryEntry>, StorageError>;

    /// Delete history entries older than `cursor`. Returns the number removed.
    fn prune_history_before(&mut self, cursor: &ChangeCursor) -> Result<u64, StorageError>;

    fn get_sync_value(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    fn put_sync_value(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError>;
}

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use rusqlite::{Connection, OptionalExtension, Transaction, params};
use tracing::debug;

use cardgraph_core::{
    change::{ChangeSet, EntityChange, Membership},
    cursor::ChangeCursor,
    field_value::FieldValue,
    ids::EntityId,
    model::{EntityKind, FieldMap},
};

use crate::error::StorageError;
use crate::traits::{EntityRecord, HistoryChange, HistoryEntry, HistoryOp, Storage};

/// Convert Vec<u8> to fixed-size array with proper error handling.
fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], StorageError> {
    v.try_into()
        .map_err(|_| StorageError::Serialization(format!("invalid {label} length")))
}

fn entity_id_from(bytes: Vec<u8>, label: &str) -> Result<EntityId, StorageError> {
    Ok(EntityId::from_bytes(to_array::<16>(bytes, label)?))
}

/// History cursors are the big-endian history sequence, so byte order matches commit order.
fn cursor_for_seq(seq: i64) -> ChangeCursor {
    ChangeCursor::from_bytes((seq as u64).to_be_bytes().to_vec())
}

fn seq_of(cursor: &ChangeCursor) -> Result<i64, StorageError> {
    let arr: [u8; 8] = cursor
        .as_bytes()
        .try_into()
        .map_err(|_| StorageError::InvalidCursor(format!("{cursor:?}")))?;
    Ok(u64::from_be_bytes(arr) as i64)
}

pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    fn query_ids(&self, sql: &str, id: EntityId) -> Result<BTreeSet<EntityId>, StorageError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params![id.as_bytes().as_slice()], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|bytes| entity_id_from(bytes, "entity_id"))
            .collect()
    }
}

/// Summarize a change set for the history log. Membership edits count as updates of
/// both endpoints.
fn history_changes(changes: &ChangeSet) -> Vec<HistoryChange> {
    let mut out: BTreeMap<EntityId, HistoryChange> = BTreeMap::new();
    for (id, change) in changes.entities() {
        let op = match change {
            EntityChange::Created { .. } => HistoryOp::Inserted,
            EntityChange::Updated { .. } => HistoryOp::Updated,
            EntityChange::Deleted { .. } => HistoryOp::Deleted,
        };
        out.insert(
            *id,
            HistoryChange {
                entity_id: *id,
                kind: change.kind(),
                op,
            },
        );
    }
    let mut touch = |entity_id: EntityId, kind: EntityKind| {
        out.entry(entity_id).or_insert(HistoryChange {
            entity_id,
            kind,
            op: HistoryOp::Updated,
        });
    };
    for edge in changes.relations().keys() {
        touch(edge.low(), EntityKind::Card);
        touch(edge.high(), EntityKind::Card);
    }
    for (card, tag) in changes.card_tags().keys() {
        touch(*card, EntityKind::Card);
        touch(*tag, EntityKind::Tag);
    }
    out.into_values().collect()
}

fn write_fields(
    tx: &Transaction,
    entity_id: EntityId,
    fields: &FieldMap,
) -> Result<(), StorageError> {
    for (key, value) in fields {
        if value.is_null() {
            tx.execute(
                "DELETE FROM fields WHERE entity_id = ?1 AND field_key = ?2",
                params![entity_id.as_bytes().as_slice(), key],
            )?;
            continue;
        }
        let value_bytes = value
            .to_msgpack()
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        tx.execute(
            "INSERT INTO fields (entity_id, field_key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(entity_id, field_key) DO UPDATE SET value = excluded.value",
            params![entity_id.as_bytes().as_slice(), key, value_bytes],
        )?;
    }
    Ok(())
}

fn read_history_row(
    seq: i64,
    author: String,
    committed_at_ms: i64,
    payload: Vec<u8>,
) -> Result<HistoryEntry, StorageError> {
    let changes: Vec<HistoryChange> = rmp_serde::from_slice(&payload)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(HistoryEntry {
        cursor: cursor_for_seq(seq),
        author,
        committed_at_ms,
        changes,
    })
}

impl Storage for SqliteStorage {
    fn get_entity(&self, entity_id: EntityId) -> Result<Option<EntityRecord>, StorageError> {
        let row = self
            .conn
            .query_row(
                "SELECT kind, created_seq, updated_seq FROM entities WHERE entity_id = ?1",
                params![entity_id.as_bytes().as_slice()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((kind, created_seq, updated_seq)) => Ok(Some(EntityRecord {
                entity_id,
                kind: EntityKind::parse(&kind)?,
                created_seq,
                updated_seq,
            })),
            None => Ok(None),
        }
    }

    fn get_fields(&self, entity_id: EntityId) -> Result<FieldMap, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT field_key, value FROM fields WHERE entity_id = ?1")?;
        let rows = stmt.query_map(params![entity_id.as_bytes().as_slice()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut result = FieldMap::new();
        for row in rows {
            let (key, val_bytes) = row?;
            let value = FieldValue::from_msgpack(&val_bytes)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            result.insert(key, value);
        }
        Ok(result)
    }

    fn list_entities(&self, kind: EntityKind) -> Result<Vec<EntityId>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT entity_id FROM entities WHERE kind = ?1 ORDER BY entity_id")?;
        let rows = stmt
            .query_map(params![kind.as_str()], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|bytes| entity_id_from(bytes, "entity_id"))
            .collect()
    }

    fn get_related(&self, card_id: EntityId) -> Result<BTreeSet<EntityId>, StorageError> {
        self.query_ids(
            "SELECT high_id FROM relations WHERE low_id = ?1
             UNION SELECT low_id FROM relations WHERE high_id = ?1",
            card_id,
        )
    }

    fn get_tags_of_card(&self, card_id: EntityId) -> Result<BTreeSet<EntityId>, StorageError> {
        self.query_ids("SELECT tag_id FROM card_tags WHERE card_id = ?1", card_id)
    }

    fn get_cards_with_tag(&self, tag_id: EntityId) -> Result<BTreeSet<EntityId>, StorageError> {
        self.query_ids("SELECT card_id FROM card_tags WHERE tag_id = ?1", tag_id)
    }

    fn apply_changes(
        &mut self,
        changes: &ChangeSet,
        author: &str,
    ) -> Result<HistoryEntry, StorageError> {
        let history = history_changes(changes);
        let payload =
            rmp_serde::to_vec(&history).map_err(|e| StorageError::Serialization(e.to_string()))?;

        let tx = self.conn.transaction()?;

        tx.execute(
            "INSERT INTO history (author, changes) VALUES (?1, ?2)",
            params![author, payload],
        )?;
        let seq = tx.last_insert_rowid();
        let committed_at_ms: i64 = tx.query_row(
            "SELECT committed_at FROM history WHERE seq = ?1",
            params![seq],
            |row| row.get(0),
        )?;

        // Creations and patches first, so membership rows can reference new entities.
        for (id, change) in changes.entities() {
            match change {
                EntityChange::Created { kind, fields } => {
                    // Re-creating an id replaces whatever state it had.
                    tx.execute(
                        "DELETE FROM entities WHERE entity_id = ?1",
                        params![id.as_bytes().as_slice()],
                    )?;
                    tx.execute(
                        "INSERT INTO entities (entity_id, kind, created_seq, updated_seq) VALUES (?1, ?2, ?3, ?3)",
                        params![id.as_bytes().as_slice(), kind.as_str(), seq],
                    )?;
                    write_fields(&tx, *id, fields)?;
                }
                EntityChange::Updated { kind, fields } => {
                    let updated = tx.execute(
                        "UPDATE entities SET updated_seq = ?1 WHERE entity_id = ?2 AND kind = ?3",
                        params![seq, id.as_bytes().as_slice(), kind.as_str()],
                    )?;
                    if updated == 0 {
                        return Err(StorageError::NotFound(format!("{kind} {id}")));
                    }
                    write_fields(&tx, *id, fields)?;
                }
                EntityChange::Deleted { .. } => {}
            }
        }

        for (edge, membership) in changes.relations() {
            let sql = match membership {
                Membership::Added => {
                    "INSERT OR IGNORE INTO relations (low_id, high_id) VALUES (?1, ?2)"
                }
                Membership::Removed => "DELETE FROM relations WHERE low_id = ?1 AND high_id = ?2",
            };
            tx.execute(
                sql,
                params![edge.low().as_bytes().as_slice(), edge.high().as_bytes().as_slice()],
            )?;
        }

        for ((card, tag), membership) in changes.card_tags() {
            let sql = match membership {
                Membership::Added => {
                    "INSERT OR IGNORE INTO card_tags (card_id, tag_id) VALUES (?1, ?2)"
                }
                Membership::Removed => "DELETE FROM card_tags WHERE card_id = ?1 AND tag_id = ?2",
            };
            tx.execute(
                sql,
                params![card.as_bytes().as_slice(), tag.as_bytes().as_slice()],
            )?;
        }

        // Deletions last; fields and memberships go with the entity row.
        for (id, change) in changes.entities() {
            if change.is_deleted() {
                tx.execute(
                    "DELETE FROM entities WHERE entity_id = ?1",
                    params![id.as_bytes().as_slice()],
                )?;
            }
        }

        tx.commit()?;
        debug!(seq, author, changes = history.len(), "applied change set");

        Ok(HistoryEntry {
            cursor: cursor_for_seq(seq),
            author: author.to_string(),
            committed_at_ms,
            changes: history,
        })
    }

    fn current_cursor(&self) -> Result<Option<ChangeCursor>, StorageError> {
        let seq: Option<i64> = self
            .conn
            .query_row("SELECT MAX(seq) FROM history", [], |row| row.get(0))?;
        Ok(seq.map(cursor_for_seq))
    }

    fn history_after(
        &self,
        after: Option<&ChangeCursor>,
    ) -> Result<Vec<HistoryEntry>, StorageError> {
        let after_seq = match after {
            Some(cursor) => seq_of(cursor)?,
            None => 0,
        };
        let mut stmt = self.conn.prepare(
            "SELECT seq, author, committed_at, changes FROM history WHERE seq > ?1 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![after_seq], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(seq, author, committed_at, payload)| {
                read_history_row(seq, author, committed_at, payload)
            })
            .collect()
    }

    fn prune_history_before(&mut self, cursor: &ChangeCursor) -> Result<u64, StorageError> {
        let seq = seq_of(cursor)?;
        let removed = self
            .conn
            .execute("DELETE FROM history WHERE seq < ?1", params![seq])?;
        Ok(removed as u64)
    }

    fn get_sync_value(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM sync_state WHERE key = ?1",
                params![key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?)
    }

    fn put_sync_value(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO sync_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

//! Change history tracking: where this engine is in the store's change stream, and
//! when the stream was last pruned.
//!
//! State lives in the storage's sync-state table, keyed by the engine's author so that
//! several engines can share one database.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use cardgraph_core::{ChangeCursor, ChangeNotification};
use cardgraph_storage::{Storage, StorageError};

#[derive(Debug, Clone)]
pub struct HistoryTracker {
    cursor_key: String,
    prune_key: String,
    prune_interval: Duration,
}

impl HistoryTracker {
    pub fn new(author: &str, prune_interval_days: i64) -> Self {
        Self {
            cursor_key: format!("history.{author}.last_cursor"),
            prune_key: format!("history.{author}.last_prune"),
            prune_interval: Duration::days(prune_interval_days),
        }
    }

    pub fn last_cursor(&self, storage: &impl Storage) -> Result<Option<ChangeCursor>, StorageError> {
        Ok(storage
            .get_sync_value(&self.cursor_key)?
            .map(ChangeCursor::from_bytes))
    }

    /// Persist `cursor` as the newest processed position. Recording the current cursor
    /// again, or an older one, changes nothing. Returns whether the cursor advanced.
    pub fn record_cursor(
        &self,
        storage: &mut impl Storage,
        cursor: &ChangeCursor,
    ) -> Result<bool, StorageError> {
        if let Some(last) = self.last_cursor(storage)?
            && !cursor.is_newer_than(&last)
        {
            debug!(?cursor, ?last, "ignoring cursor that is not newer");
            return Ok(false);
        }
        storage.put_sync_value(&self.cursor_key, cursor.as_bytes())?;
        Ok(true)
    }

    pub fn cursor_from_notification(notification: &ChangeNotification) -> Option<ChangeCursor> {
        notification.cursor()
    }

    pub fn last_prune(&self, storage: &impl Storage) -> Result<Option<DateTime<Utc>>, StorageError> {
        let Some(raw) = storage.get_sync_value(&self.prune_key)? else {
            return Ok(None);
        };
        // An unreadable date counts as never pruned.
        Ok(std::str::from_utf8(&raw)
            .ok()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }

    /// Delete history older than `cursor`, at most once per prune interval.
    /// Returns `None` when the prune was skipped.
    pub fn prune_history_before(
        &self,
        storage: &mut impl Storage,
        cursor: &ChangeCursor,
        now: DateTime<Utc>,
    ) -> Result<Option<u64>, StorageError> {
        if let Some(last) = self.last_prune(storage)?
            && now - last < self.prune_interval
        {
            debug!(%last, "history prune skipped, interval not elapsed");
            return Ok(None);
        }
        let removed = storage.prune_history_before(cursor)?;
        storage.put_sync_value(&self.prune_key, now.to_rfc3339().as_bytes())?;
        info!(removed, ?cursor, "pruned change history");
        Ok(Some(removed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardgraph_core::{ChangeSet, EntityId, EntityKind, FieldMap};
    use cardgraph_storage::SqliteStorage;

    fn commit_tag(storage: &mut SqliteStorage) -> ChangeCursor {
        let mut changes = ChangeSet::new();
        changes.create(EntityId::new(), EntityKind::Tag, FieldMap::new());
        storage.apply_changes(&changes, "test").unwrap().cursor
    }

    #[test]
    fn record_cursor_only_moves_forward() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let tracker = HistoryTracker::new("app", 30);
        let first = commit_tag(&mut storage);
        let second = commit_tag(&mut storage);

        assert_eq!(tracker.last_cursor(&storage).unwrap(), None);
        assert!(tracker.record_cursor(&mut storage, &second).unwrap());
        assert!(!tracker.record_cursor(&mut storage, &second).unwrap());
        assert!(!tracker.record_cursor(&mut storage, &first).unwrap());
        assert_eq!(tracker.last_cursor(&storage).unwrap(), Some(second));
    }

    #[test]
    fn trackers_are_namespaced_by_author() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let cursor = commit_tag(&mut storage);
        HistoryTracker::new("app", 30)
            .record_cursor(&mut storage, &cursor)
            .unwrap();
        let widget = HistoryTracker::new("widget", 30);
        assert_eq!(widget.last_cursor(&storage).unwrap(), None);
    }

    #[test]
    fn prune_is_throttled_by_interval() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let tracker = HistoryTracker::new("app", 30);
        commit_tag(&mut storage);
        let middle = commit_tag(&mut storage);
        let newest = commit_tag(&mut storage);
        let start = Utc::now();

        assert_eq!(
            tracker.prune_history_before(&mut storage, &middle, start).unwrap(),
            Some(1)
        );
        let soon = start + Duration::days(29);
        assert_eq!(
            tracker.prune_history_before(&mut storage, &newest, soon).unwrap(),
            None
        );
        let later = start + Duration::days(31);
        assert_eq!(
            tracker.prune_history_before(&mut storage, &newest, later).unwrap(),
            Some(1)
        );
        let recorded = tracker.last_prune(&storage).unwrap().unwrap();
        assert_eq!(recorded.timestamp(), later.timestamp());
    }

    #[test]
    fn garbage_notification_has_no_cursor() {
        let notification = ChangeNotification::from_payload(vec![0xc1, 0x00]);
        assert_eq!(HistoryTracker::cursor_from_notification(&notification), None);
    }
}

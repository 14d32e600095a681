use std::collections::BTreeMap;

use uuid::Uuid;

use cardgraph_core::records::{CardRecord, CollectionRecord};
use cardgraph_engine::{
    RemoteError, RemoteQuery, RemoteRecord, RemoteStore, SavedRecords, UserRecord,
};

/// A remote record store kept in memory. Saves are all-or-nothing and can be made to
/// fail once.
#[derive(Debug, Default)]
pub struct InMemoryRemote {
    records: BTreeMap<String, RemoteRecord>,
    user: Option<UserRecord>,
    fail_next_save: Option<RemoteError>,
    save_calls: usize,
}

impl InMemoryRemote {
    /// A remote with no signed-in user.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signed_in(display_name: &str) -> Self {
        Self {
            user: Some(UserRecord {
                id: Uuid::new_v4().to_string(),
                display_name: display_name.to_string(),
            }),
            ..Self::default()
        }
    }

    pub fn user(&self) -> Option<&UserRecord> {
        self.user.as_ref()
    }

    pub fn fail_next_save(&mut self, error: RemoteError) {
        self.fail_next_save = Some(error);
    }

    pub fn save_calls(&self) -> usize {
        self.save_calls
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn collections(&self) -> Vec<&CollectionRecord> {
        self.records
            .values()
            .filter_map(|record| match record {
                RemoteRecord::Collection(collection) => Some(collection),
                _ => None,
            })
            .collect()
    }

    pub fn cards_of(&self, collection_id: &str) -> Vec<&CardRecord> {
        self.records
            .values()
            .filter_map(|record| match record {
                RemoteRecord::Card(card) if card.collection_id == collection_id => Some(card),
                _ => None,
            })
            .collect()
    }
}

impl RemoteStore for InMemoryRemote {
    fn save(&mut self, records: Vec<RemoteRecord>) -> Result<SavedRecords, RemoteError> {
        self.save_calls += 1;
        if let Some(error) = self.fail_next_save.take() {
            return Err(error);
        }
        let mut saved = SavedRecords::default();
        for record in records {
            saved.record_ids.push(record.id().to_string());
            self.records.insert(record.id().to_string(), record);
        }
        Ok(saved)
    }

    fn query(&self, query: &RemoteQuery) -> Result<Vec<RemoteRecord>, RemoteError> {
        let found = match query {
            RemoteQuery::Collection { id } => self
                .records
                .get(id)
                .filter(|record| matches!(record, RemoteRecord::Collection(_)))
                .cloned()
                .into_iter()
                .collect(),
            RemoteQuery::CardsInCollection { collection_id } => self
                .cards_of(collection_id)
                .into_iter()
                .cloned()
                .map(RemoteRecord::Card)
                .collect(),
            RemoteQuery::CurrentUser => self.user.clone().map(RemoteRecord::User).into_iter().collect(),
        };
        Ok(found)
    }
}

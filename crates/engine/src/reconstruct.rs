//! Record to graph conversion: restoring export files and downloading published
//! collections.
//!
//! Both run in passes. Tags are mapped first, then every collection and card gets its
//! local id, and only then are references wired. A restore finishes with a dedup pass
//! that folds newly created tags into existing tags of the same name.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use cardgraph_core::{
    Card, Collection, CoreError, EntityId, EntityKind, FieldMap, FieldValue, ScopeId, Tag,
    model::{fields, normalize_tag_name},
    records::{CardRecord, PortableDocument, PublishPayload},
};

use crate::error::EngineError;
use crate::jobs::JobKind;
use crate::remote::{RemoteError, RemoteQuery, RemoteRecord, RemoteStore};
use crate::Engine;

const COLLECTION_ID_FIELD: &str = "collectionID";

#[derive(Debug, Clone, Copy)]
pub enum ReconstructSource<'a> {
    /// An export file. Record ids that are UUIDs are kept as local ids.
    Restore(&'a PortableDocument),
    /// A published collection. Everything gets fresh local ids; tags are matched by name.
    Download(&'a PublishPayload),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Local ids of the collections written, in record order.
    pub collection_ids: Vec<EntityId>,
    pub collections_created: usize,
    pub collections_updated: usize,
    pub cards_created: usize,
    pub cards_updated: usize,
    pub tags_created: usize,
    pub tags_reused: usize,
    pub tags_merged: usize,
    pub dropped_references: usize,
}

/// Scalar card fields of a record. The collection is wired separately.
fn card_scalar_fields(id: EntityId, record: &CardRecord) -> FieldMap {
    Card {
        id,
        collection: None,
        native: record.native.clone(),
        translation: record.translation.clone(),
        note: record.note.clone(),
        is_favorite: record.favorited,
        formality: record.formality,
    }
    .to_fields()
}

impl Engine {
    /// Rebuild graph entities from records inside `scope`. The caller commits or
    /// discards the scope.
    pub fn reconstruct(
        &mut self,
        scope: ScopeId,
        source: ReconstructSource<'_>,
    ) -> Result<ImportReport, EngineError> {
        match source {
            ReconstructSource::Restore(document) => self.restore_into(scope, document),
            ReconstructSource::Download(payload) => self.download_into(scope, payload),
        }
    }

    pub fn import_document(&mut self, document: &PortableDocument) -> Result<ImportReport, EngineError> {
        let _ticket = self.start_job(JobKind::Import)?;
        let (report, outcome) = self.in_background(|engine, scope| {
            engine.reconstruct(scope, ReconstructSource::Restore(document))
        })?;
        info!(?report, cursor = ?outcome.cursor, "imported document");
        Ok(report)
    }

    pub fn import_json(&mut self, json: &str) -> Result<ImportReport, EngineError> {
        let document = PortableDocument::from_json(json)?;
        self.import_document(&document)
    }

    /// Fetch a published collection and its cards, and add them as a new local collection.
    pub fn download_collection(
        &mut self,
        remote: &impl RemoteStore,
        remote_collection_id: &str,
    ) -> Result<ImportReport, EngineError> {
        let _ticket = self.start_job(JobKind::Import)?;
        let collection = remote
            .query(&RemoteQuery::Collection {
                id: remote_collection_id.to_string(),
            })?
            .into_iter()
            .find_map(|record| match record {
                RemoteRecord::Collection(collection) => Some(collection),
                _ => None,
            })
            .ok_or_else(|| RemoteError::NotFound(remote_collection_id.to_string()))?;
        let cards = remote
            .query(&RemoteQuery::CardsInCollection {
                collection_id: remote_collection_id.to_string(),
            })?
            .into_iter()
            .filter_map(|record| match record {
                RemoteRecord::Card(card) => Some(card),
                _ => None,
            })
            .collect();
        let payload = PublishPayload { collection, cards };

        let (report, _) = self.in_background(|engine, scope| {
            engine.reconstruct(scope, ReconstructSource::Download(&payload))
        })?;
        info!(remote = remote_collection_id, ?report, "downloaded collection");
        Ok(report)
    }

    /// Local id for a restored record: its own id when that is a UUID not taken by an
    /// entity of another kind, a fresh one otherwise.
    fn restored_id(
        &self,
        scope: ScopeId,
        record_id: &str,
        kind: EntityKind,
    ) -> Result<EntityId, EngineError> {
        if let Ok(id) = record_id.parse::<EntityId>() {
            match self.view(scope)?.kind_of(id)? {
                None => return Ok(id),
                Some(existing) if existing == kind => return Ok(id),
                Some(_) => {}
            }
        }
        Ok(EntityId::new())
    }

    /// Create the entity, or patch it in place when it already exists. Returns whether
    /// it was created.
    fn put_entity(
        &mut self,
        scope: ScopeId,
        id: EntityId,
        kind: EntityKind,
        values: FieldMap,
    ) -> Result<bool, EngineError> {
        let exists = self.view(scope)?.kind_of(id)?.is_some();
        let pending = &mut self.scopes.get_mut(scope)?.pending;
        if exists {
            for (key, value) in values {
                pending.set_field(id, kind, &key, value);
            }
        } else {
            pending.create(id, kind, values);
        }
        Ok(!exists)
    }

    /// Local tags by normalized name. Among same-named tags the smallest id wins.
    fn tags_by_name(&self, scope: ScopeId) -> Result<BTreeMap<String, EntityId>, EngineError> {
        let mut by_name = BTreeMap::new();
        for tag in self.list_tags(scope)? {
            by_name
                .entry(normalize_tag_name(&tag.name))
                .or_insert(tag.id);
        }
        Ok(by_name)
    }

    fn restore_into(
        &mut self,
        scope: ScopeId,
        document: &PortableDocument,
    ) -> Result<ImportReport, EngineError> {
        document.verify_checksum().map_err(|e| match e {
            CoreError::ChecksumMismatch { expected, actual } => {
                EngineError::ChecksumMismatch { expected, actual }
            }
            other => other.into(),
        })?;
        let mut report = ImportReport::default();

        // Pass 1: one local tag per distinct normalized name.
        let mut tag_map: BTreeMap<&str, EntityId> = BTreeMap::new();
        let mut batch_tags: BTreeMap<String, EntityId> = BTreeMap::new();
        for record in &document.tags {
            let name = normalize_tag_name(&record.name);
            if name.is_empty() {
                warn!(record = %record.id, "skipping tag with empty name");
                report.dropped_references += 1;
                continue;
            }
            if let Some(local) = batch_tags.get(&name) {
                tag_map.insert(&record.id, *local);
                report.tags_merged += 1;
                continue;
            }
            let id = self.restored_id(scope, &record.id, EntityKind::Tag)?;
            let tag = Tag {
                id,
                name: name.clone(),
            };
            if self.put_entity(scope, id, EntityKind::Tag, tag.to_fields())? {
                report.tags_created += 1;
            } else {
                report.tags_reused += 1;
            }
            batch_tags.insert(name, id);
            tag_map.insert(&record.id, id);
        }

        // Pass 2: local ids and scalar fields for collections and cards.
        let mut collection_map: BTreeMap<&str, EntityId> = BTreeMap::new();
        for record in &document.collections {
            let id = self.restored_id(scope, &record.id, EntityKind::Collection)?;
            let collection = Collection {
                id,
                name: record.name.clone(),
            };
            if self.put_entity(scope, id, EntityKind::Collection, collection.to_fields())? {
                report.collections_created += 1;
            } else {
                report.collections_updated += 1;
            }
            collection_map.insert(&record.id, id);
            report.collection_ids.push(id);
        }

        let mut card_map: BTreeMap<&str, EntityId> = BTreeMap::new();
        for record in &document.cards {
            let id = self.restored_id(scope, &record.id, EntityKind::Card)?;
            if self.put_entity(scope, id, EntityKind::Card, card_scalar_fields(id, record))? {
                report.cards_created += 1;
            } else {
                report.cards_updated += 1;
            }
            card_map.insert(&record.id, id);
        }

        // Pass 3: wire collections, tags and relationships.
        for record in &document.cards {
            let Some(&card) = card_map.get(record.id.as_str()) else {
                continue;
            };
            let collection = self.restored_collection(scope, &collection_map, record)?;
            self.set_field(scope, card, fields::COLLECTION, FieldValue::EntityRef(collection))?;

            let mut tags = Vec::with_capacity(record.tag_ids.len());
            for tag_id in &record.tag_ids {
                match tag_map.get(tag_id.as_str()) {
                    Some(tag) => tags.push(*tag),
                    None => {
                        warn!(card = %record.id, tag = %tag_id, "dropping unresolved tag reference");
                        report.dropped_references += 1;
                    }
                }
            }
            self.set_tags(scope, card, &tags)?;

            report.dropped_references += self.wire_relationships(scope, card, record, &card_map)?;
        }

        // Pass 4: fold batch tags into tags outside the batch that now carry the same
        // name. Covers new tags and restored tags renamed in place.
        let batch_ids: BTreeSet<EntityId> = batch_tags.values().copied().collect();
        let mut outside: BTreeMap<String, EntityId> = BTreeMap::new();
        for tag in self.list_tags(scope)? {
            if !batch_ids.contains(&tag.id) {
                outside.entry(normalize_tag_name(&tag.name)).or_insert(tag.id);
            }
        }
        for (name, id) in &batch_tags {
            if let Some(&existing) = outside.get(name) {
                debug!(imported = %id, %existing, %name, "folding imported tag into existing tag");
                self.fold_tag_into(scope, *id, existing)?;
                report.tags_merged += 1;
            }
        }

        Ok(report)
    }

    fn restored_collection(
        &self,
        scope: ScopeId,
        collection_map: &BTreeMap<&str, EntityId>,
        record: &CardRecord,
    ) -> Result<EntityId, EngineError> {
        if let Some(&id) = collection_map.get(record.collection_id.as_str()) {
            return Ok(id);
        }
        // A card may also point at a collection that already exists locally.
        if let Ok(id) = record.collection_id.parse::<EntityId>()
            && self.view(scope)?.kind_of(id)? == Some(EntityKind::Collection)
        {
            return Ok(id);
        }
        Err(EngineError::UnresolvedReference {
            record_id: record.id.clone(),
            field: COLLECTION_ID_FIELD,
            target: record.collection_id.clone(),
        })
    }

    /// Add the record's relationships that resolve inside the batch. Returns how many
    /// references were dropped.
    fn wire_relationships(
        &mut self,
        scope: ScopeId,
        card: EntityId,
        record: &CardRecord,
        card_map: &BTreeMap<&str, EntityId>,
    ) -> Result<usize, EngineError> {
        let mut dropped = 0;
        for target in &record.relationship_ids {
            match card_map.get(target.as_str()) {
                Some(&other) if other == card => {
                    debug!(card = %record.id, "skipping self relationship");
                }
                Some(&other) => self.relate_cards(scope, card, other)?,
                None => {
                    warn!(card = %record.id, %target, "dropping unresolved relationship");
                    dropped += 1;
                }
            }
        }
        Ok(dropped)
    }

    fn download_into(
        &mut self,
        scope: ScopeId,
        payload: &PublishPayload,
    ) -> Result<ImportReport, EngineError> {
        let mut report = ImportReport::default();

        // Pass 1: tags by name, reusing local tags regardless of case.
        let mut by_name = self.tags_by_name(scope)?;
        let mut seen = BTreeSet::new();
        for record in &payload.cards {
            for raw in &record.tag_names {
                let name = normalize_tag_name(raw);
                if name.is_empty() || !seen.insert(name.clone()) {
                    continue;
                }
                if by_name.contains_key(&name) {
                    report.tags_reused += 1;
                } else {
                    let id = self.create_tag(scope, &name)?;
                    by_name.insert(name, id);
                    report.tags_created += 1;
                }
            }
        }

        // Pass 2: a new local collection and fresh ids for every card.
        let collection = self.create_collection(scope, &payload.collection.name)?;
        report.collections_created = 1;
        report.collection_ids.push(collection);

        let mut card_map: BTreeMap<&str, EntityId> = BTreeMap::new();
        for record in &payload.cards {
            let id = EntityId::new();
            self.put_entity(scope, id, EntityKind::Card, card_scalar_fields(id, record))?;
            card_map.insert(&record.id, id);
            report.cards_created += 1;
        }

        // Pass 3: wiring.
        for record in &payload.cards {
            let Some(&card) = card_map.get(record.id.as_str()) else {
                continue;
            };
            if record.collection_id != payload.collection.id {
                return Err(EngineError::UnresolvedReference {
                    record_id: record.id.clone(),
                    field: COLLECTION_ID_FIELD,
                    target: record.collection_id.clone(),
                });
            }
            self.set_field(scope, card, fields::COLLECTION, FieldValue::EntityRef(collection))?;

            let tags: Vec<EntityId> = record
                .tag_names
                .iter()
                .filter_map(|raw| by_name.get(&normalize_tag_name(raw)).copied())
                .collect();
            self.set_tags(scope, card, &tags)?;

            report.dropped_references += self.wire_relationships(scope, card, record, &card_map)?;
        }

        Ok(report)
    }
}

//! Graph to record conversion for export files and remote publishing.

use std::collections::BTreeMap;

use tracing::info;
use uuid::Uuid;

use cardgraph_core::{
    Card, EntityId, EntityKind,
    records::{CardRecord, CollectionRecord, PortableDocument, PublishPayload, TagRecord},
};
use cardgraph_storage::Storage;

use crate::error::EngineError;
use crate::remote::{PublishReceipt, RemoteError, RemoteQuery, RemoteRecord, RemoteStore};
use crate::scope::ScopeView;
use crate::Engine;

/// Build the record for one card. `record_id` maps local ids to record ids; related
/// cards without a record id are left out.
fn card_record<S: Storage>(
    view: &ScopeView<'_, S>,
    card: &Card,
    id: String,
    collection_id: String,
    record_id: impl Fn(EntityId) -> Option<String>,
) -> Result<CardRecord, EngineError> {
    let mut tag_ids = Vec::new();
    let mut tag_names = Vec::new();
    for tag_id in view.tags_of_card(card.id)? {
        tag_ids.push(tag_id.to_string());
        tag_names.push(view.tag(tag_id)?.name);
    }
    let relationship_ids = view
        .related(card.id)?
        .into_iter()
        .filter_map(record_id)
        .collect();
    Ok(CardRecord {
        id,
        collection_id,
        native: card.native.clone(),
        translation: card.translation.clone(),
        formality: card.formality,
        favorited: card.is_favorite,
        note: card.note.clone(),
        tag_ids,
        tag_names,
        relationship_ids,
    })
}

/// Flatten the whole graph, keeping local ids as record ids.
pub fn export_records<S: Storage>(view: &ScopeView<'_, S>) -> Result<PortableDocument, EngineError> {
    let mut collections = Vec::new();
    for id in view.list(EntityKind::Collection)? {
        let collection = view.collection(id)?;
        collections.push(CollectionRecord {
            id: id.to_string(),
            name: collection.name,
        });
    }

    let mut tags = Vec::new();
    for id in view.list(EntityKind::Tag)? {
        tags.push(TagRecord {
            id: id.to_string(),
            name: view.tag(id)?.name,
        });
    }

    let mut cards = Vec::new();
    for id in view.list(EntityKind::Card)? {
        let card = view.card(id)?;
        let collection_id = card.collection.map(|c| c.to_string()).unwrap_or_default();
        cards.push(card_record(view, &card, id.to_string(), collection_id, |other| {
            Some(other.to_string())
        })?);
    }

    Ok(PortableDocument::new(collections, cards, tags))
}

/// Flatten one collection for publishing. Every record gets a freshly minted id, and
/// relationships only point at cards inside the batch.
pub fn publish_records<S: Storage>(
    view: &ScopeView<'_, S>,
    collection_id: EntityId,
) -> Result<PublishPayload, EngineError> {
    let collection = view.collection(collection_id)?;
    let card_ids = view.cards_in_collection(collection_id)?;

    // Mint every id before resolving any reference.
    let published_collection = Uuid::new_v4().to_string();
    let minted: BTreeMap<EntityId, String> = card_ids
        .iter()
        .map(|id| (*id, Uuid::new_v4().to_string()))
        .collect();

    let mut cards = Vec::with_capacity(card_ids.len());
    for (local, published) in &minted {
        let card = view.card(*local)?;
        cards.push(card_record(
            view,
            &card,
            published.clone(),
            published_collection.clone(),
            |other| minted.get(&other).cloned(),
        )?);
    }
    cards.sort_by(|a, b| a.id.cmp(&b.id));

    Ok(PublishPayload {
        collection: CollectionRecord {
            id: published_collection,
            name: collection.name,
        },
        cards,
    })
}

impl Engine {
    /// Export the committed graph. Pending drafts in any scope are left out.
    pub fn export_document(&self) -> Result<PortableDocument, EngineError> {
        let document = export_records(&self.durable_view())?;
        let document = if self.config().export_checksum {
            document.with_checksum()?
        } else {
            document
        };
        info!(
            collections = document.collections.len(),
            cards = document.cards.len(),
            tags = document.tags.len(),
            "exported document"
        );
        Ok(document)
    }

    pub fn export_json(&self) -> Result<String, EngineError> {
        Ok(self.export_document()?.to_json_pretty()?)
    }

    pub fn publish_payload(&self, collection: EntityId) -> Result<PublishPayload, EngineError> {
        publish_records(&self.durable_view(), collection)
    }

    /// Publish one collection with its cards in a single all-or-nothing save.
    pub fn publish_collection(
        &self,
        remote: &mut impl RemoteStore,
        collection: EntityId,
    ) -> Result<PublishReceipt, EngineError> {
        let owner = remote
            .query(&RemoteQuery::CurrentUser)?
            .into_iter()
            .find_map(|record| match record {
                RemoteRecord::User(user) => Some(user.id),
                _ => None,
            })
            .ok_or(RemoteError::NotAuthenticated)?;

        let payload = self.publish_payload(collection)?;
        let card_count = payload.cards.len();
        let collection_id = payload.collection.id.clone();
        let mut records = Vec::with_capacity(card_count + 1);
        records.push(RemoteRecord::Collection(payload.collection));
        records.extend(payload.cards.into_iter().map(RemoteRecord::Card));

        remote.save(records)?;
        info!(%collection, published = %collection_id, cards = card_count, "published collection");
        Ok(PublishReceipt {
            collection_id,
            owner,
            card_count,
        })
    }
}

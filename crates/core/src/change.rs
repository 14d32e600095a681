//! Pending changes staged in a transaction scope.
//!
//! A `ChangeSet` records field-level patches per entity plus membership edits
//! (relationship edges and card-tag links). Child scopes fold into their parent
//! with `absorb`; the durable store applies a fully merged set in one transaction.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::field_value::FieldValue;
use crate::ids::EntityId;
use crate::model::{EntityKind, FieldMap};

/// An undirected relationship between two distinct cards, stored once as a sorted pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelationEdge {
    low: EntityId,
    high: EntityId,
}

impl RelationEdge {
    pub fn new(a: EntityId, b: EntityId) -> Result<Self, CoreError> {
        if a == b {
            return Err(CoreError::SelfRelationship(a.to_string()));
        }
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        Ok(Self { low, high })
    }

    pub fn low(&self) -> EntityId {
        self.low
    }

    pub fn high(&self) -> EntityId {
        self.high
    }

    pub fn touches(&self, id: EntityId) -> bool {
        self.low == id || self.high == id
    }

    /// The endpoint opposite `id`, if `id` is an endpoint.
    pub fn other(&self, id: EntityId) -> Option<EntityId> {
        if self.low == id {
            Some(self.high)
        } else if self.high == id {
            Some(self.low)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Membership {
    Added,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityChange {
    /// A new entity. `fields` is its complete initial state.
    Created { kind: EntityKind, fields: FieldMap },
    /// A patch over the entity's current fields.
    Updated { kind: EntityKind, fields: FieldMap },
    Deleted { kind: EntityKind },
}

impl EntityChange {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Created { kind, .. } | Self::Updated { kind, .. } | Self::Deleted { kind } => {
                *kind
            }
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, Self::Deleted { .. })
    }

    /// Fold a newer change for the same entity on top of this one.
    fn then(self, newer: EntityChange) -> EntityChange {
        match (self, newer) {
            (Self::Created { kind, mut fields }, Self::Updated { fields: patch, .. }) => {
                fields.extend(patch);
                Self::Created { kind, fields }
            }
            (Self::Updated { kind, mut fields }, Self::Updated { fields: patch, .. }) => {
                fields.extend(patch);
                Self::Updated { kind, fields }
            }
            // A deletion is only shadowed by a re-creation, never by a patch.
            (Self::Deleted { kind }, Self::Updated { .. }) => Self::Deleted { kind },
            (_, newer) => newer,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    entities: BTreeMap<EntityId, EntityChange>,
    relations: BTreeMap<RelationEdge, Membership>,
    card_tags: BTreeMap<(EntityId, EntityId), Membership>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relations.is_empty() && self.card_tags.is_empty()
    }

    pub fn entities(&self) -> &BTreeMap<EntityId, EntityChange> {
        &self.entities
    }

    pub fn relations(&self) -> &BTreeMap<RelationEdge, Membership> {
        &self.relations
    }

    /// Card-tag membership edits keyed by `(card, tag)`.
    pub fn card_tags(&self) -> &BTreeMap<(EntityId, EntityId), Membership> {
        &self.card_tags
    }

    pub fn entity(&self, id: EntityId) -> Option<&EntityChange> {
        self.entities.get(&id)
    }

    pub fn create(&mut self, id: EntityId, kind: EntityKind, fields: FieldMap) {
        self.push_entity(id, EntityChange::Created { kind, fields });
    }

    pub fn set_field(&mut self, id: EntityId, kind: EntityKind, key: &str, value: FieldValue) {
        let mut fields = FieldMap::new();
        fields.insert(key.to_string(), value);
        self.push_entity(id, EntityChange::Updated { kind, fields });
    }

    pub fn delete(&mut self, id: EntityId, kind: EntityKind) {
        self.push_entity(id, EntityChange::Deleted { kind });
        self.drop_memberships_of(id);
    }

    pub fn set_relation(&mut self, edge: RelationEdge, membership: Membership) {
        self.relations.insert(edge, membership);
    }

    pub fn set_card_tag(&mut self, card: EntityId, tag: EntityId, membership: Membership) {
        self.card_tags.insert((card, tag), membership);
    }

    fn push_entity(&mut self, id: EntityId, change: EntityChange) {
        let merged = match self.entities.remove(&id) {
            Some(existing) => existing.then(change),
            None => change,
        };
        self.entities.insert(id, merged);
    }

    /// Forget membership edits that mention `id`.
    pub fn drop_memberships_of(&mut self, id: EntityId) {
        self.relations.retain(|edge, _| !edge.touches(id));
        self.card_tags.retain(|(card, tag), _| *card != id && *tag != id);
    }

    /// Fold a child scope's changes on top of this one. The child's edits win.
    pub fn absorb(&mut self, child: ChangeSet) {
        for (id, change) in child.entities {
            let deleted = change.is_deleted();
            self.push_entity(id, change);
            if deleted {
                self.drop_memberships_of(id);
            }
        }
        self.relations.extend(child.relations);
        self.card_tags.extend(child.card_tags);
    }

    /// Split off every change that mentions one of `ids`, returning them as a new set.
    pub fn extract(&mut self, ids: &BTreeSet<EntityId>) -> ChangeSet {
        let mut out = ChangeSet::new();
        for id in ids {
            if let Some(change) = self.entities.remove(id) {
                out.entities.insert(*id, change);
            }
        }
        let (moved, kept): (BTreeMap<_, _>, BTreeMap<_, _>) = std::mem::take(&mut self.relations)
            .into_iter()
            .partition(|(edge, _)| ids.contains(&edge.low) || ids.contains(&edge.high));
        self.relations = kept;
        out.relations = moved;
        let (moved, kept): (BTreeMap<_, _>, BTreeMap<_, _>) = std::mem::take(&mut self.card_tags)
            .into_iter()
            .partition(|((card, tag), _)| ids.contains(card) || ids.contains(tag));
        self.card_tags = kept;
        out.card_tags = moved;
        out
    }

    /// Every entity id this set mentions, including membership endpoints.
    pub fn touched_ids(&self) -> BTreeSet<EntityId> {
        let mut ids: BTreeSet<EntityId> = self.entities.keys().copied().collect();
        for edge in self.relations.keys() {
            ids.insert(edge.low);
            ids.insert(edge.high);
        }
        for (card, tag) in self.card_tags.keys() {
            ids.insert(*card);
            ids.insert(*tag);
        }
        ids
    }

    /// Mutable access to field patches, for normalization before a commit.
    pub fn field_patches_mut(&mut self) -> impl Iterator<Item = (EntityKind, &mut FieldMap)> {
        self.entities.values_mut().filter_map(|change| match change {
            EntityChange::Created { kind, fields } | EntityChange::Updated { kind, fields } => {
                Some((*kind, fields))
            }
            EntityChange::Deleted { .. } => None,
        })
    }
}

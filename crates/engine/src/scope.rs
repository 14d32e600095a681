use std::collections::{BTreeMap, BTreeSet};

use cardgraph_core::{
    Card, ChangeCursor, ChangeSet, Collection, Entity, EntityChange, EntityId, EntityKind,
    FieldMap, Membership, ScopeId, Tag,
};
use cardgraph_storage::Storage;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// Read scope for the UI. Follows durable changes made anywhere.
    View,
    /// Interactive edits.
    Edit,
    /// Jobs such as import or tag normalization.
    Background,
}

impl ScopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Edit => "edit",
            Self::Background => "background",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Scope {
    pub id: ScopeId,
    pub kind: ScopeKind,
    /// `None` means the scope sits directly on the durable root.
    pub parent: Option<ScopeId>,
    pub pending: ChangeSet,
    /// Newest durable change this scope has merged, for view scopes.
    pub merged_through: Option<ChangeCursor>,
}

/// All live scopes of an engine, keyed by id.
#[derive(Debug, Default)]
pub struct ScopeArena {
    scopes: BTreeMap<ScopeId, Scope>,
}

impl ScopeArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        kind: ScopeKind,
        parent: Option<ScopeId>,
    ) -> Result<ScopeId, EngineError> {
        if let Some(parent) = parent {
            self.get(parent)?;
        }
        let id = ScopeId::new();
        self.scopes.insert(
            id,
            Scope {
                id,
                kind,
                parent,
                pending: ChangeSet::new(),
                merged_through: None,
            },
        );
        Ok(id)
    }

    pub fn get(&self, id: ScopeId) -> Result<&Scope, EngineError> {
        self.scopes
            .get(&id)
            .ok_or_else(|| EngineError::ScopeNotFound(id.to_string()))
    }

    pub fn get_mut(&mut self, id: ScopeId) -> Result<&mut Scope, EngineError> {
        self.scopes
            .get_mut(&id)
            .ok_or_else(|| EngineError::ScopeNotFound(id.to_string()))
    }

    pub fn contains(&self, id: ScopeId) -> bool {
        self.scopes.contains_key(&id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Scope> {
        self.scopes.values_mut()
    }

    /// Ids from the root-most ancestor down to `id` itself.
    pub fn chain(&self, id: ScopeId) -> Result<Vec<ScopeId>, EngineError> {
        let mut chain = Vec::new();
        let mut current = Some(id);
        while let Some(scope_id) = current {
            let scope = self.get(scope_id)?;
            chain.push(scope_id);
            current = scope.parent;
        }
        chain.reverse();
        Ok(chain)
    }

    /// Pending change sets along the chain of `id`, root-most first.
    pub fn layers(&self, id: ScopeId) -> Result<Vec<&ChangeSet>, EngineError> {
        self.chain(id)?
            .into_iter()
            .map(|scope_id| self.get(scope_id).map(|s| &s.pending))
            .collect()
    }

    /// Every scope below `id`, not including `id`.
    pub fn descendants(&self, id: ScopeId) -> BTreeSet<ScopeId> {
        let mut found = BTreeSet::new();
        let mut frontier = vec![id];
        while let Some(parent) = frontier.pop() {
            for scope in self.scopes.values() {
                if scope.parent == Some(parent) && found.insert(scope.id) {
                    frontier.push(scope.id);
                }
            }
        }
        found
    }

    pub fn remove(&mut self, id: ScopeId) -> Option<Scope> {
        self.scopes.remove(&id)
    }
}

/// A read-only projection of the graph as seen from one scope: durable state with the
/// scope chain's pending changes folded on top, innermost last.
pub struct ScopeView<'a, S: Storage> {
    storage: &'a S,
    layers: Vec<&'a ChangeSet>,
}

impl<'a, S: Storage> ScopeView<'a, S> {
    pub fn new(storage: &'a S, layers: Vec<&'a ChangeSet>) -> Self {
        Self { storage, layers }
    }

    /// The kind of a live entity, or `None` if it does not exist in this scope.
    pub fn kind_of(&self, id: EntityId) -> Result<Option<EntityKind>, EngineError> {
        for layer in self.layers.iter().rev() {
            match layer.entity(id) {
                Some(EntityChange::Created { kind, .. }) => return Ok(Some(*kind)),
                Some(EntityChange::Deleted { .. }) => return Ok(None),
                Some(EntityChange::Updated { .. }) | None => {}
            }
        }
        Ok(self.storage.get_entity(id)?.map(|record| record.kind))
    }

    pub fn fields(&self, id: EntityId) -> Result<Option<(EntityKind, FieldMap)>, EngineError> {
        let mut state = match self.storage.get_entity(id)? {
            Some(record) => Some((record.kind, self.storage.get_fields(id)?)),
            None => None,
        };
        for layer in &self.layers {
            match layer.entity(id) {
                Some(EntityChange::Created { kind, fields }) => {
                    state = Some((*kind, fields.clone()));
                }
                Some(EntityChange::Updated { fields, .. }) => {
                    if let Some((_, current)) = state.as_mut() {
                        current.extend(fields.clone());
                    }
                }
                Some(EntityChange::Deleted { .. }) => state = None,
                None => {}
            }
        }
        Ok(state.map(|(kind, mut fields)| {
            fields.retain(|_, value| !value.is_null());
            (kind, fields)
        }))
    }

    pub fn resolve(&self, id: EntityId) -> Result<Option<Entity>, EngineError> {
        Ok(self
            .fields(id)?
            .map(|(kind, fields)| Entity::from_fields(kind, id, &fields)))
    }

    pub fn require_kind(&self, id: EntityId, expected: EntityKind) -> Result<(), EngineError> {
        match self.kind_of(id)? {
            None => Err(EngineError::EntityNotFound(id.to_string())),
            Some(actual) if actual != expected => Err(EngineError::WrongKind {
                id: id.to_string(),
                expected,
                actual,
            }),
            Some(_) => Ok(()),
        }
    }

    fn resolve_as(&self, id: EntityId, expected: EntityKind) -> Result<Entity, EngineError> {
        self.require_kind(id, expected)?;
        self.resolve(id)?
            .ok_or_else(|| EngineError::EntityNotFound(id.to_string()))
    }

    pub fn collection(&self, id: EntityId) -> Result<Collection, EngineError> {
        match self.resolve_as(id, EntityKind::Collection)? {
            Entity::Collection(collection) => Ok(collection),
            other => Err(wrong_kind(id, EntityKind::Collection, other.kind())),
        }
    }

    pub fn card(&self, id: EntityId) -> Result<Card, EngineError> {
        match self.resolve_as(id, EntityKind::Card)? {
            Entity::Card(card) => Ok(card),
            other => Err(wrong_kind(id, EntityKind::Card, other.kind())),
        }
    }

    pub fn tag(&self, id: EntityId) -> Result<Tag, EngineError> {
        match self.resolve_as(id, EntityKind::Tag)? {
            Entity::Tag(tag) => Ok(tag),
            other => Err(wrong_kind(id, EntityKind::Tag, other.kind())),
        }
    }

    /// Live entities of `kind`, ordered by id.
    pub fn list(&self, kind: EntityKind) -> Result<Vec<EntityId>, EngineError> {
        let mut candidates: BTreeSet<EntityId> =
            self.storage.list_entities(kind)?.into_iter().collect();
        for layer in &self.layers {
            for (id, change) in layer.entities() {
                if change.kind() == kind {
                    candidates.insert(*id);
                }
            }
        }
        let mut live = Vec::with_capacity(candidates.len());
        for id in candidates {
            if self.kind_of(id)? == Some(kind) {
                live.push(id);
            }
        }
        Ok(live)
    }

    pub fn cards_in_collection(&self, collection: EntityId) -> Result<Vec<EntityId>, EngineError> {
        let mut cards = Vec::new();
        for id in self.list(EntityKind::Card)? {
            if self.card(id)?.collection == Some(collection) {
                cards.push(id);
            }
        }
        Ok(cards)
    }

    /// Cards related to `card`. Symmetric by construction.
    pub fn related(&self, card: EntityId) -> Result<BTreeSet<EntityId>, EngineError> {
        if self.kind_of(card)? != Some(EntityKind::Card) {
            return Ok(BTreeSet::new());
        }
        let mut related = self.storage.get_related(card)?;
        for layer in &self.layers {
            for (edge, membership) in layer.relations() {
                if let Some(other) = edge.other(card) {
                    apply_membership(&mut related, other, *membership);
                }
            }
        }
        self.retain_live(related, EntityKind::Card)
    }

    pub fn tags_of_card(&self, card: EntityId) -> Result<BTreeSet<EntityId>, EngineError> {
        if self.kind_of(card)? != Some(EntityKind::Card) {
            return Ok(BTreeSet::new());
        }
        let mut tags = self.storage.get_tags_of_card(card)?;
        for layer in &self.layers {
            for ((member, tag), membership) in layer.card_tags() {
                if *member == card {
                    apply_membership(&mut tags, *tag, *membership);
                }
            }
        }
        self.retain_live(tags, EntityKind::Tag)
    }

    pub fn cards_with_tag(&self, tag: EntityId) -> Result<BTreeSet<EntityId>, EngineError> {
        if self.kind_of(tag)? != Some(EntityKind::Tag) {
            return Ok(BTreeSet::new());
        }
        let mut cards = self.storage.get_cards_with_tag(tag)?;
        for layer in &self.layers {
            for ((card, member), membership) in layer.card_tags() {
                if *member == tag {
                    apply_membership(&mut cards, *card, *membership);
                }
            }
        }
        self.retain_live(cards, EntityKind::Card)
    }

    fn retain_live(
        &self,
        ids: BTreeSet<EntityId>,
        kind: EntityKind,
    ) -> Result<BTreeSet<EntityId>, EngineError> {
        let mut live = BTreeSet::new();
        for id in ids {
            if self.kind_of(id)? == Some(kind) {
                live.insert(id);
            }
        }
        Ok(live)
    }
}

fn apply_membership(set: &mut BTreeSet<EntityId>, id: EntityId, membership: Membership) {
    match membership {
        Membership::Added => {
            set.insert(id);
        }
        Membership::Removed => {
            set.remove(&id);
        }
    }
}

fn wrong_kind(id: EntityId, expected: EntityKind, actual: EntityKind) -> EngineError {
    EngineError::WrongKind {
        id: id.to_string(),
        expected,
        actual,
    }
}

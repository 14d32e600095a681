pub mod config;
pub mod error;
pub mod flatten;
pub mod history;
pub mod intent;
pub mod jobs;
pub mod reconstruct;
pub mod remote;
pub mod scope;
pub mod tags;

pub use config::EngineConfig;
pub use error::EngineError;
pub use history::HistoryTracker;
pub use intent::{Intent, IntentOperation};
pub use jobs::{JobGuard, JobKind, JobTicket};
pub use reconstruct::{ImportReport, ReconstructSource};
pub use remote::{
    PublishReceipt, RemoteError, RemoteQuery, RemoteRecord, RemoteStore, SavedRecords, UserRecord,
};
pub use scope::{Scope, ScopeArena, ScopeKind, ScopeView};
pub use tags::TagNormalizationReport;

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use cardgraph_core::{
    Card, ChangeCursor, ChangeNotification, ChangeSet, Collection, CoreError, Entity, EntityId,
    EntityKind, FieldValue, Formality, Membership, RelationEdge, ScopeId, Tag, ValidationFailure,
    model::{fields, normalize_fields},
};
use cardgraph_storage::{HistoryOp, SqliteStorage, Storage};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CommitPolicy {
    /// Any invalid entity rejects the whole commit.
    #[default]
    AllOrNothing,
    /// Valid entities commit. Invalid ones, and memberships touching them, stay pending
    /// in the committed scope.
    RejectInvalid,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Cursor of the durable write, `None` when nothing was written.
    pub cursor: Option<ChangeCursor>,
    pub rejected: Vec<ValidationFailure>,
}

impl CommitOutcome {
    pub fn is_noop(&self) -> bool {
        self.cursor.is_none()
    }
}

/// Sent to subscribers after durable state changed, by this engine or another writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentChanged {
    pub cursor: ChangeCursor,
    pub author: String,
    pub changed: BTreeSet<EntityId>,
    pub deleted: BTreeSet<EntityId>,
    pub external: bool,
}

pub struct Engine {
    config: EngineConfig,
    storage: SqliteStorage,
    scopes: ScopeArena,
    view_scope: ScopeId,
    history: HistoryTracker,
    jobs: JobGuard,
    subscribers: Vec<Sender<ContentChanged>>,
}

impl Engine {
    pub fn new(storage: SqliteStorage, config: EngineConfig) -> Result<Self, EngineError> {
        let mut scopes = ScopeArena::new();
        let view_scope = scopes.insert(ScopeKind::View, None)?;
        let history = HistoryTracker::new(&config.author, config.prune_interval_days);
        Ok(Self {
            config,
            storage,
            scopes,
            view_scope,
            history,
            jobs: JobGuard::new(),
            subscribers: Vec::new(),
        })
    }

    pub fn open(path: impl AsRef<Path>, config: EngineConfig) -> Result<Self, EngineError> {
        Self::new(SqliteStorage::open(path)?, config)
    }

    pub fn open_in_memory(config: EngineConfig) -> Result<Self, EngineError> {
        Self::new(SqliteStorage::open_in_memory()?, config)
    }

    /// Share single-flight job state with other engines or threads.
    pub fn with_job_guard(mut self, jobs: JobGuard) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    pub fn job_guard(&self) -> &JobGuard {
        &self.jobs
    }

    /// The auto-merging read scope created at open.
    pub fn view_scope(&self) -> ScopeId {
        self.view_scope
    }

    pub fn subscribe(&mut self) -> Receiver<ContentChanged> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    fn emit(&mut self, event: ContentChanged) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn start_job(&self, kind: JobKind) -> Result<JobTicket, EngineError> {
        self.jobs.try_start(kind).ok_or_else(|| {
            warn!(job = %kind, "job rejected, another one is running");
            EngineError::ConcurrentJobRejected(kind)
        })
    }

    // ========================================================================
    // Scopes
    // ========================================================================

    /// Create a scope on top of `parent`, or directly on the durable root for `None`.
    pub fn new_child_scope(
        &mut self,
        parent: Option<ScopeId>,
        kind: ScopeKind,
    ) -> Result<ScopeId, EngineError> {
        let id = self.scopes.insert(kind, parent)?;
        debug!(scope = %id, kind = kind.as_str(), "opened scope");
        Ok(id)
    }

    pub fn scope(&self, scope: ScopeId) -> Result<&Scope, EngineError> {
        self.scopes.get(scope)
    }

    pub fn view(&self, scope: ScopeId) -> Result<ScopeView<'_, SqliteStorage>, EngineError> {
        Ok(ScopeView::new(&self.storage, self.scopes.layers(scope)?))
    }

    /// Committed state only, without any scope's pending changes.
    pub fn durable_view(&self) -> ScopeView<'_, SqliteStorage> {
        ScopeView::new(&self.storage, Vec::new())
    }

    pub fn has_pending(&self, scope: ScopeId) -> Result<bool, EngineError> {
        Ok(!self.scopes.get(scope)?.pending.is_empty())
    }

    /// Drop the uncommitted changes of `scope` only. Ancestors and children keep theirs.
    pub fn discard(&mut self, scope: ScopeId) -> Result<(), EngineError> {
        self.scopes.get_mut(scope)?.pending = ChangeSet::new();
        Ok(())
    }

    /// Remove `scope` and everything below it. The view scope is never removed; closing
    /// it discards its changes and closes its children.
    pub fn close_scope(&mut self, scope: ScopeId) -> Result<(), EngineError> {
        self.scopes.get(scope)?;
        for child in self.scopes.descendants(scope) {
            self.scopes.remove(child);
        }
        if scope == self.view_scope {
            self.discard(scope)?;
        } else {
            self.scopes.remove(scope);
        }
        Ok(())
    }

    /// Run `job` in a fresh background scope, committing on success. The scope is closed
    /// afterwards either way.
    pub(crate) fn in_background<T>(
        &mut self,
        job: impl FnOnce(&mut Self, ScopeId) -> Result<T, EngineError>,
    ) -> Result<(T, CommitOutcome), EngineError> {
        let scope = self.new_child_scope(None, ScopeKind::Background)?;
        let result = job(self, scope).and_then(|value| {
            let outcome = self.commit(scope)?;
            Ok((value, outcome))
        });
        self.close_scope(scope)?;
        result
    }

    // ========================================================================
    // Commit
    // ========================================================================

    pub fn commit(&mut self, scope: ScopeId) -> Result<CommitOutcome, EngineError> {
        self.commit_with(scope, CommitPolicy::default())
    }

    /// Write the pending changes of `scope` and of all its ancestors to the durable root
    /// in one transaction. On error every scope keeps its pending changes.
    pub fn commit_with(
        &mut self,
        scope: ScopeId,
        policy: CommitPolicy,
    ) -> Result<CommitOutcome, EngineError> {
        let chain = self.scopes.chain(scope)?;
        let mut merged = ChangeSet::new();
        for id in &chain {
            merged.absorb(self.scopes.get(*id)?.pending.clone());
        }
        if merged.is_empty() {
            debug!(%scope, "nothing to commit");
            return Ok(CommitOutcome::default());
        }

        self.cascade_collection_deletes(&mut merged)?;
        for (kind, patch) in merged.field_patches_mut() {
            normalize_fields(kind, patch);
        }
        self.drop_dangling_memberships(&mut merged)?;

        let mut rejected = ChangeSet::new();
        let mut rejected_failures = Vec::new();
        loop {
            let failures = self.validate(&merged)?;
            if failures.is_empty() {
                break;
            }
            match policy {
                CommitPolicy::AllOrNothing => {
                    warn!(%scope, failures = failures.len(), "commit rejected by validation");
                    return Err(EngineError::Validation(failures));
                }
                CommitPolicy::RejectInvalid => {
                    // Removing an entity can invalidate its dependents, so re-check.
                    let invalid: BTreeSet<EntityId> =
                        failures.iter().map(|f| f.entity_id).collect();
                    rejected.absorb(merged.extract(&invalid));
                    rejected_failures.extend(failures);
                }
            }
        }

        let entry = if merged.is_empty() {
            None
        } else {
            let entry = self
                .storage
                .apply_changes(&merged, &self.config.author)
                .map_err(|e| {
                    warn!(%scope, error = %e, "durable write failed");
                    EngineError::CommitFailure(e)
                })?;
            Some(entry)
        };

        for id in &chain {
            self.scopes.get_mut(*id)?.pending = ChangeSet::new();
        }
        self.scopes.get_mut(scope)?.pending = rejected;

        let Some(entry) = entry else {
            return Ok(CommitOutcome {
                cursor: None,
                rejected: rejected_failures,
            });
        };
        info!(
            %scope,
            author = %entry.author,
            cursor = ?entry.cursor,
            changes = entry.changes.len(),
            rejected = rejected_failures.len(),
            "committed"
        );

        let (changed, deleted) = self.absorb_history(&entry.cursor)?;
        self.emit(ContentChanged {
            cursor: entry.cursor.clone(),
            author: entry.author,
            changed,
            deleted,
            external: false,
        });
        Ok(CommitOutcome {
            cursor: Some(entry.cursor),
            rejected: rejected_failures,
        })
    }

    /// Deleting a collection deletes every card still in it, including cards added
    /// since the delete was staged.
    fn cascade_collection_deletes(&self, merged: &mut ChangeSet) -> Result<(), EngineError> {
        let collections: Vec<EntityId> = merged
            .entities()
            .iter()
            .filter(|(_, change)| change.is_deleted() && change.kind() == EntityKind::Collection)
            .map(|(id, _)| *id)
            .collect();
        if collections.is_empty() {
            return Ok(());
        }
        let mut orphans = Vec::new();
        {
            let view = ScopeView::new(&self.storage, vec![&*merged]);
            for card in view.list(EntityKind::Card)? {
                if let Some(collection) = view.card(card)?.collection
                    && collections.contains(&collection)
                {
                    orphans.push(card);
                }
            }
        }
        for card in orphans {
            merged.delete(card, EntityKind::Card);
        }
        Ok(())
    }

    /// Forget membership edits whose endpoints no longer exist.
    fn drop_dangling_memberships(&self, merged: &mut ChangeSet) -> Result<(), EngineError> {
        let mut dangling = BTreeSet::new();
        {
            let view = ScopeView::new(&self.storage, vec![&*merged]);
            for edge in merged.relations().keys() {
                for id in [edge.low(), edge.high()] {
                    if view.kind_of(id)? != Some(EntityKind::Card) {
                        dangling.insert(id);
                    }
                }
            }
            for (card, tag) in merged.card_tags().keys() {
                if view.kind_of(*card)? != Some(EntityKind::Card) {
                    dangling.insert(*card);
                }
                if view.kind_of(*tag)? != Some(EntityKind::Tag) {
                    dangling.insert(*tag);
                }
            }
        }
        for id in dangling {
            debug!(entity = %id, "dropping memberships of missing entity");
            merged.drop_memberships_of(id);
        }
        Ok(())
    }

    fn validate(&self, merged: &ChangeSet) -> Result<Vec<ValidationFailure>, EngineError> {
        let view = ScopeView::new(&self.storage, vec![merged]);
        let mut failures = Vec::new();
        for (id, change) in merged.entities() {
            if change.is_deleted() {
                continue;
            }
            match view.resolve(*id)? {
                Some(Entity::Collection(collection)) => failures.extend(collection.validate()),
                Some(Entity::Tag(tag)) => failures.extend(tag.validate()),
                Some(Entity::Card(card)) => {
                    let collection_exists = match card.collection {
                        Some(collection) => {
                            view.kind_of(collection)? == Some(EntityKind::Collection)
                        }
                        None => false,
                    };
                    failures.extend(card.validate(collection_exists));
                }
                // A patch whose entity was deleted since it was staged.
                None => failures.push(ValidationFailure {
                    entity_id: *id,
                    kind: change.kind(),
                    field: "id",
                    reason: "entity no longer exists".into(),
                }),
            }
        }
        Ok(failures)
    }

    // ========================================================================
    // Change History
    // ========================================================================

    pub fn last_cursor(&self) -> Result<Option<ChangeCursor>, EngineError> {
        Ok(self.history.last_cursor(&self.storage)?)
    }

    pub fn record_cursor(&mut self, cursor: &ChangeCursor) -> Result<bool, EngineError> {
        Ok(self.history.record_cursor(&mut self.storage, cursor)?)
    }

    /// Throttled history prune. Returns `None` when skipped.
    pub fn prune_history_before(
        &mut self,
        cursor: &ChangeCursor,
    ) -> Result<Option<u64>, EngineError> {
        self.prune_history_at(cursor, Utc::now())
    }

    pub fn prune_history_at(
        &mut self,
        cursor: &ChangeCursor,
        now: DateTime<Utc>,
    ) -> Result<Option<u64>, EngineError> {
        Ok(self
            .history
            .prune_history_before(&mut self.storage, cursor, now)?)
    }

    /// The signal another engine on the same store should receive for the newest commit.
    pub fn change_notification(&self) -> Result<Option<ChangeNotification>, EngineError> {
        match self.storage.current_cursor()? {
            Some(cursor) => Ok(Some(ChangeNotification::for_cursor(
                &cursor,
                &self.config.author,
            )?)),
            None => Ok(None),
        }
    }

    /// React to a store change signal: merge the new history into view scopes, record
    /// the cursor and prune old history. Signals already seen are ignored.
    pub fn handle_change_notification(
        &mut self,
        notification: &ChangeNotification,
    ) -> Result<Option<ContentChanged>, EngineError> {
        let Some(cursor) = HistoryTracker::cursor_from_notification(notification) else {
            debug!("change notification without a readable cursor");
            return Ok(None);
        };
        if let Some(last) = self.last_cursor()?
            && !cursor.is_newer_than(&last)
        {
            debug!(?cursor, "change notification already processed");
            return Ok(None);
        }

        let (changed, deleted) = self.absorb_history(&cursor)?;
        let event = ContentChanged {
            cursor: cursor.clone(),
            author: notification.author().unwrap_or_default(),
            changed,
            deleted,
            external: true,
        };
        self.emit(event.clone());
        self.prune_history_before(&cursor)?;
        Ok(Some(event))
    }

    /// Fold history newer than the last recorded cursor, up to `through`, into the view
    /// scopes and record `through`. Returns the changed and deleted entity ids.
    fn absorb_history(
        &mut self,
        through: &ChangeCursor,
    ) -> Result<(BTreeSet<EntityId>, BTreeSet<EntityId>), EngineError> {
        let last = self.last_cursor()?;
        let entries = self.storage.history_after(last.as_ref())?;
        let mut changed = BTreeSet::new();
        let mut deleted = BTreeSet::new();
        for entry in entries.iter().filter(|e| &e.cursor <= through) {
            for change in &entry.changes {
                changed.insert(change.entity_id);
                match change.op {
                    HistoryOp::Deleted => {
                        deleted.insert(change.entity_id);
                    }
                    HistoryOp::Inserted => {
                        deleted.remove(&change.entity_id);
                    }
                    HistoryOp::Updated => {}
                }
            }
        }

        for scope in self.scopes.iter_mut().filter(|s| s.kind == ScopeKind::View) {
            // Pending edits of durably deleted entities can never commit.
            let stale = scope.pending.extract(&deleted);
            if !stale.is_empty() {
                debug!(scope = %scope.id, "dropped pending edits of deleted entities");
            }
            scope.merged_through = Some(through.clone());
        }
        self.history.record_cursor(&mut self.storage, through)?;
        Ok((changed, deleted))
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn resolve(&self, scope: ScopeId, entity: EntityId) -> Result<Option<Entity>, EngineError> {
        self.view(scope)?.resolve(entity)
    }

    pub fn collection(&self, scope: ScopeId, id: EntityId) -> Result<Collection, EngineError> {
        self.view(scope)?.collection(id)
    }

    pub fn card(&self, scope: ScopeId, id: EntityId) -> Result<Card, EngineError> {
        self.view(scope)?.card(id)
    }

    pub fn tag(&self, scope: ScopeId, id: EntityId) -> Result<Tag, EngineError> {
        self.view(scope)?.tag(id)
    }

    pub fn list_collections(&self, scope: ScopeId) -> Result<Vec<Collection>, EngineError> {
        let view = self.view(scope)?;
        view.list(EntityKind::Collection)?
            .into_iter()
            .map(|id| view.collection(id))
            .collect()
    }

    pub fn list_cards(&self, scope: ScopeId) -> Result<Vec<Card>, EngineError> {
        let view = self.view(scope)?;
        view.list(EntityKind::Card)?
            .into_iter()
            .map(|id| view.card(id))
            .collect()
    }

    pub fn list_tags(&self, scope: ScopeId) -> Result<Vec<Tag>, EngineError> {
        let view = self.view(scope)?;
        view.list(EntityKind::Tag)?
            .into_iter()
            .map(|id| view.tag(id))
            .collect()
    }

    pub fn cards_in_collection(
        &self,
        scope: ScopeId,
        collection: EntityId,
    ) -> Result<Vec<EntityId>, EngineError> {
        let view = self.view(scope)?;
        view.require_kind(collection, EntityKind::Collection)?;
        view.cards_in_collection(collection)
    }

    pub fn related_cards(
        &self,
        scope: ScopeId,
        card: EntityId,
    ) -> Result<BTreeSet<EntityId>, EngineError> {
        self.view(scope)?.related(card)
    }

    pub fn tags_of_card(
        &self,
        scope: ScopeId,
        card: EntityId,
    ) -> Result<BTreeSet<EntityId>, EngineError> {
        self.view(scope)?.tags_of_card(card)
    }

    pub fn cards_with_tag(
        &self,
        scope: ScopeId,
        tag: EntityId,
    ) -> Result<BTreeSet<EntityId>, EngineError> {
        self.view(scope)?.cards_with_tag(tag)
    }

    // ========================================================================
    // Edits
    // ========================================================================

    fn pending_mut(&mut self, scope: ScopeId) -> Result<&mut ChangeSet, EngineError> {
        Ok(&mut self.scopes.get_mut(scope)?.pending)
    }

    pub fn create_collection(&mut self, scope: ScopeId, name: &str) -> Result<EntityId, EngineError> {
        let collection = Collection {
            id: EntityId::new(),
            name: name.to_string(),
        };
        self.pending_mut(scope)?
            .create(collection.id, EntityKind::Collection, collection.to_fields());
        Ok(collection.id)
    }

    pub fn create_card(
        &mut self,
        scope: ScopeId,
        collection: EntityId,
        native: &str,
        translation: &str,
    ) -> Result<EntityId, EngineError> {
        self.view(scope)?
            .require_kind(collection, EntityKind::Collection)?;
        let card = Card {
            id: EntityId::new(),
            collection: Some(collection),
            native: native.to_string(),
            translation: translation.to_string(),
            note: String::new(),
            is_favorite: false,
            formality: Formality::default(),
        };
        self.pending_mut(scope)?
            .create(card.id, EntityKind::Card, card.to_fields());
        Ok(card.id)
    }

    pub fn create_tag(&mut self, scope: ScopeId, name: &str) -> Result<EntityId, EngineError> {
        let tag = Tag {
            id: EntityId::new(),
            name: name.to_string(),
        };
        self.pending_mut(scope)?
            .create(tag.id, EntityKind::Tag, tag.to_fields());
        Ok(tag.id)
    }

    /// Set one field. `tags` and `relationships` replace the card's whole set.
    pub fn set_field(
        &mut self,
        scope: ScopeId,
        entity: EntityId,
        key: &str,
        value: FieldValue,
    ) -> Result<(), EngineError> {
        let kind = self
            .view(scope)?
            .kind_of(entity)?
            .ok_or_else(|| EngineError::EntityNotFound(entity.to_string()))?;
        match key {
            fields::TAGS | fields::RELATIONSHIPS => {
                let targets = value
                    .as_entity_refs()
                    .ok_or_else(|| {
                        CoreError::InvalidData(format!("{key} expects a list of entity refs"))
                    })?
                    .to_vec();
                if key == fields::TAGS {
                    self.set_tags(scope, entity, &targets)
                } else {
                    self.set_relationships(scope, entity, &targets)
                }
            }
            _ => {
                self.pending_mut(scope)?.set_field(entity, kind, key, value);
                Ok(())
            }
        }
    }

    /// Delete an entity. A collection takes its cards with it; tags are never deleted
    /// implicitly.
    pub fn delete_entity(&mut self, scope: ScopeId, entity: EntityId) -> Result<(), EngineError> {
        let (kind, cascade) = {
            let view = self.view(scope)?;
            let kind = view
                .kind_of(entity)?
                .ok_or_else(|| EngineError::EntityNotFound(entity.to_string()))?;
            let cascade = match kind {
                EntityKind::Collection => view.cards_in_collection(entity)?,
                _ => Vec::new(),
            };
            (kind, cascade)
        };
        let pending = self.pending_mut(scope)?;
        for card in cascade {
            pending.delete(card, EntityKind::Card);
        }
        pending.delete(entity, kind);
        Ok(())
    }

    pub fn relate_cards(&mut self, scope: ScopeId, a: EntityId, b: EntityId) -> Result<(), EngineError> {
        self.set_relation(scope, a, b, Membership::Added)
    }

    pub fn unrelate_cards(&mut self, scope: ScopeId, a: EntityId, b: EntityId) -> Result<(), EngineError> {
        self.set_relation(scope, a, b, Membership::Removed)
    }

    fn set_relation(
        &mut self,
        scope: ScopeId,
        a: EntityId,
        b: EntityId,
        membership: Membership,
    ) -> Result<(), EngineError> {
        let edge = RelationEdge::new(a, b)?;
        {
            let view = self.view(scope)?;
            view.require_kind(a, EntityKind::Card)?;
            view.require_kind(b, EntityKind::Card)?;
        }
        self.pending_mut(scope)?.set_relation(edge, membership);
        Ok(())
    }

    /// Replace the relationship set of `card`. Self references are skipped.
    pub fn set_relationships(
        &mut self,
        scope: ScopeId,
        card: EntityId,
        targets: &[EntityId],
    ) -> Result<(), EngineError> {
        let (current, wanted) = {
            let view = self.view(scope)?;
            view.require_kind(card, EntityKind::Card)?;
            let mut wanted = BTreeSet::new();
            for target in targets {
                if *target == card {
                    debug!(%card, "skipping self relationship");
                    continue;
                }
                view.require_kind(*target, EntityKind::Card)?;
                wanted.insert(*target);
            }
            (view.related(card)?, wanted)
        };
        let pending = self.pending_mut(scope)?;
        for other in current.difference(&wanted) {
            pending.set_relation(RelationEdge::new(card, *other)?, Membership::Removed);
        }
        for other in wanted.difference(&current) {
            pending.set_relation(RelationEdge::new(card, *other)?, Membership::Added);
        }
        Ok(())
    }

    pub fn attach_tag(&mut self, scope: ScopeId, card: EntityId, tag: EntityId) -> Result<(), EngineError> {
        self.set_card_tag(scope, card, tag, Membership::Added)
    }

    pub fn detach_tag(&mut self, scope: ScopeId, card: EntityId, tag: EntityId) -> Result<(), EngineError> {
        self.set_card_tag(scope, card, tag, Membership::Removed)
    }

    fn set_card_tag(
        &mut self,
        scope: ScopeId,
        card: EntityId,
        tag: EntityId,
        membership: Membership,
    ) -> Result<(), EngineError> {
        {
            let view = self.view(scope)?;
            view.require_kind(card, EntityKind::Card)?;
            view.require_kind(tag, EntityKind::Tag)?;
        }
        self.pending_mut(scope)?.set_card_tag(card, tag, membership);
        Ok(())
    }

    /// Replace the tag set of `card`.
    pub fn set_tags(
        &mut self,
        scope: ScopeId,
        card: EntityId,
        tags: &[EntityId],
    ) -> Result<(), EngineError> {
        let (current, wanted) = {
            let view = self.view(scope)?;
            view.require_kind(card, EntityKind::Card)?;
            for tag in tags {
                view.require_kind(*tag, EntityKind::Tag)?;
            }
            let wanted: BTreeSet<EntityId> = tags.iter().copied().collect();
            (view.tags_of_card(card)?, wanted)
        };
        let pending = self.pending_mut(scope)?;
        for tag in current.difference(&wanted) {
            pending.set_card_tag(card, *tag, Membership::Removed);
        }
        for tag in wanted.difference(&current) {
            pending.set_card_tag(card, *tag, Membership::Added);
        }
        Ok(())
    }

    /// Apply a UI intent to `scope`. Returns the affected entity.
    pub fn apply_intent(&mut self, scope: ScopeId, intent: Intent) -> Result<EntityId, EngineError> {
        match intent.operation {
            IntentOperation::Create => {
                let id = intent.entity.unwrap_or_else(EntityId::new);
                if self.view(scope)?.kind_of(id)?.is_some() {
                    return Err(CoreError::InvalidData(format!("entity {id} already exists")).into());
                }
                let (memberships, plain): (Vec<_>, Vec<_>) = intent
                    .fields
                    .into_iter()
                    .partition(|(key, _)| key == fields::TAGS || key == fields::RELATIONSHIPS);
                self.pending_mut(scope)?
                    .create(id, intent.kind, plain.into_iter().collect());
                for (key, value) in memberships {
                    self.set_field(scope, id, &key, value)?;
                }
                Ok(id)
            }
            IntentOperation::Update => {
                let id = intent_target(&intent)?;
                self.view(scope)?.require_kind(id, intent.kind)?;
                for (key, value) in intent.fields {
                    self.set_field(scope, id, &key, value)?;
                }
                Ok(id)
            }
            IntentOperation::Delete => {
                let id = intent_target(&intent)?;
                self.view(scope)?.require_kind(id, intent.kind)?;
                self.delete_entity(scope, id)?;
                Ok(id)
            }
        }
    }
}

fn intent_target(intent: &Intent) -> Result<EntityId, EngineError> {
    intent.entity.ok_or_else(|| {
        CoreError::InvalidData(format!("{} intent needs a target entity", intent.kind)).into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Engine {
        Engine::open_in_memory(EngineConfig::default()).unwrap()
    }

    fn seeded(engine: &mut Engine) -> (EntityId, EntityId, EntityId) {
        let scope = engine.view_scope();
        let collection = engine.create_collection(scope, "Spanish").unwrap();
        let a = engine.create_card(scope, collection, "gato", "cat").unwrap();
        let b = engine.create_card(scope, collection, "perro", "dog").unwrap();
        engine.commit(scope).unwrap();
        (collection, a, b)
    }

    #[test]
    fn empty_commit_is_a_noop() {
        let mut engine = engine();
        let scope = engine.new_child_scope(None, ScopeKind::Edit).unwrap();
        assert!(engine.commit(scope).unwrap().is_noop());
        assert_eq!(engine.storage().current_cursor().unwrap(), None);
    }

    #[test]
    fn commit_normalizes_text() {
        let mut engine = engine();
        let scope = engine.view_scope();
        let collection = engine.create_collection(scope, "  Spanish, A1 ").unwrap();
        let tag = engine.create_tag(scope, " Food ").unwrap();
        let card = engine.create_card(scope, collection, " gato ", "cat ").unwrap();
        engine.commit(scope).unwrap();

        assert_eq!(engine.collection(scope, collection).unwrap().name, "Spanish A1");
        assert_eq!(engine.tag(scope, tag).unwrap().name, "food");
        assert_eq!(engine.card(scope, card).unwrap().native, "gato");
    }

    #[test]
    fn invalid_card_rejects_whole_commit() {
        let mut engine = engine();
        let scope = engine.view_scope();
        let collection = engine.create_collection(scope, "Spanish").unwrap();
        let card = engine.create_card(scope, collection, "gato", "  ").unwrap();

        let err = engine.commit(scope).unwrap_err();
        match err {
            EngineError::Validation(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].entity_id, card);
                assert_eq!(failures[0].field, fields::TRANSLATION);
            }
            other => panic!("expected validation error, got {other:?}"),
        }
        assert!(engine.has_pending(scope).unwrap());
        assert!(engine.storage().get_entity(collection).unwrap().is_none());
    }

    #[test]
    fn reject_invalid_commits_the_rest() {
        let mut engine = engine();
        let scope = engine.view_scope();
        let collection = engine.create_collection(scope, "Spanish").unwrap();
        let good = engine.create_card(scope, collection, "gato", "cat").unwrap();
        let bad = engine.create_card(scope, collection, "", "dog").unwrap();
        engine.relate_cards(scope, good, bad).unwrap();

        let outcome = engine.commit_with(scope, CommitPolicy::RejectInvalid).unwrap();
        assert!(outcome.cursor.is_some());
        assert_eq!(outcome.rejected.len(), 1);
        assert!(engine.storage().get_entity(good).unwrap().is_some());
        assert!(engine.storage().get_entity(bad).unwrap().is_none());
        // The rejected card and its edge are still pending.
        assert_eq!(engine.related_cards(scope, good).unwrap(), BTreeSet::from([bad]));
    }

    #[test]
    fn patch_of_an_entity_deleted_elsewhere_is_a_validation_failure() {
        let mut engine = engine();
        let (collection, a, _) = seeded(&mut engine);
        let editor = engine.new_child_scope(None, ScopeKind::Edit).unwrap();
        engine
            .set_field(editor, a, fields::NOTE, FieldValue::Text("feline".into()))
            .unwrap();
        let fresh = engine.create_card(editor, collection, "pez", "fish").unwrap();

        let other = engine.new_child_scope(None, ScopeKind::Edit).unwrap();
        engine.delete_entity(other, a).unwrap();
        engine.commit(other).unwrap();

        match engine.commit(editor) {
            Err(EngineError::Validation(failures)) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].entity_id, a);
                assert_eq!(failures[0].field, "id");
            }
            other => panic!("expected a validation failure, got {other:?}"),
        }

        let outcome = engine.commit_with(editor, CommitPolicy::RejectInvalid).unwrap();
        assert!(outcome.cursor.is_some());
        assert_eq!(outcome.rejected.len(), 1);
        assert!(engine.durable_view().resolve(fresh).unwrap().is_some());
        assert!(engine.durable_view().resolve(a).unwrap().is_none());
    }

    #[test]
    fn deleting_collection_deletes_cards_but_keeps_tags() {
        let mut engine = engine();
        let (collection, a, _) = seeded(&mut engine);
        let scope = engine.view_scope();
        let tag = engine.create_tag(scope, "animals").unwrap();
        engine.attach_tag(scope, a, tag).unwrap();
        engine.commit(scope).unwrap();

        engine.delete_entity(scope, collection).unwrap();
        engine.commit(scope).unwrap();
        assert!(engine.list_cards(scope).unwrap().is_empty());
        assert_eq!(engine.list_tags(scope).unwrap().len(), 1);
        assert!(engine.cards_with_tag(scope, tag).unwrap().is_empty());
    }

    #[test]
    fn set_relationships_filters_self_and_stays_symmetric() {
        let mut engine = engine();
        let (_, a, b) = seeded(&mut engine);
        let scope = engine.view_scope();
        engine
            .set_field(scope, a, fields::RELATIONSHIPS, FieldValue::EntityRefs(vec![a, b]))
            .unwrap();
        engine.commit(scope).unwrap();
        assert_eq!(engine.related_cards(scope, a).unwrap(), BTreeSet::from([b]));
        assert_eq!(engine.related_cards(scope, b).unwrap(), BTreeSet::from([a]));
    }

    #[test]
    fn relating_a_card_to_itself_is_an_error() {
        let mut engine = engine();
        let (_, a, _) = seeded(&mut engine);
        let scope = engine.view_scope();
        assert!(matches!(
            engine.relate_cards(scope, a, a),
            Err(EngineError::Core(CoreError::SelfRelationship(_)))
        ));
    }

    #[test]
    fn intents_create_update_and_delete() {
        let mut engine = engine();
        let (collection, a, _) = seeded(&mut engine);
        let scope = engine.view_scope();
        let tag = engine
            .apply_intent(scope, Intent::create(EntityKind::Tag, vec![(fields::NAME, "Verbs".into())]))
            .unwrap();
        let card = engine
            .apply_intent(
                scope,
                Intent::create(
                    EntityKind::Card,
                    vec![
                        (fields::COLLECTION, FieldValue::EntityRef(collection)),
                        (fields::NATIVE, "comer".into()),
                        (fields::TRANSLATION, "to eat".into()),
                        (fields::TAGS, FieldValue::EntityRefs(vec![tag])),
                        (fields::RELATIONSHIPS, FieldValue::EntityRefs(vec![a])),
                    ],
                ),
            )
            .unwrap();
        engine
            .apply_intent(
                scope,
                Intent::update(EntityKind::Card, card, vec![(fields::IS_FAVORITE, true.into())]),
            )
            .unwrap();
        engine.commit(scope).unwrap();

        assert!(engine.card(scope, card).unwrap().is_favorite);
        assert_eq!(engine.tags_of_card(scope, card).unwrap(), BTreeSet::from([tag]));
        assert_eq!(engine.related_cards(scope, a).unwrap(), BTreeSet::from([card]));

        engine.apply_intent(scope, Intent::delete(EntityKind::Card, card)).unwrap();
        engine.commit(scope).unwrap();
        assert!(engine.related_cards(scope, a).unwrap().is_empty());
        assert!(matches!(
            engine.apply_intent(scope, Intent::delete(EntityKind::Tag, a)),
            Err(EngineError::WrongKind { .. })
        ));
    }

    #[test]
    fn subscribers_hear_about_commits() {
        let mut engine = engine();
        let events = engine.subscribe();
        let (collection, _, _) = seeded(&mut engine);
        let event = events.try_recv().unwrap();
        assert!(!event.external);
        assert!(event.changed.contains(&collection));
        assert_eq!(engine.last_cursor().unwrap(), Some(event.cursor));
    }
}

use std::collections::BTreeSet;
use std::path::Path;

use cardgraph_core::{Card, EntityId, ScopeId};
use cardgraph_engine::{Engine, EngineConfig, EngineError, JobGuard};

/// One engine plus helpers for building small graphs in tests.
pub struct TestPeer {
    pub engine: Engine,
}

impl TestPeer {
    pub fn new(author: &str) -> Result<Self, EngineError> {
        Ok(Self {
            engine: Engine::open_in_memory(EngineConfig::with_author(author))?,
        })
    }

    pub fn open(path: &Path, author: &str) -> Result<Self, EngineError> {
        Ok(Self {
            engine: Engine::open(path, EngineConfig::with_author(author))?,
        })
    }

    pub fn with_job_guard(self, jobs: JobGuard) -> Self {
        Self {
            engine: self.engine.with_job_guard(jobs),
        }
    }

    pub fn view(&self) -> ScopeId {
        self.engine.view_scope()
    }

    /// Create and commit a collection holding one card per `(native, translation)` pair.
    pub fn seed_collection(
        &mut self,
        name: &str,
        cards: &[(&str, &str)],
    ) -> Result<(EntityId, Vec<EntityId>), EngineError> {
        let scope = self.view();
        let collection = self.engine.create_collection(scope, name)?;
        let mut ids = Vec::with_capacity(cards.len());
        for (native, translation) in cards {
            ids.push(self.engine.create_card(scope, collection, native, translation)?);
        }
        self.engine.commit(scope)?;
        Ok((collection, ids))
    }

    /// Create a tag, attach it to `cards` and commit.
    pub fn tag_cards(&mut self, name: &str, cards: &[EntityId]) -> Result<EntityId, EngineError> {
        let scope = self.view();
        let tag = self.engine.create_tag(scope, name)?;
        for card in cards {
            self.engine.attach_tag(scope, *card, tag)?;
        }
        self.engine.commit(scope)?;
        Ok(tag)
    }

    pub fn relate(&mut self, a: EntityId, b: EntityId) -> Result<(), EngineError> {
        let scope = self.view();
        self.engine.relate_cards(scope, a, b)?;
        self.engine.commit(scope)?;
        Ok(())
    }

    pub fn related(&self, card: EntityId) -> Result<BTreeSet<EntityId>, EngineError> {
        self.engine.related_cards(self.view(), card)
    }

    pub fn find_card(&self, native: &str) -> Result<Option<Card>, EngineError> {
        Ok(self
            .engine
            .list_cards(self.view())?
            .into_iter()
            .find(|card| card.native == native))
    }

    pub fn tag_names(&self) -> Result<Vec<String>, EngineError> {
        let mut names: Vec<String> = self
            .engine
            .list_tags(self.view())?
            .into_iter()
            .map(|tag| tag.name)
            .collect();
        names.sort();
        Ok(names)
    }
}

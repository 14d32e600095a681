use std::collections::BTreeMap;

use tracing::info;

use cardgraph_core::{
    EntityId, EntityKind, FieldValue, ScopeId,
    model::{fields, normalize_tag_name},
};

use crate::error::EngineError;
use crate::jobs::JobKind;
use crate::Engine;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagNormalizationReport {
    pub renamed: usize,
    pub merged: usize,
}

impl Engine {
    /// Re-point every card from `duplicate` to `keeper`, then delete `duplicate`.
    pub(crate) fn fold_tag_into(
        &mut self,
        scope: ScopeId,
        duplicate: EntityId,
        keeper: EntityId,
    ) -> Result<(), EngineError> {
        let cards = self.view(scope)?.cards_with_tag(duplicate)?;
        for card in cards {
            self.detach_tag(scope, card, duplicate)?;
            self.attach_tag(scope, card, keeper)?;
        }
        self.delete_entity(scope, duplicate)
    }

    /// Normalize every tag name and fold tags whose names collide into the one with the
    /// smallest id.
    pub fn normalize_tags(&mut self) -> Result<TagNormalizationReport, EngineError> {
        let _ticket = self.start_job(JobKind::TagNormalization)?;
        let (report, _) = self.in_background(|engine, scope| engine.normalize_tags_in(scope))?;
        info!(
            renamed = report.renamed,
            merged = report.merged,
            "normalized tags"
        );
        Ok(report)
    }

    pub fn normalize_tags_in(&mut self, scope: ScopeId) -> Result<TagNormalizationReport, EngineError> {
        let mut report = TagNormalizationReport::default();
        let mut keepers: BTreeMap<String, EntityId> = BTreeMap::new();
        for tag in self.list_tags(scope)? {
            let normalized = normalize_tag_name(&tag.name);
            match keepers.get(&normalized) {
                Some(keeper) => {
                    self.fold_tag_into(scope, tag.id, *keeper)?;
                    report.merged += 1;
                }
                None => {
                    if normalized != tag.name {
                        self.set_field(
                            scope,
                            tag.id,
                            fields::NAME,
                            FieldValue::Text(normalized.clone()),
                        )?;
                        report.renamed += 1;
                    }
                    keepers.insert(normalized, tag.id);
                }
            }
        }
        Ok(report)
    }

    /// Delete every tag that no card uses. Returns how many were deleted.
    pub fn delete_unused_tags(&mut self) -> Result<usize, EngineError> {
        let (deleted, _) = self.in_background(|engine, scope| {
            let mut unused = Vec::new();
            {
                let view = engine.view(scope)?;
                for tag in view.list(EntityKind::Tag)? {
                    if view.cards_with_tag(tag)?.is_empty() {
                        unused.push(tag);
                    }
                }
            }
            for tag in &unused {
                engine.delete_entity(scope, *tag)?;
            }
            Ok(unused.len())
        })?;
        info!(deleted, "deleted unused tags");
        Ok(deleted)
    }
}

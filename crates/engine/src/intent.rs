use cardgraph_core::{EntityId, EntityKind, FieldValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentOperation {
    Create,
    Update,
    Delete,
}

/// A user edit expressed as data, applied to a scope with `Engine::apply_intent`.
///
/// The pseudo-fields `tags` and `relationships` take `FieldValue::EntityRefs` and
/// replace the card's whole set.
#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub kind: EntityKind,
    pub operation: IntentOperation,
    /// Target entity. For `Create`, `None` mints a fresh id.
    pub entity: Option<EntityId>,
    pub fields: Vec<(String, FieldValue)>,
}

impl Intent {
    pub fn create(kind: EntityKind, fields: Vec<(&str, FieldValue)>) -> Self {
        Self {
            kind,
            operation: IntentOperation::Create,
            entity: None,
            fields: owned(fields),
        }
    }

    pub fn update(kind: EntityKind, entity: EntityId, fields: Vec<(&str, FieldValue)>) -> Self {
        Self {
            kind,
            operation: IntentOperation::Update,
            entity: Some(entity),
            fields: owned(fields),
        }
    }

    pub fn delete(kind: EntityKind, entity: EntityId) -> Self {
        Self {
            kind,
            operation: IntentOperation::Delete,
            entity: Some(entity),
            fields: Vec::new(),
        }
    }
}

fn owned(fields: Vec<(&str, FieldValue)>) -> Vec<(String, FieldValue)> {
    fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

//! Entity kinds, typed read models and the normalization/validity rules applied on commit.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::field_value::FieldValue;
use crate::ids::EntityId;

pub type FieldMap = BTreeMap<String, FieldValue>;

pub mod fields {
    pub const NAME: &str = "name";
    pub const NATIVE: &str = "native";
    pub const TRANSLATION: &str = "translation";
    pub const NOTE: &str = "note";
    pub const IS_FAVORITE: &str = "is_favorite";
    pub const FORMALITY: &str = "formality";
    pub const COLLECTION: &str = "collection";
    /// Pseudo-field: replaces the whole tag set of a card. Never stored as a field.
    pub const TAGS: &str = "tags";
    /// Pseudo-field: replaces the whole relationship set of a card. Never stored as a field.
    pub const RELATIONSHIPS: &str = "relationships";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Collection,
    Card,
    Tag,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collection => "collection",
            Self::Card => "card",
            Self::Tag => "tag",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "collection" => Ok(Self::Collection),
            "card" => Ok(Self::Card),
            "tag" => Ok(Self::Tag),
            _ => Err(CoreError::UnknownKind(s.to_string())),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Formality {
    #[default]
    Unspecified,
    Informal,
    Neutral,
    Formal,
}

impl Formality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::Informal => "informal",
            Self::Neutral => "neutral",
            Self::Formal => "formal",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "unspecified" => Ok(Self::Unspecified),
            "informal" => Ok(Self::Informal),
            "neutral" => Ok(Self::Neutral),
            "formal" => Ok(Self::Formal),
            _ => Err(CoreError::UnknownFormality(s.to_string())),
        }
    }
}

// ============================================================================
// Normalization
// ============================================================================

/// Collection names: commas removed, surrounding whitespace trimmed.
pub fn normalize_name(raw: &str) -> String {
    raw.replace(',', "").trim().to_string()
}

/// Tag names: like collection names, then lower-cased.
pub fn normalize_tag_name(raw: &str) -> String {
    normalize_name(raw).to_lowercase()
}

pub fn normalize_text(raw: &str) -> String {
    raw.trim().to_string()
}

/// Rewrite text fields of a pending field patch into their stored form.
pub fn normalize_fields(kind: EntityKind, fields: &mut FieldMap) {
    for (key, value) in fields.iter_mut() {
        let FieldValue::Text(text) = value else {
            continue;
        };
        let normalized = match (kind, key.as_str()) {
            (EntityKind::Collection, fields::NAME) => normalize_name(text),
            (EntityKind::Tag, fields::NAME) => normalize_tag_name(text),
            (EntityKind::Card, fields::NATIVE | fields::TRANSLATION | fields::NOTE) => {
                normalize_text(text)
            }
            _ => continue,
        };
        *text = normalized;
    }
}

// ============================================================================
// Validation
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFailure {
    pub entity_id: EntityId,
    pub kind: EntityKind,
    pub field: &'static str,
    pub reason: String,
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} field '{}': {}", self.kind, self.entity_id, self.field, self.reason)
    }
}

fn text_field(fields: &FieldMap, key: &str) -> String {
    fields
        .get(key)
        .and_then(FieldValue::as_text)
        .unwrap_or_default()
        .to_string()
}

// ============================================================================
// Typed read models
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    pub id: EntityId,
    pub name: String,
}

impl Collection {
    pub fn from_fields(id: EntityId, fields: &FieldMap) -> Self {
        Self {
            id,
            name: text_field(fields, fields::NAME),
        }
    }

    pub fn to_fields(&self) -> FieldMap {
        let mut map = FieldMap::new();
        map.insert(fields::NAME.to_string(), FieldValue::Text(self.name.clone()));
        map
    }

    pub fn validate(&self) -> Vec<ValidationFailure> {
        let mut failures = Vec::new();
        if normalize_name(&self.name).is_empty() {
            failures.push(ValidationFailure {
                entity_id: self.id,
                kind: EntityKind::Collection,
                field: fields::NAME,
                reason: "name is empty".into(),
            });
        }
        failures
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Card {
    pub id: EntityId,
    pub collection: Option<EntityId>,
    pub native: String,
    pub translation: String,
    pub note: String,
    pub is_favorite: bool,
    pub formality: Formality,
}

impl Card {
    pub fn from_fields(id: EntityId, fields: &FieldMap) -> Self {
        Self {
            id,
            collection: fields.get(fields::COLLECTION).and_then(FieldValue::as_entity_ref),
            native: text_field(fields, fields::NATIVE),
            translation: text_field(fields, fields::TRANSLATION),
            note: text_field(fields, fields::NOTE),
            is_favorite: fields
                .get(fields::IS_FAVORITE)
                .and_then(FieldValue::as_boolean)
                .unwrap_or(false),
            formality: fields
                .get(fields::FORMALITY)
                .and_then(FieldValue::as_text)
                .and_then(|s| Formality::parse(s).ok())
                .unwrap_or_default(),
        }
    }

    pub fn to_fields(&self) -> FieldMap {
        let mut map = FieldMap::new();
        if let Some(collection) = self.collection {
            map.insert(fields::COLLECTION.to_string(), FieldValue::EntityRef(collection));
        }
        map.insert(fields::NATIVE.to_string(), FieldValue::Text(self.native.clone()));
        map.insert(fields::TRANSLATION.to_string(), FieldValue::Text(self.translation.clone()));
        map.insert(fields::NOTE.to_string(), FieldValue::Text(self.note.clone()));
        map.insert(fields::IS_FAVORITE.to_string(), FieldValue::Boolean(self.is_favorite));
        map.insert(
            fields::FORMALITY.to_string(),
            FieldValue::Text(self.formality.as_str().to_string()),
        );
        map
    }

    /// `collection_exists` is whether `self.collection` resolves to a live collection.
    pub fn validate(&self, collection_exists: bool) -> Vec<ValidationFailure> {
        let mut failures = Vec::new();
        let mut fail = |field: &'static str, reason: &str| {
            failures.push(ValidationFailure {
                entity_id: self.id,
                kind: EntityKind::Card,
                field,
                reason: reason.to_string(),
            })
        };
        if normalize_text(&self.native).is_empty() {
            fail(fields::NATIVE, "native is empty");
        }
        if normalize_text(&self.translation).is_empty() {
            fail(fields::TRANSLATION, "translation is empty");
        }
        if self.collection.is_none() {
            fail(fields::COLLECTION, "card has no collection");
        } else if !collection_exists {
            fail(fields::COLLECTION, "collection does not exist");
        }
        failures
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub id: EntityId,
    pub name: String,
}

impl Tag {
    pub fn from_fields(id: EntityId, fields: &FieldMap) -> Self {
        Self {
            id,
            name: text_field(fields, fields::NAME),
        }
    }

    pub fn to_fields(&self) -> FieldMap {
        let mut map = FieldMap::new();
        map.insert(fields::NAME.to_string(), FieldValue::Text(self.name.clone()));
        map
    }

    pub fn validate(&self) -> Vec<ValidationFailure> {
        let mut failures = Vec::new();
        if normalize_tag_name(&self.name).is_empty() {
            failures.push(ValidationFailure {
                entity_id: self.id,
                kind: EntityKind::Tag,
                field: fields::NAME,
                reason: "name is empty".into(),
            });
        }
        failures
    }
}

/// Any entity as resolved in a scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    Collection(Collection),
    Card(Card),
    Tag(Tag),
}

impl Entity {
    pub fn from_fields(kind: EntityKind, id: EntityId, fields: &FieldMap) -> Self {
        match kind {
            EntityKind::Collection => Entity::Collection(Collection::from_fields(id, fields)),
            EntityKind::Card => Entity::Card(Card::from_fields(id, fields)),
            EntityKind::Tag => Entity::Tag(Tag::from_fields(id, fields)),
        }
    }

    pub fn id(&self) -> EntityId {
        match self {
            Entity::Collection(c) => c.id,
            Entity::Card(c) => c.id,
            Entity::Tag(t) => t.id,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Collection(_) => EntityKind::Collection,
            Entity::Card(_) => EntityKind::Card,
            Entity::Tag(_) => EntityKind::Tag,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_names_are_trimmed_stripped_and_lowercased() {
        assert_eq!(normalize_tag_name("  Food, Drink "), "food drink");
        assert_eq!(normalize_tag_name("VERBS"), "verbs");
    }

    #[test]
    fn collection_names_keep_case() {
        assert_eq!(normalize_name(" Spanish, A1 "), "Spanish A1");
    }

    #[test]
    fn normalize_fields_only_touches_known_text_fields() {
        let mut map = FieldMap::new();
        map.insert(fields::NATIVE.into(), FieldValue::Text("  hola ".into()));
        map.insert(fields::FORMALITY.into(), FieldValue::Text(" formal".into()));
        normalize_fields(EntityKind::Card, &mut map);
        assert_eq!(map[fields::NATIVE], FieldValue::Text("hola".into()));
        assert_eq!(map[fields::FORMALITY], FieldValue::Text(" formal".into()));
    }

    #[test]
    fn card_requires_both_sides_and_a_collection() {
        let card = Card {
            id: EntityId::new(),
            collection: None,
            native: "  ".into(),
            translation: "hello".into(),
            note: String::new(),
            is_favorite: false,
            formality: Formality::Unspecified,
        };
        let failures = card.validate(false);
        let failed: Vec<_> = failures.iter().map(|f| f.field).collect();
        assert_eq!(failed, vec![fields::NATIVE, fields::COLLECTION]);
    }

    #[test]
    fn card_fields_round_trip() {
        let card = Card {
            id: EntityId::new(),
            collection: Some(EntityId::new()),
            native: "perro".into(),
            translation: "dog".into(),
            note: "noun".into(),
            is_favorite: true,
            formality: Formality::Neutral,
        };
        assert_eq!(Card::from_fields(card.id, &card.to_fields()), card);
    }

    #[test]
    fn unknown_formality_falls_back_to_unspecified() {
        let mut map = FieldMap::new();
        map.insert(fields::FORMALITY.into(), FieldValue::Text("casual".into()));
        let card = Card::from_fields(EntityId::new(), &map);
        assert_eq!(card.formality, Formality::Unspecified);
    }
}

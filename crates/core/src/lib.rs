pub mod change;
pub mod cursor;
pub mod error;
pub mod field_value;
pub mod ids;
pub mod model;
pub mod records;

pub use change::{ChangeSet, EntityChange, Membership, RelationEdge};
pub use cursor::{ChangeCursor, ChangeNotification};
pub use error::CoreError;
pub use field_value::FieldValue;
pub use ids::*;
pub use model::{Card, Collection, Entity, EntityKind, FieldMap, Formality, Tag, ValidationFailure};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::database::mapper::Shape;

/// A typed value object persisted in one table
///
/// Entities are serialized through serde, so field names in the shape must
/// match the serialized field names.
///
/// ```rust,ignore
/// #[derive(Serialize, Deserialize)]
/// struct Item {
///     id: Option<i64>,
///     name: String,
///     tags: Vec<String>,
/// }
///
/// impl Entity for Item {
///     fn shape() -> Shape {
///         Shape::new("items")
///             .field(FieldSpec::new("name", FieldKind::Text))
///             .field(FieldSpec::new("tags", FieldKind::Json))
///     }
///     fn id(&self) -> Option<i64> {
///         self.id
///     }
///     fn set_id(&mut self, id: i64) {
///         self.id = Some(id);
///     }
/// }
/// ```
pub trait Entity: Serialize + DeserializeOwned {
    fn shape() -> Shape;

    /// Primary key, `None` until the entity has been created
    fn id(&self) -> Option<i64>;

    fn set_id(&mut self, id: i64);

    /// Called with the managed timestamps (unix seconds) after a write
    ///
    /// `created_at` is only set on create.
    fn set_timestamps(&mut self, _created_at: Option<i64>, _updated_at: i64) {}
}

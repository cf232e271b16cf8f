pub mod audit;
pub mod controller;
pub mod error;
pub mod field;
pub mod filter;
pub mod model;
pub mod nested;
pub mod store;

/// A document as exchanged with callers and stored in the backend: an ordered
/// mapping of field name to JSON-representable value.
pub type Document = serde_json::Map<String, serde_json::Value>;

pub use audit::{ActorResolver, AuditAction};
pub use controller::{CrudController, ModelHandle};
pub use error::{DocBaseError, FieldErrors, Result};
pub use field::{Column, FieldKind, IndexKind};
pub use filter::{CmpOp, FilterOperand, FilterValue, Filters};
pub use model::{CrudModel, ModelBuilder, RollbackGuard, VersionedCrudModel};
pub use store::DocumentStore;

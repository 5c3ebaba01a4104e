//! Schema Snapshot Module
//!
//! Point-in-time captures of the database schema and everything built on them:
//! - Snapshot model and content hash
//! - Diff engine producing atomic change events
//! - File-backed persistence of the baseline and change history
//! - The polling monitor that ties the above together

pub mod change;
pub mod diff;
pub mod model;
pub mod monitor;
pub mod store;

pub use change::{ChangeDetails, ChangeType, ColumnField, FieldModification, Priority, SchemaChange};
pub use diff::{DiffEngine, DiffOptions};
pub use model::{SchemaSnapshot, TableStructure, METADATA_VERSION};
pub use monitor::{BatchChangeHandler, ChangeHandler, HandlerId, SchemaMonitor};
pub use store::SnapshotStore;

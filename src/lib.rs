//! SchemaFlow Evolve - schema drift monitoring and code evolution
//!
//! Watches a live database for structural changes and drives regeneration of
//! everything derived from the schema:
//! - [`snapshot`]: point-in-time captures, diffing, persistence and the polling monitor
//! - [`detector`]: impact classification, breaking changes, migration strategy
//! - [`evolution`]: phase-based task orchestration with approval and rollback
//! - [`introspection`]: the schema-reading seam (PostgreSQL and in-memory)

pub mod config;
pub mod detector;
pub mod error;
pub mod evolution;
pub mod introspection;
pub mod snapshot;

pub use config::Settings;
pub use detector::ChangeDetector;
pub use error::{AppError, AppResult};
pub use evolution::{EvolutionEngine, EvolutionTask};
pub use snapshot::{SchemaChange, SchemaMonitor, SchemaSnapshot};

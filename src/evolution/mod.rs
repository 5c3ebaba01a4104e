//! Evolution Module
//!
//! Phase-based orchestration of code regeneration in response to schema
//! changes, plus the collaborators each phase calls out to:
//! - Code producers (generation)
//! - Test runners (testing)
//! - Source validators (validation)
//! - Notification sinks (task outcomes and approval requests)

pub mod engine;
pub mod notify;
pub mod producers;
pub mod state;
pub mod task;
pub mod testing;
pub mod validation;

pub use engine::{EvolutionEngine, EvolutionEngineBuilder};
pub use notify::{NotificationPayload, NotificationSink, WebhookNotifier};
pub use producers::{CodeProducer, ManifestProducer, ProducerKind};
pub use state::{EngineState, EngineStats};
pub use task::{ChangeAnalysis, EvolutionPhase, EvolutionStatus, EvolutionTask, PhaseResult};
pub use testing::{CommandTestRunner, TestResults, TestRunner};
pub use validation::{SourceValidator, SyntaxValidator};

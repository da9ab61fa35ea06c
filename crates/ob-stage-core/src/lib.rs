//! Onboarding stage progress core.
//!
//! Keeps per-instance stage progress aligned with a mutable workflow template
//! (`reconcile`), runs condition actions that move instances through that
//! template (`executor`), and marks bypassed stages (`marker`). All state is
//! reached through the ports in `store`.

pub mod actions;
pub mod codec;
pub mod error;
pub mod events;
pub mod executor;
pub mod marker;
pub mod reconcile;
pub mod store;
pub mod store_memory;
pub mod types;

#[cfg(feature = "postgres")]
pub mod store_postgres;

pub use actions::{
    parse_actions, ActionExecutionContext, ActionExecutionDetail, ActionExecutionResult,
    ActionKind, ActionType, RawAction,
};
pub use error::{Result, StageError};
pub use events::{
    EmitterStats, EventEmitter, EventPayload, EventReceiver, ProgressEvent, SharedEmitter,
};
pub use executor::{ActionExecutor, ExecutorConfig, SuccessPolicy};
pub use marker::SkippedStageMarker;
pub use reconcile::{reconcile_progress, sanitize_progress, ProgressReconciler, SyncReport};
pub use store::{
    persist_progress, ActionDefinition, ActionDefinitions, InstanceStore, NotificationSink,
    StageTemplates,
};
pub use store_memory::MemoryStore;
pub use types::{
    AssigneeKind, OnboardingInstance, StageDefinition, StageProgress, StageStatus, TenantScope,
};

#[cfg(feature = "postgres")]
pub use store_postgres::PgStageStore;

//! App lifecycle orchestration.
//!
//! Requests enter through [`orchestrator::LifecycleOrchestrator`], are turned into a
//! [`command::LifecycleCommand`] and reach the container engine only via
//! [`dispatcher::EventDispatcher`]. Status lives in an [`record::AppRecordStore`]; bundles live
//! behind an [`fs::AppFilesystem`].

pub mod command;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod fs;
pub mod orchestrator;
pub mod reconcile;
pub mod record;
pub mod request;
pub mod status;

pub use command::{Completion, LifecycleCommand};
pub use dispatcher::{DispatchResult, EngineState, EventDispatcher};
pub use engine::{ComposeEngine, ContainerEngineAdapter, EngineCommand, EngineOutput};
pub use error::{DispatchError, LifecycleError};
pub use fs::{AppFilesystem, AppManifest, LocalAppFilesystem};
pub use orchestrator::{Ack, LifecycleOrchestrator, OperationHandle, Outcome};
pub use reconcile::{Reconciler, Reconciliation};
pub use record::{AppRecord, AppRecordPatch, AppRecordStore, SqliteAppStore, Transition};
pub use request::{FormData, LifecycleRequest};
pub use status::{AppStatus, OperationKind};

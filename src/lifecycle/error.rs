use crate::core::error::DeckError;
use crate::lifecycle::status::{AppStatus, OperationKind};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Everything a lifecycle request can fail with. Each variant names the app it concerns.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("app '{app_id}' not found")]
    AppNotFound { app_id: String },
    #[error("cannot {} app '{app_id}' while it is {status}", .operation.verb())]
    InvalidTransition {
        app_id: String,
        operation: OperationKind,
        status: AppStatus,
    },
    #[error("filesystem failure for app '{app_id}': {message}")]
    FilesystemFailure { app_id: String, message: String },
    #[error("container engine failed for app '{app_id}': {message}")]
    EngineDispatchFailure { app_id: String, message: String },
    #[error("container engine timed out after {after:?} for app '{app_id}' ({command}); outcome unknown")]
    EngineTimeout {
        app_id: String,
        command: String,
        after: Duration,
    },
    #[error("app '{app_id}' is already installed")]
    AlreadyInstalled { app_id: String },
    #[error("no update available for app '{app_id}' (installed version {installed}, catalog version {available})")]
    NoUpdateAvailable {
        app_id: String,
        installed: u32,
        available: u32,
    },
    #[error("app store failure for app '{app_id}': {message}")]
    StoreFailure { app_id: String, message: String },
}

impl LifecycleError {
    /// Stable machine-readable kind for API/CLI payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleError::AppNotFound { .. } => "app_not_found",
            LifecycleError::InvalidTransition { .. } => "invalid_transition",
            LifecycleError::FilesystemFailure { .. } => "filesystem_failure",
            LifecycleError::EngineDispatchFailure { .. } => "engine_dispatch_failure",
            LifecycleError::EngineTimeout { .. } => "engine_timeout",
            LifecycleError::AlreadyInstalled { .. } => "already_installed",
            LifecycleError::NoUpdateAvailable { .. } => "no_update_available",
            LifecycleError::StoreFailure { .. } => "store_failure",
        }
    }

    pub fn app_id(&self) -> &str {
        match self {
            LifecycleError::AppNotFound { app_id }
            | LifecycleError::InvalidTransition { app_id, .. }
            | LifecycleError::FilesystemFailure { app_id, .. }
            | LifecycleError::EngineDispatchFailure { app_id, .. }
            | LifecycleError::EngineTimeout { app_id, .. }
            | LifecycleError::AlreadyInstalled { app_id }
            | LifecycleError::NoUpdateAvailable { app_id, .. }
            | LifecycleError::StoreFailure { app_id, .. } => app_id,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "error": self.kind(),
            "app_id": self.app_id(),
            "message": self.to_string(),
        })
    }

    pub(crate) fn store(app_id: &str, err: DeckError) -> Self {
        LifecycleError::StoreFailure {
            app_id: app_id.to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn filesystem(app_id: &str, err: DeckError) -> Self {
        LifecycleError::FilesystemFailure {
            app_id: app_id.to_string(),
            message: err.to_string(),
        }
    }
}

/// Failure modes of a single engine dispatch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// No result within the deadline. The engine call keeps running; its outcome is unknown.
    #[error("`{command}` for app '{app_id}' timed out after {after:?}")]
    Timeout {
        app_id: String,
        command: String,
        after: Duration,
    },
    /// The adapter could not invoke the engine at all.
    #[error("`{command}` for app '{app_id}' could not be dispatched: {message}")]
    Unavailable {
        app_id: String,
        command: String,
        message: String,
    },
    /// The engine ran and exited nonzero (only from `dispatch_and_await`).
    #[error("`{command}` for app '{app_id}' exited with {exit:?}: {stderr}")]
    Failed {
        app_id: String,
        command: String,
        exit: Option<i32>,
        stderr: String,
    },
}

impl From<DispatchError> for LifecycleError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Timeout {
                app_id,
                command,
                after,
            } => LifecycleError::EngineTimeout {
                app_id,
                command,
                after,
            },
            DispatchError::Unavailable { ref app_id, .. } | DispatchError::Failed { ref app_id, .. } => {
                LifecycleError::EngineDispatchFailure {
                    app_id: app_id.clone(),
                    message: err.to_string(),
                }
            }
        }
    }
}

//! Lifecycle orchestrator: the single entry point for app lifecycle requests.
//!
//! `execute` validates and records intent synchronously, then hands the engine work to a
//! background task and returns an acknowledgement. Whatever happens in that task, the record
//! leaves its transitional status: `finalize` writes the terminal status, and if the task dies
//! before getting there a drop guard writes `errored`.
//!
//! Each accepted operation holds its app's [`Claim`] until the task ends, engine calls that
//! outlived their deadline included. Reconciliation skips claimed apps, in this process and in
//! any other process sharing the data root.

use crate::core::error::DeckError;
use crate::core::locks::{AppClaims, AppLocks, Claim};
use crate::lifecycle::command::{CommandContext, Completion, LifecycleCommand, Prechecked};
use crate::lifecycle::dispatcher::EventDispatcher;
use crate::lifecycle::error::LifecycleError;
use crate::lifecycle::fs::{AppFilesystem, validate_app_id};
use crate::lifecycle::reconcile::{Reconciler, Reconciliation};
use crate::lifecycle::record::{AppRecord, AppRecordPatch, AppRecordStore, Transition};
use crate::lifecycle::request::{FormData, LifecycleRequest};
use crate::lifecycle::status::{AppStatus, OperationKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Returned once a request passed its precheck and its transitional status is recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub accepted: bool,
    pub app_id: String,
    pub operation: OperationKind,
}

/// The background task driving one accepted operation.
#[derive(Debug)]
pub struct OperationHandle {
    app_id: String,
    operation: OperationKind,
    join: JoinHandle<Result<Completion, LifecycleError>>,
}

impl OperationHandle {
    /// Block until the operation has finalized and released the app.
    pub fn wait(self) -> Result<Completion, LifecycleError> {
        match self.join.join() {
            Ok(result) => result,
            Err(_) => Err(LifecycleError::EngineDispatchFailure {
                app_id: self.app_id,
                message: format!("{} task panicked; app marked errored", self.operation),
            }),
        }
    }
}

#[derive(Debug)]
pub enum Outcome {
    /// Engine work is running in the background.
    Accepted { ack: Ack, handle: OperationHandle },
    /// Nothing to dispatch; the operation finished during the call.
    Completed {
        app_id: String,
        operation: OperationKind,
        status: AppStatus,
    },
}

impl Outcome {
    /// Response payload: the ack for background work, `{success, status}` otherwise.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Outcome::Accepted { ack, .. } => serde_json::json!(ack),
            Outcome::Completed {
                app_id,
                operation,
                status,
            } => serde_json::json!({
                "success": true,
                "app_id": app_id,
                "operation": operation,
                "status": status,
            }),
        }
    }

    /// Block until a background operation finishes; already-completed outcomes return at once.
    pub fn wait(self) -> Result<Completion, LifecycleError> {
        match self {
            Outcome::Accepted { handle, .. } => handle.wait(),
            Outcome::Completed { status, .. } => Ok(Completion::Status(status)),
        }
    }
}

/// Writes `errored` unless disarmed. Lives for the whole background task and releases the
/// app's claim only after that write.
struct FinalizeGuard {
    store: Arc<dyn AppRecordStore>,
    app_id: String,
    operation: OperationKind,
    armed: bool,
    _claim: Claim,
}

impl FinalizeGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for FinalizeGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let reason = format!("{} did not finalize", self.operation);
        tracing::error!(app_id = %self.app_id, operation = %self.operation, "{}; marking errored", reason);
        if let Err(e) = self
            .store
            .update(&self.app_id, AppRecordPatch::failed(AppStatus::Errored, reason))
        {
            tracing::error!(app_id = %self.app_id, error = %e, "failed to record errored status");
        }
    }
}

pub struct LifecycleOrchestrator {
    ctx: CommandContext,
    locks: Arc<AppLocks>,
    claims: Arc<AppClaims>,
}

impl LifecycleOrchestrator {
    pub fn new(
        store: Arc<dyn AppRecordStore>,
        fs: Arc<dyn AppFilesystem>,
        dispatcher: Arc<EventDispatcher>,
        claims: Arc<AppClaims>,
        up_retries: u32,
    ) -> Self {
        Self {
            ctx: CommandContext {
                store,
                fs,
                dispatcher,
                up_retries,
            },
            locks: Arc::new(AppLocks::new()),
            claims,
        }
    }

    pub fn store(&self) -> &Arc<dyn AppRecordStore> {
        &self.ctx.store
    }

    /// Current record, `None` when the app is not installed.
    pub fn status(&self, app_id: &str) -> Result<Option<AppRecord>, LifecycleError> {
        self.ctx
            .store
            .get(app_id)
            .map_err(|e| LifecycleError::store(app_id, e))
    }

    pub fn list(&self) -> Result<Vec<AppRecord>, DeckError> {
        self.ctx.store.list()
    }

    /// Settle records stranded in a transitional status by a process that died mid-operation.
    /// Apps whose operation is still owned, here or elsewhere, are left alone.
    pub fn reconcile(&self) -> Result<Vec<Reconciliation>, DeckError> {
        Reconciler::new(
            Arc::clone(&self.ctx.store),
            Arc::clone(&self.ctx.fs),
            Arc::clone(&self.ctx.dispatcher),
            Arc::clone(&self.claims),
        )
        .with_locks(Arc::clone(&self.locks))
        .reconcile_all()
    }

    pub fn submit(&self, request: LifecycleRequest) -> Result<Outcome, LifecycleError> {
        self.execute(&request.app_id, request.operation, request.form)
    }

    /// Precheck, record the transitional status, prepare, then run the engine work in the
    /// background. Errors returned here leave no transitional status behind.
    pub fn execute(
        &self,
        app_id: &str,
        operation: OperationKind,
        form: FormData,
    ) -> Result<Outcome, LifecycleError> {
        if validate_app_id(app_id).is_err() {
            return Err(LifecycleError::AppNotFound {
                app_id: app_id.to_string(),
            });
        }
        let request = LifecycleRequest::new(app_id, operation, form);
        let command = LifecycleCommand::from_request(&request);

        let lease = self
            .locks
            .acquire(app_id)
            .map_err(|e| LifecycleError::store(app_id, e))?;

        let record = self
            .ctx
            .store
            .get(app_id)
            .map_err(|e| LifecycleError::store(app_id, e))?;
        let checked = command.precheck(&self.ctx, app_id, record)?;

        let claim = self
            .claims
            .try_claim(app_id)
            .map_err(|e| LifecycleError::store(app_id, e))?;
        let Some(claim) = claim else {
            // Settled, but another process (or a straggling engine call) still owns the app.
            return Err(LifecycleError::InvalidTransition {
                app_id: app_id.to_string(),
                operation,
                status: checked
                    .record
                    .as_ref()
                    .map(|r| r.status)
                    .unwrap_or(AppStatus::Missing),
            });
        };

        let Some(transitional) = command.transitional_status(checked.record.as_ref()) else {
            // Synchronous path: the lease stays held until the write is done.
            let status = self.complete_without_engine(&command, app_id, &checked)?;
            drop(claim);
            drop(lease);
            return Ok(Outcome::Completed {
                app_id: app_id.to_string(),
                operation,
                status,
            });
        };

        self.enter_transitional(&command, app_id, &checked, transitional)?;
        tracing::info!(app_id, %operation, status = %transitional, "lifecycle operation accepted");

        if let Err(err) = command.prepare(&self.ctx, app_id, &checked) {
            self.mark_errored(app_id, &err);
            return Err(err);
        }

        // The transitional status and the claim now block conflicting requests.
        drop(lease);

        let handle = self.spawn(command, app_id, claim)?;
        Ok(Outcome::Accepted {
            ack: Ack {
                accepted: true,
                app_id: app_id.to_string(),
                operation,
            },
            handle,
        })
    }

    fn enter_transitional(
        &self,
        command: &LifecycleCommand,
        app_id: &str,
        checked: &Prechecked,
        transitional: AppStatus,
    ) -> Result<(), LifecycleError> {
        let operation = command.kind();

        if operation == OperationKind::Install {
            let version = checked.manifest.as_ref().map(|m| m.version).unwrap_or(0);
            let config = match command {
                LifecycleCommand::Install { form } => form.config(),
                _ => serde_json::Value::Null,
            };
            let record = AppRecord::new(
                app_id,
                transitional,
                version,
                config,
                self.ctx.fs.compose_path(app_id),
            );
            return match self.ctx.store.create(record) {
                Ok(_) => Ok(()),
                Err(DeckError::ValidationError(_)) => Err(LifecycleError::AlreadyInstalled {
                    app_id: app_id.to_string(),
                }),
                Err(e) => Err(LifecycleError::store(app_id, e)),
            };
        }

        let allowed = operation.allowed_from();
        match self
            .ctx
            .store
            .transition(app_id, allowed, transitional)
            .map_err(|e| LifecycleError::store(app_id, e))?
        {
            Transition::Applied(_) => Ok(()),
            Transition::Rejected(status) => Err(LifecycleError::InvalidTransition {
                app_id: app_id.to_string(),
                operation,
                status,
            }),
            Transition::Missing => Err(LifecycleError::AppNotFound {
                app_id: app_id.to_string(),
            }),
        }
    }

    fn complete_without_engine(
        &self,
        command: &LifecycleCommand,
        app_id: &str,
        checked: &Prechecked,
    ) -> Result<AppStatus, LifecycleError> {
        let current = checked
            .record
            .as_ref()
            .map(|r| r.status)
            .unwrap_or(AppStatus::Missing);
        if let Err(err) = command.prepare(&self.ctx, app_id, checked) {
            self.mark_errored(app_id, &err);
            return Err(err);
        }
        tracing::info!(app_id, operation = %command.kind(), status = %current, "lifecycle operation completed without engine");
        Ok(current)
    }

    fn mark_errored(&self, app_id: &str, err: &LifecycleError) {
        tracing::warn!(app_id, error = %err, "prepare failed; nothing dispatched");
        if let Err(e) = self
            .ctx
            .store
            .update(app_id, AppRecordPatch::failed(AppStatus::Errored, err.to_string()))
        {
            tracing::error!(app_id, error = %e, "failed to record errored status");
        }
    }

    fn spawn(
        &self,
        command: LifecycleCommand,
        app_id: &str,
        claim: Claim,
    ) -> Result<OperationHandle, LifecycleError> {
        let operation = command.kind();
        let guard = FinalizeGuard {
            store: Arc::clone(&self.ctx.store),
            app_id: app_id.to_string(),
            operation,
            armed: true,
            _claim: claim,
        };
        let ctx = self.ctx.clone();
        let task_app = app_id.to_string();

        let join = thread::Builder::new()
            .name(format!("lifecycle-{}", app_id))
            .spawn(move || {
                let outcome = command.run(&ctx, &task_app);
                let result = command.finalize(&ctx, &task_app, outcome);
                // A store failure inside finalize leaves the status unwritten; the guard covers it.
                if !matches!(result, Err(LifecycleError::StoreFailure { .. })) {
                    guard.disarm();
                }
                result
            })
            // On spawn failure the closure, and the guard inside it, is dropped: errored is recorded.
            .map_err(|e| LifecycleError::EngineDispatchFailure {
                app_id: app_id.to_string(),
                message: format!("could not start {} task: {}", operation, e),
            })?;

        Ok(OperationHandle {
            app_id: app_id.to_string(),
            operation,
            join,
        })
    }
}

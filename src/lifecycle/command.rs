//! Lifecycle commands: one variant per user intent.
//!
//! Every variant goes through the same four steps:
//! 1. `precheck`: validate against the current record, no side effects
//! 2. `prepare`: filesystem work; a failure here aborts before any engine call
//! 3. `run`: the engine steps, through the dispatcher
//! 4. `finalize`: the terminal status write, on success and failure alike
//!
//! The orchestrator owns the transitional write between 1 and 2 and guarantees 4 runs.

use crate::core::error::DeckError;
use crate::lifecycle::dispatcher::{DispatchResult, EngineState, EventDispatcher};
use crate::lifecycle::engine::EngineCommand;
use crate::lifecycle::error::{DispatchError, LifecycleError};
use crate::lifecycle::fs::{AppFilesystem, AppManifest, BundlePath, validate_env_entry};
use crate::lifecycle::record::{AppRecord, AppRecordPatch, AppRecordStore};
use crate::lifecycle::request::{FormData, LifecycleRequest};
use crate::lifecycle::status::{AppStatus, OperationKind};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Collaborators injected into every command.
#[derive(Clone)]
pub struct CommandContext {
    pub store: Arc<dyn AppRecordStore>,
    pub fs: Arc<dyn AppFilesystem>,
    pub dispatcher: Arc<EventDispatcher>,
    /// Extra attempts for idempotent engine steps that exit nonzero.
    pub up_retries: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleCommand {
    Install { form: FormData },
    Start,
    Stop,
    Restart,
    Update { backup: bool },
    UpdateConfig { form: FormData },
    Uninstall,
    Reset,
}

/// What a passing precheck learned, handed to `prepare`.
#[derive(Debug, Clone, Default)]
pub struct Prechecked {
    /// Current record (absent only for Install).
    pub record: Option<AppRecord>,
    /// Catalog manifest, when the command needs one.
    pub manifest: Option<AppManifest>,
}

/// Result of the engine steps.
#[derive(Debug)]
pub enum RunOutcome {
    Succeeded(DispatchResult),
    /// The engine ran and failed, or could not be invoked.
    Failed { reason: String, error: LifecycleError },
    /// Outcome unknown; the engine call may still be running.
    TimedOut { error: LifecycleError },
}

/// Terminal state of a finished command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Status(AppStatus),
    /// Uninstall: the record no longer exists.
    Removed,
}

/// Terminal status for an engine observation after an unknown outcome.
pub fn status_for_engine_state(state: EngineState) -> AppStatus {
    match state {
        EngineState::Running => AppStatus::Running,
        EngineState::Stopped => AppStatus::Stopped,
        EngineState::Unknown => AppStatus::Errored,
    }
}

/// Env variables appdeck writes itself. Form values never override them.
pub const OWNED_ENV: &[&str] = &["APP_ID", "APP_DATA_DIR", "APP_PORT"];

fn env_value(v: &JsonValue) -> String {
    match v {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

/// Every form entry must render as a single `KEY=value` line.
pub fn validate_form(app_id: &str, form: &FormData) -> Result<(), LifecycleError> {
    for (k, v) in &form.values {
        validate_env_entry(k, &env_value(v)).map_err(|e| LifecycleError::filesystem(app_id, e))?;
    }
    Ok(())
}

/// Env file contents: catalog defaults, then form values, then the variables appdeck owns.
pub fn render_env(
    app_id: &str,
    manifest: Option<&AppManifest>,
    values: &serde_json::Map<String, JsonValue>,
    data_dir: &Path,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    if let Some(m) = manifest {
        for field in &m.form_fields {
            if let Some(default) = &field.default {
                env.insert(field.env_variable.clone(), default.clone());
            }
        }
        if let Some(port) = m.port {
            env.insert("APP_PORT".to_string(), port.to_string());
        }
    }
    for (k, v) in values {
        if OWNED_ENV.contains(&k.as_str()) {
            tracing::warn!(app_id, variable = %k, "ignoring form value for an appdeck-owned variable");
            continue;
        }
        env.insert(k.clone(), env_value(v));
    }
    env.insert("APP_ID".to_string(), app_id.to_string());
    env.insert(
        "APP_DATA_DIR".to_string(),
        data_dir.to_string_lossy().to_string(),
    );
    env
}

impl LifecycleCommand {
    /// The single lookup from a request to its command.
    pub fn from_request(request: &LifecycleRequest) -> Self {
        match request.operation {
            OperationKind::Install => LifecycleCommand::Install {
                form: request.form.clone(),
            },
            OperationKind::Start => LifecycleCommand::Start,
            OperationKind::Stop => LifecycleCommand::Stop,
            OperationKind::Restart => LifecycleCommand::Restart,
            OperationKind::Update => LifecycleCommand::Update {
                backup: request.form.backup,
            },
            OperationKind::UpdateConfig => LifecycleCommand::UpdateConfig {
                form: request.form.clone(),
            },
            OperationKind::Uninstall => LifecycleCommand::Uninstall,
            OperationKind::Reset => LifecycleCommand::Reset,
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            LifecycleCommand::Install { .. } => OperationKind::Install,
            LifecycleCommand::Start => OperationKind::Start,
            LifecycleCommand::Stop => OperationKind::Stop,
            LifecycleCommand::Restart => OperationKind::Restart,
            LifecycleCommand::Update { .. } => OperationKind::Update,
            LifecycleCommand::UpdateConfig { .. } => OperationKind::UpdateConfig,
            LifecycleCommand::Uninstall => OperationKind::Uninstall,
            LifecycleCommand::Reset => OperationKind::Reset,
        }
    }

    fn form(&self) -> FormData {
        match self {
            LifecycleCommand::Install { form } | LifecycleCommand::UpdateConfig { form } => {
                form.clone()
            }
            LifecycleCommand::Update { backup } => FormData {
                backup: *backup,
                ..FormData::default()
            },
            _ => FormData::default(),
        }
    }

    /// Validate the request against the record as currently stored. No side effects.
    pub fn precheck(
        &self,
        ctx: &CommandContext,
        app_id: &str,
        record: Option<AppRecord>,
    ) -> Result<Prechecked, LifecycleError> {
        let op = self.kind();

        if let LifecycleCommand::Install { form } = self {
            if record.is_some() {
                return Err(LifecycleError::AlreadyInstalled {
                    app_id: app_id.to_string(),
                });
            }
            let manifest = ctx
                .fs
                .read_manifest(app_id)
                .map_err(|e| LifecycleError::filesystem(app_id, e))?
                .ok_or_else(|| LifecycleError::AppNotFound {
                    app_id: app_id.to_string(),
                })?;
            validate_form(app_id, form)?;
            return Ok(Prechecked {
                record: None,
                manifest: Some(manifest),
            });
        }

        let record = record.ok_or_else(|| LifecycleError::AppNotFound {
            app_id: app_id.to_string(),
        })?;
        if !op.permits(record.status) {
            return Err(LifecycleError::InvalidTransition {
                app_id: app_id.to_string(),
                operation: op,
                status: record.status,
            });
        }

        let manifest = match self {
            LifecycleCommand::Update { .. } => {
                let manifest = ctx
                    .fs
                    .read_manifest(app_id)
                    .map_err(|e| LifecycleError::filesystem(app_id, e))?;
                let available = manifest.as_ref().map(|m| m.version).unwrap_or(0);
                if available <= record.version {
                    return Err(LifecycleError::NoUpdateAvailable {
                        app_id: app_id.to_string(),
                        installed: record.version,
                        available,
                    });
                }
                manifest
            }
            LifecycleCommand::UpdateConfig { form } => {
                validate_form(app_id, form)?;
                // Defaults for fields the new form leaves out; a catalog that dropped the app is fine.
                ctx.fs.read_manifest(app_id).ok().flatten()
            }
            _ => None,
        };

        Ok(Prechecked {
            record: Some(record),
            manifest,
        })
    }

    /// Status written before `prepare`. `None` means the command completes synchronously
    /// without touching the engine.
    pub fn transitional_status(&self, record: Option<&AppRecord>) -> Option<AppStatus> {
        match self {
            LifecycleCommand::UpdateConfig { .. } => match record.map(|r| r.status) {
                Some(AppStatus::Running) => Some(AppStatus::Restarting),
                _ => None,
            },
            other => Some(other.kind().transitional()),
        }
    }

    /// Filesystem work. Nothing is dispatched if this fails.
    pub fn prepare(
        &self,
        ctx: &CommandContext,
        app_id: &str,
        checked: &Prechecked,
    ) -> Result<(), LifecycleError> {
        let fs = &ctx.fs;
        let io = |e: DeckError| LifecycleError::filesystem(app_id, e);

        match self {
            LifecycleCommand::Install { form } => {
                fs.install_compose(app_id).map_err(io)?;
                let env = render_env(
                    app_id,
                    checked.manifest.as_ref(),
                    &form.values,
                    &fs.data_dir(app_id),
                );
                fs.write_env(app_id, &env).map_err(io)?;
                fs.create_data_dir(app_id).map_err(io)?;
                fs.normalize_permissions(app_id).map_err(io)?;
            }
            LifecycleCommand::Update { backup } => {
                if *backup {
                    let snapshot = fs.backup(app_id).map_err(io)?;
                    tracing::info!(app_id, snapshot = %snapshot.display(), "backup taken before update");
                }
                fs.install_compose(app_id).map_err(io)?;
                let values = checked
                    .record
                    .as_ref()
                    .and_then(|r| r.config.as_object().cloned())
                    .unwrap_or_default();
                let env = render_env(
                    app_id,
                    checked.manifest.as_ref(),
                    &values,
                    &fs.data_dir(app_id),
                );
                fs.write_env(app_id, &env).map_err(io)?;
                if let Some(m) = &checked.manifest {
                    ctx.store
                        .update(app_id, AppRecordPatch::default().with_version(m.version))
                        .map_err(|e| LifecycleError::store(app_id, e))?;
                }
            }
            LifecycleCommand::UpdateConfig { form } => {
                if !fs.exists(app_id, BundlePath::Compose) {
                    return Err(LifecycleError::FilesystemFailure {
                        app_id: app_id.to_string(),
                        message: format!(
                            "compose definition missing at {}",
                            fs.compose_path(app_id).display()
                        ),
                    });
                }
                let env = render_env(
                    app_id,
                    checked.manifest.as_ref(),
                    &form.values,
                    &fs.data_dir(app_id),
                );
                fs.write_env(app_id, &env).map_err(io)?;
                ctx.store
                    .update(app_id, AppRecordPatch::default().with_config(form.config()))
                    .map_err(|e| LifecycleError::store(app_id, e))?;
            }
            LifecycleCommand::Reset => {
                fs.remove_data_dir(app_id).map_err(io)?;
                fs.create_data_dir(app_id).map_err(io)?;
                fs.normalize_permissions(app_id).map_err(io)?;
            }
            LifecycleCommand::Start
            | LifecycleCommand::Stop
            | LifecycleCommand::Restart
            | LifecycleCommand::Uninstall => {}
        }
        Ok(())
    }

    /// Engine steps in order. Every step but the last must succeed for the next to run.
    pub fn engine_steps(&self) -> &'static [EngineCommand] {
        const UP: &[EngineCommand] = &[EngineCommand::UP];
        const DOWN: &[EngineCommand] = &[EngineCommand::DOWN];
        const CYCLE: &[EngineCommand] = &[EngineCommand::DOWN, EngineCommand::UP];
        const RECREATE: &[EngineCommand] = &[EngineCommand::Up {
            force_recreate: true,
        }];
        const PURGE: &[EngineCommand] = &[EngineCommand::Down { purge: true }];

        match self {
            LifecycleCommand::Install { .. }
            | LifecycleCommand::Start
            | LifecycleCommand::UpdateConfig { .. } => UP,
            LifecycleCommand::Stop => DOWN,
            LifecycleCommand::Restart | LifecycleCommand::Reset => CYCLE,
            LifecycleCommand::Update { .. } => RECREATE,
            LifecycleCommand::Uninstall => PURGE,
        }
    }

    /// Dispatch the engine steps.
    pub fn run(&self, ctx: &CommandContext, app_id: &str) -> RunOutcome {
        let form = self.form();
        let steps = self.engine_steps();
        let mut last = None;

        for (i, step) in steps.iter().enumerate() {
            let is_last = i + 1 == steps.len();
            let attempt = if is_last {
                dispatch_with_retry(ctx, app_id, *step, &form)
            } else {
                ctx.dispatcher
                    .dispatch_and_await(app_id, *step, &form)
                    .map_err(|e| match e {
                        DispatchError::Failed { .. } | DispatchError::Unavailable { .. } => {
                            RunOutcome::Failed {
                                reason: e.to_string(),
                                error: e.into(),
                            }
                        }
                        DispatchError::Timeout { .. } => RunOutcome::TimedOut { error: e.into() },
                    })
            };
            match attempt {
                Ok(result) => last = Some(result),
                Err(outcome) => return outcome,
            }
        }

        match last {
            Some(result) => RunOutcome::Succeeded(result),
            None => RunOutcome::Failed {
                reason: "no engine steps".to_string(),
                error: LifecycleError::EngineDispatchFailure {
                    app_id: app_id.to_string(),
                    message: "no engine steps".to_string(),
                },
            },
        }
    }

    fn success_status(&self) -> AppStatus {
        match self {
            LifecycleCommand::Stop => AppStatus::Stopped,
            _ => AppStatus::Running,
        }
    }

    fn failure_status(&self) -> AppStatus {
        match self {
            LifecycleCommand::Install { .. }
            | LifecycleCommand::Stop
            | LifecycleCommand::UpdateConfig { .. } => AppStatus::Errored,
            _ => AppStatus::Stopped,
        }
    }

    /// Terminal write. Always leaves the record out of its transitional status (or removes it).
    pub fn finalize(
        &self,
        ctx: &CommandContext,
        app_id: &str,
        outcome: RunOutcome,
    ) -> Result<Completion, LifecycleError> {
        if let LifecycleCommand::Uninstall = self {
            return finalize_uninstall(ctx, app_id, outcome);
        }

        let store_err = |e: DeckError| LifecycleError::store(app_id, e);
        match outcome {
            RunOutcome::Succeeded(_) => {
                let status = self.success_status();
                ctx.store
                    .update(app_id, AppRecordPatch::settled(status))
                    .map_err(store_err)?;
                tracing::info!(app_id, operation = %self.kind(), %status, "lifecycle operation completed");
                Ok(Completion::Status(status))
            }
            RunOutcome::Failed { reason, error } => {
                let status = self.failure_status();
                ctx.store
                    .update(app_id, AppRecordPatch::failed(status, reason.clone()))
                    .map_err(store_err)?;
                tracing::warn!(app_id, operation = %self.kind(), %status, %reason, "lifecycle operation failed");
                Err(error)
            }
            RunOutcome::TimedOut { error } => {
                // The engine call is still running: stay transitional until it exits, then
                // settle on what the engine reports.
                ctx.store
                    .update(app_id, AppRecordPatch::noted(error.to_string()))
                    .map_err(store_err)?;
                tracing::warn!(app_id, operation = %self.kind(), error = %error, "waiting for timed-out engine call to exit");
                ctx.dispatcher.wait_idle(app_id);
                let observed = ctx.dispatcher.query_state(app_id);
                let status = status_for_engine_state(observed);
                ctx.store
                    .update(app_id, AppRecordPatch::failed(status, error.to_string()))
                    .map_err(store_err)?;
                tracing::warn!(
                    app_id,
                    operation = %self.kind(),
                    ?observed,
                    %status,
                    "engine timed out; status taken from observed engine state"
                );
                Err(error)
            }
        }
    }
}

fn dispatch_with_retry(
    ctx: &CommandContext,
    app_id: &str,
    step: EngineCommand,
    form: &FormData,
) -> Result<DispatchResult, RunOutcome> {
    let attempts = if step.is_idempotent() {
        1 + ctx.up_retries
    } else {
        1
    };
    let mut last_failure = None;
    for attempt in 1..=attempts {
        match ctx.dispatcher.dispatch(app_id, step, form) {
            Ok(result) if result.success => return Ok(result),
            Ok(result) => {
                if attempt < attempts {
                    tracing::info!(app_id, command = %step, attempt, "retrying idempotent engine step");
                }
                last_failure = Some(result);
            }
            Err(e @ DispatchError::Timeout { .. }) => {
                return Err(RunOutcome::TimedOut { error: e.into() });
            }
            Err(e) => {
                return Err(RunOutcome::Failed {
                    reason: e.to_string(),
                    error: e.into(),
                });
            }
        }
    }

    let reason = last_failure
        .as_ref()
        .map(DispatchResult::failure_reason)
        .unwrap_or_else(|| format!("`{}` failed", step));
    Err(RunOutcome::Failed {
        error: LifecycleError::EngineDispatchFailure {
            app_id: app_id.to_string(),
            message: reason.clone(),
        },
        reason,
    })
}

/// Engine cleanup is best effort; local removal is not.
fn finalize_uninstall(
    ctx: &CommandContext,
    app_id: &str,
    outcome: RunOutcome,
) -> Result<Completion, LifecycleError> {
    match &outcome {
        RunOutcome::Succeeded(_) => {}
        RunOutcome::Failed { reason, .. } => {
            tracing::warn!(app_id, %reason, "engine cleanup failed during uninstall; removing local state anyway");
        }
        RunOutcome::TimedOut { error } => {
            tracing::warn!(app_id, %error, "engine cleanup timed out during uninstall; removing local state once it exits");
            ctx.dispatcher.wait_idle(app_id);
        }
    }

    let removal = ctx
        .fs
        .remove_bundle(app_id)
        .and_then(|_| ctx.fs.remove_data_dir(app_id));
    if let Err(e) = removal {
        let err = LifecycleError::filesystem(app_id, e);
        ctx.store
            .update(app_id, AppRecordPatch::failed(AppStatus::Errored, err.to_string()))
            .map_err(|e| LifecycleError::store(app_id, e))?;
        tracing::error!(app_id, error = %err, "uninstall could not remove the local bundle");
        return Err(err);
    }

    ctx.store
        .delete(app_id)
        .map_err(|e| LifecycleError::store(app_id, e))?;
    tracing::info!(app_id, "app uninstalled");
    Ok(Completion::Removed)
}

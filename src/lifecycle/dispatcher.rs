//! Event dispatcher: the only path from lifecycle commands to the container engine.
//!
//! Each dispatch runs the adapter on its own worker thread and waits for it with a deadline.
//! A missed deadline is reported as [`DispatchError::Timeout`]; the worker is not killed and the
//! engine call runs to completion in the background, so a timeout means "outcome unknown", never
//! "failed". Workers stay counted against their app until they exit, and
//! [`EventDispatcher::wait_idle`] blocks on that. Nothing here retries.

use crate::core::broker::append_jsonl;
use crate::core::error::DeckError;
use crate::core::redact;
use crate::core::time;
use crate::lifecycle::engine::{ContainerEngineAdapter, EngineCommand, EngineOutput};
use crate::lifecycle::error::DispatchError;
use crate::lifecycle::request::FormData;
use serde::{Deserialize, Serialize};
use rustc_hash::FxHashMap;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Outcome of one engine invocation that returned within the deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchResult {
    pub app_id: String,
    pub command: EngineCommand,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl DispatchResult {
    /// Redacted, bounded failure description for logs and `last_error`.
    pub fn failure_reason(&self) -> String {
        let detail = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        format!(
            "`{}` exited with {}: {}",
            self.command,
            self.exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string()),
            redact::error_tail(detail)
        )
    }
}

/// What the engine reports about an app's containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Running,
    Stopped,
    Unknown,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct DispatchEvent {
    ts: String,
    event_id: String,
    app_id: String,
    command: String,
    outcome: String,
    exit_code: Option<i32>,
    elapsed_ms: u128,
}

/// Engine workers still running, per app id.
#[derive(Default)]
struct Workers {
    running: Mutex<FxHashMap<String, usize>>,
    idle: Condvar,
}

/// Counts one worker against its app; released when the worker thread ends, panics included.
struct WorkerSlot {
    workers: Arc<Workers>,
    app_id: String,
}

impl Workers {
    fn enter(self: &Arc<Self>, app_id: &str) -> WorkerSlot {
        let mut running = self.running.lock().unwrap_or_else(|p| p.into_inner());
        *running.entry(app_id.to_string()).or_insert(0) += 1;
        WorkerSlot {
            workers: Arc::clone(self),
            app_id: app_id.to_string(),
        }
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        let mut running = self
            .workers
            .running
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        if let Some(count) = running.get_mut(&self.app_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                running.remove(&self.app_id);
            }
        }
        self.workers.idle.notify_all();
    }
}

pub struct EventDispatcher {
    engine: Arc<dyn ContainerEngineAdapter>,
    timeout: Duration,
    audit_log: Option<PathBuf>,
    workers: Arc<Workers>,
}

/// An in-flight dispatch. Dropping it abandons the wait, not the engine call.
pub struct DispatchHandle {
    app_id: String,
    command: EngineCommand,
    started: Instant,
    rx: Receiver<Result<EngineOutput, DeckError>>,
    audit_log: Option<PathBuf>,
}

impl EventDispatcher {
    pub fn new(engine: Arc<dyn ContainerEngineAdapter>, timeout: Duration) -> Self {
        Self {
            engine,
            timeout,
            audit_log: None,
            workers: Arc::default(),
        }
    }

    /// Append one line per dispatch to `path`.
    pub fn with_audit_log(mut self, path: PathBuf) -> Self {
        self.audit_log = Some(path);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start the engine call on a worker thread and return immediately.
    pub fn dispatch_async(
        &self,
        app_id: &str,
        command: EngineCommand,
        form: &FormData,
    ) -> DispatchHandle {
        let (tx, rx) = mpsc::channel();
        let engine = Arc::clone(&self.engine);
        let worker_app = app_id.to_string();
        let worker_form = form.clone();
        let slot = self.workers.enter(app_id);

        tracing::info!(app_id, command = %command, "dispatching to container engine");
        let spawned = thread::Builder::new()
            .name(format!("engine-{}", app_id))
            .spawn(move || {
                let _slot = slot;
                let out = engine.run(
                    &worker_app,
                    command.subcommand(),
                    &command.args(),
                    &worker_form,
                );
                // The receiver is gone if the caller stopped waiting; the result is dropped.
                let _ = tx.send(out);
            });
        if let Err(e) = spawned {
            // The closure (sender and slot included) was dropped, so `wait` sees a disconnect.
            tracing::error!(app_id, error = %e, "failed to spawn engine worker");
        }

        DispatchHandle {
            app_id: app_id.to_string(),
            command,
            started: Instant::now(),
            rx,
            audit_log: self.audit_log.clone(),
        }
    }

    /// Run and wait up to the configured timeout. A nonzero exit is an `Ok` result with
    /// `success == false`.
    pub fn dispatch(
        &self,
        app_id: &str,
        command: EngineCommand,
        form: &FormData,
    ) -> Result<DispatchResult, DispatchError> {
        self.dispatch_async(app_id, command, form)
            .wait(self.timeout)
    }

    /// Like [`EventDispatcher::dispatch`], but a nonzero exit is an error. For compound steps
    /// whose next step depends on this one having succeeded.
    pub fn dispatch_and_await(
        &self,
        app_id: &str,
        command: EngineCommand,
        form: &FormData,
    ) -> Result<DispatchResult, DispatchError> {
        let result = self.dispatch(app_id, command, form)?;
        if result.success {
            return Ok(result);
        }
        Err(DispatchError::Failed {
            app_id: result.app_id.clone(),
            command: command.to_string(),
            exit: result.exit_code,
            stderr: redact::error_tail(&result.stderr),
        })
    }

    /// Block until no engine call for `app_id` is running, including calls whose wait already
    /// timed out.
    pub fn wait_idle(&self, app_id: &str) {
        let mut running = self
            .workers
            .running
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        while running.contains_key(app_id) {
            running = self
                .workers
                .idle
                .wait(running)
                .unwrap_or_else(|p| p.into_inner());
        }
    }

    /// Ask the engine whether the app's containers are up. Any failure is `Unknown`.
    pub fn query_state(&self, app_id: &str) -> EngineState {
        match self.dispatch(app_id, EngineCommand::Ps, &FormData::default()) {
            Ok(r) if r.success && r.stdout.trim().is_empty() => EngineState::Stopped,
            Ok(r) if r.success => EngineState::Running,
            Ok(_) | Err(_) => EngineState::Unknown,
        }
    }
}

impl DispatchHandle {
    /// Wait for the engine result, at most `timeout` from now.
    pub fn wait(self, timeout: Duration) -> Result<DispatchResult, DispatchError> {
        let outcome = match self.rx.recv_timeout(timeout) {
            Ok(Ok(out)) => Ok(DispatchResult {
                app_id: self.app_id.clone(),
                command: self.command,
                success: out.success(),
                exit_code: out.exit_code,
                stdout: out.stdout,
                stderr: out.stderr,
                elapsed: self.started.elapsed(),
            }),
            Ok(Err(e)) => Err(DispatchError::Unavailable {
                app_id: self.app_id.clone(),
                command: self.command.to_string(),
                message: e.to_string(),
            }),
            Err(RecvTimeoutError::Timeout) => Err(DispatchError::Timeout {
                app_id: self.app_id.clone(),
                command: self.command.to_string(),
                after: timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(DispatchError::Unavailable {
                app_id: self.app_id.clone(),
                command: self.command.to_string(),
                message: "engine worker exited without a result".to_string(),
            }),
        };

        self.record(&outcome);
        outcome
    }

    fn record(&self, outcome: &Result<DispatchResult, DispatchError>) {
        let (label, exit_code) = match outcome {
            Ok(r) if r.success => ("success", r.exit_code),
            Ok(r) => ("nonzero_exit", r.exit_code),
            Err(DispatchError::Timeout { .. }) => ("timeout", None),
            Err(_) => ("unavailable", None),
        };
        let elapsed = self.started.elapsed();
        match outcome {
            Ok(r) if !r.success => tracing::warn!(
                app_id = %self.app_id,
                command = %self.command,
                exit_code = ?r.exit_code,
                stderr = %redact::error_tail(&r.stderr),
                "container engine exited nonzero"
            ),
            Err(e) => tracing::warn!(app_id = %self.app_id, error = %e, "dispatch did not complete"),
            Ok(_) => tracing::debug!(
                app_id = %self.app_id,
                command = %self.command,
                elapsed_ms = elapsed.as_millis() as u64,
                "dispatch completed"
            ),
        }

        let Some(path) = &self.audit_log else {
            return;
        };
        let ev = DispatchEvent {
            ts: time::now_epoch_z(),
            event_id: time::new_event_id(),
            app_id: self.app_id.clone(),
            command: self.command.to_string(),
            outcome: label.to_string(),
            exit_code,
            elapsed_ms: elapsed.as_millis(),
        };
        if let Err(e) = append_jsonl(path, &ev) {
            tracing::warn!(path = %path.display(), error = %e, "failed to append dispatch event");
        }
    }
}

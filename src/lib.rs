//! Appdeck: lifecycle orchestration for self-hosted apps.
//!
//! Appdeck keeps a catalog of app bundles (a compose definition plus a manifest of form fields)
//! and turns user intents into prepared bundles, compose invocations and persisted status
//! transitions.
//!
//! # Architecture
//!
//! - One request thread validates the intent against the app's record under a per-app lock,
//!   records a transitional status and prepares the bundle on disk.
//! - The container engine is only ever reached through the event dispatcher, on a background
//!   thread, with a deadline. A missed deadline means "outcome unknown": the app stays
//!   transitional until the engine call exits, then settles on what the engine reports.
//! - Every operation finalizes: the record always leaves its transitional status.
//!
//! All record writes route through `DbBroker` for in-process serialization and audit logging
//! (`broker.events.jsonl`); engine calls are audited to `dispatch.events.jsonl`.
//!
//! # Examples
//!
//! ```bash
//! appdeck install blog --set BLOG_TITLE=Notes
//! appdeck restart notes
//! appdeck update photos --backup
//! appdeck --format json list
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: data root, config, SQLite broker, locks, logging
//! - [`lifecycle`]: records, state machine, commands, dispatcher, orchestrator

mod cli;
pub mod core;
pub mod lifecycle;

use crate::cli::{Cli, Command, OutputFormat};
use crate::core::config::{self, DeckConfig};
use crate::core::error::DeckError;
use crate::core::locks::AppClaims;
use crate::core::logging;
use crate::core::store::{self, Store};
use crate::core::time::command_envelope;
use crate::lifecycle::command::Completion;
use crate::lifecycle::engine::{ComposeEngine, find_container_runtime};
use crate::lifecycle::error::LifecycleError;
use crate::lifecycle::fs::{AppFilesystem, LocalAppFilesystem};
use crate::lifecycle::orchestrator::{LifecycleOrchestrator, Outcome};
use crate::lifecycle::record::{AppRecord, AppRecordStore, SqliteAppStore};
use crate::lifecycle::status::AppStatus;
use crate::lifecycle::EventDispatcher;

use clap::Parser;
use colored::Colorize;
use serde_json::json;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

/// Wire the production collaborators for a data root.
pub fn open_orchestrator(root: &Path, config: &DeckConfig) -> Result<LifecycleOrchestrator, DeckError> {
    let store = Store::new(root, config);
    let claims = Arc::new(AppClaims::new(store.claims_dir()));
    let fs: Arc<dyn AppFilesystem> = Arc::new(LocalAppFilesystem::new(store.clone()));
    let records: Arc<dyn AppRecordStore> = Arc::new(SqliteAppStore::open(root)?);

    let binary = match find_container_runtime(&config.engine.binary) {
        Ok(found) => found,
        Err(e) => {
            tracing::warn!(binary = %config.engine.binary, error = %e, "container runtime not found; engine calls will fail");
            config.engine.binary.clone()
        }
    };
    let engine = Arc::new(ComposeEngine::new(binary, Arc::clone(&fs)));
    let dispatcher = EventDispatcher::new(engine, config.engine.timeout())
        .with_audit_log(store.dispatch_log_path());

    Ok(LifecycleOrchestrator::new(
        records,
        fs,
        Arc::new(dispatcher),
        claims,
        config.engine.up_retries,
    ))
}

pub fn run() -> Result<ExitCode, DeckError> {
    let cli = Cli::parse();
    logging::init_tracing(cli.verbose);

    let root = store::resolve_root(cli.root.as_deref());
    let config = config::load_config(&root)?;
    let orchestrator = open_orchestrator(&root, &config)?;
    let format = cli.format;

    match &cli.command {
        Command::Reconcile => {
            let reconciled = orchestrator.reconcile()?;
            print_reconciled(format, &reconciled);
            Ok(ExitCode::SUCCESS)
        }
        Command::List => {
            let records = orchestrator.list()?;
            print_list(format, &records);
            Ok(ExitCode::SUCCESS)
        }
        Command::Status { app } => match orchestrator.status(app) {
            Ok(Some(record)) => {
                print_record(format, &record);
                Ok(ExitCode::SUCCESS)
            }
            Ok(None) => Ok(report_error(
                format,
                "status",
                &LifecycleError::AppNotFound {
                    app_id: app.clone(),
                },
            )),
            Err(e) => Ok(report_error(format, "status", &e)),
        },
        command => {
            let args = match command.lifecycle_args() {
                Some(Ok(args)) => args,
                Some(Err(msg)) => return Err(DeckError::ValidationError(msg)),
                None => return Ok(ExitCode::SUCCESS),
            };
            // Settle apps a killed predecessor left behind; owned operations are skipped.
            orchestrator.reconcile()?;
            let cmd = args.operation.as_str();
            let outcome = match orchestrator.execute(&args.app, args.operation, args.form) {
                Ok(outcome) => outcome,
                Err(e) => return Ok(report_error(format, cmd, &e)),
            };

            if args.detach || matches!(outcome, Outcome::Completed { .. }) {
                print_outcome(format, cmd, &outcome);
                return Ok(ExitCode::SUCCESS);
            }

            if format == OutputFormat::Text {
                println!(
                    "  {} {} {} accepted, waiting for the engine",
                    "▸".bright_cyan(),
                    args.app.bold(),
                    cmd
                );
            }
            match outcome.wait() {
                Ok(completion) => {
                    print_completion(format, cmd, &args.app, completion);
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => Ok(report_error(format, cmd, &e)),
            }
        }
    }
}

fn status_label(status: AppStatus) -> colored::ColoredString {
    match status {
        AppStatus::Running => status.as_str().bright_green(),
        AppStatus::Stopped => status.as_str().bright_yellow(),
        AppStatus::Errored => status.as_str().bright_red().bold(),
        other => other.as_str().bright_cyan(),
    }
}

fn report_error(format: OutputFormat, cmd: &str, err: &LifecycleError) -> ExitCode {
    match format {
        OutputFormat::Json => {
            println!("{}", command_envelope(cmd, "error", err.to_json()));
        }
        OutputFormat::Text => {
            eprintln!(
                "  {} {}: {}",
                "✗".bright_red().bold(),
                err.kind().bright_red(),
                err
            );
        }
    }
    ExitCode::FAILURE
}

fn print_outcome(format: OutputFormat, cmd: &str, outcome: &Outcome) {
    match format {
        OutputFormat::Json => {
            println!("{}", command_envelope(cmd, "ok", outcome.to_json()));
        }
        OutputFormat::Text => match outcome {
            Outcome::Accepted { ack, .. } => println!(
                "  {} {} {} accepted",
                "▸".bright_cyan(),
                ack.app_id.bold(),
                cmd
            ),
            Outcome::Completed { app_id, status, .. } => println!(
                "  {} {} updated, still {}",
                "✓".bright_green(),
                app_id.bold(),
                status_label(*status)
            ),
        },
    }
}

fn print_completion(format: OutputFormat, cmd: &str, app_id: &str, completion: Completion) {
    let payload = match completion {
        Completion::Status(status) => json!({ "app_id": app_id, "status": status }),
        Completion::Removed => json!({ "app_id": app_id, "removed": true }),
    };
    match format {
        OutputFormat::Json => println!("{}", command_envelope(cmd, "ok", payload)),
        OutputFormat::Text => match completion {
            Completion::Status(status) => println!(
                "  {} {} is {}",
                "✓".bright_green(),
                app_id.bold(),
                status_label(status)
            ),
            Completion::Removed => {
                println!("  {} {} uninstalled", "✓".bright_green(), app_id.bold())
            }
        },
    }
}

fn print_record(format: OutputFormat, record: &AppRecord) {
    match format {
        OutputFormat::Json => println!(
            "{}",
            command_envelope("status", "ok", json!({ "app": record }))
        ),
        OutputFormat::Text => {
            println!("  {} {}", record.id.bold(), status_label(record.status));
            println!("    version  {}", record.version);
            println!("    compose  {}", record.compose_path.display());
            println!("    updated  {}", record.updated_at);
            if let Some(err) = &record.last_error {
                println!("    error    {}", err.bright_red());
            }
        }
    }
}

fn print_list(format: OutputFormat, records: &[AppRecord]) {
    match format {
        OutputFormat::Json => println!(
            "{}",
            command_envelope("list", "ok", json!({ "apps": records }))
        ),
        OutputFormat::Text => {
            if records.is_empty() {
                println!("  no apps installed");
                return;
            }
            for r in records {
                println!(
                    "  {:<24} {:<14} v{}",
                    r.id,
                    status_label(r.status),
                    r.version
                );
            }
        }
    }
}

fn print_reconciled(format: OutputFormat, reconciled: &[lifecycle::Reconciliation]) {
    match format {
        OutputFormat::Json => println!(
            "{}",
            command_envelope("reconcile", "ok", json!({ "reconciled": reconciled }))
        ),
        OutputFormat::Text => {
            if reconciled.is_empty() {
                println!("  nothing to reconcile");
                return;
            }
            for r in reconciled {
                let to = match r.to {
                    Some(status) => status_label(status).to_string(),
                    None => "removed".dimmed().to_string(),
                };
                println!("  {} {} {} → {}", "▸".bright_yellow(), r.app_id.bold(), r.from, to);
            }
        }
    }
}

//! CLI struct definitions for the appdeck command-line interface.
//!
//! All clap-derived types live here. Dispatch logic lives in `lib.rs`.

use crate::lifecycle::request::FormData;
use crate::lifecycle::status::OperationKind;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "appdeck",
    version = env!("CARGO_PKG_VERSION"),
    about = "Install, run and maintain self-hosted apps as docker compose bundles."
)]
pub(crate) struct Cli {
    /// Data root (defaults to $APPDECK_ROOT, then ./.appdeck).
    #[clap(long, global = true)]
    pub root: Option<PathBuf>,
    /// Output format.
    #[clap(long, global = true, value_enum, default_value = "text")]
    pub format: OutputFormat,
    /// Debug-level logging unless APPDECK_LOG says otherwise.
    #[clap(long, short = 'v', global = true)]
    pub verbose: bool,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

#[derive(clap::Args, Debug)]
pub(crate) struct TargetCli {
    /// App id as listed in the catalog.
    pub app: String,
    /// Return after the acknowledgement instead of waiting for the engine.
    #[clap(long)]
    pub detach: bool,
}

#[derive(clap::Args, Debug)]
pub(crate) struct FormCli {
    #[clap(flatten)]
    pub target: TargetCli,
    /// Form value, repeatable: --set KEY=VALUE
    #[clap(long = "set", value_name = "KEY=VALUE")]
    pub set: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Install an app from the catalog
    Install(FormCli),
    /// Start a stopped or errored app
    Start(TargetCli),
    /// Stop a running app
    Stop(TargetCli),
    /// Stop then start an app
    Restart(TargetCli),
    /// Move an app to the catalog's newer version
    Update {
        #[clap(flatten)]
        target: TargetCli,
        /// Snapshot data and bundle before rewriting the bundle
        #[clap(long)]
        backup: bool,
    },
    /// Replace an app's form values (restarts it if running)
    UpdateConfig(FormCli),
    /// Remove an app, its containers and its data
    Uninstall(TargetCli),
    /// Wipe an app's data directory and start it fresh
    Reset(TargetCli),
    /// Show one app's record
    Status {
        app: String,
    },
    /// List installed apps
    List,
    /// Settle apps left in a transitional status by an interrupted run
    Reconcile,
}

/// A lifecycle request parsed from the command line.
pub(crate) struct LifecycleArgs {
    pub app: String,
    pub operation: OperationKind,
    pub form: FormData,
    pub detach: bool,
}

impl Command {
    /// `None` for read-only commands.
    pub(crate) fn lifecycle_args(&self) -> Option<Result<LifecycleArgs, String>> {
        let simple = |target: &TargetCli, operation| {
            Ok::<_, String>(LifecycleArgs {
                app: target.app.clone(),
                operation,
                form: FormData::default(),
                detach: target.detach,
            })
        };
        let with_form = |cli: &FormCli, operation| {
            FormData::from_pairs(&cli.set).map(|form| LifecycleArgs {
                app: cli.target.app.clone(),
                operation,
                form,
                detach: cli.target.detach,
            })
        };

        let args = match self {
            Command::Install(cli) => with_form(cli, OperationKind::Install),
            Command::UpdateConfig(cli) => with_form(cli, OperationKind::UpdateConfig),
            Command::Start(t) => simple(t, OperationKind::Start),
            Command::Stop(t) => simple(t, OperationKind::Stop),
            Command::Restart(t) => simple(t, OperationKind::Restart),
            Command::Uninstall(t) => simple(t, OperationKind::Uninstall),
            Command::Reset(t) => simple(t, OperationKind::Reset),
            Command::Update { target, backup } => {
                simple(target, OperationKind::Update).map(|mut a| {
                    a.form.backup = *backup;
                    a
                })
            }
            Command::Status { .. } | Command::List | Command::Reconcile => return None,
        };
        Some(args)
    }
}

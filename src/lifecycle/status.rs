//! App status state machine.
//!
//! `missing` is never persisted: an app without a record is missing. Every engine-invoking
//! operation moves the record into a dedicated transitional status first and out of it into a
//! terminal status when the engine call returns.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppStatus {
    Missing,
    Installing,
    Starting,
    Stopping,
    Restarting,
    Updating,
    Resetting,
    Uninstalling,
    Running,
    Stopped,
    Errored,
}

impl AppStatus {
    pub const TRANSITIONAL: [AppStatus; 7] = [
        AppStatus::Installing,
        AppStatus::Starting,
        AppStatus::Stopping,
        AppStatus::Restarting,
        AppStatus::Updating,
        AppStatus::Resetting,
        AppStatus::Uninstalling,
    ];

    /// Statuses an installed app can rest in between operations.
    pub const SETTLED: [AppStatus; 3] = [AppStatus::Running, AppStatus::Stopped, AppStatus::Errored];

    pub fn is_transitional(self) -> bool {
        Self::TRANSITIONAL.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AppStatus::Missing => "missing",
            AppStatus::Installing => "installing",
            AppStatus::Starting => "starting",
            AppStatus::Stopping => "stopping",
            AppStatus::Restarting => "restarting",
            AppStatus::Updating => "updating",
            AppStatus::Resetting => "resetting",
            AppStatus::Uninstalling => "uninstalling",
            AppStatus::Running => "running",
            AppStatus::Stopped => "stopped",
            AppStatus::Errored => "errored",
        }
    }
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s {
            "missing" => AppStatus::Missing,
            "installing" => AppStatus::Installing,
            "starting" => AppStatus::Starting,
            "stopping" => AppStatus::Stopping,
            "restarting" => AppStatus::Restarting,
            "updating" => AppStatus::Updating,
            "resetting" => AppStatus::Resetting,
            "uninstalling" => AppStatus::Uninstalling,
            "running" => AppStatus::Running,
            "stopped" => AppStatus::Stopped,
            "errored" => AppStatus::Errored,
            other => return Err(format!("unknown app status '{}'", other)),
        };
        Ok(status)
    }
}

/// One user intent against an app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Install,
    Start,
    Stop,
    Restart,
    Update,
    UpdateConfig,
    Uninstall,
    Reset,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Install => "install",
            OperationKind::Start => "start",
            OperationKind::Stop => "stop",
            OperationKind::Restart => "restart",
            OperationKind::Update => "update",
            OperationKind::UpdateConfig => "update_config",
            OperationKind::Uninstall => "uninstall",
            OperationKind::Reset => "reset",
        }
    }

    /// Statuses this operation may be requested from. Install is the only operation valid
    /// from `missing`.
    pub fn allowed_from(self) -> &'static [AppStatus] {
        match self {
            OperationKind::Install => &[AppStatus::Missing],
            OperationKind::Start => &[AppStatus::Stopped, AppStatus::Errored],
            OperationKind::Stop => &[AppStatus::Running],
            OperationKind::Restart | OperationKind::Update => {
                &[AppStatus::Running, AppStatus::Stopped]
            }
            OperationKind::UpdateConfig | OperationKind::Uninstall | OperationKind::Reset => {
                &AppStatus::SETTLED
            }
        }
    }

    pub fn permits(self, current: AppStatus) -> bool {
        self.allowed_from().contains(&current)
    }

    /// Status written before the engine is invoked. UpdateConfig only transitions when the
    /// app is running; see [`crate::lifecycle::command::LifecycleCommand::transitional_status`].
    pub fn transitional(self) -> AppStatus {
        match self {
            OperationKind::Install => AppStatus::Installing,
            OperationKind::Start => AppStatus::Starting,
            OperationKind::Stop => AppStatus::Stopping,
            OperationKind::Restart | OperationKind::UpdateConfig => AppStatus::Restarting,
            OperationKind::Update => AppStatus::Updating,
            OperationKind::Uninstall => AppStatus::Uninstalling,
            OperationKind::Reset => AppStatus::Resetting,
        }
    }

    /// Human phrasing for rejection messages ("cannot start app 'x' while it is running").
    pub fn verb(self) -> &'static str {
        match self {
            OperationKind::UpdateConfig => "update the config of",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

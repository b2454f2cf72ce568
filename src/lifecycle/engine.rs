//! Container engine boundary: compose-style commands against one app's bundle.

use crate::core::error::DeckError;
use crate::lifecycle::fs::AppFilesystem;
use crate::lifecycle::request::FormData;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::{Command, Stdio};
use std::sync::Arc;

/// Logical engine operations the lifecycle commands issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineCommand {
    /// `up -d`, optionally `--force-recreate`.
    Up { force_recreate: bool },
    /// `down`; `purge` adds `--remove-orphans --volumes --rmi all`.
    Down { purge: bool },
    /// `ps --status running --quiet`: lists running container ids.
    Ps,
}

impl EngineCommand {
    pub const UP: EngineCommand = EngineCommand::Up {
        force_recreate: false,
    };
    pub const DOWN: EngineCommand = EngineCommand::Down { purge: false };

    pub fn subcommand(self) -> &'static str {
        match self {
            EngineCommand::Up { .. } => "up",
            EngineCommand::Down { .. } => "down",
            EngineCommand::Ps => "ps",
        }
    }

    pub fn args(self) -> Vec<String> {
        let args: &[&str] = match self {
            EngineCommand::Up {
                force_recreate: false,
            } => &["-d"],
            EngineCommand::Up {
                force_recreate: true,
            } => &["-d", "--force-recreate"],
            EngineCommand::Down { purge: false } => &[],
            EngineCommand::Down { purge: true } => {
                &["--remove-orphans", "--volumes", "--rmi", "all"]
            }
            EngineCommand::Ps => &["--status", "running", "--quiet"],
        };
        args.iter().map(|a| a.to_string()).collect()
    }

    /// Re-running the command after a failure converges instead of compounding.
    pub fn is_idempotent(self) -> bool {
        matches!(self, EngineCommand::Up { .. } | EngineCommand::Ps)
    }
}

impl fmt::Display for EngineCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.subcommand())?;
        for arg in self.args() {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Raw process outcome as reported by the adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl EngineOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Executes compose-style commands for a named app. Called off the request thread; may block.
pub trait ContainerEngineAdapter: Send + Sync {
    fn run(
        &self,
        app_id: &str,
        subcommand: &str,
        args: &[String],
        form: &FormData,
    ) -> Result<EngineOutput, DeckError>;
}

/// Shells out to `<binary> compose` inside the app's bundle.
pub struct ComposeEngine {
    binary: String,
    fs: Arc<dyn AppFilesystem>,
}

impl ComposeEngine {
    pub fn new(binary: impl Into<String>, fs: Arc<dyn AppFilesystem>) -> Self {
        Self {
            binary: binary.into(),
            fs,
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Whether the configured runtime answers `--version`.
    pub fn is_available(&self) -> bool {
        command_exists(&self.binary)
    }

    fn build_args(&self, app_id: &str, subcommand: &str, args: &[String]) -> Vec<String> {
        let compose = self.fs.compose_path(app_id);
        let env = self.fs.env_path(app_id);
        let mut out = vec![
            "compose".to_string(),
            "--project-name".to_string(),
            app_id.to_string(),
            "-f".to_string(),
            compose.to_string_lossy().to_string(),
        ];
        if env.exists() {
            out.push("--env-file".to_string());
            out.push(env.to_string_lossy().to_string());
        }
        out.push(subcommand.to_string());
        out.extend(args.iter().cloned());
        out
    }
}

impl ContainerEngineAdapter for ComposeEngine {
    fn run(
        &self,
        app_id: &str,
        subcommand: &str,
        args: &[String],
        _form: &FormData,
    ) -> Result<EngineOutput, DeckError> {
        let argv = self.build_args(app_id, subcommand, args);
        let mut cmd = Command::new(&self.binary);
        cmd.args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(bundle) = self.fs.compose_path(app_id).parent() {
            if bundle.exists() {
                cmd.current_dir(bundle);
            }
        }
        let output = cmd.output().map_err(DeckError::IoError)?;
        Ok(EngineOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Pick the first available runtime, preferring `preferred`.
pub fn find_container_runtime(preferred: &str) -> Result<String, DeckError> {
    for candidate in [preferred, "docker", "podman"] {
        if command_exists(candidate) {
            return Ok(candidate.to_string());
        }
    }
    Err(DeckError::NotFound(
        "No container runtime found (docker/podman)".to_string(),
    ))
}

fn command_exists(cmd: &str) -> bool {
    Command::new(cmd)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

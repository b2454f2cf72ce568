#![allow(dead_code)]

use appdeck::core::config::DeckConfig;
use appdeck::core::error::DeckError;
use appdeck::core::locks::AppClaims;
use appdeck::core::store::Store;
use appdeck::lifecycle::{
    AppFilesystem, AppRecord, AppRecordStore, AppStatus, Completion, ContainerEngineAdapter,
    EngineOutput, EventDispatcher, FormData, LifecycleOrchestrator, LocalAppFilesystem, Outcome,
    SqliteAppStore,
};
use serde_json::json;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

/// Canned engine behaviour for one subcommand.
#[derive(Clone, Debug)]
pub enum Reply {
    Exit { code: i32, stdout: String, stderr: String },
    /// Sleep, then exit 0. Long enough sleeps outlive the dispatcher deadline.
    Hang(Duration),
    /// The adapter cannot reach the engine at all.
    Unreachable,
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Exit {
            code: 0,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn fail(stderr: &str) -> Self {
        Reply::Exit {
            code: 1,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    pub fn running() -> Self {
        Reply::Exit {
            code: 0,
            stdout: "3f2a9c1d\n".to_string(),
            stderr: String::new(),
        }
    }
}

/// Records every call and answers from a per-subcommand script. Unscripted calls exit 0 with
/// empty output (so `ps` reports stopped).
#[derive(Default)]
pub struct ScriptedEngine {
    calls: Mutex<Vec<String>>,
    script: Mutex<HashMap<String, Vec<Reply>>>,
}

impl ScriptedEngine {
    /// Queue replies for `subcommand`; the last one repeats once the queue is drained.
    pub fn on(&self, subcommand: &str, replies: Vec<Reply>) {
        self.script
            .lock()
            .unwrap()
            .insert(subcommand.to_string(), replies);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls that changed engine state (everything but `ps`).
    pub fn mutating_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !c.contains(" ps"))
            .collect()
    }

    fn next_reply(&self, subcommand: &str) -> Reply {
        let mut script = self.script.lock().unwrap();
        match script.get_mut(subcommand) {
            Some(queue) if queue.len() > 1 => queue.remove(0),
            Some(queue) if queue.len() == 1 => queue[0].clone(),
            _ => Reply::ok(),
        }
    }
}

impl ContainerEngineAdapter for ScriptedEngine {
    fn run(
        &self,
        app_id: &str,
        subcommand: &str,
        args: &[String],
        _form: &FormData,
    ) -> Result<EngineOutput, DeckError> {
        let line = format!("{} {} {}", app_id, subcommand, args.join(" "));
        self.calls.lock().unwrap().push(line.trim_end().to_string());
        match self.next_reply(subcommand) {
            Reply::Exit {
                code,
                stdout,
                stderr,
            } => Ok(EngineOutput {
                exit_code: Some(code),
                stdout,
                stderr,
            }),
            Reply::Hang(d) => {
                thread::sleep(d);
                Ok(EngineOutput {
                    exit_code: Some(0),
                    ..EngineOutput::default()
                })
            }
            Reply::Unreachable => Err(DeckError::NotFound("docker".to_string())),
        }
    }
}

pub struct Deck {
    pub temp: TempDir,
    pub engine: Arc<ScriptedEngine>,
    pub records: Arc<dyn AppRecordStore>,
    pub fs: Arc<dyn AppFilesystem>,
    pub dispatcher: Arc<EventDispatcher>,
    pub claims: Arc<AppClaims>,
    pub orchestrator: LifecycleOrchestrator,
}

/// A second orchestrator over the same data root, as another appdeck process would see it.
pub struct Peer {
    pub engine: Arc<ScriptedEngine>,
    pub orchestrator: LifecycleOrchestrator,
}

pub fn deck() -> Deck {
    deck_with(Duration::from_secs(5), 0)
}

pub fn deck_with(timeout: Duration, up_retries: u32) -> Deck {
    let temp = TempDir::new().unwrap();
    let root = temp.path().to_path_buf();
    let store = Store::new(&root, &DeckConfig::default());
    let fs: Arc<dyn AppFilesystem> = Arc::new(LocalAppFilesystem::new(store.clone()));
    let records: Arc<dyn AppRecordStore> = Arc::new(SqliteAppStore::open(&root).unwrap());
    let claims = Arc::new(AppClaims::new(store.claims_dir()));
    let engine = Arc::new(ScriptedEngine::default());
    let dispatcher = Arc::new(
        EventDispatcher::new(engine.clone(), timeout).with_audit_log(store.dispatch_log_path()),
    );
    let orchestrator = LifecycleOrchestrator::new(
        Arc::clone(&records),
        Arc::clone(&fs),
        Arc::clone(&dispatcher),
        Arc::clone(&claims),
        up_retries,
    );
    Deck {
        temp,
        engine,
        records,
        fs,
        dispatcher,
        claims,
        orchestrator,
    }
}

impl Deck {
    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    /// Publish `id` at `version` in the catalog.
    pub fn catalog(&self, id: &str, version: u32) {
        let entry = self.root().join("catalog").join(id);
        fs::create_dir_all(&entry).unwrap();
        let manifest = json!({
            "id": id,
            "name": id,
            "version": version,
            "port": 8080,
            "form_fields": [{"env_variable": "TITLE", "default": "untitled"}],
        });
        fs::write(entry.join("manifest.json"), manifest.to_string()).unwrap();
        fs::write(
            entry.join("docker-compose.yml"),
            format!("# {} v{}\nservices: {{}}\n", id, version),
        )
        .unwrap();
    }

    /// An app installed at catalog version 1, resting in `status`.
    pub fn installed(&self, id: &str, status: AppStatus) -> AppRecord {
        self.catalog(id, 1);
        self.fs.install_compose(id).unwrap();
        self.fs.create_data_dir(id).unwrap();
        self.records
            .create(AppRecord::new(
                id,
                status,
                1,
                json!({}),
                self.fs.compose_path(id),
            ))
            .unwrap()
    }

    /// Everything opened afresh on this deck's root, with its own engine.
    pub fn peer(&self) -> Peer {
        let store = Store::new(self.root(), &DeckConfig::default());
        let engine = Arc::new(ScriptedEngine::default());
        let orchestrator = LifecycleOrchestrator::new(
            Arc::new(SqliteAppStore::open(self.root()).unwrap()),
            Arc::new(LocalAppFilesystem::new(store.clone())),
            Arc::new(EventDispatcher::new(engine.clone(), self.dispatcher.timeout())),
            Arc::new(AppClaims::new(store.claims_dir())),
            0,
        );
        Peer {
            engine,
            orchestrator,
        }
    }

    pub fn status(&self, id: &str) -> Option<AppStatus> {
        self.records.get(id).unwrap().map(|r| r.status)
    }

    pub fn record(&self, id: &str) -> AppRecord {
        self.records.get(id).unwrap().unwrap()
    }
}

/// Unwrap an accepted outcome and wait for it.
pub fn settle(outcome: Outcome) -> Result<Completion, appdeck::lifecycle::LifecycleError> {
    match outcome {
        Outcome::Accepted { ack, handle } => {
            assert!(ack.accepted);
            handle.wait()
        }
        Outcome::Completed { .. } => panic!("expected a background operation"),
    }
}

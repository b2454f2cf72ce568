mod support;

use appdeck::core::schemas;
use appdeck::lifecycle::{AppStatus, Completion, FormData, LifecycleError, OperationKind, Outcome};
use serde_json::{Map, Value, json};
use std::fs;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use support::{Reply, deck, deck_with, settle};

fn form(pairs: &[(&str, &str)]) -> FormData {
    let mut values = Map::new();
    for (k, v) in pairs {
        values.insert(k.to_string(), Value::String(v.to_string()));
    }
    FormData::with_values(values)
}

#[test]
fn test_start_stopped_app_reaches_running() {
    let d = deck();
    d.installed("photos", AppStatus::Stopped);
    d.engine.on("up", vec![Reply::Hang(Duration::from_millis(200))]);

    let outcome = d
        .orchestrator
        .execute("photos", OperationKind::Start, FormData::default())
        .unwrap();
    match &outcome {
        Outcome::Accepted { ack, .. } => {
            assert!(ack.accepted);
            assert_eq!(ack.app_id, "photos");
            assert_eq!(ack.operation, OperationKind::Start);
        }
        Outcome::Completed { .. } => panic!("start must run in the background"),
    }
    assert_eq!(d.status("photos"), Some(AppStatus::Starting));

    assert_eq!(settle(outcome).unwrap(), Completion::Status(AppStatus::Running));
    assert_eq!(d.status("photos"), Some(AppStatus::Running));
    assert_eq!(d.engine.mutating_calls(), vec!["photos up -d"]);
    assert!(d.record("photos").last_error.is_none());
}

#[test]
fn test_start_while_running_is_rejected_without_dispatch() {
    let d = deck();
    d.installed("photos", AppStatus::Running);

    let err = d
        .orchestrator
        .execute("photos", OperationKind::Start, FormData::default())
        .unwrap_err();
    assert_eq!(
        err,
        LifecycleError::InvalidTransition {
            app_id: "photos".to_string(),
            operation: OperationKind::Start,
            status: AppStatus::Running,
        }
    );
    assert_eq!(err.to_string(), "cannot start app 'photos' while it is running");
    assert!(d.engine.calls().is_empty());
    assert_eq!(d.status("photos"), Some(AppStatus::Running));
}

#[test]
fn test_second_start_during_first_is_rejected() {
    let d = deck();
    d.installed("photos", AppStatus::Stopped);
    d.engine.on("up", vec![Reply::Hang(Duration::from_millis(300))]);

    let first = d
        .orchestrator
        .execute("photos", OperationKind::Start, FormData::default())
        .unwrap();
    let second = d
        .orchestrator
        .execute("photos", OperationKind::Start, FormData::default())
        .unwrap_err();
    assert_eq!(second.kind(), "invalid_transition");
    assert!(second.to_string().contains("starting"));

    settle(first).unwrap();
    assert_eq!(d.engine.mutating_calls().len(), 1);
    assert_eq!(d.status("photos"), Some(AppStatus::Running));
}

#[test]
fn test_concurrent_requests_for_one_app_accept_exactly_one() {
    let d = Arc::new(deck());
    d.installed("photos", AppStatus::Stopped);
    d.engine.on("up", vec![Reply::Hang(Duration::from_millis(100))]);

    let barrier = Arc::new(Barrier::new(6));
    let workers: Vec<_> = (0..6)
        .map(|_| {
            let d = Arc::clone(&d);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                d.orchestrator
                    .execute("photos", OperationKind::Start, FormData::default())
                    .map(|o| o.wait())
            })
        })
        .collect();

    let mut accepted = 0;
    for w in workers {
        match w.join().unwrap() {
            Ok(done) => {
                assert_eq!(done.unwrap(), Completion::Status(AppStatus::Running));
                accepted += 1;
            }
            Err(e) => assert_eq!(e.kind(), "invalid_transition"),
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(d.engine.mutating_calls().len(), 1);
}

#[test]
fn test_different_apps_do_not_block_each_other() {
    let d = deck();
    d.installed("photos", AppStatus::Stopped);
    d.installed("notes", AppStatus::Stopped);
    d.engine.on("up", vec![Reply::Hang(Duration::from_millis(300))]);

    let a = d
        .orchestrator
        .execute("photos", OperationKind::Start, FormData::default())
        .unwrap();
    let b = d
        .orchestrator
        .execute("notes", OperationKind::Start, FormData::default())
        .unwrap();
    assert_eq!(d.status("photos"), Some(AppStatus::Starting));
    assert_eq!(d.status("notes"), Some(AppStatus::Starting));

    settle(a).unwrap();
    settle(b).unwrap();
    assert_eq!(d.status("photos"), Some(AppStatus::Running));
    assert_eq!(d.status("notes"), Some(AppStatus::Running));
}

#[test]
fn test_install_renders_bundle_and_runs() {
    let d = deck();
    d.catalog("blog", 3);

    let outcome = d
        .orchestrator
        .execute("blog", OperationKind::Install, form(&[("TITLE", "Notes")]))
        .unwrap();
    assert_eq!(settle(outcome).unwrap(), Completion::Status(AppStatus::Running));

    let rec = d.record("blog");
    assert_eq!(rec.status, AppStatus::Running);
    assert_eq!(rec.version, 3);
    assert_eq!(rec.config, json!({"TITLE": "Notes"}));
    assert_eq!(rec.compose_path, d.fs.compose_path("blog"));

    let env = fs::read_to_string(d.fs.env_path("blog")).unwrap();
    assert!(env.contains("TITLE=Notes"));
    assert!(env.contains("APP_ID=blog"));
    assert!(env.contains("APP_PORT=8080"));
    assert!(d.fs.data_dir("blog").is_dir());
    assert_eq!(d.engine.mutating_calls(), vec!["blog up -d"]);
}

#[test]
fn test_install_engine_failure_leaves_errored_with_files() {
    let d = deck();
    d.catalog("blog", 1);
    d.engine.on("up", vec![Reply::fail("pull access denied for blog")]);

    let outcome = d
        .orchestrator
        .execute("blog", OperationKind::Install, FormData::default())
        .unwrap();
    let err = settle(outcome).unwrap_err();
    assert_eq!(err.kind(), "engine_dispatch_failure");
    assert_eq!(err.app_id(), "blog");

    let rec = d.record("blog");
    assert_eq!(rec.status, AppStatus::Errored);
    assert!(rec.last_error.unwrap().contains("pull access denied"));
    assert!(d.fs.compose_path("blog").exists());
    assert!(d.fs.data_dir("blog").exists());
}

#[test]
fn test_install_rejections() {
    let d = deck();
    let err = d
        .orchestrator
        .execute("ghost", OperationKind::Install, FormData::default())
        .unwrap_err();
    assert_eq!(err.kind(), "app_not_found");
    assert!(d.status("ghost").is_none());

    d.installed("photos", AppStatus::Running);
    let err = d
        .orchestrator
        .execute("photos", OperationKind::Install, FormData::default())
        .unwrap_err();
    assert_eq!(err.kind(), "already_installed");

    let err = d
        .orchestrator
        .execute("ghost", OperationKind::Start, FormData::default())
        .unwrap_err();
    assert_eq!(err.kind(), "app_not_found");
    assert!(d.engine.calls().is_empty());
}

#[test]
fn test_prepare_failure_skips_engine_and_marks_errored() {
    let d = deck();
    d.catalog("blog", 1);
    fs::remove_file(d.root().join("catalog/blog/docker-compose.yml")).unwrap();

    let err = d
        .orchestrator
        .execute("blog", OperationKind::Install, FormData::default())
        .unwrap_err();
    assert_eq!(err.kind(), "filesystem_failure");
    assert_eq!(d.status("blog"), Some(AppStatus::Errored));
    assert!(d.engine.calls().is_empty());
}

#[test]
fn test_restart_timeout_reconciles_from_engine_state() {
    let d = deck_with(Duration::from_millis(100), 0);
    d.installed("notes", AppStatus::Running);
    d.engine.on("down", vec![Reply::Hang(Duration::from_millis(500))]);

    let outcome = d
        .orchestrator
        .execute("notes", OperationKind::Restart, FormData::default())
        .unwrap();
    let err = settle(outcome).unwrap_err();
    assert_eq!(err.kind(), "engine_timeout");

    // `ps` answered with no containers: observed stopped, never assumed running.
    let rec = d.record("notes");
    assert_eq!(rec.status, AppStatus::Stopped);
    assert!(rec.last_error.unwrap().contains("timed out"));
    assert!(!d.engine.calls().iter().any(|c| c.contains("up -d")));
}

#[test]
fn test_timeout_with_unreachable_state_is_errored() {
    let d = deck_with(Duration::from_millis(100), 0);
    d.installed("notes", AppStatus::Running);
    d.engine.on("down", vec![Reply::Hang(Duration::from_millis(500))]);
    d.engine.on("ps", vec![Reply::Hang(Duration::from_millis(500))]);

    let outcome = d
        .orchestrator
        .execute("notes", OperationKind::Restart, FormData::default())
        .unwrap();
    assert_eq!(settle(outcome).unwrap_err().kind(), "engine_timeout");
    assert_eq!(d.status("notes"), Some(AppStatus::Errored));
}

#[test]
fn test_failure_columns_per_operation() {
    let cases = [
        (OperationKind::Start, AppStatus::Stopped, AppStatus::Stopped),
        (OperationKind::Stop, AppStatus::Running, AppStatus::Errored),
        (OperationKind::Restart, AppStatus::Running, AppStatus::Stopped),
        (OperationKind::Reset, AppStatus::Running, AppStatus::Stopped),
    ];
    for (op, from, expected) in cases {
        let d = deck();
        d.installed("photos", from);
        d.engine.on("up", vec![Reply::fail("boom")]);
        d.engine.on("down", vec![Reply::fail("boom")]);

        let outcome = d
            .orchestrator
            .execute("photos", op, FormData::default())
            .unwrap();
        assert!(settle(outcome).is_err(), "{} should fail", op);
        let status = d.status("photos").unwrap();
        assert_eq!(status, expected, "{} failure", op);
        assert!(!status.is_transitional());
    }
}

#[test]
fn test_no_transitional_status_survives_any_operation() {
    let ops = [
        (OperationKind::Start, AppStatus::Stopped),
        (OperationKind::Stop, AppStatus::Running),
        (OperationKind::Restart, AppStatus::Stopped),
        (OperationKind::Reset, AppStatus::Errored),
        (OperationKind::UpdateConfig, AppStatus::Running),
    ];
    for reply in [Reply::ok(), Reply::fail("exit 1"), Reply::Unreachable] {
        for (op, from) in ops {
            let d = deck();
            d.installed("photos", from);
            d.engine.on("up", vec![reply.clone()]);
            d.engine.on("down", vec![reply.clone()]);

            let outcome = d
                .orchestrator
                .execute("photos", op, FormData::default())
                .unwrap();
            let _ = outcome.wait();
            let status = d.status("photos").unwrap();
            assert!(!status.is_transitional(), "{} left {}", op, status);
        }
    }
}

#[test]
fn test_up_retries_only_when_configured() {
    let d = deck_with(Duration::from_secs(5), 2);
    d.installed("photos", AppStatus::Stopped);
    d.engine.on(
        "up",
        vec![Reply::fail("port busy"), Reply::fail("port busy"), Reply::ok()],
    );
    let outcome = d
        .orchestrator
        .execute("photos", OperationKind::Start, FormData::default())
        .unwrap();
    assert_eq!(settle(outcome).unwrap(), Completion::Status(AppStatus::Running));
    assert_eq!(d.engine.mutating_calls().len(), 3);

    let d = deck();
    d.installed("photos", AppStatus::Stopped);
    d.engine.on("up", vec![Reply::fail("port busy"), Reply::ok()]);
    let outcome = d
        .orchestrator
        .execute("photos", OperationKind::Start, FormData::default())
        .unwrap();
    assert!(settle(outcome).is_err());
    assert_eq!(d.engine.mutating_calls().len(), 1);
    assert_eq!(d.status("photos"), Some(AppStatus::Stopped));
}

#[test]
fn test_stop_is_never_retried() {
    let d = deck_with(Duration::from_secs(5), 3);
    d.installed("photos", AppStatus::Running);
    d.engine.on("down", vec![Reply::fail("busy")]);
    let outcome = d
        .orchestrator
        .execute("photos", OperationKind::Stop, FormData::default())
        .unwrap();
    assert!(settle(outcome).is_err());
    assert_eq!(d.engine.mutating_calls(), vec!["photos down"]);
}

#[test]
fn test_restart_runs_down_then_up() {
    let d = deck();
    d.installed("photos", AppStatus::Running);
    let outcome = d
        .orchestrator
        .execute("photos", OperationKind::Restart, FormData::default())
        .unwrap();
    settle(outcome).unwrap();
    assert_eq!(d.engine.mutating_calls(), vec!["photos down", "photos up -d"]);

    let d = deck();
    d.installed("photos", AppStatus::Running);
    d.engine.on("down", vec![Reply::fail("no such project")]);
    let outcome = d
        .orchestrator
        .execute("photos", OperationKind::Restart, FormData::default())
        .unwrap();
    settle(outcome).unwrap_err();
    assert_eq!(d.engine.mutating_calls(), vec!["photos down"]);
}

#[test]
fn test_update_bumps_version_and_backs_up() {
    let d = deck();
    d.installed("photos", AppStatus::Running);
    fs::write(d.fs.data_dir("photos").join("library.db"), "rows").unwrap();

    let err = d
        .orchestrator
        .execute("photos", OperationKind::Update, FormData::default())
        .unwrap_err();
    assert_eq!(err.kind(), "no_update_available");

    d.catalog("photos", 2);
    let request = FormData {
        backup: true,
        ..FormData::default()
    };
    let outcome = d
        .orchestrator
        .execute("photos", OperationKind::Update, request)
        .unwrap();
    assert_eq!(settle(outcome).unwrap(), Completion::Status(AppStatus::Running));

    let rec = d.record("photos");
    assert_eq!(rec.version, 2);
    let compose = fs::read_to_string(d.fs.compose_path("photos")).unwrap();
    assert!(compose.contains("photos v2"));
    assert_eq!(
        d.engine.mutating_calls(),
        vec!["photos up -d --force-recreate"]
    );

    let snapshots: Vec<_> = fs::read_dir(d.root().join("backups/photos"))
        .unwrap()
        .collect();
    assert_eq!(snapshots.len(), 1);
    let snapshot = snapshots[0].as_ref().unwrap().path();
    assert_eq!(
        fs::read_to_string(snapshot.join("data/library.db")).unwrap(),
        "rows"
    );
}

#[test]
fn test_update_config_on_stopped_app_is_synchronous() {
    let d = deck();
    d.installed("blog", AppStatus::Stopped);

    let outcome = d
        .orchestrator
        .execute("blog", OperationKind::UpdateConfig, form(&[("TITLE", "Field notes")]))
        .unwrap();
    match &outcome {
        Outcome::Completed { status, .. } => assert_eq!(*status, AppStatus::Stopped),
        Outcome::Accepted { .. } => panic!("nothing to dispatch for a stopped app"),
    }
    assert_eq!(outcome.to_json()["success"], true);

    let rec = d.record("blog");
    assert_eq!(rec.status, AppStatus::Stopped);
    assert_eq!(rec.config, json!({"TITLE": "Field notes"}));
    let env = fs::read_to_string(d.fs.env_path("blog")).unwrap();
    assert!(env.contains("TITLE=Field notes"));
    assert!(d.engine.calls().is_empty());
}

#[test]
fn test_update_config_on_running_app_recreates() {
    let d = deck();
    d.installed("blog", AppStatus::Running);
    d.engine.on("up", vec![Reply::Hang(Duration::from_millis(200))]);

    let outcome = d
        .orchestrator
        .execute("blog", OperationKind::UpdateConfig, form(&[("TITLE", "x")]))
        .unwrap();
    assert_eq!(d.status("blog"), Some(AppStatus::Restarting));
    assert_eq!(settle(outcome).unwrap(), Completion::Status(AppStatus::Running));
    assert_eq!(d.engine.mutating_calls(), vec!["blog up -d"]);
}

#[test]
fn test_reset_wipes_data_and_cycles() {
    let d = deck();
    d.installed("notes", AppStatus::Errored);
    let stale = d.fs.data_dir("notes").join("cache.bin");
    fs::write(&stale, "stale").unwrap();

    let outcome = d
        .orchestrator
        .execute("notes", OperationKind::Reset, FormData::default())
        .unwrap();
    assert_eq!(settle(outcome).unwrap(), Completion::Status(AppStatus::Running));
    assert!(!stale.exists());
    assert!(d.fs.data_dir("notes").is_dir());
    assert_eq!(d.engine.mutating_calls(), vec!["notes down", "notes up -d"]);
}

#[test]
fn test_uninstall_removes_record_despite_engine_failure() {
    let d = deck();
    d.installed("photos", AppStatus::Stopped);
    d.engine.on("down", vec![Reply::fail("no such project")]);

    let outcome = d
        .orchestrator
        .execute("photos", OperationKind::Uninstall, FormData::default())
        .unwrap();
    assert_eq!(settle(outcome).unwrap(), Completion::Removed);
    assert!(d.status("photos").is_none());
    assert!(!d.fs.compose_path("photos").exists());
    assert!(!d.fs.data_dir("photos").exists());
    assert_eq!(
        d.engine.mutating_calls(),
        vec!["photos down --remove-orphans --volumes --rmi all"]
    );
}

#[test]
fn test_uninstall_keeps_record_when_local_removal_fails() {
    let d = deck();
    d.installed("photos", AppStatus::Running);
    // A file where the bundle directory should be cannot be removed as a directory.
    let bundle = d.fs.compose_path("photos").parent().unwrap().to_path_buf();
    fs::remove_dir_all(&bundle).unwrap();
    fs::write(&bundle, "not a directory").unwrap();

    let outcome = d
        .orchestrator
        .execute("photos", OperationKind::Uninstall, FormData::default())
        .unwrap();
    let err = settle(outcome).unwrap_err();
    assert_eq!(err.kind(), "filesystem_failure");

    let rec = d.record("photos");
    assert_eq!(rec.status, AppStatus::Errored);
    assert!(rec.last_error.is_some());
}

#[test]
fn test_dispatches_are_audited() {
    let d = deck();
    d.installed("photos", AppStatus::Stopped);
    let outcome = d
        .orchestrator
        .execute("photos", OperationKind::Start, FormData::default())
        .unwrap();
    settle(outcome).unwrap();

    let raw = fs::read_to_string(d.root().join("dispatch.events.jsonl")).unwrap();
    let events: Vec<Value> = raw
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["app_id"], "photos");
    assert_eq!(events[0]["command"], "up -d");
    assert_eq!(events[0]["outcome"], "success");
}

#[test]
fn test_errors_serialize_with_kind_and_app() {
    let d = deck();
    d.installed("photos", AppStatus::Stopped);
    let err = d
        .orchestrator
        .execute("photos", OperationKind::Stop, FormData::default())
        .unwrap_err();
    let payload = err.to_json();
    assert_eq!(payload["error"], "invalid_transition");
    assert_eq!(payload["app_id"], "photos");
    assert_eq!(
        payload["message"],
        "cannot stop app 'photos' while it is stopped"
    );
}

#[test]
fn test_operation_in_flight_is_not_reconciled_by_another_process() {
    let d = deck();
    d.catalog("blog", 1);
    d.engine.on("up", vec![Reply::Hang(Duration::from_millis(800))]);
    let outcome = d
        .orchestrator
        .execute("blog", OperationKind::Install, FormData::default())
        .unwrap();

    let peer = d.peer();
    assert!(peer.orchestrator.reconcile().unwrap().is_empty());
    assert!(d.orchestrator.reconcile().unwrap().is_empty());
    assert_eq!(d.status("blog"), Some(AppStatus::Installing));

    let err = peer
        .orchestrator
        .execute("blog", OperationKind::Start, FormData::default())
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_transition");
    assert!(peer.engine.calls().is_empty());

    assert_eq!(settle(outcome).unwrap(), Completion::Status(AppStatus::Running));
    assert_eq!(d.engine.mutating_calls(), vec!["blog up -d"]);
}

#[test]
fn test_timed_out_engine_call_keeps_app_busy_until_it_exits() {
    let d = deck_with(Duration::from_millis(100), 0);
    d.installed("notes", AppStatus::Running);
    d.engine.on("down", vec![Reply::Hang(Duration::from_millis(600))]);

    let started = Instant::now();
    let outcome = d
        .orchestrator
        .execute("notes", OperationKind::Restart, FormData::default())
        .unwrap();
    thread::sleep(Duration::from_millis(300));

    // Deadline passed, `down` still running: the app is neither settled nor open to new work.
    let rec = d.record("notes");
    assert_eq!(rec.status, AppStatus::Restarting);
    assert!(rec.last_error.unwrap().contains("timed out"));
    let err = d
        .orchestrator
        .execute("notes", OperationKind::Start, FormData::default())
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_transition");
    assert!(d.orchestrator.reconcile().unwrap().is_empty());

    assert_eq!(settle(outcome).unwrap_err().kind(), "engine_timeout");
    assert!(started.elapsed() >= Duration::from_millis(600));
    assert_eq!(d.status("notes"), Some(AppStatus::Stopped));

    let outcome = d
        .orchestrator
        .execute("notes", OperationKind::Start, FormData::default())
        .unwrap();
    assert_eq!(settle(outcome).unwrap(), Completion::Status(AppStatus::Running));
    assert_eq!(
        d.engine.calls(),
        vec![
            "notes down",
            "notes ps --status running --quiet",
            "notes up -d"
        ]
    );
}

#[test]
fn test_form_values_cannot_inject_env_lines() {
    let d = deck();
    d.catalog("blog", 1);

    let err = d
        .orchestrator
        .execute(
            "blog",
            OperationKind::Install,
            form(&[("TITLE", "x\nAPP_DATA_DIR=/")]),
        )
        .unwrap_err();
    assert_eq!(err.kind(), "filesystem_failure");
    assert!(d.status("blog").is_none());
    assert!(!d.fs.env_path("blog").exists());
    assert!(d.engine.calls().is_empty());

    let err = d
        .orchestrator
        .execute("blog", OperationKind::Install, form(&[("BAD KEY", "x")]))
        .unwrap_err();
    assert_eq!(err.kind(), "filesystem_failure");
    assert!(d.status("blog").is_none());
}

#[test]
fn test_form_cannot_override_owned_variables() {
    let d = deck();
    d.installed("blog", AppStatus::Stopped);

    d.orchestrator
        .execute(
            "blog",
            OperationKind::UpdateConfig,
            form(&[("APP_DATA_DIR", "/"), ("APP_ID", "other"), ("TITLE", "ok")]),
        )
        .unwrap();
    let env = fs::read_to_string(d.fs.env_path("blog")).unwrap();
    let data_dir = format!("APP_DATA_DIR={}", d.fs.data_dir("blog").display());
    let data_lines: Vec<&str> = env.lines().filter(|l| l.starts_with("APP_DATA_DIR=")).collect();
    assert_eq!(data_lines, vec![data_dir.as_str()]);
    assert!(env.lines().any(|l| l == "APP_ID=blog"));
    assert!(env.lines().any(|l| l == "TITLE=ok"));
}

#[test]
fn test_broken_audit_log_does_not_strand_operations() {
    let d = deck();
    d.installed("photos", AppStatus::Stopped);
    let audit = d.root().join(schemas::BROKER_EVENTS_NAME);
    let _ = fs::remove_file(&audit);
    fs::create_dir(&audit).unwrap();

    let outcome = d
        .orchestrator
        .execute("photos", OperationKind::Start, FormData::default())
        .unwrap();
    assert_eq!(settle(outcome).unwrap(), Completion::Status(AppStatus::Running));
    assert_eq!(d.status("photos"), Some(AppStatus::Running));
}

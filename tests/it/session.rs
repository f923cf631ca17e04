//! Session artifact layout, finalizer idempotence and wire round-trips.

use crate::utils::{enter, leave, leave_raising, quiet_config};
use flowtrace::tracing::{CallRecord, Instrumentor, SessionArtifact};

#[test]
fn artifact_has_the_documented_layout() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Instrumentor::new(quiet_config(&dir));
    engine.enable().unwrap();

    assert!(enter(&engine, "app.db.repository", "save").is_trace());
    leave(&engine, "app.db.repository", "save");
    assert!(enter(&engine, "app.web", "render").is_trace());
    leave_raising(&engine, "app.web", "render", "KeyError", "missing");
    engine.disable();

    let path = dir.path().join(format!("session_{}.json", engine.session_id()));
    let raw = std::fs::read(&path).unwrap();

    // loose layout check against the documented keys
    let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    for key in [
        "session_id",
        "language",
        "process_id",
        "started_at",
        "ended_at",
        "total_calls",
        "registered_methods",
        "calls",
    ] {
        assert!(value.get(key).is_some(), "missing artifact key {key}");
    }

    // and a strict one through the typed artifact
    let artifact: SessionArtifact = serde_json::from_slice(&raw).unwrap();
    assert_eq!(artifact.session_id, engine.session_id());
    assert_eq!(artifact.language, "python");
    assert_eq!(artifact.process_id, std::process::id());
    assert_eq!(artifact.total_calls, 2);
    assert_eq!(artifact.calls.len(), 2);
    assert_eq!(artifact.registered_methods.len(), 2);
    // the registry snapshot is sorted
    assert!(artifact.registered_methods[0] <= artifact.registered_methods[1]);

    let render = artifact.calls.iter().find(|c| c.function == "render").unwrap();
    assert_eq!(render.exception_kind.as_deref(), Some("KeyError"));
    let save = artifact.calls.iter().find(|c| c.function == "save").unwrap();
    assert_eq!(save.protocol.map(|p| p.to_str()), Some("SQL"));
}

#[test]
fn repeated_finalization_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Instrumentor::new(quiet_config(&dir));
    engine.enable().unwrap();

    assert!(enter(&engine, "app.mod", "f").is_trace());
    leave(&engine, "app.mod", "f");
    engine.disable();

    let path = dir.path().join(format!("session_{}.json", engine.session_id()));
    let first = std::fs::read(&path).unwrap();

    engine.disable();
    let again = engine.session().finalize(dir.path(), true).unwrap();
    assert_eq!(again, path);
    assert_eq!(std::fs::read(&path).unwrap(), first);
}

#[test]
fn no_temp_files_survive_finalization() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Instrumentor::new(quiet_config(&dir));
    engine.enable().unwrap();
    assert!(enter(&engine, "app.mod", "f").is_trace());
    leave(&engine, "app.mod", "f");
    engine.disable();

    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().into_string().unwrap())
        .filter(|name| name.ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");
}

#[test]
fn summary_artifact_aggregates_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Instrumentor::new(quiet_config(&dir));
    engine.enable().unwrap();

    for _ in 0..3 {
        assert!(enter(&engine, "app.db", "query").is_trace());
        leave(&engine, "app.db", "query");
    }
    assert!(enter(&engine, "app.web", "render").is_trace());
    leave_raising(&engine, "app.web", "render", "KeyError", "missing");
    engine.disable();

    let summary: serde_json::Value = serde_json::from_slice(
        &std::fs::read(dir.path().join(format!("summary_{}.json", engine.session_id()))).unwrap(),
    )
    .unwrap();
    assert_eq!(summary["session_id"], engine.session_id());
    assert_eq!(summary["total_calls"], 4);

    let functions = summary["functions"].as_array().unwrap();
    assert_eq!(functions.len(), 2);
    let query = functions.iter().find(|f| f["function"] == "query").unwrap();
    assert_eq!(query["calls"], 3);
    assert_eq!(query["errors"], 0);
    let render = functions.iter().find(|f| f["function"] == "render").unwrap();
    assert_eq!(render["errors"], 1);
}

#[test]
fn summary_can_be_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Instrumentor::new(quiet_config(&dir).set_write_summary(false));
    engine.enable().unwrap();
    assert!(enter(&engine, "app.mod", "f").is_trace());
    leave(&engine, "app.mod", "f");
    engine.disable();

    assert!(dir.path().join(format!("session_{}.json", engine.session_id())).exists());
    assert!(!dir.path().join(format!("summary_{}.json", engine.session_id())).exists());
}

#[test]
fn call_record_round_trips_through_the_wire_form() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Instrumentor::new(quiet_config(&dir));
    engine.enable().unwrap();

    assert!(enter(&engine, "app.events.kafka", "on_message").is_trace());
    leave_raising(&engine, "app.events.kafka", "on_message", "TimeoutError", "late");

    let original = engine.session().completed_records().remove(0);
    let line = serde_json::to_string(&original).unwrap();
    let parsed: CallRecord = serde_json::from_str(&line).unwrap();
    assert_eq!(parsed, original);

    // optional fields absent on the wire parse back as absent
    assert_eq!(parsed.arguments, None);
    assert_eq!(parsed.return_value, None);
    assert_eq!(parsed.protocol.map(|p| p.to_str()), Some("KAFKA"));
    assert_eq!(parsed.invocation_type.to_str(), "EVENT_HANDLER");
}

#[test]
fn trace_directory_is_created_on_demand() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("deep").join("traces");
    let engine =
        Instrumentor::new(quiet_config(&dir).set_trace_dir(&nested));
    engine.enable().unwrap();
    assert!(enter(&engine, "app.mod", "f").is_trace());
    leave(&engine, "app.mod", "f");
    engine.disable();

    assert!(nested.join(format!("session_{}.json", engine.session_id())).exists());
}

//! Stream-server behavior over real loopback sockets.

use crate::utils::{enter, leave, streaming_config, wait_for, Subscriber};
use flowtrace::tracing::{Instrumentor, TraceEvent};
use std::time::Duration;

fn streaming_engine(dir: &tempfile::TempDir) -> Instrumentor {
    let engine = Instrumentor::new(streaming_config(dir));
    engine.enable().unwrap();
    engine
}

#[test]
fn fan_out_delivers_snapshot_then_live_events() {
    let dir = tempfile::tempdir().unwrap();
    let engine = streaming_engine(&dir);
    let port = engine.stream_port().unwrap();

    let mut first = Subscriber::connect(port);
    let mut second = Subscriber::connect(port);
    wait_for("both subscribers", || engine.subscriber_count() == 2);

    assert!(enter(&engine, "app.mod", "f").is_trace());
    leave(&engine, "app.mod", "f");

    for subscriber in [&mut first, &mut second] {
        let TraceEvent::FunctionRegistry(snapshot) = subscriber.read_event() else {
            panic!("expected the registry snapshot first");
        };
        assert_eq!(snapshot.meta.session_id, engine.session_id());
        assert_eq!(snapshot.meta.process_id, std::process::id());

        let TraceEvent::Call(call) = subscriber.read_event() else {
            panic!("expected the call event");
        };
        assert_eq!(call.module, "app.mod");
        assert_eq!(call.function, "f");
        assert_eq!(call.depth, 0);

        let TraceEvent::Return(ret) = subscriber.read_event() else {
            panic!("expected the return event");
        };
        assert_eq!(ret.call_id, call.call_id);
        assert!(ret.duration_ms >= 0.0);
    }

    // closing the engine gives every subscriber a clean EOF
    engine.disable();
    assert_eq!(first.read_line(), None);
    assert_eq!(second.read_line(), None);
}

#[test]
fn snapshot_reflects_methods_registered_before_connect() {
    let dir = tempfile::tempdir().unwrap();
    let engine = streaming_engine(&dir);

    assert!(enter(&engine, "app.mod", "early").is_trace());
    leave(&engine, "app.mod", "early");

    let mut subscriber = Subscriber::connect(engine.stream_port().unwrap());
    let TraceEvent::FunctionRegistry(snapshot) = subscriber.read_event() else {
        panic!("expected the registry snapshot first");
    };
    assert_eq!(snapshot.total_calls, 1);
    assert!(snapshot
        .methods
        .iter()
        .any(|m| m.module == "app.mod" && m.function == "early"));
    engine.disable();
}

#[test]
fn get_registry_control_returns_a_fresh_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let engine = streaming_engine(&dir);

    let mut subscriber = Subscriber::connect(engine.stream_port().unwrap());
    wait_for("subscriber", || engine.subscriber_count() == 1);
    let TraceEvent::FunctionRegistry(initial) = subscriber.read_event() else {
        panic!("expected the registry snapshot first");
    };
    assert_eq!(initial.total_calls, 0);

    assert!(enter(&engine, "app.mod", "f").is_trace());
    leave(&engine, "app.mod", "f");
    let _call = subscriber.read_event();
    let _ret = subscriber.read_event();

    subscriber.send_control(r#"{"type":"get_registry"}"#);
    let TraceEvent::FunctionRegistry(refreshed) = subscriber.read_event() else {
        panic!("expected a refreshed registry snapshot");
    };
    assert_eq!(refreshed.total_calls, 1);
    engine.disable();
}

#[test]
fn pause_and_resume_gate_the_relay() {
    let dir = tempfile::tempdir().unwrap();
    let engine = streaming_engine(&dir);

    let mut subscriber = Subscriber::connect(engine.stream_port().unwrap());
    wait_for("subscriber", || engine.subscriber_count() == 1);
    let _snapshot = subscriber.read_event();

    // the registry response doubles as a barrier: once it arrives, the
    // pause before it has been applied
    subscriber.send_control(r#"{"type":"pause"}"#);
    subscriber.send_control(r#"{"type":"get_registry"}"#);
    let TraceEvent::FunctionRegistry(_) = subscriber.read_event() else {
        panic!("expected the barrier snapshot");
    };

    assert!(enter(&engine, "app.mod", "missed").is_trace());
    leave(&engine, "app.mod", "missed");
    assert!(subscriber.poll_event(Duration::from_millis(300)).is_none());

    subscriber.send_control(r#"{"type":"resume"}"#);
    subscriber.send_control(r#"{"type":"get_registry"}"#);
    let TraceEvent::FunctionRegistry(_) = subscriber.read_event() else {
        panic!("expected the barrier snapshot");
    };

    assert!(enter(&engine, "app.mod", "seen").is_trace());
    leave(&engine, "app.mod", "seen");
    let TraceEvent::Call(call) = subscriber.read_event() else {
        panic!("expected the call emitted after resume");
    };
    assert_eq!(call.function, "seen");
    engine.disable();
}

#[test]
fn unknown_control_messages_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let engine = streaming_engine(&dir);

    let mut subscriber = Subscriber::connect(engine.stream_port().unwrap());
    wait_for("subscriber", || engine.subscriber_count() == 1);
    let _snapshot = subscriber.read_event();

    subscriber.send_control(r#"{"type":"warp"}"#);
    subscriber.send_control("not json at all");

    assert!(enter(&engine, "app.mod", "f").is_trace());
    leave(&engine, "app.mod", "f");
    let TraceEvent::Call(call) = subscriber.read_event() else {
        panic!("expected the call event");
    };
    assert_eq!(call.function, "f");
    engine.disable();
}

#[test]
fn dead_subscriber_does_not_disturb_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    let engine = streaming_engine(&dir);
    let port = engine.stream_port().unwrap();

    let doomed = Subscriber::connect(port);
    let mut survivor = Subscriber::connect(port);
    wait_for("both subscribers", || engine.subscriber_count() == 2);
    drop(doomed);

    // keep emitting until the server notices the dead peer
    let mut emitted = 0;
    wait_for("dead subscriber reaped", || {
        assert!(enter(&engine, "app.mod", "f").is_trace());
        leave(&engine, "app.mod", "f");
        emitted += 1;
        engine.subscriber_count() == 1
    });

    // the survivor saw its snapshot and every emitted pair, in order
    let TraceEvent::FunctionRegistry(_) = survivor.read_event() else {
        panic!("expected the registry snapshot first");
    };
    for _ in 0..emitted {
        let TraceEvent::Call(call) = survivor.read_event() else {
            panic!("expected a call event");
        };
        let TraceEvent::Return(ret) = survivor.read_event() else {
            panic!("expected a return event");
        };
        assert_eq!(ret.call_id, call.call_id);
    }
    engine.disable();
}

#[test]
fn finalize_control_writes_the_artifact_early() {
    let dir = tempfile::tempdir().unwrap();
    let engine = streaming_engine(&dir);

    assert!(enter(&engine, "app.mod", "f").is_trace());
    leave(&engine, "app.mod", "f");

    let mut subscriber = Subscriber::connect(engine.stream_port().unwrap());
    wait_for("subscriber", || engine.subscriber_count() == 1);
    let _snapshot = subscriber.read_event();

    subscriber.send_control(r#"{"type":"finalize"}"#);
    let artifact = dir.path().join(format!("session_{}.json", engine.session_id()));
    wait_for("artifact on disk", || artifact.exists());

    // the session froze with its one recorded call
    let parsed: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&artifact).unwrap()).unwrap();
    assert_eq!(parsed["total_calls"], 1);
    engine.disable();
}

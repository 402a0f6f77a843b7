//! Integration tests for worker processes, driven by small shell scripts
//! standing in for `batchq worker`.

#![cfg(unix)]

use std::time::{Duration, Instant};

use batchq::engine::{ChildCommand, ChildProcessor, ProcessError, Processor};
use batchq::model::{ModelTag, WorkItem, WorkerId};

fn sh(script: &str) -> ChildCommand {
    ChildCommand::new("sh").arg("-c").arg(script)
}

fn item(key: &str) -> WorkItem {
    WorkItem::new("in", "out", key, ModelTag::from("m"))
}

#[test]
fn replies_become_processor_results() {
    // Accepts the load, then reports every item as transiently failed.
    let script = r#"
        read -r line; echo '{"status":"ok"}'
        while read -r line; do echo '{"status":"transient","message":"device busy"}'; done
    "#;
    let mut child = ChildProcessor::spawn(WorkerId::new(), &sh(script)).unwrap();

    child.load(&ModelTag::from("m")).unwrap();
    assert_eq!(
        child.process(&item("a.wav")),
        Err(ProcessError::transient("device busy"))
    );
    assert!(child.check().is_ok());
    assert!(child.try_wait().is_none());
}

#[test]
fn child_dying_mid_request_is_fatal_and_reports_its_status() {
    let mut child = ChildProcessor::spawn(WorkerId::new(), &sh("read -r line; exit 3")).unwrap();

    let err = child.load(&ModelTag::from("m")).unwrap_err();
    assert!(!err.is_transient());
    assert!(err.to_string().contains("exit status: 3"), "{err}");
    assert!(child.try_wait().is_some());

    // Nothing to talk to any more.
    assert!(!child.process(&item("a.wav")).unwrap_err().is_transient());
}

#[test]
fn child_exiting_while_idle_fails_the_check() {
    let mut child = ChildProcessor::spawn(WorkerId::new(), &sh("exit 0")).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while child.check().is_ok() {
        assert!(Instant::now() < deadline, "exit never observed");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(!child.check().unwrap_err().is_transient());
}

#[test]
fn unparsable_reply_is_fatal() {
    let mut child =
        ChildProcessor::spawn(WorkerId::new(), &sh("read -r line; echo loaded; cat >/dev/null")).unwrap();
    let err = child.load(&ModelTag::from("m")).unwrap_err();
    assert!(matches!(err, ProcessError::Fatal(ref msg) if msg.contains("bad reply")));
}

#[test]
fn missing_worker_program_cannot_start() {
    let command = ChildCommand::new("/nonexistent/batchq-worker");
    let Err(err) = ChildProcessor::spawn(WorkerId::new(), &command) else {
        panic!("spawning a missing program should fail");
    };
    assert!(!err.is_transient());
}

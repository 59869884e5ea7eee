use cairn::core::config::CairnConfig;
use cairn::core::error::CairnError;
use cairn::core::runtime::Runtime;
use cairn::core::similarity::LexicalOverlap;
use cairn::core::store::Store;
use cairn::plugins::quorum::{self, QuorumState};
use serde_json::json;
use tempfile::tempdir;

fn test_runtime() -> (tempfile::TempDir, Runtime) {
    let tmp = tempdir().unwrap();
    let rt = Runtime::with_backend(
        Store::at(tmp.path().join("data")),
        CairnConfig::default(),
        Box::new(LexicalOverlap),
    )
    .unwrap();
    (tmp, rt)
}

#[test]
fn test_quorum_reached_before_all_workers() {
    let (_tmp, rt) = test_runtime();
    let session = quorum::open(&rt, "explore", 3, 2, 600).unwrap();
    assert!(!session.resolved);

    let first = quorum::report(&rt, &session.id, "scout-a", json!({ "files": 12 })).unwrap();
    assert_eq!(first.state, QuorumState::Pending);
    assert_eq!(first.received, 1);

    let second = quorum::report(&rt, &session.id, "scout-b", json!({ "files": 9 })).unwrap();
    assert_eq!(second.state, QuorumState::Quorum);

    let waited = quorum::wait(&rt, &session.id, 10).unwrap();
    assert!(waited.session.resolved);
    assert_eq!(waited.session.outcome.as_deref(), Some("quorum"));
    assert_eq!(waited.reports.len(), 2);
    assert!(waited.reports.iter().any(|r| r.worker == "scout-a" && r.payload["files"] == 12));

    // Late workers are turned away once the session is resolved.
    let late = quorum::report(&rt, &session.id, "scout-c", json!({}));
    assert!(matches!(late, Err(CairnError::InvalidTransition { .. })));

    // Waiting again returns the recorded outcome.
    let again = quorum::wait(&rt, &session.id, 10).unwrap();
    assert_eq!(again.session.outcome.as_deref(), Some("quorum"));
}

#[test]
fn test_all_reports_complete_the_session() {
    let (_tmp, rt) = test_runtime();
    let session = quorum::open(&rt, "review", 2, 1, 600).unwrap();
    quorum::report(&rt, &session.id, "a", json!(null)).unwrap();
    let last = quorum::report(&rt, &session.id, "b", json!(null)).unwrap();
    assert_eq!(last.state, QuorumState::Complete);
    let resolved = quorum::wait(&rt, &session.id, 10).unwrap();
    assert_eq!(resolved.session.outcome.as_deref(), Some("complete"));
}

#[test]
fn test_deadline_degrades_with_partial_reports() {
    let (_tmp, rt) = test_runtime();
    let session = quorum::open(&rt, "explore", 4, 3, 0).unwrap();
    quorum::report(&rt, &session.id, "scout-a", json!({ "ok": true })).unwrap();

    let resolved = quorum::wait(&rt, &session.id, 10).unwrap();
    assert_eq!(resolved.state, QuorumState::Degraded);
    assert_eq!(resolved.session.outcome.as_deref(), Some("degraded"));
    assert_eq!(resolved.received, 1);
}

#[test]
fn test_wait_polls_until_deadline() {
    let (_tmp, rt) = test_runtime();
    let session = quorum::open(&rt, "slow", 2, 2, 1).unwrap();
    let started = std::time::Instant::now();
    let resolved = quorum::wait(&rt, &session.id, 50).unwrap();
    assert_eq!(resolved.state, QuorumState::Degraded);
    assert!(started.elapsed() < std::time::Duration::from_secs(5));
}

#[test]
fn test_duplicate_and_empty_workers_rejected() {
    let (_tmp, rt) = test_runtime();
    let session = quorum::open(&rt, "explore", 3, 2, 600).unwrap();
    quorum::report(&rt, &session.id, "scout-a", json!({})).unwrap();
    let dup = quorum::report(&rt, &session.id, "scout-a", json!({}));
    assert!(matches!(dup, Err(CairnError::ValidationError(_))));
    let empty = quorum::report(&rt, &session.id, " ", json!({}));
    assert!(matches!(empty, Err(CairnError::ValidationError(_))));
    assert_eq!(quorum::status(&rt, &session.id).unwrap().received, 1);
}

#[test]
fn test_invalid_sessions() {
    let (_tmp, rt) = test_runtime();
    for (expected, q) in [(0, 0), (3, 0), (2, 3)] {
        let err = quorum::open(&rt, "bad", expected, q, 60);
        assert!(matches!(err, Err(CairnError::ValidationError(_))));
    }
    let overflow = quorum::open(&rt, "bad", 2, 1, u64::MAX);
    assert!(matches!(overflow, Err(CairnError::ValidationError(_))));
    let far = quorum::open(&rt, "far", 2, 2, i64::MAX as u64).unwrap();
    assert_eq!(quorum::status(&rt, &far.id).unwrap().state, QuorumState::Pending);
    assert!(matches!(quorum::status(&rt, "Q-missing"), Err(CairnError::NotFound(_))));
    let report = quorum::report(&rt, "Q-missing", "a", json!({}));
    assert!(matches!(report, Err(CairnError::NotFound(_))));
}

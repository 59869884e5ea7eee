use cairn::core::broker::DbBroker;
use cairn::core::config::{BackendChoice, CairnConfig};
use cairn::core::db;
use cairn::core::error::CairnError;
use cairn::core::runtime::Runtime;
use cairn::core::similarity::{BackendMode, NgramEmbedding};
use cairn::core::store::{self, Store};
use cairn::plugins::knowledge::{self, KnowledgeKind, NewEntry};
use cairn::plugins::scheduler::{self, TaskSpec, TaskStatus};
use cairn::plugins::workspace::{self, CreateParams};
use serde_json::json;
use std::fs;
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::tempdir;

fn ngram_runtime(root: &std::path::Path) -> Runtime {
    Runtime::with_backend(
        Store::at(root),
        CairnConfig::default(),
        Box::new(NgramEmbedding::new(256)),
    )
    .unwrap()
}

#[test]
fn test_open_initializes_both_databases() {
    let tmp = tempdir().unwrap();
    let data = tmp.path().join("data");
    let _rt = ngram_runtime(&data);
    for path in [db::knowledge_db_path(&data), db::campaign_db_path(&data)] {
        assert!(path.exists(), "{} missing", path.display());
        let conn = db::db_connect(&path.to_string_lossy()).unwrap();
        assert!(db::schema_version(&conn).unwrap() >= 1);
    }
    // Reopening an initialized store is a no-op.
    let _again = ngram_runtime(&data);
}

#[test]
fn test_project_discovery_and_config_file() {
    let tmp = tempdir().unwrap();
    let project = tmp.path().join("proj");
    let nested = project.join("src").join("deep");
    fs::create_dir_all(&nested).unwrap();
    assert!(matches!(store::find_project_root(&nested), Err(CairnError::NotFound(_))));

    fs::create_dir_all(project.join(".cairn")).unwrap();
    fs::write(
        project.join(".cairn").join("config.toml"),
        "[embedding]\nbackend = \"lexical\"\n\n[knowledge]\nrecall_limit = 3\n",
    )
    .unwrap();
    assert_eq!(store::find_project_root(&nested).unwrap(), project);

    let rt = Runtime::open(Store::for_project(&project)).unwrap();
    assert_eq!(rt.config.knowledge.recall_limit, 3);
    assert_eq!(rt.config.knowledge.dedup_threshold, 0.85);
    assert_eq!(rt.config.embedding.backend, BackendChoice::Lexical);

    let health = knowledge::health(&rt).unwrap();
    assert_eq!(health.backend, "lexical");
    assert_eq!(health.mode, BackendMode::Lexical);
}

#[test]
fn test_config_rejects_unknown_keys_and_bad_values() {
    let typo = CairnConfig::parse("[knowledge]\ndedup_treshold = 0.9\n");
    assert!(matches!(typo, Err(CairnError::ConfigError(_))));
    let range = CairnConfig::parse("[knowledge]\ndedup_threshold = 1.5\n");
    assert!(matches!(range, Err(CairnError::ConfigError(_))));
    let command = CairnConfig::parse("[embedding]\nbackend = \"command\"\n");
    assert!(matches!(command, Err(CairnError::ConfigError(_))));

    let written = CairnConfig::default_toml().unwrap();
    let parsed = CairnConfig::parse(&written).unwrap();
    assert_eq!(parsed.scheduler.replan_threshold, 2);
    assert_eq!(parsed.workspace.default_verify, "cargo test");
}

#[test]
fn test_every_write_is_audited() {
    let tmp = tempdir().unwrap();
    let data = tmp.path().join("data");
    let rt = ngram_runtime(&data);
    knowledge::store(
        &rt,
        NewEntry {
            trigger: "linker cannot find -lssl",
            resolution: "install libssl-dev",
            kind: KnowledgeKind::Failure,
            source: &[],
            cost_or_saved: 2,
        },
    )
    .unwrap();
    let failed = knowledge::store(
        &rt,
        NewEntry {
            trigger: "   ",
            resolution: "",
            kind: KnowledgeKind::Fact,
            source: &[],
            cost_or_saved: 0,
        },
    );
    assert!(failed.is_err());
    let c = scheduler::create_campaign(&rt, "audit trail").unwrap();
    assert!(matches!(
        scheduler::start_task(&rt, &c.id, "001"),
        Err(CairnError::NotFound(_))
    ));

    let events = DbBroker::new(&data).read_audit().unwrap();
    let ops: Vec<&str> = events.iter().map(|e| e.op.as_str()).collect();
    assert!(ops.contains(&"knowledge.init"));
    assert!(ops.contains(&"campaign.init"));
    assert!(ops.contains(&"knowledge.store"));
    assert!(ops.contains(&"campaign.create"));
    let start = events.iter().find(|e| e.op == "scheduler.start").unwrap();
    assert_eq!(start.status, "error");
    assert!(events.iter().all(|e| !e.actor.is_empty()));
}

#[test]
fn test_malformed_audit_line_is_reported() {
    let tmp = tempdir().unwrap();
    let data = tmp.path().join("data");
    let _rt = ngram_runtime(&data);
    let log = data.join("broker.events.jsonl");
    let mut content = fs::read_to_string(&log).unwrap();
    content.push_str("{not json\n");
    fs::write(&log, content).unwrap();
    match DbBroker::new(&data).read_audit() {
        Err(CairnError::MalformedRecord { location, .. }) => {
            assert!(location.starts_with("broker.events.jsonl:"));
        }
        other => panic!("expected malformed record, got {:?}", other.map(|e| e.len())),
    }
}

#[test]
fn test_malformed_stored_record_names_its_location() {
    let tmp = tempdir().unwrap();
    let data = tmp.path().join("data");
    let rt = ngram_runtime(&data);
    let c = scheduler::create_campaign(&rt, "corrupt").unwrap();
    let spec: Vec<TaskSpec> =
        serde_json::from_value(json!([{ "seq": "001", "slug": "a", "kind": "build" }])).unwrap();
    scheduler::add_tasks(&rt, &c.id, &spec).unwrap();
    let ws = workspace::create(
        &rt,
        CreateParams {
            campaign_id: &c.id,
            seq: "001",
            id: Some("ws-1"),
            ..Default::default()
        },
    )
    .unwrap();

    let conn = db::db_connect(&rt.campaign_db().to_string_lossy()).unwrap();
    conn.execute(
        "UPDATE workspaces SET prior_knowledge = '{oops' WHERE id = ?1",
        [&ws.id],
    )
    .unwrap();
    drop(conn);

    match workspace::get(&rt, "ws-1") {
        Err(err @ CairnError::MalformedRecord { .. }) => {
            assert_eq!(err.kind(), "malformed_record");
            assert!(err.to_string().contains("workspaces[ws-1].prior_knowledge"));
        }
        other => panic!("expected malformed record, got {:?}", other.map(|w| w.id)),
    }
}

#[test]
fn test_concurrent_completions_keep_campaign_consistent() {
    const WORKERS: usize = 6;
    let tmp = tempdir().unwrap();
    let data = tmp.path().join("data");
    let rt = ngram_runtime(&data);
    let c = scheduler::create_campaign(&rt, "parallel build").unwrap();
    let raw: Vec<serde_json::Value> = (1..=WORKERS)
        .map(|i| {
            json!({
                "seq": format!("{:03}", i),
                "slug": format!("part-{}", i),
                "kind": "build",
                "delta": [format!("src/part{}/**", i)]
            })
        })
        .collect();
    let spec: Vec<TaskSpec> = serde_json::from_value(serde_json::Value::Array(raw)).unwrap();
    scheduler::add_tasks(&rt, &c.id, &spec).unwrap();
    assert_eq!(scheduler::ready_tasks(&rt, &c.id).unwrap().len(), WORKERS);

    let mut ids = Vec::new();
    for i in 1..=WORKERS {
        let seq = format!("{:03}", i);
        let ws = workspace::create(
            &rt,
            CreateParams {
                campaign_id: &c.id,
                seq: &seq,
                ..Default::default()
            },
        )
        .unwrap();
        ids.push((i, ws.id));
    }

    let barrier = Arc::new(Barrier::new(WORKERS));
    let handles: Vec<_> = ids
        .into_iter()
        .map(|(i, id)| {
            let barrier = Arc::clone(&barrier);
            let data = data.clone();
            thread::spawn(move || {
                let rt = ngram_runtime(&data);
                barrier.wait();
                workspace::complete(
                    &rt,
                    &id,
                    &format!("part {} done", i),
                    &[],
                    &[format!("src/part{}/mod.rs", i)],
                )
                .map(|w| w.id)
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap().unwrap();
    }

    let done = scheduler::list_tasks(&rt, &c.id, Some(TaskStatus::Complete)).unwrap();
    assert_eq!(done.len(), WORKERS);
    let detail = scheduler::get_campaign(&rt, &c.id).unwrap();
    assert_eq!(detail.campaign.status, scheduler::CampaignStatus::Complete);

    let completes = DbBroker::new(&data)
        .read_audit()
        .unwrap()
        .into_iter()
        .filter(|e| e.op == "workspace.complete" && e.status == "success")
        .count();
    assert_eq!(completes, WORKERS);
}

use cairn::core::config::CairnConfig;
use cairn::core::error::CairnError;
use cairn::core::runtime::Runtime;
use cairn::core::similarity::NgramEmbedding;
use cairn::core::store::Store;
use cairn::plugins::scheduler::{self, CampaignStatus, CascadeState, TaskSpec, TaskStatus};
use serde_json::json;
use tempfile::tempdir;

fn test_runtime() -> (tempfile::TempDir, Runtime) {
    let tmp = tempdir().unwrap();
    let rt = Runtime::with_backend(
        Store::at(tmp.path().join("data")),
        CairnConfig::default(),
        Box::new(NgramEmbedding::new(256)),
    )
    .unwrap();
    (tmp, rt)
}

fn specs(value: serde_json::Value) -> Vec<TaskSpec> {
    serde_json::from_value(value).unwrap()
}

fn fan_out() -> Vec<TaskSpec> {
    specs(json!([
        { "seq": "001", "slug": "scaffold", "kind": "build", "delta": ["src/lib.rs"] },
        { "seq": "002", "slug": "parser", "kind": "build", "depends": "001", "delta": ["src/parser/**"] },
        { "seq": "003", "slug": "lexer", "kind": "build", "depends": ["001"], "delta": ["src/lexer/**"] }
    ]))
}

fn seqs(tasks: &[scheduler::Task]) -> Vec<String> {
    tasks.iter().map(|t| t.seq.clone()).collect()
}

#[test]
fn test_blocking_root_strands_dependents() {
    let (_tmp, rt) = test_runtime();
    let c = scheduler::create_campaign(&rt, "streaming parser").unwrap();
    scheduler::add_tasks(&rt, &c.id, &fan_out()).unwrap();

    assert_eq!(seqs(&scheduler::ready_tasks(&rt, &c.id).unwrap()), vec!["001"]);
    scheduler::start_task(&rt, &c.id, "001").unwrap();
    assert!(scheduler::ready_tasks(&rt, &c.id).unwrap().is_empty());
    scheduler::block_task(&rt, &c.id, "001", "toolchain missing").unwrap();

    assert!(scheduler::ready_tasks(&rt, &c.id).unwrap().is_empty());
    let cascade = scheduler::cascade_status(&rt, &c.id).unwrap();
    assert_eq!(cascade.state, CascadeState::Stuck);
    assert_eq!(cascade.blocked, vec!["001"]);
    assert_eq!(cascade.unreachable, vec!["002", "003"]);
    assert_eq!(cascade.blocked_by["002"], "001");
}

#[test]
fn test_propagate_blocks_is_transitive() {
    let (_tmp, rt) = test_runtime();
    let c = scheduler::create_campaign(&rt, "chain").unwrap();
    let chain = specs(json!([
        { "seq": "001", "slug": "a", "kind": "build" },
        { "seq": "002", "slug": "b", "kind": "build", "depends": "001" },
        { "seq": "003", "slug": "c", "kind": "build", "depends": "002" },
        { "seq": "004", "slug": "d", "kind": "build" }
    ]));
    scheduler::add_tasks(&rt, &c.id, &chain).unwrap();
    scheduler::start_task(&rt, &c.id, "001").unwrap();
    scheduler::block_task(&rt, &c.id, "001", "upstream api removed").unwrap();

    let propagated = scheduler::propagate_blocks(&rt, &c.id).unwrap();
    let mut blocked: Vec<(String, String)> = propagated
        .into_iter()
        .map(|p| (p.seq, p.blocked_by))
        .collect();
    blocked.sort();
    assert_eq!(
        blocked,
        vec![
            ("002".to_string(), "001".to_string()),
            ("003".to_string(), "002".to_string())
        ]
    );

    let tasks = scheduler::list_tasks(&rt, &c.id, Some(TaskStatus::Blocked)).unwrap();
    assert_eq!(seqs(&tasks), vec!["001", "002", "003"]);
    assert!(tasks.iter().filter(|t| t.seq != "001").all(|t| t.cascade));

    let cascade = scheduler::cascade_status(&rt, &c.id).unwrap();
    assert_eq!(cascade.unreachable, vec!["002", "003"]);
    assert_eq!(cascade.state, CascadeState::Stuck);
    // Independent work is still schedulable.
    assert_eq!(seqs(&scheduler::ready_tasks(&rt, &c.id).unwrap()), vec!["004"]);

    // Running it again finds nothing new.
    assert!(scheduler::propagate_blocks(&rt, &c.id).unwrap().is_empty());
}

#[test]
fn test_add_tasks_rejects_cycle_with_genuine_path() {
    let (_tmp, rt) = test_runtime();
    let c = scheduler::create_campaign(&rt, "cyclic").unwrap();
    let batch = specs(json!([
        { "seq": "001", "slug": "a", "kind": "build", "depends": "003" },
        { "seq": "002", "slug": "b", "kind": "build", "depends": "001" },
        { "seq": "003", "slug": "c", "kind": "build", "depends": "002" }
    ]));
    let err = scheduler::add_tasks(&rt, &c.id, &batch).unwrap_err();
    let path = match err {
        CairnError::Cycle { path } => path,
        other => panic!("expected a cycle, got {:?}", other),
    };
    assert_eq!(path.first(), path.last());
    let deps = |seq: &str| batch.iter().find(|s| s.seq == seq).unwrap().depends_on();
    for pair in path.windows(2) {
        assert!(deps(&pair[0]).contains(&pair[1]), "{} -> {} is not an edge", pair[0], pair[1]);
    }
    assert!(scheduler::list_tasks(&rt, &c.id, None).unwrap().is_empty());
}

#[test]
fn test_add_tasks_rejects_cycle_through_existing_tasks() {
    let (_tmp, rt) = test_runtime();
    let c = scheduler::create_campaign(&rt, "grow").unwrap();
    scheduler::add_tasks(&rt, &c.id, &fan_out()).unwrap();
    let dup = specs(json!([{ "seq": "002", "slug": "again", "kind": "build" }]));
    assert!(matches!(
        scheduler::add_tasks(&rt, &c.id, &dup),
        Err(CairnError::ValidationError(_))
    ));
    let dangling = specs(json!([{ "seq": "004", "slug": "x", "kind": "build", "depends": "009" }]));
    assert!(matches!(
        scheduler::add_tasks(&rt, &c.id, &dangling),
        Err(CairnError::ValidationError(_))
    ));
    assert_eq!(scheduler::list_tasks(&rt, &c.id, None).unwrap().len(), 3);
}

#[test]
fn test_unknown_fields_in_batch_are_rejected() {
    let bad: Result<Vec<TaskSpec>, _> = serde_json::from_value(json!([
        { "seq": "001", "slug": "a", "kind": "build", "priority": "high" }
    ]));
    assert!(bad.is_err());
}

#[test]
fn test_terminal_tasks_do_not_transition_again() {
    let (_tmp, rt) = test_runtime();
    let c = scheduler::create_campaign(&rt, "terminal").unwrap();
    scheduler::add_tasks(&rt, &c.id, &fan_out()).unwrap();
    scheduler::start_task(&rt, &c.id, "001").unwrap();
    let done = scheduler::complete_task(&rt, &c.id, "001", "scaffolded crate").unwrap();
    assert_eq!(done.status, TaskStatus::Complete);

    assert!(matches!(
        scheduler::block_task(&rt, &c.id, "001", "late failure"),
        Err(CairnError::InvalidTransition { .. })
    ));
    assert!(matches!(
        scheduler::start_task(&rt, &c.id, "001"),
        Err(CairnError::InvalidTransition { .. })
    ));
    // 002 is ready now, but completing without starting is not allowed.
    assert!(matches!(
        scheduler::complete_task(&rt, &c.id, "002", "skipped"),
        Err(CairnError::InvalidTransition { .. })
    ));
    assert!(matches!(
        scheduler::block_task(&rt, &c.id, "001", "   "),
        Err(CairnError::ValidationError(_))
    ));
}

#[test]
fn test_start_requires_dependencies_complete() {
    let (_tmp, rt) = test_runtime();
    let c = scheduler::create_campaign(&rt, "order").unwrap();
    scheduler::add_tasks(&rt, &c.id, &fan_out()).unwrap();
    assert!(matches!(
        scheduler::start_task(&rt, &c.id, "002"),
        Err(CairnError::ValidationError(_))
    ));
    assert!(matches!(
        scheduler::start_task(&rt, &c.id, "099"),
        Err(CairnError::NotFound(_))
    ));
}

#[test]
fn test_replan_bundle_partitions_task_statuses() {
    let (_tmp, rt) = test_runtime();
    let c = scheduler::create_campaign(&rt, "replan me").unwrap();
    let batch = specs(json!([
        { "seq": "001", "slug": "base", "kind": "build" },
        { "seq": "002", "slug": "api", "kind": "build", "depends": "001" },
        { "seq": "003", "slug": "client", "kind": "build", "depends": "002" },
        { "seq": "004", "slug": "docs", "kind": "docs", "depends": "002" },
        { "seq": "005", "slug": "bench", "kind": "build", "depends": "001" }
    ]));
    scheduler::add_tasks(&rt, &c.id, &batch).unwrap();
    scheduler::start_task(&rt, &c.id, "001").unwrap();
    scheduler::complete_task(&rt, &c.id, "001", "base done").unwrap();

    let quiet = scheduler::get_replan_input(&rt, &c.id, None).unwrap();
    assert!(!quiet.triggered);
    assert!(quiet.bundle.is_none());

    scheduler::start_task(&rt, &c.id, "002").unwrap();
    scheduler::block_task(&rt, &c.id, "002", "schema undecided").unwrap();

    let input = scheduler::get_replan_input(&rt, &c.id, None).unwrap();
    assert!(input.triggered);
    assert_eq!(input.threshold, 2);
    assert_eq!(input.stranded, vec!["003", "004"]);

    let bundle = input.bundle.unwrap();
    assert_eq!(bundle.objective, "replan me");
    let completed: Vec<&str> = bundle.completed.iter().map(|t| t.seq.as_str()).collect();
    let blocked: Vec<&str> = bundle.blocked.iter().map(|t| t.seq.as_str()).collect();
    let remaining: Vec<&str> = bundle.remaining.iter().map(|t| t.seq.as_str()).collect();
    assert_eq!(completed, vec!["001"]);
    assert_eq!(blocked, vec!["002"]);
    assert_eq!(remaining, vec!["003", "004", "005"]);
    assert!(bundle.in_progress.is_empty());
    assert_eq!(bundle.completed[0].summary.as_deref(), Some("base done"));
    assert_eq!(bundle.blocked[0].reason.as_deref(), Some("schema undecided"));

    let tasks = scheduler::list_tasks(&rt, &c.id, None).unwrap();
    assert_eq!(
        tasks.len(),
        bundle.completed.len() + bundle.blocked.len() + bundle.in_progress.len() + bundle.remaining.len()
    );
}

#[test]
fn test_merge_revised_plan_preserves_complete_work() {
    let (_tmp, rt) = test_runtime();
    let c = scheduler::create_campaign(&rt, "merge").unwrap();
    scheduler::add_tasks(&rt, &c.id, &fan_out()).unwrap();
    scheduler::start_task(&rt, &c.id, "001").unwrap();
    scheduler::complete_task(&rt, &c.id, "001", "ok").unwrap();
    scheduler::start_task(&rt, &c.id, "002").unwrap();
    scheduler::block_task(&rt, &c.id, "002", "grammar ambiguous").unwrap();

    let revised = specs(json!([
        { "seq": "001", "slug": "scaffold-v2", "kind": "build" },
        { "seq": "002", "slug": "parser", "kind": "build", "depends": ["001", "004"], "goal": "use a pratt parser" },
        { "seq": "003", "slug": "lexer", "kind": "build", "depends": "001", "budget": 4000 },
        { "seq": "004", "slug": "grammar", "kind": "design", "depends": "001" }
    ]));
    let outcome = scheduler::merge_revised_plan(&rt, &c.id, &revised).unwrap();
    assert_eq!(outcome.kept, vec!["001"]);
    assert_eq!(outcome.superseded.len(), 1);
    assert_eq!(outcome.superseded[0].seq, "002");
    assert_eq!(outcome.superseded[0].revision, 2);
    assert_eq!(outcome.redefined, vec!["003"]);
    assert_eq!(outcome.inserted, vec!["004"]);

    let detail = scheduler::get_campaign(&rt, &c.id).unwrap();
    let by_seq = |s: &str| detail.tasks.iter().find(|t| t.seq == s).unwrap().clone();
    let kept = by_seq("001");
    assert_eq!(kept.status, TaskStatus::Complete);
    assert_eq!(kept.slug, "scaffold");
    assert_eq!(kept.summary.as_deref(), Some("ok"));
    let reborn = by_seq("002");
    assert_eq!(reborn.status, TaskStatus::Pending);
    assert_eq!(reborn.revision, 2);
    assert_eq!(reborn.depends, vec!["001", "004"]);
    assert!(reborn.block_reason.is_none());
    assert_eq!(by_seq("003").budget, Some(4000));

    let ready = seqs(&scheduler::ready_tasks(&rt, &c.id).unwrap());
    assert_eq!(ready, vec!["003", "004"]);
}

#[test]
fn test_merge_rejects_in_progress_revision_and_cycles() {
    let (_tmp, rt) = test_runtime();
    let c = scheduler::create_campaign(&rt, "merge guards").unwrap();
    scheduler::add_tasks(&rt, &c.id, &fan_out()).unwrap();
    scheduler::start_task(&rt, &c.id, "001").unwrap();

    let touch_running = specs(json!([{ "seq": "001", "slug": "x", "kind": "build" }]));
    assert!(matches!(
        scheduler::merge_revised_plan(&rt, &c.id, &touch_running),
        Err(CairnError::ValidationError(_))
    ));

    let cyclic = specs(json!([
        { "seq": "002", "slug": "parser", "kind": "build", "depends": "003" },
        { "seq": "003", "slug": "lexer", "kind": "build", "depends": "002" }
    ]));
    assert!(matches!(
        scheduler::merge_revised_plan(&rt, &c.id, &cyclic),
        Err(CairnError::Cycle { .. })
    ));
    let tasks = scheduler::list_tasks(&rt, &c.id, None).unwrap();
    assert!(tasks.iter().all(|t| t.revision == 1));
}

#[test]
fn test_campaign_status_follows_tasks() {
    let (_tmp, rt) = test_runtime();
    let c = scheduler::create_campaign(&rt, "finish line").unwrap();
    let one = specs(json!([{ "seq": "001", "slug": "only", "kind": "build" }]));
    scheduler::add_tasks(&rt, &c.id, &one).unwrap();
    scheduler::start_task(&rt, &c.id, "001").unwrap();
    scheduler::complete_task(&rt, &c.id, "001", "done").unwrap();
    let detail = scheduler::get_campaign(&rt, &c.id).unwrap();
    assert_eq!(detail.campaign.status, CampaignStatus::Complete);
    assert_eq!(detail.counts.complete, 1);

    let other = scheduler::create_campaign(&rt, "dead end").unwrap();
    scheduler::add_tasks(&rt, &other.id, &one).unwrap();
    scheduler::start_task(&rt, &other.id, "001").unwrap();
    scheduler::block_task(&rt, &other.id, "001", "impossible").unwrap();
    let failed = scheduler::list_campaigns(&rt, Some(CampaignStatus::Failed)).unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, other.id);
}

#[test]
fn test_similar_campaigns_ranks_by_objective() {
    let (_tmp, rt) = test_runtime();
    let parser = scheduler::create_campaign(&rt, "rewrite the json parser for streaming input").unwrap();
    scheduler::create_campaign(&rt, "migrate ci from travis to github actions").unwrap();
    let matches = scheduler::similar_campaigns(&rt, "streaming json parser rewrite", 5).unwrap();
    assert_eq!(matches[0].campaign.id, parser.id);
    assert!(matches.len() <= 2);
}

#[test]
fn test_concurrent_campaigns_are_isolated() {
    let (_tmp, rt) = test_runtime();
    let a = scheduler::create_campaign(&rt, "first").unwrap();
    let b = scheduler::create_campaign(&rt, "second").unwrap();
    scheduler::add_tasks(&rt, &a.id, &fan_out()).unwrap();
    scheduler::add_tasks(&rt, &b.id, &fan_out()).unwrap();
    scheduler::start_task(&rt, &a.id, "001").unwrap();
    scheduler::block_task(&rt, &a.id, "001", "broken").unwrap();

    assert!(scheduler::ready_tasks(&rt, &a.id).unwrap().is_empty());
    assert_eq!(seqs(&scheduler::ready_tasks(&rt, &b.id).unwrap()), vec!["001"]);
    assert_eq!(
        scheduler::cascade_status(&rt, &b.id).unwrap().state,
        CascadeState::Progressing
    );
}

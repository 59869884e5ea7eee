use cairn::core::config::CairnConfig;
use cairn::core::error::CairnError;
use cairn::core::runtime::Runtime;
use cairn::core::similarity::{
    BackendMode, LexicalOverlap, NgramEmbedding, Probe, SimilarityBackend,
};
use cairn::core::store::Store;
use cairn::plugins::graph::{self, EdgeStatus, RelType};
use cairn::plugins::knowledge::{
    self, IMPORTANCE_FLOOR, KnowledgeKind, NewEntry, PruneReason, StoreStatus,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
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

/// N-gram backend whose embedder can be switched off mid-session.
struct SwitchableBackend {
    inner: NgramEmbedding,
    down: Arc<AtomicBool>,
}

impl SimilarityBackend for SwitchableBackend {
    fn name(&self) -> &'static str {
        "switchable"
    }

    fn mode(&self) -> BackendMode {
        BackendMode::Semantic
    }

    fn dimension(&self) -> Option<usize> {
        self.inner.dimension()
    }

    fn embed(&self, text: &str) -> Result<Option<Vec<f32>>, CairnError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(CairnError::BackendUnavailable("embedder offline".to_string()));
        }
        self.inner.embed(text)
    }

    fn similarity(&self, a: &Probe, b: &Probe) -> f64 {
        self.inner.similarity(a, b)
    }
}

fn put(rt: &Runtime, trigger: &str, resolution: &str, kind: KnowledgeKind, source: &str) -> String {
    let source = vec![source.to_string()];
    knowledge::store(
        rt,
        NewEntry {
            trigger,
            resolution,
            kind,
            source: &source,
            cost_or_saved: 0,
        },
    )
    .unwrap()
    .name
}

#[test]
fn test_store_twice_adds_then_merges() {
    let (_tmp, rt) = test_runtime();
    let first_src = vec!["C1:003".to_string()];
    let second_src = vec!["C2:001".to_string()];

    let first = knowledge::store(
        &rt,
        NewEntry {
            trigger: "ImportError: No module named 'requests'",
            resolution: "add requests to the dev dependencies",
            kind: KnowledgeKind::Failure,
            source: &first_src,
            cost_or_saved: 3,
        },
    )
    .unwrap();
    assert_eq!(first.status, StoreStatus::Added);

    let second = knowledge::store(
        &rt,
        NewEntry {
            trigger: "importerror - no module named requests",
            resolution: "pip install requests",
            kind: KnowledgeKind::Failure,
            source: &second_src,
            cost_or_saved: 7,
        },
    )
    .unwrap();
    assert_eq!(second.status, StoreStatus::Merged);
    assert_eq!(second.name, first.name);
    assert!(second.similarity.unwrap() >= 0.85);

    let detail = knowledge::get(&rt, &first.name).unwrap();
    assert_eq!(detail.entry.source, vec!["C1:003", "C2:001"]);
    assert_eq!(detail.entry.resolution, "add requests to the dev dependencies");
    assert_eq!(detail.entry.cost_or_saved, 7);

    let health = knowledge::health(&rt).unwrap();
    assert_eq!(health.total, 1);
}

#[test]
fn test_store_does_not_merge_across_kinds() {
    let (_tmp, rt) = test_runtime();
    let a = put(&rt, "cargo build fails on missing openssl headers", "", KnowledgeKind::Failure, "a");
    let b = put(&rt, "cargo build fails on missing openssl headers", "install libssl-dev", KnowledgeKind::Pattern, "b");
    assert_ne!(a, b);
    assert_eq!(knowledge::health(&rt).unwrap().total, 2);
}

#[test]
fn test_store_rejects_empty_trigger() {
    let (_tmp, rt) = test_runtime();
    let err = knowledge::store(
        &rt,
        NewEntry {
            trigger: "   ",
            resolution: "x",
            kind: KnowledgeKind::Fact,
            source: &[],
            cost_or_saved: 0,
        },
    )
    .unwrap_err();
    assert!(matches!(err, CairnError::ValidationError(_)));
}

#[test]
fn test_recall_ranks_relevant_entry_first() {
    let (_tmp, rt) = test_runtime();
    let hit = put(
        &rt,
        "database migration fails with locked sqlite file",
        "close the other connection before migrating",
        KnowledgeKind::Failure,
        "s1",
    );
    put(
        &rt,
        "frontend bundle size exceeds the performance budget",
        "split vendor chunks",
        KnowledgeKind::Failure,
        "s2",
    );

    let result = knowledge::recall(&rt, "sqlite file locked during migration", None, None, false).unwrap();
    assert!(!result.degraded);
    assert_eq!(result.results[0].name, hit);
    assert!(result.results.iter().all(|r| r.relevance.unwrap() >= 0.1));
    for pair in result.results.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
}

#[test]
fn test_recall_kind_filter_and_by_type() {
    let (_tmp, rt) = test_runtime();
    put(&rt, "retry flaky network calls with backoff", "", KnowledgeKind::Pattern, "p");
    put(&rt, "network calls time out behind the proxy", "", KnowledgeKind::Failure, "f");

    let only_patterns = knowledge::recall(&rt, "network calls", Some(KnowledgeKind::Pattern), None, false).unwrap();
    assert!(only_patterns.results.iter().all(|r| r.kind == KnowledgeKind::Pattern));

    let grouped = knowledge::recall_by_type(&rt, "network calls", None).unwrap();
    assert!(grouped.contains_key("pattern"));
    assert!(grouped.contains_key("failure"));
    assert!(!grouped.contains_key("decision"));
}

#[test]
fn test_recall_lexical_backend_still_ranks() {
    let tmp = tempdir().unwrap();
    let rt = Runtime::with_backend(
        Store::at(tmp.path().join("data")),
        CairnConfig::default(),
        Box::new(LexicalOverlap),
    )
    .unwrap();
    let name = put(&rt, "linker error undefined reference to main", "", KnowledgeKind::Failure, "x");
    let result = knowledge::recall(&rt, "undefined reference to main", None, None, false).unwrap();
    assert_eq!(result.results[0].name, name);
    let health = knowledge::health(&rt).unwrap();
    assert_eq!(health.missing_embeddings, 1);
}

#[test]
fn test_recall_expand_follows_edges() {
    // Lexical relevance is exactly zero for disjoint vocabularies, so the fix
    // can only surface through the graph.
    let tmp = tempdir().unwrap();
    let rt = Runtime::with_backend(
        Store::at(tmp.path().join("data")),
        CairnConfig::default(),
        Box::new(LexicalOverlap),
    )
    .unwrap();
    let failure = put(
        &rt,
        "tests hang when the mock server port is taken",
        "",
        KnowledgeKind::Failure,
        "f",
    );
    let fix = put(
        &rt,
        "bind ephemeral zero address then read back assignment",
        "",
        KnowledgeKind::Pattern,
        "p",
    );
    graph::edge(&rt, &failure, &fix, RelType::Related, Some(0.8)).unwrap();

    let query = "mock server port taken tests hang";
    let plain = knowledge::recall(&rt, query, None, None, false).unwrap();
    assert_eq!(plain.results.len(), 1);
    assert_eq!(plain.results[0].name, failure);
    assert!(plain.results[0].expanded_from.is_none());

    let expanded = knowledge::recall(&rt, query, None, None, true).unwrap();
    assert_eq!(expanded.results.len(), 2);
    let via = expanded.results.iter().find(|r| r.name == fix).unwrap();
    let origin = via.expanded_from.as_ref().unwrap();
    assert_eq!(origin.seed, failure);
    assert_eq!(origin.hop_distance, 1);
    assert!((origin.path_weight - 0.8).abs() < 1e-9);
}

#[test]
fn test_edge_strengthening_keeps_max() {
    let (_tmp, rt) = test_runtime();
    let a = put(&rt, "alpha failure in parser", "", KnowledgeKind::Failure, "a");
    let b = put(&rt, "beta pattern for lexer", "", KnowledgeKind::Pattern, "b");

    let created = graph::edge(&rt, &a, &b, RelType::Related, Some(0.5)).unwrap();
    assert_eq!(created.status, EdgeStatus::Created);
    let stronger = graph::edge(&rt, &a, &b, RelType::Related, Some(0.9)).unwrap();
    assert_eq!(stronger.status, EdgeStatus::Strengthened);
    let weaker = graph::edge(&rt, &a, &b, RelType::Related, Some(0.2)).unwrap();
    assert_eq!(weaker.status, EdgeStatus::Unchanged);
    assert_eq!(weaker.edge.weight, 0.9);

    let listing = graph::edges(&rt, &a, None).unwrap();
    assert_eq!(listing.outgoing.len(), 1);
    assert!(listing.incoming.is_empty());

    assert!(matches!(
        graph::edge(&rt, &a, &a, RelType::Related, None),
        Err(CairnError::ValidationError(_))
    ));
    assert!(matches!(
        graph::edge(&rt, &a, "missing", RelType::Related, None),
        Err(CairnError::NotFound(_))
    ));
    assert!(matches!(
        graph::edge(&rt, &a, &b, RelType::Causes, Some(2.0)),
        Err(CairnError::ValidationError(_))
    ));
}

#[test]
fn test_traversal_respects_floor() {
    let (_tmp, rt) = test_runtime();
    let a = put(&rt, "root cause one", "", KnowledgeKind::Failure, "a");
    let b = put(&rt, "second hop pattern", "", KnowledgeKind::Pattern, "b");
    let c = put(&rt, "third hop fact about caches", "", KnowledgeKind::Fact, "c");
    graph::edge(&rt, &a, &b, RelType::Related, Some(0.8)).unwrap();
    graph::edge(&rt, &b, &c, RelType::CoOccurs, Some(0.6)).unwrap();

    // 0.8 * 0.6 = 0.48 falls under the 0.5 floor.
    let hits = graph::traverse_from(&rt, std::slice::from_ref(&a), Some(3), Some(0.5)).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].name, b);

    let deeper = graph::traverse_from(&rt, std::slice::from_ref(&a), Some(3), Some(0.4)).unwrap();
    assert_eq!(deeper.len(), 2);
    assert!(deeper.iter().any(|h| h.name == c && h.hop_distance == 2));

    assert!(matches!(
        graph::traverse_from(&rt, &["nope".to_string()], None, None),
        Err(CairnError::NotFound(_))
    ));
}

#[test]
fn test_feedback_updates_counters_and_reports_missing() {
    let (_tmp, rt) = test_runtime();
    let name = put(&rt, "use a lockfile for reproducible builds", "", KnowledgeKind::Pattern, "p");

    let out = knowledge::feedback(&rt, &[name.clone(), "ghost".to_string()], 1.0).unwrap();
    assert_eq!(out.updated, vec![name.clone()]);
    assert_eq!(out.missing, vec!["ghost".to_string()]);
    knowledge::feedback(&rt, std::slice::from_ref(&name), -0.5).unwrap();

    let entry = knowledge::get(&rt, &name).unwrap().entry;
    assert_eq!(entry.helped, 1.0);
    assert_eq!(entry.failed, 0.5);
    assert!((entry.effectiveness() - 2.0 / 3.5).abs() < 1e-9);

    assert!(knowledge::feedback(&rt, std::slice::from_ref(&name), 0.0).is_err());
    assert!(knowledge::feedback(&rt, std::slice::from_ref(&name), 1.5).is_err());
}

#[test]
fn test_decay_is_monotone_and_prune_removes_faded_entries() {
    let (_tmp, rt) = test_runtime();
    let name = put(&rt, "generated code drifts from the schema", "", KnowledgeKind::Failure, "x");

    let mut last = 1.0;
    for _ in 0..5 {
        let decayed = knowledge::decay(&rt, 0.0, 1.0).unwrap();
        assert_eq!(decayed.len(), 1);
        let importance = knowledge::get(&rt, &name).unwrap().entry.importance;
        assert!(importance <= last);
        assert!(importance > 0.0);
        last = importance;
    }
    assert!(last < IMPORTANCE_FLOOR);

    let report = knowledge::prune(&rt, 0.3, 3.0).unwrap();
    assert_eq!(report.removed.len(), 1);
    assert_eq!(report.removed[0].reason, PruneReason::LowImportance);
    assert!(matches!(knowledge::get(&rt, &name), Err(CairnError::NotFound(_))));
}

#[test]
fn test_decay_skips_used_entries() {
    let (_tmp, rt) = test_runtime();
    let name = put(&rt, "pin the toolchain version", "", KnowledgeKind::Decision, "d");
    knowledge::feedback(&rt, std::slice::from_ref(&name), 1.0).unwrap();
    knowledge::feedback(&rt, std::slice::from_ref(&name), 1.0).unwrap();
    assert!(knowledge::decay(&rt, 0.0, 2.0).unwrap().is_empty());
    assert_eq!(knowledge::get(&rt, &name).unwrap().entry.importance, 1.0);
}

#[test]
fn test_prune_low_effectiveness_and_capacity() {
    let tmp = tempdir().unwrap();
    let mut config = CairnConfig::default();
    config.knowledge.failure_capacity = 2;
    let rt = Runtime::with_backend(
        Store::at(tmp.path().join("data")),
        config,
        Box::new(NgramEmbedding::new(256)),
    )
    .unwrap();

    let bad = put(&rt, "always restart the daemon", "", KnowledgeKind::Failure, "1");
    put(&rt, "quantum flux capacitor overheats", "", KnowledgeKind::Failure, "2");
    put(&rt, "yaml indentation breaks the ci pipeline", "", KnowledgeKind::Failure, "3");
    put(&rt, "docker layer cache invalidated by timestamps", "", KnowledgeKind::Failure, "4");
    for _ in 0..3 {
        knowledge::feedback(&rt, std::slice::from_ref(&bad), -1.0).unwrap();
    }

    let report = knowledge::prune(&rt, 0.3, 3.0).unwrap();
    assert!(report
        .removed
        .iter()
        .any(|p| p.name == bad && p.reason == PruneReason::LowEffectiveness));
    assert_eq!(report.capacity.len(), 1);
    assert_eq!(report.capacity[0].bound, 2);
    assert_eq!(report.capacity[0].before, 3);
    assert_eq!(report.capacity[0].removed, 1);
    assert_eq!(knowledge::health(&rt).unwrap().total, 2);
}

#[test]
fn test_consolidate_merges_and_repoints_edges() {
    let (_tmp, rt) = test_runtime();
    let a = put(&rt, "Flaky test: timing race in scheduler", "", KnowledgeKind::Failure, "s1");
    let other = put(&rt, "add a barrier before asserting order", "", KnowledgeKind::Pattern, "p");
    // Stored with a high threshold so the near-duplicate survives as its own entry.
    let tmp_cfg_rt = {
        let mut cfg = rt.config.clone();
        cfg.knowledge.dedup_threshold = 1.0;
        Runtime::with_backend(rt.store.clone(), cfg, Box::new(NgramEmbedding::new(256))).unwrap()
    };
    let b = put(&tmp_cfg_rt, "flaky test timing race in the scheduler", "", KnowledgeKind::Failure, "s2");
    assert_ne!(a, b);
    graph::edge(&rt, &other, &b, RelType::Solves, None).unwrap();

    let merged = knowledge::consolidate(&rt, Some(0.7)).unwrap();
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].kept, a);
    assert_eq!(merged[0].absorbed, b);

    let detail = knowledge::get(&rt, &a).unwrap();
    assert_eq!(detail.entry.source, vec!["s1", "s2"]);
    assert_eq!(detail.incoming.len(), 1);
    assert_eq!(detail.incoming[0].from, other);
    assert!(matches!(knowledge::get(&rt, &b), Err(CairnError::NotFound(_))));
}

#[test]
fn test_store_degrades_when_embedder_goes_down() {
    let tmp = tempdir().unwrap();
    let down = Arc::new(AtomicBool::new(false));
    let rt = Runtime::with_backend(
        Store::at(tmp.path().join("data")),
        CairnConfig::default(),
        Box::new(SwitchableBackend {
            inner: NgramEmbedding::new(256),
            down: Arc::clone(&down),
        }),
    )
    .unwrap();
    let src = vec!["C1:001".to_string()];
    let entry = |trigger| NewEntry {
        trigger,
        resolution: "pin serde to 1.0.200",
        kind: KnowledgeKind::Failure,
        source: &src,
        cost_or_saved: 1,
    };

    let first = knowledge::store(&rt, entry("serde derive macro fails to compile")).unwrap();
    assert_eq!(first.status, StoreStatus::Added);
    assert!(!first.degraded);

    down.store(true, Ordering::SeqCst);
    let offline = knowledge::store(&rt, entry("serde derive macro fails to compile")).unwrap();
    assert_eq!(offline.status, StoreStatus::Added);
    assert!(offline.degraded);
    assert_ne!(offline.name, first.name);
    assert!(knowledge::get(&rt, &offline.name).unwrap().entry.embedding.is_none());
    assert!(knowledge::recall(&rt, "serde derive", None, None, false).unwrap().degraded);

    // Once the embedder is back, the entry stored offline is embedded on read.
    down.store(false, Ordering::SeqCst);
    let recalled = knowledge::recall(&rt, "serde derive macro fails to compile", None, None, false)
        .unwrap();
    assert!(!recalled.degraded);
    let hit = recalled.results.iter().find(|r| r.name == offline.name).unwrap();
    assert!(hit.relevance.unwrap() > 0.99);
}

#[test]
fn test_health_reports_backend_and_counts() {
    let (_tmp, rt) = test_runtime();
    put(&rt, "one failure", "", KnowledgeKind::Failure, "a");
    put(&rt, "one pattern that works", "", KnowledgeKind::Pattern, "b");
    let health = knowledge::health(&rt).unwrap();
    assert_eq!(health.backend, "ngram");
    assert_eq!(health.total, 2);
    assert_eq!(health.never_used, 2);
    assert_eq!(health.entries.get("failure"), Some(&1));
    assert_eq!(health.missing_embeddings, 0);
}

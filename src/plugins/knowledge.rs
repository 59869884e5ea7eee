//! Scored knowledge store.
//!
//! Entries are lessons captured from execution: failures, patterns, facts,
//! decisions, and evolutions. Each kind carries its own scoring profile, so a
//! week-old failure and a year-old decision age at different rates. Recall
//! ranks entries by weighted relevance, effectiveness, and recency, scaled by
//! importance, and can expand results through the relationship graph.

use crate::core::db;
use crate::core::error::CairnError;
use crate::core::runtime::Runtime;
use crate::core::similarity::{self, BackendMode, Probe, SimilarityBackend};
use crate::core::time;
use crate::plugins::graph::{self, RelType};
use rayon::prelude::*;
use rusqlite::{Connection, OptionalExtension, params};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Importance below this is pruned (four consecutive decay halvings).
pub const IMPORTANCE_FLOOR: f64 = 1.0 / 16.0;
/// Importance regained per unit of positive feedback.
const IMPORTANCE_RESTORE_RATE: f64 = 0.25;
const MAX_SLUG_LEN: usize = 48;
const STALE_AFTER_DAYS: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KnowledgeKind {
    Failure,
    Pattern,
    Fact,
    Decision,
    Evolution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityClass {
    /// Bounded by `knowledge.failure_capacity`.
    Failure,
    /// Bounded by `knowledge.pattern_capacity`.
    Pattern,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct KindProfile {
    pub w_relevance: f64,
    pub w_effectiveness: f64,
    pub w_recency: f64,
    pub half_life_days: f64,
    pub capacity: CapacityClass,
}

static KIND_PROFILES: [(KnowledgeKind, KindProfile); 5] = [
    (
        KnowledgeKind::Failure,
        KindProfile {
            w_relevance: 0.60,
            w_effectiveness: 0.25,
            w_recency: 0.15,
            half_life_days: 14.0,
            capacity: CapacityClass::Failure,
        },
    ),
    (
        KnowledgeKind::Evolution,
        KindProfile {
            w_relevance: 0.50,
            w_effectiveness: 0.20,
            w_recency: 0.30,
            half_life_days: 7.0,
            capacity: CapacityClass::Failure,
        },
    ),
    (
        KnowledgeKind::Pattern,
        KindProfile {
            w_relevance: 0.50,
            w_effectiveness: 0.35,
            w_recency: 0.15,
            half_life_days: 60.0,
            capacity: CapacityClass::Pattern,
        },
    ),
    (
        KnowledgeKind::Fact,
        KindProfile {
            w_relevance: 0.70,
            w_effectiveness: 0.20,
            w_recency: 0.10,
            half_life_days: 180.0,
            capacity: CapacityClass::Pattern,
        },
    ),
    (
        KnowledgeKind::Decision,
        KindProfile {
            w_relevance: 0.60,
            w_effectiveness: 0.30,
            w_recency: 0.10,
            half_life_days: 365.0,
            capacity: CapacityClass::Pattern,
        },
    ),
];

impl KnowledgeKind {
    pub const ALL: [KnowledgeKind; 5] = [
        KnowledgeKind::Failure,
        KnowledgeKind::Pattern,
        KnowledgeKind::Fact,
        KnowledgeKind::Decision,
        KnowledgeKind::Evolution,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            KnowledgeKind::Failure => "failure",
            KnowledgeKind::Pattern => "pattern",
            KnowledgeKind::Fact => "fact",
            KnowledgeKind::Decision => "decision",
            KnowledgeKind::Evolution => "evolution",
        }
    }

    pub fn profile(&self) -> &'static KindProfile {
        KIND_PROFILES
            .iter()
            .find(|(kind, _)| kind == self)
            .map(|(_, profile)| profile)
            .unwrap_or(&KIND_PROFILES[0].1)
    }
}

impl FromStr for KnowledgeKind {
    type Err = CairnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        KnowledgeKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s.trim())
            .ok_or_else(|| {
                CairnError::ValidationError(format!(
                    "unknown knowledge kind '{}' (expected failure|pattern|fact|decision|evolution)",
                    s
                ))
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub name: String,
    pub kind: KnowledgeKind,
    pub trigger: String,
    pub resolution: String,
    pub cost_or_saved: i64,
    pub source: Vec<String>,
    pub created_at: String,
    pub last_used: String,
    pub helped: f64,
    pub failed: f64,
    pub importance: f64,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

impl KnowledgeEntry {
    pub fn effectiveness(&self) -> f64 {
        effectiveness(self.helped, self.failed)
    }

    pub fn uses(&self) -> f64 {
        self.helped + self.failed
    }
}

/// Laplace-smoothed help rate; 0.5 for an unused entry.
pub fn effectiveness(helped: f64, failed: f64) -> f64 {
    (helped + 1.0) / (helped + failed + 2.0)
}

/// Exponential decay with the given half-life.
pub fn recency(age_days: f64, half_life_days: f64) -> f64 {
    0.5_f64.powf(age_days.max(0.0) / half_life_days)
}

/// Weighted score for one entry; `relevance` is `None` when recall is degraded.
pub fn score(entry: &KnowledgeEntry, relevance: Option<f64>, now: i64) -> ScoredEntry {
    let profile = entry.kind.profile();
    let eff = entry.effectiveness();
    let rec = recency(time::age_days(&entry.last_used, now), profile.half_life_days);
    let weighted = profile.w_relevance * relevance.unwrap_or(0.0)
        + profile.w_effectiveness * eff
        + profile.w_recency * rec;
    ScoredEntry {
        name: entry.name.clone(),
        kind: entry.kind,
        trigger: entry.trigger.clone(),
        resolution: entry.resolution.clone(),
        score: weighted * entry.importance,
        relevance,
        effectiveness: eff,
        recency: rec,
        importance: entry.importance,
        expanded_from: None,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Expansion {
    pub seed: String,
    pub hop_distance: usize,
    pub path_weight: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredEntry {
    pub name: String,
    pub kind: KnowledgeKind,
    pub trigger: String,
    pub resolution: String,
    pub score: f64,
    pub relevance: Option<f64>,
    pub effectiveness: f64,
    pub recency: f64,
    pub importance: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expanded_from: Option<Expansion>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecallResult {
    pub mode: BackendMode,
    /// True when the query could not be embedded and relevance was skipped.
    pub degraded: bool,
    pub results: Vec<ScoredEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreStatus {
    Added,
    Merged,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreOutcome {
    pub status: StoreStatus,
    pub name: String,
    /// Similarity to the entry merged into, when merged.
    pub similarity: Option<f64>,
    /// True when the trigger could not be embedded: the entry was added
    /// without an embedding and without a duplicate check.
    pub degraded: bool,
}

#[derive(Debug, Clone)]
pub struct NewEntry<'a> {
    pub trigger: &'a str,
    pub resolution: &'a str,
    pub kind: KnowledgeKind,
    pub source: &'a [String],
    pub cost_or_saved: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackOutcome {
    pub updated: Vec<String>,
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DecayedEntry {
    pub name: String,
    pub importance: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PruneReason {
    LowEffectiveness,
    LowImportance,
    Capacity,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrunedEntry {
    pub name: String,
    pub kind: KnowledgeKind,
    pub reason: PruneReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct CapacityOverflow {
    pub class: CapacityClass,
    pub bound: usize,
    pub before: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PruneReport {
    pub removed: Vec<PrunedEntry>,
    pub capacity: Vec<CapacityOverflow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergedPair {
    pub kept: String,
    pub absorbed: String,
    pub similarity: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryDetail {
    pub entry: KnowledgeEntry,
    pub outgoing: Vec<graph::KnowledgeEdge>,
    pub incoming: Vec<graph::KnowledgeEdge>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub backend: &'static str,
    pub mode: BackendMode,
    pub dimension: Option<usize>,
    pub fallback_reason: Option<String>,
    pub schema_version: u32,
    pub entries: BTreeMap<String, usize>,
    pub total: usize,
    pub edges: usize,
    pub never_used: usize,
    /// Entries unused for more than `STALE_AFTER_DAYS`.
    pub stale: usize,
    pub low_importance: usize,
    pub missing_embeddings: usize,
    pub mean_effectiveness: Option<f64>,
    pub failure_capacity: usize,
    pub pattern_capacity: usize,
}

const ENTRY_COLUMNS: &str = "name, kind, trigger_text, resolution, cost_or_saved, embedding, source, created_at, last_used, helped, failed, importance";

fn read_entry(row: &rusqlite::Row<'_>, dimension: usize) -> Result<KnowledgeEntry, CairnError> {
    let name: String = row.get(0)?;
    let kind_raw: String = row.get(1)?;
    let kind: KnowledgeKind = kind_raw.parse().map_err(|_| CairnError::MalformedRecord {
        location: format!("entries[{}].kind", name),
        detail: format!("unknown kind '{}'", kind_raw),
    })?;
    let blob: Option<Vec<u8>> = row.get(5)?;
    let embedding = match blob {
        Some(bytes) => Some(similarity::decode_embedding(
            &bytes,
            dimension,
            &format!("entries[{}].embedding", name),
        )?),
        None => None,
    };
    let source_raw: String = row.get(6)?;
    let source = db::decode_json(&source_raw, &format!("entries[{}].source", name))?;
    Ok(KnowledgeEntry {
        kind,
        trigger: row.get(2)?,
        resolution: row.get(3)?,
        cost_or_saved: row.get(4)?,
        embedding,
        source,
        created_at: row.get(7)?,
        last_used: row.get(8)?,
        helped: row.get(9)?,
        failed: row.get(10)?,
        importance: row.get(11)?,
        name,
    })
}

pub(crate) fn load_entries(
    conn: &Connection,
    kind: Option<KnowledgeKind>,
    dimension: usize,
) -> Result<Vec<KnowledgeEntry>, CairnError> {
    let sql = format!(
        "SELECT {} FROM entries WHERE (?1 IS NULL OR kind = ?1) ORDER BY created_at ASC, rowid ASC",
        ENTRY_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![kind.map(|k| k.as_str())])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(read_entry(row, dimension)?);
    }
    Ok(out)
}

fn load_entry(
    conn: &Connection,
    name: &str,
    dimension: usize,
) -> Result<Option<KnowledgeEntry>, CairnError> {
    let sql = format!("SELECT {} FROM entries WHERE name = ?1", ENTRY_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![name])?;
    match rows.next()? {
        Some(row) => Ok(Some(read_entry(row, dimension)?)),
        None => Ok(None),
    }
}

pub(crate) fn append_event(
    conn: &Connection,
    op: &str,
    name: Option<&str>,
    payload: serde_json::Value,
) -> Result<(), CairnError> {
    conn.execute(
        "INSERT INTO knowledge_events(event_id, ts, op, name, payload) VALUES(?1, ?2, ?3, ?4, ?5)",
        params![
            time::new_event_id(),
            time::now_epoch_z(),
            op,
            name,
            serde_json::to_string(&payload)?
        ],
    )?;
    Ok(())
}

/// Similarity probe for a stored entry under the session backend.
///
/// Semantic sessions compare stored embeddings; an entry without one (stored
/// during a lexical session) is embedded from its trigger on the fly.
fn entry_probe(backend: &dyn SimilarityBackend, entry: &KnowledgeEntry) -> Probe {
    let embedding = match backend.mode() {
        BackendMode::Lexical => None,
        BackendMode::Semantic => match &entry.embedding {
            Some(v) => Some(v.clone()),
            None => backend.embed(&entry.trigger).ok().flatten(),
        },
    };
    Probe {
        text: similarity::normalize(&entry.trigger),
        embedding,
    }
}

/// Readable, stable entry name derived from the trigger.
fn slugify(trigger: &str) -> String {
    let normalized = similarity::normalize(trigger);
    let mut slug = String::new();
    for word in normalized.split_whitespace() {
        let extra = if slug.is_empty() { word.len() } else { word.len() + 1 };
        if slug.len() + extra > MAX_SLUG_LEN {
            if slug.is_empty() {
                slug.extend(word.chars().take(MAX_SLUG_LEN));
            }
            break;
        }
        if !slug.is_empty() {
            slug.push('-');
        }
        slug.push_str(word);
    }
    if slug.is_empty() {
        "entry".to_string()
    } else {
        slug
    }
}

fn unique_name(conn: &Connection, base: &str) -> Result<String, CairnError> {
    let mut candidate = base.to_string();
    let mut n = 2;
    loop {
        let taken = conn
            .query_row(
                "SELECT 1 FROM entries WHERE name = ?1",
                params![candidate],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !taken {
            return Ok(candidate);
        }
        candidate = format!("{}-{}", base, n);
        n += 1;
    }
}

/// Sorted union of source ids.
fn merge_sources(into: &mut Vec<String>, extra: &[String]) {
    into.extend(extra.iter().cloned());
    into.sort();
    into.dedup();
}

/// Store a new lesson, merging into an existing near-duplicate of the same kind.
pub fn store(rt: &Runtime, new: NewEntry<'_>) -> Result<StoreOutcome, CairnError> {
    if new.trigger.trim().is_empty() {
        return Err(CairnError::ValidationError(
            "knowledge trigger must not be empty".to_string(),
        ));
    }
    if new.source.iter().any(|s| s.trim().is_empty()) {
        return Err(CairnError::ValidationError(
            "knowledge source ids must not be empty".to_string(),
        ));
    }
    let backend = rt.backend();
    let probe = match backend.probe(new.trigger) {
        Ok(p) => Some(p),
        Err(e) => {
            tracing::warn!(error = %e, "trigger embedding failed; storing without duplicate check");
            None
        }
    };
    let degraded = probe.is_none();
    let dimension = rt.embedding_dimension();
    let threshold = rt.config.knowledge.dedup_threshold;

    let outcome = rt
        .broker()
        .with_write(&rt.knowledge_db(), "knowledge.store", |conn| {
            let best = match &probe {
                Some(probe) => load_entries(conn, Some(new.kind), dimension)?
                    .into_iter()
                    .map(|e| {
                        let sim = backend.similarity(probe, &entry_probe(backend, &e));
                        (e, sim)
                    })
                    .filter(|(_, sim)| *sim >= threshold)
                    .max_by(|a, b| a.1.total_cmp(&b.1)),
                None => None,
            };

            let now = time::now_epoch_z();
            if let Some((existing, sim)) = best {
                let mut source = existing.source.clone();
                merge_sources(&mut source, new.source);
                let resolution = if existing.resolution.trim().is_empty() {
                    new.resolution.to_string()
                } else {
                    existing.resolution.clone()
                };
                conn.execute(
                    "UPDATE entries SET resolution = ?2, source = ?3, last_used = ?4,
                        cost_or_saved = MAX(cost_or_saved, ?5)
                     WHERE name = ?1",
                    params![
                        existing.name,
                        resolution,
                        serde_json::to_string(&source)?,
                        now,
                        new.cost_or_saved
                    ],
                )?;
                append_event(
                    conn,
                    "merge",
                    Some(&existing.name),
                    serde_json::json!({ "similarity": sim, "source": new.source }),
                )?;
                return Ok(StoreOutcome {
                    status: StoreStatus::Merged,
                    name: existing.name.clone(),
                    similarity: Some(sim),
                    degraded: false,
                });
            }

            let name = unique_name(conn, &slugify(new.trigger))?;
            let mut source = Vec::new();
            merge_sources(&mut source, new.source);
            let blob = probe
                .as_ref()
                .and_then(|p| p.embedding.as_deref())
                .map(similarity::encode_embedding);
            conn.execute(
                "INSERT INTO entries(name, kind, trigger_text, resolution, cost_or_saved, embedding,
                    source, created_at, last_used, helped, failed, importance)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, 0, 0, 1.0)",
                params![
                    name,
                    new.kind.as_str(),
                    new.trigger,
                    new.resolution,
                    new.cost_or_saved,
                    blob,
                    serde_json::to_string(&source)?,
                    now
                ],
            )?;
            append_event(
                conn,
                "store",
                Some(&name),
                serde_json::json!({ "kind": new.kind.as_str(), "source": new.source, "degraded": degraded }),
            )?;
            Ok(StoreOutcome {
                status: StoreStatus::Added,
                name,
                similarity: None,
                degraded,
            })
        })?;

    tracing::info!(name = %outcome.name, status = ?outcome.status, kind = new.kind.as_str(), "knowledge stored");
    Ok(outcome)
}

/// Rank entries against a query.
///
/// With `expand`, entries reachable from the ranked results through the
/// relationship graph are appended, their own score scaled by path weight
/// (capped at 1) so a strong `solves` edge cannot outrank its seed by more
/// than its relevance earns.
pub fn recall(
    rt: &Runtime,
    query: &str,
    kind: Option<KnowledgeKind>,
    limit: Option<usize>,
    expand: bool,
) -> Result<RecallResult, CairnError> {
    let cfg = &rt.config.knowledge;
    let limit = limit.unwrap_or(cfg.recall_limit);
    let backend = rt.backend();
    let query_probe = match backend.probe(query) {
        Ok(p) => Some(p),
        Err(e) => {
            tracing::warn!(error = %e, "query embedding failed; recall is degraded");
            None
        }
    };
    let degraded = query_probe.is_none();
    let now = time::now_secs();
    let dimension = rt.embedding_dimension();

    rt.broker()
        .with_read(&rt.knowledge_db(), "knowledge.recall", |conn| {
            let all = load_entries(conn, None, dimension)?;
            let candidates: Vec<&KnowledgeEntry> = all
                .iter()
                .filter(|e| kind.is_none_or(|k| e.kind == k))
                .collect();

            let relevance_of = |e: &KnowledgeEntry| -> Option<f64> {
                query_probe
                    .as_ref()
                    .map(|q| backend.similarity(q, &entry_probe(backend, e)))
            };

            let mut ranked: Vec<ScoredEntry> = candidates
                .par_iter()
                .filter_map(|e| {
                    let rel = relevance_of(e);
                    if rel.is_some_and(|r| r < cfg.min_relevance) {
                        return None;
                    }
                    Some(score(e, rel, now))
                })
                .collect();
            sort_scored(&mut ranked);
            ranked.truncate(limit);

            if expand && !ranked.is_empty() {
                let seeds: Vec<String> = ranked.iter().map(|s| s.name.clone()).collect();
                let hits =
                    graph::traverse_stored(conn, &seeds, cfg.expand_depth, cfg.expand_floor)?;
                let by_name: FxHashMap<&str, &KnowledgeEntry> =
                    all.iter().map(|e| (e.name.as_str(), e)).collect();
                for hit in hits {
                    if ranked.iter().any(|s| s.name == hit.name) {
                        continue;
                    }
                    let Some(entry) = by_name.get(hit.name.as_str()) else {
                        continue;
                    };
                    if kind.is_some_and(|k| entry.kind != k) {
                        continue;
                    }
                    let mut scored = score(entry, relevance_of(entry), now);
                    scored.score *= hit.path_weight.min(1.0);
                    scored.expanded_from = Some(Expansion {
                        seed: hit.via,
                        hop_distance: hit.hop_distance,
                        path_weight: hit.path_weight,
                    });
                    ranked.push(scored);
                }
                sort_scored(&mut ranked);
                ranked.truncate(limit);
            }

            Ok(RecallResult {
                mode: backend.mode(),
                degraded,
                results: ranked,
            })
        })
}

fn sort_scored(items: &mut [ScoredEntry]) {
    items.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.name.cmp(&b.name)));
}

/// Recall run once per kind; kinds with no hits are omitted.
pub fn recall_by_type(
    rt: &Runtime,
    query: &str,
    limit: Option<usize>,
) -> Result<BTreeMap<String, RecallResult>, CairnError> {
    let mut out = BTreeMap::new();
    for kind in KnowledgeKind::ALL {
        let result = recall(rt, query, Some(kind), limit, false)?;
        if !result.results.is_empty() {
            out.insert(kind.as_str().to_string(), result);
        }
    }
    Ok(out)
}

pub fn get(rt: &Runtime, name: &str) -> Result<EntryDetail, CairnError> {
    let dimension = rt.embedding_dimension();
    rt.broker()
        .with_read(&rt.knowledge_db(), "knowledge.get", |conn| {
            let entry = load_entry(conn, name, dimension)?.ok_or_else(|| {
                CairnError::NotFound(format!("knowledge entry '{}' not found", name))
            })?;
            Ok(EntryDetail {
                entry,
                outgoing: graph::outgoing_edges(conn, name, None)?,
                incoming: graph::incoming_edges(conn, name, None)?,
            })
        })
}

/// Apply outcome feedback to named entries.
///
/// Positive `delta` adds to `helped` and restores importance; negative adds
/// `|delta|` to `failed`. Both refresh `last_used`.
pub fn feedback(rt: &Runtime, names: &[String], delta: f64) -> Result<FeedbackOutcome, CairnError> {
    if !(delta.abs() > 0.0 && delta.abs() <= 1.0) {
        return Err(CairnError::ValidationError(format!(
            "feedback delta must satisfy 0 < |delta| <= 1, got {}",
            delta
        )));
    }
    let outcome = rt
        .broker()
        .with_write(&rt.knowledge_db(), "knowledge.feedback", |conn| {
            let now = time::now_epoch_z();
            let mut updated = Vec::new();
            let mut missing = Vec::new();
            for name in names {
                let changed = if delta > 0.0 {
                    conn.execute(
                        "UPDATE entries SET helped = helped + ?2,
                            importance = MIN(1.0, importance + ?3), last_used = ?4
                         WHERE name = ?1",
                        params![name, delta, delta * IMPORTANCE_RESTORE_RATE, now],
                    )?
                } else {
                    conn.execute(
                        "UPDATE entries SET failed = failed + ?2, last_used = ?3 WHERE name = ?1",
                        params![name, -delta, now],
                    )?
                };
                if changed == 0 {
                    missing.push(name.clone());
                } else {
                    append_event(conn, "feedback", Some(name), serde_json::json!({ "delta": delta }))?;
                    updated.push(name.clone());
                }
            }
            Ok(FeedbackOutcome { updated, missing })
        })?;
    if !outcome.missing.is_empty() {
        tracing::warn!(missing = ?outcome.missing, "feedback named unknown entries");
    }
    Ok(outcome)
}

/// Halve importance of entries unused for `unused_days` with fewer than `min_uses` uses.
pub fn decay(rt: &Runtime, unused_days: f64, min_uses: f64) -> Result<Vec<DecayedEntry>, CairnError> {
    let dimension = rt.embedding_dimension();
    let now = time::now_secs();
    rt.broker()
        .with_write(&rt.knowledge_db(), "knowledge.decay", |conn| {
            let mut decayed = Vec::new();
            for entry in load_entries(conn, None, dimension)? {
                if time::age_days(&entry.last_used, now) < unused_days || entry.uses() >= min_uses {
                    continue;
                }
                let importance = entry.importance * 0.5;
                conn.execute(
                    "UPDATE entries SET importance = ?2 WHERE name = ?1",
                    params![entry.name, importance],
                )?;
                decayed.push(DecayedEntry {
                    name: entry.name,
                    importance,
                });
            }
            append_event(
                conn,
                "decay",
                None,
                serde_json::json!({ "unused_days": unused_days, "min_uses": min_uses, "decayed": decayed.len() }),
            )?;
            Ok(decayed)
        })
}

fn capacity_bound(rt: &Runtime, class: CapacityClass) -> usize {
    match class {
        CapacityClass::Failure => rt.config.knowledge.failure_capacity,
        CapacityClass::Pattern => rt.config.knowledge.pattern_capacity,
    }
}

/// Remove ineffective or fully decayed entries, then enforce capacity bounds.
///
/// Only entries with at least `min_uses` recorded uses are judged on
/// effectiveness. Capacity eviction takes the lowest
/// `importance * effectiveness` first, oldest `last_used` breaking ties.
pub fn prune(rt: &Runtime, min_effectiveness: f64, min_uses: f64) -> Result<PruneReport, CairnError> {
    let dimension = rt.embedding_dimension();
    let bounds = [
        (CapacityClass::Failure, capacity_bound(rt, CapacityClass::Failure)),
        (CapacityClass::Pattern, capacity_bound(rt, CapacityClass::Pattern)),
    ];
    let report = rt
        .broker()
        .with_write(&rt.knowledge_db(), "knowledge.prune", |conn| {
            let mut removed = Vec::new();
            let mut survivors = Vec::new();
            for entry in load_entries(conn, None, dimension)? {
                let reason = if entry.uses() >= min_uses && entry.effectiveness() < min_effectiveness {
                    Some(PruneReason::LowEffectiveness)
                } else if entry.importance < IMPORTANCE_FLOOR {
                    Some(PruneReason::LowImportance)
                } else {
                    None
                };
                match reason {
                    Some(reason) => removed.push(PrunedEntry {
                        name: entry.name,
                        kind: entry.kind,
                        reason,
                    }),
                    None => survivors.push(entry),
                }
            }

            let mut capacity = Vec::new();
            for (class, bound) in bounds {
                let mut members: Vec<&KnowledgeEntry> = survivors
                    .iter()
                    .filter(|e| e.kind.profile().capacity == class)
                    .collect();
                if members.len() <= bound {
                    continue;
                }
                let before = members.len();
                members.sort_by(|a, b| {
                    (a.importance * a.effectiveness())
                        .total_cmp(&(b.importance * b.effectiveness()))
                        .then_with(|| {
                            time::parse_epoch_z(&a.last_used)
                                .cmp(&time::parse_epoch_z(&b.last_used))
                        })
                        .then_with(|| a.name.cmp(&b.name))
                });
                let overflow = before - bound;
                for e in members.into_iter().take(overflow) {
                    removed.push(PrunedEntry {
                        name: e.name.clone(),
                        kind: e.kind,
                        reason: PruneReason::Capacity,
                    });
                }
                capacity.push(CapacityOverflow {
                    class,
                    bound,
                    before,
                    removed: overflow,
                });
            }

            for p in &removed {
                conn.execute("DELETE FROM entries WHERE name = ?1", params![p.name])?;
                append_event(
                    conn,
                    "prune",
                    Some(&p.name),
                    serde_json::json!({ "reason": p.reason }),
                )?;
            }
            Ok(PruneReport { removed, capacity })
        })?;
    if !report.removed.is_empty() {
        tracing::info!(removed = report.removed.len(), "knowledge pruned");
    }
    Ok(report)
}

/// Merge near-duplicates within each kind.
///
/// The earlier entry absorbs the later one's counters and sources, keeps the
/// higher importance and the more recent `last_used`, and inherits its edges.
pub fn consolidate(rt: &Runtime, threshold: Option<f64>) -> Result<Vec<MergedPair>, CairnError> {
    let threshold = threshold.unwrap_or(rt.config.knowledge.dedup_threshold);
    if !(0.0..=1.0).contains(&threshold) {
        return Err(CairnError::ValidationError(format!(
            "consolidate threshold must be within [0, 1], got {}",
            threshold
        )));
    }
    let backend = rt.backend();
    let dimension = rt.embedding_dimension();
    rt.broker()
        .with_write(&rt.knowledge_db(), "knowledge.consolidate", |conn| {
            let mut merged = Vec::new();
            for kind in KnowledgeKind::ALL {
                let mut entries = load_entries(conn, Some(kind), dimension)?;
                let probes: Vec<Probe> = entries.iter().map(|e| entry_probe(backend, e)).collect();
                let mut absorbed = vec![false; entries.len()];
                for i in 0..entries.len() {
                    if absorbed[i] {
                        continue;
                    }
                    for j in (i + 1)..entries.len() {
                        if absorbed[j] {
                            continue;
                        }
                        let sim = backend.similarity(&probes[i], &probes[j]);
                        if sim < threshold {
                            continue;
                        }
                        absorbed[j] = true;
                        let (keep, gone) = entries.split_at_mut(j);
                        absorb(conn, &mut keep[i], &gone[0])?;
                        merged.push(MergedPair {
                            kept: keep[i].name.clone(),
                            absorbed: gone[0].name.clone(),
                            similarity: sim,
                        });
                    }
                }
            }
            if !merged.is_empty() {
                tracing::info!(merged = merged.len(), "knowledge consolidated");
            }
            Ok(merged)
        })
}

fn absorb(conn: &Connection, keep: &mut KnowledgeEntry, gone: &KnowledgeEntry) -> Result<(), CairnError> {
    keep.helped += gone.helped;
    keep.failed += gone.failed;
    keep.importance = keep.importance.max(gone.importance);
    keep.cost_or_saved = keep.cost_or_saved.max(gone.cost_or_saved);
    if time::parse_epoch_z(&gone.last_used) > time::parse_epoch_z(&keep.last_used) {
        keep.last_used = gone.last_used.clone();
    }
    merge_sources(&mut keep.source, &gone.source);

    conn.execute(
        "UPDATE entries SET helped = ?2, failed = ?3, importance = ?4, cost_or_saved = ?5,
            last_used = ?6, source = ?7
         WHERE name = ?1",
        params![
            keep.name,
            keep.helped,
            keep.failed,
            keep.importance,
            keep.cost_or_saved,
            keep.last_used,
            serde_json::to_string(&keep.source)?
        ],
    )?;

    for e in graph::outgoing_edges(conn, &gone.name, None)? {
        if e.to != keep.name {
            graph::upsert_edge(conn, &keep.name, &e.to, e.rel_type, e.weight)?;
        }
    }
    for e in graph::incoming_edges(conn, &gone.name, None)? {
        if e.from != keep.name {
            graph::upsert_edge(conn, &e.from, &keep.name, e.rel_type, e.weight)?;
        }
    }
    conn.execute("DELETE FROM entries WHERE name = ?1", params![gone.name])?;
    append_event(
        conn,
        "consolidate",
        Some(&keep.name),
        serde_json::json!({ "absorbed": gone.name }),
    )
}

pub fn health(rt: &Runtime) -> Result<HealthReport, CairnError> {
    let dimension = rt.embedding_dimension();
    let backend = rt.backend();
    rt.broker()
        .with_read(&rt.knowledge_db(), "knowledge.health", |conn| {
            let all = load_entries(conn, None, dimension)?;
            let now = time::now_secs();
            let edges: i64 = conn.query_row("SELECT COUNT(*) FROM edges", [], |r| r.get(0))?;
            let mut by_kind: BTreeMap<String, usize> = KnowledgeKind::ALL
                .iter()
                .map(|k| (k.as_str().to_string(), 0))
                .collect();
            for e in &all {
                *by_kind.entry(e.kind.as_str().to_string()).or_default() += 1;
            }
            let used: Vec<f64> = all
                .iter()
                .filter(|e| e.uses() > 0.0)
                .map(KnowledgeEntry::effectiveness)
                .collect();
            let mean_effectiveness = if used.is_empty() {
                None
            } else {
                Some(used.iter().sum::<f64>() / used.len() as f64)
            };
            Ok(HealthReport {
                backend: backend.name(),
                mode: backend.mode(),
                dimension: backend.dimension(),
                fallback_reason: rt.fallback_reason().map(str::to_string),
                schema_version: db::schema_version(conn)?,
                total: all.len(),
                edges: edges as usize,
                never_used: all.iter().filter(|e| e.uses() == 0.0).count(),
                stale: all
                    .iter()
                    .filter(|e| time::age_days(&e.last_used, now) > STALE_AFTER_DAYS)
                    .count(),
                low_importance: all.iter().filter(|e| e.importance < 0.25).count(),
                missing_embeddings: all.iter().filter(|e| e.embedding.is_none()).count(),
                mean_effectiveness,
                entries: by_kind,
                failure_capacity: rt.config.knowledge.failure_capacity,
                pattern_capacity: rt.config.knowledge.pattern_capacity,
            })
        })
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "knowledge",
        "version": "0.4.0",
        "description": "Scored knowledge entries with a typed relationship graph",
        "commands": [
            { "name": "store", "parameters": ["trigger", "resolution", "kind", "source", "cost"] },
            { "name": "recall", "parameters": ["query", "kind", "limit", "expand"] },
            { "name": "recall-by-type", "parameters": ["query", "limit"] },
            { "name": "get", "parameters": ["name"] },
            { "name": "edge", "parameters": ["from", "to", "rel", "weight"] },
            { "name": "edges", "parameters": ["name", "rel"] },
            { "name": "traverse", "parameters": ["seeds", "depth", "floor"] },
            { "name": "feedback", "parameters": ["names", "delta"] },
            { "name": "decay", "parameters": ["unused_days", "min_uses"] },
            { "name": "prune", "parameters": ["min_effectiveness", "min_uses"] },
            { "name": "consolidate", "parameters": ["threshold"] },
            { "name": "health", "parameters": [] }
        ],
        "kinds": KnowledgeKind::ALL.iter().map(|k| serde_json::json!({
            "kind": k.as_str(),
            "profile": k.profile(),
        })).collect::<Vec<_>>(),
        "relationships": RelType::ALL.iter().map(|r| serde_json::json!({
            "rel_type": r.as_str(),
            "default_weight": r.default_weight(),
        })).collect::<Vec<_>>(),
        "storage": ["knowledge.db"]
    })
}

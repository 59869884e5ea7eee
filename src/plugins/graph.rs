//! Typed, weighted relationships between knowledge entries.
//!
//! Edges are directed and keyed by `(from, to, rel_type)`. Re-adding an
//! existing edge keeps the larger weight, so repeated evidence can only
//! strengthen a relationship. Traversal multiplies weights along a path and
//! stops extending any path whose product drops under the floor.

use crate::core::error::CairnError;
use crate::core::runtime::Runtime;
use crate::core::time;
use rusqlite::{Connection, OptionalExtension, params};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::str::FromStr;

pub const MAX_EDGE_WEIGHT: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelType {
    Solves,
    Causes,
    Prevents,
    Supersedes,
    Related,
    CoOccurs,
}

impl RelType {
    pub const ALL: [RelType; 6] = [
        RelType::Solves,
        RelType::Causes,
        RelType::Prevents,
        RelType::Supersedes,
        RelType::Related,
        RelType::CoOccurs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RelType::Solves => "solves",
            RelType::Causes => "causes",
            RelType::Prevents => "prevents",
            RelType::Supersedes => "supersedes",
            RelType::Related => "related",
            RelType::CoOccurs => "co_occurs",
        }
    }

    /// Weight used when the caller does not supply one.
    pub fn default_weight(&self) -> f64 {
        match self {
            RelType::Solves => 1.5,
            RelType::Causes => 1.2,
            RelType::Prevents => 1.2,
            RelType::Supersedes => 1.0,
            RelType::Related => 0.8,
            RelType::CoOccurs => 0.6,
        }
    }
}

impl FromStr for RelType {
    type Err = CairnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RelType::ALL
            .iter()
            .copied()
            .find(|r| r.as_str() == s.trim())
            .ok_or_else(|| {
                CairnError::ValidationError(format!(
                    "unknown relationship type '{}' (expected one of: solves, causes, prevents, supersedes, related, co_occurs)",
                    s
                ))
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeEdge {
    pub from: String,
    pub to: String,
    pub rel_type: RelType,
    pub weight: f64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeStatus {
    Created,
    Strengthened,
    Unchanged,
}

#[derive(Debug, Clone, Serialize)]
pub struct EdgeOutcome {
    pub status: EdgeStatus,
    pub edge: KnowledgeEdge,
}

#[derive(Debug, Clone, Serialize)]
pub struct EdgeListing {
    pub name: String,
    pub outgoing: Vec<KnowledgeEdge>,
    pub incoming: Vec<KnowledgeEdge>,
}

/// A node reached from one of the seeds.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TraversalHit {
    pub name: String,
    /// Seed the best path started from.
    pub via: String,
    pub hop_distance: usize,
    pub path_weight: f64,
}

pub fn validate_weight(weight: f64) -> Result<(), CairnError> {
    if !(weight > 0.0 && weight <= MAX_EDGE_WEIGHT) {
        return Err(CairnError::ValidationError(format!(
            "edge weight must be within (0, {}], got {}",
            MAX_EDGE_WEIGHT, weight
        )));
    }
    Ok(())
}

const EDGE_COLUMNS: &str = "from_name, to_name, rel_type, weight, created_at, updated_at";

fn read_edge(row: &rusqlite::Row<'_>) -> Result<KnowledgeEdge, CairnError> {
    let rel: String = row.get(2)?;
    let rel_type: RelType = rel.parse().map_err(|_| CairnError::MalformedRecord {
        location: "edges.rel_type".to_string(),
        detail: format!("unknown relationship type '{}'", rel),
    })?;
    Ok(KnowledgeEdge {
        from: row.get(0)?,
        to: row.get(1)?,
        rel_type,
        weight: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn query_edges(
    conn: &Connection,
    sql: &str,
    name: &str,
    rel: Option<RelType>,
) -> Result<Vec<KnowledgeEdge>, CairnError> {
    let mut stmt = conn.prepare(sql)?;
    let rel = rel.map(|r| r.as_str());
    let mut rows = stmt.query(params![name, rel])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(read_edge(row)?);
    }
    Ok(out)
}

pub(crate) fn outgoing_edges(
    conn: &Connection,
    name: &str,
    rel: Option<RelType>,
) -> Result<Vec<KnowledgeEdge>, CairnError> {
    let sql = format!(
        "SELECT {} FROM edges WHERE from_name = ?1 AND (?2 IS NULL OR rel_type = ?2)
         ORDER BY weight DESC, to_name ASC",
        EDGE_COLUMNS
    );
    query_edges(conn, &sql, name, rel)
}

pub(crate) fn incoming_edges(
    conn: &Connection,
    name: &str,
    rel: Option<RelType>,
) -> Result<Vec<KnowledgeEdge>, CairnError> {
    let sql = format!(
        "SELECT {} FROM edges WHERE to_name = ?1 AND (?2 IS NULL OR rel_type = ?2)
         ORDER BY weight DESC, from_name ASC",
        EDGE_COLUMNS
    );
    query_edges(conn, &sql, name, rel)
}

fn entry_exists(conn: &Connection, name: &str) -> Result<bool, CairnError> {
    Ok(conn
        .query_row("SELECT 1 FROM entries WHERE name = ?1", params![name], |_| {
            Ok(())
        })
        .optional()?
        .is_some())
}

/// Insert or strengthen an edge inside an open write transaction.
pub(crate) fn upsert_edge(
    conn: &Connection,
    from: &str,
    to: &str,
    rel_type: RelType,
    weight: f64,
) -> Result<EdgeOutcome, CairnError> {
    validate_weight(weight)?;
    if from == to {
        return Err(CairnError::ValidationError(format!(
            "edge endpoints must differ (got '{}' twice)",
            from
        )));
    }
    for name in [from, to] {
        if !entry_exists(conn, name)? {
            return Err(CairnError::NotFound(format!(
                "knowledge entry '{}' not found",
                name
            )));
        }
    }

    let now = time::now_epoch_z();
    let existing: Option<(f64, String)> = conn
        .query_row(
            "SELECT weight, created_at FROM edges
             WHERE from_name = ?1 AND to_name = ?2 AND rel_type = ?3",
            params![from, to, rel_type.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let (status, weight, created_at) = match existing {
        None => {
            conn.execute(
                "INSERT INTO edges(from_name, to_name, rel_type, weight, created_at, updated_at)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?5)",
                params![from, to, rel_type.as_str(), weight, now],
            )?;
            (EdgeStatus::Created, weight, now.clone())
        }
        Some((current, created_at)) if weight > current => {
            conn.execute(
                "UPDATE edges SET weight = ?4, updated_at = ?5
                 WHERE from_name = ?1 AND to_name = ?2 AND rel_type = ?3",
                params![from, to, rel_type.as_str(), weight, now],
            )?;
            (EdgeStatus::Strengthened, weight, created_at)
        }
        Some((current, created_at)) => (EdgeStatus::Unchanged, current, created_at),
    };

    Ok(EdgeOutcome {
        status,
        edge: KnowledgeEdge {
            from: from.to_string(),
            to: to.to_string(),
            rel_type,
            weight,
            created_at,
            updated_at: now,
        },
    })
}

/// Record a relationship between two existing entries.
pub fn edge(
    rt: &Runtime,
    from: &str,
    to: &str,
    rel_type: RelType,
    weight: Option<f64>,
) -> Result<EdgeOutcome, CairnError> {
    let weight = weight.unwrap_or_else(|| rel_type.default_weight());
    let outcome = rt
        .broker()
        .with_write(&rt.knowledge_db(), "knowledge.edge", |conn| {
            let outcome = upsert_edge(conn, from, to, rel_type, weight)?;
            crate::plugins::knowledge::append_event(
                conn,
                "edge",
                Some(from),
                serde_json::json!({
                    "to": to,
                    "rel_type": rel_type.as_str(),
                    "weight": outcome.edge.weight,
                    "status": outcome.status,
                }),
            )?;
            Ok(outcome)
        })?;
    tracing::debug!(from, to, rel = rel_type.as_str(), status = ?outcome.status, "edge recorded");
    Ok(outcome)
}

pub fn edges(rt: &Runtime, name: &str, rel: Option<RelType>) -> Result<EdgeListing, CairnError> {
    rt.broker()
        .with_read(&rt.knowledge_db(), "knowledge.edges", |conn| {
            if !entry_exists(conn, name)? {
                return Err(CairnError::NotFound(format!(
                    "knowledge entry '{}' not found",
                    name
                )));
            }
            Ok(EdgeListing {
                name: name.to_string(),
                outgoing: outgoing_edges(conn, name, rel)?,
                incoming: incoming_edges(conn, name, rel)?,
            })
        })
}

/// Breadth-first expansion from `seeds` over outgoing edges.
///
/// `neighbors` returns `(target, edge_weight)` pairs for a node. Seeds are
/// never returned. A node reached by several paths reports its heaviest one.
/// A path is extended unless another path to the same node is at least as
/// heavy and no deeper. A path whose cumulative product falls under `floor`
/// is not extended.
pub fn traverse<F>(
    seeds: &[String],
    max_depth: usize,
    floor: f64,
    mut neighbors: F,
) -> Result<Vec<TraversalHit>, CairnError>
where
    F: FnMut(&str) -> Result<Vec<(String, f64)>, CairnError>,
{
    let seed_set: FxHashSet<&str> = seeds.iter().map(String::as_str).collect();
    let mut best: FxHashMap<String, TraversalHit> = FxHashMap::default();
    // (depth, weight) of every path queued per node.
    let mut queued: FxHashMap<String, Vec<(usize, f64)>> = FxHashMap::default();
    let mut queue: VecDeque<(String, String, usize, f64)> = seeds
        .iter()
        .map(|s| (s.clone(), s.clone(), 0, 1.0))
        .collect();

    while let Some((node, seed, depth, weight)) = queue.pop_front() {
        if depth >= max_depth {
            continue;
        }
        for (target, edge_weight) in neighbors(&node)? {
            if seed_set.contains(target.as_str()) {
                continue;
            }
            let path_weight = weight * edge_weight;
            if path_weight < floor {
                continue;
            }
            let hop = depth + 1;
            let states = queued.entry(target.clone()).or_default();
            if states.iter().any(|&(d, w)| d <= hop && w >= path_weight) {
                continue;
            }
            states.push((hop, path_weight));
            if best
                .get(&target)
                .is_none_or(|hit| hit.path_weight < path_weight)
            {
                best.insert(
                    target.clone(),
                    TraversalHit {
                        name: target.clone(),
                        via: seed.clone(),
                        hop_distance: hop,
                        path_weight,
                    },
                );
            }
            queue.push_back((target, seed.clone(), hop, path_weight));
        }
    }

    let mut hits: Vec<TraversalHit> = best.into_values().collect();
    hits.sort_by(|a, b| {
        b.path_weight
            .total_cmp(&a.path_weight)
            .then(a.hop_distance.cmp(&b.hop_distance))
            .then(a.name.cmp(&b.name))
    });
    Ok(hits)
}

/// Traverse using the stored graph.
pub(crate) fn traverse_stored(
    conn: &Connection,
    seeds: &[String],
    max_depth: usize,
    floor: f64,
) -> Result<Vec<TraversalHit>, CairnError> {
    traverse(seeds, max_depth, floor, |node| {
        Ok(outgoing_edges(conn, node, None)?
            .into_iter()
            .map(|e| (e.to, e.weight))
            .collect())
    })
}

pub fn traverse_from(
    rt: &Runtime,
    seeds: &[String],
    depth: Option<usize>,
    floor: Option<f64>,
) -> Result<Vec<TraversalHit>, CairnError> {
    let depth = depth.unwrap_or(rt.config.knowledge.expand_depth);
    let floor = floor.unwrap_or(rt.config.knowledge.expand_floor);
    rt.broker()
        .with_read(&rt.knowledge_db(), "knowledge.traverse", |conn| {
            for seed in seeds {
                if !entry_exists(conn, seed)? {
                    return Err(CairnError::NotFound(format!(
                        "knowledge entry '{}' not found",
                        seed
                    )));
                }
            }
            traverse_stored(conn, seeds, depth, floor)
        })
}

//! Similarity capability used for deduplication and relevance scoring.
//!
//! Two families of backend exist:
//! - semantic: produce fixed-length embeddings compared by cosine
//!   (`NgramEmbedding` locally, `CommandEmbedding` through an external program)
//! - lexical: token-overlap similarity over normalized text, no embeddings
//!
//! Exactly one backend is chosen when the runtime opens. If a semantic backend
//! fails its warm-up probe the whole session runs lexical; measures are never
//! mixed within one session.

use crate::core::config::{BackendChoice, EmbeddingConfig};
use crate::core::error::CairnError;
use rustc_hash::{FxHashSet, FxHasher};
use serde::Serialize;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::process::{Command, Stdio};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    Semantic,
    Lexical,
}

/// Normalized text plus its embedding (semantic backends only).
#[derive(Debug, Clone)]
pub struct Probe {
    pub text: String,
    pub embedding: Option<Vec<f32>>,
}

pub trait SimilarityBackend: Send + Sync {
    /// Backend identifier reported by `health`.
    fn name(&self) -> &'static str;

    fn mode(&self) -> BackendMode;

    /// Embedding length; `None` for lexical backends.
    fn dimension(&self) -> Option<usize>;

    /// Embed a text. Lexical backends return `Ok(None)`.
    fn embed(&self, text: &str) -> Result<Option<Vec<f32>>, CairnError>;

    /// Similarity in [0, 1] between two probes built by this backend.
    fn similarity(&self, a: &Probe, b: &Probe) -> f64;

    fn probe(&self, text: &str) -> Result<Probe, CairnError> {
        Ok(Probe {
            text: normalize(text),
            embedding: self.embed(text)?,
        })
    }

    fn warm_up(&self) -> Result<(), CairnError> {
        self.embed("warm-up probe").map(|_| ())
    }
}

/// Lowercase, map non-alphanumerics to spaces, collapse whitespace.
pub fn normalize(text: &str) -> String {
    let mapped: String = text
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn tokens(normalized: &str) -> FxHashSet<&str> {
    normalized.split_whitespace().collect()
}

pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

pub fn jaccard(a: &str, b: &str) -> f64 {
    let ta = tokens(a);
    let tb = tokens(b);
    if ta.is_empty() && tb.is_empty() {
        return 0.0;
    }
    let inter = ta.intersection(&tb).count() as f64;
    let union = ta.union(&tb).count() as f64;
    inter / union
}

/// Little-endian f32 blob for the `embedding` columns.
pub fn encode_embedding(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for x in v {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

pub fn decode_embedding(
    blob: &[u8],
    dimension: usize,
    location: &str,
) -> Result<Vec<f32>, CairnError> {
    if blob.len() != dimension * 4 {
        return Err(CairnError::MalformedRecord {
            location: location.to_string(),
            detail: format!(
                "embedding blob is {} bytes, expected {} ({} x f32)",
                blob.len(),
                dimension * 4,
                dimension
            ),
        });
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn cosine_of(a: &Probe, b: &Probe) -> f64 {
    match (&a.embedding, &b.embedding) {
        (Some(x), Some(y)) => cosine(x, y).clamp(0.0, 1.0),
        _ => 0.0,
    }
}

/// Feature-hashing embedder over words, word bigrams, and character trigrams.
pub struct NgramEmbedding {
    dimension: usize,
}

impl NgramEmbedding {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn add_feature(&self, v: &mut [f32], feature: &str, weight: f32) {
        let mut hasher = FxHasher::default();
        feature.hash(&mut hasher);
        let h = hasher.finish();
        let bucket = (h % self.dimension as u64) as usize;
        let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
        v[bucket] += sign * weight;
    }

    fn embed_normalized(&self, normalized: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimension];
        let words: Vec<&str> = normalized.split_whitespace().collect();
        for w in &words {
            self.add_feature(&mut v, &format!("w:{}", w), 1.0);
        }
        for pair in words.windows(2) {
            self.add_feature(&mut v, &format!("b:{} {}", pair[0], pair[1]), 0.5);
        }
        let padded: Vec<char> = format!(" {} ", normalized).chars().collect();
        for tri in padded.windows(3) {
            let s: String = tri.iter().collect();
            self.add_feature(&mut v, &format!("c:{}", s), 0.5);
        }

        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

impl SimilarityBackend for NgramEmbedding {
    fn name(&self) -> &'static str {
        "ngram"
    }

    fn mode(&self) -> BackendMode {
        BackendMode::Semantic
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.dimension)
    }

    fn embed(&self, text: &str) -> Result<Option<Vec<f32>>, CairnError> {
        Ok(Some(self.embed_normalized(&normalize(text))))
    }

    fn similarity(&self, a: &Probe, b: &Probe) -> f64 {
        cosine_of(a, b)
    }
}

/// Embeddings from an external program: text on stdin, JSON array of floats on stdout.
pub struct CommandEmbedding {
    program: String,
    args: Vec<String>,
    dimension: usize,
}

impl CommandEmbedding {
    pub fn new(command: &[String], dimension: usize) -> Result<Self, CairnError> {
        let (program, args) = command.split_first().ok_or_else(|| {
            CairnError::ConfigError("embedding.command is empty".to_string())
        })?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            dimension,
        })
    }
}

impl SimilarityBackend for CommandEmbedding {
    fn name(&self) -> &'static str {
        "command"
    }

    fn mode(&self) -> BackendMode {
        BackendMode::Semantic
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.dimension)
    }

    fn embed(&self, text: &str) -> Result<Option<Vec<f32>>, CairnError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                CairnError::BackendUnavailable(format!("failed to spawn {}: {}", self.program, e))
            })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(text.as_bytes()).map_err(|e| {
                CairnError::BackendUnavailable(format!("failed to write to {}: {}", self.program, e))
            })?;
        }
        let output = child.wait_with_output().map_err(|e| {
            CairnError::BackendUnavailable(format!("{} did not finish: {}", self.program, e))
        })?;
        if !output.status.success() {
            return Err(CairnError::BackendUnavailable(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let v: Vec<f32> = serde_json::from_slice(&output.stdout).map_err(|e| {
            CairnError::BackendUnavailable(format!("{} returned invalid JSON: {}", self.program, e))
        })?;
        if v.len() != self.dimension {
            return Err(CairnError::BackendUnavailable(format!(
                "{} returned {} dimensions, expected {}",
                self.program,
                v.len(),
                self.dimension
            )));
        }
        Ok(Some(v))
    }

    fn similarity(&self, a: &Probe, b: &Probe) -> f64 {
        cosine_of(a, b)
    }
}

/// Word-set Jaccard similarity over normalized text.
pub struct LexicalOverlap;

impl SimilarityBackend for LexicalOverlap {
    fn name(&self) -> &'static str {
        "lexical"
    }

    fn mode(&self) -> BackendMode {
        BackendMode::Lexical
    }

    fn dimension(&self) -> Option<usize> {
        None
    }

    fn embed(&self, _text: &str) -> Result<Option<Vec<f32>>, CairnError> {
        Ok(None)
    }

    fn similarity(&self, a: &Probe, b: &Probe) -> f64 {
        jaccard(&a.text, &b.text)
    }
}

/// Backend chosen at startup, plus the reason when it is a fallback.
pub struct SelectedBackend {
    pub backend: Box<dyn SimilarityBackend>,
    pub fallback_reason: Option<String>,
}

/// Choose the session backend once. A semantic backend that fails its
/// warm-up probe is replaced by the lexical one for the whole session.
pub fn select_backend(config: &EmbeddingConfig) -> SelectedBackend {
    let candidate: Result<Box<dyn SimilarityBackend>, CairnError> = match config.backend {
        BackendChoice::Lexical => {
            return SelectedBackend {
                backend: Box::new(LexicalOverlap),
                fallback_reason: None,
            };
        }
        BackendChoice::Ngram => Ok(Box::new(NgramEmbedding::new(config.dimension))),
        BackendChoice::Command => CommandEmbedding::new(&config.command, config.dimension)
            .map(|b| Box::new(b) as Box<dyn SimilarityBackend>),
    };

    match candidate.and_then(|b| b.warm_up().map(|_| b)) {
        Ok(backend) => {
            tracing::debug!(backend = backend.name(), "similarity backend ready");
            SelectedBackend {
                backend,
                fallback_reason: None,
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "embedding backend unavailable; using lexical similarity for this session");
            SelectedBackend {
                backend: Box::new(LexicalOverlap),
                fallback_reason: Some(e.to_string()),
            }
        }
    }
}

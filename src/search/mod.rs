//! Score fusion for generic (non-graph) retrieval hits.

pub mod hybrid;

pub use hybrid::{keyword_score, rank_knowledge_results, tokenize_query, RankParams, RankedResult, RetrievalMode};

use serde::{Deserialize, Serialize};

/// One already-scored retrieval hit. `score` is a semantic similarity in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeResult {
    pub path: String,
    pub snippet: String,
    pub score: f64,
}

impl KnowledgeResult {
    pub fn new(path: impl Into<String>, snippet: impl Into<String>, score: f64) -> Self {
        Self {
            path: path.into(),
            snippet: snippet.into(),
            score,
        }
    }
}

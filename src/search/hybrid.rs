use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::KgragError;
use crate::search::KnowledgeResult;

/// How [`rank_knowledge_results`] scores each hit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    /// Keep the semantic score as given.
    #[default]
    Semantic,
    /// Replace it with keyword overlap.
    Keyword,
    /// `alpha * semantic + (1 - alpha) * keyword`.
    Hybrid,
}

impl fmt::Display for RetrievalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RetrievalMode::Semantic => "semantic",
            RetrievalMode::Keyword => "keyword",
            RetrievalMode::Hybrid => "hybrid",
        })
    }
}

impl FromStr for RetrievalMode {
    type Err = KgragError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "semantic" => Ok(RetrievalMode::Semantic),
            "keyword" => Ok(RetrievalMode::Keyword),
            "hybrid" => Ok(RetrievalMode::Hybrid),
            other => Err(KgragError::InvalidInput(format!("unknown retrieval mode: {}", other))),
        }
    }
}

/// Input to [`rank_knowledge_results`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankParams {
    pub results: Vec<KnowledgeResult>,
    pub query: String,
    #[serde(default)]
    pub retrieval_mode: RetrievalMode,
    #[serde(default)]
    pub min_score: f64,
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

fn default_hybrid_alpha() -> f64 {
    0.7
}

fn default_max_results() -> usize {
    10
}

/// A hit after fusion. `score` is the value filtered and sorted on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedResult {
    pub path: String,
    pub snippet: String,
    pub score: f64,
    pub semantic_score: f64,
    pub keyword_score: f64,
    /// 1-indexed position in the output.
    pub rank: usize,
}

fn is_separator(c: char) -> bool {
    c.is_whitespace()
        || c.is_ascii_punctuation()
        || matches!(
            c,
            '，' | '。'
                | '！'
                | '？'
                | '；'
                | '：'
                | '、'
                | '“'
                | '”'
                | '‘'
                | '’'
                | '（'
                | '）'
                | '【'
                | '】'
                | '《'
                | '》'
                | '「'
                | '」'
                | '…'
                | '·'
        )
}

/// Lowercase the query and split it on whitespace and ASCII or CJK punctuation.
pub fn tokenize_query(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split(is_separator)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

/// Fraction of `tokens` found (as case-insensitive substrings) in the
/// snippet or path. Zero when there are no tokens.
pub fn keyword_score(tokens: &[String], result: &KnowledgeResult) -> f64 {
    if tokens.is_empty() {
        return 0.0;
    }
    let haystack = format!("{} {}", result.snippet, result.path).to_lowercase();
    let matched = tokens.iter().filter(|t| haystack.contains(t.as_str())).count();
    matched as f64 / tokens.len() as f64
}

/// Re-score, filter and order generic retrieval hits.
///
/// Hits scoring below `min_score` are dropped (equal is kept). Ties keep their
/// input order. At most `max(1, max_results)` hits are returned.
///
/// # Example
///
/// ```
/// use kgrag::search::{rank_knowledge_results, KnowledgeResult, RankParams, RetrievalMode};
///
/// let ranked = rank_knowledge_results(RankParams {
///     results: vec![
///         KnowledgeResult::new("notes/cooking.md", "pasta recipes", 0.9),
///         KnowledgeResult::new("notes/apple.md", "Apple is a technology company", 0.1),
///     ],
///     query: "apple technology".to_string(),
///     retrieval_mode: RetrievalMode::Keyword,
///     min_score: 0.0,
///     hybrid_alpha: 0.5,
///     max_results: 5,
/// });
/// assert_eq!(ranked[0].path, "notes/apple.md");
/// ```
pub fn rank_knowledge_results(params: RankParams) -> Vec<RankedResult> {
    let tokens = tokenize_query(&params.query);
    let alpha = params.hybrid_alpha.clamp(0.0, 1.0);
    let limit = params.max_results.max(1);

    let mut ranked: Vec<RankedResult> = params
        .results
        .into_iter()
        .map(|result| {
            let keyword = keyword_score(&tokens, &result);
            let semantic = result.score;
            let score = match params.retrieval_mode {
                RetrievalMode::Semantic => semantic,
                RetrievalMode::Keyword => keyword,
                RetrievalMode::Hybrid => alpha * semantic + (1.0 - alpha) * keyword,
            };
            RankedResult {
                path: result.path,
                snippet: result.snippet,
                score,
                semantic_score: semantic,
                keyword_score: keyword,
                rank: 0,
            }
        })
        .filter(|r| r.score >= params.min_score)
        .collect();

    // sort_by is stable, so equal scores keep input order
    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ranked.truncate(limit);
    for (idx, result) in ranked.iter_mut().enumerate() {
        result.rank = idx + 1;
    }

    log::debug!(
        "Ranked {} results (mode {}, {} query tokens)",
        ranked.len(),
        params.retrieval_mode,
        tokens.len()
    );
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_result(path: &str, snippet: &str, score: f64) -> KnowledgeResult {
        KnowledgeResult::new(path, snippet, score)
    }

    fn params(results: Vec<KnowledgeResult>, query: &str, mode: RetrievalMode) -> RankParams {
        RankParams {
            results,
            query: query.to_string(),
            retrieval_mode: mode,
            min_score: 0.0,
            hybrid_alpha: 0.5,
            max_results: 10,
        }
    }

    #[test]
    fn test_tokenize_query() {
        assert_eq!(tokenize_query("Hello, World!  rust"), vec!["hello", "world", "rust"]);
        assert_eq!(tokenize_query("苹果公司，科技。创新"), vec!["苹果公司", "科技", "创新"]);
        assert!(tokenize_query("  ,.;  ").is_empty());
    }

    #[test]
    fn test_keyword_score_fraction() {
        let tokens = tokenize_query("apple pie recipe");
        let result = create_result("food/apple.md", "A classic PIE", 0.0);
        let score = keyword_score(&tokens, &result);
        assert!((score - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(keyword_score(&[], &result), 0.0);
    }

    #[test]
    fn test_keyword_mode_ignores_semantic_score() {
        let results = vec![
            create_result("a.md", "nothing relevant here", 0.99),
            create_result("b.md", "rust async runtime", 0.01),
        ];
        let ranked = rank_knowledge_results(params(results, "rust runtime", RetrievalMode::Keyword));
        assert_eq!(ranked[0].path, "b.md");
        assert_eq!(ranked[0].score, 1.0);
        assert_eq!(ranked[1].score, 0.0);
    }

    #[test]
    fn test_semantic_mode_keeps_scores() {
        let results = vec![create_result("a.md", "x", 0.3), create_result("b.md", "y", 0.8)];
        let ranked = rank_knowledge_results(params(results, "anything", RetrievalMode::Semantic));
        assert_eq!(ranked[0].path, "b.md");
        assert_eq!(ranked[0].score, 0.8);
        assert_eq!(ranked[1].score, 0.3);
    }

    #[test]
    fn test_hybrid_mode_blends() {
        let results = vec![create_result("doc.md", "graph search", 0.6)];
        let mut p = params(results, "graph database", RetrievalMode::Hybrid);
        p.hybrid_alpha = 0.25;
        let ranked = rank_knowledge_results(p);
        // 0.25 * 0.6 + 0.75 * 0.5
        assert!((ranked[0].score - 0.525).abs() < 1e-9);
        assert!((ranked[0].keyword_score - 0.5).abs() < 1e-9);
        assert_eq!(ranked[0].semantic_score, 0.6);
    }

    #[test]
    fn test_min_score_boundary() {
        let results = vec![
            create_result("keep.md", "x", 0.5),
            create_result("drop.md", "y", 0.49),
            create_result("top.md", "z", 0.9),
        ];
        let mut p = params(results, "q", RetrievalMode::Semantic);
        p.min_score = 0.5;
        let ranked = rank_knowledge_results(p);
        let paths: Vec<_> = ranked.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["top.md", "keep.md"]);
    }

    #[test]
    fn test_max_results_limits_and_floor_of_one() {
        let results: Vec<_> = (0..5).map(|i| create_result(&format!("{}.md", i), "x", 0.5)).collect();
        let mut p = params(results.clone(), "q", RetrievalMode::Semantic);
        p.max_results = 3;
        assert_eq!(rank_knowledge_results(p).len(), 3);

        let mut p = params(results, "q", RetrievalMode::Semantic);
        p.max_results = 0;
        assert_eq!(rank_knowledge_results(p).len(), 1);
    }

    #[test]
    fn test_ties_keep_input_order_and_ranks_assigned() {
        let results = vec![
            create_result("first.md", "x", 0.5),
            create_result("second.md", "y", 0.5),
            create_result("third.md", "z", 0.5),
        ];
        let ranked = rank_knowledge_results(params(results, "q", RetrievalMode::Semantic));
        let paths: Vec<_> = ranked.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["first.md", "second.md", "third.md"]);
        for (idx, result) in ranked.iter().enumerate() {
            assert_eq!(result.rank, idx + 1);
        }
    }

    #[test]
    fn test_everything_filtered_is_empty() {
        let mut p = params(vec![create_result("a.md", "x", 0.1)], "q", RetrievalMode::Semantic);
        p.min_score = 0.9;
        assert!(rank_knowledge_results(p).is_empty());
    }

    #[test]
    fn test_retrieval_mode_parse() {
        assert_eq!("Hybrid".parse::<RetrievalMode>().unwrap(), RetrievalMode::Hybrid);
        assert!("fuzzy".parse::<RetrievalMode>().is_err());
        assert_eq!(RetrievalMode::default(), RetrievalMode::Semantic);
    }
}

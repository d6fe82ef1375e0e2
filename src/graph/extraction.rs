//! LLM-backed extraction of graph facts from one chunk of text.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::parser::{parse_extraction_output, parse_triples, Delimiters, ExtractionOutput, Triple};
use crate::error::{KgragError, Result};
use crate::llm::{ExecuteOptions, LlmExecutor};

/// Upper bound on characters of chunk text sent in one prompt.
pub const MAX_INPUT_CHARS: usize = 16_000;

/// Default deadline for one LLM call.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Which prompt/parser pair a build uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionFormat {
    /// JSONL `{h, r, t}` triples
    #[default]
    Triples,
    /// `entity<|#|>...` / `relation<|#|>...` records
    Tuples,
}

/// Knobs for one extraction call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionSettings {
    #[serde(default = "default_min_triples")]
    pub min_triples: usize,
    #[serde(default = "default_max_triples")]
    pub max_triples: usize,
    #[serde(default = "default_triples_per_k_tokens")]
    pub triples_per_k_tokens: f64,
    /// Hop limit callers use when expanding search hits into relations.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub format: ExtractionFormat,
    #[serde(default = "super::default_entity_types")]
    pub entity_types: Vec<String>,
}

fn default_min_triples() -> usize {
    5
}

fn default_max_triples() -> usize {
    50
}

fn default_triples_per_k_tokens() -> f64 {
    10.0
}

fn default_max_depth() -> usize {
    2
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            min_triples: default_min_triples(),
            max_triples: default_max_triples(),
            triples_per_k_tokens: default_triples_per_k_tokens(),
            max_depth: default_max_depth(),
            provider: None,
            model: None,
            timeout_secs: default_timeout_secs(),
            format: ExtractionFormat::default(),
            entity_types: super::default_entity_types(),
        }
    }
}

/// Result of a triple extraction call.
#[derive(Debug, Clone)]
pub struct TripleExtraction {
    pub triples: Vec<Triple>,
    pub raw_text: String,
    pub target_triples: usize,
}

/// Result of a tuple-format extraction call.
#[derive(Debug, Clone)]
pub struct TupleExtraction {
    pub output: ExtractionOutput,
    pub raw_text: String,
}

/// How many triples to ask for, proportional to text length.
///
/// Tokens are approximated as `ceil(chars / 4)`; the result is clamped to
/// `[min_triples, max_triples]`.
pub fn compute_target_triples(text: &str, settings: &ExtractionSettings) -> usize {
    let chars = text.chars().count();
    let tokens = (chars + 3) / 4;
    let raw = (tokens as f64 / 1000.0 * settings.triples_per_k_tokens).ceil();
    let target = if raw.is_finite() && raw > 0.0 { raw as usize } else { 0 };

    let min = settings.min_triples;
    let max = settings.max_triples.max(min);
    target.clamp(min, max)
}

fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

pub fn build_triple_prompt(text: &str, target: usize, entity_types: &[String]) -> String {
    format!(
        r#"You are a knowledge graph extraction engine. Extract at most {target} factual triples from the text below.

OUTPUT FORMAT:
- JSONL: one JSON object per line, nothing else (no markdown, no commentary)
- Keys: "h" (head entity), "r" (relation), "t" (tail entity)
- "h" and "t": {{"name": "...", "type": "...", "description": "..."}}
- "r": {{"type": "short relation phrase", "description": "..."}}

RULES:
- Entity type must be one of: {types}
- Use the entity name exactly as written in the text
- Never output more than {target} lines

EXAMPLE:
{{"h": {{"name": "Apple", "type": "Organization", "description": "technology company"}}, "r": {{"type": "led by"}}, "t": {{"name": "Tim Cook", "type": "Person"}}}}

TEXT:
{text}
"#,
        target = target,
        types = entity_types.join(", "),
        text = truncate_chars(text, MAX_INPUT_CHARS),
    )
}

pub fn build_tuple_prompt(text: &str, entity_types: &[String], delimiters: &Delimiters) -> String {
    let d = &delimiters.field;
    format!(
        r#"Identify the entities and relationships in the text below.

For each entity output one line:
entity{d}<name>{d}<type>{d}<description>
For each relationship between two listed entities output one line:
relation{d}<source name>{d}<target name>{d}<comma separated keywords>{d}<description>

Entity type must be one of: {types}
When finished output {done} on its own line.

TEXT:
{text}
"#,
        d = d,
        types = entity_types.join(", "),
        done = delimiters.completion,
        text = truncate_chars(text, MAX_INPUT_CHARS),
    )
}

/// Run one prompt inside a throwaway working directory.
///
/// The directory is removed on every exit path, including timeouts and
/// executor errors.
async fn execute_scoped(
    prompt: &str,
    settings: &ExtractionSettings,
    executor: &dyn LlmExecutor,
) -> Result<String> {
    let work_dir = tempfile::Builder::new().prefix("kgrag-extract-").tempdir()?;
    let options = ExecuteOptions {
        provider: settings.provider.clone(),
        model: settings.model.clone(),
        timeout: Duration::from_secs(settings.timeout_secs),
        tools_disabled: true,
        work_dir: work_dir.path().to_path_buf(),
    };

    let outcome = tokio::time::timeout(options.timeout, executor.execute(prompt, &options)).await;

    let path = work_dir.path().to_path_buf();
    if let Err(e) = work_dir.close() {
        log::warn!("Failed to remove extraction work dir {}: {}", path.display(), e);
    }

    match outcome {
        Ok(result) => Ok(result?.joined_text()),
        Err(_) => Err(KgragError::Timeout(settings.timeout_secs)),
    }
}

/// Extract up to the target number of triples from a chunk.
///
/// Executor failures and timeouts are returned as errors. Output that is
/// present but malformed yields whatever triples could be read, possibly none.
pub async fn extract_triples(
    text: &str,
    settings: &ExtractionSettings,
    executor: &dyn LlmExecutor,
) -> Result<TripleExtraction> {
    let target_triples = compute_target_triples(text, settings);
    let prompt = build_triple_prompt(text, target_triples, &settings.entity_types);

    let raw_text = execute_scoped(&prompt, settings, executor).await?;
    let mut triples = parse_triples(&raw_text);
    if triples.len() > target_triples {
        log::debug!("Model returned {} triples, keeping {}", triples.len(), target_triples);
        triples.truncate(target_triples);
    }

    Ok(TripleExtraction {
        triples,
        raw_text,
        target_triples,
    })
}

/// Extract entity and relation records using the tuple-delimited prompt.
pub async fn extract_entities_relations(
    text: &str,
    settings: &ExtractionSettings,
    executor: &dyn LlmExecutor,
) -> Result<TupleExtraction> {
    let delimiters = Delimiters::default();
    let prompt = build_tuple_prompt(text, &settings.entity_types, &delimiters);

    let raw_text = execute_scoped(&prompt, settings, executor).await?;
    let output = parse_extraction_output(&raw_text, &delimiters);

    Ok(TupleExtraction { output, raw_text })
}

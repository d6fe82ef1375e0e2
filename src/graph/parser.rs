//! Parsers for raw model output.
//!
//! Two grammars are supported and kept separate, selected by whichever prompt
//! produced the text:
//! - triples as a JSON array or JSONL (`parse_triples`)
//! - tuple-delimited entity/relation records (`parse_extraction_output`)
//!
//! Model output is accepted loosely ([`RawTriple`]) and always stored strictly
//! ([`Triple`]); [`normalize_triple`] is the only bridge between the two.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

/// Head or tail of a triple in canonical form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Named {
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Relation of a triple in canonical form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Typed {
    #[serde(rename = "type")]
    pub relation_type: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A normalized (head, relation, tail) fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Triple {
    pub h: Named,
    pub r: Typed,
    pub t: Named,
}

impl Named {
    /// String field from the extra attributes, e.g. `type` or `description`.
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

impl Typed {
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// One side of a triple exactly as the model wrote it.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawSide {
    Text(String),
    Object(Map<String, Value>),
}

/// A triple exactly as the model wrote it; any side may be missing.
#[derive(Debug, Clone, Deserialize)]
pub struct RawTriple {
    #[serde(default)]
    pub h: Option<RawSide>,
    #[serde(default)]
    pub r: Option<RawSide>,
    #[serde(default)]
    pub t: Option<RawSide>,
}

/// Split a raw side into its trimmed key value and remaining attributes.
fn split_side(side: RawSide, key: &str) -> Option<(String, Map<String, Value>)> {
    let (value, extra) = match side {
        RawSide::Text(s) => (s, Map::new()),
        RawSide::Object(mut obj) => {
            let value = match obj.remove(key) {
                Some(Value::String(s)) => s,
                _ => return None,
            };
            (value, obj)
        }
    };
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some((trimmed.to_string(), extra))
}

/// Canonicalize a loose triple. Returns `None` when a name or type is empty.
pub fn normalize_triple(raw: RawTriple) -> Option<Triple> {
    let (h_name, h_extra) = split_side(raw.h?, "name")?;
    let (r_type, r_extra) = split_side(raw.r?, "type")?;
    let (t_name, t_extra) = split_side(raw.t?, "name")?;

    Some(Triple {
        h: Named { name: h_name, extra: h_extra },
        r: Typed { relation_type: r_type, extra: r_extra },
        t: Named { name: t_name, extra: t_extra },
    })
}

fn normalize_value(value: Value) -> Option<Triple> {
    serde_json::from_value::<RawTriple>(value)
        .ok()
        .and_then(normalize_triple)
}

/// Drop markdown fence lines (```json, ```) wherever they appear.
fn strip_code_fences(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// The response as a JSON array, or the first array of objects embedded in
/// surrounding prose.
fn json_array(text: &str) -> Option<Vec<Value>> {
    static EMBEDDED_ARRAY: OnceLock<Regex> = OnceLock::new();
    let candidate = if text.starts_with('[') {
        text
    } else {
        let re = EMBEDDED_ARRAY.get_or_init(|| Regex::new(r"(?s)\[\s*\{.*\}\s*\]").expect("Invalid regex pattern"));
        re.find(text)?.as_str()
    };
    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Array(items)) => Some(items),
        _ => {
            log::debug!("Triple output looked like a JSON array but did not parse; reading as JSONL");
            None
        }
    }
}

/// Parse triples from a JSON array or JSONL response.
///
/// A well-formed array is parsed in one go. Anything else is read line by line
/// and lines that fail to parse or normalize are skipped.
pub fn parse_triples(text: &str) -> Vec<Triple> {
    let cleaned = strip_code_fences(text);
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    if let Some(items) = json_array(trimmed) {
        return items.into_iter().filter_map(normalize_value).collect();
    }

    let mut triples = Vec::new();
    let mut skipped = 0usize;
    for line in trimmed.lines() {
        let line = line.trim().trim_end_matches(',');
        if line.is_empty() || line == "[" || line == "]" {
            continue;
        }
        match serde_json::from_str::<Value>(line).ok().and_then(normalize_value) {
            Some(triple) => triples.push(triple),
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        log::debug!("Skipped {} unparseable triple lines", skipped);
    }
    triples
}

/// Stable content hash of `head::relation::tail`. Direction matters.
pub fn hash_triple_key(triple: &Triple) -> String {
    hash_key_parts(&triple.h.name, &triple.r.relation_type, &triple.t.name)
}

/// Same hash as [`hash_triple_key`] over already-canonical parts.
pub fn hash_key_parts(head: &str, relation: &str, tail: &str) -> String {
    let key = format!("{}::{}::{}", head, relation, tail);
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Delimiters of the tuple-per-line prompt format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delimiters {
    pub field: String,
    pub completion: String,
}

impl Default for Delimiters {
    fn default() -> Self {
        Self {
            field: "<|#|>".to_string(),
            completion: "<|COMPLETE|>".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    pub entity_type: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRelation {
    pub source: String,
    pub target: String,
    pub keywords: Vec<String>,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionOutput {
    pub entities: Vec<ExtractedEntity>,
    pub relations: Vec<ExtractedRelation>,
}

/// Parse tuple-delimited `entity`/`relation` records.
///
/// Reading stops for good at the first line containing the completion
/// delimiter. Records with too few fields or empty names are skipped.
pub fn parse_extraction_output(text: &str, delimiters: &Delimiters) -> ExtractionOutput {
    let mut output = ExtractionOutput::default();

    for line in text.lines() {
        if line.contains(delimiters.completion.as_str()) {
            break;
        }
        let fields: Vec<&str> = line.split(delimiters.field.as_str()).map(str::trim).collect();
        match fields.first().copied() {
            Some("entity") if fields.len() >= 4 => {
                if fields[1].is_empty() {
                    continue;
                }
                output.entities.push(ExtractedEntity {
                    name: fields[1].to_string(),
                    entity_type: fields[2].to_string(),
                    description: fields[3].to_string(),
                });
            }
            Some("relation") if fields.len() >= 5 => {
                if fields[1].is_empty() || fields[2].is_empty() {
                    continue;
                }
                let keywords = fields[3]
                    .split([',', '，'])
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .map(String::from)
                    .collect();
                output.relations.push(ExtractedRelation {
                    source: fields[1].to_string(),
                    target: fields[2].to_string(),
                    keywords,
                    description: fields[4].to_string(),
                });
            }
            _ => {}
        }
    }

    output
}

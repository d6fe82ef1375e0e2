//! Query-time access to the graph: three search strategies and aggregate stats.

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::store::{entity_from_row, ENTITY_COLUMNS};
use super::Entity;
use crate::db::Db;
use crate::error::{KgragError, Result};
use crate::search::tokenize_query;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// Entity names: exact, then prefix, then substring.
    #[default]
    Local,
    /// Entity descriptions, ranked by matching description rows.
    Global,
    /// Unweighted token scan with a most-recent fallback.
    Naive,
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SearchMode::Local => "local",
            SearchMode::Global => "global",
            SearchMode::Naive => "naive",
        })
    }
}

impl FromStr for SearchMode {
    type Err = KgragError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(SearchMode::Local),
            "global" => Ok(SearchMode::Global),
            "naive" => Ok(SearchMode::Naive),
            other => Err(KgragError::InvalidInput(format!("unknown search mode: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchOptions {
    #[serde(default)]
    pub mode: SearchMode,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_top_k() -> usize {
    10
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            mode: SearchMode::default(),
            top_k: default_top_k(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSearchResult {
    pub entities: Vec<Entity>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    pub total_entities: u64,
    pub entity_types: BTreeMap<String, u64>,
}

/// Escape `%`, `_` and `\` so user text is matched literally by `LIKE ... ESCAPE '\'`.
fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn prefixed_entity_columns() -> String {
    ENTITY_COLUMNS
        .split(", ")
        .map(|c| format!("e.{}", c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn search_local(conn: &Connection, kb_id: &str, query: &str, top_k: usize) -> Result<Vec<Entity>> {
    let needle = query.to_lowercase();
    let sql = format!(
        "SELECT {} FROM kg_entities \
         WHERE kb_id = ?1 AND fold_case(name) LIKE ?2 ESCAPE '\\' \
         ORDER BY CASE WHEN fold_case(name) = ?3 THEN 0 WHEN fold_case(name) LIKE ?4 ESCAPE '\\' THEN 1 ELSE 2 END, \
                  length(name), created_at DESC, rowid DESC \
         LIMIT ?5",
        ENTITY_COLUMNS
    );
    let escaped = escape_like(&needle);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![
            kb_id,
            format!("%{}%", escaped),
            needle,
            format!("{}%", escaped),
            top_k as i64
        ],
        entity_from_row,
    )?;
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}

fn search_global(conn: &Connection, kb_id: &str, tokens: &[String], top_k: usize) -> Result<Vec<Entity>> {
    // ?1 = kb_id, ?2.. = one pattern per token, last = limit
    let matches: Vec<String> = (0..tokens.len())
        .map(|i| format!("fold_case(d.description) LIKE ?{} ESCAPE '\\'", i + 2))
        .collect();
    let sql = format!(
        "SELECT {cols}, COUNT(d.id) AS hits, SUM({token_hits}) AS token_hits \
         FROM kg_entities e JOIN kg_entity_descriptions d ON d.entity_id = e.id \
         WHERE e.kb_id = ?1 AND ({any}) \
         GROUP BY e.id \
         ORDER BY hits DESC, token_hits DESC, e.created_at DESC, e.rowid DESC \
         LIMIT ?{limit}",
        cols = prefixed_entity_columns(),
        token_hits = matches.iter().map(|m| format!("({})", m)).collect::<Vec<_>>().join(" + "),
        any = matches.join(" OR "),
        limit = tokens.len() + 2,
    );

    let mut values: Vec<Value> = Vec::with_capacity(tokens.len() + 2);
    values.push(Value::Text(kb_id.to_string()));
    values.extend(tokens.iter().map(|t| Value::Text(format!("%{}%", escape_like(t)))));
    values.push(Value::Integer(top_k as i64));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values), entity_from_row)?;
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}

fn search_naive(conn: &Connection, kb_id: &str, tokens: &[String], top_k: usize) -> Result<Vec<Entity>> {
    let sql = format!(
        "SELECT {}, COALESCE(group_concat(d.description, ' '), '') \
         FROM kg_entities e LEFT JOIN kg_entity_descriptions d ON d.entity_id = e.id \
         WHERE e.kb_id = ?1 \
         GROUP BY e.id \
         ORDER BY e.created_at DESC, e.rowid DESC",
        prefixed_entity_columns()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([kb_id], |row| Ok((entity_from_row(row)?, row.get::<_, String>(7)?)))?;

    let mut recent = Vec::new();
    let mut scored = Vec::new();
    for row in rows {
        let (entity, descriptions) = row?;
        let haystack = format!("{} {} {}", entity.name, entity.entity_type, descriptions).to_lowercase();
        let hits = tokens.iter().filter(|t| haystack.contains(t.as_str())).count();
        if hits > 0 {
            scored.push((hits, entity));
        } else if recent.len() < top_k {
            recent.push(entity);
        }
    }

    if scored.is_empty() {
        return Ok(recent);
    }
    // Stable: equal hit counts stay most-recent first
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(scored.into_iter().take(top_k).map(|(_, e)| e).collect())
}

/// Search the entities of one knowledge base.
///
/// `local` and `global` return nothing for an empty query. `naive` returns the
/// most recent entities when no token matches, so a non-empty knowledge base
/// always yields at least one hit.
pub async fn hybrid_search(
    db: &Db,
    kb_id: &str,
    query: &str,
    options: &SearchOptions,
) -> Result<GraphSearchResult> {
    let top_k = options.top_k.max(1);
    let mode = options.mode;
    let (kb, query) = (kb_id.to_string(), query.trim().to_string());
    let tokens = tokenize_query(&query);

    let entities = db
        .with_connection(move |conn| match mode {
            SearchMode::Local if query.is_empty() => Ok(Vec::new()),
            SearchMode::Local => search_local(conn, &kb, &query, top_k),
            SearchMode::Global if tokens.is_empty() => Ok(Vec::new()),
            SearchMode::Global => search_global(conn, &kb, &tokens, top_k),
            SearchMode::Naive => search_naive(conn, &kb, &tokens, top_k),
        })
        .await?;

    log::debug!("Graph search ({}) in kb {} returned {} entities", mode, kb_id, entities.len());
    Ok(GraphSearchResult { entities })
}

/// Entity totals for one knowledge base, grouped by type.
pub async fn get_stats(db: &Db, kb_id: &str) -> Result<GraphStats> {
    let kb_id = kb_id.to_string();
    db.with_connection(move |conn| {
        let mut stmt = conn.prepare(
            "SELECT entity_type, COUNT(*) FROM kg_entities WHERE kb_id = ?1 GROUP BY entity_type",
        )?;
        let rows = stmt.query_map([&kb_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut stats = GraphStats::default();
        for row in rows {
            let (entity_type, count) = row?;
            let count = count.max(0) as u64;
            stats.total_entities += count;
            stats.entity_types.insert(entity_type, count);
        }
        Ok(stats)
    })
    .await
}

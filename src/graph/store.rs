//! Persistence of entities, descriptions and relations.
//!
//! Entities are always appended, never merged by name across writes. A build
//! stages its facts in a [`StagedGraph`] and commits them in one transaction.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use super::parser::{hash_key_parts, ExtractionOutput, Triple};
use super::{Entity, EntityDescription, Relation, DEFAULT_ENTITY_TYPE};
use crate::db::Db;
use crate::error::{KgragError, Result};

pub(crate) const ENTITY_COLUMNS: &str =
    "id, kb_id, document_id, name, entity_type, created_at, updated_at";

pub(crate) fn entity_from_row(row: &Row<'_>) -> rusqlite::Result<Entity> {
    Ok(Entity {
        id: row.get(0)?,
        kb_id: row.get(1)?,
        document_id: row.get(2)?,
        name: row.get(3)?,
        entity_type: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

pub(crate) const RELATION_COLUMNS: &str =
    "id, kb_id, source_entity_id, target_entity_id, keywords, description, created_at";

pub(crate) fn relation_from_row(row: &Row<'_>) -> rusqlite::Result<Relation> {
    let keywords_json: String = row.get(4)?;
    let keywords = serde_json::from_str(&keywords_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Relation {
        id: row.get(0)?,
        kb_id: row.get(1)?,
        source_entity_id: row.get(2)?,
        target_entity_id: row.get(3)?,
        keywords,
        description: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn insert_entity_row(
    conn: &Connection,
    kb_id: &str,
    document_id: &str,
    name: &str,
    entity_type: &str,
) -> Result<Entity> {
    let now = Utc::now().to_rfc3339();
    let entity = Entity {
        id: Uuid::new_v4().to_string(),
        kb_id: kb_id.to_string(),
        document_id: document_id.to_string(),
        name: name.to_string(),
        entity_type: entity_type.to_string(),
        created_at: now.clone(),
        updated_at: now,
    };
    conn.execute(
        "INSERT INTO kg_entities (id, kb_id, document_id, name, entity_type, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entity.id,
            entity.kb_id,
            entity.document_id,
            entity.name,
            entity.entity_type,
            entity.created_at,
            entity.updated_at
        ],
    )?;
    Ok(entity)
}

fn insert_description_row(
    conn: &Connection,
    entity: &Entity,
    description: &str,
) -> Result<EntityDescription> {
    let row = EntityDescription {
        id: Uuid::new_v4().to_string(),
        entity_id: entity.id.clone(),
        kb_id: entity.kb_id.clone(),
        document_id: entity.document_id.clone(),
        description: description.to_string(),
        created_at: Utc::now().to_rfc3339(),
    };
    conn.execute(
        "INSERT INTO kg_entity_descriptions (id, entity_id, kb_id, document_id, description, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![row.id, row.entity_id, row.kb_id, row.document_id, row.description, row.created_at],
    )?;
    Ok(row)
}

fn find_entity(conn: &Connection, kb_id: &str, entity_id: &str) -> Result<Option<Entity>> {
    let sql = format!("SELECT {} FROM kg_entities WHERE id = ?1 AND kb_id = ?2", ENTITY_COLUMNS);
    Ok(conn
        .query_row(&sql, params![entity_id, kb_id], entity_from_row)
        .optional()?)
}

fn insert_relation_row(
    conn: &Connection,
    kb_id: &str,
    source_entity_id: &str,
    target_entity_id: &str,
    keywords: &[String],
    description: Option<&str>,
) -> Result<Relation> {
    let relation = Relation {
        id: Uuid::new_v4().to_string(),
        kb_id: kb_id.to_string(),
        source_entity_id: source_entity_id.to_string(),
        target_entity_id: target_entity_id.to_string(),
        keywords: keywords.to_vec(),
        description: description.map(String::from),
        created_at: Utc::now().to_rfc3339(),
    };
    conn.execute(
        "INSERT INTO kg_relations (id, kb_id, source_entity_id, target_entity_id, keywords, description, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            relation.id,
            relation.kb_id,
            relation.source_entity_id,
            relation.target_entity_id,
            serde_json::to_string(&relation.keywords)?,
            relation.description,
            relation.created_at
        ],
    )?;
    Ok(relation)
}

/// Append a new entity row. Existing entities with the same name are left alone.
pub async fn insert_entity(
    db: &Db,
    kb_id: &str,
    document_id: &str,
    name: &str,
    entity_type: &str,
) -> Result<Entity> {
    let name = name.trim().to_string();
    if name.is_empty() {
        return Err(KgragError::InvalidInput("entity name must not be empty".to_string()));
    }
    let (kb_id, document_id, entity_type) =
        (kb_id.to_string(), document_id.to_string(), entity_type.to_string());
    db.with_connection(move |conn| insert_entity_row(conn, &kb_id, &document_id, &name, &entity_type))
        .await
}

/// Append a description to an entity of `kb_id`.
pub async fn add_entity_description(
    db: &Db,
    kb_id: &str,
    entity_id: &str,
    description: &str,
) -> Result<EntityDescription> {
    let (kb_id, entity_id, description) =
        (kb_id.to_string(), entity_id.to_string(), description.to_string());
    db.with_connection(move |conn| {
        let entity = find_entity(conn, &kb_id, &entity_id)?
            .ok_or_else(|| KgragError::InvalidInput(format!("unknown entity {} in kb {}", entity_id, kb_id)))?;
        insert_description_row(conn, &entity, &description)
    })
    .await
}

/// Insert a relation between two entities of `kb_id`.
///
/// Returns `Ok(None)` without writing when either endpoint is not a known
/// entity of the same knowledge base.
pub async fn insert_relation(
    db: &Db,
    kb_id: &str,
    source_entity_id: &str,
    target_entity_id: &str,
    keywords: Vec<String>,
    description: Option<String>,
) -> Result<Option<Relation>> {
    let (kb_id, source, target) =
        (kb_id.to_string(), source_entity_id.to_string(), target_entity_id.to_string());
    db.with_connection(move |conn| {
        if find_entity(conn, &kb_id, &source)?.is_none() || find_entity(conn, &kb_id, &target)?.is_none() {
            log::debug!("Rejecting relation {} -> {}: endpoint not in kb {}", source, target, kb_id);
            return Ok(None);
        }
        insert_relation_row(conn, &kb_id, &source, &target, &keywords, description.as_deref()).map(Some)
    })
    .await
}

/// All descriptions of one entity, oldest first.
pub async fn get_entity_descriptions(db: &Db, entity_id: &str) -> Result<Vec<EntityDescription>> {
    let entity_id = entity_id.to_string();
    db.with_connection(move |conn| {
        let mut stmt = conn.prepare(
            "SELECT id, entity_id, kb_id, document_id, description, created_at \
             FROM kg_entity_descriptions WHERE entity_id = ?1 ORDER BY created_at, rowid",
        )?;
        let rows = stmt.query_map([&entity_id], |row| {
            Ok(EntityDescription {
                id: row.get(0)?,
                entity_id: row.get(1)?,
                kb_id: row.get(2)?,
                document_id: row.get(3)?,
                description: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    })
    .await
}

#[derive(Debug, Clone)]
struct StagedEntity {
    name: String,
    entity_type: String,
    descriptions: Vec<String>,
}

#[derive(Debug, Clone)]
struct StagedRelation {
    source: String,
    target: String,
    keywords: Vec<String>,
    description: Option<String>,
}

/// Facts gathered from every chunk of one document, not yet written.
///
/// Entities are keyed by name within the document so repeated mentions share
/// one row and accumulate descriptions. Duplicate relations are dropped by
/// their triple hash.
#[derive(Debug, Clone, Default)]
pub struct StagedGraph {
    entities: Vec<StagedEntity>,
    by_name: HashMap<String, usize>,
    relations: Vec<StagedRelation>,
    relation_keys: HashSet<String>,
}

impl StagedGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn relation_count(&self) -> usize {
        self.relations.len()
    }

    fn stage_entity(&mut self, name: &str, entity_type: Option<&str>, description: Option<&str>) {
        let idx = match self.by_name.get(name) {
            Some(&idx) => idx,
            None => {
                self.entities.push(StagedEntity {
                    name: name.to_string(),
                    entity_type: DEFAULT_ENTITY_TYPE.to_string(),
                    descriptions: Vec::new(),
                });
                self.by_name.insert(name.to_string(), self.entities.len() - 1);
                self.entities.len() - 1
            }
        };
        let entity = &mut self.entities[idx];
        if let Some(t) = entity_type.map(str::trim).filter(|t| !t.is_empty()) {
            if entity.entity_type == DEFAULT_ENTITY_TYPE {
                entity.entity_type = t.to_string();
            }
        }
        if let Some(d) = description.map(str::trim).filter(|d| !d.is_empty()) {
            if !entity.descriptions.iter().any(|existing| existing == d) {
                entity.descriptions.push(d.to_string());
            }
        }
    }

    fn stage_relation(&mut self, source: &str, target: &str, keywords: Vec<String>, description: Option<&str>) {
        let key = hash_key_parts(source, &keywords.join(","), target);
        if !self.relation_keys.insert(key) {
            return;
        }
        self.relations.push(StagedRelation {
            source: source.to_string(),
            target: target.to_string(),
            keywords,
            description: description.map(str::trim).filter(|d| !d.is_empty()).map(String::from),
        });
    }

    /// Stage the entities and relation of each triple.
    pub fn add_triples(&mut self, triples: &[Triple]) {
        for triple in triples {
            self.stage_entity(&triple.h.name, triple.h.extra_str("type"), triple.h.extra_str("description"));
            self.stage_entity(&triple.t.name, triple.t.extra_str("type"), triple.t.extra_str("description"));
            self.stage_relation(
                &triple.h.name,
                &triple.t.name,
                vec![triple.r.relation_type.clone()],
                triple.r.extra_str("description"),
            );
        }
    }

    /// Stage tuple-format records. Relations may name entities that never
    /// appear as records; those are dropped at commit.
    pub fn add_output(&mut self, output: &ExtractionOutput) {
        for entity in &output.entities {
            self.stage_entity(&entity.name, Some(&entity.entity_type), Some(&entity.description));
        }
        for relation in &output.relations {
            self.stage_relation(
                &relation.source,
                &relation.target,
                relation.keywords.clone(),
                Some(&relation.description),
            );
        }
    }
}

/// Row counts written by one commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub entities: usize,
    pub descriptions: usize,
    pub relations: usize,
    pub skipped_relations: usize,
}

pub(crate) fn commit_staged(
    conn: &mut Connection,
    kb_id: &str,
    document_id: &str,
    staged: &StagedGraph,
) -> Result<CommitSummary> {
    let tx = conn.transaction()?;
    let mut summary = CommitSummary::default();
    let mut ids: HashMap<&str, String> = HashMap::new();

    for staged_entity in &staged.entities {
        let entity = insert_entity_row(&tx, kb_id, document_id, &staged_entity.name, &staged_entity.entity_type)?;
        summary.entities += 1;
        for description in &staged_entity.descriptions {
            insert_description_row(&tx, &entity, description)?;
            summary.descriptions += 1;
        }
        ids.insert(staged_entity.name.as_str(), entity.id);
    }

    for relation in &staged.relations {
        match (ids.get(relation.source.as_str()), ids.get(relation.target.as_str())) {
            (Some(source), Some(target)) => {
                insert_relation_row(&tx, kb_id, source, target, &relation.keywords, relation.description.as_deref())?;
                summary.relations += 1;
            }
            _ => summary.skipped_relations += 1,
        }
    }

    tx.commit()?;
    Ok(summary)
}

/// Write staged facts for one document in a single transaction.
pub async fn commit_extraction(
    db: &Db,
    kb_id: &str,
    document_id: &str,
    staged: StagedGraph,
) -> Result<CommitSummary> {
    let (kb_id, document_id) = (kb_id.to_string(), document_id.to_string());
    let summary = db
        .with_connection(move |conn| commit_staged(conn, &kb_id, &document_id, &staged))
        .await?;
    if summary.skipped_relations > 0 {
        log::warn!("Dropped {} relations with unknown endpoints", summary.skipped_relations);
    }
    Ok(summary)
}

/// Row counts removed by [`clear_knowledge_graph`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClearSummary {
    pub relations: usize,
    pub descriptions: usize,
    pub entities: usize,
    pub tasks: usize,
}

/// Delete every graph row of one knowledge base.
///
/// Relations go first so no relation ever points at a deleted entity. Other
/// knowledge bases are untouched.
pub async fn clear_knowledge_graph(db: &Db, kb_id: &str) -> Result<ClearSummary> {
    let kb = kb_id.to_string();
    let summary = db
        .with_connection(move |conn| {
            let tx = conn.transaction()?;
            let summary = ClearSummary {
                relations: tx.execute("DELETE FROM kg_relations WHERE kb_id = ?1", params![kb])?,
                descriptions: tx.execute("DELETE FROM kg_entity_descriptions WHERE kb_id = ?1", params![kb])?,
                entities: tx.execute("DELETE FROM kg_entities WHERE kb_id = ?1", params![kb])?,
                tasks: tx.execute("DELETE FROM kg_build_tasks WHERE kb_id = ?1", params![kb])?,
            };
            tx.commit()?;
            Ok(summary)
        })
        .await?;
    log::info!(
        "Cleared kb {}: {} entities, {} relations, {} descriptions, {} tasks",
        kb_id,
        summary.entities,
        summary.relations,
        summary.descriptions,
        summary.tasks
    );
    Ok(summary)
}

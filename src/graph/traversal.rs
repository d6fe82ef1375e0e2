//! BFS traversal over kg_relations, following edges in both directions.

use rusqlite::params;
use std::collections::{HashSet, VecDeque};

use super::store::{relation_from_row, RELATION_COLUMNS};
use crate::db::Db;
use crate::graph::Relation;
use crate::Result;

/// Relations touching `entity_id` in `kb_id`, in either direction.
async fn relations_of(db: &Db, kb_id: &str, entity_id: &str) -> Result<Vec<Relation>> {
    let (kb_id, entity_id) = (kb_id.to_string(), entity_id.to_string());
    db.with_connection(move |conn| {
        let sql = format!(
            "SELECT {} FROM kg_relations \
             WHERE kb_id = ?1 AND (source_entity_id = ?2 OR target_entity_id = ?2) \
             ORDER BY created_at, rowid",
            RELATION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![kb_id, entity_id], relation_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    })
    .await
}

/// Traverse the graph of one knowledge base using BFS.
/// Returns every relation reachable within `max_depth` hops of `entity_id`,
/// each relation once, in discovery order.
pub async fn traverse_relations(
    db: &Db,
    kb_id: &str,
    entity_id: &str,
    max_depth: usize,
) -> Result<Vec<Relation>> {
    let mut visited = HashSet::new();
    let mut seen_relations = HashSet::new();
    let mut queue = VecDeque::new();
    let mut result = Vec::new();

    queue.push_back((entity_id.to_string(), 0));
    visited.insert(entity_id.to_string());

    while let Some((entity, depth)) = queue.pop_front() {
        if depth >= max_depth {
            continue;
        }

        for rel in relations_of(db, kb_id, &entity).await? {
            if !seen_relations.insert(rel.id.clone()) {
                continue;
            }
            let neighbor = if rel.source_entity_id == entity {
                &rel.target_entity_id
            } else {
                &rel.source_entity_id
            };
            if visited.insert(neighbor.clone()) {
                queue.push_back((neighbor.clone(), depth + 1));
            }
            result.push(rel);
        }
    }

    log::debug!(
        "Traversal from {} (depth {}) found {} relations",
        entity_id,
        max_depth,
        result.len()
    );
    Ok(result)
}

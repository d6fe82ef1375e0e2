//! Knowledge graph module: LLM extraction, build tasks, storage and search.
//!
//! Document text flows through [`extraction`] (which uses [`parser`]) under a
//! [`task`] that tracks progress, lands in the tables managed by [`store`], and
//! is queried through [`search`] and [`traversal`].

pub mod chunk;
pub mod extraction;
pub mod parser;
pub mod search;
pub mod store;
pub mod task;
pub mod traversal;

pub use chunk::chunk_text;
pub use extraction::{
    compute_target_triples, extract_entities_relations, extract_triples, ExtractionFormat,
    ExtractionSettings, TripleExtraction, TupleExtraction,
};
pub use parser::{
    hash_key_parts, hash_triple_key, normalize_triple, parse_extraction_output, parse_triples, Delimiters,
    ExtractedEntity, ExtractedRelation, ExtractionOutput, Named, RawTriple, Triple, Typed,
};
pub use search::{get_stats, hybrid_search, GraphSearchResult, GraphStats, SearchMode, SearchOptions};
pub use store::{
    add_entity_description, clear_knowledge_graph, commit_extraction, get_entity_descriptions, insert_entity,
    insert_relation, ClearSummary, CommitSummary, StagedGraph,
};
pub use task::{
    build_document, create_build_task, get_task_status, list_build_tasks, run_build_task, BuildGuard,
    BuildOptions, BuildRegistry, BuildTask, InFlight, TaskStatus,
};
pub use traversal::traverse_relations;

use serde::{Deserialize, Serialize};

/// Entity type used when the model omits one.
pub const DEFAULT_ENTITY_TYPE: &str = "Other";

/// Default bilingual entity taxonomy offered to the model.
pub fn default_entity_types() -> Vec<String> {
    [
        "Person/人物",
        "Organization/组织",
        "Location/地点",
        "Event/事件",
        "Concept/概念",
        "Product/产品",
        "Technology/技术",
        "Method/方法",
        "Data/数据",
        "Document/文档",
        "Other/其他",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// A node of the knowledge graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub kb_id: String,
    pub document_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub created_at: String,
    pub updated_at: String,
}

/// One description attached to an entity. Rows are only ever appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDescription {
    pub id: String,
    pub entity_id: String,
    pub kb_id: String,
    pub document_id: String,
    pub description: String,
    pub created_at: String,
}

/// An edge between two entities of the same knowledge base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub id: String,
    pub kb_id: String,
    pub source_entity_id: String,
    pub target_entity_id: String,
    pub keywords: Vec<String>,
    pub description: Option<String>,
    pub created_at: String,
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::db::{migrate, Db};
    use tempfile::TempDir;

    /// Fresh migrated database in a temp directory.
    pub async fn setup_test_db() -> (Db, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Db::new(temp_dir.path().join("test.db"));
        db.with_connection(|conn| migrate::run_embedded_migrations(conn))
            .await
            .unwrap();
        (db, temp_dir)
    }
}

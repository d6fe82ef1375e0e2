pub mod config;
pub mod error;
pub mod db;
pub mod graph;
pub mod llm;
pub mod search;

pub use config::Config;
pub use error::{KgragError, Result};
pub use graph::{
    clear_knowledge_graph, create_build_task, get_stats, get_task_status, hybrid_search, run_build_task,
    traverse_relations, BuildRegistry, Entity, Relation,
};
pub use search::rank_knowledge_results;

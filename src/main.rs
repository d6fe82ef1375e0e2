use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kgrag::db::{migrate, Db};
use kgrag::graph::{self, BuildRegistry, SearchMode, SearchOptions};
use kgrag::llm::OpenAIExecutor;
use kgrag::search::{rank_knowledge_results, KnowledgeResult, RankParams, RetrievalMode};
use kgrag::Config;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "kgrag")]
#[command(about = "Build knowledge graphs from documents and query them", version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply database migrations
    Migrate {
        /// Directory of NNN_name.sql files; the built-in schema is used when omitted
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Extract a document into the knowledge graph
    Build {
        #[arg(long)]
        kb: String,
        #[arg(long)]
        doc: String,
        /// Text file to extract from
        #[arg(long)]
        file: PathBuf,
        #[arg(long, default_value = "cli")]
        agent: String,
    },
    /// Show one build task, or every task of a knowledge base
    Task {
        /// Task id
        id: Option<String>,
        #[arg(long, conflicts_with = "id")]
        kb: Option<String>,
    },
    /// Search entities of a knowledge base
    Search {
        #[arg(long)]
        kb: String,
        query: String,
        /// local, global or naive
        #[arg(long)]
        mode: Option<SearchMode>,
        #[arg(long)]
        top_k: Option<usize>,
        /// Also list relations within this many hops of each hit
        #[arg(long)]
        depth: Option<usize>,
    },
    /// Entity counts by type
    Stats {
        #[arg(long)]
        kb: String,
    },
    /// Delete every entity, relation and task of a knowledge base
    Clear {
        #[arg(long)]
        kb: String,
        /// Required to actually delete
        #[arg(long)]
        yes: bool,
    },
    /// Re-rank scored retrieval hits read from a JSON array file
    Rank {
        /// JSON file holding `[{path, snippet, score}, ...]`
        #[arg(long)]
        results: PathBuf,
        query: String,
        /// semantic, keyword or hybrid
        #[arg(long)]
        mode: Option<RetrievalMode>,
        #[arg(long)]
        min_score: Option<f64>,
        #[arg(long)]
        alpha: Option<f64>,
        #[arg(long)]
        max_results: Option<usize>,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn open_db(config: &Config) -> Result<Db> {
    let db = Db::new(config.db_path());
    db.with_connection(|conn| migrate::run_embedded_migrations(conn)).await?;
    Ok(db)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("RUST_LOG", "info")
    ).init();

    let args = Args::parse();
    let config = Config::load()?;
    log::debug!("Database path: {}", config.db_path().display());

    match args.command {
        Command::Migrate { dir } => {
            let db = Db::new(config.db_path());
            match dir {
                Some(dir) => db.with_connection(move |conn| migrate::run_migrations(conn, &dir)).await?,
                None => db.with_connection(|conn| migrate::run_embedded_migrations(conn)).await?,
            }
            let applied = db.with_connection(|conn| migrate::get_applied_migrations(conn)).await?;
            log::info!("Database ready at {} ({} migrations applied)", config.db_path().display(), applied.len());
        }
        Command::Build { kb, doc, file, agent } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let db = open_db(&config).await?;
            let executor = OpenAIExecutor::new(config.llm.base_url.clone(), config.api_key()?, config.llm.model.clone())?;
            let registry = BuildRegistry::new();
            let options = config.build_options();

            log::info!("Building kb {} document {} from {}", kb, doc, file.display());
            let task = graph::build_document(&db, &executor, &registry, &kb, &doc, &agent, &text, &options).await?;
            print_json(&task)?;
        }
        Command::Task { id, kb } => {
            let db = open_db(&config).await?;
            match (id, kb) {
                (Some(id), _) => match graph::get_task_status(&db, &id).await? {
                    Some(task) => print_json(&task)?,
                    None => anyhow::bail!("No build task with id {}", id),
                },
                (None, Some(kb)) => print_json(&graph::list_build_tasks(&db, &kb).await?)?,
                (None, None) => anyhow::bail!("Pass a task id or --kb"),
            }
        }
        Command::Search { kb, query, mode, top_k, depth } => {
            let db = open_db(&config).await?;
            let defaults = config.search_options();
            let options = SearchOptions {
                mode: mode.unwrap_or(defaults.mode),
                top_k: top_k.unwrap_or(defaults.top_k),
            };
            let result = graph::hybrid_search(&db, &kb, &query, &options).await?;
            match depth {
                None => print_json(&result)?,
                Some(depth) => {
                    let mut expanded = Vec::with_capacity(result.entities.len());
                    for entity in result.entities {
                        let relations = graph::traverse_relations(&db, &kb, &entity.id, depth).await?;
                        expanded.push(serde_json::json!({ "entity": entity, "relations": relations }));
                    }
                    print_json(&expanded)?;
                }
            }
        }
        Command::Stats { kb } => {
            let db = open_db(&config).await?;
            print_json(&graph::get_stats(&db, &kb).await?)?;
        }
        Command::Clear { kb, yes } => {
            if !yes {
                anyhow::bail!("Refusing to clear kb {} without --yes", kb);
            }
            let db = open_db(&config).await?;
            let summary = graph::clear_knowledge_graph(&db, &kb).await?;
            println!(
                "Cleared kb {}: {} entities, {} relations, {} descriptions, {} tasks",
                kb, summary.entities, summary.relations, summary.descriptions, summary.tasks
            );
        }
        Command::Rank { results, query, mode, min_score, alpha, max_results } => {
            let raw = std::fs::read_to_string(&results)
                .with_context(|| format!("Failed to read {}", results.display()))?;
            let hits: Vec<KnowledgeResult> = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not a JSON array of results", results.display()))?;
            let ranked = rank_knowledge_results(RankParams {
                results: hits,
                query,
                retrieval_mode: mode.unwrap_or(config.search.retrieval_mode),
                min_score: min_score.unwrap_or(config.search.min_score),
                hybrid_alpha: alpha.unwrap_or(config.search.hybrid_alpha),
                max_results: max_results.unwrap_or(config.search.max_results),
            });
            print_json(&ranked)?;
        }
    }

    Ok(())
}

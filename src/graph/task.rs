//! Build task lifecycle: `pending -> running -> success | failed`.
//!
//! One task tracks one extraction run over one document. Chunks are processed
//! one after another, so the counters on the row are always consistent with
//! the progress value.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use uuid::Uuid;

use super::chunk::chunk_text;
use super::extraction::{extract_entities_relations, extract_triples, ExtractionFormat, ExtractionSettings};
use super::store::{commit_staged, CommitSummary, StagedGraph};
use crate::db::Db;
use crate::error::{KgragError, Result};
use crate::llm::LlmExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = KgragError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "success" => Ok(TaskStatus::Success),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(KgragError::Parse(format!("unknown task status: {}", other))),
        }
    }
}

/// Stored state of one extraction run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildTask {
    pub id: String,
    pub kb_id: String,
    pub document_id: String,
    pub agent_id: String,
    pub status: TaskStatus,
    pub progress: u32,
    pub total_chunks: u32,
    pub processed_chunks: u32,
    pub entities_count: u32,
    pub relations_count: u32,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Options a task is created with; stored on the row so a pending task can be
/// picked up later by [`run_build_task`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildOptions {
    #[serde(flatten)]
    pub settings: ExtractionSettings,
    #[serde(default = "default_chunk_size_chars")]
    pub chunk_size_chars: usize,
}

fn default_chunk_size_chars() -> usize {
    4_000
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            settings: ExtractionSettings::default(),
            chunk_size_chars: default_chunk_size_chars(),
        }
    }
}

const TASK_COLUMNS: &str = "id, kb_id, document_id, agent_id, status, progress, total_chunks, \
     processed_chunks, entities_count, relations_count, error, created_at, updated_at";

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<BuildTask> {
    let status: String = row.get(4)?;
    let status = status.parse::<TaskStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(BuildTask {
        id: row.get(0)?,
        kb_id: row.get(1)?,
        document_id: row.get(2)?,
        agent_id: row.get(3)?,
        status,
        progress: row.get(5)?,
        total_chunks: row.get(6)?,
        processed_chunks: row.get(7)?,
        entities_count: row.get(8)?,
        relations_count: row.get(9)?,
        error: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn load_task(conn: &Connection, task_id: &str) -> Result<Option<BuildTask>> {
    let sql = format!("SELECT {} FROM kg_build_tasks WHERE id = ?1", TASK_COLUMNS);
    Ok(conn.query_row(&sql, [task_id], task_from_row).optional()?)
}

/// Create a `pending` task and return its id.
pub async fn create_build_task(
    db: &Db,
    kb_id: &str,
    document_id: &str,
    agent_id: &str,
    options: &BuildOptions,
) -> Result<String> {
    if kb_id.trim().is_empty() || document_id.trim().is_empty() {
        return Err(KgragError::InvalidInput("kb_id and document_id are required".to_string()));
    }
    let task_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    let options_json = serde_json::to_string(options)?;

    let (id, kb, doc, agent) = (task_id.clone(), kb_id.to_string(), document_id.to_string(), agent_id.to_string());
    db.with_connection(move |conn| {
        conn.execute(
            "INSERT INTO kg_build_tasks (id, kb_id, document_id, agent_id, status, options, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?6)",
            params![id, kb, doc, agent, options_json, now],
        )?;
        Ok(())
    })
    .await?;

    log::info!("Created build task {} for kb {} document {}", task_id, kb_id, document_id);
    Ok(task_id)
}

/// Look up a task. Unknown ids yield `Ok(None)`.
pub async fn get_task_status(db: &Db, task_id: &str) -> Result<Option<BuildTask>> {
    let task_id = task_id.to_string();
    db.with_connection(move |conn| load_task(conn, &task_id)).await
}

/// Tasks of one knowledge base, newest first.
pub async fn list_build_tasks(db: &Db, kb_id: &str) -> Result<Vec<BuildTask>> {
    let kb_id = kb_id.to_string();
    db.with_connection(move |conn| {
        let sql = format!(
            "SELECT {} FROM kg_build_tasks WHERE kb_id = ?1 ORDER BY created_at DESC, rowid DESC",
            TASK_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([&kb_id], task_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    })
    .await
}

async fn load_options(db: &Db, task_id: &str) -> Result<BuildOptions> {
    let task_id = task_id.to_string();
    let json: String = db
        .with_connection(move |conn| {
            Ok(conn.query_row("SELECT options FROM kg_build_tasks WHERE id = ?1", [&task_id], |row| row.get(0))?)
        })
        .await?;
    Ok(serde_json::from_str(&json)?)
}

type SqlValue = Box<dyn rusqlite::ToSql + Send>;

fn sql<T: rusqlite::ToSql + Send + 'static>(value: T) -> SqlValue {
    Box::new(value)
}

/// Run one guarded UPDATE; zero affected rows means the task was missing or in
/// a state the transition does not start from.
async fn transition(
    db: &Db,
    task_id: &str,
    to: TaskStatus,
    statement: &'static str,
    values: Vec<SqlValue>,
) -> Result<()> {
    let id = task_id.to_string();
    db.with_connection(move |conn| {
        let mut bound: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(values.len() + 1);
        bound.push(&id);
        for value in &values {
            bound.push(&**value);
        }
        let changed = conn.execute(statement, rusqlite::params_from_iter(bound))?;
        if changed == 1 {
            return Ok(());
        }
        let from = load_task(conn, &id)?
            .map(|t| t.status.to_string())
            .unwrap_or_else(|| "missing".to_string());
        Err(KgragError::InvalidTransition {
            task_id: id.clone(),
            from,
            to: to.to_string(),
        })
    })
    .await
}

/// `pending -> running`, recording how many chunks will be processed.
pub async fn mark_running(db: &Db, task_id: &str, total_chunks: u32) -> Result<()> {
    transition(
        db,
        task_id,
        TaskStatus::Running,
        "UPDATE kg_build_tasks SET status = 'running', total_chunks = ?2, progress = 0, updated_at = ?3 \
         WHERE id = ?1 AND status = 'pending'",
        vec![sql(total_chunks), sql(Utc::now().to_rfc3339())],
    )
    .await
}

/// Record progress after a chunk. Progress never moves backwards.
pub async fn update_progress(
    db: &Db,
    task_id: &str,
    processed_chunks: u32,
    entities_count: u32,
    relations_count: u32,
) -> Result<()> {
    transition(
        db,
        task_id,
        TaskStatus::Running,
        "UPDATE kg_build_tasks SET processed_chunks = ?2, \
             progress = MAX(progress, CASE WHEN total_chunks > 0 THEN MIN(100, ?2 * 100 / total_chunks) ELSE 0 END), \
             entities_count = ?3, relations_count = ?4, updated_at = ?5 \
         WHERE id = ?1 AND status = 'running'",
        vec![
            sql(processed_chunks),
            sql(entities_count),
            sql(relations_count),
            sql(Utc::now().to_rfc3339()),
        ],
    )
    .await
}

/// `running -> success` with final counts.
pub async fn complete_task(db: &Db, task_id: &str, entities_count: u32, relations_count: u32) -> Result<()> {
    transition(
        db,
        task_id,
        TaskStatus::Success,
        "UPDATE kg_build_tasks SET status = 'success', progress = 100, processed_chunks = total_chunks, \
             entities_count = ?2, relations_count = ?3, updated_at = ?4 \
         WHERE id = ?1 AND status = 'running'",
        vec![
            sql(entities_count),
            sql(relations_count),
            sql(Utc::now().to_rfc3339()),
        ],
    )
    .await
}

/// `pending | running -> failed` with the error text.
pub async fn fail_task(db: &Db, task_id: &str, error: &str) -> Result<()> {
    transition(
        db,
        task_id,
        TaskStatus::Failed,
        "UPDATE kg_build_tasks SET status = 'failed', error = ?2, updated_at = ?3 \
         WHERE id = ?1 AND status IN ('pending', 'running')",
        vec![sql(error.to_string()), sql(Utc::now().to_rfc3339())],
    )
    .await
}

/// Tracks which `(kb_id, document_id)` pairs have a build in progress, and
/// which task holds each of them.
#[derive(Debug, Default)]
pub struct BuildRegistry {
    in_flight: Mutex<HashMap<(String, String), String>>,
}

impl BuildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a pair for `task_id`.
    ///
    /// When the pair is taken, the error carries the holder's task id so the
    /// caller can tell a retry of the same task from a competing one.
    pub fn acquire(
        &self,
        kb_id: &str,
        document_id: &str,
        task_id: &str,
    ) -> std::result::Result<BuildGuard<'_>, InFlight> {
        let key = (kb_id.to_string(), document_id.to_string());
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(holder) = in_flight.get(&key) {
            return Err(InFlight {
                holder: holder.clone(),
                error: KgragError::TaskInFlight {
                    kb_id: key.0,
                    document_id: key.1,
                },
            });
        }
        in_flight.insert(key.clone(), task_id.to_string());
        Ok(BuildGuard { registry: self, key })
    }

    pub fn is_in_flight(&self, kb_id: &str, document_id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&(kb_id.to_string(), document_id.to_string()))
    }
}

/// A refused [`BuildRegistry::acquire`].
#[derive(Debug)]
pub struct InFlight {
    /// Task currently holding the pair.
    pub holder: String,
    pub error: KgragError,
}

/// Releases its `(kb_id, document_id)` claim when dropped.
#[derive(Debug)]
pub struct BuildGuard<'a> {
    registry: &'a BuildRegistry,
    key: (String, String),
}

impl Drop for BuildGuard<'_> {
    fn drop(&mut self) {
        self.registry
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

fn to_count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

async fn extract_all(
    db: &Db,
    executor: &dyn LlmExecutor,
    task_id: &str,
    chunks: &[String],
    settings: &ExtractionSettings,
) -> Result<StagedGraph> {
    let mut staged = StagedGraph::new();
    for (idx, chunk) in chunks.iter().enumerate() {
        match settings.format {
            ExtractionFormat::Triples => {
                let result = extract_triples(chunk, settings, executor).await?;
                log::debug!(
                    "Task {} chunk {}/{}: {} triples (target {})",
                    task_id,
                    idx + 1,
                    chunks.len(),
                    result.triples.len(),
                    result.target_triples
                );
                staged.add_triples(&result.triples);
            }
            ExtractionFormat::Tuples => {
                let result = extract_entities_relations(chunk, settings, executor).await?;
                log::debug!(
                    "Task {} chunk {}/{}: {} entities, {} relations",
                    task_id,
                    idx + 1,
                    chunks.len(),
                    result.output.entities.len(),
                    result.output.relations.len()
                );
                staged.add_output(&result.output);
            }
        }
        update_progress(
            db,
            task_id,
            to_count(idx + 1),
            to_count(staged.entity_count()),
            to_count(staged.relation_count()),
        )
        .await?;
    }
    Ok(staged)
}

/// Mark the task failed and hand back `error`.
///
/// A task that can no longer be failed (cleared, or already terminal) only
/// gets a warning; the caller still sees the error that ended the run.
async fn fail_with(db: &Db, task_id: &str, error: KgragError) -> KgragError {
    if let Err(e) = fail_task(db, task_id, &error.to_string()).await {
        log::warn!("Could not mark task {} failed: {}", task_id, e);
    }
    error
}

/// Drive a pending task over `chunks` to a terminal state.
///
/// Facts from all chunks are committed together in one transaction after the
/// last chunk, so a failed run leaves no entities or relations behind. Any
/// error marks the task failed and is returned to the caller. A second call
/// for a task that is already running returns an error and leaves the first
/// run alone.
pub async fn run_build_task(
    db: &Db,
    executor: &dyn LlmExecutor,
    registry: &BuildRegistry,
    task_id: &str,
    chunks: &[String],
) -> Result<BuildTask> {
    let task = get_task_status(db, task_id)
        .await?
        .ok_or_else(|| KgragError::InvalidInput(format!("unknown build task {}", task_id)))?;
    if task.status != TaskStatus::Pending {
        return Err(KgragError::InvalidTransition {
            task_id: task_id.to_string(),
            from: task.status.to_string(),
            to: TaskStatus::Running.to_string(),
        });
    }

    let _guard = match registry.acquire(&task.kb_id, &task.document_id, task_id) {
        Ok(guard) => guard,
        Err(refused) if refused.holder == task_id => {
            log::warn!("Task {} is already running", task_id);
            return Err(refused.error);
        }
        Err(refused) => return Err(fail_with(db, task_id, refused.error).await),
    };

    let options = match load_options(db, task_id).await {
        Ok(options) => options,
        Err(e) => return Err(fail_with(db, task_id, e).await),
    };
    // The pending -> running update is the claim; losing it means another run
    // already moved the task on, and that run owns the row.
    match mark_running(db, task_id, to_count(chunks.len())).await {
        Ok(()) => {}
        Err(e @ KgragError::InvalidTransition { .. }) => return Err(e),
        Err(e) => return Err(fail_with(db, task_id, e).await),
    }
    log::info!("Task {} running over {} chunks", task_id, chunks.len());

    let outcome: Result<CommitSummary> = async {
        let staged = extract_all(db, executor, task_id, chunks, &options.settings).await?;
        let (kb_id, document_id) = (task.kb_id.clone(), task.document_id.clone());
        db.with_connection(move |conn| commit_staged(conn, &kb_id, &document_id, &staged))
            .await
    }
    .await;

    match outcome {
        Ok(summary) => {
            complete_task(db, task_id, to_count(summary.entities), to_count(summary.relations)).await?;
            log::info!(
                "Task {} succeeded: {} entities, {} relations ({} relations dropped)",
                task_id,
                summary.entities,
                summary.relations,
                summary.skipped_relations
            );
        }
        Err(e) => {
            log::warn!("Task {} failed: {}", task_id, e);
            return Err(fail_with(db, task_id, e).await);
        }
    }

    get_task_status(db, task_id)
        .await?
        .ok_or_else(|| KgragError::InvalidInput(format!("build task {} vanished", task_id)))
}

/// Create a task for `text`, chunk it and run it to completion.
#[allow(clippy::too_many_arguments)]
pub async fn build_document(
    db: &Db,
    executor: &dyn LlmExecutor,
    registry: &BuildRegistry,
    kb_id: &str,
    document_id: &str,
    agent_id: &str,
    text: &str,
    options: &BuildOptions,
) -> Result<BuildTask> {
    let task_id = create_build_task(db, kb_id, document_id, agent_id, options).await?;
    let chunks = chunk_text(text, options.chunk_size_chars);
    run_build_task(db, executor, registry, &task_id, &chunks).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::test_support::setup_test_db;
    use crate::llm::test_support::ScriptedExecutor;
    use crate::llm::{ExecuteOptions, ExecuteResult};
    use std::time::Duration;

    async fn count_entities(db: &Db, kb_id: &str) -> i64 {
        let kb_id = kb_id.to_string();
        db.with_connection(move |conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM kg_entities WHERE kb_id = ?1", [&kb_id], |row| row.get(0))?)
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_new_task_is_pending() {
        let (db, _temp) = setup_test_db().await;
        let id = create_build_task(&db, "kb1", "doc1", "agent1", &BuildOptions::default()).await.unwrap();
        let task = get_task_status(&db, &id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.kb_id, "kb1");
        assert_eq!(task.document_id, "doc1");
        assert_eq!(task.agent_id, "agent1");
        assert_eq!(task.progress, 0);
        assert!(task.error.is_none());
    }

    #[tokio::test]
    async fn test_unknown_task_is_none() {
        let (db, _temp) = setup_test_db().await;
        assert!(get_task_status(&db, "does-not-exist").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_running_progress_is_stored() {
        let (db, _temp) = setup_test_db().await;
        let id = create_build_task(&db, "kb1", "doc1", "agent1", &BuildOptions::default()).await.unwrap();
        mark_running(&db, &id, 4).await.unwrap();
        update_progress(&db, &id, 2, 7, 3).await.unwrap();

        let task = get_task_status(&db, &id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.progress, 50);
        assert_eq!(task.total_chunks, 4);
        assert_eq!(task.processed_chunks, 2);
        assert_eq!(task.entities_count, 7);
        assert_eq!(task.relations_count, 3);
    }

    #[tokio::test]
    async fn test_progress_never_decreases() {
        let (db, _temp) = setup_test_db().await;
        let id = create_build_task(&db, "kb1", "doc1", "agent1", &BuildOptions::default()).await.unwrap();
        mark_running(&db, &id, 4).await.unwrap();
        update_progress(&db, &id, 3, 0, 0).await.unwrap();
        update_progress(&db, &id, 1, 0, 0).await.unwrap();
        assert_eq!(get_task_status(&db, &id).await.unwrap().unwrap().progress, 75);
    }

    #[tokio::test]
    async fn test_terminal_status_is_final() {
        let (db, _temp) = setup_test_db().await;
        let id = create_build_task(&db, "kb1", "doc1", "agent1", &BuildOptions::default()).await.unwrap();
        assert!(complete_task(&db, &id, 0, 0).await.is_err(), "pending cannot jump to success");
        fail_task(&db, &id, "boom").await.unwrap();

        let err = mark_running(&db, &id, 1).await.unwrap_err();
        match err {
            KgragError::InvalidTransition { from, to, .. } => {
                assert_eq!(from, "failed");
                assert_eq!(to, "running");
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(fail_task(&db, &id, "again").await.is_err());
        let task = get_task_status(&db, &id).await.unwrap().unwrap();
        assert_eq!(task.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_run_build_task_success() {
        let (db, _temp) = setup_test_db().await;
        let executor = ScriptedExecutor::texts(&[
            r#"{"h": {"name": "Apple", "type": "组织", "description": "technology company"}, "r": "led by", "t": {"name": "Tim Cook", "type": "人物"}}"#,
            r#"{"h": "Apple", "r": "makes", "t": "iPhone"}"#,
        ]);
        let registry = BuildRegistry::new();
        let id = create_build_task(&db, "kb1", "doc1", "agent1", &BuildOptions::default()).await.unwrap();
        let chunks = vec!["chunk one".to_string(), "chunk two".to_string()];

        let task = run_build_task(&db, &executor, &registry, &id, &chunks).await.unwrap();
        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(task.progress, 100);
        assert_eq!(task.processed_chunks, 2);
        assert_eq!(task.entities_count, 3);
        assert_eq!(task.relations_count, 2);
        assert_eq!(count_entities(&db, "kb1").await, 3);
        assert!(!registry.is_in_flight("kb1", "doc1"));
    }

    #[tokio::test]
    async fn test_run_build_task_failure_commits_nothing() {
        let (db, _temp) = setup_test_db().await;
        let executor = ScriptedExecutor::new(vec![
            Ok(crate::llm::ExecuteResult::from_text(r#"{"h": "A", "r": "r", "t": "B"}"#)),
            Err(KgragError::Llm("connection reset".to_string())),
        ]);
        let registry = BuildRegistry::new();
        let id = create_build_task(&db, "kb1", "doc1", "agent1", &BuildOptions::default()).await.unwrap();
        let chunks = vec!["one".to_string(), "two".to_string(), "three".to_string()];

        let err = run_build_task(&db, &executor, &registry, &id, &chunks).await.unwrap_err();
        assert!(matches!(err, KgragError::Llm(_)));

        let task = get_task_status(&db, &id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("connection reset"));
        assert_eq!(task.processed_chunks, 1);
        assert_eq!(count_entities(&db, "kb1").await, 0);
        assert!(!registry.is_in_flight("kb1", "doc1"));
    }

    #[tokio::test]
    async fn test_concurrent_build_for_same_document_rejected() {
        let (db, _temp) = setup_test_db().await;
        let executor = ScriptedExecutor::texts(&[]);
        let registry = BuildRegistry::new();
        let _held = registry.acquire("kb1", "doc1", "other-task").unwrap();

        let id = create_build_task(&db, "kb1", "doc1", "agent1", &BuildOptions::default()).await.unwrap();
        let err = run_build_task(&db, &executor, &registry, &id, &["x".to_string()]).await.unwrap_err();
        assert!(matches!(err, KgragError::TaskInFlight { .. }));
        assert_eq!(get_task_status(&db, &id).await.unwrap().unwrap().status, TaskStatus::Failed);

        // A different document is unaffected
        assert!(registry.acquire("kb1", "doc2", "third-task").is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_run_of_same_task_keeps_first_run() {
        let (db, _temp) = setup_test_db().await;
        let executor = ScriptedExecutor::texts(&[r#"{"h": "Apple", "r": "led by", "t": "Tim Cook"}"#])
            .with_delay(Duration::from_millis(200));
        let registry = BuildRegistry::new();
        let id = create_build_task(&db, "kb1", "doc1", "agent1", &BuildOptions::default()).await.unwrap();
        let chunks = vec!["Apple is led by Tim Cook.".to_string()];

        let (a, b) = tokio::join!(
            run_build_task(&db, &executor, &registry, &id, &chunks),
            run_build_task(&db, &executor, &registry, &id, &chunks),
        );
        let (winner, loser) = if a.is_ok() { (a, b) } else { (b, a) };
        assert_eq!(winner.unwrap().status, TaskStatus::Success);
        assert!(matches!(
            loser.unwrap_err(),
            KgragError::TaskInFlight { .. } | KgragError::InvalidTransition { .. }
        ));

        let task = get_task_status(&db, &id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Success);
        assert!(task.error.is_none());
        assert_eq!(count_entities(&db, "kb1").await, 2);
        assert_eq!(executor.prompts.lock().unwrap().len(), 1);
    }

    /// Clears the knowledge base mid-call, then reports a model failure.
    struct ClearingExecutor {
        db: Db,
    }

    #[async_trait::async_trait]
    impl LlmExecutor for ClearingExecutor {
        async fn execute(&self, _prompt: &str, _options: &ExecuteOptions) -> Result<ExecuteResult> {
            crate::graph::clear_knowledge_graph(&self.db, "kb1").await?;
            Err(KgragError::Llm("model unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_failure_keeps_original_error_when_task_is_gone() {
        let (db, _temp) = setup_test_db().await;
        let executor = ClearingExecutor { db: db.clone() };
        let registry = BuildRegistry::new();
        let id = create_build_task(&db, "kb1", "doc1", "agent1", &BuildOptions::default()).await.unwrap();

        let err = run_build_task(&db, &executor, &registry, &id, &["text".to_string()]).await.unwrap_err();
        match err {
            KgragError::Llm(message) => assert_eq!(message, "model unavailable"),
            other => panic!("unexpected error: {}", other),
        }
        assert!(get_task_status(&db, &id).await.unwrap().is_none());
        assert!(!registry.is_in_flight("kb1", "doc1"));
    }

    #[tokio::test]
    async fn test_unreadable_options_fail_the_task() {
        let (db, _temp) = setup_test_db().await;
        let executor = ScriptedExecutor::texts(&[]);
        let registry = BuildRegistry::new();
        let id = create_build_task(&db, "kb1", "doc1", "agent1", &BuildOptions::default()).await.unwrap();
        let row_id = id.clone();
        db.with_connection(move |conn| {
            conn.execute("UPDATE kg_build_tasks SET options = 'not json' WHERE id = ?1", [&row_id])?;
            Ok(())
        })
        .await
        .unwrap();

        let err = run_build_task(&db, &executor, &registry, &id, &["text".to_string()]).await.unwrap_err();
        assert!(matches!(err, KgragError::Json(_)));

        let task = get_task_status(&db, &id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.is_some());
        assert!(executor.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_build_document_tuple_format() {
        let (db, _temp) = setup_test_db().await;
        let executor = ScriptedExecutor::texts(&[
            "entity<|#|>Apple<|#|>组织<|#|>A technology company\n\
             entity<|#|>Tim Cook<|#|>人物<|#|>CEO\n\
             relation<|#|>Tim Cook<|#|>Apple<|#|>leads, CEO<|#|>Tim Cook leads Apple\n\
             <|COMPLETE|>",
        ]);
        let registry = BuildRegistry::new();
        let mut options = BuildOptions::default();
        options.settings.format = ExtractionFormat::Tuples;

        let task = build_document(&db, &executor, &registry, "kb1", "doc1", "agent1", "Tim Cook leads Apple.", &options)
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(task.total_chunks, 1);
        assert_eq!(task.entities_count, 2);
        assert_eq!(task.relations_count, 1);
    }

    #[tokio::test]
    async fn test_empty_document_succeeds_without_llm_calls() {
        let (db, _temp) = setup_test_db().await;
        let executor = ScriptedExecutor::texts(&[]);
        let registry = BuildRegistry::new();
        let task = build_document(&db, &executor, &registry, "kb1", "doc1", "agent1", "", &BuildOptions::default())
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(task.progress, 100);
        assert!(executor.prompts.lock().unwrap().is_empty());
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in [TaskStatus::Pending, TaskStatus::Running, TaskStatus::Success, TaskStatus::Failed] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("done".parse::<TaskStatus>().is_err());
    }
}

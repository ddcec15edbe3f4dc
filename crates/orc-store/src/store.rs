use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tokio_rusqlite::Connection;

use orc_core::id::TaskId;
use orc_core::plan::Plan;
use orc_core::types::{
    find_dependency_cycle, ExecutionState, GateDecisionRecord, PhaseState, Task, TaskQueue,
    TaskStatus, TranscriptRecord, TranscriptRole,
};

use crate::schema::{PRAGMAS, SCHEMA, SCHEMA_VERSION};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("schema mismatch: database has version {found}, engine supports {expected}; \
             move the database aside or delete it to start fresh")]
    SchemaMismatch { found: i64, expected: i64 },

    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Filters and refs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub project_id: Option<String>,
    pub status: Option<TaskStatus>,
    pub queue: Option<TaskQueue>,
}

/// A hit from full-text transcript search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptRef {
    pub task_id: TaskId,
    pub phase: String,
    pub iteration: u32,
    pub snippet: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskComment {
    pub task_id: TaskId,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// helpers — enum <-> SQLite string
// ---------------------------------------------------------------------------

fn enum_to_sql<T: serde::Serialize>(val: &T) -> String {
    let s = serde_json::to_string(val).expect("serialize enum");
    s.trim_matches('"').to_string()
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Async SQLite-backed store. Cheap to share behind an `Arc`.
pub struct Store {
    conn: Connection,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open (or create) a database at the given file path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init().await?;
        Ok(store)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init().await?;
        Ok(store)
    }

    /// Apply pragmas, then enforce the clean-slate schema version policy:
    /// fresh database -> apply schema; same version -> proceed; anything
    /// else -> `SchemaMismatch`.
    async fn init(&self) -> Result<()> {
        let found = self
            .conn
            .call(|conn| {
                conn.execute_batch(PRAGMAS)?;
                let have_meta: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM sqlite_master
                     WHERE type = 'table' AND name = 'schema_meta')",
                    [],
                    |row| row.get(0),
                )?;
                if !have_meta {
                    conn.execute_batch(SCHEMA)?;
                    conn.execute(
                        "INSERT INTO schema_meta (id, version) VALUES (1, ?1)",
                        [SCHEMA_VERSION],
                    )?;
                    return Ok(SCHEMA_VERSION);
                }
                let version: Option<i64> = conn
                    .query_row("SELECT version FROM schema_meta WHERE id = 1", [], |row| {
                        row.get(0)
                    })
                    .optional()?;
                Ok(version.unwrap_or(0))
            })
            .await?;

        if found != SCHEMA_VERSION {
            return Err(StoreError::SchemaMismatch {
                found,
                expected: SCHEMA_VERSION,
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    /// Insert a new task; `AlreadyExists` if the id is taken.
    pub async fn create_task(&self, task: &Task) -> Result<()> {
        self.check_dependency_cycles(task).await?;
        let row = TaskRow::from_task(task)?;
        let id = row.id.clone();
        let result = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "INSERT OR IGNORE INTO tasks
                     (id, project_id, status, queue, priority, weight, data, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    rusqlite::params![
                        row.id,
                        row.project_id,
                        row.status,
                        row.queue,
                        row.priority,
                        row.weight,
                        row.data,
                        row.created_at,
                        row.updated_at,
                    ],
                )?;
                Ok(n)
            })
            .await?;
        if result == 0 {
            return Err(StoreError::AlreadyExists(id));
        }
        Ok(())
    }

    /// Idempotent save: identical content does not touch the row.
    pub async fn save_task(&self, task: &Task) -> Result<()> {
        self.check_dependency_cycles(task).await?;
        let row = TaskRow::from_task(task)?;
        self.conn
            .call(move |conn| {
                let existing: Option<String> = conn
                    .query_row("SELECT data FROM tasks WHERE id = ?1", [&row.id], |r| {
                        r.get(0)
                    })
                    .optional()?;
                match existing {
                    Some(data) if data == row.data => Ok(()),
                    Some(_) => {
                        conn.execute(
                            "UPDATE tasks SET project_id = ?2, status = ?3, queue = ?4,
                             priority = ?5, weight = ?6, data = ?7, updated_at = ?8
                             WHERE id = ?1",
                            rusqlite::params![
                                row.id,
                                row.project_id,
                                row.status,
                                row.queue,
                                row.priority,
                                row.weight,
                                row.data,
                                row.updated_at,
                            ],
                        )?;
                        Ok(())
                    }
                    None => {
                        conn.execute(
                            "INSERT INTO tasks
                             (id, project_id, status, queue, priority, weight, data, created_at, updated_at)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                            rusqlite::params![
                                row.id,
                                row.project_id,
                                row.status,
                                row.queue,
                                row.priority,
                                row.weight,
                                row.data,
                                row.created_at,
                                row.updated_at,
                            ],
                        )?;
                        Ok(())
                    }
                }
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn load_task(&self, id: &TaskId) -> Result<Task> {
        let key = id.to_string();
        let data: Option<String> = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row("SELECT data FROM tasks WHERE id = ?1", [&key], |r| r.get(0))
                    .optional()?)
            })
            .await?;
        let data = data.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(serde_json::from_str(&data)?)
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut sql = String::from("SELECT data FROM tasks WHERE 1=1");
        let mut params: Vec<String> = Vec::new();
        if let Some(project) = &filter.project_id {
            sql.push_str(&format!(" AND project_id = ?{}", params.len() + 1));
            params.push(project.clone());
        }
        if let Some(status) = &filter.status {
            sql.push_str(&format!(" AND status = ?{}", params.len() + 1));
            params.push(enum_to_sql(status));
        }
        if let Some(queue) = &filter.queue {
            sql.push_str(&format!(" AND queue = ?{}", params.len() + 1));
            params.push(enum_to_sql(queue));
        }
        sql.push_str(" ORDER BY id");

        let rows: Vec<String> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                        row.get::<_, String>(0)
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.iter()
            .map(|data| serde_json::from_str(data).map_err(StoreError::from))
            .collect()
    }

    pub async fn delete_task(&self, id: &TaskId) -> Result<()> {
        let key = id.to_string();
        let n = self
            .conn
            .call(move |conn| Ok(conn.execute("DELETE FROM tasks WHERE id = ?1", [&key])?))
            .await?;
        if n == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Reject a save that would introduce a `blocked_by` cycle.
    async fn check_dependency_cycles(&self, task: &Task) -> Result<()> {
        if task.blocked_by.is_empty() {
            return Ok(());
        }
        let mut edges: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        let all = self.list_tasks(&TaskFilter::default()).await?;
        for t in all {
            edges.insert(t.id.clone(), t.blocked_by.clone());
        }
        edges.insert(task.id.clone(), task.blocked_by.clone());
        if let Some(on_cycle) = find_dependency_cycle(&edges) {
            return Err(StoreError::Constraint(format!(
                "blocked_by cycle involving {on_cycle}"
            )));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Plans
    // -----------------------------------------------------------------------

    pub async fn save_plan(&self, task_id: &TaskId, plan: &Plan) -> Result<()> {
        let key = task_id.to_string();
        let data = serde_json::to_string(plan)?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO plans (task_id, data, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?3)
                     ON CONFLICT(task_id) DO UPDATE SET data = ?2, updated_at = ?3",
                    rusqlite::params![key, data, now],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn load_plan(&self, task_id: &TaskId) -> Result<Plan> {
        let key = task_id.to_string();
        let data: Option<String> = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row("SELECT data FROM plans WHERE task_id = ?1", [&key], |r| {
                        r.get(0)
                    })
                    .optional()?)
            })
            .await?;
        let data = data.ok_or_else(|| StoreError::NotFound(format!("plan for {task_id}")))?;
        Ok(serde_json::from_str(&data)?)
    }

    // -----------------------------------------------------------------------
    // Phase states
    // -----------------------------------------------------------------------

    pub async fn save_phase_state(&self, task_id: &TaskId, state: &PhaseState) -> Result<()> {
        let key = task_id.to_string();
        let phase = state.phase.clone();
        let data = serde_json::to_string(state)?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO phases (task_id, phase, data) VALUES (?1, ?2, ?3)
                     ON CONFLICT(task_id, phase) DO UPDATE SET data = ?3",
                    rusqlite::params![key, phase, data],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    /// All phase states for a task, keyed by phase id.
    pub async fn load_phase_states(&self, task_id: &TaskId) -> Result<HashMap<String, PhaseState>> {
        let key = task_id.to_string();
        let rows: Vec<String> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT data FROM phases WHERE task_id = ?1")?;
                let rows = stmt
                    .query_map([&key], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        let mut out = HashMap::new();
        for data in rows {
            let state: PhaseState = serde_json::from_str(&data)?;
            out.insert(state.phase.clone(), state);
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Execution state
    // -----------------------------------------------------------------------

    pub async fn save_execution_state(
        &self,
        task_id: &TaskId,
        state: &ExecutionState,
    ) -> Result<()> {
        let key = task_id.to_string();
        let data = serde_json::to_string(state)?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO states (task_id, data, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(task_id) DO UPDATE SET data = ?2, updated_at = ?3",
                    rusqlite::params![key, data, now],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn load_execution_state(&self, task_id: &TaskId) -> Result<Option<ExecutionState>> {
        let key = task_id.to_string();
        let data: Option<String> = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row("SELECT data FROM states WHERE task_id = ?1", [&key], |r| {
                        r.get(0)
                    })
                    .optional()?)
            })
            .await?;
        match data {
            Some(d) => Ok(Some(serde_json::from_str(&d)?)),
            None => Ok(None),
        }
    }

    pub async fn clear_execution_state(&self, task_id: &TaskId) -> Result<()> {
        let key = task_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM states WHERE task_id = ?1", [&key])?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    // -----------------------------------------------------------------------
    // Transcripts
    // -----------------------------------------------------------------------

    /// Append-only; also feeds the FTS index.
    pub async fn append_transcript(&self, record: &TranscriptRecord) -> Result<()> {
        let task_id = record.task_id.to_string();
        let phase = record.phase.clone();
        let iteration = record.iteration;
        let role = enum_to_sql(&record.role);
        let content = record.content.clone();
        let timestamp = record.timestamp.to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO transcripts (task_id, phase, iteration, role, content, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![task_id, phase, iteration, role, content, timestamp],
                )?;
                let rowid = conn.last_insert_rowid();
                conn.execute(
                    "INSERT INTO transcripts_fts (rowid, content) VALUES (?1, ?2)",
                    rusqlite::params![rowid, content],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn count_transcripts(&self, task_id: &TaskId) -> Result<u64> {
        let key = task_id.to_string();
        let n: i64 = self
            .conn
            .call(move |conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM transcripts WHERE task_id = ?1",
                    [&key],
                    |r| r.get(0),
                )?)
            })
            .await?;
        Ok(n as u64)
    }

    /// Full-text search across all transcripts.
    pub async fn search_transcripts(&self, query: &str) -> Result<Vec<TranscriptRef>> {
        let query = query.to_string();
        let rows: Vec<(String, String, u32, String)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT t.task_id, t.phase, t.iteration,
                            snippet(transcripts_fts, 0, '[', ']', '…', 12)
                     FROM transcripts_fts
                     JOIN transcripts t ON t.id = transcripts_fts.rowid
                     WHERE transcripts_fts MATCH ?1
                     ORDER BY rank",
                )?;
                let rows = stmt
                    .query_map([&query], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, u32>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for (task_id, phase, iteration, snippet) in rows {
            let task_id = TaskId::parse(&task_id)
                .map_err(|e| StoreError::Constraint(e.to_string()))?;
            out.push(TranscriptRef {
                task_id,
                phase,
                iteration,
                snippet,
            });
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Gate decisions
    // -----------------------------------------------------------------------

    pub async fn append_decision(
        &self,
        task_id: &TaskId,
        record: &GateDecisionRecord,
    ) -> Result<()> {
        let key = task_id.to_string();
        let phase = record.phase.clone();
        let gate_type = enum_to_sql(&record.gate_type);
        let decision = enum_to_sql(&record.decision);
        let approver = record.approver.clone();
        let rationale = record.rationale.clone();
        let questions = serde_json::to_string(&record.questions)?;
        let timestamp = record.timestamp.to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO decisions
                     (task_id, phase, gate_type, decision, approver, rationale, questions, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        key, phase, gate_type, decision, approver, rationale, questions, timestamp
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn list_decisions(&self, task_id: &TaskId) -> Result<Vec<GateDecisionRecord>> {
        let key = task_id.to_string();
        let rows: Vec<(String, String, String, Option<String>, Option<String>, String, String)> =
            self.conn
                .call(move |conn| {
                    let mut stmt = conn.prepare(
                        "SELECT phase, gate_type, decision, approver, rationale, questions, timestamp
                         FROM decisions WHERE task_id = ?1 ORDER BY id",
                    )?;
                    let rows = stmt
                        .query_map([&key], |row| {
                            Ok((
                                row.get(0)?,
                                row.get(1)?,
                                row.get(2)?,
                                row.get(3)?,
                                row.get(4)?,
                                row.get(5)?,
                                row.get(6)?,
                            ))
                        })?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    Ok(rows)
                })
                .await?;

        let mut out = Vec::with_capacity(rows.len());
        for (phase, gate_type, decision, approver, rationale, questions, timestamp) in rows {
            out.push(GateDecisionRecord {
                phase,
                gate_type: serde_json::from_str(&format!("\"{gate_type}\""))?,
                decision: serde_json::from_str(&format!("\"{decision}\""))?,
                approver,
                rationale,
                questions: serde_json::from_str(&questions)?,
                timestamp: timestamp
                    .parse::<DateTime<Utc>>()
                    .unwrap_or_else(|_| Utc::now()),
            });
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Specs / comments
    // -----------------------------------------------------------------------

    pub async fn save_spec(&self, task_id: &TaskId, content: &str) -> Result<()> {
        let key = task_id.to_string();
        let content = content.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO specs (task_id, content, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(task_id) DO UPDATE SET content = ?2, updated_at = ?3",
                    rusqlite::params![key, content, now],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn load_spec(&self, task_id: &TaskId) -> Result<Option<String>> {
        let key = task_id.to_string();
        self.conn
            .call(move |conn| {
                Ok(conn
                    .query_row("SELECT content FROM specs WHERE task_id = ?1", [&key], |r| {
                        r.get(0)
                    })
                    .optional()?)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn add_comment(&self, comment: &TaskComment) -> Result<()> {
        let key = comment.task_id.to_string();
        let author = comment.author.clone();
        let body = comment.body.clone();
        let created_at = comment.created_at.to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO task_comments (task_id, author, body, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![key, author, body, created_at],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn list_comments(&self, task_id: &TaskId) -> Result<Vec<TaskComment>> {
        let key = task_id.to_string();
        let rows: Vec<(String, String, String)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT author, body, created_at FROM task_comments
                     WHERE task_id = ?1 ORDER BY id",
                )?;
                let rows = stmt
                    .query_map([&key], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        Ok(rows
            .into_iter()
            .map(|(author, body, created_at)| TaskComment {
                task_id: task_id.clone(),
                author,
                body,
                created_at: created_at
                    .parse::<DateTime<Utc>>()
                    .unwrap_or_else(|_| Utc::now()),
            })
            .collect())
    }

    /// Most recent transcript content for a task, optionally filtered by
    /// role. Used to build continuation prompts on resume.
    pub async fn last_transcript(
        &self,
        task_id: &TaskId,
        role: Option<TranscriptRole>,
    ) -> Result<Option<String>> {
        let key = task_id.to_string();
        let role = role.map(|r| enum_to_sql(&r));
        self.conn
            .call(move |conn| {
                let content = match role {
                    Some(role) => conn
                        .query_row(
                            "SELECT content FROM transcripts
                             WHERE task_id = ?1 AND role = ?2
                             ORDER BY id DESC LIMIT 1",
                            rusqlite::params![key, role],
                            |r| r.get(0),
                        )
                        .optional()?,
                    None => conn
                        .query_row(
                            "SELECT content FROM transcripts
                             WHERE task_id = ?1 ORDER BY id DESC LIMIT 1",
                            [&key],
                            |r| r.get(0),
                        )
                        .optional()?,
                };
                Ok(content)
            })
            .await
            .map_err(StoreError::from)
    }

    // -----------------------------------------------------------------------
    // Attachments / initiatives
    // -----------------------------------------------------------------------

    pub async fn record_attachment(&self, attachment: &Attachment) -> Result<()> {
        let id = attachment.id.clone();
        let task_id = attachment.task_id.to_string();
        let filename = attachment.filename.clone();
        let content_type = attachment.content_type.clone();
        let size_bytes = attachment.size_bytes.map(|s| s as i64);
        let path = attachment.path.clone();
        let created_at = attachment.created_at.to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO attachments
                     (id, task_id, filename, content_type, size_bytes, path, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        id, task_id, filename, content_type, size_bytes, path, created_at
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn list_attachments(&self, task_id: &TaskId) -> Result<Vec<Attachment>> {
        let key = task_id.to_string();
        let rows: Vec<(String, String, Option<String>, Option<i64>, String, String)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, filename, content_type, size_bytes, path, created_at
                     FROM attachments WHERE task_id = ?1 ORDER BY created_at",
                )?;
                let rows = stmt
                    .query_map([&key], |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                        ))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        Ok(rows
            .into_iter()
            .map(
                |(id, filename, content_type, size_bytes, path, created_at)| Attachment {
                    id,
                    task_id: task_id.clone(),
                    filename,
                    content_type,
                    size_bytes: size_bytes.map(|s| s as u64),
                    path,
                    created_at: created_at
                        .parse::<DateTime<Utc>>()
                        .unwrap_or_else(|_| Utc::now()),
                },
            )
            .collect())
    }

    pub async fn upsert_initiative(&self, initiative: &Initiative) -> Result<()> {
        let id = initiative.id.clone();
        let title = initiative.title.clone();
        let description = initiative.description.clone();
        let data = initiative
            .data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let created_at = initiative.created_at.to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO initiatives (id, title, description, data, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(id) DO UPDATE SET title = ?2, description = ?3, data = ?4",
                    rusqlite::params![id, title, description, data, created_at],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn get_initiative(&self, id: &str) -> Result<Option<Initiative>> {
        let key = id.to_string();
        let row: Option<(String, String, Option<String>, Option<String>, String)> = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT id, title, description, data, created_at
                         FROM initiatives WHERE id = ?1",
                        [&key],
                        |row| {
                            Ok((
                                row.get(0)?,
                                row.get(1)?,
                                row.get(2)?,
                                row.get(3)?,
                                row.get(4)?,
                            ))
                        },
                    )
                    .optional()?)
            })
            .await?;

        row.map(|(id, title, description, data, created_at)| {
            Ok(Initiative {
                id,
                title,
                description,
                data: data.map(|d| serde_json::from_str(&d)).transpose()?,
                created_at: created_at
                    .parse::<DateTime<Utc>>()
                    .unwrap_or_else(|_| Utc::now()),
            })
        })
        .transpose()
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }
}

// ---------------------------------------------------------------------------
// Attachment / Initiative rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub task_id: TaskId,
    pub filename: String,
    pub content_type: Option<String>,
    pub size_bytes: Option<u64>,
    pub path: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Initiative {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

struct TaskRow {
    id: String,
    project_id: String,
    status: String,
    queue: String,
    priority: String,
    weight: String,
    data: String,
    created_at: String,
    updated_at: String,
}

impl TaskRow {
    fn from_task(task: &Task) -> Result<Self> {
        Ok(Self {
            id: task.id.to_string(),
            project_id: task.project_id.clone(),
            status: enum_to_sql(&task.status),
            queue: enum_to_sql(&task.queue),
            priority: enum_to_sql(&task.priority),
            weight: enum_to_sql(&task.weight),
            data: serde_json::to_string(task)?,
            created_at: task.created_at.to_rfc3339(),
            updated_at: task.updated_at.to_rfc3339(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use orc_core::types::TaskWeight;

    fn task(n: u32) -> Task {
        Task::new(TaskId::new(n), "proj", format!("task {n}"), TaskWeight::Small)
    }

    #[tokio::test]
    async fn create_load_roundtrip() {
        let store = Store::open_in_memory().await.unwrap();
        let t = task(1);
        store.create_task(&t).await.unwrap();
        let back = store.load_task(&t.id).await.unwrap();
        assert_eq!(back.title, "task 1");
        assert_eq!(back.status, TaskStatus::Planned);
    }

    #[tokio::test]
    async fn create_twice_is_already_exists() {
        let store = Store::open_in_memory().await.unwrap();
        let t = task(1);
        store.create_task(&t).await.unwrap();
        let err = store.create_task(&t).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn load_missing_is_not_found() {
        let store = Store::open_in_memory().await.unwrap();
        let err = store.load_task(&TaskId::new(99)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn save_identical_does_not_touch_row() {
        let store = Store::open_in_memory().await.unwrap();
        let t = task(1);
        store.create_task(&t).await.unwrap();

        // Same content: the stored row (including updated_at inside data)
        // must be byte-identical afterwards.
        store.save_task(&t).await.unwrap();
        let back = store.load_task(&t.id).await.unwrap();
        assert_eq!(back.updated_at, t.updated_at);
    }

    #[tokio::test]
    async fn blocked_by_cycle_rejected() {
        let store = Store::open_in_memory().await.unwrap();
        let mut a = task(1);
        let mut b = task(2);
        a.blocked_by = vec![b.id.clone()];
        store.create_task(&a).await.unwrap();
        store.create_task(&b).await.unwrap();

        b.blocked_by = vec![a.id.clone()];
        let err = store.save_task(&b).await.unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
    }

    #[tokio::test]
    async fn list_tasks_filters() {
        let store = Store::open_in_memory().await.unwrap();
        let mut a = task(1);
        a.queue = TaskQueue::Backlog;
        let b = task(2);
        store.create_task(&a).await.unwrap();
        store.create_task(&b).await.unwrap();

        let backlog = store
            .list_tasks(&TaskFilter {
                queue: Some(TaskQueue::Backlog),
                ..TaskFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].id, a.id);
    }

    #[tokio::test]
    async fn phase_state_upsert_roundtrip() {
        let store = Store::open_in_memory().await.unwrap();
        let t = task(1);
        store.create_task(&t).await.unwrap();

        let mut ps = PhaseState::new("implement");
        ps.start();
        store.save_phase_state(&t.id, &ps).await.unwrap();
        ps.iterations = 2;
        store.save_phase_state(&t.id, &ps).await.unwrap();

        let states = store.load_phase_states(&t.id).await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states["implement"].iterations, 2);
    }

    #[tokio::test]
    async fn transcript_append_and_search() {
        let store = Store::open_in_memory().await.unwrap();
        let t = task(1);
        store.create_task(&t).await.unwrap();

        let rec = TranscriptRecord {
            task_id: t.id.clone(),
            phase: "implement".into(),
            iteration: 1,
            role: TranscriptRole::Assistant,
            content: "refactored the widget frobnicator for clarity".into(),
            timestamp: Utc::now(),
        };
        store.append_transcript(&rec).await.unwrap();
        assert_eq!(store.count_transcripts(&t.id).await.unwrap(), 1);

        let hits = store.search_transcripts("frobnicator").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].task_id, t.id);
        assert_eq!(hits[0].phase, "implement");
        assert!(hits[0].snippet.contains("frobnicator"));

        assert!(store.search_transcripts("nonexistent").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn decisions_are_appended_in_order() {
        use orc_core::types::{GateOutcome, GateType};

        let store = Store::open_in_memory().await.unwrap();
        let t = task(1);
        store.create_task(&t).await.unwrap();

        let d1 = GateDecisionRecord::new("implement", GateType::Auto, GateOutcome::Approved);
        let mut d2 = GateDecisionRecord::new("test", GateType::Human, GateOutcome::Rejected);
        d2.rationale = Some("rollback".into());
        store.append_decision(&t.id, &d1).await.unwrap();
        store.append_decision(&t.id, &d2).await.unwrap();

        let list = store.list_decisions(&t.id).await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].phase, "implement");
        assert_eq!(list[1].decision, GateOutcome::Rejected);
        assert_eq!(list[1].rationale.as_deref(), Some("rollback"));
    }

    #[tokio::test]
    async fn execution_state_roundtrip() {
        let store = Store::open_in_memory().await.unwrap();
        let t = task(1);
        store.create_task(&t).await.unwrap();

        let mut state = ExecutionState::new(1234, "devbox");
        state.session.id = Some("sess-opaque-1".into());
        store.save_execution_state(&t.id, &state).await.unwrap();

        let back = store.load_execution_state(&t.id).await.unwrap().unwrap();
        assert_eq!(back.pid, 1234);
        assert_eq!(back.session.id.as_deref(), Some("sess-opaque-1"));

        store.clear_execution_state(&t.id).await.unwrap();
        assert!(store.load_execution_state(&t.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn plan_roundtrip() {
        use orc_core::plan::{PhaseSpec, Plan};

        let store = Store::open_in_memory().await.unwrap();
        let t = task(1);
        store.create_task(&t).await.unwrap();

        let plan = Plan::new(vec![PhaseSpec::new("implement"), PhaseSpec::new("test")]);
        store.save_plan(&t.id, &plan).await.unwrap();
        let back = store.load_plan(&t.id).await.unwrap();
        assert_eq!(back, plan);
    }

    #[tokio::test]
    async fn last_transcript_by_role() {
        let store = Store::open_in_memory().await.unwrap();
        let t = task(1);
        store.create_task(&t).await.unwrap();

        for (role, content) in [
            (TranscriptRole::User, "prompt"),
            (TranscriptRole::Assistant, "first answer"),
            (TranscriptRole::Assistant, "second answer"),
        ] {
            store
                .append_transcript(&TranscriptRecord {
                    task_id: t.id.clone(),
                    phase: "implement".into(),
                    iteration: 1,
                    role,
                    content: content.into(),
                    timestamp: Utc::now(),
                })
                .await
                .unwrap();
        }

        let last = store
            .last_transcript(&t.id, Some(TranscriptRole::Assistant))
            .await
            .unwrap();
        assert_eq!(last.as_deref(), Some("second answer"));
        assert!(store
            .last_transcript(&TaskId::new(9), None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn comments_roundtrip_in_order() {
        let store = Store::open_in_memory().await.unwrap();
        let t = task(1);
        store.create_task(&t).await.unwrap();

        for body in ["first", "second"] {
            store
                .add_comment(&TaskComment {
                    task_id: t.id.clone(),
                    author: "reviewer".into(),
                    body: body.into(),
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let comments = store.list_comments(&t.id).await.unwrap();
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].body, "first");
        assert_eq!(comments[1].author, "reviewer");
    }

    #[tokio::test]
    async fn attachments_and_initiatives_roundtrip() {
        let store = Store::open_in_memory().await.unwrap();
        let t = task(1);
        store.create_task(&t).await.unwrap();

        store
            .record_attachment(&Attachment {
                id: "att-1".into(),
                task_id: t.id.clone(),
                filename: "screenshot.png".into(),
                content_type: Some("image/png".into()),
                size_bytes: Some(1024),
                path: "attachments/screenshot.png".into(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let attachments = store.list_attachments(&t.id).await.unwrap();
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].filename, "screenshot.png");

        store
            .upsert_initiative(&Initiative {
                id: "init-1".into(),
                title: "q3 platform work".into(),
                description: None,
                data: Some(serde_json::json!({"tasks": 4})),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let initiative = store.get_initiative("init-1").await.unwrap().unwrap();
        assert_eq!(initiative.title, "q3 platform work");
        assert_eq!(initiative.data.unwrap()["tasks"], 4);
        assert!(store.get_initiative("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn schema_mismatch_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orc.db");

        {
            let store = Store::open(&path).await.unwrap();
            store
                .conn
                .call(|conn| {
                    conn.execute("UPDATE schema_meta SET version = 99", [])?;
                    Ok(())
                })
                .await
                .unwrap();
        }

        let err = Store::open(&path).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::SchemaMismatch {
                found: 99,
                expected: SCHEMA_VERSION
            }
        ));
    }
}

use super::{AgentRun, AgentRunRepository, Feature, FeatureRepository};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::gates::InterruptPayload;
use crate::orchestrator::graph::GraphPosition;
use crate::orchestrator::state::RunState;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Arc;

/// Async-safe handle to the flow database.
///
/// All access runs on tokio's blocking pool via `spawn_blocking`, so
/// synchronous SQLite I/O never ties up async worker threads.
#[derive(Clone)]
pub struct SqliteHandle {
    inner: Arc<std::sync::Mutex<SqliteStore>>,
}

impl SqliteHandle {
    pub fn new(store: SqliteStore) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    /// Run `f` against the database on a blocking thread.
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&SqliteStore) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = store.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

/// Features, agent runs and checkpoints in one SQLite database.
///
/// Records are stored as JSON documents next to the columns the queries
/// filter on. Checkpoints are insert-only.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS features (
                    id TEXT PRIMARY KEY,
                    repository_path TEXT NOT NULL,
                    lifecycle TEXT NOT NULL,
                    data TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS agent_runs (
                    id TEXT PRIMARY KEY,
                    feature_id TEXT NOT NULL,
                    status TEXT NOT NULL,
                    data TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS checkpoints (
                    run_id TEXT NOT NULL,
                    seq INTEGER NOT NULL,
                    position TEXT NOT NULL,
                    state TEXT NOT NULL,
                    interrupt TEXT,
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (run_id, seq)
                );

                CREATE INDEX IF NOT EXISTS idx_agent_runs_feature ON agent_runs(feature_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    pub fn upsert_feature(&self, feature: &Feature) -> Result<()> {
        let data = serde_json::to_string(feature).context("Failed to serialize feature")?;
        self.conn
            .execute(
                "INSERT INTO features (id, repository_path, lifecycle, data, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    repository_path = excluded.repository_path,
                    lifecycle = excluded.lifecycle,
                    data = excluded.data,
                    updated_at = excluded.updated_at",
                params![
                    feature.id,
                    feature.repository_path.to_string_lossy(),
                    feature.lifecycle.as_str(),
                    data,
                    feature.updated_at.to_rfc3339(),
                ],
            )
            .context("Failed to upsert feature")?;
        Ok(())
    }

    pub fn get_feature(&self, id: &str) -> Result<Option<Feature>> {
        let data: Option<String> = self
            .conn
            .query_row("SELECT data FROM features WHERE id = ?1", params![id], |row| row.get(0))
            .optional()
            .context("Failed to query feature")?;
        data.map(|d| serde_json::from_str(&d).context("Failed to decode feature"))
            .transpose()
    }

    pub fn list_features(&self) -> Result<Vec<Feature>> {
        self.list_json("SELECT data FROM features ORDER BY id")
    }

    pub fn upsert_run(&self, run: &AgentRun) -> Result<()> {
        let data = serde_json::to_string(run).context("Failed to serialize agent run")?;
        self.conn
            .execute(
                "INSERT INTO agent_runs (id, feature_id, status, data, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    data = excluded.data,
                    updated_at = excluded.updated_at",
                params![
                    run.id,
                    run.feature_id,
                    run.status.as_str(),
                    data,
                    run.updated_at.to_rfc3339(),
                ],
            )
            .context("Failed to upsert agent run")?;
        Ok(())
    }

    pub fn get_run(&self, id: &str) -> Result<Option<AgentRun>> {
        let data: Option<String> = self
            .conn
            .query_row("SELECT data FROM agent_runs WHERE id = ?1", params![id], |row| row.get(0))
            .optional()
            .context("Failed to query agent run")?;
        data.map(|d| serde_json::from_str(&d).context("Failed to decode agent run"))
            .transpose()
    }

    pub fn list_runs(&self) -> Result<Vec<AgentRun>> {
        self.list_json("SELECT data FROM agent_runs ORDER BY id")
    }

    fn list_json<T: serde::de::DeserializeOwned>(&self, sql: &str) -> Result<Vec<T>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare list query")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("Failed to run list query")?;
        let mut out = Vec::new();
        for row in rows {
            let data = row.context("Failed to read row")?;
            out.push(serde_json::from_str(&data).context("Failed to decode row")?);
        }
        Ok(out)
    }

    pub fn append_checkpoint(
        &self,
        run_id: &str,
        position: GraphPosition,
        state: &RunState,
        interrupt: Option<&InterruptPayload>,
    ) -> Result<Checkpoint> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin checkpoint transaction")?;
        let next_seq: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM checkpoints WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .context("Failed to read checkpoint sequence")?;

        let checkpoint = Checkpoint {
            run_id: run_id.to_string(),
            seq: next_seq as u64,
            position,
            state: state.clone(),
            interrupt: interrupt.cloned(),
            created_at: Utc::now(),
        };
        let interrupt_json = checkpoint
            .interrupt
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize interrupt payload")?;
        tx.execute(
            "INSERT INTO checkpoints (run_id, seq, position, state, interrupt, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run_id,
                next_seq,
                serde_json::to_string(&checkpoint.position).context("Failed to serialize position")?,
                serde_json::to_string(&checkpoint.state).context("Failed to serialize run state")?,
                interrupt_json,
                checkpoint.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert checkpoint")?;
        tx.commit().context("Failed to commit checkpoint")?;
        Ok(checkpoint)
    }

    pub fn checkpoints(&self, run_id: &str, latest_only: bool) -> Result<Vec<Checkpoint>> {
        let sql = if latest_only {
            "SELECT seq, position, state, interrupt, created_at FROM checkpoints
             WHERE run_id = ?1 ORDER BY seq DESC LIMIT 1"
        } else {
            "SELECT seq, position, state, interrupt, created_at FROM checkpoints
             WHERE run_id = ?1 ORDER BY seq ASC"
        };
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare checkpoint query")?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .context("Failed to query checkpoints")?;

        let mut out = Vec::new();
        for row in rows {
            let (seq, position, state, interrupt, created_at) = row.context("Failed to read checkpoint row")?;
            out.push(Checkpoint {
                run_id: run_id.to_string(),
                seq: seq as u64,
                position: serde_json::from_str(&position).context("Failed to decode position")?,
                state: serde_json::from_str(&state).context("Failed to decode run state")?,
                interrupt: interrupt
                    .map(|i| serde_json::from_str(&i))
                    .transpose()
                    .context("Failed to decode interrupt payload")?,
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .context("Failed to parse checkpoint timestamp")?
                    .with_timezone(&Utc),
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl FeatureRepository for SqliteHandle {
    async fn find_by_id(&self, id: &str) -> Result<Option<Feature>> {
        let id = id.to_string();
        self.call(move |db| db.get_feature(&id)).await
    }

    async fn update(&self, feature: &Feature) -> Result<()> {
        let feature = feature.clone();
        self.call(move |db| db.upsert_feature(&feature)).await
    }

    async fn list(&self) -> Result<Vec<Feature>> {
        self.call(|db| db.list_features()).await
    }
}

#[async_trait]
impl AgentRunRepository for SqliteHandle {
    async fn find_by_id(&self, id: &str) -> Result<Option<AgentRun>> {
        let id = id.to_string();
        self.call(move |db| db.get_run(&id)).await
    }

    async fn upsert(&self, run: &AgentRun) -> Result<()> {
        let run = run.clone();
        self.call(move |db| db.upsert_run(&run)).await
    }

    async fn list(&self) -> Result<Vec<AgentRun>> {
        self.call(|db| db.list_runs()).await
    }
}

#[async_trait]
impl CheckpointStore for SqliteHandle {
    async fn append(
        &self,
        run_id: &str,
        position: GraphPosition,
        state: &RunState,
        interrupt: Option<&InterruptPayload>,
    ) -> Result<Checkpoint> {
        let run_id = run_id.to_string();
        let state = state.clone();
        let interrupt = interrupt.cloned();
        self.call(move |db| db.append_checkpoint(&run_id, position, &state, interrupt.as_ref()))
            .await
    }

    async fn latest(&self, run_id: &str) -> Result<Option<Checkpoint>> {
        let run_id = run_id.to_string();
        let mut found = self.call(move |db| db.checkpoints(&run_id, true)).await?;
        Ok(found.pop())
    }

    async fn history(&self, run_id: &str) -> Result<Vec<Checkpoint>> {
        let run_id = run_id.to_string();
        self.call(move |db| db.checkpoints(&run_id, false)).await
    }
}

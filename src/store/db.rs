use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use super::models::*;

/// Async-safe handle to the orchestrator database.
///
/// Wraps `Db` behind `Arc<Mutex>` and runs all access on tokio's blocking
/// thread pool via `spawn_blocking`, preventing synchronous SQLite I/O from
/// tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<Db>>,
}

impl DbHandle {
    pub fn new(db: Db) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Db) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct Db {
    conn: Connection,
}

impl Db {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS releases (
                    id TEXT PRIMARY KEY,
                    tenant TEXT NOT NULL,
                    version TEXT NOT NULL,
                    phase TEXT NOT NULL DEFAULT 'not_started',
                    platforms TEXT NOT NULL,
                    kickoff_at TEXT NOT NULL,
                    target_release_at TEXT NOT NULL,
                    branch TEXT NOT NULL,
                    upload_modes TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS stage_statuses (
                    release_id TEXT NOT NULL REFERENCES releases(id) ON DELETE CASCADE,
                    stage TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    auto_advance INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (release_id, stage)
                );

                CREATE TABLE IF NOT EXISTS regression_slots (
                    release_id TEXT NOT NULL REFERENCES releases(id) ON DELETE CASCADE,
                    slot_index INTEGER NOT NULL,
                    scheduled_at TEXT NOT NULL,
                    PRIMARY KEY (release_id, slot_index)
                );

                CREATE TABLE IF NOT EXISTS regression_cycles (
                    id TEXT PRIMARY KEY,
                    release_id TEXT NOT NULL REFERENCES releases(id) ON DELETE CASCADE,
                    slot_index INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    tag TEXT,
                    completed_at TEXT,
                    created_at TEXT NOT NULL,
                    UNIQUE (release_id, slot_index)
                );

                CREATE TABLE IF NOT EXISTS tasks (
                    id TEXT PRIMARY KEY,
                    release_id TEXT NOT NULL REFERENCES releases(id) ON DELETE CASCADE,
                    stage TEXT NOT NULL,
                    cycle_id TEXT REFERENCES regression_cycles(id),
                    kind TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    platforms TEXT NOT NULL DEFAULT '[]',
                    platform_shares TEXT NOT NULL DEFAULT '{}',
                    output TEXT,
                    error TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS build_artifacts (
                    id TEXT PRIMARY KEY,
                    release_id TEXT NOT NULL REFERENCES releases(id) ON DELETE CASCADE,
                    platform TEXT NOT NULL,
                    stage TEXT NOT NULL,
                    locator TEXT,
                    source TEXT NOT NULL,
                    consumed INTEGER NOT NULL DEFAULT 0,
                    consumed_by_task TEXT REFERENCES tasks(id),
                    cycle_id TEXT REFERENCES regression_cycles(id),
                    created_at TEXT NOT NULL,
                    consumed_at TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_tasks_scope
                    ON tasks(release_id, stage, cycle_id);
                CREATE INDEX IF NOT EXISTS idx_cycles_release
                    ON regression_cycles(release_id);
                CREATE INDEX IF NOT EXISTS idx_artifacts_staged
                    ON build_artifacts(release_id, stage, consumed);
                CREATE UNIQUE INDEX IF NOT EXISTS idx_artifacts_staged_key
                    ON build_artifacts(release_id, platform, stage)
                    WHERE consumed = 0;
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Releases ──────────────────────────────────────────────────────

    /// Insert a release together with its stage-status rows and regression
    /// slots, as one transaction.
    pub fn create_release(&self, new: &NewRelease) -> Result<Release> {
        let id = Uuid::new_v4();
        let branch = new
            .branch
            .clone()
            .unwrap_or_else(|| format!("release/{}", new.version));
        let now = now_str();

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO releases
                 (id, tenant, version, phase, platforms, kickoff_at,
                  target_release_at, branch, upload_modes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                id.to_string(),
                new.tenant,
                new.version,
                ReleasePhase::NotStarted.as_str(),
                to_json(&new.platforms)?,
                new.kickoff_at.to_rfc3339(),
                new.target_release_at.to_rfc3339(),
                branch,
                to_json(&new.upload_modes)?,
                now,
            ],
        )
        .context("Failed to insert release")?;

        for stage in Stage::all() {
            tx.execute(
                "INSERT INTO stage_statuses (release_id, stage, status, auto_advance)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    id.to_string(),
                    stage.as_str(),
                    StageState::Pending.as_str(),
                    new.auto_advance.contains(&stage),
                ],
            )
            .context("Failed to insert stage status")?;
        }

        let mut slots = new.regression_slots.clone();
        slots.sort();
        for (index, at) in slots.iter().enumerate() {
            tx.execute(
                "INSERT INTO regression_slots (release_id, slot_index, scheduled_at)
                 VALUES (?1, ?2, ?3)",
                params![id.to_string(), index as i64, at.to_rfc3339()],
            )
            .context("Failed to insert regression slot")?;
        }

        tx.commit().context("Failed to commit release creation")?;
        self.get_release(id)?
            .context("Release not found after insert")
    }

    pub fn get_release(&self, id: Uuid) -> Result<Option<Release>> {
        let raw = self
            .conn
            .query_row(
                "SELECT id, tenant, version, phase, platforms, kickoff_at,
                        target_release_at, branch, upload_modes, created_at
                 FROM releases WHERE id = ?1",
                params![id.to_string()],
                raw_release,
            )
            .optional()
            .context("Failed to query release")?;
        raw.map(release_from_raw).transpose()
    }

    pub fn list_releases(&self) -> Result<Vec<Release>> {
        self.query_releases("SELECT id, tenant, version, phase, platforms, kickoff_at,
                        target_release_at, branch, upload_modes, created_at
                 FROM releases ORDER BY created_at, id")
    }

    /// Releases the scheduling loop still needs to evaluate.
    pub fn list_active_releases(&self) -> Result<Vec<Release>> {
        self.query_releases(
            "SELECT id, tenant, version, phase, platforms, kickoff_at,
                    target_release_at, branch, upload_modes, created_at
             FROM releases WHERE phase != 'released' ORDER BY created_at, id",
        )
    }

    fn query_releases(&self, sql: &str) -> Result<Vec<Release>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare release query")?;
        let rows = stmt
            .query_map([], raw_release)
            .context("Failed to query releases")?;
        let mut releases = Vec::new();
        for row in rows {
            releases.push(release_from_raw(row.context("Failed to read release row")?)?);
        }
        Ok(releases)
    }

    /// Move a release's phase forward. The phase order is fixed and the
    /// engine never moves a release backwards; a non-advancing update is an
    /// internal error.
    pub fn advance_phase(&self, id: Uuid, to: ReleasePhase) -> Result<()> {
        let current = self
            .get_release(id)?
            .with_context(|| format!("Release {} not found", id))?
            .phase;
        if to <= current {
            anyhow::bail!("Refusing phase change {} -> {} for release {}", current, to, id);
        }
        self.conn
            .execute(
                "UPDATE releases SET phase = ?1 WHERE id = ?2",
                params![to.as_str(), id.to_string()],
            )
            .context("Failed to update release phase")?;
        Ok(())
    }

    // ── Stage statuses ────────────────────────────────────────────────

    pub fn stage_statuses(&self, release_id: Uuid) -> Result<Vec<StageStatus>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT release_id, stage, status, auto_advance
                 FROM stage_statuses WHERE release_id = ?1",
            )
            .context("Failed to prepare stage_statuses")?;
        let rows = stmt
            .query_map(params![release_id.to_string()], raw_stage_status)
            .context("Failed to query stage statuses")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(stage_status_from_raw(row.context("Failed to read stage status row")?)?);
        }
        // Fixed presentation order rather than insertion order.
        out.sort_by_key(|s| s.stage);
        Ok(out)
    }

    pub fn stage_status(&self, release_id: Uuid, stage: Stage) -> Result<Option<StageStatus>> {
        let raw = self
            .conn
            .query_row(
                "SELECT release_id, stage, status, auto_advance
                 FROM stage_statuses WHERE release_id = ?1 AND stage = ?2",
                params![release_id.to_string(), stage.as_str()],
                raw_stage_status,
            )
            .optional()
            .context("Failed to query stage status")?;
        raw.map(stage_status_from_raw).transpose()
    }

    pub fn set_stage_state(&self, release_id: Uuid, stage: Stage, state: StageState) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE stage_statuses SET status = ?1 WHERE release_id = ?2 AND stage = ?3",
                params![state.as_str(), release_id.to_string(), stage.as_str()],
            )
            .context("Failed to update stage status")?;
        if changed == 0 {
            anyhow::bail!("No stage status row for release {} stage {}", release_id, stage);
        }
        Ok(())
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    pub fn insert_tasks(&self, tasks: &[NewTask]) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        for task in tasks {
            insert_task(&tx, task)?;
        }
        tx.commit().context("Failed to commit task insert")?;
        Ok(())
    }

    pub fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        let raw = self
            .conn
            .query_row(
                &format!("{} WHERE id = ?1", SELECT_TASK),
                params![id.to_string()],
                raw_task,
            )
            .optional()
            .context("Failed to query task")?;
        raw.map(task_from_raw).transpose()
    }

    /// Tasks belonging to one stage scope: stage-level tasks when
    /// `cycle_id` is `None`, one cycle's tasks otherwise.
    pub fn tasks_in_scope(
        &self,
        release_id: Uuid,
        stage: Stage,
        cycle_id: Option<Uuid>,
    ) -> Result<Vec<Task>> {
        let mut out = Vec::new();
        match cycle_id {
            Some(cid) => {
                let sql = format!(
                    "{} WHERE release_id = ?1 AND stage = ?2 AND cycle_id = ?3 ORDER BY created_at, id",
                    SELECT_TASK
                );
                let mut stmt = self.conn.prepare(&sql).context("Failed to prepare task query")?;
                let rows = stmt
                    .query_map(
                        params![release_id.to_string(), stage.as_str(), cid.to_string()],
                        raw_task,
                    )
                    .context("Failed to query tasks")?;
                for row in rows {
                    out.push(task_from_raw(row.context("Failed to read task row")?)?);
                }
            }
            None => {
                let sql = format!(
                    "{} WHERE release_id = ?1 AND stage = ?2 AND cycle_id IS NULL ORDER BY created_at, id",
                    SELECT_TASK
                );
                let mut stmt = self.conn.prepare(&sql).context("Failed to prepare task query")?;
                let rows = stmt
                    .query_map(params![release_id.to_string(), stage.as_str()], raw_task)
                    .context("Failed to query tasks")?;
                for row in rows {
                    out.push(task_from_raw(row.context("Failed to read task row")?)?);
                }
            }
        }
        Ok(out)
    }

    pub fn tasks_for_release(&self, release_id: Uuid) -> Result<Vec<Task>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{} WHERE release_id = ?1 ORDER BY created_at, id",
                SELECT_TASK
            ))
            .context("Failed to prepare task query")?;
        let rows = stmt
            .query_map(params![release_id.to_string()], raw_task)
            .context("Failed to query tasks")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(task_from_raw(row.context("Failed to read task row")?)?);
        }
        Ok(out)
    }

    pub fn set_task_status(&self, id: Uuid, status: TaskStatus) -> Result<()> {
        self.touch_task(
            id,
            "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now_str(), id.to_string()],
        )
    }

    pub fn complete_task(&self, id: Uuid, output: &TaskOutput) -> Result<()> {
        self.touch_task(
            id,
            "UPDATE tasks SET status = 'completed', output = ?1, error = NULL, updated_at = ?2
             WHERE id = ?3",
            params![to_json(output)?, now_str(), id.to_string()],
        )
    }

    pub fn fail_task(&self, id: Uuid, reason: &str) -> Result<()> {
        self.touch_task(
            id,
            "UPDATE tasks SET status = 'failed', error = ?1, updated_at = ?2 WHERE id = ?3",
            params![reason, now_str(), id.to_string()],
        )
    }

    /// Record one platform's callback share on a task.
    pub fn record_platform_share(
        &self,
        id: Uuid,
        platform: Platform,
        share: &PlatformShare,
    ) -> Result<()> {
        let json: String = self
            .conn
            .query_row(
                "SELECT platform_shares FROM tasks WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .with_context(|| format!("Task {} not found", id))?;
        let mut shares: BTreeMap<Platform, PlatformShare> = from_json(&json)?;
        shares.insert(platform, share.clone());
        self.touch_task(
            id,
            "UPDATE tasks SET platform_shares = ?1, updated_at = ?2 WHERE id = ?3",
            params![to_json(&shares)?, now_str(), id.to_string()],
        )
    }

    /// Reset a failed task so the next tick redispatches it.
    pub fn reset_task_for_retry(&self, id: Uuid) -> Result<()> {
        self.touch_task(
            id,
            "UPDATE tasks SET status = 'pending', error = NULL, output = NULL,
                    platform_shares = '{}', updated_at = ?1
             WHERE id = ?2",
            params![now_str(), id.to_string()],
        )
    }

    pub fn skip_task(&self, id: Uuid) -> Result<()> {
        self.touch_task(
            id,
            "UPDATE tasks SET status = 'skipped', updated_at = ?1 WHERE id = ?2",
            params![now_str(), id.to_string()],
        )
    }

    fn touch_task(&self, id: Uuid, sql: &str, params: impl rusqlite::Params) -> Result<()> {
        let changed = self.conn.execute(sql, params).context("Failed to update task")?;
        if changed == 0 {
            anyhow::bail!("Task {} not found", id);
        }
        Ok(())
    }

    // ── Regression slots & cycles ─────────────────────────────────────

    pub fn slots_for_release(&self, release_id: Uuid) -> Result<Vec<RegressionSlot>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT release_id, slot_index, scheduled_at FROM regression_slots
                 WHERE release_id = ?1 ORDER BY slot_index",
            )
            .context("Failed to prepare slot query")?;
        let rows = stmt
            .query_map(params![release_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .context("Failed to query slots")?;
        let mut out = Vec::new();
        for row in rows {
            let (rid, index, at) = row.context("Failed to read slot row")?;
            out.push(RegressionSlot {
                release_id: parse_uuid(&rid)?,
                index,
                scheduled_at: parse_ts(&at)?,
            });
        }
        Ok(out)
    }

    /// Append an ad hoc slot after the currently configured ones.
    pub fn append_slot(&self, release_id: Uuid, scheduled_at: DateTime<Utc>) -> Result<RegressionSlot> {
        let next: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(slot_index) + 1, 0) FROM regression_slots WHERE release_id = ?1",
                params![release_id.to_string()],
                |row| row.get(0),
            )
            .context("Failed to compute next slot index")?;
        self.conn
            .execute(
                "INSERT INTO regression_slots (release_id, slot_index, scheduled_at)
                 VALUES (?1, ?2, ?3)",
                params![release_id.to_string(), next, scheduled_at.to_rfc3339()],
            )
            .context("Failed to insert slot")?;
        Ok(RegressionSlot {
            release_id,
            index: next,
            scheduled_at,
        })
    }

    pub fn cycles_for_release(&self, release_id: Uuid) -> Result<Vec<RegressionCycle>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{} WHERE release_id = ?1 ORDER BY slot_index",
                SELECT_CYCLE
            ))
            .context("Failed to prepare cycle query")?;
        let rows = stmt
            .query_map(params![release_id.to_string()], raw_cycle)
            .context("Failed to query cycles")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(cycle_from_raw(row.context("Failed to read cycle row")?)?);
        }
        Ok(out)
    }

    pub fn in_progress_cycle(&self, release_id: Uuid) -> Result<Option<RegressionCycle>> {
        let raw = self
            .conn
            .query_row(
                &format!(
                    "{} WHERE release_id = ?1 AND status = 'in_progress'",
                    SELECT_CYCLE
                ),
                params![release_id.to_string()],
                raw_cycle,
            )
            .optional()
            .context("Failed to query in-progress cycle")?;
        raw.map(cycle_from_raw).transpose()
    }

    pub fn get_cycle(&self, id: Uuid) -> Result<Option<RegressionCycle>> {
        let raw = self
            .conn
            .query_row(
                &format!("{} WHERE id = ?1", SELECT_CYCLE),
                params![id.to_string()],
                raw_cycle,
            )
            .optional()
            .context("Failed to query cycle")?;
        raw.map(cycle_from_raw).transpose()
    }

    pub fn complete_cycle(&self, id: Uuid) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE regression_cycles SET status = 'done', completed_at = ?1
                 WHERE id = ?2 AND status = 'in_progress'",
                params![now_str(), id.to_string()],
            )
            .context("Failed to complete cycle")?;
        if changed == 0 {
            anyhow::bail!("Cycle {} is not in progress", id);
        }
        Ok(())
    }

    /// Abandon an in-progress cycle and skip its unfinished tasks, as one
    /// transaction.
    pub fn abandon_cycle(&self, id: Uuid) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let changed = tx
            .execute(
                "UPDATE regression_cycles SET status = 'abandoned', completed_at = ?1
                 WHERE id = ?2 AND status = 'in_progress'",
                params![now_str(), id.to_string()],
            )
            .context("Failed to abandon cycle")?;
        if changed == 0 {
            anyhow::bail!("Cycle {} is not in progress", id);
        }
        tx.execute(
            "UPDATE tasks SET status = 'skipped', updated_at = ?1
             WHERE cycle_id = ?2 AND status NOT IN ('completed', 'failed', 'skipped')",
            params![now_str(), id.to_string()],
        )
        .context("Failed to skip cycle tasks")?;
        tx.commit().context("Failed to commit cycle abandonment")?;
        Ok(())
    }

    /// Record the cycle's cut tag. The tag is immutable: a second write is
    /// silently a no-op.
    pub fn set_cycle_tag(&self, id: Uuid, tag: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE regression_cycles SET tag = ?1 WHERE id = ?2 AND tag IS NULL",
                params![tag, id.to_string()],
            )
            .context("Failed to set cycle tag")?;
        Ok(())
    }

    /// Atomically start a regression cycle: insert the cycle row, consume
    /// the staged artifacts (binding them to the cycle and its build task),
    /// and create the cycle's tasks.
    ///
    /// Returns `None` without side effects when any artifact was already
    /// consumed by a concurrent evaluation.
    pub fn start_cycle(
        &self,
        release_id: Uuid,
        slot_index: i64,
        cycle_id: Uuid,
        artifact_ids: &[Uuid],
        consumed_by_task: Uuid,
        tasks: &[NewTask],
    ) -> Result<Option<RegressionCycle>> {
        let now = now_str();
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO regression_cycles (id, release_id, slot_index, status, created_at)
             VALUES (?1, ?2, ?3, 'in_progress', ?4)",
            params![cycle_id.to_string(), release_id.to_string(), slot_index, now],
        )
        .context("Failed to insert cycle")?;

        for task in tasks {
            insert_task(&tx, task)?;
        }

        for artifact_id in artifact_ids {
            let changed = tx
                .execute(
                    "UPDATE build_artifacts
                     SET consumed = 1, consumed_by_task = ?1, cycle_id = ?2, consumed_at = ?3
                     WHERE id = ?4 AND consumed = 0",
                    params![
                        consumed_by_task.to_string(),
                        cycle_id.to_string(),
                        now,
                        artifact_id.to_string()
                    ],
                )
                .context("Failed to consume artifact")?;
            if changed != 1 {
                tx.rollback().context("Failed to roll back cycle start")?;
                return Ok(None);
            }
        }

        tx.commit().context("Failed to commit cycle start")?;
        self.get_cycle(cycle_id)
    }

    // ── Build artifacts ───────────────────────────────────────────────

    /// Stage an artifact, replacing any unconsumed artifact already staged
    /// for the same (release, platform, stage) key.
    pub fn stage_artifact(
        &self,
        release_id: Uuid,
        platform: Platform,
        stage: Stage,
        locator: Option<&str>,
        source: BuildSource,
    ) -> Result<BuildArtifact> {
        let id = Uuid::new_v4();
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "DELETE FROM build_artifacts
             WHERE release_id = ?1 AND platform = ?2 AND stage = ?3 AND consumed = 0",
            params![release_id.to_string(), platform.as_str(), stage.as_str()],
        )
        .context("Failed to replace staged artifact")?;
        tx.execute(
            "INSERT INTO build_artifacts
                 (id, release_id, platform, stage, locator, source, consumed, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
            params![
                id.to_string(),
                release_id.to_string(),
                platform.as_str(),
                stage.as_str(),
                locator,
                source.as_str(),
                now_str(),
            ],
        )
        .context("Failed to insert artifact")?;
        tx.commit().context("Failed to commit artifact staging")?;
        self.get_artifact(id)?
            .context("Artifact not found after insert")
    }

    pub fn get_artifact(&self, id: Uuid) -> Result<Option<BuildArtifact>> {
        let raw = self
            .conn
            .query_row(
                &format!("{} WHERE id = ?1", SELECT_ARTIFACT),
                params![id.to_string()],
                raw_artifact,
            )
            .optional()
            .context("Failed to query artifact")?;
        raw.map(artifact_from_raw).transpose()
    }

    /// Unconsumed artifacts staged for a release stage — the "uploaded but
    /// not yet used" view.
    pub fn list_staged(&self, release_id: Uuid, stage: Stage) -> Result<Vec<BuildArtifact>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{} WHERE release_id = ?1 AND stage = ?2 AND consumed = 0 ORDER BY platform",
                SELECT_ARTIFACT
            ))
            .context("Failed to prepare staged query")?;
        let rows = stmt
            .query_map(params![release_id.to_string(), stage.as_str()], raw_artifact)
            .context("Failed to query staged artifacts")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(artifact_from_raw(row.context("Failed to read artifact row")?)?);
        }
        Ok(out)
    }

    pub fn artifacts_for_release(&self, release_id: Uuid) -> Result<Vec<BuildArtifact>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{} WHERE release_id = ?1 ORDER BY created_at, id",
                SELECT_ARTIFACT
            ))
            .context("Failed to prepare artifact query")?;
        let rows = stmt
            .query_map(params![release_id.to_string()], raw_artifact)
            .context("Failed to query artifacts")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(artifact_from_raw(row.context("Failed to read artifact row")?)?);
        }
        Ok(out)
    }

    /// Flip artifacts from staged to consumed, binding them to a task.
    /// All-or-nothing: returns `false` (and changes nothing) when any of
    /// the artifacts was consumed already.
    pub fn consume_artifacts(
        &self,
        artifact_ids: &[Uuid],
        task_id: Uuid,
        cycle_id: Option<Uuid>,
    ) -> Result<bool> {
        let now = now_str();
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        for artifact_id in artifact_ids {
            let changed = tx
                .execute(
                    "UPDATE build_artifacts
                     SET consumed = 1, consumed_by_task = ?1, cycle_id = ?2, consumed_at = ?3
                     WHERE id = ?4 AND consumed = 0",
                    params![
                        task_id.to_string(),
                        cycle_id.map(|c| c.to_string()),
                        now,
                        artifact_id.to_string()
                    ],
                )
                .context("Failed to consume artifact")?;
            if changed != 1 {
                tx.rollback().context("Failed to roll back consumption")?;
                return Ok(false);
            }
        }
        tx.commit().context("Failed to commit consumption")?;
        Ok(true)
    }

    /// Record a binary a CI/CD callback delivered directly: the artifact is
    /// born consumed, bound to the reporting task.
    pub fn insert_consumed_artifact(
        &self,
        release_id: Uuid,
        platform: Platform,
        stage: Stage,
        locator: &str,
        task_id: Uuid,
    ) -> Result<BuildArtifact> {
        let id = Uuid::new_v4();
        let now = now_str();
        self.conn
            .execute(
                "INSERT INTO build_artifacts
                     (id, release_id, platform, stage, locator, source, consumed,
                      consumed_by_task, created_at, consumed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8, ?8)",
                params![
                    id.to_string(),
                    release_id.to_string(),
                    platform.as_str(),
                    stage.as_str(),
                    locator,
                    BuildSource::CiCd.as_str(),
                    task_id.to_string(),
                    now,
                ],
            )
            .context("Failed to insert consumed artifact")?;
        self.get_artifact(id)?
            .context("Artifact not found after insert")
    }
}

// ── Row plumbing ──────────────────────────────────────────────────────

const SELECT_TASK: &str = "SELECT id, release_id, stage, cycle_id, kind, status, platforms,
        platform_shares, output, error, created_at, updated_at FROM tasks";

const SELECT_CYCLE: &str = "SELECT id, release_id, slot_index, status, tag, completed_at,
        created_at FROM regression_cycles";

const SELECT_ARTIFACT: &str = "SELECT id, release_id, platform, stage, locator, source, consumed,
        consumed_by_task, cycle_id, created_at, consumed_at FROM build_artifacts";

type RawRelease = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
);

fn raw_release(row: &rusqlite::Row) -> rusqlite::Result<RawRelease> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn release_from_raw(raw: RawRelease) -> Result<Release> {
    let (id, tenant, version, phase, platforms, kickoff_at, target_release_at, branch, upload_modes, created_at) =
        raw;
    Ok(Release {
        id: parse_uuid(&id)?,
        tenant,
        version,
        phase: parse_enum(&phase)?,
        platforms: from_json(&platforms)?,
        kickoff_at: parse_ts(&kickoff_at)?,
        target_release_at: parse_ts(&target_release_at)?,
        branch,
        upload_modes: from_json(&upload_modes)?,
        created_at: parse_ts(&created_at)?,
    })
}

type RawStageStatus = (String, String, String, bool);

fn raw_stage_status(row: &rusqlite::Row) -> rusqlite::Result<RawStageStatus> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn stage_status_from_raw(raw: RawStageStatus) -> Result<StageStatus> {
    let (release_id, stage, status, auto_advance) = raw;
    Ok(StageStatus {
        release_id: parse_uuid(&release_id)?,
        stage: parse_enum(&stage)?,
        status: parse_enum(&status)?,
        auto_advance,
    })
}

type RawTask = (
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
);

fn raw_task(row: &rusqlite::Row) -> rusqlite::Result<RawTask> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
    ))
}

fn task_from_raw(raw: RawTask) -> Result<Task> {
    let (id, release_id, stage, cycle_id, kind, status, platforms, shares, output, error, created_at, updated_at) =
        raw;
    Ok(Task {
        id: parse_uuid(&id)?,
        release_id: parse_uuid(&release_id)?,
        stage: parse_enum(&stage)?,
        cycle_id: cycle_id.as_deref().map(parse_uuid).transpose()?,
        kind: parse_enum(&kind)?,
        status: parse_enum(&status)?,
        platforms: from_json(&platforms)?,
        platform_shares: from_json(&shares)?,
        output: output.as_deref().map(from_json).transpose()?,
        error,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

type RawCycle = (String, String, i64, String, Option<String>, Option<String>, String);

fn raw_cycle(row: &rusqlite::Row) -> rusqlite::Result<RawCycle> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn cycle_from_raw(raw: RawCycle) -> Result<RegressionCycle> {
    let (id, release_id, slot_index, status, tag, completed_at, created_at) = raw;
    Ok(RegressionCycle {
        id: parse_uuid(&id)?,
        release_id: parse_uuid(&release_id)?,
        slot_index,
        status: parse_enum(&status)?,
        tag,
        completed_at: completed_at.as_deref().map(parse_ts).transpose()?,
        created_at: parse_ts(&created_at)?,
    })
}

type RawArtifact = (
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    bool,
    Option<String>,
    Option<String>,
    String,
    Option<String>,
);

fn raw_artifact(row: &rusqlite::Row) -> rusqlite::Result<RawArtifact> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
    ))
}

fn artifact_from_raw(raw: RawArtifact) -> Result<BuildArtifact> {
    let (id, release_id, platform, stage, locator, source, consumed, consumed_by_task, cycle_id, created_at, consumed_at) =
        raw;
    Ok(BuildArtifact {
        id: parse_uuid(&id)?,
        release_id: parse_uuid(&release_id)?,
        platform: parse_enum(&platform)?,
        stage: parse_enum(&stage)?,
        locator,
        source: parse_enum(&source)?,
        consumed,
        consumed_by_task: consumed_by_task.as_deref().map(parse_uuid).transpose()?,
        cycle_id: cycle_id.as_deref().map(parse_uuid).transpose()?,
        created_at: parse_ts(&created_at)?,
        consumed_at: consumed_at.as_deref().map(parse_ts).transpose()?,
    })
}

fn insert_task(conn: &Connection, task: &NewTask) -> Result<()> {
    let now = now_str();
    conn.execute(
        "INSERT INTO tasks
             (id, release_id, stage, cycle_id, kind, status, platforms,
              platform_shares, output, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, '{}', ?8, ?9, ?9)",
        params![
            task.id.to_string(),
            task.release_id.to_string(),
            task.stage.as_str(),
            task.cycle_id.map(|c| c.to_string()),
            task.kind.as_str(),
            task.status.as_str(),
            to_json(&task.platforms)?,
            task.output.as_ref().map(to_json).transpose()?,
            now,
        ],
    )
    .context("Failed to insert task")?;
    Ok(())
}

fn now_str() -> String {
    Utc::now().to_rfc3339()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("Failed to serialize column")
}

fn from_json<T: serde::de::DeserializeOwned>(json: &str) -> Result<T> {
    serde_json::from_str(json).context("Failed to deserialize column")
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("Invalid UUID in database: {}", s))
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp in database: {}", s))?
        .with_timezone(&Utc))
}

fn parse_enum<T: FromStr<Err = String>>(s: &str) -> Result<T> {
    s.parse().map_err(|e: String| anyhow::anyhow!(e))
}

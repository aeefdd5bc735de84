//! The scheduling loop and ingress surface.
//!
//! A single recurring timer drives every active release. Work within one
//! release is serialized by a per-release async mutex; releases evaluate
//! concurrently. Timer ticks use try-lock semantics — a tick that finds a
//! release still being evaluated skips it rather than queueing — while
//! out-of-band ingress calls (webhook callbacks, build uploads, operator
//! actions) block on the same lock so they never interleave with an
//! evaluation.
//!
//! A failure inside one release's evaluation is caught at the per-release
//! boundary: the lock is released, the error is logged, and the release is
//! retried from durable state on the next tick. Sibling releases are
//! unaffected.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapters::AdapterRegistry;
use crate::engine::task::{CallbackDisposition, CallbackEvent};
use crate::engine::{cycle, stage, task};
use crate::errors::EngineError;
use crate::store::models::{
    BuildArtifact, BuildSource, NewRelease, Platform, RegressionCycle, RegressionSlot, Release,
    ReleasePhase, Stage, StageState, StageStatus, Task,
};
use crate::store::{Db, DbHandle};

/// Per-release evaluation locks. Lock entries are created on first use and
/// kept for the process lifetime; the set of releases is small.
struct ReleaseLocks {
    locks: DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>,
}

impl ReleaseLocks {
    fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    fn for_release(&self, release_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(release_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// Counts from one pass over all active releases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub evaluated: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// A build binary arriving through the upload ingress.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildUpload {
    pub platform: Platform,
    pub stage: Stage,
    pub locator: Option<String>,
    pub source: BuildSource,
}

/// Read-only view of one release for the query surface.
#[derive(Debug, Clone, Serialize)]
pub struct ReleaseDetail {
    pub release: Release,
    pub stages: Vec<StageStatus>,
    pub tasks: Vec<Task>,
    pub slots: Vec<RegressionSlot>,
    pub cycles: Vec<RegressionCycle>,
    pub builds: Vec<BuildArtifact>,
}

/// The orchestration coordinator: owns the persistence handle, the adapter
/// registry, and the lock registry, and is the only component that mutates
/// release state.
pub struct Orchestrator {
    db: DbHandle,
    adapters: AdapterRegistry,
    locks: ReleaseLocks,
}

impl Orchestrator {
    pub fn new(db: DbHandle, adapters: AdapterRegistry) -> Self {
        Self {
            db,
            adapters,
            locks: ReleaseLocks::new(),
        }
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    /// Run the scheduling loop until the process stops.
    pub async fn run(self: Arc<Self>, interval: Duration) {
        info!(interval_secs = interval.as_secs(), "Orchestration loop started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.tick().await {
                Ok(summary) => {
                    if summary.evaluated + summary.skipped + summary.failed > 0 {
                        debug!(?summary, "Tick finished");
                    }
                }
                Err(e) => error!(error = %format!("{:#}", e), "Tick pass failed"),
            }
        }
    }

    /// Evaluate every active release once. Releases run concurrently; a
    /// release whose previous evaluation is still holding its lock is
    /// skipped entirely.
    pub async fn tick(&self) -> Result<TickSummary> {
        let releases = self.db.call(|db| db.list_active_releases()).await?;
        let outcomes = join_all(releases.iter().map(|r| self.tick_release(r.id))).await;

        let mut summary = TickSummary::default();
        for outcome in outcomes {
            match outcome {
                TickOutcome::Evaluated => summary.evaluated += 1,
                TickOutcome::Skipped => summary.skipped += 1,
                TickOutcome::Failed => summary.failed += 1,
            }
        }
        Ok(summary)
    }

    async fn tick_release(&self, release_id: Uuid) -> TickOutcome {
        let lock = self.locks.for_release(release_id);
        let Ok(_guard) = lock.try_lock() else {
            debug!(release = %release_id, "Previous evaluation still running; skipping tick");
            return TickOutcome::Skipped;
        };
        match self.evaluate_release(release_id).await {
            Ok(()) => TickOutcome::Evaluated,
            Err(e) => {
                error!(release = %release_id, error = %format!("{:#}", e), "Evaluation failed; will retry next tick");
                TickOutcome::Failed
            }
        }
    }

    /// One evaluation of a single release: advance whatever stage is
    /// active. Callers must hold the release's lock.
    pub async fn evaluate_release(&self, release_id: Uuid) -> Result<()> {
        let Some(release) = self.db.call(move |db| db.get_release(release_id)).await? else {
            warn!(release = %release_id, "Release disappeared; skipping evaluation");
            return Ok(());
        };

        match release.phase {
            ReleasePhase::NotStarted => {
                let r = release.clone();
                self.db
                    .call(move |db| {
                        stage::start_kickoff_if_due(db, &r)?;
                        Ok(())
                    })
                    .await?;
            }
            ReleasePhase::Kickoff => {
                self.run_stage_pass(&release, Stage::Kickoff).await?;
            }
            ReleasePhase::Regression => {
                let rid = release.id;
                if let Some(live) = self.db.call(move |db| db.in_progress_cycle(rid)).await? {
                    task::run_task_pass(
                        &self.db,
                        &self.adapters,
                        &release,
                        Stage::Regression,
                        Some(live.id),
                    )
                    .await?;
                }
                let r = release.clone();
                self.db
                    .call(move |db| {
                        cycle::schedule(db, &r)?;
                        stage::finalize_stage(db, &r, Stage::Regression)
                    })
                    .await?;
            }
            ReleasePhase::PostRegression => {
                self.run_stage_pass(&release, Stage::PostRegression).await?;
            }
            ReleasePhase::Released => {}
        }
        Ok(())
    }

    async fn run_stage_pass(&self, release: &Release, stage_name: Stage) -> Result<()> {
        task::run_task_pass(&self.db, &self.adapters, release, stage_name, None).await?;
        let r = release.clone();
        self.db
            .call(move |db| stage::finalize_stage(db, &r, stage_name))
            .await?;
        Ok(())
    }

    // ── Ingress ───────────────────────────────────────────────────────

    /// Create a release with its stage records and regression schedule.
    pub async fn create_release(&self, new: NewRelease) -> Result<Release, EngineError> {
        validate_new_release(&new)?;
        let release = self
            .db
            .call(move |db| db.create_release(&new))
            .await
            .map_err(EngineError::Other)?;
        info!(release = %release.id, version = %release.version, tenant = %release.tenant, "Release created");
        Ok(release)
    }

    /// Webhook callback ingress: apply one platform's outcome to a task.
    pub async fn handle_callback(
        &self,
        task_id: Uuid,
        event: CallbackEvent,
    ) -> Result<CallbackDisposition, EngineError> {
        let found = self
            .db
            .call(move |db| db.get_task(task_id))
            .await
            .map_err(EngineError::Other)?
            .ok_or(EngineError::TaskNotFound { id: task_id })?;

        self.locked(found.release_id, move |db| {
            task::apply_callback(db, task_id, &event)
        })
        .await
    }

    /// Build upload ingress: stage an artifact for the release, replacing
    /// any unconsumed one for the same key.
    pub async fn handle_build_upload(
        &self,
        release_id: Uuid,
        upload: BuildUpload,
    ) -> Result<BuildArtifact, EngineError> {
        let release = self.require_release(release_id).await?;
        if !release.platforms.contains(&upload.platform) {
            return Err(EngineError::validation(format!(
                "Release {} does not target platform {}",
                release_id, upload.platform
            )));
        }

        self.locked(release_id, move |db| {
            let artifact = db
                .stage_artifact(
                    release_id,
                    upload.platform,
                    upload.stage,
                    upload.locator.as_deref(),
                    upload.source,
                )
                .map_err(EngineError::Other)?;
            info!(
                release = %release_id, platform = %upload.platform, stage = %upload.stage,
                "Build artifact staged"
            );
            Ok(artifact)
        })
        .await
    }

    /// Operator approval to advance past the current stage.
    pub async fn trigger_next_stage(&self, release_id: Uuid) -> Result<ReleasePhase, EngineError> {
        self.require_release(release_id).await?;
        self.locked(release_id, move |db| {
            let release = db
                .get_release(release_id)
                .map_err(EngineError::Other)?
                .ok_or(EngineError::ReleaseNotFound { id: release_id })?;
            stage::trigger_next(db, &release)
        })
        .await
    }

    /// Operator retry of a failed task.
    pub async fn retry_task(&self, task_id: Uuid) -> Result<Task, EngineError> {
        let found = self
            .db
            .call(move |db| db.get_task(task_id))
            .await
            .map_err(EngineError::Other)?
            .ok_or(EngineError::TaskNotFound { id: task_id })?;
        self.locked(found.release_id, move |db| task::retry_task(db, task_id))
            .await
    }

    /// Operator skip of a failed, skippable task.
    pub async fn skip_task(&self, task_id: Uuid) -> Result<Task, EngineError> {
        let found = self
            .db
            .call(move |db| db.get_task(task_id))
            .await
            .map_err(EngineError::Other)?
            .ok_or(EngineError::TaskNotFound { id: task_id })?;
        self.locked(found.release_id, move |db| task::skip_task(db, task_id))
            .await
    }

    /// Operator abandonment of a live regression cycle.
    pub async fn abandon_cycle(&self, cycle_id: Uuid) -> Result<RegressionCycle, EngineError> {
        let found = self
            .db
            .call(move |db| db.get_cycle(cycle_id))
            .await
            .map_err(EngineError::Other)?
            .ok_or(EngineError::CycleNotFound { id: cycle_id })?;
        self.locked(found.release_id, move |db| cycle::abandon(db, cycle_id))
            .await
    }

    /// Append an ad hoc regression slot to a release's schedule.
    pub async fn append_slot(
        &self,
        release_id: Uuid,
        scheduled_at: DateTime<Utc>,
    ) -> Result<RegressionSlot, EngineError> {
        let release = self.require_release(release_id).await?;
        if release.phase == ReleasePhase::Released {
            return Err(EngineError::AlreadyReleased { id: release_id });
        }
        self.locked(release_id, move |db| {
            let regression = db
                .stage_status(release_id, Stage::Regression)
                .map_err(EngineError::Other)?;
            if regression.map(|s| s.status) == Some(StageState::Completed) {
                return Err(EngineError::validation(
                    "Regression stage already completed; cannot add slots".to_string(),
                ));
            }
            db.append_slot(release_id, scheduled_at)
                .map_err(EngineError::Other)
        })
        .await
    }

    // ── Query surface ─────────────────────────────────────────────────

    pub async fn list_releases(&self) -> Result<Vec<Release>, EngineError> {
        self.db
            .call(|db| db.list_releases())
            .await
            .map_err(EngineError::Other)
    }

    pub async fn release_detail(&self, release_id: Uuid) -> Result<ReleaseDetail, EngineError> {
        let detail = self
            .db
            .call(move |db| {
                let Some(release) = db.get_release(release_id)? else {
                    return Ok(None);
                };
                Ok(Some(ReleaseDetail {
                    stages: db.stage_statuses(release_id)?,
                    tasks: db.tasks_for_release(release_id)?,
                    slots: db.slots_for_release(release_id)?,
                    cycles: db.cycles_for_release(release_id)?,
                    builds: db.artifacts_for_release(release_id)?,
                    release,
                }))
            })
            .await
            .map_err(EngineError::Other)?;
        detail.ok_or(EngineError::ReleaseNotFound { id: release_id })
    }

    // ── Internals ─────────────────────────────────────────────────────

    async fn require_release(&self, release_id: Uuid) -> Result<Release, EngineError> {
        self.db
            .call(move |db| db.get_release(release_id))
            .await
            .map_err(EngineError::Other)?
            .ok_or(EngineError::ReleaseNotFound { id: release_id })
    }

    /// Run a closure against the database while holding the release's
    /// evaluation lock, so ingress mutations never interleave with a tick.
    async fn locked<T, F>(&self, release_id: Uuid, f: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&Db) -> Result<T, EngineError> + Send + 'static,
    {
        let lock = self.locks.for_release(release_id);
        let _guard = lock.lock().await;
        self.db
            .call(move |db| Ok(f(db)))
            .await
            .map_err(EngineError::Other)?
    }
}

enum TickOutcome {
    Evaluated,
    Skipped,
    Failed,
}

fn validate_new_release(new: &NewRelease) -> Result<(), EngineError> {
    if new.tenant.trim().is_empty() {
        return Err(EngineError::validation("tenant must not be empty"));
    }
    if new.version.trim().is_empty() {
        return Err(EngineError::validation("version must not be empty"));
    }
    if new.platforms.is_empty() {
        return Err(EngineError::validation("at least one platform is required"));
    }
    let mut seen = std::collections::BTreeSet::new();
    for platform in &new.platforms {
        if !seen.insert(*platform) {
            return Err(EngineError::validation(format!(
                "duplicate platform {}",
                platform
            )));
        }
    }
    for platform in new.upload_modes.keys() {
        if !new.platforms.contains(platform) {
            return Err(EngineError::validation(format!(
                "upload mode configured for untargeted platform {}",
                platform
            )));
        }
    }
    if new.target_release_at < new.kickoff_at {
        return Err(EngineError::validation(
            "target release date is before kickoff",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::collections::BTreeMap;

    use crate::store::Db;

    fn orchestrator() -> Arc<Orchestrator> {
        let db = DbHandle::new(Db::new_in_memory().unwrap());
        Arc::new(Orchestrator::new(db, AdapterRegistry::local()))
    }

    fn new_release(platforms: Vec<Platform>, auto: Vec<Stage>) -> NewRelease {
        let kickoff = Utc::now() - ChronoDuration::hours(1);
        NewRelease {
            tenant: "acme".to_string(),
            version: "7.0.0".to_string(),
            platforms,
            kickoff_at: kickoff,
            target_release_at: kickoff + ChronoDuration::days(14),
            branch: None,
            upload_modes: BTreeMap::new(),
            regression_slots: vec![],
            auto_advance: auto,
        }
    }

    #[tokio::test]
    async fn test_create_release_validation() {
        let orch = orchestrator();

        let mut bad = new_release(vec![], vec![]);
        assert!(matches!(
            orch.create_release(bad.clone()).await,
            Err(EngineError::Validation(_))
        ));

        bad.platforms = vec![Platform::Android, Platform::Android];
        assert!(matches!(
            orch.create_release(bad.clone()).await,
            Err(EngineError::Validation(_))
        ));

        bad.platforms = vec![Platform::Android];
        bad.upload_modes.insert(Platform::Ios, BuildSource::CiCd);
        assert!(matches!(
            orch.create_release(bad).await,
            Err(EngineError::Validation(_))
        ));

        let good = new_release(vec![Platform::Android], vec![]);
        assert!(orch.create_release(good).await.is_ok());
    }

    #[tokio::test]
    async fn test_tick_enters_kickoff_when_due() {
        let orch = orchestrator();
        let release = orch
            .create_release(new_release(vec![Platform::Android], vec![]))
            .await
            .unwrap();

        let summary = orch.tick().await.unwrap();
        assert_eq!(summary.evaluated, 1);

        let detail = orch.release_detail(release.id).await.unwrap();
        assert_eq!(detail.release.phase, ReleasePhase::Kickoff);
        assert_eq!(detail.tasks.len(), 4);
    }

    #[tokio::test]
    async fn test_tick_skips_release_whose_lock_is_held() {
        let orch = orchestrator();
        let release = orch
            .create_release(new_release(vec![Platform::Android], vec![]))
            .await
            .unwrap();

        let lock = orch.locks.for_release(release.id);
        let _guard = lock.lock().await;

        let summary = orch.tick().await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.evaluated, 0);

        // The skipped tick left the release untouched.
        let detail = orch.release_detail(release.id).await.unwrap();
        assert_eq!(detail.release.phase, ReleasePhase::NotStarted);
    }

    #[tokio::test]
    async fn test_tick_evaluates_releases_independently() {
        let orch = orchestrator();
        let blocked = orch
            .create_release(new_release(vec![Platform::Android], vec![]))
            .await
            .unwrap();
        let free = orch
            .create_release(new_release(vec![Platform::Web], vec![]))
            .await
            .unwrap();

        let lock = orch.locks.for_release(blocked.id);
        let _guard = lock.lock().await;

        let summary = orch.tick().await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.evaluated, 1);

        let detail = orch.release_detail(free.id).await.unwrap();
        assert_eq!(detail.release.phase, ReleasePhase::Kickoff);
    }

    #[tokio::test]
    async fn test_build_upload_rejects_untargeted_platform() {
        let orch = orchestrator();
        let release = orch
            .create_release(new_release(vec![Platform::Android], vec![]))
            .await
            .unwrap();

        let result = orch
            .handle_build_upload(
                release.id,
                BuildUpload {
                    platform: Platform::Web,
                    stage: Stage::Kickoff,
                    locator: Some("s3://x".to_string()),
                    source: BuildSource::Manual,
                },
            )
            .await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn test_append_slot_rejected_after_regression_completes() {
        let orch = orchestrator();
        let release = orch
            .create_release(new_release(vec![Platform::Android], vec![]))
            .await
            .unwrap();
        orch.db
            .call(move |db| db.set_stage_state(release.id, Stage::Regression, StageState::Completed))
            .await
            .unwrap();

        let result = orch.append_slot(release.id, Utc::now()).await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn test_ingress_on_unknown_ids() {
        let orch = orchestrator();
        assert!(matches!(
            orch.trigger_next_stage(Uuid::new_v4()).await,
            Err(EngineError::ReleaseNotFound { .. })
        ));
        assert!(matches!(
            orch.retry_task(Uuid::new_v4()).await,
            Err(EngineError::TaskNotFound { .. })
        ));
        assert!(matches!(
            orch.abandon_cycle(Uuid::new_v4()).await,
            Err(EngineError::CycleNotFound { .. })
        ));
        assert!(matches!(
            orch.release_detail(Uuid::new_v4()).await,
            Err(EngineError::ReleaseNotFound { .. })
        ));
    }
}

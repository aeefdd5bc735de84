//! Task execution: dispatching due work to adapters and settling the
//! three completion contracts (synchronous, webhook callback, staged
//! build).
//!
//! All mutations here run under the owning release's evaluation lock, so
//! reads within one pass are consistent. Dispatch eligibility is judged
//! against a snapshot taken at the start of the pass: a predecessor that
//! completes mid-pass releases its dependents on the next tick, not this
//! one.

use anyhow::Result;
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapters::{AdapterOutcome, AdapterRegistry};
use crate::engine::catalog;
use crate::errors::EngineError;
use crate::store::models::{
    CallbackOutcome, Platform, PlatformShare, Release, Stage, Task, TaskOutput, TaskStatus,
};
use crate::store::{Db, DbHandle};

/// A webhook callback reporting one platform's share of a task.
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackEvent {
    pub platform: Platform,
    pub outcome: CallbackOutcome,
    #[serde(default)]
    pub error: Option<String>,
    /// Storage locator of the produced binary, if the provider reports one.
    #[serde(default)]
    pub locator: Option<String>,
}

/// What the engine did with a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackDisposition {
    /// Share recorded; other platforms still outstanding.
    Recorded,
    /// Last outstanding share arrived; the task completed.
    Completed,
    /// The share reported failure; the task failed.
    Failed,
    /// Stale, duplicate, or otherwise inconsistent callback; dropped.
    Ignored,
}

/// Run one evaluation pass over a task scope: settle tasks waiting on
/// staged builds, then dispatch whatever became eligible.
pub async fn run_task_pass(
    db: &DbHandle,
    adapters: &AdapterRegistry,
    release: &Release,
    stage: Stage,
    cycle_id: Option<Uuid>,
) -> Result<()> {
    let release_id = release.id;
    let snapshot = db
        .call(move |db| db.tasks_in_scope(release_id, stage, cycle_id))
        .await?;

    for task in snapshot
        .iter()
        .filter(|t| t.status == TaskStatus::AwaitingManualBuild)
    {
        let task = task.clone();
        db.call(move |db| {
            settle_manual_build(db, &task)?;
            Ok(())
        })
        .await?;
    }

    let eligible: Vec<Task> = snapshot
        .iter()
        .filter(|t| t.status == TaskStatus::Pending && predecessors_completed(&snapshot, t))
        .cloned()
        .collect();

    for task in eligible {
        dispatch_one(db, adapters, release, task).await?;
    }
    Ok(())
}

/// Whether every declared predecessor of `task` is completed in the
/// snapshot of its scope.
fn predecessors_completed(snapshot: &[Task], task: &Task) -> bool {
    catalog::predecessors(task.stage, task.kind)
        .iter()
        .all(|kind| {
            snapshot
                .iter()
                .any(|t| t.kind == *kind && t.status == TaskStatus::Completed)
        })
}

async fn dispatch_one(
    db: &DbHandle,
    adapters: &AdapterRegistry,
    release: &Release,
    task: Task,
) -> Result<()> {
    let task_id = task.id;
    let Some(adapter) = adapters.adapter_for(task.kind) else {
        warn!(task = %task_id, kind = %task.kind, "No adapter registered; failing task");
        db.call(move |db| db.fail_task(task_id, "no adapter registered for task kind"))
            .await?;
        return Ok(());
    };

    db.call(move |db| db.set_task_status(task_id, TaskStatus::InProgress))
        .await?;

    let outcome = match adapter.dispatch(&task, release).await {
        Ok(outcome) => outcome,
        Err(e) => AdapterOutcome::Failed(format!("{:#}", e)),
    };

    db.call(move |db| apply_dispatch_outcome(db, &task, outcome))
        .await?;
    Ok(())
}

/// Record the result of an adapter dispatch on the task (and, for a tag
/// cut inside a cycle, on the cycle).
fn apply_dispatch_outcome(db: &Db, task: &Task, outcome: AdapterOutcome) -> Result<()> {
    match outcome {
        AdapterOutcome::CompletedSync(output) => {
            db.complete_task(task.id, &output)?;
            record_side_effects(db, task, &output)?;
            info!(task = %task.id, kind = %task.kind, "Task completed");
        }
        AdapterOutcome::AwaitingCallback => {
            db.set_task_status(task.id, TaskStatus::AwaitingCallback)?;
            debug!(task = %task.id, kind = %task.kind, "Task awaiting callback");
        }
        AdapterOutcome::AwaitingManualBuild => {
            db.set_task_status(task.id, TaskStatus::AwaitingManualBuild)?;
            debug!(task = %task.id, kind = %task.kind, "Task awaiting build upload");
        }
        AdapterOutcome::Failed(reason) => {
            db.fail_task(task.id, &reason)?;
            warn!(task = %task.id, kind = %task.kind, reason = %reason, "Task failed");
        }
    }
    Ok(())
}

fn record_side_effects(db: &Db, task: &Task, output: &TaskOutput) -> Result<()> {
    if let (Some(cycle_id), TaskOutput::TagCut { tag }) = (task.cycle_id, output) {
        db.set_cycle_tag(cycle_id, tag)?;
    }
    Ok(())
}

/// Try to complete a build-waiting task from staged artifacts.
///
/// Completes the task iff every required platform has a staged artifact
/// and consumption wins the exactly-once race; returns whether it did.
pub fn settle_manual_build(db: &Db, task: &Task) -> Result<bool> {
    let staged = db.list_staged(task.release_id, task.stage)?;
    let mut artifact_ids = Vec::with_capacity(task.platforms.len());
    for platform in &task.platforms {
        match staged.iter().find(|a| a.platform == *platform) {
            Some(artifact) => artifact_ids.push(artifact.id),
            None => return Ok(false),
        }
    }

    if !db.consume_artifacts(&artifact_ids, task.id, task.cycle_id)? {
        debug!(task = %task.id, "Staged builds were consumed concurrently; retrying next tick");
        return Ok(false);
    }

    db.complete_task(task.id, &TaskOutput::BuildsConsumed { artifact_ids })?;
    info!(task = %task.id, "Build task completed from staged artifacts");
    Ok(true)
}

/// Apply one platform's callback share to a task.
///
/// Stale or duplicate callbacks are dropped, not errors: webhook
/// redelivery is expected and must not corrupt task state.
pub fn apply_callback(
    db: &Db,
    task_id: Uuid,
    event: &CallbackEvent,
) -> Result<CallbackDisposition, EngineError> {
    let task = db
        .get_task(task_id)
        .map_err(EngineError::Other)?
        .ok_or(EngineError::TaskNotFound { id: task_id })?;

    if task.status != TaskStatus::AwaitingCallback {
        warn!(
            task = %task_id, status = %task.status, platform = %event.platform,
            "Callback for task not awaiting callbacks; ignoring"
        );
        return Ok(CallbackDisposition::Ignored);
    }
    if !task.platforms.contains(&event.platform) {
        warn!(task = %task_id, platform = %event.platform, "Callback for unknown platform; ignoring");
        return Ok(CallbackDisposition::Ignored);
    }
    if task.platform_shares.contains_key(&event.platform) {
        debug!(task = %task_id, platform = %event.platform, "Duplicate callback delivery; ignoring");
        return Ok(CallbackDisposition::Ignored);
    }

    db.record_platform_share(
        task_id,
        event.platform,
        &PlatformShare {
            outcome: event.outcome,
            error: event.error.clone(),
            locator: event.locator.clone(),
        },
    )
    .map_err(EngineError::Other)?;

    if event.outcome == CallbackOutcome::Success {
        if let Some(locator) = &event.locator {
            db.insert_consumed_artifact(task.release_id, event.platform, task.stage, locator, task_id)
                .map_err(EngineError::Other)?;
        }
    }

    if event.outcome == CallbackOutcome::Failed {
        let reason = event
            .error
            .clone()
            .unwrap_or_else(|| format!("{} build failed", event.platform));
        db.fail_task(task_id, &reason).map_err(EngineError::Other)?;
        warn!(task = %task_id, platform = %event.platform, "Callback reported failure");
        return Ok(CallbackDisposition::Failed);
    }

    let task = db
        .get_task(task_id)
        .map_err(EngineError::Other)?
        .ok_or(EngineError::TaskNotFound { id: task_id })?;
    if task.unreported_platforms().is_empty() {
        let artifact_ids = db
            .artifacts_for_release(task.release_id)
            .map_err(EngineError::Other)?
            .into_iter()
            .filter(|a| a.consumed_by_task == Some(task_id))
            .map(|a| a.id)
            .collect();
        db.complete_task(task_id, &TaskOutput::BuildsConsumed { artifact_ids })
            .map_err(EngineError::Other)?;
        info!(task = %task_id, "All callback shares succeeded; task completed");
        return Ok(CallbackDisposition::Completed);
    }

    Ok(CallbackDisposition::Recorded)
}

/// Operator retry: reset a failed task so the next tick redispatches it.
/// Never touches sibling tasks.
pub fn retry_task(db: &Db, task_id: Uuid) -> Result<Task, EngineError> {
    let task = db
        .get_task(task_id)
        .map_err(EngineError::Other)?
        .ok_or(EngineError::TaskNotFound { id: task_id })?;
    if task.status != TaskStatus::Failed {
        return Err(EngineError::RetryNotAllowed {
            id: task_id,
            status: task.status,
        });
    }
    db.reset_task_for_retry(task_id).map_err(EngineError::Other)?;
    info!(task = %task_id, kind = %task.kind, "Task reset for retry");
    db.get_task(task_id)
        .map_err(EngineError::Other)?
        .ok_or(EngineError::TaskNotFound { id: task_id })
}

/// Operator skip: resolve a failed task of a skippable kind without
/// running it.
pub fn skip_task(db: &Db, task_id: Uuid) -> Result<Task, EngineError> {
    let task = db
        .get_task(task_id)
        .map_err(EngineError::Other)?
        .ok_or(EngineError::TaskNotFound { id: task_id })?;
    if !catalog::is_skippable(task.kind) {
        return Err(EngineError::NotSkippable { kind: task.kind });
    }
    if task.status != TaskStatus::Failed {
        return Err(EngineError::SkipNotAllowed {
            id: task_id,
            status: task.status,
        });
    }
    db.skip_task(task_id).map_err(EngineError::Other)?;
    info!(task = %task_id, kind = %task.kind, "Task skipped");
    db.get_task(task_id)
        .map_err(EngineError::Other)?
        .ok_or(EngineError::TaskNotFound { id: task_id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use crate::adapters::ScriptedAdapter;
    use crate::store::models::{BuildSource, NewRelease, NewTask, TaskKind};

    fn new_release(modes: &[(Platform, BuildSource)]) -> NewRelease {
        NewRelease {
            tenant: "acme".to_string(),
            version: "2.5.0".to_string(),
            platforms: modes.iter().map(|(p, _)| *p).collect(),
            kickoff_at: Utc::now(),
            target_release_at: Utc::now() + Duration::days(14),
            branch: None,
            upload_modes: modes.iter().copied().collect::<BTreeMap<_, _>>(),
            regression_slots: vec![],
            auto_advance: vec![],
        }
    }

    fn seeded(modes: &[(Platform, BuildSource)]) -> (Db, Release) {
        let db = Db::new_in_memory().unwrap();
        let release = db.create_release(&new_release(modes)).unwrap();
        (db, release)
    }

    fn scripted_registry() -> (AdapterRegistry, Arc<ScriptedAdapter>) {
        let adapter = Arc::new(ScriptedAdapter::new());
        let mut registry = AdapterRegistry::new();
        for kind in [
            TaskKind::BranchFork,
            TaskKind::TicketCreation,
            TaskKind::TestSuiteCreation,
            TaskKind::TestSuiteReset,
            TaskKind::BuildTrigger,
            TaskKind::TagCreation,
            TaskKind::ReleaseNotes,
        ] {
            registry.register(kind, adapter.clone());
        }
        (registry, adapter)
    }

    fn kickoff_tasks_in_db(db: &Db, release: &Release) -> Vec<Task> {
        db.insert_tasks(&catalog::kickoff_tasks(release)).unwrap();
        db.tasks_in_scope(release.id, Stage::Kickoff, None).unwrap()
    }

    fn find(tasks: &[Task], kind: TaskKind) -> Task {
        tasks.iter().find(|t| t.kind == kind).unwrap().clone()
    }

    #[tokio::test]
    async fn test_pass_dispatches_only_tasks_without_open_predecessors() {
        let (db, release) = seeded(&[(Platform::Android, BuildSource::Manual)]);
        kickoff_tasks_in_db(&db, &release);
        let (registry, adapter) = scripted_registry();
        let handle = DbHandle::new(db);

        run_task_pass(&handle, &registry, &release, Stage::Kickoff, None)
            .await
            .unwrap();

        // BuildTrigger depends on BranchFork, which only completed during
        // this pass, so it is not dispatched until the next tick.
        let dispatched = adapter.dispatched();
        assert_eq!(dispatched.len(), 3);
        assert!(!dispatched.contains(&TaskKind::BuildTrigger));

        run_task_pass(&handle, &registry, &release, Stage::Kickoff, None)
            .await
            .unwrap();
        assert!(adapter.dispatched().contains(&TaskKind::BuildTrigger));

        let release_id = release.id;
        let tasks = handle
            .call(move |db| db.tasks_in_scope(release_id, Stage::Kickoff, None))
            .await
            .unwrap();
        assert_eq!(
            find(&tasks, TaskKind::BuildTrigger).status,
            TaskStatus::AwaitingManualBuild
        );
        assert_eq!(find(&tasks, TaskKind::BranchFork).status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_adapter_failure_marks_task_failed_with_reason() {
        let (db, release) = seeded(&[(Platform::Web, BuildSource::Manual)]);
        let tasks = kickoff_tasks_in_db(&db, &release);
        let branch_fork = find(&tasks, TaskKind::BranchFork);
        let (registry, adapter) = scripted_registry();
        // First three dispatches in creation order: branch fork first.
        adapter.push(AdapterOutcome::Failed("git remote unreachable".to_string()));
        let handle = DbHandle::new(db);

        run_task_pass(&handle, &registry, &release, Stage::Kickoff, None)
            .await
            .unwrap();

        let task_id = branch_fork.id;
        let task = handle
            .call(move |db| db.get_task(task_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("git remote unreachable"));
    }

    #[test]
    fn test_settle_manual_build_waits_for_all_platforms() {
        let (db, release) = seeded(&[
            (Platform::Android, BuildSource::Manual),
            (Platform::Ios, BuildSource::Manual),
        ]);
        let task = NewTask::pending(release.id, Stage::Kickoff, TaskKind::BuildTrigger)
            .with_platforms(release.platforms.clone());
        let task_id = task.id;
        db.insert_tasks(&[task]).unwrap();
        db.set_task_status(task_id, TaskStatus::AwaitingManualBuild).unwrap();

        db.stage_artifact(release.id, Platform::Android, Stage::Kickoff, Some("s3://a"), BuildSource::Manual)
            .unwrap();
        let task = db.get_task(task_id).unwrap().unwrap();
        assert!(!settle_manual_build(&db, &task).unwrap());
        assert_eq!(
            db.get_task(task_id).unwrap().unwrap().status,
            TaskStatus::AwaitingManualBuild
        );

        db.stage_artifact(release.id, Platform::Ios, Stage::Kickoff, Some("s3://i"), BuildSource::Manual)
            .unwrap();
        assert!(settle_manual_build(&db, &task).unwrap());

        let task = db.get_task(task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        match task.output.unwrap() {
            TaskOutput::BuildsConsumed { artifact_ids } => assert_eq!(artifact_ids.len(), 2),
            other => panic!("Unexpected output: {:?}", other),
        }
        assert!(db.list_staged(release.id, Stage::Kickoff).unwrap().is_empty());
    }

    #[test]
    fn test_callback_partial_then_complete() {
        let (db, release) = seeded(&[
            (Platform::Android, BuildSource::CiCd),
            (Platform::Ios, BuildSource::CiCd),
        ]);
        let task = NewTask::pending(release.id, Stage::Kickoff, TaskKind::BuildTrigger)
            .with_platforms(release.platforms.clone());
        let task_id = task.id;
        db.insert_tasks(&[task]).unwrap();
        db.set_task_status(task_id, TaskStatus::AwaitingCallback).unwrap();

        let disposition = apply_callback(
            &db,
            task_id,
            &CallbackEvent {
                platform: Platform::Android,
                outcome: CallbackOutcome::Success,
                error: None,
                locator: Some("gs://builds/android.aab".to_string()),
            },
        )
        .unwrap();
        assert_eq!(disposition, CallbackDisposition::Recorded);
        assert_eq!(
            db.get_task(task_id).unwrap().unwrap().status,
            TaskStatus::AwaitingCallback
        );

        let disposition = apply_callback(
            &db,
            task_id,
            &CallbackEvent {
                platform: Platform::Ios,
                outcome: CallbackOutcome::Success,
                error: None,
                locator: Some("gs://builds/ios.ipa".to_string()),
            },
        )
        .unwrap();
        assert_eq!(disposition, CallbackDisposition::Completed);

        let task = db.get_task(task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        match task.output.unwrap() {
            TaskOutput::BuildsConsumed { artifact_ids } => assert_eq!(artifact_ids.len(), 2),
            other => panic!("Unexpected output: {:?}", other),
        }
    }

    #[test]
    fn test_callback_failure_fails_task_but_keeps_success_shares() {
        let (db, release) = seeded(&[
            (Platform::Android, BuildSource::CiCd),
            (Platform::Ios, BuildSource::CiCd),
        ]);
        let task = NewTask::pending(release.id, Stage::Kickoff, TaskKind::BuildTrigger)
            .with_platforms(release.platforms.clone());
        let task_id = task.id;
        db.insert_tasks(&[task]).unwrap();
        db.set_task_status(task_id, TaskStatus::AwaitingCallback).unwrap();

        apply_callback(
            &db,
            task_id,
            &CallbackEvent {
                platform: Platform::Android,
                outcome: CallbackOutcome::Success,
                error: None,
                locator: None,
            },
        )
        .unwrap();
        let disposition = apply_callback(
            &db,
            task_id,
            &CallbackEvent {
                platform: Platform::Ios,
                outcome: CallbackOutcome::Failed,
                error: Some("codesign failed".to_string()),
                locator: None,
            },
        )
        .unwrap();
        assert_eq!(disposition, CallbackDisposition::Failed);

        let task = db.get_task(task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("codesign failed"));
        // The android share survives the failure.
        assert_eq!(
            task.platform_shares.get(&Platform::Android).unwrap().outcome,
            CallbackOutcome::Success
        );
    }

    #[test]
    fn test_stale_and_duplicate_callbacks_are_ignored() {
        let (db, release) = seeded(&[(Platform::Android, BuildSource::CiCd)]);
        let task = NewTask::pending(release.id, Stage::Kickoff, TaskKind::BuildTrigger)
            .with_platforms(vec![Platform::Android]);
        let task_id = task.id;
        db.insert_tasks(&[task]).unwrap();

        let event = CallbackEvent {
            platform: Platform::Android,
            outcome: CallbackOutcome::Success,
            error: None,
            locator: None,
        };

        // Not awaiting callbacks yet.
        assert_eq!(
            apply_callback(&db, task_id, &event).unwrap(),
            CallbackDisposition::Ignored
        );

        db.set_task_status(task_id, TaskStatus::AwaitingCallback).unwrap();
        assert_eq!(
            apply_callback(&db, task_id, &event).unwrap(),
            CallbackDisposition::Completed
        );

        // Redelivery after completion.
        assert_eq!(
            apply_callback(&db, task_id, &event).unwrap(),
            CallbackDisposition::Ignored
        );

        // Unknown platform on another awaiting task.
        let other = NewTask::pending(release.id, Stage::Kickoff, TaskKind::BuildTrigger)
            .with_platforms(vec![Platform::Android]);
        let other_id = other.id;
        db.insert_tasks(&[other]).unwrap();
        db.set_task_status(other_id, TaskStatus::AwaitingCallback).unwrap();
        let stray = CallbackEvent {
            platform: Platform::Web,
            outcome: CallbackOutcome::Success,
            error: None,
            locator: None,
        };
        assert_eq!(
            apply_callback(&db, other_id, &stray).unwrap(),
            CallbackDisposition::Ignored
        );
    }

    #[test]
    fn test_retry_only_from_failed() {
        let (db, release) = seeded(&[(Platform::Android, BuildSource::Manual)]);
        let task = NewTask::pending(release.id, Stage::Kickoff, TaskKind::BranchFork);
        let task_id = task.id;
        db.insert_tasks(&[task]).unwrap();

        assert!(matches!(
            retry_task(&db, task_id),
            Err(EngineError::RetryNotAllowed { .. })
        ));

        db.fail_task(task_id, "boom").unwrap();
        let task = retry_task(&db, task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.error.is_none());

        // Repeating the retry before the next tick changes nothing.
        assert!(matches!(
            retry_task(&db, task_id),
            Err(EngineError::RetryNotAllowed { .. })
        ));
        assert_eq!(db.get_task(task_id).unwrap().unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn test_skip_requires_failed_and_skippable() {
        let (db, release) = seeded(&[(Platform::Android, BuildSource::Manual)]);
        let tickets = NewTask::pending(release.id, Stage::Kickoff, TaskKind::TicketCreation);
        let fork = NewTask::pending(release.id, Stage::Kickoff, TaskKind::BranchFork);
        let (tickets_id, fork_id) = (tickets.id, fork.id);
        db.insert_tasks(&[tickets, fork]).unwrap();

        assert!(matches!(
            skip_task(&db, tickets_id),
            Err(EngineError::SkipNotAllowed { .. })
        ));

        db.fail_task(tickets_id, "jira down").unwrap();
        assert_eq!(skip_task(&db, tickets_id).unwrap().status, TaskStatus::Skipped);

        db.fail_task(fork_id, "boom").unwrap();
        assert!(matches!(
            skip_task(&db, fork_id),
            Err(EngineError::NotSkippable { .. })
        ));
    }

    #[test]
    fn test_tag_cut_in_cycle_records_cycle_tag() {
        let (db, release) = seeded(&[(Platform::Android, BuildSource::Manual)]);
        let db2 = &db;
        // Minimal cycle with a tag task.
        let cycle_id = Uuid::new_v4();
        let slots_release = release.id;
        db2.append_slot(slots_release, Utc::now()).unwrap();
        let tag_task = NewTask::pending(release.id, Stage::Regression, TaskKind::TagCreation)
            .in_cycle(cycle_id);
        let tag_task_id = tag_task.id;
        db2.start_cycle(release.id, 0, cycle_id, &[], tag_task_id, &[tag_task])
            .unwrap()
            .unwrap();

        let task = db2.get_task(tag_task_id).unwrap().unwrap();
        apply_dispatch_outcome(
            db2,
            &task,
            AdapterOutcome::CompletedSync(TaskOutput::TagCut {
                tag: "v2.5.0-rc.1".to_string(),
            }),
        )
        .unwrap();

        assert_eq!(
            db2.get_cycle(cycle_id).unwrap().unwrap().tag.as_deref(),
            Some("v2.5.0-rc.1")
        );
    }
}

//! Per-kind task declarations: how a task completes, what must finish
//! before it may run, and which stage task sets look like.
//!
//! This is the one place that knows the shape of each stage. The engine
//! itself only interprets these declarations.

use uuid::Uuid;

use crate::store::models::{
    BuildSource, NewTask, Platform, Release, Stage, TaskKind, TaskOutput, TaskStatus,
};

/// How a task reaches a terminal state after dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionContract {
    /// The adapter call itself completes or fails the task.
    Sync,
    /// The adapter starts external work; per-platform webhook callbacks
    /// finish it.
    Callback,
    /// The task waits until a staged build artifact exists for every
    /// required platform.
    ManualBuild,
}

/// The completion contract a task kind declares for a given release.
///
/// `BuildTrigger` depends on how the release delivers binaries: pure-CI
/// releases finish through callbacks, anything with a manual pipeline
/// waits for staged artifacts (CI pipelines deliver theirs through the
/// same build-upload ingress).
pub fn contract_for(kind: TaskKind, release: &Release) -> CompletionContract {
    match kind {
        TaskKind::BuildTrigger => {
            let all_ci = release
                .platforms
                .iter()
                .all(|p| release.upload_mode(*p) == BuildSource::CiCd);
            if all_ci {
                CompletionContract::Callback
            } else {
                CompletionContract::ManualBuild
            }
        }
        _ => CompletionContract::Sync,
    }
}

/// Intra-stage predecessors: a task is dispatched only on a tick after all
/// of these, in the same scope, completed.
pub fn predecessors(stage: Stage, kind: TaskKind) -> &'static [TaskKind] {
    match (stage, kind) {
        (Stage::Kickoff, TaskKind::BuildTrigger) => &[TaskKind::BranchFork],
        (Stage::Regression, TaskKind::ReleaseNotes) => &[TaskKind::TagCreation],
        (Stage::PostRegression, TaskKind::TagCreation) => &[TaskKind::BuildTrigger],
        (Stage::PostRegression, TaskKind::ReleaseNotes) => &[TaskKind::TagCreation],
        _ => &[],
    }
}

/// Whether an operator may resolve a failed task by skipping it. Only
/// side work that does not gate later tasks qualifies.
pub fn is_skippable(kind: TaskKind) -> bool {
    matches!(kind, TaskKind::TicketCreation | TaskKind::ReleaseNotes)
}

/// Task set created when the kickoff stage begins.
pub fn kickoff_tasks(release: &Release) -> Vec<NewTask> {
    vec![
        NewTask::pending(release.id, Stage::Kickoff, TaskKind::BranchFork),
        NewTask::pending(release.id, Stage::Kickoff, TaskKind::TicketCreation),
        NewTask::pending(release.id, Stage::Kickoff, TaskKind::TestSuiteCreation),
        NewTask::pending(release.id, Stage::Kickoff, TaskKind::BuildTrigger)
            .with_platforms(release.platforms.clone()),
    ]
}

/// Task set created when the post-regression stage begins.
pub fn post_regression_tasks(release: &Release) -> Vec<NewTask> {
    vec![
        NewTask::pending(release.id, Stage::PostRegression, TaskKind::BuildTrigger)
            .with_platforms(release.platforms.clone()),
        NewTask::pending(release.id, Stage::PostRegression, TaskKind::TagCreation),
        NewTask::pending(release.id, Stage::PostRegression, TaskKind::ReleaseNotes),
    ]
}

/// Task set for a freshly started regression cycle. The build-trigger task
/// is born completed: the cycle only starts once its artifacts exist, and
/// they are consumed into this task at the same instant.
pub fn cycle_tasks(release: &Release, cycle_id: Uuid, artifact_ids: Vec<Uuid>) -> Vec<NewTask> {
    let mut build_task = NewTask::pending(release.id, Stage::Regression, TaskKind::BuildTrigger)
        .with_platforms(release.platforms.clone())
        .in_cycle(cycle_id);
    build_task.status = TaskStatus::Completed;
    build_task.output = Some(TaskOutput::BuildsConsumed { artifact_ids });

    vec![
        build_task,
        NewTask::pending(release.id, Stage::Regression, TaskKind::TestSuiteReset).in_cycle(cycle_id),
        NewTask::pending(release.id, Stage::Regression, TaskKind::TagCreation).in_cycle(cycle_id),
        NewTask::pending(release.id, Stage::Regression, TaskKind::ReleaseNotes).in_cycle(cycle_id),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    use crate::store::models::ReleasePhase;

    fn release_with_modes(modes: &[(Platform, BuildSource)]) -> Release {
        Release {
            id: Uuid::new_v4(),
            tenant: "acme".to_string(),
            version: "3.1.0".to_string(),
            phase: ReleasePhase::Kickoff,
            platforms: modes.iter().map(|(p, _)| *p).collect(),
            kickoff_at: Utc::now(),
            target_release_at: Utc::now(),
            branch: "release/3.1.0".to_string(),
            upload_modes: modes.iter().copied().collect::<BTreeMap<_, _>>(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_build_trigger_contract_follows_upload_modes() {
        let all_ci = release_with_modes(&[
            (Platform::Android, BuildSource::CiCd),
            (Platform::Ios, BuildSource::CiCd),
        ]);
        assert_eq!(
            contract_for(TaskKind::BuildTrigger, &all_ci),
            CompletionContract::Callback
        );

        let mixed = release_with_modes(&[
            (Platform::Android, BuildSource::CiCd),
            (Platform::Ios, BuildSource::Manual),
        ]);
        assert_eq!(
            contract_for(TaskKind::BuildTrigger, &mixed),
            CompletionContract::ManualBuild
        );
    }

    #[test]
    fn test_non_build_tasks_are_synchronous() {
        let release = release_with_modes(&[(Platform::Web, BuildSource::Manual)]);
        for kind in [
            TaskKind::BranchFork,
            TaskKind::TicketCreation,
            TaskKind::TestSuiteCreation,
            TaskKind::TestSuiteReset,
            TaskKind::TagCreation,
            TaskKind::ReleaseNotes,
        ] {
            assert_eq!(contract_for(kind, &release), CompletionContract::Sync);
        }
    }

    #[test]
    fn test_kickoff_build_waits_for_branch() {
        assert_eq!(
            predecessors(Stage::Kickoff, TaskKind::BuildTrigger),
            &[TaskKind::BranchFork]
        );
        assert!(predecessors(Stage::Kickoff, TaskKind::BranchFork).is_empty());
    }

    #[test]
    fn test_release_notes_wait_for_tag() {
        assert_eq!(
            predecessors(Stage::Regression, TaskKind::ReleaseNotes),
            &[TaskKind::TagCreation]
        );
        assert_eq!(
            predecessors(Stage::PostRegression, TaskKind::ReleaseNotes),
            &[TaskKind::TagCreation]
        );
    }

    #[test]
    fn test_kickoff_task_set() {
        let release = release_with_modes(&[(Platform::Android, BuildSource::Manual)]);
        let tasks = kickoff_tasks(&release);
        assert_eq!(tasks.len(), 4);
        assert!(tasks.iter().all(|t| t.stage == Stage::Kickoff));
        assert!(tasks.iter().all(|t| t.cycle_id.is_none()));
        let trigger = tasks.iter().find(|t| t.kind == TaskKind::BuildTrigger).unwrap();
        assert_eq!(trigger.platforms, vec![Platform::Android]);
    }

    #[test]
    fn test_cycle_task_set_has_precompleted_build() {
        let release = release_with_modes(&[(Platform::Android, BuildSource::Manual)]);
        let cycle_id = Uuid::new_v4();
        let artifact_id = Uuid::new_v4();
        let tasks = cycle_tasks(&release, cycle_id, vec![artifact_id]);
        assert_eq!(tasks.len(), 4);
        assert!(tasks.iter().all(|t| t.cycle_id == Some(cycle_id)));

        let build = tasks.iter().find(|t| t.kind == TaskKind::BuildTrigger).unwrap();
        assert_eq!(build.status, TaskStatus::Completed);
        assert_eq!(
            build.output,
            Some(TaskOutput::BuildsConsumed {
                artifact_ids: vec![artifact_id]
            })
        );
        assert!(tasks
            .iter()
            .filter(|t| t.kind != TaskKind::BuildTrigger)
            .all(|t| t.status == TaskStatus::Pending));
    }

    #[test]
    fn test_skippable_kinds() {
        assert!(is_skippable(TaskKind::TicketCreation));
        assert!(is_skippable(TaskKind::ReleaseNotes));
        assert!(!is_skippable(TaskKind::BranchFork));
        assert!(!is_skippable(TaskKind::BuildTrigger));
        assert!(!is_skippable(TaskKind::TagCreation));
    }
}

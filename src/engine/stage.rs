//! Stage transitions: entering stages, detecting their completion, and
//! gating the release's forward-only phase walk.
//!
//! A stage completes only when every task in its scope has resolved
//! (completed or skipped); a failed mandatory task pins the stage until an
//! operator retries or skips it. Movement into the next stage happens
//! automatically only when the completing stage armed its auto-advance
//! flag; otherwise the release rests until the manual trigger.

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;

use crate::engine::{catalog, cycle};
use crate::errors::EngineError;
use crate::store::models::{Release, ReleasePhase, Stage, StageState};
use crate::store::Db;

/// Move a not-started release into kickoff once its kickoff time has
/// arrived. Returns whether the stage was entered.
pub fn start_kickoff_if_due(db: &Db, release: &Release) -> Result<bool> {
    if release.phase != ReleasePhase::NotStarted {
        return Ok(false);
    }
    if Utc::now() < release.kickoff_at {
        return Ok(false);
    }
    enter_stage(db, release, Stage::Kickoff)?;
    Ok(true)
}

/// Enter a stage: advance the phase, mark the stage in progress, and
/// create its task set. Regression creates no stage-level tasks — its
/// cycles own them.
pub fn enter_stage(db: &Db, release: &Release, stage: Stage) -> Result<()> {
    db.advance_phase(release.id, stage.phase())?;
    db.set_stage_state(release.id, stage, StageState::InProgress)?;

    let tasks = match stage {
        Stage::Kickoff => catalog::kickoff_tasks(release),
        Stage::Regression => Vec::new(),
        Stage::PostRegression => catalog::post_regression_tasks(release),
    };
    if !tasks.is_empty() {
        db.insert_tasks(&tasks)?;
    }
    info!(release = %release.id, stage = %stage, tasks = tasks.len(), "Stage entered");
    Ok(())
}

/// Whether every task (and, for regression, every slot) of a stage has
/// reached a resolved terminal state.
pub fn stage_resolved(db: &Db, release: &Release, stage: Stage) -> Result<bool> {
    match stage {
        Stage::Regression => cycle::stage_complete(db, release.id),
        Stage::Kickoff | Stage::PostRegression => {
            let tasks = db.tasks_in_scope(release.id, stage, None)?;
            Ok(!tasks.is_empty() && tasks.iter().all(|t| t.status.is_resolved()))
        }
    }
}

/// Complete an in-progress stage whose work has resolved, then advance
/// automatically if the stage armed its flag.
pub fn finalize_stage(db: &Db, release: &Release, stage: Stage) -> Result<()> {
    let status = db
        .stage_status(release.id, stage)?
        .with_context(|| format!("No stage status for release {} stage {}", release.id, stage))?;
    if status.status != StageState::InProgress {
        return Ok(());
    }
    if !stage_resolved(db, release, stage)? {
        return Ok(());
    }

    db.set_stage_state(release.id, stage, StageState::Completed)?;
    info!(release = %release.id, stage = %stage, "Stage completed");

    if status.auto_advance {
        advance(db, release, stage)?;
    }
    Ok(())
}

/// Move past a completed stage: enter the next one, or mark the release
/// released after the last.
pub fn advance(db: &Db, release: &Release, from: Stage) -> Result<()> {
    match from.next() {
        Some(next) => enter_stage(db, release, next),
        None => {
            db.advance_phase(release.id, ReleasePhase::Released)?;
            info!(release = %release.id, version = %release.version, "Release is out");
            Ok(())
        }
    }
}

/// Operator-approved advance past the current stage. Allowed from
/// not-started (starts kickoff early) and from any stage whose status is
/// completed; never skips unfinished work.
pub fn trigger_next(db: &Db, release: &Release) -> Result<ReleasePhase, EngineError> {
    match release.phase {
        ReleasePhase::NotStarted => {
            enter_stage(db, release, Stage::Kickoff).map_err(EngineError::Other)?;
        }
        ReleasePhase::Released => {
            return Err(EngineError::AlreadyReleased { id: release.id });
        }
        phase => {
            let stage = phase
                .stage()
                .ok_or_else(|| anyhow::anyhow!("Phase {} has no stage", phase))
                .map_err(EngineError::Other)?;
            let status = db
                .stage_status(release.id, stage)
                .map_err(EngineError::Other)?
                .ok_or_else(|| {
                    EngineError::Other(anyhow::anyhow!(
                        "No stage status for release {} stage {}",
                        release.id,
                        stage
                    ))
                })?;
            if status.status != StageState::Completed {
                return Err(EngineError::StageNotComplete {
                    id: release.id,
                    stage,
                });
            }
            advance(db, release, stage).map_err(EngineError::Other)?;
        }
    }

    let release = db
        .get_release(release.id)
        .map_err(EngineError::Other)?
        .ok_or(EngineError::ReleaseNotFound { id: release.id })?;
    Ok(release.phase)
}

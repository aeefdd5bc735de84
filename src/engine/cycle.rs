//! Regression cycle scheduling: deciding when the next dated slot may
//! become a live cycle, and retiring cycles whose tasks have finished.
//!
//! A cycle starts on build availability, never on a timer: a slot whose
//! scheduled time has long passed stays outstanding until every target
//! platform has a staged regression build, and starts immediately once
//! they do.

use anyhow::Result;
use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::catalog;
use crate::errors::EngineError;
use crate::store::models::{
    CycleStatus, RegressionCycle, RegressionSlot, Release, Stage, TaskKind,
};
use crate::store::Db;

/// One scheduling step for the regression stage of a release.
///
/// With a live cycle: check whether its tasks have all resolved and retire
/// it to done. Without one: find the earliest unconsumed slot and start it
/// if every platform's build is staged. (Task progress within a live cycle
/// is driven by the task pass, which runs before this.)
pub fn schedule(db: &Db, release: &Release) -> Result<()> {
    if let Some(cycle) = db.in_progress_cycle(release.id)? {
        let tasks = db.tasks_in_scope(release.id, Stage::Regression, Some(cycle.id))?;
        if !tasks.is_empty() && tasks.iter().all(|t| t.status.is_resolved()) {
            db.complete_cycle(cycle.id)?;
            info!(release = %release.id, cycle = %cycle.id, slot = cycle.slot_index, "Regression cycle done");
        }
        return Ok(());
    }

    let Some(slot) = next_due_slot(db, release.id)? else {
        return Ok(());
    };
    try_start_cycle(db, release, &slot)?;
    Ok(())
}

/// The earliest slot not yet consumed by a cycle.
pub fn next_due_slot(db: &Db, release_id: Uuid) -> Result<Option<RegressionSlot>> {
    let slots = db.slots_for_release(release_id)?;
    let cycles = db.cycles_for_release(release_id)?;
    Ok(slots
        .into_iter()
        .find(|slot| !cycles.iter().any(|c| c.slot_index == slot.index)))
}

/// Start a cycle for the slot when all target platforms have staged
/// regression builds. Returns the new cycle, or `None` when builds are
/// still outstanding (or a concurrent evaluation won the artifacts).
fn try_start_cycle(
    db: &Db,
    release: &Release,
    slot: &RegressionSlot,
) -> Result<Option<RegressionCycle>> {
    let staged = db.list_staged(release.id, Stage::Regression)?;
    let mut artifact_ids = Vec::with_capacity(release.platforms.len());
    for platform in &release.platforms {
        match staged.iter().find(|a| a.platform == *platform) {
            Some(artifact) => artifact_ids.push(artifact.id),
            None => {
                debug!(
                    release = %release.id, slot = slot.index, platform = %platform,
                    "Regression build outstanding; cycle stays unstarted"
                );
                return Ok(None);
            }
        }
    }

    let cycle_id = Uuid::new_v4();
    let tasks = catalog::cycle_tasks(release, cycle_id, artifact_ids.clone());
    let build_task_id = tasks
        .iter()
        .find(|t| t.kind == TaskKind::BuildTrigger)
        .map(|t| t.id)
        .expect("cycle task set always contains a build task");

    let started = db.start_cycle(
        release.id,
        slot.index,
        cycle_id,
        &artifact_ids,
        build_task_id,
        &tasks,
    )?;
    match &started {
        Some(cycle) => {
            info!(release = %release.id, cycle = %cycle.id, slot = slot.index, "Regression cycle started");
        }
        None => {
            debug!(release = %release.id, slot = slot.index, "Cycle start lost the consumption race");
        }
    }
    Ok(started)
}

/// Whether the regression stage as a whole is finished: every configured
/// slot has a terminal cycle and none is live.
pub fn stage_complete(db: &Db, release_id: Uuid) -> Result<bool> {
    let slots = db.slots_for_release(release_id)?;
    let cycles = db.cycles_for_release(release_id)?;
    if cycles.iter().any(|c| c.status == CycleStatus::InProgress) {
        return Ok(false);
    }
    Ok(slots.iter().all(|slot| {
        cycles
            .iter()
            .any(|c| c.slot_index == slot.index && c.status.is_terminal())
    }))
}

/// Explicit operator abandonment of a live cycle. Its unfinished tasks are
/// skipped; the slot counts as consumed.
pub fn abandon(db: &Db, cycle_id: Uuid) -> Result<RegressionCycle, EngineError> {
    let cycle = db
        .get_cycle(cycle_id)
        .map_err(EngineError::Other)?
        .ok_or(EngineError::CycleNotFound { id: cycle_id })?;
    if cycle.status != CycleStatus::InProgress {
        return Err(EngineError::CycleNotActive {
            id: cycle_id,
            status: cycle.status.to_string(),
        });
    }
    db.abandon_cycle(cycle_id).map_err(EngineError::Other)?;
    info!(cycle = %cycle_id, "Regression cycle abandoned");
    db.get_cycle(cycle_id)
        .map_err(EngineError::Other)?
        .ok_or(EngineError::CycleNotFound { id: cycle_id })
}

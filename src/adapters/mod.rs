//! Adapter seam between the engine and external integrations.
//!
//! Every integration family (source control, issue tracker, test
//! management, CI/CD) sits behind the same [`Adapter`] trait: the engine
//! hands over a task, the adapter reports one of four dispatch outcomes,
//! and provider wire formats never leak into the engine.
//!
//! Two implementations ship with the crate: [`LocalAdapter`], which
//! synthesizes deterministic results without any external calls (the
//! default wiring for development and single-box deployments), and
//! [`ScriptedAdapter`], which replays queued outcomes for tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use crate::engine::catalog::{self, CompletionContract};
use crate::store::models::{Release, Task, TaskKind, TaskOutput};

/// What a dispatch call did with a task.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterOutcome {
    /// The work finished inline; the task completes with this output.
    CompletedSync(TaskOutput),
    /// External work was started; webhook callbacks will finish the task.
    AwaitingCallback,
    /// The task waits for build artifacts to be staged.
    AwaitingManualBuild,
    /// The external call failed; the task fails with this reason.
    Failed(String),
}

/// One integration family.
#[async_trait]
pub trait Adapter: Send + Sync {
    async fn dispatch(&self, task: &Task, release: &Release) -> Result<AdapterOutcome>;
}

/// Maps each task kind to the adapter responsible for it.
#[derive(Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<TaskKind, Arc<dyn Adapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Registry with every task kind handled by the local adapter.
    pub fn local() -> Self {
        let mut registry = Self::new();
        let local: Arc<dyn Adapter> = Arc::new(LocalAdapter);
        for kind in [
            TaskKind::BranchFork,
            TaskKind::TicketCreation,
            TaskKind::TestSuiteCreation,
            TaskKind::TestSuiteReset,
            TaskKind::BuildTrigger,
            TaskKind::TagCreation,
            TaskKind::ReleaseNotes,
        ] {
            registry.register(kind, Arc::clone(&local));
        }
        registry
    }

    pub fn register(&mut self, kind: TaskKind, adapter: Arc<dyn Adapter>) {
        self.adapters.insert(kind, adapter);
    }

    pub fn adapter_for(&self, kind: TaskKind) -> Option<Arc<dyn Adapter>> {
        self.adapters.get(&kind).cloned()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::local()
    }
}

/// Adapter that fabricates plausible results locally.
///
/// Build triggers honor the release's delivery modes: pure-CI releases go
/// to the callback path, anything with a manual pipeline waits for
/// uploads. Everything else completes inline with deterministic output
/// derived from the release.
pub struct LocalAdapter;

#[async_trait]
impl Adapter for LocalAdapter {
    async fn dispatch(&self, task: &Task, release: &Release) -> Result<AdapterOutcome> {
        let outcome = match task.kind {
            TaskKind::BranchFork => AdapterOutcome::CompletedSync(TaskOutput::BranchForked {
                branch: release.branch.clone(),
            }),
            TaskKind::TicketCreation => AdapterOutcome::CompletedSync(TaskOutput::TicketsFiled {
                ticket_keys: release
                    .platforms
                    .iter()
                    .map(|p| format!("REL-{}-{}", release.version, p))
                    .collect(),
            }),
            TaskKind::TestSuiteCreation => {
                AdapterOutcome::CompletedSync(TaskOutput::TestSuiteCreated {
                    suite_id: format!("suite-{}", release.version),
                })
            }
            TaskKind::TestSuiteReset => AdapterOutcome::CompletedSync(TaskOutput::TestSuiteReset {
                suite_id: format!("suite-{}", release.version),
            }),
            TaskKind::BuildTrigger => match catalog::contract_for(task.kind, release) {
                CompletionContract::Callback => AdapterOutcome::AwaitingCallback,
                _ => AdapterOutcome::AwaitingManualBuild,
            },
            TaskKind::TagCreation => AdapterOutcome::CompletedSync(TaskOutput::TagCut {
                tag: format!("v{}-{}", release.version, &task.id.to_string()[..8]),
            }),
            TaskKind::ReleaseNotes => {
                AdapterOutcome::CompletedSync(TaskOutput::ReleaseNotesDrafted {
                    document_url: format!("notes://{}/{}", release.tenant, release.version),
                })
            }
        };
        Ok(outcome)
    }
}

/// Test adapter that pops pre-queued outcomes and records every dispatch.
/// An empty queue falls through to [`LocalAdapter`] behavior.
#[derive(Default)]
pub struct ScriptedAdapter {
    queued: Mutex<Vec<Result<AdapterOutcome>>>,
    dispatched: Mutex<Vec<TaskKind>>,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an outcome for the next dispatch (FIFO).
    pub fn push(&self, outcome: AdapterOutcome) {
        self.queued.lock().unwrap().push(Ok(outcome));
    }

    /// Queue a transport-level failure for the next dispatch.
    pub fn push_error(&self, message: &str) {
        self.queued
            .lock()
            .unwrap()
            .push(Err(anyhow::anyhow!("{}", message.to_string())));
    }

    /// Kinds dispatched so far, in order.
    pub fn dispatched(&self) -> Vec<TaskKind> {
        self.dispatched.lock().unwrap().clone()
    }
}

#[async_trait]
impl Adapter for ScriptedAdapter {
    async fn dispatch(&self, task: &Task, release: &Release) -> Result<AdapterOutcome> {
        self.dispatched.lock().unwrap().push(task.kind);
        let next = {
            let mut queued = self.queued.lock().unwrap();
            if queued.is_empty() {
                None
            } else {
                Some(queued.remove(0))
            }
        };
        match next {
            Some(outcome) => outcome,
            None => LocalAdapter.dispatch(task, release).await,
        }
    }
}

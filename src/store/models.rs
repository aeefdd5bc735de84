use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Target platform of a release pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Android,
    Ios,
    Web,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Android => "android",
            Self::Ios => "ios",
            Self::Web => "web",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "android" => Ok(Self::Android),
            "ios" => Ok(Self::Ios),
            "web" => Ok(Self::Web),
            _ => Err(format!("Invalid platform: {}", s)),
        }
    }
}

/// Top-level lifecycle phase of a release. Strictly ordered; a release's
/// phase never moves backwards.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum ReleasePhase {
    #[default]
    NotStarted,
    Kickoff,
    Regression,
    PostRegression,
    Released,
}

impl ReleasePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Kickoff => "kickoff",
            Self::Regression => "regression",
            Self::PostRegression => "post_regression",
            Self::Released => "released",
        }
    }

    /// The orchestrated stage running during this phase, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Kickoff => Some(Stage::Kickoff),
            Self::Regression => Some(Stage::Regression),
            Self::PostRegression => Some(Stage::PostRegression),
            Self::NotStarted | Self::Released => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Released)
    }
}

impl std::fmt::Display for ReleasePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReleasePhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(Self::NotStarted),
            "kickoff" => Ok(Self::Kickoff),
            "regression" => Ok(Self::Regression),
            "post_regression" => Ok(Self::PostRegression),
            "released" => Ok(Self::Released),
            _ => Err(format!("Invalid release phase: {}", s)),
        }
    }
}

/// One of the three orchestrated stages between the bookend phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Kickoff,
    Regression,
    PostRegression,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kickoff => "kickoff",
            Self::Regression => "regression",
            Self::PostRegression => "post_regression",
        }
    }

    /// The release phase a release is in while this stage runs.
    pub fn phase(&self) -> ReleasePhase {
        match self {
            Self::Kickoff => ReleasePhase::Kickoff,
            Self::Regression => ReleasePhase::Regression,
            Self::PostRegression => ReleasePhase::PostRegression,
        }
    }

    /// The stage that follows this one, if any.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Self::Kickoff => Some(Self::Regression),
            Self::Regression => Some(Self::PostRegression),
            Self::PostRegression => None,
        }
    }

    pub fn all() -> [Stage; 3] {
        [Self::Kickoff, Self::Regression, Self::PostRegression]
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kickoff" => Ok(Self::Kickoff),
            "regression" => Ok(Self::Regression),
            "post_regression" => Ok(Self::PostRegression),
            _ => Err(format!("Invalid stage: {}", s)),
        }
    }
}

/// Progress of a single stage within a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    #[default]
    Pending,
    InProgress,
    Completed,
}

impl StageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid stage state: {}", s)),
        }
    }
}

/// How build binaries reach the tracker for a pipeline: uploaded by hand
/// or delivered by a CI/CD provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildSource {
    Manual,
    CiCd,
}

impl BuildSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::CiCd => "ci_cd",
        }
    }
}

impl std::fmt::Display for BuildSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "ci_cd" => Ok(Self::CiCd),
            _ => Err(format!("Invalid build source: {}", s)),
        }
    }
}

/// The closed set of work-unit kinds the engine knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    BranchFork,
    TicketCreation,
    TestSuiteCreation,
    TestSuiteReset,
    BuildTrigger,
    TagCreation,
    ReleaseNotes,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BranchFork => "branch_fork",
            Self::TicketCreation => "ticket_creation",
            Self::TestSuiteCreation => "test_suite_creation",
            Self::TestSuiteReset => "test_suite_reset",
            Self::BuildTrigger => "build_trigger",
            Self::TagCreation => "tag_creation",
            Self::ReleaseNotes => "release_notes",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "branch_fork" => Ok(Self::BranchFork),
            "ticket_creation" => Ok(Self::TicketCreation),
            "test_suite_creation" => Ok(Self::TestSuiteCreation),
            "test_suite_reset" => Ok(Self::TestSuiteReset),
            "build_trigger" => Ok(Self::BuildTrigger),
            "tag_creation" => Ok(Self::TagCreation),
            "release_notes" => Ok(Self::ReleaseNotes),
            _ => Err(format!("Invalid task kind: {}", s)),
        }
    }
}

/// Lifecycle status of a task.
///
/// `Completed`, `Failed`, and `Skipped` are terminal; `Failed` is the only
/// state an operator retry can leave from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    AwaitingCallback,
    AwaitingManualBuild,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::AwaitingCallback => "awaiting_callback",
            Self::AwaitingManualBuild => "awaiting_manual_build",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Whether this status counts as done for stage-completion purposes.
    /// A failed task blocks its stage until retried or skipped.
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "awaiting_callback" => Ok(Self::AwaitingCallback),
            "awaiting_manual_build" => Ok(Self::AwaitingManualBuild),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// Status of one regression cycle. A dated slot with no cycle row yet is
/// the not-started state; rows are only created once a cycle actually
/// begins, so `InProgress` is the first persisted status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    InProgress,
    Done,
    Abandoned,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Abandoned)
    }
}

impl std::fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CycleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "abandoned" => Ok(Self::Abandoned),
            _ => Err(format!("Invalid cycle status: {}", s)),
        }
    }
}

/// Result a webhook callback reported for one platform's share of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackOutcome {
    Success,
    Failed,
}

impl CallbackOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for CallbackOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recorded per-platform callback share on a task awaiting callbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformShare {
    pub outcome: CallbackOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Storage locator of the binary the provider produced, if it reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locator: Option<String>,
}

/// Structured output recorded when a task completes. One variant per task
/// kind, so downstream consumers never parse free-form JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskOutput {
    BranchForked { branch: String },
    TicketsFiled { ticket_keys: Vec<String> },
    TestSuiteCreated { suite_id: String },
    TestSuiteReset { suite_id: String },
    BuildsConsumed { artifact_ids: Vec<Uuid> },
    TagCut { tag: String },
    ReleaseNotesDrafted { document_url: String },
}

/// One app version moving through the release train.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Release {
    pub id: Uuid,
    pub tenant: String,
    pub version: String,
    pub phase: ReleasePhase,
    pub platforms: Vec<Platform>,
    pub kickoff_at: DateTime<Utc>,
    pub target_release_at: DateTime<Utc>,
    pub branch: String,
    /// Per-platform build delivery mode.
    pub upload_modes: BTreeMap<Platform, BuildSource>,
    pub created_at: DateTime<Utc>,
}

impl Release {
    /// Upload mode for a platform, defaulting to manual when unconfigured.
    pub fn upload_mode(&self, platform: Platform) -> BuildSource {
        self.upload_modes
            .get(&platform)
            .copied()
            .unwrap_or(BuildSource::Manual)
    }
}

/// Input for creating a release.
#[derive(Debug, Clone, Deserialize)]
pub struct NewRelease {
    pub tenant: String,
    pub version: String,
    pub platforms: Vec<Platform>,
    pub kickoff_at: DateTime<Utc>,
    pub target_release_at: DateTime<Utc>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub upload_modes: BTreeMap<Platform, BuildSource>,
    /// Scheduled regression slots, earliest first.
    #[serde(default)]
    pub regression_slots: Vec<DateTime<Utc>>,
    /// Stages armed for automatic transition into their successor.
    #[serde(default)]
    pub auto_advance: Vec<Stage>,
}

/// Per-stage progress record, one row per (release, stage).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageStatus {
    pub release_id: Uuid,
    pub stage: Stage,
    pub status: StageState,
    /// When armed, the release advances into the next stage automatically
    /// as soon as this stage completes.
    pub auto_advance: bool,
}

/// A unit of work within a stage or regression cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub release_id: Uuid,
    pub stage: Stage,
    /// Set for regression tasks, which are scoped to one cycle.
    pub cycle_id: Option<Uuid>,
    pub kind: TaskKind,
    pub status: TaskStatus,
    /// Platforms this task covers; empty for single-shot tasks.
    pub platforms: Vec<Platform>,
    /// Callback shares reported so far, keyed by platform.
    pub platform_shares: BTreeMap<Platform, PlatformShare>,
    pub output: Option<TaskOutput>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Platforms that have not yet reported a callback share.
    pub fn unreported_platforms(&self) -> Vec<Platform> {
        self.platforms
            .iter()
            .copied()
            .filter(|p| !self.platform_shares.contains_key(p))
            .collect()
    }
}

/// Input for inserting a task. Status and output are settable so the
/// regression scheduler can create a build task that is already complete.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: Uuid,
    pub release_id: Uuid,
    pub stage: Stage,
    pub cycle_id: Option<Uuid>,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub platforms: Vec<Platform>,
    pub output: Option<TaskOutput>,
}

impl NewTask {
    pub fn pending(release_id: Uuid, stage: Stage, kind: TaskKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            release_id,
            stage,
            cycle_id: None,
            kind,
            status: TaskStatus::Pending,
            platforms: Vec::new(),
            output: None,
        }
    }

    pub fn with_platforms(mut self, platforms: Vec<Platform>) -> Self {
        self.platforms = platforms;
        self
    }

    pub fn in_cycle(mut self, cycle_id: Uuid) -> Self {
        self.cycle_id = Some(cycle_id);
        self
    }
}

/// One dated slot in a release's regression schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionSlot {
    pub release_id: Uuid,
    pub index: i64,
    pub scheduled_at: DateTime<Utc>,
}

/// One pass of regression testing, bound to a slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionCycle {
    pub id: Uuid,
    pub release_id: Uuid,
    pub slot_index: i64,
    pub status: CycleStatus,
    /// Immutable once cut by the cycle's tag task.
    pub tag: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A build binary uploaded or produced for a release.
///
/// Staged artifacts (`consumed == false`) have no owning task and may be
/// replaced by a newer upload for the same key. Consumed artifacts are
/// bound to exactly one task (and cycle, when regression-scoped) forever.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildArtifact {
    pub id: Uuid,
    pub release_id: Uuid,
    pub platform: Platform,
    /// The stage the binary was produced for.
    pub stage: Stage,
    pub locator: Option<String>,
    pub source: BuildSource,
    pub consumed: bool,
    pub consumed_by_task: Option<Uuid>,
    pub cycle_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
}

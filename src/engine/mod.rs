//! Release orchestration engine.
//!
//! ## Overview
//!
//! The engine walks each release through Kickoff → Regression →
//! Post-Regression → Released. A recurring tick evaluates every active
//! release; webhook callbacks and operator actions arrive out of band and
//! take the same per-release lock before touching state.
//!
//! ## Module Map
//!
//! ```text
//!                   ┌─────────────────────────────────────────────────┐
//!  timer / ingress  │  coordinator.rs  (Orchestrator, release locks)  │
//!       ──────────> │       │                                         │
//!                   │       v                                         │
//!                   │  stage.rs    (phase walk, stage completion)     │
//!                   │       │                                         │
//!                   │       ├── task.rs   (dispatch, callbacks,       │
//!                   │       │              staged-build settlement)   │
//!                   │       └── cycle.rs  (regression slots/cycles)   │
//!                   │              │                                  │
//!                   │              v                                  │
//!                   │  catalog.rs  (per-kind contracts, task sets)    │
//!                   └─────────────────────────────────────────────────┘
//! ```
//!
//! Build artifacts are tracked in the store (`store::db`); the staged vs.
//! consumed rules live in the consumption paths of `task.rs` and
//! `cycle.rs`, both funneling into the store's atomic consume.

pub mod catalog;
pub mod coordinator;
pub mod cycle;
pub mod stage;
pub mod task;

pub use coordinator::{BuildUpload, Orchestrator, ReleaseDetail, TickSummary};
pub use task::{CallbackDisposition, CallbackEvent};

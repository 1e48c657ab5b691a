//! # Metronome Scheduler
//!
//! Dynamic job-scheduling core for a long-running server process.
//! Jobs (backups, report generation, cache warm-ups, notification sweeps)
//! are defined at runtime and survive restarts; their schedule, enablement,
//! and pause state can change without a redeploy.
//!
//! Two sources of truth are kept in agreement: the durable definition
//! store (SQLite) and the live in-memory firing engine. The coordinator
//! is the only component allowed to touch both.
//!
//! ## Architecture
//! ```text
//! Admin op ──▶ Coordinator ── validate ──▶ Schedule (parse/normalize)
//!                 │  persist ───────────▶ DefinitionStore (SQLite)
//!                 │  project ───────────▶ SchedulerEngine
//!                 │                          │ resolve at fire time
//!                 │                          ▼
//!                 │                      HandlerRegistry ──▶ JobHandler::run
//!                 ◀── outcome channel ──────┘
//!                 │  write back last_run / next_fire / run history
//!                 └──▶ EventHub (broadcast "fired" / "failed" / ...)
//!
//! Startup: Coordinator::recover() reads enabled definitions from the
//! store and registers them into a freshly built engine.
//! ```

pub mod coordinator;
pub mod definition;
pub mod engine;
pub mod events;
pub mod handlers;
pub mod schedule;
pub mod store;

pub use coordinator::{Coordinator, DeleteOutcome, JobStatus, NewJob};
pub use definition::{
    ConcurrencyPolicy, DefinitionPatch, JobRun, PauseState, RunStatus, RunTrigger, TaskDefinition,
};
pub use engine::{EngineNotice, EngineStatus, EntrySpec, SchedulerEngine, Unregister};
pub use events::{EventHub, JobEvent, JobEventKind};
pub use handlers::{HandlerRegistry, JobContext, JobHandler};
pub use schedule::Schedule;
pub use store::DefinitionStore;

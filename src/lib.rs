//! # task-engine
//!
//! Multi-agent task orchestration engine: hierarchical tasks and
//! subtasks with formal state machines, a durable file-backed store
//! safe under concurrent OS processes, an agent dispatcher, and a
//! periodic heartbeat scanner.
//!
//! ## Architecture
//!
//! ```text
//!   CLI / scheduler
//!        │
//!        ├── dispatch ──► Dispatcher ──┐
//!        ├── check ─────► Checker ─────┤
//!        │                             ▼
//!        └── create/transition ──► TaskStore ──► tasks/ on disk
//!                                      │
//!                                 state tables
//! ```
//!
//! Every entry point is a short-lived single-threaded process; all
//! coordination happens through per-task OS file locks and atomic
//! record writes in the store.
//!
//! ## Modules
//! - `model`: task/subtask/history/index records and their JSON forms
//! - `state`: pure transition tables and the auto-transition rule
//! - `store`: lock-protected CRUD, index, append-only log, archival
//! - `dispatch`: agent selection, readiness gating, dispatch context
//! - `checker`: the heartbeat sweep (stuck/overdue/auto-transition)
//! - `notify`: pure chat-message formatting
//! - `config`: `settings.yaml` heartbeat knobs

pub mod checker;
pub mod config;
pub mod dispatch;
pub mod model;
pub mod notify;
pub mod state;
pub mod store;

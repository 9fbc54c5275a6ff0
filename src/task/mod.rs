#![forbid(unsafe_code)]

//! The task queue: records, lifecycle, persistence and the runner that
//! executes queued prompts one at a time.

pub mod auto_action;
pub mod engine;
pub mod events;
pub mod execution;
pub mod launch;
pub mod model;
pub mod preferences;
pub mod process;
pub mod state;
pub mod storage;
pub mod store;
pub mod worker;

// Core engine for Capflow workflows: graph, execution, persistence

pub mod capability;
pub mod config;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod retry;
pub mod storage;
pub mod types;
pub mod workflow;

pub use types::*;

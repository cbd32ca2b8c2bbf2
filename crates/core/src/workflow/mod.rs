pub mod dag;
pub mod engine;
pub mod interpolate;
pub mod strategy;
pub mod transmission;

pub use dag::{DependencyGraph, Vertex};
pub use engine::{Engine, EngineParams, ExecutionFinished};
pub use strategy::{ExecutionStrategy, Immediate, Scheduled};

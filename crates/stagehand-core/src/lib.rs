pub mod classifier;
pub mod config;
pub mod context;
pub mod error;
pub mod exec;
pub mod expressions;
pub mod graph;
pub mod job;
pub mod lifecycle;
pub mod meta;
pub mod reconciler;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod vexec;
pub mod workflow;

pub use error::{Result, StagehandError};

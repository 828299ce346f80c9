//! Tower middleware for the command execution pipeline.
//!
//! - [`load_shed`]: semaphore-based concurrency limit (queue or reject)
//! - [`metrics`]: tracing span and counter per execution
//! - [`pipeline`]: composes the layers around a handler

pub mod load_shed;
pub mod metrics;
pub mod pipeline;

pub use load_shed::LoadShedLayer;
pub use metrics::MetricsLayer;
pub use pipeline::{build_execution_pipeline, ExecutionPipeline};

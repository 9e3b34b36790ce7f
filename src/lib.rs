//! Parallel pipeline execution engine.
//!
//! Composes user-supplied transformation functions into a linear chain of
//! stages. Each stage runs one or more parallel workers on the Tokio
//! multi-threaded runtime, consumes items from the previous stage's
//! channel, and produces items onto its own bounded channel. Failures in
//! any worker are captured, propagated downstream, and surfaced to the
//! caller once the pipeline has drained.
//!
//! # Architecture
//!
//! - **Channel**: bounded MPMC FIFO connecting adjacent stages
//! - **Frame**: user items multiplexed with per-worker termination markers
//! - **Stage**: a user function plus worker count and queue capacity
//! - **Pipeline**: linear composition, lazy until iterated, with metrics
//!
//! # Usage
//!
//! ```no_run
//! use futures::StreamExt;
//! use pipeflow::{Pipeline, Stage};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pipeline = Pipeline::from_iter(0..100u32)
//!         .then(Stage::map("add_ten", |n| n + 10).setup(4, 16)?);
//!
//!     let mut results = pipeline.results();
//!     while let Some(item) = results.next().await {
//!         println!("{}", item?);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Item order is preserved end-to-end only when every stage runs a single
//! worker; multi-worker stages may interleave arbitrarily.

pub mod channel;
pub mod error;
pub mod frame;
pub mod pipeline;

pub use channel::{Channel, ChannelClosed};
pub use error::{PipelineError, TaskError};
pub use frame::{Frame, WorkerId};
pub use pipeline::{
    Metrics, MetricsSnapshot, Pipeline, Producer, Results, Stage, StageConfig, StageInput,
};

use anyhow::Result;

/// Build a Tokio runtime with the specified configuration, for callers
/// driving a pipeline from synchronous code.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}

//! Error types and the shared failure sink.
//!
//! A worker failure is captured where it happens, recorded in the
//! pipeline-wide [`ErrorSink`], and propagated downstream as a fault frame
//! so later stages stop doing useful work. The consumer side reports the
//! first captured failure once the pipeline has drained.

use crate::frame::WorkerId;
use std::fmt;
use std::sync::Mutex;
use thiserror::Error;

/// A captured worker failure: which worker, the error kind, and its
/// message. Renders as `<Kind>(<message>)`.
#[derive(Debug, Clone)]
pub struct TaskError {
    worker: WorkerId,
    kind: String,
    message: String,
}

impl TaskError {
    pub(crate) fn new(
        worker: WorkerId,
        kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            worker,
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Capture a failure reported through `anyhow`. The error chain is
    /// flattened into the message; a typed kind is recovered when the
    /// error was raised through a kind-preserving adapter.
    pub(crate) fn from_anyhow(worker: WorkerId, err: &anyhow::Error) -> Self {
        match err.downcast_ref::<Kinded>() {
            Some(kinded) => Self::new(worker, kinded.kind, kinded.message.clone()),
            None => Self::new(worker, "Error", format!("{err:#}")),
        }
    }

    /// Capture a worker panic observed at join time.
    pub(crate) fn panicked(worker: WorkerId, message: String) -> Self {
        Self::new(worker, "panic", message)
    }

    /// The worker that raised the error.
    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    /// Short name of the underlying error type (or `panic`).
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The underlying error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind, self.message)
    }
}

/// Errors surfaced by pipeline iteration and configuration.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// One or more workers failed. Carries the first captured failure and
    /// the total number of failing workers.
    #[error("{}", task_summary(.first, .failed))]
    Task {
        /// First failure captured anywhere in the pipeline.
        first: TaskError,
        /// Number of workers that failed.
        failed: usize,
    },

    /// `execute()` requires the pipeline to produce exactly one item.
    #[error("expected exactly one result item, got {got}")]
    WrongCardinality {
        /// Number of items the pipeline actually produced.
        got: usize,
    },

    /// Invalid stage configuration, reported at the call site.
    #[error("invalid stage configuration: {0}")]
    Config(String),
}

fn task_summary(first: &TaskError, failed: &usize) -> String {
    if *failed <= 1 {
        format!("The task \"{}\" raised {}", first.worker(), first)
    } else {
        format!(
            "{} tasks raised an exception. First error reported on task \"{}\": {}",
            failed,
            first.worker(),
            first
        )
    }
}

/// Internal carrier that preserves the short type name of a user error
/// raised through a typed adapter such as `Stage::try_map`.
#[derive(Debug, Error)]
#[error("{message}")]
pub(crate) struct Kinded {
    pub(crate) kind: &'static str,
    pub(crate) message: String,
}

impl Kinded {
    pub(crate) fn new(kind: &'static str, message: String) -> Self {
        Self { kind, message }
    }
}

/// Short name of a type: path and generic parameters stripped.
pub(crate) fn short_type_name<E>() -> &'static str {
    let full = std::any::type_name::<E>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Collects the first failure from each failing worker across the whole
/// pipeline. Failures are recorded at the point of capture, so none is
/// lost even when its fault frame is never pulled downstream.
#[derive(Debug, Default)]
pub(crate) struct ErrorSink {
    errors: Mutex<Vec<TaskError>>,
}

impl ErrorSink {
    pub(crate) fn record(&self, err: TaskError) {
        self.errors.lock().expect("error sink lock").push(err);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.errors.lock().expect("error sink lock").is_empty()
    }

    /// Fold the recorded failures into the error surfaced to the caller.
    pub(crate) fn to_error(&self) -> Option<PipelineError> {
        let errors = self.errors.lock().expect("error sink lock");
        errors.first().map(|first| PipelineError::Task {
            first: first.clone(),
            failed: errors.len(),
        })
    }
}

//! Stage configuration and startup.
//!
//! A stage owns a user function, a worker count, and an output-queue
//! capacity. Before execution it holds no runtime state; `start` allocates
//! the output channel, spawns the workers, and spawns a monitor that joins
//! them and installs the channel's close discipline.

use crate::channel::Channel;
use crate::error::{short_type_name, ErrorSink, Kinded, PipelineError, TaskError};
use crate::frame::{Frame, WorkerId};
use crate::pipeline::pipeline::Pipeline;
use crate::pipeline::worker::{
    run_producer, run_transformer, ItemStream, ProduceFn, StageInput, TransformFn, WorkerContext,
};
use crate::pipeline::Metrics;
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Runtime parameters of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Number of parallel workers
    pub workers: usize,

    /// Output channel capacity; 0 means unbounded
    pub qsize: usize,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            qsize: 0,
        }
    }
}

impl StageConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.workers == 0 {
            return Err(PipelineError::Config(
                "workers must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// A running stage: its output channel, the monitor task, and the worker
/// count the next consumer must account for.
pub(crate) struct StartedStage<T> {
    pub(crate) output: Channel<Frame<T>>,
    pub(crate) monitor: JoinHandle<()>,
    pub(crate) workers: usize,
}

/// The head stage of a pipeline. Its function is invoked with no input;
/// every worker calls it once, so a multi-worker producer emits the
/// function's output once per worker.
pub struct Producer<T> {
    name: Arc<str>,
    config: StageConfig,
    make: ProduceFn<T>,
}

impl<T> Producer<T>
where
    T: Send + 'static,
{
    /// Create a producer from a function returning a stream of items.
    pub fn new<F, S>(name: &str, f: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: Stream<Item = T> + Send + 'static,
    {
        Self::from_fn(name, move || f().map(anyhow::Ok).boxed())
    }

    /// Create a producer whose stream can fail item by item. The first
    /// error ends the worker and is surfaced from pipeline iteration.
    pub fn try_new<F, S>(name: &str, f: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: Stream<Item = anyhow::Result<T>> + Send + 'static,
    {
        Self::from_fn(name, move || f().boxed())
    }

    /// Wrap an iterable as a single-worker producer that yields its items.
    pub fn from_iter<I>(name: &str, input: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        let iter = Mutex::new(Some(input.into_iter()));
        Self::new(name, move || {
            let taken = iter.lock().expect("source iterator lock").take();
            stream::iter(taken.into_iter().flatten())
        })
    }

    fn from_fn<F>(name: &str, make: F) -> Self
    where
        F: Fn() -> ItemStream<T> + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name),
            config: StageConfig::default(),
            make: Arc::new(make),
        }
    }

    /// Set worker count and output queue capacity, returning the stage for
    /// fluent composition.
    pub fn setup(mut self, workers: usize, qsize: usize) -> Result<Self, PipelineError> {
        self.config = StageConfig { workers, qsize };
        self.config.validate()?;
        Ok(self)
    }

    /// Stage name, used in worker identities.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current configuration.
    pub fn config(&self) -> StageConfig {
        self.config
    }

    /// Compose this producer with a transformer stage into a pipeline.
    pub fn then<U>(self, stage: Stage<T, U>) -> Pipeline<U>
    where
        U: Send + 'static,
    {
        Pipeline::new(self).then(stage)
    }

    pub(crate) fn start(self, sink: &Arc<ErrorSink>, metrics: &Arc<Metrics>) -> StartedStage<T> {
        let output = Channel::new(self.config.qsize);
        let workers = self.config.workers;
        tracing::debug!("stage {}: spawning {} producer workers", self.name, workers);

        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let ctx = WorkerContext {
                id: WorkerId::new(self.name.clone(), index),
                sink: sink.clone(),
                metrics: metrics.clone(),
            };
            metrics.add_worker();
            handles.push(tokio::spawn(run_producer(
                ctx,
                self.make.clone(),
                output.clone(),
            )));
        }

        let monitor = tokio::spawn(monitor_stage(
            self.name.clone(),
            handles,
            None::<Channel<Frame<T>>>,
            output.clone(),
            sink.clone(),
            metrics.clone(),
        ));

        StartedStage {
            output,
            monitor,
            workers,
        }
    }
}

/// A transformer stage: its function is called with a lazy input sequence
/// over the predecessor's output channel, plus whatever state the closure
/// captured.
pub struct Stage<T, U> {
    name: Arc<str>,
    config: StageConfig,
    make: TransformFn<T, U>,
}

impl<T, U> Stage<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    /// Create a stage from a function mapping the input sequence to an
    /// output stream.
    pub fn new<F, S>(name: &str, f: F) -> Self
    where
        F: Fn(StageInput<T>) -> S + Send + Sync + 'static,
        S: Stream<Item = U> + Send + 'static,
    {
        Self::from_fn(name, move |input| f(input).map(anyhow::Ok).boxed())
    }

    /// Like [`Stage::new`], but the output stream can fail item by item.
    /// The first error ends the worker and is surfaced from pipeline
    /// iteration.
    pub fn try_new<F, S>(name: &str, f: F) -> Self
    where
        F: Fn(StageInput<T>) -> S + Send + Sync + 'static,
        S: Stream<Item = anyhow::Result<U>> + Send + 'static,
    {
        Self::from_fn(name, move |input| f(input).boxed())
    }

    /// Apply a pure function to every input element; the engine handles
    /// iteration.
    pub fn map<F>(name: &str, f: F) -> Self
    where
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::new(name, move |input: StageInput<T>| {
            let f = f.clone();
            input.map(move |item| f(item))
        })
    }

    /// Apply an async function to every input element, one at a time per
    /// worker. CPU-bound work belongs in `tokio::task::spawn_blocking`
    /// inside the future.
    pub fn map_async<F, Fut>(name: &str, f: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = U> + Send + 'static,
    {
        let f = Arc::new(f);
        Self::new(name, move |input: StageInput<T>| {
            let f = f.clone();
            input.then(move |item| f(item))
        })
    }

    /// Apply a fallible function to every input element. The error's type
    /// name is preserved for the failure report.
    pub fn try_map<F, E>(name: &str, f: F) -> Self
    where
        F: Fn(T) -> Result<U, E> + Send + Sync + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::try_new(name, move |input: StageInput<T>| {
            let f = f.clone();
            input.map(move |item| {
                f(item).map_err(|err| {
                    anyhow::Error::new(Kinded::new(short_type_name::<E>(), err.to_string()))
                })
            })
        })
    }

    /// Apply a function to every input element, dropping elements mapped
    /// to `None`.
    pub fn filter_map<F>(name: &str, f: F) -> Self
    where
        F: Fn(T) -> Option<U> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::new(name, move |input: StageInput<T>| {
            let f = f.clone();
            input.filter_map(move |item| futures::future::ready(f(item)))
        })
    }

    fn from_fn<F>(name: &str, make: F) -> Self
    where
        F: Fn(StageInput<T>) -> ItemStream<U> + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name),
            config: StageConfig::default(),
            make: Arc::new(make),
        }
    }

    /// Set worker count and output queue capacity, returning the stage for
    /// fluent composition.
    pub fn setup(mut self, workers: usize, qsize: usize) -> Result<Self, PipelineError> {
        self.config = StageConfig { workers, qsize };
        self.config.validate()?;
        Ok(self)
    }

    /// Stage name, used in worker identities.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current configuration.
    pub fn config(&self) -> StageConfig {
        self.config
    }

    pub(crate) fn start(
        self,
        input: Channel<Frame<T>>,
        sink: &Arc<ErrorSink>,
        metrics: &Arc<Metrics>,
    ) -> StartedStage<U> {
        let output = Channel::new(self.config.qsize);
        let workers = self.config.workers;
        tracing::debug!("stage {}: spawning {} workers", self.name, workers);

        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let ctx = WorkerContext {
                id: WorkerId::new(self.name.clone(), index),
                sink: sink.clone(),
                metrics: metrics.clone(),
            };
            metrics.add_worker();
            handles.push(tokio::spawn(run_transformer(
                ctx,
                input.clone(),
                self.make.clone(),
                output.clone(),
            )));
        }

        let monitor = tokio::spawn(monitor_stage(
            self.name.clone(),
            handles,
            Some(input),
            output.clone(),
            sink.clone(),
            metrics.clone(),
        ));

        StartedStage {
            output,
            monitor,
            workers,
        }
    }
}

/// Join a stage's workers, then close its output channel exactly once.
///
/// A panicked worker never emitted its terminating frame; the close stands
/// in for it, and the panic is recorded so the consumer side still fails.
/// After the close, the stage's input channel is drained: consumers stop
/// at their first terminating frame, so frames can be left unread, and a
/// stage function that stops consuming early would otherwise leave
/// upstream workers blocked on a full channel.
async fn monitor_stage<I, O>(
    name: Arc<str>,
    workers: Vec<JoinHandle<()>>,
    input: Option<Channel<Frame<I>>>,
    output: Channel<Frame<O>>,
    sink: Arc<ErrorSink>,
    metrics: Arc<Metrics>,
) where
    I: Send + 'static,
    O: Send + 'static,
{
    for (index, handle) in workers.into_iter().enumerate() {
        if let Err(err) = handle.await {
            if err.is_panic() {
                let message = panic_message(err.into_panic());
                let id = WorkerId::new(name.clone(), index);
                tracing::warn!("worker {} panicked: {}", id, message);
                sink.record(TaskError::panicked(id, message));
                metrics.add_panic();
            }
        }
    }

    output.close();

    if let Some(input) = input {
        while input.get().await.is_some() {}
    }

    tracing::debug!("stage {} complete", name);
}

/// Recover a readable message from a panic payload.
fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "worker panicked".to_string()
    }
}

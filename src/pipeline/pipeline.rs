//! Linear composition of stages and result iteration.
//!
//! A pipeline is inert until [`Pipeline::results`] is called: stages hold
//! their functions and configuration, nothing more. `results` wires
//! producer → stage₁ → … → terminal channel, starts every worker, and
//! returns a lazy stream over the final channel. The stream yields user
//! items, counts the last stage's terminating frames to know when the
//! pipeline is drained, awaits every stage monitor, and only then reports
//! the first captured failure, so no worker is left blocked behind an
//! error.

use crate::channel::Channel;
use crate::error::{ErrorSink, PipelineError};
use crate::frame::Frame;
use crate::pipeline::stage::{Producer, Stage};
use crate::pipeline::Metrics;
use futures::stream::{Stream, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::task::JoinHandle;

type Closer = Box<dyn Fn() + Send + Sync>;

/// Everything a pipeline launch accumulates besides its typed output.
struct LaunchParts {
    monitors: Vec<JoinHandle<()>>,
    closers: Vec<Closer>,
    last_workers: usize,
}

/// A started pipeline: terminal channel plus bookkeeping.
struct Launch<T> {
    output: Channel<Frame<T>>,
    parts: LaunchParts,
}

type BuildFn<T> = Box<dyn FnOnce(&Arc<ErrorSink>, &Arc<Metrics>) -> Launch<T> + Send>;

/// An ordered, non-empty chain of stages. The first stage is always a
/// producer; every later stage transforms its predecessor's output. Once
/// `results` has been called the pipeline is consumed, so stages cannot
/// be added to a running pipeline.
pub struct Pipeline<T> {
    build: BuildFn<T>,
    stages: usize,
}

impl<T> Pipeline<T>
where
    T: Send + 'static,
{
    /// Create a pipeline from its head producer stage.
    pub fn new(producer: Producer<T>) -> Self {
        Self {
            build: Box::new(move |sink, metrics| {
                let started = producer.start(sink, metrics);
                let output = started.output.clone();
                let closer: Closer = Box::new(move || {
                    output.close();
                });
                Launch {
                    output: started.output,
                    parts: LaunchParts {
                        monitors: vec![started.monitor],
                        closers: vec![closer],
                        last_workers: started.workers,
                    },
                }
            }),
            stages: 1,
        }
    }

    /// Wrap an iterable as an implicit single-worker producer stage.
    pub fn from_iter<I>(input: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::new(Producer::from_iter("source", input))
    }

    /// Extend the pipeline with a transformer stage.
    pub fn then<U>(self, stage: Stage<T, U>) -> Pipeline<U>
    where
        U: Send + 'static,
    {
        let prev = self.build;
        Pipeline {
            build: Box::new(move |sink, metrics| {
                let Launch { output, mut parts } = prev(sink, metrics);
                let started = stage.start(output, sink, metrics);
                let next_output = started.output.clone();
                parts.monitors.push(started.monitor);
                parts.closers.push(Box::new(move || {
                    next_output.close();
                }));
                parts.last_workers = started.workers;
                Launch {
                    output: started.output,
                    parts,
                }
            }),
            stages: self.stages + 1,
        }
    }

    /// Start every stage and return a lazy stream of results.
    ///
    /// Must be called from within a Tokio runtime. Items successfully
    /// produced before a failure are still yielded; the failure itself is
    /// yielded once, after the pipeline has fully drained. Dropping the
    /// returned stream early closes every channel so workers terminate
    /// instead of blocking forever.
    pub fn results(self) -> Results<T> {
        let sink = Arc::new(ErrorSink::default());
        let metrics = Metrics::new();
        let launch = (self.build)(&sink, &metrics);
        tracing::debug!(
            "pipeline started: {} stages, {} workers",
            self.stages,
            metrics.workers_spawned.load(std::sync::atomic::Ordering::Relaxed)
        );

        Results {
            rx: Box::pin(launch.output.receiver()),
            expected: launch.parts.last_workers,
            seen: 0,
            monitors: launch.parts.monitors,
            closers: launch.parts.closers,
            sink,
            metrics,
            phase: Phase::Streaming,
        }
    }

    /// Run the pipeline to completion and return its single result item.
    ///
    /// Fails with [`PipelineError::WrongCardinality`] if the pipeline
    /// produces zero items or more than one.
    pub async fn execute(self) -> Result<T, PipelineError> {
        let mut results = self.results();
        let mut first = None;
        let mut got = 0usize;
        while let Some(next) = results.next().await {
            let item = next?;
            if first.is_none() {
                first = Some(item);
            }
            got += 1;
        }
        match (first, got) {
            (Some(item), 1) => Ok(item),
            (_, got) => Err(PipelineError::WrongCardinality { got }),
        }
    }
}

enum Phase {
    /// Yielding items and counting terminating frames.
    Streaming,
    /// Terminal channel drained; awaiting stage monitors.
    Joining,
    /// Monitors done; report a failure if any worker recorded one.
    Reporting,
    /// Nothing left to yield.
    Finished,
}

/// Lazy stream over a running pipeline's terminal channel.
///
/// Yields `Ok(item)` for every user item. If any worker failed, a single
/// `Err(PipelineError::Task { .. })` follows once the pipeline has drained
/// and every stage monitor has finished.
pub struct Results<T> {
    rx: Pin<Box<async_channel::Receiver<Frame<T>>>>,
    expected: usize,
    seen: usize,
    monitors: Vec<JoinHandle<()>>,
    closers: Vec<Closer>,
    sink: Arc<ErrorSink>,
    metrics: Arc<Metrics>,
    phase: Phase,
}

impl<T> Results<T> {
    /// Counters for this run, shared with every worker.
    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Close every channel in the pipeline. Workers observe the closure on
    /// their next channel operation and terminate; in-flight items are
    /// discarded. Called automatically when the stream is dropped before
    /// exhaustion.
    pub fn cancel(&self) {
        for close in &self.closers {
            close();
        }
    }
}

impl<T> Stream for Results<T> {
    type Item = Result<T, PipelineError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match this.phase {
                Phase::Streaming => {
                    if this.seen >= this.expected {
                        this.phase = Phase::Joining;
                        continue;
                    }
                    match ready!(this.rx.as_mut().poll_next(cx)) {
                        Some(Frame::Item(item)) => return Poll::Ready(Some(Ok(item))),
                        Some(Frame::End(_)) | Some(Frame::Fault(_)) => {
                            // Faults were recorded where they were captured;
                            // here they only count toward the drain total.
                            this.seen += 1;
                        }
                        None => {
                            this.phase = Phase::Joining;
                        }
                    }
                }
                Phase::Joining => {
                    while let Some(handle) = this.monitors.last_mut() {
                        match Pin::new(handle).poll(cx) {
                            Poll::Ready(_) => {
                                this.monitors.pop();
                            }
                            Poll::Pending => return Poll::Pending,
                        }
                    }
                    this.phase = Phase::Reporting;
                }
                Phase::Reporting => {
                    this.phase = Phase::Finished;
                    return match this.sink.to_error() {
                        Some(err) => Poll::Ready(Some(Err(err))),
                        None => Poll::Ready(None),
                    };
                }
                Phase::Finished => return Poll::Ready(None),
            }
        }
    }
}

impl<T> Drop for Results<T> {
    fn drop(&mut self) {
        // Harmless after a clean finish (the channels are already closed);
        // on early abandonment this unblocks every worker.
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_execute_rejects_empty_output() {
        let empty: Vec<u32> = Vec::new();
        let result = Pipeline::from_iter(empty).execute().await;
        match result {
            Err(PipelineError::WrongCardinality { got }) => assert_eq!(got, 0),
            other => panic!("expected cardinality error, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_execute_rejects_multiple_items() {
        let result = Pipeline::from_iter(vec![1, 2, 3]).execute().await;
        match result {
            Err(PipelineError::WrongCardinality { got }) => assert_eq!(got, 3),
            other => panic!("expected cardinality error, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_results_reports_worker_counts_in_metrics() {
        let pipeline = Pipeline::from_iter(0..10u32)
            .then(Stage::map("inc", |x| x + 1).setup(2, 0).unwrap());

        let mut results = pipeline.results();
        let metrics = results.metrics();
        let mut count = 0;
        while let Some(item) = results.next().await {
            item.unwrap();
            count += 1;
        }

        assert_eq!(count, 10);
        let snapshot = metrics.snapshot();
        // 1 source worker + 2 stage workers, one marker each.
        assert_eq!(snapshot.workers_spawned, 3);
        assert_eq!(snapshot.markers_emitted, 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dropping_results_does_not_strand_workers() {
        let pipeline = Pipeline::from_iter(0..100_000u64)
            .then(Stage::map("inc", |x| x + 1).setup(2, 1).unwrap());

        let mut results = pipeline.results();
        let first = results.next().await.unwrap().unwrap();
        assert!(first >= 1);
        drop(results);

        // Workers notice the closed channels and wind down on their own;
        // nothing here should hang the runtime.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}

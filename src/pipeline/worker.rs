//! Worker execution: one parallel instance of a stage function.
//!
//! A worker drives the user function's output stream, forwarding items to
//! the stage's output channel, and emits exactly one terminating frame
//! when it finishes. A transformer worker reads its input through
//! [`StageInput`], which performs the end-of-stream accounting: iteration
//! stops at the first terminating frame this worker pulls, or when the
//! shared input channel closes.

use crate::channel::Channel;
use crate::error::{ErrorSink, TaskError};
use crate::frame::{Frame, WorkerId};
use crate::pipeline::Metrics;
use futures::stream::{BoxStream, Stream, StreamExt};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};

/// Output of a stage function: a finite lazy sequence of fallible items.
pub(crate) type ItemStream<T> = BoxStream<'static, anyhow::Result<T>>;

/// Builds one producer output stream per worker.
pub(crate) type ProduceFn<T> = Arc<dyn Fn() -> ItemStream<T> + Send + Sync>;

/// Builds one transformer output stream per worker from its input view.
pub(crate) type TransformFn<T, U> = Arc<dyn Fn(StageInput<T>) -> ItemStream<U> + Send + Sync>;

/// Slot where a worker's input records an upstream fault it pulled.
/// The first fault wins; later ones are copies of errors already captured
/// at their origin.
#[derive(Debug, Default, Clone)]
pub(crate) struct FaultCell(Arc<Mutex<Option<TaskError>>>);

impl FaultCell {
    fn set(&self, err: TaskError) {
        let mut slot = self.0.lock().expect("fault cell lock");
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn is_set(&self) -> bool {
        self.0.lock().expect("fault cell lock").is_some()
    }

    fn take(&self) -> Option<TaskError> {
        self.0.lock().expect("fault cell lock").take()
    }
}

/// The lazy input sequence a transformer stage function consumes.
///
/// Yields user items pulled from the shared input channel. The sequence is
/// finite and non-restartable: it ends at the first terminating frame this
/// worker pulls, or once the channel is closed and drained. Items may
/// arrive in any order relative to other workers of the same stage.
pub struct StageInput<T> {
    rx: Pin<Box<async_channel::Receiver<Frame<T>>>>,
    fault: FaultCell,
    done: bool,
}

impl<T> StageInput<T> {
    pub(crate) fn new(rx: async_channel::Receiver<Frame<T>>, fault: FaultCell) -> Self {
        Self {
            rx: Box::pin(rx),
            fault,
            done: false,
        }
    }
}

impl<T> Stream for StageInput<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match ready!(this.rx.as_mut().poll_next(cx)) {
            Some(Frame::Item(item)) => Poll::Ready(Some(item)),
            Some(Frame::End(_)) => {
                this.done = true;
                Poll::Ready(None)
            }
            Some(Frame::Fault(err)) => {
                this.fault.set(err);
                this.done = true;
                Poll::Ready(None)
            }
            None => {
                this.done = true;
                Poll::Ready(None)
            }
        }
    }
}

/// Everything a worker needs besides its channels.
pub(crate) struct WorkerContext {
    pub(crate) id: WorkerId,
    pub(crate) sink: Arc<ErrorSink>,
    pub(crate) metrics: Arc<Metrics>,
}

/// Why the forwarding loop stopped.
enum Forward {
    /// User stream exhausted (or upstream fault observed).
    Completed,
    /// User stream yielded an error.
    Failed(TaskError),
    /// Output channel closed under us; the pipeline was cancelled.
    Cancelled,
}

/// Drive the user stream, forwarding items downstream.
///
/// Stops forwarding as soon as an upstream fault has been recorded, so no
/// output produced after the fault is observed leaves this worker.
async fn forward<T>(
    ctx: &WorkerContext,
    mut stream: ItemStream<T>,
    output: &Channel<Frame<T>>,
    fault: &FaultCell,
) -> Forward {
    while let Some(next) = stream.next().await {
        match next {
            Ok(item) => {
                if fault.is_set() {
                    return Forward::Completed;
                }
                if output.put(Frame::Item(item)).await.is_err() {
                    tracing::debug!("worker {}: output channel closed, stopping", ctx.id);
                    return Forward::Cancelled;
                }
                ctx.metrics.add_item();
            }
            Err(err) => {
                return Forward::Failed(TaskError::from_anyhow(ctx.id.clone(), &err));
            }
        }
    }
    Forward::Completed
}

/// Discard everything remaining on the input channel until it is closed
/// and drained, so upstream workers are never left blocked on a full
/// channel.
async fn drain<T>(input: &Channel<Frame<T>>) {
    while input.get().await.is_some() {}
}

/// Emit the worker's single terminating frame.
async fn emit_marker<T>(ctx: &WorkerContext, output: &Channel<Frame<T>>, frame: Frame<T>) {
    if output.put(frame).await.is_ok() {
        ctx.metrics.add_marker();
    }
}

/// Run one producer worker: no input channel, the stage function is
/// invoked with its captured state only.
pub(crate) async fn run_producer<T>(ctx: WorkerContext, make: ProduceFn<T>, output: Channel<Frame<T>>)
where
    T: Send + 'static,
{
    tracing::debug!("worker {} started", ctx.id);
    let stream = make();
    match forward(&ctx, stream, &output, &FaultCell::default()).await {
        Forward::Cancelled => {}
        Forward::Failed(err) => {
            tracing::warn!("worker {} failed: {}", ctx.id, err);
            ctx.sink.record(err.clone());
            ctx.metrics.add_fault();
            emit_marker(&ctx, &output, Frame::Fault(err)).await;
        }
        Forward::Completed => {
            emit_marker(&ctx, &output, Frame::End(ctx.id.clone())).await;
        }
    }
    tracing::debug!("worker {} finished", ctx.id);
}

/// Run one transformer worker: builds the input view over the shared
/// channel, drives the stage function, and handles drain mode on failure.
pub(crate) async fn run_transformer<T, U>(
    ctx: WorkerContext,
    input: Channel<Frame<T>>,
    make: TransformFn<T, U>,
    output: Channel<Frame<U>>,
) where
    T: Send + 'static,
    U: Send + 'static,
{
    tracing::debug!("worker {} started", ctx.id);
    let fault = FaultCell::default();
    let stream = make(StageInput::new(input.receiver(), fault.clone()));
    match forward(&ctx, stream, &output, &fault).await {
        Forward::Cancelled => {}
        Forward::Failed(err) => {
            tracing::warn!("worker {} failed: {}", ctx.id, err);
            ctx.sink.record(err.clone());
            ctx.metrics.add_fault();
            drain(&input).await;
            emit_marker(&ctx, &output, Frame::Fault(err)).await;
        }
        Forward::Completed => match fault.take() {
            // An upstream worker failed: discard the rest of the input so
            // the predecessor is not left blocked, then pass the original
            // error along.
            Some(err) => {
                drain(&input).await;
                emit_marker(&ctx, &output, Frame::Fault(err)).await;
            }
            None => {
                emit_marker(&ctx, &output, Frame::End(ctx.id.clone())).await;
            }
        },
    }
    tracing::debug!("worker {} finished", ctx.id);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker_id(stage: &str, index: usize) -> WorkerId {
        WorkerId::new(Arc::from(stage), index)
    }

    #[tokio::test]
    async fn test_stage_input_yields_items_until_end_marker() {
        let ch = Channel::new(0);
        ch.put(Frame::Item(1)).await.unwrap();
        ch.put(Frame::Item(2)).await.unwrap();
        ch.put(Frame::End(worker_id("up", 0))).await.unwrap();
        ch.put(Frame::Item(3)).await.unwrap();

        let fault = FaultCell::default();
        let mut input = StageInput::new(ch.receiver(), fault.clone());

        assert_eq!(input.next().await, Some(1));
        assert_eq!(input.next().await, Some(2));
        // First terminating frame ends this worker's iteration; the item
        // behind it stays on the shared channel for siblings.
        assert_eq!(input.next().await, None);
        assert_eq!(input.next().await, None);
        assert!(!fault.is_set());
        assert_eq!(ch.len(), 1);
    }

    #[tokio::test]
    async fn test_stage_input_records_fault_and_ends() {
        let ch = Channel::new(0);
        let err = TaskError::new(worker_id("up", 1), "Error", "boom");
        ch.put(Frame::Item("a")).await.unwrap();
        ch.put(Frame::<&str>::Fault(err)).await.unwrap();

        let fault = FaultCell::default();
        let mut input = StageInput::new(ch.receiver(), fault.clone());

        assert_eq!(input.next().await, Some("a"));
        assert_eq!(input.next().await, None);

        let recorded = fault.take().expect("fault recorded");
        assert_eq!(recorded.worker().to_string(), "up-1");
    }

    #[tokio::test]
    async fn test_stage_input_ends_on_channel_close() {
        let ch = Channel::new(0);
        ch.put(Frame::Item(9)).await.unwrap();
        ch.close();

        let mut input = StageInput::new(ch.receiver(), FaultCell::default());
        assert_eq!(input.next().await, Some(9));
        assert_eq!(input.next().await, None);
    }

    #[tokio::test]
    async fn test_fault_cell_keeps_first_error() {
        let cell = FaultCell::default();
        cell.set(TaskError::new(worker_id("a", 0), "Error", "first"));
        cell.set(TaskError::new(worker_id("b", 0), "Error", "second"));

        assert_eq!(cell.take().unwrap().message(), "first");
        assert!(cell.take().is_none());
    }
}

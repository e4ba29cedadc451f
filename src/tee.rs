//! Fan-out: replicate one pipe's output to several independent subscriber
//! pipes (`spec.md` §4.2).
//!
//! Each subscriber gets its own buffer and consumes at its own rate; the
//! producer side is paced by whichever subscriber is slowest when buffers
//! are bounded, matching `spec.md`'s "applying backpressure uniformly"
//! requirement. A subscriber whose receiver has been dropped (cancelled or
//! failed downstream) is quietly excluded from future sends — the tee keeps
//! serving the rest and keeps pulling from the producer.

use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::metrics::TeeMetrics;
use crate::pipe::Pipe;
use async_stream::stream;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Per-subscriber channel capacity.
#[derive(Debug, Clone, Copy)]
pub enum TeeCapacity {
    /// Bounded channel; a full buffer suspends the producer.
    Bounded(usize),
    /// Unbounded channel; sends never suspend (diagnostic-only capacity).
    Unbounded,
}

enum Subscriber<T> {
    Bounded(mpsc::Sender<Result<T, PipelineError>>),
    Unbounded(mpsc::UnboundedSender<Result<T, PipelineError>>),
}

impl<T: Send + 'static> Subscriber<T> {
    async fn send(&self, item: Result<T, PipelineError>) -> bool {
        match self {
            Subscriber::Bounded(tx) => tx.send(item).await.is_ok(),
            Subscriber::Unbounded(tx) => tx.send(item).is_ok(),
        }
    }
}

/// Replicate `source`'s output to `subscriber_count` independent pipes.
///
/// Spawns one task that drives `source` to completion (or cancellation) and
/// forwards each item to every still-live subscriber. Returns the
/// subscriber pipes in the same order every time, plus a metrics handle
/// tracking each subscriber's buffered item count.
pub fn tee<T: Clone + Send + 'static>(
    mut source: Pipe<T>,
    ctx: PipelineContext,
    subscriber_count: usize,
    capacity: TeeCapacity,
) -> (Vec<Pipe<T>>, Arc<TeeMetrics>) {
    let metrics = TeeMetrics::new(subscriber_count);

    let mut senders = Vec::with_capacity(subscriber_count);
    let mut pipes = Vec::with_capacity(subscriber_count);
    for i in 0..subscriber_count {
        let m = metrics.clone();
        match capacity {
            TeeCapacity::Bounded(n) => {
                let (tx, rx) = mpsc::channel(n.max(1));
                senders.push(Subscriber::Bounded(tx));
                pipes.push(Pipe::streaming(subscriber_stream(rx, m, i)));
            }
            TeeCapacity::Unbounded => {
                let (tx, rx) = mpsc::unbounded_channel();
                senders.push(Subscriber::Unbounded(tx));
                pipes.push(Pipe::streaming(unbounded_subscriber_stream(rx, m, i)));
            }
        }
    }

    let worker_ctx = ctx.clone();
    let worker_metrics = metrics.clone();
    tokio::spawn(async move {
        let mut alive = vec![true; senders.len()];
        loop {
            let Some(item) = source.next(&worker_ctx).await else {
                break;
            };
            let terminal = item.is_err();
            for (i, sub) in senders.iter().enumerate() {
                if !alive[i] {
                    continue;
                }
                let payload = if i + 1 == senders.len() {
                    item.clone()
                } else {
                    clone_item(&item)
                };
                if sub.send(payload).await {
                    worker_metrics.subscriber_buffered[i].increment();
                } else {
                    alive[i] = false;
                }
            }
            if terminal {
                break;
            }
        }
        // Dropping `senders` here closes every channel; each subscriber
        // drains whatever is already buffered, then observes end-of-stream.
    });

    (pipes, metrics)
}

fn clone_item<T: Clone>(item: &Result<T, PipelineError>) -> Result<T, PipelineError> {
    match item {
        Ok(v) => Ok(v.clone()),
        Err(e) => Err(clone_error(e)),
    }
}

fn clone_error(e: &PipelineError) -> PipelineError {
    match e {
        PipelineError::Cancelled => PipelineError::Cancelled,
        PipelineError::BackpressureTimeout => PipelineError::BackpressureTimeout,
        other => PipelineError::Custom(other.to_string()),
    }
}

fn subscriber_stream<T: Send + 'static>(
    mut rx: mpsc::Receiver<Result<T, PipelineError>>,
    metrics: Arc<TeeMetrics>,
    index: usize,
) -> impl futures::Stream<Item = Result<T, PipelineError>> {
    stream! {
        while let Some(item) = rx.recv().await {
            metrics.subscriber_buffered[index].decrement();
            yield item;
        }
    }
}

fn unbounded_subscriber_stream<T: Send + 'static>(
    mut rx: mpsc::UnboundedReceiver<Result<T, PipelineError>>,
    metrics: Arc<TeeMetrics>,
    index: usize,
) -> impl futures::Stream<Item = Result<T, PipelineError>> {
    stream! {
        while let Some(item) = rx.recv().await {
            metrics.subscriber_buffered[index].decrement();
            yield item;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_sees_every_item() {
        let ctx = PipelineContext::new();
        let source = Pipe::materialized(vec![1, 2, 3]);
        let (pipes, _metrics) = tee(source, ctx.clone(), 3, TeeCapacity::Bounded(4));
        for pipe in pipes {
            assert_eq!(pipe.collect(&ctx).await.unwrap(), vec![1, 2, 3]);
        }
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_stall_the_others() {
        let ctx = PipelineContext::new();
        let source = Pipe::materialized(vec![1, 2, 3, 4, 5]);
        let (mut pipes, _metrics) = tee(source, ctx.clone(), 2, TeeCapacity::Bounded(1));
        let dropped = pipes.pop().unwrap();
        drop(dropped);
        let survivor = pipes.pop().unwrap();
        assert_eq!(survivor.collect(&ctx).await.unwrap(), vec![1, 2, 3, 4, 5]);
    }
}

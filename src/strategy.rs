//! Execution strategies (`spec.md` §4.5): the concurrency and backpressure
//! shape under which a transform's per-item function runs.
//!
//! [`Strategy::Sequential`] applies the function to one item at a time, in
//! order. [`ParallelStrategy`] runs it across a worker pool and reorders
//! freely, governed by a [`BackpressureMode`] once its output buffer fills.
//! [`ResilientStrategy`] wraps either of those, retrying a failing item
//! according to a [`RetryPolicy`] before giving up.

use crate::context::PipelineContext;
use crate::error::Result;
use crate::error_handling::{AlwaysRetry, NodeDecision, NodeErrorHandler};
use crate::pipe::Pipe;
use crate::retry::RetryPolicy;
use async_stream::stream;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::ReceiverStream;

type ItemFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// What a [`ParallelStrategy`] does when its output buffer is full.
#[derive(Debug, Clone, Copy)]
pub enum BackpressureMode {
    /// Suspend the producing worker until the consumer makes room.
    Blocking,
    /// Drop the item that just arrived, keeping what's already buffered.
    DropNewest,
    /// Evict the longest-buffered item to make room for the new one.
    DropOldest,
}

/// No-reordering, one-item-at-a-time execution.
pub async fn sequential_execute<I, O, F, Fut>(mut input: Pipe<I>, ctx: PipelineContext, f: F) -> Pipe<O>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O>> + Send + 'static,
{
    Pipe::streaming(stream! {
        loop {
            match input.next(&ctx).await {
                None => return,
                Some(Ok(item)) => match f(item).await {
                    Ok(out) => yield Ok(out),
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                },
                Some(Err(e)) => {
                    yield Err(e);
                    return;
                }
            }
        }
    })
}

/// Worker-pool execution: `workers` tasks pull concurrently from the shared
/// input and push results to a shared output subject to `backpressure`.
/// Output order is the order results complete in, not input order.
#[derive(Debug, Clone)]
pub struct ParallelStrategy {
    pub workers: usize,
    pub buffer: usize,
    pub backpressure: BackpressureMode,
}

impl ParallelStrategy {
    pub fn new(workers: usize, buffer: usize, backpressure: BackpressureMode) -> Self {
        Self {
            workers: workers.max(1),
            buffer: buffer.max(1),
            backpressure,
        }
    }

    pub async fn execute<I, O, F, Fut>(&self, input: Pipe<I>, ctx: PipelineContext, f: F) -> Pipe<O>
    where
        I: Send + 'static,
        O: Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        let input = Arc::new(tokio::sync::Mutex::new(input));
        let f = Arc::new(f);
        let workers = self.workers;

        match self.backpressure {
            BackpressureMode::Blocking => {
                let (tx, rx) = mpsc::channel::<Result<O>>(self.buffer);
                let sink: Arc<dyn Fn(Result<O>) -> ItemFuture + Send + Sync> =
                    Arc::new(move |item| {
                        let tx = tx.clone();
                        Box::pin(async move {
                            let _ = tx.send(item).await;
                        })
                    });
                let worker_ctx = ctx.clone();
                tokio::spawn(run_workers(workers, input, worker_ctx, f, sink));
                Pipe::streaming(ReceiverStream::new(rx))
            }
            BackpressureMode::DropNewest => {
                let (tx, rx) = mpsc::channel::<Result<O>>(self.buffer);
                let sink: Arc<dyn Fn(Result<O>) -> ItemFuture + Send + Sync> =
                    Arc::new(move |item| {
                        let tx = tx.clone();
                        Box::pin(async move {
                            let _ = tx.try_send(item);
                        })
                    });
                let worker_ctx = ctx.clone();
                tokio::spawn(run_workers(workers, input, worker_ctx, f, sink));
                Pipe::streaming(ReceiverStream::new(rx))
            }
            BackpressureMode::DropOldest => {
                let ring = RingBuffer::new(self.buffer);
                let sink_ring = ring.clone();
                let sink: Arc<dyn Fn(Result<O>) -> ItemFuture + Send + Sync> =
                    Arc::new(move |item| {
                        let ring = sink_ring.clone();
                        Box::pin(async move {
                            ring.push_drop_oldest(item);
                        })
                    });
                let close_ring = ring.clone();
                let worker_ctx = ctx.clone();
                tokio::spawn(async move {
                    run_workers(workers, input, worker_ctx, f, sink).await;
                    close_ring.close();
                });
                Pipe::streaming(ring_stream(ring))
            }
        }
    }
}

async fn run_workers<I, O, F, Fut>(
    workers: usize,
    input: Arc<tokio::sync::Mutex<Pipe<I>>>,
    ctx: PipelineContext,
    f: Arc<F>,
    sink: Arc<dyn Fn(Result<O>) -> ItemFuture + Send + Sync>,
) where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O>> + Send + 'static,
{
    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let input = input.clone();
        let ctx = ctx.clone();
        let f = f.clone();
        let sink = sink.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let item = {
                    let mut guard = input.lock().await;
                    guard.next(&ctx).await
                };
                match item {
                    None => break,
                    Some(Ok(value)) => {
                        let result = f(value).await;
                        let terminal = result.is_err();
                        sink(result).await;
                        if terminal {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        sink(Err(e)).await;
                        break;
                    }
                }
            }
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
}

/// A bounded queue that evicts its oldest item on overflow rather than
/// suspending the writer, backing [`BackpressureMode::DropOldest`].
struct RingBuffer<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
}

impl<T: Send + 'static> RingBuffer<T> {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    fn push_drop_oldest(&self, item: T) {
        {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() >= self.capacity {
                queue.pop_front();
            }
            queue.push_back(item);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut queue = self.queue.lock().unwrap();
                if let Some(item) = queue.pop_front() {
                    return Some(item);
                }
                if self.closed.load(Ordering::Relaxed) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }
}

fn ring_stream<T: Send + 'static>(ring: Arc<RingBuffer<T>>) -> impl futures::Stream<Item = T> {
    stream! {
        while let Some(item) = ring.pop().await {
            yield item;
        }
    }
}

/// Wraps `inner`'s concurrency shape and, on per-item failure, consults a
/// [`NodeErrorHandler`] for the `Skip`/`Retry`/`Fail` decision
/// (`spec.md` §4.5 Resilient, §4.11). `Retry` re-invokes the item under
/// `retry`'s backoff schedule until it succeeds or the policy is exhausted,
/// at which point it's treated as `Fail`. Cancellation is never retried or
/// handed to the handler — it propagates immediately. Defaults to
/// [`AlwaysRetry`], so wrapping a strategy as Resilient retries transient
/// failures without any extra configuration.
pub struct ResilientStrategy {
    pub inner: Strategy,
    pub retry: RetryPolicy,
    pub error_handler: Arc<dyn NodeErrorHandler>,
}

impl ResilientStrategy {
    pub fn new(inner: Strategy, retry: RetryPolicy) -> Self {
        Self {
            inner,
            retry,
            error_handler: Arc::new(AlwaysRetry),
        }
    }

    pub fn with_error_handler(mut self, handler: Arc<dyn NodeErrorHandler>) -> Self {
        self.error_handler = handler;
        self
    }

    pub async fn execute<I, O, F, Fut>(&self, input: Pipe<I>, ctx: PipelineContext, f: F) -> Pipe<O>
    where
        I: Clone + Send + 'static,
        O: Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        match &self.inner {
            Strategy::Sequential => self.execute_sequential(input, ctx, f).await,
            Strategy::Parallel(p) => self.execute_parallel(p, input, ctx, f).await,
        }
    }

    async fn execute_sequential<I, O, F, Fut>(&self, mut input: Pipe<I>, ctx: PipelineContext, f: F) -> Pipe<O>
    where
        I: Clone + Send + 'static,
        O: Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        let retry = self.retry.clone();
        let handler = self.error_handler.clone();
        Pipe::streaming(stream! {
            loop {
                match input.next(&ctx).await {
                    None => return,
                    Some(Ok(item)) => {
                        let mut attempt = 0usize;
                        loop {
                            match f(item.clone()).await {
                                Ok(out) => {
                                    yield Ok(out);
                                    break;
                                }
                                Err(e) if e.is_cancellation() => {
                                    yield Err(e);
                                    return;
                                }
                                Err(e) => match handler.decide(&e, &ctx).await {
                                    NodeDecision::Retry if retry.should_retry(attempt) => {
                                        tokio::time::sleep(retry.calculate_delay(attempt)).await;
                                        attempt += 1;
                                    }
                                    NodeDecision::Skip => break,
                                    NodeDecision::Retry | NodeDecision::Fail => {
                                        yield Err(e);
                                        return;
                                    }
                                },
                            }
                        }
                    }
                    Some(Err(e)) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        })
    }

    async fn execute_parallel<I, O, F, Fut>(
        &self,
        p: &ParallelStrategy,
        input: Pipe<I>,
        ctx: PipelineContext,
        f: F,
    ) -> Pipe<O>
    where
        I: Clone + Send + 'static,
        O: Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        let input = Arc::new(tokio::sync::Mutex::new(input));
        let f = Arc::new(f);
        let workers = p.workers;
        let handler = self.error_handler.clone();
        let retry = self.retry.clone();

        match p.backpressure {
            BackpressureMode::Blocking => {
                let (tx, rx) = mpsc::channel::<Result<O>>(p.buffer);
                let sink: Arc<dyn Fn(Result<O>) -> ItemFuture + Send + Sync> =
                    Arc::new(move |item| {
                        let tx = tx.clone();
                        Box::pin(async move {
                            let _ = tx.send(item).await;
                        })
                    });
                let worker_ctx = ctx.clone();
                tokio::spawn(run_workers_resilient(workers, input, worker_ctx, f, sink, handler, retry));
                Pipe::streaming(ReceiverStream::new(rx))
            }
            BackpressureMode::DropNewest => {
                let (tx, rx) = mpsc::channel::<Result<O>>(p.buffer);
                let sink: Arc<dyn Fn(Result<O>) -> ItemFuture + Send + Sync> =
                    Arc::new(move |item| {
                        let tx = tx.clone();
                        Box::pin(async move {
                            let _ = tx.try_send(item);
                        })
                    });
                let worker_ctx = ctx.clone();
                tokio::spawn(run_workers_resilient(workers, input, worker_ctx, f, sink, handler, retry));
                Pipe::streaming(ReceiverStream::new(rx))
            }
            BackpressureMode::DropOldest => {
                let ring = RingBuffer::new(p.buffer);
                let sink_ring = ring.clone();
                let sink: Arc<dyn Fn(Result<O>) -> ItemFuture + Send + Sync> =
                    Arc::new(move |item| {
                        let ring = sink_ring.clone();
                        Box::pin(async move {
                            ring.push_drop_oldest(item);
                        })
                    });
                let close_ring = ring.clone();
                let worker_ctx = ctx.clone();
                tokio::spawn(async move {
                    run_workers_resilient(workers, input, worker_ctx, f, sink, handler, retry).await;
                    close_ring.close();
                });
                Pipe::streaming(ring_stream(ring))
            }
        }
    }
}

/// Like [`run_workers`] but consults `handler` on each per-item failure,
/// retrying under `retry` on a `Retry` decision and dropping the item
/// silently on `Skip` instead of unconditionally ending the worker.
async fn run_workers_resilient<I, O, F, Fut>(
    workers: usize,
    input: Arc<tokio::sync::Mutex<Pipe<I>>>,
    ctx: PipelineContext,
    f: Arc<F>,
    sink: Arc<dyn Fn(Result<O>) -> ItemFuture + Send + Sync>,
    handler: Arc<dyn NodeErrorHandler>,
    retry: RetryPolicy,
) where
    I: Clone + Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O>> + Send + 'static,
{
    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let input = input.clone();
        let ctx = ctx.clone();
        let f = f.clone();
        let sink = sink.clone();
        let handler = handler.clone();
        let retry = retry.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let item = {
                    let mut guard = input.lock().await;
                    guard.next(&ctx).await
                };
                match item {
                    None => break,
                    Some(Ok(value)) => {
                        let mut attempt = 0usize;
                        loop {
                            match f(value.clone()).await {
                                Ok(out) => {
                                    sink(Ok(out)).await;
                                    break;
                                }
                                Err(e) if e.is_cancellation() => {
                                    sink(Err(e)).await;
                                    return;
                                }
                                Err(e) => match handler.decide(&e, &ctx).await {
                                    NodeDecision::Retry if retry.should_retry(attempt) => {
                                        tokio::time::sleep(retry.calculate_delay(attempt)).await;
                                        attempt += 1;
                                    }
                                    NodeDecision::Skip => break,
                                    NodeDecision::Retry | NodeDecision::Fail => {
                                        sink(Err(e)).await;
                                        return;
                                    }
                                },
                            }
                        }
                    }
                    Some(Err(e)) => {
                        sink(Err(e)).await;
                        break;
                    }
                }
            }
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
}

/// The non-resilient strategies, collected so [`ResilientStrategy`] can wrap
/// either without being generic over a shared trait.
pub enum Strategy {
    Sequential,
    Parallel(ParallelStrategy),
}

impl Strategy {
    pub async fn execute<I, O, F, Fut>(&self, input: Pipe<I>, ctx: PipelineContext, f: F) -> Pipe<O>
    where
        I: Send + 'static,
        O: Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        match self {
            Strategy::Sequential => sequential_execute(input, ctx, f).await,
            Strategy::Parallel(p) => p.execute(input, ctx, f).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;

    #[tokio::test]
    async fn sequential_preserves_order() {
        let ctx = PipelineContext::new();
        let input = Pipe::materialized(vec![1, 2, 3]);
        let out = sequential_execute(input, ctx.clone(), |x: i32| async move { Ok(x * 10) }).await;
        assert_eq!(out.collect(&ctx).await.unwrap(), vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn parallel_blocking_emits_every_item() {
        let ctx = PipelineContext::new();
        let input = Pipe::materialized((0..20).collect::<Vec<i32>>());
        let strategy = ParallelStrategy::new(4, 4, BackpressureMode::Blocking);
        let out = strategy
            .execute(input, ctx.clone(), |x: i32| async move { Ok(x) })
            .await;
        let mut items = out.collect(&ctx).await.unwrap();
        items.sort();
        assert_eq!(items, (0..20).collect::<Vec<i32>>());
    }

    #[tokio::test]
    async fn resilient_retries_until_success() {
        let ctx = PipelineContext::new();
        let input = Pipe::materialized(vec![1]);
        let attempts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let retry = RetryPolicy::new(5).with_initial_interval(0.0).with_jitter(false);
        let resilient = ResilientStrategy::new(Strategy::Sequential, retry);
        let counter = attempts.clone();
        let out = resilient
            .execute(input, ctx.clone(), move |x: i32| {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    if n < 2 {
                        Err(PipelineError::Custom("transient".into()))
                    } else {
                        Ok(x)
                    }
                }
            })
            .await;
        assert_eq!(out.collect(&ctx).await.unwrap(), vec![1]);
        assert_eq!(attempts.load(std::sync::atomic::Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn resilient_skip_drops_the_item_and_keeps_the_stream_open() {
        use crate::error_handling::AlwaysSkip;

        let ctx = PipelineContext::new();
        let input = Pipe::materialized(vec![1, 2, 3]);
        let resilient = ResilientStrategy::new(Strategy::Sequential, RetryPolicy::new(0))
            .with_error_handler(Arc::new(AlwaysSkip));
        let out = resilient
            .execute(input, ctx.clone(), |x: i32| async move {
                if x == 2 {
                    Err(PipelineError::Custom("bad item".into()))
                } else {
                    Ok(x * 10)
                }
            })
            .await;
        assert_eq!(out.collect(&ctx).await.unwrap(), vec![10, 30]);
    }

    #[tokio::test]
    async fn resilient_fail_propagates_without_retrying() {
        use crate::error_handling::AlwaysFail;

        let ctx = PipelineContext::new();
        let input = Pipe::materialized(vec![1, 2, 3]);
        let attempts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let resilient = ResilientStrategy::new(Strategy::Sequential, RetryPolicy::new(5))
            .with_error_handler(Arc::new(AlwaysFail));
        let counter = attempts.clone();
        let out = resilient
            .execute(input, ctx.clone(), move |x: i32| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    if x == 2 {
                        Err(PipelineError::Custom("bad item".into()))
                    } else {
                        Ok(x)
                    }
                }
            })
            .await;
        let err = out.collect(&ctx).await.unwrap_err();
        assert!(matches!(err, PipelineError::Custom(_)));
        assert_eq!(attempts.load(std::sync::atomic::Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn resilient_parallel_skip_drops_failing_items_only() {
        use crate::error_handling::AlwaysSkip;

        let ctx = PipelineContext::new();
        let input = Pipe::materialized((0..10).collect::<Vec<i32>>());
        let resilient = ResilientStrategy::new(
            Strategy::Parallel(ParallelStrategy::new(4, 10, BackpressureMode::Blocking)),
            RetryPolicy::new(0),
        )
        .with_error_handler(Arc::new(AlwaysSkip));
        let out = resilient
            .execute(input, ctx.clone(), |x: i32| async move {
                if x % 3 == 0 {
                    Err(PipelineError::Custom("divisible by 3".into()))
                } else {
                    Ok(x)
                }
            })
            .await;
        let mut items = out.collect(&ctx).await.unwrap();
        items.sort();
        assert_eq!(items, vec![1, 2, 4, 5, 7, 8]);
    }
}

//! Batching and unbatching stream-transforms (`spec.md` §4.6).
//!
//! A [`Batcher`] groups consecutive input items into fixed-size `Vec`
//! chunks, emitting a final short batch at end-of-stream if one is pending.
//! Closure also runs on time: once a batch's first item is buffered, a
//! clock starts and the batch flushes (short of `size`) once `timespan`
//! elapses since that first item, the way the Pregel loop's own superstep
//! ticker races a deadline against the next event. An [`Unbatcher`] does
//! the reverse: each input `Vec<T>` is flattened into its elements,
//! preserving order both across and within batches.

use crate::context::PipelineContext;
use crate::node::{Dispose, StreamTransform};
use crate::pipe::Pipe;
use async_stream::stream;
use async_trait::async_trait;
use std::time::Duration;

/// Groups items into batches of `size`, flushing early if `timespan`
/// elapses since the first item of the pending batch was buffered. `None`
/// disables the time trigger entirely (batches only ever close on size or
/// end-of-stream).
pub struct Batcher {
    pub size: usize,
    pub timespan: Option<Duration>,
}

impl Batcher {
    pub fn new(size: usize) -> Self {
        Self { size: size.max(1), timespan: None }
    }

    pub fn with_timespan(size: usize, timespan: Duration) -> Self {
        Self { size: size.max(1), timespan: Some(timespan) }
    }
}

#[async_trait]
impl Dispose for Batcher {}

#[async_trait]
impl<T: Send + 'static> StreamTransform<T, Vec<T>> for Batcher {
    async fn apply(&self, mut input: Pipe<T>, ctx: &PipelineContext) -> crate::error::Result<Pipe<Vec<T>>> {
        let size = self.size;
        let timespan = self.timespan;
        let ctx = ctx.clone();
        Ok(Pipe::streaming(stream! {
            let mut batch: Vec<T> = Vec::with_capacity(size);
            loop {
                let Some(timespan) = timespan else {
                    match input.next(&ctx).await {
                        None => {
                            if !batch.is_empty() {
                                yield Ok(std::mem::take(&mut batch));
                            }
                            return;
                        }
                        Some(Ok(item)) => {
                            batch.push(item);
                            if batch.len() == size {
                                yield Ok(std::mem::replace(&mut batch, Vec::with_capacity(size)));
                            }
                        }
                        Some(Err(e)) => {
                            if !batch.is_empty() {
                                yield Ok(std::mem::take(&mut batch));
                            }
                            yield Err(e);
                            return;
                        }
                    }
                    continue;
                };

                if batch.is_empty() {
                    match input.next(&ctx).await {
                        None => return,
                        Some(Ok(item)) => {
                            batch.push(item);
                            if batch.len() == size {
                                yield Ok(std::mem::replace(&mut batch, Vec::with_capacity(size)));
                            }
                            continue;
                        }
                        Some(Err(e)) => {
                            yield Err(e);
                            return;
                        }
                    }
                }

                let deadline = tokio::time::sleep(timespan);
                tokio::pin!(deadline);
                tokio::select! {
                    item = input.next(&ctx) => {
                        match item {
                            None => {
                                yield Ok(std::mem::take(&mut batch));
                                return;
                            }
                            Some(Ok(item)) => {
                                batch.push(item);
                                if batch.len() == size {
                                    yield Ok(std::mem::replace(&mut batch, Vec::with_capacity(size)));
                                }
                            }
                            Some(Err(e)) => {
                                if !batch.is_empty() {
                                    yield Ok(std::mem::take(&mut batch));
                                }
                                yield Err(e);
                                return;
                            }
                        }
                    }
                    _ = &mut deadline => {
                        yield Ok(std::mem::replace(&mut batch, Vec::with_capacity(size)));
                    }
                }
            }
        }))
    }
}

/// Flattens batches back into their elements, in order.
pub struct Unbatcher;

#[async_trait]
impl Dispose for Unbatcher {}

#[async_trait]
impl<T: Send + 'static> StreamTransform<Vec<T>, T> for Unbatcher {
    async fn apply(&self, mut input: Pipe<Vec<T>>, ctx: &PipelineContext) -> crate::error::Result<Pipe<T>> {
        let ctx = ctx.clone();
        Ok(Pipe::streaming(stream! {
            loop {
                match input.next(&ctx).await {
                    None => return,
                    Some(Ok(batch)) => {
                        for item in batch {
                            yield Ok(item);
                        }
                    }
                    Some(Err(e)) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn batcher_groups_and_emits_trailing_partial() {
        let ctx = PipelineContext::new();
        let input = Pipe::materialized(vec![1, 2, 3, 4, 5]);
        let out = Batcher::new(2).apply(input, &ctx).await.unwrap();
        assert_eq!(
            out.collect(&ctx).await.unwrap(),
            vec![vec![1, 2], vec![3, 4], vec![5]]
        );
    }

    #[tokio::test]
    async fn unbatcher_flattens_in_order() {
        let ctx = PipelineContext::new();
        let input = Pipe::materialized(vec![vec![1, 2], vec![3], vec![4, 5, 6]]);
        let out = Unbatcher.apply(input, &ctx).await.unwrap();
        assert_eq!(out.collect(&ctx).await.unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test(start_paused = true)]
    async fn timespan_flushes_a_short_batch_before_size_is_reached() {
        use tokio::sync::mpsc;
        use tokio_stream::wrappers::UnboundedReceiverStream;

        let (tx, rx) = mpsc::unbounded_channel::<Result<i32, crate::error::PipelineError>>();
        let input = Pipe::streaming(UnboundedReceiverStream::new(rx));
        let ctx = PipelineContext::new();
        let out = Batcher::with_timespan(5, Duration::from_millis(100))
            .apply(input, &ctx)
            .await
            .unwrap();

        tx.send(Ok(1)).unwrap();
        tx.send(Ok(2)).unwrap();

        let collector = tokio::spawn(async move { out.collect(&ctx).await });
        tokio::time::advance(Duration::from_millis(150)).await;
        drop(tx);

        let batches = collector.await.unwrap().unwrap();
        assert_eq!(batches, vec![vec![1, 2]]);
    }

    #[tokio::test]
    async fn round_trip_preserves_elements() {
        let ctx = PipelineContext::new();
        let input = Pipe::materialized((0..10).collect::<Vec<i32>>());
        let batched = Batcher::new(3).apply(input, &ctx).await.unwrap();
        let flat = Unbatcher.apply(batched, &ctx).await.unwrap();
        assert_eq!(flat.collect(&ctx).await.unwrap(), (0..10).collect::<Vec<i32>>());
    }
}

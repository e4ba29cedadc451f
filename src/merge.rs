//! Fan-in: combine several pipes of the same element type into one
//! (`spec.md` §4.3).
//!
//! [`merge`] covers [`MergeStrategy::Concatenate`] (sources read fully in
//! order, one after another) and [`MergeStrategy::Interleave`] with either
//! unbounded or bounded fairness. [`merge_custom`] is the caller-supplied
//! variant: a `select` closure chooses which source to consume next out of
//! whichever are ready.

use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::pipe::Pipe;
use async_stream::stream;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use std::collections::VecDeque;

/// How a [`merge`] should interleave its input pipes.
pub enum MergeStrategy {
    /// Drain each source fully, in the order supplied, before moving to the
    /// next.
    Concatenate,
    /// Race sources; whichever produces an item first is emitted next.
    /// `max_in_flight` caps how many sources are being awaited
    /// concurrently — `None` awaits all of them for maximum fairness.
    Interleave { max_in_flight: Option<usize> },
}

/// Merge `sources` into a single pipe per `strategy`.
pub fn merge<T: Send + 'static>(
    sources: Vec<Pipe<T>>,
    ctx: PipelineContext,
    strategy: MergeStrategy,
) -> Pipe<T> {
    match strategy {
        MergeStrategy::Concatenate => Pipe::streaming(concatenate(sources, ctx)),
        MergeStrategy::Interleave { max_in_flight } => {
            Pipe::streaming(interleave(sources, ctx, max_in_flight))
        }
    }
}

/// Merge `sources` with caller-supplied selection logic. `select` is
/// invoked with the item slots currently available (one per still-live
/// source, in stable source order) and must return the index to consume
/// next out of the `Some` slots; any other index is treated as "consume the
/// first available". This is deliberately a thin primitive: most custom
/// merges (sorted-by-key, priority, quota-based) are a small `select`
/// closure over this loop.
pub fn merge_custom<T: Send + 'static>(
    mut sources: Vec<Pipe<T>>,
    ctx: PipelineContext,
    mut select: impl FnMut(&[Option<&T>]) -> usize + Send + 'static,
) -> Pipe<T>
where
    T: Send + 'static,
{
    Pipe::streaming(stream! {
        let mut peeked: Vec<Option<Result<T, PipelineError>>> = Vec::with_capacity(sources.len());
        for s in sources.iter_mut() {
            peeked.push(s.next(&ctx).await);
        }
        loop {
            if peeked.iter().all(|p| p.is_none()) {
                return;
            }
            let refs: Vec<Option<&T>> = peeked
                .iter()
                .map(|p| match p {
                    Some(Ok(v)) => Some(v),
                    _ => None,
                })
                .collect();
            if refs.iter().all(|r| r.is_none()) {
                // every remaining slot is an error or exhausted; surface the
                // first error, if any, otherwise we're done.
                if let Some(slot) = peeked.iter_mut().find(|p| matches!(p, Some(Err(_)))) {
                    if let Some(Err(e)) = slot.take() {
                        yield Err(e);
                    }
                    return;
                }
                return;
            }
            let mut chosen = select(&refs);
            if chosen >= peeked.len() || refs[chosen].is_none() {
                chosen = refs.iter().position(|r| r.is_some()).unwrap();
            }
            match peeked[chosen].take() {
                Some(Ok(v)) => {
                    yield Ok(v);
                    peeked[chosen] = sources[chosen].next(&ctx).await;
                }
                Some(Err(e)) => {
                    yield Err(e);
                    return;
                }
                None => {}
            }
        }
    })
}

fn concatenate<T: Send + 'static>(
    sources: Vec<Pipe<T>>,
    ctx: PipelineContext,
) -> impl futures::Stream<Item = Result<T, PipelineError>> {
    stream! {
        for mut source in sources {
            while let Some(item) = source.next(&ctx).await {
                let stop = item.is_err();
                yield item;
                if stop {
                    return;
                }
            }
        }
    }
}

async fn poll_one<T: Send + 'static>(
    ctx: PipelineContext,
    mut source: Pipe<T>,
) -> (Pipe<T>, Option<Result<T, PipelineError>>) {
    let item = source.next(&ctx).await;
    (source, item)
}

/// Interleave sources fairly: whichever still-live source yields its next
/// item first is the one emitted, with at most `max_in_flight` sources
/// being awaited at any moment.
fn interleave<T: Send + 'static>(
    sources: Vec<Pipe<T>>,
    ctx: PipelineContext,
    max_in_flight: Option<usize>,
) -> impl futures::Stream<Item = Result<T, PipelineError>> {
    stream! {
        let cap = max_in_flight.unwrap_or(sources.len().max(1)).max(1);
        let mut waiting: VecDeque<Pipe<T>> = sources.into_iter().collect();
        let mut in_flight = FuturesUnordered::new();

        while in_flight.len() < cap {
            let Some(source) = waiting.pop_front() else { break };
            in_flight.push(poll_one(ctx.clone(), source));
        }

        while let Some((source, item)) = in_flight.next().await {
            match item {
                Some(Ok(v)) => {
                    yield Ok(v);
                    in_flight.push(poll_one(ctx.clone(), source));
                }
                Some(Err(e)) => {
                    yield Err(e);
                    return;
                }
                None => {
                    // exhausted; backfill from the waiting queue if any source
                    // hasn't had its turn yet
                    if let Some(next_source) = waiting.pop_front() {
                        in_flight.push(poll_one(ctx.clone(), next_source));
                    }
                }
            }
            if in_flight.is_empty() && waiting.is_empty() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[tokio::test]
    async fn concatenate_drains_sources_in_order() {
        let ctx = PipelineContext::new();
        let sources = vec![
            Pipe::materialized(vec![1, 2]),
            Pipe::materialized(vec![3, 4]),
        ];
        let merged = merge(sources, ctx.clone(), MergeStrategy::Concatenate);
        assert_eq!(merged.collect(&ctx).await.unwrap(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn interleave_emits_every_item_from_every_source() {
        let ctx = PipelineContext::new();
        let sources = vec![
            Pipe::materialized(vec![1, 2, 3]),
            Pipe::materialized(vec![4, 5]),
            Pipe::materialized(vec![6]),
        ];
        let merged = merge(
            sources,
            ctx.clone(),
            MergeStrategy::Interleave { max_in_flight: None },
        );
        let items = merged.collect(&ctx).await.unwrap();
        let set: HashSet<_> = items.into_iter().collect();
        assert_eq!(set, HashSet::from([1, 2, 3, 4, 5, 6]));
    }

    #[tokio::test]
    async fn bounded_interleave_still_drains_every_source() {
        let ctx = PipelineContext::new();
        let sources = vec![
            Pipe::materialized(vec![1, 2]),
            Pipe::materialized(vec![3, 4]),
            Pipe::materialized(vec![5, 6]),
        ];
        let merged = merge(
            sources,
            ctx.clone(),
            MergeStrategy::Interleave { max_in_flight: Some(2) },
        );
        let items = merged.collect(&ctx).await.unwrap();
        let set: HashSet<_> = items.into_iter().collect();
        assert_eq!(set, HashSet::from([1, 2, 3, 4, 5, 6]));
    }
}

//! The data pipe abstraction (`spec.md` §3/§4.1): a finite, lazy,
//! single-consumer, cancellable sequence of one declared element type.
//!
//! Two concrete variants back every [`Pipe`]: [`Pipe::materialized`], an
//! index walk over an in-memory collection, and [`Pipe::streaming`], backed
//! by any `futures::Stream` whose items may themselves suspend (typically a
//! producer task reading from a channel). Both are driven through the same
//! single operation — "iterate with cancellation" — exposed here as
//! [`Pipe::next`].

use crate::context::PipelineContext;
use crate::error::PipelineError;
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;

/// A boxed, type-erased stream of fallible items, used to back the
/// [`Pipe::Streaming`] variant.
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = Result<T, PipelineError>> + Send>>;

enum PipeInner<T> {
    Materialized(std::vec::IntoIter<T>),
    Streaming(BoxStream<T>),
}

/// A typed, lazy, cancellable sequence of items (`spec.md` §4.1).
///
/// A pipe is consumed at most once end-to-end; fanning its output out to
/// multiple consumers is the tee's job (see [`crate::tee`]), not the pipe's.
pub struct Pipe<T> {
    label: Option<String>,
    inner: PipeInner<T>,
}

impl<T: Send + 'static> Pipe<T> {
    /// Wrap an in-memory collection. Iteration never suspends.
    pub fn materialized(items: Vec<T>) -> Self {
        Self {
            label: None,
            inner: PipeInner::Materialized(items.into_iter()),
        }
    }

    /// Wrap a producer stream that may suspend between items.
    pub fn streaming(stream: impl Stream<Item = Result<T, PipelineError>> + Send + 'static) -> Self {
        Self {
            label: None,
            inner: PipeInner::Streaming(Box::pin(stream)),
        }
    }

    /// An already-empty pipe, useful as a placeholder or a branch default.
    pub fn empty() -> Self {
        Self::materialized(Vec::new())
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Advance the pipe by one item. Returns `None` when the sequence is
    /// exhausted. Resolves to `Some(Err(Cancelled))` if the context's
    /// cancellation handle trips before (or while) waiting for the next item
    /// — the one suspension point every node-worker loop must pass through.
    pub async fn next(&mut self, ctx: &PipelineContext) -> Option<Result<T, PipelineError>> {
        match &mut self.inner {
            PipeInner::Materialized(iter) => {
                if ctx.is_cancelled() {
                    return Some(Err(PipelineError::Cancelled));
                }
                iter.next().map(Ok)
            }
            PipeInner::Streaming(stream) => {
                tokio::select! {
                    biased;
                    _ = ctx.cancelled() => Some(Err(PipelineError::Cancelled)),
                    item = stream.next() => item,
                }
            }
        }
    }

    /// Drain the pipe to completion, short-circuiting on the first error.
    /// Mainly useful for tests and for sinks that want the whole sequence at
    /// once.
    pub async fn collect(mut self, ctx: &PipelineContext) -> Result<Vec<T>, PipelineError> {
        let mut out = Vec::new();
        while let Some(item) = self.next(ctx).await {
            out.push(item?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn materialized_pipe_yields_items_in_order() {
        let ctx = PipelineContext::new();
        let pipe = Pipe::materialized(vec![1, 2, 3]);
        assert_eq!(pipe.collect(&ctx).await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn streaming_pipe_propagates_producer_error() {
        let ctx = PipelineContext::new();
        let pipe = Pipe::streaming(stream::iter(vec![
            Ok(1),
            Err(PipelineError::Custom("boom".into())),
        ]));
        let err = pipe.collect(&ctx).await.unwrap_err();
        assert!(matches!(err, PipelineError::Custom(_)));
    }

    #[tokio::test]
    async fn cancellation_ends_iteration_before_next_item() {
        let ctx = PipelineContext::new();
        ctx.cancel();
        let mut pipe = Pipe::materialized(vec![1, 2, 3]);
        let first = pipe.next(&ctx).await;
        assert!(matches!(first, Some(Err(PipelineError::Cancelled))));
    }
}

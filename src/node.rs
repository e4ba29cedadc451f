//! Node role contracts (`spec.md` §4.4): the seven things a graph node can
//! be, each reduced to the one lifecycle operation its role performs, plus a
//! teardown hook every role shares.
//!
//! Concrete stateful roles (tee-backed branch, merge-backed join, windowed
//! aggregate...) are built out of the primitives in [`crate::tee`],
//! [`crate::merge`], [`crate::join`], [`crate::windowed_join`] and
//! [`crate::aggregate`] rather than re-implemented here; this module defines
//! the traits the planner and runner program against.

use crate::context::PipelineContext;
use crate::error::Result;
use crate::pipe::Pipe;
use async_trait::async_trait;

/// Every node role shares an optional, idempotent-by-contract teardown hook,
/// invoked exactly once by the runner regardless of whether the node's
/// pipeline finished, was cancelled, or failed.
#[async_trait]
pub trait Dispose: Send + Sync {
    async fn dispose(&self) {}
}

/// Produces a pipe with no input of its own (`spec.md` §4.4 Source).
#[async_trait]
pub trait Source<O: Send + 'static>: Dispose {
    async fn produce(&self, ctx: &PipelineContext) -> Result<Pipe<O>>;
}

/// Maps one input pipe to one output pipe, item by item
/// (`spec.md` §4.4 Transform). The distinction from `StreamTransform` is
/// cardinality: a `Transform` emits exactly one output item per input item
/// it accepts (it may still skip items via its node-level error handler).
#[async_trait]
pub trait Transform<I: Send + 'static, O: Send + 'static>: Dispose {
    async fn apply(&self, input: Pipe<I>, ctx: &PipelineContext) -> Result<Pipe<O>>;
}

/// Maps one input pipe to one output pipe without a fixed cardinality
/// relationship between input and output items (`spec.md` §4.4
/// StreamTransform) — batching, windowing, and deduplication are typical
/// examples.
#[async_trait]
pub trait StreamTransform<I: Send + 'static, O: Send + 'static>: Dispose {
    async fn apply(&self, input: Pipe<I>, ctx: &PipelineContext) -> Result<Pipe<O>>;
}

/// Consumes an input pipe to completion and produces no output of its own
/// (`spec.md` §4.4 Sink).
#[async_trait]
pub trait Sink<I: Send + 'static>: Dispose {
    async fn consume(&self, input: Pipe<I>, ctx: &PipelineContext) -> Result<()>;
}

/// Combines two input pipes of independent element types into one output
/// pipe (`spec.md` §4.4 Join). Implemented by [`crate::join::KeyedJoin`] and
/// [`crate::windowed_join::WindowedJoin`].
#[async_trait]
pub trait Join<L: Send + 'static, R: Send + 'static, O: Send + 'static>: Dispose {
    async fn apply(&self, left: Pipe<L>, right: Pipe<R>, ctx: &PipelineContext) -> Result<Pipe<O>>;
}

/// Groups an input pipe by key and window, producing one output item per
/// closed group (`spec.md` §4.4 Aggregate, §4.9).
#[async_trait]
pub trait Aggregate<I: Send + 'static, O: Send + 'static>: Dispose {
    async fn apply(&self, input: Pipe<I>, ctx: &PipelineContext) -> Result<Pipe<O>>;
}

/// Combines N input pipes of the same element type with caller-supplied
/// selection logic (`spec.md` §4.4 CustomMerge).
#[async_trait]
pub trait CustomMerge<T: Send + 'static>: Dispose {
    async fn apply(&self, inputs: Vec<Pipe<T>>, ctx: &PipelineContext) -> Result<Pipe<T>>;
}

//! Error handler contracts (`spec.md` §4.11/§7): node-level recovery comes
//! first, escalating to the pipeline-level handler only when a node
//! declines to recover, and the run aborts only when the pipeline-level
//! handler also declines.

use crate::context::PipelineContext;
use crate::error::PipelineError;
use async_trait::async_trait;

/// What a node does with a failure raised while processing one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeDecision {
    /// Drop the offending item and keep processing the rest of the pipe.
    Skip,
    /// Re-run the operation on the same item (typically under a
    /// [`crate::retry::RetryPolicy`] via [`crate::strategy::ResilientStrategy`]).
    Retry,
    /// Give up on this node; the error escalates to the pipeline-level
    /// handler.
    Fail,
}

/// Decides how a node responds to an item-level failure.
#[async_trait]
pub trait NodeErrorHandler: Send + Sync {
    async fn decide(&self, error: &PipelineError, ctx: &PipelineContext) -> NodeDecision;
}

/// A handler that always escalates — the default when a node declares no
/// handler of its own.
pub struct AlwaysFail;

#[async_trait]
impl NodeErrorHandler for AlwaysFail {
    async fn decide(&self, _error: &PipelineError, _ctx: &PipelineContext) -> NodeDecision {
        NodeDecision::Fail
    }
}

/// A handler that always skips the offending item.
pub struct AlwaysSkip;

#[async_trait]
impl NodeErrorHandler for AlwaysSkip {
    async fn decide(&self, _error: &PipelineError, _ctx: &PipelineContext) -> NodeDecision {
        NodeDecision::Skip
    }
}

/// A handler that always asks for a retry — the default
/// [`crate::strategy::ResilientStrategy`] consults when the caller hasn't
/// configured one of its own, so wrapping a strategy as Resilient retries
/// transient failures out of the box.
pub struct AlwaysRetry;

#[async_trait]
impl NodeErrorHandler for AlwaysRetry {
    async fn decide(&self, _error: &PipelineError, _ctx: &PipelineContext) -> NodeDecision {
        NodeDecision::Retry
    }
}

/// What the pipeline does with a failure a node has escalated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineDecision {
    /// Cancel every node and end the run with a `Failed` status.
    FailPipeline,
    /// Let the rest of the graph keep running without the failed node's
    /// output; its downstream consumers see an ended (not failed) pipe.
    ContinueWithoutNode,
    /// Restart the failed node from scratch, replaying its upstream pipe.
    RestartNode,
}

/// Decides how the run responds to a node-level failure a node's own
/// handler has escalated.
#[async_trait]
pub trait PipelineErrorHandler: Send + Sync {
    async fn decide(&self, node_id: &str, error: &PipelineError, ctx: &PipelineContext) -> PipelineDecision;
}

/// A handler that always aborts the run — the default when no
/// pipeline-level handler is registered.
pub struct AbortOnFailure;

#[async_trait]
impl PipelineErrorHandler for AbortOnFailure {
    async fn decide(&self, _node_id: &str, _error: &PipelineError, _ctx: &PipelineContext) -> PipelineDecision {
        PipelineDecision::FailPipeline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn always_fail_escalates() {
        let ctx = PipelineContext::new();
        let decision = AlwaysFail.decide(&PipelineError::Custom("x".into()), &ctx).await;
        assert_eq!(decision, NodeDecision::Fail);
    }

    #[tokio::test]
    async fn abort_on_failure_fails_the_pipeline() {
        let ctx = PipelineContext::new();
        let decision = AbortOnFailure
            .decide("node", &PipelineError::Custom("x".into()), &ctx)
            .await;
        assert_eq!(decision, PipelineDecision::FailPipeline);
    }
}

//! Error types shared across the dataflow engine.
//!
//! A single flat enum covers every error kind the engine recognises (see
//! `spec.md` §7): construction-time failures raised by the planner, and
//! per-item/per-node failures raised while a graph is running. Node-level
//! recovery (retry/skip) is preferred; only un-recovered errors reach the
//! pipeline-level handler, and only un-recovered pipeline-level errors abort
//! a run. The engine itself never uses errors for control flow — they are
//! reserved for genuinely exceptional conditions raised by user code, the
//! host platform, or cooperative cancellation.

use thiserror::Error;

/// Convenience alias for `Result<T, PipelineError>`.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors raised while building, validating, or running a dataflow graph.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The run's cancellation handle was tripped. Every pipe ends its
    /// sequence with this error at the next suspension point.
    #[error("cancelled")]
    Cancelled,

    /// The builder produced an illegal graph. Raised by the planner before
    /// any worker starts; never raised mid-run.
    #[error("graph validation failed: {0}")]
    GraphValidation(String),

    /// A key selector, join projection, or edge connection inferred
    /// incompatible element types. Raised at operator-construction time.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// A user transform raised on one item. Routed to the node's error
    /// handler, which decides to skip, retry, or fail the stage.
    #[error("item failed in node '{node}': {source}")]
    ItemFailure {
        node: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A branch side-handler raised. Carries the node id, the index of the
    /// failing handler, and the underlying error.
    #[error("branch '{node}' handler #{handler_index} failed: {source}")]
    BranchHandlerFailure {
        node: String,
        handler_index: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A pipe's producer ended with an error; surfaces to the consuming
    /// node as an `ItemFailure` once it reaches a node boundary.
    #[error("upstream failure: {0}")]
    UpstreamFailure(Box<dyn std::error::Error + Send + Sync>),

    /// A bounded queue's waiter was cancelled while waiting for capacity.
    /// Treated identically to `Cancelled` by callers.
    #[error("backpressure wait cancelled")]
    BackpressureTimeout,

    /// An outer-join projection could not be derived and none was
    /// supplied by the caller.
    #[error("join '{node}' has no projection for an unmatched {side} item")]
    MissingJoinProjection { node: String, side: &'static str },

    /// Application-defined error not covered by another variant.
    #[error("{0}")]
    Custom(String),
}

impl PipelineError {
    pub fn item_failure(
        node: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::ItemFailure {
            node: node.into(),
            source: Box::new(source),
        }
    }

    pub fn branch_handler_failure(
        node: impl Into<String>,
        handler_index: usize,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::BranchHandlerFailure {
            node: node.into(),
            handler_index,
            source: Box::new(source),
        }
    }

    pub fn upstream(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::UpstreamFailure(Box::new(source))
    }

    /// Whether this error represents cancellation (directly, or a
    /// backpressure wait cut short by cancellation).
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::BackpressureTimeout)
    }
}

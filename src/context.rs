//! Per-run pipeline context: cancellation, passthrough options, node identity.
//!
//! `spec.md` §3 describes the context as "a per-run bag providing: recognized
//! options... as a string-to-value mapping; a cancellation handle; the id of
//! the currently executing node; an opaque logger and tracer; and an optional
//! pipeline-level error handler." The logger/tracer fields are realised as
//! ambient `tracing` spans rather than threaded objects (see `SPEC_FULL.md`
//! §2): a node's context carries the `tracing::Span` its worker should be
//! executing inside, which nodes may use to attach additional fields.

use crate::error_handling::{AbortOnFailure, PipelineErrorHandler};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Recognised context option keys (`spec.md` §3). Any other key is passed
/// through untouched for consumers outside the core.
pub mod keys {
    pub const COUNT: &str = "count";
    pub const BATCH_SIZE: &str = "batchSize";
    pub const PARALLELISM: &str = "parallelism";
    pub const ERROR_RATE: &str = "errorRate";
    pub const CANCEL_AT: &str = "cancelAt";
    pub const BRANCH_CAP: &str = "branchCap";
}

/// A per-run bag of cancellation handle, passthrough options, and node
/// identity, cloned cheaply (an `Arc` underneath) and handed to every worker
/// the runner launches.
#[derive(Clone)]
pub struct PipelineContext {
    cancellation: CancellationToken,
    parameters: Arc<HashMap<String, Value>>,
    current_node: Option<Arc<str>>,
    span: tracing::Span,
    error_handler: Arc<dyn PipelineErrorHandler>,
}

impl PipelineContext {
    /// A fresh context for a new run, with an empty options map, a root
    /// cancellation token, and the default (`AbortOnFailure`) pipeline error
    /// handler.
    pub fn new() -> Self {
        Self {
            cancellation: CancellationToken::new(),
            parameters: Arc::new(HashMap::new()),
            current_node: None,
            span: tracing::Span::current(),
            error_handler: Arc::new(AbortOnFailure),
        }
    }

    pub fn with_parameters(mut self, parameters: HashMap<String, Value>) -> Self {
        self.parameters = Arc::new(parameters);
        self
    }

    /// Registers the pipeline-level handler the runner consults when a node
    /// escalates an item- or node-level failure (`spec.md` §4.11/§6).
    pub fn with_error_handler(mut self, handler: Arc<dyn PipelineErrorHandler>) -> Self {
        self.error_handler = handler;
        self
    }

    pub fn error_handler(&self) -> Arc<dyn PipelineErrorHandler> {
        self.error_handler.clone()
    }

    /// A context scoped to one node: carries the same cancellation token,
    /// options, and error handler, but its own node id and tracing span.
    pub fn for_node(&self, node_id: impl Into<Arc<str>>) -> Self {
        let node_id = node_id.into();
        let span = tracing::info_span!(parent: &self.span, "node", id = %node_id);
        Self {
            cancellation: self.cancellation.clone(),
            parameters: self.parameters.clone(),
            current_node: Some(node_id),
            span,
            error_handler: self.error_handler.clone(),
        }
    }

    /// A derived cancellation handle for implementing a timeout as an
    /// "ordinary cancellation on a derived handle" (`spec.md` §5). Cancelling
    /// the child does not cancel the parent; cancelling the parent always
    /// cancels every child.
    pub fn child_cancellation(&self) -> CancellationToken {
        self.cancellation.child_token()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once this run (or an ancestor timeout scope) is cancelled.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    pub fn current_node(&self) -> Option<&str> {
        self.current_node.as_deref()
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn get_raw(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }

    pub fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.parameters
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn get_duration(&self, key: &str) -> Option<Duration> {
        self.get::<f64>(key).map(Duration::from_secs_f64)
    }
}

impl Default for PipelineContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_node_preserves_cancellation_but_sets_identity() {
        let ctx = PipelineContext::new();
        let scoped = ctx.for_node("source-1");
        assert_eq!(scoped.current_node(), Some("source-1"));
        ctx.cancel();
        assert!(scoped.is_cancelled());
    }

    #[test]
    fn child_cancellation_does_not_propagate_upward() {
        let ctx = PipelineContext::new();
        let child = ctx.child_cancellation();
        child.cancel();
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn options_round_trip_through_json() {
        let mut params = HashMap::new();
        params.insert(keys::PARALLELISM.to_string(), serde_json::json!(4));
        let ctx = PipelineContext::new().with_parameters(params);
        assert_eq!(ctx.get::<u32>(keys::PARALLELISM), Some(4));
        assert_eq!(ctx.get::<u32>("missing"), None);
    }
}

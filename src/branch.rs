//! Branch/tap nodes: run side-effect handlers against each item while
//! passing the item through unchanged (`spec.md` §4.7).
//!
//! A branch's handler set is frozen the moment the first item reaches it —
//! [`Branch::add_handler`] after that point returns a
//! [`PipelineError::GraphValidation`] rather than silently racing with the
//! in-flight iteration. [`HandlerFailureMode`] controls what a failing
//! handler does to the primary stream.

use crate::context::PipelineContext;
use crate::error::{PipelineError, Result};
use crate::error_handling::PipelineDecision;
use crate::node::{Dispose, StreamTransform};
use crate::pipe::Pipe;
use async_stream::stream;
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// A side-effect handler invoked with an owned clone of each item.
pub type Handler<T> = Arc<
    dyn Fn(T) -> Pin<Box<dyn Future<Output = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>> + Send>>
        + Send
        + Sync,
>;

/// What happens to the primary stream when a handler fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerFailureMode {
    /// Surface a `BranchHandlerFailure` immediately and end the stream; the
    /// node's error handler decides whether to skip, retry, or fail.
    RouteToErrorHandler,
    /// Run every handler for the item regardless of earlier failures, then
    /// surface the first failure (if any) once all handlers have run.
    CollectAndThrow,
    /// Log the failure and keep going; the primary item still passes
    /// through.
    LogAndContinue,
}

/// A branch node: `N` side handlers plus a pass-through primary output.
pub struct Branch<T> {
    node_id: String,
    mode: HandlerFailureMode,
    handlers: Mutex<Vec<Handler<T>>>,
    started: AtomicBool,
}

impl<T: Clone + Send + Sync + 'static> Branch<T> {
    pub fn new(node_id: impl Into<String>, mode: HandlerFailureMode) -> Self {
        Self {
            node_id: node_id.into(),
            mode,
            handlers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// A single-handler branch defaulting to `LogAndContinue`, the common
    /// "tap" shape: observe every item, never affect the primary stream.
    pub fn tap(node_id: impl Into<String>, handler: Handler<T>) -> Self {
        let branch = Self::new(node_id, HandlerFailureMode::LogAndContinue);
        branch.add_handler(handler).expect("fresh branch is never frozen");
        branch
    }

    /// Register a handler. Fails once the branch has observed its first
    /// item.
    pub fn add_handler(&self, handler: Handler<T>) -> Result<()> {
        if self.started.load(Ordering::Acquire) {
            return Err(PipelineError::GraphValidation(format!(
                "branch '{}' handler set is frozen after the first item",
                self.node_id
            )));
        }
        self.handlers.lock().unwrap().push(handler);
        Ok(())
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> Dispose for Branch<T> {}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> StreamTransform<T, T> for Branch<T> {
    async fn apply(&self, mut input: Pipe<T>, ctx: &PipelineContext) -> Result<Pipe<T>> {
        let node_id = self.node_id.clone();
        let mode = self.mode;
        let ctx = ctx.clone();
        let handlers_cell: Arc<Mutex<Vec<Handler<T>>>> = {
            let guard = self.handlers.lock().unwrap();
            Arc::new(Mutex::new(guard.clone()))
        };
        self.started.store(true, Ordering::Release);

        Ok(Pipe::streaming(stream! {
            loop {
                match input.next(&ctx).await {
                    None => return,
                    Some(Ok(item)) => {
                        let handlers = handlers_cell.lock().unwrap().clone();
                        match mode {
                            // The only mode where the primary item waits on the
                            // handlers; they still run concurrently with each
                            // other, just not with what comes after this item.
                            HandlerFailureMode::CollectAndThrow => {
                                let tasks: Vec<_> = handlers
                                    .iter()
                                    .cloned()
                                    .enumerate()
                                    .map(|(index, handler)| {
                                        let item = item.clone();
                                        tokio::spawn(async move { (index, handler(item).await) })
                                    })
                                    .collect();
                                let mut first_failure: Option<(usize, Box<dyn std::error::Error + Send + Sync>)> = None;
                                for task in tasks {
                                    if let Ok((index, Err(err))) = task.await {
                                        if first_failure.is_none() {
                                            first_failure = Some((index, err));
                                        }
                                    }
                                }
                                if let Some((index, err)) = first_failure {
                                    yield Err(PipelineError::branch_handler_failure(node_id.clone(), index, err));
                                    return;
                                }
                            }
                            // Handlers run detached from the primary stream; a
                            // failure escalates to the pipeline handler on its
                            // own schedule rather than blocking this item.
                            HandlerFailureMode::RouteToErrorHandler => {
                                for (index, handler) in handlers.iter().cloned().enumerate() {
                                    let item = item.clone();
                                    let node_id = node_id.clone();
                                    let ctx = ctx.clone();
                                    tokio::spawn(async move {
                                        if let Err(err) = handler(item).await {
                                            let error = PipelineError::branch_handler_failure(node_id.clone(), index, err);
                                            // RestartNode is meaningless for a side handler; treated as continue.
                                            match ctx.error_handler().decide(&node_id, &error, &ctx).await {
                                                PipelineDecision::FailPipeline => {
                                                    tracing::error!(node = %node_id, handler = index, error = %error, "branch handler failed; cancelling run");
                                                    ctx.cancel();
                                                }
                                                PipelineDecision::ContinueWithoutNode | PipelineDecision::RestartNode => {
                                                    tracing::warn!(node = %node_id, handler = index, error = %error, "branch handler failed; continuing");
                                                }
                                            }
                                        }
                                    });
                                }
                            }
                            HandlerFailureMode::LogAndContinue => {
                                for (index, handler) in handlers.iter().cloned().enumerate() {
                                    let item = item.clone();
                                    let node_id = node_id.clone();
                                    tokio::spawn(async move {
                                        if let Err(err) = handler(item).await {
                                            tracing::warn!(node = %node_id, handler = index, error = %err, "branch handler failed");
                                        }
                                    });
                                }
                            }
                        }
                        yield Ok(item);
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

#[async_trait]
impl<T: Send + Sync + 'static> Dispose for Arc<Branch<T>> {}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> StreamTransform<T, T> for Arc<Branch<T>> {
    async fn apply(&self, input: Pipe<T>, ctx: &PipelineContext) -> Result<Pipe<T>> {
        Branch::apply(self, input, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn ok_handler(counter: Arc<AtomicUsize>) -> Handler<i32> {
        Arc::new(move |_item: i32| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
        })
    }

    fn failing_handler() -> Handler<i32> {
        Arc::new(|_item: i32| {
            Box::pin(async move { Err("boom".into()) })
        })
    }

    #[tokio::test]
    async fn handlers_observe_every_item_and_passthrough_is_unchanged() {
        let ctx = PipelineContext::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let branch = Branch::new("tap", HandlerFailureMode::LogAndContinue);
        branch.add_handler(ok_handler(seen.clone())).unwrap();
        let input = Pipe::materialized(vec![1, 2, 3]);
        let out = branch.apply(input, &ctx).await.unwrap();
        assert_eq!(out.collect(&ctx).await.unwrap(), vec![1, 2, 3]);
        assert_eq!(seen.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn adding_a_handler_after_first_item_is_rejected() {
        let ctx = PipelineContext::new();
        let branch = Branch::new("tap", HandlerFailureMode::LogAndContinue);
        let input = Pipe::materialized(vec![1]);
        let out = branch.apply(input, &ctx).await.unwrap();
        let _ = out.collect(&ctx).await.unwrap();
        assert!(branch.add_handler(failing_handler()).is_err());
    }

    #[tokio::test]
    async fn route_to_error_handler_cancels_the_run_on_failure() {
        // Handlers run detached from the primary stream, so the primary
        // items still pass through; the escalation lands on the context's
        // cancellation token once the pipeline-level handler decides.
        let ctx = PipelineContext::new();
        let branch = Branch::new("tap", HandlerFailureMode::RouteToErrorHandler);
        branch.add_handler(failing_handler()).unwrap();
        let input = Pipe::materialized(vec![1, 2, 3]);
        let out = branch.apply(input, &ctx).await.unwrap();
        let _ = out.collect(&ctx).await;
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn log_and_continue_passes_items_through_despite_failure() {
        let ctx = PipelineContext::new();
        let branch = Branch::new("tap", HandlerFailureMode::LogAndContinue);
        branch.add_handler(failing_handler()).unwrap();
        let input = Pipe::materialized(vec![1, 2, 3]);
        let out = branch.apply(input, &ctx).await.unwrap();
        assert_eq!(out.collect(&ctx).await.unwrap(), vec![1, 2, 3]);
    }
}

//! Executes a validated [`crate::builder::GraphBuilder`] graph
//! (`spec.md` §4.12/§6): walks nodes in topological order, wiring each
//! node's boxed output into its children's boxed inputs, draining sinks
//! concurrently so independent branches don't serialize behind one
//! another, and cooperatively cancelling the rest of the run on the first
//! unrecovered failure.

use crate::builder::{ErasedNode, Merger, Splitter};
use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::error_handling::PipelineDecision;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// Outcome of running one node's operation, after consulting the
/// pipeline-level error handler on failure.
enum NodeOutcome {
    Ran(Option<Box<dyn Any + Send>>),
    /// The handler chose `ContinueWithoutNode`: the node produced nothing,
    /// and its downstream subtree goes starved along with it.
    Skipped,
    Failed(PipelineError),
}

/// Runs `node` once, and on failure consults `ctx`'s pipeline error handler
/// (`spec.md` §4.11). `RestartNode` re-invokes the node from scratch with an
/// empty input set — meaningful for source nodes, which ignore their
/// (empty) input list and re-derive their output independently each call;
/// for any other role this is a best-effort retry the operator's own
/// `dispose`/re-init must make safe, and a second failure always escalates
/// as a hard failure rather than looping.
async fn run_node_with_escalation(
    id: &str,
    node: &Arc<dyn ErasedNode>,
    inputs: Vec<Box<dyn Any + Send>>,
    ctx: &PipelineContext,
) -> NodeOutcome {
    match node.run(inputs, ctx).await {
        Ok(result) => NodeOutcome::Ran(result),
        Err(e) if e.is_cancellation() => NodeOutcome::Failed(e),
        Err(e) => match ctx.error_handler().decide(id, &e, ctx).await {
            PipelineDecision::FailPipeline => NodeOutcome::Failed(e),
            PipelineDecision::ContinueWithoutNode => {
                tracing::warn!(node = %id, error = %e, "node failure recovered by ContinueWithoutNode; downstream subtree will be starved");
                NodeOutcome::Skipped
            }
            PipelineDecision::RestartNode => {
                tracing::warn!(node = %id, error = %e, "node failure recovered by RestartNode; re-running from scratch");
                match node.run(Vec::new(), ctx).await {
                    Ok(result) => NodeOutcome::Ran(result),
                    Err(e2) => NodeOutcome::Failed(e2),
                }
            }
        },
    }
}

/// How a run ended.
#[derive(Debug)]
pub enum RunStatus {
    Success,
    Cancelled,
    Failed(PipelineError),
}

/// A graph ready to execute, produced by [`crate::builder::GraphBuilder::build`].
pub struct Runner {
    nodes: HashMap<String, Arc<dyn ErasedNode>>,
    incoming: HashMap<String, Vec<String>>,
    outgoing: HashMap<String, Vec<String>>,
    fanout: HashMap<String, Splitter>,
    merge: HashMap<String, Merger>,
    order: Vec<String>,
}

impl Runner {
    pub(crate) fn new(
        nodes: HashMap<String, Arc<dyn ErasedNode>>,
        incoming: HashMap<String, Vec<String>>,
        outgoing: HashMap<String, Vec<String>>,
        fanout: HashMap<String, Splitter>,
        merge: HashMap<String, Merger>,
        order: Vec<String>,
    ) -> Self {
        Self {
            nodes,
            incoming,
            outgoing,
            fanout,
            merge,
            order,
        }
    }

    /// Run every node to completion (or until the first unrecovered
    /// failure cancels the rest of the graph).
    pub async fn run(&self, ctx: PipelineContext) -> RunStatus {
        let mut edges: HashMap<(String, String), Box<dyn Any + Send>> = HashMap::new();
        let mut sink_tasks = Vec::new();
        let mut failure: Option<PipelineError> = None;

        for id in &self.order {
            if failure.is_some() || ctx.is_cancelled() {
                break;
            }

            let node = self.nodes.get(id).expect("topological order references a known node");
            let parents = self.incoming.get(id).map(Vec::as_slice).unwrap_or(&[]);

            let mut inputs = Vec::with_capacity(parents.len());
            let mut starved = false;
            for parent in parents {
                match edges.remove(&(parent.clone(), id.clone())) {
                    Some(boxed) => inputs.push(boxed),
                    None => {
                        starved = true;
                        break;
                    }
                }
            }
            if starved {
                // An upstream node was skipped or never produced this edge
                // (e.g. its own starved input); this node can't run either.
                continue;
            }

            if let Some(merger) = self.merge.get(id) {
                if inputs.len() > 1 {
                    match merger(inputs, ctx.clone()) {
                        Ok(merged) => inputs = vec![merged],
                        Err(e) => {
                            ctx.cancel();
                            failure = Some(e);
                            continue;
                        }
                    }
                }
            }

            let node_ctx = ctx.for_node(id.clone());

            if node.output_type().is_none() {
                let node = node.clone();
                let id = id.clone();
                sink_tasks.push(tokio::spawn(async move {
                    match run_node_with_escalation(&id, &node, inputs, &node_ctx).await {
                        NodeOutcome::Ran(_) | NodeOutcome::Skipped => Ok(()),
                        NodeOutcome::Failed(e) => Err(e),
                    }
                }));
                continue;
            }

            match run_node_with_escalation(id, node, inputs, &node_ctx).await {
                NodeOutcome::Ran(Some(boxed)) => {
                    let children = self.outgoing.get(id).map(Vec::as_slice).unwrap_or(&[]);
                    match children.len() {
                        0 => {}
                        1 => {
                            edges.insert((id.clone(), children[0].clone()), boxed);
                        }
                        n => {
                            let splitter = self
                                .fanout
                                .get(id)
                                .expect("connect() requires set_fanout for any node with more than one outgoing edge");
                            match splitter(boxed, n, ctx.clone()) {
                                Ok(pieces) => {
                                    for (child, piece) in children.iter().cloned().zip(pieces) {
                                        edges.insert((id.clone(), child), piece);
                                    }
                                }
                                Err(e) => {
                                    ctx.cancel();
                                    failure = Some(e);
                                }
                            }
                        }
                    }
                }
                NodeOutcome::Ran(None) | NodeOutcome::Skipped => {}
                NodeOutcome::Failed(e) => {
                    ctx.cancel();
                    failure = Some(e);
                }
            }
        }

        for result in futures::future::join_all(sink_tasks).await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    ctx.cancel();
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
                Err(join_error) => {
                    ctx.cancel();
                    if failure.is_none() {
                        failure = Some(PipelineError::Custom(format!("sink task panicked: {join_error}")));
                    }
                }
            }
        }

        match failure {
            Some(e) if e.is_cancellation() => RunStatus::Cancelled,
            Some(e) => RunStatus::Failed(e),
            None if ctx.is_cancelled() => RunStatus::Cancelled,
            None => RunStatus::Success,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::GraphBuilder;
    use crate::node::{Dispose, Sink, Source, Transform};
    use crate::pipe::Pipe;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct Numbers(Vec<i64>);

    #[async_trait]
    impl Dispose for Numbers {}

    #[async_trait]
    impl Source<i64> for Numbers {
        async fn produce(&self, _ctx: &PipelineContext) -> crate::error::Result<Pipe<i64>> {
            Ok(Pipe::materialized(self.0.clone()))
        }
    }

    struct Double;

    #[async_trait]
    impl Dispose for Double {}

    #[async_trait]
    impl Transform<i64, i64> for Double {
        async fn apply(&self, mut input: Pipe<i64>, ctx: &PipelineContext) -> crate::error::Result<Pipe<i64>> {
            let items = input.collect(ctx).await?;
            Ok(Pipe::materialized(items.into_iter().map(|n| n * 2).collect()))
        }
    }

    struct SumInto(Arc<AtomicI64>);

    #[async_trait]
    impl Dispose for SumInto {}

    #[async_trait]
    impl Sink<i64> for SumInto {
        async fn consume(&self, mut input: Pipe<i64>, ctx: &PipelineContext) -> crate::error::Result<()> {
            for item in input.collect(ctx).await? {
                self.0.fetch_add(item, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn runs_a_linear_pipeline_to_a_sink() {
        let total = Arc::new(AtomicI64::new(0));
        let mut builder = GraphBuilder::new();
        builder.add_source("src", Numbers(vec![1, 2, 3])).unwrap();
        builder.add_transform::<i64, i64, _>("double", Double).unwrap();
        builder.add_sink("sum", SumInto(total.clone())).unwrap();
        builder.connect("src", "double").unwrap();
        builder.connect("double", "sum").unwrap();
        let runner = builder.build().unwrap();

        let status = runner.run(PipelineContext::new()).await;
        assert!(matches!(status, RunStatus::Success));
        assert_eq!(total.load(Ordering::SeqCst), 12);
    }

    struct AlwaysBroken;

    #[async_trait]
    impl Dispose for AlwaysBroken {}

    #[async_trait]
    impl Transform<i64, i64> for AlwaysBroken {
        async fn apply(&self, _input: Pipe<i64>, _ctx: &PipelineContext) -> crate::error::Result<Pipe<i64>> {
            Err(crate::error::PipelineError::Custom("broken transform".into()))
        }
    }

    #[tokio::test]
    async fn continue_without_node_starves_the_failed_subtree_but_not_siblings() {
        use crate::error_handling::{PipelineDecision, PipelineErrorHandler};

        struct AlwaysContinue;
        #[async_trait]
        impl PipelineErrorHandler for AlwaysContinue {
            async fn decide(
                &self,
                _node_id: &str,
                _error: &PipelineError,
                _ctx: &PipelineContext,
            ) -> PipelineDecision {
                PipelineDecision::ContinueWithoutNode
            }
        }

        let total = Arc::new(AtomicI64::new(0));
        let mut builder = GraphBuilder::new();
        builder.add_source("src", Numbers(vec![1, 2, 3])).unwrap();
        builder.add_transform::<i64, i64, _>("broken", AlwaysBroken).unwrap();
        builder.add_sink("sum", SumInto(total.clone())).unwrap();
        builder.connect("src", "broken").unwrap();
        builder.connect("broken", "sum").unwrap();
        let runner = builder.build().unwrap();

        let ctx = PipelineContext::new().with_error_handler(Arc::new(AlwaysContinue));
        let status = runner.run(ctx).await;
        assert!(matches!(status, RunStatus::Success));
        assert_eq!(total.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fans_out_to_two_sinks_via_set_fanout() {
        let total_a = Arc::new(AtomicI64::new(0));
        let total_b = Arc::new(AtomicI64::new(0));
        let mut builder = GraphBuilder::new();
        builder.add_source("src", Numbers(vec![1, 2, 3])).unwrap();
        builder.add_sink("a", SumInto(total_a.clone())).unwrap();
        builder.add_sink("b", SumInto(total_b.clone())).unwrap();
        builder
            .set_fanout::<i64>("src", crate::tee::TeeCapacity::Bounded(8))
            .unwrap();
        builder.connect("src", "a").unwrap();
        builder.connect("src", "b").unwrap();
        let runner = builder.build().unwrap();

        let status = runner.run(PipelineContext::new()).await;
        assert!(matches!(status, RunStatus::Success));
        assert_eq!(total_a.load(Ordering::SeqCst), 6);
        assert_eq!(total_b.load(Ordering::SeqCst), 6);
    }
}

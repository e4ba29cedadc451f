//! Windowed keyed aggregate (`spec.md` §4.4 Aggregate, §4.9): group a
//! watermarked pipe by key and window, folding each group with an
//! accumulator, and emit one projected result per window once a watermark
//! (or end-of-stream) closes it.
//!
//! Two forms are supported: the "simple" form ([`Aggregate::simple`]) folds
//! with a plain `(Acc, T) -> Acc` step and projects with `Acc -> O`; the
//! "advanced" form ([`Aggregate::new`]) additionally exposes the
//! closing [`Window`] and key to the projection, for aggregates whose
//! output needs to carry them.

use crate::context::PipelineContext;
use crate::error::Result;
use crate::metrics::AggregateMetrics;
use crate::pipe::Pipe;
use crate::watermark::StreamItem;
use crate::window::{Window, WindowAssigner};
use async_stream::stream;
use async_trait::async_trait;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

type KeyFn<T, K> = Arc<dyn Fn(&T) -> K + Send + Sync>;
type TimeFn<T> = Arc<dyn Fn(&T) -> i64 + Send + Sync>;
type InitFn<Acc> = Arc<dyn Fn() -> Acc + Send + Sync>;
type StepFn<Acc, T> = Arc<dyn Fn(Acc, &T) -> Acc + Send + Sync>;
type ProjectFn<Acc, K, O> = Arc<dyn Fn(Window, K, Acc) -> O + Send + Sync>;

/// A windowed keyed aggregate over a watermarked input pipe.
pub struct Aggregate<T, K, Acc, O> {
    node_id: String,
    assigner: Arc<dyn WindowAssigner>,
    key_fn: KeyFn<T, K>,
    ts_fn: TimeFn<T>,
    init: InitFn<Acc>,
    step: StepFn<Acc, T>,
    project: ProjectFn<Acc, K, O>,
    metrics: Arc<AggregateMetrics>,
}

impl<T, K, Acc, O> Aggregate<T, K, Acc, O>
where
    T: Send + 'static,
    K: Eq + Hash + Clone + Send + 'static,
    Acc: Send + 'static,
    O: Send + 'static,
{
    /// The advanced form: the projection sees the closing window and key
    /// alongside the folded accumulator.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: impl Into<String>,
        assigner: Arc<dyn WindowAssigner>,
        key_fn: KeyFn<T, K>,
        ts_fn: TimeFn<T>,
        init: InitFn<Acc>,
        step: StepFn<Acc, T>,
        project: ProjectFn<Acc, K, O>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            assigner,
            key_fn,
            ts_fn,
            init,
            step,
            project,
            metrics: AggregateMetrics::new(),
        }
    }

    pub fn metrics(&self) -> Arc<AggregateMetrics> {
        self.metrics.clone()
    }
}

impl<T, K, Acc> Aggregate<T, K, Acc, Acc>
where
    T: Send + 'static,
    K: Eq + Hash + Clone + Send + 'static,
    Acc: Send + 'static,
{
    /// The simple form: the projection is just the identity on the
    /// accumulator, ignoring window and key.
    pub fn simple(
        node_id: impl Into<String>,
        assigner: Arc<dyn WindowAssigner>,
        key_fn: KeyFn<T, K>,
        ts_fn: TimeFn<T>,
        init: InitFn<Acc>,
        step: StepFn<Acc, T>,
    ) -> Self {
        Self::new(node_id, assigner, key_fn, ts_fn, init, step, Arc::new(|_, _, acc| acc))
    }
}

impl<T, K, Acc, O> Aggregate<T, K, Acc, O>
where
    T: Send + Sync + 'static,
    K: Eq + Hash + Clone + Send + Sync + 'static,
    Acc: Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    pub async fn apply(&self, mut input: Pipe<StreamItem<T>>, ctx: &PipelineContext) -> Pipe<O> {
        let assigner = self.assigner.clone();
        let key_fn = self.key_fn.clone();
        let ts_fn = self.ts_fn.clone();
        let init = self.init.clone();
        let step = self.step.clone();
        let project = self.project.clone();
        let metrics = self.metrics.clone();
        let ctx = ctx.clone();

        Pipe::streaming(stream! {
            let mut groups: HashMap<(Window, K), Acc> = HashMap::new();
            let mut watermark = i64::MIN;

            macro_rules! close_expired {
                ($wm:expr) => {{
                    let expired: Vec<(Window, K)> = groups
                        .keys()
                        .filter(|(w, _)| w.end <= $wm)
                        .cloned()
                        .collect();
                    for key in expired {
                        let acc = groups.remove(&key).unwrap();
                        metrics.record_window_closed();
                        yield Ok(project(key.0, key.1, acc));
                    }
                }};
            }

            loop {
                match input.next(&ctx).await {
                    None => {
                        close_expired!(i64::MAX);
                        return;
                    }
                    Some(Err(e)) => {
                        yield Err(e);
                        return;
                    }
                    Some(Ok(StreamItem::Watermark(wm))) => {
                        watermark = wm;
                        close_expired!(watermark);
                    }
                    Some(Ok(StreamItem::Data(item))) => {
                        let key = key_fn(&item);
                        for w in assigner.assign(ts_fn(&item)) {
                            let slot = (w, key.clone());
                            let is_new = !groups.contains_key(&slot);
                            let acc = groups.remove(&slot).unwrap_or_else(|| init());
                            groups.insert(slot, step(acc, &item));
                            if is_new {
                                metrics.record_window_opened();
                            }
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl<T, K, Acc, O> crate::node::Dispose for Aggregate<T, K, Acc, O>
where
    T: Send + Sync + 'static,
    K: Send + Sync + 'static,
    Acc: Send + Sync + 'static,
    O: Send + Sync + 'static,
{
}

/// Adapts the watermark-driven `apply` above to the role the dynamic graph
/// builder programs against, where the element type it erases is the whole
/// watermarked stream item.
#[async_trait]
impl<T, K, Acc, O> crate::node::Aggregate<StreamItem<T>, O> for Aggregate<T, K, Acc, O>
where
    T: Send + Sync + 'static,
    K: Eq + Hash + Clone + Send + Sync + 'static,
    Acc: Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    async fn apply(&self, input: Pipe<StreamItem<T>>, ctx: &PipelineContext) -> Result<Pipe<O>> {
        Ok(self.apply(input, ctx).await)
    }
}

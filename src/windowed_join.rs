//! Time-windowed join (`spec.md` §4.4 Join, §4.9): like [`crate::join`]'s
//! keyed join, but a match additionally requires both items to fall in the
//! same assigned window. Window closure is driven by watermarks rather than
//! end-of-stream alone — once a watermark passes a window's end, that
//! window's unmatched entries are finalized and evicted, bounding memory
//! growth on an otherwise unbounded stream.

use crate::context::PipelineContext;
use crate::error::{PipelineError, Result};
use crate::metrics::JoinMetrics;
use crate::node::Dispose;
use crate::pipe::Pipe;
use crate::watermark::StreamItem;
use crate::window::{Window, WindowAssigner};
use async_stream::stream;
use async_trait::async_trait;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use crate::join::JoinKind;

type KeyFn<T, K> = Arc<dyn Fn(&T) -> K + Send + Sync>;
type TimeFn<T> = Arc<dyn Fn(&T) -> i64 + Send + Sync>;
type CombineFn<L, R, O> = Arc<dyn Fn(L, R) -> O + Send + Sync>;
type ProjectFn<T, O> = Arc<dyn Fn(T) -> O + Send + Sync>;

/// A join over two watermarked pipes, scoped by window. `ts_left`/`ts_right`
/// extract each item's event time, used to determine which window(s) it
/// belongs to; `key_left`/`key_right` extract the join key within that
/// window, independent of the timestamp.
pub struct WindowedJoin<L, R, K, O> {
    node_id: String,
    kind: JoinKind,
    assigner: Arc<dyn WindowAssigner>,
    max_capacity: Option<usize>,
    key_left: KeyFn<L, K>,
    key_right: KeyFn<R, K>,
    ts_left: TimeFn<L>,
    ts_right: TimeFn<R>,
    combine: CombineFn<L, R, O>,
    left_only: Option<ProjectFn<L, O>>,
    right_only: Option<ProjectFn<R, O>>,
    metrics: Arc<JoinMetrics>,
}

impl<L, R, K, O> WindowedJoin<L, R, K, O>
where
    L: Send + 'static,
    R: Send + 'static,
    K: Eq + Hash + Send + 'static,
    O: Send + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: impl Into<String>,
        kind: JoinKind,
        assigner: Arc<dyn WindowAssigner>,
        key_left: KeyFn<L, K>,
        key_right: KeyFn<R, K>,
        ts_left: TimeFn<L>,
        ts_right: TimeFn<R>,
        combine: CombineFn<L, R, O>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            kind,
            assigner,
            max_capacity: None,
            key_left,
            key_right,
            ts_left,
            ts_right,
            combine,
            left_only: None,
            right_only: None,
            metrics: JoinMetrics::new(),
        }
    }

    pub fn with_max_capacity(mut self, capacity: usize) -> Self {
        self.max_capacity = Some(capacity);
        self
    }

    pub fn with_left_only(mut self, f: ProjectFn<L, O>) -> Self {
        self.left_only = Some(f);
        self
    }

    pub fn with_right_only(mut self, f: ProjectFn<R, O>) -> Self {
        self.right_only = Some(f);
        self
    }

    pub fn metrics(&self) -> Arc<JoinMetrics> {
        self.metrics.clone()
    }
}

#[async_trait]
impl<L, R, K, O> Dispose for WindowedJoin<L, R, K, O>
where
    L: Send + Sync + 'static,
    R: Send + Sync + 'static,
    K: Send + Sync + 'static,
    O: Send + Sync + 'static,
{
}

impl<L, R, K, O> WindowedJoin<L, R, K, O>
where
    L: Send + Sync + 'static,
    R: Send + Sync + 'static,
    K: Eq + Hash + Clone + Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    /// Join two pipes already wrapped with a watermark generator.
    pub async fn apply(
        &self,
        mut left: Pipe<StreamItem<L>>,
        mut right: Pipe<StreamItem<R>>,
        ctx: &PipelineContext,
    ) -> Result<Pipe<O>> {
        let node_id = self.node_id.clone();
        let kind = self.kind;
        let assigner = self.assigner.clone();
        let max_capacity = self.max_capacity;
        let key_left = self.key_left.clone();
        let key_right = self.key_right.clone();
        let ts_left = self.ts_left.clone();
        let ts_right = self.ts_right.clone();
        let combine = self.combine.clone();
        let left_only = self.left_only.clone();
        let right_only = self.right_only.clone();
        let metrics = self.metrics.clone();
        let ctx = ctx.clone();

        Ok(Pipe::streaming(stream! {
            let mut left_waiting: HashMap<(Window, K), L> = HashMap::new();
            let mut right_waiting: HashMap<(Window, K), R> = HashMap::new();
            let mut left_done = false;
            let mut right_done = false;
            // A window only closes once *neither* side can still produce a
            // match for it, so the combined watermark is the minimum of the
            // two sides' watermarks, not either one alone.
            let mut left_watermark = i64::MIN;
            let mut right_watermark = i64::MIN;

            macro_rules! finalize_expired {
                ($watermark:expr) => {{
                    let expired_left: Vec<(Window, K)> = left_waiting
                        .keys()
                        .filter(|(w, _)| w.end <= $watermark)
                        .cloned()
                        .collect();
                    for key in expired_left {
                        let l = left_waiting.remove(&key).unwrap();
                        if matches!(kind, JoinKind::Left | JoinKind::Full) {
                            match &left_only {
                                Some(f) => { yield Ok(f(l)); }
                                None => {
                                    yield Err(PipelineError::MissingJoinProjection { node: node_id.clone(), side: "left" });
                                    return;
                                }
                            }
                        }
                    }
                    let expired_right: Vec<(Window, K)> = right_waiting
                        .keys()
                        .filter(|(w, _)| w.end <= $watermark)
                        .cloned()
                        .collect();
                    for key in expired_right {
                        let r = right_waiting.remove(&key).unwrap();
                        if matches!(kind, JoinKind::Right | JoinKind::Full) {
                            match &right_only {
                                Some(f) => { yield Ok(f(r)); }
                                None => {
                                    yield Err(PipelineError::MissingJoinProjection { node: node_id.clone(), side: "right" });
                                    return;
                                }
                            }
                        }
                    }
                }};
            }

            loop {
                if left_done && right_done {
                    return;
                }

                tokio::select! {
                    biased;
                    item = left.next(&ctx), if !left_done => {
                        match item {
                            None => {
                                left_done = true;
                                left_watermark = i64::MAX;
                                finalize_expired!(left_watermark.min(right_watermark));
                            }
                            Some(Err(e)) => { yield Err(e); return; }
                            Some(Ok(StreamItem::Watermark(wm))) => {
                                left_watermark = wm;
                                finalize_expired!(left_watermark.min(right_watermark));
                            }
                            Some(Ok(StreamItem::Data(l))) => {
                                let k = key_left(&l);
                                let windows = assigner.assign(ts_left(&l));
                                let mut matched = false;
                                for w in &windows {
                                    let slot = (*w, k.clone());
                                    if let Some(r) = right_waiting.remove(&slot) {
                                        metrics.record_match();
                                        yield Ok(combine(l, r));
                                        matched = true;
                                        break;
                                    }
                                }
                                if !matched {
                                    if let Some(w) = windows.into_iter().next() {
                                        let slot = (w, k);
                                        if !left_waiting.contains_key(&slot)
                                            && !max_capacity.map_or(false, |cap| left_waiting.len() >= cap)
                                        {
                                            left_waiting.insert(slot, l);
                                            metrics.left_waiting.set(left_waiting.len() as u64);
                                        } else {
                                            metrics.record_discard();
                                        }
                                    }
                                }
                            }
                        }
                    }
                    item = right.next(&ctx), if !right_done => {
                        match item {
                            None => {
                                right_done = true;
                                right_watermark = i64::MAX;
                                finalize_expired!(left_watermark.min(right_watermark));
                            }
                            Some(Err(e)) => { yield Err(e); return; }
                            Some(Ok(StreamItem::Watermark(wm))) => {
                                right_watermark = wm;
                                finalize_expired!(left_watermark.min(right_watermark));
                            }
                            Some(Ok(StreamItem::Data(r))) => {
                                let k = key_right(&r);
                                let windows = assigner.assign(ts_right(&r));
                                let mut matched = false;
                                for w in &windows {
                                    let slot = (*w, k.clone());
                                    if let Some(l) = left_waiting.remove(&slot) {
                                        metrics.record_match();
                                        yield Ok(combine(l, r));
                                        matched = true;
                                        break;
                                    }
                                }
                                if !matched {
                                    if let Some(w) = windows.into_iter().next() {
                                        let slot = (w, k);
                                        if !right_waiting.contains_key(&slot)
                                            && !max_capacity.map_or(false, |cap| right_waiting.len() >= cap)
                                        {
                                            right_waiting.insert(slot, r);
                                            metrics.right_waiting.set(right_waiting.len() as u64);
                                        } else {
                                            metrics.record_discard();
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }))
    }
}

/// Adapts the watermark-driven `apply` above to the role the dynamic graph
/// builder programs against, where the element type it erases on each side
/// is the whole watermarked stream item.
#[async_trait]
impl<L, R, K, O> crate::node::Join<StreamItem<L>, StreamItem<R>, O> for WindowedJoin<L, R, K, O>
where
    L: Send + Sync + 'static,
    R: Send + Sync + 'static,
    K: Eq + Hash + Clone + Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    async fn apply(&self, left: Pipe<StreamItem<L>>, right: Pipe<StreamItem<R>>, ctx: &PipelineContext) -> Result<Pipe<O>> {
        self.apply(left, right, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watermark::BoundedOutOfOrderness;
    use crate::window::Tumbling;
    use std::time::Duration;

    #[tokio::test]
    async fn matches_items_that_fall_in_the_same_window() {
        let ctx = PipelineContext::new();
        let wm_gen = BoundedOutOfOrderness::new(Duration::from_secs(0), Duration::from_secs(1));
        let left = wm_gen.generate(
            Pipe::materialized(vec![(1, 0i64, "a")]),
            ctx.clone(),
            |(_, ts, _)| *ts,
        );
        let right = wm_gen.generate(
            Pipe::materialized(vec![(1, 5i64, "x")]),
            ctx.clone(),
            |(_, ts, _)| *ts,
        );
        let assigner: Arc<dyn WindowAssigner> = Arc::new(Tumbling::new(Duration::from_secs(10)));
        let join: WindowedJoin<(i32, i64, &str), (i32, i64, &str), i32, String> = WindowedJoin::new(
            "wjoin",
            JoinKind::Inner,
            assigner,
            Arc::new(|l: &(i32, i64, &str)| l.0),
            Arc::new(|r: &(i32, i64, &str)| r.0),
            Arc::new(|l: &(i32, i64, &str)| l.1),
            Arc::new(|r: &(i32, i64, &str)| r.1),
            Arc::new(|l: (i32, i64, &str), r: (i32, i64, &str)| format!("{}-{}", l.2, r.2)),
        );
        let out = join.apply(left, right, &ctx).await.unwrap();
        let items: Vec<String> = out
            .collect(&ctx)
            .await
            .unwrap();
        assert_eq!(items, vec!["a-x".to_string()]);
    }
}

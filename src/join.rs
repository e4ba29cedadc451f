//! Keyed join (`spec.md` §4.4 Join, §4.9): match items from two pipes by a
//! derived key, each side buffered in its own waiting table until its
//! counterpart arrives.
//!
//! Duplicate keys are resolved first-wins: if a key already has an entry
//! waiting on one side, a later arrival on that same side with the same key
//! is discarded (tracked in [`JoinMetrics::discarded`]) rather than
//! overwriting or queueing behind it. `max_capacity`, if set, bounds each
//! waiting table the same way — once full, a new unmatched key is
//! discarded instead of growing the table further.

use crate::context::PipelineContext;
use crate::error::{PipelineError, Result};
use crate::metrics::JoinMetrics;
use crate::node::{Dispose, Join};
use crate::pipe::Pipe;
use async_stream::stream;
use async_trait::async_trait;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

/// Which unmatched items a join preserves at end-of-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    /// Unmatched items on either side are dropped.
    Inner,
    /// Unmatched left items are projected via the left-only projection.
    Left,
    /// Unmatched right items are projected via the right-only projection.
    Right,
    /// Both sides' unmatched items are projected.
    Full,
}

type KeyFn<T, K> = Arc<dyn Fn(&T) -> K + Send + Sync>;
type CombineFn<L, R, O> = Arc<dyn Fn(L, R) -> O + Send + Sync>;
type ProjectFn<T, O> = Arc<dyn Fn(T) -> O + Send + Sync>;

pub struct KeyedJoin<L, R, K, O> {
    node_id: String,
    kind: JoinKind,
    max_capacity: Option<usize>,
    key_left: KeyFn<L, K>,
    key_right: KeyFn<R, K>,
    combine: CombineFn<L, R, O>,
    left_only: Option<ProjectFn<L, O>>,
    right_only: Option<ProjectFn<R, O>>,
    metrics: Arc<JoinMetrics>,
}

impl<L, R, K, O> KeyedJoin<L, R, K, O>
where
    L: Send + 'static,
    R: Send + 'static,
    K: Eq + Hash + Send + 'static,
    O: Send + 'static,
{
    pub fn new(
        node_id: impl Into<String>,
        kind: JoinKind,
        key_left: KeyFn<L, K>,
        key_right: KeyFn<R, K>,
        combine: CombineFn<L, R, O>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            kind,
            max_capacity: None,
            key_left,
            key_right,
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
impl<L, R, K, O> Dispose for KeyedJoin<L, R, K, O>
where
    L: Send + Sync + 'static,
    R: Send + Sync + 'static,
    K: Send + Sync + 'static,
    O: Send + Sync + 'static,
{
}

#[async_trait]
impl<L, R, K, O> Join<L, R, O> for KeyedJoin<L, R, K, O>
where
    L: Send + Sync + 'static,
    R: Send + Sync + 'static,
    K: Eq + Hash + Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    async fn apply(&self, mut left: Pipe<L>, mut right: Pipe<R>, ctx: &PipelineContext) -> Result<Pipe<O>> {
        let node_id = self.node_id.clone();
        let kind = self.kind;
        let max_capacity = self.max_capacity;
        let key_left = self.key_left.clone();
        let key_right = self.key_right.clone();
        let combine = self.combine.clone();
        let left_only = self.left_only.clone();
        let right_only = self.right_only.clone();
        let metrics = self.metrics.clone();
        let ctx = ctx.clone();

        Ok(Pipe::streaming(stream! {
            let mut left_waiting: HashMap<K, L> = HashMap::new();
            let mut right_waiting: HashMap<K, R> = HashMap::new();
            let mut left_done = false;
            let mut right_done = false;

            loop {
                if left_done && right_done {
                    if matches!(kind, JoinKind::Left | JoinKind::Full) {
                        for (_, l) in left_waiting.drain() {
                            match &left_only {
                                Some(f) => yield Ok(f(l)),
                                None => {
                                    yield Err(PipelineError::MissingJoinProjection { node: node_id.clone(), side: "left" });
                                    return;
                                }
                            }
                        }
                    }
                    if matches!(kind, JoinKind::Right | JoinKind::Full) {
                        for (_, r) in right_waiting.drain() {
                            match &right_only {
                                Some(f) => yield Ok(f(r)),
                                None => {
                                    yield Err(PipelineError::MissingJoinProjection { node: node_id.clone(), side: "right" });
                                    return;
                                }
                            }
                        }
                    }
                    return;
                }

                tokio::select! {
                    biased;
                    item = left.next(&ctx), if !left_done => {
                        match item {
                            None => { left_done = true; }
                            Some(Err(e)) => { yield Err(e); return; }
                            Some(Ok(l)) => {
                                let k = key_left(&l);
                                if let Some(r) = right_waiting.remove(&k) {
                                    metrics.record_match();
                                    yield Ok(combine(l, r));
                                } else if left_waiting.contains_key(&k) {
                                    metrics.record_discard();
                                } else if max_capacity.map_or(false, |cap| left_waiting.len() >= cap) {
                                    metrics.record_discard();
                                } else {
                                    left_waiting.insert(k, l);
                                    metrics.left_waiting.set(left_waiting.len() as u64);
                                }
                            }
                        }
                    }
                    item = right.next(&ctx), if !right_done => {
                        match item {
                            None => { right_done = true; }
                            Some(Err(e)) => { yield Err(e); return; }
                            Some(Ok(r)) => {
                                let k = key_right(&r);
                                if let Some(l) = left_waiting.remove(&k) {
                                    metrics.record_match();
                                    yield Ok(combine(l, r));
                                } else if right_waiting.contains_key(&k) {
                                    metrics.record_discard();
                                } else if max_capacity.map_or(false, |cap| right_waiting.len() >= cap) {
                                    metrics.record_discard();
                                } else {
                                    right_waiting.insert(k, r);
                                    metrics.right_waiting.set(right_waiting.len() as u64);
                                }
                            }
                        }
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inner_join_matches_by_key_and_drops_unmatched() {
        let ctx = PipelineContext::new();
        let left = Pipe::materialized(vec![(1, "a"), (2, "b")]);
        let right = Pipe::materialized(vec![(2, "x"), (3, "y")]);
        let join: KeyedJoin<(i32, &str), (i32, &str), i32, String> = KeyedJoin::new(
            "join",
            JoinKind::Inner,
            Arc::new(|l: &(i32, &str)| l.0),
            Arc::new(|r: &(i32, &str)| r.0),
            Arc::new(|l, r: (i32, &str)| format!("{}-{}", l.1, r.1)),
        );
        let out = join.apply(left, right, &ctx).await.unwrap();
        assert_eq!(out.collect(&ctx).await.unwrap(), vec!["b-x".to_string()]);
    }

    #[tokio::test]
    async fn full_outer_join_projects_unmatched_both_sides() {
        let ctx = PipelineContext::new();
        let left = Pipe::materialized(vec![(1, "a")]);
        let right = Pipe::materialized(vec![(2, "x")]);
        let join: KeyedJoin<(i32, &str), (i32, &str), i32, String> = KeyedJoin::new(
            "join",
            JoinKind::Full,
            Arc::new(|l: &(i32, &str)| l.0),
            Arc::new(|r: &(i32, &str)| r.0),
            Arc::new(|l, r: (i32, &str)| format!("{}-{}", l.1, r.1)),
        )
        .with_left_only(Arc::new(|l: (i32, &str)| format!("{}-_", l.1)))
        .with_right_only(Arc::new(|r: (i32, &str)| format!("_-{}", r.1)));
        let out = join.apply(left, right, &ctx).await.unwrap();
        let mut items = out.collect(&ctx).await.unwrap();
        items.sort();
        assert_eq!(items, vec!["_-x".to_string(), "a-_".to_string()]);
    }

    #[tokio::test]
    async fn outer_join_without_projection_errors_at_finalize() {
        let ctx = PipelineContext::new();
        let left = Pipe::materialized(vec![(1, "a")]);
        let right: Pipe<(i32, &str)> = Pipe::materialized(vec![]);
        let join: KeyedJoin<(i32, &str), (i32, &str), i32, String> = KeyedJoin::new(
            "join",
            JoinKind::Left,
            Arc::new(|l: &(i32, &str)| l.0),
            Arc::new(|r: &(i32, &str)| r.0),
            Arc::new(|l, r: (i32, &str)| format!("{}-{}", l.1, r.1)),
        );
        let out = join.apply(left, right, &ctx).await.unwrap();
        let err = out.collect(&ctx).await.unwrap_err();
        assert!(matches!(err, PipelineError::MissingJoinProjection { .. }));
    }
}

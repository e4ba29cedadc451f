//! End-to-end scenarios exercising the core operators together, the way a
//! caller assembling a real graph would chain them.

use dataflow_core::aggregate::Aggregate;
use dataflow_core::context::PipelineContext;
use dataflow_core::join::{JoinKind, KeyedJoin};
use dataflow_core::node::{Sink, Transform};
use dataflow_core::pipe::Pipe;
use dataflow_core::strategy::{BackpressureMode, ParallelStrategy};
use dataflow_core::tee::{tee, TeeCapacity};
use dataflow_core::watermark::StreamItem;
use dataflow_core::window::{Tumbling, Window, WindowAssigner};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Identity;

#[async_trait::async_trait]
impl dataflow_core::node::Dispose for Identity {}

#[async_trait::async_trait]
impl Transform<i64, i64> for Identity {
    async fn apply(&self, input: Pipe<i64>, _ctx: &PipelineContext) -> dataflow_core::error::Result<Pipe<i64>> {
        Ok(input)
    }
}

#[tokio::test]
async fn linear_pipeline_preserves_order_for_1000_items() {
    let ctx = PipelineContext::new();
    let source = Pipe::materialized((0i64..1000).collect());
    let first = Identity.apply(source, &ctx).await.unwrap();
    let second = Identity.apply(first, &ctx).await.unwrap();
    let collected = second.collect(&ctx).await.unwrap();
    assert_eq!(collected, (0i64..1000).collect::<Vec<_>>());
}

struct CollectSink(Arc<std::sync::Mutex<Vec<i64>>>, Option<Duration>);

#[async_trait::async_trait]
impl dataflow_core::node::Dispose for CollectSink {}

#[async_trait::async_trait]
impl Sink<i64> for CollectSink {
    async fn consume(&self, mut input: Pipe<i64>, ctx: &PipelineContext) -> dataflow_core::error::Result<()> {
        while let Some(item) = input.next(ctx).await {
            let value = item?;
            if let Some(delay) = self.1 {
                tokio::time::sleep(delay).await;
            }
            self.0.lock().unwrap().push(value);
        }
        Ok(())
    }
}

#[tokio::test]
async fn branching_fanout_delivers_every_item_to_both_sinks_and_bounds_tee_memory() {
    let ctx = PipelineContext::new();
    const N: i64 = 2_000;
    let source = Pipe::materialized((0..N).collect());
    let (mut pipes, metrics) = tee(source, ctx.clone(), 2, TeeCapacity::Bounded(128));
    let slow_pipe = pipes.pop().unwrap();
    let fast_pipe = pipes.pop().unwrap();

    let fast_out = Arc::new(std::sync::Mutex::new(Vec::new()));
    let slow_out = Arc::new(std::sync::Mutex::new(Vec::new()));
    let fast_sink = CollectSink(fast_out.clone(), None);
    let slow_sink = CollectSink(slow_out.clone(), Some(Duration::from_micros(50)));

    let fast_ctx = ctx.clone();
    let slow_ctx = ctx.clone();
    let fast_start = Instant::now();
    let fast_handle = tokio::spawn(async move {
        fast_sink.consume(fast_pipe, &fast_ctx).await.unwrap();
        fast_start.elapsed()
    });
    let slow_start = Instant::now();
    let slow_handle = tokio::spawn(async move {
        slow_sink.consume(slow_pipe, &slow_ctx).await.unwrap();
        slow_start.elapsed()
    });

    let fast_elapsed = fast_handle.await.unwrap();
    let slow_elapsed = slow_handle.await.unwrap();

    assert_eq!(fast_out.lock().unwrap().len(), N as usize);
    assert_eq!(slow_out.lock().unwrap().len(), N as usize);
    assert!(slow_elapsed >= fast_elapsed);
    assert!(metrics.peak_total() <= 128 * 2);
}

#[tokio::test]
async fn batch_then_unbatch_roundtrips_and_forms_expected_batches() {
    use dataflow_core::batch::{Batcher, Unbatcher};
    let ctx = PipelineContext::new();
    let source = Pipe::materialized((0i32..10).collect());
    let batched = Batcher::new(3).apply(source, &ctx).await.unwrap();
    let batches = batched.collect(&ctx).await.unwrap();
    assert_eq!(
        batches,
        vec![vec![0, 1, 2], vec![3, 4, 5], vec![6, 7, 8], vec![9]]
    );

    let flattened = Unbatcher
        .apply(Pipe::materialized(batches), &ctx)
        .await
        .unwrap();
    assert_eq!(flattened.collect(&ctx).await.unwrap(), (0i32..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn keyed_inner_join_keeps_only_matching_keys() {
    let ctx = PipelineContext::new();
    let left = Pipe::materialized(vec![(1i32, "A"), (2, "B")]);
    let right = Pipe::materialized(vec![(2i32, 7i32), (3, 9)]);
    let join: KeyedJoin<(i32, &str), (i32, i32), i32, (i32, &str, i32)> = KeyedJoin::new(
        "inner",
        JoinKind::Inner,
        Arc::new(|l: &(i32, &str)| l.0),
        Arc::new(|r: &(i32, i32)| r.0),
        Arc::new(|l, r: (i32, i32)| (l.0, l.1, r.1)),
    );
    let out = join.apply(left, right, &ctx).await.unwrap();
    let items = out.collect(&ctx).await.unwrap();
    assert_eq!(items, vec![(2, "B", 7)]);
}

#[tokio::test]
async fn time_windowed_aggregate_emits_one_count_per_window() {
    let ctx = PipelineContext::new();
    // Event timestamps (ms): 100, 400, 900, 1200, 1800, 2100, matching
    // windows [0,1000), [1000,2000), [2000,3000) with counts 3, 2, 1.
    let input: Pipe<StreamItem<i64>> = Pipe::materialized(vec![
        StreamItem::Data(100),
        StreamItem::Data(400),
        StreamItem::Data(900),
        StreamItem::Watermark(1000),
        StreamItem::Data(1200),
        StreamItem::Data(1800),
        StreamItem::Watermark(2000),
        StreamItem::Data(2100),
    ]);

    let assigner: Arc<dyn WindowAssigner> = Arc::new(Tumbling::new(Duration::from_secs(1)));
    let agg: Aggregate<i64, (), i32, (Window, i32)> = Aggregate::new(
        "count-per-window",
        assigner,
        Arc::new(|_: &i64| ()),
        Arc::new(|ts: &i64| *ts),
        Arc::new(|| 0i32),
        Arc::new(|acc: i32, _: &i64| acc + 1),
        Arc::new(|w: Window, _key: (), acc: i32| (w, acc)),
    );
    let out = agg.apply(input, &ctx).await;
    let mut results = out.collect(&ctx).await.unwrap();
    results.sort_by_key(|(w, _)| w.start);
    assert_eq!(
        results,
        vec![
            (Window::new(0, 1000), 3),
            (Window::new(1000, 2000), 2),
            (Window::new(2000, 3000), 1),
        ]
    );
}

#[tokio::test]
async fn parallel_drop_newest_completes_without_deadlock() {
    let ctx = PipelineContext::new();
    const N: i64 = 200;
    let source = Pipe::materialized((0..N).collect());
    let completions = Arc::new(AtomicUsize::new(0));
    let strategy = ParallelStrategy::new(4, 4, BackpressureMode::DropNewest);
    let counter = completions.clone();
    let out = strategy
        .execute(source, ctx.clone(), move |x: i64| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(x)
            }
        })
        .await;
    let items = out.collect(&ctx).await.unwrap();
    assert!(!items.is_empty());
    assert!(items.len() <= N as usize);
    assert!(items.len() <= completions.load(Ordering::Relaxed));
}

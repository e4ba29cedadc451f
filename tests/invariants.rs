//! Property-style invariants checked across many randomized cases, rather
//! than the fixed scenarios in `end_to_end.rs`.

use dataflow_core::context::PipelineContext;
use dataflow_core::error::PipelineError;
use dataflow_core::pipe::Pipe;
use dataflow_core::strategy::sequential_execute;
use dataflow_core::watermark::{BoundedOutOfOrderness, StreamItem};
use dataflow_core::window::{Tumbling, WindowAssigner};
use proptest::prelude::*;
use std::time::Duration;

proptest! {
    /// Sequential execution never reorders items, for any input sequence.
    #[test]
    fn sequential_execution_preserves_order(items in prop::collection::vec(any::<i64>(), 0..200)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let expected = items.clone();
        let output = runtime.block_on(async move {
            let ctx = PipelineContext::new();
            let input = Pipe::materialized(items);
            let out = sequential_execute(input, ctx.clone(), |x: i64| async move { Ok(x) }).await;
            out.collect(&ctx).await.unwrap()
        });
        prop_assert_eq!(output, expected);
    }

    /// A tumbling window always contains the timestamp it was assigned for,
    /// is exactly `size_millis` wide, and is aligned to a multiple of that
    /// size from the epoch — so two timestamps land in the same window iff
    /// they share that aligned bucket, never a partial overlap.
    #[test]
    fn tumbling_windows_are_exclusive_and_aligned(
        timestamp in any::<i64>(),
        size_millis in 1i64..1_000_000,
    ) {
        let assigner = Tumbling::new(Duration::from_millis(size_millis as u64));
        let windows = assigner.assign(timestamp);
        prop_assert_eq!(windows.len(), 1);
        let window = windows[0];
        prop_assert!(window.contains(timestamp));
        prop_assert_eq!(window.end - window.start, size_millis);
        prop_assert_eq!(window.start.rem_euclid(size_millis), 0);
    }

    /// A watermark generator never emits a watermark lower than one it has
    /// already emitted, regardless of how out-of-order or bursty the
    /// arriving timestamps are.
    #[test]
    fn watermarks_never_regress(timestamps in prop::collection::vec(0i64..100_000, 1..30)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();
        let monotonic = runtime.block_on(async move {
            let ctx = PipelineContext::new();
            let generator = BoundedOutOfOrderness::new(Duration::from_millis(200), Duration::from_millis(50));
            let input = Pipe::streaming(async_stream::stream! {
                for ts in timestamps {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    yield Ok::<i64, PipelineError>(ts);
                }
            });
            let watermarked = generator.generate(input, ctx.clone(), |ts| *ts);
            let handle = tokio::spawn(async move { watermarked.collect(&ctx).await });
            for _ in 0..4000 {
                if handle.is_finished() {
                    break;
                }
                tokio::time::advance(Duration::from_millis(5)).await;
                tokio::task::yield_now().await;
            }
            let items = handle.await.unwrap().unwrap();
            let mut last: Option<i64> = None;
            for item in items {
                if let StreamItem::Watermark(w) = item {
                    if let Some(prev) = last {
                        if w < prev {
                            return false;
                        }
                    }
                    last = Some(w);
                }
            }
            true
        });
        prop_assert!(monotonic);
    }
}

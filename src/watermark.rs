//! Watermarks: the bounded-out-of-orderness generator that turns a plain
//! data pipe into a pipe of interleaved data and watermark items
//! (`spec.md` §4.8/§4.9).
//!
//! A watermark of value `w` asserts "no further item with event time less
//! than `w` will arrive." [`BoundedOutOfOrderness`] tracks the maximum
//! event time seen so far and periodically emits `max_seen - max_lateness`
//! as the watermark, plus a final `i64::MAX` watermark once the source is
//! exhausted so every open window gets a chance to close.

use crate::context::PipelineContext;
use crate::pipe::Pipe;
use async_stream::stream;
use std::time::Duration;

/// One element of a watermarked stream: either a data item or a watermark
/// advancing the stream's notion of event-time progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem<T> {
    Data(T),
    Watermark(i64),
}

impl<T> StreamItem<T> {
    pub fn is_watermark(&self) -> bool {
        matches!(self, StreamItem::Watermark(_))
    }

    pub fn into_data(self) -> Option<T> {
        match self {
            StreamItem::Data(v) => Some(v),
            StreamItem::Watermark(_) => None,
        }
    }
}

/// Configuration for the bounded-out-of-orderness watermark generator.
#[derive(Debug, Clone, Copy)]
pub struct BoundedOutOfOrderness {
    /// How far behind the maximum observed event time a watermark trails.
    pub max_lateness: Duration,
    /// Wall-clock period between watermark emissions.
    pub tick_interval: Duration,
}

impl Default for BoundedOutOfOrderness {
    fn default() -> Self {
        Self {
            max_lateness: Duration::from_secs(5 * 60),
            tick_interval: Duration::from_secs(30),
        }
    }
}

impl BoundedOutOfOrderness {
    pub fn new(max_lateness: Duration, tick_interval: Duration) -> Self {
        Self {
            max_lateness,
            tick_interval,
        }
    }

    /// Wrap `input` with this generator, deriving each item's event time via
    /// `extract_ts`.
    pub fn generate<T, F>(
        &self,
        mut input: Pipe<T>,
        ctx: PipelineContext,
        extract_ts: F,
    ) -> Pipe<StreamItem<T>>
    where
        T: Send + 'static,
        F: Fn(&T) -> i64 + Send + 'static,
    {
        let max_lateness_millis = self.max_lateness.as_millis() as i64;
        let tick_interval = self.tick_interval;
        Pipe::streaming(stream! {
            let mut max_seen: Option<i64> = None;
            let mut ticker = tokio::time::interval(tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    item = input.next(&ctx) => {
                        match item {
                            None => {
                                if max_seen.is_some() {
                                    yield Ok(StreamItem::Watermark(i64::MAX));
                                }
                                return;
                            }
                            Some(Ok(value)) => {
                                let ts = extract_ts(&value);
                                max_seen = Some(max_seen.map_or(ts, |m| m.max(ts)));
                                yield Ok(StreamItem::Data(value));
                            }
                            Some(Err(e)) => {
                                yield Err(e);
                                return;
                            }
                        }
                    }
                    _ = ticker.tick() => {
                        if let Some(m) = max_seen {
                            yield Ok(StreamItem::Watermark(m - max_lateness_millis));
                        }
                    }
                }
            }
        })
    }
}

/// Strip watermarks back out, yielding only data items. Used by nodes that
/// don't themselves need event-time progress but sit downstream of one that
/// does.
pub fn data_only<T: Send + 'static>(mut input: Pipe<StreamItem<T>>, ctx: PipelineContext) -> Pipe<T> {
    Pipe::streaming(stream! {
        loop {
            match input.next(&ctx).await {
                None => return,
                Some(Ok(StreamItem::Data(v))) => yield Ok(v),
                Some(Ok(StreamItem::Watermark(_))) => continue,
                Some(Err(e)) => {
                    yield Err(e);
                    return;
                }
            }
        }
    })
}

//! A typed, streaming, multi-stage dataflow graph execution engine.
//!
//! The core operators — [`pipe`], [`tee`], [`merge`], [`join`],
//! [`windowed_join`], [`aggregate`], [`window`], [`watermark`],
//! [`strategy`], [`batch`], and [`branch`] — are plain generic Rust: a
//! graph wired up by hand in Rust code never touches type erasure. The
//! [`builder`] and [`runner`] modules add a dynamic, string-keyed layer on
//! top for assembling a graph from configuration rather than from Rust
//! generics directly.

pub mod aggregate;
pub mod batch;
pub mod branch;
pub mod builder;
pub mod context;
pub mod error;
pub mod error_handling;
pub mod join;
pub mod merge;
pub mod metrics;
pub mod node;
pub mod pipe;
pub mod retry;
pub mod runner;
pub mod strategy;
pub mod tee;
pub mod watermark;
pub mod window;
pub mod windowed_join;

pub use builder::GraphBuilder;
pub use context::PipelineContext;
pub use error::{PipelineError, Result};
pub use pipe::Pipe;
pub use runner::{RunStatus, Runner};

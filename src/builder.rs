//! The dynamic graph builder (`spec.md` §4.12/§6): assembling a graph from
//! string-identified nodes and edges, the way a caller driving the engine
//! from configuration (rather than calling the typed operators directly in
//! Rust) must.
//!
//! Every node's concrete input/output types are erased behind
//! [`Box<dyn Any + Send>`] and recovered with `downcast` at wiring time,
//! with [`std::any::TypeId`] checked at `connect` time so a type mismatch
//! is caught at build time rather than panicking mid-run. The pattern is
//! the same one a dynamic, string-keyed pipeline stage registry always
//! needs: each concrete node type is wrapped in a small adapter that knows
//! how to downcast its own inputs and box its own output, and the registry
//! only ever touches nodes through that adapter's erased interface.

use crate::batch::{Batcher, Unbatcher};
use crate::branch::{Branch, Handler, HandlerFailureMode};
use crate::context::PipelineContext;
use crate::error::{PipelineError, Result};
use crate::error_handling::NodeErrorHandler;
use crate::merge::MergeStrategy;
use crate::node::{Aggregate as AggregateRole, CustomMerge, Join as JoinRole, Sink, Source, StreamTransform, Transform};
use crate::pipe::Pipe;
use crate::retry::RetryPolicy;
use crate::strategy::{BackpressureMode, ParallelStrategy, ResilientStrategy, Strategy};
use crate::tee::TeeCapacity;
use async_trait::async_trait;
use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Splits one erased output into `n` independently-consumable erased
/// outputs, in child-connection order. Registered per node via
/// [`GraphBuilder::set_fanout`] for any node whose output feeds more than
/// one downstream input — erasure otherwise has no way to know a node's
/// item type is `Clone` and therefore teeable.
pub(crate) type Splitter = Arc<dyn Fn(Box<dyn Any + Send>, usize, PipelineContext) -> Result<Vec<Box<dyn Any + Send>>> + Send + Sync>;

fn splitter_for<T: Clone + Send + 'static>(node_id: String, capacity: TeeCapacity) -> Splitter {
    Arc::new(move |boxed, n, ctx| {
        let pipe = downcast_input::<T>(&node_id, boxed)?;
        let (pipes, _metrics) = crate::tee::tee(pipe, ctx, n, capacity);
        Ok(pipes.into_iter().map(|p| Box::new(p) as Box<dyn Any + Send>).collect())
    })
}

/// Combines the several boxed pipes arriving at a node whose single input
/// slot has been opened up to fan-in via [`GraphBuilder::with_merge_strategy`]
/// into the one pipe that slot expects, using [`crate::merge::merge`].
/// Consumed at most once per run; the strategy is taken out of its cell on
/// first (and only expected) call.
pub(crate) type Merger = Arc<dyn Fn(Vec<Box<dyn Any + Send>>, PipelineContext) -> Result<Box<dyn Any + Send>> + Send + Sync>;

fn merger_for<T: Send + 'static>(node_id: String, strategy: MergeStrategy) -> Merger {
    let strategy = Mutex::new(Some(strategy));
    Arc::new(move |boxed_inputs, ctx| {
        let pipes = boxed_inputs
            .into_iter()
            .map(|b| downcast_input::<T>(&node_id, b))
            .collect::<Result<Vec<Pipe<T>>>>()?;
        let strategy = strategy.lock().unwrap().take().ok_or_else(|| {
            PipelineError::GraphValidation(format!("node '{node_id}' merge strategy already consumed"))
        })?;
        let merged = crate::merge::merge(pipes, ctx, strategy);
        Ok(Box::new(merged) as Box<dyn Any + Send>)
    })
}

/// Per-node execution knobs attached after registration via the `with_*`
/// methods and read back by [`ErasedMapperNode::run`] on every invocation.
/// Only nodes registered through [`GraphBuilder::add_mapper`] carry one —
/// the typed node roles (`Transform`, `StreamTransform`, ...) choose their
/// own execution shape in Rust directly, without going through the
/// string-keyed builder.
#[derive(Clone)]
pub(crate) struct MapperConfig {
    parallelism: Option<(usize, BackpressureMode)>,
    buffer: usize,
    retry: Option<RetryPolicy>,
    error_handler: Option<Arc<dyn NodeErrorHandler>>,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            parallelism: None,
            buffer: 16,
            retry: None,
            error_handler: None,
        }
    }
}

struct ErasedMapperNode<I, O, F> {
    id: String,
    f: Arc<F>,
    config: Arc<Mutex<MapperConfig>>,
    _marker: PhantomData<fn(I) -> O>,
}

#[async_trait]
impl<I, O, F, Fut> ErasedNode for ErasedMapperNode<I, O, F>
where
    I: Clone + Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O>> + Send + 'static,
{
    fn id(&self) -> &str {
        &self.id
    }
    fn input_types(&self) -> Vec<TypeId> {
        vec![TypeId::of::<I>()]
    }
    fn output_type(&self) -> Option<TypeId> {
        Some(TypeId::of::<O>())
    }
    async fn run(&self, mut inputs: Vec<Box<dyn Any + Send>>, ctx: &PipelineContext) -> Result<Option<Box<dyn Any + Send>>> {
        let input = downcast_input::<I>(&self.id, pop_input(&self.id, &mut inputs)?)?;
        let (parallelism, buffer, retry, error_handler) = {
            let cfg = self.config.lock().unwrap();
            (cfg.parallelism, cfg.buffer, cfg.retry.clone(), cfg.error_handler.clone())
        };
        let inner = match parallelism {
            None => Strategy::Sequential,
            Some((workers, backpressure)) => Strategy::Parallel(ParallelStrategy::new(workers, buffer, backpressure)),
        };
        let f = self.f.clone();
        let output = if let Some(retry) = retry {
            let mut resilient = ResilientStrategy::new(inner, retry);
            if let Some(handler) = error_handler {
                resilient = resilient.with_error_handler(handler);
            }
            resilient
                .execute(input, ctx.clone(), move |x: I| {
                    let f = f.clone();
                    async move { f(x).await }
                })
                .await
        } else {
            inner
                .execute(input, ctx.clone(), move |x: I| {
                    let f = f.clone();
                    async move { f(x).await }
                })
                .await
        };
        Ok(Some(Box::new(output)))
    }
    async fn dispose(&self) {}
}

/// One erased node: knows its own id and the `TypeId`s of the item types
/// flowing through its input and output slots, and can run itself given
/// boxed inputs in the order its edges were declared.
#[async_trait]
pub trait ErasedNode: Send + Sync {
    fn id(&self) -> &str;
    fn input_types(&self) -> Vec<TypeId>;
    fn output_type(&self) -> Option<TypeId>;
    async fn run(&self, inputs: Vec<Box<dyn Any + Send>>, ctx: &PipelineContext) -> Result<Option<Box<dyn Any + Send>>>;
    async fn dispose(&self);
}

fn downcast_input<T: 'static>(node_id: &str, boxed: Box<dyn Any + Send>) -> Result<Pipe<T>> {
    boxed
        .downcast::<Pipe<T>>()
        .map(|b| *b)
        .map_err(|_| PipelineError::TypeMismatch(format!("node '{node_id}' received an input of the wrong type")))
}

fn pop_input(node_id: &str, inputs: &mut Vec<Box<dyn Any + Send>>) -> Result<Box<dyn Any + Send>> {
    inputs
        .pop()
        .ok_or_else(|| PipelineError::GraphValidation(format!("node '{node_id}' is missing a required input")))
}

struct ErasedSourceNode<O, N> {
    id: String,
    inner: N,
    _marker: PhantomData<fn() -> O>,
}

#[async_trait]
impl<O, N> ErasedNode for ErasedSourceNode<O, N>
where
    O: Send + 'static,
    N: Source<O> + Send + Sync,
{
    fn id(&self) -> &str {
        &self.id
    }
    fn input_types(&self) -> Vec<TypeId> {
        Vec::new()
    }
    fn output_type(&self) -> Option<TypeId> {
        Some(TypeId::of::<O>())
    }
    async fn run(&self, _inputs: Vec<Box<dyn Any + Send>>, ctx: &PipelineContext) -> Result<Option<Box<dyn Any + Send>>> {
        let pipe = self.inner.produce(ctx).await?;
        Ok(Some(Box::new(pipe)))
    }
    async fn dispose(&self) {
        self.inner.dispose().await;
    }
}

struct ErasedTransformNode<I, O, N> {
    id: String,
    inner: N,
    _marker: PhantomData<fn(I) -> O>,
}

#[async_trait]
impl<I, O, N> ErasedNode for ErasedTransformNode<I, O, N>
where
    I: Send + 'static,
    O: Send + 'static,
    N: Transform<I, O> + Send + Sync,
{
    fn id(&self) -> &str {
        &self.id
    }
    fn input_types(&self) -> Vec<TypeId> {
        vec![TypeId::of::<I>()]
    }
    fn output_type(&self) -> Option<TypeId> {
        Some(TypeId::of::<O>())
    }
    async fn run(&self, mut inputs: Vec<Box<dyn Any + Send>>, ctx: &PipelineContext) -> Result<Option<Box<dyn Any + Send>>> {
        let input = downcast_input::<I>(&self.id, pop_input(&self.id, &mut inputs)?)?;
        let output = self.inner.apply(input, ctx).await?;
        Ok(Some(Box::new(output)))
    }
    async fn dispose(&self) {
        self.inner.dispose().await;
    }
}

struct ErasedStreamTransformNode<I, O, N> {
    id: String,
    inner: N,
    _marker: PhantomData<fn(I) -> O>,
}

#[async_trait]
impl<I, O, N> ErasedNode for ErasedStreamTransformNode<I, O, N>
where
    I: Send + 'static,
    O: Send + 'static,
    N: StreamTransform<I, O> + Send + Sync,
{
    fn id(&self) -> &str {
        &self.id
    }
    fn input_types(&self) -> Vec<TypeId> {
        vec![TypeId::of::<I>()]
    }
    fn output_type(&self) -> Option<TypeId> {
        Some(TypeId::of::<O>())
    }
    async fn run(&self, mut inputs: Vec<Box<dyn Any + Send>>, ctx: &PipelineContext) -> Result<Option<Box<dyn Any + Send>>> {
        let input = downcast_input::<I>(&self.id, pop_input(&self.id, &mut inputs)?)?;
        let output = self.inner.apply(input, ctx).await?;
        Ok(Some(Box::new(output)))
    }
    async fn dispose(&self) {
        self.inner.dispose().await;
    }
}

struct ErasedSinkNode<I, N> {
    id: String,
    inner: N,
    _marker: PhantomData<fn(I)>,
}

#[async_trait]
impl<I, N> ErasedNode for ErasedSinkNode<I, N>
where
    I: Send + 'static,
    N: Sink<I> + Send + Sync,
{
    fn id(&self) -> &str {
        &self.id
    }
    fn input_types(&self) -> Vec<TypeId> {
        vec![TypeId::of::<I>()]
    }
    fn output_type(&self) -> Option<TypeId> {
        None
    }
    async fn run(&self, mut inputs: Vec<Box<dyn Any + Send>>, ctx: &PipelineContext) -> Result<Option<Box<dyn Any + Send>>> {
        let input = downcast_input::<I>(&self.id, pop_input(&self.id, &mut inputs)?)?;
        self.inner.consume(input, ctx).await?;
        Ok(None)
    }
    async fn dispose(&self) {
        self.inner.dispose().await;
    }
}

struct ErasedJoinNode<L, R, O, N> {
    id: String,
    inner: N,
    _marker: PhantomData<fn(L, R) -> O>,
}

#[async_trait]
impl<L, R, O, N> ErasedNode for ErasedJoinNode<L, R, O, N>
where
    L: Send + 'static,
    R: Send + 'static,
    O: Send + 'static,
    N: JoinRole<L, R, O> + Send + Sync,
{
    fn id(&self) -> &str {
        &self.id
    }
    fn input_types(&self) -> Vec<TypeId> {
        vec![TypeId::of::<L>(), TypeId::of::<R>()]
    }
    fn output_type(&self) -> Option<TypeId> {
        Some(TypeId::of::<O>())
    }
    async fn run(&self, mut inputs: Vec<Box<dyn Any + Send>>, ctx: &PipelineContext) -> Result<Option<Box<dyn Any + Send>>> {
        let right = downcast_input::<R>(&self.id, pop_input(&self.id, &mut inputs)?)?;
        let left = downcast_input::<L>(&self.id, pop_input(&self.id, &mut inputs)?)?;
        let output = self.inner.apply(left, right, ctx).await?;
        Ok(Some(Box::new(output)))
    }
    async fn dispose(&self) {
        self.inner.dispose().await;
    }
}

struct ErasedAggregateNode<I, O, N> {
    id: String,
    inner: N,
    _marker: PhantomData<fn(I) -> O>,
}

#[async_trait]
impl<I, O, N> ErasedNode for ErasedAggregateNode<I, O, N>
where
    I: Send + 'static,
    O: Send + 'static,
    N: AggregateRole<I, O> + Send + Sync,
{
    fn id(&self) -> &str {
        &self.id
    }
    fn input_types(&self) -> Vec<TypeId> {
        vec![TypeId::of::<I>()]
    }
    fn output_type(&self) -> Option<TypeId> {
        Some(TypeId::of::<O>())
    }
    async fn run(&self, mut inputs: Vec<Box<dyn Any + Send>>, ctx: &PipelineContext) -> Result<Option<Box<dyn Any + Send>>> {
        let input = downcast_input::<I>(&self.id, pop_input(&self.id, &mut inputs)?)?;
        let output = self.inner.apply(input, ctx).await?;
        Ok(Some(Box::new(output)))
    }
    async fn dispose(&self) {
        self.inner.dispose().await;
    }
}

struct ErasedCustomMergeNode<T, N> {
    id: String,
    arity: usize,
    inner: N,
    _marker: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, N> ErasedNode for ErasedCustomMergeNode<T, N>
where
    T: Send + 'static,
    N: CustomMerge<T> + Send + Sync,
{
    fn id(&self) -> &str {
        &self.id
    }
    fn input_types(&self) -> Vec<TypeId> {
        vec![TypeId::of::<T>(); self.arity]
    }
    fn output_type(&self) -> Option<TypeId> {
        Some(TypeId::of::<T>())
    }
    async fn run(&self, inputs: Vec<Box<dyn Any + Send>>, ctx: &PipelineContext) -> Result<Option<Box<dyn Any + Send>>> {
        let mut pipes = Vec::with_capacity(inputs.len());
        for boxed in inputs {
            pipes.push(downcast_input::<T>(&self.id, boxed)?);
        }
        let output = self.inner.apply(pipes, ctx).await?;
        Ok(Some(Box::new(output)))
    }
    async fn dispose(&self) {
        self.inner.dispose().await;
    }
}

/// A node registered with [`GraphBuilder`], plus its resolved incoming
/// edges in the order they were connected, its outgoing edges in connection
/// order, and (if it has more than one outgoing edge) the splitter that
/// fans its single output out to each of them.
struct NodeEntry {
    node: Arc<dyn ErasedNode>,
    incoming: Vec<String>,
    outgoing: Vec<String>,
    fanout: Option<Splitter>,
    merge: Option<Merger>,
}

/// Assembles a graph from string-identified nodes and edges, validating
/// type compatibility and shape as edges are added, and structural
/// soundness (no cycles, no missing inputs) at [`GraphBuilder::validate`].
#[derive(Default)]
pub struct GraphBuilder {
    nodes: HashMap<String, NodeEntry>,
    mapper_configs: HashMap<String, Arc<Mutex<MapperConfig>>>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&mut self, id: String, node: Arc<dyn ErasedNode>) -> Result<()> {
        if self.nodes.contains_key(&id) {
            return Err(PipelineError::GraphValidation(format!("duplicate node id '{id}'")));
        }
        self.nodes.insert(
            id,
            NodeEntry {
                node,
                incoming: Vec::new(),
                outgoing: Vec::new(),
                fanout: None,
                merge: None,
            },
        );
        Ok(())
    }

    fn mapper_config(&self, node_id: &str) -> Result<Arc<Mutex<MapperConfig>>> {
        self.mapper_configs.get(node_id).cloned().ok_or_else(|| {
            PipelineError::GraphValidation(format!(
                "node '{node_id}' has no configurable execution strategy; only add_mapper nodes do"
            ))
        })
    }

    /// Register a fan-out splitter for `node_id`, required before a second
    /// `connect` call from it validates. `T` must match the node's own
    /// output element type exactly; a mismatch surfaces as a downcast
    /// failure the first time the graph runs, not here, since `output_type`
    /// alone can't express "clone of T".
    pub fn set_fanout<T: Clone + Send + 'static>(&mut self, node_id: &str, capacity: TeeCapacity) -> Result<()> {
        let entry = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| PipelineError::GraphValidation(format!("unknown node '{node_id}'")))?;
        entry.fanout = Some(splitter_for::<T>(node_id.to_string(), capacity));
        Ok(())
    }

    pub fn add_source<O, N>(&mut self, id: impl Into<String>, source: N) -> Result<()>
    where
        O: Send + 'static,
        N: Source<O> + Send + Sync + 'static,
    {
        let id = id.into();
        self.register(
            id.clone(),
            Arc::new(ErasedSourceNode {
                id,
                inner: source,
                _marker: PhantomData,
            }),
        )
    }

    pub fn add_transform<I, O, N>(&mut self, id: impl Into<String>, transform: N) -> Result<()>
    where
        I: Send + 'static,
        O: Send + 'static,
        N: Transform<I, O> + Send + Sync + 'static,
    {
        let id = id.into();
        self.register(
            id.clone(),
            Arc::new(ErasedTransformNode {
                id,
                inner: transform,
                _marker: PhantomData,
            }),
        )
    }

    pub fn add_stream_transform<I, O, N>(&mut self, id: impl Into<String>, transform: N) -> Result<()>
    where
        I: Send + 'static,
        O: Send + 'static,
        N: StreamTransform<I, O> + Send + Sync + 'static,
    {
        let id = id.into();
        self.register(
            id.clone(),
            Arc::new(ErasedStreamTransformNode {
                id,
                inner: transform,
                _marker: PhantomData,
            }),
        )
    }

    pub fn add_sink<I, N>(&mut self, id: impl Into<String>, sink: N) -> Result<()>
    where
        I: Send + 'static,
        N: Sink<I> + Send + Sync + 'static,
    {
        let id = id.into();
        self.register(
            id.clone(),
            Arc::new(ErasedSinkNode {
                id,
                inner: sink,
                _marker: PhantomData,
            }),
        )
    }

    /// `first_input_id`/`second_input_id` become the edges a caller must
    /// `connect` as the join's left and right sides, in that order.
    pub fn add_join<L, R, O, N>(&mut self, id: impl Into<String>, join: N) -> Result<()>
    where
        L: Send + 'static,
        R: Send + 'static,
        O: Send + 'static,
        N: JoinRole<L, R, O> + Send + Sync + 'static,
    {
        let id = id.into();
        self.register(
            id.clone(),
            Arc::new(ErasedJoinNode {
                id,
                inner: join,
                _marker: PhantomData,
            }),
        )
    }

    pub fn add_aggregate<I, O, N>(&mut self, id: impl Into<String>, aggregate: N) -> Result<()>
    where
        I: Send + 'static,
        O: Send + 'static,
        N: AggregateRole<I, O> + Send + Sync + 'static,
    {
        let id = id.into();
        self.register(
            id.clone(),
            Arc::new(ErasedAggregateNode {
                id,
                inner: aggregate,
                _marker: PhantomData,
            }),
        )
    }

    pub fn add_custom_merge<T, N>(&mut self, id: impl Into<String>, arity: usize, merge: N) -> Result<()>
    where
        T: Send + 'static,
        N: CustomMerge<T> + Send + Sync + 'static,
    {
        let id = id.into();
        self.register(
            id.clone(),
            Arc::new(ErasedCustomMergeNode {
                id,
                arity,
                inner: merge,
                _marker: PhantomData,
            }),
        )
    }

    /// Registers a single-item function `f` as a node whose concurrency
    /// shape (sequential, parallel, resilient) is configured after the fact
    /// by `with_blocking_parallelism`/`with_drop_newest_parallelism`/
    /// `with_drop_oldest_parallelism`/`with_resilience`/`with_error_handler`.
    /// Defaults to running sequentially, one item at a time.
    pub fn add_mapper<I, O, F, Fut>(&mut self, id: impl Into<String>, f: F) -> Result<()>
    where
        I: Clone + Send + 'static,
        O: Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        let id = id.into();
        let config = Arc::new(Mutex::new(MapperConfig::default()));
        self.mapper_configs.insert(id.clone(), config.clone());
        self.register(
            id.clone(),
            Arc::new(ErasedMapperNode {
                id,
                f: Arc::new(f),
                config,
                _marker: PhantomData,
            }),
        )
    }

    /// Registers a [`Batcher`] stream-transform. `timespan` of `None`
    /// disables the time-based early flush (batches close on `size` or
    /// end-of-stream only).
    pub fn add_batcher<T: Send + 'static>(&mut self, id: impl Into<String>, size: usize, timespan: Option<Duration>) -> Result<()> {
        let batcher = match timespan {
            Some(d) => Batcher::with_timespan(size, d),
            None => Batcher::new(size),
        };
        self.add_stream_transform::<T, Vec<T>, _>(id, batcher)
    }

    /// Registers an [`Unbatcher`] stream-transform.
    pub fn add_unbatcher<T: Send + 'static>(&mut self, id: impl Into<String>) -> Result<()> {
        self.add_stream_transform::<Vec<T>, T, _>(id, Unbatcher)
    }

    /// Registers a [`Branch`] node with no handlers yet attached; returns the
    /// branch so the caller can register handlers with [`Branch::add_handler`]
    /// before the graph runs (the handler set freezes on first item).
    pub fn add_branch<T: Clone + Send + Sync + 'static>(
        &mut self,
        id: impl Into<String>,
        mode: HandlerFailureMode,
    ) -> Result<Arc<Branch<T>>> {
        let id = id.into();
        let branch = Arc::new(Branch::new(id.clone(), mode));
        self.register(
            id.clone(),
            Arc::new(ErasedStreamTransformNode {
                id,
                inner: branch.clone(),
                _marker: PhantomData,
            }),
        )?;
        Ok(branch)
    }

    /// Registers a [`Branch`] with a single `LogAndContinue` handler already
    /// attached — the common "observe every item, never affect the primary
    /// stream" shape.
    pub fn add_tap<T: Clone + Send + Sync + 'static>(&mut self, id: impl Into<String>, handler: Handler<T>) -> Result<()> {
        let id = id.into();
        let branch = Arc::new(Branch::tap(id.clone(), handler));
        self.register(
            id.clone(),
            Arc::new(ErasedStreamTransformNode {
                id,
                inner: branch,
                _marker: PhantomData,
            }),
        )
    }

    /// Registers the fan-out splitter for a branch/tap node's primary
    /// output, identical in effect to [`GraphBuilder::set_fanout`] — named
    /// separately because a branch's "capacity" is the bounded channel size
    /// each downstream subscriber gets, not a node-kind-specific concept.
    pub fn with_branch_options<T: Clone + Send + 'static>(&mut self, node_id: &str, capacity: TeeCapacity) -> Result<&mut Self> {
        self.set_fanout::<T>(node_id, capacity)?;
        Ok(self)
    }

    /// Opens a `Retry` wrapper around `node_id`'s execution with a default
    /// retry policy (3 attempts, exponential backoff). Only valid for nodes
    /// registered with [`GraphBuilder::add_mapper`].
    pub fn with_resilience(&mut self, node_id: &str) -> Result<&mut Self> {
        let cfg = self.mapper_config(node_id)?;
        cfg.lock().unwrap().retry.get_or_insert_with(|| RetryPolicy::new(3));
        Ok(self)
    }

    /// Attaches a node-level error handler, enabling the `Retry` wrapper
    /// with the default policy if it isn't already enabled (the handler is
    /// otherwise never consulted). Only valid for [`GraphBuilder::add_mapper`]
    /// nodes.
    pub fn with_error_handler(&mut self, node_id: &str, handler: Arc<dyn NodeErrorHandler>) -> Result<&mut Self> {
        let cfg = self.mapper_config(node_id)?;
        let mut guard = cfg.lock().unwrap();
        guard.retry.get_or_insert_with(|| RetryPolicy::new(3));
        guard.error_handler = Some(handler);
        Ok(self)
    }

    /// Runs `node_id` across `n` workers, suspending a worker when the
    /// output buffer is full. Only valid for [`GraphBuilder::add_mapper`]
    /// nodes.
    pub fn with_blocking_parallelism(&mut self, node_id: &str, n: usize) -> Result<&mut Self> {
        let cfg = self.mapper_config(node_id)?;
        cfg.lock().unwrap().parallelism = Some((n, BackpressureMode::Blocking));
        Ok(self)
    }

    /// Runs `node_id` across `n` workers, dropping the newest result when the
    /// output buffer is full. Only valid for [`GraphBuilder::add_mapper`]
    /// nodes.
    pub fn with_drop_newest_parallelism(&mut self, node_id: &str, n: usize) -> Result<&mut Self> {
        let cfg = self.mapper_config(node_id)?;
        cfg.lock().unwrap().parallelism = Some((n, BackpressureMode::DropNewest));
        Ok(self)
    }

    /// Runs `node_id` across `n` workers, evicting the oldest buffered
    /// result when the output buffer is full. Only valid for
    /// [`GraphBuilder::add_mapper`] nodes.
    pub fn with_drop_oldest_parallelism(&mut self, node_id: &str, n: usize) -> Result<&mut Self> {
        let cfg = self.mapper_config(node_id)?;
        cfg.lock().unwrap().parallelism = Some((n, BackpressureMode::DropOldest));
        Ok(self)
    }

    /// Opens `node_id`'s single input slot up to fan-in: every subsequent
    /// `connect` into it adds another source merged by `strategy`
    /// (`spec.md` §4.3/§4.13) instead of being rejected as "no remaining
    /// input slots". Must be called before any but the first `connect` into
    /// the node.
    pub fn with_merge_strategy<T: Send + 'static>(&mut self, node_id: &str, strategy: MergeStrategy) -> Result<&mut Self> {
        let entry = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| PipelineError::GraphValidation(format!("unknown node '{node_id}'")))?;
        entry.merge = Some(merger_for::<T>(node_id.to_string(), strategy));
        Ok(self)
    }

    /// Connect `from`'s output to `to`'s next unfilled input slot, checking
    /// that both nodes exist, that `to` has an unfilled slot left, and that
    /// the element types match. Returns the builder so calls can chain.
    pub fn connect(&mut self, from: &str, to: &str) -> Result<&mut Self> {
        let from_output = self
            .nodes
            .get(from)
            .ok_or_else(|| PipelineError::GraphValidation(format!("unknown source node '{from}'")))?
            .node
            .output_type()
            .ok_or_else(|| PipelineError::GraphValidation(format!("node '{from}' has no output to connect")))?;

        let to_entry = self
            .nodes
            .get(to)
            .ok_or_else(|| PipelineError::GraphValidation(format!("unknown target node '{to}'")))?;
        let expected = to_entry.node.input_types();
        let slot = to_entry.incoming.len();
        let expected_type = match expected.get(slot) {
            Some(t) => t,
            None if to_entry.merge.is_some() && !expected.is_empty() => expected.last().unwrap(),
            None => {
                return Err(PipelineError::GraphValidation(format!(
                    "node '{to}' has no remaining input slots"
                )))
            }
        };
        if *expected_type != from_output {
            return Err(PipelineError::TypeMismatch(format!(
                "cannot connect '{from}' to '{to}': element type mismatch"
            )));
        }

        let from_entry = self.nodes.get(from).unwrap();
        if !from_entry.outgoing.is_empty() && from_entry.fanout.is_none() {
            return Err(PipelineError::GraphValidation(format!(
                "node '{from}' already has an outgoing edge; call set_fanout before adding another"
            )));
        }

        self.nodes.get_mut(to).unwrap().incoming.push(from.to_string());
        self.nodes.get_mut(from).unwrap().outgoing.push(to.to_string());
        Ok(self)
    }

    /// Checks every non-source node has all its input slots filled, and
    /// that the graph is acyclic. Nodes whose output is never connected are
    /// allowed — logged, not rejected, since a graph under construction
    /// commonly has a branch not yet wired to its final sink.
    pub fn validate(&self) -> Result<()> {
        for (id, entry) in &self.nodes {
            let expected = entry.node.input_types().len();
            let satisfied = if entry.merge.is_some() {
                entry.incoming.len() >= expected.max(1)
            } else {
                entry.incoming.len() == expected
            };
            if !satisfied {
                return Err(PipelineError::GraphValidation(format!(
                    "node '{id}' expects {expected} input(s) but has {}",
                    entry.incoming.len()
                )));
            }
            if expected == 0 && !self.nodes.values().any(|other| other.incoming.iter().any(|f| f == id)) {
                tracing::warn!(node = %id, "source node's output is never connected");
            }
        }
        self.topological_order()?;
        Ok(())
    }

    fn topological_order(&self) -> Result<Vec<String>> {
        let mut in_degree: HashMap<&str, usize> = self.nodes.keys().map(|id| (id.as_str(), 0)).collect();
        let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
        for (id, entry) in &self.nodes {
            for parent in &entry.incoming {
                *in_degree.get_mut(id.as_str()).unwrap() += 1;
                children.entry(parent.as_str()).or_default().push(id.as_str());
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut visited: HashSet<&str> = HashSet::new();

        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            order.push(id.to_string());
            if let Some(kids) = children.get(id) {
                for &kid in kids {
                    let degree = in_degree.get_mut(kid).unwrap();
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(kid);
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(PipelineError::GraphValidation("graph contains a cycle".into()));
        }
        Ok(order)
    }

    /// Validate and produce a [`crate::runner::Runner`] ready to execute the
    /// graph.
    pub fn build(mut self) -> Result<crate::runner::Runner> {
        self.validate()?;
        let order = self.topological_order()?;
        let mut nodes = HashMap::with_capacity(self.nodes.len());
        let mut incoming = HashMap::with_capacity(self.nodes.len());
        let mut outgoing = HashMap::with_capacity(self.nodes.len());
        let mut fanout = HashMap::new();
        let mut merge = HashMap::new();
        for (id, entry) in self.nodes.drain() {
            incoming.insert(id.clone(), entry.incoming);
            outgoing.insert(id.clone(), entry.outgoing);
            if let Some(splitter) = entry.fanout {
                fanout.insert(id.clone(), splitter);
            }
            if let Some(merger) = entry.merge {
                merge.insert(id.clone(), merger);
            }
            nodes.insert(id, entry.node);
        }
        Ok(crate::runner::Runner::new(nodes, incoming, outgoing, fanout, merge, order))
    }
}

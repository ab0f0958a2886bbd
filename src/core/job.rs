//! Typed jobs, handles and promises.
//!
//! A [`Job`] pairs an async body with the inputs it needs. Inputs may be
//! plain values or [`Promise`]s for the output of other nodes; the
//! scheduler only starts a body once every promise it was built with has
//! a value, so bodies receive concrete values and never wait.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::domain::{ArtifactFamily, ArtifactId, Location, NodeId, ResourceHint};

use super::graph::GraphError;
use super::scheduler::NodeContext;

pub(crate) type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

pub(crate) type ErasedBody = Box<dyn FnOnce(NodeContext) -> BoxFuture<anyhow::Result<()>> + Send>;

/// A job with its output type erased, ready to be placed in the graph
pub(crate) struct ErasedJob {
    pub name: String,
    pub producers: Vec<NodeId>,
    pub body: ErasedBody,
    pub resources: ResourceHint,
    pub deadline: Option<Duration>,
}

/// A unit of work producing a `T`
pub struct Job<T> {
    name: String,
    producers: Vec<NodeId>,
    body: ErasedBody,
    slot: Arc<OnceLock<T>>,
    resources: ResourceHint,
    deadline: Option<Duration>,
}

impl<T> Job<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Build a job that runs `body` with `input` once it is resolvable
    pub fn new<I, F, Fut>(name: impl Into<String>, input: I, body: F) -> Self
    where
        I: Input,
        F: FnOnce(NodeContext, I::Value) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let mut producers = Vec::new();
        input.producers(&mut producers);
        producers.sort();
        producers.dedup();

        let slot = Arc::new(OnceLock::new());
        let out = Arc::clone(&slot);

        let body: ErasedBody = Box::new(move |ctx: NodeContext| -> BoxFuture<anyhow::Result<()>> {
            Box::pin(async move {
                let value = input.resolve()?;
                let output = body(ctx, value).await?;
                // A body runs once, so the slot is always empty here
                let _ = out.set(output);
                Ok(())
            })
        });

        Self {
            name: name.into(),
            producers,
            body,
            slot,
            resources: ResourceHint::default(),
            deadline: None,
        }
    }

    /// Advisory resource needs
    pub fn with_resources(mut self, resources: ResourceHint) -> Self {
        self.resources = resources;
        self
    }

    /// Fail the node with a timeout if its body runs longer than this
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Nodes whose promises this job consumes
    pub fn producers(&self) -> &[NodeId] {
        &self.producers
    }

    pub(crate) fn into_parts(self) -> (ErasedJob, Arc<OnceLock<T>>) {
        let erased = ErasedJob {
            name: self.name,
            producers: self.producers,
            body: self.body,
            resources: self.resources,
            deadline: self.deadline,
        };
        (erased, self.slot)
    }
}

/// Reference to a node placed in the graph
pub struct NodeHandle<T> {
    id: NodeId,
    slot: Arc<OnceLock<T>>,
}

impl<T> NodeHandle<T> {
    pub(crate) fn new(id: NodeId, slot: Arc<OnceLock<T>>) -> Self {
        Self { id, slot }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Forward reference to this node's eventual output
    pub fn promise(&self) -> Promise<T> {
        Promise {
            producer: self.id,
            slot: Arc::clone(&self.slot),
        }
    }

    /// Output if the node has finished successfully
    pub(crate) fn output(&self) -> Option<&T> {
        self.slot.get()
    }
}

/// Forward reference to the output of a node that may not have run yet.
///
/// Only nodes that are guaranteed to start after the producer completes
/// may consume a promise; the graph checks this when the consumer is added.
pub struct Promise<T> {
    producer: NodeId,
    slot: Arc<OnceLock<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            producer: self.producer,
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("producer", &self.producer)
            .field("resolved", &self.slot.get().is_some())
            .finish()
    }
}

impl<T: Clone> Promise<T> {
    pub fn producer(&self) -> NodeId {
        self.producer
    }

    /// The produced value, or an error if the producer has not completed
    pub fn get(&self) -> Result<T, GraphError> {
        self.slot
            .get()
            .cloned()
            .ok_or(GraphError::PromiseUnresolved(self.producer))
    }

    /// Derive a promise for part of this one's value
    pub fn map<U, F>(self, f: F) -> Mapped<T, F>
    where
        F: FnOnce(T) -> U + Send + 'static,
    {
        Mapped { promise: self, f }
    }
}

/// A promise with a projection applied on resolution
pub struct Mapped<T, F> {
    promise: Promise<T>,
    f: F,
}

/// Something a job can be built from: values and promises, nested
pub trait Input: Send + 'static {
    type Value: Send + 'static;

    /// Collect the producers of every promise inside
    fn producers(&self, out: &mut Vec<NodeId>);

    /// Replace every promise by its value
    fn resolve(self) -> Result<Self::Value, GraphError>;
}

impl<T> Input for Promise<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Value = T;

    fn producers(&self, out: &mut Vec<NodeId>) {
        out.push(self.producer);
    }

    fn resolve(self) -> Result<T, GraphError> {
        self.get()
    }
}

impl<T, U, F> Input for Mapped<T, F>
where
    T: Clone + Send + Sync + 'static,
    U: Send + 'static,
    F: FnOnce(T) -> U + Send + 'static,
{
    type Value = U;

    fn producers(&self, out: &mut Vec<NodeId>) {
        out.push(self.promise.producer);
    }

    fn resolve(self) -> Result<U, GraphError> {
        self.promise.get().map(self.f)
    }
}

impl<I: Input> Input for Vec<I> {
    type Value = Vec<I::Value>;

    fn producers(&self, out: &mut Vec<NodeId>) {
        for item in self {
            item.producers(out);
        }
    }

    fn resolve(self) -> Result<Self::Value, GraphError> {
        self.into_iter().map(Input::resolve).collect()
    }
}

impl<I: Input> Input for Option<I> {
    type Value = Option<I::Value>;

    fn producers(&self, out: &mut Vec<NodeId>) {
        if let Some(item) = self {
            item.producers(out);
        }
    }

    fn resolve(self) -> Result<Self::Value, GraphError> {
        self.map(Input::resolve).transpose()
    }
}

impl Input for () {
    type Value = ();

    fn producers(&self, _out: &mut Vec<NodeId>) {}

    fn resolve(self) -> Result<(), GraphError> {
        Ok(())
    }
}

macro_rules! impl_tuple_input {
    ($($name:ident),+) => {
        impl<$($name: Input),+> Input for ($($name,)+) {
            type Value = ($($name::Value,)+);

            #[allow(non_snake_case)]
            fn producers(&self, out: &mut Vec<NodeId>) {
                let ($($name,)+) = self;
                $($name.producers(out);)+
            }

            #[allow(non_snake_case)]
            fn resolve(self) -> Result<Self::Value, GraphError> {
                let ($($name,)+) = self;
                Ok(($($name.resolve()?,)+))
            }
        }
    };
}

impl_tuple_input!(A);
impl_tuple_input!(A, B);
impl_tuple_input!(A, B, C);
impl_tuple_input!(A, B, C, D);

/// A value that is already known
pub struct Ready<T>(pub T);

impl<T: Send + 'static> Input for Ready<T> {
    type Value = T;

    fn producers(&self, _out: &mut Vec<NodeId>) {}

    fn resolve(self) -> Result<T, GraphError> {
        Ok(self.0)
    }
}

macro_rules! impl_value_input {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl Input for $ty {
                type Value = $ty;

                fn producers(&self, _out: &mut Vec<NodeId>) {}

                fn resolve(self) -> Result<$ty, GraphError> {
                    Ok(self)
                }
            }
        )+
    };
}

impl_value_input!(ArtifactId, ArtifactFamily, Location, String, PathBuf, u64, usize, bool);

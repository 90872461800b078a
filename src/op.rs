use crate::{
    config::Config,
    types::{HashMap, NodeId, Value},
};
use core::fmt::Debug;
use parking_lot::Mutex;

/// Boxed cause of a failed op application.
pub type OpError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A gradient payload that can be summed with another delivery landing in the
/// same input slot.
pub trait Gradient: Clone + Debug + Send + 'static {
    /// Combine two partial gradients delivered to the same slot.
    #[must_use]
    fn accumulate(self, other: Self) -> Self;
}

/// A single gradient computation in the graph.
///
/// Ops are attached to nodes at graph construction and invoked at most once
/// per invocation, when every expected delivery to the node has arrived.
/// The engine treats the computation as opaque: it only requires one output
/// per outgoing edge of the node.
pub trait Op<C: Config>: Debug + Send + Sync + 'static {
    /// Apply the computation to the accumulated inputs.
    ///
    /// `inputs` is the node's completed accumulator, indexed by input slot;
    /// slots that received no delivery are `None`. The returned vector must
    /// contain exactly one gradient per outgoing edge of the node, in edge
    /// order.
    ///
    /// The op may call `api.queue_callback(..)` to register work that runs on
    /// the initiating thread once the whole invocation has resolved.
    ///
    /// # Errors
    /// Any error returned here fails the invocation with
    /// [`EngineError::Computation`](crate::error::EngineError::Computation).
    fn apply(
        &self,
        api: &impl OpApi<C>,
        inputs: &[Option<Value<C>>],
    ) -> Result<Vec<Value<C>>, OpError>;

    /// Whether this op produces nondeterministic output.
    ///
    /// Such nodes are scheduled exactly once per invocation with a fixed
    /// single credit, bypassing dependency counting entirely; gradients
    /// delivered to them are dropped.
    fn is_nondeterministic(&self) -> bool {
        false
    }
}

/// API available to ops while they run on a worker thread.
pub trait OpApi<C: Config> {
    /// The node this op is attached to.
    fn node(&self) -> NodeId;
    /// Whether the invocation retains graph buffers for reuse.
    fn keep_graph(&self) -> bool;
    /// Register a callback to run on the initiating thread after the graph
    /// has fully resolved. Callbacks run in registration order and may
    /// register further callbacks.
    fn queue_callback(&self, callback: FinalCallback);
}

/// Callback run on the initiating thread after a successful invocation.
///
/// Receives the callback queue so it can append follow-up callbacks, which
/// also run before `execute` returns.
pub type FinalCallback = Box<dyn FnOnce(&CallbackQueue) + Send>;

/// Append-only FIFO queue of invocation-final callbacks.
///
/// Shared between all worker threads of one invocation; appends are guarded
/// by the queue's own lock so multiple device threads can register
/// concurrently.
#[derive(Default)]
pub struct CallbackQueue {
    callbacks: Mutex<Vec<Option<FinalCallback>>>,
}

impl CallbackQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append a callback. May be called from any worker thread while the
    /// invocation is active, and from a final callback while the queue is
    /// being drained.
    pub fn push(&self, callback: FinalCallback) {
        self.callbacks.lock().push(Some(callback));
    }

    /// Run all callbacks in registration order on the current thread.
    ///
    /// The lock is not held across a callback invocation, so callbacks may
    /// push further callbacks; those run in the same drain.
    pub(crate) fn run(&self) {
        let mut next = 0;
        loop {
            let callback = {
                let mut callbacks = self.callbacks.lock();
                match callbacks.get_mut(next) {
                    Some(slot) => slot.take(),
                    None => break,
                }
            };
            next += 1;
            let callback = callback.expect("CallbackQueue::run: [1]");
            callback(self);
        }
    }
}

impl Debug for CallbackQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CallbackQueue")
            .field("len", &self.callbacks.lock().len())
            .finish()
    }
}

/// Pre-execution hook: receives the node and its mutable input slots.
/// Returning `false` skips the node's op while still counting the node as
/// completed for dependency purposes, truncating traversal beyond it.
pub type PreHook<C> = Box<dyn Fn(NodeId, &mut [Option<Value<C>>]) -> bool + Send + Sync>;

/// Post-execution hook: receives the node, its inputs and its mutable
/// outputs. Returning `false` vetoes delivery of the outputs downstream
/// while still counting the node as done.
pub type PostHook<C> =
    Box<dyn Fn(NodeId, &[Option<Value<C>>], &mut [Value<C>]) -> bool + Send + Sync>;

/// Per-node hook registries scoped to one invocation.
pub struct Hooks<C: Config> {
    pub(crate) pre: HashMap<NodeId, Vec<PreHook<C>>>,
    pub(crate) post: HashMap<NodeId, Vec<PostHook<C>>>,
}

impl<C: Config> Default for Hooks<C> {
    fn default() -> Self {
        Self {
            pre: HashMap::default(),
            post: HashMap::default(),
        }
    }
}

impl<C: Config> Hooks<C> {
    /// Empty registries.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pre-execution hook for `node`. Hooks for one node run in
    /// registration order; the first `false` wins.
    pub fn add_pre(&mut self, node: NodeId, hook: PreHook<C>) {
        self.pre.entry(node).or_default().push(hook);
    }

    /// Register a post-execution hook for `node`.
    pub fn add_post(&mut self, node: NodeId, hook: PostHook<C>) {
        self.post.entry(node).or_default().push(hook);
    }
}

impl<C: Config> Debug for Hooks<C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Hooks")
            .field("pre", &self.pre.len())
            .field("post", &self.post.len())
            .finish()
    }
}

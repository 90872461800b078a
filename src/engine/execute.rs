use crate::{
    buffer::InputBuffer,
    config::Config,
    engine::setup::Plan,
    error::EngineError,
    graph::{Edge, Graph},
    op::{CallbackQueue, FinalCallback, Hooks, Op, OpApi},
    queue::ReadyQueue,
    types::{DeviceId, HashMap, IndexMap, NodeId, Value},
};
use core::{
    any::Any,
    cell::Cell,
    mem,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};
use parking_lot::{Condvar, Mutex};
use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

std::thread_local! {
    /// Set once per engine worker thread; used to reject reentrant
    /// invocations that would deadlock the one-thread-per-device pool.
    static IS_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is an engine worker.
pub(super) fn on_worker_thread() -> bool {
    IS_WORKER.with(Cell::get)
}

/// Shared bookkeeping of one backward invocation.
///
/// Owned jointly by the initiating `execute` frame and every live
/// [`NodeTask`] belonging to the invocation; freed when the last of them is
/// dropped. Counters and registries are guarded by their own fine-grained
/// locks, never one global lock, so cross-device throughput stays high.
pub(crate) struct GraphTask<C: Config> {
    pub(super) graph: Arc<Graph<C>>,
    pub(super) keep_graph: bool,
    pub(super) hooks: Hooks<C>,
    /// Pending delivery count per node; decremented on every delivery,
    /// enqueues the node on the transition to zero.
    dependencies: HashMap<NodeId, AtomicUsize>,
    /// Per-node accumulators; each behind its own lock so delivery
    /// contention is local to one node.
    buffers: HashMap<NodeId, Mutex<InputBuffer<C>>>,
    /// One queue per device, shared with the engine.
    queues: Vec<Arc<ReadyQueue<NodeTask<C>>>>,
    /// Tasks created but not yet finished. The invocation is resolved when
    /// this reaches zero.
    outstanding: Mutex<usize>,
    resolved: Condvar,
    /// First error wins; later ones are logged and swallowed.
    error: Mutex<Option<EngineError>>,
    failed: AtomicBool,
    pub(super) callbacks: Arc<CallbackQueue>,
    /// Completed accumulators of sink nodes, in completion order.
    captured: Mutex<IndexMap<NodeId, Vec<Option<Value<C>>>>>,
}

impl<C: Config> GraphTask<C> {
    /// Assemble the invocation state from a setup plan, returning the state
    /// and the immediately executable tasks. The outstanding counter starts
    /// at the number of those tasks; it must be balanced by one
    /// [`GraphTask::finish_task`] per entry whether or not the entry is
    /// actually pushed.
    pub(super) fn new(
        graph: Arc<Graph<C>>,
        keep_graph: bool,
        hooks: Hooks<C>,
        plan: Plan<C>,
        queues: Vec<Arc<ReadyQueue<NodeTask<C>>>>,
    ) -> (Arc<Self>, Vec<(NodeId, InputBuffer<C>)>) {
        let Plan {
            dependencies,
            buffers,
            initial,
            num_reachable: _,
        } = plan;
        let task = Arc::new(Self {
            graph,
            keep_graph,
            hooks,
            dependencies,
            buffers,
            queues,
            outstanding: Mutex::new(initial.len()),
            resolved: Condvar::new(),
            error: Mutex::new(None),
            failed: AtomicBool::new(false),
            callbacks: Arc::new(CallbackQueue::new()),
            captured: Mutex::new(IndexMap::default()),
        });
        (task, initial)
    }

    /// Whether the error slot is occupied. Racy by nature; used only to stop
    /// seeding early, never for correctness.
    pub(super) fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    /// Record a failure. The first error per invocation wins; the rest are
    /// swallowed after a debug log.
    pub(super) fn set_error(&self, error: EngineError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            self.failed.store(true, Ordering::Relaxed);
            *slot = Some(error);
        } else {
            tracing::debug!(%error, "secondary error swallowed, first error wins");
        }
    }

    pub(super) fn take_error(&self) -> Option<EngineError> {
        self.error.lock().take()
    }

    /// Account for a task about to be pushed. Always precedes the push so
    /// completion can never be observed while the task is in flight.
    fn add_outstanding(&self) {
        *self.outstanding.lock() += 1;
    }

    /// Account for a finished (or abandoned) task; signals the initiating
    /// thread when the last one drains.
    pub(super) fn finish_task(&self) {
        let mut outstanding = self.outstanding.lock();
        *outstanding = outstanding
            .checked_sub(1)
            .expect("GraphTask::finish_task: [1]");
        if *outstanding == 0 {
            self.resolved.notify_all();
        }
    }

    /// Block the initiating thread until every outstanding task has drained.
    pub(super) fn wait_resolved(&self) {
        let mut outstanding = self.outstanding.lock();
        while *outstanding > 0 {
            self.resolved.wait(&mut outstanding);
        }
    }

    pub(super) fn take_captured(&self) -> IndexMap<NodeId, Vec<Option<Value<C>>>> {
        mem::take(&mut *self.captured.lock())
    }
}

/// One scheduled run of a node's computation for one invocation.
pub(crate) struct NodeTask<C: Config> {
    node: NodeId,
    buffer: InputBuffer<C>,
    graph_task: Arc<GraphTask<C>>,
}

impl<C: Config> NodeTask<C> {
    pub(super) fn new(node: NodeId, buffer: InputBuffer<C>, graph_task: Arc<GraphTask<C>>) -> Self {
        Self {
            node,
            buffer,
            graph_task,
        }
    }
}

struct OpApiImpl<'a, C: Config> {
    node: NodeId,
    graph_task: &'a GraphTask<C>,
}

impl<C: Config> OpApi<C> for OpApiImpl<'_, C> {
    fn node(&self) -> NodeId {
        self.node
    }

    fn keep_graph(&self) -> bool {
        self.graph_task.keep_graph
    }

    fn queue_callback(&self, callback: FinalCallback) {
        self.graph_task.callbacks.push(callback);
    }
}

/// Body of one device worker thread. Runs until the queue is shut down,
/// serving tasks from any number of concurrent invocations.
///
/// The whole of a task's evaluation runs under a panic boundary: a panic in
/// an op, a hook or a gradient accumulation is converted into
/// [`EngineError::Computation`], so the outstanding counter always drains
/// and the worker stays alive for later invocations.
pub(super) fn thread_main<C: Config>(device: DeviceId, queue: Arc<ReadyQueue<NodeTask<C>>>) {
    IS_WORKER.with(|flag| flag.set(true));
    tracing::debug!(device, "worker thread started");
    while let Some(task) = queue.pop() {
        let node = task.node;
        let graph_task = Arc::clone(&task.graph_task);
        match panic::catch_unwind(AssertUnwindSafe(|| evaluate(task))) {
            Ok(Ok(())) => {}
            Ok(Err(error)) => graph_task.set_error(error),
            Err(payload) => graph_task.set_error(EngineError::Computation {
                node,
                source: format!("panicked: {}", panic_message(payload.as_ref())).into(),
            }),
        }
        graph_task.finish_task();
    }
    tracing::debug!(device, "worker thread stopped");
}

/// Run one node: pre-hooks, the op itself, post-hooks, then delivery of the
/// outputs into the successors' accumulators.
fn evaluate<C: Config>(task: NodeTask<C>) -> Result<(), EngineError> {
    let NodeTask {
        node,
        mut buffer,
        graph_task,
    } = task;
    let slot = graph_task.graph.slot(node);
    tracing::trace!(%node, "evaluating");

    // A pre-hook returning false skips the op but still counts the node as
    // completed, truncating traversal beyond it.
    let mut skipped = false;
    if let Some(hooks) = graph_task.hooks.pre.get(&node) {
        for hook in hooks {
            if !hook(node, buffer.slots_mut()) {
                tracing::trace!(%node, "skipped by pre-hook");
                skipped = true;
                break;
            }
        }
    }
    if skipped {
        return Ok(());
    }

    // Sink nodes are where the backward pass bottoms out; their completed
    // accumulators are the result of the invocation.
    if slot.edges.is_empty() {
        graph_task
            .captured
            .lock()
            .insert(node, buffer.slots().to_vec());
    }

    let mut outputs = {
        let api = OpApiImpl {
            node,
            graph_task: &*graph_task,
        };
        let mut op_slot = slot.op.lock();
        let Some(op) = op_slot.as_ref() else {
            return Err(EngineError::InvalidGraph(format!(
                "{node} was released by a concurrent backward pass; \
                 run with keep_graph = true to backpropagate twice"
            )));
        };
        let outputs = match op.apply(&api, buffer.slots()) {
            Ok(outputs) => outputs,
            Err(source) => return Err(EngineError::Computation { node, source }),
        };
        // The op's single use is consumed; without keep_graph its buffers
        // are released here and a later pass fails at discovery.
        if !graph_task.keep_graph {
            *op_slot = None;
        }
        outputs
    };
    if outputs.len() != slot.edges.len() {
        return Err(EngineError::Computation {
            node,
            source: format!(
                "op returned {} output(s) for {} outgoing edge(s)",
                outputs.len(),
                slot.edges.len()
            )
            .into(),
        });
    }

    // A post-hook returning false vetoes delivery while still counting the
    // node as done.
    if let Some(hooks) = graph_task.hooks.post.get(&node) {
        for hook in hooks {
            if !hook(node, buffer.slots(), &mut outputs) {
                tracing::trace!(%node, "delivery vetoed by post-hook");
                return Ok(());
            }
        }
    }

    for (&edge, output) in slot.edges.iter().zip(outputs) {
        deliver(&graph_task, edge, output)?;
    }
    Ok(())
}

/// Hand one output gradient to its consuming node's accumulator; if that
/// completes the accumulator, dispatch the node to its device queue.
fn deliver<C: Config>(
    graph_task: &Arc<GraphTask<C>>,
    edge: Edge,
    value: Value<C>,
) -> Result<(), EngineError> {
    let target = edge.target;
    if graph_task.graph.slot(target).nondeterministic {
        // Single-credit nodes were scheduled at seeding time and never wait
        // for deliveries.
        tracing::trace!(%target, "delivery to nondeterministic node dropped");
        return Ok(());
    }

    let buffer = graph_task
        .buffers
        .get(&target)
        .expect("Engine::deliver: [1]");
    let dependencies = graph_task
        .dependencies
        .get(&target)
        .expect("Engine::deliver: [2]");
    let completed = {
        let mut staged = buffer.lock();
        staged.add(edge.slot, value);
        let pending = dependencies.fetch_sub(1, Ordering::AcqRel);
        assert!(pending > 0, "Engine::deliver: [3]");
        // Completeness is monotonic: the buffer is moved out exactly once,
        // on the last delivery, while its lock is still held.
        (pending == 1).then(|| mem::take(&mut *staged))
    };

    if let Some(inputs) = completed {
        let device = graph_task.graph.slot(target).device;
        tracing::trace!(%target, device, "accumulator complete, dispatching");
        // Incremented before the push so resolution can never be observed
        // while the new task is neither queued nor counted.
        graph_task.add_outstanding();
        let task = NodeTask::new(target, inputs, Arc::clone(graph_task));
        if let Err(error) = graph_task.queues[device].push(task) {
            graph_task.finish_task();
            return Err(error);
        }
    }
    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}

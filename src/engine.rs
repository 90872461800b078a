mod execute;
mod setup;

use crate::{
    buffer::InputBuffer,
    config::Config,
    engine::execute::{GraphTask, NodeTask},
    error::EngineError,
    graph::Graph,
    op::Hooks,
    queue::ReadyQueue,
    types::{IndexMap, NodeId, Value},
};
use core::fmt;
use derive_more::Debug;
use parking_lot::Mutex;
use std::{
    sync::{Arc, Once},
    thread::{self, JoinHandle},
};

/// Gradients captured by one successful invocation.
///
/// One entry per completed sink node (a node with no outgoing edges), in
/// completion order: the node's accumulated input slots at the moment it
/// became executable. Sinks cut off by a pre-hook skip upstream are absent.
#[must_use]
#[derive(Debug)]
pub struct GradStore<C: Config> {
    grads: IndexMap<NodeId, Vec<Option<Value<C>>>>,
}

impl<C: Config> Default for GradStore<C> {
    fn default() -> Self {
        Self {
            grads: IndexMap::default(),
        }
    }
}

impl<C: Config> GradStore<C> {
    /// Captured input slots of `node`, if it completed.
    #[must_use]
    pub fn get(&self, node: NodeId) -> Option<&[Option<Value<C>>]> {
        self.grads.get(&node).map(Vec::as_slice)
    }

    /// Iterate over `(node, captured slots)` pairs in completion order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &[Option<Value<C>>])> {
        self.grads.iter().map(|(&node, slots)| (node, slots.as_slice()))
    }

    /// Number of captured sinks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.grads.len()
    }

    /// Whether nothing was captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }
}

/// Backward-pass engine: one ready queue and one long-lived worker thread
/// per device.
///
/// Workers are spawned lazily on the first invocation behind a one-time
/// guard and then serve every subsequent invocation; the pool is torn down
/// only when the engine is dropped. An engine is typically created once per
/// process and shared.
///
/// Key responsibilities:
/// - Validates the reachable subgraph and computes dependency counts in a
///   single-threaded setup phase, before anything is scheduled.
/// - Seeds the root accumulators and dispatches the initially executable
///   tasks to their device queues.
/// - Blocks the initiating thread until the invocation's outstanding-task
///   counter drains, then runs final callbacks in registration order and
///   returns the captured sink gradients, or the first recorded error.
#[must_use]
pub struct Engine<C: Config> {
    queues: Vec<Arc<ReadyQueue<NodeTask<C>>>>,
    start_workers: Once,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<C: Config> fmt::Debug for Engine<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("num_devices", &self.queues.len())
            .finish_non_exhaustive()
    }
}

impl<C: Config> Engine<C> {
    /// Engine for `num_devices` compute devices, one worker thread and one
    /// ready queue each. Worker threads are not spawned until the first
    /// invocation.
    ///
    /// # Panics
    /// If `num_devices` is zero.
    pub fn new(num_devices: usize) -> Self {
        assert!(num_devices > 0, "Engine::new: at least one device required");
        Self {
            queues: (0..num_devices)
                .map(|_| Arc::new(ReadyQueue::new()))
                .collect(),
            start_workers: Once::new(),
            workers: Mutex::new(Vec::with_capacity(num_devices)),
        }
    }

    /// Number of devices this engine schedules across.
    #[must_use]
    pub fn num_devices(&self) -> usize {
        self.queues.len()
    }

    /// Run one backward invocation.
    ///
    /// `roots` are `(node, input slot)` pairs paired one-to-one with
    /// `seeds`: each seed gradient is staged into the root's accumulator at
    /// the given slot. Duplicate roots merge; duplicate slots accumulate.
    /// The reachable subgraph executes in dependency order across the device
    /// workers while this thread blocks on the invocation's completion
    /// signal.
    ///
    /// With `keep_graph = false`, each node's op is released after its
    /// single use and a second invocation over the same subgraph fails at
    /// discovery.
    ///
    /// On success, final callbacks queued during execution run on this
    /// thread in FIFO order (including callbacks they queue themselves), and
    /// the captured sink gradients are returned. On failure the first
    /// recorded error is returned after all in-flight tasks have drained;
    /// no partial results are exposed and no final callbacks run.
    ///
    /// # Errors
    /// - [`EngineError::Reentrancy`] when called from an engine worker
    ///   thread.
    /// - [`EngineError::InvalidGraph`] for malformed roots, mismatched seed
    ///   count, cycles, unknown devices, or released graph state.
    /// - [`EngineError::Computation`] when a node's op fails or panics.
    /// - [`EngineError::Shutdown`] when the pool is being torn down.
    pub fn execute(
        &self,
        graph: &Arc<Graph<C>>,
        roots: &[(NodeId, usize)],
        seeds: Vec<Value<C>>,
        keep_graph: bool,
        hooks: Hooks<C>,
    ) -> Result<GradStore<C>, EngineError> {
        if execute::on_worker_thread() {
            return Err(EngineError::Reentrancy);
        }
        if roots.len() != seeds.len() {
            return Err(EngineError::InvalidGraph(format!(
                "{} root(s) but {} seed value(s)",
                roots.len(),
                seeds.len()
            )));
        }
        if roots.is_empty() {
            return Ok(GradStore::default());
        }
        self.ensure_workers();

        // Single-threaded setup: reachability, validation, dependency
        // counts, seed staging. Fails fast before any task is scheduled.
        let plan = setup::plan(graph, roots, seeds, self.queues.len())?;
        tracing::debug!(
            roots = roots.len(),
            reachable = plan.num_reachable,
            keep_graph,
            "invocation started"
        );

        let (graph_task, initial) = GraphTask::new(
            Arc::clone(graph),
            keep_graph,
            hooks,
            plan,
            self.queues.clone(),
        );
        self.seed(&graph_task, initial);

        graph_task.wait_resolved();
        if let Some(error) = graph_task.take_error() {
            tracing::debug!(%error, "invocation failed");
            return Err(error);
        }

        // The graph is fully resolved; run final callbacks on the initiating
        // thread, in registration order, including any they append.
        graph_task.callbacks.run();
        let grads = graph_task.take_captured();
        tracing::debug!(captured = grads.len(), "invocation resolved");
        Ok(GradStore { grads })
    }

    /// Push the initially executable tasks. The outstanding counter was
    /// pre-set to their number, so every entry is balanced here or by the
    /// worker that finishes it. Once an error is recorded, remaining seeds
    /// are abandoned.
    fn seed(&self, graph_task: &Arc<GraphTask<C>>, initial: Vec<(NodeId, InputBuffer<C>)>) {
        for (node, buffer) in initial {
            if graph_task.has_failed() {
                graph_task.finish_task();
                continue;
            }
            let device = graph_task.graph.device(node);
            let task = NodeTask::new(node, buffer, Arc::clone(graph_task));
            if let Err(error) = self.queues[device].push(task) {
                graph_task.set_error(error);
                graph_task.finish_task();
            }
        }
    }

    /// Spawn the device workers exactly once, on first use. Concurrent first
    /// invocations block until the pool is up.
    fn ensure_workers(&self) {
        self.start_workers.call_once(|| {
            let mut workers = self.workers.lock();
            for (device, queue) in self.queues.iter().enumerate() {
                let queue = Arc::clone(queue);
                let handle = thread::Builder::new()
                    .name(format!("revgrad-worker-{device}"))
                    .spawn(move || execute::thread_main(device, queue))
                    .expect("Engine::ensure_workers: spawn failed");
                workers.push(handle);
            }
        });
    }
}

impl<C: Config> Drop for Engine<C> {
    /// Tear down the pool: poison the queues, let the workers drain what is
    /// already queued, and join them.
    fn drop(&mut self) {
        for queue in &self.queues {
            queue.shutdown();
        }
        for worker in self.workers.get_mut().drain(..) {
            // A worker that panicked already poisoned nothing we rely on;
            // joining is best effort during teardown.
            drop(worker.join());
        }
    }
}

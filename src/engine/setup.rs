use crate::{
    buffer::InputBuffer,
    config::Config,
    error::EngineError,
    graph::Graph,
    types::{HashMap, IndexMap, NodeId, Value},
};
use core::sync::atomic::AtomicUsize;
use parking_lot::Mutex;
use rustc_hash::FxBuildHasher;

/// Single-threaded setup product of one invocation: everything the workers
/// need, computed under no concurrent mutation so the hot path is reduced to
/// accumulator inserts and counter decrements.
pub(super) struct Plan<C: Config> {
    /// Pending delivery count per reachable node. A node becomes executable
    /// exactly when its counter transitions to zero.
    pub(super) dependencies: HashMap<NodeId, AtomicUsize>,
    /// Accumulator per reachable node, individually lockable.
    pub(super) buffers: HashMap<NodeId, Mutex<InputBuffer<C>>>,
    /// Tasks executable immediately at seeding time: roots with no pending
    /// deliveries, then nondeterministic nodes with their single credit.
    pub(super) initial: Vec<(NodeId, InputBuffer<C>)>,
    /// Size of the reachable subgraph, for logging.
    pub(super) num_reachable: usize,
}

/// Discover the reachable subgraph, validate it, compute dependency counts
/// and stage the seed gradients.
///
/// # Errors
/// [`EngineError::InvalidGraph`] on a dangling root, an out-of-range seed
/// slot, a node bound to an unknown device, a cycle, or graph state already
/// released by a previous `keep_graph = false` run.
pub(super) fn plan<C: Config>(
    graph: &Graph<C>,
    roots: &[(NodeId, usize)],
    seeds: Vec<Value<C>>,
    num_devices: usize,
) -> Result<Plan<C>, EngineError> {
    // Example (diamond), edges in backward orientation:
    //
    //    root
    //    /  \
    //   A    B
    //    \  /
    //     C
    //
    // - Reachable from `root`: {root, A, B, C}.
    // - dependencies: root = 0, A = 1, B = 1, C = 2 (one unit per incoming
    //   edge from the reachable set).
    // - `root` is the only immediately executable task; C runs only after
    //   both A and B have delivered into its accumulator.

    // Phase 1: depth-first reachability walk from the root nodes, with
    // cycle detection. A node on the active path that is reached again has a
    // path to itself; such a graph can never drain and is rejected before
    // anything is scheduled.
    let (reachable, nondeterministic) = discover(graph, roots, num_devices)?;

    // Phase 2: one unit of dependency per edge of the reachable subgraph.
    // Edges into nondeterministic nodes are excluded: those run once on a
    // fixed single credit and never wait for deliveries. Accumulators are
    // materialized in the same pass.
    let mut dependencies = HashMap::with_capacity_and_hasher(reachable.len(), FxBuildHasher);
    let mut buffers = HashMap::with_capacity_and_hasher(reachable.len(), FxBuildHasher);
    for &node in &reachable {
        if graph.slot(node).nondeterministic {
            continue;
        }
        dependencies.insert(node, 0_usize);
        buffers.insert(
            node,
            Mutex::new(InputBuffer::new(graph.slot(node).num_inputs)),
        );
    }
    for &node in &reachable {
        for edge in graph.edges(node) {
            if graph.slot(edge.target).nondeterministic {
                continue;
            }
            *dependencies
                .get_mut(&edge.target)
                .expect("Engine::plan: [1]") += 1;
        }
    }

    // Phase 3: merge the seed gradients by root node. Duplicate roots on one
    // node share a buffer; duplicate slots accumulate. Seeds aimed at a
    // nondeterministic node are dropped, its single credit already covers it.
    let mut merged: IndexMap<NodeId, InputBuffer<C>> =
        IndexMap::with_capacity_and_hasher(roots.len(), FxBuildHasher);
    debug_assert_eq!(roots.len(), seeds.len(), "Engine::plan: [2]");
    for (&(node, slot), seed) in roots.iter().zip(seeds) {
        if graph.slot(node).nondeterministic {
            tracing::warn!(%node, "seed for nondeterministic root dropped");
            continue;
        }
        merged
            .entry(node)
            .or_insert_with(|| InputBuffer::new(graph.slot(node).num_inputs))
            .add(slot, seed);
    }

    // Phase 4: split the merged roots into immediately executable tasks and
    // pre-loaded accumulators. A root that is also a successor of other
    // reachable nodes must not be enqueued twice; its seed is staged into
    // its accumulator and the normal delivery path completes it.
    let mut initial = Vec::with_capacity(merged.len() + nondeterministic.len());
    for (node, seed_buffer) in merged {
        let pending = *dependencies.get(&node).expect("Engine::plan: [3]");
        if pending == 0 {
            initial.push((node, seed_buffer));
        } else {
            let mut staged = buffers.get(&node).expect("Engine::plan: [4]").lock();
            for (slot, value) in seed_buffer.into_slots().into_iter().enumerate() {
                if let Some(value) = value {
                    staged.add(slot, value);
                }
            }
        }
    }

    // Phase 5: nondeterministic nodes, one empty-buffer task each. Appended
    // after the roots: the per-device queues are LIFO, so these pop first.
    for node in nondeterministic {
        let num_inputs = graph.slot(node).num_inputs;
        initial.push((node, InputBuffer::new(num_inputs)));
    }

    let dependencies = dependencies
        .into_iter()
        .map(|(node, count)| (node, AtomicUsize::new(count)))
        .collect();

    Ok(Plan {
        dependencies,
        buffers,
        initial,
        num_reachable: reachable.len(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Visit {
    /// On the active DFS path.
    Active,
    /// Fully explored.
    Done,
}

/// Walk the graph depth-first from the root nodes, returning every reachable
/// node and, separately, the reachable nondeterministic nodes.
fn discover<C: Config>(
    graph: &Graph<C>,
    roots: &[(NodeId, usize)],
    num_devices: usize,
) -> Result<(Vec<NodeId>, Vec<NodeId>), EngineError> {
    let mut state: HashMap<NodeId, Visit> = HashMap::default();
    let mut reachable = Vec::new();
    let mut nondeterministic = Vec::new();
    // (node, next edge index) pairs; an entry is popped for good only once
    // all its edges have been explored.
    let mut stack: Vec<(NodeId, usize)> = Vec::new();

    for &(root, slot) in roots {
        if !graph.contains(root) {
            return Err(EngineError::InvalidGraph(format!(
                "root {root} does not exist"
            )));
        }
        if slot >= graph.slot(root).num_inputs {
            return Err(EngineError::InvalidGraph(format!(
                "seed slot {slot} out of range for root {root} ({} inputs)",
                graph.slot(root).num_inputs
            )));
        }
        if state.contains_key(&root) {
            continue;
        }
        visit(graph, root, num_devices, &mut reachable, &mut nondeterministic, &mut state)?;
        stack.push((root, 0));
        while let Some((node, edge_idx)) = stack.pop() {
            let edges = graph.edges(node);
            if edge_idx == edges.len() {
                let mark = state.insert(node, Visit::Done);
                debug_assert_eq!(mark, Some(Visit::Active), "Engine::discover: [1]");
                continue;
            }
            stack.push((node, edge_idx + 1));
            let target = edges[edge_idx].target;
            match state.get(&target) {
                None => {
                    visit(
                        graph,
                        target,
                        num_devices,
                        &mut reachable,
                        &mut nondeterministic,
                        &mut state,
                    )?;
                    stack.push((target, 0));
                }
                Some(Visit::Active) => {
                    return Err(EngineError::InvalidGraph(format!(
                        "graph contains a cycle through {target}"
                    )));
                }
                Some(Visit::Done) => {}
            }
        }
    }

    Ok((reachable, nondeterministic))
}

/// First touch of a node during discovery: validate it and record it.
fn visit<C: Config>(
    graph: &Graph<C>,
    node: NodeId,
    num_devices: usize,
    reachable: &mut Vec<NodeId>,
    nondeterministic: &mut Vec<NodeId>,
    state: &mut HashMap<NodeId, Visit>,
) -> Result<(), EngineError> {
    let slot = graph.slot(node);
    if slot.device >= num_devices {
        return Err(EngineError::InvalidGraph(format!(
            "{node} is bound to device {} but the engine has {num_devices} device(s)",
            slot.device
        )));
    }
    if slot.op.lock().is_none() {
        return Err(EngineError::InvalidGraph(format!(
            "{node} was released by a previous backward pass; \
             run with keep_graph = true to backpropagate twice"
        )));
    }
    state.insert(node, Visit::Active);
    reachable.push(node);
    if slot.nondeterministic {
        nondeterministic.push(node);
    }
    Ok(())
}

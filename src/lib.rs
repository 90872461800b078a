//! Multi-threaded backward-pass executor for reverse-mode computation graphs.
//!
//! This crate runs one backward invocation over a Directed Acyclic Graph of
//! gradient nodes. It:
//! - Discovers the subgraph reachable from the requested roots and validates
//!   it (dangling references, cycles, released buffers) before scheduling
//!   anything.
//! - Precomputes per-node dependency counts in a single-threaded phase so the
//!   hot path is reduced to accumulator inserts and atomic counter
//!   decrements.
//! - Accumulates partial gradients per node in an [`buffer::InputBuffer`]
//!   until every expected delivery has arrived, then dispatches the node to
//!   the worker thread owning its device's ready queue.
//! - Propagates the first failure of an invocation to the caller after the
//!   in-flight tasks have drained, never returning partial results.
//!
//! Key modules:
//! - `config`: binds concrete gradient value and op types to the engine via
//!   the `Config` trait.
//! - `op`: the `Op` interface, the `OpApi` handed to ops at execution time,
//!   per-node hook registries, and the final-callback queue.
//! - `graph`: the arena-backed graph of nodes and typed edges.
//! - `buffer`: per-node gradient accumulation by input slot.
//! - `queue`: the blocking per-device ready queue.
//! - `engine`: invocation orchestration (discovery, dependency counting,
//!   seeding, completion) and the device worker pool.
//!
//! Quick start:
//! 1. Implement `Config` with your gradient value and `Op` types.
//! 2. Build a [`graph::Graph`]: `add_node` declares an op, its device and its
//!    input slot count; `connect` wires an output of one node into an input
//!    slot of another.
//! 3. Create an [`engine::Engine`] with the device count of your runtime and
//!    call `execute` with the roots and their seed gradients.
//!
//! The engine guarantees that a node runs only after every
//! dependency-contributing predecessor has delivered to it, and that each
//! reachable node runs at most once per invocation. No ordering is promised
//! between independent branches, which may run concurrently on different
//! device threads.

/// Per-node staging of partial gradients until all expected deliveries
/// arrive.
pub mod buffer;
/// Public interface to configure the engine.
///
/// Exposes the `Config` trait which binds the gradient value type and the op
/// type for a concrete instantiation of the engine.
pub mod config;
/// The backward-pass engine.
///
/// Contains invocation setup (reachability, cycle checks, dependency
/// counting, seeding) and the per-device worker pool that drains ready
/// queues until engine shutdown.
pub mod engine;
/// Error kinds surfaced by graph construction and execution.
pub mod error;
/// Arena-backed computation graph: nodes, typed edges, device affinities.
pub mod graph;
/// Op definitions and the execution-time API exposed to ops.
///
/// Defines the `Gradient` and `Op` traits, the `OpApi` used by running ops
/// to queue invocation-final callbacks, and the pre/post hook registries.
pub mod op;
/// Blocking per-device ready queue with graceful shutdown.
pub mod queue;
/// Core types used across the crate (identifiers, aliases).
pub mod types;

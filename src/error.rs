use crate::{op::OpError, types::NodeId};
use thiserror::Error;

/// Error kinds surfaced by graph construction and backward execution.
///
/// One invocation surfaces at most one error: the first failure wins and
/// later concurrent failures are logged and swallowed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The graph or the requested roots are malformed: dangling node
    /// reference, out-of-range input slot, unknown device, a cycle, or
    /// buffers already released by a previous `keep_graph = false` run.
    ///
    /// Detected during discovery, before any task is scheduled.
    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    /// A node's computation returned an error or panicked.
    #[error("computation of {node} failed: {source}")]
    Computation {
        /// The failing node.
        node: NodeId,
        /// The underlying cause.
        #[source]
        source: OpError,
    },

    /// A backward invocation was started from one of the engine's own worker
    /// threads, which would deadlock the one-thread-per-device pool.
    #[error("backward invocation started from an engine worker thread")]
    Reentrancy,

    /// A ready queue was used after the worker pool was torn down.
    #[error("ready queue is shut down")]
    Shutdown,
}

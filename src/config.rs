use crate::op::{Gradient, Op};

/// Configuration entry-point for instantiating the engine.
///
/// A concrete `Config` binds a gradient value type and an op implementation
/// to the engine, making it generic over both the numeric payload carried
/// along graph edges and the opaque per-node computations.
pub trait Config: Sized + 'static {
    /// The gradient payload delivered along edges and staged in accumulators.
    type Value: Gradient;
    /// The user-defined computation attached to each graph node.
    type Op: Op<Self>;
}

//! Error kinds surfaced by the graph core.

use thiserror::Error;

/// Every failure the core reports to its caller. Rewrite passes never fail;
/// a rule that does not match simply does not fire.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Shapes that cannot be broadcast, concatenated, or contracted together.
    #[error("incompatible shapes {lhs:?} vs {rhs:?}")]
    ShapeMismatch { lhs: Vec<usize>, rhs: Vec<usize> },

    /// Axis outside `[-rank, rank)`.
    #[error("axis {axis} is out of range for rank {rank}")]
    AxisOutOfRange { axis: isize, rank: usize },

    /// An operand with fewer dimensions than the operator requires.
    #[error("operand rank {rank} is below the required minimum of {min}")]
    RankTooLow { rank: usize, min: usize },

    /// Topological sort made no progress over the remaining operators.
    #[error("graph contains a cycle; topological sort cannot make progress")]
    GraphHasCycle,

    /// An operator's shape inference could not produce a usable result.
    #[error("shape inference failed for {op}")]
    ShapeInferFailed { op: &'static str },

    /// A tensor created on one runtime was added to a graph on another.
    #[error("tensor lives on runtime `{tensor}` but the graph runs on `{graph}`")]
    RuntimeMismatch { tensor: String, graph: String },

    /// A second, distinct buffer was bound to an already-bound tensor.
    #[error("tensor is already bound to a different buffer")]
    AlreadyBound,

    /// `alloc`/`free` on an allocator whose buffer has been materialized.
    #[error("allocator layout is frozen once its buffer has been materialized")]
    AllocAfterMaterialize,

    /// A structural invariant of the graph does not hold.
    #[error("graph validation failed: {0}")]
    ValidationFailed(String),
}

pub type Result<T> = std::result::Result<T, GraphError>;

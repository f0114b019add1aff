//! Graph operators: a tagged kind plus the common wiring header.
//!
//! The open set of operator kinds is modeled as [`OpKind`], an enum whose
//! variants carry the per-kind parameters. [`Operator`] holds the parts
//! every kind shares: ordered input and output tensor ids and the derived
//! predecessor/successor multisets. Rewrite passes match exhaustively on
//! the kind tag instead of downcasting.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{GraphError, Result};
use crate::tensor::{broadcast, Shape, TensorId};

static NEXT_OP_ID: AtomicU32 = AtomicU32::new(0);

/// Identifies one operator instance within its owning graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(u32);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Operator kind tag carrying the per-kind parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpKind {
    /// Reorders axes by a permutation of `[0, rank)`.
    Transpose { perm: Vec<usize> },
    /// Broadcasted batched matrix multiply over the two trailing axes,
    /// with optionally transposed operands.
    MatMul { trans_a: bool, trans_b: bool },
    /// Concatenates all inputs along one already-normalized axis.
    Concat { axis: usize },
    /// Elementwise `max(x, 0)`.
    Relu,
    /// Elementwise addition with bidirectional broadcast.
    Add,
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Transpose { .. } => "Transpose",
            OpKind::MatMul { .. } => "MatMul",
            OpKind::Concat { .. } => "Concat",
            OpKind::Relu => "Relu",
            OpKind::Add => "Add",
        }
    }

    /// Infers the output shapes for this kind from the input shapes.
    ///
    /// Pure in the inputs and parameters; a misconfigured operator surfaces
    /// the precise failure instead of a shape.
    pub fn infer_shape(&self, inputs: &[Shape]) -> Result<Vec<Shape>> {
        let expect_arity = |count: usize| {
            if inputs.len() == count {
                Ok(())
            } else {
                Err(GraphError::ShapeInferFailed { op: self.name() })
            }
        };
        match self {
            OpKind::Transpose { perm } => {
                expect_arity(1)?;
                Ok(vec![infer_transpose(perm, &inputs[0])?])
            }
            OpKind::MatMul { trans_a, trans_b } => {
                expect_arity(2)?;
                Ok(vec![infer_matmul(*trans_a, *trans_b, &inputs[0], &inputs[1])?])
            }
            OpKind::Concat { axis } => {
                if inputs.is_empty() {
                    return Err(GraphError::ShapeInferFailed { op: self.name() });
                }
                Ok(vec![infer_concat(*axis, inputs)?])
            }
            OpKind::Relu => {
                expect_arity(1)?;
                Ok(vec![inputs[0].clone()])
            }
            OpKind::Add => {
                expect_arity(2)?;
                Ok(vec![broadcast(&inputs[0], &inputs[1])?])
            }
        }
    }
}

fn infer_transpose(perm: &[usize], input: &Shape) -> Result<Shape> {
    let rank = input.rank();
    if perm.len() != rank {
        return Err(GraphError::ShapeMismatch {
            lhs: perm.to_vec(),
            rhs: input.dims().to_vec(),
        });
    }
    let mut seen = vec![false; rank];
    let mut dims = Vec::with_capacity(rank);
    for &axis in perm {
        if axis >= rank {
            return Err(GraphError::AxisOutOfRange {
                axis: axis as isize,
                rank,
            });
        }
        if std::mem::replace(&mut seen[axis], true) {
            // Repeated axis: not a permutation.
            return Err(GraphError::ShapeMismatch {
                lhs: perm.to_vec(),
                rhs: input.dims().to_vec(),
            });
        }
        dims.push(input.dims()[axis]);
    }
    Ok(Shape::new(dims))
}

fn infer_matmul(trans_a: bool, trans_b: bool, a: &Shape, b: &Shape) -> Result<Shape> {
    for operand in [a, b] {
        if operand.rank() < 2 {
            return Err(GraphError::RankTooLow {
                rank: operand.rank(),
                min: 2,
            });
        }
    }
    let (rank_a, rank_b) = (a.rank(), b.rank());

    // Read (m, k) from the trailing 2-D block of each operand; a transpose
    // flag swaps the roles of the last two dims.
    let (m, k_a) = if trans_a {
        (a.dims()[rank_a - 1], a.dims()[rank_a - 2])
    } else {
        (a.dims()[rank_a - 2], a.dims()[rank_a - 1])
    };
    let (n, k_b) = if trans_b {
        (b.dims()[rank_b - 2], b.dims()[rank_b - 1])
    } else {
        (b.dims()[rank_b - 1], b.dims()[rank_b - 2])
    };
    if k_a != k_b {
        return Err(GraphError::ShapeMismatch {
            lhs: a.dims().to_vec(),
            rhs: b.dims().to_vec(),
        });
    }

    let batch_a = Shape::new(&a.dims()[..rank_a - 2]);
    let batch_b = Shape::new(&b.dims()[..rank_b - 2]);
    let mut dims = broadcast(&batch_a, &batch_b)?.dims().to_vec();
    dims.push(m);
    dims.push(n);
    Ok(Shape::new(dims))
}

fn infer_concat(axis: usize, inputs: &[Shape]) -> Result<Shape> {
    let first = &inputs[0];
    let rank = first.rank();
    if axis >= rank {
        return Err(GraphError::AxisOutOfRange {
            axis: axis as isize,
            rank,
        });
    }
    let mut dims = first.dims().to_vec();
    for shape in &inputs[1..] {
        if shape.rank() != rank {
            return Err(GraphError::ShapeMismatch {
                lhs: first.dims().to_vec(),
                rhs: shape.dims().to_vec(),
            });
        }
        for (dim, (&have, &want)) in shape.dims().iter().zip(first.dims()).enumerate() {
            if dim == axis {
                dims[axis] += have;
            } else if have != want {
                return Err(GraphError::ShapeMismatch {
                    lhs: first.dims().to_vec(),
                    rhs: shape.dims().to_vec(),
                });
            }
        }
    }
    Ok(Shape::new(dims))
}

/// One operator instance: the kind tag plus inputs, outputs, and the
/// operator-to-operator edges derived from tensor wiring.
#[derive(Debug)]
pub struct Operator {
    id: OpId,
    kind: OpKind,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
    predecessors: Vec<OpId>,
    successors: Vec<OpId>,
}

impl Operator {
    pub(crate) fn new(kind: OpKind, inputs: Vec<TensorId>) -> Self {
        Operator {
            id: OpId(NEXT_OP_ID.fetch_add(1, Ordering::Relaxed)),
            kind,
            inputs,
            outputs: Vec::new(),
            predecessors: Vec::new(),
            successors: Vec::new(),
        }
    }

    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn kind(&self) -> &OpKind {
        &self.kind
    }

    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    /// Producing operators of this operator's inputs, one entry per input
    /// whose tensor has a source.
    pub fn predecessors(&self) -> &[OpId] {
        &self.predecessors
    }

    /// Consuming operators of this operator's outputs, one entry per
    /// occupied downstream input slot.
    pub fn successors(&self) -> &[OpId] {
        &self.successors
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Infers output shapes from the provided input shapes.
    pub fn infer_shape(&self, inputs: &[Shape]) -> Result<Vec<Shape>> {
        self.kind.infer_shape(inputs)
    }

    pub(crate) fn kind_mut(&mut self) -> &mut OpKind {
        &mut self.kind
    }

    pub(crate) fn push_output(&mut self, output: TensorId) {
        self.outputs.push(output);
    }

    /// Replaces every input slot referring to `from` with `to`.
    pub(crate) fn replace_input(&mut self, from: TensorId, to: TensorId) {
        for slot in &mut self.inputs {
            if *slot == from {
                *slot = to;
            }
        }
    }

    pub(crate) fn add_predecessor(&mut self, op: OpId) {
        self.predecessors.push(op);
    }

    pub(crate) fn add_successor(&mut self, op: OpId) {
        self.successors.push(op);
    }

    /// Removes every predecessor entry referring to `op`.
    pub(crate) fn remove_predecessor(&mut self, op: OpId) {
        self.predecessors.retain(|&pred| pred != op);
    }

    /// Removes every successor entry referring to `op`.
    pub(crate) fn remove_successor(&mut self, op: OpId) {
        self.successors.retain(|&succ| succ != op);
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            OpKind::Transpose { perm } => write!(f, "Transpose(perm={perm:?})")?,
            OpKind::MatMul { trans_a, trans_b } => {
                write!(f, "MatMul(trans_a={trans_a}, trans_b={trans_b})")?
            }
            OpKind::Concat { axis } => write!(f, "Concat(axis={axis})")?,
            OpKind::Relu => f.write_str("Relu")?,
            OpKind::Add => f.write_str("Add")?,
        }
        write!(f, " inputs {:?} outputs {:?}", self.inputs, self.outputs)
    }
}

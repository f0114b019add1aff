//! The computation graph: exclusive owner of tensors, operators, and the
//! pool allocator that plans their memory.
//!
//! Tensors and operators live in insertion-ordered vectors so that
//! scheduling, planning, and validation are reproducible across runs; the
//! back-references between them are integer ids resolved against these
//! vectors. Finalizing a graph is the sequence
//! `topo_sort -> shape_infer -> optimize -> data_malloc`.

mod optimize;
mod schedule;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::error::{GraphError, Result};
use crate::memory::PoolAllocator;
use crate::ops::{OpId, OpKind, Operator};
use crate::runtime::Runtime;
use crate::tensor::{normalize_axis, DType, Shape, Tensor, TensorId};

pub struct Graph {
    runtime: Arc<dyn Runtime>,
    tensors: Vec<Tensor>,
    ops: Vec<Operator>,
    allocator: PoolAllocator,
    sorted: bool,
}

impl Graph {
    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        let allocator = PoolAllocator::new(Arc::clone(&runtime));
        Graph {
            runtime,
            tensors: Vec::new(),
            ops: Vec::new(),
            allocator,
            sorted: false,
        }
    }

    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }

    pub fn allocator(&self) -> &PoolAllocator {
        &self.allocator
    }

    /// Creates a tensor on the graph's runtime and takes ownership of it.
    pub fn add_tensor(&mut self, shape: Shape, dtype: DType) -> TensorId {
        let tensor = Tensor::new(shape, dtype, Arc::clone(&self.runtime));
        let id = tensor.id();
        self.tensors.push(tensor);
        id
    }

    /// Adopts an externally created tensor.
    ///
    /// Fails with [`GraphError::RuntimeMismatch`] when the tensor lives on
    /// a different runtime than the graph.
    pub fn add_external_tensor(&mut self, tensor: Tensor) -> Result<TensorId> {
        if tensor.runtime().id() != self.runtime.id() {
            return Err(GraphError::RuntimeMismatch {
                tensor: tensor.runtime().name().to_string(),
                graph: self.runtime.name().to_string(),
            });
        }
        let id = tensor.id();
        self.tensors.push(tensor);
        Ok(id)
    }

    pub fn tensors(&self) -> &[Tensor] {
        &self.tensors
    }

    pub fn ops(&self) -> &[Operator] {
        &self.ops
    }

    pub fn tensor(&self, id: TensorId) -> &Tensor {
        self.tensors
            .iter()
            .find(|tensor| tensor.id() == id)
            .expect("tensor id must be live in this graph")
    }

    pub fn op(&self, id: OpId) -> &Operator {
        self.ops
            .iter()
            .find(|op| op.id() == id)
            .expect("operator id must be live in this graph")
    }

    /// Looks a tensor up by its functional id.
    pub fn tensor_by_fuid(&self, fuid: u64) -> Option<&Tensor> {
        self.tensors.iter().find(|tensor| tensor.fuid() == fuid)
    }

    /// The output tensor of `op` at `index`.
    pub fn op_output(&self, op: OpId, index: usize) -> TensorId {
        self.op(op).outputs()[index]
    }

    /// Graph inputs: tensors no operator produces.
    pub fn inputs(&self) -> Vec<TensorId> {
        self.tensors
            .iter()
            .filter(|tensor| tensor.source().is_none())
            .map(|tensor| tensor.id())
            .collect()
    }

    /// Graph outputs: tensors no operator consumes.
    pub fn outputs(&self) -> Vec<TensorId> {
        self.tensors
            .iter()
            .filter(|tensor| tensor.targets().is_empty())
            .map(|tensor| tensor.id())
            .collect()
    }

    /// Appends a Transpose over `input` with the given permutation.
    pub fn transpose(&mut self, input: TensorId, perm: Vec<usize>) -> Result<OpId> {
        self.add_op(OpKind::Transpose { perm }, vec![input])
    }

    /// Appends a MatMul over `a` and `b` with optional operand transposes.
    pub fn matmul(&mut self, a: TensorId, b: TensorId, trans_a: bool, trans_b: bool) -> Result<OpId> {
        self.add_op(OpKind::MatMul { trans_a, trans_b }, vec![a, b])
    }

    /// Appends a Concat of `inputs` along `axis`.
    ///
    /// The axis may be negative; it is normalized against the rank of the
    /// first input.
    pub fn concat(&mut self, inputs: &[TensorId], axis: isize) -> Result<OpId> {
        let first = inputs
            .first()
            .ok_or(GraphError::ShapeInferFailed { op: "Concat" })?;
        let rank = self.tensor(*first).rank();
        let axis = normalize_axis(axis, rank)?;
        self.add_op(OpKind::Concat { axis }, inputs.to_vec())
    }

    pub fn relu(&mut self, input: TensorId) -> Result<OpId> {
        self.add_op(OpKind::Relu, vec![input])
    }

    pub fn add(&mut self, lhs: TensorId, rhs: TensorId) -> Result<OpId> {
        self.add_op(OpKind::Add, vec![lhs, rhs])
    }

    /// Re-instantiates an operator: same kind and parameters, same inputs,
    /// freshly created outputs.
    pub fn clone_op(&mut self, op: OpId) -> Result<OpId> {
        let (kind, inputs) = {
            let op = self.op(op);
            (op.kind().clone(), op.inputs().to_vec())
        };
        self.add_op(kind, inputs)
    }

    /// Appends an operator whose outputs already exist in the graph.
    ///
    /// No eager shape inference runs; `shape_infer` reconciles the output
    /// shapes later. This is the escape hatch for wiring a producer to a
    /// tensor that downstream operators already consume.
    pub fn add_op_with_outputs(
        &mut self,
        kind: OpKind,
        inputs: &[TensorId],
        outputs: &[TensorId],
    ) -> Result<OpId> {
        for &id in inputs.iter().chain(outputs) {
            if !self.contains_tensor(id) {
                return Err(GraphError::ValidationFailed(format!(
                    "tensor {id} is not part of this graph"
                )));
            }
        }
        let mut op = Operator::new(kind, inputs.to_vec());
        for &output in outputs {
            op.push_output(output);
        }
        let id = op.id();
        self.connect(&mut op);
        self.ops.push(op);
        self.sorted = false;
        Ok(id)
    }

    /// Constructs the operator, synthesizes its outputs, and wires every
    /// tensor and operator edge. Output shapes are inferred eagerly from
    /// the current input shapes.
    fn add_op(&mut self, kind: OpKind, inputs: Vec<TensorId>) -> Result<OpId> {
        let input_shapes: Vec<Shape> = inputs
            .iter()
            .map(|&input| self.tensor(input).shape().clone())
            .collect();
        let output_shapes = kind.infer_shape(&input_shapes)?;
        let dtype = self.tensor(inputs[0]).dtype();

        let mut op = Operator::new(kind, inputs);
        for shape in output_shapes {
            let output = self.add_tensor(shape, dtype);
            op.push_output(output);
        }
        let id = op.id();
        self.connect(&mut op);
        self.ops.push(op);
        self.sorted = false;
        Ok(id)
    }

    /// Establishes the bidirectional tensor and operator edges for `op`.
    fn connect(&mut self, op: &mut Operator) {
        let id = op.id();
        let inputs = op.inputs().to_vec();
        for input in inputs {
            let source = {
                let tensor = self.tensor_mut(input);
                tensor.add_target(id);
                tensor.source()
            };
            if let Some(pred) = source {
                op.add_predecessor(pred);
                self.op_mut(pred).add_successor(id);
            }
        }
        let outputs = op.outputs().to_vec();
        for output in outputs {
            let consumers = {
                let tensor = self.tensor_mut(output);
                tensor.set_source(Some(id));
                tensor.targets().to_vec()
            };
            // An output may already be consumed when it was wired up ahead
            // of its producer.
            for succ in consumers {
                op.add_successor(succ);
                if succ == id {
                    // The operator consumes its own output; it is not in
                    // the op list yet, so edit it directly.
                    op.add_predecessor(id);
                } else {
                    self.op_mut(succ).add_predecessor(id);
                }
            }
        }
    }

    /// Checks every structural invariant of the tensor/operator wiring.
    pub fn check_valid(&self) -> Result<()> {
        for tensor in &self.tensors {
            let id = tensor.id();
            if tensor.source().is_none() && tensor.targets().is_empty() {
                return Err(GraphError::ValidationFailed(format!(
                    "tensor {id} has neither a source nor targets"
                )));
            }
            for &target in tensor.targets() {
                if !self.contains_op(target) {
                    return Err(GraphError::ValidationFailed(format!(
                        "tensor {id} targets operator {target}, which is not in the graph"
                    )));
                }
                if !self.op(target).inputs().contains(&id) {
                    return Err(GraphError::ValidationFailed(format!(
                        "tensor {id} targets operator {target}, which does not consume it"
                    )));
                }
            }
            if let Some(source) = tensor.source() {
                if !self.contains_op(source) {
                    return Err(GraphError::ValidationFailed(format!(
                        "tensor {id} names source {source}, which is not in the graph"
                    )));
                }
                if !self.op(source).outputs().contains(&id) {
                    return Err(GraphError::ValidationFailed(format!(
                        "tensor {id} names source {source}, which does not produce it"
                    )));
                }
            }
        }
        for op in &self.ops {
            let id = op.id();
            for &input in op.inputs() {
                if !self.contains_tensor(input) {
                    return Err(GraphError::ValidationFailed(format!(
                        "operator {id} consumes tensor {input}, which is not in the graph"
                    )));
                }
                if !self.tensor(input).targets().contains(&id) {
                    return Err(GraphError::ValidationFailed(format!(
                        "operator {id} consumes tensor {input}, which does not target it"
                    )));
                }
            }
            for &output in op.outputs() {
                if !self.contains_tensor(output) {
                    return Err(GraphError::ValidationFailed(format!(
                        "operator {id} produces tensor {output}, which is not in the graph"
                    )));
                }
                if self.tensor(output).source() != Some(id) {
                    return Err(GraphError::ValidationFailed(format!(
                        "operator {id} produces tensor {output}, which names another source"
                    )));
                }
            }
            for &pred in op.predecessors() {
                if !self.contains_op(pred) {
                    return Err(GraphError::ValidationFailed(format!(
                        "operator {id} lists predecessor {pred}, which is not in the graph"
                    )));
                }
            }
            for &succ in op.successors() {
                if !self.contains_op(succ) {
                    return Err(GraphError::ValidationFailed(format!(
                        "operator {id} lists successor {succ}, which is not in the graph"
                    )));
                }
            }
        }
        let mut fuids = HashSet::with_capacity(self.tensors.len());
        for tensor in &self.tensors {
            if !fuids.insert(tensor.fuid()) {
                return Err(GraphError::ValidationFailed(format!(
                    "functional id {} appears on more than one tensor",
                    tensor.fuid()
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn tensor_mut(&mut self, id: TensorId) -> &mut Tensor {
        self.tensors
            .iter_mut()
            .find(|tensor| tensor.id() == id)
            .expect("tensor id must be live in this graph")
    }

    pub(crate) fn op_mut(&mut self, id: OpId) -> &mut Operator {
        self.ops
            .iter_mut()
            .find(|op| op.id() == id)
            .expect("operator id must be live in this graph")
    }

    pub(crate) fn remove_tensor(&mut self, id: TensorId) {
        self.tensors.retain(|tensor| tensor.id() != id);
    }

    pub(crate) fn remove_op(&mut self, id: OpId) {
        self.ops.retain(|op| op.id() != id);
    }

    fn contains_tensor(&self, id: TensorId) -> bool {
        self.tensors.iter().any(|tensor| tensor.id() == id)
    }

    fn contains_op(&self, id: OpId) -> bool {
        self.ops.iter().any(|op| op.id() == id)
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Graph tensors:")?;
        for tensor in &self.tensors {
            writeln!(f, "  {tensor}")?;
        }
        writeln!(f, "Graph operators:")?;
        for op in &self.ops {
            writeln!(
                f,
                "  Op {} {}, pred {:?}, succ {:?}",
                op.id(),
                op,
                op.predecessors(),
                op.successors()
            )?;
        }
        Ok(())
    }
}

//! Topological scheduling, shape inference, and static memory planning.

use std::collections::{HashMap, HashSet};
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::{GraphError, Result};
use crate::ops::{OpId, Operator};
use crate::runtime::Blob;
use crate::tensor::Shape;

use super::Graph;

impl Graph {
    /// Reorders the operator list into a topological order.
    ///
    /// A Kahn-style fixpoint: each pass emits every not-yet-emitted
    /// operator whose inputs are either graph inputs or outputs of already
    /// emitted operators, preserving insertion order among ready
    /// operators. A pass that emits nothing means the remaining operators
    /// form a cycle.
    pub fn topo_sort(&mut self) -> Result<()> {
        if self.sorted {
            return Ok(());
        }
        let mut order: Vec<usize> = Vec::with_capacity(self.ops.len());
        let mut emitted: HashSet<OpId> = HashSet::with_capacity(self.ops.len());
        while order.len() < self.ops.len() {
            let mut modified = false;
            for (index, op) in self.ops.iter().enumerate() {
                if emitted.contains(&op.id()) {
                    continue;
                }
                let ready = op.inputs().iter().all(|&input| {
                    match self.tensor(input).source() {
                        None => true,
                        Some(source) => emitted.contains(&source),
                    }
                });
                if ready {
                    emitted.insert(op.id());
                    order.push(index);
                    modified = true;
                }
            }
            if !modified {
                return Err(GraphError::GraphHasCycle);
            }
        }
        let mut drained: Vec<Option<Operator>> = self.ops.drain(..).map(Some).collect();
        self.ops = order
            .into_iter()
            .map(|index| drained[index].take().expect("each op is emitted once"))
            .collect();
        self.sorted = true;
        Ok(())
    }

    /// Propagates concrete shapes from graph inputs through every operator.
    ///
    /// Sorts first if needed; inference must see producers before
    /// consumers. Output tensors are only touched when their stored shape
    /// disagrees with the inferred one.
    pub fn shape_infer(&mut self) -> Result<()> {
        self.topo_sort()?;
        for index in 0..self.ops.len() {
            let (input_shapes, outputs, name) = {
                let op = &self.ops[index];
                let shapes: Vec<Shape> = op
                    .inputs()
                    .iter()
                    .map(|&input| self.tensor(input).shape().clone())
                    .collect();
                (shapes, op.outputs().to_vec(), op.kind().name())
            };
            let inferred = self.ops[index].infer_shape(&input_shapes)?;
            if inferred.len() != outputs.len() {
                return Err(GraphError::ShapeInferFailed { op: name });
            }
            for (output, shape) in outputs.into_iter().zip(inferred) {
                if self.tensor(output).shape() != &shape {
                    self.tensor_mut(output).set_shape(shape);
                }
            }
        }
        Ok(())
    }

    /// Plans one contiguous buffer for every tensor and binds it.
    ///
    /// Offsets are assigned in tensor insertion order, all before the
    /// single materialization, so the allocator discovers the true peak
    /// first. Lifetime-aware reuse is deliberately not attempted; the
    /// allocator's `free` is available to a smarter planner.
    pub fn data_malloc(&mut self) -> Result<()> {
        self.topo_sort()?;

        let Graph {
            tensors, allocator, ..
        } = self;
        let mut offsets: HashMap<u64, usize> = HashMap::with_capacity(tensors.len());
        for tensor in tensors.iter() {
            let offset = allocator.alloc(tensor.bytes())?;
            offsets.insert(tensor.fuid(), offset);
        }
        tracing::debug!(
            tensors = self.tensors.len(),
            peak = self.allocator.peak(),
            "planned static buffer layout"
        );

        let base = self.allocator.ptr();
        let runtime = Arc::clone(&self.runtime);
        for tensor in &mut self.tensors {
            let offset = offsets[&tensor.fuid()];
            // Offsets stay within the materialized buffer, so the add is in
            // bounds and non-null.
            let ptr = unsafe { NonNull::new_unchecked(base.as_ptr().add(offset)) };
            tensor.bind_buffer(Blob::new(Arc::clone(&runtime), ptr))?;
        }
        Ok(())
    }
}

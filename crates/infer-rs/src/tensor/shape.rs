//! Tensor shapes and the dimension arithmetic used by shape inference.

use std::fmt;

use crate::error::{GraphError, Result};

/// Stores the logical dimensions of a tensor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    /// Constructs a new shape from the provided dimensions.
    pub fn new<D: Into<Vec<usize>>>(dims: D) -> Self {
        Shape { dims: dims.into() }
    }

    /// Borrow the raw dimension slice for downstream calculations.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Returns the rank (number of axes) of the shape.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Computes the total number of elements implied by the shape.
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    /// Computes row-major contiguous strides for this shape.
    ///
    /// For a shape `[d0, d1, d2]` the strides are `[d1*d2, d2, 1]`.
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1usize; self.dims.len()];
        for axis in (0..self.dims.len().saturating_sub(1)).rev() {
            strides[axis] = strides[axis + 1] * self.dims[axis + 1];
        }
        strides
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.dims)
    }
}

/// Computes the ONNX/NumPy bidirectional broadcast of two shapes.
///
/// The shapes are right-aligned and missing leading dimensions are treated
/// as 1. Each aligned pair must be equal or contain a 1; anything else is a
/// [`GraphError::ShapeMismatch`].
pub fn broadcast(lhs: &Shape, rhs: &Shape) -> Result<Shape> {
    let a = lhs.dims();
    let b = rhs.dims();
    let rank = a.len().max(b.len());
    let mut out = vec![0usize; rank];
    for i in 0..rank {
        let dim_a = if i < a.len() { a[a.len() - 1 - i] } else { 1 };
        let dim_b = if i < b.len() { b[b.len() - 1 - i] } else { 1 };
        out[rank - 1 - i] = if dim_a == dim_b {
            dim_a
        } else if dim_a == 1 {
            dim_b
        } else if dim_b == 1 {
            dim_a
        } else {
            return Err(GraphError::ShapeMismatch {
                lhs: a.to_vec(),
                rhs: b.to_vec(),
            });
        };
    }
    Ok(Shape::new(out))
}

/// Maps a possibly negative axis index into `[0, rank)`.
pub fn normalize_axis(axis: isize, rank: usize) -> Result<usize> {
    let signed_rank = rank as isize;
    if axis < -signed_rank || axis >= signed_rank {
        return Err(GraphError::AxisOutOfRange { axis, rank });
    }
    if axis < 0 {
        Ok((signed_rank + axis) as usize)
    } else {
        Ok(axis as usize)
    }
}

/// Decomposes a linear row-major offset into per-axis coordinates.
pub fn linear_to_multi(mut linear: usize, shape: &Shape) -> Vec<usize> {
    let mut index = vec![0usize; shape.rank()];
    for (slot, &extent) in index.iter_mut().rev().zip(shape.dims().iter().rev()) {
        *slot = linear % extent;
        linear /= extent;
    }
    index
}

/// Folds per-axis coordinates back into a linear offset.
///
/// Each coordinate is taken modulo the corresponding extent, so coordinates
/// produced against a broadcast result shape address the smaller operand
/// correctly.
pub fn multi_to_linear(index: &[usize], shape: &Shape, strides: &[usize]) -> usize {
    debug_assert_eq!(index.len(), shape.rank());
    debug_assert_eq!(strides.len(), shape.rank());
    index
        .iter()
        .zip(shape.dims())
        .zip(strides)
        .map(|((&coord, &extent), &stride)| (coord % extent) * stride)
        .sum()
}

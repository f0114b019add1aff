//! Tensors: typed multi-dimensional value carriers wired into a graph.
//!
//! A tensor records its shape, dtype, and position in the computation graph
//! (the producing operator and the consuming operators) as plain integer
//! ids. The ids are resolved against the owning [`Graph`](crate::graph::Graph);
//! they never extend an operator's lifetime.

mod dtype;
mod shape;

pub use dtype::DType;
pub use shape::{broadcast, linear_to_multi, multi_to_linear, normalize_axis, Shape};

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use half::{bf16, f16};

use crate::error::{GraphError, Result};
use crate::ops::OpId;
use crate::runtime::{Blob, Runtime};

static NEXT_TENSOR_ID: AtomicU32 = AtomicU32::new(0);
static NEXT_FUID: AtomicU64 = AtomicU64::new(0);

/// Identifies one tensor instance within its owning graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(u32);

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scalar types that can be written to and read back from a tensor buffer.
pub trait Element: Copy + PartialEq + 'static {
    /// The dtype tag matching this scalar representation.
    const DTYPE: DType;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:expr),* $(,)?) => {
        $(impl Element for $ty {
            const DTYPE: DType = $dtype;
        })*
    };
}

impl_element! {
    f16 => DType::F16,
    bf16 => DType::Bf16,
    f32 => DType::F32,
    f64 => DType::F64,
    i8 => DType::I8,
    i16 => DType::I16,
    i32 => DType::I32,
    i64 => DType::I64,
    u8 => DType::U8,
    u16 => DType::U16,
    u32 => DType::U32,
    u64 => DType::U64,
}

/// Typed value carrier owned by a graph.
pub struct Tensor {
    id: TensorId,
    fuid: u64,
    shape: Shape,
    dtype: DType,
    runtime: Arc<dyn Runtime>,
    source: Option<OpId>,
    targets: Vec<OpId>,
    data: Option<Blob>,
}

impl Tensor {
    /// Creates a fresh tensor with a new functional id and no wiring.
    pub fn new(shape: Shape, dtype: DType, runtime: Arc<dyn Runtime>) -> Self {
        Tensor {
            id: TensorId(NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed)),
            fuid: NEXT_FUID.fetch_add(1, Ordering::Relaxed),
            shape,
            dtype,
            runtime,
            source: None,
            targets: Vec::new(),
            data: None,
        }
    }

    /// Structural copy with a fresh instance id but the same functional id.
    ///
    /// Wiring and any bound buffer are not carried over; the clone belongs
    /// to whichever graph adopts it.
    pub fn clone_detached(&self) -> Tensor {
        Tensor {
            id: TensorId(NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed)),
            fuid: self.fuid,
            shape: self.shape.clone(),
            dtype: self.dtype,
            runtime: Arc::clone(&self.runtime),
            source: None,
            targets: Vec::new(),
            data: None,
        }
    }

    pub fn id(&self) -> TensorId {
        self.id
    }

    /// Functional unique id, stable under [`Tensor::clone_detached`].
    pub fn fuid(&self) -> u64 {
        self.fuid
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    /// Number of elements (product of the dimensions).
    pub fn size(&self) -> usize {
        self.shape.num_elements()
    }

    /// Number of bytes required to store the elements contiguously.
    pub fn bytes(&self) -> usize {
        self.size() * self.dtype.size_in_bytes()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }

    /// The operator producing this tensor, if any.
    pub fn source(&self) -> Option<OpId> {
        self.source
    }

    /// The operators consuming this tensor. An operator appears once per
    /// input slot it occupies, so duplicates are meaningful.
    pub fn targets(&self) -> &[OpId] {
        &self.targets
    }

    /// The buffer bound by memory planning, if planning has run.
    pub fn blob(&self) -> Option<&Blob> {
        self.data.as_ref()
    }

    /// Attaches a planned device-memory region.
    ///
    /// Re-binding the same blob is a no-op; binding a distinct one fails
    /// with [`GraphError::AlreadyBound`].
    pub fn bind_buffer(&mut self, blob: Blob) -> Result<()> {
        match &self.data {
            Some(existing) if *existing != blob => Err(GraphError::AlreadyBound),
            Some(_) => Ok(()),
            None => {
                self.data = Some(blob);
                Ok(())
            }
        }
    }

    /// Copies `values` into the bound buffer.
    ///
    /// Panics if the dtype or element count disagrees or planning has not
    /// run; this is a development/test surface, not an execution path.
    pub fn fill<T: Element>(&self, values: &[T]) {
        assert_eq!(T::DTYPE, self.dtype, "fill dtype must match the tensor");
        assert_eq!(
            values.len(),
            self.size(),
            "fill length must match the element count"
        );
        let blob = self
            .data
            .as_ref()
            .expect("tensor buffer must be planned before filling");
        unsafe {
            std::ptr::copy_nonoverlapping(values.as_ptr(), blob.as_ptr() as *mut T, values.len());
        }
    }

    /// Reads the bound buffer as a typed slice.
    ///
    /// Returns `None` when the tensor is unbound or `T` does not match the
    /// tensor's dtype.
    pub fn data<T: Element>(&self) -> Option<&[T]> {
        if T::DTYPE != self.dtype {
            return None;
        }
        self.typed_slice::<T>()
    }

    /// Elementwise comparison of two planned tensors.
    ///
    /// Integer dtypes must match exactly. Floating-point values compare by
    /// relative error against the larger magnitude, falling back to the
    /// absolute difference when either value is zero. Returns `false` on
    /// any size or dtype mismatch and when either tensor is unbound.
    pub fn equal_data(&self, rhs: &Tensor, relative_error: f64) -> bool {
        if self.dtype != rhs.dtype || self.size() != rhs.size() {
            return false;
        }
        match self.dtype {
            DType::F16 => self.equal_float::<f16>(rhs, relative_error),
            DType::Bf16 => self.equal_float::<bf16>(rhs, relative_error),
            DType::F32 => self.equal_float::<f32>(rhs, relative_error),
            DType::F64 => self.equal_float::<f64>(rhs, relative_error),
            DType::I8 => self.equal_exact::<i8>(rhs),
            DType::I16 => self.equal_exact::<i16>(rhs),
            DType::I32 => self.equal_exact::<i32>(rhs),
            DType::I64 => self.equal_exact::<i64>(rhs),
            DType::U8 | DType::Bool => self.equal_exact::<u8>(rhs),
            DType::U16 => self.equal_exact::<u16>(rhs),
            DType::U32 => self.equal_exact::<u32>(rhs),
            DType::U64 => self.equal_exact::<u64>(rhs),
        }
    }

    /// Overwrites the shape. Reserved for shape inference; callers go
    /// through the graph.
    pub(crate) fn set_shape(&mut self, shape: Shape) {
        self.shape = shape;
    }

    pub(crate) fn add_target(&mut self, op: OpId) {
        self.targets.push(op);
    }

    /// Removes every target entry referring to `op`.
    pub(crate) fn remove_target(&mut self, op: OpId) {
        self.targets.retain(|&target| target != op);
    }

    pub(crate) fn set_source(&mut self, op: Option<OpId>) {
        self.source = op;
    }

    fn typed_slice<T: Copy>(&self) -> Option<&[T]> {
        let count = self.size();
        if count == 0 {
            return Some(&[]);
        }
        let blob = self.data.as_ref()?;
        debug_assert_eq!(std::mem::size_of::<T>(), self.dtype.size_in_bytes());
        Some(unsafe { std::slice::from_raw_parts(blob.as_ptr() as *const T, count) })
    }

    fn equal_exact<T: Element>(&self, rhs: &Tensor) -> bool {
        match (self.typed_slice::<T>(), rhs.typed_slice::<T>()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    fn equal_float<T>(&self, rhs: &Tensor, relative_error: f64) -> bool
    where
        T: Copy + Into<f64>,
    {
        let (Some(a), Some(b)) = (self.typed_slice::<T>(), rhs.typed_slice::<T>()) else {
            return false;
        };
        a.iter()
            .zip(b)
            .all(|(&x, &y)| close_enough(x.into(), y.into(), relative_error))
    }
}

fn close_enough(x: f64, y: f64, relative_error: f64) -> bool {
    let smaller = x.abs().min(y.abs());
    if smaller == 0.0 {
        (x - y).abs() <= relative_error
    } else {
        (x - y).abs() / x.abs().max(y.abs()) <= relative_error
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor {} (fuid {}, {} {})",
            self.id, self.fuid, self.dtype, self.shape
        )?;
        if let Some(source) = self.source {
            write!(f, ", source {source}")?;
        }
        if !self.targets.is_empty() {
            write!(f, ", targets {:?}", self.targets)?;
        }
        Ok(())
    }
}

pub mod error;
pub mod graph;
pub mod memory;
pub mod ops;
pub mod runtime;
pub mod tensor;

pub use error::{GraphError, Result};
pub use graph::Graph;
pub use memory::{MemoryInfo, PoolAllocator};
pub use ops::{OpId, OpKind, Operator};
pub use runtime::{Blob, CpuRuntime, Runtime, RuntimeId};
pub use tensor::{DType, Shape, Tensor, TensorId};

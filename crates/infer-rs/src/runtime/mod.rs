//! Device abstraction consumed by the memory planner.
//!
//! The core never talks to device APIs directly: it asks a [`Runtime`] for
//! one backing buffer per graph and hands out [`Blob`] views into it. Kernel
//! execution, streams, and transfers are the runtime's concern.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_RUNTIME_ID: AtomicU64 = AtomicU64::new(0);

/// Process-unique identity of a runtime instance.
///
/// Two handles compare equal exactly when they refer to the same device
/// instance; this is what the graph checks when adopting foreign tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuntimeId(u64);

impl RuntimeId {
    fn fresh() -> Self {
        RuntimeId(NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Synchronous device-memory provider backing one or more graphs.
///
/// Both entry points are infallible from the core's perspective; runtime
/// level failures (OOM, device loss) are the implementation's concern.
pub trait Runtime {
    /// Stable identity of this runtime instance.
    fn id(&self) -> RuntimeId;

    /// Human-readable device name used in diagnostics.
    fn name(&self) -> &str;

    /// Acquires `nbytes` of device memory, 8-byte aligned.
    fn alloc(&self, nbytes: usize) -> NonNull<u8>;

    /// Releases a buffer previously returned by [`Runtime::alloc`].
    ///
    /// # Safety
    ///
    /// `ptr` must originate from `alloc` on this runtime with the same
    /// `nbytes`, and must not be used afterwards.
    unsafe fn dealloc(&self, ptr: NonNull<u8>, nbytes: usize);
}

/// Host-memory runtime backed by the global allocator.
pub struct CpuRuntime {
    id: RuntimeId,
}

impl CpuRuntime {
    /// Allocation alignment; covers the widest supported dtype.
    pub const ALIGNMENT: usize = 8;

    pub fn new() -> Self {
        CpuRuntime {
            id: RuntimeId::fresh(),
        }
    }

    fn layout(nbytes: usize) -> Layout {
        Layout::from_size_align(nbytes, Self::ALIGNMENT)
            .expect("allocation size must fit the layout limit")
    }
}

impl Default for CpuRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime for CpuRuntime {
    fn id(&self) -> RuntimeId {
        self.id
    }

    fn name(&self) -> &str {
        "cpu"
    }

    fn alloc(&self, nbytes: usize) -> NonNull<u8> {
        if nbytes == 0 {
            return NonNull::dangling();
        }
        let layout = Self::layout(nbytes);
        let raw = unsafe { alloc_zeroed(layout) };
        NonNull::new(raw).unwrap_or_else(|| handle_alloc_error(layout))
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, nbytes: usize) {
        if nbytes == 0 {
            return;
        }
        dealloc(ptr.as_ptr(), Self::layout(nbytes));
    }
}

/// Non-owning view into a planned buffer: the runtime that owns the memory
/// plus the address assigned to one tensor.
///
/// The execution layer reads and writes tensor data through this handle; the
/// pool allocator retains ownership of the underlying buffer.
#[derive(Clone)]
pub struct Blob {
    runtime: Arc<dyn Runtime>,
    ptr: NonNull<u8>,
}

impl Blob {
    pub fn new(runtime: Arc<dyn Runtime>, ptr: NonNull<u8>) -> Self {
        Blob { runtime, ptr }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }
}

impl PartialEq for Blob {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr && self.runtime.id() == other.runtime.id()
    }
}

impl Eq for Blob {}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("runtime", &self.runtime.name())
            .field("ptr", &self.ptr)
            .finish()
    }
}

//! First-fit pool allocator behind static memory planning.

use std::collections::BTreeMap;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::{GraphError, Result};
use crate::runtime::Runtime;

/// Offset-based pool allocator with free-block coalescing and tail reclaim.
///
/// Planning happens entirely on paper: [`PoolAllocator::alloc`] hands out
/// byte offsets and only tracks the high-water mark. The backing device
/// buffer is materialized lazily, exactly once, on the first
/// [`PoolAllocator::ptr`] call, sized to the peak the plan reached. Once
/// materialized the layout is frozen; further `alloc`/`free` calls fail.
///
/// When `free` is never called the pool degenerates to a monotonic bump
/// allocator, which is the common case for a planner that does not yet
/// exploit tensor lifetimes.
pub struct PoolAllocator {
    runtime: Arc<dyn Runtime>,
    alignment: usize,
    used: usize,
    peak: usize,
    ptr: Option<NonNull<u8>>,
    /// offset -> size; entries are never adjacent or overlapping.
    free_blocks: BTreeMap<usize, usize>,
}

/// Snapshot of allocator usage for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    /// Bytes currently assigned to live allocations.
    pub used: usize,
    /// High-water offset; the size the backing buffer materializes with.
    pub peak: usize,
}

impl fmt::Display for MemoryInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "used {} B, peak {} B", self.used, self.peak)
    }
}

impl PoolAllocator {
    /// Default request alignment; upper-bounds every supported dtype size.
    pub const DEFAULT_ALIGNMENT: usize = 8;

    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        PoolAllocator {
            runtime,
            alignment: Self::DEFAULT_ALIGNMENT,
            used: 0,
            peak: 0,
            ptr: None,
            free_blocks: BTreeMap::new(),
        }
    }

    /// Assigns an offset for `size` bytes, first-fit over the free list.
    ///
    /// The request is padded to the alignment. If no free block fits, the
    /// pool grows at the tail.
    pub fn alloc(&mut self, size: usize) -> Result<usize> {
        if self.ptr.is_some() {
            return Err(GraphError::AllocAfterMaterialize);
        }
        let size = self.aligned(size);
        let fit = self
            .free_blocks
            .iter()
            .find(|&(_, &block)| block >= size)
            .map(|(&offset, &block)| (offset, block));
        let offset = match fit {
            Some((offset, block)) => {
                self.free_blocks.remove(&offset);
                let remaining = block - size;
                if remaining > 0 {
                    self.free_blocks.insert(offset + size, remaining);
                }
                offset
            }
            None => {
                let offset = self.peak;
                self.peak += size;
                offset
            }
        };
        self.used += size;
        Ok(offset)
    }

    /// Returns `size` bytes at `offset` to the pool.
    ///
    /// The block is coalesced with adjacent free neighbours; a block that
    /// then touches the peak is reclaimed and the peak shrinks. The caller
    /// must pass an `(offset, size)` pair previously handed out by
    /// [`PoolAllocator::alloc`].
    pub fn free(&mut self, offset: usize, size: usize) -> Result<()> {
        if self.ptr.is_some() {
            return Err(GraphError::AllocAfterMaterialize);
        }
        let size = self.aligned(size);
        self.used -= size;

        let mut start = offset;
        let mut len = size;
        if let Some((&next_offset, &next_len)) = self.free_blocks.range(offset + size..).next() {
            if offset + size == next_offset {
                self.free_blocks.remove(&next_offset);
                len += next_len;
            }
        }
        if let Some((&prev_offset, &prev_len)) = self.free_blocks.range(..offset).next_back() {
            if prev_offset + prev_len == offset {
                self.free_blocks.remove(&prev_offset);
                start = prev_offset;
                len += prev_len;
            }
        }
        if start + len == self.peak {
            self.peak = start;
        } else {
            self.free_blocks.insert(start, len);
        }
        Ok(())
    }

    /// The materialized backing buffer.
    ///
    /// The first call allocates `peak` bytes from the runtime; subsequent
    /// calls return the same pointer.
    pub fn ptr(&mut self) -> NonNull<u8> {
        if let Some(ptr) = self.ptr {
            return ptr;
        }
        let ptr = self.runtime.alloc(self.peak);
        tracing::debug!(peak = self.peak, "materialized pool backing buffer");
        self.ptr = Some(ptr);
        ptr
    }

    pub fn info(&self) -> MemoryInfo {
        MemoryInfo {
            used: self.used,
            peak: self.peak,
        }
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn peak(&self) -> usize {
        self.peak
    }

    /// Current free blocks in ascending offset order.
    pub fn free_blocks(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.free_blocks.iter().map(|(&offset, &len)| (offset, len))
    }

    fn aligned(&self, size: usize) -> usize {
        size.div_ceil(self.alignment) * self.alignment
    }
}

impl Drop for PoolAllocator {
    fn drop(&mut self) {
        if let Some(ptr) = self.ptr.take() {
            // Materialization froze the layout, so `peak` still matches the
            // size the buffer was allocated with.
            unsafe { self.runtime.dealloc(ptr, self.peak) };
        }
    }
}

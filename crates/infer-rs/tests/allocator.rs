use std::sync::Arc;

use infer_rs::{CpuRuntime, GraphError, PoolAllocator};

fn allocator() -> PoolAllocator {
    PoolAllocator::new(Arc::new(CpuRuntime::new()))
}

fn free_blocks(allocator: &PoolAllocator) -> Vec<(usize, usize)> {
    allocator.free_blocks().collect()
}

/// `free_blocks` stays sorted, non-adjacent, and accounts for every byte
/// below the peak that is not in use.
fn assert_pool_invariants(allocator: &PoolAllocator) {
    let blocks = free_blocks(allocator);
    for window in blocks.windows(2) {
        let (offset, len) = window[0];
        let (next_offset, _) = window[1];
        assert!(
            offset + len < next_offset,
            "blocks {:?} are adjacent or overlapping",
            window
        );
    }
    let free_total: usize = blocks.iter().map(|&(_, len)| len).sum();
    assert_eq!(allocator.used() + free_total, allocator.peak());
}

#[test]
fn first_fit_reuses_freed_blocks() {
    let mut pool = allocator();
    assert_eq!(pool.alloc(10).unwrap(), 0);
    assert_eq!(pool.alloc(5).unwrap(), 16);
    pool.free(0, 10).unwrap();
    assert_eq!(free_blocks(&pool), vec![(0, 16)]);
    assert_pool_invariants(&pool);

    // 7 pads to 8 and splits the 16-byte hole at offset 0.
    assert_eq!(pool.alloc(7).unwrap(), 0);
    assert_eq!(free_blocks(&pool), vec![(8, 8)]);

    pool.free(16, 5).unwrap();
    pool.free(0, 7).unwrap();
    assert_eq!(pool.used(), 0);
    assert_eq!(pool.peak(), 0);
    assert!(free_blocks(&pool).is_empty());
}

#[test]
fn requests_round_up_to_alignment() {
    let mut pool = allocator();
    assert_eq!(pool.alloc(1).unwrap(), 0);
    assert_eq!(pool.alloc(1).unwrap(), 8);
    assert_eq!(pool.alloc(8).unwrap(), 16);
    assert_eq!(pool.used(), 24);
    assert_pool_invariants(&pool);
}

#[test]
fn first_fit_prefers_the_lowest_offset() {
    let mut pool = allocator();
    let a = pool.alloc(16).unwrap();
    let b = pool.alloc(16).unwrap();
    let c = pool.alloc(16).unwrap();
    let _guard = pool.alloc(8).unwrap();
    pool.free(a, 16).unwrap();
    pool.free(c, 16).unwrap();
    // Two holes of equal size: the scan returns the lower offset.
    assert_eq!(pool.alloc(16).unwrap(), a);
    assert_eq!(pool.alloc(16).unwrap(), c);
    pool.free(b, 16).unwrap();
    assert_pool_invariants(&pool);
}

#[test]
fn coalesces_in_both_directions() {
    let mut pool = allocator();
    let a = pool.alloc(16).unwrap();
    let b = pool.alloc(16).unwrap();
    let c = pool.alloc(16).unwrap();
    let _guard = pool.alloc(8).unwrap();

    pool.free(a, 16).unwrap();
    pool.free(c, 16).unwrap();
    assert_eq!(free_blocks(&pool), vec![(a, 16), (c, 16)]);

    // Freeing the middle block merges with both neighbours.
    pool.free(b, 16).unwrap();
    assert_eq!(free_blocks(&pool), vec![(0, 48)]);
    assert_pool_invariants(&pool);
}

#[test]
fn tail_reclaim_drains_the_pool() {
    let mut pool = allocator();
    let a = pool.alloc(24).unwrap();
    let b = pool.alloc(40).unwrap();
    let c = pool.alloc(8).unwrap();
    pool.free(b, 40).unwrap();
    pool.free(c, 8).unwrap();
    pool.free(a, 24).unwrap();
    assert_eq!(pool.used(), 0);
    assert_eq!(pool.peak(), 0);
    assert!(free_blocks(&pool).is_empty());
}

#[test]
fn exhausted_free_list_grows_the_tail() {
    let mut pool = allocator();
    let a = pool.alloc(8).unwrap();
    let _b = pool.alloc(8).unwrap();
    pool.free(a, 8).unwrap();
    // The 8-byte hole cannot satisfy 16 bytes; the pool grows instead.
    assert_eq!(pool.alloc(16).unwrap(), 16);
    assert_eq!(pool.peak(), 32);
    assert_pool_invariants(&pool);
}

#[test]
fn materialization_freezes_the_layout() {
    let mut pool = allocator();
    let offset = pool.alloc(32).unwrap();
    let first = pool.ptr();
    let second = pool.ptr();
    assert_eq!(first, second);

    let err = pool.alloc(8).expect_err("alloc after materialize should fail");
    assert!(matches!(err, GraphError::AllocAfterMaterialize));
    let err = pool
        .free(offset, 32)
        .expect_err("free after materialize should fail");
    assert!(matches!(err, GraphError::AllocAfterMaterialize));
}

#[test]
fn info_reports_used_and_peak() {
    let mut pool = allocator();
    pool.alloc(10).unwrap();
    pool.alloc(30).unwrap();
    let info = pool.info();
    assert_eq!(info.used, 48);
    assert_eq!(info.peak, 48);
    assert_eq!(format!("{info}"), "used 48 B, peak 48 B");
}

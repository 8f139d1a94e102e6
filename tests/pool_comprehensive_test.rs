// Comprehensive buffer pool tests
// Exercises the allocation paths end to end: small-path isolation, class
// selection, arena growth and pruning, aligned round trips, bundle
// semantics, scatter/gather copies, and multi-threaded churn.

use iopool::{constants, BufOrigin, IoBufPool, IoBufRef, PoolStatsSnapshot, SIZE_CLASSES};
use rand::Rng;
use std::sync::Arc;
use std::thread;

fn class_of(stats: &PoolStatsSnapshot, page_size: usize) -> &iopool::ClassStatsSnapshot {
    stats
        .classes
        .iter()
        .find(|class| class.page_size == page_size)
        .unwrap()
}

fn assert_list_invariants(stats: &PoolStatsSnapshot) {
    for class in &stats.classes {
        for arena in &class.available {
            assert_eq!(arena.passive_cnt + arena.active_cnt, arena.page_count);
            assert!(arena.passive_cnt > 0, "available arena with no passive pages");
        }
        for arena in &class.filled {
            assert_eq!(arena.passive_cnt + arena.active_cnt, arena.page_count);
            assert_eq!(arena.passive_cnt, 0, "filled arena with passive pages");
            assert!(arena.active_cnt > 0, "filled arena with no active pages");
        }
        for arena in &class.purge {
            assert_eq!(arena.passive_cnt + arena.active_cnt, arena.page_count);
            assert_eq!(arena.active_cnt, 0, "purge arena with active pages");
        }
    }
}

#[test]
fn test_small_path_isolation() {
    let pool = IoBufPool::new();
    let baseline = pool.stats().arena_cnt;

    let buf = pool.get(64).unwrap();
    assert_eq!(buf.origin(), BufOrigin::Small);
    assert_eq!(buf.arena_id(), None);
    drop(buf);

    assert_eq!(pool.stats().arena_cnt, baseline);
}

#[test]
fn test_class_selection_across_sizes() {
    let pool = IoBufPool::new();

    for (request, expected_class) in [(130, 512), (600, 2048), (3000, 8192)] {
        let buf = pool.get(request).unwrap();
        assert_eq!(buf.size(), request);

        let stats = pool.stats();
        let class = class_of(&stats, expected_class);
        assert_eq!(
            class.available[0].active_cnt, 1,
            "request of {} bytes should land in the {}-byte class",
            request, expected_class
        );
    }
}

#[test]
fn test_arena_growth_and_selective_pruning() {
    let pool = IoBufPool::new();
    let config = SIZE_CLASSES[1];
    assert_eq!(config.page_size, 512);

    // Drain the pre-mapped arena completely.
    let mut held: Vec<_> = (0..config.num_pages).map(|_| pool.get(500).unwrap()).collect();
    let first_arena = held[0].arena_id().unwrap();

    let stats = pool.stats();
    let class = class_of(&stats, 512);
    assert!(class.available.is_empty());
    assert_eq!(class.filled.len(), 1);
    assert_eq!(class.filled[0].arena_id, first_arena);
    assert_eq!(class.filled[0].passive_cnt, 0);
    assert_eq!(class.filled[0].active_cnt, config.num_pages);

    // One more request maps a second arena.
    held.push(pool.get(500).unwrap());
    let second_arena = held.last().unwrap().arena_id().unwrap();
    assert_ne!(second_arena, first_arena);

    let stats = pool.stats();
    assert_eq!(stats.arena_cnt, SIZE_CLASSES.len() + 1);
    let class = class_of(&stats, 512);
    assert_eq!(class.available.len(), 1);
    assert_eq!(class.available[0].arena_id, second_arena);
    assert_eq!(class.filled.len(), 1);
    assert_list_invariants(&stats);

    // Returning everything drains the first arena while the second is
    // still available, so the first is unmapped and the second is held
    // back on the purge list.
    held.clear();
    let stats = pool.stats();
    assert_eq!(stats.arena_cnt, SIZE_CLASSES.len());
    let class = class_of(&stats, 512);
    assert!(class.available.is_empty());
    assert!(class.filled.is_empty());
    assert_eq!(class.purge.len(), 1);
    assert_eq!(class.purge[0].arena_id, second_arena);
    assert_list_invariants(&stats);
}

#[test]
fn test_pruning_holdback_and_resurrection() {
    let pool = IoBufPool::new();

    let buf = pool.get(2000).unwrap();
    let arena_id = buf.arena_id().unwrap();
    drop(buf);

    // Sole arena of its class: parked on purge, never unmapped.
    let stats = pool.stats();
    let class = class_of(&stats, 2048);
    assert_eq!(class.purge.len(), 1);
    assert_eq!(class.purge[0].arena_id, arena_id);
    assert_eq!(stats.arena_cnt, SIZE_CLASSES.len());

    pool.prune();
    assert_eq!(pool.stats().arena_cnt, SIZE_CLASSES.len());

    // A fresh request resurrects the purged arena instead of mapping.
    let buf = pool.get(2000).unwrap();
    assert_eq!(buf.arena_id(), Some(arena_id));
    let stats = pool.stats();
    let class = class_of(&stats, 2048);
    assert_eq!(class.available.len(), 1);
    assert!(class.purge.is_empty());
}

#[test]
fn test_aligned_get_round_trip() {
    let pool = IoBufPool::new();
    let before = pool.stats();

    let buf = pool.get_page_aligned(1000, 512).unwrap();
    assert_eq!(buf.as_ptr() as usize % 512, 0);
    assert!(buf.size() >= 1000);
    drop(buf);

    let after = pool.stats();
    let before_class = class_of(&before, 2048);
    let after_class = class_of(&after, 2048);
    assert_eq!(
        after_class.purge[0].passive_cnt,
        before_class.available[0].passive_cnt
    );
    assert_eq!(
        after_class.purge[0].mem_base,
        before_class.available[0].mem_base
    );
    assert_list_invariants(&after);
}

#[test]
fn test_bundle_merge_with_duplicates() {
    let pool = IoBufPool::new();
    let x = pool.get(1000).unwrap();
    let y = pool.get(1000).unwrap();
    let z = pool.get(1000).unwrap();

    let a = IoBufRef::new();
    a.add(&x).unwrap();
    a.add(&y).unwrap();
    let b = IoBufRef::new();
    b.add(&y).unwrap();
    b.add(&z).unwrap();

    let y_refs = y.ref_count();
    let z_refs = z.ref_count();
    a.merge(&b).unwrap();

    // Duplicate y is permitted; each merged entry took its own reference.
    assert_eq!(a.len(), 4);
    assert_eq!(a.size(), 4000);
    assert_eq!(y.ref_count(), y_refs + 1);
    assert_eq!(z.ref_count(), z_refs + 1);

    drop(a);
    drop(b);
    assert_eq!(x.ref_count(), 1);
    assert_eq!(y.ref_count(), 1);
    assert_eq!(z.ref_count(), 1);
}

#[test]
fn test_copy_round_trips_bytes() {
    let pool = IoBufPool::new();

    let chunks: Vec<Vec<u8>> = (0..5u8).map(|tag| vec![tag; 700]).collect();
    let sources: Vec<&[u8]> = chunks.iter().map(|chunk| chunk.as_slice()).collect();
    let flattened: Vec<u8> = chunks.concat();

    let (buf, bundle, iov) = pool.copy(&sources).unwrap();
    assert_eq!(iov.len, flattened.len());
    assert_eq!(iopool::iovec_length(&[buf.as_iovec(), iov]), 2 * flattened.len());
    assert_eq!(buf.ref_count(), 2);
    assert_eq!(bundle.len(), 1);

    let packed = unsafe { std::slice::from_raw_parts(iov.base as *const u8, iov.len) };
    assert_eq!(packed, flattened.as_slice());
}

#[test]
fn test_overflow_counts_request_misses() {
    let pool = IoBufPool::new();
    let largest = iopool::MAX_CLASS_PAGE_SIZE;

    let fitting = pool.get(largest).unwrap();
    assert_eq!(fitting.origin(), BufOrigin::Arena);
    assert_eq!(pool.stats().request_misses, 0);

    let over = pool.get(largest + 1).unwrap();
    assert_eq!(over.origin(), BufOrigin::Overflow);
    assert_eq!(over.as_ptr() as usize % constants::ALIGN_SIZE, 0);
    assert_eq!(pool.stats().request_misses, 1);
}

#[test]
fn test_concurrent_churn_preserves_invariants() {
    let pool = IoBufPool::new();
    let threads = 8;
    let iterations = 200;

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let mut rng = rand::rng();
                for _ in 0..iterations {
                    let size = rng.random_range(1..200_000);
                    let buf = pool.get(size).unwrap();
                    assert_eq!(buf.size(), size);

                    // Touch the buffer and share it through a bundle, the
                    // way a pipeline stage would.
                    unsafe { *buf.as_mut_ptr() = 0xa5 };
                    let bundle = IoBufRef::new();
                    bundle.add(&buf).unwrap();
                    let shared = buf.clone();
                    assert!(shared.ref_count() >= 2);
                    drop(shared);
                    drop(bundle);
                    assert_eq!(buf.ref_count(), 1);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let stats = pool.stats();
    assert_list_invariants(&stats);
    for class in &stats.classes {
        assert!(class.filled.is_empty(), "buffers leaked during churn");
        for arena in class.available.iter().chain(class.purge.iter()) {
            assert_eq!(arena.active_cnt, 0);
        }
    }
}

#[test]
fn test_stats_dump_reflects_active_buffers() {
    let pool = IoBufPool::new();
    let buf = pool.get(2000).unwrap();
    let extra = buf.clone();

    let dump = pool.stats_dump().unwrap();
    assert!(dump.contains("[iobuf.global]"));
    assert!(dump.contains("active_iobuf.1.ref=2"));

    drop(extra);
    drop(buf);
    let dump = pool.stats_dump().unwrap();
    assert!(!dump.contains("active_iobuf"));
}

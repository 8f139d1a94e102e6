// # Statedump Rendering
//
// Non-blocking text dump of the pool's counters for observability tooling.
// The dump try-locks the pool mutex and skips emission entirely when the
// data path holds it; individual buffer lines likewise try-lock their
// buffer and are skipped under contention.

use crate::arena::{Arena, SLOT_ACTIVE};
use crate::pool::IoBufPool;
use crate::types::SIZE_CLASSES;
use std::fmt::Write;
use std::sync::atomic::Ordering;

impl IoBufPool {
    /// Renders section/key-value lines describing every arena and its
    /// active buffers. Returns `None` instead of blocking when the pool
    /// mutex is contended.
    pub fn stats_dump(&self) -> Option<String> {
        let inner = self.inner.try_lock()?;

        let mut out = String::new();
        let _ = writeln!(out, "[iobuf.global]");
        let _ = writeln!(out, "iobuf_pool={:p}", self as *const _);
        let _ = writeln!(
            out,
            "iobuf_pool.default_page_size={}",
            self.default_page_size
        );
        let _ = writeln!(out, "iobuf_pool.arena_size={}", inner.arena_size);
        let _ = writeln!(out, "iobuf_pool.arena_cnt={}", inner.arena_cnt);
        let _ = writeln!(out, "iobuf_pool.request_misses={}", inner.request_misses);

        let mut section = 1;
        for class in 0..SIZE_CLASSES.len() {
            let lists = &inner.classes[class];
            for id in lists.available.iter() {
                if let Some(arena) = inner.arenas.get(id) {
                    dump_arena(&mut out, &format!("arena.{}", section), arena);
                    section += 1;
                }
            }
            for id in lists.purge.iter() {
                if let Some(arena) = inner.arenas.get(id) {
                    dump_arena(&mut out, &format!("purge.{}", section), arena);
                    section += 1;
                }
            }
            for id in lists.filled.iter() {
                if let Some(arena) = inner.arenas.get(id) {
                    dump_arena(&mut out, &format!("filled.{}", section), arena);
                    section += 1;
                }
            }
        }

        Some(out)
    }
}

fn dump_arena(out: &mut String, key: &str, arena: &Arena) {
    let _ = writeln!(out, "[iobuf.{}]", key);
    let _ = writeln!(out, "{}.mem_base={:p}", key, arena.mem_base.as_ptr());
    let _ = writeln!(out, "{}.active_cnt={}", key, arena.active_cnt);
    let _ = writeln!(out, "{}.passive_cnt={}", key, arena.passive_cnt());
    let _ = writeln!(out, "{}.alloc_cnt={}", key, arena.alloc_cnt);
    let _ = writeln!(out, "{}.max_active={}", key, arena.max_active);
    let _ = writeln!(out, "{}.page_size={}", key, arena.page_size);

    let mut index = 1;
    for slot in arena.slots.iter() {
        if slot.state.load(Ordering::Acquire) != SLOT_ACTIVE {
            continue;
        }
        // Snapshot under the buffer lock; skip the line when a caller is
        // mid-swap rather than stall the dump.
        let guard = slot.lock.try_lock();
        if guard.is_none() {
            continue;
        }
        let buf_key = format!("{}.active_iobuf.{}", key, index);
        let _ = writeln!(out, "[iobuf.{}]", buf_key);
        let _ = writeln!(
            out,
            "{}.ref={}",
            buf_key,
            slot.ref_count.load(Ordering::Acquire)
        );
        let _ = writeln!(out, "{}.ptr={:p}", buf_key, slot.data.load(Ordering::Acquire));
        index += 1;
    }
}

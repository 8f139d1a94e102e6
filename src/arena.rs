// # Arena and Buffer Slot Internals
//
// An arena is a single anonymous read-write mapping carved into equal-sized
// pages of one size class. Each page is fronted by a `BufSlot`: the shared,
// interior-mutable state (reference count, data pointer, alignment shadow
// pointer) that outstanding buffer handles point at. Slots never move once
// an arena is mapped; handles address them directly while the pool mutex
// owns every list and counter around them.
//
// The passive side of an arena is a LIFO stack of slot indices, so the most
// recently returned page is handed out next. The active side is a per-slot
// state tag plus the `active_cnt` counter; both flip only under the pool
// mutex.

use crate::error::{PoolError, Result};
use crate::types::constants;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Slot is on its arena's passive stack (or a standard slot already freed).
pub(crate) const SLOT_PASSIVE: u8 = 0;
/// Slot is handed out to a caller.
pub(crate) const SLOT_ACTIVE: u8 = 1;

/// Owned standard allocation backing an overflow or small-path buffer.
pub(crate) struct StdStorage {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl StdStorage {
    /// Allocates `size` zeroed bytes, surfacing failure as OutOfMemory.
    pub(crate) fn alloc_zeroed(size: usize) -> Result<Self> {
        let layout = Layout::from_size_align(size.max(1), constants::STD_ALLOC_ALIGN).map_err(
            |_| PoolError::InvalidSize {
                size,
                reason: "request size does not form a valid allocation layout".to_string(),
            },
        )?;

        let raw = unsafe { alloc_zeroed(layout) };
        match NonNull::new(raw) {
            Some(ptr) => Ok(Self { ptr, layout }),
            None => Err(PoolError::OutOfMemory {
                reason: format!("standard allocation of {} bytes failed", size),
            }),
        }
    }

    pub(crate) fn base(&self) -> NonNull<u8> {
        self.ptr
    }
}

impl Drop for StdStorage {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

// The allocation is exclusively owned and freed exactly once.
unsafe impl Send for StdStorage {}
unsafe impl Sync for StdStorage {}

/// Where a buffer slot's memory comes from.
pub(crate) enum SlotBacking {
    /// Page carved out of a pooled arena; coordinates locate the slot on
    /// the return path.
    Arena {
        arena_id: u64,
        class: usize,
        index: u32,
    },
    /// Oversized request served by an aligned standard allocation.
    Overflow(StdStorage),
    /// Tiny request served by the pass-through small path.
    Small(StdStorage),
}

/// Shared per-buffer state addressed by outstanding handles.
///
/// All fields are interior-mutable: counters and pointers are atomics, the
/// alignment swap and statedump snapshots serialize on `lock`, and list
/// membership (`state`, the free stack) changes only under the pool mutex.
pub(crate) struct BufSlot {
    pub(crate) backing: SlotBacking,
    pub(crate) ref_count: AtomicUsize,
    pub(crate) data: AtomicPtr<u8>,
    /// Original data pointer while an alignment shift is in effect; null
    /// when the buffer sits at its carved offset. Standard-backed slots
    /// keep their allocation base here for their whole lifetime.
    pub(crate) free_base: AtomicPtr<u8>,
    /// Requested size recorded at hand-out, not the class capacity.
    pub(crate) page_size: AtomicUsize,
    pub(crate) lock: Mutex<()>,
    pub(crate) state: AtomicU8,
}

// Slots are shared across threads through raw handles; every mutable field
// is an atomic or guarded by `lock`/the pool mutex.
unsafe impl Send for BufSlot {}
unsafe impl Sync for BufSlot {}

impl BufSlot {
    /// Fresh slot for a standard allocation, handed out with one reference.
    pub(crate) fn standard(backing: SlotBacking, data: *mut u8, base: *mut u8, size: usize) -> Self {
        Self {
            backing,
            ref_count: AtomicUsize::new(1),
            data: AtomicPtr::new(data),
            free_base: AtomicPtr::new(base),
            page_size: AtomicUsize::new(size),
            lock: Mutex::new(()),
            state: AtomicU8::new(SLOT_ACTIVE),
        }
    }
}

/// One mapped region of a single size class, carved into `page_count` pages.
pub(crate) struct Arena {
    pub(crate) id: u64,
    pub(crate) mem_base: NonNull<u8>,
    pub(crate) arena_size: usize,
    /// Class page size; per-buffer requested sizes live in the slots.
    pub(crate) page_size: usize,
    pub(crate) page_count: usize,
    pub(crate) slots: Box<[BufSlot]>,
    /// Passive stack: indices of free slots, most recently freed on top.
    pub(crate) free_slots: Vec<u32>,
    pub(crate) active_cnt: usize,
    /// Lifetime hand-out counter.
    pub(crate) alloc_cnt: u64,
    /// High watermark of `active_cnt`.
    pub(crate) max_active: usize,
}

// The mapping and slot array are owned by the pool; handles only ever touch
// slots, which are Sync.
unsafe impl Send for Arena {}

impl Arena {
    /// Maps an anonymous read-write region for `page_count` pages of
    /// `page_size` bytes and carves it into passive slots.
    pub(crate) fn map(id: u64, class: usize, page_size: usize, page_count: usize) -> Result<Self> {
        let arena_size = page_size.checked_mul(page_count).ok_or(PoolError::InvalidSize {
            size: page_size,
            reason: "arena size overflows".to_string(),
        })?;

        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                arena_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(PoolError::OutOfMemory {
                reason: format!("mapping {} bytes for arena failed", arena_size),
            });
        }
        let mem_base = match NonNull::new(raw as *mut u8) {
            Some(base) => base,
            None => {
                return Err(PoolError::OutOfMemory {
                    reason: "mapping returned a null base".to_string(),
                })
            }
        };

        let mut slots = Vec::with_capacity(page_count);
        let mut free_slots = Vec::with_capacity(page_count);
        for index in 0..page_count {
            let data = unsafe { mem_base.as_ptr().add(index * page_size) };
            slots.push(BufSlot {
                backing: SlotBacking::Arena {
                    arena_id: id,
                    class,
                    index: index as u32,
                },
                ref_count: AtomicUsize::new(0),
                data: AtomicPtr::new(data),
                free_base: AtomicPtr::new(std::ptr::null_mut()),
                page_size: AtomicUsize::new(page_size),
                lock: Mutex::new(()),
                state: AtomicU8::new(SLOT_PASSIVE),
            });
            free_slots.push(index as u32);
        }

        Ok(Self {
            id,
            mem_base,
            arena_size,
            page_size,
            page_count,
            slots: slots.into_boxed_slice(),
            free_slots,
            active_cnt: 0,
            alloc_cnt: 0,
            max_active: 0,
        })
    }

    pub(crate) fn passive_cnt(&self) -> usize {
        self.free_slots.len()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        for slot in self.slots.iter() {
            let refs = slot.ref_count.load(Ordering::Acquire);
            if refs != 0 {
                log::error!(
                    "arena {} unmapped with an outstanding buffer reference (ref={}, data={:p})",
                    self.id,
                    refs,
                    slot.data.load(Ordering::Acquire)
                );
            }
        }

        unsafe {
            libc::munmap(self.mem_base.as_ptr() as *mut libc::c_void, self.arena_size);
        }
    }
}

// # Buffer Handle
//
// `IoBuf` is the caller-facing handle to one pooled page or standard
// allocation. Cloning a handle takes a new reference; dropping one releases
// it, and the last release routes the slot back to its arena's passive
// stack (or frees the standard allocation outright). The ref/unref fast
// path is a single atomic and never touches the pool mutex.

use crate::arena::{BufSlot, SlotBacking};
use crate::pool::IoBufPool;
use crate::types::IoVec;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Which allocation path produced a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufOrigin {
    /// Carved from a pooled arena of a fixed size class
    Arena,
    /// Oversized request served by an aligned standard allocation
    Overflow,
    /// Tiny request served by the pass-through small path
    Small,
}

/// A reference-counted buffer drawn from an [`IoBufPool`].
///
/// The handle pins its pool: arena-backed slots stay mapped for as long as
/// any handle to them is outstanding.
pub struct IoBuf {
    pool: Arc<IoBufPool>,
    slot: NonNull<BufSlot>,
}

// Slot state is interior-mutable behind atomics and the per-buffer lock,
// and the pool keeps the slot's memory alive while any handle exists.
unsafe impl Send for IoBuf {}
unsafe impl Sync for IoBuf {}

enum PutAction {
    Arena {
        arena_id: u64,
        class: usize,
        index: u32,
    },
    Standard,
}

impl IoBuf {
    /// Wraps a slot whose reference count is already 1.
    pub(crate) fn from_raw(pool: Arc<IoBufPool>, slot: NonNull<BufSlot>) -> Self {
        Self { pool, slot }
    }

    fn slot(&self) -> &BufSlot {
        unsafe { self.slot.as_ref() }
    }

    /// Requested size recorded at hand-out (not the class capacity).
    pub fn size(&self) -> usize {
        self.slot().page_size.load(Ordering::Acquire)
    }

    /// Start of the buffer's usable region.
    pub fn as_ptr(&self) -> *const u8 {
        self.slot().data.load(Ordering::Acquire)
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.slot().data.load(Ordering::Acquire)
    }

    /// Publishes the data region as a scatter/gather descriptor.
    pub fn as_iovec(&self) -> IoVec {
        IoVec::new(self.as_mut_ptr(), self.size())
    }

    /// Current reference count, for observability and tests.
    pub fn ref_count(&self) -> usize {
        self.slot().ref_count.load(Ordering::Acquire)
    }

    pub fn origin(&self) -> BufOrigin {
        match self.slot().backing {
            SlotBacking::Arena { .. } => BufOrigin::Arena,
            SlotBacking::Overflow(_) => BufOrigin::Overflow,
            SlotBacking::Small(_) => BufOrigin::Small,
        }
    }

    /// Identifier of the owning arena, or `None` for standard-backed
    /// buffers.
    pub fn arena_id(&self) -> Option<u64> {
        match self.slot().backing {
            SlotBacking::Arena { arena_id, .. } => Some(arena_id),
            _ => None,
        }
    }

    /// Shifts `data` up to `align` under the buffer lock, remembering the
    /// carved offset in `free_base` so the return path can restore it.
    /// Standard-backed buffers were aligned at allocation and are left
    /// untouched.
    pub(crate) fn align_data(&self, align: usize) {
        let slot = self.slot();
        let _guard = slot.lock.lock();

        if !slot.free_base.load(Ordering::Acquire).is_null() {
            return;
        }

        let current = slot.data.load(Ordering::Acquire);
        slot.free_base.store(current, Ordering::Release);
        let offset = current.align_offset(align);
        slot.data.store(unsafe { current.add(offset) }, Ordering::Release);
    }
}

impl Clone for IoBuf {
    /// Takes one more reference on the underlying buffer.
    fn clone(&self) -> Self {
        self.slot().ref_count.fetch_add(1, Ordering::Relaxed);
        Self {
            pool: Arc::clone(&self.pool),
            slot: self.slot,
        }
    }
}

impl Drop for IoBuf {
    fn drop(&mut self) {
        let previous = self.slot().ref_count.fetch_sub(1, Ordering::AcqRel);
        if previous == 0 {
            log::error!("buffer reference count dropped below zero");
            panic!("buffer reference count dropped below zero");
        }
        if previous != 1 {
            return;
        }

        let action = match self.slot().backing {
            SlotBacking::Arena {
                arena_id,
                class,
                index,
            } => PutAction::Arena {
                arena_id,
                class,
                index,
            },
            SlotBacking::Overflow(_) | SlotBacking::Small(_) => PutAction::Standard,
        };

        match action {
            PutAction::Arena {
                arena_id,
                class,
                index,
            } => self.pool.put_arena_slot(arena_id, class, index),
            PutAction::Standard => {
                // Last handle to a standard allocation; the slot owns its
                // storage and frees it here.
                unsafe { drop(Box::from_raw(self.slot.as_ptr())) };
            }
        }
    }
}

impl std::fmt::Debug for IoBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoBuf")
            .field("data", &self.as_ptr())
            .field("size", &self.size())
            .field("ref_count", &self.ref_count())
            .field("origin", &self.origin())
            .finish()
    }
}

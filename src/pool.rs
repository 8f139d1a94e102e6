// # Size-Classed Buffer Pool
//
// The pool owns every arena, partitioned by size class, and dispatches
// allocation across three paths:
//
// ```text
// get(size)
//   ├── size == 0            -> substitute default_page_size
//   ├── size <= small thresh -> pass-through standard allocation (no lock)
//   ├── size fits a class    -> pool mutex: select arena, pop passive slot
//   └── size > largest class -> aligned standard allocation, counted as a
//                               request miss
// ```
//
// Per class the pool keeps three arena lists:
//
// - `available` - arenas with at least one passive page, consulted
//   head-first so the front arena soaks up work and later arenas stay cold
// - `filled`    - arenas with zero passive pages
// - `purge`     - arenas with zero active pages, candidates for unmapping
//
// An arena drained to its last page moves to `filled`; the first return
// moves it to the tail of `available`; returning its last active page moves
// it to `purge`, where it is unmapped only if another arena of the class is
// still available. That holdback keeps bursty workloads from thrashing
// map/unmap on the last arena of a class. A purged arena that survives is
// resurrected before any new mapping is made.
//
// The single pool mutex covers selection, hand-out, return, and the
// (accepted) map/unmap during arena allocation and pruning. Buffer
// reference counting never takes it.

use crate::arena::{Arena, BufSlot, SlotBacking, StdStorage, SLOT_ACTIVE, SLOT_PASSIVE};
use crate::buf::IoBuf;
use crate::bundle::IoBufRef;
use crate::error::{PoolError, Result};
use crate::types::{
    class_index_for, constants, validate_alignment, validate_request_size, IoVec, SIZE_CLASSES,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Per-class arena list triplet.
#[derive(Default)]
pub(crate) struct ClassLists {
    /// Arenas with passive pages, consulted head-first.
    pub(crate) available: VecDeque<u64>,
    /// Arenas with zero passive pages.
    pub(crate) filled: Vec<u64>,
    /// Arenas with zero active pages, awaiting the pruning decision.
    pub(crate) purge: VecDeque<u64>,
}

pub(crate) struct PoolInner {
    pub(crate) classes: Vec<ClassLists>,
    /// Ownership table of every live arena, keyed by arena id.
    pub(crate) arenas: HashMap<u64, Arena>,
    pub(crate) arena_cnt: usize,
    /// Lifetime-mapped bytes across all successful arena mappings.
    pub(crate) arena_size: usize,
    /// Requests that exceeded the largest class and fell through to
    /// standard allocation.
    pub(crate) request_misses: u64,
    next_arena_id: u64,
}

impl PoolInner {
    fn unprune_arena(&mut self, class: usize) -> Option<u64> {
        let id = self.classes[class].purge.pop_front()?;
        self.classes[class].available.push_front(id);
        Some(id)
    }

    fn map_arena(&mut self, class: usize, num_pages: usize) -> Result<u64> {
        let id = self.next_arena_id;
        self.next_arena_id += 1;

        let page_size = SIZE_CLASSES[class].page_size;
        let arena = Arena::map(id, class, page_size, num_pages).map_err(|err| {
            log::warn!("mapping a new {}-byte arena failed: {}", page_size, err);
            err
        })?;

        self.arena_size += arena.arena_size;
        self.arena_cnt += 1;
        self.arenas.insert(id, arena);
        self.classes[class].available.push_front(id);
        Ok(id)
    }

    /// Resurrect a purged arena of this class, or map a fresh one.
    fn add_arena(&mut self, class: usize, num_pages: usize) -> Result<u64> {
        if let Some(id) = self.unprune_arena(class) {
            return Ok(id);
        }
        self.map_arena(class, num_pages)
    }

    /// First available arena with a passive page, else a new one.
    fn select_arena(&mut self, class: usize) -> Result<u64> {
        let found = self.classes[class]
            .available
            .iter()
            .find(|id| {
                self.arenas
                    .get(*id)
                    .map(|arena| arena.passive_cnt() > 0)
                    .unwrap_or(false)
            })
            .copied();

        match found {
            Some(id) => Ok(id),
            None => self.add_arena(class, SIZE_CLASSES[class].num_pages),
        }
    }

    /// Pops a passive slot, records the requested size, and hands it out
    /// with one reference. Moves the arena to `filled` when drained.
    fn handout(&mut self, class: usize, requested: usize) -> Result<NonNull<BufSlot>> {
        let arena_id = self.select_arena(class)?;
        let arena = match self.arenas.get_mut(&arena_id) {
            Some(arena) => arena,
            None => {
                return Err(PoolError::OutOfMemory {
                    reason: "selected arena disappeared".to_string(),
                })
            }
        };

        let index = match arena.free_slots.pop() {
            Some(index) => index,
            None => {
                return Err(PoolError::OutOfMemory {
                    reason: "selected arena has no passive pages".to_string(),
                })
            }
        };

        let slot = &arena.slots[index as usize];
        slot.state.store(SLOT_ACTIVE, Ordering::Relaxed);
        slot.page_size.store(requested, Ordering::Release);
        slot.ref_count.store(1, Ordering::Release);
        let slot_ptr = NonNull::from(slot);

        arena.active_cnt += 1;
        arena.alloc_cnt += 1;
        if arena.max_active < arena.active_cnt {
            arena.max_active = arena.active_cnt;
        }
        let drained = arena.free_slots.is_empty();

        if drained {
            let lists = &mut self.classes[class];
            if let Some(pos) = lists.available.iter().position(|&id| id == arena_id) {
                lists.available.remove(pos);
            }
            lists.filled.push(arena_id);
        }

        Ok(slot_ptr)
    }

    /// Returns a slot to its arena's passive stack and reshuffles the
    /// arena between the class lists.
    fn put_slot(&mut self, arena_id: u64, class: usize, index: u32) {
        let arena = match self.arenas.get_mut(&arena_id) {
            Some(arena) => arena,
            None => {
                log::error!(
                    "buffer returned to unknown arena {} of the {}-byte class",
                    arena_id,
                    SIZE_CLASSES[class].page_size
                );
                return;
            }
        };
        if arena.active_cnt == 0 {
            log::error!("arena {} returned a buffer it never handed out", arena_id);
            return;
        }

        let was_drained = arena.free_slots.is_empty();

        let slot = &arena.slots[index as usize];
        // Undo any alignment shift so the slot re-enters the passive stack
        // at its carved offset.
        let base = slot.free_base.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if !base.is_null() {
            slot.data.store(base, Ordering::Release);
        }
        slot.state.store(SLOT_PASSIVE, Ordering::Relaxed);

        arena.free_slots.push(index);
        arena.active_cnt -= 1;
        let idle = arena.active_cnt == 0;

        let lists = &mut self.classes[class];
        if was_drained {
            if let Some(pos) = lists.filled.iter().position(|&id| id == arena_id) {
                lists.filled.remove(pos);
            }
            lists.available.push_back(arena_id);
        }

        if idle {
            if let Some(pos) = lists.available.iter().position(|&id| id == arena_id) {
                lists.available.remove(pos);
            }
            lists.purge.push_back(arena_id);
            self.prune_one(class, arena_id);
        }
    }

    /// Destroys a purged arena only while another arena of the class stays
    /// available; otherwise it is held back for resurrection.
    fn prune_one(&mut self, class: usize, arena_id: u64) {
        if self.classes[class].available.is_empty() {
            return;
        }

        if let Some(pos) = self.classes[class]
            .purge
            .iter()
            .position(|&id| id == arena_id)
        {
            self.classes[class].purge.remove(pos);
        }
        if self.arenas.remove(&arena_id).is_some() {
            self.arena_cnt -= 1;
        }
    }

    fn snapshot_arena(arena: &Arena) -> ArenaStatsSnapshot {
        ArenaStatsSnapshot {
            arena_id: arena.id,
            mem_base: arena.mem_base.as_ptr() as usize,
            page_size: arena.page_size,
            page_count: arena.page_count,
            passive_cnt: arena.passive_cnt(),
            active_cnt: arena.active_cnt,
            alloc_cnt: arena.alloc_cnt,
            max_active: arena.max_active,
        }
    }

    fn snapshot_list<'a>(&self, ids: impl Iterator<Item = &'a u64>) -> Vec<ArenaStatsSnapshot> {
        ids.filter_map(|id| self.arenas.get(id).map(Self::snapshot_arena))
            .collect()
    }
}

/// Counters of one arena at snapshot time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArenaStatsSnapshot {
    pub arena_id: u64,
    pub mem_base: usize,
    pub page_size: usize,
    pub page_count: usize,
    pub passive_cnt: usize,
    pub active_cnt: usize,
    pub alloc_cnt: u64,
    pub max_active: usize,
}

/// One size class's arena lists at snapshot time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassStatsSnapshot {
    pub page_size: usize,
    pub available: Vec<ArenaStatsSnapshot>,
    pub filled: Vec<ArenaStatsSnapshot>,
    pub purge: Vec<ArenaStatsSnapshot>,
}

/// Point-in-time view of the pool's counters and arena lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatsSnapshot {
    pub default_page_size: usize,
    pub arena_size: usize,
    pub arena_cnt: usize,
    pub request_misses: u64,
    pub classes: Vec<ClassStatsSnapshot>,
}

/// Size-classed, arena-backed buffer pool.
pub struct IoBufPool {
    pub(crate) inner: Mutex<PoolInner>,
    pub(crate) default_page_size: usize,
}

impl IoBufPool {
    /// Creates a pool and pre-maps one arena per fixed size class.
    ///
    /// Pre-mapping is best-effort: a class whose initial mapping fails is
    /// served on demand later, and `arena_size` records only the bytes
    /// actually mapped.
    pub fn new() -> Arc<Self> {
        let mut inner = PoolInner {
            classes: (0..SIZE_CLASSES.len()).map(|_| ClassLists::default()).collect(),
            arenas: HashMap::new(),
            arena_cnt: 0,
            arena_size: 0,
            request_misses: 0,
            next_arena_id: 1,
        };

        for (class, config) in SIZE_CLASSES.iter().enumerate() {
            if let Err(err) = inner.map_arena(class, config.num_pages) {
                log::warn!(
                    "pre-mapping the {}-byte class failed, continuing without it: {}",
                    config.page_size,
                    err
                );
            }
        }

        Arc::new(Self {
            inner: Mutex::new(inner),
            default_page_size: constants::DEFAULT_PAGE_SIZE,
        })
    }

    /// Gets a buffer of `size` bytes; zero means `default_page_size`.
    pub fn get(self: &Arc<Self>, size: usize) -> Result<IoBuf> {
        let requested = if size == 0 { self.default_page_size } else { size };
        validate_request_size(requested)?;

        if requested <= constants::SMALL_ALLOC_THRESHOLD {
            return self.get_small(requested);
        }

        match class_index_for(requested) {
            Some(class) => self.get_pooled(class, requested),
            None => self.get_overflow(requested),
        }
    }

    /// Gets a buffer of the pool's default page size.
    pub fn get_default(self: &Arc<Self>) -> Result<IoBuf> {
        self.get(0)
    }

    /// Gets a buffer whose data pointer is aligned to `align` (a power of
    /// two), padding the request so the aligned region still covers `size`
    /// bytes.
    pub fn get_page_aligned(self: &Arc<Self>, size: usize, align: usize) -> Result<IoBuf> {
        validate_alignment(align)?;

        let requested = if size == 0 { self.default_page_size } else { size };
        let padded = requested.checked_add(align).ok_or(PoolError::InvalidSize {
            size: requested,
            reason: "request size plus alignment overflows".to_string(),
        })?;

        let buf = self.get(padded)?;
        buf.align_data(align);
        Ok(buf)
    }

    fn get_pooled(self: &Arc<Self>, class: usize, requested: usize) -> Result<IoBuf> {
        let slot = {
            let mut inner = self.inner.lock();
            inner.handout(class, requested)?
        };
        Ok(IoBuf::from_raw(Arc::clone(self), slot))
    }

    /// Pass-through path for tiny requests; never touches the pool mutex.
    fn get_small(self: &Arc<Self>, size: usize) -> Result<IoBuf> {
        let storage = StdStorage::alloc_zeroed(size)?;
        let base = storage.base().as_ptr();

        let slot = Box::new(BufSlot::standard(
            SlotBacking::Small(storage),
            base,
            base,
            size,
        ));
        let slot = NonNull::from(Box::leak(slot));
        Ok(IoBuf::from_raw(Arc::clone(self), slot))
    }

    /// Overflow path for requests above the largest class: an aligned
    /// standard allocation, counted as a request miss.
    fn get_overflow(self: &Arc<Self>, size: usize) -> Result<IoBuf> {
        let storage = StdStorage::alloc_zeroed(size + constants::ALIGN_SIZE)?;
        let base = storage.base().as_ptr();
        let offset = base.align_offset(constants::ALIGN_SIZE);
        let data = unsafe { base.add(offset) };

        let slot = Box::new(BufSlot::standard(
            SlotBacking::Overflow(storage),
            data,
            base,
            size,
        ));
        let slot = NonNull::from(Box::leak(slot));

        {
            let mut inner = self.inner.lock();
            inner.request_misses += 1;
        }
        log::debug!(
            "request for a buffer of {} bytes serviced from standard allocation ({:p}): \
             exceeds the largest size class",
            size,
            data
        );

        Ok(IoBuf::from_raw(Arc::clone(self), slot))
    }

    /// Return path for arena-backed buffers whose last reference dropped.
    pub(crate) fn put_arena_slot(&self, arena_id: u64, class: usize, index: u32) {
        let mut inner = self.inner.lock();
        inner.put_slot(arena_id, class, index);
    }

    /// Explicitly destroys purged arenas. Idempotent; each class keeps its
    /// last arena regardless.
    pub fn prune(&self) {
        let mut inner = self.inner.lock();
        for class in 0..SIZE_CLASSES.len() {
            while !inner.classes[class].purge.is_empty()
                && !inner.classes[class].available.is_empty()
            {
                let id = inner.classes[class].purge[0];
                inner.prune_one(class, id);
            }
        }
    }

    /// Point-in-time snapshot of pool counters and arena lists.
    pub fn stats(&self) -> PoolStatsSnapshot {
        let inner = self.inner.lock();
        let classes = inner
            .classes
            .iter()
            .enumerate()
            .map(|(class, lists)| ClassStatsSnapshot {
                page_size: SIZE_CLASSES[class].page_size,
                available: inner.snapshot_list(lists.available.iter()),
                filled: inner.snapshot_list(lists.filled.iter()),
                purge: inner.snapshot_list(lists.purge.iter()),
            })
            .collect();

        PoolStatsSnapshot {
            default_page_size: self.default_page_size,
            arena_size: inner.arena_size,
            arena_cnt: inner.arena_cnt,
            request_misses: inner.request_misses,
            classes,
        }
    }

    /// JSON rendition of [`stats`](Self::stats) for observability
    /// endpoints and statedump tooling.
    pub fn stats_json(&self) -> String {
        serde_json::to_string_pretty(&self.stats()).unwrap_or_default()
    }

    /// Copies the source vectors contiguously into one pool buffer.
    ///
    /// Returns the buffer, a fresh bundle already holding one reference on
    /// it, and a vector descriptor covering the packed bytes. Partial
    /// failures release whatever was acquired.
    pub fn copy(self: &Arc<Self>, sources: &[&[u8]]) -> Result<(IoBuf, IoBufRef, IoVec)> {
        let total: usize = sources.iter().map(|source| source.len()).sum();

        let buf = self.get(total)?;
        let bundle = IoBufRef::new();
        bundle.add(&buf)?;

        let dst = buf.as_mut_ptr();
        let mut offset = 0;
        for source in sources {
            unsafe {
                std::ptr::copy_nonoverlapping(source.as_ptr(), dst.add(offset), source.len());
            }
            offset += source.len();
        }

        Ok((buf, bundle, IoVec::new(dst, total)))
    }
}

impl Drop for IoBufPool {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();

        // A filled arena at teardown means callers leaked buffer
        // references; surface it before the best-effort destruction.
        for (class, lists) in inner.classes.iter().enumerate() {
            if !lists.filled.is_empty() {
                log::error!(
                    "{} arena(s) of the {}-byte class still hold active buffers at pool \
                     teardown; destroying them anyway",
                    lists.filled.len(),
                    SIZE_CLASSES[class].page_size
                );
            }
        }

        inner.arenas.clear();
        inner.arena_cnt = 0;
    }
}

// # Buffer Bundles
//
// An `IoBufRef` bundles the buffers of one logical request so pipeline
// stages can extend their lifetime past the frame that allocated them.
// Each occupied slot holds one strong reference on its buffer; the bundle
// itself is shared by cloning the handle, and dropping the last handle
// releases every held reference.
//
// Slots are appended in order and the first empty slot terminates
// iteration, so `merge` and `clear` can walk a bundle without scanning its
// full capacity.

use crate::buf::IoBuf;
use crate::error::{PoolError, Result};
use crate::types::constants;
use parking_lot::Mutex;
use std::sync::Arc;

struct BundleList {
    slots: Vec<Option<IoBuf>>,
    used: usize,
}

struct BundleShared {
    list: Mutex<BundleList>,
}

/// A growable, shared collection of buffer references.
///
/// Cloning the handle shares the bundle; dropping the last handle releases
/// every held buffer reference exactly once.
pub struct IoBufRef {
    shared: Arc<BundleShared>,
}

impl IoBufRef {
    /// Empty bundle with the initial slot capacity.
    pub fn new() -> Self {
        let mut slots = Vec::new();
        slots.resize_with(constants::BUNDLE_INITIAL_CAPACITY, || None);

        Self {
            shared: Arc::new(BundleShared {
                list: Mutex::new(BundleList { slots, used: 0 }),
            }),
        }
    }

    /// Appends a fresh reference on `buf`, doubling the slot array when it
    /// is full. Growth failure surfaces as OutOfMemory and leaves the
    /// bundle unchanged.
    pub fn add(&self, buf: &IoBuf) -> Result<()> {
        let mut list = self.shared.list.lock();

        if list.used == list.slots.len() {
            let grow = list.slots.len();
            list.slots
                .try_reserve_exact(grow)
                .map_err(|_| PoolError::OutOfMemory {
                    reason: "growing the bundle slot array failed".to_string(),
                })?;
            let doubled = grow * 2;
            list.slots.resize_with(doubled, || None);
        }

        let index = match list.slots.iter().position(Option::is_none) {
            Some(index) => index,
            None => {
                return Err(PoolError::OutOfMemory {
                    reason: "bundle has no free slot after growth".to_string(),
                })
            }
        };

        list.slots[index] = Some(buf.clone());
        list.used += 1;
        Ok(())
    }

    /// Appends every buffer of `from` to this bundle, stopping at the
    /// first error. The source is locked for the whole walk; this bundle
    /// is locked per insertion.
    pub fn merge(&self, from: &IoBufRef) -> Result<()> {
        if Arc::ptr_eq(&self.shared, &from.shared) {
            return Err(PoolError::InvalidArgument {
                reason: "cannot merge a bundle into itself".to_string(),
            });
        }

        let from_list = from.shared.list.lock();
        for slot in from_list.slots.iter() {
            match slot {
                Some(buf) => self.add(buf)?,
                None => break,
            }
        }
        Ok(())
    }

    /// Releases every held buffer reference, then gives up this handle's
    /// reference on the bundle itself.
    pub fn clear(self) {
        let mut list = self.shared.list.lock();
        for slot in list.slots.iter_mut() {
            if slot.take().is_none() {
                break;
            }
        }
        list.used = 0;
    }

    /// Sum of the held buffers' sizes.
    pub fn size(&self) -> usize {
        let list = self.shared.list.lock();
        list.slots.iter().flatten().map(IoBuf::size).sum()
    }

    /// Number of held buffers.
    pub fn len(&self) -> usize {
        self.shared.list.lock().used
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current slot capacity.
    pub fn capacity(&self) -> usize {
        self.shared.list.lock().slots.len()
    }
}

impl Clone for IoBufRef {
    /// Takes one more reference on the bundle.
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Default for IoBufRef {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::IoBufPool;

    #[test]
    fn test_add_takes_a_reference() {
        let pool = IoBufPool::new();
        let buf = pool.get(2000).unwrap();
        assert_eq!(buf.ref_count(), 1);

        let bundle = IoBufRef::new();
        bundle.add(&buf).unwrap();
        assert_eq!(buf.ref_count(), 2);
        assert_eq!(bundle.len(), 1);
        assert_eq!(bundle.size(), 2000);

        drop(bundle);
        assert_eq!(buf.ref_count(), 1);
    }

    #[test]
    fn test_growth_doubles_past_initial_capacity() {
        let pool = IoBufPool::new();
        let buf = pool.get(500).unwrap();

        let bundle = IoBufRef::new();
        assert_eq!(bundle.capacity(), constants::BUNDLE_INITIAL_CAPACITY);
        for _ in 0..constants::BUNDLE_INITIAL_CAPACITY + 1 {
            bundle.add(&buf).unwrap();
        }

        assert_eq!(bundle.len(), constants::BUNDLE_INITIAL_CAPACITY + 1);
        assert_eq!(bundle.capacity(), constants::BUNDLE_INITIAL_CAPACITY * 2);
        assert_eq!(buf.ref_count(), 1 + constants::BUNDLE_INITIAL_CAPACITY + 1);
    }

    #[test]
    fn test_merge_permits_duplicates_and_references_each() {
        let pool = IoBufPool::new();
        let x = pool.get(1000).unwrap();
        let y = pool.get(1000).unwrap();
        let z = pool.get(1000).unwrap();

        let to = IoBufRef::new();
        to.add(&x).unwrap();
        to.add(&y).unwrap();
        let from = IoBufRef::new();
        from.add(&y).unwrap();
        from.add(&z).unwrap();

        let y_before = y.ref_count();
        let z_before = z.ref_count();
        to.merge(&from).unwrap();

        assert_eq!(to.len(), 4);
        assert_eq!(y.ref_count(), y_before + 1);
        assert_eq!(z.ref_count(), z_before + 1);
    }

    #[test]
    fn test_merge_into_itself_is_rejected() {
        let bundle = IoBufRef::new();
        let same = bundle.clone();
        assert!(bundle.merge(&same).is_err());
    }

    #[test]
    fn test_clear_releases_buffers_before_last_handle() {
        let pool = IoBufPool::new();
        let buf = pool.get(2000).unwrap();

        let bundle = IoBufRef::new();
        bundle.add(&buf).unwrap();
        let keeper = bundle.clone();
        assert_eq!(buf.ref_count(), 2);

        bundle.clear();
        // The buffer reference is gone even though `keeper` still holds
        // the bundle alive.
        assert_eq!(buf.ref_count(), 1);
        assert_eq!(keeper.len(), 0);
    }

    #[test]
    fn test_drop_releases_each_buffer_exactly_once() {
        let pool = IoBufPool::new();
        let a = pool.get(600).unwrap();
        let b = pool.get(600).unwrap();

        let bundle = IoBufRef::new();
        bundle.add(&a).unwrap();
        bundle.add(&a).unwrap();
        bundle.add(&b).unwrap();
        assert_eq!(a.ref_count(), 3);
        assert_eq!(b.ref_count(), 2);

        drop(bundle);
        assert_eq!(a.ref_count(), 1);
        assert_eq!(b.ref_count(), 1);
    }
}

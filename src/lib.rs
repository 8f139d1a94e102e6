// IoPool - size-classed I/O buffer pool for storage data paths
// Core library module
//
// The pool hands out fixed-capacity, page-aligned buffers drawn from a
// small set of size classes. Buffers are reference counted so pipeline
// stages (network receive -> protocol decode -> replication -> storage
// write) can share them without copying, and bundles collect the buffers
// of one logical request under a single handle.

mod arena;
mod buf;
mod bundle;
mod dump;
mod pool;

pub mod error;
pub mod types;

pub use buf::{BufOrigin, IoBuf};
pub use bundle::IoBufRef;
pub use error::{PoolError, Result};
pub use pool::{ArenaStatsSnapshot, ClassStatsSnapshot, IoBufPool, PoolStatsSnapshot};
pub use types::{
    class_index_for, class_page_size, constants, iovec_length, IoVec, SizeClassConfig,
    MAX_CLASS_PAGE_SIZE, SIZE_CLASSES,
};

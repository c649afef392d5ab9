//! Transactional, revisioned resource store built on Unix filesystem links.
//!
//! Resources are content files addressed by a [`ResourceId`]; hierarchical
//! [`RtPath`]s scoped to a [`NodeId`] name them. Every mapping is a revisioned
//! link on disk (hard links for content, symlinks for paths), so any committed
//! [`Revision`] can be read until the collector reclaims it. Writers stage
//! their changes in a [`MutableEntry`], which compiles them into a checksummed
//! program in the journal before the store applies it.
//!
//! Metadata lives in three memory-mapped files under the storage root:
//! `rpool` allocates revisions, `head` records the state of each revision and
//! `journal` keeps the programs of revisions the collector has not reached yet.

pub mod atomic;
pub mod checksum;
pub mod circular;
pub mod config;
pub mod counter;
pub mod error;
pub mod fs;
pub mod gc;
pub mod ids;
pub mod index;
pub mod journal;
pub mod locking;
pub mod mmap;
pub mod pool;
pub mod program;
pub mod revision;
pub mod rt_path;
pub mod table;
pub mod test_support;

mod entry;
mod store;
mod working_copy;

pub use checksum::ChecksumAlgorithm;
pub use config::{GcConfig, StoreConfig};
pub use error::{ErrorKind, TransactError, TransactResult};
pub use fs::Layout;
pub use gc::CollectionStats;
pub use ids::{NodeId, ResourceId};
pub use index::Listing;
pub use locking::TransactionId;
pub use revision::Revision;
pub use rt_path::RtPath;
pub use table::LockedRevision;

pub use entry::{MutableEntry, ResourceWriter, Unlink};
pub use store::{PendingRevisionChange, RecoveryStats, Store};
pub use working_copy::WorkingCopy;

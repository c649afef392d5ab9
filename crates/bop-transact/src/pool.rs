use std::path::Path;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, info};

use crate::atomic::{AtomicWord, MappedAtomicU64};
use crate::error::{TransactError, TransactResult};
use crate::mmap::{self, MappedFile};
use crate::revision::Revision;

pub const POOL_MAGIC: &[u8; 4] = b"PELM";
pub const POOL_MAJOR: u32 = 1;
pub const POOL_MINOR: u32 = 0;
pub const POOL_FILE_LEN: usize = 32;

const CAPACITY_OFFSET: usize = 16;
const COUNTER_OFFSET: usize = 24;

/// Durable allocator of monotonically increasing revisions.
///
/// The last handed-out revision lives in a mapped word that is flushed before
/// the new revision is returned, so a restart never hands out a revision twice.
pub struct RevisionPool {
    mapped: Arc<MappedFile>,
    counter: MappedAtomicU64,
    capacity: u64,
}

impl RevisionPool {
    /// Opens or creates the pool file at `path`.
    ///
    /// The stored capacity may grow to `capacity` but never shrink.
    pub fn open(path: &Path, capacity: u64) -> TransactResult<Self> {
        if capacity == 0 || capacity == u64::MAX {
            return Err(TransactError::invalid_config(format!(
                "revision pool capacity {capacity} is not allocatable"
            )));
        }
        let mapped = if path.exists() {
            let mapped = MappedFile::open(path, true)?;
            if mapped.len() != POOL_FILE_LEN {
                return Err(TransactError::fatal(format!(
                    "revision pool {} has {} bytes, expected {POOL_FILE_LEN}",
                    path.display(),
                    mapped.len()
                )));
            }
            mmap::verify_preamble(
                mapped.read_slice(0..POOL_FILE_LEN)?,
                POOL_MAGIC,
                POOL_MAJOR,
                POOL_MINOR,
                path,
            )?;
            let stored = LittleEndian::read_u64(
                mapped.read_slice(CAPACITY_OFFSET..CAPACITY_OFFSET + 8)?,
            );
            if capacity < stored {
                return Err(TransactError::fatal(format!(
                    "revision pool capacity cannot shrink from {stored} to {capacity}"
                )));
            }
            if capacity > stored {
                info!(from = stored, to = capacity, "growing revision pool capacity");
                let mut raw = [0u8; 8];
                LittleEndian::write_u64(&mut raw, capacity);
                mapped.write_bytes(CAPACITY_OFFSET, &raw)?;
                mapped.flush_and_sync()?;
            }
            mapped
        } else {
            info!(path = %path.display(), capacity, "creating revision pool");
            let mapped = MappedFile::create(path, POOL_FILE_LEN, 0)?;
            let mut header = [0u8; POOL_FILE_LEN];
            mmap::write_preamble(&mut header, POOL_MAGIC, POOL_MAJOR, POOL_MINOR);
            LittleEndian::write_u64(&mut header[CAPACITY_OFFSET..CAPACITY_OFFSET + 8], capacity);
            mapped.write_bytes(0, &header)?;
            mapped.flush_and_sync()?;
            mapped
        };

        let mapped = Arc::new(mapped);
        let counter = MappedAtomicU64::new(mapped.clone(), COUNTER_OFFSET)?;
        debug!(current = counter.get(), capacity, "revision pool ready");
        Ok(Self {
            mapped,
            counter,
            capacity,
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Last revision handed out, or [`Revision::ZERO`] for a fresh pool.
    pub fn current(&self) -> Revision {
        Revision::new(self.counter.get())
    }

    /// Allocates the next revision and persists the allocation before returning it.
    pub fn next_revision(&self) -> TransactResult<Revision> {
        loop {
            let current = self.counter.get();
            if current >= self.capacity {
                return Err(TransactError::fatal(format!(
                    "revision pool exhausted at {current}"
                )));
            }
            let next = current + 1;
            if self.counter.compare_and_set(current, next) {
                self.mapped
                    .flush_range(COUNTER_OFFSET..COUNTER_OFFSET + 8)?;
                return Ok(Revision::new(next));
            }
        }
    }

    /// Rebuilds a revision from its serialized form.
    pub fn decode(bytes: &[u8]) -> TransactResult<Revision> {
        Revision::decode(bytes)
    }

    /// Rebuilds a revision from its unique identifier.
    pub fn parse(identifier: &str) -> TransactResult<Revision> {
        identifier.parse()
    }
}

impl std::fmt::Debug for RevisionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevisionPool")
            .field("path", &self.mapped.path())
            .field("current", &self.current())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn allocation_survives_reopen() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("rpool");
        let last = {
            let pool = RevisionPool::open(&path, 100).expect("open");
            assert_eq!(pool.current(), Revision::ZERO);
            let first = pool.next_revision().expect("first");
            let second = pool.next_revision().expect("second");
            assert!(first < second);
            second
        };
        let pool = RevisionPool::open(&path, 100).expect("reopen");
        assert_eq!(pool.current(), last);
        assert!(pool.next_revision().expect("third") > last);
    }

    #[test]
    fn capacity_can_grow_but_not_shrink() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("rpool");
        drop(RevisionPool::open(&path, 10).expect("open"));
        assert!(matches!(
            RevisionPool::open(&path, 5),
            Err(TransactError::Fatal(_))
        ));
        assert_eq!(RevisionPool::open(&path, 20).expect("grow").capacity(), 20);
        assert_eq!(RevisionPool::open(&path, 20).expect("reopen").capacity(), 20);
    }

    #[test]
    fn exhaustion_and_foreign_files_are_fatal() {
        let tmp = TempDir::new().expect("tempdir");
        let pool = RevisionPool::open(&tmp.path().join("rpool"), 2).expect("open");
        pool.next_revision().expect("one");
        pool.next_revision().expect("two");
        assert!(pool.next_revision().expect_err("exhausted").is_fatal());

        let foreign = tmp.path().join("foreign");
        std::fs::write(&foreign, [0u8; POOL_FILE_LEN]).expect("write");
        assert!(matches!(
            RevisionPool::open(&foreign, 10),
            Err(TransactError::Fatal(_))
        ));
        std::fs::write(&foreign, [0u8; 8]).expect("write");
        assert!(RevisionPool::open(&foreign, 10).is_err());
    }

    #[test]
    fn identifiers_resolve_to_revisions() {
        let revision = Revision::new(0x1f);
        assert_eq!(RevisionPool::parse(&revision.unique_identifier()).expect("parse"), revision);
        let mut raw = [0u8; 8];
        revision.encode(&mut raw);
        assert_eq!(RevisionPool::decode(&raw).expect("decode"), revision);
    }
}

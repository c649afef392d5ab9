//! Atomic 64-bit words living inside a memory-mapped file.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{TransactError, TransactResult};
use crate::mmap::MappedFile;

/// Minimal atomic word used by the ring counters.
///
/// Values are exchanged in host order; implementations backed by shared
/// memory are responsible for the on-disk byte order.
pub trait AtomicWord: Send + Sync {
    fn get(&self) -> u64;

    fn compare_and_set(&self, expect: u64, update: u64) -> bool;

    fn set(&self, value: u64) {
        loop {
            let current = self.get();
            if self.compare_and_set(current, value) {
                return;
            }
        }
    }
}

impl AtomicWord for AtomicU64 {
    fn get(&self) -> u64 {
        self.load(Ordering::Acquire)
    }

    fn compare_and_set(&self, expect: u64, update: u64) -> bool {
        self.compare_exchange(expect, update, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn set(&self, value: u64) {
        self.store(value, Ordering::Release);
    }
}

/// An [`AtomicU64`] placed at a fixed offset of a writable mapping.
///
/// The word is stored little-endian so metadata files stay portable between
/// hosts of different endianness.
pub struct MappedAtomicU64 {
    mapped: Arc<MappedFile>,
    offset: usize,
    ptr: *mut u64,
}

unsafe impl Send for MappedAtomicU64 {}
unsafe impl Sync for MappedAtomicU64 {}

impl MappedAtomicU64 {
    pub fn new(mapped: Arc<MappedFile>, offset: usize) -> TransactResult<Self> {
        if !mapped.is_writable() {
            return Err(TransactError::invalid_argument(format!(
                "atomic word requires a writable mapping ({})",
                mapped.path().display()
            )));
        }
        let ptr = mapped.address_of(offset, size_of::<u64>())?;
        if (ptr as usize) % align_of::<AtomicU64>() != 0 {
            return Err(TransactError::invalid_argument(format!(
                "atomic word at offset {offset} of {} is not 8-byte aligned",
                mapped.path().display()
            )));
        }
        Ok(Self {
            mapped,
            offset,
            ptr: ptr.cast::<u64>(),
        })
    }

    fn cell(&self) -> &AtomicU64 {
        // `ptr` is aligned and stays mapped while `self.mapped` is alive.
        unsafe { AtomicU64::from_ptr(self.ptr) }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn mapped(&self) -> &Arc<MappedFile> {
        &self.mapped
    }

    pub fn increment_and_get(&self) -> u64 {
        loop {
            let current = self.get();
            let next = current.wrapping_add(1);
            if self.compare_and_set(current, next) {
                return next;
            }
        }
    }

    pub fn decrement_and_get(&self) -> u64 {
        loop {
            let current = self.get();
            let next = current.saturating_sub(1);
            if self.compare_and_set(current, next) {
                return next;
            }
        }
    }
}

impl AtomicWord for MappedAtomicU64 {
    fn get(&self) -> u64 {
        u64::from_le(self.cell().load(Ordering::Acquire))
    }

    fn compare_and_set(&self, expect: u64, update: u64) -> bool {
        self.cell()
            .compare_exchange(
                expect.to_le(),
                update.to_le(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn set(&self, value: u64) {
        self.cell().store(value.to_le(), Ordering::Release);
    }
}

impl std::fmt::Debug for MappedAtomicU64 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedAtomicU64")
            .field("path", &self.mapped.path())
            .field("offset", &self.offset)
            .field("value", &self.get())
            .finish()
    }
}

//! Fixed-size blocks over a mapped region, tracked as a ring by a [`DualCounter`].

use std::fmt;
use std::sync::Arc;

use crate::atomic::MappedAtomicU64;
use crate::counter::{DualCounter, Snapshot};
use crate::error::{TransactError, TransactResult};
use crate::mmap::MappedFile;

/// Byte value of a block that holds nothing.
pub const CLEARED_BYTE: u8 = 0xFF;

/// Fixed-layout record overlaid on the first bytes of a block.
pub trait BlockRecord: Sized {
    const LEN: usize;

    fn decode(src: &[u8]) -> TransactResult<Self>;

    fn encode_into(&self, dst: &mut [u8]);
}

/// View of one block of a [`CircularBuffer`].
#[derive(Clone)]
pub struct Slice {
    mapped: Arc<MappedFile>,
    index: u32,
    offset: usize,
    len: usize,
}

impl Slice {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Offset of the block inside the mapped file.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes(&self) -> TransactResult<&[u8]> {
        self.mapped.read_slice(self.offset..self.offset + self.len)
    }

    /// Mutable view of the block. The caller must hold the lock guarding this slot.
    #[allow(clippy::mut_from_ref)]
    pub fn bytes_mut(&self) -> TransactResult<&mut [u8]> {
        self.mapped.slice_mut(self.offset..self.offset + self.len)
    }

    pub fn write_at(&self, at: usize, bytes: &[u8]) -> TransactResult<()> {
        if at + bytes.len() > self.len {
            return Err(TransactError::invalid_argument(format!(
                "write of {} bytes at {at} overflows block of {}",
                bytes.len(),
                self.len
            )));
        }
        self.mapped.write_bytes(self.offset + at, bytes)
    }

    /// Overwrites the whole block with [`CLEARED_BYTE`].
    pub fn clear(&self) -> TransactResult<()> {
        self.mapped
            .fill(self.offset..self.offset + self.len, CLEARED_BYTE)
    }

    pub fn is_cleared(&self) -> TransactResult<bool> {
        Ok(self.bytes()?.iter().all(|b| *b == CLEARED_BYTE))
    }

    pub fn flush(&self) -> TransactResult<()> {
        self.mapped.flush_range(self.offset..self.offset + self.len)
    }

    pub fn read_record<T: BlockRecord>(&self) -> TransactResult<T> {
        if T::LEN > self.len {
            return Err(TransactError::invalid_argument("record larger than block"));
        }
        T::decode(&self.bytes()?[..T::LEN])
    }

    pub fn write_record<T: BlockRecord>(&self, record: &T) -> TransactResult<()> {
        if T::LEN > self.len {
            return Err(TransactError::invalid_argument("record larger than block"));
        }
        let dst = self.bytes_mut()?;
        record.encode_into(&mut dst[..T::LEN]);
        Ok(())
    }

    pub(crate) fn mapped(&self) -> &Arc<MappedFile> {
        &self.mapped
    }
}

impl PartialEq for Slice {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl Eq for Slice {}

impl fmt::Debug for Slice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slice")
            .field("index", &self.index)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// Ring of equally sized blocks inside one mapped file.
pub struct CircularBuffer {
    mapped: Arc<MappedFile>,
    base: usize,
    block_size: usize,
    count: u32,
    counter: DualCounter<MappedAtomicU64>,
}

impl CircularBuffer {
    /// Slices `len` bytes starting at `base` into blocks of `block_size`.
    /// The ring indices live in the word at `counter_offset`.
    pub fn new(
        mapped: Arc<MappedFile>,
        base: usize,
        len: usize,
        block_size: usize,
        counter_offset: usize,
    ) -> TransactResult<Self> {
        if block_size == 0 || len % block_size != 0 {
            return Err(TransactError::invalid_argument(format!(
                "region of {len} bytes is not a multiple of block size {block_size}"
            )));
        }
        if base + len > mapped.len() {
            return Err(TransactError::corruption(format!(
                "ring region {base}..{} exceeds file of {} bytes ({})",
                base + len,
                mapped.len(),
                mapped.path().display()
            )));
        }
        let count = u32::try_from(len / block_size)
            .map_err(|_| TransactError::invalid_argument("too many blocks"))?;
        let counter = DualCounter::new(MappedAtomicU64::new(mapped.clone(), counter_offset)?, count)?;
        Ok(Self {
            mapped,
            base,
            block_size,
            count,
            counter,
        })
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn counter(&self) -> &DualCounter<MappedAtomicU64> {
        &self.counter
    }

    pub fn snapshot(&self) -> TransactResult<Snapshot> {
        self.counter.snapshot()
    }

    /// Block at `index` regardless of whether it is inside the valid range.
    pub fn slice(&self, index: u32) -> TransactResult<Slice> {
        if index >= self.count {
            return Err(TransactError::invalid_argument(format!(
                "block index {index} beyond ring of {}",
                self.count
            )));
        }
        Ok(Slice {
            mapped: self.mapped.clone(),
            index,
            offset: self.base + index as usize * self.block_size,
            len: self.block_size,
        })
    }

    /// Block at `index` if it is currently inside the valid range.
    pub fn get(&self, index: u32) -> TransactResult<Option<Slice>> {
        if !self.snapshot()?.in_range(index) {
            return Ok(None);
        }
        self.slice(index).map(Some)
    }

    pub fn next_leading(&self) -> TransactResult<Slice> {
        let index = self.counter.increment_leading_and_get()?;
        self.slice(index)
    }

    /// Valid blocks from trailing to leading at the time of the call.
    pub fn stream(&self) -> TransactResult<Vec<Slice>> {
        self.snapshot()?
            .range()
            .into_iter()
            .map(|index| self.slice(index))
            .collect()
    }

    /// Valid blocks from leading back to trailing at the time of the call.
    pub fn reverse(&self) -> TransactResult<Vec<Slice>> {
        self.snapshot()?
            .reverse_range()
            .into_iter()
            .map(|index| self.slice(index))
            .collect()
    }

    /// Releases trailing blocks while `predicate` accepts them.
    pub fn advance_trailing_while<F>(&self, mut predicate: F) -> TransactResult<u32>
    where
        F: FnMut(&Slice) -> TransactResult<bool>,
    {
        let mut advanced = 0;
        loop {
            let snapshot = self.snapshot()?;
            if snapshot.is_empty() {
                return Ok(advanced);
            }
            let trailing = self.slice(snapshot.trailing())?;
            if !predicate(&trailing)? {
                return Ok(advanced);
            }
            if self.counter.compare_and_increment_trailing(&snapshot) {
                advanced += 1;
            }
        }
    }

    /// Clears every block and empties the ring.
    pub fn reset(&self) -> TransactResult<()> {
        self.mapped.fill(
            self.base..self.base + self.block_size * self.count as usize,
            CLEARED_BYTE,
        )?;
        self.counter.reset();
        Ok(())
    }
}

impl fmt::Debug for CircularBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircularBuffer")
            .field("path", &self.mapped.path())
            .field("base", &self.base)
            .field("block_size", &self.block_size)
            .field("count", &self.count)
            .finish()
    }
}

//! Transaction journal: a ring of fixed-size slots, each holding at most one
//! compiled program, in the `journal` file.
//!
//! | offset | size | field              |
//! |--------|------|--------------------|
//! | 0      | 4    | magic `JELM`       |
//! | 4      | 4    | major version      |
//! | 8      | 4    | minor version      |
//! | 12     | 4    | slot size in bytes |
//! | 16     | 4    | slot count         |
//! | 24     | 8    | ring counter word  |
//! | 64     | s*n  | slots              |

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, info, trace};

use crate::circular::{CircularBuffer, Slice};
use crate::counter::EMPTY_MASK;
use crate::error::{TransactError, TransactResult};
use crate::fs::TempFileGuard;
use crate::mmap::{self, MappedFile};
use crate::program::{self, Program};
use crate::revision::Revision;

pub const JOURNAL_MAGIC: &[u8; 4] = b"JELM";
pub const JOURNAL_MAJOR: u32 = 1;
pub const JOURNAL_MINOR: u32 = 0;
pub const JOURNAL_HEADER_LEN: usize = 64;

const SLOT_SIZE_OFFSET: usize = 12;
const COUNT_OFFSET: usize = 16;
const COUNTER_OFFSET: usize = 24;

pub struct TransactionJournal {
    mapped: Arc<MappedFile>,
    ring: CircularBuffer,
    slot_size: usize,
    in_use: Vec<AtomicBool>,
}

impl TransactionJournal {
    /// Opens or creates the journal at `path`.
    ///
    /// The slot size is fixed once the file exists; the slot count may grow.
    pub fn open(path: &Path, slot_size: u32, count: u32) -> TransactResult<Arc<Self>> {
        if path.exists() {
            let mapped = MappedFile::open(path, true)?;
            let (stored_size, stored_count) = read_header(&mapped)?;
            drop(mapped);
            if stored_size != slot_size {
                return Err(TransactError::fatal(format!(
                    "journal {} has {stored_size} byte slots, configured {slot_size}",
                    path.display()
                )));
            }
            if count < stored_count {
                return Err(TransactError::fatal(format!(
                    "journal cannot shrink from {stored_count} to {count} slots"
                )));
            }
            if count > stored_count {
                migrate(path, slot_size, stored_count, count)?;
            }
        } else {
            info!(path = %path.display(), slot_size, count, "creating transaction journal");
            let mapped = MappedFile::create(path, file_len(slot_size, count), 0xFF)?;
            write_header(&mapped, slot_size, count)?;
            mapped.flush_and_sync()?;
        }

        let mapped = Arc::new(MappedFile::open(path, true)?);
        read_header(&mapped)?;
        let ring = ring_of(&mapped, slot_size, count)?;
        ring.snapshot()
            .map_err(|err| TransactError::fatal(format!("journal ring: {err}")))?;
        let journal = Self {
            mapped,
            ring,
            slot_size: slot_size as usize,
            in_use: (0..count).map(|_| AtomicBool::new(false)).collect(),
        };
        info!(
            path = %path.display(),
            slot_size,
            count,
            live = journal.ring.snapshot()?.size(),
            "opened transaction journal"
        );
        Ok(Arc::new(journal))
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn count(&self) -> u32 {
        self.ring.count()
    }

    /// Number of slots between trailing and leading.
    pub fn live(&self) -> TransactResult<u32> {
        Ok(self.ring.snapshot()?.size())
    }

    fn in_use(&self, index: u32) -> bool {
        self.in_use[index as usize].load(Ordering::Acquire)
    }

    /// Claims the next slot for a new program.
    ///
    /// Fails with [`TransactError::CapacityExhausted`] when every slot holds a
    /// program the collector has not reclaimed yet.
    pub fn claim_next(self: &Arc<Self>) -> TransactResult<JournalSlotClaim> {
        self.reclaim()?;
        let slice = self.ring.next_leading()?;
        self.in_use[slice.index() as usize].store(true, Ordering::Release);
        slice.clear()?;
        trace!(slot = slice.index(), "claimed journal slot");
        Ok(JournalSlotClaim {
            journal: self.clone(),
            slice,
            published: AtomicBool::new(false),
        })
    }

    /// Trims trailing slots that neither hold a valid program nor are claimed.
    pub fn reclaim(&self) -> TransactResult<u32> {
        let reclaimed = self.ring.advance_trailing_while(|slice| {
            Ok(!self.in_use(slice.index()) && !Program::is_valid(slice.bytes()?))
        })?;
        if reclaimed > 0 {
            self.mapped
                .flush_range(COUNTER_OFFSET..COUNTER_OFFSET + 8)?;
            debug!(reclaimed, "reclaimed journal slots");
        }
        Ok(reclaimed)
    }

    /// Unclaimed slots of the ring holding a valid program, trailing first.
    pub fn programs(&self) -> TransactResult<Vec<(Slice, Revision)>> {
        let mut programs = Vec::new();
        for slice in self.ring.stream()? {
            if self.in_use(slice.index()) || !Program::is_valid(slice.bytes()?) {
                continue;
            }
            if let Some(revision) = program::peek_revision(slice.bytes()?) {
                programs.push((slice, revision));
            }
        }
        Ok(programs)
    }

    /// Slot holding the valid program for `revision`, if any.
    pub fn find_valid_program_for_revision(&self, revision: Revision) -> TransactResult<Option<Slice>> {
        Ok(self
            .programs()?
            .into_iter()
            .find(|(_, found)| *found == revision)
            .map(|(slice, _)| slice))
    }

    /// Clears the slot at `index` unless a transaction is still writing it.
    pub fn clear_slot(&self, index: u32) -> TransactResult<bool> {
        if self.in_use(index) {
            return Ok(false);
        }
        let slice = self.ring.slice(index)?;
        slice.clear()?;
        slice.flush()?;
        Ok(true)
    }

    pub fn flush(&self) -> TransactResult<()> {
        self.mapped.flush_and_sync()
    }
}

impl std::fmt::Debug for TransactionJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionJournal")
            .field("path", &self.mapped.path())
            .field("slot_size", &self.slot_size)
            .field("count", &self.count())
            .finish()
    }
}

/// Exclusive use of one journal slot by one transaction.
///
/// Dropping an unpublished claim clears the slot so the program it may hold
/// is never recovered.
pub struct JournalSlotClaim {
    journal: Arc<TransactionJournal>,
    slice: Slice,
    published: AtomicBool,
}

impl JournalSlotClaim {
    pub fn index(&self) -> u32 {
        self.slice.index()
    }

    /// Program bytes of the slot.
    #[allow(clippy::mut_from_ref)]
    pub fn buffer(&self) -> TransactResult<&mut [u8]> {
        self.slice.bytes_mut()
    }

    pub fn bytes(&self) -> TransactResult<&[u8]> {
        self.slice.bytes()
    }

    pub fn flush(&self) -> TransactResult<()> {
        self.slice.flush()
    }

    /// Keeps the program once the claim is released.
    pub fn publish(&self) {
        self.published.store(true, Ordering::Release);
    }

    pub fn is_published(&self) -> bool {
        self.published.load(Ordering::Acquire)
    }
}

impl Drop for JournalSlotClaim {
    fn drop(&mut self) {
        if !self.is_published() {
            if let Err(err) = self.slice.clear().and_then(|_| self.slice.flush()) {
                tracing::error!(slot = self.slice.index(), error = %err, "failed to clear abandoned journal slot");
            }
        }
        self.journal.in_use[self.slice.index() as usize].store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for JournalSlotClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalSlotClaim")
            .field("slot", &self.slice.index())
            .field("published", &self.is_published())
            .finish()
    }
}

fn file_len(slot_size: u32, count: u32) -> usize {
    JOURNAL_HEADER_LEN + slot_size as usize * count as usize
}

fn ring_of(mapped: &Arc<MappedFile>, slot_size: u32, count: u32) -> TransactResult<CircularBuffer> {
    CircularBuffer::new(
        mapped.clone(),
        JOURNAL_HEADER_LEN,
        slot_size as usize * count as usize,
        slot_size as usize,
        COUNTER_OFFSET,
    )
}

fn write_header(mapped: &MappedFile, slot_size: u32, count: u32) -> TransactResult<()> {
    let mut header = [0u8; JOURNAL_HEADER_LEN];
    mmap::write_preamble(&mut header, JOURNAL_MAGIC, JOURNAL_MAJOR, JOURNAL_MINOR);
    LittleEndian::write_u32(&mut header[SLOT_SIZE_OFFSET..SLOT_SIZE_OFFSET + 4], slot_size);
    LittleEndian::write_u32(&mut header[COUNT_OFFSET..COUNT_OFFSET + 4], count);
    LittleEndian::write_u64(&mut header[COUNTER_OFFSET..COUNTER_OFFSET + 8], EMPTY_MASK);
    mapped.write_bytes(0, &header)
}

/// Validates the header and returns the stored slot size and count.
fn read_header(mapped: &MappedFile) -> TransactResult<(u32, u32)> {
    if mapped.len() < JOURNAL_HEADER_LEN {
        return Err(TransactError::fatal(format!(
            "journal {} is truncated",
            mapped.path().display()
        )));
    }
    let header = mapped.read_slice(0..JOURNAL_HEADER_LEN)?;
    mmap::verify_preamble(header, JOURNAL_MAGIC, JOURNAL_MAJOR, JOURNAL_MINOR, mapped.path())?;
    let slot_size = LittleEndian::read_u32(&header[SLOT_SIZE_OFFSET..SLOT_SIZE_OFFSET + 4]);
    let count = LittleEndian::read_u32(&header[COUNT_OFFSET..COUNT_OFFSET + 4]);
    if mapped.len() != file_len(slot_size, count) {
        return Err(TransactError::fatal(format!(
            "journal {} has {} bytes, expected {} for {count} slots of {slot_size}",
            mapped.path().display(),
            mapped.len(),
            file_len(slot_size, count)
        )));
    }
    Ok((slot_size, count))
}

/// Rewrites the journal with `to` slots, moving the ring to start at slot 0.
fn migrate(path: &Path, slot_size: u32, from: u32, to: u32) -> TransactResult<()> {
    info!(path = %path.display(), from, to, "growing transaction journal");
    let old = Arc::new(MappedFile::open(path, true)?);
    let old_ring = ring_of(&old, slot_size, from)?;
    let parent = path
        .parent()
        .ok_or_else(|| TransactError::invalid_argument("journal path has no parent"))?;
    let temp = TempFileGuard::new(parent, "journal-", file_len(slot_size, to) as u64)?;
    {
        let fresh = Arc::new(MappedFile::open(temp.path()?, true)?);
        fresh.fill(0..fresh.len(), 0xFF)?;
        write_header(&fresh, slot_size, to)?;
        let ring = ring_of(&fresh, slot_size, to)?;
        let blocks = old_ring.stream()?;
        for (position, block) in blocks.iter().enumerate() {
            ring.slice(position as u32)?.write_at(0, block.bytes()?)?;
        }
        ring.counter().restore_prefix(blocks.len() as u32)?;
        fresh.flush_and_sync()?;
    }
    drop(old_ring);
    drop(old);
    temp.persist(path)
}

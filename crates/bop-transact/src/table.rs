//! Revision table: a ring of per-revision commit records in the `head` file.
//!
//! Layout of `head`:
//!
//! | offset | size | field                               |
//! |--------|------|-------------------------------------|
//! | 0      | 4    | magic `RELM`                        |
//! | 4      | 4    | major version                       |
//! | 8      | 4    | minor version                       |
//! | 12     | 4    | slot count                          |
//! | 16     | 8    | ring counter word                   |
//! | 24     | 8    | read-committed slot index           |
//! | 64     | 32*n | entries                             |
//!
//! Each entry holds the revision, its checksum, a reader count, the state and
//! the checksum algorithm. The reader count changes while the entry is live and
//! is excluded from the checksum.

use std::path::Path;
use std::sync::{Arc, OnceLock};

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use crate::atomic::{AtomicWord, MappedAtomicU64};
use crate::checksum::ChecksumAlgorithm;
use crate::circular::{BlockRecord, CircularBuffer, Slice};
use crate::counter::EMPTY_MASK;
use crate::error::{TransactError, TransactResult};
use crate::fs::TempFileGuard;
use crate::mmap::{self, MappedFile};
use crate::pool::RevisionPool;
use crate::revision::Revision;

pub const TABLE_MAGIC: &[u8; 4] = b"RELM";
pub const TABLE_MAJOR: u32 = 1;
pub const TABLE_MINOR: u32 = 0;
pub const TABLE_HEADER_LEN: usize = 64;
pub const TABLE_ENTRY_LEN: usize = 32;

const COUNT_OFFSET: usize = 12;
const COUNTER_OFFSET: usize = 16;
const READ_COMMITTED_OFFSET: usize = 24;
const READERS_OFFSET: usize = 16;

/// Permits held by one slot; a writer takes all of them, a reader one.
const SLOT_PERMITS: u32 = 1 << 20;
const READ_PERMITS: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EntryState {
    Writing = 1,
    Committed = 2,
}

impl EntryState {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(EntryState::Writing),
            2 => Some(EntryState::Committed),
            _ => None,
        }
    }
}

/// Raw bytes of a table entry, minus the reader count.
#[derive(Debug, Clone, Copy)]
struct EntryRecord {
    revision: u64,
    checksum: u64,
    state: u8,
    algorithm: u8,
}

impl EntryRecord {
    fn sealed(revision: Revision, state: EntryState, algorithm: ChecksumAlgorithm) -> Self {
        let mut record = Self {
            revision: revision.as_u64(),
            checksum: 0,
            state: state as u8,
            algorithm: algorithm.tag(),
        };
        record.checksum = algorithm.compute(&record.checksummed_bytes());
        record
    }

    fn checksummed_bytes(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        LittleEndian::write_u64(&mut bytes[0..8], self.revision);
        bytes[8] = self.state;
        bytes[9] = self.algorithm;
        bytes
    }

    /// The entry's revision and state, or `None` when it fails validation.
    fn validate(&self) -> Option<(Revision, EntryState)> {
        let state = EntryState::from_raw(self.state)?;
        let algorithm = ChecksumAlgorithm::try_from(self.algorithm).ok()?;
        if algorithm.compute(&self.checksummed_bytes()) != self.checksum {
            return None;
        }
        Some((Revision::new(self.revision), state))
    }
}

impl BlockRecord for EntryRecord {
    const LEN: usize = TABLE_ENTRY_LEN;

    fn decode(src: &[u8]) -> TransactResult<Self> {
        Ok(Self {
            revision: LittleEndian::read_u64(&src[0..8]),
            checksum: LittleEndian::read_u64(&src[8..16]),
            state: src[24],
            algorithm: src[25],
        })
    }

    fn encode_into(&self, dst: &mut [u8]) {
        LittleEndian::write_u64(&mut dst[0..8], self.revision);
        LittleEndian::write_u64(&mut dst[8..16], self.checksum);
        dst[24] = self.state;
        dst[25] = self.algorithm;
        dst[26..32].fill(0);
    }
}

/// A validated table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableEntry {
    pub index: u32,
    pub revision: Revision,
    pub state: EntryState,
}

/// Counting semaphore guarding one table slot.
#[derive(Debug)]
struct SlotLock {
    permits: Mutex<u32>,
    released: Condvar,
}

impl SlotLock {
    fn new() -> Self {
        Self {
            permits: Mutex::new(SLOT_PERMITS),
            released: Condvar::new(),
        }
    }

    fn acquire(&self, wanted: u32) {
        let mut permits = self.permits.lock();
        while *permits < wanted {
            self.released.wait(&mut permits);
        }
        *permits -= wanted;
    }

    fn try_acquire(&self, wanted: u32) -> bool {
        let mut permits = self.permits.lock();
        if *permits < wanted {
            return false;
        }
        *permits -= wanted;
        true
    }

    fn release(&self, count: u32) {
        let mut permits = self.permits.lock();
        *permits += count;
        drop(permits);
        self.released.notify_all();
    }
}

type ReleaseHook = Box<dyn Fn(Revision) + Send + Sync>;

pub struct RevisionTable {
    mapped: Arc<MappedFile>,
    ring: CircularBuffer,
    read_committed: MappedAtomicU64,
    locks: Vec<SlotLock>,
    algorithm: ChecksumAlgorithm,
    release_hook: OnceLock<ReleaseHook>,
}

impl RevisionTable {
    /// Opens or creates the table at `path` with room for `count` revisions.
    ///
    /// A fresh table records the pool's next revision as its first committed
    /// entry. An existing table may only grow; growth rewrites the file.
    pub fn open(
        path: &Path,
        count: u32,
        algorithm: ChecksumAlgorithm,
        pool: &RevisionPool,
    ) -> TransactResult<Arc<Self>> {
        if !path.exists() {
            return Self::create(path, count, algorithm, pool);
        }

        let mapped = MappedFile::open(path, true)?;
        let stored = read_header(&mapped)?;
        if count < stored {
            return Err(TransactError::fatal(format!(
                "revision table cannot shrink from {stored} to {count} entries"
            )));
        }
        drop(mapped);
        if count > stored {
            migrate(path, stored, count)?;
        }

        let mapped = MappedFile::open(path, true)?;
        read_header(&mapped)?;
        let table = Self::attach(Arc::new(mapped), count, algorithm)?;
        table.reset_readers()?;
        let committed = table.read_committed_entry()?.ok_or_else(|| {
            TransactError::fatal(format!(
                "revision table {} has no valid read-committed entry",
                path.display()
            ))
        })?;
        info!(
            path = %path.display(),
            count,
            read_committed = %committed.revision,
            "opened revision table"
        );
        Ok(Arc::new(table))
    }

    fn create(
        path: &Path,
        count: u32,
        algorithm: ChecksumAlgorithm,
        pool: &RevisionPool,
    ) -> TransactResult<Arc<Self>> {
        info!(path = %path.display(), count, "creating revision table");
        let mapped = MappedFile::create(path, file_len(count), 0xFF)?;
        write_header(&mapped, count)?;
        let table = Self::attach(Arc::new(mapped), count, algorithm)?;

        let revision = pool.next_revision()?;
        let slot = table.ring.next_leading()?;
        table.write_entry(&slot, revision, EntryState::Committed)?;
        table.read_committed.set(u64::from(slot.index()));
        table.mapped.flush_and_sync()?;
        debug!(%revision, "recorded initial committed revision");
        Ok(Arc::new(table))
    }

    fn attach(
        mapped: Arc<MappedFile>,
        count: u32,
        algorithm: ChecksumAlgorithm,
    ) -> TransactResult<Self> {
        let ring = CircularBuffer::new(
            mapped.clone(),
            TABLE_HEADER_LEN,
            count as usize * TABLE_ENTRY_LEN,
            TABLE_ENTRY_LEN,
            COUNTER_OFFSET,
        )?;
        ring.snapshot()
            .map_err(|err| TransactError::fatal(format!("revision table ring: {err}")))?;
        let read_committed = MappedAtomicU64::new(mapped.clone(), READ_COMMITTED_OFFSET)?;
        let locks = (0..count).map(|_| SlotLock::new()).collect();
        Ok(Self {
            mapped,
            ring,
            read_committed,
            locks,
            algorithm,
            release_hook: OnceLock::new(),
        })
    }

    /// Reader counts are meaningless after a restart.
    fn reset_readers(&self) -> TransactResult<()> {
        for slice in self.ring.stream()? {
            slice.write_at(READERS_OFFSET, &[0u8; 8])?;
        }
        Ok(())
    }

    /// Installs the callback run when the last reader of a revision lets go.
    pub fn set_release_hook<F>(&self, hook: F)
    where
        F: Fn(Revision) + Send + Sync + 'static,
    {
        if self.release_hook.set(Box::new(hook)).is_err() {
            warn!("revision table release hook already installed");
        }
    }

    pub fn count(&self) -> u32 {
        self.ring.count()
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    fn lock(&self, index: u32) -> &SlotLock {
        &self.locks[index as usize]
    }

    fn readers(&self, slice: &Slice) -> TransactResult<MappedAtomicU64> {
        MappedAtomicU64::new(slice.mapped().clone(), slice.offset() + READERS_OFFSET)
    }

    fn validate_slice(&self, slice: &Slice) -> TransactResult<Option<TableEntry>> {
        let record: EntryRecord = slice.read_record()?;
        Ok(record.validate().map(|(revision, state)| TableEntry {
            index: slice.index(),
            revision,
            state,
        }))
    }

    fn write_entry(&self, slice: &Slice, revision: Revision, state: EntryState) -> TransactResult<()> {
        slice.write_record(&EntryRecord::sealed(revision, state, self.algorithm))?;
        slice.write_at(READERS_OFFSET, &[0u8; 8])?;
        slice.flush()
    }

    /// Validated entry at `index`, whether or not it is inside the ring.
    pub fn entry(&self, index: u32) -> TransactResult<Option<TableEntry>> {
        self.validate_slice(&self.ring.slice(index)?)
    }

    /// Every slot inside the ring from trailing to leading, with its validated entry.
    pub fn entries(&self) -> TransactResult<Vec<(u32, Option<TableEntry>)>> {
        self.ring
            .stream()?
            .iter()
            .map(|slice| -> TransactResult<_> { Ok((slice.index(), self.validate_slice(slice)?)) })
            .collect()
    }

    fn read_committed_index(&self) -> TransactResult<u32> {
        let raw = self.read_committed.get();
        u32::try_from(raw)
            .ok()
            .filter(|index| *index < self.count())
            .ok_or_else(|| TransactError::corruption(format!("read-committed slot {raw} out of range")))
    }

    fn read_committed_entry(&self) -> TransactResult<Option<TableEntry>> {
        let entry = self.entry(self.read_committed_index()?)?;
        Ok(entry.filter(|entry| entry.state == EntryState::Committed))
    }

    /// Revision currently exposed to read-committed readers.
    pub fn read_committed(&self) -> TransactResult<Revision> {
        self.read_committed_entry()?
            .map(|entry| entry.revision)
            .ok_or_else(|| TransactError::corruption("read-committed entry is invalid"))
    }

    /// Exclusively claims the next slot of the ring for a new revision.
    pub fn write_lock_next_leading(self: &Arc<Self>) -> TransactResult<SlotWriteGuard> {
        let slice = self.ring.next_leading()?;
        self.lock(slice.index()).acquire(SLOT_PERMITS);
        trace!(slot = slice.index(), "write-locked next leading slot");
        Ok(SlotWriteGuard {
            table: self.clone(),
            slice,
        })
    }

    /// Exclusively locks a specific slot, waiting for readers to leave.
    pub fn write_lock_slot(self: &Arc<Self>, index: u32) -> TransactResult<SlotWriteGuard> {
        let slice = self.ring.slice(index)?;
        self.lock(index).acquire(SLOT_PERMITS);
        Ok(SlotWriteGuard {
            table: self.clone(),
            slice,
        })
    }

    fn pin(self: &Arc<Self>, slice: Slice, expected: Option<Revision>) -> TransactResult<Option<LockedRevision>> {
        self.lock(slice.index()).acquire(READ_PERMITS);
        let entry = match self.validate_slice(&slice) {
            Ok(entry) => entry,
            Err(err) => {
                self.lock(slice.index()).release(READ_PERMITS);
                return Err(err);
            }
        };
        let pinned = entry.filter(|entry| {
            entry.state == EntryState::Committed
                && expected.is_none_or(|revision| revision == entry.revision)
        });
        let Some(entry) = pinned else {
            self.lock(slice.index()).release(READ_PERMITS);
            return Ok(None);
        };
        let readers = match self.readers(&slice) {
            Ok(readers) => readers,
            Err(err) => {
                self.lock(slice.index()).release(READ_PERMITS);
                return Err(err);
            }
        };
        readers.increment_and_get();
        Ok(Some(LockedRevision {
            table: self.clone(),
            index: entry.index,
            revision: entry.revision,
            readers,
        }))
    }

    /// Pins the revision currently exposed to read-committed readers.
    ///
    /// Retries against the current pointer when the chosen slot turns out
    /// invalid between reading the pointer and acquiring the pin.
    pub fn read_lock_latest_read_committed(self: &Arc<Self>) -> TransactResult<LockedRevision> {
        loop {
            let slice = self.ring.slice(self.read_committed_index()?)?;
            if let Some(locked) = self.pin(slice, None)? {
                return Ok(locked);
            }
            trace!("read-committed slot changed during pin, retrying");
            std::thread::yield_now();
        }
    }

    /// Pins the newest committed revision, even if the read-committed pointer
    /// has not caught up with it yet.
    pub fn lock_latest_read_uncommitted(self: &Arc<Self>) -> TransactResult<LockedRevision> {
        for slice in self.ring.reverse()? {
            let Some(entry) = self.validate_slice(&slice)? else {
                continue;
            };
            if entry.state != EntryState::Committed {
                continue;
            }
            if let Some(locked) = self.pin(slice, Some(entry.revision))? {
                return Ok(locked);
            }
        }
        self.read_lock_latest_read_committed()
    }

    /// Write-locks every slot older than the read-committed one that no reader
    /// holds, stopping at the first pinned or still-writing entry.
    pub fn write_lock_collectible_revisions(self: &Arc<Self>) -> TransactResult<Vec<SlotWriteGuard>> {
        let boundary = self.read_committed_index()?;
        let mut guards = Vec::new();
        for slice in self.ring.stream()? {
            if slice.index() == boundary {
                break;
            }
            if !self.lock(slice.index()).try_acquire(SLOT_PERMITS) {
                trace!(slot = slice.index(), "slot pinned, collection stops here");
                break;
            }
            let guard = SlotWriteGuard {
                table: self.clone(),
                slice,
            };
            if matches!(
                guard.entry()?,
                Some(TableEntry {
                    state: EntryState::Writing,
                    ..
                })
            ) {
                break;
            }
            guards.push(guard);
        }
        Ok(guards)
    }

    /// Advances the read-committed pointer to `index` unless it already
    /// exposes the same or a newer revision.
    pub fn update_read_committed(&self, index: u32) -> TransactResult<bool> {
        let target = self
            .entry(index)?
            .filter(|entry| entry.state == EntryState::Committed)
            .ok_or_else(|| {
                TransactError::invalid_state(format!("slot {index} is not a committed entry"))
            })?;
        loop {
            let current_raw = self.read_committed.get();
            let current = u32::try_from(current_raw)
                .ok()
                .filter(|current| *current < self.count())
                .map(|current| self.entry(current))
                .transpose()?
                .flatten();
            if let Some(current) = current {
                if current.revision >= target.revision {
                    return Ok(false);
                }
            }
            if self
                .read_committed
                .compare_and_set(current_raw, u64::from(index))
            {
                self.mapped
                    .flush_range(READ_COMMITTED_OFFSET..READ_COMMITTED_OFFSET + 8)?;
                debug!(revision = %target.revision, slot = index, "advanced read-committed revision");
                return Ok(true);
            }
        }
    }

    /// Trims invalid entries from the trailing edge of the ring.
    pub fn reclaim_invalid_entries(&self) -> TransactResult<u32> {
        let reclaimed = self
            .ring
            .advance_trailing_while(|slice| Ok(self.validate_slice(slice)?.is_none()))?;
        if reclaimed > 0 {
            self.mapped.flush_range(COUNTER_OFFSET..COUNTER_OFFSET + 8)?;
            debug!(reclaimed, "reclaimed revision table entries");
        }
        Ok(reclaimed)
    }

    pub fn flush(&self) -> TransactResult<()> {
        self.mapped.flush_and_sync()
    }
}

impl std::fmt::Debug for RevisionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevisionTable")
            .field("path", &self.mapped.path())
            .field("count", &self.count())
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

/// Exclusive hold on one table slot.
pub struct SlotWriteGuard {
    table: Arc<RevisionTable>,
    slice: Slice,
}

impl SlotWriteGuard {
    pub fn index(&self) -> u32 {
        self.slice.index()
    }

    pub fn entry(&self) -> TransactResult<Option<TableEntry>> {
        self.table.validate_slice(&self.slice)
    }

    pub fn write(&self, revision: Revision, state: EntryState) -> TransactResult<()> {
        self.table.write_entry(&self.slice, revision, state)
    }

    /// Invalidates the slot so it can be reclaimed.
    pub fn clear(&self) -> TransactResult<()> {
        self.slice.clear()?;
        self.slice.flush()
    }
}

impl Drop for SlotWriteGuard {
    fn drop(&mut self) {
        self.table.lock(self.slice.index()).release(SLOT_PERMITS);
    }
}

impl std::fmt::Debug for SlotWriteGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotWriteGuard")
            .field("slot", &self.slice.index())
            .finish()
    }
}

/// A reader's pin on one committed revision.
///
/// While held, the collector will not reclaim the revision's slot.
pub struct LockedRevision {
    table: Arc<RevisionTable>,
    index: u32,
    revision: Revision,
    readers: MappedAtomicU64,
}

impl LockedRevision {
    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn slot(&self) -> u32 {
        self.index
    }

    pub fn close(self) {}
}

impl Drop for LockedRevision {
    fn drop(&mut self) {
        let remaining = self.readers.decrement_and_get();
        self.table.lock(self.index).release(READ_PERMITS);
        if remaining == 0 {
            if let Some(hook) = self.table.release_hook.get() {
                hook(self.revision);
            }
        }
    }
}

impl std::fmt::Debug for LockedRevision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedRevision")
            .field("revision", &self.revision)
            .field("slot", &self.index)
            .finish()
    }
}

fn file_len(count: u32) -> usize {
    TABLE_HEADER_LEN + count as usize * TABLE_ENTRY_LEN
}

/// Writes a header describing an empty ring of `count` slots.
fn write_header(mapped: &MappedFile, count: u32) -> TransactResult<()> {
    let mut header = [0u8; TABLE_HEADER_LEN];
    mmap::write_preamble(&mut header, TABLE_MAGIC, TABLE_MAJOR, TABLE_MINOR);
    LittleEndian::write_u32(&mut header[COUNT_OFFSET..COUNT_OFFSET + 4], count);
    LittleEndian::write_u64(&mut header[COUNTER_OFFSET..COUNTER_OFFSET + 8], EMPTY_MASK);
    mapped.write_bytes(0, &header)
}

/// Validates the header and returns the stored slot count.
fn read_header(mapped: &MappedFile) -> TransactResult<u32> {
    if mapped.len() < TABLE_HEADER_LEN {
        return Err(TransactError::fatal(format!(
            "revision table {} is truncated",
            mapped.path().display()
        )));
    }
    let header = mapped.read_slice(0..TABLE_HEADER_LEN)?;
    mmap::verify_preamble(header, TABLE_MAGIC, TABLE_MAJOR, TABLE_MINOR, mapped.path())?;
    let count = LittleEndian::read_u32(&header[COUNT_OFFSET..COUNT_OFFSET + 4]);
    if mapped.len() != file_len(count) {
        return Err(TransactError::fatal(format!(
            "revision table {} has {} bytes, expected {} for {count} entries",
            mapped.path().display(),
            mapped.len(),
            file_len(count)
        )));
    }
    Ok(count)
}

/// Rewrites the table with `to` slots, moving the ring to start at slot 0.
fn migrate(path: &Path, from: u32, to: u32) -> TransactResult<()> {
    info!(path = %path.display(), from, to, "growing revision table");
    let old = Arc::new(MappedFile::open(path, true)?);
    let old_ring = CircularBuffer::new(
        old.clone(),
        TABLE_HEADER_LEN,
        from as usize * TABLE_ENTRY_LEN,
        TABLE_ENTRY_LEN,
        COUNTER_OFFSET,
    )?;
    let old_read_committed = LittleEndian::read_u64(
        old.read_slice(READ_COMMITTED_OFFSET..READ_COMMITTED_OFFSET + 8)?,
    );

    let parent = path
        .parent()
        .ok_or_else(|| TransactError::invalid_argument("revision table path has no parent"))?;
    let temp = TempFileGuard::new(parent, "head-", file_len(to) as u64)?;
    {
        let fresh = Arc::new(MappedFile::open(temp.path()?, true)?);
        fresh.fill(0..fresh.len(), 0xFF)?;
        write_header(&fresh, to)?;
        let ring = CircularBuffer::new(
            fresh.clone(),
            TABLE_HEADER_LEN,
            to as usize * TABLE_ENTRY_LEN,
            TABLE_ENTRY_LEN,
            COUNTER_OFFSET,
        )?;
        let mut new_read_committed = None;
        let blocks = old_ring.stream()?;
        for (position, block) in blocks.iter().enumerate() {
            let target = ring.slice(position as u32)?;
            target.write_at(0, block.bytes()?)?;
            if u64::from(block.index()) == old_read_committed {
                new_read_committed = Some(position as u64);
            }
        }
        ring.counter().restore_prefix(blocks.len() as u32)?;
        let new_read_committed = new_read_committed.ok_or_else(|| {
            TransactError::fatal("read-committed slot lies outside the revision table ring")
        })?;
        fresh.write_bytes(READ_COMMITTED_OFFSET, &new_read_committed.to_le_bytes())?;
        fresh.flush_and_sync()?;
    }
    drop(old_ring);
    drop(old);
    temp.persist(path)
}

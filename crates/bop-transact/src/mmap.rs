//! Shared memory-mapped metadata files.
//!
//! A [`MappedFile`] owns one mapping for the lifetime of a component. Several
//! views (atomic counters, ring blocks, headers) point into the same mapping at
//! the same time, so access goes through a raw base pointer and explicit ranges
//! instead of a borrowed `&mut MmapMut`. Exclusive access to a byte range is the
//! caller's responsibility: ring blocks are guarded by slot locks, header words
//! by atomics.

use std::fs::{File, OpenOptions};
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicPtr, Ordering};

use byteorder::{ByteOrder, LittleEndian};
use memmap2::{Mmap, MmapMut};
use parking_lot::Mutex;

use crate::error::{TransactError, TransactResult};

enum MappedRegion {
    Read(Mmap),
    Write(MmapMut),
}

pub struct MappedFile {
    path: PathBuf,
    file: File,
    region: Mutex<MappedRegion>,
    data: AtomicPtr<u8>,
    len: usize,
    writable: bool,
}

unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}

impl MappedFile {
    /// Maps an existing file in its entirety.
    pub fn open(path: &Path, writable: bool) -> TransactResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .map_err(TransactError::from)?;
        let len = usize::try_from(file.metadata()?.len())
            .map_err(|_| TransactError::corruption("mapped file exceeds address space"))?;
        if len == 0 {
            return Err(TransactError::corruption(format!(
                "refusing to map empty file {}",
                path.display()
            )));
        }

        let (region, ptr) = if writable {
            let mut map = unsafe { MmapMut::map_mut(&file).map_err(TransactError::from)? };
            let data_ptr = map.as_mut_ptr();
            (MappedRegion::Write(map), data_ptr)
        } else {
            let map = unsafe { Mmap::map(&file).map_err(TransactError::from)? };
            let data_ptr = map.as_ptr() as *mut u8;
            (MappedRegion::Read(map), data_ptr)
        };

        Ok(Self {
            path: path.to_path_buf(),
            file,
            region: Mutex::new(region),
            data: AtomicPtr::new(ptr),
            len,
            writable,
        })
    }

    /// Creates (or truncates) a file of exactly `len` bytes filled with `filler`
    /// and maps it writable.
    pub fn create(path: &Path, len: usize, filler: u8) -> TransactResult<Self> {
        crate::fs::create_fixed_size_file(path, len as u64)?;
        let mapped = Self::open(path, true)?;
        mapped.fill(0..len, filler)?;
        Ok(mapped)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    fn check_range(&self, range: &Range<usize>) -> TransactResult<*mut u8> {
        if range.end > self.len || range.start > range.end {
            return Err(TransactError::invalid_argument(format!(
                "range {}..{} outside mapping of {} bytes ({})",
                range.start,
                range.end,
                self.len,
                self.path.display()
            )));
        }
        let ptr = self.data.load(Ordering::Acquire);
        if ptr.is_null() {
            return Err(TransactError::invalid_state("memory unmapped"));
        }
        Ok(ptr)
    }

    fn check_writable(&self) -> TransactResult<()> {
        if !self.writable {
            return Err(TransactError::invalid_state(format!(
                "attempted to write to read-only mapping {}",
                self.path.display()
            )));
        }
        Ok(())
    }

    /// Base address of `offset`, validated against the mapping bounds.
    pub(crate) fn address_of(&self, offset: usize, len: usize) -> TransactResult<*mut u8> {
        let ptr = self.check_range(&(offset..offset.saturating_add(len)))?;
        Ok(unsafe { ptr.add(offset) })
    }

    pub fn read_slice(&self, range: Range<usize>) -> TransactResult<&[u8]> {
        let ptr = self.check_range(&range)?;
        unsafe { Ok(slice::from_raw_parts(ptr.add(range.start), range.len())) }
    }

    /// Mutable view of a range. The caller must hold whatever lock guards that range.
    #[allow(clippy::mut_from_ref)]
    pub fn slice_mut(&self, range: Range<usize>) -> TransactResult<&mut [u8]> {
        self.check_writable()?;
        let ptr = self.check_range(&range)?;
        unsafe { Ok(slice::from_raw_parts_mut(ptr.add(range.start), range.len())) }
    }

    /// Copies a range out of the mapping.
    pub fn copy_range(&self, range: Range<usize>) -> TransactResult<Vec<u8>> {
        Ok(self.read_slice(range)?.to_vec())
    }

    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) -> TransactResult<()> {
        self.check_writable()?;
        let ptr = self.check_range(&(offset..offset.saturating_add(bytes.len())))?;
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.add(offset), bytes.len());
        }
        Ok(())
    }

    pub fn fill(&self, range: Range<usize>, byte: u8) -> TransactResult<()> {
        self.check_writable()?;
        let ptr = self.check_range(&range)?;
        unsafe {
            ptr::write_bytes(ptr.add(range.start), byte, range.len());
        }
        Ok(())
    }

    pub fn flush_range(&self, range: Range<usize>) -> TransactResult<()> {
        self.check_range(&range)?;
        let guard = self.region.lock();
        match &*guard {
            MappedRegion::Write(map) => {
                map.flush_range(range.start, range.len())
                    .map_err(TransactError::from)?;
                Ok(())
            }
            MappedRegion::Read(_) => Ok(()),
        }
    }

    pub fn flush(&self) -> TransactResult<()> {
        let guard = self.region.lock();
        match &*guard {
            MappedRegion::Write(map) => {
                map.flush().map_err(TransactError::from)?;
                Ok(())
            }
            MappedRegion::Read(_) => Ok(()),
        }
    }

    pub fn flush_and_sync(&self) -> TransactResult<()> {
        self.flush()?;
        match self.file.sync_data() {
            Ok(()) => Ok(()),
            Err(err) if sync_data_unsupported(&err) => {
                self.file.sync_all().map_err(TransactError::from)
            }
            Err(err) => Err(TransactError::from(err)),
        }
    }
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile")
            .field("path", &self.path)
            .field("len", &self.len)
            .field("writable", &self.writable)
            .finish()
    }
}

/// Length of the magic and version words that open every metadata file.
pub const PREAMBLE_LEN: usize = 12;

/// Writes `magic`, major and minor version at the start of `dst`.
pub fn write_preamble(dst: &mut [u8], magic: &[u8; 4], major: u32, minor: u32) {
    dst[0..4].copy_from_slice(magic);
    LittleEndian::write_u32(&mut dst[4..8], major);
    LittleEndian::write_u32(&mut dst[8..12], minor);
}

/// Checks the magic and version of a metadata file; any mismatch is fatal.
pub fn verify_preamble(
    src: &[u8],
    magic: &[u8; 4],
    major: u32,
    minor: u32,
    path: &Path,
) -> TransactResult<()> {
    if src.len() < PREAMBLE_LEN {
        return Err(TransactError::fatal(format!(
            "{} is too short for a header",
            path.display()
        )));
    }
    if &src[0..4] != magic {
        return Err(TransactError::fatal(format!(
            "{} has magic {:?}, expected {:?}",
            path.display(),
            String::from_utf8_lossy(&src[0..4]),
            String::from_utf8_lossy(magic)
        )));
    }
    let found = (
        LittleEndian::read_u32(&src[4..8]),
        LittleEndian::read_u32(&src[8..12]),
    );
    if found != (major, minor) {
        return Err(TransactError::fatal(format!(
            "{} has version {}.{}, expected {major}.{minor}",
            path.display(),
            found.0,
            found.1
        )));
    }
    Ok(())
}

fn sync_data_unsupported(err: &io::Error) -> bool {
    if matches!(err.kind(), io::ErrorKind::Unsupported) {
        return true;
    }
    if let Some(code) = err.raw_os_error() {
        if code == libc::ENOSYS || code == libc::EINVAL || code == libc::ENOTSUP {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_fills_and_persists() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("region");
        {
            let mapped = MappedFile::create(&path, 64, 0xFF).expect("create");
            assert!(mapped.read_slice(0..64).expect("read").iter().all(|b| *b == 0xFF));
            mapped.write_bytes(8, b"RELM").expect("write");
            mapped.flush_and_sync().expect("sync");
        }
        let reopened = MappedFile::open(&path, false).expect("open");
        assert_eq!(reopened.len(), 64);
        assert_eq!(reopened.read_slice(8..12).expect("read"), b"RELM");
    }

    #[test]
    fn read_only_mapping_rejects_writes() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("region");
        drop(MappedFile::create(&path, 16, 0).expect("create"));
        let mapped = MappedFile::open(&path, false).expect("open");
        assert!(matches!(
            mapped.write_bytes(0, &[1]),
            Err(TransactError::InvalidState(_))
        ));
        assert!(mapped.slice_mut(0..1).is_err());
    }

    #[test]
    fn preamble_mismatch_is_fatal() {
        let mut header = [0u8; PREAMBLE_LEN];
        write_preamble(&mut header, b"TEST", 1, 0);
        let path = Path::new("meta");
        verify_preamble(&header, b"TEST", 1, 0, path).expect("verify");
        assert!(matches!(
            verify_preamble(&header, b"TSET", 1, 0, path),
            Err(TransactError::Fatal(_))
        ));
        assert!(verify_preamble(&header, b"TEST", 1, 1, path).is_err());
    }

    #[test]
    fn out_of_range_access_fails() {
        let tmp = TempDir::new().expect("tempdir");
        let mapped = MappedFile::create(&tmp.path().join("region"), 16, 0).expect("create");
        assert!(mapped.read_slice(8..17).is_err());
        assert!(mapped.write_bytes(15, &[1, 2]).is_err());
    }
}

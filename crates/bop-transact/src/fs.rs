use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::error::{TransactError, TransactResult};
use crate::revision::Revision;

/// Suffix of revisioned hard links to resource contents.
pub const RLINK_EXTENSION: &str = "rlink";
/// Suffix of revisioned symbolic links to path or reverse mappings.
pub const RSYMLINK_EXTENSION: &str = "rsymlink";
/// Suffix of directories standing for one path component.
pub const COMPONENT_DIR_SUFFIX: &str = ".d";

const LOCK_FILE: &str = "lock";
const HEAD_FILE: &str = "head";
const RPOOL_FILE: &str = "rpool";
const JOURNAL_FILE: &str = "journal";
pub(crate) const PATHS_DIR: &str = "paths";
const REVERSE_DIR: &str = "reverse";
pub(crate) const RESOURCES_DIR: &str = "resources";
const TEMPORARY_DIR: &str = "temporary";
const TOMBSTONE_FILE: &str = "tombstone";

/// Canonical on-disk layout under a storage root.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
    paths: PathBuf,
    reverse: PathBuf,
    resources: PathBuf,
    temporary: PathBuf,
}

impl Layout {
    pub fn new(root: &Path) -> Self {
        let root = root.to_path_buf();
        Self {
            paths: root.join(PATHS_DIR),
            reverse: root.join(REVERSE_DIR),
            resources: root.join(RESOURCES_DIR),
            temporary: root.join(TEMPORARY_DIR),
            root,
        }
    }

    /// Creates the directory skeleton and the tombstone marker.
    ///
    /// Every tree must live on the same filesystem as the root, otherwise hard
    /// links between `temporary/`, `resources/` and the tombstone would fail.
    pub fn initialize(&self) -> TransactResult<()> {
        fs::create_dir_all(&self.root)?;
        let root_dev = fs::metadata(&self.root)?.dev();
        for dir in [&self.paths, &self.reverse, &self.resources, &self.temporary] {
            fs::create_dir_all(dir)?;
            let dev = fs::metadata(dir)?.dev();
            if dev != root_dev {
                return Err(TransactError::fatal(format!(
                    "{} is not on the same filesystem as {}",
                    dir.display(),
                    self.root.display()
                )));
            }
        }

        let tombstone = self.tombstone_path();
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tombstone)
        {
            Ok(file) => {
                file.sync_all()?;
                info!(path = %tombstone.display(), "created tombstone marker");
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(err.into()),
        }
        let _ = fsync_dir(&self.root);
        Ok(())
    }

    pub fn root_dir(&self) -> &Path {
        &self.root
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    pub fn head_path(&self) -> PathBuf {
        self.root.join(HEAD_FILE)
    }

    pub fn rpool_path(&self) -> PathBuf {
        self.root.join(RPOOL_FILE)
    }

    pub fn journal_path(&self) -> PathBuf {
        self.root.join(JOURNAL_FILE)
    }

    pub fn tombstone_path(&self) -> PathBuf {
        self.root.join(TOMBSTONE_FILE)
    }

    pub fn paths_dir(&self) -> &Path {
        &self.paths
    }

    pub fn reverse_dir(&self) -> &Path {
        &self.reverse
    }

    pub fn resources_dir(&self) -> &Path {
        &self.resources
    }

    pub fn temporary_dir(&self) -> &Path {
        &self.temporary
    }

    /// Creates an empty staging file under `temporary/` that survives until
    /// explicitly removed.
    pub fn create_staging_file(&self) -> TransactResult<(File, PathBuf)> {
        let temp = tempfile::Builder::new()
            .prefix("stage-")
            .suffix(".tmp")
            .tempfile_in(&self.temporary)?;
        let (file, path) = temp.keep().map_err(|err| TransactError::Io(err.error))?;
        trace!(path = %path.display(), "created staging file");
        Ok((file, path))
    }

    /// Removes every leftover entry under `temporary/`.
    pub fn purge_temporary(&self) -> TransactResult<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.temporary)? {
            let entry = entry?;
            let path = entry.path();
            let result = if entry.file_type()?.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        if removed > 0 {
            debug!(removed, "purged temporary directory");
        }
        Ok(removed)
    }
}

/// Device and inode pair identifying one filesystem object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    dev: u64,
    ino: u64,
}

impl FileIdentity {
    /// Identity of `path` itself, without following a final symlink.
    pub fn of(path: &Path) -> io::Result<Self> {
        let meta = fs::symlink_metadata(path)?;
        Ok(Self {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    /// Whether `path` is a hard link to this object. Missing paths are not.
    pub fn matches(&self, path: &Path) -> io::Result<bool> {
        match Self::of(path) {
            Ok(other) => Ok(other == *self),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }
}

/// `{:016x}.{extension}` file name of a revisioned entry.
pub fn revisioned_file_name(revision: Revision, extension: &str) -> String {
    format!("{}.{extension}", revision.unique_identifier())
}

/// Parses a name produced by [`revisioned_file_name`]; anything else yields `None`.
pub fn parse_revisioned_file_name(name: &str, extension: &str) -> Option<Revision> {
    let stem = name.strip_suffix(extension)?.strip_suffix('.')?;
    if stem.len() != 16 {
        return None;
    }
    stem.parse().ok()
}

/// All revisioned entries with `extension` in `dir`, ascending by revision.
///
/// A missing directory yields an empty list.
pub fn list_revisions(dir: &Path, extension: &str) -> TransactResult<Vec<(Revision, PathBuf)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut found = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err.into()),
        };
        let name = entry.file_name();
        if let Some(revision) = name
            .to_str()
            .and_then(|name| parse_revisioned_file_name(name, extension))
        {
            found.push((revision, entry.path()));
        }
    }
    found.sort_by_key(|(revision, _)| *revision);
    Ok(found)
}

/// Latest revisioned entry in `dir` whose revision is at or before `revision`.
pub fn find_latest_for_revision(
    dir: &Path,
    extension: &str,
    revision: Revision,
) -> TransactResult<Option<(Revision, PathBuf)>> {
    Ok(list_revisions(dir, extension)?
        .into_iter()
        .rev()
        .find(|(candidate, _)| candidate.is_before_or_same(revision)))
}

fn sibling_temp_name(dst: &Path) -> TransactResult<PathBuf> {
    let parent = dst
        .parent()
        .ok_or_else(|| TransactError::invalid_argument("destination path missing parent"))?;
    Ok(parent.join(format!(".pending-{}", Uuid::new_v4().simple())))
}

/// Hard links `src` at `dst`, atomically replacing whatever `dst` held.
pub fn replace_hard_link(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::hard_link(src, dst) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            let temp = sibling_temp_name(dst).map_err(io::Error::other)?;
            fs::hard_link(src, &temp)?;
            fs::rename(&temp, dst).inspect_err(|_| {
                let _ = fs::remove_file(&temp);
            })
        }
        Err(err) => Err(err),
    }
}

/// Creates a symlink at `dst` pointing to `target`, atomically replacing whatever `dst` held.
pub fn replace_symlink(target: &Path, dst: &Path) -> io::Result<()> {
    match std::os::unix::fs::symlink(target, dst) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            let temp = sibling_temp_name(dst).map_err(io::Error::other)?;
            std::os::unix::fs::symlink(target, &temp)?;
            fs::rename(&temp, dst).inspect_err(|_| {
                let _ = fs::remove_file(&temp);
            })
        }
        Err(err) => Err(err),
    }
}

/// Removes a file; a missing file is not an error. Returns whether something was removed.
pub fn remove_file_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

/// Removes `path` if it is an empty directory. Returns whether it was removed.
pub fn remove_dir_if_empty(path: &Path) -> io::Result<bool> {
    match fs::remove_dir(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err)
            if matches!(
                err.raw_os_error(),
                Some(libc::ENOTEMPTY) | Some(libc::EEXIST)
            ) =>
        {
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

pub fn create_fixed_size_file(path: &Path, size: u64) -> TransactResult<File> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .read(true)
        .truncate(true)
        .open(path)?;
    file.set_len(size)?;
    file.sync_all()?;
    Ok(file)
}

pub fn fsync_dir(path: &Path) -> TransactResult<()> {
    match OpenOptions::new().read(true).open(path) {
        Ok(file) => match file.sync_all() {
            Ok(_) => Ok(()),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::Unsupported | io::ErrorKind::PermissionDenied
                ) =>
            {
                Ok(())
            }
            Err(err) => Err(TransactError::from(err)),
        },
        Err(err) if err.kind() == io::ErrorKind::NotFound => Err(TransactError::not_found(
            format!("directory not found: {}", path.display()),
        )),
        Err(err) if err.kind() == io::ErrorKind::PermissionDenied => Ok(()),
        Err(err) => Err(TransactError::from(err)),
    }
}

/// Sized scratch file that replaces a metadata file once fully written.
pub struct TempFileGuard {
    inner: Option<NamedTempFile>,
}

impl TempFileGuard {
    pub fn new(parent: &Path, prefix: &str, len: u64) -> TransactResult<Self> {
        let inner = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(".migrating")
            .tempfile_in(parent)?;
        inner.as_file().set_len(len)?;
        Ok(Self { inner: Some(inner) })
    }

    pub fn path(&self) -> TransactResult<&Path> {
        self.inner
            .as_ref()
            .map(NamedTempFile::path)
            .ok_or_else(|| TransactError::invalid_state("temp file already consumed"))
    }

    pub fn persist(mut self, dst: &Path) -> TransactResult<()> {
        let temp = self
            .inner
            .take()
            .ok_or_else(|| TransactError::invalid_state("temp file already consumed"))?;
        temp.as_file().sync_all()?;
        let parent = dst
            .parent()
            .ok_or_else(|| TransactError::invalid_argument("destination path missing parent"))?;
        match temp.persist(dst) {
            Ok(file) => {
                file.sync_all()?;
                let _ = fsync_dir(parent);
                Ok(())
            }
            Err(err) => {
                self.inner = Some(err.file);
                Err(TransactError::Io(err.error))
            }
        }
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if let Some(temp) = self.inner.take() {
            let _ = temp.close();
        }
    }
}

/// Process-wide advisory lock on the storage root.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
    path: PathBuf,
}

impl StoreLock {
    pub fn acquire(layout: &Layout) -> TransactResult<Self> {
        let path = layout.lock_path();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                return Err(TransactError::fatal(format!(
                    "storage root {} is locked by another store",
                    layout.root_dir().display()
                )));
            }
            return Err(err.into());
        }
        debug!(path = %path.display(), "acquired store lock");
        Ok(Self { file, path })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        trace!(path = %self.path.display(), "released store lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn revisioned_names_parse_back() {
        let name = revisioned_file_name(Revision::new(0x2a), RLINK_EXTENSION);
        assert_eq!(name, "000000000000002a.rlink");
        assert_eq!(
            parse_revisioned_file_name(&name, RLINK_EXTENSION),
            Some(Revision::new(0x2a))
        );
        assert_eq!(parse_revisioned_file_name(&name, RSYMLINK_EXTENSION), None);
        assert_eq!(parse_revisioned_file_name("2a.rlink", RLINK_EXTENSION), None);
    }

    #[test]
    fn latest_for_revision_skips_newer_entries() {
        let tmp = TempDir::new().expect("tempdir");
        for rev in [1u64, 3, 7] {
            File::create(
                tmp.path()
                    .join(revisioned_file_name(Revision::new(rev), RLINK_EXTENSION)),
            )
            .expect("create");
        }
        File::create(tmp.path().join("unrelated")).expect("create");
        let latest = |rev| {
            find_latest_for_revision(tmp.path(), RLINK_EXTENSION, Revision::new(rev))
                .expect("find")
                .map(|(found, _)| found.as_u64())
        };
        assert_eq!(latest(0), None);
        assert_eq!(latest(2), Some(1));
        assert_eq!(latest(3), Some(3));
        assert_eq!(latest(100), Some(7));
        assert!(
            list_revisions(&tmp.path().join("missing"), RLINK_EXTENSION)
                .expect("list")
                .is_empty()
        );
    }

    #[test]
    fn layout_initializes_and_detects_tombstones() {
        let tmp = TempDir::new().expect("tempdir");
        let layout = Layout::new(&tmp.path().join("rt"));
        layout.initialize().expect("initialize");
        layout.initialize().expect("idempotent");
        assert!(layout.paths_dir().is_dir());
        assert!(layout.temporary_dir().is_dir());

        let tombstone = FileIdentity::of(&layout.tombstone_path()).expect("identity");
        let marked = layout.resources_dir().join("marked");
        replace_hard_link(&layout.tombstone_path(), &marked).expect("link");
        assert!(tombstone.matches(&marked).expect("matches"));

        let (_file, staged) = layout.create_staging_file().expect("stage");
        assert!(!tombstone.matches(&staged).expect("matches"));
        replace_hard_link(&staged, &marked).expect("replace");
        assert!(!tombstone.matches(&marked).expect("matches"));
        assert_eq!(layout.purge_temporary().expect("purge"), 1);
    }

    #[test]
    fn replace_symlink_overwrites_existing_entry() {
        let tmp = TempDir::new().expect("tempdir");
        let link = tmp.path().join("entry");
        replace_symlink(Path::new("first"), &link).expect("first");
        replace_symlink(Path::new("second"), &link).expect("second");
        assert_eq!(fs::read_link(&link).expect("read"), Path::new("second"));
    }

    #[test]
    fn remove_dir_if_empty_keeps_populated_dirs() {
        let tmp = TempDir::new().expect("tempdir");
        let dir = tmp.path().join("a.d");
        fs::create_dir(&dir).expect("mkdir");
        File::create(dir.join("x")).expect("create");
        assert!(!remove_dir_if_empty(&dir).expect("remove"));
        fs::remove_file(dir.join("x")).expect("rm");
        assert!(remove_dir_if_empty(&dir).expect("remove"));
        assert!(!remove_dir_if_empty(&dir).expect("missing"));
    }

    #[test]
    fn second_lock_on_same_root_fails() {
        let tmp = TempDir::new().expect("tempdir");
        let layout = Layout::new(tmp.path());
        layout.initialize().expect("initialize");
        let first = StoreLock::acquire(&layout).expect("first");
        assert!(matches!(
            StoreLock::acquire(&layout),
            Err(TransactError::Fatal(_))
        ));
        drop(first);
        StoreLock::acquire(&layout).expect("reacquire");
    }
}

//! Revisioned link trees mapping paths to resources and resources to contents.
//!
//! ```text
//! paths/<node>/<a>.d/<b>.d/<rev>.rsymlink  -> ../../../../resources/<rid>
//! reverse/<node>/<rid>/<rev>.rsymlink      -> <snapshot>
//! reverse/<node>/<rid>/<snapshot>/<sha256> -> ../../../../paths/<node>/<a>.d/<b>.d
//! resources/<rid>/<rev>.rlink              (hard link to the content)
//! ```
//!
//! A revisioned entry that is a hard link to the root `tombstone` file marks
//! the mapping as deleted at that revision.

mod path;
mod resource;

pub use path::{Listing, PathIndex};
pub use resource::ResourceIndex;

use std::io;
use std::path::{Path, PathBuf};

use crate::error::TransactResult;
use crate::fs::{self, FileIdentity, RLINK_EXTENSION};
use crate::ids::ResourceId;
use crate::revision::Revision;

/// How many times a link is retried when its directory vanishes underneath it.
const LINK_ATTEMPTS: usize = 8;

/// State of a revisioned entry as seen from one revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryAt {
    Absent,
    Tombstone { revision: Revision, file: PathBuf },
    Present { revision: Revision, file: PathBuf },
}

impl EntryAt {
    pub fn is_present(&self) -> bool {
        matches!(self, EntryAt::Present { .. })
    }

    pub fn present_file(&self) -> Option<&Path> {
        match self {
            EntryAt::Present { file, .. } => Some(file),
            _ => None,
        }
    }

    pub fn revision(&self) -> Option<Revision> {
        match self {
            EntryAt::Absent => None,
            EntryAt::Tombstone { revision, .. } | EntryAt::Present { revision, .. } => {
                Some(*revision)
            }
        }
    }
}

/// Resolves the latest entry of `dir` at or before `revision`.
pub(crate) fn entry_at(
    dir: &Path,
    extension: &str,
    revision: Revision,
    tombstone: &FileIdentity,
) -> TransactResult<EntryAt> {
    let Some((found, file)) = fs::find_latest_for_revision(dir, extension, revision)? else {
        return Ok(EntryAt::Absent);
    };
    if tombstone.matches(&file)? {
        return Ok(EntryAt::Tombstone {
            revision: found,
            file,
        });
    }
    Ok(EntryAt::Present {
        revision: found,
        file,
    })
}

/// State of a resource's content directory at `revision`.
pub(crate) fn resource_entry_at(
    resources_dir: &Path,
    resource: ResourceId,
    revision: Revision,
    tombstone: &FileIdentity,
) -> TransactResult<(bool, EntryAt)> {
    let dir = resources_dir.join(resource.as_dir_name());
    if !dir.is_dir() {
        return Ok((false, EntryAt::Absent));
    }
    Ok((true, entry_at(&dir, RLINK_EXTENSION, revision, tombstone)?))
}

/// Runs `op` after creating `dir`, recreating it if it disappears between
/// the two steps.
pub(crate) fn with_directory<F>(dir: &Path, mut op: F) -> io::Result<()>
where
    F: FnMut() -> io::Result<()>,
{
    let mut attempt = 0;
    loop {
        std::fs::create_dir_all(dir)?;
        match op() {
            Err(err) if err.kind() == io::ErrorKind::NotFound && attempt + 1 < LINK_ATTEMPTS => {
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Removes the reverse entry `link` of `dir` along with the snapshot it
/// points at. Returns whether the entry existed.
pub(crate) fn remove_reverse_entry(dir: &Path, link: &Path) -> io::Result<bool> {
    if let Ok(target) = std::fs::read_link(link) {
        let snapshot = dir.join(target);
        if snapshot.is_dir() {
            std::fs::remove_dir_all(&snapshot)?;
        }
    }
    fs::remove_file_if_exists(link)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{Layout, replace_hard_link, revisioned_file_name};
    use tempfile::TempDir;

    #[test]
    fn entry_at_distinguishes_tombstones() {
        let tmp = TempDir::new().expect("tempdir");
        let layout = Layout::new(tmp.path());
        layout.initialize().expect("initialize");
        let tombstone = FileIdentity::of(&layout.tombstone_path()).expect("identity");
        let dir = layout.resources_dir().join("r");
        std::fs::create_dir(&dir).expect("mkdir");
        std::fs::write(dir.join(revisioned_file_name(Revision::new(1), RLINK_EXTENSION)), b"x")
            .expect("write");
        replace_hard_link(
            &layout.tombstone_path(),
            &dir.join(revisioned_file_name(Revision::new(3), RLINK_EXTENSION)),
        )
        .expect("tombstone");

        let at = |rev| entry_at(&dir, RLINK_EXTENSION, Revision::new(rev), &tombstone).expect("entry");
        assert_eq!(at(0), EntryAt::Absent);
        assert!(at(2).is_present());
        assert!(matches!(at(3), EntryAt::Tombstone { .. }));
        assert_eq!(at(9).revision(), Some(Revision::new(3)));
    }

    #[test]
    fn with_directory_recreates_missing_parent() {
        let tmp = TempDir::new().expect("tempdir");
        let dir = tmp.path().join("a.d");
        let mut removed = false;
        with_directory(&dir, || {
            if !removed {
                removed = true;
                std::fs::remove_dir(&dir)?;
            }
            std::fs::write(dir.join("entry"), b"")
        })
        .expect("write");
        assert!(dir.join("entry").exists());
    }
}

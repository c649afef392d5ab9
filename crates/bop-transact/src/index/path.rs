use std::collections::BTreeSet;
use std::fs as stdfs;
use std::io;
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{trace, warn};
use uuid::Uuid;

use super::{EntryAt, entry_at, remove_reverse_entry, resource_entry_at, with_directory};
use crate::error::{TransactError, TransactResult};
use crate::fs::{
    self, COMPONENT_DIR_SUFFIX, FileIdentity, Layout, PATHS_DIR, RESOURCES_DIR,
    RSYMLINK_EXTENSION, revisioned_file_name,
};
use crate::ids::{NodeId, ResourceId};
use crate::revision::Revision;
use crate::rt_path::RtPath;

/// One path-to-resource mapping visible at a revision.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Listing {
    pub path: RtPath,
    pub resource: ResourceId,
}

/// Path tree and reverse mapping for every node.
#[derive(Debug, Clone)]
pub struct PathIndex {
    layout: Layout,
    tombstone: FileIdentity,
}

impl PathIndex {
    pub fn new(layout: Layout) -> TransactResult<Self> {
        let tombstone = FileIdentity::of(&layout.tombstone_path())?;
        Ok(Self { layout, tombstone })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn tombstone(&self) -> &FileIdentity {
        &self.tombstone
    }

    pub fn node_dir(&self, node: NodeId) -> PathBuf {
        self.layout.paths_dir().join(node.as_dir_name())
    }

    /// Directory holding the revisioned entries of `path`.
    pub fn path_dir(&self, node: NodeId, path: &RtPath) -> PathBuf {
        let mut dir = self.node_dir(node);
        for component in path.components() {
            dir.push(format!("{component}{COMPONENT_DIR_SUFFIX}"));
        }
        dir
    }

    /// Inverse of [`PathIndex::path_dir`] for directories below `node_dir`.
    fn path_for_dir(&self, node: NodeId, dir: &Path) -> Option<RtPath> {
        let relative = dir.strip_prefix(self.node_dir(node)).ok()?;
        let mut path = RtPath::root();
        for component in relative.components() {
            let Component::Normal(name) = component else {
                return None;
            };
            let name = name.to_str()?.strip_suffix(COMPONENT_DIR_SUFFIX)?;
            path = path.child(name).ok()?;
        }
        Some(path)
    }

    /// Target of a path entry: the resource directory, relative to the entry.
    fn resource_target(path: &RtPath, resource: ResourceId) -> PathBuf {
        let mut target = PathBuf::new();
        for _ in 0..path.component_count() + 2 {
            target.push("..");
        }
        target.push(RESOURCES_DIR);
        target.push(resource.as_dir_name());
        target
    }

    /// Revisioned entries of `path`, ascending.
    pub fn revisions(&self, node: NodeId, path: &RtPath) -> TransactResult<Vec<(Revision, PathBuf)>> {
        fs::list_revisions(&self.path_dir(node, path), RSYMLINK_EXTENSION)
    }

    pub fn entry_at(&self, node: NodeId, revision: Revision, path: &RtPath) -> TransactResult<EntryAt> {
        entry_at(
            &self.path_dir(node, path),
            RSYMLINK_EXTENSION,
            revision,
            &self.tombstone,
        )
    }

    /// Resource `path` maps to at `revision`, if any.
    ///
    /// An entry whose target directory no longer exists is reported as absent.
    pub fn get_value_at(
        &self,
        node: NodeId,
        revision: Revision,
        path: &RtPath,
    ) -> TransactResult<Option<ResourceId>> {
        let EntryAt::Present { file, .. } = self.entry_at(node, revision, path)? else {
            return Ok(None);
        };
        let target = match stdfs::read_link(&file) {
            Ok(target) => target,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let resource = target
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| ResourceId::from_dir_name(name).ok())
            .ok_or_else(|| {
                TransactError::corruption(format!(
                    "path entry {} points at {}",
                    file.display(),
                    target.display()
                ))
            })?;
        match stdfs::metadata(&file) {
            Ok(meta) if meta.is_dir() => Ok(Some(resource)),
            Ok(_) => Err(TransactError::corruption(format!(
                "path entry {} does not point at a directory",
                file.display()
            ))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!(
                    entry = %file.display(),
                    %resource,
                    "path entry points at a missing resource directory"
                );
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Mappings visible at `revision`: the path itself when concrete, every
    /// path below the prefix when `pattern` is a wildcard. Sorted by path.
    pub fn list(&self, node: NodeId, revision: Revision, pattern: &RtPath) -> TransactResult<Vec<Listing>> {
        if !pattern.is_wildcard() {
            if pattern.is_root() {
                return Ok(Vec::new());
            }
            return Ok(self
                .get_value_at(node, revision, pattern)?
                .map(|resource| Listing {
                    path: pattern.clone(),
                    resource,
                })
                .into_iter()
                .collect());
        }

        let mut listings = Vec::new();
        let mut pending = vec![self.path_dir(node, &pattern.prefix())];
        while let Some(dir) = pending.pop() {
            let entries = match stdfs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            for entry in entries {
                let entry = entry?;
                let is_component = entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.ends_with(COMPONENT_DIR_SUFFIX));
                if !is_component || !entry.file_type()?.is_dir() {
                    continue;
                }
                let child = entry.path();
                if let Some(path) = self.path_for_dir(node, &child) {
                    if let Some(resource) = self.get_value_at(node, revision, &path)? {
                        listings.push(Listing { path, resource });
                    }
                }
                pending.push(child);
            }
        }
        listings.sort();
        Ok(listings)
    }

    /// Ensures the directory of `path` exists.
    pub fn add_path(&self, node: NodeId, path: &RtPath) -> TransactResult<()> {
        path.ensure_linkable()?;
        stdfs::create_dir_all(self.path_dir(node, path))?;
        Ok(())
    }

    /// Maps `path` to `resource` at `revision`, replacing any entry already
    /// written for that revision.
    ///
    /// The resource must exist and must not be removed at `revision`.
    pub fn link(
        &self,
        node: NodeId,
        revision: Revision,
        path: &RtPath,
        resource: ResourceId,
    ) -> TransactResult<()> {
        path.ensure_linkable()?;
        let (exists, content) = resource_entry_at(
            self.layout.resources_dir(),
            resource,
            revision,
            &self.tombstone,
        )?;
        if !exists {
            return Err(TransactError::fatal(format!(
                "cannot link {path} to missing resource {resource}"
            )));
        }
        if matches!(content, EntryAt::Tombstone { .. }) {
            return Err(TransactError::fatal(format!(
                "cannot link {path} to resource {resource} removed at {revision}"
            )));
        }

        let dir = self.path_dir(node, path);
        let entry = dir.join(revisioned_file_name(revision, RSYMLINK_EXTENSION));
        let target = Self::resource_target(path, resource);
        with_directory(&dir, || fs::replace_symlink(&target, &entry))?;
        trace!(%node, %revision, %path, %resource, "linked path");
        self.link_reverse(node, revision, path, resource)
    }

    /// Tombstones `path` at `revision` and drops it from the reverse mapping of `resource`.
    pub fn unlink(
        &self,
        node: NodeId,
        revision: Revision,
        path: &RtPath,
        resource: ResourceId,
    ) -> TransactResult<()> {
        self.tombstone_path(node, revision, path)?;
        self.unlink_reverse(node, revision, path, resource)
    }

    /// Tombstones `path` at `revision` without touching the reverse mapping.
    pub fn tombstone_path(&self, node: NodeId, revision: Revision, path: &RtPath) -> TransactResult<()> {
        path.ensure_linkable()?;
        let dir = self.path_dir(node, path);
        let entry = dir.join(revisioned_file_name(revision, RSYMLINK_EXTENSION));
        let tombstone = self.layout.tombstone_path();
        with_directory(&dir, || fs::replace_hard_link(&tombstone, &entry))?;
        trace!(%node, %revision, %path, "tombstoned path");
        Ok(())
    }

    pub fn reverse_dir(&self, node: NodeId, resource: ResourceId) -> PathBuf {
        self.layout
            .reverse_dir()
            .join(node.as_dir_name())
            .join(resource.as_dir_name())
    }

    fn reverse_entry_name(path: &RtPath) -> String {
        let digest = Sha256::digest(path.to_string().as_bytes());
        format!("{digest:x}")
    }

    /// Target of a reverse entry: the path directory, relative to the entry.
    fn reverse_target(node: NodeId, path: &RtPath) -> PathBuf {
        let mut target = PathBuf::from("../../../..");
        target.push(PATHS_DIR);
        target.push(node.as_dir_name());
        for component in path.components() {
            target.push(format!("{component}{COMPONENT_DIR_SUFFIX}"));
        }
        target
    }

    fn path_for_reverse_target(node: NodeId, target: &Path) -> Option<RtPath> {
        let mut components = target.components().skip_while(|c| matches!(c, Component::ParentDir));
        let paths = components.next()?;
        let owner = components.next()?;
        if paths.as_os_str() != PATHS_DIR
            || owner.as_os_str() != node.as_dir_name().as_str()
        {
            return None;
        }
        let mut path = RtPath::root();
        for component in components {
            let name = component.as_os_str().to_str()?.strip_suffix(COMPONENT_DIR_SUFFIX)?;
            path = path.child(name).ok()?;
        }
        Some(path)
    }

    /// Snapshot directory of the reverse mapping of `resource` at exactly
    /// `revision`, copying the previous snapshot on first write.
    fn reverse_snapshot_for_write(
        &self,
        node: NodeId,
        revision: Revision,
        resource: ResourceId,
    ) -> TransactResult<PathBuf> {
        let dir = self.reverse_dir(node, resource);
        let previous = entry_at(&dir, RSYMLINK_EXTENSION, revision, &self.tombstone)?;
        if let EntryAt::Present {
            revision: found,
            file,
        } = &previous
        {
            if *found == revision {
                return Ok(dir.join(stdfs::read_link(file)?));
            }
        }

        let snapshot_name = Uuid::new_v4().simple().to_string();
        let snapshot = dir.join(&snapshot_name);
        with_directory(&dir, || stdfs::create_dir(&snapshot))?;
        if let Some(file) = previous.present_file() {
            let source = dir.join(stdfs::read_link(file)?);
            for entry in stdfs::read_dir(&source)? {
                let entry = entry?;
                let target = stdfs::read_link(entry.path())?;
                std::os::unix::fs::symlink(target, snapshot.join(entry.file_name()))?;
            }
        }
        let link = dir.join(revisioned_file_name(revision, RSYMLINK_EXTENSION));
        fs::replace_symlink(Path::new(&snapshot_name), &link)?;
        trace!(%node, %revision, %resource, "created reverse snapshot");
        Ok(snapshot)
    }

    fn link_reverse(
        &self,
        node: NodeId,
        revision: Revision,
        path: &RtPath,
        resource: ResourceId,
    ) -> TransactResult<()> {
        let snapshot = self.reverse_snapshot_for_write(node, revision, resource)?;
        let entry = snapshot.join(Self::reverse_entry_name(path));
        fs::replace_symlink(&Self::reverse_target(node, path), &entry)?;
        Ok(())
    }

    fn unlink_reverse(
        &self,
        node: NodeId,
        revision: Revision,
        path: &RtPath,
        resource: ResourceId,
    ) -> TransactResult<()> {
        let snapshot = self.reverse_snapshot_for_write(node, revision, resource)?;
        fs::remove_file_if_exists(&snapshot.join(Self::reverse_entry_name(path)))?;
        Ok(())
    }

    /// Marks the whole reverse mapping of `resource` as removed at `revision`.
    pub fn tombstone_reverse(
        &self,
        node: NodeId,
        revision: Revision,
        resource: ResourceId,
    ) -> TransactResult<()> {
        let dir = self.reverse_dir(node, resource);
        let link = dir.join(revisioned_file_name(revision, RSYMLINK_EXTENSION));
        remove_reverse_entry(&dir, &link)?;
        let tombstone = self.layout.tombstone_path();
        with_directory(&dir, || fs::replace_hard_link(&tombstone, &link))?;
        trace!(%node, %revision, %resource, "tombstoned reverse mapping");
        Ok(())
    }

    /// Deletes the entry written for `path` at exactly `revision`. Returns
    /// whether there was one.
    pub fn discard_entry(&self, node: NodeId, revision: Revision, path: &RtPath) -> TransactResult<bool> {
        let dir = self.path_dir(node, path);
        if !dir.is_dir() {
            return Ok(false);
        }
        let entry = dir.join(revisioned_file_name(revision, RSYMLINK_EXTENSION));
        Ok(fs::remove_file_if_exists(&entry)?)
    }

    /// Deletes the reverse snapshot (or tombstone) `resource` got at exactly
    /// `revision`, and the reverse directory if nothing else is left in it.
    pub fn discard_reverse(
        &self,
        node: NodeId,
        revision: Revision,
        resource: ResourceId,
    ) -> TransactResult<bool> {
        let dir = self.reverse_dir(node, resource);
        if !dir.is_dir() {
            return Ok(false);
        }
        let link = dir.join(revisioned_file_name(revision, RSYMLINK_EXTENSION));
        let removed = remove_reverse_entry(&dir, &link)?;
        fs::remove_dir_if_empty(&dir)?;
        if removed {
            trace!(%node, %revision, %resource, "discarded reverse mapping");
        }
        Ok(removed)
    }

    /// Paths that map to `resource` at `revision` according to the reverse index.
    pub fn reverse_paths_at(
        &self,
        node: NodeId,
        revision: Revision,
        resource: ResourceId,
    ) -> TransactResult<BTreeSet<RtPath>> {
        let dir = self.reverse_dir(node, resource);
        let mut paths = BTreeSet::new();
        let EntryAt::Present { file, .. } = entry_at(&dir, RSYMLINK_EXTENSION, revision, &self.tombstone)? else {
            return Ok(paths);
        };
        let snapshot = dir.join(stdfs::read_link(&file)?);
        let entries = match stdfs::read_dir(&snapshot) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!(snapshot = %snapshot.display(), "reverse snapshot is missing");
                return Ok(paths);
            }
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let entry = entry?;
            let target = stdfs::read_link(entry.path())?;
            match Self::path_for_reverse_target(node, &target) {
                Some(path) => {
                    paths.insert(path);
                }
                None => warn!(
                    entry = %entry.path().display(),
                    target = %target.display(),
                    "unrecognised reverse entry"
                ),
            }
        }
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        index: PathIndex,
        node: NodeId,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().expect("tempdir");
        let layout = Layout::new(tmp.path());
        layout.initialize().expect("initialize");
        let index = PathIndex::new(layout).expect("index");
        Fixture {
            _tmp: tmp,
            index,
            node: NodeId::random(),
        }
    }

    fn resource(index: &PathIndex) -> ResourceId {
        let id = ResourceId::random();
        stdfs::create_dir_all(index.layout().resources_dir().join(id.as_dir_name())).expect("mkdir");
        id
    }

    fn p(raw: &str) -> RtPath {
        RtPath::parse(raw).expect("path")
    }

    #[test]
    fn link_is_visible_from_its_revision_onward() {
        let fx = fixture();
        let rid = resource(&fx.index);
        let path = p("/a/b");
        fx.index.link(fx.node, Revision::new(2), &path, rid).expect("link");
        assert_eq!(fx.index.get_value_at(fx.node, Revision::new(1), &path).expect("get"), None);
        assert_eq!(fx.index.get_value_at(fx.node, Revision::new(2), &path).expect("get"), Some(rid));
        assert_eq!(fx.index.get_value_at(fx.node, Revision::new(9), &path).expect("get"), Some(rid));

        fx.index.unlink(fx.node, Revision::new(4), &path, rid).expect("unlink");
        assert_eq!(fx.index.get_value_at(fx.node, Revision::new(3), &path).expect("get"), Some(rid));
        assert_eq!(fx.index.get_value_at(fx.node, Revision::new(4), &path).expect("get"), None);
    }

    #[test]
    fn linking_a_missing_resource_is_fatal() {
        let fx = fixture();
        let err = fx
            .index
            .link(fx.node, Revision::new(1), &p("/x"), ResourceId::random())
            .expect_err("missing");
        assert!(err.is_fatal());
    }

    #[test]
    fn dead_symlink_reads_as_absent() {
        let fx = fixture();
        let rid = resource(&fx.index);
        let path = p("/gone");
        fx.index.link(fx.node, Revision::new(1), &path, rid).expect("link");
        stdfs::remove_dir(fx.index.layout().resources_dir().join(rid.as_dir_name())).expect("rmdir");
        assert_eq!(fx.index.get_value_at(fx.node, Revision::new(1), &path).expect("get"), None);
    }

    #[test]
    fn wildcard_lists_descendants_sorted() {
        let fx = fixture();
        let first = resource(&fx.index);
        let second = resource(&fx.index);
        let rev = Revision::new(1);
        fx.index.link(fx.node, rev, &p("/docs/b"), first).expect("link");
        fx.index.link(fx.node, rev, &p("/docs/a/deep"), second).expect("link");
        fx.index.link(fx.node, rev, &p("/other"), first).expect("link");

        let listed: Vec<String> = fx
            .index
            .list(fx.node, rev, &p("/docs/*"))
            .expect("list")
            .into_iter()
            .map(|listing| listing.path.to_string())
            .collect();
        assert_eq!(listed, vec!["/docs/a/deep", "/docs/b"]);
        assert_eq!(fx.index.list(fx.node, rev, &p("/other")).expect("list").len(), 1);
        assert!(fx.index.list(fx.node, rev, &p("/missing")).expect("list").is_empty());
        assert_eq!(fx.index.list(fx.node, rev, &p("/*")).expect("list").len(), 3);
    }

    #[test]
    fn reverse_mapping_is_copied_on_write() {
        let fx = fixture();
        let rid = resource(&fx.index);
        fx.index.link(fx.node, Revision::new(1), &p("/a"), rid).expect("link");
        fx.index.link(fx.node, Revision::new(1), &p("/b"), rid).expect("link");
        fx.index.unlink(fx.node, Revision::new(2), &p("/a"), rid).expect("unlink");

        let at = |rev| -> Vec<String> {
            fx.index
                .reverse_paths_at(fx.node, Revision::new(rev), rid)
                .expect("reverse")
                .into_iter()
                .map(|path| path.to_string())
                .collect()
        };
        assert_eq!(at(1), vec!["/a", "/b"]);
        assert_eq!(at(2), vec!["/b"]);

        fx.index.tombstone_reverse(fx.node, Revision::new(3), rid).expect("tombstone");
        assert!(at(3).is_empty());
        assert_eq!(at(2), vec!["/b"]);
    }
}

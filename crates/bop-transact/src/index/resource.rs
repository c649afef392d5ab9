use std::fs::{self as stdfs, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::trace;

use super::{EntryAt, PathIndex, resource_entry_at, with_directory};
use crate::error::{TransactError, TransactResult};
use crate::fs::{self, FileIdentity, Layout, RLINK_EXTENSION, revisioned_file_name};
use crate::ids::{NodeId, ResourceId};
use crate::revision::Revision;

/// Revisioned content of every resource, stored as hard links.
#[derive(Debug, Clone)]
pub struct ResourceIndex {
    layout: Layout,
    tombstone: FileIdentity,
    paths: Arc<PathIndex>,
}

impl ResourceIndex {
    pub fn new(paths: Arc<PathIndex>) -> Self {
        Self {
            layout: paths.layout().clone(),
            tombstone: *paths.tombstone(),
            paths,
        }
    }

    pub fn paths(&self) -> &Arc<PathIndex> {
        &self.paths
    }

    pub fn resource_dir(&self, resource: ResourceId) -> PathBuf {
        self.layout.resources_dir().join(resource.as_dir_name())
    }

    /// Revisioned content links of `resource`, ascending.
    pub fn revisions(&self, resource: ResourceId) -> TransactResult<Vec<(Revision, PathBuf)>> {
        fs::list_revisions(&self.resource_dir(resource), RLINK_EXTENSION)
    }

    /// Content entry of `resource` at `revision`; a missing directory reads as absent.
    pub fn entry_at(&self, revision: Revision, resource: ResourceId) -> TransactResult<EntryAt> {
        let (_, entry) =
            resource_entry_at(self.layout.resources_dir(), resource, revision, &self.tombstone)?;
        Ok(entry)
    }

    pub fn exists_at(&self, revision: Revision, resource: ResourceId) -> TransactResult<bool> {
        Ok(self.entry_at(revision, resource)?.is_present())
    }

    /// Whether `resource` has been added and not removed as of `revision`,
    /// with or without content.
    pub fn is_live_at(&self, revision: Revision, resource: ResourceId) -> TransactResult<bool> {
        let (exists, entry) =
            resource_entry_at(self.layout.resources_dir(), resource, revision, &self.tombstone)?;
        Ok(exists && !matches!(entry, EntryAt::Tombstone { .. }))
    }

    /// Opens the content `resource` had at `revision`.
    ///
    /// The returned handle stays readable even if the link is collected afterwards.
    pub fn load_resource_contents_at(
        &self,
        revision: Revision,
        resource: ResourceId,
    ) -> TransactResult<Option<File>> {
        let EntryAt::Present { file, .. } = self.entry_at(revision, resource)? else {
            return Ok(None);
        };
        match File::open(&file) {
            Ok(handle) => Ok(Some(handle)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Ensures the directory of `resource` exists.
    pub fn add_resource_id(&self, resource: ResourceId) -> TransactResult<()> {
        stdfs::create_dir_all(self.resource_dir(resource))?;
        Ok(())
    }

    /// Links the staged `source` file as the first content of `resource`.
    pub fn link_new_resource(
        &self,
        revision: Revision,
        source: &Path,
        resource: ResourceId,
    ) -> TransactResult<()> {
        self.link_content(revision, source, resource)
    }

    /// Links the staged `source` file as new content of an existing resource.
    pub fn update_resource(
        &self,
        revision: Revision,
        source: &Path,
        resource: ResourceId,
    ) -> TransactResult<()> {
        let (exists, entry) =
            resource_entry_at(self.layout.resources_dir(), resource, revision, &self.tombstone)?;
        if !exists {
            return Err(TransactError::fatal(format!(
                "cannot update missing resource {resource}"
            )));
        }
        if let EntryAt::Tombstone { revision: removed, .. } = entry {
            return Err(TransactError::fatal(format!(
                "cannot update resource {resource} removed at {removed}"
            )));
        }
        self.link_content(revision, source, resource)
    }

    fn link_content(&self, revision: Revision, source: &Path, resource: ResourceId) -> TransactResult<()> {
        let dir = self.resource_dir(resource);
        let entry = dir.join(revisioned_file_name(revision, RLINK_EXTENSION));
        if let Err(err) = with_directory(&dir, || fs::replace_hard_link(source, &entry)) {
            if err.kind() != io::ErrorKind::NotFound {
                return Err(err.into());
            }
            // Replaying a program whose staged file was already linked and cleaned up.
            if entry.is_file() && !self.tombstone.matches(&entry)? {
                trace!(%revision, %resource, "content already linked");
                return Ok(());
            }
            return Err(TransactError::fatal(format!(
                "staged content {} for resource {resource} is missing",
                source.display()
            )));
        }
        trace!(%revision, %resource, source = %source.display(), "linked content");
        Ok(())
    }

    /// Deletes the content link (or tombstone) written for `resource` at
    /// exactly `revision`. Returns whether there was one.
    pub fn discard_entry(&self, revision: Revision, resource: ResourceId) -> TransactResult<bool> {
        let dir = self.resource_dir(resource);
        if !dir.is_dir() {
            return Ok(false);
        }
        let entry = dir.join(revisioned_file_name(revision, RLINK_EXTENSION));
        Ok(fs::remove_file_if_exists(&entry)?)
    }

    /// Tombstones `resource` at `revision` and every path of `node` still mapped to it.
    ///
    /// Only `node`'s paths are cascaded: reverse mappings are kept per node,
    /// and a resource is never linked from a node other than the one that
    /// created it.
    pub fn remove_resource(
        &self,
        node: NodeId,
        revision: Revision,
        resource: ResourceId,
    ) -> TransactResult<()> {
        let dir = self.resource_dir(resource);
        let entry = dir.join(revisioned_file_name(revision, RLINK_EXTENSION));
        let tombstone = self.layout.tombstone_path();
        with_directory(&dir, || fs::replace_hard_link(&tombstone, &entry))?;

        let mut cascaded = 0usize;
        for path in self.paths.reverse_paths_at(node, revision, resource)? {
            if self.paths.get_value_at(node, revision, &path)? == Some(resource) {
                self.paths.tombstone_path(node, revision, &path)?;
                cascaded += 1;
            }
        }
        self.paths.tombstone_reverse(node, revision, resource)?;
        trace!(%node, %revision, %resource, cascaded, "removed resource");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rt_path::RtPath;
    use std::io::{Read, Write};
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        resources: ResourceIndex,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().expect("tempdir");
        let layout = Layout::new(tmp.path());
        layout.initialize().expect("initialize");
        let paths = Arc::new(PathIndex::new(layout).expect("paths"));
        Fixture {
            _tmp: tmp,
            resources: ResourceIndex::new(paths),
        }
    }

    fn stage(resources: &ResourceIndex, contents: &[u8]) -> PathBuf {
        let (mut file, path) = resources
            .paths()
            .layout()
            .create_staging_file()
            .expect("stage");
        file.write_all(contents).expect("write");
        path
    }

    fn read(resources: &ResourceIndex, revision: u64, resource: ResourceId) -> Option<String> {
        resources
            .load_resource_contents_at(Revision::new(revision), resource)
            .expect("load")
            .map(|mut file| {
                let mut out = String::new();
                file.read_to_string(&mut out).expect("read");
                out
            })
    }

    #[test]
    fn content_is_versioned() {
        let fx = fixture();
        let rid = ResourceId::random();
        fx.resources.add_resource_id(rid).expect("add");
        let first = stage(&fx.resources, b"one");
        fx.resources
            .link_new_resource(Revision::new(1), &first, rid)
            .expect("link");
        let second = stage(&fx.resources, b"two");
        fx.resources
            .update_resource(Revision::new(3), &second, rid)
            .expect("update");

        assert_eq!(read(&fx.resources, 0, rid), None);
        assert_eq!(read(&fx.resources, 2, rid).as_deref(), Some("one"));
        assert_eq!(read(&fx.resources, 3, rid).as_deref(), Some("two"));
        assert_eq!(fx.resources.revisions(rid).expect("revisions").len(), 2);
    }

    #[test]
    fn relinking_after_cleanup_is_idempotent() {
        let fx = fixture();
        let rid = ResourceId::random();
        let staged = stage(&fx.resources, b"x");
        fx.resources
            .link_new_resource(Revision::new(1), &staged, rid)
            .expect("link");
        stdfs::remove_file(&staged).expect("cleanup");
        fx.resources
            .link_new_resource(Revision::new(1), &staged, rid)
            .expect("replay");

        let missing = fx
            .resources
            .link_new_resource(Revision::new(2), &staged, rid)
            .expect_err("missing");
        assert!(missing.is_fatal());
    }

    #[test]
    fn updating_a_removed_resource_is_fatal() {
        let fx = fixture();
        let node = NodeId::random();
        let rid = ResourceId::random();
        let staged = stage(&fx.resources, b"x");
        fx.resources
            .link_new_resource(Revision::new(1), &staged, rid)
            .expect("link");
        fx.resources
            .remove_resource(node, Revision::new(2), rid)
            .expect("remove");
        assert!(!fx.resources.exists_at(Revision::new(2), rid).expect("exists"));
        assert!(fx.resources.exists_at(Revision::new(1), rid).expect("exists"));

        let again = stage(&fx.resources, b"y");
        let err = fx
            .resources
            .update_resource(Revision::new(3), &again, rid)
            .expect_err("removed");
        assert!(err.is_fatal());
    }

    #[test]
    fn removal_cascades_to_paths_still_mapped() {
        let fx = fixture();
        let node = NodeId::random();
        let rid = ResourceId::random();
        let other = ResourceId::random();
        let paths = fx.resources.paths().clone();
        for id in [rid, other] {
            let staged = stage(&fx.resources, b"x");
            fx.resources
                .link_new_resource(Revision::new(1), &staged, id)
                .expect("link");
        }
        let kept = RtPath::parse("/kept").expect("path");
        let moved = RtPath::parse("/moved").expect("path");
        paths.link(node, Revision::new(1), &kept, rid).expect("link");
        paths.link(node, Revision::new(1), &moved, rid).expect("link");
        paths.unlink(node, Revision::new(2), &moved, rid).expect("unlink");
        paths.link(node, Revision::new(2), &moved, other).expect("relink");

        fx.resources
            .remove_resource(node, Revision::new(3), rid)
            .expect("remove");
        assert_eq!(paths.get_value_at(node, Revision::new(3), &kept).expect("get"), None);
        assert_eq!(paths.get_value_at(node, Revision::new(2), &kept).expect("get"), Some(rid));
        assert_eq!(
            paths.get_value_at(node, Revision::new(3), &moved).expect("get"),
            Some(other)
        );
        assert!(paths
            .reverse_paths_at(node, Revision::new(3), rid)
            .expect("reverse")
            .is_empty());
    }
}

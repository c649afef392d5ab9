//! A transaction in progress: validated against a [`WorkingCopy`], recorded
//! in a [`ProgramBuilder`] and compiled into its journal slot on commit.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, trace, warn};

use crate::checksum::ChecksumAlgorithm;
use crate::error::{TransactError, TransactResult};
use crate::fs::{self, Layout};
use crate::ids::{NodeId, ResourceId};
use crate::index::Listing;
use crate::journal::JournalSlotClaim;
use crate::locking::TransactionLocks;
use crate::program::{Phase, Program, ProgramBuilder};
use crate::revision::Revision;
use crate::rt_path::RtPath;
use crate::table::LockedRevision;
use crate::working_copy::WorkingCopy;

/// Outcome of unlinking one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unlink {
    pub resource: ResourceId,
    /// The resource lost its last path and is removed along with it.
    pub removed: bool,
}

/// Writable content of a resource, staged under `temporary/` until commit.
#[derive(Debug)]
pub struct ResourceWriter {
    file: File,
    path: PathBuf,
}

impl ResourceWriter {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes the content to disk.
    pub fn finish(self) -> io::Result<()> {
        self.file.sync_all()
    }
}

impl Write for ResourceWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

pub struct MutableEntry {
    layout: Layout,
    algorithm: ChecksumAlgorithm,
    base: LockedRevision,
    claim: JournalSlotClaim,
    locks: TransactionLocks,
    working: WorkingCopy,
    builder: ProgramBuilder,
    staged: Vec<PathBuf>,
    committed: Option<Revision>,
}

impl MutableEntry {
    pub(crate) fn new(
        layout: Layout,
        algorithm: ChecksumAlgorithm,
        base: LockedRevision,
        claim: JournalSlotClaim,
        locks: TransactionLocks,
        working: WorkingCopy,
    ) -> Self {
        Self {
            layout,
            algorithm,
            base,
            claim,
            locks,
            working,
            builder: ProgramBuilder::new(),
            staged: Vec::new(),
            committed: None,
        }
    }

    pub fn node(&self) -> NodeId {
        self.working.node()
    }

    /// Revision the entry reads from.
    pub fn base_revision(&self) -> Revision {
        self.base.revision()
    }

    /// Revision the entry was committed as, once committed.
    pub fn revision(&self) -> Option<Revision> {
        self.committed
    }

    pub fn is_committed(&self) -> bool {
        self.committed.is_some()
    }

    /// Journal slot holding the entry's program.
    pub fn slot(&self) -> u32 {
        self.claim.index()
    }

    /// Number of staged commands across both phases.
    pub fn command_count(&self) -> usize {
        self.builder.len()
    }

    fn ensure_open(&self) -> TransactResult<()> {
        match self.committed {
            Some(revision) => Err(TransactError::invalid_state(format!(
                "entry already committed as {revision}"
            ))),
            None => Ok(()),
        }
    }

    fn stage_file(&mut self) -> TransactResult<ResourceWriter> {
        let (file, path) = self.layout.create_staging_file()?;
        self.staged.push(path.clone());
        self.builder.unlink_fs_path(&path);
        Ok(ResourceWriter { file, path })
    }

    /// Mappings visible to this entry, including its own staged changes.
    pub fn list(&mut self, pattern: &RtPath) -> TransactResult<Vec<Listing>> {
        self.working.list(pattern)
    }

    pub fn resource_id(&mut self, path: &RtPath) -> TransactResult<Option<ResourceId>> {
        path.ensure_linkable()?;
        self.working.value_of(path)
    }

    /// Creates `resource` with new content and links it at `path`.
    pub fn save_new_resource(
        &mut self,
        path: &RtPath,
        resource: ResourceId,
    ) -> TransactResult<ResourceWriter> {
        self.ensure_open()?;
        self.check_new_link(path, resource)?;
        let writer = self.stage_file()?;
        self.working.create_resource(resource);
        self.working.link(path, resource)?;
        self.builder.add_resource_id(resource);
        self.builder.link_new_resource(writer.path(), resource);
        self.builder.add_path(path);
        self.builder.link_resource_to_rt_path(resource, path);
        trace!(%path, %resource, "staged new resource");
        Ok(writer)
    }

    /// Replaces the content of an existing resource.
    pub fn update_resource(&mut self, resource: ResourceId) -> TransactResult<ResourceWriter> {
        self.ensure_open()?;
        if !self.working.is_live(resource)? {
            return Err(TransactError::not_found(format!("resource {resource}")));
        }
        self.locks.lock_resource(resource)?;
        let writer = self.stage_file()?;
        self.builder.update_resource(writer.path(), resource);
        trace!(%resource, "staged resource update");
        Ok(writer)
    }

    /// Links a new, content-less `resource` at `path`.
    pub fn link_new_resource(&mut self, path: &RtPath, resource: ResourceId) -> TransactResult<()> {
        self.ensure_open()?;
        self.check_new_link(path, resource)?;
        self.working.create_resource(resource);
        self.working.link(path, resource)?;
        self.builder.add_resource_id(resource);
        self.builder.add_path(path);
        self.builder.link_resource_to_rt_path(resource, path);
        Ok(())
    }

    /// Adds `path` as another name of an existing resource.
    ///
    /// The resource must already be linked in this entry's node; removals
    /// only cascade through the paths of one node.
    pub fn link_existing_resource(&mut self, resource: ResourceId, path: &RtPath) -> TransactResult<()> {
        self.ensure_open()?;
        path.ensure_linkable()?;
        if self.working.value_of(path)?.is_some() {
            return Err(TransactError::duplicate(format!("path {path} is already linked")));
        }
        if !self.working.is_live(resource)? {
            return Err(TransactError::not_found(format!("resource {resource}")));
        }
        if self.working.referrers(resource)?.is_empty() {
            return Err(TransactError::invalid_argument(format!(
                "resource {resource} is not linked in node {}",
                self.working.node()
            )));
        }
        self.locks.lock_path(self.working.node(), path)?;
        self.locks.lock_resource(resource)?;
        self.working.link(path, resource)?;
        self.builder.add_path(path);
        self.builder.link_resource_to_rt_path(resource, path);
        Ok(())
    }

    fn check_new_link(&mut self, path: &RtPath, resource: ResourceId) -> TransactResult<()> {
        path.ensure_linkable()?;
        if self.working.value_of(path)?.is_some() {
            return Err(TransactError::duplicate(format!("path {path} is already linked")));
        }
        if self.working.is_live(resource)? {
            return Err(TransactError::duplicate(format!("resource {resource} already exists")));
        }
        self.locks.lock_path(self.working.node(), path)?;
        self.locks.lock_resource(resource)?;
        Ok(())
    }

    /// Unlinks one concrete path, removing its resource if no path is left.
    pub fn unlink_path(&mut self, path: &RtPath) -> TransactResult<Unlink> {
        self.ensure_open()?;
        path.ensure_linkable()?;
        let resource = self
            .working
            .value_of(path)?
            .ok_or_else(|| TransactError::not_found(format!("path {path}")))?;
        self.locks.lock_path(self.working.node(), path)?;
        self.locks.lock_resource(resource)?;
        self.unlink_locked(path)
    }

    fn unlink_locked(&mut self, path: &RtPath) -> TransactResult<Unlink> {
        let Some((resource, removed)) = self.working.unlink(path)? else {
            return Err(TransactError::not_found(format!("path {path}")));
        };
        self.builder.unlink_rt_path(resource, path);
        if removed {
            self.working.remove_resource(resource)?;
            self.builder.remove_resource(resource);
        }
        trace!(%path, %resource, removed, "staged unlink");
        Ok(Unlink { resource, removed })
    }

    /// Unlinks up to `max` paths matching `pattern`.
    pub fn unlink_multiple(&mut self, pattern: &RtPath, max: usize) -> TransactResult<Vec<Unlink>> {
        self.ensure_open()?;
        let listings: Vec<Listing> = self.working.list(pattern)?.into_iter().take(max).collect();
        for listing in &listings {
            self.locks.lock_path(self.working.node(), &listing.path)?;
            self.locks.lock_resource(listing.resource)?;
        }
        listings
            .iter()
            .map(|listing| self.unlink_locked(&listing.path))
            .collect()
    }

    /// Removes `resource` after unlinking every path mapped to it.
    /// Returns the unlinked paths.
    pub fn remove_resource(&mut self, resource: ResourceId) -> TransactResult<Vec<RtPath>> {
        self.ensure_open()?;
        if !self.working.is_live(resource)? {
            return Err(TransactError::not_found(format!("resource {resource}")));
        }
        self.locks.lock_resource(resource)?;
        let referrers: Vec<RtPath> = self.working.referrers(resource)?.iter().cloned().collect();
        for path in &referrers {
            self.locks.lock_path(self.working.node(), path)?;
        }
        self.remove_locked(resource)
    }

    fn remove_locked(&mut self, resource: ResourceId) -> TransactResult<Vec<RtPath>> {
        let cleared: Vec<RtPath> = self.working.remove_resource(resource)?.into_iter().collect();
        for path in &cleared {
            self.builder.unlink_rt_path(resource, path);
        }
        self.builder.remove_resource(resource);
        trace!(%resource, paths = cleared.len(), "staged resource removal");
        Ok(cleared)
    }

    /// Removes the resources behind up to `max` paths matching `pattern`.
    pub fn remove_resources(&mut self, pattern: &RtPath, max: usize) -> TransactResult<Vec<ResourceId>> {
        self.ensure_open()?;
        let listings: Vec<Listing> = self.working.list(pattern)?.into_iter().take(max).collect();
        for listing in &listings {
            self.locks.lock_path(self.working.node(), &listing.path)?;
            self.locks.lock_resource(listing.resource)?;
        }
        let mut removed = Vec::new();
        for listing in listings {
            if !self.working.is_live(listing.resource)? {
                continue;
            }
            let referrers: Vec<RtPath> = self
                .working
                .referrers(listing.resource)?
                .iter()
                .cloned()
                .collect();
            for path in &referrers {
                self.locks.lock_path(self.working.node(), path)?;
            }
            self.remove_locked(listing.resource)?;
            removed.push(listing.resource);
        }
        Ok(removed)
    }

    /// Compiles the staged commands into the journal slot as `revision`.
    ///
    /// Staged content is synced first; the program only becomes valid once its
    /// checksum is written.
    pub fn commit(&mut self, revision: Revision) -> TransactResult<usize> {
        self.ensure_open()?;
        for staged in &self.staged {
            File::open(staged)?.sync_all()?;
        }
        let length = self
            .builder
            .compile(
                self.working.node(),
                revision,
                &Phase::ALL,
                self.algorithm,
                self.claim.buffer()?,
            )?
            .commit();
        self.claim.flush()?;
        self.committed = Some(revision);
        debug!(
            node = %self.working.node(),
            %revision,
            slot = self.claim.index(),
            commands = self.builder.len(),
            length,
            "committed journal entry"
        );
        Ok(length)
    }

    /// The compiled program, once committed.
    pub fn program(&self) -> TransactResult<Program<'_>> {
        if self.committed.is_none() {
            return Err(TransactError::invalid_state("entry has not been committed"));
        }
        Program::load(self.claim.bytes()?)
    }

    /// Keeps the program in the journal after the entry is dropped.
    pub(crate) fn publish(&self) {
        self.claim.publish();
    }
}

impl Drop for MutableEntry {
    fn drop(&mut self) {
        if self.claim.is_published() {
            return;
        }
        for staged in &self.staged {
            if let Err(err) = fs::remove_file_if_exists(staged) {
                warn!(path = %staged.display(), error = %err, "failed to remove staged file");
            }
        }
    }
}

impl std::fmt::Debug for MutableEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutableEntry")
            .field("node", &self.working.node())
            .field("base", &self.base.revision())
            .field("slot", &self.claim.index())
            .field("txn", &self.locks.id())
            .field("commands", &self.builder.len())
            .field("committed", &self.committed)
            .finish()
    }
}

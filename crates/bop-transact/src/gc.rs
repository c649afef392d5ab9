//! Garbage collection of revisions no reader can observe anymore.
//!
//! A cycle write-locks the collectible table slots (older than the
//! read-committed one and not pinned), replays each slot's program against a
//! [`CollectionHandler`] to learn what it touched, then deletes every entry
//! shadowed by that revision. Individual deletes never abort the cycle; a
//! failure is logged and counted.

use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::error::TransactResult;
use crate::fs::{self, FileIdentity, RSYMLINK_EXTENSION};
use crate::ids::{NodeId, ResourceId};
use crate::index::{PathIndex, ResourceIndex, remove_reverse_entry};
use crate::journal::TransactionJournal;
use crate::locking::{LockKey, LockTable};
use crate::program::{ExecutionContext, ExecutionHandler, Interpreter, Phase, Program};
use crate::revision::Revision;
use crate::rt_path::RtPath;
use crate::table::RevisionTable;

/// Totals of one collection cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionStats {
    /// Table slots released.
    pub revisions: usize,
    /// Journal programs replayed and cleared.
    pub programs: usize,
    /// Revisioned path entries deleted.
    pub path_entries: usize,
    /// Revisioned content links deleted.
    pub content_entries: usize,
    /// Reverse mapping snapshots deleted.
    pub reverse_snapshots: usize,
    /// Staged files deleted.
    pub files: usize,
    /// Empty directories removed.
    pub directories: usize,
    /// Deletes that failed and were skipped.
    pub failures: usize,
}

impl CollectionStats {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// What one program touched, gathered per revision.
#[derive(Debug, Default)]
struct Touched {
    paths: BTreeSet<RtPath>,
    contents: BTreeSet<ResourceId>,
    reverse: BTreeSet<ResourceId>,
    files: Vec<PathBuf>,
}

impl Touched {
    fn clear(&mut self) {
        self.paths.clear();
        self.contents.clear();
        self.reverse.clear();
        self.files.clear();
    }
}

/// Records the keys a collectible program touched instead of applying it.
///
/// COMMIT-phase links keep the entry written at the program's revision and
/// mark older ones for deletion; CLEANUP-phase file unlinks are deletions.
struct CollectionHandler<'a> {
    paths: &'a PathIndex,
    touched: &'a mut Touched,
    stats: &'a mut CollectionStats,
}

impl ExecutionHandler for CollectionHandler<'_> {
    fn unlink_fs_path(&mut self, _ctx: &ExecutionContext, path: &Path) -> TransactResult<()> {
        self.touched.files.push(path.to_path_buf());
        Ok(())
    }

    fn unlink_rt_path(
        &mut self,
        _ctx: &ExecutionContext,
        resource: ResourceId,
        path: &RtPath,
    ) -> TransactResult<()> {
        self.touched.paths.insert(path.clone());
        self.touched.reverse.insert(resource);
        Ok(())
    }

    fn remove_resource(&mut self, ctx: &ExecutionContext, resource: ResourceId) -> TransactResult<()> {
        // Paths tombstoned by the cascade are the ones mapped just before the removal.
        let before = Revision::new(ctx.revision.as_u64().saturating_sub(1));
        let paths = self.paths;
        if let Some(cascaded) = no_throw(&mut *self.stats, "list cascaded paths", || {
            paths.reverse_paths_at(ctx.node, before, resource)
        }) {
            self.touched.paths.extend(cascaded);
        }
        self.touched.contents.insert(resource);
        self.touched.reverse.insert(resource);
        Ok(())
    }

    fn update_resource(
        &mut self,
        _ctx: &ExecutionContext,
        _source: &Path,
        resource: ResourceId,
    ) -> TransactResult<()> {
        self.touched.contents.insert(resource);
        Ok(())
    }

    fn add_path(&mut self, _ctx: &ExecutionContext, path: &RtPath) -> TransactResult<()> {
        self.touched.paths.insert(path.clone());
        Ok(())
    }

    fn link_new_resource(
        &mut self,
        _ctx: &ExecutionContext,
        _source: &Path,
        resource: ResourceId,
    ) -> TransactResult<()> {
        self.touched.contents.insert(resource);
        Ok(())
    }

    fn link_resource_to_rt_path(
        &mut self,
        _ctx: &ExecutionContext,
        resource: ResourceId,
        path: &RtPath,
    ) -> TransactResult<()> {
        self.touched.paths.insert(path.clone());
        self.touched.reverse.insert(resource);
        Ok(())
    }
}

/// Clears the collector's scratch state on scope exit, early or not.
struct ScratchGuard<'a>(&'a mut Touched);

impl Drop for ScratchGuard<'_> {
    fn drop(&mut self) {
        self.0.clear();
    }
}

pub struct GarbageCollector {
    table: Arc<RevisionTable>,
    journal: Arc<TransactionJournal>,
    paths: Arc<PathIndex>,
    resources: Arc<ResourceIndex>,
    locks: Arc<LockTable>,
    tombstone: FileIdentity,
    scratch: Mutex<Touched>,
}

impl GarbageCollector {
    pub fn new(
        table: Arc<RevisionTable>,
        journal: Arc<TransactionJournal>,
        resources: Arc<ResourceIndex>,
        locks: Arc<LockTable>,
    ) -> Self {
        let paths = resources.paths().clone();
        let tombstone = *paths.tombstone();
        Self {
            table,
            journal,
            paths,
            resources,
            locks,
            tombstone,
            scratch: Mutex::new(Touched::default()),
        }
    }

    /// Runs one collection cycle. Cycles never overlap.
    pub fn collect(&self) -> TransactResult<CollectionStats> {
        let mut scratch = self.scratch.lock();
        scratch.clear();
        let mut stats = CollectionStats::default();

        let guards = self.table.write_lock_collectible_revisions()?;
        for guard in &guards {
            let cycle = ScratchGuard(&mut *scratch);
            if let Some(entry) = guard.entry()? {
                self.collect_revision(entry.revision, &mut *cycle.0, &mut stats);
            }
            guard.clear()?;
            stats.revisions += 1;
        }
        drop(guards);

        self.journal.reclaim()?;
        self.table.reclaim_invalid_entries()?;
        if !stats.is_empty() {
            debug!(?stats, "collection cycle finished");
        }
        Ok(stats)
    }

    /// Deletes what `revision` shadowed and clears its program.
    ///
    /// The program's slot is cleared even when loading or interpreting it
    /// fails: the table slot is released either way, and a valid program no
    /// table entry refers to would stop the journal from reclaiming.
    fn collect_revision(&self, revision: Revision, touched: &mut Touched, stats: &mut CollectionStats) {
        let found = no_throw(stats, "find program", || {
            self.journal.find_valid_program_for_revision(revision)
        });
        let Some(slot) = found.flatten() else {
            trace!(%revision, "no program for collectible revision");
            return;
        };

        if let Some(program) = no_throw(stats, "load program", || Program::load(slot.bytes()?)) {
            let node = program.node();
            let mut handler = CollectionHandler {
                paths: self.paths.as_ref(),
                touched: &mut *touched,
                stats: &mut *stats,
            };
            let interpreted = Interpreter::run(&program, Phase::Cleanup, &mut handler)
                .and_then(|_| Interpreter::run(&program, Phase::Commit, &mut handler));
            no_throw(stats, "interpret program", || interpreted);
            self.delete_touched(node, revision, touched, stats);
        }

        if no_throw(stats, "clear program slot", || self.journal.clear_slot(slot.index())) == Some(true) {
            stats.programs += 1;
        }
        trace!(%revision, "collected revision");
    }

    fn delete_touched(&self, node: NodeId, revision: Revision, touched: &mut Touched, stats: &mut CollectionStats) {
        for file in touched.files.drain(..) {
            if let Some(true) = no_throw(stats, "remove staged file", || {
                Ok(fs::remove_file_if_exists(&file)?)
            }) {
                stats.files += 1;
            }
        }

        let mut paths: Vec<&RtPath> = touched.paths.iter().collect();
        paths.sort_by_key(|path| (Reverse(path.component_count()), *path));
        for path in paths {
            self.collect_path(node, revision, path, stats);
        }
        for resource in &touched.reverse {
            self.collect_reverse(node, revision, *resource, stats);
        }
        for resource in &touched.contents {
            self.collect_content(revision, *resource, stats);
        }
    }

    /// Deletes the entries of `path` shadowed at `revision`; a tombstone at
    /// `revision` goes too, along with directories left empty.
    fn collect_path(&self, node: NodeId, revision: Revision, path: &RtPath, stats: &mut CollectionStats) {
        let Some(entries) = no_throw(stats, "list path entries", || self.paths.revisions(node, path)) else {
            return;
        };
        let tombstoned = self.tombstoned_at(&entries, revision);
        for (found, file) in &entries {
            if *found < revision || (tombstoned && *found == revision) {
                if let Some(true) = no_throw(stats, "remove path entry", || {
                    Ok(fs::remove_file_if_exists(file)?)
                }) {
                    stats.path_entries += 1;
                }
            }
        }

        let mut current = Some(path.clone());
        while let Some(path) = current.take().filter(|path| !path.is_root()) {
            let Some(_claim) = self.locks.try_lock(LockKey::Path(node, path.clone())) else {
                trace!(%path, "path claimed by a writer, keeping its directory");
                break;
            };
            let dir = self.paths.path_dir(node, &path);
            match no_throw(stats, "remove path directory", || Ok(fs::remove_dir_if_empty(&dir)?)) {
                Some(true) => stats.directories += 1,
                _ => break,
            }
            current = path.parent();
        }
    }

    fn collect_reverse(&self, node: NodeId, revision: Revision, resource: ResourceId, stats: &mut CollectionStats) {
        let dir = self.paths.reverse_dir(node, resource);
        let Some(entries) = no_throw(stats, "list reverse snapshots", || {
            fs::list_revisions(&dir, RSYMLINK_EXTENSION)
        }) else {
            return;
        };
        let tombstoned = self.tombstoned_at(&entries, revision);
        for (found, link) in &entries {
            if *found > revision || (*found == revision && !tombstoned) {
                continue;
            }
            let removed = no_throw(stats, "remove reverse snapshot", || {
                Ok(remove_reverse_entry(&dir, link)?)
            });
            if removed == Some(true) {
                stats.reverse_snapshots += 1;
            }
        }
        if let Some(_claim) = self.locks.try_lock(LockKey::Resource(resource)) {
            if no_throw(stats, "remove reverse directory", || Ok(fs::remove_dir_if_empty(&dir)?)) == Some(true) {
                stats.directories += 1;
            }
        }
    }

    fn collect_content(&self, revision: Revision, resource: ResourceId, stats: &mut CollectionStats) {
        let Some(entries) = no_throw(stats, "list content links", || self.resources.revisions(resource)) else {
            return;
        };
        let tombstoned = self.tombstoned_at(&entries, revision);
        for (found, file) in &entries {
            if *found < revision || (tombstoned && *found == revision) {
                if let Some(true) = no_throw(stats, "remove content link", || {
                    Ok(fs::remove_file_if_exists(file)?)
                }) {
                    stats.content_entries += 1;
                }
            }
        }
        if !tombstoned {
            return;
        }
        if let Some(_claim) = self.locks.try_lock(LockKey::Resource(resource)) {
            let dir = self.resources.resource_dir(resource);
            if no_throw(stats, "remove resource directory", || {
                Ok(fs::remove_dir_if_empty(&dir)?)
            }) == Some(true)
            {
                stats.directories += 1;
            }
        }
    }

    fn tombstoned_at(&self, entries: &[(Revision, PathBuf)], revision: Revision) -> bool {
        entries
            .iter()
            .find(|(found, _)| *found == revision)
            .is_some_and(|(_, file)| self.tombstone.matches(file).unwrap_or(false))
    }
}

impl std::fmt::Debug for GarbageCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GarbageCollector")
            .field("table", &self.table)
            .field("journal", &self.journal)
            .finish()
    }
}

/// Runs `op`, logging and counting a failure instead of propagating it.
fn no_throw<T, F>(stats: &mut CollectionStats, what: &str, op: F) -> Option<T>
where
    F: FnOnce() -> TransactResult<T>,
{
    match op() {
        Ok(value) => Some(value),
        Err(err) => {
            stats.failures += 1;
            error!(error = %err, operation = what, "collection step failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ChecksumAlgorithm;
    use crate::fs::Layout;
    use crate::program::ProgramBuilder;
    use crate::table::EntryState;
    use crate::pool::RevisionPool;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        pool: RevisionPool,
        table: Arc<RevisionTable>,
        journal: Arc<TransactionJournal>,
        resources: Arc<ResourceIndex>,
        collector: GarbageCollector,
        node: NodeId,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().expect("tempdir");
        let layout = Layout::new(tmp.path());
        layout.initialize().expect("initialize");
        let pool = RevisionPool::open(&layout.rpool_path(), 1_000).expect("pool");
        let table = RevisionTable::open(&layout.head_path(), 16, ChecksumAlgorithm::default(), &pool)
            .expect("table");
        let journal = TransactionJournal::open(&layout.journal_path(), 1024, 16).expect("journal");
        let paths = Arc::new(PathIndex::new(layout).expect("paths"));
        let resources = Arc::new(ResourceIndex::new(paths));
        let collector = GarbageCollector::new(table.clone(), journal.clone(), resources.clone(), LockTable::new());
        Fixture {
            _tmp: tmp,
            pool,
            table,
            journal,
            resources,
            collector,
            node: NodeId::random(),
        }
    }

    /// Applies `builder` directly to the indices and records it as committed.
    fn commit(fx: &Fixture, builder: &ProgramBuilder, apply: impl FnOnce(Revision)) -> Revision {
        let revision = fx.pool.next_revision().expect("revision");
        let guard = fx.table.write_lock_next_leading().expect("slot");
        guard.write(revision, EntryState::Writing).expect("writing");
        let claim = fx.journal.claim_next().expect("claim");
        builder
            .compile(fx.node, revision, &Phase::ALL, ChecksumAlgorithm::default(), claim.buffer().expect("buffer"))
            .expect("compile")
            .commit();
        apply(revision);
        claim.publish();
        guard.write(revision, EntryState::Committed).expect("committed");
        fx.table.update_read_committed(guard.index()).expect("advance");
        revision
    }

    #[test]
    fn shadowed_entries_are_deleted_and_cycles_are_idempotent() {
        let fx = fixture();
        let paths = fx.resources.paths().clone();
        let rid = ResourceId::random();
        let path = RtPath::parse("/docs/readme").expect("path");

        let mut link = ProgramBuilder::new();
        link.add_resource_id(rid);
        link.add_path(&path);
        link.link_resource_to_rt_path(rid, &path);
        let first = commit(&fx, &link, |revision| {
            fx.resources.add_resource_id(rid).expect("add");
            paths.link(fx.node, revision, &path, rid).expect("link");
        });

        let mut unlink = ProgramBuilder::new();
        unlink.unlink_rt_path(rid, &path);
        let second = commit(&fx, &unlink, |revision| {
            paths.unlink(fx.node, revision, &path, rid).expect("unlink");
        });
        commit(&fx, &ProgramBuilder::new(), |_| {});

        let stats = fx.collector.collect().expect("collect");
        assert_eq!(stats.failures, 0);
        assert_eq!(stats.programs, 2);
        assert!(paths.revisions(fx.node, &path).expect("revisions").is_empty());
        assert!(!paths.path_dir(fx.node, &path).exists());
        assert!(!paths.node_dir(fx.node).join("docs.d").exists());
        assert!(first < second);

        let again = fx.collector.collect().expect("collect");
        assert_eq!(again.path_entries + again.directories + again.programs, 0);
    }

    #[test]
    fn unreadable_reverse_snapshots_do_not_strand_programs() {
        let fx = fixture();
        let paths = fx.resources.paths().clone();
        let rid = ResourceId::random();
        let path = RtPath::parse("/victim").expect("path");

        let mut link = ProgramBuilder::new();
        link.add_resource_id(rid);
        link.add_path(&path);
        link.link_resource_to_rt_path(rid, &path);
        commit(&fx, &link, |revision| {
            fx.resources.add_resource_id(rid).expect("add");
            paths.link(fx.node, revision, &path, rid).expect("link");
        });

        let mut remove = ProgramBuilder::new();
        remove.remove_resource(rid);
        let removed = commit(&fx, &remove, |revision| {
            fx.resources.remove_resource(fx.node, revision, rid).expect("remove");
        });

        // A regular file inside a snapshot is not a reverse entry and fails the lookup.
        for entry in std::fs::read_dir(paths.reverse_dir(fx.node, rid)).expect("reverse") {
            let entry = entry.expect("entry");
            if entry.file_type().expect("file type").is_dir() {
                std::fs::write(entry.path().join("stray"), b"").expect("stray");
            }
        }
        commit(&fx, &ProgramBuilder::new(), |_| {});

        let stats = fx.collector.collect().expect("collect");
        assert!(stats.failures >= 1);
        // The initial revision has a table slot but no program.
        assert_eq!(stats.revisions, 3);
        assert_eq!(stats.programs, 2);
        let left: Vec<Revision> = fx
            .journal
            .programs()
            .expect("programs")
            .into_iter()
            .map(|(_, revision)| revision)
            .collect();
        assert!(!left.contains(&removed));
        assert_eq!(left.len(), 1);
        assert_eq!(fx.journal.live().expect("live"), 1);
        assert!(!paths.reverse_dir(fx.node, rid).exists());
    }

    #[test]
    fn pinned_revisions_are_kept() {
        let fx = fixture();
        let pinned = fx.table.lock_latest_read_uncommitted().expect("pin");
        commit(&fx, &ProgramBuilder::new(), |_| {});
        commit(&fx, &ProgramBuilder::new(), |_| {});

        let stats = fx.collector.collect().expect("collect");
        assert_eq!(stats.revisions, 0);
        drop(pinned);
        let stats = fx.collector.collect().expect("collect");
        assert_eq!(stats.revisions, 2);
    }
}

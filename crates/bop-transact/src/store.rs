//! The store facade: owns the metadata files and the link trees, hands out
//! mutable journal entries and read pins, applies committed programs and runs
//! the collector.

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, trace, warn};

use crate::config::StoreConfig;
use crate::entry::MutableEntry;
use crate::error::{TransactError, TransactResult};
use crate::fs::{self, Layout, StoreLock};
use crate::gc::{CollectionStats, GarbageCollector};
use crate::ids::{NodeId, ResourceId};
use crate::index::{Listing, PathIndex, ResourceIndex};
use crate::journal::TransactionJournal;
use crate::locking::LockTable;
use crate::pool::RevisionPool;
use crate::program::{ExecutionContext, ExecutionHandler, Interpreter, Phase, Program};
use crate::revision::Revision;
use crate::rt_path::RtPath;
use crate::table::{EntryState, LockedRevision, RevisionTable, SlotWriteGuard};
use crate::working_copy::WorkingCopy;

/// Applies a program's commands to the indices at the program's revision.
///
/// Every operation tolerates being replayed after a crash.
struct ApplyHandler<'a> {
    paths: &'a PathIndex,
    resources: &'a ResourceIndex,
    applied: usize,
}

impl<'a> ApplyHandler<'a> {
    fn new(paths: &'a PathIndex, resources: &'a ResourceIndex) -> Self {
        Self {
            paths,
            resources,
            applied: 0,
        }
    }
}

impl ExecutionHandler for ApplyHandler<'_> {
    fn unlink_fs_path(&mut self, ctx: &ExecutionContext, path: &Path) -> TransactResult<()> {
        if fs::remove_file_if_exists(path)? {
            trace!(revision = %ctx.revision, path = %path.display(), "removed staged file");
        }
        self.applied += 1;
        Ok(())
    }

    fn unlink_rt_path(
        &mut self,
        ctx: &ExecutionContext,
        resource: ResourceId,
        path: &RtPath,
    ) -> TransactResult<()> {
        self.paths.unlink(ctx.node, ctx.revision, path, resource)?;
        self.applied += 1;
        Ok(())
    }

    fn remove_resource(&mut self, ctx: &ExecutionContext, resource: ResourceId) -> TransactResult<()> {
        self.resources.remove_resource(ctx.node, ctx.revision, resource)?;
        self.applied += 1;
        Ok(())
    }

    fn update_resource(
        &mut self,
        ctx: &ExecutionContext,
        source: &Path,
        resource: ResourceId,
    ) -> TransactResult<()> {
        self.resources.update_resource(ctx.revision, source, resource)?;
        self.applied += 1;
        Ok(())
    }

    fn add_path(&mut self, ctx: &ExecutionContext, path: &RtPath) -> TransactResult<()> {
        self.paths.add_path(ctx.node, path)?;
        self.applied += 1;
        Ok(())
    }

    fn add_resource_id(&mut self, _ctx: &ExecutionContext, resource: ResourceId) -> TransactResult<()> {
        self.resources.add_resource_id(resource)?;
        self.applied += 1;
        Ok(())
    }

    fn link_new_resource(
        &mut self,
        ctx: &ExecutionContext,
        source: &Path,
        resource: ResourceId,
    ) -> TransactResult<()> {
        self.resources.link_new_resource(ctx.revision, source, resource)?;
        self.applied += 1;
        Ok(())
    }

    fn link_resource_to_rt_path(
        &mut self,
        ctx: &ExecutionContext,
        resource: ResourceId,
        path: &RtPath,
    ) -> TransactResult<()> {
        self.paths.link(ctx.node, ctx.revision, path, resource)?;
        self.applied += 1;
        Ok(())
    }
}

/// Undoes the COMMIT phase of a program that failed to apply.
///
/// Everything a program writes is named by its revision, so undoing it
/// deletes the entries named by that revision and nothing else.
struct RollbackHandler<'a> {
    paths: &'a PathIndex,
    resources: &'a ResourceIndex,
    created: Vec<ResourceId>,
    discarded: usize,
}

impl<'a> RollbackHandler<'a> {
    fn new(paths: &'a PathIndex, resources: &'a ResourceIndex) -> Self {
        Self {
            paths,
            resources,
            created: Vec::new(),
            discarded: 0,
        }
    }

    fn count(&mut self, removed: bool) {
        if removed {
            self.discarded += 1;
        }
    }

    fn discard_link(&mut self, ctx: &ExecutionContext, resource: ResourceId, path: &RtPath) -> TransactResult<()> {
        let removed = self.paths.discard_entry(ctx.node, ctx.revision, path)?;
        self.count(removed);
        let removed = self.paths.discard_reverse(ctx.node, ctx.revision, resource)?;
        self.count(removed);
        Ok(())
    }

    /// Removes the directories of resources the program created, once empty.
    fn finish(&mut self) -> TransactResult<usize> {
        for resource in self.created.drain(..) {
            if fs::remove_dir_if_empty(&self.resources.resource_dir(resource))? {
                self.discarded += 1;
            }
        }
        Ok(self.discarded)
    }
}

impl ExecutionHandler for RollbackHandler<'_> {
    fn unlink_rt_path(
        &mut self,
        ctx: &ExecutionContext,
        resource: ResourceId,
        path: &RtPath,
    ) -> TransactResult<()> {
        self.discard_link(ctx, resource, path)
    }

    fn remove_resource(&mut self, ctx: &ExecutionContext, resource: ResourceId) -> TransactResult<()> {
        let before = Revision::new(ctx.revision.as_u64().saturating_sub(1));
        for path in self.paths.reverse_paths_at(ctx.node, before, resource)? {
            let removed = self.paths.discard_entry(ctx.node, ctx.revision, &path)?;
            self.count(removed);
        }
        let removed = self.paths.discard_reverse(ctx.node, ctx.revision, resource)?;
        self.count(removed);
        let removed = self.resources.discard_entry(ctx.revision, resource)?;
        self.count(removed);
        Ok(())
    }

    fn update_resource(
        &mut self,
        ctx: &ExecutionContext,
        _source: &Path,
        resource: ResourceId,
    ) -> TransactResult<()> {
        let removed = self.resources.discard_entry(ctx.revision, resource)?;
        self.count(removed);
        Ok(())
    }

    fn add_resource_id(&mut self, _ctx: &ExecutionContext, resource: ResourceId) -> TransactResult<()> {
        self.created.push(resource);
        Ok(())
    }

    fn link_new_resource(
        &mut self,
        ctx: &ExecutionContext,
        _source: &Path,
        resource: ResourceId,
    ) -> TransactResult<()> {
        let removed = self.resources.discard_entry(ctx.revision, resource)?;
        self.count(removed);
        Ok(())
    }

    fn link_resource_to_rt_path(
        &mut self,
        ctx: &ExecutionContext,
        resource: ResourceId,
        path: &RtPath,
    ) -> TransactResult<()> {
        self.discard_link(ctx, resource, path)
    }
}

/// Wakes the background collector and counts hints nobody consumed yet.
#[derive(Debug, Default)]
struct CollectorSignal {
    state: Mutex<SignalState>,
    wake: Condvar,
}

#[derive(Debug, Default)]
struct SignalState {
    pending: u64,
    shutdown: bool,
}

impl CollectorSignal {
    fn hint(&self) {
        let mut state = self.state.lock();
        state.pending += 1;
        self.wake.notify_one();
    }

    fn pending(&self) -> u64 {
        self.state.lock().pending
    }

    fn take(&self) -> u64 {
        std::mem::take(&mut self.state.lock().pending)
    }

    /// Returns false if shutdown was already requested.
    fn request_shutdown(&self) -> bool {
        let mut state = self.state.lock();
        if state.shutdown {
            return false;
        }
        state.shutdown = true;
        self.wake.notify_all();
        true
    }
}

fn spawn_collector(
    collector: Arc<GarbageCollector>,
    signal: Arc<CollectorSignal>,
    interval: Duration,
) -> TransactResult<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("bop-transact-gc".into())
        .spawn(move || {
            debug!("collector thread started");
            collector_main(&collector, &signal, interval);
            debug!("collector thread exiting");
        })?;
    Ok(handle)
}

fn collector_main(collector: &GarbageCollector, signal: &CollectorSignal, interval: Duration) {
    loop {
        {
            let mut state = signal.state.lock();
            if state.pending == 0 && !state.shutdown {
                signal.wake.wait_for(&mut state, interval);
            }
            if state.shutdown {
                return;
            }
            state.pending = 0;
        }
        match collector.collect() {
            Ok(stats) if !stats.is_empty() => trace!(?stats, "background collection"),
            Ok(_) => {}
            Err(err) => error!(error = %err, "background collection failed"),
        }
    }
}

/// Totals of the recovery pass run at open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Programs replayed and marked committed.
    pub replayed: usize,
    /// Journal slots cleared because no table entry referenced them.
    pub orphaned_programs: usize,
    /// Table entries cleared because their program never reached the journal.
    pub orphaned_entries: usize,
    /// Leftover staging files removed.
    pub purged: usize,
}

/// A transactional, revisioned resource store rooted at one directory.
///
/// Writers stage changes in a [`MutableEntry`] and commit it with
/// [`Store::commit_entry`]; readers pin a revision with
/// [`Store::lock_latest_read_uncommitted`] and read at it.
pub struct Store {
    config: StoreConfig,
    layout: Layout,
    pool: RevisionPool,
    table: Arc<RevisionTable>,
    journal: Arc<TransactionJournal>,
    paths: Arc<PathIndex>,
    resources: Arc<ResourceIndex>,
    locks: Arc<LockTable>,
    collector: Arc<GarbageCollector>,
    signal: Arc<CollectorSignal>,
    revision_lock: Mutex<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
    recovered: RecoveryStats,
    _lock: StoreLock,
}

impl Store {
    /// Opens or creates the store described by `config`, recovering any
    /// revision a previous process left half-applied.
    pub fn open(config: StoreConfig) -> TransactResult<Self> {
        let config = config.normalized();
        config.validate()?;
        info!(%config, "opening store");

        let layout = Layout::new(&config.root_dir);
        layout.initialize()?;
        let lock = StoreLock::acquire(&layout)?;

        let pool = RevisionPool::open(&layout.rpool_path(), config.revision_pool_capacity)?;
        let table = RevisionTable::open(
            &layout.head_path(),
            config.revision_table_count,
            config.checksum,
            &pool,
        )?;
        let journal = TransactionJournal::open(
            &layout.journal_path(),
            config.txn_buffer_size,
            config.txn_buffer_count,
        )?;
        let paths = Arc::new(PathIndex::new(layout.clone())?);
        let resources = Arc::new(ResourceIndex::new(paths.clone()));
        let locks = LockTable::new();
        let collector = Arc::new(GarbageCollector::new(
            table.clone(),
            journal.clone(),
            resources.clone(),
            locks.clone(),
        ));

        let mut store = Self {
            config,
            layout,
            pool,
            table,
            journal,
            paths,
            resources,
            locks,
            collector,
            signal: Arc::new(CollectorSignal::default()),
            revision_lock: Mutex::new(()),
            worker: Mutex::new(None),
            recovered: RecoveryStats::default(),
            _lock: lock,
        };
        store.recovered = store.recover()?;

        if store.config.gc.collect_on_release {
            let signal = store.signal.clone();
            store.table.set_release_hook(move |revision| {
                trace!(%revision, "last reader released revision");
                signal.hint();
            });
        }
        if store.config.gc.background {
            let handle = spawn_collector(
                store.collector.clone(),
                store.signal.clone(),
                Duration::from_millis(store.config.gc.interval_ms),
            )?;
            *store.worker.lock() = Some(handle);
        }

        info!(
            root = %store.layout.root_dir().display(),
            read_committed = %store.table.read_committed()?,
            "store opened"
        );
        Ok(store)
    }

    /// Replays programs whose revision was left WRITING, then drops journal
    /// slots and table entries that have no counterpart.
    fn recover(&self) -> TransactResult<RecoveryStats> {
        let mut stats = RecoveryStats::default();
        let entries: HashMap<Revision, (u32, EntryState)> = self
            .table
            .entries()?
            .into_iter()
            .filter_map(|(_, entry)| entry)
            .map(|entry| (entry.revision, (entry.index, entry.state)))
            .collect();

        let mut programs = self.journal.programs()?;
        programs.sort_by_key(|(_, revision)| *revision);
        let mut with_program = BTreeSet::new();
        for (slot, revision) in programs {
            match entries.get(&revision) {
                Some((index, EntryState::Writing)) => {
                    let guard = self.table.write_lock_slot(*index)?;
                    let program = Program::load(slot.bytes()?)?;
                    let mut handler = ApplyHandler::new(&self.paths, &self.resources);
                    Interpreter::run_all(&program, &mut handler)?;
                    guard.write(revision, EntryState::Committed)?;
                    self.table.update_read_committed(*index)?;
                    info!(%revision, commands = handler.applied, "replayed unfinished revision");
                    stats.replayed += 1;
                    with_program.insert(revision);
                }
                Some((_, EntryState::Committed)) => {
                    with_program.insert(revision);
                }
                None => {
                    if self.journal.clear_slot(slot.index())? {
                        warn!(%revision, slot = slot.index(), "cleared program without revision entry");
                        stats.orphaned_programs += 1;
                    }
                }
            }
        }

        for (revision, (index, state)) in &entries {
            if *state == EntryState::Writing && !with_program.contains(revision) {
                let guard = self.table.write_lock_slot(*index)?;
                guard.clear()?;
                warn!(%revision, slot = index, "cleared revision entry without program");
                stats.orphaned_entries += 1;
            }
        }

        stats.purged = self.layout.purge_temporary()?;
        self.journal.reclaim()?;
        self.table.reclaim_invalid_entries()?;
        self.journal.flush()?;
        self.table.flush()?;
        if stats != RecoveryStats::default() {
            info!(?stats, "recovery finished");
        }
        Ok(stats)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// What the recovery pass at open did.
    pub fn recovery_stats(&self) -> RecoveryStats {
        self.recovered
    }

    /// Highest revision handed out so far, committed or not.
    pub fn current_revision(&self) -> Revision {
        self.pool.current()
    }

    /// Revision currently exposed to read-committed readers.
    pub fn read_committed(&self) -> TransactResult<Revision> {
        self.table.read_committed()
    }

    /// Number of pessimistic locks held by in-flight transactions.
    pub fn held_locks(&self) -> usize {
        self.locks.len()
    }

    /// Pins the newest committed revision.
    pub fn lock_latest_read_uncommitted(&self) -> TransactResult<LockedRevision> {
        self.table.lock_latest_read_uncommitted()
    }

    /// Pins the revision the read-committed pointer exposes.
    pub fn read_lock_latest_read_committed(&self) -> TransactResult<LockedRevision> {
        self.table.read_lock_latest_read_committed()
    }

    /// Starts a transaction on `node`, reading from the newest committed revision.
    pub fn new_mutable_entry(&self, node: NodeId) -> TransactResult<MutableEntry> {
        let claim = match self.journal.claim_next() {
            Err(TransactError::CapacityExhausted(reason)) => {
                debug!(%reason, "journal full, collecting before retry");
                self.collect()?;
                self.journal.claim_next()?
            }
            other => other?,
        };
        let base = self.table.lock_latest_read_uncommitted()?;
        let working = WorkingCopy::new(
            node,
            base.revision(),
            self.paths.clone(),
            self.resources.clone(),
        );
        trace!(%node, base = %base.revision(), slot = claim.index(), "opened mutable entry");
        Ok(MutableEntry::new(
            self.layout.clone(),
            self.config.checksum,
            base,
            claim,
            self.locks.begin(),
            working,
        ))
    }

    /// Allocates the next revision and records it as WRITING.
    ///
    /// Revision updates are serialized; the change holds the store's revision
    /// lock until it is updated, failed or dropped.
    pub fn begin_revision_update(&self) -> TransactResult<PendingRevisionChange<'_>> {
        let serial = self.revision_lock.lock();
        let guard = match self.table.write_lock_next_leading() {
            Err(TransactError::CapacityExhausted(reason)) => {
                debug!(%reason, "revision table full, collecting before retry");
                self.collect()?;
                self.table.write_lock_next_leading()?
            }
            other => other?,
        };
        let revision = match self.pool.next_revision() {
            Ok(revision) => revision,
            Err(err) => {
                guard.clear()?;
                return Err(err);
            }
        };
        guard.write(revision, EntryState::Writing)?;
        trace!(%revision, slot = guard.index(), "began revision update");
        Ok(PendingRevisionChange {
            store: self,
            _serial: serial,
            guard: Some(guard),
            revision,
            applied: false,
        })
    }

    /// Commits `entry` as a new revision and makes it visible to readers.
    ///
    /// If applying the program fails midway its partial effects are rolled
    /// back and the revision is discarded along with the entry. Only if the
    /// rollback fails too does the revision stay WRITING, to be replayed the
    /// next time the store opens.
    pub fn commit_entry(&self, mut entry: MutableEntry) -> TransactResult<Revision> {
        let mut change = self.begin_revision_update()?;
        let revision = change.revision();
        if let Err(err) = entry.commit(revision) {
            change.fail()?;
            return Err(err);
        }
        if let Err(err) = change.apply(&entry) {
            match change.rollback(&entry) {
                Ok(discarded) => {
                    warn!(%revision, error = %err, discarded, "applying revision failed; rolled back");
                }
                Err(rollback) => {
                    error!(
                        %revision,
                        error = %err,
                        rollback = %rollback,
                        "applying revision failed; it will be replayed on open"
                    );
                    entry.publish();
                }
            }
            change.fail()?;
            return Err(err);
        }
        entry.publish();
        if let Err(err) = change.cleanup(&entry) {
            warn!(%revision, error = %err, "cleanup failed; the collector removes leftovers");
        }
        change.update()?;
        debug!(%revision, node = %entry.node(), commands = entry.command_count(), "committed revision");
        Ok(revision)
    }

    /// Resource mapped at `path` of `node` as of `revision`.
    pub fn resource_id_at(
        &self,
        node: NodeId,
        revision: Revision,
        path: &RtPath,
    ) -> TransactResult<Option<ResourceId>> {
        path.ensure_linkable()?;
        self.paths.get_value_at(node, revision, path)
    }

    /// Opens the content `resource` had at `revision`.
    pub fn load_resource(&self, revision: Revision, resource: ResourceId) -> TransactResult<Option<File>> {
        self.resources.load_resource_contents_at(revision, resource)
    }

    /// Resolves `path` and opens its content as of `revision`.
    pub fn load_path(
        &self,
        node: NodeId,
        revision: Revision,
        path: &RtPath,
    ) -> TransactResult<Option<(ResourceId, File)>> {
        let Some(resource) = self.resource_id_at(node, revision, path)? else {
            return Ok(None);
        };
        Ok(self
            .load_resource(revision, resource)?
            .map(|file| (resource, file)))
    }

    /// Mappings of `node` matching `pattern` as of `revision`, sorted by path.
    pub fn list(&self, node: NodeId, revision: Revision, pattern: &RtPath) -> TransactResult<Vec<Listing>> {
        self.paths.list(node, revision, pattern)
    }

    /// Paths of `node` mapped to `resource` as of `revision`.
    pub fn reverse_paths(
        &self,
        node: NodeId,
        revision: Revision,
        resource: ResourceId,
    ) -> TransactResult<BTreeSet<RtPath>> {
        let mut mapped = BTreeSet::new();
        for path in self.paths.reverse_paths_at(node, revision, resource)? {
            if self.paths.get_value_at(node, revision, &path)? == Some(resource) {
                mapped.insert(path);
            }
        }
        Ok(mapped)
    }

    /// Runs one collection cycle on the calling thread and consumes pending hints.
    pub fn collect(&self) -> TransactResult<CollectionStats> {
        self.signal.take();
        self.collector.collect()
    }

    /// Asks the collector to run soon.
    pub fn hint(&self) {
        self.signal.hint();
    }

    /// Hints recorded since the last cycle.
    pub fn pending_hints(&self) -> u64 {
        self.signal.pending()
    }

    /// Stops the background collector and flushes the metadata files.
    pub fn stop(&self) -> TransactResult<()> {
        if self.signal.request_shutdown() {
            if let Some(handle) = self.worker.lock().take() {
                if handle.join().is_err() {
                    warn!("collector thread panicked");
                }
            }
            self.journal.flush()?;
            self.table.flush()?;
            info!(root = %self.layout.root_dir().display(), "store stopped");
        }
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(error = %err, "failed to stop store cleanly");
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("root", &self.layout.root_dir())
            .field("table", &self.table)
            .field("journal", &self.journal)
            .field("locks", &self.locks.len())
            .finish()
    }
}

/// A revision between allocation and publication.
///
/// Dropping the change without [`update`](Self::update) fails it.
pub struct PendingRevisionChange<'a> {
    store: &'a Store,
    _serial: MutexGuard<'a, ()>,
    guard: Option<SlotWriteGuard>,
    revision: Revision,
    applied: bool,
}

impl PendingRevisionChange<'_> {
    pub fn revision(&self) -> Revision {
        self.revision
    }

    fn program<'e>(&self, entry: &'e MutableEntry) -> TransactResult<Program<'e>> {
        if entry.revision() != Some(self.revision) {
            return Err(TransactError::invalid_state(format!(
                "entry committed as {:?}, pending revision is {}",
                entry.revision(),
                self.revision
            )));
        }
        entry.program()
    }

    /// Runs the COMMIT phase of the entry's program against the indices.
    pub fn apply(&mut self, entry: &MutableEntry) -> TransactResult<usize> {
        let program = self.program(entry)?;
        self.applied = true;
        let mut handler = ApplyHandler::new(&self.store.paths, &self.store.resources);
        Interpreter::run(&program, Phase::Commit, &mut handler)?;
        Ok(handler.applied)
    }

    /// Deletes every index entry the COMMIT phase wrote at this revision.
    ///
    /// On success the revision counts as never applied, so failing the
    /// change afterwards clears its table entry.
    pub fn rollback(&mut self, entry: &MutableEntry) -> TransactResult<usize> {
        let program = self.program(entry)?;
        let mut handler = RollbackHandler::new(&self.store.paths, &self.store.resources);
        Interpreter::run(&program, Phase::Commit, &mut handler)?;
        let discarded = handler.finish()?;
        self.applied = false;
        trace!(revision = %self.revision, discarded, "rolled back revision");
        Ok(discarded)
    }

    /// Runs the CLEANUP phase of the entry's program.
    pub fn cleanup(&mut self, entry: &MutableEntry) -> TransactResult<usize> {
        let program = self.program(entry)?;
        let mut handler = ApplyHandler::new(&self.store.paths, &self.store.resources);
        Interpreter::run(&program, Phase::Cleanup, &mut handler)?;
        Ok(handler.applied)
    }

    /// Marks the revision committed and exposes it to read-committed readers.
    pub fn update(mut self) -> TransactResult<Revision> {
        let guard = self
            .guard
            .take()
            .ok_or_else(|| TransactError::invalid_state("revision change already finished"))?;
        guard.write(self.revision, EntryState::Committed)?;
        self.store.table.update_read_committed(guard.index())?;
        Ok(self.revision)
    }

    /// Abandons the revision.
    ///
    /// Before anything was applied the table entry is cleared. Afterwards it
    /// stays WRITING so recovery can finish the revision.
    pub fn fail(mut self) -> TransactResult<()> {
        self.finish_failed()
    }

    fn finish_failed(&mut self) -> TransactResult<()> {
        let Some(guard) = self.guard.take() else {
            return Ok(());
        };
        if self.applied {
            warn!(revision = %self.revision, slot = guard.index(), "revision left for recovery");
            return Ok(());
        }
        guard.clear()?;
        trace!(revision = %self.revision, "revision change failed");
        Ok(())
    }

    pub fn close(self) {}
}

impl Drop for PendingRevisionChange<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.finish_failed() {
            warn!(revision = %self.revision, error = %err, "failed to clear revision entry");
        }
    }
}

impl std::fmt::Debug for PendingRevisionChange<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRevisionChange")
            .field("revision", &self.revision)
            .field("applied", &self.applied)
            .field("finished", &self.guard.is_none())
            .finish()
    }
}

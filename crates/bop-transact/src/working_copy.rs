use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::error::TransactResult;
use crate::ids::{NodeId, ResourceId};
use crate::index::{Listing, PathIndex, ResourceIndex};
use crate::revision::Revision;
use crate::rt_path::RtPath;

/// Transaction-local view of one node's mappings.
///
/// Values come from the indices at the base revision the first time a key is
/// touched; the transaction's own changes are layered on top.
#[derive(Debug)]
pub struct WorkingCopy {
    node: NodeId,
    revision: Revision,
    paths: Arc<PathIndex>,
    resources: Arc<ResourceIndex>,
    values: HashMap<RtPath, Option<ResourceId>>,
    referrers: HashMap<ResourceId, BTreeSet<RtPath>>,
    live: HashMap<ResourceId, bool>,
}

impl WorkingCopy {
    pub fn new(
        node: NodeId,
        revision: Revision,
        paths: Arc<PathIndex>,
        resources: Arc<ResourceIndex>,
    ) -> Self {
        Self {
            node,
            revision,
            paths,
            resources,
            values: HashMap::new(),
            referrers: HashMap::new(),
            live: HashMap::new(),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Base revision the copy reads from.
    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn value_of(&mut self, path: &RtPath) -> TransactResult<Option<ResourceId>> {
        if let Some(value) = self.values.get(path) {
            return Ok(*value);
        }
        let value = self.paths.get_value_at(self.node, self.revision, path)?;
        self.values.insert(path.clone(), value);
        Ok(value)
    }

    pub fn is_live(&mut self, resource: ResourceId) -> TransactResult<bool> {
        if let Some(live) = self.live.get(&resource) {
            return Ok(*live);
        }
        let live = self.resources.is_live_at(self.revision, resource)?;
        self.live.insert(resource, live);
        Ok(live)
    }

    /// Paths currently mapped to `resource`.
    pub fn referrers(&mut self, resource: ResourceId) -> TransactResult<&BTreeSet<RtPath>> {
        if !self.referrers.contains_key(&resource) {
            let candidates = self.paths.reverse_paths_at(self.node, self.revision, resource)?;
            let mut mapped = BTreeSet::new();
            for path in candidates {
                if self.value_of(&path)? == Some(resource) {
                    mapped.insert(path);
                }
            }
            // Paths this transaction already pointed at the resource.
            for (path, value) in &self.values {
                if *value == Some(resource) {
                    mapped.insert(path.clone());
                }
            }
            self.referrers.insert(resource, mapped);
        }
        Ok(self.referrers.entry(resource).or_default())
    }

    /// Registers a resource created by this transaction.
    pub fn create_resource(&mut self, resource: ResourceId) {
        self.live.insert(resource, true);
        self.referrers.entry(resource).or_default();
    }

    /// Maps `path` to `resource`, detaching it from whatever it pointed at before.
    pub fn link(&mut self, path: &RtPath, resource: ResourceId) -> TransactResult<()> {
        if let Some(previous) = self.value_of(path)? {
            if let Some(set) = self.referrers.get_mut(&previous) {
                set.remove(path);
            }
        }
        self.referrers(resource)?;
        self.values.insert(path.clone(), Some(resource));
        self.referrers.entry(resource).or_default().insert(path.clone());
        self.live.insert(resource, true);
        Ok(())
    }

    /// Clears `path`. Returns the resource it pointed at and whether that
    /// resource is now without any path.
    pub fn unlink(&mut self, path: &RtPath) -> TransactResult<Option<(ResourceId, bool)>> {
        let Some(resource) = self.value_of(path)? else {
            return Ok(None);
        };
        self.referrers(resource)?;
        self.values.insert(path.clone(), None);
        let referrers = self.referrers.entry(resource).or_default();
        referrers.remove(path);
        Ok(Some((resource, referrers.is_empty())))
    }

    /// Marks `resource` removed and clears every path mapped to it.
    /// Returns the cleared paths.
    pub fn remove_resource(&mut self, resource: ResourceId) -> TransactResult<BTreeSet<RtPath>> {
        let cleared = self.referrers(resource)?.clone();
        for path in &cleared {
            self.values.insert(path.clone(), None);
        }
        self.referrers.insert(resource, BTreeSet::new());
        self.live.insert(resource, false);
        Ok(cleared)
    }

    /// Mappings matching `pattern` as this transaction sees them, sorted by path.
    pub fn list(&mut self, pattern: &RtPath) -> TransactResult<Vec<Listing>> {
        let mut candidates: BTreeSet<RtPath> = self
            .paths
            .list(self.node, self.revision, pattern)?
            .into_iter()
            .map(|listing| listing.path)
            .collect();
        candidates.extend(self.values.keys().filter(|path| pattern.matches(path)).cloned());

        let mut listings = Vec::with_capacity(candidates.len());
        for path in candidates {
            if let Some(resource) = self.value_of(&path)? {
                listings.push(Listing { path, resource });
            }
        }
        Ok(listings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::Layout;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        paths: Arc<PathIndex>,
        resources: Arc<ResourceIndex>,
        node: NodeId,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().expect("tempdir");
        let layout = Layout::new(tmp.path());
        layout.initialize().expect("initialize");
        let paths = Arc::new(PathIndex::new(layout).expect("paths"));
        let resources = Arc::new(ResourceIndex::new(paths.clone()));
        Fixture {
            _tmp: tmp,
            paths,
            resources,
            node: NodeId::random(),
        }
    }

    fn p(raw: &str) -> RtPath {
        RtPath::parse(raw).expect("path")
    }

    #[test]
    fn loads_committed_state_lazily() {
        let fx = fixture();
        let rid = ResourceId::random();
        fx.resources.add_resource_id(rid).expect("add");
        fx.paths.link(fx.node, Revision::new(1), &p("/a"), rid).expect("link");
        fx.paths.link(fx.node, Revision::new(1), &p("/b"), rid).expect("link");

        let mut copy = WorkingCopy::new(fx.node, Revision::new(1), fx.paths.clone(), fx.resources.clone());
        assert!(copy.is_live(rid).expect("live"));
        assert_eq!(copy.value_of(&p("/a")).expect("value"), Some(rid));
        assert_eq!(copy.referrers(rid).expect("referrers").len(), 2);

        let mut older = WorkingCopy::new(fx.node, Revision::ZERO, fx.paths.clone(), fx.resources.clone());
        assert_eq!(older.value_of(&p("/a")).expect("value"), None);
    }

    #[test]
    fn unlink_reports_orphans() {
        let fx = fixture();
        let rid = ResourceId::random();
        fx.resources.add_resource_id(rid).expect("add");
        fx.paths.link(fx.node, Revision::new(1), &p("/a"), rid).expect("link");
        fx.paths.link(fx.node, Revision::new(1), &p("/b"), rid).expect("link");

        let mut copy = WorkingCopy::new(fx.node, Revision::new(1), fx.paths.clone(), fx.resources.clone());
        assert_eq!(copy.unlink(&p("/a")).expect("unlink"), Some((rid, false)));
        assert_eq!(copy.unlink(&p("/a")).expect("unlink"), None);
        assert_eq!(copy.unlink(&p("/b")).expect("unlink"), Some((rid, true)));
    }

    #[test]
    fn staged_links_show_in_listings() {
        let fx = fixture();
        let committed = ResourceId::random();
        fx.resources.add_resource_id(committed).expect("add");
        fx.paths.link(fx.node, Revision::new(1), &p("/dir/old"), committed).expect("link");

        let mut copy = WorkingCopy::new(fx.node, Revision::new(1), fx.paths.clone(), fx.resources.clone());
        let fresh = ResourceId::random();
        copy.create_resource(fresh);
        copy.link(&p("/dir/new"), fresh).expect("link");
        copy.link(&p("/elsewhere"), fresh).expect("link");

        let listed: Vec<String> = copy
            .list(&p("/dir/*"))
            .expect("list")
            .into_iter()
            .map(|listing| listing.path.to_string())
            .collect();
        assert_eq!(listed, vec!["/dir/new", "/dir/old"]);

        let cleared = copy.remove_resource(committed).expect("remove");
        assert_eq!(cleared.into_iter().collect::<Vec<_>>(), vec![p("/dir/old")]);
        assert!(!copy.is_live(committed).expect("live"));
        assert_eq!(copy.list(&p("/dir/*")).expect("list").len(), 1);
    }
}

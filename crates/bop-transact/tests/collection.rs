use std::io::Write;
use std::thread;
use std::time::{Duration, Instant};

use bop_transact::test_support::{config_for_tests, tree_snapshot};
use bop_transact::{NodeId, ResourceId, Revision, RtPath, Store, TransactResult};
use tempfile::TempDir;

fn p(raw: &str) -> RtPath {
    RtPath::parse(raw).expect("path")
}

fn save(store: &Store, node: NodeId, path: &str, contents: &[u8]) -> (ResourceId, Revision) {
    let mut entry = store.new_mutable_entry(node).expect("entry");
    let rid = ResourceId::random();
    let mut writer = entry.save_new_resource(&p(path), rid).expect("save");
    writer.write_all(contents).expect("write");
    writer.finish().expect("finish");
    (rid, store.commit_entry(entry).expect("commit"))
}

fn save_as(
    store: &Store,
    node: NodeId,
    path: &str,
    rid: ResourceId,
    contents: &[u8],
) -> TransactResult<Revision> {
    let mut entry = store.new_mutable_entry(node).expect("entry");
    let mut writer = entry.save_new_resource(&p(path), rid).expect("save");
    writer.write_all(contents).expect("write");
    writer.finish().expect("finish");
    store.commit_entry(entry)
}

fn open_with_small_rings(tmp: &TempDir) -> Store {
    let mut config = config_for_tests(tmp.path());
    config.revision_table_count = 4;
    config.txn_buffer_count = 4;
    Store::open(config).expect("open")
}

fn unlink(store: &Store, node: NodeId, path: &str) -> Revision {
    let mut entry = store.new_mutable_entry(node).expect("entry");
    entry.unlink_path(&p(path)).expect("unlink");
    store.commit_entry(entry).expect("commit")
}

fn wait_for(mut condition: impl FnMut() -> bool, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("condition not met within {timeout:?}");
}

#[test]
fn unlinked_resources_are_reclaimed_once_unreachable() {
    let tmp = TempDir::new().expect("tempdir");
    let store = Store::open(config_for_tests(tmp.path())).expect("open");
    let node = NodeId::random();

    let (gone, _) = save(&store, node, "/a/b", b"hello");
    let (kept, _) = save(&store, node, "/a/c", b"world");
    unlink(&store, node, "/a/b");
    // The unlink must be older than the read-committed revision to be collected.
    let (_, latest) = save(&store, node, "/z", b"tail");

    let stats = store.collect().expect("collect");
    assert_eq!(stats.failures, 0);
    assert!(stats.revisions >= 3);

    let snapshot = tree_snapshot(tmp.path()).expect("snapshot");
    let gone_dir = gone.as_dir_name();
    assert!(
        snapshot.iter().all(|line| !line.contains(&gone_dir)),
        "resource {gone} left entries: {snapshot:#?}"
    );
    assert!(snapshot.iter().all(|line| !line.contains("b.d")));
    assert!(snapshot.iter().any(|line| line.contains(&kept.as_dir_name())));
    assert_eq!(
        store.resource_id_at(node, latest, &p("/a/c")).expect("get"),
        Some(kept)
    );
    assert_eq!(store.resource_id_at(node, latest, &p("/a/b")).expect("get"), None);
}

#[test]
fn a_second_cycle_changes_nothing() {
    let tmp = TempDir::new().expect("tempdir");
    let store = Store::open(config_for_tests(tmp.path())).expect("open");
    let node = NodeId::random();
    for i in 0..4 {
        save(&store, node, &format!("/dir/{i}"), b"x");
    }
    unlink(&store, node, "/dir/1");
    let mut entry = store.new_mutable_entry(node).expect("entry");
    entry.remove_resources(&p("/dir/*"), 2).expect("remove");
    store.commit_entry(entry).expect("commit");
    save(&store, node, "/last", b"x");

    let first = store.collect().expect("collect");
    assert_eq!(first.failures, 0);
    let before = tree_snapshot(tmp.path()).expect("snapshot");

    let second = store.collect().expect("collect");
    assert_eq!(second.failures, 0);
    assert_eq!(second.programs, 0);
    assert_eq!(second.path_entries + second.content_entries + second.files, 0);
    assert_eq!(tree_snapshot(tmp.path()).expect("snapshot"), before);
}

#[test]
fn pinned_readers_hold_back_collection() {
    let tmp = TempDir::new().expect("tempdir");
    let store = Store::open(config_for_tests(tmp.path())).expect("open");
    let node = NodeId::random();
    let (rid, first) = save(&store, node, "/doc", b"v1");
    let pin = store.lock_latest_read_uncommitted().expect("pin");

    unlink(&store, node, "/doc");
    save(&store, node, "/other", b"x");
    let stats = store.collect().expect("collect");
    assert_eq!(stats.programs, 0);
    assert_eq!(store.resource_id_at(node, first, &p("/doc")).expect("get"), Some(rid));
    assert!(store.load_resource(first, rid).expect("load").is_some());

    drop(pin);
    let stats = store.collect().expect("collect");
    assert!(stats.programs >= 2);
}

#[test]
fn background_collector_runs_on_hints() {
    let tmp = TempDir::new().expect("tempdir");
    let mut config = config_for_tests(tmp.path());
    config.gc.background = true;
    config.gc.interval_ms = 60_000;
    let store = Store::open(config).expect("open");
    let node = NodeId::random();

    let (rid, _) = save(&store, node, "/tmp/file", b"x");
    unlink(&store, node, "/tmp/file");
    save(&store, node, "/tmp/next", b"y");
    store.hint();

    let resource_dir = store.layout().resources_dir().join(rid.as_dir_name());
    wait_for(|| !resource_dir.exists(), Duration::from_secs(5));
    store.stop().expect("stop");
}

#[test]
fn failed_commits_leave_nothing_for_the_collector() {
    let tmp = TempDir::new().expect("tempdir");
    let store = open_with_small_rings(&tmp);
    let node = NodeId::random();
    let blocked = ResourceId::random();

    // A file where the reverse directory of `blocked` belongs fails its path link.
    let reverse_node = store.layout().reverse_dir().join(node.as_dir_name());
    std::fs::create_dir_all(&reverse_node).expect("mkdir");
    let blocker = reverse_node.join(blocked.as_dir_name());
    std::fs::write(&blocker, b"").expect("blocker");

    let mut last = Revision::ZERO;
    for i in 0..6 {
        assert!(save_as(&store, node, "/blocked", blocked, b"lost").is_err());
        let (_, revision) = save(&store, node, &format!("/ok/{i}"), b"x");
        assert!(revision > last);
        last = revision;
    }
    assert_eq!(store.resource_id_at(node, last, &p("/blocked")).expect("get"), None);
    assert!(!store.layout().resources_dir().join(blocked.as_dir_name()).exists());
    assert_eq!(store.held_locks(), 0);
    assert_eq!(
        std::fs::read_dir(store.layout().temporary_dir()).expect("temporary").count(),
        0
    );

    std::fs::remove_file(&blocker).expect("unblock");
    let revision = save_as(&store, node, "/blocked", blocked, b"kept").expect("commit");
    assert_eq!(
        store.resource_id_at(node, revision, &p("/blocked")).expect("get"),
        Some(blocked)
    );
    save(&store, node, "/tail", b"x");
    let stats = store.collect().expect("collect");
    assert_eq!(stats.failures, 0);
}

#[test]
fn unreadable_reverse_snapshots_do_not_stall_the_journal() {
    let tmp = TempDir::new().expect("tempdir");
    let store = open_with_small_rings(&tmp);
    let node = NodeId::random();
    let (rid, _) = save(&store, node, "/victim", b"x");
    let mut entry = store.new_mutable_entry(node).expect("entry");
    entry.remove_resource(rid).expect("remove");
    store.commit_entry(entry).expect("commit");

    // A regular file inside a snapshot is not a reverse entry; listing it fails.
    let reverse = store
        .layout()
        .reverse_dir()
        .join(node.as_dir_name())
        .join(rid.as_dir_name());
    for entry in std::fs::read_dir(&reverse).expect("reverse") {
        let entry = entry.expect("entry");
        if entry.file_type().expect("file type").is_dir() {
            std::fs::write(entry.path().join("stray"), b"").expect("stray");
        }
    }

    // Each ring holds four slots, so these only fit if collection keeps draining both.
    let mut last = Revision::ZERO;
    for i in 0..12 {
        let (_, revision) = save(&store, node, &format!("/after/{i}"), b"x");
        assert!(revision > last);
        last = revision;
    }
    store.collect().expect("collect");
    assert!(!reverse.exists());
    assert_eq!(store.list(node, last, &p("/after/*")).expect("list").len(), 12);
}

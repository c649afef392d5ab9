use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use bop_transact::fs::Layout;
use bop_transact::index::{PathIndex, ResourceIndex};
use bop_transact::program::{
    ExecutionContext, ExecutionHandler, Instruction, Interpreter, Param, Phase, Program,
    ProgramBuilder,
};
use bop_transact::{ChecksumAlgorithm, NodeId, ResourceId, Revision, RtPath, TransactResult};
use tempfile::TempDir;

/// Applies link and unlink commands straight to the indices.
struct Indexer<'a> {
    paths: &'a PathIndex,
    resources: &'a ResourceIndex,
}

impl ExecutionHandler for Indexer<'_> {
    fn add_resource_id(&mut self, _ctx: &ExecutionContext, resource: ResourceId) -> TransactResult<()> {
        self.resources.add_resource_id(resource)
    }

    fn link_new_resource(
        &mut self,
        ctx: &ExecutionContext,
        source: &Path,
        resource: ResourceId,
    ) -> TransactResult<()> {
        self.resources.link_new_resource(ctx.revision, source, resource)
    }

    fn link_resource_to_rt_path(
        &mut self,
        ctx: &ExecutionContext,
        resource: ResourceId,
        path: &RtPath,
    ) -> TransactResult<()> {
        self.paths.link(ctx.node, ctx.revision, path, resource)
    }

    fn unlink_rt_path(
        &mut self,
        ctx: &ExecutionContext,
        resource: ResourceId,
        path: &RtPath,
    ) -> TransactResult<()> {
        self.paths.unlink(ctx.node, ctx.revision, path, resource)
    }
}

fn compile(builder: &ProgramBuilder, node: NodeId, revision: Revision) -> Vec<u8> {
    let mut slot = vec![0xFFu8; 2048];
    builder
        .compile(node, revision, &Phase::ALL, ChecksumAlgorithm::Crc32, &mut slot)
        .expect("compile")
        .commit();
    slot
}

#[test]
fn interpreted_programs_drive_the_indices() {
    let tmp = TempDir::new().expect("tempdir");
    let layout = Layout::new(tmp.path());
    layout.initialize().expect("initialize");
    let paths = Arc::new(PathIndex::new(layout.clone()).expect("paths"));
    let resources = ResourceIndex::new(paths.clone());
    let mut indexer = Indexer {
        paths: &paths,
        resources: &resources,
    };

    let node = NodeId::random();
    let rid = ResourceId::random();
    let path = RtPath::parse("/reports/q3").expect("path");
    let (mut staged, staged_path) = layout.create_staging_file().expect("stage");
    staged.write_all(b"numbers").expect("write");

    let mut link = ProgramBuilder::new();
    link.add_resource_id(rid);
    link.link_new_resource(&staged_path, rid);
    link.link_resource_to_rt_path(rid, &path);
    let first = Revision::new(10);
    let slot = compile(&link, node, first);
    let program = Program::load(&slot).expect("load");
    assert!(Program::is_valid(&slot));
    Interpreter::run(&program, Phase::Commit, &mut indexer).expect("commit phase");
    assert_eq!(paths.get_value_at(node, first, &path).expect("get"), Some(rid));

    let mut unlink = ProgramBuilder::new();
    unlink.push(
        Phase::Cleanup,
        Instruction::UnlinkRtPath,
        vec![Param::ResourceId(rid), Param::RtPath(path.clone())],
    );
    let second = Revision::new(11);
    let slot = compile(&unlink, node, second);
    let program = Program::load(&slot).expect("load");
    Interpreter::run(&program, Phase::Cleanup, &mut indexer).expect("cleanup phase");

    assert_eq!(paths.get_value_at(node, second, &path).expect("get"), None);
    assert_eq!(paths.get_value_at(node, first, &path).expect("get"), Some(rid));
    assert!(resources.exists_at(second, rid).expect("exists"));
}

#[test]
fn commit_runs_before_cleanup_when_replaying() {
    let tmp = TempDir::new().expect("tempdir");
    let layout = Layout::new(tmp.path());
    layout.initialize().expect("initialize");
    let paths = Arc::new(PathIndex::new(layout.clone()).expect("paths"));
    let resources = ResourceIndex::new(paths.clone());
    let mut indexer = Indexer {
        paths: &paths,
        resources: &resources,
    };

    let node = NodeId::random();
    let rid = ResourceId::random();
    let path = RtPath::parse("/short/lived").expect("path");
    let (_, staged_path) = layout.create_staging_file().expect("stage");

    let mut builder = ProgramBuilder::new();
    builder.push(
        Phase::Cleanup,
        Instruction::UnlinkRtPath,
        vec![Param::ResourceId(rid), Param::RtPath(path.clone())],
    );
    builder.add_resource_id(rid);
    builder.link_new_resource(&staged_path, rid);
    builder.link_resource_to_rt_path(rid, &path);
    let revision = Revision::new(3);
    let slot = compile(&builder, node, revision);
    let program = Program::load(&slot).expect("load");

    let executed = Interpreter::run_all(&program, &mut indexer).expect("replay");
    assert_eq!(executed, 4);
    assert_eq!(paths.get_value_at(node, revision, &path).expect("get"), None);
    assert_eq!(paths.revisions(node, &path).expect("revisions").len(), 1);
}

use std::path::Path;

use tracing::trace;

use super::{Command, Instruction, Phase, Program};
use crate::error::TransactResult;
use crate::ids::{NodeId, ResourceId};
use crate::revision::Revision;
use crate::rt_path::RtPath;

/// What a handler knows about the command being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionContext {
    pub node: NodeId,
    pub revision: Revision,
    pub phase: Phase,
}

/// Receives the decoded commands of a program, one method per instruction.
///
/// Every method defaults to ignoring the command, so a handler only
/// implements the instructions it cares about.
pub trait ExecutionHandler {
    fn noop(&mut self, ctx: &ExecutionContext) -> TransactResult<()> {
        trace!(phase = %ctx.phase, "noop");
        Ok(())
    }

    fn unlink_fs_path(&mut self, ctx: &ExecutionContext, path: &Path) -> TransactResult<()> {
        trace!(phase = %ctx.phase, path = %path.display(), "ignoring unlink_fs_path");
        Ok(())
    }

    fn unlink_rt_path(
        &mut self,
        ctx: &ExecutionContext,
        resource: ResourceId,
        path: &RtPath,
    ) -> TransactResult<()> {
        trace!(phase = %ctx.phase, %resource, %path, "ignoring unlink_rt_path");
        Ok(())
    }

    fn remove_resource(&mut self, ctx: &ExecutionContext, resource: ResourceId) -> TransactResult<()> {
        trace!(phase = %ctx.phase, %resource, "ignoring remove_resource");
        Ok(())
    }

    fn update_resource(
        &mut self,
        ctx: &ExecutionContext,
        source: &Path,
        resource: ResourceId,
    ) -> TransactResult<()> {
        trace!(phase = %ctx.phase, source = %source.display(), %resource, "ignoring update_resource");
        Ok(())
    }

    fn add_path(&mut self, ctx: &ExecutionContext, path: &RtPath) -> TransactResult<()> {
        trace!(phase = %ctx.phase, %path, "ignoring add_path");
        Ok(())
    }

    fn add_resource_id(&mut self, ctx: &ExecutionContext, resource: ResourceId) -> TransactResult<()> {
        trace!(phase = %ctx.phase, %resource, "ignoring add_resource_id");
        Ok(())
    }

    fn link_new_resource(
        &mut self,
        ctx: &ExecutionContext,
        source: &Path,
        resource: ResourceId,
    ) -> TransactResult<()> {
        trace!(phase = %ctx.phase, source = %source.display(), %resource, "ignoring link_new_resource");
        Ok(())
    }

    fn link_resource_to_rt_path(
        &mut self,
        ctx: &ExecutionContext,
        resource: ResourceId,
        path: &RtPath,
    ) -> TransactResult<()> {
        trace!(phase = %ctx.phase, %resource, %path, "ignoring link_resource_to_rt_path");
        Ok(())
    }
}

/// Dispatches a program's commands to an [`ExecutionHandler`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Interpreter;

impl Interpreter {
    /// Runs every command of `phase` in staging order.
    pub fn run<H>(program: &Program<'_>, phase: Phase, handler: &mut H) -> TransactResult<usize>
    where
        H: ExecutionHandler + ?Sized,
    {
        let ctx = ExecutionContext {
            node: program.node(),
            revision: program.revision(),
            phase,
        };
        let commands = program.commands(phase)?;
        for command in &commands {
            Self::dispatch(&ctx, command, handler)?;
        }
        Ok(commands.len())
    }

    /// Runs the COMMIT phase, then the CLEANUP phase.
    pub fn run_all<H>(program: &Program<'_>, handler: &mut H) -> TransactResult<usize>
    where
        H: ExecutionHandler + ?Sized,
    {
        let commit = Self::run(program, Phase::Commit, handler)?;
        let cleanup = Self::run(program, Phase::Cleanup, handler)?;
        Ok(commit + cleanup)
    }

    fn dispatch<H>(ctx: &ExecutionContext, command: &Command<'_>, handler: &mut H) -> TransactResult<()>
    where
        H: ExecutionHandler + ?Sized,
    {
        match command.instruction() {
            Instruction::Noop => handler.noop(ctx),
            Instruction::UnlinkFsPath => handler.unlink_fs_path(ctx, command.fs_path(0)?),
            Instruction::UnlinkRtPath => {
                handler.unlink_rt_path(ctx, command.resource_id(0)?, &command.rt_path(1)?)
            }
            Instruction::RemoveResource => handler.remove_resource(ctx, command.resource_id(0)?),
            Instruction::UpdateResource => {
                handler.update_resource(ctx, command.fs_path(0)?, command.resource_id(1)?)
            }
            Instruction::AddPath => handler.add_path(ctx, &command.rt_path(0)?),
            Instruction::AddResourceId => handler.add_resource_id(ctx, command.resource_id(0)?),
            Instruction::LinkNewResource => {
                handler.link_new_resource(ctx, command.fs_path(0)?, command.resource_id(1)?)
            }
            Instruction::LinkResourceToRtPath => handler.link_resource_to_rt_path(
                ctx,
                command.resource_id(0)?,
                &command.rt_path(1)?,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ChecksumAlgorithm;
    use crate::error::TransactError;
    use crate::program::{Param, ProgramBuilder};

    #[derive(Default)]
    struct Recorder {
        seen: Vec<(Phase, String)>,
    }

    impl ExecutionHandler for Recorder {
        fn unlink_fs_path(&mut self, ctx: &ExecutionContext, path: &Path) -> TransactResult<()> {
            self.seen.push((ctx.phase, format!("unlink_fs {}", path.display())));
            Ok(())
        }

        fn link_resource_to_rt_path(
            &mut self,
            ctx: &ExecutionContext,
            _resource: ResourceId,
            path: &RtPath,
        ) -> TransactResult<()> {
            self.seen.push((ctx.phase, format!("link {path}")));
            Ok(())
        }
    }

    fn compile(builder: &ProgramBuilder) -> Vec<u8> {
        let mut slot = vec![0xFF; 1024];
        builder
            .compile(
                NodeId::random(),
                Revision::new(9),
                &Phase::ALL,
                ChecksumAlgorithm::default(),
                &mut slot,
            )
            .expect("compile")
            .commit();
        slot
    }

    #[test]
    fn commit_runs_before_cleanup() {
        let mut builder = ProgramBuilder::new();
        let resource = ResourceId::random();
        builder.unlink_fs_path(Path::new("/tmp/a"));
        builder.add_resource_id(resource);
        builder.link_resource_to_rt_path(resource, &RtPath::parse("/x").expect("path"));
        let slot = compile(&builder);
        let program = Program::load(&slot).expect("load");
        let mut recorder = Recorder::default();
        assert_eq!(Interpreter::run_all(&program, &mut recorder).expect("run"), 3);
        assert_eq!(
            recorder.seen,
            vec![
                (Phase::Commit, "link /x".to_string()),
                (Phase::Cleanup, "unlink_fs /tmp/a".to_string()),
            ]
        );
    }

    #[test]
    fn mistyped_parameters_are_program_corruption() {
        let mut builder = ProgramBuilder::new();
        builder.push(
            Phase::Commit,
            Instruction::LinkResourceToRtPath,
            vec![Param::RtPath(RtPath::parse("/x").expect("path")), Param::Null],
        );
        let slot = compile(&builder);
        let program = Program::load(&slot).expect("load");
        let err = Interpreter::run(&program, Phase::Commit, &mut Recorder::default())
            .expect_err("mistyped");
        assert!(matches!(err, TransactError::ProgramCorruption(_)));
        assert!(err.is_fatal());
    }
}

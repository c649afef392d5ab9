use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use super::command::{COMMAND_HEADER_LEN, PARAM_HEADER_LEN};
use super::{Instruction, PROGRAM_HEADER_LEN, Param, Phase, ProgramHeader};
use crate::checksum::ChecksumAlgorithm;
use crate::error::{TransactError, TransactResult};
use crate::ids::{NodeId, ResourceId};
use crate::revision::Revision;
use crate::rt_path::RtPath;

#[derive(Debug, Clone, PartialEq, Eq)]
struct StagedCommand {
    instruction: Instruction,
    params: Vec<Param>,
}

impl StagedCommand {
    fn encoded_len(&self) -> usize {
        COMMAND_HEADER_LEN
            + self.params.len() * PARAM_HEADER_LEN
            + self.params.iter().map(|p| p.encoded().len()).sum::<usize>()
    }

    /// Writes the command at `at` inside `program` and returns the bytes written.
    fn write(&self, phase: Phase, program: &mut [u8], at: usize) -> usize {
        let encoded: Vec<Vec<u8>> = self.params.iter().map(Param::encoded).collect();
        let len = self.encoded_len();
        program[at] = self.instruction as u8;
        program[at + 1] = phase as u8;
        LittleEndian::write_u16(&mut program[at + 2..at + 4], self.params.len() as u16);
        LittleEndian::write_u32(&mut program[at + 4..at + 8], len as u32);

        let mut header_at = at + COMMAND_HEADER_LEN;
        let mut data_at = header_at + self.params.len() * PARAM_HEADER_LEN;
        for (param, bytes) in self.params.iter().zip(&encoded) {
            program[header_at] = param.param_type() as u8;
            LittleEndian::write_u32(&mut program[header_at + 1..header_at + 5], data_at as u32);
            LittleEndian::write_u32(&mut program[header_at + 5..header_at + 9], bytes.len() as u32);
            program[data_at..data_at + bytes.len()].copy_from_slice(bytes);
            header_at += PARAM_HEADER_LEN;
            data_at += bytes.len();
        }
        len
    }
}

/// Accumulates commands per phase until they are compiled into a slot.
#[derive(Debug, Clone, Default)]
pub struct ProgramBuilder {
    commit: Vec<StagedCommand>,
    cleanup: Vec<StagedCommand>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn phase_mut(&mut self, phase: Phase) -> &mut Vec<StagedCommand> {
        match phase {
            Phase::Commit => &mut self.commit,
            Phase::Cleanup => &mut self.cleanup,
        }
    }

    fn phase(&self, phase: Phase) -> &[StagedCommand] {
        match phase {
            Phase::Commit => &self.commit,
            Phase::Cleanup => &self.cleanup,
        }
    }

    /// Stages an arbitrary command.
    pub fn push(&mut self, phase: Phase, instruction: Instruction, params: Vec<Param>) {
        self.phase_mut(phase).push(StagedCommand {
            instruction,
            params,
        });
    }

    pub fn noop(&mut self, phase: Phase) {
        self.push(phase, Instruction::Noop, vec![Param::Null]);
    }

    /// Removes a staged file once the program has been applied.
    pub fn unlink_fs_path(&mut self, path: &Path) {
        self.push(
            Phase::Cleanup,
            Instruction::UnlinkFsPath,
            vec![Param::FsPath(path.to_path_buf())],
        );
    }

    pub fn unlink_rt_path(&mut self, resource: ResourceId, path: &RtPath) {
        self.push(
            Phase::Commit,
            Instruction::UnlinkRtPath,
            vec![Param::ResourceId(resource), Param::RtPath(path.clone())],
        );
    }

    pub fn remove_resource(&mut self, resource: ResourceId) {
        self.push(
            Phase::Commit,
            Instruction::RemoveResource,
            vec![Param::ResourceId(resource)],
        );
    }

    pub fn update_resource(&mut self, source: &Path, resource: ResourceId) {
        self.push(
            Phase::Commit,
            Instruction::UpdateResource,
            vec![Param::FsPath(source.to_path_buf()), Param::ResourceId(resource)],
        );
    }

    pub fn add_path(&mut self, path: &RtPath) {
        self.push(
            Phase::Commit,
            Instruction::AddPath,
            vec![Param::RtPath(path.clone())],
        );
    }

    pub fn add_resource_id(&mut self, resource: ResourceId) {
        self.push(
            Phase::Commit,
            Instruction::AddResourceId,
            vec![Param::ResourceId(resource)],
        );
    }

    pub fn link_new_resource(&mut self, source: &Path, resource: ResourceId) {
        self.push(
            Phase::Commit,
            Instruction::LinkNewResource,
            vec![Param::FsPath(source.to_path_buf()), Param::ResourceId(resource)],
        );
    }

    pub fn link_resource_to_rt_path(&mut self, resource: ResourceId, path: &RtPath) {
        self.push(
            Phase::Commit,
            Instruction::LinkResourceToRtPath,
            vec![Param::ResourceId(resource), Param::RtPath(path.clone())],
        );
    }

    pub fn len(&self) -> usize {
        self.commit.len() + self.cleanup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size in bytes a compiled program covering `phases` would take.
    pub fn compiled_len(&self, phases: &[Phase]) -> usize {
        PROGRAM_HEADER_LEN
            + phases
                .iter()
                .flat_map(|phase| self.phase(*phase))
                .map(StagedCommand::encoded_len)
                .sum::<usize>()
    }

    /// Writes the header and the requested phases into `dst`.
    ///
    /// The result carries no checksum yet; it only becomes a valid program
    /// once [`CompiledProgram::commit`] runs.
    pub fn compile<'a>(
        &self,
        node: NodeId,
        revision: Revision,
        phases: &[Phase],
        algorithm: ChecksumAlgorithm,
        dst: &'a mut [u8],
    ) -> TransactResult<CompiledProgram<'a>> {
        let mut phases = phases.to_vec();
        phases.sort();
        phases.dedup();
        let params = phases
            .iter()
            .flat_map(|phase| self.phase(*phase))
            .map(|command| command.params.len())
            .max()
            .unwrap_or(0);
        if params > u16::MAX as usize {
            return Err(TransactError::invalid_argument(format!(
                "command with {params} params exceeds the limit of {}",
                u16::MAX
            )));
        }
        let required = self.compiled_len(&phases);
        if required > dst.len() || required > u32::MAX as usize {
            return Err(TransactError::BufferOverflow {
                required,
                capacity: dst.len(),
            });
        }

        let mut header = ProgramHeader {
            checksum: 0,
            algorithm: algorithm.tag(),
            phases: 0,
            length: required as u32,
            node,
            revision,
            commit: (0, 0),
            cleanup: (0, 0),
        };
        let mut at = PROGRAM_HEADER_LEN;
        for phase in phases {
            let start = at;
            for command in self.phase(phase) {
                at += command.write(phase, dst, at);
            }
            let stream = (start as u32, (at - start) as u32);
            header.phases |= phase.bit();
            match phase {
                Phase::Commit => header.commit = stream,
                Phase::Cleanup => header.cleanup = stream,
            }
        }
        header.encode_into(dst);
        Ok(CompiledProgram {
            bytes: dst,
            length: required,
            algorithm,
        })
    }
}

/// A program written into its slot but not yet sealed by a checksum.
#[derive(Debug)]
pub struct CompiledProgram<'a> {
    bytes: &'a mut [u8],
    length: usize,
    algorithm: ChecksumAlgorithm,
}

impl CompiledProgram<'_> {
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Seals the program with its checksum and returns its length.
    pub fn commit(self) -> usize {
        let checksum = self.algorithm.compute(&self.bytes[8..self.length]);
        LittleEndian::write_u64(&mut self.bytes[0..8], checksum);
        self.length
    }
}

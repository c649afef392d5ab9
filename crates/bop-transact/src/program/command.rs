use std::ffi::OsStr;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};

use super::{Instruction, Phase};
use crate::error::{TransactError, TransactResult};
use crate::ids::{ID_LEN, ResourceId};
use crate::rt_path::RtPath;

/// instruction u8, phase u8, parameter count u16, command length u32
pub(super) const COMMAND_HEADER_LEN: usize = 8;
/// type u8, program-absolute offset u32, length u32
pub(super) const PARAM_HEADER_LEN: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ParamType {
    Null = 0,
    ResourceId = 1,
    FsPath = 2,
    RtPath = 3,
}

impl ParamType {
    fn from_raw(raw: u8) -> TransactResult<Self> {
        Ok(match raw {
            0 => ParamType::Null,
            1 => ParamType::ResourceId,
            2 => ParamType::FsPath,
            3 => ParamType::RtPath,
            other => {
                return Err(TransactError::program_corruption(format!(
                    "unknown parameter type {other}"
                )));
            }
        })
    }
}

/// A parameter staged in a [`super::ProgramBuilder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    Null,
    ResourceId(ResourceId),
    FsPath(PathBuf),
    RtPath(RtPath),
}

impl Param {
    pub fn param_type(&self) -> ParamType {
        match self {
            Param::Null => ParamType::Null,
            Param::ResourceId(_) => ParamType::ResourceId,
            Param::FsPath(_) => ParamType::FsPath,
            Param::RtPath(_) => ParamType::RtPath,
        }
    }

    pub(super) fn encoded(&self) -> Vec<u8> {
        match self {
            Param::Null => Vec::new(),
            Param::ResourceId(id) => id.as_bytes().to_vec(),
            Param::FsPath(path) => path.as_os_str().as_bytes().to_vec(),
            Param::RtPath(path) => path.to_string().into_bytes(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ParamRef {
    ty: ParamType,
    offset: usize,
    len: usize,
}

/// One decoded command, borrowing its parameter bytes from the program.
#[derive(Clone)]
pub struct Command<'a> {
    program: &'a [u8],
    offset: usize,
    len: usize,
    instruction: Instruction,
    phase: Phase,
    params: Vec<ParamRef>,
}

impl<'a> Command<'a> {
    /// Decodes the command at `offset`; it must end at or before `end`.
    pub(super) fn decode(program: &'a [u8], offset: usize, end: usize) -> TransactResult<Self> {
        if offset + COMMAND_HEADER_LEN > end {
            return Err(TransactError::program_corruption(format!(
                "command header at {offset} crosses stream end {end}"
            )));
        }
        let header = &program[offset..offset + COMMAND_HEADER_LEN];
        let instruction = Instruction::from_raw(header[0])?;
        let phase = Phase::from_raw(header[1])?;
        let count = LittleEndian::read_u16(&header[2..4]) as usize;
        let len = LittleEndian::read_u32(&header[4..8]) as usize;
        let params_start = offset + COMMAND_HEADER_LEN;
        let data_start = params_start + count * PARAM_HEADER_LEN;
        if len < data_start - offset || offset + len > end {
            return Err(TransactError::program_corruption(format!(
                "command at {offset} declares {len} bytes for {count} parameters within stream end {end}"
            )));
        }

        let mut params = Vec::with_capacity(count);
        for idx in 0..count {
            let at = params_start + idx * PARAM_HEADER_LEN;
            let raw = &program[at..at + PARAM_HEADER_LEN];
            let param = ParamRef {
                ty: ParamType::from_raw(raw[0])?,
                offset: LittleEndian::read_u32(&raw[1..5]) as usize,
                len: LittleEndian::read_u32(&raw[5..9]) as usize,
            };
            if param.offset < data_start || param.offset + param.len > offset + len {
                return Err(TransactError::program_corruption(format!(
                    "parameter {idx} of command at {offset} points outside the command"
                )));
            }
            let expected_len = match param.ty {
                ParamType::Null => Some(0),
                ParamType::ResourceId => Some(ID_LEN),
                ParamType::FsPath | ParamType::RtPath => None,
            };
            if expected_len.is_some_and(|expected| expected != param.len) {
                return Err(TransactError::program_corruption(format!(
                    "parameter {idx} of command at {offset} has length {} for type {:?}",
                    param.len, param.ty
                )));
            }
            params.push(param);
        }

        Ok(Self {
            program,
            offset,
            len,
            instruction,
            phase,
            params,
        })
    }

    pub fn instruction(&self) -> Instruction {
        self.instruction
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Encoded size of the command including its parameters.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    fn param(&self, index: usize, expected: ParamType) -> TransactResult<&'a [u8]> {
        let param = self.params.get(index).ok_or_else(|| {
            TransactError::program_corruption(format!(
                "{:?} has no parameter {index} ({} declared)",
                self.instruction,
                self.params.len()
            ))
        })?;
        if param.ty != expected {
            return Err(TransactError::program_corruption(format!(
                "{:?} parameter {index} is {:?}, expected {expected:?}",
                self.instruction, param.ty
            )));
        }
        Ok(&self.program[param.offset..param.offset + param.len])
    }

    pub fn param_type(&self, index: usize) -> Option<ParamType> {
        self.params.get(index).map(|param| param.ty)
    }

    pub fn null(&self, index: usize) -> TransactResult<()> {
        self.param(index, ParamType::Null).map(|_| ())
    }

    pub fn resource_id(&self, index: usize) -> TransactResult<ResourceId> {
        ResourceId::decode(self.param(index, ParamType::ResourceId)?)
            .map_err(|err| TransactError::program_corruption(err.to_string()))
    }

    pub fn fs_path(&self, index: usize) -> TransactResult<&'a Path> {
        Ok(Path::new(OsStr::from_bytes(
            self.param(index, ParamType::FsPath)?,
        )))
    }

    pub fn rt_path(&self, index: usize) -> TransactResult<RtPath> {
        let raw = std::str::from_utf8(self.param(index, ParamType::RtPath)?)
            .map_err(|err| TransactError::program_corruption(format!("rt path is not utf-8: {err}")))?;
        RtPath::parse(raw).map_err(|err| TransactError::program_corruption(err.to_string()))
    }
}

impl fmt::Debug for Command<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("instruction", &self.instruction)
            .field("phase", &self.phase)
            .field("offset", &self.offset)
            .field("params", &self.params.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{Program, ProgramBuilder};
    use crate::checksum::ChecksumAlgorithm;
    use crate::ids::NodeId;
    use crate::revision::Revision;

    fn compile(builder: &ProgramBuilder) -> Vec<u8> {
        let mut slot = vec![0xFF; 512];
        builder
            .compile(
                NodeId::random(),
                Revision::new(3),
                &Phase::ALL,
                ChecksumAlgorithm::default(),
                &mut slot,
            )
            .expect("compile")
            .commit();
        slot
    }

    #[test]
    fn accessors_check_index_and_type() {
        let resource = ResourceId::random();
        let path = RtPath::parse("/docs/readme").expect("path");
        let mut builder = ProgramBuilder::new();
        builder.unlink_rt_path(resource, &path);
        let slot = compile(&builder);
        let program = Program::load(&slot).expect("load");
        let commands = program.commands(Phase::Commit).expect("commands");
        let command = &commands[0];
        assert_eq!(command.instruction(), Instruction::UnlinkRtPath);
        assert_eq!(command.resource_id(0).expect("rid"), resource);
        assert_eq!(command.rt_path(1).expect("path"), path);
        assert!(matches!(
            command.rt_path(0),
            Err(TransactError::ProgramCorruption(_))
        ));
        assert!(matches!(
            command.resource_id(2),
            Err(TransactError::ProgramCorruption(_))
        ));
    }

    #[test]
    fn fs_paths_keep_raw_bytes() {
        let staged = Path::new("/var/rt/temporary/stage-\u{e9}.tmp");
        let mut builder = ProgramBuilder::new();
        builder.unlink_fs_path(staged);
        let slot = compile(&builder);
        let program = Program::load(&slot).expect("load");
        let commands = program.commands(Phase::Cleanup).expect("commands");
        assert_eq!(commands[0].fs_path(0).expect("path"), staged);
        assert_eq!(commands[0].phase(), Phase::Cleanup);
    }

    #[test]
    fn truncated_command_is_rejected() {
        let mut program = vec![0u8; 32];
        program[0] = Instruction::Noop as u8;
        LittleEndian::write_u16(&mut program[2..4], 1);
        LittleEndian::write_u32(&mut program[4..8], 8);
        assert!(Command::decode(&program, 0, 32).is_err());
        assert!(Command::decode(&program, 30, 32).is_err());
    }
}

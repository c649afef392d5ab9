//! Binary transaction programs stored in journal slots.
//!
//! A program is a 64-byte header followed by the COMMIT and CLEANUP command
//! streams:
//!
//! | offset | size | field                                    |
//! |--------|------|------------------------------------------|
//! | 0      | 8    | checksum over bytes `8..length`          |
//! | 8      | 1    | checksum algorithm                       |
//! | 9      | 1    | phase bitmask                            |
//! | 12     | 4    | total length                             |
//! | 16     | 16   | node id                                  |
//! | 32     | 8    | revision                                 |
//! | 40     | 8    | COMMIT stream offset and length          |
//! | 48     | 8    | CLEANUP stream offset and length         |

mod builder;
mod command;
mod interpreter;

pub use builder::{CompiledProgram, ProgramBuilder};
pub use command::{Command, Param, ParamType};
pub use interpreter::{ExecutionContext, ExecutionHandler, Interpreter};

use std::fmt::{self, Display};
use std::ops::Range;

use byteorder::{ByteOrder, LittleEndian};

use crate::checksum::ChecksumAlgorithm;
use crate::error::{TransactError, TransactResult};
use crate::ids::NodeId;
use crate::revision::Revision;

pub const PROGRAM_HEADER_LEN: usize = 64;

const CHECKSUM_RANGE: Range<usize> = 0..8;
const ALGORITHM_OFFSET: usize = 8;
const PHASES_OFFSET: usize = 9;
const LENGTH_RANGE: Range<usize> = 12..16;
const NODE_RANGE: Range<usize> = 16..32;
const REVISION_RANGE: Range<usize> = 32..40;
const COMMIT_RANGE: Range<usize> = 40..48;
const CLEANUP_RANGE: Range<usize> = 48..56;

/// Execution phase of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Phase {
    Commit = 0,
    Cleanup = 1,
}

impl Phase {
    pub const ALL: [Phase; 2] = [Phase::Commit, Phase::Cleanup];

    pub fn bit(self) -> u8 {
        1 << self as u8
    }

    pub fn from_raw(raw: u8) -> TransactResult<Self> {
        match raw {
            0 => Ok(Phase::Commit),
            1 => Ok(Phase::Cleanup),
            other => Err(TransactError::program_corruption(format!(
                "unknown phase {other}"
            ))),
        }
    }
}

impl Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Commit => f.write_str("commit"),
            Phase::Cleanup => f.write_str("cleanup"),
        }
    }
}

const KNOWN_PHASE_BITS: u8 = 0b11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Instruction {
    Noop = 0,
    UnlinkFsPath = 1,
    UnlinkRtPath = 2,
    RemoveResource = 3,
    UpdateResource = 4,
    AddPath = 5,
    AddResourceId = 6,
    LinkNewResource = 7,
    LinkResourceToRtPath = 8,
}

impl Instruction {
    pub fn from_raw(raw: u8) -> TransactResult<Self> {
        Ok(match raw {
            0 => Instruction::Noop,
            1 => Instruction::UnlinkFsPath,
            2 => Instruction::UnlinkRtPath,
            3 => Instruction::RemoveResource,
            4 => Instruction::UpdateResource,
            5 => Instruction::AddPath,
            6 => Instruction::AddResourceId,
            7 => Instruction::LinkNewResource,
            8 => Instruction::LinkResourceToRtPath,
            other => {
                return Err(TransactError::program_corruption(format!(
                    "unknown instruction {other}"
                )));
            }
        })
    }
}

/// Decoded program header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeader {
    pub checksum: u64,
    pub algorithm: u8,
    pub phases: u8,
    pub length: u32,
    pub node: NodeId,
    pub revision: Revision,
    pub commit: (u32, u32),
    pub cleanup: (u32, u32),
}

impl ProgramHeader {
    pub fn has_phase(&self, phase: Phase) -> bool {
        self.phases & phase.bit() != 0
    }

    pub fn stream(&self, phase: Phase) -> Range<usize> {
        let (pos, len) = match phase {
            Phase::Commit => self.commit,
            Phase::Cleanup => self.cleanup,
        };
        pos as usize..pos as usize + len as usize
    }

    fn decode(src: &[u8]) -> TransactResult<Self> {
        if src.len() < PROGRAM_HEADER_LEN {
            return Err(TransactError::program_corruption("program header truncated"));
        }
        let pair = |range: Range<usize>| {
            (
                LittleEndian::read_u32(&src[range.start..range.start + 4]),
                LittleEndian::read_u32(&src[range.start + 4..range.end]),
            )
        };
        Ok(Self {
            checksum: LittleEndian::read_u64(&src[CHECKSUM_RANGE]),
            algorithm: src[ALGORITHM_OFFSET],
            phases: src[PHASES_OFFSET],
            length: LittleEndian::read_u32(&src[LENGTH_RANGE]),
            node: NodeId::decode(&src[NODE_RANGE])?,
            revision: Revision::decode(&src[REVISION_RANGE])?,
            commit: pair(COMMIT_RANGE),
            cleanup: pair(CLEANUP_RANGE),
        })
    }

    fn encode_into(&self, dst: &mut [u8]) {
        dst[..PROGRAM_HEADER_LEN].fill(0);
        LittleEndian::write_u64(&mut dst[CHECKSUM_RANGE], self.checksum);
        dst[ALGORITHM_OFFSET] = self.algorithm;
        dst[PHASES_OFFSET] = self.phases;
        LittleEndian::write_u32(&mut dst[LENGTH_RANGE], self.length);
        dst[NODE_RANGE].copy_from_slice(self.node.as_bytes());
        self.revision.encode(&mut dst[REVISION_RANGE]);
        for (range, (pos, len)) in [(COMMIT_RANGE, self.commit), (CLEANUP_RANGE, self.cleanup)] {
            LittleEndian::write_u32(&mut dst[range.start..range.start + 4], pos);
            LittleEndian::write_u32(&mut dst[range.start + 4..range.end], len);
        }
    }
}

/// Read-only view of a program at the start of a journal slot.
#[derive(Clone, Copy)]
pub struct Program<'a> {
    bytes: &'a [u8],
    header: ProgramHeader,
}

impl<'a> Program<'a> {
    /// Decodes and fully validates the program held in `slot`.
    pub fn load(slot: &'a [u8]) -> TransactResult<Self> {
        let header = ProgramHeader::decode(slot)?;
        let program = Self {
            bytes: slot,
            header,
        };
        program.validate()?;
        Ok(program)
    }

    /// Whether `slot` holds a committed program whose checksum verifies.
    pub fn is_valid(slot: &[u8]) -> bool {
        Program::load(slot).is_ok()
    }

    fn validate(&self) -> TransactResult<()> {
        let header = &self.header;
        let algorithm = ChecksumAlgorithm::try_from(header.algorithm)
            .map_err(|err| TransactError::program_corruption(err.to_string()))?;
        let length = header.length as usize;
        if length < PROGRAM_HEADER_LEN || length > self.bytes.len() {
            return Err(TransactError::program_corruption(format!(
                "program length {length} outside [{PROGRAM_HEADER_LEN}, {}]",
                self.bytes.len()
            )));
        }
        if header.phases & !KNOWN_PHASE_BITS != 0 {
            return Err(TransactError::program_corruption(format!(
                "unknown phase bits {:#04x}",
                header.phases
            )));
        }
        for phase in Phase::ALL {
            let stream = header.stream(phase);
            if !header.has_phase(phase) {
                if !stream.is_empty() {
                    return Err(TransactError::program_corruption(format!(
                        "{phase} stream present but phase not compiled"
                    )));
                }
                continue;
            }
            if stream.start < PROGRAM_HEADER_LEN || stream.end > length {
                return Err(TransactError::program_corruption(format!(
                    "{phase} stream {}..{} outside program of {length} bytes",
                    stream.start, stream.end
                )));
            }
        }
        let actual = algorithm.compute(&self.bytes[CHECKSUM_RANGE.end..length]);
        if actual != header.checksum {
            return Err(TransactError::program_corruption(format!(
                "program checksum mismatch: expected {:#018x}, found {actual:#018x}",
                header.checksum
            )));
        }
        Ok(())
    }

    pub fn header(&self) -> &ProgramHeader {
        &self.header
    }

    pub fn node(&self) -> NodeId {
        self.header.node
    }

    pub fn revision(&self) -> Revision {
        self.header.revision
    }

    /// The program's bytes, up to its declared length.
    pub fn as_bytes(&self) -> &'a [u8] {
        &self.bytes[..self.header.length as usize]
    }

    /// Decodes every command of `phase` in staging order.
    pub fn commands(&self, phase: Phase) -> TransactResult<Vec<Command<'a>>> {
        if !self.header.has_phase(phase) {
            return Ok(Vec::new());
        }
        let stream = self.header.stream(phase);
        let program = self.as_bytes();
        let mut commands = Vec::new();
        let mut offset = stream.start;
        while offset < stream.end {
            let command = Command::decode(program, offset, stream.end)?;
            if command.phase() != phase {
                return Err(TransactError::program_corruption(format!(
                    "command at {offset} belongs to {} but sits in the {phase} stream",
                    command.phase()
                )));
            }
            offset += command.len();
            commands.push(command);
        }
        Ok(commands)
    }
}

impl fmt::Debug for Program<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("node", &self.header.node)
            .field("revision", &self.header.revision)
            .field("length", &self.header.length)
            .field("phases", &self.header.phases)
            .finish()
    }
}

/// Reads the revision recorded in a slot without validating the program.
pub fn peek_revision(slot: &[u8]) -> Option<Revision> {
    ProgramHeader::decode(slot).ok().map(|header| header.revision)
}

use std::fmt::{self, Display};
use std::str::FromStr;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::error::{TransactError, TransactResult};

/// Serialized size of a revision.
pub const REVISION_LEN: usize = 8;

/// Monotonic MVCC snapshot identifier.
///
/// Ordering is plain unsigned comparison. [`Revision::ZERO`] sorts before every
/// allocated revision and [`Revision::INFINITY`] after all of them; neither is
/// ever handed out by the pool.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Revision(u64);

impl Revision {
    pub const ZERO: Revision = Revision(0);
    pub const INFINITY: Revision = Revision(u64::MAX);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self == Self::ZERO
    }

    pub fn is_infinity(self) -> bool {
        self == Self::INFINITY
    }

    pub fn is_before_or_same(self, other: Revision) -> bool {
        self <= other
    }

    pub fn is_after(self, other: Revision) -> bool {
        self > other
    }

    /// Fixed-width lower-case hex form used in file names.
    pub fn unique_identifier(self) -> String {
        format!("{:016x}", self.0)
    }

    pub fn encode(self, dst: &mut [u8]) {
        LittleEndian::write_u64(&mut dst[..REVISION_LEN], self.0);
    }

    pub fn decode(src: &[u8]) -> TransactResult<Self> {
        if src.len() < REVISION_LEN {
            return Err(TransactError::corruption("revision truncated"));
        }
        Ok(Self(LittleEndian::read_u64(&src[..REVISION_LEN])))
    }
}

impl FromStr for Revision {
    type Err = TransactError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > 16 {
            return Err(TransactError::invalid_argument(format!(
                "invalid revision identifier: {s:?}"
            )));
        }
        u64::from_str_radix(s, 16)
            .map(Revision)
            .map_err(|_| TransactError::invalid_argument(format!("invalid revision identifier: {s:?}")))
    }
}

impl Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Revision::ZERO => write!(f, "r-zero"),
            Revision::INFINITY => write!(f, "r-infinity"),
            Revision(value) => write!(f, "r{value:x}"),
        }
    }
}

impl From<u64> for Revision {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Revision> for u64 {
    fn from(value: Revision) -> Self {
        value.0
    }
}

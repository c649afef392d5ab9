use crc64fast_nvme::Digest;
use serde::{Deserialize, Serialize};

use crate::error::{TransactError, TransactResult};

/// Checksum algorithms understood by the revision table and the journal.
///
/// The tag is persisted next to every checksum, so entries written with one
/// algorithm remain verifiable after the preferred algorithm is changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ChecksumAlgorithm {
    Crc32 = 0,
    #[default]
    Crc64Nvme = 1,
}

impl TryFrom<u8> for ChecksumAlgorithm {
    type Error = TransactError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => ChecksumAlgorithm::Crc32,
            1 => ChecksumAlgorithm::Crc64Nvme,
            _ => {
                return Err(TransactError::corruption(format!(
                    "unknown checksum algorithm: {value}"
                )));
            }
        })
    }
}

impl ChecksumAlgorithm {
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Computes the checksum over a sequence of byte ranges as if they were contiguous.
    pub fn compute_parts(self, parts: &[&[u8]]) -> u64 {
        match self {
            ChecksumAlgorithm::Crc32 => {
                let mut hasher = crc32fast::Hasher::new();
                for part in parts {
                    hasher.update(part);
                }
                u64::from(hasher.finalize())
            }
            ChecksumAlgorithm::Crc64Nvme => {
                let mut digest = Digest::new();
                for part in parts {
                    digest.write(part);
                }
                digest.sum64()
            }
        }
    }

    pub fn compute(self, bytes: &[u8]) -> u64 {
        self.compute_parts(&[bytes])
    }

    pub fn verify(self, bytes: &[u8], expected: u64) -> TransactResult<()> {
        let actual = self.compute(bytes);
        if actual != expected {
            return Err(TransactError::corruption(format!(
                "checksum mismatch ({self:?}): expected {expected:#018x}, found {actual:#018x}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts_match_contiguous_input() {
        for algorithm in [ChecksumAlgorithm::Crc32, ChecksumAlgorithm::Crc64Nvme] {
            let whole = algorithm.compute(b"hello world");
            let split = algorithm.compute_parts(&[b"hello", b" ", b"world"]);
            assert_eq!(whole, split);
        }
    }

    #[test]
    fn tag_roundtrip_and_unknown_tag() {
        assert_eq!(
            ChecksumAlgorithm::try_from(ChecksumAlgorithm::Crc32.tag()).expect("tag"),
            ChecksumAlgorithm::Crc32
        );
        assert!(matches!(
            ChecksumAlgorithm::try_from(0xFF),
            Err(TransactError::Corruption(_))
        ));
    }

    #[test]
    fn verify_detects_mismatch() {
        let algorithm = ChecksumAlgorithm::default();
        let sum = algorithm.compute(b"payload");
        algorithm.verify(b"payload", sum).expect("verify");
        assert!(algorithm.verify(b"pAyload", sum).is_err());
    }
}

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{TransactError, TransactResult};

/// Encoded size of both identifier types.
pub const ID_LEN: usize = 16;

/// Identifies one shard of the path namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        self.0.as_bytes()
    }

    pub fn decode(src: &[u8]) -> TransactResult<Self> {
        decode_uuid(src, "node id").map(Self)
    }

    /// Directory name used under `paths/` and `reverse/`.
    pub fn as_dir_name(&self) -> String {
        self.0.simple().to_string()
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for NodeId {
    type Err = TransactError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|err| TransactError::invalid_argument(format!("invalid node id {s:?}: {err}")))
    }
}

/// Globally unique identifier of one stored resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(Uuid);

impl ResourceId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        self.0.as_bytes()
    }

    pub fn decode(src: &[u8]) -> TransactResult<Self> {
        decode_uuid(src, "resource id").map(Self)
    }

    /// Directory name used under `resources/` and `reverse/<node>/`.
    pub fn as_dir_name(&self) -> String {
        self.0.simple().to_string()
    }

    /// Parses a directory name produced by [`ResourceId::as_dir_name`].
    pub fn from_dir_name(name: &str) -> TransactResult<Self> {
        name.parse()
    }
}

impl Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for ResourceId {
    type Err = TransactError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self).map_err(|err| {
            TransactError::invalid_argument(format!("invalid resource id {s:?}: {err}"))
        })
    }
}

fn decode_uuid(src: &[u8], what: &str) -> TransactResult<Uuid> {
    let bytes: [u8; ID_LEN] = src
        .get(..ID_LEN)
        .and_then(|raw| raw.try_into().ok())
        .ok_or_else(|| TransactError::corruption(format!("{what} truncated")))?;
    Ok(Uuid::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_names_parse_back() {
        let id = ResourceId::random();
        assert_eq!(ResourceId::from_dir_name(&id.as_dir_name()).expect("parse"), id);
        assert_eq!(id.as_dir_name().len(), 32);
        assert!(ResourceId::from_dir_name("tombstone").is_err());
    }

    #[test]
    fn decode_requires_full_width() {
        let node = NodeId::random();
        assert_eq!(NodeId::decode(node.as_bytes()).expect("decode"), node);
        assert!(NodeId::decode(&node.as_bytes()[..8]).is_err());
    }
}

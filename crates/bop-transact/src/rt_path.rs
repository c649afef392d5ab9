use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{TransactError, TransactResult};

/// Final component marking a wildcard path.
pub const WILDCARD: &str = "*";

/// Hierarchical, node-scoped logical path.
///
/// Written as `/a/b/c`. A trailing `*` component turns the path into a
/// wildcard that matches every path below its prefix; wildcards are only
/// accepted by listing and bulk operations.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RtPath {
    components: Vec<String>,
    wildcard: bool,
}

impl RtPath {
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
            wildcard: false,
        }
    }

    pub fn parse(raw: &str) -> TransactResult<Self> {
        let trimmed = raw.strip_prefix('/').unwrap_or(raw);
        let mut components = Vec::new();
        let mut wildcard = false;
        if !trimmed.is_empty() {
            let parts: Vec<&str> = trimmed.split('/').collect();
            for (idx, part) in parts.iter().enumerate() {
                if *part == WILDCARD {
                    if idx + 1 != parts.len() {
                        return Err(TransactError::invalid_argument(format!(
                            "wildcard must be the last component: {raw:?}"
                        )));
                    }
                    wildcard = true;
                    continue;
                }
                validate_component(part)
                    .map_err(|reason| TransactError::invalid_argument(format!("{raw:?}: {reason}")))?;
                components.push((*part).to_string());
            }
        }
        Ok(Self {
            components,
            wildcard,
        })
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty() && !self.wildcard
    }

    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    /// The non-wildcard part of the path.
    pub fn prefix(&self) -> RtPath {
        Self {
            components: self.components.clone(),
            wildcard: false,
        }
    }

    pub fn parent(&self) -> Option<RtPath> {
        if self.components.is_empty() {
            return None;
        }
        Some(Self {
            components: self.components[..self.components.len() - 1].to_vec(),
            wildcard: false,
        })
    }

    pub fn child(&self, name: &str) -> TransactResult<RtPath> {
        validate_component(name).map_err(TransactError::invalid_argument)?;
        let mut components = self.components.clone();
        components.push(name.to_string());
        Ok(Self {
            components,
            wildcard: false,
        })
    }

    /// Whether a concrete path falls under this one (itself, or below the prefix of a wildcard).
    pub fn matches(&self, other: &RtPath) -> bool {
        if other.wildcard {
            return false;
        }
        if self.wildcard {
            other.components.len() > self.components.len()
                && other.components.starts_with(&self.components)
        } else {
            self.components == other.components
        }
    }

    /// Rejects wildcards and the root, which cannot carry a mapping.
    pub fn ensure_linkable(&self) -> TransactResult<()> {
        if self.wildcard {
            return Err(TransactError::invalid_argument(format!(
                "wildcard path {self} cannot be linked or unlinked"
            )));
        }
        if self.components.is_empty() {
            return Err(TransactError::invalid_argument("the root path cannot be linked"));
        }
        Ok(())
    }
}

fn validate_component(part: &str) -> Result<(), String> {
    if part.is_empty() {
        return Err("empty path component".to_string());
    }
    if part == "." || part == ".." {
        return Err(format!("reserved path component {part:?}"));
    }
    if part.contains('/') || part.contains('\0') {
        return Err(format!("illegal character in path component {part:?}"));
    }
    if part == WILDCARD {
        return Err("wildcard must be the last component".to_string());
    }
    Ok(())
}

impl Display for RtPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.components.is_empty() && !self.wildcard {
            return f.write_str("/");
        }
        for component in &self.components {
            write!(f, "/{component}")?;
        }
        if self.wildcard {
            write!(f, "/{WILDCARD}")?;
        }
        Ok(())
    }
}

impl FromStr for RtPath {
    type Err = TransactError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RtPath::parse(s)
    }
}

impl TryFrom<String> for RtPath {
    type Error = TransactError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        RtPath::parse(&value)
    }
}

impl From<RtPath> for String {
    fn from(value: RtPath) -> Self {
        value.to_string()
    }
}

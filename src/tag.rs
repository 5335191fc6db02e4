use crate::error::SquashError;
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_TAG: &str = "latest";

/// A `repository[:tag]` reference for the squashed image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRef {
    pub repository: String,
    pub tag: String,
}

impl FromStr for TagRef {
    type Err = SquashError;

    /// Splits on the last colon, unless that colon belongs to a registry
    /// host port (`localhost:5000/app`), in which case the tag defaults.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || SquashError::Validation(format!("bad tag format: {s}"));

        let (repository, tag) = match s.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => (repo, tag),
            _ => (s, DEFAULT_TAG),
        };
        if repository.is_empty() || tag.is_empty() {
            return Err(bad());
        }
        Ok(TagRef {
            repository: repository.to_string(),
            tag: tag.to_string(),
        })
    }
}

impl fmt::Display for TagRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

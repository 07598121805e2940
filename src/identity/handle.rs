use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{GistError, Result};

/// Public username: one uppercase ASCII letter followed by one or more
/// ASCII digits (`A1`, `B42`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdentityHandle(String);

pub fn is_valid_handle(candidate: &str) -> bool {
    let mut chars = candidate.chars();
    match chars.next() {
        Some(first) if first.is_ascii_uppercase() => {}
        _ => return false,
    }
    let rest = chars.as_str();
    !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
}

impl IdentityHandle {
    pub fn parse(candidate: &str) -> Result<Self> {
        if !is_valid_handle(candidate) {
            return Err(GistError::Validation(format!(
                "ID must be a letter followed by digits (e.g. A1), got {candidate:?}"
            )));
        }
        Ok(Self(candidate.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for IdentityHandle {
    type Err = GistError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for IdentityHandle {
    type Error = GistError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<IdentityHandle> for String {
    fn from(handle: IdentityHandle) -> Self {
        handle.0
    }
}

impl fmt::Display for IdentityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

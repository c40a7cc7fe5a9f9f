use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity of the user that owns a set of rules and messages. Every query
/// against the rule store is filtered by this value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OwnerId(String);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OwnerError {
    #[error("owner user id is required")]
    Missing,
    #[error("owner user id must not be blank")]
    Blank,
}

impl OwnerId {
    pub fn parse(value: impl AsRef<str>) -> Result<Self, OwnerError> {
        let trimmed = value.as_ref().trim();
        if trimmed.is_empty() {
            return Err(OwnerError::Blank);
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Validate an optional identity as received from a caller.
    pub fn require(value: Option<&str>) -> Result<Self, OwnerError> {
        match value {
            Some(value) => Self::parse(value),
            None => Err(OwnerError::Missing),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for OwnerId {
    type Error = OwnerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<OwnerId> for String {
    fn from(value: OwnerId) -> Self {
        value.0
    }
}

/// Which owners a classification batch covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerScope {
    User(OwnerId),
    /// Global sweep across every owner's pending messages.
    AllUsers,
}

impl OwnerScope {
    /// Scope a batch to the caller's identity. The global sweep is never
    /// inferred from a missing or blank id; it has to be requested explicitly.
    pub fn user(value: Option<&str>) -> Result<Self, OwnerError> {
        OwnerId::require(value).map(OwnerScope::User)
    }

    pub fn owner(&self) -> Option<&OwnerId> {
        match self {
            OwnerScope::User(owner) => Some(owner),
            OwnerScope::AllUsers => None,
        }
    }
}

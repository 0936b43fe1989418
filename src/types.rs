//! Identifier types shared across the engine

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque round identifier, assigned at creation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoundId(String);

impl RoundId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RoundId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RoundId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable player identifier supplied by the identity provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(String);

impl PlayerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PlayerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PlayerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_ids_are_unique() {
        assert_ne!(RoundId::generate(), RoundId::generate());
    }

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        let id = PlayerId::from("alice");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"alice\"");
    }
}

//! Registration secret shared between the distributor and every node.
//!
//! An empty secret disables verification (not recommended) — the same
//! convention as the daemon's local auth token.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// A secret that matches everything — verification disabled.
    pub fn none() -> Self {
        Self(String::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Compare against the secret presented by a registering node.
    ///
    /// An empty distributor secret accepts any node; a non-empty secret
    /// requires an exact match.
    pub fn matches(&self, presented: &Secret) -> bool {
        self.0.is_empty() || self.0 == presented.0
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

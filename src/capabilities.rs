//! Capability sets and the stereotype matching predicate.
//!
//! A capability set is an open mapping from string keys to JSON values. The
//! distributor never interprets individual keys — matching is a pure
//! structural predicate evaluated on the node side.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::GridError;

/// An open string → JSON mapping describing a browser kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(Map<String, Value>);

impl Capabilities {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build from a JSON value; `None` unless the value is an object.
    pub fn from_value(value: &Value) -> Option<Self> {
        value.as_object().map(|map| Self(map.clone()))
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Asymmetric matching: this stereotype matches `requested` iff every key
    /// present in the request is present here with an equal value. Keys the
    /// stereotype carries beyond the request are allowed.
    pub fn matches(&self, requested: &Capabilities) -> bool {
        requested
            .0
            .iter()
            .all(|(key, value)| self.0.get(key) == Some(value))
    }

    /// Merge `other` on top of `self`, failing when a key is present in both
    /// with different values.
    fn merged_with(&self, other: &Capabilities) -> Result<Capabilities, GridError> {
        let mut merged = self.0.clone();
        for (key, value) in &other.0 {
            match merged.get(key) {
                Some(existing) if existing != value => {
                    return Err(GridError::InvalidPayload(format!(
                        "capability '{key}' appears in both alwaysMatch and firstMatch with different values"
                    )));
                }
                _ => {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(Capabilities(merged))
    }
}

impl From<Map<String, Value>> for Capabilities {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Wire payload of `POST /se/grid/distributor/session`:
/// `{"capabilities": {"alwaysMatch": {...}, "firstMatch": [{...}, ...]}}`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionPayload {
    #[serde(default)]
    pub always_match: Capabilities,
    #[serde(default)]
    pub first_match: Vec<Capabilities>,
}

impl NewSessionPayload {
    /// Parse the request body. Malformed input is an `invalid argument`.
    pub fn parse(body: &Value) -> Result<Self, GridError> {
        let caps = body
            .get("capabilities")
            .ok_or_else(|| GridError::InvalidPayload("missing 'capabilities' key".into()))?;
        serde_json::from_value(caps.clone())
            .map_err(|e| GridError::InvalidPayload(e.to_string()))
    }

    /// The set of desired-capability alternatives: the cartesian merge of
    /// `alwaysMatch` with each `firstMatch` entry, in `firstMatch` order. An
    /// empty `firstMatch` yields the single `alwaysMatch` alternative.
    pub fn alternatives(&self) -> Result<Vec<Capabilities>, GridError> {
        if self.first_match.is_empty() {
            return Ok(vec![self.always_match.clone()]);
        }
        self.first_match
            .iter()
            .map(|first| self.always_match.merged_with(first))
            .collect()
    }
}

//! Rate limit policies and key-prefix matching.
//!
//! A [`PolicySet`] maps identifiers to the rate and burst their limiter should
//! be created with. Rules match on key prefix; the longest matching prefix
//! wins, and keys no rule matches fall back to the default policy.

use serde::{Deserialize, Serialize};

use super::limiter::Rate;
use crate::error::{KeyrateError, Result};

/// Default sustained rate when no policy is configured.
const DEFAULT_RATE: Rate = Rate(10.0);
/// Default burst when no policy is configured.
const DEFAULT_BURST: u32 = 20;

/// Rate and burst for a single limiter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Sustained permits per second
    pub rate: Rate,
    /// Maximum instantaneous permits
    pub burst: u32,
}

impl Policy {
    /// Create a policy, rejecting negative or NaN rates.
    pub fn new(rate: f64, burst: u32) -> Result<Self> {
        Ok(Self {
            rate: Rate::per_second(rate)?,
            burst,
        })
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            rate: DEFAULT_RATE,
            burst: DEFAULT_BURST,
        }
    }
}

/// A policy applied to every key starting with `prefix`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Key prefix to match (an empty prefix matches every key)
    pub prefix: String,
    /// Sustained permits per second
    pub rate: Rate,
    /// Maximum instantaneous permits
    pub burst: u32,
    /// Optional name/description for this rule
    #[serde(default)]
    pub name: Option<String>,
}

impl PolicyRule {
    /// The policy this rule assigns.
    pub fn policy(&self) -> Policy {
        Policy {
            rate: self.rate,
            burst: self.burst,
        }
    }
}

/// An ordered table of prefix rules with a fallback policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicySet {
    /// Policy for keys that match no rule
    #[serde(default)]
    pub default: Policy,
    /// Prefix rules
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

impl PolicySet {
    /// Load a policy set from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| KeyrateError::Config(format!("Failed to parse policies: {}", e)))
    }

    /// The rule matching `key`, if any.
    ///
    /// The longest matching prefix wins; among equal prefixes the first
    /// declared rule wins.
    pub fn find_rule(&self, key: &str) -> Option<&PolicyRule> {
        let mut best: Option<&PolicyRule> = None;

        for rule in &self.rules {
            if !key.starts_with(rule.prefix.as_str()) {
                continue;
            }
            match best {
                Some(current) if current.prefix.len() >= rule.prefix.len() => {}
                _ => best = Some(rule),
            }
        }

        best
    }

    /// The policy a limiter for `key` should be created with.
    pub fn resolve(&self, key: &str) -> Policy {
        self.find_rule(key)
            .map(PolicyRule::policy)
            .unwrap_or(self.default)
    }
}

//! Configuration gate
//!
//! Before touching a vendor API a plugin asks the gate whether every
//! environment value it needs is present. The check is all-or-nothing: a
//! single missing or placeholder value closes the gate and the plugin falls
//! back to writing blank datasets. A closed gate is normal operation for an
//! unconfigured vendor, not an error.
//!
//! The environment is an explicit [`Environment`] snapshot owned by the
//! engine context. Overrides are written into the snapshot, never into the
//! process environment.

use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

/// Value deployments leave in unconfigured variables
pub const PLACEHOLDER: &str = "CHANGE ME";

/// Ambient key/value environment
#[derive(Debug, Default)]
pub struct Environment {
    vars: RwLock<HashMap<String, String>>,
}

impl Environment {
    /// Snapshot the process environment
    pub fn from_process() -> Self {
        Self::from_pairs(std::env::vars())
    }

    /// Build from explicit pairs
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: RwLock::new(
                pairs
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.vars.read().get(name).cloned()
    }

    /// Value when present and not the placeholder; an empty value counts
    pub fn configured(&self, name: &str) -> Option<String> {
        self.get(name).filter(|v| is_configured(v))
    }

    /// Configured and non-empty, for knobs that fall back to a default
    pub fn setting(&self, name: &str) -> Option<String> {
        self.configured(name).filter(|v| !v.is_empty())
    }

    /// Value or a default when unset
    pub fn get_or(&self, name: &str, default: &str) -> String {
        self.get(name).unwrap_or_else(|| default.to_string())
    }

    pub fn set(&self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.write().insert(name.into(), value.into());
    }

    /// Run a gate check against this environment
    pub fn check(&self, requirements: &Requirements) -> GateDecision {
        requirements.check(self)
    }
}

fn is_configured(value: &str) -> bool {
    value != PLACEHOLDER
}

/// Ordered list of names a plugin needs, some with forced values
#[derive(Debug, Clone, Default)]
pub struct Requirements {
    entries: Vec<(String, Option<String>)>,
}

impl Requirements {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name must be present and not the placeholder
    pub fn require(mut self, name: impl Into<String>) -> Self {
        self.entries.push((name.into(), None));
        self
    }

    /// Name is satisfied by `value`, which is also written to the environment
    pub fn with_override(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.push((name.into(), Some(value.into())));
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// Resolve every entry; overrides are applied only if the gate opens
    pub fn check(&self, env: &Environment) -> GateDecision {
        let mut resolved = HashMap::with_capacity(self.entries.len());
        let mut missing = Vec::new();

        for (name, forced) in &self.entries {
            match forced {
                Some(value) => {
                    resolved.insert(name.clone(), value.clone());
                }
                None => match env.configured(name) {
                    Some(value) => {
                        resolved.insert(name.clone(), value);
                    }
                    None => missing.push(name.clone()),
                },
            }
        }

        if !missing.is_empty() {
            debug!(missing = ?missing, "gate closed, running in placeholder mode");
            return GateDecision::Skip { missing };
        }

        for (name, forced) in &self.entries {
            if let Some(value) = forced {
                env.set(name.clone(), value.clone());
            }
        }

        GateDecision::Open(GateConfig { values: resolved })
    }
}

/// Resolved values of an open gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateConfig {
    values: HashMap<String, String>,
}

impl GateConfig {
    /// Value of a required name
    ///
    /// Every required name is present once the gate is open; asking for
    /// anything else yields an empty string.
    pub fn get(&self, name: &str) -> &str {
        self.values.get(name).map(String::as_str).unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Outcome of a gate check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Open(GateConfig),
    /// Placeholder mode, with the names that were missing
    Skip { missing: Vec<String> },
}

impl GateDecision {
    pub fn is_open(&self) -> bool {
        matches!(self, GateDecision::Open(_))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn env() -> Environment {
        Environment::from_pairs([
            ("OKTA_DOMAIN", "example.okta.com"),
            ("OKTA_TOKEN", "secret"),
            ("KNOWBE4_TOKEN", PLACEHOLDER),
            ("EMPTY", ""),
        ])
    }

    #[test]
    fn test_open_when_all_present() {
        let reqs = Requirements::new().require("OKTA_DOMAIN").require("OKTA_TOKEN");
        let decision = env().check(&reqs);
        assert!(decision.is_open());
        if let GateDecision::Open(cfg) = decision {
            assert_eq!(cfg.get("OKTA_DOMAIN"), "example.okta.com");
            assert_eq!(cfg.get("OKTA_TOKEN"), "secret");
            assert_eq!(cfg.len(), 2);
        }
    }

    #[test]
    fn test_placeholder_closes_gate() {
        let reqs = Requirements::new().require("KNOWBE4_TOKEN");
        assert_eq!(
            env().check(&reqs),
            GateDecision::Skip {
                missing: vec!["KNOWBE4_TOKEN".to_string()]
            }
        );
    }

    #[test]
    fn test_missing_closes_gate() {
        let reqs = Requirements::new()
            .require("OKTA_TOKEN")
            .require("NOT_SET")
            .require("EMPTY");
        assert_eq!(
            env().check(&reqs),
            GateDecision::Skip {
                missing: vec!["NOT_SET".to_string()]
            }
        );
    }

    #[test]
    fn test_empty_value_is_present() {
        let env = Environment::from_pairs([("X", "")]);
        let GateDecision::Open(cfg) = env.check(&Requirements::new().require("X")) else {
            unreachable!("empty value should open the gate");
        };
        assert_eq!(cfg.get("X"), "");
        assert_eq!(env.configured("X").as_deref(), Some(""));
        assert_eq!(env.setting("X"), None);
    }

    #[test]
    fn test_override_satisfies_and_is_written_back() {
        let env = env();
        let reqs = Requirements::new()
            .require("OKTA_TOKEN")
            .with_override("KNOWBE4_ENDPOINT", "https://us.api.knowbe4.com");
        assert!(env.check(&reqs).is_open());
        assert_eq!(
            env.get("KNOWBE4_ENDPOINT").as_deref(),
            Some("https://us.api.knowbe4.com")
        );
    }

    #[test]
    fn test_override_not_written_when_gate_closes() {
        let env = env();
        let reqs = Requirements::new()
            .with_override("KNOWBE4_ENDPOINT", "https://us.api.knowbe4.com")
            .require("KNOWBE4_TOKEN");
        assert!(!env.check(&reqs).is_open());
        assert_eq!(env.get("KNOWBE4_ENDPOINT"), None);
    }

    #[test]
    fn test_configured_filters_placeholder() {
        let env = env();
        assert_eq!(env.configured("KNOWBE4_TOKEN"), None);
        assert_eq!(env.configured("OKTA_TOKEN").as_deref(), Some("secret"));
        assert_eq!(env.get_or("MISSING", "x"), "x");
    }
}

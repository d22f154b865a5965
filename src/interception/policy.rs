// src/interception/policy.rs
//! Interception policy
//!
//! Decides, per request URL, whether a connection is parsed and relayed by
//! the HTTP interceptor or tunnelled untouched. Rules are evaluated in load
//! order; the first enabled rule whose pattern occurs anywhere in the URL
//! selects interception.
//!
//! Matching is plain substring containment, so a pattern like `a.com` also
//! matches `http://nota.com.example.net/`.

use crate::utils::errors::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

/// A single intercept rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterceptRule {
    /// Substring searched for in the request URL
    #[serde(rename = "url")]
    pub pattern: String,

    /// Disabled rules never match
    #[serde(rename = "intercept", default)]
    pub enabled: bool,
}

impl InterceptRule {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn matches(&self, url: &str) -> bool {
        self.enabled && url.contains(self.pattern.as_str())
    }
}

/// The loaded rule set, shared read-only by every connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterceptConfig {
    #[serde(rename = "configName", default = "default_name")]
    pub name: String,

    #[serde(rename = "interceptLinks", default)]
    pub rules: Vec<InterceptRule>,
}

fn default_name() -> String {
    "default".to_string()
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            rules: Vec::new(),
        }
    }
}

impl InterceptConfig {
    pub fn new(name: impl Into<String>, rules: Vec<InterceptRule>) -> Self {
        Self {
            name: name.into(),
            rules,
        }
    }

    /// Parse a rule set from JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| ProxyError::ConfigLoad(e.to_string()))
    }

    /// Read and parse the rules file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::ConfigLoad(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    /// Read the rules file, falling back to an empty rule set
    ///
    /// With no rules nothing is intercepted, so a broken file degrades the
    /// proxy to a pure passthrough instead of stopping it.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(config) => {
                info!(
                    "Intercept config '{}' loaded with {} rules ({} enabled)",
                    config.name,
                    config.rules.len(),
                    config.enabled_rules()
                );
                config
            }
            Err(e) => {
                warn!(step = e.step(), "{}; continuing with an empty rule set", e);
                Self::default()
            }
        }
    }

    pub fn enabled_rules(&self) -> usize {
        self.rules.iter().filter(|rule| rule.enabled).count()
    }

    /// Whether a request to `url` should be intercepted
    pub fn should_intercept(&self, url: &str) -> bool {
        decide(url, &self.rules)
    }
}

/// First enabled rule contained in `url` wins; no match means passthrough
pub fn decide(url: &str, rules: &[InterceptRule]) -> bool {
    match rules.iter().find(|rule| rule.matches(url)) {
        Some(rule) => {
            debug!("Rule '{}' matched {}", rule.pattern, url);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "configName": "staging",
        "interceptLinks": [
            { "url": "api.example.com", "intercept": true },
            { "url": "cdn.example.com", "intercept": false }
        ]
    }"#;

    #[test]
    fn test_parse_rules_file_format() {
        let config = InterceptConfig::from_json(SAMPLE).unwrap();
        assert_eq!(config.name, "staging");
        assert_eq!(config.rules.len(), 2);
        assert_eq!(config.rules[0], InterceptRule::new("api.example.com"));
        assert!(!config.rules[1].enabled);
        assert_eq!(config.enabled_rules(), 1);
    }

    #[test]
    fn test_decide_first_enabled_match() {
        let config = InterceptConfig::from_json(SAMPLE).unwrap();
        assert!(config.should_intercept("http://api.example.com/v1/users"));
        assert!(!config.should_intercept("http://cdn.example.com/logo.png"));
        assert!(!config.should_intercept("http://other.org/"));
    }

    #[test]
    fn test_empty_rules_never_intercept() {
        assert!(!decide("http://anything/", &[]));
        assert!(!InterceptConfig::default().should_intercept("http://a/"));
    }

    #[test]
    fn test_substring_semantics_are_broad() {
        let rules = vec![InterceptRule::new("a.com")];
        assert!(decide("http://nota.com.evil.com/", &rules));
        // The empty pattern is contained in every URL
        assert!(decide("http://x/", &[InterceptRule::new("")]));
    }

    #[test]
    fn test_missing_file_falls_back_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = InterceptConfig::load_or_default(dir.path().join("missing.json"));
        assert_eq!(config, InterceptConfig::default());
        assert!(matches!(
            InterceptConfig::load(dir.path().join("missing.json")),
            Err(ProxyError::ConfigLoad(_))
        ));
    }

    #[test]
    fn test_malformed_file_falls_back_to_empty() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(InterceptConfig::load(file.path()).is_err());
        assert!(InterceptConfig::load_or_default(file.path()).rules.is_empty());
    }

    #[test]
    fn test_reload_is_idempotent() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", SAMPLE).unwrap();

        let first = InterceptConfig::load(file.path()).unwrap();
        let second = InterceptConfig::load(file.path()).unwrap();
        assert_eq!(first, second);

        for url in [
            "http://api.example.com/",
            "http://cdn.example.com/",
            "http://example.com/api.example.com",
            "",
        ] {
            assert_eq!(first.should_intercept(url), second.should_intercept(url));
        }
    }

    fn rule_strategy() -> impl Strategy<Value = InterceptRule> {
        ("[a-c.]{0,4}", any::<bool>()).prop_map(|(pattern, enabled)| InterceptRule {
            pattern,
            enabled,
        })
    }

    proptest! {
        #[test]
        fn prop_decide_iff_enabled_substring(
            url in "[a-c./:]{0,16}",
            rules in proptest::collection::vec(rule_strategy(), 0..6),
        ) {
            let expected = rules
                .iter()
                .any(|rule| rule.enabled && url.contains(rule.pattern.as_str()));
            prop_assert_eq!(decide(&url, &rules), expected);
        }

        #[test]
        fn prop_disabled_rules_never_match(
            url in ".{0,24}",
            patterns in proptest::collection::vec(".{0,4}", 0..6),
        ) {
            let rules: Vec<_> = patterns
                .into_iter()
                .map(|p| InterceptRule::new(p).disabled())
                .collect();
            prop_assert!(!decide(&url, &rules));
        }
    }
}

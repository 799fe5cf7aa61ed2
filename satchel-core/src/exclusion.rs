//! Key-name rules for state that must stay on the device.
//!
//! Session flags and per-device UI preferences share the key space with
//! synchronized content. A key matching any rule is never cached from the
//! remote table, never written to it, and ignored when it arrives on the
//! realtime feed.

use regex::RegexSet;

use crate::error::ConfigError;

/// Patterns applied when no explicit list is configured.
pub const DEFAULT_EXCLUSIONS: &[&str] = &[
    r"^sb-",
    r"auth",
    r"session",
    r"^royal-academy-(admin|teacher|student)-logged-in$",
    r"^royal-academy-ui-",
    r"theme$",
];

/// Compiled, immutable set of exclusion patterns.
///
/// The decision for a key cannot change for the lifetime of the value: the
/// set is built once and exposes no mutation.
#[derive(Debug, Clone)]
pub struct ExclusionRules {
    set: RegexSet,
}

impl ExclusionRules {
    /// Compile a list of patterns.
    pub fn new<I, S>(patterns: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns: Vec<String> = patterns
            .into_iter()
            .map(|p| p.as_ref().to_string())
            .collect();

        // RegexSet reports only the first failure without naming the pattern.
        for pattern in &patterns {
            if let Err(e) = regex::Regex::new(pattern) {
                return Err(ConfigError::InvalidPattern {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                });
            }
        }

        let set = RegexSet::new(&patterns).map_err(|e| ConfigError::InvalidPattern {
            pattern: patterns.join(" | "),
            reason: e.to_string(),
        })?;
        Ok(Self { set })
    }

    /// Rules that exclude nothing.
    pub fn none() -> Self {
        Self {
            set: RegexSet::empty(),
        }
    }

    /// Whether `key` stays device-local.
    pub fn is_excluded(&self, key: &str) -> bool {
        self.set.is_match(key)
    }

    /// Whether `key` takes part in remote synchronization.
    pub fn is_synced(&self, key: &str) -> bool {
        !self.is_excluded(key)
    }

    /// The source patterns, in configuration order.
    pub fn patterns(&self) -> &[String] {
        self.set.patterns()
    }
}

impl Default for ExclusionRules {
    fn default() -> Self {
        // The built-in list is a compile-time constant and known to be valid.
        Self {
            set: RegexSet::new(DEFAULT_EXCLUSIONS).unwrap_or_else(|_| RegexSet::empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_rules_exclude_session_state() {
        let rules = ExclusionRules::default();
        assert!(rules.is_excluded("sb-project-auth-token"));
        assert!(rules.is_excluded("royal-academy-admin-logged-in"));
        assert!(rules.is_excluded("royal-academy-ui-sidebar-collapsed"));
        assert!(rules.is_excluded("royal-academy-theme"));
        assert!(rules.is_excluded("user-session"));
    }

    #[test]
    fn test_default_rules_sync_content() {
        let rules = ExclusionRules::default();
        assert!(rules.is_synced("royal-academy-admissions"));
        assert!(rules.is_synced("royal-academy-pricing"));
        assert!(rules.is_synced("royal-academy-timetables"));
    }

    #[test]
    fn test_default_patterns_compile() {
        let rules = ExclusionRules::default();
        assert_eq!(rules.patterns().len(), DEFAULT_EXCLUSIONS.len());
    }

    #[test]
    fn test_invalid_pattern_is_named() {
        let err = ExclusionRules::new(["^ok$", "(unclosed"]).unwrap_err();
        match err {
            ConfigError::InvalidPattern { pattern, .. } => assert_eq!(pattern, "(unclosed"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_none_excludes_nothing() {
        let rules = ExclusionRules::none();
        assert!(rules.is_synced("sb-anything"));
        assert!(rules.patterns().is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// The decision for a key is stable across repeated evaluation and clones.
        #[test]
        fn prop_exclusion_is_stable(key in "[a-z-]{1,32}") {
            let rules = ExclusionRules::default();
            let first = rules.is_excluded(&key);
            let cloned = rules.clone();
            prop_assert_eq!(first, rules.is_excluded(&key));
            prop_assert_eq!(first, cloned.is_excluded(&key));
            prop_assert_eq!(first, !rules.is_synced(&key));
        }
    }
}

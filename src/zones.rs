//! Glob-pattern file ownership map and access decisions.
//!
//! Glob patterns are translated once into anchored [`regex::Regex`] patterns,
//! the same compiled-pattern-struct idiom `validation.rs` uses for its
//! content allowlist/denylist. `**` is translated before `*` so the wider
//! wildcard isn't swallowed by the narrower one's substitution.

use crate::models::{AgentId, DefaultPolicy, ProjectZoneConfig};
use regex::Regex;

#[derive(Debug, Clone, PartialEq)]
pub struct AccessDecision {
    pub allowed: bool,
    pub zone_pattern: Option<String>,
    pub reason: String,
}

struct CompiledZone {
    pattern: String,
    owners: Vec<AgentId>,
    shared: bool,
    regex: Regex,
}

/// Translates a glob pattern into an anchored regular expression.
///
/// `**` matches any sequence of path characters including `/`; `*` matches
/// any sequence not containing `/`; `?` matches one non-slash character.
/// Patterns are case-sensitive.
pub fn glob_to_regex(pattern: &str) -> Regex {
    let mut out = String::with_capacity(pattern.len() * 2 + 2);
    out.push('^');

    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => {
                if i + 1 < chars.len() && chars[i + 1] == '*' {
                    out.push_str(".*");
                    i += 2;
                } else {
                    out.push_str("[^/]*");
                    i += 1;
                }
            }
            '?' => {
                out.push_str("[^/]");
                i += 1;
            }
            c => {
                if regex_syntax::is_meta_character(c) {
                    out.push('\\');
                }
                out.push(c);
                i += 1;
            }
        }
    }

    out.push('$');
    Regex::new(&out).expect("glob translation always produces a valid regex")
}

/// An immutable, compiled view of a project's zone configuration.
pub struct ZoneMatcher {
    zones: Vec<CompiledZone>,
    default_policy: DefaultPolicy,
}

impl ZoneMatcher {
    pub fn new(config: &ProjectZoneConfig) -> Self {
        let zones = config
            .zones
            .iter()
            .map(|zone| CompiledZone {
                pattern: zone.pattern.clone(),
                owners: zone.owners.clone(),
                shared: zone.shared,
                regex: glob_to_regex(&zone.pattern),
            })
            .collect();

        Self {
            zones,
            default_policy: config.default_policy,
        }
    }

    /// First matching zone (declaration order) decides access; falls back to
    /// `default_policy` if nothing matches. Deterministic given the config
    /// and `(path, agent_id)`.
    pub fn check_access(&self, path: &str, agent_id: &str) -> AccessDecision {
        for zone in &self.zones {
            if zone.regex.is_match(path) {
                if zone.shared {
                    return AccessDecision {
                        allowed: true,
                        zone_pattern: Some(zone.pattern.clone()),
                        reason: format!("zone '{}' is shared", zone.pattern),
                    };
                }
                if zone.owners.iter().any(|owner| owner == agent_id) {
                    return AccessDecision {
                        allowed: true,
                        zone_pattern: Some(zone.pattern.clone()),
                        reason: format!("{agent_id} owns zone '{}'", zone.pattern),
                    };
                }
                return AccessDecision {
                    allowed: false,
                    zone_pattern: Some(zone.pattern.clone()),
                    reason: format!(
                        "File is owned by {:?}, not {agent_id}",
                        zone.owners
                    ),
                };
            }
        }

        match self.default_policy {
            DefaultPolicy::Allow => AccessDecision {
                allowed: true,
                zone_pattern: None,
                reason: "unzoned, allowed by default".to_string(),
            },
            DefaultPolicy::Deny => AccessDecision {
                allowed: false,
                zone_pattern: None,
                reason: "unzoned, denied by default".to_string(),
            },
        }
    }

    /// Surfaces the registration-time error for a deny-by-default config with
    /// no zones at all, per the spec: such a project grants no access ever.
    pub fn validate_non_vacuous(&self) -> Result<(), String> {
        if self.zones.is_empty() && self.default_policy == DefaultPolicy::Deny {
            return Err(
                "zone config denies by default with no zones defined: no path is ever accessible"
                    .to_string(),
            );
        }
        Ok(())
    }
}

mod regex_syntax {
    pub fn is_meta_character(c: char) -> bool {
        matches!(
            c,
            '.' | '+'
                | '('
                | ')'
                | '|'
                | '['
                | ']'
                | '{'
                | '}'
                | '^'
                | '$'
                | '\\'
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ZoneDefinition;

    fn config(zones: Vec<ZoneDefinition>, default_policy: DefaultPolicy) -> ProjectZoneConfig {
        ProjectZoneConfig {
            zones,
            default_policy,
        }
    }

    #[test]
    fn double_star_matches_across_slashes() {
        let re = glob_to_regex("src/frontend/**");
        assert!(re.is_match("src/frontend/Button.tsx"));
        assert!(re.is_match("src/frontend/components/Button.tsx"));
        assert!(!re.is_match("src/backend/Button.tsx"));
    }

    #[test]
    fn single_star_does_not_cross_slash() {
        let re = glob_to_regex("src/*.rs");
        assert!(re.is_match("src/main.rs"));
        assert!(!re.is_match("src/sub/main.rs"));
    }

    #[test]
    fn scenario_zone_matcher_deny_for_non_owner() {
        let matcher = ZoneMatcher::new(&config(
            vec![ZoneDefinition {
                pattern: "src/frontend/**".to_string(),
                owners: vec!["ui".to_string()],
                shared: false,
                description: None,
            }],
            DefaultPolicy::Allow,
        ));

        let decision = matcher.check_access("src/frontend/Button.tsx", "backend");
        assert!(!decision.allowed);
        assert!(decision.reason.contains("ui"));
    }

    #[test]
    fn scenario_zone_matcher_default_allow_for_unzoned() {
        let matcher = ZoneMatcher::new(&config(
            vec![ZoneDefinition {
                pattern: "src/frontend/**".to_string(),
                owners: vec!["ui".to_string()],
                shared: false,
                description: None,
            }],
            DefaultPolicy::Allow,
        ));

        let decision = matcher.check_access("README.md", "backend");
        assert!(decision.allowed);
        assert!(decision.reason.contains("unzoned"));
    }

    #[test]
    fn shared_zone_allows_any_agent() {
        let matcher = ZoneMatcher::new(&config(
            vec![ZoneDefinition {
                pattern: "docs/**".to_string(),
                owners: vec![],
                shared: true,
                description: None,
            }],
            DefaultPolicy::Deny,
        ));

        assert!(matcher.check_access("docs/readme.md", "anyone").allowed);
    }

    #[test]
    fn empty_zones_deny_by_default_is_reported_invalid() {
        let matcher = ZoneMatcher::new(&config(vec![], DefaultPolicy::Deny));
        assert!(matcher.validate_non_vacuous().is_err());
    }
}

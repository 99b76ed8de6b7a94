//! Static allow and deny lists.
//!
//! Both lists are built once from comma-separated configuration values and
//! are read-only afterwards, so lookups need no synchronization.

use std::collections::HashSet;

use tracing::info;

/// Result of consulting the override lists for one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Override {
    /// Bypass rate limiting entirely
    Allow,
    /// Reject without consulting the limiter
    Deny,
    /// Fall through to the limiter
    None,
}

/// Allow and deny sets of client identities.
#[derive(Debug, Clone, Default)]
pub struct OverrideLists {
    allow: HashSet<String>,
    deny: HashSet<String>,
}

impl OverrideLists {
    /// Build from comma-separated allow and deny values.
    pub fn from_lists(allow: &str, deny: &str) -> Self {
        let lists = Self {
            allow: parse_list(allow),
            deny: parse_list(deny),
        };

        if !lists.is_empty() {
            info!(
                allowed = lists.allow.len(),
                denied = lists.deny.len(),
                "Loaded client override lists"
            );
        }

        lists
    }

    /// Whether `identity` bypasses the limiter.
    pub fn is_allowed(&self, identity: &str) -> bool {
        self.allow.contains(identity)
    }

    /// Whether `identity` is rejected outright.
    pub fn is_denied(&self, identity: &str) -> bool {
        self.deny.contains(identity)
    }

    /// Look up an identity. Allow takes precedence over deny.
    pub fn check(&self, identity: &str) -> Override {
        if self.is_allowed(identity) {
            Override::Allow
        } else if self.is_denied(identity) {
            Override::Deny
        } else {
            Override::None
        }
    }

    /// True when neither list has any entries.
    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }
}

fn parse_list(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

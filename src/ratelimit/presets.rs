//! Named policies and route bindings.
//!
//! The table is assembled once at startup (built-in presets, optionally
//! extended from a YAML file) and only read afterwards. There is no API to
//! change it in place.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::policy::{IdentifierStrategy, RateLimitPolicy};
use crate::error::{RatewardenError, Result};

const SECOND: u64 = 1_000;
const MINUTE: u64 = 60 * SECOND;
const HOUR: u64 = 60 * MINUTE;

/// Name of the policy used when no route rule matches.
pub const DEFAULT_POLICY: &str = "api";

/// Built-in `(name, window_ms, max_requests)` presets.
pub const PRESETS: &[(&str, u64, u64)] = &[
    // Login, signup, password reset
    ("auth", 15 * MINUTE, 5),
    ("api", MINUTE, 60),
    ("read", MINUTE, 100),
    ("write", MINUTE, 30),
    // One-off operations such as key rotation or account deletion
    ("sensitive", HOUR, 3),
    ("upload", MINUTE, 10),
    ("bulk", 5 * MINUTE, 5),
    ("ai_generate", MINUTE, 40),
    ("ai_analyze", 10 * MINUTE, 8),
];

/// A read-only set of named policies plus path-prefix route bindings.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    policies: HashMap<String, Arc<RateLimitPolicy>>,
    routes: Vec<(String, String)>,
    default_policy: String,
}

/// YAML layout of a policy file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyFile {
    /// Policy used when no route matches
    #[serde(default)]
    pub default_policy: Option<String>,
    /// Custom policies; a name shared with a preset replaces the preset
    #[serde(default)]
    pub policies: Vec<PolicyDefinition>,
    /// Path-prefix bindings
    #[serde(default)]
    pub routes: Vec<RouteRule>,
}

/// A policy as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDefinition {
    pub name: String,
    pub window_ms: u64,
    pub max_requests: u64,
    #[serde(default)]
    pub identifier: IdentifierKind,
    /// Header carrying the user id for the `user` identifier
    #[serde(default)]
    pub user_header: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub status_code: Option<u16>,
}

/// Identifier strategies expressible in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierKind {
    #[default]
    IpAndPath,
    Ip,
    User,
}

/// Binds every request whose path starts with `path_prefix` to `policy`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    pub path_prefix: String,
    pub policy: String,
}

impl PolicyDefinition {
    fn into_policy(self) -> Result<RateLimitPolicy> {
        let identifier = match self.identifier {
            IdentifierKind::IpAndPath => IdentifierStrategy::IpAndPath,
            IdentifierKind::Ip => IdentifierStrategy::Ip,
            IdentifierKind::User => IdentifierStrategy::User {
                header: self.user_header.unwrap_or_else(|| "x-user-id".to_string()),
            },
        };

        let mut policy = RateLimitPolicy::new(Duration::from_millis(self.window_ms), self.max_requests)
            .with_identifier(identifier)
            .scoped(self.name.clone());

        if let Some(message) = self.message {
            policy = policy.with_message(message);
        }
        if let Some(code) = self.status_code {
            let status = http::StatusCode::from_u16(code).map_err(|_| {
                RatewardenError::Config(format!(
                    "policy '{}' has invalid status code {}",
                    self.name, code
                ))
            })?;
            policy = policy.with_status(status);
        }

        policy.validate().map_err(|e| {
            RatewardenError::Config(format!("policy '{}': {}", self.name, e))
        })?;
        Ok(policy)
    }
}

impl PolicyTable {
    /// The built-in presets, no route bindings.
    pub fn presets() -> Self {
        let policies = PRESETS
            .iter()
            .map(|(name, window_ms, max_requests)| {
                let policy = RateLimitPolicy::from_millis(*window_ms, *max_requests).scoped(*name);
                (name.to_string(), Arc::new(policy))
            })
            .collect();

        Self {
            policies,
            routes: Vec::new(),
            default_policy: DEFAULT_POLICY.to_string(),
        }
    }

    /// Load presets extended by a YAML policy file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load presets extended by a YAML policy document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: PolicyFile = serde_yaml::from_str(yaml)?;
        Self::from_policy_file(file)
    }

    /// Build a table from an already parsed policy file.
    pub fn from_policy_file(file: PolicyFile) -> Result<Self> {
        let mut table = Self::presets();

        for definition in file.policies {
            let name = definition.name.clone();
            let policy = definition.into_policy()?;
            table.policies.insert(name, Arc::new(policy));
        }

        for rule in file.routes {
            if !table.policies.contains_key(&rule.policy) {
                return Err(RatewardenError::Config(format!(
                    "route '{}' references unknown policy '{}'",
                    rule.path_prefix, rule.policy
                )));
            }
            table.routes.push((rule.path_prefix, rule.policy));
        }

        if let Some(default_policy) = file.default_policy {
            if !table.policies.contains_key(&default_policy) {
                return Err(RatewardenError::Config(format!(
                    "default policy '{}' is not defined",
                    default_policy
                )));
            }
            table.default_policy = default_policy;
        }

        // Longest prefix first so the most specific binding wins.
        table.routes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        info!(
            policies = table.policies.len(),
            routes = table.routes.len(),
            default = %table.default_policy,
            "Rate limit policies loaded"
        );
        Ok(table)
    }

    /// Look up a policy by name.
    pub fn get(&self, name: &str) -> Option<&Arc<RateLimitPolicy>> {
        self.policies.get(name)
    }

    /// The policy applied when no route matches.
    pub fn default_policy(&self) -> &Arc<RateLimitPolicy> {
        // Construction guarantees the default name is present.
        &self.policies[&self.default_policy]
    }

    pub fn default_policy_name(&self) -> &str {
        &self.default_policy
    }

    /// Name of the policy a route binds to `path`, if any.
    pub fn bound_policy_name(&self, path: &str) -> Option<&str> {
        self.routes
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, name)| name.as_str())
    }

    /// The policy a route binds to `path`, ignoring the default.
    pub fn bound_policy(&self, path: &str) -> Option<&Arc<RateLimitPolicy>> {
        self.bound_policy_name(path).map(|name| &self.policies[name])
    }

    /// Name of the policy governing `path`.
    pub fn policy_name_for_path(&self, path: &str) -> &str {
        self.bound_policy_name(path)
            .unwrap_or(self.default_policy.as_str())
    }

    /// The policy governing `path`: longest matching route prefix, else the
    /// default policy.
    pub fn policy_for_path(&self, path: &str) -> &Arc<RateLimitPolicy> {
        &self.policies[self.policy_name_for_path(path)]
    }

    /// Iterate over `(name, policy)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<RateLimitPolicy>)> {
        self.policies.iter().map(|(name, policy)| (name.as_str(), policy))
    }

    /// Route bindings, most specific first.
    pub fn routes(&self) -> &[(String, String)] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::presets()
    }
}

use std::collections::BTreeMap;
use std::time::Duration;

use bulwark_core::duration::human;
use bulwark_core::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};

use crate::key::{RateLimitKey, Scope};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    SlidingWindow,
    FixedWindow,
    TokenBucket,
}

impl Algorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::TokenBucket => "token_bucket",
        }
    }
}

/// A (limit, window) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRule {
    pub limit: u64,
    #[serde(with = "human")]
    pub window: Duration,
}

impl LimitRule {
    pub fn new(limit: u64, window: Duration) -> Self {
        Self { limit, window }
    }
}

/// Optional per-scope defaults; unset scopes use `default_limit`/`default_window`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeDefaults {
    pub global: Option<LimitRule>,
    pub ip: Option<LimitRule>,
    pub user: Option<LimitRule>,
    pub endpoint: Option<LimitRule>,
}

impl ScopeDefaults {
    fn get(&self, scope: Scope) -> Option<LimitRule> {
        match scope {
            Scope::Global => self.global,
            Scope::Ip => self.ip,
            Scope::User => self.user,
            Scope::Endpoint => self.endpoint,
        }
    }

    fn iter(&self) -> impl Iterator<Item = (Scope, LimitRule)> + '_ {
        [Scope::Global, Scope::Ip, Scope::User, Scope::Endpoint]
            .into_iter()
            .filter_map(|scope| self.get(scope).map(|rule| (scope, rule)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub algorithm: Algorithm,
    pub default_limit: u64,
    #[serde(with = "human")]
    pub default_window: Duration,
    /// Token bucket capacity; 0 means `limit`.
    pub burst_size: u64,
    pub distributed: bool,
    #[serde(with = "human")]
    pub cleanup_interval: Duration,
    pub scopes: ScopeDefaults,
    /// Keyed by request path; applies to every key on that endpoint.
    pub endpoint_limits: BTreeMap<String, LimitRule>,
    /// Keyed by `X-User-ID`.
    pub user_limits: BTreeMap<String, LimitRule>,
    /// Keyed by client address.
    pub ip_limits: BTreeMap<String, LimitRule>,
    pub headers_enabled: bool,
    pub block_on_exceed: bool,
    pub retry_after_enabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::SlidingWindow,
            default_limit: 100,
            default_window: Duration::from_secs(60),
            burst_size: 0,
            distributed: false,
            cleanup_interval: Duration::from_secs(60),
            scopes: ScopeDefaults::default(),
            endpoint_limits: BTreeMap::new(),
            user_limits: BTreeMap::new(),
            ip_limits: BTreeMap::new(),
            headers_enabled: true,
            block_on_exceed: true,
            retry_after_enabled: true,
        }
    }
}

impl RateLimitConfig {
    /// Resolve the rule for `key`: endpoint override, then ip/user
    /// override, then scope default, then the global default.
    pub fn rule_for(&self, key: &RateLimitKey) -> LimitRule {
        if let Some(rule) = self.endpoint_limits.get(&key.endpoint) {
            return *rule;
        }
        let identified = match key.scope {
            Scope::User => self.user_limits.get(&key.identifier),
            Scope::Ip => self.ip_limits.get(&key.identifier),
            Scope::Global | Scope::Endpoint => None,
        };
        if let Some(rule) = identified {
            return *rule;
        }
        self.scopes
            .get(key.scope)
            .unwrap_or(LimitRule::new(self.default_limit, self.default_window))
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let default = LimitRule::new(self.default_limit, self.default_window);
        check_rule(self.distributed, "rate_limiter.default", &default)?;
        ConfigError::ensure(
            !self.cleanup_interval.is_zero(),
            "rate_limiter.cleanup_interval",
            "must be greater than zero",
        )?;

        for (scope, rule) in self.scopes.iter() {
            check_rule(self.distributed, &format!("rate_limiter.scopes.{scope}"), &rule)?;
        }
        let overrides = [
            ("endpoint_limits", &self.endpoint_limits),
            ("user_limits", &self.user_limits),
            ("ip_limits", &self.ip_limits),
        ];
        for (table, rules) in overrides {
            for (id, rule) in rules {
                check_rule(self.distributed, &format!("rate_limiter.{table}.{id}"), rule)?;
            }
        }
        Ok(())
    }
}

fn check_rule(distributed: bool, field: &str, rule: &LimitRule) -> ConfigResult<()> {
    if rule.limit == 0 {
        return Err(ConfigError::invalid(field, "limit must be greater than zero"));
    }
    if rule.window.is_zero() {
        return Err(ConfigError::invalid(field, "window must be greater than zero"));
    }
    // Distributed keys are bucketed by whole epoch seconds.
    if distributed && rule.window.subsec_nanos() != 0 {
        return Err(ConfigError::invalid(
            field,
            "distributed windows must be whole seconds",
        ));
    }
    Ok(())
}

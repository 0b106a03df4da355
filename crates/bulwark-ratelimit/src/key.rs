use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Global,
    Ip,
    User,
    Endpoint,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Ip => "ip",
            Scope::User => "user",
            Scope::Endpoint => "endpoint",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bucket identity. Distinct keys never share a counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub scope: Scope,
    pub identifier: String,
    /// Request path the key applies to; empty for the global key.
    pub endpoint: String,
}

impl RateLimitKey {
    pub fn new(scope: Scope, identifier: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            scope,
            identifier: identifier.into(),
            endpoint: endpoint.into(),
        }
    }

    pub fn global() -> Self {
        Self::new(Scope::Global, "global", "")
    }

    pub fn ip(addr: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self::new(Scope::Ip, addr, endpoint)
    }

    pub fn user(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self::new(Scope::User, id, endpoint)
    }

    pub fn endpoint(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(Scope::Endpoint, path.clone(), path)
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.scope, self.identifier, self.endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_scope_identifier_endpoint() {
        assert_eq!(RateLimitKey::ip("10.0.0.1", "/a").to_string(), "ip:10.0.0.1:/a");
        assert_eq!(RateLimitKey::global().to_string(), "global:global:");
        assert_eq!(RateLimitKey::endpoint("/a").to_string(), "endpoint:/a:/a");
    }

    #[test]
    fn same_identifier_different_scope_is_distinct() {
        assert_ne!(RateLimitKey::ip("x", "/a"), RateLimitKey::user("x", "/a"));
    }
}

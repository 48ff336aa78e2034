// Authenticated caller identity
// Decision: "admin" implies every scope, mirroring the anonymous full-access mode

use serde::{Deserialize, Serialize};

/// Scope names granted to principals.
pub mod scopes {
    /// Submit generation jobs.
    pub const GENERATE: &str = "generate";
    /// Receive broadcast frames.
    pub const FRAMES_READ: &str = "frames:read";
    /// Operational endpoints (dead-letter listing).
    pub const ADMIN: &str = "admin";
    /// Wildcard accepted in API key definitions.
    pub const ANY: &str = "*";
}

/// How a principal was authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// No authentication (anonymous)
    None,
    /// JWT bearer token
    Jwt,
    /// Static API key
    ApiKey,
}

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub subject: String,
    pub scopes: Vec<String>,
    pub method: AuthMethod,
}

impl Principal {
    pub fn new(subject: impl Into<String>, scopes: Vec<String>, method: AuthMethod) -> Self {
        Self {
            subject: subject.into(),
            scopes,
            method,
        }
    }

    /// Anonymous principal used when authentication is disabled
    pub fn anonymous() -> Self {
        Self {
            subject: "anonymous".to_string(),
            scopes: vec![scopes::ADMIN.to_string()],
            method: AuthMethod::None,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.method == AuthMethod::None
    }

    /// Check if the principal holds a scope
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes
            .iter()
            .any(|s| s == scope || s == scopes::ADMIN || s == scopes::ANY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_has_all_scopes() {
        let principal = Principal::anonymous();
        assert!(principal.is_anonymous());
        assert!(principal.has_scope(scopes::GENERATE));
        assert!(principal.has_scope(scopes::FRAMES_READ));
        assert!(principal.has_scope(scopes::ADMIN));
    }

    #[test]
    fn test_scoped_principal() {
        let principal = Principal::new(
            "svc",
            vec![scopes::GENERATE.to_string()],
            AuthMethod::ApiKey,
        );
        assert!(principal.has_scope(scopes::GENERATE));
        assert!(!principal.has_scope(scopes::FRAMES_READ));
        assert!(!principal.has_scope(scopes::ADMIN));
    }

    #[test]
    fn test_wildcard_scope() {
        let principal = Principal::new("svc", vec!["*".to_string()], AuthMethod::Jwt);
        assert!(principal.has_scope(scopes::FRAMES_READ));
    }
}

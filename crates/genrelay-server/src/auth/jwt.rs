// JWT validation
// Decision: Use HS256 algorithm (symmetric key)
// Decision: Tokens are issued elsewhere; this service only validates them

use genrelay_core::{AuthMethod, Principal};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Claims accepted in bearer tokens
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (service or user id)
    pub sub: String,
    /// Granted scopes
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
}

#[derive(Clone)]
pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }

    pub fn validate(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)?;
        Ok(data.claims)
    }

    pub fn authenticate(&self, token: &str) -> Result<Principal, jsonwebtoken::errors::Error> {
        let claims = self.validate(token)?;
        Ok(Principal::new(claims.sub, claims.scopes, AuthMethod::Jwt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token(secret: &str, exp_offset: Duration) -> String {
        let claims = Claims {
            sub: "svc-a".to_string(),
            scopes: vec!["generate".to_string(), "frames:read".to_string()],
            exp: (Utc::now() + exp_offset).timestamp(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_valid_token() {
        let validator = JwtValidator::new("test-secret");
        let principal = validator
            .authenticate(&token("test-secret", Duration::minutes(5)))
            .unwrap();
        assert_eq!(principal.subject, "svc-a");
        assert_eq!(principal.method, AuthMethod::Jwt);
        assert!(principal.has_scope("frames:read"));
    }

    #[test]
    fn test_wrong_secret() {
        let validator = JwtValidator::new("test-secret");
        assert!(validator
            .validate(&token("other-secret", Duration::minutes(5)))
            .is_err());
    }

    #[test]
    fn test_expired_token() {
        let validator = JwtValidator::new("test-secret");
        assert!(validator
            .validate(&token("test-secret", Duration::minutes(-10)))
            .is_err());
    }

    #[test]
    fn test_garbage_token() {
        let validator = JwtValidator::new("test-secret");
        assert!(validator.validate("not-a-jwt").is_err());
    }
}

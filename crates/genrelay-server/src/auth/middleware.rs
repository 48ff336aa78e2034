// Authentication extractors
// Decision: Header auth for services; `?access_token=` for browser WebSocket clients
// Decision: In "none" mode every caller is the anonymous principal with full access

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, FromRef, FromRequestParts, Query},
    http::{header, request::Parts},
    response::{IntoResponse, Response},
};
use genrelay_core::{scopes, GatewayError, Principal};
use serde::Deserialize;

use super::{
    api_key::{ApiKeyRegistry, API_KEY_PREFIX},
    config::{AuthConfig, AuthMode},
    jwt::JwtValidator,
};
use crate::api::ApiError;

/// Authentication failure, rendered with the gateway error body
#[derive(Debug, Clone)]
pub struct AuthError(GatewayError);

impl AuthError {
    pub fn unauthorized(message: &str) -> Self {
        Self(GatewayError::Unauthorized(message.to_string()))
    }

    pub fn forbidden(message: &str) -> Self {
        Self(GatewayError::Forbidden(message.to_string()))
    }

    pub fn code(&self) -> &'static str {
        self.0.code()
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        ApiError::from(self.0).into_response()
    }
}

/// Auth state shared across routes
#[derive(Clone)]
pub struct AuthState {
    pub mode: AuthMode,
    jwt: Option<Arc<JwtValidator>>,
    api_keys: Arc<ApiKeyRegistry>,
}

impl AuthState {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            mode: config.mode,
            jwt: config
                .jwt_secret
                .as_deref()
                .map(|secret| Arc::new(JwtValidator::new(secret))),
            api_keys: Arc::new(ApiKeyRegistry::new(config.api_keys.iter().cloned())),
        }
    }

    /// Resolve a presented credential to a principal
    fn authenticate(&self, credential: Credential<'_>) -> Result<Principal, AuthError> {
        match credential {
            Credential::ApiKey(key) => self.api_keys.authenticate(key).ok_or_else(|| {
                tracing::debug!("API key not recognised");
                AuthError::unauthorized("Invalid API key")
            }),
            Credential::Token(token) => {
                let Some(jwt) = &self.jwt else {
                    return Err(AuthError::unauthorized("Bearer tokens are not accepted"));
                };
                jwt.authenticate(token).map_err(|e| {
                    tracing::debug!("JWT validation failed: {}", e);
                    AuthError::unauthorized("Invalid or expired token")
                })
            }
        }
    }
}

enum Credential<'a> {
    Token(&'a str),
    ApiKey(&'a str),
}

impl<'a> Credential<'a> {
    /// Classify a bare credential by its prefix
    fn classify(value: &'a str) -> Self {
        if value.starts_with(API_KEY_PREFIX) {
            Credential::ApiKey(value)
        } else {
            Credential::Token(value)
        }
    }
}

/// Authenticated caller plus the network origin used for anonymous rate limiting
#[derive(Debug, Clone)]
pub struct Caller {
    pub principal: Principal,
    pub origin: String,
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
    AuthState: FromRef<S>,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let auth_state = AuthState::from_ref(state);
        let principal = extract_principal(parts, &auth_state)?;
        Ok(Caller {
            principal,
            origin: request_origin(parts),
        })
    }
}

/// Caller holding the admin scope; 403 otherwise
#[derive(Debug, Clone)]
pub struct AdminCaller(pub Caller);

#[axum::async_trait]
impl<S> FromRequestParts<S> for AdminCaller
where
    S: Send + Sync,
    AuthState: FromRef<S>,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let caller = Caller::from_request_parts(parts, state).await?;
        if !caller.principal.has_scope(scopes::ADMIN) {
            return Err(AuthError::forbidden("Admin access required"));
        }
        Ok(AdminCaller(caller))
    }
}

#[derive(Deserialize)]
struct AccessTokenQuery {
    access_token: Option<String>,
}

fn extract_principal(parts: &Parts, auth_state: &AuthState) -> Result<Principal, AuthError> {
    if auth_state.mode == AuthMode::None {
        return Ok(Principal::anonymous());
    }

    if let Some(auth_header) = parts.headers.get(header::AUTHORIZATION) {
        let auth_str = auth_header
            .to_str()
            .map_err(|_| AuthError::unauthorized("Invalid authorization header"))?;

        if let Some(value) = auth_str.strip_prefix("Bearer ") {
            return auth_state.authenticate(Credential::classify(value.trim()));
        }

        if let Some(key) = auth_str.strip_prefix("ApiKey ") {
            return auth_state.authenticate(Credential::ApiKey(key.trim()));
        }

        if auth_str.starts_with(API_KEY_PREFIX) {
            return auth_state.authenticate(Credential::ApiKey(auth_str));
        }

        return Err(AuthError::unauthorized("Unsupported authorization scheme"));
    }

    if let Ok(Query(query)) = Query::<AccessTokenQuery>::try_from_uri(&parts.uri) {
        if let Some(token) = query.access_token.as_deref().filter(|t| !t.is_empty()) {
            return auth_state.authenticate(Credential::classify(token));
        }
    }

    Err(AuthError::unauthorized("Authentication required"))
}

fn request_origin(parts: &Parts) -> String {
    if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
        return addr.ip().to_string();
    }

    parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{hash_api_key, Claims, StaticApiKey};
    use axum::http::Request;
    use chrono::{Duration, Utc};
    use genrelay_core::AuthMethod;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "middleware-secret";

    fn enforced() -> AuthState {
        AuthState::new(&AuthConfig::enforced(
            Some(SECRET.to_string()),
            vec![StaticApiKey {
                subject: "svc-a".to_string(),
                key_hash: hash_api_key("gr_alpha"),
                scopes: vec![scopes::GENERATE.to_string()],
            }],
        ))
    }

    fn parts(uri: &str, authorization: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri(uri);
        if let Some(value) = authorization {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn jwt(scopes: &[&str]) -> String {
        let claims = Claims {
            sub: "user-1".to_string(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            exp: (Utc::now() + Duration::minutes(5)).timestamp(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_none_mode_is_anonymous() {
        let state = AuthState::new(&AuthConfig::default());
        let mut parts = parts("/generate", None);
        let caller = Caller::from_request_parts(&mut parts, &state).await.unwrap();
        assert!(caller.principal.is_anonymous());
        assert_eq!(caller.origin, "unknown");
    }

    #[tokio::test]
    async fn test_missing_credentials() {
        let err = extract_principal(&parts("/generate", None), &enforced()).unwrap_err();
        assert_eq!(err.code(), "unauthorized");
    }

    #[tokio::test]
    async fn test_api_key_header_forms() {
        let state = enforced();
        for value in ["Bearer gr_alpha", "ApiKey gr_alpha", "gr_alpha"] {
            let principal = extract_principal(&parts("/", Some(value)), &state).unwrap();
            assert_eq!(principal.subject, "svc-a", "{value}");
            assert_eq!(principal.method, AuthMethod::ApiKey);
        }
        assert!(extract_principal(&parts("/", Some("ApiKey gr_wrong")), &state).is_err());
    }

    #[tokio::test]
    async fn test_bearer_jwt() {
        let token = jwt(&[scopes::FRAMES_READ]);
        let principal =
            extract_principal(&parts("/", Some(&format!("Bearer {token}"))), &enforced()).unwrap();
        assert_eq!(principal.subject, "user-1");
        assert!(principal.has_scope(scopes::FRAMES_READ));
        assert!(!principal.has_scope(scopes::GENERATE));
    }

    #[tokio::test]
    async fn test_query_access_token() {
        let token = jwt(&[scopes::GENERATE]);
        let principal =
            extract_principal(&parts(&format!("/ws?access_token={token}"), None), &enforced())
                .unwrap();
        assert_eq!(principal.method, AuthMethod::Jwt);

        let principal =
            extract_principal(&parts("/ws?access_token=gr_alpha", None), &enforced()).unwrap();
        assert_eq!(principal.method, AuthMethod::ApiKey);
    }

    #[tokio::test]
    async fn test_jwt_rejected_without_secret() {
        let state = AuthState::new(&AuthConfig::enforced(None, Vec::new()));
        let token = jwt(&[scopes::GENERATE]);
        assert!(extract_principal(&parts("/", Some(&format!("Bearer {token}"))), &state).is_err());
    }

    #[tokio::test]
    async fn test_admin_caller_requires_scope() {
        let state = enforced();
        let mut non_admin = parts("/v1/dead-letters", Some("Bearer gr_alpha"));
        let err = AdminCaller::from_request_parts(&mut non_admin, &state)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "forbidden");

        let token = jwt(&[scopes::ADMIN]);
        let mut admin = parts("/v1/dead-letters", Some(&format!("Bearer {token}")));
        assert!(AdminCaller::from_request_parts(&mut admin, &state)
            .await
            .is_ok());
    }

    #[test]
    fn test_origin_from_forwarded_header() {
        let mut parts = parts("/", None);
        parts
            .headers
            .insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
        assert_eq!(request_origin(&parts), "203.0.113.9");
    }
}

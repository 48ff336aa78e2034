// Authentication module
// Decision: Two modes; "none" for local development and "enforced" for deployments
// Decision: Credentials are HS256 JWTs or static API keys; the gateway never issues either

mod api_key;
mod config;
mod jwt;
mod middleware;

pub use api_key::{hash_api_key, ApiKeyRegistry, API_KEY_PREFIX};
pub use config::{AuthConfig, AuthMode, StaticApiKey};
pub use jwt::{Claims, JwtValidator};
pub use middleware::{AdminCaller, AuthError, AuthState, Caller};

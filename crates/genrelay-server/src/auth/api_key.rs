// Static API keys
// Decision: API keys are prefixed with "gr_" for identification
// Decision: Only hashes are kept in memory; lookups hash the presented key

use std::collections::HashMap;

use genrelay_core::{AuthMethod, Principal};
use sha2::{Digest, Sha256};

use super::config::StaticApiKey;

/// API key prefix for identification
pub const API_KEY_PREFIX: &str = "gr_";

/// Hash an API key for storage/lookup
pub fn hash_api_key(key: &str) -> String {
    let hash = Sha256::digest(key.as_bytes());
    hex::encode(hash)
}

/// Lookup table from key hash to principal
#[derive(Debug, Clone, Default)]
pub struct ApiKeyRegistry {
    by_hash: HashMap<String, StaticApiKey>,
}

impl ApiKeyRegistry {
    pub fn new(keys: impl IntoIterator<Item = StaticApiKey>) -> Self {
        Self {
            by_hash: keys
                .into_iter()
                .map(|key| (key.key_hash.clone(), key))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    pub fn authenticate(&self, presented: &str) -> Option<Principal> {
        self.by_hash.get(&hash_api_key(presented)).map(|key| {
            Principal::new(key.subject.clone(), key.scopes.clone(), AuthMethod::ApiKey)
        })
    }
}

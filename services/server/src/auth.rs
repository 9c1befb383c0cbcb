//! Token-based authentication, grounded on the teacher's `validate_token`
//! (sha2 hash lookup) but backed by an in-memory table instead of Postgres —
//! no database is part of this system's scope.

use std::collections::HashMap;
use std::sync::Arc;

use realtime_core::AuthFuture;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

pub fn extract_bearer(header_value: &str) -> Option<&str> {
    header_value.strip_prefix("Bearer ")
}

fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Holds `sha256(token) -> session context` pairs. Tokens are never stored
/// in plaintext, mirroring the teacher's `device_tokens` lookup.
#[derive(Default)]
pub struct TokenStore {
    tokens: RwLock<HashMap<String, Value>>,
}

impl TokenStore {
    pub fn new() -> Self {
        TokenStore::default()
    }

    pub async fn issue(&self, token: &str, context: Value) {
        self.tokens.write().await.insert(hash_token(token), context);
    }

    pub async fn revoke(&self, token: &str) {
        self.tokens.write().await.remove(&hash_token(token));
    }

    pub async fn lookup(&self, token: &str) -> Option<Value> {
        self.tokens.read().await.get(&hash_token(token)).cloned()
    }
}

/// Builds the `auth_fn` passed to `Dispatcher::set_auth`: expects
/// `{"token": "..."}` and resolves it against the shared token store.
pub fn auth_fn(store: Arc<TokenStore>) -> realtime_core::AuthFn {
    Arc::new(move |params: Value| {
        let store = store.clone();
        Box::pin(async move {
            let token = params.get("token").and_then(Value::as_str)?;
            store.lookup(token).await
        }) as AuthFuture
    })
}

/// Convenience for tests and local bootstrapping: a store pre-seeded with
/// one token.
pub async fn seeded_store(token: &str, user_id: &str) -> Arc<TokenStore> {
    let store = Arc::new(TokenStore::new());
    store.issue(token, json!({"user": {"id": user_id}})).await;
    store
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_bearer_strips_prefix() {
        assert_eq!(extract_bearer("Bearer abc123"), Some("abc123"));
        assert_eq!(extract_bearer("abc123"), None);
    }

    #[tokio::test]
    async fn token_store_roundtrip() {
        let store = TokenStore::new();
        store.issue("secret", json!({"user": {"id": "u1"}})).await;
        assert_eq!(store.lookup("secret").await, Some(json!({"user": {"id": "u1"}})));
        assert_eq!(store.lookup("wrong").await, None);
        store.revoke("secret").await;
        assert_eq!(store.lookup("secret").await, None);
    }
}

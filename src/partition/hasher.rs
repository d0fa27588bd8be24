use crate::cache::sha256_hex;
use crate::headers::TOKEN_BUDGET_IDENTIFIER;
use http::header::AUTHORIZATION;
use http::HeaderMap;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Memoized sha256 of credential values.
///
/// One instance is shared by the router and every partition's policy layer so
/// that routing and metrics agree on a request's token budget.
#[derive(Default)]
pub struct TokenHasher {
    hashes: RwLock<HashMap<String, String>>,
}

impl TokenHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hex sha256 of the `Authorization` header (empty when absent).
    pub fn hash(&self, headers: &HeaderMap) -> String {
        let token = headers
            .get(AUTHORIZATION)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .unwrap_or_default();

        let known = self
            .hashes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&token)
            .cloned();
        if let Some(hash) = known {
            return hash;
        }

        let hash = sha256_hex(token.as_bytes());
        self.hashes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token, hash.clone());
        hash
    }

    /// Token budget of a request: the explicit identifier header when set,
    /// the credential hash otherwise.
    pub fn token_budget(&self, headers: &HeaderMap) -> String {
        match headers
            .get(TOKEN_BUDGET_IDENTIFIER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
        {
            Some(identifier) => identifier.to_string(),
            None => self.hash(headers),
        }
    }

    pub fn len(&self) -> usize {
        self.hashes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

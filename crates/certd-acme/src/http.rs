//! HTTP-01 challenge token store
//!
//! Holds the token -> key-authorization mapping while an HTTP-01 order is
//! in flight. The request path that serves
//! `/.well-known/acme-challenge/<token>` consults this store; serving the
//! response itself belongs to the surrounding system.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

/// Path prefix the CA fetches HTTP-01 proofs from
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Pending HTTP-01 challenges, keyed by token
pub struct Http01Challenges {
    challenges: Mutex<HashMap<String, String>>,
}

impl Http01Challenges {
    pub fn new() -> Self {
        Self {
            challenges: Mutex::new(HashMap::new()),
        }
    }

    /// Register a pending challenge before notifying the CA
    pub fn insert(&self, token: &str, key_authorization: &str) {
        debug!(token = %token, "Registering HTTP-01 challenge");
        self.challenges
            .lock()
            .unwrap()
            .insert(token.to_string(), key_authorization.to_string());
    }

    /// Remove a challenge once the order concludes
    pub fn remove(&self, token: &str) {
        if self.challenges.lock().unwrap().remove(token).is_some() {
            debug!(token = %token, "Removed HTTP-01 challenge");
        }
    }

    /// Key authorization to serve for a token, if pending
    pub fn response_for(&self, token: &str) -> Option<String> {
        self.challenges.lock().unwrap().get(token).cloned()
    }

    /// Extract the token from a request path, if it is a challenge path
    pub fn extract_token(path: &str) -> Option<&str> {
        path.strip_prefix(ACME_CHALLENGE_PREFIX)
    }

    pub fn pending_count(&self) -> usize {
        self.challenges.lock().unwrap().len()
    }
}

impl Default for Http01Challenges {
    fn default() -> Self {
        Self::new()
    }
}

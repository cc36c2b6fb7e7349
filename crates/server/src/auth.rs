//! Password login and session tokens.

use std::collections::HashMap;

use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::config::UserEntry;

/// Token length in bytes (produces 32 hex characters).
const TOKEN_BYTES: usize = 16;

/// Live tokens kept per user; a new login evicts that user's oldest.
pub const MAX_TOKENS_PER_USER: usize = 16;

/// Generates a CSPRNG token as a 32-character lowercase hex string.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Lowercase hex SHA-256 of a password, as stored in the config.
pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// Constant-time string comparison.
pub fn constant_time_eq(received: &str, expected: &str) -> bool {
    if received.len() != expected.len() {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in received.bytes().zip(expected.bytes()) {
        diff |= a ^ b;
    }
    diff == 0
}

/// Checks credentials and keeps the tokens issued for this process.
#[derive(Debug)]
pub struct Authenticator {
    users: HashMap<String, String>,
    tokens: RwLock<Vec<(String, String)>>,
}

impl Authenticator {
    pub fn new(users: &[UserEntry]) -> Self {
        Self {
            users: users
                .iter()
                .map(|u| (u.username.clone(), u.password_sha256.to_ascii_lowercase()))
                .collect(),
            tokens: RwLock::new(Vec::new()),
        }
    }

    /// Verifies a username/password pair and issues a token.
    pub async fn login(&self, username: &str, password: &str) -> Option<String> {
        let stored = self.users.get(username)?;
        if !constant_time_eq(&hash_password(password), stored) {
            return None;
        }
        let token = generate_token();
        let mut tokens = self.tokens.write().await;
        if tokens.iter().filter(|(_, user)| user == username).count() >= MAX_TOKENS_PER_USER {
            if let Some(oldest) = tokens.iter().position(|(_, user)| user == username) {
                tokens.remove(oldest);
            }
        }
        tokens.push((token.clone(), username.to_string()));
        Some(token)
    }

    /// Returns the user a token was issued to.
    ///
    /// Every issued token is compared so the time taken does not depend on
    /// which one matches.
    pub async fn validate(&self, token: &str) -> Option<String> {
        let tokens = self.tokens.read().await;
        let mut found = None;
        for (issued, user) in tokens.iter() {
            if constant_time_eq(token, issued) {
                found = Some(user.clone());
            }
        }
        found
    }

    pub async fn issued(&self) -> usize {
        self.tokens.read().await.len()
    }
}

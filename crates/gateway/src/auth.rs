//! Shared-token authentication with atomic rotation.
//!
//! Tokens are compared as SHA-256 digests so the comparison is fixed-length
//! and constant-time, and raw token material never sits in long-lived
//! state. Rotation keeps the previous token valid for a grace window; only
//! new handshakes consult the manager, so established sessions survive
//! rotation untouched.

use std::{
    sync::RwLock,
    time::{Duration, Instant},
};

use {
    secrecy::{ExposeSecret, Secret},
    sha2::{Digest, Sha256},
    tracing::info,
};

use relay_metrics::{counter, daemon};

type TokenDigest = [u8; 32];

fn digest(token: &str) -> TokenDigest {
    Sha256::digest(token.as_bytes()).into()
}

fn digests_equal(a: &TokenDigest, b: &TokenDigest) -> bool {
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

struct TokenState {
    current: Option<TokenDigest>,
    previous: Option<(TokenDigest, Instant)>,
}

pub struct TokenManager {
    state: RwLock<TokenState>,
    grace: Duration,
}

impl TokenManager {
    #[must_use]
    pub fn new(initial: Option<&Secret<String>>, grace: Duration) -> Self {
        Self {
            state: RwLock::new(TokenState {
                current: initial.map(|t| digest(t.expose_secret())),
                previous: None,
            }),
            grace,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, TokenState> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Whether any token is required at all.
    #[must_use]
    pub fn auth_required(&self) -> bool {
        self.read().current.is_some()
    }

    /// Constant-time check against the current token, plus the previous
    /// token while its grace window is open.
    #[must_use]
    pub fn accepts(&self, candidate: &str) -> bool {
        let state = self.read();
        let Some(current) = state.current else {
            // No token configured: open daemon.
            return true;
        };
        let candidate = digest(candidate);
        if digests_equal(&candidate, &current) {
            return true;
        }
        if let Some((previous, rotated_at)) = state.previous
            && rotated_at.elapsed() < self.grace
            && digests_equal(&candidate, &previous)
        {
            return true;
        }
        false
    }

    /// Atomic swap to a new token. The outgoing token stays valid for the
    /// grace window.
    pub fn rotate(&self, new_token: &Secret<String>) {
        let mut state = match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let outgoing = state.current.take();
        state.current = Some(digest(new_token.expose_secret()));
        state.previous = outgoing.map(|d| (d, Instant::now()));
        drop(state);

        counter!(daemon::TOKEN_ROTATIONS_TOTAL).increment(1);
        info!(token = %self.fingerprint().unwrap_or_default(), "auth token rotated");
    }

    /// Short digest prefix for audit logs; never the raw token.
    #[must_use]
    pub fn fingerprint(&self) -> Option<String> {
        self.read()
            .current
            .map(|d| d.iter().take(4).map(|b| format!("{b:02x}")).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(s: &str) -> Secret<String> {
        Secret::new(s.to_string())
    }

    #[test]
    fn no_token_accepts_everything() {
        let manager = TokenManager::new(None, Duration::from_secs(30));
        assert!(!manager.auth_required());
        assert!(manager.accepts("anything"));
    }

    #[test]
    fn accepts_only_the_configured_token() {
        let manager = TokenManager::new(Some(&secret("t1")), Duration::from_secs(30));
        assert!(manager.accepts("t1"));
        assert!(!manager.accepts("t2"));
        assert!(!manager.accepts(""));
    }

    #[test]
    fn rotation_honors_the_grace_window() {
        let manager = TokenManager::new(Some(&secret("t1")), Duration::from_secs(30));
        manager.rotate(&secret("t2"));
        assert!(manager.accepts("t2"));
        // Previous token still accepted inside the window.
        assert!(manager.accepts("t1"));
    }

    #[test]
    fn grace_window_expires() {
        let manager = TokenManager::new(Some(&secret("t1")), Duration::ZERO);
        manager.rotate(&secret("t2"));
        assert!(manager.accepts("t2"));
        assert!(!manager.accepts("t1"));
    }

    #[test]
    fn second_rotation_drops_the_oldest_token() {
        let manager = TokenManager::new(Some(&secret("t1")), Duration::from_secs(30));
        manager.rotate(&secret("t2"));
        manager.rotate(&secret("t3"));
        assert!(manager.accepts("t3"));
        assert!(manager.accepts("t2"));
        assert!(!manager.accepts("t1"));
    }

    #[test]
    fn fingerprint_is_not_the_token() {
        let manager = TokenManager::new(Some(&secret("super-secret-token")), Duration::ZERO);
        let fp = manager.fingerprint().unwrap();
        assert_eq!(fp.len(), 8);
        assert!(!"super-secret-token".contains(&fp));
    }
}

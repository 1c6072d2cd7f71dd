//! Accounts, password checks and opaque session tokens

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::RngCore;
use tracing::{debug, info, warn};

use crate::error::{Result, VigilError};
use crate::models::User;

/// bcrypt work factor for new password hashes
pub const DEFAULT_HASH_COST: u32 = bcrypt::DEFAULT_COST;

const TOKEN_LEN: usize = 32;

/// A logged-in session
#[derive(Debug, Clone)]
pub struct Session {
    pub username: String,
    pub expires_at: DateTime<Utc>,
}

/// In-process user directory and session table
pub struct Identity {
    users: DashMap<String, User>,
    sessions: DashMap<String, Session>,
    session_ttl: Duration,
}

impl Identity {
    pub fn new(session_ttl: Duration) -> Self {
        Self {
            users: DashMap::new(),
            sessions: DashMap::new(),
            session_ttl,
        }
    }

    /// Adds an account; usernames are limited to letters, digits, '.' and '_'
    pub fn add_user(&self, user: User) -> Result<()> {
        if !is_valid_username(&user.username) {
            return Err(VigilError::MalformedInput(format!(
                "invalid username '{}'",
                user.username
            )));
        }
        match self.users.entry(user.username.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(VigilError::Conflict(format!("user {}", user.username)))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                info!("Added user {}", user.username);
                slot.insert(user);
                Ok(())
            }
        }
    }

    pub fn user(&self, username: &str) -> Option<User> {
        self.users.get(username).map(|u| u.clone())
    }

    /// All accounts, sorted by name
    pub fn users(&self) -> Vec<User> {
        let mut all: Vec<User> = self.users.iter().map(|u| u.clone()).collect();
        all.sort_by(|a, b| a.username.cmp(&b.username));
        all
    }

    /// Checks credentials and opens a session, returning its token
    pub fn login(&self, username: &str, password: &str) -> Result<String> {
        let valid = self
            .users
            .get(username)
            .is_some_and(|u| verify_password(password, &u.password_hash));
        if !valid {
            warn!("Failed login for {}", username);
            return Err(VigilError::Unauthorized(
                "Incorrect username or password".to_string(),
            ));
        }

        let token = generate_token();
        self.sessions.insert(
            token.clone(),
            Session {
                username: username.to_string(),
                expires_at: Utc::now() + self.session_ttl,
            },
        );
        info!("User {} logged in", username);
        Ok(token)
    }

    /// Maps a bearer token to its user
    pub fn authenticate(&self, token: &str) -> Result<User> {
        let session = self
            .sessions
            .get(token)
            .map(|s| s.clone())
            .ok_or_else(|| VigilError::Unauthorized("Invalid session".to_string()))?;

        if session.expires_at < Utc::now() {
            self.sessions.remove(token);
            debug!("Session of {} expired", session.username);
            return Err(VigilError::Unauthorized("Session expired".to_string()));
        }

        self.user(&session.username)
            .ok_or_else(|| VigilError::Unauthorized("Invalid session".to_string()))
    }

    /// Ends a session; returns whether it existed
    pub fn logout(&self, token: &str) -> bool {
        self.sessions.remove(token).is_some()
    }

    /// Drops every expired session
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.expires_at >= now);
        before - self.sessions.len()
    }
}

fn is_valid_username(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_')
}

/// Hashes a password with bcrypt at the default cost
pub fn hash_password(password: &str) -> Result<String> {
    hash_password_with_cost(password, DEFAULT_HASH_COST)
}

/// Hashes a password with bcrypt at an explicit cost (4-31)
pub fn hash_password_with_cost(password: &str, cost: u32) -> Result<String> {
    bcrypt::hash(password, cost)
        .map_err(|e| VigilError::MalformedInput(format!("cannot hash password: {e}")))
}

/// Checks a password against a stored bcrypt hash; malformed hashes never match
pub fn verify_password(password: &str, stored: &str) -> bool {
    bcrypt::verify(password, stored).unwrap_or(false)
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_with(username: &str, password: &str) -> Identity {
        let identity = Identity::new(Duration::minutes(60));
        identity
            .add_user(User {
                username: username.to_string(),
                full_name: None,
                roles: Vec::new(),
                password_hash: hash_password_with_cost(password, 4).unwrap(),
            })
            .unwrap();
        identity
    }

    #[test]
    fn test_password_roundtrip() {
        let hash = hash_password_with_cost("hunter2", 4).unwrap();
        assert!(hash.starts_with("$2b$04$"));
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("hunter3", &hash));
        assert!(!verify_password("hunter2", "plaintext"));
        assert!(!verify_password("hunter2", "sha256$00$00"));
    }

    #[test]
    fn test_cost_out_of_range_rejected() {
        assert!(matches!(
            hash_password_with_cost("pw", 2),
            Err(VigilError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_login_and_authenticate() {
        let identity = identity_with("alice", "s3cret");
        assert!(identity.login("alice", "wrong").is_err());
        assert!(identity.login("mallory", "s3cret").is_err());

        let token = identity.login("alice", "s3cret").unwrap();
        assert_eq!(identity.authenticate(&token).unwrap().username, "alice");

        assert!(identity.logout(&token));
        assert!(matches!(
            identity.authenticate(&token),
            Err(VigilError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_expired_session_rejected() {
        let identity = Identity::new(Duration::seconds(-1));
        identity
            .add_user(User {
                username: "bob".to_string(),
                full_name: None,
                roles: Vec::new(),
                password_hash: hash_password_with_cost("pw", 4).unwrap(),
            })
            .unwrap();
        let token = identity.login("bob", "pw").unwrap();
        assert!(matches!(
            identity.authenticate(&token),
            Err(VigilError::Unauthorized(msg)) if msg.contains("expired")
        ));
        assert_eq!(identity.purge_expired(), 0);
    }

    #[test]
    fn test_username_validation() {
        let identity = Identity::new(Duration::minutes(1));
        let bad = User {
            username: "bob; drop".to_string(),
            full_name: None,
            roles: Vec::new(),
            password_hash: String::new(),
        };
        assert!(matches!(
            identity.add_user(bad),
            Err(VigilError::MalformedInput(_))
        ));
    }
}

//! Authentication collaborators
//!
//! The master consults two authenticators during registration:
//! - [`UserAuthenticator`] for admin clients (username/password)
//! - [`ServerAuthenticator`] for monitors (shared token)
//!
//! Monitors obtain the token they present from a [`TokenProvider`].
//! Config-backed defaults for all three live here.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::{AdminUserEntry, AuthSettings};
use crate::protocol::{ClientRegistration, MonitorRegistration, ServerInfo};

/// An authenticated admin user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdminUser {
    pub username: String,
    /// 0 and 1 may run commands; higher levels are read-only
    pub level: u64,
}

impl AdminUser {
    /// Info stored in the registry for the client's connection
    pub fn to_info(&self) -> ServerInfo {
        let mut info = ServerInfo::new();
        info.insert("username".into(), Value::from(self.username.clone()));
        info.insert("level".into(), Value::from(self.level));
        info
    }
}

/// Result of a monitor's server authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAuthStatus {
    Accept,
    Deny(String),
}

#[async_trait]
pub trait UserAuthenticator: Send + Sync + 'static {
    /// Resolve the user, or `None` to reject the login
    async fn authenticate(&self, registration: &ClientRegistration, env: &str) -> Option<AdminUser>;
}

#[async_trait]
pub trait ServerAuthenticator: Send + Sync + 'static {
    async fn authenticate(&self, registration: &MonitorRegistration, env: &str) -> ServerAuthStatus;
}

#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    /// Token presented in `register` and `reconnect`
    async fn token(&self, id: &str, server_type: &str) -> Option<String>;
}

/// Hex-encoded SHA-256 of a password, the form clients send with `md5: true`
pub fn password_digest(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

// ─────────────────────────────────────────────────────────────────
// Config-backed defaults
// ─────────────────────────────────────────────────────────────────

/// Admin users listed under `[[auth.users]]`
///
/// Stored passwords may be plain text or a SHA-256 hex digest. With no users
/// configured every login is rejected.
#[derive(Debug, Clone, Default)]
pub struct StaticUsers {
    users: Vec<AdminUserEntry>,
}

impl StaticUsers {
    pub fn new(users: Vec<AdminUserEntry>) -> Self {
        Self { users }
    }

    pub fn from_settings(settings: &AuthSettings) -> Self {
        Self::new(settings.users.clone())
    }

    fn password_matches(stored: &str, given: &str, pre_digested: bool) -> bool {
        let given_digest = if pre_digested {
            given.to_ascii_lowercase()
        } else {
            if stored == given {
                return true;
            }
            password_digest(given)
        };
        stored.eq_ignore_ascii_case(&given_digest) || password_digest(stored) == given_digest
    }
}

#[async_trait]
impl UserAuthenticator for StaticUsers {
    async fn authenticate(&self, registration: &ClientRegistration, _env: &str) -> Option<AdminUser> {
        self.users
            .iter()
            .find(|user| {
                user.username == registration.username
                    && Self::password_matches(&user.password, &registration.password, registration.md5)
            })
            .map(|user| AdminUser {
                username: user.username.clone(),
                level: user.level,
            })
    }
}

/// Shared secret checked against the monitor's `token`
///
/// An empty or missing secret accepts every monitor.
#[derive(Debug, Clone, Default)]
pub struct SharedToken {
    token: Option<String>,
}

impl SharedToken {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.is_empty()),
        }
    }

    pub fn from_settings(settings: &AuthSettings) -> Self {
        Self::new(settings.server_token.clone())
    }
}

#[async_trait]
impl ServerAuthenticator for SharedToken {
    async fn authenticate(&self, registration: &MonitorRegistration, _env: &str) -> ServerAuthStatus {
        match &self.token {
            None => ServerAuthStatus::Accept,
            Some(expected) if registration.token.as_deref() == Some(expected.as_str()) => {
                ServerAuthStatus::Accept
            }
            Some(_) => ServerAuthStatus::Deny("server auth failed".to_string()),
        }
    }
}

#[async_trait]
impl TokenProvider for SharedToken {
    async fn token(&self, _id: &str, _server_type: &str) -> Option<String> {
        self.token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> StaticUsers {
        StaticUsers::new(vec![
            AdminUserEntry {
                username: "admin".into(),
                password: "admin".into(),
                level: 1,
            },
            AdminUserEntry {
                username: "viewer".into(),
                password: password_digest("look"),
                level: 2,
            },
        ])
    }

    fn login(username: &str, password: &str, md5: bool) -> ClientRegistration {
        ClientRegistration {
            id: "c1".into(),
            username: username.into(),
            password: password.into(),
            md5,
        }
    }

    #[tokio::test]
    async fn test_plain_and_digested_passwords() {
        let users = users();
        let admin = users.authenticate(&login("admin", "admin", false), "dev").await.unwrap();
        assert_eq!(admin.level, 1);

        let digest = password_digest("admin");
        assert!(users.authenticate(&login("admin", &digest, true), "dev").await.is_some());

        // Stored as a digest, sent in the clear
        let viewer = users.authenticate(&login("viewer", "look", false), "dev").await.unwrap();
        assert_eq!(viewer.to_info()["level"], 2);
    }

    #[tokio::test]
    async fn test_wrong_credentials_rejected() {
        let users = users();
        assert!(users.authenticate(&login("admin", "nope", false), "dev").await.is_none());
        assert!(users.authenticate(&login("ghost", "admin", false), "dev").await.is_none());
        assert!(StaticUsers::default()
            .authenticate(&login("admin", "admin", false), "dev")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_shared_token() {
        let reg = |token: Option<&str>| MonitorRegistration {
            id: "m1".into(),
            server_type: "connector".into(),
            pid: None,
            info: ServerInfo::new(),
            token: token.map(str::to_string),
        };

        let open = SharedToken::new(Some(String::new()));
        assert_eq!(open.authenticate(&reg(None), "dev").await, ServerAuthStatus::Accept);

        let secret = SharedToken::new(Some("s3cret".into()));
        assert_eq!(secret.authenticate(&reg(Some("s3cret")), "dev").await, ServerAuthStatus::Accept);
        assert!(matches!(
            secret.authenticate(&reg(Some("wrong")), "dev").await,
            ServerAuthStatus::Deny(_)
        ));
        assert_eq!(secret.token("m1", "connector").await.as_deref(), Some("s3cret"));
    }
}

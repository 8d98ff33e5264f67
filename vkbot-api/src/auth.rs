// ABOUTME: Identity types and the external collaborators used for authentication.
// ABOUTME: Token acquisition and captcha solving are traits; the core never scrapes login forms.

use async_trait::async_trait;
use std::fmt;

/// Whether a session acts as a user account or as a group (community) bot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityKind {
    User,
    Group,
}

impl fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Group => write!(f, "group"),
        }
    }
}

/// Routing hint: which identity kind executes a call, and a round-robin index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sender {
    User(usize),
    Group(usize),
}

impl Sender {
    pub fn kind(&self) -> IdentityKind {
        match self {
            Self::User(_) => IdentityKind::User,
            Self::Group(_) => IdentityKind::Group,
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Self::User(i) | Self::Group(i) => *i,
        }
    }
}

/// Login material for a user account
#[derive(Clone)]
pub struct UserCredentials {
    pub username: String,
    pub password: String,
    pub app_id: u64,
    pub scope: u64,
}

impl fmt::Debug for UserCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserCredentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("app_id", &self.app_id)
            .field("scope", &self.scope)
            .finish()
    }
}

/// What a client authenticates with
#[derive(Clone)]
pub enum Credentials {
    User(UserCredentials),
    Group { token: String },
}

impl Credentials {
    pub fn kind(&self) -> IdentityKind {
        match self {
            Self::User(_) => IdentityKind::User,
            Self::Group { .. } => IdentityKind::Group,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(creds) => f.debug_tuple("User").field(creds).finish(),
            Self::Group { .. } => f
                .debug_struct("Group")
                .field("token", &"[REDACTED]")
                .finish(),
        }
    }
}

/// Obtains an access token for a user account (web login, 2FA, etc. live behind this)
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn obtain_token(&self, credentials: &UserCredentials) -> Option<String>;
}

/// Solves captcha challenges raised by the API
#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    async fn solve(&self, image_url: &str) -> Option<String>;
}

/// Captcha solver used when no solving service is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCaptchaSolver;

#[async_trait]
impl CaptchaSolver for NoCaptchaSolver {
    async fn solve(&self, image_url: &str) -> Option<String> {
        tracing::warn!(
            image_url = %image_url,
            "Captcha requested but no captcha solver is configured"
        );
        None
    }
}

/// Token provider for deployments that only run group tokens
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTokenProvider;

#[async_trait]
impl TokenProvider for NoTokenProvider {
    async fn obtain_token(&self, credentials: &UserCredentials) -> Option<String> {
        tracing::error!(
            username = %credentials.username,
            "User login requested but no token provider is configured"
        );
        None
    }
}

/// Hands out a user access token obtained outside the bot
#[derive(Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl fmt::Debug for StaticTokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticTokenProvider")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn obtain_token(&self, _credentials: &UserCredentials) -> Option<String> {
        if self.token.trim().is_empty() {
            None
        } else {
            Some(self.token.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sender_kind_and_index() {
        assert_eq!(Sender::User(3).kind(), IdentityKind::User);
        assert_eq!(Sender::Group(7).kind(), IdentityKind::Group);
        assert_eq!(Sender::Group(7).index(), 7);
    }

    #[test]
    fn test_credentials_debug_redacts_secrets() {
        let user = Credentials::User(UserCredentials {
            username: "bot@example.com".to_string(),
            password: "hunter2".to_string(),
            app_id: 1,
            scope: 2,
        });
        let group = Credentials::Group {
            token: "secret-token".to_string(),
        };
        let out = format!("{:?} {:?}", user, group);
        assert!(out.contains("bot@example.com"));
        assert!(!out.contains("hunter2"));
        assert!(!out.contains("secret-token"));
        assert!(out.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn test_static_token_provider() {
        let creds = UserCredentials {
            username: "me".to_string(),
            password: String::new(),
            app_id: 1,
            scope: 2,
        };
        let provider = StaticTokenProvider::new("user-token");
        assert_eq!(provider.obtain_token(&creds).await.as_deref(), Some("user-token"));
        assert!(!format!("{:?}", provider).contains("user-token"));
        assert_eq!(StaticTokenProvider::new(" ").obtain_token(&creds).await, None);
    }
}

// ABOUTME: HTTP transport for the `execute` endpoint, behind a trait so tests can script replies.
// ABOUTME: The reqwest implementation supports an optional per-client proxy with basic auth.

use crate::error::TransportError;
use async_trait::async_trait;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://api.vk.com/method/execute";
pub const DEFAULT_API_VERSION: &str = "5.64";

/// Sends one form-encoded POST to the execute endpoint and returns the raw body text
#[async_trait]
pub trait ApiTransport: Send + Sync {
    async fn post_execute(
        &self,
        access_token: &str,
        form: &[(String, String)],
    ) -> Result<String, TransportError>;
}

/// Outbound proxy for one client
#[derive(Clone)]
pub struct ProxySettings {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl std::fmt::Debug for ProxySettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySettings")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// reqwest-backed transport owned by a single client
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    url: String,
    version: String,
}

impl HttpTransport {
    pub fn new(
        url: impl Into<String>,
        version: impl Into<String>,
        timeout: Duration,
        proxy: Option<&ProxySettings>,
    ) -> Result<Self, TransportError> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(proxy) = proxy {
            let mut p = reqwest::Proxy::all(&proxy.url)
                .map_err(|e| TransportError::Connection(format!("invalid proxy: {}", e)))?;
            if let Some(username) = &proxy.username {
                p = p.basic_auth(username, proxy.password.as_deref().unwrap_or(""));
            }
            builder = builder.proxy(p);
        }
        let http = builder.build()?;
        Ok(Self {
            http,
            url: url.into(),
            version: version.into(),
        })
    }
}

#[async_trait]
impl ApiTransport for HttpTransport {
    async fn post_execute(
        &self,
        access_token: &str,
        form: &[(String, String)],
    ) -> Result<String, TransportError> {
        let response = self
            .http
            .post(&self.url)
            .query(&[("access_token", access_token), ("v", self.version.as_str())])
            .form(form)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }

        Ok(response.text().await?)
    }
}

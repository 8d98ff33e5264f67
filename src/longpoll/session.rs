// ABOUTME: LongPollSession - negotiates a poll server and fetches update batches from it.
// ABOUTME: Failure codes 1/2/3 resync ts/key/everything; transport failures renegotiate in place.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use vkbot_api::{ApiError, ClientPool, Params, TransportError};
use vkbot_core::config::LongPollConfig;
use vkbot_core::metrics;

/// Connection triple handed out by `messages.getLongPollServer`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollServer {
    pub server: String,
    pub key: String,
    pub ts: i64,
}

impl PollServer {
    pub fn from_response(value: &Value) -> Result<Self, ApiError> {
        let server = value.get("server").and_then(Value::as_str);
        let key = value.get("key").and_then(Value::as_str);
        let ts = value.get("ts").and_then(parse_ts);
        match (server, key, ts) {
            (Some(server), Some(key), Some(ts)) => Ok(Self {
                server: server.to_string(),
                key: key.to_string(),
                ts,
            }),
            _ => Err(ApiError::Decode(format!(
                "unexpected long-poll server response: {}",
                value
            ))),
        }
    }
}

/// Where poll-server credentials come from
#[async_trait]
pub trait PollServerSource: Send + Sync {
    async fn poll_server(&self) -> Result<PollServer, ApiError>;
}

#[async_trait]
impl PollServerSource for ClientPool {
    async fn poll_server(&self) -> Result<PollServer, ApiError> {
        let response = self
            .call_sync("messages.getLongPollServer", Params::new().with("use_ssl", 1))
            .await?
            .ok_or_else(|| ApiError::Decode("empty long-poll server response".to_string()))?;
        PollServer::from_response(&response)
    }
}

/// Issues the blocking wait-for-updates GET
#[async_trait]
pub trait PollTransport: Send + Sync {
    /// Returns the raw body; the server mislabels its content type so no decoding happens here
    async fn fetch(&self, url: &str, query: &[(String, String)]) -> Result<String, TransportError>;
}

/// reqwest-backed poll transport. Its timeout must exceed the server-side wait.
#[derive(Debug, Clone)]
pub struct HttpPollTransport {
    http: reqwest::Client,
}

impl HttpPollTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl PollTransport for HttpPollTransport {
    async fn fetch(&self, url: &str, query: &[(String, String)]) -> Result<String, TransportError> {
        let response = self.http.get(url).query(query).send().await?;
        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }
        Ok(response.text().await?)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LongPollError {
    #[error("Long-poll server unreachable after {attempts} attempts")]
    Unreachable { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Active,
    ResyncTs,
    ResyncKey,
    ResyncFull,
}

/// What a negotiation replaces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiateMode {
    /// Server, key and ts
    Full,
    /// Key only
    Key,
    /// Ts only
    Ts,
}

impl NegotiateMode {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Key => "key",
            Self::Ts => "ts",
        }
    }

    fn state(&self) -> SessionState {
        match self {
            Self::Full => SessionState::ResyncFull,
            Self::Key => SessionState::ResyncKey,
            Self::Ts => SessionState::ResyncTs,
        }
    }
}

impl fmt::Display for NegotiateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unusable poll responses in a row before the session is renegotiated
pub const MAX_BAD_RESPONSES: u32 = 3;

/// Retry shape for fetching poll-server credentials
#[derive(Debug, Clone)]
pub struct NegotiationPolicy {
    /// Attempts per burst
    pub attempts: u32,
    /// Delay between attempts inside a burst
    pub spacing: Duration,
    /// Delay before the second and final burst
    pub pause: Duration,
}

impl NegotiationPolicy {
    /// Delay after a poll response that could not be used
    pub fn bad_response_delay(&self) -> Duration {
        self.spacing
    }
}

impl Default for NegotiationPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            spacing: Duration::from_secs(1),
            pause: Duration::from_secs(30),
        }
    }
}

/// Owns the `{server, key, ts}` triple; only `negotiate` and `poll` mutate it
pub struct LongPollSession {
    source: Arc<dyn PollServerSource>,
    transport: Arc<dyn PollTransport>,
    settings: LongPollConfig,
    policy: NegotiationPolicy,
    state: SessionState,
    server: String,
    key: String,
    ts: i64,
    bad_responses: u32,
}

impl LongPollSession {
    pub fn new(
        source: Arc<dyn PollServerSource>,
        transport: Arc<dyn PollTransport>,
        settings: LongPollConfig,
    ) -> Self {
        Self {
            source,
            transport,
            settings,
            policy: NegotiationPolicy::default(),
            state: SessionState::Uninitialized,
            server: String::new(),
            key: String::new(),
            ts: 0,
            bad_responses: 0,
        }
    }

    pub fn with_policy(mut self, policy: NegotiationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn ts(&self) -> i64 {
        self.ts
    }

    /// Query parameters for the next poll request
    pub fn query(&self) -> Vec<(String, String)> {
        vec![
            ("act".to_string(), "a_check".to_string()),
            ("key".to_string(), self.key.clone()),
            ("ts".to_string(), self.ts.to_string()),
            ("wait".to_string(), self.settings.wait.to_string()),
            ("mode".to_string(), self.settings.mode.to_string()),
            ("version".to_string(), self.settings.version.to_string()),
        ]
    }

    async fn fetch_server_burst(&self) -> Option<PollServer> {
        for attempt in 1..=self.policy.attempts {
            match self.source.poll_server().await {
                Ok(info) => return Some(info),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Failed to get long-poll server");
                    if attempt < self.policy.attempts {
                        tokio::time::sleep(self.policy.spacing).await;
                    }
                }
            }
        }
        None
    }

    /// Fetch fresh credentials and replace the parts `mode` covers.
    ///
    /// Two bursts of attempts separated by a long pause; `Unreachable` after that.
    pub async fn negotiate(&mut self, mode: NegotiateMode) -> Result<(), LongPollError> {
        // Without a server there is nothing to partially update
        let mode = if self.server.is_empty() {
            NegotiateMode::Full
        } else {
            mode
        };
        if self.state != SessionState::Uninitialized {
            self.state = mode.state();
            tracing::warn!(mode = %mode, "Renegotiating long-poll session");
        }
        metrics::record_longpoll_resync(mode.as_str());

        let info = match self.fetch_server_burst().await {
            Some(info) => info,
            None => {
                tracing::warn!(
                    pause_secs = self.policy.pause.as_secs(),
                    "Long-poll server unavailable, pausing before final attempts"
                );
                tokio::time::sleep(self.policy.pause).await;
                match self.fetch_server_burst().await {
                    Some(info) => info,
                    None => {
                        tracing::error!("Could not obtain long-poll server");
                        return Err(LongPollError::Unreachable {
                            attempts: self.policy.attempts * 2,
                        });
                    }
                }
            }
        };

        match mode {
            NegotiateMode::Full => {
                self.server = if info.server.starts_with("http") {
                    info.server
                } else {
                    format!("https://{}", info.server)
                };
                self.key = info.key;
                self.ts = info.ts;
            }
            NegotiateMode::Key => self.key = info.key,
            NegotiateMode::Ts => self.ts = info.ts,
        }
        self.state = SessionState::Active;
        tracing::debug!(server = %self.server, ts = self.ts, "Long-poll session active");
        Ok(())
    }

    /// Wait for the next update batch. Failure codes and transport errors are absorbed
    /// into renegotiation; only an unreachable poll server ends the session.
    pub async fn poll(&mut self) -> Result<Vec<Value>, LongPollError> {
        loop {
            if self.state != SessionState::Active {
                self.negotiate(NegotiateMode::Full).await?;
            }

            let body = match self.transport.fetch(&self.server, &self.query()).await {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!(error = %e, "Long-poll server not responding, reconnecting");
                    self.negotiate(NegotiateMode::Full).await?;
                    continue;
                }
            };

            let response: Value = match serde_json::from_str(&body) {
                Ok(value) => value,
                Err(e) => {
                    tracing::debug!(error = %e, "Ignoring malformed long-poll response");
                    self.bad_response().await?;
                    continue;
                }
            };

            if let Some(failed) = response.get("failed").and_then(parse_ts) {
                self.bad_responses = 0;
                self.handle_failure(failed, &response).await?;
                continue;
            }

            let Some(ts) = response.get("ts").and_then(parse_ts) else {
                tracing::debug!(response = %response, "Long-poll response without ts");
                self.bad_response().await?;
                continue;
            };
            self.bad_responses = 0;
            self.advance_ts(ts);

            let updates = match response.get("updates") {
                Some(Value::Array(items)) => items.clone(),
                _ => Vec::new(),
            };
            return Ok(updates);
        }
    }

    /// Back off after an unusable response; renegotiate once they keep coming
    async fn bad_response(&mut self) -> Result<(), LongPollError> {
        self.bad_responses += 1;
        if self.bad_responses >= MAX_BAD_RESPONSES {
            tracing::warn!(
                responses = self.bad_responses,
                "Long-poll server keeps sending unusable responses"
            );
            self.bad_responses = 0;
            return self.negotiate(NegotiateMode::Full).await;
        }
        tokio::time::sleep(self.policy.bad_response_delay()).await;
        Ok(())
    }

    async fn handle_failure(&mut self, code: i64, response: &Value) -> Result<(), LongPollError> {
        match code {
            1 => match response.get("ts").and_then(parse_ts) {
                Some(ts) => {
                    tracing::debug!(ts, "Long-poll history outdated, moving ts forward");
                    self.ts = ts;
                    Ok(())
                }
                None => self.negotiate(NegotiateMode::Ts).await,
            },
            2 => self.negotiate(NegotiateMode::Key).await,
            3 => self.negotiate(NegotiateMode::Full).await,
            4 => {
                tracing::error!(version = self.settings.version, "Long-poll version rejected by server");
                self.negotiate(NegotiateMode::Full).await
            }
            other => {
                tracing::warn!(code = other, "Unknown long-poll failure code");
                self.negotiate(NegotiateMode::Full).await
            }
        }
    }

    fn advance_ts(&mut self, ts: i64) {
        if ts >= self.ts {
            self.ts = ts;
        } else {
            tracing::warn!(current = self.ts, received = ts, "Ignoring ts that would move backwards");
        }
    }
}

fn parse_ts(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_poll_server_from_response_accepts_string_ts() {
        let info =
            PollServer::from_response(&json!({"server": "im.vk.com/nim1", "key": "k", "ts": "17"}))
                .unwrap();
        assert_eq!(info.ts, 17);
        assert!(PollServer::from_response(&json!({"server": "x"})).is_err());
    }

    #[test]
    fn test_negotiation_policy_defaults() {
        let policy = NegotiationPolicy::default();
        assert_eq!(policy.attempts, 10);
        assert_eq!(policy.spacing, Duration::from_secs(1));
        assert_eq!(policy.pause, Duration::from_secs(30));
    }

    #[test]
    fn test_parse_ts() {
        assert_eq!(parse_ts(&json!(5)), Some(5));
        assert_eq!(parse_ts(&json!("6")), Some(6));
        assert_eq!(parse_ts(&json!(null)), None);
    }
}

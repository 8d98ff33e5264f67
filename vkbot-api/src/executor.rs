// ABOUTME: Session (one authenticated identity) and the BatchExecutor that drains its queue.
// ABOUTME: Implements the execute recovery protocol: captcha, re-auth with a retry ceiling, batch retry.

use crate::auth::{CaptchaSolver, Credentials, IdentityKind, TokenProvider, UserCredentials};
use crate::error::{ApiError, AUTHORIZATION_FAILED, CAPTCHA_IS_NEEDED, INTERNAL_ERROR};
use crate::governor::RateGovernor;
use crate::script::{escape_newlines, is_script_failure, parse_documents, BatchCodec, MAX_BATCH_SIZE};
use crate::task::{ApiCall, RequestTask, Responder};
use crate::telemetry;
use crate::transport::ApiTransport;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Consecutive recoveries allowed before a session is permanently disabled
pub const MAX_RETRIES: u32 = 10;

/// Token acquisition attempts made at login and on every re-authentication
pub const LOGIN_ATTEMPTS: usize = 5;

/// Pause before retrying after VK reports an internal error
const INTERNAL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Captcha solutions tried for one call before it fails
pub const CAPTCHA_ATTEMPTS: u32 = 3;

/// What counts against the rate window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeterMode {
    /// Each HTTP execute request costs one unit
    #[default]
    Requests,
    /// Each sub-call inside a batch costs one unit; batch width is clamped to what is left
    Calls,
}

/// Error payload as VK reports it
#[derive(Debug, Clone, Deserialize)]
struct RemoteError {
    #[serde(default)]
    error_code: i64,
    #[serde(default)]
    error_msg: String,
    #[serde(default)]
    captcha_sid: Option<Value>,
    #[serde(default)]
    captcha_img: Option<String>,
}

impl RemoteError {
    fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or(RemoteError {
            error_code: 0,
            error_msg: value.to_string(),
            captcha_sid: None,
            captcha_img: None,
        })
    }

    fn into_api_error(self) -> ApiError {
        ApiError::Remote {
            code: self.error_code,
            message: self.error_msg,
        }
    }
}

/// One authenticated identity with its access token and recovery counter
pub struct Session {
    label: String,
    credentials: Credentials,
    token: String,
    retries: u32,
    transport: Arc<dyn ApiTransport>,
    tokens: Arc<dyn TokenProvider>,
    captcha: Arc<dyn CaptchaSolver>,
    governor: Option<Arc<RateGovernor>>,
}

impl Session {
    pub fn new(
        label: impl Into<String>,
        credentials: Credentials,
        transport: Arc<dyn ApiTransport>,
        tokens: Arc<dyn TokenProvider>,
        captcha: Arc<dyn CaptchaSolver>,
    ) -> Self {
        let token = match &credentials {
            Credentials::Group { token } => token.clone(),
            Credentials::User(_) => String::new(),
        };
        Self {
            label: label.into(),
            credentials,
            token,
            retries: 0,
            transport,
            tokens,
            captcha,
            governor: None,
        }
    }

    /// Gate every request this session sends, re-issues included, on `governor`
    pub fn set_governor(&mut self, governor: Arc<RateGovernor>) {
        self.governor = Some(governor);
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kind(&self) -> IdentityKind {
        self.credentials.kind()
    }

    /// Consecutive recoveries since the last successful response
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// True once the retry ceiling has been exceeded; no further network I/O happens
    pub fn is_disabled(&self) -> bool {
        self.retries > MAX_RETRIES
    }

    /// Acquire a token (user accounts) and verify it with a profile lookup.
    ///
    /// Returns the profile object VK reports for this identity.
    pub async fn login(&mut self) -> Result<Value, ApiError> {
        if let Credentials::User(creds) = &self.credentials {
            let token = obtain_with_retries(self.tokens.as_ref(), creds)
                .await
                .ok_or_else(|| {
                    ApiError::Login(format!("could not obtain token for {}", creds.username))
                })?;
            self.token = token;
        }

        let (script, name_field) = match self.kind() {
            IdentityKind::User => ("return API.account.getProfileInfo();", "first_name"),
            IdentityKind::Group => ("return API.groups.getById();", "name"),
        };

        let response = self.execute(script).await?;
        let profile = match response {
            Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
            other => other,
        };

        let name = profile
            .get(name_field)
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let screen_name = profile
            .get("screen_name")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        tracing::info!(
            client = %self.label,
            kind = %self.kind(),
            display_name = %name,
            screen_name = %screen_name,
            "Logged in to VK"
        );

        Ok(profile)
    }

    /// Run one VKScript body through the recovery protocol.
    ///
    /// Returns the raw `response` value on success. Captcha challenges are solved and
    /// re-issued, auth/internal errors trigger re-authentication (users only) until the
    /// retry ceiling, and any other error code fails the whole call.
    pub async fn execute(&mut self, code: &str) -> Result<Value, ApiError> {
        self.execute_with_cost(code, 1).await
    }

    /// `execute`, charging `cost` units to the governor before every request it sends
    pub async fn execute_with_cost(&mut self, code: &str, cost: u32) -> Result<Value, ApiError> {
        let body = escape_newlines(code);
        let mut extra: Vec<(String, String)> = Vec::new();
        let mut captcha_attempts = 0;

        loop {
            if self.is_disabled() {
                tracing::warn!(
                    client = %self.label,
                    retries = self.retries,
                    "Client exceeded recovery ceiling, refusing to call VK"
                );
                return Err(ApiError::ClientDisabled);
            }

            let mut form = Vec::with_capacity(extra.len() + 1);
            form.push(("code".to_string(), body.clone()));
            form.extend(extra.iter().cloned());

            if let Some(governor) = &self.governor {
                governor.ready().await;
                governor.record_issues(cost);
            }
            let text = self.transport.post_execute(&self.token, &form).await?;
            let documents =
                parse_documents(&text).map_err(|e| ApiError::Decode(e.to_string()))?;

            let mut errors: Vec<RemoteError> = Vec::new();
            let mut captcha: Option<RemoteError> = None;

            for document in &documents {
                if let Some(error) = document.get("error") {
                    let error = RemoteError::from_value(error);
                    if error.error_code == CAPTCHA_IS_NEEDED {
                        captcha = Some(error);
                        break;
                    }
                    errors.push(error);
                }

                if let Some(response) = document.get("response") {
                    for error in &errors {
                        tracing::warn!(
                            client = %self.label,
                            code = error.error_code,
                            message = %error.error_msg,
                            "VK reported an error alongside a response"
                        );
                    }
                    self.retries = 0;

                    if is_script_failure(response) {
                        let execute_errors = document
                            .get("execute_errors")
                            .map(|v| v.to_string())
                            .unwrap_or_else(|| "unknown".to_string());
                        tracing::error!(
                            client = %self.label,
                            execute_errors = %execute_errors,
                            "VKScript execution failed"
                        );
                    }

                    return Ok(response.clone());
                }
            }

            if let Some(challenge) = captcha {
                metrics::counter!(telemetry::CAPTCHA_TOTAL).increment(1);
                self.retries += 1;
                captcha_attempts += 1;
                if captcha_attempts > CAPTCHA_ATTEMPTS {
                    tracing::warn!(
                        client = %self.label,
                        attempts = captcha_attempts - 1,
                        "Captcha solutions keep being rejected, failing call"
                    );
                    return Err(ApiError::CaptchaUnsolved);
                }
                let image = challenge.captcha_img.unwrap_or_default();
                let Some(solution) = self.captcha.solve(&image).await else {
                    tracing::warn!(client = %self.label, "Captcha left unsolved, failing call");
                    return Err(ApiError::CaptchaUnsolved);
                };
                let sid = match challenge.captcha_sid {
                    Some(Value::String(s)) => s,
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                extra = vec![
                    ("captcha_key".to_string(), solution),
                    ("captcha_sid".to_string(), sid),
                ];
                continue;
            }

            let internal = errors.iter().any(|e| e.error_code == INTERNAL_ERROR);
            let auth = errors.iter().any(|e| e.error_code == AUTHORIZATION_FAILED);

            if internal || auth {
                self.retries += 1;
                metrics::counter!(telemetry::REAUTH_TOTAL).increment(1);

                let Credentials::User(creds) = &self.credentials else {
                    tracing::warn!(
                        client = %self.label,
                        retries = self.retries,
                        "Group token rejected by VK and cannot be refreshed"
                    );
                    let first = errors.into_iter().next();
                    return Err(first.map(RemoteError::into_api_error).unwrap_or(
                        ApiError::Remote {
                            code: AUTHORIZATION_FAILED,
                            message: String::new(),
                        },
                    ));
                };

                tracing::warn!(
                    client = %self.label,
                    retries = self.retries,
                    internal,
                    "VK rejected the session, re-acquiring token"
                );
                match obtain_with_retries(self.tokens.as_ref(), creds).await {
                    Some(token) => self.token = token,
                    None => tracing::error!(client = %self.label, "Token re-acquisition failed"),
                }

                if internal {
                    tokio::time::sleep(INTERNAL_ERROR_BACKOFF).await;
                }
                extra.clear();
                continue;
            }

            return match errors.into_iter().next() {
                Some(error) => {
                    tracing::error!(
                        client = %self.label,
                        code = error.error_code,
                        message = %error.error_msg,
                        "VK execute call failed"
                    );
                    Err(error.into_api_error())
                }
                None => Err(ApiError::Decode(
                    "response contained neither error nor response".to_string(),
                )),
            };
        }
    }
}

async fn obtain_with_retries(
    tokens: &dyn TokenProvider,
    credentials: &UserCredentials,
) -> Option<String> {
    for attempt in 1..=LOGIN_ATTEMPTS {
        if let Some(token) = tokens.obtain_token(credentials).await {
            return Some(token);
        }
        tracing::warn!(
            username = %credentials.username,
            attempt,
            "Failed to obtain access token"
        );
    }
    None
}

/// Drains one client's queue into batched execute calls under the rate governor
pub struct BatchExecutor {
    session: Session,
    governor: Arc<RateGovernor>,
    codec: Arc<dyn BatchCodec>,
    queue: mpsc::UnboundedReceiver<RequestTask>,
    meter: MeterMode,
}

impl BatchExecutor {
    pub fn new(
        session: Session,
        governor: Arc<RateGovernor>,
        codec: Arc<dyn BatchCodec>,
        queue: mpsc::UnboundedReceiver<RequestTask>,
        meter: MeterMode,
    ) -> Self {
        let mut session = session;
        session.set_governor(Arc::clone(&governor));
        Self {
            session,
            governor,
            codec,
            queue,
            meter,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Loop until every queue sender is gone: wait for work, wait for budget, run a batch
    pub async fn run_forever(mut self) {
        loop {
            let Some(first) = self.queue.recv().await else {
                tracing::debug!(client = %self.session.label, "Request queue closed");
                return;
            };

            self.governor.ready().await;

            let width = self.batch_width();
            let mut tasks = Vec::with_capacity(width);
            tasks.push(first);
            while tasks.len() < width {
                match self.queue.try_recv() {
                    Ok(task) => tasks.push(task),
                    Err(_) => break,
                }
            }

            metrics::gauge!(telemetry::QUEUE_DEPTH, "client" => self.session.label.clone())
                .set(self.queue.len() as f64);

            self.run_batch(tasks).await;
        }
    }

    fn batch_width(&self) -> usize {
        match self.meter {
            MeterMode::Requests => MAX_BATCH_SIZE,
            MeterMode::Calls => (self.governor.remaining() as usize).clamp(1, MAX_BATCH_SIZE),
        }
    }

    /// Governor units one request carrying `calls` sub-calls costs
    fn cost(&self, calls: usize) -> u32 {
        match self.meter {
            MeterMode::Requests => 1,
            MeterMode::Calls => calls as u32,
        }
    }

    /// Execute one batch and resolve every contained task exactly once
    pub async fn run_batch(&mut self, tasks: Vec<RequestTask>) {
        if tasks.is_empty() {
            return;
        }

        let (calls, responders): (Vec<ApiCall>, Vec<Responder>) =
            tasks.into_iter().map(RequestTask::into_parts).unzip();
        let count = calls.len();

        if self.session.is_disabled() {
            for responder in responders {
                responder.resolve(Err(ApiError::ClientDisabled));
            }
            return;
        }

        let refs: Vec<&ApiCall> = calls.iter().collect();
        let code = self.codec.compile(&refs);

        tracing::debug!(client = %self.session.label, calls = count, "Dispatching batch");
        metrics::counter!(telemetry::BATCHES_TOTAL).increment(1);
        metrics::counter!(telemetry::CALLS_TOTAL).increment(count as u64);

        let cost = self.cost(count);
        let mut result = self.session.execute_with_cost(&code, cost).await;

        if let Err(e) = &result {
            if e.is_transient() {
                tracing::warn!(
                    client = %self.session.label,
                    error = %e,
                    "Transient failure, retrying batch once"
                );
                result = self.session.execute_with_cost(&code, cost).await;
            }
        }

        match result {
            Ok(response) => {
                let values = self.codec.split(response, count);
                for (responder, value) in responders.into_iter().zip(values) {
                    responder.resolve(Ok(value));
                }
            }
            Err(e) => {
                tracing::error!(
                    client = %self.session.label,
                    calls = count,
                    error = %e,
                    "Batch failed, failing all contained calls"
                );
                metrics::counter!(telemetry::BATCH_FAILURES_TOTAL).increment(1);
                for responder in responders {
                    responder.resolve(Err(e.clone()));
                }
            }
        }
    }
}

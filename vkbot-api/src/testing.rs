// ABOUTME: Test doubles for the outbound side: scripted HTTP transport, uploader and recording collaborators.
// ABOUTME: Lets executor/pool tests run without network access and inspect every request sent.

use crate::auth::{CaptchaSolver, TokenProvider, UserCredentials};
use crate::error::TransportError;
use crate::transport::ApiTransport;
use crate::upload::UploadTransport;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One request as the transport saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub access_token: String,
    pub form: Vec<(String, String)>,
}

impl RecordedRequest {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.form
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The compiled script body
    pub fn code(&self) -> &str {
        self.param("code").unwrap_or("")
    }

    /// Number of `API.` sub-calls in the script body
    pub fn sub_calls(&self) -> usize {
        self.code().matches("API.").count()
    }
}

type Responder = dyn Fn(&RecordedRequest) -> Result<String, TransportError> + Send + Sync;

/// Transport that answers from a queue of scripted replies, then from an optional fallback
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    replies: Arc<Mutex<VecDeque<Result<String, TransportError>>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    fallback: Option<Arc<Responder>>,
    latency: Option<Duration>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a raw response body
    pub fn reply(self, body: &str) -> Self {
        self.push(Ok(body.to_string()));
        self
    }

    /// Queue a transport failure
    pub fn reply_error(self, error: TransportError) -> Self {
        self.push(Err(error));
        self
    }

    /// Answer with `f` once the scripted replies run out
    pub fn fallback<F>(mut self, f: F) -> Self
    where
        F: Fn(&RecordedRequest) -> Result<String, TransportError> + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(f));
        self
    }

    /// Sleep this long before answering each request
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Answer every batch with `[1, 2, ..., n]` sized to its sub-call count
    pub fn echo_indices(self) -> Self {
        self.fallback(|request| {
            let items: Vec<String> = (1..=request.sub_calls()).map(|i| i.to_string()).collect();
            Ok(format!(r#"{{"response": [{}]}}"#, items.join(", ")))
        })
    }

    pub fn push(&self, reply: Result<String, TransportError>) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(reply);
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ApiTransport for ScriptedTransport {
    async fn post_execute(
        &self,
        access_token: &str,
        form: &[(String, String)],
    ) -> Result<String, TransportError> {
        let request = RecordedRequest {
            access_token: access_token.to_string(),
            form: form.to_vec(),
        };
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let scripted = self.replies.lock().ok().and_then(|mut r| r.pop_front());
        match (scripted, &self.fallback) {
            (Some(reply), _) => reply,
            (None, Some(fallback)) => fallback(&request),
            (None, None) => Err(TransportError::Connection(
                "no scripted reply left".to_string(),
            )),
        }
    }
}

/// One file as the upload server saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedUpload {
    pub url: String,
    pub field: String,
    pub file_name: String,
    pub size: usize,
}

/// Upload server that answers from a queue of scripted bodies
#[derive(Debug, Default)]
pub struct ScriptedUploader {
    replies: Mutex<VecDeque<Result<String, TransportError>>>,
    uploads: Mutex<Vec<RecordedUpload>>,
}

impl ScriptedUploader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, body: &str) -> Self {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(Ok(body.to_string()));
        }
        self
    }

    pub fn uploads(&self) -> Vec<RecordedUpload> {
        self.uploads.lock().map(|u| u.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl UploadTransport for ScriptedUploader {
    async fn upload(
        &self,
        url: &str,
        field: &str,
        file_name: &str,
        data: Vec<u8>,
    ) -> Result<String, TransportError> {
        if let Ok(mut uploads) = self.uploads.lock() {
            uploads.push(RecordedUpload {
                url: url.to_string(),
                field: field.to_string(),
                file_name: file_name.to_string(),
                size: data.len(),
            });
        }
        self.replies
            .lock()
            .ok()
            .and_then(|mut r| r.pop_front())
            .unwrap_or_else(|| Err(TransportError::Connection("no scripted upload reply left".to_string())))
    }
}

/// Token provider that hands out a fixed token and counts invocations
#[derive(Debug, Default)]
pub struct RecordingTokenProvider {
    token: Option<String>,
    calls: AtomicUsize,
}

impl RecordingTokenProvider {
    pub fn new(token: &str) -> Self {
        Self {
            token: Some(token.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Provider that never produces a token
    pub fn failing() -> Self {
        Self::default()
    }

    pub fn invocations(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for RecordingTokenProvider {
    async fn obtain_token(&self, _credentials: &UserCredentials) -> Option<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.token.clone()
    }
}

/// Captcha solver with a canned answer that remembers the images it was shown
#[derive(Debug, Default)]
pub struct ScriptedCaptcha {
    solution: Option<String>,
    seen: Mutex<Vec<String>>,
}

impl ScriptedCaptcha {
    pub fn new(solution: Option<&str>) -> Self {
        Self {
            solution: solution.map(str::to_string),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn urls(&self) -> Vec<String> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CaptchaSolver for ScriptedCaptcha {
    async fn solve(&self, image_url: &str) -> Option<String> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(image_url.to_string());
        }
        self.solution.clone()
    }
}

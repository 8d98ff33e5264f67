// ABOUTME: ClientPool - routes calls to user or group clients by method capability and round-robin.
// ABOUTME: Offers sync, fire-and-forget and deferred wait modes plus VK helpers such as media uploads.

use crate::auth::{IdentityKind, Sender};
use crate::client::ApiClient;
use crate::error::{ApiError, CallOutcome};
use crate::task::{ApiCall, Params, PendingCall, RequestTask};
use crate::upload::{Attachment, HttpUploader, PhotoQuota, UploadTransport};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Ceiling for synchronous calls
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(90);

const GROUP_METHODS: &[&str] = &[
    "messages.send",
    "messages.getLongPollServer",
    "messages.getById",
    "messages.markAsRead",
    "groups.getById",
    "photos.getMessagesUploadServer",
    "photos.saveMessagesPhoto",
    "docs.getWallUploadServer",
    "docs.save",
    "users.get",
    "utils.resolveScreenName",
];

const USER_METHODS: &[&str] = &[
    "account.getProfileInfo",
    "account.setOnline",
    "friends.add",
    "friends.delete",
    "friends.get",
    "friends.getRequests",
    "status.set",
    "wall.post",
];

/// Which methods a group token may call, and which only a user token may call.
/// Methods in neither list go to user clients unless a sender is given.
#[derive(Debug, Clone)]
pub struct MethodCapabilities {
    group_callable: HashSet<String>,
    user_only: HashSet<String>,
}

impl Default for MethodCapabilities {
    fn default() -> Self {
        Self {
            group_callable: GROUP_METHODS.iter().map(|m| m.to_string()).collect(),
            user_only: USER_METHODS.iter().map(|m| m.to_string()).collect(),
        }
    }
}

impl MethodCapabilities {
    pub fn with_group_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for method in methods {
            let method = method.into();
            self.user_only.remove(&method);
            self.group_callable.insert(method);
        }
        self
    }

    pub fn with_user_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for method in methods {
            let method = method.into();
            self.group_callable.remove(&method);
            self.user_only.insert(method);
        }
        self
    }

    pub fn is_group_callable(&self, method: &str) -> bool {
        self.group_callable.contains(method)
    }

    pub fn is_user_only(&self, method: &str) -> bool {
        self.user_only.contains(method)
    }
}

/// How a caller wants to observe a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Block up to the pool's call timeout
    Sync,
    /// Enqueue and return immediately
    FireAndForget,
    /// Return the unresolved handle
    Deferred,
}

/// What `ClientPool::call` hands back, depending on the wait mode
#[derive(Debug)]
pub enum CallReply {
    Done(Option<Value>),
    Sent,
    Pending(PendingCall),
}

/// All authenticated clients, sharded by identity kind
#[derive(Debug)]
pub struct ClientPool {
    users: Vec<ApiClient>,
    groups: Vec<ApiClient>,
    capabilities: MethodCapabilities,
    next_user: AtomicUsize,
    next_group: AtomicUsize,
    call_timeout: Duration,
    uploader: Arc<dyn UploadTransport>,
    photo_quota: PhotoQuota,
    group_id: Option<i64>,
}

impl ClientPool {
    pub fn new(clients: Vec<ApiClient>) -> Self {
        let (users, groups): (Vec<_>, Vec<_>) = clients
            .into_iter()
            .partition(|c| c.identity_kind() == IdentityKind::User);
        Self {
            users,
            groups,
            capabilities: MethodCapabilities::default(),
            next_user: AtomicUsize::new(0),
            next_group: AtomicUsize::new(0),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            uploader: Arc::new(HttpUploader::default()),
            photo_quota: PhotoQuota::default(),
            group_id: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: MethodCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_uploader(mut self, uploader: Arc<dyn UploadTransport>) -> Self {
        self.uploader = uploader;
        self
    }

    pub fn with_photo_quota(mut self, quota: PhotoQuota) -> Self {
        self.photo_quota = quota;
        self
    }

    /// Community passed to `docs.getWallUploadServer`
    pub fn with_group_id(mut self, group_id: Option<i64>) -> Self {
        self.group_id = group_id;
        self
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Routing when the caller gave no hint: group clients for group-callable methods, else users
    pub fn default_sender(&self, method: &str) -> Sender {
        if !self.groups.is_empty() && self.capabilities.is_group_callable(method) {
            Sender::Group(self.next_group.fetch_add(1, Ordering::Relaxed))
        } else {
            Sender::User(self.next_user.fetch_add(1, Ordering::Relaxed))
        }
    }

    fn select(&self, sender: Sender) -> Option<&ApiClient> {
        let clients = match sender.kind() {
            IdentityKind::User => &self.users,
            IdentityKind::Group => &self.groups,
        };
        if clients.is_empty() {
            return None;
        }
        clients.get(sender.index() % clients.len())
    }

    /// Route, enqueue and observe one call.
    ///
    /// A user-only method routed to a group fails with `WrongIdentity`, and a missing
    /// client of the routed kind fails with `NoClient`. Neither reaches a queue.
    pub async fn call(
        &self,
        method: &str,
        params: Params,
        wait: WaitMode,
        sender: Option<Sender>,
    ) -> Result<CallReply, ApiError> {
        let sender = sender.unwrap_or_else(|| self.default_sender(method));
        if sender.kind() == IdentityKind::Group && self.capabilities.is_user_only(method) {
            tracing::error!(method = %method, "User-only method routed to a group client");
            return Err(ApiError::WrongIdentity {
                kind: IdentityKind::Group,
                method: method.to_string(),
            });
        }
        let Some(client) = self.select(sender) else {
            tracing::error!(method = %method, kind = %sender.kind(), "No client configured for call");
            return Err(ApiError::NoClient {
                kind: sender.kind(),
                method: method.to_string(),
            });
        };

        let (task, pending) = RequestTask::new(ApiCall {
            method: method.to_string(),
            params,
            sender,
        });
        client.enqueue(task);

        match wait {
            WaitMode::Sync => pending
                .await_result(self.call_timeout)
                .await
                .map(CallReply::Done),
            WaitMode::FireAndForget => Ok(CallReply::Sent),
            WaitMode::Deferred => Ok(CallReply::Pending(pending)),
        }
    }

    /// Call and wait for the result
    pub async fn call_sync(&self, method: &str, params: Params) -> CallOutcome {
        self.call_as(method, params, None).await
    }

    pub async fn call_as(&self, method: &str, params: Params, sender: Option<Sender>) -> CallOutcome {
        match self.call(method, params, WaitMode::Sync, sender).await? {
            CallReply::Done(value) => Ok(value),
            CallReply::Sent | CallReply::Pending(_) => Ok(None),
        }
    }

    /// Fire-and-forget
    pub async fn send(&self, method: &str, params: Params) -> Result<(), ApiError> {
        self.call(method, params, WaitMode::FireAndForget, None)
            .await
            .map(|_| ())
    }

    pub async fn defer(&self, method: &str, params: Params) -> Result<PendingCall, ApiError> {
        match self.call(method, params, WaitMode::Deferred, None).await? {
            CallReply::Pending(pending) => Ok(pending),
            CallReply::Done(_) | CallReply::Sent => Err(ApiError::Dropped),
        }
    }

    /// Translate a screen name (or `club123` style alias) into a numeric id
    pub async fn resolve_screen_name(&self, screen_name: &str) -> Result<Option<i64>, ApiError> {
        let stripped = ["club", "public", "event"]
            .iter()
            .fold(screen_name.to_string(), |name, prefix| name.replace(prefix, ""));
        if let Ok(id) = stripped.parse::<i64>() {
            return Ok(Some(id));
        }

        let result = self
            .call_sync(
                "utils.resolveScreenName",
                Params::new().with("screen_name", &stripped),
            )
            .await?;

        Ok(result
            .as_ref()
            .and_then(|v| v.get("object_id"))
            .and_then(|id| match id {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.parse().ok(),
                _ => None,
            }))
    }

    pub async fn mark_as_read(&self, message_ids: &[i64]) -> Result<(), ApiError> {
        let ids: Vec<String> = message_ids.iter().map(|id| id.to_string()).collect();
        self.send(
            "messages.markAsRead",
            Params::new().with("message_ids", ids.join(",")),
        )
        .await
    }

    async fn upload_url(
        &self,
        method: &str,
        params: Params,
        sender: Sender,
    ) -> Result<String, ApiError> {
        let reply = self.call_as(method, params, Some(sender)).await?;
        reply
            .as_ref()
            .and_then(|v| v.get("upload_url"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ApiError::Decode(format!("{} returned no upload_url", method)))
    }

    /// POST the file; `None` when the upload server answered with an empty body
    async fn post_file(
        &self,
        url: &str,
        field: &str,
        file_name: &str,
        data: Vec<u8>,
    ) -> Result<Option<Value>, ApiError> {
        let body = self.uploader.upload(url, field, file_name, data).await?;
        let value: Value =
            serde_json::from_str(&body).map_err(|e| ApiError::Decode(e.to_string()))?;
        let empty = match &value {
            Value::Null => true,
            Value::Object(fields) => fields.is_empty(),
            Value::String(s) => s.is_empty(),
            _ => false,
        };
        Ok((!empty).then_some(value))
    }

    /// Upload an image for use in messages.
    ///
    /// Returns `Ok(None)` once the daily photo quota is spent or when the upload
    /// server accepted nothing.
    pub async fn upload_photo(&self, data: Vec<u8>) -> Result<Option<Attachment>, ApiError> {
        if !self.photo_quota.try_acquire() {
            tracing::warn!(limit = self.photo_quota.limit(), "Daily photo upload limit reached");
            return Ok(None);
        }

        let sender = self.default_sender("photos.getMessagesUploadServer");
        let url = self
            .upload_url("photos.getMessagesUploadServer", Params::new(), sender)
            .await?;
        let Some(uploaded) = self.post_file(&url, "photo", "picture.png", data).await? else {
            return Ok(None);
        };

        let params = Params::new()
            .with("photo", field_text(&uploaded, "photo"))
            .with("hash", field_text(&uploaded, "hash"))
            .with("server", field_text(&uploaded, "server"));
        let saved = self
            .call_as("photos.saveMessagesPhoto", params, Some(sender))
            .await?;
        Ok(first_saved(saved).and_then(|s| Attachment::from_saved("photo", &s)))
    }

    /// Upload a file as a document
    pub async fn upload_doc(
        &self,
        data: Vec<u8>,
        file_name: &str,
    ) -> Result<Option<Attachment>, ApiError> {
        let sender = self.default_sender("docs.getWallUploadServer");
        let mut params = Params::new();
        if let Some(group_id) = self.group_id {
            params.insert("group_id", group_id);
        }
        let url = self
            .upload_url("docs.getWallUploadServer", params, sender)
            .await?;
        let Some(uploaded) = self.post_file(&url, "file", file_name, data).await? else {
            return Ok(None);
        };

        let saved = self
            .call_as(
                "docs.save",
                Params::new().with("file", field_text(&uploaded, "file")),
                Some(sender),
            )
            .await?;
        Ok(first_saved(saved).and_then(|s| Attachment::from_saved("doc", &s)))
    }
}

fn field_text(value: &Value, key: &str) -> String {
    match value.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Save methods answer with a list; newer API versions wrap documents as `{type, doc}`
fn first_saved(saved: Option<Value>) -> Option<Value> {
    let first = match saved? {
        Value::Array(items) => items.into_iter().next()?,
        other => other,
    };
    match first.get("doc") {
        Some(doc) => Some(doc.clone()),
        None => Some(first),
    }
}

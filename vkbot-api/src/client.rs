// ABOUTME: ApiClient - one authenticated identity with its queue, governor ticker and executor loop.
// ABOUTME: Enqueue never blocks; both background loops are aborted when the client is dropped.

use crate::auth::{IdentityKind, Sender};
use crate::error::ApiError;
use crate::executor::{BatchExecutor, MeterMode, Session};
use crate::governor::RateGovernor;
use crate::script::{BatchCodec, ExecuteScript};
use crate::task::{ApiCall, Params, PendingCall, RequestTask};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Per-client scheduling knobs
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub rate_window: Duration,
    pub rate_cap: u32,
    pub meter: MeterMode,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            rate_window: Duration::from_secs(1),
            rate_cap: 3,
            meter: MeterMode::default(),
        }
    }
}

/// Handle to a running client. Cheap to hold, owned by the pool.
#[derive(Debug)]
pub struct ApiClient {
    label: String,
    kind: IdentityKind,
    queue: mpsc::UnboundedSender<RequestTask>,
    governor: Arc<RateGovernor>,
    loops: Vec<JoinHandle<()>>,
}

impl ApiClient {
    /// Log the session in, then start its background loops.
    ///
    /// The rate window is already enforced for the login requests.
    pub async fn connect(mut session: Session, settings: ClientSettings) -> Result<Self, ApiError> {
        let governor = Arc::new(RateGovernor::new(settings.rate_window, settings.rate_cap));
        let ticker = spawn_ticker(&governor);
        session.set_governor(Arc::clone(&governor));
        if let Err(e) = session.login().await {
            ticker.abort();
            return Err(e);
        }
        Ok(Self::spawn(
            session,
            settings,
            Arc::new(ExecuteScript),
            governor,
            ticker,
        ))
    }

    /// Start the ticker and executor loops for an already authenticated session.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn start(session: Session, settings: ClientSettings) -> Self {
        Self::start_with_codec(session, settings, Arc::new(ExecuteScript))
    }

    pub fn start_with_codec(
        session: Session,
        settings: ClientSettings,
        codec: Arc<dyn BatchCodec>,
    ) -> Self {
        let governor = Arc::new(RateGovernor::new(settings.rate_window, settings.rate_cap));
        let ticker = spawn_ticker(&governor);
        Self::spawn(session, settings, codec, governor, ticker)
    }

    fn spawn(
        session: Session,
        settings: ClientSettings,
        codec: Arc<dyn BatchCodec>,
        governor: Arc<RateGovernor>,
        ticker: JoinHandle<()>,
    ) -> Self {
        let label = session.label().to_string();
        let kind = session.kind();
        let (queue, rx) = mpsc::unbounded_channel();

        let executor = BatchExecutor::new(
            session,
            Arc::clone(&governor),
            codec,
            rx,
            settings.meter,
        );
        let runner = tokio::spawn(executor.run_forever());

        tracing::debug!(
            client = %label,
            kind = %kind,
            cap = settings.rate_cap,
            window_ms = settings.rate_window.as_millis() as u64,
            "Started API client"
        );

        Self {
            label,
            kind,
            queue,
            governor,
            loops: vec![ticker, runner],
        }
    }

    pub fn identity_kind(&self) -> IdentityKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn governor(&self) -> &Arc<RateGovernor> {
        &self.governor
    }

    /// Append to the queue without blocking. A task that cannot be queued resolves as dropped.
    pub fn enqueue(&self, task: RequestTask) {
        if let Err(mpsc::error::SendError(task)) = self.queue.send(task) {
            tracing::error!(client = %self.label, method = %task.method(), "Executor loop is gone");
            task.resolve(Err(ApiError::Dropped));
        }
    }

    /// Build a task for this client, enqueue it and return the caller-side handle
    pub fn submit(&self, method: impl Into<String>, params: Params) -> PendingCall {
        let sender = match self.kind {
            IdentityKind::User => Sender::User(0),
            IdentityKind::Group => Sender::Group(0),
        };
        let (task, pending) = RequestTask::new(ApiCall {
            method: method.into(),
            params,
            sender,
        });
        self.enqueue(task);
        pending
    }
}

fn spawn_ticker(governor: &Arc<RateGovernor>) -> JoinHandle<()> {
    let governor = Arc::clone(governor);
    tokio::spawn(async move { governor.tick().await })
}

impl Drop for ApiClient {
    fn drop(&mut self) {
        for handle in &self.loops {
            handle.abort();
        }
    }
}

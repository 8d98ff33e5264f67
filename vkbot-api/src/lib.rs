// ABOUTME: Outbound VK API client: batched `execute` calls under a per-client rate window.
// ABOUTME: Tasks are queued per identity, compiled 25-wide into VKScript and demultiplexed back.

pub mod auth;
pub mod client;
pub mod error;
pub mod executor;
pub mod governor;
pub mod pool;
pub mod script;
pub mod task;
pub mod telemetry;
pub mod testing;
pub mod transport;
pub mod upload;

pub use auth::{
    CaptchaSolver, Credentials, IdentityKind, NoCaptchaSolver, NoTokenProvider, Sender,
    StaticTokenProvider, TokenProvider, UserCredentials,
};
pub use client::{ApiClient, ClientSettings};
pub use error::{ApiError, CallOutcome, TransportError};
pub use executor::{BatchExecutor, MeterMode, Session, MAX_RETRIES};
pub use governor::RateGovernor;
pub use pool::{CallReply, ClientPool, MethodCapabilities, WaitMode};
pub use script::{BatchCodec, ExecuteScript, MAX_BATCH_SIZE};
pub use task::{ApiCall, Params, PendingCall, RequestTask};
pub use transport::{ApiTransport, HttpTransport, ProxySettings};
pub use upload::{Attachment, HttpUploader, PhotoQuota, UploadTransport, DAILY_PHOTO_LIMIT};

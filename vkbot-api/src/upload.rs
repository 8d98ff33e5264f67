// ABOUTME: Media uploads: the multipart POST seam, saved attachment parsing and the daily photo quota.
// ABOUTME: ClientPool drives the full flow (ask for an upload server, POST the file, save it).

use crate::error::TransportError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// VK rejects photo uploads past roughly 7000 a day
pub const DAILY_PHOTO_LIMIT: u32 = 6969;

const QUOTA_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Posts one file to an upload server and returns the raw body text
#[async_trait]
pub trait UploadTransport: std::fmt::Debug + Send + Sync {
    async fn upload(
        &self,
        url: &str,
        field: &str,
        file_name: &str,
        data: Vec<u8>,
    ) -> Result<String, TransportError>;
}

/// reqwest-backed multipart uploader
#[derive(Debug, Clone, Default)]
pub struct HttpUploader {
    http: reqwest::Client,
}

impl HttpUploader {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl UploadTransport for HttpUploader {
    async fn upload(
        &self,
        url: &str,
        field: &str,
        file_name: &str,
        data: Vec<u8>,
    ) -> Result<String, TransportError> {
        let part = reqwest::multipart::Part::bytes(data).file_name(file_name.to_string());
        let form = reqwest::multipart::Form::new().part(field.to_string(), part);
        let response = self.http.post(url).multipart(form).send().await?;

        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }

        Ok(response.text().await?)
    }
}

/// A stored photo or document that can be attached to an outgoing message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub kind: String,
    pub owner_id: i64,
    pub id: i64,
    pub access_key: Option<String>,
    /// Direct link: the document url, or the largest photo preview
    pub url: String,
}

impl Attachment {
    /// Read the object returned by `photos.saveMessagesPhoto` or `docs.save`
    pub fn from_saved(kind: &str, saved: &Value) -> Option<Self> {
        let owner_id = saved.get("owner_id").and_then(as_i64)?;
        let id = saved.get("id").and_then(as_i64)?;
        let url = saved
            .get("url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| largest_preview(saved))
            .unwrap_or_default();
        let access_key = saved
            .get("access_key")
            .and_then(Value::as_str)
            .filter(|key| !key.is_empty())
            .map(str::to_string);

        Some(Self {
            kind: kind.to_string(),
            owner_id,
            id,
            access_key,
            url,
        })
    }
}

/// `photo123_456` or `photo123_456_key`, the form the `attachment` parameter takes
impl std::fmt::Display for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}_{}", self.kind, self.owner_id, self.id)?;
        if let Some(key) = &self.access_key {
            write!(f, "_{}", key)?;
        }
        Ok(())
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn largest_preview(saved: &Value) -> Option<String> {
    saved
        .as_object()?
        .iter()
        .filter_map(|(key, value)| {
            let size: u32 = key.strip_prefix("photo_")?.parse().ok()?;
            Some((size, value.as_str()?))
        })
        .max_by_key(|(size, _)| *size)
        .map(|(_, url)| url.to_string())
}

#[derive(Debug)]
struct QuotaWindow {
    started: Instant,
    used: u32,
}

/// Counts photo uploads per day and refuses them once the limit is reached
#[derive(Debug)]
pub struct PhotoQuota {
    limit: u32,
    period: Duration,
    window: Mutex<QuotaWindow>,
}

impl Default for PhotoQuota {
    fn default() -> Self {
        Self::new(DAILY_PHOTO_LIMIT)
    }
}

impl PhotoQuota {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            period: QUOTA_PERIOD,
            window: Mutex::new(QuotaWindow {
                started: Instant::now(),
                used: 0,
            }),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Take one upload slot. The count starts over a day after the window opened.
    pub fn try_acquire(&self) -> bool {
        let Ok(mut window) = self.window.lock() else {
            return false;
        };
        if window.started.elapsed() >= self.period {
            window.started = Instant::now();
            window.used = 0;
        }
        if window.used >= self.limit {
            return false;
        }
        window.used += 1;
        true
    }

    pub fn used(&self) -> u32 {
        self.window.lock().map(|w| w.used).unwrap_or(self.limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_photo_attachment_picks_largest_preview() {
        let saved = json!({
            "id": 456,
            "owner_id": 123,
            "photo_75": "https://cdn/75.jpg",
            "photo_1280": "https://cdn/1280.jpg",
            "photo_604": "https://cdn/604.jpg"
        });
        let attachment = Attachment::from_saved("photo", &saved).unwrap();
        assert_eq!(attachment.url, "https://cdn/1280.jpg");
        assert_eq!(attachment.to_string(), "photo123_456");
    }

    #[test]
    fn test_document_attachment_prefers_url_and_keeps_access_key() {
        let saved = json!({
            "id": "9",
            "owner_id": -77,
            "url": "https://vk.com/doc-77_9",
            "photo_130": "https://cdn/thumb.jpg",
            "access_key": "abc"
        });
        let attachment = Attachment::from_saved("doc", &saved).unwrap();
        assert_eq!(attachment.url, "https://vk.com/doc-77_9");
        assert_eq!(attachment.to_string(), "doc-77_9_abc");
    }

    #[test]
    fn test_saved_object_without_ids_is_rejected() {
        assert_eq!(Attachment::from_saved("photo", &json!({"id": 1})), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_photo_quota_refuses_until_the_next_day() {
        let quota = PhotoQuota::new(2);
        assert!(quota.try_acquire());
        assert!(quota.try_acquire());
        assert!(!quota.try_acquire());
        assert_eq!(quota.used(), 2);

        tokio::time::advance(Duration::from_secs(23 * 60 * 60)).await;
        assert!(!quota.try_acquire());

        tokio::time::advance(Duration::from_secs(60 * 60)).await;
        assert!(quota.try_acquire());
        assert_eq!(quota.used(), 1);
    }
}

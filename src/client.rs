//! Outbound request pipeline for the upstream chat provider.
//!
//! The client is an explicitly constructed, explicitly owned instance; its
//! configuration travels through `ProviderConfig`, never through globals.
//! Failures are classified into the `ChatError` taxonomy before anyone gets
//! to see them, so retry eligibility is decided by the classification alone.

use crate::constants::{
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_REQUEST_TIMEOUT_SECS, MAX_RETRIES, RETRY_BASE_DELAY_MS,
};
use crate::history::{ConversationBackend, ConversationPage, ConversationSummary, MessagePage};
use crate::types::{
    AttachmentSource, ChatError, ConversationId, FileAttachment, Result, TurnRequest, UserId,
};
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: String,
    pub user: UserId,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_retries: u32,
}

impl ProviderConfig {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        user: impl Into<UserId>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            user: user.into(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            max_retries: MAX_RETRIES,
        }
    }
}

/// Maps an HTTP status (with its body) onto the failure taxonomy.
pub fn classify_status(status: u16, body: String) -> ChatError {
    match status {
        401 => ChatError::Unauthorized(body),
        429 => ChatError::RateLimited(body),
        500..=599 => ChatError::UpstreamServerError(status, body),
        other => ChatError::UpstreamRejected(other, body),
    }
}

/// Maps a transport-level failure onto the taxonomy.
pub fn classify_transport(err: &reqwest::Error) -> ChatError {
    if err.is_timeout() {
        ChatError::Timeout
    } else {
        ChatError::NetworkUnavailable(err.to_string())
    }
}

fn stream_io_error(err: reqwest::Error) -> std::io::Error {
    if err.is_timeout() {
        std::io::Error::new(std::io::ErrorKind::TimedOut, err)
    } else {
        std::io::Error::other(err)
    }
}

pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
        }
    }

    /// Delay before the nth retry (1-based): exponential with ±25% jitter.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let base_delay = self.base_delay_ms * 2u64.pow(retry.saturating_sub(1));
        let jitter_range = base_delay / 4;
        let jitter = if jitter_range > 0 {
            fastrand::i64(-(jitter_range as i64)..jitter_range as i64)
        } else {
            0
        };
        Duration::from_millis((base_delay as i64 + jitter).max(1) as u64)
    }

    pub async fn execute_with_retry<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0;
        loop {
            match operation().await {
                Ok(val) => return Ok(val),
                Err(e) if retries < self.max_retries && e.inner.is_retryable() => {
                    retries += 1;
                    let delay = self.backoff_delay(retries);
                    tracing::warn!(
                        "[CLIENT] Upstream attempt failed (retry {}/{}): {}. Retrying in {:?}...",
                        retries,
                        self.max_retries,
                        e.inner,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[derive(Serialize)]
struct ChatMessageBody {
    inputs: serde_json::Value,
    query: String,
    response_mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<String>,
    user: String,
    files: Vec<OutboundFileRef>,
    auto_generate_name: bool,
}

#[derive(Serialize)]
struct OutboundFileRef {
    #[serde(rename = "type")]
    kind: &'static str,
    transfer_method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    upload_file_id: Option<String>,
}

fn outbound_files(files: &[FileAttachment]) -> Vec<OutboundFileRef> {
    files
        .iter()
        .filter_map(|file| match &file.source {
            AttachmentSource::Url { url } => Some(OutboundFileRef {
                kind: file.kind.provider_label(),
                transfer_method: "remote_url",
                url: Some(url.clone()),
                upload_file_id: None,
            }),
            AttachmentSource::UploadRef { upload_id } => Some(OutboundFileRef {
                kind: file.kind.provider_label(),
                transfer_method: "local_file",
                url: None,
                upload_file_id: Some(upload_id.clone()),
            }),
            AttachmentSource::Inline { .. } => {
                tracing::warn!(
                    "[CLIENT] Inline attachment {} has no upstream transfer method; skipping",
                    file.name
                );
                None
            }
        })
        .collect()
}

/// The upstream provider client. One instance per configured endpoint; owned
/// by whoever owns the session registry.
#[derive(Clone)]
pub struct ProviderClient {
    http: reqwest::Client,
    config: ProviderConfig,
}

impl ProviderClient {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .build()
            .map_err(|e| ChatError::Internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    pub fn base_url(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    pub fn user(&self) -> &str {
        &self.config.user.0
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.config.max_retries, RETRY_BASE_DELAY_MS)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url(), path.trim_start_matches('/'))
    }

    /// Issues one conversation turn and hands back the raw response stream.
    /// Session state is untouched here; that is the stream consumer's job.
    pub async fn send_chat(
        &self,
        request: &TurnRequest,
    ) -> Result<BoxStream<'static, std::result::Result<Bytes, std::io::Error>>> {
        let body = ChatMessageBody {
            inputs: serde_json::json!({}),
            query: request.prompt.clone(),
            response_mode: "streaming",
            conversation_id: request.conversation_id.as_ref().map(|c| c.0.clone()),
            user: self.config.user.0.clone(),
            files: outbound_files(&request.files),
            auto_generate_name: true,
        };
        let body = serde_json::to_value(&body)?;
        let url = self.endpoint("chat-messages");

        let response = self
            .retry_policy()
            .execute_with_retry(|| {
                let http = self.http.clone();
                let url = url.clone();
                let key = self.config.api_key.clone();
                let body = body.clone();
                async move {
                    let resp = http
                        .post(&url)
                        .bearer_auth(&key)
                        .json(&body)
                        .send()
                        .await
                        .map_err(|e| classify_transport(&e))?;
                    let status = resp.status();
                    if !status.is_success() {
                        let text = match resp.text().await {
                            Ok(t) => t,
                            Err(_) => String::new(),
                        };
                        return Err(classify_status(status.as_u16(), text).into());
                    }
                    Ok(resp)
                }
            })
            .await?;

        Ok(response
            .bytes_stream()
            .map(|r| r.map_err(stream_io_error))
            .boxed())
    }

    async fn get_json<T>(&self, url: String, query: Vec<(&'static str, String)>) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let text = self
            .retry_policy()
            .execute_with_retry(|| {
                let http = self.http.clone();
                let url = url.clone();
                let key = self.config.api_key.clone();
                let query = query.clone();
                async move {
                    let resp = http
                        .get(&url)
                        .bearer_auth(&key)
                        .query(&query)
                        .send()
                        .await
                        .map_err(|e| classify_transport(&e))?;
                    let status = resp.status();
                    let text = resp.text().await.map_err(|e| classify_transport(&e))?;
                    if !status.is_success() {
                        return Err(classify_status(status.as_u16(), text).into());
                    }
                    Ok(text)
                }
            })
            .await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Requests upstream deletion of a conversation (explicit user action).
    pub async fn delete_conversation(&self, id: &ConversationId) -> Result<()> {
        let url = self.endpoint(&format!("conversations/{}", id.0));
        let body = serde_json::json!({ "user": self.config.user.0 });
        self.retry_policy()
            .execute_with_retry(|| {
                let http = self.http.clone();
                let url = url.clone();
                let key = self.config.api_key.clone();
                let body = body.clone();
                async move {
                    let resp = http
                        .delete(&url)
                        .bearer_auth(&key)
                        .json(&body)
                        .send()
                        .await
                        .map_err(|e| classify_transport(&e))?;
                    let status = resp.status();
                    if !status.is_success() {
                        let text = match resp.text().await {
                            Ok(t) => t,
                            Err(_) => String::new(),
                        };
                        return Err(classify_status(status.as_u16(), text).into());
                    }
                    Ok(())
                }
            })
            .await
    }

    /// Renames a conversation upstream. This changes the display name only;
    /// the conversation identity is immutable.
    pub async fn rename_conversation(
        &self,
        id: &ConversationId,
        name: &str,
    ) -> Result<ConversationSummary> {
        let url = self.endpoint(&format!("conversations/{}/name", id.0));
        let body = serde_json::json!({ "name": name, "user": self.config.user.0 });
        let text = self
            .retry_policy()
            .execute_with_retry(|| {
                let http = self.http.clone();
                let url = url.clone();
                let key = self.config.api_key.clone();
                let body = body.clone();
                async move {
                    let resp = http
                        .post(&url)
                        .bearer_auth(&key)
                        .json(&body)
                        .send()
                        .await
                        .map_err(|e| classify_transport(&e))?;
                    let status = resp.status();
                    let text = resp.text().await.map_err(|e| classify_transport(&e))?;
                    if !status.is_success() {
                        return Err(classify_status(status.as_u16(), text).into());
                    }
                    Ok(text)
                }
            })
            .await?;
        Ok(serde_json::from_str(&text)?)
    }
}

impl ConversationBackend for ProviderClient {
    async fn fetch_conversations(
        &self,
        last_id: Option<&str>,
        limit: usize,
    ) -> Result<ConversationPage> {
        let mut query = vec![
            ("user", self.config.user.0.clone()),
            ("limit", limit.to_string()),
        ];
        if let Some(last_id) = last_id {
            query.push(("last_id", last_id.to_string()));
        }
        self.get_json(self.endpoint("conversations"), query).await
    }

    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        first_id: Option<&str>,
        limit: usize,
    ) -> Result<MessagePage> {
        let mut query = vec![
            ("user", self.config.user.0.clone()),
            ("conversation_id", conversation_id.0.clone()),
            ("limit", limit.to_string()),
        ];
        if let Some(first_id) = first_id {
            query.push(("first_id", first_id.to_string()));
        }
        self.get_json(self.endpoint("messages"), query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AttachmentKind, AttachmentOrigin};

    #[test]
    fn test_classify_status_taxonomy() {
        assert!(matches!(
            classify_status(401, "no".into()),
            ChatError::Unauthorized(_)
        ));
        assert!(matches!(
            classify_status(429, "slow".into()),
            ChatError::RateLimited(_)
        ));
        assert!(matches!(
            classify_status(503, "down".into()),
            ChatError::UpstreamServerError(503, _)
        ));
        assert!(matches!(
            classify_status(404, "gone".into()),
            ChatError::UpstreamRejected(404, _)
        ));
    }

    #[test]
    fn test_backoff_delays_increase() {
        let policy = RetryPolicy::new(3, 1_000);
        // ±25% jitter bands never overlap between consecutive retries.
        for _ in 0..50 {
            let d1 = policy.backoff_delay(1);
            let d2 = policy.backoff_delay(2);
            let d3 = policy.backoff_delay(3);
            assert!(d1 >= Duration::from_millis(750) && d1 <= Duration::from_millis(1_250));
            assert!(d2 >= Duration::from_millis(1_500) && d2 <= Duration::from_millis(2_500));
            assert!(d3 >= Duration::from_millis(3_000) && d3 <= Duration::from_millis(5_000));
            assert!(d1 < d2 && d2 < d3);
        }
    }

    #[test]
    fn test_outbound_files_mapping() {
        let url_file = FileAttachment::from_url(
            "pic.png",
            "https://host/pic.png",
            AttachmentKind::Image,
            AttachmentOrigin::User,
        );
        let upload_file = FileAttachment {
            id: "a".into(),
            name: "notes.pdf".into(),
            kind: AttachmentKind::Pdf,
            size_bytes: 123,
            origin: AttachmentOrigin::User,
            source: AttachmentSource::UploadRef {
                upload_id: "up-1".into(),
            },
        };
        let inline_file = FileAttachment {
            id: "b".into(),
            name: "raw.bin".into(),
            kind: AttachmentKind::Binary,
            size_bytes: 4,
            origin: AttachmentOrigin::User,
            source: AttachmentSource::Inline {
                mime: "application/octet-stream".into(),
                data: "AAAA".into(),
            },
        };

        let wire = outbound_files(&[url_file, upload_file, inline_file]);
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0].kind, "image");
        assert_eq!(wire[0].transfer_method, "remote_url");
        assert_eq!(wire[1].kind, "document");
        assert_eq!(wire[1].transfer_method, "local_file");
        assert_eq!(wire[1].upload_file_id.as_deref(), Some("up-1"));
    }

    #[test]
    fn test_chat_body_wire_shape() {
        let body = ChatMessageBody {
            inputs: serde_json::json!({}),
            query: "hello".into(),
            response_mode: "streaming",
            conversation_id: Some("c1".into()),
            user: "u1".into(),
            files: vec![],
            auto_generate_name: true,
        };
        let json = serde_json::to_value(&body).expect("serialize");
        assert_eq!(json["query"], "hello");
        assert_eq!(json["response_mode"], "streaming");
        assert_eq!(json["conversation_id"], "c1");
        assert_eq!(json["user"], "u1");
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ConversationId(pub String);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SessionId(pub Uuid);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MessageId(pub Uuid);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct UserId(pub String);

impl From<String> for ConversationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl ConversationId {
    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 8)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

/// --- ERROR TAXONOMY ---

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("upstream request timed out")]
    Timeout,

    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("unauthorized against upstream: {0}")]
    Unauthorized(String),

    #[error("rate limited by upstream: {0}")]
    RateLimited(String),

    #[error("upstream server error (status {0}): {1}")]
    UpstreamServerError(u16, String),

    #[error("upstream rejected request (status {0}): {1}")]
    UpstreamRejected(u16, String),

    #[error("a turn is already in flight")]
    TurnInFlight,

    #[error("a turn needs a prompt or at least one attachment")]
    EmptyTurn,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ChatError {
    /// Retry eligibility is a function of the classification alone.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChatError::Timeout
                | ChatError::NetworkUnavailable(_)
                | ChatError::RateLimited(_)
                | ChatError::UpstreamServerError(_, _)
        )
    }

    /// Cause-specific wording shown next to a failed assistant message.
    pub fn user_message(&self) -> String {
        match self {
            ChatError::Timeout => {
                "The assistant timed out before finishing its reply.".to_string()
            }
            ChatError::NetworkUnavailable(_) => {
                "The assistant service is unreachable. Check your network connection.".to_string()
            }
            ChatError::Unauthorized(_) => {
                "The portal is not authorized against the assistant service.".to_string()
            }
            ChatError::RateLimited(_) => {
                "The assistant service is rate limited right now. Try again in a moment."
                    .to_string()
            }
            ChatError::UpstreamServerError(status, _) => {
                format!("The assistant service reported a server error ({}).", status)
            }
            ChatError::UpstreamRejected(status, _) => {
                format!("The assistant service rejected the request ({}).", status)
            }
            other => format!("Something went wrong: {}", other),
        }
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: ChatError,
    pub span_trace: SpanTrace,
}

impl fmt::Display for ObservedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<ChatError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

/// --- ATTACHMENTS ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Document,
    Spreadsheet,
    Presentation,
    Pdf,
    Text,
    Image,
    Audio,
    Video,
    Archive,
    Binary,
}

impl AttachmentKind {
    /// The kind label the upstream provider expects in a request `files` entry.
    pub fn provider_label(&self) -> &'static str {
        match self {
            AttachmentKind::Image => "image",
            AttachmentKind::Audio => "audio",
            AttachmentKind::Video => "video",
            AttachmentKind::Document
            | AttachmentKind::Spreadsheet
            | AttachmentKind::Presentation
            | AttachmentKind::Pdf
            | AttachmentKind::Text => "document",
            AttachmentKind::Archive | AttachmentKind::Binary => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentOrigin {
    User,
    Agent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "via", rename_all = "snake_case")]
pub enum AttachmentSource {
    Url { url: String },
    UploadRef { upload_id: String },
    Inline { mime: String, data: String },
}

impl AttachmentSource {
    pub fn url(&self) -> Option<&str> {
        match self {
            AttachmentSource::Url { url } => Some(url),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileAttachment {
    pub id: String,
    pub name: String,
    pub kind: AttachmentKind,
    /// 0 means unknown, which is the norm for model-emitted links.
    pub size_bytes: u64,
    pub origin: AttachmentOrigin,
    pub source: AttachmentSource,
}

impl FileAttachment {
    pub fn from_url(
        name: impl Into<String>,
        url: impl Into<String>,
        kind: AttachmentKind,
        origin: AttachmentOrigin,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            kind,
            size_bytes: 0,
            origin,
            source: AttachmentSource::Url { url: url.into() },
        }
    }
}

/// --- THE NORMALIZED EVENT PROTOCOL (UI seam) ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Content {
        delta: String,
        conversation_id: Option<ConversationId>,
    },
    Thinking {
        delta: String,
        conversation_id: Option<ConversationId>,
    },
    File {
        attachment: FileAttachment,
        conversation_id: Option<ConversationId>,
    },
    Complete {
        text: String,
        attachments: Vec<FileAttachment>,
        conversation_id: Option<ConversationId>,
    },
    Error {
        message: String,
        conversation_id: Option<ConversationId>,
    },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Complete { .. } | StreamEvent::Error { .. })
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            StreamEvent::Content { conversation_id, .. }
            | StreamEvent::Thinking { conversation_id, .. }
            | StreamEvent::File { conversation_id, .. }
            | StreamEvent::Complete { conversation_id, .. }
            | StreamEvent::Error { conversation_id, .. } => conversation_id.as_ref(),
        }
    }
}

/// --- CORE ROLES & TURN REQUEST ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One outbound conversation turn: everything the pipeline needs to issue a request.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnRequest {
    pub prompt: String,
    pub conversation_id: Option<ConversationId>,
    pub files: Vec<FileAttachment>,
}

impl TurnRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            conversation_id: None,
            files: Vec::new(),
        }
    }

    pub fn with_conversation(mut self, id: Option<ConversationId>) -> Self {
        self.conversation_id = id;
        self
    }

    pub fn with_files(mut self, files: Vec<FileAttachment>) -> Self {
        self.files = files;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ChatError::Timeout.is_retryable());
        assert!(ChatError::NetworkUnavailable("reset".into()).is_retryable());
        assert!(ChatError::RateLimited("slow down".into()).is_retryable());
        assert!(ChatError::UpstreamServerError(503, "unavailable".into()).is_retryable());

        assert!(!ChatError::Unauthorized("bad key".into()).is_retryable());
        assert!(!ChatError::UpstreamRejected(400, "bad request".into()).is_retryable());
        assert!(!ChatError::TurnInFlight.is_retryable());
    }

    #[test]
    fn test_user_messages_are_cause_specific() {
        let timeout = ChatError::Timeout.user_message();
        let network = ChatError::NetworkUnavailable("x".into()).user_message();
        let rate = ChatError::RateLimited("x".into()).user_message();
        let server = ChatError::UpstreamServerError(502, "x".into()).user_message();

        assert!(timeout.contains("timed out"));
        assert!(network.contains("unreachable"));
        assert!(rate.contains("rate limited"));
        assert!(server.contains("server error"));

        let all = [&timeout, &network, &rate, &server];
        for (i, a) in all.iter().enumerate() {
            for b in all.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_stream_event_terminality() {
        let content = StreamEvent::Content {
            delta: "hi".into(),
            conversation_id: None,
        };
        let complete = StreamEvent::Complete {
            text: "hi".into(),
            attachments: vec![],
            conversation_id: Some(ConversationId::from("c1")),
        };
        let error = StreamEvent::Error {
            message: "boom".into(),
            conversation_id: None,
        };

        assert!(!content.is_terminal());
        assert!(complete.is_terminal());
        assert!(error.is_terminal());
        assert_eq!(complete.conversation_id().map(|c| c.0.as_str()), Some("c1"));
    }

    #[test]
    fn test_stream_event_wire_shape_is_stable() {
        let event = StreamEvent::Content {
            delta: "Hi".into(),
            conversation_id: Some(ConversationId::from("c1")),
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "content");
        assert_eq!(json["delta"], "Hi");
        assert_eq!(json["conversation_id"], "c1");
    }
}

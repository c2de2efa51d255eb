//! Normalizes the upstream's verbose event stream into the small, stable
//! `StreamEvent` protocol. The wire format is parsed into a closed tagged
//! union at this boundary; nothing downstream probes loose JSON.

use crate::constants::{MAX_STREAM_LINE_BYTES, MAX_STREAM_RECORDS};
use crate::detector;
use crate::json_repair;
use crate::types::{
    AttachmentKind, AttachmentOrigin, AttachmentSource, ChatError, ConversationId, FileAttachment,
    Result, StreamEvent,
};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use uuid::Uuid;

/// One raw upstream record, as tagged by its `event` field.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum WireRecord {
    Message {
        #[serde(default)]
        answer: String,
        conversation_id: Option<String>,
    },
    AgentMessage {
        #[serde(default)]
        answer: String,
        conversation_id: Option<String>,
    },
    AgentThought {
        #[serde(default)]
        thought: String,
        conversation_id: Option<String>,
    },
    MessageFile {
        id: Option<String>,
        #[serde(rename = "type", default)]
        kind: String,
        #[serde(default)]
        url: String,
        belongs_to: Option<String>,
        conversation_id: Option<String>,
    },
    MessageEnd {
        conversation_id: Option<String>,
    },
    MessageReplace {
        #[serde(default)]
        answer: String,
        conversation_id: Option<String>,
    },
    Error {
        #[serde(default)]
        message: String,
        status: Option<u16>,
        code: Option<String>,
    },
    Ping,
    TtsMessage,
    TtsMessageEnd,
    #[serde(other)]
    Unknown,
}

/// Incremental normalizer: fed raw text chunks, yields normalized events.
///
/// Buffers until a full newline-delimited record is available, survives
/// malformed records via repair-then-drop, and goes quiet after the terminal
/// record. An aborted stream is simply never fed again; the trailing partial
/// buffer is discarded without an error.
pub struct EventNormalizer {
    base_url: String,
    buffer: String,
    answer: String,
    file_urls: Vec<String>,
    conversation_id: Option<ConversationId>,
    finished: bool,
    records: usize,
}

impl EventNormalizer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            buffer: String::new(),
            answer: String::new(),
            file_urls: Vec::new(),
            conversation_id: None,
            finished: false,
            records: 0,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feeds one raw chunk, which may contain zero, one, or many records and
    /// may end mid-record.
    pub fn feed(&mut self, chunk: &str) -> Vec<StreamEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            events.extend(self.feed_line(line.trim_end_matches(['\n', '\r'])));
        }
        events
    }

    /// Feeds one complete, already-framed line.
    pub fn feed_line(&mut self, line: &str) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }

        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }

        let data = match line.strip_prefix("data:") {
            Some(rest) => rest.trim_start(),
            // Bare SSE field lines (`event: ping` keep-alives and friends).
            None => {
                tracing::trace!("[NORMALIZER] Skipping non-data line: {}", line);
                return Vec::new();
            }
        };

        self.records += 1;
        if self.records > MAX_STREAM_RECORDS {
            tracing::error!(
                "[NORMALIZER] Stream exceeded max record limit ({})",
                MAX_STREAM_RECORDS
            );
            self.finished = true;
            return vec![StreamEvent::Error {
                message: "Stream exceeded the record limit.".to_string(),
                conversation_id: self.conversation_id.clone(),
            }];
        }

        match self.parse_record(data) {
            Some(record) => self.map_record(record).into_iter().collect(),
            None => Vec::new(),
        }
    }

    fn parse_record(&self, data: &str) -> Option<WireRecord> {
        let value = match json_repair::parse_json_with_repair(data) {
            Ok(v) => v,
            Err(reason) => {
                tracing::warn!(
                    "[NORMALIZER] Dropping unrecoverable record: {} ({})",
                    crate::str_utils::first_n_chars_lossy(data, 200),
                    reason
                );
                return None;
            }
        };
        match serde_json::from_value::<WireRecord>(value) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(
                    "[NORMALIZER] Dropping unmappable record: {} ({})",
                    crate::str_utils::first_n_chars_lossy(data, 200),
                    e
                );
                None
            }
        }
    }

    fn remember_conversation(&mut self, id: Option<String>) {
        if self.conversation_id.is_none() {
            if let Some(id) = id.filter(|id| !id.is_empty()) {
                self.conversation_id = Some(ConversationId(id));
            }
        }
    }

    fn map_record(&mut self, record: WireRecord) -> Option<StreamEvent> {
        match record {
            WireRecord::Message {
                answer,
                conversation_id,
            }
            | WireRecord::AgentMessage {
                answer,
                conversation_id,
            } => {
                self.remember_conversation(conversation_id);
                if answer.is_empty() {
                    return None;
                }
                let delta = json_repair::resolve_unicode_escapes(&answer);
                self.answer.push_str(&delta);
                Some(StreamEvent::Content {
                    delta,
                    conversation_id: self.conversation_id.clone(),
                })
            }
            WireRecord::AgentThought {
                thought,
                conversation_id,
            } => {
                self.remember_conversation(conversation_id);
                if thought.is_empty() {
                    return None;
                }
                Some(StreamEvent::Thinking {
                    delta: json_repair::resolve_unicode_escapes(&thought),
                    conversation_id: self.conversation_id.clone(),
                })
            }
            WireRecord::MessageFile {
                id,
                kind,
                url,
                belongs_to,
                conversation_id,
            } => {
                self.remember_conversation(conversation_id);
                if url.is_empty() {
                    return None;
                }
                let resolved = resolve_file_url(&self.base_url, &url);
                self.file_urls.push(resolved.clone());
                let name = detector::filename_of(&resolved)
                    .unwrap_or("attachment")
                    .to_string();
                let attachment = FileAttachment {
                    id: id.filter(|id| !id.is_empty())
                        .unwrap_or_else(|| Uuid::new_v4().to_string()),
                    kind: detector::kind_for_name(&name)
                        .unwrap_or_else(|| kind_from_label(&kind)),
                    name,
                    size_bytes: 0,
                    origin: match belongs_to.as_deref() {
                        Some("user") => AttachmentOrigin::User,
                        _ => AttachmentOrigin::Agent,
                    },
                    source: AttachmentSource::Url { url: resolved },
                };
                Some(StreamEvent::File {
                    attachment,
                    conversation_id: self.conversation_id.clone(),
                })
            }
            WireRecord::MessageEnd { conversation_id } => {
                self.remember_conversation(conversation_id);
                self.finished = true;
                let text = detector::suppress_inline_images(&self.answer, &self.file_urls);
                let attachments = detector::detect_attachments(&text);
                Some(StreamEvent::Complete {
                    text,
                    attachments,
                    conversation_id: self.conversation_id.clone(),
                })
            }
            WireRecord::MessageReplace {
                answer,
                conversation_id,
            } => {
                // Moderation rewrite: the replacement becomes the running
                // answer and reaches the consumer via the `complete` text.
                self.remember_conversation(conversation_id);
                self.answer = json_repair::resolve_unicode_escapes(&answer);
                None
            }
            WireRecord::Error {
                message,
                status,
                code,
            } => {
                self.finished = true;
                let detail = match (status, code) {
                    (Some(status), Some(code)) => {
                        format!("{} (status {}, code {})", message, status, code)
                    }
                    (Some(status), None) => format!("{} (status {})", message, status),
                    (None, Some(code)) => format!("{} (code {})", message, code),
                    (None, None) => message,
                };
                Some(StreamEvent::Error {
                    message: detail,
                    conversation_id: self.conversation_id.clone(),
                })
            }
            WireRecord::Ping | WireRecord::TtsMessage | WireRecord::TtsMessageEnd => None,
            WireRecord::Unknown => {
                tracing::debug!("[NORMALIZER] Ignoring unknown record kind");
                None
            }
        }
    }
}

fn kind_from_label(label: &str) -> AttachmentKind {
    match label {
        "image" => AttachmentKind::Image,
        "audio" => AttachmentKind::Audio,
        "video" => AttachmentKind::Video,
        "document" => AttachmentKind::Document,
        _ => AttachmentKind::Binary,
    }
}

fn resolve_file_url(base_url: &str, url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        return url.to_string();
    }
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        url.trim_start_matches('/')
    )
}

fn codec_error_to_chat(err: LinesCodecError) -> ChatError {
    match err {
        LinesCodecError::Io(io) if io.kind() == std::io::ErrorKind::TimedOut => ChatError::Timeout,
        LinesCodecError::Io(io) => ChatError::NetworkUnavailable(io.to_string()),
        LinesCodecError::MaxLineLengthExceeded => {
            ChatError::Internal("stream line exceeded maximum length".to_string())
        }
    }
}

/// Adapts a raw upstream byte stream into ordered normalized events.
///
/// Framing is newline-based; a chunk boundary inside a record stays buffered
/// until the closing newline arrives.
pub fn event_stream<R>(
    bytes: R,
    base_url: impl Into<String>,
) -> impl Stream<Item = Result<StreamEvent>> + Unpin
where
    R: Stream<Item = std::result::Result<Bytes, std::io::Error>> + Unpin,
{
    let reader = tokio_util::io::StreamReader::new(bytes);
    let lines = FramedRead::new(
        reader,
        LinesCodec::new_with_max_length(MAX_STREAM_LINE_BYTES),
    );
    let normalizer = EventNormalizer::new(base_url);

    lines
        .scan(normalizer, |normalizer, line| {
            let out: Vec<Result<StreamEvent>> = match line {
                Ok(line) => normalizer.feed_line(&line).into_iter().map(Ok).collect(),
                Err(e) => vec![Err(codec_error_to_chat(e).into())],
            };
            futures_util::future::ready(Some(futures_util::stream::iter(out)))
        })
        .flatten()
}

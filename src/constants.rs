use crate::types::AttachmentKind;
use std::time::Duration;

/// Overall budget for one upstream exchange. Minutes-scale because the
/// upstream model may invoke tools before the first byte arrives.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Retry budget for transient upstream failures.
pub const MAX_RETRIES: u32 = 3;
pub const RETRY_BASE_DELAY_MS: u64 = 1_000;

/// History pagination and cache freshness.
pub const HISTORY_PAGE_SIZE: usize = 20;
pub const SUMMARY_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
pub const MESSAGES_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

/// Stream guards.
pub const MAX_STREAM_LINE_BYTES: usize = 1024 * 1024;
pub const MAX_STREAM_RECORDS: usize = 100_000;

pub const SESSION_TITLE_MAX_CHARS: usize = 40;

/// Notices appended to an assistant message on abnormal turn endings.
pub const CANCELLED_NOTICE: &str = "\n\n[stopped by user]";
pub const ERROR_NOTICE_PREFIX: &str = "\n\n[error] ";

/// Extensions the link detector recognizes, with the kind each one maps to.
/// Anything else that looks like a file link is treated as a generic binary.
pub const ATTACHMENT_EXTENSIONS: &[(&str, AttachmentKind)] = &[
    ("doc", AttachmentKind::Document),
    ("docx", AttachmentKind::Document),
    ("odt", AttachmentKind::Document),
    ("rtf", AttachmentKind::Document),
    ("xls", AttachmentKind::Spreadsheet),
    ("xlsx", AttachmentKind::Spreadsheet),
    ("csv", AttachmentKind::Spreadsheet),
    ("ods", AttachmentKind::Spreadsheet),
    ("ppt", AttachmentKind::Presentation),
    ("pptx", AttachmentKind::Presentation),
    ("odp", AttachmentKind::Presentation),
    ("pdf", AttachmentKind::Pdf),
    ("txt", AttachmentKind::Text),
    ("md", AttachmentKind::Text),
    ("log", AttachmentKind::Text),
    ("png", AttachmentKind::Image),
    ("jpg", AttachmentKind::Image),
    ("jpeg", AttachmentKind::Image),
    ("gif", AttachmentKind::Image),
    ("webp", AttachmentKind::Image),
    ("svg", AttachmentKind::Image),
    ("bmp", AttachmentKind::Image),
    ("mp3", AttachmentKind::Audio),
    ("wav", AttachmentKind::Audio),
    ("ogg", AttachmentKind::Audio),
    ("m4a", AttachmentKind::Audio),
    ("flac", AttachmentKind::Audio),
    ("mp4", AttachmentKind::Video),
    ("mov", AttachmentKind::Video),
    ("avi", AttachmentKind::Video),
    ("mkv", AttachmentKind::Video),
    ("webm", AttachmentKind::Video),
    ("zip", AttachmentKind::Archive),
    ("rar", AttachmentKind::Archive),
    ("7z", AttachmentKind::Archive),
    ("tar", AttachmentKind::Archive),
    ("gz", AttachmentKind::Archive),
];

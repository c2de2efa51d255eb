//! Attachment/link detection over model-authored text.
//!
//! Two deterministic passes with explicit precedence: markdown-style file
//! references first, bare file URLs second. A bare URL whose query-stripped
//! path was already claimed by the markdown pass is skipped.

use crate::constants::ATTACHMENT_EXTENSIONS;
use crate::types::{AttachmentKind, AttachmentOrigin, FileAttachment};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;

lazy_static! {
    static ref MARKDOWN_LINK_RE: Regex =
        Regex::new(r"\[([^\[\]]+)\]\(([^()\s]+)\)").expect("markdown link regex");
    static ref BARE_URL_RE: Regex =
        Regex::new(r"https?://[^\s<>()\[\]]+").expect("bare url regex");
    static ref INLINE_IMAGE_RE: Regex =
        Regex::new(r"!\[[^\[\]]*\]\(([^()\s]+)\)").expect("inline image regex");
}

/// Maps a file name (or path) to an attachment kind via its extension.
/// Returns None when the name carries no recognized file extension.
pub fn kind_for_name(name: &str) -> Option<AttachmentKind> {
    let ext = name.rsplit_once('.')?.1.to_ascii_lowercase();
    ATTACHMENT_EXTENSIONS
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, kind)| *kind)
}

pub fn strip_query(url: &str) -> &str {
    match url.find('?') {
        Some(idx) => &url[..idx],
        None => url,
    }
}

/// Last path segment of a query-stripped URL, if it looks like a file name.
pub fn filename_of(url: &str) -> Option<&str> {
    let path = strip_query(url);
    let name = path.rsplit('/').next()?;
    if name.is_empty() || !name.contains('.') {
        return None;
    }
    Some(name)
}

/// Scans model-authored text for file references. Every hit gets a fresh id,
/// unknown size, and agent origin; hits are deduplicated by query-stripped URL.
pub fn detect_attachments(text: &str) -> Vec<FileAttachment> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut found = Vec::new();

    // Pass 1: markdown references whose display name carries a known extension.
    for cap in MARKDOWN_LINK_RE.captures_iter(text) {
        let name = cap[1].trim();
        let url = &cap[2];
        let kind = match kind_for_name(name) {
            Some(k) => k,
            None => continue,
        };
        if seen.insert(strip_query(url).to_string()) {
            found.push(FileAttachment::from_url(
                name,
                url,
                kind,
                AttachmentOrigin::Agent,
            ));
        }
    }

    // Pass 2: bare URLs ending in a known extension, unless pass 1 already
    // claimed the same path.
    for m in BARE_URL_RE.find_iter(text) {
        let url = m.as_str().trim_end_matches(['.', ',', ';', ':']);
        let name = match filename_of(url) {
            Some(n) => n,
            None => continue,
        };
        let kind = match kind_for_name(name) {
            Some(k) => k,
            None => continue,
        };
        if seen.insert(strip_query(url).to_string()) {
            found.push(FileAttachment::from_url(
                name,
                url,
                kind,
                AttachmentOrigin::Agent,
            ));
        }
    }

    found
}

/// True when two URLs point at the same logical resource: equal once query
/// strings are stripped, or, when one side is a path-only reference, equal
/// trailing file names.
pub fn same_resource(a: &str, b: &str) -> bool {
    let a_path = strip_query(a);
    let b_path = strip_query(b);
    if a_path == b_path {
        return true;
    }
    if !a_path.contains("://") || !b_path.contains("://") {
        if let (Some(fa), Some(fb)) = (filename_of(a_path), filename_of(b_path)) {
            return fa == fb;
        }
    }
    false
}

/// Removes inline markdown images whose URL duplicates a structured file
/// attachment, so the same resource is not rendered twice.
pub fn suppress_inline_images(text: &str, known_urls: &[String]) -> String {
    if known_urls.is_empty() || !text.contains("![") {
        return text.to_string();
    }
    INLINE_IMAGE_RE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let url = &caps[1];
            if known_urls.iter().any(|known| same_resource(url, known)) {
                String::new()
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}

/// Deduplicates attachments by query-stripped URL, keeping first occurrences.
/// Attachments without a URL source are always kept.
pub fn dedup_by_url(attachments: Vec<FileAttachment>) -> Vec<FileAttachment> {
    let mut seen: HashSet<String> = HashSet::new();
    attachments
        .into_iter()
        .filter(|att| match att.source.url() {
            Some(url) => seen.insert(strip_query(url).to_string()),
            None => true,
        })
        .collect()
}

//! JSON Repair and Escape Normalization Module
//!
//! Handles incomplete or over-escaped JSON records from the upstream stream by
//! detecting incomplete structures and attempting to repair them gracefully.
//! The upstream is observed to occasionally emit truncated payloads and
//! doubly-escaped text mid-stream; a single bad record must never take the
//! whole turn down.

use serde_json::Value;

/// Detects if a JSON string is incomplete (unbalanced braces/quotes)
pub fn is_json_complete(json_str: &str) -> bool {
    let trimmed = json_str.trim();
    if trimmed.is_empty() {
        return false;
    }

    let mut brace_count = 0;
    let mut bracket_count = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for ch in trimmed.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => brace_count += 1,
            '}' if !in_string => brace_count -= 1,
            '[' if !in_string => bracket_count += 1,
            ']' if !in_string => bracket_count -= 1,
            _ => {}
        }

        // Early exit if we have unbalanced closing braces
        if brace_count < 0 || bracket_count < 0 {
            return false;
        }
    }

    !in_string && brace_count == 0 && bracket_count == 0
}

/// Attempts to repair incomplete JSON by closing unclosed structures
pub fn repair_json(json_str: &str) -> String {
    let trimmed = json_str.trim();
    if trimmed.is_empty() {
        return "{}".to_string();
    }

    let mut result = trimmed.to_string();
    let mut brace_count = 0;
    let mut bracket_count = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for ch in trimmed.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => brace_count += 1,
            '}' if !in_string => brace_count -= 1,
            '[' if !in_string => bracket_count += 1,
            ']' if !in_string => bracket_count -= 1,
            _ => {}
        }
    }

    // Close unclosed strings
    if in_string {
        result.push('"');
    }

    // Close unclosed brackets
    for _ in 0..bracket_count {
        result.push(']');
    }

    // Close unclosed braces
    for _ in 0..brace_count {
        result.push('}');
    }

    result
}

/// Resolves literal `\uXXXX` sequences (including surrogate pairs) left behind
/// when the upstream double-escapes a payload. Sequences that do not decode to
/// a valid scalar are kept verbatim.
pub fn resolve_unicode_escapes(input: &str) -> String {
    if !input.contains("\\u") {
        return input.to_string();
    }

    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find("\\u") {
        out.push_str(&rest[..pos]);
        let code = rest
            .get(pos + 2..pos + 6)
            .and_then(|h| u32::from_str_radix(h, 16).ok());
        match code {
            Some(cp) if (0xD800..0xDC00).contains(&cp) => {
                // High surrogate: only meaningful with a low surrogate right behind it.
                let low = match rest.get(pos + 6..pos + 8) {
                    Some("\\u") => rest
                        .get(pos + 8..pos + 12)
                        .and_then(|h| u32::from_str_radix(h, 16).ok())
                        .filter(|lo| (0xDC00..0xE000).contains(lo)),
                    _ => None,
                };
                match low {
                    Some(lo) => {
                        let combined = 0x10000 + ((cp - 0xD800) << 10) + (lo - 0xDC00);
                        match char::from_u32(combined) {
                            Some(ch) => out.push(ch),
                            None => out.push_str(&rest[pos..pos + 12]),
                        }
                        rest = &rest[pos + 12..];
                    }
                    None => {
                        out.push_str(&rest[pos..pos + 6]);
                        rest = &rest[pos + 6..];
                    }
                }
            }
            Some(cp) => {
                match char::from_u32(cp) {
                    Some(ch) => out.push(ch),
                    None => out.push_str(&rest[pos..pos + 6]),
                }
                rest = &rest[pos + 6..];
            }
            None => {
                out.push_str("\\u");
                rest = &rest[pos + 2..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Collapses doubled escape characters (`\\\\` to `\\`), the other artifact of
/// the upstream's double-escaping.
pub fn collapse_double_escapes(input: &str) -> String {
    input.replace("\\\\", "\\")
}

/// Attempts to parse JSON, with fallback to escape normalization, then repair.
pub fn parse_json_with_repair(json_str: &str) -> Result<Value, String> {
    // Fast path: a structurally complete record that parses as-is.
    if is_json_complete(json_str) {
        if let Ok(value) = serde_json::from_str::<Value>(json_str) {
            return Ok(value);
        }
    }

    // Normalize the escape artifacts this upstream is known to produce.
    let cleaned = collapse_double_escapes(&resolve_unicode_escapes(json_str));
    if let Ok(value) = serde_json::from_str::<Value>(&cleaned) {
        tracing::debug!(
            "[JSON-REPAIR] Parsed after escape normalization: {} -> {} chars",
            json_str.len(),
            cleaned.len()
        );
        return Ok(value);
    }

    // Last resort: balance quotes/brackets/braces and retry.
    let repaired = repair_json(&cleaned);
    match serde_json::from_str::<Value>(&repaired) {
        Ok(value) => {
            tracing::debug!(
                "[JSON-REPAIR] Successfully repaired JSON: {} -> {} chars",
                json_str.len(),
                repaired.len()
            );
            Ok(value)
        }
        Err(e) => Err(format!(
            "Failed to parse JSON even after repair: {} (original: {} chars, repaired: {} chars)",
            e,
            json_str.len(),
            repaired.len()
        )),
    }
}

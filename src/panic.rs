//! Converts language-level panics into structured [`Error`](crate::error::Error)s.
//!
//! See [`guard`] and [`guard_async`] for more details.

use crate::error::{Error, ErrorKind};
use crate::identity::Identity;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

/// Runs a synchronous closure, catching any panic and converting it into a
/// structured [`Error`] whose cause is [`ErrorKind::Panic`].
///
/// `input_for_error` is only evaluated if the closure panics, so the caller
/// can defer cloning the input until it's actually needed.
pub fn guard<T, F>(identity: &Identity, input_for_error: impl FnOnce() -> Option<T>, f: F) -> Result<T, Error<T>>
where
    F: FnOnce() -> T,
{
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Ok(value),
        Err(payload) => Err(from_payload(identity, input_for_error(), payload)),
    }
}

/// Runs a future, catching any panic and converting it into a structured
/// [`Error`] whose cause is [`ErrorKind::Panic`].
///
/// This must run to completion (or panic) before any "done" signal is
/// released in a fan-out connector, so that a panicking child can never
/// deadlock the waiter — see [`crate::connectors::concurrent`].
pub async fn guard_async<T, Fut>(
    identity: &Identity,
    input_for_error: impl FnOnce() -> Option<T>,
    fut: Fut,
) -> Result<T, Error<T>>
where
    Fut: Future<Output = T>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(value) => Ok(value),
        Err(payload) => Err(from_payload(identity, input_for_error(), payload)),
    }
}

fn from_payload<T>(identity: &Identity, input_data: Option<T>, payload: Box<dyn Any + Send>) -> Error<T> {
    let raw = extract_message(&payload);
    let sanitized = sanitize_message(&raw);
    Error::new(ErrorKind::Panic(sanitized.clone()), PanicCause(sanitized), input_data)
        .with_prefixed_path(identity.clone())
}

fn extract_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "processor panicked with a non-string payload".to_string()
    }
}

const MAX_LEN: usize = 200;
const TRUNCATED_MARKER: &str = "... (truncated)";

/// Sanitizes a raw panic message for inclusion in a structured error:
/// collapses newlines, trims surrounding whitespace, strips hex
/// pointer-like tokens and generic `at <file>:<line>:<col>` frame suffixes,
/// and truncates to at most [`MAX_LEN`] characters with a trailing marker.
pub fn sanitize_message(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim();
    let scrubbed = strip_frame_suffix(&strip_hex_tokens(trimmed));

    if scrubbed.chars().count() <= MAX_LEN {
        scrubbed
    } else {
        let mut truncated: String = scrubbed.chars().take(MAX_LEN).collect();
        truncated.push_str(TRUNCATED_MARKER);
        truncated
    }
}

/// Strips tokens that look like hex pointers (`0x` followed by one or more
/// hex digits), per spec's "any hex pointer token is sanitizable" rule.
fn strip_hex_tokens(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let bytes = input.as_bytes();

    let mut i = 0;
    while i < bytes.len() {
        if is_hex_token_start(bytes, i) {
            let mut j = i + 2;
            while j < bytes.len() && (bytes[j] as char).is_ascii_hexdigit() {
                j += 1;
            }
            out.push_str("0x[redacted]");
            i = j;
        } else {
            let ch = input[i..].chars().next().unwrap();
            out.push(ch);
            i += ch.len_utf8();
        }
    }
    out
}

fn is_hex_token_start(bytes: &[u8], i: usize) -> bool {
    bytes.len() > i + 2
        && bytes[i] == b'0'
        && (bytes[i + 1] == b'x' || bytes[i + 1] == b'X')
        && (bytes[i + 2] as char).is_ascii_hexdigit()
}

/// Strips a best-effort `at <path>:<line>:<col>` frame suffix, the generic
/// shape emitted by most panic hooks. Framework-specific frame prefixes are
/// left alone, per spec's "best effort" language.
fn strip_frame_suffix(input: &str) -> String {
    match input.rfind(", at ") {
        Some(idx) if looks_like_frame_suffix(&input[idx + 5..]) => input[..idx].to_string(),
        _ => input.to_string(),
    }
}

fn looks_like_frame_suffix(candidate: &str) -> bool {
    let parts: Vec<&str> = candidate.rsplitn(3, ':').collect();
    parts.len() == 3 && parts[0].chars().all(|c| c.is_ascii_digit()) && parts[1].chars().all(|c| c.is_ascii_digit())
}

#[derive(Debug)]
struct PanicCause(String);

impl std::fmt::Display for PanicCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for PanicCause {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_newlines_and_trims() {
        let raw = "  line one\nline two\n  ";
        assert_eq!(sanitize_message(raw), "line one line two");
    }

    #[test]
    fn strips_hex_pointers() {
        let raw = "segfault at 0xdeadbeef in frame";
        let sanitized = sanitize_message(raw);
        assert!(!sanitized.contains("0xdeadbeef"));
        assert!(sanitized.contains("0x[redacted]"));
    }

    #[test]
    fn truncates_long_messages() {
        let raw = "x".repeat(500);
        let sanitized = sanitize_message(&raw);
        assert!(sanitized.ends_with(TRUNCATED_MARKER));
        assert_eq!(sanitized.chars().count(), MAX_LEN + TRUNCATED_MARKER.len());
    }

    #[test]
    fn short_messages_untouched_by_truncation() {
        let raw = "boom";
        assert_eq!(sanitize_message(raw), "boom");
    }
}

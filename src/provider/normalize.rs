//! Shared message normalization helpers
//!
//! Thread identity for providers without native threads is synthesized
//! from RFC 5322 reference headers, falling back to the normalized
//! subject so replies without headers still group together.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

use crate::types::Address;

/// Derive a stable thread id from message headers.
///
/// Keyed on, in order: the first id in `References`, `In-Reply-To`,
/// `Message-ID`, then the subject with reply/forward prefixes removed.
pub fn synthesize_thread_id(
    references: Option<&str>,
    in_reply_to: Option<&str>,
    message_id: Option<&str>,
    subject: &str,
) -> String {
    let key = references
        .and_then(first_message_id)
        .or_else(|| in_reply_to.and_then(first_message_id))
        .or_else(|| message_id.and_then(first_message_id))
        .unwrap_or_else(|| strip_subject_prefixes(subject).to_lowercase());

    let digest = Sha256::digest(key.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)[..16].to_string()
}

fn first_message_id(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let id = raw.split_whitespace().next()?;
    Some(id.trim_matches(|c| c == '<' || c == '>').to_string())
}

/// Strip leading `Re:` / `Fwd:` / `Fw:` markers, repeatedly.
pub fn strip_subject_prefixes(subject: &str) -> &str {
    let mut s = subject.trim();
    loop {
        let lower = s.to_lowercase();
        let stripped = if lower.starts_with("re:") {
            &s[3..]
        } else if lower.starts_with("fwd:") {
            &s[4..]
        } else if lower.starts_with("fw:") {
            &s[3..]
        } else {
            break;
        };
        s = stripped.trim_start();
    }
    s
}

/// Split a comma-separated address header into addresses, honoring
/// quoted display names that themselves contain commas.
pub fn parse_address_list(raw: &str) -> Vec<Address> {
    let mut out = Vec::new();
    let mut depth_quote = false;
    let mut start = 0;
    for (i, c) in raw.char_indices() {
        match c {
            '"' => depth_quote = !depth_quote,
            ',' if !depth_quote => {
                let piece = raw[start..i].trim();
                if !piece.is_empty() {
                    out.push(Address::parse(piece));
                }
                start = i + 1;
            }
            _ => {}
        }
    }
    let piece = raw[start..].trim();
    if !piece.is_empty() {
        out.push(Address::parse(piece));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_references_same_thread() {
        let a = synthesize_thread_id(Some("<root@x> <mid@x>"), None, Some("<a@x>"), "Re: topic");
        let b = synthesize_thread_id(Some("<root@x>"), None, Some("<b@x>"), "Re: Re: topic");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn reply_falls_back_to_in_reply_to() {
        let root = synthesize_thread_id(None, None, Some("<root@x>"), "topic");
        let reply = synthesize_thread_id(None, Some("<root@x>"), Some("<reply@x>"), "Re: topic");
        assert_eq!(root, reply);
    }

    #[test]
    fn subject_fallback_ignores_prefixes_and_case() {
        let a = synthesize_thread_id(None, None, None, "Re: Quarterly Report");
        let b = synthesize_thread_id(None, None, None, "FWD: quarterly report");
        assert_eq!(a, b);
    }

    #[test]
    fn strip_prefixes_is_repeated() {
        assert_eq!(strip_subject_prefixes("Re: Fwd: Re: hello"), "hello");
        assert_eq!(strip_subject_prefixes("plain"), "plain");
    }

    #[test]
    fn address_list_respects_quotes() {
        let list = parse_address_list("\"Doe, Jane\" <jane@x.com>, bob@x.com");
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name.as_deref(), Some("Doe, Jane"));
        assert_eq!(list[1].address, "bob@x.com");
    }
}

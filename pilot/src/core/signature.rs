//! Error signature normalization.
//!
//! Two failures that differ only in volatile details (paths, ids, timestamps,
//! addresses) must map to the same signature so the fix registry can match
//! them.

use std::sync::LazyLock;

use regex::Regex;

/// Normalized signatures are capped at this many chars.
pub const MAX_SIGNATURE_CHARS: usize = 200;

static UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b")
        .unwrap()
});
static TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?")
        .unwrap()
});
static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap()
});
static PATH_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"/[\w/\-.]+").unwrap());
static HEX_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"0x[0-9a-fA-F]+").unwrap());
static LONG_STR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"'[^']{30,}'").unwrap());
static NUM_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d{4,}\b").unwrap());
static SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Reduce a raw error message to a stable signature.
pub fn normalize(raw: &str) -> String {
    let text = UUID_RE.replace_all(raw, "<UUID>");
    let text = TIMESTAMP_RE.replace_all(&text, "<TS>");
    let text = EMAIL_RE.replace_all(&text, "<EMAIL>");
    let text = PATH_RE.replace_all(&text, "<PATH>");
    let text = HEX_RE.replace_all(&text, "<HEX>");
    let text = LONG_STR_RE.replace_all(&text, "'<LONG_STR>'");
    let text = NUM_RE.replace_all(&text, "<NUM>");
    let text = SPACE_RE.replace_all(&text, " ");
    text.trim().chars().take(MAX_SIGNATURE_CHARS).collect::<String>()
}

/// Registry key for a signature seen in a context.
pub fn registry_key(context: &str, signature: &str) -> String {
    format!("{context}:{signature}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volatile_details_collapse_to_one_signature() {
        let a = normalize("open /tmp/run-1/out.txt failed at 2024-05-01T10:00:00Z (pid 12345)");
        let b = normalize("open /var/data/x.txt failed at 2025-12-31 23:59:59 (pid 99881)");
        assert_eq!(a, b);
        assert_eq!(a, "open <PATH> failed at <TS> (pid <NUM>)");
    }

    #[test]
    fn replaces_ids_addresses_and_emails() {
        let sig = normalize(
            "task 550e8400-e29b-41d4-a716-446655440000 segfault at 0xdeadBEEF for bob@example.com",
        );
        assert_eq!(sig, "task <UUID> segfault at <HEX> for <EMAIL>");
    }

    #[test]
    fn long_quoted_strings_are_masked() {
        let sig = normalize("bad input 'this quoted value is definitely longer than thirty'");
        assert_eq!(sig, "bad input '<LONG_STR>'");
        assert_eq!(normalize("bad input 'short'"), "bad input 'short'");
    }

    #[test]
    fn whitespace_collapsed_and_capped() {
        assert_eq!(normalize("  a \n\t b  "), "a b");
        let long = "x ".repeat(300);
        assert_eq!(normalize(&long).chars().count(), MAX_SIGNATURE_CHARS);
    }

    #[test]
    fn key_joins_context_and_signature() {
        assert_eq!(registry_key("read_file", "no such file"), "read_file:no such file");
    }
}

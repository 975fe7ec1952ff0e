//! Migration source normalization for checksumming.
//!
//! Comments are stripped and whitespace is collapsed so cosmetic edits do
//! not change a checksum, while the contents of single-, double-, and
//! back-tick-delimited string literals are preserved byte-for-byte so a
//! changed URL or token inside a literal does change it.

use sha2::Digest;

/// Collapse a migration source to its checksummed form.
pub fn normalize_source(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    // Pending collapsed whitespace, emitted lazily so the output never ends
    // with a separator.
    let mut pending_space = false;

    while let Some(c) = chars.next() {
        match c {
            '/' if chars.peek() == Some(&'/') => {
                // Line comment: drop through end of line.
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
                pending_space = !out.is_empty();
            },
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
                pending_space = !out.is_empty();
            },
            '\'' | '"' | '`' => {
                if pending_space {
                    out.push(' ');
                    pending_space = false;
                }
                out.push(c);
                let delim = c;
                while let Some(inner) = chars.next() {
                    out.push(inner);
                    if inner == '\\' {
                        // Escapes are preserved verbatim, including an
                        // escaped delimiter.
                        if let Some(escaped) = chars.next() {
                            out.push(escaped);
                        }
                        continue;
                    }
                    if inner == delim {
                        break;
                    }
                }
            },
            c if c.is_whitespace() => {
                pending_space = !out.is_empty();
            },
            c => {
                if pending_space {
                    out.push(' ');
                    pending_space = false;
                }
                out.push(c);
            },
        }
    }
    out
}

pub fn checksum(source: &str) -> String {
    let normalized = normalize_source(source);
    hex::encode(sha2::Sha256::digest(normalized.as_bytes()))
}

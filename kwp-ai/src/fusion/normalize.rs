//! Tag string normalization
//!
//! Canonical form: lowercase, `-`/`_`/`/` as word separators, punctuation
//! stripped (except `&` and `+`), single spaces, trimmed.

/// Normalize a raw tag string. Idempotent.
pub fn normalize_tag(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_space = false;

    for ch in raw.chars().flat_map(char::to_lowercase) {
        let mapped = match ch {
            '-' | '_' | '/' => ' ',
            c if c.is_whitespace() => ' ',
            c if c.is_alphanumeric() || c == '&' || c == '+' => c,
            _ => continue,
        };

        if mapped == ' ' {
            pending_space = !out.is_empty();
        } else {
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            out.push(mapped);
        }
    }

    out
}

/// Words of an already-normalized tag
pub fn words(tag: &str) -> Vec<&str> {
    tag.split(' ').filter(|w| !w.is_empty()).collect()
}

//! Pipe-joined columns: a list of strings stored as one `" | "`-separated
//! string. Several columns describing the same list of datastreams are
//! positionally aligned, so edits always replace in place.
//!
//! Every entry written through this module is passed through [`sanitize`]
//! first, so an entry can never contain or border on the separator.

use std::borrow::Cow;

/// The separator between entries of a pipe-joined column.
pub const PIPE: &str = " | ";

/// Drops whitespace around every `|` of `value`: `"low | high"` becomes
/// `"low|high"`.
pub fn sanitize(value: &str) -> Cow<'_, str> {
    if !value.contains('|') {
        return Cow::Borrowed(value);
    }
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '|' {
            out.push(c);
            continue;
        }
        out.truncate(out.trim_end().len());
        out.push('|');
        while chars.next_if(|n| n.is_whitespace()).is_some() {}
    }
    Cow::Owned(out)
}

pub fn split(joined: &str) -> Vec<&str> {
    joined.split(PIPE).collect()
}

pub fn join<S: AsRef<str>>(parts: &[S]) -> String {
    parts.iter().map(|p| sanitize(p.as_ref())).collect::<Vec<_>>().join(PIPE)
}

/// Index of `token` as a whole entry of `joined`. `"23"` is not found in `"2345"`.
pub fn position(joined: &str, token: &str) -> Option<usize> {
    split(joined).iter().position(|part| *part == token)
}

pub fn contains_token(joined: &str, token: &str) -> bool {
    position(joined, token).is_some()
}

/// Replaces entry `index` of `joined`, keeping length and order.
/// Returns `None` when `index` is out of range.
pub fn replace_at(joined: &str, index: usize, replacement: &str) -> Option<String> {
    let replacement = sanitize(replacement);
    let mut parts = split(joined);
    let slot = parts.get_mut(index)?;
    *slot = replacement.as_ref();
    Some(join(&parts))
}

/// Appends `value` to `joined`, or starts the column if it does not exist yet.
pub fn append(joined: Option<&str>, value: &str) -> String {
    match joined {
        Some(existing) => format!("{}{}{}", existing, PIPE, sanitize(value)),
        None => sanitize(value).into_owned(),
    }
}

//! String helpers shared by the loader and the pipeline.
//!
//! Federation front ends deliver multi-valued attributes as one header value
//! with the individual values separated by commas or semicolons. The same
//! convention is used throughout the configuration file for lists.

use std::borrow::Cow;

use tracing::debug;

/// Characters that separate values in a multi-valued attribute or list.
const SEPARATORS: [char; 2] = [',', ';'];

/// Split `s` on commas and semicolons, trim every piece and drop the empty
/// ones.
///
/// `"a, b;c"` becomes `["a", "b", "c"]`; `" ;, "` becomes `[]`.
pub fn split_values(s: &str) -> Vec<String> {
    s.split(SEPARATORS)
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .map(str::to_string)
        .collect()
}

/// Split a flat `pattern, replacement, pattern, replacement, ...` list.
///
/// Unlike [`split_values`], empty entries are kept so that a replacement can
/// be the empty string (`"@.*,"` removes a domain suffix). A trailing pattern
/// without a replacement is returned in the second element.
pub fn split_pairs(s: &str) -> (Vec<(String, String)>, Option<String>) {
    let mut terms: Vec<String> = s.split(SEPARATORS).map(|t| t.trim().to_string()).collect();

    // "a,b," parses as ["a", "b", ""]: a single trailing separator is
    // cosmetic, not an empty pattern.
    if terms.len() % 2 == 1 && terms.last().is_some_and(|t| t.is_empty()) {
        terms.pop();
    }

    let mut pairs = Vec::with_capacity(terms.len() / 2);
    let mut iter = terms.into_iter();
    while let Some(pattern) = iter.next() {
        match iter.next() {
            Some(replacement) => pairs.push((pattern, replacement)),
            None => return (pairs, Some(pattern)),
        }
    }
    (pairs, None)
}

/// Legacy transport fix: re-interpret a string whose characters are really
/// the individual bytes of a UTF-8 sequence.
///
/// Some web-server connectors hand header values to the application decoded
/// as ISO-8859-1, so `"José"` arrives as `"JosÃ©"`. When every character of
/// `s` fits in one byte and those bytes form valid UTF-8, the decoded string
/// is returned. Anything else is returned unchanged; this is a best-effort,
/// one-way correction and not a general encoding layer.
pub fn legacy_utf8_fix(s: &str) -> Cow<'_, str> {
    if s.is_ascii() {
        return Cow::Borrowed(s);
    }

    let mut bytes = Vec::with_capacity(s.len());
    for c in s.chars() {
        match u8::try_from(u32::from(c)) {
            Ok(b) => bytes.push(b),
            Err(_) => return Cow::Borrowed(s),
        }
    }

    match String::from_utf8(bytes) {
        Ok(fixed) => {
            debug!(original = s, fixed = %fixed, "re-interpreted value as UTF-8");
            Cow::Owned(fixed)
        }
        Err(_) => Cow::Borrowed(s),
    }
}

/// Parse a configuration boolean. Accepts `true/false`, `yes/no`, `on/off`
/// and `1/0`, case-insensitively.
pub fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

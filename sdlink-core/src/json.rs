//! Minimal JSON reader: finds a key's value inside a flat (or shallow) object by scanning text.
//!
//! No tree is built and matched strings are returned as views into the input. Keys are found
//! wherever they occur, so a key nested one level down (`{"metadata": {"title": ...}}`) is found
//! as well; the first textual occurrence wins.
//!
//! Known limitation: escaped quotes inside string values are not handled. A value such as
//! `"a \"quoted\" title"` ends at the first backslash-escaped quote. Payloads from the desktop
//! application have not been observed to carry escapes in the fields read here.

/// Locate the text immediately after `"key":` (leading whitespace skipped).
fn value_after<'a>(json: &'a str, key: &str) -> Option<&'a str> {
    if key.is_empty() {
        return None;
    }
    let bytes = json.as_bytes();
    let mut from = 0;
    while from < json.len() {
        let idx = from + json[from..].find(key)?;
        let end = idx + key.len();
        let quoted = idx > 0 && bytes[idx - 1] == b'"' && bytes.get(end) == Some(&b'"');
        if quoted {
            let rest = json[end + 1..].trim_start();
            if let Some(value) = rest.strip_prefix(':') {
                return Some(value.trim_start());
            }
        }
        from = idx + key.chars().next().map_or(1, char::len_utf8);
    }
    None
}

/// String value of `key`, borrowed from `json`. The length of the view is the value's byte length.
pub fn find_string<'a>(json: &'a str, key: &str) -> Option<&'a str> {
    let value = value_after(json, key)?.strip_prefix('"')?;
    let close = value.find('"')?;
    Some(&value[..close])
}

/// Decimal integer value of `key` (optional sign).
pub fn find_int(json: &str, key: &str) -> Option<i64> {
    let value = value_after(json, key)?;
    let digits_from = usize::from(value.starts_with('-') || value.starts_with('+'));
    let len = value[digits_from..]
        .bytes()
        .take_while(u8::is_ascii_digit)
        .count();
    if len == 0 {
        return None;
    }
    value[..digits_from + len].parse().ok()
}

/// Boolean literal value of `key`.
pub fn find_bool(json: &str, key: &str) -> Option<bool> {
    let value = value_after(json, key)?;
    if value.starts_with("true") {
        Some(true)
    } else if value.starts_with("false") {
        Some(false)
    } else {
        None
    }
}

/// String elements of an array value (`"key": ["a", "b"]`). Non-string elements are skipped.
pub fn find_string_array<'a>(json: &'a str, key: &str) -> Option<Vec<&'a str>> {
    let value = value_after(json, key)?.strip_prefix('[')?;
    let body = &value[..value.find(']')?];
    let mut out = Vec::new();
    let mut rest = body;
    while let Some(open) = rest.find('"') {
        let tail = &rest[open + 1..];
        let Some(close) = tail.find('"') else { break };
        out.push(&tail[..close]);
        rest = &tail[close + 1..];
    }
    Some(out)
}

/// True for `{}` with any amount of interior/surrounding whitespace.
pub fn is_empty_object(json: &str) -> bool {
    json.trim()
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .is_some_and(|inner| inner.trim().is_empty())
}

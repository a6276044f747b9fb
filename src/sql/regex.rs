//! `$regex` pre-processing
//!
//! Patterns arrive in the platform's JavaScript-flavored dialect. Before they
//! are bound for the native `~` / `~*` operators, `\Q...\E` literal sections are
//! escaped character by character and the `x` (free-spacing) flag is applied by
//! stripping comments and unescaped whitespace.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static LITERAL_CHAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[0-9 ]|\p{L})$").expect("valid literal char pattern"));
static STRAY_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([^\\])\\E").expect("valid pattern"));
static STRAY_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([^\\])\\Q").expect("valid pattern"));
static TRAILING_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)([^\\])#.*\n").expect("valid pattern"));
static COMMENT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#.*\n").expect("valid pattern"));
static UNESCAPED_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([^\\])\s+").expect("valid pattern"));
static STARTS_WITH_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\^\\Q.*\\E").expect("valid pattern"));

/// Literalize `\Q...\E` sections while keeping a leading `^` or trailing `$` anchor
pub fn process_regex_pattern(pattern: &str) -> String {
    if let Some(rest) = pattern.strip_prefix('^') {
        format!("^{}", literalize(rest))
    } else if let Some(rest) = pattern.strip_suffix('$') {
        format!("{}$", literalize(rest))
    } else {
        literalize(pattern)
    }
}

/// Escape every character that is not a digit, space or letter
pub fn create_literal_regex(remaining: &str) -> String {
    let mut out = String::with_capacity(remaining.len() * 2);
    let mut buf = [0u8; 4];
    for c in remaining.chars() {
        if !LITERAL_CHAR.is_match(c.encode_utf8(&mut buf)) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Position of the leftmost `\Q` opening a literal section that runs to the
/// end of `s` (closed by a final `\E` when `closed`)
fn literal_section(s: &str, closed: bool) -> Option<(usize, &str)> {
    let end = if closed {
        s.strip_suffix("\\E")?.len()
    } else {
        s.len()
    };
    s.match_indices("\\Q")
        .map(|(idx, _)| idx)
        .find(|&idx| idx + 2 <= end && !s[idx + 2..].starts_with("\\E"))
        .map(|idx| (idx, &s[idx + 2..end]))
}

fn literalize(s: &str) -> String {
    for closed in [true, false] {
        if let Some((idx, remaining)) = literal_section(s, closed) {
            return format!("{}{}", literalize(&s[..idx]), create_literal_regex(remaining));
        }
    }
    let s = STRAY_END.replacen(s, 1, "${1}");
    let s = STRAY_START.replacen(&s, 1, "${1}");
    let s = s.strip_prefix("\\E").unwrap_or(&s);
    s.strip_prefix("\\Q").unwrap_or(s).to_string()
}

/// Apply the free-spacing flag: drop `#` comments and unescaped whitespace
pub fn remove_whitespace(pattern: &str) -> String {
    let mut pattern = pattern.to_string();
    if !pattern.ends_with('\n') {
        pattern.push('\n');
    }
    let pattern = TRAILING_COMMENT.replace_all(&pattern, "${1}");
    let pattern = COMMENT_LINE.replace_all(&pattern, "");
    let pattern = UNESCAPED_SPACE.replace_all(&pattern, "${1}");
    pattern.trim().to_string()
}

/// `^\Q...\E` pattern, the platform's encoding of "starts with"
pub fn is_starts_with_regex(pattern: Option<&str>) -> bool {
    pattern.is_some_and(|p| p.starts_with('^') && STARTS_WITH_LITERAL.is_match(p))
}

fn regex_of(value: &Value) -> Option<&str> {
    value.get("$regex").and_then(Value::as_str)
}

/// `$all` elements are either all starts-with regexes or none of them are
pub fn is_all_values_regex_or_none(values: &[Value]) -> bool {
    let Some(first) = values.first() else {
        return true;
    };
    let first_is_regex = is_starts_with_regex(regex_of(first));
    if values.len() == 1 {
        return first_is_regex;
    }
    values[1..]
        .iter()
        .all(|v| is_starts_with_regex(regex_of(v)) == first_is_regex)
}

pub fn is_any_value_regex_starts_with(values: &[Value]) -> bool {
    values.iter().any(|v| is_starts_with_regex(regex_of(v)))
}

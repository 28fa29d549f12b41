//! Path matching against colon-separated glob pattern lists.
//!
//! Patterns follow the fuzzer's conventions: `*` stays within one path
//! component, `**` crosses components, `?` is any single character and a
//! leading `-` excludes. Patterns using syntax that cannot be translated
//! reliably are skipped rather than failing the match.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

static COMPILED: Lazy<Mutex<HashMap<String, Option<Regex>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Translate one glob to a regular expression, `None` when unsupported
fn translate(pattern: &str) -> Option<String> {
    if pattern.contains("***") || pattern.contains(['.', '^', '[', ']']) {
        return None;
    }
    let mut out = String::with_capacity(pattern.len() * 2);
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                out.push_str(".*");
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push('.'),
            _ => out.push(c),
        }
    }
    Some(out)
}

fn matches_pattern(regex_src: &str, path: &str) -> Option<bool> {
    let mut cache = COMPILED.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let compiled = cache
        .entry(regex_src.to_string())
        .or_insert_with(|| match Regex::new(regex_src) {
            Ok(re) => Some(re),
            Err(e) => {
                debug!(pattern = regex_src, error = %e, "skipping glob");
                None
            }
        });
    compiled.as_ref().map(|re| re.is_match(path))
}

/// Lexically normalize an absolute path
fn clean(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            _ => parts.push(part),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Whether the zero-terminated path in `mem` satisfies `patterns`
///
/// A buffer without a terminator or holding a relative path never
/// matches.
#[must_use]
pub fn glob_matches(patterns: &str, mem: &[u8]) -> bool {
    let Some(end) = mem.iter().position(|&b| b == 0) else {
        return false;
    };
    let path = String::from_utf8_lossy(&mem[..end]);
    if !path.starts_with('/') {
        return false;
    }
    let path = clean(&path);
    for raw in patterns.split(':') {
        let (exclude, pattern) = match raw.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        let Some(regex_src) = translate(pattern) else {
            continue;
        };
        let Some(matched) = matches_pattern(&regex_src, &path) else {
            continue;
        };
        if matched == exclude {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate() {
        assert_eq!(translate("/dev/*").as_deref(), Some("/dev/[^/]*"));
        assert_eq!(translate("/sys/**").as_deref(), Some("/sys/.*"));
        assert_eq!(translate("/dev/tty?").as_deref(), Some("/dev/tty."));
        assert_eq!(translate("/proc/[0-9]"), None);
        assert_eq!(translate("/a/***"), None);
    }

    #[test]
    fn test_clean() {
        assert_eq!(clean("/dev//./null"), "/dev/null");
        assert_eq!(clean("/a/b/../c"), "/a/c");
        assert_eq!(clean("/.."), "/");
    }

    #[test]
    fn test_positive_and_negative_patterns() {
        let pats = "/dev/*:-/dev/mem";
        assert!(glob_matches(pats, b"/dev/null\0"));
        assert!(!glob_matches(pats, b"/dev/mem\0"));
        assert!(!glob_matches(pats, b"/etc/passwd\0"));
    }

    #[test]
    fn test_unterminated_and_relative_rejected() {
        assert!(!glob_matches("/dev/*", b"/dev/null"));
        assert!(!glob_matches("/dev/*", b"dev/null\0"));
    }

    #[test]
    fn test_unsupported_patterns_skipped() {
        assert!(glob_matches("/proc/[0-9]*", b"/anything\0"));
    }
}

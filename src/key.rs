//! Key namespacing, glob helpers and key validation.

use crate::error::{Error, Result};

/// Prefix for cached values: `cache:<key>`.
pub const CACHE_PREFIX: &str = "cache:";

/// Prefix for coalescing locks: `lock:<key>`.
pub const LOCK_PREFIX: &str = "lock:";

/// Topic carrying one `EvictionEvent` per deleted key.
pub const EVICT_TOPIC: &str = "coalesce:evict";

/// Topic carrying one `CoalescedResponse` per load attempt.
pub const RESULT_TOPIC: &str = "coalesce:ready";

/// Store key layout and topic names shared by every process in the fleet.
///
/// All participating processes must agree on these values, so changing them
/// is a fleet-wide migration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyNamespace {
    pub cache_prefix: String,
    pub lock_prefix: String,
    pub evict_topic: String,
    pub result_topic: String,
}

impl Default for KeyNamespace {
    fn default() -> Self {
        KeyNamespace {
            cache_prefix: CACHE_PREFIX.to_string(),
            lock_prefix: LOCK_PREFIX.to_string(),
            evict_topic: EVICT_TOPIC.to_string(),
            result_topic: RESULT_TOPIC.to_string(),
        }
    }
}

impl KeyNamespace {
    /// `"user:42"` → `"cache:user:42"`
    pub fn cache_key(&self, key: &str) -> String {
        format!("{}{}", self.cache_prefix, key)
    }

    /// `"user:42"` → `"lock:user:42"`
    pub fn lock_key(&self, key: &str) -> String {
        format!("{}{}", self.lock_prefix, key)
    }

    /// Glob matching every cache key that starts with `prefix`.
    ///
    /// The caller's prefix is escaped, so `"users"` matches `cache:users:1`
    /// but `"a*"` only matches keys that literally start with `a*`.
    pub fn prefix_pattern(&self, prefix: &str) -> String {
        format!("{}*", glob_escape(&self.cache_key(prefix)))
    }

    /// Caller's glob scoped to the cache namespace, left unescaped.
    pub fn scoped_pattern(&self, pattern: &str) -> String {
        format!("{}{}", glob_escape(&self.cache_prefix), pattern)
    }

    /// Strip the cache prefix from a full store key.
    pub fn logical_key<'a>(&self, full_key: &'a str) -> &'a str {
        full_key
            .strip_prefix(self.cache_prefix.as_str())
            .unwrap_or(full_key)
    }
}

/// Escape Redis glob metacharacters so the input matches literally.
pub fn glob_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Match `text` against a Redis-style glob.
///
/// Supports `*`, `?`, `[abc]`, `[a-z]`, `[^a]` and `\` escapes.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    match_from(&p, &t)
}

fn match_from(p: &[char], t: &[char]) -> bool {
    let (mut pi, mut ti) = (0, 0);
    // Backtrack point for the most recent `*`.
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() {
            match p[pi] {
                '*' => {
                    star = Some((pi, ti));
                    pi += 1;
                    continue;
                }
                '?' => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                '[' => {
                    if let Some((matched, next)) = match_class(p, pi, t[ti]) {
                        if matched {
                            pi = next;
                            ti += 1;
                            continue;
                        }
                    } else if t[ti] == '[' {
                        // Unterminated class matches a literal '['.
                        pi += 1;
                        ti += 1;
                        continue;
                    }
                }
                '\\' if pi + 1 < p.len() => {
                    if p[pi + 1] == t[ti] {
                        pi += 2;
                        ti += 1;
                        continue;
                    }
                }
                c => {
                    if c == t[ti] {
                        pi += 1;
                        ti += 1;
                        continue;
                    }
                }
            }
        }

        match star {
            Some((sp, st)) => {
                pi = sp + 1;
                ti = st + 1;
                star = Some((sp, st + 1));
            }
            None => return false,
        }
    }

    p[pi..].iter().all(|c| *c == '*')
}

/// Evaluate a `[...]` class starting at `p[start]`.
///
/// Returns `(matched, index after ']')`, or `None` if the class is not closed.
fn match_class(p: &[char], start: usize, c: char) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = i < p.len() && p[i] == '^';
    if negate {
        i += 1;
    }

    let mut matched = false;
    while i < p.len() && p[i] != ']' {
        if p[i] == '\\' && i + 1 < p.len() {
            matched |= p[i + 1] == c;
            i += 2;
        } else if i + 2 < p.len() && p[i + 1] == '-' && p[i + 2] != ']' {
            let (lo, hi) = if p[i] <= p[i + 2] {
                (p[i], p[i + 2])
            } else {
                (p[i + 2], p[i])
            };
            matched |= lo <= c && c <= hi;
            i += 3;
        } else {
            matched |= p[i] == c;
            i += 1;
        }
    }

    if i >= p.len() {
        return None;
    }
    Some((matched != negate, i + 1))
}

/// Reject keys that cannot be safely namespaced.
pub fn validate_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(Error::ValidationError("key cannot be empty".to_string()));
    }
    if key.contains('*') {
        return Err(Error::ValidationError(
            "key cannot contain '*' character".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_namespace_layout() {
        let ns = KeyNamespace::default();
        assert_eq!(ns.cache_key("user:42"), "cache:user:42");
        assert_eq!(ns.lock_key("user:42"), "lock:user:42");
        assert_eq!(ns.prefix_pattern("users"), "cache:users*");
        assert_eq!(ns.scoped_pattern("users:*"), "cache:users:*");
        assert_eq!(ns.logical_key("cache:users:1"), "users:1");
    }

    #[test]
    fn test_prefix_pattern_escapes_metacharacters() {
        let ns = KeyNamespace::default();
        let pattern = ns.prefix_pattern("a*");
        assert_eq!(pattern, "cache:a\\**");
        assert!(glob_match(&pattern, "cache:a*1"));
        assert!(!glob_match(&pattern, "cache:ab"));
    }

    #[test]
    fn test_glob_match_basics() {
        assert!(glob_match("cache:users*", "cache:users:1"));
        assert!(!glob_match("cache:users*", "cache:other:1"));
        assert!(glob_match("h?llo", "hello"));
        assert!(!glob_match("h?llo", "hllo"));
        assert!(glob_match("h[ae]llo", "hallo"));
        assert!(!glob_match("h[ae]llo", "hillo"));
        assert!(glob_match("h[^e]llo", "hallo"));
        assert!(!glob_match("h[^e]llo", "hello"));
        assert!(glob_match("h[a-c]llo", "hbllo"));
        assert!(glob_match("*", ""));
        assert!(glob_match("a*b*c", "aXXbYYc"));
        assert!(!glob_match("a*b*c", "aXXbYY"));
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("user:42").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("   ").is_err());
        assert!(validate_key("user:*").is_err());
    }

    proptest! {
        #[test]
        fn escaped_text_matches_itself(s in "[ -~]{0,24}") {
            prop_assert!(glob_match(&glob_escape(&s), &s));
        }

        #[test]
        fn prefix_pattern_matches_extensions(prefix in "[a-z:]{1,8}", rest in "[a-z0-9:]{0,8}") {
            let ns = KeyNamespace::default();
            let full = ns.cache_key(&format!("{prefix}{rest}"));
            prop_assert!(glob_match(&ns.prefix_pattern(&prefix), &full));
        }
    }
}

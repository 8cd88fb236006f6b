//! Environment variable parsing utilities.
//!
//! Configuration overrides (`AFFINITY_*`) are read through these helpers so
//! that every setting parses the same way:
//!
//! ```
//! use affinity_audit_types::env_utils::{env_bool_or, env_list, env_var_or};
//!
//! let depth: usize = env_var_or("AFFINITY_STACK_DEPTH", 10);
//! let capture = env_bool_or("AFFINITY_CAPTURE_STACKS", true);
//! let targets: Vec<String> = env_list("AFFINITY_TARGETS");
//! ```

use std::str::FromStr;

/// Parse an environment variable into a type that implements `FromStr`.
///
/// Returns `None` if the variable is not set or cannot be parsed.
pub fn env_var<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Parse an environment variable with a default value.
pub fn env_var_or<T: FromStr>(key: &str, default: T) -> T {
    env_var(key).unwrap_or(default)
}

/// Check if an environment variable is set to a truthy value.
///
/// Returns `true` if the variable is set to "1", "true", "yes", or "on" (case-insensitive).
pub fn env_bool(key: &str) -> bool {
    env_bool_or(key, false)
}

/// Check if an environment variable is set to a truthy value, with a default
/// for when it is unset.
pub fn env_bool_or(key: &str, default: bool) -> bool {
    match std::env::var(key).ok() {
        Some(v) => matches!(
            v.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        None => default,
    }
}

/// Get an environment variable as a string, if set and non-empty.
pub fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse a comma-separated environment variable into a vector.
///
/// Returns an empty vector if the variable is not set. Empty entries are dropped.
pub fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .ok()
        .map(|v| split_list(&v))
        .unwrap_or_default()
}

/// Split a comma-separated list, trimming entries and dropping empty ones.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_parsing() {
        std::env::set_var("AFFINITY_TEST_U64", " 42 ");
        let val: Option<u64> = env_var("AFFINITY_TEST_U64");
        assert_eq!(val, Some(42));

        let missing: Option<u64> = env_var("AFFINITY_NONEXISTENT_12345");
        assert_eq!(missing, None);

        std::env::remove_var("AFFINITY_TEST_U64");
    }

    #[test]
    fn test_env_var_or() {
        std::env::set_var("AFFINITY_TEST_WITH_DEFAULT", "100");
        let val: u64 = env_var_or("AFFINITY_TEST_WITH_DEFAULT", 50);
        assert_eq!(val, 100);

        let default_val: u64 = env_var_or("AFFINITY_NONEXISTENT_12346", 50);
        assert_eq!(default_val, 50);

        std::env::remove_var("AFFINITY_TEST_WITH_DEFAULT");
    }

    #[test]
    fn test_env_bool() {
        std::env::set_var("AFFINITY_TEST_BOOL_TRUE", "true");
        std::env::set_var("AFFINITY_TEST_BOOL_YES", "YES");
        std::env::set_var("AFFINITY_TEST_BOOL_FALSE", "false");

        assert!(env_bool("AFFINITY_TEST_BOOL_TRUE"));
        assert!(env_bool("AFFINITY_TEST_BOOL_YES"));
        assert!(!env_bool("AFFINITY_TEST_BOOL_FALSE"));
        assert!(!env_bool("AFFINITY_NONEXISTENT_12347"));
        assert!(env_bool_or("AFFINITY_NONEXISTENT_12347", true));

        std::env::remove_var("AFFINITY_TEST_BOOL_TRUE");
        std::env::remove_var("AFFINITY_TEST_BOOL_YES");
        std::env::remove_var("AFFINITY_TEST_BOOL_FALSE");
    }

    #[test]
    fn test_env_list() {
        std::env::set_var("AFFINITY_TEST_LIST", "com/model, com/other,,");
        let list = env_list("AFFINITY_TEST_LIST");
        assert_eq!(list, vec!["com/model", "com/other"]);

        let empty = env_list("AFFINITY_NONEXISTENT_12349");
        assert!(empty.is_empty());

        std::env::remove_var("AFFINITY_TEST_LIST");
    }

    #[test]
    fn test_env_string_ignores_blank() {
        std::env::set_var("AFFINITY_TEST_BLANK", "   ");
        assert_eq!(env_string("AFFINITY_TEST_BLANK"), None);
        std::env::remove_var("AFFINITY_TEST_BLANK");
    }
}

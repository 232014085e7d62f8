//! Environment overrides with compiled defaults. Every tunable reads one
//! `MML_*` variable and falls back to its built-in value when the variable
//! is unset or unparseable.

use std::str::FromStr;

/// Value of `key`, or `default` when the variable is unset.
pub fn string(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

/// Parsed value of `key`; unset or unparseable falls back to `default`.
pub fn parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

use std::fmt::Display;
use std::str::FromStr;

use color_eyre::Result;

pub fn get_env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|e| e.into())
}

pub fn get_env_var_or_panic(key: &str) -> String {
    get_env_var(key).unwrap_or_else(|e| panic!("Failed to get env var {}: {}", key, e))
}

pub fn get_env_var_or_default(key: &str, default: &str) -> String {
    get_env_var(key).unwrap_or(default.to_string())
}

/// Parses an env var into `T`, falling back to `default` when unset.
/// A set-but-unparseable value is a configuration error and panics, so the
/// process never runs with a half-read config.
pub fn get_env_var_parsed_or_default<T>(key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: Display,
{
    match get_env_var(key) {
        Ok(value) => value.parse::<T>().unwrap_or_else(|e| panic!("Failed to parse env var {}: {}", key, e)),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsed_or_default_falls_back_when_unset() {
        assert_eq!(get_env_var_parsed_or_default("SNAPSHOT_TEST_UNSET_VAR", 42u64), 42);
    }

    #[test]
    fn parsed_or_default_reads_set_value() {
        std::env::set_var("SNAPSHOT_TEST_SET_VAR", "7");
        assert_eq!(get_env_var_parsed_or_default("SNAPSHOT_TEST_SET_VAR", 42u64), 7);
    }
}

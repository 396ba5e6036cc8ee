//! Small helpers shared by the configuration resolvers.

use std::str::FromStr;

use crate::error::ConfigError;

/// Read an optional environment override.
///
/// Unset and empty are both treated as absent.
pub(crate) fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Parse an environment override, mapping parse failures to
/// `ConfigError::InvalidValue` under the variable's name.
pub(crate) fn parse_env<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    optional_env(key)
        .map(|raw| {
            raw.parse::<T>().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("must be a valid value: {e}"),
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_env_is_absent() {
        std::env::set_var("MCPOOL_TEST_EMPTY", "");
        assert_eq!(optional_env("MCPOOL_TEST_EMPTY"), None);
    }

    #[test]
    fn parse_env_reports_key() {
        std::env::set_var("MCPOOL_TEST_BAD_INT", "abc");
        let err = parse_env::<u32>("MCPOOL_TEST_BAD_INT").unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => {
                assert_eq!(key, "MCPOOL_TEST_BAD_INT")
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}

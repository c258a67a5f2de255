pub mod nsq;
pub mod redis;
pub mod tracing;

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use thiserror::Error;

/// Failures while reading configuration out of the process environment.
/// Every one of these aborts startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("required environment variable '{0}' is not set")]
    Missing(String),

    #[error("environment variable '{key}' has unusable value '{value}': {reason}")]
    Unparseable {
        key: String,
        value: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Deployment environment. Its only effect here is selecting the log
/// output format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    /// Reads `APP_ENV`. Anything other than "production"
    /// (case-insensitive), including an unset variable, counts as
    /// development.
    pub fn detect() -> Self {
        match env::var("APP_ENV") {
            Ok(value) if value.eq_ignore_ascii_case("production") => Self::Production,
            _ => Self::Development,
        }
    }
}

fn parse_value<T>(key: &str, raw: String) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match raw.parse() {
        Ok(value) => Ok(value),
        Err(e) => Err(ConfigError::Unparseable {
            key: key.to_string(),
            reason: e.to_string(),
            value: raw,
        }),
    }
}

/// Parse an environment variable into any `FromStr` type, with `default`
/// standing in for an unset or empty variable.
pub fn env_parsed<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) if !raw.is_empty() => parse_value(key, raw),
        _ => Ok(default),
    }
}

/// Like [`env_parsed`], but the variable must be set and non-empty.
pub fn env_parsed_required<T>(key: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) if !raw.is_empty() => parse_value(key, raw),
        _ => Err(ConfigError::Missing(key.to_string())),
    }
}

/// Split a comma-separated environment variable into entries, dropping
/// empty segments. An unset variable yields an empty list.
pub fn env_list(key: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_environment() {
        temp_env::with_var("APP_ENV", Some("production"), || {
            assert_eq!(Environment::detect(), Environment::Production);
        });
        temp_env::with_var("APP_ENV", Some("PrOdUcTiOn"), || {
            assert_eq!(Environment::detect(), Environment::Production);
        });
        temp_env::with_var("APP_ENV", Some("staging"), || {
            assert_eq!(Environment::detect(), Environment::Development);
        });
        temp_env::with_var_unset("APP_ENV", || {
            assert_eq!(Environment::detect(), Environment::Development);
        });
    }

    #[test]
    fn test_env_parsed_prefers_the_variable() {
        temp_env::with_var("NUM_VAR", Some("42"), || {
            assert_eq!(env_parsed("NUM_VAR", 7usize).unwrap(), 42);
        });
        temp_env::with_var("STR_VAR", Some("hello"), || {
            let value: String = env_parsed("STR_VAR", "fallback".to_string()).unwrap();
            assert_eq!(value, "hello");
        });
    }

    #[test]
    fn test_env_parsed_falls_back_on_unset_or_empty() {
        temp_env::with_var_unset("NUM_VAR", || {
            assert_eq!(env_parsed("NUM_VAR", 7usize).unwrap(), 7);
        });
        temp_env::with_var("NUM_VAR", Some(""), || {
            assert_eq!(env_parsed("NUM_VAR", 7usize).unwrap(), 7);
        });
    }

    #[test]
    fn test_env_parsed_rejects_garbage() {
        temp_env::with_var("NUM_VAR", Some("many"), || {
            let err = env_parsed("NUM_VAR", 7usize).unwrap_err();
            let message = err.to_string();
            assert!(message.contains("NUM_VAR"));
            assert!(message.contains("many"));
        });
    }

    #[test]
    fn test_env_parsed_required() {
        temp_env::with_var("PORT_VAR", Some("6379"), || {
            assert_eq!(env_parsed_required::<u16>("PORT_VAR").unwrap(), 6379);
        });
        temp_env::with_var_unset("PORT_VAR", || {
            let err = env_parsed_required::<u16>("PORT_VAR").unwrap_err();
            assert!(err.to_string().contains("required"));
            assert!(err.to_string().contains("PORT_VAR"));
        });
        temp_env::with_var("PORT_VAR", Some(""), || {
            assert!(env_parsed_required::<u16>("PORT_VAR").is_err());
        });
    }

    #[test]
    fn test_env_list_splits_and_drops_empty() {
        temp_env::with_var("LIST_VAR", Some("a:4150, b:4150,,"), || {
            assert_eq!(env_list("LIST_VAR"), vec!["a:4150", "b:4150"]);
        });
        temp_env::with_var_unset("LIST_VAR", || {
            assert!(env_list("LIST_VAR").is_empty());
        });
    }
}

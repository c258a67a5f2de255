use crate::{env_parsed_required, ConfigError};
use std::env;

/// Redis connection settings for the lock service and the failed-message
/// store. `REDIS_PASSWORD` is optional.
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
}

impl RedisConfig {
    /// Connection URL in the form the `redis` crate accepts.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!("redis://:{}@{}:{}/0", password, self.host, self.port),
            None => format!("redis://{}:{}/0", self.host, self.port),
        }
    }

    /// Load the configuration only when both `REDIS_HOST` and `REDIS_PORT`
    /// are present. Callers treat `None` as "no backing store configured".
    pub fn optional_from_env() -> Result<Option<Self>, ConfigError> {
        let host = env::var("REDIS_HOST").ok();
        let port = env::var("REDIS_PORT").ok();

        match (host, port) {
            (Some(_), Some(_)) => Self::from_env().map(Some),
            _ => Ok(None),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: env_parsed_required("REDIS_HOST")?,
            port: env_parsed_required("REDIS_PORT")?,
            password: env::var("REDIS_PASSWORD").ok().filter(|p| !p.is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_env_success() {
        temp_env::with_vars(
            [
                ("REDIS_HOST", Some("redis.internal")),
                ("REDIS_PORT", Some("6379")),
                ("REDIS_PASSWORD", None),
            ],
            || {
                let config = RedisConfig::from_env().unwrap();
                assert_eq!(config.host, "redis.internal");
                assert_eq!(config.port, 6379);
                assert_eq!(config.url(), "redis://redis.internal:6379/0");
            },
        );
    }

    #[test]
    fn test_url_with_password() {
        let config = RedisConfig {
            host: "redis.internal".to_string(),
            port: 6380,
            password: Some("hunter2".to_string()),
        };
        assert_eq!(config.url(), "redis://:hunter2@redis.internal:6380/0");
    }

    #[test]
    fn test_from_env_missing_host() {
        temp_env::with_vars([("REDIS_HOST", None), ("REDIS_PORT", Some("6379"))], || {
            let err = RedisConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("REDIS_HOST"));
        });
    }

    #[test]
    fn test_optional_from_env_disabled_when_unset() {
        temp_env::with_vars_unset(["REDIS_HOST", "REDIS_PORT"], || {
            assert!(RedisConfig::optional_from_env().unwrap().is_none());
        });
    }

    #[test]
    fn test_optional_from_env_present() {
        temp_env::with_vars(
            [("REDIS_HOST", Some("localhost")), ("REDIS_PORT", Some("6379"))],
            || {
                let config = RedisConfig::optional_from_env().unwrap();
                assert!(config.is_some());
            },
        );
    }

    #[test]
    fn test_invalid_port_is_fatal() {
        temp_env::with_vars(
            [("REDIS_HOST", Some("localhost")), ("REDIS_PORT", Some("not-a-port"))],
            || {
                assert!(RedisConfig::from_env().is_err());
            },
        );
    }
}

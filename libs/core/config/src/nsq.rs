use crate::{env_list, env_parsed, ConfigError};

/// NSQ connection and consumption settings.
///
/// At least one of `NSQD_TCP_ADDRESSES` / `LOOKUPD_HTTP_ADDRESSES` must be
/// non-empty. `NSQ_MAX_IN_FLIGHT` is clamped to `NSQ_CONCURRENCY` so the
/// broker can never hand out more messages than the worker pool can start.
#[derive(Clone, Debug)]
pub struct NsqConfig {
    pub nsqd_tcp_addresses: Vec<String>,
    pub lookupd_http_addresses: Vec<String>,
    pub concurrency: usize,
    pub max_in_flight: usize,
}

impl NsqConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let nsqd_tcp_addresses = env_list("NSQD_TCP_ADDRESSES");
        let lookupd_http_addresses = env_list("LOOKUPD_HTTP_ADDRESSES");

        if nsqd_tcp_addresses.is_empty() && lookupd_http_addresses.is_empty() {
            return Err(ConfigError::Invalid(
                "set NSQD_TCP_ADDRESSES and/or LOOKUPD_HTTP_ADDRESSES".to_string(),
            ));
        }

        let concurrency = env_parsed("NSQ_CONCURRENCY", 1usize)?.max(1);
        let max_in_flight = env_parsed("NSQ_MAX_IN_FLIGHT", 1usize)?
            .max(1)
            .min(concurrency);

        Ok(Self {
            nsqd_tcp_addresses,
            lookupd_http_addresses,
            concurrency,
            max_in_flight,
        })
    }
}

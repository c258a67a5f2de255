//! Failed-message store.
//!
//! Messages whose handlers exhausted their retries are recorded in a Redis
//! sorted set scored by persistence time, for later inspection. The store
//! also answers the redelivery questions: is this payload a replay of a
//! previously-failed message, and is this route one of its recipients on
//! this channel.

use crate::error::WorkerError;
use chrono::Utc;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

/// Sorted set holding failed-message records.
pub const MESSAGE_STORE_KEY: &str = "eh:messages:failed";

/// One failed-message record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedRecord {
    pub topic: String,
    pub channel: String,
    pub route: String,
    pub message: String,
    #[serde(default)]
    pub error: String,
    pub persisted_at: String,
}

/// Failed-message store over Redis. Without a backing connection the store
/// is disabled and every mutation is a silent no-op.
#[derive(Clone)]
pub struct MessagePersistor {
    redis: Option<ConnectionManager>,
}

impl MessagePersistor {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis: Some(redis) }
    }

    pub fn disabled() -> Self {
        debug!("no redis client configured, failed message persistence disabled");
        Self { redis: None }
    }

    pub fn enabled(&self) -> bool {
        self.redis.is_some()
    }

    /// Record a failed message. Returns whether the record was new; an
    /// update of an existing record returns false, as does a disabled
    /// store.
    pub async fn persist(
        &self,
        topic: &str,
        channel: &str,
        route: &str,
        message: &str,
        error: &str,
    ) -> Result<bool, WorkerError> {
        let Some(redis) = &self.redis else {
            return Ok(false);
        };

        let now = Utc::now();
        let record = FailedRecord {
            topic: topic.to_string(),
            channel: channel.to_string(),
            route: route.to_string(),
            message: message.to_string(),
            error: error.to_string(),
            persisted_at: now.to_rfc3339(),
        };
        let member = serde_json::to_string(&record)?;

        let mut conn = redis.clone();
        let added: i64 = redis::cmd("ZADD")
            .arg(MESSAGE_STORE_KEY)
            .arg(now.timestamp())
            .arg(&member)
            .query_async(&mut conn)
            .await?;

        info!(
            topic = %topic,
            channel = %channel,
            route = %route,
            new = added > 0,
            "recorded failed message"
        );
        Ok(added > 0)
    }

    /// A payload is a replay of a previously-failed message when it carries
    /// a `recipients` key.
    pub fn is_persisted_message(decoded: &Value) -> bool {
        decoded.get("recipients").is_some()
    }

    /// Whether `route` is listed under `recipients[channel]`.
    pub fn is_route_for_channel(decoded: &Value, channel: &str, route: &str) -> bool {
        decoded
            .get("recipients")
            .and_then(|recipients| recipients.get(channel))
            .and_then(Value::as_array)
            .map(|routes| routes.iter().any(|r| r.as_str() == Some(route)))
            .unwrap_or(false)
    }

    /// Redelivery gate: fresh messages go to every matching route, replays
    /// only to the recipients recorded for this channel.
    pub fn is_route_message(decoded: &Value, channel: &str, route: &str) -> bool {
        if !Self::is_persisted_message(decoded) {
            return true;
        }
        Self::is_route_for_channel(decoded, channel, route)
    }

    /// Read up to `count` records, oldest first.
    pub async fn list(&self, count: usize) -> Result<Vec<FailedRecord>, WorkerError> {
        let Some(redis) = &self.redis else {
            return Ok(Vec::new());
        };
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut conn = redis.clone();
        let members: Vec<String> = redis::cmd("ZRANGE")
            .arg(MESSAGE_STORE_KEY)
            .arg(0)
            .arg(count as i64 - 1)
            .query_async(&mut conn)
            .await?;

        Ok(members
            .iter()
            .filter_map(|member| serde_json::from_str(member).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_is_persisted_message() {
        let replay = json!({"name": "x", "recipients": {"mailer": ["send_email"]}});
        let fresh = json!({"name": "x"});

        assert!(MessagePersistor::is_persisted_message(&replay));
        assert!(!MessagePersistor::is_persisted_message(&fresh));
    }

    #[test]
    fn test_is_route_for_channel() {
        let replay = json!({"recipients": {"mailer": ["send_email", "audit"]}});

        assert!(MessagePersistor::is_route_for_channel(&replay, "mailer", "send_email"));
        assert!(MessagePersistor::is_route_for_channel(&replay, "mailer", "audit"));
        assert!(!MessagePersistor::is_route_for_channel(&replay, "mailer", "other"));
        assert!(!MessagePersistor::is_route_for_channel(&replay, "billing", "send_email"));
    }

    #[test]
    fn test_is_route_message() {
        let fresh = json!({"name": "x"});
        assert!(MessagePersistor::is_route_message(&fresh, "mailer", "anything"));

        let replay = json!({"recipients": {"mailer": ["send_email"]}});
        assert!(MessagePersistor::is_route_message(&replay, "mailer", "send_email"));
        assert!(!MessagePersistor::is_route_message(&replay, "mailer", "other"));
    }

    #[test]
    fn test_disabled_store_is_noop() {
        let persistor = MessagePersistor::disabled();
        assert!(!persistor.enabled());

        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let persisted = runtime
            .block_on(persistor.persist("events", "mailer", "send_email", "{}", "boom"))
            .unwrap();
        assert!(!persisted);

        let records = runtime.block_on(persistor.list(10)).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_failed_record_round_trip() {
        let record = FailedRecord {
            topic: "events".to_string(),
            channel: "mailer".to_string(),
            route: "send_email".to_string(),
            message: r#"{"name":"x"}"#.to_string(),
            error: "smtp refused".to_string(),
            persisted_at: "2024-05-01T00:00:00+00:00".to_string(),
        };

        let json = serde_json::to_string(&record).unwrap();
        let parsed: FailedRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }
}

//! Broker admin HTTP operations: topic pre-creation, lookupd producer
//! discovery, and the HTTP publish fallback.

use crate::error::WorkerError;
use serde::Deserialize;
use std::time::Duration;
use tracing::{info, warn};

const ADMIN_TIMEOUT: Duration = Duration::from_secs(1);
const CREATE_RETRY_PAUSE: Duration = Duration::from_secs(1);

/// One producer entry from a lookupd `/nodes` response.
#[derive(Debug, Clone, Deserialize)]
pub struct ProducerNode {
    pub broadcast_address: String,
    pub tcp_port: u16,
    #[serde(default)]
    pub topics: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct NodesResponse {
    #[serde(default)]
    producers: Vec<ProducerNode>,
}

/// Create `topic` on one nsqd HTTP host. False when the host is unreachable
/// or answers non-200.
pub async fn create_topic(client: &reqwest::Client, nsqd_http_host: &str, topic: &str) -> bool {
    let url = format!("http://{nsqd_http_host}/topic/create?topic={topic}");
    match client.post(&url).timeout(ADMIN_TIMEOUT).send().await {
        Ok(response) if response.status().is_success() => {
            info!(topic = %topic, host = %nsqd_http_host, "topic created");
            true
        }
        Ok(response) => {
            warn!(
                topic = %topic,
                host = %nsqd_http_host,
                status = %response.status(),
                "bad response for topic create"
            );
            false
        }
        Err(e) => {
            warn!(topic = %topic, host = %nsqd_http_host, error = %e, "topic create failed");
            false
        }
    }
}

/// Create every topic on every nsqd HTTP host, sweeping with a one second
/// pause until all have succeeded.
pub async fn register_topics(nsqd_http_hosts: &[String], topics: &[String]) {
    let client = reqwest::Client::new();

    let mut remaining: Vec<(String, String)> = nsqd_http_hosts
        .iter()
        .flat_map(|host| topics.iter().map(move |topic| (host.clone(), topic.clone())))
        .collect();

    while !remaining.is_empty() {
        let mut still_missing = Vec::new();
        for (host, topic) in remaining {
            if !create_topic(&client, &host, &topic).await {
                still_missing.push((host, topic));
            }
        }
        remaining = still_missing;
        if !remaining.is_empty() {
            tokio::time::sleep(CREATE_RETRY_PAUSE).await;
        }
    }
}

/// Discover producers from a lookupd instance.
pub async fn lookup_nodes(lookupd_http_address: &str) -> Result<Vec<ProducerNode>, WorkerError> {
    let url = format!("http://{lookupd_http_address}/nodes");
    let response = reqwest::get(&url).await?.error_for_status()?;
    let nodes: NodesResponse = response.json().await?;
    Ok(nodes.producers)
}

/// Publish directly through an nsqd HTTP endpoint, for when the TCP writer
/// is unavailable.
pub async fn http_publish(
    nsqd_http_host: &str,
    topic: &str,
    payload: Vec<u8>,
) -> Result<(), WorkerError> {
    let url = format!("http://{nsqd_http_host}/pub?topic={topic}");
    let client = reqwest::Client::new();
    client
        .post(&url)
        .body(payload)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nodes_response_parsing() {
        let raw = r#"{
            "producers": [
                {
                    "broadcast_address": "nsqd-0.internal",
                    "tcp_port": 4150,
                    "http_port": 4151,
                    "topics": ["events", "audit"]
                },
                {
                    "broadcast_address": "nsqd-1.internal",
                    "tcp_port": 4150
                }
            ]
        }"#;

        let nodes: NodesResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(nodes.producers.len(), 2);
        assert_eq!(nodes.producers[0].broadcast_address, "nsqd-0.internal");
        assert_eq!(nodes.producers[0].topics, vec!["events", "audit"]);
        assert!(nodes.producers[1].topics.is_empty());
    }

    #[test]
    fn test_empty_nodes_response() {
        let nodes: NodesResponse = serde_json::from_str("{}").unwrap();
        assert!(nodes.producers.is_empty());
    }
}

//! HTTP client for the lookup directory (and the broker stats endpoint).
//!
//! Every response uses the same envelope:
//! `{"status_code": 200, "status_txt": "OK", "data": {...}}`. Multi-endpoint
//! queries fan out in parallel, union their results, and fail only when every
//! endpoint fails.

use std::collections::HashSet;
use std::time::Duration;

use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use tracing::{debug, warn};

use crate::error::DriftqClientError;
use crate::Result;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// One broker as advertised by the lookup directory.
#[derive(Debug, Clone, Deserialize)]
pub struct Producer {
    pub address: String,
    #[serde(deserialize_with = "port_from_number_or_string")]
    pub tcp_port: u16,
    #[serde(deserialize_with = "port_from_number_or_string")]
    pub http_port: u16,
    #[serde(default = "unknown_version")]
    pub version: String,
    #[serde(default)]
    pub topics: Vec<String>,
}

impl Producer {
    /// `host:port` of the broker's TCP endpoint.
    pub fn tcp_address(&self) -> String {
        format!("{}:{}", self.address, self.tcp_port)
    }

    fn dedup_key(&self) -> String {
        format!("{}:{}:{}", self.address, self.http_port, self.tcp_port)
    }
}

fn unknown_version() -> String {
    "unknown".to_string()
}

// directories in the wild serve ports as either numbers or strings
fn port_from_number_or_string<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(u16),
        String(String),
    }

    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(port) => Ok(port),
        NumberOrString::String(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status_code: i64,
    #[serde(default)]
    status_txt: String,
    data: T,
}

#[derive(Debug, Default, Deserialize)]
struct LookupData {
    #[serde(default)]
    producers: Vec<Producer>,
}

#[derive(Debug, Default, Deserialize)]
struct TopicsData {
    #[serde(default)]
    topics: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChannelsData {
    #[serde(default)]
    channels: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct NodesData {
    #[serde(default)]
    producers: Vec<Producer>,
}

#[derive(Debug, Default, Deserialize)]
struct StatsData {
    #[serde(default)]
    topics: Vec<TopicStats>,
}

/// Per-topic statistics from a broker's `/stats?format=json` endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TopicStats {
    pub topic_name: String,
    #[serde(default)]
    pub depth: i64,
    #[serde(default)]
    pub backend_depth: i64,
    #[serde(default)]
    pub message_count: u64,
    #[serde(default)]
    pub channels: Vec<ChannelStats>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelStats {
    pub channel_name: String,
    #[serde(default)]
    pub depth: i64,
    #[serde(default)]
    pub in_flight_count: i64,
    #[serde(default)]
    pub deferred_count: i64,
    #[serde(default)]
    pub requeue_count: i64,
    #[serde(default)]
    pub message_count: u64,
}

/// Client for the directory HTTP API.
#[derive(Debug, Clone, Default)]
pub struct LookupClient {
    http: reqwest::Client,
}

impl LookupClient {
    pub fn new() -> Self {
        Self::default()
    }

    async fn get_data<T: DeserializeOwned>(&self, url: String) -> Result<T> {
        debug!(url = %url, "querying");
        let response = self
            .http
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        let envelope: Envelope<T> = response.json().await?;
        if envelope.status_code != 200 {
            return Err(DriftqClientError::lookup(format!(
                "{} returned {} {}",
                url, envelope.status_code, envelope.status_txt
            )));
        }
        Ok(envelope.data)
    }

    async fn get_data_with_topic<T: DeserializeOwned>(
        &self,
        url: String,
        topic: &str,
    ) -> Result<T> {
        debug!(url = %url, topic = %topic, "querying");
        let response = self
            .http
            .get(&url)
            .query(&[("topic", topic)])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        let envelope: Envelope<T> = response.json().await?;
        if envelope.status_code != 200 {
            return Err(DriftqClientError::lookup(format!(
                "{} returned {} {}",
                url, envelope.status_code, envelope.status_txt
            )));
        }
        Ok(envelope.data)
    }

    /// Brokers currently producing `topic`, according to one directory.
    pub async fn lookup(&self, addr: &str, topic: &str) -> Result<Vec<Producer>> {
        let data: LookupData = self
            .get_data_with_topic(format!("http://{}/lookup", addr), topic)
            .await?;
        Ok(data.producers)
    }

    /// All topics known to one directory.
    pub async fn topics(&self, addr: &str) -> Result<Vec<String>> {
        let data: TopicsData = self.get_data(format!("http://{}/topics", addr)).await?;
        Ok(data.topics)
    }

    /// Channels of `topic` known to one directory.
    pub async fn channels(&self, addr: &str, topic: &str) -> Result<Vec<String>> {
        let data: ChannelsData = self
            .get_data_with_topic(format!("http://{}/channels", addr), topic)
            .await?;
        Ok(data.channels)
    }

    /// All brokers registered with one directory.
    pub async fn nodes(&self, addr: &str) -> Result<Vec<Producer>> {
        let data: NodesData = self.get_data(format!("http://{}/nodes", addr)).await?;
        Ok(data.producers)
    }

    /// Per-topic statistics from one broker's HTTP port.
    pub async fn stats(&self, addr: &str) -> Result<Vec<TopicStats>> {
        let data: StatsData = self
            .get_data(format!("http://{}/stats?format=json", addr))
            .await?;
        Ok(data.topics)
    }

    /// Query every directory for `topic` in parallel and return the union of
    /// unique broker TCP addresses. Partial failures are logged; only a total
    /// failure is an error.
    pub async fn lookup_topic_producers(
        &self,
        addrs: &[String],
        topic: &str,
    ) -> Result<Vec<String>> {
        let results = join_all(addrs.iter().map(|addr| self.lookup(addr, topic))).await;

        let mut seen = HashSet::new();
        let mut endpoints = Vec::new();
        let mut any_success = false;
        for (addr, result) in addrs.iter().zip(results) {
            match result {
                Ok(producers) => {
                    any_success = true;
                    for producer in producers {
                        let endpoint = producer.tcp_address();
                        if seen.insert(endpoint.clone()) {
                            endpoints.push(endpoint);
                        }
                    }
                }
                Err(e) => warn!(addr = %addr, error = %e, "lookup query failed"),
            }
        }

        if !any_success {
            return Err(DriftqClientError::lookup(
                "unable to query any lookup directory",
            ));
        }
        Ok(endpoints)
    }

    /// Union of all topics across directories, sorted.
    pub async fn all_topics(&self, addrs: &[String]) -> Result<Vec<String>> {
        let results = join_all(addrs.iter().map(|addr| self.topics(addr))).await;
        union_strings(addrs, results, "unable to query any lookup directory")
    }

    /// Union of `topic`'s channels across directories, sorted.
    pub async fn topic_channels(&self, addrs: &[String], topic: &str) -> Result<Vec<String>> {
        let results = join_all(addrs.iter().map(|addr| self.channels(addr, topic))).await;
        union_strings(addrs, results, "unable to query any lookup directory")
    }

    /// All brokers across directories, deduplicated by
    /// `address:http_port:tcp_port`.
    pub async fn all_nodes(&self, addrs: &[String]) -> Result<Vec<Producer>> {
        let results = join_all(addrs.iter().map(|addr| self.nodes(addr))).await;

        let mut seen = HashSet::new();
        let mut nodes = Vec::new();
        let mut any_success = false;
        for (addr, result) in addrs.iter().zip(results) {
            match result {
                Ok(producers) => {
                    any_success = true;
                    for producer in producers {
                        if seen.insert(producer.dedup_key()) {
                            nodes.push(producer);
                        }
                    }
                }
                Err(e) => warn!(addr = %addr, error = %e, "nodes query failed"),
            }
        }

        if !any_success {
            return Err(DriftqClientError::lookup(
                "unable to query any lookup directory",
            ));
        }
        Ok(nodes)
    }
}

fn union_strings(
    addrs: &[String],
    results: Vec<Result<Vec<String>>>,
    all_failed_message: &str,
) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut all = Vec::new();
    let mut any_success = false;
    for (addr, result) in addrs.iter().zip(results) {
        match result {
            Ok(values) => {
                any_success = true;
                for value in values {
                    if seen.insert(value.clone()) {
                        all.push(value);
                    }
                }
            }
            Err(e) => warn!(addr = %addr, error = %e, "directory query failed"),
        }
    }
    if !any_success {
        return Err(DriftqClientError::lookup(all_failed_message));
    }
    all.sort();
    Ok(all)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_producer_with_numeric_ports() {
        let json = r#"{"address": "queue-1.local", "tcp_port": 4150, "http_port": 4151,
                       "version": "0.2.16", "topics": ["orders"]}"#;
        let producer: Producer = serde_json::from_str(json).unwrap();
        assert_eq!(producer.tcp_address(), "queue-1.local:4150");
        assert_eq!(producer.http_port, 4151);
        assert_eq!(producer.version, "0.2.16");
        assert_eq!(producer.topics, vec!["orders"]);
    }

    #[test]
    fn test_producer_with_string_ports_and_missing_version() {
        let json = r#"{"address": "queue-2.local", "tcp_port": "4150", "http_port": "4151"}"#;
        let producer: Producer = serde_json::from_str(json).unwrap();
        assert_eq!(producer.tcp_port, 4150);
        assert_eq!(producer.version, "unknown");
        assert!(producer.topics.is_empty());
    }

    #[test]
    fn test_producer_rejects_garbage_port() {
        let json = r#"{"address": "x", "tcp_port": "not-a-port", "http_port": 1}"#;
        assert!(serde_json::from_str::<Producer>(json).is_err());
    }

    #[test]
    fn test_envelope_parsing() {
        let json = r#"{"status_code": 200, "status_txt": "OK",
                       "data": {"producers": [{"address": "a", "tcp_port": 1, "http_port": 2}]}}"#;
        let envelope: Envelope<LookupData> = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.status_code, 200);
        assert_eq!(envelope.data.producers.len(), 1);
    }
}

//! Sparkplug-style topics and JSON envelopes for device readings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::config::settings::{DataType, PublishConfig};
use crate::devices::traits::Metric;

pub const NAMESPACE: &str = "spBv1.0";
pub const BD_SEQ_METRIC: &str = "bdSeq";
pub const REBIRTH_METRIC: &str = "Node Control/Rebirth";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    NBirth,
    NDeath,
    DBirth,
    DData,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::NBirth => "NBIRTH",
            MessageType::NDeath => "NDEATH",
            MessageType::DBirth => "DBIRTH",
            MessageType::DData => "DDATA",
        }
    }

    pub fn is_birth(self) -> bool {
        matches!(self, MessageType::NBirth | MessageType::DBirth)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn topic(group_id: &str, message_type: MessageType, node_id: &str, device: &str) -> String {
    format!("{}/{}/{}/{}/{}", NAMESPACE, group_id, message_type, node_id, device)
}

/// Topic of a message about the edge node itself rather than one of its devices.
pub fn node_topic(group_id: &str, message_type: MessageType, node_id: &str) -> String {
    format!("{}/{}/{}/{}", NAMESPACE, group_id, message_type, node_id)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadMetric {
    pub name: String,
    pub timestamp: i64,
    #[serde(rename = "dataType")]
    pub data_type: String,
    pub value: Value,
    pub unit: String,
}

impl PayloadMetric {
    fn bd_seq(bd_seq: u64, timestamp: i64) -> Self {
        Self {
            name: BD_SEQ_METRIC.to_string(),
            timestamp,
            data_type: "UInt64".to_string(),
            value: Value::from(bd_seq),
            unit: String::new(),
        }
    }
}

impl From<&Metric> for PayloadMetric {
    fn from(metric: &Metric) -> Self {
        let value = match metric.data_type {
            DataType::Bool => Value::Bool(metric.value != 0.0),
            _ => serde_json::Number::from_f64(metric.value)
                .map(Value::Number)
                .unwrap_or(Value::Null),
        };
        Self {
            name: metric.name.clone(),
            timestamp: metric.timestamp.timestamp_millis(),
            data_type: metric.data_type.sparkplug_name().to_string(),
            value,
            unit: metric.unit.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparkplugPayload {
    pub timestamp: i64,
    pub metrics: Vec<PayloadMetric>,
    /// Absent only on NDEATH.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u8>,
}

/// A payload together with where it goes.
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub topic: String,
    pub message_type: MessageType,
    /// Empty for node-level messages.
    pub device: String,
    pub payload: SparkplugPayload,
    /// Births are retained by the broker, data and death messages are not.
    pub retain: bool,
}

/// Builds envelopes with a node-wide sequence number that wraps after 255.
///
/// Every NBIRTH bumps the birth/death sequence (`bdSeq`) and restarts `seq`
/// at 0. The NDEATH carries the `bdSeq` of the last NBIRTH so a broker can
/// pair them.
#[derive(Debug, Clone)]
pub struct PayloadBuilder {
    group_id: String,
    node_id: String,
    seq: u8,
    bd_seq: u64,
}

impl PayloadBuilder {
    pub fn new(group_id: &str, node_id: &str) -> Self {
        Self {
            group_id: group_id.to_string(),
            node_id: node_id.to_string(),
            seq: 0,
            bd_seq: 0,
        }
    }

    pub fn from_config(config: &PublishConfig) -> Self {
        Self::new(&config.group_id, &config.node_id)
    }

    pub fn bd_seq(&self) -> u64 {
        self.bd_seq
    }

    fn next_seq(&mut self) -> u8 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        seq
    }

    /// Device-level DBIRTH or DDATA.
    pub fn build(
        &mut self,
        message_type: MessageType,
        device: &str,
        metrics: &[Metric],
        timestamp: DateTime<Utc>,
    ) -> Publication {
        Publication {
            topic: topic(&self.group_id, message_type, &self.node_id, device),
            message_type,
            device: device.to_string(),
            payload: SparkplugPayload {
                timestamp: timestamp.timestamp_millis(),
                metrics: metrics.iter().map(PayloadMetric::from).collect(),
                seq: Some(self.next_seq()),
            },
            retain: message_type.is_birth(),
        }
    }

    pub fn build_node_birth(&mut self, timestamp: DateTime<Utc>) -> Publication {
        self.bd_seq = self.bd_seq.wrapping_add(1);
        self.seq = 0;
        let millis = timestamp.timestamp_millis();
        let rebirth = PayloadMetric {
            name: REBIRTH_METRIC.to_string(),
            timestamp: millis,
            data_type: DataType::Bool.sparkplug_name().to_string(),
            value: Value::Bool(false),
            unit: String::new(),
        };

        Publication {
            topic: node_topic(&self.group_id, MessageType::NBirth, &self.node_id),
            message_type: MessageType::NBirth,
            device: String::new(),
            payload: SparkplugPayload {
                timestamp: millis,
                metrics: vec![PayloadMetric::bd_seq(self.bd_seq, millis), rebirth],
                seq: Some(self.next_seq()),
            },
            retain: true,
        }
    }

    /// The NDEATH matching the last NBIRTH; does not consume a sequence number.
    pub fn build_node_death(&self, timestamp: DateTime<Utc>) -> Publication {
        let millis = timestamp.timestamp_millis();
        Publication {
            topic: node_topic(&self.group_id, MessageType::NDeath, &self.node_id),
            message_type: MessageType::NDeath,
            device: String::new(),
            payload: SparkplugPayload {
                timestamp: millis,
                metrics: vec![PayloadMetric::bd_seq(self.bd_seq, millis)],
                seq: None,
            },
            retain: false,
        }
    }
}

use chrono::{TimeZone, Utc};
use serde_json::Value;

use super::payload::Publication;
use crate::utils::error::ModbusError;

pub trait DataFormatter: Send + Sync {
    fn format(&self, publication: &Publication) -> Result<String, ModbusError>;
    fn format_header(&self) -> Option<String> {
        None
    }
    fn format_type(&self) -> &str;
}

pub fn create_formatter(format: &str) -> Result<Box<dyn DataFormatter>, ModbusError> {
    match format.to_ascii_lowercase().as_str() {
        "json" => Ok(Box::new(JsonFormatter::new(false))),
        "json-pretty" => Ok(Box::new(JsonFormatter::new(true))),
        "console" => Ok(Box::new(ConsoleFormatter)),
        "csv" => Ok(Box::new(CsvFormatter)),
        other => Err(ModbusError::ConfigError(format!(
            "Unknown output format '{}' (json, json-pretty, console, csv)",
            other
        ))),
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub struct JsonFormatter {
    pretty: bool,
}

impl JsonFormatter {
    pub fn new(pretty: bool) -> Self {
        Self { pretty }
    }
}

impl DataFormatter for JsonFormatter {
    fn format(&self, publication: &Publication) -> Result<String, ModbusError> {
        let text = if self.pretty {
            serde_json::to_string_pretty(&publication.payload)?
        } else {
            serde_json::to_string(&publication.payload)?
        };
        Ok(text)
    }

    fn format_type(&self) -> &str {
        "json"
    }
}

pub struct ConsoleFormatter;

impl DataFormatter for ConsoleFormatter {
    fn format(&self, publication: &Publication) -> Result<String, ModbusError> {
        let time = Utc
            .timestamp_millis_opt(publication.payload.timestamp)
            .single()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();

        let target = if publication.device.is_empty() {
            "node"
        } else {
            publication.device.as_str()
        };
        let seq = publication
            .payload
            .seq
            .map(|seq| format!(" [seq {}]", seq))
            .unwrap_or_default();
        let mut output = format!(
            "📊 {} {}{} @ {}\n",
            publication.message_type, target, seq, time
        );
        output.push_str(&"═".repeat(60));
        output.push('\n');
        for metric in &publication.payload.metrics {
            output.push_str(&format!(
                "  {:<24} {:>12} {}\n",
                metric.name,
                value_text(&metric.value),
                metric.unit
            ));
        }
        if publication.payload.metrics.is_empty() {
            output.push_str("  (no metrics)\n");
        }
        Ok(output)
    }

    fn format_type(&self) -> &str {
        "console"
    }
}

pub struct CsvFormatter;

impl DataFormatter for CsvFormatter {
    fn format(&self, publication: &Publication) -> Result<String, ModbusError> {
        let lines: Vec<String> = publication
            .payload
            .metrics
            .iter()
            .map(|metric| {
                format!(
                    "{},{},{},{},{},{}",
                    metric.timestamp,
                    publication.device,
                    publication.payload.seq.map(|seq| seq.to_string()).unwrap_or_default(),
                    metric.name,
                    value_text(&metric.value),
                    metric.unit
                )
            })
            .collect();
        Ok(lines.join("\n"))
    }

    fn format_header(&self) -> Option<String> {
        Some("timestamp,device,seq,metric,value,unit".to_string())
    }

    fn format_type(&self) -> &str {
        "csv"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::payload::{MessageType, PayloadMetric, SparkplugPayload};

    fn publication() -> Publication {
        Publication {
            topic: "spBv1.0/g/DDATA/n/olimextemp".to_string(),
            message_type: MessageType::DData,
            device: "olimextemp".to_string(),
            payload: SparkplugPayload {
                timestamp: 1_700_000_000_000,
                metrics: vec![PayloadMetric {
                    name: "humidity".to_string(),
                    timestamp: 1_700_000_000_000,
                    data_type: "Float".to_string(),
                    value: serde_json::json!(41.0),
                    unit: "%RH".to_string(),
                }],
                seq: Some(7),
            },
            retain: false,
        }
    }

    #[test]
    fn test_json_formatter_emits_envelope() {
        let text = create_formatter("json").unwrap().format(&publication()).unwrap();
        let parsed: SparkplugPayload = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, publication().payload);
    }

    #[test]
    fn test_csv_and_console() {
        let csv = CsvFormatter;
        assert_eq!(csv.format_header().unwrap(), "timestamp,device,seq,metric,value,unit");
        assert_eq!(
            csv.format(&publication()).unwrap(),
            "1700000000000,olimextemp,7,humidity,41.0,%RH"
        );

        let console = ConsoleFormatter.format(&publication()).unwrap();
        assert!(console.contains("DDATA olimextemp [seq 7]"));
        assert!(console.contains("humidity"));
    }

    #[test]
    fn test_console_node_death_has_no_seq() {
        let death = crate::output::PayloadBuilder::new("g", "n").build_node_death(Utc::now());
        let console = ConsoleFormatter.format(&death).unwrap();
        assert!(console.starts_with("📊 NDEATH node @"));
        assert!(console.contains("bdSeq"));
    }

    #[test]
    fn test_unknown_format_rejected() {
        assert!(create_formatter("xml").is_err());
    }
}

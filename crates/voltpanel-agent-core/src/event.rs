use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::process::Pid;

/// Live notification published by the supervisor
///
/// Serialized with a `type` tag and a millisecond `ts`, the shape a socket
/// bridge forwards to the browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PanelEvent {
    /// One line of stdout or stderr output
    Log {
        #[serde(rename = "id")]
        process_id: String,
        #[serde(rename = "data")]
        text: String,
        #[serde(rename = "ts", with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },
    Started {
        #[serde(rename = "id")]
        process_id: String,
        pid: Option<Pid>,
        #[serde(rename = "ts", with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },
    Exited {
        #[serde(rename = "id")]
        process_id: String,
        code: i32,
        #[serde(rename = "ts", with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },
}

impl PanelEvent {
    pub fn log(process_id: impl Into<String>, text: impl Into<String>) -> Self {
        PanelEvent::Log {
            process_id: process_id.into(),
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn process_id(&self) -> &str {
        match self {
            PanelEvent::Log { process_id, .. }
            | PanelEvent::Started { process_id, .. }
            | PanelEvent::Exited { process_id, .. } => process_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            PanelEvent::Log { timestamp, .. }
            | PanelEvent::Started { timestamp, .. }
            | PanelEvent::Exited { timestamp, .. } => *timestamp,
        }
    }

    /// JSON text frame for a socket bridge
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_log_event_json() {
        let event = PanelEvent::Log {
            process_id: "web".to_string(),
            text: "listening on :8080".to_string(),
            timestamp: Utc.timestamp_millis_opt(1_700_000_000_123).unwrap(),
        };

        let value: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "log");
        assert_eq!(value["id"], "web");
        assert_eq!(value["data"], "listening on :8080");
        assert_eq!(value["ts"], 1_700_000_000_123i64);
    }

    #[test]
    fn test_lifecycle_event_json() {
        let event = PanelEvent::Exited {
            process_id: "job".to_string(),
            code: 3,
            timestamp: Utc.timestamp_millis_opt(5).unwrap(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "exited");
        assert_eq!(value["code"], 3);
        assert_eq!(event.process_id(), "job");

        let back: PanelEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }
}

/*!
Alert JSON builders

Produces feed records the way the detection engine writes them. Defaults
describe a high-severity port scan stamped with the current time.
*/

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone)]
pub struct AlertBuilder {
    source_ip: String,
    dest_ip: String,
    attack_id: String,
    threat_level: String,
    description: String,
    timestamp: DateTime<Utc>,
    proto: Option<String>,
    raw: Option<String>,
}

impl AlertBuilder {
    pub fn new(source_ip: &str, dest_ip: &str) -> Self {
        Self {
            source_ip: source_ip.to_string(),
            dest_ip: dest_ip.to_string(),
            attack_id: "portscan".into(),
            threat_level: "high".into(),
            description: format!("port scan from {} against {}", source_ip, dest_ip),
            timestamp: Utc::now(),
            proto: Some("tcp".into()),
            raw: None,
        }
    }

    pub fn attack(mut self, attack_id: &str) -> Self {
        self.attack_id = attack_id.to_string();
        self
    }

    pub fn threat(mut self, level: &str) -> Self {
        self.threat_level = level.to_string();
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn proto(mut self, proto: Option<&str>) -> Self {
        self.proto = proto.map(str::to_string);
        self
    }

    pub fn raw(mut self, raw: &str) -> Self {
        self.raw = Some(raw.to_string());
        self
    }

    pub fn build(&self) -> Value {
        let mut record = Map::new();
        record.insert("source_ip".into(), json!(self.source_ip));
        record.insert("dest_ip".into(), json!(self.dest_ip));
        record.insert("attack_id".into(), json!(self.attack_id));
        record.insert("threat_level".into(), json!(self.threat_level));
        record.insert("description".into(), json!(self.description));
        record.insert(
            "timestamp".into(),
            json!(self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        if let Some(proto) = &self.proto {
            record.insert("proto".into(), json!(proto));
        }
        if let Some(raw) = &self.raw {
            record.insert("raw".into(), json!(raw));
        }
        Value::Object(record)
    }

    /// Record in the legacy SLIPS shape (`sourceip`/`destip`/`attackid`)
    pub fn build_legacy(&self) -> Value {
        json!({
            "sourceip": self.source_ip,
            "destip": self.dest_ip,
            "attackid": self.attack_id,
            "threat_level": self.threat_level,
            "description": self.description,
            "timestamp": self.timestamp.timestamp(),
        })
    }

    /// Feed-control record that must not be treated as an alert
    pub fn control(note: &str) -> Value {
        json!({ "note": note, "ts": Utc::now().timestamp() })
    }
}

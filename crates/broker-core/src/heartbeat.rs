//! Heartbeat ingestion records.
//!
//! Producers report liveness as one record per line, independent of the
//! transport that carries it. Two line shapes are understood:
//!
//! - JSON heartbeats: `{"alive": true, "id": "...", "name": "...", "payload": [...]}`.
//!   The legacy field names `uuid` and `processus` are accepted as aliases.
//! - Key/value lines scoped to one connection (`name=...`, `processus=[...]`),
//!   handled by [`KeyValueProducer`].
//!
//! A process-died notification is either `notif=<text>` or `{"notif": "<text>"}`.
//! It is routed to the notification queue instead of the registry.

use crate::record::{ClientId, ClientRecord, RecordError};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Prefix of the raw process-died sentinel line.
pub const NOTIFICATION_PREFIX: &str = "notif=";

/// One liveness report from a producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub alive: bool,
    #[serde(alias = "uuid")]
    pub id: ClientId,
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "processus")]
    pub payload: Vec<String>,
}

impl HeartbeatRecord {
    /// Heartbeat announcing that `record` is alive.
    pub fn alive(record: ClientRecord) -> Self {
        Self {
            alive: true,
            id: record.id,
            name: record.display_name,
            payload: record.payload,
        }
    }

    /// Heartbeat announcing that the producer `id` has gone away.
    pub fn departed(id: ClientId) -> Self {
        Self {
            alive: false,
            id,
            name: String::new(),
            payload: Vec::new(),
        }
    }

    pub fn into_record(self) -> ClientRecord {
        ClientRecord::new(self.id, self.name, self.payload)
    }
}

/// A decoded ingestion line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestItem {
    /// Refresh or remove a registry entry
    Heartbeat(HeartbeatRecord),
    /// A watched process died; goes to the notification queue
    ProcessDied(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireRecord {
    Notification { notif: String },
    Heartbeat(HeartbeatRecord),
}

/// Decode one self-contained record line.
pub fn decode_record(line: &str) -> Result<IngestItem, RecordError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(RecordError::Malformed("empty line".to_string()));
    }

    if let Some(text) = line.strip_prefix(NOTIFICATION_PREFIX) {
        return Ok(IngestItem::ProcessDied(text.to_string()));
    }

    match serde_json::from_str::<WireRecord>(line) {
        Ok(WireRecord::Notification { notif }) => Ok(IngestItem::ProcessDied(notif)),
        Ok(WireRecord::Heartbeat(record)) => Ok(IngestItem::Heartbeat(record)),
        Err(e) => Err(RecordError::Malformed(e.to_string())),
    }
}

/// Decode a line arriving on a connection owned by `producer`.
///
/// Key/value lines update the producer's implicit record; everything else
/// is decoded as a standalone record.
pub fn decode_line(producer: &mut KeyValueProducer, line: &str) -> Result<IngestItem, RecordError> {
    let line = line.trim_end_matches(['\r', '\n']);
    match producer.apply(line) {
        Some(result) => result,
        None => decode_record(line),
    }
}

/// Implicit record for a producer that speaks the key/value line protocol.
///
/// The record is identified by an ID generated per connection. Every update
/// yields an alive heartbeat; [`farewell`](Self::farewell) yields the
/// matching not-alive heartbeat once the connection ends.
#[derive(Debug, Clone)]
pub struct KeyValueProducer {
    record: ClientRecord,
    announced: bool,
}

impl KeyValueProducer {
    pub fn new(id: ClientId) -> Self {
        Self {
            record: ClientRecord::new(id, "Unknown", Vec::new()),
            announced: false,
        }
    }

    pub fn id(&self) -> &ClientId {
        &self.record.id
    }

    /// Apply a key/value line. Returns `None` if the line is not one.
    pub fn apply(&mut self, line: &str) -> Option<Result<IngestItem, RecordError>> {
        if let Some(name) = line.strip_prefix("name=") {
            self.record.display_name = name.to_string();
            debug!("Producer {} named {}", self.record.id, name);
            return Some(Ok(self.announce()));
        }

        if let Some(list) = line.strip_prefix("processus=") {
            return Some(match serde_json::from_str::<Vec<String>>(list) {
                Ok(payload) => {
                    debug!("Producer {} reported {} entries", self.record.id, payload.len());
                    self.record.payload = payload;
                    Ok(self.announce())
                }
                Err(e) => Err(RecordError::InvalidPayload(e.to_string())),
            });
        }

        None
    }

    /// Heartbeat to apply when the connection closes.
    ///
    /// `None` if this producer never announced itself.
    pub fn farewell(&self) -> Option<IngestItem> {
        self.announced.then(|| {
            IngestItem::Heartbeat(HeartbeatRecord::departed(self.record.id.clone()))
        })
    }

    fn announce(&mut self) -> IngestItem {
        self.announced = true;
        IngestItem::Heartbeat(HeartbeatRecord::alive(self.record.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ClientId {
        ClientId::new(s).unwrap()
    }

    #[test]
    fn test_decode_json_heartbeat() {
        let line = r#"{"alive":true,"id":"A","name":"proc1","payload":["p1"]}"#;
        let item = decode_record(line).unwrap();
        assert_eq!(
            item,
            IngestItem::Heartbeat(HeartbeatRecord {
                alive: true,
                id: id("A"),
                name: "proc1".into(),
                payload: vec!["p1".into()],
            })
        );
    }

    #[test]
    fn test_decode_legacy_field_names() {
        let line = r#"{"alive":false,"name":"host","processus":["a","b"],"uuid":"550e8400-e29b-41d4-a716-446655440000"}"#;
        let IngestItem::Heartbeat(record) = decode_record(line).unwrap() else {
            panic!("expected heartbeat");
        };
        assert!(!record.alive);
        assert_eq!(record.id.as_str(), "550e8400-e29b-41d4-a716-446655440000");
        assert_eq!(record.payload, vec!["a", "b"]);
    }

    #[test]
    fn test_decode_notification_forms() {
        assert_eq!(
            decode_record("notif=backup.sh").unwrap(),
            IngestItem::ProcessDied("backup.sh".into())
        );
        assert_eq!(
            decode_record(r#"{"notif":"backup.sh"}"#).unwrap(),
            IngestItem::ProcessDied("backup.sh".into())
        );
    }

    #[test]
    fn test_decode_malformed_records() {
        assert!(matches!(decode_record("garbage"), Err(RecordError::Malformed(_))));
        assert!(matches!(decode_record("   "), Err(RecordError::Malformed(_))));
        // Missing id
        assert!(decode_record(r#"{"alive":true,"name":"x"}"#).is_err());
        // Empty id
        assert!(decode_record(r#"{"alive":true,"id":"","name":"x"}"#).is_err());
    }

    #[test]
    fn test_key_value_producer_announces_on_update() {
        let mut producer = KeyValueProducer::new(id("conn-1"));
        assert!(producer.farewell().is_none());

        let item = decode_line(&mut producer, "name=laptop\r").unwrap();
        let IngestItem::Heartbeat(record) = item else {
            panic!("expected heartbeat");
        };
        assert!(record.alive);
        assert_eq!(record.name, "laptop");
        assert!(record.payload.is_empty());

        let item = decode_line(&mut producer, r#"processus=["sshd","cron"]"#).unwrap();
        let IngestItem::Heartbeat(record) = item else {
            panic!("expected heartbeat");
        };
        assert_eq!(record.name, "laptop");
        assert_eq!(record.payload, vec!["sshd", "cron"]);

        assert_eq!(
            producer.farewell(),
            Some(IngestItem::Heartbeat(HeartbeatRecord::departed(id("conn-1"))))
        );
    }

    #[test]
    fn test_key_value_producer_rejects_bad_payload() {
        let mut producer = KeyValueProducer::new(id("conn-1"));
        let result = decode_line(&mut producer, "processus=not-a-list");
        assert!(matches!(result, Err(RecordError::InvalidPayload(_))));
        // A rejected update does not count as an announcement
        assert!(producer.farewell().is_none());
    }

    #[test]
    fn test_decode_line_falls_back_to_records() {
        let mut producer = KeyValueProducer::new(id("conn-1"));
        assert_eq!(
            decode_line(&mut producer, "notif=worker").unwrap(),
            IngestItem::ProcessDied("worker".into())
        );
        let line = r#"{"alive":true,"id":"B","name":"b","payload":[]}"#;
        assert!(matches!(
            decode_line(&mut producer, line).unwrap(),
            IngestItem::Heartbeat(_)
        ));
    }
}

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ServiceError;

// ════════════════════════════════════════════════════════════════
//  Topic / Partition
// ════════════════════════════════════════════════════════════════

/// Адрес партиции: (topic, partition). Ключ для committed offset'ов
/// и для маршрутизации записей по partition worker'ам.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self { topic: topic.into(), partition }
    }
}

impl std::fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

// ════════════════════════════════════════════════════════════════
//  Record
// ════════════════════════════════════════════════════════════════

/// Запись, доставленная consumer'у из партиционированного лога.
/// Неизменяема после доставки.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    /// Позиция записи в партиции. Монотонно растёт в пределах партиции.
    pub offset: u64,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub headers: HashMap<String, Vec<u8>>,
}

impl Record {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// Offset, который коммитится после обработки этой записи:
    /// "все записи с offset < N обработаны".
    pub fn next_offset(&self) -> u64 {
        self.offset + 1
    }

    /// Key as text, lossy. For log fields.
    pub fn key_str(&self) -> Option<String> {
        self.key.as_deref().map(|k| String::from_utf8_lossy(k).into_owned())
    }

    /// Optimistic decode of the value, see [`Payload::decode`].
    pub fn payload(&self) -> Payload {
        Payload::decode(&self.value)
    }
}

// ════════════════════════════════════════════════════════════════
//  Outbound message
// ════════════════════════════════════════════════════════════════

/// Сообщение для публикации: `{key?, value}`. Value: обычно UTF-8 JSON,
/// схема не проверяется.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    #[serde(default)]
    pub key: Option<String>,
    pub value: String,
}

impl OutboundMessage {
    pub fn new(value: impl Into<String>) -> Self {
        Self { key: None, value: value.into() }
    }

    pub fn keyed(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: Some(key.into()), value: value.into() }
    }

    /// Serialize any value to a JSON message body.
    pub fn json<T: Serialize>(key: Option<String>, value: &T) -> Result<Self, ServiceError> {
        Ok(Self { key, value: serde_json::to_string(value)? })
    }
}

// ════════════════════════════════════════════════════════════════
//  Payload: optimistic decode
// ════════════════════════════════════════════════════════════════

/// Декодированное значение записи.
///
/// Сначала пробуем JSON; при неудаче исходный текст (если UTF-8)
/// или сырые байты. Ошибка декодирования никогда не пробрасывается.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(serde_json::Value),
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    pub fn decode(bytes: &[u8]) -> Self {
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(bytes) {
            return Payload::Json(value);
        }
        match std::str::from_utf8(bytes) {
            Ok(text) => Payload::Text(text.to_string()),
            Err(_) => Payload::Binary(bytes.to_vec()),
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_json(&self) -> bool {
        matches!(self, Payload::Json(_))
    }
}

impl std::fmt::Display for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::Json(v) => write!(f, "{v}"),
            Payload::Text(s) => f.write_str(s),
            Payload::Binary(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

// ════════════════════════════════════════════════════════════════
//  Shutdown report
// ════════════════════════════════════════════════════════════════

/// Итог best-effort закрытия набора ресурсов: каждый ресурс закрывается
/// независимо, ошибки собираются, а не пробрасываются.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub closed: Vec<String>,
    pub failed: Vec<(String, ServiceError)>,
}

impl ShutdownReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, resource: impl Into<String>, result: Result<(), ServiceError>) {
        match result {
            Ok(()) => self.closed.push(resource.into()),
            Err(e) => self.failed.push((resource.into(), e)),
        }
    }

    pub fn merge(&mut self, other: ShutdownReport) {
        self.closed.extend(other.closed);
        self.failed.extend(other.failed);
    }

    pub fn attempted(&self) -> usize {
        self.closed.len() + self.failed.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_decodes_json_object() {
        let payload = Payload::decode(br#"{"n":1}"#);
        assert_eq!(payload.as_json(), Some(&serde_json::json!({"n": 1})));
    }

    #[test]
    fn test_payload_falls_back_to_text() {
        let payload = Payload::decode(b"plain text, not json");
        assert_eq!(payload, Payload::Text("plain text, not json".into()));
        assert_eq!(payload.to_string(), "plain text, not json");
    }

    #[test]
    fn test_payload_falls_back_to_binary() {
        let payload = Payload::decode(&[0xff, 0xfe, 0x00]);
        assert_eq!(payload, Payload::Binary(vec![0xff, 0xfe, 0x00]));
        assert_eq!(payload.to_string(), "<3 bytes>");
    }

    #[test]
    fn test_empty_value_is_empty_text() {
        assert_eq!(Payload::decode(b""), Payload::Text(String::new()));
    }

    #[test]
    fn test_record_next_offset() {
        let record = Record {
            topic: "demo".into(),
            partition: 2,
            offset: 41,
            key: Some(b"k1".to_vec()),
            value: b"{}".to_vec(),
            headers: HashMap::new(),
        };
        assert_eq!(record.next_offset(), 42);
        assert_eq!(record.key_str().as_deref(), Some("k1"));
        assert_eq!(record.topic_partition().to_string(), "demo[2]");
    }

    #[test]
    fn test_shutdown_report_collects_failures() {
        let mut report = ShutdownReport::new();
        report.record("publisher", Ok(()));
        report.record("consumer [g1]", Err(ServiceError::io("broken pipe")));

        let mut other = ShutdownReport::new();
        other.record("cache db 0", Ok(()));
        report.merge(other);

        assert_eq!(report.attempted(), 3);
        assert!(!report.is_clean());
        assert_eq!(report.failed[0].0, "consumer [g1]");
    }

    #[test]
    fn test_outbound_message_json() {
        let msg = OutboundMessage::json(Some("k1".into()), &serde_json::json!({"n": 1})).unwrap();
        assert_eq!(msg.value, r#"{"n":1}"#);
        assert_eq!(msg.key.as_deref(), Some("k1"));
    }
}

//! Delivery metadata: the retry-count header and broker death records.

use std::collections::BTreeMap;

use crate::failure::FailureType;

pub const RETRY_COUNT_HEADER: &str = "x-retry-count";
pub const DEATH_HEADER: &str = "x-death";
pub const REPAIR_ATTEMPTED_HEADER: &str = "x-repair-attempted";

pub type Headers = BTreeMap<String, FieldValue>;

/// Broker-agnostic header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    String(String),
    Int(i64),
    Bool(bool),
    Array(Vec<FieldValue>),
    Table(Headers),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            FieldValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

/// Current retry count carried on a delivery, 0 when absent or malformed.
pub fn retry_count(headers: &Headers) -> u32 {
    headers
        .get(RETRY_COUNT_HEADER)
        .and_then(FieldValue::as_i64)
        .map(|v| v.clamp(0, u32::MAX as i64) as u32)
        .unwrap_or(0)
}

pub fn set_retry_count(headers: &mut Headers, count: u32) {
    headers.insert(RETRY_COUNT_HEADER.to_string(), FieldValue::Int(count as i64));
}

// ============================================================================
// Death records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeathReason {
    Rejected,
    Expired,
    MaxLen,
    Other(String),
}

impl DeathReason {
    pub fn parse(s: &str) -> Self {
        match s {
            "rejected" => DeathReason::Rejected,
            "expired" => DeathReason::Expired,
            "maxlen" => DeathReason::MaxLen,
            other => DeathReason::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            DeathReason::Rejected => "rejected",
            DeathReason::Expired => "expired",
            DeathReason::MaxLen => "maxlen",
            DeathReason::Other(s) => s,
        }
    }

    pub fn failure_type(&self) -> FailureType {
        match self {
            DeathReason::Rejected => FailureType::BusinessError,
            DeathReason::Expired => FailureType::MessageExpired,
            DeathReason::MaxLen => FailureType::QueueOverflow,
            DeathReason::Other(_) => FailureType::ConsumeFailed,
        }
    }
}

/// One entry of the `x-death` array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeathRecord {
    pub reason: DeathReason,
    pub queue: String,
    pub exchange: String,
    pub routing_keys: Vec<String>,
    pub count: i64,
}

impl DeathRecord {
    /// Most recent death entry, if the delivery carries any.
    pub fn first(headers: &Headers) -> Option<Self> {
        match headers.get(DEATH_HEADER)? {
            FieldValue::Array(entries) => entries.iter().find_map(Self::from_field),
            _ => None,
        }
    }

    fn from_field(value: &FieldValue) -> Option<Self> {
        let FieldValue::Table(table) = value else {
            return None;
        };
        let text = |key: &str| table.get(key).and_then(FieldValue::as_str).unwrap_or_default().to_string();
        let routing_keys = match table.get("routing-keys") {
            Some(FieldValue::Array(keys)) => keys
                .iter()
                .filter_map(FieldValue::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        };

        Some(Self {
            reason: DeathReason::parse(&text("reason")),
            queue: text("queue"),
            exchange: text("exchange"),
            routing_keys,
            count: table.get("count").and_then(FieldValue::as_i64).unwrap_or(1),
        })
    }

    pub fn to_field(&self) -> FieldValue {
        let mut table = Headers::new();
        table.insert("reason".into(), self.reason.as_str().into());
        table.insert("queue".into(), self.queue.clone().into());
        table.insert("exchange".into(), self.exchange.clone().into());
        table.insert(
            "routing-keys".into(),
            FieldValue::Array(self.routing_keys.iter().map(|k| k.clone().into()).collect()),
        );
        table.insert("count".into(), FieldValue::Int(self.count));
        FieldValue::Table(table)
    }
}

/// Record a death the way the broker does: an existing entry for the same
/// queue and reason has its count bumped and moves to the front, otherwise a
/// new entry is prepended.
pub fn record_death(headers: &mut Headers, mut death: DeathRecord) {
    let mut entries: Vec<DeathRecord> = match headers.get(DEATH_HEADER) {
        Some(FieldValue::Array(values)) => values.iter().filter_map(DeathRecord::from_field).collect(),
        _ => Vec::new(),
    };

    if let Some(pos) = entries
        .iter()
        .position(|e| e.queue == death.queue && e.reason == death.reason)
    {
        let existing = entries.remove(pos);
        death.count = existing.count + 1;
    } else {
        death.count = 1;
    }
    entries.insert(0, death);

    headers.insert(
        DEATH_HEADER.to_string(),
        FieldValue::Array(entries.iter().map(DeathRecord::to_field).collect()),
    );
}

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle tag of a round. The relay only ever emits settled rounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundStatus {
    #[default]
    Settled,
}

/// Canonical record of one upstream round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Monotonic round ID; the dedup key.
    pub id: i64,
    /// Round outcome (e.g. the crash multiplier).
    #[serde(serialize_with = "rust_decimal::serde::float::serialize")]
    pub value: Decimal,
    #[serde(default)]
    pub status: RoundStatus,
    /// Opaque provenance data such as a verification hash.
    #[serde(default)]
    pub auxiliary: Option<String>,
}

/// One element of the upstream `list`, before normalization.
///
/// Fields are kept as raw JSON so a single bad field degrades to a default
/// instead of failing the whole batch.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawRound {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub multiplier: Value,
    #[serde(default)]
    pub hash: Value,
}

/// The single upstream payload shape accepted: `{ "data": { "list": [...] } }`.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamEnvelope {
    pub data: UpstreamPage,
}

/// Elements stay untyped here so one non-object entry cannot sink the batch.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamPage {
    pub list: Vec<Value>,
}

impl From<Value> for RawRound {
    /// Objects keep whatever fields they carry; anything else becomes an all-default round.
    fn from(value: Value) -> Self {
        match value {
            Value::Object(_) => serde_json::from_value(value).unwrap_or_default(),
            _ => Self::default(),
        }
    }
}

/// Pagination body sent upstream on every poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageParams {
    pub page: u32,
    pub page_size: u32,
}

impl Default for PageParams {
    fn default() -> Self {
        Self {
            page: crate::UPSTREAM_PAGE,
            page_size: crate::UPSTREAM_PAGE_SIZE,
        }
    }
}

/// Message pushed to a subscriber channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Full history snapshot, newest-first; sent once right after subscribing.
    History(Vec<EventRecord>),
    /// One newly settled round.
    Crash(EventRecord),
}

/// Body of `POST /internal/update-auth`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthUpdateRequest {
    pub cookie: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn record_serializes_value_as_number() {
        let record = EventRecord {
            id: 7,
            value: dec!(2.10),
            status: RoundStatus::Settled,
            auxiliary: Some("abc".into()),
        };
        let v = serde_json::to_value(&record).unwrap();
        assert_eq!(v, json!({"id": 7, "value": 2.1, "status": "settled", "auxiliary": "abc"}));
    }

    #[test]
    fn record_reads_back_what_it_writes() {
        let record = EventRecord {
            id: 9,
            value: dec!(13.37),
            status: RoundStatus::Settled,
            auxiliary: None,
        };
        let text = serde_json::to_string(&record).unwrap();
        let back: EventRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn server_message_is_type_tagged() {
        let msg = ServerMessage::History(vec![]);
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "history", "data": []})
        );
        let msg = ServerMessage::Crash(EventRecord {
            id: 1,
            value: dec!(1.5),
            status: RoundStatus::Settled,
            auxiliary: None,
        });
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "crash");
        assert_eq!(v["data"]["id"], 1);
    }

    #[test]
    fn page_params_use_camel_case() {
        let v = serde_json::to_value(PageParams { page: 1, page_size: 20 }).unwrap();
        assert_eq!(v, json!({"page": 1, "pageSize": 20}));
    }

    #[test]
    fn non_object_element_becomes_default_round() {
        for v in [json!(null), json!("x"), json!(7), json!([1, 2])] {
            let raw = RawRound::from(v);
            assert!(raw.id.is_null());
            assert!(raw.multiplier.is_null());
        }
        let raw = RawRound::from(json!({"id": 4, "multiplier": 1.5}));
        assert_eq!(raw.id, json!(4));
    }

    #[test]
    fn raw_round_tolerates_missing_fields() {
        let raw: RawRound = serde_json::from_value(json!({"id": 3})).unwrap();
        assert_eq!(raw.id, json!(3));
        assert!(raw.multiplier.is_null());
        assert!(raw.hash.is_null());
    }
}

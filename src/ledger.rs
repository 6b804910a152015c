use std::collections::VecDeque;
use std::str::FromStr;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{debug, error};

use crate::keys;
use crate::store::Store;
use crate::types::{EventRecord, RawRound, RoundStatus};

/// Value substituted when an upstream multiplier cannot be parsed.
pub const DEFAULT_VALUE: Decimal = Decimal::ONE;

/// Bounded rolling history of settled rounds plus the dedup cursor.
///
/// Records are kept newest-first with strictly decreasing IDs. The cursor is
/// tracked separately so dedup stays correct after old records are evicted.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryLedger {
    records: VecDeque<EventRecord>,
    last_seen_id: i64,
    capacity: usize,
}

impl HistoryLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity),
            last_seen_id: 0,
            capacity,
        }
    }

    pub fn last_seen_id(&self) -> i64 {
        self.last_seen_id
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Newest-first copy of the retained records.
    pub fn snapshot(&self) -> Vec<EventRecord> {
        self.records.iter().cloned().collect()
    }

    /// Ingest one upstream batch (delivered newest-first).
    ///
    /// Returns the records that were new, oldest to newest, which is the
    /// order they must be broadcast in. Records at or below the cursor are
    /// dropped, so replaying a batch is a no-op.
    pub fn ingest(&mut self, batch: &[RawRound]) -> Vec<EventRecord> {
        let mut fresh = Vec::new();
        for raw in batch.iter().rev() {
            let record = normalize(raw);
            if record.id <= self.last_seen_id {
                continue;
            }
            self.last_seen_id = record.id;
            self.records.push_front(record.clone());
            fresh.push(record);
        }
        self.records.truncate(self.capacity);
        fresh
    }

    /// Drop every record and rewind the cursor.
    pub fn clear(&mut self) {
        self.records.clear();
        self.last_seen_id = 0;
    }

    /// Write history and cursor to the store in one logical write.
    pub fn persist(&self, store: &mut dyn Store) -> Result<()> {
        let history = serde_json::to_string(&self.records).context("serialize history")?;
        store.put_many(&[
            (keys::HISTORY, history),
            (keys::LAST_ID, self.last_seen_id.to_string()),
        ])
    }

    /// Rebuild a ledger from whatever the store holds; empty if nothing is stored.
    ///
    /// Only store I/O errors are returned. Unreadable contents are logged and
    /// dropped: a corrupt history starts empty, and a corrupt cursor falls
    /// back to the newest restored ID.
    pub fn restore(store: &dyn Store, capacity: usize) -> Result<Self> {
        let mut ledger = Self::new(capacity);
        if let Some(history) = store.get(keys::HISTORY)? {
            match serde_json::from_str::<Vec<EventRecord>>(&history) {
                Ok(mut records) => {
                    // Re-establish the ordering invariant in case the store was edited by hand.
                    records.sort_by(|a, b| b.id.cmp(&a.id));
                    records.dedup_by_key(|r| r.id);
                    records.truncate(capacity);
                    ledger.records = records.into();
                }
                Err(e) => error!("Discarding unreadable stored history: {e}"),
            }
        }
        let newest = ledger.records.front().map(|r| r.id).unwrap_or(0);
        let stored_cursor = match store.get(keys::LAST_ID)? {
            Some(raw) => raw.trim().parse::<i64>().unwrap_or_else(|e| {
                error!("Unreadable stored cursor {raw:?} ({e}), resuming from {newest}");
                newest
            }),
            None => 0,
        };
        ledger.last_seen_id = stored_cursor.max(newest);
        Ok(ledger)
    }
}

/// Best-effort conversion of one upstream element into a canonical record.
///
/// Unparseable IDs become 0, which the cursor always rejects; unparseable
/// values become `DEFAULT_VALUE`.
pub fn normalize(raw: &RawRound) -> EventRecord {
    let id = parse_id(&raw.id).unwrap_or_else(|| {
        debug!("Round with unusable id {}, defaulting to 0", raw.id);
        0
    });
    let value = parse_value(&raw.multiplier).unwrap_or_else(|| {
        debug!(id, "Round with unusable multiplier {}, defaulting", raw.multiplier);
        DEFAULT_VALUE
    });
    let auxiliary = match &raw.hash {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Null | Value::String(_) => None,
        other => Some(other.to_string()),
    };
    EventRecord {
        id,
        value,
        status: RoundStatus::Settled,
        auxiliary,
    }
}

fn parse_id(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(integral)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Whole-number floats such as `5.0` are valid IDs.
fn integral(f: f64) -> Option<i64> {
    (f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64).then_some(f as i64)
}

fn parse_value(v: &Value) -> Option<Decimal> {
    let parsed = match v {
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .ok(),
        Value::String(s) => Decimal::from_str(s.trim().trim_end_matches(['x', 'X'])).ok(),
        _ => None,
    }?;
    (parsed > Decimal::ZERO).then_some(parsed)
}

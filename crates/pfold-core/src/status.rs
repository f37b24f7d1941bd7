//! Advisory status telemetry published by the stream writer.
//!
//! Nothing in the pipeline reads these values back; a failed update is
//! silently ignored.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

/// Writer state: `init`, `waiting`, `writing` or `exiting`.
pub const DISKSTAT: &str = "DISKSTAT";
/// Ring slot currently held by the writer.
pub const CURBLOCK: &str = "CURBLOCK";
/// FILLED slots observed when the current slot was acquired.
pub const NFILLED: &str = "NFILLED";
/// Dropped-packet fraction of the current block, percent.
pub const DROPPCT: &str = "DROPPCT";

pub trait StatusSink: Send + Sync {
    fn set_text(&self, key: &str, value: &str);
    fn set_int(&self, key: &str, value: i64);
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum StatusValue {
    Text(String),
    Int(i64),
}

/// In-process key/value board; clones share the same map.
#[derive(Clone, Debug, Default)]
pub struct StatusBoard {
    values: Arc<Mutex<BTreeMap<String, StatusValue>>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<StatusValue> {
        self.values.lock().ok()?.get(key).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, StatusValue> {
        self.values.lock().map(|m| m.clone()).unwrap_or_default()
    }

    fn set(&self, key: &str, value: StatusValue) {
        if let Ok(mut map) = self.values.lock() {
            map.insert(key.to_string(), value);
        }
    }
}

impl StatusSink for StatusBoard {
    fn set_text(&self, key: &str, value: &str) {
        self.set(key, StatusValue::Text(value.to_string()));
    }

    fn set_int(&self, key: &str, value: i64) {
        self.set(key, StatusValue::Int(value));
    }
}

/// Discards every update.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullStatus;

impl StatusSink for NullStatus {
    fn set_text(&self, _key: &str, _value: &str) {}
    fn set_int(&self, _key: &str, _value: i64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_board_overwrites_and_snapshots() {
        let board = StatusBoard::new();
        board.set_text(DISKSTAT, "waiting");
        board.set_int(CURBLOCK, 3);
        board.set_text(DISKSTAT, "writing");
        assert_eq!(board.get(DISKSTAT), Some(StatusValue::Text("writing".into())));
        let snap = board.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[CURBLOCK], StatusValue::Int(3));
    }

    #[test]
    fn test_snapshot_serializes_flat() {
        let board = StatusBoard::new();
        board.set_int(DROPPCT, 0);
        let json = serde_json::to_string(&board.snapshot()).unwrap();
        assert_eq!(json, r#"{"DROPPCT":0}"#);
    }
}

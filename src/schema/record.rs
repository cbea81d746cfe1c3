use serde::Deserialize;
use thiserror::Error;

/// One raw line of a daily order-book archive:
/// `{"ts":...,"cts":...,"type":"snapshot","data":{"u":...,"seq":...,"b":[...],"a":[...]}}`
#[derive(Debug, Deserialize)]
struct RawMessage {
    ts: i64,
    cts: i64,
    #[serde(rename = "type")]
    kind: String,
    data: RawDepth,
}

#[derive(Debug, Deserialize)]
struct RawDepth {
    u: i64,
    seq: i64,
    // Deltas omit a side when it has no changes.
    #[serde(default, rename = "b")]
    bids: Vec<[String; 2]>,
    #[serde(default, rename = "a")]
    asks: Vec<[String; 2]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Snapshot,
    Delta,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Snapshot => "snapshot",
            RecordType::Delta => "delta",
        }
    }
}

/// Normalized row in the fixed 7-column output schema. Bid/ask levels are kept
/// as JSON-encoded `[price, qty]` string pairs in source order.
#[derive(Debug, Clone)]
pub struct OrderBookRecord {
    pub ts: i64,
    pub cts: i64,
    pub kind: RecordType,
    pub u: i64,
    pub seq: i64,
    pub bids: String,
    pub asks: String,
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown record type {0:?}")]
    UnknownType(String),
}

/// Map one raw archive line to an [`OrderBookRecord`]. All seven output fields
/// must be present and well typed; level arrays are never sorted or deduplicated.
pub fn normalize_line(line: &str) -> Result<OrderBookRecord, SchemaError> {
    let raw: RawMessage = serde_json::from_str(line)?;
    let kind = match raw.kind.as_str() {
        "snapshot" => RecordType::Snapshot,
        "delta" => RecordType::Delta,
        other => return Err(SchemaError::UnknownType(other.to_string())),
    };
    Ok(OrderBookRecord {
        ts: raw.ts,
        cts: raw.cts,
        kind,
        u: raw.data.u,
        seq: raw.data.seq,
        bids: serde_json::to_string(&raw.data.bids)?,
        asks: serde_json::to_string(&raw.data.asks)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SNAPSHOT: &str = r#"{"ts":1714521600123,"cts":1714521600100,"type":"snapshot","data":{"u":7,"seq":100,"b":[["65000.1","0.5"],["65000.0","1.2"]],"a":[["65000.2","0.3"]]}}"#;

    #[test]
    fn snapshot_line_normalizes() {
        let rec = normalize_line(SNAPSHOT).unwrap();
        assert_eq!(rec.ts, 1714521600123);
        assert_eq!(rec.cts, 1714521600100);
        assert_eq!(rec.kind, RecordType::Snapshot);
        assert_eq!(rec.u, 7);
        assert_eq!(rec.seq, 100);
        // Source order preserved, no sorting.
        assert_eq!(rec.bids, r#"[["65000.1","0.5"],["65000.0","1.2"]]"#);
        assert_eq!(rec.asks, r#"[["65000.2","0.3"]]"#);
    }

    #[test]
    fn delta_may_omit_one_side() {
        let line = r#"{"ts":1,"cts":2,"type":"delta","data":{"u":8,"seq":101,"b":[["65000.1","0"]]}}"#;
        let rec = normalize_line(line).unwrap();
        assert_eq!(rec.kind, RecordType::Delta);
        assert_eq!(rec.asks, "[]");
    }

    #[test]
    fn missing_field_is_rejected() {
        let line = r#"{"ts":1,"type":"delta","data":{"u":8,"seq":101}}"#;
        assert!(matches!(
            normalize_line(line),
            Err(SchemaError::Malformed(_))
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let line = r#"{"ts":1,"cts":2,"type":"diff","data":{"u":8,"seq":101}}"#;
        assert!(matches!(
            normalize_line(line),
            Err(SchemaError::UnknownType(t)) if t == "diff"
        ));
    }

    #[test]
    fn garbage_line_is_rejected() {
        assert!(normalize_line("not json").is_err());
        assert!(normalize_line("").is_err());
    }
}

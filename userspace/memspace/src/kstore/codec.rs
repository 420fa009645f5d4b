// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Framed record format of kernel-store values.
//!
//! Layout: `magic (u32 LE) | payload len (u32 LE) | crc32(payload) (u32 LE) | payload`,
//! where the payload is the JSON text of the value.

use serde_json::Value;

use crate::error::KstoreError;

/// Record magic, "NXKM".
pub const RECORD_MAGIC: u32 = 0x4E58_4B4D;
/// Bytes preceding the payload.
pub const RECORD_HEADER_LEN: usize = 12;

/// Frames `value` into a record.
pub fn encode(value: &Value) -> Result<Vec<u8>, KstoreError> {
    let payload = serde_json::to_vec(value).map_err(|err| KstoreError::Serialization(err.to_string()))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| KstoreError::Serialization(format!("payload of {} bytes too large", payload.len())))?;
    let mut record = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
    record.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
    record.extend_from_slice(&len.to_le_bytes());
    record.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    record.extend_from_slice(&payload);
    Ok(record)
}

/// Validates and parses a record read back from the heap.
///
/// Trailing bytes after the payload are ignored; they are slack of a range
/// that was reused for a shorter value.
pub fn decode(bytes: &[u8]) -> Result<Value, KstoreError> {
    if bytes.len() < RECORD_HEADER_LEN {
        return Err(KstoreError::Serialization(format!("record truncated at {} bytes", bytes.len())));
    }
    let word = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
    if word(0) != RECORD_MAGIC {
        return Err(KstoreError::Serialization(format!("bad record magic {:#010x}", word(0))));
    }
    let len = word(4) as usize;
    let payload = bytes
        .get(RECORD_HEADER_LEN..RECORD_HEADER_LEN + len)
        .ok_or_else(|| KstoreError::Serialization(format!("payload of {len} bytes exceeds record")))?;
    if crc32fast::hash(payload) != word(8) {
        return Err(KstoreError::Serialization("record checksum mismatch".into()));
    }
    parse_payload(payload)
}

fn parse_payload(payload: &[u8]) -> Result<Value, KstoreError> {
    let cleaned: Vec<u8> = payload.iter().copied().filter(|b| *b != 0).collect();
    let text = std::str::from_utf8(&cleaned).map_err(|err| KstoreError::Serialization(err.to_string()))?;
    match serde_json::from_str(text) {
        Ok(value) => Ok(value),
        Err(err) => coerce_literal(text.trim()).ok_or_else(|| KstoreError::Serialization(err.to_string())),
    }
}

fn coerce_literal(text: &str) -> Option<Value> {
    match text {
        "true" | "True" | "TRUE" => return Some(Value::Bool(true)),
        "false" | "False" | "FALSE" => return Some(Value::Bool(false)),
        _ => {}
    }
    if let Ok(int) = text.parse::<i64>() {
        return Some(Value::from(int));
    }
    text.parse::<f64>().ok().and_then(serde_json::Number::from_f64).map(Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut record = RECORD_MAGIC.to_le_bytes().to_vec();
        record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        record.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
        record.extend_from_slice(payload);
        record
    }

    #[test]
    fn header_layout() {
        let record = encode(&json!(true)).unwrap();
        assert_eq!(&record[..4], &RECORD_MAGIC.to_le_bytes());
        assert_eq!(&record[4..8], &4u32.to_le_bytes());
        assert_eq!(&record[RECORD_HEADER_LEN..], b"true");
    }

    #[test]
    fn trailing_slack_is_ignored() {
        let mut record = encode(&json!({"a": 1})).unwrap();
        record.extend_from_slice(&[0u8; 9]);
        assert_eq!(decode(&record).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn corruption_is_detected() {
        let mut record = encode(&json!("value")).unwrap();
        let last = record.len() - 1;
        record[last] ^= 0x20;
        assert!(matches!(decode(&record), Err(KstoreError::Serialization(_))));

        let mut record = encode(&json!(1)).unwrap();
        record[0] = 0;
        assert!(decode(&record).is_err());
        assert!(decode(&[0u8; 4]).is_err());
        // Zeroed cells never decode.
        assert!(decode(&[0u8; 32]).is_err());
    }

    #[test]
    fn length_past_end_is_rejected() {
        let mut record = encode(&json!([1, 2, 3])).unwrap();
        record.truncate(record.len() - 2);
        assert!(decode(&record).is_err());
    }

    #[test]
    fn nul_markers_are_stripped() {
        assert_eq!(decode(&frame(b"{\"k\":\0 7}")).unwrap(), json!({"k": 7}));
    }

    #[test]
    fn literals_fall_back_to_coercion() {
        assert_eq!(decode(&frame(b"True")).unwrap(), json!(true));
        assert_eq!(decode(&frame(b" 0042 ")).unwrap(), json!(42));
        assert_eq!(decode(&frame(b"+1.5")).unwrap(), json!(1.5));
        assert!(decode(&frame(b"not json")).is_err());
    }
}

//! KNOCK stage: structural checks on the raw body before any field is read.
//!
//! Checks:
//! 1. Body size ≤ MAX_BODY_BYTES (16 KiB)
//! 2. Valid UTF-8
//! 3. Parses as JSON with a top-level object
//! 4. Nesting depth ≤ MAX_DEPTH

use serde_json::Value;

pub const MAX_BODY_BYTES: usize = 16_384;
pub const MAX_DEPTH: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KnockError {
    #[error("KNOCK-001: body too large ({0} bytes, max {MAX_BODY_BYTES})")]
    BodyTooLarge(usize),
    #[error("KNOCK-002: nesting depth exceeds {MAX_DEPTH}")]
    DepthExceeded,
    #[error("KNOCK-003: invalid UTF-8 in body")]
    InvalidUtf8,
    #[error("KNOCK-004: body is not valid JSON")]
    MalformedJson,
    #[error("KNOCK-005: body is not a JSON object")]
    NotObject,
}

/// Validate raw bytes before JSON parsing.
pub fn knock_raw(bytes: &[u8]) -> Result<(), KnockError> {
    if bytes.len() > MAX_BODY_BYTES {
        return Err(KnockError::BodyTooLarge(bytes.len()));
    }
    if std::str::from_utf8(bytes).is_err() {
        return Err(KnockError::InvalidUtf8);
    }
    Ok(())
}

/// Full KNOCK: raw bytes → parse → structural validation.
/// Returns the parsed Value on success.
pub fn knock(bytes: &[u8]) -> Result<Value, KnockError> {
    knock_raw(bytes)?;
    let value: Value = serde_json::from_slice(bytes).map_err(|_| KnockError::MalformedJson)?;
    if !value.is_object() {
        return Err(KnockError::NotObject);
    }
    check_depth(&value, 0)?;
    Ok(value)
}

fn check_depth(value: &Value, depth: usize) -> Result<(), KnockError> {
    if depth > MAX_DEPTH {
        return Err(KnockError::DepthExceeded);
    }
    match value {
        Value::Object(map) => {
            for v in map.values() {
                check_depth(v, depth + 1)?;
            }
        }
        Value::Array(arr) => {
            for v in arr {
                check_depth(v, depth + 1)?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_flat_object() {
        let v = knock(br#"{"hardware":"rtx 4080","speed_factor":2.5}"#).unwrap();
        assert_eq!(v["hardware"], "rtx 4080");
    }

    #[test]
    fn rejects_oversized_body() {
        let body = vec![b' '; MAX_BODY_BYTES + 1];
        assert_eq!(knock(&body), Err(KnockError::BodyTooLarge(MAX_BODY_BYTES + 1)));
    }

    #[test]
    fn rejects_invalid_utf8() {
        assert_eq!(knock(&[b'{', 0xff, b'}']), Err(KnockError::InvalidUtf8));
    }

    #[test]
    fn rejects_non_objects() {
        assert_eq!(knock(b"[1,2,3]"), Err(KnockError::NotObject));
        assert_eq!(knock(b"\"hi\""), Err(KnockError::NotObject));
        assert_eq!(knock(b"{not json"), Err(KnockError::MalformedJson));
    }

    #[test]
    fn depth_limit() {
        assert!(knock(br#"{"a":{"b":{"c":{"d":1}}}}"#).is_ok());
        assert_eq!(
            knock(br#"{"a":{"b":{"c":{"d":{"e":1}}}}}"#),
            Err(KnockError::DepthExceeded)
        );
    }
}

//! Opaque pagination cursors.
//!
//! A cursor encodes an item id and an optional millisecond timestamp as
//! URL-safe base64 so list endpoints can resume without exposing internal
//! ordering. The encoding is `id` or `id:millis`, base64url without
//! padding.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};

use crate::error::CoreError;

/// Decoded cursor contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    /// The id of the last item the caller saw.
    pub id: String,
    /// Position timestamp, when the listing is time-ordered.
    pub ts: Option<DateTime<Utc>>,
}

/// Encode a cursor from an id and an optional timestamp.
pub fn create_cursor(id: &str, ts: Option<DateTime<Utc>>) -> String {
    let raw = match ts {
        Some(ts) => format!("{}:{}", id, ts.timestamp_millis()),
        None => id.to_string(),
    };
    URL_SAFE_NO_PAD.encode(raw.as_bytes())
}

/// Decode a cursor produced by [`create_cursor`].
///
/// Ids may themselves contain `:`; only the final segment is treated as a
/// timestamp, and only when it parses as an integer.
pub fn parse_cursor(cursor: &str) -> Result<Cursor, CoreError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor.as_bytes())
        .map_err(|_| CoreError::MalformedInput("cursor is not valid base64".into()))?;
    let raw = String::from_utf8(bytes)
        .map_err(|_| CoreError::MalformedInput("cursor is not valid UTF-8".into()))?;
    if raw.is_empty() {
        return Err(CoreError::MalformedInput("cursor is empty".into()));
    }

    match raw.rsplit_once(':') {
        Some((id, millis)) if !id.is_empty() => {
            if let Ok(ms) = millis.parse::<i64>() {
                let ts = Utc
                    .timestamp_millis_opt(ms)
                    .single()
                    .ok_or_else(|| {
                        CoreError::MalformedInput("cursor timestamp out of range".into())
                    })?;
                Ok(Cursor {
                    id: id.to_string(),
                    ts: Some(ts),
                })
            } else {
                Ok(Cursor { id: raw, ts: None })
            }
        }
        _ => Ok(Cursor { id: raw, ts: None }),
    }
}

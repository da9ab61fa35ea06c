//! Progress and custom-field JSON codec.
//!
//! All legacy encodings are handled here, at the deserialization boundary:
//! rows may hold a JSON array, a JSON string wrapping that array (written by
//! older clients), or garbage. Decoding never fails; corruption costs the
//! affected instance its history, nothing more.

use serde_json::{Map, Value};
use tracing::warn;

use crate::types::StageProgress;

/// Decode a persisted progress column.
///
/// Absent, blank and `null` columns decode to an empty list. Elements that
/// do not decode as a progress entry are dropped individually.
pub fn decode_progress(raw: Option<&str>) -> Vec<StageProgress> {
    let Some(value) = normalize(raw) else {
        return Vec::new();
    };

    let Value::Array(items) = value else {
        warn!("Progress column is not a JSON array, starting from empty");
        return Vec::new();
    };

    let total = items.len();
    let entries: Vec<StageProgress> = items
        .into_iter()
        .filter_map(|item| match serde_json::from_value(item) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "Dropping undecodable progress entry");
                None
            }
        })
        .collect();

    if entries.len() < total {
        warn!(
            kept = entries.len(),
            dropped = total - entries.len(),
            "Progress column partially decoded"
        );
    }
    entries
}

pub fn encode_progress(progress: &[StageProgress]) -> Value {
    Value::Array(
        progress
            .iter()
            .filter_map(|p| serde_json::to_value(p).ok())
            .collect(),
    )
}

/// Decode a persisted custom-fields column. Anything but an object yields an
/// empty map.
pub fn decode_custom_fields(raw: Option<&str>) -> Map<String, Value> {
    match normalize(raw) {
        Some(Value::Object(map)) => map,
        Some(_) => {
            warn!("Custom fields column is not a JSON object, starting from empty");
            Map::new()
        }
        None => Map::new(),
    }
}

pub fn encode_custom_fields(fields: &Map<String, Value>) -> String {
    Value::Object(fields.clone()).to_string()
}

/// Parse the column text, unwrapping one layer of string encoding.
fn normalize(raw: Option<&str>) -> Option<Value> {
    let raw = raw.map(str::trim).filter(|s| !s.is_empty())?;

    let value = match serde_json::from_str::<Value>(raw) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "Undecodable JSON column, starting from empty");
            return None;
        }
    };

    match value {
        Value::Null => None,
        Value::String(inner) => match serde_json::from_str::<Value>(&inner) {
            Ok(Value::Null) => None,
            Ok(v) => Some(v),
            Err(e) => {
                warn!(error = %e, "Double-encoded JSON column did not decode, starting from empty");
                None
            }
        },
        other => Some(other),
    }
}

/// Field deserializers that accept the loose shapes found in older rows:
/// ids as strings, nulls where a default is meant, naive timestamps.
pub(crate) mod lenient {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    use crate::types::StageStatus;

    pub fn value_to_i64(value: &Value) -> Option<i64> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn value_to_string(value: &Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn i64<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        let value = Value::deserialize(d)?;
        Ok(value_to_i64(&value).unwrap_or_default())
    }

    pub fn opt_i64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
        let value = Value::deserialize(d)?;
        Ok(value_to_i64(&value))
    }

    pub fn i32<'de, D: Deserializer<'de>>(d: D) -> Result<i32, D::Error> {
        let value = Value::deserialize(d)?;
        Ok(value_to_i64(&value)
            .and_then(|n| n.try_into().ok())
            .unwrap_or_default())
    }

    pub fn bool<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        let value = Value::deserialize(d)?;
        Ok(match value {
            Value::Bool(b) => b,
            Value::String(s) => s.eq_ignore_ascii_case("true"),
            Value::Number(n) => n.as_i64() == Some(1),
            _ => false,
        })
    }

    pub fn string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        let value = Value::deserialize(d)?;
        Ok(value_to_string(&value).unwrap_or_default())
    }

    pub fn opt_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        let value = Value::deserialize(d)?;
        Ok(value_to_string(&value))
    }

    pub fn status<'de, D: Deserializer<'de>>(d: D) -> Result<StageStatus, D::Error> {
        let value = Value::deserialize(d)?;
        Ok(match value {
            Value::String(s) => StageStatus::from(s),
            _ => StageStatus::Pending,
        })
    }

    pub fn datetime<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        let value = Value::deserialize(d)?;
        let Value::String(s) = value else {
            return Ok(None);
        };
        Ok(parse_datetime(&s))
    }

    pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
        let s = s.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
            .ok()
            .map(|naive| naive.and_utc())
    }
}

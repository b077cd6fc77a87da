//! Durable store file format.
//!
//! A JSON array with one object per persistent entry, sorted by name:
//!
//! ```text
//! [
//!   {"name": "/datatable/test", "type": "double", "value": 10.0,
//!    "properties": {"persistent": true}}
//! ]
//! ```
//!
//! Unknown fields are ignored. Any record that cannot be read rejects the
//! whole file.

use crate::error::{Error, Result};
use crate::store::{EntryFlags, Value, ValueType};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// One entry as stored on disk
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedEntry {
    pub name: String,
    pub value: Value,
    pub flags: EntryFlags,
}

#[derive(Serialize, Deserialize)]
struct Record {
    name: String,
    #[serde(rename = "type")]
    value_type: String,
    value: Json,
    #[serde(default)]
    properties: Properties,
}

#[derive(Serialize, Deserialize, Default)]
struct Properties {
    #[serde(default)]
    persistent: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    retained: bool,
}

pub fn encode(entries: &[PersistedEntry]) -> Result<String> {
    let records: Vec<Record> = entries
        .iter()
        .map(|entry| Record {
            name: entry.name.clone(),
            value_type: entry.value.value_type().name().to_string(),
            value: value_to_json(&entry.value),
            properties: Properties {
                persistent: true,
                retained: entry.flags.contains(EntryFlags::RETAINED),
            },
        })
        .collect();

    serde_json::to_string_pretty(&records).map_err(|e| Error::Persistence(e.to_string()))
}

pub fn decode(text: &str) -> Result<Vec<PersistedEntry>> {
    let records: Vec<Record> =
        serde_json::from_str(text).map_err(|e| Error::CorruptState(e.to_string()))?;

    records
        .into_iter()
        .map(|record| {
            let value_type = ValueType::from_name(&record.value_type).ok_or_else(|| {
                Error::CorruptState(format!(
                    "entry '{}' has unknown type '{}'",
                    record.name, record.value_type
                ))
            })?;
            let value = value_from_json(value_type, record.value).ok_or_else(|| {
                Error::CorruptState(format!(
                    "entry '{}' value does not match type '{}'",
                    record.name, value_type
                ))
            })?;

            let mut flags = EntryFlags::PERSISTENT;
            if record.properties.retained {
                flags |= EntryFlags::RETAINED;
            }

            Ok(PersistedEntry {
                name: record.name,
                value,
                flags,
            })
        })
        .collect()
}

fn double_to_json(d: f64) -> Json {
    if d.is_finite() {
        Json::from(d)
    } else if d.is_nan() {
        Json::from("NaN")
    } else if d > 0.0 {
        Json::from("Infinity")
    } else {
        Json::from("-Infinity")
    }
}

fn double_from_json(json: &Json) -> Option<f64> {
    match json {
        Json::Number(n) => n.as_f64(),
        Json::String(s) => match s.as_str() {
            "NaN" => Some(f64::NAN),
            "Infinity" => Some(f64::INFINITY),
            "-Infinity" => Some(f64::NEG_INFINITY),
            _ => None,
        },
        _ => None,
    }
}

fn value_to_json(value: &Value) -> Json {
    match value {
        Value::Boolean(b) => Json::from(*b),
        Value::Double(d) => double_to_json(*d),
        Value::String(s) => Json::from(s.as_str()),
        Value::Raw(bytes) => Json::from(bytes.to_vec()),
        Value::BooleanArray(items) => Json::from(items.clone()),
        Value::DoubleArray(items) => Json::Array(items.iter().map(|d| double_to_json(*d)).collect()),
        Value::StringArray(items) => Json::from(items.clone()),
    }
}

fn value_from_json(value_type: ValueType, json: Json) -> Option<Value> {
    let value = match (value_type, json) {
        (ValueType::Boolean, Json::Bool(b)) => Value::Boolean(b),
        (ValueType::Double, json) => Value::Double(double_from_json(&json)?),
        (ValueType::String, Json::String(s)) => Value::String(s),
        (ValueType::Raw, Json::Array(items)) => {
            let bytes = items
                .iter()
                .map(|item| item.as_u64().and_then(|b| u8::try_from(b).ok()))
                .collect::<Option<Vec<u8>>>()?;
            Value::Raw(Bytes::from(bytes))
        }
        (ValueType::BooleanArray, Json::Array(items)) => Value::BooleanArray(
            items
                .iter()
                .map(Json::as_bool)
                .collect::<Option<Vec<bool>>>()?,
        ),
        (ValueType::DoubleArray, Json::Array(items)) => Value::DoubleArray(
            items
                .iter()
                .map(double_from_json)
                .collect::<Option<Vec<f64>>>()?,
        ),
        (ValueType::StringArray, Json::Array(items)) => Value::StringArray(
            items
                .into_iter()
                .map(|item| match item {
                    Json::String(s) => Some(s),
                    _ => None,
                })
                .collect::<Option<Vec<String>>>()?,
        ),
        _ => return None,
    };
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, value: Value) -> PersistedEntry {
        PersistedEntry {
            name: name.to_string(),
            value,
            flags: EntryFlags::PERSISTENT,
        }
    }

    #[test]
    fn bootstrap_file_is_empty_store() {
        assert!(decode("[]").unwrap().is_empty());
    }

    #[test]
    fn every_type_survives_encoding() {
        let entries = vec![
            entry("/a", Value::Boolean(true)),
            entry("/b", Value::Double(10.0)),
            entry("/c", Value::String("hello".into())),
            entry("/d", Value::Raw(Bytes::from_static(&[0, 1, 255]))),
            entry("/e", Value::BooleanArray(vec![true, false])),
            entry("/f", Value::DoubleArray(vec![1.5, f64::INFINITY])),
            entry("/g", Value::StringArray(vec!["x".into(), "y".into()])),
        ];

        let text = encode(&entries).unwrap();
        assert_eq!(decode(&text).unwrap(), entries);
    }

    #[test]
    fn retained_flag_is_kept() {
        let mut e = entry("/r", Value::Double(1.0));
        e.flags |= EntryFlags::RETAINED;
        let decoded = decode(&encode(&[e]).unwrap()).unwrap();
        assert!(decoded[0].flags.contains(EntryFlags::RETAINED));
        assert!(decoded[0].flags.is_persistent());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let text = r#"[{"name":"/x","type":"double","value":5,"comment":"hi",
            "properties":{"persistent":true,"future":1}}]"#;
        let decoded = decode(text).unwrap();
        assert_eq!(decoded, vec![entry("/x", Value::Double(5.0))]);
    }

    #[test]
    fn malformed_files_are_corrupt_state() {
        for text in [
            "",
            "{not json",
            r#"{"name":"/x"}"#,
            r#"[{"name":"/x","type":"rpc","value":1}]"#,
            r#"[{"name":"/x","type":"boolean","value":"yes"}]"#,
            r#"[{"name":"/x","type":"raw","value":[1,2,300]}]"#,
        ] {
            match decode(text) {
                Err(Error::CorruptState(_)) => {}
                other => panic!("expected corrupt state for {:?}, got {:?}", text, other),
            }
        }
    }
}

// Serialization adapter between entities and storable documents
//
// Job and trigger data maps are encoded into a self-describing JSON shape
// so every supported value type survives a round trip exactly. Entities are
// serialized with serde; their data map is spliced in under `job_data`.

use crate::errors::JobStoreError;
use crate::models::{JobDataMap, JobDataValue};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Document field holding the encoded data map
pub const JOB_DATA_FIELD: &str = "job_data";

/// How data maps are written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializerKind {
    /// Typed entries; every `JobDataValue` variant is supported
    #[default]
    Json,
    /// Plain string entries only; any other value type is rejected
    Properties,
}

impl SerializerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SerializerKind::Json => "json",
            SerializerKind::Properties => "properties",
        }
    }
}

/// Converts entities and data maps to and from document bodies
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentSerializer {
    kind: SerializerKind,
}

impl DocumentSerializer {
    pub fn new(kind: SerializerKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> SerializerKind {
        self.kind
    }

    /// Encode a data map with the configured kind
    pub fn encode_data_map(&self, map: &JobDataMap) -> Result<Value, JobStoreError> {
        let mut entries = Map::new();
        for (key, value) in map.iter() {
            let encoded = match self.kind {
                SerializerKind::Json => encode_typed(key, value)?,
                SerializerKind::Properties => match value {
                    JobDataValue::String(s) => Value::String(s.clone()),
                    other => {
                        return Err(JobStoreError::Serialization(format!(
                            "properties serializer only stores strings, key '{}' holds {}",
                            key,
                            other.type_name()
                        )))
                    }
                },
            };
            entries.insert(key.clone(), encoded);
        }

        let mut doc = Map::new();
        doc.insert("format".to_string(), Value::from(self.kind.as_str()));
        doc.insert("entries".to_string(), Value::Object(entries));
        Ok(Value::Object(doc))
    }

    /// Decode a data map; the format is read from the document, not from configuration
    pub fn decode_data_map(&self, value: &Value) -> Result<JobDataMap, JobStoreError> {
        let format = value
            .get("format")
            .and_then(Value::as_str)
            .ok_or_else(|| serialization_error("data map is missing its format tag"))?;
        let entries = value
            .get("entries")
            .and_then(Value::as_object)
            .ok_or_else(|| serialization_error("data map is missing its entries"))?;

        let mut map = JobDataMap::new();
        for (key, entry) in entries {
            let decoded = match format {
                "json" => decode_typed(key, entry)?,
                "properties" => match entry {
                    Value::String(s) => JobDataValue::String(s.clone()),
                    _ => {
                        return Err(serialization_error(&format!(
                            "properties entry '{}' is not a string",
                            key
                        )))
                    }
                },
                other => {
                    return Err(serialization_error(&format!(
                        "unknown data map format '{}'",
                        other
                    )))
                }
            };
            map.insert(key.clone(), decoded);
        }
        Ok(map)
    }

    /// Serialize an entity, splicing in its data map when it has one
    pub fn to_document<T: Serialize>(
        &self,
        entity: &T,
        data: Option<&JobDataMap>,
    ) -> Result<Value, JobStoreError> {
        let mut body = serde_json::to_value(entity)?;
        if let Some(map) = data {
            let encoded = self.encode_data_map(map)?;
            match body.as_object_mut() {
                Some(obj) => {
                    obj.insert(JOB_DATA_FIELD.to_string(), encoded);
                }
                None => return Err(serialization_error("entity did not serialize to an object")),
            }
        }
        Ok(body)
    }

    /// Deserialize an entity and its data map (empty when the document carries none)
    pub fn from_document<T: DeserializeOwned>(
        &self,
        mut body: Value,
    ) -> Result<(T, JobDataMap), JobStoreError> {
        let data = match body.as_object_mut().and_then(|obj| obj.remove(JOB_DATA_FIELD)) {
            Some(encoded) => self.decode_data_map(&encoded)?,
            None => JobDataMap::new(),
        };
        let entity = serde_json::from_value(body)?;
        Ok((entity, data))
    }
}

fn serialization_error(msg: &str) -> JobStoreError {
    JobStoreError::Serialization(msg.to_string())
}

fn encode_typed(key: &str, value: &JobDataValue) -> Result<Value, JobStoreError> {
    let encoded = match value {
        JobDataValue::String(s) => Value::String(s.clone()),
        JobDataValue::Integer(i) => Value::from(*i),
        // floats are kept as their shortest round-trip text so no JSON parser can perturb them
        JobDataValue::Float(f) if f.is_finite() => Value::String(f.to_string()),
        JobDataValue::Float(f) => {
            return Err(JobStoreError::Serialization(format!(
                "key '{}' holds non-finite float {}",
                key, f
            )))
        }
        JobDataValue::Boolean(b) => Value::Bool(*b),
        JobDataValue::DateTime(dt) => {
            Value::String(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        }
        JobDataValue::Bytes(bytes) => Value::String(BASE64.encode(bytes)),
    };

    let mut entry = Map::new();
    entry.insert("type".to_string(), Value::from(value.type_name()));
    entry.insert("value".to_string(), encoded);
    Ok(Value::Object(entry))
}

fn decode_typed(key: &str, entry: &Value) -> Result<JobDataValue, JobStoreError> {
    let type_name = entry.get("type").and_then(Value::as_str).unwrap_or("");
    let raw = entry.get("value").unwrap_or(&Value::Null);
    let invalid = || {
        JobStoreError::Serialization(format!(
            "entry '{}' of type '{}' has an invalid value: {}",
            key, type_name, raw
        ))
    };

    let value = match type_name {
        "string" => JobDataValue::String(raw.as_str().ok_or_else(invalid)?.to_string()),
        "integer" => JobDataValue::Integer(raw.as_i64().ok_or_else(invalid)?),
        "float" => JobDataValue::Float(
            raw.as_str()
                .and_then(|s| s.parse::<f64>().ok())
                .filter(|f| f.is_finite())
                .ok_or_else(invalid)?,
        ),
        "boolean" => JobDataValue::Boolean(raw.as_bool().ok_or_else(invalid)?),
        "datetime" => JobDataValue::DateTime(
            raw.as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or_else(invalid)?,
        ),
        "bytes" => JobDataValue::Bytes(
            raw.as_str()
                .and_then(|s| BASE64.decode(s).ok())
                .ok_or_else(invalid)?,
        ),
        other => {
            return Err(JobStoreError::Serialization(format!(
                "entry '{}' has unsupported type '{}'",
                key, other
            )))
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobDetail, JobKey};
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn sample_map() -> JobDataMap {
        let mut map = JobDataMap::new();
        map.insert("name", "nightly");
        map.insert("count", -42i64);
        map.insert("ratio", 0.1f64);
        map.insert("enabled", true);
        map.insert(
            "at",
            Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap(),
        );
        map.insert("blob", vec![0u8, 1, 2, 255]);
        map
    }

    #[test]
    fn test_json_round_trip_all_types() {
        let ser = DocumentSerializer::new(SerializerKind::Json);
        let map = sample_map();
        let encoded = ser.encode_data_map(&map).unwrap();
        assert_eq!(encoded["format"], "json");
        assert_eq!(encoded["entries"]["blob"]["type"], "bytes");
        assert_eq!(ser.decode_data_map(&encoded).unwrap(), map);
    }

    #[test]
    fn test_non_finite_float_fails_fast() {
        let ser = DocumentSerializer::new(SerializerKind::Json);
        let mut map = JobDataMap::new();
        map.insert("bad", f64::NAN);
        assert!(matches!(
            ser.encode_data_map(&map),
            Err(JobStoreError::Serialization(_))
        ));
    }

    #[test]
    fn test_properties_rejects_non_strings() {
        let ser = DocumentSerializer::new(SerializerKind::Properties);
        let mut map = JobDataMap::new();
        map.insert("ok", "value");
        assert!(ser.encode_data_map(&map).is_ok());
        map.insert("count", 3i64);
        let err = ser.encode_data_map(&map).unwrap_err();
        assert!(err.to_string().contains("count"));
    }

    #[test]
    fn test_decode_uses_document_format() {
        let writer = DocumentSerializer::new(SerializerKind::Properties);
        let reader = DocumentSerializer::new(SerializerKind::Json);
        let mut map = JobDataMap::new();
        map.insert("k", "v");
        let encoded = writer.encode_data_map(&map).unwrap();
        assert_eq!(reader.decode_data_map(&encoded).unwrap(), map);
    }

    #[test]
    fn test_unknown_entry_type_is_rejected() {
        let ser = DocumentSerializer::default();
        let doc = serde_json::json!({
            "format": "json",
            "entries": {"x": {"type": "decimal", "value": "1.0"}}
        });
        assert!(matches!(
            ser.decode_data_map(&doc),
            Err(JobStoreError::Serialization(_))
        ));
    }

    #[test]
    fn test_entity_document_carries_job_data() {
        let ser = DocumentSerializer::default();
        let job = JobDetail::new(JobKey::in_default_group("j"), "ReportJob")
            .with_job_data(sample_map());
        let body = ser.to_document(&job, Some(&job.job_data)).unwrap();
        assert_eq!(body["job_data"]["format"], "json");

        let (mut back, data): (JobDetail, JobDataMap) = ser.from_document(body).unwrap();
        back.job_data = data;
        assert_eq!(back, job);
    }

    fn arb_value() -> impl Strategy<Value = JobDataValue> {
        prop_oneof![
            ".*".prop_map(JobDataValue::String),
            any::<i64>().prop_map(JobDataValue::Integer),
            any::<f64>()
                .prop_filter("finite", |f| f.is_finite())
                .prop_map(JobDataValue::Float),
            any::<bool>().prop_map(JobDataValue::Boolean),
            (-62_135_596_800i64..253_402_300_799i64, 0u32..1_000_000_000u32).prop_map(
                |(secs, nanos)| JobDataValue::DateTime(Utc.timestamp_opt(secs, nanos).unwrap())
            ),
            proptest::collection::vec(any::<u8>(), 0..64).prop_map(JobDataValue::Bytes),
        ]
    }

    proptest! {
        #[test]
        fn property_data_map_round_trip(
            entries in proptest::collection::btree_map("[a-z_.]{1,12}", arb_value(), 0..12)
        ) {
            let ser = DocumentSerializer::new(SerializerKind::Json);
            let map: JobDataMap = entries.into_iter().collect();
            let encoded = ser.encode_data_map(&map).unwrap();
            // through text as a remote store would see it
            let text = serde_json::to_string(&encoded).unwrap();
            let reparsed: Value = serde_json::from_str(&text).unwrap();
            prop_assert_eq!(ser.decode_data_map(&reparsed).unwrap(), map);
        }
    }
}

//! Turns flat string rows into typed records the model can consume.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::model::{EncodeError, FieldSpecial, FieldType, InputFieldSchema};

const NAIVE_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"];

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Float(f64),
    Int(i64),
    Str(String),
    Datetime(DateTime<Utc>),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

/// A typed input record with the bookkeeping the inference step expects.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedRecord {
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp: Option<DateTime<Utc>>,
    /// Aggregation bucket of `timestamp`; `None` when not aggregating.
    pub timestamp_record_idx: Option<i64>,
    pub category: Option<i64>,
    pub reset: u8,
    pub sequence_id: Option<i64>,
}

impl EncodedRecord {
    pub fn value(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }
}

/// One-shot encoder: feed a row with [`RowEncoder::set_row`], then call
/// [`RowEncoder::encode`] exactly once.
#[derive(Debug, Clone)]
pub struct RowEncoder {
    schema: InputFieldSchema,
    timestamp_index: Option<usize>,
    pending: Option<Vec<String>>,
}

impl RowEncoder {
    pub fn new(schema: InputFieldSchema) -> Result<Self, EncodeError> {
        let timestamps: Vec<usize> = schema
            .fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.special == FieldSpecial::Timestamp)
            .map(|(i, _)| i)
            .collect();

        if timestamps.len() > 1 {
            let names = timestamps
                .iter()
                .map(|&i| schema.fields[i].name.clone())
                .collect();
            return Err(EncodeError::MultipleTimestampFields(names));
        }

        Ok(Self {
            timestamp_index: timestamps.first().copied(),
            schema,
            pending: None,
        })
    }

    pub fn schema(&self) -> &InputFieldSchema {
        &self.schema
    }

    pub fn set_row(&mut self, values: Vec<String>) {
        self.pending = Some(values);
    }

    /// Encode the pending row.
    ///
    /// # Panics
    ///
    /// Panics when no row was set since the last call.
    pub fn encode(&mut self) -> Result<EncodedRecord, EncodeError> {
        let Some(values) = self.pending.take() else {
            panic!("RowEncoder::encode called without a pending row");
        };

        let expected = self.schema.fields.len();
        if values.len() != expected {
            return Err(EncodeError::FieldCountMismatch {
                expected,
                got: values.len(),
            });
        }

        let mut fields = BTreeMap::new();
        for (meta, raw) in self.schema.fields.iter().zip(values) {
            let value = parse_value(&meta.name, meta.field_type, raw)?;
            fields.insert(meta.name.clone(), value);
        }

        let timestamp = self.timestamp_index.and_then(|i| {
            match fields.get(&self.schema.fields[i].name) {
                Some(FieldValue::Datetime(ts)) => Some(*ts),
                _ => None,
            }
        });

        let timestamp_record_idx = match (timestamp, self.schema.aggregation_period_secs) {
            (Some(ts), Some(period)) if period > 0 => Some(ts.timestamp().div_euclid(period)),
            _ => None,
        };

        Ok(EncodedRecord {
            fields,
            timestamp,
            timestamp_record_idx,
            category: None,
            reset: 0,
            sequence_id: None,
        })
    }
}

fn parse_value(field: &str, field_type: FieldType, raw: String) -> Result<FieldValue, EncodeError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(FieldValue::Null);
    }

    let invalid = |reason: String| EncodeError::InvalidValue {
        field: field.to_string(),
        value: raw.clone(),
        reason,
    };

    match field_type {
        FieldType::Float => trimmed
            .parse::<f64>()
            .map(FieldValue::Float)
            .map_err(|e| invalid(e.to_string())),
        FieldType::Int => trimmed
            .parse::<i64>()
            .map(FieldValue::Int)
            .map_err(|e| invalid(e.to_string())),
        FieldType::String => Ok(FieldValue::Str(trimmed.to_string())),
        FieldType::Datetime => parse_timestamp(trimmed)
            .map(FieldValue::Datetime)
            .ok_or_else(|| invalid("unrecognized datetime format".to_string())),
    }
}

/// RFC 3339, or a naive `YYYY-MM-DD HH:MM:SS[.f]` taken as UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldMeta;
    use chrono::TimeZone;

    fn schema(aggregation: Option<i64>) -> InputFieldSchema {
        InputFieldSchema {
            fields: vec![
                FieldMeta {
                    name: "c0".to_string(),
                    field_type: FieldType::Datetime,
                    special: FieldSpecial::Timestamp,
                },
                FieldMeta {
                    name: "c1".to_string(),
                    field_type: FieldType::Float,
                    special: FieldSpecial::None,
                },
            ],
            aggregation_period_secs: aggregation,
        }
    }

    fn row(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_encode_with_timestamp() {
        let mut enc = RowEncoder::new(schema(None)).unwrap();
        enc.set_row(row(&["2024-03-01 12:05:00", "42.5"]));
        let rec = enc.encode().unwrap();

        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 12, 5, 0).unwrap();
        assert_eq!(rec.timestamp, Some(expected));
        assert_eq!(rec.timestamp_record_idx, None);
        assert_eq!(rec.value("c1").and_then(FieldValue::as_f64), Some(42.5));
        assert_eq!(rec.category, None);
        assert_eq!(rec.reset, 0);
        assert_eq!(rec.sequence_id, None);
    }

    #[test]
    fn test_encode_aggregation_index() {
        let mut enc = RowEncoder::new(schema(Some(300))).unwrap();
        enc.set_row(row(&["1970-01-01T00:10:01Z", "1"]));
        let rec = enc.encode().unwrap();
        assert_eq!(rec.timestamp_record_idx, Some(2));
    }

    #[test]
    fn test_encode_without_timestamp_field() {
        let mut s = schema(Some(300));
        s.fields[0].special = FieldSpecial::None;
        let mut enc = RowEncoder::new(s).unwrap();
        enc.set_row(row(&["2024-03-01 12:05:00", ""]));
        let rec = enc.encode().unwrap();
        assert_eq!(rec.timestamp, None);
        assert_eq!(rec.timestamp_record_idx, None);
        assert!(rec.value("c1").unwrap().is_null());
    }

    #[test]
    fn test_rejects_bad_rows() {
        let mut enc = RowEncoder::new(schema(None)).unwrap();
        enc.set_row(row(&["2024-03-01 12:05:00"]));
        assert_eq!(
            enc.encode(),
            Err(EncodeError::FieldCountMismatch { expected: 2, got: 1 })
        );

        enc.set_row(row(&["2024-03-01 12:05:00", "abc"]));
        assert!(matches!(enc.encode(), Err(EncodeError::InvalidValue { .. })));

        enc.set_row(row(&["yesterday", "1.0"]));
        assert!(matches!(enc.encode(), Err(EncodeError::InvalidValue { .. })));
    }

    #[test]
    fn test_rejects_two_timestamp_fields() {
        let mut s = schema(None);
        s.fields[1].special = FieldSpecial::Timestamp;
        assert!(matches!(
            RowEncoder::new(s),
            Err(EncodeError::MultipleTimestampFields(_))
        ));
    }

    #[test]
    #[should_panic(expected = "without a pending row")]
    fn test_encode_is_one_shot() {
        let mut enc = RowEncoder::new(schema(None)).unwrap();
        enc.set_row(row(&["2024-03-01 12:05:00", "1"]));
        enc.encode().unwrap();
        let _ = enc.encode();
    }
}

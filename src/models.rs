use std::collections::HashMap;
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One row from either extract: an ordered mapping from column name to
/// string value. Immutable once built — the engine never edits source rows.
///
/// The column set varies per dataset (and occasionally per row), so this is
/// a dynamic map rather than a fixed struct.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Record {
    columns: Vec<String>,
    values: HashMap<String, String>,
}

impl Record {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut rec = Record::default();
        for (k, v) in pairs {
            rec.push(k.into(), v.into());
        }
        rec
    }

    fn push(&mut self, column: String, value: String) {
        if !self.values.contains_key(&column) {
            self.columns.push(column.clone());
        }
        self.values.insert(column, value);
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.values.get(column).map(String::as_str)
    }

    pub fn contains_column(&self, column: &str) -> bool {
        self.values.contains_key(column)
    }

    /// Column names in first-seen order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for col in &self.columns {
            map.serialize_entry(col, &self.values[col])?;
        }
        map.end()
    }
}

struct RecordVisitor;

impl<'de> Visitor<'de> for RecordVisitor {
    type Value = Record;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map of column name to scalar value")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Record, A::Error> {
        let mut rec = Record::default();
        while let Some((key, value)) = access.next_entry::<String, serde_json::Value>()? {
            let text = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                serde_json::Value::Null => String::new(),
                other => {
                    return Err(serde::de::Error::custom(format!(
                        "column `{key}` holds a non-scalar value: {other}"
                    )))
                }
            };
            rec.push(key, text);
        }
        Ok(rec)
    }
}

impl<'de> Deserialize<'de> for Record {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Record, D::Error> {
        deserializer.deserialize_map(RecordVisitor)
    }
}

/// A field on which a matched pair disagrees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDifference {
    pub field_name: String,
    pub bo_value: String,
    pub partner_value: String,
}

/// A record that found no counterpart, with an optional diagnostic note
/// (set when the row was excluded for a reason other than a plain key miss,
/// e.g. a missing primary key column).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmatchedRecord {
    pub record: Record,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl UnmatchedRecord {
    pub fn plain(record: Record) -> Self {
        Self { record, note: None }
    }

    pub fn noted(record: Record, note: impl Into<String>) -> Self {
        Self {
            record,
            note: Some(note.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_preserves_column_order() {
        let r = Record::from_pairs([("b", "2"), ("a", "1"), ("c", "3")]);
        assert_eq!(r.columns(), &["b", "a", "c"]);
        assert_eq!(r.get("a"), Some("1"));
        assert_eq!(r.get("missing"), None);
    }

    #[test]
    fn duplicate_column_last_value_wins() {
        let r = Record::from_pairs([("id", "1"), ("id", "2")]);
        assert_eq!(r.len(), 1);
        assert_eq!(r.get("id"), Some("2"));
    }

    #[test]
    fn json_round_trip_keeps_order() {
        let json = r#"{"txn_id":"T1","amount":"100.00","currency":"USD"}"#;
        let r: Record = serde_json::from_str(json).unwrap();
        assert_eq!(r.columns(), &["txn_id", "amount", "currency"]);
        let back = serde_json::to_string(&r).unwrap();
        assert_eq!(back, json);
    }

    #[test]
    fn json_scalars_coerce_to_strings() {
        let r: Record =
            serde_json::from_str(r#"{"amount":100.5,"settled":true,"memo":null}"#).unwrap();
        assert_eq!(r.get("amount"), Some("100.5"));
        assert_eq!(r.get("settled"), Some("true"));
        assert_eq!(r.get("memo"), Some(""));
    }

    #[test]
    fn nested_json_is_rejected() {
        let res: Result<Record, _> = serde_json::from_str(r#"{"meta":{"a":1}}"#);
        assert!(res.is_err());
    }
}

//! Translation between application records and native documents.
//!
//! Application records are JSON objects identified by an `id` field. Stored
//! documents are BSON and identified by `_id`, which holds an [`ObjectId`]
//! whenever the application id looks like one (24 hex characters).
//! Everything else passes through unchanged.

use bson::oid::ObjectId;
use bson::{Bson, Document};
use serde_json::{Map, Number, Value};

use crate::driver::NATIVE_ID_FIELD;

/// Application-facing identifier field.
pub const ID_FIELD: &str = "id";

/// An application record.
pub type Record = Map<String, Value>;

/// Length of the hex form of an [`ObjectId`].
const OBJECT_ID_HEX_LEN: usize = 24;

/// Convert an application id value to its native form.
pub fn to_native_id(value: &Value) -> Bson {
    if let Value::String(s) = value {
        if s.len() == OBJECT_ID_HEX_LEN {
            if let Ok(oid) = ObjectId::parse_str(s) {
                return Bson::ObjectId(oid);
            }
        }
    }
    json_to_bson(value)
}

/// Convert a native id back to its application form.
pub fn from_native_id(value: Bson) -> Value {
    match value {
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        other => bson_to_json(other),
    }
}

/// Translate the value of an `id` filter.
///
/// Plain values become native ids. Operator objects keep their shape:
/// `$in` / `$nin` lists convert element by element and `$eq` / `$ne`
/// convert their operand.
pub fn id_filter_to_native(value: &Value) -> Bson {
    let Value::Object(ops) = value else {
        return to_native_id(value);
    };
    if !ops.keys().any(|k| k.starts_with('$')) {
        return to_native_id(value);
    }
    let mut doc = Document::new();
    for (op, operand) in ops {
        let translated = match (op.as_str(), operand) {
            ("$in" | "$nin", Value::Array(items)) => {
                Bson::Array(items.iter().map(to_native_id).collect())
            }
            ("$eq" | "$ne", v) => to_native_id(v),
            (_, v) => json_to_bson(v),
        };
        doc.insert(op.clone(), translated);
    }
    Bson::Document(doc)
}

/// Serialize a record for storage, renaming `id` to `_id`.
pub fn record_to_document(record: &Record) -> Document {
    let mut doc = Document::new();
    for (key, value) in record {
        if key == ID_FIELD {
            doc.insert(NATIVE_ID_FIELD, to_native_id(value));
        } else {
            doc.insert(key.clone(), json_to_bson(value));
        }
    }
    doc
}

/// Translate a filter object, renaming `id` to `_id`.
pub fn query_to_document(query: &Record) -> Document {
    let mut doc = Document::new();
    for (key, value) in query {
        if key == ID_FIELD {
            doc.insert(NATIVE_ID_FIELD, id_filter_to_native(value));
        } else {
            doc.insert(key.clone(), json_to_bson(value));
        }
    }
    doc
}

/// Turn a stored document into a record, renaming `_id` to `id`.
pub fn document_to_record(doc: Document) -> Record {
    let mut record = Record::new();
    for (key, value) in doc {
        if key == NATIVE_ID_FIELD {
            record.insert(ID_FIELD.to_string(), from_native_id(value));
        } else {
            record.insert(key, bson_to_json(value));
        }
    }
    record
}

/// Sort keys follow the same `id` → `_id` rename as filters.
pub fn sort_field_to_native(field: &str) -> String {
    if field == ID_FIELD {
        NATIVE_ID_FIELD.to_string()
    } else {
        field.to_string()
    }
}

/// Update `target` in place so it equals `source`.
///
/// Keys missing from `source` are removed first, then every key of `source`
/// is written. The map itself is never replaced, so callers holding
/// `&mut target` observe the new contents.
pub fn merge_in_place(target: &mut Record, source: Record) {
    target.retain(|key, _| source.contains_key(key));
    for (key, value) in source {
        target.insert(key, value);
    }
}

pub fn json_to_bson(value: &Value) -> Bson {
    match value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Bson::Int64(i)
            } else {
                Bson::Double(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => Bson::String(s.clone()),
        Value::Array(items) => Bson::Array(items.iter().map(json_to_bson).collect()),
        Value::Object(map) => {
            let mut doc = Document::new();
            for (key, value) in map {
                doc.insert(key.clone(), json_to_bson(value));
            }
            Bson::Document(doc)
        }
    }
}

pub fn bson_to_json(value: Bson) -> Value {
    match value {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(b) => Value::Bool(b),
        Bson::Int32(i) => Value::from(i),
        Bson::Int64(i) => Value::from(i),
        Bson::Double(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        Bson::String(s) => Value::String(s),
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::Array(items) => Value::Array(items.into_iter().map(bson_to_json).collect()),
        Bson::Document(doc) => Value::Object(
            doc.into_iter()
                .map(|(key, value)| (key, bson_to_json(value)))
                .collect(),
        ),
        other => other.into_relaxed_extjson(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const HEX: &str = "64b7f0c2a1b2c3d4e5f60718";

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn hex_id_becomes_object_id() {
        let native = to_native_id(&json!(HEX));
        assert_eq!(native, Bson::ObjectId(ObjectId::parse_str(HEX).unwrap()));
    }

    #[test]
    fn non_hex_ids_pass_through() {
        assert_eq!(to_native_id(&json!("abc")), Bson::String("abc".into()));
        assert_eq!(to_native_id(&json!(42)), Bson::Int64(42));
        // right length, not hex
        let almost = "zzzzzzzzzzzzzzzzzzzzzzzz";
        assert_eq!(to_native_id(&json!(almost)), Bson::String(almost.into()));
    }

    #[test]
    fn record_renames_id() {
        let doc = record_to_document(&record(json!({"id": HEX, "name": "a"})));
        assert!(doc.get(ID_FIELD).is_none());
        assert_eq!(doc.get_object_id("_id").unwrap().to_hex(), HEX);
        assert_eq!(doc.get_str("name").unwrap(), "a");
    }

    #[test]
    fn document_renames_native_id() {
        let oid = ObjectId::new();
        let mut doc = Document::new();
        doc.insert("_id", oid);
        doc.insert("n", 3_i32);
        let rec = document_to_record(doc);
        assert_eq!(rec.get("id"), Some(&json!(oid.to_hex())));
        assert_eq!(rec.get("n"), Some(&json!(3)));
        assert!(!rec.contains_key("_id"));
    }

    #[test]
    fn in_filter_converts_each_element() {
        let filter = id_filter_to_native(&json!({"$in": [HEX, "plain"]}));
        let Bson::Document(doc) = filter else {
            panic!("expected operator document");
        };
        let items = doc.get_array("$in").unwrap();
        assert!(matches!(items[0], Bson::ObjectId(_)));
        assert_eq!(items[1], Bson::String("plain".into()));
    }

    #[test]
    fn ne_filter_converts_operand() {
        let Bson::Document(doc) = id_filter_to_native(&json!({"$ne": HEX})) else {
            panic!("expected operator document");
        };
        assert!(matches!(doc.get("$ne"), Some(Bson::ObjectId(_))));
    }

    #[test]
    fn query_only_renames_id() {
        let doc = query_to_document(&record(json!({"id": HEX, "tag": {"$in": ["x"]}})));
        assert!(doc.contains_key("_id"));
        assert_eq!(
            doc.get_document("tag").unwrap().get_array("$in").unwrap(),
            &vec![Bson::String("x".into())]
        );
    }

    #[test]
    fn sort_field_id_is_native() {
        assert_eq!(sort_field_to_native("id"), "_id");
        assert_eq!(sort_field_to_native("name"), "name");
    }

    #[test]
    fn merge_removes_stale_and_overwrites() {
        let mut target = record(json!({"a": 1, "stale": true}));
        merge_in_place(&mut target, record(json!({"a": 2, "id": "x"})));
        assert_eq!(Value::Object(target), json!({"a": 2, "id": "x"}));
    }

    #[test]
    fn nested_values_survive_conversion() {
        let value = json!({"list": [1, "two", null, {"deep": 2.5}], "flag": false});
        assert_eq!(bson_to_json(json_to_bson(&value)), value);
    }
}

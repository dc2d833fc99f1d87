//! Row mapping
//!
//! Converts between engine rows, [`Record`]s and engine-side value objects
//! ([`EngineObject`]) described by a [`Shape`]. Composite fields travel as
//! JSON text in a single column; this is the only place JSON decoding
//! errors are raised.

mod shape;
mod value;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use shape::{
    quote_ident, EngineObject, EngineValue, FieldKind, FieldSpec, Shape, CREATED_AT, UPDATED_AT,
};
pub use value::{ColumnType, Record, Value};

use crate::error::{DataAccessError, Result};

/// Convert one engine row into a record
pub fn to_record(columns: &Arc<[String]>, row: &rusqlite::Row<'_>) -> Result<Record> {
    let mut values = Vec::with_capacity(columns.len());
    for (idx, column) in columns.iter().enumerate() {
        let raw = row
            .get_ref(idx)
            .map_err(|e| DataAccessError::type_mapping(column, e))?;
        values.push(Value::from_raw(column, raw)?);
    }
    Ok(Record::new(Arc::clone(columns), values))
}

/// Map a record onto a shape
///
/// A NULL in a nullable field stays NULL. Fields the record lacks, and NULLs
/// in non-nullable fields, take the declared default, then NULL if nullable;
/// otherwise the mapping fails with [`DataAccessError::MissingField`].
pub fn to_engine_value(record: &Record, shape: &Shape) -> Result<EngineObject> {
    let mut object = EngineObject::new();

    if let Some(id) = record.get(shape.id_column()) {
        object.insert(
            shape.id_column().to_string(),
            integer_column(shape.id_column(), id)?,
        );
    }

    for field in shape.fields() {
        let value = match record.get(&field.name) {
            Some(v) if !v.is_null() => decode_field(field, v)?,
            Some(_) if field.nullable => EngineValue::Null,
            _ => fallback(field)?,
        };
        object.insert(field.name.clone(), value);
    }

    if shape.has_timestamps() {
        for column in [CREATED_AT, UPDATED_AT] {
            if let Some(v) = record.get(column) {
                object.insert(column.to_string(), integer_column(column, v)?);
            }
        }
    }

    Ok(object)
}

/// Inverse of [`to_engine_value`]: bound values for the shape's fields, in
/// declaration order
///
/// The id and timestamp columns are managed by the caller and not included.
pub fn from_engine_value(object: &EngineObject, shape: &Shape) -> Result<Vec<Value>> {
    shape
        .fields()
        .iter()
        .map(|field| {
            let value = match object.get(&field.name) {
                Some(v) if *v != EngineValue::Null => v.clone(),
                Some(_) if field.nullable => EngineValue::Null,
                _ => fallback(field)?,
            };
            encode_field(field, &value)
        })
        .collect()
}

/// Serialize a typed entity into an engine object
pub fn entity_to_object<T: Serialize>(entity: &T, shape: &Shape) -> Result<EngineObject> {
    let json = serde_json::to_value(entity).map_err(|e| malformed(shape.table(), e))?;
    let serde_json::Value::Object(map) = json else {
        return Err(malformed(shape.table(), "entity must serialize to an object"));
    };

    let mut object = EngineObject::new();
    let id_column = shape.id_column();
    if let Some(id) = map.get(id_column) {
        object.insert(id_column.to_string(), json_integer(id_column, id)?);
    }

    // fields the entity skips stay absent so their defaults apply
    for field in shape.fields() {
        let value = match map.get(&field.name) {
            None => continue,
            Some(serde_json::Value::Null) => EngineValue::Null,
            Some(json) => json_to_engine(field, json)?,
        };
        object.insert(field.name.clone(), value);
    }

    if shape.has_timestamps() {
        for column in [CREATED_AT, UPDATED_AT] {
            if let Some(v) = map.get(column) {
                object.insert(column.to_string(), json_integer(column, v)?);
            }
        }
    }

    Ok(object)
}

/// Deserialize a typed entity from an engine object
pub fn object_to_entity<T: DeserializeOwned>(object: &EngineObject, shape: &Shape) -> Result<T> {
    let mut map = serde_json::Map::new();
    for (name, value) in object {
        map.insert(name.clone(), engine_to_json(name, value)?);
    }
    serde_json::from_value(serde_json::Value::Object(map)).map_err(|e| malformed(shape.table(), e))
}

fn malformed(field: &str, message: impl std::fmt::Display) -> DataAccessError {
    DataAccessError::MalformedJson {
        field: field.to_string(),
        message: message.to_string(),
    }
}

fn mismatch(field: &FieldSpec, found: impl std::fmt::Display) -> DataAccessError {
    DataAccessError::type_mapping(
        &field.name,
        format!("expected {:?}, found {}", field.kind, found),
    )
}

fn fallback(field: &FieldSpec) -> Result<EngineValue> {
    match &field.default {
        Some(default) => Ok(default.clone()),
        None if field.nullable => Ok(EngineValue::Null),
        None => Err(DataAccessError::MissingField {
            field: field.name.clone(),
        }),
    }
}

fn integer_column(column: &str, value: &Value) -> Result<EngineValue> {
    match value {
        Value::Null => Ok(EngineValue::Null),
        Value::Integer(i) => Ok(EngineValue::Int(*i)),
        other => Err(DataAccessError::type_mapping(
            column,
            format!("expected INTEGER, found {}", other.column_type()),
        )),
    }
}

fn check_int32(field: &FieldSpec, i: i64) -> Result<i64> {
    if field.kind == FieldKind::Int32 && i32::try_from(i).is_err() {
        return Err(DataAccessError::type_mapping(
            &field.name,
            format!("{} is out of range for a 32-bit integer", i),
        ));
    }
    Ok(i)
}

/// Column value to engine value
fn decode_field(field: &FieldSpec, value: &Value) -> Result<EngineValue> {
    match (field.kind, value) {
        (FieldKind::Bool, Value::Integer(0)) => Ok(EngineValue::Bool(false)),
        (FieldKind::Bool, Value::Integer(1)) => Ok(EngineValue::Bool(true)),
        (FieldKind::Bool, Value::Integer(i)) => Err(mismatch(field, format!("integer {}", i))),
        (FieldKind::Int32 | FieldKind::Int64, Value::Integer(i)) => {
            Ok(EngineValue::Int(check_int32(field, *i)?))
        }
        (FieldKind::Float | FieldKind::Double, Value::Real(f)) => Ok(EngineValue::Float(*f)),
        (FieldKind::Float | FieldKind::Double, Value::Integer(i)) => {
            Ok(EngineValue::Float(*i as f64))
        }
        (FieldKind::Text, Value::Text(s)) => Ok(EngineValue::Text(s.clone())),
        (FieldKind::Bytes, Value::Blob(b)) => Ok(EngineValue::Bytes(b.clone())),
        (FieldKind::Json, Value::Text(s)) => serde_json::from_str(s)
            .map(EngineValue::Composite)
            .map_err(|e| malformed(&field.name, e)),
        (_, other) => Err(mismatch(field, other.column_type())),
    }
}

/// Engine value to column value
fn encode_field(field: &FieldSpec, value: &EngineValue) -> Result<Value> {
    match (field.kind, value) {
        (_, EngineValue::Null) => Ok(Value::Null),
        (FieldKind::Bool, EngineValue::Bool(b)) => Ok(Value::from(*b)),
        (FieldKind::Int32 | FieldKind::Int64, EngineValue::Int(i)) => {
            Ok(Value::Integer(check_int32(field, *i)?))
        }
        (FieldKind::Float | FieldKind::Double, EngineValue::Float(f)) => Ok(Value::Real(*f)),
        (FieldKind::Float | FieldKind::Double, EngineValue::Int(i)) => Ok(Value::Real(*i as f64)),
        (FieldKind::Text, EngineValue::Text(s)) => Ok(Value::Text(s.clone())),
        (FieldKind::Bytes, EngineValue::Bytes(b)) => Ok(Value::Blob(b.clone())),
        (FieldKind::Json, EngineValue::Composite(json)) => serde_json::to_string(json)
            .map(Value::Text)
            .map_err(|e| malformed(&field.name, e)),
        (_, other) => Err(mismatch(field, format!("{:?}", other))),
    }
}

fn json_integer(column: &str, json: &serde_json::Value) -> Result<EngineValue> {
    match json {
        serde_json::Value::Null => Ok(EngineValue::Null),
        other => other
            .as_i64()
            .map(EngineValue::Int)
            .ok_or_else(|| malformed(column, format!("expected an integer, found {}", other))),
    }
}

fn json_to_engine(field: &FieldSpec, json: &serde_json::Value) -> Result<EngineValue> {
    let wrong = || malformed(&field.name, format!("expected {:?}, found {}", field.kind, json));
    match field.kind {
        FieldKind::Bool => json.as_bool().map(EngineValue::Bool).ok_or_else(wrong),
        FieldKind::Int32 | FieldKind::Int64 => {
            let i = json.as_i64().ok_or_else(wrong)?;
            Ok(EngineValue::Int(check_int32(field, i)?))
        }
        FieldKind::Float | FieldKind::Double => {
            json.as_f64().map(EngineValue::Float).ok_or_else(wrong)
        }
        FieldKind::Text => json
            .as_str()
            .map(|s| EngineValue::Text(s.to_string()))
            .ok_or_else(wrong),
        FieldKind::Bytes => serde_json::from_value::<Vec<u8>>(json.clone())
            .map(EngineValue::Bytes)
            .map_err(|e| malformed(&field.name, e)),
        FieldKind::Json => Ok(EngineValue::Composite(json.clone())),
    }
}

fn engine_to_json(name: &str, value: &EngineValue) -> Result<serde_json::Value> {
    Ok(match value {
        EngineValue::Null => serde_json::Value::Null,
        EngineValue::Bool(b) => serde_json::Value::Bool(*b),
        EngineValue::Int(i) => serde_json::Value::from(*i),
        EngineValue::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .ok_or_else(|| malformed(name, format!("{} is not representable in JSON", f)))?,
        EngineValue::Text(s) => serde_json::Value::String(s.clone()),
        EngineValue::Bytes(b) => serde_json::Value::from(b.clone()),
        EngineValue::Composite(json) => json.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        id: Option<i64>,
        name: String,
        level: i32,
        weight: f64,
        equipped: bool,
        tags: Vec<String>,
        icon: Option<Vec<u8>>,
    }

    fn item_shape() -> Shape {
        Shape::new("items")
            .field(FieldSpec::new("name", FieldKind::Text))
            .field(FieldSpec::new("level", FieldKind::Int32))
            .field(FieldSpec::new("weight", FieldKind::Double))
            .field(FieldSpec::new("equipped", FieldKind::Bool))
            .field(FieldSpec::new("tags", FieldKind::Json))
            .field(FieldSpec::new("icon", FieldKind::Bytes).nullable())
    }

    fn record_for(shape: &Shape, id: i64, values: Vec<Value>) -> Record {
        let mut pairs = vec![("id".to_string(), Value::Integer(id))];
        pairs.extend(
            shape
                .fields()
                .iter()
                .map(|f| f.name.clone())
                .zip(values),
        );
        Record::from_pairs(pairs)
    }

    #[test]
    fn test_entity_round_trip_through_record() {
        let shape = item_shape();
        let item = Item {
            id: Some(7),
            name: "sword".to_string(),
            level: 3,
            weight: 2.5,
            equipped: true,
            tags: vec!["sharp".to_string(), "steel".to_string()],
            icon: Some(vec![1, 2, 3]),
        };

        let object = entity_to_object(&item, &shape).unwrap();
        let params = from_engine_value(&object, &shape).unwrap();
        assert_eq!(params[4], Value::Text(r#"["sharp","steel"]"#.to_string()));
        assert_eq!(params[3], Value::Integer(1));

        let record = record_for(&shape, 7, params);
        let decoded = to_engine_value(&record, &shape).unwrap();
        assert_eq!(decoded, object);
        let back: Item = object_to_entity(&decoded, &shape).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn test_to_record_from_engine_row() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let mut stmt = conn
            .prepare("SELECT 1 AS id, 'sword' AS name, NULL AS note, x'0102' AS data")
            .unwrap();
        let columns: Arc<[String]> = stmt
            .column_names()
            .into_iter()
            .map(String::from)
            .collect();
        let mut rows = stmt.query([]).unwrap();
        let row = rows.next().unwrap().unwrap();
        let record = to_record(&columns, row).unwrap();
        assert_eq!(
            record,
            Record::from_pairs([
                ("id", Value::from(1)),
                ("name", Value::from("sword")),
                ("note", Value::Null),
                ("data", Value::Blob(vec![1, 2])),
            ])
        );
    }

    #[test]
    fn test_missing_field_and_defaults() {
        let shape = Shape::new("players")
            .field(FieldSpec::new("name", FieldKind::Text))
            .field(FieldSpec::new("score", FieldKind::Int64).default(EngineValue::Int(0)))
            .field(FieldSpec::new("clan", FieldKind::Text).nullable());

        let record = Record::from_pairs([("id", Value::from(1)), ("name", Value::from("ana"))]);
        let object = to_engine_value(&record, &shape).unwrap();
        assert_eq!(object["score"], EngineValue::Int(0));
        assert_eq!(object["clan"], EngineValue::Null);

        let record = Record::from_pairs([("id", 1)]);
        let err = to_engine_value(&record, &shape).unwrap_err();
        assert_eq!(
            err,
            DataAccessError::MissingField {
                field: "name".to_string()
            }
        );
    }

    #[test]
    fn test_explicit_null_survives_nullable_default() {
        let shape = Shape::new("players").field(
            FieldSpec::new("score", FieldKind::Int64)
                .nullable()
                .default(EngineValue::Int(5)),
        );

        let mut object = EngineObject::new();
        object.insert("score".to_string(), EngineValue::Null);
        assert_eq!(from_engine_value(&object, &shape).unwrap(), vec![Value::Null]);
        assert_eq!(
            from_engine_value(&EngineObject::new(), &shape).unwrap(),
            vec![Value::Integer(5)]
        );

        let stored = Record::from_pairs([("id", Value::from(1)), ("score", Value::Null)]);
        let object = to_engine_value(&stored, &shape).unwrap();
        assert_eq!(object["score"], EngineValue::Null);

        let absent = Record::from_pairs([("id", 1)]);
        let object = to_engine_value(&absent, &shape).unwrap();
        assert_eq!(object["score"], EngineValue::Int(5));
    }

    #[test]
    fn test_null_in_required_field_takes_default() {
        let shape = Shape::new("players")
            .field(FieldSpec::new("score", FieldKind::Int64).default(EngineValue::Int(0)));
        let record = Record::from_pairs([("id", Value::from(1)), ("score", Value::Null)]);
        let object = to_engine_value(&record, &shape).unwrap();
        assert_eq!(object["score"], EngineValue::Int(0));
    }

    #[test]
    fn test_malformed_json_column() {
        let shape = Shape::new("t").field(FieldSpec::new("tags", FieldKind::Json));
        let record = Record::from_pairs([("id", Value::from(1)), ("tags", Value::from("[1, 2"))]);
        let err = to_engine_value(&record, &shape).unwrap_err();
        assert!(matches!(err, DataAccessError::MalformedJson { field, .. } if field == "tags"));
    }

    #[test]
    fn test_type_mismatches() {
        let shape = Shape::new("t")
            .field(FieldSpec::new("level", FieldKind::Int32))
            .field(FieldSpec::new("flag", FieldKind::Bool).nullable());

        let too_big = Record::from_pairs([("level", Value::Integer(i64::MAX))]);
        assert!(matches!(
            to_engine_value(&too_big, &shape),
            Err(DataAccessError::TypeMapping { .. })
        ));

        let text = Record::from_pairs([("level", Value::from("ten"))]);
        assert!(matches!(
            to_engine_value(&text, &shape),
            Err(DataAccessError::TypeMapping { .. })
        ));

        let not_bool = Record::from_pairs([("level", Value::from(1)), ("flag", Value::from(2))]);
        assert!(matches!(
            to_engine_value(&not_bool, &shape),
            Err(DataAccessError::TypeMapping { .. })
        ));
    }

    #[test]
    fn test_entity_with_wrong_json_type() {
        #[derive(Serialize)]
        struct Wrong {
            level: String,
        }
        let shape = Shape::new("t").field(FieldSpec::new("level", FieldKind::Int32));
        let err = entity_to_object(
            &Wrong {
                level: "high".to_string(),
            },
            &shape,
        )
        .unwrap_err();
        assert!(matches!(err, DataAccessError::MalformedJson { .. }));
    }
}

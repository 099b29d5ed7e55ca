//! JSON wire form of a [`Record`].
//!
//! Binary fields cross the transport as standard base64 strings. This module is the only
//! place that transcodes them: the stores hand the engine raw bytes and the engine never
//! sees base64.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{Map, Number, Value};
use thiserror::Error;

use super::{Collection, FieldValue, Record, ID_FIELD};

#[derive(Error, Debug, PartialEq)]
pub enum CodecError {
    #[error("expected a JSON object for a {0} record")]
    NotAnObject(Collection),

    #[error("{collection} record has no integer `id` field")]
    MissingId { collection: Collection },

    #[error("field `{field}` of {collection} is not valid base64: {message}")]
    InvalidBase64 {
        collection: Collection,
        field: String,
        message: String,
    },

    #[error("field `{field}` of {collection} has an unsupported JSON value")]
    UnsupportedValue { collection: Collection, field: String },

    #[error("float in field `{0}` is not representable in JSON")]
    NonFiniteFloat(String),
}

pub fn encode_value(value: &FieldValue) -> Option<Value> {
    Some(match value {
        FieldValue::Null => Value::Null,
        FieldValue::Int(v) => Value::from(*v),
        FieldValue::Float(v) => Value::Number(Number::from_f64(*v)?),
        FieldValue::Text(v) => Value::String(v.clone()),
        FieldValue::Bytes(v) => Value::String(STANDARD.encode(v)),
    })
}

pub fn encode_record(record: &Record) -> Result<Value, CodecError> {
    let mut object = Map::with_capacity(record.len());
    for (field, value) in record.iter() {
        let encoded =
            encode_value(value).ok_or_else(|| CodecError::NonFiniteFloat(field.to_string()))?;
        object.insert(field.to_string(), encoded);
    }
    Ok(Value::Object(object))
}

pub fn encode_records(records: &[Record]) -> Result<Value, CodecError> {
    records
        .iter()
        .map(encode_record)
        .collect::<Result<Vec<_>, _>>()
        .map(Value::Array)
}

fn decode_value(collection: Collection, field: &str, value: Value) -> Result<FieldValue, CodecError> {
    let unsupported = || CodecError::UnsupportedValue {
        collection,
        field: field.to_string(),
    };

    match value {
        Value::Null => Ok(FieldValue::Null),
        Value::Bool(b) => Ok(FieldValue::Int(i64::from(b))),
        Value::Number(n) => match n.as_i64() {
            Some(v) => Ok(FieldValue::Int(v)),
            None => n.as_f64().map(FieldValue::Float).ok_or_else(unsupported),
        },
        Value::String(s) if collection.is_binary_field(field) => STANDARD
            .decode(s.as_bytes())
            .map(FieldValue::Bytes)
            .map_err(|err| CodecError::InvalidBase64 {
                collection,
                field: field.to_string(),
                message: err.to_string(),
            }),
        Value::String(s) => Ok(FieldValue::Text(s)),
        Value::Array(_) | Value::Object(_) => Err(unsupported()),
    }
}

pub fn decode_record(collection: Collection, value: Value) -> Result<Record, CodecError> {
    let Value::Object(object) = value else {
        return Err(CodecError::NotAnObject(collection));
    };

    let record = object
        .into_iter()
        .map(|(field, value)| {
            let decoded = decode_value(collection, &field, value)?;
            Ok((field, decoded))
        })
        .collect::<Result<Record, CodecError>>()?;

    match record.get(ID_FIELD) {
        Some(FieldValue::Int(_)) => Ok(record),
        _ => Err(CodecError::MissingId { collection }),
    }
}

pub fn decode_records(collection: Collection, value: Value) -> Result<Vec<Record>, CodecError> {
    match value {
        Value::Array(rows) => rows
            .into_iter()
            .map(|row| decode_record(collection, row))
            .collect(),
        Value::Null => Ok(Vec::new()),
        _ => Err(CodecError::NotAnObject(collection)),
    }
}

pub mod codec;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Field every record carries; assigned by the source store and never reused.
pub const ID_FIELD: &str = "id";

/// The two record sets kept in sync. Each one is reconciled on its own; fields are
/// never compared across collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    User,
    #[serde(rename = "feature_model_0330")]
    FeatureModel0330,
}

/// How the update pass decides whether a row present on both sides has drifted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePolicy {
    /// Compare every non-id field of the source row.
    AllFields,
    /// Compare only this revision field.
    RevisionMarker(&'static str),
}

impl Collection {
    /// Reconciliation order within a cycle.
    pub const ALL: [Collection; 2] = [Collection::User, Collection::FeatureModel0330];

    pub fn name(self) -> &'static str {
        match self {
            Collection::User => "user",
            Collection::FeatureModel0330 => "feature_model_0330",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }

    /// Fields that are physically byte blobs and travel base64-encoded.
    pub fn binary_fields(self) -> &'static [&'static str] {
        match self {
            Collection::User => &["pic_md5"],
            Collection::FeatureModel0330 => &["feature"],
        }
    }

    pub fn is_binary_field(self, field: &str) -> bool {
        self.binary_fields().contains(&field)
    }

    pub fn update_policy(self) -> UpdatePolicy {
        match self {
            Collection::User => UpdatePolicy::AllFields,
            Collection::FeatureModel0330 => UpdatePolicy::RevisionMarker("timestamp"),
        }
    }

    /// The single field the update pass compares, when the collection has one.
    pub fn revision_marker(self) -> Option<&'static str> {
        match self.update_policy() {
            UpdatePolicy::RevisionMarker(marker) => Some(marker),
            UpdatePolicy::AllFields => None,
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl FieldValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => f.write_str("NULL"),
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Text(v) => write!(f, "{v:?}"),
            FieldValue::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Int(i64::from(value))
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(value: Vec<u8>) -> Self {
        FieldValue::Bytes(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(FieldValue::Null, Into::into)
    }
}

/// One row of a collection, keyed by field name.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    fields: BTreeMap<String, FieldValue>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, handy for fixtures and model conversions.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn id(&self) -> Option<i64> {
        self.get(ID_FIELD).and_then(FieldValue::as_int)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Copy holding only `id` and the listed fields; fields this record lacks stay absent.
    pub fn project(&self, fields: &[&str]) -> Record {
        self.fields
            .iter()
            .filter(|(field, _)| field.as_str() == ID_FIELD || fields.contains(&field.as_str()))
            .map(|(field, value)| (field.clone(), value.clone()))
            .collect()
    }
}

impl FromIterator<(String, FieldValue)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, FieldValue)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// First field whose value makes `target` stale relative to `source`, if any.
///
/// Under `AllFields` a field absent from the target counts as different. Under
/// `RevisionMarker` a marker missing on either side always counts as different.
pub fn first_difference<'a>(
    collection: Collection,
    source: &'a Record,
    target: &Record,
) -> Option<&'a str> {
    match collection.update_policy() {
        UpdatePolicy::AllFields => source
            .iter()
            .filter(|(field, _)| *field != ID_FIELD)
            .find(|(field, value)| target.get(field) != Some(*value))
            .map(|(field, _)| field),
        UpdatePolicy::RevisionMarker(marker) => match (source.get(marker), target.get(marker)) {
            (Some(s), Some(t)) if s == t => None,
            _ => Some(marker),
        },
    }
}

pub fn needs_update(collection: Collection, source: &Record, target: &Record) -> bool {
    first_difference(collection, source, target).is_some()
}

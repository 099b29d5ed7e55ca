use diesel::prelude::*;

use super::schema::{feature_model_0330, user};
use crate::record::{Collection, FieldValue, Record};
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Identifiable, Insertable, AsChangeset)]
#[diesel(table_name = user)]
#[diesel(treat_none_as_null = true)]
pub struct User {
    pub id: i64,
    pub uid: String,
    pub pic_md5: Option<Vec<u8>>,
    pub province_code: String,
    pub city_code: String,
    pub town_code: String,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Identifiable, Insertable, AsChangeset)]
#[diesel(table_name = feature_model_0330)]
#[diesel(treat_none_as_null = true)]
pub struct FeatureModel0330 {
    pub id: i64,
    pub user_id: i64,
    pub timestamp: i64,
    pub feature_id: Option<String>,
    pub feature: Option<Vec<u8>>,
    pub province_code: String,
    pub city_code: String,
    pub town_code: String,
}

impl From<User> for Record {
    fn from(row: User) -> Self {
        Record::new()
            .with("id", row.id)
            .with("uid", row.uid)
            .with("pic_md5", row.pic_md5)
            .with("province_code", row.province_code)
            .with("city_code", row.city_code)
            .with("town_code", row.town_code)
    }
}

impl From<FeatureModel0330> for Record {
    fn from(row: FeatureModel0330) -> Self {
        Record::new()
            .with("id", row.id)
            .with("user_id", row.user_id)
            .with("timestamp", row.timestamp)
            .with("feature_id", row.feature_id)
            .with("feature", row.feature)
            .with("province_code", row.province_code)
            .with("city_code", row.city_code)
            .with("town_code", row.town_code)
    }
}

/// Typed field extraction from a wire record; every failure names the offending field.
struct Fields<'a> {
    collection: Collection,
    record: &'a Record,
}

impl<'a> Fields<'a> {
    fn value(&self, field: &str) -> Result<&'a FieldValue, StoreError> {
        self.record.get(field).ok_or_else(|| {
            StoreError::invalid_record(self.collection, format!("missing field `{field}`"))
        })
    }

    fn wrong_type(&self, field: &str, expected: &str) -> StoreError {
        StoreError::invalid_record(
            self.collection,
            format!("field `{field}` is not {expected}"),
        )
    }

    fn int(&self, field: &str) -> Result<i64, StoreError> {
        match self.value(field)? {
            FieldValue::Int(v) => Ok(*v),
            FieldValue::Text(s) => s.parse().map_err(|_| self.wrong_type(field, "an integer")),
            _ => Err(self.wrong_type(field, "an integer")),
        }
    }

    fn text(&self, field: &str) -> Result<String, StoreError> {
        match self.value(field)? {
            FieldValue::Text(s) => Ok(s.clone()),
            FieldValue::Int(v) => Ok(v.to_string()),
            _ => Err(self.wrong_type(field, "text")),
        }
    }

    fn opt_text(&self, field: &str) -> Result<Option<String>, StoreError> {
        match self.record.get(field) {
            None | Some(FieldValue::Null) => Ok(None),
            Some(_) => self.text(field).map(Some),
        }
    }

    fn opt_bytes(&self, field: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self.record.get(field) {
            None | Some(FieldValue::Null) => Ok(None),
            Some(FieldValue::Bytes(b)) => Ok(Some(b.clone())),
            Some(FieldValue::Text(s)) => Ok(Some(s.clone().into_bytes())),
            Some(_) => Err(self.wrong_type(field, "binary")),
        }
    }
}

impl TryFrom<&Record> for User {
    type Error = StoreError;

    fn try_from(record: &Record) -> Result<Self, Self::Error> {
        let f = Fields {
            collection: Collection::User,
            record,
        };
        Ok(Self {
            id: f.int("id")?,
            uid: f.text("uid")?,
            pic_md5: f.opt_bytes("pic_md5")?,
            province_code: f.text("province_code")?,
            city_code: f.text("city_code")?,
            town_code: f.text("town_code")?,
        })
    }
}

impl TryFrom<&Record> for FeatureModel0330 {
    type Error = StoreError;

    fn try_from(record: &Record) -> Result<Self, Self::Error> {
        let f = Fields {
            collection: Collection::FeatureModel0330,
            record,
        };
        Ok(Self {
            id: f.int("id")?,
            user_id: f.int("user_id")?,
            timestamp: f.int("timestamp")?,
            feature_id: f.opt_text("feature_id")?,
            feature: f.opt_bytes("feature")?,
            province_code: f.text("province_code")?,
            city_code: f.text("city_code")?,
            town_code: f.text("town_code")?,
        })
    }
}

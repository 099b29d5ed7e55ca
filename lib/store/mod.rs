//! Store contracts the reconciliation engine runs against, plus the adapters that satisfy
//! them: MySQL (source, and the target server's backend), the HTTP command channel
//! (target, as seen by the client) and an in-memory store.

mod error_mapping;
pub mod http;
pub mod memory;
pub mod mysql;
pub mod retry;

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::codec::CodecError;
use crate::record::{Collection, Record};

pub use retry::RetryPolicy;

/// Largest page any range query returns.
pub const MAX_PAGE_LIMIT: usize = 1000;

/// Town code meaning "do not partition below city level".
pub const WILDCARD_TOWN: &str = "-1";

/// Partition key restricting which rows a query considers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    pub province_code: String,
    pub city_code: String,
    pub town_code: String,
}

impl Scope {
    pub fn new(
        province_code: impl Into<String>,
        city_code: impl Into<String>,
        town_code: Option<String>,
    ) -> Self {
        let town_code = town_code
            .filter(|code| !code.trim().is_empty())
            .unwrap_or_else(|| WILDCARD_TOWN.to_string());
        Self {
            province_code: province_code.into(),
            city_code: city_code.into(),
            town_code,
        }
    }

    /// Town to filter on, or `None` for the wildcard.
    pub fn town_filter(&self) -> Option<&str> {
        (self.town_code != WILDCARD_TOWN).then_some(self.town_code.as_str())
    }

    /// Whether a row's partition columns fall inside this scope.
    pub fn contains(&self, record: &Record) -> bool {
        let text = |field: &str| record.get(field).and_then(|v| v.as_text());
        text("province_code") == Some(self.province_code.as_str())
            && text("city_code") == Some(self.city_code.as_str())
            && self
                .town_filter()
                .map_or(true, |town| text("town_code") == Some(town))
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.province_code, self.city_code, self.town_code
        )
    }
}

/// Id window `(begin_id, end_id]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    pub begin_id: i64,
    pub end_id: i64,
}

impl IdRange {
    pub fn new(begin_id: i64, end_id: i64) -> Self {
        Self { begin_id, end_id }
    }

    pub fn is_empty(&self) -> bool {
        self.begin_id >= self.end_id
    }

    pub fn contains(&self, id: i64) -> bool {
        id > self.begin_id && id <= self.end_id
    }
}

impl fmt::Display for IdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}]", self.begin_id, self.end_id)
    }
}

/// Highest id per collection for one scope; -1 when the collection is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighWaterMarks {
    #[serde(rename = "user_id")]
    pub user: i64,
    #[serde(rename = "feature_model_0330_id")]
    pub feature_model_0330: i64,
}

impl HighWaterMarks {
    pub const EMPTY: HighWaterMarks = HighWaterMarks {
        user: -1,
        feature_model_0330: -1,
    };

    pub fn get(&self, collection: Collection) -> i64 {
        match collection {
            Collection::User => self.user,
            Collection::FeatureModel0330 => self.feature_model_0330,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted(u64),
    /// A live foreign reference still points at the row; nothing was deleted.
    DependencyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Insert,
    Delete,
    Update,
}

impl fmt::Display for WriteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WriteOp::Insert => "insert",
            WriteOp::Delete => "delete",
            WriteOp::Update => "update",
        })
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    /// Transport or connection failure; safe to retry the same operation.
    #[error("connection error: {0}")]
    Connection(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("connection pool error: {0}")]
    Pool(String),

    /// The remote side answered with a non-zero envelope code.
    #[error("remote rejected request (code {code}): {desc}")]
    Rejected { code: i64, desc: String },

    #[error("{op} of {collection} id {id} affected no rows")]
    NoRowsAffected {
        collection: Collection,
        op: WriteOp,
        id: i64,
    },

    #[error("{collection} has no revision marker to query")]
    NoRevisionMarker { collection: Collection },

    #[error("malformed response: {0}")]
    Decode(String),

    #[error("invalid {collection} record: {message}")]
    InvalidRecord {
        collection: Collection,
        message: String,
    },

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Connection(_) | StoreError::Pool(_))
    }

    pub fn invalid_record(collection: Collection, message: impl Into<String>) -> Self {
        StoreError::InvalidRecord {
            collection,
            message: message.into(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Read access to one side of the sync.
///
/// Range queries return at most `limit` rows with ids inside `range`, ascending by id.
/// Callers must not assume the whole window came back, only a prefix of it.
pub trait SourceStore: Send + Sync {
    fn get_sync_status<'a>(&'a self, scope: &'a Scope) -> BoxFuture<'a, StoreResult<HighWaterMarks>>;

    fn query_id_range<'a>(
        &'a self,
        collection: Collection,
        scope: &'a Scope,
        range: IdRange,
        limit: usize,
    ) -> BoxFuture<'a, StoreResult<Vec<i64>>>;

    fn query_row_range<'a>(
        &'a self,
        collection: Collection,
        scope: &'a Scope,
        range: IdRange,
        limit: usize,
    ) -> BoxFuture<'a, StoreResult<Vec<Record>>>;
}

/// Read/write access to the mirrored side.
///
/// Every write that touches zero rows fails with [`StoreError::NoRowsAffected`].
pub trait TargetStore: SourceStore {
    /// Like `query_row_range`, but each row carries only `id` and the collection's revision
    /// marker. Collections without a marker fail with [`StoreError::NoRevisionMarker`].
    fn query_revision_range<'a>(
        &'a self,
        collection: Collection,
        scope: &'a Scope,
        range: IdRange,
        limit: usize,
    ) -> BoxFuture<'a, StoreResult<Vec<Record>>>;

    fn insert<'a>(&'a self, collection: Collection, record: &'a Record) -> BoxFuture<'a, StoreResult<u64>>;

    fn delete_by_id<'a>(&'a self, collection: Collection, id: i64) -> BoxFuture<'a, StoreResult<DeleteOutcome>>;

    fn update<'a>(&'a self, collection: Collection, record: &'a Record) -> BoxFuture<'a, StoreResult<u64>>;
}

impl<T> SourceStore for Arc<T>
where
    T: SourceStore + ?Sized,
{
    fn get_sync_status<'a>(&'a self, scope: &'a Scope) -> BoxFuture<'a, StoreResult<HighWaterMarks>> {
        (**self).get_sync_status(scope)
    }

    fn query_id_range<'a>(
        &'a self,
        collection: Collection,
        scope: &'a Scope,
        range: IdRange,
        limit: usize,
    ) -> BoxFuture<'a, StoreResult<Vec<i64>>> {
        (**self).query_id_range(collection, scope, range, limit)
    }

    fn query_row_range<'a>(
        &'a self,
        collection: Collection,
        scope: &'a Scope,
        range: IdRange,
        limit: usize,
    ) -> BoxFuture<'a, StoreResult<Vec<Record>>> {
        (**self).query_row_range(collection, scope, range, limit)
    }
}

impl<T> TargetStore for Arc<T>
where
    T: TargetStore + ?Sized,
{
    fn query_revision_range<'a>(
        &'a self,
        collection: Collection,
        scope: &'a Scope,
        range: IdRange,
        limit: usize,
    ) -> BoxFuture<'a, StoreResult<Vec<Record>>> {
        (**self).query_revision_range(collection, scope, range, limit)
    }

    fn insert<'a>(&'a self, collection: Collection, record: &'a Record) -> BoxFuture<'a, StoreResult<u64>> {
        (**self).insert(collection, record)
    }

    fn delete_by_id<'a>(&'a self, collection: Collection, id: i64) -> BoxFuture<'a, StoreResult<DeleteOutcome>> {
        (**self).delete_by_id(collection, id)
    }

    fn update<'a>(&'a self, collection: Collection, record: &'a Record) -> BoxFuture<'a, StoreResult<u64>> {
        (**self).update(collection, record)
    }
}

/// The revision marker of `collection`, or the error reported when it has none.
pub fn require_revision_marker(collection: Collection) -> StoreResult<&'static str> {
    collection
        .revision_marker()
        .ok_or(StoreError::NoRevisionMarker { collection })
}

/// Clamps a requested page size into `1..=MAX_PAGE_LIMIT`.
pub fn clamp_limit(limit: usize) -> usize {
    limit.clamp(1, MAX_PAGE_LIMIT)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(province: &str, city: &str, town: &str) -> Record {
        Record::new()
            .with("id", 1)
            .with("province_code", province)
            .with("city_code", city)
            .with("town_code", town)
    }

    #[test]
    fn blank_town_code_becomes_wildcard() {
        let scope = Scope::new("510000", "511100", Some("  ".to_string()));
        assert_eq!(scope.town_code, WILDCARD_TOWN);
        assert_eq!(scope.town_filter(), None);
        assert_eq!(Scope::new("510000", "511100", None).town_filter(), None);
    }

    #[test]
    fn wildcard_scope_ignores_town() {
        let scope = Scope::new("510000", "511100", None);
        assert!(scope.contains(&row("510000", "511100", "511102")));
        assert!(scope.contains(&row("510000", "511100", "511103")));
        assert!(!scope.contains(&row("510000", "511200", "511102")));
    }

    #[test]
    fn town_scope_filters_town() {
        let scope = Scope::new("510000", "511100", Some("511102".into()));
        assert!(scope.contains(&row("510000", "511100", "511102")));
        assert!(!scope.contains(&row("510000", "511100", "511103")));
    }

    #[test]
    fn id_range_is_open_closed() {
        let range = IdRange::new(-1, 3);
        assert!(!range.contains(-1));
        assert!(range.contains(0));
        assert!(range.contains(3));
        assert!(!range.contains(4));
        assert!(IdRange::new(5, 5).is_empty());
    }

    #[test]
    fn high_water_marks_use_wire_names() {
        let marks: HighWaterMarks =
            serde_json::from_str(r#"{"user_id": 12, "feature_model_0330_id": -1}"#).unwrap();
        assert_eq!(marks.get(Collection::User), 12);
        assert_eq!(marks.get(Collection::FeatureModel0330), -1);
    }

    #[test]
    fn only_connection_class_errors_retry() {
        assert!(StoreError::Connection("reset".into()).is_retryable());
        assert!(StoreError::Pool("timeout".into()).is_retryable());
        assert!(!StoreError::Rejected {
            code: 101,
            desc: "no support command".into()
        }
        .is_retryable());
        assert!(!StoreError::NoRowsAffected {
            collection: Collection::User,
            op: WriteOp::Insert,
            id: 3
        }
        .is_retryable());
    }

    #[test]
    fn limits_are_clamped() {
        assert_eq!(clamp_limit(0), 1);
        assert_eq!(clamp_limit(50), 50);
        assert_eq!(clamp_limit(5000), MAX_PAGE_LIMIT);
    }
}

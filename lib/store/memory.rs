use std::collections::{BTreeMap, HashSet};

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::Mutex;

use super::{
    clamp_limit, require_revision_marker, DeleteOutcome, HighWaterMarks, IdRange, Scope,
    SourceStore, StoreError, StoreResult, TargetStore, WriteOp,
};
use crate::record::{Collection, FieldValue, Record};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub op: WriteOp,
    pub collection: Collection,
    pub id: i64,
}

#[derive(Default)]
struct State {
    tables: BTreeMap<Collection, BTreeMap<i64, Record>>,
    journal: Vec<JournalEntry>,
    failing_writes: HashSet<(Collection, i64)>,
}

impl State {
    fn table(&self, collection: Collection) -> impl Iterator<Item = &Record> {
        self.tables.get(&collection).into_iter().flat_map(|rows| rows.values())
    }

    fn table_mut(&mut self, collection: Collection) -> &mut BTreeMap<i64, Record> {
        self.tables.entry(collection).or_default()
    }

    fn max_id(&self, collection: Collection, scope: &Scope) -> i64 {
        self.table(collection)
            .filter(|row| scope.contains(row))
            .filter_map(Record::id)
            .max()
            .unwrap_or(-1)
    }

    fn page(
        &self,
        collection: Collection,
        scope: &Scope,
        range: IdRange,
        limit: usize,
    ) -> Vec<&Record> {
        let Some(rows) = self.tables.get(&collection) else {
            return Vec::new();
        };
        if range.is_empty() {
            return Vec::new();
        }
        rows.range(range.begin_id.saturating_add(1)..=range.end_id)
            .map(|(_, row)| row)
            .filter(|row| scope.contains(row))
            .take(clamp_limit(limit))
            .collect()
    }

    fn check_injected_failure(&self, collection: Collection, id: i64) -> StoreResult<()> {
        if self.failing_writes.contains(&(collection, id)) {
            return Err(StoreError::Connection(format!(
                "injected failure writing {collection} id {id}"
            )));
        }
        Ok(())
    }
}

/// In-process store holding both collections in ordered maps.
///
/// Behaves like the MySQL store at the contract level (scope filtering, duplicate keys,
/// zero-row writes, the user dependency check) and records every successful write in a
/// journal.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads rows directly, bypassing the journal. Rows without an integer id are ignored.
    pub async fn seed(&self, collection: Collection, rows: impl IntoIterator<Item = Record>) {
        let mut state = self.state.lock().await;
        let table = state.table_mut(collection);
        for row in rows {
            if let Some(id) = row.id() {
                table.insert(id, row);
            }
        }
    }

    /// Every row of `collection` regardless of scope, ascending by id.
    pub async fn rows(&self, collection: Collection) -> Vec<Record> {
        self.state.lock().await.table(collection).cloned().collect()
    }

    pub async fn ids(&self, collection: Collection) -> Vec<i64> {
        self.state
            .lock()
            .await
            .table(collection)
            .filter_map(Record::id)
            .collect()
    }

    pub async fn journal(&self) -> Vec<JournalEntry> {
        self.state.lock().await.journal.clone()
    }

    pub async fn take_journal(&self) -> Vec<JournalEntry> {
        std::mem::take(&mut self.state.lock().await.journal)
    }

    /// Makes every write touching `(collection, id)` fail with a connection error.
    pub async fn fail_writes_for(&self, collection: Collection, id: i64) {
        self.state
            .lock()
            .await
            .failing_writes
            .insert((collection, id));
    }
}

fn require_id(collection: Collection, record: &Record) -> StoreResult<i64> {
    record
        .id()
        .ok_or_else(|| StoreError::invalid_record(collection, "record has no integer `id`"))
}

impl SourceStore for MemoryStore {
    fn get_sync_status<'a>(&'a self, scope: &'a Scope) -> BoxFuture<'a, StoreResult<HighWaterMarks>> {
        async move {
            let state = self.state.lock().await;
            Ok(HighWaterMarks {
                user: state.max_id(Collection::User, scope),
                feature_model_0330: state.max_id(Collection::FeatureModel0330, scope),
            })
        }
        .boxed()
    }

    fn query_id_range<'a>(
        &'a self,
        collection: Collection,
        scope: &'a Scope,
        range: IdRange,
        limit: usize,
    ) -> BoxFuture<'a, StoreResult<Vec<i64>>> {
        async move {
            let state = self.state.lock().await;
            Ok(state
                .page(collection, scope, range, limit)
                .into_iter()
                .filter_map(Record::id)
                .collect())
        }
        .boxed()
    }

    fn query_row_range<'a>(
        &'a self,
        collection: Collection,
        scope: &'a Scope,
        range: IdRange,
        limit: usize,
    ) -> BoxFuture<'a, StoreResult<Vec<Record>>> {
        async move {
            let state = self.state.lock().await;
            Ok(state
                .page(collection, scope, range, limit)
                .into_iter()
                .cloned()
                .collect())
        }
        .boxed()
    }
}

impl TargetStore for MemoryStore {
    fn query_revision_range<'a>(
        &'a self,
        collection: Collection,
        scope: &'a Scope,
        range: IdRange,
        limit: usize,
    ) -> BoxFuture<'a, StoreResult<Vec<Record>>> {
        async move {
            let marker = require_revision_marker(collection)?;
            let state = self.state.lock().await;
            Ok(state
                .page(collection, scope, range, limit)
                .into_iter()
                .map(|row| row.project(&[marker]))
                .collect())
        }
        .boxed()
    }

    fn insert<'a>(&'a self, collection: Collection, record: &'a Record) -> BoxFuture<'a, StoreResult<u64>> {
        async move {
            let id = require_id(collection, record)?;
            let mut state = self.state.lock().await;
            state.check_injected_failure(collection, id)?;
            let table = state.table_mut(collection);
            if table.contains_key(&id) {
                return Err(StoreError::Database(format!(
                    "Duplicate entry '{id}' for key '{collection}.PRIMARY'"
                )));
            }
            table.insert(id, record.clone());
            state.journal.push(JournalEntry {
                op: WriteOp::Insert,
                collection,
                id,
            });
            Ok(1)
        }
        .boxed()
    }

    fn delete_by_id<'a>(&'a self, collection: Collection, id: i64) -> BoxFuture<'a, StoreResult<DeleteOutcome>> {
        async move {
            let mut state = self.state.lock().await;
            state.check_injected_failure(collection, id)?;
            if collection == Collection::User {
                let referenced = state
                    .table(Collection::FeatureModel0330)
                    .any(|row| row.get("user_id") == Some(&FieldValue::Int(id)));
                if referenced {
                    return Ok(DeleteOutcome::DependencyExists);
                }
            }
            if state.table_mut(collection).remove(&id).is_none() {
                return Err(StoreError::NoRowsAffected {
                    collection,
                    op: WriteOp::Delete,
                    id,
                });
            }
            state.journal.push(JournalEntry {
                op: WriteOp::Delete,
                collection,
                id,
            });
            Ok(DeleteOutcome::Deleted(1))
        }
        .boxed()
    }

    fn update<'a>(&'a self, collection: Collection, record: &'a Record) -> BoxFuture<'a, StoreResult<u64>> {
        async move {
            let id = require_id(collection, record)?;
            let mut state = self.state.lock().await;
            state.check_injected_failure(collection, id)?;
            match state.table_mut(collection).get_mut(&id) {
                Some(row) => *row = record.clone(),
                None => {
                    return Err(StoreError::NoRowsAffected {
                        collection,
                        op: WriteOp::Update,
                        id,
                    })
                }
            }
            state.journal.push(JournalEntry {
                op: WriteOp::Update,
                collection,
                id,
            });
            Ok(1)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: i64, town: &str) -> Record {
        Record::new()
            .with("id", id)
            .with("uid", format!("u{id}"))
            .with("province_code", "510000")
            .with("city_code", "511100")
            .with("town_code", town)
    }

    #[tokio::test]
    async fn pages_are_scoped_bounded_and_ascending() {
        let store = MemoryStore::new();
        store
            .seed(
                Collection::User,
                [user(5, "a"), user(1, "a"), user(3, "b"), user(4, "a"), user(2, "a")],
            )
            .await;

        let scope = Scope::new("510000", "511100", Some("a".into()));
        let ids = store
            .query_id_range(Collection::User, &scope, IdRange::new(1, 5), 2)
            .await
            .unwrap();
        assert_eq!(ids, vec![2, 4]);

        let all = Scope::new("510000", "511100", None);
        let marks = store.get_sync_status(&all).await.unwrap();
        assert_eq!(marks.user, 5);
        assert_eq!(marks.feature_model_0330, -1);
    }

    #[tokio::test]
    async fn writes_follow_row_count_rules() {
        let store = MemoryStore::new();
        assert_eq!(store.insert(Collection::User, &user(1, "a")).await.unwrap(), 1);
        assert!(matches!(
            store.insert(Collection::User, &user(1, "a")).await,
            Err(StoreError::Database(_))
        ));
        assert!(matches!(
            store.update(Collection::User, &user(2, "a")).await,
            Err(StoreError::NoRowsAffected { id: 2, .. })
        ));
        assert!(matches!(
            store.delete_by_id(Collection::User, 2).await,
            Err(StoreError::NoRowsAffected { id: 2, .. })
        ));
        assert_eq!(
            store.delete_by_id(Collection::User, 1).await.unwrap(),
            DeleteOutcome::Deleted(1)
        );

        let ops: Vec<_> = store.journal().await.into_iter().map(|e| e.op).collect();
        assert_eq!(ops, vec![WriteOp::Insert, WriteOp::Delete]);
    }

    #[tokio::test]
    async fn injected_failure_is_retryable() {
        let store = MemoryStore::new();
        store.fail_writes_for(Collection::User, 7).await;
        let err = store.insert(Collection::User, &user(7, "a")).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(store.ids(Collection::User).await.is_empty());
    }

    #[tokio::test]
    async fn revision_range_projects_the_marker() {
        let store = MemoryStore::new();
        let feature = |id: i64, timestamp: i64| {
            Record::new()
                .with("id", id)
                .with("timestamp", timestamp)
                .with("feature", vec![1u8; 64])
                .with("province_code", "510000")
                .with("city_code", "511100")
                .with("town_code", "a")
        };
        store
            .seed(Collection::FeatureModel0330, [feature(1, 10), feature(2, 20), feature(3, 30)])
            .await;

        let scope = Scope::new("510000", "511100", None);
        let rows = store
            .query_revision_range(Collection::FeatureModel0330, &scope, IdRange::new(1, 3), 1000)
            .await
            .unwrap();
        assert_eq!(
            rows,
            vec![
                Record::new().with("id", 2).with("timestamp", 20),
                Record::new().with("id", 3).with("timestamp", 30),
            ]
        );

        assert!(matches!(
            store
                .query_revision_range(Collection::User, &scope, IdRange::new(-1, 3), 1000)
                .await,
            Err(StoreError::NoRevisionMarker {
                collection: Collection::User
            })
        ));
    }
}

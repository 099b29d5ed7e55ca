use diesel::mysql::Mysql;
use diesel::prelude::*;
use diesel::sql_types::BigInt;
use diesel_async::{AsyncMysqlConnection, RunQueryDsl};
use futures::future::{BoxFuture, FutureExt};
use log::{debug, info};

use super::error_mapping::{map_diesel_error, map_pool_error};
use super::retry::run_with_retry;
use super::{
    clamp_limit, require_revision_marker, DeleteOutcome, HighWaterMarks, IdRange, RetryPolicy,
    Scope, SourceStore, StoreError, StoreResult, TargetStore, WriteOp,
};
use crate::db::models::{FeatureModel0330, User};
use crate::db::schema::{feature_model_0330, user};
use crate::db::DbPool;
use crate::record::{Collection, Record};

/// Store backed by a MySQL database holding the `user` and `feature_model_0330` tables.
///
/// Used as the cloud source by the client and as the backing store of the target server.
/// Every operation checks out a fresh pooled connection per attempt, so a retry after a
/// dropped connection reconnects.
#[derive(Clone)]
pub struct MysqlStore {
    pool: DbPool,
    retry: RetryPolicy,
}

impl MysqlStore {
    pub fn new(pool: DbPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

fn scoped_users<'a>(scope: &'a Scope) -> user::BoxedQuery<'a, Mysql> {
    let mut query = user::table
        .into_boxed()
        .filter(user::province_code.eq(scope.province_code.as_str()))
        .filter(user::city_code.eq(scope.city_code.as_str()));
    if let Some(town) = scope.town_filter() {
        query = query.filter(user::town_code.eq(town));
    }
    query
}

fn scoped_features<'a>(scope: &'a Scope) -> feature_model_0330::BoxedQuery<'a, Mysql> {
    let mut query = feature_model_0330::table
        .into_boxed()
        .filter(feature_model_0330::province_code.eq(scope.province_code.as_str()))
        .filter(feature_model_0330::city_code.eq(scope.city_code.as_str()));
    if let Some(town) = scope.town_filter() {
        query = query.filter(feature_model_0330::town_code.eq(town));
    }
    query
}

async fn max_id(
    conn: &mut AsyncMysqlConnection,
    collection: Collection,
    scope: &Scope,
) -> Result<i64, diesel::result::Error> {
    let res: Option<i64> = match collection {
        Collection::User => {
            scoped_users(scope)
                .select(diesel::dsl::max(user::id))
                .get_result(conn)
                .await?
        }
        Collection::FeatureModel0330 => {
            scoped_features(scope)
                .select(diesel::dsl::max(feature_model_0330::id))
                .get_result(conn)
                .await?
        }
    };
    Ok(res.unwrap_or(-1))
}

async fn load_ids(
    conn: &mut AsyncMysqlConnection,
    collection: Collection,
    scope: &Scope,
    range: IdRange,
    limit: i64,
) -> Result<Vec<i64>, diesel::result::Error> {
    match collection {
        Collection::User => {
            scoped_users(scope)
                .filter(user::id.gt(range.begin_id))
                .filter(user::id.le(range.end_id))
                .select(user::id)
                .order(user::id.asc())
                .limit(limit)
                .load(conn)
                .await
        }
        Collection::FeatureModel0330 => {
            scoped_features(scope)
                .filter(feature_model_0330::id.gt(range.begin_id))
                .filter(feature_model_0330::id.le(range.end_id))
                .select(feature_model_0330::id)
                .order(feature_model_0330::id.asc())
                .limit(limit)
                .load(conn)
                .await
        }
    }
}

async fn load_rows(
    conn: &mut AsyncMysqlConnection,
    collection: Collection,
    scope: &Scope,
    range: IdRange,
    limit: i64,
) -> Result<Vec<Record>, diesel::result::Error> {
    let rows = match collection {
        Collection::User => scoped_users(scope)
            .filter(user::id.gt(range.begin_id))
            .filter(user::id.le(range.end_id))
            .select(User::as_select())
            .order(user::id.asc())
            .limit(limit)
            .load::<User>(conn)
            .await?
            .into_iter()
            .map(Record::from)
            .collect(),
        Collection::FeatureModel0330 => scoped_features(scope)
            .filter(feature_model_0330::id.gt(range.begin_id))
            .filter(feature_model_0330::id.le(range.end_id))
            .select(FeatureModel0330::as_select())
            .order(feature_model_0330::id.asc())
            .limit(limit)
            .load::<FeatureModel0330>(conn)
            .await?
            .into_iter()
            .map(Record::from)
            .collect(),
    };
    Ok(rows)
}

fn revisions_query<'a>(
    scope: &'a Scope,
    range: IdRange,
    limit: i64,
) -> feature_model_0330::BoxedQuery<'a, Mysql, (BigInt, BigInt)> {
    scoped_features(scope)
        .filter(feature_model_0330::id.gt(range.begin_id))
        .filter(feature_model_0330::id.le(range.end_id))
        .select((feature_model_0330::id, feature_model_0330::timestamp))
        .order(feature_model_0330::id.asc())
        .limit(limit)
}

/// `id` plus the revision marker of each feature row, without the blob.
async fn load_revisions(
    conn: &mut AsyncMysqlConnection,
    marker: &'static str,
    scope: &Scope,
    range: IdRange,
    limit: i64,
) -> Result<Vec<Record>, diesel::result::Error> {
    let rows: Vec<(i64, i64)> = revisions_query(scope, range, limit).load(conn).await?;
    Ok(rows
        .into_iter()
        .map(|(id, revision)| Record::new().with("id", id).with(marker, revision))
        .collect())
}

/// Typed form of an incoming record, validated before any connection is checked out.
enum TypedRow {
    User(User),
    Feature(FeatureModel0330),
}

impl TypedRow {
    fn parse(collection: Collection, record: &Record) -> StoreResult<Self> {
        Ok(match collection {
            Collection::User => TypedRow::User(User::try_from(record)?),
            Collection::FeatureModel0330 => TypedRow::Feature(FeatureModel0330::try_from(record)?),
        })
    }

    fn id(&self) -> i64 {
        match self {
            TypedRow::User(row) => row.id,
            TypedRow::Feature(row) => row.id,
        }
    }
}

fn affected(collection: Collection, op: WriteOp, id: i64, rows: usize) -> StoreResult<u64> {
    if rows == 0 {
        return Err(StoreError::NoRowsAffected { collection, op, id });
    }
    Ok(rows as u64)
}

impl SourceStore for MysqlStore {
    fn get_sync_status<'a>(&'a self, scope: &'a Scope) -> BoxFuture<'a, StoreResult<HighWaterMarks>> {
        async move {
            let marks = run_with_retry(&self.retry, "get_sync_status", 0, |_| async move {
                let mut conn = self.pool.get().await.map_err(map_pool_error)?;
                let user = max_id(&mut conn, Collection::User, scope)
                    .await
                    .map_err(map_diesel_error)?;
                let feature_model_0330 = max_id(&mut conn, Collection::FeatureModel0330, scope)
                    .await
                    .map_err(map_diesel_error)?;
                Ok(HighWaterMarks {
                    user,
                    feature_model_0330,
                })
            })
            .await?;
            debug!("sync status for {scope}: {marks:?}");
            Ok(marks)
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
            if range.is_empty() {
                return Ok(Vec::new());
            }
            let limit = clamp_limit(limit) as i64;
            run_with_retry(&self.retry, "query_id_range", range.begin_id, |_| async move {
                let mut conn = self.pool.get().await.map_err(map_pool_error)?;
                load_ids(&mut conn, collection, scope, range, limit)
                    .await
                    .map_err(map_diesel_error)
            })
            .await
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
            if range.is_empty() {
                return Ok(Vec::new());
            }
            let limit = clamp_limit(limit) as i64;
            run_with_retry(&self.retry, "query_row_range", range.begin_id, |_| async move {
                let mut conn = self.pool.get().await.map_err(map_pool_error)?;
                load_rows(&mut conn, collection, scope, range, limit)
                    .await
                    .map_err(map_diesel_error)
            })
            .await
        }
        .boxed()
    }
}

impl TargetStore for MysqlStore {
    fn query_revision_range<'a>(
        &'a self,
        collection: Collection,
        scope: &'a Scope,
        range: IdRange,
        limit: usize,
    ) -> BoxFuture<'a, StoreResult<Vec<Record>>> {
        async move {
            let marker = require_revision_marker(collection)?;
            if collection != Collection::FeatureModel0330 {
                return Err(StoreError::NoRevisionMarker { collection });
            }
            if range.is_empty() {
                return Ok(Vec::new());
            }
            let limit = clamp_limit(limit) as i64;
            run_with_retry(&self.retry, "query_revision_range", range.begin_id, |_| async move {
                let mut conn = self.pool.get().await.map_err(map_pool_error)?;
                load_revisions(&mut conn, marker, scope, range, limit)
                    .await
                    .map_err(map_diesel_error)
            })
            .await
        }
        .boxed()
    }

    fn insert<'a>(&'a self, collection: Collection, record: &'a Record) -> BoxFuture<'a, StoreResult<u64>> {
        async move {
            let row = TypedRow::parse(collection, record)?;
            let id = row.id();
            let row = &row;
            let rows = run_with_retry(&self.retry, "insert", id, |_| async move {
                let mut conn = self.pool.get().await.map_err(map_pool_error)?;
                let res = match row {
                    TypedRow::User(row) => {
                        diesel::insert_into(user::table)
                            .values(row)
                            .execute(&mut conn)
                            .await
                    }
                    TypedRow::Feature(row) => {
                        diesel::insert_into(feature_model_0330::table)
                            .values(row)
                            .execute(&mut conn)
                            .await
                    }
                };
                res.map_err(map_diesel_error)
            })
            .await?;
            debug!("inserted {collection} id {id}");
            affected(collection, WriteOp::Insert, id, rows)
        }
        .boxed()
    }

    fn delete_by_id<'a>(&'a self, collection: Collection, id: i64) -> BoxFuture<'a, StoreResult<DeleteOutcome>> {
        async move {
            run_with_retry(&self.retry, "delete_by_id", id, |_| async move {
                let mut conn = self.pool.get().await.map_err(map_pool_error)?;
                let res = match collection {
                    Collection::User => {
                        let dependent: Option<i64> = feature_model_0330::table
                            .filter(feature_model_0330::user_id.eq(id))
                            .select(feature_model_0330::id)
                            .first(&mut conn)
                            .await
                            .optional()
                            .map_err(map_diesel_error)?;
                        if let Some(feature_id) = dependent {
                            info!(
                                "keeping user {id}: still referenced by feature_model_0330 {feature_id}"
                            );
                            return Ok(DeleteOutcome::DependencyExists);
                        }
                        diesel::delete(user::table.find(id))
                            .execute(&mut conn)
                            .await
                    }
                    Collection::FeatureModel0330 => {
                        diesel::delete(feature_model_0330::table.find(id))
                            .execute(&mut conn)
                            .await
                    }
                };
                let rows = res.map_err(map_diesel_error)?;
                affected(collection, WriteOp::Delete, id, rows).map(DeleteOutcome::Deleted)
            })
            .await
        }
        .boxed()
    }

    fn update<'a>(&'a self, collection: Collection, record: &'a Record) -> BoxFuture<'a, StoreResult<u64>> {
        async move {
            let row = TypedRow::parse(collection, record)?;
            let id = row.id();
            let row = &row;
            let rows = run_with_retry(&self.retry, "update", id, |_| async move {
                let mut conn = self.pool.get().await.map_err(map_pool_error)?;
                let res = match row {
                    TypedRow::User(row) => {
                        diesel::update(user::table.find(row.id))
                            .set(row)
                            .execute(&mut conn)
                            .await
                    }
                    TypedRow::Feature(row) => {
                        diesel::update(feature_model_0330::table.find(row.id))
                            .set(row)
                            .execute(&mut conn)
                            .await
                    }
                };
                res.map_err(map_diesel_error)
            })
            .await?;
            debug!("updated {collection} id {id}");
            affected(collection, WriteOp::Update, id, rows)
        }
        .boxed()
    }
}

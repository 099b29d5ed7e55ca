use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::error_mapping::map_reqwest_error;
use super::retry::run_with_retry;
use super::{
    require_revision_marker, DeleteOutcome, HighWaterMarks, IdRange, RetryPolicy, Scope,
    SourceStore, StoreError, StoreResult, TargetStore, WriteOp,
};
use crate::command::{Command, Envelope, CODE_DEPENDENCY_EXISTS};
use crate::record::codec;
use crate::record::{Collection, Record};

#[derive(Deserialize)]
struct IdRow {
    id: i64,
}

/// Target store reached through the remote `/feature` command API.
///
/// Reads go out as GET query strings, writes as POST bodies; both come back as a
/// `{code, desc, data}` envelope. Binary fields are transcoded by the record codec at this
/// edge only.
pub struct HttpTargetStore {
    client: reqwest::Client,
    endpoint: String,
    retry: RetryPolicy,
}

impl HttpTargetStore {
    pub fn new(base_url: &str, timeout: Duration, retry: RetryPolicy) -> StoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(map_reqwest_error)?;
        Ok(Self::with_client(client, base_url, retry))
    }

    pub fn with_client(client: reqwest::Client, base_url: &str, retry: RetryPolicy) -> Self {
        Self {
            client,
            endpoint: format!("{}/feature", base_url.trim_end_matches('/')),
            retry,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(&self, command: &Command, seed: i64) -> StoreResult<Envelope> {
        let name = command.kind().name();
        run_with_retry(&self.retry, &name, seed, |attempt| async move {
            debug!(event = "target_request", command = %command.kind(), attempt);
            self.send_once(command).await
        })
        .await
    }

    async fn send_once(&self, command: &Command) -> StoreResult<Envelope> {
        let request = match command.to_query() {
            Some(query) => self.client.get(&self.endpoint).query(&query),
            None => self.client.post(&self.endpoint).json(&command.to_body()?),
        };
        let response = request.send().await.map_err(map_reqwest_error)?;
        let response = response.error_for_status().map_err(map_reqwest_error)?;
        response.json::<Envelope>().await.map_err(map_reqwest_error)
    }

    async fn call(&self, command: Command, seed: i64) -> StoreResult<Value> {
        let envelope = self.send(&command, seed).await?;
        into_data(envelope)
    }
}

fn into_data(envelope: Envelope) -> StoreResult<Value> {
    if envelope.is_ok() {
        return Ok(envelope.data);
    }
    Err(StoreError::Rejected {
        code: envelope.code,
        desc: envelope.desc,
    })
}

fn decode_data<T: serde::de::DeserializeOwned>(data: Value) -> StoreResult<T> {
    serde_json::from_value(data).map_err(|err| StoreError::Decode(err.to_string()))
}

fn row_count(collection: Collection, op: WriteOp, id: i64, data: &Value) -> StoreResult<u64> {
    match data.as_u64() {
        Some(0) => Err(StoreError::NoRowsAffected { collection, op, id }),
        Some(rows) => Ok(rows),
        None => Err(StoreError::Decode(format!(
            "expected a row count for {op} of {collection} id {id}, got {data}"
        ))),
    }
}

impl SourceStore for HttpTargetStore {
    fn get_sync_status<'a>(&'a self, scope: &'a Scope) -> BoxFuture<'a, StoreResult<HighWaterMarks>> {
        async move {
            let command = Command::GetSyncStatus {
                scope: scope.clone(),
            };
            decode_data(self.call(command, 0).await?)
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
            let command = Command::QueryIdRange {
                collection,
                scope: scope.clone(),
                range,
                limit,
            };
            let rows: Vec<IdRow> = decode_data(self.call(command, range.begin_id).await?)?;
            Ok(rows.into_iter().map(|row| row.id).collect())
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
            let command = Command::QueryRowRange {
                collection,
                scope: scope.clone(),
                range,
                limit,
            };
            let data = self.call(command, range.begin_id).await?;
            Ok(codec::decode_records(collection, data)?)
        }
        .boxed()
    }
}

impl TargetStore for HttpTargetStore {
    fn query_revision_range<'a>(
        &'a self,
        collection: Collection,
        scope: &'a Scope,
        range: IdRange,
        limit: usize,
    ) -> BoxFuture<'a, StoreResult<Vec<Record>>> {
        async move {
            require_revision_marker(collection)?;
            let command = Command::QueryRevisionRange {
                collection,
                scope: scope.clone(),
                range,
                limit,
            };
            let data = self.call(command, range.begin_id).await?;
            Ok(codec::decode_records(collection, data)?)
        }
        .boxed()
    }

    fn insert<'a>(&'a self, collection: Collection, record: &'a Record) -> BoxFuture<'a, StoreResult<u64>> {
        async move {
            let id = record.id().unwrap_or_default();
            let command = Command::Insert {
                collection,
                record: record.clone(),
            };
            let data = self.call(command, id).await?;
            row_count(collection, WriteOp::Insert, id, &data)
        }
        .boxed()
    }

    fn delete_by_id<'a>(&'a self, collection: Collection, id: i64) -> BoxFuture<'a, StoreResult<DeleteOutcome>> {
        async move {
            let envelope = self
                .send(&Command::DeleteById { collection, id }, id)
                .await?;
            if envelope.code == CODE_DEPENDENCY_EXISTS {
                return Ok(DeleteOutcome::DependencyExists);
            }
            let data = into_data(envelope)?;
            row_count(collection, WriteOp::Delete, id, &data).map(DeleteOutcome::Deleted)
        }
        .boxed()
    }

    fn update<'a>(&'a self, collection: Collection, record: &'a Record) -> BoxFuture<'a, StoreResult<u64>> {
        async move {
            let id = record.id().unwrap_or_default();
            let command = Command::Update {
                collection,
                record: record.clone(),
            };
            let data = self.call(command, id).await?;
            row_count(collection, WriteOp::Update, id, &data)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn endpoint_is_normalised() {
        let store = HttpTargetStore::with_client(
            reqwest::Client::new(),
            "http://10.0.0.2:8000/",
            RetryPolicy::no_retry(),
        );
        assert_eq!(store.endpoint(), "http://10.0.0.2:8000/feature");
    }

    #[test]
    fn non_zero_code_is_rejected() {
        let err = into_data(Envelope::failure(101, "no support command <x>")).unwrap_err();
        assert!(matches!(err, StoreError::Rejected { code: 101, .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn zero_row_count_is_an_error() {
        assert!(matches!(
            row_count(Collection::User, WriteOp::Update, 4, &json!(0)),
            Err(StoreError::NoRowsAffected { id: 4, .. })
        ));
        assert_eq!(
            row_count(Collection::User, WriteOp::Update, 4, &json!(1)).unwrap(),
            1
        );
        assert!(matches!(
            row_count(Collection::User, WriteOp::Update, 4, &json!("ok")),
            Err(StoreError::Decode(_))
        ));
    }
}

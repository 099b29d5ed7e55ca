use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use feature_sync_lib::command::{
    Envelope, CODE_DEPENDENCY_EXISTS, CODE_INVALID_PARAMETER, CODE_UNSUPPORTED,
};
use feature_sync_lib::reconcile::{EngineConfig, ReconciliationEngine};
use feature_sync_lib::record::{Collection, Record};
use feature_sync_lib::server::{command_router, serve};
use feature_sync_lib::store::http::HttpTargetStore;
use feature_sync_lib::store::memory::MemoryStore;
use feature_sync_lib::store::{
    DeleteOutcome, IdRange, RetryPolicy, Scope, SourceStore, StoreError, TargetStore,
};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Command server over an in-memory store, bound to an ephemeral local port.
struct TestServer {
    store: Arc<MemoryStore>,
    addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl TestServer {
    async fn start() -> Self {
        let store = Arc::new(MemoryStore::new());
        let shutdown = CancellationToken::new();
        let (addr, handle) = serve(
            command_router(store.clone()),
            SocketAddr::from(([127, 0, 0, 1], 0)),
            shutdown.clone(),
        )
        .await
        .expect("failed to bind test command server");
        Self {
            store,
            addr,
            shutdown,
            handle,
        }
    }

    fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn client(&self) -> HttpTargetStore {
        HttpTargetStore::new(
            &self.base_url(),
            Duration::from_secs(5),
            RetryPolicy::no_retry(),
        )
        .expect("failed to build HTTP target store")
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.handle.await.expect("server task panicked");
    }
}

fn scope() -> Scope {
    Scope::new("510000", "511100", None)
}

fn user(id: i64, uid: &str, pic: &[u8]) -> Record {
    Record::new()
        .with("id", id)
        .with("uid", uid)
        .with("pic_md5", pic.to_vec())
        .with("province_code", "510000")
        .with("city_code", "511100")
        .with("town_code", "511102")
}

fn feature(id: i64, user_id: i64, timestamp: i64) -> Record {
    Record::new()
        .with("id", id)
        .with("user_id", user_id)
        .with("timestamp", timestamp)
        .with("feature_id", Option::<String>::None)
        .with("feature", vec![0u8, 159, 146, 150, 255])
        .with("province_code", "510000")
        .with("city_code", "511100")
        .with("town_code", "511102")
}

#[tokio::test]
async fn reads_and_writes_travel_through_the_command_api() {
    let server = TestServer::start().await;
    server
        .store
        .seed(Collection::User, [user(1, "a", b"\x01\x02"), user(4, "d", b"")])
        .await;
    let target = server.client();

    let marks = target
        .get_sync_status(&scope())
        .await
        .expect("get_sync_status failed");
    assert_eq!(marks.user, 4);
    assert_eq!(marks.feature_model_0330, -1);

    let ids = target
        .query_id_range(Collection::User, &scope(), IdRange::new(-1, 10), 1000)
        .await
        .expect("query_user_id_range failed");
    assert_eq!(ids, vec![1, 4]);

    let inserted = target
        .insert(Collection::User, &user(2, "b", &[0xff, 0x00, 0x7f]))
        .await
        .expect("add_user failed");
    assert_eq!(inserted, 1);
    assert_eq!(
        server.store.rows(Collection::User).await[1],
        user(2, "b", &[0xff, 0x00, 0x7f]),
        "binary fields must survive the base64 hop unchanged"
    );

    let rows = target
        .query_row_range(Collection::User, &scope(), IdRange::new(1, 4), 1)
        .await
        .expect("query_user_range failed");
    assert_eq!(rows, vec![user(2, "b", &[0xff, 0x00, 0x7f])]);

    let updated = target
        .update(Collection::User, &user(4, "renamed", b"\x09"))
        .await
        .expect("update_user failed");
    assert_eq!(updated, 1);

    server.stop().await;
}

#[tokio::test]
async fn feature_time_range_returns_markers_without_blobs() {
    let server = TestServer::start().await;
    server
        .store
        .seed(
            Collection::FeatureModel0330,
            [feature(3, 1, 300), feature(5, 1, 500), feature(9, 2, 900)],
        )
        .await;
    let target = server.client();

    let markers = target
        .query_revision_range(Collection::FeatureModel0330, &scope(), IdRange::new(3, 9), 1000)
        .await
        .expect("query_feature_model_0330_time_range failed");
    assert_eq!(
        markers,
        vec![
            Record::new().with("id", 5i64).with("timestamp", 500i64),
            Record::new().with("id", 9i64).with("timestamp", 900i64),
        ]
    );

    let user_markers = target
        .query_revision_range(Collection::User, &scope(), IdRange::new(-1, 9), 1000)
        .await;
    assert!(
        matches!(user_markers, Err(StoreError::NoRevisionMarker { .. })),
        "{user_markers:?}"
    );

    server.stop().await;
}

#[tokio::test]
async fn write_failures_map_to_store_errors() {
    let server = TestServer::start().await;
    server
        .store
        .seed(Collection::User, [user(1, "a", b"")])
        .await;
    server
        .store
        .seed(Collection::FeatureModel0330, [feature(10, 1, 100)])
        .await;
    let target = server.client();

    let outcome = target
        .delete_by_id(Collection::User, 1)
        .await
        .expect("referenced delete is not an error");
    assert_eq!(outcome, DeleteOutcome::DependencyExists);

    let missing = target.delete_by_id(Collection::User, 99).await;
    assert!(
        matches!(missing, Err(StoreError::Rejected { code: 100, .. })),
        "{missing:?}"
    );

    let duplicate = target.insert(Collection::User, &user(1, "a", b"")).await;
    assert!(matches!(duplicate, Err(StoreError::Rejected { .. })));

    assert_eq!(
        target
            .delete_by_id(Collection::FeatureModel0330, 10)
            .await
            .expect("feature delete failed"),
        DeleteOutcome::Deleted(1)
    );

    server.stop().await;
}

#[tokio::test]
async fn malformed_requests_get_envelope_codes() {
    let server = TestServer::start().await;
    let url = format!("{}/feature", server.base_url());
    let http = reqwest::Client::new();

    let response = http
        .get(&url)
        .query(&[("command", "drop_everything")])
        .send()
        .await
        .expect("request failed");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let envelope: Envelope = response.json().await.expect("body is an envelope");
    assert_eq!(envelope.code, CODE_UNSUPPORTED);
    assert!(envelope.desc.contains("no support command"), "{}", envelope.desc);

    let envelope: Envelope = http
        .post(&url)
        .json(&json!({ "command": "add_user", "values": { "id": "seven" } }))
        .send()
        .await
        .expect("request failed")
        .json()
        .await
        .expect("body is an envelope");
    assert_eq!(envelope.code, CODE_INVALID_PARAMETER);

    let envelope: Envelope = http
        .get(&url)
        .query(&[
            ("command", "query_user_range"),
            ("province_code", "510000"),
            ("city_code", "511100"),
            ("begin_id", "-1"),
            ("end_id", "10"),
            ("limit", "0"),
        ])
        .send()
        .await
        .expect("request failed")
        .json()
        .await
        .expect("body is an envelope");
    assert_eq!(envelope.code, CODE_INVALID_PARAMETER);
    assert_ne!(envelope.code, CODE_DEPENDENCY_EXISTS);

    server.stop().await;
}

#[tokio::test]
async fn full_cycle_against_a_remote_target() {
    let server = TestServer::start().await;
    server
        .store
        .seed(Collection::User, [user(1, "a", b"old"), user(8, "stale", b"")])
        .await;

    let source = MemoryStore::new();
    source
        .seed(
            Collection::User,
            [user(1, "a", b"new"), user(2, "b", b""), user(3, "c", b"\x00")],
        )
        .await;
    source
        .seed(
            Collection::FeatureModel0330,
            [feature(1, 1, 100), feature(2, 3, 100)],
        )
        .await;

    let engine = ReconciliationEngine::new(
        source,
        server.client(),
        scope(),
        EngineConfig { page_limit: 2 },
    );
    let report = engine.run_cycle().await.expect("cycle should succeed");

    let users = report
        .collection(Collection::User)
        .expect("user collection is always reconciled");
    assert_eq!(users.inserted(), 2);
    assert_eq!(users.updated(), 1);
    assert_eq!(users.deleted(), 1);
    assert_eq!(
        server.store.rows(Collection::User).await,
        engine.source().rows(Collection::User).await
    );
    assert_eq!(
        server.store.rows(Collection::FeatureModel0330).await,
        engine.source().rows(Collection::FeatureModel0330).await
    );

    let second = engine.run_cycle().await.expect("second cycle should succeed");
    assert_eq!(second.writes(), 0);

    server.stop().await;
}

//! Control-plane adapters against a mock API server.

use std::time::Duration;

use bqtable_controller::auth::BearerToken;
use bqtable_controller::{EventSource, KubeClient, KubeConfig, KubeWatchSource};
use bqtable_events::{EventKind, ObjectKey, ReconcileEvent};
use bqtable_reconcile::{BackoffPolicy, Declaration, DeclarationStore, StoreError};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const COLLECTION: &str = "/apis/mahdi.dev/v1/bigquerytables";
const OBJECT: &str = "/apis/mahdi.dev/v1/namespaces/default/bigquerytables/orders";

fn client(server: &MockServer) -> KubeClient {
    KubeClient::new(KubeConfig {
        api_url: server.uri(),
        token: BearerToken::Static("sa-token".to_string()),
        namespace: None,
        group: "mahdi.dev".to_string(),
        version: "v1".to_string(),
        request_timeout: Duration::from_secs(5),
    })
    .unwrap()
}

fn record(resource_version: &str) -> serde_json::Value {
    json!({
        "apiVersion": "mahdi.dev/v1",
        "kind": "BigQueryTable",
        "metadata": {
            "name": "orders",
            "namespace": "default",
            "resourceVersion": resource_version,
            "uid": "5f1c",
            "labels": {"team": "data"}
        },
        "spec": {"dataset": "analytics"},
        "status": {"observed": true}
    })
}

fn key() -> ObjectKey {
    ObjectKey::new("default", "orders")
}

#[tokio::test]
async fn test_get_decodes_record() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(OBJECT))
        .and(header("authorization", "Bearer sa-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(record("7")))
        .expect(1)
        .mount(&server)
        .await;

    let declaration = DeclarationStore::get(&client(&server), &key())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(declaration.key(), key());
    assert_eq!(declaration.metadata.resource_version.as_deref(), Some("7"));
    assert!(declaration.metadata.finalizers.is_empty());
    assert!(!declaration.is_deleting());
}

#[tokio::test]
async fn test_get_missing_is_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(OBJECT))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"kind": "Status", "code": 404})))
        .mount(&server)
        .await;

    assert!(DeclarationStore::get(&client(&server), &key())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_update_preserves_unknown_fields() {
    let server = MockServer::start().await;
    let mut updated = record("8");
    updated["metadata"]["finalizers"] = json!(["bigquerytables.mahdi.dev/finalizer"]);

    Mock::given(method("PUT"))
        .and(path(OBJECT))
        .and(body_partial_json(json!({
            "metadata": {
                "resourceVersion": "7",
                "uid": "5f1c",
                "labels": {"team": "data"},
                "finalizers": ["bigquerytables.mahdi.dev/finalizer"]
            },
            "status": {"observed": true}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(updated))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let declaration = Declaration::from_value(record("7"))
        .unwrap()
        .with_finalizer("bigquerytables.mahdi.dev/finalizer");
    let stored = client.update(&declaration).await.unwrap();
    assert_eq!(stored.metadata.resource_version.as_deref(), Some("8"));
    assert!(stored.has_finalizer("bigquerytables.mahdi.dev/finalizer"));
}

#[tokio::test]
async fn test_update_stale_version_is_conflict() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path(OBJECT))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "kind": "Status",
            "code": 409,
            "reason": "Conflict"
        })))
        .mount(&server)
        .await;

    let declaration = Declaration::from_value(record("7")).unwrap();
    let err = client(&server).update(&declaration).await.unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test]
async fn test_server_error_is_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(OBJECT))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = DeclarationStore::get(&client(&server), &key())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Unavailable(_)));
}

fn line(event_type: &str, object: serde_json::Value) -> String {
    format!("{}\n", json!({"type": event_type, "object": object}))
}

fn item(name: &str, resource_version: &str) -> serde_json::Value {
    json!({"metadata": {"name": name, "namespace": "default", "resourceVersion": resource_version}})
}

async fn recv(rx: &mut mpsc::Receiver<ReconcileEvent>) -> ReconcileEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_watch_source_resumes_and_relists() {
    let server = MockServer::start().await;

    // First watch: two changes, a malformed line, then a bookmark.
    let first_watch = [
        line("ADDED", item("clicks", "11")),
        line("MODIFIED", item("orders", "12")),
        "{not json\n".to_string(),
        line("BOOKMARK", json!({"metadata": {"resourceVersion": "15"}})),
    ]
    .concat();
    Mock::given(method("GET"))
        .and(path(COLLECTION))
        .and(query_param("watch", "1"))
        .and(query_param("resourceVersion", "10"))
        .respond_with(ResponseTemplate::new(200).set_body_string(first_watch))
        .with_priority(1)
        .mount(&server)
        .await;

    // Resuming from the bookmark finds it expired.
    Mock::given(method("GET"))
        .and(path(COLLECTION))
        .and(query_param("watch", "1"))
        .and(query_param("resourceVersion", "15"))
        .respond_with(ResponseTemplate::new(200).set_body_string(line(
            "ERROR",
            json!({"kind": "Status", "code": 410, "message": "too old resource version"}),
        )))
        .with_priority(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(COLLECTION))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "metadata": {"resourceVersion": "10"},
            "items": [item("orders", "5")]
        })))
        .with_priority(10)
        .mount(&server)
        .await;

    let source = KubeWatchSource::new(client(&server), Duration::from_secs(300))
        .with_watch_timeout(Duration::from_secs(5))
        .with_backoff(BackoffPolicy {
            base: Duration::from_millis(10),
            max: Duration::from_millis(50),
            jitter: 0.0,
        });
    let (tx, mut rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { source.run(tx, shutdown_rx).await });

    let orders = ObjectKey::new("default", "orders");
    let clicks = ObjectKey::new("default", "clicks");

    let listed = recv(&mut rx).await;
    assert_eq!((listed.kind, &listed.key), (EventKind::Added, &orders));

    let added = recv(&mut rx).await;
    assert_eq!((added.kind, &added.key), (EventKind::Added, &clicks));
    assert_eq!(added.resource_version.as_deref(), Some("11"));

    let modified = recv(&mut rx).await;
    assert_eq!((modified.kind, &modified.key), (EventKind::Modified, &orders));

    // Expiry forces a relist, replaying the listed record.
    let relisted = recv(&mut rx).await;
    assert_eq!((relisted.kind, &relisted.key), (EventKind::Added, &orders));
    assert_eq!(relisted.resource_version.as_deref(), Some("5"));

    shutdown_tx.send(true).unwrap();
    drop(rx);
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_watch_source_backs_off_on_list_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(COLLECTION))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let source = KubeWatchSource::new(client(&server), Duration::from_secs(300)).with_backoff(
        BackoffPolicy {
            base: Duration::from_millis(10),
            max: Duration::from_millis(20),
            jitter: 0.0,
        },
    );
    let (tx, _rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { source.run(tx, shutdown_rx).await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    let attempts = server.received_requests().await.unwrap().len();
    assert!(attempts >= 2, "expected repeated list attempts, got {attempts}");

    shutdown_tx.send(true).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_stalled_watch_still_relists_on_schedule() {
    let server = MockServer::start().await;

    // The watch never answers within the test.
    Mock::given(method("GET"))
        .and(path(COLLECTION))
        .and(query_param("watch", "1"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(60)))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(COLLECTION))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "metadata": {"resourceVersion": "10"},
            "items": [item("orders", "5")]
        })))
        .with_priority(10)
        .mount(&server)
        .await;

    let source = KubeWatchSource::new(client(&server), Duration::from_secs(1))
        .with_watch_timeout(Duration::from_secs(120));
    let (tx, mut rx) = mpsc::channel(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { source.run(tx, shutdown_rx).await });

    // Each relist replays the record.
    for _ in 0..3 {
        let listed = recv(&mut rx).await;
        assert_eq!((listed.kind, &listed.key), (EventKind::Added, &key()));
    }

    let lists = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|request| !request.url.query().unwrap_or_default().contains("watch="))
        .count();
    assert!(lists >= 3, "expected a relist per resync interval, got {lists}");

    shutdown_tx.send(true).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use couchsync_remote::{
    ConnectivityProbe, Error, EventBus, EventPayload, FailureKind, Handler, IdGenerator,
    ManualScheduler, Method, MockTransport, PullOutcome, RemoteConfig, RemoteObject, RemoteStore,
};

#[derive(Default)]
struct RecordingBus {
    subscriptions: Mutex<Vec<String>>,
    emitted: Mutex<Vec<(String, EventPayload)>>,
}

impl RecordingBus {
    fn names(&self) -> Vec<String> {
        self.emitted
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn payload(&self, event: &str) -> Option<EventPayload> {
        self.emitted
            .lock()
            .unwrap()
            .iter()
            .find(|(name, _)| name == event)
            .map(|(_, payload)| payload.clone())
    }
}

impl EventBus for RecordingBus {
    fn subscribe(&self, events: &str, _handler: Handler) {
        self.subscriptions.lock().unwrap().push(events.to_string());
    }

    fn unsubscribe(&self, _events: &str, _handler: &Handler) {}

    fn emit(&self, event: &str, payload: &EventPayload) {
        self.emitted
            .lock()
            .unwrap()
            .push((event.to_string(), payload.clone()));
    }
}

#[derive(Default)]
struct CountingProbe(AtomicUsize);

impl ConnectivityProbe for CountingProbe {
    fn check_connection(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

struct FixedIds;

impl IdGenerator for FixedIds {
    fn generate(&self) -> String {
        "uuid".to_string()
    }
}

struct Harness {
    store: RemoteStore,
    transport: Arc<MockTransport>,
    scheduler: Arc<ManualScheduler>,
    bus: Arc<RecordingBus>,
    probe: Arc<CountingProbe>,
}

fn harness(config: RemoteConfig) -> Harness {
    let transport = Arc::new(MockTransport::new());
    let scheduler = Arc::new(ManualScheduler::new());
    let bus = Arc::new(RecordingBus::default());
    let probe = Arc::new(CountingProbe::default());

    let store = RemoteStore::builder(config, transport.clone())
        .with_bus(bus.clone())
        .with_scheduler(scheduler.clone())
        .with_probe(probe.clone())
        .with_id_generator(Arc::new(FixedIds))
        .build();

    Harness {
        store,
        transport,
        scheduler,
        bus,
        probe,
    }
}

fn feed(rows: Value, last_seq: Value) -> Value {
    json!({ "results": rows, "last_seq": last_seq })
}

fn last_path(transport: &MockTransport) -> String {
    transport.requests().last().map(|r| r.path.clone()).unwrap_or_default()
}

#[tokio::test]
async fn test_find_encodes_store_name_and_key() {
    let h = harness(RemoteConfig::new("my/store"));
    h.transport.respond(Ok(json!({
        "_id": "car/123",
        "_rev": "1-abc",
        "type": "car",
        "color": "red"
    })));

    let car = h.store.find("car", "123").await.unwrap();

    let request = &h.transport.requests()[0];
    assert_eq!(request.method, Method::Get);
    assert_eq!(request.path, "/my%2Fstore/car%2F123");
    assert_eq!(car.object_type, "car");
    assert_eq!(car.id, "123");
    assert_eq!(car.rev.as_deref(), Some("1-abc"));
    assert_eq!(car.attribute("color"), Some(&json!("red")));
}

#[tokio::test]
async fn test_find_all_with_prefix_and_type() {
    let h = harness(RemoteConfig::new("db").with_prefix("$public/"));
    h.transport.respond(Ok(json!({
        "rows": [
            { "doc": { "_id": "$public/todo/1", "type": "todo", "title": "milk" } },
            { "doc": { "_id": "_design/app" } },
            { "id": "missing-doc" }
        ]
    })));

    let todos = h.store.find_all(Some("todo")).await.unwrap();

    assert_eq!(
        last_path(&h.transport),
        "/db/_all_docs?include_docs=true&startkey=\"%24public%2Ftodo%2F\"&endkey=\"%24public%2Ftodo0\""
    );
    assert_eq!(todos.len(), 1);
    assert_eq!(todos[0].id, "1");
    assert_eq!(todos[0].attribute("title"), Some(&json!("milk")));
}

#[tokio::test]
async fn test_find_all_with_prefix_only() {
    let h = harness(RemoteConfig::new("db").with_prefix("$public/"));
    h.transport.respond(Ok(json!({ "rows": [] })));

    assert!(h.store.find_all(None).await.unwrap().is_empty());
    assert_eq!(
        last_path(&h.transport),
        "/db/_all_docs?include_docs=true&startkey=\"%24public%2F\"&endkey=\"%24public0\""
    );
}

#[tokio::test]
async fn test_find_all_without_prefix_or_type() {
    let h = harness(RemoteConfig::new("db"));
    h.transport.respond(Ok(json!({ "rows": [] })));

    h.store.find_all(None).await.unwrap();
    assert_eq!(last_path(&h.transport), "/db/_all_docs?include_docs=true");
}

#[tokio::test]
async fn test_save_puts_canonical_document() {
    let h = harness(RemoteConfig::new("db"));
    h.transport.respond(Ok(json!({ "ok": true, "id": "car/123", "rev": "1-abc" })));

    let car = RemoteObject::new("car", "123").with_attribute("color", json!("red"));
    let saved = h.store.save(car).await.unwrap();

    let request = &h.transport.requests()[0];
    assert_eq!(request.method, Method::Put);
    assert_eq!(request.path, "/db/car%2F123");
    assert_eq!(
        request.options.body,
        Some(json!({ "_id": "car/123", "type": "car", "color": "red" }))
    );
    assert_eq!(saved.rev.as_deref(), Some("1-abc"));
}

#[tokio::test]
async fn test_push_extends_revision_chains() {
    let h = harness(RemoteConfig::new("db"));
    h.transport.respond(Ok(json!([])));

    let deleted = RemoteObject::new("todo", "1").with_rev("2-123").deleted();
    let created = RemoteObject::new("todo", "2");
    h.store.push(&[deleted, created]).await.unwrap();

    let request = &h.transport.requests()[0];
    assert_eq!(request.method, Method::Post);
    assert_eq!(request.path, "/db/_bulk_docs");
    assert_eq!(request.options.data_type, Some("json"));
    assert!(!request.options.process_data);

    let body = request.options.body.clone().unwrap();
    assert_eq!(body["new_edits"], json!(false));
    let docs = body["docs"].as_array().unwrap();
    assert_eq!(docs.len(), 2);

    assert_eq!(docs[0]["_id"], "todo/1");
    assert_eq!(docs[0]["_rev"], "3-uuid");
    assert_eq!(docs[0]["_deleted"], json!(true));
    assert_eq!(docs[0]["_revisions"], json!({ "start": 3, "ids": ["uuid", "123"] }));

    assert_eq!(docs[1]["_id"], "todo/2");
    assert_eq!(docs[1]["_rev"], "1-uuid");
}

#[tokio::test]
async fn test_push_marks_local_revisions() {
    let h = harness(RemoteConfig::new("db"));
    h.transport.respond(Ok(json!([])));

    let written = h
        .store
        .push(&[RemoteObject::new("todo", "1").local_only()])
        .await
        .unwrap();

    assert_eq!(written[0].rev.as_deref(), Some("1-uuid-local"));
    let body = h.transport.requests()[0].options.body.clone().unwrap();
    assert_eq!(body["docs"][0]["_rev"], "1-uuid-local");
}

#[tokio::test]
async fn test_push_strips_local_bookkeeping() {
    let h = harness(RemoteConfig::new("db"));
    h.transport.respond(Ok(json!([])));

    let todo = RemoteObject::new("todo", "1")
        .with_attribute("title", json!("milk"))
        .with_attribute("_localInfo", json!({ "dirty": true }))
        .with_attribute("_$syncedAt", json!(1));
    h.store.push(&[todo]).await.unwrap();

    let body = h.transport.requests()[0].options.body.clone().unwrap();
    let doc = body["docs"][0].as_object().unwrap();
    assert!(doc.contains_key("title"));
    assert!(!doc.contains_key("_localInfo"));
    assert!(!doc.contains_key("_$syncedAt"));
}

#[tokio::test]
async fn test_empty_push_makes_no_request() {
    let h = harness(RemoteConfig::new("db"));
    assert!(h.store.push(&[]).await.unwrap().is_empty());
    assert_eq!(h.transport.request_count(), 0);
}

#[tokio::test]
async fn test_remove_pushes_tombstone() {
    let h = harness(RemoteConfig::new("db"));
    h.transport.respond(Ok(json!({ "_id": "car/1", "_rev": "1-abc", "type": "car" })));
    h.transport.respond(Ok(json!([])));

    let removed = h.store.remove("car", "1").await.unwrap();

    assert!(removed.deleted);
    assert_eq!(removed.rev.as_deref(), Some("2-uuid"));
    let body = h.transport.requests()[1].options.body.clone().unwrap();
    assert_eq!(body["docs"][0]["_deleted"], json!(true));
    assert_eq!(body["docs"][0]["_revisions"], json!({ "start": 2, "ids": ["uuid", "abc"] }));
}

#[tokio::test]
async fn test_update_merges_and_saves() {
    let h = harness(RemoteConfig::new("db"));
    h.transport.respond(Ok(json!({ "_id": "car/1", "_rev": "1-abc", "type": "car", "color": "red" })));
    h.transport.respond(Ok(json!({ "ok": true, "rev": "2-def" })));

    let mut changes = serde_json::Map::new();
    changes.insert("color".into(), json!("blue"));
    let car = h.store.update("car", "1", &changes).await.unwrap();

    assert_eq!(car.attribute("color"), Some(&json!("blue")));
    assert_eq!(car.rev.as_deref(), Some("2-def"));
    let put = &h.transport.requests()[1];
    assert_eq!(put.method, Method::Put);
    assert_eq!(put.options.body.as_ref().unwrap()["_rev"], "1-abc");
}

#[tokio::test]
async fn test_connected_pull_is_watched_long_poll() {
    let h = harness(RemoteConfig::new("db"));

    let bootstrap = h.store.connect();
    h.transport.wait_for_requests(1).await;

    let path = last_path(&h.transport);
    assert!(path.starts_with("/db/_changes?include_docs=true&since=0"));
    assert!(path.contains("heartbeat=10000"));
    assert!(path.contains("feed=longpoll"));
    assert_eq!(h.scheduler.pending_delays(), vec![Duration::from_millis(25_000)]);

    assert_eq!(h.scheduler.advance(Duration::from_millis(25_000)), 1);
    h.transport.wait_for_requests(2).await;

    assert_eq!(bootstrap.await.unwrap(), PullOutcome::Failed(FailureKind::Aborted));
    assert!(h.store.is_pulling());
    assert_eq!(h.scheduler.pending_delays(), vec![Duration::from_millis(25_000)]);
    assert!(!h.bus.names().contains(&"db:bootstrap:end".to_string()));
}

#[tokio::test]
async fn test_disconnected_pull_is_one_shot() {
    let h = harness(RemoteConfig::new("db"));
    h.transport.respond(Ok(feed(json!([]), json!(0))));

    let outcome = h.store.pull().await.unwrap();

    assert!(outcome.is_applied());
    assert_eq!(last_path(&h.transport), "/db/_changes?include_docs=true&since=0");
    assert!(h.scheduler.pending_delays().is_empty());
    assert_eq!(h.transport.request_count(), 1);
}

#[tokio::test]
async fn test_bootstrap_events_and_feed_stays_alive() {
    let h = harness(RemoteConfig::new("db"));
    h.transport.respond(Ok(feed(json!([]), json!(3))));

    let outcome = h.store.connect().await.unwrap();
    h.transport.wait_for_requests(2).await;

    assert!(outcome.is_applied());
    assert_eq!(h.bus.names(), vec!["db:bootstrap:start", "db:bootstrap:end"]);
    assert!(last_path(&h.transport).contains("since=3"));
    assert!(h.store.is_pulling());
}

#[tokio::test]
async fn test_not_found_retries_silently() {
    let h = harness(RemoteConfig::new("db"));
    h.transport.respond(Err(Error::from_status(404, "no db")));

    let outcome = h.store.pull().await.unwrap();

    assert_eq!(outcome, PullOutcome::Failed(FailureKind::NotYetProvisioned));
    assert_eq!(h.scheduler.pending_delays(), vec![Duration::from_millis(3_000)]);
    assert!(h.bus.names().is_empty());
    assert_eq!(h.probe.0.load(Ordering::SeqCst), 0);

    assert_eq!(h.scheduler.advance(Duration::from_millis(3_000)), 1);
    h.transport.wait_for_requests(2).await;
}

#[tokio::test]
async fn test_server_error_retries_reports_and_probes() {
    let h = harness(RemoteConfig::new("db"));
    let error = Error::from_status(500, "boom");
    h.transport.respond(Err(error.clone()));

    let outcome = h.store.pull().await.unwrap();

    assert_eq!(outcome, PullOutcome::Failed(FailureKind::Server));
    assert_eq!(h.scheduler.pending_delays(), vec![Duration::from_millis(3_000)]);
    assert_eq!(h.bus.names(), vec!["db:error:server"]);
    assert_eq!(h.bus.payload("db:error:server"), Some(EventPayload::Error(error)));
    assert_eq!(h.probe.0.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unauthenticated_disconnects() {
    let h = harness(RemoteConfig::new("db"));
    h.transport.respond(Err(Error::from_status(401, "who are you")));

    let outcome = h.store.connect().await.unwrap();

    assert_eq!(outcome, PullOutcome::Failed(FailureKind::Unauthenticated));
    assert!(!h.store.is_connected());
    assert_eq!(h.bus.names(), vec!["db:bootstrap:start", "db:error:unauthenticated"]);
    assert!(h.scheduler.pending_delays().is_empty());
    assert_eq!(h.transport.request_count(), 1);
}

#[tokio::test]
async fn test_unknown_failure_retries_only_while_connected() {
    let h = harness(RemoteConfig::new("db"));
    h.transport.respond(Err(Error::Network("connection reset".into())));

    let outcome = h.store.pull().await.unwrap();

    assert_eq!(outcome, PullOutcome::Failed(FailureKind::Unknown));
    assert!(h.scheduler.pending_delays().is_empty());
    assert_eq!(h.probe.0.load(Ordering::SeqCst), 1);

    h.transport.respond(Err(Error::from_status(409, "conflict")));
    let outcome = h.store.connect().await.unwrap();

    assert_eq!(outcome, PullOutcome::Failed(FailureKind::Unknown));
    assert_eq!(h.scheduler.pending_delays(), vec![Duration::from_millis(3_000)]);
    assert_eq!(h.probe.0.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_disconnect_aborts_pull_and_disarms_watchdog() {
    let h = harness(RemoteConfig::new("db"));

    let bootstrap = h.store.connect();
    h.transport.wait_for_requests(1).await;
    h.store.disconnect();

    assert_eq!(bootstrap.await.unwrap(), PullOutcome::Superseded);
    assert!(!h.store.is_pulling());
    assert!(h.scheduler.pending_delays().is_empty());
    assert_eq!(h.scheduler.advance(Duration::from_secs(60)), 0);
    assert_eq!(h.transport.request_count(), 1);
}

#[tokio::test]
async fn test_disconnect_cancels_scheduled_retry() {
    let h = harness(RemoteConfig::new("db"));
    h.transport.respond(Err(Error::from_status(500, "boom")));

    h.store.connect().await.unwrap();
    assert!(h.store.has_pending_retry());

    h.store.disconnect();

    assert!(!h.store.has_pending_retry());
    assert_eq!(h.scheduler.advance(Duration::from_millis(3_000)), 0);
    assert_eq!(h.transport.request_count(), 1);
}

#[tokio::test]
async fn test_new_pull_supersedes_outstanding_one() {
    let h = harness(RemoteConfig::new("db"));

    let first = h.store.pull();
    h.transport.wait_for_requests(1).await;
    h.transport.respond(Ok(feed(json!([]), json!(1))));
    let second = h.store.pull();

    assert_eq!(first.await.unwrap(), PullOutcome::Superseded);
    assert!(second.await.unwrap().is_applied());
    assert_eq!(h.store.checkpoint(), 1);
}

#[tokio::test]
async fn test_pull_classifies_add_and_update() {
    let h = harness(RemoteConfig::new("db"));
    h.transport.respond(Ok(feed(
        json!([{ "seq": 1, "doc": { "_id": "todo/known", "type": "todo" } }]),
        json!(1),
    )));
    h.store.pull().await.unwrap();
    assert!(h.store.is_known_object("todo", "known"));

    h.transport.respond(Ok(feed(
        json!([
            { "seq": 2, "doc": { "_id": "todo/fresh", "type": "todo" } },
            { "seq": 3, "doc": { "_id": "todo/known", "_rev": "2-b", "type": "todo" } }
        ]),
        json!(3),
    )));
    let outcome = h.store.pull().await.unwrap();

    let PullOutcome::Applied(summary) = outcome else {
        panic!("expected applied batch, got {:?}", outcome);
    };
    assert_eq!(summary.added, 1);
    assert_eq!(summary.updated, 1);

    let names = h.bus.names();
    assert_eq!(
        names[6..],
        [
            "db:add",
            "db:add:todo",
            "db:add:todo:fresh",
            "db:change",
            "db:change:todo",
            "db:change:todo:fresh",
            "db:update",
            "db:update:todo",
            "db:update:todo:known",
            "db:change",
            "db:change:todo",
            "db:change:todo:known",
        ]
    );
}

#[tokio::test]
async fn test_pull_removal_forgets_object() {
    let h = harness(RemoteConfig::new("db"));
    h.transport.respond(Ok(feed(
        json!([
            { "seq": 1, "doc": { "_id": "todo/1", "type": "todo" } },
            { "seq": 2, "deleted": true, "doc": { "_id": "todo/1", "_deleted": true } },
            { "seq": 3, "deleted": true, "doc": { "_id": "todo/never-seen", "_deleted": true } }
        ]),
        json!(3),
    )));

    let outcome = h.store.pull().await.unwrap();

    let PullOutcome::Applied(summary) = outcome else {
        panic!("expected applied batch, got {:?}", outcome);
    };
    assert_eq!(summary.removed, 2);
    assert!(!h.store.is_known_object("todo", "1"));
    assert!(h.bus.names().contains(&"db:remove:todo:never-seen".to_string()));
}

#[tokio::test]
async fn test_pull_drops_rows_outside_prefix() {
    let h = harness(RemoteConfig::new("db").with_prefix("$public/"));
    h.transport.respond(Ok(feed(
        json!([
            { "seq": 1, "doc": { "_id": "$public/todo/1", "type": "todo" } },
            { "seq": 2, "doc": { "_id": "todo/2", "type": "todo" } },
            { "seq": 3, "doc": { "_id": "_design/app" } }
        ]),
        json!(3),
    )));

    let outcome = h.store.pull().await.unwrap();

    let PullOutcome::Applied(summary) = outcome else {
        panic!("expected applied batch, got {:?}", outcome);
    };
    assert_eq!(summary.added, 1);
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.checkpoint, 3);
    assert!(h.bus.names().iter().all(|name| !name.ends_with(":2")));
}

#[tokio::test]
async fn test_checkpoint_advances_per_batch() {
    let h = harness(RemoteConfig::new("db"));
    assert_eq!(h.store.checkpoint(), 0);

    h.transport.respond(Ok(feed(
        json!([{ "seq": "5-g1AAAA", "doc": { "_id": "todo/1", "type": "todo" } }]),
        json!("5-g1AAAA"),
    )));
    h.store.pull().await.unwrap();
    assert_eq!(h.store.checkpoint(), 5);

    h.transport.respond(Ok(json!({
        "results": [
            { "seq": 9, "doc": { "_id": "todo/2", "type": "todo" } },
            { "seq": 7, "doc": { "_id": "todo/3", "type": "todo" } }
        ]
    })));
    h.store.pull().await.unwrap();
    assert!(h.transport.requests()[1].path.contains("since=5"));
    assert_eq!(h.store.checkpoint(), 9);

    h.store.set_checkpoint(2);
    h.transport.respond(Ok(feed(json!([]), json!(2))));
    h.store.pull().await.unwrap();
    assert!(last_path(&h.transport).contains("since=2"));
}

#[tokio::test]
async fn test_sync_pushes_then_pulls() {
    let h = harness(RemoteConfig::new("db"));
    h.transport.respond(Ok(json!([])));
    h.transport.respond(Ok(feed(json!([]), json!(0))));

    let outcome = h.store.sync(&[RemoteObject::new("todo", "1")]).await.unwrap();

    assert!(outcome.is_applied());
    let requests = h.transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].path, "/db/_bulk_docs");
    assert!(requests[1].path.starts_with("/db/_changes"));
}

#[tokio::test]
async fn test_sync_push_failure_skips_pull() {
    let h = harness(RemoteConfig::new("db"));
    h.transport.respond(Err(Error::from_status(500, "boom")));

    let result = h.store.sync(&[RemoteObject::new("todo", "1")]).await;

    assert_eq!(result, Err(Error::from_status(500, "boom")));
    assert_eq!(h.transport.request_count(), 1);
    assert!(h.bus.names().is_empty());
}

#[tokio::test]
async fn test_on_subscribes_once_with_namespaced_events() {
    let h = harness(RemoteConfig::new("databaseName"));
    let handler: Handler = Arc::new(|_: &str, _: &EventPayload| {});

    h.store.on("super funky fresh", handler);

    assert_eq!(
        *h.bus.subscriptions.lock().unwrap(),
        vec!["databaseName:super databaseName:funky databaseName:fresh"]
    );
}

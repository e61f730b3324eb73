//! End-to-end behavior of a service driven through a scripted transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use remote_resource::transport::mock::MockTransport;
use remote_resource::{
    Content, ContentValue, ErrorKind, Method, Request, RequestOutcome, RequestPhase, Resource,
    ResourceEvent, ResourceObserver, ResponseTransformer, Service, ServiceConfig, TransformError,
    TransformerChain, TransportError,
};

fn service_with(mock: &MockTransport) -> Service {
    Service::new(
        ServiceConfig::new("https://api.example.test/v1"),
        mock.clone(),
    )
    .expect("service should start")
}

/// Registers a closure observer that appends every event to a shared log.
async fn record_events(resource: &Resource) -> Arc<Mutex<Vec<ResourceEvent>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    resource
        .add_observer_fn(move |_, event| sink.lock().unwrap().push(event))
        .await
        .expect("observer registration should succeed");
    log
}

fn events(log: &Arc<Mutex<Vec<ResourceEvent>>>) -> Vec<ResourceEvent> {
    log.lock().unwrap().clone()
}

#[tokio::test]
async fn load_parses_json_and_notifies_observers() {
    let mock = MockTransport::new();
    mock.respond().json_body(r#"{"name":"Ann"}"#).queue();

    let service = service_with(&mock);
    let profile = service.resource("users/me").expect("valid path");
    let log = record_events(&profile).await;

    let request = profile
        .load_if_needed()
        .await
        .expect("load should be accepted")
        .expect("empty resource should fetch");
    let outcome = request.completion().await;

    assert!(outcome.is_success());
    let data = profile.latest_data().expect("data should be cached");
    assert_eq!(data.json().expect("json payload")["name"], "Ann");
    assert!(profile.latest_error().is_none());
    assert!(!profile.is_loading());
    assert_eq!(request.phase(), RequestPhase::Succeeded);

    // Ping on registration (empty state), then the load lifecycle.
    assert_eq!(
        events(&log),
        vec![
            ResourceEvent::Cleared,
            ResourceEvent::Requested,
            ResourceEvent::NewDataFromServer,
        ]
    );
    assert_eq!(mock.hits(), 1);
    mock.verify();
}

#[tokio::test]
async fn concurrent_loads_coalesce_onto_one_exchange() {
    let mock = MockTransport::new();
    let gate = mock.respond().json_body(r#"{"n":1}"#).hold();

    let service = service_with(&mock);
    let items = service.resource("items").expect("valid path");

    let first = items
        .load_if_needed()
        .await
        .expect("load should be accepted")
        .expect("empty resource should fetch");
    let second = items
        .load_if_needed()
        .await
        .expect("load should be accepted")
        .expect("in-flight load should be returned, not suppressed");
    let forced = items.load().await.expect("load should be accepted");

    assert!(Request::ptr_eq(&first, &second));
    assert!(Request::ptr_eq(&first, &forced));
    assert!(items.is_loading());

    gate.release();
    let outcome = first.completion().await;
    assert!(outcome.is_success());
    assert_eq!(mock.hits(), 1);
    assert!(!items.is_loading());
    mock.verify();
}

#[tokio::test]
async fn fresh_data_suppresses_reloads_until_the_window_elapses() {
    let mock = MockTransport::new();
    mock.respond().json_body(r#"{"v":1}"#).queue();
    mock.respond().json_body(r#"{"v":2}"#).queue();

    let service = Service::new(
        ServiceConfig::new("https://api.example.test/v1").staleness(Duration::from_millis(40)),
        mock.clone(),
    )
    .expect("service should start");
    let feed = service.resource("feed").expect("valid path");

    let request = feed
        .load_if_needed()
        .await
        .expect("load should be accepted")
        .expect("empty resource should fetch");
    request.completion().await;
    assert!(feed.is_up_to_date());

    // Within the window nothing happens.
    let suppressed = feed.load_if_needed().await.expect("load should be accepted");
    assert!(suppressed.is_none());
    assert_eq!(mock.hits(), 1);

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(!feed.is_up_to_date());

    let refresh = feed
        .load_if_needed()
        .await
        .expect("load should be accepted")
        .expect("stale resource should fetch");
    refresh.completion().await;
    assert_eq!(mock.hits(), 2);
    assert_eq!(
        feed.latest_data().expect("data").json().expect("json")["v"],
        2
    );
    mock.verify();
}

#[tokio::test]
async fn forced_load_bypasses_freshness() {
    let mock = MockTransport::new();
    mock.respond().json_body(r#"{"v":1}"#).queue();
    mock.respond().json_body(r#"{"v":2}"#).queue();

    let service = service_with(&mock);
    let feed = service.resource("feed").expect("valid path");

    let first = feed.load().await.expect("load should be accepted");
    first.completion().await;
    assert!(feed.is_up_to_date());

    // Pull-to-refresh: still fresh, fetches anyway.
    let second = feed.load().await.expect("load should be accepted");
    second.completion().await;
    assert_eq!(mock.hits(), 2);
    mock.verify();
}

#[tokio::test]
async fn failures_set_the_error_without_evicting_data() {
    let mock = MockTransport::new();
    mock.respond().json_body(r#"{"v":1}"#).queue();
    mock.fail(TransportError::Timeout);
    mock.respond().json_body(r#"{"v":2}"#).queue();

    let service = service_with(&mock);
    let feed = service.resource("feed").expect("valid path");
    let log = record_events(&feed).await;

    feed.load().await.expect("load").completion().await;

    let failed = feed.load().await.expect("load");
    let outcome = failed.completion().await;
    assert!(!outcome.is_success());
    assert_eq!(failed.phase(), RequestPhase::Failed);

    // Stale-while-error: old data survives alongside the new error.
    let data = feed.latest_data().expect("data should survive the failure");
    assert_eq!(data.json().expect("json")["v"], 1);
    let error = feed.latest_error().expect("error should be recorded");
    assert_eq!(error.kind, ErrorKind::Transport);
    assert_eq!(error.message, "Unable to contact the server");

    // The next success replaces data and clears the error.
    feed.load().await.expect("load").completion().await;
    assert_eq!(
        feed.latest_data().expect("data").json().expect("json")["v"],
        2
    );
    assert!(feed.latest_error().is_none());

    assert_eq!(
        events(&log),
        vec![
            ResourceEvent::Cleared,
            ResourceEvent::Requested,
            ResourceEvent::NewDataFromServer,
            ResourceEvent::Requested,
            ResourceEvent::Error,
            ResourceEvent::Requested,
            ResourceEvent::NewDataFromServer,
        ]
    );
    mock.verify();
}

#[tokio::test]
async fn server_and_parse_failures_are_classified() {
    let mock = MockTransport::new();
    mock.respond().status(503).body("down").queue();
    mock.respond().json_body("not json at all").queue();

    let service = service_with(&mock);
    let feed = service.resource("feed").expect("valid path");

    feed.load().await.expect("load").completion().await;
    let error = feed.latest_error().expect("server error recorded");
    assert_eq!(error.kind, ErrorKind::Server { status: 503 });
    assert_eq!(error.status(), Some(503));
    assert_eq!(error.raw_body.as_deref(), Some(&b"down"[..]));
    assert_eq!(error.message, "The server had a problem (503)");

    feed.load().await.expect("load").completion().await;
    let error = feed.latest_error().expect("parse error recorded");
    assert_eq!(error.kind, ErrorKind::Parse);
    assert_eq!(error.message, "Unable to understand the server's response");
    mock.verify();
}

#[tokio::test]
async fn revalidation_reuses_the_cached_payload_without_reparsing() {
    struct Counting {
        calls: Arc<AtomicUsize>,
    }
    impl ResponseTransformer for Counting {
        fn transform(&self, content: Content) -> Result<Content, TransformError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(content)
        }
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let mut chain = TransformerChain::standard();
    chain.append("*/*", Counting { calls: calls.clone() });

    let mock = MockTransport::new();
    mock.respond()
        .json_body(r#"{"v":1}"#)
        .header("ETag", "\"v1\"")
        .queue();
    mock.respond().status(304).queue();

    let service = Service::new(
        ServiceConfig::new("https://api.example.test/v1")
            .staleness(Duration::ZERO)
            .transformers(chain),
        mock.clone(),
    )
    .expect("service should start");
    let doc = service.resource("doc").expect("valid path");
    let log = record_events(&doc).await;

    doc.load_if_needed()
        .await
        .expect("load")
        .expect("zero staleness always fetches")
        .completion()
        .await;
    let first = doc.latest_data().expect("data cached");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let revalidation = doc
        .load_if_needed()
        .await
        .expect("load")
        .expect("zero staleness always fetches");
    let outcome = revalidation.completion().await;
    assert!(matches!(outcome, RequestOutcome::NotModified(_)));

    // The conditional header carried the cached validator.
    let requests = mock.requests();
    assert_eq!(requests[1].header("if-none-match"), Some("\"v1\""));

    // Payload unchanged, timestamp refreshed, pipeline untouched.
    let second = doc.latest_data().expect("data still cached");
    assert_eq!(second.content, first.content);
    assert!(second.received_at > first.received_at);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(doc.latest_error().is_none());

    assert_eq!(
        events(&log),
        vec![
            ResourceEvent::Cleared,
            ResourceEvent::Requested,
            ResourceEvent::NewDataFromServer,
            ResourceEvent::Requested,
            ResourceEvent::NotModified,
        ]
    );
    mock.verify();
}

#[tokio::test]
async fn cancellation_drops_the_result_silently() {
    let mock = MockTransport::new();
    let gate = mock.respond().json_body(r#"{"v":1}"#).hold();

    let service = service_with(&mock);
    let feed = service.resource("feed").expect("valid path");
    let log = record_events(&feed).await;

    let request = feed
        .load_if_needed()
        .await
        .expect("load")
        .expect("empty resource should fetch");
    assert!(feed.is_loading());

    request.cancel().await.expect("cancel should be accepted");
    assert_eq!(request.phase(), RequestPhase::Cancelled);
    assert!(!feed.is_loading());
    assert!(feed.latest_data().is_none());
    assert!(feed.latest_error().is_none());

    // The exchange finishes afterwards; its result must be discarded.
    gate.release();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(feed.latest_data().is_none());
    assert!(!events(&log).contains(&ResourceEvent::Error));
    assert!(!events(&log).contains(&ResourceEvent::NewDataFromServer));
}

#[tokio::test]
async fn wipe_clears_state_and_cancels_in_flight_requests() {
    let mock = MockTransport::new();
    mock.respond().text_body("hello").queue();
    let gate = mock.respond().text_body("late").hold();

    let service = service_with(&mock);
    let note = service.resource("note").expect("valid path");
    let log = record_events(&note).await;

    note.load().await.expect("load").completion().await;
    assert!(note.latest_data().is_some());

    let pending = note.load().await.expect("load");
    note.wipe().await.expect("wipe should be accepted");

    assert_eq!(pending.phase(), RequestPhase::Cancelled);
    assert!(note.latest_data().is_none());
    assert!(note.latest_error().is_none());
    assert!(!note.is_loading());
    assert_eq!(events(&log).last(), Some(&ResourceEvent::Cleared));

    gate.release();
}

#[tokio::test]
async fn local_override_replaces_data_without_a_network_call() {
    let mock = MockTransport::new();
    let service = service_with(&mock);
    let draft = service.resource("draft").expect("valid path");
    let log = record_events(&draft).await;

    draft
        .override_data(Content::json(serde_json::json!({"local": true})))
        .await
        .expect("override should be accepted");

    let data = draft.latest_data().expect("override cached");
    assert_eq!(data.json().expect("json")["local"], true);
    assert_eq!(mock.hits(), 0);
    assert_eq!(events(&log).last(), Some(&ResourceEvent::NewDataFromCache));
}

#[tokio::test]
async fn ad_hoc_requests_never_touch_the_cached_state() {
    let mock = MockTransport::new();
    mock.respond().json_body(r#"{"created":true}"#).queue();

    let service = service_with(&mock);
    let items = service.resource("items").expect("valid path");

    let post = items
        .request(Method::Post, Some(br#"{"name":"new"}"#.to_vec()))
        .await
        .expect("request should be accepted");
    let outcome = post.completion().await;

    let data = outcome.data().expect("response payload available");
    assert_eq!(data.json().expect("json")["created"], true);
    // The side-band exchange leaves the resource untouched.
    assert!(items.latest_data().is_none());
    assert!(!items.is_loading());

    let sent = mock.last_request().expect("request recorded");
    assert_eq!(sent.method, Method::Post);
    assert_eq!(sent.body.as_deref(), Some(&br#"{"name":"new"}"#[..]));
    // No conditional validators on non-primary requests.
    assert!(sent.header("if-none-match").is_none());
    mock.verify();
}

#[tokio::test]
async fn new_observers_are_pinged_with_the_current_state() {
    let mock = MockTransport::new();
    mock.respond().json_body(r#"{"v":1}"#).queue();

    let service = service_with(&mock);
    let feed = service.resource("feed").expect("valid path");

    feed.load().await.expect("load").completion().await;

    // Late registration still hears about the cached payload immediately.
    let log = record_events(&feed).await;
    assert_eq!(events(&log), vec![ResourceEvent::NewDataFromCache]);
    mock.verify();
}

#[tokio::test]
async fn removed_observers_hear_nothing_further() {
    let mock = MockTransport::new();
    mock.respond().text_body("one").queue();
    mock.respond().text_body("two").queue();

    let service = service_with(&mock);
    let feed = service.resource("feed").expect("valid path");

    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    let id = feed
        .add_observer_fn(move |_, event| sink.lock().unwrap().push(event))
        .await
        .expect("observer registration should succeed");

    feed.load().await.expect("load").completion().await;
    let heard = log.lock().unwrap().len();

    feed.remove_observer(id).await.expect("removal accepted");
    feed.load().await.expect("load").completion().await;

    assert_eq!(log.lock().unwrap().len(), heard);
    mock.verify();
}

#[tokio::test]
async fn filtered_observers_receive_only_matching_events() {
    struct Recorder {
        log: Arc<Mutex<Vec<ResourceEvent>>>,
    }
    impl ResourceObserver for Recorder {
        fn resource_changed(&self, _resource: &Resource, event: ResourceEvent) {
            self.log.lock().unwrap().push(event);
        }
    }

    let mock = MockTransport::new();
    mock.respond().text_body("fine").queue();
    mock.fail(TransportError::Timeout);

    let service = service_with(&mock);
    let feed = service.resource("feed").expect("valid path");

    let log = Arc::new(Mutex::new(Vec::new()));
    feed.add_observer_filtered(
        Arc::new(Recorder { log: log.clone() }),
        |event| event == ResourceEvent::Error,
    )
    .await
    .expect("observer registration should succeed");

    feed.load().await.expect("load").completion().await;
    feed.load().await.expect("load").completion().await;

    // The ping bypasses the filter; afterwards only errors pass.
    assert_eq!(
        events(&log),
        vec![ResourceEvent::Cleared, ResourceEvent::Error]
    );
    mock.verify();
}

#[tokio::test]
async fn weak_observers_do_not_outlive_their_owner() {
    struct Recorder {
        log: Arc<Mutex<Vec<ResourceEvent>>>,
    }
    impl ResourceObserver for Recorder {
        fn resource_changed(&self, _resource: &Resource, event: ResourceEvent) {
            self.log.lock().unwrap().push(event);
        }
    }

    let mock = MockTransport::new();
    mock.respond().text_body("one").queue();
    mock.respond().text_body("two").queue();

    let service = service_with(&mock);
    let feed = service.resource("feed").expect("valid path");

    let log = Arc::new(Mutex::new(Vec::new()));
    let owner = Arc::new(Recorder { log: log.clone() });
    feed.add_observer_weak(&owner)
        .await
        .expect("observer registration should succeed");

    feed.load().await.expect("load").completion().await;
    let heard = log.lock().unwrap().len();
    assert!(heard > 0);

    drop(owner);
    feed.load().await.expect("load").completion().await;
    assert_eq!(log.lock().unwrap().len(), heard);
    mock.verify();
}

#[tokio::test]
async fn typed_deserialization_reaches_domain_structs() {
    #[derive(serde::Deserialize)]
    struct Profile {
        name: String,
        age: u8,
    }

    let mock = MockTransport::new();
    mock.respond().json_body(r#"{"name":"Ann","age":3}"#).queue();

    let service = service_with(&mock);
    let me = service.resource("users/me").expect("valid path");
    me.load().await.expect("load").completion().await;

    let profile: Profile = me
        .latest_data()
        .expect("data cached")
        .typed()
        .expect("payload should deserialize");
    assert_eq!(profile.name, "Ann");
    assert_eq!(profile.age, 3);
    mock.verify();
}

#[tokio::test]
async fn per_resource_staleness_overrides_the_service_default() {
    let mock = MockTransport::new();
    mock.respond().text_body("one").queue();
    mock.respond().text_body("two").queue();

    // Service default keeps data fresh for 30s; this resource opts out.
    let service = service_with(&mock);
    let live = service.resource("live").expect("valid path");
    live.set_staleness(Duration::ZERO)
        .await
        .expect("override accepted");

    live.load_if_needed()
        .await
        .expect("load")
        .expect("empty resource should fetch")
        .completion()
        .await;
    live.load_if_needed()
        .await
        .expect("load")
        .expect("zero staleness always fetches")
        .completion()
        .await;

    assert_eq!(mock.hits(), 2);
    mock.verify();
}

#[tokio::test]
async fn bodies_without_content_type_are_sniffed() {
    let mock = MockTransport::new();
    mock.respond().body(br#"{"sniffed":true}"#.to_vec()).queue();

    let service = service_with(&mock);
    let blob = service.resource("blob").expect("valid path");
    blob.load().await.expect("load").completion().await;

    let data = blob.latest_data().expect("data cached");
    assert_eq!(data.content.content_type, "application/json");
    assert_eq!(data.json().expect("json")["sniffed"], true);
    mock.verify();
}

#[tokio::test]
async fn per_resource_transformers_override_the_service_chain() {
    struct Uppercase;
    impl ResponseTransformer for Uppercase {
        fn transform(&self, content: Content) -> Result<Content, TransformError> {
            match content.value {
                ContentValue::Text(text) => Ok(Content::new(
                    ContentValue::Text(text.to_uppercase()),
                    content.content_type,
                )),
                other => Ok(Content {
                    value: other,
                    content_type: content.content_type,
                }),
            }
        }
    }

    let mock = MockTransport::new();
    mock.respond().text_body("quiet").queue();

    let service = service_with(&mock);
    let shout = service.resource("shout").expect("valid path");
    let mut chain = TransformerChain::standard();
    chain.append("text/*", Uppercase);
    shout
        .set_transformers(chain)
        .await
        .expect("override accepted");

    shout.load().await.expect("load").completion().await;
    let data = shout.latest_data().expect("data cached");
    assert_eq!(data.text(), Some("QUIET"));
    mock.verify();
}

#[tokio::test]
async fn shutdown_resolves_in_flight_requests_as_cancelled() {
    let mock = MockTransport::new();
    let gate = mock.respond().text_body("late").hold();

    let service = service_with(&mock);
    let feed = service.resource("feed").expect("valid path");
    let pending = feed.load().await.expect("load should be accepted");
    assert_eq!(pending.phase(), RequestPhase::Pending);

    service.shutdown().await.expect("clean shutdown");

    // Awaiters must not hang on a request the runtime will never settle.
    let outcome = tokio::time::timeout(Duration::from_secs(1), pending.completion())
        .await
        .expect("completion should resolve once the runtime is gone");
    assert!(matches!(outcome, RequestOutcome::Cancelled));
    assert_eq!(pending.phase(), RequestPhase::Cancelled);

    gate.release();
}

#[tokio::test]
async fn shutdown_closes_every_handle() {
    let mock = MockTransport::new();
    let service = service_with(&mock);
    let feed = service.resource("feed").expect("valid path");

    service.shutdown().await.expect("clean shutdown");

    let result = feed.load_if_needed().await;
    assert!(matches!(
        result,
        Err(remote_resource::ServiceError::Closed)
    ));
}

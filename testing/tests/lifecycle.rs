//! Request lifecycle tests against the mock transport
//!
//! Covers the perform sequence, failure classification, cancellation, header
//! contract and listener dispatch.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use api_request_core::{
    ApiContext, ApiUser, CompletionState, Json, Method, Path, Request, RequestError,
    TransportError, TypedRequest,
};
use api_request_testing::request_test::assertions::{
    assert_completed, assert_failed_with, assert_header, assert_no_header,
};
use api_request_testing::{
    CallScript, ManualScheduler, MockTransport, RequestTest, TestContext, init_test_tracing,
};
use serde::Deserialize;
use std::error::Error as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_test::{assert_pending, assert_ready};

// ============================================================================
// Test Fixtures
// ============================================================================

#[derive(Debug, Clone, Deserialize, PartialEq)]
struct Beatmap {
    id: u64,
    title: String,
}

const NOT_FOUND: &str = r#"{"error":"Not found"}"#;

struct Counters {
    successes: Arc<AtomicUsize>,
    failures: Arc<AtomicUsize>,
}

impl Counters {
    fn attach<E: api_request_core::Endpoint>(request: &api_request_core::ApiRequest<E>) -> Self {
        let successes = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(AtomicUsize::new(0));

        let s = Arc::clone(&successes);
        request.on_success(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });
        let f = Arc::clone(&failures);
        request.on_failure(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        Self {
            successes,
            failures,
        }
    }

    fn get(&self) -> (usize, usize) {
        (
            self.successes.load(Ordering::SeqCst),
            self.failures.load(Ordering::SeqCst),
        )
    }
}

fn context_on(transport: &Arc<MockTransport>) -> TestContext {
    TestContext::new(transport.clone())
}

// ============================================================================
// Perform and post-processing
// ============================================================================

#[tokio::test]
async fn test_typed_request_completes_with_decoded_value() {
    init_test_tracing();

    RequestTest::new(Json::<Beatmap>::new("beatmaps/75"))
        .given_response(CallScript::body(r#"{"id":75,"title":"Disco Prince"}"#))
        .then_state(CompletionState::Completed)
        .then_response(|beatmap| {
            assert_eq!(beatmap.id, 75);
            assert_eq!(beatmap.title, "Disco Prince");
        })
        .then_call(|call| {
            assert_eq!(call.uri(), "http://localhost/api/beatmaps/75");
            assert_eq!(call.method(), Method::Get);
            assert_eq!(call.perform_count(), 1);
        })
        .run()
        .await;
}

#[tokio::test]
async fn test_untyped_request_completes_without_body() {
    RequestTest::new(Path::new("me").with_method(Method::Delete))
        .then_state(CompletionState::Completed)
        .then_call(|call| assert_eq!(call.method(), Method::Delete))
        .run()
        .await;
}

#[tokio::test]
async fn test_completed_call_without_value_fails() {
    RequestTest::new(Json::<Beatmap>::new("beatmaps/75"))
        .given_response(CallScript::ok())
        .then_state(CompletionState::Failed)
        .then_error(|error| assert!(matches!(error, RequestError::MissingResponse)))
        .run()
        .await;

    RequestTest::new(Json::<Beatmap>::new("beatmaps/75"))
        .given_response(CallScript::body("null"))
        .then_error(|error| assert_eq!(error.kind(), "missing_response"))
        .run()
        .await;
}

#[tokio::test]
async fn test_undecodable_success_body_fails_with_decode_error() {
    RequestTest::new(Json::<Beatmap>::new("beatmaps/75"))
        .given_response(CallScript::body(r#"{"id":"seventy-five"}"#))
        .then_state(CompletionState::Failed)
        .then_error(|error| assert_eq!(error.kind(), "decode"))
        .run()
        .await;
}

#[tokio::test]
async fn test_perform_without_context_never_creates_call() {
    RequestTest::new(Path::new("me"))
        .given_unattached()
        .then_state(CompletionState::Failed)
        .then_error(|error| assert_eq!(error.kind(), "not_bound"))
        .then_no_call()
        .run()
        .await;
}

#[tokio::test]
async fn test_perform_twice_creates_one_call() {
    let transport = Arc::new(MockTransport::default());
    let request = Request::new(Path::new("me"));
    request.attach(Arc::new(context_on(&transport)));
    let counters = Counters::attach(&request);

    request.perform().await;
    request.perform().await;

    assert_completed(&request);
    assert_eq!(counters.get(), (1, 0));
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test]
async fn test_call_is_configured_for_the_request() {
    let endpoint = Json::<Beatmap>::new("beatmaps")
        .with_method(Method::Post)
        .with_json_body(&serde_json::json!({ "title": "New" }))
        .unwrap();

    RequestTest::new(endpoint)
        .given_response(CallScript::body(r#"{"id":1,"title":"New"}"#))
        .then_call(|call| {
            assert_eq!(call.method(), Method::Post);
            assert!(!call.allow_retry_on_timeout());
            assert!(call.has_failure_callback());
            let (content_type, body) = call.body().unwrap();
            assert_eq!(content_type, "application/json");
            assert_eq!(body, br#"{"title":"New"}"#);
        })
        .run()
        .await;
}

// ============================================================================
// Headers
// ============================================================================

#[tokio::test]
async fn test_headers_for_authenticated_request() {
    RequestTest::new(Path::new("me"))
        .given_user(ApiUser::new(2, "peppy"), "abc123")
        .given_language("ko")
        .given_api_version(20_220_705)
        .then_call(|call| {
            assert_header(call, "Accept-Language", "ko");
            assert_header(call, "x-api-version", "20220705");
            assert_header(call, "Authorization", "Bearer abc123");
        })
        .run()
        .await;
}

#[tokio::test]
async fn test_headers_for_anonymous_request() {
    RequestTest::new(Path::new("changelog"))
        .then_call(|call| {
            assert_header(call, "Accept-Language", "en");
            assert_header(call, "x-api-version", "1");
            assert_no_header(call, "Authorization");
        })
        .run()
        .await;
}

#[tokio::test]
async fn test_empty_credential_sends_no_authorization() {
    RequestTest::new(Path::new("me"))
        .given_user(ApiUser::new(2, "peppy"), "")
        .then_call(|call| assert_no_header(call, "Authorization"))
        .run()
        .await;
}

#[tokio::test]
async fn test_user_is_snapshotted_at_perform() {
    let transport = Arc::new(MockTransport::default());
    let context = context_on(&transport).with_user(ApiUser::new(7, "cookiezi"), "t");

    let request = Request::new(Path::new("me"));
    assert!(request.user().is_none());
    request.attach(Arc::new(context));
    request.perform().await;

    assert_eq!(request.user(), Some(ApiUser::new(7, "cookiezi")));
}

// ============================================================================
// Failure classification
// ============================================================================

#[tokio::test]
async fn test_error_body_message_replaces_transport_fault() {
    RequestTest::new(Path::new("beatmaps/0"))
        .given_response(CallScript::status(404, NOT_FOUND))
        .then_state(CompletionState::Failed)
        .then_error(|error| {
            assert_eq!(error.to_string(), "Not found");
            assert_eq!(error.kind(), "api");

            let source = error.source().expect("decoded error keeps its cause");
            assert_eq!(source.to_string(), "Request failed with status 404: Not Found");
        })
        .run()
        .await;
}

#[tokio::test]
async fn test_malformed_error_body_keeps_transport_fault() {
    RequestTest::new(Path::new("beatmaps/0"))
        .given_response(CallScript::status(404, r#"{"error":"Not found""#))
        .then_error(|error| {
            assert!(matches!(
                error,
                RequestError::Transport(TransportError::Status { status: 404, .. })
            ));
        })
        .run()
        .await;
}

#[tokio::test]
async fn test_body_without_error_marker_keeps_transport_fault() {
    RequestTest::new(Path::new("beatmaps/0"))
        .given_response(CallScript::status(500, r#"{"message":"Not found"}"#))
        .then_error(|error| {
            assert_eq!(error.kind(), "transport");
            assert!(error.source().is_none());
        })
        .run()
        .await;
}

#[tokio::test]
async fn test_post_processing_fault_is_classified_against_body() {
    // A decode failure of a body carrying the marker still surfaces the server message
    RequestTest::new(Json::<Beatmap>::new("beatmaps/0"))
        .given_response(CallScript::body(NOT_FOUND))
        .then_error(|error| {
            assert_eq!(error.to_string(), "Not found");
            let RequestError::Api { source, .. } = error else {
                panic!("expected a decoded error, found {error:?}");
            };
            assert_eq!(source.kind(), "decode");
        })
        .run()
        .await;
}

#[tokio::test]
async fn test_async_callback_failure_from_transport_thread() {
    let transport = Arc::new(MockTransport::new(
        CallScript::callback_error(TransportError::Timeout).with_body(r#"{"error":"Slow down"}"#),
    ));
    let request = Request::new(Path::new("scores"));
    request.attach(Arc::new(context_on(&transport)));
    let (tx, rx) = std::sync::mpsc::channel();
    request.on_failure(move |error| {
        tx.send((error.to_string(), std::thread::current().id())).unwrap();
    });

    request.perform().await;

    assert_failed_with(&request, "api");
    // Listeners run on the transport's thread here, since the scheduler is immediate
    let (message, thread) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(message, "Slow down");
    assert_ne!(thread, std::thread::current().id());
    assert!(rx.try_recv().is_err());

    let call = transport.last_call().unwrap();
    assert!(call.abort_count() >= 1);
}

#[tokio::test]
async fn test_transport_error_surfaces_unchanged() {
    RequestTest::new(Path::new("me"))
        .given_response(CallScript::error(TransportError::Connection(
            "connection reset".to_string(),
        )))
        .then_error(|error| {
            assert_eq!(error.to_string(), "Connection failed: connection reset");
        })
        .run()
        .await;
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_in_flight_skips_body_inspection() {
    let transport = Arc::new(MockTransport::new(CallScript::hang().with_body(NOT_FOUND)));
    let request = TypedRequest::<Beatmap>::new(Json::new("beatmaps/0"));
    request.attach(Arc::new(context_on(&transport)));
    let counters = Counters::attach(&request);

    let mut performing = tokio_test::task::spawn(request.perform());
    assert_pending!(performing.poll());

    request.cancel();
    assert_ready!(performing.poll());
    drop(performing);

    assert_failed_with(&request, "cancelled");
    assert_eq!(counters.get(), (0, 1));

    let call = transport.last_call().unwrap();
    assert_eq!(call.abort_count(), 1);
    assert_eq!(call.body_reads(), 0);
}

#[tokio::test]
async fn test_cancel_before_perform_creates_no_call() {
    let transport = Arc::new(MockTransport::default());
    let request = Request::new(Path::new("me"));
    request.attach(Arc::new(context_on(&transport)));

    request.cancel();
    request.perform().await;

    assert_failed_with(&request, "cancelled");
    assert_eq!(transport.call_count(), 0);
}

#[tokio::test]
async fn test_cancel_after_completion_is_noop() {
    let transport = Arc::new(MockTransport::default());
    let request = Request::new(Path::new("me"));
    request.attach(Arc::new(context_on(&transport)));
    let counters = Counters::attach(&request);

    request.perform().await;
    request.cancel();
    request.fail(RequestError::MissingResponse);

    assert_completed(&request);
    assert_eq!(counters.get(), (1, 0));
    assert_eq!(transport.last_call().unwrap().abort_count(), 0);
}

#[tokio::test]
async fn test_delayed_call_cancelled_from_another_task() {
    let transport = Arc::new(MockTransport::new(
        CallScript::body("{}").with_delay(Duration::from_secs(10)),
    ));
    let request = Arc::new(Request::new(Path::new("slow")));
    request.attach(Arc::new(context_on(&transport)));
    let counters = Counters::attach(&request);

    let handle = request.handle();
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
    });

    tokio::time::timeout(Duration::from_secs(2), request.perform())
        .await
        .expect("cancel must stop the delayed call");
    canceller.await.unwrap();

    assert_eq!(request.finished().await, CompletionState::Failed);
    assert_eq!(counters.get(), (0, 1));
}

// ============================================================================
// Listener dispatch
// ============================================================================

#[tokio::test]
async fn test_listeners_run_only_through_scheduler() {
    let transport = Arc::new(MockTransport::default());
    let scheduler = Arc::new(ManualScheduler::new());
    let context = Arc::new(context_on(&transport).with_scheduler(scheduler.clone()));

    let request = Request::new(Path::new("me"));
    request.attach(context.clone());
    let counters = Counters::attach(&request);

    request.perform().await;

    assert_completed(&request);
    assert_eq!(counters.get(), (0, 0));
    assert_eq!(context.scheduled_count(), 1);

    assert_eq!(scheduler.run_pending(), 1);
    assert_eq!(counters.get(), (1, 0));
}

#[tokio::test]
async fn test_failure_listeners_run_only_through_scheduler() {
    let transport = Arc::new(MockTransport::new(CallScript::status(404, NOT_FOUND)));
    let scheduler = Arc::new(ManualScheduler::new());
    let context = Arc::new(context_on(&transport).with_scheduler(scheduler.clone()));

    let request = Request::new(Path::new("me"));
    request.attach(context);
    let counters = Counters::attach(&request);

    request.perform().await;

    assert_eq!(request.state(), CompletionState::Failed);
    assert_eq!(counters.get(), (0, 0));
    scheduler.run_pending();
    assert_eq!(counters.get(), (0, 1));
}

#[tokio::test]
async fn test_late_listener_is_dispatched_through_scheduler() {
    let transport = Arc::new(MockTransport::new(CallScript::body(r#"{"id":1,"title":"A"}"#)));
    let scheduler = Arc::new(ManualScheduler::new());
    let context = Arc::new(context_on(&transport).with_scheduler(scheduler.clone()));

    let request = TypedRequest::<Beatmap>::new(Json::new("beatmaps/1"));
    request.attach(context.clone());
    request.perform().await;
    scheduler.run_pending();

    let seen = Arc::new(Mutex::new(None));
    let seen_clone = Arc::clone(&seen);
    request.on_success(move |beatmap: &Beatmap| {
        *seen_clone.lock().unwrap() = Some(beatmap.id);
    });
    request.on_failure(|_| panic!("completed request must not notify failure"));

    assert!(seen.lock().unwrap().is_none());
    assert_eq!(scheduler.run_pending(), 1);
    assert_eq!(*seen.lock().unwrap(), Some(1));
}

#[tokio::test]
async fn test_listener_may_reenter_request() {
    let transport = Arc::new(MockTransport::new(CallScript::error(TransportError::Timeout)));
    let request = Arc::new(Request::new(Path::new("me")));
    request.attach(Arc::new(context_on(&transport)));

    let handle = request.handle();
    let reentered = Arc::new(AtomicUsize::new(0));
    let reentered_clone = Arc::clone(&reentered);
    request.on_failure(move |_| {
        // Runs inline on the immediate scheduler; the lock must already be released
        handle.cancel();
        assert_eq!(handle.state(), CompletionState::Failed);
        reentered_clone.fetch_add(1, Ordering::SeqCst);
    });

    request.perform().await;

    assert_eq!(reentered.load(Ordering::SeqCst), 1);
    assert_failed_with(&request, "transport");
}

#[tokio::test]
async fn test_listeners_fire_in_registration_order() {
    let transport = Arc::new(MockTransport::default());
    let request = Request::new(Path::new("me"));
    request.attach(Arc::new(context_on(&transport)) as Arc<dyn ApiContext>);

    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..4 {
        let order = Arc::clone(&order);
        request.on_success(move |_| order.lock().unwrap().push(i));
    }

    request.perform().await;

    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
}

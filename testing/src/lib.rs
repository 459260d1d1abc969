//! # API Request Testing
//!
//! Testing utilities and helpers for `api-request-core`.
//!
//! This crate provides:
//! - Scriptable transport, scheduler and context mocks
//! - A Given-When-Then harness for requests
//! - Property-based testing strategies for request transitions
//! - Tracing setup for tests
//!
//! ## Example
//!
//! ```ignore
//! use api_request_testing::{CallScript, RequestTest};
//! use api_request_core::{CompletionState, Json};
//!
//! #[tokio::test]
//! async fn test_missing_beatmap() {
//!     RequestTest::new(Json::<Beatmap>::new("beatmaps/0"))
//!         .given_response(CallScript::status(404, r#"{"error":"Not found"}"#))
//!         .then_state(CompletionState::Failed)
//!         .then_error(|error| assert_eq!(error.to_string(), "Not found"))
//!         .run()
//!         .await;
//! }
//! ```

pub mod mocks;

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;

    /// A transition a test can drive a request through
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Transition {
        /// `trigger_success`
        Succeed,
        /// `trigger_failure`
        TriggerFailure,
        /// `fail`
        Fail,
        /// `cancel`
        Cancel,
    }

    impl Transition {
        /// Whether this transition ends in `Completed`
        #[must_use]
        pub const fn is_success(self) -> bool {
            matches!(self, Self::Succeed)
        }
    }

    /// Any single transition
    pub fn transition() -> impl Strategy<Value = Transition> {
        prop_oneof![
            Just(Transition::Succeed),
            Just(Transition::TriggerFailure),
            Just(Transition::Fail),
            Just(Transition::Cancel),
        ]
    }

    /// A non-empty sequence of up to `max` transitions
    pub fn transitions(max: usize) -> impl Strategy<Value = Vec<Transition>> {
        prop::collection::vec(transition(), 1..=max.max(1))
    }
}

/// Install a `tracing` subscriber that writes through the test harness.
///
/// Honors `RUST_LOG`, defaulting to `warn`. Safe to call from every test.
pub fn init_test_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use mocks::{CallRecord, CallScript, ManualScheduler, MockCall, MockTransport, TestContext};
pub use request_test::RequestTest;

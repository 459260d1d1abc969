//! The request state machine
//!
//! An [`ApiRequest`] moves from `Waiting` to exactly one terminal state,
//! `Completed` or `Failed`, no matter how the calling thread, the transport's
//! failure callback and cancelling threads interleave. Every transition goes
//! through one mutex; whichever arrives first wins and later arrivals are
//! discarded without error.
//!
//! Listeners are `FnOnce` and are moved out of the lock when the terminal state
//! is committed, then handed to the scheduler of the bound [`ApiContext`]. They
//! never run while the lock is held, so a listener may freely call back into
//! the request.
//!
//! # Example
//!
//! ```ignore
//! let request = TypedRequest::<User>::new(Json::new("me"));
//! request.attach(context);
//! request.on_success(|user| println!("logged in as {}", user.username));
//! request.on_failure(|error| eprintln!("{error}"));
//! request.perform().await;
//! ```

use crate::context::{ApiContext, ApiUser};
use crate::endpoint::{Endpoint, Json, Path};
use crate::error::{RequestError, TransportError, classify};
use crate::scheduler::Task;
use crate::state::CompletionState;
use crate::transport::{ACCEPT_LANGUAGE, API_VERSION_HEADER, AUTHORIZATION, TransportCall};
use smallvec::SmallVec;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

/// Request whose success carries no payload
pub type Request = ApiRequest<Path>;

/// Request whose success carries a value decoded from the JSON response
pub type TypedRequest<T> = ApiRequest<Json<T>>;

type SuccessListener<T> = Box<dyn FnOnce(&T) + Send>;
type FailureListener = Box<dyn FnOnce(&RequestError) + Send>;
type Listeners<L> = SmallVec<[L; 2]>;

enum Outcome<T> {
    Completed(Arc<T>),
    Failed(Arc<RequestError>),
}

/// Lifecycle phase. Fields only exist in the phases where they are valid.
enum Phase<T> {
    Idle,
    InFlight {
        user: Option<ApiUser>,
        call: Option<Arc<dyn TransportCall>>,
    },
    Terminal {
        user: Option<ApiUser>,
        outcome: Outcome<T>,
    },
}

impl<T> Phase<T> {
    const fn state(&self) -> CompletionState {
        match self {
            Self::Idle | Self::InFlight { .. } => CompletionState::Waiting,
            Self::Terminal {
                outcome: Outcome::Completed(_),
                ..
            } => CompletionState::Completed,
            Self::Terminal {
                outcome: Outcome::Failed(_),
                ..
            } => CompletionState::Failed,
        }
    }

    const fn user(&self) -> Option<&ApiUser> {
        match self {
            Self::Idle => None,
            Self::InFlight { user, .. } | Self::Terminal { user, .. } => user.as_ref(),
        }
    }

    fn call(&self) -> Option<Arc<dyn TransportCall>> {
        match self {
            Self::InFlight { call, .. } => call.clone(),
            _ => None,
        }
    }

    fn response(&self) -> Option<Arc<T>> {
        match self {
            Self::Terminal {
                outcome: Outcome::Completed(value),
                ..
            } => Some(Arc::clone(value)),
            _ => None,
        }
    }

    fn error(&self) -> Option<Arc<RequestError>> {
        match self {
            Self::Terminal {
                outcome: Outcome::Failed(error),
                ..
            } => Some(Arc::clone(error)),
            _ => None,
        }
    }
}

/// Listener invocations owed after a transition, built under the lock and run outside it
enum Notification<T> {
    Success(Arc<T>, Listeners<SuccessListener<T>>),
    Failure(Arc<RequestError>, Listeners<FailureListener>),
}

impl<T: Send + Sync + 'static> Notification<T> {
    fn into_task(self) -> Task {
        match self {
            Self::Success(value, listeners) => Box::new(move || {
                for listener in listeners {
                    listener(&value);
                }
            }),
            Self::Failure(error, listeners) => Box::new(move || {
                for listener in listeners {
                    listener(&error);
                }
            }),
        }
    }
}

struct Inner<T> {
    context: Option<Arc<dyn ApiContext>>,
    phase: Phase<T>,
    on_success: Listeners<SuccessListener<T>>,
    on_failure: Listeners<FailureListener>,
}

impl<T> Inner<T> {
    /// Enter the terminal state. Callers must have checked the state is `Waiting`.
    fn commit(&mut self, outcome: Outcome<T>) -> Notification<T> {
        let user = match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => None,
            Phase::InFlight { user, .. } | Phase::Terminal { user, .. } => user,
        };

        let notification = match &outcome {
            Outcome::Completed(value) => {
                self.on_failure.clear();
                Notification::Success(Arc::clone(value), std::mem::take(&mut self.on_success))
            }
            Outcome::Failed(error) => {
                self.on_success.clear();
                Notification::Failure(Arc::clone(error), std::mem::take(&mut self.on_failure))
            }
        };

        self.phase = Phase::Terminal { user, outcome };
        notification
    }
}

/// Result of attempting a success transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Committed,
    AlreadyCompleted,
    AlreadyFailed,
}

/// State shared between the request, its handles and the transport's failure callback
struct Shared<T> {
    target: String,
    inner: Mutex<Inner<T>>,
    state: watch::Sender<CompletionState>,
}

impl<T: Send + Sync + 'static> Shared<T> {
    fn new(target: String) -> Self {
        let (state, _) = watch::channel(CompletionState::Waiting);
        Self {
            target,
            inner: Mutex::new(Inner {
                context: None,
                phase: Phase::Idle,
                on_success: SmallVec::new(),
                on_failure: SmallVec::new(),
            }),
            state,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn context(&self) -> Option<Arc<dyn ApiContext>> {
        self.lock().context.clone()
    }

    fn is_failing(&self) -> bool {
        self.lock().phase.state().is_failed()
    }

    /// Snapshot the acting user and enter `InFlight`. Only legal from `Idle`.
    fn begin(&self, user: Option<ApiUser>) -> bool {
        let mut inner = self.lock();

        if matches!(inner.phase, Phase::Idle) {
            inner.phase = Phase::InFlight { user, call: None };
            return true;
        }

        if matches!(inner.phase, Phase::InFlight { .. }) {
            tracing::warn!(path = %self.target, "Request is already in flight, ignoring perform");
        }
        false
    }

    fn set_call(&self, call: Arc<dyn TransportCall>) {
        if let Phase::InFlight { call: slot, .. } = &mut self.lock().phase {
            *slot = Some(call);
        }
    }

    fn complete(&self, value: Arc<T>) -> Transition {
        let (notification, context) = {
            let mut inner = self.lock();
            match inner.phase.state() {
                CompletionState::Completed => return Transition::AlreadyCompleted,
                CompletionState::Failed => return Transition::AlreadyFailed,
                CompletionState::Waiting => {}
            }
            (
                inner.commit(Outcome::Completed(value)),
                inner.context.clone(),
            )
        };

        self.state.send_replace(CompletionState::Completed);
        tracing::debug!(path = %self.target, "Request completed");
        dispatch(context.as_deref(), notification.into_task());
        Transition::Committed
    }

    fn trigger_failure(&self, error: RequestError) {
        let (notification, context) = {
            let mut inner = self.lock();
            if inner.phase.state().is_terminal() {
                return;
            }
            (
                inner.commit(Outcome::Failed(Arc::new(error))),
                inner.context.clone(),
            )
        };

        self.state.send_replace(CompletionState::Failed);
        dispatch(context.as_deref(), notification.into_task());
    }

    /// Classify `cause`, commit `Failed` and abort the in-flight call.
    ///
    /// The lock is held across body inspection so concurrent failures are
    /// classified and committed one at a time. The abort runs after the commit
    /// and outside the lock: a transport that reports the abort through its
    /// failure callback re-enters here and finds a terminal state.
    fn fail(&self, cause: RequestError) {
        let (notification, context, call) = {
            let mut inner = self.lock();
            if inner.phase.state().is_terminal() {
                return;
            }

            let call = inner.phase.call();
            let error = if cause.is_cancellation() {
                cause
            } else {
                let body = call.as_ref().and_then(|call| call.response_body_string());
                classify(cause, body.as_deref())
            };

            tracing::warn!(
                path = %self.target,
                kind = error.kind(),
                error = %error,
                "Request failed"
            );

            (
                inner.commit(Outcome::Failed(Arc::new(error))),
                inner.context.clone(),
                call,
            )
        };

        self.state.send_replace(CompletionState::Failed);
        if let Some(call) = call {
            call.abort();
        }
        dispatch(context.as_deref(), notification.into_task());
    }
}

/// Run `task` on the context's scheduler, or inline when no context is bound.
fn dispatch(context: Option<&dyn ApiContext>, task: Task) {
    match context {
        Some(context) => context.schedule(task),
        None => task(),
    }
}

fn attach_headers(call: &mut dyn TransportCall, context: &dyn ApiContext) {
    call.add_header(ACCEPT_LANGUAGE, &context.language());
    call.add_header(API_VERSION_HEADER, &context.api_version().to_string());

    if let Some(token) = context.access_token().filter(|token| !token.is_empty()) {
        call.add_header(AUTHORIZATION, &format!("Bearer {token}"));
    }
}

/// A single logical API operation
///
/// See the [module documentation](self) for the concurrency guarantees.
pub struct ApiRequest<E: Endpoint> {
    endpoint: E,
    shared: Arc<Shared<E::Response>>,
}

impl<E: Endpoint> ApiRequest<E> {
    /// Create a request for `endpoint`
    ///
    /// The target is computed once here and never changes afterwards.
    #[must_use]
    pub fn new(endpoint: E) -> Self {
        let shared = Arc::new(Shared::new(endpoint.target()));
        Self { endpoint, shared }
    }

    /// The endpoint this request calls
    #[must_use]
    pub const fn endpoint(&self) -> &E {
        &self.endpoint
    }

    /// Target of the call
    #[must_use]
    pub fn target(&self) -> &str {
        &self.shared.target
    }

    /// Bind the request to an API context
    ///
    /// Attaching the context the request is already bound to is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if the request is already bound to a different context.
    #[allow(clippy::panic)]
    pub fn attach(&self, context: Arc<dyn ApiContext>) {
        let mut inner = self.shared.lock();

        let rebinding = inner
            .context
            .as_ref()
            .is_some_and(|existing| !Arc::ptr_eq(existing, &context));
        if rebinding {
            drop(inner);
            panic!(
                "request to {} is already attached to a different API context",
                self.shared.target
            );
        }

        inner.context = Some(context);
    }

    /// Whether an API context is bound
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.shared.lock().context.is_some()
    }

    /// Run the request
    ///
    /// Never reports failure to the caller: every outcome, including a missing
    /// context, is delivered through the listeners. Between steps the request
    /// checks whether a failure was committed from another thread and stops if
    /// so, so a late success can never follow a failure.
    #[tracing::instrument(skip(self), fields(path = %self.shared.target))]
    pub async fn perform(&self) {
        let Some(context) = self.shared.context() else {
            self.shared.fail(RequestError::NotBound);
            return;
        };

        if !self.shared.begin(context.local_user()) {
            return;
        }
        if self.shared.is_failing() {
            return;
        }

        let uri = self.endpoint.uri(&context.endpoint());
        let mut call = context.transport().create_call(&uri);
        call.set_method(self.endpoint.method());

        let shared = Arc::downgrade(&self.shared);
        call.set_failure_callback(Arc::new(move |error: TransportError| {
            if let Some(shared) = shared.upgrade() {
                shared.fail(error.into());
            }
        }));
        call.set_allow_retry_on_timeout(false);

        self.endpoint.prepare(call.as_mut());
        attach_headers(call.as_mut(), context.as_ref());

        let call: Arc<dyn TransportCall> = Arc::from(call);
        self.shared.set_call(Arc::clone(&call));
        if self.shared.is_failing() {
            return;
        }

        tracing::debug!(uri = %uri, method = %self.endpoint.method(), "Performing request");
        if let Err(error) = call.perform().await {
            // No-op when the failure callback or a cancel already committed,
            // which is always the case for the abort we trigger ourselves.
            self.shared.fail(error.into());
        }
        if self.shared.is_failing() {
            return;
        }

        let value = match self.endpoint.post_process(call.as_ref()) {
            Ok(Some(value)) => value,
            Ok(None) => {
                self.shared.fail(RequestError::MissingResponse);
                return;
            }
            Err(error) => {
                self.shared.fail(error);
                return;
            }
        };
        if self.shared.is_failing() {
            return;
        }

        self.shared.complete(Arc::new(value));
    }

    /// Cancel the request
    ///
    /// A no-op if the request already reached a terminal state.
    pub fn cancel(&self) {
        self.shared.fail(RequestError::Cancelled);
    }

    /// Fail the request with `error`
    ///
    /// Aborts the in-flight call and, unless `error` is a cancellation, replaces
    /// it with the server's message when the response body carries one.
    pub fn fail(&self, error: RequestError) {
        self.shared.fail(error);
    }

    /// Commit `Failed` with `error` as-is, without inspecting the response
    pub fn trigger_failure(&self, error: RequestError) {
        self.shared.trigger_failure(error);
    }

    /// Commit `Completed` with `value`
    ///
    /// A no-op if the request already failed.
    ///
    /// # Panics
    ///
    /// Panics if the request already completed: success was triggered more than once.
    #[allow(clippy::panic)]
    pub fn trigger_success_with(&self, value: E::Response) {
        if self.shared.complete(Arc::new(value)) == Transition::AlreadyCompleted {
            panic!(
                "success triggered more than once for request to {}",
                self.shared.target
            );
        }
    }

    /// Register a listener for the success notification
    ///
    /// Registering after the request completed schedules the listener right
    /// away; registering after it failed drops the listener.
    pub fn on_success<F>(&self, listener: F)
    where
        F: FnOnce(&E::Response) + Send + 'static,
    {
        let mut inner = self.shared.lock();
        match inner.phase.state() {
            CompletionState::Waiting => inner.on_success.push(Box::new(listener)),
            CompletionState::Failed => {}
            CompletionState::Completed => {
                let value = inner.phase.response();
                let context = inner.context.clone();
                drop(inner);
                if let Some(value) = value {
                    dispatch(context.as_deref(), Box::new(move || listener(&value)));
                }
            }
        }
    }

    /// Register a listener for the failure notification
    ///
    /// Registering after the request failed schedules the listener right away;
    /// registering after it completed drops the listener.
    pub fn on_failure<F>(&self, listener: F)
    where
        F: FnOnce(&RequestError) + Send + 'static,
    {
        let mut inner = self.shared.lock();
        match inner.phase.state() {
            CompletionState::Waiting => inner.on_failure.push(Box::new(listener)),
            CompletionState::Completed => {}
            CompletionState::Failed => {
                let error = inner.phase.error();
                let context = inner.context.clone();
                drop(inner);
                if let Some(error) = error {
                    dispatch(context.as_deref(), Box::new(move || listener(&error)));
                }
            }
        }
    }

    /// Current completion state
    #[must_use]
    pub fn state(&self) -> CompletionState {
        self.shared.lock().phase.state()
    }

    /// Whether the request has failed
    #[must_use]
    pub fn is_failing(&self) -> bool {
        self.shared.is_failing()
    }

    /// The user the request acted for, snapshotted when it was performed
    #[must_use]
    pub fn user(&self) -> Option<ApiUser> {
        self.shared.lock().phase.user().cloned()
    }

    /// The response value, once completed
    #[must_use]
    pub fn response(&self) -> Option<Arc<E::Response>> {
        self.shared.lock().phase.response()
    }

    /// The failure, once failed
    #[must_use]
    pub fn error(&self) -> Option<Arc<RequestError>> {
        self.shared.lock().phase.error()
    }

    /// Wait until the request reaches a terminal state
    pub async fn finished(&self) -> CompletionState {
        let mut receiver = self.shared.state.subscribe();
        match receiver.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    /// A cloneable handle that can cancel the request from another thread
    #[must_use]
    pub fn handle(&self) -> RequestHandle<E::Response> {
        RequestHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E: Endpoint<Response = ()>> ApiRequest<E> {
    /// Commit `Completed`
    ///
    /// A no-op if the request already reached a terminal state.
    pub fn trigger_success(&self) {
        self.shared.complete(Arc::new(()));
    }
}

impl<E: Endpoint + fmt::Debug> fmt::Debug for ApiRequest<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiRequest")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Handle to a request, shareable across threads
pub struct RequestHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + Sync + 'static> RequestHandle<T> {
    /// Cancel the request. A no-op once terminal.
    pub fn cancel(&self) {
        self.shared.fail(RequestError::Cancelled);
    }

    /// Fail the request with `error`. A no-op once terminal.
    pub fn fail(&self, error: RequestError) {
        self.shared.fail(error);
    }

    /// Current completion state
    #[must_use]
    pub fn state(&self) -> CompletionState {
        self.shared.lock().phase.state()
    }
}

impl<T> Clone for RequestHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for RequestHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("target", &self.shared.target)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::scheduler::{ImmediateScheduler, Scheduler};
    use crate::transport::Transport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoTransport;

    impl Transport for NoTransport {
        #[allow(clippy::unimplemented)]
        fn create_call(&self, _uri: &str) -> Box<dyn TransportCall> {
            unimplemented!("state machine tests never perform")
        }
    }

    struct StubContext;

    impl ApiContext for StubContext {
        fn local_user(&self) -> Option<ApiUser> {
            None
        }
        fn language(&self) -> String {
            "en".to_string()
        }
        fn api_version(&self) -> u32 {
            1
        }
        fn access_token(&self) -> Option<String> {
            None
        }
        fn endpoint(&self) -> String {
            "http://localhost".to_string()
        }
        fn transport(&self) -> Arc<dyn Transport> {
            Arc::new(NoTransport)
        }
        fn schedule(&self, task: Task) {
            ImmediateScheduler.schedule(task);
        }
    }

    fn counters<E: Endpoint>(request: &ApiRequest<E>) -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
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

        (successes, failures)
    }

    #[test]
    fn test_new_request_is_waiting() {
        let request = Request::new(Path::new("me"));
        assert_eq!(request.state(), CompletionState::Waiting);
        assert_eq!(request.target(), "me");
        assert!(!request.is_attached());
        assert!(request.user().is_none());
    }

    #[test]
    fn test_trigger_success_twice_is_noop() {
        let request = Request::new(Path::new("me"));
        let (successes, failures) = counters(&request);

        request.trigger_success();
        request.trigger_success();
        request.trigger_failure(RequestError::MissingResponse);

        assert_eq!(request.state(), CompletionState::Completed);
        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert_eq!(failures.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failure_then_success_is_noop() {
        let request = Request::new(Path::new("me"));
        let (successes, failures) = counters(&request);

        request.cancel();
        request.cancel();
        request.trigger_success();

        assert_eq!(request.state(), CompletionState::Failed);
        assert!(request.error().unwrap().is_cancellation());
        assert_eq!(successes.load(Ordering::SeqCst), 0);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "success triggered more than once")]
    fn test_typed_success_twice_panics() {
        let request = TypedRequest::<u32>::new(Json::new("count"));
        request.trigger_success_with(1);
        request.trigger_success_with(2);
    }

    #[test]
    fn test_typed_success_after_failure_is_noop() {
        let request = TypedRequest::<u32>::new(Json::new("count"));
        request.cancel();
        request.trigger_success_with(1);

        assert_eq!(request.state(), CompletionState::Failed);
        assert!(request.response().is_none());
    }

    #[test]
    fn test_typed_success_stores_response() {
        let request = TypedRequest::<u32>::new(Json::new("count"));
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        request.on_success(move |value| {
            seen_clone.store(*value as usize, Ordering::SeqCst);
        });

        request.trigger_success_with(42);

        assert_eq!(*request.response().unwrap(), 42);
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn test_late_listeners() {
        let request = Request::new(Path::new("me"));
        request.trigger_success();

        let (successes, failures) = counters(&request);
        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert_eq!(failures.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_attach_same_context_twice() {
        let context: Arc<dyn ApiContext> = Arc::new(StubContext);
        let request = Request::new(Path::new("me"));

        request.attach(Arc::clone(&context));
        request.attach(context);

        assert!(request.is_attached());
    }

    #[test]
    #[should_panic(expected = "already attached to a different API context")]
    fn test_attach_different_context_panics() {
        let request = Request::new(Path::new("me"));
        request.attach(Arc::new(StubContext));
        request.attach(Arc::new(StubContext));
    }

    #[tokio::test]
    async fn test_perform_without_context_fails_not_bound() {
        let request = Request::new(Path::new("me"));
        let (successes, failures) = counters(&request);

        request.perform().await;

        assert_eq!(request.state(), CompletionState::Failed);
        assert!(matches!(
            request.error().as_deref(),
            Some(RequestError::NotBound)
        ));
        assert_eq!(successes.load(Ordering::SeqCst), 0);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_perform_after_cancel_never_creates_call() {
        // NoTransport panics if a call is created
        let request = Request::new(Path::new("me"));
        request.attach(Arc::new(StubContext));
        request.cancel();

        request.perform().await;

        assert_eq!(request.state(), CompletionState::Failed);
    }

    #[tokio::test]
    async fn test_finished_resolves_with_terminal_state() {
        let request = Arc::new(Request::new(Path::new("me")));
        let handle = request.handle();

        let waiter = {
            let request = Arc::clone(&request);
            tokio::spawn(async move { request.finished().await })
        };
        handle.cancel();

        assert_eq!(waiter.await.unwrap(), CompletionState::Failed);
        assert_eq!(handle.state(), CompletionState::Failed);
    }
}

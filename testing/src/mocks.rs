//! Mock collaborators for request tests
//!
//! - [`MockTransport`] creates scripted [`MockCall`]s and keeps a [`CallRecord`]
//!   of everything each call was configured with and asked to do.
//! - [`ManualScheduler`] queues notifications until the test runs them.
//! - [`TestContext`] is an [`ApiContext`] with fixed credentials that counts
//!   how often it was asked to schedule a notification.

use api_request_core::context::{ApiContext, ApiUser};
use api_request_core::error::TransportError;
use api_request_core::scheduler::{ImmediateScheduler, Scheduler, Task};
use api_request_core::transport::{FailureCallback, Method, Transport, TransportCall};
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
enum Outcome {
    Succeed,
    Fail(TransportError),
    FailViaCallback(TransportError),
    Hang,
}

/// Scripted behaviour of one mock call
///
/// # Example
///
/// ```
/// use api_request_testing::mocks::CallScript;
/// use std::time::Duration;
///
/// let script = CallScript::status(404, r#"{"error":"Not found"}"#)
///     .with_delay(Duration::from_millis(5));
/// ```
#[derive(Debug, Clone)]
pub struct CallScript {
    outcome: Outcome,
    body: Option<String>,
    delay: Option<Duration>,
}

impl CallScript {
    /// Succeed without a body
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            outcome: Outcome::Succeed,
            body: None,
            delay: None,
        }
    }

    /// Succeed with `body`
    #[must_use]
    pub fn body(body: impl Into<String>) -> Self {
        Self::ok().with_body(body)
    }

    /// Answer with a non-success `status` and `body`
    #[must_use]
    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self::error(TransportError::Status {
            status,
            reason: reason_phrase(status).to_string(),
        })
        .with_body(body)
    }

    /// Resolve `perform` with `error`
    #[must_use]
    pub const fn error(error: TransportError) -> Self {
        Self {
            outcome: Outcome::Fail(error),
            body: None,
            delay: None,
        }
    }

    /// Report `error` through the failure callback from another thread, then
    /// wait to be aborted
    #[must_use]
    pub const fn callback_error(error: TransportError) -> Self {
        Self {
            outcome: Outcome::FailViaCallback(error),
            body: None,
            delay: None,
        }
    }

    /// Never finish on its own; resolve with `Aborted` once aborted
    #[must_use]
    pub const fn hang() -> Self {
        Self {
            outcome: Outcome::Hang,
            body: None,
            delay: None,
        }
    }

    /// Make the response body `body`
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Wait `delay` before the outcome (abortable)
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

const fn reason_phrase(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "",
    }
}

#[derive(Debug, Clone)]
struct CallConfig {
    method: Method,
    headers: Vec<(String, String)>,
    body: Option<(String, Vec<u8>)>,
    allow_retry_on_timeout: bool,
    has_failure_callback: bool,
}

/// Everything a mock call was configured with and asked to do
#[derive(Debug)]
pub struct CallRecord {
    uri: String,
    config: Mutex<CallConfig>,
    performs: AtomicUsize,
    aborts: AtomicUsize,
    body_reads: AtomicUsize,
}

impl CallRecord {
    fn new(uri: &str) -> Self {
        Self {
            uri: uri.to_string(),
            config: Mutex::new(CallConfig {
                method: Method::Get,
                headers: Vec::new(),
                body: None,
                allow_retry_on_timeout: true,
                has_failure_callback: false,
            }),
            performs: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
            body_reads: AtomicUsize::new(0),
        }
    }

    /// Target URI
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// HTTP method
    #[must_use]
    pub fn method(&self) -> Method {
        lock(&self.config).method
    }

    /// All headers in the order they were added
    #[must_use]
    pub fn headers(&self) -> Vec<(String, String)> {
        lock(&self.config).headers.clone()
    }

    /// Value of the first header named `name` (case-insensitive)
    #[must_use]
    pub fn header(&self, name: &str) -> Option<String> {
        lock(&self.config)
            .headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
    }

    /// Request body and its content type
    #[must_use]
    pub fn body(&self) -> Option<(String, Vec<u8>)> {
        lock(&self.config).body.clone()
    }

    /// Whether the transport may retry on its own after a timeout
    #[must_use]
    pub fn allow_retry_on_timeout(&self) -> bool {
        lock(&self.config).allow_retry_on_timeout
    }

    /// Whether a failure callback was installed
    #[must_use]
    pub fn has_failure_callback(&self) -> bool {
        lock(&self.config).has_failure_callback
    }

    /// How many times `perform` was called
    #[must_use]
    pub fn perform_count(&self) -> usize {
        self.performs.load(Ordering::SeqCst)
    }

    /// How many times `abort` was called
    #[must_use]
    pub fn abort_count(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    /// How many times the response body was read
    #[must_use]
    pub fn body_reads(&self) -> usize {
        self.body_reads.load(Ordering::SeqCst)
    }
}

/// Transport call driven by a [`CallScript`]
pub struct MockCall {
    record: Arc<CallRecord>,
    script: CallScript,
    failure_callback: Option<FailureCallback>,
    aborted: AtomicBool,
    abort_signal: Notify,
    response: Mutex<Option<String>>,
}

impl MockCall {
    fn new(record: Arc<CallRecord>, script: CallScript) -> Self {
        Self {
            record,
            script,
            failure_callback: None,
            aborted: AtomicBool::new(false),
            abort_signal: Notify::new(),
            response: Mutex::new(None),
        }
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

impl TransportCall for MockCall {
    fn uri(&self) -> &str {
        &self.record.uri
    }

    fn set_method(&mut self, method: Method) {
        lock(&self.record.config).method = method;
    }

    fn set_body(&mut self, content_type: &str, body: Vec<u8>) {
        lock(&self.record.config).body = Some((content_type.to_string(), body));
    }

    fn add_header(&mut self, name: &str, value: &str) {
        lock(&self.record.config)
            .headers
            .push((name.to_string(), value.to_string()));
    }

    fn set_allow_retry_on_timeout(&mut self, allow: bool) {
        lock(&self.record.config).allow_retry_on_timeout = allow;
    }

    fn set_failure_callback(&mut self, callback: FailureCallback) {
        lock(&self.record.config).has_failure_callback = true;
        self.failure_callback = Some(callback);
    }

    fn perform(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.record.performs.fetch_add(1, Ordering::SeqCst);

            if let Some(delay) = self.script.delay {
                tokio::select! {
                    biased;
                    () = self.abort_signal.notified() => return Err(TransportError::Aborted),
                    () = tokio::time::sleep(delay) => {}
                }
            }
            if self.is_aborted() {
                return Err(TransportError::Aborted);
            }

            *lock(&self.response) = self.script.body.clone();

            match &self.script.outcome {
                Outcome::Succeed => Ok(()),
                Outcome::Fail(error) => Err(error.clone()),
                Outcome::FailViaCallback(error) => {
                    if let Some(callback) = self.failure_callback.clone() {
                        let error = error.clone();
                        std::thread::spawn(move || callback(error));
                    }
                    self.abort_signal.notified().await;
                    Err(TransportError::Aborted)
                }
                Outcome::Hang => {
                    self.abort_signal.notified().await;
                    Err(TransportError::Aborted)
                }
            }
        })
    }

    fn abort(&self) {
        self.record.aborts.fetch_add(1, Ordering::SeqCst);
        if !self.aborted.swap(true, Ordering::SeqCst) {
            self.abort_signal.notify_one();
        }
    }

    fn response_body_string(&self) -> Option<String> {
        self.record.body_reads.fetch_add(1, Ordering::SeqCst);
        lock(&self.response).clone()
    }

    fn response_length(&self) -> Option<u64> {
        lock(&self.response).as_ref().map(|body| body.len() as u64)
    }
}

impl fmt::Debug for MockCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockCall")
            .field("record", &self.record)
            .field("script", &self.script)
            .finish_non_exhaustive()
    }
}

/// Transport handing out scripted calls
///
/// Queued scripts are used in order, one per call; once the queue is empty
/// every call uses the default script.
#[derive(Debug)]
pub struct MockTransport {
    default_script: CallScript,
    queued: Mutex<VecDeque<CallScript>>,
    calls: Mutex<Vec<Arc<CallRecord>>>,
}

impl MockTransport {
    /// Create a transport whose calls all follow `script`
    #[must_use]
    pub fn new(script: CallScript) -> Self {
        Self {
            default_script: script,
            queued: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Use `script` for the next call that has no queued script yet
    pub fn push(&self, script: CallScript) {
        lock(&self.queued).push_back(script);
    }

    /// Records of every call created so far
    #[must_use]
    pub fn calls(&self) -> Vec<Arc<CallRecord>> {
        lock(&self.calls).clone()
    }

    /// Record of the most recently created call
    #[must_use]
    pub fn last_call(&self) -> Option<Arc<CallRecord>> {
        lock(&self.calls).last().cloned()
    }

    /// Number of calls created
    #[must_use]
    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new(CallScript::ok())
    }
}

impl Transport for MockTransport {
    fn create_call(&self, uri: &str) -> Box<dyn TransportCall> {
        let script = lock(&self.queued)
            .pop_front()
            .unwrap_or_else(|| self.default_script.clone());
        let record = Arc::new(CallRecord::new(uri));
        lock(&self.calls).push(Arc::clone(&record));

        Box::new(MockCall::new(record, script))
    }
}

/// Scheduler that queues tasks until [`ManualScheduler::run_pending`] is called
#[derive(Default)]
pub struct ManualScheduler {
    queue: Mutex<VecDeque<Task>>,
}

impl ManualScheduler {
    /// Create an empty scheduler
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued tasks
    #[must_use]
    pub fn pending(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Run queued tasks, including any they schedule, until the queue is empty
    ///
    /// Returns how many tasks ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            // Tasks may schedule more tasks, so the lock is not held while one runs
            let Some(task) = lock(&self.queue).pop_front() else {
                return ran;
            };
            task();
            ran += 1;
        }
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, task: Task) {
        lock(&self.queue).push_back(task);
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("pending", &self.pending())
            .finish()
    }
}

/// [`ApiContext`] with fixed credentials for tests
///
/// # Example
///
/// ```
/// use api_request_core::ApiUser;
/// use api_request_testing::mocks::{MockTransport, TestContext};
/// use std::sync::Arc;
///
/// let context = TestContext::new(Arc::new(MockTransport::default()))
///     .with_user(ApiUser::new(2, "peppy"), "token")
///     .with_language("de");
/// ```
pub struct TestContext {
    user: Option<ApiUser>,
    token: Option<String>,
    language: String,
    api_version: u32,
    endpoint: String,
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
    scheduled: AtomicUsize,
}

impl TestContext {
    /// Anonymous context on `transport`, running notifications inline
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            user: None,
            token: None,
            language: "en".to_string(),
            api_version: 1,
            endpoint: "http://localhost/api".to_string(),
            transport,
            scheduler: Arc::new(ImmediateScheduler),
            scheduled: AtomicUsize::new(0),
        }
    }

    /// Authenticate as `user` with `token`
    #[must_use]
    pub fn with_user(mut self, user: ApiUser, token: impl Into<String>) -> Self {
        self.user = Some(user);
        self.token = Some(token.into());
        self
    }

    /// Use `language` as the locale
    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// Use `version` as the API version
    #[must_use]
    pub const fn with_api_version(mut self, version: u32) -> Self {
        self.api_version = version;
        self
    }

    /// Deliver notifications through `scheduler`
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// How many notifications were handed to the scheduler
    #[must_use]
    pub fn scheduled_count(&self) -> usize {
        self.scheduled.load(Ordering::SeqCst)
    }
}

impl ApiContext for TestContext {
    fn local_user(&self) -> Option<ApiUser> {
        self.user.clone()
    }

    fn language(&self) -> String {
        self.language.clone()
    }

    fn api_version(&self) -> u32 {
        self.api_version
    }

    fn access_token(&self) -> Option<String> {
        self.token.clone()
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    fn schedule(&self, task: Task) {
        self.scheduled.fetch_add(1, Ordering::SeqCst);
        self.scheduler.schedule(task);
    }
}

impl fmt::Debug for TestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestContext")
            .field("user", &self.user)
            .field("language", &self.language)
            .field("api_version", &self.api_version)
            .finish_non_exhaustive()
    }
}

//! API context: credentials, locale and execution context
//!
//! A request is bound to exactly one [`ApiContext`]. The context supplies the
//! authenticated identity, the headers every call carries, the transport that
//! performs the exchange, and the scheduler listeners are notified on.

use crate::config::ApiConfig;
use crate::scheduler::{Scheduler, Task};
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// The authenticated identity a request acts on behalf of
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApiUser {
    /// Server-assigned user id
    pub id: u64,
    /// Display name
    pub username: String,
}

impl ApiUser {
    /// Create a new user
    #[must_use]
    pub fn new(id: u64, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
        }
    }
}

/// Everything a request needs from its environment
pub trait ApiContext: Send + Sync {
    /// The currently authenticated user, if any
    fn local_user(&self) -> Option<ApiUser>;

    /// Active locale, sent as `Accept-Language`
    fn language(&self) -> String;

    /// Protocol version, sent as `x-api-version`
    fn api_version(&self) -> u32;

    /// Bearer credential of the active session, if any
    fn access_token(&self) -> Option<String>;

    /// Base URL request targets are joined onto
    fn endpoint(&self) -> String;

    /// Transport used to create calls
    fn transport(&self) -> Arc<dyn Transport>;

    /// Marshal `task` onto this context's execution context
    fn schedule(&self, task: Task);
}

#[derive(Debug, Default)]
struct Session {
    user: Option<ApiUser>,
    token: Option<String>,
    language: Option<String>,
}

/// [`ApiContext`] backed by an [`ApiConfig`] and a mutable session
///
/// # Example
///
/// ```ignore
/// let context = Arc::new(SessionContext::new(
///     ApiConfig::from_env()?,
///     Arc::new(ReqwestTransport::new(Duration::from_secs(30))?),
///     Arc::new(update_thread.scheduler()),
/// ));
///
/// context.login(ApiUser::new(2, "peppy"), "token");
/// ```
pub struct SessionContext {
    config: ApiConfig,
    session: RwLock<Session>,
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
}

impl SessionContext {
    /// Create a context with no active session
    #[must_use]
    pub fn new(
        config: ApiConfig,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            config,
            session: RwLock::new(Session::default()),
            transport,
            scheduler,
        }
    }

    /// The configuration this context was built from
    #[must_use]
    pub const fn config(&self) -> &ApiConfig {
        &self.config
    }

    /// Start a session for `user` authenticated by `token`
    pub fn login(&self, user: ApiUser, token: impl Into<String>) {
        let mut session = self
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        tracing::info!(user_id = user.id, "Session started");
        session.user = Some(user);
        session.token = Some(token.into());
    }

    /// End the active session
    ///
    /// Requests performed afterwards go out unauthenticated.
    pub fn logout(&self) {
        let mut session = self
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        tracing::info!("Session ended");
        session.user = None;
        session.token = None;
    }

    /// Override the configured locale
    pub fn set_language(&self, language: impl Into<String>) {
        self.session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .language = Some(language.into());
    }

    fn read<R>(&self, f: impl FnOnce(&Session) -> R) -> R {
        f(&self.session.read().unwrap_or_else(PoisonError::into_inner))
    }
}

impl ApiContext for SessionContext {
    fn local_user(&self) -> Option<ApiUser> {
        self.read(|session| session.user.clone())
    }

    fn language(&self) -> String {
        self.read(|session| session.language.clone())
            .unwrap_or_else(|| self.config.language.clone())
    }

    fn api_version(&self) -> u32 {
        self.config.api_version
    }

    fn access_token(&self) -> Option<String> {
        self.read(|session| session.token.clone())
    }

    fn endpoint(&self) -> String {
        self.config.endpoint.clone()
    }

    fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    fn schedule(&self, task: Task) {
        self.scheduler.schedule(task);
    }
}

// Manual Debug implementation since the collaborators are trait objects
impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("config", &self.config)
            .field("user", &self.local_user())
            .finish_non_exhaustive()
    }
}

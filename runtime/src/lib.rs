//! # API Request Runtime
//!
//! Production collaborators for `api-request-core`.
//!
//! ## Core Components
//!
//! - **ReqwestTransport**: HTTP transport with per-call timeout and abort
//! - **TokioScheduler**: Delivers listener notifications on a tokio runtime
//! - **UpdateThread**: Delivers listener notifications on one dedicated thread
//! - **InstrumentedTransport**: Records Prometheus metrics for every call
//!
//! ## Example
//!
//! ```ignore
//! use api_request_core::{ApiConfig, Json, SessionContext, TypedRequest};
//! use api_request_runtime::{ReqwestTransport, UpdateThread};
//! use std::sync::Arc;
//!
//! let config = ApiConfig::from_env()?;
//! let update_thread = UpdateThread::spawn("update")?;
//! let context = Arc::new(SessionContext::new(
//!     config.clone(),
//!     Arc::new(ReqwestTransport::from_config(&config)?),
//!     Arc::new(update_thread.scheduler()),
//! ));
//!
//! let request = TypedRequest::<User>::new(Json::new("me"));
//! request.attach(context);
//! request.on_success(|user| println!("Hello, {}", user.username));
//! request.perform().await;
//! ```

/// Prometheus metrics for API calls
pub mod metrics;

/// Schedulers for listener notifications
pub mod scheduler;

/// reqwest-backed transport
pub mod transport;

pub use metrics::{InstrumentedTransport, MetricsError, MetricsServer, RequestMetrics};
pub use scheduler::{SchedulerError, TokioScheduler, UpdateScheduler, UpdateThread};
pub use transport::{ReqwestCall, ReqwestTransport};

//! # API Request Core
//!
//! Request lifecycle state machine shared by every remote API call.
//!
//! A request moves from "not yet started" through "in flight" to exactly one
//! terminal outcome, even when the thread performing the network exchange, the
//! transport's own failure callback and cancelling threads race each other.
//!
//! ## Core Concepts
//!
//! - **CompletionState**: `Waiting`, then exactly one of `Completed` or `Failed`
//! - **ApiRequest**: The state machine, generic over an `Endpoint`
//! - **Endpoint**: Per-call capabilities (target, preparation, post-processing)
//! - **ApiContext**: Credentials, locale, transport and scheduler a request is bound to
//! - **Transport**: The collaborator performing the actual HTTP exchange
//! - **Scheduler**: Where listener notifications run
//!
//! ## Guarantees
//!
//! - Exactly one of the success or failure listener sets fires, exactly once
//! - Transitions after the terminal state are silent no-ops
//! - Listeners always run through the bound context's scheduler, never under the lock
//! - Failures are never returned to the caller of `perform`
//!
//! ## Example
//!
//! ```ignore
//! use api_request_core::*;
//!
//! #[derive(serde::Deserialize)]
//! struct User {
//!     id: u64,
//!     username: String,
//! }
//!
//! let request = TypedRequest::<User>::new(Json::new("me"));
//! request.attach(context);
//!
//! request.on_success(|user| println!("Hello, {}", user.username));
//! request.on_failure(|error| eprintln!("Could not load user: {error}"));
//!
//! request.perform().await;
//! ```

pub mod config;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod request;
pub mod scheduler;
pub mod state;
pub mod transport;

// Re-export commonly used types
pub use config::{ApiConfig, ConfigError};
pub use context::{ApiContext, ApiUser, SessionContext};
pub use endpoint::{Endpoint, Json, Path};
pub use error::{DisplayableError, RequestError, TransportError};
pub use request::{ApiRequest, Request, RequestHandle, TypedRequest};
pub use scheduler::{ImmediateScheduler, Scheduler, Task};
pub use state::CompletionState;
pub use transport::{FailureCallback, Method, Transport, TransportCall};

//! Completion state of a single request.

use std::fmt;

/// Where a request stands in its lifecycle.
///
/// The only legal transitions are `Waiting → Completed` and `Waiting → Failed`.
/// Both terminal values are sticky: once a request has reached one of them,
/// every later attempt to transition is silently discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompletionState {
    /// Not yet started, or in flight.
    #[default]
    Waiting,

    /// The call succeeded and success listeners were scheduled.
    Completed,

    /// The call failed (or was cancelled) and failure listeners were scheduled.
    Failed,
}

impl CompletionState {
    /// Check if this is a terminal state
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Check if the request completed successfully
    #[must_use]
    pub const fn is_completed(self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Check if the request failed
    #[must_use]
    pub const fn is_failed(self) -> bool {
        matches!(self, Self::Failed)
    }
}

impl fmt::Display for CompletionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

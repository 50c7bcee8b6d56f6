//! Error types for the events crate.

use std::fmt;

/// Result type alias for event bus operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Event bus error types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Every sender was dropped; no more events will arrive.
    ChannelClosed,
    /// The subscriber fell behind and the oldest events were overwritten.
    Lagged { skipped: u64 },
    /// Subscription could not be established.
    SubscriptionFailed { reason: String },
    /// Invalid event data.
    InvalidEvent { reason: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChannelClosed => write!(f, "event channel closed"),
            Self::Lagged { skipped } => {
                write!(f, "subscriber lagged behind, {skipped} events skipped")
            }
            Self::SubscriptionFailed { reason } => write!(f, "subscription failed: {reason}"),
            Self::InvalidEvent { reason } => write!(f, "invalid event: {reason}"),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Create a subscription failed error.
    pub fn subscription_failed(reason: impl Into<String>) -> Self {
        Self::SubscriptionFailed {
            reason: reason.into(),
        }
    }

    /// Create an invalid event error.
    pub fn invalid_event(reason: impl Into<String>) -> Self {
        Self::InvalidEvent {
            reason: reason.into(),
        }
    }

    /// Whether the subscription can keep receiving after this error.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Lagged { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Lagged { skipped: 12 };
        assert!(err.to_string().contains("12"));

        let err = Error::subscription_failed("bus shut down");
        assert!(err.to_string().contains("bus shut down"));
    }

    #[test]
    fn test_lagged_is_recoverable() {
        assert!(Error::Lagged { skipped: 1 }.is_recoverable());
        assert!(!Error::ChannelClosed.is_recoverable());
    }
}

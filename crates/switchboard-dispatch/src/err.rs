//! Declare error types for switchboard-dispatch.

use std::fmt;
use std::sync::Arc;

use futures::task::SpawnError;
use thiserror::Error;

/// An error returned by the channel dispatcher.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A caller tried to steer or claim a dispatch operation that is
    /// already finishing.
    ///
    /// This is also what the loser of a `HandleWith`/`Claim` race sees.
    #[error("Dispatch operation already finished (or trying to)")]
    NotYours,

    /// A caller passed `HandleWith` a name that is not a well-formed
    /// client name.
    #[error("Invalid handler name: {0:?}")]
    InvalidHandlerName(String),

    /// A dispatch operation was constructed over an empty channel list.
    #[error("A dispatch operation needs at least one channel")]
    NoChannels,

    /// A dispatch operation that would invoke a handler was constructed
    /// without any possible handlers.
    #[error("A handled dispatch operation needs at least one possible handler")]
    NoPossibleHandlers,

    /// A dispatch operation was asked to both stop after observers and
    /// wait for approval.
    #[error("An observe-only dispatch operation cannot require approval")]
    ApprovalForbidden,

    /// Unable to spawn a task.
    #[error("unable to spawn {spawning}")]
    Spawn {
        /// What we were trying to spawn.
        spawning: &'static str,
        /// What happened when we tried to spawn it.
        #[source]
        cause: Arc<SpawnError>,
    },

    /// An internal error of some kind that should never occur.
    #[error("Internal error: {0}")]
    Internal(&'static str),
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Error {
        Error::Internal("Thread failed while holding lock")
    }
}

impl Error {
    /// Construct a new `Error` from a `SpawnError`.
    pub(crate) fn from_spawn(spawning: &'static str, err: SpawnError) -> Error {
        Error::Spawn {
            spawning,
            cause: Arc::new(err),
        }
    }
}

/// A named error carried by an aborted channel.
///
/// Channel aborts are data, not failures of the dispatcher: the name is a
/// well-known dotted error name that travels over the bus in `ChannelLost`
/// signals, and the message is free-form text for humans.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ChannelError {
    /// The dotted, bus-visible error name.
    name: String,
    /// A human-readable description.
    message: String,
}

impl ChannelError {
    /// Error name used when an owning channel request was cancelled.
    pub const CANCELLED: &'static str = "org.switchboard.Error.Cancelled";
    /// Error name used when no possible handler is left alive.
    pub const NOT_AVAILABLE: &'static str = "org.switchboard.Error.NotAvailable";
    /// Error name used when an in-process filter rejected the channel.
    pub const NOT_CAPABLE: &'static str = "org.switchboard.Error.NotCapable";
    /// Error name used when a channel went away without telling us why.
    pub const TERMINATED: &'static str = "org.switchboard.Error.Terminated";

    /// Construct a new `ChannelError` from an error name and a message.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        ChannelError {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Construct the error recorded when a channel request is cancelled.
    pub fn cancelled() -> Self {
        ChannelError::new(Self::CANCELLED, "Channel request cancelled")
    }

    /// Construct the error recorded when every possible handler is gone.
    pub(crate) fn handler_unavailable() -> Self {
        ChannelError::new(Self::NOT_AVAILABLE, "Handler no longer available")
    }

    /// Construct the error recorded when a filter rejects a channel.
    pub(crate) fn filtered() -> Self {
        ChannelError::new(Self::NOT_CAPABLE, "Channel was rejected by a filter")
    }

    /// Construct the error assumed when a channel aborts without one.
    pub(crate) fn terminated() -> Self {
        ChannelError::new(Self::TERMINATED, "Channel closed")
    }

    /// Return the bus-visible error name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Return the human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Return true if this error records a user cancellation.
    pub fn is_cancellation(&self) -> bool {
        self.name == Self::CANCELLED
    }
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

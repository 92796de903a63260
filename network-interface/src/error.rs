use std::time::Duration;

use thiserror::Error;

use crate::command::{CallbackHandle, HostAndPort};

pub type Result<T, E = NetworkError> = std::result::Result<T, E>;

/// Every outcome other than a successful response that a command or alarm
/// can resolve with.
///
/// Per-host kinds (`ConnectionAcquisition`, `Send`, `Receive`) are absorbed by
/// the owning command until its failure tolerance is used up; they only reach a
/// caller wrapped in `ExhaustedRetries`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NetworkError {
    #[error("failed to acquire a connection to {host}: {reason}")]
    ConnectionAcquisition { host: HostAndPort, reason: String },

    #[error("failed to send command to {host}: {reason}")]
    Send { host: HostAndPort, reason: String },

    #[error("failed to receive a response from {host}: {reason}")]
    Receive { host: HostAndPort, reason: String },

    #[error("command failed after {failures} host failure(s); last error: {last}")]
    ExhaustedRetries {
        failures: usize,
        last: Box<NetworkError>,
    },

    #[error("deadline exceeded after {elapsed:?}")]
    Timeout { elapsed: Duration },

    #[error("operation was cancelled")]
    Cancelled,

    #[error("network interface is not running")]
    NotRunning,

    #[error("network interface is shutting down")]
    ShutdownInProgress,

    #[error("invalid request: {0}")]
    InvalidArgument(String),

    #[error("callback handle {0} is already in flight")]
    DuplicateHandle(CallbackHandle),

    #[error("illegal operation: {0}")]
    IllegalOperation(String),

    #[error("internal error on the network thread: {0}")]
    Internal(String),
}

impl NetworkError {
    /// Whether this error describes a single host misbehaving rather than the
    /// command as a whole.
    pub fn is_host_failure(&self) -> bool {
        matches!(
            self,
            Self::ConnectionAcquisition { .. } | Self::Send { .. } | Self::Receive { .. }
        )
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::ShutdownInProgress)
    }

    pub(crate) fn acquisition(host: &HostAndPort, reason: impl ToString) -> Self {
        Self::ConnectionAcquisition {
            host: host.clone(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn send(host: &HostAndPort, reason: impl ToString) -> Self {
        Self::Send {
            host: host.clone(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn receive(host: &HostAndPort, reason: impl ToString) -> Self {
        Self::Receive {
            host: host.clone(),
            reason: reason.to_string(),
        }
    }
}

//! Commands submitted to the network interface and the responses they resolve with.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{NetworkError, Result};

/// Address of a remote host, kept as a name rather than a resolved socket so
/// pools can key connections on what the caller asked for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostAndPort {
    host: String,
    port: u16,
}

impl HostAndPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for HostAndPort {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let (host, port) = trimmed
            .rsplit_once(':')
            .ok_or_else(|| NetworkError::InvalidArgument(format!("missing port in '{trimmed}'")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(NetworkError::InvalidArgument(format!(
                "missing host name in '{trimmed}'"
            )));
        }
        let port = port
            .parse::<u16>()
            .map_err(|err| NetworkError::InvalidArgument(format!("bad port in '{trimmed}': {err}")))?;
        Ok(Self::new(host, port))
    }
}

impl From<SocketAddr> for HostAndPort {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// Caller-supplied identity of an in-flight command or alarm.
///
/// Cancellation is addressed by handle, so a handle must be unique while the
/// work it names is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallbackHandle(u64);

impl CallbackHandle {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn id(self) -> u64 {
        self.0
    }
}

impl From<u64> for CallbackHandle {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for CallbackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A command addressed to any one of several candidate hosts.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCommandRequest {
    /// Candidate hosts, in preference order. More than one means "any of N".
    pub target: Vec<HostAndPort>,
    pub db_name: String,
    pub cmd: Value,
    /// Absolute expiry; `None` means the command never times out.
    pub deadline: Option<Instant>,
    /// Number of per-host failures absorbed before the command itself fails.
    pub failure_tolerance: usize,
}

impl RemoteCommandRequest {
    pub fn new(target: Vec<HostAndPort>, db_name: impl Into<String>, cmd: Value) -> Self {
        Self {
            target,
            db_name: db_name.into(),
            cmd,
            deadline: None,
            failure_tolerance: 0,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_failure_tolerance(mut self, tolerance: usize) -> Self {
        self.failure_tolerance = tolerance;
        self
    }

    /// Name of the command, taken from the first key of the command document.
    pub fn command_name(&self) -> Option<&str> {
        self.cmd
            .as_object()
            .and_then(|doc| doc.keys().next())
            .map(String::as_str)
    }

    /// Rejects submissions the interface could never execute.
    pub fn validate(&self) -> Result<()> {
        if self.target.is_empty() {
            return Err(NetworkError::InvalidArgument(
                "command has no target hosts".to_string(),
            ));
        }
        if self.db_name.trim().is_empty() {
            return Err(NetworkError::InvalidArgument(
                "command has an empty database name".to_string(),
            ));
        }
        if self.command_name().is_none() {
            return Err(NetworkError::InvalidArgument(
                "command body must be a non-empty document".to_string(),
            ));
        }
        Ok(())
    }
}

/// A reply from the host that won the command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteCommandResponse {
    pub target: HostAndPort,
    pub data: Value,
    /// Time from submission to response.
    #[serde(with = "millis")]
    pub elapsed: Duration,
}

pub type CommandResult = Result<RemoteCommandResponse>;

mod millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }
}

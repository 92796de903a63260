//! The connection pool seam.
//!
//! The network interface never opens sockets itself. It asks a
//! [`ConnectionPool`] for a [`Connection`] to a host, sends one command on it,
//! and hands it back through the [`ConnectionHandle`] lease. A lease is returned
//! exactly once: explicitly via [`ConnectionHandle::release`], or as unhealthy
//! when it is dropped without being released.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::command::{HostAndPort, RemoteCommandRequest};
use crate::error::Result;

/// How a connection is handed back to its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// The connection finished its exchange cleanly and may be reused.
    Healthy,
    /// The connection saw an error or had I/O interrupted and must be discarded.
    Unhealthy,
}

/// Byte counts for one direction of an exchange.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ByteCount {
    pub logical: u64,
    pub physical: u64,
}

/// A host's answer and what it cost on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Received {
    pub data: Value,
    pub bytes: ByteCount,
}

/// An established connection leased from a pool.
pub trait Connection: Send {
    fn host(&self) -> &HostAndPort;

    /// Writes the command to the connection.
    ///
    /// Dropping either I/O future abandons the exchange; the connection must
    /// then be released as unhealthy.
    fn send<'a>(&'a mut self, request: &'a RemoteCommandRequest) -> BoxFuture<'a, Result<ByteCount>>;

    /// Waits for the reply to the command last sent.
    fn receive(&mut self) -> BoxFuture<'_, Result<Received>>;

    /// Gives the connection back to the pool it was leased from.
    fn release(self: Box<Self>, status: ConnectionStatus);
}

/// Source of connections, keyed by host. Implementations serialize access to
/// their per-host state internally and are shared across threads.
pub trait ConnectionPool: Send + Sync + 'static {
    /// Leases a connection to `host`, failing if none is available within `timeout`.
    fn get(&self, host: &HostAndPort, timeout: Duration) -> BoxFuture<'static, Result<Box<dyn Connection>>>;

    /// Discards idle connections to `host`; leased ones are discarded on return.
    fn drop_connections(&self, host: &HostAndPort);

    fn stats(&self) -> PoolStats;

    /// Stops handing out connections and closes idle ones.
    fn shutdown(&self) {}
}

/// A leased connection that is returned exactly once.
pub struct ConnectionHandle {
    conn: Option<Box<dyn Connection>>,
}

impl ConnectionHandle {
    pub fn new(conn: Box<dyn Connection>) -> Self {
        Self { conn: Some(conn) }
    }

    pub fn host(&self) -> Option<&HostAndPort> {
        self.conn.as_deref().map(|conn| conn.host())
    }

    pub fn connection(&mut self) -> Option<&mut (dyn Connection + 'static)> {
        self.conn.as_deref_mut()
    }

    pub fn is_released(&self) -> bool {
        self.conn.is_none()
    }

    /// Returns the connection to its pool. Later calls do nothing.
    pub fn release(&mut self, status: ConnectionStatus) {
        if let Some(conn) = self.conn.take() {
            debug!(host = %conn.host(), ?status, "returning connection");
            conn.release(status);
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.release(ConnectionStatus::Unhealthy);
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("host", &self.host())
            .finish()
    }
}

/// Connection counts for one host.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HostStats {
    pub in_use: u64,
    pub available: u64,
    pub created: u64,
    pub discarded: u64,
}

/// Point-in-time view of a pool, for diagnostics only.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total_in_use: u64,
    pub total_available: u64,
    pub total_created: u64,
    pub total_discarded: u64,
    pub hosts: BTreeMap<String, HostStats>,
}

impl PoolStats {
    /// Adds a host's counts, keeping the totals in step.
    pub fn record_host(&mut self, host: &HostAndPort, stats: HostStats) {
        self.total_in_use += stats.in_use;
        self.total_available += stats.available;
        self.total_created += stats.created;
        self.total_discarded += stats.discarded;
        self.hosts.insert(host.to_string(), stats);
    }
}

//! Approximate telemetry counters.
//!
//! The network interface and the demo server report traffic through the
//! [`CounterSink`] trait so tests can swap in a no-op or recording sink instead
//! of sharing process-wide state. None of these counters is exact: wrap-around
//! resets race with concurrent increments and that is accepted.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::warn;

/// Counters past this value are reset instead of incremented further.
const WRAP_THRESHOLD: u64 = 1 << 60;

/// Fire-and-forget increments invoked at well-defined points of a command's
/// life. Implementations must not block.
pub trait CounterSink: Send + Sync {
    fn accepted_connection(&self);
    /// Payload bytes received, counted once per operation.
    fn hit_logical_in(&self, bytes: u64);
    fn hit_logical_out(&self, bytes: u64);
    /// Framed bytes as they crossed the socket.
    fn hit_physical_in(&self, bytes: u64);
    fn hit_physical_out(&self, bytes: u64);
}

/// Sink that drops every increment.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCounters;

impl CounterSink for NoopCounters {
    fn accepted_connection(&self) {}
    fn hit_logical_in(&self, _bytes: u64) {}
    fn hit_logical_out(&self, _bytes: u64) {}
    fn hit_physical_in(&self, _bytes: u64) {}
    fn hit_physical_out(&self, _bytes: u64) {}
}

/// Byte and request tallies for network traffic.
#[derive(Debug, Default)]
pub struct NetworkCounter {
    physical_bytes_in: AtomicU64,
    physical_bytes_out: AtomicU64,
    logical_bytes_in: AtomicU64,
    logical_bytes_out: AtomicU64,
    requests: AtomicU64,
    accepted: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkCounterSnapshot {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub physical_bytes_in: u64,
    pub physical_bytes_out: u64,
    pub num_requests: u64,
    pub accepted_connections: u64,
}

impl NetworkCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> NetworkCounterSnapshot {
        NetworkCounterSnapshot {
            bytes_in: self.logical_bytes_in.load(Ordering::Relaxed),
            bytes_out: self.logical_bytes_out.load(Ordering::Relaxed),
            physical_bytes_in: self.physical_bytes_in.load(Ordering::Relaxed),
            physical_bytes_out: self.physical_bytes_out.load(Ordering::Relaxed),
            num_requests: self.requests.load(Ordering::Relaxed),
            accepted_connections: self.accepted.load(Ordering::Relaxed),
        }
    }
}

/// Adds `bytes`, or restarts the counter at `bytes` once it has grown past the
/// wrap threshold. Returns whether a reset happened.
fn add_or_wrap(counter: &AtomicU64, bytes: u64) -> bool {
    if counter.load(Ordering::Relaxed) > WRAP_THRESHOLD {
        counter.store(bytes, Ordering::Relaxed);
        true
    } else {
        counter.fetch_add(bytes, Ordering::Relaxed);
        false
    }
}

impl CounterSink for NetworkCounter {
    fn accepted_connection(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    fn hit_logical_in(&self, bytes: u64) {
        // Requests are only tallied here; physical and logical hits both happen
        // for every operation and counting in both would double it.
        if add_or_wrap(&self.logical_bytes_in, bytes) {
            self.requests.store(1, Ordering::Relaxed);
        } else {
            self.requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn hit_logical_out(&self, bytes: u64) {
        add_or_wrap(&self.logical_bytes_out, bytes);
    }

    fn hit_physical_in(&self, bytes: u64) {
        add_or_wrap(&self.physical_bytes_in, bytes);
    }

    fn hit_physical_out(&self, bytes: u64) {
        add_or_wrap(&self.physical_bytes_out, bytes);
    }
}

/// Legacy wire op codes understood by [`OpCounters::got_op`].
pub mod op {
    pub const REPLY: i32 = 1;
    pub const UPDATE: i32 = 2001;
    pub const INSERT: i32 = 2002;
    pub const QUERY: i32 = 2004;
    pub const GET_MORE: i32 = 2005;
    pub const DELETE: i32 = 2006;
    pub const KILL_CURSORS: i32 = 2007;
    pub const MSG: i32 = 2013;
}

/// Per-operation tallies for received requests.
#[derive(Debug, Default)]
pub struct OpCounters {
    insert: AtomicU64,
    query: AtomicU64,
    update: AtomicU64,
    delete: AtomicU64,
    getmore: AtomicU64,
    command: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OpCountersSnapshot {
    pub insert: u64,
    pub query: u64,
    pub update: u64,
    pub delete: u64,
    pub getmore: u64,
    pub command: u64,
}

impl OpCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tallies one received operation by op code.
    ///
    /// Inserts are counted per document by the caller through
    /// [`OpCounters::got_inserts`], so the insert op code itself is ignored.
    pub fn got_op(&self, op_code: i32, is_command: bool) {
        match op_code {
            op::INSERT | op::KILL_CURSORS | op::REPLY => {}
            op::QUERY if is_command => self.got_command(),
            op::QUERY => self.bump(&self.query, 1),
            op::MSG => self.got_command(),
            op::UPDATE => self.bump(&self.update, 1),
            op::DELETE => self.bump(&self.delete, 1),
            op::GET_MORE => self.bump(&self.getmore, 1),
            other => warn!(op_code = other, "OpCounters::got_op unknown op"),
        }
    }

    pub fn got_inserts(&self, n: u64) {
        self.bump(&self.insert, n);
    }

    pub fn got_command(&self) {
        self.bump(&self.command, 1);
    }

    pub fn snapshot(&self) -> OpCountersSnapshot {
        OpCountersSnapshot {
            insert: self.insert.load(Ordering::Relaxed),
            query: self.query.load(Ordering::Relaxed),
            update: self.update.load(Ordering::Relaxed),
            delete: self.delete.load(Ordering::Relaxed),
            getmore: self.getmore.load(Ordering::Relaxed),
            command: self.command.load(Ordering::Relaxed),
        }
    }

    /// The six counters describe one workload, so they are reset together.
    fn bump(&self, counter: &AtomicU64, n: u64) {
        let old = counter.fetch_add(n, Ordering::Relaxed);
        if old > WRAP_THRESHOLD {
            for counter in [
                &self.insert,
                &self.query,
                &self.update,
                &self.delete,
                &self.getmore,
                &self.command,
            ] {
                counter.store(0, Ordering::Relaxed);
            }
        }
    }
}

/// Outcome tallies for commands run through a network interface.
#[derive(Debug, Default)]
pub struct InterfaceCounters {
    sent: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    canceled: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InterfaceCountersSnapshot {
    pub sent: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub canceled: u64,
}

impl InterfaceCounters {
    pub(crate) fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_outcome<T>(&self, outcome: &crate::error::Result<T>) {
        use crate::error::NetworkError;

        let counter = match outcome {
            Ok(_) => &self.succeeded,
            Err(NetworkError::Timeout { .. }) => &self.timed_out,
            Err(NetworkError::Cancelled | NetworkError::ShutdownInProgress) => &self.canceled,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> InterfaceCountersSnapshot {
        InterfaceCountersSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            canceled: self.canceled.load(Ordering::Relaxed),
        }
    }
}

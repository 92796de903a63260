//! Asynchronous network interface for dispatching remote commands.
//!
//! A caller submits a command addressed to one or more candidate hosts. The
//! interface leases a pooled connection for each candidate, lets the first
//! acquired connection carry the command, and resolves the caller's promise
//! exactly once with a response, an exhausted-retries failure, a timeout, or a
//! cancellation.
//!
//! # Architecture
//!
//! - **Reactor thread**: one dedicated thread runs every connection
//!   acquisition, send/receive and timer callback.
//! - **Submitting threads**: post commands, alarms and cancellations onto the
//!   reactor and observe results through callbacks or [`CompletionFuture`]s.
//!   They never block on completion and never touch a connection.
//!
//! Every terminal outcome of a command or alarm goes through a
//! [`FinishLine`](finish_line::FinishLine), so a response racing a timeout
//! racing a cancellation still produces exactly one result.
//!
//! # Modules
//!
//! - [`interface`]: the [`NetworkInterface`] facade and its in-flight registries
//! - [`finish_line`]: the exactly-once race primitive
//! - [`pool`]: the connection pool seam and the exactly-once connection lease
//! - [`tcp_pool`]: a TCP implementation of the pool speaking [`message`] framing
//! - [`reactor`]: the network thread and its timers
//! - [`counters`]: approximate traffic and outcome telemetry
//! - [`server`], [`cli`]: the demo command server and command-line front end

pub mod cli;
pub mod command;
pub mod completion;
pub mod config;
pub mod counters;
pub mod error;
pub mod finish_line;
pub mod interface;
pub mod message;
pub mod pool;
pub mod reactor;
pub mod server;
pub mod tcp_pool;

mod alarm;
mod dispatch;
mod request;

use std::any::Any;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub use command::{CallbackHandle, CommandResult, HostAndPort, RemoteCommandRequest, RemoteCommandResponse};
pub use completion::CompletionFuture;
pub use config::{NetworkInterfaceOptions, PoolOptions};
pub use error::{NetworkError, Result};
pub use interface::NetworkInterface;

/// Registry locks only guard membership, so a panic elsewhere never leaves
/// them half-updated; poisoning is ignored.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

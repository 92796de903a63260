//! The dedicated network thread.
//!
//! All connection acquisition, command I/O and timer callbacks run on one OS
//! thread driving a current-thread tokio runtime. Other threads only post work
//! onto it through a [`ReactorHandle`]; they never touch a connection.

use std::future::Future;
use std::sync::mpsc as std_mpsc;
use std::thread::{self, ThreadId};
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Cheap, cloneable access to a running reactor.
#[derive(Clone, Debug)]
pub struct ReactorHandle {
    handle: Handle,
    thread_id: ThreadId,
}

impl ReactorHandle {
    /// Posts a task onto the reactor. Never blocks the caller.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Runs `callback` on the reactor once `deadline` passes, unless the
    /// returned timer is cancelled first.
    pub fn set_timer<F>(&self, deadline: Instant, callback: F) -> ReactorTimer
    where
        F: FnOnce() + Send + 'static,
    {
        let task = self.handle.spawn(async move {
            tokio::time::sleep_until(deadline.into()).await;
            callback();
        });
        ReactorTimer { task }
    }

    pub fn on_reactor_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

/// A one-shot timer scheduled on the reactor.
#[derive(Debug)]
pub struct ReactorTimer {
    task: JoinHandle<()>,
}

impl ReactorTimer {
    /// Stops the timer if it has not fired yet. Safe to call more than once.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

/// Owner of the reactor thread.
#[derive(Debug)]
pub struct Reactor {
    handle: ReactorHandle,
    stop_tx: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Reactor {
    /// Spawns the reactor thread and waits until its runtime accepts work.
    pub fn start(name: &str) -> Result<Self> {
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name(format!("{name}-reactor"))
            .spawn(move || {
                let runtime = match Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(ReactorHandle {
                    handle: runtime.handle().clone(),
                    thread_id: thread::current().id(),
                }));
                runtime.block_on(async {
                    let _ = stop_rx.await;
                });
                debug!("reactor loop exited");
            })
            .context("failed to spawn reactor thread")?;

        let handle = ready_rx
            .recv()
            .context("reactor thread exited before starting")?
            .context("failed to build reactor runtime")?;

        Ok(Self {
            handle,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> &ReactorHandle {
        &self.handle
    }

    /// Stops the event loop and waits for the thread to exit. Tasks still
    /// pending on the reactor are dropped. Idempotent.
    pub fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        let Some(thread) = self.thread.take() else {
            return;
        };
        if self.handle.on_reactor_thread() {
            warn!("reactor stopped from its own thread; not waiting for it to exit");
            return;
        }
        if thread.join().is_err() {
            warn!("reactor thread panicked");
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;

    #[test]
    fn spawned_tasks_run_on_the_reactor_thread() {
        let mut reactor = Reactor::start("test").expect("start reactor");
        let handle = reactor.handle().clone();
        assert!(!handle.on_reactor_thread());

        let (tx, rx) = std_mpsc::channel();
        let inner = handle.clone();
        handle.spawn(async move {
            let _ = tx.send((inner.on_reactor_thread(), thread::current().name().map(String::from)));
        });

        let (on_reactor, name) = rx.recv_timeout(Duration::from_secs(1)).expect("task ran");
        assert!(on_reactor);
        assert_eq!(name.as_deref(), Some("test-reactor"));
        reactor.stop();
        reactor.stop();
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let reactor = Reactor::start("timer").expect("start reactor");
        let fired = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&fired);
        let timer = reactor
            .handle()
            .set_timer(Instant::now() + Duration::from_millis(50), move || {
                flag.store(true, Ordering::SeqCst);
            });
        timer.cancel();
        timer.cancel();

        let (tx, rx) = std_mpsc::channel();
        reactor
            .handle()
            .set_timer(Instant::now() + Duration::from_millis(100), move || {
                let _ = tx.send(());
            });
        rx.recv_timeout(Duration::from_secs(1)).expect("second timer fired");
        assert!(!fired.load(Ordering::SeqCst));
    }
}

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;
use network_interface::counters::CounterSink;
use network_interface::pool::{
    ByteCount, Connection, ConnectionPool, ConnectionStatus, HostStats, PoolStats, Received,
};
use network_interface::{HostAndPort, NetworkError, NetworkInterface, NetworkInterfaceOptions, RemoteCommandRequest};
use serde_json::{Value, json};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub fn host(port: u16) -> HostAndPort {
    HostAndPort::new("mock", port)
}

pub fn ping(targets: &[HostAndPort]) -> RemoteCommandRequest {
    RemoteCommandRequest::new(targets.to_vec(), "admin", json!({"ping": 1}))
}

#[derive(Debug, Clone)]
enum Acquire {
    Connect,
    Refuse(String),
    Hang,
}

#[derive(Debug, Clone)]
enum Reply {
    Data(Value),
    Fail(String),
    Hang,
}

/// How a scripted host behaves when leased and sent a command.
#[derive(Debug, Clone)]
pub struct Script {
    acquire: Acquire,
    acquire_delay: Duration,
    reply: Reply,
    reply_delay: Duration,
}

impl Script {
    pub fn respond(data: Value) -> Self {
        Self {
            acquire: Acquire::Connect,
            acquire_delay: Duration::ZERO,
            reply: Reply::Data(data),
            reply_delay: Duration::ZERO,
        }
    }

    pub fn refuse(reason: &str) -> Self {
        Self {
            acquire: Acquire::Refuse(reason.to_string()),
            ..Self::respond(Value::Null)
        }
    }

    pub fn fail_reply(reason: &str) -> Self {
        Self {
            reply: Reply::Fail(reason.to_string()),
            ..Self::respond(Value::Null)
        }
    }

    pub fn hang_acquire() -> Self {
        Self {
            acquire: Acquire::Hang,
            ..Self::respond(Value::Null)
        }
    }

    pub fn hang_reply() -> Self {
        Self {
            reply: Reply::Hang,
            ..Self::respond(Value::Null)
        }
    }

    pub fn acquire_after(mut self, delay: Duration) -> Self {
        self.acquire_delay = delay;
        self
    }

    pub fn reply_after(mut self, delay: Duration) -> Self {
        self.reply_delay = delay;
        self
    }
}

#[derive(Debug, Default)]
struct Journal {
    attempts: Vec<HostAndPort>,
    leases: Vec<HostAndPort>,
    returns: Vec<(HostAndPort, ConnectionStatus)>,
    dropped: Vec<HostAndPort>,
    shut_down: bool,
}

/// In-memory pool whose hosts follow a [`Script`] and which records every
/// lease and return.
#[derive(Clone, Default)]
pub struct ScriptedPool {
    scripts: Arc<Mutex<HashMap<HostAndPort, Script>>>,
    journal: Arc<Mutex<Journal>>,
}

impl ScriptedPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, host: HostAndPort, script: Script) -> Self {
        self.scripts.lock().unwrap().insert(host, script);
        self
    }

    pub fn attempts(&self) -> Vec<HostAndPort> {
        self.journal.lock().unwrap().attempts.clone()
    }

    pub fn leases(&self) -> Vec<HostAndPort> {
        self.journal.lock().unwrap().leases.clone()
    }

    pub fn returns(&self) -> Vec<(HostAndPort, ConnectionStatus)> {
        self.journal.lock().unwrap().returns.clone()
    }

    pub fn dropped(&self) -> Vec<HostAndPort> {
        self.journal.lock().unwrap().dropped.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.journal.lock().unwrap().shut_down
    }

    /// Leases not yet handed back.
    pub fn outstanding(&self) -> usize {
        let journal = self.journal.lock().unwrap();
        journal.leases.len() - journal.returns.len()
    }

    /// Waits until every lease has been returned.
    pub async fn settled(&self) {
        wait_until(|| self.outstanding() == 0).await;
    }
}

impl ConnectionPool for ScriptedPool {
    fn get(&self, host: &HostAndPort, _timeout: Duration) -> BoxFuture<'static, Result<Box<dyn Connection>, NetworkError>> {
        let host = host.clone();
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&host)
            .cloned()
            .unwrap_or_else(|| Script::refuse("unknown host"));
        let journal = Arc::clone(&self.journal);
        journal.lock().unwrap().attempts.push(host.clone());

        async move {
            tokio::time::sleep(script.acquire_delay).await;
            match &script.acquire {
                Acquire::Connect => {}
                Acquire::Refuse(reason) => {
                    return Err(NetworkError::ConnectionAcquisition {
                        host,
                        reason: reason.clone(),
                    });
                }
                Acquire::Hang => futures::future::pending::<()>().await,
            }
            journal.lock().unwrap().leases.push(host.clone());
            let conn: Box<dyn Connection> = Box::new(ScriptedConnection {
                host,
                script,
                journal,
            });
            Ok(conn)
        }
        .boxed()
    }

    fn drop_connections(&self, host: &HostAndPort) {
        self.journal.lock().unwrap().dropped.push(host.clone());
    }

    fn stats(&self) -> PoolStats {
        let journal = self.journal.lock().unwrap();
        let mut stats = PoolStats::default();
        let mut per_host: HashMap<&HostAndPort, HostStats> = HashMap::new();
        for host in &journal.leases {
            let entry = per_host.entry(host).or_default();
            entry.created += 1;
            entry.in_use += 1;
        }
        for (host, _) in &journal.returns {
            let entry = per_host.entry(host).or_default();
            entry.in_use = entry.in_use.saturating_sub(1);
            entry.discarded += 1;
        }
        for (host, host_stats) in per_host {
            stats.record_host(host, host_stats);
        }
        stats
    }

    fn shutdown(&self) {
        self.journal.lock().unwrap().shut_down = true;
    }
}

struct ScriptedConnection {
    host: HostAndPort,
    script: Script,
    journal: Arc<Mutex<Journal>>,
}

impl Connection for ScriptedConnection {
    fn host(&self) -> &HostAndPort {
        &self.host
    }

    fn send<'a>(&'a mut self, request: &'a RemoteCommandRequest) -> BoxFuture<'a, Result<ByteCount, NetworkError>> {
        async move {
            let logical = request.cmd.to_string().len() as u64;
            Ok(ByteCount {
                logical,
                physical: logical + 1,
            })
        }
        .boxed()
    }

    fn receive(&mut self) -> BoxFuture<'_, Result<Received, NetworkError>> {
        async move {
            tokio::time::sleep(self.script.reply_delay).await;
            match &self.script.reply {
                Reply::Data(data) => Ok(Received {
                    data: data.clone(),
                    bytes: ByteCount {
                        logical: 10,
                        physical: 11,
                    },
                }),
                Reply::Fail(reason) => Err(NetworkError::Receive {
                    host: self.host.clone(),
                    reason: reason.clone(),
                }),
                Reply::Hang => futures::future::pending().await,
            }
        }
        .boxed()
    }

    fn release(self: Box<Self>, status: ConnectionStatus) {
        self.journal.lock().unwrap().returns.push((self.host.clone(), status));
    }
}

/// Counter sink that keeps running totals.
#[derive(Debug, Default)]
pub struct RecordingCounters {
    pub logical_in: AtomicU64,
    pub logical_out: AtomicU64,
    pub physical_in: AtomicU64,
    pub physical_out: AtomicU64,
    pub accepted: AtomicU64,
}

impl CounterSink for RecordingCounters {
    fn accepted_connection(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    fn hit_logical_in(&self, bytes: u64) {
        self.logical_in.fetch_add(bytes, Ordering::Relaxed);
    }

    fn hit_logical_out(&self, bytes: u64) {
        self.logical_out.fetch_add(bytes, Ordering::Relaxed);
    }

    fn hit_physical_in(&self, bytes: u64) {
        self.physical_in.fetch_add(bytes, Ordering::Relaxed);
    }

    fn hit_physical_out(&self, bytes: u64) {
        self.physical_out.fetch_add(bytes, Ordering::Relaxed);
    }
}

pub fn options() -> NetworkInterfaceOptions {
    NetworkInterfaceOptions::default()
        .with_instance_name("test")
        .with_acquire_timeout(Duration::from_secs(2))
}

/// Builds and starts an interface over `pool`.
pub fn started(pool: &ScriptedPool) -> NetworkInterface {
    started_with_counters(pool, Arc::new(RecordingCounters::default()))
}

pub fn started_with_counters(pool: &ScriptedPool, counters: Arc<RecordingCounters>) -> NetworkInterface {
    let interface = NetworkInterface::new(options(), Arc::new(pool.clone()), counters);
    interface.startup().expect("startup");
    interface
}

/// Polls `condition` until it holds, panicking after [`TEST_TIMEOUT`].
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + TEST_TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within {TEST_TIMEOUT:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

//! A [`ConnectionPool`] over plain TCP speaking the [`crate::message`] framing.
//!
//! Each host gets a LIFO set of idle connections and a semaphore bounding how
//! many leases may be out at once. Healthy connections go back to the idle set,
//! unhealthy ones are closed. `drop_connections` closes the idle set and bumps
//! the host's generation so leases taken before the drop are closed on return.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::command::{HostAndPort, RemoteCommandRequest};
use crate::config::PoolOptions;
use crate::counters::op;
use crate::error::{NetworkError, Result};
use crate::lock;
use crate::message::{read_message, write_message, WireReply, WireRequest};
use crate::pool::{ByteCount, Connection, ConnectionPool, ConnectionStatus, HostStats, PoolStats, Received};

pub struct TcpConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    options: PoolOptions,
    hosts: Mutex<HashMap<HostAndPort, HostEntry>>,
    shut_down: AtomicBool,
}

struct HostEntry {
    idle: Vec<Stream>,
    permits: Arc<Semaphore>,
    generation: u64,
    in_use: u64,
    created: u64,
    discarded: u64,
}

/// The two halves of an established connection.
struct Stream {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TcpConnectionPool {
    pub fn new(options: PoolOptions) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                options,
                hosts: Mutex::new(HashMap::new()),
                shut_down: AtomicBool::new(false),
            }),
        }
    }
}

impl Default for TcpConnectionPool {
    fn default() -> Self {
        Self::new(PoolOptions::default())
    }
}

impl ConnectionPool for TcpConnectionPool {
    fn get(&self, host: &HostAndPort, timeout: Duration) -> BoxFuture<'static, Result<Box<dyn Connection>>> {
        let inner = Arc::clone(&self.inner);
        let host = host.clone();
        async move {
            if inner.shut_down.load(Ordering::Acquire) {
                return Err(NetworkError::acquisition(&host, "pool is shut down"));
            }

            let permits = inner.permits_for(&host);
            let permit = match tokio::time::timeout(timeout, permits.acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(NetworkError::acquisition(&host, "pool is shut down")),
                Err(_) => {
                    return Err(NetworkError::acquisition(
                        &host,
                        format!("no connection available within {timeout:?}"),
                    ))
                }
            };

            if let Some((stream, generation)) = inner.take_idle(&host) {
                debug!(host = %host, "reusing idle connection");
                return Ok(TcpConnection::leased(&inner, host, stream, generation, permit));
            }

            let connect_timeout = inner.options.connect_timeout.min(timeout);
            let address = (host.host().to_string(), host.port());
            let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(address)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => return Err(NetworkError::acquisition(&host, err)),
                Err(_) => {
                    return Err(NetworkError::acquisition(
                        &host,
                        format!("connect timed out after {connect_timeout:?}"),
                    ))
                }
            };
            let _ = stream.set_nodelay(true);
            let (reader, writer) = stream.into_split();
            let stream = Stream {
                reader: BufReader::new(reader),
                writer,
            };

            let generation = inner.record_created(&host);
            debug!(host = %host, "opened new connection");
            Ok(TcpConnection::leased(&inner, host, stream, generation, permit))
        }
        .boxed()
    }

    fn drop_connections(&self, host: &HostAndPort) {
        let mut hosts = lock(&self.inner.hosts);
        if let Some(entry) = hosts.get_mut(host) {
            entry.generation += 1;
            entry.discarded += entry.idle.len() as u64;
            entry.idle.clear();
        }
    }

    fn stats(&self) -> PoolStats {
        let hosts = lock(&self.inner.hosts);
        let mut stats = PoolStats::default();
        for (host, entry) in hosts.iter() {
            stats.record_host(
                host,
                HostStats {
                    in_use: entry.in_use,
                    available: entry.idle.len() as u64,
                    created: entry.created,
                    discarded: entry.discarded,
                },
            );
        }
        stats
    }

    fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut hosts = lock(&self.inner.hosts);
        let mut closed = 0u64;
        for entry in hosts.values_mut() {
            entry.permits.close();
            closed += entry.idle.len() as u64;
            entry.discarded += entry.idle.len() as u64;
            entry.idle.clear();
        }
        info!(closed, "connection pool shut down");
    }
}

impl PoolInner {
    fn entry<'a>(hosts: &'a mut HashMap<HostAndPort, HostEntry>, host: &HostAndPort, max: usize) -> &'a mut HostEntry {
        hosts.entry(host.clone()).or_insert_with(|| HostEntry {
            idle: Vec::new(),
            permits: Arc::new(Semaphore::new(max)),
            generation: 0,
            in_use: 0,
            created: 0,
            discarded: 0,
        })
    }

    fn permits_for(&self, host: &HostAndPort) -> Arc<Semaphore> {
        let mut hosts = lock(&self.hosts);
        let entry = Self::entry(&mut hosts, host, self.options.max_connections_per_host);
        Arc::clone(&entry.permits)
    }

    fn take_idle(&self, host: &HostAndPort) -> Option<(Stream, u64)> {
        let mut hosts = lock(&self.hosts);
        let entry = hosts.get_mut(host)?;
        let stream = entry.idle.pop()?;
        entry.in_use += 1;
        Some((stream, entry.generation))
    }

    fn record_created(&self, host: &HostAndPort) -> u64 {
        let mut hosts = lock(&self.hosts);
        let entry = Self::entry(&mut hosts, host, self.options.max_connections_per_host);
        entry.created += 1;
        entry.in_use += 1;
        entry.generation
    }

    fn give_back(&self, host: &HostAndPort, stream: Stream, generation: u64, status: ConnectionStatus) {
        let mut hosts = lock(&self.hosts);
        let Some(entry) = hosts.get_mut(host) else {
            return;
        };
        entry.in_use = entry.in_use.saturating_sub(1);

        let reusable = status == ConnectionStatus::Healthy
            && generation == entry.generation
            && entry.idle.len() < self.options.max_idle_per_host
            && !self.shut_down.load(Ordering::Acquire);
        if reusable {
            entry.idle.push(stream);
        } else {
            entry.discarded += 1;
        }
    }
}

/// A leased TCP connection. Holds its host's semaphore permit until released.
pub struct TcpConnection {
    host: HostAndPort,
    stream: Stream,
    generation: u64,
    pending_id: Option<u64>,
    pool: Weak<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

impl TcpConnection {
    fn leased(
        pool: &Arc<PoolInner>,
        host: HostAndPort,
        stream: Stream,
        generation: u64,
        permit: OwnedSemaphorePermit,
    ) -> Box<dyn Connection> {
        Box::new(Self {
            host,
            stream,
            generation,
            pending_id: None,
            pool: Arc::downgrade(pool),
            _permit: permit,
        })
    }
}

impl Connection for TcpConnection {
    fn host(&self) -> &HostAndPort {
        &self.host
    }

    fn send<'a>(&'a mut self, request: &'a RemoteCommandRequest) -> BoxFuture<'a, Result<ByteCount>> {
        async move {
            let id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
            let wire = WireRequest {
                id,
                op: op::MSG,
                db: request.db_name.clone(),
                cmd: request.cmd.clone(),
            };
            let bytes = write_message(&mut self.stream.writer, &wire)
                .await
                .map_err(|err| NetworkError::send(&self.host, err))?;
            self.pending_id = Some(id);
            Ok(bytes)
        }
        .boxed()
    }

    fn receive(&mut self) -> BoxFuture<'_, Result<Received>> {
        async move {
            let Some(expected) = self.pending_id.take() else {
                return Err(NetworkError::receive(&self.host, "no command awaiting a reply"));
            };
            let (reply, bytes) = read_message::<_, WireReply>(&mut self.stream.reader)
                .await
                .map_err(|err| NetworkError::receive(&self.host, err))?
                .ok_or_else(|| NetworkError::receive(&self.host, "connection closed by peer"))?;

            if reply.id() != expected {
                return Err(NetworkError::receive(
                    &self.host,
                    format!("reply id {} does not match request id {expected}", reply.id()),
                ));
            }
            match reply {
                WireReply::Reply { data, .. } => Ok(Received { data, bytes }),
                WireReply::Error { message, .. } => Err(NetworkError::receive(&self.host, message)),
            }
        }
        .boxed()
    }

    fn release(self: Box<Self>, status: ConnectionStatus) {
        let Self {
            host,
            stream,
            generation,
            pool,
            _permit,
            ..
        } = *self;
        if let Some(pool) = pool.upgrade() {
            pool.give_back(&host, stream, generation, status);
        }
        // The permit drops here, after the stream is back in the idle set.
    }
}

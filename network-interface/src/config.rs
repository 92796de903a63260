use std::time::Duration;

/// Settings for a [`crate::interface::NetworkInterface`].
#[derive(Debug, Clone)]
pub struct NetworkInterfaceOptions {
    /// Used to name the reactor thread and in diagnostics.
    pub instance_name: String,
    /// Upper bound on connection acquisition for commands without a deadline.
    pub acquire_timeout: Duration,
    /// How long shutdown waits for cancelled requests to return their
    /// connections before the reactor is torn down.
    pub shutdown_grace: Duration,
}

impl Default for NetworkInterfaceOptions {
    fn default() -> Self {
        Self {
            instance_name: "NetworkInterface".to_string(),
            acquire_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

impl NetworkInterfaceOptions {
    pub fn with_instance_name(mut self, name: impl Into<String>) -> Self {
        self.instance_name = name.into();
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Settings for [`crate::tcp_pool::TcpConnectionPool`].
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Concurrent leases allowed per host.
    pub max_connections_per_host: usize,
    /// Idle connections kept per host after they are returned.
    pub max_idle_per_host: usize,
    pub connect_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_connections_per_host: 10,
            max_idle_per_host: 4,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolOptions {
    pub fn with_max_connections_per_host(mut self, max: usize) -> Self {
        self.max_connections_per_host = max.max(1);
        self
    }

    pub fn with_max_idle_per_host(mut self, max: usize) -> Self {
        self.max_idle_per_host = max;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

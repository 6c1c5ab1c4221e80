use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bootstrap configuration for the server core.
/// Lifecycle and back-pressure knobs stay small and explicit; every `None`
/// falls back to the documented default.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listen backlog applied at bind time (`None` = 1024).
    pub backlog: Option<u32>,

    /// Number of reactor (I/O) threads (`None` = available parallelism).
    pub io_threads: Option<usize>,

    /// Idle timeout for child connections **in milliseconds**
    /// (`None` = disabled).
    pub idle_timeout_ms: Option<u64>,

    /// Park interval of a reactor between task bursts, **in microseconds**
    /// (`None` = 250).
    pub tick_us: Option<u64>,

    /// Grace period for draining connections on stop, **in milliseconds**
    /// (`None` = 3000).
    pub drain_timeout_ms: Option<u64>,

    /// Pin reactor threads to these cores, round-robin
    /// (`None` = no pinning).
    pub pin_cores: Option<Vec<usize>>,

    /// Opaque TLS configuration blob, passed through to the transport layer
    /// untouched by the core.
    #[serde(default)]
    pub tls: Option<serde_json::Value>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            backlog: None,
            io_threads: None,
            idle_timeout_ms: None,
            tick_us: None,
            drain_timeout_ms: None,
            pin_cores: None,
            tls: None,
        }
    }
}

impl ServerConfig {
    pub fn backlog(&self) -> u32 {
        self.backlog.unwrap_or(1024)
    }

    pub fn io_threads(&self) -> usize {
        self.io_threads.unwrap_or_else(|| {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        })
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_micros(self.tick_us.unwrap_or(250))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms.unwrap_or(3000))
    }
}

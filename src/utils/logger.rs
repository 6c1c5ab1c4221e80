use anyhow::Context;
use std::str::FromStr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

/// Logging configuration: stdout by default, optional rolling file output.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct LoggerConfig {
    pub level: String,
    pub file_dir: Option<String>,
    pub file_prefix: Option<String>,
    pub rolling: Option<String>,
    #[serde(default)]
    pub max_files: usize,
}

impl LoggerConfig {
    /// Read configuration from `LOG_LEVEL`, `LOG_FILE_DIR`, `LOG_FILE_PREFIX`
    /// and `LOG_ROLLING`, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            file_dir: std::env::var("LOG_FILE_DIR").ok(),
            file_prefix: std::env::var("LOG_FILE_PREFIX").ok(),
            rolling: std::env::var("LOG_ROLLING").ok(),
            max_files: 2,
        }
    }

    /// Install the global subscriber. Returns the appender guard when file
    /// output is configured; keep it alive for the process lifetime.
    pub fn init(&self) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
        let level = Level::from_str(&self.level).unwrap_or(Level::INFO);

        let Some(dir) = self.file_dir.as_deref() else {
            let _ = tracing_subscriber::fmt().with_max_level(level).try_init();
            return Ok(None);
        };

        let rotation = match self.rolling.as_deref() {
            Some("hourly") => Rotation::HOURLY,
            Some("minutely") => Rotation::MINUTELY,
            _ => Rotation::DAILY,
        };

        let appender: RollingFileAppender = RollingFileAppender::builder()
            .rotation(rotation)
            .max_log_files(self.max_files.max(1))
            .filename_prefix(self.file_prefix.as_deref().unwrap_or(""))
            .build(dir)
            .with_context(|| format!("failed to create rolling appender in {dir}"))?;

        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(writer)
            .try_init();

        tracing::info!("logging to {dir}, rotation {:?}", self.rolling);
        Ok(Some(guard))
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_dir: None,
            file_prefix: None,
            rolling: Some("daily".to_string()),
            max_files: 2,
        }
    }
}

/// Per-callsite rate limit for log lines. Suppresses repeats inside the
/// interval; the next emitted line carries the suppressed count.
pub struct Throttle {
    last: Mutex<Instant>,
    suppressed: AtomicU64,
    interval: Duration,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        let start = Instant::now().checked_sub(interval).unwrap_or_else(Instant::now);
        Self {
            last: Mutex::new(start),
            suppressed: AtomicU64::new(0),
            interval,
        }
    }

    /// `Some(suppressed)` when the caller may log now, `None` otherwise.
    #[inline]
    pub fn poll(&self) -> Option<u64> {
        if self.interval.is_zero() {
            return Some(self.suppressed.swap(0, Ordering::Relaxed));
        }

        if let Ok(guard) = self.last.try_lock() {
            if guard.elapsed() < self.interval {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            drop(guard);
        }

        let mut last = match self.last.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if last.elapsed() >= self.interval {
            *last = Instant::now();
            Some(self.suppressed.swap(0, Ordering::Relaxed))
        } else {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            None
        }
    }
}

/// Throttled logging with the level given as an identifier
/// (`error`, `warn`, `info`, `debug`, `trace`). One throttle per callsite.
#[macro_export]
macro_rules! log_throttled {
    ($level:ident, $interval:expr, $($arg:tt)*) => {{
        static _THROTTLE: std::sync::OnceLock<$crate::utils::logger::Throttle> =
            std::sync::OnceLock::new();
        let t = _THROTTLE.get_or_init(|| $crate::utils::logger::Throttle::new($interval));
        if let Some(_suppressed) = t.poll() {
            if _suppressed > 0 {
                tracing::$level!(suppressed = _suppressed, $($arg)*);
            } else {
                tracing::$level!($($arg)*);
            }
        }
    }};
}

#[macro_export]
macro_rules! error_throttled { ($interval:expr, $($arg:tt)*) => { $crate::log_throttled!(error, $interval, $($arg)*); } }
#[macro_export]
macro_rules! warn_throttled  { ($interval:expr, $($arg:tt)*) => { $crate::log_throttled!(warn,  $interval, $($arg)*); } }

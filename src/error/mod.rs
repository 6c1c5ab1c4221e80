use std::error::Error;
use std::fmt;
use std::sync::Arc;

pub type AcceptorResult<T> = Result<T, AcceptorError>;

/// Core error taxonomy. Surfaces through pipeline read-error channels and
/// through broadcast waiter futures; cheap to clone so one failure can be
/// fanned out to every queued waiter.
#[derive(Debug, Clone)]
pub enum AcceptorError {
    /// A connection sat past its idle deadline.
    TimedOut,
    /// A framework-side invariant failed.
    InternalError(String),
    /// Upstream dial failed (resolution or connect).
    ConnectFailed(Arc<anyhow::Error>),
    /// `set_routing_data` rejected the pipeline after a successful connect.
    RoutingDataFailed(Arc<anyhow::Error>),
    Unknown(Arc<anyhow::Error>),
}

impl AcceptorError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::InternalError(msg.into())
    }

    pub fn connect_failed(err: anyhow::Error) -> Self {
        Self::ConnectFailed(Arc::new(err))
    }

    pub fn routing_failed(err: anyhow::Error) -> Self {
        Self::RoutingDataFailed(Arc::new(err))
    }

    /// Stable label for stats and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TimedOut => "timed_out",
            Self::InternalError(_) => "internal",
            Self::ConnectFailed(_) => "connect_failed",
            Self::RoutingDataFailed(_) => "routing_data_failed",
            Self::Unknown(_) => "unknown",
        }
    }
}

impl fmt::Display for AcceptorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimedOut => write!(f, "connection timed out"),
            Self::InternalError(msg) => write!(f, "internal error: {msg}"),
            Self::ConnectFailed(err) => write!(f, "connect failed: {err}"),
            Self::RoutingDataFailed(err) => write!(f, "routing data rejected: {err}"),
            Self::Unknown(err) => write!(f, "unknown error: {err}"),
        }
    }
}

impl Error for AcceptorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::ConnectFailed(err) | Self::RoutingDataFailed(err) | Self::Unknown(err) => {
                Some(err.as_ref().as_ref())
            }
            _ => None,
        }
    }
}

impl From<anyhow::Error> for AcceptorError {
    fn from(err: anyhow::Error) -> Self {
        AcceptorError::Unknown(Arc::new(err))
    }
}

impl From<std::io::Error> for AcceptorError {
    fn from(err: std::io::Error) -> Self {
        AcceptorError::Unknown(Arc::new(err.into()))
    }
}

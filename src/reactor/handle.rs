use crate::reactor::ReactorContext;
use crate::utils::{CancelToken, HealthFlag};
use anyhow::anyhow;
use crossbeam::channel::Sender;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;
use uuid::fmt::Simple;

/// Identifier of one reactor thread.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ReactorId {
    raw: Simple,
}

impl ReactorId {
    pub fn new() -> Self {
        Self {
            raw: Uuid::new_v4().simple(),
        }
    }

    #[inline]
    pub fn raw(&self) -> Simple {
        self.raw
    }
}

impl Default for ReactorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReactorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Closure injected into a reactor. Runs on the reactor thread inside its
/// task context, so `tokio::task::spawn_local` is available from within.
pub type ReactorTask = Box<dyn FnOnce() + Send + 'static>;

/// Cheap cross-thread handle to a reactor: inject closures, observe health,
/// request cancellation.
#[derive(Clone)]
pub struct ReactorHandle {
    id: ReactorId,
    tasks: Sender<ReactorTask>,
    cancel: CancelToken,
    health: HealthFlag,
}

impl ReactorHandle {
    pub(crate) fn new(
        id: ReactorId,
        tasks: Sender<ReactorTask>,
        cancel: CancelToken,
        health: HealthFlag,
    ) -> Self {
        Self {
            id,
            tasks,
            cancel,
            health,
        }
    }

    #[inline]
    pub fn id(&self) -> ReactorId {
        self.id
    }

    #[inline]
    pub fn is_healthy(&self) -> bool {
        self.health.is_up()
    }

    #[inline]
    pub fn token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.health.down();
        self.cancel.cancel();
    }

    /// True when called from the thread this handle points at.
    pub fn is_local(&self) -> bool {
        ReactorContext::try_current().is_some_and(|cx| cx.id() == self.id)
    }

    /// Queue a closure to run on the reactor thread at its next tick.
    pub fn run_on(&self, f: impl FnOnce() + Send + 'static) -> anyhow::Result<()> {
        self.tasks
            .send(Box::new(f))
            .map_err(|_| anyhow!("reactor {} is gone", self.id))
    }

    /// Run a closure on the reactor and wait for its result. Runs inline when
    /// already on the owning thread. Startup/teardown path only; never call
    /// from the hot path.
    pub fn call<R, F>(&self, f: F, timeout: Duration) -> anyhow::Result<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.is_local() {
            return Ok(f());
        }

        let (tx, rx) = crossbeam::channel::bounded(1);
        self.run_on(move || {
            let _ = tx.send(f());
        })?;
        rx.recv_timeout(timeout)
            .map_err(|_| anyhow!("reactor {} did not answer within {:?}", self.id, timeout))
    }
}

impl fmt::Debug for ReactorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactorHandle")
            .field("id", &self.id)
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

use crate::acceptor::AcceptorCore;
use crate::error::AcceptorError;
use crate::pipeline::{Pipeline, PipelineId, PipelineManager};
use bytes::Bytes;
use std::cell::Cell;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

/// A tracked server-side connection: owns the child pipeline, carries the
/// idle deadline and busy flag, and funnels pipeline deletion back into the
/// acceptor's end-of-tick removal queue.
pub struct ServerConnection {
    id: u64,
    pipeline: Pipeline<Bytes>,
    deadline: Cell<Option<Instant>>,
    busy: Cell<bool>,
    timed_out: Cell<bool>,
    acceptor: Weak<AcceptorCore>,
}

impl ServerConnection {
    pub(crate) fn new(
        id: u64,
        pipeline: Pipeline<Bytes>,
        deadline: Option<Instant>,
        acceptor: Weak<AcceptorCore>,
    ) -> Rc<Self> {
        let conn = Rc::new(Self {
            id,
            pipeline,
            deadline: Cell::new(deadline),
            busy: Cell::new(false),
            timed_out: Cell::new(false),
            acceptor,
        });
        conn.pipeline
            .set_manager(Rc::downgrade(&conn) as Weak<dyn PipelineManager>);
        conn
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn pipeline(&self) -> &Pipeline<Bytes> {
        &self.pipeline
    }

    #[inline]
    pub fn is_busy(&self) -> bool {
        self.busy.get()
    }

    /// Upper handlers flag a connection busy to shield it from idle
    /// expiration and `close_when_idle`.
    pub fn set_busy(&self, busy: bool) {
        self.busy.set(busy);
    }

    /// Push the idle deadline out by `idle` from now.
    pub fn touch(&self, idle: Duration) {
        self.deadline.set(Some(Instant::now() + idle));
    }

    pub(crate) fn expired(&self, now: Instant) -> bool {
        !self.busy.get()
            && !self.timed_out.get()
            && self.deadline.get().is_some_and(|d| d <= now)
    }

    /// Raise `TimedOut` into the pipeline's read-error channel; the chain is
    /// expected to close and request deletion.
    pub(crate) fn timeout_expired(&self) {
        if self.timed_out.replace(true) {
            return;
        }
        self.pipeline.read_exception(AcceptorError::TimedOut);
    }

    // ---- staged shutdown ----

    pub(crate) fn notify_pending_shutdown(&self) {}

    pub(crate) fn close_when_idle(&self) {
        if !self.busy.get() {
            self.pipeline.close();
        }
    }

    pub(crate) fn drop_connection(&self) {
        self.pipeline.close();
    }
}

impl PipelineManager for ServerConnection {
    fn delete_pipeline(&self, pipeline: PipelineId) {
        debug_assert_eq!(pipeline, self.pipeline.id());
        if let Some(acceptor) = self.acceptor.upgrade() {
            acceptor.schedule_removal(self.id);
        }
    }
}

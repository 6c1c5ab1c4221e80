use crate::error::AcceptorError;
use crate::transport::{Transport, TransportInfo};
use bytes::Bytes;
use futures::StreamExt;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tokio_util::codec::{Decoder, FramedRead};

static NEXT_PIPELINE_ID: AtomicU64 = AtomicU64::new(1);

pub type PipelineId = u64;

/// Owner-side teardown funnel. The owner (a connection record, a broadcast
/// entry) holds the pipeline; the pipeline keeps only this non-owning handle
/// and notifies it exactly once when the chain tears down.
pub trait PipelineManager {
    fn delete_pipeline(&self, pipeline: PipelineId);
}

/// One stage of a pipeline. Default implementations forward each event to
/// the next handler; terminal handlers override and consume. An EOF or error
/// that falls off the end of the chain closes the pipeline; a `read` that
/// falls off the end is dropped.
pub trait InboundHandler<In: 'static>: 'static {
    fn transport_active(&mut self, ctx: &HandlerCtx<In>) {
        ctx.fire_transport_active();
    }

    fn read(&mut self, ctx: &HandlerCtx<In>, msg: In);

    fn read_eof(&mut self, ctx: &HandlerCtx<In>) {
        ctx.fire_read_eof();
    }

    fn read_exception(&mut self, ctx: &HandlerCtx<In>, err: AcceptorError) {
        ctx.fire_read_exception(err);
    }
}

struct Slot<In: 'static> {
    dynamic: Rc<RefCell<dyn InboundHandler<In>>>,
    concrete: Rc<dyn Any>,
}

impl<In: 'static> Clone for Slot<In> {
    fn clone(&self) -> Self {
        Self {
            dynamic: self.dynamic.clone(),
            concrete: self.concrete.clone(),
        }
    }
}

struct PipelineIo {
    out_tx: UnboundedSender<Bytes>,
    pump: tokio::task::JoinHandle<()>,
    writer: tokio::task::JoinHandle<()>,
}

struct Shared<In: 'static> {
    id: PipelineId,
    handlers: RefCell<Vec<Slot<In>>>,
    finalized: Cell<bool>,
    manager: RefCell<Option<Weak<dyn PipelineManager>>>,
    transport_info: RefCell<Option<TransportInfo>>,
    io: RefCell<Option<PipelineIo>>,
    active: Cell<bool>,
    terminated: Cell<bool>,
    closed: Cell<bool>,
    manager_notified: Cell<bool>,
}

/// Ordered chain of inbound handlers around one (optional) transport.
///
/// A pipeline is created on the reactor that will own it, mutated only from
/// that thread, and torn down either by its manager or by EOF/error
/// propagating through the chain. Clones share the same chain.
pub struct Pipeline<In: 'static> {
    shared: Rc<Shared<In>>,
}

impl<In: 'static> Clone for Pipeline<In> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<In: 'static> Default for Pipeline<In> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In: 'static> Pipeline<In> {
    pub fn new() -> Self {
        Self {
            shared: Rc::new(Shared {
                id: NEXT_PIPELINE_ID.fetch_add(1, Ordering::Relaxed),
                handlers: RefCell::new(Vec::new()),
                finalized: Cell::new(false),
                manager: RefCell::new(None),
                transport_info: RefCell::new(None),
                io: RefCell::new(None),
                active: Cell::new(false),
                terminated: Cell::new(false),
                closed: Cell::new(false),
                manager_notified: Cell::new(false),
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> PipelineId {
        self.shared.id
    }

    /// Append a handler. Panics after `finalize`.
    pub fn add<H: InboundHandler<In>>(&self, handler: H) -> &Self {
        assert!(
            !self.shared.finalized.get(),
            "pipeline is finalized, no more handlers"
        );
        let rc = Rc::new(RefCell::new(handler));
        self.shared.handlers.borrow_mut().push(Slot {
            dynamic: rc.clone(),
            concrete: rc,
        });
        self
    }

    /// Freeze the chain. Events may be dispatched from here on.
    pub fn finalize(&self) {
        self.shared.finalized.set(true);
    }

    pub fn handler_count(&self) -> usize {
        self.shared.handlers.borrow().len()
    }

    /// Typed lookup of a handler previously added to this chain.
    pub fn handler<H: 'static>(&self) -> Option<Rc<RefCell<H>>> {
        self.shared
            .handlers
            .borrow()
            .iter()
            .find_map(|slot| slot.concrete.clone().downcast::<RefCell<H>>().ok())
    }

    pub fn set_manager(&self, manager: Weak<dyn PipelineManager>) {
        *self.shared.manager.borrow_mut() = Some(manager);
    }

    pub fn transport_info(&self) -> Option<TransportInfo> {
        self.shared.transport_info.borrow().clone()
    }

    pub fn set_transport_info(&self, info: TransportInfo) {
        *self.shared.transport_info.borrow_mut() = Some(info);
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.get()
    }

    /// Take ownership of a transport and start pumping decoded frames into
    /// the chain. Must run inside the owning reactor's task context.
    pub fn attach_transport<D>(&self, transport: Transport, decoder: D)
    where
        D: Decoder<Item = In, Error = anyhow::Error> + 'static,
    {
        let (stream, info) = transport.into_parts();
        *self.shared.transport_info.borrow_mut() = Some(info);

        let (read_half, mut write_half) = stream.into_split();
        let (out_tx, mut out_rx) = unbounded_channel::<Bytes>();

        let writer = tokio::task::spawn_local({
            let pipeline = self.clone();
            async move {
                while let Some(buf) = out_rx.recv().await {
                    if let Err(err) = write_half.write_all(&buf).await {
                        pipeline.read_exception(err.into());
                        break;
                    }
                }
                let _ = write_half.shutdown().await;
            }
        });

        let pump = tokio::task::spawn_local({
            let pipeline = self.clone();
            async move {
                let mut frames = FramedRead::new(read_half, decoder);
                loop {
                    match frames.next().await {
                        Some(Ok(msg)) => pipeline.read(msg),
                        Some(Err(err)) => {
                            pipeline.read_exception(AcceptorError::Unknown(Arc::new(err)));
                            break;
                        }
                        None => {
                            pipeline.read_eof();
                            break;
                        }
                    }
                }
            }
        });

        *self.shared.io.borrow_mut() = Some(PipelineIo {
            out_tx,
            pump,
            writer,
        });
    }

    /// Clonable handle for enqueueing outbound bytes, valid while the
    /// transport is attached.
    pub fn writer(&self) -> Option<PipelineWriter> {
        self.shared
            .io
            .borrow()
            .as_ref()
            .map(|io| PipelineWriter {
                tx: io.out_tx.clone(),
            })
    }

    /// Enqueue outbound bytes. Returns `false` when no transport is attached
    /// or the writer has shut down.
    pub fn write(&self, buf: Bytes) -> bool {
        match self.shared.io.borrow().as_ref() {
            Some(io) => io.out_tx.send(buf).is_ok(),
            None => false,
        }
    }

    // ---- event entry points ----

    /// Fired once, before any read.
    pub fn transport_active(&self) {
        if self.shared.closed.get() || self.shared.active.replace(true) {
            return;
        }
        self.dispatch_active(0);
    }

    pub fn read(&self, msg: In) {
        if self.shared.closed.get() || self.shared.terminated.get() {
            return;
        }
        self.dispatch_read(0, msg);
    }

    /// At most once; ignored after an exception already terminated the chain.
    pub fn read_eof(&self) {
        if self.shared.closed.get() || self.shared.terminated.replace(true) {
            return;
        }
        self.dispatch_eof(0);
    }

    /// For transport-driven pipelines this terminates the chain and fires at
    /// most once. Transportless pipelines (the accept path) may observe
    /// repeated errors.
    pub fn read_exception(&self, err: AcceptorError) {
        if self.shared.closed.get() {
            return;
        }
        if self.shared.transport_info.borrow().is_some()
            && self.shared.terminated.replace(true)
        {
            return;
        }
        self.dispatch_exception(0, err);
    }

    /// Idempotent teardown: stops transport I/O and notifies the manager.
    /// Never dispatches further events into the chain.
    pub fn close(&self) {
        if self.shared.closed.replace(true) {
            return;
        }
        if let Some(io) = self.shared.io.borrow_mut().take() {
            io.pump.abort();
            io.writer.abort();
        }
        self.notify_manager();
    }

    fn notify_manager(&self) {
        if self.shared.manager_notified.replace(true) {
            return;
        }
        let manager = self.shared.manager.borrow().clone();
        if let Some(manager) = manager.and_then(|weak| weak.upgrade()) {
            manager.delete_pipeline(self.shared.id);
        }
    }

    // ---- dispatch ----

    fn slot(&self, idx: usize) -> Option<Slot<In>> {
        self.shared.handlers.borrow().get(idx).cloned()
    }

    fn ctx(&self, idx: usize) -> HandlerCtx<In> {
        HandlerCtx {
            pipeline: self.clone(),
            idx,
        }
    }

    fn dispatch_active(&self, idx: usize) {
        if let Some(slot) = self.slot(idx) {
            slot.dynamic.borrow_mut().transport_active(&self.ctx(idx));
        }
    }

    fn dispatch_read(&self, idx: usize, msg: In) {
        if let Some(slot) = self.slot(idx) {
            slot.dynamic.borrow_mut().read(&self.ctx(idx), msg);
        }
    }

    fn dispatch_eof(&self, idx: usize) {
        match self.slot(idx) {
            Some(slot) => slot.dynamic.borrow_mut().read_eof(&self.ctx(idx)),
            None => self.close(),
        }
    }

    fn dispatch_exception(&self, idx: usize, err: AcceptorError) {
        match self.slot(idx) {
            Some(slot) => slot.dynamic.borrow_mut().read_exception(&self.ctx(idx), err),
            None => self.close(),
        }
    }
}

/// Handler-side view of its pipeline position; `fire_*` forwards an event to
/// the next handler in the chain.
pub struct HandlerCtx<In: 'static> {
    pipeline: Pipeline<In>,
    idx: usize,
}

impl<In: 'static> HandlerCtx<In> {
    #[inline]
    pub fn pipeline(&self) -> &Pipeline<In> {
        &self.pipeline
    }

    pub fn fire_transport_active(&self) {
        self.pipeline.dispatch_active(self.idx + 1);
    }

    pub fn fire_read(&self, msg: In) {
        self.pipeline.dispatch_read(self.idx + 1, msg);
    }

    pub fn fire_read_eof(&self) {
        self.pipeline.dispatch_eof(self.idx + 1);
    }

    pub fn fire_read_exception(&self, err: AcceptorError) {
        self.pipeline.dispatch_exception(self.idx + 1, err);
    }

    pub fn write(&self, buf: Bytes) -> bool {
        self.pipeline.write(buf)
    }

    pub fn close(&self) {
        self.pipeline.close();
    }
}

/// Clonable outbound-byte handle detached from the pipeline's lifetime.
#[derive(Clone)]
pub struct PipelineWriter {
    tx: UnboundedSender<Bytes>,
}

impl PipelineWriter {
    pub fn write(&self, buf: Bytes) -> bool {
        self.tx.send(buf).is_ok()
    }
}

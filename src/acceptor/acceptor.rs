use crate::acceptor::{AcceptEvent, AcceptPipelineFactory, Datagram, ServerConnection};
use crate::config::ServerConfig;
use crate::error::AcceptorError;
use crate::pipeline::{HandlerCtx, InboundHandler, Pipeline, PipelineFactory};
use crate::reactor::ReactorContext;
use crate::transport::{SecureTransportKind, Transport};
use crate::utils::StateCell;
use crate::warn_throttled;
use ahash::AHashMap;
use bytes::Bytes;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

static NEXT_ACCEPTOR_SLOT: AtomicU64 = AtomicU64::new(1);

const THROTTLE: Duration = Duration::from_secs(1);

/// Counters published by one acceptor through a lock-free snapshot cell.
#[derive(Debug, Default)]
pub struct AcceptorStats {
    pub connections_added: AtomicU64,
    pub connections_removed: AtomicU64,
    pub accept_errors: AtomicU64,
    pub ssl_errors: AtomicU64,
}

/// Receives accept-path TLS failures; wire an implementation through the
/// bootstrap to export them.
pub trait SslStatsSink: Send + Sync + 'static {
    fn record_error(&self, err: &AcceptorError);
}

pub(crate) struct AcceptorCore {
    weak: Weak<AcceptorCore>,
    slot: Cell<u64>,
    config: Arc<ServerConfig>,
    child_factory: Option<Arc<dyn PipelineFactory>>,
    ssl_stats: Option<Arc<dyn SslStatsSink>>,
    accept_pipeline: RefCell<Option<Pipeline<AcceptEvent>>>,
    connections: RefCell<AHashMap<u64, Rc<ServerConnection>>>,
    doomed: RefCell<Vec<u64>>,
    sweep_scheduled: Cell<bool>,
    next_conn_id: Cell<u64>,
    stats: Arc<StateCell<AcceptorStats>>,
    io_tasks: RefCell<Vec<tokio::task::JoinHandle<()>>>,
    draining: Cell<bool>,
}

/// Owns listening sockets on one reactor, turns accepted transports into
/// child pipelines through the accept pipeline, and tracks live connections.
/// Thread-pinned: every method runs on the owning reactor.
#[derive(Clone)]
pub struct Acceptor {
    core: Rc<AcceptorCore>,
}

impl Acceptor {
    /// Build an acceptor. Constructing one with no listeners is legal:
    /// synthetic connections injected via `add_connection` are tracked
    /// exactly like accepted ones.
    pub fn new(
        config: Arc<ServerConfig>,
        child_factory: Option<Arc<dyn PipelineFactory>>,
        ssl_stats: Option<Arc<dyn SslStatsSink>>,
    ) -> Self {
        let core = Rc::new_cyclic(|weak| AcceptorCore {
            weak: weak.clone(),
            slot: Cell::new(0),
            config,
            child_factory,
            ssl_stats,
            accept_pipeline: RefCell::new(None),
            connections: RefCell::new(AHashMap::new()),
            doomed: RefCell::new(Vec::new()),
            sweep_scheduled: Cell::new(false),
            next_conn_id: Cell::new(1),
            stats: StateCell::new_arc(AcceptorStats::default()),
            io_tasks: RefCell::new(Vec::new()),
            draining: Cell::new(false),
        });
        Self { core }
    }

    pub(crate) fn from_core(core: Rc<AcceptorCore>) -> Self {
        Self { core }
    }

    /// Build the accept pipeline and start the idle sweeper. When a child
    /// factory is configured (no custom accept pipeline took over), the
    /// acceptor appends itself as the terminal inbound handler.
    pub fn init(&self, accept_factory: &dyn AcceptPipelineFactory) {
        let pipeline = accept_factory.new_pipeline(self);
        if self.core.child_factory.is_some() {
            pipeline.add(TerminalAcceptHandler {
                core: self.core.weak.clone(),
            });
        }
        pipeline.finalize();
        *self.core.accept_pipeline.borrow_mut() = Some(pipeline);

        if let Some(idle) = self.core.config.idle_timeout() {
            self.spawn_idle_sweeper(idle);
        }
    }

    /// Register this acceptor in the owning reactor's local registry and
    /// return the slot a `Send` handle can find it by.
    pub fn register_local(&self) -> u64 {
        let slot = NEXT_ACCEPTOR_SLOT.fetch_add(1, Ordering::Relaxed);
        self.core.slot.set(slot);
        let core = self.core.clone();
        ReactorContext::current().local_or_init::<AcceptorCore>(slot, move || core);
        slot
    }

    /// Look the acceptor registered under `slot` up on the current reactor.
    pub fn local(slot: u64) -> Option<Acceptor> {
        ReactorContext::try_current()
            .and_then(|cx| cx.local::<AcceptorCore>(slot))
            .map(Acceptor::from_core)
    }

    /// Start accepting on a cloned listener fd. Runs on the owning reactor.
    pub fn add_listener(&self, listener: std::net::TcpListener) -> anyhow::Result<()> {
        listener.set_nonblocking(true)?;
        let listener = tokio::net::TcpListener::from_std(listener)?;
        let weak = self.core.weak.clone();

        let task = tokio::task::spawn_local(async move {
            loop {
                let accepted = listener.accept().await;
                let Some(core) = weak.upgrade() else { return };
                match accepted {
                    Ok((stream, peer)) => {
                        match Transport::accepted(stream, peer, SecureTransportKind::Insecure, None)
                        {
                            Ok(transport) => {
                                core.read_accept_event(AcceptEvent::NewConnection(transport));
                            }
                            Err(err) => {
                                core.bump(|s| &s.accept_errors);
                                warn_throttled!(THROTTLE, "dropping fresh transport: {err}");
                            }
                        }
                    }
                    Err(err) => {
                        // a single bad accept never takes down the listener
                        core.bump(|s| &s.accept_errors);
                        warn_throttled!(THROTTLE, "accept failed: {err}");
                        core.read_accept_event(AcceptEvent::Error(err.into()));
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
        self.core.io_tasks.borrow_mut().push(task);
        Ok(())
    }

    /// Start receiving datagrams; each one is enqueued to the accept
    /// pipeline untouched.
    pub fn add_datagram_socket(&self, socket: std::net::UdpSocket) -> anyhow::Result<()> {
        socket.set_nonblocking(true)?;
        let socket = Arc::new(tokio::net::UdpSocket::from_std(socket)?);
        let weak = self.core.weak.clone();

        let task = tokio::task::spawn_local(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let received = socket.recv_from(&mut buf).await;
                let Some(core) = weak.upgrade() else { return };
                match received {
                    Ok((n, peer)) => {
                        core.read_accept_event(AcceptEvent::Datagram(Datagram {
                            buf: Bytes::copy_from_slice(&buf[..n]),
                            peer,
                            socket: socket.clone(),
                        }));
                    }
                    Err(err) => {
                        core.bump(|s| &s.accept_errors);
                        warn_throttled!(THROTTLE, "datagram receive failed: {err}");
                    }
                }
            }
        });
        self.core.io_tasks.borrow_mut().push(task);
        Ok(())
    }

    /// Read an event into the accept pipeline.
    pub fn accept(&self, event: AcceptEvent) {
        self.core.read_accept_event(event);
    }

    /// Track a child pipeline as a live connection. The pipeline should
    /// already have seen `transport_active`.
    pub fn add_connection(&self, pipeline: Pipeline<Bytes>) -> Rc<ServerConnection> {
        self.core.register_connection(pipeline)
    }

    /// Inject a TLS failure: the accept pipeline sees the error first, then
    /// the default handling records it.
    pub fn ssl_connection_error(&self, err: AcceptorError) {
        let pipeline = self.core.accept_pipeline.borrow().clone();
        if let Some(pipeline) = pipeline {
            pipeline.read_exception(err.clone());
        }
        self.core.bump(|s| &s.ssl_errors);
        if let Some(sink) = &self.core.ssl_stats {
            sink.record_error(&err);
        }
        warn_throttled!(THROTTLE, "tls negotiation failed: {err}");
    }

    pub fn connection_count(&self) -> usize {
        self.core.connections.borrow().len()
    }

    pub fn stats(&self) -> Arc<StateCell<AcceptorStats>> {
        self.core.stats.clone()
    }

    /// Staged drain: stop accepting, announce shutdown, close idle
    /// connections, and forcefully drop the rest after `grace`.
    pub fn drain(&self, grace: Duration) {
        self.core.draining.set(true);
        for task in self.core.io_tasks.borrow_mut().drain(..) {
            task.abort();
        }

        let conns: Vec<Rc<ServerConnection>> =
            self.core.connections.borrow().values().cloned().collect();
        for conn in &conns {
            conn.notify_pending_shutdown();
        }
        for conn in &conns {
            conn.close_when_idle();
        }

        if grace.is_zero() {
            for conn in &conns {
                conn.drop_connection();
            }
            return;
        }

        let weak = self.core.weak.clone();
        tokio::task::spawn_local(async move {
            tokio::time::sleep(grace).await;
            let Some(core) = weak.upgrade() else { return };
            let leftovers: Vec<Rc<ServerConnection>> =
                core.connections.borrow().values().cloned().collect();
            if !leftovers.is_empty() {
                tracing::warn!("dropping {} connections after drain grace", leftovers.len());
            }
            for conn in leftovers {
                conn.drop_connection();
            }
        });
    }

    /// Immediate teardown used when the owning reactor stops: drop
    /// listeners, connections, and the local registration.
    pub fn shutdown(&self) {
        self.drain(Duration::ZERO);
        let slot = self.core.slot.get();
        if slot != 0
            && let Some(cx) = ReactorContext::try_current()
        {
            cx.remove_local::<AcceptorCore>(slot);
        }
    }

    fn spawn_idle_sweeper(&self, idle: Duration) {
        let weak = self.core.weak.clone();
        let period = (idle / 4).max(Duration::from_millis(10));
        let task = tokio::task::spawn_local(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(core) = weak.upgrade() else { return };
                core.expire_idle(Instant::now());
            }
        });
        self.core.io_tasks.borrow_mut().push(task);
    }
}

impl AcceptorCore {
    fn bump(&self, field: impl Fn(&AcceptorStats) -> &AtomicU64) {
        self.stats.mutate(|s| {
            field(s).fetch_add(1, Ordering::Relaxed);
        });
    }

    fn read_accept_event(&self, event: AcceptEvent) {
        let pipeline = self.accept_pipeline.borrow().clone();
        if let Some(pipeline) = pipeline {
            pipeline.read(event);
        }
    }

    /// Conn events are emitted on the next tick: emitting inline would
    /// re-enter the accept pipeline while its terminal handler is borrowed.
    fn emit_deferred(&self, event: AcceptEvent) {
        let weak = self.weak.clone();
        tokio::task::spawn_local(async move {
            if let Some(core) = weak.upgrade() {
                core.read_accept_event(event);
            }
        });
    }

    fn register_connection(&self, pipeline: Pipeline<Bytes>) -> Rc<ServerConnection> {
        let id = self.next_conn_id.get();
        self.next_conn_id.set(id + 1);
        let deadline = self.config.idle_timeout().map(|idle| Instant::now() + idle);

        let conn = ServerConnection::new(id, pipeline, deadline, self.weak.clone());
        self.connections.borrow_mut().insert(id, conn.clone());
        self.bump(|s| &s.connections_added);
        self.emit_deferred(AcceptEvent::ConnAdded);

        // a pipeline that died before the manager was attached would never
        // report back, so reap it here
        if conn.pipeline().is_closed() {
            self.schedule_removal(id);
        }
        conn
    }

    fn handle_new_transport(&self, transport: Transport) {
        if self.draining.get() {
            return;
        }
        let Some(factory) = self.child_factory.as_ref() else {
            return;
        };
        match factory.new_pipeline(transport) {
            Ok(pipeline) => {
                pipeline.transport_active();
                self.register_connection(pipeline);
            }
            Err(err) => {
                self.bump(|s| &s.accept_errors);
                warn_throttled!(THROTTLE, "child pipeline build failed: {err}");
            }
        }
    }

    fn record_terminal_error(&self, err: &AcceptorError) {
        self.bump(|s| &s.accept_errors);
        if let Some(sink) = &self.ssl_stats {
            sink.record_error(err);
        }
        warn_throttled!(THROTTLE, "accept pipeline error: {err}");
    }

    pub(crate) fn schedule_removal(&self, conn_id: u64) {
        self.doomed.borrow_mut().push(conn_id);
        if self.sweep_scheduled.replace(true) {
            return;
        }
        // the queue drains once the current dispatch unwinds, so a pipeline
        // is never torn down while its own callback is still on the stack
        let weak = self.weak.clone();
        tokio::task::spawn_local(async move {
            if let Some(core) = weak.upgrade() {
                core.flush_doomed();
            }
        });
    }

    fn flush_doomed(&self) {
        self.sweep_scheduled.set(false);
        let ids: Vec<u64> = self.doomed.borrow_mut().drain(..).collect();
        for id in ids {
            if self.connections.borrow_mut().remove(&id).is_some() {
                self.bump(|s| &s.connections_removed);
                self.emit_deferred(AcceptEvent::ConnRemoved);
            }
        }
    }

    fn expire_idle(&self, now: Instant) {
        let expired: Vec<Rc<ServerConnection>> = self
            .connections
            .borrow()
            .values()
            .filter(|conn| conn.expired(now))
            .cloned()
            .collect();
        for conn in expired {
            conn.timeout_expired();
        }
    }
}

/// Default terminal of the accept pipeline: turns `NewConnection` events into
/// tracked child pipelines and drops every kind it does not recognize.
struct TerminalAcceptHandler {
    core: Weak<AcceptorCore>,
}

impl InboundHandler<AcceptEvent> for TerminalAcceptHandler {
    fn transport_active(&mut self, _ctx: &HandlerCtx<AcceptEvent>) {}

    fn read(&mut self, _ctx: &HandlerCtx<AcceptEvent>, event: AcceptEvent) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        match event {
            AcceptEvent::NewConnection(transport) => core.handle_new_transport(transport),
            AcceptEvent::Error(err) => core.record_terminal_error(&err),
            // datagrams at a TCP-only terminal and conn events end here
            _ => {}
        }
    }

    fn read_eof(&mut self, _ctx: &HandlerCtx<AcceptEvent>) {}

    fn read_exception(&mut self, _ctx: &HandlerCtx<AcceptEvent>, err: AcceptorError) {
        if let Some(core) = self.core.upgrade() {
            core.record_terminal_error(&err);
        }
    }
}

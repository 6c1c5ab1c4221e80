use crate::acceptor::{
    AcceptPipelineFactory, DefaultAcceptPipelineFactory, ServerAcceptorFactory, SslStatsSink,
};
use crate::config::ServerConfig;
use crate::pipeline::PipelineFactory;
use crate::reactor::IoExecutor;
use crate::server::ServerWorkerPool;
use anyhow::Context;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Server surface: bind addresses, wire the pipeline factories, start one
/// acceptor per reactor thread, stop with a staged drain.
pub struct ServerBootstrap {
    config: Arc<ServerConfig>,
    accept_pipeline_factory: Arc<dyn AcceptPipelineFactory>,
    child_pipeline_factory: Option<Arc<dyn PipelineFactory>>,
    ssl_stats: Option<Arc<dyn SslStatsSink>>,
    sockets: Vec<Arc<std::net::TcpListener>>,
    pool: Arc<ServerWorkerPool>,
    executor: Option<IoExecutor>,
}

impl ServerBootstrap {
    pub fn new(config: ServerConfig) -> Self {
        let pool = ServerWorkerPool::new(config.drain_timeout());
        Self {
            config: Arc::new(config),
            accept_pipeline_factory: Arc::new(DefaultAcceptPipelineFactory),
            child_pipeline_factory: None,
            ssl_stats: None,
            sockets: Vec::new(),
            pool,
            executor: None,
        }
    }

    /// The worker pool; needed up front by accept-routing setups.
    pub fn pool(&self) -> Arc<ServerWorkerPool> {
        self.pool.clone()
    }

    pub fn child_pipeline(mut self, factory: Arc<dyn PipelineFactory>) -> Self {
        self.child_pipeline_factory = Some(factory);
        self
    }

    /// Replace the default accept pipeline. With a custom accept pipeline
    /// and no child factory, the caller's terminal handler owns accepted
    /// transports.
    pub fn accept_pipeline(mut self, factory: Arc<dyn AcceptPipelineFactory>) -> Self {
        self.accept_pipeline_factory = factory;
        self
    }

    pub fn ssl_stats(mut self, sink: Arc<dyn SslStatsSink>) -> Self {
        self.ssl_stats = Some(sink);
        self
    }

    /// Bind a listening socket and return the chosen local address (bind to
    /// port 0 to learn an ephemeral port).
    pub fn bind(&mut self, addr: SocketAddr) -> anyhow::Result<SocketAddr> {
        let listener = bind_listener(addr, self.config.backlog())
            .with_context(|| format!("failed to bind {addr}"))?;
        let local = listener.local_addr()?;
        let listener = Arc::new(listener);
        self.pool.add_tcp_socket(listener.clone());
        self.sockets.push(listener);
        tracing::info!("listening on {local}");
        Ok(local)
    }

    /// Bind a datagram socket; received datagrams flow into the accept
    /// pipeline as `AcceptEvent::Datagram`.
    pub fn bind_udp(&mut self, addr: SocketAddr) -> anyhow::Result<SocketAddr> {
        let socket = std::net::UdpSocket::bind(addr)
            .with_context(|| format!("failed to bind udp {addr}"))?;
        let local = socket.local_addr()?;
        self.pool.add_udp_socket(Arc::new(socket));
        Ok(local)
    }

    /// Listener list for address introspection.
    pub fn sockets(&self) -> &[Arc<std::net::TcpListener>] {
        &self.sockets
    }

    /// Spawn the reactor threads; each one gets an acceptor mirroring every
    /// bound listener.
    pub fn start(&mut self) -> anyhow::Result<()> {
        if self.executor.is_some() {
            anyhow::bail!("server already started");
        }

        self.pool.set_acceptor_factory(Arc::new(ServerAcceptorFactory::new(
            self.accept_pipeline_factory.clone(),
            self.child_pipeline_factory.clone(),
            self.config.clone(),
            self.ssl_stats.clone(),
        )));

        let mut executor = IoExecutor::new(
            "reactor",
            self.config.io_threads(),
            self.config.tick(),
            self.config.pin_cores.clone(),
        );
        executor.add_observer(self.pool.clone());
        executor.start()?;
        self.executor = Some(executor);
        Ok(())
    }

    /// Stop accepting, drain connections through the staged shutdown
    /// contract, then join the reactor threads.
    pub fn stop(&mut self) {
        let Some(executor) = self.executor.take() else {
            return;
        };
        self.pool.stop();
        self.pool.clear_sockets();
        self.sockets.clear();
        // keep the reactors running while connections drain, up to the grace
        let deadline =
            std::time::Instant::now() + self.config.drain_timeout() + Duration::from_millis(100);
        while std::time::Instant::now() < deadline {
            if self.pool.active_connections() == 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        executor.stop();
    }

    /// Block until a termination signal arrives, then stop.
    pub fn run_until_terminated(&mut self) -> anyhow::Result<()> {
        let term = Arc::new(AtomicBool::new(false));
        for sig in TERM_SIGNALS {
            flag::register(*sig, term.clone())
                .with_context(|| format!("failed to register signal {sig}"))?;
        }
        while !term.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(50));
        }
        tracing::info!("termination signal received");
        self.stop();
        Ok(())
    }
}

impl Drop for ServerBootstrap {
    fn drop(&mut self) {
        if self.executor.is_some() {
            self.stop();
        }
    }
}

fn bind_listener(addr: SocketAddr, backlog: u32) -> anyhow::Result<std::net::TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;
    Ok(socket.into())
}

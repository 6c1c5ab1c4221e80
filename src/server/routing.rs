use crate::acceptor::{AcceptEvent, AcceptPipelineFactory, Acceptor};
use crate::error::AcceptorError;
use crate::pipeline::{HandlerCtx, InboundHandler, Pipeline};
use crate::server::{AcceptorHandle, ServerWorkerPool};
use crate::transport::Transport;
use crate::warn_throttled;
use bytes::{Bytes, BytesMut};
use std::cell::RefCell;
use std::fmt::Debug;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;

const THROTTLE: Duration = Duration::from_secs(1);

/// Parses application-level routing data off the head of a connection's byte
/// stream. `Ok(None)` asks for more bytes; `Ok(Some(key))` must consume the
/// key's bytes from `buf`, leaving the remainder for replay.
pub trait RoutingDataParser: Send + Sync + 'static {
    type Key: Clone + Debug + Eq + Hash + Send + 'static;

    fn parse(&self, buf: &mut BytesMut) -> anyhow::Result<Option<Self::Key>>;
}

/// Builds the child pipeline for a routed connection. Runs on the worker the
/// key hashed to, like any other child factory.
pub trait RoutedPipelineFactory<K>: Send + Sync + 'static {
    fn new_pipeline(&self, transport: Transport, key: &K) -> anyhow::Result<Pipeline<Bytes>>;
}

/// Accept-path terminal that peels routing data off each new connection,
/// hashes the key over the worker pool's acceptors, and hands the connection
/// to the chosen worker. Buffered bytes beyond the key are replayed into the
/// child pipeline before the transport pump takes over.
pub struct AcceptRoutingHandler<P: RoutingDataParser> {
    parser: Arc<P>,
    factory: Arc<dyn RoutedPipelineFactory<P::Key>>,
    pool: Arc<ServerWorkerPool>,
    // resolved once; sorted so every accept thread routes a key the same way
    workers: RefCell<Vec<AcceptorHandle>>,
}

impl<P: RoutingDataParser> AcceptRoutingHandler<P> {
    pub fn new(
        parser: Arc<P>,
        factory: Arc<dyn RoutedPipelineFactory<P::Key>>,
        pool: Arc<ServerWorkerPool>,
    ) -> Self {
        Self {
            parser,
            factory,
            pool,
            workers: RefCell::new(Vec::new()),
        }
    }

    fn workers(&self) -> Vec<AcceptorHandle> {
        let mut cached = self.workers.borrow_mut();
        if cached.is_empty() {
            self.pool.for_each_worker(|handle| cached.push(handle.clone()));
            cached.sort_by_key(|handle| handle.reactor().id().raw().to_string());
        }
        cached.clone()
    }

    fn route(&self, transport: Transport) {
        let workers = self.workers();
        if workers.is_empty() {
            warn_throttled!(THROTTLE, "no workers available, dropping connection");
            return;
        }

        let parser = self.parser.clone();
        let factory = self.factory.clone();

        tokio::task::spawn_local(async move {
            let (mut stream, info) = transport.into_parts();
            let mut buf = BytesMut::with_capacity(1024);

            let key = loop {
                match parser.parse(&mut buf) {
                    Ok(Some(key)) => break key,
                    Ok(None) => match stream.read_buf(&mut buf).await {
                        // EOF or socket error before routing data: the
                        // connection is dropped, never routed
                        Ok(0) => return,
                        Ok(_) => {}
                        Err(err) => {
                            warn_throttled!(THROTTLE, "routing read failed: {err}");
                            return;
                        }
                    },
                    Err(err) => {
                        warn_throttled!(THROTTLE, "routing data rejected: {err}");
                        return;
                    }
                }
            };

            let mut hasher = DefaultHasher::new();
            key.hash(&mut hasher);
            let target = &workers[(hasher.finish() % workers.len() as u64) as usize];

            let transport = Transport::from_parts(stream, info);
            let leftover = buf.freeze();
            let dispatched = target.with(move |acceptor| {
                build_routed(acceptor, factory.as_ref(), transport, &key, leftover);
            });
            if let Err(err) = dispatched {
                warn_throttled!(THROTTLE, "routed connection lost: {err}");
            }
        });
    }
}

fn build_routed<K: Debug + 'static>(
    acceptor: &Acceptor,
    factory: &dyn RoutedPipelineFactory<K>,
    transport: Transport,
    key: &K,
    leftover: Bytes,
) {
    match factory.new_pipeline(transport, key) {
        Ok(pipeline) => {
            pipeline.transport_active();
            if !leftover.is_empty() {
                pipeline.read(leftover);
            }
            acceptor.add_connection(pipeline);
        }
        Err(err) => {
            warn_throttled!(THROTTLE, "routed pipeline build failed for {key:?}: {err}");
        }
    }
}

impl<P: RoutingDataParser> InboundHandler<AcceptEvent> for AcceptRoutingHandler<P> {
    fn transport_active(&mut self, _ctx: &HandlerCtx<AcceptEvent>) {}

    fn read(&mut self, _ctx: &HandlerCtx<AcceptEvent>, event: AcceptEvent) {
        match event {
            AcceptEvent::NewConnection(transport) => self.route(transport),
            AcceptEvent::Error(err) => {
                warn_throttled!(THROTTLE, "accept error on routing pipeline: {err}");
            }
            _ => {}
        }
    }

    fn read_eof(&mut self, _ctx: &HandlerCtx<AcceptEvent>) {}

    fn read_exception(&mut self, _ctx: &HandlerCtx<AcceptEvent>, err: AcceptorError) {
        warn_throttled!(THROTTLE, "routing pipeline error: {err}");
    }
}

/// Accept-pipeline factory installing [`AcceptRoutingHandler`] as the
/// terminal. Use together with a bootstrap that has no child factory, so the
/// routing handler owns every accepted transport.
pub struct RoutingAcceptPipelineFactory<P: RoutingDataParser> {
    parser: Arc<P>,
    factory: Arc<dyn RoutedPipelineFactory<P::Key>>,
    pool: Arc<ServerWorkerPool>,
}

impl<P: RoutingDataParser> RoutingAcceptPipelineFactory<P> {
    pub fn new(
        parser: Arc<P>,
        factory: Arc<dyn RoutedPipelineFactory<P::Key>>,
        pool: Arc<ServerWorkerPool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            parser,
            factory,
            pool,
        })
    }
}

impl<P: RoutingDataParser> AcceptPipelineFactory for RoutingAcceptPipelineFactory<P> {
    fn new_pipeline(&self, _acceptor: &Acceptor) -> Pipeline<AcceptEvent> {
        let pipeline = Pipeline::new();
        pipeline.add(AcceptRoutingHandler::new(
            self.parser.clone(),
            self.factory.clone(),
            self.pool.clone(),
        ));
        pipeline
    }
}

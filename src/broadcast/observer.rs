use crate::broadcast::pool::PoolCore;
use crate::broadcast::{
    BroadcastHandler, BroadcastPipelineFactory, BroadcastPool, RoutingKey, ServerPool, Subscriber,
};
use crate::error::AcceptorError;
use crate::pipeline::{
    ChunkDecoder, HandlerCtx, InboundHandler, PassthroughEncoder, Pipeline, PipelineWriter,
};
use crate::reactor::ReactorContext;
use crate::server::RoutedPipelineFactory;
use crate::transport::Transport;
use crate::warn_throttled;
use bytes::{Bytes, BytesMut};
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::codec::Encoder;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

const THROTTLE: Duration = Duration::from_secs(1);

type MakeEncoder<T> =
    Arc<dyn Fn() -> Box<dyn Encoder<T, Error = anyhow::Error> + 'static> + Send + Sync>;

/// Vends downstream pipelines whose terminal subscribes to a broadcast, and
/// owns one [`BroadcastPool`] per (factory instance × reactor thread).
///
/// Distinct instances on the same thread keep independent pools, so their
/// upstreams never alias.
pub struct ObservingPipelineFactory<T: 'static, K: RoutingKey> {
    server_pool: Arc<dyn ServerPool<K>>,
    broadcast_factory: Arc<dyn BroadcastPipelineFactory<T, K>>,
    make_encoder: MakeEncoder<T>,
    instance: u64,
}

impl<T: Clone + 'static, K: RoutingKey> ObservingPipelineFactory<T, K> {
    pub fn new(
        server_pool: Arc<dyn ServerPool<K>>,
        broadcast_factory: Arc<dyn BroadcastPipelineFactory<T, K>>,
        make_encoder: MakeEncoder<T>,
    ) -> Arc<Self> {
        Arc::new(Self {
            server_pool,
            broadcast_factory,
            make_encoder,
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
        })
    }

    /// The broadcast pool partition for this instance on the current
    /// reactor, created on first use.
    pub fn local_pool(&self) -> BroadcastPool<T, K> {
        let cx = ReactorContext::current();
        let server_pool = self.server_pool.clone();
        let factory = self.broadcast_factory.clone();
        let core = cx.local_or_init::<PoolCore<T, K>>(self.instance, move || {
            Rc::new(PoolCore::new(server_pool, factory))
        });
        BroadcastPool::from_core(core)
    }

    /// Build a downstream pipeline whose terminal observes `key`.
    pub fn new_pipeline(
        self: &Arc<Self>,
        transport: Transport,
        key: &K,
    ) -> anyhow::Result<Pipeline<Bytes>> {
        let pipeline = Pipeline::new();
        pipeline.add(ObservingHandler::new(key.clone(), self.clone()));
        pipeline.finalize();
        pipeline.attach_transport(transport, ChunkDecoder);
        Ok(pipeline)
    }
}

impl<K: RoutingKey> ObservingPipelineFactory<Bytes, K> {
    /// Raw byte fan-out: upstream values reach downstream sockets unchanged.
    pub fn bytes(
        server_pool: Arc<dyn ServerPool<K>>,
        broadcast_factory: Arc<dyn BroadcastPipelineFactory<Bytes, K>>,
    ) -> Arc<Self> {
        Self::new(
            server_pool,
            broadcast_factory,
            Arc::new(|| Box::new(PassthroughEncoder)),
        )
    }
}

impl<T, K> RoutedPipelineFactory<K> for Arc<ObservingPipelineFactory<T, K>>
where
    T: Clone + 'static,
    K: RoutingKey + Send + Sync,
{
    fn new_pipeline(&self, transport: Transport, key: &K) -> anyhow::Result<Pipeline<Bytes>> {
        ObservingPipelineFactory::new_pipeline(self, transport, key)
    }
}

/// Terminal of a downstream pipeline: resolves the broadcast handler for its
/// routing key from the reactor-local pool, subscribes, and relays fanned-out
/// values into its own transport. Downstream EOF/error unsubscribes, which
/// may evict the broadcast when it was the last subscriber.
pub struct ObservingHandler<T: Clone + 'static, K: RoutingKey> {
    key: K,
    factory: Arc<ObservingPipelineFactory<T, K>>,
    encoder: Box<dyn Encoder<T, Error = anyhow::Error>>,
    pipeline: Option<Pipeline<Bytes>>,
    writer: Option<PipelineWriter>,
    upstream: Option<(Rc<BroadcastHandler<T>>, u64)>,
    closed: bool,
}

impl<T: Clone + 'static, K: RoutingKey> ObservingHandler<T, K> {
    pub fn new(key: K, factory: Arc<ObservingPipelineFactory<T, K>>) -> Self {
        let encoder = (factory.make_encoder)();
        Self {
            key,
            factory,
            encoder,
            pipeline: None,
            writer: None,
            upstream: None,
            closed: false,
        }
    }

    /// Encode one upstream value into the downstream socket.
    fn relay(&mut self, value: &T) {
        if self.closed {
            return;
        }
        let mut buf = BytesMut::new();
        if let Err(err) = self.encoder.encode(value.clone(), &mut buf) {
            warn_throttled!(THROTTLE, "fan-out encode failed: {err}");
            self.abort_relay();
            return;
        }
        let delivered = self.writer.as_ref().is_some_and(|w| w.write(buf.freeze()));
        if !delivered {
            self.abort_relay();
        }
    }

    /// Upstream finished cleanly or with an error: close downstream.
    fn upstream_finished(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.upstream = None;
        self.writer = None;
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.close();
        }
    }

    /// Local failure: leave the broadcast (possibly evicting it) and close.
    fn abort_relay(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some((handler, id)) = self.upstream.take() {
            handler.unsubscribe(id);
        }
        self.writer = None;
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.close();
        }
    }
}

impl<T: Clone + 'static, K: RoutingKey> InboundHandler<Bytes> for ObservingHandler<T, K> {
    fn transport_active(&mut self, ctx: &HandlerCtx<Bytes>) {
        self.pipeline = Some(ctx.pipeline().clone());
        self.writer = ctx.pipeline().writer();

        let Some(me) = ctx.pipeline().handler::<Self>() else {
            return;
        };
        let pool = self.factory.local_pool();
        let fut = pool.get_handler(&self.key);
        let pipeline = ctx.pipeline().clone();
        let weak_me = Rc::downgrade(&me);

        tokio::task::spawn_local(async move {
            match fut.await {
                Ok(handler) => {
                    let Some(me) = weak_me.upgrade() else { return };
                    if me.borrow().closed {
                        return;
                    }
                    let subscriber: Rc<dyn Subscriber<T>> = Rc::new(Relay {
                        target: weak_me.clone(),
                    });
                    // an already-finished broadcast completes us inline here
                    let id = handler.subscribe(subscriber);
                    if !me.borrow().closed {
                        me.borrow_mut().upstream = Some((handler, id));
                    }
                }
                Err(err) => {
                    warn_throttled!(THROTTLE, "broadcast resolution failed: {err}");
                    pipeline.close();
                }
            }
        });
    }

    fn read(&mut self, _ctx: &HandlerCtx<Bytes>, _msg: Bytes) {
        // downstream input is not part of the fan-out contract
    }

    fn read_eof(&mut self, ctx: &HandlerCtx<Bytes>) {
        self.abort_relay();
        ctx.close();
    }

    fn read_exception(&mut self, ctx: &HandlerCtx<Bytes>, err: AcceptorError) {
        warn_throttled!(THROTTLE, "observer transport error: {err}");
        self.abort_relay();
        ctx.close();
    }
}

impl<T: Clone + 'static, K: RoutingKey> Drop for ObservingHandler<T, K> {
    fn drop(&mut self) {
        if let Some((handler, id)) = self.upstream.take() {
            handler.unsubscribe(id);
        }
    }
}

/// `Subscriber` shim: the broadcast handler holds this, the observing
/// handler stays reachable only weakly so downstream teardown is never kept
/// alive by the upstream.
struct Relay<T: Clone + 'static, K: RoutingKey> {
    target: Weak<RefCell<ObservingHandler<T, K>>>,
}

impl<T: Clone + 'static, K: RoutingKey> Subscriber<T> for Relay<T, K> {
    fn on_next(&self, value: &T) {
        if let Some(cell) = self.target.upgrade() {
            cell.borrow_mut().relay(value);
        }
    }

    fn on_error(&self, err: &AcceptorError) {
        warn_throttled!(THROTTLE, "upstream broadcast failed: {err}");
        if let Some(cell) = self.target.upgrade() {
            cell.borrow_mut().upstream_finished();
        }
    }

    fn on_completed(&self) {
        if let Some(cell) = self.target.upgrade() {
            cell.borrow_mut().upstream_finished();
        }
    }
}

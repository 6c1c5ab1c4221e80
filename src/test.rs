#[cfg(test)]
mod tests {
    use crate::acceptor::{Acceptor, DefaultAcceptPipelineFactory, SslStatsSink};
    use crate::broadcast::{
        BroadcastHandler, BroadcastPipelineFactory, BroadcastPool, BroadcastStage,
        ObservingPipelineFactory, ServerPool, StaticServerPool, Subscriber,
    };
    use crate::config::ServerConfig;
    use crate::error::{AcceptorError, AcceptorResult};
    use crate::pipeline::{
        ChunkDecoder, HandlerCtx, InboundHandler, Pipeline, PipelineFactory,
    };
    use crate::reactor::{ContextGuard, EventLoop, ReactorContext, ReactorHandle, ReactorId};
    use crate::server::{
        RoutedPipelineFactory, RoutingAcceptPipelineFactory, RoutingDataParser, ServerBootstrap,
    };
    use crate::transport::Transport;
    use crate::utils::{CancelToken, HealthFlag};
    use bytes::{Bytes, BytesMut};
    use std::cell::{Cell, RefCell};
    use std::io::{Read, Write};
    use std::net::SocketAddr;
    use std::rc::Rc;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::time::{Duration, Instant};

    // ---- local reactor harness ----

    struct LoopHarness {
        el: EventLoop,
        _guard: ContextGuard,
    }

    fn local_reactor() -> LoopHarness {
        let (el, tx) = EventLoop::new(Duration::from_micros(200)).expect("event loop");
        let id = ReactorId::new();
        let handle = ReactorHandle::new(id, tx, CancelToken::root(), HealthFlag::new(true));
        let guard = ReactorContext::install(ReactorContext::new(id, handle));
        LoopHarness { el, _guard: guard }
    }

    impl LoopHarness {
        fn enter<R>(&mut self, f: impl FnOnce() -> R) -> R {
            self.el.enter(f)
        }

        fn tick(&mut self) {
            self.el.tick();
        }

        /// Tick until `pred` holds or the deadline runs out.
        fn settle_until(&mut self, deadline: Duration, mut pred: impl FnMut() -> bool) -> bool {
            let start = Instant::now();
            while start.elapsed() < deadline {
                self.tick();
                if pred() {
                    return true;
                }
            }
            false
        }
    }

    const SETTLE: Duration = Duration::from_secs(3);

    // ---- loopback servers ----

    struct SinkHandler;

    impl InboundHandler<Bytes> for SinkHandler {
        fn read(&mut self, _ctx: &HandlerCtx<Bytes>, _msg: Bytes) {}

        fn read_eof(&mut self, ctx: &HandlerCtx<Bytes>) {
            ctx.close();
        }

        fn read_exception(&mut self, ctx: &HandlerCtx<Bytes>, _err: AcceptorError) {
            ctx.close();
        }
    }

    struct SinkFactory;

    impl PipelineFactory for SinkFactory {
        fn new_pipeline(&self, transport: Transport) -> anyhow::Result<Pipeline<Bytes>> {
            let pipeline = Pipeline::new();
            pipeline.add(SinkHandler);
            pipeline.finalize();
            pipeline.attach_transport(transport, ChunkDecoder);
            Ok(pipeline)
        }
    }

    struct EchoHandler;

    impl InboundHandler<Bytes> for EchoHandler {
        fn read(&mut self, ctx: &HandlerCtx<Bytes>, msg: Bytes) {
            ctx.write(msg);
        }
    }

    struct EchoFactory;

    impl PipelineFactory for EchoFactory {
        fn new_pipeline(&self, transport: Transport) -> anyhow::Result<Pipeline<Bytes>> {
            let pipeline = Pipeline::new();
            pipeline.add(EchoHandler);
            pipeline.finalize();
            pipeline.attach_transport(transport, ChunkDecoder);
            Ok(pipeline)
        }
    }

    fn server_config(threads: usize) -> ServerConfig {
        ServerConfig {
            io_threads: Some(threads),
            tick_us: Some(200),
            drain_timeout_ms: Some(200),
            ..Default::default()
        }
    }

    fn start_sink_server(threads: usize) -> (ServerBootstrap, SocketAddr) {
        let mut server =
            ServerBootstrap::new(server_config(threads)).child_pipeline(Arc::new(SinkFactory));
        let addr = server.bind("127.0.0.1:0".parse().unwrap()).expect("bind");
        server.start().expect("start");
        (server, addr)
    }

    // ---- broadcast test doubles ----

    #[derive(Default)]
    struct TestBroadcastFactory {
        routing_calls: AtomicU64,
        fail_routing: AtomicBool,
    }

    impl BroadcastPipelineFactory<Bytes, String> for TestBroadcastFactory {
        fn new_pipeline(&self, transport: Transport) -> anyhow::Result<Pipeline<Bytes>> {
            let pipeline = Pipeline::new();
            pipeline.add(BroadcastStage::new(BroadcastHandler::new()));
            pipeline.finalize();
            pipeline.attach_transport(transport, ChunkDecoder);
            Ok(pipeline)
        }

        fn set_routing_data(&self, _pipeline: &Pipeline<Bytes>, key: &String) -> anyhow::Result<()> {
            self.routing_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_routing.load(Ordering::SeqCst) {
                anyhow::bail!("routing data rejected for {key}");
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSubscriber {
        values: RefCell<Vec<Bytes>>,
        completed: Cell<u32>,
        errors: Cell<u32>,
    }

    impl Subscriber<Bytes> for RecordingSubscriber {
        fn on_next(&self, value: &Bytes) {
            self.values.borrow_mut().push(value.clone());
        }
        fn on_error(&self, _err: &AcceptorError) {
            self.errors.set(self.errors.get() + 1);
        }
        fn on_completed(&self) {
            self.completed.set(self.completed.get() + 1);
        }
    }

    type Resolved = Rc<RefCell<Option<AcceptorResult<Rc<BroadcastHandler<Bytes>>>>>>;

    /// Issue `get_handler` and capture the resolution; no subscription.
    fn request(h: &mut LoopHarness, pool: &BroadcastPool<Bytes, String>, key: &str) -> Resolved {
        let slot: Resolved = Rc::new(RefCell::new(None));
        let out = slot.clone();
        let key = key.to_string();
        let pool = pool.clone();
        h.enter(move || {
            let fut = pool.get_handler(&key);
            tokio::task::spawn_local(async move {
                *out.borrow_mut() = Some(fut.await);
            });
        });
        slot
    }

    /// Issue `get_handler` and subscribe `sub` as soon as it resolves, the
    /// way a live caller would.
    fn request_subscribed(
        h: &mut LoopHarness,
        pool: &BroadcastPool<Bytes, String>,
        key: &str,
        sub: Rc<RecordingSubscriber>,
    ) -> Resolved {
        let slot: Resolved = Rc::new(RefCell::new(None));
        let out = slot.clone();
        let key = key.to_string();
        let pool = pool.clone();
        h.enter(move || {
            let fut = pool.get_handler(&key);
            tokio::task::spawn_local(async move {
                let resolved = fut.await;
                if let Ok(handler) = &resolved {
                    handler.subscribe(sub);
                }
                *out.borrow_mut() = Some(resolved);
            });
        });
        slot
    }

    fn resolved_handler(slot: &Resolved) -> Rc<BroadcastHandler<Bytes>> {
        slot.borrow()
            .as_ref()
            .expect("future not resolved")
            .clone()
            .expect("resolved with error")
    }

    fn key(s: &str) -> String {
        s.to_string()
    }

    // ---- broadcast pool scenarios ----

    #[test]
    fn broadcast_basic_connect() {
        let (mut server, addr) = start_sink_server(1);
        let mut h = local_reactor();

        let factory = Arc::new(TestBroadcastFactory::default());
        let server_pool = Arc::new(StaticServerPool::<String>::new());
        server_pool.set_default(addr);
        let pool = BroadcastPool::new(server_pool.clone(), factory.clone());

        assert!(!pool.is_broadcasting(&key("url1")));

        let sub = Rc::new(RecordingSubscriber::default());
        let got = request_subscribed(&mut h, &pool, "url1", sub.clone());
        assert!(got.borrow().is_none());
        assert!(pool.is_broadcasting(&key("url1")));

        assert!(h.settle_until(SETTLE, || got.borrow().is_some()));
        let handler = resolved_handler(&got);
        assert_eq!(factory.routing_calls.load(Ordering::SeqCst), 1);
        assert!(pool.is_broadcasting(&key("url1")));

        // a second lookup reuses the live broadcast, no new connect
        let again = request(&mut h, &pool, "url1");
        assert!(h.settle_until(SETTLE, || again.borrow().is_some()));
        assert!(Rc::ptr_eq(&handler, &resolved_handler(&again)));
        assert_eq!(factory.routing_calls.load(Ordering::SeqCst), 1);

        // upstream EOF tears the broadcast down
        let pipeline = pool.ready_pipeline(&key("url1")).expect("ready pipeline");
        h.enter(|| pipeline.read_eof());
        assert!(!pool.is_broadcasting(&key("url1")));
        assert!(pipeline.is_closed());
        assert_eq!(sub.completed.get(), 1);
        assert_eq!(sub.errors.get(), 0);

        // the key reconnects afterwards
        let sub2 = Rc::new(RecordingSubscriber::default());
        let reconnected = request_subscribed(&mut h, &pool, "url1", sub2);
        assert!(h.settle_until(SETTLE, || reconnected.borrow().is_some()));
        assert!(reconnected.borrow().as_ref().unwrap().is_ok());
        assert_eq!(factory.routing_calls.load(Ordering::SeqCst), 2);
        assert!(pool.is_broadcasting(&key("url1")));

        // a different key gets its own broadcast
        let sub3 = Rc::new(RecordingSubscriber::default());
        let other = request_subscribed(&mut h, &pool, "url2", sub3);
        assert!(h.settle_until(SETTLE, || other.borrow().is_some()));
        assert!(!Rc::ptr_eq(&resolved_handler(&reconnected), &resolved_handler(&other)));
        assert_eq!(factory.routing_calls.load(Ordering::SeqCst), 3);

        server.stop();
    }

    #[test]
    fn broadcast_outstanding_connect_coalesces() {
        let (mut server, addr) = start_sink_server(1);
        let mut h = local_reactor();

        let factory = Arc::new(TestBroadcastFactory::default());
        let server_pool = Arc::new(StaticServerPool::<String>::new());
        server_pool.set_default(addr);
        let pool = BroadcastPool::new(server_pool, factory.clone());

        let sub_a = Rc::new(RecordingSubscriber::default());
        let sub_b = Rc::new(RecordingSubscriber::default());
        let first = request_subscribed(&mut h, &pool, "url1", sub_a);
        assert!(pool.is_broadcasting(&key("url1")));
        let second = request_subscribed(&mut h, &pool, "url1", sub_b);
        assert!(first.borrow().is_none());
        assert!(second.borrow().is_none());

        assert!(h.settle_until(SETTLE, || {
            first.borrow().is_some() && second.borrow().is_some()
        }));

        // one connect, one handler, FIFO both fulfilled
        assert_eq!(factory.routing_calls.load(Ordering::SeqCst), 1);
        assert!(Rc::ptr_eq(
            &resolved_handler(&first),
            &resolved_handler(&second)
        ));
        assert!(pool.is_broadcasting(&key("url1")));

        server.stop();
    }

    #[test]
    fn broadcast_connect_error_fails_all_waiters() {
        let (mut server, addr) = start_sink_server(1);
        // stop the upstream so connects are refused
        server.stop();

        let mut h = local_reactor();
        let factory = Arc::new(TestBroadcastFactory::default());
        let server_pool = Arc::new(StaticServerPool::<String>::new());
        server_pool.set_default(addr);
        let pool = BroadcastPool::new(server_pool, factory.clone());

        let first = request(&mut h, &pool, "url1");
        let second = request(&mut h, &pool, "url1");
        assert!(pool.is_broadcasting(&key("url1")));

        assert!(h.settle_until(SETTLE, || {
            first.borrow().is_some() && second.borrow().is_some()
        }));
        assert!(first.borrow().as_ref().unwrap().is_err());
        assert!(second.borrow().as_ref().unwrap().is_err());
        assert!(!pool.is_broadcasting(&key("url1")));
        assert_eq!(factory.routing_calls.load(Ordering::SeqCst), 0);

        // bring the upstream back on the same address; the key recovers
        let mut revived =
            ServerBootstrap::new(server_config(1)).child_pipeline(Arc::new(SinkFactory));
        revived.bind(addr).expect("rebind");
        revived.start().expect("restart");

        let sub = Rc::new(RecordingSubscriber::default());
        let third = request_subscribed(&mut h, &pool, "url1", sub);
        assert!(h.settle_until(SETTLE, || third.borrow().is_some()));
        assert!(third.borrow().as_ref().unwrap().is_ok());
        assert!(pool.is_broadcasting(&key("url1")));

        revived.stop();
    }

    #[test]
    fn broadcast_server_pool_sync_failure() {
        let mut h = local_reactor();
        let factory = Arc::new(TestBroadcastFactory::default());
        let server_pool = Arc::new(StaticServerPool::<String>::new());
        server_pool.fail_connect(true);
        let pool = BroadcastPool::new(server_pool, factory);

        let got = request(&mut h, &pool, "url1");
        // the entry is gone before the error callback ever runs
        assert!(!pool.is_broadcasting(&key("url1")));

        assert!(h.settle_until(SETTLE, || got.borrow().is_some()));
        match got.borrow().as_ref().unwrap() {
            Err(AcceptorError::ConnectFailed(_)) => {}
            other => panic!("expected ConnectFailed, got {other:?}"),
        }
    }

    #[test]
    fn broadcast_routing_data_failure() {
        let (mut server, addr) = start_sink_server(1);
        let mut h = local_reactor();

        let factory = Arc::new(TestBroadcastFactory::default());
        factory.fail_routing.store(true, Ordering::SeqCst);
        let server_pool = Arc::new(StaticServerPool::<String>::new());
        server_pool.set_default(addr);
        let pool = BroadcastPool::new(server_pool, factory.clone());

        let got = request(&mut h, &pool, "url");
        assert!(h.settle_until(SETTLE, || got.borrow().is_some()));
        match got.borrow().as_ref().unwrap() {
            Err(AcceptorError::RoutingDataFailed(_)) => {}
            other => panic!("expected RoutingDataFailed, got {other:?}"),
        }
        assert!(!pool.is_broadcasting(&key("url")));
        assert_eq!(factory.routing_calls.load(Ordering::SeqCst), 1);

        // the dead upstream pipeline was closed, so the sink server drains
        // back to zero connections
        let worker_pool = server.pool();
        let deadline = Instant::now() + SETTLE;
        while worker_pool.active_connections() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(worker_pool.active_connections(), 0);

        server.stop();
    }

    #[test]
    fn broadcast_orphan_sweep() {
        let (mut server, addr) = start_sink_server(1);
        let mut h = local_reactor();

        let factory = Arc::new(TestBroadcastFactory::default());
        let server_pool = Arc::new(StaticServerPool::<String>::new());
        server_pool.set_default(addr);
        let pool = BroadcastPool::new(server_pool, factory.clone());

        // nobody subscribes: the broadcast is reclaimed after fulfilment
        let first = request(&mut h, &pool, "url1");
        let second = request(&mut h, &pool, "url1");
        assert!(h.settle_until(SETTLE, || {
            first.borrow().is_some() && second.borrow().is_some()
        }));
        assert!(first.borrow().as_ref().unwrap().is_ok());
        assert!(second.borrow().as_ref().unwrap().is_ok());
        assert!(h.settle_until(SETTLE, || !pool.is_broadcasting(&key("url1"))));

        // one of two callers subscribes: the broadcast stays up until that
        // subscriber's upstream finishes
        let sub = Rc::new(RecordingSubscriber::default());
        let ghost = request(&mut h, &pool, "url1");
        let live = request_subscribed(&mut h, &pool, "url1", sub.clone());
        assert!(h.settle_until(SETTLE, || {
            ghost.borrow().is_some() && live.borrow().is_some()
        }));
        assert!(pool.is_broadcasting(&key("url1")));

        let pipeline = pool.ready_pipeline(&key("url1")).expect("ready pipeline");
        h.enter(|| pipeline.read_eof());
        assert!(!pool.is_broadcasting(&key("url1")));
        assert_eq!(sub.completed.get(), 1);

        server.stop();
    }

    #[test]
    fn broadcast_thread_and_instance_isolation() {
        let (mut server, addr) = start_sink_server(1);

        let broadcast_factory = Arc::new(TestBroadcastFactory::default());
        let server_pool = Arc::new(StaticServerPool::<String>::new());
        server_pool.set_default(addr);

        let factory1 = ObservingPipelineFactory::bytes(
            server_pool.clone() as Arc<dyn ServerPool<String>>,
            broadcast_factory.clone() as Arc<dyn BroadcastPipelineFactory<Bytes, String>>,
        );
        let factory2 = ObservingPipelineFactory::bytes(
            server_pool.clone() as Arc<dyn ServerPool<String>>,
            broadcast_factory.clone() as Arc<dyn BroadcastPipelineFactory<Bytes, String>>,
        );

        let mut h = local_reactor();
        let pool_a = h.enter(|| factory1.local_pool());
        assert!(!pool_a.is_broadcasting(&key("url")));

        let sub = Rc::new(RecordingSubscriber::default());
        let got = request_subscribed(&mut h, &pool_a, "url", sub);
        assert!(h.settle_until(SETTLE, || got.borrow().is_some()));
        let local_ptr = Rc::as_ptr(&resolved_handler(&got)) as usize;
        assert!(pool_a.is_broadcasting(&key("url")));

        // a second factory instance on the same thread is independent
        let pool_b = h.enter(|| factory2.local_pool());
        assert!(!pool_b.is_broadcasting(&key("url")));

        // another thread never shares an entry, even for the same key
        let (ptr_tx, ptr_rx) = crossbeam::channel::bounded(1);
        let factory1_remote = factory1.clone();
        let worker = std::thread::spawn(move || {
            let mut h = local_reactor();
            let pool = h.enter(|| factory1_remote.local_pool());
            assert!(!pool.is_broadcasting(&key("url")));

            let sub = Rc::new(RecordingSubscriber::default());
            let got = request_subscribed(&mut h, &pool, "url", sub);
            assert!(h.settle_until(SETTLE, || got.borrow().is_some()));
            let remote_ptr = Rc::as_ptr(&resolved_handler(&got)) as usize;
            ptr_tx.send(remote_ptr).unwrap();

            // tearing this thread's broadcast down is local
            let pipeline = pool.ready_pipeline(&key("url")).expect("ready pipeline");
            h.enter(|| pipeline.read_eof());
            assert!(!pool.is_broadcasting(&key("url")));
        });
        let remote_ptr = ptr_rx.recv_timeout(Duration::from_secs(10)).expect("worker");
        worker.join().expect("worker thread");

        assert_ne!(local_ptr, remote_ptr);
        // this thread's broadcast survived the other thread's teardown
        assert!(pool_a.is_broadcasting(&key("url")));

        let pipeline = pool_a.ready_pipeline(&key("url")).expect("ready pipeline");
        h.enter(|| pipeline.read_eof());
        assert!(!pool_a.is_broadcasting(&key("url")));

        server.stop();
    }

    // ---- acceptor / worker pool / bootstrap ----

    fn read_some(stream: &mut std::net::TcpStream, want: usize, deadline: Duration) -> Vec<u8> {
        stream
            .set_read_timeout(Some(Duration::from_millis(100)))
            .expect("read timeout");
        let start = Instant::now();
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        while out.len() < want && start.elapsed() < deadline {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => panic!("read failed: {e}"),
            }
        }
        out
    }

    #[test]
    fn echo_server_round_trip_and_worker_map() {
        let mut server =
            ServerBootstrap::new(server_config(2)).child_pipeline(Arc::new(EchoFactory));
        let addr = server.bind("127.0.0.1:0".parse().unwrap()).expect("bind");
        // the bind surface exposes the listener list for port discovery
        assert_eq!(
            server.sockets()[0].local_addr().expect("local addr"),
            addr
        );
        server.start().expect("start");

        // exactly one acceptor per live reactor thread
        let pool = server.pool();
        assert_eq!(pool.worker_count(), 2);
        let mut reactors = Vec::new();
        pool.for_each_worker(|w| reactors.push(w.reactor().id()));
        reactors.dedup();
        assert_eq!(reactors.len(), 2);

        let mut client = std::net::TcpStream::connect(addr).expect("connect");
        client.write_all(b"ping").expect("write");
        let echoed = read_some(&mut client, 4, Duration::from_secs(3));
        assert_eq!(&echoed, b"ping");

        drop(client);
        server.stop();
    }

    #[test]
    fn idle_timeout_closes_connection() {
        let mut cfg = server_config(1);
        cfg.idle_timeout_ms = Some(100);
        let mut server = ServerBootstrap::new(cfg).child_pipeline(Arc::new(EchoFactory));
        let addr = server.bind("127.0.0.1:0".parse().unwrap()).expect("bind");
        server.start().expect("start");

        let mut client = std::net::TcpStream::connect(addr).expect("connect");
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("timeout");
        // no traffic: the acceptor raises TimedOut and the pipeline closes
        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).expect("read");
        assert_eq!(n, 0, "expected EOF from idle timeout");

        server.stop();
    }

    #[test]
    fn acceptor_without_listeners_tracks_synthetic_connections() {
        // an acceptor built with no listener is legal: injected connections
        // are registered and reclaimed exactly like accepted ones
        let mut h = local_reactor();
        let acceptor = h.enter(|| {
            let acceptor =
                Acceptor::new(Arc::new(server_config(1)), Some(Arc::new(SinkFactory)), None);
            acceptor.init(&DefaultAcceptPipelineFactory);
            acceptor
        });

        let pipeline = h.enter(|| {
            let pipeline = Pipeline::<Bytes>::new();
            pipeline.add(SinkHandler);
            pipeline.finalize();
            pipeline.transport_active();
            let conn = acceptor.add_connection(pipeline.clone());
            assert!(!conn.is_busy());
            pipeline
        });
        assert_eq!(acceptor.connection_count(), 1);

        h.enter(|| pipeline.close());
        // still tracked until the end-of-tick sweep runs
        let acceptor2 = acceptor.clone();
        assert!(h.settle_until(SETTLE, move || acceptor2.connection_count() == 0));

        let stats = acceptor.stats();
        let snap = stats.load();
        assert_eq!(snap.connections_added.load(Ordering::Relaxed), 1);
        assert_eq!(snap.connections_removed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn ssl_errors_reach_pipeline_and_sink() {
        #[derive(Default)]
        struct CountingSink {
            errors: AtomicU64,
        }
        impl SslStatsSink for CountingSink {
            fn record_error(&self, _err: &AcceptorError) {
                self.errors.fetch_add(1, Ordering::SeqCst);
            }
        }

        let sink = Arc::new(CountingSink::default());
        let mut h = local_reactor();
        let sink2 = sink.clone();
        h.enter(move || {
            let acceptor = Acceptor::new(
                Arc::new(server_config(1)),
                Some(Arc::new(SinkFactory)),
                Some(sink2),
            );
            acceptor.init(&DefaultAcceptPipelineFactory);
            acceptor.ssl_connection_error(AcceptorError::internal("handshake rejected"));
            acceptor.ssl_connection_error(AcceptorError::internal("again"));
        });
        // the sink sees the default handling once per error, and the
        // terminal handler records each of them too
        assert!(sink.errors.load(Ordering::SeqCst) >= 2);
    }

    // ---- accept routing ----

    struct LineKeyParser;

    impl RoutingDataParser for LineKeyParser {
        type Key = String;

        fn parse(&self, buf: &mut BytesMut) -> anyhow::Result<Option<String>> {
            let Some(pos) = buf.iter().position(|b| *b == b'\n') else {
                return Ok(None);
            };
            let line = buf.split_to(pos + 1);
            let key = std::str::from_utf8(&line[..pos])?.trim().to_string();
            if key.is_empty() {
                anyhow::bail!("empty routing key");
            }
            Ok(Some(key))
        }
    }

    struct KeyEchoFactory;

    impl RoutedPipelineFactory<String> for KeyEchoFactory {
        fn new_pipeline(&self, transport: Transport, key: &String) -> anyhow::Result<Pipeline<Bytes>> {
            let pipeline = Pipeline::new();
            pipeline.add(EchoHandler);
            pipeline.finalize();
            pipeline.attach_transport(transport, ChunkDecoder);
            pipeline.write(Bytes::from(format!("key:{key}\n")));
            Ok(pipeline)
        }
    }

    #[test]
    fn accept_routing_hands_connections_to_workers() {
        let server = ServerBootstrap::new(server_config(2));
        let worker_pool = server.pool();
        let accept_factory = RoutingAcceptPipelineFactory::new(
            Arc::new(LineKeyParser),
            Arc::new(KeyEchoFactory),
            worker_pool,
        );
        let mut server = server.accept_pipeline(accept_factory);
        let addr = server.bind("127.0.0.1:0".parse().unwrap()).expect("bind");
        server.start().expect("start");

        let mut client = std::net::TcpStream::connect(addr).expect("connect");
        // key and payload arrive together; the payload must be replayed into
        // the routed pipeline
        client.write_all(b"alpha\nhello").expect("write");
        let got = read_some(&mut client, b"key:alpha\nhello".len(), Duration::from_secs(3));
        assert_eq!(&got, b"key:alpha\nhello");

        drop(client);
        server.stop();
    }

    #[test]
    fn datagrams_reach_a_custom_accept_terminal() {
        use crate::acceptor::{AcceptEvent, AcceptPipelineFactory};

        struct DatagramCounter {
            seen: Arc<AtomicU64>,
        }

        impl InboundHandler<AcceptEvent> for DatagramCounter {
            fn transport_active(&mut self, _ctx: &HandlerCtx<AcceptEvent>) {}

            fn read(&mut self, _ctx: &HandlerCtx<AcceptEvent>, event: AcceptEvent) {
                if let AcceptEvent::Datagram(datagram) = event {
                    assert!(!datagram.buf.is_empty());
                    self.seen.fetch_add(1, Ordering::SeqCst);
                }
            }

            fn read_eof(&mut self, _ctx: &HandlerCtx<AcceptEvent>) {}

            fn read_exception(&mut self, _ctx: &HandlerCtx<AcceptEvent>, _err: AcceptorError) {}
        }

        struct CountingAcceptFactory {
            seen: Arc<AtomicU64>,
        }

        impl AcceptPipelineFactory for CountingAcceptFactory {
            fn new_pipeline(&self, _acceptor: &Acceptor) -> Pipeline<AcceptEvent> {
                let pipeline = Pipeline::new();
                pipeline.add(DatagramCounter {
                    seen: self.seen.clone(),
                });
                pipeline
            }
        }

        let seen = Arc::new(AtomicU64::new(0));
        let mut server = ServerBootstrap::new(server_config(1))
            .accept_pipeline(Arc::new(CountingAcceptFactory { seen: seen.clone() }));
        let udp_addr = server.bind_udp("127.0.0.1:0".parse().unwrap()).expect("bind udp");
        server.start().expect("start");

        let client = std::net::UdpSocket::bind("127.0.0.1:0").expect("client socket");
        let deadline = Instant::now() + SETTLE;
        while seen.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            client.send_to(b"probe", udp_addr).expect("send");
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(seen.load(Ordering::SeqCst) > 0);

        server.stop();
    }

    // ---- observing fan-out, end to end ----

    struct TickerHandler;

    impl InboundHandler<Bytes> for TickerHandler {
        fn transport_active(&mut self, ctx: &HandlerCtx<Bytes>) {
            let Some(writer) = ctx.pipeline().writer() else {
                return;
            };
            tokio::task::spawn_local(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    if !writer.write(Bytes::from_static(b"tick\n")) {
                        break;
                    }
                }
            });
        }

        fn read(&mut self, _ctx: &HandlerCtx<Bytes>, _msg: Bytes) {}
    }

    struct TickerFactory;

    impl PipelineFactory for TickerFactory {
        fn new_pipeline(&self, transport: Transport) -> anyhow::Result<Pipeline<Bytes>> {
            let pipeline = Pipeline::new();
            pipeline.add(TickerHandler);
            pipeline.finalize();
            pipeline.attach_transport(transport, ChunkDecoder);
            Ok(pipeline)
        }
    }

    #[test]
    fn observing_server_fans_one_upstream_out() {
        // upstream: produces "tick\n" lines on every accepted connection
        let mut upstream =
            ServerBootstrap::new(server_config(1)).child_pipeline(Arc::new(TickerFactory));
        let upstream_addr = upstream.bind("127.0.0.1:0".parse().unwrap()).expect("bind");
        upstream.start().expect("start upstream");

        // relay: routes downstream clients by their first line, observing
        // one shared upstream per key
        let broadcast_factory = Arc::new(TestBroadcastFactory::default());
        let server_pool = Arc::new(StaticServerPool::<String>::new());
        server_pool.set_default(upstream_addr);
        let observing = ObservingPipelineFactory::bytes(
            server_pool as Arc<dyn ServerPool<String>>,
            broadcast_factory.clone() as Arc<dyn BroadcastPipelineFactory<Bytes, String>>,
        );

        let relay = ServerBootstrap::new(server_config(2));
        let accept_factory = RoutingAcceptPipelineFactory::new(
            Arc::new(LineKeyParser),
            Arc::new(observing.clone()),
            relay.pool(),
        );
        let mut relay = relay.accept_pipeline(accept_factory);
        let relay_addr = relay.bind("127.0.0.1:0".parse().unwrap()).expect("bind");
        relay.start().expect("start relay");

        // two clients on the same key share one upstream connection
        let mut client_a = std::net::TcpStream::connect(relay_addr).expect("connect a");
        client_a.write_all(b"feed\n").expect("hello a");
        let mut client_b = std::net::TcpStream::connect(relay_addr).expect("connect b");
        client_b.write_all(b"feed\n").expect("hello b");

        let got_a = read_some(&mut client_a, 5, Duration::from_secs(5));
        let got_b = read_some(&mut client_b, 5, Duration::from_secs(5));
        assert!(got_a.starts_with(b"tick\n"), "client a got {got_a:?}");
        assert!(got_b.starts_with(b"tick\n"), "client b got {got_b:?}");

        // same key, same accept-routing hash, same worker: one upstream
        assert_eq!(broadcast_factory.routing_calls.load(Ordering::SeqCst), 1);

        drop(client_a);
        drop(client_b);
        relay.stop();
        upstream.stop();
    }
}

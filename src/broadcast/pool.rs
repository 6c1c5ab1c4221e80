use crate::broadcast::{BroadcastHandler, BroadcastStage, EntryCtrl, ServerPool};
use crate::error::{AcceptorError, AcceptorResult};
use crate::pipeline::{Pipeline, PipelineId, PipelineManager};
use crate::transport::Transport;
use ahash::AHashMap;
use std::cell::RefCell;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Application-level identifier selecting an upstream.
pub trait RoutingKey: Clone + Eq + Hash + Debug + 'static {}
impl<K: Clone + Eq + Hash + Debug + 'static> RoutingKey for K {}

/// Builds and wires the upstream pipeline for one broadcast.
pub trait BroadcastPipelineFactory<T: 'static, K>: Send + Sync + 'static {
    /// Build the pipeline over a freshly connected transport. The chain must
    /// contain a [`BroadcastStage`] and be finalized with the transport
    /// attached; `transport_active` is fired by the pool.
    fn new_pipeline(&self, transport: Transport) -> anyhow::Result<Pipeline<T>>;

    /// Push routing identity into the pipeline. Fallible by contract: a
    /// rejection fails every queued waiter and tears the pipeline down.
    fn set_routing_data(&self, pipeline: &Pipeline<T>, key: &K) -> anyhow::Result<()>;

    /// Locate the broadcast stage. Infallible after a successful build.
    fn get_broadcast_handler(&self, pipeline: &Pipeline<T>) -> Rc<BroadcastHandler<T>> {
        pipeline
            .handler::<BroadcastStage<T>>()
            .expect("broadcast pipeline has no BroadcastStage")
            .borrow()
            .handler()
    }
}

type Waiter<T> = oneshot::Sender<AcceptorResult<Rc<BroadcastHandler<T>>>>;

enum Entry<T: 'static, K: RoutingKey> {
    /// Connect in flight; waiters are fulfilled FIFO on resolution.
    Connecting { waiters: Vec<Waiter<T>> },
    /// Live upstream. The guard is both the handler's control seam and the
    /// pipeline's manager.
    Ready {
        pipeline: Pipeline<T>,
        handler: Rc<BroadcastHandler<T>>,
        #[allow(dead_code)]
        guard: Rc<EntryGuard<T, K>>,
    },
}

/// Resolves exactly once, with the broadcast handler or an error.
pub struct HandlerFuture<T: 'static> {
    rx: oneshot::Receiver<AcceptorResult<Rc<BroadcastHandler<T>>>>,
}

impl<T: 'static> Future for HandlerFuture<T> {
    type Output = AcceptorResult<Rc<BroadcastHandler<T>>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|res| match res {
            Ok(inner) => inner,
            Err(_) => Err(AcceptorError::internal("broadcast pool went away")),
        })
    }
}

pub(crate) struct PoolCore<T: 'static, K: RoutingKey> {
    server_pool: Arc<dyn ServerPool<K>>,
    factory: Arc<dyn BroadcastPipelineFactory<T, K>>,
    entries: RefCell<AHashMap<K, Entry<T, K>>>,
}

/// Reactor-local map from routing key to a connect-or-reuse entry.
///
/// One instance exists per (observing factory instance × reactor thread);
/// every mutation runs on the owning reactor, so waiter-list appends and
/// state transitions are serialized without locks. Two threads never share
/// an entry, even for the same key.
pub struct BroadcastPool<T: 'static, K: RoutingKey> {
    core: Rc<PoolCore<T, K>>,
}

impl<T: 'static, K: RoutingKey> Clone for BroadcastPool<T, K> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T: 'static, K: RoutingKey> BroadcastPool<T, K> {
    pub fn new(
        server_pool: Arc<dyn ServerPool<K>>,
        factory: Arc<dyn BroadcastPipelineFactory<T, K>>,
    ) -> Self {
        Self {
            core: Rc::new(PoolCore::new(server_pool, factory)),
        }
    }

    pub(crate) fn from_core(core: Rc<PoolCore<T, K>>) -> Self {
        Self { core }
    }

    /// True iff an entry for `key` is Connecting or Ready on this thread.
    pub fn is_broadcasting(&self, key: &K) -> bool {
        self.core.entries.borrow().contains_key(key)
    }

    pub fn broadcast_count(&self) -> usize {
        self.core.entries.borrow().len()
    }

    #[cfg(test)]
    pub(crate) fn ready_pipeline(&self, key: &K) -> Option<Pipeline<T>> {
        match self.core.entries.borrow().get(key) {
            Some(Entry::Ready { pipeline, .. }) => Some(pipeline.clone()),
            _ => None,
        }
    }

    /// Resolve the broadcast handler for `key`, connecting on a miss and
    /// coalescing with an in-flight connect on a near miss. Must run inside
    /// the owning reactor's task context.
    ///
    /// The connect proceeds even if the returned future is dropped; the
    /// post-fulfilment sweep reclaims an upstream nobody subscribed to.
    pub fn get_handler(&self, key: &K) -> HandlerFuture<T> {
        let (tx, rx) = oneshot::channel();
        let fut = HandlerFuture { rx };

        let mut entries = self.core.entries.borrow_mut();
        match entries.get_mut(key) {
            Some(Entry::Ready { handler, .. }) => {
                let _ = tx.send(Ok(handler.clone()));
            }
            Some(Entry::Connecting { waiters }) => {
                waiters.push(tx);
            }
            None => {
                entries.insert(key.clone(), Entry::Connecting { waiters: vec![tx] });
                drop(entries);

                match self.core.server_pool.connect(key) {
                    Ok(connect) => {
                        let core = Rc::downgrade(&self.core);
                        let key = key.clone();
                        tokio::task::spawn_local(async move {
                            let result = connect.await;
                            if let Some(core) = core.upgrade() {
                                PoolCore::on_connect_done(&core, key, result);
                            }
                        });
                    }
                    Err(err) => {
                        // synchronous resolution failure: the entry is gone
                        // before any waiter's error callback can run
                        self.core
                            .fail_waiters(key, AcceptorError::connect_failed(err));
                    }
                }
            }
        }
        fut
    }
}

impl<T: 'static, K: RoutingKey> PoolCore<T, K> {
    pub(crate) fn new(
        server_pool: Arc<dyn ServerPool<K>>,
        factory: Arc<dyn BroadcastPipelineFactory<T, K>>,
    ) -> Self {
        Self {
            server_pool,
            factory,
            entries: RefCell::new(AHashMap::new()),
        }
    }

    /// Connect resolution, on the owning reactor.
    fn on_connect_done(core: &Rc<Self>, key: K, result: anyhow::Result<Transport>) {
        let transport = match result {
            Ok(transport) => transport,
            Err(err) => {
                core.fail_waiters(&key, AcceptorError::connect_failed(err));
                return;
            }
        };

        let pipeline = match core.factory.new_pipeline(transport) {
            Ok(pipeline) => pipeline,
            Err(err) => {
                core.fail_waiters(&key, err.into());
                return;
            }
        };

        if let Err(err) = core.factory.set_routing_data(&pipeline, &key) {
            core.fail_waiters(&key, AcceptorError::routing_failed(err));
            pipeline.close();
            return;
        }

        let handler = core.factory.get_broadcast_handler(&pipeline);
        let guard = Rc::new(EntryGuard {
            pool: Rc::downgrade(core),
            key: key.clone(),
        });
        handler.attach_ctrl(guard.clone());
        pipeline.set_manager(Rc::downgrade(&guard) as Weak<dyn PipelineManager>);
        pipeline.transport_active();

        let waiters = {
            let mut entries = core.entries.borrow_mut();
            match entries.remove(&key) {
                Some(Entry::Connecting { waiters }) => {
                    entries.insert(
                        key.clone(),
                        Entry::Ready {
                            pipeline,
                            handler: handler.clone(),
                            guard,
                        },
                    );
                    waiters
                }
                _ => {
                    // the entry vanished while the connect was in flight
                    drop(entries);
                    handler.mark_finished();
                    handler.take_ctrl();
                    pipeline.close();
                    return;
                }
            }
        };

        for waiter in waiters {
            let _ = waiter.send(Ok(handler.clone()));
        }

        // Post-fulfilment sweep at the next quiescent point: waiter tasks
        // woken above run first, then an entry nobody subscribed to is
        // reclaimed.
        let weak = Rc::downgrade(core);
        tokio::task::spawn_local(async move {
            tokio::task::yield_now().await;
            if let Some(core) = weak.upgrade() {
                core.sweep(&key);
            }
        });
    }

    /// Fail and remove a Connecting entry. Waiter error callbacks observe
    /// `is_broadcasting == false`.
    fn fail_waiters(&self, key: &K, err: AcceptorError) {
        let Some(entry) = self.entries.borrow_mut().remove(key) else {
            return;
        };
        match entry {
            Entry::Connecting { waiters } => {
                for waiter in waiters {
                    let _ = waiter.send(Err(err.clone()));
                }
            }
            Entry::Ready { .. } => {
                debug_assert!(false, "fail_waiters on a Ready entry");
            }
        }
    }

    /// Orphan sweep: a Ready entry with zero subscribers after fulfilment is
    /// torn down.
    fn sweep(&self, key: &K) {
        let orphaned = matches!(
            self.entries.borrow().get(key),
            Some(Entry::Ready { handler, .. }) if handler.subscriber_count() == 0
        );
        if orphaned {
            self.evict(key);
        }
    }

    /// Remove the entry without touching the pipeline (EOF/error path: the
    /// chain tears itself down).
    fn detach(&self, key: &K) {
        self.entries.borrow_mut().remove(key);
    }

    /// Remove the entry and close the upstream pipeline.
    fn evict(&self, key: &K) {
        let Some(entry) = self.entries.borrow_mut().remove(key) else {
            return;
        };
        match entry {
            Entry::Ready {
                pipeline, handler, ..
            } => {
                handler.mark_finished();
                handler.take_ctrl();
                pipeline.close();
            }
            Entry::Connecting { waiters } => {
                for waiter in waiters {
                    let _ = waiter.send(Err(AcceptorError::internal("broadcast evicted")));
                }
            }
        }
    }
}

/// Per-entry guard: the handler's control seam back into the pool and the
/// upstream pipeline's manager.
pub(crate) struct EntryGuard<T: 'static, K: RoutingKey> {
    pool: Weak<PoolCore<T, K>>,
    key: K,
}

impl<T: 'static, K: RoutingKey> EntryCtrl for EntryGuard<T, K> {
    fn detach_entry(&self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.detach(&self.key);
        }
    }

    fn evict_entry(&self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.evict(&self.key);
        }
    }
}

impl<T: 'static, K: RoutingKey> PipelineManager for EntryGuard<T, K> {
    fn delete_pipeline(&self, _pipeline: PipelineId) {
        if let Some(pool) = self.pool.upgrade() {
            pool.detach(&self.key);
        }
    }
}

use crate::acceptor::{Acceptor, AcceptorFactory, AcceptorStats};
use crate::reactor::{LifecycleObserver, ReactorHandle, ReactorId};
use crate::utils::StateCell;
use ahash::AHashMap;
use parking_lot::RwLock;
use std::net::{TcpListener, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// `Send` handle to an acceptor pinned to another reactor. Carries the
/// reactor handle, the acceptor's local-registry slot, and its stats cell.
#[derive(Clone)]
pub struct AcceptorHandle {
    reactor: ReactorHandle,
    slot: u64,
    stats: Arc<StateCell<AcceptorStats>>,
}

impl AcceptorHandle {
    #[inline]
    pub fn reactor(&self) -> &ReactorHandle {
        &self.reactor
    }

    #[inline]
    pub fn stats(&self) -> &Arc<StateCell<AcceptorStats>> {
        &self.stats
    }

    /// Queue `f` to run against the acceptor on its owning reactor.
    pub fn with(&self, f: impl FnOnce(&Acceptor) + Send + 'static) -> anyhow::Result<()> {
        let slot = self.slot;
        self.reactor.run_on(move || {
            if let Some(acceptor) = Acceptor::local(slot) {
                f(&acceptor);
            }
        })
    }

    /// Run `f` against the acceptor and wait for the result. Startup and
    /// teardown paths only.
    pub fn call_with<R, F>(&self, f: F, timeout: Duration) -> anyhow::Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&Acceptor) -> R + Send + 'static,
    {
        let slot = self.slot;
        self.reactor
            .call(
                move || Acceptor::local(slot).map(|acceptor| f(&acceptor)),
                timeout,
            )?
            .ok_or_else(|| anyhow::anyhow!("acceptor slot {slot} is gone"))
    }
}

struct WorkerEntry {
    acceptor: AcceptorHandle,
}

/// One Acceptor per live reactor thread, mirroring the same listener set.
///
/// The worker map is the single structure read across threads; reads take a
/// shared lock, writes happen only inside the thread-lifecycle callbacks.
pub struct ServerWorkerPool {
    workers: RwLock<AHashMap<ReactorId, WorkerEntry>>,
    acceptor_factory: RwLock<Option<Arc<dyn AcceptorFactory>>>,
    tcp_sockets: RwLock<Vec<Arc<TcpListener>>>,
    udp_sockets: RwLock<Vec<Arc<UdpSocket>>>,
    drain_timeout: Duration,
}

impl ServerWorkerPool {
    pub fn new(drain_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            workers: RwLock::new(AHashMap::new()),
            acceptor_factory: RwLock::new(None),
            tcp_sockets: RwLock::new(Vec::new()),
            udp_sockets: RwLock::new(Vec::new()),
            drain_timeout,
        })
    }

    pub fn set_acceptor_factory(&self, factory: Arc<dyn AcceptorFactory>) {
        *self.acceptor_factory.write() = Some(factory);
    }

    pub fn add_tcp_socket(&self, socket: Arc<TcpListener>) {
        self.tcp_sockets.write().push(socket);
    }

    pub fn add_udp_socket(&self, socket: Arc<UdpSocket>) {
        self.udp_sockets.write().push(socket);
    }

    /// Visit every live worker under the shared read lock.
    pub fn for_each_worker(&self, mut f: impl FnMut(&AcceptorHandle)) {
        for entry in self.workers.read().values() {
            f(&entry.acceptor);
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.read().len()
    }

    /// Release the bound listener fds so a stopped server's ports actually
    /// refuse connections.
    pub(crate) fn clear_sockets(&self) {
        self.tcp_sockets.write().clear();
        self.udp_sockets.write().clear();
    }

    /// Connections still tracked across all workers. Unreachable workers
    /// count as empty.
    pub fn active_connections(&self) -> usize {
        let handles: Vec<AcceptorHandle> = self
            .workers
            .read()
            .values()
            .map(|e| e.acceptor.clone())
            .collect();
        handles
            .into_iter()
            .filter_map(|h| {
                h.call_with(|acceptor| acceptor.connection_count(), TEARDOWN_TIMEOUT)
                    .ok()
            })
            .sum()
    }

    /// Kick off the staged drain on every worker. Connections get
    /// `notify_pending_shutdown`, then `close_when_idle`, then a forced drop
    /// once the grace period runs out.
    pub fn stop(&self) {
        let grace = self.drain_timeout;
        let handles: Vec<AcceptorHandle> = self
            .workers
            .read()
            .values()
            .map(|e| e.acceptor.clone())
            .collect();
        for handle in handles {
            let result = handle.call_with(move |acceptor| acceptor.drain(grace), TEARDOWN_TIMEOUT);
            if let Err(err) = result {
                tracing::warn!("worker drain did not start: {err}");
            }
        }
    }
}

impl LifecycleObserver for ServerWorkerPool {
    fn thread_started(&self, reactor: &ReactorHandle) {
        let Some(factory) = self.acceptor_factory.read().clone() else {
            tracing::error!("worker pool has no acceptor factory; thread ignored");
            return;
        };
        let tcp = self.tcp_sockets.read().clone();
        let udp = self.udp_sockets.read().clone();

        let built = reactor.call(
            move || -> anyhow::Result<(u64, Arc<StateCell<AcceptorStats>>)> {
                let acceptor = factory.new_acceptor()?;
                let slot = acceptor.register_local();
                for socket in &tcp {
                    acceptor.add_listener(socket.try_clone()?)?;
                }
                for socket in &udp {
                    acceptor.add_datagram_socket(socket.try_clone()?)?;
                }
                Ok((slot, acceptor.stats()))
            },
            STARTUP_TIMEOUT,
        );

        match built {
            Ok(Ok((slot, stats))) => {
                let entry = WorkerEntry {
                    acceptor: AcceptorHandle {
                        reactor: reactor.clone(),
                        slot,
                        stats,
                    },
                };
                self.workers.write().insert(reactor.id(), entry);
                tracing::debug!("acceptor ready on reactor {}", reactor.id());
            }
            Ok(Err(err)) | Err(err) => {
                tracing::error!("acceptor setup failed on reactor {}: {err}", reactor.id());
            }
        }
    }

    fn thread_stopped(&self, reactor: &ReactorHandle) {
        if let Some(entry) = self.workers.write().remove(&reactor.id()) {
            let result =
                entry
                    .acceptor
                    .call_with(|acceptor| acceptor.shutdown(), TEARDOWN_TIMEOUT);
            if let Err(err) = result {
                tracing::debug!("acceptor teardown skipped: {err}");
            }
        }
    }
}

use crate::reactor::{EventLoop, ReactorContext, ReactorHandle, ReactorId};
use crate::utils::{CancelToken, HealthFlag, try_pin_core};
use anyhow::Context;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Observer of reactor-thread lifecycle. `thread_started` runs once per
/// reactor after its loop is live; `thread_stopped` runs before the thread is
/// joined. Observers place and tear down per-thread state (one Acceptor per
/// reactor) through the handle they receive.
pub trait LifecycleObserver: Send + Sync {
    fn thread_started(&self, reactor: &ReactorHandle);
    fn thread_stopped(&self, reactor: &ReactorHandle);
}

struct Worker {
    handle: ReactorHandle,
    join: thread::JoinHandle<()>,
}

/// Fixed pool of reactor threads, each running an [`EventLoop`] with an
/// installed [`ReactorContext`]. Observers registered before or after start
/// see every live thread exactly once.
pub struct IoExecutor {
    name: String,
    threads: usize,
    tick: Duration,
    pin_cores: Option<Vec<usize>>,
    cancel: CancelToken,
    workers: Vec<Worker>,
    observers: Mutex<Vec<Arc<dyn LifecycleObserver>>>,
}

impl IoExecutor {
    pub fn new(
        name: impl Into<String>,
        threads: usize,
        tick: Duration,
        pin_cores: Option<Vec<usize>>,
    ) -> Self {
        Self {
            name: name.into(),
            threads: threads.max(1),
            tick,
            pin_cores,
            cancel: CancelToken::root(),
            workers: Vec::new(),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Register an observer. When the pool is already running, the observer
    /// immediately sees `thread_started` for every live reactor.
    pub fn add_observer(&self, observer: Arc<dyn LifecycleObserver>) {
        for worker in &self.workers {
            observer.thread_started(&worker.handle);
        }
        self.observers.lock().push(observer);
    }

    /// Spawn the reactor threads and notify observers.
    pub fn start(&mut self) -> anyhow::Result<()> {
        if !self.workers.is_empty() {
            anyhow::bail!("executor {} already started", self.name);
        }

        for index in 0..self.threads {
            let pin = self
                .pin_cores
                .as_ref()
                .filter(|cores| !cores.is_empty())
                .map(|cores| cores[index % cores.len()]);
            let worker = self.spawn_reactor(index, pin)?;
            self.workers.push(worker);
        }

        let observers = self.observers.lock().clone();
        for worker in &self.workers {
            for observer in &observers {
                observer.thread_started(&worker.handle);
            }
        }

        tracing::info!("[{}] started {} reactor threads", self.name, self.threads);
        Ok(())
    }

    fn spawn_reactor(&self, index: usize, pin: Option<usize>) -> anyhow::Result<Worker> {
        let id = ReactorId::new();
        let (tasks_tx, tasks_rx) = crossbeam::channel::unbounded();
        let cancel = self.cancel.child();
        let health = HealthFlag::new(false);
        let handle = ReactorHandle::new(id, tasks_tx, cancel.clone(), health.clone());
        let thread_name = format!("{}-{}-{}", self.name, index, id);
        let tick = self.tick;

        let join = thread::Builder::new()
            .name(thread_name.clone())
            .spawn({
                let handle = handle.clone();
                move || {
                    if let Some(core) = pin {
                        match try_pin_core(core) {
                            Ok(core) => tracing::info!("[{thread_name}] pinned to core {core}"),
                            Err(err) => {
                                tracing::warn!("[{thread_name}] core pinning failed: {err}")
                            }
                        }
                    }

                    let mut event_loop = match EventLoop::with_queue(tasks_rx, tick) {
                        Ok(el) => el,
                        Err(err) => {
                            tracing::error!("[{thread_name}] event loop build failed: {err}");
                            health.down();
                            return;
                        }
                    };

                    let ctx = ReactorContext::new(id, handle);
                    let _guard = ReactorContext::install(ctx);
                    event_loop.run(&cancel, &health);
                }
            })
            .with_context(|| format!("failed to spawn reactor thread {index}"))?;

        Ok(Worker { handle, join })
    }

    pub fn handles(&self) -> Vec<ReactorHandle> {
        self.workers.iter().map(|w| w.handle.clone()).collect()
    }

    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Notify observers, cancel every reactor, join the threads.
    pub fn stop(mut self) {
        let observers = self.observers.lock().clone();
        for worker in &self.workers {
            for observer in &observers {
                observer.thread_stopped(&worker.handle);
            }
        }

        for worker in &self.workers {
            worker.handle.cancel();
        }
        for worker in self.workers.drain(..) {
            if worker.join.join().is_err() {
                tracing::error!("[{}] reactor thread panicked", self.name);
            }
        }
        tracing::info!("[{}] stopped", self.name);
    }
}

use crate::reactor::ReactorTask;
use crate::utils::{CancelToken, HealthFlag};
use anyhow::Context;
use crossbeam::channel::{Receiver, Sender, unbounded};
use std::time::Duration;
use tokio::task::{LocalSet, yield_now};
use tokio::time::sleep;

/// Single-threaded cooperative event loop: a current-thread tokio runtime
/// driving a `LocalSet` in explicit ticks. A cross-thread closure queue is
/// drained at the top of every tick, then local tasks run until the tick
/// timer fires.
///
/// All thread-pinned components (acceptors, pipelines, broadcast pool
/// partitions) live as local tasks and `Rc` state inside one of these loops.
pub struct EventLoop {
    // declared before the runtime so spawned tasks drop while the runtime's
    // drivers are still alive
    local: LocalSet,
    rt: tokio::runtime::Runtime,
    tasks_rx: Receiver<ReactorTask>,
    tick: Duration,
}

impl EventLoop {
    /// Build a loop together with the sender half of its injection queue.
    pub fn new(tick: Duration) -> anyhow::Result<(Self, Sender<ReactorTask>)> {
        let (tx, rx) = unbounded();
        Ok((Self::with_queue(rx, tick)?, tx))
    }

    /// Build a loop over an existing injection queue.
    pub fn with_queue(tasks_rx: Receiver<ReactorTask>, tick: Duration) -> anyhow::Result<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .context("failed to build current-thread runtime")?;
        Ok(Self {
            local: LocalSet::new(),
            rt,
            tasks_rx,
            tick,
        })
    }

    /// One tick: run every queued closure inside the task context, then
    /// drive local tasks until the tick timer fires (or one yield when the
    /// tick is zero). Returns the number of injected closures run.
    pub fn tick(&mut self) -> usize {
        let mut injected = 0usize;
        let tasks_rx = &self.tasks_rx;
        let tick = self.tick;

        self.rt.block_on(self.local.run_until(async {
            while let Ok(task) = tasks_rx.try_recv() {
                injected += 1;
                task();
            }
            if tick.is_zero() {
                yield_now().await;
            } else {
                sleep(tick).await;
            }
        }));

        injected
    }

    /// Run a closure inside the loop's task context without advancing the
    /// tick timer. Lets callers on the owning thread use `spawn_local` and
    /// other context-dependent APIs synchronously.
    pub fn enter<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.rt.block_on(self.local.run_until(async { f() }))
    }

    /// Drive ticks until `cancel` trips. Marks `health` up on entry and down
    /// on exit.
    pub fn run(&mut self, cancel: &CancelToken, health: &HealthFlag) {
        health.up();
        while !cancel.is_cancelled() {
            self.tick();
        }
        health.down();
    }
}

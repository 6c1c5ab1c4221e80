use crate::error::AcceptorError;
use crate::pipeline::{HandlerCtx, InboundHandler};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Receiving end of a broadcast. Each subscriber observes every upstream
/// value once, in arrival order, then exactly one terminal callback
/// (`on_completed` or `on_error`).
pub trait Subscriber<T> {
    fn on_next(&self, value: &T);
    fn on_error(&self, err: &AcceptorError);
    fn on_completed(&self);
}

/// Control seam from a handler back to the pool entry that owns its
/// pipeline.
pub(crate) trait EntryCtrl {
    /// Drop the pool entry without touching the pipeline: the chain is
    /// already tearing itself down.
    fn detach_entry(&self);
    /// Drop the pool entry and close the upstream pipeline: nobody is
    /// listening anymore.
    fn evict_entry(&self);
}

/// Fan-out point of one upstream pipeline. Thread-pinned like the pipeline
/// it sits in; shared as `Rc` between the pipeline stage, the pool entry,
/// and resolved waiters.
pub struct BroadcastHandler<T: 'static> {
    subscribers: RefCell<Vec<(u64, Rc<dyn Subscriber<T>>)>>,
    next_id: Cell<u64>,
    ctrl: RefCell<Option<Rc<dyn EntryCtrl>>>,
    finished: Cell<bool>,
}

impl<T: 'static> std::fmt::Debug for BroadcastHandler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastHandler")
            .field("subscribers", &self.subscribers.borrow().len())
            .field("next_id", &self.next_id.get())
            .field("finished", &self.finished.get())
            .finish()
    }
}

impl<T: 'static> BroadcastHandler<T> {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            subscribers: RefCell::new(Vec::new()),
            next_id: Cell::new(1),
            ctrl: RefCell::new(None),
            finished: Cell::new(false),
        })
    }

    /// Register a subscriber and return its id. Subscribing to a handler
    /// whose upstream already finished is legal: the subscriber sees an
    /// immediate `on_completed`.
    pub fn subscribe(&self, subscriber: Rc<dyn Subscriber<T>>) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        if self.finished.get() {
            subscriber.on_completed();
            return id;
        }
        self.subscribers.borrow_mut().push((id, subscriber));
        id
    }

    /// Drop a subscriber. When the last one leaves a live broadcast, the
    /// entry is evicted and the upstream pipeline closed.
    pub fn unsubscribe(&self, id: u64) {
        let mut subs = self.subscribers.borrow_mut();
        let before = subs.len();
        subs.retain(|(sub_id, _)| *sub_id != id);
        let now_empty = before > 0 && subs.is_empty();
        drop(subs);

        if now_empty && !self.finished.get() {
            if let Some(ctrl) = self.ctrl.borrow_mut().take() {
                ctrl.evict_entry();
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.borrow().len()
    }

    /// True once the upstream reported EOF or an error, or the pool evicted
    /// the entry.
    pub fn is_finished(&self) -> bool {
        self.finished.get()
    }

    pub(crate) fn attach_ctrl(&self, ctrl: Rc<dyn EntryCtrl>) {
        *self.ctrl.borrow_mut() = Some(ctrl);
    }

    pub(crate) fn take_ctrl(&self) -> Option<Rc<dyn EntryCtrl>> {
        self.ctrl.borrow_mut().take()
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.set(true);
    }

    /// Fan a value out to the current subscribers. A subscriber added while
    /// the fan-out runs sees only later values.
    pub fn deliver(&self, value: &T) {
        let snapshot: Vec<Rc<dyn Subscriber<T>>> = self
            .subscribers
            .borrow()
            .iter()
            .map(|(_, sub)| sub.clone())
            .collect();
        for sub in snapshot {
            sub.on_next(value);
        }
    }

    /// Upstream EOF: detach from the pool first so no new subscriber joins,
    /// then complete everyone.
    pub(crate) fn complete(&self) {
        if self.finished.replace(true) {
            return;
        }
        if let Some(ctrl) = self.ctrl.borrow_mut().take() {
            ctrl.detach_entry();
        }
        let drained: Vec<(u64, Rc<dyn Subscriber<T>>)> =
            self.subscribers.borrow_mut().drain(..).collect();
        for (_, sub) in drained {
            sub.on_completed();
        }
    }

    /// Upstream error: detach, then fail everyone.
    pub(crate) fn fail(&self, err: &AcceptorError) {
        if self.finished.replace(true) {
            return;
        }
        if let Some(ctrl) = self.ctrl.borrow_mut().take() {
            ctrl.detach_entry();
        }
        let drained: Vec<(u64, Rc<dyn Subscriber<T>>)> =
            self.subscribers.borrow_mut().drain(..).collect();
        for (_, sub) in drained {
            sub.on_error(err);
        }
    }
}

/// Terminal pipeline stage wrapping a shared [`BroadcastHandler`].
pub struct BroadcastStage<T: 'static> {
    handler: Rc<BroadcastHandler<T>>,
}

impl<T: 'static> BroadcastStage<T> {
    pub fn new(handler: Rc<BroadcastHandler<T>>) -> Self {
        Self { handler }
    }

    pub fn handler(&self) -> Rc<BroadcastHandler<T>> {
        self.handler.clone()
    }
}

impl<T: 'static> InboundHandler<T> for BroadcastStage<T> {
    fn transport_active(&mut self, _ctx: &HandlerCtx<T>) {}

    fn read(&mut self, _ctx: &HandlerCtx<T>, msg: T) {
        self.handler.deliver(&msg);
    }

    fn read_eof(&mut self, ctx: &HandlerCtx<T>) {
        self.handler.complete();
        ctx.close();
    }

    fn read_exception(&mut self, ctx: &HandlerCtx<T>, err: AcceptorError) {
        self.handler.fail(&err);
        ctx.close();
    }
}

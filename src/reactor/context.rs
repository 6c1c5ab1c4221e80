use crate::reactor::{ReactorHandle, ReactorId};
use ahash::AHashMap;
use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::rc::Rc;

thread_local! {
    static CURRENT: RefCell<Option<Rc<ReactorContext>>> = const { RefCell::new(None) };
}

/// Thread-pinned state of the reactor running on the current thread: its
/// identity, a cross-thread handle, and a registry of reactor-local
/// singletons (one slot per `(type, instance)` pair).
///
/// Reactor-local singletons are how per-thread components (an Acceptor, a
/// Broadcast Pool partition) are found again from a `Send` handle: the handle
/// carries the slot id, the closure it injects looks the value up here.
pub struct ReactorContext {
    id: ReactorId,
    handle: ReactorHandle,
    locals: RefCell<AHashMap<(TypeId, u64), Rc<dyn Any>>>,
}

impl ReactorContext {
    pub(crate) fn new(id: ReactorId, handle: ReactorHandle) -> Rc<Self> {
        Rc::new(Self {
            id,
            handle,
            locals: RefCell::new(AHashMap::new()),
        })
    }

    /// Install `ctx` as the current thread's context. The returned guard
    /// restores the previous one on drop, so test harnesses can nest.
    pub(crate) fn install(ctx: Rc<Self>) -> ContextGuard {
        let previous = CURRENT.with(|cell| cell.borrow_mut().replace(ctx));
        ContextGuard { previous }
    }

    pub fn try_current() -> Option<Rc<Self>> {
        CURRENT.with(|cell| cell.borrow().clone())
    }

    /// The context of the reactor owning this thread.
    ///
    /// # Panics
    /// When called off a reactor thread.
    pub fn current() -> Rc<Self> {
        Self::try_current().expect("not running on a reactor thread")
    }

    #[inline]
    pub fn id(&self) -> ReactorId {
        self.id
    }

    #[inline]
    pub fn handle(&self) -> &ReactorHandle {
        &self.handle
    }

    /// Fetch the reactor-local singleton for `(T, slot)`, creating it on
    /// first use.
    pub fn local_or_init<T: 'static>(&self, slot: u64, init: impl FnOnce() -> Rc<T>) -> Rc<T> {
        let key = (TypeId::of::<T>(), slot);
        if let Some(existing) = self.locals.borrow().get(&key) {
            if let Ok(typed) = existing.clone().downcast::<T>() {
                return typed;
            }
        }
        let fresh = init();
        self.locals
            .borrow_mut()
            .insert(key, fresh.clone() as Rc<dyn Any>);
        fresh
    }

    /// Look up the reactor-local singleton for `(T, slot)` without creating.
    pub fn local<T: 'static>(&self, slot: u64) -> Option<Rc<T>> {
        let key = (TypeId::of::<T>(), slot);
        self.locals
            .borrow()
            .get(&key)
            .and_then(|any| any.clone().downcast::<T>().ok())
    }

    /// Drop the reactor-local singleton for `(T, slot)`.
    pub fn remove_local<T: 'static>(&self, slot: u64) {
        self.locals.borrow_mut().remove(&(TypeId::of::<T>(), slot));
    }
}

/// Restores the previously installed context on drop.
pub struct ContextGuard {
    previous: Option<Rc<ReactorContext>>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|cell| *cell.borrow_mut() = previous);
    }
}

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Shared cancellation flag with an optional parent link. A check walks the
/// parent chain, so tripping a token is observed by every descendant without
/// bookkeeping on the cancel side.
struct Flag {
    tripped: AtomicBool,
    parent: Option<Arc<Flag>>,
}

impl Flag {
    fn is_tripped(&self) -> bool {
        if self.tripped.load(Ordering::Relaxed) {
            return true;
        }
        let mut up = self.parent.as_deref();
        while let Some(flag) = up {
            if flag.tripped.load(Ordering::Relaxed) {
                return true;
            }
            up = flag.parent.as_deref();
        }
        false
    }
}

/// Hierarchical cancellation token.
///
/// Clones share one flag. [`CancelToken::child`] derives a token that
/// observes its parent's cancellation but can also be cancelled on its own
/// without affecting siblings.
#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<Flag>,
}

impl CancelToken {
    /// New root token with no parent.
    pub fn root() -> Self {
        Self {
            flag: Arc::new(Flag {
                tripped: AtomicBool::new(false),
                parent: None,
            }),
        }
    }

    /// Derive a child token linked to this one.
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(Flag {
                tripped: AtomicBool::new(false),
                parent: Some(self.flag.clone()),
            }),
        }
    }

    /// Trip this token; descendants observe it on their next check.
    #[inline]
    pub fn cancel(&self) {
        self.flag.tripped.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.flag.is_tripped()
    }

    /// Sleep in small slices until cancelled or `total` elapses. Returns
    /// `false` when the sleep was cut short by cancellation.
    pub fn sleep_cancellable(&self, total: Duration) -> bool {
        let slice = Duration::from_millis(20);
        let mut slept = Duration::ZERO;
        while slept < total {
            if self.is_cancelled() {
                return false;
            }
            let step = slice.min(total - slept);
            std::thread::sleep(step);
            slept += step;
        }
        !self.is_cancelled()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("is_cancelled", &self.is_cancelled())
            .finish()
    }
}

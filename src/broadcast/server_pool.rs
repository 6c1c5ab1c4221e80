use crate::transport::Transport;
use ahash::AHashMap;
use anyhow::anyhow;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::fmt::Debug;
use std::hash::Hash;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;

/// Resolves a routing key to an upstream target and dials it.
///
/// Resolution failures surface synchronously through the outer `Result`;
/// dial failures through the returned future, which resolves on the caller's
/// reactor. The pool never retries; retry is the caller's policy.
pub trait ServerPool<K>: Send + Sync + 'static {
    fn connect(&self, key: &K) -> anyhow::Result<BoxFuture<'static, anyhow::Result<Transport>>>;
}

/// Route-table server pool: per-key targets plus an optional default, and a
/// connect-failure toggle for error-path tests.
pub struct StaticServerPool<K> {
    routes: RwLock<AHashMap<K, SocketAddr>>,
    fallback: RwLock<Option<SocketAddr>>,
    fail_connect: AtomicBool,
}

impl<K: Eq + Hash> StaticServerPool<K> {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(AHashMap::new()),
            fallback: RwLock::new(None),
            fail_connect: AtomicBool::new(false),
        }
    }

    /// Route `key` to `addr`.
    pub fn route(&self, key: K, addr: SocketAddr) {
        self.routes.write().insert(key, addr);
    }

    /// Target for keys with no explicit route.
    pub fn set_default(&self, addr: SocketAddr) {
        *self.fallback.write() = Some(addr);
    }

    /// Error injection: while set, `connect` fails synchronously.
    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::Relaxed);
    }
}

impl<K: Eq + Hash> Default for StaticServerPool<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> ServerPool<K> for StaticServerPool<K>
where
    K: Clone + Debug + Eq + Hash + Send + Sync + 'static,
{
    fn connect(&self, key: &K) -> anyhow::Result<BoxFuture<'static, anyhow::Result<Transport>>> {
        if self.fail_connect.load(Ordering::Relaxed) {
            return Err(anyhow!("connect failure injected for {key:?}"));
        }
        let addr = self
            .routes
            .read()
            .get(key)
            .copied()
            .or(*self.fallback.read())
            .ok_or_else(|| anyhow!("no route for {key:?}"))?;

        Ok(async move {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Transport::dialed(stream)
        }
        .boxed())
    }
}

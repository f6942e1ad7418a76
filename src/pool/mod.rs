//! Bounded session pool.
//!
//! Sessions are expensive, stateful and strictly single-threaded; the
//! pool is the only synchronization point for sharing them. A lease
//! hands a session out exclusively; release returns it to the idle set
//! unless the session died, in which case its slot is freed for a fresh
//! one.

pub mod config;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::{GeoError, Result};
use crate::session::{Session, SessionFactory};

pub use config::PoolConfig;

pub struct SessionPool {
    config: PoolConfig,
    factory: Arc<dyn SessionFactory>,
    /// Idle sessions ready to lease.
    available: Arc<Mutex<VecDeque<Box<dyn Session>>>>,
    /// Sessions ever created and not yet discarded. Never exceeds
    /// `config.max_sessions`.
    current_size: Arc<AtomicUsize>,
    next_id: Arc<Mutex<u64>>,
    shut_down: Arc<AtomicBool>,
}

impl SessionPool {
    pub async fn new(config: PoolConfig, factory: Arc<dyn SessionFactory>) -> Result<Self> {
        config.validate().map_err(GeoError::ConfigError)?;

        let pool = Self {
            config,
            factory,
            available: Arc::new(Mutex::new(VecDeque::new())),
            current_size: Arc::new(AtomicUsize::new(0)),
            next_id: Arc::new(Mutex::new(1)),
            shut_down: Arc::new(AtomicBool::new(false)),
        };

        pool.ensure_min_sessions().await?;
        Ok(pool)
    }

    /// Lease a session exclusively.
    ///
    /// Hands out an idle session when one exists, grows the pool lazily
    /// while under capacity, and otherwise waits up to
    /// `config.lease_timeout` before failing with `PoolExhausted`.
    pub async fn lease(&self) -> Result<PoolGuard> {
        let start = Instant::now();

        loop {
            if self.shut_down.load(Ordering::SeqCst) {
                return Err(GeoError::IllegalState("pool is shut down".into()));
            }

            if let Some(session) = self.try_get_available().await? {
                return Ok(self.guard(session));
            }

            if let Some(session) = self.try_create_session().await? {
                return Ok(self.guard(session));
            }

            if start.elapsed() > self.config.lease_timeout {
                return Err(GeoError::PoolExhausted(format!(
                    "no session available within {:?}",
                    self.config.lease_timeout
                )));
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn guard(&self, session: Box<dyn Session>) -> PoolGuard {
        debug!(session = session.id(), "session leased");
        PoolGuard {
            session: Some(session),
            available: Arc::clone(&self.available),
            current_size: Arc::clone(&self.current_size),
            shut_down: Arc::clone(&self.shut_down),
        }
    }

    async fn try_get_available(&self) -> Result<Option<Box<dyn Session>>> {
        let mut available = self.available.lock().await;
        while let Some(session) = available.pop_front() {
            if session.is_closed() {
                // Dead idle session: free its slot for a fresh one.
                self.current_size.fetch_sub(1, Ordering::SeqCst);
                continue;
            }
            return Ok(Some(session));
        }
        Ok(None)
    }

    async fn try_create_session(&self) -> Result<Option<Box<dyn Session>>> {
        // Reserve a slot before creating so concurrent callers can never
        // push `current_size` past the maximum.
        let reserved = self
            .current_size
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n < self.config.max_sessions {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .is_ok();
        if !reserved {
            return Ok(None);
        }

        let id = {
            let mut next_id = self.next_id.lock().await;
            let id = *next_id;
            *next_id += 1;
            id
        };

        match self.factory.create_session(id).await {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                // Give the reserved slot back; the failure must not
                // corrupt the accounting.
                self.current_size.fetch_sub(1, Ordering::SeqCst);
                Err(GeoError::BackendIo(format!(
                    "session creation failed: {}",
                    e
                )))
            }
        }
    }

    async fn ensure_min_sessions(&self) -> Result<()> {
        while self.current_size.load(Ordering::SeqCst) < self.config.min_sessions {
            match self.try_create_session().await? {
                Some(session) => {
                    let mut available = self.available.lock().await;
                    available.push_back(session);
                }
                None => break,
            }
        }
        Ok(())
    }

    pub async fn stats(&self) -> PoolStats {
        let available = self.available.lock().await;
        let current = self.current_size.load(Ordering::SeqCst);

        PoolStats {
            current_sessions: current,
            available_sessions: available.len(),
            active_sessions: current.saturating_sub(available.len()),
            max_sessions: self.config.max_sessions,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Close all idle sessions and refuse further leases.
    ///
    /// Leased sessions are not force-closed; their guards discard them
    /// on release.
    pub async fn shutdown(&self) -> Result<()> {
        self.shut_down.store(true, Ordering::SeqCst);

        let drained: Vec<Box<dyn Session>> = {
            let mut available = self.available.lock().await;
            available.drain(..).collect()
        };
        for mut session in drained {
            let _ = session.close().await;
            self.current_size.fetch_sub(1, Ordering::SeqCst);
        }
        debug!("pool shut down");
        Ok(())
    }
}

/// Session pool statistics.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub current_sessions: usize,
    pub available_sessions: usize,
    pub active_sessions: usize,
    pub max_sessions: usize,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} active, {} available, max {}",
            self.active_sessions,
            self.current_sessions,
            self.available_sessions,
            self.max_sessions
        )
    }
}

/// RAII lease on a pooled session.
///
/// Prefer the explicit async `release()`; `Drop` is the best-effort
/// fallback when a guard goes out of scope on an error path.
pub struct PoolGuard {
    session: Option<Box<dyn Session>>,
    available: Arc<Mutex<VecDeque<Box<dyn Session>>>>,
    current_size: Arc<AtomicUsize>,
    shut_down: Arc<AtomicBool>,
}

impl PoolGuard {
    /// The leased session.
    pub fn session(&mut self) -> &mut dyn Session {
        self.session
            .as_deref_mut()
            .expect("session already returned to pool")
    }

    /// Return the session to the pool.
    ///
    /// Closed sessions (and any session released after shutdown) are
    /// discarded and their slot freed instead of rejoining the idle set.
    pub async fn release(mut self) -> Result<()> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        if !session.is_closed() {
            // The shutdown flag is set before the drain takes this
            // lock, so a flag still clear here means the drain has not
            // run yet and will pick this session up.
            let mut available = self.available.lock().await;
            if !self.shut_down.load(Ordering::SeqCst) {
                available.push_back(session);
                return Ok(());
            }
        }
        let _ = session.close().await;
        self.current_size.fetch_sub(1, Ordering::SeqCst);
        debug!(session = session.id(), "session discarded on release");
        Ok(())
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        if session.is_closed() {
            self.current_size.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        // Drop cannot await the pool lock; try once and otherwise give
        // the slot up so the pool can create a replacement. As in
        // release(), the shutdown flag is only trusted under the lock.
        match self.available.try_lock() {
            Ok(mut available) if !self.shut_down.load(Ordering::SeqCst) => {
                available.push_back(session);
            }
            Ok(_) => {
                self.current_size.fetch_sub(1, Ordering::SeqCst);
            }
            Err(_) => {
                warn!(
                    session = session.id(),
                    "pool lock busy on drop; session discarded, use release()"
                );
                self.current_size.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemBackend;

    fn test_pool_config(max: usize) -> PoolConfig {
        PoolConfig::new("sde", "sde")
            .max_sessions(max)
            .lease_timeout(Duration::from_millis(100))
    }

    async fn new_pool(max: usize) -> SessionPool {
        SessionPool::new(test_pool_config(max), Arc::new(MemBackend::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_pool_grows_lazily() {
        let pool = new_pool(5).await;
        assert_eq!(pool.stats().await.current_sessions, 0);

        let guard = pool.lease().await.unwrap();
        let stats = pool.stats().await;
        assert_eq!(stats.current_sessions, 1);
        assert_eq!(stats.active_sessions, 1);

        guard.release().await.unwrap();
        let stats = pool.stats().await;
        assert_eq!(stats.current_sessions, 1);
        assert_eq!(stats.available_sessions, 1);
    }

    #[tokio::test]
    async fn test_min_sessions_precreated() {
        let config = test_pool_config(5).min_sessions(2);
        let pool = SessionPool::new(config, Arc::new(MemBackend::new()))
            .await
            .unwrap();
        let stats = pool.stats().await;
        assert_eq!(stats.current_sessions, 2);
        assert_eq!(stats.available_sessions, 2);
    }

    #[tokio::test]
    async fn test_lease_timeout_when_exhausted() {
        let pool = new_pool(1).await;
        let _held = pool.lease().await.unwrap();

        let result = pool.lease().await;
        assert!(matches!(result, Err(GeoError::PoolExhausted(_))));
    }

    #[tokio::test]
    async fn test_closed_session_discarded_on_release() {
        let pool = new_pool(2).await;
        let mut guard = pool.lease().await.unwrap();
        guard.session().close().await.unwrap();
        guard.release().await.unwrap();

        let stats = pool.stats().await;
        assert_eq!(stats.current_sessions, 0);
        assert_eq!(stats.available_sessions, 0);
    }

    #[tokio::test]
    async fn test_lease_after_shutdown_fails() {
        let pool = new_pool(2).await;
        pool.shutdown().await.unwrap();
        assert!(matches!(
            pool.lease().await,
            Err(GeoError::IllegalState(_))
        ));
    }

    #[tokio::test]
    async fn test_release_after_shutdown_discards_session() {
        let pool = new_pool(2).await;
        let guard = pool.lease().await.unwrap();
        pool.shutdown().await.unwrap();

        // The session leased across shutdown must not rejoin the idle
        // set; its slot is freed instead.
        guard.release().await.unwrap();
        let stats = pool.stats().await;
        assert_eq!(stats.current_sessions, 0);
        assert_eq!(stats.available_sessions, 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_idle_sessions() {
        let pool = new_pool(3).await;
        let g1 = pool.lease().await.unwrap();
        let g2 = pool.lease().await.unwrap();
        g1.release().await.unwrap();
        g2.release().await.unwrap();
        assert_eq!(pool.stats().await.available_sessions, 2);

        pool.shutdown().await.unwrap();
        let stats = pool.stats().await;
        assert_eq!(stats.current_sessions, 0);
        assert_eq!(stats.available_sessions, 0);
    }
}

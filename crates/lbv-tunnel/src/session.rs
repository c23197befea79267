//! Session Store
//!
//! Registry of running tunnels keyed by opaque numeric handles. Handles come
//! from a monotonic counter and are never reused while the store lives, so
//! a stale handle is recognised as closed rather than hitting a newer
//! session.

use crate::config::Configuration;
use crate::engine::{ActiveTunnel, PeerStatus, TunnelEngine};
use crate::error::EngineError;
use crate::keys::PublicKey;
use crate::system::SystemConfiguration;
use crate::tunnel::TunnelStats;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Opaque session identifier; always positive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionHandle(u64);

impl SessionHandle {
    /// Wrap a raw handle value, e.g. one handed back by a caller
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Running, but no peer currently has a session
    Down,
    /// Every peer connected
    Up,
    /// Some peers connected
    Degraded { connected: usize, total: usize },
    /// `close` in progress
    TearingDown,
    /// Closed; `status` no longer knows the handle
    Closed,
}

impl SessionStatus {
    /// Check if the session carries traffic to at least one peer
    pub fn is_usable(&self) -> bool {
        matches!(self, SessionStatus::Up | SessionStatus::Degraded { .. })
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Down => write!(f, "down"),
            SessionStatus::Up => write!(f, "up"),
            SessionStatus::Degraded { connected, total } => {
                write!(f, "degraded ({}/{} peers)", connected, total)
            }
            SessionStatus::TearingDown => write!(f, "tearing down"),
            SessionStatus::Closed => write!(f, "closed"),
        }
    }
}

/// Snapshot of a live session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub handle: SessionHandle,
    /// Interface name, when the session was opened by name or file
    pub name: Option<String>,
    pub status: SessionStatus,
    pub peers: Vec<PeerStatus>,
    pub mtu: u16,
    pub uptime: Duration,
}

struct SessionRecord {
    name: Option<String>,
    config: Arc<Configuration>,
    /// Taken out while tearing down
    tunnel: Option<Box<dyn ActiveTunnel>>,
    opened_at: Instant,
}

impl SessionRecord {
    fn status(&self) -> SessionStatus {
        let Some(tunnel) = &self.tunnel else {
            return SessionStatus::TearingDown;
        };
        let c = tunnel.connectivity();
        if c.is_complete() {
            SessionStatus::Up
        } else if c.connected == 0 {
            SessionStatus::Down
        } else {
            SessionStatus::Degraded {
                connected: c.connected,
                total: c.total,
            }
        }
    }
}

/// Registry of live sessions
pub struct SessionStore {
    engine: Arc<dyn TunnelEngine>,
    sessions: RwLock<HashMap<SessionHandle, SessionRecord>>,
    next_handle: AtomicU64,
}

impl SessionStore {
    pub fn new(engine: Arc<dyn TunnelEngine>) -> Self {
        Self {
            engine,
            sessions: RwLock::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Start a tunnel and register it. Nothing is registered on failure.
    pub async fn open(
        &self,
        config: Configuration,
        name: Option<String>,
        system: &SystemConfiguration,
    ) -> Result<SessionHandle, EngineError> {
        let config = Arc::new(config);
        let tunnel = self.engine.start(config.clone(), system).await?;

        let handle = SessionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        let record = SessionRecord {
            name,
            config,
            tunnel: Some(tunnel),
            opened_at: Instant::now(),
        };
        let status = record.status();
        self.sessions.write().await.insert(handle, record);

        info!(%handle, %status, "Session opened");
        Ok(handle)
    }

    fn was_issued(&self, handle: SessionHandle) -> bool {
        handle.0 > 0 && handle.0 < self.next_handle.load(Ordering::SeqCst)
    }

    /// Tear a session down and forget it.
    ///
    /// The record is removed even when the engine reports an error while
    /// stopping; that error is returned.
    pub async fn close(&self, handle: SessionHandle) -> Result<(), EngineError> {
        let tunnel = {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(&handle) {
                Some(record) => match record.tunnel.take() {
                    Some(tunnel) => tunnel,
                    None => return Err(EngineError::AlreadyClosed(handle)),
                },
                None if self.was_issued(handle) => return Err(EngineError::AlreadyClosed(handle)),
                None => return Err(EngineError::UnknownHandle(handle)),
            }
        };

        debug!(%handle, "Tearing down session");
        let result = tunnel.stop().await;
        self.sessions.write().await.remove(&handle);

        match &result {
            Ok(()) => info!(%handle, "Session closed"),
            Err(e) => warn!(%handle, "Session closed with error: {}", e),
        }
        result
    }

    /// Current status of a live session
    pub async fn status(&self, handle: SessionHandle) -> Result<SessionStatus, EngineError> {
        self.sessions
            .read()
            .await
            .get(&handle)
            .map(SessionRecord::status)
            .ok_or(EngineError::UnknownHandle(handle))
    }

    /// Configuration a live session was opened with
    pub async fn config(&self, handle: SessionHandle) -> Result<Arc<Configuration>, EngineError> {
        self.sessions
            .read()
            .await
            .get(&handle)
            .map(|r| r.config.clone())
            .ok_or(EngineError::UnknownHandle(handle))
    }

    /// Peer responsible for `dst` within a session
    pub async fn route(
        &self,
        handle: SessionHandle,
        dst: IpAddr,
    ) -> Result<Option<PublicKey>, EngineError> {
        let sessions = self.sessions.read().await;
        let record = sessions
            .get(&handle)
            .ok_or(EngineError::UnknownHandle(handle))?;
        Ok(record.tunnel.as_ref().and_then(|t| t.route(dst)))
    }

    /// Counters of a live session
    pub async fn stats(&self, handle: SessionHandle) -> Result<TunnelStats, EngineError> {
        let sessions = self.sessions.read().await;
        match sessions.get(&handle).and_then(|r| r.tunnel.as_ref()) {
            Some(tunnel) => Ok(tunnel.stats().await),
            None => Err(EngineError::UnknownHandle(handle)),
        }
    }

    /// Snapshots of every live session, ordered by handle
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        let mut infos: Vec<SessionInfo> = sessions
            .iter()
            .map(|(handle, record)| SessionInfo {
                handle: *handle,
                name: record.name.clone(),
                status: record.status(),
                peers: record.tunnel.as_ref().map(|t| t.peers()).unwrap_or_default(),
                mtu: record.tunnel.as_ref().map(|t| t.mtu()).unwrap_or_default(),
                uptime: record.opened_at.elapsed(),
            })
            .collect();
        infos.sort_by_key(|i| i.handle);
        infos
    }

    /// Number of live sessions
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Close every live session
    pub async fn shutdown(&self) {
        let handles: Vec<SessionHandle> = self.sessions.read().await.keys().copied().collect();
        if handles.is_empty() {
            return;
        }

        info!(sessions = handles.len(), "Closing all sessions");
        for handle in handles {
            match self.close(handle).await {
                Ok(()) | Err(EngineError::AlreadyClosed(_)) => {}
                Err(e) => warn!(%handle, "Error during shutdown: {}", e),
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::StubEngine;
    use super::*;
    use crate::config::{Endpoint, InterfaceConfig, PeerConfig};
    use crate::keys::KeyPair;
    use std::collections::HashSet;

    fn config(peers: usize) -> Configuration {
        let mut config = Configuration::new(InterfaceConfig::new(
            KeyPair::generate().private,
            "10.0.0.2/32".parse().unwrap(),
        ));
        for i in 0..peers {
            config = config.with_peer(PeerConfig::new(
                KeyPair::generate().public,
                Endpoint::new(format!("10.0.1.{}", i + 1), 51820),
            ));
        }
        config
    }

    fn store(engine: StubEngine) -> SessionStore {
        SessionStore::new(Arc::new(engine))
    }

    #[tokio::test]
    async fn test_open_close() {
        let store = store(StubEngine::default());
        let system = SystemConfiguration::default();

        let handle = store.open(config(1), Some("wg0".into()), &system).await.unwrap();
        assert!(handle.get() > 0);
        assert_eq!(store.status(handle).await.unwrap(), SessionStatus::Up);
        assert_eq!(store.sessions().await[0].name.as_deref(), Some("wg0"));
        assert_eq!(store.config(handle).await.unwrap().peers.len(), 1);

        store.close(handle).await.unwrap();
        assert!(store.is_empty().await);
        assert_eq!(store.status(handle).await, Err(EngineError::UnknownHandle(handle)));
        assert!(store.config(handle).await.is_err());
    }

    #[tokio::test]
    async fn test_handles_never_reused() {
        let store = store(StubEngine::default());
        let system = SystemConfiguration::default();

        let first = store.open(config(0), None, &system).await.unwrap();
        store.close(first).await.unwrap();
        let second = store.open(config(0), None, &system).await.unwrap();

        assert_ne!(first, second);
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_close_twice() {
        let store = store(StubEngine::default());
        let handle = store
            .open(config(1), None, &SystemConfiguration::default())
            .await
            .unwrap();

        store.close(handle).await.unwrap();
        assert_eq!(store.close(handle).await, Err(EngineError::AlreadyClosed(handle)));
    }

    #[tokio::test]
    async fn test_unknown_handle() {
        let store = store(StubEngine::default());
        let bogus = SessionHandle::new(999);

        assert_eq!(store.close(bogus).await, Err(EngineError::UnknownHandle(bogus)));
        assert_eq!(store.status(bogus).await, Err(EngineError::UnknownHandle(bogus)));
        assert_eq!(
            store.close(SessionHandle::new(0)).await,
            Err(EngineError::UnknownHandle(SessionHandle::new(0)))
        );
    }

    #[tokio::test]
    async fn test_failed_start_registers_nothing() {
        let engine = StubEngine {
            fail_start: Some(EngineError::HandshakeFailed("no answer".into())),
            ..Default::default()
        };
        let store = store(engine);

        let result = store.open(config(1), None, &SystemConfiguration::default()).await;
        assert!(matches!(result, Err(EngineError::HandshakeFailed(_))));
        assert!(store.is_empty().await);

        // No handle was consumed
        assert_eq!(
            store.status(SessionHandle::new(1)).await,
            Err(EngineError::UnknownHandle(SessionHandle::new(1)))
        );
    }

    #[tokio::test]
    async fn test_degraded_and_down() {
        let system = SystemConfiguration::default();

        let partial = store(StubEngine {
            connected: Some(1),
            ..Default::default()
        });
        let handle = partial.open(config(3), None, &system).await.unwrap();
        assert_eq!(
            partial.status(handle).await.unwrap(),
            SessionStatus::Degraded { connected: 1, total: 3 }
        );
        assert!(partial.status(handle).await.unwrap().is_usable());

        let lost = store(StubEngine {
            connected: Some(0),
            ..Default::default()
        });
        let handle = lost.open(config(2), None, &system).await.unwrap();
        assert_eq!(lost.status(handle).await.unwrap(), SessionStatus::Down);

        let empty = store(StubEngine::default());
        let handle = empty.open(config(0), None, &system).await.unwrap();
        assert_eq!(empty.status(handle).await.unwrap(), SessionStatus::Up);
    }

    #[tokio::test]
    async fn test_close_removes_even_when_stop_fails() {
        let store = store(StubEngine {
            fail_stop: true,
            ..Default::default()
        });
        let handle = store
            .open(config(1), None, &SystemConfiguration::default())
            .await
            .unwrap();

        assert!(matches!(store.close(handle).await, Err(EngineError::Io(_))));
        assert!(store.is_empty().await);
        assert_eq!(store.close(handle).await, Err(EngineError::AlreadyClosed(handle)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_during_teardown() {
        let store = Arc::new(store(StubEngine {
            stop_delay: Duration::from_millis(300),
            ..Default::default()
        }));
        let handle = store
            .open(config(1), None, &SystemConfiguration::default())
            .await
            .unwrap();

        let closing = {
            let store = store.clone();
            tokio::spawn(async move { store.close(handle).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(store.status(handle).await.unwrap(), SessionStatus::TearingDown);
        assert_eq!(store.close(handle).await, Err(EngineError::AlreadyClosed(handle)));

        closing.await.unwrap().unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_opens_get_distinct_handles() {
        let store = Arc::new(store(StubEngine::default()));
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .open(config(1), None, &SystemConfiguration::default())
                    .await
                    .unwrap()
            }));
        }

        let mut handles = HashSet::new();
        for task in tasks {
            assert!(handles.insert(task.await.unwrap()));
        }
        assert_eq!(store.len().await, 32);
    }

    #[tokio::test]
    async fn test_shutdown_closes_all() {
        let engine = StubEngine::default();
        let stopped = engine.stopped.clone();
        let store = store(engine);
        let system = SystemConfiguration::default();
        for _ in 0..3 {
            store.open(config(1), None, &system).await.unwrap();
        }

        store.shutdown().await;
        assert!(store.is_empty().await);
        assert_eq!(stopped.load(Ordering::SeqCst), 3);
    }
}

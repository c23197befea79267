//! Contexts and the Tunnel Manager
//!
//! A [`Context`] is an isolated execution environment: its own tokio
//! runtime, session store, search path, system configuration and last
//! error. Its methods block the calling thread until the operation is done,
//! so they must not be called from inside an async runtime.
//!
//! # Usage
//!
//! ```rust,ignore
//! let manager = TunnelManager::new();
//! let ctx = manager.create_context(ContextOptions::default())?;
//! let context = manager.context(ctx)?;
//!
//! let handle = context.tunnel_up("wg0", None)?;
//! println!("{}", context.status(handle)?);
//! context.tunnel_down(handle)?;
//!
//! manager.destroy_context(ctx)?;
//! ```

use crate::config::Configuration;
use crate::engine::{TunnelEngine, WireGuardEngine};
use crate::error::{ContextError, LastError, TunnelError};
use crate::keys::PublicKey;
use crate::parser::parse;
use crate::search::{load_source, SearchPath};
use crate::session::{SessionHandle, SessionInfo, SessionStatus, SessionStore};
use crate::system::SystemConfiguration;
use crate::tunnel::TunnelStats;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::runtime::Runtime;
use tracing::{debug, info};

/// Opaque context identifier; always positive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextHandle(u64);

impl ContextHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parameters for a new context
#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    /// Runtime worker threads; the number of CPUs when unset
    pub worker_threads: Option<usize>,
    /// Used by `tunnel_up` calls that do not pass their own
    pub system: SystemConfiguration,
    /// Explicit configuration search path (platform path list)
    pub search_path: Option<String>,
}

impl ContextOptions {
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = Some(threads);
        self
    }

    pub fn with_system(mut self, system: SystemConfiguration) -> Self {
        self.system = system;
        self
    }

    pub fn with_search_path(mut self, path: impl Into<String>) -> Self {
        self.search_path = Some(path.into());
        self
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Isolated execution environment for tunnel operations
pub struct Context {
    runtime: Runtime,
    store: SessionStore,
    system: Mutex<SystemConfiguration>,
    search_path: Mutex<Option<SearchPath>>,
    /// Source string passed to `tunnel_up` -> session it opened
    active: Mutex<HashMap<String, SessionHandle>>,
    last_error: LastError,
}

impl Context {
    /// Create a context using the WireGuard engine
    pub fn new(options: ContextOptions) -> Result<Self, ContextError> {
        Self::with_engine(options, Arc::new(WireGuardEngine::new()))
    }

    /// Create a context using a specific engine
    pub fn with_engine(
        options: ContextOptions,
        engine: Arc<dyn TunnelEngine>,
    ) -> Result<Self, ContextError> {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.enable_all().thread_name("lbv-worker");
        match options.worker_threads {
            Some(0) => {
                return Err(ContextError::Unavailable(
                    "worker_threads must be at least 1".into(),
                ));
            }
            Some(n) => {
                builder.worker_threads(n);
            }
            None => {}
        }
        let runtime = builder
            .build()
            .map_err(|e| ContextError::Unavailable(e.to_string()))?;

        let search_path = options
            .search_path
            .as_deref()
            .map(SearchPath::parse)
            .transpose()?;

        Ok(Self {
            runtime,
            store: SessionStore::new(engine),
            system: Mutex::new(options.system),
            search_path: Mutex::new(search_path),
            active: Mutex::new(HashMap::new()),
            last_error: LastError::new(),
        })
    }

    /// Handle to this context's runtime, e.g. to wait for a signal
    pub fn runtime_handle(&self) -> tokio::runtime::Handle {
        self.runtime.handle().clone()
    }

    /// Bring a tunnel up from configuration text, a file, or an interface name
    pub fn tunnel_up(
        &self,
        source: &str,
        system: Option<SystemConfiguration>,
    ) -> Result<SessionHandle, TunnelError> {
        let result = self.up(source, system);
        self.last_error.record(result)
    }

    fn up(
        &self,
        source: &str,
        system: Option<SystemConfiguration>,
    ) -> Result<SessionHandle, TunnelError> {
        let search = lock(&self.search_path)
            .clone()
            .unwrap_or_else(SearchPath::from_env);
        let loaded = load_source(source, &search)?;
        let config = parse(&loaded.text)?;
        let system = system.unwrap_or_else(|| lock(&self.system).clone());

        debug!(name = ?loaded.name, peers = config.peers.len(), "Bringing tunnel up");
        let handle = self
            .runtime
            .block_on(self.store.open(config, loaded.name, &system))?;

        lock(&self.active).insert(source.to_string(), handle);
        Ok(handle)
    }

    /// Tear a tunnel down; blocks until teardown is complete
    pub fn tunnel_down(&self, handle: SessionHandle) -> Result<(), TunnelError> {
        let result = self.runtime.block_on(self.store.close(handle));
        lock(&self.active).retain(|_, h| *h != handle);
        self.last_error.record(result.map_err(TunnelError::from))
    }

    /// Tear down the tunnel brought up with the same source string
    pub fn stop(&self, source: &str) -> Result<(), TunnelError> {
        let handle = lock(&self.active).get(source).copied();
        match handle {
            Some(handle) => self.tunnel_down(handle),
            None => self.last_error.record(Err(
                ContextError::ConfigurationNotFound(source.to_string()).into(),
            )),
        }
    }

    pub fn status(&self, handle: SessionHandle) -> Result<SessionStatus, TunnelError> {
        let result = self.runtime.block_on(self.store.status(handle));
        self.last_error.record(result.map_err(TunnelError::from))
    }

    /// Peer a destination address would be routed to
    pub fn route(
        &self,
        handle: SessionHandle,
        dst: IpAddr,
    ) -> Result<Option<PublicKey>, TunnelError> {
        let result = self.runtime.block_on(self.store.route(handle, dst));
        self.last_error.record(result.map_err(TunnelError::from))
    }

    /// Configuration a live session was brought up with
    pub fn config(&self, handle: SessionHandle) -> Result<Arc<Configuration>, TunnelError> {
        let result = self.runtime.block_on(self.store.config(handle));
        self.last_error.record(result.map_err(TunnelError::from))
    }

    pub fn stats(&self, handle: SessionHandle) -> Result<TunnelStats, TunnelError> {
        let result = self.runtime.block_on(self.store.stats(handle));
        self.last_error.record(result.map_err(TunnelError::from))
    }

    /// Live sessions of this context
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.runtime.block_on(self.store.sessions());
        let _ = self.last_error.record(Ok(()));
        sessions
    }

    /// Set the directories searched for `<interface>.conf`
    pub fn set_config_search_path(&self, path: &str) -> Result<(), TunnelError> {
        let result = SearchPath::parse(path)
            .map(|parsed| {
                debug!(dirs = ?parsed.dirs(), "Configuration search path set");
                *lock(&self.search_path) = Some(parsed);
            })
            .map_err(TunnelError::from);
        self.last_error.record(result)
    }

    /// Default system configuration for later `tunnel_up` calls
    pub fn set_system_configuration(&self, system: SystemConfiguration) {
        *lock(&self.system) = system;
        let _ = self.last_error.record(Ok(()));
    }

    pub fn system_configuration(&self) -> SystemConfiguration {
        lock(&self.system).clone()
    }

    /// Code of the most recent operation (0 = success or none yet)
    pub fn get_error_code(&self) -> i32 {
        self.last_error.get()
    }

    /// Description of the most recent failure
    pub fn get_error_text(&self) -> Option<String> {
        self.last_error.message()
    }

    /// Close every session of this context
    pub fn shutdown(&self) {
        self.runtime.block_on(self.store.shutdown());
        lock(&self.active).clear();
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // block_on is not allowed from within a runtime
        if tokio::runtime::Handle::try_current().is_err() {
            self.shutdown();
        }
    }
}

/// Registry of contexts addressed by handle
pub struct TunnelManager {
    contexts: RwLock<HashMap<ContextHandle, Arc<Context>>>,
    next_handle: AtomicU64,
}

impl Default for TunnelManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelManager {
    pub fn new() -> Self {
        Self {
            contexts: RwLock::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Create a context with its own runtime
    pub fn create_context(&self, options: ContextOptions) -> Result<ContextHandle, ContextError> {
        self.insert(Context::new(options)?)
    }

    /// Create a context using a specific engine
    pub fn create_context_with_engine(
        &self,
        options: ContextOptions,
        engine: Arc<dyn TunnelEngine>,
    ) -> Result<ContextHandle, ContextError> {
        self.insert(Context::with_engine(options, engine)?)
    }

    fn insert(&self, context: Context) -> Result<ContextHandle, ContextError> {
        let handle = ContextHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.contexts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle, Arc::new(context));
        info!(context = %handle, "Context created");
        Ok(handle)
    }

    pub fn context(&self, handle: ContextHandle) -> Result<Arc<Context>, ContextError> {
        self.contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle)
            .cloned()
            .ok_or(ContextError::NoSuchContext(handle))
    }

    /// Close all sessions of a context and forget it
    pub fn destroy_context(&self, handle: ContextHandle) -> Result<(), ContextError> {
        let context = self
            .contexts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle)
            .ok_or(ContextError::NoSuchContext(handle))?;

        context.shutdown();
        info!(context = %handle, "Context destroyed");
        Ok(())
    }

    /// Last error code of a context; `NoSuchContext` for unknown handles
    pub fn get_error_code(&self, handle: ContextHandle) -> i32 {
        match self.context(handle) {
            Ok(context) => context.get_error_code(),
            Err(e) => e.code().as_i32(),
        }
    }

    pub fn len(&self) -> usize {
        self.contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

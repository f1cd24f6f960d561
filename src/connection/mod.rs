//! Pooled remote-shell connections keyed by host specification.
//!
//! The pool holds at most one live connection per [`HostSpec`]. Callers get
//! a reference-counted [`ConnectionLease`]; the connection is closed once the
//! last lease is released or dropped. Acquisition for one host is serialised
//! by a per-host gate, so no caller ever observes a connection that is still
//! being created, while other hosts proceed independently.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};

mod credentials;
mod ssh;
mod types;

pub use credentials::{IdentityFileResolver, expand_tilde};
pub use ssh::{SshConnector, SshOptions};
pub use types::{
    ConnectionError, ConnectionFuture, ConnectionState, Connector, CredentialResolver,
    Credentials, HostSpec, RemoteConnection,
};

/// Process-wide pool of remote connections.
///
/// Cloning the manager yields another handle onto the same pool.
#[derive(Clone)]
pub struct ConnectionManager {
    pool: Arc<Pool>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager").finish_non_exhaustive()
    }
}

struct Pool {
    connector: Box<dyn Connector>,
    resolver: Box<dyn CredentialResolver>,
    slots: Mutex<HashMap<HostSpec, Arc<HostSlot>>>,
    credentials: Mutex<HashMap<HostSpec, Credentials>>,
    next_generation: AtomicU64,
}

#[derive(Default)]
struct HostSlot {
    gate: tokio::sync::Mutex<()>,
    entry: Mutex<Option<PoolEntry>>,
}

struct PoolEntry {
    connection: Arc<dyn RemoteConnection>,
    generation: u64,
    refs: usize,
}

impl HostSlot {
    fn current(&self) -> Option<(Arc<dyn RemoteConnection>, u64)> {
        self.entry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|entry| (Arc::clone(&entry.connection), entry.generation))
    }

    fn retain(&self, generation: u64) -> bool {
        let mut guard = self.entry.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            Some(entry) if entry.generation == generation => {
                entry.refs += 1;
                true
            }
            _ => false,
        }
    }

    fn discard(&self, generation: u64) {
        let mut guard = self.entry.lock().unwrap_or_else(PoisonError::into_inner);
        if guard
            .as_ref()
            .is_some_and(|entry| entry.generation == generation)
            && let Some(entry) = guard.take()
        {
            entry.connection.close();
        }
    }

    fn install(&self, connection: Arc<dyn RemoteConnection>, generation: u64) {
        let previous = self
            .entry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(PoolEntry {
                connection,
                generation,
                refs: 1,
            });
        if let Some(stale) = previous {
            stale.connection.close();
        }
    }

    fn release(&self, generation: u64) -> Option<usize> {
        let mut guard = self.entry.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = guard.as_mut()?;
        if entry.generation != generation {
            return None;
        }
        entry.refs = entry.refs.saturating_sub(1);
        let remaining = entry.refs;
        if remaining == 0
            && let Some(closed) = guard.take()
        {
            closed.connection.close();
        }
        Some(remaining)
    }

    fn refs(&self) -> usize {
        self.entry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, |entry| entry.refs)
    }
}

impl Pool {
    fn slot(&self, host: &HostSpec) -> Arc<HostSlot> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(host.clone()).or_default())
    }

    fn existing_slot(&self, host: &HostSpec) -> Option<Arc<HostSlot>> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(host)
            .cloned()
    }

    fn credentials_for(&self, host: &HostSpec) -> Result<Credentials, ConnectionError> {
        let mut cache = self
            .credentials
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(found) = cache.get(host) {
            return Ok(found.clone());
        }
        let resolved = self.resolver.resolve(host)?;
        cache.insert(host.clone(), resolved.clone());
        Ok(resolved)
    }

    fn release(&self, host: &HostSpec, generation: u64) {
        let Some(slot) = self.existing_slot(host) else {
            return;
        };
        match slot.release(generation) {
            Some(0) => info!(%host, "closed pooled connection after last release"),
            Some(remaining) => debug!(%host, remaining, "released connection lease"),
            None => debug!(%host, generation, "released lease of a replaced connection"),
        }
    }
}

impl ConnectionManager {
    /// Creates a pool using the given connector and credential resolver.
    #[must_use]
    pub fn new(
        connector: impl Connector + 'static,
        resolver: impl CredentialResolver + 'static,
    ) -> Self {
        Self {
            pool: Arc::new(Pool {
                connector: Box::new(connector),
                resolver: Box::new(resolver),
                slots: Mutex::new(HashMap::new()),
                credentials: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Acquires a lease on the connection for `host`, opening one if needed.
    ///
    /// A live pooled connection is shared and its reference count bumped. A
    /// connection that fails its liveness probe is closed and replaced.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Auth`] when credentials cannot be resolved
    /// and [`ConnectionError::Connect`] when the connector fails.
    pub async fn acquire(&self, host: &HostSpec) -> Result<ConnectionLease, ConnectionError> {
        let slot = self.pool.slot(host);
        let _gate = slot.gate.lock().await;

        if let Some((connection, generation)) = slot.current() {
            if connection.is_alive().await {
                if slot.retain(generation) {
                    debug!(%host, refs = slot.refs(), "reusing pooled connection");
                    return Ok(self.lease(host, connection, generation));
                }
            } else {
                warn!(%host, "pooled connection is broken; reconnecting");
                slot.discard(generation);
            }
        }

        let credentials = self.pool.credentials_for(host)?;
        let connection = self.pool.connector.connect(host, &credentials).await?;
        let generation = self.pool.next_generation.fetch_add(1, Ordering::Relaxed);
        slot.install(Arc::clone(&connection), generation);
        info!(%host, generation, "opened new connection");

        Ok(self.lease(host, connection, generation))
    }

    /// Releases a lease explicitly; equivalent to dropping it.
    pub fn release(&self, lease: ConnectionLease) {
        lease.release();
    }

    /// Number of outstanding leases on the current connection for `host`.
    #[must_use]
    pub fn lease_count(&self, host: &HostSpec) -> usize {
        self.pool.existing_slot(host).map_or(0, |slot| slot.refs())
    }

    /// Returns `true` when a connection for `host` is currently pooled.
    #[must_use]
    pub fn is_pooled(&self, host: &HostSpec) -> bool {
        self.pool
            .existing_slot(host)
            .is_some_and(|slot| slot.current().is_some())
    }

    fn lease(
        &self,
        host: &HostSpec,
        connection: Arc<dyn RemoteConnection>,
        generation: u64,
    ) -> ConnectionLease {
        ConnectionLease {
            pool: Arc::clone(&self.pool),
            host: host.clone(),
            connection,
            generation,
            released: false,
        }
    }
}

/// Scoped ownership of one reference to a pooled connection.
///
/// The reference is returned to the pool exactly once: on
/// [`ConnectionLease::release`] or when the lease is dropped, including when
/// the owning task is aborted.
pub struct ConnectionLease {
    pool: Arc<Pool>,
    host: HostSpec,
    connection: Arc<dyn RemoteConnection>,
    generation: u64,
    released: bool,
}

impl fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("host", &self.host)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl ConnectionLease {
    /// Host this lease belongs to.
    #[must_use]
    pub const fn host(&self) -> &HostSpec {
        &self.host
    }

    /// Shared handle to the underlying connection.
    #[must_use]
    pub fn connection(&self) -> Arc<dyn RemoteConnection> {
        Arc::clone(&self.connection)
    }

    /// Probes the connection and reports its state.
    pub async fn state(&self) -> ConnectionState {
        if self.connection.is_alive().await {
            ConnectionState::Live
        } else {
            ConnectionState::Broken
        }
    }

    /// Returns the reference to the pool.
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.release(&self.host, self.generation);
        }
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.release_once();
    }
}

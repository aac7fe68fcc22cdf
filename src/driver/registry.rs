//! Resource registry: creates sessions on demand and tears them down by
//! owner, by scope, or all at once.
//!
//! Bookkeeping lives behind one `parking_lot` mutex that is never held across
//! an `.await`; sessions are detached under the lock and closed after it is
//! released.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::chain::HandleId;
use super::protocol::Protocol;
use crate::config::ConnectionConfig;
use crate::error::{DriverError, DriverResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// A live wire session, shareable across tasks.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    peer: SocketAddr,
    inner: Arc<tokio::sync::Mutex<Protocol<TcpStream>>>,
}

impl SessionHandle {
    fn new(id: SessionId, peer: SocketAddr, protocol: Protocol<TcpStream>) -> Self {
        Self {
            id,
            peer,
            inner: Arc::new(tokio::sync::Mutex::new(protocol)),
        }
    }

    /// Registry-assigned id, unique for the registry's lifetime.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Address of the server this session is connected to.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Exclusive access to the wire session.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, Protocol<TcpStream>> {
        self.inner.lock().await
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish()
    }
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionId, SessionHandle>,
    owners: HashMap<SessionId, HandleId>,
    scopes: HashMap<HandleId, HashSet<SessionId>>,
    closed: bool,
    /// Close failures not yet reported to a caller.
    release_errors: Vec<String>,
}

impl RegistryState {
    /// Remove `id` from all three maps, dropping a scope entry it empties.
    fn detach(&mut self, id: SessionId) -> Option<SessionHandle> {
        let handle = self.sessions.remove(&id)?;
        self.owners.remove(&id);
        self.scopes.retain(|_, members| {
            members.remove(&id);
            !members.is_empty()
        });
        Some(handle)
    }

    fn owned_by(&self, owner: HandleId) -> Vec<SessionId> {
        self.owners
            .iter()
            .filter(|(_, o)| **o == owner)
            .map(|(id, _)| *id)
            .collect()
    }
}

#[derive(Default)]
pub struct ResourceRegistry {
    state: Mutex<RegistryState>,
    next_id: AtomicU64,
}

impl ResourceRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open, authenticate and record a new session for `owner` under `scope`.
    pub async fn create_session(
        &self,
        owner: HandleId,
        scope: HandleId,
        config: &ConnectionConfig,
    ) -> DriverResult<SessionHandle> {
        if self.is_closed() {
            return Err(DriverError::RegistryClosed);
        }

        let addr = config.addr();
        debug!("Registry: Connecting to {} for {}", addr, owner);
        let stream = match config.connect_timeout() {
            Some(limit) => tokio::time::timeout(limit, TcpStream::connect(&addr))
                .await
                .map_err(|_| {
                    DriverError::Connect(format!("{}: timed out after {:?}", addr, limit))
                })?,
            None => TcpStream::connect(&addr).await,
        }
        .map_err(|e| DriverError::Connect(format!("{}: {}", addr, e)))?;

        let peer = configure_socket(&stream, config)
            .map_err(|e| DriverError::Connect(format!("{}: {}", addr, e)))?;

        let mut protocol = Protocol::connect(stream)?;
        protocol.set_read_timeout(config.query_timeout());
        if let Err(e) = protocol.write_credentials(&config.user, &config.password).await {
            debug!("Registry: Handshake with {} failed: {}", addr, e);
            let _ = protocol.close().await;
            return Err(DriverError::Auth(e.to_string()));
        }

        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let handle = SessionHandle::new(id, peer, protocol);

        let recorded = {
            let mut state = self.state.lock();
            if state.closed {
                false
            } else {
                state.sessions.insert(id, handle.clone());
                state.owners.insert(id, owner);
                state.scopes.entry(scope).or_default().insert(id);
                true
            }
        };

        if !recorded {
            let _ = handle.lock().await.close().await;
            return Err(DriverError::RegistryClosed);
        }

        debug!("Registry: Created {} for {} (scope {})", id, owner, scope);
        Ok(handle)
    }

    /// Release the session `owner` owns and every session in its scope.
    /// Unknown owners are a no-op.
    pub async fn release(&self, owner: HandleId) -> DriverResult<()> {
        self.release_owner(owner).await;
        self.take_release_error()
    }

    async fn release_owner(&self, owner: HandleId) {
        let detached: Vec<SessionHandle> = {
            let mut state = self.state.lock();
            let mut ids = state.owned_by(owner);
            if let Some(scoped) = state.scopes.get(&owner) {
                ids.extend(scoped.iter().copied());
            }
            ids.sort();
            ids.dedup();
            ids.into_iter().filter_map(|id| state.detach(id)).collect()
        };

        if !detached.is_empty() {
            debug!("Registry: Releasing {} session(s) for {}", detached.len(), owner);
        }
        for handle in detached {
            self.close_session(handle).await;
        }
    }

    /// Remove one session from every map, then close it.
    pub async fn release_session(&self, id: SessionId) -> DriverResult<()> {
        let detached = self.state.lock().detach(id);
        if let Some(handle) = detached {
            debug!("Registry: Releasing {}", id);
            self.close_session(handle).await;
        }
        self.take_release_error()
    }

    /// Refuse new sessions and close every remaining one.
    pub async fn close_all(&self) -> DriverResult<()> {
        self.state.lock().closed = true;

        let mut released = 0usize;
        loop {
            let next = {
                let mut state = self.state.lock();
                let id = state.sessions.keys().next().copied();
                id.and_then(|id| state.detach(id))
            };
            match next {
                Some(handle) => {
                    self.close_session(handle).await;
                    released += 1;
                }
                None => break,
            }
        }

        {
            let mut state = self.state.lock();
            state.owners.clear();
            state.scopes.clear();
        }
        info!("Registry: Closed, released {} session(s)", released);
        self.take_release_error()
    }

    /// Release every owner or scope the predicate selects.
    pub async fn release_on_external_event<F>(&self, predicate: F) -> DriverResult<()>
    where
        F: Fn(HandleId) -> bool,
    {
        let selected: Vec<HandleId> = {
            let state = self.state.lock();
            let mut handles: Vec<HandleId> = state
                .owners
                .values()
                .copied()
                .chain(state.scopes.keys().copied())
                .filter(|h| predicate(*h))
                .collect();
            handles.sort();
            handles.dedup();
            handles
        };

        for owner in selected {
            self.release_owner(owner).await;
        }
        self.take_release_error()
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Number of sessions that will be released together with `scope`.
    pub fn scope_session_count(&self, scope: HandleId) -> usize {
        self.state
            .lock()
            .scopes
            .get(&scope)
            .map_or(0, |members| members.len())
    }

    /// The handle that caused session `id` to be created.
    pub fn owner_of(&self, id: SessionId) -> Option<HandleId> {
        self.state.lock().owners.get(&id).copied()
    }

    /// The open session with this id, if the registry still tracks it.
    pub fn session(&self, id: SessionId) -> Option<SessionHandle> {
        self.state.lock().sessions.get(&id).cloned()
    }

    /// `close_all` has run; no further sessions are created.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    async fn close_session(&self, handle: SessionHandle) {
        let result = handle.lock().await.close().await;
        if let Err(e) = result {
            warn!("Registry: Failed to close {}: {}", handle.id(), e);
            self.state
                .lock()
                .release_errors
                .push(format!("{}: {}", handle.id(), e));
        }
    }

    fn take_release_error(&self) -> DriverResult<()> {
        let errors = std::mem::take(&mut self.state.lock().release_errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(DriverError::ReleaseFailed(errors.join("; ")))
        }
    }
}

#[allow(deprecated)]
fn configure_socket(stream: &TcpStream, config: &ConnectionConfig) -> std::io::Result<SocketAddr> {
    stream.set_nodelay(true)?;
    if let Some(linger) = config.linger() {
        stream.set_linger(Some(linger))?;
    }
    stream.peer_addr()
}

//! Handle ownership chain.
//!
//! Logical handles form a tree (root → query → cursor). A node either holds a
//! session, has lent it to exactly one child, or has none. A child borrows
//! its parent's session when the parent is not lending it to anyone else and
//! otherwise asks the registry for a fresh one, scoped so that releasing the
//! scope root releases it too.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::registry::{ResourceRegistry, SessionHandle, SessionId};
use super::visitor::{ResponseVisitor, Row};
use crate::config::ConnectionConfig;
use crate::error::{DriverError, DriverResult};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Root,
    Query,
    Cursor,
}

impl NodeKind {
    /// Whether sessions this node creates are scoped to its parent.
    pub fn scopes_to_parent(self) -> bool {
        matches!(self, NodeKind::Cursor)
    }

    pub fn closes_on_commit(self, hold_cursors_over_commit: bool) -> bool {
        matches!(self, NodeKind::Cursor) && !hold_cursors_over_commit
    }
}

#[derive(Debug)]
struct Node {
    kind: NodeKind,
    parent: Option<HandleId>,
    children: Vec<HandleId>,
    session: Option<SessionHandle>,
    lent_to: Option<HandleId>,
    /// The session belongs to an ancestor.
    borrowed: bool,
    closed: bool,
    /// Its owning handle was dropped without closing it.
    abandoned: bool,
}

impl Node {
    fn new(kind: NodeKind, parent: Option<HandleId>) -> Self {
        Self {
            kind,
            parent,
            children: Vec::new(),
            session: None,
            lent_to: None,
            borrowed: false,
            closed: false,
            abandoned: false,
        }
    }

    fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id())
    }

    fn can_lend(&self) -> bool {
        !self.closed && self.lent_to.is_none()
    }

    fn is_idle(&self) -> bool {
        self.session.is_none() && self.lent_to.is_none() && self.children.is_empty()
    }
}

enum Plan {
    Held(SessionHandle),
    Borrow(HandleId),
    Create { scope: HandleId },
}

/// Visitor that asks the session to abandon whatever is left of a response.
struct Abandon;

impl ResponseVisitor for Abandon {
    fn on_row(&mut self, _row: Row) -> bool {
        true
    }

    fn is_cancelled(&self) -> bool {
        true
    }
}

pub struct HandleChain {
    nodes: Mutex<HashMap<HandleId, Node>>,
    next_id: AtomicU64,
    registry: Arc<ResourceRegistry>,
    config: ConnectionConfig,
}

impl HandleChain {
    /// An empty chain creating its sessions through `registry`.
    pub fn new(registry: Arc<ResourceRegistry>, config: ConnectionConfig) -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            registry,
            config,
        }
    }

    /// The registry that owns every session this chain hands out.
    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    /// Settings used when a node needs a fresh session.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    fn allocate(&self) -> HandleId {
        HandleId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Add a parentless node.
    pub fn open_root(&self) -> HandleId {
        let id = self.allocate();
        self.nodes.lock().insert(id, Node::new(NodeKind::Root, None));
        id
    }

    /// Add a node under `parent`. Fails once `parent` is closed.
    pub fn open_child(&self, parent: HandleId, kind: NodeKind) -> DriverResult<HandleId> {
        let id = self.allocate();
        let mut nodes = self.nodes.lock();
        match nodes.get_mut(&parent) {
            Some(p) if !p.closed => p.children.push(id),
            _ => return Err(DriverError::HandleClosed),
        }
        nodes.insert(id, Node::new(kind, Some(parent)));
        Ok(id)
    }

    /// The session `id` may use now, borrowing or creating one if needed.
    pub async fn acquire_session(&self, id: HandleId) -> DriverResult<SessionHandle> {
        self.reclaim_abandoned().await;
        self.acquire_boxed(id).await
    }

    fn acquire_boxed(&self, id: HandleId) -> BoxFuture<'_, DriverResult<SessionHandle>> {
        Box::pin(async move {
            let plan = {
                let nodes = self.nodes.lock();
                let node = nodes.get(&id).ok_or(DriverError::HandleClosed)?;
                if node.closed {
                    return Err(DriverError::HandleClosed);
                }
                if node.lent_to.is_some() {
                    return Err(DriverError::SessionLent);
                }
                match (&node.session, node.parent) {
                    (Some(session), _) => Plan::Held(session.clone()),
                    (None, Some(p)) if nodes.get(&p).is_some_and(Node::can_lend) => Plan::Borrow(p),
                    (None, parent) => Plan::Create {
                        scope: match parent {
                            Some(p) if node.kind.scopes_to_parent() => p,
                            _ => id,
                        },
                    },
                }
            };

            match plan {
                Plan::Held(session) => Ok(session),
                Plan::Borrow(parent) => self.borrow_from(id, parent).await,
                Plan::Create { scope } => self.create_for(id, scope).await,
            }
        })
    }

    async fn borrow_from(&self, id: HandleId, parent: HandleId) -> DriverResult<SessionHandle> {
        let session = self.acquire_boxed(parent).await?;

        let lent = {
            let mut nodes = self.nodes.lock();
            let parent_ok = nodes.get(&parent).is_some_and(|p| {
                p.can_lend() && p.session_id() == Some(session.id())
            });
            let child_ok = nodes
                .get(&id)
                .is_some_and(|n| !n.closed && n.session.is_none() && n.lent_to.is_none());
            if parent_ok && child_ok {
                if let Some(p) = nodes.get_mut(&parent) {
                    p.lent_to = Some(id);
                }
                if let Some(n) = nodes.get_mut(&id) {
                    n.session = Some(session.clone());
                    n.borrowed = true;
                }
            }
            parent_ok && child_ok
        };

        if !lent {
            // Lost a race with another acquire; plan again.
            return self.acquire_boxed(id).await;
        }
        debug!("Chain: {} lends {} to {}", parent, session.id(), id);
        Ok(session)
    }

    async fn create_for(&self, id: HandleId, scope: HandleId) -> DriverResult<SessionHandle> {
        let session = self.registry.create_session(id, scope, &self.config).await?;

        let stored = {
            let mut nodes = self.nodes.lock();
            match nodes.get_mut(&id) {
                Some(n) if !n.closed && n.session.is_none() => {
                    n.session = Some(session.clone());
                    n.borrowed = false;
                    true
                }
                _ => false,
            }
        };

        if !stored {
            self.registry.release_session(session.id()).await?;
            return self.acquire_boxed(id).await;
        }
        Ok(session)
    }

    /// Release borrowers first, then everything the registry holds for `id`.
    pub async fn release(&self, id: HandleId) -> DriverResult<()> {
        self.release_boxed(id).await
    }

    fn release_boxed(&self, id: HandleId) -> BoxFuture<'_, DriverResult<()>> {
        Box::pin(async move {
            let mut first_err = None;

            let borrower = self.nodes.lock().get(&id).and_then(|n| n.lent_to);
            if let Some(borrower) = borrower {
                if let Err(e) = self.release_boxed(borrower).await {
                    first_err.get_or_insert(e);
                }
            }

            let borrowed = {
                let nodes = self.nodes.lock();
                let session = nodes
                    .get(&id)
                    .filter(|n| n.borrowed)
                    .and_then(|n| n.session.clone());
                session
            };
            let mut broken = None;
            if let Some(session) = &borrowed {
                if !settle(session).await {
                    broken = Some(session.id());
                }
            }

            if let Err(e) = self.registry.release(id).await {
                first_err.get_or_insert(e);
            }

            {
                let mut nodes = self.nodes.lock();
                let detached = nodes.get_mut(&id).map(|n| {
                    let was_borrowed = n.borrowed;
                    n.session = None;
                    n.borrowed = false;
                    n.lent_to = None;
                    (was_borrowed, n.parent)
                });
                if let Some((true, Some(parent))) = detached {
                    if let Some(p) = nodes.get_mut(&parent) {
                        if p.lent_to == Some(id) {
                            p.lent_to = None;
                            debug!("Chain: {} returned session to {}", id, parent);
                        }
                    }
                }
            }

            if let Some(sid) = broken {
                if let Err(e) = self.discard_by_id(sid).await {
                    first_err.get_or_insert(e);
                }
            }
            self.sweep();

            first_err.map_or(Ok(()), Err)
        })
    }

    /// Idempotent. Closes children first, then releases `id` once.
    pub async fn close(&self, id: HandleId) -> DriverResult<()> {
        self.close_boxed(id).await
    }

    fn close_boxed(&self, id: HandleId) -> BoxFuture<'_, DriverResult<()>> {
        Box::pin(async move {
            let children = {
                let mut nodes = self.nodes.lock();
                match nodes.get_mut(&id) {
                    Some(n) if !n.closed => {
                        n.closed = true;
                        n.children.clone()
                    }
                    _ => return Ok(()),
                }
            };

            let mut first_err = None;
            for child in children {
                if let Err(e) = self.close_boxed(child).await {
                    first_err.get_or_insert(e);
                }
            }
            if let Err(e) = self.release_boxed(id).await {
                first_err.get_or_insert(e);
            }

            {
                let mut nodes = self.nodes.lock();
                if let Some(node) = nodes.remove(&id) {
                    if let Some(p) = node.parent.and_then(|p| nodes.get_mut(&p)) {
                        p.children.retain(|c| *c != id);
                    }
                }
            }
            debug!("Chain: Closed {}", id);

            first_err.map_or(Ok(()), Err)
        })
    }

    /// Mark `id` as dropped by its owner. A node holding nothing is removed
    /// at once; anything else is closed by the next [`acquire_session`].
    ///
    /// [`acquire_session`]: Self::acquire_session
    pub fn abandon(&self, id: HandleId) {
        let mut nodes = self.nodes.lock();
        let idle = match nodes.get_mut(&id) {
            Some(n) if !n.closed => {
                n.abandoned = true;
                n.is_idle()
            }
            _ => return,
        };
        if idle {
            if let Some(node) = nodes.remove(&id) {
                if let Some(p) = node.parent.and_then(|p| nodes.get_mut(&p)) {
                    p.children.retain(|c| *c != id);
                }
            }
            debug!("Chain: Dropped idle {}", id);
        }
    }

    /// Close abandoned nodes. An abandoned cursor also returns its query's
    /// session, the way an explicit cursor close does.
    async fn reclaim_abandoned(&self) {
        let abandoned: Vec<(HandleId, NodeKind, Option<HandleId>)> = self
            .nodes
            .lock()
            .iter()
            .filter(|(_, n)| n.abandoned && !n.closed)
            .map(|(id, n)| (*id, n.kind, n.parent))
            .collect();

        for (id, kind, parent) in abandoned {
            debug!("Chain: Reclaiming abandoned {}", id);
            if let Err(e) = self.close_boxed(id).await {
                warn!("Chain: Reclaiming {}: {}", id, e);
            }
            if let (NodeKind::Cursor, Some(parent)) = (kind, parent) {
                if let Err(e) = self.release_boxed(parent).await {
                    warn!("Chain: Reclaiming {}: {}", parent, e);
                }
            }
        }
    }

    /// The node's session is not lent out.
    pub fn is_session_available(&self, id: HandleId) -> bool {
        self.nodes.lock().get(&id).is_some_and(Node::can_lend)
    }

    /// The session `id` may use right now, if it holds one.
    pub fn held_session(&self, id: HandleId) -> Option<SessionHandle> {
        let nodes = self.nodes.lock();
        let session = nodes
            .get(&id)
            .filter(|n| n.can_lend())
            .and_then(|n| n.session.clone());
        session
    }

    /// Tear down the session `id` uses, wherever the chain references it.
    pub async fn discard_session(&self, id: HandleId) -> DriverResult<()> {
        let sid = self.nodes.lock().get(&id).and_then(Node::session_id);
        match sid {
            Some(sid) => self.discard_by_id(sid).await,
            None => Ok(()),
        }
    }

    async fn discard_by_id(&self, sid: SessionId) -> DriverResult<()> {
        {
            let mut nodes = self.nodes.lock();
            for node in nodes.values_mut() {
                if node.session_id() == Some(sid) {
                    node.session = None;
                    node.borrowed = false;
                    node.lent_to = None;
                }
            }
        }
        warn!("Chain: Discarding {}", sid);
        self.registry.release_session(sid).await
    }

    /// Close every node whose kind does not survive a commit.
    pub async fn on_commit(&self) -> DriverResult<()> {
        let hold = self.config.hold_cursors_over_commit;
        let victims: HashSet<HandleId> = self
            .nodes
            .lock()
            .iter()
            .filter(|(_, n)| !n.closed && n.kind.closes_on_commit(hold))
            .map(|(id, _)| *id)
            .collect();
        if victims.is_empty() {
            return Ok(());
        }
        debug!("Chain: Commit closes {} handle(s)", victims.len());

        let mut first_err = self
            .registry
            .release_on_external_event(|h| victims.contains(&h))
            .await
            .err();
        for id in victims {
            if let Err(e) = self.close(id).await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Forget sessions the registry no longer tracks.
    fn sweep(&self) {
        let mut nodes = self.nodes.lock();
        let stale: Vec<HandleId> = nodes
            .iter()
            .filter(|(_, n)| {
                n.session
                    .as_ref()
                    .is_some_and(|s| !n.borrowed && self.registry.session(s.id()).is_none())
            })
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            let sid = nodes.get(&id).and_then(Node::session_id);
            for node in nodes.values_mut() {
                if sid.is_some() && node.session_id() == sid {
                    node.session = None;
                    node.borrowed = false;
                    node.lent_to = None;
                }
            }
        }
    }

    /// The node exists and has not finished closing.
    pub fn contains(&self, id: HandleId) -> bool {
        self.nodes.lock().contains_key(&id)
    }

    /// The node's kind.
    pub fn kind_of(&self, id: HandleId) -> Option<NodeKind> {
        self.nodes.lock().get(&id).map(|n| n.kind)
    }

    /// The node `id` was opened under.
    pub fn parent_of(&self, id: HandleId) -> Option<HandleId> {
        self.nodes.lock().get(&id).and_then(|n| n.parent)
    }

    /// The child currently borrowing this node's session.
    pub fn lent_to(&self, id: HandleId) -> Option<HandleId> {
        self.nodes.lock().get(&id).and_then(|n| n.lent_to)
    }

    /// Live nodes, abandoned ones included until they are reclaimed.
    pub fn node_count(&self) -> usize {
        self.nodes.lock().len()
    }
}

/// Leave `session` ready for its lender. Returns `false` if it is unusable.
async fn settle(session: &SessionHandle) -> bool {
    let mut protocol = session.lock().await;
    if protocol.is_closed() || protocol.is_broken() {
        return false;
    }
    if !protocol.is_mid_exchange() {
        return true;
    }
    match protocol.stream_response(&mut Abandon).await {
        Ok(_) | Err(DriverError::Cancelled) | Err(DriverError::Remote(_)) => {
            !protocol.is_broken() && !protocol.is_mid_exchange()
        }
        Err(_) => false,
    }
}

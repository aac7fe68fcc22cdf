//! Application-facing handles: [`Connection`], [`Statement`], [`Cursor`].
//!
//! Each handle is a node in the connection's [`HandleChain`]; the chain
//! decides which physical session a handle runs on.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use rowlink_core::{Directive, Outcome, ScalarType};
use tracing::{debug, info, warn};

use super::chain::{HandleChain, HandleId, NodeKind};
use super::protocol::Classifier;
use super::registry::{ResourceRegistry, SessionHandle};
use super::visitor::{CancelHandle, NoResources, ResourceProvider, ResponseVisitor, Row};
use crate::config::ConnectionConfig;
use crate::error::{DriverError, DriverResult};

/// A logical connection. Owns its registry; every statement and cursor it
/// creates shares the root's session whenever that session is free.
pub struct Connection {
    chain: Arc<HandleChain>,
    root: HandleId,
}

impl Connection {
    /// Open the root session and authenticate.
    pub async fn connect(config: ConnectionConfig) -> DriverResult<Self> {
        let addr = config.addr();
        let registry = Arc::new(ResourceRegistry::new());
        let chain = Arc::new(HandleChain::new(registry, config));
        let root = chain.open_root();

        if let Err(e) = chain.acquire_session(root).await {
            let _ = chain.close(root).await;
            return Err(e);
        }
        info!("Connected to {}", addr);
        Ok(Self { chain, root })
    }

    /// A new statement that borrows this connection's session while it runs.
    pub fn create_statement(&self) -> DriverResult<Statement> {
        let id = self.chain.open_child(self.root, NodeKind::Query)?;
        Ok(Statement {
            chain: self.chain.clone(),
            id,
            cancel: CancelHandle::new(),
            resources: Arc::new(NoResources),
        })
    }

    /// Close cursors that do not survive a commit and return their sessions.
    pub async fn commit(&self) -> DriverResult<()> {
        self.chain.on_commit().await
    }

    /// Close every handle, then every remaining socket.
    pub async fn close(&self) -> DriverResult<()> {
        let closed = self.chain.close(self.root).await;
        let released = self.chain.registry().close_all().await;
        info!("Connection closed");
        closed.and(released)
    }

    /// The connection's node in the handle chain.
    pub fn root(&self) -> HandleId {
        self.root
    }

    /// Handle chain shared by this connection's statements and cursors.
    pub fn chain(&self) -> &Arc<HandleChain> {
        &self.chain
    }

    /// Physical sockets currently open for this connection.
    pub fn session_count(&self) -> usize {
        self.chain.registry().session_count()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("root", &self.root)
            .field("sessions", &self.session_count())
            .finish()
    }
}

/// What a request turned out to be.
#[derive(Debug)]
pub enum Execution {
    Rows(Cursor),
    Update { count: i32, ids: Vec<i32> },
    Command,
}

impl Execution {
    /// Rows affected, for an update.
    pub fn update_count(&self) -> Option<i32> {
        match self {
            Execution::Update { count, .. } => Some(*count),
            _ => None,
        }
    }

    /// The row cursor, for a query.
    pub fn into_cursor(self) -> Option<Cursor> {
        match self {
            Execution::Rows(cursor) => Some(cursor),
            _ => None,
        }
    }
}

/// Collects whatever one `stream_response` call delivers.
struct Batch {
    cancel: CancelHandle,
    resources: Arc<dyn ResourceProvider>,
    types: Option<Vec<ScalarType>>,
    names: Option<Vec<String>>,
    rows: Vec<Row>,
    /// One entry per INT or INT_ARRAY frame.
    ints: Vec<Vec<i32>>,
    yield_per_row: bool,
}

impl Batch {
    fn new(cancel: CancelHandle, resources: Arc<dyn ResourceProvider>, yield_per_row: bool) -> Self {
        Self {
            cancel,
            resources,
            types: None,
            names: None,
            rows: Vec::new(),
            ints: Vec::new(),
            yield_per_row,
        }
    }
}

impl ResponseVisitor for Batch {
    fn on_header(&mut self, types: &[ScalarType]) -> bool {
        self.types = Some(types.to_vec());
        true
    }

    fn on_header_names(&mut self, names: &[String]) -> bool {
        self.names = Some(names.to_vec());
        true
    }

    fn on_row(&mut self, row: Row) -> bool {
        self.rows.push(row);
        !self.yield_per_row
    }

    fn on_ints(&mut self, values: &[i32]) -> bool {
        self.ints.push(values.to_vec());
        true
    }

    fn on_resource_demand(&mut self, name: &str) -> Bytes {
        self.resources.resource(name).unwrap_or_default()
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A request handle. Borrows the connection's session while a request runs
/// and returns it once the response (or its cursor) is finished. Dropping it
/// closes any cursor it still has open.
pub struct Statement {
    chain: Arc<HandleChain>,
    id: HandleId,
    cancel: CancelHandle,
    resources: Arc<dyn ResourceProvider>,
}

impl Statement {
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Answers the server's resource demands during this statement's requests.
    pub fn set_resources(&mut self, resources: Arc<dyn ResourceProvider>) {
        self.resources = resources;
    }

    /// Signal shared with this statement's requests and cursors.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Send `request` and start reading its response. Fails with
    /// `SessionLent` while a cursor from the previous request is still open.
    pub async fn execute(&self, request: &str) -> DriverResult<Execution> {
        self.run(request, Directive::Proceed).await
    }

    /// Like [`execute`](Self::execute), asking for generated ids on updates.
    pub async fn execute_with_ids(&self, request: &str) -> DriverResult<Execution> {
        self.run(request, Directive::ProceedWithIds).await
    }

    async fn run(&self, request: &str, on_update: Directive) -> DriverResult<Execution> {
        self.cancel.reset();
        let (session, outcome) = self.begin(request, on_update).await?;

        let outcome = match outcome {
            Some(outcome) => outcome,
            None => {
                self.chain.release(self.id).await?;
                return Err(DriverError::Cancelled);
            }
        };
        debug!("{}: {} accepted as {}", self.id, request_preview(request), outcome.name());

        match outcome {
            Outcome::Query => {
                let cursor = Cursor::open(self, session).await?;
                Ok(Execution::Rows(cursor))
            }
            Outcome::Update | Outcome::Command => {
                let mut batch = Batch::new(self.cancel.clone(), self.resources.clone(), false);
                drive_to_end(&self.chain, self.id, &session, &mut batch).await?;
                self.chain.release(self.id).await?;

                if outcome == Outcome::Command {
                    return Ok(Execution::Command);
                }
                let mut groups = batch.ints.into_iter();
                let count = groups.next().and_then(|g| g.first().copied()).unwrap_or(0);
                let ids = groups.flatten().collect();
                Ok(Execution::Update { count, ids })
            }
        }
    }

    /// Acquire a session and start the exchange, retrying once on a fresh
    /// session when the first attempt hits an I/O failure. `None` means the
    /// exchange was cancelled at the outcome.
    async fn begin(
        &self,
        request: &str,
        on_update: Directive,
    ) -> DriverResult<(SessionHandle, Option<Outcome>)> {
        let mut retried = false;
        loop {
            let session = self.chain.acquire_session(self.id).await?;

            let mut seen = None;
            let begun = {
                let cancel = self.cancel.clone();
                let mut classify = |outcome: Outcome| {
                    seen = Some(outcome);
                    if cancel.is_cancelled() {
                        Directive::Cancel
                    } else if outcome == Outcome::Update {
                        on_update
                    } else {
                        Directive::Proceed
                    }
                };
                let classifier: Classifier<'_> = &mut classify;
                let mut protocol = session.lock().await;
                protocol.begin_exchange(request, Some(classifier)).await
            };

            match begun {
                Ok(true) => return Ok((session, seen)),
                Ok(false) => return Ok((session, None)),
                Err(e) if e.is_transient() && !retried => {
                    warn!("{}: {} on {}, retrying on a fresh session", self.id, e, session.id());
                    retried = true;
                    if let Err(e) = self.chain.discard_session(self.id).await {
                        warn!("{}: {}", self.id, e);
                    }
                }
                Err(e) => {
                    if e.is_fatal() {
                        let _ = self.chain.discard_session(self.id).await;
                    }
                    let _ = self.chain.release(self.id).await;
                    return Err(e);
                }
            }
        }
    }

    /// Close this statement and any cursor it still has open.
    pub async fn close(&self) -> DriverResult<()> {
        self.chain.close(self.id).await
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        self.chain.abandon(self.id);
    }
}

impl fmt::Debug for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Statement").field("id", &self.id).finish()
    }
}

/// Stream the rest of a response, discarding the session on fatal errors
/// and releasing `owner` on any error.
async fn drive_to_end(
    chain: &HandleChain,
    owner: HandleId,
    session: &SessionHandle,
    batch: &mut Batch,
) -> DriverResult<()> {
    loop {
        let streamed = session.lock().await.stream_response(&mut *batch).await;
        match streamed {
            Ok(true) => return Ok(()),
            Ok(false) => continue,
            Err(e) => {
                if e.is_fatal() {
                    let _ = chain.discard_session(owner).await;
                }
                let _ = chain.release(owner).await;
                return Err(e);
            }
        }
    }
}

fn request_preview(request: &str) -> String {
    const MAX: usize = 60;
    match request.char_indices().nth(MAX) {
        Some((cut, _)) => format!("'{}…'", &request[..cut]),
        None => format!("'{}'", request),
    }
}

/// Pull-based row reader over a query's response.
pub struct Cursor {
    chain: Arc<HandleChain>,
    id: HandleId,
    statement: HandleId,
    session: SessionHandle,
    cancel: CancelHandle,
    resources: Arc<dyn ResourceProvider>,
    types: Vec<ScalarType>,
    names: Vec<String>,
    buffered: VecDeque<Row>,
    finished: bool,
    closed: bool,
}

impl Cursor {
    async fn open(statement: &Statement, session: SessionHandle) -> DriverResult<Self> {
        let chain = statement.chain.clone();
        let id = match chain.open_child(statement.id, NodeKind::Cursor) {
            Ok(id) => id,
            Err(e) => {
                let _ = chain.release(statement.id).await;
                return Err(e);
            }
        };

        // The statement's session carries the open exchange; hand it down.
        let borrowed = match chain.acquire_session(id).await {
            Ok(borrowed) => borrowed,
            Err(e) => {
                let _ = chain.close(id).await;
                let _ = chain.release(statement.id).await;
                return Err(e);
            }
        };
        if borrowed.id() != session.id() {
            let _ = chain.close(id).await;
            let _ = chain.release(statement.id).await;
            return Err(DriverError::Protocol(format!(
                "cursor got {} instead of {}",
                borrowed.id(),
                session.id()
            )));
        }

        let mut cursor = Self {
            chain,
            id,
            statement: statement.id,
            session,
            cancel: statement.cancel.clone(),
            resources: statement.resources.clone(),
            types: Vec::new(),
            names: Vec::new(),
            buffered: VecDeque::new(),
            finished: false,
            closed: false,
        };
        // Read metadata and the first row so columns are known up front.
        cursor.fetch().await?;
        Ok(cursor)
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Column types from the result header.
    pub fn column_types(&self) -> &[ScalarType] {
        &self.types
    }

    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    /// Every row has been read from the wire.
    pub fn is_exhausted(&self) -> bool {
        self.finished
    }

    /// The next row, reading from the wire when nothing is buffered.
    /// `None` once the response is exhausted or the cursor is closed.
    pub async fn next_row(&mut self) -> DriverResult<Option<Row>> {
        if let Some(row) = self.buffered.pop_front() {
            return Ok(Some(row));
        }
        if self.finished || self.closed {
            return Ok(None);
        }
        if !self.chain.contains(self.id) {
            self.closed = true;
            let _ = self.chain.release(self.statement).await;
            return Err(DriverError::HandleClosed);
        }
        self.fetch().await?;
        Ok(self.buffered.pop_front())
    }

    /// Read the remaining rows.
    pub async fn collect_rows(&mut self) -> DriverResult<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Abandon the rest of the response and return the session.
    pub async fn close(&mut self) -> DriverResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.buffered.clear();
        let closed = self.chain.close(self.id).await;
        let released = self.chain.release(self.statement).await;
        closed.and(released)
    }

    async fn fetch(&mut self) -> DriverResult<()> {
        let mut batch = Batch::new(self.cancel.clone(), self.resources.clone(), true);
        let result = loop {
            let streamed = self.session.lock().await.stream_response(&mut batch).await;
            match streamed {
                Ok(true) => break Ok(true),
                Ok(false) if batch.rows.is_empty() => continue,
                Ok(false) => break Ok(false),
                Err(e) => break Err(e),
            }
        };

        if let Some(types) = batch.types.take() {
            self.types = types;
        }
        if let Some(names) = batch.names.take() {
            self.names = names;
        }
        self.buffered.extend(batch.rows);

        match result {
            Ok(false) => Ok(()),
            Ok(true) => {
                self.finished = true;
                debug!("{}: exhausted", self.id);
                self.finish().await
            }
            Err(e) => {
                self.finished = true;
                self.buffered.clear();
                if e.is_fatal() {
                    let _ = self.chain.discard_session(self.id).await;
                }
                let _ = self.finish().await;
                Err(e)
            }
        }
    }

    async fn finish(&mut self) -> DriverResult<()> {
        self.closed = true;
        let closed = self.chain.close(self.id).await;
        let released = self.chain.release(self.statement).await;
        closed.and(released)
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if !self.closed {
            debug!("{}: dropped while open", self.id);
            self.chain.abandon(self.id);
        }
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("id", &self.id)
            .field("session", &self.session.id())
            .field("columns", &self.names)
            .field("buffered", &self.buffered.len())
            .field("finished", &self.finished)
            .finish()
    }
}

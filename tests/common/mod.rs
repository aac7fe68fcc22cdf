//! Common test utilities for rowlink tests
//!
//! Provides:
//! - Frame and row builders for scripted server responses
//! - An in-memory peer over `tokio::io::duplex`
//! - A scripted TCP server speaking the server side of the protocol

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use rowlink::ConnectionConfig;
use rowlink_core::{
    decode_frame, encode_header, Directive, Frame, FrameType, Outcome, Payload, ScalarType, Value,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

// ============================================================================
// Frame builders
// ============================================================================

pub fn frames(list: &[Frame]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    for frame in list {
        frame.encode(&mut buf).unwrap();
    }
    buf.to_vec()
}

pub fn header(types: &[ScalarType]) -> Frame {
    Frame::bytes(FrameType::Header, encode_header(types))
}

pub fn names(list: &[&str]) -> Frame {
    Frame::texts(FrameType::HeaderNames, list)
}

pub fn eor() -> Frame {
    Frame::empty(FrameType::EndOfResponse)
}

pub fn exception(message: &str) -> Frame {
    Frame::text(FrameType::Exception, message)
}

/// A RESULT frame: tag, then each value encoded as its column type.
pub fn row(types: &[ScalarType], values: &[Value]) -> Vec<u8> {
    assert_eq!(types.len(), values.len());
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[FrameType::Result.id()]);
    for (ty, value) in types.iter().zip(values) {
        ty.encode(value, &mut buf).unwrap();
    }
    buf.to_vec()
}

/// Header, names, one RESULT per row, END_OF_RESPONSE.
pub fn result_set(types: &[ScalarType], column_names: &[&str], rows: &[Vec<Value>]) -> Vec<u8> {
    let mut out = frames(&[header(types), names(column_names)]);
    for values in rows {
        out.extend(row(types, values));
    }
    out.extend(frames(&[eor()]));
    out
}

pub fn int_rows(n: usize) -> Vec<Vec<Value>> {
    (0..n as i32).map(|i| vec![Value::Int(i)]).collect()
}

// ============================================================================
// What the client sent
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientItem {
    Frame(Frame),
    Directive(Directive),
}

impl ClientItem {
    pub fn kind(&self) -> Option<FrameType> {
        match self {
            ClientItem::Frame(f) => Some(f.kind),
            ClientItem::Directive(_) => None,
        }
    }
}

/// Split everything a client wrote into frames and directive tags.
pub fn parse_client_bytes(bytes: &[u8]) -> Vec<ClientItem> {
    let mut buf = Bytes::copy_from_slice(bytes);
    let mut items = Vec::new();
    while buf.has_remaining() {
        if let Some(d) = Directive::find(buf[0]) {
            buf.advance(1);
            items.push(ClientItem::Directive(d));
        } else {
            items.push(ClientItem::Frame(decode_frame(&mut buf).unwrap()));
        }
    }
    items
}

/// Read one item the client sent, as a server would.
pub async fn read_client_item<R>(reader: &mut R) -> std::io::Result<ClientItem>
where
    R: AsyncRead + Unpin,
{
    let tag = reader.read_u8().await?;
    if let Some(d) = Directive::find(tag) {
        return Ok(ClientItem::Directive(d));
    }
    let kind = FrameType::find(tag).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, format!("tag 0x{tag:02x}"))
    })?;

    let spec = kind.spec();
    let mut raw = BytesMut::new();
    raw.extend_from_slice(&[tag]);
    let count = if spec.chunked {
        let count = reader.read_u32().await?;
        raw.extend_from_slice(&count.to_be_bytes());
        count as usize
    } else if spec.has_payload() {
        1
    } else {
        0
    };
    for _ in 0..count {
        let len = match spec.payload {
            Payload::Fixed(width) => width,
            Payload::Variable => {
                let len = reader.read_u32().await?;
                raw.extend_from_slice(&len.to_be_bytes());
                len as usize
            }
            Payload::Absent => 0,
        };
        let mut element = vec![0u8; len];
        reader.read_exact(&mut element).await?;
        raw.extend_from_slice(&element);
    }
    let frame = decode_frame(&mut raw.freeze())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    Ok(ClientItem::Frame(frame))
}

/// Poll `check` until it holds, failing the test after two seconds.
pub async fn eventually<F>(what: &str, check: F)
where
    F: Fn() -> bool,
{
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

// ============================================================================
// In-memory peer
// ============================================================================

pub fn pair() -> (DuplexStream, DuplexStream) {
    tokio::io::duplex(1 << 20)
}

/// Write `script` to the client, then collect everything the client sends
/// until it closes its side.
pub fn spawn_peer(mut server: DuplexStream, script: Vec<u8>) -> JoinHandle<Vec<u8>> {
    tokio::spawn(async move {
        server.write_all(&script).await.unwrap();
        let mut received = Vec::new();
        let _ = server.read_to_end(&mut received).await;
        received
    })
}

// ============================================================================
// Scripted TCP server
// ============================================================================

#[derive(Debug, Clone)]
pub enum Step {
    Send(Vec<u8>),
    /// Read one frame from the client (a RESOURCE answer).
    Receive,
    /// Only sent when the client asked for generated ids.
    IdsIfRequested(Vec<i32>),
    Sleep(Duration),
}

#[derive(Debug, Clone)]
pub struct Script {
    /// `None` sends the steps in place of an outcome.
    pub outcome: Option<Outcome>,
    pub steps: Vec<Step>,
    /// Sent after a CANCEL directive.
    pub on_cancel: Vec<u8>,
}

impl Script {
    pub fn query(types: &[ScalarType], column_names: &[&str], rows: &[Vec<Value>]) -> Self {
        Self {
            outcome: Some(Outcome::Query),
            steps: vec![Step::Send(result_set(types, column_names, rows))],
            on_cancel: frames(&[eor()]),
        }
    }

    pub fn update(count: i32, ids: Vec<i32>) -> Self {
        Self {
            outcome: Some(Outcome::Update),
            steps: vec![
                Step::Send(frames(&[Frame::int(count)])),
                Step::IdsIfRequested(ids),
                Step::Send(frames(&[eor()])),
            ],
            on_cancel: frames(&[eor()]),
        }
    }

    pub fn command() -> Self {
        Self {
            outcome: Some(Outcome::Command),
            steps: vec![Step::Send(frames(&[eor()]))],
            on_cancel: frames(&[eor()]),
        }
    }

    pub fn rejected(message: &str) -> Self {
        Self {
            outcome: None,
            steps: vec![Step::Send(frames(&[exception(message)]))],
            on_cancel: Vec::new(),
        }
    }

    pub fn stalled(outcome: Outcome, pause: Duration) -> Self {
        Self {
            outcome: Some(outcome),
            steps: vec![Step::Sleep(pause), Step::Send(frames(&[eor()]))],
            on_cancel: frames(&[eor()]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Credentials { user: String, password: String },
    Message(String),
    Directive(Directive),
    Resource(Bytes),
    Cancel,
    Closed,
}

#[derive(Default)]
struct ServerState {
    scripts: Mutex<HashMap<String, Script>>,
    events: Mutex<Vec<Event>>,
    accepted: AtomicUsize,
    drop_next_message: AtomicBool,
}

pub struct MockServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(ServerState::default());

        let accept_state = state.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_state.accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, accept_state.clone()));
            }
        });

        Self { addr, state, task }
    }

    pub fn config(&self) -> ConnectionConfig {
        ConnectionConfig::new("127.0.0.1", self.addr.port())
            .credentials("tester", "secret")
            .connect_timeout_ms(2_000)
    }

    /// Respond to `request` with `script`. Unknown requests get a COMMAND.
    pub fn on(&self, request: &str, script: Script) {
        self.state.scripts.lock().insert(request.to_string(), script);
    }

    /// Close the connection that receives the next MESSAGE without replying.
    pub fn drop_next_message(&self) {
        self.state.drop_next_message.store(true, Ordering::SeqCst);
    }

    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.events.lock().clone()
    }

    pub fn count(&self, wanted: &Event) -> usize {
        self.state.events.lock().iter().filter(|e| *e == wanted).count()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(mut stream: TcpStream, state: Arc<ServerState>) {
    let record = |event: Event| state.events.lock().push(event);

    loop {
        let item = match read_client_item(&mut stream).await {
            Ok(item) => item,
            Err(_) => {
                record(Event::Closed);
                return;
            }
        };

        let frame = match item {
            ClientItem::Frame(frame) => frame,
            ClientItem::Directive(d) => {
                record(Event::Directive(d));
                continue;
            }
        };

        match frame.kind {
            FrameType::Credentials => {
                let parts = frame.as_texts().unwrap();
                record(Event::Credentials {
                    user: parts[0].clone(),
                    password: parts[1].clone(),
                });
            }
            FrameType::Cancel => record(Event::Cancel),
            FrameType::Resource => record(Event::Resource(frame.scalar().unwrap().clone())),
            FrameType::Message => {
                let text = frame.as_text().unwrap();
                record(Event::Message(text.clone()));
                if state.drop_next_message.swap(false, Ordering::SeqCst) {
                    return;
                }
                let script = state
                    .scripts
                    .lock()
                    .get(&text)
                    .cloned()
                    .unwrap_or_else(Script::command);
                if run_script(&mut stream, &script, &record).await.is_err() {
                    record(Event::Closed);
                    return;
                }
            }
            _ => {}
        }
    }
}

async fn run_script(
    stream: &mut TcpStream,
    script: &Script,
    record: &(dyn Fn(Event) + Send + Sync),
) -> std::io::Result<()> {
    let outcome = match script.outcome {
        Some(outcome) => outcome,
        None => {
            for step in &script.steps {
                if let Step::Send(bytes) = step {
                    stream.write_all(bytes).await?;
                }
            }
            return Ok(());
        }
    };

    stream.write_all(&[outcome.id()]).await?;
    let directive = match read_client_item(stream).await? {
        ClientItem::Directive(d) => d,
        other => panic!("expected a directive, got {:?}", other),
    };
    record(Event::Directive(directive));

    if directive == Directive::Cancel {
        return stream.write_all(&script.on_cancel).await;
    }

    for step in &script.steps {
        match step {
            Step::Send(bytes) => stream.write_all(bytes).await?,
            Step::Receive => match read_client_item(stream).await? {
                ClientItem::Frame(f) if f.kind == FrameType::Resource => {
                    record(Event::Resource(f.scalar().unwrap().clone()))
                }
                ClientItem::Frame(f) if f.kind == FrameType::Cancel => record(Event::Cancel),
                other => panic!("unexpected {:?}", other),
            },
            Step::IdsIfRequested(ids) => {
                if directive == Directive::ProceedWithIds {
                    stream.write_all(&frames(&[Frame::int_array(ids)])).await?;
                }
            }
            Step::Sleep(pause) => tokio::time::sleep(*pause).await,
        }
    }
    Ok(())
}

//! Wire session: one socket's buffered streams and the exchange cycle.
//!
//! An exchange is `MESSAGE` → outcome → directive, followed (unless the
//! directive cancelled it) by response frames up to `END_OF_RESPONSE`. At
//! most one exchange is in flight per session.

use std::fmt;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rowlink_core::catalog::{Directive, FrameType, Outcome, Payload, Tag};
use rowlink_core::value::check_size;
use rowlink_core::{decode_header, CodecError, Frame, ScalarType, Value, NULL_MARKER, PRESENT_MARKER};
use rowlink_core::MAX_CHUNK_COUNT;
use tokio::io::{
    split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf,
    WriteHalf,
};
use tracing::{debug, warn};

use super::visitor::{ResponseVisitor, Row};
use crate::error::{DriverError, DriverResult};

/// Picks the directive sent back for an outcome.
pub type Classifier<'a> = &'a mut (dyn FnMut(Outcome) -> Directive + Send);

/// What the session read next.
#[derive(Debug)]
enum Incoming {
    Outcome(Outcome),
    Header(Vec<ScalarType>),
    Row(Row),
    Frame(Frame),
}

impl fmt::Display for Incoming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Incoming::Outcome(o) => write!(f, "{}", Tag::Outcome(*o)),
            Incoming::Header(_) => write!(f, "{}", FrameType::Header),
            Incoming::Row(_) => write!(f, "{}", FrameType::Result),
            Incoming::Frame(frame) => write!(f, "{}", frame.kind),
        }
    }
}

pub struct Protocol<S> {
    reader: Option<BufReader<ReadHalf<S>>>,
    writer: Option<BufWriter<WriteHalf<S>>>,
    /// Column types of the current row stream.
    header: Option<Vec<ScalarType>>,
    mid_exchange: bool,
    broken: bool,
    closed: bool,
    read_timeout: Option<Duration>,
}

impl<S> Protocol<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap a connected stream. Nothing is sent.
    pub fn connect(stream: S) -> DriverResult<Self> {
        rowlink_core::ensure_disjoint()?;
        let (read_half, write_half) = split(stream);
        Ok(Self {
            reader: Some(BufReader::new(read_half)),
            writer: Some(BufWriter::new(write_half)),
            header: None,
            mid_exchange: false,
            broken: false,
            closed: false,
            read_timeout: None,
        })
    }

    /// Bound every frame read; `None` waits forever.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    pub fn is_mid_exchange(&self) -> bool {
        self.mid_exchange
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Column types announced by the last HEADER of the current exchange.
    pub fn header(&self) -> Option<&[ScalarType]> {
        self.header.as_deref()
    }

    /// First frame on a new session.
    pub async fn write_credentials(&mut self, user: &str, password: &str) -> DriverResult<()> {
        self.ensure_open()?;
        self.send_frame(&Frame::credentials(user, password)).await
    }

    /// Send `request` and answer the server's outcome.
    ///
    /// Returns `Ok(true)` with the exchange open when the directive was to
    /// proceed, `Ok(false)` after a cancelled exchange has been drained.
    pub async fn begin_exchange(
        &mut self,
        request: &str,
        classifier: Option<Classifier<'_>>,
    ) -> DriverResult<bool> {
        self.ensure_open()?;
        if self.mid_exchange {
            return Err(DriverError::ExchangeInProgress);
        }
        self.mid_exchange = true;
        self.header = None;

        let result = self.begin_inner(request, classifier).await;
        match &result {
            Ok(true) => {}
            Ok(false) => self.mid_exchange = false,
            Err(e) => {
                self.mid_exchange = false;
                self.after_error(e).await;
            }
        }
        result
    }

    async fn begin_inner(
        &mut self,
        request: &str,
        classifier: Option<Classifier<'_>>,
    ) -> DriverResult<bool> {
        debug!("Sending request ({} bytes)", request.len());
        self.send_frame(&Frame::text(FrameType::Message, request))
            .await?;

        let outcome = match self.next_incoming().await? {
            Incoming::Outcome(o) => o,
            Incoming::Frame(frame) if frame.kind == FrameType::Exception => {
                return Err(DriverError::Remote(frame.as_text()?));
            }
            other => return Err(self.desync(format!("expected an outcome, got {other}"))),
        };

        let directive = classifier.map_or(Directive::Proceed, |c| c(outcome));
        debug!("Outcome {} answered with {}", outcome.name(), directive.name());
        self.send_raw(&[directive.id()]).await?;

        if directive == Directive::Cancel {
            self.drain(true).await?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Feed response frames to `visitor` until it yields, metadata ends, or
    /// the response ends.
    ///
    /// Returns `Ok(true)` once END_OF_RESPONSE has been read and `Ok(false)`
    /// when the exchange is still open.
    pub async fn stream_response(
        &mut self,
        visitor: &mut dyn ResponseVisitor,
    ) -> DriverResult<bool> {
        self.ensure_open()?;
        if !self.mid_exchange {
            return Err(DriverError::NoExchange);
        }

        let result = self.stream_inner(visitor).await;
        match &result {
            Ok(false) => {}
            Ok(true) => self.mid_exchange = false,
            Err(e) => {
                self.mid_exchange = false;
                self.after_error(e).await;
            }
        }
        result
    }

    async fn stream_inner(&mut self, visitor: &mut dyn ResponseVisitor) -> DriverResult<bool> {
        loop {
            if visitor.is_cancelled() {
                return self.cancel_in_flight().await;
            }

            match self.next_incoming().await? {
                Incoming::Header(types) => {
                    if !visitor.on_header(&types) {
                        return Ok(false);
                    }
                }
                Incoming::Row(row) => {
                    if !visitor.on_row(row) {
                        return Ok(false);
                    }
                }
                Incoming::Frame(frame) => match frame.kind {
                    FrameType::HeaderNames => {
                        if !visitor.on_header_names(&frame.as_texts()?) {
                            return Ok(false);
                        }
                    }
                    FrameType::Int | FrameType::IntArray => {
                        if !visitor.on_ints(&frame.as_ints()?) {
                            return Ok(false);
                        }
                    }
                    FrameType::ResourceDemand => {
                        if visitor.is_cancelled() {
                            return self.cancel_in_flight().await;
                        }
                        let name = frame.as_text()?;
                        let data = visitor.on_resource_demand(&name);
                        debug!("Answering resource demand '{}' ({} bytes)", name, data.len());
                        self.send_frame(&Frame::bytes(FrameType::Resource, data))
                            .await?;
                    }
                    FrameType::EndOfMeta => return Ok(false),
                    FrameType::EndOfResponse => return Ok(true),
                    FrameType::Exception => return Err(DriverError::Remote(frame.as_text()?)),
                    _ => return Err(self.desync(format!("unexpected {}", frame.kind))),
                },
                other @ Incoming::Outcome(_) => {
                    return Err(self.desync(format!("unexpected {other}")));
                }
            }
        }
    }

    /// Idempotent. Flushes and shuts down the writer, then drops both halves.
    pub async fn close(&mut self) -> DriverResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.mid_exchange = false;
        self.header = None;
        self.reader.take();
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown().await?;
        }
        Ok(())
    }

    fn ensure_open(&self) -> DriverResult<()> {
        if self.closed {
            return Err(DriverError::SessionClosed);
        }
        if self.broken {
            return Err(DriverError::Protocol("session is broken".to_string()));
        }
        Ok(())
    }

    async fn cancel_in_flight(&mut self) -> DriverResult<bool> {
        debug!("Cancelling in-flight response");
        self.send_frame(&Frame::empty(FrameType::Cancel)).await?;
        self.drain(false).await?;
        Err(DriverError::Cancelled)
    }

    /// Read and discard frames until the response ends. An EXCEPTION also
    /// ends it.
    async fn drain(&mut self, answer_demands: bool) -> DriverResult<()> {
        let mut discarded = 0usize;
        loop {
            match self.next_incoming().await? {
                Incoming::Header(_) | Incoming::Row(_) => {}
                Incoming::Frame(frame) => match frame.kind {
                    FrameType::EndOfResponse | FrameType::Exception => {
                        debug!("Drained {} frames", discarded);
                        return Ok(());
                    }
                    FrameType::ResourceDemand if answer_demands => {
                        self.send_frame(&Frame::bytes(FrameType::Resource, Bytes::new()))
                            .await?;
                    }
                    FrameType::HeaderNames
                    | FrameType::Int
                    | FrameType::IntArray
                    | FrameType::ResourceDemand
                    | FrameType::EndOfMeta => {}
                    _ => return Err(self.desync(format!("unexpected {} while draining", frame.kind))),
                },
                other @ Incoming::Outcome(_) => {
                    return Err(self.desync(format!("unexpected {other} while draining")));
                }
            }
            discarded += 1;
        }
    }

    fn desync(&mut self, detail: String) -> DriverError {
        warn!("Protocol desync: {}", detail);
        self.broken = true;
        DriverError::Protocol(detail)
    }

    async fn after_error(&mut self, err: &DriverError) {
        if !err.is_fatal() {
            return;
        }
        self.broken = true;
        if let DriverError::Timeout(limit) = err {
            warn!("No frame within {:?}, cancelling request", limit);
            let cancel = [FrameType::Cancel.id()];
            let _ = tokio::time::timeout(*limit, self.send_raw(&cancel)).await;
        }
    }

    async fn next_incoming(&mut self) -> DriverResult<Incoming> {
        let result = match self.read_timeout {
            Some(limit) => tokio::time::timeout(limit, self.read_incoming())
                .await
                .unwrap_or(Err(DriverError::Timeout(limit))),
            None => self.read_incoming().await,
        };
        if let Err(e) = &result {
            if e.is_fatal() {
                self.broken = true;
            }
        }
        result
    }

    async fn read_incoming(&mut self) -> DriverResult<Incoming> {
        let reader = self.reader.as_mut().ok_or(DriverError::SessionClosed)?;
        let tag = reader.read_u8().await?;

        let kind = match Tag::resolve(tag) {
            Some(Tag::Frame(kind)) => kind,
            Some(Tag::Outcome(o)) => return Ok(Incoming::Outcome(o)),
            Some(Tag::Directive(d)) => {
                return Err(DriverError::Protocol(format!(
                    "server sent {}",
                    Tag::Directive(d)
                )))
            }
            None => return Err(CodecError::UnknownTag(tag).into()),
        };

        match kind {
            FrameType::Header => {
                let ids = read_element(reader, Payload::Variable).await?;
                let types = decode_header(&ids)?;
                self.header = Some(types.clone());
                Ok(Incoming::Header(types))
            }
            FrameType::Result => {
                let header = self
                    .header
                    .as_deref()
                    .ok_or_else(|| DriverError::Protocol("RESULT before HEADER".to_string()))?;
                let mut values = Vec::with_capacity(header.len());
                for ty in header {
                    values.push(read_value(reader, *ty).await?);
                }
                Ok(Incoming::Row(Row::new(values)))
            }
            kind => Ok(Incoming::Frame(read_body(reader, kind).await?)),
        }
    }

    async fn send_frame(&mut self, frame: &Frame) -> DriverResult<()> {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf)?;
        self.send_raw(&buf).await
    }

    async fn send_raw(&mut self, bytes: &[u8]) -> DriverResult<()> {
        let writer = self.writer.as_mut().ok_or(DriverError::SessionClosed)?;
        let result = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        }
        .await;
        if result.is_err() {
            self.broken = true;
        }
        Ok(result?)
    }
}

impl<S> fmt::Debug for Protocol<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protocol")
            .field("mid_exchange", &self.mid_exchange)
            .field("broken", &self.broken)
            .field("closed", &self.closed)
            .field("read_timeout", &self.read_timeout)
            .finish()
    }
}

async fn read_body<R>(reader: &mut R, kind: FrameType) -> DriverResult<Frame>
where
    R: AsyncRead + Unpin,
{
    let spec = kind.spec();
    let body = match (spec.payload, spec.chunked) {
        (Payload::Absent, _) => rowlink_core::FrameBody::Empty,
        (payload, false) => rowlink_core::FrameBody::Scalar(read_element(reader, payload).await?),
        (payload, true) => {
            let count = reader.read_u32().await? as usize;
            if count > MAX_CHUNK_COUNT {
                return Err(CodecError::PayloadTooLarge {
                    size: count,
                    limit: MAX_CHUNK_COUNT,
                }
                .into());
            }
            let mut chunks = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                chunks.push(read_element(reader, payload).await?);
            }
            rowlink_core::FrameBody::Chunked(chunks)
        }
    };
    Ok(Frame::new(kind, body))
}

async fn read_element<R>(reader: &mut R, payload: Payload) -> DriverResult<Bytes>
where
    R: AsyncRead + Unpin,
{
    let len = match payload {
        Payload::Fixed(width) => width,
        Payload::Variable => {
            let len = reader.read_u32().await? as usize;
            check_size(len)?;
            len
        }
        Payload::Absent => return Ok(Bytes::new()),
    };
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

async fn read_value<R>(reader: &mut R, ty: ScalarType) -> DriverResult<Value>
where
    R: AsyncRead + Unpin,
{
    match reader.read_u8().await? {
        NULL_MARKER => return Ok(Value::Null),
        PRESENT_MARKER => {}
        other => return Err(CodecError::InvalidNullMarker(other).into()),
    }
    let payload = read_element(reader, ty.width()).await?;
    Ok(ty.decode_payload(payload)?)
}

//! Decoded frames and their byte layout.
//!
//! [`Frame::encode`] and [`decode_frame`] operate on in-memory buffers; the
//! async session reader follows the same layout incrementally.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::catalog::{FrameType, Payload};
use crate::error::{CodecError, CodecResult};
use crate::value::{check_size, put_variable};

/// Upper bound for the element count of a chunked frame.
pub const MAX_CHUNK_COUNT: usize = 1 << 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    Empty,
    Scalar(Bytes),
    Chunked(Vec<Bytes>),
}

/// One frame as read off the wire. Owned by whoever read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameType,
    pub body: FrameBody,
}

impl Frame {
    pub fn new(kind: FrameType, body: FrameBody) -> Self {
        Self { kind, body }
    }

    pub fn empty(kind: FrameType) -> Self {
        Self::new(kind, FrameBody::Empty)
    }

    pub fn bytes(kind: FrameType, bytes: impl Into<Bytes>) -> Self {
        Self::new(kind, FrameBody::Scalar(bytes.into()))
    }

    pub fn text(kind: FrameType, text: &str) -> Self {
        Self::bytes(kind, Bytes::copy_from_slice(text.as_bytes()))
    }

    pub fn texts<S: AsRef<str>>(kind: FrameType, texts: &[S]) -> Self {
        let chunks = texts
            .iter()
            .map(|s| Bytes::copy_from_slice(s.as_ref().as_bytes()))
            .collect();
        Self::new(kind, FrameBody::Chunked(chunks))
    }

    pub fn int(value: i32) -> Self {
        Self::bytes(FrameType::Int, Bytes::copy_from_slice(&value.to_be_bytes()))
    }

    pub fn int_array(values: &[i32]) -> Self {
        let chunks = values
            .iter()
            .map(|v| Bytes::copy_from_slice(&v.to_be_bytes()))
            .collect();
        Self::new(FrameType::IntArray, FrameBody::Chunked(chunks))
    }

    pub fn credentials(user: &str, password: &str) -> Self {
        Self::texts(FrameType::Credentials, &[user, password])
    }

    pub fn scalar(&self) -> CodecResult<&Bytes> {
        match &self.body {
            FrameBody::Scalar(b) => Ok(b),
            _ => Err(self.shape_error("a singular payload")),
        }
    }

    pub fn chunks(&self) -> CodecResult<&[Bytes]> {
        match &self.body {
            FrameBody::Chunked(c) => Ok(c),
            _ => Err(self.shape_error("a chunked payload")),
        }
    }

    pub fn as_int(&self) -> CodecResult<i32> {
        be_i32(self.scalar()?)
    }

    pub fn as_ints(&self) -> CodecResult<Vec<i32>> {
        match &self.body {
            FrameBody::Scalar(b) => Ok(vec![be_i32(b)?]),
            FrameBody::Chunked(c) => c.iter().map(be_i32).collect(),
            FrameBody::Empty => Err(self.shape_error("integers")),
        }
    }

    pub fn as_text(&self) -> CodecResult<String> {
        utf8(self.scalar()?, self.kind.name())
    }

    pub fn as_texts(&self) -> CodecResult<Vec<String>> {
        self.chunks()?
            .iter()
            .map(|c| utf8(c, self.kind.name()))
            .collect()
    }

    fn shape_error(&self, wanted: &str) -> CodecError {
        CodecError::InvalidValue {
            kind: self.kind.name(),
            detail: format!("expected {wanted}, got {:?}", self.body),
        }
    }

    /// Append tag and payload, checking the body against the tag's shape.
    pub fn encode(&self, buf: &mut BytesMut) -> CodecResult<()> {
        let spec = self.kind.spec();
        buf.put_u8(self.kind.id());
        match (&self.body, spec.payload, spec.chunked) {
            (FrameBody::Empty, Payload::Absent, _) => Ok(()),
            (FrameBody::Scalar(b), payload, false) => put_element(buf, payload, b, self.kind),
            (FrameBody::Chunked(chunks), payload, true) => {
                if chunks.len() > MAX_CHUNK_COUNT {
                    return Err(CodecError::PayloadTooLarge {
                        size: chunks.len(),
                        limit: MAX_CHUNK_COUNT,
                    });
                }
                buf.put_u32(chunks.len() as u32);
                for chunk in chunks {
                    put_element(buf, payload, chunk, self.kind)?;
                }
                Ok(())
            }
            _ => Err(self.shape_error(spec.name)),
        }
    }

    pub fn to_bytes(&self) -> CodecResult<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

fn put_element(buf: &mut BytesMut, payload: Payload, element: &[u8], kind: FrameType) -> CodecResult<()> {
    match payload {
        Payload::Fixed(width) if element.len() == width => {
            buf.put_slice(element);
            Ok(())
        }
        Payload::Fixed(width) => Err(CodecError::InvalidValue {
            kind: kind.name(),
            detail: format!("element is {} bytes, tag declares {width}", element.len()),
        }),
        Payload::Variable => put_variable(buf, element),
        Payload::Absent => Ok(()),
    }
}

/// Decode one complete frame from `buf`.
///
/// Outcome and directive tags are not frames and yield
/// [`CodecError::UnknownTag`]; RESULT decodes to an empty body because its
/// column values are typed by the preceding header.
pub fn decode_frame(buf: &mut impl Buf) -> CodecResult<Frame> {
    need(buf, 1)?;
    let tag = buf.get_u8();
    let kind = FrameType::find(tag).ok_or(CodecError::UnknownTag(tag))?;
    let spec = kind.spec();

    let body = match (spec.payload, spec.chunked) {
        (Payload::Absent, _) => FrameBody::Empty,
        (payload, false) => FrameBody::Scalar(take_element(buf, payload)?),
        (payload, true) => {
            need(buf, 4)?;
            let count = buf.get_u32() as usize;
            if count > MAX_CHUNK_COUNT {
                return Err(CodecError::PayloadTooLarge {
                    size: count,
                    limit: MAX_CHUNK_COUNT,
                });
            }
            let mut chunks = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                chunks.push(take_element(buf, payload)?);
            }
            FrameBody::Chunked(chunks)
        }
    };
    Ok(Frame::new(kind, body))
}

fn take_element(buf: &mut impl Buf, payload: Payload) -> CodecResult<Bytes> {
    let len = match payload {
        Payload::Fixed(width) => width,
        Payload::Variable => {
            need(buf, 4)?;
            let len = buf.get_u32() as usize;
            check_size(len)?;
            len
        }
        Payload::Absent => 0,
    };
    need(buf, len)?;
    Ok(buf.copy_to_bytes(len))
}

fn need(buf: &impl Buf, needed: usize) -> CodecResult<()> {
    if buf.remaining() < needed {
        return Err(CodecError::Truncated {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

fn be_i32(bytes: &Bytes) -> CodecResult<i32> {
    let arr: [u8; 4] = bytes.as_ref().try_into().map_err(|_| CodecError::Truncated {
        needed: 4,
        available: bytes.len(),
    })?;
    Ok(i32::from_be_bytes(arr))
}

fn utf8(bytes: &Bytes, what: &'static str) -> CodecResult<String> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| CodecError::InvalidUtf8(what))
}

//! Frame catalog: the three tagged enumerations that share the wire's tag byte.
//!
//! Every frame starts with one tag byte. The tag alone tells a reader which
//! enumeration it belongs to and how its payload is shaped:
//!
//! ```text
//! ┌─────┬──────────────────────────────────────────────┐
//! │ tag │ payload (shape decided by the tag)           │
//! │ 1 B │ absent | fixed N | u32 BE len + bytes        │
//! │     │ chunked: u32 BE count + count × element      │
//! └─────┴──────────────────────────────────────────────┘
//! ```
//!
//! Demultiplexing relies on the tags of [`FrameType`], [`Outcome`] and
//! [`Directive`] being pairwise distinct; [`ensure_disjoint`] verifies that
//! once per process.

use std::fmt;

use once_cell::sync::Lazy;

use crate::error::{CodecError, CodecResult};

/// Width of a single frame element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    /// Tag only, nothing follows.
    Absent,
    /// Exactly this many bytes follow, no length prefix.
    Fixed(usize),
    /// A u32 big-endian length prefix, then that many bytes.
    Variable,
}

/// Shape of a frame as declared by its tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSpec {
    pub name: &'static str,
    pub payload: Payload,
    pub chunked: bool,
}

impl FrameSpec {
    const fn tag_only(name: &'static str) -> Self {
        Self {
            name,
            payload: Payload::Absent,
            chunked: false,
        }
    }

    const fn singular(name: &'static str, payload: Payload) -> Self {
        Self {
            name,
            payload,
            chunked: false,
        }
    }

    const fn chunked(name: &'static str, payload: Payload) -> Self {
        Self {
            name,
            payload,
            chunked: true,
        }
    }

    #[inline]
    pub fn has_payload(&self) -> bool {
        !matches!(self.payload, Payload::Absent)
    }

    #[inline]
    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    /// Declared element width for fixed-width tags.
    #[inline]
    pub fn fixed_width(&self) -> Option<usize> {
        match self.payload {
            Payload::Fixed(width) => Some(width),
            _ => None,
        }
    }
}

/// Frames exchanged inside a request/response cycle.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Credentials = 0x01,
    Message = 0x02,
    Header = 0x03,
    HeaderNames = 0x04,
    Result = 0x05,
    Int = 0x06,
    IntArray = 0x07,
    ResourceDemand = 0x08,
    Resource = 0x09,
    EndOfMeta = 0x0A,
    EndOfResponse = 0x0B,
    Exception = 0x0C,
    Cancel = 0x0D,
}

impl FrameType {
    pub const ALL: [FrameType; 13] = [
        FrameType::Credentials,
        FrameType::Message,
        FrameType::Header,
        FrameType::HeaderNames,
        FrameType::Result,
        FrameType::Int,
        FrameType::IntArray,
        FrameType::ResourceDemand,
        FrameType::Resource,
        FrameType::EndOfMeta,
        FrameType::EndOfResponse,
        FrameType::Exception,
        FrameType::Cancel,
    ];

    #[inline]
    pub const fn id(self) -> u8 {
        self as u8
    }

    pub fn find(id: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.id() == id)
    }

    pub const fn spec(self) -> FrameSpec {
        match self {
            FrameType::Credentials => FrameSpec::chunked("CREDENTIALS", Payload::Variable),
            FrameType::Message => FrameSpec::singular("MESSAGE", Payload::Variable),
            FrameType::Header => FrameSpec::singular("HEADER", Payload::Variable),
            FrameType::HeaderNames => FrameSpec::chunked("HEADER_NAMES", Payload::Variable),
            // Column values follow the tag, typed by the last header.
            FrameType::Result => FrameSpec::tag_only("RESULT"),
            FrameType::Int => FrameSpec::singular("INT", Payload::Fixed(4)),
            FrameType::IntArray => FrameSpec::chunked("INT_ARRAY", Payload::Fixed(4)),
            FrameType::ResourceDemand => FrameSpec::singular("RESOURCE_DEMAND", Payload::Variable),
            FrameType::Resource => FrameSpec::singular("RESOURCE", Payload::Variable),
            FrameType::EndOfMeta => FrameSpec::tag_only("END_OF_META"),
            FrameType::EndOfResponse => FrameSpec::tag_only("END_OF_RESPONSE"),
            FrameType::Exception => FrameSpec::singular("EXCEPTION", Payload::Variable),
            FrameType::Cancel => FrameSpec::tag_only("CANCEL"),
        }
    }

    pub const fn name(self) -> &'static str {
        self.spec().name
    }
}

/// Server's classification of a request, sent right after MESSAGE.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Rows will follow.
    Query = 0x20,
    /// A manipulation; an update count follows.
    Update = 0x21,
    /// Neither rows nor counts.
    Command = 0x22,
}

impl Outcome {
    pub const ALL: [Outcome; 3] = [Outcome::Query, Outcome::Update, Outcome::Command];

    #[inline]
    pub const fn id(self) -> u8 {
        self as u8
    }

    pub fn find(id: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|o| o.id() == id)
    }

    pub const fn spec(self) -> FrameSpec {
        FrameSpec::tag_only(self.name())
    }

    pub const fn name(self) -> &'static str {
        match self {
            Outcome::Query => "OUTCOME_QUERY",
            Outcome::Update => "OUTCOME_UPDATE",
            Outcome::Command => "OUTCOME_COMMAND",
        }
    }
}

/// Client's answer to an [`Outcome`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Directive {
    #[default]
    Proceed = 0x30,
    /// Proceed and report generated ids after the update count.
    ProceedWithIds = 0x31,
    /// Abandon the exchange before any result is transferred.
    Cancel = 0x32,
}

impl Directive {
    pub const ALL: [Directive; 3] = [
        Directive::Proceed,
        Directive::ProceedWithIds,
        Directive::Cancel,
    ];

    #[inline]
    pub const fn id(self) -> u8 {
        self as u8
    }

    pub fn find(id: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|d| d.id() == id)
    }

    pub const fn spec(self) -> FrameSpec {
        FrameSpec::tag_only(self.name())
    }

    pub const fn name(self) -> &'static str {
        match self {
            Directive::Proceed => "DIRECTIVE_PROCEED",
            Directive::ProceedWithIds => "DIRECTIVE_PROCEED_WITH_IDS",
            Directive::Cancel => "DIRECTIVE_CANCEL",
        }
    }
}

/// A tag resolved against all three enumerations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Frame(FrameType),
    Outcome(Outcome),
    Directive(Directive),
}

impl Tag {
    /// Resolve a raw tag byte. Returns `None` for bytes no enumeration claims.
    pub fn resolve(id: u8) -> Option<Self> {
        FrameType::find(id)
            .map(Tag::Frame)
            .or_else(|| Outcome::find(id).map(Tag::Outcome))
            .or_else(|| Directive::find(id).map(Tag::Directive))
    }

    pub fn id(&self) -> u8 {
        match self {
            Tag::Frame(t) => t.id(),
            Tag::Outcome(o) => o.id(),
            Tag::Directive(d) => d.id(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Tag::Frame(t) => t.name(),
            Tag::Outcome(o) => o.name(),
            Tag::Directive(d) => d.name(),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:02x})", self.name(), self.id())
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:02x})", self.name(), self.id())
    }
}

/// Every (name, tag) pair the catalog defines.
pub fn all_tags() -> impl Iterator<Item = (&'static str, u8)> {
    FrameType::ALL
        .iter()
        .map(|t| (t.name(), t.id()))
        .chain(Outcome::ALL.iter().map(|o| (o.name(), o.id())))
        .chain(Directive::ALL.iter().map(|d| (d.name(), d.id())))
}

/// Fails on the first tag claimed by two entries.
pub fn check_disjoint(tags: impl IntoIterator<Item = (&'static str, u8)>) -> CodecResult<()> {
    let mut seen: [Option<&'static str>; 256] = [None; 256];
    for (name, tag) in tags {
        if let Some(first) = seen[tag as usize] {
            return Err(CodecError::DuplicateTag {
                tag,
                first,
                second: name,
            });
        }
        seen[tag as usize] = Some(name);
    }
    Ok(())
}

static CATALOG_CHECK: Lazy<CodecResult<()>> = Lazy::new(|| check_disjoint(all_tags()));

/// Validates the catalog the first time it is called; later calls return
/// the cached verdict.
pub fn ensure_disjoint() -> CodecResult<()> {
    CATALOG_CHECK.clone()
}

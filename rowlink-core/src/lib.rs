//! Rowlink Core - Transport-independent pieces of the rowlink wire protocol.
//!
//! This crate holds everything about the protocol that can be expressed
//! without a socket: the tag catalog, the scalar type registry and the codecs
//! for column values and whole frames. The async session layer in `rowlink`
//! builds on it, and so do the scripted peers used in its tests.
//!
//! # Main Components
//!
//! - **Catalog**: frame, outcome and directive tags with their payload shapes
//! - **Types**: scalar type ids and their descriptors
//! - **Value**: decoded column values and their null-marked encoding
//! - **Frame**: whole frames as owned values, with buffer encode/decode
//!
//! # Example
//!
//! ```rust
//! use rowlink_core::{decode_frame, Frame, FrameType};
//!
//! let mut bytes = Frame::int(42).to_bytes().unwrap();
//! let frame = decode_frame(&mut bytes).unwrap();
//! assert_eq!(frame.kind, FrameType::Int);
//! assert_eq!(frame.as_int().unwrap(), 42);
//! ```

pub mod catalog;
pub mod error;
pub mod frame;
pub mod types;
pub mod value;

// Re-export main types for convenience
pub use catalog::{ensure_disjoint, Directive, FrameSpec, FrameType, Outcome, Payload, Tag};
pub use error::{CodecError, CodecResult};
pub use frame::{decode_frame, Frame, FrameBody, MAX_CHUNK_COUNT};
pub use types::{decode_header, encode_header, Representor, ScalarType, TypeDescriptor};
pub use value::{Value, MAX_PAYLOAD_SIZE, NULL_MARKER, PRESENT_MARKER};

//! Error types for rowlink-core.
//!
//! Pure codec errors; nothing here knows about sockets or sessions.

use thiserror::Error;

/// Codec and catalog error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Unknown frame tag: 0x{0:02x}")]
    UnknownTag(u8),

    #[error("Unknown scalar type id: 0x{0:02x}")]
    UnknownType(u8),

    #[error("Duplicate tag 0x{tag:02x} shared by {first} and {second}")]
    DuplicateTag {
        tag: u8,
        first: &'static str,
        second: &'static str,
    },

    #[error("Truncated input: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("Invalid null marker: 0x{0:02x}")]
    InvalidNullMarker(u8),

    #[error("Invalid {kind} value: {detail}")]
    InvalidValue { kind: &'static str, detail: String },

    #[error("Type mismatch: column is {expected}, value is {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
}

/// Result type for codec operations
pub type CodecResult<T> = Result<T, CodecError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CodecError::UnknownTag(0x7f);
        assert_eq!(err.to_string(), "Unknown frame tag: 0x7f");

        let err = CodecError::UnknownType(0x01);
        assert_eq!(err.to_string(), "Unknown scalar type id: 0x01");

        let err = CodecError::Truncated {
            needed: 8,
            available: 3,
        };
        assert_eq!(err.to_string(), "Truncated input: needed 8 bytes, 3 available");

        let err = CodecError::DuplicateTag {
            tag: 0x0d,
            first: "CANCEL",
            second: "ABORT",
        };
        assert_eq!(
            err.to_string(),
            "Duplicate tag 0x0d shared by CANCEL and ABORT"
        );

        let err = CodecError::TypeMismatch {
            expected: "INTEGER",
            found: "VARCHAR",
        };
        assert_eq!(
            err.to_string(),
            "Type mismatch: column is INTEGER, value is VARCHAR"
        );
    }
}

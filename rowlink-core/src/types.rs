//! Scalar type registry.
//!
//! A header frame carries one wire id per column; each id maps to an
//! immutable [`TypeDescriptor`] with the column's SQL-facing metadata and the
//! Rust type a decoded value is exposed as.

use std::fmt;

use crate::catalog::Payload;
use crate::error::{CodecError, CodecResult};

/// Rust-side type a decoded column value is represented by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Representor {
    Bool,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Decimal,
    String,
    Bytes,
    Date,
    Time,
    Timestamp,
}

impl Representor {
    pub fn rust_type(&self) -> &'static str {
        match self {
            Representor::Bool => "bool",
            Representor::I8 => "i8",
            Representor::I16 => "i16",
            Representor::I32 => "i32",
            Representor::I64 => "i64",
            Representor::F32 => "f32",
            Representor::F64 => "f64",
            Representor::Decimal => "String",
            Representor::String => "String",
            Representor::Bytes => "bytes::Bytes",
            Representor::Date => "chrono::NaiveDate",
            Representor::Time => "chrono::NaiveTime",
            Representor::Timestamp => "chrono::DateTime<Utc>",
        }
    }
}

/// Immutable description of one scalar kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeDescriptor {
    pub id: u8,
    pub sql_name: &'static str,
    pub signed: bool,
    pub precision: u32,
    pub scale: u32,
    pub width: Payload,
    pub representor: Representor,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    Boolean = 0x41,
    TinyInt = 0x42,
    SmallInt = 0x43,
    Integer = 0x44,
    BigInt = 0x45,
    Real = 0x46,
    Double = 0x47,
    Decimal = 0x48,
    Varchar = 0x49,
    Varbinary = 0x4A,
    Date = 0x4B,
    Time = 0x4C,
    Timestamp = 0x4D,
}

const UNBOUNDED: u32 = i32::MAX as u32;

impl ScalarType {
    pub const ALL: [ScalarType; 13] = [
        ScalarType::Boolean,
        ScalarType::TinyInt,
        ScalarType::SmallInt,
        ScalarType::Integer,
        ScalarType::BigInt,
        ScalarType::Real,
        ScalarType::Double,
        ScalarType::Decimal,
        ScalarType::Varchar,
        ScalarType::Varbinary,
        ScalarType::Date,
        ScalarType::Time,
        ScalarType::Timestamp,
    ];

    #[inline]
    pub const fn id(self) -> u8 {
        self as u8
    }

    pub fn find(id: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.id() == id)
    }

    pub fn try_from_id(id: u8) -> CodecResult<Self> {
        Self::find(id).ok_or(CodecError::UnknownType(id))
    }

    pub const fn descriptor(self) -> TypeDescriptor {
        let (sql_name, signed, precision, scale, width, representor) = match self {
            ScalarType::Boolean => ("BOOLEAN", false, 1, 0, Payload::Fixed(1), Representor::Bool),
            ScalarType::TinyInt => ("TINYINT", true, 3, 0, Payload::Fixed(1), Representor::I8),
            ScalarType::SmallInt => ("SMALLINT", true, 5, 0, Payload::Fixed(2), Representor::I16),
            ScalarType::Integer => ("INTEGER", true, 10, 0, Payload::Fixed(4), Representor::I32),
            ScalarType::BigInt => ("BIGINT", true, 19, 0, Payload::Fixed(8), Representor::I64),
            ScalarType::Real => ("REAL", true, 7, 0, Payload::Fixed(4), Representor::F32),
            ScalarType::Double => ("DOUBLE", true, 15, 0, Payload::Fixed(8), Representor::F64),
            ScalarType::Decimal => ("DECIMAL", true, 38, 0, Payload::Variable, Representor::Decimal),
            ScalarType::Varchar => ("VARCHAR", false, UNBOUNDED, 0, Payload::Variable, Representor::String),
            ScalarType::Varbinary => ("VARBINARY", false, UNBOUNDED, 0, Payload::Variable, Representor::Bytes),
            // Epoch milliseconds on the wire; precision is the display width.
            ScalarType::Date => ("DATE", false, 10, 0, Payload::Fixed(8), Representor::Date),
            ScalarType::Time => ("TIME", false, 12, 3, Payload::Fixed(8), Representor::Time),
            ScalarType::Timestamp => ("TIMESTAMP", false, 23, 3, Payload::Fixed(8), Representor::Timestamp),
        };
        TypeDescriptor {
            id: self as u8,
            sql_name,
            signed,
            precision,
            scale,
            width,
            representor,
        }
    }

    pub const fn sql_name(self) -> &'static str {
        self.descriptor().sql_name
    }

    pub const fn width(self) -> Payload {
        self.descriptor().width
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql_name())
    }
}

/// Decode a HEADER payload: one type id per byte.
pub fn decode_header(ids: &[u8]) -> CodecResult<Vec<ScalarType>> {
    ids.iter().map(|id| ScalarType::try_from_id(*id)).collect()
}

pub fn encode_header(types: &[ScalarType]) -> Vec<u8> {
    types.iter().map(|t| t.id()).collect()
}

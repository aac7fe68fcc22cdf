//! Column values and their scalar encodings.
//!
//! Every column value on the wire starts with a null marker byte. A present
//! value follows in its type's width: fixed-width big-endian for numbers and
//! epoch-millisecond temporals, length-prefixed bytes for text, decimal text
//! and binary.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, NaiveDate, NaiveTime, Timelike, Utc};

use crate::catalog::Payload;
use crate::error::{CodecError, CodecResult};
use crate::types::ScalarType;

pub const NULL_MARKER: u8 = 0;
pub const PRESENT_MARKER: u8 = 1;

/// Upper bound for any single variable-width payload (64 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

const MILLIS_PER_DAY: i64 = 86_400_000;

/// A decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    TinyInt(i8),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Real(f32),
    Double(f64),
    /// Canonical decimal text, e.g. `-12.50`.
    Decimal(String),
    Text(String),
    Bytes(Bytes),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// The scalar type this value encodes as; `None` for NULL.
    pub fn scalar_type(&self) -> Option<ScalarType> {
        let t = match self {
            Value::Null => return None,
            Value::Bool(_) => ScalarType::Boolean,
            Value::TinyInt(_) => ScalarType::TinyInt,
            Value::SmallInt(_) => ScalarType::SmallInt,
            Value::Int(_) => ScalarType::Integer,
            Value::BigInt(_) => ScalarType::BigInt,
            Value::Real(_) => ScalarType::Real,
            Value::Double(_) => ScalarType::Double,
            Value::Decimal(_) => ScalarType::Decimal,
            Value::Text(_) => ScalarType::Varchar,
            Value::Bytes(_) => ScalarType::Varbinary,
            Value::Date(_) => ScalarType::Date,
            Value::Time(_) => ScalarType::Time,
            Value::Timestamp(_) => ScalarType::Timestamp,
        };
        Some(t)
    }

    pub fn kind_name(&self) -> &'static str {
        self.scalar_type().map(|t| t.sql_name()).unwrap_or("NULL")
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer columns of any width, widened.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::TinyInt(v) => Some(*v as i64),
            Value::SmallInt(v) => Some(*v as i64),
            Value::Int(v) => Some(*v as i64),
            Value::BigInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Real(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            _ => self.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::TinyInt(v) => write!(f, "{v}"),
            Value::SmallInt(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::BigInt(v) => write!(f, "{v}"),
            Value::Real(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Decimal(v) | Value::Text(v) => f.write_str(v),
            Value::Bytes(v) => {
                f.write_str("0x")?;
                for b in v.iter() {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
            Value::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
            Value::Time(v) => write!(f, "{}", v.format("%H:%M:%S%.3f")),
            Value::Timestamp(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S%.3f")),
        }
    }
}

impl ScalarType {
    /// Append `value` as this column type: null marker, then the payload.
    pub fn encode(self, value: &Value, buf: &mut BytesMut) -> CodecResult<()> {
        if value.is_null() {
            buf.put_u8(NULL_MARKER);
            return Ok(());
        }
        if value.scalar_type() != Some(self) {
            return Err(CodecError::TypeMismatch {
                expected: self.sql_name(),
                found: value.kind_name(),
            });
        }

        buf.put_u8(PRESENT_MARKER);
        match value {
            Value::Bool(v) => buf.put_u8(u8::from(*v)),
            Value::TinyInt(v) => buf.put_i8(*v),
            Value::SmallInt(v) => buf.put_i16(*v),
            Value::Int(v) => buf.put_i32(*v),
            Value::BigInt(v) => buf.put_i64(*v),
            Value::Real(v) => buf.put_u32(v.to_bits()),
            Value::Double(v) => buf.put_u64(v.to_bits()),
            Value::Decimal(v) => {
                validate_decimal(v)?;
                put_variable(buf, v.as_bytes())?;
            }
            Value::Text(v) => put_variable(buf, v.as_bytes())?,
            Value::Bytes(v) => put_variable(buf, v)?,
            Value::Date(v) => buf.put_i64(date_to_millis(*v)),
            Value::Time(v) => buf.put_i64(time_to_millis(*v)),
            Value::Timestamp(v) => buf.put_i64(v.timestamp_millis()),
            Value::Null => unreachable!("null handled above"),
        }
        Ok(())
    }

    /// Read one column value (null marker included) from `buf`.
    pub fn decode(self, buf: &mut impl Buf) -> CodecResult<Value> {
        need(buf, 1)?;
        match buf.get_u8() {
            NULL_MARKER => return Ok(Value::Null),
            PRESENT_MARKER => {}
            other => return Err(CodecError::InvalidNullMarker(other)),
        }

        let payload = match self.width() {
            Payload::Fixed(width) => {
                need(buf, width)?;
                buf.copy_to_bytes(width)
            }
            Payload::Variable => {
                need(buf, 4)?;
                let len = buf.get_u32() as usize;
                check_size(len)?;
                need(buf, len)?;
                buf.copy_to_bytes(len)
            }
            Payload::Absent => Bytes::new(),
        };
        self.decode_payload(payload)
    }

    /// Interpret a payload that has already been split off the stream.
    pub fn decode_payload(self, payload: Bytes) -> CodecResult<Value> {
        if let Payload::Fixed(width) = self.width() {
            if payload.len() != width {
                return Err(CodecError::Truncated {
                    needed: width,
                    available: payload.len(),
                });
            }
        }

        let mut p = payload;
        let value = match self {
            ScalarType::Boolean => match p.get_u8() {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                other => {
                    return Err(CodecError::InvalidValue {
                        kind: "BOOLEAN",
                        detail: format!("byte 0x{other:02x}"),
                    })
                }
            },
            ScalarType::TinyInt => Value::TinyInt(p.get_i8()),
            ScalarType::SmallInt => Value::SmallInt(p.get_i16()),
            ScalarType::Integer => Value::Int(p.get_i32()),
            ScalarType::BigInt => Value::BigInt(p.get_i64()),
            ScalarType::Real => Value::Real(f32::from_bits(p.get_u32())),
            ScalarType::Double => Value::Double(f64::from_bits(p.get_u64())),
            ScalarType::Decimal => {
                let text = utf8(p, "DECIMAL")?;
                validate_decimal(&text)?;
                Value::Decimal(text)
            }
            ScalarType::Varchar => Value::Text(utf8(p, "VARCHAR")?),
            ScalarType::Varbinary => Value::Bytes(p),
            ScalarType::Date => Value::Date(millis_to_date(p.get_i64())?),
            ScalarType::Time => Value::Time(millis_to_time(p.get_i64())?),
            ScalarType::Timestamp => {
                let ms = p.get_i64();
                let ts = DateTime::from_timestamp_millis(ms).ok_or_else(|| {
                    CodecError::InvalidValue {
                        kind: "TIMESTAMP",
                        detail: format!("{ms} ms out of range"),
                    }
                })?;
                Value::Timestamp(ts)
            }
        };
        Ok(value)
    }
}

/// Length-prefixed bytes, as used by variable-width frame payloads too.
pub fn put_variable(buf: &mut BytesMut, bytes: &[u8]) -> CodecResult<()> {
    check_size(bytes.len())?;
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
    Ok(())
}

pub fn check_size(len: usize) -> CodecResult<()> {
    if len > MAX_PAYLOAD_SIZE {
        return Err(CodecError::PayloadTooLarge {
            size: len,
            limit: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(())
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

fn utf8(bytes: Bytes, what: &'static str) -> CodecResult<String> {
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8(what))
}

/// Accepts `[-+]digits[.digits]`.
fn validate_decimal(text: &str) -> CodecResult<()> {
    let unsigned = text.strip_prefix(['-', '+']).unwrap_or(text);
    let (int_part, frac_part) = match unsigned.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (unsigned, None),
    };
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if digits(int_part) && frac_part.map_or(true, digits) {
        Ok(())
    } else {
        Err(CodecError::InvalidValue {
            kind: "DECIMAL",
            detail: format!("'{text}' is not decimal text"),
        })
    }
}

fn date_to_millis(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
}

fn millis_to_date(ms: i64) -> CodecResult<NaiveDate> {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.date_naive())
        .ok_or_else(|| CodecError::InvalidValue {
            kind: "DATE",
            detail: format!("{ms} ms out of range"),
        })
}

fn time_to_millis(time: NaiveTime) -> i64 {
    time.num_seconds_from_midnight() as i64 * 1000 + (time.nanosecond() / 1_000_000) as i64
}

fn millis_to_time(ms: i64) -> CodecResult<NaiveTime> {
    if !(0..MILLIS_PER_DAY).contains(&ms) {
        return Err(CodecError::InvalidValue {
            kind: "TIME",
            detail: format!("{ms} ms is not within one day"),
        });
    }
    let secs = (ms / 1000) as u32;
    let nanos = ((ms % 1000) * 1_000_000) as u32;
    NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos).ok_or_else(|| {
        CodecError::InvalidValue {
            kind: "TIME",
            detail: format!("{ms} ms"),
        }
    })
}

//! Session value model.
//!
//! [`SessionValue`] is the closed set of things a session field can hold.
//! Scalars map one-to-one onto codec tags; anything else must pass through
//! [`SessionValue::opaque`], which is where unsupported shapes are rejected
//! before they ever reach a record.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{CodecError, CodecResult};

/// A single session field value.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionValue {
    /// Absence. Setting a field to `Null` removes it.
    Null,
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    Char(char),
    F32(f32),
    F64(f64),
    /// Persisted as its nearest `f64`; digits beyond double precision are lost.
    Decimal(Decimal),
    /// Persisted with 100ns resolution.
    DateTime(DateTime<Utc>),
    Text(String),
    /// Structured value serialized through serde.
    Opaque(serde_json::Value),
}

impl SessionValue {
    /// Validate and wrap an arbitrary serializable value.
    ///
    /// Fails with `UnsupportedType` when serde cannot represent the value as
    /// a self-describing tree (for example a map with non-string keys).
    pub fn opaque<T: Serialize + ?Sized>(value: &T) -> CodecResult<Self> {
        serde_json::to_value(value)
            .map(SessionValue::Opaque)
            .map_err(|e| {
                CodecError::unsupported(format!("{} ({})", std::any::type_name::<T>(), e))
            })
    }

    /// Read a structured value back into `T`.
    pub fn to_opaque<T: DeserializeOwned>(&self) -> CodecResult<T> {
        match self {
            SessionValue::Opaque(tree) => serde_json::from_value(tree.clone()).map_err(|e| {
                CodecError::unsupported(format!("{} ({})", std::any::type_name::<T>(), e))
            }),
            other => Err(CodecError::unsupported(format!(
                "{} is not an opaque value",
                other.type_name()
            ))),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SessionValue::Null)
    }

    /// Human-readable name of the variant.
    pub fn type_name(&self) -> &'static str {
        match self {
            SessionValue::Null => "null",
            SessionValue::Bool(_) => "bool",
            SessionValue::I8(_) => "i8",
            SessionValue::U8(_) => "u8",
            SessionValue::I16(_) => "i16",
            SessionValue::U16(_) => "u16",
            SessionValue::I32(_) => "i32",
            SessionValue::U32(_) => "u32",
            SessionValue::I64(_) => "i64",
            SessionValue::U64(_) => "u64",
            SessionValue::Char(_) => "char",
            SessionValue::F32(_) => "f32",
            SessionValue::F64(_) => "f64",
            SessionValue::Decimal(_) => "decimal",
            SessionValue::DateTime(_) => "datetime",
            SessionValue::Text(_) => "text",
            SessionValue::Opaque(_) => "opaque",
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            SessionValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SessionValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Any integer variant that fits in an `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            SessionValue::I8(v) => Some(v.into()),
            SessionValue::U8(v) => Some(v.into()),
            SessionValue::I16(v) => Some(v.into()),
            SessionValue::U16(v) => Some(v.into()),
            SessionValue::I32(v) => Some(v.into()),
            SessionValue::U32(v) => Some(v.into()),
            SessionValue::I64(v) => Some(v),
            SessionValue::U64(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }
}

macro_rules! impl_from_scalar {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for SessionValue {
                fn from(value: $ty) -> Self {
                    SessionValue::$variant(value)
                }
            }
        )*
    };
}

impl_from_scalar! {
    bool => Bool,
    i8 => I8,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    char => Char,
    f32 => F32,
    f64 => F64,
    Decimal => Decimal,
    DateTime<Utc> => DateTime,
    String => Text,
    serde_json::Value => Opaque,
}

impl From<&str> for SessionValue {
    fn from(value: &str) -> Self {
        SessionValue::Text(value.to_string())
    }
}

impl<T: Into<SessionValue>> From<Option<T>> for SessionValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SessionValue::Null)
    }
}

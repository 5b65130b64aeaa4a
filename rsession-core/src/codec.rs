//! Self-describing binary codec for session values.
//!
//! # Binary Format
//!
//! Every encoded value is `[tag: 1 byte][payload]`. The payload has no length
//! prefix: fixed-width types carry exactly their width, text and opaque
//! values consume the rest of the buffer, and `Null` has no payload at all.
//! Multi-byte payloads are little-endian.
//!
//! Tag numbers follow the platform type-code numbering used by earlier
//! session stores. Only the numbering is shared: payload layouts differ
//! (chars are four bytes, unsigned 64-bit values have their own tag, opaque
//! values are JSON), so records written by such stores are not readable
//! without migration.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

use crate::error::{CodecError, CodecResult};
use crate::value::SessionValue;

/// 100ns ticks between 0001-01-01T00:00:00Z and the Unix epoch.
pub const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

const TICKS_PER_SECOND: i128 = 10_000_000;
const NANOS_PER_TICK: i128 = 100;

/// Leading type byte of an encoded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeTag {
    Empty = 0,
    Object = 1,
    DbNull = 2,
    Boolean = 3,
    Char = 4,
    SByte = 5,
    Byte = 6,
    Int16 = 7,
    UInt16 = 8,
    Int32 = 9,
    UInt32 = 10,
    Int64 = 11,
    UInt64 = 12,
    Single = 13,
    Double = 14,
    Decimal = 15,
    DateTime = 16,
    String = 18,
}

impl TypeTag {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Map a leading byte back to its tag. Returns `None` for unknown tags.
    pub fn from_byte(byte: u8) -> Option<Self> {
        let tag = match byte {
            0 => TypeTag::Empty,
            1 => TypeTag::Object,
            2 => TypeTag::DbNull,
            3 => TypeTag::Boolean,
            4 => TypeTag::Char,
            5 => TypeTag::SByte,
            6 => TypeTag::Byte,
            7 => TypeTag::Int16,
            8 => TypeTag::UInt16,
            9 => TypeTag::Int32,
            10 => TypeTag::UInt32,
            11 => TypeTag::Int64,
            12 => TypeTag::UInt64,
            13 => TypeTag::Single,
            14 => TypeTag::Double,
            15 => TypeTag::Decimal,
            16 => TypeTag::DateTime,
            18 => TypeTag::String,
            _ => return None,
        };
        Some(tag)
    }

    /// The tag a value encodes under.
    pub fn of(value: &SessionValue) -> Self {
        match value {
            SessionValue::Null => TypeTag::Empty,
            SessionValue::Bool(_) => TypeTag::Boolean,
            SessionValue::I8(_) => TypeTag::SByte,
            SessionValue::U8(_) => TypeTag::Byte,
            SessionValue::I16(_) => TypeTag::Int16,
            SessionValue::U16(_) => TypeTag::UInt16,
            SessionValue::I32(_) => TypeTag::Int32,
            SessionValue::U32(_) => TypeTag::UInt32,
            SessionValue::I64(_) => TypeTag::Int64,
            SessionValue::U64(_) => TypeTag::UInt64,
            SessionValue::Char(_) => TypeTag::Char,
            SessionValue::F32(_) => TypeTag::Single,
            SessionValue::F64(_) => TypeTag::Double,
            SessionValue::Decimal(_) => TypeTag::Decimal,
            SessionValue::DateTime(_) => TypeTag::DateTime,
            SessionValue::Text(_) => TypeTag::String,
            SessionValue::Opaque(_) => TypeTag::Object,
        }
    }
}

/// Encode a value as `[tag][payload]`.
pub fn encode(value: &SessionValue) -> Vec<u8> {
    let tag = TypeTag::of(value);
    let mut buf = Vec::with_capacity(9);
    buf.push(tag.as_byte());
    match value {
        SessionValue::Null => {}
        SessionValue::Bool(b) => buf.push(u8::from(*b)),
        SessionValue::I8(v) => buf.extend_from_slice(&v.to_le_bytes()),
        SessionValue::U8(v) => buf.push(*v),
        SessionValue::I16(v) => buf.extend_from_slice(&v.to_le_bytes()),
        SessionValue::U16(v) => buf.extend_from_slice(&v.to_le_bytes()),
        SessionValue::I32(v) => buf.extend_from_slice(&v.to_le_bytes()),
        SessionValue::U32(v) => buf.extend_from_slice(&v.to_le_bytes()),
        SessionValue::I64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        SessionValue::U64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        SessionValue::Char(c) => buf.extend_from_slice(&u32::from(*c).to_le_bytes()),
        SessionValue::F32(v) => buf.extend_from_slice(&v.to_le_bytes()),
        SessionValue::F64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        SessionValue::Decimal(d) => {
            let approx = d.to_f64().unwrap_or_default();
            buf.extend_from_slice(&approx.to_le_bytes());
        }
        SessionValue::DateTime(dt) => buf.extend_from_slice(&datetime_to_ticks(dt).to_le_bytes()),
        SessionValue::Text(s) => buf.extend_from_slice(s.as_bytes()),
        // serde_json's default map is ordered, so equal trees encode equally.
        SessionValue::Opaque(tree) => buf.extend_from_slice(tree.to_string().as_bytes()),
    }
    buf
}

/// Decode `[tag][payload]` back into a value.
///
/// An empty buffer decodes as `Null`.
pub fn decode(bytes: &[u8]) -> CodecResult<SessionValue> {
    let Some((&first, payload)) = bytes.split_first() else {
        return Ok(SessionValue::Null);
    };
    let tag = TypeTag::from_byte(first)
        .ok_or_else(|| CodecError::unsupported(format!("unknown type tag {}", first)))?;

    let value = match tag {
        TypeTag::Empty | TypeTag::DbNull => SessionValue::Null,
        TypeTag::Boolean => SessionValue::Bool(fixed::<1>(tag, payload)?[0] > 0),
        TypeTag::SByte => SessionValue::I8(i8::from_le_bytes(fixed(tag, payload)?)),
        TypeTag::Byte => SessionValue::U8(fixed::<1>(tag, payload)?[0]),
        TypeTag::Int16 => SessionValue::I16(i16::from_le_bytes(fixed(tag, payload)?)),
        TypeTag::UInt16 => SessionValue::U16(u16::from_le_bytes(fixed(tag, payload)?)),
        TypeTag::Int32 => SessionValue::I32(i32::from_le_bytes(fixed(tag, payload)?)),
        TypeTag::UInt32 => SessionValue::U32(u32::from_le_bytes(fixed(tag, payload)?)),
        TypeTag::Int64 => SessionValue::I64(i64::from_le_bytes(fixed(tag, payload)?)),
        TypeTag::UInt64 => SessionValue::U64(u64::from_le_bytes(fixed(tag, payload)?)),
        TypeTag::Char => {
            let scalar = u32::from_le_bytes(fixed(tag, payload)?);
            let c = char::from_u32(scalar).ok_or_else(|| {
                CodecError::invalid(first, format!("{:#x} is not a unicode scalar value", scalar))
            })?;
            SessionValue::Char(c)
        }
        TypeTag::Single => SessionValue::F32(f32::from_le_bytes(fixed(tag, payload)?)),
        TypeTag::Double => SessionValue::F64(f64::from_le_bytes(fixed(tag, payload)?)),
        TypeTag::Decimal => {
            let approx = f64::from_le_bytes(fixed(tag, payload)?);
            let d = Decimal::from_f64(approx).ok_or_else(|| {
                CodecError::invalid(first, format!("{} is not representable as a decimal", approx))
            })?;
            SessionValue::Decimal(d)
        }
        TypeTag::DateTime => {
            let ticks = i64::from_le_bytes(fixed(tag, payload)?);
            SessionValue::DateTime(ticks_to_datetime(ticks).ok_or_else(|| {
                CodecError::invalid(first, format!("tick count {} is out of range", ticks))
            })?)
        }
        TypeTag::String => {
            let text = std::str::from_utf8(payload)
                .map_err(|e| CodecError::invalid(first, e.to_string()))?;
            SessionValue::Text(text.to_string())
        }
        TypeTag::Object => {
            let tree = serde_json::from_slice(payload)
                .map_err(|e| CodecError::invalid(first, e.to_string()))?;
            SessionValue::Opaque(tree)
        }
    };
    Ok(value)
}

/// Take the first `N` payload bytes. Extra trailing bytes are ignored.
fn fixed<const N: usize>(tag: TypeTag, payload: &[u8]) -> CodecResult<[u8; N]> {
    payload
        .get(..N)
        .and_then(|head| <[u8; N]>::try_from(head).ok())
        .ok_or(CodecError::MalformedEncoding {
            tag: tag.as_byte(),
            expected: N,
            actual: payload.len(),
        })
}

/// Ticks since 0001-01-01, truncated to 100ns and saturated to `i64`.
pub fn datetime_to_ticks(dt: &DateTime<Utc>) -> i64 {
    let ticks = i128::from(dt.timestamp()) * TICKS_PER_SECOND
        + i128::from(dt.timestamp_subsec_nanos()) / NANOS_PER_TICK
        + i128::from(UNIX_EPOCH_TICKS);
    ticks.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
}

pub fn ticks_to_datetime(ticks: i64) -> Option<DateTime<Utc>> {
    let since_unix = i128::from(ticks) - i128::from(UNIX_EPOCH_TICKS);
    let secs = i64::try_from(since_unix.div_euclid(TICKS_PER_SECOND)).ok()?;
    let nanos = u32::try_from(since_unix.rem_euclid(TICKS_PER_SECOND) * NANOS_PER_TICK).ok()?;
    DateTime::<Utc>::from_timestamp(secs, nanos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use std::str::FromStr;

    fn roundtrip(value: SessionValue) -> SessionValue {
        decode(&encode(&value)).expect("decode should succeed")
    }

    #[test]
    fn test_null_is_single_tag_byte() {
        assert_eq!(encode(&SessionValue::Null), vec![0u8]);
    }

    #[test]
    fn test_empty_input_decodes_as_null() {
        assert_eq!(decode(&[]).unwrap(), SessionValue::Null);
        assert_eq!(decode(&[TypeTag::DbNull.as_byte()]).unwrap(), SessionValue::Null);
    }

    #[test]
    fn test_scalar_roundtrips() {
        let values = vec![
            SessionValue::Bool(true),
            SessionValue::Bool(false),
            SessionValue::I8(-128),
            SessionValue::U8(255),
            SessionValue::I16(-12_345),
            SessionValue::U16(54_321),
            SessionValue::I32(i32::MIN),
            SessionValue::U32(u32::MAX),
            SessionValue::I64(-9_000_000_000),
            SessionValue::U64(u64::MAX),
            SessionValue::Char('ß'),
            SessionValue::Char('🦀'),
            SessionValue::F32(3.25),
            SessionValue::F64(-0.000_123_456_789),
            SessionValue::Text("héllo wörld".to_string()),
            SessionValue::Text(String::new()),
        ];
        for value in values {
            assert_eq!(roundtrip(value.clone()), value);
        }
    }

    #[test]
    fn test_u64_has_its_own_tag() {
        assert_eq!(encode(&SessionValue::U64(1))[0], TypeTag::UInt64.as_byte());
    }

    #[test]
    fn test_little_endian_payload() {
        assert_eq!(
            encode(&SessionValue::I32(0x0102_0304)),
            vec![TypeTag::Int32.as_byte(), 0x04, 0x03, 0x02, 0x01]
        );
    }

    #[test]
    fn test_decimal_roundtrip_within_double_precision() {
        let d = Decimal::from_str("1234.5678").unwrap();
        match roundtrip(SessionValue::Decimal(d)) {
            SessionValue::Decimal(back) => {
                let diff = (back - d).abs();
                assert!(diff < Decimal::from_str("0.000001").unwrap());
            }
            other => panic!("expected decimal, got {:?}", other),
        }
    }

    #[test]
    fn test_datetime_roundtrip_at_tick_resolution() {
        let dt = Utc.with_ymd_and_hms(2024, 2, 29, 13, 45, 7).unwrap()
            + chrono::Duration::nanoseconds(123_456_700);
        assert_eq!(roundtrip(SessionValue::DateTime(dt)), SessionValue::DateTime(dt));
    }

    #[test]
    fn test_unix_epoch_tick_constant() {
        let epoch = DateTime::<Utc>::from_timestamp(0, 0).unwrap();
        assert_eq!(datetime_to_ticks(&epoch), UNIX_EPOCH_TICKS);
        assert_eq!(ticks_to_datetime(0).unwrap().to_rfc3339(), "0001-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_opaque_roundtrip_and_determinism() {
        let a: serde_json::Value = serde_json::from_str(r#"{"b":1,"a":[true,null]}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"a":[true,null],"b":1}"#).unwrap();
        assert_eq!(encode(&SessionValue::Opaque(a.clone())), encode(&SessionValue::Opaque(b)));
        assert_eq!(roundtrip(SessionValue::Opaque(a.clone())), SessionValue::Opaque(a));
    }

    #[test]
    fn test_short_payload_is_malformed() {
        let err = decode(&[TypeTag::Int64.as_byte(), 1, 2, 3]).unwrap_err();
        assert_eq!(
            err,
            CodecError::MalformedEncoding {
                tag: TypeTag::Int64.as_byte(),
                expected: 8,
                actual: 3,
            }
        );
        let err = decode(&[TypeTag::Boolean.as_byte()]).unwrap_err();
        assert!(err.is_malformed());
    }

    #[test]
    fn test_two_byte_char_payload_is_malformed() {
        let err = decode(&[TypeTag::Char.as_byte(), b'A', 0]).unwrap_err();
        assert_eq!(
            err,
            CodecError::MalformedEncoding {
                tag: TypeTag::Char.as_byte(),
                expected: 4,
                actual: 2,
            }
        );
    }

    #[test]
    fn test_unknown_tag_is_unsupported() {
        let err = decode(&[17, 0, 0]).unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedType { .. }));
        assert!(TypeTag::from_byte(200).is_none());
    }

    #[test]
    fn test_invalid_text_and_char_payloads() {
        let err = decode(&[TypeTag::String.as_byte(), 0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, CodecError::InvalidPayload { tag: 18, .. }));

        let mut surrogate = vec![TypeTag::Char.as_byte()];
        surrogate.extend_from_slice(&0xD800u32.to_le_bytes());
        assert!(decode(&surrogate).unwrap_err().is_malformed());

        let mut nan = vec![TypeTag::Decimal.as_byte()];
        nan.extend_from_slice(&f64::NAN.to_le_bytes());
        assert!(decode(&nan).unwrap_err().is_malformed());
    }

    #[test]
    fn test_tag_mapping_is_bijective() {
        for byte in 0..=u8::MAX {
            if let Some(tag) = TypeTag::from_byte(byte) {
                assert_eq!(tag.as_byte(), byte);
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        /// Integers and text survive a round trip bit for bit.
        #[test]
        fn prop_integer_and_text_roundtrip(
            a in any::<i64>(),
            b in any::<u32>(),
            c in any::<i16>(),
            s in ".*",
        ) {
            prop_assert_eq!(roundtrip(SessionValue::I64(a)), SessionValue::I64(a));
            prop_assert_eq!(roundtrip(SessionValue::U32(b)), SessionValue::U32(b));
            prop_assert_eq!(roundtrip(SessionValue::I16(c)), SessionValue::I16(c));
            prop_assert_eq!(roundtrip(SessionValue::Text(s.clone())), SessionValue::Text(s));
        }

        /// Floats round trip bit for bit, NaN payloads included.
        #[test]
        fn prop_float_bits_roundtrip(bits64 in any::<u64>(), bits32 in any::<u32>()) {
            match roundtrip(SessionValue::F64(f64::from_bits(bits64))) {
                SessionValue::F64(v) => prop_assert_eq!(v.to_bits(), bits64),
                other => prop_assert!(false, "unexpected {:?}", other),
            }
            match roundtrip(SessionValue::F32(f32::from_bits(bits32))) {
                SessionValue::F32(v) => prop_assert_eq!(v.to_bits(), bits32),
                other => prop_assert!(false, "unexpected {:?}", other),
            }
        }

        /// Truncated buffers never panic and never decode to a wrong value silently.
        #[test]
        fn prop_truncation_is_detected(v in any::<u64>(), cut in 1usize..8) {
            let encoded = encode(&SessionValue::U64(v));
            let truncated = &encoded[..encoded.len() - cut];
            prop_assert!(decode(truncated).unwrap_err().is_malformed());
        }
    }
}

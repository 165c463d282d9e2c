use std::fmt;
use std::io::Cursor;

use rmpv::Value as Packed;
use serde_json::{Map, Number, Value};

pub const DEFAULT_MAX_ENVELOPE_SIZE_BYTES: usize = 8 * 1024 * 1024;
pub const FRAME_HEADER_SIZE_BYTES: usize = 4;

#[derive(Debug)]
pub enum CodecError {
    PayloadTooLarge { size: usize, limit: usize },
    FrameTooShort { size: usize },
    FrameLengthMismatch { declared: usize, actual_payload: usize },
    ProtocolZeroLength,
    ProtocolLengthTooLarge { length: usize, limit: usize },
    MessagePackEncode(rmpv::encode::Error),
    MessagePackDecode(rmpv::decode::Error),
    TrailingDataInPayload,
    FrameMustBeMap,
    MapKeyMustBeUtf8String,
    NonFiniteFloat,
    IntegerOutOfRange,
    InvalidUtf8String,
    BinaryNotAllowed,
    ExtensionTypeNotAllowed,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PayloadTooLarge { size, limit } => {
                write!(f, "payload size {size} exceeds limit {limit}")
            }
            Self::FrameTooShort { size } => write!(f, "frame size {size} is smaller than 4-byte header"),
            Self::FrameLengthMismatch {
                declared,
                actual_payload,
            } => write!(
                f,
                "frame length mismatch: declared {declared} bytes, actual payload {actual_payload} bytes"
            ),
            Self::ProtocolZeroLength => {
                write!(f, "protocol error: frame length cannot be zero")
            }
            Self::ProtocolLengthTooLarge { length, limit } => write!(
                f,
                "protocol error: frame length {length} exceeds max {limit}"
            ),
            Self::MessagePackEncode(source) => write!(f, "messagepack encode error: {source}"),
            Self::MessagePackDecode(source) => write!(f, "messagepack decode error: {source}"),
            Self::TrailingDataInPayload => write!(f, "payload contains trailing MessagePack data"),
            Self::FrameMustBeMap => write!(f, "frame payload must be a map"),
            Self::MapKeyMustBeUtf8String => write!(f, "map keys must be UTF-8 strings"),
            Self::NonFiniteFloat => write!(f, "NaN and infinite floats cannot be represented"),
            Self::IntegerOutOfRange => write!(f, "integer value does not fit in 64 bits"),
            Self::InvalidUtf8String => write!(f, "string values must be valid UTF-8"),
            Self::BinaryNotAllowed => write!(f, "MessagePack binary values are not allowed"),
            Self::ExtensionTypeNotAllowed => {
                write!(f, "MessagePack extension values are not allowed")
            }
        }
    }
}

impl std::error::Error for CodecError {}

/// Reads the 4-byte big-endian length header and checks it against `limit`.
pub fn decode_header(header: [u8; FRAME_HEADER_SIZE_BYTES], limit: usize) -> Result<usize, CodecError> {
    let declared_len = u32::from_be_bytes(header) as usize;
    if declared_len == 0 {
        return Err(CodecError::ProtocolZeroLength);
    }
    if declared_len > limit {
        return Err(CodecError::ProtocolLengthTooLarge {
            length: declared_len,
            limit,
        });
    }
    Ok(declared_len)
}

pub fn encode_frame(value: &Value, limit: usize) -> Result<Vec<u8>, CodecError> {
    let payload = encode_payload(value, limit)?;

    let declared_len = u32::try_from(payload.len()).map_err(|_| CodecError::PayloadTooLarge {
        size: payload.len(),
        limit: u32::MAX as usize,
    })?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE_BYTES + payload.len());
    frame.extend_from_slice(&declared_len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

pub fn decode_frame(frame: &[u8], limit: usize) -> Result<Value, CodecError> {
    if frame.len() < FRAME_HEADER_SIZE_BYTES {
        return Err(CodecError::FrameTooShort { size: frame.len() });
    }

    let declared_len = decode_header([frame[0], frame[1], frame[2], frame[3]], limit)?;
    let payload = &frame[FRAME_HEADER_SIZE_BYTES..];
    if payload.len() != declared_len {
        return Err(CodecError::FrameLengthMismatch {
            declared: declared_len,
            actual_payload: payload.len(),
        });
    }

    decode_payload(payload, limit)
}

pub fn encode_payload(value: &Value, limit: usize) -> Result<Vec<u8>, CodecError> {
    if !value.is_object() {
        return Err(CodecError::FrameMustBeMap);
    }

    let packed = to_packed(value)?;
    let mut encoded = Vec::new();
    rmpv::encode::write_value(&mut encoded, &packed).map_err(CodecError::MessagePackEncode)?;

    if encoded.len() > limit {
        return Err(CodecError::PayloadTooLarge {
            size: encoded.len(),
            limit,
        });
    }

    Ok(encoded)
}

pub fn decode_payload(payload: &[u8], limit: usize) -> Result<Value, CodecError> {
    if payload.is_empty() {
        return Err(CodecError::ProtocolZeroLength);
    }
    if payload.len() > limit {
        return Err(CodecError::PayloadTooLarge {
            size: payload.len(),
            limit,
        });
    }

    let mut cursor = Cursor::new(payload);
    let packed = rmpv::decode::read_value(&mut cursor).map_err(CodecError::MessagePackDecode)?;
    if cursor.position() as usize != payload.len() {
        return Err(CodecError::TrailingDataInPayload);
    }

    if !matches!(packed, Packed::Map(_)) {
        return Err(CodecError::FrameMustBeMap);
    }
    from_packed(packed)
}

fn to_packed(value: &Value) -> Result<Packed, CodecError> {
    Ok(match value {
        Value::Null => Packed::Nil,
        Value::Bool(flag) => Packed::Boolean(*flag),
        Value::Number(number) => {
            if let Some(signed) = number.as_i64() {
                Packed::Integer(signed.into())
            } else if let Some(unsigned) = number.as_u64() {
                Packed::Integer(unsigned.into())
            } else {
                Packed::F64(number.as_f64().ok_or(CodecError::NonFiniteFloat)?)
            }
        }
        Value::String(text) => Packed::String(text.as_str().into()),
        Value::Array(items) => Packed::Array(items.iter().map(to_packed).collect::<Result<_, _>>()?),
        Value::Object(map) => Packed::Map(
            map.iter()
                .map(|(key, value)| -> Result<(Packed, Packed), CodecError> {
                    Ok((Packed::String(key.as_str().into()), to_packed(value)?))
                })
                .collect::<Result<_, CodecError>>()?,
        ),
    })
}

fn from_packed(packed: Packed) -> Result<Value, CodecError> {
    Ok(match packed {
        Packed::Nil => Value::Null,
        Packed::Boolean(flag) => Value::Bool(flag),
        Packed::Integer(number) => match (number.as_i64(), number.as_u64()) {
            (Some(signed), _) => Value::from(signed),
            (None, Some(unsigned)) => Value::from(unsigned),
            (None, None) => return Err(CodecError::IntegerOutOfRange),
        },
        Packed::F32(float) => float_value(f64::from(float))?,
        Packed::F64(float) => float_value(float)?,
        Packed::String(text) => match text.into_str() {
            Some(text) => Value::String(text),
            None => return Err(CodecError::InvalidUtf8String),
        },
        Packed::Binary(_) => return Err(CodecError::BinaryNotAllowed),
        Packed::Array(items) => Value::Array(
            items
                .into_iter()
                .map(from_packed)
                .collect::<Result<_, _>>()?,
        ),
        Packed::Map(entries) => {
            let mut map = Map::with_capacity(entries.len());
            for (key, value) in entries {
                let Packed::String(key) = key else {
                    return Err(CodecError::MapKeyMustBeUtf8String);
                };
                let Some(key) = key.into_str() else {
                    return Err(CodecError::MapKeyMustBeUtf8String);
                };
                map.insert(key, from_packed(value)?);
            }
            Value::Object(map)
        }
        Packed::Ext(_, _) => return Err(CodecError::ExtensionTypeNotAllowed),
    })
}

fn float_value(float: f64) -> Result<Value, CodecError> {
    Number::from_f64(float)
        .map(Value::Number)
        .ok_or(CodecError::NonFiniteFloat)
}

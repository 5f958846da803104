//! Hand-rolled binary codec for on-disk structures.
//!
//! Log records need a fixed, crate-controlled wire format (spec.md §6), so
//! this mirrors the teacher crate's `Encodeable`/`Decodeable` traits
//! rather than reaching for a general-purpose serialization crate.

use std::convert::TryInto;
use std::io::Read;
use std::mem::size_of;

use thiserror::Error;

/// A malformed byte stream: truncated input, an unrecognized tag byte, or
/// invalid UTF-8. Callers propagate this up to `RecoveryError::CorruptLogRecord`
/// rather than panicking (spec.md §7).
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid tag byte: {0}")]
    InvalidTag(u8),

    #[error("invalid utf-8 in string")]
    InvalidUtf8,
}

pub type DecodeResult<T> = Result<T, DecodeError>;

pub trait Encode {
    fn encode(&self, buf: &mut Vec<u8>);
}

pub trait Decode: Sized {
    fn decode(reader: &mut impl Read) -> DecodeResult<Self>;
}

pub fn read_exact_bytes(reader: &mut impl Read, n: usize) -> DecodeResult<Vec<u8>> {
    let mut buf = vec![0u8; n];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

macro_rules! impl_int_codec {
    (for $($t:ty),+) => {
        $(
            impl Encode for $t {
                fn encode(&self, buf: &mut Vec<u8>) {
                    buf.extend_from_slice(&self.to_le_bytes());
                }
            }

            impl Decode for $t {
                fn decode(reader: &mut impl Read) -> DecodeResult<Self> {
                    let bytes = read_exact_bytes(reader, size_of::<Self>())?;
                    Ok(Self::from_le_bytes(bytes.try_into().unwrap()))
                }
            }
        )*
    };
}

impl_int_codec!(for u8, u16, u32, u64, i64, usize);

impl Encode for bool {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(*self as u8);
    }
}

impl Decode for bool {
    fn decode(reader: &mut impl Read) -> DecodeResult<Self> {
        Ok(u8::decode(reader)? != 0)
    }
}

/// Length-prefixed (u32) byte blob, used for page before/after images.
impl Encode for Vec<u8> {
    fn encode(&self, buf: &mut Vec<u8>) {
        (self.len() as u32).encode(buf);
        buf.extend_from_slice(self);
    }
}

impl Decode for Vec<u8> {
    fn decode(reader: &mut impl Read) -> DecodeResult<Self> {
        let len = u32::decode(reader)? as usize;
        read_exact_bytes(reader, len)
    }
}

/// Length-prefixed (u16) UTF-8 string, used for resource-name segments.
impl Encode for String {
    fn encode(&self, buf: &mut Vec<u8>) {
        let bytes = self.as_bytes();
        (bytes.len() as u16).encode(buf);
        buf.extend_from_slice(bytes);
    }
}

impl Decode for String {
    fn decode(reader: &mut impl Read) -> DecodeResult<Self> {
        let len = u16::decode(reader)? as usize;
        let bytes = read_exact_bytes(reader, len)?;
        String::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)
    }
}

/// `Some`/`None` encoded as a 1-byte tag followed by the payload.
impl<T: Encode> Encode for Option<T> {
    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Some(v) => {
                true.encode(buf);
                v.encode(buf);
            }
            None => false.encode(buf),
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(reader: &mut impl Read) -> DecodeResult<Self> {
        if bool::decode(reader)? {
            Ok(Some(T::decode(reader)?))
        } else {
            Ok(None)
        }
    }
}

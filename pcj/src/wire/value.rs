//! Typed values stored in thread storages and carried by collectives.
//!
//! Values travel as self-describing byte blobs: a one byte type tag followed
//! by the value body. Decoding a blob under the wrong type fails with
//! `TypeMismatch` instead of yielding garbage.

use super::{WireReader, WireWriter};
use crate::error::{Error, ErrorKind, Result};

pub mod tag {
    pub const U8: u8 = 1;
    pub const U16: u8 = 2;
    pub const U32: u8 = 3;
    pub const U64: u8 = 4;
    pub const I32: u8 = 5;
    pub const I64: u8 = 6;
    pub const F64: u8 = 7;
    pub const BOOL: u8 = 8;
    pub const STR: u8 = 9;
    pub const LIST: u8 = 10;
    pub const OPTION: u8 = 11;
    pub const PAIR: u8 = 12;
    pub const UNIT: u8 = 13;
}

/// Manually serialized value. Implementors write their body in a fixed field
/// order; the matching `Decode` impl consumes the same order.
pub trait Encode {
    const TAG: u8;

    fn encode_body(&self, writer: &mut WireWriter);
}

/// Manually deserialized value.
pub trait Decode: Sized {
    const TAG: u8;

    fn decode_body(reader: &mut WireReader) -> Result<Self>;
}

/// Encodes a value into a standalone tagged blob.
pub fn to_bytes<T: Encode + ?Sized>(value: &T) -> Vec<u8> {
    let mut writer = WireWriter::with_defaults();
    writer.write_u8(T::TAG);
    value.encode_body(&mut writer);
    writer.into_bytes()
}

/// Decodes a tagged blob produced by `to_bytes`. Any failure, including a
/// tag for a different type or trailing bytes, reports `TypeMismatch`.
pub fn from_bytes<T: Decode>(bytes: &[u8]) -> Result<T> {
    let mut reader = WireReader::new(bytes);

    let found = reader
        .read_u8()
        .map_err(|_| Error::with_detail(ErrorKind::TypeMismatch, "empty value"))?;

    if found != T::TAG {
        return Err(Error::with_detail(
            ErrorKind::TypeMismatch,
            format!("expected tag {}, found {}", T::TAG, found),
        ));
    }

    let value = T::decode_body(&mut reader)
        .map_err(|err| Error::with_detail(ErrorKind::TypeMismatch, err.to_string()))?;

    reader
        .expect_end()
        .map_err(|_| Error::with_detail(ErrorKind::TypeMismatch, "trailing bytes"))?;

    Ok(value)
}

macro_rules! scalar_value {
    ($type: ty, $tag: expr, $write: ident, $read: ident) => {
        impl Encode for $type {
            const TAG: u8 = $tag;

            #[inline]
            fn encode_body(&self, writer: &mut WireWriter) {
                writer.$write(*self);
            }
        }

        impl Decode for $type {
            const TAG: u8 = $tag;

            #[inline]
            fn decode_body(reader: &mut WireReader) -> Result<Self> {
                reader.$read()
            }
        }
    };
}

scalar_value!(u8, tag::U8, write_u8, read_u8);
scalar_value!(u16, tag::U16, write_u16, read_u16);
scalar_value!(u32, tag::U32, write_u32, read_u32);
scalar_value!(u64, tag::U64, write_u64, read_u64);
scalar_value!(i32, tag::I32, write_i32, read_i32);
scalar_value!(i64, tag::I64, write_i64, read_i64);
scalar_value!(f64, tag::F64, write_f64, read_f64);
scalar_value!(bool, tag::BOOL, write_bool, read_bool);

impl Encode for str {
    const TAG: u8 = tag::STR;

    fn encode_body(&self, writer: &mut WireWriter) {
        writer.write_str(self);
    }
}

impl Encode for String {
    const TAG: u8 = tag::STR;

    fn encode_body(&self, writer: &mut WireWriter) {
        writer.write_str(self);
    }
}

impl Decode for String {
    const TAG: u8 = tag::STR;

    fn decode_body(reader: &mut WireReader) -> Result<Self> {
        reader.read_str()
    }
}

impl Encode for () {
    const TAG: u8 = tag::UNIT;

    fn encode_body(&self, _writer: &mut WireWriter) {}
}

impl Decode for () {
    const TAG: u8 = tag::UNIT;

    fn decode_body(_reader: &mut WireReader) -> Result<Self> {
        Ok(())
    }
}

impl<T: Encode> Encode for Vec<T> {
    const TAG: u8 = tag::LIST;

    fn encode_body(&self, writer: &mut WireWriter) {
        writer.write_u8(T::TAG);
        writer.write_u32(self.len() as u32);
        for item in self {
            item.encode_body(writer);
        }
    }
}

impl<T: Decode> Decode for Vec<T> {
    const TAG: u8 = tag::LIST;

    fn decode_body(reader: &mut WireReader) -> Result<Self> {
        let elem = reader.read_u8()?;
        if elem != T::TAG {
            return Err(Error::with_detail(
                ErrorKind::MalformedMessage,
                format!("expected element tag {}, found {}", T::TAG, elem),
            ));
        }

        let count = reader.read_u32()? as usize;
        let mut items = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            items.push(T::decode_body(reader)?);
        }

        Ok(items)
    }
}

impl<T: Encode> Encode for Option<T> {
    const TAG: u8 = tag::OPTION;

    fn encode_body(&self, writer: &mut WireWriter) {
        writer.write_u8(T::TAG);
        match self {
            Some(value) => {
                writer.write_bool(true);
                value.encode_body(writer);
            }
            None => writer.write_bool(false),
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    const TAG: u8 = tag::OPTION;

    fn decode_body(reader: &mut WireReader) -> Result<Self> {
        let elem = reader.read_u8()?;
        if elem != T::TAG {
            return Err(Error::with_detail(
                ErrorKind::MalformedMessage,
                format!("expected inner tag {}, found {}", T::TAG, elem),
            ));
        }

        match reader.read_bool()? {
            true => Ok(Some(T::decode_body(reader)?)),
            false => Ok(None),
        }
    }
}

impl<A: Encode, B: Encode> Encode for (A, B) {
    const TAG: u8 = tag::PAIR;

    fn encode_body(&self, writer: &mut WireWriter) {
        writer.write_u8(A::TAG);
        writer.write_u8(B::TAG);
        self.0.encode_body(writer);
        self.1.encode_body(writer);
    }
}

impl<A: Decode, B: Decode> Decode for (A, B) {
    const TAG: u8 = tag::PAIR;

    fn decode_body(reader: &mut WireReader) -> Result<Self> {
        let (first, second) = (reader.read_u8()?, reader.read_u8()?);
        if first != A::TAG || second != B::TAG {
            return Err(Error::with_detail(ErrorKind::MalformedMessage, "pair tag mismatch"));
        }

        Ok((A::decode_body(reader)?, B::decode_body(reader)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_roundtrip() {
        assert_eq!(from_bytes::<i64>(&to_bytes(&-42i64)).unwrap(), -42);
        assert_eq!(from_bytes::<f64>(&to_bytes(&1.25f64)).unwrap(), 1.25);
        assert_eq!(from_bytes::<bool>(&to_bytes(&true)).unwrap(), true);
    }

    #[test]
    fn compound_roundtrip() {
        let list = vec![1i64, 2, 3];
        assert_eq!(from_bytes::<Vec<i64>>(&to_bytes(&list)).unwrap(), list);

        let nested: Vec<Vec<u8>> = vec![vec![1, 2], vec![], vec![3]];
        assert_eq!(from_bytes::<Vec<Vec<u8>>>(&to_bytes(&nested)).unwrap(), nested);

        let pair = (7u32, String::from("x"));
        assert_eq!(from_bytes::<(u32, String)>(&to_bytes(&pair)).unwrap(), pair);

        let opt: Option<i64> = None;
        assert_eq!(from_bytes::<Option<i64>>(&to_bytes(&opt)).unwrap(), None);
    }

    #[test]
    fn wrong_type_is_a_mismatch() {
        let bytes = to_bytes(&42i64);

        let err = from_bytes::<String>(&bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);

        let err = from_bytes::<Vec<i64>>(&to_bytes(&vec![1u32])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn truncated_value_is_a_mismatch() {
        let bytes = to_bytes(&1234u64);

        let err = from_bytes::<u64>(&bytes[..4]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn trailing_bytes_are_a_mismatch() {
        let mut bytes = to_bytes(&1u8);
        bytes.push(99);

        let err = from_bytes::<u8>(&bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }
}

//! Binary wire codec. All multi-byte integers are big-endian.
//!
//! A writer that writes fields F1..Fn produces a byte stream from which a
//! reader consuming F1..Fn in the same order yields bit-identical values.
//! Truncated streams, unknown tags and undecodable payloads fail with
//! `MalformedMessage`.

pub mod value;

pub use self::value::{from_bytes, to_bytes, Decode, Encode};

use crate::config::DEFAULT_CHUNK_SIZE;
use crate::error::{Error, ErrorKind, Result};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

/// Upper bound accepted for a single length prefix. Guards the decoder
/// against allocating on corrupt input.
const MAX_SEGMENT: usize = 1 << 30;

/// Appends typed fields to a growing byte vector.
pub struct WireWriter {
    buf: Vec<u8>,
    chunk_size: usize,
}

impl WireWriter {
    #[inline]
    pub fn new(chunk_size: usize) -> WireWriter {
        WireWriter {
            buf: Vec::new(),
            chunk_size,
        }
    }

    #[inline]
    pub fn with_defaults() -> WireWriter {
        WireWriter::new(DEFAULT_CHUNK_SIZE)
    }

    #[inline]
    pub fn write_u8(&mut self, value: u8) {
        self.buf.write_u8(value).expect("Error writing u8");
    }

    #[inline]
    pub fn write_u16(&mut self, value: u16) {
        self.buf.write_u16::<BigEndian>(value).expect("Error writing u16");
    }

    #[inline]
    pub fn write_u32(&mut self, value: u32) {
        self.buf.write_u32::<BigEndian>(value).expect("Error writing u32");
    }

    #[inline]
    pub fn write_u64(&mut self, value: u64) {
        self.buf.write_u64::<BigEndian>(value).expect("Error writing u64");
    }

    #[inline]
    pub fn write_i32(&mut self, value: i32) {
        self.buf.write_i32::<BigEndian>(value).expect("Error writing i32");
    }

    #[inline]
    pub fn write_i64(&mut self, value: i64) {
        self.buf.write_i64::<BigEndian>(value).expect("Error writing i64");
    }

    #[inline]
    pub fn write_f64(&mut self, value: f64) {
        self.buf.write_f64::<BigEndian>(value).expect("Error writing f64");
    }

    #[inline]
    pub fn write_bool(&mut self, value: bool) {
        self.write_u8(value as u8);
    }

    /// Length-prefixed UTF-8 string.
    pub fn write_str(&mut self, value: &str) {
        self.write_u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
    }

    /// Opaque payload as a chunked stream: a sequence of
    /// `(chunk_len, bytes)` segments ending with a zero-length terminator.
    pub fn write_blob(&mut self, value: &[u8]) {
        for chunk in value.chunks(self.chunk_size) {
            self.write_u32(chunk.len() as u32);
            self.buf.extend_from_slice(chunk);
        }
        self.write_u32(0);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Consumes typed fields from a byte slice.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    #[inline]
    pub fn new(buf: &'a [u8]) -> WireReader<'a> {
        WireReader { buf, pos: 0 }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        if count > self.remaining() {
            return Err(Error::with_detail(ErrorKind::MalformedMessage, "truncated stream"));
        }

        let slice = &self.buf[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    #[inline]
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    #[inline]
    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    #[inline]
    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    #[inline]
    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(BigEndian::read_u64(self.take(8)?))
    }

    #[inline]
    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(BigEndian::read_i32(self.take(4)?))
    }

    #[inline]
    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(BigEndian::read_i64(self.take(8)?))
    }

    #[inline]
    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(BigEndian::read_f64(self.take(8)?))
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::with_detail(
                ErrorKind::MalformedMessage,
                format!("invalid bool byte {}", other),
            )),
        }
    }

    pub fn read_str(&mut self) -> Result<String> {
        let len = self.read_len()?;
        let bytes = self.take(len)?;

        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::with_detail(ErrorKind::MalformedMessage, "invalid utf-8"))
    }

    /// Reassembles a chunked stream into one logical byte array.
    pub fn read_blob(&mut self) -> Result<Vec<u8>> {
        let mut blob = Vec::new();

        loop {
            let len = self.read_len()?;
            if len == 0 {
                return Ok(blob);
            }

            blob.extend_from_slice(self.take(len)?);
        }
    }

    /// Fails unless the whole input has been consumed.
    pub fn expect_end(&self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(Error::with_detail(ErrorKind::MalformedMessage, "trailing bytes"));
        }

        Ok(())
    }

    fn read_len(&mut self) -> Result<usize> {
        let len = self.read_u32()? as usize;

        if len > MAX_SEGMENT {
            return Err(Error::with_detail(ErrorKind::MalformedMessage, "oversized segment"));
        }

        Ok(len)
    }
}

/// Writes a reply outcome: a success payload or an error kind plus detail.
pub fn write_outcome(writer: &mut WireWriter, outcome: &Result<Vec<u8>>) {
    match outcome {
        Ok(bytes) => {
            writer.write_u8(0);
            writer.write_blob(bytes);
        }
        Err(err) => {
            writer.write_u8(1);
            writer.write_u8(err.kind() as u8);
            writer.write_str(err.detail());
        }
    }
}

/// Reads a reply outcome written by `write_outcome`.
pub fn read_outcome(reader: &mut WireReader) -> Result<Result<Vec<u8>>> {
    match reader.read_u8()? {
        0 => Ok(Ok(reader.read_blob()?)),
        1 => {
            let kind = ErrorKind::from_u8(reader.read_u8()?).ok_or_else(|| {
                Error::with_detail(ErrorKind::MalformedMessage, "unknown error kind")
            })?;
            let detail = reader.read_str()?;
            Ok(Err(Error::with_detail(kind, detail)))
        }
        other => Err(Error::with_detail(
            ErrorKind::MalformedMessage,
            format!("invalid outcome byte {}", other),
        )),
    }
}

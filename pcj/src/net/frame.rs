use crate::error::{Error, ErrorKind, Result};
use crate::net::buffer::Buffer;
use byteorder::{BigEndian, ByteOrder};

/// Wire frame layout: `[u32 length][u8 kind][payload]`. The length prefix
/// excludes itself, so it counts the kind byte plus the payload.
pub const LENGTH_SIZE: usize = 4;

/// Sanity cap on a single frame; anything larger is treated as corruption.
pub const MAX_FRAME_SIZE: usize = 1 << 26;

/// Wraps an encoded message (kind byte plus fields) into a wire frame.
pub fn wrap(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(LENGTH_SIZE + payload.len());
    frame.extend_from_slice(&[0; LENGTH_SIZE]);
    BigEndian::write_u32(&mut frame[..LENGTH_SIZE], payload.len() as u32);
    frame.extend_from_slice(payload);
    frame
}

/// Extracts the next complete frame payload from the ingress buffer, or
/// `None` when more bytes are needed. A zero or oversized length prefix is
/// wire corruption and fails the connection.
pub fn next_frame(buffer: &mut Buffer) -> Result<Option<Vec<u8>>> {
    if buffer.len() < LENGTH_SIZE {
        return Ok(None);
    }

    let length = BigEndian::read_u32(&buffer.read_slice()[..LENGTH_SIZE]) as usize;

    if length == 0 || length > MAX_FRAME_SIZE {
        return Err(Error::with_detail(
            ErrorKind::MalformedMessage,
            format!("invalid frame length {}", length),
        ));
    }

    if buffer.len() < LENGTH_SIZE + length {
        return Ok(None);
    }

    let payload = buffer.read_slice()[LENGTH_SIZE..LENGTH_SIZE + length].to_vec();
    buffer.consume(LENGTH_SIZE + length);
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_assembles_across_split_arrivals() {
        let frame = wrap(&[9, 1, 2, 3]);
        let mut buffer = Buffer::new();

        buffer.write_bytes(&frame[..3]);
        assert_eq!(next_frame(&mut buffer).unwrap(), None);

        buffer.write_bytes(&frame[3..6]);
        assert_eq!(next_frame(&mut buffer).unwrap(), None);

        buffer.write_bytes(&frame[6..]);
        assert_eq!(next_frame(&mut buffer).unwrap(), Some(vec![9, 1, 2, 3]));
        assert!(buffer.is_empty());
    }

    #[test]
    fn multiple_frames_preserve_order() {
        let mut buffer = Buffer::new();
        buffer.write_bytes(&wrap(&[1]));
        buffer.write_bytes(&wrap(&[2, 2]));
        buffer.write_bytes(&wrap(&[3, 3, 3]));

        assert_eq!(next_frame(&mut buffer).unwrap(), Some(vec![1]));
        assert_eq!(next_frame(&mut buffer).unwrap(), Some(vec![2, 2]));
        assert_eq!(next_frame(&mut buffer).unwrap(), Some(vec![3, 3, 3]));
        assert_eq!(next_frame(&mut buffer).unwrap(), None);
    }

    #[test]
    fn zero_length_is_malformed() {
        let mut buffer = Buffer::new();
        buffer.write_bytes(&[0, 0, 0, 0]);

        let err = next_frame(&mut buffer).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedMessage);
    }

    #[test]
    fn oversized_length_is_malformed() {
        let mut buffer = Buffer::new();
        buffer.write_bytes(&[255, 255, 255, 255]);

        let err = next_frame(&mut buffer).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedMessage);
    }
}

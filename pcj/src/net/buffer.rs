use std::io;

// Consumed prefixes are compacted away once they grow past this.
const COMPACT_THRESHOLD: usize = 64 * 1024;

const SCRATCH_SIZE: usize = 8192;

/// A FIFO byte queue. Data is appended at the tail and consumed from the
/// head; socket ingress and egress drain in a loop until the peer would
/// block, as required by edge-triggered readiness.
pub struct Buffer {
    data: Vec<u8>,
    head: usize,
}

impl Buffer {
    #[inline]
    pub fn new() -> Buffer {
        Buffer {
            data: Vec::new(),
            head: 0,
        }
    }

    /// The number of unconsumed bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slice containing the unconsumed data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.head..]
    }

    /// Appends raw bytes at the tail.
    #[inline]
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Advances the head, as if a read has happened.
    pub fn consume(&mut self, count: usize) {
        if count > self.len() {
            panic!("Attempted to consume past buffer edge");
        }

        self.head += count;

        if self.head == self.data.len() {
            self.data.clear();
            self.head = 0;
        } else if self.head > COMPACT_THRESHOLD {
            self.data.drain(..self.head);
            self.head = 0;
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
        self.head = 0;
    }

    /// Reads all available data from the supplied reader into the buffer.
    /// Returns the byte count once the reader would block; a clean EOF is
    /// reported as `UnexpectedEof` so the caller can fold it into the
    /// connection-lost path.
    pub fn ingress<R: io::Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        let mut scratch = [0u8; SCRATCH_SIZE];
        let mut total = 0;

        loop {
            match reader.read(&mut scratch) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(count) => {
                    self.write_bytes(&scratch[..count]);
                    total += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Writes buffered data to the supplied writer, consuming what was
    /// accepted. Returns the byte count once the buffer is drained or the
    /// writer would block.
    pub fn egress<W: io::Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let mut total = 0;

        while !self.is_empty() {
            match writer.write(self.read_slice()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => {
                    self.consume(count);
                    total += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;

    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        max_size: usize,
        eof: bool,
    }

    impl MockChannel {
        fn new(data: Vec<u8>, chunk: usize, max_size: usize) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                chunk,
                max_size,
                eof: false,
            }
        }
    }

    impl io::Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                if self.eof {
                    return Ok(0);
                }
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let offset = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..offset].copy_from_slice(&self.data[self.cursor..(self.cursor + offset)]);
            self.cursor += offset;
            Ok(offset)
        }
    }

    impl io::Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() == self.max_size {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(min(self.chunk, buf.len()), self.max_size - self.data.len());
            self.data.extend(&buf[..count]);
            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn ingress_then_egress_roundtrip() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(3000).collect();
        let mut source = MockChannel::new(payload.clone(), 500, 0);

        let mut buffer = Buffer::new();
        let count = buffer.ingress(&mut source).unwrap();

        assert_eq!(count, payload.len());
        assert_eq!(buffer.read_slice(), payload.as_slice());

        let mut sink = MockChannel::new(Vec::new(), 700, payload.len());
        let count = buffer.egress(&mut sink).unwrap();

        assert_eq!(count, payload.len());
        assert!(buffer.is_empty());
        assert_eq!(sink.data, payload);
    }

    #[test]
    fn ingress_reports_eof() {
        let mut source = MockChannel::new(vec![1, 2, 3], 16, 0);
        source.eof = true;

        let mut buffer = Buffer::new();
        let err = buffer.ingress(&mut source).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        // Data read before the EOF is retained.
        assert_eq!(buffer.read_slice(), &[1, 2, 3]);
    }

    #[test]
    fn egress_stops_on_would_block() {
        let mut buffer = Buffer::new();
        buffer.write_bytes(&[0; 100]);

        let mut sink = MockChannel::new(Vec::new(), 16, 40);
        let count = buffer.egress(&mut sink).unwrap();

        assert_eq!(count, 40);
        assert_eq!(buffer.len(), 60);
    }

    #[test]
    fn egress_error_on_zero_write() {
        struct ZeroSink;
        impl io::Write for ZeroSink {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut buffer = Buffer::new();
        buffer.write_bytes(&[1]);

        let err = buffer.egress(&mut ZeroSink).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn consume_tracks_head() {
        let mut buffer = Buffer::new();
        buffer.write_bytes(&[1, 2, 3, 4]);

        buffer.consume(2);
        assert_eq!(buffer.read_slice(), &[3, 4]);

        buffer.consume(2);
        assert!(buffer.is_empty());
        assert_eq!(buffer.head, 0);
    }

    #[test]
    #[should_panic(expected = "Attempted to consume past buffer edge")]
    fn consume_past_edge_fails() {
        let mut buffer = Buffer::new();
        buffer.write_bytes(&[1]);
        buffer.consume(2);
    }
}

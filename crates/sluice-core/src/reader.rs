//! Buffered record framing over arbitrary byte streams.
//!
//! [`BufferedReader`] carves discrete records out of a stream according to
//! one configured [`Framing`] mode and hands each complete record to a
//! callback, in source order. Partial data is retained across reads, a
//! monotonic logical offset tracks how far into the source the reader has
//! consumed (the number persisted by positioned consumers), and malformed
//! length headers surface as [`FrameError::DataInvalid`] without consuming
//! past the bad header so the caller can decide between dropping the
//! connection and skipping bytes.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Growth chunk for stream-oriented sources.
pub const DEFAULT_CHUNK: usize = 1024;
/// Growth chunk for datagram-oriented sources.
pub const DATAGRAM_CHUNK: usize = 256;

/// Width of a binary length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixWidth {
    W8,
    W16,
    W32,
    W64,
}

impl PrefixWidth {
    pub const fn bytes(self) -> usize {
        match self {
            PrefixWidth::W8 => 1,
            PrefixWidth::W16 => 2,
            PrefixWidth::W32 => 4,
            PrefixWidth::W64 => 8,
        }
    }

    /// Map a width in bytes (1, 2, 4, 8) onto the enum.
    pub fn from_bytes(n: usize) -> Option<Self> {
        match n {
            1 => Some(PrefixWidth::W8),
            2 => Some(PrefixWidth::W16),
            4 => Some(PrefixWidth::W32),
            8 => Some(PrefixWidth::W64),
            _ => None,
        }
    }
}

/// Record framing mode. Modes are mutually exclusive; endianness is a flag
/// on the binary length prefix.
#[derive(Debug, Clone)]
pub enum Framing {
    /// Records end at the delimiter; the delimiter is consumed but not
    /// part of the record. Zero-length records are emitted, not dropped.
    Delimiter { delimiter: Vec<u8> },
    /// Records are exactly `size` bytes.
    FixedSize { size: usize },
    /// An unsigned integer of the given width at byte `offset` holds the
    /// record length. With `keep_header` the leading offset bytes and the
    /// prefix stay in the emitted record (socket/proxy hand the whole
    /// framed unit downstream); without it they are stripped.
    LengthPrefix {
        width: PrefixWidth,
        big_endian: bool,
        offset: usize,
        keep_header: bool,
    },
    /// ASCII digits starting at byte `offset`, terminated by the
    /// delimiter, hold the record length. Header and delimiter are
    /// stripped from the record.
    AsciiPrefix { delimiter: Vec<u8>, offset: usize },
}

/// Framing failures.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The source reported end-of-stream. Pending partial data stays in
    /// the buffer; use [`BufferedReader::flush`] to emit it on close.
    #[error("end of stream")]
    Eof,
    /// A length header that cannot describe a real record. The buffer is
    /// left positioned at the bad header.
    #[error("invalid frame: {0}")]
    DataInvalid(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One frame isolated by [`BufferedReader::next_frame`]: the payload range
/// within the buffer plus the total bytes to consume.
struct RawFrame {
    start: usize,
    end: usize,
    consumed: usize,
}

/// Byte-stream framing engine shared by the file, socket, proxy, console
/// and packet-capture consumers.
pub struct BufferedReader {
    buf: BytesMut,
    framing: Framing,
    offset: u64,
    max_frame: usize,
    chunk: usize,
}

impl BufferedReader {
    pub fn new(framing: Framing, max_frame: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(DEFAULT_CHUNK),
            framing,
            offset: 0,
            max_frame,
            chunk: DEFAULT_CHUNK,
        }
    }

    /// Variant with the smaller growth chunk used by datagram sources.
    pub fn for_datagrams(framing: Framing, max_frame: usize) -> Self {
        Self {
            chunk: DATAGRAM_CHUNK,
            ..Self::new(framing, max_frame)
        }
    }

    /// Logical offset into the source: bytes consumed by emitted frames,
    /// including their headers and delimiters.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Bytes buffered but not yet framed.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Drop pending data and restart offset accounting at `offset`
    /// (after seeking the underlying source).
    pub fn reset(&mut self, offset: u64) {
        self.buf.clear();
        self.offset = offset;
    }

    /// Throw away the pending bytes but keep counting them as consumed.
    /// Callers that skip over invalid data (file, UDP) use this to get
    /// past a bad header.
    pub fn discard_pending(&mut self) -> usize {
        let n = self.buf.len();
        self.buf.clear();
        self.offset += n as u64;
        n
    }

    /// Perform one read from `src` into the buffer tail, then emit every
    /// complete frame. Returns the number of frames emitted. `Eof` is
    /// returned only when the source reports end-of-stream; pending
    /// partial data is retained for the next call (or [`flush`]).
    ///
    /// [`flush`]: Self::flush
    pub async fn read_from<R>(
        &mut self,
        src: &mut R,
        emit: &mut (dyn FnMut(&[u8]) + Send),
    ) -> Result<usize, FrameError>
    where
        R: AsyncRead + Unpin,
    {
        self.buf.reserve(self.chunk);
        let n = src.read_buf(&mut self.buf).await?;
        if n == 0 {
            return Err(FrameError::Eof);
        }
        self.drain(emit)
    }

    /// Append `data` (a datagram or reassembled segment) and emit every
    /// complete frame.
    pub fn feed(&mut self, data: &[u8], emit: &mut (dyn FnMut(&[u8]) + Send)) -> Result<usize, FrameError> {
        self.buf.extend_from_slice(data);
        self.drain(emit)
    }

    /// Emit whatever is pending as one final record. Used on orderly
    /// close where a trailing record has no terminator.
    pub fn flush(&mut self, emit: &mut (dyn FnMut(&[u8]) + Send)) {
        if !self.buf.is_empty() {
            let tail = self.buf.split();
            self.offset += tail.len() as u64;
            emit(&tail);
        }
    }

    fn drain(&mut self, emit: &mut (dyn FnMut(&[u8]) + Send)) -> Result<usize, FrameError> {
        let mut emitted = 0;
        while let Some(frame) = self.next_frame()? {
            emit(&self.buf[frame.start..frame.end]);
            let _ = self.buf.split_to(frame.consumed);
            self.offset += frame.consumed as u64;
            emitted += 1;
        }
        Ok(emitted)
    }

    /// Locate the next complete frame without consuming it. `Ok(None)`
    /// means more data is needed.
    fn next_frame(&self) -> Result<Option<RawFrame>, FrameError> {
        let buf = &self.buf[..];
        match &self.framing {
            Framing::Delimiter { delimiter } => Ok(find(buf, delimiter).map(|pos| RawFrame {
                start: 0,
                end: pos,
                consumed: pos + delimiter.len(),
            })),

            Framing::FixedSize { size } => {
                if buf.len() >= *size {
                    Ok(Some(RawFrame {
                        start: 0,
                        end: *size,
                        consumed: *size,
                    }))
                } else {
                    Ok(None)
                }
            }

            Framing::LengthPrefix {
                width,
                big_endian,
                offset,
                keep_header,
            } => {
                let header = offset + width.bytes();
                if buf.len() < header {
                    return Ok(None);
                }
                let len = decode_prefix(&buf[*offset..header], *big_endian);
                if len > self.max_frame as u64 {
                    return Err(FrameError::DataInvalid(format!(
                        "length prefix {} exceeds limit {}",
                        len, self.max_frame
                    )));
                }
                let total = header + len as usize;
                if buf.len() < total {
                    return Ok(None);
                }
                let start = if *keep_header { 0 } else { header };
                Ok(Some(RawFrame {
                    start,
                    end: total,
                    consumed: total,
                }))
            }

            Framing::AsciiPrefix { delimiter, offset } => {
                if buf.len() <= *offset {
                    return Ok(None);
                }
                let digits = &buf[*offset..];
                let count = digits.iter().take_while(|b| b.is_ascii_digit()).count();
                if count == 0 {
                    return Err(FrameError::DataInvalid(
                        "length prefix is not numeric".to_string(),
                    ));
                }
                if count == digits.len() {
                    // Delimiter not seen yet; guard against endless digits.
                    if count > 20 {
                        return Err(FrameError::DataInvalid(
                            "length prefix does not terminate".to_string(),
                        ));
                    }
                    return Ok(None);
                }
                let len: u64 = std::str::from_utf8(&digits[..count])
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| {
                        FrameError::DataInvalid("length prefix is not numeric".to_string())
                    })?;
                if len > self.max_frame as u64 {
                    return Err(FrameError::DataInvalid(format!(
                        "length prefix {} exceeds limit {}",
                        len, self.max_frame
                    )));
                }
                if !digits[count..].starts_with(delimiter) {
                    return Err(FrameError::DataInvalid(
                        "length prefix not followed by delimiter".to_string(),
                    ));
                }
                let start = offset + count + delimiter.len();
                let total = start + len as usize;
                if buf.len() < total {
                    return Ok(None);
                }
                Ok(Some(RawFrame {
                    start,
                    end: total,
                    consumed: total,
                }))
            }
        }
    }
}

fn decode_prefix(bytes: &[u8], big_endian: bool) -> u64 {
    let mut value: u64 = 0;
    if big_endian {
        for b in bytes {
            value = (value << 8) | *b as u64;
        }
    } else {
        for b in bytes.iter().rev() {
            value = (value << 8) | *b as u64;
        }
    }
    value
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(reader: &mut BufferedReader, input: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        reader
            .feed(input, &mut |f| frames.push(f.to_vec()))
            .unwrap();
        frames
    }

    #[test]
    fn delimiter_splits_and_keeps_partial_tail() {
        let mut reader = BufferedReader::new(
            Framing::Delimiter {
                delimiter: b"\n".to_vec(),
            },
            1 << 20,
        );
        let frames = collect(&mut reader, b"a\nb\nc");
        assert_eq!(frames, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(reader.pending(), 1);
        assert_eq!(reader.offset(), 4);

        // The tail completes on the next feed.
        let frames = collect(&mut reader, b"d\n");
        assert_eq!(frames, vec![b"cd".to_vec()]);
        assert_eq!(reader.offset(), 7);
    }

    #[test]
    fn delimiter_emits_empty_records() {
        let mut reader = BufferedReader::new(
            Framing::Delimiter {
                delimiter: b"\n".to_vec(),
            },
            1 << 20,
        );
        let frames = collect(&mut reader, b"\n\nx\n");
        assert_eq!(frames, vec![Vec::new(), Vec::new(), b"x".to_vec()]);
    }

    #[test]
    fn multibyte_delimiter() {
        let mut reader = BufferedReader::new(
            Framing::Delimiter {
                delimiter: b"\r\n".to_vec(),
            },
            1 << 20,
        );
        let frames = collect(&mut reader, b"one\r\ntwo\r\nthree\r");
        assert_eq!(frames, vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(reader.pending(), 6);
    }

    #[test]
    fn fixed_size_records() {
        let mut reader = BufferedReader::new(Framing::FixedSize { size: 3 }, 1 << 20);
        let frames = collect(&mut reader, b"abcdefgh");
        assert_eq!(frames, vec![b"abc".to_vec(), b"def".to_vec()]);
        assert_eq!(reader.pending(), 2);
        assert_eq!(reader.offset(), 6);
    }

    #[test]
    fn length_prefix_le32_round_trip() {
        let mut reader = BufferedReader::new(
            Framing::LengthPrefix {
                width: PrefixWidth::W32,
                big_endian: false,
                offset: 0,
                keep_header: false,
            },
            1 << 20,
        );
        let frames = collect(
            &mut reader,
            b"\x05\x00\x00\x00HELLO\x03\x00\x00\x00abc",
        );
        assert_eq!(frames, vec![b"HELLO".to_vec(), b"abc".to_vec()]);
        assert_eq!(reader.offset(), 16);
    }

    #[test]
    fn length_prefix_be16_with_offset_keeps_header() {
        let mut reader = BufferedReader::new(
            Framing::LengthPrefix {
                width: PrefixWidth::W16,
                big_endian: true,
                offset: 2,
                keep_header: true,
            },
            1 << 20,
        );
        // 2 ignored bytes, BE16 length 4, then the record.
        let frames = collect(&mut reader, b"XY\x00\x04dataZZ");
        assert_eq!(frames, vec![b"XY\x00\x04data".to_vec()]);
        assert_eq!(reader.pending(), 2);
    }

    #[test]
    fn length_prefix_w8_and_w64() {
        let mut reader = BufferedReader::new(
            Framing::LengthPrefix {
                width: PrefixWidth::W8,
                big_endian: false,
                offset: 0,
                keep_header: false,
            },
            1 << 20,
        );
        assert_eq!(collect(&mut reader, b"\x02hi"), vec![b"hi".to_vec()]);

        let mut reader = BufferedReader::new(
            Framing::LengthPrefix {
                width: PrefixWidth::W64,
                big_endian: true,
                offset: 0,
                keep_header: false,
            },
            1 << 20,
        );
        let mut input = vec![0u8; 7];
        input.push(3);
        input.extend_from_slice(b"xyz");
        assert_eq!(collect(&mut reader, &input), vec![b"xyz".to_vec()]);
    }

    #[test]
    fn length_prefix_waits_for_full_record() {
        let mut reader = BufferedReader::new(
            Framing::LengthPrefix {
                width: PrefixWidth::W32,
                big_endian: false,
                offset: 0,
                keep_header: false,
            },
            1 << 20,
        );
        assert!(collect(&mut reader, b"\x05\x00\x00\x00HE").is_empty());
        assert_eq!(collect(&mut reader, b"LLO"), vec![b"HELLO".to_vec()]);
    }

    #[test]
    fn oversized_length_prefix_is_data_invalid() {
        let mut reader = BufferedReader::new(
            Framing::LengthPrefix {
                width: PrefixWidth::W32,
                big_endian: false,
                offset: 0,
                keep_header: false,
            },
            16,
        );
        let err = reader
            .feed(b"\xff\xff\xff\x7f", &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, FrameError::DataInvalid(_)));
        // The bad header is still there; the caller decides what to do.
        assert_eq!(reader.pending(), 4);
        assert_eq!(reader.offset(), 0);
    }

    #[test]
    fn ascii_prefix_records() {
        let mut reader = BufferedReader::new(
            Framing::AsciiPrefix {
                delimiter: b" ".to_vec(),
                offset: 0,
            },
            1 << 20,
        );
        let frames = collect(&mut reader, b"5 hello3 abc");
        assert_eq!(frames, vec![b"hello".to_vec(), b"abc".to_vec()]);
    }

    #[test]
    fn ascii_prefix_non_numeric_is_data_invalid() {
        let mut reader = BufferedReader::new(
            Framing::AsciiPrefix {
                delimiter: b" ".to_vec(),
                offset: 0,
            },
            1 << 20,
        );
        let err = reader.feed(b"xyz hello", &mut |_| {}).unwrap_err();
        assert!(matches!(err, FrameError::DataInvalid(_)));
    }

    #[test]
    fn flush_emits_trailing_partial() {
        let mut reader = BufferedReader::new(
            Framing::Delimiter {
                delimiter: b"\n".to_vec(),
            },
            1 << 20,
        );
        let _ = collect(&mut reader, b"a\nb");
        let mut frames = Vec::new();
        reader.flush(&mut |f| frames.push(f.to_vec()));
        assert_eq!(frames, vec![b"b".to_vec()]);
        assert_eq!(reader.pending(), 0);
        assert_eq!(reader.offset(), 3);
    }

    #[test]
    fn reset_restarts_offset_accounting() {
        let mut reader = BufferedReader::new(
            Framing::Delimiter {
                delimiter: b"\n".to_vec(),
            },
            1 << 20,
        );
        let _ = collect(&mut reader, b"abc");
        reader.reset(100);
        assert_eq!(reader.pending(), 0);
        let _ = collect(&mut reader, b"de\n");
        assert_eq!(reader.offset(), 103);
    }

    #[tokio::test]
    async fn read_from_retains_partials_across_reads() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let mut reader = BufferedReader::new(
            Framing::Delimiter {
                delimiter: b"\n".to_vec(),
            },
            1 << 20,
        );

        use tokio::io::AsyncWriteExt;
        client.write_all(b"first\nsec").await.unwrap();

        let mut frames = Vec::new();
        let n = reader
            .read_from(&mut server, &mut |f| frames.push(f.to_vec()))
            .await
            .unwrap();
        assert_eq!(n, 1);

        client.write_all(b"ond\n").await.unwrap();
        drop(client);

        reader
            .read_from(&mut server, &mut |f| frames.push(f.to_vec()))
            .await
            .unwrap();
        assert_eq!(frames, vec![b"first".to_vec(), b"second".to_vec()]);

        let err = reader
            .read_from(&mut server, &mut |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::Eof));
    }
}

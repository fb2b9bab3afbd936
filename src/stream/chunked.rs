//! The chunked transfer-coding dechunker.
//!
//! Parses `<hex-size>CRLF<data>CRLF` frames, ends on the zero-length chunk,
//! tolerates trailer fields after it and rejects malformed size tokens.
//! Extensions after the size are skipped but bounded, and a bare LF inside
//! an extension is rejected to protect sloppy peers from themselves.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use http::{HeaderName, HeaderValue};
use tracing::trace;

use super::Filter;

/// Maximum amount of bytes allowed in chunked extensions.
///
/// This limit is applied for the entire body, not per chunk.
const CHUNKED_EXTENSIONS_LIMIT: u64 = 1024 * 16;

/// Maximum number of bytes allowed for all trailer fields.
const TRAILER_LIMIT: usize = 1024 * 16;

/// Maximum number of trailer fields.
const TRAILER_FIELDS_LIMIT: usize = 100;

#[derive(Debug, PartialEq, Clone, Copy)]
enum ChunkedState {
    Start,
    Size,
    SizeLws,
    Extension,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    Trailer,
    TrailerLf,
    EndCr,
    EndLf,
    End,
}

/// The dechunk filter.
pub struct ChunkedFilter {
    state: ChunkedState,
    chunk_len: u64,
    extensions_cnt: u64,
    trailers_buf: Option<BytesMut>,
    trailers_cnt: usize,
    input: BytesMut,
    output: BytesMut,
}

impl ChunkedFilter {
    /// A dechunker at the start of the first size line.
    pub fn new() -> ChunkedFilter {
        ChunkedFilter {
            state: ChunkedState::Start,
            chunk_len: 0,
            extensions_cnt: 0,
            trailers_buf: None,
            trailers_cnt: 0,
            input: BytesMut::new(),
            output: BytesMut::new(),
        }
    }

    /// Advance the state machine over whatever input is buffered.
    fn drive(&mut self) -> io::Result<()> {
        while self.state != ChunkedState::End && !self.input.is_empty() {
            self.state = self.step()?;
        }
        Ok(())
    }

    fn step(&mut self) -> io::Result<ChunkedState> {
        use self::ChunkedState::*;
        match self.state {
            Start => {
                let byte = self.byte();
                self.accum_size(byte)?;
                Ok(Size)
            }
            Size => {
                let byte = self.byte();
                match byte {
                    b'\t' | b' ' => Ok(SizeLws),
                    b';' => Ok(Extension),
                    b'\r' => Ok(SizeLf),
                    _ => {
                        self.accum_size(byte)?;
                        Ok(Size)
                    }
                }
            }
            SizeLws => {
                // LWS can follow the chunk size, but no more digits can come
                match self.byte() {
                    b'\t' | b' ' => Ok(SizeLws),
                    b';' => Ok(Extension),
                    b'\r' => Ok(SizeLf),
                    _ => Err(invalid("invalid chunk size linear white space")),
                }
            }
            Extension => {
                // extensions are skipped, they end at the next CRLF
                match self.byte() {
                    b'\r' => Ok(SizeLf),
                    b'\n' => Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "invalid chunk extension contains newline",
                    )),
                    _ => {
                        self.extensions_cnt += 1;
                        if self.extensions_cnt >= CHUNKED_EXTENSIONS_LIMIT {
                            Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "chunk extensions over limit",
                            ))
                        } else {
                            Ok(Extension)
                        }
                    }
                }
            }
            SizeLf => match self.byte() {
                b'\n' => {
                    if self.chunk_len == 0 {
                        Ok(EndCr)
                    } else {
                        trace!("incoming chunked header: {0:#X} ({0} bytes)", self.chunk_len);
                        Ok(Body)
                    }
                }
                _ => Err(invalid("invalid chunk size LF")),
            },
            Body => {
                let take = (self.chunk_len.min(usize::MAX as u64) as usize).min(self.input.len());
                let data = self.input.split_to(take);
                self.output.extend_from_slice(&data);
                self.chunk_len -= take as u64;
                if self.chunk_len == 0 {
                    Ok(BodyCr)
                } else {
                    Ok(Body)
                }
            }
            BodyCr => match self.byte() {
                b'\r' => Ok(BodyLf),
                _ => Err(invalid("invalid chunk body CR")),
            },
            BodyLf => match self.byte() {
                b'\n' => Ok(Start),
                _ => Err(invalid("invalid chunk body LF")),
            },
            Trailer => {
                let byte = self.byte();
                self.put_trailer(byte)?;
                match byte {
                    b'\r' => Ok(TrailerLf),
                    _ => Ok(Trailer),
                }
            }
            TrailerLf => {
                let byte = self.byte();
                match byte {
                    b'\n' => {
                        if self.trailers_cnt >= TRAILER_FIELDS_LIMIT {
                            return Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "chunk trailers count overflow",
                            ));
                        }
                        self.trailers_cnt += 1;
                        self.put_trailer(byte)?;
                        Ok(EndCr)
                    }
                    _ => Err(invalid("invalid trailer end LF")),
                }
            }
            EndCr => {
                let byte = self.byte();
                match byte {
                    b'\r' => {
                        self.put_trailer(byte)?;
                        Ok(EndLf)
                    }
                    byte => {
                        if self.trailers_buf.is_none() {
                            self.trailers_buf = Some(BytesMut::with_capacity(64));
                        }
                        self.put_trailer(byte)?;
                        Ok(Trailer)
                    }
                }
            }
            EndLf => {
                let byte = self.byte();
                match byte {
                    b'\n' => {
                        self.put_trailer(byte)?;
                        if let Some(mut buf) = self.trailers_buf.take() {
                            trace!("end of chunked, validating trailers");
                            validate_trailers(&mut buf, self.trailers_cnt)?;
                        }
                        Ok(End)
                    }
                    _ => Err(invalid("invalid chunk end LF")),
                }
            }
            End => Ok(End),
        }
    }

    fn byte(&mut self) -> u8 {
        self.input.split_to(1)[0]
    }

    fn accum_size(&mut self, byte: u8) -> io::Result<()> {
        let radix = 16;
        let digit = match byte {
            b @ b'0'..=b'9' => b - b'0',
            b @ b'a'..=b'f' => b + 10 - b'a',
            b @ b'A'..=b'F' => b + 10 - b'A',
            _ => {
                return Err(invalid("invalid chunk size line: missing size digit"));
            }
        };
        self.chunk_len = self
            .chunk_len
            .checked_mul(radix)
            .and_then(|len| len.checked_add(digit as u64))
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size: overflow")
            })?;
        Ok(())
    }

    fn put_trailer(&mut self, byte: u8) -> io::Result<()> {
        if let Some(ref mut buf) = self.trailers_buf {
            buf.put_u8(byte);
            if buf.len() >= TRAILER_LIMIT {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "chunk trailers bytes over limit",
                ));
            }
        }
        Ok(())
    }
}

impl Filter for ChunkedFilter {
    fn push(&mut self, data: &[u8]) -> io::Result<()> {
        if self.state == ChunkedState::End {
            // bytes past the terminator belong to the next message
            return Ok(());
        }
        self.input.extend_from_slice(data);
        self.drive()
    }

    fn pull(&mut self) -> Bytes {
        self.output.split().freeze()
    }

    fn eof(&self) -> bool {
        self.state == ChunkedState::End
    }

    fn finish(&mut self) -> io::Result<()> {
        if self.state == ChunkedState::End {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "end of stream before chunked terminator",
            ))
        }
    }
}

impl std::fmt::Debug for ChunkedFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedFilter")
            .field("state", &self.state)
            .field("chunk_len", &self.chunk_len)
            .finish()
    }
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

fn validate_trailers(buf: &mut BytesMut, count: usize) -> io::Result<()> {
    use std::convert::TryFrom;

    let mut headers = vec![httparse::EMPTY_HEADER; count.max(1)];
    match httparse::parse_headers(buf, &mut headers) {
        Ok(httparse::Status::Complete((_, headers))) => {
            for header in headers.iter() {
                if HeaderName::try_from(header.name).is_err() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("invalid trailer name: {:?}", &header),
                    ));
                }
                if HeaderValue::from_bytes(header.value).is_err() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("invalid trailer value: {:?}", &header),
                    ));
                }
            }
            Ok(())
        }
        Ok(httparse::Status::Partial) => {
            Err(io::Error::new(io::ErrorKind::InvalidInput, "partial trailer"))
        }
        Err(err) => Err(io::Error::new(io::ErrorKind::InvalidInput, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind::{InvalidData, InvalidInput, UnexpectedEof};

    fn decode_all(input: &[u8]) -> io::Result<Bytes> {
        let mut filter = ChunkedFilter::new();
        filter.push(input)?;
        Ok(filter.pull())
    }

    fn read_size(s: &str) -> u64 {
        let mut filter = ChunkedFilter::new();
        filter.push(s.as_bytes()).expect(s);
        assert!(
            filter.state == ChunkedState::Body || filter.state == ChunkedState::EndCr,
            "no body for {:?}",
            s
        );
        filter.chunk_len
    }

    fn read_size_err(s: &str, expected: io::ErrorKind) {
        let mut filter = ChunkedFilter::new();
        let err = filter.push(s.as_bytes()).expect_err(s);
        assert_eq!(err.kind(), expected, "for {:?}", s);
    }

    #[test]
    fn test_read_chunk_size() {
        assert_eq!(1, read_size("1\r\n"));
        assert_eq!(1, read_size("01\r\n"));
        assert_eq!(0, read_size("0\r\n"));
        assert_eq!(0, read_size("00\r\n"));
        assert_eq!(10, read_size("A\r\n"));
        assert_eq!(10, read_size("a\r\n"));
        assert_eq!(255, read_size("Ff\r\n"));
        assert_eq!(255, read_size("Ff   \r\n"));
        // Missing LF or CRLF
        read_size_err("F\rF", InvalidInput);
        // Missing digit
        read_size_err("\r\n\r\n", InvalidInput);
        read_size_err("\r\n", InvalidInput);
        // Invalid hex digit
        read_size_err("X\r\n", InvalidInput);
        read_size_err("1X\r\n", InvalidInput);
        read_size_err("-\r\n", InvalidInput);
        read_size_err("-1\r\n", InvalidInput);
        // Acceptable (if not fully valid) extensions do not influence the size
        assert_eq!(1, read_size("1;extension\r\n"));
        assert_eq!(10, read_size("a;ext name=value\r\n"));
        assert_eq!(1, read_size("1;extension;extension2\r\n"));
        assert_eq!(1, read_size("1;;;  ;\r\n"));
        assert_eq!(2, read_size("2; extension...\r\n"));
        assert_eq!(3, read_size("3   ; extension=123\r\n"));
        assert_eq!(3, read_size("3   ;\r\n"));
        assert_eq!(3, read_size("3   ;   \r\n"));
        // Invalid extensions cause an error
        read_size_err("1 invalid extension\r\n", InvalidInput);
        read_size_err("1 A\r\n", InvalidInput);
        read_size_err("1;reject\nnewlines\r\n", InvalidData);
        // Overflow
        read_size_err("f0000000000000003\r\n", InvalidData);
    }

    #[test]
    fn test_decode_single_chunk() {
        let decoded = decode_all(b"10\r\n1234567890abcdef\r\n0\r\n\r\n").unwrap();
        assert_eq!(&decoded[..], b"1234567890abcdef");
    }

    #[test]
    fn test_decode_is_concatenation_of_chunk_bodies() {
        let decoded = decode_all(b"3\r\nfoo\r\n3\r\nbar\r\n0\r\n\r\n").unwrap();
        assert_eq!(&decoded[..], b"foobar");
    }

    #[test]
    fn test_decode_byte_at_a_time() {
        let input = b"3\r\nfoo\r\n3\r\nbar\r\n0\r\n\r\n";
        let mut filter = ChunkedFilter::new();
        let mut out = Vec::new();
        for byte in input.iter() {
            filter.push(std::slice::from_ref(byte)).unwrap();
            out.extend_from_slice(&filter.pull());
        }
        assert_eq!(&out[..], b"foobar");
        assert!(filter.eof());
    }

    #[test]
    fn test_decode_with_missing_zero_digit() {
        let mut filter = ChunkedFilter::new();
        filter.push(b"1\r\nZ\r\n").unwrap();
        assert_eq!(&filter.pull()[..], b"Z");
        let err = filter.push(b"\r\n\r\n").unwrap_err();
        assert_eq!(err.kind(), InvalidInput);
    }

    #[test]
    fn test_decode_trailers_tolerated() {
        let mut filter = ChunkedFilter::new();
        filter
            .push(b"3\r\nfoo\r\n0\r\nExpires: Wed, 21 Oct 2015 07:28:00 GMT\r\nX-Extra: bits\r\n\r\n")
            .unwrap();
        assert_eq!(&filter.pull()[..], b"foo");
        assert!(filter.eof());
    }

    #[test]
    fn test_decode_trailer_with_missing_lf() {
        let mut filter = ChunkedFilter::new();
        let err = filter
            .push(b"10\r\n1234567890abcdef\r\n0\r\nbad\r\r\n")
            .unwrap_err();
        assert_eq!(err.kind(), InvalidInput);
    }

    #[test]
    fn test_decode_huge_trailer_rejected() {
        let mut filter = ChunkedFilter::new();
        let mut input = Vec::from(&b"3\r\nfoo\r\n0\r\nhuge: "[..]);
        input.extend(std::iter::repeat(b'x').take(TRAILER_LIMIT));
        input.extend_from_slice(b"\r\n\r\n");
        let err = filter.push(&input).unwrap_err();
        assert_eq!(err.kind(), InvalidData);
    }

    #[test]
    fn test_decode_extensions_over_limit() {
        // each individual extension is fine, combined they are over the cap
        let per_chunk = CHUNKED_EXTENSIONS_LIMIT * 2 / 3;
        let mut input = Vec::new();
        for _ in 0..2 {
            input.extend(b"1;");
            input.extend(std::iter::repeat(b'x').take(per_chunk as usize));
            input.extend(b"\r\nA\r\n");
        }
        input.extend(b"0\r\n\r\n");
        let mut filter = ChunkedFilter::new();
        let err = filter.push(&input).unwrap_err();
        assert_eq!(err.kind(), InvalidData);
        assert_eq!(&filter.pull()[..], b"A");
    }

    #[test]
    fn test_finish_before_terminator_is_an_error() {
        let mut filter = ChunkedFilter::new();
        filter.push(b"9\r\nfoo bar").unwrap();
        assert_eq!(&filter.pull()[..], b"foo bar");
        let err = filter.finish().unwrap_err();
        assert_eq!(err.kind(), UnexpectedEof);
    }

    #[test]
    fn test_bytes_past_terminator_are_ignored() {
        let mut filter = ChunkedFilter::new();
        filter.push(b"3\r\nfoo\r\n0\r\n\r\nHTTP/1.1 200 OK\r\n").unwrap();
        assert_eq!(&filter.pull()[..], b"foo");
        assert!(filter.eof());
    }

    #[test]
    fn test_roundtrip_with_encoder() {
        // encode then decode yields the input
        let body = b"hello world, hello chunked coding";
        let mut encoded = Vec::new();
        for piece in body.chunks(7) {
            encoded.extend(format!("{:x}\r\n", piece.len()).into_bytes());
            encoded.extend_from_slice(piece);
            encoded.extend_from_slice(b"\r\n");
        }
        encoded.extend_from_slice(b"0\r\n\r\n");
        let decoded = decode_all(&encoded).unwrap();
        assert_eq!(&decoded[..], &body[..]);
    }
}

//! The inflate filter: streaming gzip or zlib decode.
//!
//! An optional input limit caps how many compressed bytes the decoder will
//! consume, so a frame bounded only by Content-Length terminates correctly;
//! input past the limit is ignored and stays with the caller.

use std::io::{self, Write};

use bytes::Bytes;
use flate2::write::{GzDecoder, ZlibDecoder};

use super::Filter;

enum Backend {
    Gzip(GzDecoder<Vec<u8>>),
    Zlib(ZlibDecoder<Vec<u8>>),
}

/// The inflate filter.
pub struct InflateFilter {
    backend: Backend,
    limit: Option<u64>,
    consumed: u64,
    finished: bool,
}

impl InflateFilter {
    /// A gzip decoder.
    pub fn gzip() -> InflateFilter {
        InflateFilter::new(Backend::Gzip(GzDecoder::new(Vec::new())))
    }

    /// A zlib/deflate decoder.
    pub fn zlib() -> InflateFilter {
        InflateFilter::new(Backend::Zlib(ZlibDecoder::new(Vec::new())))
    }

    fn new(backend: Backend) -> InflateFilter {
        InflateFilter {
            backend,
            limit: None,
            consumed: 0,
            finished: false,
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match self.backend {
            Backend::Gzip(ref mut decoder) => decoder.write_all(data),
            Backend::Zlib(ref mut decoder) => decoder.write_all(data),
        }
    }

    fn take_output(&mut self) -> Vec<u8> {
        match self.backend {
            Backend::Gzip(ref mut decoder) => std::mem::take(decoder.get_mut()),
            Backend::Zlib(ref mut decoder) => std::mem::take(decoder.get_mut()),
        }
    }

    fn try_finish(&mut self) -> io::Result<()> {
        let result = match self.backend {
            Backend::Gzip(ref mut decoder) => decoder.try_finish(),
            Backend::Zlib(ref mut decoder) => decoder.try_finish(),
        };
        self.finished = true;
        result
    }
}

impl Filter for InflateFilter {
    fn push(&mut self, data: &[u8]) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        let take = match self.limit {
            Some(limit) => (limit.saturating_sub(self.consumed) as usize).min(data.len()),
            None => data.len(),
        };
        self.write(&data[..take])?;
        self.consumed += take as u64;
        if let Some(limit) = self.limit {
            if self.consumed >= limit {
                // the frame is complete by construction
                self.try_finish()?;
            }
        }
        Ok(())
    }

    fn pull(&mut self) -> Bytes {
        Bytes::from(self.take_output())
    }

    fn eof(&self) -> bool {
        self.finished
    }

    fn finish(&mut self) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        self.try_finish()
    }

    fn limit(&mut self, limit: u64) {
        self.limit = Some(limit);
    }
}

impl std::fmt::Debug for InflateFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InflateFilter")
            .field("consumed", &self.consumed)
            .field("limit", &self.limit)
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::{GzEncoder, ZlibEncoder};
    use flate2::Compression;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn gzip_roundtrip() {
        let body = b"hello world";
        let compressed = gzip(body);
        let mut filter = InflateFilter::gzip();
        filter.push(&compressed).unwrap();
        filter.finish().unwrap();
        assert_eq!(&filter.pull()[..], &body[..]);
        assert!(filter.eof());
    }

    #[test]
    fn zlib_roundtrip() {
        let body = b"the deflate content coding wraps zlib";
        let compressed = zlib(body);
        let mut filter = InflateFilter::zlib();
        filter.push(&compressed).unwrap();
        filter.finish().unwrap();
        assert_eq!(&filter.pull()[..], &body[..]);
    }

    #[test]
    fn gzip_byte_at_a_time() {
        let body: Vec<u8> = (0..4096u32).map(|value| value as u8).collect();
        let compressed = gzip(&body);
        let mut filter = InflateFilter::gzip();
        let mut out = Vec::new();
        for byte in &compressed {
            filter.push(std::slice::from_ref(byte)).unwrap();
            out.extend_from_slice(&filter.pull());
        }
        filter.finish().unwrap();
        out.extend_from_slice(&filter.pull());
        assert_eq!(out, body);
    }

    #[test]
    fn limit_terminates_the_frame() {
        let body = b"bounded by content-length, not by the stream";
        let compressed = gzip(body);
        let mut filter = InflateFilter::gzip();
        filter.limit(compressed.len() as u64);
        // push the exact frame plus trailing garbage that must be ignored
        let mut input = compressed.clone();
        input.extend_from_slice(b"NOT GZIP");
        filter.push(&input).unwrap();
        assert!(filter.eof());
        assert_eq!(&filter.pull()[..], &body[..]);
    }

    #[test]
    fn truncated_gzip_fails_on_finish() {
        let body = b"some longer body to make sure truncation bites";
        let compressed = gzip(body);
        let mut filter = InflateFilter::gzip();
        filter.push(&compressed[..compressed.len() / 2]).unwrap();
        assert!(filter.finish().is_err());
    }
}

//! The response status record.

use crate::state::State;

/// What the last response said about itself.
#[derive(Debug, Clone)]
pub struct Status {
    /// The response code.
    pub code: u16,
    /// The minor HTTP version (`HTTP/1.<version>`).
    pub version: u8,
    /// Content-Length or the range-derived span; −1 when unknown.
    pub content_size: i64,
    /// Size of the whole document; −1 when unknown.
    pub document_size: i64,
    /// Content-Type, when present.
    pub content_type: String,
    /// Location, when the response redirects.
    pub location: String,
    /// The server accepts ranges and no filter is installed.
    pub bseeked: bool,
    /// Transfer-Encoding: chunked.
    pub bchunked: bool,
    /// Content-Encoding: gzip.
    pub bgzip: bool,
    /// Content-Encoding: deflate.
    pub bdeflate: bool,
    /// The connection stays usable for the next request.
    pub balived: bool,
    /// The terminal state of the last open.
    pub state: State,
}

impl Status {
    pub(crate) fn new() -> Status {
        Status {
            code: 0,
            version: 1,
            content_size: -1,
            document_size: -1,
            content_type: String::new(),
            location: String::new(),
            bseeked: false,
            bchunked: false,
            bgzip: false,
            bdeflate: false,
            balived: false,
            state: State::Ok,
        }
    }

    /// Reset for the next response. When the host is unchanged the
    /// connection-scoped facts (version, keep-alive, seekability) survive.
    pub(crate) fn clear(&mut self, host_changed: bool) {
        self.code = 0;
        self.bgzip = false;
        self.bdeflate = false;
        self.bchunked = false;
        self.content_size = -1;
        self.state = State::Ok;
        self.content_type.clear();
        self.location.clear();
        if host_changed {
            self.document_size = -1;
            self.version = 1;
            self.balived = false;
            self.bseeked = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_keeps_connection_facts_for_same_host()  {
        let mut status = Status::new();
        status.code = 200;
        status.balived = true;
        status.bseeked = true;
        status.content_size = 42;
        status.document_size = 42;
        status.location.push_str("/next");

        status.clear(false);
        assert_eq!(status.code, 0);
        assert_eq!(status.content_size, -1);
        assert!(status.location.is_empty());
        assert!(status.balived);
        assert!(status.bseeked);

        status.clear(true);
        assert!(!status.balived);
        assert!(!status.bseeked);
        assert_eq!(status.document_size, -1);
    }
}

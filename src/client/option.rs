//! The request options.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Method};
use url::Url;

use super::cookies::Cookies;
use crate::state::State;

/// Default stream-level deadline in milliseconds.
pub(crate) const DEFAULT_TIMEOUT: i64 = 10_000;

/// Default maximum number of Location follows.
pub(crate) const DEFAULT_REDIRECT: usize = 10;

/// Per-response-line callback; returning false aborts the open.
pub type HeadFunc = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// POST progress callback: `(state, offset, size, save, rate)`; returning
/// false aborts the transfer.
pub type PostFunc = Arc<dyn Fn(State, u64, i64, u64, u64) -> bool + Send + Sync>;

/// Everything configurable about the next request.
pub struct Options {
    pub(crate) url: Option<Url>,
    pub(crate) method: Method,
    pub(crate) version: u8,
    pub(crate) head: HeaderMap,
    pub(crate) head_func: Option<HeadFunc>,
    pub(crate) range: (u64, u64),
    pub(crate) timeout: i64,
    pub(crate) cookies: Option<Arc<Cookies>>,
    pub(crate) post_url: Option<Url>,
    pub(crate) post_data: Option<Bytes>,
    pub(crate) post_func: Option<PostFunc>,
    pub(crate) post_lrate: u64,
    pub(crate) bunzip: bool,
    pub(crate) redirect: usize,
}

impl Options {
    pub(crate) fn new() -> Options {
        Options {
            url: None,
            method: Method::GET,
            version: 1,
            head: HeaderMap::new(),
            head_func: None,
            range: (0, 0),
            timeout: DEFAULT_TIMEOUT,
            cookies: None,
            post_url: None,
            post_data: None,
            post_func: None,
            post_lrate: 0,
            bunzip: false,
            redirect: DEFAULT_REDIRECT,
        }
    }

    pub(crate) fn host(&self) -> Option<&str> {
        self.url.as_ref().and_then(|url| url.host_str())
    }

    pub(crate) fn port(&self) -> u16 {
        self.url
            .as_ref()
            .and_then(|url| url.port_or_known_default())
            .unwrap_or(80)
    }

    pub(crate) fn is_ssl(&self) -> bool {
        self.url
            .as_ref()
            .map(|url| url.scheme().eq_ignore_ascii_case("https"))
            .unwrap_or(false)
    }

    pub(crate) fn path(&self) -> &str {
        self.url.as_ref().map(|url| url.path()).unwrap_or("/")
    }

    pub(crate) fn args(&self) -> Option<&str> {
        self.url.as_ref().and_then(|url| url.query())
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("url", &self.url.as_ref().map(|url| url.as_str()))
            .field("method", &self.method)
            .field("version", &self.version)
            .field("range", &self.range)
            .field("timeout", &self.timeout)
            .field("bunzip", &self.bunzip)
            .field("redirect", &self.redirect)
            .finish()
    }
}

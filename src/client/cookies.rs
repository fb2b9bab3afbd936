//! The in-memory cookie jar consumed by the client.
//!
//! Matching is the minimal RFC 6265 subset the client needs: suffix match
//! on domain, prefix match on path, secure-only cookies withheld from
//! plain connections. Parsing of Set-Cookie lines is delegated to the
//! `cookie` crate.

use std::fmt;
use std::sync::Mutex;

use tracing::trace;

use crate::proactor::lock;

struct Stored {
    domain: String,
    path: String,
    secure: bool,
    name: String,
    value: String,
}

/// A shared cookie jar.
pub struct Cookies {
    inner: Mutex<Vec<Stored>>,
}

impl Cookies {
    /// An empty jar.
    pub fn new() -> Cookies {
        Cookies {
            inner: Mutex::new(Vec::new()),
        }
    }

    /// Store a Set-Cookie header received from (host, path, secure).
    pub fn set_from_header(&self, host: &str, path: &str, _secure: bool, header: &str) {
        let parsed = match cookie::Cookie::parse(header) {
            Ok(parsed) => parsed,
            Err(err) => {
                trace!("cookie rejected: {}", err);
                return;
            }
        };
        let domain = parsed
            .domain()
            .map(|domain| domain.trim_start_matches('.').to_ascii_lowercase())
            .unwrap_or_else(|| host.to_ascii_lowercase());
        let cookie_path = parsed.path().unwrap_or(path).to_string();
        let expired = parsed
            .max_age()
            .map(|age| age.is_zero())
            .unwrap_or(false);
        let mut inner = lock(&self.inner);
        inner.retain(|stored| {
            !(stored.name == parsed.name()
                && stored.domain == domain
                && stored.path == cookie_path)
        });
        if expired {
            return;
        }
        trace!(name = parsed.name(), domain = %domain, "cookie stored");
        inner.push(Stored {
            domain,
            path: cookie_path,
            secure: parsed.secure().unwrap_or(false),
            name: parsed.name().to_string(),
            value: parsed.value().to_string(),
        });
    }

    /// The Cookie header value for a request to (host, path, secure), if
    /// any stored cookie matches.
    pub fn header_for(&self, host: &str, path: &str, secure: bool) -> Option<String> {
        let host = host.to_ascii_lowercase();
        let inner = lock(&self.inner);
        let mut header = String::new();
        for stored in inner.iter() {
            if stored.secure && !secure {
                continue;
            }
            if !domain_matches(&host, &stored.domain) {
                continue;
            }
            if !path_matches(path, &stored.path) {
                continue;
            }
            if !header.is_empty() {
                header.push_str("; ");
            }
            header.push_str(&stored.name);
            header.push('=');
            header.push_str(&stored.value);
        }
        if header.is_empty() {
            None
        } else {
            Some(header)
        }
    }

    /// Drop every stored cookie.
    pub fn clear(&self) {
        lock(&self.inner).clear();
    }
}

impl Default for Cookies {
    fn default() -> Cookies {
        Cookies::new()
    }
}

impl fmt::Debug for Cookies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cookies")
            .field("stored", &lock(&self.inner).len())
            .finish()
    }
}

fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain
        || (host.len() > domain.len()
            && host.ends_with(domain)
            && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
}

fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    request_path == cookie_path
        || (request_path.starts_with(cookie_path)
            && (cookie_path.ends_with('/')
                || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/')))
}

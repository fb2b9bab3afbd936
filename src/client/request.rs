//! Request head formatting.
//!
//! One CRLF-delimited buffer: the request line with the escaped path and
//! arguments, the default header set, then any custom headers replacing
//! the defaults, terminated by a blank line.

use http::Method;

use super::escape;
use super::option::Options;
use super::status::Status;
use crate::state::{HttpState, State};

/// Assemble the request head. `post_size` feeds Content-Length for POST.
pub(crate) fn format_head(
    option: &Options,
    status: &Status,
    post_size: u64,
) -> Result<String, State> {
    let host = option.host().ok_or(State::Http(HttpState::UnknownError))?;
    let path = option.path();
    let args = option.args();

    // the default header set, later overridden by the custom map
    let mut head: Vec<(String, String)> = Vec::with_capacity(8);
    head.push(("Host".to_string(), host.to_string()));
    head.push(("Accept".to_string(), "*/*".to_string()));
    head.push((
        "Connection".to_string(),
        if status.balived { "keep-alive" } else { "close" }.to_string(),
    ));

    if let Some(ref jar) = option.cookies {
        if let Some(value) = jar.header_for(host, path, option.is_ssl()) {
            head.push(("Cookie".to_string(), value));
        }
    }

    let (bof, eof) = option.range;
    let range = if bof != 0 && eof >= bof {
        Some(format!("bytes={}-{}", bof, eof))
    } else if bof != 0 && eof == 0 {
        Some(format!("bytes={}-", bof))
    } else if bof == 0 && eof != 0 {
        Some(format!("bytes=0-{}", eof))
    } else if bof > eof {
        return Err(State::Http(HttpState::RangeInvalid));
    } else {
        None
    };
    if let Some(range) = range {
        head.push(("Range".to_string(), range));
    }

    if option.method == Method::POST {
        let mut size = itoa::Buffer::new();
        head.push(("Content-Length".to_string(), size.format(post_size).to_string()));
    }

    // custom headers replace defaults of the same name, extras append
    for (name, value) in option.head.iter() {
        let value = match value.to_str() {
            Ok(value) => value.to_string(),
            Err(_) => continue,
        };
        match head
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name.as_str()))
        {
            Some(slot) => slot.1 = value,
            None => head.push((name.as_str().to_string(), value)),
        }
    }

    let mut out = String::with_capacity(256);
    out.push_str(option.method.as_str());
    out.push(' ');
    // the url type stores escaped text; re-escape from the decoded form so
    // each profile applies exactly once
    out.push_str(&escape::encode_path(&escape::decode(path)));
    if let Some(args) = args {
        out.push('?');
        out.push_str(&escape::encode_args(&escape::decode(args)));
    }
    out.push_str(" HTTP/1.");
    out.push(if option.version == 0 { '0' } else { '1' });
    out.push_str("\r\n");
    for (name, value) in &head {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HeaderName, HeaderValue};
    use std::sync::Arc;

    fn options(url: &str) -> Options {
        let mut option = Options::new();
        option.url = Some(url::Url::parse(url).unwrap());
        option
    }

    #[test]
    fn get_request_defaults() {
        let option = options("http://example.com/index.html");
        let head = format_head(&option, &Status::new(), 0).unwrap();
        let mut lines = head.lines();
        assert_eq!(lines.next(), Some("GET /index.html HTTP/1.1"));
        assert!(head.contains("Host: example.com\r\n"));
        assert!(head.contains("Accept: */*\r\n"));
        assert!(head.contains("Connection: close\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
        assert!(!head.contains("Content-Length"));
    }

    #[test]
    fn keep_alive_follows_status() {
        let option = options("http://example.com/");
        let mut status = Status::new();
        status.balived = true;
        let head = format_head(&option, &status, 0).unwrap();
        assert!(head.contains("Connection: keep-alive\r\n"));
    }

    #[test]
    fn path_and_args_are_escaped() {
        let option = options("http://example.com/a%20b/c?k=v%26w");
        let head = format_head(&option, &Status::new(), 0).unwrap();
        assert!(head.starts_with("GET /a%20b/c?k%3Dv%26w HTTP/1.1\r\n"));
    }

    #[test]
    fn http10_version_line() {
        let mut option = options("http://example.com/");
        option.version = 0;
        let head = format_head(&option, &Status::new(), 0).unwrap();
        assert!(head.starts_with("GET / HTTP/1.0\r\n"));
    }

    #[test]
    fn range_forms() {
        let mut option = options("http://example.com/");
        option.range = (100, 200);
        let head = format_head(&option, &Status::new(), 0).unwrap();
        assert!(head.contains("Range: bytes=100-200\r\n"));

        option.range = (100, 0);
        let head = format_head(&option, &Status::new(), 0).unwrap();
        assert!(head.contains("Range: bytes=100-\r\n"));

        option.range = (0, 200);
        let head = format_head(&option, &Status::new(), 0).unwrap();
        assert!(head.contains("Range: bytes=0-200\r\n"));

        option.range = (0, 0);
        let head = format_head(&option, &Status::new(), 0).unwrap();
        assert!(!head.contains("Range"));

        option.range = (200, 100);
        let err = format_head(&option, &Status::new(), 0).unwrap_err();
        assert_eq!(err, State::Http(HttpState::RangeInvalid));
    }

    #[test]
    fn post_carries_content_length() {
        let mut option = options("http://example.com/upload");
        option.method = Method::POST;
        let head = format_head(&option, &Status::new(), 13).unwrap();
        assert!(head.starts_with("POST /upload HTTP/1.1\r\n"));
        assert!(head.contains("Content-Length: 13\r\n"));
    }

    #[test]
    fn custom_headers_override_defaults() {
        let mut option = options("http://example.com/");
        option.head.insert(
            HeaderName::from_static("accept"),
            HeaderValue::from_static("text/html"),
        );
        option.head.insert(
            HeaderName::from_static("x-extra"),
            HeaderValue::from_static("1"),
        );
        let head = format_head(&option, &Status::new(), 0).unwrap();
        assert!(head.contains("accept: text/html\r\n") || head.contains("Accept: text/html\r\n"));
        assert!(!head.contains("*/*"));
        assert!(head.contains("x-extra: 1\r\n"));
    }

    #[test]
    fn cookie_header_from_jar() {
        let jar = Arc::new(super::super::cookies::Cookies::new());
        jar.set_from_header("example.com", "/", false, "sid=42");
        let mut option = options("http://example.com/page");
        option.cookies = Some(jar);
        let head = format_head(&option, &Status::new(), 0).unwrap();
        assert!(head.contains("Cookie: sid=42\r\n"));
    }
}

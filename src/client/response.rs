//! Response head parsing: the status line and the header lines, one at a
//! time as the line buffer completes them.

use tracing::trace;

use super::cookies::Cookies;
use super::status::Status;
use crate::state::{HttpState, State};

/// Parse `HTTP/1.<v> <code> ...`, classify the code, and abort on 4xx/5xx.
pub(crate) fn parse_status_line(line: &str, status: &mut Status) -> Result<(), State> {
    let rest = strip_prefix_ignore_case(line, "HTTP/1.")
        .ok_or(State::Http(HttpState::UnknownError))?;
    let mut chars = rest.chars();
    let version = chars
        .next()
        .and_then(|ch| ch.to_digit(10))
        .filter(|digit| *digit < 2)
        .ok_or(State::Http(HttpState::UnknownError))?;
    status.version = version as u8;

    let code_text = chars.as_str().trim_start();
    let digits: String = code_text.chars().take_while(|ch| ch.is_ascii_digit()).collect();
    let code: u16 = digits.parse().map_err(|_| State::Http(HttpState::UnknownError))?;
    status.code = code;

    status.state = match code {
        200 | 206 => State::Ok,
        204 => State::Http(HttpState::Response204),
        300..=307 => State::Http(HttpState::Response3xx(code)),
        400..=499 => State::Http(HttpState::Response4xx(code)),
        500..=599 => State::Http(HttpState::Response5xx(code)),
        _ => State::Http(HttpState::ResponseUnknown),
    };
    trace!(code, "response status");

    // client errors and server errors abort the head parse outright
    if (400..600).contains(&code) {
        return Err(status.state);
    }
    Ok(())
}

/// Parse one `Key: value` header line into the status (and jar).
pub(crate) fn parse_header_line(
    line: &str,
    status: &mut Status,
    cookies: Option<(&Cookies, &str, &str, bool)>,
) -> Result<(), State> {
    let colon = match line.find(':') {
        Some(colon) => colon,
        None => return Err(State::Http(HttpState::UnknownError)),
    };
    let name = &line[..colon];
    let value = line[colon + 1..].trim_start();
    if value.is_empty() {
        return Ok(());
    }

    if name.eq_ignore_ascii_case("Content-Length") {
        let size: i64 = value
            .parse()
            .map_err(|_| State::Http(HttpState::UnknownError))?;
        status.content_size = size;
        if status.document_size < 0 {
            status.document_size = size;
        }
    } else if name.eq_ignore_ascii_case("Content-Range") {
        // "bytes <from>-<to>/<document_size>"
        if let Some(range) = value.strip_prefix("bytes ") {
            let (from, to, document_size) = parse_content_range(range);
            status.bseeked = true;
            status.document_size = document_size as i64;
            if status.content_size < 0 {
                status.content_size = if from > 0 && to > from {
                    (to - from) as i64
                } else if from == 0 && to > 0 {
                    to as i64
                } else if from > 0 && to == 0 && document_size > from {
                    (document_size - from) as i64
                } else {
                    document_size as i64
                };
            }
        }
    } else if name.eq_ignore_ascii_case("Accept-Ranges") {
        status.bseeked = true;
    } else if name.eq_ignore_ascii_case("Content-Type") {
        status.content_type.clear();
        status.content_type.push_str(value);
    } else if name.eq_ignore_ascii_case("Transfer-Encoding") {
        if value.eq_ignore_ascii_case("chunked") {
            status.bchunked = true;
        }
    } else if name.eq_ignore_ascii_case("Content-Encoding") {
        if value.eq_ignore_ascii_case("gzip") {
            status.bgzip = true;
        } else if value.eq_ignore_ascii_case("deflate") {
            status.bdeflate = true;
        }
    } else if name.eq_ignore_ascii_case("Location") {
        // only the redirect family may carry a Location we follow
        if !(301..=307).contains(&status.code) {
            return Err(State::Http(HttpState::UnknownError));
        }
        status.location.clear();
        status.location.push_str(value);
    } else if name.eq_ignore_ascii_case("Connection") {
        status.balived = !value.eq_ignore_ascii_case("close");
    } else if name.eq_ignore_ascii_case("Set-Cookie") {
        if let Some((jar, host, path, secure)) = cookies {
            jar.set_from_header(host, path, secure, value);
        }
    }
    Ok(())
}

fn parse_content_range(range: &str) -> (u64, u64, u64) {
    let mut from = 0;
    let mut to = 0;
    let mut document_size = 0;
    let (span, total) = match range.find('/') {
        Some(slash) => (&range[..slash], &range[slash + 1..]),
        None => (range, ""),
    };
    if let Some(dash) = span.find('-') {
        from = span[..dash].trim().parse().unwrap_or(0);
        to = span[dash + 1..].trim().parse().unwrap_or(0);
    }
    if !total.is_empty() {
        document_size = total.trim().parse().unwrap_or(0);
    }
    (from, to, document_size)
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    if text.len() >= prefix.len() && text[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&text[prefix.len()..])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status() -> Status {
        Status::new()
    }

    #[test]
    fn status_line_classes() {
        let mut s = status();
        parse_status_line("HTTP/1.1 200 OK", &mut s).unwrap();
        assert_eq!((s.code, s.version, s.state), (200, 1, State::Ok));

        parse_status_line("HTTP/1.0 206 Partial Content", &mut s).unwrap();
        assert_eq!((s.code, s.version, s.state), (206, 0, State::Ok));

        parse_status_line("HTTP/1.1 204 No Content", &mut s).unwrap();
        assert_eq!(s.state, State::Http(HttpState::Response204));

        parse_status_line("HTTP/1.1 302 Found", &mut s).unwrap();
        assert_eq!(s.state, State::Http(HttpState::Response3xx(302)));

        let err = parse_status_line("HTTP/1.1 404 Not Found", &mut s).unwrap_err();
        assert_eq!(err, State::Http(HttpState::Response4xx(404)));

        let err = parse_status_line("HTTP/1.1 503 Unavailable", &mut s).unwrap_err();
        assert_eq!(err, State::Http(HttpState::Response5xx(503)));

        let err = parse_status_line("SIP/2.0 200 OK", &mut s).unwrap_err();
        assert_eq!(err, State::Http(HttpState::UnknownError));
    }

    #[test]
    fn content_length_fills_both_sizes_once() {
        let mut s = status();
        parse_header_line("Content-Length: 586879", &mut s, None).unwrap();
        assert_eq!(s.content_size, 586879);
        assert_eq!(s.document_size, 586879);
    }

    #[test]
    fn content_range_arithmetic() {
        // both endpoints
        let mut s = status();
        parse_header_line("Content-Range: bytes 100-200/500", &mut s, None).unwrap();
        assert!(s.bseeked);
        assert_eq!(s.document_size, 500);
        assert_eq!(s.content_size, 100);

        // only to
        let mut s = status();
        parse_header_line("Content-Range: bytes 0-200/500", &mut s, None).unwrap();
        assert_eq!(s.content_size, 200);

        // only from
        let mut s = status();
        parse_header_line("Content-Range: bytes 100-0/500", &mut s, None).unwrap();
        assert_eq!(s.content_size, 400);

        // neither
        let mut s = status();
        parse_header_line("Content-Range: bytes 0-0/500", &mut s, None).unwrap();
        assert_eq!(s.content_size, 500);

        // an earlier Content-Length wins
        let mut s = status();
        parse_header_line("Content-Length: 101", &mut s, None).unwrap();
        parse_header_line("Content-Range: bytes 100-200/500", &mut s, None).unwrap();
        assert_eq!(s.content_size, 101);
    }

    #[test]
    fn transfer_and_content_encodings() {
        let mut s = status();
        parse_header_line("Transfer-Encoding: chunked", &mut s, None).unwrap();
        assert!(s.bchunked);
        parse_header_line("Content-Encoding: gzip", &mut s, None).unwrap();
        assert!(s.bgzip);
        let mut s = status();
        parse_header_line("Content-Encoding: deflate", &mut s, None).unwrap();
        assert!(s.bdeflate);
    }

    #[test]
    fn connection_close_clears_keep_alive() {
        let mut s = status();
        parse_header_line("Connection: keep-alive", &mut s, None).unwrap();
        assert!(s.balived);
        parse_header_line("Connection: close", &mut s, None).unwrap();
        assert!(!s.balived);
    }

    #[test]
    fn location_requires_redirect_code() {
        let mut s = status();
        s.code = 302;
        parse_header_line("Location: /dest", &mut s, None).unwrap();
        assert_eq!(s.location, "/dest");

        let mut s = status();
        s.code = 200;
        assert!(parse_header_line("Location: /dest", &mut s, None).is_err());
    }

    #[test]
    fn set_cookie_reaches_the_jar() {
        let jar = Cookies::new();
        let mut s = status();
        s.code = 200;
        parse_header_line(
            "Set-Cookie: sid=1; Path=/",
            &mut s,
            Some((&jar, "example.com", "/", false)),
        )
        .unwrap();
        assert!(jar.header_for("example.com", "/", false).is_some());
    }

    #[test]
    fn header_without_value_is_skipped() {
        let mut s = status();
        parse_header_line("X-Empty:", &mut s, None).unwrap();
        parse_header_line("X-Empty:   ", &mut s, None).unwrap();
    }
}

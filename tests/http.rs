mod support;

use std::io::Write;
use std::sync::atomic::Ordering;
use std::sync::{mpsc, Arc, Mutex};

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;

use aicp::client::Client;
use aicp::{Aicp, HttpState, State};
use support::TIMEOUT;

fn url(addr: std::net::SocketAddr, path: &str) -> String {
    format!("http://{}{}", addr, path)
}

/// Read the whole body; returns the bytes once the EOF pair lands.
fn read_all(client: &Client) -> (Vec<u8>, State) {
    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink = collected.clone();
    let (tx, rx) = mpsc::channel();
    assert!(client.read(0, move |state, data| {
        match state {
            State::Ok => {
                sink.lock().unwrap().extend_from_slice(&data);
                true
            }
            other => {
                tx.send(other).unwrap();
                false
            }
        }
    }));
    let last = rx.recv_timeout(TIMEOUT).expect("body end");
    let bytes = collected.lock().unwrap().clone();
    (bytes, last)
}

fn open_ok(client: &Client) -> aicp::client::Status {
    let (tx, rx) = mpsc::channel();
    assert!(client.open(move |state, status| {
        tx.send((state, status)).unwrap();
    }));
    let (state, status) = rx.recv_timeout(TIMEOUT).expect("open");
    assert_eq!(state, State::Ok, "open failed: {:?}", status.state);
    status
}

fn clos_ok(client: &Client) {
    let (tx, rx) = mpsc::channel();
    assert!(client.clos(move |state| {
        tx.send(state).unwrap();
    }));
    assert_eq!(rx.recv_timeout(TIMEOUT).expect("clos"), State::Ok);
}

#[test]
fn get_keep_alive_reuses_the_connection() {
    support::init_logs();
    let server = support::serve(|exchange| match exchange.path() {
        "/a" => (
            b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\nConnection: keep-alive\r\n\r\nA".to_vec(),
            true,
        ),
        "/b" => (
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: keep-alive\r\n\r\nBB".to_vec(),
            true,
        ),
        path => panic!("unexpected path {}", path),
    });

    let aicp = Aicp::new(64).expect("aicp");
    let _pool = support::workers(&aicp, 2);
    let client = Client::new(&aicp);

    assert!(client.set_url(&url(server.addr, "/a")));
    let status = open_ok(&client);
    assert_eq!(status.code, 200);
    assert_eq!(status.content_size, 1);
    assert!(status.balived);
    let (body, last) = read_all(&client);
    assert_eq!(&body[..], b"A");
    assert_eq!(last, State::Closed);
    clos_ok(&client);

    assert!(client.set_url(&url(server.addr, "/b")));
    let status = open_ok(&client);
    assert_eq!(status.code, 200);
    let (body, last) = read_all(&client);
    assert_eq!(&body[..], b"BB");
    assert_eq!(last, State::Closed);
    clos_ok(&client);

    assert_eq!(server.connections.load(Ordering::SeqCst), 1);
}

#[test]
fn redirect_is_followed_within_budget() {
    support::init_logs();
    let server = support::serve(|exchange| match exchange.path() {
        "/r" => (
            b"HTTP/1.1 302 Found\r\nLocation: /dest\r\nContent-Length: 0\r\nConnection: keep-alive\r\n\r\n"
                .to_vec(),
            true,
        ),
        "/dest" => (
            b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\nConnection: keep-alive\r\n\r\nOK!".to_vec(),
            true,
        ),
        path => panic!("unexpected path {}", path),
    });

    let aicp = Aicp::new(64).expect("aicp");
    let _pool = support::workers(&aicp, 2);
    let client = Client::new(&aicp);
    assert!(client.set_url(&url(server.addr, "/r")));
    assert!(client.set_redirect(5));

    let status = open_ok(&client);
    assert_eq!(status.code, 200);
    let (body, last) = read_all(&client);
    assert_eq!(&body[..], b"OK!");
    assert_eq!(last, State::Closed);
    clos_ok(&client);
}

#[test]
fn redirect_with_zero_budget_surfaces_the_location() {
    support::init_logs();
    let server = support::serve(|_| {
        (
            b"HTTP/1.1 302 Found\r\nLocation: /dest\r\nContent-Length: 0\r\n\r\n".to_vec(),
            false,
        )
    });

    let aicp = Aicp::new(64).expect("aicp");
    let _pool = support::workers(&aicp, 2);
    let client = Client::new(&aicp);
    assert!(client.set_url(&url(server.addr, "/r")));
    assert!(client.set_redirect(0));

    let status = open_ok(&client);
    assert_eq!(status.code, 302);
    assert_eq!(status.state, State::Http(HttpState::Response3xx(302)));
    assert_eq!(status.location, "/dest");
    clos_ok(&client);
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn chunk(payload: &[u8], piece: usize) -> Vec<u8> {
    let mut out = Vec::new();
    for part in payload.chunks(piece) {
        out.extend(format!("{:x}\r\n", part.len()).into_bytes());
        out.extend_from_slice(part);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"0\r\n\r\n");
    out
}

#[test]
fn chunked_gzip_body_inflates_to_the_original() {
    support::init_logs();
    let compressed = gzip(b"hello world");
    let body = chunk(&compressed, 7);
    let server = support::serve(move |_| {
        let mut response = Vec::from(
            &b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nContent-Encoding: gzip\r\n\r\n"[..],
        );
        response.extend_from_slice(&body);
        (response, false)
    });

    let aicp = Aicp::new(64).expect("aicp");
    let _pool = support::workers(&aicp, 2);
    let client = Client::new(&aicp);
    assert!(client.set_url(&url(server.addr, "/z")));
    assert!(client.set_unzip(true));

    let status = open_ok(&client);
    assert!(status.bchunked);
    assert!(status.bgzip);
    assert!(!status.bseeked);
    let (bytes, last) = read_all(&client);
    assert_eq!(&bytes[..], b"hello world");
    assert_eq!(last, State::Closed);
    clos_ok(&client);
}

#[test]
fn chunked_without_gzip_dechunks() {
    support::init_logs();
    let body = chunk(b"dechunk me please", 5);
    let server = support::serve(move |_| {
        let mut response =
            Vec::from(&b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n"[..]);
        response.extend_from_slice(&body);
        (response, false)
    });

    let aicp = Aicp::new(64).expect("aicp");
    let _pool = support::workers(&aicp, 2);
    let client = Client::new(&aicp);
    assert!(client.set_url(&url(server.addr, "/c")));

    let status = open_ok(&client);
    assert!(status.bchunked);
    let (bytes, last) = read_all(&client);
    assert_eq!(&bytes[..], b"dechunk me please");
    assert_eq!(last, State::Closed);
    clos_ok(&client);
}

#[test]
fn post_sends_content_length_and_body() {
    support::init_logs();
    let server = support::serve(|exchange| {
        assert_eq!(exchange.header("content-length"), Some("9"));
        assert_eq!(&exchange.body[..], b"abcdefghi");
        (
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec(),
            false,
        )
    });

    let aicp = Aicp::new(64).expect("aicp");
    let _pool = support::workers(&aicp, 2);
    let client = Client::new(&aicp);
    assert!(client.set_url(&url(server.addr, "/upload")));
    assert!(client.set_method(http::Method::POST));
    assert!(client.set_post_data(Bytes::from_static(b"abcdefghi")));

    let progress = Arc::new(Mutex::new(Vec::new()));
    let seen = progress.clone();
    assert!(client.set_post_func(Arc::new(move |state, offset, size, _save, _rate| {
        seen.lock().unwrap().push((state, offset, size));
        true
    })));

    let status = open_ok(&client);
    assert_eq!(status.code, 200);
    let (body, last) = read_all(&client);
    assert_eq!(&body[..], b"ok");
    assert_eq!(last, State::Closed);
    clos_ok(&client);

    let progress = progress.lock().unwrap();
    assert!(progress
        .iter()
        .any(|(state, offset, _)| *state == State::Ok && *offset == 9));
    assert_eq!(progress.last().unwrap().0, State::Closed);
}

#[test]
fn error_classes_abort_the_open() {
    support::init_logs();
    let server = support::serve(|_| {
        (
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_vec(),
            false,
        )
    });

    let aicp = Aicp::new(64).expect("aicp");
    let _pool = support::workers(&aicp, 2);
    let client = Client::new(&aicp);
    assert!(client.set_url(&url(server.addr, "/missing")));

    let (tx, rx) = mpsc::channel();
    assert!(client.open(move |state, status| {
        tx.send((state, status.state)).unwrap();
    }));
    let (state, status_state) = rx.recv_timeout(TIMEOUT).expect("open");
    assert_eq!(state, State::Http(HttpState::Response4xx(404)));
    assert_eq!(status_state, State::Http(HttpState::Response4xx(404)));
}

#[test]
fn seek_reopens_with_a_range() {
    support::init_logs();
    const DOC: &[u8] = b"HELLOWORLD";
    let server = support::serve(|exchange| match exchange.header("range") {
        None => (
            format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nAccept-Ranges: bytes\r\nConnection: keep-alive\r\n\r\n{}",
                DOC.len(),
                std::str::from_utf8(DOC).unwrap()
            )
            .into_bytes(),
            true,
        ),
        Some(range) => {
            assert_eq!(range, "bytes=5-9");
            (
                format!(
                    "HTTP/1.1 206 Partial Content\r\nContent-Length: 5\r\nContent-Range: bytes 5-9/10\r\nConnection: keep-alive\r\n\r\n{}",
                    std::str::from_utf8(&DOC[5..]).unwrap()
                )
                .into_bytes(),
                true,
            )
        }
    });

    let aicp = Aicp::new(64).expect("aicp");
    let _pool = support::workers(&aicp, 2);
    let client = Client::new(&aicp);
    assert!(client.set_url(&url(server.addr, "/doc")));

    let status = open_ok(&client);
    assert_eq!(status.code, 200);
    assert!(status.bseeked);
    let (body, _) = read_all(&client);
    assert_eq!(&body[..], DOC);

    let (tx, rx) = mpsc::channel();
    assert!(client.seek(5, move |state, offset| {
        tx.send((state, offset)).unwrap();
    }));
    let (state, offset) = rx.recv_timeout(TIMEOUT).expect("seek");
    assert_eq!(state, State::Ok);
    assert_eq!(offset, 5);
    assert_eq!(client.status().code, 206);

    let (body, last) = read_all(&client);
    assert_eq!(&body[..], b"WORLD");
    assert_eq!(last, State::Closed);
    clos_ok(&client);
}

#[test]
fn open_read_composes() {
    support::init_logs();
    let server = support::serve(|_| {
        (
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nquick".to_vec(),
            false,
        )
    });

    let aicp = Aicp::new(64).expect("aicp");
    let _pool = support::workers(&aicp, 2);
    let client = Client::new(&aicp);
    assert!(client.set_url(&url(server.addr, "/q")));

    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink = collected.clone();
    let (tx, rx) = mpsc::channel();
    assert!(client.open_read(0, move |state, data| match state {
        State::Ok => {
            sink.lock().unwrap().extend_from_slice(&data);
            true
        }
        other => {
            tx.send(other).unwrap();
            false
        }
    }));
    assert_eq!(rx.recv_timeout(TIMEOUT).expect("body"), State::Closed);
    assert_eq!(&collected.lock().unwrap()[..], b"quick");
    clos_ok(&client);
}

#[test]
fn kill_during_open_reports_killed() {
    support::init_logs();
    // a fixture that accepts and then goes silent
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        let _held = listener.accept();
        std::thread::sleep(std::time::Duration::from_secs(30));
    });

    let aicp = Aicp::new(64).expect("aicp");
    let _pool = support::workers(&aicp, 2);
    let client = Client::new(&aicp);
    assert!(client.set_url(&url(addr, "/stalled")));

    let (tx, rx) = mpsc::channel();
    assert!(client.open(move |state, _status| {
        tx.send(state).unwrap();
    }));
    std::thread::sleep(std::time::Duration::from_millis(100));
    client.kill();
    assert_eq!(rx.recv_timeout(TIMEOUT).expect("open"), State::Killed);
}

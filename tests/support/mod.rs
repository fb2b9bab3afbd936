#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use aicp::Aicp;

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// A pool of threads running the engine's loop; killed and joined on drop.
pub struct Workers {
    aicp: Aicp,
    handles: Vec<JoinHandle<()>>,
}

pub fn workers(aicp: &Aicp, count: usize) -> Workers {
    let handles = (0..count)
        .map(|_| {
            let aicp = aicp.clone();
            thread::spawn(move || aicp.run())
        })
        .collect();
    Workers {
        aicp: aicp.clone(),
        handles,
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        self.aicp.kill();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// One accepted HTTP exchange as the fixture saw it.
pub struct Exchange {
    pub head: String,
    pub body: Vec<u8>,
}

impl Exchange {
    pub fn path(&self) -> &str {
        self.head
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .unwrap_or("/")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        let prefix = format!("{}:", name.to_ascii_lowercase());
        self.head.lines().find_map(|line| {
            if line.to_ascii_lowercase().starts_with(&prefix) {
                Some(line[prefix.len()..].trim())
            } else {
                None
            }
        })
    }
}

/// A canned-response HTTP fixture on an ephemeral local port.
///
/// The handler returns the raw response bytes plus whether to keep the
/// connection open for another exchange.
pub struct Server {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicUsize>,
}

pub fn serve<H>(handler: H) -> Server
where
    H: Fn(&Exchange) -> (Vec<u8>, bool) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("fixture bind");
    let addr = listener.local_addr().expect("fixture addr");
    let connections = Arc::new(AtomicUsize::new(0));
    let seen = connections.clone();
    let handler = Arc::new(handler);
    thread::spawn(move || {
        for stream in listener.incoming() {
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(_) => break,
            };
            seen.fetch_add(1, Ordering::SeqCst);
            let handler = handler.clone();
            thread::spawn(move || {
                let _ = stream.set_read_timeout(Some(TIMEOUT));
                loop {
                    let exchange = match read_exchange(&mut stream) {
                        Some(exchange) => exchange,
                        None => break,
                    };
                    let (response, keep) = handler(&exchange);
                    if stream.write_all(&response).is_err() {
                        break;
                    }
                    let _ = stream.flush();
                    if !keep {
                        break;
                    }
                }
            });
        }
    });
    Server { addr, connections }
}

fn read_exchange(stream: &mut std::net::TcpStream) -> Option<Exchange> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(0) => return None,
            Ok(_) => head.push(byte[0]),
            Err(_) => return None,
        }
        if head.len() > 64 * 1024 {
            return None;
        }
    }
    let head = String::from_utf8_lossy(&head).into_owned();
    let content_length = head
        .lines()
        .find_map(|line| {
            let lower = line.to_ascii_lowercase();
            lower
                .strip_prefix("content-length:")
                .map(|value| value.trim().parse::<usize>().unwrap_or(0))
        })
        .unwrap_or(0);
    let mut body = vec![0u8; content_length];
    if content_length > 0 && stream.read_exact(&mut body).is_err() {
        return None;
    }
    Some(Exchange { head, body })
}

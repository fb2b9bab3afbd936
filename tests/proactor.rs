mod support;

use std::io::{Read, Write};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use aicp::{Aicp, State, TimeoutKind};
use support::TIMEOUT;

#[test]
fn udp_echo() {
    support::init_logs();
    let aicp = Aicp::new(64).expect("aicp");
    let _pool = support::workers(&aicp, 2);

    let udp = aicp.aico_udp("127.0.0.1:0".parse().unwrap()).expect("udp");
    let addr = udp.local_addr().expect("local addr");

    let (tx, rx) = mpsc::channel();
    let receiver = udp.clone();
    assert!(udp.usend(addr, Bytes::from_static(b"hello"), move |aice| {
        assert_eq!(aice.state, State::Ok);
        assert_eq!(aice.real(), 5);
        let tx = tx.clone();
        receiver.urecv(16, move |mut aice| {
            let peer = aice.peer();
            let data = aice.take_data().unwrap();
            tx.send((aice.state, aice.real(), peer, data)).unwrap();
            true
        });
        true
    }));

    let (state, real, peer, data) = rx.recv_timeout(TIMEOUT).expect("echo");
    assert_eq!(state, State::Ok);
    assert_eq!(real, 5);
    assert_eq!(peer, Some(addr));
    assert_eq!(&data[..], b"hello");

    udp.exit();
    assert_eq!(aicp.wait_all(5000), 1);
}

#[test]
fn tcp_accept_connect_echo() {
    support::init_logs();
    let aicp = Aicp::new(64).expect("aicp");
    let _pool = support::workers(&aicp, 2);

    let listener = aicp
        .aico_listener("127.0.0.1:0".parse().unwrap())
        .expect("listener");
    let addr = listener.local_addr().expect("listener addr");

    let (tx, rx) = mpsc::channel();
    assert!(listener.acpt(move |mut aice| {
        assert_eq!(aice.state, State::Ok);
        let peer = aice.peer().expect("peer addr");
        let accepted = aice.take_accepted().expect("client aico");
        let tx = tx.clone();
        let echo = accepted.clone();
        accepted.recv(16, move |mut aice| {
            let data = aice.take_data().unwrap();
            tx.send((aice.state, aice.real(), peer, data, echo.clone()))
                .unwrap();
            true
        });
        // one client is enough
        false
    }));

    let client = aicp.aico_tcp().expect("client");
    let sender = client.clone();
    assert!(client.conn(addr, move |aice| {
        assert_eq!(aice.state, State::Ok);
        sender.send(Bytes::from_static(b"ping\n"), |aice| {
            assert_eq!(aice.state, State::Ok);
            assert_eq!(aice.real(), 5);
            true
        });
        true
    }));

    let (state, real, _peer, data, accepted) = rx.recv_timeout(TIMEOUT).expect("echo");
    assert_eq!(state, State::Ok);
    assert_eq!(real, 5);
    assert_eq!(&data[..], b"ping\n");

    accepted.exit();
    client.exit();
    listener.exit();
    assert_eq!(aicp.wait_all(5000), 1);
}

#[test]
fn runtask_fires_after_delay() {
    support::init_logs();
    let aicp = Aicp::new(16).expect("aicp");
    let _pool = support::workers(&aicp, 1);

    let task = aicp.aico_task().expect("task");
    let (tx, rx) = mpsc::channel();
    let started = Instant::now();
    assert!(task.task_run(40, move |aice| {
        tx.send((aice.state, started.elapsed())).unwrap();
        true
    }));
    let (state, elapsed) = rx.recv_timeout(TIMEOUT).expect("task");
    assert_eq!(state, State::Ok);
    assert!(elapsed >= Duration::from_millis(35), "fired at {:?}", elapsed);

    task.exit();
    assert_eq!(aicp.wait_all(5000), 1);
}

#[test]
fn delayed_post_on_killed_handle_reports_killed() {
    support::init_logs();
    let aicp = Aicp::new(16).expect("aicp");
    let _pool = support::workers(&aicp, 1);

    let task = aicp.aico_task().expect("task");
    let (tx, rx) = mpsc::channel();
    assert!(task.task_run(150, move |aice| {
        tx.send(aice.state).unwrap();
        true
    }));
    task.kill();
    // the delay elapses inside the timer; killing must not lose the
    // callback, only flip its state
    let state = rx.recv_timeout(TIMEOUT).expect("killed callback");
    assert_eq!(state, State::Killed);

    task.exit();
    assert_eq!(aicp.wait_all(5000), 1);
}

#[test]
fn post_after_kill_is_a_killed_aice() {
    support::init_logs();
    let aicp = Aicp::new(16).expect("aicp");
    let _pool = support::workers(&aicp, 1);

    let task = aicp.aico_task().expect("task");
    task.kill();
    let (tx, rx) = mpsc::channel();
    assert!(task.task_run(0, move |aice| {
        tx.send(aice.state).unwrap();
        true
    }));
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), State::Killed);

    task.exit();
    assert_eq!(aicp.wait_all(5000), 1);
}

#[test]
fn kill_all_cancels_pending_recv() {
    support::init_logs();
    let aicp = Aicp::new(16).expect("aicp");
    let _pool = support::workers(&aicp, 2);

    // a connected pair over which nothing will ever arrive
    let fixture = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = fixture.local_addr().unwrap();
    let client = std::net::TcpStream::connect(addr).unwrap();
    let (_server, _) = fixture.accept().unwrap();

    let aico = aicp.aico_tcp_from(client).expect("aico");
    let (tx, rx) = mpsc::channel();
    assert!(aico.recv(64, move |aice| {
        tx.send(aice.state).unwrap();
        true
    }));
    std::thread::sleep(Duration::from_millis(50));
    aicp.kill_all();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), State::Killed);

    aico.exit();
    assert_eq!(aicp.wait_all(5000), 1);
}

#[test]
fn recv_timeout_expires() {
    support::init_logs();
    let aicp = Aicp::new(16).expect("aicp");
    let _pool = support::workers(&aicp, 1);

    let fixture = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = fixture.local_addr().unwrap();
    let client = std::net::TcpStream::connect(addr).unwrap();
    let (_server, _) = fixture.accept().unwrap();

    let aico = aicp.aico_tcp_from(client).expect("aico");
    aico.timeout_set(TimeoutKind::Recv, 60);
    assert_eq!(aico.timeout(TimeoutKind::Recv), 60);

    let (tx, rx) = mpsc::channel();
    let started = Instant::now();
    assert!(aico.recv(64, move |aice| {
        tx.send((aice.state, started.elapsed())).unwrap();
        true
    }));
    let (state, elapsed) = rx.recv_timeout(TIMEOUT).expect("timeout callback");
    assert_eq!(state, State::Timeout);
    assert!(elapsed >= Duration::from_millis(50), "expired at {:?}", elapsed);

    aico.exit();
    assert_eq!(aicp.wait_all(5000), 1);
}

#[test]
fn zero_byte_send_completes_ok() {
    support::init_logs();
    let aicp = Aicp::new(16).expect("aicp");
    let _pool = support::workers(&aicp, 1);

    let fixture = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = fixture.local_addr().unwrap();
    let client = std::net::TcpStream::connect(addr).unwrap();
    let (_server, _) = fixture.accept().unwrap();

    let aico = aicp.aico_tcp_from(client).expect("aico");
    let (tx, rx) = mpsc::channel();
    assert!(aico.send(Bytes::new(), move |aice| {
        tx.send((aice.state, aice.real())).unwrap();
        true
    }));
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), (State::Ok, 0));

    aico.exit();
    assert_eq!(aicp.wait_all(5000), 1);
}

#[test]
fn sendf_copies_file_to_socket() {
    support::init_logs();
    let aicp = Aicp::new(16).expect("aicp");
    let _pool = support::workers(&aicp, 1);

    let dir = std::env::temp_dir().join(format!("aicp-sendf-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("payload");
    std::fs::write(&path, b"0123456789").unwrap();

    let fixture = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = fixture.local_addr().unwrap();
    let client = std::net::TcpStream::connect(addr).unwrap();
    let (mut server, _) = fixture.accept().unwrap();

    let aico = aicp.aico_tcp_from(client).expect("aico");
    let file = std::fs::File::open(&path).unwrap();
    let (tx, rx) = mpsc::channel();
    assert!(aico.sendf(file, 2, 5, move |aice| {
        tx.send((aice.state, aice.real())).unwrap();
        true
    }));
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), (State::Ok, 5));

    let mut got = [0u8; 5];
    server.set_read_timeout(Some(TIMEOUT)).unwrap();
    server.read_exact(&mut got).unwrap();
    assert_eq!(&got, b"23456");

    aico.exit();
    assert_eq!(aicp.wait_all(5000), 1);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn file_read_write_at_offsets() {
    support::init_logs();
    let aicp = Aicp::new(16).expect("aicp");
    let _pool = support::workers(&aicp, 1);

    let dir = std::env::temp_dir().join(format!("aicp-file-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("data");

    let mut options = std::fs::OpenOptions::new();
    options.read(true).write(true).create(true);
    let aico = aicp.aico_file_from_path(&path, &options).expect("file aico");

    let (tx, rx) = mpsc::channel();
    let reader = aico.clone();
    let txr = tx.clone();
    assert!(aico.writ(3, Bytes::from_static(b"abcdef"), move |aice| {
        assert_eq!(aice.state, State::Ok);
        assert_eq!(aice.real(), 6);
        reader.read(5, 4, move |mut aice| {
            let data = aice.take_data().unwrap();
            txr.send((aice.state, data)).unwrap();
            true
        });
        true
    }));
    let (state, data) = rx.recv_timeout(TIMEOUT).expect("read back");
    assert_eq!(state, State::Ok);
    assert_eq!(&data[..], b"cdef");

    let (tx, rx) = mpsc::channel();
    assert!(aico.fsync(move |aice| {
        tx.send(aice.state).unwrap();
        true
    }));
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), State::Ok);

    aico.exit();
    assert_eq!(aicp.wait_all(5000), 1);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn wait_all_times_out_until_handles_exit() {
    support::init_logs();
    let aicp = Aicp::new(16).expect("aicp");
    let _pool = support::workers(&aicp, 1);

    let task = aicp.aico_task().expect("task");
    assert_eq!(aicp.wait_all(50), 0);
    task.exit();
    assert_eq!(aicp.wait_all(5000), 1);
}

#[test]
fn sendv_and_recvv_move_vectored_data() {
    support::init_logs();
    let aicp = Aicp::new(16).expect("aicp");
    let _pool = support::workers(&aicp, 2);

    let fixture = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = fixture.local_addr().unwrap();
    let client = std::net::TcpStream::connect(addr).unwrap();
    let (mut server, _) = fixture.accept().unwrap();

    let aico = aicp.aico_tcp_from(client).expect("aico");
    let (tx, rx) = mpsc::channel();
    assert!(aico.sendv(
        vec![Bytes::from_static(b"vec"), Bytes::from_static(b"tored")],
        move |aice| {
            tx.send((aice.state, aice.real())).unwrap();
            true
        }
    ));
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), (State::Ok, 8));

    let mut got = [0u8; 8];
    server.set_read_timeout(Some(TIMEOUT)).unwrap();
    server.read_exact(&mut got).unwrap();
    assert_eq!(&got, b"vectored");

    // scatter the echo back across two buffers
    server.write_all(b"01234567").unwrap();
    let (tx, rx) = mpsc::channel();
    let bufs = vec![bytes::BytesMut::with_capacity(3), bytes::BytesMut::with_capacity(5)];
    assert!(aico.recvv(bufs, move |aice| {
        let list = match aice.op {
            aicp::AiceOp::Recvv { ref list, .. } => {
                list.iter().map(|buf| buf.to_vec()).collect::<Vec<_>>()
            }
            _ => panic!("wrong op"),
        };
        tx.send((aice.state, aice.real(), list)).unwrap();
        true
    }));
    let (state, real, list) = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(state, State::Ok);
    assert_eq!(real, 8);
    assert_eq!(list.concat(), b"01234567");

    aico.exit();
    assert_eq!(aicp.wait_all(5000), 1);
}

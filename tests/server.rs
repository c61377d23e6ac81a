use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cinderkv::storage::ENTRY_OVERHEAD;
use cinderkv::{Server, Store};

/// Start a server with the given budget on an ephemeral port and return its
/// address. The reactor thread runs for the remainder of the test process.
fn spawn_server(max_memory: usize) -> SocketAddr {
    let store = Arc::new(Store::new(max_memory));
    let mut server = Server::bind("127.0.0.1:0".parse().unwrap(), store).expect("bind server");
    let addr = server.local_addr();
    thread::spawn(move || {
        let shutdown = AtomicBool::new(false);
        let _ = server.run(&shutdown);
    });
    addr
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("set read timeout");
    stream
}

/// Write a request and assert the exact reply bytes.
fn roundtrip(stream: &mut TcpStream, request: &[u8], expected: &[u8]) {
    stream.write_all(request).expect("write request");
    let mut reply = vec![0u8; expected.len()];
    stream.read_exact(&mut reply).expect("read reply");
    assert_eq!(reply, expected);
}

#[test]
fn set_get_del_cycle() {
    let addr = spawn_server(1024 * 1024);
    let mut c = connect(addr);

    roundtrip(&mut c, b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n", b"+OK\r\n");
    roundtrip(&mut c, b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n", b"$3\r\nbar\r\n");
    roundtrip(&mut c, b"*2\r\n$3\r\nDEL\r\n$3\r\nfoo\r\n", b":1\r\n");
    roundtrip(&mut c, b"*2\r\n$3\r\nDEL\r\n$3\r\nfoo\r\n", b":0\r\n");
    roundtrip(&mut c, b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n", b"$-1\r\n");
}

#[test]
fn binary_safe_value_survives_the_wire() {
    let addr = spawn_server(1024 * 1024);
    let mut c = connect(addr);

    // Value is 4 bytes containing NUL and an embedded CRLF.
    roundtrip(
        &mut c,
        b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$4\r\n\x00\r\n\x00\r\n",
        b"+OK\r\n",
    );
    roundtrip(&mut c, b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n", b"$4\r\n\x00\r\n\x00\r\n");
}

#[test]
fn config_probe_gets_an_empty_array() {
    let addr = spawn_server(1024 * 1024);
    let mut c = connect(addr);
    roundtrip(&mut c, b"*2\r\n$6\r\nCONFIG\r\n$3\r\nGET\r\n", b"*0\r\n");
}

#[test]
fn pipelined_frames_get_ordered_replies() {
    let addr = spawn_server(1024 * 1024);
    let mut c = connect(addr);

    // Two frames in one segment; replies must come back in order.
    let batch = b"*3\r\n$3\r\nSET\r\n$1\r\np\r\n$1\r\nq\r\n*2\r\n$3\r\nGET\r\n$1\r\np\r\n";
    roundtrip(&mut c, batch, b"+OK\r\n$1\r\nq\r\n");
}

#[test]
fn frame_split_across_segments_is_reassembled() {
    let addr = spawn_server(1024 * 1024);
    let mut c = connect(addr);

    c.write_all(b"*3\r\n$3\r\nSET\r\n$1\r\ns").expect("write first half");
    c.flush().expect("flush");
    thread::sleep(Duration::from_millis(50));
    roundtrip(&mut c, b"\r\n$1\r\nt\r\n", b"+OK\r\n");
    roundtrip(&mut c, b"*2\r\n$3\r\nGET\r\n$1\r\ns\r\n", b"$1\r\nt\r\n");
}

#[test]
fn lru_eviction_over_the_wire() {
    // Room for exactly two (1-byte key, 1-byte value) entries.
    let addr = spawn_server(2 * (1 + 1 + ENTRY_OVERHEAD));
    let mut c = connect(addr);

    roundtrip(&mut c, b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n", b"+OK\r\n");
    roundtrip(&mut c, b"*3\r\n$3\r\nSET\r\n$1\r\nb\r\n$1\r\n2\r\n", b"+OK\r\n");
    roundtrip(&mut c, b"*2\r\n$3\r\nGET\r\n$1\r\na\r\n", b"$1\r\n1\r\n");
    roundtrip(&mut c, b"*3\r\n$3\r\nSET\r\n$1\r\nc\r\n$1\r\n3\r\n", b"+OK\r\n");

    roundtrip(&mut c, b"*2\r\n$3\r\nGET\r\n$1\r\nb\r\n", b"$-1\r\n");
    roundtrip(&mut c, b"*2\r\n$3\r\nGET\r\n$1\r\na\r\n", b"$1\r\n1\r\n");
    roundtrip(&mut c, b"*2\r\n$3\r\nGET\r\n$1\r\nc\r\n", b"$1\r\n3\r\n");
}

#[test]
fn unknown_command_keeps_the_connection_open() {
    let addr = spawn_server(1024 * 1024);
    let mut c = connect(addr);

    roundtrip(
        &mut c,
        b"*1\r\n$4\r\nPING\r\n",
        b"-ERR unknown command or wrong number of arguments\r\n",
    );
    // Wrong arity gets the same reply.
    roundtrip(
        &mut c,
        b"*2\r\n$3\r\nSET\r\n$1\r\nk\r\n",
        b"-ERR unknown command or wrong number of arguments\r\n",
    );
    // And the connection still works.
    roundtrip(&mut c, b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n", b"+OK\r\n");
}

#[test]
fn malformed_frame_closes_the_connection() {
    let addr = spawn_server(1024 * 1024);
    let mut c = connect(addr);

    c.write_all(b"GARBAGE\r\n").expect("write garbage");
    let mut buf = [0u8; 16];
    // No reply; the peer closes, which reads as EOF.
    match c.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("unexpected reply {:?}", &buf[..n]),
        Err(e) => panic!("expected clean close, got {e}"),
    }

    // The server is still accepting new connections.
    let mut c2 = connect(addr);
    roundtrip(&mut c2, b"*2\r\n$3\r\nGET\r\n$1\r\nx\r\n", b"$-1\r\n");
}

#[test]
fn many_clients_interleave() {
    let addr = spawn_server(1024 * 1024);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            thread::spawn(move || {
                let mut c = connect(addr);
                let key = format!("k{i}");
                let value = format!("v{i}");
                let set = format!(
                    "*3\r\n$3\r\nSET\r\n${}\r\n{key}\r\n${}\r\n{value}\r\n",
                    key.len(),
                    value.len()
                );
                roundtrip(&mut c, set.as_bytes(), b"+OK\r\n");

                let get = format!("*2\r\n$3\r\nGET\r\n${}\r\n{key}\r\n", key.len());
                let expect = format!("${}\r\n{value}\r\n", value.len());
                roundtrip(&mut c, get.as_bytes(), expect.as_bytes());
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("client thread");
    }
}

#[test]
fn moderately_large_value_roundtrips() {
    let addr = spawn_server(16 * 1024 * 1024);
    let mut c = connect(addr);

    let size = 256 * 1024;
    let value = vec![b'z'; size];
    let mut set = format!("*3\r\n$3\r\nSET\r\n$5\r\nlarge\r\n${size}\r\n").into_bytes();
    set.extend_from_slice(&value);
    set.extend_from_slice(b"\r\n");
    roundtrip(&mut c, &set, b"+OK\r\n");

    c.write_all(b"*2\r\n$3\r\nGET\r\n$5\r\nlarge\r\n").expect("write GET");
    let header = format!("${size}\r\n");
    let mut reply = vec![0u8; header.len() + size + 2];
    c.read_exact(&mut reply).expect("read bulk reply");
    assert_eq!(&reply[..header.len()], header.as_bytes());
    assert_eq!(&reply[header.len()..header.len() + size], &value[..]);
    assert_eq!(&reply[header.len() + size..], b"\r\n");
}

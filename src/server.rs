/*!
 * Connection Dispatcher
 *
 * Single-threaded, readiness-driven TCP server. One mio poll instance
 * multiplexes the listener and every client socket; registration is
 * edge-triggered, so each ready event is drained to WouldBlock before the
 * loop returns to the poll wait. Decoded frames are executed against the
 * shared store and replies are written back with full partial-write
 * handling.
 */

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::{Buf, BytesMut};
use hashbrown::HashMap;
use log::{debug, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Protocol, Socket, Type};

use crate::command::{unknown_command_reply, Cmd, Executor};
use crate::protocol::parse_frame;
use crate::storage::Store;

const LISTENER: Token = Token(0);

/// Size of the scratch buffer for socket reads.
const READ_CHUNK: usize = 4096;

/// A connection whose outbound buffer still exceeds this after a flush
/// attempt is not keeping up and is closed.
const MAX_OUTBOUND: usize = 1024 * 1024;

/// Per-connection state: the socket and the two stream buffers.
struct Conn {
    sock: TcpStream,
    rbuf: BytesMut,
    wbuf: BytesMut,
    /// Whether the socket is currently registered for write readiness.
    want_write: bool,
}

impl Conn {
    fn new(sock: TcpStream) -> Self {
        Self {
            sock,
            rbuf: BytesMut::with_capacity(READ_CHUNK),
            wbuf: BytesMut::new(),
            want_write: false,
        }
    }
}

/// Why a connection is being torn down; decides the log level.
enum Close {
    PeerClosed,
    Protocol,
    Io(io::Error),
    Backpressure,
}

/// Readiness-driven dispatcher owning the listener and all client sockets.
pub struct Server {
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    exec: Executor,
    conns: HashMap<usize, Conn>,
    next_token: usize,
}

/// Bind a non-blocking listener with address reuse and the system-maximum
/// accept backlog.
fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(libc::SOMAXCONN)?;
    Ok(TcpListener::from_std(socket.into()))
}

impl Server {
    /// Bind `addr` and prepare the reactor. The store is shared; the server
    /// holds one reference for the lifetime of its executor.
    pub fn bind(addr: SocketAddr, store: Arc<Store>) -> Result<Server> {
        let poll = Poll::new().context("create poll instance")?;
        let mut listener =
            bind_listener(addr).with_context(|| format!("bind listener on {addr}"))?;
        let local_addr = listener.local_addr().context("query listener address")?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .context("register listener")?;

        Ok(Server {
            poll,
            listener,
            local_addr,
            exec: Executor::new(store),
            conns: HashMap::new(),
            next_token: 1,
        })
    }

    /// The address actually bound; differs from the requested address when
    /// port 0 was asked for.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the event loop until `shutdown` becomes true. Signal delivery
    /// interrupts the poll wait, so the flag is observed promptly; a wait
    /// interrupted for any other reason is simply retried.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        let mut events = Events::with_capacity(1024);
        let mut scratch = [0u8; READ_CHUNK];

        while !shutdown.load(Ordering::Relaxed) {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e).context("poll wait");
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_ready(),
                    Token(token) => {
                        let readable = event.is_readable() || event.is_read_closed();
                        let failed = event.is_error();
                        self.conn_ready(token, readable, failed, &mut scratch);
                    }
                }
            }
        }

        debug!("shutdown: closing {} connection(s)", self.conns.len());
        for (_, mut conn) in self.conns.drain() {
            let _ = self.poll.registry().deregister(&mut conn.sock);
        }
        let _ = self.poll.registry().deregister(&mut self.listener);
        Ok(())
    }

    /// Accept until the listener reports WouldBlock.
    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut sock, peer)) => {
                    sock.set_nodelay(true).ok();
                    let token = self.alloc_token();
                    if let Err(e) = self.poll.registry().register(
                        &mut sock,
                        Token(token),
                        Interest::READABLE,
                    ) {
                        warn!("register {peer}: {e}");
                        continue;
                    }
                    debug!("accepted {peer}");
                    self.conns.insert(token, Conn::new(sock));
                }
                Err(ref e) if would_block(e) => break,
                Err(e) => {
                    warn!("accept: {e}");
                    break;
                }
            }
        }
    }

    fn alloc_token(&mut self) -> usize {
        // Token 0 is the listener; skip anything still in use after wrap.
        loop {
            let token = self.next_token;
            self.next_token = self.next_token.wrapping_add(1).max(1);
            if !self.conns.contains_key(&token) {
                return token;
            }
        }
    }

    /// Drive one client event: drain reads, process frames, flush writes.
    fn conn_ready(&mut self, token: usize, readable: bool, failed: bool, scratch: &mut [u8]) {
        let Some(conn) = self.conns.get_mut(&token) else {
            // Stale event for a connection closed earlier this iteration.
            return;
        };

        let mut close: Option<Close> = if failed {
            Some(Close::Io(io::Error::other("socket error event")))
        } else {
            None
        };

        if close.is_none() && readable {
            close = read_drain(conn, scratch).err();
        }
        if close.is_none() {
            close = process_frames(conn, &self.exec).err();
        }
        if close.is_none() {
            close = flush_write(conn).err();
        }
        if close.is_none() && conn.wbuf.len() > MAX_OUTBOUND {
            close = Some(Close::Backpressure);
        }

        if let Some(reason) = close {
            match reason {
                Close::PeerClosed => debug!("conn {token}: peer closed"),
                Close::Protocol => warn!("conn {token}: protocol error, closing"),
                Close::Io(e) => debug!("conn {token}: {e}"),
                Close::Backpressure => warn!("conn {token}: outbound buffer over limit, closing"),
            }
            let mut conn = self.conns.remove(&token).unwrap();
            let _ = self.poll.registry().deregister(&mut conn.sock);
            return;
        }

        // Keep write interest in sync with whether bytes are still queued.
        let conn = self.conns.get_mut(&token).unwrap();
        let want_write = !conn.wbuf.is_empty();
        if want_write != conn.want_write {
            let interest = if want_write {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            match self
                .poll
                .registry()
                .reregister(&mut conn.sock, Token(token), interest)
            {
                Ok(()) => conn.want_write = want_write,
                Err(e) => {
                    debug!("conn {token}: reregister failed: {e}");
                    let mut conn = self.conns.remove(&token).unwrap();
                    let _ = self.poll.registry().deregister(&mut conn.sock);
                }
            }
        }
    }
}

/// Read until WouldBlock, appending to the inbound buffer.
fn read_drain(conn: &mut Conn, scratch: &mut [u8]) -> Result<(), Close> {
    loop {
        match conn.sock.read(scratch) {
            Ok(0) => return Err(Close::PeerClosed),
            Ok(n) => conn.rbuf.extend_from_slice(&scratch[..n]),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Close::Io(e)),
        }
    }
}

/// Decode and execute every complete frame in the inbound buffer, dropping
/// exactly the consumed bytes so pipelined requests survive. A malformed
/// frame closes the connection with no reply: the framing boundary is lost
/// and nothing after it can be trusted.
fn process_frames(conn: &mut Conn, exec: &Executor) -> Result<(), Close> {
    loop {
        match parse_frame(&conn.rbuf) {
            Ok(Some((consumed, args))) => {
                conn.rbuf.advance(consumed);
                let reply = match Cmd::from_args(args) {
                    Some(cmd) => exec.exec(cmd),
                    None => unknown_command_reply(),
                };
                conn.wbuf.extend_from_slice(&reply);
            }
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!("malformed frame: {e}");
                return Err(Close::Protocol);
            }
        }
    }
}

/// Write as much of the outbound buffer as the socket accepts. Leftover
/// bytes stay queued; the caller re-arms write interest for them.
fn flush_write(conn: &mut Conn) -> Result<(), Close> {
    while !conn.wbuf.is_empty() {
        match conn.sock.write(&conn.wbuf) {
            Ok(0) => return Err(Close::Io(io::Error::from(io::ErrorKind::WriteZero))),
            Ok(n) => {
                conn.wbuf.advance(n);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Close::Io(e)),
        }
    }
    Ok(())
}

#[inline]
fn would_block(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

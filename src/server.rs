//! Single-threaded `mio` event loop: accepts client connections on a UNIX
//! socket, frames/deframes the wire protocol, and drives [`dispatch`].
//!
//! Nothing here ever blocks: every socket is non-blocking and the loop polls
//! once per iteration, so no lock is needed anywhere in the store even
//! though requests from many clients are interleaved — everything is
//! serialized by being handled on this one thread, one readable event at a
//! time, per the concurrency model.

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};

use hashbrown::HashMap;
use mio::net::{UnixListener, UnixStream};
use mio::{Events, Interest, Poll, Token};

use crate::dispatch::{DispatchOutcome, Reply, ServerState};
use crate::prelude::*;
use crate::protocol::{FrameHeader, HEADER_SIZE};

const LISTENER_TOKEN: Token = Token(0);
const SIGNAL_TOKEN: Token = Token(1);
const FIRST_CLIENT_TOKEN: usize = 2;

/// Per-connection socket-level state; distinct from [`crate::client::Client`],
/// which tracks request-dispatch bookkeeping rather than raw I/O buffering.
struct Conn {
    stream: UnixStream,
    client_id: u64,
    read_buf: Vec<u8>,
    write_buf: VecDeque<u8>,
    writable_registered: bool,
}

/// Runs the server until a `SHUTDOWN_SERVER` request or a terminating signal
/// is observed, then hands `state` back so the caller can persist final
/// (clean-shutdown) state against the same open devices.
pub fn run(sockname: &Path, mut state: ServerState) -> Result<ServerState> {
    let _ = std::fs::remove_file(sockname);
    let std_listener = StdUnixListener::bind(sockname).map_err(Error::from)?;
    std_listener.set_nonblocking(true).map_err(Error::from)?;
    let mut listener = UnixListener::from_std(std_listener);

    let mut poll = Poll::new().map_err(Error::from)?;
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
        .map_err(Error::from)?;

    let signal_fd = install_signal_pipe()?;
    let mut signal_source = mio::unix::SourceFd(&signal_fd);
    poll.registry()
        .register(&mut signal_source, SIGNAL_TOKEN, Interest::READABLE)
        .map_err(Error::from)?;

    let mut conns: HashMap<Token, Conn> = HashMap::new();
    let mut next_token = FIRST_CLIENT_TOKEN;
    let mut events = Events::with_capacity(128);

    'outer: loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::from(e));
        }

        for event in events.iter() {
            match event.token() {
                LISTENER_TOKEN => {
                    accept_all(&poll, &listener, &mut state, &mut conns, &mut next_token)?;
                }
                SIGNAL_TOKEN => {
                    drain_signal_pipe(signal_fd);
                    info!("shutdown signal received");
                    break 'outer;
                }
                token => {
                    if !service_client(&poll, token, &mut conns, &mut state)? {
                        break 'outer;
                    }
                }
            }
        }
    }

    for (_, conn) in conns.drain() {
        state.on_client_disconnect(conn.client_id);
    }
    let _ = std::fs::remove_file(sockname);
    Ok(state)
}

fn accept_all(
    poll: &Poll,
    listener: &UnixListener,
    state: &mut ServerState,
    conns: &mut HashMap<Token, Conn>,
    next_token: &mut usize,
) -> Result<()> {
    loop {
        match listener.accept() {
            Ok((mut stream, _addr)) => {
                let token = Token(*next_token);
                *next_token += 1;
                poll.registry()
                    .register(&mut stream, token, Interest::READABLE)
                    .map_err(Error::from)?;
                let client_id = state.on_client_connect();
                conns.insert(
                    token,
                    Conn {
                        stream,
                        client_id,
                        read_buf: Vec::new(),
                        write_buf: VecDeque::new(),
                        writable_registered: false,
                    },
                );
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(Error::from(e)),
        }
    }
}

/// Services one readable/writable event for `token`. Returns `false` if the
/// request it handled asked the server to shut down.
fn service_client(
    poll: &Poll,
    token: Token,
    conns: &mut HashMap<Token, Conn>,
    state: &mut ServerState,
) -> Result<bool> {
    let mut outgoing: Vec<Reply> = Vec::new();
    let mut shutdown = false;
    let mut disconnect = false;

    if let Some(conn) = conns.get_mut(&token) {
        let still_open = match read_available(&mut conn.stream, &mut conn.read_buf) {
            Ok(open) => open,
            Err(e) => {
                warn!("client read failed: {e}");
                false
            }
        };
        while let Some((header, body_end)) = try_parse_frame(&conn.read_buf) {
            let body = conn.read_buf[HEADER_SIZE..body_end].to_vec();
            let DispatchOutcome { replies, shutdown: s } = state.dispatch(conn.client_id, header, &body);
            if s {
                shutdown = true;
            }
            outgoing.extend(replies);
            conn.read_buf.drain(0..body_end);
        }
        disconnect = !still_open;
    }

    for reply in outgoing {
        route_reply(conns, reply);
    }

    if disconnect {
        if let Some(mut conn) = conns.remove(&token) {
            let _ = poll.registry().deregister(&mut conn.stream);
            for r in state.on_client_disconnect(conn.client_id) {
                route_reply(conns, r);
            }
        }
    }
    flush_writable(poll, conns);

    Ok(!shutdown)
}

/// Finds whichever connection belongs to `reply.client_id` (not necessarily
/// the connection that triggered the event that produced it — a snaplock
/// release can wake up a different client entirely) and queues the bytes.
fn route_reply(conns: &mut HashMap<Token, Conn>, reply: Reply) {
    let Some(conn) = conns.values_mut().find(|c| c.client_id == reply.client_id) else {
        return;
    };
    conn.write_buf.extend(reply.frame);
}

fn flush_writable(poll: &Poll, conns: &mut HashMap<Token, Conn>) {
    for (token, conn) in conns.iter_mut() {
        if conn.write_buf.is_empty() {
            continue;
        }
        let (head, tail) = conn.write_buf.as_slices();
        let mut buf = Vec::with_capacity(head.len() + tail.len());
        buf.extend_from_slice(head);
        buf.extend_from_slice(tail);
        match conn.stream.write(&buf) {
            Ok(n) => {
                conn.write_buf.drain(0..n);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => {
                warn!("client write failed: {e}");
                continue;
            }
        }
        let needs_writable = !conn.write_buf.is_empty();
        if needs_writable != conn.writable_registered {
            let interest = if needs_writable {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            let _ = poll.registry().reregister(&mut conn.stream, *token, interest);
            conn.writable_registered = needs_writable;
        }
    }
}

/// Reads everything currently available. Returns `Ok(false)` on a clean
/// peer hangup (zero-length read).
fn read_available(stream: &mut UnixStream, buf: &mut Vec<u8>) -> io::Result<bool> {
    let mut chunk = [0u8; 16 * 1024];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => return Ok(false),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(true),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

fn try_parse_frame(buf: &[u8]) -> Option<(FrameHeader, usize)> {
    if buf.len() < HEADER_SIZE {
        return None;
    }
    let header = FrameHeader::decode(buf).ok()?;
    let body_end = HEADER_SIZE + header.length as usize;
    if buf.len() < body_end {
        return None;
    }
    Some((header, body_end))
}

static SIGNAL_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn handle_term_signal(_sig: libc::c_int) {
    let fd = SIGNAL_WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = 1u8;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// Installs `SIGINT`/`SIGTERM` handlers that write a byte to a self-pipe,
/// and registers the read end's fd with the poll loop, so shutdown is an
/// ordinary readable event rather than async-signal-unsafe state mutation.
fn install_signal_pipe() -> Result<i32> {
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(Error::from(io::Error::last_os_error()));
    }
    let (read_fd, write_fd) = (fds[0], fds[1]);
    unsafe {
        set_nonblocking(read_fd);
        set_nonblocking(write_fd);
    }
    SIGNAL_WRITE_FD.store(write_fd, Ordering::Relaxed);
    unsafe {
        libc::signal(libc::SIGINT, handle_term_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_term_signal as libc::sighandler_t);
    }
    Ok(read_fd)
}

unsafe fn set_nonblocking(fd: i32) {
    let flags = libc::fcntl(fd, libc::F_GETFL, 0);
    if flags >= 0 {
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}

fn drain_signal_pipe(fd: i32) {
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_parse_frame_waits_for_full_body() {
        let mut buf = vec![0u8; HEADER_SIZE];
        FrameHeader { code: 1, length: 4 }.encode(&mut buf);
        assert!(try_parse_frame(&buf).is_none());
        buf.extend_from_slice(&[0u8; 4]);
        let (header, end) = try_parse_frame(&buf).unwrap();
        assert_eq!(header.code, 1);
        assert_eq!(end, buf.len());
    }

    #[test]
    fn try_parse_frame_none_on_short_header() {
        assert!(try_parse_frame(&[0u8; 2]).is_none());
    }
}

//! Control-agent handshake: once the listen socket is bound, tells whatever
//! process (if any) is waiting to hand out connections to it that the
//! server is ready.
//!
//! `agent_sockname` follows the usual abstract-namespace convention: an
//! `@`-prefix means the name lives in the abstract namespace (no filesystem
//! entry, first byte of the address is `\0`) rather than naming a path.

use std::io::Write;
use std::mem;
use std::os::unix::io::FromRawFd;
use std::os::unix::net::UnixStream;
use std::path::Path;

use crate::prelude::*;
use crate::protocol::{code, frame, BodyWriter};

/// Connects to `agent_sockname` and sends a `SERVER_READY` frame naming the
/// listen socket's address family and path. A missing agent to report to is
/// not an error: standalone/test invocations simply pass `None`.
pub fn notify_ready(agent_sockname: Option<&str>, listen_sockname: &Path) -> Result<()> {
    let Some(name) = agent_sockname else {
        return Ok(());
    };
    let mut stream = connect(name)?;

    let path = listen_sockname
        .to_str()
        .ok_or_else(|| Error::with_msg(InvalidArgs, "listen socket path is not valid UTF-8"))?;
    let body = BodyWriter::new().u32(libc::AF_UNIX as u32).cstr(path).into_vec();
    stream.write_all(&frame(code::SERVER_READY, &body)).map_err(Error::from)?;
    stream.flush().map_err(Error::from)?;
    Ok(())
}

fn connect(name: &str) -> Result<UnixStream> {
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(Error::from(std::io::Error::last_os_error()));
    }
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let (path_bytes, abstract_name) = match name.strip_prefix('@') {
        Some(rest) => (rest.as_bytes(), true),
        None => (name.as_bytes(), false),
    };
    let max = addr.sun_path.len() - if abstract_name { 1 } else { 1 };
    if path_bytes.len() > max {
        unsafe { libc::close(fd) };
        return_errno_with_msg!(InvalidArgs, "agent socket name too long");
    }

    let sun_path = addr.sun_path.as_mut_ptr() as *mut u8;
    let offset = if abstract_name {
        // Leading NUL marks an abstract-namespace address; sun_path[0]
        // is already zeroed by `mem::zeroed`.
        1
    } else {
        0
    };
    unsafe {
        std::ptr::copy_nonoverlapping(path_bytes.as_ptr(), sun_path.add(offset), path_bytes.len());
    }
    let addr_len = (mem::size_of::<libc::sa_family_t>() + offset + path_bytes.len()) as libc::socklen_t;

    let ret = unsafe {
        libc::connect(
            fd,
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            addr_len,
        )
    };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(Error::from(err));
    }
    Ok(unsafe { UnixStream::from_raw_fd(fd) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_ready_is_a_no_op_with_no_agent() {
        assert!(notify_ready(None, Path::new("/tmp/doesnotmatter")).is_ok());
    }
}

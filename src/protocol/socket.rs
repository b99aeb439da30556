use std::{
    io,
    net::TcpStream,
    os::{
        fd::{AsRawFd, RawFd},
        unix::net::UnixStream,
    },
    time::Duration,
};

/// Blocking behaviour of a single `recv` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvMode {
    NonBlocking,
    Blocking,
}

/// Read side of a worker socket.
///
/// The mode is chosen per call (`MSG_DONTWAIT`) instead of through `O_NONBLOCK`, because the
/// file status flags are shared with every cloned descriptor, including the one used for writes.
pub trait CommandSocket {
    /// Reads into `buf`. A non-blocking read with no data fails with
    /// [`io::ErrorKind::WouldBlock`]; `Ok(0)` is end of stream.
    fn recv(&mut self, buf: &mut [u8], mode: RecvMode) -> io::Result<usize>;

    /// Waits up to `timeout` for the socket to become readable (or closed).
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool>;
}

impl CommandSocket for TcpStream {
    fn recv(&mut self, buf: &mut [u8], mode: RecvMode) -> io::Result<usize> {
        recv_fd(self.as_raw_fd(), buf, mode)
    }

    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        poll_readable(self.as_raw_fd(), timeout)
    }
}

impl CommandSocket for UnixStream {
    fn recv(&mut self, buf: &mut [u8], mode: RecvMode) -> io::Result<usize> {
        recv_fd(self.as_raw_fd(), buf, mode)
    }

    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        poll_readable(self.as_raw_fd(), timeout)
    }
}

fn recv_fd(fd: RawFd, buf: &mut [u8], mode: RecvMode) -> io::Result<usize> {
    let flags = match mode {
        RecvMode::NonBlocking => libc::MSG_DONTWAIT,
        RecvMode::Blocking => 0,
    };
    // SAFETY: `buf` is a valid, exclusively borrowed region of `buf.len()` bytes.
    let ret = unsafe { libc::recv(fd, buf.as_mut_ptr().cast::<libc::c_void>(), buf.len(), flags) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

fn poll_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    // SAFETY: `pfd` is a single valid pollfd for the duration of the call.
    let ret = unsafe { libc::poll(&mut pfd, 1, millis) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret > 0)
    }
}

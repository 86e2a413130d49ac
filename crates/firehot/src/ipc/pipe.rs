//! Close-on-exec pipes and line splitting over raw descriptors.
//!
//! Every descriptor created here carries `FD_CLOEXEC`, so programs that a
//! worker's callable spawns never inherit the controller's plumbing.

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, fcntl};

use super::multiplex::StreamKind;

/// An owned pipe end that implements Read/Write with EINTR handling.
#[derive(Debug)]
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PipeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::write(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Create a pipe whose ends are both close-on-exec. Returns `(read, write)`.
pub fn cloexec_pipe() -> io::Result<(PipeFd, PipeFd)> {
    let (read, write) = raw_pipe().map_err(errno_to_io)?;
    Ok((PipeFd::new(read), PipeFd::new(write)))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn raw_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn raw_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    use nix::fcntl::FdFlag;

    let (read, write) = nix::unistd::pipe()?;
    for fd in [&read, &write] {
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    }
    Ok((read, write))
}

/// Duplicate `fd` onto a fresh close-on-exec descriptor.
pub fn dup_cloexec<Fd: AsFd>(fd: Fd) -> io::Result<OwnedFd> {
    let raw = fcntl(fd, FcntlArg::F_DUPFD_CLOEXEC(0)).map_err(errno_to_io)?;
    // SAFETY: F_DUPFD_CLOEXEC returned a new descriptor nobody else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// Point fd 1 or fd 2 at `fd`. The standard descriptor is not close-on-exec.
pub fn replace_stdio<Fd: AsFd>(stream: StreamKind, fd: Fd) -> io::Result<()> {
    match stream {
        StreamKind::Stdout => nix::unistd::dup2_stdout(fd),
        StreamKind::Stderr => nix::unistd::dup2_stderr(fd),
    }
    .map_err(errno_to_io)
}

fn errno_to_io(errno: Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}

/// Accumulates bytes and hands out complete lines.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Next complete line, without its newline.
    pub fn next_line(&mut self) -> Option<Vec<u8>> {
        let end = self.pending.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=end).collect();
        line.pop();
        Some(line)
    }

    /// Trailing partial line, if any.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        (!self.pending.is_empty()).then(|| std::mem::take(&mut self.pending))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::FdFlag;

    fn is_cloexec<Fd: AsFd>(fd: Fd) -> bool {
        let flags = fcntl(fd, FcntlArg::F_GETFD).unwrap();
        FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC)
    }

    #[test]
    fn test_pipe_ends_are_cloexec() {
        let (read, write) = cloexec_pipe().unwrap();
        assert!(is_cloexec(&read));
        assert!(is_cloexec(&write));

        let copy = dup_cloexec(&write).unwrap();
        assert!(is_cloexec(&copy));
        assert_ne!(copy.as_raw_fd(), write.as_raw_fd());
    }

    #[test]
    fn test_pipe_roundtrip_and_eof() {
        let (mut read, mut write) = cloexec_pipe().unwrap();
        write.write_all(b"hello\n").unwrap();
        drop(write);

        let mut text = String::new();
        read.read_to_string(&mut text).unwrap();
        assert_eq!(text, "hello\n");
    }

    #[test]
    fn test_splitter_holds_partial_lines() {
        let mut splitter = LineSplitter::default();
        let text = |line: Vec<u8>| String::from_utf8(line).unwrap();

        splitter.push(b"one\ntw");
        assert_eq!(splitter.next_line().map(text).as_deref(), Some("one"));
        assert_eq!(splitter.next_line(), None);

        splitter.push(b"o\n\nthree");
        assert_eq!(splitter.next_line().map(text).as_deref(), Some("two"));
        assert_eq!(splitter.next_line().map(text).as_deref(), Some(""));
        assert_eq!(splitter.next_line(), None);

        assert_eq!(splitter.finish().map(text).as_deref(), Some("three"));
        assert_eq!(splitter.finish(), None);
    }
}

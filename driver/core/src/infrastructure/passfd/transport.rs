// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Descriptor passing over Unix domain sockets.
//!
//! [`FdChannel`] is the narrow seam the broker protocol is written against;
//! [`ScmRightsChannel`] implements it with `sendmsg`/`recvmsg` and
//! `SCM_RIGHTS` control messages.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::ptr;

/// Largest payload accepted in one message.
const MAX_PAYLOAD: usize = 4096;

/// One end of a descriptor-passing connection.
pub trait FdChannel: Send {
    /// Send `payload` with `fds` attached. The caller keeps ownership of `fds`.
    fn send_fds(&mut self, payload: &[u8], fds: &[RawFd]) -> io::Result<()>;

    /// Receive one message carrying at most `max_fds` descriptors.
    fn recv_fds(&mut self, max_fds: usize) -> io::Result<(Vec<u8>, Vec<OwnedFd>)>;
}

pub struct ScmRightsChannel {
    stream: UnixStream,
}

impl ScmRightsChannel {
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    pub fn connect(path: impl AsRef<std::path::Path>) -> io::Result<Self> {
        Ok(Self::new(UnixStream::connect(path)?))
    }

    pub fn set_read_timeout(&self, timeout: Option<std::time::Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }
}

/// cmsghdr-aligned buffer large enough for `n` descriptors.
fn control_buffer(n: usize) -> (Vec<u64>, usize) {
    // SAFETY: CMSG_SPACE only does arithmetic on its argument.
    let space = unsafe { libc::CMSG_SPACE((n * mem::size_of::<RawFd>()) as libc::c_uint) } as usize;
    (vec![0u64; space.div_ceil(mem::size_of::<u64>())], space)
}

impl FdChannel for ScmRightsChannel {
    fn send_fds(&mut self, payload: &[u8], fds: &[RawFd]) -> io::Result<()> {
        if payload.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "stream sockets need a non-empty payload to carry descriptors",
            ));
        }
        let mut iov = libc::iovec {
            iov_base: payload.as_ptr() as *mut libc::c_void,
            iov_len: payload.len(),
        };
        let (mut control, space) = control_buffer(fds.len());

        // SAFETY: msghdr is plain old data; every pointer stored in it refers
        // to a buffer that outlives the sendmsg call.
        let sent = unsafe {
            let mut msg: libc::msghdr = mem::zeroed();
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1;
            if !fds.is_empty() {
                msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
                msg.msg_controllen = space as _;
                let cmsg = libc::CMSG_FIRSTHDR(&msg);
                if cmsg.is_null() {
                    return Err(io::Error::other("control buffer too small"));
                }
                (*cmsg).cmsg_level = libc::SOL_SOCKET;
                (*cmsg).cmsg_type = libc::SCM_RIGHTS;
                (*cmsg).cmsg_len = libc::CMSG_LEN((fds.len() * mem::size_of::<RawFd>()) as libc::c_uint) as _;
                ptr::copy_nonoverlapping(fds.as_ptr(), libc::CMSG_DATA(cmsg) as *mut RawFd, fds.len());
            }
            libc::sendmsg(self.stream.as_raw_fd(), &msg, libc::MSG_NOSIGNAL)
        };
        if sent < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn recv_fds(&mut self, max_fds: usize) -> io::Result<(Vec<u8>, Vec<OwnedFd>)> {
        let mut buf = vec![0u8; MAX_PAYLOAD];
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let (mut control, space) = control_buffer(max_fds.max(1));
        let mut fds = Vec::new();

        // SAFETY: as in send_fds; every descriptor taken out of the control
        // message is owned by this process after a successful recvmsg.
        let (received, flags) = unsafe {
            let mut msg: libc::msghdr = mem::zeroed();
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1;
            msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = space as _;

            let n = libc::recvmsg(self.stream.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC);
            if n < 0 {
                return Err(io::Error::last_os_error());
            }

            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                    let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                    let header = libc::CMSG_LEN(0) as usize;
                    let count = ((*cmsg).cmsg_len as usize).saturating_sub(header) / mem::size_of::<RawFd>();
                    for i in 0..count {
                        fds.push(OwnedFd::from_raw_fd(ptr::read_unaligned(data.add(i))));
                    }
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
            (n as usize, msg.msg_flags)
        };

        if flags & libc::MSG_CTRUNC != 0 {
            // descriptors beyond the buffer were closed by the kernel
            tracing::warn!("control message truncated, received {} descriptors", fds.len());
        }
        if received == 0 && fds.is_empty() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed the connection"));
        }
        buf.truncate(received);
        Ok((buf, fds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Seek, SeekFrom, Write};

    #[test]
    fn test_descriptor_crosses_socketpair() {
        let (a, b) = UnixStream::pair().expect("socketpair");
        let mut left = ScmRightsChannel::new(a);
        let mut right = ScmRightsChannel::new(b);

        let mut file = tempfile::tempfile().expect("tempfile");
        file.write_all(b"fuse").expect("write");

        left.send_fds(b"FUSE", &[file.as_raw_fd()]).expect("send");
        let (payload, fds) = right.recv_fds(2).expect("recv");
        assert_eq!(payload, b"FUSE");
        assert_eq!(fds.len(), 1);

        // the received descriptor refers to the same open file description
        let mut received = File::from(fds.into_iter().next().expect("one fd"));
        received.seek(SeekFrom::Start(0)).expect("seek");
        let mut content = String::new();
        received.read_to_string(&mut content).expect("read");
        assert_eq!(content, "fuse");
    }

    #[test]
    fn test_payload_without_descriptors() {
        let (a, b) = UnixStream::pair().expect("socketpair");
        let mut left = ScmRightsChannel::new(a);
        let mut right = ScmRightsChannel::new(b);
        left.send_fds(b"CLOSE", &[]).expect("send");
        let (payload, fds) = right.recv_fds(1).expect("recv");
        assert_eq!(payload, b"CLOSE");
        assert!(fds.is_empty());
    }

    #[test]
    fn test_closed_peer_is_eof() {
        let (a, b) = UnixStream::pair().expect("socketpair");
        drop(a);
        let mut right = ScmRightsChannel::new(b);
        let err = right.recv_fds(1).expect_err("eof");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}

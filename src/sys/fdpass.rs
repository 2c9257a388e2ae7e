//! Ancillary-data (`SCM_RIGHTS`) fd passing and local-domain peer credentials.
//!
//! Not present in the retrieved `queen-io` slice; grounded directly in
//! `spec.md` §4.6/§6 (`queue_send_fd`/`queue_receive_fd`, `fd_get_auth_creds`)
//! using the same `syscall!`-wrapped `libc` style as `sys::socket`.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;

use libc::{self, c_void, msghdr, MSG_NOSIGNAL};

/// Send one open fd as ancillary data over a connected `AF_UNIX` socket.
/// A single zero byte of ordinary payload is sent alongside it, since some
/// platforms refuse a `sendmsg` with no data at all.
pub fn send_fd(sock: RawFd, fd: RawFd) -> io::Result<()> {
    let mut payload = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr() as *mut c_void,
        iov_len: payload.len(),
    };

    let mut cmsg_buf = [0u8; cmsg_space(mem::size_of::<RawFd>())];

    let mut msg: msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut c_void;
    msg.msg_controllen = cmsg_buf.len() as _;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
        std::ptr::write(libc::CMSG_DATA(cmsg) as *mut RawFd, fd);
        msg.msg_controllen = libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) as _;
    }

    loop {
        let ret = unsafe { libc::sendmsg(sock, &msg, MSG_NOSIGNAL) };
        if ret >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Receive one fd sent via [`send_fd`]. Returns `Ok(None)` on a clean EOF.
pub fn recv_fd(sock: RawFd) -> io::Result<Option<RawFd>> {
    let mut payload = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr() as *mut c_void,
        iov_len: payload.len(),
    };

    let mut cmsg_buf = [0u8; cmsg_space(mem::size_of::<RawFd>())];

    let mut msg: msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut c_void;
    msg.msg_controllen = cmsg_buf.len() as _;

    let n = loop {
        let ret = unsafe { libc::recvmsg(sock, &mut msg, 0) };
        if ret >= 0 {
            break ret;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    };

    if n == 0 {
        return Ok(None);
    }

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return Ok(None);
        }
        if (*cmsg).cmsg_level != libc::SOL_SOCKET || (*cmsg).cmsg_type != libc::SCM_RIGHTS {
            return Ok(None);
        }
        let fd = std::ptr::read(libc::CMSG_DATA(cmsg) as *const RawFd);
        Ok(Some(fd))
    }
}

/// Peer credentials of a connected `AF_UNIX` socket (`SO_PEERCRED` on Linux).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCred {
    pub pid: libc::pid_t,
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
}

#[cfg(target_os = "linux")]
pub fn peer_cred(sock: RawFd) -> io::Result<PeerCred> {
    let mut cred: libc::ucred = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::ucred>() as libc::socklen_t;

    let rc = unsafe {
        libc::getsockopt(
            sock,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut _ as *mut c_void,
            &mut len,
        )
    };

    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(PeerCred {
        pid: cred.pid,
        uid: cred.uid,
        gid: cred.gid,
    })
}

#[cfg(not(target_os = "linux"))]
pub fn peer_cred(_sock: RawFd) -> io::Result<PeerCred> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "peer credentials are not implemented on this platform",
    ))
}

/// `libc::CMSG_SPACE` is not `const fn`; this mirrors its definition
/// (alignment to `size_t`, plus the cmsghdr header) so the control buffer
/// can be a fixed-size stack array.
const fn cmsg_space(len: usize) -> usize {
    let align = mem::align_of::<libc::cmsghdr>();
    let hdr = mem::size_of::<libc::cmsghdr>();
    let aligned_len = (len + align - 1) & !(align - 1);
    hdr + aligned_len
}

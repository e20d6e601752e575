//! The parent/child message channel.
//!
//! A [`Channel`] is one end of a bidirectional unix stream socket carrying
//! framed messages, each of which may bring along at most one OS handle.
//! Frames are a 4-byte little-endian length prefix followed by the message
//! body; the handle rides the first `sendmsg` of a frame as `SCM_RIGHTS`
//! ancillary data, and the receive loop adopts whatever descriptor arrives
//! while the frame is being assembled.
//!
//! Sends are serialized behind a lock so frames from concurrent tasks never
//! interleave on the wire. Reads are expected from a single reader task per
//! channel and are serialized the same way.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use socket2::{Domain, Socket, Type};
use tokio::io::Interest;
use tokio::net::UnixStream;
use tokio::sync::Mutex;

use hive_core::{HiveError, Result};

/// Upper bound on a single frame body. Internal messages are small; user
/// payloads beyond this are a protocol misuse, not a transport concern.
pub const MAX_FRAME_SIZE: usize = 1 << 20;

/// One received message: the body plus the handle that rode along with it.
#[derive(Debug)]
pub struct Frame {
    pub payload: Vec<u8>,
    pub handle: Option<OwnedFd>,
}

/// One end of the duplex message+handle channel.
#[derive(Debug)]
pub struct Channel {
    stream: UnixStream,
    send_lock: Mutex<()>,
    recv_lock: Mutex<()>,
    connected: AtomicBool,
}

impl Channel {
    /// Wrap an already-connected unix stream socket.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(stream: std::os::unix::net::UnixStream) -> Result<Self> {
        stream
            .set_nonblocking(true)
            .map_err(|e| HiveError::channel("configure", e))?;
        let stream = UnixStream::from_std(stream).map_err(|e| HiveError::channel("register", e))?;
        Ok(Self {
            stream,
            send_lock: Mutex::new(()),
            recv_lock: Mutex::new(()),
            connected: AtomicBool::new(true),
        })
    }

    /// Create a connected pair of channels. Used by tests and in-process
    /// wiring; spawning uses [`Channel::socketpair`] instead.
    pub fn pair() -> Result<(Channel, Channel)> {
        let (a, b) = Socket::pair(Domain::UNIX, Type::STREAM, None)
            .map_err(|e| HiveError::channel("socketpair", e))?;
        Ok((
            Self::new(std::os::unix::net::UnixStream::from(OwnedFd::from(a)))?,
            Self::new(std::os::unix::net::UnixStream::from(OwnedFd::from(b)))?,
        ))
    }

    /// Create the channel for a child about to be spawned: the local end,
    /// plus the peer end as a bare descriptor for the child to inherit.
    pub fn socketpair() -> Result<(Channel, OwnedFd)> {
        let (local, peer) = Socket::pair(Domain::UNIX, Type::STREAM, None)
            .map_err(|e| HiveError::channel("socketpair", e))?;
        let local = Self::new(std::os::unix::net::UnixStream::from(OwnedFd::from(local)))?;
        Ok((local, OwnedFd::from(peer)))
    }

    /// Adopt an inherited descriptor as this process's channel end.
    pub fn from_fd(fd: OwnedFd) -> Result<Self> {
        Self::new(std::os::unix::net::UnixStream::from(fd))
    }

    /// Returns true until the channel is closed or a peer hangup is seen.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Close the channel in both directions.
    ///
    /// Shutting down reads as well as writes makes a reader parked on the
    /// other side of this same process observe EOF immediately, which is how
    /// channel teardown propagates to the dispatch loop.
    pub fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            // SAFETY: shutdown(2) on a descriptor we own; no aliasing concerns.
            unsafe {
                libc::shutdown(self.stream.as_raw_fd(), libc::SHUT_RDWR);
            }
        }
    }

    fn mark_closed(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Send one frame, optionally attaching an OS handle.
    pub async fn send(&self, payload: &[u8], handle: Option<BorrowedFd<'_>>) -> Result<()> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(HiveError::frame(format!(
                "frame of {} bytes exceeds limit",
                payload.len()
            )));
        }
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);

        let _guard = self.send_lock.lock().await;
        if !self.is_connected() {
            return Err(HiveError::ChannelClosed);
        }
        let raw = self.stream.as_raw_fd();
        let mut pass = handle.map(|h| h.as_raw_fd());
        let mut sent = 0;
        while sent < frame.len() {
            let res = self
                .stream
                .async_io(Interest::WRITABLE, || try_send(raw, &frame[sent..], pass))
                .await;
            match res {
                Ok(n) => {
                    // The handle travels with the first chunk only.
                    pass = None;
                    sent += n;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.mark_closed();
                    return Err(map_socket_error("send", e));
                }
            }
        }
        Ok(())
    }

    /// Receive the next frame. Returns `None` on clean end-of-stream.
    pub async fn recv(&self) -> Result<Option<Frame>> {
        let _guard = self.recv_lock.lock().await;
        let mut handles = Vec::new();

        let mut len_buf = [0u8; 4];
        if !self.recv_exact(&mut len_buf, &mut handles).await? {
            self.mark_closed();
            return Ok(None);
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len == 0 || len > MAX_FRAME_SIZE {
            self.mark_closed();
            return Err(HiveError::frame(format!("invalid frame length {len}")));
        }

        let mut payload = vec![0u8; len];
        if !self.recv_exact(&mut payload, &mut handles).await? {
            self.mark_closed();
            return Err(HiveError::frame("channel closed mid-frame"));
        }
        if handles.len() > 1 {
            return Err(HiveError::frame("more than one handle attached to a frame"));
        }
        Ok(Some(Frame {
            payload,
            handle: handles.pop(),
        }))
    }

    /// Fill `buf` completely, adopting any descriptors seen along the way.
    /// Returns false on EOF before the first byte.
    async fn recv_exact(&self, buf: &mut [u8], handles: &mut Vec<OwnedFd>) -> Result<bool> {
        let raw = self.stream.as_raw_fd();
        let mut read = 0;
        while read < buf.len() {
            let res = self
                .stream
                .async_io(Interest::READABLE, || {
                    try_recv(raw, &mut buf[read..], handles)
                })
                .await;
            let n = match res {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.mark_closed();
                    return Err(map_socket_error("recv", e));
                }
            };
            if n == 0 {
                if read != 0 {
                    self.mark_closed();
                    return Err(HiveError::frame("channel closed mid-frame"));
                }
                return Ok(false);
            }
            read += n;
        }
        Ok(true)
    }
}

/// Errors that mean the peer is simply gone collapse to `ChannelClosed`.
fn map_socket_error(operation: &'static str, e: io::Error) -> HiveError {
    match e.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::NotConnected => HiveError::ChannelClosed,
        _ => HiveError::channel(operation, e),
    }
}

/// Ancillary buffer sized for exactly one descriptor. The transport contract
/// is one handle per message, so anything larger is rejected at receive.
#[repr(C)]
struct CmsgScmRights {
    hdr: libc::cmsghdr,
    fds: [RawFd; 1],
}

// x86_64-unknown-linux-musl targets have a different type defn for
// `libc::cmsghdr`, hence the suppressed lints and `as _` casts.
#[allow(clippy::needless_update, clippy::useless_conversion)]
fn try_send(socket: RawFd, buf: &[u8], pass: Option<RawFd>) -> io::Result<usize> {
    let iov = [IoSlice::new(buf)];
    let mut cmsg = CmsgScmRights {
        hdr: libc::cmsghdr {
            cmsg_level: libc::SOL_SOCKET,
            cmsg_type: libc::SCM_RIGHTS,
            cmsg_len: (size_of::<libc::cmsghdr>() + size_of::<RawFd>())
                .try_into()
                .unwrap(),
            ..{
                // SAFETY: type has no invariants
                unsafe { std::mem::zeroed() }
            }
        },
        fds: [pass.unwrap_or(-1); 1],
    };

    // SAFETY: type has no invariants
    let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
    hdr.msg_iov = iov.as_ptr() as *mut libc::iovec;
    hdr.msg_iovlen = iov.len().try_into().unwrap();
    if pass.is_some() {
        hdr.msg_control = std::ptr::from_mut(&mut cmsg).cast::<libc::c_void>();
        hdr.msg_controllen = cmsg.hdr.cmsg_len;
    }

    #[cfg(target_os = "linux")]
    let flags = libc::MSG_NOSIGNAL;
    #[cfg(not(target_os = "linux"))]
    let flags = 0;

    // SAFETY: calling with appropriately initialized buffers.
    let n = unsafe { libc::sendmsg(socket, &hdr, flags) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

fn try_recv(socket: RawFd, buf: &mut [u8], handles: &mut Vec<OwnedFd>) -> io::Result<usize> {
    let mut iov = IoSliceMut::new(buf);
    // SAFETY: type has no invariants
    let mut cmsg: CmsgScmRights = unsafe { std::mem::zeroed() };
    // SAFETY: type has no invariants
    let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
    hdr.msg_iov = std::ptr::from_mut(&mut iov).cast::<libc::iovec>();
    hdr.msg_iovlen = 1;
    hdr.msg_control = std::ptr::from_mut(&mut cmsg).cast::<libc::c_void>();
    hdr.msg_controllen = size_of::<CmsgScmRights>() as _;

    // Automatically set O_CLOEXEC on incoming descriptors.
    #[cfg(target_os = "linux")]
    let flags = libc::MSG_CMSG_CLOEXEC;
    #[cfg(not(target_os = "linux"))]
    let flags = 0;

    // SAFETY: calling with properly initialized buffers.
    let n = unsafe { libc::recvmsg(socket, &mut hdr, flags) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    if n == 0 {
        return Ok(0);
    }

    if hdr.msg_controllen > 0 {
        if cmsg.hdr.cmsg_level != libc::SOL_SOCKET || cmsg.hdr.cmsg_type != libc::SCM_RIGHTS {
            return Err(io::ErrorKind::InvalidData.into());
        }
        #[allow(clippy::unnecessary_cast)] // cmsg_len is u32 on musl and usize on gnu.
        let count = (cmsg.hdr.cmsg_len as usize - size_of::<libc::cmsghdr>()) / size_of::<RawFd>();
        for fd in &cmsg.fds[..count] {
            // SAFETY: according to the contract with the kernel, this
            // descriptor is now owned by the process.
            handles.push(unsafe { OwnedFd::from_raw_fd(*fd) });
        }
    }

    // Check for truncation only after taking ownership of the descriptors.
    if hdr.msg_flags & (libc::MSG_TRUNC | libc::MSG_CTRUNC) != 0 {
        return Err(io::Error::from_raw_os_error(libc::EMSGSIZE));
    }
    Ok(n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;

    #[tokio::test]
    async fn test_round_trip() {
        let (a, b) = Channel::pair().unwrap();
        a.send(b"hello", None).await.unwrap();
        let frame = b.recv().await.unwrap().unwrap();
        assert_eq!(frame.payload, b"hello");
        assert!(frame.handle.is_none());
    }

    #[tokio::test]
    async fn test_large_frame() {
        let (a, b) = Channel::pair().unwrap();
        let payload = vec![0xa5u8; 300_000];
        let expected = payload.clone();
        let writer = tokio::spawn(async move { a.send(&payload, None).await });
        let frame = b.recv().await.unwrap().unwrap();
        writer.await.unwrap().unwrap();
        assert_eq!(frame.payload, expected);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (a, _b) = Channel::pair().unwrap();
        let payload = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(a.send(&payload, None).await.is_err());
    }

    #[tokio::test]
    async fn test_eof_on_peer_drop() {
        let (a, b) = Channel::pair().unwrap();
        drop(a);
        assert!(b.recv().await.unwrap().is_none());
        assert!(!b.is_connected());
    }

    #[tokio::test]
    async fn test_close_wakes_reader() {
        let (a, _b) = Channel::pair().unwrap();
        let a = std::sync::Arc::new(a);
        let reader = {
            let a = a.clone();
            tokio::spawn(async move { a.recv().await })
        };
        tokio::task::yield_now().await;
        a.close();
        assert!(reader.await.unwrap().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_handle_transfer() {
        let (a, b) = Channel::pair().unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        a.send(b"take this", Some(listener.as_fd())).await.unwrap();
        let frame = b.recv().await.unwrap().unwrap();
        assert_eq!(frame.payload, b"take this");

        // The received descriptor refers to the same listening socket.
        let received = std::net::TcpListener::from(frame.handle.unwrap());
        assert_eq!(received.local_addr().unwrap(), addr);

        // And accept on it actually works.
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (accepted, _) = received.accept().unwrap();
        assert_eq!(
            accepted.local_addr().unwrap(),
            client.peer_addr().unwrap()
        );
    }

    #[tokio::test]
    async fn test_concurrent_sends_stay_framed() {
        let (a, b) = Channel::pair().unwrap();
        let a = std::sync::Arc::new(a);
        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let a = a.clone();
            tasks.push(tokio::spawn(async move {
                let payload = vec![i; 10_000];
                a.send(&payload, None).await
            }));
        }
        let mut seen = Vec::new();
        for _ in 0..8 {
            let frame = b.recv().await.unwrap().unwrap();
            assert_eq!(frame.payload.len(), 10_000);
            let first = frame.payload[0];
            assert!(frame.payload.iter().all(|&x| x == first));
            seen.push(first);
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
    }
}

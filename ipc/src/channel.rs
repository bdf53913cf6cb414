use crate::errno;
use crate::error::IpcError;
use crate::handle::Handle;
use libc::{c_int, c_void};
use log::trace;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};

/// One descriptor per standard stream of a job.
pub const MAX_HANDLES_PER_MESSAGE: usize = 3;

/// Frames announcing a longer payload are treated as corrupted.
pub const MAX_FRAME_LEN: usize = 1 << 30;

const FRAME_HEADER_LEN: usize = core::mem::size_of::<u32>();

// This call is just a C arithmetic macro translated into rust, in practice it's safe (at least in this libc release)
const CMSG_BUFFER_LEN: usize = unsafe {
    libc::CMSG_SPACE((MAX_HANDLES_PER_MESSAGE * core::mem::size_of::<c_int>()) as u32)
} as usize;

// cmsghdr structures must be properly aligned for CMSG_FIRSTHDR() and friends
#[repr(C, align(8))]
struct AncillaryBuffer([u8; CMSG_BUFFER_LEN]);

/// Persistent, synchronous control channel.
///
/// Each message is a 4-byte little-endian length followed by a `postcard` payload.
/// Handles are attached to the first `sendmsg()` of their frame, so the receiver
/// gets them when reading that frame's header.
#[derive(Debug)]
pub struct IpcChannel {
    fd: Handle,
}

impl IpcChannel {
    pub fn new() -> Result<(Self, Self), IpcError> {
        // Safety: we must not return in the middle of this block. The file
        // descriptors are owned by this block and this block only.
        // If socketpair() fails, no file descriptors are returned, so no
        // resource is leaked.
        let (fd0, fd1) = unsafe {
            let mut socks: [c_int; 2] = [-1, -1];
            let res = libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
                0,
                socks.as_mut_ptr(),
            );
            if res < 0 {
                return Err(IpcError::InternalOsOperationFailed {
                    os_code: errno(),
                    description: "socketpair() failed",
                });
            }
            (
                Handle::from_raw(socks[0] as u64)?,
                Handle::from_raw(socks[1] as u64)?,
            )
        };
        Ok((Self { fd: fd0 }, Self { fd: fd1 }))
    }

    pub fn into_handle(self) -> Handle {
        self.fd
    }

    pub fn from_handle(handle: Handle) -> Self {
        Self { fd: handle }
    }

    pub fn send<T: Serialize>(
        &mut self,
        msg: &T,
        handles: &[BorrowedFd<'_>],
    ) -> Result<(), IpcError> {
        if handles.len() > MAX_HANDLES_PER_MESSAGE {
            return Err(IpcError::TooManyHandles {
                count: handles.len(),
                max: MAX_HANDLES_PER_MESSAGE,
            });
        }
        let payload = serialize(msg)?;
        if payload.len() > MAX_FRAME_LEN {
            return Err(IpcError::PayloadTooBigToTransmit { len: payload.len() });
        }
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        let sent = self.send_with_handles(&frame, handles)?;
        self.send_all(&frame[sent..])?;
        trace!(
            "Sent frame of {} bytes with {} handle(s)",
            frame.len(),
            handles.len()
        );
        Ok(())
    }

    /// Returns `Ok(None)` if the peer closed the channel between two messages.
    pub fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<(T, Vec<Handle>)>, IpcError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let (read_bytes, handles) = self.recv_with_handles(&mut header)?;
        if read_bytes == 0 {
            return Ok(None);
        }
        // All error conditions below will implicitly close any handle received
        self.recv_exact(&mut header[read_bytes..])?;
        let len = u32::from_le_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(IpcError::PayloadTooBigToTransmit { len });
        }
        let mut payload = vec![0u8; len];
        self.recv_exact(&mut payload)?;
        let msg = deserialize(&payload)?;
        trace!(
            "Received frame of {} bytes with {} handle(s)",
            FRAME_HEADER_LEN + len,
            handles.len()
        );
        Ok(Some((msg, handles)))
    }

    fn send_with_handles(
        &self,
        bytes: &[u8],
        handles: &[BorrowedFd<'_>],
    ) -> Result<usize, IpcError> {
        let msg_iovec = libc::iovec {
            // mut is not used here, just required because iovec is used by recvmsg too
            iov_base: bytes.as_ptr() as *mut c_void,
            iov_len: bytes.len(),
        };
        let mut cbuf = AncillaryBuffer([0u8; CMSG_BUFFER_LEN]);
        let cmsg_payload_len = (handles.len() * core::mem::size_of::<c_int>()) as u32;
        // Safety: an all-zero msghdr is valid (no name, no iovec, no control data)
        let mut msg: libc::msghdr = unsafe { core::mem::zeroed() };
        msg.msg_iov = &msg_iovec as *const libc::iovec as *mut libc::iovec;
        msg.msg_iovlen = 1;
        if !handles.is_empty() {
            msg.msg_control = cbuf.0.as_mut_ptr() as *mut c_void;
            msg.msg_controllen = unsafe { libc::CMSG_SPACE(cmsg_payload_len) } as _;
            // Safety: the control buffer is aligned and large enough for
            // MAX_HANDLES_PER_MESSAGE descriptors, which was checked by our caller.
            // Descriptor values are written unaligned since CMSG_DATA() gives no
            // alignment guarantee.
            unsafe {
                let cmsghdr = libc::CMSG_FIRSTHDR(&msg as *const libc::msghdr);
                (*cmsghdr).cmsg_level = libc::SOL_SOCKET;
                (*cmsghdr).cmsg_type = libc::SCM_RIGHTS;
                (*cmsghdr).cmsg_len = libc::CMSG_LEN(cmsg_payload_len) as _;
                let data = libc::CMSG_DATA(cmsghdr) as *mut c_int;
                for (i, handle) in handles.iter().enumerate() {
                    core::ptr::write_unaligned(data.add(i), handle.as_raw_fd());
                }
            }
        }
        loop {
            // Safety: pointers in the iovec{} and msghdr{} point to buffers which
            // outlive this call
            let res = unsafe {
                libc::sendmsg(
                    self.fd.as_raw(),
                    &msg as *const libc::msghdr,
                    libc::MSG_NOSIGNAL,
                )
            };
            if res >= 0 {
                return Ok(res as usize);
            }
            let os_code = errno();
            if os_code != libc::EINTR as u64 {
                return Err(IpcError::InternalOsOperationFailed {
                    os_code,
                    description: "sendmsg() failed",
                });
            }
        }
    }

    fn send_all(&self, mut bytes: &[u8]) -> Result<(), IpcError> {
        while !bytes.is_empty() {
            let res = unsafe {
                libc::send(
                    self.fd.as_raw(),
                    bytes.as_ptr() as *const c_void,
                    bytes.len(),
                    libc::MSG_NOSIGNAL,
                )
            };
            if res < 0 {
                let os_code = errno();
                if os_code == libc::EINTR as u64 {
                    continue;
                }
                return Err(IpcError::InternalOsOperationFailed {
                    os_code,
                    description: "send() failed",
                });
            }
            bytes = &bytes[res as usize..];
        }
        Ok(())
    }

    fn recv_with_handles(&self, buffer: &mut [u8]) -> Result<(usize, Vec<Handle>), IpcError> {
        let msg_iovec = libc::iovec {
            iov_base: buffer.as_mut_ptr() as *mut c_void,
            iov_len: buffer.len(),
        };
        let mut cbuf = AncillaryBuffer([0u8; CMSG_BUFFER_LEN]);
        // Safety: an all-zero msghdr is valid (no name, no iovec, no control data)
        let mut msg: libc::msghdr = unsafe { core::mem::zeroed() };
        msg.msg_iov = &msg_iovec as *const libc::iovec as *mut libc::iovec;
        msg.msg_iovlen = 1;
        msg.msg_control = cbuf.0.as_mut_ptr() as *mut c_void;
        msg.msg_controllen = CMSG_BUFFER_LEN as _;
        let read_bytes = loop {
            // Safety: pointers in the iovec{} must point to valid buffers of the indicated length
            // up until the recvmsg() call. If recvmsg() fails altogether, no file descriptor
            // can have been received and leaked.
            let res = unsafe {
                libc::recvmsg(
                    self.fd.as_raw(),
                    &mut msg as *mut libc::msghdr,
                    libc::MSG_CMSG_CLOEXEC | libc::MSG_WAITALL,
                )
            };
            if res >= 0 {
                break res as usize;
            }
            let os_code = errno();
            if os_code != libc::EINTR as u64 {
                return Err(IpcError::InternalOsOperationFailed {
                    os_code,
                    description: "recvmsg() failed",
                });
            }
        };
        // Take ownership of every descriptor before looking for errors, so that
        // none can leak on an early return. Received cmsg header and payload pointers
        // must not be dereferenced directly: they may not be aligned.
        let mut handles = Vec::new();
        let mut unexpected = None;
        unsafe {
            let mut cmsghdr = libc::CMSG_FIRSTHDR(&msg as *const libc::msghdr);
            while !cmsghdr.is_null() {
                let hdr: libc::cmsghdr = core::ptr::read_unaligned(cmsghdr);
                if (hdr.cmsg_level, hdr.cmsg_type) != (libc::SOL_SOCKET, libc::SCM_RIGHTS) {
                    unexpected = Some(IpcError::UnexpectedAncillaryData {
                        level: hdr.cmsg_level,
                        kind: hdr.cmsg_type,
                    });
                } else {
                    let data_len = (hdr.cmsg_len as usize)
                        .saturating_sub(libc::CMSG_LEN(0) as usize);
                    let data = libc::CMSG_DATA(cmsghdr) as *const c_int;
                    for i in 0..(data_len / core::mem::size_of::<c_int>()) {
                        let fd = core::ptr::read_unaligned(data.add(i));
                        match Handle::from_raw(fd as u64) {
                            Ok(h) => handles.push(h),
                            Err(e) => unexpected = Some(IpcError::from(e)),
                        }
                    }
                }
                cmsghdr = libc::CMSG_NXTHDR(&msg as *const libc::msghdr, cmsghdr);
            }
        }
        if let Some(e) = unexpected {
            return Err(e);
        }
        if msg.msg_flags & libc::MSG_CTRUNC != 0 {
            return Err(IpcError::AncillaryDataTruncated);
        }
        if read_bytes == 0 && !handles.is_empty() {
            return Err(IpcError::UnexpectedEndOfStream);
        }
        Ok((read_bytes, handles))
    }

    fn recv_exact(&self, mut buffer: &mut [u8]) -> Result<(), IpcError> {
        while !buffer.is_empty() {
            let res = unsafe {
                libc::recv(
                    self.fd.as_raw(),
                    buffer.as_mut_ptr() as *mut c_void,
                    buffer.len(),
                    libc::MSG_WAITALL,
                )
            };
            if res < 0 {
                let os_code = errno();
                if os_code == libc::EINTR as u64 {
                    continue;
                }
                return Err(IpcError::InternalOsOperationFailed {
                    os_code,
                    description: "recv() failed",
                });
            }
            if res == 0 {
                return Err(IpcError::UnexpectedEndOfStream);
            }
            buffer = &mut buffer[res as usize..];
        }
        Ok(())
    }
}

impl AsRawFd for IpcChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw()
    }
}

impl AsFd for IpcChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

fn serialize<T: Serialize>(msg: &T) -> Result<Vec<u8>, IpcError> {
    postcard::to_allocvec(msg).map_err(|e| IpcError::InternalSerializationError {
        description: describe(e),
    })
}

fn deserialize<T: DeserializeOwned>(buffer: &[u8]) -> Result<T, IpcError> {
    postcard::from_bytes(buffer).map_err(|e| IpcError::InternalDeserializationError {
        description: describe(e),
    })
}

fn describe(err: postcard::Error) -> &'static str {
    use postcard::Error::*;
    match err {
        SerializeBufferFull => "frame buffer full",
        SerializeSeqLengthUnknown => "sequence of unknown length",
        DeserializeUnexpectedEnd => "payload ends in the middle of a message",
        DeserializeBadVarint | DeserializeBadBool | DeserializeBadOption | DeserializeBadEnum => {
            "invalid value in payload"
        }
        DeserializeBadChar | DeserializeBadUtf8 => "invalid UTF-8 in payload",
        WontImplement | NotYetImplemented => "unsupported message layout",
        _ => "malformed payload",
    }
}

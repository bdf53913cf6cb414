use crate::errno;
use crate::error::HandleError;
use core::convert::TryInto;
use libc::{c_int, fcntl, FD_CLOEXEC, F_GETFD, F_SETFD};
use log::error;
use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

/// Owned file descriptor, closed when dropped.
#[derive(Debug, Eq, PartialEq, Hash)]
pub struct Handle {
    fd: c_int,
}

impl Handle {
    /// Takes ownership of a raw file descriptor number.
    ///
    /// # Safety
    ///
    /// `raw_handle` must be an open file descriptor which nothing else will close.
    pub unsafe fn from_raw(raw_handle: u64) -> Result<Self, HandleError> {
        let fd: c_int = match raw_handle.try_into() {
            Ok(n) if n >= 0 => n,
            _ => {
                return Err(HandleError::InvalidHandleValue {
                    raw_value: raw_handle,
                })
            }
        };
        Ok(Handle { fd })
    }

    pub fn set_inheritable(&self, allow_inherit: bool) -> Result<(), HandleError> {
        let current_flags = unsafe { fcntl(self.fd, F_GETFD) };
        if current_flags < 0 {
            return Err(HandleError::InternalOsOperationFailed {
                description: "fcntl(F_GETFD) failed",
                raw_handle: self.fd as u64,
                os_code: errno(),
            });
        }
        let res = unsafe {
            fcntl(
                self.fd,
                F_SETFD,
                (current_flags & !FD_CLOEXEC) | if allow_inherit { 0 } else { FD_CLOEXEC },
            )
        };
        if res < 0 {
            return Err(HandleError::InternalOsOperationFailed {
                description: "fcntl(F_SETFD, FD_CLOEXEC) failed",
                raw_handle: self.fd as u64,
                os_code: errno(),
            });
        }
        Ok(())
    }

    pub fn is_inheritable(&self) -> Result<bool, HandleError> {
        let current_flags = unsafe { fcntl(self.fd, F_GETFD) };
        if current_flags < 0 {
            return Err(HandleError::InternalOsOperationFailed {
                description: "fcntl(F_GETFD) failed",
                raw_handle: self.fd as u64,
                os_code: errno(),
            });
        }
        Ok((current_flags & FD_CLOEXEC) == 0)
    }

    pub fn as_raw(&self) -> RawFd {
        self.fd
    }

    /// Releases ownership without closing the descriptor.
    pub fn into_raw(self) -> RawFd {
        let fd = self.fd;
        std::mem::forget(self);
        fd
    }
}

/// Creates a close-on-exec pipe, returned as (read end, write end).
pub fn pipe() -> Result<(Handle, Handle), HandleError> {
    let mut fds: [c_int; 2] = [-1, -1];
    let res = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if res < 0 {
        return Err(HandleError::InternalOsOperationFailed {
            description: "pipe2(O_CLOEXEC) failed",
            raw_handle: 0,
            os_code: errno(),
        });
    }
    Ok((Handle { fd: fds[0] }, Handle { fd: fds[1] }))
}

impl Drop for Handle {
    fn drop(&mut self) {
        let res = unsafe { libc::close(self.fd) };
        if res < 0 {
            error!("close(fd={}) failed with error {}", self.fd, errno());
        }
    }
}

impl AsRawFd for Handle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl AsFd for Handle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        // Safety: the descriptor stays open for as long as we are borrowed
        unsafe { BorrowedFd::borrow_raw(self.fd) }
    }
}

impl From<OwnedFd> for Handle {
    fn from(fd: OwnedFd) -> Self {
        Handle {
            fd: fd.into_raw_fd(),
        }
    }
}

impl From<File> for Handle {
    fn from(file: File) -> Self {
        Handle::from(OwnedFd::from(file))
    }
}

impl From<Handle> for OwnedFd {
    fn from(handle: Handle) -> Self {
        // Safety: ownership is transferred from the handle, which forgets it
        unsafe { OwnedFd::from_raw_fd(handle.into_raw()) }
    }
}

impl From<Handle> for File {
    fn from(handle: Handle) -> Self {
        File::from(OwnedFd::from(handle))
    }
}

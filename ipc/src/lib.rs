//! Control channel between a runner and its warm worker process.
//!
//! Messages are `postcard`-encoded frames sent over a Unix stream socket pair.
//! File descriptors travel alongside a frame as `SCM_RIGHTS` ancillary data, so a
//! request and the descriptors it references always arrive together or not at all.

mod channel;
mod error;
mod handle;
mod message;

pub use channel::{IpcChannel, MAX_FRAME_LEN, MAX_HANDLES_PER_MESSAGE};
pub use error::{HandleError, IpcError};
pub use handle::{pipe, Handle};
pub use message::{IpcRequest, IpcResponse, JobRequest, JobResult, StdioSlot, PROTOCOL_VERSION};

// Name of the environment variable used to pass the control channel file
// descriptor number to worker processes. Kept here since both ends need to
// agree on it.
pub const IPC_HANDLE_ENV_NAME: &str = "WARMFORK_IPC_HANDLE";

/// Last OS error code of the calling thread.
pub fn errno() -> u64 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0) as u64
}

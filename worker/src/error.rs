use thiserror::Error;
use warmfork_ipc::{HandleError, IpcError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerError {
    #[error("environment variable {name} is not set, worker was not started by a runner")]
    MissingIpcHandle { name: &'static str },
    #[error("invalid control channel descriptor \"{value}\"")]
    InvalidIpcHandle { value: String },
    #[error("control channel failure: {0}")]
    Ipc(#[from] IpcError),
    #[error(transparent)]
    Handle(#[from] HandleError),
    #[error("job request announced {expected} descriptor(s) but {received} arrived")]
    IncompleteEnvelope { expected: u32, received: usize },
}

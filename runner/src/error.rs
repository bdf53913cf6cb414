use thiserror::Error;
use warmfork_ipc::IpcError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunnerError {
    #[error("runner is closed")]
    ChannelClosed,
    #[error("invalid configuration: {reason}")]
    Configuration { reason: String },
    #[error("job exited with non-zero status {code}")]
    NonZeroExit { code: i32, output: Option<Vec<u8>> },
    #[error("control channel failure: {description}")]
    TransportFault { description: String },
    #[error("worker process exited during initialization")]
    ProcessExitedDuringInitialization,
    #[error("worker speaks protocol version {version}, expected {expected}")]
    IncompatibleWorker { version: u32, expected: u32 },
    #[error("job could not be started: {description} (os error {os_code})")]
    JobSpawnFailed { description: String, os_code: u64 },
    #[error("{description} (os error {os_code})")]
    InternalOsOperationFailed { description: String, os_code: u64 },
}

impl RunnerError {
    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }
}

impl From<IpcError> for RunnerError {
    fn from(err: IpcError) -> Self {
        Self::TransportFault {
            description: err.to_string(),
        }
    }
}

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleError {
    #[error("invalid handle value {raw_value}")]
    InvalidHandleValue { raw_value: u64 },
    #[error("{description} on file descriptor {raw_handle} (os error {os_code})")]
    InternalOsOperationFailed {
        description: &'static str,
        raw_handle: u64,
        os_code: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IpcError {
    #[error("payload of {len} bytes is too big to transmit")]
    PayloadTooBigToTransmit { len: usize },
    #[error("{count} handles attached to a single message, at most {max} are supported")]
    TooManyHandles { count: usize, max: usize },
    #[error("serialization failed: {description}")]
    InternalSerializationError { description: &'static str },
    #[error("deserialization failed: {description}")]
    InternalDeserializationError { description: &'static str },
    #[error("{description} (os error {os_code})")]
    InternalOsOperationFailed {
        description: &'static str,
        os_code: u64,
    },
    #[error("received invalid handle value {raw_value}")]
    InvalidHandleValueReceived { raw_value: u64 },
    #[error("received unexpected ancillary data (level {level}, type {kind})")]
    UnexpectedAncillaryData { level: i32, kind: i32 },
    #[error("ancillary data was truncated, handles were lost")]
    AncillaryDataTruncated,
    #[error("peer closed the channel in the middle of a message")]
    UnexpectedEndOfStream,
}

impl From<HandleError> for IpcError {
    fn from(e: HandleError) -> Self {
        match e {
            HandleError::InvalidHandleValue { raw_value } => {
                Self::InvalidHandleValueReceived { raw_value }
            }
            HandleError::InternalOsOperationFailed {
                description,
                os_code,
                ..
            } => Self::InternalOsOperationFailed {
                description,
                os_code,
            },
        }
    }
}

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

// Bumped whenever the layout of any message below changes
pub const PROTOCOL_VERSION: u32 = 1;

/// Where one of the standard streams of a job is connected.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdioSlot {
    // Keep the worker's own stream
    #[default]
    Inherit,
    // Connect to /dev/null
    Null,
    // Pipe the stream back to the runner as bytes
    Capture,
    // Use the descriptor at this position among those sent with the request
    External(u32),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub argv: Vec<String>,
    pub executable: Option<PathBuf>,
    pub stdin: StdioSlot,
    pub stdout: StdioSlot,
    pub stderr: StdioSlot,
    // When set, the stderr slot is ignored and stderr goes wherever stdout goes
    pub merge_stderr: bool,
    // Always false, shell invocation is rejected by workers
    pub shell: bool,
    pub cwd: Option<PathBuf>,
    // Full replacement of the job environment, not merged with the worker's
    pub env: Option<BTreeMap<String, String>>,
    pub descriptor_count: u32,
}

impl JobRequest {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            executable: None,
            stdin: StdioSlot::Inherit,
            stdout: StdioSlot::Inherit,
            stderr: StdioSlot::Inherit,
            merge_stderr: false,
            shell: false,
            cwd: None,
            env: None,
            descriptor_count: 0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct JobResult {
    pub exit_code: i32,
    // Only set for slots which were in Capture mode
    pub stdout: Option<Vec<u8>>,
    pub stderr: Option<Vec<u8>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum IpcRequest {
    // Run one job. Sent with exactly `descriptor_count` file descriptors attached.
    RunJob(JobRequest),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum IpcResponse {
    // Initial message sent by workers once they are ready to accept jobs
    Ready { protocol_version: u32, pid: u32 },
    JobCompleted(JobResult),
    // The request asked for something workers do not support
    JobRejected { reason: String },
    // The job could not be started (fork, pipe, or child setup failure)
    JobSpawnFailed { description: String, os_code: u64 },
}

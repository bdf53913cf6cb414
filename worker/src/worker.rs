use crate::error::WorkerError;
use crate::executor::{JobExecutor, ResolvedJob};
use crate::job::JobBody;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::os::fd::AsRawFd;
use warmfork_ipc::{
    Handle, IpcChannel, IpcRequest, IpcResponse, JobRequest, IPC_HANDLE_ENV_NAME,
    PROTOCOL_VERSION,
};

/// Serves jobs from one runner until it closes the control channel.
pub struct Worker {
    channel: IpcChannel,
    executor: JobExecutor,
    // Environment given to jobs which do not provide one
    inherited_env: BTreeMap<String, String>,
}

impl Worker {
    pub fn new(channel: IpcChannel) -> Self {
        let executor = JobExecutor::new(vec![channel.as_raw_fd()]);
        let inherited_env = std::env::vars_os()
            .map(|(name, value)| {
                (
                    name.to_string_lossy().into_owned(),
                    value.to_string_lossy().into_owned(),
                )
            })
            .collect();
        Self {
            channel,
            executor,
            inherited_env,
        }
    }

    /// Announces the worker, then runs jobs one at a time. Returns `Ok(())` once
    /// the runner closes the channel. Job body faults never end the loop; only
    /// transport failures do.
    pub fn serve<B: JobBody + ?Sized>(mut self, body: &B) -> Result<(), WorkerError> {
        let ready = IpcResponse::Ready {
            protocol_version: PROTOCOL_VERSION,
            pid: std::process::id(),
        };
        self.channel.send(&ready, &[])?;
        info!("Worker PID={} ready", std::process::id());
        loop {
            let (request, handles) = match self.channel.recv::<IpcRequest>()? {
                Some(msg) => msg,
                None => {
                    info!("Runner closed the control channel, worker exiting");
                    return Ok(());
                }
            };
            let response = match request {
                IpcRequest::RunJob(job) => self.run_job(job, handles, body)?,
            };
            self.channel.send(&response, &[])?;
        }
    }

    fn run_job<B: JobBody + ?Sized>(
        &self,
        request: JobRequest,
        handles: Vec<Handle>,
        body: &B,
    ) -> Result<IpcResponse, WorkerError> {
        // A request and its descriptors are one envelope, never run half of it
        if handles.len() != request.descriptor_count as usize {
            return Err(WorkerError::IncompleteEnvelope {
                expected: request.descriptor_count,
                received: handles.len(),
            });
        }
        let job = match ResolvedJob::resolve(request, handles, &self.inherited_env) {
            Ok(job) => job,
            Err(reason) => {
                warn!("Rejecting job: {}", reason);
                return Ok(IpcResponse::JobRejected { reason });
            }
        };
        Ok(match self.executor.execute(job, body) {
            Ok(result) => {
                debug!("Job exited with code {}", result.exit_code);
                IpcResponse::JobCompleted(result)
            }
            Err(e) => {
                warn!("Unable to run job: {}", e);
                IpcResponse::JobSpawnFailed {
                    description: e.description,
                    os_code: e.os_code,
                }
            }
        })
    }
}

/// Entry point of worker processes started by a runner: takes over the control
/// channel passed in the environment and serves jobs until it is closed.
pub fn serve_from_env<B: JobBody + ?Sized>(body: &B) -> Result<(), WorkerError> {
    let value = std::env::var(IPC_HANDLE_ENV_NAME).map_err(|_| WorkerError::MissingIpcHandle {
        name: IPC_HANDLE_ENV_NAME,
    })?;
    // Jobs inheriting our environment must not see it
    std::env::remove_var(IPC_HANDLE_ENV_NAME);
    let raw = value
        .parse::<u64>()
        .map_err(|_| WorkerError::InvalidIpcHandle {
            value: value.clone(),
        })?;
    // This unsafe block takes possession of the handle, which is safe since we are the only ones aware
    // of this environment variable, and we erase it as soon as it is used.
    let handle = unsafe { Handle::from_raw(raw) }?;
    handle.set_inheritable(false)?;
    Worker::new(IpcChannel::from_handle(handle)).serve(body)
}

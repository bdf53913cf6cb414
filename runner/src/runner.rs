use crate::options::Redirect;
use crate::{CallOptions, RunnerConfig, RunnerError};
use log::{debug, error, info, warn};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::os::unix::process::CommandExt;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::process::{Child, Command};
use warmfork_ipc::{
    IpcChannel, IpcError, IpcRequest, IpcResponse, JobResult, IPC_HANDLE_ENV_NAME,
    PROTOCOL_VERSION,
};

/// Handle on one warm worker process. Jobs run one at a time, each in a fresh
/// process forked by the worker.
#[derive(Debug)]
pub struct Runner {
    state: State,
}

#[derive(Debug)]
enum State {
    Open(Connection),
    Closed,
}

#[derive(Debug)]
struct Connection {
    channel: IpcChannel,
    worker: Child,
    worker_pid: u32,
    // Set once the channel is out of sync with the worker
    faulted: bool,
}

impl Runner {
    /// Starts the worker process and waits until it is ready to accept jobs.
    pub fn new(config: &RunnerConfig) -> Result<Self, RunnerError> {
        let (channel, worker_end) = IpcChannel::new()?;
        let worker_end = worker_end.into_handle();
        let worker_fd = worker_end.as_raw();
        let mut command = Command::new(&config.executable);
        command
            .args(&config.args)
            .envs(config.envs.iter().map(|(k, v)| (k, v)))
            .env(IPC_HANDLE_ENV_NAME, worker_fd.to_string());
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }
        // Safety: only calls fcntl(), which is async-signal-safe. The descriptor
        // stays close-on-exec in this process, so concurrent spawns from other
        // threads never inherit it.
        unsafe {
            command.pre_exec(move || {
                let flags = libc::fcntl(worker_fd, libc::F_GETFD);
                if flags < 0 || libc::fcntl(worker_fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0
                {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let worker = command
            .spawn()
            .map_err(|e| RunnerError::InternalOsOperationFailed {
                description: format!(
                    "unable to start worker {}: {}",
                    config.executable.display(),
                    e
                ),
                os_code: e.raw_os_error().unwrap_or(0) as u64,
            })?;
        drop(worker_end);
        let mut conn = Connection {
            channel,
            worker,
            worker_pid: 0,
            faulted: false,
        };
        match conn.handshake() {
            Ok(pid) => {
                conn.worker_pid = pid;
                info!("Worker PID={} ready", pid);
                Ok(Self {
                    state: State::Open(conn),
                })
            }
            Err(e) => {
                warn!("Worker failed to start: {}", e);
                // Closing our end makes a worker still alive exit on its own
                let Connection {
                    channel,
                    mut worker,
                    ..
                } = conn;
                drop(channel);
                if let Err(wait_err) = worker.wait() {
                    warn!("Unable to reap worker process: {}", wait_err);
                }
                Err(e)
            }
        }
    }

    /// Process ID of the worker, as reported during its handshake.
    pub fn worker_pid(&self) -> Result<u32, RunnerError> {
        match &self.state {
            State::Open(conn) => Ok(conn.worker_pid),
            State::Closed => Err(RunnerError::ChannelClosed),
        }
    }

    /// Runs one job and returns everything it reported, captured streams included.
    pub fn run<S: AsRef<str>>(
        &mut self,
        argv: &[S],
        options: CallOptions<'_>,
    ) -> Result<JobResult, RunnerError> {
        let conn = self.connection()?;
        if conn.faulted {
            return Err(RunnerError::TransportFault {
                description: "control channel is unusable after a previous failure".to_owned(),
            });
        }
        let (request, handles) = options.into_request(argv)?;
        debug!(
            "Submitting job {:?} with {} descriptor(s)",
            request.argv,
            handles.len()
        );
        let result = conn.exchange(&IpcRequest::RunJob(request), &handles);
        if let Err(RunnerError::TransportFault { description }) = &result {
            error!("Control channel with worker PID={} failed: {}", conn.worker_pid, description);
            conn.faulted = true;
        }
        result
    }

    /// Runs a job and returns its exit code, whatever it is.
    pub fn call<S: AsRef<str>>(
        &mut self,
        argv: &[S],
        options: CallOptions<'_>,
    ) -> Result<i32, RunnerError> {
        Ok(self.run(argv, options)?.exit_code)
    }

    /// Runs a job and fails with `NonZeroExit` unless it exits with 0.
    pub fn check_call<S: AsRef<str>>(
        &mut self,
        argv: &[S],
        options: CallOptions<'_>,
    ) -> Result<(), RunnerError> {
        match self.call(argv, options)? {
            0 => Ok(()),
            code => Err(RunnerError::NonZeroExit { code, output: None }),
        }
    }

    /// Runs a job with its stdout captured and returns it. A non-zero exit fails
    /// with `NonZeroExit`, which carries the captured bytes.
    pub fn check_output<S: AsRef<str>>(
        &mut self,
        argv: &[S],
        options: CallOptions<'_>,
    ) -> Result<Vec<u8>, RunnerError> {
        self.connection()?;
        let options = match options.stdout_redirect() {
            None | Some(Redirect::Capture) => options.stdout(Redirect::Capture),
            Some(_) => {
                return Err(RunnerError::configuration(
                    "stdout is captured by check_output and cannot be redirected",
                ))
            }
        };
        let result = self.run(argv, options)?;
        let output = result.stdout.unwrap_or_default();
        match result.exit_code {
            0 => Ok(output),
            code => Err(RunnerError::NonZeroExit {
                code,
                output: Some(output),
            }),
        }
    }

    /// Closes the control channel and waits for the worker to exit. Only the first
    /// call does this: any later one returns `ChannelClosed`.
    pub fn close(&mut self) -> Result<(), RunnerError> {
        let conn = match std::mem::replace(&mut self.state, State::Closed) {
            State::Open(conn) => conn,
            State::Closed => return Err(RunnerError::ChannelClosed),
        };
        let Connection {
            channel,
            mut worker,
            worker_pid,
            ..
        } = conn;
        drop(channel);
        let status = worker
            .wait()
            .map_err(|e| RunnerError::InternalOsOperationFailed {
                description: format!("unable to wait for worker PID={}: {}", worker_pid, e),
                os_code: e.raw_os_error().unwrap_or(0) as u64,
            })?;
        if status.success() {
            info!("Worker PID={} exited", worker_pid);
        } else {
            warn!("Worker PID={} exited with {}", worker_pid, status);
        }
        Ok(())
    }

    /// Runs `f` on the runner, then closes it, even if `f` panics. The runner
    /// is closed once `scoped` returns.
    pub fn scoped<T, F>(&mut self, f: F) -> Result<T, RunnerError>
    where
        F: FnOnce(&mut Self) -> T,
    {
        let outcome = catch_unwind(AssertUnwindSafe(|| f(self)));
        let closed = self.close();
        match outcome {
            Ok(value) => closed.map(|()| value),
            Err(panic) => {
                if let Err(e) = closed {
                    warn!("Unable to close runner after a panic: {}", e);
                }
                resume_unwind(panic)
            }
        }
    }

    fn connection(&mut self) -> Result<&mut Connection, RunnerError> {
        match &mut self.state {
            State::Open(conn) => Ok(conn),
            State::Closed => Err(RunnerError::ChannelClosed),
        }
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        if let State::Open(_) = self.state {
            if let Err(e) = self.close() {
                warn!("Unable to close runner: {}", e);
            }
        }
    }
}

impl Connection {
    fn handshake(&mut self) -> Result<u32, RunnerError> {
        match self.channel.recv::<IpcResponse>() {
            Ok(Some((
                IpcResponse::Ready {
                    protocol_version,
                    pid,
                },
                handles,
            ))) => {
                if !handles.is_empty() {
                    return Err(RunnerError::TransportFault {
                        description: "worker sent descriptors with its handshake".to_owned(),
                    });
                }
                if protocol_version != PROTOCOL_VERSION {
                    return Err(RunnerError::IncompatibleWorker {
                        version: protocol_version,
                        expected: PROTOCOL_VERSION,
                    });
                }
                Ok(pid)
            }
            Ok(Some((other, _))) => Err(RunnerError::TransportFault {
                description: format!("unexpected message before handshake: {:?}", other),
            }),
            Ok(None) | Err(IpcError::UnexpectedEndOfStream) => {
                Err(RunnerError::ProcessExitedDuringInitialization)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn exchange(
        &mut self,
        request: &IpcRequest,
        handles: &[BorrowedFd<'_>],
    ) -> Result<JobResult, RunnerError> {
        self.channel.send(request, handles)?;
        let (response, received) = match self.channel.recv::<IpcResponse>()? {
            Some(msg) => msg,
            None => {
                return Err(RunnerError::TransportFault {
                    description: format!(
                        "worker PID={} closed the control channel (fd {})",
                        self.worker_pid,
                        self.channel.as_raw_fd()
                    ),
                })
            }
        };
        if !received.is_empty() {
            return Err(RunnerError::TransportFault {
                description: "worker sent descriptors with its response".to_owned(),
            });
        }
        match response {
            IpcResponse::JobCompleted(result) => {
                debug!("Job exited with code {}", result.exit_code);
                Ok(result)
            }
            IpcResponse::JobRejected { reason } => Err(RunnerError::Configuration { reason }),
            IpcResponse::JobSpawnFailed {
                description,
                os_code,
            } => Err(RunnerError::JobSpawnFailed {
                description,
                os_code,
            }),
            other => Err(RunnerError::TransportFault {
                description: format!("unexpected response: {:?}", other),
            }),
        }
    }
}

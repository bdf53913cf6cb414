use crate::job::{exit_code_for, JobBody, JobContext, FAULT_EXIT_CODE};
use libc::c_int;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::thread::JoinHandle;
use thiserror::Error;
use warmfork_ipc::{errno, pipe, Handle, HandleError, JobRequest, JobResult, StdioSlot};

/// Connection of one standard stream once descriptor indices are resolved.
#[derive(Debug)]
pub(crate) enum StdioTarget {
    Inherit,
    Null,
    Capture,
    Descriptor(Handle),
}

/// A job request with its transferred descriptors attached to the streams
/// referencing them.
#[derive(Debug)]
pub(crate) struct ResolvedJob {
    pub(crate) argv: Vec<String>,
    pub(crate) program: PathBuf,
    pub(crate) env: BTreeMap<String, String>,
    // The request carried its own environment, which replaces the process one
    pub(crate) explicit_env: bool,
    pub(crate) cwd: Option<PathBuf>,
    pub(crate) stdin: StdioTarget,
    pub(crate) stdout: StdioTarget,
    pub(crate) stderr: StdioTarget,
    pub(crate) merge_stderr: bool,
}

impl ResolvedJob {
    /// Returns the reason for rejecting the request if it cannot be honored.
    /// `handles` must be the descriptors received with the request, in order.
    pub(crate) fn resolve(
        request: JobRequest,
        handles: Vec<Handle>,
        inherited_env: &BTreeMap<String, String>,
    ) -> Result<Self, String> {
        if request.shell {
            return Err("shell invocation is not supported".to_owned());
        }
        let program = match (request.executable, request.argv.first()) {
            (_, None) => return Err("argv must not be empty".to_owned()),
            (Some(executable), _) => executable,
            (None, Some(arg0)) => PathBuf::from(arg0),
        };
        if let Some(env) = &request.env {
            if let Some(name) = env.iter().find_map(|(k, v)| invalid_variable(k, v)) {
                return Err(format!("invalid environment variable {:?}", name));
            }
        }
        let mut handles: Vec<Option<Handle>> = handles.into_iter().map(Some).collect();
        let mut take = |slot: StdioSlot, stream: &str| -> Result<StdioTarget, String> {
            Ok(match slot {
                StdioSlot::Inherit => StdioTarget::Inherit,
                StdioSlot::Null => StdioTarget::Null,
                StdioSlot::Capture => StdioTarget::Capture,
                StdioSlot::External(index) => {
                    match handles.get_mut(index as usize).and_then(Option::take) {
                        Some(handle) => StdioTarget::Descriptor(handle),
                        None => {
                            return Err(format!(
                                "{} refers to descriptor #{} which was not sent or is already used",
                                stream, index
                            ))
                        }
                    }
                }
            })
        };
        let stdin = take(request.stdin, "stdin")?;
        let stdout = take(request.stdout, "stdout")?;
        let stderr = if request.merge_stderr {
            StdioTarget::Inherit
        } else {
            take(request.stderr, "stderr")?
        };
        if handles.iter().any(Option::is_some) {
            return Err("descriptors were sent without being used by any stream".to_owned());
        }
        Ok(Self {
            explicit_env: request.env.is_some(),
            env: request.env.unwrap_or_else(|| inherited_env.clone()),
            argv: request.argv,
            program,
            cwd: request.cwd,
            stdin,
            stdout,
            stderr,
            merge_stderr: request.merge_stderr,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{description} (os error {os_code})")]
pub(crate) struct ExecutionError {
    pub(crate) description: String,
    pub(crate) os_code: u64,
}

impl ExecutionError {
    fn last_os_error(description: &str) -> Self {
        Self {
            description: description.to_owned(),
            os_code: errno(),
        }
    }
}

impl From<HandleError> for ExecutionError {
    fn from(e: HandleError) -> Self {
        let os_code = match &e {
            HandleError::InternalOsOperationFailed { os_code, .. } => *os_code,
            HandleError::InvalidHandleValue { .. } => 0,
        };
        Self {
            description: e.to_string(),
            os_code,
        }
    }
}

/// Runs resolved jobs in forked children of the current process.
pub(crate) struct JobExecutor {
    // Worker descriptors which children must not keep (e.g. the control channel)
    close_in_child: Vec<RawFd>,
}

impl JobExecutor {
    pub(crate) fn new(close_in_child: Vec<RawFd>) -> Self {
        Self { close_in_child }
    }

    pub(crate) fn execute<B: JobBody + ?Sized>(
        &self,
        job: ResolvedJob,
        body: &B,
    ) -> Result<JobResult, ExecutionError> {
        let ResolvedJob {
            argv,
            program,
            env,
            explicit_env,
            cwd,
            stdin,
            stdout,
            stderr,
            merge_stderr,
        } = job;
        let child_stdin = match stdin {
            StdioTarget::Inherit => None,
            StdioTarget::Null => Some(open_dev_null()?),
            StdioTarget::Capture => {
                // Nothing is ever written: the job reads an immediate end-of-file
                let (read_end, _write_end) = pipe()?;
                Some(read_end)
            }
            StdioTarget::Descriptor(handle) => Some(handle),
        };
        let (child_stdout, captured_stdout) = output_target(stdout)?;
        let (child_stderr, captured_stderr) = if merge_stderr {
            (None, None)
        } else {
            output_target(stderr)?
        };
        // Stays empty if the child sets itself up, otherwise receives its errno
        let (status_read, status_write) = pipe()?;

        debug!("Running job {:?}", argv);
        let ctx = JobContext {
            argv,
            program,
            env,
            cwd: PathBuf::new(),
        };
        let setup = ChildSetup {
            stdio: [child_stdin, child_stdout, child_stderr],
            merge_stderr,
            cwd,
            env: explicit_env.then(|| ctx.env.clone()),
            close_in_child: &self.close_in_child,
        };
        // Anything still buffered would otherwise be written twice
        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();

        // Safety: the child only gets a copy of this thread. Capture readers of
        // previous jobs are all joined by now, and job bodies must not rely on
        // threads started during the worker's warm-up.
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(ExecutionError::last_os_error("fork() failed"));
        }
        if pid == 0 {
            let parent_only = [captured_stdout, captured_stderr, Some(status_read)];
            run_child(setup, parent_only, status_write, ctx, body);
        }
        debug!("Job child PID={} forked", pid);
        drop(setup);
        drop(status_write);

        let stdout_reader = captured_stdout.map(spawn_reader);
        let stderr_reader = captured_stderr.map(spawn_reader);
        let setup_status = read_setup_status(status_read);
        let wstatus = wait_for_child(pid);
        let stdout = join_reader(stdout_reader);
        let stderr = join_reader(stderr_reader);

        let wstatus = wstatus?;
        if let Some(os_code) = setup_status? {
            return Err(ExecutionError {
                description: "job setup failed in the forked child".to_owned(),
                os_code,
            });
        }
        Ok(JobResult {
            exit_code: exit_code_from_wait_status(pid, wstatus),
            stdout: stdout?,
            stderr: stderr?,
        })
    }
}

struct ChildSetup<'a> {
    stdio: [Option<Handle>; 3],
    merge_stderr: bool,
    cwd: Option<PathBuf>,
    env: Option<BTreeMap<String, String>>,
    close_in_child: &'a [RawFd],
}

impl ChildSetup<'_> {
    // Returns the OS error code of the first step which failed
    fn apply(self) -> Result<(), u64> {
        for fd in self.close_in_child {
            unsafe {
                libc::close(*fd);
            }
        }
        for (target, source) in (0 as c_int..).zip(self.stdio) {
            if let Some(source) = source {
                redirect(source, target)?;
            }
        }
        if self.merge_stderr {
            let res = unsafe { libc::dup2(libc::STDOUT_FILENO, libc::STDERR_FILENO) };
            if res < 0 {
                return Err(errno());
            }
        }
        if let Some(cwd) = &self.cwd {
            std::env::set_current_dir(cwd)
                .map_err(|e| e.raw_os_error().unwrap_or(0) as u64)?;
        }
        // Runs in the forked child only, which is single-threaded
        if let Some(env) = &self.env {
            for (name, _) in std::env::vars_os() {
                std::env::remove_var(name);
            }
            for (name, value) in env {
                std::env::set_var(name, value);
            }
        }
        Ok(())
    }
}

// Returns the name of a variable which cannot be set in a process environment
fn invalid_variable<'a>(name: &'a str, value: &str) -> Option<&'a str> {
    if name.is_empty() || name.contains(['=', '\0']) || value.contains('\0') {
        Some(name)
    } else {
        None
    }
}

fn run_child<B: JobBody + ?Sized>(
    setup: ChildSetup<'_>,
    parent_only: [Option<Handle>; 3],
    status: Handle,
    mut ctx: JobContext,
    body: &B,
) -> ! {
    drop(parent_only);
    let code = match setup.apply() {
        Ok(()) => {
            // End-of-file on the status pipe tells the worker we are set up
            drop(status);
            ctx.cwd = std::env::current_dir().unwrap_or_default();
            // A panic prints its diagnostic through the hook, to our stderr
            match panic::catch_unwind(AssertUnwindSafe(|| body.run(&ctx))) {
                Ok(outcome) => exit_code_for(outcome, &mut std::io::stderr()),
                Err(_) => FAULT_EXIT_CODE,
            }
        }
        Err(os_code) => {
            let mut status = File::from(status);
            let _ = status.write_all(&(os_code as u32).to_be_bytes());
            FAULT_EXIT_CODE
        }
    };
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
    // Skip destructors and atexit handlers registered by the worker
    unsafe { libc::_exit(code) }
}

fn redirect(source: Handle, target: c_int) -> Result<(), u64> {
    if source.as_raw() == target {
        // Already in place, just make sure it is not closed on exec
        let res = source.set_inheritable(true);
        source.into_raw();
        return res.map_err(|_| errno());
    }
    let res = unsafe { libc::dup2(source.as_raw(), target) };
    if res < 0 {
        return Err(errno());
    }
    Ok(())
}

fn output_target(target: StdioTarget) -> Result<(Option<Handle>, Option<Handle>), ExecutionError> {
    Ok(match target {
        StdioTarget::Inherit => (None, None),
        StdioTarget::Null => (Some(open_dev_null()?), None),
        StdioTarget::Capture => {
            let (read_end, write_end) = pipe()?;
            (Some(write_end), Some(read_end))
        }
        StdioTarget::Descriptor(handle) => (Some(handle), None),
    })
}

fn open_dev_null() -> Result<Handle, ExecutionError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .map(Handle::from)
        .map_err(|e| ExecutionError {
            description: "unable to open /dev/null".to_owned(),
            os_code: e.raw_os_error().unwrap_or(0) as u64,
        })
}

fn spawn_reader(handle: Handle) -> JoinHandle<std::io::Result<Vec<u8>>> {
    std::thread::spawn(move || {
        let mut pipe = File::from(handle);
        let mut bytes = Vec::new();
        pipe.read_to_end(&mut bytes)?;
        Ok(bytes)
    })
}

fn join_reader(
    reader: Option<JoinHandle<std::io::Result<Vec<u8>>>>,
) -> Result<Option<Vec<u8>>, ExecutionError> {
    let reader = match reader {
        Some(r) => r,
        None => return Ok(None),
    };
    match reader.join() {
        Ok(Ok(bytes)) => Ok(Some(bytes)),
        Ok(Err(e)) => Err(ExecutionError {
            description: format!("unable to read captured output: {}", e),
            os_code: e.raw_os_error().unwrap_or(0) as u64,
        }),
        Err(_) => Err(ExecutionError {
            description: "captured output reader panicked".to_owned(),
            os_code: 0,
        }),
    }
}

fn read_setup_status(status: Handle) -> Result<Option<u64>, ExecutionError> {
    let mut status = File::from(status);
    let mut bytes = Vec::new();
    status
        .read_to_end(&mut bytes)
        .map_err(|e| ExecutionError {
            description: format!("unable to read job setup status: {}", e),
            os_code: e.raw_os_error().unwrap_or(0) as u64,
        })?;
    match <[u8; 4]>::try_from(bytes.as_slice()) {
        Ok(code) => Ok(Some(u32::from_be_bytes(code) as u64)),
        Err(_) if bytes.is_empty() => Ok(None),
        Err(_) => Err(ExecutionError {
            description: format!("malformed job setup status of {} bytes", bytes.len()),
            os_code: 0,
        }),
    }
}

fn wait_for_child(pid: libc::pid_t) -> Result<c_int, ExecutionError> {
    let mut wstatus: c_int = 0;
    loop {
        let res = unsafe { libc::waitpid(pid, &mut wstatus as *mut c_int, 0) };
        if res == pid {
            return Ok(wstatus);
        }
        if res < 0 && errno() != libc::EINTR as u64 {
            return Err(ExecutionError::last_os_error("waitpid() failed"));
        }
    }
}

fn exit_code_from_wait_status(pid: libc::pid_t, wstatus: c_int) -> i32 {
    if libc::WIFEXITED(wstatus) {
        libc::WEXITSTATUS(wstatus)
    } else if libc::WIFSIGNALED(wstatus) {
        warn!(
            "Job child PID={} was killed by signal {}",
            pid,
            libc::WTERMSIG(wstatus)
        );
        FAULT_EXIT_CODE
    } else {
        warn!(
            "Job child PID={} ended with unexpected wait status {}",
            pid, wstatus
        );
        FAULT_EXIT_CODE
    }
}

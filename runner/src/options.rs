use crate::RunnerError;
use std::collections::BTreeMap;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::PathBuf;
use warmfork_ipc::{JobRequest, StdioSlot};

/// Where a standard stream of a job goes.
#[derive(Debug, Clone, Copy, Default)]
pub enum Redirect<'a> {
    /// Share the worker's stream, itself inherited from the runner's process.
    #[default]
    Inherit,
    Null,
    /// Collect the stream and return it as bytes.
    Capture,
    /// Only valid for stderr: write wherever stdout goes.
    MergeToStdout,
    /// An open file, socket, or pipe, transferred to the worker for this job.
    Fd(BorrowedFd<'a>),
}

impl<'a> Redirect<'a> {
    pub fn to<F: AsFd + ?Sized>(target: &'a F) -> Self {
        Redirect::Fd(target.as_fd())
    }
}

/// Options of one job, in the spirit of a subprocess invocation.
#[derive(Debug, Clone, Default)]
pub struct CallOptions<'a> {
    stdin: Option<Redirect<'a>>,
    stdout: Option<Redirect<'a>>,
    stderr: Option<Redirect<'a>>,
    executable: Option<PathBuf>,
    cwd: Option<PathBuf>,
    env: Option<BTreeMap<String, String>>,
    shell: bool,
}

impl<'a> CallOptions<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdin(mut self, redirect: Redirect<'a>) -> Self {
        self.stdin = Some(redirect);
        self
    }

    pub fn stdout(mut self, redirect: Redirect<'a>) -> Self {
        self.stdout = Some(redirect);
        self
    }

    pub fn stderr(mut self, redirect: Redirect<'a>) -> Self {
        self.stderr = Some(redirect);
        self
    }

    /// Replaces the whole environment of the job. Without it, the job sees the
    /// worker's environment.
    pub fn env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = Some(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Program given to the job body instead of `argv[0]`.
    pub fn executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }

    /// Shell invocation is not supported: `true` makes every call fail.
    pub fn shell(mut self, shell: bool) -> Self {
        self.shell = shell;
        self
    }

    pub(crate) fn stdout_redirect(&self) -> Option<Redirect<'a>> {
        self.stdout
    }

    /// Builds the wire request, and the descriptors to send with it in the order
    /// their `External` indices refer to them (stdin, stdout, then stderr).
    pub(crate) fn into_request<S: AsRef<str>>(
        self,
        argv: &[S],
    ) -> Result<(JobRequest, Vec<BorrowedFd<'a>>), RunnerError> {
        if self.shell {
            return Err(RunnerError::configuration(
                "shell invocation is not supported",
            ));
        }
        if argv.is_empty() {
            return Err(RunnerError::configuration("argv must not be empty"));
        }
        let mut request = JobRequest::new(argv.iter().map(|a| a.as_ref().to_owned()).collect());
        let mut handles = Vec::new();
        request.stdin = slot(self.stdin.unwrap_or_default(), "stdin", &mut handles)?;
        request.stdout = slot(self.stdout.unwrap_or_default(), "stdout", &mut handles)?;
        match self.stderr.unwrap_or_default() {
            Redirect::MergeToStdout => request.merge_stderr = true,
            other => request.stderr = slot(other, "stderr", &mut handles)?,
        }
        request.descriptor_count = handles.len() as u32;
        request.cwd = self.cwd.map(|p| utf8_path(p, "cwd")).transpose()?;
        request.executable = self
            .executable
            .map(|p| utf8_path(p, "executable"))
            .transpose()?;
        if let Some(env) = &self.env {
            if let Some(name) = env
                .iter()
                .find(|(k, v)| k.is_empty() || k.contains(['=', '\0']) || v.contains('\0'))
                .map(|(k, _)| k)
            {
                return Err(RunnerError::configuration(format!(
                    "environment variable {:?} cannot be set",
                    name
                )));
            }
        }
        request.env = self.env;
        Ok((request, handles))
    }
}

fn slot<'a>(
    redirect: Redirect<'a>,
    stream: &str,
    handles: &mut Vec<BorrowedFd<'a>>,
) -> Result<StdioSlot, RunnerError> {
    Ok(match redirect {
        Redirect::Inherit => StdioSlot::Inherit,
        Redirect::Null => StdioSlot::Null,
        Redirect::Capture => StdioSlot::Capture,
        Redirect::Fd(fd) => {
            handles.push(fd);
            StdioSlot::External((handles.len() - 1) as u32)
        }
        Redirect::MergeToStdout => {
            return Err(RunnerError::configuration(format!(
                "{} cannot be merged into stdout",
                stream
            )))
        }
    })
}

// Paths cross the control channel as UTF-8 strings
fn utf8_path(path: PathBuf, what: &str) -> Result<PathBuf, RunnerError> {
    if path.to_str().is_none() {
        return Err(RunnerError::configuration(format!(
            "{} {} is not valid UTF-8",
            what,
            path.display()
        )));
    }
    Ok(path)
}

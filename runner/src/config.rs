use crate::RunnerError;
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use warmfork_ipc::IPC_HANDLE_ENV_NAME;

/// How to start the warm worker process.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub(crate) executable: PathBuf,
    pub(crate) args: Vec<OsString>,
    pub(crate) envs: Vec<(OsString, OsString)>,
    pub(crate) cwd: Option<PathBuf>,
}

impl RunnerConfig {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: vec![],
            envs: vec![],
            cwd: None,
        }
    }

    pub fn with_arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Sets a variable in the worker's environment, on top of the one inherited
    /// from the current process.
    pub fn with_environment_variable(
        mut self,
        name: impl Into<OsString>,
        value: impl Into<OsString>,
    ) -> Result<Self, RunnerError> {
        let name = name.into();
        if name == OsStr::new(IPC_HANDLE_ENV_NAME) {
            return Err(RunnerError::configuration(format!(
                "{} is reserved for the control channel",
                IPC_HANDLE_ENV_NAME
            )));
        }
        if self.envs.iter().any(|(prev, _)| *prev == name) {
            return Err(RunnerError::configuration(format!(
                "conflicting values for environment variable {}",
                name.to_string_lossy()
            )));
        }
        self.envs.push((name, value.into()));
        Ok(self)
    }

    pub fn with_current_working_directory(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

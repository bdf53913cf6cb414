use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Exit code reported when a job body faults instead of terminating normally.
pub const FAULT_EXIT_CODE: i32 = 255;

/// Exit code reported when a job body stops with a textual reason.
pub const REASON_EXIT_CODE: i32 = 1;

pub type JobError = Box<dyn std::error::Error + Send + Sync>;

/// How a job body chose to terminate.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Termination {
    /// Ran to completion without asking for a specific exit code.
    #[default]
    Success,
    /// Explicit exit code. Only the low 8 bits are reported, like any process exit.
    Exit(i32),
    /// Stop with a message, which is written to the job's stderr.
    Reason(String),
}

impl From<i32> for Termination {
    fn from(code: i32) -> Self {
        Termination::Exit(code)
    }
}

/// The work done in each forked child. Implementations run with stdin, stdout, and
/// stderr already connected to what the runner asked for.
pub trait JobBody {
    fn run(&self, ctx: &JobContext) -> Result<Termination, JobError>;
}

impl<F> JobBody for F
where
    F: Fn(&JobContext) -> Result<Termination, JobError>,
{
    fn run(&self, ctx: &JobContext) -> Result<Termination, JobError> {
        self(ctx)
    }
}

/// Frozen copy of one job's invocation, owned by the forked child.
///
/// `env()` is the job's environment. When the request carried one, the child's
/// process environment was replaced by it as well, so `std::env` and spawned
/// processes see the same variables. The worker's own environment is untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub(crate) argv: Vec<String>,
    pub(crate) program: PathBuf,
    pub(crate) env: BTreeMap<String, String>,
    pub(crate) cwd: PathBuf,
}

impl JobContext {
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Executable override from the request, or `argv[0]`.
    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn var(&self, name: &str) -> Option<&str> {
        self.env.get(name).map(String::as_str)
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }
}

// Maps the outcome of a job body to its process exit code, writing any
// diagnostic to `stderr`
pub(crate) fn exit_code_for(
    outcome: Result<Termination, JobError>,
    stderr: &mut impl Write,
) -> i32 {
    match outcome {
        Ok(Termination::Success) => 0,
        Ok(Termination::Exit(code)) => code & 0xff,
        Ok(Termination::Reason(reason)) => {
            let _ = writeln!(stderr, "{}", reason);
            REASON_EXIT_CODE
        }
        Err(e) => {
            let _ = writeln!(stderr, "error: {}", e);
            FAULT_EXIT_CODE
        }
    }
}

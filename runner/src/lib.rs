//! Runner side: starts a warm worker process once, then dispatches jobs to it with
//! a subprocess-like API.
//!
//! ```no_run
//! use warmfork_runner::{CallOptions, Redirect, Runner, RunnerConfig};
//!
//! # fn main() -> Result<(), warmfork_runner::RunnerError> {
//! let mut runner = Runner::new(&RunnerConfig::new("/usr/libexec/my-worker"))?;
//! let code = runner.call(&["myscript", "arg1"], CallOptions::new())?;
//! runner.check_call(&["myscript", "arg2"], CallOptions::new().stdout(Redirect::Null))?;
//! let out = runner.check_output(
//!     &["myscript", "arg3"],
//!     CallOptions::new().stderr(Redirect::MergeToStdout),
//! )?;
//! runner.close()?;
//! # let _ = (code, out);
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod options;
mod runner;

pub use config::RunnerConfig;
pub use error::RunnerError;
pub use options::{CallOptions, Redirect};
pub use runner::Runner;

// Re-exported from the IPC crate, so that callers of Runner::run() do not
// need to depend on it
pub use warmfork_ipc::JobResult;

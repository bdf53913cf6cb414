//! Warm worker side: receives jobs over the control channel and runs each of them
//! in a forked child of this already-initialized process.
//!
//! A worker binary does its expensive initialization once, then hands its job body
//! to [`serve_from_env`]:
//!
//! ```no_run
//! use warmfork_worker::{serve_from_env, JobContext, JobError, Termination};
//!
//! fn run(ctx: &JobContext) -> Result<Termination, JobError> {
//!     println!("hello from {}", ctx.program().display());
//!     Ok(Termination::Success)
//! }
//!
//! fn main() {
//!     if let Err(e) = serve_from_env(&run) {
//!         eprintln!("worker failed: {}", e);
//!         std::process::exit(1);
//!     }
//! }
//! ```

mod error;
mod executor;
mod job;
mod worker;

pub use error::WorkerError;
pub use job::{JobBody, JobContext, JobError, Termination, FAULT_EXIT_CODE, REASON_EXIT_CODE};
pub use worker::{serve_from_env, Worker};

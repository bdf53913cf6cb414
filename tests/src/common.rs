use log::LevelFilter;
use simple_logger::SimpleLogger;
use std::ffi::OsString;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::Once;
use tempfile::NamedTempFile;
use warmfork_ipc::{IpcChannel, IpcResponse, IPC_HANDLE_ENV_NAME, PROTOCOL_VERSION};
use warmfork_runner::{Runner, RunnerConfig};

// Common functions used by all tests for setup / check / teardown
pub fn main() {
    println!("This crate is not designed to be run directly, use 'cargo test' to run each module in tests/*.rs");
}

static LOGGER_INIT: Once = Once::new();

/// Logs to stderr, so that captured job stdout is never polluted. Defaults to
/// warnings, `RUST_LOG` raises the level.
pub fn common_test_setup() {
    LOGGER_INIT.call_once(|| {
        // Another logger may already be installed by the test harness
        let _ = SimpleLogger::new()
            .with_level(LevelFilter::Warn)
            .env()
            .init();
    });
}

pub fn get_worker_bin_path(name: &str) -> PathBuf {
    let exe = std::env::current_exe().unwrap();
    let ext = exe.extension().map(OsString::from);
    let mut dir = exe.clone();
    loop {
        dir = dir
            .parent()
            .unwrap_or_else(|| {
                panic!(
                    "worker binary {} not found in any parent directory of {}",
                    name,
                    exe.display()
                )
            })
            .to_path_buf();
        let mut worker_binary = dir.with_file_name(name);
        if let Some(ext) = &ext {
            worker_binary.set_extension(ext);
        }
        if worker_binary.exists() {
            println!(" [.] Worker binary: {}", worker_binary.display());
            return worker_binary;
        }
    }
}

pub fn job_worker_config() -> RunnerConfig {
    RunnerConfig::new(get_worker_bin_path("job_worker"))
}

/// Runner on the `job_worker` binary, which dispatches on `argv[0]`.
pub fn job_runner() -> Runner {
    common_test_setup();
    Runner::new(&job_worker_config()).expect("worker creation failed")
}

pub fn open_tmp_file() -> NamedTempFile {
    let file = NamedTempFile::new().expect("unable to create temporary file");
    println!(" [.] Storing temporary output to {}", file.path().display());
    file
}

pub fn read_tmp_file(file: &NamedTempFile) -> String {
    std::fs::read_to_string(file.path()).expect("unable to read temporary file")
}

/// Starts a worker binary by hand, for tests speaking the wire protocol directly.
/// Returns the client end of its control channel, past the handshake.
pub fn spawn_raw_worker(name: &str) -> (IpcChannel, Child, u32) {
    common_test_setup();
    let (mut channel, worker_end) = IpcChannel::new().unwrap();
    let worker_end = worker_end.into_handle();
    let worker_fd = worker_end.as_raw();
    let mut command = Command::new(get_worker_bin_path(name));
    command.env(IPC_HANDLE_ENV_NAME, worker_fd.to_string());
    unsafe {
        command.pre_exec(move || {
            if libc::fcntl(worker_fd, libc::F_SETFD, 0) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    let child = command.spawn().expect("unable to start worker");
    drop(worker_end);
    let pid = match channel.recv::<IpcResponse>() {
        Ok(Some((
            IpcResponse::Ready {
                protocol_version,
                pid,
            },
            handles,
        ))) => {
            assert_eq!(protocol_version, PROTOCOL_VERSION);
            assert!(handles.is_empty());
            pid
        }
        other => panic!("unexpected handshake from worker: {:?}", other),
    };
    (channel, child, pid)
}

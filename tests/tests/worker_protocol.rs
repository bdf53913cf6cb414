use common::{open_tmp_file, read_tmp_file, spawn_raw_worker};
use std::os::fd::AsFd;
use warmfork_ipc::{IpcRequest, IpcResponse, JobRequest, StdioSlot};

fn job(argv: &[&str]) -> JobRequest {
    JobRequest::new(argv.iter().map(|a| a.to_string()).collect())
}

#[test]
fn job_completed_with_capture() {
    let (mut channel, mut worker, _) = spawn_raw_worker("job_worker");
    let mut request = job(&["output"]);
    request.stdout = StdioSlot::Capture;
    request.stderr = StdioSlot::Null;
    channel.send(&IpcRequest::RunJob(request), &[]).unwrap();
    match channel.recv::<IpcResponse>() {
        Ok(Some((IpcResponse::JobCompleted(result), _))) => {
            assert_eq!(result.exit_code, 0);
            assert_eq!(result.stdout.as_deref(), Some(&b"outputting\n"[..]));
            assert_eq!(result.stderr, None);
        }
        other => panic!("unexpected response {:?}", other),
    }
    drop(channel);
    assert!(worker.wait().unwrap().success());
}

#[test]
fn shell_requests_are_rejected() {
    let (mut channel, mut worker, _) = spawn_raw_worker("job_worker");
    let mut request = job(&["success"]);
    request.shell = true;
    channel.send(&IpcRequest::RunJob(request), &[]).unwrap();
    assert!(matches!(
        channel.recv::<IpcResponse>(),
        Ok(Some((IpcResponse::JobRejected { .. }, _)))
    ));
    drop(channel);
    assert!(worker.wait().unwrap().success());
}

#[test]
fn descriptor_index_out_of_range_is_rejected() {
    let (mut channel, mut worker, _) = spawn_raw_worker("job_worker");
    let tmp = open_tmp_file();
    let mut request = job(&["output"]);
    request.stdout = StdioSlot::External(1);
    request.descriptor_count = 1;
    channel
        .send(&IpcRequest::RunJob(request), &[tmp.as_file().as_fd()])
        .unwrap();
    assert!(matches!(
        channel.recv::<IpcResponse>(),
        Ok(Some((IpcResponse::JobRejected { .. }, _)))
    ));
    // The job never ran
    assert_eq!(read_tmp_file(&tmp), "");
    // The worker is still usable
    channel
        .send(&IpcRequest::RunJob(job(&["success"])), &[])
        .unwrap();
    assert!(matches!(
        channel.recv::<IpcResponse>(),
        Ok(Some((IpcResponse::JobCompleted(result), _))) if result.exit_code == 0
    ));
    drop(channel);
    assert!(worker.wait().unwrap().success());
}

#[test]
fn incomplete_envelope_is_fatal() {
    let (mut channel, mut worker, _) = spawn_raw_worker("job_worker");
    let mut request = job(&["output"]);
    request.stdout = StdioSlot::External(0);
    request.descriptor_count = 1;
    // Announces one descriptor but sends none
    channel.send(&IpcRequest::RunJob(request), &[]).unwrap();
    assert_eq!(channel.recv::<IpcResponse>(), Ok(None));
    assert!(!worker.wait().unwrap().success());
}

use common::{open_tmp_file, read_tmp_file};
use std::fs::File;
use std::io::Write;
use std::os::fd::{AsFd, AsRawFd};
use warmfork_ipc::{
    IpcChannel, IpcError, IpcRequest, IpcResponse, JobRequest, JobResult, StdioSlot,
    MAX_HANDLES_PER_MESSAGE,
};

fn send_raw(channel: &IpcChannel, bytes: &[u8]) {
    let res = unsafe {
        libc::write(
            channel.as_raw_fd(),
            bytes.as_ptr() as *const libc::c_void,
            bytes.len(),
        )
    };
    assert_eq!(res, bytes.len() as isize);
}

#[test]
fn request_travels_with_its_descriptors() {
    let (mut runner_end, mut worker_end) = IpcChannel::new().unwrap();
    let tmp = open_tmp_file();
    let mut request = JobRequest::new(vec!["job".to_owned(), "arg".to_owned()]);
    request.stdout = StdioSlot::External(0);
    request.descriptor_count = 1;
    runner_end
        .send(&IpcRequest::RunJob(request.clone()), &[tmp.as_file().as_fd()])
        .unwrap();
    let (received, mut handles) = worker_end.recv::<IpcRequest>().unwrap().unwrap();
    assert_eq!(received, IpcRequest::RunJob(request));
    assert_eq!(handles.len(), 1);
    let handle = handles.remove(0);
    assert_eq!(handle.is_inheritable(), Ok(false));
    assert_ne!(handle.as_raw(), tmp.as_file().as_raw_fd());
    File::from(handle).write_all(b"through the channel").unwrap();
    assert_eq!(read_tmp_file(&tmp), "through the channel");
}

#[test]
fn messages_keep_their_order() {
    let (mut runner_end, mut worker_end) = IpcChannel::new().unwrap();
    for code in 0..10 {
        let result = JobResult {
            exit_code: code,
            ..Default::default()
        };
        worker_end
            .send(&IpcResponse::JobCompleted(result), &[])
            .unwrap();
    }
    for code in 0..10 {
        match runner_end.recv::<IpcResponse>() {
            Ok(Some((IpcResponse::JobCompleted(result), handles))) => {
                assert_eq!(result.exit_code, code);
                assert!(handles.is_empty());
            }
            other => panic!("unexpected message {:?}", other),
        }
    }
}

#[test]
fn large_results_are_not_truncated() {
    let (mut runner_end, mut worker_end) = IpcChannel::new().unwrap();
    let stdout = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect::<Vec<u8>>();
    let result = JobResult {
        exit_code: 0,
        stdout: Some(stdout),
        stderr: Some(vec![]),
    };
    let expected = result.clone();
    let sender = std::thread::spawn(move || {
        worker_end
            .send(&IpcResponse::JobCompleted(result), &[])
            .unwrap();
    });
    let (received, _) = runner_end.recv::<IpcResponse>().unwrap().unwrap();
    sender.join().unwrap();
    assert_eq!(received, IpcResponse::JobCompleted(expected));
}

#[test]
fn peer_close_between_messages() {
    let (mut runner_end, worker_end) = IpcChannel::new().unwrap();
    drop(worker_end);
    assert_eq!(runner_end.recv::<IpcResponse>(), Ok(None));
}

#[test]
fn peer_close_in_the_middle_of_a_frame() {
    let (mut runner_end, worker_end) = IpcChannel::new().unwrap();
    let mut partial = 100u32.to_le_bytes().to_vec();
    partial.extend_from_slice(&[0u8; 10]);
    send_raw(&worker_end, &partial);
    drop(worker_end);
    assert_eq!(
        runner_end.recv::<IpcResponse>(),
        Err(IpcError::UnexpectedEndOfStream)
    );
}

#[test]
fn oversized_frame_is_rejected() {
    let (mut runner_end, worker_end) = IpcChannel::new().unwrap();
    send_raw(&worker_end, &u32::MAX.to_le_bytes());
    assert!(matches!(
        runner_end.recv::<IpcResponse>(),
        Err(IpcError::PayloadTooBigToTransmit { .. })
    ));
}

#[test]
fn malformed_payload_is_rejected() {
    let (mut runner_end, worker_end) = IpcChannel::new().unwrap();
    let mut frame = 2u32.to_le_bytes().to_vec();
    frame.extend_from_slice(&[0x2a, 0x2a]);
    send_raw(&worker_end, &frame);
    assert!(matches!(
        runner_end.recv::<IpcResponse>(),
        Err(IpcError::InternalDeserializationError { .. })
    ));
}

#[test]
fn too_many_descriptors() {
    let (mut runner_end, _worker_end) = IpcChannel::new().unwrap();
    let tmp = open_tmp_file();
    let fds = vec![tmp.as_file().as_fd(); MAX_HANDLES_PER_MESSAGE + 1];
    assert_eq!(
        runner_end.send(&IpcRequest::RunJob(JobRequest::new(vec![])), &fds),
        Err(IpcError::TooManyHandles {
            count: MAX_HANDLES_PER_MESSAGE + 1,
            max: MAX_HANDLES_PER_MESSAGE
        })
    );
}

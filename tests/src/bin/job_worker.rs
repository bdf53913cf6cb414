use common::common_test_setup;
use log::error;
use std::io::{self, Read, Write};
use warmfork_worker::{serve_from_env, JobContext, JobError, Termination};

const FLOOD_CHUNK_LEN: usize = 64 * 1024;
const FLOOD_CHUNKS: usize = 16;

fn list_descriptors() -> Result<(), JobError> {
    let mut lines = vec![];
    for entry in std::fs::read_dir("/proc/self/fd/")? {
        let entry = entry?;
        let target = match std::fs::read_link(entry.path()) {
            Ok(target) => target,
            // The descriptor used to list the directory itself, already closed
            Err(_) => continue,
        };
        let target = target.to_string_lossy().into_owned();
        if target.starts_with("/proc/") {
            continue;
        }
        lines.push(format!("{} {}", entry.file_name().to_string_lossy(), target));
    }
    for line in lines {
        println!("{}", line);
    }
    Ok(())
}

fn run(ctx: &JobContext) -> Result<Termination, JobError> {
    let argv = ctx.argv();
    let arg = |i: usize| argv.get(i).map(String::as_str).unwrap_or("");
    match arg(0) {
        "success" => (),
        "fail" => {
            println!("failing");
            return Ok(Termination::Exit(1));
        }
        "exit" => return Ok(arg(1).parse::<i32>()?.into()),
        "panic" => panic!("job panicked on purpose"),
        "error" => return Err("job failed on purpose".into()),
        "reason" => return Ok(Termination::Reason(arg(1).to_owned())),
        "abort" => std::process::abort(),
        "output" => {
            let mut stdout = io::stdout();
            stdout.write_all(b"outputting\n")?;
            stdout.flush()?;
            io::stderr().write_all(b"erroring\n")?;
        }
        "cat" => {
            let mut buf = vec![];
            io::stdin().read_to_end(&mut buf)?;
            io::stdout().write_all(&buf)?;
        }
        "flood" => {
            let (out_chunk, err_chunk) = (vec![b'o'; FLOOD_CHUNK_LEN], vec![b'e'; FLOOD_CHUNK_LEN]);
            let (mut stdout, mut stderr) = (io::stdout(), io::stderr());
            for _ in 0..FLOOD_CHUNKS {
                stdout.write_all(&out_chunk)?;
                stderr.write_all(&err_chunk)?;
            }
        }
        "pwd" => println!("{}", std::env::current_dir()?.display()),
        "env" => match ctx.var(arg(1)) {
            Some(value) => println!("{}", value),
            None => println!("not set"),
        },
        "env-count" => println!("{}", ctx.env().len()),
        "process-env" => match std::env::var(arg(1)) {
            Ok(value) => println!("{}", value),
            Err(_) => println!("not set"),
        },
        "spawn-env" => {
            let output = std::process::Command::new("/usr/bin/env").output()?;
            io::stdout().write_all(&output.stdout)?;
        }
        "fds" => list_descriptors()?,
        "pid" => println!("{}", std::process::id()),
        "ppid" => println!("{}", std::os::unix::process::parent_id()),
        "program" => println!("{}", ctx.program().display()),
        "argv" => println!("{}", argv.join(" ")),
        other => return Ok(Termination::Reason(format!("unknown job {:?}", other))),
    }
    Ok(Termination::Success)
}

fn main() {
    common_test_setup();
    if let Err(e) = serve_from_env(&run) {
        error!("Worker failed: {}", e);
        std::process::exit(1);
    }
}

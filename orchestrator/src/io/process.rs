//! Child process plumbing for long-lived jobs: spawning with piped streams,
//! line readers that never block the child, and exit-status decoding.
//!
//! On unix every job runs in its own process group so that everything it
//! forks can be killed together.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, warn};

/// Lines longer than this are cut (the rest of the line is still drained).
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// A spawned child with its output pipes taken.
pub struct SpawnedChild {
    pub child: Child,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Spawn `cmd` with piped stdout/stderr.
///
/// When `stdin` is given it is written from a detached thread and the pipe is
/// closed afterwards, so a child that never reads its input cannot stall the caller.
pub fn spawn_piped(mut cmd: Command, stdin: Option<Vec<u8>>) -> Result<SpawnedChild> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        thread::spawn(move || {
            if let Err(e) = child_stdin.write_all(&input) {
                warn!(err = %e, "failed to write child stdin");
            }
        });
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    Ok(SpawnedChild {
        child,
        stdout,
        stderr,
    })
}

/// Read `reader` line by line until EOF, handing each line to `on_line`.
///
/// Lines are decoded lossily and stripped of their terminator. At most
/// [`MAX_LINE_BYTES`] of a line are buffered; the remainder is skipped. Returns
/// the number of lines read.
pub fn read_lines<R: Read>(reader: R, mut on_line: impl FnMut(String)) -> Result<u64> {
    let mut buf_reader = BufReader::new(reader);
    let mut count = 0u64;
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = read_capped_line(&mut buf_reader, &mut line).context("read line")?;
        if n == 0 {
            break;
        }
        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        on_line(String::from_utf8_lossy(&line).into_owned());
        count += 1;
    }
    Ok(count)
}

/// `read_until(b'\n')` that never holds more than `MAX_LINE_BYTES + 1` bytes.
fn read_capped_line<R: BufRead>(reader: &mut R, line: &mut Vec<u8>) -> io::Result<usize> {
    let limit = MAX_LINE_BYTES as u64 + 1;
    let n = reader.by_ref().take(limit).read_until(b'\n', line)?;
    if line.last() == Some(&b'\n') || line.len() <= MAX_LINE_BYTES {
        return Ok(n);
    }
    line.truncate(MAX_LINE_BYTES);
    skip_line(reader)?;
    Ok(n)
}

/// Consume input up to and including the next newline (or EOF).
fn skip_line<R: BufRead>(reader: &mut R) -> io::Result<()> {
    loop {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            return Ok(());
        }
        match buf.iter().position(|&b| b == b'\n') {
            Some(idx) => {
                reader.consume(idx + 1);
                return Ok(());
            }
            None => {
                let len = buf.len();
                reader.consume(len);
            }
        }
    }
}

/// Spawn a reader thread over `reader`.
pub fn spawn_line_reader<R: Read + Send + 'static>(
    name: &str,
    reader: R,
    on_line: impl FnMut(String) + Send + 'static,
) -> Result<thread::JoinHandle<Result<u64>>> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || read_lines(reader, on_line))
        .with_context(|| format!("spawn {name} thread"))
}

pub fn join_reader(handle: thread::JoinHandle<Result<u64>>) -> Result<u64> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Join reader threads, giving up on any still running at `deadline`.
///
/// A reader keeps going for as long as some process holds the write end of its
/// pipe. Readers that miss the deadline are detached and reported as errors.
pub fn join_readers_until(
    handles: Vec<thread::JoinHandle<Result<u64>>>,
    deadline: Instant,
) -> Vec<Result<u64>> {
    let mut pending = handles;
    let mut results = Vec::new();
    loop {
        let (done, running): (Vec<_>, Vec<_>) =
            pending.into_iter().partition(|handle| handle.is_finished());
        results.extend(done.into_iter().map(join_reader));
        if running.is_empty() {
            return results;
        }
        if Instant::now() >= deadline {
            results.extend(
                running
                    .iter()
                    .map(|_| Err(anyhow!("output reader still open at deadline, detached"))),
            );
            return results;
        }
        pending = running;
        thread::sleep(Duration::from_millis(10));
    }
}

/// Kill `child` together with every process in its group, then reap it.
///
/// The group is signalled before the leader is reaped, so its id cannot have
/// been reused yet.
pub fn kill_process_tree(child: &mut Child) -> Option<ExitStatus> {
    #[cfg(unix)]
    kill_group(child.id());
    if let Err(err) = child.kill() {
        debug!(err = %err, "kill failed (child may have exited)");
    }
    child.wait().ok()
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn kill_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: killpg takes plain integers and touches no memory of ours.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(pgid, err = %io::Error::last_os_error(), "killpg failed (group may be gone)");
    }
}

/// Exit code, or the negated signal number when the child was killed by a signal.
pub fn exit_code(status: &ExitStatus) -> Option<i32> {
    if let Some(code) = status.code() {
        return Some(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Some(-signal);
        }
    }
    None
}

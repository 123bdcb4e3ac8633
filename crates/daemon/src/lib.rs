//! `procpool-daemon` is the daemon-spawning primitive: it forks/execs a
//! child from an executable path and hands back a duplex byte channel plus
//! the child's PID.
//!
//! The pool controller (`procpool-pool`) treats this crate as a given
//! capability, exactly as the specification asks: nothing here decides
//! *what* a child should do, only *how* one gets started and reaped.

#![deny(unused)]
#![deny(warnings)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]
#![deny(rustdoc::missing_crate_level_docs)]
#![deny(rustdoc::invalid_codeblock_attributes)]
#![deny(rustdoc::invalid_rust_codeblocks)]

use std::{
    io,
    path::Path,
    process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio},
};

use procpool_errors::WorkerFailure;
use procpool_wire::{read_frame, write_frame, WorkerParams};
use serde::{de::DeserializeOwned, Serialize};

#[cfg(unix)]
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

/// The duplex byte channel between the controller and one child.
///
/// Framing is handled by [`procpool_wire`]; this type only owns the two
/// halves of the pipe the daemon primitive connected.
#[derive(Debug)]
pub struct Channel {
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl Channel {
    /// Write one frame, blocking until it has been handed to the kernel.
    pub fn send<T>(&mut self, value: &T) -> io::Result<()>
    where
        T: Serialize,
    {
        write_frame(&mut self.stdin, value)
    }

    /// Block reading one frame.
    ///
    /// Returns [`io::ErrorKind::UnexpectedEof`] if the peer closed its end
    /// before a complete frame arrived; callers map that to a worker
    /// failure.
    pub fn recv<T>(&mut self) -> io::Result<T>
    where
        T: DeserializeOwned,
    {
        read_frame(&mut self.stdout)
    }

    /// Borrow the read half, for the readiness multiplexer to poll.
    pub fn stdout(&self) -> &ChildStdout {
        &self.stdout
    }
}

/// A child process, connected by a [`Channel`], as produced by [`spawn`].
#[derive(Debug)]
pub struct SpawnedChild {
    /// The duplex channel to this child.
    pub channel: Channel,
    /// The OS process handle, kept around so it can be waited on or killed.
    pub child: Child,
    /// The child's process id, used to identify it in error messages and
    /// logs.
    pub pid: u32,
}

/// A pipe a worker's child can poll for end-of-file to learn that the
/// controller process itself has died, independent of whatever is (or
/// isn't) happening on its own request/response [`Channel`].
///
/// The controller keeps the write end open for as long as it is alive;
/// [`LivenessPipe::read_fd`] gives the raw fd number a child should inherit
/// across `fork`/`exec`. No `dup2` is needed: `std::process::Command`
/// leaves file descriptors that were never marked close-on-exec open in the
/// child, at the same fd number they had in the parent, so every child
/// spawned from one controller observes the same fd.
#[cfg(unix)]
pub struct LivenessPipe {
    read: OwnedFd,
    write: Option<OwnedFd>,
}

#[cfg(unix)]
impl LivenessPipe {
    /// Open a fresh pipe. Both ends start open.
    pub fn new() -> io::Result<Self> {
        let (read, write) = rustix::pipe::pipe()?;
        Ok(Self { read, write: Some(write) })
    }

    /// The raw fd number a spawned child should poll for readability (a
    /// read returning end-of-file, or a `POLLHUP`, means the controller is
    /// gone). Stays valid for the lifetime of this `LivenessPipe`.
    pub fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Close the write end, so every child polling [`LivenessPipe::read_fd`]
    /// observes end-of-file. Idempotent.
    pub fn close(&mut self) {
        self.write = None;
    }
}

/// Spawn `executable`, connect a pair of pipes to its stdin/stdout, and send
/// it the initial [`WorkerParams`] handshake frame.
///
/// The child's stderr is inherited so that anything it logs lands next to
/// the controller's own output; the core does not interpret it.
pub fn spawn(executable: &Path, params: &WorkerParams) -> io::Result<SpawnedChild> {
    let mut child = Command::new(executable)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()?;

    let stdin = child.stdin.take().expect("stdin was requested as piped");
    let stdout = child.stdout.take().expect("stdout was requested as piped");
    let pid = child.id();

    let mut channel = Channel { stdin, stdout };
    channel.send(params)?;

    tracing::debug!(pid, longlived = params.longlived, "spawned worker child");

    Ok(SpawnedChild { channel, child, pid })
}

/// Ask a child to terminate immediately (SIGKILL-class) and reap it.
///
/// Idempotent: killing an already-dead child is not an error.
pub fn kill(spawned: &mut SpawnedChild) -> io::Result<()> {
    match spawned.child.kill() {
        Ok(()) => {}
        Err(error) if error.kind() == io::ErrorKind::InvalidInput => {
            // Already reaped; `Child::kill` surfaces this as `InvalidInput`
            // on some platforms instead of succeeding silently.
        }
        Err(error) => return Err(error),
    }

    spawned.child.wait()?;

    tracing::debug!(pid = spawned.pid, "force-quit worker child");

    Ok(())
}

/// Map an observed [`ExitStatus`] to a [`WorkerFailure`], per the
/// controller's process-exit status mapping:
///
/// - a terminating signal matching the platform's out-of-memory kill maps to
///   [`WorkerFailure::Oomed`],
/// - any other terminating signal maps to [`WorkerFailure::Signaled`],
/// - a zero or non-zero exit status maps to [`WorkerFailure::Quit`].
pub fn exit_status_to_failure(status: ExitStatus) -> WorkerFailure {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;

        if let Some(signal) = status.signal() {
            return if signal == oom_kill_signal() {
                WorkerFailure::Oomed
            } else {
                WorkerFailure::Signaled(signal)
            };
        }
    }

    WorkerFailure::Quit(status.code().unwrap_or(-1))
}

/// The signal the Linux OOM killer (and most other Unixes) uses to
/// terminate a process it has selected: `SIGKILL`. There is no portable way
/// to distinguish "killed because the OOM killer picked this process" from
/// "killed because something else sent `SIGKILL`"; this is the same
/// heuristic the specification's source system uses.
#[cfg(unix)]
fn oom_kill_signal() -> i32 {
    const SIGKILL: i32 = 9;
    SIGKILL
}

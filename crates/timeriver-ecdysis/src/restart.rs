//! Successor spawning with file descriptor passing.
//!
//! The running process exports its sockets as a [`Handoff`], then spawns a
//! fresh copy of its own binary with those descriptors placed at
//! `LISTEN_FDS_START..` and the manifest in `TIMERIVER_GRACEFUL_PROTOS`. The
//! parent keeps running to drain its in-flight connections.

use std::ffi::OsString;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command};

use tracing::{error, info};

use crate::manifest::{Handoff, GRACEFUL_PROTOS_ENV, LISTEN_FDS_START};

/// Error returned when the successor could not be started.
/// Carries the handoff back so the caller can resume serving on it.
#[derive(Debug)]
pub struct RestartError {
    /// The sockets that were going to be passed to the successor.
    pub handoff: Handoff,
    /// The underlying error.
    pub error: std::io::Error,
}

impl std::fmt::Display for RestartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Restart failed: {}", self.error)
    }
}

impl std::error::Error for RestartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Spawn the current executable, with the same arguments, as the successor.
pub fn spawn_successor(handoff: Handoff) -> Result<Child, RestartError> {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(error) => return Err(RestartError { handoff, error }),
    };
    let args: Vec<OsString> = std::env::args_os().skip(1).collect();
    spawn_program(&exe, &args, handoff)
}

/// Spawn `program` as the successor, passing the handoff's descriptors.
///
/// 1. Dups every source fd to a high range with CLOEXEC (safe against clobber)
/// 2. In the child, dup2s each temp fd onto `LISTEN_FDS_START + N`, which
///    clears CLOEXEC on the target so it survives exec
/// 3. Sets `TIMERIVER_GRACEFUL_PROTOS` to the handoff's manifest
///
/// The parent's own descriptors stay open and owned by `handoff`, which is
/// returned inside the error if spawning fails.
pub fn spawn_program(
    program: &Path,
    args: &[OsString],
    handoff: Handoff,
) -> Result<Child, RestartError> {
    let manifest = handoff.manifest();

    // Phase 1: Dup all source fds above the target range first. If a source
    // fd sits at 4 and another socket must land on 4, dup2 would destroy it.
    let high_base = (LISTEN_FDS_START + handoff.len() as RawFd).max(100);
    let sources: Vec<(String, RawFd)> = handoff
        .entries()
        .iter()
        .map(|(protocol, fd)| (protocol.clone(), fd.as_raw_fd()))
        .collect();

    let mut temp_fds: Vec<OwnedFd> = Vec::with_capacity(sources.len());
    for (protocol, source_fd) in &sources {
        let temp_fd = unsafe { libc::fcntl(*source_fd, libc::F_DUPFD_CLOEXEC, high_base) };
        if temp_fd < 0 {
            let error = std::io::Error::last_os_error();
            error!(protocol = %protocol, fd = *source_fd, error = %error, "fcntl F_DUPFD_CLOEXEC failed");
            return Err(RestartError { handoff, error });
        }
        // SAFETY: fcntl just returned this fd to us; nothing else owns it.
        temp_fds.push(unsafe { OwnedFd::from_raw_fd(temp_fd) });
    }

    let moves: Vec<(RawFd, RawFd)> = temp_fds
        .iter()
        .enumerate()
        .map(|(i, temp)| (temp.as_raw_fd(), LISTEN_FDS_START + i as RawFd))
        .collect();

    info!(
        exe = %program.display(),
        fds = ?moves.iter().map(|(_, target)| *target).collect::<Vec<_>>(),
        protocols = %manifest,
        "Spawning successor process"
    );

    let mut command = Command::new(program);
    command.args(args).env(GRACEFUL_PROTOS_ENV, manifest.to_string());

    // Phase 2 runs in the forked child before exec. Only dup2 is called,
    // which is async-signal-safe.
    unsafe {
        command.pre_exec(move || {
            for (temp_fd, target_fd) in &moves {
                if libc::dup2(*temp_fd, *target_fd) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }

    let result = command.spawn();
    drop(temp_fds);

    match result {
        Ok(child) => {
            info!(pid = child.id(), "Successor process started");
            Ok(child)
        }
        Err(error) => Err(RestartError { handoff, error }),
    }
}

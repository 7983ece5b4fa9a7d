//! Subprocess launcher for the server's command/shell forward.
//!
//! The child gets one end of a stream socketpair as stdin/stdout/stderr;
//! the session relays through the other end, so `fd_in == fd_out`.

use std::{
    env, io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    process::{Child, Command, Stdio},
};

use tracing::debug;

use crate::fdio;

/// Spawns `cmd` under `/bin/sh -c`, or the user's shell when no command
/// was given. Returns the parent's (non-blocking) end of the pair plus the
/// child handle for reaping.
pub fn spawn(cmd: Option<&str>, interactive: bool) -> io::Result<(OwnedFd, Child)> {
    let (parent, child_end) = socketpair()?;

    let mut command = match cmd {
        Some(cmd) => {
            let mut c = Command::new("/bin/sh");
            c.arg("-c").arg(cmd);
            c
        }
        None => {
            let shell = env::var("SHELL").unwrap_or_else(|_| "/bin/sh".into());
            let mut c = Command::new(shell);
            if interactive {
                c.arg("-il");
            }
            c
        }
    };

    command
        .stdin(Stdio::from(child_end.try_clone()?))
        .stdout(Stdio::from(child_end.try_clone()?))
        .stderr(Stdio::from(child_end));

    let child = command.spawn()?;
    debug!(pid = child.id(), "forward subprocess spawned");

    fdio::set_nonblocking(parent.as_raw_fd())?;
    Ok((parent, child))
}

fn socketpair() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0; 2];
    let rc = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: the kernel just handed us two fresh descriptors.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

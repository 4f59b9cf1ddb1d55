use std::{
    ffi::CString,
    io,
    mem::MaybeUninit,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
};

use crate::cutils::{cerr, sysconf};

pub mod interface;
pub mod poll;
pub mod queue;
pub mod signal;
pub mod term;
pub mod wait;
pub mod wake;

use interface::ProcessId;
use signal::SignalNumber;

pub(crate) enum ForkResult {
    // Parent process branch with the child process' PID.
    Parent(ProcessId),
    // Child process branch.
    Child,
}

/// Create a new process.
///
/// # Safety
///
/// In a multithreaded program, only async-signal-safe functions are
/// guaranteed to work in the child process until a call to `execve` or a
/// similar function is done.
pub(crate) unsafe fn fork() -> io::Result<ForkResult> {
    // SAFETY: fork itself cannot cause UB; the caller upholds the contract
    // for the child branch.
    let pid = cerr(unsafe { libc::fork() })?;
    if pid == 0 {
        Ok(ForkResult::Child)
    } else {
        Ok(ForkResult::Parent(ProcessId::new(pid)))
    }
}

pub(crate) fn _exit(status: libc::c_int) -> ! {
    // SAFETY: _exit cannot cause UB
    unsafe { libc::_exit(status) }
}

/// Get the process ID of the current process.
pub(crate) fn getpid() -> ProcessId {
    // SAFETY: getpid cannot cause UB
    ProcessId::new(unsafe { libc::getpid() })
}

/// Get the process group ID of the current process.
pub(crate) fn getpgrp() -> ProcessId {
    // SAFETY: getpgrp cannot cause UB
    ProcessId::new(unsafe { libc::getpgrp() })
}

/// Set a process group ID.
pub(crate) fn setpgid(pid: ProcessId, pgid: ProcessId) -> io::Result<()> {
    // SAFETY: this function cannot cause UB even for invalid IDs
    cerr(unsafe { libc::setpgid(pid.get(), pgid.get()) }).map(|_| ())
}

/// Send a signal to a process with the specified ID.
pub(crate) fn kill(pid: ProcessId, signal: SignalNumber) -> io::Result<()> {
    // SAFETY: this function cannot cause UB even if `pid` is not a valid process ID or if
    // `signal` is not a valid signal code.
    cerr(unsafe { libc::kill(pid.get(), signal) }).map(|_| ())
}

/// Send a signal to a process group with the specified ID.
pub(crate) fn killpg(pgid: ProcessId, signal: SignalNumber) -> io::Result<()> {
    // SAFETY: this function cannot cause UB even if `pgid` is not a valid group ID
    cerr(unsafe { libc::killpg(pgid.get(), signal) }).map(|_| ())
}

/// Create a pipe with both ends close-on-exec. Returns `(read, write)`
/// ends.
///
/// Every pipe this crate creates is close-on-exec: descriptors that must
/// survive into a child are dup2'ed onto the standard streams, which clears
/// the flag on the copy. Anything else leaking past exec would keep sibling
/// pipes from ever delivering EOF.
pub(crate) fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0; 2];
    // SAFETY: `fds` is a valid pointer to an array of two integers
    cerr(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
    // SAFETY: pipe succeeded, so both fds are open and owned by us
    let (rx, tx) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    set_cloexec(&rx)?;
    set_cloexec(&tx)?;
    Ok((rx, tx))
}

/// Set `O_NONBLOCK` on a file descriptor.
pub(crate) fn set_nonblocking<F: AsRawFd>(fd: &F) -> io::Result<()> {
    let fd = fd.as_raw_fd();
    // SAFETY: F_GETFL/F_SETFL on an owned descriptor cannot cause UB
    let flags = cerr(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    cerr(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    Ok(())
}

/// Set `FD_CLOEXEC` on a file descriptor.
pub(crate) fn set_cloexec<F: AsRawFd>(fd: &F) -> io::Result<()> {
    let fd = fd.as_raw_fd();
    // SAFETY: F_GETFD/F_SETFD on an owned descriptor cannot cause UB
    let flags = cerr(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    cerr(unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) })?;
    Ok(())
}

/// Was this I/O error the result of an interrupted syscall?
pub(crate) fn was_interrupted(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::Interrupted
}

pub(crate) fn retry_while_interrupted<T>(mut f: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match f() {
            Err(err) if was_interrupted(&err) => {}
            result => return result,
        }
    }
}

fn with_passwd<T>(
    name: Option<&str>,
    f: impl FnOnce(&libc::passwd) -> io::Result<T>,
) -> io::Result<T> {
    let max_pw_size = sysconf(libc::_SC_GETPW_R_SIZE_MAX).unwrap_or(16_384);
    let mut buf = vec![0; max_pw_size as usize];
    let mut pwd = MaybeUninit::uninit();
    let mut pwd_ptr = std::ptr::null_mut();

    match name {
        Some(name) => {
            let name_c = CString::new(name)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "nul in user name"))?;
            // SAFETY: `name_c` lives for the duration of the call and the buffer sizes match
            cerr(unsafe {
                libc::getpwnam_r(
                    name_c.as_ptr(),
                    pwd.as_mut_ptr(),
                    buf.as_mut_ptr(),
                    buf.len(),
                    &mut pwd_ptr,
                )
            })?;
        }
        None => {
            // SAFETY: getuid cannot cause UB; the buffer sizes match
            cerr(unsafe {
                libc::getpwuid_r(
                    libc::getuid(),
                    pwd.as_mut_ptr(),
                    buf.as_mut_ptr(),
                    buf.len(),
                    &mut pwd_ptr,
                )
            })?;
        }
    }

    if pwd_ptr.is_null() {
        return Err(io::Error::new(io::ErrorKind::NotFound, "no such user"));
    }
    // SAFETY: pwd_ptr is non-null, so the lookup filled in `pwd`
    f(&unsafe { pwd.assume_init() })
}

/// Resolve a user name (or the current real user when `None`) to its uid.
pub fn user_id(name: Option<&str>) -> io::Result<libc::uid_t> {
    if name.is_none() {
        // SAFETY: getuid cannot cause UB
        return Ok(unsafe { libc::getuid() });
    }
    with_passwd(name, |pwd| Ok(pwd.pw_uid))
}

/// Resolve the group list of a user name (or the current real user when
/// `None`).
pub fn user_groups(name: Option<&str>) -> io::Result<Vec<libc::gid_t>> {
    with_passwd(name, |pwd| {
        let mut buf_len: libc::c_int = 32;
        let mut groups_buffer: Vec<libc::gid_t>;

        while {
            groups_buffer = vec![0; buf_len as usize];
            // SAFETY: pw_name comes from a successful getpw call and the buffer matches buf_len
            let result = unsafe {
                libc::getgrouplist(
                    pwd.pw_name,
                    pwd.pw_gid,
                    groups_buffer.as_mut_ptr().cast(),
                    &mut buf_len,
                )
            };

            result == -1
        } {
            if buf_len >= 65536 {
                return Err(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    "user has too many groups",
                ));
            }

            buf_len *= 2;
        }

        groups_buffer.truncate(buf_len as usize);
        Ok(groups_buffer)
    })
}

#[cfg(test)]
mod tests {
    use super::{user_groups, user_id};

    #[test]
    fn current_user_resolves() {
        let uid = user_id(None).unwrap();
        // SAFETY: getuid cannot cause UB
        assert_eq!(uid, unsafe { libc::getuid() });

        let gids = user_groups(None).unwrap();
        assert!(!gids.is_empty());
    }

    #[test]
    fn unknown_user_fails() {
        let err = user_id(Some("no-such-user-exists-here")).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn root_is_uid_zero() {
        assert_eq!(user_id(Some("root")).unwrap(), 0);
    }
}

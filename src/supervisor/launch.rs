//! The fork/exec handshake.
//!
//! A CLOEXEC pipe is the child's failure channel: if exec succeeds the
//! kernel closes the write end and the parent sees EOF; if exec or a
//! redirection open fails the child writes a sentinel byte. This is the only
//! reliable way to tell the two apart without racing waitpid against pid
//! reuse.

use std::{
    ffi::{c_char, CString},
    io,
    os::fd::{AsRawFd, OwnedFd, RawFd},
    sync::Mutex,
};

use crate::common::Error;
use crate::cutils::cerr;
use crate::log::{dev_info, dev_warn};
use crate::system::interface::ProcessId;
use crate::system::poll::{PollEvent, PollSet};
use crate::system::signal::consts::*;
use crate::system::term::Terminal;
use crate::system::wait::{Wait, WaitOptions};
use crate::system::{
    _exit, fork, getpid, pipe, retry_while_interrupted, set_nonblocking, setpgid, ForkResult,
};

use super::redirect::Redirection;
use super::{Interactive, LaunchOptions};

static FORK_LOCK: Mutex<()> = Mutex::new(());

/// Parent-side remains of a successful launch.
pub(crate) struct Spawned {
    pub(crate) pid: ProcessId,
    pub(crate) pgid: ProcessId,
    pub(crate) stdin: Option<OwnedFd>,
    pub(crate) stdout: Option<OwnedFd>,
    pub(crate) stderr: Option<OwnedFd>,
}

fn make_pipe_pair(wanted: bool) -> Result<(Option<OwnedFd>, Option<OwnedFd>), Error> {
    if wanted {
        let (r, w) = pipe().map_err(Error::Pipe)?;
        Ok((Some(r), Some(w)))
    } else {
        Ok((None, None))
    }
}

/// Fork, set up the child, exec, and wait for the handshake verdict.
///
/// `registry_fds` is a pre-fork snapshot of the supervisor's fd registry;
/// the child iterates it without locking.
pub(crate) fn launch_child(
    cmd: &str,
    args: &[String],
    env: &[(String, String)],
    opts: &LaunchOptions,
    redirs: &[Redirection],
    registry_fds: &[RawFd],
) -> Result<Spawned, Error> {
    // Everything the child needs is allocated before fork; between fork and
    // exec only async-signal-safe calls are allowed.
    let cmd_c =
        CString::new(cmd).map_err(|_| Error::BadArgument("nul byte in command"))?;

    let mut argv_c = Vec::with_capacity(args.len() + 1);
    argv_c.push(cmd_c.clone());
    for arg in args {
        argv_c.push(
            CString::new(arg.as_str())
                .map_err(|_| Error::BadArgument("nul byte in argument"))?,
        );
    }
    let mut argv_ptrs: Vec<*const c_char> = argv_c.iter().map(|s| s.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());

    let mut env_c = Vec::with_capacity(env.len());
    for (key, value) in env {
        env_c.push(
            CString::new(format!("{key}={value}"))
                .map_err(|_| Error::BadArgument("nul byte in environment"))?,
        );
    }
    let mut env_ptrs: Vec<*const c_char> = env_c.iter().map(|s| s.as_ptr()).collect();
    env_ptrs.push(std::ptr::null());

    // Serialise pipe creation and fork across launches: a concurrent fork
    // between another launch's pipe() and its registry entry would hand
    // that child descriptors nobody will close.
    let fork_guard = FORK_LOCK.lock().unwrap();

    // The run pipe is close-on-exec like every other pipe here; that flag
    // is the success signal.
    let (run_r, run_w) = pipe().map_err(Error::Pipe)?;

    let (stdin_r, stdin_w) = make_pipe_pair(opts.redirect_stdin)?;
    let (stdout_r, stdout_w) = make_pipe_pair(opts.redirect_stdout)?;
    let (stderr_r, stderr_w) = make_pipe_pair(opts.redirect_stderr)?;

    let interactive = opts.interactive;

    // SAFETY: the child branch below only calls async-signal-safe functions
    // (signal, close, dup/dup2, setpgid, tcsetpgrp, open, write, execve,
    // _exit) until exec.
    match unsafe { fork() }.map_err(Error::ForkFailed)? {
        ForkResult::Child => child_exec(ChildSetup {
            cmd: &cmd_c,
            argv: &argv_ptrs,
            envp: &env_ptrs,
            interactive,
            run_r: run_r.as_raw_fd(),
            run_w: run_w.as_raw_fd(),
            stdin_pipe: raw_pair(&stdin_r, &stdin_w),
            stdout_pipe: raw_pair(&stdout_r, &stdout_w),
            stderr_pipe: raw_pair(&stderr_r, &stderr_w),
            original_stdout: opts.original_stdout,
            original_stderr: opts.original_stderr,
            registry_fds,
            redirs,
        }),
        ForkResult::Parent(pid) => {
            drop(fork_guard);

            let pgid = match interactive {
                Some(Interactive { foreground, pgid }) => {
                    let pgid = pgid.unwrap_or(pid);
                    // Both sides call setpgid to close the window where
                    // neither has run yet; losing the race is expected.
                    if let Err(err) = setpgid(pid, pgid) {
                        dev_info!("cannot set process group of {pid}: {err}");
                    }
                    if foreground {
                        if let Err(err) = io::stdin().tcsetpgrp(pgid) {
                            dev_warn!("cannot hand terminal to {pgid}: {err}");
                        }
                    }
                    pgid
                }
                None => pid,
            };

            // Close the child's ends; only the parent ends stay with us.
            drop(run_w);
            drop(stdin_r);
            drop(stdout_w);
            drop(stderr_w);

            if !wait_for_exec(&run_r) {
                // The child is already a zombie; reap it here so the worker
                // never sees an unenrolled pid.
                let _ = pid.wait(WaitOptions::new());
                return Err(Error::ExecFailed);
            }

            for fd in [&stdin_w, &stdout_r, &stderr_r].into_iter().flatten() {
                set_nonblocking(fd).map_err(Error::Pipe)?;
            }

            Ok(Spawned {
                pid,
                pgid,
                stdin: stdin_w,
                stdout: stdout_r,
                stderr: stderr_r,
            })
        }
    }
}

fn raw_pair(r: &Option<OwnedFd>, w: &Option<OwnedFd>) -> Option<(RawFd, RawFd)> {
    match (r, w) {
        (Some(r), Some(w)) => Some((r.as_raw_fd(), w.as_raw_fd())),
        _ => None,
    }
}

/// Block until the run pipe delivers its verdict: EOF means exec succeeded
/// (CLOEXEC closed the write end), a byte means the child failed.
fn wait_for_exec(run_r: &OwnedFd) -> bool {
    let mut poll_set = PollSet::new();
    poll_set.insert((), run_r, PollEvent::Readable);
    if poll_set.poll().is_err() {
        return false;
    }

    let mut byte = [0u8; 1];
    match retry_while_interrupted(|| {
        // SAFETY: we read into a valid one-byte buffer
        cerr(unsafe { libc::read(run_r.as_raw_fd(), byte.as_mut_ptr().cast(), 1) })
    }) {
        Ok(0) => true,
        _ => false,
    }
}

struct ChildSetup<'a> {
    cmd: &'a CString,
    argv: &'a [*const c_char],
    envp: &'a [*const c_char],
    interactive: Option<Interactive>,
    run_r: RawFd,
    run_w: RawFd,
    stdin_pipe: Option<(RawFd, RawFd)>,
    stdout_pipe: Option<(RawFd, RawFd)>,
    stderr_pipe: Option<(RawFd, RawFd)>,
    original_stdout: Option<RawFd>,
    original_stderr: Option<RawFd>,
    registry_fds: &'a [RawFd],
    redirs: &'a [Redirection],
}

/// Child-side setup between fork and exec. Never returns.
fn child_exec(setup: ChildSetup<'_>) -> ! {
    // Job control first: take our own group (and the terminal, when
    // foreground) while SIGTTOU is still inherited as ignored from the
    // shell.
    if let Some(Interactive { foreground, pgid }) = setup.interactive {
        let pgid = pgid.unwrap_or_else(getpid);
        let _ = setpgid(ProcessId::new(0), pgid);
        if foreground {
            // SAFETY: tcsetpgrp cannot cause UB
            unsafe { libc::tcsetpgrp(libc::STDIN_FILENO, pgid.get()) };
        }
    }

    // The shell ignores the job-control signals; the child must not.
    for signal in [SIGINT, SIGQUIT, SIGTSTP, SIGTTIN, SIGTTOU, SIGCHLD] {
        // SAFETY: resetting a disposition to SIG_DFL cannot cause UB
        unsafe { libc::signal(signal, libc::SIG_DFL) };
    }

    // SAFETY: close/dup2 on inherited descriptors cannot cause UB
    unsafe {
        libc::close(setup.run_r);

        if let Some((r, w)) = setup.stdin_pipe {
            libc::close(w);
            libc::dup2(r, libc::STDIN_FILENO);
            libc::close(r);
        }
        if let Some((r, w)) = setup.stdout_pipe {
            libc::close(r);
            libc::dup2(w, libc::STDOUT_FILENO);
            libc::close(w);
        } else if let Some(fd) = setup.original_stdout {
            // A launch from a UI front end carries the real terminal here.
            libc::dup2(fd, libc::STDOUT_FILENO);
        }
        if let Some((r, w)) = setup.stderr_pipe {
            libc::close(r);
            libc::dup2(w, libc::STDERR_FILENO);
            libc::close(w);
        } else if let Some(fd) = setup.original_stderr {
            libc::dup2(fd, libc::STDERR_FILENO);
        }

        // Pipes belonging to sibling pipelines must not leak into this
        // child. The slice was snapshotted before fork; no lock is taken.
        for &fd in setup.registry_fds {
            libc::close(fd);
        }
    }

    for redir in setup.redirs {
        if redir.apply_in_child().is_err() {
            child_fail(setup.run_w);
        }
    }

    if setup.stdin_pipe.is_none() {
        // Re-dup stdin over itself through a scratch descriptor; inherited
        // descriptor flags are not otherwise reset on every platform.
        // SAFETY: dup/dup2/close cannot cause UB
        unsafe {
            let fd = libc::dup(libc::STDIN_FILENO);
            if fd != -1 {
                libc::dup2(fd, libc::STDIN_FILENO);
                libc::close(fd);
            }
        }
    }

    // SAFETY: all three pointer arrays are NULL-terminated and outlive the
    // call; on success execve does not return.
    unsafe {
        libc::execve(setup.cmd.as_ptr(), setup.argv.as_ptr(), setup.envp.as_ptr());
    }

    child_fail(setup.run_w)
}

/// Report failure through the run pipe and die without running any atexit
/// handlers or flushing inherited stdio.
fn child_fail(run_w: RawFd) -> ! {
    let byte = [1u8];
    // SAFETY: write/close are async-signal-safe
    unsafe {
        while libc::write(run_w, byte.as_ptr().cast(), 1) == -1
            && std::io::Error::last_os_error().kind() == io::ErrorKind::Interrupted
        {}
        libc::close(run_w);
    }
    _exit(1)
}

//! The stdout/stderr capture shim.
//!
//! On construction the process-wide stdout and stderr are saved aside and
//! replaced with pipe write ends; the editor worker drains the read ends and
//! interleaves the captured bytes with the prompt. The saved descriptors are
//! the "direct write" channel that bypasses the capture.

use std::{
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
};

use crate::cutils::cerr;
use crate::system::{pipe, retry_while_interrupted, set_cloexec, set_nonblocking};

pub(crate) struct Redirector {
    stdout_real: OwnedFd,
    stderr_real: OwnedFd,
    stdout_pipe: (OwnedFd, OwnedFd),
    stderr_pipe: (OwnedFd, OwnedFd),
    dev_null: OwnedFd,
    paused: bool,
}

fn dup(fd: RawFd) -> io::Result<OwnedFd> {
    let new = retry_while_interrupted(|| {
        // SAFETY: dup cannot cause UB
        cerr(unsafe { libc::dup(fd) })
    })?;
    // SAFETY: dup returned a fresh open descriptor we now own
    Ok(unsafe { OwnedFd::from_raw_fd(new) })
}

fn dup2(src: &OwnedFd, dst: RawFd) {
    let _ = retry_while_interrupted(|| {
        // SAFETY: dup2 cannot cause UB
        cerr(unsafe { libc::dup2(src.as_raw_fd(), dst) })
    });
}

impl Redirector {
    pub(crate) fn new() -> io::Result<Self> {
        // Save the real streams first; they are the way back out. Children
        // reach the terminal through dup2 onto their standard streams, so
        // none of these high descriptors may survive an exec.
        let stdout_real = dup(libc::STDOUT_FILENO)?;
        let stderr_real = dup(libc::STDERR_FILENO)?;
        set_cloexec(&stdout_real)?;
        set_cloexec(&stderr_real)?;

        let stdout_pipe = pipe()?;
        let stderr_pipe = pipe()?;
        set_nonblocking(&stdout_pipe.0)?;
        set_nonblocking(&stderr_pipe.0)?;

        dup2(&stdout_pipe.1, libc::STDOUT_FILENO);
        dup2(&stderr_pipe.1, libc::STDERR_FILENO);

        let dev_null = retry_while_interrupted(|| {
            // SAFETY: the path literal is NUL-terminated
            cerr(unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC) })
        })?;
        // SAFETY: open returned a fresh descriptor
        let dev_null = unsafe { OwnedFd::from_raw_fd(dev_null) };

        Ok(Self {
            stdout_real,
            stderr_real,
            stdout_pipe,
            stderr_pipe,
            dev_null,
            paused: false,
        })
    }

    /// Read end of the captured stdout.
    pub(crate) fn stdout_read(&self) -> &OwnedFd {
        &self.stdout_pipe.0
    }

    /// Read end of the captured stderr.
    pub(crate) fn stderr_read(&self) -> &OwnedFd {
        &self.stderr_pipe.0
    }

    fn write_direct(fd: &OwnedFd, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let written = retry_while_interrupted(|| {
                // SAFETY: the buffer is valid for its length
                cerr(unsafe {
                    libc::write(fd.as_raw_fd(), bytes.as_ptr().cast(), bytes.len())
                })
            });
            match written {
                Ok(n) if n > 0 => bytes = &bytes[n as usize..],
                _ => break,
            }
        }
    }

    /// Write straight to the real terminal, bypassing the capture pipes.
    pub(crate) fn write_stdout(&self, bytes: &[u8]) {
        Self::write_direct(&self.stdout_real, bytes);
    }

    /// As [`Redirector::write_stdout`], for stderr.
    pub(crate) fn write_stderr(&self, bytes: &[u8]) {
        Self::write_direct(&self.stderr_real, bytes);
    }

    /// Point stdout/stderr back at the real terminal (the editor's own
    /// output goes direct while paused).
    pub(crate) fn pause(&mut self) {
        if self.paused {
            return;
        }
        self.paused = true;
        dup2(&self.stdout_real, libc::STDOUT_FILENO);
        dup2(&self.stderr_real, libc::STDERR_FILENO);
    }

    /// Point stdout/stderr at /dev/null.
    pub(crate) fn quiet(&mut self) {
        if self.paused {
            return;
        }
        self.paused = true;
        dup2(&self.dev_null, libc::STDOUT_FILENO);
        dup2(&self.dev_null, libc::STDERR_FILENO);
    }

    /// Point stdout/stderr back at the capture pipes.
    pub(crate) fn resume(&mut self) {
        if !self.paused {
            return;
        }
        self.paused = false;
        dup2(&self.stdout_pipe.1, libc::STDOUT_FILENO);
        dup2(&self.stderr_pipe.1, libc::STDERR_FILENO);
    }
}

impl Drop for Redirector {
    fn drop(&mut self) {
        // Put the real descriptors back before the pipes close.
        dup2(&self.stdout_real, libc::STDOUT_FILENO);
        dup2(&self.stderr_real, libc::STDERR_FILENO);
    }
}

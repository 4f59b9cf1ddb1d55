use std::{io, mem::MaybeUninit, os::fd::AsRawFd};

use libc::{ioctl, tcgetattr, tcsetattr, termios, winsize, TIOCGWINSZ};

use crate::common::RestoreMode;
use crate::cutils::{cerr, safe_isatty};
use crate::system::interface::ProcessId;

mod sealed {
    use std::os::fd::AsRawFd;

    pub(crate) trait Sealed {}

    impl<F: AsRawFd> Sealed for F {}
}

pub(crate) trait Terminal: sealed::Sealed {
    fn tcgetpgrp(&self) -> io::Result<ProcessId>;
    fn tcsetpgrp(&self, pgrp: ProcessId) -> io::Result<()>;
    fn is_terminal(&self) -> bool;
}

impl<F: AsRawFd> Terminal for F {
    /// Get the foreground process group ID associated with this terminal.
    fn tcgetpgrp(&self) -> io::Result<ProcessId> {
        // SAFETY: tcgetpgrp cannot cause UB
        let id = cerr(unsafe { libc::tcgetpgrp(self.as_raw_fd()) })?;
        Ok(ProcessId::new(id))
    }

    /// Set the foreground process group ID associated with this terminal to `pgrp`.
    fn tcsetpgrp(&self, pgrp: ProcessId) -> io::Result<()> {
        // SAFETY: tcsetpgrp cannot cause UB
        cerr(unsafe { libc::tcsetpgrp(self.as_raw_fd(), pgrp.get()) }).map(|_| ())
    }

    /// Rust standard library "IsTerminal" is not enough here: the descriptor
    /// is under the control of the shell user, so check for a character
    /// device first.
    fn is_terminal(&self) -> bool {
        safe_isatty(self.as_raw_fd())
    }
}

/// A snapshot of terminal attributes, used to put the line discipline back
/// after children (or the editor's raw mode) have changed it.
#[derive(Clone, Copy)]
pub(crate) struct TermAttrs {
    raw: termios,
}

impl TermAttrs {
    pub(crate) fn get<F: AsRawFd>(fd: &F) -> io::Result<Self> {
        let mut term = MaybeUninit::<termios>::uninit();
        // SAFETY: tcgetattr expects a pointer to a termios struct
        cerr(unsafe { tcgetattr(fd.as_raw_fd(), term.as_mut_ptr()) })?;
        // SAFETY: tcgetattr succeeded, so `term` is initialized
        Ok(Self {
            raw: unsafe { term.assume_init() },
        })
    }

    /// Reapply the snapshot with the chosen timing.
    pub(crate) fn set<F: AsRawFd>(&self, fd: &F, mode: RestoreMode) -> io::Result<()> {
        // SAFETY: `self.raw` is an initialized termios struct
        cerr(unsafe { tcsetattr(fd.as_raw_fd(), mode.flags(), &self.raw) }).map(|_| ())
    }

    /// Derive raw-mode attributes from this snapshot. Terminal signal
    /// generation (ISIG) is kept so Ctrl-C still reaches the shell.
    pub(crate) fn make_raw(&self) -> Self {
        let mut term = self.raw;
        // SAFETY: cfmakeraw initializes the struct we pass
        unsafe { libc::cfmakeraw(&mut term) };
        term.c_lflag |= libc::ISIG;
        Self { raw: term }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TermSize {
    pub(crate) rows: u16,
    pub(crate) cols: u16,
}

impl std::fmt::Display for TermSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} x {}", self.rows, self.cols)
    }
}

pub(crate) fn term_size<F: AsRawFd>(fd: &F) -> io::Result<TermSize> {
    let mut size = MaybeUninit::<winsize>::uninit();
    // SAFETY: TIOCGWINSZ expects a pointer to a winsize struct
    cerr(unsafe { ioctl(fd.as_raw_fd(), TIOCGWINSZ, size.as_mut_ptr()) })?;
    // SAFETY: the ioctl succeeded, so `size` is initialized
    let size = unsafe { size.assume_init() };
    Ok(TermSize {
        rows: size.ws_row,
        cols: size.ws_col,
    })
}

/// The number of bytes waiting in the kernel input buffer of `fd`.
pub(crate) fn bytes_pending<F: AsRawFd>(fd: &F) -> io::Result<usize> {
    let mut pending: libc::c_int = 0;
    // SAFETY: FIONREAD expects a pointer to an int
    cerr(unsafe { ioctl(fd.as_raw_fd(), libc::FIONREAD, &mut pending) })?;
    Ok(pending as usize)
}

#[cfg(test)]
mod tests {
    use super::Terminal;
    use std::fs::File;

    #[test]
    fn regular_file_is_not_a_terminal() {
        let file = File::open("/bin/sh").unwrap();
        assert!(!file.is_terminal());
        assert!(file.tcgetpgrp().is_err());
    }
}

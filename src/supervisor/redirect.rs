use std::{ffi::CString, os::fd::RawFd, path::Path};

use crate::common::Error;

/// The open mode of a redirection entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirKind {
    /// `< file`: read only.
    Input,
    /// `> file`: write, create, truncate.
    Output,
    /// `<> file`: read/write, create.
    InputOutput,
    /// `>> file`: write, create, append.
    OutputAppend,
}

impl RedirKind {
    fn open_flags(self) -> libc::c_int {
        match self {
            RedirKind::Input => libc::O_RDONLY,
            RedirKind::Output => libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
            RedirKind::InputOutput => libc::O_RDWR | libc::O_CREAT,
            RedirKind::OutputAppend => libc::O_WRONLY | libc::O_APPEND | libc::O_CREAT,
        }
    }
}

#[derive(Debug, Clone)]
enum RedirTarget {
    /// Open this path and dup the resulting descriptor over the source.
    // The path is converted to a CString up front: the child applies the
    // redirection between fork and exec, where allocation is off-limits.
    File(CString),
    /// Dup an existing descriptor over the source.
    Fd(RawFd),
}

/// One entry of a per-child redirection list, applied in list order in the
/// child before exec.
#[derive(Debug, Clone)]
pub struct Redirection {
    kind: RedirKind,
    target: RedirTarget,
    source_fd: RawFd,
}

impl Redirection {
    /// Redirect `source_fd` to a file opened with the mode of `kind`.
    pub fn file(kind: RedirKind, path: impl AsRef<Path>, source_fd: RawFd) -> Result<Self, Error> {
        use std::os::unix::ffi::OsStrExt;
        let path = CString::new(path.as_ref().as_os_str().as_bytes())
            .map_err(|_| Error::BadArgument("nul byte in redirection path"))?;
        Ok(Self {
            kind,
            target: RedirTarget::File(path),
            source_fd,
        })
    }

    /// Redirect `source_fd` to an already-open descriptor (`n>&m`).
    pub fn fd(kind: RedirKind, dest_fd: RawFd, source_fd: RawFd) -> Self {
        Self {
            kind,
            target: RedirTarget::Fd(dest_fd),
            source_fd,
        }
    }

    /// Apply this redirection in the child.
    ///
    /// Only async-signal-safe calls: open, dup2, close. Returns `Err` on any
    /// failure so the caller can signal the parent through the run pipe.
    pub(crate) fn apply_in_child(&self) -> Result<(), ()> {
        match &self.target {
            RedirTarget::File(path) => {
                // SAFETY: the path is a valid NUL-terminated string built
                // before fork
                let fd = unsafe { libc::open(path.as_ptr(), self.kind.open_flags(), 0o666) };
                if fd == -1 {
                    return Err(());
                }
                // SAFETY: dup2/close cannot cause UB
                unsafe {
                    if libc::dup2(fd, self.source_fd) == -1 {
                        libc::close(fd);
                        return Err(());
                    }
                    libc::close(fd);
                }
            }
            RedirTarget::Fd(dest_fd) => {
                // SAFETY: dup2 cannot cause UB even for invalid descriptors
                if unsafe { libc::dup2(*dest_fd, self.source_fd) } == -1 {
                    return Err(());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{RedirKind, Redirection};

    #[test]
    fn nul_in_path_is_rejected() {
        let err = Redirection::file(RedirKind::Output, "out\0put", 1).unwrap_err();
        assert!(matches!(err, crate::common::Error::BadArgument(_)));
    }

    #[test]
    fn open_flags() {
        assert_eq!(RedirKind::Input.open_flags(), libc::O_RDONLY);
        assert_eq!(
            RedirKind::Output.open_flags(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC
        );
        assert_eq!(
            RedirKind::InputOutput.open_flags(),
            libc::O_RDWR | libc::O_CREAT
        );
        assert_eq!(
            RedirKind::OutputAppend.open_flags(),
            libc::O_WRONLY | libc::O_APPEND | libc::O_CREAT
        );
    }
}

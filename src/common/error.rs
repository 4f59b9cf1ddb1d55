use std::{fmt, io};

#[derive(Debug)]
pub enum Error {
    /// A caller supplied an argument the operation cannot accept.
    BadArgument(&'static str),
    /// The subsystem worker is already running.
    AlreadyStarted,
    /// The subsystem worker is not running.
    AlreadyStopped,
    /// fork(2) itself failed.
    ForkFailed(io::Error),
    /// The child forked but exec or a redirection open failed.
    ExecFailed,
    /// Resource exhaustion while setting up launch pipes; the caller may
    /// retry.
    Pipe(io::Error),
    /// A writer handle outlived its process.
    DeadProcess,
    /// `complete` was called outside a completion window, or a second
    /// completion was requested while one was outstanding.
    CompletionMisuse,
    /// The shell could not become its own process-group leader.
    NotGroupLeader,
    /// Taking over the controlling terminal failed.
    TerminalAttach(io::Error),
    /// A terminal operation was attempted on a non-interactive session.
    NotInteractive,
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BadArgument(what) => write!(f, "bad argument: {what}"),
            Error::AlreadyStarted => write!(f, "already started"),
            Error::AlreadyStopped => write!(f, "already stopped"),
            Error::ForkFailed(e) => write!(f, "cannot fork: {e}"),
            Error::ExecFailed => write!(f, "Failed to launch process"),
            Error::Pipe(e) => write!(f, "cannot create pipe: {e}"),
            Error::DeadProcess => write!(f, "process is dead"),
            Error::CompletionMisuse => write!(f, "not completing"),
            Error::NotGroupLeader => {
                write!(f, "unable to set process as group leader")
            }
            Error::TerminalAttach(e) => {
                write!(f, "unable to attach to the terminal: {e}")
            }
            Error::NotInteractive => {
                write!(f, "can't restore state for non-interactive shell")
            }
            Error::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::ForkFailed(e)
            | Error::Pipe(e)
            | Error::TerminalAttach(e)
            | Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

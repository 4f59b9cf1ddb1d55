//! The shell side of job control: process-group leadership and ownership of
//! the controlling terminal.

use std::io;

use crate::common::{Error, RestoreMode};
use crate::system::interface::ProcessId;
use crate::system::signal::{consts::*, SignalGuard};
use crate::system::term::{TermAttrs, Terminal};
use crate::system::{getpgrp, getpid, kill, setpgid};

/// A started shell session.
///
/// Created once at startup. When the session is interactive the shell is its
/// own process-group leader, owns the foreground of the controlling
/// terminal, and holds a snapshot of the terminal modes taken before any
/// child could change them.
pub struct Session {
    pid: ProcessId,
    pgid: ProcessId,
    interactive: bool,
    saved_tmodes: Option<TermAttrs>,
}

impl Session {
    /// Acquire the controlling terminal and become a process-group leader.
    ///
    /// If stdin is not a terminal this records the current process group and
    /// does nothing else. Otherwise the shell loops sending itself `SIGTTIN`
    /// until its group owns the terminal (the standard dance when started
    /// from a job-control parent), becomes leader of its own group, starts
    /// ignoring the job-control stop signals, takes the foreground, and
    /// snapshots the terminal modes.
    pub fn start() -> Result<Self, Error> {
        let pid = getpid();
        let stdin = io::stdin();

        if !stdin.is_terminal() {
            return Ok(Self {
                pid,
                pgid: getpgrp(),
                interactive: false,
                saved_tmodes: None,
            });
        }

        // Until our group owns the terminal, a read would stop us anyway;
        // stopping ourselves now lets the parent shell put us in the
        // foreground before we proceed.
        let mut pgid = getpgrp();
        while stdin.tcgetpgrp().map_err(Error::TerminalAttach)? != pgid {
            kill(pid, SIGTTIN)?;
            pgid = getpgrp();
        }

        // An EPERM here usually means we already lead our own session; the
        // re-verification below is what decides.
        let _ = setpgid(pid, pid);
        pgid = getpgrp();
        if pgid != pid {
            return Err(Error::NotGroupLeader);
        }

        // The shell must survive its own children taking the terminal.
        SignalGuard::ignore(SIGTSTP)?.forget();
        SignalGuard::ignore(SIGTTIN)?.forget();
        SignalGuard::ignore(SIGTTOU)?.forget();

        stdin.tcsetpgrp(pgid).map_err(Error::TerminalAttach)?;
        let saved_tmodes = TermAttrs::get(&stdin).map_err(Error::TerminalAttach)?;

        Ok(Self {
            pid,
            pgid,
            interactive: true,
            saved_tmodes: Some(saved_tmodes),
        })
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn pgid(&self) -> ProcessId {
        self.pgid
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    /// Re-take the controlling terminal for the shell's group and reapply
    /// the startup terminal modes.
    ///
    /// Called by the host after a foreground child has returned control;
    /// children routinely leave the terminal in raw mode or with a changed
    /// line discipline.
    pub fn restore(&self, mode: RestoreMode) -> Result<(), Error> {
        if !self.interactive {
            return Err(Error::NotInteractive);
        }

        let stdin = io::stdin();
        stdin.tcsetpgrp(self.pgid).map_err(Error::TerminalAttach)?;

        if let Some(tmodes) = &self.saved_tmodes {
            tmodes.set(&stdin, mode).map_err(Error::TerminalAttach)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Session;
    use crate::common::{Error, RestoreMode};
    use crate::system::{getpgrp, getpid};

    #[test]
    fn non_interactive_session() {
        // The test harness runs without a controlling terminal on stdin, so
        // the session comes up non-interactive.
        if std::io::IsTerminal::is_terminal(&std::io::stdin()) {
            return;
        }

        let session = Session::start().unwrap();
        assert!(!session.is_interactive());
        assert_eq!(session.pid(), getpid());
        assert_eq!(session.pgid(), getpgrp());

        let err = session.restore(RestoreMode::Drain).unwrap_err();
        assert!(matches!(err, Error::NotInteractive));
    }
}

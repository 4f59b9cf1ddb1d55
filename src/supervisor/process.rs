use std::{
    io,
    sync::{Arc, Mutex, Weak},
};

use crate::common::{Error, RestoreMode};
use crate::system::interface::ProcessId;
use crate::system::signal::{consts::SIGCONT, SignalNumber};
use crate::system::term::{TermAttrs, Terminal};
use crate::system::wake::{WakePipe, WakeReason};
use crate::system::killpg;

/// A lifecycle transition reported through a launch's status callback.
///
/// Exactly one `Exited` or `Error` is delivered per launched process, never
/// both; any number of `Stopped` events may precede it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// The child is gone. Non-negative values are exit codes, negative
    /// values are `-signal` for signal deaths.
    Exited(i32),
    /// The child was stopped by the given signal.
    Stopped(SignalNumber),
    /// The launch failed after fork; no `Exited` will follow.
    Error(String),
}

pub type StatusCallback = Box<dyn FnMut(StatusEvent) + Send>;

/// Which child stream a context refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Job-control placement for [`Proc::set_mode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobMode {
    Foreground,
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcState {
    /// Forked, exec outcome not yet known.
    Spawning,
    Running,
    Stopped,
    Exited,
    /// Exec or redirection failed; the process was never enrolled.
    Failed,
}

pub(crate) struct ProcShared {
    pub(crate) state: ProcState,
    /// Signed status: `>= 0` exit code, `< 0` is `-signal`; the stop signal
    /// while `Stopped`.
    pub(crate) status: i32,
    /// Writes queued by the host, spliced into the worker's queue each
    /// iteration.
    pub(crate) new_writes: Vec<Vec<u8>>,
    /// Close stdin once the write queue has drained.
    pub(crate) pending_close: bool,
    /// Terminal modes captured when the child stopped, reapplied on
    /// foreground resume.
    pub(crate) saved_tmodes: Option<TermAttrs>,
    pub(crate) status_cb: Option<StatusCallback>,
    pub(crate) exit_reported: bool,
}

/// Supervisor-shared state of one launched child.
///
/// The worker owns the file descriptors and write queue; everything that
/// crosses threads lives behind this mutex.
pub(crate) struct Proc {
    pub(crate) pid: ProcessId,
    pub(crate) pgid: ProcessId,
    pub(crate) shared: Mutex<ProcShared>,
}

impl Proc {
    pub(crate) fn new(pid: ProcessId, pgid: ProcessId, status_cb: StatusCallback) -> Self {
        Self {
            pid,
            pgid,
            shared: Mutex::new(ProcShared {
                state: ProcState::Spawning,
                status: -1,
                new_writes: Vec::new(),
                pending_close: false,
                saved_tmodes: None,
                status_cb: Some(status_cb),
                exit_reported: false,
            }),
        }
    }

    /// Run the status callback outside the shared lock; callbacks are free
    /// to call back into the supervisor.
    pub(crate) fn report(self: &Arc<Self>, event: StatusEvent) {
        let cb = self.shared.lock().unwrap().status_cb.take();
        if let Some(mut cb) = cb {
            cb(event);
            self.shared.lock().unwrap().status_cb = Some(cb);
        }
    }

    /// Move the child between foreground and background, optionally
    /// continuing it.
    ///
    /// Foreground hands the controlling terminal to the child's group and,
    /// when resuming, puts back the terminal modes saved when it stopped.
    /// Background never touches the terminal foreground group.
    pub(crate) fn set_mode(&self, mode: JobMode, resume: bool) -> Result<(), Error> {
        match mode {
            JobMode::Foreground => {
                let stdin = io::stdin();
                stdin.tcsetpgrp(self.pgid).map_err(Error::TerminalAttach)?;

                if resume {
                    let saved = {
                        let shared = self.shared.lock().unwrap();
                        shared.saved_tmodes
                    };
                    if let Some(tmodes) = saved {
                        tmodes
                            .set(&stdin, RestoreMode::Drain)
                            .map_err(Error::TerminalAttach)?;
                    }
                    self.continue_group()?;
                }
            }
            JobMode::Background => {
                if resume {
                    self.continue_group()?;
                }
            }
        }
        Ok(())
    }

    fn continue_group(&self) -> Result<(), Error> {
        killpg(self.pgid, SIGCONT)?;
        let mut shared = self.shared.lock().unwrap();
        if shared.state == ProcState::Stopped {
            shared.state = ProcState::Running;
        }
        Ok(())
    }
}

/// A weak handle used by the host to feed a child's stdin.
///
/// Holding a writer does not keep the process alive; the supervisor's own
/// reference is the liveness anchor. Writes after the process is gone fail
/// with [`Error::DeadProcess`]; writes after stdin closed are silently
/// discarded by the worker.
#[derive(Clone)]
pub struct Writer {
    pub(crate) proc: Weak<Proc>,
    pub(crate) wake: Arc<WakePipe>,
}

impl Writer {
    /// Queue bytes for the child's stdin.
    pub fn write(&self, bytes: &[u8]) -> Result<(), Error> {
        let proc = self.proc.upgrade().ok_or(Error::DeadProcess)?;
        proc.shared.lock().unwrap().new_writes.push(bytes.to_vec());
        self.wake.wake(WakeReason::NewWork);
        Ok(())
    }

    /// Close the child's stdin once all queued writes have drained.
    pub fn close(&self) -> Result<(), Error> {
        let proc = self.proc.upgrade().ok_or(Error::DeadProcess)?;
        proc.shared.lock().unwrap().pending_close = true;
        self.wake.wake(WakeReason::NewWork);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex, Weak};

    use super::{Proc, StatusEvent, Writer};
    use crate::system::interface::ProcessId;
    use crate::system::wake::WakePipe;

    #[test]
    fn report_runs_callback_once_per_event() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let proc = Arc::new(Proc::new(
            ProcessId::new(1),
            ProcessId::new(1),
            Box::new(move |event| sink.lock().unwrap().push(event)),
        ));

        proc.report(StatusEvent::Stopped(libc::SIGSTOP));
        proc.report(StatusEvent::Exited(0));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![StatusEvent::Stopped(libc::SIGSTOP), StatusEvent::Exited(0)]
        );
    }

    #[test]
    fn writer_fails_after_process_dropped() {
        let wake = Arc::new(WakePipe::new().unwrap());
        let writer = Writer {
            proc: Weak::new(),
            wake,
        };

        assert!(matches!(
            writer.write(b"hi"),
            Err(crate::common::Error::DeadProcess)
        ));
        assert!(matches!(
            writer.close(),
            Err(crate::common::Error::DeadProcess)
        ));
    }

    #[test]
    fn writer_queues_bytes() {
        let wake = Arc::new(WakePipe::new().unwrap());
        let proc = Arc::new(Proc::new(
            ProcessId::new(1),
            ProcessId::new(1),
            Box::new(|_| {}),
        ));
        let writer = Writer {
            proc: Arc::downgrade(&proc),
            wake,
        };

        writer.write(b"abc").unwrap();
        writer.close().unwrap();

        let shared = proc.shared.lock().unwrap();
        assert_eq!(shared.new_writes, vec![b"abc".to_vec()]);
        assert!(shared.pending_close);
    }
}

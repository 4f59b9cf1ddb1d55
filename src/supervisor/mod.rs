//! The process supervisor: launches children under job-control discipline,
//! multiplexes their standard streams on a dedicated worker, reaps them on
//! SIGCHLD, and reports lifecycle transitions back to the host loop.

mod emitter;
mod launch;
mod process;
mod redirect;
mod registry;
mod worker;

use std::{
    io,
    os::fd::RawFd,
    sync::{mpsc, Arc, Mutex, Weak},
    thread::{self, JoinHandle},
};

pub use emitter::{BufferEmitter, Listener};
pub use process::{JobMode, OutputStream, StatusCallback, StatusEvent, Writer};
pub use redirect::{RedirKind, Redirection};

use crate::common::Error;
use crate::system::interface::ProcessId;
use crate::system::queue::Queue;
use crate::system::signal::{consts::SIGCHLD, SignalStream};
use crate::system::wake::{WakePipe, WakeReason};

use process::{Proc, ProcState};
use registry::FdRegistry;
use worker::{Inbox, WorkerChannels};

/// Job-control placement for an interactive launch.
#[derive(Debug, Clone, Copy, Default)]
pub struct Interactive {
    /// Hand the controlling terminal to the child's group.
    pub foreground: bool,
    /// Join this process group instead of starting a new one (pipelines put
    /// every member in the first member's group).
    pub pgid: Option<ProcessId>,
}

/// Options for [`Supervisor::launch`].
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub redirect_stdin: bool,
    pub redirect_stdout: bool,
    pub redirect_stderr: bool,
    /// When stdout is not redirected, dup this descriptor over the child's
    /// stdout so children launched from a UI reach the real terminal.
    pub original_stdout: Option<RawFd>,
    /// As `original_stdout`, for stderr.
    pub original_stderr: Option<RawFd>,
    /// Present for children that take part in job control.
    pub interactive: Option<Interactive>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            redirect_stdin: true,
            redirect_stdout: true,
            redirect_stderr: true,
            original_stdout: None,
            original_stderr: None,
            interactive: None,
        }
    }
}

/// Work queued by the worker for the host loop.
pub(crate) enum HostWork {
    /// An emitter has buffers to deliver.
    Flush(Arc<BufferEmitter>),
    /// A lifecycle transition to report through the status callback.
    Status(Arc<Proc>, StatusEvent),
}

/// The queue of host work plus the caller-supplied async notification.
pub(crate) struct HostChannel {
    notify: Box<dyn Fn() + Send + Sync>,
    queue: Queue<HostWork>,
}

impl HostChannel {
    pub(crate) fn push(&self, work: HostWork) {
        self.queue.push(work);
        (self.notify)();
    }
}

/// Handle to a launched child.
///
/// Stream contexts are present only for the streams that were redirected.
/// The handle holds the process weakly; the supervisor's own reference is
/// the liveness anchor.
pub struct Launch {
    pid: ProcessId,
    proc: Weak<Proc>,
    stdout: Option<Arc<BufferEmitter>>,
    stderr: Option<Arc<BufferEmitter>>,
    writer: Option<Writer>,
}

impl std::fmt::Debug for Launch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launch").field("pid", &self.pid).finish()
    }
}

impl Launch {
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// The emitter carrying the given stream, if it was redirected.
    pub fn emitter(&self, stream: OutputStream) -> Option<&Arc<BufferEmitter>> {
        match stream {
            OutputStream::Stdout => self.stdout.as_ref(),
            OutputStream::Stderr => self.stderr.as_ref(),
        }
    }

    /// A cloneable weak stdin handle, if stdin was redirected.
    pub fn writer(&self) -> Option<Writer> {
        self.writer.clone()
    }

    /// Queue bytes for the child's stdin.
    pub fn write(&self, bytes: &[u8]) -> Result<(), Error> {
        self.writer
            .as_ref()
            .ok_or(Error::BadArgument("stdin is not redirected"))?
            .write(bytes)
    }

    /// Close the child's stdin once queued writes have drained.
    pub fn close_stdin(&self) -> Result<(), Error> {
        self.writer
            .as_ref()
            .ok_or(Error::BadArgument("stdin is not redirected"))?
            .close()
    }

    /// Attach a listener to an output stream, replaying any staged buffers.
    pub fn listen(&self, stream: OutputStream, listener: Listener) -> Result<(), Error> {
        self.emitter(stream)
            .ok_or(Error::BadArgument("stream is not redirected"))?
            .listen(listener)
    }

    /// Detach the listener of an output stream.
    pub fn unlisten(&self, stream: OutputStream) -> Result<(), Error> {
        self.emitter(stream)
            .ok_or(Error::BadArgument("stream is not redirected"))?
            .unlisten();
        Ok(())
    }

    /// Move the child between foreground and background, optionally
    /// delivering SIGCONT to its group.
    pub fn set_mode(&self, mode: JobMode, resume: bool) -> Result<(), Error> {
        self.proc
            .upgrade()
            .ok_or(Error::DeadProcess)?
            .set_mode(mode, resume)
    }
}

/// The process supervisor.
///
/// `launch`, `dispatch` and the handle operations are meant to be called
/// from the host loop thread; the worker thread owns all child descriptors.
pub struct Supervisor {
    wake: Arc<WakePipe>,
    inbox: Arc<Mutex<Inbox>>,
    host: Arc<HostChannel>,
    registry: Arc<FdRegistry>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    /// Create a supervisor. `notify` is invoked (from the worker thread)
    /// whenever host work is pending; the host should schedule a call to
    /// [`Supervisor::dispatch`] in response.
    pub fn new(notify: impl Fn() + Send + Sync + 'static) -> Result<Self, Error> {
        Ok(Self {
            wake: Arc::new(WakePipe::new().map_err(Error::Pipe)?),
            inbox: Arc::new(Mutex::new(Inbox {
                new_procs: Vec::new(),
                stopped: false,
            })),
            host: Arc::new(HostChannel {
                notify: Box::new(notify),
                queue: Queue::new(),
            }),
            registry: Arc::new(FdRegistry::new()),
            worker: Mutex::new(None),
        })
    }

    fn channels(&self) -> WorkerChannels {
        WorkerChannels {
            wake: Arc::clone(&self.wake),
            inbox: Arc::clone(&self.inbox),
            host: Arc::clone(&self.host),
            registry: Arc::clone(&self.registry),
        }
    }

    /// Create the worker thread and the SIGCHLD stream.
    pub fn start(&self) -> Result<(), Error> {
        let mut worker_slot = self.worker.lock().unwrap();
        if worker_slot.is_some() {
            return Err(Error::AlreadyStarted);
        }

        self.inbox.lock().unwrap().stopped = false;
        let sigchld = SignalStream::register(&[SIGCHLD]).map_err(Error::Pipe)?;
        let channels = self.channels();

        let handle = thread::Builder::new()
            .name("process-supervisor".into())
            .spawn(move || worker::run(channels, sigchld))
            .map_err(Error::Io)?;
        *worker_slot = Some(handle);
        Ok(())
    }

    /// Tear down the worker. In-flight children are not killed; the host is
    /// expected to signal them explicitly if desired.
    pub fn stop(&self) -> Result<(), Error> {
        let handle = self
            .worker
            .lock()
            .unwrap()
            .take()
            .ok_or(Error::AlreadyStopped)?;

        self.inbox.lock().unwrap().stopped = true;
        self.wake.wake(WakeReason::Stop);

        handle
            .join()
            .map_err(|_| Error::Io(io::Error::other("supervisor worker panicked")))?;
        Ok(())
    }

    /// Launch a child.
    ///
    /// Synchronous failures (bad arguments, pipe exhaustion) are returned
    /// directly. When fork succeeds but exec or a redirection fails, the
    /// status callback receives an `Error` event on the next dispatch and
    /// this returns [`Error::ExecFailed`]; no `Exited` will follow.
    pub fn launch(
        &self,
        cmd: &str,
        args: &[String],
        env: &[(String, String)],
        status_cb: impl FnMut(StatusEvent) + Send + 'static,
        opts: &LaunchOptions,
        redirs: &[Redirection],
    ) -> Result<Launch, Error> {
        if self.worker.lock().unwrap().is_none() {
            return Err(Error::AlreadyStopped);
        }

        let status_cb: StatusCallback = Box::new(status_cb);
        let snapshot = self.registry.snapshot();

        let spawned = match launch::launch_child(cmd, args, env, opts, redirs, &snapshot) {
            Ok(spawned) => spawned,
            Err(Error::ExecFailed) => {
                // The child never came up; keep a Failed record just long
                // enough to route the error through the status callback.
                let proc = Arc::new(Proc::new(
                    ProcessId::new(-1),
                    ProcessId::new(-1),
                    status_cb,
                ));
                proc.shared.lock().unwrap().state = ProcState::Failed;
                self.host.push(HostWork::Status(
                    proc,
                    StatusEvent::Error("Failed to launch process".into()),
                ));
                return Err(Error::ExecFailed);
            }
            Err(err) => return Err(err),
        };

        let proc = Arc::new(Proc::new(spawned.pid, spawned.pgid, status_cb));
        proc.shared.lock().unwrap().state = ProcState::Running;

        let stdout = spawned
            .stdout
            .is_some()
            .then(|| Arc::new(BufferEmitter::new()));
        let stderr = spawned
            .stderr
            .is_some()
            .then(|| Arc::new(BufferEmitter::new()));
        let writer = spawned.stdin.is_some().then(|| Writer {
            proc: Arc::downgrade(&proc),
            wake: Arc::clone(&self.wake),
        });

        let handle = Launch {
            pid: spawned.pid,
            proc: Arc::downgrade(&proc),
            stdout: stdout.clone(),
            stderr: stderr.clone(),
            writer,
        };

        worker::enrol(
            &self.channels(),
            proc,
            spawned.stdin,
            spawned.stdout,
            spawned.stderr,
            stdout,
            stderr,
        );

        Ok(handle)
    }

    /// Run pending host work: flush emitters to their listeners and deliver
    /// status callbacks. Called by the host loop after `notify` fires.
    /// Never blocks.
    pub fn dispatch(&self) {
        for work in self.host.queue.drain() {
            match work {
                HostWork::Flush(emitter) => emitter.flush(),
                HostWork::Status(proc, event) => proc.report(event),
            }
        }
    }

    /// Launch with every stream redirected, close stdin, and collect output
    /// until exit.
    ///
    /// Blocks the calling thread; something else must be driving
    /// [`Supervisor::dispatch`].
    pub fn read_process(
        &self,
        cmd: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<ReadOutput, Error> {
        let (tx, rx) = mpsc::channel();
        let handle = self.launch(
            cmd,
            args,
            env,
            move |event| {
                let _ = tx.send(event);
            },
            &LaunchOptions::default(),
            &[],
        )?;

        handle.close_stdin()?;

        let stdout = Arc::new(Mutex::new(Vec::new()));
        let stderr = Arc::new(Mutex::new(Vec::new()));
        for (stream, sink) in [
            (OutputStream::Stdout, &stdout),
            (OutputStream::Stderr, &stderr),
        ] {
            let sink = Arc::clone(sink);
            handle.listen(
                stream,
                Box::new(move |buf| sink.lock().unwrap().extend_from_slice(&buf)),
            )?;
        }

        loop {
            match rx.recv() {
                Ok(StatusEvent::Exited(status)) => {
                    return Ok(ReadOutput {
                        status,
                        stdout: std::mem::take(&mut stdout.lock().unwrap()),
                        stderr: std::mem::take(&mut stderr.lock().unwrap()),
                    });
                }
                Ok(StatusEvent::Error(_)) => return Err(Error::ExecFailed),
                Ok(StatusEvent::Stopped(_)) => {}
                Err(_) => {
                    return Err(Error::Io(io::Error::other(
                        "status channel closed before exit",
                    )))
                }
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Collected output of [`Supervisor::read_process`].
#[derive(Debug, PartialEq, Eq)]
pub struct ReadOutput {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Resolve a user name (or the current real user) to its uid.
pub fn uid(user: Option<&str>) -> io::Result<libc::uid_t> {
    crate::system::user_id(user)
}

/// Resolve the supplementary group list of a user (or the current real
/// user).
pub fn gids(user: Option<&str>) -> io::Result<Vec<libc::gid_t>> {
    crate::system::user_groups(user)
}

#[cfg(test)]
mod tests {
    use std::sync::{mpsc, Arc, Mutex, OnceLock};
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::{
        Interactive, JobMode, LaunchOptions, OutputStream, RedirKind, Redirection, StatusEvent,
        Supervisor,
    };
    use crate::common::Error;

    const WAIT: Duration = Duration::from_secs(10);

    /// One supervisor for the whole test binary, with a dispatcher thread
    /// standing in for the host loop.
    fn supervisor() -> &'static Supervisor {
        static SUP: OnceLock<&'static Supervisor> = OnceLock::new();
        *SUP.get_or_init(|| {
            let (tx, rx) = mpsc::channel::<()>();
            let tx = Mutex::new(tx);
            let sup: &'static Supervisor = Box::leak(Box::new(
                Supervisor::new(move || {
                    let _ = tx.lock().unwrap().send(());
                })
                .unwrap(),
            ));
            sup.start().unwrap();
            std::thread::spawn(move || {
                while rx.recv().is_ok() {
                    sup.dispatch();
                }
            });
            sup
        })
    }

    fn status_channel() -> (
        impl FnMut(StatusEvent) + Send + 'static,
        mpsc::Receiver<StatusEvent>,
    ) {
        let (tx, rx) = mpsc::channel();
        (
            move |event| {
                let _ = tx.send(event);
            },
            rx,
        )
    }

    fn collect(handle: &super::Launch, stream: OutputStream) -> Arc<Mutex<Vec<u8>>> {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let inner = Arc::clone(&sink);
        handle
            .listen(
                stream,
                Box::new(move |buf| inner.lock().unwrap().extend_from_slice(&buf)),
            )
            .unwrap();
        sink
    }

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn echo_delivers_output_then_exit() {
        let sup = supervisor();
        let (cb, rx) = status_channel();
        let opts = LaunchOptions {
            redirect_stdin: false,
            redirect_stderr: false,
            ..Default::default()
        };

        let handle = sup
            .launch("/bin/echo", &strings(&["hi"]), &[], cb, &opts, &[])
            .unwrap();
        assert!(handle.pid().is_valid());
        let out = collect(&handle, OutputStream::Stdout);

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), StatusEvent::Exited(0));
        // All output precedes the exit event.
        assert_eq!(*out.lock().unwrap(), b"hi\n".to_vec());
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn cat_roundtrip() {
        let sup = supervisor();
        let (cb, rx) = status_channel();
        let opts = LaunchOptions {
            redirect_stderr: false,
            ..Default::default()
        };

        let handle = sup
            .launch("/bin/cat", &[], &[], cb, &opts, &[])
            .unwrap();
        let out = collect(&handle, OutputStream::Stdout);

        handle.write(b"abc").unwrap();
        handle.close_stdin().unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), StatusEvent::Exited(0));
        assert_eq!(*out.lock().unwrap(), b"abc".to_vec());
    }

    #[test]
    fn false_reports_exit_code() {
        let sup = supervisor();
        let (cb, rx) = status_channel();
        let opts = LaunchOptions {
            redirect_stdin: false,
            redirect_stdout: false,
            redirect_stderr: false,
            ..Default::default()
        };

        sup.launch("/bin/false", &[], &[], cb, &opts, &[]).unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), StatusEvent::Exited(1));
    }

    #[test]
    fn signal_death_is_negative() {
        let sup = supervisor();
        let (cb, rx) = status_channel();
        let opts = LaunchOptions {
            redirect_stdin: false,
            redirect_stdout: false,
            redirect_stderr: false,
            ..Default::default()
        };

        sup.launch(
            "/bin/sh",
            &strings(&["-c", "kill -KILL $$"]),
            &[],
            cb,
            &opts,
            &[],
        )
        .unwrap();

        assert_eq!(
            rx.recv_timeout(WAIT).unwrap(),
            StatusEvent::Exited(-libc::SIGKILL)
        );
    }

    #[test]
    fn exec_failure_reports_error_not_exit() {
        let sup = supervisor();
        let (cb, rx) = status_channel();
        let opts = LaunchOptions::default();

        let err = sup
            .launch("/nonexistent", &[], &[], cb, &opts, &[])
            .unwrap_err();
        assert!(matches!(err, Error::ExecFailed));

        assert_eq!(
            rx.recv_timeout(WAIT).unwrap(),
            StatusEvent::Error("Failed to launch process".into())
        );
        // No exit event ever follows an error.
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn stop_then_resume() {
        let sup = supervisor();
        let (cb, rx) = status_channel();
        let opts = LaunchOptions {
            redirect_stderr: false,
            interactive: Some(Interactive {
                foreground: false,
                pgid: None,
            }),
            ..Default::default()
        };

        let handle = sup
            .launch(
                "/bin/sh",
                &strings(&["-c", "kill -STOP $$; exec /bin/cat"]),
                &[],
                cb,
                &opts,
                &[],
            )
            .unwrap();
        let out = collect(&handle, OutputStream::Stdout);

        assert_eq!(
            rx.recv_timeout(WAIT).unwrap(),
            StatusEvent::Stopped(libc::SIGSTOP)
        );

        handle.set_mode(JobMode::Background, true).unwrap();

        handle.write(b"x").unwrap();
        handle.close_stdin().unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), StatusEvent::Exited(0));
        assert_eq!(*out.lock().unwrap(), b"x".to_vec());
    }

    #[test]
    fn listener_attached_late_gets_staged_output() {
        let sup = supervisor();
        let (cb, rx) = status_channel();
        let opts = LaunchOptions {
            redirect_stdin: false,
            redirect_stderr: false,
            ..Default::default()
        };

        let handle = sup
            .launch("/bin/echo", &strings(&["A"]), &[], cb, &opts, &[])
            .unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), StatusEvent::Exited(0));

        // Nothing listened while the child ran; attach now and replay.
        let out = collect(&handle, OutputStream::Stdout);
        assert_eq!(*out.lock().unwrap(), b"A\n".to_vec());
    }

    #[test]
    fn file_redirection() {
        let sup = supervisor();
        let (cb, rx) = status_channel();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");

        let opts = LaunchOptions {
            redirect_stdin: false,
            redirect_stdout: false,
            redirect_stderr: false,
            ..Default::default()
        };
        let redirs = vec![
            Redirection::file(RedirKind::Output, &path, libc::STDOUT_FILENO).unwrap(),
            // 2>&1
            Redirection::fd(RedirKind::Output, libc::STDOUT_FILENO, libc::STDERR_FILENO),
        ];

        sup.launch(
            "/bin/sh",
            &strings(&["-c", "echo out; echo err 1>&2"]),
            &[],
            cb,
            &opts,
            &redirs,
        )
        .unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), StatusEvent::Exited(0));
        assert_eq!(std::fs::read(&path).unwrap(), b"out\nerr\n".to_vec());
    }

    #[test]
    fn redirection_open_failure_is_a_launch_error() {
        let sup = supervisor();
        let (cb, rx) = status_channel();
        let opts = LaunchOptions {
            redirect_stdin: false,
            redirect_stdout: false,
            redirect_stderr: false,
            ..Default::default()
        };
        let redirs = vec![Redirection::file(
            RedirKind::Input,
            "/nonexistent-redirection-target",
            libc::STDIN_FILENO,
        )
        .unwrap()];

        let err = sup
            .launch("/bin/true", &[], &[], cb, &opts, &redirs)
            .unwrap_err();
        assert!(matches!(err, Error::ExecFailed));
        assert!(matches!(
            rx.recv_timeout(WAIT).unwrap(),
            StatusEvent::Error(_)
        ));
    }

    #[test]
    fn read_process_collects_everything() {
        let sup = supervisor();

        let output = sup
            .read_process(
                "/bin/sh",
                &strings(&["-c", "printf foo; printf bar >&2; exit 3"]),
                &[],
            )
            .unwrap();

        assert_eq!(output.status, 3);
        assert_eq!(output.stdout, b"foo".to_vec());
        assert_eq!(output.stderr, b"bar".to_vec());
    }

    #[test]
    fn environment_is_what_the_caller_supplies() {
        let sup = supervisor();

        let output = sup
            .read_process(
                "/bin/sh",
                &strings(&["-c", "echo \"$RUSH_MARKER\""]),
                &[("RUSH_MARKER".into(), "present".into())],
            )
            .unwrap();

        assert_eq!(output.status, 0);
        assert_eq!(output.stdout, b"present\n".to_vec());
    }

    #[test]
    fn lifecycle_misuse() {
        let sup = Supervisor::new(|| {}).unwrap();
        assert!(matches!(sup.stop(), Err(Error::AlreadyStopped)));

        sup.start().unwrap();
        assert!(matches!(sup.start(), Err(Error::AlreadyStarted)));

        sup.stop().unwrap();
        assert!(matches!(sup.stop(), Err(Error::AlreadyStopped)));
    }

    #[test]
    fn launch_requires_running_worker() {
        let sup = Supervisor::new(|| {}).unwrap();
        let err = sup
            .launch("/bin/true", &[], &[], |_| {}, &LaunchOptions::default(), &[])
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyStopped));
    }

    #[test]
    fn uid_and_gids() {
        assert_eq!(super::uid(Some("root")).unwrap(), 0);
        assert!(super::uid(Some("definitely-not-a-user")).is_err());
        assert!(!super::gids(None).unwrap().is_empty());
    }
}

//! The editor worker: runs the line editor concurrently with child output on
//! a dedicated thread, so prompts and captured stdout/stderr interleave
//! cleanly on the shared terminal.

use std::{
    io::{self, Write},
    os::fd::AsRawFd,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use crate::cutils::cerr;
use crate::log::{dev_error, dev_info, dev_warn};
use crate::system::poll::{PollEvent, PollSet};
use crate::system::queue::Queue;
use crate::system::term::{bytes_pending, term_size};
use crate::system::wake::{WakePipe, WakeReason};

use super::line::{CompletionRequest, FeedOutcome, LineEdit};
use super::quoting::longest_common_prefix;
use super::redirector::Redirector;
use super::tasks::{TaskQuery, TaskReply};

const READ_CHUNK: usize = 16 * 1024;

/// Everything the worker thread owns: the editor state may only ever be
/// touched from here (or from task closures, which run here).
pub(crate) struct EditorIo {
    pub(crate) editor: LineEdit,
    pub(crate) redirector: Redirector,
    pub(crate) paused: bool,
}

impl EditorIo {
    /// Split into the editor and its direct-output channel.
    pub(crate) fn parts(&mut self) -> (&mut LineEdit, DirectErr<'_>) {
        (&mut self.editor, DirectErr(&self.redirector))
    }
}

/// The editor's rendering channel: straight to the real terminal, past the
/// capture pipes.
pub(crate) struct DirectErr<'a>(pub(crate) &'a Redirector);

impl Write for DirectErr<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write_stderr(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub(crate) struct CompletionState {
    pub(crate) in_complete: bool,
    /// Set by the worker for host dispatch to take.
    pub(crate) request: Option<CompletionRequest>,
    /// Supplied by the host's `complete` call.
    pub(crate) results: Vec<String>,
}

/// State shared between the worker and the bridge.
pub(crate) struct EditorShared {
    pub(crate) tasks: Queue<TaskQuery>,
    pub(crate) replies: Queue<TaskReply>,
    pub(crate) lines: Queue<String>,
    pub(crate) completion: Mutex<CompletionState>,
    pub(crate) pending_eof: AtomicBool,
    pub(crate) notify: Box<dyn Fn() + Send + Sync>,
}

impl EditorShared {
    fn notify(&self) {
        (self.notify)()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Key {
    Wake,
    Stdin,
    CapturedOut,
    CapturedErr,
}

pub(crate) fn run(wake: Arc<WakePipe>, shared: Arc<EditorShared>, mut state: EditorIo) {
    {
        let (editor, mut out) = state.parts();
        editor.install(&mut out);
    }

    let mut poll_set = PollSet::new();
    let mut stopped = false;
    let mut pending_tasks = false;

    while !stopped {
        poll_set.clear();
        poll_set.insert(Key::Wake, &*wake, PollEvent::Readable);
        if !state.paused {
            poll_set.insert_raw(Key::Stdin, libc::STDIN_FILENO, PollEvent::Readable);
            poll_set.insert(
                Key::CapturedOut,
                state.redirector.stdout_read(),
                PollEvent::Readable,
            );
            poll_set.insert(
                Key::CapturedErr,
                state.redirector.stderr_read(),
                PollEvent::Readable,
            );
        }

        let ready = match poll_set.poll() {
            Ok(ready) => ready,
            Err(err) => {
                dev_error!("editor poll failed: {err}");
                break;
            }
        };

        for key in ready {
            match key {
                Key::Wake => {
                    for reason in wake.drain() {
                        match reason {
                            WakeReason::Stop => stopped = true,
                            WakeReason::Task => pending_tasks = true,
                            // Handled inside the completion wait; a stray
                            // byte at loop level is a no-op.
                            WakeReason::Complete => {}
                            WakeReason::Winch => handle_winch(&mut state),
                            WakeReason::NewWork => {}
                        }
                    }
                }
                Key::CapturedOut if !state.paused => drain_captured(&mut state, Captured::Stdout),
                Key::CapturedErr if !state.paused => drain_captured(&mut state, Captured::Stderr),
                Key::Stdin if !state.paused => {
                    if !drain_stdin(&wake, &shared, &mut state, &mut stopped, &mut pending_tasks) {
                        stopped = true;
                    }
                }
                _ => {}
            }
        }

        if pending_tasks {
            pending_tasks = false;
            run_tasks(&shared, &mut state);
        }
    }

    state.editor.deinstall();
}

fn handle_winch(state: &mut EditorIo) {
    // Re-query the size, then repaint for the new width.
    if let Ok(size) = term_size(&io::stdin()) {
        dev_info!("terminal resized to {size}");
    }
    if !state.paused {
        let (editor, mut out) = state.parts();
        editor.redisplay(&mut out);
    }
}

enum Captured {
    Stdout,
    Stderr,
}

/// Drain one captured stream to the real terminal, saving the editor's
/// visible state once for the whole drain and restoring it afterwards.
fn drain_captured(state: &mut EditorIo, which: Captured) {
    let EditorIo {
        editor, redirector, ..
    } = state;

    let fd = match which {
        Captured::Stdout => redirector.stdout_read().as_raw_fd(),
        Captured::Stderr => redirector.stderr_read().as_raw_fd(),
    };

    let mut saved = false;
    let mut buf = [0u8; READ_CHUNK];
    loop {
        // SAFETY: we read into a valid buffer of READ_CHUNK bytes
        match cerr(unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) }) {
            Ok(0) => break,
            Ok(n) => {
                if !saved {
                    editor.save(&mut DirectErr(redirector));
                    saved = true;
                }
                let chunk = &buf[..n as usize];
                match which {
                    Captured::Stdout => redirector.write_stdout(chunk),
                    Captured::Stderr => redirector.write_stderr(chunk),
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(_) => break,
        }
    }

    if saved {
        editor.restore(&mut DirectErr(redirector));
    }
}

/// Feed the editor until the kernel input buffer is empty. Returns false on
/// EOF or read error.
fn drain_stdin(
    wake: &WakePipe,
    shared: &EditorShared,
    state: &mut EditorIo,
    stopped: &mut bool,
    pending_tasks: &mut bool,
) -> bool {
    loop {
        let mut byte = [0u8; 1];
        // SAFETY: we read one byte into a valid buffer
        match cerr(unsafe { libc::read(libc::STDIN_FILENO, byte.as_mut_ptr().cast(), 1) }) {
            Ok(0) => {
                shared.pending_eof.store(true, Ordering::SeqCst);
                shared.notify();
                return false;
            }
            Ok(_) => {
                let outcome = {
                    let (editor, mut out) = state.parts();
                    editor.feed(byte[0], &mut out)
                };
                match outcome {
                    FeedOutcome::Continue => {}
                    FeedOutcome::Line(line) => {
                        shared.lines.push(line);
                        shared.notify();
                    }
                    FeedOutcome::Eof => {
                        shared.pending_eof.store(true, Ordering::SeqCst);
                        shared.notify();
                        return false;
                    }
                    FeedOutcome::Complete(request) => {
                        complete(wake, shared, state, request, stopped, pending_tasks);
                        if *stopped {
                            return true;
                        }
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return true,
            Err(_) => return false,
        }

        match bytes_pending(&io::stdin()) {
            Ok(0) | Err(_) => return true,
            Ok(_) => {}
        }
    }
}

/// Publish the completion request, then block in a nested wait on the
/// wakeup pipe until the host supplies results. Stop and Winch are honoured
/// inline; Task arrivals are deferred to the main loop.
fn complete(
    wake: &WakePipe,
    shared: &EditorShared,
    state: &mut EditorIo,
    request: CompletionRequest,
    stopped: &mut bool,
    pending_tasks: &mut bool,
) {
    {
        let mut completion = shared.completion.lock().unwrap();
        if completion.in_complete {
            // Only one completion may be outstanding; the worker is the
            // sole requester so this cannot happen while it is blocked
            // below.
            dev_warn!("completion requested while one is outstanding");
            return;
        }
        completion.in_complete = true;
        completion.request = Some(request.clone());
    }
    shared.notify();

    let results = loop {
        let mut poll_set = PollSet::new();
        poll_set.insert((), wake, PollEvent::Readable);
        if poll_set.poll().is_err() {
            break None;
        }

        let mut found = None;
        for reason in wake.drain() {
            match reason {
                WakeReason::Stop => {
                    *stopped = true;
                }
                WakeReason::Task => *pending_tasks = true,
                WakeReason::Complete => {
                    let mut completion = shared.completion.lock().unwrap();
                    found = Some(std::mem::take(&mut completion.results));
                }
                WakeReason::Winch => handle_winch(state),
                WakeReason::NewWork => {}
            }
        }
        if *stopped {
            break None;
        }
        if found.is_some() {
            break found;
        }
    };

    if let Some(results) = results {
        if !results.is_empty() {
            let replacement = longest_common_prefix(&request.text, &results);
            let (editor, mut out) = state.parts();
            editor.apply_completion(&request, &replacement, &results, &mut out);
        }
    }
}

fn run_tasks(shared: &EditorShared, state: &mut EditorIo) {
    while let Some(query) = shared.tasks.pop() {
        let result = (query.task)(state);
        shared.replies.push(TaskReply {
            promise: query.promise,
            result,
        });
        shared.notify();
    }
}

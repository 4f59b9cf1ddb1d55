//! The line editor bridge: runs the terminal line editor on a dedicated
//! worker with stdout/stderr redirected through capture pipes, funnels
//! completion requests back to the host, and serialises every mutating
//! operation through a task queue.

mod line;
mod quoting;
mod redirector;
mod tasks;
mod worker;

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
};

use signal_hook_registry::{register_sigaction, unregister, SigId};

use crate::common::Error;
use crate::system::queue::Queue;
use crate::system::signal::consts::SIGWINCH;
use crate::system::wake::{WakePipe, WakeReason};

pub use line::CompletionRequest;
pub use tasks::{TaskHandle, Value};

use line::LineEdit;
use redirector::Redirector;
use tasks::{Task, TaskQuery};
use worker::{CompletionState, EditorIo, EditorShared};

/// Events delivered to the host callback during dispatch.
#[derive(Debug, PartialEq, Eq)]
pub enum EditorEvent {
    /// One or more complete input lines, in the order they were entered.
    Lines(Vec<String>),
    /// The editor wants completion candidates; answer with
    /// [`EditorBridge::complete`].
    Completion(CompletionRequest),
    /// End of input (Ctrl-D on an empty line, or stdin closed). The worker
    /// has shut itself down.
    Eof,
}

pub type EditorCallback = Box<dyn FnMut(EditorEvent) + Send>;

/// Host-side handle to the editor worker.
pub struct EditorBridge {
    wake: Arc<WakePipe>,
    shared: Arc<EditorShared>,
    callback: Mutex<Option<EditorCallback>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    winch: Mutex<Option<SigId>>,
}

impl EditorBridge {
    /// Create a bridge. `notify` is invoked (from the worker thread)
    /// whenever host work is pending; the host should schedule a call to
    /// [`EditorBridge::dispatch`] in response.
    pub fn new(notify: impl Fn() + Send + Sync + 'static) -> Result<Self, Error> {
        Ok(Self {
            wake: Arc::new(WakePipe::new().map_err(Error::Pipe)?),
            shared: Arc::new(EditorShared {
                tasks: Queue::new(),
                replies: Queue::new(),
                lines: Queue::new(),
                completion: Mutex::new(CompletionState {
                    in_complete: false,
                    request: None,
                    results: Vec::new(),
                }),
                pending_eof: AtomicBool::new(false),
                notify: Box::new(notify),
            }),
            callback: Mutex::new(None),
            worker: Mutex::new(None),
            winch: Mutex::new(None),
        })
    }

    /// Swap the process stdout/stderr for capture pipes and start the
    /// worker.
    pub fn start(&self, callback: impl FnMut(EditorEvent) + Send + 'static) -> Result<(), Error> {
        let mut worker_slot = self.worker.lock().unwrap();
        if worker_slot.is_some() {
            return Err(Error::AlreadyStarted);
        }

        *self.callback.lock().unwrap() = Some(Box::new(callback));

        let redirector = Redirector::new().map_err(Error::Pipe)?;
        let state = EditorIo {
            editor: LineEdit::new(),
            redirector,
            paused: false,
        };

        let wake_fd = self.wake.raw_writer();
        // SAFETY: the handler only calls write(2) on a non-blocking fd.
        let winch_id = unsafe {
            register_sigaction(SIGWINCH, move |_| {
                WakePipe::wake_raw(wake_fd, WakeReason::Winch)
            })
        }
        .map_err(Error::Io)?;
        *self.winch.lock().unwrap() = Some(winch_id);

        let wake = Arc::clone(&self.wake);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("line-editor".into())
            .spawn(move || worker::run(wake, shared, state))
            .map_err(Error::Io)?;
        *worker_slot = Some(handle);
        Ok(())
    }

    /// Stop the worker and restore the process streams and terminal modes.
    pub fn stop(&self) -> Result<(), Error> {
        let handle = self
            .worker
            .lock()
            .unwrap()
            .take()
            .ok_or(Error::AlreadyStopped)?;

        self.wake.wake(WakeReason::Stop);
        handle
            .join()
            .map_err(|_| Error::Io(std::io::Error::other("editor worker panicked")))?;

        if let Some(sig_id) = self.winch.lock().unwrap().take() {
            unregister(sig_id);
        }
        Ok(())
    }

    /// Deliver pending editor events and settle task promises. Called by
    /// the host loop after `notify` fires. Never blocks.
    pub fn dispatch(&self) {
        for reply in self.shared.replies.drain() {
            reply.promise.settle(reply.result);
        }

        let lines = self.shared.lines.drain();
        let completion = self.shared.completion.lock().unwrap().request.take();
        let eof = self.shared.pending_eof.swap(false, Ordering::SeqCst);

        let mut callback = self.callback.lock().unwrap();
        let Some(callback) = callback.as_mut() else {
            return;
        };
        if !lines.is_empty() {
            callback(EditorEvent::Lines(lines));
        }
        if let Some(request) = completion {
            callback(EditorEvent::Completion(request));
        }
        if eof {
            callback(EditorEvent::Eof);
        }
    }

    /// Answer an outstanding completion request.
    ///
    /// The editor inserts the longest common prefix of `results` and lists
    /// the candidates. Calling this outside a completion window is an
    /// error, as is a second call for the same request.
    pub fn complete(&self, results: Vec<String>) -> Result<(), Error> {
        {
            let mut completion = self.shared.completion.lock().unwrap();
            if !completion.in_complete {
                return Err(Error::CompletionMisuse);
            }
            completion.in_complete = false;
            completion.results = results;
        }
        self.wake.wake(WakeReason::Complete);
        Ok(())
    }

    fn run_task(&self, task: Task) -> Result<TaskHandle, Error> {
        if self.worker.lock().unwrap().is_none() {
            return Err(Error::AlreadyStopped);
        }
        let (handle, promise) = TaskHandle::new();
        self.shared.tasks.push(TaskQuery { task, promise });
        self.wake.wake(WakeReason::Task);
        Ok(handle)
    }

    /// Replace the prompt and redraw.
    pub fn set_prompt(&self, prompt: &str) -> Result<TaskHandle, Error> {
        let prompt = prompt.to_string();
        self.run_task(Box::new(move |state| {
            let (editor, mut out) = state.parts();
            editor.set_prompt(prompt, &mut out);
            Ok(Value::None)
        }))
    }

    /// Append a line to the history (skipping a repeat of the latest
    /// entry); when `write` is set and a history path is known, rewrite the
    /// file. Resolves to `Bool(true)` when the line was added.
    pub fn add_history(&self, line: &str, write: bool) -> Result<TaskHandle, Error> {
        let line = line.to_string();
        self.run_task(Box::new(move |state| {
            let added = state.editor.add_history(&line, write)?;
            Ok(Value::Bool(added))
        }))
    }

    /// Load history from `path` and remember it for later writes. Resolves
    /// to `Bool(existed)`.
    pub fn read_history(&self, path: impl Into<PathBuf>) -> Result<TaskHandle, Error> {
        let path = path.into();
        self.run_task(Box::new(move |state| {
            let existed = state.editor.read_history_file(path)?;
            Ok(Value::Bool(existed))
        }))
    }

    /// Write the history to `path` and remember it for later writes.
    pub fn write_history(&self, path: impl Into<PathBuf>) -> Result<TaskHandle, Error> {
        let path = path.into();
        self.run_task(Box::new(move |state| {
            state.editor.write_history_file(&path)?;
            Ok(Value::None)
        }))
    }

    /// Blank the prompt, silence the capture pipes, and hand the terminal
    /// back in cooked mode. Idempotent.
    pub fn pause(&self) -> Result<TaskHandle, Error> {
        self.run_task(Box::new(move |state| {
            if state.paused {
                return Ok(Value::None);
            }
            state.paused = true;
            {
                let (editor, mut out) = state.parts();
                editor.hide(&mut out);
            }
            state.editor.deinstall();
            state.redirector.quiet();
            Ok(Value::None)
        }))
    }

    /// Undo [`EditorBridge::pause`]: re-enter raw mode, restore the capture
    /// pipes, and show the prompt. Idempotent.
    pub fn resume(&self) -> Result<TaskHandle, Error> {
        self.run_task(Box::new(move |state| {
            if !state.paused {
                return Ok(Value::None);
            }
            state.paused = false;
            state.redirector.resume();
            let (editor, mut out) = state.parts();
            editor.install(&mut out);
            Ok(Value::None)
        }))
    }

    /// Abandon the current input line and show a fresh prompt.
    pub fn clear(&self) -> Result<TaskHandle, Error> {
        self.run_task(Box::new(move |state| {
            let (editor, mut out) = state.parts();
            editor.clear_line(&mut out);
            Ok(Value::None)
        }))
    }
}

impl Drop for EditorBridge {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::tasks::{TaskHandle, TaskReply};
    use super::{EditorBridge, EditorEvent, Error, Value};

    #[test]
    fn dispatch_batches_lines_in_order() {
        let bridge = EditorBridge::new(|| {}).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        *bridge.callback.lock().unwrap() =
            Some(Box::new(move |event| sink.lock().unwrap().push(event)));

        bridge.shared.lines.push("ls".into());
        bridge.shared.lines.push("pwd".into());
        bridge.dispatch();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![EditorEvent::Lines(vec!["ls".into(), "pwd".into()])]
        );

        // Nothing left to deliver.
        seen.lock().unwrap().clear();
        bridge.dispatch();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn dispatch_settles_task_replies() {
        let bridge = EditorBridge::new(|| {}).unwrap();
        let (handle, promise) = TaskHandle::new();
        bridge.shared.replies.push(TaskReply {
            promise,
            result: Ok(Value::Bool(true)),
        });

        assert!(handle.try_take().is_none());
        bridge.dispatch();
        assert_eq!(handle.try_take().unwrap().unwrap(), Value::Bool(true));
    }

    #[test]
    fn complete_outside_a_window_is_misuse() {
        let bridge = EditorBridge::new(|| {}).unwrap();
        assert!(matches!(
            bridge.complete(vec!["x".into()]),
            Err(Error::CompletionMisuse)
        ));
    }

    #[test]
    fn complete_consumes_the_window() {
        let bridge = EditorBridge::new(|| {}).unwrap();
        bridge.shared.completion.lock().unwrap().in_complete = true;

        bridge.complete(vec!["alpha".into()]).unwrap();
        // The window is closed; answering again is misuse.
        assert!(matches!(
            bridge.complete(vec!["beta".into()]),
            Err(Error::CompletionMisuse)
        ));
        assert_eq!(
            bridge.shared.completion.lock().unwrap().results,
            vec!["alpha".to_string()]
        );
    }

    #[test]
    fn tasks_require_a_running_worker() {
        let bridge = EditorBridge::new(|| {}).unwrap();
        assert!(matches!(
            bridge.set_prompt("> "),
            Err(Error::AlreadyStopped)
        ));
        assert!(matches!(bridge.stop(), Err(Error::AlreadyStopped)));
    }

    #[test]
    fn dispatch_without_events_is_a_no_op() {
        let bridge = EditorBridge::new(|| {}).unwrap();
        bridge.dispatch();
    }
}

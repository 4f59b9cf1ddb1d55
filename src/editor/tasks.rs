//! Serialised editor mutations.
//!
//! Everything that touches editor state from outside is expressed as a
//! closure posted onto the worker's task queue together with a promise
//! handle; the worker runs the closure on its own thread and the reply is
//! settled during host dispatch. This removes every need to lock editor
//! internals.

use std::sync::{Arc, Condvar, Mutex};

use crate::common::Error;

/// A small variant carried by task replies, so one promise type serves
/// every editor operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Str(String),
}

pub(crate) type Task =
    Box<dyn FnOnce(&mut super::worker::EditorIo) -> Result<Value, Error> + Send>;

pub(crate) struct TaskQuery {
    pub(crate) task: Task,
    pub(crate) promise: TaskPromise,
}

pub(crate) struct TaskReply {
    pub(crate) promise: TaskPromise,
    pub(crate) result: Result<Value, Error>,
}

struct PromiseState {
    slot: Mutex<Option<Result<Value, Error>>>,
    cond: Condvar,
}

/// Worker-side settle handle for one task.
#[derive(Clone)]
pub(crate) struct TaskPromise {
    state: Arc<PromiseState>,
}

impl TaskPromise {
    pub(crate) fn settle(&self, result: Result<Value, Error>) {
        let mut slot = self.state.slot.lock().unwrap();
        *slot = Some(result);
        self.state.cond.notify_all();
    }
}

/// Host-side handle for a queued editor task.
///
/// The reply arrives once the worker has run the task and the host has
/// dispatched the settle; `try_take` polls, `wait` blocks (and therefore
/// must not be called from the thread that drives dispatch).
pub struct TaskHandle {
    state: Arc<PromiseState>,
}

impl TaskHandle {
    pub(crate) fn new() -> (Self, TaskPromise) {
        let state = Arc::new(PromiseState {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        });
        (
            Self {
                state: Arc::clone(&state),
            },
            TaskPromise { state },
        )
    }

    /// Take the result if the task has been settled.
    pub fn try_take(&self) -> Option<Result<Value, Error>> {
        self.state.slot.lock().unwrap().take()
    }

    /// Block until the task settles.
    pub fn wait(self) -> Result<Value, Error> {
        let mut slot = self.state.slot.lock().unwrap();
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            slot = self.state.cond.wait(slot).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{TaskHandle, Value};

    #[test]
    fn settle_then_wait() {
        let (handle, promise) = TaskHandle::new();
        promise.settle(Ok(Value::Int(7)));
        assert_eq!(handle.wait().unwrap(), Value::Int(7));
    }

    #[test]
    fn try_take_is_empty_until_settled() {
        let (handle, promise) = TaskHandle::new();
        assert!(handle.try_take().is_none());

        promise.settle(Ok(Value::Bool(true)));
        assert_eq!(handle.try_take().unwrap().unwrap(), Value::Bool(true));
        // A reply is taken at most once.
        assert!(handle.try_take().is_none());
    }

    #[test]
    fn wait_across_threads() {
        let (handle, promise) = TaskHandle::new();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            promise.settle(Ok(Value::Str("done".into())));
        });

        assert_eq!(handle.wait().unwrap(), Value::Str("done".into()));
        worker.join().unwrap();
    }
}

use std::sync::Mutex;

use crate::log::user_warn;
use crate::system::queue::Queue;

/// Callback receiving one owned buffer of child output.
pub type Listener = Box<dyn FnMut(Vec<u8>) + Send>;

/// A one-producer/one-consumer channel carrying one child stream's output
/// from the supervisor worker to the host.
///
/// The worker pushes owned buffers in read order; the host flushes them to
/// the listener during dispatch. Buffers that arrive before a listener is
/// attached are staged and replayed in order on attach. The staging area is
/// bounded; on overflow the oldest staged buffer is dropped.
pub struct BufferEmitter {
    queue: Queue<Vec<u8>>,
    state: Mutex<ListenerState>,
}

struct ListenerState {
    listener: Option<Listener>,
    pending: Vec<Vec<u8>>,
}

impl BufferEmitter {
    const MAX_PENDING: usize = 256;

    pub(crate) fn new() -> Self {
        Self {
            queue: Queue::new(),
            state: Mutex::new(ListenerState {
                listener: None,
                pending: Vec::new(),
            }),
        }
    }

    /// Worker side: hand over one owned buffer.
    pub(crate) fn emit(&self, buf: Vec<u8>) {
        self.queue.push(buf);
    }

    /// Host side: deliver everything queued so far.
    pub(crate) fn flush(&self) {
        let mut state = self.state.lock().unwrap();
        while let Some(buf) = self.queue.pop() {
            match &mut state.listener {
                Some(listener) => listener(buf),
                None => {
                    if state.pending.len() == Self::MAX_PENDING {
                        state.pending.remove(0);
                        user_warn!("child output dropped: no listener and staging is full");
                    }
                    state.pending.push(buf);
                }
            }
        }
    }

    /// Attach the listener, replaying staged buffers in order.
    ///
    /// At most one listener may be attached at a time.
    pub fn listen(&self, mut listener: Listener) -> Result<(), crate::common::Error> {
        let mut state = self.state.lock().unwrap();
        if state.listener.is_some() {
            return Err(crate::common::Error::BadArgument(
                "emitter already has a listener",
            ));
        }
        for buf in state.pending.drain(..) {
            listener(buf);
        }
        state.listener = Some(listener);
        Ok(())
    }

    /// Detach the listener, if any. Output produced afterwards is staged
    /// again.
    pub fn unlisten(&self) {
        self.state.lock().unwrap().listener = None;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::BufferEmitter;

    fn collector() -> (Arc<Mutex<Vec<Vec<u8>>>>, super::Listener) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (
            seen,
            Box::new(move |buf| sink.lock().unwrap().push(buf)),
        )
    }

    #[test]
    fn delivers_in_order() {
        let emitter = BufferEmitter::new();
        let (seen, listener) = collector();
        emitter.listen(listener).unwrap();

        emitter.emit(b"a".to_vec());
        emitter.emit(b"b".to_vec());
        emitter.flush();

        assert_eq!(*seen.lock().unwrap(), vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn stages_until_listener_attaches() {
        let emitter = BufferEmitter::new();
        emitter.emit(b"early".to_vec());
        emitter.flush();

        let (seen, listener) = collector();
        emitter.listen(listener).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![b"early".to_vec()]);
    }

    #[test]
    fn second_listener_is_rejected() {
        let emitter = BufferEmitter::new();
        emitter.listen(Box::new(|_| {})).unwrap();
        assert!(emitter.listen(Box::new(|_| {})).is_err());

        emitter.unlisten();
        assert!(emitter.listen(Box::new(|_| {})).is_ok());
    }

    #[test]
    fn staging_is_bounded() {
        let emitter = BufferEmitter::new();
        for i in 0..(BufferEmitter::MAX_PENDING + 10) {
            emitter.emit(format!("{i}").into_bytes());
        }
        emitter.flush();

        let (seen, listener) = collector();
        emitter.listen(listener).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), BufferEmitter::MAX_PENDING);
        // The oldest buffers were dropped, the newest kept.
        assert_eq!(seen.last().unwrap(), format!("{}", BufferEmitter::MAX_PENDING + 9).as_bytes());
    }
}

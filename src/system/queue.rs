use std::{collections::VecDeque, sync::Mutex};

/// A mutex-guarded FIFO of owned values.
///
/// `push` never blocks beyond the lock and `pop` returns `None` when empty;
/// producers pair a push with a wakeup byte on the consumer's pipe.
pub(crate) struct Queue<T> {
    inner: Mutex<VecDeque<T>>,
}

impl<T> Queue<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn push(&self, value: T) {
        self.inner.lock().unwrap().push_back(value);
    }

    pub(crate) fn pop(&self) -> Option<T> {
        self.inner.lock().unwrap().pop_front()
    }

    /// Pop everything queued so far in FIFO order.
    pub(crate) fn drain(&self) -> Vec<T> {
        self.inner.lock().unwrap().drain(..).collect()
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::Queue;

    #[test]
    fn fifo_order() {
        let queue = Queue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);

        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.drain(), vec![2, 3]);
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn cross_thread() {
        use std::sync::Arc;

        let queue = Arc::new(Queue::new());
        let producer = Arc::clone(&queue);
        let handle = std::thread::spawn(move || {
            for i in 0..100 {
                producer.push(i);
            }
        });
        handle.join().unwrap();

        assert_eq!(queue.drain(), (0..100).collect::<Vec<_>>());
    }
}

use std::{
    io,
    os::fd::{AsRawFd, RawFd},
};

use libc::{c_short, pollfd, POLLHUP, POLLIN, POLLOUT};

use crate::cutils::cerr;
use crate::system::was_interrupted;

/// The kind of readiness that will be monitored for a file descriptor.
#[derive(Copy, Clone, PartialEq, Eq)]
pub(crate) enum PollEvent {
    /// Data may be read without blocking.
    Readable,
    /// Data may be written without blocking.
    Writable,
}

/// A keyed set of file descriptors to be multiplexed with
/// [`poll`](https://manpage.me/?q=poll).
///
/// The set is rebuilt by its owner on every loop iteration, so keys are kept
/// in insertion order and duplicates are allowed.
pub(crate) struct PollSet<K> {
    entries: Vec<(K, RawFd, c_short)>,
}

impl<K: Clone> PollSet<K> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    /// Add a descriptor to be checked for the given readiness.
    pub(crate) fn insert<F: AsRawFd>(&mut self, key: K, fd: &F, event: PollEvent) {
        self.insert_raw(key, fd.as_raw_fd(), event)
    }

    pub(crate) fn insert_raw(&mut self, key: K, fd: RawFd, event: PollEvent) {
        let events = match event {
            PollEvent::Readable => POLLIN,
            PollEvent::Writable => POLLOUT,
        };
        self.entries.push((key, fd, events));
    }

    /// Block until at least one descriptor in the set is ready and return the
    /// keys of every ready descriptor.
    ///
    /// A descriptor whose peer has hung up counts as ready so the owner can
    /// observe the EOF on its next read.
    pub(crate) fn poll(&mut self) -> io::Result<Vec<K>> {
        let mut fds: Vec<pollfd> = self
            .entries
            .iter()
            .map(|&(_, fd, events)| pollfd {
                fd,
                events,
                revents: 0,
            })
            .collect();

        loop {
            // SAFETY: `fds` is a valid array of initialized pollfd structs
            match cerr(unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as _, -1) }) {
                Err(err) if was_interrupted(&err) => {}
                Err(err) => return Err(err),
                Ok(_) => break,
            }
        }

        let mut keys = Vec::new();

        for ((key, _, _), fd) in self.entries.iter().zip(fds) {
            let events = (fd.events | POLLHUP) & fd.revents;

            if (events & POLLIN != 0) || (events & POLLOUT != 0) || (events & POLLHUP != 0) {
                keys.push(key.clone());
            }
        }

        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    use super::{PollEvent, PollSet};

    #[test]
    fn readable_after_write() {
        let (mut tx, rx) = UnixStream::pair().unwrap();

        let mut set = PollSet::new();
        set.insert("rx", &rx, PollEvent::Readable);
        set.insert("tx", &tx, PollEvent::Writable);

        tx.write_all(b"x").unwrap();

        let ready = set.poll().unwrap();
        assert!(ready.contains(&"rx"));
        assert!(ready.contains(&"tx"));
    }

    #[test]
    fn hangup_counts_as_readable() {
        let (tx, rx) = UnixStream::pair().unwrap();
        drop(tx);

        let mut set = PollSet::new();
        set.insert((), &rx, PollEvent::Readable);

        assert_eq!(set.poll().unwrap(), vec![()]);
    }
}

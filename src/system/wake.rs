use std::{
    io,
    os::fd::{AsRawFd, OwnedFd, RawFd},
};

use crate::cutils::cerr;
use crate::system::{pipe, retry_while_interrupted, set_nonblocking};

/// Why a worker was woken up.
///
/// A single byte on the wakeup pipe identifies the reason; duplicates are
/// permissible and coalesce (the worker re-checks its queues after each
/// drain, so more bytes than distinct events cause no harm).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum WakeReason {
    /// New work was queued for the worker.
    NewWork = b'w',
    /// The worker should return from its loop.
    Stop = b'q',
    /// Editor: queued task closures are pending.
    Task = b't',
    /// Editor: completion results have been supplied.
    Complete = b'c',
    /// Editor: the terminal was resized.
    Winch = b'z',
}

impl WakeReason {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'w' => Some(Self::NewWork),
            b'q' => Some(Self::Stop),
            b't' => Some(Self::Task),
            b'c' => Some(Self::Complete),
            b'z' => Some(Self::Winch),
            _ => None,
        }
    }
}

/// A non-blocking self-pipe used to interrupt a worker's poll loop.
pub(crate) struct WakePipe {
    rx: OwnedFd,
    tx: OwnedFd,
}

impl WakePipe {
    pub(crate) fn new() -> io::Result<Self> {
        let (rx, tx) = pipe()?;
        set_nonblocking(&rx)?;
        set_nonblocking(&tx)?;
        Ok(Self { rx, tx })
    }

    /// Post a reason byte. Never blocks; a full pipe means enough wakeups
    /// are already in flight.
    pub(crate) fn wake(&self, reason: WakeReason) {
        let byte = [reason as u8];
        let _ = retry_while_interrupted(|| {
            // SAFETY: we write one byte from a valid buffer to an owned fd
            cerr(unsafe { libc::write(self.tx.as_raw_fd(), byte.as_ptr().cast(), 1) })
        });
    }

    /// The raw writer fd, for async-signal contexts that must not touch the
    /// `WakePipe` object itself.
    pub(crate) fn raw_writer(&self) -> RawFd {
        self.tx.as_raw_fd()
    }

    /// Read every pending reason byte without blocking.
    pub(crate) fn drain(&self) -> Vec<WakeReason> {
        let mut reasons = Vec::new();
        let mut buf = [0u8; 32];
        loop {
            // SAFETY: we read into a valid buffer of 32 bytes
            match cerr(unsafe {
                libc::read(self.rx.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
            }) {
                Ok(0) => break,
                Ok(n) => reasons.extend(
                    buf[..n as usize]
                        .iter()
                        .filter_map(|&b| WakeReason::from_byte(b)),
                ),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
        reasons
    }

    /// Write a reason byte to a raw writer fd. Async-signal-safe.
    pub(crate) fn wake_raw(tx: RawFd, reason: WakeReason) {
        let byte = [reason as u8];
        // SAFETY: write(2) is async-signal-safe; the fd is non-blocking
        unsafe {
            while libc::write(tx, byte.as_ptr().cast(), 1) == -1
                && std::io::Error::last_os_error().kind() == io::ErrorKind::Interrupted
            {}
        }
    }
}

impl AsRawFd for WakePipe {
    fn as_raw_fd(&self) -> RawFd {
        self.rx.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::{WakePipe, WakeReason};

    #[test]
    fn wake_and_drain() {
        let pipe = WakePipe::new().unwrap();
        assert!(pipe.drain().is_empty());

        pipe.wake(WakeReason::NewWork);
        pipe.wake(WakeReason::Stop);
        assert_eq!(pipe.drain(), vec![WakeReason::NewWork, WakeReason::Stop]);
        assert!(pipe.drain().is_empty());
    }

    #[test]
    fn raw_writer_reaches_reader() {
        let pipe = WakePipe::new().unwrap();
        WakePipe::wake_raw(pipe.raw_writer(), WakeReason::Winch);
        assert_eq!(pipe.drain(), vec![WakeReason::Winch]);
    }
}

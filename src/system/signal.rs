//! Utilities to handle signals.

// It should be possible to implement the same functionality without
// `signal_hook` and `signal_hook_registry` without much effort. But given
// that async-signal-safety can be tricky we keep using those crates unless
// those dependencies become a concern.
use std::{
    borrow::Cow,
    io::{self, Read},
    os::{
        fd::{AsRawFd, RawFd},
        unix::net::UnixStream,
    },
};

use signal_hook_registry::{register_sigaction, unregister, SigId};

use crate::cutils::cerr;

pub type SignalNumber = libc::c_int;

pub(crate) mod consts {
    pub(crate) use libc::{
        SIGCHLD, SIGCONT, SIGINT, SIGQUIT, SIGTSTP, SIGTTIN, SIGTTOU, SIGWINCH,
    };
}

pub(crate) fn signal_name(signal: SignalNumber) -> Cow<'static, str> {
    match signal_hook::low_level::signal_name(signal) {
        Some(name) => name.into(),
        None => format!("unknown signal ({signal})").into(),
    }
}

/// A self-pipe that streams the numbers of arriving signals into a
/// poll-driven loop.
///
/// The registered handler writes a single byte per signal arrival; bytes for
/// the same signal may coalesce with pipe backpressure, which is fine because
/// receivers always re-check the world after each drained byte.
pub(crate) struct SignalStream {
    rx: UnixStream,
    // Kept so the socket pair stays open for the lifetime of the handler.
    _tx: UnixStream,
    sig_ids: Vec<SigId>,
}

fn send(tx: RawFd, signal: SignalNumber) {
    let byte = [signal as u8];
    // SAFETY: `send` is async-signal-safe; MSG_DONTWAIT keeps the handler
    // from ever blocking on a full socket buffer.
    unsafe { libc::send(tx, byte.as_ptr().cast(), 1, libc::MSG_DONTWAIT) };
}

impl SignalStream {
    /// Register a streaming handler for each of `signals`.
    pub(crate) fn register(signals: &[SignalNumber]) -> io::Result<Self> {
        let (rx, tx) = UnixStream::pair()?;
        rx.set_nonblocking(true)?;

        let mut sig_ids = Vec::with_capacity(signals.len());
        for &signal in signals {
            let tx_fd = tx.as_raw_fd();
            // SAFETY: the closure only calls `send` with MSG_DONTWAIT, which
            // is async-signal-safe, and does not panic or allocate.
            let sig_id = unsafe { register_sigaction(signal, move |_info| send(tx_fd, signal)) }?;
            sig_ids.push(sig_id);
        }

        Ok(Self {
            rx,
            _tx: tx,
            sig_ids,
        })
    }

    /// Read every pending signal byte without blocking.
    pub(crate) fn drain(&mut self) -> Vec<SignalNumber> {
        let mut signals = Vec::new();
        let mut buf = [0u8; 32];
        loop {
            match self.rx.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => signals.extend(buf[..n].iter().map(|&b| b as SignalNumber)),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
        signals
    }
}

impl AsRawFd for SignalStream {
    fn as_raw_fd(&self) -> RawFd {
        self.rx.as_raw_fd()
    }
}

impl Drop for SignalStream {
    fn drop(&mut self) {
        for &sig_id in &self.sig_ids {
            unregister(sig_id);
        }
    }
}

fn zeroed_sigaction() -> libc::sigaction {
    // SAFETY: sigaction is a plain-old-data struct for which zeroes are a
    // valid (SIG_DFL, empty mask) representation.
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    // SAFETY: we pass a valid pointer to the embedded mask
    unsafe { libc::sigemptyset(&mut action.sa_mask) };
    action
}

/// A scoped signal disposition.
///
/// When a value of this type is dropped, it restores the action that was
/// registered for the signal before.
pub(crate) struct SignalGuard {
    signal: SignalNumber,
    original: libc::sigaction,
}

impl SignalGuard {
    /// Ignore `signal` until the guard is dropped or forgotten.
    pub(crate) fn ignore(signal: SignalNumber) -> io::Result<Self> {
        Self::set(signal, libc::SIG_IGN)
    }

    fn set(signal: SignalNumber, handler: libc::sighandler_t) -> io::Result<Self> {
        let mut action = zeroed_sigaction();
        action.sa_sigaction = handler;

        let mut original = zeroed_sigaction();
        // SAFETY: both pointers are valid and `handler` is SIG_IGN/SIG_DFL
        cerr(unsafe { libc::sigaction(signal, &action, &mut original) })?;

        Ok(Self { signal, original })
    }

    /// Keep the new disposition permanently.
    pub(crate) fn forget(self) {
        std::mem::forget(self)
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        // SAFETY: `original` came from a successful sigaction call
        if unsafe { libc::sigaction(self.signal, &self.original, std::ptr::null_mut()) } == -1 {
            crate::log::dev_warn!(
                "cannot restore original action for {}",
                signal_name(self.signal)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{consts::*, signal_name, SignalStream};
    use crate::system::{getpid, kill};

    #[test]
    fn names() {
        assert_eq!(signal_name(SIGCHLD), "SIGCHLD");
        assert_eq!(signal_name(-1), "unknown signal (-1)");
    }

    #[test]
    fn stream_receives_signal() {
        let mut stream = SignalStream::register(&[SIGWINCH]).unwrap();

        kill(getpid(), SIGWINCH).unwrap();

        // The byte is in flight; poll for it.
        let mut seen = Vec::new();
        for _ in 0..100 {
            seen = stream.drain();
            if !seen.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(seen, vec![SIGWINCH]);
    }
}

//! The supervisor worker: one dedicated thread that owns every enrolled
//! child's file descriptors, multiplexes reads and writes, and reaps on
//! SIGCHLD.

use std::{
    collections::VecDeque,
    io,
    os::fd::{AsRawFd, OwnedFd},
    sync::{Arc, Mutex},
};

use crate::cutils::cerr;
use crate::log::{dev_info, dev_warn};
use crate::system::poll::{PollEvent, PollSet};
use crate::system::signal::{consts::SIGCHLD, SignalStream};
use crate::system::term::TermAttrs;
use crate::system::wait::{Wait, WaitError, WaitOptions};
use crate::system::wake::{WakePipe, WakeReason};

use super::emitter::BufferEmitter;
use super::process::{OutputStream, Proc, ProcState, StatusEvent};
use super::registry::FdRegistry;
use super::{HostChannel, HostWork};

const READ_CHUNK: usize = 16 * 1024;

/// Worker-owned side of one enrolled child.
pub(crate) struct ProcIo {
    pub(crate) proc: Arc<Proc>,
    pub(crate) stdin: Option<OwnedFd>,
    pub(crate) stdout: Option<OwnedFd>,
    pub(crate) stderr: Option<OwnedFd>,
    pub(crate) out_emitter: Option<Arc<BufferEmitter>>,
    pub(crate) err_emitter: Option<Arc<BufferEmitter>>,
    pub(crate) write_queue: VecDeque<Vec<u8>>,
    pub(crate) write_offset: usize,
    /// Set when a write hit EAGAIN; cleared when poll reports stdin
    /// writable again.
    pub(crate) needs_write: bool,
}

impl ProcIo {
    fn outputs_closed(&self) -> bool {
        self.stdout.is_none() && self.stderr.is_none()
    }
}

/// Work handed to the worker by the host.
pub(crate) struct Inbox {
    pub(crate) new_procs: Vec<ProcIo>,
    pub(crate) stopped: bool,
}

pub(crate) struct WorkerChannels {
    pub(crate) wake: Arc<WakePipe>,
    pub(crate) inbox: Arc<Mutex<Inbox>>,
    pub(crate) host: Arc<HostChannel>,
    pub(crate) registry: Arc<FdRegistry>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Key {
    Wake,
    Sig,
    Out(usize, OutputStream),
    In(usize),
}

pub(crate) fn run(channels: WorkerChannels, mut sigchld: SignalStream) {
    let mut procs: Vec<ProcIo> = Vec::new();
    let mut poll_set = PollSet::new();

    loop {
        // Take on new work. A process may have died between fork and
        // enrolment; sweep immediately so its status is not stranded until
        // the next (possibly coalesced-away) SIGCHLD.
        let got_new = {
            let mut inbox = channels.inbox.lock().unwrap();
            let got_new = !inbox.new_procs.is_empty();
            procs.append(&mut inbox.new_procs);
            got_new
        };
        if got_new {
            reap(&mut procs, &channels);
        }

        for io in procs.iter_mut() {
            service_stdin(io, &channels);
        }

        // Drop children that are fully done: reaped, output drained, exit
        // reported. Their stdin (if any) goes with them.
        procs.retain_mut(|io| {
            let finished =
                io.outputs_closed() && io.proc.shared.lock().unwrap().exit_reported;
            if finished {
                close_stdin(io, &channels.registry);
            }
            !finished
        });

        poll_set.clear();
        poll_set.insert(Key::Wake, &*channels.wake, PollEvent::Readable);
        poll_set.insert(Key::Sig, &sigchld, PollEvent::Readable);
        for (index, io) in procs.iter().enumerate() {
            if let Some(fd) = &io.stdout {
                poll_set.insert(Key::Out(index, OutputStream::Stdout), fd, PollEvent::Readable);
            }
            if let Some(fd) = &io.stderr {
                poll_set.insert(Key::Out(index, OutputStream::Stderr), fd, PollEvent::Readable);
            }
            if io.needs_write {
                if let Some(fd) = &io.stdin {
                    poll_set.insert(Key::In(index), fd, PollEvent::Writable);
                }
            }
        }

        let ready = match poll_set.poll() {
            Ok(ready) => ready,
            Err(err) => {
                dev_warn!("supervisor poll failed: {err}");
                continue;
            }
        };

        let mut should_stop = false;
        for key in ready {
            match key {
                Key::Wake => {
                    for reason in channels.wake.drain() {
                        if reason == WakeReason::Stop {
                            should_stop = true;
                        }
                    }
                    if channels.inbox.lock().unwrap().stopped {
                        should_stop = true;
                    }
                }
                Key::Sig => {
                    for signal in sigchld.drain() {
                        if signal == SIGCHLD {
                            reap(&mut procs, &channels);
                        }
                    }
                }
                Key::Out(index, stream) => handle_read(&mut procs[index], stream, &channels),
                Key::In(index) => procs[index].needs_write = false,
            }
        }

        if should_stop {
            // In-flight children are not killed; just stop watching their
            // descriptors.
            for io in procs.iter_mut() {
                deregister_all(io, &channels.registry);
            }
            return;
        }
    }
}

/// Splice queued writes, try to push them out, close stdin once drained if
/// requested.
fn service_stdin(io: &mut ProcIo, channels: &WorkerChannels) {
    let pending_close = {
        let mut shared = io.proc.shared.lock().unwrap();
        io.write_queue.extend(shared.new_writes.drain(..));
        shared.pending_close
    };

    if !io.write_queue.is_empty() && !io.needs_write {
        handle_write(io, &channels.registry);
    }

    if io.write_queue.is_empty() && io.stdin.is_some() && pending_close {
        io.proc.shared.lock().unwrap().pending_close = false;
        close_stdin(io, &channels.registry);
    }
}

/// Drain the write queue opportunistically. EAGAIN arms the writability
/// poll; a hard error closes stdin and silently discards the queue.
fn handle_write(io: &mut ProcIo, registry: &FdRegistry) {
    let Some(stdin) = &io.stdin else {
        io.write_queue.clear();
        io.write_offset = 0;
        return;
    };
    let fd = stdin.as_raw_fd();

    while let Some(front) = io.write_queue.front() {
        let remaining = &front[io.write_offset..];
        // SAFETY: the buffer is valid for `remaining.len()` bytes
        match cerr(unsafe { libc::write(fd, remaining.as_ptr().cast(), remaining.len()) }) {
            Ok(written) => {
                io.write_offset += written as usize;
                if io.write_offset == front.len() {
                    io.write_offset = 0;
                    io.write_queue.pop_front();
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                io.needs_write = true;
                return;
            }
            Err(_) => {
                // Broken stdin: the child closed its end. Pending writes
                // are discarded and later writes become no-ops.
                close_stdin(io, registry);
                io.write_queue.clear();
                io.write_offset = 0;
                return;
            }
        }
    }
}

/// Read a ready output stream until EAGAIN or EOF, handing each chunk to
/// the stream's emitter.
fn handle_read(io: &mut ProcIo, stream: OutputStream, channels: &WorkerChannels) {
    let (slot, emitter) = match stream {
        OutputStream::Stdout => (&mut io.stdout, &io.out_emitter),
        OutputStream::Stderr => (&mut io.stderr, &io.err_emitter),
    };
    let Some(fd) = slot.as_ref().map(|fd| fd.as_raw_fd()) else {
        return;
    };

    let mut buf = [0u8; READ_CHUNK];
    let mut emitted = false;
    loop {
        // SAFETY: we read into a valid buffer of READ_CHUNK bytes
        match cerr(unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) }) {
            Ok(0) => {
                channels.registry.deregister(fd);
                *slot = None;
                break;
            }
            Ok(n) => {
                if let Some(emitter) = emitter {
                    emitter.emit(buf[..n as usize].to_vec());
                    emitted = true;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) => {
                dev_info!("read error on child stream: {err}");
                channels.registry.deregister(fd);
                *slot = None;
                break;
            }
        }
    }

    if emitted {
        if let Some(emitter) = emitter {
            channels.host.push(HostWork::Flush(Arc::clone(emitter)));
        }
    }

    // All output is in flight; if the child is already reaped, the exit
    // event may now follow it.
    if io.outputs_closed() {
        let exited = io.proc.shared.lock().unwrap().state == ProcState::Exited;
        if exited {
            queue_exit(io, channels);
        }
    }
}

/// Sweep every known child with waitpid(WNOHANG|WUNTRACED).
///
/// SIGCHLD coalesces: one byte may stand for any number of state changes,
/// so each sweep visits every pid.
fn reap(procs: &mut [ProcIo], channels: &WorkerChannels) {
    for io in procs.iter_mut() {
        let state = io.proc.shared.lock().unwrap().state;
        if matches!(state, ProcState::Exited | ProcState::Failed) {
            continue;
        }

        let status = match io.proc.pid.wait(WaitOptions::new().no_hang().untraced()) {
            Ok((_, status)) => status,
            Err(WaitError::NotReady) => continue,
            Err(WaitError::Io(err)) => {
                dev_info!("cannot wait for {}: {err}", io.proc.pid);
                continue;
            }
        };

        if let Some(signal) = status.stop_signal() {
            {
                let mut shared = io.proc.shared.lock().unwrap();
                shared.state = ProcState::Stopped;
                shared.status = signal;
                // Snapshot the terminal so a later foreground resume can
                // restore what the child was working with. If the child
                // stopped before touching the terminal these are simply the
                // modes in effect right now.
                shared.saved_tmodes = TermAttrs::get(&io::stdin()).ok();
            }
            channels
                .host
                .push(HostWork::Status(Arc::clone(&io.proc), StatusEvent::Stopped(signal)));
        } else {
            let status = match (status.exit_status(), status.term_signal()) {
                (Some(code), _) => code,
                (None, Some(signal)) => -signal,
                (None, None) => continue,
            };
            {
                let mut shared = io.proc.shared.lock().unwrap();
                shared.state = ProcState::Exited;
                shared.status = status;
            }
            // Output must drain before the exit is visible; the read path
            // queues it once the last stream closes.
            if io.outputs_closed() {
                queue_exit(io, channels);
            }
        }
    }
}

fn queue_exit(io: &mut ProcIo, channels: &WorkerChannels) {
    let status = {
        let mut shared = io.proc.shared.lock().unwrap();
        if shared.exit_reported {
            return;
        }
        shared.exit_reported = true;
        shared.status
    };
    channels
        .host
        .push(HostWork::Status(Arc::clone(&io.proc), StatusEvent::Exited(status)));
}

fn close_stdin(io: &mut ProcIo, registry: &FdRegistry) {
    if let Some(fd) = io.stdin.take() {
        registry.deregister(fd.as_raw_fd());
    }
}

fn deregister_all(io: &mut ProcIo, registry: &FdRegistry) {
    for fd in [&io.stdin, &io.stdout, &io.stderr].into_iter().flatten() {
        registry.deregister(fd.as_raw_fd());
    }
}

/// Enrol a spawned child with the worker.
pub(crate) fn enrol(
    channels: &WorkerChannels,
    proc: Arc<Proc>,
    stdin: Option<OwnedFd>,
    stdout: Option<OwnedFd>,
    stderr: Option<OwnedFd>,
    out_emitter: Option<Arc<BufferEmitter>>,
    err_emitter: Option<Arc<BufferEmitter>>,
) {
    for fd in [&stdin, &stdout, &stderr].into_iter().flatten() {
        channels.registry.register(fd.as_raw_fd());
    }

    channels.inbox.lock().unwrap().new_procs.push(ProcIo {
        proc,
        stdin,
        stdout,
        stderr,
        out_emitter,
        err_emitter,
        write_queue: VecDeque::new(),
        write_offset: 0,
        needs_write: false,
    });
    channels.wake.wake(WakeReason::NewWork);
}

// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Async-signal-safe delivery of signals into the main loop.
//!
//! The handler only sets a bit in an atomic mask and writes one byte to a
//! self-pipe; the pipe's read end joins the select set so a signal wakes the
//! loop immediately instead of waiting out the select timeout. The loop
//! drains one signal per tick, highest priority first (TERM > INT > QUIT >
//! HUP > USR2 > CHLD), so concurrent distinct signals are deferred, never
//! lost.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

static PENDING: AtomicU32 = AtomicU32::new(0);
static SELF_PIPE_WRITE: AtomicI32 = AtomicI32::new(-1);

/// Drain order; earlier entries win when several signals are pending.
pub const HANDLED_SIGNALS: [i32; 6] = [
    libc::SIGTERM,
    libc::SIGINT,
    libc::SIGQUIT,
    libc::SIGHUP,
    libc::SIGUSR2,
    libc::SIGCHLD,
];

fn bit(sig: i32) -> u32 {
    1 << (sig as u32 & 31)
}

extern "C" fn mailbox_handler(sig: libc::c_int) {
    PENDING.fetch_or(bit(sig), Ordering::SeqCst);
    let fd = SELF_PIPE_WRITE.load(Ordering::SeqCst);
    if fd >= 0 {
        // Safety: one byte from a static buffer; write is async-signal-safe.
        unsafe {
            libc::write(fd, b"s".as_ptr() as *const libc::c_void, 1);
        }
    }
}

enum Pending {
    /// Backed by the process-global mask the signal handler writes.
    Global,
    /// Private mask for tests and detached supervisors.
    Local(AtomicU32),
}

impl Pending {
    fn fetch_or(&self, mask: u32) {
        match self {
            Pending::Global => PENDING.fetch_or(mask, Ordering::SeqCst),
            Pending::Local(m) => m.fetch_or(mask, Ordering::SeqCst),
        };
    }

    fn load(&self) -> u32 {
        match self {
            Pending::Global => PENDING.load(Ordering::SeqCst),
            Pending::Local(m) => m.load(Ordering::SeqCst),
        }
    }

    fn clear(&self, mask: u32) {
        match self {
            Pending::Global => PENDING.fetch_and(!mask, Ordering::SeqCst),
            Pending::Local(m) => m.fetch_and(!mask, Ordering::SeqCst),
        };
    }
}

/// The supervisor's single signal slot.
pub struct SignalMailbox {
    pending: Pending,
    read_fd: Option<RawFd>,
}

impl SignalMailbox {
    /// Install handlers for the supervised signal set and open the
    /// self-pipe. Call once per process.
    pub fn install() -> nix::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        // Safety: fds is a valid two-element buffer.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
            return Err(nix::errno::Errno::last());
        }
        for fd in fds {
            // Safety: plain fcntl on fds we just created.
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                let fdflags = libc::fcntl(fd, libc::F_GETFD);
                libc::fcntl(fd, libc::F_SETFD, fdflags | libc::FD_CLOEXEC);
            }
        }
        SELF_PIPE_WRITE.store(fds[1], Ordering::SeqCst);
        let action = SigAction::new(
            SigHandler::Handler(mailbox_handler),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for sig in HANDLED_SIGNALS {
            let signal = Signal::try_from(sig).expect("handled signal set is valid");
            // Safety: the handler is async-signal-safe; see mailbox_handler.
            unsafe {
                sigaction(signal, &action)?;
            }
        }
        Ok(Self {
            pending: Pending::Global,
            read_fd: Some(fds[0]),
        })
    }

    /// A mailbox with no handlers and no pipe; signals arrive via [`post`].
    ///
    /// [`post`]: SignalMailbox::post
    pub fn detached() -> Self {
        Self {
            pending: Pending::Local(AtomicU32::new(0)),
            read_fd: None,
        }
    }

    /// Self-pipe read end for the select set.
    pub fn read_fd(&self) -> Option<RawFd> {
        self.read_fd
    }

    /// Record a signal as if it had been delivered.
    pub fn post(&self, sig: i32) {
        self.pending.fetch_or(bit(sig));
    }

    /// Highest-priority pending signal, clearing only its bit.
    pub fn take(&self) -> Option<i32> {
        self.drain_pipe();
        let pending = self.pending.load();
        if pending == 0 {
            return None;
        }
        for sig in HANDLED_SIGNALS {
            if pending & bit(sig) != 0 {
                self.pending.clear(bit(sig));
                return Some(sig);
            }
        }
        // An unexpected bit; clear everything rather than spin on it.
        self.pending.clear(u32::MAX);
        None
    }

    /// Empty the self-pipe without consuming the pending mask.
    pub fn drain_pipe(&self) {
        let Some(fd) = self.read_fd else {
            return;
        };
        let mut buf = [0u8; 64];
        loop {
            // Safety: buf is a live 64-byte buffer.
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n <= 0 {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_returns_highest_priority_signal_first() {
        let mailbox = SignalMailbox::detached();
        mailbox.post(libc::SIGCHLD);
        mailbox.post(libc::SIGHUP);
        mailbox.post(libc::SIGTERM);
        assert_eq!(mailbox.take(), Some(libc::SIGTERM));
        assert_eq!(mailbox.take(), Some(libc::SIGHUP));
        assert_eq!(mailbox.take(), Some(libc::SIGCHLD));
        assert_eq!(mailbox.take(), None);
    }

    #[test]
    fn identical_signals_coalesce() {
        let mailbox = SignalMailbox::detached();
        mailbox.post(libc::SIGTERM);
        mailbox.post(libc::SIGTERM);
        assert_eq!(mailbox.take(), Some(libc::SIGTERM));
        assert_eq!(mailbox.take(), None);
    }

    #[test]
    fn detached_mailboxes_are_independent() {
        let a = SignalMailbox::detached();
        let b = SignalMailbox::detached();
        a.post(libc::SIGUSR2);
        assert_eq!(b.take(), None);
        assert_eq!(a.take(), Some(libc::SIGUSR2));
    }
}

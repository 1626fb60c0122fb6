// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-fd handlers for the main select loop.
//!
//! Each pipe fd of a subprocess belongs to exactly one dispatcher:
//! output drains feeding a channel's [`OutputLog`], a writer for the child's
//! stdin, or the event listener protocol reader. Dispatchers are registered
//! at spawn and deregistered at finish; every handler does bounded work per
//! call.

use std::os::unix::io::RawFd;

use nix::errno::Errno;
use tracing::{debug, warn};

use crate::events::Event;
use crate::logger::OutputLog;
use crate::sys::System;

/// One registered fd handler.
pub enum Dispatcher {
    Output(OutputDispatcher),
    Input(InputDispatcher),
    Listener(ListenerDispatcher),
}

impl Dispatcher {
    pub fn readable(&self) -> bool {
        matches!(self, Dispatcher::Output(_) | Dispatcher::Listener(_))
    }

    pub fn writable(&self) -> bool {
        match self {
            Dispatcher::Input(d) => !d.is_empty(),
            _ => false,
        }
    }

    pub fn output_log(&self) -> Option<&OutputLog> {
        match self {
            Dispatcher::Output(d) => Some(&d.log),
            Dispatcher::Listener(d) => Some(&d.log),
            Dispatcher::Input(_) => None,
        }
    }

    pub fn output_log_mut(&mut self) -> Option<&mut OutputLog> {
        match self {
            Dispatcher::Output(d) => Some(&mut d.log),
            Dispatcher::Listener(d) => Some(&mut d.log),
            Dispatcher::Input(_) => None,
        }
    }
}

/// Drains a child output pipe into its log.
pub struct OutputDispatcher {
    pub log: OutputLog,
}

impl OutputDispatcher {
    pub fn new(log: OutputLog) -> Self {
        Self { log }
    }
}

/// Outcome of one bounded stdin write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Progress,
    BrokenPipe,
}

/// Buffers bytes headed for the child's stdin and writes them out in
/// bounded chunks while the fd is writable.
pub struct InputDispatcher {
    buffer: Vec<u8>,
}

impl Default for InputDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl InputDispatcher {
    /// Bytes written per loop turn at most.
    pub const WRITE_CHUNK: usize = 1 << 16;
    /// Hard cap on queued bytes.
    pub const MAX_BUFFERED: usize = 1 << 17;

    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Queue bytes for the child. Fails when the queue would exceed the cap.
    pub fn push(&mut self, data: &[u8]) -> Result<(), usize> {
        if self.buffer.len() + data.len() > Self::MAX_BUFFERED {
            return Err(self.buffer.len());
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    /// Write one chunk. A broken pipe discards the queue.
    pub fn flush(&mut self, fd: RawFd, sys: &dyn System) -> FlushOutcome {
        if self.buffer.is_empty() {
            return FlushOutcome::Progress;
        }
        let n = self.buffer.len().min(Self::WRITE_CHUNK);
        match sys.write_fd(fd, &self.buffer[..n]) {
            Ok(written) => {
                self.buffer.drain(..written);
                FlushOutcome::Progress
            }
            Err(Errno::EPIPE) => {
                warn!("stdin pipe closed, discarding {} queued bytes", self.buffer.len());
                self.buffer.clear();
                FlushOutcome::BrokenPipe
            }
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => FlushOutcome::Progress,
            Err(e) => {
                warn!("stdin write failed: {e}");
                FlushOutcome::Progress
            }
        }
    }
}

/// Event listener handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Spawned, waiting for the first READY token.
    Acknowledged,
    /// Willing to take an event.
    Ready,
    /// An event is in flight.
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerResult {
    Ok,
    Fail,
}

/// Parses the listener protocol on a listener's stdout: `READY\n` lines and
/// `RESULT {len}\n{body}` replies, where the body is `OK` or `FAIL`.
/// Raw bytes are also appended to the channel log.
pub struct ListenerDispatcher {
    pub log: OutputLog,
    state: ListenerState,
    proto_buf: Vec<u8>,
    expect_result: Option<usize>,
    pending: Option<Event>,
    results: Vec<(ListenerResult, Option<Event>)>,
}

impl ListenerDispatcher {
    pub fn new(log: OutputLog) -> Self {
        Self {
            log,
            state: ListenerState::Acknowledged,
            proto_buf: Vec::new(),
            expect_result: None,
            pending: None,
            results: Vec::new(),
        }
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    /// Record the event just written to the listener's stdin.
    pub fn mark_busy(&mut self, event: Event) {
        self.state = ListenerState::Busy;
        self.pending = Some(event);
    }

    /// Completed results paired with the event that was in flight.
    pub fn take_results(&mut self) -> Vec<(ListenerResult, Option<Event>)> {
        std::mem::take(&mut self.results)
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.log.append(data);
        self.proto_buf.extend_from_slice(data);
        loop {
            if let Some(len) = self.expect_result {
                if self.proto_buf.len() < len {
                    return;
                }
                let body: Vec<u8> = self.proto_buf.drain(..len).collect();
                let result = match body.as_slice() {
                    b"OK" => ListenerResult::Ok,
                    b"FAIL" => ListenerResult::Fail,
                    other => {
                        warn!(
                            "unexpected listener result body {:?}, treating as FAIL",
                            String::from_utf8_lossy(other)
                        );
                        ListenerResult::Fail
                    }
                };
                self.results.push((result, self.pending.take()));
                self.expect_result = None;
                self.state = ListenerState::Acknowledged;
                continue;
            }
            let Some(pos) = self.proto_buf.iter().position(|&b| b == b'\n') else {
                return;
            };
            let line: Vec<u8> = self.proto_buf.drain(..=pos).collect();
            let line = &line[..line.len() - 1];
            if line == b"READY" {
                debug!("listener signalled READY");
                self.state = ListenerState::Ready;
            } else if let Some(rest) = line.strip_prefix(b"RESULT ") {
                match std::str::from_utf8(rest).ok().and_then(|s| s.parse().ok()) {
                    Some(len) => self.expect_result = Some(len),
                    None => warn!(
                        "bad RESULT length {:?} from listener",
                        String::from_utf8_lossy(rest)
                    ),
                }
            } else if !line.is_empty() {
                debug!(
                    "ignoring non-protocol listener output: {:?}",
                    String::from_utf8_lossy(line)
                );
            }
        }
    }
}

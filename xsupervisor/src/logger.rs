// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Child output logging: a size-rotated, reopenable file sink plus the
//! per-channel output log that scans for communication-event framing.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::events::{Channel, Event, EventBus};

/// Start-of-capture framing token emitted by children.
pub const BEGIN_TOKEN: &[u8] = b"<!--XSUPERVISOR:BEGIN-->";
/// End-of-capture framing token.
pub const END_TOKEN: &[u8] = b"<!--XSUPERVISOR:END-->";

/// Append-only file sink with size-based rotation.
///
/// With `maxbytes == 0` the file grows without bound. Rotation renames
/// `base.N` to `base.(N+1)` from the highest backup down, then `base` to
/// `base.1`, and reopens a fresh `base`. With `backups == 0` the base file
/// is simply truncated when full.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    maxbytes: u64,
    backups: u32,
    file: Option<File>,
    cursize: u64,
}

impl FileSink {
    pub fn open(path: PathBuf, maxbytes: u64, backups: u32) -> std::io::Result<Self> {
        let file = OpenOptions::new().append(true).create(true).open(&path)?;
        let cursize = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            maxbytes,
            backups,
            file: Some(file),
            cursize,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if self.maxbytes > 0 && self.cursize + data.len() as u64 >= self.maxbytes {
            self.rollover()?;
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(data)?;
            file.flush()?;
            self.cursize += data.len() as u64;
        }
        Ok(())
    }

    fn rollover(&mut self) -> std::io::Result<()> {
        self.file = None;
        if self.backups > 0 {
            for i in (1..self.backups).rev() {
                let src = self.backup_path(i);
                let dst = self.backup_path(i + 1);
                if src.exists() {
                    let _ = std::fs::remove_file(&dst);
                    let _ = std::fs::rename(&src, &dst);
                }
            }
            let first = self.backup_path(1);
            let _ = std::fs::remove_file(&first);
            let _ = std::fs::rename(&self.path, &first);
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        self.file = Some(file);
        self.cursize = 0;
        Ok(())
    }

    fn backup_path(&self, n: u32) -> PathBuf {
        let mut s = self.path.as_os_str().to_os_string();
        s.push(format!(".{n}"));
        PathBuf::from(s)
    }

    /// Close and reopen the current file, picking up an external rename.
    pub fn reopen(&mut self) -> std::io::Result<()> {
        self.file = None;
        let file = OpenOptions::new().append(true).create(true).open(&self.path)?;
        self.cursize = file.metadata().map(|m| m.len()).unwrap_or(0);
        self.file = Some(file);
        Ok(())
    }

    /// Truncate the file and delete its backups.
    pub fn clear(&mut self) -> std::io::Result<()> {
        self.file = None;
        for i in 1..=self.backups.max(1) {
            let _ = std::fs::remove_file(self.backup_path(i));
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        self.file = Some(file);
        self.cursize = 0;
        Ok(())
    }
}

/// Longest proper prefix of `needle` that the buffer ends with. Bytes held
/// back this way are never flushed to the sink mid-token.
pub fn find_prefix_at_end(haystack: &[u8], needle: &[u8]) -> usize {
    let mut l = needle.len().saturating_sub(1);
    while l > 0 && !haystack.ends_with(&needle[..l]) {
        l -= 1;
    }
    l
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Drop ANSI escape sequences (CSI sequences and lone escapes).
pub fn strip_escapes(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == 0x1b {
            if data.get(i + 1) == Some(&b'[') {
                i += 2;
                while i < data.len() && !(0x40..=0x7e).contains(&data[i]) {
                    i += 1;
                }
                i += 1;
            } else {
                i += 2;
            }
            continue;
        }
        out.push(data[i]);
        i += 1;
    }
    out
}

/// One channel's buffered logging pipeline.
///
/// Bytes read from the child accumulate in `output_buffer`; `log_output`
/// drains them to the sink, switching into capture mode between the BEGIN
/// and END framing tokens. A buffer tail that is a proper prefix of the
/// sought token is retained for the next round, so a token is never split
/// into the sink. `capture_maxbytes` bounds the captured region only; at a
/// zero bound the region is truncated to nothing but the framing tokens are
/// still consumed.
pub struct OutputLog {
    name: String,
    group: String,
    channel: Channel,
    sink: Option<FileSink>,
    strip_ansi: bool,
    events_enabled: bool,
    capture_maxbytes: u64,
    output_buffer: Vec<u8>,
    capture_buffer: Vec<u8>,
    capture_overflowed: bool,
    capturemode: bool,
}

impl OutputLog {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        group: String,
        channel: Channel,
        logfile: Option<PathBuf>,
        maxbytes: u64,
        backups: u32,
        capture_maxbytes: u64,
        events_enabled: bool,
        strip_ansi: bool,
    ) -> Self {
        let sink = logfile.and_then(|path| match FileSink::open(path, maxbytes, backups) {
            Ok(sink) => Some(sink),
            Err(e) => {
                warn!("could not open log for {name} ({channel}): {e}");
                None
            }
        });
        Self {
            name,
            group,
            channel,
            sink,
            strip_ansi,
            events_enabled,
            capture_maxbytes,
            output_buffer: Vec::new(),
            capture_buffer: Vec::new(),
            capture_overflowed: false,
            capturemode: false,
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn sink_path(&self) -> Option<&Path> {
        self.sink.as_ref().map(|s| s.path())
    }

    pub fn append(&mut self, data: &[u8]) {
        self.output_buffer.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.output_buffer.len()
    }

    /// Drain the buffer through the token scanner.
    pub fn log_output(&mut self, bus: &mut EventBus) {
        self.scan(bus, true);
    }

    /// Drain everything, including a trailing partial token. For use once
    /// the channel has hit EOF and no further bytes can complete a token.
    pub fn flush_eof(&mut self, bus: &mut EventBus) {
        self.scan(bus, false);
    }

    fn scan(&mut self, bus: &mut EventBus, hold_partial: bool) {
        loop {
            if self.output_buffer.is_empty() {
                return;
            }
            let token: &[u8] = if self.capturemode {
                END_TOKEN
            } else {
                BEGIN_TOKEN
            };
            if hold_partial && self.output_buffer.len() <= token.len() {
                // Could be a partial token; wait for more output.
                return;
            }
            let data = std::mem::take(&mut self.output_buffer);
            match find_subslice(&data, token) {
                Some(idx) => {
                    self.emit(&data[..idx], bus);
                    self.toggle_capture(bus);
                    self.output_buffer = data[idx + token.len()..].to_vec();
                }
                None => {
                    let keep = if hold_partial {
                        find_prefix_at_end(&data, token)
                    } else {
                        0
                    };
                    let split = data.len() - keep;
                    self.emit(&data[..split], bus);
                    self.output_buffer = data[split..].to_vec();
                    return;
                }
            }
        }
    }

    fn emit(&mut self, data: &[u8], bus: &mut EventBus) {
        if data.is_empty() {
            return;
        }
        if self.capturemode {
            let room = (self.capture_maxbytes as usize).saturating_sub(self.capture_buffer.len());
            if data.len() > room {
                if !self.capture_overflowed {
                    warn!(
                        "truncated oversized capture from {} ({}) at {} bytes",
                        self.name, self.channel, self.capture_maxbytes
                    );
                    self.capture_overflowed = true;
                }
                self.capture_buffer.extend_from_slice(&data[..room]);
            } else {
                self.capture_buffer.extend_from_slice(data);
            }
            return;
        }
        let stripped;
        let out: &[u8] = if self.strip_ansi {
            stripped = strip_escapes(data);
            &stripped
        } else {
            data
        };
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.write(out) {
                warn!("log write for {} ({}) failed: {e}", self.name, self.channel);
            }
        }
        if self.events_enabled {
            bus.publish(Event::ProcessLog {
                name: self.name.clone(),
                group: self.group.clone(),
                channel: self.channel,
                data: out.to_vec(),
            });
        }
    }

    fn toggle_capture(&mut self, bus: &mut EventBus) {
        self.capturemode = !self.capturemode;
        if self.capturemode {
            self.capture_buffer.clear();
            self.capture_overflowed = false;
            return;
        }
        let data = std::mem::take(&mut self.capture_buffer);
        info!("process '{}' emitted a comm event", self.name);
        bus.publish(Event::ProcessCommunication {
            name: self.name.clone(),
            group: self.group.clone(),
            channel: self.channel,
            data,
        });
    }

    pub fn reopen(&mut self) {
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.reopen() {
                warn!("could not reopen log for {} ({}): {e}", self.name, self.channel);
            }
        }
    }

    pub fn clear(&mut self) -> std::io::Result<()> {
        match self.sink.as_mut() {
            Some(sink) => sink.clear(),
            None => Ok(()),
        }
    }
}

// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Daemon logging: tracing-subscriber writing through the engine's
//! rotating, reopenable sink so SIGUSR2 and size rotation cover the
//! supervisor's own log. Under `nodaemon` lines are echoed to stdout.

use std::io::Write;
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;

use xsupervisor::logger::FileSink;

use crate::options::ServerOptions;

pub fn to_level(name: &str) -> tracing::Level {
    match name {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        // "critical" maps onto ERROR; tracing has no higher level.
        _ => tracing::Level::ERROR,
    }
}

#[derive(Clone)]
pub struct DaemonLogWriter {
    sink: Arc<Mutex<FileSink>>,
    echo: bool,
}

impl Write for DaemonLogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Ok(mut sink) = self.sink.lock() {
            let _ = sink.write(buf);
        }
        if self.echo {
            let _ = std::io::stdout().write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for DaemonLogWriter {
    type Writer = DaemonLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Install the global subscriber. Returns the sink handle the supervisor
/// reopens on SIGUSR2.
pub fn init(options: &ServerOptions) -> anyhow::Result<Arc<Mutex<FileSink>>> {
    let sink = Arc::new(Mutex::new(FileSink::open(
        options.logfile.clone(),
        options.logfile_maxbytes,
        options.logfile_backups,
    )?));
    let writer = DaemonLogWriter {
        sink: Arc::clone(&sink),
        echo: options.nodaemon,
    };
    tracing_subscriber::fmt()
        .with_max_level(to_level(&options.loglevel))
        .with_ansi(false)
        .with_writer(writer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("could not initialize logging: {e}"))?;
    Ok(sink)
}

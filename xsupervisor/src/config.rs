// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Declarative configuration for managed processes and their groups.
//!
//! A `ProcessConfig` is immutable for the lifetime of one configuration
//! load; subprocesses hold it behind `Rc` so a reload can be diffed against
//! the running set by value.

use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::ensure;

use crate::dispatcher::{Dispatcher, InputDispatcher, ListenerDispatcher, OutputDispatcher};
use crate::events::{Channel, EventType};
use crate::logger::OutputLog;
use crate::sys::Pipes;

/// Restart policy applied when a child exits on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Autorestart {
    Never,
    Unexpected,
    Always,
}

/// Per-channel log sink settings.
#[derive(Debug, Clone, PartialEq)]
pub struct LogConfig {
    pub logfile: Option<PathBuf>,
    pub maxbytes: u64,
    pub backups: u32,
    pub capture_maxbytes: u64,
    pub events_enabled: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            logfile: None,
            maxbytes: 50 * 1024 * 1024,
            backups: 10,
            capture_maxbytes: 0,
            events_enabled: false,
        }
    }
}

/// Immutable parameters for one managed child.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessConfig {
    pub name: String,
    /// Tokenized argv; element 0 is resolved against `$PATH` when relative.
    pub command: Vec<String>,
    pub directory: Option<PathBuf>,
    pub umask: Option<u32>,
    pub uid: Option<u32>,
    /// Lower starts earlier and stops later.
    pub priority: i32,
    pub autostart: bool,
    pub autorestart: Autorestart,
    /// Seconds a child must stay up to count as successfully started.
    pub startsecs: f64,
    /// Consecutive failed starts tolerated before FATAL.
    pub startretries: u32,
    pub stopsignal: i32,
    pub stopwaitsecs: f64,
    /// Exit codes considered expected.
    pub exitcodes: Vec<i32>,
    pub redirect_stderr: bool,
    pub stdout: LogConfig,
    pub stderr: LogConfig,
    pub environment: Vec<(String, String)>,
    pub serverurl: Option<String>,
}

impl ProcessConfig {
    pub fn new(name: &str, command: Vec<String>) -> anyhow::Result<Self> {
        ensure!(!name.is_empty(), "process name must not be empty");
        ensure!(
            !command.is_empty(),
            "process '{name}' does not specify a command"
        );
        Ok(Self {
            name: name.to_string(),
            command,
            directory: None,
            umask: None,
            uid: None,
            priority: 999,
            autostart: true,
            autorestart: Autorestart::Unexpected,
            startsecs: 1.0,
            startretries: 3,
            stopsignal: libc::SIGTERM,
            stopwaitsecs: 10.0,
            exitcodes: vec![0, 2],
            redirect_stderr: false,
            stdout: LogConfig::default(),
            stderr: LogConfig::default(),
            environment: Vec::new(),
            serverurl: None,
        })
    }

    pub fn log_config(&self, channel: Channel) -> &LogConfig {
        match channel {
            Channel::Stdout => &self.stdout,
            Channel::Stderr => &self.stderr,
        }
    }

    /// Instantiate the runtime state for this config.
    pub fn make_process(
        self: &Rc<Self>,
        sys: Rc<dyn crate::sys::System>,
        group: &str,
        strip_ansi: bool,
        listener: bool,
    ) -> crate::process::Subprocess {
        crate::process::Subprocess::new(sys, Rc::clone(self), group, strip_ansi, listener)
    }

    /// Build the dispatcher map for a freshly spawned child. Exactly the
    /// dispatchers the pipe layout requires: no stderr dispatcher under
    /// `redirect_stderr`, no stdin dispatcher when the child's fd 0 is a
    /// shared listening socket, and the stdout dispatcher speaks the
    /// listener protocol for event listener processes.
    pub fn make_dispatchers(
        &self,
        pipes: &Pipes,
        group: &str,
        strip_ansi: bool,
        listener: bool,
        has_socket: bool,
    ) -> BTreeMap<RawFd, Dispatcher> {
        let mut map = BTreeMap::new();
        if let Some(fd) = pipes.stdout {
            let log = self.make_output_log(group, Channel::Stdout, strip_ansi);
            let dispatcher = if listener {
                Dispatcher::Listener(ListenerDispatcher::new(log))
            } else {
                Dispatcher::Output(OutputDispatcher::new(log))
            };
            map.insert(fd, dispatcher);
        }
        if let Some(fd) = pipes.stderr {
            if !self.redirect_stderr {
                let log = self.make_output_log(group, Channel::Stderr, strip_ansi);
                map.insert(fd, Dispatcher::Output(OutputDispatcher::new(log)));
            }
        }
        if let Some(fd) = pipes.stdin {
            if !has_socket {
                map.insert(fd, Dispatcher::Input(InputDispatcher::new()));
            }
        }
        map
    }

    fn make_output_log(&self, group: &str, channel: Channel, strip_ansi: bool) -> OutputLog {
        let cfg = self.log_config(channel);
        OutputLog::new(
            self.name.clone(),
            group.to_string(),
            channel,
            cfg.logfile.clone(),
            cfg.maxbytes,
            cfg.backups,
            cfg.capture_maxbytes,
            cfg.events_enabled,
            strip_ansi,
        )
    }
}

/// Listening socket definition for fcgi-style programs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketConfig {
    Unix { path: PathBuf },
    Tcp { host: String, port: u16 },
}

/// What kind of group a config section produced.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupKind {
    Process,
    EventListener {
        events: Vec<EventType>,
        buffer_size: usize,
    },
    Fcgi {
        socket: SocketConfig,
    },
}

/// A named collection of process configs sharing restart policy and
/// start/stop ordering. The unit of add/remove for the control surface.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupConfig {
    pub name: String,
    pub priority: i32,
    pub kind: GroupKind,
    pub programs: Vec<Rc<ProcessConfig>>,
}

impl GroupConfig {
    pub fn new(name: &str, priority: i32, programs: Vec<Rc<ProcessConfig>>) -> Self {
        Self {
            name: name.to_string(),
            priority,
            kind: GroupKind::Process,
            programs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::Pipes;

    fn pipes() -> Pipes {
        Pipes {
            child_stdin: Some(10),
            stdin: Some(11),
            stdout: Some(12),
            child_stdout: Some(13),
            stderr: Some(14),
            child_stderr: Some(15),
        }
    }

    #[test]
    fn command_is_required() {
        assert!(ProcessConfig::new("x", vec![]).is_err());
        assert!(ProcessConfig::new("", vec!["/bin/true".to_string()]).is_err());
    }

    #[test]
    fn dispatchers_cover_all_three_pipes() {
        let cfg = ProcessConfig::new("p", vec!["/bin/cat".to_string()]).unwrap();
        let map = cfg.make_dispatchers(&pipes(), "g", false, false, false);
        assert_eq!(map.len(), 3);
        assert!(matches!(map.get(&12), Some(Dispatcher::Output(_))));
        assert!(matches!(map.get(&14), Some(Dispatcher::Output(_))));
        assert!(matches!(map.get(&11), Some(Dispatcher::Input(_))));
    }

    #[test]
    fn redirected_stderr_gets_no_dispatcher() {
        let mut cfg = ProcessConfig::new("p", vec!["/bin/cat".to_string()]).unwrap();
        cfg.redirect_stderr = true;
        let mut p = pipes();
        p.stderr = None;
        p.child_stderr = None;
        let map = cfg.make_dispatchers(&p, "g", false, false, false);
        assert_eq!(map.len(), 2);
        assert!(map.get(&14).is_none());
    }

    #[test]
    fn listener_processes_get_a_protocol_dispatcher() {
        let cfg = ProcessConfig::new("l", vec!["/bin/cat".to_string()]).unwrap();
        let map = cfg.make_dispatchers(&pipes(), "g", false, true, false);
        assert!(matches!(map.get(&12), Some(Dispatcher::Listener(_))));
    }

    #[test]
    fn socket_fed_children_get_no_stdin_dispatcher() {
        let cfg = ProcessConfig::new("f", vec!["/bin/cat".to_string()]).unwrap();
        let map = cfg.make_dispatchers(&pipes(), "g", false, false, true);
        assert!(map.get(&11).is_none());
    }
}

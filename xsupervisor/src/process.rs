// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One managed child: the fork/exec pipeline, kill/reap handling, and the
//! mutable runtime attributes its state is derived from.

use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::rc::Rc;

use nix::errno::Errno;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::ProcessConfig;
use crate::dispatcher::{Dispatcher, ListenerResult, ListenerState};
use crate::events::{Channel, Event, EventBus};
use crate::sys::{signame, ExitStatus, Fork, Pipes, System};

/// Derived process state. Never stored; always recomputed from the runtime
/// attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Backoff,
    Stopping,
    Exited,
    Fatal,
    Unknown,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Stopped => "STOPPED",
            ProcessState::Starting => "STARTING",
            ProcessState::Running => "RUNNING",
            ProcessState::Backoff => "BACKOFF",
            ProcessState::Stopping => "STOPPING",
            ProcessState::Exited => "EXITED",
            ProcessState::Fatal => "FATAL",
            ProcessState::Unknown => "UNKNOWN",
        }
    }

    /// States in which the process has no live child and no pending timer.
    pub fn is_stopped_state(&self) -> bool {
        matches!(
            self,
            ProcessState::Stopped
                | ProcessState::Exited
                | ProcessState::Fatal
                | ProcessState::Unknown
        )
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SpawnError {
    #[error("can't find command '{0}'")]
    NotFound(String),
    #[error("command at '{0}' is not executable")]
    NotExecutable(String),
    #[error("too many open files to spawn '{0}'")]
    TooManyFiles(String),
    #[error("Too many processes in process table to spawn '{0}'")]
    TooManyProcesses(String),
    #[error("unknown error: {0}")]
    Unknown(String),
    #[error("process '{0}' already running")]
    AlreadyRunning(String),
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum WriteError {
    #[error("process is not running")]
    NotRunning,
    #[error("stdin queue is full")]
    QueueFull,
}

/// A managed subprocess. Outlives any number of child pids; destroyed only
/// when its group is removed.
pub struct Subprocess {
    sys: Rc<dyn System>,
    config: Rc<ProcessConfig>,
    group: String,
    strip_ansi: bool,
    listener: bool,
    /// Shared listening socket dup'ed onto the child's fd 0, if any.
    socket: Option<RawFd>,
    pub pid: i32,
    pub laststart: f64,
    pub laststop: f64,
    /// Wall-clock deadline of the pending timed transition; 0 means none.
    pub delay: f64,
    /// Consecutive failed starts or too-quick exits.
    pub backoff: u32,
    pub killing: bool,
    pub administrative_stop: bool,
    pub system_stop: bool,
    pub exitstatus: Option<ExitStatus>,
    pub spawnerr: Option<String>,
    pipes: Pipes,
    dispatchers: BTreeMap<RawFd, Dispatcher>,
}

impl Subprocess {
    pub fn new(
        sys: Rc<dyn System>,
        config: Rc<ProcessConfig>,
        group: &str,
        strip_ansi: bool,
        listener: bool,
    ) -> Self {
        Self {
            sys,
            config,
            group: group.to_string(),
            strip_ansi,
            listener,
            socket: None,
            pid: 0,
            laststart: 0.0,
            laststop: 0.0,
            delay: 0.0,
            backoff: 0,
            killing: false,
            administrative_stop: false,
            system_stop: false,
            exitstatus: None,
            spawnerr: None,
            pipes: Pipes::default(),
            dispatchers: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn group_name(&self) -> &str {
        &self.group
    }

    pub fn config(&self) -> &Rc<ProcessConfig> {
        &self.config
    }

    pub fn set_socket(&mut self, socket: Option<RawFd>) {
        self.socket = socket;
    }

    /// Derive the current state from the runtime attributes.
    pub fn state(&self) -> ProcessState {
        if self.laststart == 0.0 {
            ProcessState::Stopped
        } else if self.killing {
            ProcessState::Stopping
        } else if self.system_stop {
            ProcessState::Fatal
        } else if self.exitstatus.is_some() {
            if self.administrative_stop {
                ProcessState::Stopped
            } else {
                ProcessState::Exited
            }
        } else if self.delay != 0.0 {
            if self.pid != 0 {
                ProcessState::Starting
            } else {
                ProcessState::Backoff
            }
        } else if self.pid != 0 {
            ProcessState::Running
        } else {
            ProcessState::Unknown
        }
    }

    fn emit_state(&mut self, before: ProcessState, event_pid: i32, bus: &mut EventBus) {
        let after = self.state();
        if after != before {
            bus.publish(Event::ProcessState {
                name: self.config.name.clone(),
                group: self.group.clone(),
                pid: event_pid,
                from: before,
                to: after,
            });
        }
    }

    /// Resolve argv[0] against `$PATH` when relative and validate the file.
    fn get_execv_args(&self) -> Result<(PathBuf, Vec<String>), SpawnError> {
        fn check(path: &PathBuf, st: crate::sys::FileStat) -> Result<(), SpawnError> {
            if st.is_dir || !st.is_executable() {
                Err(SpawnError::NotExecutable(path.display().to_string()))
            } else {
                Ok(())
            }
        }

        let program = &self.config.command[0];
        let argv = self.config.command.clone();
        if program.contains('/') {
            let path = PathBuf::from(program);
            let st = self
                .sys
                .stat(&path)
                .map_err(|_| SpawnError::NotFound(program.clone()))?;
            check(&path, st)?;
            return Ok((path, argv));
        }
        for dir in self.sys.get_path() {
            let candidate = dir.join(program);
            if let Ok(st) = self.sys.stat(&candidate) {
                check(&candidate, st)?;
                return Ok((candidate, argv));
            }
        }
        Err(SpawnError::NotFound(program.clone()))
    }

    fn record_spawnerr(&mut self, err: SpawnError, before: ProcessState, bus: &mut EventBus) {
        self.spawnerr = Some(err.to_string());
        error!("spawnerr: {err}");
        self.backoff += 1;
        self.delay = self.sys.now() + f64::from(self.backoff);
        self.emit_state(before, 0, bus);
    }

    /// Start the child. It must not be running already.
    pub fn spawn(&mut self, bus: &mut EventBus) -> Result<i32, SpawnError> {
        let pname = self.config.name.clone();
        if self.pid != 0 {
            let err = SpawnError::AlreadyRunning(pname);
            error!("{err}");
            return Err(err);
        }
        let before = self.state();

        self.killing = false;
        self.spawnerr = None;
        self.exitstatus = None;
        self.system_stop = false;
        self.administrative_stop = false;
        self.laststart = self.sys.now();

        let (filename, argv) = match self.get_execv_args() {
            Ok(parts) => parts,
            Err(err) => {
                self.record_spawnerr(err.clone(), before, bus);
                return Err(err);
            }
        };

        let pipes = match self.sys.make_pipes(!self.config.redirect_stderr) {
            Ok(pipes) => pipes,
            Err(Errno::EMFILE) => {
                let err = SpawnError::TooManyFiles(pname);
                self.record_spawnerr(err.clone(), before, bus);
                return Err(err);
            }
            Err(e) => {
                let err = SpawnError::Unknown(format!("{e:?}"));
                self.record_spawnerr(err.clone(), before, bus);
                return Err(err);
            }
        };

        match self.sys.fork() {
            Err(e) => {
                for fd in pipes.parent_fds().chain(pipes.child_fds()) {
                    self.sys.close_fd(fd);
                }
                let err = if e == Errno::EAGAIN {
                    SpawnError::TooManyProcesses(pname)
                } else {
                    SpawnError::Unknown(format!("{e:?}"))
                };
                self.record_spawnerr(err.clone(), before, bus);
                Err(err)
            }
            Ok(Fork::Child) => self.child_exec(&filename, &argv, &pipes),
            Ok(Fork::Parent(pid)) => {
                self.pid = pid;
                for fd in pipes.child_fds() {
                    self.sys.close_fd(fd);
                }
                let mut pipes = pipes;
                pipes.child_stdin = None;
                pipes.child_stdout = None;
                pipes.child_stderr = None;
                if self.socket.is_some() {
                    // Socket-fed children take no stdin; drop that pipe now.
                    if let Some(fd) = pipes.stdin.take() {
                        self.sys.close_fd(fd);
                    }
                    if let Some(fd) = pipes.child_stdin.take() {
                        self.sys.close_fd(fd);
                    }
                }
                self.dispatchers = self.config.make_dispatchers(
                    &pipes,
                    &self.group,
                    self.strip_ansi,
                    self.listener,
                    self.socket.is_some(),
                );
                self.pipes = pipes;
                self.delay = self.sys.now() + self.config.startsecs;
                self.spawnerr = None;
                info!("spawned: '{}' with pid {pid}", self.config.name);
                self.emit_state(before, pid, bus);
                Ok(pid)
            }
        }
    }

    /// Child-side setup between fork and exec. Never returns; any failure is
    /// reported on fd 1 (which lands in the process log) followed by
    /// `_exit(127)`.
    fn child_exec(&mut self, filename: &PathBuf, argv: &[String], pipes: &Pipes) -> ! {
        let sys = Rc::clone(&self.sys);
        let pname = &self.config.name;

        // A fresh process group isolates the child from signals aimed at
        // the supervisor and lets stop signals reach its descendants.
        sys.setpgrp();
        if let Some(sock) = self.socket {
            let _ = sys.dup2(sock, 0);
        } else if let Some(fd) = pipes.child_stdin {
            let _ = sys.dup2(fd, 0);
        }
        if let Some(fd) = pipes.child_stdout {
            let _ = sys.dup2(fd, 1);
            if self.config.redirect_stderr {
                let _ = sys.dup2(fd, 2);
            }
        }
        if let Some(fd) = pipes.child_stderr {
            let _ = sys.dup2(fd, 2);
        }
        for fd in 3..sys.minfds() {
            sys.close_fd(fd);
        }
        if let Some(uid) = self.config.uid {
            if let Some(msg) = sys.drop_privileges(uid) {
                let line = format!("{pname}: error trying to setuid to {uid}!\n{pname}: {msg}\n");
                let _ = sys.write_fd(1, line.as_bytes());
            }
        }
        if let Some(mask) = self.config.umask {
            sys.set_umask(mask);
        }
        if let Some(dir) = &self.config.directory {
            if let Err(e) = sys.chdir(dir) {
                let line = format!("couldn't chdir to {}: {e:?}\n", dir.display());
                let _ = sys.write_fd(1, line.as_bytes());
                sys.exit_process(127);
            }
        }
        let env = self.merged_environment();
        let err = sys.execve(filename, argv, &env);
        let line = format!("couldn't exec {}: {err:?}\n", argv[0]);
        let _ = sys.write_fd(1, line.as_bytes());
        sys.exit_process(127)
    }

    fn merged_environment(&self) -> Vec<(String, String)> {
        let mut env: BTreeMap<String, String> = self.sys.environ().into_iter().collect();
        for (k, v) in &self.config.environment {
            env.insert(k.clone(), v.clone());
        }
        env.insert("SUPERVISOR_ENABLED".to_string(), "1".to_string());
        env.insert(
            "SUPERVISOR_PROCESS_NAME".to_string(),
            self.config.name.clone(),
        );
        env.insert("SUPERVISOR_GROUP_NAME".to_string(), self.group.clone());
        if let Some(url) = &self.config.serverurl {
            env.insert("SUPERVISOR_SERVER_URL".to_string(), url.clone());
        }
        env.into_iter().collect()
    }

    /// Administrative stop: deliver the configured stop signal and arm the
    /// SIGKILL deadline.
    pub fn stop(&mut self, bus: &mut EventBus) -> Option<String> {
        let before = self.state();
        self.administrative_stop = true;
        let result = self.kill_with(self.config.stopsignal);
        self.emit_state(before, self.pid, bus);
        result
    }

    /// Send an arbitrary signal to the child's process group. Errors are
    /// reported textually, never raised.
    pub fn kill(&mut self, sig: i32, bus: &mut EventBus) -> Option<String> {
        let before = self.state();
        let result = self.kill_with(sig);
        self.emit_state(before, self.pid, bus);
        result
    }

    fn kill_with(&mut self, sig: i32) -> Option<String> {
        let now = self.sys.now();
        if self.pid == 0 {
            let msg = format!(
                "attempted to kill {} with sig {} but it wasn't running",
                self.config.name,
                signame(sig)
            );
            debug!("{msg}");
            return Some(msg);
        }
        debug!(
            "killing {} (pid {}) with signal {}",
            self.config.name,
            self.pid,
            signame(sig)
        );
        self.killing = true;
        self.delay = now + self.config.stopwaitsecs;
        if let Err(e) = self.sys.kill(-self.pid, sig) {
            let msg = format!(
                "unknown problem killing {} ({}): {e}",
                self.config.name, self.pid
            );
            error!("{msg}");
            self.pid = 0;
            self.killing = false;
            self.delay = 0.0;
            return Some(msg);
        }
        None
    }

    /// The reaper found our pid. Classify the exit, settle the timers, and
    /// release every parent-side pipe.
    pub fn finish(&mut self, pid: i32, sts: ExitStatus, bus: &mut EventBus) {
        self.drain_outputs(bus);

        let before = self.state();
        let now = self.sys.now();
        self.laststop = now;
        let pname = self.config.name.clone();
        let msg = sts.describe();

        let too_quickly = now - self.laststart < self.config.startsecs;
        let bad_exit = match sts.code() {
            Some(code) => !self.config.exitcodes.contains(&code),
            None => true,
        };
        let expected = !(too_quickly || bad_exit);

        if self.killing {
            self.killing = false;
            self.delay = 0.0;
            self.exitstatus = Some(sts);
            info!("stopped: {pname} ({msg})");
        } else if expected {
            self.delay = 0.0;
            self.backoff = 0;
            self.exitstatus = Some(sts);
            info!("exited: {pname} ({msg}; expected)");
        } else {
            self.exitstatus = None;
            self.backoff += 1;
            self.delay = now + f64::from(self.backoff);
            self.spawnerr = Some(if too_quickly {
                "Exited too quickly (process log may have details)".to_string()
            } else {
                format!("Bad exit code {}", sts.code().map_or(-1, |c| c))
            });
            info!("exited: {pname} ({msg}; not expected)");
        }

        self.pid = 0;
        let parent_fds: Vec<RawFd> = self.pipes.parent_fds().collect();
        for fd in parent_fds {
            self.close_parent_fd(fd);
        }
        self.dispatchers.clear();
        self.pipes = Pipes::default();
        self.emit_state(before, pid, bus);
    }

    /// Give up on a backing-off process: clear its timers and mark it FATAL.
    pub fn fail_to_fatal(&mut self, bus: &mut EventBus) {
        let before = self.state();
        self.delay = 0.0;
        self.backoff = 0;
        self.system_stop = true;
        self.emit_state(before, self.pid, bus);
    }

    /// A starting process survived its grace period.
    pub fn promote_running(&mut self, bus: &mut EventBus) {
        let before = self.state();
        self.delay = 0.0;
        self.backoff = 0;
        self.emit_state(before, self.pid, bus);
    }

    /// Queue bytes for the child's stdin.
    pub fn write(&mut self, data: &[u8]) -> Result<(), WriteError> {
        if self.pid == 0 {
            return Err(WriteError::NotRunning);
        }
        let input = self
            .dispatchers
            .values_mut()
            .find_map(|d| match d {
                Dispatcher::Input(i) => Some(i),
                _ => None,
            })
            .ok_or(WriteError::NotRunning)?;
        input.push(data).map_err(|_| WriteError::QueueFull)
    }

    /// Readable and writable fds for this tick.
    pub fn poll_fds(&self) -> (Vec<RawFd>, Vec<RawFd>) {
        let mut read = Vec::new();
        let mut write = Vec::new();
        for (fd, d) in &self.dispatchers {
            if d.readable() {
                read.push(*fd);
            }
            if d.writable() {
                write.push(*fd);
            }
        }
        (read, write)
    }

    pub fn owns_fd(&self, fd: RawFd) -> bool {
        self.dispatchers.contains_key(&fd)
    }

    /// Drain one bounded chunk from a ready output fd.
    pub fn handle_readable(&mut self, fd: RawFd, bus: &mut EventBus) {
        let mut close = false;
        match self.dispatchers.get_mut(&fd) {
            Some(Dispatcher::Output(d)) => match self.sys.read_fd(fd) {
                Ok(data) if data.is_empty() => close = true,
                Ok(data) => {
                    d.log.append(&data);
                    d.log.log_output(bus);
                }
                Err(Errno::EINTR) | Err(Errno::EAGAIN) => {}
                Err(e) => {
                    warn!("read from {} failed: {e}", self.config.name);
                    close = true;
                }
            },
            Some(Dispatcher::Listener(l)) => match self.sys.read_fd(fd) {
                Ok(data) if data.is_empty() => close = true,
                Ok(data) => {
                    l.feed(&data);
                    l.log.log_output(bus);
                }
                Err(Errno::EINTR) | Err(Errno::EAGAIN) => {}
                Err(e) => {
                    warn!("read from listener {} failed: {e}", self.config.name);
                    close = true;
                }
            },
            _ => {}
        }
        if close {
            // Nothing further can complete a pending token on this channel.
            if let Some(log) = self.dispatchers.get_mut(&fd).and_then(|d| d.output_log_mut()) {
                log.flush_eof(bus);
            }
            self.close_parent_fd(fd);
        }
    }

    /// Flush one bounded chunk of queued stdin.
    pub fn handle_writable(&mut self, fd: RawFd) {
        let sys = Rc::clone(&self.sys);
        if let Some(Dispatcher::Input(d)) = self.dispatchers.get_mut(&fd) {
            d.flush(fd, sys.as_ref());
        }
    }

    fn close_parent_fd(&mut self, fd: RawFd) {
        self.dispatchers.remove(&fd);
        self.sys.close_fd(fd);
        for slot in [
            &mut self.pipes.stdin,
            &mut self.pipes.stdout,
            &mut self.pipes.stderr,
        ] {
            if *slot == Some(fd) {
                *slot = None;
            }
        }
    }

    fn drain_outputs(&mut self, bus: &mut EventBus) {
        let fds: Vec<RawFd> = self
            .dispatchers
            .iter()
            .filter(|(_, d)| d.readable())
            .map(|(fd, _)| *fd)
            .collect();
        for fd in fds {
            if let Ok(data) = self.sys.read_fd(fd) {
                if !data.is_empty() {
                    match self.dispatchers.get_mut(&fd) {
                        Some(Dispatcher::Output(d)) => d.log.append(&data),
                        Some(Dispatcher::Listener(l)) => l.feed(&data),
                        _ => {}
                    }
                }
            }
        }
        // The child is gone; drain held-back tails as well.
        for d in self.dispatchers.values_mut() {
            if let Some(log) = d.output_log_mut() {
                log.flush_eof(bus);
            }
        }
    }

    /// Flush all buffered channel output through the token scanner.
    pub fn log_output(&mut self, bus: &mut EventBus) {
        for d in self.dispatchers.values_mut() {
            if let Some(log) = d.output_log_mut() {
                log.log_output(bus);
            }
        }
    }

    pub fn reopen_logs(&mut self) {
        for d in self.dispatchers.values_mut() {
            if let Some(log) = d.output_log_mut() {
                log.reopen();
            }
        }
    }

    /// Truncate this process's log files and drop their backups. Works
    /// whether or not the child is currently running.
    pub fn clear_logs(&mut self) -> std::io::Result<()> {
        let mut cleared = std::collections::BTreeSet::new();
        for d in self.dispatchers.values_mut() {
            if let Some(log) = d.output_log_mut() {
                if let Some(path) = log.sink_path() {
                    cleared.insert(path.to_path_buf());
                }
                log.clear()?;
            }
        }
        for channel in [Channel::Stdout, Channel::Stderr] {
            if let Some(path) = &self.config.log_config(channel).logfile {
                if cleared.contains(path) {
                    continue;
                }
                if path.exists() {
                    std::fs::write(path, b"")?;
                }
                for n in 1..=self.config.log_config(channel).backups.max(1) {
                    let mut s = path.as_os_str().to_os_string();
                    s.push(format!(".{n}"));
                    let _ = std::fs::remove_file(PathBuf::from(s));
                }
            }
        }
        Ok(())
    }

    pub fn listener_state(&self) -> Option<ListenerState> {
        self.dispatchers.values().find_map(|d| match d {
            Dispatcher::Listener(l) => Some(l.state()),
            _ => None,
        })
    }

    /// Serialize an event to the listener's stdin and mark it busy.
    pub fn send_listener_event(&mut self, data: &[u8], event: Event) -> Result<(), WriteError> {
        self.write(data)?;
        let mut event = Some(event);
        for d in self.dispatchers.values_mut() {
            if let Dispatcher::Listener(l) = d {
                if let Some(event) = event.take() {
                    l.mark_busy(event);
                }
                return Ok(());
            }
        }
        Err(WriteError::NotRunning)
    }

    pub fn take_listener_results(&mut self) -> Vec<(ListenerResult, Option<Event>)> {
        let mut out = Vec::new();
        for d in self.dispatchers.values_mut() {
            if let Dispatcher::Listener(l) = d {
                out.extend(l.take_results());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::FileStat;
    use crate::testing::{test_config, FakeSystem};

    fn make_proc(sys: &Rc<FakeSystem>, config: ProcessConfig) -> Subprocess {
        let sys: Rc<dyn System> = Rc::clone(sys) as Rc<dyn System>;
        Subprocess::new(sys, Rc::new(config), "grp", false, false)
    }

    fn executable() -> FileStat {
        FileStat {
            is_dir: false,
            mode: 0o755,
        }
    }

    #[test]
    fn fresh_process_is_stopped() {
        let sys = Rc::new(FakeSystem::new());
        let p = make_proc(&sys, test_config("sleep"));
        assert_eq!(p.state(), ProcessState::Stopped);
    }

    #[test]
    fn spawn_resolves_command_and_enters_starting() {
        let sys = Rc::new(FakeSystem::new());
        sys.set_now(100.0);
        sys.add_stat("/bin/sleep", executable());
        sys.push_fork(Ok(Fork::Parent(42)));
        let mut bus = EventBus::new();
        let mut p = make_proc(&sys, test_config("sleep"));
        let pid = p.spawn(&mut bus).unwrap();
        assert_eq!(pid, 42);
        assert_eq!(p.pid, 42);
        assert_eq!(p.laststart, 100.0);
        assert_eq!(p.delay, 101.0);
        assert_eq!(p.state(), ProcessState::Starting);
        // Child-side pipe ends were closed in the parent.
        assert!(sys.closed_fds().len() >= 3);
        let (read, write) = p.poll_fds();
        assert_eq!(read.len(), 2);
        assert!(write.is_empty());
    }

    #[test]
    fn spawn_of_running_process_is_refused() {
        let sys = Rc::new(FakeSystem::new());
        sys.add_stat("/bin/sleep", executable());
        sys.push_fork(Ok(Fork::Parent(42)));
        let mut bus = EventBus::new();
        let mut p = make_proc(&sys, test_config("sleep"));
        p.spawn(&mut bus).unwrap();
        assert!(matches!(
            p.spawn(&mut bus),
            Err(SpawnError::AlreadyRunning(_))
        ));
    }

    #[test]
    fn missing_command_reports_cant_find() {
        let sys = Rc::new(FakeSystem::new());
        sys.set_now(10.0);
        let mut bus = EventBus::new();
        let mut p = make_proc(&sys, test_config("nosuch"));
        let err = p.spawn(&mut bus).unwrap_err();
        assert_eq!(err, SpawnError::NotFound("nosuch".to_string()));
        assert_eq!(p.spawnerr.as_deref(), Some("can't find command 'nosuch'"));
        assert_eq!(p.backoff, 1);
        assert_eq!(p.delay, 11.0);
        assert_eq!(p.state(), ProcessState::Backoff);
    }

    #[test]
    fn directory_as_command_is_not_executable() {
        let sys = Rc::new(FakeSystem::new());
        sys.add_stat(
            "/bin/dir",
            FileStat {
                is_dir: true,
                mode: 0o755,
            },
        );
        let mut bus = EventBus::new();
        let mut p = make_proc(&sys, test_config("dir"));
        let err = p.spawn(&mut bus).unwrap_err();
        assert!(matches!(err, SpawnError::NotExecutable(_)));
    }

    #[test]
    fn emfile_during_pipe_allocation_backs_off_without_leaks() {
        let sys = Rc::new(FakeSystem::new());
        sys.set_now(50.0);
        sys.add_stat("/bin/sleep", executable());
        sys.fail_next_pipes(Errno::EMFILE);
        let mut bus = EventBus::new();
        let mut p = make_proc(&sys, test_config("sleep"));
        let err = p.spawn(&mut bus).unwrap_err();
        assert_eq!(err, SpawnError::TooManyFiles("sleep".to_string()));
        assert_eq!(
            p.spawnerr.as_deref(),
            Some("too many open files to spawn 'sleep'")
        );
        assert_eq!(p.pid, 0);
        assert_eq!(p.backoff, 1);
        assert_eq!(p.delay, 51.0);
        assert_eq!(p.state(), ProcessState::Backoff);
        let (read, write) = p.poll_fds();
        assert!(read.is_empty() && write.is_empty());
    }

    #[test]
    fn fork_eagain_closes_both_pipe_ends() {
        let sys = Rc::new(FakeSystem::new());
        sys.set_now(10.0);
        sys.add_stat("/bin/sleep", executable());
        sys.push_fork(Err(Errno::EAGAIN));
        let mut bus = EventBus::new();
        let mut p = make_proc(&sys, test_config("sleep"));
        let err = p.spawn(&mut bus).unwrap_err();
        assert_eq!(err, SpawnError::TooManyProcesses("sleep".to_string()));
        // All six allocated fds must be closed again.
        assert_eq!(sys.closed_fds().len(), 6);
        assert_eq!(p.state(), ProcessState::Backoff);
    }

    #[test]
    fn finish_after_stop_request_lands_in_stopped() {
        let sys = Rc::new(FakeSystem::new());
        sys.set_now(100.0);
        sys.add_stat("/bin/sleep", executable());
        sys.push_fork(Ok(Fork::Parent(42)));
        let mut bus = EventBus::new();
        let mut p = make_proc(&sys, test_config("sleep"));
        p.spawn(&mut bus).unwrap();
        sys.set_now(105.0);
        assert!(p.stop(&mut bus).is_none());
        assert!(p.administrative_stop);
        assert_eq!(p.state(), ProcessState::Stopping);
        assert_eq!(sys.kills(), vec![(-42, libc::SIGTERM)]);
        assert_eq!(p.delay, 115.0);

        sys.set_now(106.0);
        p.finish(42, ExitStatus::Signaled(libc::SIGTERM), &mut bus);
        assert_eq!(p.pid, 0);
        assert!(!p.killing);
        assert_eq!(p.delay, 0.0);
        assert_eq!(p.laststop, 106.0);
        assert_eq!(p.state(), ProcessState::Stopped);
        let (read, write) = p.poll_fds();
        assert!(read.is_empty() && write.is_empty());
    }

    #[test]
    fn expected_exit_clears_backoff_and_lands_in_exited() {
        let sys = Rc::new(FakeSystem::new());
        sys.set_now(100.0);
        sys.add_stat("/bin/sleep", executable());
        sys.push_fork(Ok(Fork::Parent(42)));
        let mut bus = EventBus::new();
        let mut p = make_proc(&sys, test_config("sleep"));
        p.backoff = 2;
        p.spawn(&mut bus).unwrap();
        sys.set_now(110.0);
        p.finish(42, ExitStatus::Exited(0), &mut bus);
        assert_eq!(p.state(), ProcessState::Exited);
        assert_eq!(p.backoff, 0);
        assert_eq!(p.exitstatus, Some(ExitStatus::Exited(0)));
    }

    #[test]
    fn too_quick_exit_backs_off() {
        let sys = Rc::new(FakeSystem::new());
        sys.set_now(100.0);
        sys.add_stat("/bin/sleep", executable());
        sys.push_fork(Ok(Fork::Parent(42)));
        let mut bus = EventBus::new();
        let mut config = test_config("sleep");
        config.startsecs = 10.0;
        let mut p = make_proc(&sys, config);
        p.spawn(&mut bus).unwrap();
        sys.set_now(100.5);
        p.finish(42, ExitStatus::Exited(0), &mut bus);
        assert_eq!(p.state(), ProcessState::Backoff);
        assert_eq!(p.backoff, 1);
        assert_eq!(p.delay, 101.5);
        assert!(p.exitstatus.is_none());
        assert_eq!(
            p.spawnerr.as_deref(),
            Some("Exited too quickly (process log may have details)")
        );
    }

    #[test]
    fn unexpected_exit_code_backs_off_with_message() {
        let sys = Rc::new(FakeSystem::new());
        sys.set_now(100.0);
        sys.add_stat("/bin/sleep", executable());
        sys.push_fork(Ok(Fork::Parent(42)));
        let mut bus = EventBus::new();
        let mut p = make_proc(&sys, test_config("sleep"));
        p.spawn(&mut bus).unwrap();
        sys.set_now(110.0);
        p.finish(42, ExitStatus::Exited(3), &mut bus);
        assert_eq!(p.state(), ProcessState::Backoff);
        assert_eq!(p.spawnerr.as_deref(), Some("Bad exit code 3"));
    }

    #[test]
    fn finish_drains_remaining_output_to_the_log() {
        let sys = Rc::new(FakeSystem::new());
        sys.set_now(100.0);
        sys.add_stat("/bin/sleep", executable());
        sys.push_fork(Ok(Fork::Parent(42)));
        let mut bus = EventBus::new();
        let events = Rc::new(std::cell::RefCell::new(Vec::new()));
        let seen = Rc::clone(&events);
        bus.subscribe(
            crate::events::EventType::ProcessLog,
            Box::new(move |event| {
                if let Event::ProcessLog { data, .. } = event {
                    seen.borrow_mut().push(data.clone());
                }
                Ok(())
            }),
        );
        let mut config = test_config("sleep");
        config.stdout.events_enabled = true;
        let mut p = make_proc(&sys, config);
        p.spawn(&mut bus).unwrap();
        let stdout_fd = p.poll_fds().0[0];
        sys.push_read(stdout_fd, b"final words\n");
        sys.set_now(110.0);
        p.finish(42, ExitStatus::Exited(0), &mut bus);
        assert_eq!(events.borrow().as_slice(), &[b"final words\n".to_vec()]);
    }

    #[test]
    fn kill_failure_resets_runtime_fields_and_reports() {
        let sys = Rc::new(FakeSystem::new());
        sys.add_stat("/bin/sleep", executable());
        sys.push_fork(Ok(Fork::Parent(42)));
        sys.fail_kills(Errno::EPERM);
        let mut bus = EventBus::new();
        let mut p = make_proc(&sys, test_config("sleep"));
        p.spawn(&mut bus).unwrap();
        let msg = p.stop(&mut bus);
        assert!(msg.unwrap().contains("unknown problem killing"));
        assert_eq!(p.pid, 0);
        assert!(!p.killing);
        assert_eq!(p.delay, 0.0);
    }

    #[test]
    fn stop_of_idle_process_reports_not_running() {
        let sys = Rc::new(FakeSystem::new());
        let mut bus = EventBus::new();
        let mut p = make_proc(&sys, test_config("sleep"));
        let msg = p.kill(libc::SIGTERM, &mut bus).unwrap();
        assert!(msg.contains("wasn't running"));
        assert!(sys.kills().is_empty());
    }

    #[test]
    fn write_queues_for_running_child_only() {
        let sys = Rc::new(FakeSystem::new());
        sys.add_stat("/bin/sleep", executable());
        sys.push_fork(Ok(Fork::Parent(42)));
        let mut bus = EventBus::new();
        let mut p = make_proc(&sys, test_config("sleep"));
        assert_eq!(p.write(b"hi"), Err(WriteError::NotRunning));
        p.spawn(&mut bus).unwrap();
        assert!(p.write(b"hi").is_ok());
        let (_, writable) = p.poll_fds();
        assert_eq!(writable.len(), 1);
        assert_eq!(
            p.write(&vec![0u8; crate::dispatcher::InputDispatcher::MAX_BUFFERED]),
            Err(WriteError::QueueFull)
        );
    }

    #[test]
    fn eof_closes_and_deregisters_the_output_fd() {
        let sys = Rc::new(FakeSystem::new());
        sys.add_stat("/bin/sleep", executable());
        sys.push_fork(Ok(Fork::Parent(42)));
        let mut bus = EventBus::new();
        let mut p = make_proc(&sys, test_config("sleep"));
        p.spawn(&mut bus).unwrap();
        let stdout_fd = p.poll_fds().0[0];
        // No scripted data means EOF.
        p.handle_readable(stdout_fd, &mut bus);
        assert!(!p.owns_fd(stdout_fd));
        assert!(sys.closed_fds().contains(&stdout_fd));
    }

    #[test]
    fn child_side_sets_up_fds_and_exits_on_exec_failure() {
        let sys = Rc::new(FakeSystem::new());
        sys.set_minfds(5);
        sys.add_stat("/bin/sleep", executable());
        sys.push_fork(Ok(Fork::Child));
        let mut bus = EventBus::new();
        let mut config = test_config("sleep");
        config.uid = Some(1234);
        config.umask = Some(0o022);
        config.directory = Some(PathBuf::from("/tmp"));
        let mut p = make_proc(&sys, config);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = p.spawn(&mut bus);
        }));
        assert!(result.is_err());
        assert_eq!(sys.exited(), Some(127));
        // Pipe ends landed on fds 0, 1 and 2.
        let dup2s = sys.dup2s();
        assert_eq!(dup2s.iter().map(|(_, dst)| *dst).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(sys.closed_fds().contains(&3));
        assert!(sys.closed_fds().contains(&4));
        assert_eq!(sys.priv_drops(), vec![1234]);
        assert_eq!(sys.umasks(), vec![0o022]);
        assert_eq!(sys.chdirs(), vec![PathBuf::from("/tmp")]);
        // The exec failure line went to fd 1 so it lands in the child log.
        let line = String::from_utf8(sys.written(1)).unwrap();
        assert!(line.contains("couldn't exec sleep"));
    }

    #[test]
    fn state_change_events_are_published_on_spawn_and_finish() {
        let sys = Rc::new(FakeSystem::new());
        sys.set_now(100.0);
        sys.add_stat("/bin/sleep", executable());
        sys.push_fork(Ok(Fork::Parent(42)));
        let mut bus = EventBus::new();
        let transitions = Rc::new(std::cell::RefCell::new(Vec::new()));
        let seen = Rc::clone(&transitions);
        bus.subscribe(
            crate::events::EventType::ProcessState,
            Box::new(move |event| {
                if let Event::ProcessState { from, to, .. } = event {
                    seen.borrow_mut().push((*from, *to));
                }
                Ok(())
            }),
        );
        let mut p = make_proc(&sys, test_config("sleep"));
        p.spawn(&mut bus).unwrap();
        sys.set_now(110.0);
        p.finish(42, ExitStatus::Exited(0), &mut bus);
        assert_eq!(
            transitions.borrow().as_slice(),
            &[
                (ProcessState::Stopped, ProcessState::Starting),
                (ProcessState::Starting, ProcessState::Exited),
            ]
        );
    }
}

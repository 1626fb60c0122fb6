// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Scripted [`System`] double for unit tests.
//!
//! Forks, pipe allocation, reads, writes, kills and the clock are all driven
//! from the test body, so spawn/finish/transition logic runs without any real
//! child processes.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;

use crate::config::ProcessConfig;
use crate::sys::{ExitStatus, FileStat, Fork, Pipes, System};

/// Builder for a minimal process config whose command resolves under the
/// fake `/bin`.
pub fn test_config(name: &str) -> ProcessConfig {
    let mut config = ProcessConfig::new(name, vec![name.to_string()]).unwrap();
    config.startsecs = 1.0;
    config.stopwaitsecs = 10.0;
    config
}

#[derive(Default)]
struct FakeState {
    now: f64,
    next_fd: RawFd,
    next_pid: i32,
    stats: HashMap<PathBuf, FileStat>,
    forks: VecDeque<Result<Fork, Errno>>,
    pipe_failures: VecDeque<Errno>,
    closed: Vec<RawFd>,
    kills: Vec<(i32, i32)>,
    kill_failure: Option<Errno>,
    reads: HashMap<RawFd, VecDeque<Vec<u8>>>,
    written: HashMap<RawFd, Vec<u8>>,
    write_failures: HashMap<RawFd, Errno>,
    write_limit: usize,
    waits: VecDeque<(i32, ExitStatus)>,
    selects: VecDeque<(Vec<RawFd>, Vec<RawFd>)>,
    select_errors: VecDeque<Errno>,
    dup2s: Vec<(RawFd, RawFd)>,
    chdirs: Vec<PathBuf>,
    umasks: Vec<u32>,
    priv_drops: Vec<u32>,
    environ: Vec<(String, String)>,
    exited: Option<i32>,
}

pub struct FakeSystem {
    state: RefCell<FakeState>,
    minfds: Cell<RawFd>,
}

impl Default for FakeSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSystem {
    pub fn new() -> Self {
        let state = FakeState {
            now: 0.0,
            next_fd: 100,
            next_pid: 1000,
            write_limit: usize::MAX,
            ..FakeState::default()
        };
        Self {
            state: RefCell::new(state),
            minfds: Cell::new(5),
        }
    }

    pub fn set_now(&self, now: f64) {
        self.state.borrow_mut().now = now;
    }

    pub fn advance(&self, secs: f64) {
        self.state.borrow_mut().now += secs;
    }

    pub fn set_minfds(&self, minfds: RawFd) {
        self.minfds.set(minfds);
    }

    pub fn add_stat(&self, path: &str, st: FileStat) {
        self.state.borrow_mut().stats.insert(PathBuf::from(path), st);
    }

    /// Convenience: register `/bin/<name>` as a plain executable.
    pub fn add_executable(&self, name: &str) {
        self.add_stat(
            &format!("/bin/{name}"),
            FileStat {
                is_dir: false,
                mode: 0o755,
            },
        );
    }

    pub fn push_fork(&self, result: Result<Fork, Errno>) {
        self.state.borrow_mut().forks.push_back(result);
    }

    pub fn fail_next_pipes(&self, errno: Errno) {
        self.state.borrow_mut().pipe_failures.push_back(errno);
    }

    pub fn closed_fds(&self) -> Vec<RawFd> {
        self.state.borrow().closed.clone()
    }

    pub fn kills(&self) -> Vec<(i32, i32)> {
        self.state.borrow().kills.clone()
    }

    pub fn fail_kills(&self, errno: Errno) {
        self.state.borrow_mut().kill_failure = Some(errno);
    }

    pub fn push_read(&self, fd: RawFd, data: &[u8]) {
        self.state
            .borrow_mut()
            .reads
            .entry(fd)
            .or_default()
            .push_back(data.to_vec());
    }

    pub fn written(&self, fd: RawFd) -> Vec<u8> {
        self.state.borrow().written.get(&fd).cloned().unwrap_or_default()
    }

    pub fn set_write_limit(&self, limit: usize) {
        self.state.borrow_mut().write_limit = limit;
    }

    pub fn fail_writes(&self, fd: RawFd, errno: Errno) {
        self.state.borrow_mut().write_failures.insert(fd, errno);
    }

    pub fn push_wait(&self, pid: i32, sts: ExitStatus) {
        self.state.borrow_mut().waits.push_back((pid, sts));
    }

    pub fn push_select(&self, read: Vec<RawFd>, write: Vec<RawFd>) {
        self.state.borrow_mut().selects.push_back((read, write));
    }

    pub fn push_select_error(&self, errno: Errno) {
        self.state.borrow_mut().select_errors.push_back(errno);
    }

    pub fn dup2s(&self) -> Vec<(RawFd, RawFd)> {
        self.state.borrow().dup2s.clone()
    }

    pub fn priv_drops(&self) -> Vec<u32> {
        self.state.borrow().priv_drops.clone()
    }

    pub fn umasks(&self) -> Vec<u32> {
        self.state.borrow().umasks.clone()
    }

    pub fn chdirs(&self) -> Vec<PathBuf> {
        self.state.borrow().chdirs.clone()
    }

    pub fn exited(&self) -> Option<i32> {
        self.state.borrow().exited
    }

    pub fn set_environ(&self, env: Vec<(String, String)>) {
        self.state.borrow_mut().environ = env;
    }
}

impl System for FakeSystem {
    fn now(&self) -> f64 {
        self.state.borrow().now
    }

    fn stat(&self, path: &Path) -> Result<FileStat, Errno> {
        self.state
            .borrow()
            .stats
            .get(path)
            .copied()
            .ok_or(Errno::ENOENT)
    }

    fn get_path(&self) -> Vec<PathBuf> {
        vec![PathBuf::from("/bin")]
    }

    fn environ(&self) -> Vec<(String, String)> {
        self.state.borrow().environ.clone()
    }

    fn minfds(&self) -> RawFd {
        self.minfds.get()
    }

    fn make_pipes(&self, want_stderr: bool) -> Result<Pipes, Errno> {
        let mut state = self.state.borrow_mut();
        if let Some(errno) = state.pipe_failures.pop_front() {
            return Err(errno);
        }
        let mut next = || {
            let fd = state.next_fd;
            state.next_fd += 1;
            fd
        };
        let mut pipes = Pipes {
            child_stdin: Some(next()),
            stdin: Some(next()),
            stdout: Some(next()),
            child_stdout: Some(next()),
            ..Pipes::default()
        };
        if want_stderr {
            pipes.stderr = Some(next());
            pipes.child_stderr = Some(next());
        }
        Ok(pipes)
    }

    fn close_fd(&self, fd: RawFd) {
        self.state.borrow_mut().closed.push(fd);
    }

    fn fork(&self) -> Result<Fork, Errno> {
        let mut state = self.state.borrow_mut();
        match state.forks.pop_front() {
            Some(result) => result,
            None => {
                let pid = state.next_pid;
                state.next_pid += 1;
                Ok(Fork::Parent(pid))
            }
        }
    }

    fn setpgrp(&self) {}

    fn dup2(&self, src: RawFd, dst: RawFd) -> Result<(), Errno> {
        self.state.borrow_mut().dup2s.push((src, dst));
        Ok(())
    }

    fn execve(&self, _filename: &Path, _argv: &[String], _env: &[(String, String)]) -> Errno {
        Errno::ENOENT
    }

    fn drop_privileges(&self, uid: u32) -> Option<String> {
        self.state.borrow_mut().priv_drops.push(uid);
        None
    }

    fn set_umask(&self, mask: u32) {
        self.state.borrow_mut().umasks.push(mask);
    }

    fn chdir(&self, dir: &Path) -> Result<(), Errno> {
        self.state.borrow_mut().chdirs.push(dir.to_path_buf());
        Ok(())
    }

    fn read_fd(&self, fd: RawFd) -> Result<Vec<u8>, Errno> {
        let mut state = self.state.borrow_mut();
        match state.reads.get_mut(&fd).and_then(|q| q.pop_front()) {
            Some(data) => Ok(data),
            None => Ok(Vec::new()),
        }
    }

    fn write_fd(&self, fd: RawFd, data: &[u8]) -> Result<usize, Errno> {
        let mut state = self.state.borrow_mut();
        if let Some(errno) = state.write_failures.get(&fd) {
            return Err(*errno);
        }
        let n = data.len().min(state.write_limit);
        state.written.entry(fd).or_default().extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn kill(&self, pid: i32, sig: i32) -> Result<(), Errno> {
        let mut state = self.state.borrow_mut();
        if let Some(errno) = state.kill_failure {
            return Err(errno);
        }
        state.kills.push((pid, sig));
        Ok(())
    }

    fn waitpid_nohang(&self) -> Result<Option<(i32, ExitStatus)>, Errno> {
        Ok(self.state.borrow_mut().waits.pop_front())
    }

    fn select(
        &self,
        _read: &[RawFd],
        _write: &[RawFd],
        _timeout: Duration,
    ) -> Result<(Vec<RawFd>, Vec<RawFd>), Errno> {
        let mut state = self.state.borrow_mut();
        if let Some(errno) = state.select_errors.pop_front() {
            return Err(errno);
        }
        Ok(state.selects.pop_front().unwrap_or_default())
    }

    fn create_listener(
        &self,
        _socket: &crate::config::SocketConfig,
    ) -> Result<RawFd, Errno> {
        let mut state = self.state.borrow_mut();
        let fd = state.next_fd;
        state.next_fd += 1;
        Ok(fd)
    }

    fn exit_process(&self, code: i32) -> ! {
        self.state.borrow_mut().exited = Some(code);
        panic!("child exited with code {code}");
    }
}

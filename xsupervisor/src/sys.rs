// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The seam between the supervision engine and the kernel.
//!
//! Everything the engine asks of the operating system goes through the
//! [`System`] trait so that state-machine logic can be exercised against a
//! scripted double. [`RealSystem`] is the production implementation, built on
//! nix where a wrapper exists and raw libc where one does not.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

/// Bounded read size for one dispatcher turn.
pub const READ_CHUNK: usize = 1 << 16;

/// Result of a fork as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fork {
    Parent(i32),
    Child,
}

/// Decoded `wait(2)` status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(i32),
}

impl ExitStatus {
    /// Exit code for a normal exit, `None` when killed by a signal.
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Exited(code) => Some(*code),
            ExitStatus::Signaled(_) => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ExitStatus::Exited(code) => format!("exit status {code}"),
            ExitStatus::Signaled(sig) => format!("terminated by {}", signame(*sig)),
        }
    }
}

/// Human name for a signal number, `SIGTERM` style.
pub fn signame(sig: i32) -> String {
    match Signal::try_from(sig) {
        Ok(s) => s.as_str().to_string(),
        Err(_) => format!("signal {sig}"),
    }
}

/// The slice of `stat(2)` the spawn path cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub is_dir: bool,
    pub mode: u32,
}

impl FileStat {
    pub fn is_executable(&self) -> bool {
        self.mode & 0o111 != 0
    }
}

/// Parent and child ends of the stdio pipes for one subprocess.
///
/// `stdin`/`stdout`/`stderr` are the parent-side ends; the `child_` fds are
/// handed to the child and closed in the parent after a successful fork.
/// `stderr` ends are absent when the child's stderr is redirected onto the
/// stdout pipe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pipes {
    pub child_stdin: Option<RawFd>,
    pub stdin: Option<RawFd>,
    pub stdout: Option<RawFd>,
    pub child_stdout: Option<RawFd>,
    pub stderr: Option<RawFd>,
    pub child_stderr: Option<RawFd>,
}

impl Pipes {
    pub fn parent_fds(&self) -> impl Iterator<Item = RawFd> {
        [self.stdin, self.stdout, self.stderr]
            .into_iter()
            .flatten()
    }

    pub fn child_fds(&self) -> impl Iterator<Item = RawFd> {
        [self.child_stdin, self.child_stdout, self.child_stderr]
            .into_iter()
            .flatten()
    }
}

/// Syscall surface used by the engine.
///
/// All methods take `&self`; implementations that need bookkeeping use
/// interior mutability. The engine holds this behind `Rc<dyn System>`.
pub trait System {
    /// Wall clock, seconds since the epoch.
    fn now(&self) -> f64;

    fn stat(&self, path: &Path) -> Result<FileStat, Errno>;

    /// Directories of `$PATH`, in order.
    fn get_path(&self) -> Vec<PathBuf>;

    /// Parent environment to merge under the per-process overrides.
    fn environ(&self) -> Vec<(String, String)>;

    /// First fd the child closes up to before exec.
    fn minfds(&self) -> RawFd;

    fn make_pipes(&self, want_stderr: bool) -> Result<Pipes, Errno>;

    fn close_fd(&self, fd: RawFd);

    fn fork(&self) -> Result<Fork, Errno>;

    /// Put the calling (child) process in its own process group.
    fn setpgrp(&self);

    fn dup2(&self, src: RawFd, dst: RawFd) -> Result<(), Errno>;

    /// Replace the process image. Only returns on failure.
    fn execve(&self, filename: &Path, argv: &[String], env: &[(String, String)]) -> Errno;

    /// Switch to the target uid (groups, gid, then uid). `None` on success,
    /// otherwise a message describing the failure.
    fn drop_privileges(&self, uid: u32) -> Option<String>;

    fn set_umask(&self, mask: u32);

    fn chdir(&self, dir: &Path) -> Result<(), Errno>;

    fn read_fd(&self, fd: RawFd) -> Result<Vec<u8>, Errno>;

    fn write_fd(&self, fd: RawFd, data: &[u8]) -> Result<usize, Errno>;

    /// Send `sig` to a pid (negative values address a process group).
    fn kill(&self, pid: i32, sig: i32) -> Result<(), Errno>;

    /// One `waitpid(-1, WNOHANG)` step. `Ok(None)` when there is nothing to
    /// reap, including ECHILD.
    fn waitpid_nohang(&self) -> Result<Option<(i32, ExitStatus)>, Errno>;

    fn select(
        &self,
        read: &[RawFd],
        write: &[RawFd],
        timeout: Duration,
    ) -> Result<(Vec<RawFd>, Vec<RawFd>), Errno>;

    /// Open a listening socket for socket-fed (fcgi style) children.
    fn create_listener(&self, socket: &crate::config::SocketConfig) -> Result<RawFd, Errno>;

    /// Exit without running atexit handlers. Child-side only.
    fn exit_process(&self, code: i32) -> !;
}

/// Production implementation over nix/libc.
pub struct RealSystem {
    minfds: RawFd,
}

impl RealSystem {
    pub fn new(minfds: RawFd) -> Self {
        Self { minfds }
    }
}

impl System for RealSystem {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    fn stat(&self, path: &Path) -> Result<FileStat, Errno> {
        match std::fs::metadata(path) {
            Ok(meta) => Ok(FileStat {
                is_dir: meta.is_dir(),
                mode: meta.permissions().mode(),
            }),
            Err(e) => Err(Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO))),
        }
    }

    fn get_path(&self) -> Vec<PathBuf> {
        std::env::var_os("PATH")
            .map(|p| std::env::split_paths(&p).collect())
            .unwrap_or_default()
    }

    fn environ(&self) -> Vec<(String, String)> {
        std::env::vars().collect()
    }

    fn minfds(&self) -> RawFd {
        self.minfds
    }

    fn make_pipes(&self, want_stderr: bool) -> Result<Pipes, Errno> {
        fn pipe_pair() -> Result<(RawFd, RawFd), Errno> {
            let mut fds = [0 as RawFd; 2];
            // Safety: fds is a valid two-element buffer.
            if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
                return Err(Errno::last());
            }
            Ok((fds[0], fds[1]))
        }

        fn set_nonblocking(fd: RawFd) {
            // Safety: plain fcntl on an fd we own.
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                if flags != -1 {
                    libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                }
            }
        }

        let mut pipes = Pipes::default();
        let close_all = |p: &Pipes, sys: &RealSystem| {
            for fd in p.parent_fds().chain(p.child_fds()) {
                sys.close_fd(fd);
            }
        };

        match pipe_pair() {
            Ok((r, w)) => {
                pipes.child_stdin = Some(r);
                pipes.stdin = Some(w);
            }
            Err(e) => return Err(e),
        }
        match pipe_pair() {
            Ok((r, w)) => {
                pipes.stdout = Some(r);
                pipes.child_stdout = Some(w);
            }
            Err(e) => {
                close_all(&pipes, self);
                return Err(e);
            }
        }
        if want_stderr {
            match pipe_pair() {
                Ok((r, w)) => {
                    pipes.stderr = Some(r);
                    pipes.child_stderr = Some(w);
                }
                Err(e) => {
                    close_all(&pipes, self);
                    return Err(e);
                }
            }
        }
        for fd in pipes.parent_fds() {
            set_nonblocking(fd);
        }
        Ok(pipes)
    }

    fn close_fd(&self, fd: RawFd) {
        // Safety: best-effort close of an fd the engine owns.
        unsafe {
            libc::close(fd);
        }
    }

    fn fork(&self) -> Result<Fork, Errno> {
        // Safety: the engine is single-threaded, the child only calls
        // exec-safe operations before execve/_exit.
        match unsafe { libc::fork() } {
            -1 => Err(Errno::last()),
            0 => Ok(Fork::Child),
            pid => Ok(Fork::Parent(pid)),
        }
    }

    fn setpgrp(&self) {
        // Safety: no preconditions.
        unsafe {
            libc::setpgid(0, 0);
        }
    }

    fn dup2(&self, src: RawFd, dst: RawFd) -> Result<(), Errno> {
        // Safety: both fds are owned by the caller.
        if unsafe { libc::dup2(src, dst) } == -1 {
            Err(Errno::last())
        } else {
            Ok(())
        }
    }

    fn execve(&self, filename: &Path, argv: &[String], env: &[(String, String)]) -> Errno {
        let Ok(path) = CString::new(filename.as_os_str().as_bytes()) else {
            return Errno::EINVAL;
        };
        let args = match argv
            .iter()
            .map(|a| CString::new(a.as_str()))
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(args) => args,
            Err(_) => return Errno::EINVAL,
        };
        let envs = match env
            .iter()
            .map(|(k, v)| CString::new(format!("{k}={v}")))
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(envs) => envs,
            Err(_) => return Errno::EINVAL,
        };
        let arg_ptrs: Vec<*const libc::c_char> = args
            .iter()
            .map(|a| a.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        let env_ptrs: Vec<*const libc::c_char> = envs
            .iter()
            .map(|e| e.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        // Safety: all pointers reference the NUL-terminated storage above.
        unsafe {
            libc::execve(path.as_ptr(), arg_ptrs.as_ptr(), env_ptrs.as_ptr());
        }
        Errno::last()
    }

    fn drop_privileges(&self, uid: u32) -> Option<String> {
        use nix::unistd::{setgid, setuid, Gid, Uid, User};

        if !Uid::effective().is_root() {
            return Some("can't drop privilege as nonroot user".to_string());
        }
        let user = match User::from_uid(Uid::from_raw(uid)) {
            Ok(Some(user)) => user,
            Ok(None) => return Some(format!("no such uid {uid}")),
            Err(e) => return Some(format!("uid lookup failed: {e}")),
        };
        let Ok(name) = CString::new(user.name.as_str()) else {
            return Some("bad username".to_string());
        };
        // Safety: name is NUL-terminated, gid is a plain integer.
        if unsafe { libc::initgroups(name.as_ptr(), user.gid.as_raw() as libc::gid_t) } == -1 {
            return Some("could not set groups".to_string());
        }
        if let Err(e) = setgid(Gid::from_raw(user.gid.as_raw())) {
            return Some(format!("could not set group id: {e}"));
        }
        if let Err(e) = setuid(Uid::from_raw(uid)) {
            return Some(format!("could not set user id: {e}"));
        }
        None
    }

    fn set_umask(&self, mask: u32) {
        // Safety: no preconditions.
        unsafe {
            libc::umask(mask as libc::mode_t);
        }
    }

    fn chdir(&self, dir: &Path) -> Result<(), Errno> {
        nix::unistd::chdir(dir)
    }

    fn read_fd(&self, fd: RawFd) -> Result<Vec<u8>, Errno> {
        let mut buf = vec![0u8; READ_CHUNK];
        // Safety: buf outlives the call and is READ_CHUNK bytes long.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            return Err(Errno::last());
        }
        buf.truncate(n as usize);
        Ok(buf)
    }

    fn write_fd(&self, fd: RawFd, data: &[u8]) -> Result<usize, Errno> {
        // Safety: data is a live slice for the duration of the call.
        let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
        if n < 0 {
            Err(Errno::last())
        } else {
            Ok(n as usize)
        }
    }

    fn kill(&self, pid: i32, sig: i32) -> Result<(), Errno> {
        // Safety: no preconditions.
        if unsafe { libc::kill(pid, sig) } == -1 {
            Err(Errno::last())
        } else {
            Ok(())
        }
    }

    fn waitpid_nohang(&self) -> Result<Option<(i32, ExitStatus)>, Errno> {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => Ok(Some((pid.as_raw(), ExitStatus::Exited(code)))),
            Ok(WaitStatus::Signaled(pid, sig, _)) => {
                Ok(Some((pid.as_raw(), ExitStatus::Signaled(sig as i32))))
            }
            Ok(WaitStatus::StillAlive) => Ok(None),
            // Stopped/continued children are not exits; nothing to reap yet.
            Ok(_) => Ok(None),
            Err(Errno::ECHILD) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn select(
        &self,
        read: &[RawFd],
        write: &[RawFd],
        timeout: Duration,
    ) -> Result<(Vec<RawFd>, Vec<RawFd>), Errno> {
        // Safety: fd_set is a plain bitset, zeroed is a valid initial state.
        unsafe {
            let mut rset: libc::fd_set = std::mem::zeroed();
            let mut wset: libc::fd_set = std::mem::zeroed();
            libc::FD_ZERO(&mut rset);
            libc::FD_ZERO(&mut wset);
            let mut nfds = 0;
            for &fd in read {
                libc::FD_SET(fd, &mut rset);
                nfds = nfds.max(fd + 1);
            }
            for &fd in write {
                libc::FD_SET(fd, &mut wset);
                nfds = nfds.max(fd + 1);
            }
            let mut tv = libc::timeval {
                tv_sec: timeout.as_secs() as libc::time_t,
                tv_usec: timeout.subsec_micros() as libc::suseconds_t,
            };
            let rc = libc::select(
                nfds,
                &mut rset,
                &mut wset,
                std::ptr::null_mut(),
                &mut tv,
            );
            if rc == -1 {
                return Err(Errno::last());
            }
            let ready_r = read
                .iter()
                .copied()
                .filter(|&fd| libc::FD_ISSET(fd, &rset))
                .collect();
            let ready_w = write
                .iter()
                .copied()
                .filter(|&fd| libc::FD_ISSET(fd, &wset))
                .collect();
            Ok((ready_r, ready_w))
        }
    }

    fn create_listener(&self, socket: &crate::config::SocketConfig) -> Result<RawFd, Errno> {
        use std::os::unix::io::IntoRawFd;

        let map_err =
            |e: std::io::Error| Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO));
        match socket {
            crate::config::SocketConfig::Unix { path } => {
                let _ = std::fs::remove_file(path);
                let listener = std::os::unix::net::UnixListener::bind(path).map_err(map_err)?;
                Ok(listener.into_raw_fd())
            }
            crate::config::SocketConfig::Tcp { host, port } => {
                let listener =
                    std::net::TcpListener::bind((host.as_str(), *port)).map_err(map_err)?;
                Ok(listener.into_raw_fd())
            }
        }
    }

    fn exit_process(&self, code: i32) -> ! {
        // Safety: no preconditions.
        unsafe { libc::_exit(code) }
    }
}

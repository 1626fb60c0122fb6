// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-level housekeeping for the daemon: detaching from the terminal,
//! pidfile management, rlimit checks and orphaned child-log cleanup.

use std::os::unix::io::AsRawFd;
use std::path::Path;

use anyhow::{bail, Context};
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use tracing::info;

use xsupervisor::sys::{RealSystem, System};

/// Detach: fork (parent exits), new session, chdir, stdio onto /dev/null.
pub fn daemonize(directory: Option<&Path>) -> anyhow::Result<()> {
    // Safety: single-threaded at this point, before any worker state exists.
    match unsafe { libc::fork() } {
        -1 => bail!("could not fork to daemonize: {}", nix::errno::Errno::last()),
        0 => {}
        _pid => std::process::exit(0),
    }
    nix::unistd::setsid().context("setsid failed")?;
    let target = directory.unwrap_or_else(|| Path::new("/"));
    std::env::set_current_dir(target)
        .with_context(|| format!("could not chdir to {}", target.display()))?;
    let devnull = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("could not open /dev/null")?;
    let fd = devnull.as_raw_fd();
    // Safety: devnull is open for the duration of the dup2 calls.
    unsafe {
        libc::dup2(fd, 0);
        libc::dup2(fd, 1);
        libc::dup2(fd, 2);
    }
    Ok(())
}

pub fn write_pidfile(path: &Path) -> anyhow::Result<()> {
    std::fs::write(path, format!("{}\n", std::process::id()))
        .with_context(|| format!("could not write pidfile {}", path.display()))
}

pub fn remove_pidfile(path: &Path) {
    let _ = std::fs::remove_file(path);
}

/// Check RLIMIT_NOFILE and RLIMIT_NPROC against the configured minimums,
/// raising the soft limit where the hard limit allows. Returns messages to
/// log once logging is up; errors are fatal.
pub fn set_rlimits(minfds: u64, minprocs: u64) -> anyhow::Result<Vec<String>> {
    let mut messages = Vec::new();
    let checks = [
        (Resource::RLIMIT_NOFILE, minfds, "minfds", "file descriptors"),
        (Resource::RLIMIT_NPROC, minprocs, "minprocs", "processes"),
    ];
    for (resource, min, setting, what) in checks {
        let (soft, hard) = getrlimit(resource)
            .with_context(|| format!("could not read the {what} limit"))?;
        if soft >= min {
            continue;
        }
        if hard >= min {
            setrlimit(resource, min, hard)
                .with_context(|| format!("could not raise the {what} limit to {min}"))?;
            messages.push(format!("Increased {what} limit to {min}"));
        } else {
            bail!(
                "The minimum number of {what} required to run this process is {min} as per \
                 the \"{setting}\" setting; the hard limit on this system is {hard}. Raise \
                 the hard limit or lower {setting}."
            );
        }
    }
    Ok(messages)
}

/// Drop privileges to the configured user at startup. A failure is reported
/// as a message, not an abort, matching foreground debugging use.
pub fn set_uid(user: &str) -> Option<String> {
    let uid = if let Ok(uid) = user.parse::<u32>() {
        uid
    } else {
        match nix::unistd::User::from_name(user) {
            Ok(Some(u)) => u.uid.as_raw(),
            _ => return Some(format!("could not find user {user}")),
        }
    };
    RealSystem::new(0).drop_privileges(uid)
}

/// Remove auto-named child logs left behind by a previous run. Matches the
/// `GROUP-NAME---IDENTIFIER-CHANNEL.log[.N]` shape.
pub fn clear_autochildlogdir(childlogdir: &Path, identifier: &str) {
    let marker = format!("---{identifier}-");
    let entries = match std::fs::read_dir(childlogdir) {
        Ok(entries) => entries,
        Err(_) => {
            info!("Could not clear childlog dir");
            return;
        }
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.contains(&marker) && name.contains(".log") {
            let path = entry.path();
            if std::fs::remove_file(&path).is_err() {
                info!("Failed to clean up {}", path.display());
            }
        }
    }
}

// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The control surface a collocated RPC handler calls into: list, start,
//! stop, log access, group add/remove, shutdown/restart, config reload.
//! Every failure is a typed fault, never a crash.

use thiserror::Error;
use tracing::info;

use crate::config::GroupConfig;
use crate::events::Channel;
use crate::process::{ProcessState, SpawnError};
use crate::supervisor::{Mood, Supervisor};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Fault {
    #[error("BAD_NAME: no such process or group '{0}'")]
    BadName(String),
    #[error("ALREADY_STARTED: {0}")]
    AlreadyStarted(String),
    #[error("NOT_RUNNING: {0}")]
    NotRunning(String),
    #[error("NO_FILE: {0}")]
    NoFile(String),
    #[error("NOT_EXECUTABLE: {0}")]
    NotExecutable(String),
    #[error("SPAWN_ERROR: {0}")]
    SpawnError(String),
    #[error("FAILED: {0}")]
    Failed(String),
    #[error("STILL_RUNNING: {0}")]
    StillRunning(String),
    #[error("SHUTDOWN_STATE: supervisor is shutting down")]
    ShutdownState,
    #[error("ALREADY_ADDED: {0}")]
    AlreadyAdded(String),
}

/// One row of `list()`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessInfo {
    pub name: String,
    pub group: String,
    pub state: ProcessState,
    pub pid: i32,
    pub start: i64,
    pub stop: i64,
    pub now: i64,
    pub description: String,
    pub spawnerr: String,
}

/// Per-process outcome of a batch operation.
pub type BatchStatus = Vec<(String, Result<(), Fault>)>;

fn uptime(secs: f64) -> String {
    let total = secs.max(0.0) as u64;
    format!("{}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

fn stamp(secs: f64) -> String {
    chrono::DateTime::from_timestamp(secs as i64, 0)
        .map(|t| t.format("%b %d %I:%M %p").to_string())
        .unwrap_or_else(|| "unknown time".to_string())
}

impl Supervisor {
    /// Resolve `name` or `group:name` to (group, process).
    fn resolve(&self, name: &str) -> Result<(String, String), Fault> {
        if let Some((group, process)) = name.split_once(':') {
            let found = self
                .groups
                .get(group)
                .map(|g| g.processes().iter().any(|p| p.name() == process))
                .unwrap_or(false);
            if found {
                return Ok((group.to_string(), process.to_string()));
            }
            return Err(Fault::BadName(name.to_string()));
        }
        if let Some(group) = self.groups.get(name) {
            if group.processes().iter().any(|p| p.name() == name) {
                return Ok((name.to_string(), name.to_string()));
            }
        }
        let mut matches = self
            .groups
            .values()
            .filter(|g| g.processes().iter().any(|p| p.name() == name))
            .map(|g| g.name().to_string());
        match (matches.next(), matches.next()) {
            (Some(group), None) => Ok((group, name.to_string())),
            _ => Err(Fault::BadName(name.to_string())),
        }
    }

    /// All managed processes, grouped, in display order.
    pub fn list(&self) -> Vec<ProcessInfo> {
        let now = self.sys.now();
        let mut out = Vec::new();
        for group in self.groups.values() {
            for p in group.processes() {
                let state = p.state();
                let description = match state {
                    ProcessState::Running | ProcessState::Starting | ProcessState::Stopping => {
                        format!("pid {}, uptime {}", p.pid, uptime(now - p.laststart))
                    }
                    ProcessState::Backoff | ProcessState::Fatal => p
                        .spawnerr
                        .clone()
                        .unwrap_or_else(|| "unknown error".to_string()),
                    _ => {
                        if p.laststop == 0.0 {
                            "Not started".to_string()
                        } else {
                            stamp(p.laststop)
                        }
                    }
                };
                out.push(ProcessInfo {
                    name: p.name().to_string(),
                    group: group.name().to_string(),
                    state,
                    pid: p.pid,
                    start: p.laststart as i64,
                    stop: p.laststop as i64,
                    now: now as i64,
                    description,
                    spawnerr: p.spawnerr.clone().unwrap_or_default(),
                });
            }
        }
        out
    }

    /// Start one process by name.
    pub fn start_process(&mut self, name: &str) -> Result<(), Fault> {
        if self.mood() != Mood::Running {
            return Err(Fault::ShutdownState);
        }
        let (gname, pname) = self.resolve(name)?;
        let group = self.groups.get_mut(&gname).ok_or_else(|| {
            Fault::BadName(name.to_string())
        })?;
        let state = group
            .processes()
            .iter()
            .find(|p| p.name() == pname)
            .map(|p| p.state())
            .ok_or_else(|| Fault::BadName(name.to_string()))?;
        match state {
            ProcessState::Running | ProcessState::Starting | ProcessState::Stopping => {
                return Err(Fault::AlreadyStarted(name.to_string()));
            }
            _ => {}
        }
        let result = group.spawn_process(&pname, &mut self.bus);
        self.sync_pidhistory();
        match result {
            Ok(_) => Ok(()),
            Err(SpawnError::NotFound(cmd)) => Err(Fault::NoFile(cmd)),
            Err(SpawnError::NotExecutable(path)) => Err(Fault::NotExecutable(path)),
            Err(e) => Err(Fault::SpawnError(e.to_string())),
        }
    }

    /// Stop one process by name.
    pub fn stop_process(&mut self, name: &str) -> Result<(), Fault> {
        let (gname, pname) = self.resolve(name)?;
        let group = self
            .groups
            .get_mut(&gname)
            .ok_or_else(|| Fault::BadName(name.to_string()))?;
        let p = group
            .by_name_mut(&pname)
            .ok_or_else(|| Fault::BadName(name.to_string()))?;
        match p.state() {
            ProcessState::Running | ProcessState::Starting => {
                p.stop(&mut self.bus);
                Ok(())
            }
            // A stop is already underway; accept the request.
            ProcessState::Stopping => Ok(()),
            _ => Err(Fault::NotRunning(name.to_string())),
        }
    }

    fn member_names(&self, group: &str, reverse: bool) -> Result<Vec<String>, Fault> {
        let g = self
            .groups
            .get(group)
            .ok_or_else(|| Fault::BadName(group.to_string()))?;
        let mut names: Vec<String> = g.processes().iter().map(|p| p.name().to_string()).collect();
        if reverse {
            names.reverse();
        }
        Ok(names)
    }

    pub fn start_group(&mut self, group: &str) -> Result<BatchStatus, Fault> {
        let names = self.member_names(group, false)?;
        Ok(names
            .into_iter()
            .map(|n| {
                let result = self.start_process(&format!("{group}:{n}"));
                (format!("{group}:{n}"), result)
            })
            .collect())
    }

    pub fn stop_group(&mut self, group: &str) -> Result<BatchStatus, Fault> {
        let names = self.member_names(group, true)?;
        Ok(names
            .into_iter()
            .map(|n| {
                let result = self.stop_process(&format!("{group}:{n}"));
                (format!("{group}:{n}"), result)
            })
            .collect())
    }

    pub fn start_all(&mut self) -> BatchStatus {
        let mut out = Vec::new();
        let groups: Vec<String> = self.groups.keys().cloned().collect();
        for group in groups {
            if let Ok(statuses) = self.start_group(&group) {
                out.extend(statuses);
            }
        }
        out
    }

    pub fn stop_all_processes(&mut self) -> BatchStatus {
        let mut out = Vec::new();
        let groups: Vec<String> = self.groups.keys().cloned().collect();
        for group in groups {
            if let Ok(statuses) = self.stop_group(&group) {
                out.extend(statuses);
            }
        }
        out
    }

    /// Read a byte range of a process's log. A negative offset addresses
    /// from the end; a zero length means "to the end".
    pub fn read_log(
        &self,
        name: &str,
        channel: Channel,
        offset: i64,
        length: i64,
    ) -> Result<Vec<u8>, Fault> {
        let (gname, pname) = self.resolve(name)?;
        let path = self.groups[&gname]
            .processes()
            .iter()
            .find(|p| p.name() == pname)
            .and_then(|p| p.config().log_config(channel).logfile.clone())
            .ok_or_else(|| Fault::NoFile(format!("no {channel} log configured for {name}")))?;
        let data = std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Fault::NoFile(path.display().to_string())
            } else {
                Fault::Failed(e.to_string())
            }
        })?;
        let start = if offset < 0 {
            data.len().saturating_sub(offset.unsigned_abs() as usize)
        } else {
            (offset as usize).min(data.len())
        };
        let end = if length <= 0 {
            data.len()
        } else {
            (start + length as usize).min(data.len())
        };
        Ok(data[start..end].to_vec())
    }

    /// Truncate a process's logs and drop their backups.
    pub fn clear_log(&mut self, name: &str) -> Result<(), Fault> {
        let (gname, pname) = self.resolve(name)?;
        let p = self
            .groups
            .get_mut(&gname)
            .and_then(|g| g.by_name_mut(&pname))
            .ok_or_else(|| Fault::BadName(name.to_string()))?;
        p.clear_logs().map_err(|e| Fault::Failed(e.to_string()))
    }

    /// Instantiate a group from the most recently loaded configuration.
    pub fn add_group(&mut self, name: &str) -> Result<(), Fault> {
        if self.mood() != Mood::Running {
            return Err(Fault::ShutdownState);
        }
        if self.groups.contains_key(name) {
            return Err(Fault::AlreadyAdded(name.to_string()));
        }
        let config = self
            .pending_configs
            .iter()
            .find(|c| c.name == name)
            .cloned()
            .ok_or_else(|| Fault::BadName(name.to_string()))?;
        self.install_group(config);
        info!("added process group {name}");
        Ok(())
    }

    /// Drop a fully stopped group.
    pub fn remove_group(&mut self, name: &str) -> Result<(), Fault> {
        let group = self
            .groups
            .get(name)
            .ok_or_else(|| Fault::BadName(name.to_string()))?;
        if !group.all_stopped() {
            return Err(Fault::StillRunning(name.to_string()));
        }
        self.remove_group_entry(name);
        info!("removed process group {name}");
        Ok(())
    }

    /// Ask the loop to drain and exit for good.
    pub fn shutdown(&mut self) {
        info!("received shutdown request");
        self.mood = Mood::Shutdown;
    }

    /// Ask the loop to drain and hand control back for a fresh start.
    pub fn restart(&mut self) {
        info!("received restart request");
        self.mood = Mood::Restart;
    }

    /// Diff freshly parsed group configs against the live set. Returns
    /// (added, changed, removed) group names; the new configs become the
    /// source for subsequent `add_group` calls.
    pub fn reload_config(
        &mut self,
        new: Vec<GroupConfig>,
    ) -> (Vec<String>, Vec<String>, Vec<String>) {
        let mut added = Vec::new();
        let mut changed = Vec::new();
        let mut removed = Vec::new();
        for config in &new {
            match self.groups.get(&config.name) {
                None => added.push(config.name.clone()),
                Some(live) => {
                    if live.config() != config {
                        changed.push(config.name.clone());
                    }
                }
            }
        }
        for name in self.groups.keys() {
            if !new.iter().any(|c| &c.name == name) {
                removed.push(name.clone());
            }
        }
        added.sort();
        changed.sort();
        removed.sort();
        self.pending_configs = new;
        (added, changed, removed)
    }
}

// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The supervisor: owner of all process groups and the select/signal loop
//! that drives them.

use std::collections::{BTreeMap, HashMap};
use std::ops::ControlFlow;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::errno::Errno;
use tracing::{debug, error, info, trace};

use crate::config::GroupConfig;
use crate::events::{Event, EventBus, EventType};
use crate::group::ProcessGroup;
use crate::logger::FileSink;
use crate::signals::SignalMailbox;
use crate::sys::{signame, System};

/// The supervisor's disposition. Ordering matters: anything at or below
/// `Restart` drains the children and exits the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Mood {
    Shutdown,
    Restart,
    Running,
}

/// Owns the groups, the event bus, the signal mailbox and the pid history
/// that routes reaped children back to their subprocess.
pub struct Supervisor {
    pub(crate) sys: Rc<dyn System>,
    pub(crate) bus: EventBus,
    pub(crate) groups: BTreeMap<String, ProcessGroup>,
    pub(crate) mood: Mood,
    pub(crate) stopping: bool,
    pub(crate) lastdelayreport: f64,
    pub(crate) pidhistory: HashMap<i32, (String, String)>,
    pub(crate) mailbox: Rc<SignalMailbox>,
    pub(crate) identifier: String,
    pub(crate) strip_ansi: bool,
    /// Group configs from the most recent load, for add_group and reload
    /// diffing.
    pub(crate) pending_configs: Vec<GroupConfig>,
    /// The daemon's own log sink, reopened on SIGUSR2 alongside child logs.
    pub(crate) daemon_sink: Option<Arc<Mutex<FileSink>>>,
}

impl Supervisor {
    pub fn new(
        sys: Rc<dyn System>,
        mailbox: Rc<SignalMailbox>,
        identifier: &str,
        strip_ansi: bool,
    ) -> Self {
        Self {
            sys,
            bus: EventBus::new(),
            groups: BTreeMap::new(),
            mood: Mood::Running,
            stopping: false,
            lastdelayreport: 0.0,
            pidhistory: HashMap::new(),
            mailbox,
            identifier: identifier.to_string(),
            strip_ansi,
            pending_configs: Vec::new(),
            daemon_sink: None,
        }
    }

    pub fn mood(&self) -> Mood {
        self.mood
    }

    pub fn bus_mut(&mut self) -> &mut EventBus {
        &mut self.bus
    }

    pub fn set_daemon_sink(&mut self, sink: Arc<Mutex<FileSink>>) {
        self.daemon_sink = Some(sink);
    }

    /// Load the given group configs: remembered for reload diffing, and each
    /// is instantiated as a live group.
    pub fn load_groups(&mut self, configs: Vec<GroupConfig>) {
        self.pending_configs = configs.clone();
        for config in configs {
            self.install_group(config);
        }
    }

    pub(crate) fn install_group(&mut self, config: GroupConfig) {
        let mut group = ProcessGroup::new(
            config,
            Rc::clone(&self.sys),
            &self.identifier,
            self.strip_ansi,
        );
        let tokens = group.listener_tokens();
        if !tokens.is_empty() {
            if let Some(buffer) = group.event_buffer() {
                let id = self.bus.subscribe(
                    EventType::Event,
                    Box::new(move |event| {
                        if tokens.iter().any(|t| t.matches(event)) {
                            buffer.borrow_mut().push_back(event.clone());
                        }
                        Ok(())
                    }),
                );
                group.set_subscription(id);
            }
        }
        self.groups.insert(group.name().to_string(), group);
    }

    pub(crate) fn remove_group_entry(&mut self, name: &str) -> Option<ProcessGroup> {
        let mut group = self.groups.remove(name)?;
        if let Some(id) = group.take_subscription() {
            self.bus.unsubscribe(id);
        }
        group.close_socket(true);
        Some(group)
    }

    /// Record every live pid so the reaper can route wait statuses.
    pub(crate) fn sync_pidhistory(&mut self) {
        for group in self.groups.values() {
            for p in group.processes() {
                if p.pid != 0 {
                    self.pidhistory
                        .entry(p.pid)
                        .or_insert_with(|| (group.name().to_string(), p.name().to_string()));
                }
            }
        }
    }

    /// Group names ordered by (priority, name); reversed for stopping.
    fn group_order(&self, reverse: bool) -> Vec<String> {
        let mut names: Vec<(i32, String)> = self
            .groups
            .values()
            .map(|g| (g.priority(), g.name().to_string()))
            .collect();
        names.sort();
        if reverse {
            names.reverse();
        }
        names.into_iter().map(|(_, name)| name).collect()
    }

    /// Run until shutdown or restart is requested and every child has been
    /// dealt with.
    pub fn run(&mut self) -> anyhow::Result<()> {
        self.bus.publish(Event::SupervisorRunning);
        info!("supervisor entering main loop");
        let result = loop {
            match self.run_once() {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(())) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.bus.publish(Event::SupervisorStopping);
        for group in self.groups.values_mut() {
            group.close_socket(true);
        }
        info!("supervisor exiting main loop");
        result
    }

    /// One tick: starts, drains, select, dispatch, transitions, undead
    /// killing, reaping, then the signal slot.
    pub(crate) fn run_once(&mut self) -> anyhow::Result<ControlFlow<()>> {
        if self.mood == Mood::Running {
            for name in self.group_order(false) {
                if let Some(group) = self.groups.get_mut(&name) {
                    group.start_necessary(&mut self.bus);
                }
            }
            self.sync_pidhistory();
        }

        if self.mood <= Mood::Restart {
            if !self.stopping {
                for name in self.group_order(true) {
                    if let Some(group) = self.groups.get_mut(&name) {
                        group.stop_all(&mut self.bus);
                    }
                }
                self.stopping = true;
            }
            let delayed: Vec<String> = self
                .groups
                .values()
                .flat_map(|g| g.delayed())
                .collect();
            if delayed.is_empty() {
                return Ok(ControlFlow::Break(()));
            }
            let now = self.sys.now();
            if now > self.lastdelayreport + 3.0 {
                info!("waiting for {} to die", delayed.join(", "));
                self.lastdelayreport = now;
            }
        }

        let mut read_fds: Vec<RawFd> = Vec::new();
        let mut write_fds: Vec<RawFd> = Vec::new();
        if let Some(fd) = self.mailbox.read_fd() {
            read_fds.push(fd);
        }
        for group in self.groups.values_mut() {
            for p in group.processes_mut() {
                p.log_output(&mut self.bus);
                let (r, w) = p.poll_fds();
                read_fds.extend(r);
                write_fds.extend(w);
            }
        }

        match self
            .sys
            .select(&read_fds, &write_fds, Duration::from_secs(1))
        {
            Ok((ready_read, ready_write)) => {
                for fd in ready_read {
                    if Some(fd) == self.mailbox.read_fd() {
                        self.mailbox.drain_pipe();
                        continue;
                    }
                    self.dispatch_read(fd);
                }
                for fd in ready_write {
                    self.dispatch_write(fd);
                }
            }
            Err(Errno::EINTR) => {
                trace!("EINTR encountered in select");
            }
            Err(e) => {
                return Err(anyhow::anyhow!("select failed: {e}"));
            }
        }

        for group in self.groups.values_mut() {
            group.transition(&mut self.bus);
            group.kill_undead(&mut self.bus);
        }
        self.sync_pidhistory();
        self.reap();
        self.handle_signal();
        Ok(ControlFlow::Continue(()))
    }

    fn dispatch_read(&mut self, fd: RawFd) {
        for group in self.groups.values_mut() {
            if let Some(p) = group.processes_mut().iter_mut().find(|p| p.owns_fd(fd)) {
                p.handle_readable(fd, &mut self.bus);
                return;
            }
        }
    }

    fn dispatch_write(&mut self, fd: RawFd) {
        for group in self.groups.values_mut() {
            if let Some(p) = group.processes_mut().iter_mut().find(|p| p.owns_fd(fd)) {
                p.handle_writable(fd);
                return;
            }
        }
    }

    /// Reap until there are no zombies left, routing each wait status
    /// through the pid history.
    fn reap(&mut self) {
        loop {
            match self.sys.waitpid_nohang() {
                Ok(Some((pid, sts))) => match self.pidhistory.remove(&pid) {
                    Some((gname, pname)) => {
                        if let Some(p) = self
                            .groups
                            .get_mut(&gname)
                            .and_then(|g| g.by_name_mut(&pname))
                        {
                            p.finish(pid, sts, &mut self.bus);
                        }
                    }
                    None => error!("reaped unknown pid {pid}"),
                },
                Ok(None) => return,
                Err(e) => {
                    error!("waitpid failed: {e}");
                    return;
                }
            }
        }
    }

    fn handle_signal(&mut self) {
        let Some(sig) = self.mailbox.take() else {
            return;
        };
        match sig {
            libc::SIGTERM | libc::SIGINT | libc::SIGQUIT => {
                error!("received {} indicating exit request", signame(sig));
                self.mood = Mood::Shutdown;
            }
            libc::SIGHUP => {
                error!("received SIGHUP indicating restart request");
                self.mood = Mood::Restart;
            }
            libc::SIGCHLD => {
                info!("received SIGCHLD indicating a child quit");
            }
            libc::SIGUSR2 => {
                info!("received SIGUSR2 indicating log reopen request");
                self.reopen_logs();
            }
            other => {
                debug!("received {} indicating nothing", signame(other));
            }
        }
    }

    /// Reopen the daemon log and every child log.
    pub fn reopen_logs(&mut self) {
        if let Some(sink) = &self.daemon_sink {
            if let Ok(mut sink) = sink.lock() {
                if let Err(e) = sink.reopen() {
                    error!("could not reopen supervisor log: {e}");
                }
            }
        }
        for group in self.groups.values_mut() {
            group.reopen_logs();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GroupConfig;
    use crate::process::ProcessState;
    use crate::sys::{ExitStatus, Fork};
    use crate::testing::{test_config, FakeSystem};
    use std::cell::RefCell;

    fn supervisor_with(
        sys: &Rc<FakeSystem>,
        groups: Vec<GroupConfig>,
    ) -> Supervisor {
        let sys_dyn: Rc<dyn System> = Rc::clone(sys) as Rc<dyn System>;
        let mut supervisor = Supervisor::new(
            sys_dyn,
            Rc::new(SignalMailbox::detached()),
            "supervisor",
            false,
        );
        supervisor.load_groups(groups);
        supervisor
    }

    fn single_group(name: &str, config: crate::config::ProcessConfig) -> GroupConfig {
        GroupConfig::new(name, config.priority, vec![Rc::new(config)])
    }

    fn state_of(supervisor: &Supervisor, group: &str, name: &str) -> ProcessState {
        supervisor.groups[group]
            .processes()
            .iter()
            .find(|p| p.name() == name)
            .unwrap()
            .state()
    }

    #[test]
    fn happy_path_reaches_running_after_startsecs() {
        let sys = Rc::new(FakeSystem::new());
        sys.add_executable("echoer");
        sys.set_now(100.0);
        sys.push_fork(Ok(Fork::Parent(42)));
        let mut supervisor = supervisor_with(&sys, vec![single_group("echoer", test_config("echoer"))]);
        supervisor.run_once().unwrap();
        assert_eq!(state_of(&supervisor, "echoer", "echoer"), ProcessState::Starting);
        assert_eq!(
            supervisor.pidhistory.get(&42),
            Some(&("echoer".to_string(), "echoer".to_string()))
        );
        sys.set_now(101.1);
        supervisor.run_once().unwrap();
        assert_eq!(state_of(&supervisor, "echoer", "echoer"), ProcessState::Running);
    }

    #[test]
    fn reaped_child_is_routed_through_pidhistory() {
        let sys = Rc::new(FakeSystem::new());
        sys.add_executable("svc");
        sys.set_now(100.0);
        sys.push_fork(Ok(Fork::Parent(42)));
        let mut config = test_config("svc");
        config.autorestart = crate::config::Autorestart::Never;
        let mut supervisor = supervisor_with(&sys, vec![single_group("svc", config)]);
        supervisor.run_once().unwrap();
        sys.set_now(110.0);
        sys.push_wait(42, ExitStatus::Exited(0));
        supervisor.run_once().unwrap();
        assert_eq!(state_of(&supervisor, "svc", "svc"), ProcessState::Exited);
        assert!(supervisor.pidhistory.is_empty());
    }

    #[test]
    fn term_signal_drains_children_and_breaks_the_loop() {
        let sys = Rc::new(FakeSystem::new());
        sys.add_executable("svc");
        sys.set_now(100.0);
        sys.push_fork(Ok(Fork::Parent(42)));
        let mut supervisor = supervisor_with(&sys, vec![single_group("svc", test_config("svc"))]);
        supervisor.run_once().unwrap();
        supervisor.mailbox.post(libc::SIGTERM);
        supervisor.run_once().unwrap();
        assert_eq!(supervisor.mood(), Mood::Shutdown);

        // Next tick issues the stop signals and keeps looping while the
        // child drains.
        let flow = supervisor.run_once().unwrap();
        assert_eq!(flow, ControlFlow::Continue(()));
        assert!(sys.kills().contains(&(-42, libc::SIGTERM)));

        sys.push_wait(42, ExitStatus::Signaled(libc::SIGTERM));
        supervisor.run_once().unwrap();
        assert_eq!(state_of(&supervisor, "svc", "svc"), ProcessState::Stopped);
        let flow = supervisor.run_once().unwrap();
        assert_eq!(flow, ControlFlow::Break(()));
    }

    #[test]
    fn restart_request_stops_groups_in_descending_priority() {
        let sys = Rc::new(FakeSystem::new());
        sys.add_executable("a");
        sys.add_executable("b");
        sys.set_now(100.0);
        let mut a = test_config("a");
        a.priority = 1;
        let mut b = test_config("b");
        b.priority = 10;
        sys.push_fork(Ok(Fork::Parent(11)));
        sys.push_fork(Ok(Fork::Parent(22)));
        let mut supervisor =
            supervisor_with(&sys, vec![single_group("a", a), single_group("b", b)]);
        supervisor.run_once().unwrap();
        assert_eq!(state_of(&supervisor, "a", "a"), ProcessState::Starting);

        supervisor.mailbox.post(libc::SIGHUP);
        supervisor.run_once().unwrap();
        assert_eq!(supervisor.mood(), Mood::Restart);
        supervisor.run_once().unwrap();
        // b (priority 10) was signalled before a (priority 1).
        assert_eq!(
            sys.kills(),
            vec![(-22, libc::SIGTERM), (-11, libc::SIGTERM)]
        );

        sys.push_wait(11, ExitStatus::Signaled(libc::SIGTERM));
        sys.push_wait(22, ExitStatus::Signaled(libc::SIGTERM));
        supervisor.run_once().unwrap();
        let flow = supervisor.run_once().unwrap();
        assert_eq!(flow, ControlFlow::Break(()));
        assert_eq!(supervisor.mood(), Mood::Restart);
    }

    #[test]
    fn eintr_from_select_is_tolerated() {
        let sys = Rc::new(FakeSystem::new());
        let mut supervisor = supervisor_with(&sys, vec![]);
        sys.push_select_error(Errno::EINTR);
        assert!(supervisor.run_once().is_ok());
    }

    #[test]
    fn other_select_errors_propagate() {
        let sys = Rc::new(FakeSystem::new());
        let mut supervisor = supervisor_with(&sys, vec![]);
        sys.push_select_error(Errno::EBADF);
        assert!(supervisor.run_once().is_err());
    }

    #[test]
    fn unknown_reaped_pid_is_logged_not_fatal() {
        let sys = Rc::new(FakeSystem::new());
        let mut supervisor = supervisor_with(&sys, vec![]);
        sys.push_wait(9999, ExitStatus::Exited(0));
        assert!(supervisor.run_once().is_ok());
    }

    #[test]
    fn ready_output_fd_is_dispatched_to_the_owning_process() {
        let sys = Rc::new(FakeSystem::new());
        sys.add_executable("svc");
        sys.set_now(100.0);
        sys.push_fork(Ok(Fork::Parent(42)));
        let mut config = test_config("svc");
        config.stdout.events_enabled = true;
        let mut supervisor = supervisor_with(&sys, vec![single_group("svc", config)]);
        let logged = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::clone(&logged);
        supervisor.bus.subscribe(
            EventType::ProcessLog,
            Box::new(move |event| {
                if let Event::ProcessLog { data, .. } = event {
                    seen.borrow_mut().push(data.clone());
                }
                Ok(())
            }),
        );
        supervisor.run_once().unwrap();
        let stdout_fd = supervisor.groups["svc"].processes()[0].poll_fds().0[0];
        sys.push_read(stdout_fd, b"hello from a long-winded managed child\n");
        sys.push_select(vec![stdout_fd], vec![]);
        supervisor.run_once().unwrap();
        assert_eq!(
            logged.borrow().as_slice(),
            &[b"hello from a long-winded managed child\n".to_vec()]
        );
    }

    #[test]
    fn run_emits_running_and_stopping_events() {
        let sys = Rc::new(FakeSystem::new());
        let mut supervisor = supervisor_with(&sys, vec![]);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        supervisor.bus.subscribe(
            EventType::SupervisorStateChange,
            Box::new(move |event| {
                sink.borrow_mut().push(event.kind_name());
                Ok(())
            }),
        );
        supervisor.mood = Mood::Shutdown;
        supervisor.run().unwrap();
        assert_eq!(
            seen.borrow().as_slice(),
            &[
                "SUPERVISOR_STATE_CHANGE_RUNNING",
                "SUPERVISOR_STATE_CHANGE_STOPPING"
            ]
        );
    }

    #[test]
    fn chld_signal_is_informational_only() {
        let sys = Rc::new(FakeSystem::new());
        let mut supervisor = supervisor_with(&sys, vec![]);
        supervisor.mailbox.post(libc::SIGCHLD);
        supervisor.run_once().unwrap();
        assert_eq!(supervisor.mood(), Mood::Running);
    }
}

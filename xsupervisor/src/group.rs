// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process groups: the unit of start/stop ordering, restart scheduling and
//! control-surface add/remove.

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use tracing::{debug, error, info, warn};

use crate::config::{Autorestart, GroupConfig, GroupKind, SocketConfig};
use crate::dispatcher::{ListenerResult, ListenerState};
use crate::events::{EventBuffer, EventBus, EventType, SubscriptionId};
use crate::process::{ProcessState, SpawnError, Subprocess};
use crate::sys::System;

/// A named, ordered collection of subprocesses sharing restart policy.
/// Traversal is ascending (priority, name) for starts and the reverse for
/// stops.
pub struct ProcessGroup {
    config: GroupConfig,
    sys: Rc<dyn System>,
    identifier: String,
    processes: Vec<Subprocess>,
    event_buffer: Option<Rc<RefCell<EventBuffer>>>,
    subscription: Option<SubscriptionId>,
    pool_serial: u64,
    socket_fd: Option<RawFd>,
}

impl ProcessGroup {
    pub fn new(
        config: GroupConfig,
        sys: Rc<dyn System>,
        identifier: &str,
        strip_ansi: bool,
    ) -> Self {
        let listener = matches!(config.kind, GroupKind::EventListener { .. });
        let mut processes: Vec<Subprocess> = config
            .programs
            .iter()
            .map(|p| p.make_process(Rc::clone(&sys), &config.name, strip_ansi, listener))
            .collect();
        processes.sort_by(|a, b| {
            (a.config().priority, a.name().to_string())
                .cmp(&(b.config().priority, b.name().to_string()))
        });
        let event_buffer = match &config.kind {
            GroupKind::EventListener { buffer_size, .. } => {
                Some(Rc::new(RefCell::new(EventBuffer::new(*buffer_size))))
            }
            _ => None,
        };
        Self {
            config,
            sys,
            identifier: identifier.to_string(),
            processes,
            event_buffer,
            subscription: None,
            pool_serial: 0,
            socket_fd: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn priority(&self) -> i32 {
        self.config.priority
    }

    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    pub fn processes(&self) -> &[Subprocess] {
        &self.processes
    }

    pub fn processes_mut(&mut self) -> &mut [Subprocess] {
        &mut self.processes
    }

    pub fn by_name_mut(&mut self, name: &str) -> Option<&mut Subprocess> {
        self.processes.iter_mut().find(|p| p.name() == name)
    }

    pub fn by_pid_mut(&mut self, pid: i32) -> Option<&mut Subprocess> {
        self.processes.iter_mut().find(|p| p.pid == pid)
    }

    /// Tokens this group's listener pool subscribes to.
    pub fn listener_tokens(&self) -> Vec<EventType> {
        match &self.config.kind {
            GroupKind::EventListener { events, .. } => events.clone(),
            _ => Vec::new(),
        }
    }

    pub fn event_buffer(&self) -> Option<Rc<RefCell<EventBuffer>>> {
        self.event_buffer.as_ref().map(Rc::clone)
    }

    pub fn set_subscription(&mut self, id: SubscriptionId) {
        self.subscription = Some(id);
    }

    pub fn take_subscription(&mut self) -> Option<SubscriptionId> {
        self.subscription.take()
    }

    fn ensure_socket(&mut self) -> Option<RawFd> {
        let GroupKind::Fcgi { socket } = &self.config.kind else {
            return None;
        };
        if self.socket_fd.is_none() {
            match self.sys.create_listener(socket) {
                Ok(fd) => self.socket_fd = Some(fd),
                Err(e) => warn!("could not open socket for group {}: {e}", self.config.name),
            }
        }
        self.socket_fd
    }

    /// Close the shared listening socket, unlinking a unix socket file.
    pub fn close_socket(&mut self, unlink: bool) {
        if let Some(fd) = self.socket_fd.take() {
            self.sys.close_fd(fd);
        }
        if unlink {
            if let GroupKind::Fcgi {
                socket: SocketConfig::Unix { path },
            } = &self.config.kind
            {
                let _ = std::fs::remove_file(path);
            }
        }
    }

    fn spawn_at(&mut self, idx: usize, bus: &mut EventBus) -> Result<i32, SpawnError> {
        let socket = self.ensure_socket();
        let p = &mut self.processes[idx];
        p.set_socket(socket);
        p.spawn(bus)
    }

    /// Start a named member, wiring the group socket first when present.
    pub fn spawn_process(&mut self, name: &str, bus: &mut EventBus) -> Result<i32, SpawnError> {
        let idx = self
            .processes
            .iter()
            .position(|p| p.name() == name)
            .ok_or_else(|| SpawnError::NotFound(name.to_string()))?;
        self.spawn_at(idx, bus)
    }

    fn wants_restart(p: &Subprocess) -> bool {
        match p.config().autorestart {
            Autorestart::Never => false,
            Autorestart::Always => true,
            Autorestart::Unexpected => match p.exitstatus.and_then(|s| s.code()) {
                Some(code) => !p.config().exitcodes.contains(&code),
                None => true,
            },
        }
    }

    /// Spawn whatever should be running now: autostarted processes that
    /// never ran, exited processes due a restart, and backoffs whose delay
    /// has elapsed.
    pub fn start_necessary(&mut self, bus: &mut EventBus) {
        let now = self.sys.now();
        for idx in 0..self.processes.len() {
            let p = &self.processes[idx];
            let spawn = match p.state() {
                ProcessState::Stopped => p.laststart == 0.0 && p.config().autostart,
                ProcessState::Exited => Self::wants_restart(p),
                ProcessState::Backoff => now > p.delay,
                _ => false,
            };
            if spawn {
                let _ = self.spawn_at(idx, bus);
            }
        }
    }

    /// Advance the timed state machines using the current clock.
    pub fn transition(&mut self, bus: &mut EventBus) {
        let now = self.sys.now();
        for idx in 0..self.processes.len() {
            let p = &self.processes[idx];
            match p.state() {
                ProcessState::Backoff => {
                    if p.backoff > p.config().startretries {
                        let name = p.name().to_string();
                        self.processes[idx].fail_to_fatal(bus);
                        info!(
                            "gave up: {name} entered FATAL state, too many start retries too quickly"
                        );
                    } else if now >= p.delay {
                        let _ = self.spawn_at(idx, bus);
                    }
                }
                ProcessState::Starting => {
                    if now - p.laststart > p.config().startsecs {
                        let name = p.name().to_string();
                        let startsecs = p.config().startsecs;
                        self.processes[idx].promote_running(bus);
                        info!(
                            "success: {name} entered RUNNING state, process has stayed up for > than {startsecs} seconds (startsecs)"
                        );
                    }
                }
                ProcessState::Exited => {
                    if Self::wants_restart(p) {
                        let _ = self.spawn_at(idx, bus);
                    }
                }
                _ => {}
            }
        }
        self.pump_listeners();
    }

    /// Stop everything, highest priority first. Backing-off members are
    /// fast-forwarded to FATAL so a drain cannot hang on retry timers.
    pub fn stop_all(&mut self, bus: &mut EventBus) {
        for p in self.processes.iter_mut().rev() {
            match p.state() {
                ProcessState::Running | ProcessState::Starting => {
                    p.stop(bus);
                }
                ProcessState::Backoff => {
                    p.fail_to_fatal(bus);
                }
                _ => {}
            }
        }
    }

    /// Stopping processes whose grace period has elapsed.
    pub fn undead(&self) -> Vec<String> {
        let now = self.sys.now();
        self.processes
            .iter()
            .filter(|p| p.state() == ProcessState::Stopping && p.delay - now <= 0.0)
            .map(|p| p.name().to_string())
            .collect()
    }

    /// SIGKILL every undead member.
    pub fn kill_undead(&mut self, bus: &mut EventBus) {
        for name in self.undead() {
            if let Some(p) = self.by_name_mut(&name) {
                error!("killing '{}' ({}) with SIGKILL", name, p.pid);
                p.kill(libc::SIGKILL, bus);
            }
        }
    }

    /// Names of members with a pending timed transition.
    pub fn delayed(&self) -> Vec<String> {
        self.processes
            .iter()
            .filter(|p| p.delay != 0.0)
            .map(|p| p.name().to_string())
            .collect()
    }

    pub fn all_stopped(&self) -> bool {
        self.processes.iter().all(|p| p.state().is_stopped_state())
    }

    /// Deliver buffered events to READY listeners and fold FAIL results
    /// back into the buffer.
    fn pump_listeners(&mut self) {
        if !matches!(self.config.kind, GroupKind::EventListener { .. }) {
            return;
        }
        let Some(buffer) = self.event_buffer.as_ref().map(Rc::clone) else {
            return;
        };
        for p in &mut self.processes {
            for (result, event) in p.take_listener_results() {
                match result {
                    ListenerResult::Ok => debug!("listener processed an event"),
                    ListenerResult::Fail => {
                        if let Some(event) = event {
                            warn!("listener returned FAIL, rebuffering event for redelivery");
                            buffer.borrow_mut().push_front(event);
                        }
                    }
                }
            }
        }
        loop {
            if buffer.borrow().is_empty() {
                return;
            }
            let Some(idx) = self.processes.iter().position(|p| {
                p.state() == ProcessState::Running
                    && p.listener_state() == Some(ListenerState::Ready)
            }) else {
                return;
            };
            let Some(event) = buffer.borrow_mut().pop_front() else {
                return;
            };
            self.pool_serial += 1;
            let payload = event.payload();
            let header = format!(
                "ver:3.0 server:{} serial:{} pool:{} poolserial:{} eventname:{} len:{}\n",
                self.identifier,
                self.pool_serial,
                self.config.name,
                self.pool_serial,
                event.kind_name(),
                payload.len()
            );
            let mut frame = header.into_bytes();
            frame.extend_from_slice(&payload);
            if let Err(e) = self.processes[idx].send_listener_event(&frame, event.clone()) {
                warn!("could not hand event to listener: {e}");
                buffer.borrow_mut().push_front(event);
                return;
            }
        }
    }

    pub fn reopen_logs(&mut self) {
        for p in &mut self.processes {
            p.reopen_logs();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use crate::sys::{ExitStatus, Fork};
    use crate::testing::{test_config, FakeSystem};

    fn group_with(
        sys: &Rc<FakeSystem>,
        kind: GroupKind,
        configs: Vec<crate::config::ProcessConfig>,
    ) -> ProcessGroup {
        let mut gc = GroupConfig::new("grp", 999, configs.into_iter().map(Rc::new).collect());
        gc.kind = kind;
        let sys_dyn: Rc<dyn System> = Rc::clone(sys) as Rc<dyn System>;
        ProcessGroup::new(gc, sys_dyn, "supervisor", false)
    }

    fn plain_group(
        sys: &Rc<FakeSystem>,
        configs: Vec<crate::config::ProcessConfig>,
    ) -> ProcessGroup {
        group_with(sys, GroupKind::Process, configs)
    }

    #[test]
    fn start_order_follows_ascending_priority() {
        let sys = Rc::new(FakeSystem::new());
        sys.add_executable("late");
        sys.add_executable("early");
        let mut late = test_config("late");
        late.priority = 10;
        let mut early = test_config("early");
        early.priority = 1;
        let mut bus = EventBus::new();
        sys.push_fork(Ok(Fork::Parent(11)));
        sys.push_fork(Ok(Fork::Parent(22)));
        // Config order deliberately reversed; the group sorts by priority.
        let mut group = plain_group(&sys, vec![late, early]);
        group.start_necessary(&mut bus);
        assert_eq!(group.by_name_mut("early").unwrap().pid, 11);
        assert_eq!(group.by_name_mut("late").unwrap().pid, 22);
    }

    #[test]
    fn stop_order_is_the_reverse_of_start_order() {
        let sys = Rc::new(FakeSystem::new());
        sys.set_now(5.0);
        sys.add_executable("a");
        sys.add_executable("b");
        let mut a = test_config("a");
        a.priority = 1;
        let mut b = test_config("b");
        b.priority = 2;
        let mut bus = EventBus::new();
        sys.push_fork(Ok(Fork::Parent(11)));
        sys.push_fork(Ok(Fork::Parent(22)));
        let mut group = plain_group(&sys, vec![a, b]);
        group.start_necessary(&mut bus);
        group.stop_all(&mut bus);
        assert_eq!(
            sys.kills(),
            vec![(-22, libc::SIGTERM), (-11, libc::SIGTERM)]
        );
    }

    #[test]
    fn autostart_false_stays_stopped() {
        let sys = Rc::new(FakeSystem::new());
        sys.add_executable("manual");
        let mut config = test_config("manual");
        config.autostart = false;
        let mut bus = EventBus::new();
        let mut group = plain_group(&sys, vec![config]);
        group.start_necessary(&mut bus);
        assert_eq!(group.processes()[0].state(), ProcessState::Stopped);
    }

    #[test]
    fn backoff_exceeding_retries_becomes_fatal() {
        let sys = Rc::new(FakeSystem::new());
        let mut config = test_config("missing");
        config.startretries = 2;
        let mut bus = EventBus::new();
        let mut group = plain_group(&sys, vec![config]);
        // Each pass fails the spawn and bumps backoff; the command does not
        // resolve, so every attempt is a spawn error.
        for round in 0..4 {
            sys.set_now(10.0 + round as f64 * 100.0);
            group.transition(&mut bus);
            group.start_necessary(&mut bus);
        }
        sys.advance(100.0);
        group.transition(&mut bus);
        let p = &group.processes()[0];
        assert_eq!(p.state(), ProcessState::Fatal);
        assert_eq!(p.delay, 0.0);
        assert_eq!(p.backoff, 0);
    }

    #[test]
    fn starting_process_promotes_to_running_after_startsecs() {
        let sys = Rc::new(FakeSystem::new());
        sys.add_executable("svc");
        sys.set_now(100.0);
        sys.push_fork(Ok(Fork::Parent(42)));
        let mut bus = EventBus::new();
        let mut group = plain_group(&sys, vec![test_config("svc")]);
        group.start_necessary(&mut bus);
        assert_eq!(group.processes()[0].state(), ProcessState::Starting);
        sys.set_now(101.5);
        group.transition(&mut bus);
        let p = &group.processes()[0];
        assert_eq!(p.state(), ProcessState::Running);
        assert_eq!(p.delay, 0.0);
        assert_eq!(p.backoff, 0);
    }

    #[test]
    fn exited_process_respawns_per_policy() {
        let sys = Rc::new(FakeSystem::new());
        sys.add_executable("svc");
        sys.set_now(100.0);
        sys.push_fork(Ok(Fork::Parent(42)));
        let mut bus = EventBus::new();
        let mut config = test_config("svc");
        config.autorestart = Autorestart::Unexpected;
        config.exitcodes = vec![0];
        let mut group = plain_group(&sys, vec![config]);
        group.start_necessary(&mut bus);
        sys.set_now(110.0);
        group
            .by_pid_mut(42)
            .unwrap()
            .finish(42, ExitStatus::Exited(0), &mut bus);
        // Expected exit with autorestart=unexpected: stays EXITED.
        group.transition(&mut bus);
        assert_eq!(group.processes()[0].state(), ProcessState::Exited);

        // A bad exit code is classified as a backoff and retried once the
        // backoff delay passes.
        sys.push_fork(Ok(Fork::Parent(43)));
        group.spawn_process("svc", &mut bus).unwrap();
        sys.set_now(130.0);
        group
            .by_pid_mut(43)
            .unwrap()
            .finish(43, ExitStatus::Exited(9), &mut bus);
        assert_eq!(group.processes()[0].state(), ProcessState::Backoff);
        sys.set_now(132.0);
        sys.push_fork(Ok(Fork::Parent(44)));
        group.transition(&mut bus);
        assert_eq!(group.processes()[0].pid, 44);
    }

    #[test]
    fn stop_all_fast_forwards_backoff_to_fatal() {
        let sys = Rc::new(FakeSystem::new());
        sys.set_now(5.0);
        let mut bus = EventBus::new();
        let mut group = plain_group(&sys, vec![test_config("missing")]);
        group.start_necessary(&mut bus);
        assert_eq!(group.processes()[0].state(), ProcessState::Backoff);
        group.stop_all(&mut bus);
        let p = &group.processes()[0];
        assert_eq!(p.state(), ProcessState::Fatal);
        assert_eq!(p.delay, 0.0);
        assert_eq!(p.backoff, 0);
    }

    #[test]
    fn undead_are_killed_with_sigkill() {
        let sys = Rc::new(FakeSystem::new());
        sys.add_executable("stubborn");
        sys.set_now(100.0);
        sys.push_fork(Ok(Fork::Parent(42)));
        let mut bus = EventBus::new();
        let mut config = test_config("stubborn");
        config.stopwaitsecs = 2.0;
        let mut group = plain_group(&sys, vec![config]);
        group.start_necessary(&mut bus);
        group.stop_all(&mut bus);
        assert!(group.undead().is_empty());
        sys.set_now(103.0);
        assert_eq!(group.undead(), vec!["stubborn".to_string()]);
        group.kill_undead(&mut bus);
        assert_eq!(
            sys.kills(),
            vec![(-42, libc::SIGTERM), (-42, libc::SIGKILL)]
        );
    }

    #[test]
    fn listener_pool_delivers_buffered_events_to_ready_listener() {
        let sys = Rc::new(FakeSystem::new());
        sys.add_executable("listener");
        sys.set_now(100.0);
        sys.push_fork(Ok(Fork::Parent(42)));
        let mut bus = EventBus::new();
        let kind = GroupKind::EventListener {
            events: vec![EventType::SupervisorStateChange],
            buffer_size: 10,
        };
        let mut group = group_with(&sys, kind, vec![test_config("listener")]);
        group.start_necessary(&mut bus);
        sys.set_now(102.0);
        group.transition(&mut bus);
        assert_eq!(group.processes()[0].state(), ProcessState::Running);

        group
            .event_buffer()
            .unwrap()
            .borrow_mut()
            .push_back(Event::SupervisorRunning);
        // Not READY yet: nothing is sent.
        group.transition(&mut bus);
        assert_eq!(group.event_buffer().unwrap().borrow().len(), 1);

        let stdout_fd = group.processes()[0].poll_fds().0[0];
        sys.push_read(stdout_fd, b"READY\n");
        group.processes_mut()[0].handle_readable(stdout_fd, &mut bus);
        group.transition(&mut bus);
        assert!(group.event_buffer().unwrap().borrow().is_empty());
        let sent = group.processes()[0].poll_fds().1;
        assert_eq!(sent.len(), 1);

        // Flush the queued frame and check the header shape.
        let fd = sent[0];
        group.processes_mut()[0].handle_writable(fd);
        let frame = String::from_utf8(sys.written(fd)).unwrap();
        assert!(frame.starts_with("ver:3.0 server:supervisor serial:1 pool:grp poolserial:1 "));
        assert!(frame.contains("eventname:SUPERVISOR_STATE_CHANGE_RUNNING len:0"));
    }

    #[test]
    fn listener_fail_result_rebuffers_the_event() {
        let sys = Rc::new(FakeSystem::new());
        sys.add_executable("listener");
        sys.set_now(100.0);
        sys.push_fork(Ok(Fork::Parent(42)));
        let mut bus = EventBus::new();
        let kind = GroupKind::EventListener {
            events: vec![EventType::SupervisorStateChange],
            buffer_size: 10,
        };
        let mut group = group_with(&sys, kind, vec![test_config("listener")]);
        group.start_necessary(&mut bus);
        sys.set_now(102.0);
        let stdout_fd = group.processes()[0].poll_fds().0[0];
        sys.push_read(stdout_fd, b"READY\n");
        group.processes_mut()[0].handle_readable(stdout_fd, &mut bus);
        group
            .event_buffer()
            .unwrap()
            .borrow_mut()
            .push_back(Event::SupervisorRunning);
        group.transition(&mut bus);
        assert!(group.event_buffer().unwrap().borrow().is_empty());

        sys.push_read(stdout_fd, b"RESULT 4\nFAIL");
        group.processes_mut()[0].handle_readable(stdout_fd, &mut bus);
        group.transition(&mut bus);
        // The FAIL pushed it back; no READY listener, so it stays buffered.
        assert_eq!(group.event_buffer().unwrap().borrow().len(), 1);
    }

    #[test]
    fn fcgi_children_share_one_listening_socket() {
        let sys = Rc::new(FakeSystem::new());
        sys.set_now(5.0);
        sys.add_executable("worker");
        let mut bus = EventBus::new();
        let kind = GroupKind::Fcgi {
            socket: SocketConfig::Tcp {
                host: "127.0.0.1".to_string(),
                port: 9000,
            },
        };
        let mut one = test_config("worker");
        one.name = "worker_0".to_string();
        let mut two = test_config("worker");
        two.name = "worker_1".to_string();
        sys.push_fork(Ok(Fork::Parent(11)));
        sys.push_fork(Ok(Fork::Parent(22)));
        let mut group = group_with(&sys, kind, vec![one, two]);
        group.start_necessary(&mut bus);
        // Socket-fed children expose no stdin dispatcher.
        for p in group.processes() {
            assert!(p.poll_fds().1.is_empty());
            assert_eq!(p.state(), ProcessState::Starting);
        }
        group.close_socket(true);
    }

    #[test]
    fn delayed_reports_pending_timers() {
        let sys = Rc::new(FakeSystem::new());
        sys.add_executable("svc");
        sys.set_now(100.0);
        sys.push_fork(Ok(Fork::Parent(42)));
        let mut bus = EventBus::new();
        let mut group = plain_group(&sys, vec![test_config("svc")]);
        assert!(group.delayed().is_empty());
        group.start_necessary(&mut bus);
        assert_eq!(group.delayed(), vec!["svc".to_string()]);
        assert!(!group.all_stopped());
    }
}

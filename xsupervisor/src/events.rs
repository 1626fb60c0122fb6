// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Synchronous in-process publish/subscribe.
//!
//! The bus is an explicit value threaded through construction; there is no
//! global registry. Handlers run in registration order and must not block.
//! A handler failure is logged and swallowed, except for
//! [`HandlerError::Reject`], which asks for the event to be redelivered to
//! that subscriber on a later publish.

use std::collections::VecDeque;

use thiserror::Error;
use tracing::warn;

use crate::process::ProcessState;

/// Child output channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Stdout,
    Stderr,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Stdout => "stdout",
            Channel::Stderr => "stderr",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ProcessState {
        name: String,
        group: String,
        pid: i32,
        from: ProcessState,
        to: ProcessState,
    },
    ProcessCommunication {
        name: String,
        group: String,
        channel: Channel,
        data: Vec<u8>,
    },
    ProcessLog {
        name: String,
        group: String,
        channel: Channel,
        data: Vec<u8>,
    },
    SupervisorRunning,
    SupervisorStopping,
}

impl Event {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Event::ProcessState { .. } => "PROCESS_STATE",
            Event::ProcessCommunication { .. } => "PROCESS_COMMUNICATION",
            Event::ProcessLog { .. } => "PROCESS_LOG",
            Event::SupervisorRunning => "SUPERVISOR_STATE_CHANGE_RUNNING",
            Event::SupervisorStopping => "SUPERVISOR_STATE_CHANGE_STOPPING",
        }
    }

    /// Body serialized to event listeners.
    pub fn payload(&self) -> Vec<u8> {
        match self {
            Event::ProcessState {
                name,
                group,
                pid,
                from,
                to,
            } => format!(
                "processname:{name} groupname:{group} pid:{pid} from_state:{} to_state:{}",
                from.as_str(),
                to.as_str()
            )
            .into_bytes(),
            Event::ProcessCommunication {
                name,
                group,
                channel,
                data,
            }
            | Event::ProcessLog {
                name,
                group,
                channel,
                data,
            } => {
                let mut body =
                    format!("processname:{name} groupname:{group} channel:{channel}\n")
                        .into_bytes();
                body.extend_from_slice(data);
                body
            }
            Event::SupervisorRunning | Event::SupervisorStopping => Vec::new(),
        }
    }
}

/// Subscription token. `SupervisorStateChange` is the parent of the two
/// concrete supervisor events; `Event` matches everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Event,
    ProcessState,
    ProcessCommunication,
    ProcessLog,
    SupervisorStateChange,
    SupervisorRunning,
    SupervisorStopping,
}

impl EventType {
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            EventType::Event => true,
            EventType::ProcessState => matches!(event, Event::ProcessState { .. }),
            EventType::ProcessCommunication => {
                matches!(event, Event::ProcessCommunication { .. })
            }
            EventType::ProcessLog => matches!(event, Event::ProcessLog { .. }),
            EventType::SupervisorStateChange => {
                matches!(event, Event::SupervisorRunning | Event::SupervisorStopping)
            }
            EventType::SupervisorRunning => matches!(event, Event::SupervisorRunning),
            EventType::SupervisorStopping => matches!(event, Event::SupervisorStopping),
        }
    }

    /// Parse a config-file event type name.
    pub fn parse(name: &str) -> Option<EventType> {
        match name.trim().to_ascii_uppercase().as_str() {
            "EVENT" => Some(EventType::Event),
            "PROCESS_STATE" => Some(EventType::ProcessState),
            "PROCESS_COMMUNICATION" => Some(EventType::ProcessCommunication),
            "PROCESS_LOG" => Some(EventType::ProcessLog),
            "SUPERVISOR_STATE_CHANGE" => Some(EventType::SupervisorStateChange),
            "SUPERVISOR_STATE_CHANGE_RUNNING" => Some(EventType::SupervisorRunning),
            "SUPERVISOR_STATE_CHANGE_STOPPING" => Some(EventType::SupervisorStopping),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    /// The subscriber wants the event again later.
    #[error("event rejected for redelivery")]
    Reject,
    #[error("{0}")]
    Failed(String),
}

pub type Handler = Box<dyn FnMut(&Event) -> Result<(), HandlerError>>;

/// Handle returned by [`EventBus::subscribe`], usable to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    token: EventType,
    handler: Handler,
    retries: VecDeque<Event>,
}

/// Delivery order follows publish order per subscriber, including across
/// rejections: a rejected event blocks that subscriber's queue so later
/// events cannot overtake it.
#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<Subscriber>,
    serial: u64,
    next_id: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, token: EventType, handler: Handler) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.subscribers.push(Subscriber {
            id,
            token,
            handler,
            retries: VecDeque::new(),
        });
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        self.subscribers.retain(|s| s.id != id);
    }

    /// Count of events published so far.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn publish(&mut self, event: Event) {
        self.serial += 1;
        for sub in &mut self.subscribers {
            let mut blocked = false;
            while let Some(pending) = sub.retries.front() {
                match (sub.handler)(pending) {
                    Ok(()) => {
                        sub.retries.pop_front();
                    }
                    Err(HandlerError::Reject) => {
                        blocked = true;
                        break;
                    }
                    Err(HandlerError::Failed(msg)) => {
                        warn!("event handler failed during redelivery: {msg}");
                        sub.retries.pop_front();
                    }
                }
            }
            if !sub.token.matches(&event) {
                continue;
            }
            if blocked {
                sub.retries.push_back(event.clone());
                continue;
            }
            match (sub.handler)(&event) {
                Ok(()) => {}
                Err(HandlerError::Reject) => sub.retries.push_back(event.clone()),
                Err(HandlerError::Failed(msg)) => {
                    warn!("event handler failed for {}: {msg}", event.kind_name());
                }
            }
        }
    }
}

/// Bounded FIFO used by event listener pools. Overflow drops the oldest
/// entry and counts it.
#[derive(Debug, Default)]
pub struct EventBuffer {
    max: usize,
    queue: VecDeque<Event>,
    dropped: u64,
}

impl EventBuffer {
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            queue: VecDeque::new(),
            dropped: 0,
        }
    }

    pub fn push_back(&mut self, event: Event) {
        if self.queue.len() >= self.max {
            self.queue.pop_front();
            self.dropped += 1;
            warn!("event buffer overflowed, discarding oldest event");
        }
        self.queue.push_back(event);
    }

    /// Requeue at the head, for redelivery after a listener FAIL.
    pub fn push_front(&mut self, event: Event) {
        if self.queue.len() >= self.max {
            self.queue.pop_back();
            self.dropped += 1;
            warn!("event buffer overflowed, discarding newest event");
        }
        self.queue.push_front(event);
    }

    pub fn pop_front(&mut self) -> Option<Event> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A long-running Unix process supervisor engine.
//!
//! The crate owns the hard parts of supervision: per-process state machines
//! derived from a handful of runtime attributes, group-level scheduling of
//! starts, stops and retries, the fork/exec pipeline with file-descriptor
//! hygiene, a single-threaded select/signal loop, and the output-capture
//! protocol that lets children emit structured communication events through
//! their stdout or stderr.
//!
//! Configuration parsing, the CLI and daemonization live in the
//! `xsupervisord` binary crate; remote transports are expected to call into
//! [`control`] from the same process.

#![cfg(unix)]

pub mod config;
pub mod control;
pub mod dispatcher;
pub mod events;
pub mod group;
pub mod logger;
pub mod process;
pub mod signals;
pub mod supervisor;
pub mod sys;

#[cfg(test)]
pub(crate) mod testing;

pub use control::{Fault, ProcessInfo};
pub use events::{Event, EventBus, EventType};
pub use process::ProcessState;
pub use supervisor::{Mood, Supervisor};

// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! xsupervisord: run a set of applications as daemons.
//!
//! The outer loop realizes options, builds a fresh supervisor and runs it
//! until the mood says shutdown (exit 0) or restart (loop again with a
//! newly read configuration, as after SIGHUP). Usage and configuration
//! errors exit 2.

mod cli;
mod daemon;
mod ini;
mod logging;
mod options;

use std::rc::Rc;
use std::sync::Arc;

use clap::error::ErrorKind;
use clap::Parser;
use tracing::info;

use xsupervisor::signals::SignalMailbox;
use xsupervisor::supervisor::{Mood, Supervisor};
use xsupervisor::sys::RealSystem;

fn main() {
    std::process::exit(run());
}

fn usage_error(message: impl std::fmt::Display) -> i32 {
    let progname = std::env::args()
        .next()
        .unwrap_or_else(|| "xsupervisord".to_string());
    eprintln!("Error: {message}");
    eprintln!("For help, use {progname} -h");
    2
}

fn run() -> i32 {
    let cli = match cli::Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            print!("{e}");
            return 0;
        }
        Err(e) => return usage_error(e),
    };

    let mut first = true;
    let mut mailbox: Option<Rc<SignalMailbox>> = None;
    let mut daemon_sink = None;
    let mut held_messages: Vec<String> = Vec::new();

    loop {
        let options = match options::ServerOptions::realize(&cli) {
            Ok(options) => options,
            Err(e) => return usage_error(e),
        };

        if first {
            match daemon::set_rlimits(options.minfds, options.minprocs) {
                Ok(messages) => held_messages.extend(messages),
                Err(e) => return usage_error(e),
            }
            if let Some(user) = &options.user {
                if let Some(message) = daemon::set_uid(user) {
                    held_messages.push(message);
                }
            }
            // Safety: no preconditions.
            unsafe {
                libc::umask(options.umask as libc::mode_t);
            }
            if !options.nodaemon {
                if let Err(e) = daemon::daemonize(options.directory.as_deref()) {
                    eprintln!("{e}");
                    return 2;
                }
            }
            // Logging and the pidfile come after daemonizing so the fds and
            // the recorded pid are the daemon's own.
            match logging::init(&options) {
                Ok(sink) => daemon_sink = Some(sink),
                Err(e) => {
                    eprintln!("{e}");
                    return 2;
                }
            }
            if let Err(e) = daemon::write_pidfile(&options.pidfile) {
                eprintln!("{e}");
                return 2;
            }
            match SignalMailbox::install() {
                Ok(installed) => mailbox = Some(Rc::new(installed)),
                Err(e) => {
                    eprintln!("could not install signal handlers: {e}");
                    return 2;
                }
            }
            for message in held_messages.drain(..) {
                info!("{message}");
            }
        }

        if !options.nocleanup {
            daemon::clear_autochildlogdir(&options.childlogdir, &options.identifier);
        }

        let sys = Rc::new(RealSystem::new(options.minfds as i32));
        let mut supervisor = Supervisor::new(
            sys,
            Rc::clone(mailbox.as_ref().expect("mailbox installed on first pass")),
            &options.identifier,
            options.strip_ansi,
        );
        if let Some(sink) = &daemon_sink {
            supervisor.set_daemon_sink(Arc::clone(sink));
        }
        supervisor.load_groups(options.groups.clone());

        if let Err(e) = supervisor.run() {
            eprintln!("{e}");
            daemon::remove_pidfile(&options.pidfile);
            return 2;
        }

        if supervisor.mood() == Mood::Restart {
            info!("restarting with a freshly read configuration");
            first = false;
            continue;
        }

        daemon::remove_pidfile(&options.pidfile);
        return 0;
    }
}

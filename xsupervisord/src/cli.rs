// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Command line surface of the daemon. Values given here override the
//! config file.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "xsupervisord",
    about = "Run a set of applications as daemons.",
    disable_version_flag = true
)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short = 'c', long = "configuration")]
    pub configuration: Option<PathBuf>,

    /// Run in the foreground.
    #[arg(short = 'n', long = "nodaemon")]
    pub nodaemon: bool,

    /// Run as this user (name or numeric uid).
    #[arg(short = 'u', long = "user")]
    pub user: Option<String>,

    /// File-creation mask for the daemon and its children, octal.
    #[arg(short = 'm', long = "umask")]
    pub umask: Option<String>,

    /// Directory to chdir to when daemonized.
    #[arg(short = 'd', long = "directory")]
    pub directory: Option<PathBuf>,

    /// Supervisor log file.
    #[arg(short = 'l', long = "logfile")]
    pub logfile: Option<PathBuf>,

    /// Max size of the supervisor log before rotation, e.g. 50MB.
    #[arg(short = 'y', long = "logfile_maxbytes")]
    pub logfile_maxbytes: Option<String>,

    /// Number of rotated supervisor log backups to keep.
    #[arg(short = 'z', long = "logfile_backups")]
    pub logfile_backups: Option<u32>,

    /// Log level: trace, debug, info, warn, error, critical.
    #[arg(short = 'e', long = "loglevel")]
    pub loglevel: Option<String>,

    /// Pidfile path.
    #[arg(short = 'j', long = "pidfile")]
    pub pidfile: Option<PathBuf>,

    /// Identifier for this supervisor instance.
    #[arg(short = 'i', long = "identifier")]
    pub identifier: Option<String>,

    /// Directory for automatically named child logs.
    #[arg(short = 'q', long = "childlogdir")]
    pub childlogdir: Option<PathBuf>,

    /// Skip orphaned child log cleanup at startup.
    #[arg(short = 'k', long = "nocleanup")]
    pub nocleanup: bool,

    /// Minimum RLIMIT_NOFILE required to start.
    #[arg(short = 'a', long = "minfds")]
    pub minfds: Option<u64>,

    /// Minimum RLIMIT_NPROC required to start.
    #[arg(long = "minprocs")]
    pub minprocs: Option<u64>,

    /// Strip ANSI escape sequences from child output.
    #[arg(short = 't', long = "strip_ansi")]
    pub strip_ansi: bool,
}

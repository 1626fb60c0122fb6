// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Server options: the merge of command line and INI configuration into the
//! engine's group configs.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::rc::Rc;

use xsupervisor::config::{
    Autorestart, GroupConfig, GroupKind, ProcessConfig, SocketConfig,
};
use xsupervisor::events::EventType;

use crate::cli::Cli;
use crate::ini::{self, ConfigError, Ini};

pub const DEFAULT_CONFIG: &str = "/etc/supervisord.conf";

/// Everything the daemon needs to run, fully validated.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerOptions {
    pub configfile: PathBuf,
    pub logfile: PathBuf,
    pub logfile_maxbytes: u64,
    pub logfile_backups: u32,
    pub loglevel: String,
    pub pidfile: PathBuf,
    pub nodaemon: bool,
    pub minfds: u64,
    pub minprocs: u64,
    pub umask: u32,
    pub user: Option<String>,
    pub directory: Option<PathBuf>,
    pub identifier: String,
    pub childlogdir: PathBuf,
    pub nocleanup: bool,
    pub strip_ansi: bool,
    pub groups: Vec<GroupConfig>,
}

/// Split a command line into argv the way a shell would, honoring single
/// and double quotes.
pub fn tokenize_command(command: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut token = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    for c in command.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                } else {
                    token.push(c);
                }
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_token = true;
                }
                c if c.is_whitespace() => {
                    if in_token {
                        out.push(std::mem::take(&mut token));
                        in_token = false;
                    }
                }
                c => {
                    token.push(c);
                    in_token = true;
                }
            },
        }
    }
    if in_token {
        out.push(token);
    }
    out
}

fn name_to_uid(value: &str) -> Result<u32, ConfigError> {
    if let Ok(uid) = value.trim().parse::<u32>() {
        return Ok(uid);
    }
    match nix::unistd::User::from_name(value.trim()) {
        Ok(Some(user)) => Ok(user.uid.as_raw()),
        _ => Err(ConfigError::NoSuchUser(value.to_string())),
    }
}

fn autorestart_value(section: &str, value: &str) -> Result<Autorestart, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "false" | "never" => Ok(Autorestart::Never),
        "unexpected" => Ok(Autorestart::Unexpected),
        "true" | "always" => Ok(Autorestart::Always),
        _ => Err(ConfigError::BadValue {
            section: section.to_string(),
            key: "autorestart".to_string(),
            message: format!("{value} is not one of false, unexpected, true"),
        }),
    }
}

fn socket_value(section: &str, value: &str) -> Result<SocketConfig, ConfigError> {
    let bad = |message: String| ConfigError::BadValue {
        section: section.to_string(),
        key: "socket".to_string(),
        message,
    };
    if let Some(path) = value.strip_prefix("unix://") {
        if path.is_empty() {
            return Err(bad("unix socket needs a path".to_string()));
        }
        return Ok(SocketConfig::Unix {
            path: PathBuf::from(path),
        });
    }
    if let Some(addr) = value.strip_prefix("tcp://") {
        let Some((host, port)) = addr.rsplit_once(':') else {
            return Err(bad(format!("{value} is missing a port")));
        };
        let port = port
            .parse()
            .map_err(|_| bad(format!("{port} is not a port number")))?;
        return Ok(SocketConfig::Tcp {
            host: host.to_string(),
            port,
        });
    }
    Err(bad(format!("{value} is not unix://path or tcp://host:port")))
}

struct SectionReader<'a> {
    ini: &'a Ini,
    section: String,
}

impl<'a> SectionReader<'a> {
    fn get(&self, key: &str) -> Option<&'a str> {
        self.ini.get(&self.section, key)
    }

    fn boolean(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key) {
            Some(v) => ini::boolean(&self.section, key, v),
            None => Ok(default),
        }
    }

    fn integer<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            Some(v) => ini::integer(&self.section, key, v),
            None => Ok(default),
        }
    }

    fn float(&self, key: &str, default: f64) -> Result<f64, ConfigError> {
        match self.get(key) {
            Some(v) => ini::float(&self.section, key, v),
            None => Ok(default),
        }
    }

    fn byte_size(&self, key: &str, default: u64) -> Result<u64, ConfigError> {
        match self.get(key) {
            Some(v) => ini::byte_size(&self.section, key, v),
            None => Ok(default),
        }
    }
}

/// Per-instance template variables.
fn template_vars(program: &str, group: &str, num: u32) -> BTreeMap<&'static str, String> {
    let mut vars = BTreeMap::new();
    vars.insert("program_name", program.to_string());
    vars.insert("group_name", group.to_string());
    vars.insert("process_num", num.to_string());
    vars
}

struct ProgramContext<'a> {
    childlogdir: &'a PathBuf,
    identifier: &'a str,
}

/// Expand one program-schema section into its numprocs process configs.
fn process_configs(
    ini: &Ini,
    section_name: &str,
    program: &str,
    group: &str,
    ctx: &ProgramContext<'_>,
) -> Result<Vec<Rc<ProcessConfig>>, ConfigError> {
    let reader = SectionReader {
        ini,
        section: section_name.to_string(),
    };
    let command = reader.get("command").ok_or_else(|| {
        ConfigError::MissingKey(section_name.to_string(), "command".to_string())
    })?;

    let numprocs: u32 = reader.integer("numprocs", 1)?;
    let process_name = reader.get("process_name").unwrap_or("%(program_name)s");
    if numprocs > 1 && !process_name.contains("%(process_num)") {
        return Err(ConfigError::BadTemplate(
            process_name.to_string(),
            "%(process_num) must be present within process_name when numprocs > 1".to_string(),
        ));
    }

    let mut configs = Vec::with_capacity(numprocs as usize);
    for num in 0..numprocs {
        let vars = template_vars(program, group, num);
        let name = ini::expand_template(process_name, &vars)?;
        let argv: Vec<String> = tokenize_command(command)
            .into_iter()
            .map(|token| ini::expand_template(&token, &vars))
            .collect::<Result<_, _>>()?;
        if argv.is_empty() {
            return Err(ConfigError::MissingKey(
                section_name.to_string(),
                "command".to_string(),
            ));
        }
        let mut config = ProcessConfig::new(&name, argv).map_err(|e| ConfigError::BadValue {
            section: section_name.to_string(),
            key: "command".to_string(),
            message: e.to_string(),
        })?;

        config.priority = reader.integer("priority", 999)?;
        config.autostart = reader.boolean("autostart", true)?;
        if let Some(v) = reader.get("autorestart") {
            config.autorestart = autorestart_value(section_name, v)?;
        }
        config.startsecs = reader.float("startsecs", 1.0)?;
        config.startretries = reader.integer("startretries", 3)?;
        if let Some(v) = reader.get("exitcodes") {
            config.exitcodes = ini::list_of_ints(section_name, "exitcodes", v)?;
        }
        if let Some(v) = reader.get("stopsignal") {
            config.stopsignal = ini::signal_number(section_name, "stopsignal", v)?;
        }
        config.stopwaitsecs = reader.float("stopwaitsecs", 10.0)?;
        if let Some(v) = reader.get("user") {
            config.uid = Some(name_to_uid(v)?);
        }
        if let Some(v) = reader.get("directory") {
            config.directory = Some(PathBuf::from(v));
        }
        if let Some(v) = reader.get("umask") {
            config.umask = Some(ini::octal(section_name, "umask", v)?);
        }
        config.redirect_stderr = reader.boolean("redirect_stderr", false)?;
        if let Some(v) = reader.get("environment") {
            config.environment = ini::environment_list(section_name, "environment", v)?;
        }
        config.serverurl = reader.get("serverurl").map(|s| s.to_string());

        for (channel, prefix) in [("stdout", "stdout_"), ("stderr", "stderr_")] {
            let log = match channel {
                "stdout" => &mut config.stdout,
                _ => &mut config.stderr,
            };
            let logfile_key = format!("{prefix}logfile");
            log.logfile = match reader.get(&logfile_key) {
                Some(v) if v.eq_ignore_ascii_case("none") || v.eq_ignore_ascii_case("off") => None,
                Some(v) if !v.eq_ignore_ascii_case("auto") => Some(PathBuf::from(v)),
                _ => Some(ctx.childlogdir.join(format!(
                    "{group}-{name}---{}-{channel}.log",
                    ctx.identifier
                ))),
            };
            log.maxbytes =
                reader.byte_size(&format!("{prefix}logfile_maxbytes"), 50 * 1024 * 1024)?;
            log.backups = reader.integer(&format!("{prefix}logfile_backups"), 10)?;
            log.capture_maxbytes =
                reader.byte_size(&format!("{prefix}capture_maxbytes"), 0)?;
            log.events_enabled =
                reader.boolean(&format!("{prefix}events_enabled"), false)?;
        }
        if config.redirect_stderr {
            config.stderr.logfile = None;
        }

        configs.push(Rc::new(config));
    }
    Ok(configs)
}

impl ServerOptions {
    /// Resolve options from the command line and the config file it points
    /// at. All config errors are fatal.
    pub fn realize(cli: &Cli) -> anyhow::Result<Self> {
        let configfile = match &cli.configuration {
            Some(path) => path.clone(),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG);
                anyhow::ensure!(
                    default.exists(),
                    "No config file found at default path \"{DEFAULT_CONFIG}\"; create this \
                     file or use the -c option to specify a config file at a different path"
                );
                default
            }
        };
        let text = std::fs::read_to_string(&configfile).map_err(|e| {
            ConfigError::Unreadable(configfile.display().to_string(), e.to_string())
        })?;
        let ini = Ini::parse(&text)?;
        Ok(Self::from_ini(&ini, cli, configfile)?)
    }

    pub fn from_ini(ini: &Ini, cli: &Cli, configfile: PathBuf) -> Result<Self, ConfigError> {
        if !ini.has_section("supervisord") {
            return Err(ConfigError::MissingSection("supervisord".to_string()));
        }
        let reader = SectionReader {
            ini,
            section: "supervisord".to_string(),
        };

        let logfile = cli
            .logfile
            .clone()
            .or_else(|| reader.get("logfile").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("supervisord.log"));
        let logfile_maxbytes = match &cli.logfile_maxbytes {
            Some(v) => ini::byte_size("supervisord", "logfile_maxbytes", v)?,
            None => reader.byte_size("logfile_maxbytes", 50 * 1024 * 1024)?,
        };
        let logfile_backups = match cli.logfile_backups {
            Some(v) => v,
            None => reader.integer("logfile_backups", 10)?,
        };
        let loglevel = cli
            .loglevel
            .clone()
            .or_else(|| reader.get("loglevel").map(|s| s.to_string()))
            .unwrap_or_else(|| "info".to_string());
        match loglevel.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" | "critical" => {}
            other => {
                return Err(ConfigError::BadValue {
                    section: "supervisord".to_string(),
                    key: "loglevel".to_string(),
                    message: format!("{other} is not a log level"),
                })
            }
        }
        let pidfile = cli
            .pidfile
            .clone()
            .or_else(|| reader.get("pidfile").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("supervisord.pid"));
        let nodaemon = cli.nodaemon || reader.boolean("nodaemon", false)?;
        let minfds = match cli.minfds {
            Some(v) => v,
            None => reader.integer("minfds", 1024)?,
        };
        let minprocs = match cli.minprocs {
            Some(v) => v,
            None => reader.integer("minprocs", 200)?,
        };
        let umask = match &cli.umask {
            Some(v) => ini::octal("supervisord", "umask", v)?,
            None => match reader.get("umask") {
                Some(v) => ini::octal("supervisord", "umask", v)?,
                None => 0o022,
            },
        };
        let user = cli
            .user
            .clone()
            .or_else(|| reader.get("user").map(|s| s.to_string()));
        let directory = cli
            .directory
            .clone()
            .or_else(|| reader.get("directory").map(PathBuf::from));
        if let Some(dir) = &directory {
            if !dir.is_dir() {
                return Err(ConfigError::BadValue {
                    section: "supervisord".to_string(),
                    key: "directory".to_string(),
                    message: format!("{} is not an existing directory", dir.display()),
                });
            }
        }
        let identifier = cli
            .identifier
            .clone()
            .or_else(|| reader.get("identifier").map(|s| s.to_string()))
            .unwrap_or_else(|| "supervisor".to_string());
        let childlogdir = cli
            .childlogdir
            .clone()
            .or_else(|| reader.get("childlogdir").map(PathBuf::from))
            .unwrap_or_else(std::env::temp_dir);
        if !childlogdir.is_dir() {
            return Err(ConfigError::BadValue {
                section: "supervisord".to_string(),
                key: "childlogdir".to_string(),
                message: format!("{} is not an existing directory", childlogdir.display()),
            });
        }
        let nocleanup = cli.nocleanup || reader.boolean("nocleanup", false)?;
        let strip_ansi = cli.strip_ansi || reader.boolean("strip_ansi", false)?;

        let ctx = ProgramContext {
            childlogdir: &childlogdir,
            identifier: &identifier,
        };
        let groups = group_configs(ini, &ctx)?;

        Ok(Self {
            configfile,
            logfile,
            logfile_maxbytes,
            logfile_backups,
            loglevel,
            pidfile,
            nodaemon,
            minfds,
            minprocs,
            umask,
            user,
            directory,
            identifier,
            childlogdir,
            nocleanup,
            strip_ansi,
            groups,
        })
    }
}

/// Assemble group configs from program, group, eventlistener and
/// fcgi-program sections.
fn group_configs(ini: &Ini, ctx: &ProgramContext<'_>) -> Result<Vec<GroupConfig>, ConfigError> {
    // Membership of heterogeneous [group:x] sections, program -> group.
    let mut membership: BTreeMap<String, String> = BTreeMap::new();
    let mut groups: Vec<GroupConfig> = Vec::new();

    for section in ini.section_names() {
        let Some(group_name) = section.strip_prefix("group:") else {
            continue;
        };
        let programs = ini
            .get(section, "programs")
            .ok_or_else(|| {
                ConfigError::MissingKey(section.to_string(), "programs".to_string())
            })?
            .to_string();
        let priority = match ini.get(section, "priority") {
            Some(v) => ini::integer(section, "priority", v)?,
            None => 999,
        };
        let mut members = Vec::new();
        for program in programs.split(',') {
            let program = program.trim().to_string();
            if !ini.has_section(&format!("program:{program}")) {
                return Err(ConfigError::UnknownProgram(
                    group_name.to_string(),
                    program,
                ));
            }
            if membership
                .insert(program.clone(), group_name.to_string())
                .is_some()
            {
                return Err(ConfigError::DuplicateName(program));
            }
            members.extend(process_configs(
                ini,
                &format!("program:{program}"),
                &program,
                group_name,
                ctx,
            )?);
        }
        groups.push(GroupConfig {
            name: group_name.to_string(),
            priority,
            kind: GroupKind::Process,
            programs: members,
        });
    }

    for section in ini.section_names() {
        if let Some(program) = section.strip_prefix("program:") {
            if membership.contains_key(program) {
                continue;
            }
            let configs = process_configs(ini, section, program, program, ctx)?;
            let priority = configs.first().map(|c| c.priority).unwrap_or(999);
            groups.push(GroupConfig {
                name: program.to_string(),
                priority,
                kind: GroupKind::Process,
                programs: configs,
            });
        } else if let Some(listener) = section.strip_prefix("eventlistener:") {
            let events_value = ini.get(section, "events").ok_or_else(|| {
                ConfigError::MissingKey(section.to_string(), "events".to_string())
            })?;
            let mut events = Vec::new();
            for name in events_value.split(',') {
                events.push(
                    EventType::parse(name)
                        .ok_or_else(|| ConfigError::UnknownEventType(name.trim().to_string()))?,
                );
            }
            let buffer_size = match ini.get(section, "buffer_size") {
                Some(v) => ini::integer(section, "buffer_size", v)?,
                None => 10,
            };
            let configs = process_configs(ini, section, listener, listener, ctx)?;
            let priority = match ini.get(section, "priority") {
                Some(v) => ini::integer(section, "priority", v)?,
                None => -1,
            };
            groups.push(GroupConfig {
                name: listener.to_string(),
                priority,
                kind: GroupKind::EventListener {
                    events,
                    buffer_size,
                },
                programs: configs,
            });
        } else if let Some(program) = section.strip_prefix("fcgi-program:") {
            let socket_value_str = ini.get(section, "socket").ok_or_else(|| {
                ConfigError::MissingKey(section.to_string(), "socket".to_string())
            })?;
            let socket = socket_value(section, socket_value_str)?;
            let configs = process_configs(ini, section, program, program, ctx)?;
            let priority = configs.first().map(|c| c.priority).unwrap_or(999);
            groups.push(GroupConfig {
                name: program.to_string(),
                priority,
                kind: GroupKind::Fcgi { socket },
                programs: configs,
            });
        }
    }

    groups.sort_by(|a, b| a.name.cmp(&b.name));
    let mut seen = std::collections::BTreeSet::new();
    for g in &groups {
        if !seen.insert(g.name.clone()) {
            return Err(ConfigError::DuplicateName(g.name.clone()));
        }
    }
    Ok(groups)
}

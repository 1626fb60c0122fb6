// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Minimal INI reader and the value parsers the config schema needs.
//!
//! Config errors are all fatal at load time; each parser returns a typed
//! error naming the offending value.

use std::collections::BTreeMap;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("could not read config file {0}: {1}")]
    Unreadable(String, String),
    #[error("line {0}: not in a section")]
    ValueOutsideSection(usize),
    #[error("line {0}: could not parse '{1}'")]
    Syntax(usize, String),
    #[error(".ini file does not include {0} section")]
    MissingSection(String),
    #[error("section {0} does not specify a {1}")]
    MissingKey(String, String),
    #[error("invalid value for {key} in section {section}: {message}")]
    BadValue {
        section: String,
        key: String,
        message: String,
    },
    #[error("duplicate name {0}")]
    DuplicateName(String),
    #[error("unknown program {1} referenced by group {0}")]
    UnknownProgram(String, String),
    #[error("unknown event type {0}")]
    UnknownEventType(String),
    #[error("invalid process_name template {0}: {1}")]
    BadTemplate(String, String),
    #[error("no such user {0}")]
    NoSuchUser(String),
}

/// Parsed INI document: section name to key/value map.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Ini {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl Ini {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut current: Option<String> = None;
        for (idx, raw) in text.lines().enumerate() {
            let lineno = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                let name = name.trim().to_string();
                sections.entry(name.clone()).or_default();
                current = Some(name);
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::Syntax(lineno, line.to_string()));
            };
            let Some(section) = &current else {
                return Err(ConfigError::ValueOutsideSection(lineno));
            };
            sections
                .get_mut(section)
                .expect("current section exists")
                .insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(Self { sections })
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.sections.contains_key(name)
    }

    pub fn section_names(&self) -> impl Iterator<Item = &str> {
        self.sections.keys().map(|s| s.as_str())
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|s| s.get(key))
            .map(|s| s.as_str())
    }
}

fn bad(section: &str, key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::BadValue {
        section: section.to_string(),
        key: key.to_string(),
        message: message.into(),
    }
}

/// true/false with the usual aliases.
pub fn boolean(section: &str, key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(bad(section, key, format!("{value} is not a boolean"))),
    }
}

pub fn integer<T: std::str::FromStr>(
    section: &str,
    key: &str,
    value: &str,
) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| bad(section, key, format!("{value} is not an integer")))
}

pub fn float(section: &str, key: &str, value: &str) -> Result<f64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| bad(section, key, format!("{value} is not a number")))
}

/// Byte sizes like `512`, `1KB`, `50MB`, `1GB`.
pub fn byte_size(section: &str, key: &str, value: &str) -> Result<u64, ConfigError> {
    let v = value.trim();
    let lower = v.to_ascii_uppercase();
    let (digits, multiplier) = if let Some(d) = lower.strip_suffix("KB") {
        (d, 1024)
    } else if let Some(d) = lower.strip_suffix("MB") {
        (d, 1024 * 1024)
    } else if let Some(d) = lower.strip_suffix("GB") {
        (d, 1024 * 1024 * 1024)
    } else {
        (lower.as_str(), 1)
    };
    digits
        .trim()
        .parse::<u64>()
        .map(|n| n * multiplier)
        .map_err(|_| bad(section, key, format!("{value} is not a byte size")))
}

/// Octal file-creation masks like `022`.
pub fn octal(section: &str, key: &str, value: &str) -> Result<u32, ConfigError> {
    u32::from_str_radix(value.trim(), 8)
        .map_err(|_| bad(section, key, format!("{value} is not an octal number")))
}

/// Signal by number or name, with or without the `SIG` prefix.
pub fn signal_number(section: &str, key: &str, value: &str) -> Result<i32, ConfigError> {
    let v = value.trim();
    if let Ok(n) = v.parse::<i32>() {
        return Ok(n);
    }
    let name = v.to_ascii_uppercase();
    let name = name.strip_prefix("SIG").unwrap_or(&name);
    let sig = match name {
        "HUP" => libc::SIGHUP,
        "INT" => libc::SIGINT,
        "QUIT" => libc::SIGQUIT,
        "KILL" => libc::SIGKILL,
        "USR1" => libc::SIGUSR1,
        "USR2" => libc::SIGUSR2,
        "TERM" => libc::SIGTERM,
        "STOP" => libc::SIGSTOP,
        "CONT" => libc::SIGCONT,
        "ABRT" => libc::SIGABRT,
        "ALRM" => libc::SIGALRM,
        "CHLD" => libc::SIGCHLD,
        _ => return Err(bad(section, key, format!("{value} is not a signal"))),
    };
    Ok(sig)
}

/// Comma-separated integers, e.g. exit code sets.
pub fn list_of_ints(section: &str, key: &str, value: &str) -> Result<Vec<i32>, ConfigError> {
    value
        .split(',')
        .map(|part| {
            part.trim()
                .parse()
                .map_err(|_| bad(section, key, format!("{value} is not a list of ints")))
        })
        .collect()
}

/// `KEY=val,OTHER="quoted,value"` pairs for child environments.
pub fn environment_list(
    section: &str,
    key: &str,
    value: &str,
) -> Result<Vec<(String, String)>, ConfigError> {
    let mut out = Vec::new();
    let mut rest = value.trim();
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else {
            return Err(bad(section, key, format!("{value} is not KEY=value pairs")));
        };
        let name = rest[..eq].trim();
        if name.is_empty() {
            return Err(bad(section, key, format!("{value} is not KEY=value pairs")));
        }
        let after = &rest[eq + 1..];
        let (val, remainder) = if let Some(stripped) = after.strip_prefix('"') {
            let Some(close) = stripped.find('"') else {
                return Err(bad(section, key, "unterminated quote"));
            };
            let val = &stripped[..close];
            let mut remainder = &stripped[close + 1..];
            remainder = remainder.trim_start();
            remainder = remainder.strip_prefix(',').unwrap_or(remainder);
            (val.to_string(), remainder)
        } else {
            match after.find(',') {
                Some(comma) => (after[..comma].trim().to_string(), &after[comma + 1..]),
                None => (after.trim().to_string(), ""),
            }
        };
        out.push((name.to_string(), val));
        rest = remainder.trim_start();
    }
    Ok(out)
}

/// Expand `%(name)s` / `%(name)02d` style templates.
pub fn expand_template(
    template: &str,
    vars: &BTreeMap<&str, String>,
) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    loop {
        let Some(start) = rest.find("%(") else {
            out.push_str(rest);
            return Ok(out);
        };
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(close) = after.find(')') else {
            return Err(ConfigError::BadTemplate(
                template.to_string(),
                "unterminated %( expression".to_string(),
            ));
        };
        let name = &after[..close];
        let value = vars.get(name).ok_or_else(|| {
            ConfigError::BadTemplate(template.to_string(), format!("unknown name {name}"))
        })?;
        let spec = &after[close + 1..];
        let Some(conv_at) = spec.find(|c: char| c == 's' || c == 'd') else {
            return Err(ConfigError::BadTemplate(
                template.to_string(),
                "missing conversion character".to_string(),
            ));
        };
        let (width_str, conv) = (&spec[..conv_at], spec.as_bytes()[conv_at]);
        if !width_str.chars().all(|c| c.is_ascii_digit()) {
            return Err(ConfigError::BadTemplate(
                template.to_string(),
                format!("bad format spec {width_str}"),
            ));
        }
        match conv {
            b's' => out.push_str(value),
            b'd' => {
                let n: i64 = value.parse().map_err(|_| {
                    ConfigError::BadTemplate(
                        template.to_string(),
                        format!("{name} is not numeric"),
                    )
                })?;
                if width_str.is_empty() {
                    out.push_str(&n.to_string());
                } else {
                    let width: usize = width_str.trim_start_matches('0').parse().unwrap_or(0);
                    if width_str.starts_with('0') {
                        out.push_str(&format!("{n:0width$}"));
                    } else {
                        out.push_str(&format!("{n:width$}"));
                    }
                }
            }
            _ => unreachable!(),
        }
        rest = &spec[conv_at + 1..];
    }
}

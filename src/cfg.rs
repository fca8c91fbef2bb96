// Logmet -- extract metrics from log streams
// Copyright (C) 2025  The logmet authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use chrono::FixedOffset;
use light_ini::{IniHandler, IniParser};
use smart_default::SmartDefault;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::duration::parse_duration;

pub const KEY_PROGS: &str = "progs";
pub const KEY_LOGS: &str = "logs";
pub const KEY_ONE_SHOT: &str = "one_shot";
pub const KEY_COMPILE_ONLY: &str = "compile_only";
pub const KEY_OVERRIDE_TIMEZONE: &str = "override_timezone";
pub const KEY_SYSLOG_USE_CURRENT_YEAR: &str = "syslog_use_current_year";
pub const KEY_OMIT_METRIC_SOURCE: &str = "omit_metric_source";
pub const KEY_OMIT_PROG_LABEL: &str = "omit_prog_label";
pub const KEY_EMIT_METRIC_TIMESTAMP: &str = "emit_metric_timestamp";
pub const KEY_GC_INTERVAL: &str = "expired_metric_gc_interval";
pub const KEY_STALE_LOG_GC_INTERVAL: &str = "stale_log_gc_interval";
pub const KEY_POLL_INTERVAL: &str = "poll_interval";
pub const KEY_EXPORT_INTERVAL: &str = "export_interval";
pub const KEY_EXPORT_FILE: &str = "export_file";

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}: unknown configuration entry")]
    UnknownEntry(String),
    #[error("{0}: invalid value for {1}")]
    InvalidValue(String, &'static str),
    #[error("{0}: invalid timezone offset (expected [+-]HH:MM)")]
    InvalidOffset(String),
    #[error("{0}: unexpected configuration section")]
    UnknownSection(String),
}

/// Runtime settings, from defaults, the configuration file and the command
/// line, in increasing precedence.
#[derive(Clone, Debug, SmartDefault)]
pub struct Settings {
    /// Directory of metric program files.
    #[default(PathBuf::from("."))]
    pub progs: PathBuf,
    /// Log file patterns to tail.
    pub logs: Vec<String>,
    pub one_shot: bool,
    pub compile_only: bool,
    pub dump_ast: bool,
    pub dump_ast_types: bool,
    pub dump_bytecode: bool,
    /// Fixed UTC offset applied when parsing zone-less timestamps.
    pub override_timezone: Option<FixedOffset>,
    pub syslog_use_current_year: bool,
    pub omit_metric_source: bool,
    pub omit_prog_label: bool,
    pub emit_metric_timestamp: bool,
    #[default(Duration::from_secs(60))]
    pub expired_metric_gc_interval: Duration,
    /// How often the tailer forgets state for files that disappeared.
    #[default(Duration::from_secs(3600))]
    pub stale_log_gc_interval: Duration,
    /// Cadence of the log tailer and the program directory watcher.
    #[default(Duration::from_millis(250))]
    pub poll_interval: Duration,
    #[default(Duration::from_secs(60))]
    pub export_interval: Duration,
    /// Prometheus text exposition written here each export interval.
    pub export_file: Option<PathBuf>,
}

impl Settings {
    /// Merge a configuration file into these settings.
    pub fn merge_file(&mut self, path: &Path) -> anyhow::Result<()> {
        let mut handler = SettingsHandler { settings: self };
        let mut parser = IniParser::new(&mut handler);
        parser
            .parse_file(path)
            .map_err(|error| anyhow::anyhow!("{}: {error:?}", path.display()))?;
        Ok(())
    }
}

/// Parse a fixed offset such as `+09:00`, `-05:30` or `+0200`.
pub fn parse_offset(text: &str) -> Result<FixedOffset, Error> {
    let bad = || Error::InvalidOffset(text.to_string());
    let (sign, rest) = match text.as_bytes().first() {
        Some(b'+') => (1, &text[1..]),
        Some(b'-') => (-1, &text[1..]),
        _ => return Err(bad()),
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(bad());
    }
    let hours: i32 = digits[..2].parse().map_err(|_| bad())?;
    let minutes: i32 = digits[2..].parse().map_err(|_| bad())?;
    if minutes >= 60 {
        return Err(bad());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(bad)
}

fn parse_bool(value: &str, key: &'static str) -> Result<bool, Error> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(Error::InvalidValue(value.to_string(), key)),
    }
}

struct SettingsHandler<'s> {
    settings: &'s mut Settings,
}

impl IniHandler for SettingsHandler<'_> {
    type Error = Error;

    fn section(&mut self, name: &str) -> Result<(), Self::Error> {
        // A single optional [logmet] section; anything else is a mistake.
        if name == "logmet" {
            Ok(())
        } else {
            Err(Error::UnknownSection(name.to_string()))
        }
    }

    fn option(&mut self, key: &str, value: &str) -> Result<(), Self::Error> {
        let settings = &mut *self.settings;
        match key {
            KEY_PROGS => settings.progs = PathBuf::from(value),
            KEY_LOGS => {
                settings
                    .logs
                    .extend(value.split(',').map(|s| s.trim().to_string()));
            }
            KEY_ONE_SHOT => settings.one_shot = parse_bool(value, KEY_ONE_SHOT)?,
            KEY_COMPILE_ONLY => {
                settings.compile_only = parse_bool(value, KEY_COMPILE_ONLY)?;
            }
            KEY_OVERRIDE_TIMEZONE => {
                settings.override_timezone = Some(parse_offset(value)?);
            }
            KEY_SYSLOG_USE_CURRENT_YEAR => {
                settings.syslog_use_current_year =
                    parse_bool(value, KEY_SYSLOG_USE_CURRENT_YEAR)?;
            }
            KEY_OMIT_METRIC_SOURCE => {
                settings.omit_metric_source = parse_bool(value, KEY_OMIT_METRIC_SOURCE)?;
            }
            KEY_OMIT_PROG_LABEL => {
                settings.omit_prog_label = parse_bool(value, KEY_OMIT_PROG_LABEL)?;
            }
            KEY_EMIT_METRIC_TIMESTAMP => {
                settings.emit_metric_timestamp =
                    parse_bool(value, KEY_EMIT_METRIC_TIMESTAMP)?;
            }
            KEY_GC_INTERVAL => {
                settings.expired_metric_gc_interval = parse_duration(value)
                    .map_err(|_| Error::InvalidValue(value.to_string(), KEY_GC_INTERVAL))?;
            }
            KEY_STALE_LOG_GC_INTERVAL => {
                settings.stale_log_gc_interval = parse_duration(value).map_err(|_| {
                    Error::InvalidValue(value.to_string(), KEY_STALE_LOG_GC_INTERVAL)
                })?;
            }
            KEY_POLL_INTERVAL => {
                settings.poll_interval = parse_duration(value)
                    .map_err(|_| Error::InvalidValue(value.to_string(), KEY_POLL_INTERVAL))?;
            }
            KEY_EXPORT_INTERVAL => {
                settings.export_interval = parse_duration(value).map_err(|_| {
                    Error::InvalidValue(value.to_string(), KEY_EXPORT_INTERVAL)
                })?;
            }
            KEY_EXPORT_FILE => settings.export_file = Some(PathBuf::from(value)),
            _ => return Err(Error::UnknownEntry(key.to_string())),
        }
        Ok(())
    }
}

/// XDG base directories of the application.
pub struct Directories {
    app_name: String,
    xdg_dirs: xdg::BaseDirectories,
}

impl Directories {
    pub fn new(app_name: &str) -> Directories {
        Directories {
            app_name: String::from(app_name),
            xdg_dirs: xdg::BaseDirectories::with_prefix(app_name),
        }
    }

    /// Path of the log file in the runtime directory.
    pub fn log_file(&self) -> anyhow::Result<PathBuf> {
        let basename = format!("{}.log", self.app_name);
        let path = self.xdg_dirs.place_runtime_file(basename)?;
        Ok(path)
    }

    /// The configuration file, if one exists in the XDG config path.
    pub fn config_file(&self) -> Option<PathBuf> {
        let basename = format!("{}.ini", self.app_name);
        self.xdg_dirs.find_config_file(basename)
    }
}

#[cfg(test)]
mod tests {

    use std::fs::File;
    use std::io::Write;
    use std::time::Duration;

    use super::{Settings, parse_bool, parse_offset};

    #[test]
    fn defaults() {
        let settings = Settings::default();
        assert!(!settings.one_shot);
        assert_eq!(Duration::from_secs(60), settings.expired_metric_gc_interval);
        assert_eq!(Duration::from_millis(250), settings.poll_interval);
        assert!(settings.override_timezone.is_none());
    }

    #[test]
    fn offsets() {
        assert_eq!(9 * 3600, parse_offset("+09:00").unwrap().local_minus_utc());
        assert_eq!(
            -(5 * 3600 + 1800),
            parse_offset("-05:30").unwrap().local_minus_utc()
        );
        assert_eq!(2 * 3600, parse_offset("+0200").unwrap().local_minus_utc());
        assert!(parse_offset("09:00").is_err());
        assert!(parse_offset("+9").is_err());
        assert!(parse_offset("+09:75").is_err());
    }

    #[test]
    fn booleans() {
        assert!(parse_bool("true", "k").unwrap());
        assert!(parse_bool("Yes", "k").unwrap());
        assert!(!parse_bool("0", "k").unwrap());
        assert!(parse_bool("maybe", "k").is_err());
    }

    #[test]
    fn merge_configuration_file() {
        let path = std::env::temp_dir().join(format!(
            "logmet-cfg-{}.ini",
            std::process::id()
        ));
        let mut file = File::create(&path).unwrap();
        writeln!(file, "[logmet]").unwrap();
        writeln!(file, "progs = /etc/logmet/progs").unwrap();
        writeln!(file, "logs = /var/log/app.log, /var/log/other.log").unwrap();
        writeln!(file, "one_shot = true").unwrap();
        writeln!(file, "expired_metric_gc_interval = 5m").unwrap();
        writeln!(file, "override_timezone = +02:00").unwrap();
        drop(file);

        let mut settings = Settings::default();
        settings.merge_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!("/etc/logmet/progs", settings.progs.display().to_string());
        assert_eq!(
            vec!["/var/log/app.log", "/var/log/other.log"],
            settings.logs
        );
        assert!(settings.one_shot);
        assert_eq!(Duration::from_secs(300), settings.expired_metric_gc_interval);
        assert_eq!(
            2 * 3600,
            settings.override_timezone.unwrap().local_minus_utc()
        );
    }

    #[test]
    fn invalid_entry_is_rejected() {
        let path = std::env::temp_dir().join(format!(
            "logmet-cfg-bad-{}.ini",
            std::process::id()
        ));
        let mut file = File::create(&path).unwrap();
        writeln!(file, "[logmet]").unwrap();
        writeln!(file, "frobnicate = yes").unwrap();
        drop(file);

        let mut settings = Settings::default();
        let result = settings.merge_file(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(result.is_err());
    }
}

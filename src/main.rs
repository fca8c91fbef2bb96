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

use argh::FromArgs;
use log::error;
use simplelog::{SimpleLogger, TermLogger, WriteLogger};
use std::fs::File;
use std::path::PathBuf;
use strum::EnumString;

mod application;
mod cfg;
mod clock;
mod duration;
mod export;
mod loader;
mod metrics;
mod program;
mod sighdr;
mod tailer;
mod vm;
mod watcher;

use duration::parse_duration;

const APP_NAME: &str = "logmet";

#[derive(Clone, Copy, Debug, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
enum LoggingTarget {
    Console,
    File,
}

/// Extract whitebox metrics from application log streams.
///
/// Programs in the program directory are compiled and executed against every
/// line of the tailed logs; the resulting metrics are dumped at exit in
/// one-shot mode or exported periodically in continuous mode.
#[derive(FromArgs, Debug)]
struct Opt {
    /// directory containing the metric programs
    #[argh(option, short = 'p')]
    progs: Option<PathBuf>,

    /// log file or glob pattern to tail (repeatable)
    #[argh(option, short = 'l')]
    logs: Vec<String>,

    /// read the logs from the beginning to EOF, dump metrics and exit
    #[argh(switch)]
    one_shot: bool,

    /// compile the programs and exit
    #[argh(switch)]
    compile_only: bool,

    /// print the AST after parsing (with --compile-only)
    #[argh(switch)]
    dump_ast: bool,

    /// print the AST with inferred types (with --compile-only)
    #[argh(switch)]
    dump_ast_types: bool,

    /// print the generated bytecode (with --compile-only)
    #[argh(switch)]
    dump_bytecode: bool,

    /// fixed UTC offset applied to zone-less timestamps (ex: +09:00)
    #[argh(option)]
    override_timezone: Option<String>,

    /// assume the current year in timestamps that omit it
    #[argh(switch)]
    syslog_use_current_year: bool,

    /// do not attach the declaration source to exported metrics
    #[argh(switch)]
    omit_metric_source: bool,

    /// drop the prog label and merge same-named metrics across programs
    #[argh(switch)]
    omit_prog_label: bool,

    /// attach datum update times to exported metrics
    #[argh(switch)]
    emit_metric_timestamp: bool,

    /// interval between expired-datum collection passes (ex: 60s, 5m)
    #[argh(option)]
    gc_interval: Option<String>,

    /// interval between sweeps of vanished log file state (ex: 1h)
    #[argh(option)]
    stale_log_gc_interval: Option<String>,

    /// poll cadence for log files and the program directory (ex: 250ms)
    #[argh(option)]
    poll_interval: Option<String>,

    /// interval between snapshot exports (ex: 60s)
    #[argh(option)]
    export_interval: Option<String>,

    /// write the Prometheus text exposition to this file on each export
    #[argh(option)]
    export_file: Option<PathBuf>,

    /// log informational messages
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// log debug messages
    #[argh(switch)]
    debug: bool,

    /// logging target (console, file)
    #[argh(option, short = 'L', default = "LoggingTarget::Console")]
    logging: LoggingTarget,
}

fn configure_logging(dirs: &cfg::Directories, opt: &Opt) {
    let log_level = if opt.debug {
        simplelog::LevelFilter::Debug
    } else if opt.verbose {
        simplelog::LevelFilter::Info
    } else {
        simplelog::LevelFilter::Warn
    };
    let configured = match opt.logging {
        LoggingTarget::Console => TermLogger::init(
            log_level,
            simplelog::Config::default(),
            simplelog::TerminalMode::Mixed,
            simplelog::ColorChoice::Auto,
        )
        .map_err(anyhow::Error::from),
        LoggingTarget::File => dirs.log_file().and_then(|path| {
            WriteLogger::init(
                log_level,
                simplelog::Config::default(),
                File::create(path)?,
            )
            .map_err(anyhow::Error::from)
        }),
    };
    configured.unwrap_or_else(|_| {
        SimpleLogger::init(log_level, simplelog::Config::default())
            .expect("cannot initialize logging")
    });
}

fn build_settings(dirs: &cfg::Directories, opt: &Opt) -> anyhow::Result<cfg::Settings> {
    let mut settings = cfg::Settings::default();
    if let Some(path) = dirs.config_file() {
        settings.merge_file(&path)?;
    }
    if let Some(progs) = &opt.progs {
        settings.progs = progs.clone();
    }
    if !opt.logs.is_empty() {
        settings.logs = opt.logs.clone();
    }
    settings.one_shot |= opt.one_shot;
    settings.compile_only |= opt.compile_only;
    settings.dump_ast |= opt.dump_ast;
    settings.dump_ast_types |= opt.dump_ast_types;
    settings.dump_bytecode |= opt.dump_bytecode;
    if let Some(offset) = &opt.override_timezone {
        settings.override_timezone = Some(cfg::parse_offset(offset)?);
    }
    settings.syslog_use_current_year |= opt.syslog_use_current_year;
    settings.omit_metric_source |= opt.omit_metric_source;
    settings.omit_prog_label |= opt.omit_prog_label;
    settings.emit_metric_timestamp |= opt.emit_metric_timestamp;
    if let Some(interval) = &opt.gc_interval {
        settings.expired_metric_gc_interval = parse_duration(interval)?;
    }
    if let Some(interval) = &opt.stale_log_gc_interval {
        settings.stale_log_gc_interval = parse_duration(interval)?;
    }
    if let Some(interval) = &opt.poll_interval {
        settings.poll_interval = parse_duration(interval)?;
    }
    if let Some(interval) = &opt.export_interval {
        settings.export_interval = parse_duration(interval)?;
    }
    if let Some(path) = &opt.export_file {
        settings.export_file = Some(path.clone());
    }
    Ok(settings)
}

fn main() {
    let opt: Opt = argh::from_env();
    let dirs = cfg::Directories::new(APP_NAME);
    configure_logging(&dirs, &opt);
    let settings = match build_settings(&dirs, &opt) {
        Ok(settings) => settings,
        Err(error) => {
            eprintln!("{error:#}");
            std::process::exit(2);
        }
    };
    if let Err(error) = application::run(&settings) {
        error!("{error:#}");
        std::process::exit(1);
    }
}

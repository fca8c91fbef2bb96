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

use log::{info, warn};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{channel, sync_channel};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::cfg::Settings;
use crate::clock::{Ticker, now_epoch};
use crate::export::{Exporter, PrometheusExporter, TextExporter};
use crate::loader::{Loader, VmOpts};
use crate::metrics::Store;
use crate::program::{CompileOpts, compile};
use crate::sighdr::Shutdown;
use crate::tailer::Tailer;
use crate::watcher::{PROGRAM_EXTENSION, Watcher};

/// Depth of the inbound line queue between the tailer and the loader.
const INBOUND_QUEUE_DEPTH: usize = 512;

/// Bound on the final drain at shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0} program(s) failed to compile")]
    CompileFailures(usize),
}

/// Run the mode selected by the settings.
pub fn run(settings: &Settings) -> anyhow::Result<()> {
    if settings.compile_only {
        compile_all(settings)
    } else if settings.one_shot {
        run_one_shot(settings)
    } else {
        run_continuous(settings)
    }
}

fn compile_opts(settings: &Settings) -> CompileOpts {
    CompileOpts {
        dump_ast: settings.dump_ast,
        dump_ast_types: settings.dump_ast_types,
        dump_bytecode: settings.dump_bytecode,
        omit_metric_source: settings.omit_metric_source,
    }
}

fn vm_opts(settings: &Settings) -> VmOpts {
    VmOpts {
        override_timezone: settings.override_timezone,
        syslog_use_current_year: settings.syslog_use_current_year,
    }
}

fn program_files(settings: &Settings) -> anyhow::Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(&settings.progs)?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension().is_some_and(|ext| ext == PROGRAM_EXTENSION) && path.is_file()
        })
        .collect();
    paths.sort();
    Ok(paths)
}

/// Compile every program, print diagnostics, exit non-zero on any failure.
fn compile_all(settings: &Settings) -> anyhow::Result<()> {
    let store = Store::new(settings.omit_prog_label);
    let opts = compile_opts(settings);
    let mut failures = 0;
    for path in program_files(settings)? {
        let source = match fs::read_to_string(&path) {
            Ok(source) => source,
            Err(error) => {
                eprintln!("{}: cannot read: {error}", path.display());
                failures += 1;
                continue;
            }
        };
        match compile(&path, &source, &store, &opts) {
            Ok(program) => println!("{}: ok, {} op(s)", program.name(), program.ops().len()),
            Err(errors) => {
                eprintln!("{errors}");
                failures += 1;
            }
        }
    }
    if failures > 0 {
        return Err(Error::CompileFailures(failures).into());
    }
    Ok(())
}

/// Read every input file to EOF, drain the programs, dump the metrics.
fn run_one_shot(settings: &Settings) -> anyhow::Result<()> {
    let store = Arc::new(Store::new(settings.omit_prog_label));
    let shutdown = Shutdown::new();
    let mut loader = Loader::new(
        store.clone(),
        &settings.progs,
        compile_opts(settings),
        vm_opts(settings),
        shutdown.clone(),
    )?;
    loader.initial_load()?;
    if loader.program_count() == 0 {
        warn!("no programs loaded");
    }

    let (lines_tx, lines_rx) = sync_channel(INBOUND_QUEUE_DEPTH);
    let (_watch_tx, watch_rx) = channel();
    let mut tailer = Tailer::new(
        &settings.logs,
        lines_tx,
        &store,
        settings.poll_interval,
        settings.stale_log_gc_interval,
        shutdown.clone(),
    )?;
    let loader_thread = thread::Builder::new()
        .name(String::from("loader"))
        .spawn(move || loader.run(lines_rx, watch_rx))?;
    tailer.run_once();
    drop(tailer); // closes the line channel, draining the programs
    loader_thread
        .join()
        .map_err(|_| anyhow::anyhow!("loader thread panicked"))?;

    let snapshot = store.snapshot(now_epoch());
    TextExporter::new(false).export(&snapshot)?;
    if let Some(path) = &settings.export_file {
        PrometheusExporter::new(
            Some(path),
            settings.emit_metric_timestamp,
            settings.omit_prog_label,
        )
        .export(&snapshot)?;
    }
    Ok(())
}

/// Tail forever: fan lines out to the programs, hot-reload on change, GC
/// stale datums and export snapshots periodically.
fn run_continuous(settings: &Settings) -> anyhow::Result<()> {
    if settings.logs.is_empty() {
        warn!("no logs to tail, exiting.");
        return Ok(());
    }
    info!("starting");
    let store = Arc::new(Store::new(settings.omit_prog_label));
    let shutdown = Shutdown::new();
    shutdown.catch_signals()?;

    let (lines_tx, lines_rx) = sync_channel(INBOUND_QUEUE_DEPTH);
    let (watch_tx, watch_rx) = channel();
    // The watcher baselines the directory before the initial load so that a
    // program landing in between still produces a Created event.
    let watcher = Watcher::new(
        &settings.progs,
        watch_tx,
        &store,
        settings.poll_interval,
        shutdown.clone(),
    )?;
    let mut loader = Loader::new(
        store.clone(),
        &settings.progs,
        compile_opts(settings),
        vm_opts(settings),
        shutdown.clone(),
    )?;
    loader.initial_load()?;

    let tailer = Tailer::new(
        &settings.logs,
        lines_tx,
        &store,
        settings.poll_interval,
        settings.stale_log_gc_interval,
        shutdown.clone(),
    )?;

    let tailer_thread = thread::Builder::new()
        .name(String::from("tailer"))
        .spawn(move || tailer.run())?;
    let watcher_thread = thread::Builder::new()
        .name(String::from("watcher"))
        .spawn(move || watcher.run())?;
    let loader_thread = thread::Builder::new()
        .name(String::from("loader"))
        .spawn(move || loader.run(lines_rx, watch_rx))?;

    let mut exporter = settings.export_file.as_ref().map(|path| {
        PrometheusExporter::new(
            Some(path),
            settings.emit_metric_timestamp,
            settings.omit_prog_label,
        )
    });
    let mut gc_ticker = Ticker::new(settings.expired_metric_gc_interval, false);
    let mut export_ticker = Ticker::new(settings.export_interval, false);
    while !shutdown.requested() {
        thread::sleep(Duration::from_millis(50));
        if gc_ticker.expired() {
            store.gc(now_epoch());
        }
        if export_ticker.expired() {
            if let Some(exporter) = &mut exporter {
                if let Err(error) = exporter.export(&store.snapshot(now_epoch())) {
                    warn!("export failed: {error}");
                }
            }
        }
    }

    info!("signal caught, exiting.");
    // The tailer notices the shutdown flag and closes the line channel; the
    // loader then drains every program. Bound the wait.
    let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
    for (name, handle) in [
        ("tailer", tailer_thread),
        ("watcher", watcher_thread),
        ("loader", loader_thread),
    ] {
        if !join_until(handle, deadline) {
            warn!("{name} did not stop within {SHUTDOWN_TIMEOUT:?}, forcing exit");
            break;
        }
    }
    if let Some(exporter) = &mut exporter {
        let _ = exporter.export(&store.snapshot(now_epoch()));
    }
    info!("stopping");
    Ok(())
}

/// Join a thread, giving up at the deadline.
fn join_until(handle: JoinHandle<()>, deadline: Instant) -> bool {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
    handle.join().is_ok()
}

#[cfg(test)]
mod tests {

    use std::fs::{self, File};
    use std::io::Write;
    use std::path::PathBuf;

    use super::{compile_all, run_one_shot};
    use crate::cfg::Settings;

    struct Fixture {
        dir: PathBuf,
    }

    impl Fixture {
        fn new(name: &str) -> Fixture {
            let dir = std::env::temp_dir().join(format!(
                "logmet-app-{name}-{}",
                std::process::id()
            ));
            let _ = fs::remove_dir_all(&dir);
            fs::create_dir_all(dir.join("progs")).unwrap();
            fs::create_dir_all(dir.join("logs")).unwrap();
            Fixture { dir }
        }

        fn write(&self, relative: &str, content: &str) {
            let mut file = File::create(self.dir.join(relative)).unwrap();
            file.write_all(content.as_bytes()).unwrap();
        }

        fn settings(&self) -> Settings {
            Settings {
                progs: self.dir.join("progs"),
                logs: vec![self.dir.join("logs/app.log").display().to_string()],
                ..Settings::default()
            }
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }

    #[test]
    fn compile_only_accepts_valid_programs() {
        let fixture = Fixture::new("compileok");
        fixture.write("progs/a.lm", "counter a\n/.*/ {\n  a++\n}\n");
        let mut settings = fixture.settings();
        settings.compile_only = true;
        assert!(compile_all(&settings).is_ok());
    }

    #[test]
    fn compile_only_fails_on_bad_programs() {
        let fixture = Fixture::new("compilebad");
        fixture.write("progs/a.lm", "counter a\n/.*/ {\n  a++\n}\n");
        fixture.write("progs/b.lm", "gauge\n");
        let mut settings = fixture.settings();
        settings.compile_only = true;
        assert!(compile_all(&settings).is_err());
    }

    #[test]
    fn one_shot_reads_to_eof_and_exits() {
        let fixture = Fixture::new("oneshot");
        fixture.write(
            "progs/count.lm",
            "counter lines_total\n/.*/ {\n  lines_total++\n}\n",
        );
        fixture.write("logs/app.log", "one\ntwo\nthree\n");
        let mut settings = fixture.settings();
        settings.one_shot = true;
        settings.export_file = Some(fixture.dir.join("metrics.prom"));
        run_one_shot(&settings).unwrap();
        let exposition = fs::read_to_string(fixture.dir.join("metrics.prom")).unwrap();
        assert!(
            exposition.contains("lines_total{prog=\"count\"} 3"),
            "{exposition}"
        );
    }
}

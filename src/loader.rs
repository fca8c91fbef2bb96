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

//! Program lifecycle and line fan-out.
//!
//! The loader owns every live program. Each program runs in its own thread
//! behind a bounded queue; the loader's single receive loop broadcasts every
//! incoming line to all of them. Reloads swap a program atomically: the old
//! thread drains its queue and retires before the replacement starts
//! receiving.

use chrono::FixedOffset;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TrySendError, sync_channel};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::clock::now_epoch;
use crate::metrics::{INTERNAL_PROGRAM, Metric, MetricDesc, Store, Value};
use crate::program::{CompileOpts, compile, source_digest};
use crate::sighdr::Shutdown;
use crate::tailer::LogLine;
use crate::vm::Vm;
use crate::watcher::{EventKind, PROGRAM_EXTENSION, WatchEvent};

/// Depth of each program's line queue.
const VM_QUEUE_DEPTH: usize = 128;

/// How long a broadcast may block on one slow program before the line is
/// dropped for that program only.
const BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(1);

/// Granularity of the blocking publish retry.
const BACKPRESSURE_RETRY: Duration = Duration::from_millis(1);

/// Cadence of the receive loop's shutdown check.
const RECV_TIMEOUT: Duration = Duration::from_millis(50);

/// Options the loader needs beyond compilation: how virtual machines parse
/// timestamps.
#[derive(Clone, Debug, Default)]
pub struct VmOpts {
    pub override_timezone: Option<FixedOffset>,
    pub syslog_use_current_year: bool,
}

/// A live program: its feed queue and the thread draining it.
struct ProgramHandle {
    digest: u64,
    tx: SyncSender<Arc<LogLine>>,
    thread: JoinHandle<()>,
}

pub struct Loader {
    store: Arc<Store>,
    program_dir: PathBuf,
    compile_opts: CompileOpts,
    vm_opts: VmOpts,
    shutdown: Shutdown,
    programs: HashMap<String, ProgramHandle>,
    line_count: Arc<Metric>,
    prog_loads: Arc<Metric>,
    prog_load_errors: Arc<Metric>,
    prog_runtime_errors: Arc<Metric>,
    lines_dropped: Arc<Metric>,
}

impl Loader {
    pub fn new(
        store: Arc<Store>,
        program_dir: &Path,
        compile_opts: CompileOpts,
        vm_opts: VmOpts,
        shutdown: Shutdown,
    ) -> anyhow::Result<Loader> {
        let line_count =
            store.find_or_create(MetricDesc::counter(INTERNAL_PROGRAM, "line_count", &[]))?;
        let prog_loads = store.find_or_create(MetricDesc::counter(
            INTERNAL_PROGRAM,
            "prog_loads_total",
            &["prog"],
        ))?;
        let prog_load_errors = store.find_or_create(MetricDesc::counter(
            INTERNAL_PROGRAM,
            "prog_load_errors",
            &["prog"],
        ))?;
        let prog_runtime_errors = store.find_or_create(MetricDesc::counter(
            INTERNAL_PROGRAM,
            "prog_runtime_errors",
            &["prog"],
        ))?;
        let lines_dropped = store.find_or_create(MetricDesc::counter(
            INTERNAL_PROGRAM,
            "lines_dropped_total",
            &["prog"],
        ))?;
        Ok(Loader {
            store,
            program_dir: program_dir.to_path_buf(),
            compile_opts,
            vm_opts,
            shutdown,
            programs: HashMap::new(),
            line_count,
            prog_loads,
            prog_load_errors,
            prog_runtime_errors,
            lines_dropped,
        })
    }

    pub fn program_count(&self) -> usize {
        self.programs.len()
    }

    /// Compile and start every program currently in the directory.
    /// Individual failures are reported and counted but do not abort.
    pub fn initial_load(&mut self) -> anyhow::Result<()> {
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.program_dir)?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .is_some_and(|ext| ext == PROGRAM_EXTENSION)
                    && path.is_file()
            })
            .collect();
        paths.sort();
        for path in paths {
            self.load_file(&path);
        }
        info!(
            "initial load complete, {} program(s) running",
            self.programs.len()
        );
        Ok(())
    }

    fn program_name(path: &Path) -> String {
        path.file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string())
    }

    fn count(&self, metric: &Arc<Metric>, labels: &[String]) {
        let _ = metric.with_datum(labels, |datum| datum.add(&Value::Int(1), now_epoch()));
    }

    /// Compile a program file and swap it in. On failure the previous
    /// version, if any, keeps running untouched.
    fn load_file(&mut self, path: &Path) {
        let name = Self::program_name(path);
        let labels = vec![name.clone()];
        let source = match fs::read_to_string(path) {
            Ok(source) => source,
            Err(error) => {
                error!("{}: cannot read: {error}", path.display());
                self.count(&self.prog_load_errors.clone(), &labels);
                return;
            }
        };
        if let Some(handle) = self.programs.get(&name) {
            if handle.digest == source_digest(&source) {
                debug!("{name}: unchanged, skipping reload");
                return;
            }
        }
        let program = match compile(path, &source, &self.store, &self.compile_opts) {
            Ok(program) => program,
            Err(errors) => {
                error!("{name}: compile failed:\n{errors}");
                self.count(&self.prog_load_errors.clone(), &labels);
                return;
            }
        };
        // Drain in-flight lines through the old version before the swap so
        // per-program line order is preserved.
        if let Some(old) = self.programs.remove(&name) {
            Self::retire(old);
            info!("{name}: reloaded");
        } else {
            info!("{name}: loaded");
        }
        match self.spawn(program) {
            Ok(handle) => {
                self.programs.insert(name, handle);
                self.count(&self.prog_loads.clone(), &labels);
            }
            Err(error) => {
                error!("{name}: cannot start: {error}");
                self.count(&self.prog_load_errors.clone(), &labels);
            }
        }
    }

    /// Start a thread running one virtual machine over its own queue.
    fn spawn(&self, program: crate::program::CompiledProgram) -> anyhow::Result<ProgramHandle> {
        let digest = program.digest();
        let name = program.name().clone();
        let (tx, rx) = sync_channel::<Arc<LogLine>>(VM_QUEUE_DEPTH);
        let mut vm = Vm::new(
            Arc::new(program),
            Some(self.prog_runtime_errors.clone()),
            self.vm_opts.override_timezone,
            self.vm_opts.syslog_use_current_year,
        );
        let thread = thread::Builder::new()
            .name(format!("vm-{name}"))
            .spawn(move || {
                while let Ok(line) = rx.recv() {
                    vm.run(&line);
                }
                debug!("{name}: drained");
            })?;
        Ok(ProgramHandle { digest, tx, thread })
    }

    fn retire(handle: ProgramHandle) {
        drop(handle.tx);
        if handle.thread.join().is_err() {
            error!("program thread panicked");
        }
    }

    fn unload_path(&mut self, path: &Path) {
        let name = Self::program_name(path);
        if let Some(handle) = self.programs.remove(&name) {
            Self::retire(handle);
            self.store.unload(&name);
            info!("{name}: unloaded");
        }
    }

    fn handle_event(&mut self, event: WatchEvent) {
        match event.kind {
            EventKind::Created | EventKind::Modified => self.load_file(&event.path),
            EventKind::Deleted => self.unload_path(&event.path),
        }
    }

    fn drain_events(&mut self, watch: &Receiver<WatchEvent>) {
        while let Ok(event) = watch.try_recv() {
            self.handle_event(event);
        }
    }

    /// Deliver one line to every live program.
    ///
    /// The publish blocks on a full queue up to the backpressure timeout,
    /// then drops the line for that program only and counts the drop.
    fn broadcast(&mut self, line: Arc<LogLine>) {
        let mut dead = Vec::new();
        for (name, handle) in &self.programs {
            let mut pending = line.clone();
            let deadline = Instant::now() + BACKPRESSURE_TIMEOUT;
            loop {
                match handle.tx.try_send(pending) {
                    Ok(()) => break,
                    Err(TrySendError::Full(line)) => {
                        if Instant::now() >= deadline {
                            warn!("{name}: queue full, dropping line");
                            self.count(&self.lines_dropped.clone(), &[name.clone()]);
                            break;
                        }
                        pending = line;
                        thread::sleep(BACKPRESSURE_RETRY);
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        error!("{name}: program thread gone, removing");
                        dead.push(name.clone());
                        break;
                    }
                }
            }
        }
        for name in dead {
            if let Some(handle) = self.programs.remove(&name) {
                Self::retire(handle);
            }
        }
    }

    /// Receive loop: watch events and line fan-out until the inbound
    /// sequence closes or shutdown is requested. Returning means every
    /// program has drained.
    pub fn run(mut self, lines: Receiver<LogLine>, watch: Receiver<WatchEvent>) {
        loop {
            let message = lines.recv_timeout(RECV_TIMEOUT);
            self.drain_events(&watch);
            match message {
                Ok(line) => {
                    self.count(&self.line_count.clone(), &[]);
                    self.broadcast(Arc::new(line));
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.shutdown.requested() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.close();
    }

    /// Drain and retire every program. Safe to call more than once.
    fn close(&mut self) {
        let programs = std::mem::take(&mut self.programs);
        let count = programs.len();
        for (_, handle) in programs {
            Self::retire(handle);
        }
        if count > 0 {
            info!("{count} program(s) drained");
        }
    }
}

#[cfg(test)]
mod tests {

    use std::fs::{self, File};
    use std::io::Write;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::mpsc::{Sender, SyncSender, channel, sync_channel};
    use std::thread::JoinHandle;

    use super::{Loader, VmOpts};
    use crate::metrics::{Store, Value};
    use crate::program::CompileOpts;
    use crate::sighdr::Shutdown;
    use crate::tailer::LogLine;
    use crate::watcher::{EventKind, WatchEvent};

    struct Fixture {
        dir: PathBuf,
    }

    impl Fixture {
        fn new(name: &str) -> Fixture {
            let dir = std::env::temp_dir().join(format!(
                "logmet-loader-{name}-{}",
                std::process::id()
            ));
            let _ = fs::remove_dir_all(&dir);
            fs::create_dir_all(&dir).unwrap();
            Fixture { dir }
        }

        fn write(&self, name: &str, content: &str) -> PathBuf {
            let path = self.dir.join(name);
            let mut file = File::create(&path).unwrap();
            file.write_all(content.as_bytes()).unwrap();
            path
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }

    struct Harness {
        store: Arc<Store>,
        lines: SyncSender<LogLine>,
        watch: Sender<WatchEvent>,
        loader: JoinHandle<()>,
    }

    impl Harness {
        fn start(fixture: &Fixture) -> Harness {
            let store = Arc::new(Store::new(false));
            let mut loader = Loader::new(
                store.clone(),
                &fixture.dir,
                CompileOpts::default(),
                VmOpts::default(),
                Shutdown::new(),
            )
            .unwrap();
            loader.initial_load().unwrap();
            let (lines_tx, lines_rx) = sync_channel(1024);
            let (watch_tx, watch_rx) = channel();
            let thread = std::thread::spawn(move || loader.run(lines_rx, watch_rx));
            Harness {
                store,
                lines: lines_tx,
                watch: watch_tx,
                loader: thread,
            }
        }

        fn send(&self, text: &str) {
            self.lines
                .send(LogLine {
                    filename: String::from("/var/log/app.log"),
                    text: text.to_string(),
                })
                .unwrap();
        }

        /// Close the inbound sequence and wait for every program to drain.
        fn finish(self) -> Arc<Store> {
            drop(self.lines);
            self.loader.join().unwrap();
            self.store
        }
    }

    fn scalar(store: &Store, program: &str, name: &str) -> Value {
        store
            .find(program, name)
            .unwrap()
            .with_datum(&[], |datum| datum.value().clone())
            .unwrap()
    }

    fn counter_with_label(store: &Store, name: &str, label: &str) -> i64 {
        match store
            .find("", name)
            .unwrap()
            .with_datum(&[label.to_string()], |datum| datum.value().clone())
            .unwrap()
        {
            Value::Int(value) => value,
            other => panic!("expected int, got {other:?}"),
        }
    }

    #[test]
    fn lines_reach_every_program() {
        let fixture = Fixture::new("fanout");
        fixture.write("a.lm", "counter a_total\n/.*/ {\n  a_total++\n}\n");
        fixture.write("b.lm", "counter b_total\n/.*/ {\n  b_total++\n}\n");
        let harness = Harness::start(&fixture);
        for _ in 0..10 {
            harness.send("hello");
        }
        let store = harness.finish();
        assert_eq!(Value::Int(10), scalar(&store, "a", "a_total"));
        assert_eq!(Value::Int(10), scalar(&store, "b", "b_total"));
        assert_eq!(
            Value::Int(10),
            store
                .find("", "line_count")
                .unwrap()
                .with_datum(&[], |d| d.value().clone())
                .unwrap()
        );
    }

    #[test]
    fn initial_load_reports_failures_and_continues() {
        let fixture = Fixture::new("failures");
        fixture.write("good.lm", "counter ok_total\n/.*/ {\n  ok_total++\n}\n");
        fixture.write("bad.lm", "counter\n");
        let harness = Harness::start(&fixture);
        harness.send("x");
        let store = harness.finish();
        assert_eq!(Value::Int(1), scalar(&store, "good", "ok_total"));
        assert_eq!(1, counter_with_label(&store, "prog_load_errors", "bad"));
    }

    #[test]
    fn reload_failure_keeps_the_old_program() {
        let fixture = Fixture::new("badreload");
        let path = fixture.write("web.lm", "counter v1_total\n/.*/ {\n  v1_total++\n}\n");
        let harness = Harness::start(&fixture);
        harness.send("before");
        fixture.write("web.lm", "counter v2_total\n/.*/ {\n");
        harness
            .watch
            .send(WatchEvent {
                kind: EventKind::Modified,
                path: path.clone(),
            })
            .unwrap();
        harness.send("after");
        harness.send("after");
        let store = harness.finish();
        // v1 keeps tallying every line.
        assert_eq!(Value::Int(3), scalar(&store, "web", "v1_total"));
        assert!(counter_with_label(&store, "prog_load_errors", "web") >= 1);
    }

    #[test]
    fn successful_reload_swaps_behavior_and_keeps_values() {
        let fixture = Fixture::new("reload");
        let path = fixture.write(
            "web.lm",
            "counter lines_total\n/.*/ {\n  lines_total++\n}\n",
        );
        let harness = Harness::start(&fixture);
        harness.send("one");
        fixture.write(
            "web.lm",
            "counter lines_total\n/keep/ {\n  lines_total++\n}\n",
        );
        harness
            .watch
            .send(WatchEvent {
                kind: EventKind::Modified,
                path,
            })
            .unwrap();
        harness.send("keep this");
        harness.send("drop this");
        let store = harness.finish();
        // 1 from v1 plus only the matching line from v2.
        assert_eq!(Value::Int(2), scalar(&store, "web", "lines_total"));
        assert_eq!(2, counter_with_label(&store, "prog_loads_total", "web"));
    }

    #[test]
    fn unchanged_file_does_not_reload() {
        let fixture = Fixture::new("nopreload");
        let source = "counter lines_total\n/.*/ {\n  lines_total++\n}\n";
        let path = fixture.write("web.lm", source);
        let harness = Harness::start(&fixture);
        harness
            .watch
            .send(WatchEvent {
                kind: EventKind::Modified,
                path,
            })
            .unwrap();
        harness.send("x");
        let store = harness.finish();
        assert_eq!(1, counter_with_label(&store, "prog_loads_total", "web"));
    }

    #[test]
    fn delete_unloads_the_program() {
        let fixture = Fixture::new("unload");
        let path = fixture.write(
            "gone.lm",
            "counter gone_total\n/.*/ {\n  gone_total++\n}\n",
        );
        let harness = Harness::start(&fixture);
        harness.send("x");
        harness
            .watch
            .send(WatchEvent {
                kind: EventKind::Deleted,
                path,
            })
            .unwrap();
        harness.send("y");
        let store = harness.finish();
        // The unlabelled metric disappears with its program.
        assert!(store.find("gone", "gone_total").is_none());
    }

    #[test]
    fn runtime_errors_are_attributed_to_the_program() {
        let fixture = Fixture::new("rterr");
        fixture.write(
            "strict.lm",
            "counter c\n/n=(\\S+)/ {\n  c += strtol($1, 10)\n}\n",
        );
        let harness = Harness::start(&fixture);
        harness.send("n=5");
        harness.send("n=abc");
        let store = harness.finish();
        assert_eq!(Value::Int(5), scalar(&store, "strict", "c"));
        assert_eq!(
            1,
            counter_with_label(&store, "prog_runtime_errors", "strict")
        );
    }
}

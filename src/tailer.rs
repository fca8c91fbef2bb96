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

use globset::{Glob, GlobSet, GlobSetBuilder};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Read;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::SyncSender;
use std::time::Duration;

use crate::clock::{Ticker, now_epoch};
use crate::metrics::{INTERNAL_PROGRAM, Metric, MetricDesc, Store, Value};
use crate::sighdr::Shutdown;

/// One line of input, as delivered to every loaded program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogLine {
    /// Absolute path of the originating file.
    pub filename: String,
    /// Line content without the terminating newline.
    pub text: String,
}

const READ_CHUNK: usize = 64 * 1024;

/// Follows a set of log files and emits complete lines in file order.
///
/// Rotation is detected by inode change, truncation by shrinking size. The
/// remainder of a rotated file is drained from the open handle before the
/// new file is picked up, so no tail lines are lost.
pub struct Tailer {
    patterns: Vec<PathBuf>,
    globs: GlobSet,
    states: HashMap<PathBuf, FileState>,
    tx: SyncSender<LogLine>,
    shutdown: Shutdown,
    poll: Duration,
    stale_gc: Duration,
    lines_total: Arc<Metric>,
    rotations_total: Arc<Metric>,
    errors_total: Arc<Metric>,
}

struct FileState {
    file: Option<File>,
    inode: u64,
    /// Bytes consumed from the current incarnation of the file.
    consumed: u64,
    /// Trailing data not yet terminated by a newline.
    partial: Vec<u8>,
}

impl FileState {
    fn new() -> FileState {
        FileState {
            file: None,
            inode: 0,
            consumed: 0,
            partial: Vec::new(),
        }
    }
}

impl Tailer {
    pub fn new(
        patterns: &[String],
        tx: SyncSender<LogLine>,
        store: &Store,
        poll: Duration,
        stale_gc: Duration,
        shutdown: Shutdown,
    ) -> anyhow::Result<Tailer> {
        let mut builder = GlobSetBuilder::new();
        let mut absolute = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let path = std::path::absolute(Path::new(pattern))?;
            builder.add(Glob::new(&path.display().to_string())?);
            absolute.push(path);
        }
        let lines_total = store.find_or_create(MetricDesc::counter(
            INTERNAL_PROGRAM,
            "log_lines_total",
            &["logfile"],
        ))?;
        let rotations_total = store.find_or_create(MetricDesc::counter(
            INTERNAL_PROGRAM,
            "log_rotations_total",
            &["logfile"],
        ))?;
        let errors_total = store.find_or_create(MetricDesc::counter(
            INTERNAL_PROGRAM,
            "log_errors_total",
            &["logfile"],
        ))?;
        Ok(Tailer {
            patterns: absolute,
            globs: builder.build()?,
            states: HashMap::new(),
            tx,
            shutdown,
            poll,
            stale_gc,
            lines_total,
            rotations_total,
            errors_total,
        })
    }

    /// Read every matching file from the beginning to EOF, delivering all
    /// lines including an unterminated last one. Used by one-shot mode.
    pub fn run_once(&mut self) {
        for path in self.discover() {
            self.poll_file(&path);
            self.flush_partial(&path);
        }
    }

    /// Tail until shutdown is requested. Dropping the sender on return is
    /// the shutdown signal for the rest of the pipeline.
    pub fn run(mut self) {
        info!("tailer started, {} pattern(s)", self.patterns.len());
        let mut ticker = Ticker::new(self.poll, true);
        let mut stale_ticker = Ticker::new(self.stale_gc, false);
        loop {
            if ticker.expired() {
                for path in self.discover() {
                    self.poll_file(&path);
                }
            }
            if stale_ticker.expired() {
                self.forget_stale();
            }
            let shutdown = self.shutdown.clone();
            if !ticker.sleep_unless(|| shutdown.requested()) {
                break;
            }
        }
        info!("tailer stopping");
    }

    /// Drop tracking state for files that no longer exist.
    fn forget_stale(&mut self) {
        let before = self.states.len();
        self.states.retain(|path, _| path.exists());
        let dropped = before - self.states.len();
        if dropped > 0 {
            debug!("forgot {dropped} vanished log file(s)");
        }
    }

    /// Expand the configured patterns against the file system.
    fn discover(&mut self) -> Vec<PathBuf> {
        let mut found = Vec::new();
        for pattern in &self.patterns {
            if pattern.is_file() {
                found.push(pattern.clone());
                continue;
            }
            let Some(parent) = pattern.parent() else {
                continue;
            };
            if let Ok(entries) = fs::read_dir(parent) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if self.globs.is_match(&path) && path.is_file() {
                        found.push(path);
                    }
                }
            }
        }
        found.sort();
        found.dedup();
        found
    }

    /// Read whatever the file has grown since the last poll.
    fn poll_file(&mut self, path: &Path) {
        if !self.states.contains_key(path) {
            self.states.insert(path.to_path_buf(), FileState::new());
        }
        if let Err(error) = self.advance(path) {
            warn!("{}: read error: {error}", path.display());
            self.count(&self.errors_total.clone(), path);
            // Reopen from scratch on the next poll.
            if let Some(state) = self.states.get_mut(path) {
                state.file = None;
            }
        }
    }

    fn advance(&mut self, path: &Path) -> std::io::Result<()> {
        // Drain the handle we already hold; a rotated file is still readable
        // through it even after the name moved on.
        self.drain_open_file(path)?;

        let metadata = fs::metadata(path)?;
        let state = self.states.get_mut(path).expect("state exists");
        let rotated = match &state.file {
            Some(_) => {
                if metadata.ino() != state.inode {
                    debug!("{}: rotated (inode change)", path.display());
                    true
                } else if metadata.len() < state.consumed {
                    debug!("{}: truncated", path.display());
                    true
                } else {
                    false
                }
            }
            None => false,
        };
        if rotated {
            self.flush_partial(path);
            let state = self.states.get_mut(path).expect("state exists");
            state.file = None;
            self.count(&self.rotations_total.clone(), path);
        }
        let state = self.states.get_mut(path).expect("state exists");
        if state.file.is_none() {
            let file = File::open(path)?;
            state.inode = metadata.ino();
            state.consumed = 0;
            state.file = Some(file);
            self.drain_open_file(path)?;
        }
        Ok(())
    }

    fn drain_open_file(&mut self, path: &Path) -> std::io::Result<()> {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let state = self.states.get_mut(path).expect("state exists");
            let Some(file) = &mut state.file else {
                return Ok(());
            };
            let read = file.read(&mut chunk)?;
            if read == 0 {
                return Ok(());
            }
            state.consumed += read as u64;
            state.partial.extend_from_slice(&chunk[..read]);
            self.split_lines(path);
        }
    }

    /// Emit every complete line buffered for the file.
    fn split_lines(&mut self, path: &Path) {
        let filename = path.display().to_string();
        loop {
            let state = self.states.get_mut(path).expect("state exists");
            let Some(at) = memchr::memchr(b'\n', &state.partial) else {
                return;
            };
            let mut line: Vec<u8> = state.partial.drain(..=at).collect();
            line.pop(); // newline
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let text = String::from_utf8_lossy(&line).to_string();
            self.emit(&filename, text);
        }
    }

    /// Deliver a possibly unterminated trailing line.
    fn flush_partial(&mut self, path: &Path) {
        let Some(state) = self.states.get_mut(path) else {
            return;
        };
        if state.partial.is_empty() {
            return;
        }
        let text = String::from_utf8_lossy(&state.partial).to_string();
        state.partial.clear();
        self.emit(&path.display().to_string(), text);
    }

    fn emit(&mut self, filename: &str, text: String) {
        self.count(&self.lines_total.clone(), Path::new(filename));
        let line = LogLine {
            filename: filename.to_string(),
            text,
        };
        // Blocking send: the inbound queue bounds how far the tailer can
        // run ahead of the programs.
        if self.tx.send(line).is_err() {
            debug!("line channel closed, requesting shutdown");
            self.shutdown.request();
        }
    }

    fn count(&self, metric: &Arc<Metric>, path: &Path) {
        let labels = vec![path.display().to_string()];
        let _ = metric.with_datum(&labels, |datum| {
            datum.add(&Value::Int(1), now_epoch())
        });
    }
}

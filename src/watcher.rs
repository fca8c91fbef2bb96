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
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::Sender;
use std::time::{Duration, SystemTime};

use crate::clock::{Ticker, now_epoch};
use crate::metrics::{INTERNAL_PROGRAM, Metric, MetricDesc, Store, Value};
use crate::sighdr::Shutdown;

/// File extension of metric programs.
pub const PROGRAM_EXTENSION: &str = "lm";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Modified,
    Deleted,
}

/// A change to a program file under the watched directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub path: PathBuf,
}

/// Polls the program directory and reports create/modify/delete events.
///
/// The initial directory contents are primed into the baseline, so only
/// changes after construction produce events; the loader does its own
/// initial scan.
pub struct Watcher {
    dir: PathBuf,
    known: HashMap<PathBuf, SystemTime>,
    tx: Sender<WatchEvent>,
    shutdown: Shutdown,
    poll: Duration,
    event_count: Arc<Metric>,
    error_count: Arc<Metric>,
}

impl Watcher {
    pub fn new(
        dir: &Path,
        tx: Sender<WatchEvent>,
        store: &Store,
        poll: Duration,
        shutdown: Shutdown,
    ) -> anyhow::Result<Watcher> {
        let event_count = store.find_or_create(MetricDesc::counter(
            INTERNAL_PROGRAM,
            "watcher_event_count",
            &[],
        ))?;
        let error_count = store.find_or_create(MetricDesc::counter(
            INTERNAL_PROGRAM,
            "log_watcher_error_count",
            &[],
        ))?;
        let mut watcher = Watcher {
            dir: dir.to_path_buf(),
            known: HashMap::new(),
            tx,
            shutdown,
            poll,
            event_count,
            error_count,
        };
        watcher.known = watcher.list();
        Ok(watcher)
    }

    /// Poll until shutdown is requested.
    pub fn run(mut self) {
        info!("watching {} for program changes", self.dir.display());
        let mut ticker = Ticker::new(self.poll, false);
        loop {
            let shutdown = self.shutdown.clone();
            if !ticker.sleep_unless(|| shutdown.requested()) {
                break;
            }
            if ticker.expired() {
                self.scan();
            }
        }
        info!("watcher stopping");
    }

    /// Program files currently in the directory, with their mtimes.
    fn list(&self) -> HashMap<PathBuf, SystemTime> {
        let mut found = HashMap::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(error) => {
                warn!("{}: cannot list: {error}", self.dir.display());
                self.count(&self.error_count);
                return found;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != PROGRAM_EXTENSION) {
                continue;
            }
            if let Ok(metadata) = entry.metadata() {
                let mtime = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                found.insert(path, mtime);
            }
        }
        found
    }

    /// Diff the directory against the last poll and emit events.
    pub fn scan(&mut self) {
        let current = self.list();
        let mut events = Vec::new();
        for (path, mtime) in &current {
            match self.known.get(path) {
                None => events.push(WatchEvent {
                    kind: EventKind::Created,
                    path: path.clone(),
                }),
                Some(known) if known != mtime => events.push(WatchEvent {
                    kind: EventKind::Modified,
                    path: path.clone(),
                }),
                Some(_) => (),
            }
        }
        for path in self.known.keys() {
            if !current.contains_key(path) {
                events.push(WatchEvent {
                    kind: EventKind::Deleted,
                    path: path.clone(),
                });
            }
        }
        self.known = current;
        for event in events {
            self.count(&self.event_count);
            if self.tx.send(event).is_err() {
                // Loader is gone; nothing left to notify.
                self.shutdown.request();
                return;
            }
        }
    }

    fn count(&self, metric: &Arc<Metric>) {
        let _ = metric.with_datum(&[], |datum| datum.add(&Value::Int(1), now_epoch()));
    }
}

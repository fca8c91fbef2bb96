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

use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::{Error, Metric, MetricDesc, MetricKind, MetricSource, Value};

/// Key of a metric in the store. The program part is empty when programs
/// share a single namespace (`omit_prog_label`).
type MetricKey = (String, String);

/// Concurrent registry of all live metrics.
///
/// The store lock only guards the map structure. Datum mutation goes through
/// the per-metric locks, so exporters and virtual machines mostly stay out of
/// each other's way.
pub struct Store {
    omit_prog_label: bool,
    metrics: RwLock<HashMap<MetricKey, Arc<Metric>>>,
}

impl Store {
    pub fn new(omit_prog_label: bool) -> Store {
        Store {
            omit_prog_label,
            metrics: RwLock::new(HashMap::new()),
        }
    }

    pub fn omit_prog_label(&self) -> bool {
        self.omit_prog_label
    }

    fn key(&self, program: &str, name: &str) -> MetricKey {
        if self.omit_prog_label {
            (String::new(), name.to_string())
        } else {
            (program.to_string(), name.to_string())
        }
    }

    /// Return the metric for the descriptor, creating it on first use.
    ///
    /// Redeclaring an existing metric is idempotent as long as kind, value
    /// representation, label keys and buckets agree; otherwise the program
    /// fails to load with a conflict.
    pub fn find_or_create(&self, desc: MetricDesc) -> Result<Arc<Metric>, Error> {
        let key = self.key(&desc.program, &desc.name);
        if let Some(metric) = self.metrics.read().expect("store lock poisoned").get(&key) {
            return self.merge(metric.clone(), &desc);
        }
        let mut metrics = self.metrics.write().expect("store lock poisoned");
        match metrics.get(&key) {
            Some(metric) => self.merge(metric.clone(), &desc),
            None => {
                let program = desc.program.clone();
                let metric = Arc::new(Metric::new(desc));
                metric.add_owner(&program);
                metrics.insert(key, metric.clone());
                Ok(metric)
            }
        }
    }

    fn merge(&self, metric: Arc<Metric>, desc: &MetricDesc) -> Result<Arc<Metric>, Error> {
        if !metric.desc().compatible_with(desc) {
            return Err(Error::DescriptorConflict(desc.name.clone()));
        }
        metric.add_owner(&desc.program);
        if !desc.ttl.is_zero() {
            metric.set_ttl(desc.ttl);
        }
        Ok(metric)
    }

    /// Look up a metric without creating it.
    pub fn find(&self, program: &str, name: &str) -> Option<Arc<Metric>> {
        let key = self.key(program, name);
        self.metrics
            .read()
            .expect("store lock poisoned")
            .get(&key)
            .cloned()
    }

    /// Drop a program's ownership of its metrics.
    ///
    /// Label-less metrics without any remaining owner disappear immediately.
    /// Labelled ones linger until GC has drained their datums.
    pub fn unload(&self, program: &str) {
        let mut metrics = self.metrics.write().expect("store lock poisoned");
        metrics.retain(|_, metric| {
            let mut keep = true;
            let owned = metric
                .owners
                .lock()
                .expect("owner lock poisoned")
                .iter()
                .any(|owner| owner == program);
            if owned && metric.remove_owner(program) {
                keep = !metric.desc().label_keys.is_empty();
            }
            keep
        });
    }

    /// Remove stale datums everywhere and drop orphaned, drained metrics.
    /// Returns the number of datums removed.
    pub fn gc(&self, now: i64) -> usize {
        let mut removed = 0;
        let mut metrics = self.metrics.write().expect("store lock poisoned");
        metrics.retain(|_, metric| {
            removed += metric.gc(now);
            !(metric.orphaned() && metric.datum_count() == 0)
        });
        if removed > 0 {
            debug!("gc removed {removed} stale datum(s)");
        }
        removed
    }

    /// Copy the store into a consistent, sorted read-view.
    ///
    /// Consistency is per metric: each metric is copied under its own locks,
    /// writers are never blocked for longer than one metric copy.
    pub fn snapshot(&self, when: i64) -> Snapshot {
        let handles: Vec<Arc<Metric>> = {
            let metrics = self.metrics.read().expect("store lock poisoned");
            metrics.values().cloned().collect()
        };
        let mut snapshots: Vec<MetricSnapshot> = handles
            .iter()
            .map(|metric| {
                let desc = metric.desc();
                MetricSnapshot {
                    program: desc.program.clone(),
                    name: desc.name.clone(),
                    export_name: desc.export_name.clone(),
                    kind: desc.kind,
                    hidden: desc.hidden,
                    label_keys: desc.label_keys.clone(),
                    source: desc.source.clone(),
                    datums: metric
                        .snapshot_datums()
                        .into_iter()
                        .map(|(labels, datum)| DatumSnapshot {
                            labels,
                            value: datum.value().clone(),
                            last_update: datum.last_update(),
                        })
                        .collect(),
                }
            })
            .collect();
        snapshots.sort_by(|a, b| (&a.program, &a.name).cmp(&(&b.program, &b.name)));
        Snapshot {
            when,
            metrics: snapshots,
        }
    }
}

/// Read-only view of the store for exporters.
pub struct Snapshot {
    pub when: i64,
    pub metrics: Vec<MetricSnapshot>,
}

pub struct MetricSnapshot {
    pub program: String,
    pub name: String,
    pub export_name: Option<String>,
    pub kind: MetricKind,
    pub hidden: bool,
    pub label_keys: Vec<String>,
    pub source: Option<MetricSource>,
    pub datums: Vec<DatumSnapshot>,
}

impl MetricSnapshot {
    /// Name under which the metric is exported.
    pub fn exported_name(&self) -> &str {
        self.export_name.as_deref().unwrap_or(&self.name)
    }

    /// Single unlabelled value, if this metric has one.
    pub fn scalar(&self) -> Option<&Value> {
        if self.label_keys.is_empty() {
            self.datums.first().map(|datum| &datum.value)
        } else {
            None
        }
    }
}

pub struct DatumSnapshot {
    pub labels: Vec<String>,
    pub value: Value,
    pub last_update: i64,
}

#[cfg(test)]
mod tests {

    use rand::RngExt;
    use std::sync::Arc;
    use std::time::Duration;

    use super::super::{MetricDesc, MetricKind, Value, ValueKind};
    use super::Store;

    fn desc(program: &str, name: &str, label_keys: &[&str]) -> MetricDesc {
        MetricDesc::counter(program, name, label_keys)
    }

    #[test]
    fn find_or_create_is_idempotent() {
        let store = Store::new(false);
        let first = store.find_or_create(desc("a", "lines", &[])).unwrap();
        let second = store.find_or_create(desc("a", "lines", &[])).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn conflicting_descriptor_is_rejected() {
        let store = Store::new(false);
        store.find_or_create(desc("a", "lines", &[])).unwrap();
        let mut conflict = desc("a", "lines", &[]);
        conflict.kind = MetricKind::Gauge;
        assert!(store.find_or_create(conflict).is_err());
        let mut conflict = desc("a", "lines", &["method"]);
        conflict.program = String::from("a");
        assert!(store.find_or_create(conflict).is_err());
    }

    #[test]
    fn programs_have_separate_namespaces() {
        let store = Store::new(false);
        let first = store.find_or_create(desc("a", "lines", &[])).unwrap();
        let second = store.find_or_create(desc("b", "lines", &[])).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn omitted_prog_label_collapses_namespaces() {
        let store = Store::new(true);
        let first = store.find_or_create(desc("a", "lines", &[])).unwrap();
        let second = store.find_or_create(desc("b", "lines", &[])).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        let mut conflict = desc("c", "lines", &[]);
        conflict.value_kind = ValueKind::Float;
        assert!(store.find_or_create(conflict).is_err());
    }

    #[test]
    fn unload_removes_unlabelled_metrics() {
        let store = Store::new(false);
        store.find_or_create(desc("a", "lines", &[])).unwrap();
        store.find_or_create(desc("a", "hits", &["ip"])).unwrap();
        store.unload("a");
        assert!(store.find("a", "lines").is_none());
        // Labelled metrics survive until GC drains them.
        assert!(store.find("a", "hits").is_some());
    }

    #[test]
    fn shared_metric_survives_one_unload() {
        let store = Store::new(true);
        store.find_or_create(desc("a", "lines", &[])).unwrap();
        store.find_or_create(desc("b", "lines", &[])).unwrap();
        store.unload("a");
        assert!(store.find("b", "lines").is_some());
        store.unload("b");
        assert!(store.find("b", "lines").is_none());
    }

    #[test]
    fn gc_drops_orphaned_drained_metrics() {
        let store = Store::new(false);
        let mut with_ttl = desc("a", "hits", &["ip"]);
        with_ttl.ttl = Duration::from_secs(60);
        let metric = store.find_or_create(with_ttl).unwrap();
        metric
            .with_datum(&[String::from("1.1.1.1")], |datum| {
                datum.add(&Value::Int(1), 0)
            })
            .unwrap();
        store.unload("a");
        assert_eq!(1, store.gc(120));
        assert!(store.find("a", "hits").is_none());
    }

    #[test]
    fn snapshot_is_sorted() {
        let store = Store::new(false);
        store.find_or_create(desc("b", "lines", &[])).unwrap();
        store.find_or_create(desc("a", "lines", &[])).unwrap();
        store.find_or_create(desc("a", "errors", &[])).unwrap();
        let snapshot = store.snapshot(0);
        let names: Vec<(String, String)> = snapshot
            .metrics
            .iter()
            .map(|m| (m.program.clone(), m.name.clone()))
            .collect();
        assert_eq!(
            vec![
                (String::from("a"), String::from("errors")),
                (String::from("a"), String::from("lines")),
                (String::from("b"), String::from("lines")),
            ],
            names
        );
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        const THREADS: usize = 4;
        const ROUNDS: usize = 1000;
        let store = Arc::new(Store::new(false));
        let metric = store
            .find_or_create(desc("a", "requests", &["method"]))
            .unwrap();
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let metric = metric.clone();
                std::thread::spawn(move || {
                    let mut rng = rand::rng();
                    for _ in 0..ROUNDS {
                        let method = if rng.random_bool(0.5) { "GET" } else { "POST" };
                        metric
                            .with_datum(&[String::from(method)], |datum| {
                                datum.add(&Value::Int(1), 0)
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let snapshot = store.snapshot(0);
        let total: i64 = snapshot.metrics[0]
            .datums
            .iter()
            .map(|datum| match datum.value {
                Value::Int(value) => value,
                _ => 0,
            })
            .sum();
        assert_eq!((THREADS * ROUNDS) as i64, total);
    }
}

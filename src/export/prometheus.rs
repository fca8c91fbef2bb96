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

use itertools::Itertools;
use log::debug;
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use super::{Exporter, escape_label};
use crate::metrics::{MetricKind, MetricSnapshot, Snapshot, Value};

/// Writes snapshots in the Prometheus text exposition format, either to a
/// file (rewritten per export, for a node-exporter textfile collector to
/// pick up) or to standard output.
pub struct PrometheusExporter {
    path: Option<PathBuf>,
    emit_timestamp: bool,
    omit_prog_label: bool,
}

impl PrometheusExporter {
    pub fn new(
        path: Option<&Path>,
        emit_timestamp: bool,
        omit_prog_label: bool,
    ) -> PrometheusExporter {
        PrometheusExporter {
            path: path.map(Path::to_path_buf),
            emit_timestamp,
            omit_prog_label,
        }
    }

    fn write_snapshot(&self, out: &mut dyn Write, snapshot: &Snapshot) -> io::Result<()> {
        // One TYPE header per exported name; programs may share a name.
        let mut typed = HashSet::new();
        for metric in &snapshot.metrics {
            if metric.hidden {
                continue;
            }
            if metric.kind == MetricKind::Text {
                debug!("{}: text metrics have no exposition format", metric.name);
                continue;
            }
            let name = metric.exported_name();
            if typed.insert(name.to_string()) {
                if let Some(source) = &metric.source {
                    writeln!(
                        out,
                        "# HELP {name} defined at {}:{}",
                        source.file, source.line
                    )?;
                }
                writeln!(out, "# TYPE {name} {}", type_of(metric.kind))?;
            }
            self.write_metric(out, metric, name)?;
        }
        Ok(())
    }

    fn write_metric(
        &self,
        out: &mut dyn Write,
        metric: &MetricSnapshot,
        name: &str,
    ) -> io::Result<()> {
        for datum in &metric.datums {
            let labels = self.labels(metric, &datum.labels, &[]);
            let stamp = self.stamp(datum.last_update);
            match &datum.value {
                Value::Int(value) => {
                    writeln!(out, "{name}{labels} {value}{stamp}")?;
                }
                Value::Float(value) => {
                    writeln!(out, "{name}{labels} {value}{stamp}")?;
                }
                Value::Buckets(buckets) => {
                    let mut cumulative = buckets.cumulative().into_iter();
                    for bound in buckets.bounds() {
                        let le = format!("{bound}");
                        let bucket_labels =
                            self.labels(metric, &datum.labels, &[("le", &le)]);
                        let count = cumulative.next().unwrap_or(0);
                        writeln!(out, "{name}_bucket{bucket_labels} {count}{stamp}")?;
                    }
                    let bucket_labels =
                        self.labels(metric, &datum.labels, &[("le", "+Inf")]);
                    writeln!(
                        out,
                        "{name}_bucket{bucket_labels} {}{stamp}",
                        buckets.count()
                    )?;
                    writeln!(out, "{name}_sum{labels} {}{stamp}", buckets.sum())?;
                    writeln!(out, "{name}_count{labels} {}{stamp}", buckets.count())?;
                }
                Value::Str(_) => (),
            }
        }
        Ok(())
    }

    /// Render the label set: the program attribution first, then the
    /// declared labels, then any extras such as `le`.
    fn labels(
        &self,
        metric: &MetricSnapshot,
        values: &[String],
        extra: &[(&str, &str)],
    ) -> String {
        let mut pairs = Vec::new();
        if !self.omit_prog_label && !metric.program.is_empty() {
            pairs.push(format!("prog=\"{}\"", escape_label(&metric.program)));
        }
        for (key, value) in metric.label_keys.iter().zip(values) {
            pairs.push(format!("{key}=\"{}\"", escape_label(value)));
        }
        for (key, value) in extra {
            pairs.push(format!("{key}=\"{}\"", escape_label(value)));
        }
        if pairs.is_empty() {
            String::new()
        } else {
            format!("{{{}}}", pairs.iter().join(","))
        }
    }

    fn stamp(&self, last_update: i64) -> String {
        if self.emit_timestamp && last_update > 0 {
            format!(" {}", last_update * 1000)
        } else {
            String::new()
        }
    }
}

fn type_of(kind: MetricKind) -> &'static str {
    match kind {
        MetricKind::Counter => "counter",
        MetricKind::Gauge | MetricKind::Timer => "gauge",
        MetricKind::Histogram => "histogram",
        MetricKind::Text => "untyped",
    }
}

impl Exporter for PrometheusExporter {
    fn export(&mut self, snapshot: &Snapshot) -> anyhow::Result<()> {
        match &self.path {
            Some(path) => {
                let mut file = File::create(path)?;
                self.write_snapshot(&mut file, snapshot)?;
                file.sync_all()?;
            }
            None => {
                let stdout = io::stdout();
                let mut out = stdout.lock();
                self.write_snapshot(&mut out, snapshot)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {

    use crate::metrics::{MetricDesc, MetricKind, Store, Value, ValueKind};
    use std::time::Duration;

    use super::PrometheusExporter;

    fn render(store: &Store, emit_timestamp: bool, omit_prog_label: bool) -> String {
        let exporter = PrometheusExporter::new(None, emit_timestamp, omit_prog_label);
        let snapshot = store.snapshot(0);
        let mut out = Vec::new();
        exporter.write_snapshot(&mut out, &snapshot).unwrap();
        String::from_utf8(out).unwrap()
    }

    fn desc(program: &str, name: &str, labels: &[&str]) -> MetricDesc {
        MetricDesc::counter(program, name, labels)
    }

    #[test]
    fn counter_with_labels() {
        let store = Store::new(false);
        let metric = store
            .find_or_create(desc("web", "requests", &["method"]))
            .unwrap();
        metric
            .with_datum(&[String::from("GET")], |datum| {
                datum.add(&Value::Int(2), 1_700_000_000)
            })
            .unwrap();
        let text = render(&store, false, false);
        assert!(text.contains("# TYPE requests counter"), "{text}");
        assert!(
            text.contains("requests{prog=\"web\",method=\"GET\"} 2"),
            "{text}"
        );
    }

    #[test]
    fn prog_label_can_be_omitted() {
        let store = Store::new(true);
        let metric = store.find_or_create(desc("web", "requests", &[])).unwrap();
        metric
            .with_datum(&[], |datum| datum.add(&Value::Int(1), 0))
            .unwrap();
        let text = render(&store, false, true);
        assert!(text.contains("requests 1"), "{text}");
        assert!(!text.contains("prog="), "{text}");
    }

    #[test]
    fn timestamps_are_milliseconds() {
        let store = Store::new(false);
        let metric = store.find_or_create(desc("web", "requests", &[])).unwrap();
        metric
            .with_datum(&[], |datum| datum.add(&Value::Int(1), 1_700_000_000))
            .unwrap();
        let text = render(&store, true, false);
        assert!(text.contains("requests{prog=\"web\"} 1 1700000000000"), "{text}");
    }

    #[test]
    fn hidden_metrics_are_not_exported() {
        let store = Store::new(false);
        let mut hidden = desc("web", "state", &[]);
        hidden.hidden = true;
        store.find_or_create(hidden).unwrap();
        let text = render(&store, false, false);
        assert!(!text.contains("state"), "{text}");
    }

    #[test]
    fn export_alias_is_used() {
        let store = Store::new(false);
        let mut with_alias = desc("web", "requests", &[]);
        with_alias.export_name = Some(String::from("http_requests_total"));
        let metric = store.find_or_create(with_alias).unwrap();
        metric
            .with_datum(&[], |datum| datum.add(&Value::Int(1), 0))
            .unwrap();
        let text = render(&store, false, false);
        assert!(text.contains("# TYPE http_requests_total counter"), "{text}");
        assert!(text.contains("http_requests_total{prog=\"web\"} 1"), "{text}");
    }

    #[test]
    fn histogram_exposition() {
        let store = Store::new(false);
        let mut hist = desc("web", "latency", &[]);
        hist.kind = MetricKind::Histogram;
        hist.value_kind = ValueKind::Buckets;
        hist.buckets = Some(vec![1.0, 2.0]);
        hist.ttl = Duration::ZERO;
        let metric = store.find_or_create(hist).unwrap();
        metric
            .with_datum(&[], |datum| {
                datum.observe(0.5, 0);
                datum.observe(1.5, 0);
                datum.observe(5.0, 0);
            })
            .unwrap();
        let text = render(&store, false, false);
        assert!(text.contains("# TYPE latency histogram"), "{text}");
        assert!(text.contains("latency_bucket{prog=\"web\",le=\"1\"} 1"), "{text}");
        assert!(text.contains("latency_bucket{prog=\"web\",le=\"2\"} 2"), "{text}");
        assert!(
            text.contains("latency_bucket{prog=\"web\",le=\"+Inf\"} 3"),
            "{text}"
        );
        assert!(text.contains("latency_sum{prog=\"web\"} 7"), "{text}");
        assert!(text.contains("latency_count{prog=\"web\"} 3"), "{text}");
    }

    #[test]
    fn label_values_are_escaped() {
        let store = Store::new(false);
        let metric = store
            .find_or_create(desc("web", "paths", &["path"]))
            .unwrap();
        metric
            .with_datum(&[String::from("a\"b\\c")], |datum| {
                datum.add(&Value::Int(1), 0)
            })
            .unwrap();
        let text = render(&store, false, false);
        assert!(text.contains("path=\"a\\\"b\\\\c\""), "{text}");
    }
}

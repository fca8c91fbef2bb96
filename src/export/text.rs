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
use std::io::{self, Write};

use super::{Exporter, escape_label};
use crate::metrics::{MetricSnapshot, Snapshot};

/// Plain text dump of a snapshot, used by one-shot mode.
pub struct TextExporter {
    include_hidden: bool,
}

impl TextExporter {
    pub fn new(include_hidden: bool) -> TextExporter {
        TextExporter { include_hidden }
    }

    fn write_snapshot(&self, out: &mut dyn Write, snapshot: &Snapshot) -> io::Result<()> {
        for metric in &snapshot.metrics {
            if metric.hidden && !self.include_hidden {
                continue;
            }
            self.write_metric(out, metric)?;
        }
        Ok(())
    }

    fn write_metric(&self, out: &mut dyn Write, metric: &MetricSnapshot) -> io::Result<()> {
        let name = metric.exported_name();
        for datum in &metric.datums {
            let labels = if datum.labels.is_empty() && metric.program.is_empty() {
                String::new()
            } else {
                let mut pairs = Vec::new();
                if !metric.program.is_empty() {
                    pairs.push(format!("prog=\"{}\"", escape_label(&metric.program)));
                }
                pairs.extend(
                    metric
                        .label_keys
                        .iter()
                        .zip(&datum.labels)
                        .map(|(key, value)| format!("{key}=\"{}\"", escape_label(value))),
                );
                format!("{{{}}}", pairs.iter().join(","))
            };
            writeln!(
                out,
                "{name}{labels} = {} @{}",
                datum.value, datum.last_update
            )?;
        }
        Ok(())
    }
}

impl Exporter for TextExporter {
    fn export(&mut self, snapshot: &Snapshot) -> anyhow::Result<()> {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        self.write_snapshot(&mut out, snapshot)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {

    use super::TextExporter;
    use crate::metrics::{MetricDesc, Store, Value};

    fn render(store: &Store, include_hidden: bool) -> String {
        let exporter = TextExporter::new(include_hidden);
        let snapshot = store.snapshot(0);
        let mut out = Vec::new();
        exporter.write_snapshot(&mut out, &snapshot).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn dump_lists_values_with_timestamps() {
        let store = Store::new(false);
        let metric = store
            .find_or_create(MetricDesc::counter("web", "requests", &["method"]))
            .unwrap();
        metric
            .with_datum(&[String::from("GET")], |datum| {
                datum.add(&Value::Int(2), 1_700_000_000)
            })
            .unwrap();
        let text = render(&store, false);
        assert_eq!(
            "requests{prog=\"web\",method=\"GET\"} = 2 @1700000000\n",
            text
        );
    }

    #[test]
    fn hidden_metrics_are_optional() {
        let store = Store::new(false);
        let mut hidden = MetricDesc::counter("web", "state", &[]);
        hidden.hidden = true;
        let metric = store.find_or_create(hidden).unwrap();
        metric
            .with_datum(&[], |datum| datum.add(&Value::Int(1), 0))
            .unwrap();
        assert!(render(&store, false).is_empty());
        assert!(render(&store, true).contains("state"));
    }
}

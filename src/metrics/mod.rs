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

use std::collections::HashMap;
use std::fmt;
use std::sync::{
    Arc, Mutex, RwLock,
    atomic::{AtomicU64, Ordering},
};
use std::time::Duration;
use strum::{EnumIter, EnumString, IntoStaticStr};
use thiserror::Error;

mod store;

pub use store::{DatumSnapshot, MetricSnapshot, Snapshot, Store};

/// Program name under which the self-monitoring metrics are registered.
/// Program names come from file stems, which are never empty.
pub const INTERNAL_PROGRAM: &str = "";

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}: conflicting redeclaration")]
    DescriptorConflict(String),
    #[error("{0}: expected {1} label(s), got {2}")]
    LabelArity(String, usize, usize),
    #[error("histogram buckets must be strictly increasing")]
    InvalidBuckets,
}

/// What a metric measures.
#[derive(Copy, Clone, Debug, PartialEq, Eq, EnumIter, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Timer,
    Text,
    Histogram,
}

impl MetricKind {
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

/// Representation of the values stored under a metric.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum ValueKind {
    Int,
    Float,
    Str,
    Buckets,
}

/// Cumulative histogram counts. The overflow bucket is implicit.
#[derive(Clone, Debug, PartialEq)]
pub struct BucketCounts {
    bounds: Arc<[f64]>,
    counts: Vec<u64>,
    count: u64,
    sum: f64,
}

impl BucketCounts {
    /// Build empty counts over strictly increasing finite upper bounds.
    pub fn new(bounds: &[f64]) -> Result<BucketCounts, Error> {
        if bounds.is_empty() || bounds.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::InvalidBuckets);
        }
        Ok(BucketCounts {
            bounds: Arc::from(bounds),
            counts: vec![0; bounds.len() + 1],
            count: 0,
            sum: 0.0,
        })
    }

    pub fn observe(&mut self, value: f64) {
        let index = self
            .bounds
            .iter()
            .position(|bound| value <= *bound)
            .unwrap_or(self.bounds.len());
        self.counts[index] += 1;
        self.count += 1;
        self.sum += value;
    }

    pub fn bounds(&self) -> &[f64] {
        &self.bounds
    }

    /// Per-bucket counts, the overflow bucket last.
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Counts accumulated over the buckets, as exposition formats expect.
    pub fn cumulative(&self) -> Vec<u64> {
        self.counts
            .iter()
            .scan(0u64, |acc, count| {
                *acc += count;
                Some(*acc)
            })
            .collect()
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }
}

/// A single metric value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    Buckets(BucketCounts),
}

impl Value {
    fn zero(kind: ValueKind, buckets: Option<&[f64]>) -> Result<Value, Error> {
        Ok(match kind {
            ValueKind::Int => Value::Int(0),
            ValueKind::Float => Value::Float(0.0),
            ValueKind::Str => Value::Str(String::new()),
            ValueKind::Buckets => {
                Value::Buckets(BucketCounts::new(buckets.unwrap_or_default())?)
            }
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Int(value) => write!(f, "{value}"),
            Value::Float(value) => write!(f, "{value}"),
            Value::Str(value) => write!(f, "{value}"),
            Value::Buckets(buckets) => {
                write!(f, "count={} sum={}", buckets.count(), buckets.sum())
            }
        }
    }
}

/// Value plus the time it was last written.
#[derive(Clone, Debug)]
pub struct Datum {
    value: Value,
    last_update: i64,
}

impl Datum {
    fn new(value: Value) -> Datum {
        Datum {
            value,
            last_update: 0,
        }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn last_update(&self) -> i64 {
        self.last_update
    }

    /// Add to a numeric datum. The caller guards counter monotonicity.
    pub fn add(&mut self, delta: &Value, timestamp: i64) {
        match (&mut self.value, delta) {
            (Value::Int(value), Value::Int(delta)) => *value = value.wrapping_add(*delta),
            (Value::Float(value), Value::Float(delta)) => *value += delta,
            (Value::Float(value), Value::Int(delta)) => *value += *delta as f64,
            _ => (),
        }
        self.last_update = timestamp;
    }

    pub fn set(&mut self, value: Value, timestamp: i64) {
        self.value = value;
        self.last_update = timestamp;
    }

    pub fn observe(&mut self, sample: f64, timestamp: i64) {
        if let Value::Buckets(buckets) = &mut self.value {
            buckets.observe(sample);
        }
        self.last_update = timestamp;
    }

    fn stale(&self, now: i64, ttl: Duration) -> bool {
        !ttl.is_zero() && now.saturating_sub(self.last_update) > ttl.as_secs() as i64
    }
}

/// Where a metric was declared, for export attribution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricSource {
    pub file: String,
    pub line: u32,
}

/// Everything that identifies a metric. Two declarations of the same key must
/// agree on kind, value representation, label keys and buckets.
#[derive(Clone, Debug)]
pub struct MetricDesc {
    pub program: String,
    pub name: String,
    pub kind: MetricKind,
    pub value_kind: ValueKind,
    pub label_keys: Vec<String>,
    pub buckets: Option<Vec<f64>>,
    pub hidden: bool,
    pub export_name: Option<String>,
    pub source: Option<MetricSource>,
    pub ttl: Duration,
}

impl MetricDesc {
    /// Plain counter descriptor, used for the self-monitoring metrics.
    pub fn counter(program: &str, name: &str, label_keys: &[&str]) -> MetricDesc {
        MetricDesc {
            program: program.to_string(),
            name: name.to_string(),
            kind: MetricKind::Counter,
            value_kind: ValueKind::Int,
            label_keys: label_keys.iter().map(|key| key.to_string()).collect(),
            buckets: None,
            hidden: false,
            export_name: None,
            source: None,
            ttl: Duration::ZERO,
        }
    }

    fn compatible_with(&self, other: &MetricDesc) -> bool {
        self.kind == other.kind
            && self.value_kind == other.value_kind
            && self.label_keys == other.label_keys
            && self.buckets == other.buckets
    }
}

/// A live metric: immutable descriptor plus the labelled datums.
///
/// The datum map takes a read lock for lookup and a write lock for insertion,
/// each datum has its own lock, so writers on disjoint datums do not contend.
pub struct Metric {
    desc: MetricDesc,
    ttl_secs: AtomicU64,
    datums: RwLock<HashMap<Vec<String>, Arc<Mutex<Datum>>>>,
    owners: Mutex<Vec<String>>,
}

impl Metric {
    fn new(desc: MetricDesc) -> Metric {
        let ttl_secs = AtomicU64::new(desc.ttl.as_secs());
        Metric {
            desc,
            ttl_secs,
            datums: RwLock::new(HashMap::new()),
            owners: Mutex::new(Vec::new()),
        }
    }

    pub fn desc(&self) -> &MetricDesc {
        &self.desc
    }

    pub fn name(&self) -> &str {
        &self.desc.name
    }

    pub fn kind(&self) -> MetricKind {
        self.desc.kind
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs.load(Ordering::Relaxed))
    }

    fn set_ttl(&self, ttl: Duration) {
        self.ttl_secs.store(ttl.as_secs(), Ordering::Relaxed);
    }

    fn add_owner(&self, program: &str) {
        let mut owners = self.owners.lock().expect("owner lock poisoned");
        if !owners.iter().any(|owner| owner == program) {
            owners.push(program.to_string());
        }
    }

    fn remove_owner(&self, program: &str) -> bool {
        let mut owners = self.owners.lock().expect("owner lock poisoned");
        owners.retain(|owner| owner != program);
        owners.is_empty()
    }

    fn orphaned(&self) -> bool {
        self.owners.lock().expect("owner lock poisoned").is_empty()
    }

    /// Resolve the datum for a label tuple, creating it on miss.
    pub fn datum(&self, label_values: &[String]) -> Result<Arc<Mutex<Datum>>, Error> {
        let arity = self.desc.label_keys.len();
        if label_values.len() != arity {
            return Err(Error::LabelArity(
                self.desc.name.clone(),
                arity,
                label_values.len(),
            ));
        }
        self.find_or_create_datum(label_values)
    }

    /// Run `action` on the datum for the label tuple, creating it on miss.
    pub fn with_datum<F, R>(&self, label_values: &[String], action: F) -> Result<R, Error>
    where
        F: FnOnce(&mut Datum) -> R,
    {
        let datum = self.datum(label_values)?;
        let mut datum = datum.lock().expect("datum lock poisoned");
        Ok(action(&mut datum))
    }

    fn find_or_create_datum(
        &self,
        label_values: &[String],
    ) -> Result<Arc<Mutex<Datum>>, Error> {
        if let Some(datum) = self
            .datums
            .read()
            .expect("datum map lock poisoned")
            .get(label_values)
        {
            return Ok(datum.clone());
        }
        let mut datums = self.datums.write().expect("datum map lock poisoned");
        match datums.get(label_values) {
            Some(datum) => Ok(datum.clone()),
            None => {
                let zero = Value::zero(self.desc.value_kind, self.desc.buckets.as_deref())?;
                let datum = Arc::new(Mutex::new(Datum::new(zero)));
                datums.insert(label_values.to_vec(), datum.clone());
                Ok(datum)
            }
        }
    }

    /// Remove the datum for the label tuple. Missing datums are not an error.
    pub fn remove_datum(&self, label_values: &[String]) -> Result<(), Error> {
        let arity = self.desc.label_keys.len();
        if label_values.len() != arity {
            return Err(Error::LabelArity(
                self.desc.name.clone(),
                arity,
                label_values.len(),
            ));
        }
        self.datums
            .write()
            .expect("datum map lock poisoned")
            .remove(label_values);
        Ok(())
    }

    /// Drop stale datums, returning how many were removed.
    fn gc(&self, now: i64) -> usize {
        let ttl = self.ttl();
        if ttl.is_zero() {
            return 0;
        }
        let mut datums = self.datums.write().expect("datum map lock poisoned");
        let before = datums.len();
        datums.retain(|_, datum| {
            !datum.lock().expect("datum lock poisoned").stale(now, ttl)
        });
        before - datums.len()
    }

    fn datum_count(&self) -> usize {
        self.datums.read().expect("datum map lock poisoned").len()
    }

    fn snapshot_datums(&self) -> Vec<(Vec<String>, Datum)> {
        let datums = self.datums.read().expect("datum map lock poisoned");
        let mut out: Vec<(Vec<String>, Datum)> = datums
            .iter()
            .map(|(labels, datum)| {
                (
                    labels.clone(),
                    datum.lock().expect("datum lock poisoned").clone(),
                )
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

#[cfg(test)]
mod tests {

    use std::time::Duration;

    use super::{BucketCounts, Datum, Metric, MetricDesc, Value};

    fn counter_by(label_keys: &[&str]) -> Metric {
        Metric::new(MetricDesc::counter("prog", "requests", label_keys))
    }

    #[test]
    fn datum_created_on_first_use() {
        let metric = counter_by(&["method"]);
        let labels = vec![String::from("GET")];
        metric
            .with_datum(&labels, |datum| datum.add(&Value::Int(1), 7))
            .unwrap();
        metric
            .with_datum(&labels, |datum| datum.add(&Value::Int(2), 8))
            .unwrap();
        let value = metric
            .with_datum(&labels, |datum| datum.value().clone())
            .unwrap();
        assert_eq!(Value::Int(3), value);
    }

    #[test]
    fn arity_is_enforced() {
        let metric = counter_by(&["method", "code"]);
        let labels = vec![String::from("GET")];
        assert!(metric.with_datum(&labels, |_| ()).is_err());
        assert!(metric.remove_datum(&labels).is_err());
    }

    #[test]
    fn stale_datums_are_collected() {
        let metric = counter_by(&["ip"]);
        metric.set_ttl(Duration::from_secs(60));
        let labels = vec![String::from("1.1.1.1")];
        metric
            .with_datum(&labels, |datum| datum.add(&Value::Int(1), 0))
            .unwrap();
        assert_eq!(0, metric.gc(30));
        assert_eq!(1, metric.gc(120));
        assert_eq!(0, metric.datum_count());
    }

    #[test]
    fn zero_ttl_never_stale() {
        let metric = counter_by(&["ip"]);
        let labels = vec![String::from("1.1.1.1")];
        metric
            .with_datum(&labels, |datum| datum.add(&Value::Int(1), 0))
            .unwrap();
        assert_eq!(0, metric.gc(i64::MAX));
        assert_eq!(1, metric.datum_count());
    }

    #[test]
    fn histogram_observations() {
        let mut buckets = BucketCounts::new(&[1.0, 2.0, 4.0]).unwrap();
        buckets.observe(0.5);
        buckets.observe(1.5);
        buckets.observe(10.0);
        assert_eq!(&[1, 1, 0, 1], buckets.counts());
        assert_eq!(vec![1, 2, 2, 3], buckets.cumulative());
        assert_eq!(3, buckets.count());
        assert_eq!(12.0, buckets.sum());
    }

    #[test]
    fn buckets_must_increase() {
        assert!(BucketCounts::new(&[1.0, 1.0]).is_err());
        assert!(BucketCounts::new(&[]).is_err());
    }

    #[test]
    fn datum_set_updates_timestamp() {
        let mut datum = Datum::new(Value::Int(0));
        datum.set(Value::Int(5), 1_700_000_000);
        assert_eq!(1_700_000_000, datum.last_update());
        assert_eq!(&Value::Int(5), datum.value());
    }
}

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

//! The per-program stack machine.
//!
//! One `Vm` executes one compiled program against every incoming log line.
//! Runtime errors are confined to the current line: the error is counted and
//! logged, already committed metric mutations stay, and the machine is ready
//! for the next line.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, Utc};
use log::warn;
use std::cmp::Ordering;
use std::sync::{Arc, Mutex};
use thiserror::Error;

pub mod opcode;

use crate::clock::now_epoch;
use crate::metrics::{Datum, MetricKind, Value};
use crate::program::CompiledProgram;
use crate::tailer::LogLine;
use opcode::{CmpOp, CmpType, NumType, Op};

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("division by zero")]
    DivideByZero,
    #[error("integer overflow")]
    Overflow,
    #[error("negative exponent")]
    NegativeExponent,
    #[error("${0}: no capture for group")]
    NoMatch(u16),
    #[error("{0:?}: not a valid integer in base {1}")]
    Strtol(String, i64),
    #[error("{0:?}: cannot parse timestamp with format {1:?}")]
    Strptime(String, String),
    #[error("{0}: counter cannot decrease")]
    CounterDecrease(String),
    #[error(transparent)]
    Metric(#[from] crate::metrics::Error),
    #[error("internal error: {0}")]
    Internal(&'static str),
}

/// A value on the operand stack.
#[derive(Clone, Debug)]
enum Cell {
    Int(i64),
    Float(f64),
    Str(String),
    /// Index into the program's metric handles.
    Metric(usize),
    /// A resolved datum plus the metric it belongs to.
    Datum(Arc<Mutex<Datum>>, usize),
}

/// Per-line execution state, reset before every line.
struct Frame {
    stack: Vec<Cell>,
    /// Capture slots; slot 0 always holds the input line.
    caps: Vec<Option<String>>,
    locals: Vec<i64>,
    /// Effective timestamp for metric updates.
    ts: i64,
    pc: usize,
}

impl Frame {
    fn new(cap_slots: usize, locals: usize) -> Frame {
        Frame {
            stack: Vec::with_capacity(16),
            caps: vec![None; cap_slots.max(1)],
            locals: vec![0; locals],
            ts: 0,
            pc: 0,
        }
    }

    fn reset(&mut self, line: &LogLine, now: i64) {
        self.stack.clear();
        self.caps.fill(None);
        self.caps[0] = Some(line.text.clone());
        self.locals.fill(0);
        self.ts = now;
        self.pc = 0;
    }
}

/// Virtual machine bound to one compiled program.
pub struct Vm {
    program: Arc<CompiledProgram>,
    /// `prog_runtime_errors` handle and its label tuple.
    runtime_errors: Option<(Arc<crate::metrics::Metric>, Vec<String>)>,
    override_timezone: Option<FixedOffset>,
    syslog_use_current_year: bool,
    frame: Frame,
}

impl Vm {
    pub fn new(
        program: Arc<CompiledProgram>,
        runtime_errors: Option<Arc<crate::metrics::Metric>>,
        override_timezone: Option<FixedOffset>,
        syslog_use_current_year: bool,
    ) -> Vm {
        let frame = Frame::new(program.cap_slots(), program.locals());
        let labels = vec![program.name().clone()];
        Vm {
            program,
            runtime_errors: runtime_errors.map(|metric| (metric, labels)),
            override_timezone,
            syslog_use_current_year,
            frame,
        }
    }

    pub fn program(&self) -> &Arc<CompiledProgram> {
        &self.program
    }

    /// Execute the program against one line. Returns false on runtime error.
    pub fn run(&mut self, line: &LogLine) -> bool {
        self.frame.reset(line, now_epoch());
        match self.execute(line) {
            Ok(()) => true,
            Err(error) => {
                warn!(
                    "{}:{}: runtime error: {error}",
                    self.program.name(),
                    self.program.line_for(self.frame.pc),
                );
                if let Some((metric, labels)) = &self.runtime_errors {
                    let now = self.frame.ts;
                    let _ = metric.with_datum(labels, |datum| {
                        datum.add(&Value::Int(1), now)
                    });
                }
                false
            }
        }
    }

    fn pop(&mut self) -> Result<Cell, RuntimeError> {
        self.frame
            .stack
            .pop()
            .ok_or(RuntimeError::Internal("stack underflow"))
    }

    fn pop_int(&mut self) -> Result<i64, RuntimeError> {
        match self.pop()? {
            Cell::Int(value) => Ok(value),
            Cell::Float(value) => Ok(value as i64),
            _ => Err(RuntimeError::Internal("integer expected")),
        }
    }

    fn pop_float(&mut self) -> Result<f64, RuntimeError> {
        match self.pop()? {
            Cell::Float(value) => Ok(value),
            Cell::Int(value) => Ok(value as f64),
            _ => Err(RuntimeError::Internal("float expected")),
        }
    }

    fn pop_str(&mut self) -> Result<String, RuntimeError> {
        match self.pop()? {
            Cell::Str(value) => Ok(value),
            Cell::Int(value) => Ok(value.to_string()),
            Cell::Float(value) => Ok(value.to_string()),
            _ => Err(RuntimeError::Internal("string expected")),
        }
    }

    fn pop_datum(&mut self) -> Result<(Arc<Mutex<Datum>>, usize), RuntimeError> {
        match self.pop()? {
            Cell::Datum(datum, metric) => Ok((datum, metric)),
            _ => Err(RuntimeError::Internal("datum expected")),
        }
    }

    /// Pop `arity` label values, stringified, in push order.
    fn pop_labels(&mut self, arity: u8) -> Result<Vec<String>, RuntimeError> {
        let mut labels = Vec::with_capacity(arity as usize);
        for _ in 0..arity {
            labels.push(self.pop_str()?);
        }
        labels.reverse();
        Ok(labels)
    }

    fn push(&mut self, cell: Cell) {
        self.frame.stack.push(cell);
    }

    fn push_bool(&mut self, value: bool) {
        self.push(Cell::Int(value as i64));
    }

    fn metric_kind(&self, index: usize) -> MetricKind {
        self.program.metrics()[index].kind()
    }

    fn int_binop<F>(&mut self, op: F) -> Result<(), RuntimeError>
    where
        F: FnOnce(i64, i64) -> Result<i64, RuntimeError>,
    {
        let right = self.pop_int()?;
        let left = self.pop_int()?;
        let result = op(left, right)?;
        self.push(Cell::Int(result));
        Ok(())
    }

    fn float_binop<F>(&mut self, op: F) -> Result<(), RuntimeError>
    where
        F: FnOnce(f64, f64) -> f64,
    {
        let right = self.pop_float()?;
        let left = self.pop_float()?;
        let result = op(left, right);
        self.push(Cell::Float(result));
        Ok(())
    }

    fn execute(&mut self, line: &LogLine) -> Result<(), RuntimeError> {
        let program = self.program.clone();
        let ops = program.ops();
        while self.frame.pc < ops.len() {
            let op = ops[self.frame.pc];
            match op {
                Op::PushInt(value) => self.push(Cell::Int(value)),
                Op::PushFloat(value) => self.push(Cell::Float(value)),
                Op::PushStr(index) => {
                    self.push(Cell::Str(program.strings()[index as usize].clone()))
                }
                Op::LoadLocal(slot) => {
                    let value = self.frame.locals[slot as usize];
                    self.push(Cell::Int(value));
                }
                Op::StoreLocal(slot) => {
                    let value = self.pop_int()?;
                    self.frame.locals[slot as usize] = value;
                }
                Op::Add(NumType::Int) => self.int_binop(|a, b| Ok(a.wrapping_add(b)))?,
                Op::Sub(NumType::Int) => self.int_binop(|a, b| Ok(a.wrapping_sub(b)))?,
                Op::Mul(NumType::Int) => self.int_binop(|a, b| Ok(a.wrapping_mul(b)))?,
                Op::Div(NumType::Int) => self.int_binop(|a, b| {
                    if b == 0 {
                        Err(RuntimeError::DivideByZero)
                    } else {
                        Ok(a.wrapping_div(b))
                    }
                })?,
                Op::Mod(NumType::Int) => self.int_binop(|a, b| {
                    if b == 0 {
                        Err(RuntimeError::DivideByZero)
                    } else {
                        Ok(a.wrapping_rem(b))
                    }
                })?,
                Op::Pow(NumType::Int) => self.int_binop(|a, b| {
                    if b < 0 {
                        Err(RuntimeError::NegativeExponent)
                    } else {
                        let exponent =
                            u32::try_from(b).map_err(|_| RuntimeError::Overflow)?;
                        a.checked_pow(exponent).ok_or(RuntimeError::Overflow)
                    }
                })?,
                Op::Add(NumType::Float) => self.float_binop(|a, b| a + b)?,
                Op::Sub(NumType::Float) => self.float_binop(|a, b| a - b)?,
                Op::Mul(NumType::Float) => self.float_binop(|a, b| a * b)?,
                Op::Div(NumType::Float) => self.float_binop(|a, b| a / b)?,
                Op::Mod(NumType::Float) => self.float_binop(|a, b| a % b)?,
                Op::Pow(NumType::Float) => self.float_binop(|a, b| a.powf(b))?,
                Op::Neg(NumType::Int) => {
                    let value = self.pop_int()?;
                    self.push(Cell::Int(value.wrapping_neg()));
                }
                Op::Neg(NumType::Float) => {
                    let value = self.pop_float()?;
                    self.push(Cell::Float(-value));
                }
                Op::I2f => {
                    let value = self.pop_float()?;
                    self.push(Cell::Float(value));
                }
                Op::Concat => {
                    let right = self.pop_str()?;
                    let left = self.pop_str()?;
                    self.push(Cell::Str(left + &right));
                }
                Op::Shl => self.int_binop(|a, b| Ok(a.wrapping_shl(b as u32 & 63)))?,
                Op::Shr => self.int_binop(|a, b| Ok(a.wrapping_shr(b as u32 & 63)))?,
                Op::BitAnd => self.int_binop(|a, b| Ok(a & b))?,
                Op::BitOr => self.int_binop(|a, b| Ok(a | b))?,
                Op::BitXor => self.int_binop(|a, b| Ok(a ^ b))?,
                Op::BitNot => {
                    let value = self.pop_int()?;
                    self.push(Cell::Int(!value));
                }
                Op::Cmp(ty, op) => {
                    let ordering = match ty {
                        CmpType::Int => {
                            let right = self.pop_int()?;
                            let left = self.pop_int()?;
                            left.cmp(&right)
                        }
                        CmpType::Float => {
                            let right = self.pop_float()?;
                            let left = self.pop_float()?;
                            left.partial_cmp(&right).unwrap_or(Ordering::Less)
                        }
                        CmpType::Str => {
                            let right = self.pop_str()?;
                            let left = self.pop_str()?;
                            left.cmp(&right)
                        }
                    };
                    self.push_bool(match op {
                        CmpOp::Lt => ordering == Ordering::Less,
                        CmpOp::Le => ordering != Ordering::Greater,
                        CmpOp::Gt => ordering == Ordering::Greater,
                        CmpOp::Ge => ordering != Ordering::Less,
                        CmpOp::Eq => ordering == Ordering::Equal,
                        CmpOp::Ne => ordering != Ordering::Equal,
                    });
                }
                Op::Not => {
                    let value = self.pop_int()?;
                    self.push_bool(value == 0);
                }
                Op::And => {
                    let right = self.pop_int()?;
                    let left = self.pop_int()?;
                    self.push_bool(left != 0 && right != 0);
                }
                Op::Or => {
                    let right = self.pop_int()?;
                    let left = self.pop_int()?;
                    self.push_bool(left != 0 || right != 0);
                }
                Op::Jmp(target) => {
                    self.frame.pc = target as usize;
                    continue;
                }
                Op::JmpIfFalse(target) => {
                    let value = self.pop_int()?;
                    if value == 0 {
                        self.frame.pc = target as usize;
                        continue;
                    }
                }
                Op::Match(index) => {
                    let operand = self.pop_str()?;
                    let entry = &program.regexes()[index as usize];
                    match entry.regex.captures(&operand) {
                        Some(captures) => {
                            // Slot 0 stays bound to the input line.
                            for group in 1..entry.group_count {
                                self.frame.caps[group] = captures
                                    .get(group)
                                    .map(|capture| capture.as_str().to_string());
                            }
                            self.push_bool(true);
                        }
                        None => self.push_bool(false),
                    }
                }
                Op::CapRef(slot) => {
                    let value = self.frame.caps[slot as usize].clone();
                    match value {
                        Some(value) => self.push(Cell::Str(value)),
                        None => return Err(RuntimeError::NoMatch(slot)),
                    }
                }
                Op::MLoad(index) => self.push(Cell::Metric(index as usize)),
                Op::DLoad(arity) => {
                    let labels = self.pop_labels(arity)?;
                    let Cell::Metric(index) = self.pop()? else {
                        return Err(RuntimeError::Internal("metric expected"));
                    };
                    let datum = program.metrics()[index].datum(&labels)?;
                    self.push(Cell::Datum(datum, index));
                }
                Op::DGet => {
                    let (datum, _) = self.pop_datum()?;
                    let value = datum.lock().expect("datum lock poisoned").value().clone();
                    match value {
                        Value::Int(value) => self.push(Cell::Int(value)),
                        Value::Float(value) => self.push(Cell::Float(value)),
                        Value::Str(value) => self.push(Cell::Str(value)),
                        Value::Buckets(_) => {
                            return Err(RuntimeError::Internal("histogram cannot be read"));
                        }
                    }
                }
                Op::Inc => {
                    let (datum, _) = self.pop_datum()?;
                    let ts = self.frame.ts;
                    datum
                        .lock()
                        .expect("datum lock poisoned")
                        .add(&Value::Int(1), ts);
                }
                Op::Dec => {
                    let (datum, _) = self.pop_datum()?;
                    let ts = self.frame.ts;
                    datum
                        .lock()
                        .expect("datum lock poisoned")
                        .add(&Value::Int(-1), ts);
                }
                Op::IAdd => {
                    let delta = self.pop_int()?;
                    let (datum, metric) = self.pop_datum()?;
                    if delta < 0 && self.metric_kind(metric) == MetricKind::Counter {
                        return Err(RuntimeError::CounterDecrease(
                            program.metrics()[metric].name().to_string(),
                        ));
                    }
                    let ts = self.frame.ts;
                    datum
                        .lock()
                        .expect("datum lock poisoned")
                        .add(&Value::Int(delta), ts);
                }
                Op::FAdd => {
                    let delta = self.pop_float()?;
                    let (datum, metric) = self.pop_datum()?;
                    if delta < 0.0 && self.metric_kind(metric) == MetricKind::Counter {
                        return Err(RuntimeError::CounterDecrease(
                            program.metrics()[metric].name().to_string(),
                        ));
                    }
                    let ts = self.frame.ts;
                    datum
                        .lock()
                        .expect("datum lock poisoned")
                        .add(&Value::Float(delta), ts);
                }
                Op::ISet => {
                    let value = self.pop_int()?;
                    let (datum, _) = self.pop_datum()?;
                    let ts = self.frame.ts;
                    datum
                        .lock()
                        .expect("datum lock poisoned")
                        .set(Value::Int(value), ts);
                }
                Op::FSet => {
                    let value = self.pop_float()?;
                    let (datum, _) = self.pop_datum()?;
                    let ts = self.frame.ts;
                    datum
                        .lock()
                        .expect("datum lock poisoned")
                        .set(Value::Float(value), ts);
                }
                Op::SSet => {
                    let value = self.pop_str()?;
                    let (datum, _) = self.pop_datum()?;
                    let ts = self.frame.ts;
                    datum
                        .lock()
                        .expect("datum lock poisoned")
                        .set(Value::Str(value), ts);
                }
                Op::Observe => {
                    let sample = self.pop_float()?;
                    let (datum, _) = self.pop_datum()?;
                    let ts = self.frame.ts;
                    datum
                        .lock()
                        .expect("datum lock poisoned")
                        .observe(sample, ts);
                }
                Op::SetTime => {
                    self.frame.ts = self.pop_int()?;
                }
                Op::Strptime => {
                    let format = self.pop_str()?;
                    let input = self.pop_str()?;
                    let epoch = self.strptime(&input, &format)?;
                    self.push(Cell::Int(epoch));
                }
                Op::Timestamp => {
                    let ts = self.frame.ts;
                    self.push(Cell::Int(ts));
                }
                Op::Tolower => {
                    let value = self.pop_str()?;
                    self.push(Cell::Str(value.to_lowercase()));
                }
                Op::Len => {
                    let value = self.pop_str()?;
                    self.push(Cell::Int(value.chars().count() as i64));
                }
                Op::Strtol => {
                    let base = self.pop_int()?;
                    let value = self.pop_str()?;
                    if !(2..=36).contains(&base) {
                        return Err(RuntimeError::Internal("invalid strtol base"));
                    }
                    let parsed = i64::from_str_radix(value.trim(), base as u32)
                        .map_err(|_| RuntimeError::Strtol(value, base))?;
                    self.push(Cell::Int(parsed));
                }
                Op::Getfilename => self.push(Cell::Str(line.filename.clone())),
                Op::Del(arity) => {
                    let labels = self.pop_labels(arity)?;
                    let Cell::Metric(index) = self.pop()? else {
                        return Err(RuntimeError::Internal("metric expected"));
                    };
                    program.metrics()[index].remove_datum(&labels)?;
                }
                Op::Next | Op::Halt => return Ok(()),
            }
            self.frame.pc += 1;
        }
        Ok(())
    }

    /// Parse a timestamp the way C strptime would, with two extensions: a
    /// configured fixed offset applies to zone-less inputs, and syslog-style
    /// inputs missing the year can borrow the current one.
    fn strptime(&self, input: &str, format: &str) -> Result<i64, RuntimeError> {
        if let Ok(datetime) = DateTime::parse_from_str(input, format) {
            return Ok(datetime.timestamp());
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
            return Ok(self.epoch_of(naive));
        }
        if self.syslog_use_current_year {
            let input = format!("{} {input}", Utc::now().year());
            let format = format!("%Y {format}");
            if let Ok(naive) = NaiveDateTime::parse_from_str(&input, &format) {
                return Ok(self.epoch_of(naive));
            }
        }
        if let Ok(date) = NaiveDate::parse_from_str(input, format) {
            if let Some(naive) = date.and_hms_opt(0, 0, 0) {
                return Ok(self.epoch_of(naive));
            }
        }
        Err(RuntimeError::Strptime(
            input.to_string(),
            format.to_string(),
        ))
    }

    fn epoch_of(&self, naive: NaiveDateTime) -> i64 {
        match self.override_timezone {
            Some(offset) => naive
                .and_local_timezone(offset)
                .single()
                .map(|datetime| datetime.timestamp())
                .unwrap_or_else(|| naive.and_utc().timestamp()),
            None => naive.and_utc().timestamp(),
        }
    }
}

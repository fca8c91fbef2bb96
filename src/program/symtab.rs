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

use regex_lite::Regex;
use std::collections::HashMap;
use std::time::Duration;

use super::Diagnostic;
use super::ast::{Ast, Block, Expr, ExprKind, Item, MetricDecl, PatternExpr, Stmt};
use crate::metrics::{MetricKind, ValueKind};

/// A declared metric, with the value representation refined by the checker.
#[derive(Clone, Debug)]
pub struct MetricSym {
    pub decl: MetricDecl,
    pub value_kind: ValueKind,
    pub ttl: Duration,
}

/// A compiled regex with its capture group layout.
#[derive(Debug)]
pub struct RegexEntry {
    pub source: String,
    pub regex: Regex,
    /// Number of capture groups including the implicit group 0.
    pub group_count: usize,
    pub names: HashMap<String, usize>,
}

/// Symbols of one program: metrics, pattern constants and the regex table.
#[derive(Debug, Default)]
pub struct SymbolTable {
    pub metrics: Vec<MetricSym>,
    metric_index: HashMap<String, usize>,
    consts: HashMap<String, String>,
    pub regexes: Vec<RegexEntry>,
    regex_index: HashMap<String, usize>,
}

impl SymbolTable {
    pub fn metric(&self, name: &str) -> Option<usize> {
        self.metric_index.get(name).copied()
    }

    pub fn regex(&self, index: usize) -> &RegexEntry {
        &self.regexes[index]
    }

    /// Widest capture group count over the whole table, sizing the VM frame.
    pub fn max_groups(&self) -> usize {
        self.regexes
            .iter()
            .map(|entry| entry.group_count)
            .max()
            .unwrap_or(1)
    }
}

/// First checker pass: collect declarations and compile every pattern,
/// assigning regex table indices to the match sites in the tree.
pub fn build(ast: &mut Ast) -> (SymbolTable, Vec<Diagnostic>) {
    let mut builder = Builder {
        table: SymbolTable::default(),
        errors: Vec::new(),
    };
    builder.collect_decls(ast);
    for item in &mut ast.items {
        if let Item::Stmt(stmt) = item {
            builder.stmt(stmt);
        }
    }
    (builder.table, builder.errors)
}

struct Builder {
    table: SymbolTable,
    errors: Vec<Diagnostic>,
}

impl Builder {
    fn collect_decls(&mut self, ast: &Ast) {
        for item in &ast.items {
            match item {
                Item::Metric(decl) => self.metric_decl(decl),
                Item::Const(decl) => {
                    if self.table.consts.contains_key(&decl.name) {
                        self.errors.push(Diagnostic {
                            pos: decl.span.start,
                            message: format!("{}: duplicate pattern constant", decl.name),
                        });
                    } else if let Some(source) = self.resolve(&decl.pattern) {
                        self.table.consts.insert(decl.name.clone(), source);
                    }
                }
                Item::Stmt(_) => (),
            }
        }
    }

    fn metric_decl(&mut self, decl: &MetricDecl) {
        if self.table.metric_index.contains_key(&decl.name) {
            self.errors.push(Diagnostic {
                pos: decl.span.start,
                message: format!("{}: duplicate metric", decl.name),
            });
            return;
        }
        if !decl.buckets.is_empty() && decl.buckets.windows(2).any(|w| w[0] >= w[1]) {
            self.errors.push(Diagnostic {
                pos: decl.span.start,
                message: format!("{}: buckets must be strictly increasing", decl.name),
            });
        }
        if decl.kind == MetricKind::Histogram && decl.buckets.is_empty() {
            self.errors.push(Diagnostic {
                pos: decl.span.start,
                message: format!("{}: histogram requires a buckets clause", decl.name),
            });
        }
        let value_kind = match decl.kind {
            MetricKind::Counter | MetricKind::Gauge | MetricKind::Timer => ValueKind::Int,
            MetricKind::Text => ValueKind::Str,
            MetricKind::Histogram => ValueKind::Buckets,
        };
        let index = self.table.metrics.len();
        self.table.metrics.push(MetricSym {
            decl: decl.clone(),
            value_kind,
            ttl: Duration::ZERO,
        });
        self.table.metric_index.insert(decl.name.clone(), index);
    }

    /// Resolve a pattern expression into the final regex source.
    fn resolve(&mut self, pattern: &PatternExpr) -> Option<String> {
        match pattern {
            PatternExpr::Literal(source, _) => Some(source.clone()),
            PatternExpr::Const(name, span) => match self.table.consts.get(name) {
                Some(source) => Some(source.clone()),
                None => {
                    self.errors.push(Diagnostic {
                        pos: span.start,
                        message: format!("{name}: undefined pattern constant"),
                    });
                    None
                }
            },
            PatternExpr::Concat(left, right) => {
                let left = self.resolve(left)?;
                let right = self.resolve(right)?;
                Some(format!("{left}{right}"))
            }
        }
    }

    /// Compile a pattern into the regex table, deduplicating by source.
    fn intern(&mut self, pattern: &PatternExpr) -> Option<usize> {
        let source = self.resolve(pattern)?;
        if let Some(index) = self.table.regex_index.get(&source) {
            return Some(*index);
        }
        match Regex::new(&source) {
            Ok(regex) => {
                let names: HashMap<String, usize> = regex
                    .capture_names()
                    .enumerate()
                    .filter_map(|(group, name)| {
                        name.map(|name| (name.to_string(), group))
                    })
                    .collect();
                let index = self.table.regexes.len();
                self.table.regexes.push(RegexEntry {
                    source: source.clone(),
                    group_count: regex.captures_len(),
                    regex,
                    names,
                });
                self.table.regex_index.insert(source, index);
                Some(index)
            }
            Err(error) => {
                self.errors.push(Diagnostic {
                    pos: pattern.span().start,
                    message: format!("invalid regex: {error}"),
                });
                None
            }
        }
    }

    fn block(&mut self, block: &mut Block) {
        for stmt in block {
            self.stmt(stmt);
        }
    }

    fn stmt(&mut self, stmt: &mut Stmt) {
        match stmt {
            Stmt::Cond {
                cond,
                then_block,
                else_block,
                ..
            } => {
                self.expr(cond);
                self.block(then_block);
                if let Some(else_block) = else_block {
                    self.block(else_block);
                }
            }
            Stmt::Otherwise { block, .. } => self.block(block),
            Stmt::Del { index, .. } => {
                for expr in index {
                    self.expr(expr);
                }
            }
            Stmt::Assign { target, value, .. } | Stmt::AddAssign { target, value, .. } => {
                for expr in &mut target.index {
                    self.expr(expr);
                }
                self.expr(value);
            }
            Stmt::Inc { target, .. } | Stmt::Dec { target, .. } => {
                for expr in &mut target.index {
                    self.expr(expr);
                }
            }
            Stmt::Expr { expr, .. } => self.expr(expr),
            Stmt::Next { .. } => (),
        }
    }

    fn expr(&mut self, expr: &mut Expr) {
        match &mut expr.kind {
            ExprKind::Match {
                pattern,
                operand,
                index,
                ..
            } => {
                *index = self.intern(pattern);
                if let Some(operand) = operand {
                    self.expr(operand);
                }
            }
            ExprKind::Binary { left, right, .. } => {
                self.expr(left);
                self.expr(right);
            }
            ExprKind::Unary { operand, .. } => self.expr(operand),
            ExprKind::Call { args, .. } => {
                for arg in args {
                    self.expr(arg);
                }
            }
            ExprKind::MetricRead(lval) => {
                for expr in &mut lval.index {
                    self.expr(expr);
                }
            }
            ExprKind::Int(_)
            | ExprKind::Float(_)
            | ExprKind::Str(_)
            | ExprKind::Capref(_) => (),
        }
    }
}

#[cfg(test)]
mod tests {

    use super::super::lexer::lex;
    use super::super::parser::parse;
    use super::build;
    use crate::metrics::ValueKind;

    fn symbols(source: &str) -> (super::SymbolTable, Vec<String>) {
        let (tokens, lex_errors) = lex(source);
        assert!(lex_errors.is_empty());
        let (mut ast, parse_errors) = parse(tokens);
        assert!(parse_errors.is_empty(), "parse errors: {parse_errors:?}");
        let (table, errors) = build(&mut ast);
        (table, errors.into_iter().map(|d| d.message).collect())
    }

    #[test]
    fn metrics_are_collected() {
        let (table, errors) = symbols("counter a\ngauge b by x\ntext c\n");
        assert!(errors.is_empty());
        assert_eq!(3, table.metrics.len());
        assert_eq!(Some(0), table.metric("a"));
        assert_eq!(ValueKind::Str, table.metrics[table.metric("c").unwrap()].value_kind);
    }

    #[test]
    fn duplicate_metric_is_reported() {
        let (_, errors) = symbols("counter a\ncounter a\n");
        assert_eq!(1, errors.len());
        assert!(errors[0].contains("duplicate metric"));
    }

    #[test]
    fn histogram_without_buckets_is_reported() {
        let (_, errors) = symbols("histogram h\n");
        assert!(errors[0].contains("buckets"));
    }

    #[test]
    fn regexes_are_deduplicated() {
        let (table, errors) = symbols("/abc/ {\n  next\n}\n/abc/ {\n  next\n}\n");
        assert!(errors.is_empty());
        assert_eq!(1, table.regexes.len());
    }

    #[test]
    fn const_concatenation_resolves() {
        let (table, errors) = symbols("const A /foo/\nconst B A + /bar/\n/x/ + B {\n  next\n}\n");
        assert!(errors.is_empty());
        assert_eq!(1, table.regexes.len());
        assert_eq!("xfoobar", table.regexes[0].source);
    }

    #[test]
    fn undefined_const_is_reported() {
        let (_, errors) = symbols("/x/ + MISSING {\n  next\n}\n");
        assert!(errors[0].contains("undefined pattern constant"));
    }

    #[test]
    fn invalid_regex_is_reported() {
        let (_, errors) = symbols("/(unclosed/ {\n  next\n}\n");
        assert_eq!(1, errors.len());
        assert!(errors[0].contains("invalid regex"));
    }

    #[test]
    fn capture_names_are_indexed() {
        let (table, errors) = symbols("/(?<method>GET|POST) (\\S+)/ {\n  next\n}\n");
        assert!(errors.is_empty());
        let entry = &table.regexes[0];
        assert_eq!(3, entry.group_count);
        assert_eq!(Some(&1), entry.names.get("method"));
        assert_eq!(3, table.max_groups());
    }
}

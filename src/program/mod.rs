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

//! The program compiler: lexer, parser, type checker and code generator.
//!
//! Compilation accumulates diagnostics per phase. Lexing and parsing errors
//! are reported together and abort before the checker runs; checker errors
//! abort before code generation.

use getset::{CopyGetters, Getters};
use itertools::Itertools;
use log::debug;
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::Path;
use std::sync::Arc;

pub mod ast;
pub mod codegen;
pub mod lexer;
pub mod parser;
pub mod symtab;
pub mod types;

use crate::metrics::{Metric, MetricDesc, MetricSource, Store};
use crate::vm::opcode::Op;
use ast::Pos;
use symtab::RegexEntry;

/// One compile problem, located in the source file.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub pos: Pos,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.pos, self.message)
    }
}

/// All diagnostics of a failed compile attempt.
#[derive(Debug)]
pub struct CompileErrors {
    pub filename: String,
    pub errors: Vec<Diagnostic>,
}

impl std::error::Error for CompileErrors {}

impl fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            self.errors
                .iter()
                .map(|error| format!("{}:{}", self.filename, error))
                .join("\n")
        )
    }
}

/// Compile-time options, a subset of the application settings.
#[derive(Clone, Debug, Default)]
pub struct CompileOpts {
    pub dump_ast: bool,
    pub dump_ast_types: bool,
    pub dump_bytecode: bool,
    pub omit_metric_source: bool,
}

/// Content hash used to skip no-op reloads.
pub fn source_digest(source: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    source.hash(&mut hasher);
    hasher.finish()
}

/// An immutable compiled program. Virtual machines share it read-only.
#[derive(Getters, CopyGetters)]
pub struct CompiledProgram {
    #[getset(get = "pub")]
    name: String,
    #[getset(get = "pub")]
    filename: String,
    #[getset(get_copy = "pub")]
    digest: u64,
    #[getset(get = "pub")]
    ops: Vec<Op>,
    lines: Vec<u32>,
    #[getset(get = "pub")]
    strings: Vec<String>,
    #[getset(get = "pub")]
    regexes: Vec<RegexEntry>,
    #[getset(get = "pub")]
    metrics: Vec<Arc<Metric>>,
    /// Capture slots the frame needs, one per group of the widest regex.
    #[getset(get_copy = "pub")]
    cap_slots: usize,
    #[getset(get_copy = "pub")]
    locals: usize,
}

impl CompiledProgram {
    /// Source line that produced the op at `pc`, for runtime error reports.
    pub fn line_for(&self, pc: usize) -> u32 {
        self.lines.get(pc).copied().unwrap_or(0)
    }
}

impl fmt::Debug for CompiledProgram {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CompiledProgram")
            .field("name", &self.name)
            .field("ops", &self.ops.len())
            .field("metrics", &self.metrics.len())
            .finish()
    }
}

/// Run the whole pipeline over one source file and register its metrics.
///
/// The store argument makes redeclaration idempotent: recompiling a program
/// rebinds the existing metrics and their datums survive the reload.
pub fn compile(
    path: &Path,
    source: &str,
    store: &Store,
    opts: &CompileOpts,
) -> Result<CompiledProgram, CompileErrors> {
    let filename = path.display().to_string();
    let name = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| filename.clone());
    let fail = |errors| CompileErrors {
        filename: filename.clone(),
        errors,
    };

    let (tokens, mut errors) = lexer::lex(source);
    let (mut ast, parse_errors) = parser::parse(tokens);
    errors.extend(parse_errors);
    if !errors.is_empty() {
        return Err(fail(errors));
    }
    if opts.dump_ast {
        println!("{}", ast::print(&ast));
    }

    let (mut table, mut errors) = symtab::build(&mut ast);
    errors.extend(types::check(&mut ast, &mut table));
    if !errors.is_empty() {
        return Err(fail(errors));
    }
    if opts.dump_ast_types {
        println!("{}", ast::print_typed(&ast));
    }

    let code = codegen::generate(&ast, &table).map_err(&fail)?;

    let mut metrics = Vec::with_capacity(table.metrics.len());
    for sym in &table.metrics {
        let decl = &sym.decl;
        let desc = MetricDesc {
            program: name.clone(),
            name: decl.name.clone(),
            kind: decl.kind,
            value_kind: sym.value_kind,
            label_keys: decl.labels.clone(),
            buckets: (!decl.buckets.is_empty()).then(|| decl.buckets.clone()),
            hidden: decl.hidden,
            export_name: decl.export_as.clone(),
            source: (!opts.omit_metric_source).then(|| MetricSource {
                file: filename.clone(),
                line: decl.span.start.line,
            }),
            ttl: sym.ttl,
        };
        match store.find_or_create(desc) {
            Ok(metric) => metrics.push(metric),
            Err(error) => {
                return Err(fail(vec![Diagnostic {
                    pos: decl.span.start,
                    message: error.to_string(),
                }]));
            }
        }
    }

    let cap_slots = table.max_groups();
    let program = CompiledProgram {
        name,
        filename,
        digest: source_digest(source),
        ops: code.ops,
        lines: code.lines,
        strings: code.strings,
        regexes: table.regexes,
        metrics,
        cap_slots,
        locals: code.locals,
    };
    debug!(
        "{}: compiled, {} op(s), {} metric(s)",
        program.name,
        program.ops.len(),
        program.metrics.len()
    );
    if opts.dump_bytecode {
        println!("{}", disasm(&program));
    }
    Ok(program)
}

/// Human-readable bytecode listing for the dump option.
pub fn disasm(program: &CompiledProgram) -> String {
    let mut out = format!("disasm {}\n", program.name);
    for (pc, op) in program.ops.iter().enumerate() {
        let text = op.to_string();
        out.push_str(&format!(
            "{pc:4}  {text:<24} ; line {}\n",
            program.line_for(pc)
        ));
    }
    if !program.strings.is_empty() {
        out.push_str("strings:\n");
        for (index, text) in program.strings.iter().enumerate() {
            out.push_str(&format!("{index:4}  {text:?}\n"));
        }
    }
    if !program.regexes.is_empty() {
        out.push_str("regexes:\n");
        for (index, entry) in program.regexes.iter().enumerate() {
            out.push_str(&format!("{index:4}  /{}/\n", entry.source));
        }
    }
    out
}

#[cfg(test)]
mod tests {

    use std::path::Path;

    use super::{CompileOpts, compile, source_digest};
    use crate::metrics::{MetricKind, Store};

    fn store() -> Store {
        Store::new(false)
    }

    #[test]
    fn compile_registers_metrics() {
        let store = store();
        let program = compile(
            Path::new("/progs/web.lm"),
            "counter requests by method\n/(GET|POST)/ {\n  requests[$1]++\n}\n",
            &store,
            &CompileOpts::default(),
        )
        .unwrap();
        assert_eq!("web", program.name());
        assert_eq!(1, program.metrics().len());
        let metric = store.find("web", "requests").unwrap();
        assert_eq!(MetricKind::Counter, metric.kind());
        let source = metric.desc().source.clone().unwrap();
        assert_eq!("/progs/web.lm", source.file);
        assert_eq!(1, source.line);
    }

    #[test]
    fn omit_metric_source_drops_attribution() {
        let store = store();
        let opts = CompileOpts {
            omit_metric_source: true,
            ..CompileOpts::default()
        };
        let program = compile(
            Path::new("/progs/web.lm"),
            "counter requests\n",
            &store,
            &opts,
        )
        .unwrap();
        assert!(program.metrics()[0].desc().source.is_none());
    }

    #[test]
    fn lex_and_parse_errors_are_combined() {
        let store = store();
        let errors = compile(
            Path::new("/progs/bad.lm"),
            "counter\n\"unterminated\n",
            &store,
            &CompileOpts::default(),
        )
        .unwrap_err();
        assert!(errors.errors.len() >= 2, "{errors}");
    }

    #[test]
    fn type_errors_abort_compilation() {
        let store = store();
        let errors = compile(
            Path::new("/progs/bad.lm"),
            "counter c\n/x/ {\n  c = 5\n}\n",
            &store,
            &CompileOpts::default(),
        )
        .unwrap_err();
        assert_eq!(1, errors.errors.len());
    }

    #[test]
    fn recompile_reuses_existing_metrics() {
        let store = store();
        let source = "counter lines\n/.*/ {\n  lines++\n}\n";
        let path = Path::new("/progs/lines.lm");
        let first = compile(path, source, &store, &CompileOpts::default()).unwrap();
        first.metrics()[0]
            .with_datum(&[], |datum| {
                datum.add(&crate::metrics::Value::Int(3), 0)
            })
            .unwrap();
        let second = compile(path, source, &store, &CompileOpts::default()).unwrap();
        let value = second.metrics()[0]
            .with_datum(&[], |datum| datum.value().clone())
            .unwrap();
        assert_eq!(crate::metrics::Value::Int(3), value);
    }

    #[test]
    fn conflicting_redeclaration_fails() {
        let store = store();
        let path = Path::new("/progs/lines.lm");
        compile(path, "counter lines\n", &store, &CompileOpts::default()).unwrap();
        let errors = compile(
            path,
            "gauge lines\n",
            &store,
            &CompileOpts::default(),
        )
        .unwrap_err();
        assert!(errors.errors[0].message.contains("conflicting"));
    }

    #[test]
    fn digest_is_stable_and_content_sensitive() {
        assert_eq!(source_digest("abc"), source_digest("abc"));
        assert_ne!(source_digest("abc"), source_digest("abd"));
    }
}

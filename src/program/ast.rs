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

use std::fmt::{self, Write};
use std::time::Duration;
use strum::{EnumString, IntoStaticStr};

use crate::metrics::MetricKind;

/// Position in a source file, 1-based.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pos {
    pub line: u32,
    pub col: u32,
}

impl Pos {
    pub fn new(line: u32, col: u32) -> Pos {
        Pos { line, col }
    }
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// Character range of a token or node in its source file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Span {
    pub start: Pos,
    pub end: Pos,
}

impl Span {
    pub fn new(start: Pos, end: Pos) -> Span {
        Span { start, end }
    }

    /// Smallest span covering both.
    pub fn to(self, other: Span) -> Span {
        Span {
            start: self.start,
            end: other.end,
        }
    }
}

/// Types carried by expressions after checking.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Type {
    /// Not yet inferred, or statement-like.
    #[default]
    None,
    Int,
    Float,
    Str,
    Pattern,
    Timestamp,
    Buckets,
}

impl Type {
    pub fn is_numeric(self) -> bool {
        matches!(self, Type::Int | Type::Float | Type::Timestamp)
    }
}

/// A whole parsed program.
#[derive(Clone, Debug, PartialEq)]
pub struct Ast {
    pub items: Vec<Item>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Item {
    Metric(MetricDecl),
    Const(ConstDecl),
    Stmt(Stmt),
}

/// `counter requests by method, code as "http_requests"`
#[derive(Clone, Debug, PartialEq)]
pub struct MetricDecl {
    pub kind: MetricKind,
    pub hidden: bool,
    pub name: String,
    pub labels: Vec<String>,
    pub buckets: Vec<f64>,
    pub export_as: Option<String>,
    pub span: Span,
}

/// `const PREFIX /^\w+/`
#[derive(Clone, Debug, PartialEq)]
pub struct ConstDecl {
    pub name: String,
    pub pattern: PatternExpr,
    pub span: Span,
}

/// Regex literals and named constants, concatenated with `+` at compile time.
#[derive(Clone, Debug, PartialEq)]
pub enum PatternExpr {
    Literal(String, Span),
    Const(String, Span),
    Concat(Box<PatternExpr>, Box<PatternExpr>),
}

impl PatternExpr {
    pub fn span(&self) -> Span {
        match self {
            PatternExpr::Literal(_, span) | PatternExpr::Const(_, span) => *span,
            PatternExpr::Concat(left, right) => left.span().to(right.span()),
        }
    }
}

pub type Block = Vec<Stmt>;

#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    /// Pattern-action and conditional statements. A bare `/re/ { ... }` is a
    /// condition whose expression is an implicit match against the input line.
    Cond {
        cond: Expr,
        then_block: Block,
        else_block: Option<Block>,
        span: Span,
    },
    /// Runs when no preceding condition in the same block matched this line.
    Otherwise { block: Block, span: Span },
    /// Stop processing the current line.
    Next { span: Span },
    /// Remove a labelled datum, or mark the metric for expiry with `after`.
    Del {
        name: String,
        index: Vec<Expr>,
        after: Option<Duration>,
        span: Span,
    },
    Assign {
        target: Lval,
        value: Expr,
        span: Span,
    },
    AddAssign {
        target: Lval,
        value: Expr,
        span: Span,
    },
    Inc { target: Lval, span: Span },
    Dec { target: Lval, span: Span },
    Expr { expr: Expr, span: Span },
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Stmt::Cond { span, .. }
            | Stmt::Otherwise { span, .. }
            | Stmt::Next { span }
            | Stmt::Del { span, .. }
            | Stmt::Assign { span, .. }
            | Stmt::AddAssign { span, .. }
            | Stmt::Inc { span, .. }
            | Stmt::Dec { span, .. }
            | Stmt::Expr { span, .. } => *span,
        }
    }
}

/// A metric reference with its label index expressions.
#[derive(Clone, Debug, PartialEq)]
pub struct Lval {
    pub name: String,
    pub index: Vec<Expr>,
    pub span: Span,
}

/// Capture group reference: `$0`, `$2`, `$name`. The group number is resolved
/// by the type checker against the enclosing pattern.
#[derive(Clone, Debug, PartialEq)]
pub struct CapRef {
    pub name: String,
    pub group: Option<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Pow => "**",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::And => "&&",
            BinOp::Or => "||",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
        }
    }

    /// Binding power, higher binds tighter. Mirrors the parser's ladder.
    pub fn precedence(self) -> u8 {
        match self {
            BinOp::Or => 1,
            BinOp::And => 2,
            BinOp::BitOr => 3,
            BinOp::BitXor => 4,
            BinOp::BitAnd => 5,
            BinOp::Eq | BinOp::Ne => 6,
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => 7,
            BinOp::Shl | BinOp::Shr => 8,
            BinOp::Add | BinOp::Sub => 9,
            BinOp::Mul | BinOp::Div | BinOp::Mod => 10,
            BinOp::Pow => 11,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnOp {
    Not,
    Neg,
    BitNot,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Builtin {
    Strptime,
    Timestamp,
    Settime,
    Tolower,
    Len,
    Strtol,
    Getfilename,
}

impl Builtin {
    /// Number of arguments the builtin takes.
    pub fn arity(self) -> usize {
        match self {
            Builtin::Strptime | Builtin::Strtol => 2,
            Builtin::Settime | Builtin::Tolower | Builtin::Len => 1,
            Builtin::Timestamp | Builtin::Getfilename => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
    pub ty: Type,
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Expr {
        Expr {
            kind,
            span,
            ty: Type::None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExprKind {
    Int(i64),
    Float(f64),
    Str(String),
    Capref(CapRef),
    /// Value of a metric datum, usually a hidden variable.
    MetricRead(Lval),
    /// `expr =~ /re/`, `expr !~ CONST` or a bare pattern matching the line.
    Match {
        pattern: PatternExpr,
        operand: Option<Box<Expr>>,
        negated: bool,
        /// Regex table index, filled by the symbol pass.
        index: Option<usize>,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary { op: UnOp, operand: Box<Expr> },
    Call { func: Builtin, args: Vec<Expr> },
}

//
// Pretty printer
//

const INDENT: &str = "  ";

/// Render a program back to source. `parse(print(ast))` produces a
/// structurally equal tree, which the dump options and tests rely on.
pub fn print(ast: &Ast) -> String {
    let mut out = String::new();
    let mut printer = Printer::new(&mut out, false);
    printer.program(ast);
    out
}

/// Render a program with the inferred type of every expression attached.
/// Not parseable; used by the typed AST dump.
pub fn print_typed(ast: &Ast) -> String {
    let mut out = String::new();
    let mut printer = Printer::new(&mut out, true);
    printer.program(ast);
    out
}

struct Printer<'w> {
    out: &'w mut String,
    typed: bool,
    depth: usize,
}

impl<'w> Printer<'w> {
    fn new(out: &'w mut String, typed: bool) -> Printer<'w> {
        Printer {
            out,
            typed,
            depth: 0,
        }
    }

    fn line(&mut self, text: &str) {
        for _ in 0..self.depth {
            self.out.push_str(INDENT);
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn program(&mut self, ast: &Ast) {
        for item in &ast.items {
            match item {
                Item::Metric(decl) => self.metric_decl(decl),
                Item::Const(decl) => {
                    let mut text = format!("const {} ", decl.name);
                    pattern(&mut text, &decl.pattern);
                    self.line(&text);
                }
                Item::Stmt(stmt) => self.stmt(stmt),
            }
        }
    }

    fn metric_decl(&mut self, decl: &MetricDecl) {
        let mut text = String::new();
        if decl.hidden {
            text.push_str("hidden ");
        }
        text.push_str(decl.kind.as_str());
        text.push(' ');
        text.push_str(&decl.name);
        if !decl.labels.is_empty() {
            let _ = write!(text, " by {}", decl.labels.join(", "));
        }
        if !decl.buckets.is_empty() {
            let bounds: Vec<String> = decl.buckets.iter().map(|b| format!("{b:?}")).collect();
            let _ = write!(text, " buckets {}", bounds.join(", "));
        }
        if let Some(export_as) = &decl.export_as {
            let _ = write!(text, " as {}", quote(export_as));
        }
        self.line(&text);
    }

    fn block(&mut self, block: &Block) {
        self.depth += 1;
        for stmt in block {
            self.stmt(stmt);
        }
        self.depth -= 1;
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Cond {
                cond,
                then_block,
                else_block,
                ..
            } => {
                let mut text = String::new();
                self.expr(&mut text, cond, 0);
                text.push_str(" {");
                self.line(&text);
                self.block(then_block);
                match else_block {
                    Some(else_block) => {
                        self.line("} else {");
                        self.block(else_block);
                        self.line("}");
                    }
                    None => self.line("}"),
                }
            }
            Stmt::Otherwise { block, .. } => {
                self.line("otherwise {");
                self.block(block);
                self.line("}");
            }
            Stmt::Next { .. } => self.line("next"),
            Stmt::Del {
                name,
                index,
                after,
                ..
            } => {
                let mut text = format!("del {name}");
                self.index(&mut text, index);
                if let Some(after) = after {
                    let _ = write!(text, " after {}", duration(after));
                }
                self.line(&text);
            }
            Stmt::Assign { target, value, .. } => self.assign(target, "=", value),
            Stmt::AddAssign { target, value, .. } => self.assign(target, "+=", value),
            Stmt::Inc { target, .. } => {
                let mut text = String::new();
                self.lval(&mut text, target);
                text.push_str("++");
                self.line(&text);
            }
            Stmt::Dec { target, .. } => {
                let mut text = String::new();
                self.lval(&mut text, target);
                text.push_str("--");
                self.line(&text);
            }
            Stmt::Expr { expr, .. } => {
                let mut text = String::new();
                self.expr(&mut text, expr, 0);
                self.line(&text);
            }
        }
    }

    fn assign(&mut self, target: &Lval, op: &str, value: &Expr) {
        let mut text = String::new();
        self.lval(&mut text, target);
        let _ = write!(text, " {op} ");
        self.expr(&mut text, value, 0);
        self.line(&text);
    }

    fn lval(&mut self, out: &mut String, lval: &Lval) {
        out.push_str(&lval.name);
        self.index(out, &lval.index);
    }

    fn index(&mut self, out: &mut String, index: &[Expr]) {
        if !index.is_empty() {
            out.push('[');
            for (position, expr) in index.iter().enumerate() {
                if position > 0 {
                    out.push_str(", ");
                }
                self.expr(out, expr, 0);
            }
            out.push(']');
        }
    }

    /// Print an expression, parenthesizing when the context binds tighter.
    fn expr(&mut self, out: &mut String, expr: &Expr, min_prec: u8) {
        match &expr.kind {
            ExprKind::Int(value) => {
                let _ = write!(out, "{value}");
            }
            ExprKind::Float(value) => {
                let _ = write!(out, "{value:?}");
            }
            ExprKind::Str(value) => out.push_str(&quote(value)),
            ExprKind::Capref(capref) => {
                let _ = write!(out, "${}", capref.name);
            }
            ExprKind::MetricRead(lval) => self.lval(out, lval),
            ExprKind::Match {
                pattern: pat,
                operand,
                negated,
                ..
            } => match operand {
                Some(operand) => {
                    self.expr(out, operand, 13);
                    out.push_str(if *negated { " !~ " } else { " =~ " });
                    pattern(out, pat);
                }
                None => pattern(out, pat),
            },
            ExprKind::Binary { op, left, right } => {
                let prec = op.precedence();
                let wrap = prec < min_prec;
                if wrap {
                    out.push('(');
                }
                self.expr(out, left, prec);
                let _ = write!(out, " {} ", op.symbol());
                // Left associative: the right child needs one more level.
                self.expr(out, right, prec + 1);
                if wrap {
                    out.push(')');
                }
            }
            ExprKind::Unary { op, operand } => {
                out.push_str(match op {
                    UnOp::Not => "!",
                    UnOp::Neg => "-",
                    UnOp::BitNot => "~",
                });
                self.expr(out, operand, 12);
            }
            ExprKind::Call { func, args } => {
                let _ = write!(out, "{}(", func.as_str());
                for (position, arg) in args.iter().enumerate() {
                    if position > 0 {
                        out.push_str(", ");
                    }
                    self.expr(out, arg, 0);
                }
                out.push(')');
            }
        }
        if self.typed {
            let name: &'static str = expr.ty.into();
            let _ = write!(out, "<{name}>");
        }
    }
}

fn pattern(out: &mut String, pattern_expr: &PatternExpr) {
    match pattern_expr {
        PatternExpr::Literal(source, _) => {
            out.push('/');
            for c in source.chars() {
                if c == '/' {
                    out.push('\\');
                }
                out.push(c);
            }
            out.push('/');
        }
        PatternExpr::Const(name, _) => out.push_str(name),
        PatternExpr::Concat(left, right) => {
            pattern(out, left);
            out.push_str(" + ");
            pattern(out, right);
        }
    }
}

fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Format a duration the way the lexer reads them back.
fn duration(value: &Duration) -> String {
    let millis = value.as_millis();
    if millis % 1000 != 0 {
        return format!("{millis}ms");
    }
    let mut secs = value.as_secs();
    let mut out = String::new();
    for (unit, size) in [("d", 86400u64), ("h", 3600), ("m", 60)] {
        if secs >= size {
            let _ = write!(out, "{}{}", secs / size, unit);
            secs %= size;
        }
    }
    if secs > 0 || out.is_empty() {
        let _ = write!(out, "{secs}s");
    }
    out
}

#[cfg(test)]
mod tests {

    use super::*;

    fn expr(kind: ExprKind) -> Expr {
        Expr::new(kind, Span::default())
    }

    fn render(tree: &Expr) -> String {
        let mut scratch = String::new();
        let mut printer = Printer::new(&mut scratch, false);
        let mut rendered = String::new();
        printer.expr(&mut rendered, tree, 0);
        rendered
    }

    #[test]
    fn precedence_needs_no_spurious_parens() {
        // 1 + 2 * 3
        let tree = expr(ExprKind::Binary {
            op: BinOp::Add,
            left: Box::new(expr(ExprKind::Int(1))),
            right: Box::new(expr(ExprKind::Binary {
                op: BinOp::Mul,
                left: Box::new(expr(ExprKind::Int(2))),
                right: Box::new(expr(ExprKind::Int(3))),
            })),
        });
        assert_eq!("1 + 2 * 3", render(&tree));
    }

    #[test]
    fn precedence_restores_parens() {
        // (1 + 2) * 3
        let tree = expr(ExprKind::Binary {
            op: BinOp::Mul,
            left: Box::new(expr(ExprKind::Binary {
                op: BinOp::Add,
                left: Box::new(expr(ExprKind::Int(1))),
                right: Box::new(expr(ExprKind::Int(2))),
            })),
            right: Box::new(expr(ExprKind::Int(3))),
        });
        assert_eq!("(1 + 2) * 3", render(&tree));
    }

    #[test]
    fn durations_render_in_lexable_form() {
        assert_eq!("1h30m", duration(&Duration::from_secs(5400)));
        assert_eq!("250ms", duration(&Duration::from_millis(250)));
        assert_eq!("0s", duration(&Duration::ZERO));
        assert_eq!("2d", duration(&Duration::from_secs(172_800)));
        assert_eq!("1m30s", duration(&Duration::from_secs(90)));
    }

    #[test]
    fn strings_are_escaped() {
        assert_eq!(r#""a\"b\\c""#, quote("a\"b\\c"));
    }

    #[test]
    fn regex_literal_escapes_slashes() {
        let mut out = String::new();
        pattern(
            &mut out,
            &PatternExpr::Literal(String::from("a/b"), Span::default()),
        );
        assert_eq!(r"/a\/b/", out);
    }
}

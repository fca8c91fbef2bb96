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

use super::Diagnostic;
use super::ast::{
    Ast, BinOp, Block, Builtin, CapRef, Expr, ExprKind, Item, Lval, Pos, Span, Stmt, Type, UnOp,
};
use super::symtab::SymbolTable;
use crate::metrics::{MetricKind, ValueKind};

/// Second checker pass: propagate types bottom-up, resolve capture group
/// references against their enclosing patterns and refine the value
/// representation of every metric.
///
/// Assignments may promote a metric from integer to float after a read of it
/// was already typed, so the pass runs to a fixpoint. Promotion is monotone,
/// which bounds the number of rounds.
pub fn check(ast: &mut Ast, table: &mut SymbolTable) -> Vec<Diagnostic> {
    loop {
        let mut checker = Checker {
            table: &mut *table,
            errors: Vec::new(),
            scopes: Vec::new(),
            promoted: false,
        };
        for item in &mut ast.items {
            if let Item::Stmt(stmt) = item {
                checker.stmt(stmt);
            }
        }
        let promoted = checker.promoted;
        let errors = checker.errors;
        if !promoted {
            return errors;
        }
    }
}

struct Checker<'t> {
    table: &'t mut SymbolTable,
    errors: Vec<Diagnostic>,
    /// Regex indices of the enclosing patterns, innermost last.
    scopes: Vec<usize>,
    promoted: bool,
}

impl Checker<'_> {
    fn error(&mut self, pos: Pos, message: String) {
        self.errors.push(Diagnostic { pos, message });
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
                let ty = self.expr(cond);
                if !matches!(ty, Type::Int | Type::None) {
                    let name: &'static str = ty.into();
                    self.error(
                        cond.span.start,
                        format!("condition must be integer-valued, got {name}"),
                    );
                }
                let depth = self.scopes.len();
                collect_patterns(cond, &mut self.scopes);
                self.block(then_block);
                self.scopes.truncate(depth);
                if let Some(else_block) = else_block {
                    self.block(else_block);
                }
            }
            Stmt::Otherwise { block, .. } => self.block(block),
            Stmt::Next { .. } => (),
            Stmt::Del {
                name,
                index,
                after,
                span,
            } => {
                for expr in index.iter_mut() {
                    self.label_expr(expr);
                }
                match self.table.metric(name) {
                    Some(metric) => {
                        let arity = self.table.metrics[metric].decl.labels.len();
                        if index.len() != arity {
                            let message = format!(
                                "{}: expected {} label(s), got {}",
                                name,
                                arity,
                                index.len()
                            );
                            self.error(span.start, message);
                        }
                        if let Some(after) = after {
                            self.table.metrics[metric].ttl = *after;
                        }
                    }
                    None => self.error(span.start, format!("{name}: undefined metric")),
                }
            }
            Stmt::Assign {
                target,
                value,
                span,
            } => {
                let value_ty = self.expr(value);
                self.assign(target, value_ty, *span, false);
            }
            Stmt::AddAssign {
                target,
                value,
                span,
            } => {
                let value_ty = self.expr(value);
                self.assign(target, value_ty, *span, true);
            }
            Stmt::Inc { target, span } => {
                if let Some(metric) = self.lval(target) {
                    let kind = self.table.metrics[metric].decl.kind;
                    if !matches!(
                        kind,
                        MetricKind::Counter | MetricKind::Gauge | MetricKind::Timer
                    ) {
                        let message =
                            format!("{}: only numeric metrics can be incremented", target.name);
                        self.error(span.start, message);
                    }
                }
            }
            Stmt::Dec { target, span } => {
                if let Some(metric) = self.lval(target) {
                    let kind = self.table.metrics[metric].decl.kind;
                    match kind {
                        MetricKind::Counter => {
                            let message = format!(
                                "{}: counters are monotonic and cannot be decremented",
                                target.name
                            );
                            self.error(span.start, message);
                        }
                        MetricKind::Gauge | MetricKind::Timer => (),
                        _ => {
                            let message = format!(
                                "{}: only numeric metrics can be decremented",
                                target.name
                            );
                            self.error(span.start, message);
                        }
                    }
                }
            }
            Stmt::Expr { expr, .. } => {
                let ty = self.expr(expr);
                // Only side-effecting calls make sense as bare statements.
                if ty != Type::None {
                    self.error(
                        expr.span.start,
                        String::from("expression value is unused"),
                    );
                }
            }
        }
    }

    /// Check an assignment or add-assignment to a metric.
    fn assign(&mut self, target: &mut Lval, value_ty: Type, span: Span, additive: bool) {
        let Some(metric) = self.lval(target) else {
            return;
        };
        let kind = self.table.metrics[metric].decl.kind;
        match kind {
            MetricKind::Counter if !additive => {
                let message = format!(
                    "{}: counters are monotonic, use `++` or `+=`",
                    target.name
                );
                self.error(span.start, message);
            }
            MetricKind::Counter | MetricKind::Gauge | MetricKind::Timer => {
                if !value_ty.is_numeric() {
                    let name: &'static str = value_ty.into();
                    let message =
                        format!("{}: numeric value expected, got {name}", target.name);
                    self.error(span.start, message);
                } else if value_ty == Type::Float
                    && self.table.metrics[metric].value_kind == ValueKind::Int
                {
                    self.table.metrics[metric].value_kind = ValueKind::Float;
                    self.promoted = true;
                }
            }
            MetricKind::Text => {
                if additive {
                    let message =
                        format!("{}: text metrics can only be assigned", target.name);
                    self.error(span.start, message);
                } else if value_ty != Type::Str && value_ty != Type::None {
                    let name: &'static str = value_ty.into();
                    let message =
                        format!("{}: string value expected, got {name}", target.name);
                    self.error(span.start, message);
                }
            }
            MetricKind::Histogram => {
                if additive {
                    let message = format!(
                        "{}: histograms record observations with `=`",
                        target.name
                    );
                    self.error(span.start, message);
                } else if !value_ty.is_numeric() {
                    let name: &'static str = value_ty.into();
                    let message =
                        format!("{}: numeric value expected, got {name}", target.name);
                    self.error(span.start, message);
                }
            }
        }
    }

    /// Resolve an lvalue to its metric index, checking label arity.
    fn lval(&mut self, lval: &mut Lval) -> Option<usize> {
        for expr in &mut lval.index {
            self.label_expr(expr);
        }
        match self.table.metric(&lval.name) {
            Some(metric) => {
                let arity = self.table.metrics[metric].decl.labels.len();
                if lval.index.len() != arity {
                    let message = format!(
                        "{}: expected {} label(s), got {}",
                        lval.name,
                        arity,
                        lval.index.len()
                    );
                    self.error(lval.span.start, message);
                    None
                } else {
                    Some(metric)
                }
            }
            None => {
                self.error(lval.span.start, format!("{}: undefined metric", lval.name));
                None
            }
        }
    }

    /// Label expressions may be any scalar; they are stringified on use.
    fn label_expr(&mut self, expr: &mut Expr) {
        let ty = self.expr(expr);
        if matches!(ty, Type::Buckets | Type::Pattern) {
            let name: &'static str = ty.into();
            self.error(
                expr.span.start,
                format!("label value cannot be of type {name}"),
            );
        }
    }

    fn expr(&mut self, expr: &mut Expr) -> Type {
        let ty = match &mut expr.kind {
            ExprKind::Int(_) => Type::Int,
            ExprKind::Float(_) => Type::Float,
            ExprKind::Str(_) => Type::Str,
            ExprKind::Capref(capref) => {
                let span = expr.span;
                self.capref(capref, span);
                Type::Str
            }
            ExprKind::MetricRead(lval) => match self.lval(lval) {
                Some(metric) => match self.table.metrics[metric].value_kind {
                    ValueKind::Int => Type::Int,
                    ValueKind::Float => Type::Float,
                    ValueKind::Str => Type::Str,
                    ValueKind::Buckets => Type::Buckets,
                },
                None => Type::None,
            },
            ExprKind::Match { operand, .. } => {
                if let Some(operand) = operand {
                    let ty = self.expr(operand);
                    if ty != Type::Str && ty != Type::None {
                        let name: &'static str = ty.into();
                        self.error(
                            operand.span.start,
                            format!("match operand must be a string, got {name}"),
                        );
                    }
                }
                Type::Int
            }
            ExprKind::Binary { op, left, right } => {
                let op = *op;
                let left_ty = self.expr(left);
                let right_ty = self.expr(right);
                let span = expr.span;
                self.binary(op, left_ty, right_ty, span)
            }
            ExprKind::Unary { op, operand } => {
                let op = *op;
                let ty = self.expr(operand);
                let span = operand.span;
                match op {
                    UnOp::Not | UnOp::BitNot => {
                        if ty != Type::Int && ty != Type::None {
                            let name: &'static str = ty.into();
                            self.error(
                                span.start,
                                format!("integer operand expected, got {name}"),
                            );
                        }
                        Type::Int
                    }
                    UnOp::Neg => {
                        if !ty.is_numeric() && ty != Type::None {
                            let name: &'static str = ty.into();
                            self.error(
                                span.start,
                                format!("numeric operand expected, got {name}"),
                            );
                        }
                        if ty == Type::Float { Type::Float } else { Type::Int }
                    }
                }
            }
            ExprKind::Call { func, args } => {
                let func = *func;
                let span = expr.span;
                let arg_types: Vec<Type> =
                    args.iter_mut().map(|arg| self.expr(arg)).collect();
                self.call(func, &arg_types, args, span)
            }
        };
        expr.ty = ty;
        ty
    }

    fn binary(&mut self, op: BinOp, left: Type, right: Type, span: Span) -> Type {
        // Unresolved operands already produced an error; avoid cascades.
        if left == Type::None || right == Type::None {
            return Type::None;
        }
        match op {
            BinOp::Add if left == Type::Str && right == Type::Str => Type::Str,
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod | BinOp::Pow => {
                if !left.is_numeric() || !right.is_numeric() {
                    self.error(
                        span.start,
                        format!(
                            "invalid operands to `{}`: {} and {}",
                            op.symbol(),
                            <&'static str>::from(left),
                            <&'static str>::from(right),
                        ),
                    );
                    Type::None
                } else if left == Type::Float || right == Type::Float {
                    Type::Float
                } else {
                    Type::Int
                }
            }
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::Eq | BinOp::Ne => {
                let comparable = (left.is_numeric() && right.is_numeric())
                    || (left == Type::Str && right == Type::Str);
                if !comparable {
                    self.error(
                        span.start,
                        format!(
                            "cannot compare {} with {}",
                            <&'static str>::from(left),
                            <&'static str>::from(right),
                        ),
                    );
                }
                Type::Int
            }
            BinOp::And | BinOp::Or | BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor
            | BinOp::Shl | BinOp::Shr => {
                if left != Type::Int || right != Type::Int {
                    self.error(
                        span.start,
                        format!(
                            "integer operands expected for `{}`, got {} and {}",
                            op.symbol(),
                            <&'static str>::from(left),
                            <&'static str>::from(right),
                        ),
                    );
                }
                Type::Int
            }
        }
    }

    fn call(&mut self, func: Builtin, arg_types: &[Type], args: &[Expr], span: Span) -> Type {
        if arg_types.len() != func.arity() {
            self.error(
                span.start,
                format!(
                    "{} takes {} argument(s), got {}",
                    func.as_str(),
                    func.arity(),
                    arg_types.len()
                ),
            );
            return Type::None;
        }
        let expect = |checker: &mut Self, position: usize, ok: bool, wanted: &str| {
            if !ok && arg_types[position] != Type::None {
                let got: &'static str = arg_types[position].into();
                checker.error(
                    args[position].span.start,
                    format!(
                        "{}: argument {} must be {wanted}, got {got}",
                        func.as_str(),
                        position + 1
                    ),
                );
            }
        };
        match func {
            Builtin::Strptime => {
                expect(self, 0, arg_types[0] == Type::Str, "a string");
                expect(self, 1, arg_types[1] == Type::Str, "a string");
                Type::Timestamp
            }
            Builtin::Timestamp => Type::Timestamp,
            Builtin::Settime => {
                expect(
                    self,
                    0,
                    matches!(arg_types[0], Type::Int | Type::Timestamp),
                    "an integer or timestamp",
                );
                Type::None
            }
            Builtin::Tolower => {
                expect(self, 0, arg_types[0] == Type::Str, "a string");
                Type::Str
            }
            Builtin::Len => {
                expect(self, 0, arg_types[0] == Type::Str, "a string");
                Type::Int
            }
            Builtin::Strtol => {
                expect(self, 0, arg_types[0] == Type::Str, "a string");
                expect(self, 1, arg_types[1] == Type::Int, "an integer");
                Type::Int
            }
            Builtin::Getfilename => Type::Str,
        }
    }

    /// Resolve a capture reference against the enclosing patterns.
    fn capref(&mut self, capref: &mut CapRef, span: Span) {
        match capref.name.parse::<usize>() {
            Ok(0) => capref.group = Some(0),
            Ok(number) => {
                let found = self
                    .scopes
                    .iter()
                    .rev()
                    .any(|index| self.table.regex(*index).group_count > number);
                if found {
                    capref.group = Some(number);
                } else if self.scopes.is_empty() {
                    self.error(
                        span.start,
                        format!("${number}: capture reference outside a pattern"),
                    );
                } else {
                    self.error(
                        span.start,
                        format!("${number}: no enclosing pattern has that many groups"),
                    );
                }
            }
            Err(_) => {
                let group = self
                    .scopes
                    .iter()
                    .rev()
                    .find_map(|index| self.table.regex(*index).names.get(&capref.name))
                    .copied();
                match group {
                    Some(group) => capref.group = Some(group),
                    None => self.error(
                        span.start,
                        format!("${}: unknown capture group name", capref.name),
                    ),
                }
            }
        }
    }
}

/// Collect the regex indices of every match in a condition expression. Their
/// capture groups are visible in the action block.
fn collect_patterns(expr: &Expr, out: &mut Vec<usize>) {
    match &expr.kind {
        ExprKind::Match { index, operand, .. } => {
            if let Some(index) = index {
                out.push(*index);
            }
            if let Some(operand) = operand {
                collect_patterns(operand, out);
            }
        }
        ExprKind::Binary { left, right, .. } => {
            collect_patterns(left, out);
            collect_patterns(right, out);
        }
        ExprKind::Unary { operand, .. } => collect_patterns(operand, out),
        _ => (),
    }
}

#[cfg(test)]
mod tests {

    use super::super::ast::{Ast, ExprKind, Item, Stmt, Type};
    use super::super::lexer::lex;
    use super::super::parser::parse;
    use super::super::symtab::{self, SymbolTable};
    use super::check;
    use crate::metrics::ValueKind;
    use std::time::Duration;

    fn checked(source: &str) -> (Ast, SymbolTable, Vec<String>) {
        let (tokens, lex_errors) = lex(source);
        assert!(lex_errors.is_empty());
        let (mut ast, parse_errors) = parse(tokens);
        assert!(parse_errors.is_empty(), "parse errors: {parse_errors:?}");
        let (mut table, symbol_errors) = symtab::build(&mut ast);
        assert!(symbol_errors.is_empty(), "symbol errors: {symbol_errors:?}");
        let errors = check(&mut ast, &mut table);
        (
            ast,
            table,
            errors.into_iter().map(|d| d.message).collect(),
        )
    }

    #[test]
    fn simple_counter_program_checks() {
        let (_, _, errors) = checked("counter lines\n/.*/ {\n  lines++\n}\n");
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn capture_groups_resolve_by_number_and_name() {
        let (ast, _, errors) = checked(
            "counter hits by method\n/(?<method>GET|POST) (\\S+)/ {\n  hits[$method]++\n  hits[$2]++\n}\n",
        );
        assert!(errors.is_empty(), "{errors:?}");
        let Item::Stmt(Stmt::Cond { then_block, .. }) = &ast.items[1] else {
            panic!("expected condition");
        };
        let Stmt::Inc { target, .. } = &then_block[0] else {
            panic!("expected inc");
        };
        let ExprKind::Capref(capref) = &target.index[0].kind else {
            panic!("expected capref");
        };
        assert_eq!(Some(1), capref.group);
    }

    #[test]
    fn capref_outside_pattern_is_reported() {
        let (_, _, errors) = checked("counter c by x\nc[$1]++\n");
        assert!(errors[0].contains("outside a pattern"));
    }

    #[test]
    fn capref_out_of_range_is_reported() {
        let (_, _, errors) = checked("counter c by x\n/(a)/ {\n  c[$2]++\n}\n");
        assert!(errors[0].contains("that many groups"));
    }

    #[test]
    fn unknown_group_name_is_reported() {
        let (_, _, errors) = checked("counter c by x\n/(?<a>.)/ {\n  c[$b]++\n}\n");
        assert!(errors[0].contains("unknown capture group"));
    }

    #[test]
    fn float_assignment_promotes_gauge() {
        let (_, table, errors) = checked("gauge ratio\n/x/ {\n  ratio = 0.5\n}\n");
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(ValueKind::Float, table.metrics[0].value_kind);
    }

    #[test]
    fn promotion_reaches_earlier_reads() {
        // The read of `ratio` appears before the float assignment; the
        // fixpoint re-types it as float.
        let (ast, _, errors) =
            checked("gauge ratio\ngauge out\n/x/ {\n  out = ratio + 1\n  ratio = 0.5\n}\n");
        assert!(errors.is_empty(), "{errors:?}");
        let Item::Stmt(Stmt::Cond { then_block, .. }) = &ast.items[2] else {
            panic!("expected condition");
        };
        let Stmt::Assign { value, .. } = &then_block[0] else {
            panic!("expected assignment");
        };
        assert_eq!(Type::Float, value.ty);
    }

    #[test]
    fn counter_assignment_is_rejected() {
        let (_, _, errors) = checked("counter c\n/x/ {\n  c = 5\n}\n");
        assert!(errors[0].contains("monotonic"));
    }

    #[test]
    fn counter_decrement_is_rejected() {
        let (_, _, errors) = checked("counter c\n/x/ {\n  c--\n}\n");
        assert!(errors[0].contains("monotonic"));
    }

    #[test]
    fn gauge_decrement_is_allowed() {
        let (_, _, errors) = checked("gauge g\n/x/ {\n  g--\n}\n");
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn string_arithmetic_is_rejected() {
        let (_, _, errors) = checked("gauge g\n/x/ {\n  g = \"a\" * 2\n}\n");
        assert!(errors[0].contains("invalid operands"));
    }

    #[test]
    fn string_concatenation_is_allowed() {
        let (_, _, errors) =
            checked("text banner\n/x/ {\n  banner = \"a\" + \"b\"\n}\n");
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn undefined_metric_is_reported() {
        let (_, _, errors) = checked("/x/ {\n  missing++\n}\n");
        assert!(errors[0].contains("undefined metric"));
    }

    #[test]
    fn label_arity_is_checked() {
        let (_, _, errors) = checked("counter c by a, b\n/x/ {\n  c[$0]++\n}\n");
        assert!(errors[0].contains("expected 2 label(s)"));
    }

    #[test]
    fn condition_must_be_integer() {
        let (_, _, errors) = checked("/x/ && \"y\" {\n  next\n}\n");
        assert!(!errors.is_empty());
    }

    #[test]
    fn del_after_sets_ttl() {
        let (_, table, errors) =
            checked("counter c by ip\n/(\\S+)/ {\n  c[$1]++\n  del c[$1] after 1h\n}\n");
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(Duration::from_secs(3600), table.metrics[0].ttl);
    }

    #[test]
    fn strtol_types_check() {
        let (_, _, errors) =
            checked("counter c\n/n=(\\S+)/ {\n  c += strtol($1, 10)\n}\n");
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn strptime_and_settime_check() {
        let (_, _, errors) = checked(
            "counter c\n/^(\\d+-\\d+-\\d+T\\d+:\\d+:\\d+)/ {\n  settime(strptime($1, \"%Y-%m-%dT%H:%M:%S\"))\n  c++\n}\n",
        );
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn histogram_records_with_assignment() {
        let (_, _, errors) = checked(
            "histogram latency buckets 1, 2, 4\n/t=(\\d+)/ {\n  latency = strtol($1, 10)\n}\n",
        );
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn histogram_add_assign_is_rejected() {
        let (_, _, errors) = checked(
            "histogram latency buckets 1, 2\n/t=(\\d+)/ {\n  latency += 1\n}\n",
        );
        assert!(errors[0].contains("observations"));
    }
}

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

use std::str::FromStr;

use super::Diagnostic;
use super::ast::{
    Ast, BinOp, Block, Builtin, CapRef, ConstDecl, Expr, ExprKind, Item, Lval, MetricDecl,
    PatternExpr, Span, Stmt, UnOp,
};
use super::lexer::{Tok, Token};
use crate::metrics::MetricKind;

/// Parse a token stream into a program, accumulating every syntax error so
/// operators see them all in one compile attempt.
pub fn parse(tokens: Vec<Token>) -> (Ast, Vec<Diagnostic>) {
    let mut parser = Parser::new(tokens);
    let ast = parser.program();
    (ast, parser.errors)
}

/// Marker for an error that has already been recorded.
type Recovery<T> = Result<T, ()>;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    errors: Vec<Diagnostic>,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Parser {
        Parser {
            tokens,
            pos: 0,
            errors: Vec::new(),
        }
    }

    fn peek(&self) -> &Tok {
        &self.tokens[self.pos].tok
    }

    fn peek_at(&self, ahead: usize) -> &Tok {
        let index = (self.pos + ahead).min(self.tokens.len() - 1);
        &self.tokens[index].tok
    }

    fn span(&self) -> Span {
        self.tokens[self.pos].span
    }

    fn prev_span(&self) -> Span {
        self.tokens[self.pos.saturating_sub(1)].span
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == tok {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Tok, context: &str) -> Recovery<Span> {
        if self.peek() == &tok {
            Ok(self.advance().span)
        } else {
            let message = format!("expected {} in {}, found {}", tok, context, self.peek());
            self.error_here(message);
            Err(())
        }
    }

    fn error_here(&mut self, message: String) {
        let pos = self.span().start;
        self.errors.push(Diagnostic { pos, message });
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek(), Tok::Newline) {
            self.advance();
        }
    }

    /// Skip to the next statement boundary after an error.
    fn sync(&mut self) {
        loop {
            match self.peek() {
                Tok::Newline | Tok::RBrace => {
                    self.advance();
                    return;
                }
                Tok::Eof => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    //
    // Top level
    //

    fn program(&mut self) -> Ast {
        let mut items = Vec::new();
        loop {
            self.skip_newlines();
            if matches!(self.peek(), Tok::Eof) {
                break;
            }
            match self.item() {
                Ok(item) => items.push(item),
                Err(()) => self.sync(),
            }
        }
        Ast { items }
    }

    fn item(&mut self) -> Recovery<Item> {
        match self.peek() {
            Tok::Hidden
            | Tok::Counter
            | Tok::Gauge
            | Tok::Timer
            | Tok::Text
            | Tok::Histogram => Ok(Item::Metric(self.metric_decl()?)),
            Tok::Const => Ok(Item::Const(self.const_decl()?)),
            Tok::Def => {
                self.error_here(String::from("`def` is reserved and not supported"));
                Err(())
            }
            _ => Ok(Item::Stmt(self.stmt()?)),
        }
    }

    fn metric_kind(&mut self) -> Recovery<MetricKind> {
        let kind = match self.peek() {
            Tok::Counter => MetricKind::Counter,
            Tok::Gauge => MetricKind::Gauge,
            Tok::Timer => MetricKind::Timer,
            Tok::Text => MetricKind::Text,
            Tok::Histogram => MetricKind::Histogram,
            other => {
                let message = format!("expected metric kind, found {other}");
                self.error_here(message);
                return Err(());
            }
        };
        self.advance();
        Ok(kind)
    }

    fn metric_decl(&mut self) -> Recovery<MetricDecl> {
        let start = self.span();
        let hidden = self.eat(&Tok::Hidden);
        let kind = self.metric_kind()?;
        let name = self.ident("metric declaration")?;
        if Builtin::from_str(&name).is_ok() {
            self.errors.push(Diagnostic {
                pos: start.start,
                message: format!("{name}: reserved word cannot name a metric"),
            });
            return Err(());
        }
        let mut labels = Vec::new();
        let mut buckets = Vec::new();
        let mut export_as = None;
        loop {
            match self.peek() {
                Tok::By => {
                    self.advance();
                    labels = self.ident_list()?;
                }
                Tok::Buckets => {
                    let span = self.span();
                    self.advance();
                    buckets = self.number_list()?;
                    if kind != MetricKind::Histogram {
                        self.errors.push(Diagnostic {
                            pos: span.start,
                            message: String::from("buckets are only valid on histograms"),
                        });
                    }
                }
                Tok::As => {
                    self.advance();
                    match self.advance() {
                        Token {
                            tok: Tok::StrLit(alias),
                            ..
                        } => export_as = Some(alias),
                        token => {
                            self.errors.push(Diagnostic {
                                pos: token.span.start,
                                message: format!(
                                    "expected string literal after `as`, found {}",
                                    token.tok
                                ),
                            });
                            return Err(());
                        }
                    }
                }
                _ => break,
            }
        }
        Ok(MetricDecl {
            kind,
            hidden,
            name,
            labels,
            buckets,
            export_as,
            span: start.to(self.prev_span()),
        })
    }

    fn const_decl(&mut self) -> Recovery<ConstDecl> {
        let start = self.span();
        self.advance(); // const
        let name = self.ident("const declaration")?;
        let pattern = self.pattern_expr()?;
        Ok(ConstDecl {
            name,
            pattern,
            span: start.to(self.prev_span()),
        })
    }

    fn ident(&mut self, context: &str) -> Recovery<String> {
        match self.peek() {
            Tok::Ident(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            other => {
                let message = format!("expected identifier in {context}, found {other}");
                self.error_here(message);
                Err(())
            }
        }
    }

    fn ident_list(&mut self) -> Recovery<Vec<String>> {
        let mut names = vec![self.ident("label list")?];
        while self.eat(&Tok::Comma) {
            names.push(self.ident("label list")?);
        }
        Ok(names)
    }

    fn number_list(&mut self) -> Recovery<Vec<f64>> {
        let mut values = vec![self.number("bucket list")?];
        while self.eat(&Tok::Comma) {
            values.push(self.number("bucket list")?);
        }
        Ok(values)
    }

    fn number(&mut self, context: &str) -> Recovery<f64> {
        let negative = self.eat(&Tok::Minus);
        let value = match self.peek() {
            Tok::IntLit(value) => *value as f64,
            Tok::FloatLit(value) => *value,
            other => {
                let message = format!("expected number in {context}, found {other}");
                self.error_here(message);
                return Err(());
            }
        };
        self.advance();
        Ok(if negative { -value } else { value })
    }

    //
    // Statements
    //

    fn stmt(&mut self) -> Recovery<Stmt> {
        match self.peek() {
            Tok::Next => {
                let span = self.advance().span;
                Ok(Stmt::Next { span })
            }
            Tok::Del => self.del_stmt(),
            Tok::Otherwise => {
                let start = self.span();
                self.advance();
                let block = self.block()?;
                Ok(Stmt::Otherwise {
                    block,
                    span: start.to(self.prev_span()),
                })
            }
            Tok::Else => {
                self.error_here(String::from("`else` without a preceding condition"));
                Err(())
            }
            _ => self.expr_stmt(),
        }
    }

    fn del_stmt(&mut self) -> Recovery<Stmt> {
        let start = self.span();
        self.advance(); // del
        let name = self.ident("del statement")?;
        let mut index = Vec::new();
        if self.eat(&Tok::LBracket) {
            index = self.expr_list()?;
            self.expect(Tok::RBracket, "del statement")?;
        }
        let mut after = None;
        if self.eat(&Tok::After) {
            match self.peek() {
                Tok::DurationLit(value) => {
                    after = Some(*value);
                    self.advance();
                }
                other => {
                    let message = format!("expected duration after `after`, found {other}");
                    self.error_here(message);
                    return Err(());
                }
            }
        }
        Ok(Stmt::Del {
            name,
            index,
            after,
            span: start.to(self.prev_span()),
        })
    }

    fn expr_stmt(&mut self) -> Recovery<Stmt> {
        let start = self.span();
        let expr = self.expr()?;
        match self.peek() {
            Tok::LBrace => {
                let then_block = self.block()?;
                let else_block = if self.else_follows() {
                    self.skip_newlines();
                    self.advance(); // else
                    Some(self.block()?)
                } else {
                    None
                };
                Ok(Stmt::Cond {
                    cond: expr,
                    then_block,
                    else_block,
                    span: start.to(self.prev_span()),
                })
            }
            Tok::Assign => {
                self.advance();
                let target = self.lval_of(expr)?;
                let value = self.expr()?;
                Ok(Stmt::Assign {
                    target,
                    value,
                    span: start.to(self.prev_span()),
                })
            }
            Tok::AddAssign => {
                self.advance();
                let target = self.lval_of(expr)?;
                let value = self.expr()?;
                Ok(Stmt::AddAssign {
                    target,
                    value,
                    span: start.to(self.prev_span()),
                })
            }
            Tok::Inc => {
                self.advance();
                let target = self.lval_of(expr)?;
                Ok(Stmt::Inc {
                    target,
                    span: start.to(self.prev_span()),
                })
            }
            Tok::Dec => {
                self.advance();
                let target = self.lval_of(expr)?;
                Ok(Stmt::Dec {
                    target,
                    span: start.to(self.prev_span()),
                })
            }
            _ => Ok(Stmt::Expr {
                span: expr.span,
                expr,
            }),
        }
    }

    /// An `else` may sit on the line after the closing brace.
    fn else_follows(&self) -> bool {
        let mut ahead = 0;
        while matches!(self.peek_at(ahead), Tok::Newline) {
            ahead += 1;
        }
        matches!(self.peek_at(ahead), Tok::Else)
    }

    fn lval_of(&mut self, expr: Expr) -> Recovery<Lval> {
        match expr.kind {
            ExprKind::MetricRead(lval) => Ok(lval),
            _ => {
                self.errors.push(Diagnostic {
                    pos: expr.span.start,
                    message: String::from("left-hand side of assignment must be a metric"),
                });
                Err(())
            }
        }
    }

    fn block(&mut self) -> Recovery<Block> {
        self.expect(Tok::LBrace, "block")?;
        let mut stmts = Vec::new();
        loop {
            self.skip_newlines();
            match self.peek() {
                Tok::RBrace => {
                    self.advance();
                    return Ok(stmts);
                }
                Tok::Eof => {
                    self.error_here(String::from("unterminated block"));
                    return Err(());
                }
                _ => match self.stmt() {
                    Ok(stmt) => stmts.push(stmt),
                    Err(()) => self.sync(),
                },
            }
        }
    }

    //
    // Expressions
    //

    fn expr_list(&mut self) -> Recovery<Vec<Expr>> {
        let mut exprs = vec![self.expr()?];
        while self.eat(&Tok::Comma) {
            exprs.push(self.expr()?);
        }
        Ok(exprs)
    }

    fn expr(&mut self) -> Recovery<Expr> {
        self.binary_expr(0)
    }

    fn binary_op(&self) -> Option<BinOp> {
        Some(match self.peek() {
            Tok::OrOr => BinOp::Or,
            Tok::AndAnd => BinOp::And,
            Tok::BitOr => BinOp::BitOr,
            Tok::BitXor => BinOp::BitXor,
            Tok::BitAnd => BinOp::BitAnd,
            Tok::Eq => BinOp::Eq,
            Tok::Ne => BinOp::Ne,
            Tok::Lt => BinOp::Lt,
            Tok::Le => BinOp::Le,
            Tok::Gt => BinOp::Gt,
            Tok::Ge => BinOp::Ge,
            Tok::Shl => BinOp::Shl,
            Tok::Shr => BinOp::Shr,
            Tok::Plus => BinOp::Add,
            Tok::Minus => BinOp::Sub,
            Tok::Star => BinOp::Mul,
            Tok::Slash => BinOp::Div,
            Tok::Percent => BinOp::Mod,
            Tok::Pow => BinOp::Pow,
            _ => return None,
        })
    }

    /// Precedence climbing. The match operators slot in between the logical
    /// and relational levels so `a =~ /x/ && b =~ /y/` reads naturally.
    const MATCH_PRECEDENCE: u8 = 6;

    fn binary_expr(&mut self, min_prec: u8) -> Recovery<Expr> {
        let mut left = self.unary_expr()?;
        loop {
            if matches!(self.peek(), Tok::Match | Tok::NotMatch)
                && Self::MATCH_PRECEDENCE >= min_prec
            {
                let negated = matches!(self.peek(), Tok::NotMatch);
                self.advance();
                let pattern = self.pattern_expr()?;
                let span = left.span.to(self.prev_span());
                left = Expr::new(
                    ExprKind::Match {
                        pattern,
                        operand: Some(Box::new(left)),
                        negated,
                        index: None,
                    },
                    span,
                );
                continue;
            }
            let Some(op) = self.binary_op() else {
                return Ok(left);
            };
            let prec = op.precedence();
            if prec < min_prec {
                return Ok(left);
            }
            self.advance();
            // Left associative: climb with one level more on the right.
            let right = self.binary_expr(prec + 1)?;
            let span = left.span.to(right.span);
            left = Expr::new(
                ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );
        }
    }

    fn unary_expr(&mut self) -> Recovery<Expr> {
        let op = match self.peek() {
            Tok::Not => Some(UnOp::Not),
            Tok::Minus => Some(UnOp::Neg),
            Tok::BitNot => Some(UnOp::BitNot),
            _ => None,
        };
        match op {
            Some(op) => {
                let start = self.span();
                self.advance();
                let operand = self.unary_expr()?;
                let span = start.to(operand.span);
                Ok(Expr::new(
                    ExprKind::Unary {
                        op,
                        operand: Box::new(operand),
                    },
                    span,
                ))
            }
            None => self.primary_expr(),
        }
    }

    fn primary_expr(&mut self) -> Recovery<Expr> {
        let span = self.span();
        match self.peek().clone() {
            Tok::IntLit(value) => {
                self.advance();
                Ok(Expr::new(ExprKind::Int(value), span))
            }
            Tok::FloatLit(value) => {
                self.advance();
                Ok(Expr::new(ExprKind::Float(value), span))
            }
            Tok::StrLit(value) => {
                self.advance();
                Ok(Expr::new(ExprKind::Str(value), span))
            }
            Tok::CapRef(name) => {
                self.advance();
                Ok(Expr::new(
                    ExprKind::Capref(CapRef { name, group: None }),
                    span,
                ))
            }
            Tok::RegexLit(_) => {
                let pattern = self.pattern_expr()?;
                let span = span.to(self.prev_span());
                Ok(Expr::new(
                    ExprKind::Match {
                        pattern,
                        operand: None,
                        negated: false,
                        index: None,
                    },
                    span,
                ))
            }
            Tok::LParen => {
                self.advance();
                let expr = self.expr()?;
                self.expect(Tok::RParen, "parenthesized expression")?;
                Ok(expr)
            }
            Tok::Ident(name) => {
                self.advance();
                if self.eat(&Tok::LParen) {
                    let func = Builtin::from_str(&name).map_err(|_| {
                        self.errors.push(Diagnostic {
                            pos: span.start,
                            message: format!("unknown function `{name}`"),
                        });
                    })?;
                    let mut args = Vec::new();
                    if !matches!(self.peek(), Tok::RParen) {
                        args = self.expr_list()?;
                    }
                    self.expect(Tok::RParen, "function call")?;
                    Ok(Expr::new(
                        ExprKind::Call { func, args },
                        span.to(self.prev_span()),
                    ))
                } else {
                    let mut index = Vec::new();
                    if self.eat(&Tok::LBracket) {
                        index = self.expr_list()?;
                        self.expect(Tok::RBracket, "metric index")?;
                    }
                    let span = span.to(self.prev_span());
                    Ok(Expr::new(
                        ExprKind::MetricRead(Lval { name, index, span }),
                        span,
                    ))
                }
            }
            other => {
                let message = format!("expected expression, found {other}");
                self.error_here(message);
                Err(())
            }
        }
    }

    /// Regex literals and const references, concatenated with `+`.
    fn pattern_expr(&mut self) -> Recovery<PatternExpr> {
        let mut pattern = self.pattern_term()?;
        while matches!(self.peek(), Tok::Plus)
            && matches!(self.peek_at(1), Tok::RegexLit(_) | Tok::Ident(_))
        {
            self.advance(); // plus
            let right = self.pattern_term()?;
            pattern = PatternExpr::Concat(Box::new(pattern), Box::new(right));
        }
        Ok(pattern)
    }

    fn pattern_term(&mut self) -> Recovery<PatternExpr> {
        let span = self.span();
        match self.peek().clone() {
            Tok::RegexLit(source) => {
                self.advance();
                Ok(PatternExpr::Literal(source, span))
            }
            Tok::Ident(name) => {
                self.advance();
                Ok(PatternExpr::Const(name, span))
            }
            other => {
                let message = format!("expected pattern, found {other}");
                self.error_here(message);
                Err(())
            }
        }
    }
}

#[cfg(test)]
mod tests {

    use std::time::Duration;

    use super::super::ast::{self, BinOp, ExprKind, Item, Stmt};
    use super::super::lexer::lex;
    use super::parse;
    use crate::metrics::MetricKind;

    fn parse_ok(source: &str) -> ast::Ast {
        let (tokens, lex_errors) = lex(source);
        assert!(lex_errors.is_empty(), "lex errors: {lex_errors:?}");
        let (tree, errors) = parse(tokens);
        assert!(errors.is_empty(), "parse errors: {errors:?}");
        tree
    }

    fn parse_errors(source: &str) -> Vec<String> {
        let (tokens, _) = lex(source);
        let (_, errors) = parse(tokens);
        errors.into_iter().map(|d| d.message).collect()
    }

    #[test]
    fn counter_declaration() {
        let tree = parse_ok("counter requests by method, code as \"http_requests\"");
        let Item::Metric(decl) = &tree.items[0] else {
            panic!("expected metric declaration");
        };
        assert_eq!(MetricKind::Counter, decl.kind);
        assert_eq!("requests", decl.name);
        assert_eq!(vec!["method", "code"], decl.labels);
        assert_eq!(Some(String::from("http_requests")), decl.export_as);
        assert!(!decl.hidden);
    }

    #[test]
    fn hidden_gauge() {
        let tree = parse_ok("hidden gauge state");
        let Item::Metric(decl) = &tree.items[0] else {
            panic!("expected metric declaration");
        };
        assert!(decl.hidden);
        assert_eq!(MetricKind::Gauge, decl.kind);
    }

    #[test]
    fn histogram_with_buckets() {
        let tree = parse_ok("histogram latency buckets 0.1, 0.5, 1, 5 by path");
        let Item::Metric(decl) = &tree.items[0] else {
            panic!("expected metric declaration");
        };
        assert_eq!(vec![0.1, 0.5, 1.0, 5.0], decl.buckets);
        assert_eq!(vec!["path"], decl.labels);
    }

    #[test]
    fn pattern_action() {
        let tree = parse_ok("counter lines\n/.*/ {\n  lines++\n}\n");
        let Item::Stmt(Stmt::Cond {
            cond, then_block, ..
        }) = &tree.items[1]
        else {
            panic!("expected condition");
        };
        assert!(matches!(cond.kind, ExprKind::Match { operand: None, .. }));
        assert!(matches!(then_block[0], Stmt::Inc { .. }));
    }

    #[test]
    fn labelled_increment() {
        let tree = parse_ok("counter hits by method\n/^(GET|POST) / {\n  hits[$1]++\n}\n");
        let Item::Stmt(Stmt::Cond { then_block, .. }) = &tree.items[1] else {
            panic!("expected condition");
        };
        let Stmt::Inc { target, .. } = &then_block[0] else {
            panic!("expected increment");
        };
        assert_eq!("hits", target.name);
        assert_eq!(1, target.index.len());
    }

    #[test]
    fn else_branch() {
        let tree = parse_ok("/a/ {\n  next\n} else {\n  next\n}\n");
        let Item::Stmt(Stmt::Cond { else_block, .. }) = &tree.items[0] else {
            panic!("expected condition");
        };
        assert!(else_block.is_some());
    }

    #[test]
    fn else_on_next_line() {
        let tree = parse_ok("/a/ {\n  next\n}\nelse {\n  next\n}\n");
        let Item::Stmt(Stmt::Cond { else_block, .. }) = &tree.items[0] else {
            panic!("expected condition");
        };
        assert!(else_block.is_some());
    }

    #[test]
    fn otherwise_block() {
        let tree = parse_ok("otherwise {\n  next\n}\n");
        assert!(matches!(
            tree.items[0],
            Item::Stmt(Stmt::Otherwise { .. })
        ));
    }

    #[test]
    fn del_with_after() {
        let tree = parse_ok("counter hits by ip\ndel hits[$1] after 1h\n");
        let Item::Stmt(Stmt::Del { name, after, .. }) = &tree.items[1] else {
            panic!("expected del");
        };
        assert_eq!("hits", name);
        assert_eq!(Some(Duration::from_secs(3600)), *after);
    }

    #[test]
    fn const_and_concatenation() {
        let tree = parse_ok("const PREFIX /^\\w+/\n/start/ + PREFIX {\n  next\n}\n");
        assert!(matches!(tree.items[0], Item::Const(_)));
        let Item::Stmt(Stmt::Cond { cond, .. }) = &tree.items[1] else {
            panic!("expected condition");
        };
        let ExprKind::Match { pattern, .. } = &cond.kind else {
            panic!("expected match");
        };
        assert!(matches!(pattern, ast::PatternExpr::Concat(_, _)));
    }

    #[test]
    fn match_binds_tighter_than_and() {
        let tree = parse_ok("$1 =~ /a/ && $2 =~ /b/ {\n  next\n}\n");
        let Item::Stmt(Stmt::Cond { cond, .. }) = &tree.items[0] else {
            panic!("expected condition");
        };
        let ExprKind::Binary { op, left, right } = &cond.kind else {
            panic!("expected binary");
        };
        assert_eq!(BinOp::And, *op);
        assert!(matches!(left.kind, ExprKind::Match { .. }));
        assert!(matches!(right.kind, ExprKind::Match { .. }));
    }

    #[test]
    fn arithmetic_precedence() {
        let tree = parse_ok("gauge x\nx = 1 + 2 * 3\n");
        let Item::Stmt(Stmt::Assign { value, .. }) = &tree.items[1] else {
            panic!("expected assignment");
        };
        let ExprKind::Binary { op, .. } = &value.kind else {
            panic!("expected binary");
        };
        assert_eq!(BinOp::Add, *op);
    }

    #[test]
    fn builtin_call() {
        let tree = parse_ok("counter c\n/ts=(\\d+)/ {\n  settime(strtol($1, 10))\n  c++\n}\n");
        let Item::Stmt(Stmt::Cond { then_block, .. }) = &tree.items[1] else {
            panic!("expected condition");
        };
        assert!(matches!(then_block[0], Stmt::Expr { .. }));
    }

    #[test]
    fn errors_are_accumulated() {
        let errors = parse_errors("counter\ncounter\n");
        assert_eq!(2, errors.len());
    }

    #[test]
    fn def_is_reserved() {
        let errors = parse_errors("def wrap {\n}\n");
        assert!(errors[0].contains("reserved"));
    }

    #[test]
    fn builtin_names_cannot_be_metrics() {
        let errors = parse_errors("counter len\n");
        assert!(errors[0].contains("reserved word"));
    }

    #[test]
    fn assignment_to_literal_is_rejected() {
        let errors = parse_errors("5 = 3\n");
        assert!(errors[0].contains("left-hand side"));
    }

    #[test]
    fn unknown_function_is_reported() {
        let errors = parse_errors("frobnicate($1)\n");
        assert!(errors[0].contains("unknown function"));
    }

    #[test]
    fn roundtrip_through_printer() {
        let source = concat!(
            "counter requests by method, code as \"http_requests\"\n",
            "hidden gauge state\n",
            "histogram latency buckets 0.1, 0.5, 1.0 by path\n",
            "const PREFIX /^\\w+/\n",
            "/^(GET|POST) (\\S+)/ {\n",
            "  requests[$1, \"200\"]++\n",
            "  latency[$2] = strtol($1, 10) / 2\n",
            "} else {\n",
            "  next\n",
            "}\n",
            "otherwise {\n",
            "  state = 1 + 2 * 3\n",
            "}\n",
            "del requests[\"GET\", \"200\"] after 1h30m\n",
        );
        let tree = parse_ok(source);
        let printed = ast::print(&tree);
        let reparsed = parse_ok(&printed);
        // Spans differ after reformatting; printed forms are the structural
        // comparison.
        assert_eq!(printed, ast::print(&reparsed));
    }
}

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

use super::Diagnostic;
use super::ast::{Ast, BinOp, Block, Builtin, Expr, ExprKind, Item, Lval, Stmt, Type, UnOp};
use super::symtab::SymbolTable;
use crate::metrics::{MetricKind, ValueKind};
use crate::vm::opcode::{CmpOp, CmpType, NumType, Op};

/// Bytecode and constant pools for one program.
///
/// Identical source yields identical output: every pool is filled in source
/// order and the symbol table indices are deterministic.
pub struct CodeOutput {
    pub ops: Vec<Op>,
    /// Source line of each op, for runtime error reports.
    pub lines: Vec<u32>,
    pub strings: Vec<String>,
    /// Number of local slots the frame needs.
    pub locals: usize,
}

/// Lower a checked program to bytecode.
pub fn generate(ast: &Ast, table: &SymbolTable) -> Result<CodeOutput, Vec<Diagnostic>> {
    let mut generator = Generator {
        table,
        ops: Vec::new(),
        op_lines: Vec::new(),
        strings: Vec::new(),
        string_index: HashMap::new(),
        locals: 0,
        line: 1,
        errors: Vec::new(),
    };
    let block: Block = ast
        .items
        .iter()
        .filter_map(|item| match item {
            Item::Stmt(stmt) => Some(stmt.clone()),
            _ => None,
        })
        .collect();
    generator.block(&block);
    generator.emit(Op::Halt);
    if generator.errors.is_empty() {
        Ok(CodeOutput {
            ops: generator.ops,
            lines: generator.op_lines,
            strings: generator.strings,
            locals: generator.locals,
        })
    } else {
        Err(generator.errors)
    }
}

struct Generator<'a> {
    table: &'a SymbolTable,
    ops: Vec<Op>,
    op_lines: Vec<u32>,
    strings: Vec<String>,
    string_index: HashMap<String, u16>,
    locals: usize,
    line: u32,
    errors: Vec<Diagnostic>,
}

impl Generator<'_> {
    fn emit(&mut self, op: Op) {
        self.ops.push(op);
        self.op_lines.push(self.line);
    }

    /// Emit a jump with a dummy target, returning its index for patching.
    fn emit_jump(&mut self, op: Op) -> usize {
        let at = self.ops.len();
        self.emit(op);
        at
    }

    /// Point the jump at `at` to the next op.
    fn patch(&mut self, at: usize) {
        let target = self.ops.len() as u32;
        match &mut self.ops[at] {
            Op::Jmp(slot) | Op::JmpIfFalse(slot) => *slot = target,
            _ => unreachable!("patching a non-jump"),
        }
    }

    fn intern(&mut self, text: &str) -> u16 {
        if let Some(index) = self.string_index.get(text) {
            return *index;
        }
        if self.strings.len() >= u16::MAX as usize {
            self.errors.push(Diagnostic {
                pos: super::ast::Pos::new(self.line, 1),
                message: String::from("too many string constants"),
            });
            return 0;
        }
        let index = self.strings.len() as u16;
        self.strings.push(text.to_string());
        self.string_index.insert(text.to_string(), index);
        index
    }

    fn new_local(&mut self) -> u16 {
        let slot = self.locals as u16;
        self.locals += 1;
        slot
    }

    fn block(&mut self, block: &Block) {
        // Blocks holding an `otherwise` track whether any sibling condition
        // matched, in a dedicated local.
        let flag = block
            .iter()
            .any(|stmt| matches!(stmt, Stmt::Otherwise { .. }))
            .then(|| self.new_local());
        if let Some(flag) = flag {
            self.emit(Op::PushInt(0));
            self.emit(Op::StoreLocal(flag));
        }
        for stmt in block {
            self.stmt(stmt, flag);
        }
    }

    fn stmt(&mut self, stmt: &Stmt, flag: Option<u16>) {
        self.line = stmt.span().start.line;
        match stmt {
            Stmt::Cond {
                cond,
                then_block,
                else_block,
                ..
            } => {
                self.expr(cond);
                let to_else = self.emit_jump(Op::JmpIfFalse(0));
                if let Some(flag) = flag {
                    self.emit(Op::PushInt(1));
                    self.emit(Op::StoreLocal(flag));
                }
                self.block(then_block);
                match else_block {
                    Some(else_block) => {
                        let to_end = self.emit_jump(Op::Jmp(0));
                        self.patch(to_else);
                        self.block(else_block);
                        self.patch(to_end);
                    }
                    None => self.patch(to_else),
                }
            }
            Stmt::Otherwise { block, .. } => {
                let flag = flag.expect("otherwise outside a tracked block");
                self.emit(Op::LoadLocal(flag));
                self.emit(Op::Not);
                let to_end = self.emit_jump(Op::JmpIfFalse(0));
                self.block(block);
                self.patch(to_end);
            }
            Stmt::Next { .. } => self.emit(Op::Next),
            Stmt::Del {
                name,
                index,
                after,
                ..
            } => {
                // The `after` form sets the expiry at load time and costs
                // nothing per line.
                if after.is_some() {
                    return;
                }
                let metric = self.metric_index(name);
                self.emit(Op::MLoad(metric));
                for expr in index {
                    self.expr(expr);
                }
                self.emit(Op::Del(index.len() as u8));
            }
            Stmt::Assign { target, value, .. } => {
                let metric = self.metric_index(&target.name);
                let sym = &self.table.metrics[metric as usize];
                let kind = sym.decl.kind;
                let value_kind = sym.value_kind;
                self.load_datum(target, metric);
                match kind {
                    MetricKind::Text => {
                        self.expr(value);
                        self.emit(Op::SSet);
                    }
                    MetricKind::Histogram => {
                        self.numeric_expr(value, true);
                        self.emit(Op::Observe);
                    }
                    _ => {
                        let float = value_kind == ValueKind::Float;
                        self.numeric_expr(value, float);
                        self.emit(if float { Op::FSet } else { Op::ISet });
                    }
                }
            }
            Stmt::AddAssign { target, value, .. } => {
                let metric = self.metric_index(&target.name);
                let float =
                    self.table.metrics[metric as usize].value_kind == ValueKind::Float;
                self.load_datum(target, metric);
                self.numeric_expr(value, float);
                self.emit(if float { Op::FAdd } else { Op::IAdd });
            }
            Stmt::Inc { target, .. } => {
                let metric = self.metric_index(&target.name);
                self.load_datum(target, metric);
                self.emit(Op::Inc);
            }
            Stmt::Dec { target, .. } => {
                let metric = self.metric_index(&target.name);
                self.load_datum(target, metric);
                self.emit(Op::Dec);
            }
            Stmt::Expr { expr, .. } => self.expr(expr),
        }
    }

    fn metric_index(&self, name: &str) -> u16 {
        self.table
            .metric(name)
            .expect("checked metric reference") as u16
    }

    fn load_datum(&mut self, lval: &Lval, metric: u16) {
        self.emit(Op::MLoad(metric));
        for expr in &lval.index {
            self.expr(expr);
        }
        self.emit(Op::DLoad(lval.index.len() as u8));
    }

    /// Emit an expression, converting to float when the context requires it.
    fn numeric_expr(&mut self, expr: &Expr, want_float: bool) {
        self.expr(expr);
        if want_float && expr.ty != Type::Float {
            self.emit(Op::I2f);
        }
    }

    fn expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Int(value) => self.emit(Op::PushInt(*value)),
            ExprKind::Float(value) => self.emit(Op::PushFloat(*value)),
            ExprKind::Str(value) => {
                let index = self.intern(value);
                self.emit(Op::PushStr(index));
            }
            ExprKind::Capref(capref) => {
                let group = capref.group.unwrap_or(0) as u16;
                self.emit(Op::CapRef(group));
            }
            ExprKind::MetricRead(lval) => {
                let metric = self.metric_index(&lval.name);
                self.load_datum(lval, metric);
                self.emit(Op::DGet);
            }
            ExprKind::Match {
                operand,
                negated,
                index,
                ..
            } => {
                match operand {
                    Some(operand) => self.expr(operand),
                    // A bare pattern matches the input line.
                    None => self.emit(Op::CapRef(0)),
                }
                self.emit(Op::Match(index.unwrap_or(0) as u16));
                if *negated {
                    self.emit(Op::Not);
                }
            }
            ExprKind::Binary { op, left, right } => self.binary(*op, left, right),
            ExprKind::Unary { op, operand } => {
                self.expr(operand);
                match op {
                    UnOp::Not => self.emit(Op::Not),
                    UnOp::BitNot => self.emit(Op::BitNot),
                    UnOp::Neg => {
                        let ty = if operand.ty == Type::Float {
                            NumType::Float
                        } else {
                            NumType::Int
                        };
                        self.emit(Op::Neg(ty));
                    }
                }
            }
            ExprKind::Call { func, args } => {
                for arg in args {
                    self.expr(arg);
                }
                self.emit(match func {
                    Builtin::Strptime => Op::Strptime,
                    Builtin::Timestamp => Op::Timestamp,
                    Builtin::Settime => Op::SetTime,
                    Builtin::Tolower => Op::Tolower,
                    Builtin::Len => Op::Len,
                    Builtin::Strtol => Op::Strtol,
                    Builtin::Getfilename => Op::Getfilename,
                });
            }
        }
    }

    fn binary(&mut self, op: BinOp, left: &Expr, right: &Expr) {
        match op {
            BinOp::And | BinOp::Or => {
                self.expr(left);
                self.expr(right);
                self.emit(if op == BinOp::And { Op::And } else { Op::Or });
            }
            BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor | BinOp::Shl | BinOp::Shr => {
                self.expr(left);
                self.expr(right);
                self.emit(match op {
                    BinOp::BitAnd => Op::BitAnd,
                    BinOp::BitOr => Op::BitOr,
                    BinOp::BitXor => Op::BitXor,
                    BinOp::Shl => Op::Shl,
                    _ => Op::Shr,
                });
            }
            BinOp::Add if left.ty == Type::Str => {
                self.expr(left);
                self.expr(right);
                self.emit(Op::Concat);
            }
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod | BinOp::Pow => {
                let float = left.ty == Type::Float || right.ty == Type::Float;
                self.numeric_expr(left, float);
                self.numeric_expr(right, float);
                let ty = if float { NumType::Float } else { NumType::Int };
                self.emit(match op {
                    BinOp::Add => Op::Add(ty),
                    BinOp::Sub => Op::Sub(ty),
                    BinOp::Mul => Op::Mul(ty),
                    BinOp::Div => Op::Div(ty),
                    BinOp::Mod => Op::Mod(ty),
                    _ => Op::Pow(ty),
                });
            }
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::Eq | BinOp::Ne => {
                let cmp = match op {
                    BinOp::Lt => CmpOp::Lt,
                    BinOp::Le => CmpOp::Le,
                    BinOp::Gt => CmpOp::Gt,
                    BinOp::Ge => CmpOp::Ge,
                    BinOp::Eq => CmpOp::Eq,
                    _ => CmpOp::Ne,
                };
                if left.ty == Type::Str {
                    self.expr(left);
                    self.expr(right);
                    self.emit(Op::Cmp(CmpType::Str, cmp));
                } else {
                    let float = left.ty == Type::Float || right.ty == Type::Float;
                    self.numeric_expr(left, float);
                    self.numeric_expr(right, float);
                    let ty = if float { CmpType::Float } else { CmpType::Int };
                    self.emit(Op::Cmp(ty, cmp));
                }
            }
        }
    }
}

//! Lowering from the syntax tree to bytecode, plus the [`FrontEnd`] seam.

use std::collections::BTreeMap;

use crate::ast::{BinOp, Expr, ExprKind, Stmt, StmtKind};
use crate::diagnostic::{Diagnostic, Span, has_errors};
use crate::parser::parse;
use crate::program::{
    Builtin, Chunk, CompiledArtifact, ENTRY_POINT, FORMAT_VERSION, LineTable, Op, Program,
};
use crate::record::Value;

/// Successful compilation: the artifact plus any warnings.
#[derive(Debug, Clone, PartialEq)]
pub struct Compilation {
    pub artifact: CompiledArtifact,
    pub warnings: Vec<Diagnostic>,
}

/// Source text in, artifact or diagnostics out.
///
/// `Err` carries every diagnostic produced, at least one of which is an error.
pub trait FrontEnd {
    fn compile(&self, source: &str) -> Result<Compilation, Vec<Diagnostic>>;
}

/// Front end for the snippet language.
#[derive(Debug, Clone, Copy)]
pub struct SnippetCompiler {
    /// Ship the line table with the artifact so faults can name a line.
    pub emit_symbols: bool,
}

impl Default for SnippetCompiler {
    fn default() -> Self {
        Self { emit_symbols: true }
    }
}

impl FrontEnd for SnippetCompiler {
    fn compile(&self, source: &str) -> Result<Compilation, Vec<Diagnostic>> {
        let stmts = parse(source).map_err(|diag| vec![diag])?;
        let mut lowering = Lowering::default();
        lowering.block(&stmts);
        lowering.emit(Op::Return);
        let Lowering {
            code,
            lines,
            next_slot,
            diagnostics,
            ..
        } = lowering;
        if has_errors(&diagnostics) {
            return Err(diagnostics);
        }

        let mut entries = BTreeMap::new();
        entries.insert(
            ENTRY_POINT.to_string(),
            Chunk {
                code,
                locals: next_slot,
            },
        );
        let program = Program {
            format_version: FORMAT_VERSION,
            entries,
        };
        let mut table = LineTable::new();
        table.insert(ENTRY_POINT.to_string(), lines);
        let symbols = self.emit_symbols.then_some(&table);
        let artifact = CompiledArtifact::from_program(&program, symbols).map_err(|err| {
            vec![Diagnostic::error(
                None,
                format!("failed to encode artifact: {err}"),
            )]
        })?;
        Ok(Compilation {
            artifact,
            warnings: diagnostics,
        })
    }
}

struct Binding {
    name: String,
    slot: u16,
    span: Span,
    used: bool,
}

#[derive(Default)]
struct LoopPatches {
    breaks: Vec<usize>,
    continues: Vec<usize>,
}

#[derive(Default)]
struct Lowering {
    code: Vec<Op>,
    lines: Vec<u32>,
    scopes: Vec<Vec<Binding>>,
    next_slot: u16,
    loops: Vec<LoopPatches>,
    diagnostics: Vec<Diagnostic>,
    line: u32,
}

impl Lowering {
    fn emit(&mut self, op: Op) -> usize {
        self.code.push(op);
        self.lines.push(self.line);
        self.code.len() - 1
    }

    fn here(&self) -> usize {
        self.code.len()
    }

    fn patch(&mut self, at: usize, target: usize) {
        match &mut self.code[at] {
            Op::Jump(t) | Op::JumpIfFalse(t) => *t = target,
            other => unreachable!("patched non-jump {other:?}"),
        }
    }

    fn error(&mut self, span: Span, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic::error(Some(span), message));
    }

    fn alloc_slot(&mut self, span: Span) -> u16 {
        let slot = self.next_slot;
        match self.next_slot.checked_add(1) {
            Some(next) => self.next_slot = next,
            None => self.error(span, "too many local variables"),
        }
        slot
    }

    fn declare(&mut self, name: &str, span: Span, used: bool) -> u16 {
        let slot = self.alloc_slot(span);
        if let Some(scope) = self.scopes.last_mut() {
            scope.push(Binding {
                name: name.to_string(),
                slot,
                span,
                used,
            });
        }
        slot
    }

    fn lookup(&mut self, name: &str) -> Option<&mut Binding> {
        self.scopes
            .iter_mut()
            .rev()
            .find_map(|scope| scope.iter_mut().rev().find(|b| b.name == name))
    }

    fn push_scope(&mut self) {
        self.scopes.push(Vec::new());
    }

    fn pop_scope(&mut self) {
        let Some(scope) = self.scopes.pop() else {
            return;
        };
        for binding in scope {
            if !binding.used && !binding.name.starts_with('_') {
                self.diagnostics.push(Diagnostic::warning(
                    Some(binding.span),
                    format!("unused variable `{}`", binding.name),
                ));
            }
        }
    }

    fn block(&mut self, stmts: &[Stmt]) {
        self.push_scope();
        let mut diverged = false;
        let mut warned = false;
        for stmt in stmts {
            if diverged && !warned {
                self.diagnostics
                    .push(Diagnostic::warning(Some(stmt.span), "unreachable code"));
                warned = true;
            }
            self.statement(stmt);
            diverged |= matches!(
                stmt.kind,
                StmtKind::Return | StmtKind::Break | StmtKind::Continue
            );
        }
        self.pop_scope();
    }

    fn statement(&mut self, stmt: &Stmt) {
        self.line = stmt.span.line;
        match &stmt.kind {
            StmtKind::Let { name, init } => {
                self.expr(init);
                let slot = self.declare(name, stmt.span, false);
                self.emit(Op::Store(slot));
            }
            StmtKind::Assign { target, value } => self.assign(target, value),
            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => {
                self.expr(cond);
                let to_else = self.emit(Op::JumpIfFalse(0));
                self.block(then_block);
                match else_block {
                    Some(else_block) => {
                        let to_end = self.emit(Op::Jump(0));
                        let else_start = self.here();
                        self.patch(to_else, else_start);
                        self.block(else_block);
                        let end = self.here();
                        self.patch(to_end, end);
                    }
                    None => {
                        let end = self.here();
                        self.patch(to_else, end);
                    }
                }
            }
            StmtKind::While { cond, body } => {
                let start = self.here();
                self.expr(cond);
                let exit = self.emit(Op::JumpIfFalse(0));
                self.loop_body(body, &[]);
                self.emit(Op::Jump(start));
                self.finish_loop(exit, start);
            }
            StmtKind::For {
                var,
                iterable,
                body,
            } => self.for_loop(var, iterable, body, stmt.span),
            StmtKind::Return => {
                self.emit(Op::Return);
            }
            StmtKind::Break | StmtKind::Continue => {
                let is_break = matches!(stmt.kind, StmtKind::Break);
                let jump = self.emit(Op::Jump(0));
                match self.loops.last_mut() {
                    Some(patches) if is_break => patches.breaks.push(jump),
                    Some(patches) => patches.continues.push(jump),
                    None => {
                        let keyword = if is_break { "break" } else { "continue" };
                        self.error(stmt.span, format!("`{keyword}` outside of a loop"));
                    }
                }
            }
            StmtKind::Expr(expr) => {
                self.expr(expr);
                self.emit(Op::Pop);
            }
        }
    }

    /// Compile a loop body; `prelude` statements run in the body scope first.
    fn loop_body(&mut self, body: &[Stmt], prelude: &[Op]) {
        self.loops.push(LoopPatches::default());
        for op in prelude {
            self.emit(op.clone());
        }
        self.block(body);
    }

    /// Patch the pending loop's exits once its layout is known.
    fn finish_loop(&mut self, exit: usize, continue_target: usize) {
        let end = self.here();
        self.patch(exit, end);
        let patches = self.loops.pop().unwrap_or_default();
        for at in patches.breaks {
            self.patch(at, end);
        }
        for at in patches.continues {
            self.patch(at, continue_target);
        }
    }

    /// `for v in xs { body }` lowers to an index loop over hidden slots.
    fn for_loop(&mut self, var: &str, iterable: &Expr, body: &[Stmt], span: Span) {
        self.expr(iterable);
        let items = self.alloc_slot(span);
        let index = self.alloc_slot(span);
        self.emit(Op::Store(items));
        self.emit(Op::Const(Value::Int(0)));
        self.emit(Op::Store(index));

        let start = self.here();
        self.emit(Op::Load(index));
        self.emit(Op::Load(items));
        self.emit(Op::Call(Builtin::Len));
        self.emit(Op::Binary(BinOp::Lt));
        let exit = self.emit(Op::JumpIfFalse(0));

        self.push_scope();
        let slot = self.declare(var, span, true);
        self.loop_body(
            body,
            &[Op::Load(items), Op::Load(index), Op::GetIndex, Op::Store(slot)],
        );
        self.pop_scope();

        self.line = span.line;
        let step = self.here();
        self.emit(Op::Load(index));
        self.emit(Op::Const(Value::Int(1)));
        self.emit(Op::Binary(BinOp::Add));
        self.emit(Op::Store(index));
        self.emit(Op::Jump(start));
        self.finish_loop(exit, step);
    }

    fn assign(&mut self, target: &Expr, value: &Expr) {
        match &target.kind {
            ExprKind::Ident(name) => {
                if let Some(binding) = self.lookup(name) {
                    let slot = binding.slot;
                    self.expr(value);
                    self.emit(Op::Store(slot));
                } else if name == "time" {
                    self.expr(value);
                    self.emit(Op::StoreTime);
                } else if name == "rows" {
                    self.error(target.span, "`rows` cannot be reassigned");
                } else {
                    self.error(target.span, format!("unknown identifier `{name}`"));
                }
            }
            ExprKind::Field { target, name } => {
                self.expr(target);
                self.expr(value);
                self.emit(Op::SetField(name.clone()));
            }
            ExprKind::Index { target, index } => {
                self.expr(target);
                self.expr(index);
                self.expr(value);
                self.emit(Op::SetIndex);
            }
            _ => self.error(target.span, "invalid assignment target"),
        }
    }

    fn expr(&mut self, expr: &Expr) {
        self.line = expr.span.line;
        match &expr.kind {
            ExprKind::Literal(value) => {
                self.emit(Op::Const(value.clone()));
            }
            ExprKind::Ident(name) => self.ident(name, expr.span),
            ExprKind::Field { target, name } => {
                self.expr(target);
                self.emit(Op::GetField(name.clone()));
            }
            ExprKind::Index { target, index } => {
                self.expr(target);
                self.expr(index);
                self.emit(Op::GetIndex);
            }
            ExprKind::Call { callee, args } => {
                let Some(builtin) = Builtin::lookup(callee) else {
                    self.error(expr.span, format!("unknown function `{callee}`"));
                    return;
                };
                if args.len() != builtin.arity() {
                    self.error(
                        expr.span,
                        format!(
                            "`{callee}` takes {} argument(s), got {}",
                            builtin.arity(),
                            args.len()
                        ),
                    );
                }
                for arg in args {
                    self.expr(arg);
                }
                self.emit(Op::Call(builtin));
            }
            ExprKind::Unary { op, operand } => {
                self.expr(operand);
                self.emit(Op::Unary(*op));
            }
            ExprKind::Binary { op, lhs, rhs } => {
                self.expr(lhs);
                self.expr(rhs);
                self.emit(Op::Binary(*op));
            }
            ExprKind::And(lhs, rhs) => {
                self.expr(lhs);
                let lhs_false = self.emit(Op::JumpIfFalse(0));
                self.expr(rhs);
                let rhs_false = self.emit(Op::JumpIfFalse(0));
                self.emit(Op::Const(Value::Bool(true)));
                let to_end = self.emit(Op::Jump(0));
                let falsy = self.emit(Op::Const(Value::Bool(false)));
                self.patch(lhs_false, falsy);
                self.patch(rhs_false, falsy);
                let end = self.here();
                self.patch(to_end, end);
            }
            ExprKind::Or(lhs, rhs) => {
                self.expr(lhs);
                let try_rhs = self.emit(Op::JumpIfFalse(0));
                self.emit(Op::Const(Value::Bool(true)));
                let lhs_done = self.emit(Op::Jump(0));
                let rhs_start = self.here();
                self.patch(try_rhs, rhs_start);
                self.expr(rhs);
                let rhs_false = self.emit(Op::JumpIfFalse(0));
                self.emit(Op::Const(Value::Bool(true)));
                let rhs_done = self.emit(Op::Jump(0));
                let falsy = self.emit(Op::Const(Value::Bool(false)));
                self.patch(rhs_false, falsy);
                let end = self.here();
                self.patch(lhs_done, end);
                self.patch(rhs_done, end);
            }
        }
    }

    fn ident(&mut self, name: &str, span: Span) {
        if let Some(binding) = self.lookup(name) {
            binding.used = true;
            let slot = binding.slot;
            self.emit(Op::Load(slot));
            return;
        }
        match name {
            "rows" => {
                self.emit(Op::LoadRows);
            }
            "time" => {
                self.emit(Op::LoadTime);
            }
            _ if Builtin::lookup(name).is_some() => {
                self.error(span, format!("`{name}` is a function and must be called"));
            }
            _ => self.error(span, format!("unknown identifier `{name}`")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::Severity;
    use crate::program::LoadedProgram;

    fn compile(source: &str) -> Result<Compilation, Vec<Diagnostic>> {
        SnippetCompiler::default().compile(source)
    }

    fn messages(diags: &[Diagnostic]) -> Vec<&str> {
        diags.iter().map(|d| d.message.as_str()).collect()
    }

    #[test]
    fn compiles_to_loadable_artifact() {
        let compiled = compile("for row in rows { row.foo = 4; }").expect("compile");
        assert!(compiled.warnings.is_empty());
        assert_eq!(compiled.artifact.entry_point, ENTRY_POINT);
        let loaded = LoadedProgram::load(&compiled.artifact).expect("load");
        assert_eq!(loaded.entry.code.last(), Some(&Op::Return));
        assert_eq!(loaded.lines.len(), loaded.entry.code.len());
    }

    #[test]
    fn symbols_can_be_omitted() {
        let compiler = SnippetCompiler {
            emit_symbols: false,
        };
        let compiled = compiler.compile("log(1);").expect("compile");
        assert!(compiled.artifact.symbols.is_none());
    }

    #[test]
    fn syntax_error_is_single_diagnostic() {
        let diags = compile("for row in rows { row.foo = ; }").unwrap_err();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].severity, Severity::Error);
    }

    #[test]
    fn semantic_errors_are_all_reported() {
        let diags = compile("missing = 1;\nbreak;\nlen(1, 2);\nrows = 3;").unwrap_err();
        assert_eq!(
            messages(&diags),
            vec![
                "unknown identifier `missing`",
                "`break` outside of a loop",
                "`len` takes 1 argument(s), got 2",
                "`rows` cannot be reassigned",
            ]
        );
    }

    #[test]
    fn unknown_function_is_an_error() {
        let diags = compile("frobnicate(1);").unwrap_err();
        assert_eq!(messages(&diags), vec!["unknown function `frobnicate`"]);
    }

    #[test]
    fn warnings_do_not_fail_compilation() {
        let compiled = compile("let unused = 1;\nlet _quiet = 2;\nreturn;\nlog(3);").expect("compile");
        assert_eq!(
            messages(&compiled.warnings),
            vec!["unreachable code", "unused variable `unused`"]
        );
        assert!(compiled.warnings.iter().all(|d| !d.is_error()));
    }

    #[test]
    fn let_initializer_sees_outer_binding() {
        let compiled = compile("let x = 1;\nif true { let x = x + 1; log(x); }").expect("compile");
        assert!(compiled.warnings.is_empty());
    }

    #[test]
    fn same_source_yields_same_payload() {
        let a = compile("log(len(rows));").expect("compile");
        let b = compile("log(len(rows));").expect("compile");
        assert_eq!(a.artifact, b.artifact);
    }
}

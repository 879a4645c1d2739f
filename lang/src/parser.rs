//! Recursive-descent parser from tokens to [`ast`](crate::ast).
//!
//! Parsing stops at the first syntax error; semantic checks happen later in
//! the compiler so they can report several problems at once.

use crate::ast::{BinOp, Expr, ExprKind, Stmt, StmtKind, UnOp};
use crate::diagnostic::{Diagnostic, Span};
use crate::lexer::{Spanned, Token, tokenize};
use crate::record::Value;

/// Nesting limit for statements and expressions.
pub const MAX_NESTING: usize = 128;

type PResult<T> = Result<T, Diagnostic>;

/// Parse a whole snippet.
pub fn parse(source: &str) -> PResult<Vec<Stmt>> {
    let (tokens, end) = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        end,
        depth: 0,
    };
    parser.program()
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    end: Span,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn peek_span(&self) -> Span {
        self.tokens.get(self.pos).map_or(self.end, |s| s.span)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn advance(&mut self) -> Option<Spanned> {
        let next = self.tokens.get(self.pos).cloned();
        if next.is_some() {
            self.pos += 1;
        }
        next
    }

    fn check(&self, token: &Token) -> bool {
        self.peek() == Some(token)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> PResult<Span> {
        let span = self.peek_span();
        if self.eat(&token) {
            Ok(span)
        } else {
            Err(self.unexpected(&token.to_string()))
        }
    }

    fn ident(&mut self) -> PResult<String> {
        match self.peek() {
            Some(Token::Ident(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.unexpected("identifier")),
        }
    }

    fn unexpected(&self, expected: &str) -> Diagnostic {
        let found = match self.peek() {
            Some(token) => token.to_string(),
            None => "end of input".to_string(),
        };
        Diagnostic::error(
            Some(self.peek_span()),
            format!("expected {expected}, found {found}"),
        )
    }

    fn enter(&mut self) -> PResult<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(Diagnostic::error(
                Some(self.peek_span()),
                "snippet nests too deeply",
            ));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    /// Run `parse` and restore the depth afterwards. Each link a loop adds
    /// to a left-leaning chain calls `enter`, so long `a + b + ...` or
    /// `a.b.c...` chains hit the same cap as parenthesised nesting.
    fn chain<T>(&mut self, parse: impl FnOnce(&mut Self) -> PResult<T>) -> PResult<T> {
        let depth = self.depth;
        let result = parse(self);
        self.depth = depth;
        result
    }

    fn program(&mut self) -> PResult<Vec<Stmt>> {
        let mut stmts = Vec::new();
        while !self.at_end() {
            stmts.push(self.statement()?);
        }
        Ok(stmts)
    }

    fn block(&mut self) -> PResult<Vec<Stmt>> {
        self.expect(Token::LBrace)?;
        let mut stmts = Vec::new();
        while !self.check(&Token::RBrace) {
            if self.at_end() {
                return Err(self.unexpected("`}`"));
            }
            stmts.push(self.statement()?);
        }
        self.expect(Token::RBrace)?;
        Ok(stmts)
    }

    fn statement(&mut self) -> PResult<Stmt> {
        self.enter()?;
        let stmt = self.statement_inner();
        self.leave();
        stmt
    }

    fn statement_inner(&mut self) -> PResult<Stmt> {
        let span = self.peek_span();
        let kind = match self.peek() {
            Some(Token::Let) => {
                self.pos += 1;
                let name = self.ident()?;
                self.expect(Token::Assign)?;
                let init = self.expression()?;
                self.expect(Token::Semi)?;
                StmtKind::Let { name, init }
            }
            Some(Token::If) => return self.if_statement(),
            Some(Token::While) => {
                self.pos += 1;
                let cond = self.expression()?;
                let body = self.block()?;
                StmtKind::While { cond, body }
            }
            Some(Token::For) => {
                self.pos += 1;
                let var = self.ident()?;
                self.expect(Token::In)?;
                let iterable = self.expression()?;
                let body = self.block()?;
                StmtKind::For {
                    var,
                    iterable,
                    body,
                }
            }
            Some(Token::Return) => {
                self.pos += 1;
                self.expect(Token::Semi)?;
                StmtKind::Return
            }
            Some(Token::Break) => {
                self.pos += 1;
                self.expect(Token::Semi)?;
                StmtKind::Break
            }
            Some(Token::Continue) => {
                self.pos += 1;
                self.expect(Token::Semi)?;
                StmtKind::Continue
            }
            _ => {
                let expr = self.expression()?;
                if self.eat(&Token::Assign) {
                    if !expr.kind.is_place() {
                        return Err(Diagnostic::error(
                            Some(expr.span),
                            "invalid assignment target",
                        ));
                    }
                    let value = self.expression()?;
                    self.expect(Token::Semi)?;
                    StmtKind::Assign {
                        target: expr,
                        value,
                    }
                } else {
                    self.expect(Token::Semi)?;
                    StmtKind::Expr(expr)
                }
            }
        };
        Ok(Stmt { kind, span })
    }

    fn if_statement(&mut self) -> PResult<Stmt> {
        let span = self.expect(Token::If)?;
        let cond = self.expression()?;
        let then_block = self.block()?;
        let else_block = if self.eat(&Token::Else) {
            if self.check(&Token::If) {
                Some(vec![self.statement()?])
            } else {
                Some(self.block()?)
            }
        } else {
            None
        };
        Ok(Stmt {
            kind: StmtKind::If {
                cond,
                then_block,
                else_block,
            },
            span,
        })
    }

    fn expression(&mut self) -> PResult<Expr> {
        self.enter()?;
        let expr = self.or();
        self.leave();
        expr
    }

    fn or(&mut self) -> PResult<Expr> {
        self.chain(Self::or_chain)
    }

    fn or_chain(&mut self) -> PResult<Expr> {
        let mut lhs = self.and()?;
        while self.eat(&Token::OrOr) {
            let rhs = self.and()?;
            self.enter()?;
            let span = lhs.span;
            lhs = Expr {
                kind: ExprKind::Or(Box::new(lhs), Box::new(rhs)),
                span,
            };
        }
        Ok(lhs)
    }

    fn and(&mut self) -> PResult<Expr> {
        self.chain(Self::and_chain)
    }

    fn and_chain(&mut self) -> PResult<Expr> {
        let mut lhs = self.binary_level(0)?;
        while self.eat(&Token::AndAnd) {
            let rhs = self.binary_level(0)?;
            self.enter()?;
            let span = lhs.span;
            lhs = Expr {
                kind: ExprKind::And(Box::new(lhs), Box::new(rhs)),
                span,
            };
        }
        Ok(lhs)
    }

    /// Left-associative binary levels, loosest first.
    fn binary_level(&mut self, level: usize) -> PResult<Expr> {
        const LEVELS: usize = 4;
        if level == LEVELS {
            return self.unary();
        }
        self.chain(|parser| parser.binary_chain(level))
    }

    fn binary_chain(&mut self, level: usize) -> PResult<Expr> {
        let mut lhs = self.binary_level(level + 1)?;
        while let Some(op) = self.peek().and_then(|t| binary_op(t, level)) {
            self.pos += 1;
            let rhs = self.binary_level(level + 1)?;
            self.enter()?;
            let span = lhs.span;
            lhs = Expr {
                kind: ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                span,
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> PResult<Expr> {
        let span = self.peek_span();
        let op = match self.peek() {
            Some(Token::Bang) => UnOp::Not,
            Some(Token::Minus) => UnOp::Neg,
            _ => return self.postfix(),
        };
        self.pos += 1;
        self.enter()?;
        let operand = self.unary();
        self.leave();
        Ok(Expr {
            kind: ExprKind::Unary {
                op,
                operand: Box::new(operand?),
            },
            span,
        })
    }

    fn postfix(&mut self) -> PResult<Expr> {
        self.chain(Self::postfix_chain)
    }

    fn postfix_chain(&mut self) -> PResult<Expr> {
        let mut expr = self.primary()?;
        loop {
            if self.check(&Token::Dot)
                || self.check(&Token::LBracket)
                || self.check(&Token::LParen)
            {
                self.enter()?;
            }
            if self.eat(&Token::Dot) {
                let name = self.ident()?;
                let span = expr.span;
                expr = Expr {
                    kind: ExprKind::Field {
                        target: Box::new(expr),
                        name,
                    },
                    span,
                };
            } else if self.eat(&Token::LBracket) {
                let index = self.expression()?;
                self.expect(Token::RBracket)?;
                let span = expr.span;
                expr = Expr {
                    kind: ExprKind::Index {
                        target: Box::new(expr),
                        index: Box::new(index),
                    },
                    span,
                };
            } else if self.check(&Token::LParen) {
                let ExprKind::Ident(callee) = &expr.kind else {
                    return Err(Diagnostic::error(
                        Some(self.peek_span()),
                        "only builtin functions can be called",
                    ));
                };
                let callee = callee.clone();
                self.pos += 1;
                let args = self.arguments()?;
                expr = Expr {
                    kind: ExprKind::Call { callee, args },
                    span: expr.span,
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn arguments(&mut self) -> PResult<Vec<Expr>> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.expression()?);
            if self.eat(&Token::RParen) {
                return Ok(args);
            }
            self.expect(Token::Comma)?;
        }
    }

    fn primary(&mut self) -> PResult<Expr> {
        let span = self.peek_span();
        let Some(next) = self.advance() else {
            return Err(self.unexpected("expression"));
        };
        let kind = match next.token {
            Token::Int(v) => ExprKind::Literal(Value::Int(v)),
            Token::Float(v) => ExprKind::Literal(Value::Float(v)),
            Token::Str(s) => ExprKind::Literal(Value::Str(s)),
            Token::True => ExprKind::Literal(Value::Bool(true)),
            Token::False => ExprKind::Literal(Value::Bool(false)),
            Token::Null => ExprKind::Literal(Value::Null),
            Token::Ident(name) => ExprKind::Ident(name),
            Token::LParen => {
                let inner = self.expression()?;
                self.expect(Token::RParen)?;
                return Ok(inner);
            }
            _ => {
                self.pos -= 1;
                return Err(self.unexpected("expression"));
            }
        };
        Ok(Expr { kind, span })
    }
}

fn binary_op(token: &Token, level: usize) -> Option<BinOp> {
    match (level, token) {
        (0, Token::EqEq) => Some(BinOp::Eq),
        (0, Token::NotEq) => Some(BinOp::Ne),
        (1, Token::Lt) => Some(BinOp::Lt),
        (1, Token::LtEq) => Some(BinOp::Le),
        (1, Token::Gt) => Some(BinOp::Gt),
        (1, Token::GtEq) => Some(BinOp::Ge),
        (2, Token::Plus) => Some(BinOp::Add),
        (2, Token::Minus) => Some(BinOp::Sub),
        (3, Token::Star) => Some(BinOp::Mul),
        (3, Token::Slash) => Some(BinOp::Div),
        (3, Token::Percent) => Some(BinOp::Rem),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(source: &str) -> Stmt {
        let mut stmts = parse(source).expect("parse");
        assert_eq!(stmts.len(), 1);
        stmts.remove(0)
    }

    #[test]
    fn precedence_binds_multiplication_tighter() {
        let stmt = parse_one("let x = 1 + 2 * 3;");
        let StmtKind::Let { init, .. } = stmt.kind else {
            panic!("expected let");
        };
        let ExprKind::Binary { op, rhs, .. } = init.kind else {
            panic!("expected binary");
        };
        assert_eq!(op, BinOp::Add);
        assert!(matches!(
            rhs.kind,
            ExprKind::Binary {
                op: BinOp::Mul,
                ..
            }
        ));
    }

    #[test]
    fn field_assignment_through_loop_variable() {
        let stmt = parse_one("for row in rows { row.foo = 4; }");
        let StmtKind::For { var, body, .. } = stmt.kind else {
            panic!("expected for");
        };
        assert_eq!(var, "row");
        assert!(matches!(
            &body[0].kind,
            StmtKind::Assign { target, .. } if matches!(target.kind, ExprKind::Field { .. })
        ));
    }

    #[test]
    fn else_if_chains_nest() {
        let stmt = parse_one("if a { } else if b { } else { log(1); }");
        let StmtKind::If { else_block, .. } = stmt.kind else {
            panic!("expected if");
        };
        let else_block = else_block.expect("else");
        assert!(matches!(else_block[0].kind, StmtKind::If { .. }));
    }

    #[test]
    fn missing_semicolon_reports_position() {
        let err = parse("let x = 1\nlet y = 2;").unwrap_err();
        assert_eq!(err.span, Some(Span { line: 2, column: 1 }));
        assert_eq!(err.message, "expected `;`, found `let`");
    }

    #[test]
    fn unclosed_block_reports_end_of_input() {
        let err = parse("while true {").unwrap_err();
        assert!(err.message.contains("end of input"));
    }

    #[test]
    fn literal_is_not_assignable() {
        let err = parse("1 = 2;").unwrap_err();
        assert_eq!(err.message, "invalid assignment target");
    }

    #[test]
    fn calling_a_field_is_rejected() {
        let err = parse("row.foo(1);").unwrap_err();
        assert!(err.message.contains("builtin"));
    }

    #[test]
    fn deep_nesting_is_rejected_not_overflowed() {
        let source = format!("let x = {}1{};", "(".repeat(500), ")".repeat(500));
        let err = parse(&source).unwrap_err();
        assert!(err.message.contains("nests too deeply"));
    }

    #[test]
    fn long_operator_chains_are_rejected_not_overflowed() {
        for source in [
            format!("log(1{});", "+1".repeat(100_000)),
            format!("let x = a{};", " && a".repeat(100_000)),
            format!("let x = a{};", " || a".repeat(100_000)),
            format!("let x = rows[0]{};", ".foo".repeat(100_000)),
            format!("let x = rows{};", "[0]".repeat(100_000)),
        ] {
            let err = parse(&source).unwrap_err();
            assert!(err.message.contains("nests too deeply"), "{}", err.message);
        }
    }

    #[test]
    fn chains_below_the_cap_still_parse() {
        let stmt = parse_one(&format!("let x = 1{};", " + 1".repeat(100)));
        let StmtKind::Let { init, .. } = stmt.kind else {
            panic!("expected let");
        };
        assert!(matches!(init.kind, ExprKind::Binary { op: BinOp::Add, .. }));
    }
}

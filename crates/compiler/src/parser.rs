//! Recursive-descent parser for BQ BASIC
//!
//! Consumes the token stream from [`crate::lexer`] and produces the AST of
//! [`crate::ast`]. The grammar is line-oriented: `:` separates statements
//! within a line, newlines end lines, and structured constructs
//! (IF / SELECT CASE / loops / TRY / SUB / FUNCTION / TYPE) span lines until
//! their closing keyword.
//!
//! The parser performs no name resolution; `name(args)` stays ambiguous
//! between array indexing and calls until the emitter consults the symbol
//! table.

use crate::ast::*;
use crate::error::{CompileError, CompileResult};
use crate::lexer::{Kw, Lexer, Tok, Token};
use crate::symbols::DataValue;

/// Closing keywords a statement sequence stops at (without consuming them).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Term {
    EndIf,
    EndSelect,
    EndSub,
    EndFunction,
    EndTry,
    Else,
    Elseif,
    Wend,
    Next,
    Until,
    Loop,
    Case,
    Catch,
    Finally,
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(source: &str) -> CompileResult<Self> {
        let tokens = Lexer::new(source).tokenize()?;
        Ok(Parser { tokens, pos: 0 })
    }

    pub fn parse(&mut self) -> CompileResult<Program> {
        let mut program = Program::default();
        let mut pending_line: Option<u32> = None;
        let mut line_start = true;

        loop {
            match self.peek() {
                Tok::Eof => break,
                Tok::Newline => {
                    self.bump();
                    line_start = true;
                }
                Tok::Colon => {
                    self.bump();
                    line_start = false;
                }
                Tok::Remark => {
                    let pos = self.here();
                    self.bump();
                    let mut stmt = Stmt::new(StmtKind::Rem, pos);
                    stmt.basic_line = pending_line.take();
                    program.body.push(stmt);
                    line_start = false;
                }
                Tok::Int(n) if line_start => {
                    let n = *n;
                    let line = self.here().line;
                    self.bump();
                    pending_line = Some(u32::try_from(n).map_err(|_| {
                        CompileError::syntax(line, format!("bad line number {}", n))
                    })?);
                    line_start = false;
                }
                Tok::Kw(Kw::Sub) => {
                    self.bump();
                    let proc = self.parse_procedure(ProcedureKind::Sub)?;
                    program.procedures.push(proc);
                    line_start = false;
                }
                Tok::Kw(Kw::Function) => {
                    self.bump();
                    let proc = self.parse_procedure(ProcedureKind::Function)?;
                    program.procedures.push(proc);
                    line_start = false;
                }
                Tok::Kw(Kw::Def) => {
                    self.bump();
                    let proc = self.parse_def_fn()?;
                    program.procedures.push(proc);
                    line_start = false;
                }
                _ => {
                    if line_start && self.at_label() {
                        let pos = self.here();
                        let name = self.expect_ident()?;
                        self.expect(&Tok::Colon)?;
                        let mut stmt = Stmt::new(StmtKind::Label(name), pos);
                        stmt.basic_line = pending_line.take();
                        program.body.push(stmt);
                        line_start = false;
                        continue;
                    }
                    let mut stmt = self.parse_statement()?;
                    stmt.basic_line = pending_line.take();
                    program.body.push(stmt);
                    line_start = false;
                }
            }
        }
        Ok(program)
    }

    // =========================================================================
    // Token plumbing
    // =========================================================================

    fn peek(&self) -> &Tok {
        &self.tokens[self.pos].tok
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx].tok
    }

    fn here(&self) -> SourcePos {
        let t = &self.tokens[self.pos];
        SourcePos::new(t.line, t.column)
    }

    fn line(&self) -> u32 {
        self.tokens[self.pos].line
    }

    fn bump(&mut self) -> Tok {
        let tok = self.tokens[self.pos].tok.clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn accept(&mut self, tok: &Tok) -> bool {
        if self.peek() == tok {
            self.bump();
            true
        } else {
            false
        }
    }

    fn accept_kw(&mut self, kw: Kw) -> bool {
        self.accept(&Tok::Kw(kw))
    }

    fn expect(&mut self, tok: &Tok) -> CompileResult<()> {
        if self.accept(tok) {
            Ok(())
        } else {
            Err(CompileError::syntax(
                self.line(),
                format!("expected {:?}, found {:?}", tok, self.peek()),
            ))
        }
    }

    fn expect_kw(&mut self, kw: Kw) -> CompileResult<()> {
        self.expect(&Tok::Kw(kw))
    }

    fn expect_ident(&mut self) -> CompileResult<String> {
        match self.peek().clone() {
            Tok::Ident(name) => {
                self.bump();
                Ok(name)
            }
            other => Err(CompileError::syntax(
                self.line(),
                format!("expected identifier, found {:?}", other),
            )),
        }
    }

    /// `IDENT :` at line start defines a jump label.
    fn at_label(&self) -> bool {
        matches!(self.peek(), Tok::Ident(_)) && *self.peek_at(1) == Tok::Colon
    }

    fn at_stmt_end(&self) -> bool {
        matches!(
            self.peek(),
            Tok::Colon | Tok::Newline | Tok::Eof | Tok::Remark
        )
    }

    /// True when the current tokens close a construct from `terms`.
    fn at_terminator(&self, terms: &[Term]) -> bool {
        let tok = self.peek();
        let next = self.peek_at(1);
        terms.iter().any(|t| match t {
            Term::EndIf => *tok == Tok::Kw(Kw::End) && *next == Tok::Kw(Kw::If),
            Term::EndSelect => *tok == Tok::Kw(Kw::End) && *next == Tok::Kw(Kw::Select),
            Term::EndSub => *tok == Tok::Kw(Kw::End) && *next == Tok::Kw(Kw::Sub),
            Term::EndFunction => *tok == Tok::Kw(Kw::End) && *next == Tok::Kw(Kw::Function),
            Term::EndTry => *tok == Tok::Kw(Kw::End) && *next == Tok::Kw(Kw::Try),
            Term::Else => *tok == Tok::Kw(Kw::Else),
            Term::Elseif => *tok == Tok::Kw(Kw::Elseif),
            Term::Wend => *tok == Tok::Kw(Kw::Wend),
            Term::Next => *tok == Tok::Kw(Kw::Next),
            Term::Until => *tok == Tok::Kw(Kw::Until),
            Term::Loop => *tok == Tok::Kw(Kw::Loop),
            Term::Case => *tok == Tok::Kw(Kw::Case),
            Term::Catch => *tok == Tok::Kw(Kw::Catch),
            Term::Finally => *tok == Tok::Kw(Kw::Finally),
        })
    }

    // =========================================================================
    // Statement sequences
    // =========================================================================

    /// Parse statements until a terminator from `terms` (left unconsumed).
    fn parse_sequence(&mut self, terms: &[Term]) -> CompileResult<Vec<Stmt>> {
        let mut stmts = Vec::new();
        let mut pending_line: Option<u32> = None;
        let mut line_start = false;

        loop {
            match self.peek() {
                Tok::Eof => break,
                Tok::Newline => {
                    self.bump();
                    line_start = true;
                }
                Tok::Colon => {
                    self.bump();
                    line_start = false;
                }
                Tok::Remark => {
                    let pos = self.here();
                    self.bump();
                    let mut stmt = Stmt::new(StmtKind::Rem, pos);
                    stmt.basic_line = pending_line.take();
                    stmts.push(stmt);
                    line_start = false;
                }
                Tok::Int(n) if line_start => {
                    let n = *n;
                    let line = self.here().line;
                    self.bump();
                    pending_line = Some(u32::try_from(n).map_err(|_| {
                        CompileError::syntax(line, format!("bad line number {}", n))
                    })?);
                    line_start = false;
                }
                _ if self.at_terminator(terms) => break,
                _ => {
                    if line_start && self.at_label() {
                        let pos = self.here();
                        let name = self.expect_ident()?;
                        self.expect(&Tok::Colon)?;
                        let mut stmt = Stmt::new(StmtKind::Label(name), pos);
                        stmt.basic_line = pending_line.take();
                        stmts.push(stmt);
                        line_start = false;
                        continue;
                    }
                    let mut stmt = self.parse_statement()?;
                    stmt.basic_line = pending_line.take();
                    stmts.push(stmt);
                    line_start = false;
                }
            }
        }
        Ok(stmts)
    }

    /// Statements on the rest of the current line (single-line IF bodies).
    fn parse_inline_body(&mut self, stop_at_else: bool) -> CompileResult<Vec<Stmt>> {
        let mut stmts = Vec::new();
        loop {
            match self.peek() {
                Tok::Newline | Tok::Eof | Tok::Remark => break,
                Tok::Colon => {
                    self.bump();
                }
                Tok::Kw(Kw::Else) if stop_at_else => break,
                _ => stmts.push(self.parse_statement()?),
            }
        }
        Ok(stmts)
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn parse_statement(&mut self) -> CompileResult<Stmt> {
        let pos = self.here();
        let kind = match self.peek().clone() {
            Tok::Kw(Kw::Let) => {
                self.bump();
                self.parse_assignment()?
            }
            Tok::Ident(_) => self.parse_assignment_or_call()?,
            Tok::Kw(Kw::Print) => {
                self.bump();
                self.parse_print()?
            }
            Tok::Kw(Kw::Input) => {
                self.bump();
                self.parse_input()?
            }
            Tok::Kw(Kw::If) => {
                self.bump();
                self.parse_if()?
            }
            Tok::Kw(Kw::Select) => {
                self.bump();
                self.expect_kw(Kw::Case)?;
                self.parse_select()?
            }
            Tok::Kw(Kw::For) => {
                self.bump();
                self.parse_for()?
            }
            Tok::Kw(Kw::While) => {
                self.bump();
                let cond = self.parse_expr()?;
                let body = self.parse_sequence(&[Term::Wend])?;
                self.expect_kw(Kw::Wend)?;
                StmtKind::While { cond, body }
            }
            Tok::Kw(Kw::Repeat) => {
                self.bump();
                let body = self.parse_sequence(&[Term::Until])?;
                self.expect_kw(Kw::Until)?;
                let until = self.parse_expr()?;
                StmtKind::Repeat { body, until }
            }
            Tok::Kw(Kw::Do) => {
                self.bump();
                self.parse_do()?
            }
            Tok::Kw(Kw::Exit) => {
                self.bump();
                self.parse_exit()?
            }
            Tok::Kw(Kw::Continue) => {
                self.bump();
                self.parse_continue()?
            }
            Tok::Kw(Kw::Goto) => {
                self.bump();
                StmtKind::Goto(self.parse_jump_target()?)
            }
            Tok::Kw(Kw::Gosub) => {
                self.bump();
                StmtKind::Gosub(self.parse_jump_target()?)
            }
            Tok::Kw(Kw::Return) => {
                self.bump();
                StmtKind::Return
            }
            Tok::Kw(Kw::On) => {
                self.bump();
                self.parse_on()?
            }
            Tok::Kw(Kw::Call) => {
                self.bump();
                let name = self.expect_ident()?;
                let args = self.parse_call_args()?;
                StmtKind::Call { name, args }
            }
            Tok::Kw(Kw::Try) => {
                self.bump();
                self.parse_try()?
            }
            Tok::Kw(Kw::Throw) => {
                self.bump();
                StmtKind::Throw(self.parse_expr()?)
            }
            Tok::Kw(Kw::Dim) => {
                self.bump();
                self.parse_dim()?
            }
            Tok::Kw(Kw::Redim) => {
                self.bump();
                self.parse_redim()?
            }
            Tok::Kw(Kw::Erase) => {
                self.bump();
                let mut names = vec![self.expect_ident()?];
                while self.accept(&Tok::Comma) {
                    names.push(self.expect_ident()?);
                }
                StmtKind::Erase(names)
            }
            Tok::Kw(Kw::Data) => {
                self.bump();
                self.parse_data()?
            }
            Tok::Kw(Kw::Read) => {
                self.bump();
                let mut targets = vec![self.parse_lvalue()?];
                while self.accept(&Tok::Comma) {
                    targets.push(self.parse_lvalue()?);
                }
                StmtKind::Read(targets)
            }
            Tok::Kw(Kw::Restore) => {
                self.bump();
                if self.at_stmt_end() {
                    StmtKind::Restore(None)
                } else {
                    StmtKind::Restore(Some(self.parse_jump_target()?))
                }
            }
            Tok::Kw(Kw::Swap) => {
                self.bump();
                let a = self.parse_lvalue()?;
                self.expect(&Tok::Comma)?;
                let b = self.parse_lvalue()?;
                StmtKind::Swap(a, b)
            }
            Tok::Kw(Kw::Inc) => {
                self.bump();
                let target = self.parse_lvalue()?;
                let amount = if self.accept(&Tok::Comma) {
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                StmtKind::Inc(target, amount)
            }
            Tok::Kw(Kw::Dec) => {
                self.bump();
                let target = self.parse_lvalue()?;
                let amount = if self.accept(&Tok::Comma) {
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                StmtKind::Dec(target, amount)
            }
            Tok::Kw(Kw::Const) => {
                self.bump();
                let name = self.expect_ident()?;
                self.expect(&Tok::Eq)?;
                let value = self.parse_expr()?;
                StmtKind::Const { name, value }
            }
            Tok::Kw(Kw::Type) => {
                self.bump();
                self.parse_type_decl()?
            }
            Tok::Kw(Kw::Option) => {
                self.bump();
                self.parse_option()?
            }
            Tok::Kw(Kw::End) => {
                self.bump();
                StmtKind::End
            }
            Tok::Kw(Kw::Include) => {
                return Err(CompileError::syntax(
                    pos.line,
                    "INCLUDE must be resolved by the driver before parsing",
                ));
            }
            other => {
                return Err(CompileError::syntax(
                    pos.line,
                    format!("unexpected {:?} at start of statement", other),
                ));
            }
        };
        Ok(Stmt::new(kind, pos))
    }

    /// `LET` form: lvalue `=` expr.
    fn parse_assignment(&mut self) -> CompileResult<StmtKind> {
        let target = self.parse_lvalue()?;
        self.expect(&Tok::Eq)?;
        let value = self.parse_expr()?;
        Ok(StmtKind::Let { target, value })
    }

    /// Leading identifier: assignment, array-element store, or SUB call.
    fn parse_assignment_or_call(&mut self) -> CompileResult<StmtKind> {
        let name = self.expect_ident()?;

        if self.accept(&Tok::Eq) {
            let value = self.parse_expr()?;
            return Ok(StmtKind::Let {
                target: LValue::Var(name),
                value,
            });
        }

        if *self.peek() == Tok::LParen {
            self.bump();
            let mut args = Vec::new();
            if *self.peek() != Tok::RParen {
                args.push(self.parse_expr()?);
                while self.accept(&Tok::Comma) {
                    args.push(self.parse_expr()?);
                }
            }
            self.expect(&Tok::RParen)?;

            if self.accept(&Tok::Eq) {
                let value = self.parse_expr()?;
                return Ok(StmtKind::Let {
                    target: LValue::Elem {
                        name,
                        indices: args,
                    },
                    value,
                });
            }
            if *self.peek() == Tok::Dot {
                let base = LValue::Elem {
                    name,
                    indices: args,
                };
                let target = self.parse_field_lvalue(base)?;
                self.expect(&Tok::Eq)?;
                let value = self.parse_expr()?;
                return Ok(StmtKind::Let { target, value });
            }
            return Ok(StmtKind::Call { name, args });
        }

        if *self.peek() == Tok::Dot {
            let target = self.parse_field_lvalue(LValue::Var(name))?;
            self.expect(&Tok::Eq)?;
            let value = self.parse_expr()?;
            return Ok(StmtKind::Let { target, value });
        }

        // Bare SUB call, possibly with unparenthesized arguments
        let args = self.parse_call_args()?;
        Ok(StmtKind::Call { name, args })
    }

    fn parse_field_lvalue(&mut self, mut base: LValue) -> CompileResult<LValue> {
        while self.accept(&Tok::Dot) {
            let field = self.expect_ident()?;
            base = LValue::Field {
                base: Box::new(base),
                field,
            };
        }
        Ok(base)
    }

    /// Arguments to a CALL: parenthesized, bare list, or none.
    fn parse_call_args(&mut self) -> CompileResult<Vec<Expr>> {
        if self.accept(&Tok::LParen) {
            let mut args = Vec::new();
            if *self.peek() != Tok::RParen {
                args.push(self.parse_expr()?);
                while self.accept(&Tok::Comma) {
                    args.push(self.parse_expr()?);
                }
            }
            self.expect(&Tok::RParen)?;
            return Ok(args);
        }
        if self.at_stmt_end() || self.at_terminator(&[Term::Else]) {
            return Ok(Vec::new());
        }
        let mut args = vec![self.parse_expr()?];
        while self.accept(&Tok::Comma) {
            args.push(self.parse_expr()?);
        }
        Ok(args)
    }

    fn parse_print(&mut self) -> CompileResult<StmtKind> {
        let mut items = Vec::new();
        let mut no_newline = false;

        while !self.at_stmt_end() && !self.at_terminator(&[Term::Else]) {
            let expr = self.parse_expr()?;
            let sep = if self.accept(&Tok::Semicolon) {
                Some(PrintSep::Semicolon)
            } else if self.accept(&Tok::Comma) {
                Some(PrintSep::Comma)
            } else {
                None
            };
            let last = sep.is_none()
                || self.at_stmt_end()
                || self.at_terminator(&[Term::Else]);
            items.push(PrintItem { expr, sep });
            if last {
                no_newline = sep.is_some();
                break;
            }
        }
        Ok(StmtKind::Print { items, no_newline })
    }

    fn parse_input(&mut self) -> CompileResult<StmtKind> {
        let mut prompt = None;
        if let Tok::Str(text) = self.peek().clone() {
            // `INPUT "prompt"; var` or `INPUT "prompt", var`
            if matches!(self.peek_at(1), Tok::Semicolon | Tok::Comma) {
                self.bump();
                self.bump();
                prompt = Some(text);
            }
        }
        let mut targets = vec![self.parse_lvalue()?];
        while self.accept(&Tok::Comma) {
            targets.push(self.parse_lvalue()?);
        }
        Ok(StmtKind::Input { prompt, targets })
    }

    fn parse_if(&mut self) -> CompileResult<StmtKind> {
        let cond = self.parse_expr()?;

        // `IF cond GOTO target`
        if self.accept_kw(Kw::Goto) {
            let target = self.parse_jump_target()?;
            let pos = self.here();
            return Ok(StmtKind::If {
                cond,
                then_body: vec![Stmt::new(StmtKind::Goto(target), pos)],
                elseifs: Vec::new(),
                else_body: None,
            });
        }

        self.expect_kw(Kw::Then)?;

        // `IF cond THEN 100` — line-number shorthand for GOTO
        if let Tok::Int(n) = self.peek() {
            let n = *n;
            let line = self.line();
            self.bump();
            let target = JumpTarget::Line(u32::try_from(n).map_err(|_| {
                CompileError::syntax(line, format!("bad line number {}", n))
            })?);
            let pos = self.here();
            let then_body = vec![Stmt::new(StmtKind::Goto(target), pos)];
            let else_body = if self.accept_kw(Kw::Else) {
                Some(self.parse_inline_body(false)?)
            } else {
                None
            };
            return Ok(StmtKind::If {
                cond,
                then_body,
                elseifs: Vec::new(),
                else_body,
            });
        }

        // Block form: THEN followed by end of line
        if matches!(self.peek(), Tok::Newline | Tok::Remark) {
            let then_body = self.parse_sequence(&[Term::Elseif, Term::Else, Term::EndIf])?;
            let mut elseifs = Vec::new();
            while self.accept_kw(Kw::Elseif) {
                let c = self.parse_expr()?;
                self.expect_kw(Kw::Then)?;
                let body = self.parse_sequence(&[Term::Elseif, Term::Else, Term::EndIf])?;
                elseifs.push((c, body));
            }
            let else_body = if self.accept_kw(Kw::Else) {
                Some(self.parse_sequence(&[Term::EndIf])?)
            } else {
                None
            };
            self.expect_kw(Kw::End)?;
            self.expect_kw(Kw::If)?;
            return Ok(StmtKind::If {
                cond,
                then_body,
                elseifs,
                else_body,
            });
        }

        // Single-line form
        let then_body = self.parse_inline_body(true)?;
        let else_body = if self.accept_kw(Kw::Else) {
            Some(self.parse_inline_body(false)?)
        } else {
            None
        };
        Ok(StmtKind::If {
            cond,
            then_body,
            elseifs: Vec::new(),
            else_body,
        })
    }

    fn parse_select(&mut self) -> CompileResult<StmtKind> {
        let selector = self.parse_expr()?;
        let mut arms = Vec::new();
        let mut else_body = None;

        loop {
            // Skip to the next CASE / END SELECT
            match self.peek() {
                Tok::Newline | Tok::Colon | Tok::Remark => {
                    self.bump();
                    continue;
                }
                _ => {}
            }
            if self.at_terminator(&[Term::EndSelect]) {
                break;
            }
            if !self.accept_kw(Kw::Case) {
                return Err(CompileError::syntax(
                    self.line(),
                    format!("expected CASE or END SELECT, found {:?}", self.peek()),
                ));
            }
            if self.accept_kw(Kw::Else) {
                if else_body.is_some() {
                    return Err(CompileError::syntax(self.line(), "duplicate CASE ELSE"));
                }
                else_body = Some(self.parse_sequence(&[Term::Case, Term::EndSelect])?);
                continue;
            }
            let tests = self.parse_case_tests()?;
            let body = self.parse_sequence(&[Term::Case, Term::EndSelect])?;
            arms.push(CaseArm { tests, body });
        }
        self.expect_kw(Kw::End)?;
        self.expect_kw(Kw::Select)?;
        Ok(StmtKind::Select {
            selector,
            arms,
            else_body,
        })
    }

    fn parse_case_tests(&mut self) -> CompileResult<Vec<CaseTest>> {
        let mut tests = Vec::new();
        loop {
            if self.accept_kw(Kw::Is) {
                let op = self.parse_relop()?;
                let value = self.parse_expr()?;
                tests.push(CaseTest::Relational(op, value));
            } else {
                let lo = self.parse_expr()?;
                if self.accept_kw(Kw::To) {
                    let hi = self.parse_expr()?;
                    tests.push(CaseTest::Range(lo, hi));
                } else {
                    tests.push(CaseTest::Value(lo));
                }
            }
            if !self.accept(&Tok::Comma) {
                break;
            }
        }
        Ok(tests)
    }

    fn parse_relop(&mut self) -> CompileResult<BinOp> {
        let op = match self.peek() {
            Tok::Eq => BinOp::Eq,
            Tok::Ne => BinOp::Ne,
            Tok::Lt => BinOp::Lt,
            Tok::Le => BinOp::Le,
            Tok::Gt => BinOp::Gt,
            Tok::Ge => BinOp::Ge,
            other => {
                return Err(CompileError::syntax(
                    self.line(),
                    format!("expected relational operator, found {:?}", other),
                ));
            }
        };
        self.bump();
        Ok(op)
    }

    fn parse_for(&mut self) -> CompileResult<StmtKind> {
        let var = self.expect_ident()?;
        self.expect(&Tok::Eq)?;
        let start = self.parse_expr()?;
        self.expect_kw(Kw::To)?;
        let end = self.parse_expr()?;
        let step = if self.accept_kw(Kw::Step) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        let body = self.parse_sequence(&[Term::Next])?;
        self.expect_kw(Kw::Next)?;
        if let Tok::Ident(counter) = self.peek().clone() {
            self.bump();
            if counter != var {
                return Err(CompileError::syntax(
                    self.line(),
                    format!("NEXT {} does not match FOR {}", counter, var),
                ));
            }
        }
        Ok(StmtKind::For {
            var,
            start,
            end,
            step,
            body,
        })
    }

    fn parse_do(&mut self) -> CompileResult<StmtKind> {
        let pre = if self.accept_kw(Kw::While) {
            Some((DoCond::While, self.parse_expr()?))
        } else if self.accept_kw(Kw::Until) {
            Some((DoCond::Until, self.parse_expr()?))
        } else {
            None
        };
        let body = self.parse_sequence(&[Term::Loop])?;
        self.expect_kw(Kw::Loop)?;
        let post = if self.accept_kw(Kw::While) {
            Some((DoCond::While, self.parse_expr()?))
        } else if self.accept_kw(Kw::Until) {
            Some((DoCond::Until, self.parse_expr()?))
        } else {
            None
        };
        if pre.is_some() && post.is_some() {
            return Err(CompileError::syntax(
                self.line(),
                "DO loop cannot have both a pre- and a post-condition",
            ));
        }
        Ok(StmtKind::Do { pre, post, body })
    }

    fn parse_exit(&mut self) -> CompileResult<StmtKind> {
        let kind = if self.accept_kw(Kw::For) {
            ExitKind::For
        } else if self.accept_kw(Kw::While) {
            ExitKind::While
        } else if self.accept_kw(Kw::Do) {
            ExitKind::Do
        } else if self.accept_kw(Kw::Select) {
            ExitKind::Select
        } else if self.accept_kw(Kw::Sub) {
            ExitKind::Sub
        } else if self.accept_kw(Kw::Function) {
            ExitKind::Function
        } else {
            return Err(CompileError::syntax(
                self.line(),
                "EXIT requires FOR, WHILE, DO, SELECT, SUB or FUNCTION",
            ));
        };
        Ok(StmtKind::Exit(kind))
    }

    fn parse_continue(&mut self) -> CompileResult<StmtKind> {
        let kind = if self.accept_kw(Kw::For) {
            ContinueKind::For
        } else if self.accept_kw(Kw::While) {
            ContinueKind::While
        } else if self.accept_kw(Kw::Do) {
            ContinueKind::Do
        } else {
            return Err(CompileError::syntax(
                self.line(),
                "CONTINUE requires FOR, WHILE or DO",
            ));
        };
        Ok(StmtKind::Continue(kind))
    }

    fn parse_jump_target(&mut self) -> CompileResult<JumpTarget> {
        match self.peek().clone() {
            Tok::Int(n) => {
                let line = self.line();
                self.bump();
                Ok(JumpTarget::Line(u32::try_from(n).map_err(|_| {
                    CompileError::syntax(line, format!("bad line number {}", n))
                })?))
            }
            Tok::Ident(name) => {
                self.bump();
                Ok(JumpTarget::Label(name))
            }
            other => Err(CompileError::syntax(
                self.line(),
                format!("expected line number or label, found {:?}", other),
            )),
        }
    }

    fn parse_on(&mut self) -> CompileResult<StmtKind> {
        let selector = self.parse_expr()?;
        if self.accept_kw(Kw::Goto) {
            let mut targets = vec![self.parse_jump_target()?];
            while self.accept(&Tok::Comma) {
                targets.push(self.parse_jump_target()?);
            }
            Ok(StmtKind::OnGoto { selector, targets })
        } else if self.accept_kw(Kw::Gosub) {
            let mut targets = vec![self.parse_jump_target()?];
            while self.accept(&Tok::Comma) {
                targets.push(self.parse_jump_target()?);
            }
            Ok(StmtKind::OnGosub { selector, targets })
        } else if self.accept_kw(Kw::Call) {
            let mut targets = vec![self.expect_ident()?];
            while self.accept(&Tok::Comma) {
                targets.push(self.expect_ident()?);
            }
            Ok(StmtKind::OnCall { selector, targets })
        } else {
            Err(CompileError::syntax(
                self.line(),
                "ON requires GOTO, GOSUB or CALL",
            ))
        }
    }

    fn parse_try(&mut self) -> CompileResult<StmtKind> {
        let body = self.parse_sequence(&[Term::Catch, Term::Finally, Term::EndTry])?;
        let mut catches = Vec::new();
        while *self.peek() == Tok::Kw(Kw::Catch) {
            let pos = self.here();
            self.bump();
            let mut codes = Vec::new();
            if !matches!(self.peek(), Tok::Newline | Tok::Colon | Tok::Remark) {
                codes.push(self.parse_expr()?);
                while self.accept(&Tok::Comma) {
                    codes.push(self.parse_expr()?);
                }
            }
            let body = self.parse_sequence(&[Term::Catch, Term::Finally, Term::EndTry])?;
            catches.push(CatchClause { codes, body, pos });
        }
        let finally = if self.accept_kw(Kw::Finally) {
            Some(self.parse_sequence(&[Term::EndTry])?)
        } else {
            None
        };
        self.expect_kw(Kw::End)?;
        self.expect_kw(Kw::Try)?;
        Ok(StmtKind::Try {
            body,
            catches,
            finally,
        })
    }

    fn parse_dim(&mut self) -> CompileResult<StmtKind> {
        let mut decls = Vec::new();
        loop {
            let name = self.expect_ident()?;
            let mut bounds = Vec::new();
            let mut dynamic = false;
            if self.accept(&Tok::LParen) {
                if self.accept(&Tok::RParen) {
                    dynamic = true;
                } else {
                    bounds = self.parse_bounds()?;
                    self.expect(&Tok::RParen)?;
                }
            }
            let ty = if self.accept_kw(Kw::As) {
                Some(self.parse_type_name()?)
            } else {
                None
            };
            decls.push(DimDecl {
                name,
                ty,
                bounds,
                dynamic,
            });
            if !self.accept(&Tok::Comma) {
                break;
            }
        }
        Ok(StmtKind::Dim(decls))
    }

    fn parse_redim(&mut self) -> CompileResult<StmtKind> {
        let preserve = self.accept_kw(Kw::Preserve);
        let name = self.expect_ident()?;
        self.expect(&Tok::LParen)?;
        let bounds = self.parse_bounds()?;
        self.expect(&Tok::RParen)?;
        Ok(StmtKind::Redim {
            preserve,
            name,
            bounds,
        })
    }

    /// `lo TO hi` or bare `hi` (lower bound from OPTION BASE), comma-separated.
    fn parse_bounds(&mut self) -> CompileResult<Vec<(Option<Expr>, Expr)>> {
        let mut bounds = Vec::new();
        loop {
            let first = self.parse_expr()?;
            if self.accept_kw(Kw::To) {
                let hi = self.parse_expr()?;
                bounds.push((Some(first), hi));
            } else {
                bounds.push((None, first));
            }
            if !self.accept(&Tok::Comma) {
                break;
            }
        }
        Ok(bounds)
    }

    fn parse_data(&mut self) -> CompileResult<StmtKind> {
        let mut values = Vec::new();
        loop {
            let negative = self.accept(&Tok::Minus);
            match self.peek().clone() {
                Tok::Int(n) => {
                    self.bump();
                    values.push(DataValue::Int(if negative { -n } else { n }));
                }
                Tok::Float(f) => {
                    self.bump();
                    values.push(DataValue::Float(if negative { -f } else { f }));
                }
                Tok::Str(s) if !negative => {
                    self.bump();
                    values.push(DataValue::Str(s));
                }
                other => {
                    return Err(CompileError::syntax(
                        self.line(),
                        format!("expected DATA literal, found {:?}", other),
                    ));
                }
            }
            if !self.accept(&Tok::Comma) {
                break;
            }
        }
        Ok(StmtKind::Data(values))
    }

    fn parse_type_decl(&mut self) -> CompileResult<StmtKind> {
        let name = self.expect_ident()?;
        let mut fields = Vec::new();
        loop {
            match self.peek() {
                Tok::Newline | Tok::Colon | Tok::Remark => {
                    self.bump();
                }
                Tok::Kw(Kw::End) if *self.peek_at(1) == Tok::Kw(Kw::Type) => {
                    self.bump();
                    self.bump();
                    break;
                }
                Tok::Ident(_) => {
                    let field = self.expect_ident()?;
                    self.expect_kw(Kw::As)?;
                    let ty = self.parse_type_name()?;
                    fields.push((field, ty));
                }
                other => {
                    return Err(CompileError::syntax(
                        self.line(),
                        format!("expected field declaration or END TYPE, found {:?}", other),
                    ));
                }
            }
        }
        Ok(StmtKind::TypeDecl { name, fields })
    }

    fn parse_type_name(&mut self) -> CompileResult<TypeName> {
        let name = self.expect_ident()?;
        let ty = match name.as_str() {
            "integer" => TypeName::Integer,
            "long" => TypeName::Long,
            "single" => TypeName::Single,
            "double" => TypeName::Double,
            "string" => TypeName::Str,
            _ => TypeName::User(name),
        };
        Ok(ty)
    }

    fn parse_option(&mut self) -> CompileResult<StmtKind> {
        let setting = if self.accept_kw(Kw::Base) {
            match self.peek().clone() {
                Tok::Int(n @ (0 | 1)) => {
                    self.bump();
                    OptionSetting::Base(n)
                }
                other => {
                    return Err(CompileError::syntax(
                        self.line(),
                        format!("OPTION BASE requires 0 or 1, found {:?}", other),
                    ));
                }
            }
        } else if self.accept_kw(Kw::Explicit) {
            OptionSetting::Explicit
        } else if self.accept_kw(Kw::Bitwise) {
            OptionSetting::Bitwise
        } else if self.accept_kw(Kw::Logical) {
            OptionSetting::Logical
        } else if self.accept_kw(Kw::Detectstring) {
            OptionSetting::StringDetect
        } else if let Tok::Ident(word) = self.peek().clone() {
            self.bump();
            match word.as_str() {
                "unicode" => OptionSetting::StringUnicode,
                "ascii" => OptionSetting::StringAscii,
                other => {
                    return Err(CompileError::syntax(
                        self.line(),
                        format!("unknown OPTION '{}'", other),
                    ));
                }
            }
        } else {
            return Err(CompileError::syntax(
                self.line(),
                format!("unknown OPTION {:?}", self.peek()),
            ));
        };
        Ok(StmtKind::Option(setting))
    }

    // =========================================================================
    // Procedures
    // =========================================================================

    fn parse_procedure(&mut self, kind: ProcedureKind) -> CompileResult<Procedure> {
        let pos = self.here();
        let name = self.expect_ident()?;
        let params = self.parse_params()?;
        let return_type = if kind == ProcedureKind::Function && self.accept_kw(Kw::As) {
            Some(self.parse_type_name()?)
        } else {
            None
        };

        let term = match kind {
            ProcedureKind::Sub => Term::EndSub,
            ProcedureKind::Function => Term::EndFunction,
        };
        let body = self.parse_sequence(&[term])?;
        self.expect_kw(Kw::End)?;
        match kind {
            ProcedureKind::Sub => self.expect_kw(Kw::Sub)?,
            ProcedureKind::Function => self.expect_kw(Kw::Function)?,
        }

        Ok(Procedure {
            name,
            kind,
            params,
            return_type,
            body,
            pos,
        })
    }

    /// `DEF FNname(params) = expr` — legacy single-expression function.
    fn parse_def_fn(&mut self) -> CompileResult<Procedure> {
        let pos = self.here();
        let name = self.expect_ident()?;
        if !name.starts_with("fn") {
            return Err(CompileError::syntax(
                pos.line,
                "DEF requires a function name starting with FN",
            ));
        }
        let params = self.parse_params()?;
        self.expect(&Tok::Eq)?;
        let value = self.parse_expr()?;
        let body = vec![Stmt::new(
            StmtKind::Let {
                target: LValue::Var(name.clone()),
                value,
            },
            pos,
        )];
        Ok(Procedure {
            name,
            kind: ProcedureKind::Function,
            params,
            return_type: None,
            body,
            pos,
        })
    }

    fn parse_params(&mut self) -> CompileResult<Vec<Param>> {
        let mut params = Vec::new();
        if !self.accept(&Tok::LParen) {
            return Ok(params);
        }
        if self.accept(&Tok::RParen) {
            return Ok(params);
        }
        loop {
            let by_ref = if self.accept_kw(Kw::Byref) {
                true
            } else {
                self.accept_kw(Kw::Byval);
                false
            };
            let name = self.expect_ident()?;
            let ty = if self.accept_kw(Kw::As) {
                Some(self.parse_type_name()?)
            } else {
                None
            };
            params.push(Param { name, ty, by_ref });
            if !self.accept(&Tok::Comma) {
                break;
            }
        }
        self.expect(&Tok::RParen)?;
        Ok(params)
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn parse_lvalue(&mut self) -> CompileResult<LValue> {
        let name = self.expect_ident()?;
        let mut base = if self.accept(&Tok::LParen) {
            let mut indices = Vec::new();
            if *self.peek() != Tok::RParen {
                indices.push(self.parse_expr()?);
                while self.accept(&Tok::Comma) {
                    indices.push(self.parse_expr()?);
                }
            }
            self.expect(&Tok::RParen)?;
            LValue::Elem { name, indices }
        } else {
            LValue::Var(name)
        };
        while self.accept(&Tok::Dot) {
            let field = self.expect_ident()?;
            base = LValue::Field {
                base: Box::new(base),
                field,
            };
        }
        Ok(base)
    }

    pub fn parse_expr(&mut self) -> CompileResult<Expr> {
        self.parse_xor()
    }

    fn parse_xor(&mut self) -> CompileResult<Expr> {
        let mut lhs = self.parse_or()?;
        while self.accept_kw(Kw::Xor) {
            let pos = lhs.pos;
            let rhs = self.parse_or()?;
            lhs = Expr::new(
                ExprKind::Binary {
                    op: BinOp::Xor,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                pos,
            );
        }
        Ok(lhs)
    }

    fn parse_or(&mut self) -> CompileResult<Expr> {
        let mut lhs = self.parse_and()?;
        while self.accept_kw(Kw::Or) {
            let pos = lhs.pos;
            let rhs = self.parse_and()?;
            lhs = Expr::new(
                ExprKind::Binary {
                    op: BinOp::Or,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                pos,
            );
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> CompileResult<Expr> {
        let mut lhs = self.parse_not()?;
        while self.accept_kw(Kw::And) {
            let pos = lhs.pos;
            let rhs = self.parse_not()?;
            lhs = Expr::new(
                ExprKind::Binary {
                    op: BinOp::And,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                pos,
            );
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> CompileResult<Expr> {
        if self.accept_kw(Kw::Not) {
            let pos = self.here();
            let operand = self.parse_not()?;
            return Ok(Expr::new(
                ExprKind::Unary {
                    op: UnOp::Not,
                    operand: Box::new(operand),
                },
                pos,
            ));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> CompileResult<Expr> {
        let lhs = self.parse_addsub()?;
        let op = match self.peek() {
            Tok::Eq => BinOp::Eq,
            Tok::Ne => BinOp::Ne,
            Tok::Lt => BinOp::Lt,
            Tok::Le => BinOp::Le,
            Tok::Gt => BinOp::Gt,
            Tok::Ge => BinOp::Ge,
            _ => return Ok(lhs),
        };
        self.bump();
        let pos = lhs.pos;
        let rhs = self.parse_addsub()?;
        Ok(Expr::new(
            ExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            pos,
        ))
    }

    fn parse_addsub(&mut self) -> CompileResult<Expr> {
        let mut lhs = self.parse_modulo()?;
        loop {
            let op = match self.peek() {
                Tok::Plus => BinOp::Add,
                Tok::Minus => BinOp::Sub,
                _ => break,
            };
            self.bump();
            let pos = lhs.pos;
            let rhs = self.parse_modulo()?;
            lhs = Expr::new(
                ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                pos,
            );
        }
        Ok(lhs)
    }

    fn parse_modulo(&mut self) -> CompileResult<Expr> {
        let mut lhs = self.parse_intdiv()?;
        while self.accept_kw(Kw::Mod) {
            let pos = lhs.pos;
            let rhs = self.parse_intdiv()?;
            lhs = Expr::new(
                ExprKind::Binary {
                    op: BinOp::Mod,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                pos,
            );
        }
        Ok(lhs)
    }

    fn parse_intdiv(&mut self) -> CompileResult<Expr> {
        let mut lhs = self.parse_muldiv()?;
        while self.accept(&Tok::Backslash) {
            let pos = lhs.pos;
            let rhs = self.parse_muldiv()?;
            lhs = Expr::new(
                ExprKind::Binary {
                    op: BinOp::IntDiv,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                pos,
            );
        }
        Ok(lhs)
    }

    fn parse_muldiv(&mut self) -> CompileResult<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Tok::Star => BinOp::Mul,
                Tok::Slash => BinOp::Div,
                _ => break,
            };
            self.bump();
            let pos = lhs.pos;
            let rhs = self.parse_unary()?;
            lhs = Expr::new(
                ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                pos,
            );
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> CompileResult<Expr> {
        if *self.peek() == Tok::Minus {
            let pos = self.here();
            self.bump();
            let operand = self.parse_unary()?;
            return Ok(Expr::new(
                ExprKind::Unary {
                    op: UnOp::Neg,
                    operand: Box::new(operand),
                },
                pos,
            ));
        }
        if *self.peek() == Tok::Plus {
            self.bump();
            return self.parse_unary();
        }
        self.parse_power()
    }

    fn parse_power(&mut self) -> CompileResult<Expr> {
        let base = self.parse_primary()?;
        if self.accept(&Tok::Caret) {
            let pos = base.pos;
            // Right-associative
            let exponent = self.parse_unary()?;
            return Ok(Expr::new(
                ExprKind::Binary {
                    op: BinOp::Pow,
                    lhs: Box::new(base),
                    rhs: Box::new(exponent),
                },
                pos,
            ));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> CompileResult<Expr> {
        let pos = self.here();
        let mut expr = match self.peek().clone() {
            Tok::Int(n) => {
                self.bump();
                Expr::new(ExprKind::IntLit(n), pos)
            }
            Tok::Float(f) => {
                self.bump();
                Expr::new(ExprKind::FloatLit(f), pos)
            }
            Tok::Str(s) => {
                self.bump();
                Expr::new(ExprKind::StringLit(s), pos)
            }
            Tok::LParen => {
                self.bump();
                let inner = self.parse_expr()?;
                self.expect(&Tok::RParen)?;
                inner
            }
            Tok::Ident(name) => {
                self.bump();
                if self.accept(&Tok::LParen) {
                    let mut args = Vec::new();
                    if *self.peek() != Tok::RParen {
                        args.push(self.parse_expr()?);
                        while self.accept(&Tok::Comma) {
                            args.push(self.parse_expr()?);
                        }
                    }
                    self.expect(&Tok::RParen)?;
                    Expr::new(ExprKind::Call { name, args }, pos)
                } else {
                    Expr::new(ExprKind::Var(name), pos)
                }
            }
            other => {
                return Err(CompileError::syntax(
                    pos.line,
                    format!("unexpected {:?} in expression", other),
                ));
            }
        };
        while self.accept(&Tok::Dot) {
            let field = self.expect_ident()?;
            expr = Expr::new(
                ExprKind::Field {
                    base: Box::new(expr),
                    field,
                },
                pos,
            );
        }
        Ok(expr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Program {
        Parser::new(source).unwrap().parse().unwrap()
    }

    #[test]
    fn test_let_and_print() {
        let p = parse("LET x% = 1\nPRINT x%; \"done\"");
        assert_eq!(p.body.len(), 2);
        assert!(matches!(p.body[0].kind, StmtKind::Let { .. }));
        match &p.body[1].kind {
            StmtKind::Print { items, no_newline } => {
                assert_eq!(items.len(), 2);
                assert!(!no_newline);
            }
            other => panic!("expected PRINT, got {:?}", other),
        }
    }

    #[test]
    fn test_trailing_semicolon_suppresses_newline() {
        let p = parse("PRINT \"a\";");
        match &p.body[0].kind {
            StmtKind::Print { no_newline, .. } => assert!(no_newline),
            other => panic!("expected PRINT, got {:?}", other),
        }
    }

    #[test]
    fn test_line_numbers_attach_to_first_statement() {
        let p = parse("10 PRINT 1 : PRINT 2\n20 GOTO 10");
        assert_eq!(p.body[0].basic_line, Some(10));
        assert_eq!(p.body[1].basic_line, None);
        assert_eq!(p.body[2].basic_line, Some(20));
        assert!(matches!(
            p.body[2].kind,
            StmtKind::Goto(JumpTarget::Line(10))
        ));
    }

    #[test]
    fn test_block_if_with_elseif() {
        let p = parse("IF a% = 1 THEN\nPRINT 1\nELSEIF a% = 2 THEN\nPRINT 2\nELSE\nPRINT 3\nEND IF");
        match &p.body[0].kind {
            StmtKind::If {
                then_body,
                elseifs,
                else_body,
                ..
            } => {
                assert_eq!(then_body.len(), 1);
                assert_eq!(elseifs.len(), 1);
                assert!(else_body.is_some());
            }
            other => panic!("expected IF, got {:?}", other),
        }
    }

    #[test]
    fn test_single_line_if_else() {
        let p = parse("IF x% > 0 THEN PRINT 1 ELSE PRINT 2");
        match &p.body[0].kind {
            StmtKind::If {
                then_body,
                else_body,
                ..
            } => {
                assert_eq!(then_body.len(), 1);
                assert_eq!(else_body.as_ref().unwrap().len(), 1);
            }
            other => panic!("expected IF, got {:?}", other),
        }
    }

    #[test]
    fn test_if_then_line_number() {
        let p = parse("IF x% THEN 100");
        match &p.body[0].kind {
            StmtKind::If { then_body, .. } => {
                assert!(matches!(
                    then_body[0].kind,
                    StmtKind::Goto(JumpTarget::Line(100))
                ));
            }
            other => panic!("expected IF, got {:?}", other),
        }
    }

    #[test]
    fn test_select_case_forms() {
        let p = parse(
            "SELECT CASE i%\nCASE 1.5\nPRINT 1\nCASE 2 TO 5, 9\nPRINT 2\nCASE IS > 100\nPRINT 3\nCASE ELSE\nPRINT 4\nEND SELECT",
        );
        match &p.body[0].kind {
            StmtKind::Select {
                arms, else_body, ..
            } => {
                assert_eq!(arms.len(), 3);
                assert_eq!(arms[1].tests.len(), 2);
                assert!(matches!(arms[1].tests[0], CaseTest::Range(_, _)));
                assert!(matches!(
                    arms[2].tests[0],
                    CaseTest::Relational(BinOp::Gt, _)
                ));
                assert!(else_body.is_some());
            }
            other => panic!("expected SELECT, got {:?}", other),
        }
    }

    #[test]
    fn test_nested_repeat_in_else() {
        let p = parse(
            "IF i% = 0 THEN\nPRINT \"then\"\nELSE\nREPEAT\nPRINT x%\nUNTIL x% > 12\nEND IF",
        );
        match &p.body[0].kind {
            StmtKind::If { else_body, .. } => {
                let else_body = else_body.as_ref().unwrap();
                assert!(matches!(else_body[0].kind, StmtKind::Repeat { .. }));
            }
            other => panic!("expected IF, got {:?}", other),
        }
    }

    #[test]
    fn test_do_variants() {
        let p = parse("DO WHILE x% < 3\nPRINT x%\nLOOP");
        assert!(matches!(
            &p.body[0].kind,
            StmtKind::Do { pre: Some((DoCond::While, _)), post: None, .. }
        ));
        let p = parse("DO\nPRINT x%\nLOOP UNTIL x% > 3");
        assert!(matches!(
            &p.body[0].kind,
            StmtKind::Do { pre: None, post: Some((DoCond::Until, _)), .. }
        ));
    }

    #[test]
    fn test_procedures_split_from_body() {
        let p = parse(
            "PRINT Test(1,2)\nFUNCTION Test(m AS INTEGER, n AS INTEGER) AS INTEGER\nTest = m + n\nEND FUNCTION",
        );
        assert_eq!(p.body.len(), 1);
        assert_eq!(p.procedures.len(), 1);
        let f = &p.procedures[0];
        assert_eq!(f.name, "test");
        assert_eq!(f.kind, ProcedureKind::Function);
        assert_eq!(f.params.len(), 2);
        assert_eq!(f.return_type, Some(TypeName::Integer));
    }

    #[test]
    fn test_single_line_sub() {
        let p = parse("SUB A : PRINT \"a\" : END SUB");
        assert_eq!(p.procedures.len(), 1);
        assert_eq!(p.procedures[0].body.len(), 1);
    }

    #[test]
    fn test_on_call() {
        let p = parse("ON c% CALL A, B");
        match &p.body[0].kind {
            StmtKind::OnCall { targets, .. } => {
                assert_eq!(targets, &vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("expected ON CALL, got {:?}", other),
        }
    }

    #[test]
    fn test_try_catch_finally() {
        let p = parse(
            "TRY\nTHROW 11\nCATCH 9, 11\nPRINT \"caught\"\nCATCH\nPRINT \"all\"\nFINALLY\nPRINT \"cleanup\"\nEND TRY",
        );
        match &p.body[0].kind {
            StmtKind::Try {
                body,
                catches,
                finally,
            } => {
                assert_eq!(body.len(), 1);
                assert_eq!(catches.len(), 2);
                assert_eq!(catches[0].codes.len(), 2);
                assert!(catches[1].codes.is_empty());
                assert!(finally.is_some());
            }
            other => panic!("expected TRY, got {:?}", other),
        }
    }

    #[test]
    fn test_dim_forms() {
        let p = parse("DIM a(10) AS INTEGER, s$, grid(1 TO 3, 1 TO 4), d$()");
        match &p.body[0].kind {
            StmtKind::Dim(decls) => {
                assert_eq!(decls.len(), 4);
                assert_eq!(decls[0].bounds.len(), 1);
                assert_eq!(decls[0].ty, Some(TypeName::Integer));
                assert!(decls[1].bounds.is_empty());
                assert_eq!(decls[2].bounds.len(), 2);
                assert!(decls[3].dynamic);
            }
            other => panic!("expected DIM, got {:?}", other),
        }
    }

    #[test]
    fn test_type_decl() {
        let p = parse("TYPE Point\nx AS DOUBLE\ny AS DOUBLE\nEND TYPE");
        match &p.body[0].kind {
            StmtKind::TypeDecl { name, fields } => {
                assert_eq!(name, "point");
                assert_eq!(fields.len(), 2);
            }
            other => panic!("expected TYPE, got {:?}", other),
        }
    }

    #[test]
    fn test_data_and_restore() {
        let p = parse("DATA 1, -2.5, \"x\"\nRESTORE 10\nRESTORE");
        match &p.body[0].kind {
            StmtKind::Data(values) => {
                assert_eq!(
                    values,
                    &vec![
                        DataValue::Int(1),
                        DataValue::Float(-2.5),
                        DataValue::Str("x".into())
                    ]
                );
            }
            other => panic!("expected DATA, got {:?}", other),
        }
        assert!(matches!(
            p.body[1].kind,
            StmtKind::Restore(Some(JumpTarget::Line(10)))
        ));
        assert!(matches!(p.body[2].kind, StmtKind::Restore(None)));
    }

    #[test]
    fn test_operator_precedence() {
        // 1 + 2 * 3 parses as 1 + (2 * 3)
        let p = parse("x = 1 + 2 * 3");
        match &p.body[0].kind {
            StmtKind::Let { value, .. } => match &value.kind {
                ExprKind::Binary { op: BinOp::Add, rhs, .. } => {
                    assert!(matches!(
                        rhs.kind,
                        ExprKind::Binary { op: BinOp::Mul, .. }
                    ));
                }
                other => panic!("expected Add at top, got {:?}", other),
            },
            other => panic!("expected LET, got {:?}", other),
        }
    }

    #[test]
    fn test_unary_minus_binds_tighter_than_intdiv() {
        // -7 \ 2 parses as (-7) \ 2
        let p = parse("PRINT -7 \\ 2");
        match &p.body[0].kind {
            StmtKind::Print { items, .. } => match &items[0].expr.kind {
                ExprKind::Binary { op: BinOp::IntDiv, lhs, .. } => {
                    assert!(matches!(lhs.kind, ExprKind::Unary { op: UnOp::Neg, .. }));
                }
                other => panic!("expected IntDiv, got {:?}", other),
            },
            other => panic!("expected PRINT, got {:?}", other),
        }
    }

    #[test]
    fn test_field_access_chain() {
        let p = parse("p.pos.x = 1.5");
        match &p.body[0].kind {
            StmtKind::Let { target, .. } => {
                assert!(matches!(target, LValue::Field { .. }));
            }
            other => panic!("expected LET, got {:?}", other),
        }
    }

    #[test]
    fn test_labels() {
        let p = parse("start:\nPRINT 1\nGOTO start");
        assert!(matches!(&p.body[0].kind, StmtKind::Label(name) if name == "start"));
    }

    #[test]
    fn test_def_fn() {
        let p = parse("DEF FNsq(x) = x * x");
        assert_eq!(p.procedures.len(), 1);
        assert_eq!(p.procedures[0].name, "fnsq");
        assert_eq!(p.procedures[0].body.len(), 1);
    }

    #[test]
    fn test_exit_and_continue() {
        let p = parse("FOR i% = 1 TO 10\nEXIT FOR\nCONTINUE FOR\nNEXT");
        match &p.body[0].kind {
            StmtKind::For { body, .. } => {
                assert!(matches!(body[0].kind, StmtKind::Exit(ExitKind::For)));
                assert!(matches!(
                    body[1].kind,
                    StmtKind::Continue(ContinueKind::For)
                ));
            }
            other => panic!("expected FOR, got {:?}", other),
        }
    }
}

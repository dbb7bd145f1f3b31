//! Block and terminator emission
//!
//! Every terminator is derived from the block's typed out-edges — block
//! ordering only feeds the fallthrough optimization (an unconditional jump
//! to the next emitted block is omitted). Multi-way transfers (SELECT CASE,
//! ON GOTO / GOSUB / CALL, the GOSUB return dispatch) lower to dense
//! compare-and-branch cascades over emitter-internal check labels.

use crate::ast::{CaseTest, Expr, Stmt, StmtKind};
use crate::cfg::{BlockId, BlockItem, ControlFlowGraph, EdgeKind};
use crate::symbols::{BaseType, TypeDescriptor};

use super::expr::cmp_name;
use super::{names, runtime, CodeGen, CodeGenError};

impl<'a> CodeGen<'a> {
    pub(super) fn emit_block(
        &mut self,
        cfg: &ControlFlowGraph<'a>,
        id: BlockId,
        next: Option<BlockId>,
    ) -> Result<(), CodeGenError> {
        let label = names::block_label(cfg, id);
        self.func.label(&label)?;

        let block = cfg.block(id);
        if block.is_try_setup {
            return self.emit_try_setup(cfg, id);
        }
        if block.is_exception_dispatch {
            return self.emit_exception_dispatch(cfg, id);
        }

        if id == cfg.entry {
            self.emit_prologue(cfg)?;
        }

        let mut payload: Option<BlockItem<'a>> = None;
        for item in &block.items {
            match *item {
                BlockItem::Stmt(stmt) => self.emit_stmt(stmt)?,
                BlockItem::ForInit(stmt) => self.emit_for_init(stmt)?,
                BlockItem::ForStep(stmt) => self.emit_for_step(stmt)?,
                BlockItem::GosubPush { return_block } => {
                    self.func.call(
                        None,
                        runtime::GOSUB_PUSH,
                        &[('w', return_block.to_string())],
                    )?;
                }
                BlockItem::CallSub(name) => {
                    let symbol = names::proc_symbol(name, true);
                    self.func.call(None, &symbol, &[])?;
                }
                BlockItem::ExceptionPop => {
                    self.func.call(None, runtime::EXCEPTION_POP, &[])?;
                }
                BlockItem::Cond(_)
                | BlockItem::ForTest(_)
                | BlockItem::Dispatch(_)
                | BlockItem::GosubReturn => payload = Some(*item),
            }
        }

        self.emit_terminator(cfg, id, payload, next)
    }

    fn emit_terminator(
        &mut self,
        cfg: &ControlFlowGraph<'a>,
        id: BlockId,
        payload: Option<BlockItem<'a>>,
        next: Option<BlockId>,
    ) -> Result<(), CodeGenError> {
        match payload {
            Some(BlockItem::Cond(cond)) => self.emit_cond_terminator(cfg, id, cond),
            Some(BlockItem::ForTest(stmt)) => self.emit_for_test(cfg, id, stmt),
            Some(BlockItem::Dispatch(stmt)) => self.emit_dispatch(cfg, id, stmt),
            Some(BlockItem::GosubReturn) => self.emit_gosub_return(cfg),
            Some(_) | None => {
                if id == cfg.exit {
                    return self.emit_ret();
                }
                let edges = cfg.out_edges(id);
                let transfer = edges.iter().find(|e| {
                    matches!(
                        e.kind,
                        EdgeKind::Sequential | EdgeKind::Jump | EdgeKind::Call
                    )
                });
                match transfer {
                    Some(edge) => self.jump_or_fallthrough(cfg, edge.to, next),
                    None if cfg.block(id).is_terminated => {
                        // Noreturn runtime call (THROW, END in a procedure)
                        self.func.hlt()
                    }
                    None => self.jump_or_fallthrough(cfg, cfg.exit, next),
                }
            }
        }
    }

    fn jump_or_fallthrough(
        &mut self,
        cfg: &ControlFlowGraph<'a>,
        target: BlockId,
        next: Option<BlockId>,
    ) -> Result<(), CodeGenError> {
        if next == Some(target) {
            return Ok(());
        }
        self.func.jmp(&names::block_label(cfg, target))
    }

    fn find_edge(
        &self,
        cfg: &ControlFlowGraph<'a>,
        id: BlockId,
        kind: EdgeKind,
    ) -> Result<BlockId, CodeGenError> {
        cfg.edges
            .iter()
            .find(|e| e.from == id && e.kind == kind)
            .map(|e| e.to)
            .ok_or_else(|| {
                CodeGenError::Logic(format!("block {} missing {:?} edge", id, kind))
            })
    }

    fn emit_ret(&mut self) -> Result<(), CodeGenError> {
        match self.current_proc {
            None => self.func.ret(Some("0")),
            Some(proc) if proc.is_sub => self.func.ret(None),
            Some(proc) => {
                let ty = self.types().qbe_type(&proc.return_type);
                let value = self.func.load(ty, "%retval")?;
                self.func.ret(Some(&value))
            }
        }
    }

    // =========================================================================
    // Conditionals
    // =========================================================================

    fn emit_cond_terminator(
        &mut self,
        cfg: &ControlFlowGraph<'a>,
        id: BlockId,
        cond: &Expr,
    ) -> Result<(), CodeGenError> {
        let (v, ty) = self.emit_expr(cond)?;
        let c = self.truth_value(&v, &ty)?;
        let on_true = self.find_edge(cfg, id, EdgeKind::CondTrue)?;
        let on_false = self.find_edge(cfg, id, EdgeKind::CondFalse)?;
        self.func.jnz(
            &c,
            &names::block_label(cfg, on_true),
            &names::block_label(cfg, on_false),
        )
    }

    /// FOR bound test. A constant STEP picks the comparator at compile time
    /// (<= for positive, >= for negative); a variable STEP tests both
    /// directions at runtime.
    fn emit_for_test(
        &mut self,
        cfg: &ControlFlowGraph<'a>,
        id: BlockId,
        stmt: &Stmt,
    ) -> Result<(), CodeGenError> {
        let StmtKind::For { var, end, step, .. } = &stmt.kind else {
            return Err(CodeGenError::Logic("ForTest without a FOR".into()));
        };
        let (addr, var_ty) = self.scalar_addr(var)?;
        let qty = self.types().qbe_type(&var_ty);
        let current = self.func.load(qty, &addr)?;
        let (end_v, end_ty) = self.emit_expr(end)?;
        let common = self.types().promote(&var_ty, &end_ty)?;
        let current = self
            .types()
            .convert(&mut self.func, current, &var_ty, &common)?;
        let end_v = self
            .types()
            .convert(&mut self.func, end_v, &end_ty, &common)?;

        let cond = match const_step_sign(step.as_ref()) {
            Some(positive) => {
                let opcode = self
                    .types()
                    .cmp_op(if positive { "le" } else { "ge" }, &common)?;
                self.func.cmp(&opcode, &current, &end_v)?
            }
            None => {
                let step_expr = step.as_ref().expect("non-constant step is present");
                let (sv, sty) = self.emit_expr(step_expr)?;
                let zero = match self.types().qbe_type(&sty) {
                    's' => "s_0",
                    'd' => "d_0",
                    _ => "0",
                };
                let ge0 = self.types().cmp_op("ge", &sty)?;
                let positive = self.func.cmp(&ge0, &sv, zero)?;
                let le = self.types().cmp_op("le", &common)?;
                let upward = self.func.cmp(&le, &current, &end_v)?;
                let ge = self.types().cmp_op("ge", &common)?;
                let downward = self.func.cmp(&ge, &current, &end_v)?;
                let up_ok = self.func.binop("and", 'w', &positive, &upward)?;
                let negative = self.func.binop("xor", 'w', &positive, "1")?;
                let down_ok = self.func.binop("and", 'w', &negative, &downward)?;
                self.func.binop("or", 'w', &up_ok, &down_ok)?
            }
        };

        let body = self.find_edge(cfg, id, EdgeKind::CondTrue)?;
        let exit = self.find_edge(cfg, id, EdgeKind::CondFalse)?;
        self.func.jnz(
            &cond,
            &names::block_label(cfg, body),
            &names::block_label(cfg, exit),
        )
    }

    // =========================================================================
    // Multi-way dispatch
    // =========================================================================

    fn emit_dispatch(
        &mut self,
        cfg: &ControlFlowGraph<'a>,
        id: BlockId,
        stmt: &Stmt,
    ) -> Result<(), CodeGenError> {
        match &stmt.kind {
            StmtKind::Select { selector, arms, .. } => {
                self.emit_select_dispatch(cfg, id, selector, arms)
            }
            StmtKind::OnGoto { selector, targets } => {
                self.emit_on_dispatch(cfg, id, selector, targets.len())
            }
            StmtKind::OnGosub { selector, targets } => {
                self.emit_on_dispatch(cfg, id, selector, targets.len())
            }
            StmtKind::OnCall { selector, targets } => {
                self.emit_on_dispatch(cfg, id, selector, targets.len())
            }
            other => Err(CodeGenError::Logic(format!(
                "dispatch payload on non-dispatch statement {:?}",
                std::mem::discriminant(other)
            ))),
        }
    }

    /// SELECT CASE: the selector is evaluated exactly once; each CASE test
    /// coerces the *case value* toward the selector's type, never the other
    /// way around.
    fn emit_select_dispatch(
        &mut self,
        cfg: &ControlFlowGraph<'a>,
        id: BlockId,
        selector: &Expr,
        arms: &[crate::ast::CaseArm],
    ) -> Result<(), CodeGenError> {
        let (sel, sel_ty) = self.emit_expr(selector)?;
        let default = self.find_edge(cfg, id, EdgeKind::Default)?;
        let default_label = names::block_label(cfg, default);

        // Flatten tests, each pointing at its arm's entry block
        let mut tests: Vec<(&CaseTest, String)> = Vec::new();
        for (i, arm) in arms.iter().enumerate() {
            let target = self.find_edge(cfg, id, EdgeKind::Case(i + 1))?;
            let label = names::block_label(cfg, target);
            for test in &arm.tests {
                tests.push((test, label.clone()));
            }
        }
        if tests.is_empty() {
            return self.func.jmp(&default_label);
        }

        let last = tests.len() - 1;
        for (i, (test, target)) in tests.iter().enumerate() {
            let cond = self.emit_case_test(&sel, &sel_ty, test)?;
            if i == last {
                self.func.jnz(&cond, target, &default_label)?;
            } else {
                let next = self.func.make_label("case_check");
                self.func.jnz(&cond, target, &next)?;
                self.func.label(&next)?;
            }
        }
        Ok(())
    }

    fn emit_case_test(
        &mut self,
        sel: &str,
        sel_ty: &TypeDescriptor,
        test: &CaseTest,
    ) -> Result<String, CodeGenError> {
        match test {
            CaseTest::Value(value) => {
                if sel_ty.is_string() {
                    let (v, _) = self.emit_expr(value)?;
                    let c = self
                        .func
                        .call(
                            Some('w'),
                            runtime::STRING_COMPARE,
                            &[('l', sel.to_string()), ('l', v)],
                        )?
                        .expect("call with result");
                    return self.func.cmp("ceqw", &c, "0");
                }
                let v = self.emit_case_value(value, sel_ty)?;
                let opcode = self.types().cmp_op("eq", sel_ty)?;
                self.func.cmp(&opcode, sel, &v)
            }
            CaseTest::Range(lo, hi) => {
                let lo_v = self.emit_case_value(lo, sel_ty)?;
                let hi_v = self.emit_case_value(hi, sel_ty)?;
                let ge = self.types().cmp_op("ge", sel_ty)?;
                let above = self.func.cmp(&ge, sel, &lo_v)?;
                let le = self.types().cmp_op("le", sel_ty)?;
                let below = self.func.cmp(&le, sel, &hi_v)?;
                self.func.binop("and", 'w', &above, &below)
            }
            CaseTest::Relational(op, value) => {
                let v = self.emit_case_value(value, sel_ty)?;
                let opcode = self.types().cmp_op(cmp_name(*op), sel_ty)?;
                self.func.cmp(&opcode, sel, &v)
            }
        }
    }

    fn emit_case_value(
        &mut self,
        value: &Expr,
        sel_ty: &TypeDescriptor,
    ) -> Result<String, CodeGenError> {
        let (v, vty) = self.emit_expr(value)?;
        self.types().convert(&mut self.func, v, &vty, sel_ty)
    }

    /// ON <expr> GOTO / GOSUB / CALL: selector values 1..=N dispatch through
    /// the case edges; anything else falls through the default edge.
    fn emit_on_dispatch(
        &mut self,
        cfg: &ControlFlowGraph<'a>,
        id: BlockId,
        selector: &Expr,
        count: usize,
    ) -> Result<(), CodeGenError> {
        let (v, ty) = self.emit_expr(selector)?;
        let integer = TypeDescriptor::scalar(BaseType::Integer);
        let sel = self.types().convert(&mut self.func, v, &ty, &integer)?;
        let default = self.find_edge(cfg, id, EdgeKind::Default)?;
        let default_label = names::block_label(cfg, default);

        if count == 0 {
            return self.func.jmp(&default_label);
        }
        for i in 1..=count {
            let target = self.find_edge(cfg, id, EdgeKind::Case(i))?;
            let label = names::block_label(cfg, target);
            let c = self.func.cmp("ceqw", &sel, &i.to_string())?;
            if i == count {
                self.func.jnz(&c, &label, &default_label)?;
            } else {
                let next = self.func.make_label("on_check");
                self.func.jnz(&c, &label, &next)?;
                self.func.label(&next)?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // GOSUB return dispatch
    // =========================================================================

    /// RETURN pops the pushed landing id and branches to the matching
    /// landing block; the runtime already faulted on an empty return stack.
    fn emit_gosub_return(&mut self, cfg: &ControlFlowGraph<'a>) -> Result<(), CodeGenError> {
        let popped = self
            .func
            .call(Some('w'), runtime::GOSUB_POP, &[])?
            .expect("call with result");
        for &landing in &cfg.gosub_return_blocks {
            let c = self.func.cmp("ceqw", &popped, &landing.to_string())?;
            let next = self.func.make_label("ret_check");
            self.func
                .jnz(&c, &names::block_label(cfg, landing), &next)?;
            self.func.label(&next)?;
        }
        self.func.hlt()
    }
}

/// Sign of a constant STEP; `None` when the step is a runtime value.
/// A missing STEP counts up.
fn const_step_sign(step: Option<&Expr>) -> Option<bool> {
    fn sign(expr: &Expr) -> Option<bool> {
        use crate::ast::{ExprKind, UnOp};
        match &expr.kind {
            ExprKind::IntLit(n) => Some(*n >= 0),
            ExprKind::FloatLit(f) => Some(*f >= 0.0),
            ExprKind::Unary {
                op: UnOp::Neg,
                operand,
            } => sign(operand).map(|s| !s),
            _ => None,
        }
    }
    match step {
        None => Some(true),
        Some(expr) => sign(expr),
    }
}

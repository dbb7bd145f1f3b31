//! TRY / CATCH / FINALLY lowering
//!
//! Structured exception handling maps onto a runtime exception-context stack
//! plus a save-restore buffer. The try-setup block allocates the context
//! slot, pushes it, and calls the save-state primitive *directly from
//! generated IL* — the saved state must belong to this IL frame, not to a C
//! wrapper's frame that is gone when the restore fires. The save returns 0
//! on the initial call and the error code after a restore, and the branch on
//! that value is the very next instruction: any computation between the save
//! and the branch would run on restored register state and corrupt it.
//!
//! The dispatch block is reached exclusively through the runtime restore; it
//! compares the current error code against each CATCH clause in source order
//! and falls through to a rethrow.

use crate::ast::StmtKind;
use crate::cfg::{BlockId, ControlFlowGraph};
use crate::symbols::{BaseType, TypeDescriptor};

use super::{names, runtime, CodeGen, CodeGenError};

impl<'a> CodeGen<'a> {
    pub(super) fn emit_try_setup(
        &mut self,
        cfg: &ControlFlowGraph<'a>,
        id: BlockId,
    ) -> Result<(), CodeGenError> {
        let idx = cfg
            .block(id)
            .try_index
            .ok_or_else(|| CodeGenError::Logic(format!("block {} lacks a try index", id)))?;
        let structure = &cfg.try_structures[idx];

        let ctx = self.func.alloc(8, runtime::EXCEPTION_CONTEXT_SIZE)?;
        self.func
            .call(None, runtime::EXCEPTION_PUSH, &[('l', ctx.clone())])?;
        let code = self
            .func
            .call(Some('w'), runtime::SAVE_STATE, &[('l', ctx)])?
            .expect("call with result");
        // Zero: initial save, enter the body. Nonzero: restored with an
        // error code, enter the dispatch. Branch immediately.
        self.func.jnz(
            &code,
            &names::block_label(cfg, structure.dispatch),
            &names::block_label(cfg, structure.body_entry),
        )
    }

    pub(super) fn emit_exception_dispatch(
        &mut self,
        cfg: &ControlFlowGraph<'a>,
        id: BlockId,
    ) -> Result<(), CodeGenError> {
        let idx = cfg
            .block(id)
            .try_index
            .ok_or_else(|| CodeGenError::Logic(format!("block {} lacks a try index", id)))?;
        let structure = &cfg.try_structures[idx];
        let StmtKind::Try { catches, .. } = &structure.stmt.kind else {
            return Err(CodeGenError::Logic(
                "try structure does not point at a TRY statement".into(),
            ));
        };

        let err = self
            .func
            .call(Some('w'), runtime::ERR, &[])?
            .expect("call with result");

        let integer = TypeDescriptor::scalar(BaseType::Integer);
        for (i, clause) in catches.iter().enumerate() {
            let catch_label = names::block_label(cfg, structure.catches[i]);
            if clause.codes.is_empty() {
                // Catch-all matches unconditionally and ends the cascade
                return self.func.jmp(&catch_label);
            }
            for code_expr in &clause.codes {
                let (v, vty) = self.emit_expr(code_expr)?;
                let v = self.types().convert(&mut self.func, v, &vty, &integer)?;
                let c = self.func.cmp("ceqw", &err, &v)?;
                let next = self.func.make_label("catch_check");
                self.func.jnz(&c, &catch_label, &next)?;
                self.func.label(&next)?;
            }
        }

        // No clause matched: propagate to the enclosing TRY
        self.func.call(None, runtime::RETHROW, &[])?;
        self.func.hlt()
    }
}

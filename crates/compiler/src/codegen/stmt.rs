//! Statement emission
//!
//! One handler per simple statement kind; structured statements never reach
//! here (the CFG builder decomposed them into blocks, and `control.rs` emits
//! their terminators). Assignments insert the coercion sequence prescribed
//! by the type manager whenever LHS and RHS types differ; string stores go
//! through the runtime's assign-with-release entry point.

use crate::ast::{Expr, LValue, PrintItem, PrintSep, Stmt, StmtKind};
use crate::symbols::{BaseType, TypeDescriptor};

use super::{runtime, CodeGen, CodeGenError};

impl<'a> CodeGen<'a> {
    /// Emit one straight-line statement.
    pub(super) fn emit_stmt(&mut self, stmt: &Stmt) -> Result<(), CodeGenError> {
        self.current_line = stmt.pos.line;
        match &stmt.kind {
            StmtKind::Let { target, value } => {
                let (v, ty) = self.emit_expr(value)?;
                self.assign_to(target, v, ty)
            }
            StmtKind::Print { items, no_newline } => self.emit_print(items, *no_newline),
            StmtKind::Input { prompt, targets } => self.emit_input(prompt.as_deref(), targets),
            StmtKind::Call { name, args } => {
                self.emit_user_call(name, args)?;
                Ok(())
            }
            StmtKind::Read(targets) => self.emit_read(targets),
            StmtKind::Restore(target) => self.emit_restore(target.as_ref()),
            StmtKind::Swap(a, b) => self.emit_swap(a, b),
            StmtKind::Inc(target, amount) => self.emit_inc_dec(target, amount.as_ref(), false),
            StmtKind::Dec(target, amount) => self.emit_inc_dec(target, amount.as_ref(), true),
            StmtKind::Dim(decls) => {
                for decl in decls {
                    if !decl.bounds.is_empty() {
                        self.emit_array_alloc(&decl.name, &decl.bounds)?;
                    }
                }
                Ok(())
            }
            StmtKind::Redim {
                preserve,
                name,
                bounds,
            } => self.emit_redim(name, bounds, *preserve),
            StmtKind::Erase(names) => {
                for name in names {
                    let (slot, _) = self.array_slot(name)?;
                    let desc = self.func.load('l', &slot)?;
                    self.func
                        .call(None, runtime::ARRAY_ERASE, &[('l', desc)])?;
                }
                Ok(())
            }
            StmtKind::Throw(expr) => self.emit_throw(expr),
            StmtKind::End => {
                // Only reaches statement position inside procedures; in main
                // the builder rewired END as a jump to the exit block.
                self.func.call(None, runtime::END, &[])?;
                Ok(())
            }
            other => Err(CodeGenError::Logic(format!(
                "structured statement {:?} escaped the CFG builder",
                std::mem::discriminant(other)
            ))),
        }
    }

    // =========================================================================
    // Assignment
    // =========================================================================

    pub(super) fn lvalue_addr(
        &mut self,
        lv: &LValue,
    ) -> Result<(String, TypeDescriptor), CodeGenError> {
        match lv {
            LValue::Var(name) => self.scalar_addr(name),
            LValue::Elem { name, indices } => self.array_elem_addr(name, indices),
            LValue::Field { base, field } => {
                let (base_addr, base_ty) = self.lvalue_addr(base)?;
                self.field_addr(&base_addr, &base_ty, field)
            }
        }
    }

    pub(super) fn assign_to(
        &mut self,
        target: &LValue,
        value: String,
        value_ty: TypeDescriptor,
    ) -> Result<(), CodeGenError> {
        let (addr, ty) = self.lvalue_addr(target)?;
        self.store_value(&addr, &ty, value, &value_ty)
    }

    /// Store with coercion. Strings release the previous value through the
    /// runtime; records copy by size.
    pub(super) fn store_value(
        &mut self,
        addr: &str,
        ty: &TypeDescriptor,
        value: String,
        value_ty: &TypeDescriptor,
    ) -> Result<(), CodeGenError> {
        if ty.is_string() && value_ty.is_string() {
            self.func.call(
                None,
                runtime::STRING_ASSIGN,
                &[('l', addr.to_string()), ('l', value)],
            )?;
            return Ok(());
        }
        if ty.is_record() {
            if value_ty != ty {
                return Err(CodeGenError::Logic(
                    "record assignment between different types".into(),
                ));
            }
            let size = self.types().size_of(ty)?;
            self.func.call(
                None,
                "memcpy",
                &[
                    ('l', addr.to_string()),
                    ('l', value),
                    ('l', size.to_string()),
                ],
            )?;
            return Ok(());
        }
        let converted = self
            .types()
            .convert(&mut self.func, value, value_ty, ty)?;
        let qty = self.types().qbe_type(ty);
        self.func.store(qty, &converted, addr)
    }

    // =========================================================================
    // PRINT / INPUT / READ / RESTORE
    // =========================================================================

    fn emit_print(&mut self, items: &[PrintItem], no_newline: bool) -> Result<(), CodeGenError> {
        for item in items {
            let (v, ty) = self.emit_expr(&item.expr)?;
            self.emit_print_value(v, &ty)?;
            if item.sep == Some(PrintSep::Comma) {
                self.func.call(None, runtime::PRINT_TAB, &[])?;
            }
        }
        if !no_newline {
            self.func.call(None, runtime::PRINT_NEWLINE, &[])?;
        }
        Ok(())
    }

    fn emit_print_value(
        &mut self,
        value: String,
        ty: &TypeDescriptor,
    ) -> Result<(), CodeGenError> {
        if ty.is_string() {
            self.func
                .call(None, runtime::PRINT_STRING, &[('l', value)])?;
            return Ok(());
        }
        match ty.base_type() {
            BaseType::Integer => {
                self.func.call(None, runtime::PRINT_INT, &[('w', value)])?;
            }
            BaseType::Long => {
                self.func
                    .call(None, runtime::PRINT_LONG, &[('l', value)])?;
            }
            BaseType::Single | BaseType::Double => {
                let double = TypeDescriptor::scalar(BaseType::Double);
                let v = self.types().convert(&mut self.func, value, ty, &double)?;
                self.func
                    .call(None, runtime::PRINT_DOUBLE, &[('d', v)])?;
            }
            other => {
                return Err(CodeGenError::Logic(format!(
                    "PRINT of unprintable type {:?}",
                    other
                )));
            }
        }
        Ok(())
    }

    fn emit_input(
        &mut self,
        prompt: Option<&str>,
        targets: &[LValue],
    ) -> Result<(), CodeGenError> {
        if let Some(text) = prompt {
            let (sym, utf32) = self.intern_string(text)?;
            let ctor = if utf32 {
                runtime::STRING_FROM_UTF32
            } else {
                runtime::STRING_FROM_ASCII
            };
            let s = self
                .func
                .call(Some('l'), ctor, &[('l', sym)])?
                .expect("call with result");
            self.func.call(None, runtime::PRINT_STRING, &[('l', s)])?;
        }
        for target in targets {
            let (addr, ty) = self.lvalue_addr(target)?;
            if ty.is_string() {
                let v = self
                    .func
                    .call(Some('l'), runtime::INPUT_STRING, &[])?
                    .expect("call with result");
                self.func
                    .call(None, runtime::STRING_ASSIGN, &[('l', addr), ('l', v)])?;
                continue;
            }
            let (v, vty) = match ty.base_type() {
                BaseType::Integer => (
                    self.func
                        .call(Some('w'), runtime::INPUT_INT, &[])?
                        .expect("call with result"),
                    TypeDescriptor::scalar(BaseType::Integer),
                ),
                BaseType::Long => (
                    self.func
                        .call(Some('l'), runtime::INPUT_LONG, &[])?
                        .expect("call with result"),
                    TypeDescriptor::scalar(BaseType::Long),
                ),
                BaseType::Single | BaseType::Double => (
                    self.func
                        .call(Some('d'), runtime::INPUT_DOUBLE, &[])?
                        .expect("call with result"),
                    TypeDescriptor::scalar(BaseType::Double),
                ),
                other => {
                    return Err(CodeGenError::Logic(format!(
                        "INPUT into type {:?}",
                        other
                    )));
                }
            };
            self.store_value(&addr, &ty, v, &vty)?;
        }
        Ok(())
    }

    fn emit_read(&mut self, targets: &[LValue]) -> Result<(), CodeGenError> {
        for target in targets {
            let (addr, ty) = self.lvalue_addr(target)?;
            if ty.is_string() {
                let v = self
                    .func
                    .call(Some('l'), runtime::READ_STRING, &[])?
                    .expect("call with result");
                self.func
                    .call(None, runtime::STRING_ASSIGN, &[('l', addr), ('l', v)])?;
                continue;
            }
            let (v, vty) = match ty.base_type() {
                BaseType::Integer => (
                    self.func
                        .call(Some('w'), runtime::READ_INT, &[])?
                        .expect("call with result"),
                    TypeDescriptor::scalar(BaseType::Integer),
                ),
                BaseType::Long => (
                    self.func
                        .call(Some('l'), runtime::READ_LONG, &[])?
                        .expect("call with result"),
                    TypeDescriptor::scalar(BaseType::Long),
                ),
                BaseType::Single | BaseType::Double => (
                    self.func
                        .call(Some('d'), runtime::READ_DOUBLE, &[])?
                        .expect("call with result"),
                    TypeDescriptor::scalar(BaseType::Double),
                ),
                other => {
                    return Err(CodeGenError::Logic(format!(
                        "READ into type {:?}",
                        other
                    )));
                }
            };
            self.store_value(&addr, &ty, v, &vty)?;
        }
        Ok(())
    }

    /// RESTORE resolves to a DATA-segment cursor index at compile time.
    fn emit_restore(
        &mut self,
        target: Option<&crate::ast::JumpTarget>,
    ) -> Result<(), CodeGenError> {
        let index = match target {
            None => 0,
            Some(crate::ast::JumpTarget::Line(n)) => *self
                .symbols
                .data
                .line_index
                .get(n)
                .ok_or_else(|| CodeGenError::Logic(format!("RESTORE to unknown line {}", n)))?,
            Some(crate::ast::JumpTarget::Label(name)) => *self
                .symbols
                .data
                .label_index
                .get(name)
                .ok_or_else(|| {
                    CodeGenError::Logic(format!("RESTORE to unknown label {}", name))
                })?,
        };
        self.func
            .call(None, runtime::RESTORE, &[('w', index.to_string())])?;
        Ok(())
    }

    // =========================================================================
    // SWAP / INC / DEC
    // =========================================================================

    fn emit_swap(&mut self, a: &LValue, b: &LValue) -> Result<(), CodeGenError> {
        let (a_addr, a_ty) = self.lvalue_addr(a)?;
        let (b_addr, b_ty) = self.lvalue_addr(b)?;
        if a_ty != b_ty || a_ty.is_record() {
            return Err(CodeGenError::Logic("SWAP operands must match".into()));
        }
        // Strings swap as raw handles; no release needed
        let qty = self.types().qbe_type(&a_ty);
        let va = self.func.load(qty, &a_addr)?;
        let vb = self.func.load(qty, &b_addr)?;
        self.func.store(qty, &vb, &a_addr)?;
        self.func.store(qty, &va, &b_addr)?;
        Ok(())
    }

    fn emit_inc_dec(
        &mut self,
        target: &LValue,
        amount: Option<&Expr>,
        negate: bool,
    ) -> Result<(), CodeGenError> {
        let (addr, ty) = self.lvalue_addr(target)?;
        if !ty.is_numeric() {
            return Err(CodeGenError::Logic("INC/DEC of a non-number".into()));
        }
        let qty = self.types().qbe_type(&ty);
        let current = self.func.load(qty, &addr)?;
        let delta = match amount {
            Some(expr) => {
                let (v, vty) = self.emit_expr(expr)?;
                self.types().convert(&mut self.func, v, &vty, &ty)?
            }
            None => match qty {
                's' => "s_1".to_string(),
                'd' => "d_1".to_string(),
                _ => "1".to_string(),
            },
        };
        let op = if negate { "sub" } else { "add" };
        let t = self.func.binop(op, qty, &current, &delta)?;
        self.func.store(qty, &t, &addr)
    }

    // =========================================================================
    // Arrays
    // =========================================================================

    fn type_tag(&self, elem: &TypeDescriptor) -> i64 {
        match elem.base_type() {
            BaseType::Integer => runtime::tag::INT32,
            BaseType::Long => runtime::tag::INT64,
            BaseType::Single => runtime::tag::SINGLE,
            BaseType::Double => runtime::tag::DOUBLE,
            BaseType::AsciiString | BaseType::Utf32String => runtime::tag::STRING,
            _ => runtime::tag::RECORD,
        }
    }

    /// Evaluate DIM/REDIM bounds into four `l` arguments (lb1, ub1, lb2,
    /// ub2); rank-1 passes zeros for the second axis.
    fn emit_bounds(
        &mut self,
        bounds: &[(Option<Expr>, Expr)],
    ) -> Result<Vec<String>, CodeGenError> {
        let long = TypeDescriptor::scalar(BaseType::Long);
        let base = self.symbols.options.array_base;
        let mut out = Vec::with_capacity(4);
        for (lo, hi) in bounds {
            let lo_value = match lo {
                Some(expr) => {
                    let (v, ty) = self.emit_expr(expr)?;
                    self.types().convert(&mut self.func, v, &ty, &long)?
                }
                None => base.to_string(),
            };
            let (hi_value, hi_ty) = self.emit_expr(hi)?;
            let hi_value = self
                .types()
                .convert(&mut self.func, hi_value, &hi_ty, &long)?;
            out.push(lo_value);
            out.push(hi_value);
        }
        while out.len() < 4 {
            out.push("0".to_string());
        }
        Ok(out)
    }

    fn emit_array_alloc(
        &mut self,
        name: &str,
        bounds: &[(Option<Expr>, Expr)],
    ) -> Result<(), CodeGenError> {
        let (slot, elem) = self.array_slot(name)?;
        let esz = self.types().size_of(&elem)?;
        let tag = self.type_tag(&elem);
        let dims = bounds.len();
        let b = self.emit_bounds(bounds)?;
        let desc = self
            .func
            .call(
                Some('l'),
                runtime::ARRAY_ALLOC,
                &[
                    ('w', esz.to_string()),
                    ('w', dims.to_string()),
                    ('w', tag.to_string()),
                    ('l', b[0].clone()),
                    ('l', b[1].clone()),
                    ('l', b[2].clone()),
                    ('l', b[3].clone()),
                ],
            )?
            .expect("call with result");
        self.func.store('l', &desc, &slot)
    }

    /// REDIM: erase, then re-allocate. The erase zeroes the descriptor's
    /// bounds and dimension count, so the redim call carries them again and
    /// writes them back. PRESERVE reallocates in place, zero-filling any
    /// grown tail (and releasing string elements in a truncated one).
    fn emit_redim(
        &mut self,
        name: &str,
        bounds: &[(Option<Expr>, Expr)],
        preserve: bool,
    ) -> Result<(), CodeGenError> {
        let (slot, elem) = self.array_slot(name)?;
        let esz = self.types().size_of(&elem)?;
        let tag = self.type_tag(&elem);
        let dims = bounds.len();
        let b = self.emit_bounds(bounds)?;
        let desc = self.func.load('l', &slot)?;

        let entry = if preserve {
            runtime::ARRAY_REDIM_PRESERVE
        } else {
            self.func
                .call(None, runtime::ARRAY_ERASE, &[('l', desc.clone())])?;
            runtime::ARRAY_REDIM
        };
        let fresh = self
            .func
            .call(
                Some('l'),
                entry,
                &[
                    ('l', desc),
                    ('w', esz.to_string()),
                    ('w', dims.to_string()),
                    ('w', tag.to_string()),
                    ('l', b[0].clone()),
                    ('l', b[1].clone()),
                    ('l', b[2].clone()),
                    ('l', b[3].clone()),
                ],
            )?
            .expect("call with result");
        self.func.store('l', &fresh, &slot)
    }

    // =========================================================================
    // THROW
    // =========================================================================

    fn emit_throw(&mut self, expr: &Expr) -> Result<(), CodeGenError> {
        let (v, ty) = self.emit_expr(expr)?;
        let integer = TypeDescriptor::scalar(BaseType::Integer);
        let code = self.types().convert(&mut self.func, v, &ty, &integer)?;
        // Does not return; the block terminator emits hlt
        self.func.call(
            None,
            runtime::THROW,
            &[('w', code), ('w', self.line_literal())],
        )?;
        Ok(())
    }

    // =========================================================================
    // FOR init / step (block payloads)
    // =========================================================================

    pub(super) fn emit_for_init(&mut self, stmt: &Stmt) -> Result<(), CodeGenError> {
        self.current_line = stmt.pos.line;
        let StmtKind::For { var, start, .. } = &stmt.kind else {
            return Err(CodeGenError::Logic("ForInit without a FOR".into()));
        };
        let (v, ty) = self.emit_expr(start)?;
        self.assign_to(&LValue::Var(var.clone()), v, ty)
    }

    pub(super) fn emit_for_step(&mut self, stmt: &Stmt) -> Result<(), CodeGenError> {
        let StmtKind::For { var, step, .. } = &stmt.kind else {
            return Err(CodeGenError::Logic("ForStep without a FOR".into()));
        };
        let (addr, ty) = self.scalar_addr(var)?;
        let qty = self.types().qbe_type(&ty);
        let current = self.func.load(qty, &addr)?;
        let delta = match step {
            Some(expr) => {
                let (v, vty) = self.emit_expr(expr)?;
                self.types().convert(&mut self.func, v, &vty, &ty)?
            }
            None => match qty {
                's' => "s_1".to_string(),
                'd' => "d_1".to_string(),
                _ => "1".to_string(),
            },
        };
        let t = self.func.binop("add", qty, &current, &delta)?;
        self.func.store(qty, &t, &addr)
    }
}

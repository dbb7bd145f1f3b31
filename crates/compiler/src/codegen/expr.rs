//! Expression emission
//!
//! The expression visitor returns `(ssa temp, TypeDescriptor)`. Binary
//! operators promote operands through [`TypeManager`] before picking an
//! opcode; string operators call into the runtime; comparisons produce the
//! classic 0 / -1 truth values so NOT composes bitwise.
//!
//! Three peephole strength reductions apply when the right operand is a
//! compile-time power of two: multiply becomes a left shift, MOD becomes a
//! mask, and `\` becomes a biased arithmetic right shift that preserves
//! truncation toward zero for negative dividends. Everything else falls back
//! to the generic opcode.

use crate::ast::{BinOp, Expr, ExprKind, UnOp};
use crate::symbols::{BaseType, TypeDescriptor};

use super::{names, runtime, CodeGen, CodeGenError, ScalarRef};

impl<'a> CodeGen<'a> {
    pub(super) fn emit_expr(
        &mut self,
        expr: &Expr,
    ) -> Result<(String, TypeDescriptor), CodeGenError> {
        match &expr.kind {
            ExprKind::IntLit(n) => {
                if i32::try_from(*n).is_ok() {
                    let t = self.func.copy('w', &n.to_string())?;
                    Ok((t, TypeDescriptor::scalar(BaseType::Integer)))
                } else {
                    let t = self.func.copy('l', &n.to_string())?;
                    Ok((t, TypeDescriptor::scalar(BaseType::Long)))
                }
            }
            ExprKind::FloatLit(f) => {
                let sym = self.intern_float(*f)?;
                let t = self.func.load('d', &sym)?;
                Ok((t, TypeDescriptor::scalar(BaseType::Double)))
            }
            ExprKind::StringLit(s) => self.emit_string_literal(s),
            ExprKind::Var(name) => self.emit_var_read(name),
            ExprKind::Call { name, args } => {
                if self.array_exists(name) {
                    let (addr, elem) = self.array_elem_addr(name, args)?;
                    if elem.is_record() {
                        return Ok((addr, elem));
                    }
                    let ty = self.types().qbe_type(&elem);
                    let t = self.func.load(ty, &addr)?;
                    return Ok((t, elem));
                }
                if self.symbols.procedures.contains_key(name) {
                    return self.emit_user_call(name, args);
                }
                self.emit_builtin(name, args)
            }
            ExprKind::Field { base, field } => {
                let (addr, ty) = self.field_addr_of_expr(base, field)?;
                if ty.is_record() {
                    return Ok((addr, ty));
                }
                let qty = self.types().qbe_type(&ty);
                let t = self.func.load(qty, &addr)?;
                Ok((t, ty))
            }
            ExprKind::Binary { op, lhs, rhs } => self.emit_binary(*op, lhs, rhs),
            ExprKind::Unary { op, operand } => match op {
                UnOp::Neg => {
                    let (v, ty) = self.emit_expr(operand)?;
                    if !ty.is_numeric() {
                        return Err(CodeGenError::Logic("negation of a non-number".into()));
                    }
                    let t = self.func.neg(self.types().qbe_type(&ty), &v)?;
                    Ok((t, ty))
                }
                UnOp::Not => {
                    let (v, ty) = self.emit_expr(operand)?;
                    let (v, ty) = self.to_integer(v, &ty)?;
                    let qty = self.types().qbe_type(&ty);
                    let t = self.func.binop("xor", qty, &v, "-1")?;
                    Ok((t, ty))
                }
            },
        }
    }

    fn emit_string_literal(
        &mut self,
        text: &str,
    ) -> Result<(String, TypeDescriptor), CodeGenError> {
        let (sym, utf32) = self.intern_string(text)?;
        let ctor = if utf32 {
            runtime::STRING_FROM_UTF32
        } else {
            runtime::STRING_FROM_ASCII
        };
        let t = self
            .func
            .call(Some('l'), ctor, &[('l', sym)])?
            .expect("call with result");
        let base = if utf32 {
            BaseType::Utf32String
        } else {
            BaseType::AsciiString
        };
        Ok((t, TypeDescriptor::scalar(base)))
    }

    fn emit_var_read(&mut self, name: &str) -> Result<(String, TypeDescriptor), CodeGenError> {
        match self.resolve_scalar(name) {
            Some(ScalarRef::Constant(c)) => {
                let value = c.value.clone();
                let ty = c.ty.clone();
                match value {
                    crate::symbols::ConstValue::Int(n) => {
                        let qty = self.types().qbe_type(&ty);
                        let t = self.func.copy(qty, &n.to_string())?;
                        Ok((t, ty))
                    }
                    crate::symbols::ConstValue::Float(f) => {
                        let sym = self.intern_float(f)?;
                        let t = self.func.load('d', &sym)?;
                        Ok((t, ty))
                    }
                    crate::symbols::ConstValue::Str(s) => self.emit_string_literal(&s),
                }
            }
            Some(_) => {
                let (addr, ty) = self.scalar_addr(name)?;
                if ty.is_record() {
                    return Ok((addr, ty));
                }
                let qty = self.types().qbe_type(&ty);
                let t = self.func.load(qty, &addr)?;
                Ok((t, ty))
            }
            None => Err(CodeGenError::Logic(format!(
                "unresolved variable {}",
                name
            ))),
        }
    }

    pub(super) fn array_exists(&self, name: &str) -> bool {
        if let Some(proc) = self.current_proc {
            if proc.arrays.contains_key(name) {
                return true;
            }
        }
        self.symbols.arrays.contains_key(name)
    }

    /// Bounds-checked element address: the descriptor's data pointer plus
    /// `(flattened index) * elementSize`, with elementSize loaded from its
    /// fixed offset 40 (offset 24 is lowerBound2 — a historic source of
    /// corrupted addressing).
    pub(super) fn array_elem_addr(
        &mut self,
        name: &str,
        indices: &[Expr],
    ) -> Result<(String, TypeDescriptor), CodeGenError> {
        let (slot, elem) = self.array_slot(name)?;
        let desc = self.func.load('l', &slot)?;

        let mut idx = Vec::new();
        for index in indices {
            let (v, ty) = self.emit_expr(index)?;
            let long = TypeDescriptor::scalar(BaseType::Long);
            let v = self.types().convert(&mut self.func, v, &ty, &long)?;
            idx.push(v);
        }

        match idx.len() {
            1 => {
                self.func.call(
                    None,
                    runtime::ARRAY_CHECK_1,
                    &[('l', desc.clone()), ('l', idx[0].clone())],
                )?;
            }
            2 => {
                self.func.call(
                    None,
                    runtime::ARRAY_CHECK_2,
                    &[
                        ('l', desc.clone()),
                        ('l', idx[0].clone()),
                        ('l', idx[1].clone()),
                    ],
                )?;
            }
            n => {
                return Err(CodeGenError::Logic(format!(
                    "array {} indexed with {} subscripts",
                    name, n
                )));
            }
        }

        let data = self.func.load('l', &desc)?;
        let lb1_addr = self
            .func
            .binop("add", 'l', &desc, &runtime::desc::LOWER_BOUND_1.to_string())?;
        let lb1 = self.func.load('l', &lb1_addr)?;

        let flat = if idx.len() == 1 {
            self.func.binop("sub", 'l', &idx[0], &lb1)?
        } else {
            let lb2_addr = self
                .func
                .binop("add", 'l', &desc, &runtime::desc::LOWER_BOUND_2.to_string())?;
            let lb2 = self.func.load('l', &lb2_addr)?;
            let ub2_addr = self
                .func
                .binop("add", 'l', &desc, &runtime::desc::UPPER_BOUND_2.to_string())?;
            let ub2 = self.func.load('l', &ub2_addr)?;
            let span = self.func.binop("sub", 'l', &ub2, &lb2)?;
            let width = self.func.binop("add", 'l', &span, "1")?;
            let row = self.func.binop("sub", 'l', &idx[0], &lb1)?;
            let row_off = self.func.binop("mul", 'l', &row, &width)?;
            let col = self.func.binop("sub", 'l', &idx[1], &lb2)?;
            self.func.binop("add", 'l', &row_off, &col)?
        };

        let esz_addr = self
            .func
            .binop("add", 'l', &desc, &runtime::desc::ELEMENT_SIZE.to_string())?;
        let esz = self.func.load('l', &esz_addr)?;
        let byte_off = self.func.binop("mul", 'l', &flat, &esz)?;
        let addr = self.func.binop("add", 'l', &data, &byte_off)?;
        Ok((addr, elem))
    }

    /// Address of an expression, for BYREF arguments and field bases.
    pub(super) fn expr_addr(
        &mut self,
        expr: &Expr,
    ) -> Result<Option<(String, TypeDescriptor)>, CodeGenError> {
        match &expr.kind {
            ExprKind::Var(name) => match self.resolve_scalar(name) {
                Some(ScalarRef::Constant(_)) | None => Ok(None),
                Some(_) => Ok(Some(self.scalar_addr(name)?)),
            },
            ExprKind::Call { name, args } if self.array_exists(name) => {
                Ok(Some(self.array_elem_addr(name, args)?))
            }
            ExprKind::Field { base, field } => Ok(Some(self.field_addr_of_expr(base, field)?)),
            _ => Ok(None),
        }
    }

    /// Address of `base.field`, using the byte offset the semantic analyzer
    /// assigned to the field.
    fn field_addr_of_expr(
        &mut self,
        base: &Expr,
        field: &str,
    ) -> Result<(String, TypeDescriptor), CodeGenError> {
        let (base_addr, base_ty) = match self.expr_addr(base)? {
            Some(pair) => pair,
            None => {
                // A record-valued expression is itself an address
                let (v, ty) = self.emit_expr(base)?;
                (v, ty)
            }
        };
        self.field_addr(&base_addr, &base_ty, field)
    }

    /// Offset a record address to one of its fields.
    pub(super) fn field_addr(
        &mut self,
        base_addr: &str,
        base_ty: &TypeDescriptor,
        field: &str,
    ) -> Result<(String, TypeDescriptor), CodeGenError> {
        if !base_ty.is_record() {
            return Err(CodeGenError::Logic(format!(
                ".{} applied to a non-record value",
                field
            )));
        }
        let sym = self
            .symbols
            .type_by_id(base_ty.udt_id)
            .ok_or_else(|| CodeGenError::Logic(format!("unknown TYPE id {}", base_ty.udt_id)))?;
        let record_field = sym.field(field).ok_or_else(|| {
            CodeGenError::Logic(format!("TYPE {} has no field {}", sym.name, field))
        })?;
        let ty = record_field.ty.clone();
        let offset = record_field.byte_offset;
        let addr = self
            .func
            .binop("add", 'l', base_addr, &offset.to_string())?;
        Ok((addr, ty))
    }

    // =========================================================================
    // Calls
    // =========================================================================

    pub(super) fn emit_user_call(
        &mut self,
        name: &str,
        args: &[Expr],
    ) -> Result<(String, TypeDescriptor), CodeGenError> {
        let symbols = self.symbols;
        let proc = symbols
            .procedures
            .get(name)
            .ok_or_else(|| CodeGenError::Logic(format!("unresolved procedure {}", name)))?;
        if proc.params.len() != args.len() {
            return Err(CodeGenError::Logic(format!(
                "{} called with {} argument(s), expects {}",
                name,
                args.len(),
                proc.params.len()
            )));
        }

        let mut call_args = Vec::new();
        for (param, arg) in proc.params.iter().zip(args) {
            // The pointed-to storage type, independent of the passing mode
            let mut value_ty = param.ty.clone();
            value_ty.is_byref = false;
            if param.by_ref || param.ty.is_record() {
                let addr = match self.expr_addr(arg)? {
                    Some((addr, _)) => addr,
                    None => {
                        // Value argument to a BYREF parameter: spill to a
                        // scratch slot and pass its address
                        let (v, ty) = self.emit_expr(arg)?;
                        let v = self.types().convert(&mut self.func, v, &ty, &value_ty)?;
                        let tm = self.types();
                        let size = tm.size_of(&value_ty)?;
                        let align = tm.align_of(&value_ty);
                        let slot = self.func.alloc(align, size)?;
                        self.func.store(tm.qbe_type(&value_ty), &v, &slot)?;
                        slot
                    }
                };
                call_args.push(('l', addr));
            } else {
                let (v, ty) = self.emit_expr(arg)?;
                let v = self.types().convert(&mut self.func, v, &ty, &value_ty)?;
                call_args.push((self.types().qbe_type(&value_ty), v));
            }
        }

        let symbol = names::proc_symbol(&proc.name, proc.is_sub);
        match self.types().qbe_return_type(&proc.return_type) {
            Some(ret) if !proc.is_sub => {
                let t = self
                    .func
                    .call(Some(ret), &symbol, &call_args)?
                    .expect("call with result");
                Ok((t, proc.return_type.clone()))
            }
            _ => {
                self.func.call(None, &symbol, &call_args)?;
                Ok((String::new(), TypeDescriptor::scalar(BaseType::Void)))
            }
        }
    }

    fn emit_builtin(
        &mut self,
        name: &str,
        args: &[Expr],
    ) -> Result<(String, TypeDescriptor), CodeGenError> {
        let string_base = match self.symbols.options.string_mode {
            crate::symbols::StringMode::Utf32 => BaseType::Utf32String,
            _ => BaseType::AsciiString,
        };
        let integer = TypeDescriptor::scalar(BaseType::Integer);
        let long = TypeDescriptor::scalar(BaseType::Long);
        let double = TypeDescriptor::scalar(BaseType::Double);

        match name {
            "len" => {
                let (s, _) = self.expect_arg(args, 0, name)?;
                let t = self
                    .func
                    .call(Some('w'), runtime::STRING_LEN, &[('l', s)])?
                    .expect("call with result");
                Ok((t, integer))
            }
            "mid$" => {
                let (s, sty) = self.expect_arg(args, 0, name)?;
                let (start, start_ty) = self.expect_arg(args, 1, name)?;
                let start =
                    self.types()
                        .convert(&mut self.func, start, &start_ty, &integer)?;
                // Two-argument form takes the rest of the string
                let count = if args.len() > 2 {
                    let (count, count_ty) = self.expect_arg(args, 2, name)?;
                    self.types()
                        .convert(&mut self.func, count, &count_ty, &integer)?
                } else {
                    self.func.copy('w', &i32::MAX.to_string())?
                };
                let t = self
                    .func
                    .call(
                        Some('l'),
                        runtime::STRING_SUBSTR,
                        &[('l', s), ('w', start), ('w', count)],
                    )?
                    .expect("call with result");
                Ok((t, sty))
            }
            "abs" => {
                let (v, ty) = self.expect_arg(args, 0, name)?;
                if ty.base_type().is_integer() {
                    let v = self.types().convert(&mut self.func, v, &ty, &long)?;
                    let t = self
                        .func
                        .call(Some('l'), runtime::ABS_LONG, &[('l', v)])?
                        .expect("call with result");
                    Ok((t, long))
                } else {
                    let v = self.types().convert(&mut self.func, v, &ty, &double)?;
                    let t = self
                        .func
                        .call(Some('d'), runtime::ABS_DOUBLE, &[('d', v)])?
                        .expect("call with result");
                    Ok((t, double))
                }
            }
            "sqr" => {
                let (v, ty) = self.expect_arg(args, 0, name)?;
                let v = self.types().convert(&mut self.func, v, &ty, &double)?;
                let t = self
                    .func
                    .call(Some('d'), runtime::SQRT, &[('d', v)])?
                    .expect("call with result");
                Ok((t, double))
            }
            "int" => {
                let (v, ty) = self.expect_arg(args, 0, name)?;
                let v = self.types().convert(&mut self.func, v, &ty, &double)?;
                let t = self
                    .func
                    .call(Some('d'), runtime::FLOOR, &[('d', v)])?
                    .expect("call with result");
                Ok((t, double))
            }
            "chr$" => {
                let (v, ty) = self.expect_arg(args, 0, name)?;
                let v = self.types().convert(&mut self.func, v, &ty, &integer)?;
                let t = self
                    .func
                    .call(Some('l'), runtime::STRING_CHR, &[('w', v)])?
                    .expect("call with result");
                Ok((t, TypeDescriptor::scalar(string_base)))
            }
            "asc" => {
                let (s, _) = self.expect_arg(args, 0, name)?;
                let t = self
                    .func
                    .call(Some('w'), runtime::STRING_ASC, &[('l', s)])?
                    .expect("call with result");
                Ok((t, integer))
            }
            "str$" => {
                let (v, ty) = self.expect_arg(args, 0, name)?;
                let t = if ty.base_type().is_integer() {
                    let v = self.types().convert(&mut self.func, v, &ty, &long)?;
                    self.func
                        .call(Some('l'), runtime::STRING_FROM_LONG, &[('l', v)])?
                        .expect("call with result")
                } else {
                    let v = self.types().convert(&mut self.func, v, &ty, &double)?;
                    self.func
                        .call(Some('l'), runtime::STRING_FROM_DOUBLE, &[('d', v)])?
                        .expect("call with result")
                };
                Ok((t, TypeDescriptor::scalar(string_base)))
            }
            "val" => {
                let (s, _) = self.expect_arg(args, 0, name)?;
                let t = self
                    .func
                    .call(Some('d'), runtime::STRING_VAL, &[('l', s)])?
                    .expect("call with result");
                Ok((t, double))
            }
            // ERR / ERL return 32-bit integers: the call result is QBE type
            // `w`, never `l` — an `l` classification makes the backend
            // reject the conversions downstream.
            "err" => {
                let t = self
                    .func
                    .call(Some('w'), runtime::ERR, &[])?
                    .expect("call with result");
                Ok((t, integer))
            }
            "erl" => {
                let t = self
                    .func
                    .call(Some('w'), runtime::ERL, &[])?
                    .expect("call with result");
                Ok((t, integer))
            }
            _ => Err(CodeGenError::Logic(format!(
                "unresolved function or array {}",
                name
            ))),
        }
    }

    fn expect_arg(
        &mut self,
        args: &[Expr],
        index: usize,
        name: &str,
    ) -> Result<(String, TypeDescriptor), CodeGenError> {
        let arg = args.get(index).ok_or_else(|| {
            CodeGenError::Logic(format!("{} missing argument {}", name, index + 1))
        })?;
        self.emit_expr(arg)
    }

    // =========================================================================
    // Binary operators
    // =========================================================================

    fn emit_binary(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<(String, TypeDescriptor), CodeGenError> {
        // Multiplication commutes; put a constant power of two on the right
        let (lhs, rhs) = if op == BinOp::Mul
            && power_of_two(lhs).is_some()
            && power_of_two(rhs).is_none()
        {
            (rhs, lhs)
        } else {
            (lhs, rhs)
        };

        let (lv, lt) = self.emit_expr(lhs)?;

        // Peephole strength reductions on integer * \ MOD by 2^k
        if matches!(op, BinOp::Mul | BinOp::IntDiv | BinOp::Mod) {
            if let Some(k) = power_of_two(rhs) {
                if lt.is_numeric() {
                    let (lv, lt) = self.to_integer(lv, &lt)?;
                    return self.emit_pow2_reduction(op, lv, lt, k);
                }
            }
        }

        let (rv, rt) = self.emit_expr(rhs)?;

        if lt.is_string() || rt.is_string() {
            return self.emit_string_binary(op, lv, lt, rv, rt);
        }
        if !lt.is_numeric() || !rt.is_numeric() {
            return Err(CodeGenError::Logic(
                "binary operator on non-scalar operands".into(),
            ));
        }

        if op.is_comparison() {
            let common = self.types().promote(&lt, &rt)?;
            let lv = self.types().convert(&mut self.func, lv, &lt, &common)?;
            let rv = self.types().convert(&mut self.func, rv, &rt, &common)?;
            let opcode = self.types().cmp_op(cmp_name(op), &common)?;
            let raw = self.func.cmp(&opcode, &lv, &rv)?;
            let t = self.func.neg('w', &raw)?;
            return Ok((t, TypeDescriptor::scalar(BaseType::Integer)));
        }

        match op {
            BinOp::Add | BinOp::Sub | BinOp::Mul => {
                let common = self.types().promote(&lt, &rt)?;
                let lv = self.types().convert(&mut self.func, lv, &lt, &common)?;
                let rv = self.types().convert(&mut self.func, rv, &rt, &common)?;
                let opcode = match op {
                    BinOp::Add => "add",
                    BinOp::Sub => "sub",
                    _ => "mul",
                };
                let qty = self.types().qbe_type(&common);
                let t = self.func.binop(opcode, qty, &lv, &rv)?;
                Ok((t, common))
            }
            BinOp::Div => {
                let double = TypeDescriptor::scalar(BaseType::Double);
                let lv = self.types().convert(&mut self.func, lv, &lt, &double)?;
                let rv = self.types().convert(&mut self.func, rv, &rt, &double)?;
                let t = self.func.binop("div", 'd', &lv, &rv)?;
                Ok((t, double))
            }
            BinOp::Pow => {
                let double = TypeDescriptor::scalar(BaseType::Double);
                let lv = self.types().convert(&mut self.func, lv, &lt, &double)?;
                let rv = self.types().convert(&mut self.func, rv, &rt, &double)?;
                let t = self
                    .func
                    .call(Some('d'), runtime::POW, &[('d', lv), ('d', rv)])?
                    .expect("call with result");
                Ok((t, double))
            }
            BinOp::IntDiv | BinOp::Mod => {
                let (lv, lt) = self.to_integer(lv, &lt)?;
                let (rv, rt) = self.to_integer(rv, &rt)?;
                let common = self.types().promote(&lt, &rt)?;
                let lv = self.types().convert(&mut self.func, lv, &lt, &common)?;
                let rv = self.types().convert(&mut self.func, rv, &rt, &common)?;
                let opcode = if op == BinOp::IntDiv { "div" } else { "rem" };
                let qty = self.types().qbe_type(&common);
                let t = self.func.binop(opcode, qty, &lv, &rv)?;
                Ok((t, common))
            }
            BinOp::And | BinOp::Or | BinOp::Xor => {
                let (lv, lt) = self.to_integer(lv, &lt)?;
                let (rv, rt) = self.to_integer(rv, &rt)?;
                let common = self.types().promote(&lt, &rt)?;
                let mut lv = self.types().convert(&mut self.func, lv, &lt, &common)?;
                let mut rv = self.types().convert(&mut self.func, rv, &rt, &common)?;
                if !self.symbols.options.bitwise_ops {
                    lv = self.normalize_truth(&lv, &common)?;
                    rv = self.normalize_truth(&rv, &common)?;
                }
                let opcode = match op {
                    BinOp::And => "and",
                    BinOp::Or => "or",
                    _ => "xor",
                };
                let qty = self.types().qbe_type(&common);
                let t = self.func.binop(opcode, qty, &lv, &rv)?;
                Ok((t, common))
            }
            _ => Err(CodeGenError::Logic(format!(
                "unhandled binary operator {:?}",
                op
            ))),
        }
    }

    fn emit_string_binary(
        &mut self,
        op: BinOp,
        lv: String,
        lt: TypeDescriptor,
        rv: String,
        rt: TypeDescriptor,
    ) -> Result<(String, TypeDescriptor), CodeGenError> {
        if !lt.is_string() || !rt.is_string() {
            return Err(CodeGenError::Logic(
                "string operand mixed with a number".into(),
            ));
        }
        match op {
            BinOp::Add => {
                let result_ty = self.types().promote(&lt, &rt)?;
                let t = self
                    .func
                    .call(
                        Some('l'),
                        runtime::STRING_CONCAT,
                        &[('l', lv), ('l', rv)],
                    )?
                    .expect("call with result");
                Ok((t, result_ty))
            }
            op if op.is_comparison() => {
                let c = self
                    .func
                    .call(
                        Some('w'),
                        runtime::STRING_COMPARE,
                        &[('l', lv), ('l', rv)],
                    )?
                    .expect("call with result");
                let integer = TypeDescriptor::scalar(BaseType::Integer);
                let opcode = self.types().cmp_op(cmp_name(op), &integer)?;
                let raw = self.func.cmp(&opcode, &c, "0")?;
                let t = self.func.neg('w', &raw)?;
                Ok((t, integer))
            }
            _ => Err(CodeGenError::Logic(format!(
                "operator {:?} does not apply to strings",
                op
            ))),
        }
    }

    /// `*` / `\` / MOD by a constant 2^k over an integer left operand.
    fn emit_pow2_reduction(
        &mut self,
        op: BinOp,
        lv: String,
        lt: TypeDescriptor,
        k: i64,
    ) -> Result<(String, TypeDescriptor), CodeGenError> {
        let qty = self.types().qbe_type(&lt);
        let shift = k.trailing_zeros();
        match op {
            BinOp::Mul => {
                if shift == 0 {
                    return Ok((lv, lt));
                }
                let t = self.func.binop("shl", qty, &lv, &shift.to_string())?;
                Ok((t, lt))
            }
            BinOp::Mod => {
                let mask = k - 1;
                let t = self.func.binop("and", qty, &lv, &mask.to_string())?;
                Ok((t, lt))
            }
            BinOp::IntDiv => {
                if shift == 0 {
                    return Ok((lv, lt));
                }
                // Biased arithmetic shift: truncates toward zero for
                // negative dividends, where a bare `sar` would round
                // toward negative infinity.
                let sign_shift = if qty == 'l' { 63 } else { 31 };
                let sign = self
                    .func
                    .binop("sar", qty, &lv, &sign_shift.to_string())?;
                let bias = self.func.binop("and", qty, &sign, &(k - 1).to_string())?;
                let sum = self.func.binop("add", qty, &lv, &bias)?;
                let t = self.func.binop("sar", qty, &sum, &shift.to_string())?;
                Ok((t, lt))
            }
            _ => Err(CodeGenError::Logic("not a reducible operator".into())),
        }
    }

    // =========================================================================
    // Truthiness and integer coercion
    // =========================================================================

    /// Coerce a numeric value to an integer type (floats truncate to LONG).
    pub(super) fn to_integer(
        &mut self,
        value: String,
        ty: &TypeDescriptor,
    ) -> Result<(String, TypeDescriptor), CodeGenError> {
        if ty.base_type().is_integer() {
            return Ok((value, ty.clone()));
        }
        if !ty.is_numeric() {
            return Err(CodeGenError::Logic(
                "integer operation on a non-number".into(),
            ));
        }
        let long = TypeDescriptor::scalar(BaseType::Long);
        let v = self.types().convert(&mut self.func, value, ty, &long)?;
        Ok((v, long))
    }

    /// A `w` word that is nonzero iff the value is nonzero, for `jnz`.
    pub(super) fn truth_value(
        &mut self,
        value: &str,
        ty: &TypeDescriptor,
    ) -> Result<String, CodeGenError> {
        match self.types().qbe_type(ty) {
            'w' => Ok(value.to_string()),
            'l' => self.func.cmp("cnel", value, "0"),
            's' => self.func.cmp("cnes", value, "s_0"),
            'd' => self.func.cmp("cned", value, "d_0"),
            other => Err(CodeGenError::Logic(format!(
                "no truth value for type {}",
                other
            ))),
        }
    }

    /// Normalize to the canonical 0 / -1 truth values (OPTION LOGICAL).
    fn normalize_truth(
        &mut self,
        value: &str,
        ty: &TypeDescriptor,
    ) -> Result<String, CodeGenError> {
        let qty = self.types().qbe_type(ty);
        let raw = match qty {
            'w' => self.func.cmp("cnew", value, "0")?,
            'l' => self.func.cmp("cnel", value, "0")?,
            _ => return Err(CodeGenError::Logic("logical op on a float".into())),
        };
        let negated = self.func.neg('w', &raw)?;
        if qty == 'l' {
            self.func.convert("extsw", 'l', &negated)
        } else {
            Ok(negated)
        }
    }
}

/// Constant positive power of two, if the expression is one.
fn power_of_two(expr: &Expr) -> Option<i64> {
    match &expr.kind {
        ExprKind::IntLit(n) if *n > 0 && n.count_ones() == 1 => Some(*n),
        _ => None,
    }
}

pub(super) fn cmp_name(op: BinOp) -> &'static str {
    match op {
        BinOp::Eq => "eq",
        BinOp::Ne => "ne",
        BinOp::Lt => "lt",
        BinOp::Le => "le",
        BinOp::Gt => "gt",
        BinOp::Ge => "ge",
        _ => "eq",
    }
}

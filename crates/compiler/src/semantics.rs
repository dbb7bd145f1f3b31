//! Semantic analysis
//!
//! Builds the read-only [`SymbolTable`] the CFG builder and emitter consume:
//! OPTION flags, user-defined record types with field byte offsets, constants,
//! procedure signatures, declared and implicitly-created variables, the
//! flattened DATA segment with RESTORE cursor indices, and line-number /
//! label tables.
//!
//! All *user* errors surface here (or in the parser); whatever reaches the
//! emitter afterwards is an internal invariant. The CFG builder additionally
//! rejects structural errors (undefined jump targets, EXIT outside a loop,
//! TRY without handlers).

use std::collections::HashMap;

use crate::ast::*;
use crate::config::CompilerOptions;
use crate::error::{CompileError, CompileResult};
use crate::symbols::*;

/// Built-in function return types, keyed by normalized name.
pub fn builtin_return(name: &str, mode: StringMode) -> Option<TypeDescriptor> {
    let string_ty = match mode {
        StringMode::Utf32 => BaseType::Utf32String,
        _ => BaseType::AsciiString,
    };
    let ty = match name {
        "len" => TypeDescriptor::scalar(BaseType::Integer),
        "asc" => TypeDescriptor::scalar(BaseType::Integer),
        "err" => TypeDescriptor::scalar(BaseType::Integer),
        "erl" => TypeDescriptor::scalar(BaseType::Integer),
        "abs" => TypeDescriptor::scalar(BaseType::Double),
        "sqr" => TypeDescriptor::scalar(BaseType::Double),
        "int" => TypeDescriptor::scalar(BaseType::Double),
        "val" => TypeDescriptor::scalar(BaseType::Double),
        "mid$" => TypeDescriptor::scalar(string_ty),
        "chr$" => TypeDescriptor::scalar(string_ty),
        "str$" => TypeDescriptor::scalar(string_ty),
        _ => return None,
    };
    Some(ty)
}

/// True when `name` is a built-in function usable in expressions.
pub fn is_builtin(name: &str) -> bool {
    builtin_return(name, StringMode::Auto).is_some()
}

/// Classify a string literal: ASCII iff every code point fits in 7 bits.
pub fn classify_literal(text: &str, mode: StringMode) -> BaseType {
    match mode {
        StringMode::Ascii => BaseType::AsciiString,
        StringMode::Utf32 => BaseType::Utf32String,
        StringMode::Auto => {
            if text.chars().all(|c| (c as u32) <= 127) {
                BaseType::AsciiString
            } else {
                BaseType::Utf32String
            }
        }
    }
}

/// Analyze a parsed program against the given compiler options.
pub fn analyze(program: &Program, options: &CompilerOptions) -> CompileResult<SymbolTable> {
    let mut analyzer = Analyzer::new(options);
    analyzer.run(program)?;
    Ok(analyzer.table)
}

struct Analyzer {
    table: SymbolTable,
    next_type_id: u32,
}

/// Per-procedure view while walking a body. Module scope has `proc` unset.
struct Scope {
    proc: Option<ProcInfo>,
    variables: HashMap<String, VariableSymbol>,
    arrays: HashMap<String, ArraySymbol>,
}

struct ProcInfo {
    name: String,
    params: Vec<ParamSymbol>,
    return_type: TypeDescriptor,
}

impl Scope {
    fn module() -> Self {
        Scope {
            proc: None,
            variables: HashMap::new(),
            arrays: HashMap::new(),
        }
    }

    fn procedure(sym: &ProcedureSymbol) -> Self {
        Scope {
            proc: Some(ProcInfo {
                name: sym.name.clone(),
                params: sym.params.clone(),
                return_type: sym.return_type.clone(),
            }),
            variables: HashMap::new(),
            arrays: HashMap::new(),
        }
    }
}

impl Analyzer {
    fn new(options: &CompilerOptions) -> Self {
        let mut table = SymbolTable::new();
        table.options = ProgramOptions {
            array_base: options.array_base,
            string_mode: options.string_mode,
            option_explicit: options.option_explicit,
            bitwise_ops: options.bitwise_ops,
            error_tracking: false,
        };
        Analyzer {
            table,
            next_type_id: 1,
        }
    }

    fn run(&mut self, program: &Program) -> CompileResult<()> {
        self.apply_options(&program.body)?;
        self.collect_types(&program.body)?;
        self.collect_constants(&program.body)?;
        self.collect_procedures(program)?;

        // Module body: declarations, DATA flattening, line/label tables
        let mut scope = Scope::module();
        self.walk_stmts(&program.body, &mut scope, true)?;
        self.table.variables.extend(scope.variables.drain());
        self.table.arrays.extend(scope.arrays.drain());

        // Procedure bodies
        for proc in &program.procedures {
            let sym = self
                .table
                .procedures
                .get(&proc.name)
                .cloned()
                .expect("procedure signature collected");
            let mut scope = Scope::procedure(&sym);
            self.walk_stmts(&proc.body, &mut scope, false)?;
            let entry = self.table.procedures.get_mut(&proc.name).unwrap();
            entry.variables = scope.variables;
            entry.arrays = scope.arrays;
        }

        // RESTORE targets can point forward, so they resolve only after the
        // whole program was walked.
        self.check_restore_targets(&program.body)?;
        for proc in &program.procedures {
            self.check_restore_targets(&proc.body)?;
        }
        Ok(())
    }

    fn check_restore_targets(&self, stmts: &[Stmt]) -> CompileResult<()> {
        for stmt in stmts {
            match &stmt.kind {
                StmtKind::Restore(Some(target)) => {
                    let known = match target {
                        JumpTarget::Line(n) => self.table.data.line_index.contains_key(n),
                        JumpTarget::Label(name) => {
                            self.table.data.label_index.contains_key(name)
                        }
                    };
                    if !known {
                        return Err(CompileError::semantic(
                            stmt.pos.line,
                            format!("RESTORE target {} is not defined", target),
                        ));
                    }
                }
                StmtKind::If {
                    then_body,
                    elseifs,
                    else_body,
                    ..
                } => {
                    self.check_restore_targets(then_body)?;
                    for (_, body) in elseifs {
                        self.check_restore_targets(body)?;
                    }
                    if let Some(body) = else_body {
                        self.check_restore_targets(body)?;
                    }
                }
                StmtKind::Select {
                    arms, else_body, ..
                } => {
                    for arm in arms {
                        self.check_restore_targets(&arm.body)?;
                    }
                    if let Some(body) = else_body {
                        self.check_restore_targets(body)?;
                    }
                }
                StmtKind::For { body, .. }
                | StmtKind::While { body, .. }
                | StmtKind::Repeat { body, .. }
                | StmtKind::Do { body, .. } => self.check_restore_targets(body)?,
                StmtKind::Try {
                    body,
                    catches,
                    finally,
                } => {
                    self.check_restore_targets(body)?;
                    for clause in catches {
                        self.check_restore_targets(&clause.body)?;
                    }
                    if let Some(body) = finally {
                        self.check_restore_targets(body)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn string_base(&self) -> BaseType {
        match self.table.options.string_mode {
            StringMode::Utf32 => BaseType::Utf32String,
            _ => BaseType::AsciiString,
        }
    }

    // =========================================================================
    // Collection passes
    // =========================================================================

    fn apply_options(&mut self, body: &[Stmt]) -> CompileResult<()> {
        for stmt in body {
            if let StmtKind::Option(setting) = &stmt.kind {
                match setting {
                    OptionSetting::Base(n) => self.table.options.array_base = *n,
                    OptionSetting::Explicit => self.table.options.option_explicit = true,
                    OptionSetting::StringAscii => {
                        self.table.options.string_mode = StringMode::Ascii
                    }
                    OptionSetting::StringUnicode => {
                        self.table.options.string_mode = StringMode::Utf32
                    }
                    OptionSetting::StringDetect => {
                        self.table.options.string_mode = StringMode::Auto
                    }
                    OptionSetting::Bitwise => self.table.options.bitwise_ops = true,
                    OptionSetting::Logical => self.table.options.bitwise_ops = false,
                }
            }
        }
        Ok(())
    }

    fn collect_types(&mut self, body: &[Stmt]) -> CompileResult<()> {
        for stmt in body {
            let StmtKind::TypeDecl { name, fields } = &stmt.kind else {
                continue;
            };
            if self.table.types.contains_key(name) {
                return Err(CompileError::semantic(
                    stmt.pos.line,
                    format!("TYPE {} already defined", name),
                ));
            }
            if fields.is_empty() {
                return Err(CompileError::semantic(
                    stmt.pos.line,
                    format!("TYPE {} has no fields", name),
                ));
            }

            let mut offset: u64 = 0;
            let mut max_align: u64 = 1;
            let mut record_fields = Vec::new();
            for (field_name, type_name) in fields {
                if record_fields
                    .iter()
                    .any(|f: &RecordField| f.name == *field_name)
                {
                    return Err(CompileError::semantic(
                        stmt.pos.line,
                        format!("duplicate field {} in TYPE {}", field_name, name),
                    ));
                }
                let ty = self.resolve_type_name(type_name, stmt.pos.line)?;
                let (size, align) = self.type_layout(&ty, stmt.pos.line)?;
                offset = align_up(offset, align);
                record_fields.push(RecordField {
                    name: field_name.clone(),
                    ty,
                    byte_offset: offset,
                });
                offset += size;
                max_align = max_align.max(align);
            }

            let sym = TypeSymbol {
                name: name.clone(),
                type_id: self.next_type_id,
                fields: record_fields,
                size: align_up(offset, max_align),
                align: max_align,
            };
            self.next_type_id += 1;
            self.table.types.insert(name.clone(), sym);
        }
        Ok(())
    }

    fn collect_constants(&mut self, body: &[Stmt]) -> CompileResult<()> {
        for stmt in body {
            let StmtKind::Const { name, value } = &stmt.kind else {
                continue;
            };
            if self.table.constants.contains_key(name) {
                return Err(CompileError::semantic(
                    stmt.pos.line,
                    format!("CONST {} already defined", name),
                ));
            }
            let (mut ty, const_value) = self.eval_const(value, stmt.pos.line)?;
            ty.is_const = true;
            self.table.constants.insert(
                name.clone(),
                ConstantSymbol {
                    name: name.clone(),
                    ty,
                    value: const_value,
                },
            );
        }
        Ok(())
    }

    /// CONST values are literals, possibly negated.
    fn eval_const(&self, expr: &Expr, line: u32) -> CompileResult<(TypeDescriptor, ConstValue)> {
        match &expr.kind {
            ExprKind::IntLit(n) => {
                let base = if i32::try_from(*n).is_ok() {
                    BaseType::Integer
                } else {
                    BaseType::Long
                };
                Ok((TypeDescriptor::scalar(base), ConstValue::Int(*n)))
            }
            ExprKind::FloatLit(f) => Ok((
                TypeDescriptor::scalar(BaseType::Double),
                ConstValue::Float(*f),
            )),
            ExprKind::StringLit(s) => {
                let base = classify_literal(s, self.table.options.string_mode);
                Ok((TypeDescriptor::scalar(base), ConstValue::Str(s.clone())))
            }
            ExprKind::Unary {
                op: UnOp::Neg,
                operand,
            } => match self.eval_const(operand, line)? {
                (ty, ConstValue::Int(n)) => Ok((ty, ConstValue::Int(-n))),
                (ty, ConstValue::Float(f)) => Ok((ty, ConstValue::Float(-f))),
                _ => Err(CompileError::semantic(line, "cannot negate a string CONST")),
            },
            _ => Err(CompileError::semantic(
                line,
                "CONST value must be a literal",
            )),
        }
    }

    fn collect_procedures(&mut self, program: &Program) -> CompileResult<()> {
        for proc in &program.procedures {
            if self.table.procedures.contains_key(&proc.name) {
                return Err(CompileError::semantic(
                    proc.pos.line,
                    format!("procedure {} already defined", proc.name),
                ));
            }
            let mut params = Vec::new();
            for param in &proc.params {
                if params.iter().any(|p: &ParamSymbol| p.name == param.name) {
                    return Err(CompileError::semantic(
                        proc.pos.line,
                        format!("duplicate parameter {} in {}", param.name, proc.name),
                    ));
                }
                let mut ty = self.declared_type(&param.name, param.ty.as_ref(), proc.pos.line)?;
                ty.is_byref = param.by_ref;
                params.push(ParamSymbol {
                    name: param.name.clone(),
                    ty,
                    by_ref: param.by_ref,
                });
            }
            let return_type = match proc.kind {
                ProcedureKind::Sub => TypeDescriptor::scalar(BaseType::Void),
                ProcedureKind::Function => {
                    self.declared_type(&proc.name, proc.return_type.as_ref(), proc.pos.line)?
                }
            };
            self.table.procedures.insert(
                proc.name.clone(),
                ProcedureSymbol {
                    name: proc.name.clone(),
                    params,
                    return_type,
                    is_sub: proc.kind == ProcedureKind::Sub,
                    variables: HashMap::new(),
                    arrays: HashMap::new(),
                },
            );
        }
        Ok(())
    }

    // =========================================================================
    // Type resolution helpers
    // =========================================================================

    fn resolve_type_name(&self, name: &TypeName, line: u32) -> CompileResult<TypeDescriptor> {
        let ty = match name {
            TypeName::Integer => TypeDescriptor::scalar(BaseType::Integer),
            TypeName::Long => TypeDescriptor::scalar(BaseType::Long),
            TypeName::Single => TypeDescriptor::scalar(BaseType::Single),
            TypeName::Double => TypeDescriptor::scalar(BaseType::Double),
            TypeName::Str => TypeDescriptor::scalar(self.string_base()),
            TypeName::User(type_name) => {
                let sym = self.table.types.get(type_name).ok_or_else(|| {
                    CompileError::semantic(line, format!("unknown TYPE {}", type_name))
                })?;
                TypeDescriptor::record(sym.type_id)
            }
        };
        Ok(ty)
    }

    fn type_layout(&self, ty: &TypeDescriptor, line: u32) -> CompileResult<(u64, u64)> {
        let layout = match ty.base_type() {
            BaseType::Integer | BaseType::Single => (4, 4),
            BaseType::Long | BaseType::Double => (8, 8),
            BaseType::AsciiString | BaseType::Utf32String => (8, 8),
            BaseType::UserDefined => {
                let sym = self.table.type_by_id(ty.udt_id).ok_or_else(|| {
                    CompileError::semantic(line, format!("unknown TYPE id {}", ty.udt_id))
                })?;
                (sym.size, sym.align)
            }
            BaseType::Void => {
                return Err(CompileError::semantic(line, "void has no layout"));
            }
        };
        Ok(layout)
    }

    /// Resolve a declaration's type from annotation, sigil, or the default.
    fn declared_type(
        &self,
        name: &str,
        annotation: Option<&TypeName>,
        line: u32,
    ) -> CompileResult<TypeDescriptor> {
        let (_, sigil) = split_sigil(name);
        if let Some(type_name) = annotation {
            if sigil.is_some() {
                return Err(CompileError::semantic(
                    line,
                    format!("{}: sigil and AS clause cannot both be given", name),
                ));
            }
            return self.resolve_type_name(type_name, line);
        }
        if let Some(sigil) = sigil {
            let base = sigil_base_type(sigil, self.table.options.string_mode)
                .expect("lexer only attaches known sigils");
            return Ok(TypeDescriptor::scalar(base));
        }
        // Unannotated, unsigiled names default to DOUBLE
        Ok(TypeDescriptor::scalar(BaseType::Double))
    }

    // =========================================================================
    // Statement walking
    // =========================================================================

    fn walk_stmts(
        &mut self,
        stmts: &[Stmt],
        scope: &mut Scope,
        module_level: bool,
    ) -> CompileResult<()> {
        for stmt in stmts {
            if let Some(line) = stmt.basic_line {
                if module_level || scope.proc.is_none() {
                    if self.table.line_numbers.contains_key(&line) {
                        return Err(CompileError::semantic(
                            stmt.pos.line,
                            format!("duplicate line number {}", line),
                        ));
                    }
                    self.table.line_numbers.insert(line, stmt.pos.line);
                    self.table
                        .data
                        .line_index
                        .insert(line, self.table.data.values.len());
                }
            }
            self.walk_stmt(stmt, scope, module_level)?;
        }
        Ok(())
    }

    fn walk_stmt(
        &mut self,
        stmt: &Stmt,
        scope: &mut Scope,
        module_level: bool,
    ) -> CompileResult<()> {
        let line = stmt.pos.line;
        match &stmt.kind {
            StmtKind::Label(name) => {
                if module_level {
                    if self.table.labels.contains_key(name) {
                        return Err(CompileError::semantic(
                            line,
                            format!("duplicate label {}", name),
                        ));
                    }
                    self.table.labels.insert(name.clone(), line);
                    self.table
                        .data
                        .label_index
                        .insert(name.clone(), self.table.data.values.len());
                }
            }
            StmtKind::Let { target, value } => {
                self.check_lvalue(target, scope, line)?;
                self.infer(value, scope)?;
                // Assigning through the function name sets the return value
            }
            StmtKind::Print { items, .. } => {
                for item in items {
                    self.infer(&item.expr, scope)?;
                }
            }
            StmtKind::Input { targets, .. } => {
                for target in targets {
                    self.check_lvalue(target, scope, line)?;
                }
            }
            StmtKind::If {
                cond,
                then_body,
                elseifs,
                else_body,
            } => {
                self.infer(cond, scope)?;
                self.walk_stmts(then_body, scope, module_level)?;
                for (c, body) in elseifs {
                    self.infer(c, scope)?;
                    self.walk_stmts(body, scope, module_level)?;
                }
                if let Some(body) = else_body {
                    self.walk_stmts(body, scope, module_level)?;
                }
            }
            StmtKind::Select {
                selector,
                arms,
                else_body,
            } => {
                let selector_ty = self.infer(selector, scope)?;
                for arm in arms {
                    for test in &arm.tests {
                        let test_ty = match test {
                            CaseTest::Value(e) => self.infer(e, scope)?,
                            CaseTest::Range(lo, hi) => {
                                let lo_ty = self.infer(lo, scope)?;
                                self.infer(hi, scope)?;
                                lo_ty
                            }
                            CaseTest::Relational(_, e) => self.infer(e, scope)?,
                        };
                        if selector_ty.is_string() != test_ty.is_string() {
                            return Err(CompileError::semantic(
                                line,
                                "CASE value type does not match SELECT selector",
                            ));
                        }
                    }
                    self.walk_stmts(&arm.body, scope, module_level)?;
                }
                if let Some(body) = else_body {
                    self.walk_stmts(body, scope, module_level)?;
                }
            }
            StmtKind::For {
                var,
                start,
                end,
                step,
                body,
            } => {
                let ty = self.lookup_or_declare(var, scope, line)?;
                if !ty.is_numeric() {
                    return Err(CompileError::semantic(
                        line,
                        format!("FOR counter {} must be numeric", var),
                    ));
                }
                self.infer(start, scope)?;
                self.infer(end, scope)?;
                if let Some(step) = step {
                    self.infer(step, scope)?;
                    if is_constant_zero(step) {
                        return Err(CompileError::semantic(line, "FOR STEP cannot be zero"));
                    }
                }
                self.walk_stmts(body, scope, module_level)?;
            }
            StmtKind::While { cond, body } => {
                self.infer(cond, scope)?;
                self.walk_stmts(body, scope, module_level)?;
            }
            StmtKind::Repeat { body, until } => {
                self.walk_stmts(body, scope, module_level)?;
                self.infer(until, scope)?;
            }
            StmtKind::Do { pre, post, body } => {
                if let Some((_, cond)) = pre {
                    self.infer(cond, scope)?;
                }
                self.walk_stmts(body, scope, module_level)?;
                if let Some((_, cond)) = post {
                    self.infer(cond, scope)?;
                }
            }
            StmtKind::OnGoto { selector, .. } | StmtKind::OnGosub { selector, .. } => {
                self.infer(selector, scope)?;
            }
            StmtKind::OnCall { selector, targets } => {
                self.infer(selector, scope)?;
                for target in targets {
                    let proc = self.table.procedures.get(target).ok_or_else(|| {
                        CompileError::semantic(line, format!("undefined SUB {}", target))
                    })?;
                    if !proc.is_sub {
                        return Err(CompileError::semantic(
                            line,
                            format!("ON CALL target {} is not a SUB", target),
                        ));
                    }
                }
            }
            StmtKind::Call { name, args } => {
                for arg in args {
                    self.infer(arg, scope)?;
                }
                let proc = self.table.procedures.get(name).ok_or_else(|| {
                    CompileError::semantic(line, format!("undefined SUB {}", name))
                })?;
                if !proc.is_sub {
                    return Err(CompileError::semantic(
                        line,
                        format!("{} is a FUNCTION; call it in an expression", name),
                    ));
                }
                if proc.params.len() != args.len() {
                    return Err(CompileError::semantic(
                        line,
                        format!(
                            "{} expects {} argument(s), got {}",
                            name,
                            proc.params.len(),
                            args.len()
                        ),
                    ));
                }
            }
            StmtKind::Try {
                body,
                catches,
                finally,
            } => {
                self.table.options.error_tracking = true;
                self.walk_stmts(body, scope, module_level)?;
                for clause in catches {
                    for code in &clause.codes {
                        let ty = self.infer(code, scope)?;
                        if !ty.is_numeric() {
                            return Err(CompileError::semantic(
                                clause.pos.line,
                                "CATCH codes must be numeric",
                            ));
                        }
                    }
                    self.walk_stmts(&clause.body, scope, module_level)?;
                }
                if let Some(body) = finally {
                    self.walk_stmts(body, scope, module_level)?;
                }
            }
            StmtKind::Throw(expr) => {
                let ty = self.infer(expr, scope)?;
                if !ty.is_numeric() {
                    return Err(CompileError::semantic(
                        line,
                        "THROW requires a numeric error code",
                    ));
                }
            }
            StmtKind::Dim(decls) => {
                for decl in decls {
                    self.declare_dim(decl, scope, line)?;
                }
            }
            StmtKind::Redim { name, bounds, .. } => {
                if bounds.len() > 2 {
                    return Err(CompileError::semantic(
                        line,
                        "arrays are limited to two dimensions",
                    ));
                }
                for (lo, hi) in bounds {
                    if let Some(lo) = lo {
                        self.infer(lo, scope)?;
                    }
                    self.infer(hi, scope)?;
                }
                if self.find_array(name, scope).is_none() {
                    return Err(CompileError::semantic(
                        line,
                        format!("REDIM of undeclared array {}", name),
                    ));
                }
            }
            StmtKind::Erase(names) => {
                for name in names {
                    if self.find_array(name, scope).is_none() {
                        return Err(CompileError::semantic(
                            line,
                            format!("ERASE of undeclared array {}", name),
                        ));
                    }
                }
            }
            StmtKind::Data(values) => {
                if !module_level {
                    return Err(CompileError::semantic(
                        line,
                        "DATA is only allowed at module level",
                    ));
                }
                self.table.data.values.extend(values.iter().cloned());
            }
            StmtKind::Read(targets) => {
                for target in targets {
                    self.check_lvalue(target, scope, line)?;
                }
            }
            StmtKind::Restore(_) => {}
            StmtKind::Swap(a, b) => {
                let ta = self.check_lvalue(a, scope, line)?;
                let tb = self.check_lvalue(b, scope, line)?;
                if ta != tb || ta.is_record() {
                    return Err(CompileError::semantic(
                        line,
                        "SWAP requires two scalar values of the same type",
                    ));
                }
            }
            StmtKind::Inc(target, amount) | StmtKind::Dec(target, amount) => {
                let ty = self.check_lvalue(target, scope, line)?;
                if !ty.is_numeric() {
                    return Err(CompileError::semantic(line, "INC/DEC requires a number"));
                }
                if let Some(amount) = amount {
                    self.infer(amount, scope)?;
                }
            }
            StmtKind::Goto(_)
            | StmtKind::Gosub(_)
            | StmtKind::Return
            | StmtKind::Exit(_)
            | StmtKind::Continue(_)
            | StmtKind::End
            | StmtKind::Rem
            | StmtKind::Const { .. }
            | StmtKind::TypeDecl { .. }
            | StmtKind::Option(_) => {}
        }
        Ok(())
    }

    fn declare_dim(&mut self, decl: &DimDecl, scope: &mut Scope, line: u32) -> CompileResult<()> {
        if decl.bounds.is_empty() && !decl.dynamic {
            // Scalar declaration
            let ty = self.declared_type(&decl.name, decl.ty.as_ref(), line)?;
            if self.lookup_declared(&decl.name, scope).is_some() {
                return Err(CompileError::semantic(
                    line,
                    format!("{} already declared", decl.name),
                ));
            }
            let sym = VariableSymbol {
                name: decl.name.clone(),
                ty,
                shared: scope.proc.is_none(),
                declared_line: line,
            };
            scope.variables.insert(decl.name.clone(), sym);
            return Ok(());
        }

        if decl.bounds.len() > 2 {
            return Err(CompileError::semantic(
                line,
                "arrays are limited to two dimensions",
            ));
        }
        for (lo, hi) in &decl.bounds {
            if let Some(lo) = lo {
                self.infer(lo, scope)?;
            }
            self.infer(hi, scope)?;
        }
        if self.find_array(&decl.name, scope).is_some() {
            return Err(CompileError::semantic(
                line,
                format!("array {} already declared", decl.name),
            ));
        }
        let elem = self.declared_type(&decl.name, decl.ty.as_ref(), line)?;
        // Extent metadata: constant bounds record their element count,
        // runtime bounds record a dynamic axis
        let extents: Vec<i64> = decl
            .bounds
            .iter()
            .map(|(lo, hi)| {
                let lo = match lo {
                    None => Some(self.table.options.array_base),
                    Some(e) => const_int(e),
                };
                match (lo, const_int(hi)) {
                    (Some(lo), Some(hi)) => hi - lo + 1,
                    _ => DYNAMIC_EXTENT,
                }
            })
            .collect();
        let ty = TypeDescriptor::array_of(&elem, extents);
        let sym = ArraySymbol {
            name: decl.name.clone(),
            elem,
            ty,
            rank: decl.bounds.len().max(1) as u32,
            dynamic: decl.dynamic,
            declared_line: line,
        };
        scope.arrays.insert(decl.name.clone(), sym);
        Ok(())
    }

    // =========================================================================
    // Name lookup and implicit declaration
    // =========================================================================

    /// Parameter of the enclosing procedure, then local, then module scope.
    /// This order is load-bearing: a module variable must never shadow a
    /// parameter of the same name.
    fn lookup_declared(&self, name: &str, scope: &Scope) -> Option<TypeDescriptor> {
        if let Some(proc) = &scope.proc {
            if let Some(param) = proc.params.iter().find(|p| p.name == name) {
                return Some(param.ty.clone());
            }
        }
        if let Some(var) = scope.variables.get(name) {
            return Some(var.ty.clone());
        }
        if let Some(var) = self.table.variables.get(name) {
            return Some(var.ty.clone());
        }
        if let Some(constant) = self.table.constants.get(name) {
            return Some(constant.ty.clone());
        }
        None
    }

    fn find_array(&self, name: &str, scope: &Scope) -> Option<ArraySymbol> {
        scope
            .arrays
            .get(name)
            .or_else(|| self.table.arrays.get(name))
            .cloned()
    }

    fn lookup_or_declare(
        &mut self,
        name: &str,
        scope: &mut Scope,
        line: u32,
    ) -> CompileResult<TypeDescriptor> {
        // The function name acts as the return-value accumulator
        if let Some(proc) = &scope.proc {
            if proc.name == name {
                return Ok(proc.return_type.clone());
            }
        }
        if let Some(ty) = self.lookup_declared(name, scope) {
            return Ok(ty);
        }
        if self.table.options.option_explicit {
            return Err(CompileError::semantic(
                line,
                format!("{} is not declared (OPTION EXPLICIT)", name),
            ));
        }
        let ty = self.declared_type(name, None, line)?;
        let sym = VariableSymbol {
            name: name.to_string(),
            ty: ty.clone(),
            shared: scope.proc.is_none(),
            declared_line: line,
        };
        scope.variables.insert(name.to_string(), sym);
        Ok(ty)
    }

    fn check_lvalue(
        &mut self,
        target: &LValue,
        scope: &mut Scope,
        line: u32,
    ) -> CompileResult<TypeDescriptor> {
        match target {
            LValue::Var(name) => {
                if self.table.constants.contains_key(name) {
                    return Err(CompileError::semantic(
                        line,
                        format!("cannot assign to CONST {}", name),
                    ));
                }
                self.lookup_or_declare(name, scope, line)
            }
            LValue::Elem { name, indices } => {
                for index in indices {
                    self.infer(index, scope)?;
                }
                let array = self.find_array(name, scope).ok_or_else(|| {
                    CompileError::semantic(line, format!("undeclared array {}", name))
                })?;
                if !array.dynamic && array.rank as usize != indices.len() {
                    return Err(CompileError::semantic(
                        line,
                        format!(
                            "array {} has {} dimension(s), {} index(es) given",
                            name,
                            array.rank,
                            indices.len()
                        ),
                    ));
                }
                Ok(array.elem)
            }
            LValue::Field { base, field } => {
                let base_ty = self.check_lvalue(base, scope, line)?;
                self.field_type(&base_ty, field, line)
            }
        }
    }

    fn field_type(
        &self,
        base: &TypeDescriptor,
        field: &str,
        line: u32,
    ) -> CompileResult<TypeDescriptor> {
        if !base.is_record() {
            return Err(CompileError::semantic(
                line,
                format!(".{} applied to a non-record value", field),
            ));
        }
        let sym = self.table.type_by_id(base.udt_id).ok_or_else(|| {
            CompileError::semantic(line, format!("unknown TYPE id {}", base.udt_id))
        })?;
        let record_field = sym.field(field).ok_or_else(|| {
            CompileError::semantic(
                line,
                format!("TYPE {} has no field {}", sym.name, field),
            )
        })?;
        Ok(record_field.ty.clone())
    }

    // =========================================================================
    // Expression type inference
    // =========================================================================

    fn infer(&mut self, expr: &Expr, scope: &mut Scope) -> CompileResult<TypeDescriptor> {
        let line = expr.pos.line;
        match &expr.kind {
            ExprKind::IntLit(n) => {
                let base = if i32::try_from(*n).is_ok() {
                    BaseType::Integer
                } else {
                    BaseType::Long
                };
                Ok(TypeDescriptor::scalar(base))
            }
            ExprKind::FloatLit(_) => Ok(TypeDescriptor::scalar(BaseType::Double)),
            ExprKind::StringLit(s) => Ok(TypeDescriptor::scalar(classify_literal(
                s,
                self.table.options.string_mode,
            ))),
            ExprKind::Var(name) => self.lookup_or_declare(name, scope, line),
            ExprKind::Call { name, args } => {
                for arg in args {
                    self.infer(arg, scope)?;
                }
                if let Some(array) = self.find_array(name, scope) {
                    if !array.dynamic && array.rank as usize != args.len() {
                        return Err(CompileError::semantic(
                            line,
                            format!(
                                "array {} has {} dimension(s), {} index(es) given",
                                name,
                                array.rank,
                                args.len()
                            ),
                        ));
                    }
                    return Ok(array.elem);
                }
                if let Some(proc) = self.table.procedures.get(name) {
                    if proc.is_sub {
                        return Err(CompileError::semantic(
                            line,
                            format!("SUB {} cannot be used in an expression", name),
                        ));
                    }
                    if proc.params.len() != args.len() {
                        return Err(CompileError::semantic(
                            line,
                            format!(
                                "{} expects {} argument(s), got {}",
                                name,
                                proc.params.len(),
                                args.len()
                            ),
                        ));
                    }
                    return Ok(proc.return_type.clone());
                }
                if let Some(ty) = builtin_return(name, self.table.options.string_mode) {
                    return Ok(ty);
                }
                Err(CompileError::semantic(
                    line,
                    format!("undefined function or array {}", name),
                ))
            }
            ExprKind::Field { base, field } => {
                let base_ty = self.infer(base, scope)?;
                self.field_type(&base_ty, field, line)
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let lt = self.infer(lhs, scope)?;
                let rt = self.infer(rhs, scope)?;
                self.binary_type(*op, &lt, &rt, line)
            }
            ExprKind::Unary { op, operand } => {
                let ty = self.infer(operand, scope)?;
                match op {
                    UnOp::Neg => {
                        if !ty.is_numeric() {
                            return Err(CompileError::semantic(line, "cannot negate a string"));
                        }
                        Ok(ty)
                    }
                    UnOp::Not => {
                        if !ty.is_numeric() {
                            return Err(CompileError::semantic(line, "NOT requires a number"));
                        }
                        let base = if ty.base_type() == BaseType::Long {
                            BaseType::Long
                        } else {
                            BaseType::Integer
                        };
                        Ok(TypeDescriptor::scalar(base))
                    }
                }
            }
        }
    }

    fn binary_type(
        &self,
        op: BinOp,
        lt: &TypeDescriptor,
        rt: &TypeDescriptor,
        line: u32,
    ) -> CompileResult<TypeDescriptor> {
        if lt.is_string() || rt.is_string() {
            if !lt.is_string() || !rt.is_string() {
                return Err(CompileError::semantic(
                    line,
                    "cannot mix strings and numbers in an expression",
                ));
            }
            return match op {
                BinOp::Add => {
                    // ASCII + ASCII stays ASCII; any UTF-32 operand promotes
                    let base = if lt.base_type() == BaseType::AsciiString
                        && rt.base_type() == BaseType::AsciiString
                    {
                        BaseType::AsciiString
                    } else {
                        BaseType::Utf32String
                    };
                    Ok(TypeDescriptor::scalar(base))
                }
                op if op.is_comparison() => Ok(TypeDescriptor::scalar(BaseType::Integer)),
                _ => Err(CompileError::semantic(
                    line,
                    "only + and comparisons apply to strings",
                )),
            };
        }
        if !lt.is_numeric() || !rt.is_numeric() {
            return Err(CompileError::semantic(line, "operands must be numeric"));
        }
        let ty = match op {
            BinOp::Div | BinOp::Pow => TypeDescriptor::scalar(BaseType::Double),
            BinOp::IntDiv | BinOp::Mod | BinOp::And | BinOp::Or | BinOp::Xor => {
                let base = if lt.base_type() == BaseType::Integer
                    && rt.base_type() == BaseType::Integer
                {
                    BaseType::Integer
                } else {
                    BaseType::Long
                };
                TypeDescriptor::scalar(base)
            }
            op if op.is_comparison() => TypeDescriptor::scalar(BaseType::Integer),
            _ => {
                let base = promote(lt.base_type(), rt.base_type());
                TypeDescriptor::scalar(base)
            }
        };
        Ok(ty)
    }
}

/// Numeric promotion lattice: Integer <= Long <= Single <= Double.
pub fn promote(a: BaseType, b: BaseType) -> BaseType {
    fn rank(ty: BaseType) -> u8 {
        match ty {
            BaseType::Integer => 0,
            BaseType::Long => 1,
            BaseType::Single => 2,
            BaseType::Double => 3,
            _ => 4,
        }
    }
    if rank(a) >= rank(b) { a } else { b }
}

/// Constant integer value of an expression, when it has one.
fn const_int(expr: &Expr) -> Option<i64> {
    match &expr.kind {
        ExprKind::IntLit(n) => Some(*n),
        ExprKind::Unary {
            op: UnOp::Neg,
            operand,
        } => const_int(operand).map(|n| -n),
        _ => None,
    }
}

fn is_constant_zero(expr: &Expr) -> bool {
    match &expr.kind {
        ExprKind::IntLit(0) => true,
        ExprKind::FloatLit(f) => *f == 0.0,
        ExprKind::Unary {
            op: UnOp::Neg,
            operand,
        } => is_constant_zero(operand),
        _ => false,
    }
}

fn align_up(offset: u64, align: u64) -> u64 {
    offset.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn table(source: &str) -> SymbolTable {
        let program = Parser::new(source).unwrap().parse().unwrap();
        analyze(&program, &CompilerOptions::default()).unwrap()
    }

    fn err(source: &str) -> CompileError {
        let program = Parser::new(source).unwrap().parse().unwrap();
        analyze(&program, &CompilerOptions::default()).unwrap_err()
    }

    #[test]
    fn test_sigil_typing_distinguishes_variables() {
        let t = table("x% = 1\nx# = 2.5\nx$ = \"s\"");
        assert_eq!(
            t.variables["x%"].ty,
            TypeDescriptor::scalar(BaseType::Integer)
        );
        assert_eq!(
            t.variables["x#"].ty,
            TypeDescriptor::scalar(BaseType::Double)
        );
        assert!(t.variables["x$"].ty.is_string());
    }

    #[test]
    fn test_default_type_is_double() {
        let t = table("plain = 1");
        assert_eq!(
            t.variables["plain"].ty,
            TypeDescriptor::scalar(BaseType::Double)
        );
    }

    #[test]
    fn test_option_explicit_rejects_implicit() {
        let program = Parser::new("OPTION EXPLICIT\nx% = 1")
            .unwrap()
            .parse()
            .unwrap();
        assert!(analyze(&program, &CompilerOptions::default()).is_err());
    }

    #[test]
    fn test_record_layout_offsets() {
        let t = table("TYPE Mixed\na AS INTEGER\nb AS DOUBLE\nc AS INTEGER\nEND TYPE");
        let sym = &t.types["mixed"];
        assert_eq!(sym.fields[0].byte_offset, 0);
        assert_eq!(sym.fields[1].byte_offset, 8); // aligned past the i32
        assert_eq!(sym.fields[2].byte_offset, 16);
        assert_eq!(sym.size, 24); // padded to 8-byte alignment
    }

    #[test]
    fn test_nested_record_layout() {
        let t = table(
            "TYPE Inner\nx AS DOUBLE\nEND TYPE\nTYPE Outer\ntag AS INTEGER\nbody AS Inner\nEND TYPE",
        );
        let outer = &t.types["outer"];
        assert_eq!(outer.fields[1].byte_offset, 8);
        assert_eq!(outer.size, 16);
    }

    #[test]
    fn test_function_signature() {
        let t = table(
            "FUNCTION Test(m AS INTEGER, n AS INTEGER) AS INTEGER\nTest = m + n\nEND FUNCTION",
        );
        let f = &t.procedures["test"];
        assert!(!f.is_sub);
        assert_eq!(f.params.len(), 2);
        assert_eq!(f.return_type, TypeDescriptor::scalar(BaseType::Integer));
    }

    #[test]
    fn test_parameter_shadows_module_variable() {
        // The module m must not leak into Test's body
        let t = table(
            "DIM m AS INTEGER\nm = 100\nFUNCTION Test(m AS INTEGER, n AS INTEGER) AS INTEGER\nTest = m + n\nEND FUNCTION",
        );
        let f = &t.procedures["test"];
        // m resolved as the parameter, so no local copy was created
        assert!(!f.variables.contains_key("m"));
        assert!(t.variables.contains_key("m"));
    }

    #[test]
    fn test_data_segment_flattening() {
        let t = table("10 DATA 1, 2\n20 DATA \"x\"\n30 READ a%, b%, c$");
        assert_eq!(t.data.values.len(), 3);
        assert_eq!(t.data.line_index[&10], 0);
        assert_eq!(t.data.line_index[&20], 2);
    }

    #[test]
    fn test_data_label_index() {
        let t = table("vals:\nDATA 7, 8\nREAD a%");
        assert_eq!(t.data.label_index["vals"], 0);
    }

    #[test]
    fn test_throw_rejects_string() {
        let e = err("THROW \"boom\"");
        assert!(e.to_string().contains("numeric"));
    }

    #[test]
    fn test_for_step_zero_rejected() {
        let e = err("FOR i% = 1 TO 10 STEP 0\nNEXT");
        assert!(e.to_string().contains("STEP"));
    }

    #[test]
    fn test_string_literal_classification() {
        assert_eq!(
            classify_literal("hello", StringMode::Auto),
            BaseType::AsciiString
        );
        assert_eq!(
            classify_literal("héllo", StringMode::Auto),
            BaseType::Utf32String
        );
        assert_eq!(
            classify_literal("héllo", StringMode::Ascii),
            BaseType::AsciiString
        );
    }

    #[test]
    fn test_concat_encoding_promotion() {
        let analyzer = Analyzer::new(&CompilerOptions::default());
        let ascii = TypeDescriptor::scalar(BaseType::AsciiString);
        let utf32 = TypeDescriptor::scalar(BaseType::Utf32String);
        let ty = analyzer.binary_type(BinOp::Add, &ascii, &utf32, 1).unwrap();
        assert_eq!(ty.base_type(), BaseType::Utf32String);
        let ty = analyzer.binary_type(BinOp::Add, &ascii, &ascii, 1).unwrap();
        assert_eq!(ty.base_type(), BaseType::AsciiString);
    }

    #[test]
    fn test_mixed_string_number_rejected() {
        let e = err("x = \"a\" + 1");
        assert!(e.to_string().contains("mix"));
    }

    #[test]
    fn test_three_dimensional_array_rejected() {
        let e = err("DIM a(1, 2, 3)");
        assert!(e.to_string().contains("two dimensions"));
    }

    #[test]
    fn test_undefined_sub_call() {
        let e = err("CALL Nothing(1)");
        assert!(e.to_string().contains("undefined SUB"));
    }

    #[test]
    fn test_const_and_assignment_rejection() {
        let t = table("CONST limit = 10\nx% = limit");
        assert!(t.constants.contains_key("limit"));
        let e = err("CONST limit = 10\nlimit = 11");
        assert!(e.to_string().contains("CONST"));
    }

    #[test]
    fn test_promote_lattice() {
        assert_eq!(promote(BaseType::Integer, BaseType::Long), BaseType::Long);
        assert_eq!(promote(BaseType::Long, BaseType::Single), BaseType::Single);
        assert_eq!(
            promote(BaseType::Single, BaseType::Double),
            BaseType::Double
        );
        assert_eq!(
            promote(BaseType::Integer, BaseType::Integer),
            BaseType::Integer
        );
    }
}

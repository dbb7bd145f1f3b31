//! QBE IL emission
//!
//! Walks the [`ProgramCfg`] and produces the textual IL stream: one type
//! declaration per user-defined record, the data section (module-level
//! storage, the DATA segment, interned string and float constants), then one
//! function per procedure plus `$main`.
//!
//! Control flow comes exclusively from CFG edges: every block terminator is
//! derived from the block's typed out-edges (see `control.rs`), never from
//! the order blocks happen to sit in memory.

mod control;
mod error;
mod except;
mod expr;
pub mod names;
pub mod qbe;
pub mod runtime;
mod stmt;
pub mod types;

pub use error::CodeGenError;

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::cfg::{ControlFlowGraph, ProgramCfg};
use crate::semantics::classify_literal;
use crate::symbols::{
    BaseType, ConstantSymbol, DataValue, ParamSymbol, ProcedureSymbol, SymbolTable,
    TypeDescriptor, VariableSymbol,
};

use qbe::QbeBuilder;
use types::TypeManager;

/// Emit the whole program as QBE IL text.
pub fn emit<'a>(
    cfg: &ProgramCfg<'a>,
    symbols: &'a SymbolTable,
) -> Result<String, CodeGenError> {
    let mut codegen = CodeGen::new(symbols);
    codegen.emit_type_section()?;
    codegen.emit_global_storage()?;
    codegen.emit_data_segment()?;

    codegen.emit_function(&cfg.main, None)?;
    for graph in &cfg.procedures {
        let proc = symbols.procedures.get(&graph.name).ok_or_else(|| {
            CodeGenError::Logic(format!("no symbol for procedure {}", graph.name))
        })?;
        codegen.emit_function(graph, Some(proc))?;
    }

    let mut out = String::new();
    writeln!(&mut out, "# QBE IL generated by bqc {}", env!("CARGO_PKG_VERSION"))?;
    if !codegen.type_section.is_empty() {
        out.push_str(&codegen.type_section);
    }
    if !codegen.data_section.is_empty() {
        out.push_str(&codegen.data_section);
    }
    out.push_str(&codegen.functions);
    Ok(out)
}

/// Interned string literal: data symbol plus its encoding classification.
pub(super) struct StringConst {
    pub name: String,
    pub utf32: bool,
}

pub struct CodeGen<'a> {
    pub(super) symbols: &'a SymbolTable,
    /// Current function body
    pub(super) func: QbeBuilder,
    pub(super) type_section: String,
    pub(super) data_section: String,
    pub(super) functions: String,
    pub(super) string_constants: HashMap<String, StringConst>,
    pub(super) string_counter: usize,
    pub(super) float_constants: HashMap<u64, String>,
    pub(super) float_counter: usize,
    /// Procedure being emitted; `None` while in `$main`
    pub(super) current_proc: Option<&'a ProcedureSymbol>,
    /// Source line of the statement being emitted (THROW reports it)
    pub(super) current_line: u32,
}

/// Where an unqualified scalar name resolved. Order of search is parameter
/// first, then procedure local, then module level; inverting it would let a
/// module variable shadow a parameter and read the wrong slot.
pub(super) enum ScalarRef<'a> {
    /// The enclosing FUNCTION's return-value accumulator
    RetVal(TypeDescriptor),
    Param(&'a ParamSymbol),
    Local(&'a VariableSymbol),
    Global(&'a VariableSymbol),
    Constant(&'a ConstantSymbol),
}

impl<'a> CodeGen<'a> {
    pub fn new(symbols: &'a SymbolTable) -> Self {
        CodeGen {
            symbols,
            func: QbeBuilder::new(),
            type_section: String::new(),
            data_section: String::new(),
            functions: String::new(),
            string_constants: HashMap::new(),
            string_counter: 0,
            float_constants: HashMap::new(),
            float_counter: 0,
            current_proc: None,
            current_line: 0,
        }
    }

    pub(super) fn types(&self) -> TypeManager<'a> {
        TypeManager {
            symbols: self.symbols,
        }
    }

    // =========================================================================
    // Program-level sections
    // =========================================================================

    /// `type :name = align N { ... }`, one per user-defined record, in
    /// definition order. QBE lays fields out with their natural alignment,
    /// which matches the byte offsets the semantic analyzer assigned.
    fn emit_type_section(&mut self) -> Result<(), CodeGenError> {
        let mut types: Vec<_> = self.symbols.types.values().collect();
        types.sort_by_key(|t| t.type_id);
        for sym in types {
            let mut fields = Vec::new();
            for field in &sym.fields {
                let item = if field.ty.is_record() {
                    let inner = self
                        .symbols
                        .type_by_id(field.ty.udt_id)
                        .ok_or_else(|| {
                            CodeGenError::Logic(format!("unknown TYPE id {}", field.ty.udt_id))
                        })?;
                    format!(":{}", names::mangle(&inner.name))
                } else {
                    self.types().qbe_type(&field.ty).to_string()
                };
                fields.push(item);
            }
            writeln!(
                &mut self.type_section,
                "type :{} = align {} {{ {} }}",
                names::mangle(&sym.name),
                sym.align,
                fields.join(", ")
            )?;
        }
        Ok(())
    }

    /// Zero-initialized storage for every module-level scalar and array
    /// descriptor slot, sorted by name for deterministic output.
    fn emit_global_storage(&mut self) -> Result<(), CodeGenError> {
        let tm = self.types();
        let mut vars: Vec<_> = self.symbols.variables.values().collect();
        vars.sort_by(|a, b| a.name.cmp(&b.name));
        for var in vars {
            let size = tm.size_of(&var.ty)?;
            writeln!(
                &mut self.data_section,
                "data {} = {{ z {} }}",
                names::global_scalar(&var.name, &var.ty),
                size
            )?;
        }
        let mut arrays: Vec<_> = self.symbols.arrays.values().collect();
        arrays.sort_by(|a, b| a.name.cmp(&b.name));
        for array in arrays {
            writeln!(
                &mut self.data_section,
                "data {} = {{ z 8 }}",
                names::global_array(&array.name, &array.elem)
            )?;
        }
        Ok(())
    }

    /// The flattened DATA segment: 16 bytes per entry, a tag word plus the
    /// value (integer bits, double bits, or a pointer to the interned text).
    fn emit_data_segment(&mut self) -> Result<(), CodeGenError> {
        if self.symbols.data.is_empty() {
            return Ok(());
        }
        let mut entries = Vec::new();
        let values = self.symbols.data.values.clone();
        for value in &values {
            match value {
                DataValue::Int(n) => entries.push(format!("w 0, w 0, l {}", n)),
                DataValue::Float(f) => {
                    entries.push(format!("w 1, w 0, l {}", f.to_bits()))
                }
                DataValue::Str(s) => {
                    let sc = self.intern_string(s)?;
                    let tag = if sc.1 { 3 } else { 2 };
                    entries.push(format!("w {}, w 0, l {}", tag, sc.0));
                }
            }
        }
        writeln!(
            &mut self.data_section,
            "data $dataseg = {{ {} }}",
            entries.join(", ")
        )?;
        Ok(())
    }

    // =========================================================================
    // Interning
    // =========================================================================

    /// Intern a string literal; returns (symbol, is_utf32). ASCII literals
    /// are byte data with a NUL; UTF-32 literals are code-point words with a
    /// zero terminator.
    pub(super) fn intern_string(&mut self, text: &str) -> Result<(String, bool), CodeGenError> {
        if let Some(existing) = self.string_constants.get(text) {
            return Ok((existing.name.clone(), existing.utf32));
        }
        let name = format!("$s.{}", self.string_counter);
        self.string_counter += 1;

        let mode = self.symbols.options.string_mode;
        let utf32 = classify_literal(text, mode) == BaseType::Utf32String;
        if utf32 {
            let mut words: Vec<String> =
                text.chars().map(|c| format!("w {}", c as u32)).collect();
            words.push("w 0".to_string());
            writeln!(
                &mut self.data_section,
                "data {} = {{ {} }}",
                name,
                words.join(", ")
            )?;
        } else {
            writeln!(
                &mut self.data_section,
                "data {} = {{ {}, b 0 }}",
                name,
                ascii_data_items(text)
            )?;
        }

        self.string_constants.insert(
            text.to_string(),
            StringConst {
                name: name.clone(),
                utf32,
            },
        );
        Ok((name, utf32))
    }

    /// Intern a double constant by bit pattern; stored as raw `l` bits and
    /// loaded with `loadd`, so round-tripping is exact.
    pub(super) fn intern_float(&mut self, value: f64) -> Result<String, CodeGenError> {
        let bits = value.to_bits();
        if let Some(existing) = self.float_constants.get(&bits) {
            return Ok(existing.clone());
        }
        let name = format!("$fp.{}", self.float_counter);
        self.float_counter += 1;
        writeln!(
            &mut self.data_section,
            "data {} = {{ l {} }} # {}",
            name, bits, value
        )?;
        self.float_constants.insert(bits, name.clone());
        Ok(name)
    }

    // =========================================================================
    // Function emission
    // =========================================================================

    fn emit_function(
        &mut self,
        cfg: &ControlFlowGraph<'a>,
        proc: Option<&'a ProcedureSymbol>,
    ) -> Result<(), CodeGenError> {
        // Temp and label counters reset per function
        self.func = QbeBuilder::new();
        self.current_proc = proc;

        let header = match proc {
            None => "export function w $main()".to_string(),
            Some(p) => {
                let tm = self.types();
                let params: Vec<String> = p
                    .params
                    .iter()
                    .map(|param| {
                        let ty = if param.by_ref || param.ty.is_record() {
                            'l'
                        } else {
                            tm.qbe_type(&param.ty)
                        };
                        format!("{} {}", ty, names::param_temp(&param.name, &param.ty))
                    })
                    .collect();
                let symbol = names::proc_symbol(&p.name, p.is_sub);
                match tm.qbe_return_type(&p.return_type) {
                    Some(ret) if !p.is_sub => {
                        format!("function {} ${}({})", ret, symbol, params.join(", "))
                    }
                    _ => format!("function ${}({})", symbol, params.join(", ")),
                }
            }
        };

        // Emission order: reachable blocks in BFS discovery order, then the
        // rest (exception paths, jump-only targets) by id.
        let reachable = cfg.reachable_order();
        let in_reachable: Vec<bool> = {
            let mut v = vec![false; cfg.blocks.len()];
            for &id in &reachable {
                v[id] = true;
            }
            v
        };
        let mut order = reachable;
        for block in &cfg.blocks {
            if !in_reachable[block.id] {
                order.push(block.id);
            }
        }

        for (pos, &id) in order.iter().enumerate() {
            let next = order.get(pos + 1).copied();
            self.emit_block(cfg, id, next)?;
        }

        writeln!(&mut self.functions, "{} {{", header)?;
        let body = std::mem::take(&mut self.func.buf);
        self.functions.push_str(&body);
        writeln!(&mut self.functions, "}}")?;
        Ok(())
    }

    /// Entry-block prologue: parameter spills, local slots, the return-value
    /// accumulator, and (in main) DATA-segment registration.
    pub(super) fn emit_prologue(&mut self, _cfg: &ControlFlowGraph<'a>) -> Result<(), CodeGenError> {
        let tm = self.types();
        match self.current_proc {
            None => {
                if !self.symbols.data.is_empty() {
                    let count = self.symbols.data.values.len();
                    self.func.call(
                        None,
                        runtime::DATA_INIT,
                        &[('l', "$dataseg".to_string()), ('w', count.to_string())],
                    )?;
                }
            }
            Some(proc) => {
                for param in &proc.params {
                    let slot = names::local_scalar(&param.name, &param.ty);
                    let indirect = param.by_ref || param.ty.is_record();
                    let (size, align, ty) = if indirect {
                        (8, 8, 'l')
                    } else {
                        (
                            tm.size_of(&param.ty)?,
                            tm.align_of(&param.ty),
                            tm.qbe_type(&param.ty),
                        )
                    };
                    self.func
                        .line(&format!("{} =l alloc{} {}", slot, align, size))?;
                    self.func.store(
                        ty,
                        &names::param_temp(&param.name, &param.ty),
                        &slot,
                    )?;
                }

                let mut locals: Vec<_> = proc.variables.values().collect();
                locals.sort_by(|a, b| a.name.cmp(&b.name));
                for var in locals {
                    let slot = names::local_scalar(&var.name, &var.ty);
                    let size = tm.size_of(&var.ty)?;
                    if var.ty.is_record() {
                        self.func.line(&format!("{} =l alloc8 {}", slot, size))?;
                        self.func.call(
                            None,
                            "memset",
                            &[
                                ('l', slot.clone()),
                                ('w', "0".to_string()),
                                ('l', size.to_string()),
                            ],
                        )?;
                    } else {
                        let align = tm.align_of(&var.ty);
                        self.func
                            .line(&format!("{} =l alloc{} {}", slot, align, size))?;
                        let ty = tm.qbe_type(&var.ty);
                        self.func.store(ty, zero_literal(ty), &slot)?;
                    }
                }

                let mut local_arrays: Vec<_> = proc.arrays.values().collect();
                local_arrays.sort_by(|a, b| a.name.cmp(&b.name));
                for array in local_arrays {
                    let slot = names::local_array(&array.name, &array.elem);
                    self.func.line(&format!("{} =l alloc8 8", slot))?;
                    self.func.store('l', "0", &slot)?;
                }

                if !proc.is_sub {
                    let ty = tm.qbe_type(&proc.return_type);
                    let size = tm.size_of(&proc.return_type)?;
                    let align = tm.align_of(&proc.return_type);
                    self.func
                        .line(&format!("%retval =l alloc{} {}", align, size))?;
                    self.func.store(ty, zero_literal(ty), "%retval")?;
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Name resolution
    // =========================================================================

    /// Parameter -> local -> module scope, with the function name resolving
    /// to the return accumulator and constants coming last.
    pub(super) fn resolve_scalar(&self, name: &str) -> Option<ScalarRef<'a>> {
        if let Some(proc) = self.current_proc {
            if !proc.is_sub && proc.name == name {
                return Some(ScalarRef::RetVal(proc.return_type.clone()));
            }
            if let Some(param) = proc.param(name) {
                return Some(ScalarRef::Param(param));
            }
            if let Some(var) = proc.variables.get(name) {
                return Some(ScalarRef::Local(var));
            }
        }
        if let Some(var) = self.symbols.variables.get(name) {
            return Some(ScalarRef::Global(var));
        }
        if let Some(constant) = self.symbols.constants.get(name) {
            return Some(ScalarRef::Constant(constant));
        }
        None
    }

    /// Address and type of a scalar variable's storage. BYREF parameters and
    /// record parameters hold a pointer in their slot; one load produces the
    /// storage address.
    pub(super) fn scalar_addr(
        &mut self,
        name: &str,
    ) -> Result<(String, TypeDescriptor), CodeGenError> {
        match self.resolve_scalar(name) {
            Some(ScalarRef::RetVal(ty)) => Ok(("%retval".to_string(), ty)),
            Some(ScalarRef::Param(param)) => {
                let slot = names::local_scalar(&param.name, &param.ty);
                // The returned descriptor describes the pointed-to storage
                let mut ty = param.ty.clone();
                ty.is_byref = false;
                if param.by_ref || param.ty.is_record() {
                    let addr = self.func.load('l', &slot)?;
                    Ok((addr, ty))
                } else {
                    Ok((slot, ty))
                }
            }
            Some(ScalarRef::Local(var)) => {
                Ok((names::local_scalar(&var.name, &var.ty), var.ty.clone()))
            }
            Some(ScalarRef::Global(var)) => {
                Ok((names::global_scalar(&var.name, &var.ty), var.ty.clone()))
            }
            Some(ScalarRef::Constant(_)) => Err(CodeGenError::Logic(format!(
                "constant {} has no storage",
                name
            ))),
            None => Err(CodeGenError::Logic(format!(
                "unresolved variable {}",
                name
            ))),
        }
    }

    /// Address of an array's descriptor slot plus the element type.
    pub(super) fn array_slot(
        &self,
        name: &str,
    ) -> Result<(String, TypeDescriptor), CodeGenError> {
        if let Some(proc) = self.current_proc {
            if let Some(array) = proc.arrays.get(name) {
                return Ok((
                    names::local_array(&array.name, &array.elem),
                    array.elem.clone(),
                ));
            }
        }
        if let Some(array) = self.symbols.arrays.get(name) {
            return Ok((
                names::global_array(&array.name, &array.elem),
                array.elem.clone(),
            ));
        }
        Err(CodeGenError::Logic(format!("unresolved array {}", name)))
    }

    /// The ERL value for the statement being emitted.
    pub(super) fn line_literal(&self) -> String {
        self.current_line.to_string()
    }
}

/// Zero literal for a store of the given QBE type.
pub(super) fn zero_literal(ty: char) -> &'static str {
    match ty {
        's' => "s_0",
        'd' => "d_0",
        _ => "0",
    }
}

/// Render ASCII text as QBE data items: printable runs as `b "..."`, the
/// rest (and quotes/backslashes) as numeric bytes.
fn ascii_data_items(text: &str) -> String {
    let mut items = Vec::new();
    let mut run = String::new();
    for &byte in text.as_bytes() {
        let printable = (0x20..0x7f).contains(&byte) && byte != b'"' && byte != b'\\';
        if printable {
            run.push(byte as char);
        } else {
            if !run.is_empty() {
                items.push(format!("b \"{}\"", run));
                run.clear();
            }
            items.push(format!("b {}", byte));
        }
    }
    if !run.is_empty() {
        items.push(format!("b \"{}\"", run));
    }
    if items.is_empty() {
        // Empty string: just the NUL the caller appends
        return "b \"\"".to_string();
    }
    items.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_data_items_plain() {
        assert_eq!(ascii_data_items("hi"), "b \"hi\"");
    }

    #[test]
    fn test_ascii_data_items_escapes() {
        assert_eq!(ascii_data_items("a\"b"), "b \"a\", b 34, b \"b\"");
        assert_eq!(ascii_data_items("a\nb"), "b \"a\", b 10, b \"b\"");
    }

    #[test]
    fn test_zero_literals() {
        assert_eq!(zero_literal('w'), "0");
        assert_eq!(zero_literal('l'), "0");
        assert_eq!(zero_literal('s'), "s_0");
        assert_eq!(zero_literal('d'), "d_0");
    }

    #[test]
    fn test_intern_float_dedup() {
        let symbols = SymbolTable::new();
        let mut codegen = CodeGen::new(&symbols);
        let a = codegen.intern_float(3.25).unwrap();
        let b = codegen.intern_float(3.25).unwrap();
        assert_eq!(a, b);
        assert_eq!(codegen.float_counter, 1);
        assert!(codegen
            .data_section
            .contains(&format!("l {}", 3.25f64.to_bits())));
    }

    #[test]
    fn test_intern_string_classification() {
        let symbols = SymbolTable::new(); // AUTO mode
        let mut codegen = CodeGen::new(&symbols);
        let (_, utf32) = codegen.intern_string("plain").unwrap();
        assert!(!utf32);
        let (_, utf32) = codegen.intern_string("héllo").unwrap();
        assert!(utf32);
        // UTF-32 literals are word data
        assert!(codegen.data_section.contains(&format!("w {}", 'é' as u32)));
    }

    #[test]
    fn test_string_mode_overrides_classification() {
        let mut symbols = SymbolTable::new();
        symbols.options.string_mode = crate::symbols::StringMode::Utf32;
        let mut codegen = CodeGen::new(&symbols);
        let (_, utf32) = codegen.intern_string("plain").unwrap();
        assert!(utf32);
    }
}

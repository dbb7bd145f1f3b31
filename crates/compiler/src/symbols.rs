//! Symbol table and type descriptors
//!
//! The semantic analyzer produces a [`SymbolTable`] that the CFG builder and
//! the code generator treat as read-only. Types are described by
//! [`TypeDescriptor`], a small composable value: a base type, a handful of
//! attribute flags, and (for records) the id of the defining [`TypeSymbol`].
//!
//! Array dimension metadata rides along on the descriptor but is *not* part
//! of type identity: two integer arrays unify regardless of their extents.

use std::collections::HashMap;

/// Base types known to the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseType {
    /// No value (SUB return "type")
    Void,
    /// 32-bit signed integer (`%` sigil, `AS INTEGER`)
    Integer,
    /// 64-bit signed integer (`&` sigil, `AS LONG`)
    Long,
    /// 32-bit IEEE float (`!` sigil, `AS SINGLE`)
    Single,
    /// 64-bit IEEE float (`#` sigil, `AS DOUBLE`)
    Double,
    /// String whose code points all fit in 7 bits
    AsciiString,
    /// String carried as UTF-32 code points
    Utf32String,
    /// User-defined record type; `udt_id` names the definition
    UserDefined,
}

impl BaseType {
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            BaseType::Integer | BaseType::Long | BaseType::Single | BaseType::Double
        )
    }

    pub fn is_integer(self) -> bool {
        matches!(self, BaseType::Integer | BaseType::Long)
    }

    pub fn is_float(self) -> bool {
        matches!(self, BaseType::Single | BaseType::Double)
    }

    pub fn is_string(self) -> bool {
        matches!(self, BaseType::AsciiString | BaseType::Utf32String)
    }
}

/// Extent of one array dimension: a fixed element count, or dynamic.
pub const DYNAMIC_EXTENT: i64 = -1;

/// Compositional type tag used for lowering and coercion.
///
/// Equality is structural over (base, attribute flags, udt_id). The
/// `dimensions` list is descriptive metadata only.
#[derive(Debug, Clone, Default)]
pub struct TypeDescriptor {
    pub base: Option<BaseType>,
    pub is_array: bool,
    pub is_byref: bool,
    pub is_const: bool,
    pub is_pointer: bool,
    /// Unique positive id, nonzero iff `base` is `UserDefined`
    pub udt_id: u32,
    /// Extents per dimension; `DYNAMIC_EXTENT` marks a runtime-sized axis
    pub dimensions: Vec<i64>,
}

impl PartialEq for TypeDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.base == other.base
            && self.is_array == other.is_array
            && self.is_byref == other.is_byref
            && self.is_const == other.is_const
            && self.is_pointer == other.is_pointer
            && self.udt_id == other.udt_id
    }
}

impl Eq for TypeDescriptor {}

impl TypeDescriptor {
    pub fn scalar(base: BaseType) -> Self {
        TypeDescriptor {
            base: Some(base),
            ..Default::default()
        }
    }

    pub fn record(udt_id: u32) -> Self {
        TypeDescriptor {
            base: Some(BaseType::UserDefined),
            udt_id,
            ..Default::default()
        }
    }

    pub fn array_of(elem: &TypeDescriptor, dimensions: Vec<i64>) -> Self {
        TypeDescriptor {
            base: elem.base,
            is_array: true,
            udt_id: elem.udt_id,
            dimensions,
            ..Default::default()
        }
    }

    /// The element type of an array descriptor.
    pub fn element(&self) -> TypeDescriptor {
        TypeDescriptor {
            base: self.base,
            udt_id: self.udt_id,
            ..Default::default()
        }
    }

    pub fn base_type(&self) -> BaseType {
        self.base.unwrap_or(BaseType::Void)
    }

    pub fn is_numeric(&self) -> bool {
        !self.is_array && self.base_type().is_numeric()
    }

    pub fn is_string(&self) -> bool {
        !self.is_array && self.base_type().is_string()
    }

    pub fn is_record(&self) -> bool {
        self.base_type() == BaseType::UserDefined
    }
}

/// One field of a user-defined record.
#[derive(Debug, Clone)]
pub struct RecordField {
    pub name: String,
    pub ty: TypeDescriptor,
    /// Byte offset assigned by the semantic analyzer; the emitter uses it
    /// verbatim for address computation.
    pub byte_offset: u64,
}

/// A user-defined record type (`TYPE ... END TYPE`).
#[derive(Debug, Clone)]
pub struct TypeSymbol {
    pub name: String,
    pub type_id: u32,
    pub fields: Vec<RecordField>,
    /// Aligned total size in bytes
    pub size: u64,
    pub align: u64,
}

impl TypeSymbol {
    pub fn field(&self, name: &str) -> Option<&RecordField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// A scalar (or record-valued) variable.
#[derive(Debug, Clone)]
pub struct VariableSymbol {
    pub name: String,
    pub ty: TypeDescriptor,
    /// True for module-level variables visible inside procedures
    pub shared: bool,
    pub declared_line: u32,
}

/// An array variable; the runtime value is an ArrayDescriptor pointer.
#[derive(Debug, Clone)]
pub struct ArraySymbol {
    pub name: String,
    pub elem: TypeDescriptor,
    /// Array-typed descriptor; extents are metadata (`DYNAMIC_EXTENT` when
    /// not a compile-time constant)
    pub ty: TypeDescriptor,
    pub rank: u32,
    pub dynamic: bool,
    pub declared_line: u32,
}

/// One declared procedure parameter.
#[derive(Debug, Clone)]
pub struct ParamSymbol {
    pub name: String,
    pub ty: TypeDescriptor,
    pub by_ref: bool,
}

/// A SUB or FUNCTION signature plus its local scope.
#[derive(Debug, Clone)]
pub struct ProcedureSymbol {
    pub name: String,
    pub params: Vec<ParamSymbol>,
    /// `Void` base for SUBs
    pub return_type: TypeDescriptor,
    pub is_sub: bool,
    pub variables: HashMap<String, VariableSymbol>,
    pub arrays: HashMap<String, ArraySymbol>,
}

impl ProcedureSymbol {
    pub fn param(&self, name: &str) -> Option<&ParamSymbol> {
        self.params.iter().find(|p| p.name == name)
    }
}

/// A named compile-time constant.
#[derive(Debug, Clone)]
pub struct ConstantSymbol {
    pub name: String,
    pub ty: TypeDescriptor,
    pub value: ConstValue,
}

#[derive(Debug, Clone)]
pub enum ConstValue {
    Int(i64),
    Float(f64),
    Str(String),
}

/// One literal in the flattened DATA segment.
#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    Int(i64),
    Float(f64),
    Str(String),
}

/// The program-wide DATA segment: an ordered run of literals plus the
/// cursor index of every line number / label that opens a DATA run, so
/// RESTORE targets resolve to indices at compile time.
#[derive(Debug, Clone, Default)]
pub struct DataSegment {
    pub values: Vec<DataValue>,
    pub line_index: HashMap<u32, usize>,
    pub label_index: HashMap<String, usize>,
}

impl DataSegment {
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// String handling mode selected by OPTION / CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StringMode {
    Ascii,
    Utf32,
    /// Classify each literal: all code points <= 127 tags ASCII, else UTF-32
    #[default]
    Auto,
}

/// Program-wide flags, seeded from [`crate::config::CompilerOptions`] and
/// then overridden by OPTION statements.
#[derive(Debug, Clone)]
pub struct ProgramOptions {
    /// Default array lower bound (0 or 1)
    pub array_base: i64,
    pub string_mode: StringMode,
    pub option_explicit: bool,
    /// True: AND/OR/XOR are bitwise; false: operands are normalized to
    /// 0 / -1 truth values first
    pub bitwise_ops: bool,
    pub error_tracking: bool,
}

impl Default for ProgramOptions {
    fn default() -> Self {
        ProgramOptions {
            array_base: 0,
            string_mode: StringMode::Auto,
            option_explicit: false,
            bitwise_ops: true,
            error_tracking: false,
        }
    }
}

/// Read-only symbol information shared by the CFG builder and the emitter.
///
/// Scalar and array maps are keyed by the normalized source name: lowercase,
/// sigil retained, so `X%`, `X#` and `X$` are three distinct entries.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    pub variables: HashMap<String, VariableSymbol>,
    pub arrays: HashMap<String, ArraySymbol>,
    pub procedures: HashMap<String, ProcedureSymbol>,
    pub types: HashMap<String, TypeSymbol>,
    pub constants: HashMap<String, ConstantSymbol>,
    pub line_numbers: HashMap<u32, u32>,
    pub labels: HashMap<String, u32>,
    pub data: DataSegment,
    pub options: ProgramOptions,
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable {
            options: ProgramOptions::default(),
            ..Default::default()
        }
    }

    pub fn type_by_id(&self, id: u32) -> Option<&TypeSymbol> {
        self.types.values().find(|t| t.type_id == id)
    }

    pub fn procedure(&self, name: &str) -> Option<&ProcedureSymbol> {
        self.procedures.get(&name.to_ascii_lowercase())
    }
}

/// Normalize a BASIC identifier for table lookup: lowercase, sigil kept.
pub fn normalize_name(name: &str) -> String {
    name.to_ascii_lowercase()
}

/// Split a normalized name into (stem, sigil).
pub fn split_sigil(name: &str) -> (&str, Option<char>) {
    match name.chars().last() {
        Some(c @ ('%' | '&' | '!' | '#' | '$')) => (&name[..name.len() - 1], Some(c)),
        _ => (name, None),
    }
}

/// The base type a sigil selects.
pub fn sigil_base_type(sigil: char, mode: StringMode) -> Option<BaseType> {
    match sigil {
        '%' => Some(BaseType::Integer),
        '&' => Some(BaseType::Long),
        '!' => Some(BaseType::Single),
        '#' => Some(BaseType::Double),
        '$' => Some(match mode {
            StringMode::Utf32 => BaseType::Utf32String,
            _ => BaseType::AsciiString,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_equality_ignores_dimensions() {
        let a = TypeDescriptor::array_of(&TypeDescriptor::scalar(BaseType::Integer), vec![10]);
        let b = TypeDescriptor::array_of(
            &TypeDescriptor::scalar(BaseType::Integer),
            vec![DYNAMIC_EXTENT],
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_descriptor_equality_sees_attributes() {
        let value = TypeDescriptor::scalar(BaseType::Double);
        let mut byref = TypeDescriptor::scalar(BaseType::Double);
        byref.is_byref = true;
        assert_ne!(value, byref);
    }

    #[test]
    fn test_udt_identity() {
        let a = TypeDescriptor::record(1);
        let b = TypeDescriptor::record(2);
        assert_ne!(a, b);
        assert_eq!(a, TypeDescriptor::record(1));
    }

    #[test]
    fn test_split_sigil() {
        assert_eq!(split_sigil("count%"), ("count", Some('%')));
        assert_eq!(split_sigil("name$"), ("name", Some('$')));
        assert_eq!(split_sigil("plain"), ("plain", None));
    }

    #[test]
    fn test_sigil_types() {
        assert_eq!(
            sigil_base_type('%', StringMode::Auto),
            Some(BaseType::Integer)
        );
        assert_eq!(
            sigil_base_type('$', StringMode::Utf32),
            Some(BaseType::Utf32String)
        );
        assert_eq!(
            sigil_base_type('$', StringMode::Ascii),
            Some(BaseType::AsciiString)
        );
    }
}

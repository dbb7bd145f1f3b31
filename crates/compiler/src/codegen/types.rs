//! Type queries and coercion emission
//!
//! Maps [`TypeDescriptor`]s onto QBE base types, knows the numeric promotion
//! lattice (Integer <= Long <= Single <= Double), and emits the conversion
//! snippets between them. Conversions across the string/numeric boundary are
//! rejected: those must be explicit in the source, so a request here is an
//! internal invariant violation.

use crate::symbols::{BaseType, SymbolTable, TypeDescriptor};

use super::qbe::QbeBuilder;
use super::CodeGenError;

#[derive(Clone, Copy)]
pub struct TypeManager<'a> {
    pub symbols: &'a SymbolTable,
}

impl<'a> TypeManager<'a> {
    /// QBE base type letter for a descriptor. Strings, arrays, records and
    /// pointers are all `l` (a pointer-sized value).
    pub fn qbe_type(&self, ty: &TypeDescriptor) -> char {
        if ty.is_array || ty.is_pointer || ty.is_byref {
            return 'l';
        }
        match ty.base_type() {
            BaseType::Integer => 'w',
            BaseType::Long => 'l',
            BaseType::Single => 's',
            BaseType::Double => 'd',
            BaseType::AsciiString | BaseType::Utf32String | BaseType::UserDefined => 'l',
            BaseType::Void => 'w',
        }
    }

    /// Return-type letter; `None` for SUBs.
    pub fn qbe_return_type(&self, ty: &TypeDescriptor) -> Option<char> {
        if ty.base_type() == BaseType::Void {
            None
        } else {
            Some(self.qbe_type(ty))
        }
    }

    /// In-memory size of one value of this type.
    pub fn size_of(&self, ty: &TypeDescriptor) -> Result<u64, CodeGenError> {
        if ty.is_array || ty.is_pointer || ty.is_byref {
            return Ok(8);
        }
        let size = match ty.base_type() {
            BaseType::Integer | BaseType::Single => 4,
            BaseType::Long | BaseType::Double => 8,
            BaseType::AsciiString | BaseType::Utf32String => 8,
            BaseType::UserDefined => {
                let sym = self.symbols.type_by_id(ty.udt_id).ok_or_else(|| {
                    CodeGenError::Logic(format!("unknown TYPE id {}", ty.udt_id))
                })?;
                sym.size
            }
            BaseType::Void => {
                return Err(CodeGenError::Logic("void value has no size".to_string()));
            }
        };
        Ok(size)
    }

    pub fn align_of(&self, ty: &TypeDescriptor) -> u32 {
        match self.qbe_type(ty) {
            'w' | 's' => 4,
            _ => 8,
        }
    }

    /// Numeric promotion; both operands must sit on the numeric lattice or
    /// both be strings (strings unify to UTF-32 when mixed).
    pub fn promote(
        &self,
        a: &TypeDescriptor,
        b: &TypeDescriptor,
    ) -> Result<TypeDescriptor, CodeGenError> {
        if a.is_string() && b.is_string() {
            let base = if a.base_type() == BaseType::AsciiString
                && b.base_type() == BaseType::AsciiString
            {
                BaseType::AsciiString
            } else {
                BaseType::Utf32String
            };
            return Ok(TypeDescriptor::scalar(base));
        }
        if a.is_numeric() && b.is_numeric() {
            return Ok(TypeDescriptor::scalar(crate::semantics::promote(
                a.base_type(),
                b.base_type(),
            )));
        }
        Err(CodeGenError::Logic(format!(
            "no promotion between {:?} and {:?}",
            a.base_type(),
            b.base_type()
        )))
    }

    /// Emit the coercion of `value` from `from` to `to`, returning the
    /// resulting temp (or `value` unchanged when no conversion is needed).
    pub fn convert(
        &self,
        b: &mut QbeBuilder,
        value: String,
        from: &TypeDescriptor,
        to: &TypeDescriptor,
    ) -> Result<String, CodeGenError> {
        use BaseType::*;

        let from_base = from.base_type();
        let to_base = to.base_type();
        if from_base == to_base {
            return Ok(value);
        }
        // String encodings share a representation; the runtime promotes
        if from.is_string() && to.is_string() {
            return Ok(value);
        }

        let converted = match (from_base, to_base) {
            (Integer, Long) => b.convert("extsw", 'l', &value)?,
            (Long, Integer) => b.copy('w', &value)?,
            (Integer, Single) => b.convert("swtof", 's', &value)?,
            (Integer, Double) => b.convert("swtof", 'd', &value)?,
            (Long, Single) => b.convert("sltof", 's', &value)?,
            (Long, Double) => b.convert("sltof", 'd', &value)?,
            // Truncation toward zero, matching the BASIC conversion functions
            (Single, Integer) => b.convert("stosi", 'w', &value)?,
            (Single, Long) => b.convert("stosi", 'l', &value)?,
            (Double, Integer) => b.convert("dtosi", 'w', &value)?,
            (Double, Long) => b.convert("dtosi", 'l', &value)?,
            (Single, Double) => b.convert("exts", 'd', &value)?,
            (Double, Single) => b.convert("truncd", 's', &value)?,
            _ => {
                return Err(CodeGenError::Logic(format!(
                    "no conversion from {:?} to {:?}",
                    from_base, to_base
                )));
            }
        };
        Ok(converted)
    }

    /// Comparison opcode for the given operator name over a promoted type.
    pub fn cmp_op(&self, op: &str, ty: &TypeDescriptor) -> Result<String, CodeGenError> {
        let suffix = self.qbe_type(ty);
        let base = match (op, suffix) {
            ("eq", _) => "ceq",
            ("ne", _) => "cne",
            // Signed comparisons for integers, ordered for floats
            ("lt", 'w' | 'l') => "cslt",
            ("le", 'w' | 'l') => "csle",
            ("gt", 'w' | 'l') => "csgt",
            ("ge", 'w' | 'l') => "csge",
            ("lt", _) => "clt",
            ("le", _) => "cle",
            ("gt", _) => "cgt",
            ("ge", _) => "cge",
            _ => {
                return Err(CodeGenError::Logic(format!(
                    "unknown comparison {}",
                    op
                )));
            }
        };
        Ok(format!("{}{}", base, suffix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::SymbolTable;

    fn tm(symbols: &SymbolTable) -> TypeManager<'_> {
        TypeManager { symbols }
    }

    #[test]
    fn test_qbe_type_mapping() {
        let symbols = SymbolTable::new();
        let t = tm(&symbols);
        assert_eq!(t.qbe_type(&TypeDescriptor::scalar(BaseType::Integer)), 'w');
        assert_eq!(t.qbe_type(&TypeDescriptor::scalar(BaseType::Long)), 'l');
        assert_eq!(t.qbe_type(&TypeDescriptor::scalar(BaseType::Single)), 's');
        assert_eq!(t.qbe_type(&TypeDescriptor::scalar(BaseType::Double)), 'd');
        assert_eq!(
            t.qbe_type(&TypeDescriptor::scalar(BaseType::AsciiString)),
            'l'
        );
        assert_eq!(t.qbe_type(&TypeDescriptor::record(3)), 'l');
    }

    #[test]
    fn test_widening_conversion() {
        let symbols = SymbolTable::new();
        let t = tm(&symbols);
        let mut b = QbeBuilder::new();
        let out = t
            .convert(
                &mut b,
                "%t1".to_string(),
                &TypeDescriptor::scalar(BaseType::Integer),
                &TypeDescriptor::scalar(BaseType::Long),
            )
            .unwrap();
        assert!(b.buf.contains(&format!("{} =l extsw %t1", out)));
    }

    #[test]
    fn test_float_truncation_toward_zero() {
        let symbols = SymbolTable::new();
        let t = tm(&symbols);
        let mut b = QbeBuilder::new();
        let out = t
            .convert(
                &mut b,
                "%t1".to_string(),
                &TypeDescriptor::scalar(BaseType::Double),
                &TypeDescriptor::scalar(BaseType::Integer),
            )
            .unwrap();
        assert!(b.buf.contains(&format!("{} =w dtosi %t1", out)));
    }

    #[test]
    fn test_same_type_is_identity() {
        let symbols = SymbolTable::new();
        let t = tm(&symbols);
        let mut b = QbeBuilder::new();
        let out = t
            .convert(
                &mut b,
                "%t1".to_string(),
                &TypeDescriptor::scalar(BaseType::Double),
                &TypeDescriptor::scalar(BaseType::Double),
            )
            .unwrap();
        assert_eq!(out, "%t1");
        assert!(b.buf.is_empty());
    }

    #[test]
    fn test_string_numeric_boundary_rejected() {
        let symbols = SymbolTable::new();
        let t = tm(&symbols);
        let mut b = QbeBuilder::new();
        let res = t.convert(
            &mut b,
            "%t1".to_string(),
            &TypeDescriptor::scalar(BaseType::AsciiString),
            &TypeDescriptor::scalar(BaseType::Integer),
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_cmp_opcodes() {
        let symbols = SymbolTable::new();
        let t = tm(&symbols);
        let int = TypeDescriptor::scalar(BaseType::Integer);
        let dbl = TypeDescriptor::scalar(BaseType::Double);
        assert_eq!(t.cmp_op("lt", &int).unwrap(), "csltw");
        assert_eq!(t.cmp_op("ge", &dbl).unwrap(), "cged");
        assert_eq!(t.cmp_op("eq", &dbl).unwrap(), "ceqd");
    }
}

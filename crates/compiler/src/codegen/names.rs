//! BASIC name → IL name mangling
//!
//! Pure functions over the symbol table. Each declared name maps to a stable
//! IL identifier whose suffix encodes the declared type, so sigil-only
//! differences (`X%` vs `X#` vs `X$`) become three distinct slots. SUBs get
//! the `$sub_` prefix and FUNCTIONs the bare `$` prefix; the call emitter and
//! the definition emitter both go through [`proc_symbol`] so the two sides
//! cannot drift apart.

use crate::cfg::{BlockId, ControlFlowGraph};
use crate::symbols::{split_sigil, BaseType, TypeDescriptor};

/// Strip the sigil and normalize to an IL-safe identifier.
pub fn mangle(name: &str) -> String {
    let (stem, _) = split_sigil(name);
    stem.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Type suffix used to disambiguate sigil-typed names.
pub fn type_suffix(ty: &TypeDescriptor) -> String {
    match ty.base_type() {
        BaseType::Integer => "i32".to_string(),
        BaseType::Long => "i64".to_string(),
        BaseType::Single => "f32".to_string(),
        BaseType::Double => "f64".to_string(),
        BaseType::AsciiString | BaseType::Utf32String => "str".to_string(),
        BaseType::UserDefined => format!("udt{}", ty.udt_id),
        BaseType::Void => "void".to_string(),
    }
}

/// Scalar slot local to the current function.
pub fn local_scalar(name: &str, ty: &TypeDescriptor) -> String {
    format!("%var_{}_{}", mangle(name), type_suffix(ty))
}

/// Module-level scalar, stored in the data section.
pub fn global_scalar(name: &str, ty: &TypeDescriptor) -> String {
    format!("$var_{}_{}", mangle(name), type_suffix(ty))
}

/// Local array slot; the value is an ArrayDescriptor pointer.
pub fn local_array(name: &str, elem: &TypeDescriptor) -> String {
    format!("%arr_{}_{}", mangle(name), type_suffix(elem))
}

/// Module-level array descriptor slot.
pub fn global_array(name: &str, elem: &TypeDescriptor) -> String {
    format!("$arr_{}_{}", mangle(name), type_suffix(elem))
}

/// Incoming parameter temp, before it is spilled to its slot.
pub fn param_temp(name: &str, ty: &TypeDescriptor) -> String {
    format!("%p_{}_{}", mangle(name), type_suffix(ty))
}

/// Procedure symbol: `$sub_<name>` for SUBs, `$<name>` for FUNCTIONs.
/// Emitted CALLs must match emitted definitions, so this is the only place
/// that spells the prefix.
pub fn proc_symbol(name: &str, is_sub: bool) -> String {
    if is_sub {
        format!("sub_{}", mangle(name))
    } else {
        mangle(name)
    }
}

/// Block label: the entry and exit blocks get their fixed names, everything
/// else is `@block_N`.
pub fn block_label(cfg: &ControlFlowGraph<'_>, id: BlockId) -> String {
    if id == cfg.entry {
        "@entry".to_string()
    } else if id == cfg.exit {
        "@exit".to_string()
    } else {
        format!("@block_{}", id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sigil_variants_get_distinct_slots() {
        let int = TypeDescriptor::scalar(BaseType::Integer);
        let dbl = TypeDescriptor::scalar(BaseType::Double);
        let s = TypeDescriptor::scalar(BaseType::AsciiString);
        assert_eq!(local_scalar("x%", &int), "%var_x_i32");
        assert_eq!(local_scalar("x#", &dbl), "%var_x_f64");
        assert_eq!(local_scalar("x$", &s), "%var_x_str");
    }

    #[test]
    fn test_sub_prefix_discipline() {
        assert_eq!(proc_symbol("greet", true), "sub_greet");
        assert_eq!(proc_symbol("twice", false), "twice");
    }

    #[test]
    fn test_udt_suffix_carries_type_id() {
        let p = TypeDescriptor::record(4);
        assert_eq!(global_scalar("origin", &p), "$var_origin_udt4");
    }

    #[test]
    fn test_mangle_normalizes() {
        assert_eq!(mangle("Total$"), "total");
        assert_eq!(mangle("my_var%"), "my_var");
    }

    #[test]
    fn test_array_slots() {
        let int = TypeDescriptor::scalar(BaseType::Integer);
        assert_eq!(local_array("a%", &int), "%arr_a_i32");
        assert_eq!(global_array("a%", &int), "$arr_a_i32");
    }
}

//! Runtime library call surface
//!
//! A thin mapping from BASIC operations onto the external C runtime ABI
//! (`libbasicrt`). The emitter only knows call signatures, never the
//! implementations. Symbol names and the ArrayDescriptor byte layout are
//! both fixed ABI: changing either side breaks the other.

/// ArrayDescriptor field offsets in bytes. The runtime owns the layout; the
/// emitter computes element addresses against these constants.
///
/// elementSize lives at offset 40. Offset 24 is lowerBound2 — loading the
/// element size from there reads a bound instead and corrupts every address
/// computation, so keep these named.
pub mod desc {
    pub const DATA_PTR: u64 = 0;
    pub const LOWER_BOUND_1: u64 = 8;
    pub const UPPER_BOUND_1: u64 = 16;
    pub const LOWER_BOUND_2: u64 = 24;
    pub const UPPER_BOUND_2: u64 = 32;
    pub const ELEMENT_SIZE: u64 = 40;
    pub const DIMENSIONS: u64 = 48; // 32-bit
    pub const TYPE_SUFFIX: u64 = 56; // 32-bit
}

/// Element type tags stored in the descriptor's typeSuffix field. The
/// runtime uses the tag to release string elements on erase / shrink.
pub mod tag {
    pub const INT32: i64 = 0;
    pub const INT64: i64 = 1;
    pub const SINGLE: i64 = 2;
    pub const DOUBLE: i64 = 3;
    pub const STRING: i64 = 4;
    pub const RECORD: i64 = 5;
}

// I/O
pub const PRINT_INT: &str = "basic_print_int"; // (w)
pub const PRINT_LONG: &str = "basic_print_long"; // (l)
pub const PRINT_DOUBLE: &str = "basic_print_double"; // (d)
pub const PRINT_STRING: &str = "basic_print_string"; // (l)
pub const PRINT_NEWLINE: &str = "basic_print_newline"; // ()
pub const PRINT_TAB: &str = "basic_print_tab"; // ()
pub const INPUT_INT: &str = "basic_input_int"; // () -> w
pub const INPUT_LONG: &str = "basic_input_long"; // () -> l
pub const INPUT_DOUBLE: &str = "basic_input_double"; // () -> d
pub const INPUT_STRING: &str = "basic_input_string"; // () -> l

// Strings
pub const STRING_FROM_ASCII: &str = "basic_string_from_ascii"; // (l) -> l
pub const STRING_FROM_UTF32: &str = "basic_string_from_utf32"; // (l) -> l
pub const STRING_CONCAT: &str = "basic_string_concat"; // (l, l) -> l
pub const STRING_COMPARE: &str = "basic_string_compare"; // (l, l) -> w
pub const STRING_LEN: &str = "basic_string_len"; // (l) -> w
pub const STRING_SUBSTR: &str = "basic_string_substr"; // (l, w, w) -> l
#[allow(dead_code)] // part of the runtime ABI; emitted code manages temps via assign
pub const STRING_RELEASE: &str = "basic_string_release"; // (l)
/// Store with release of the previous value; self-assignment safe.
pub const STRING_ASSIGN: &str = "basic_string_assign"; // (l addr, l value)
pub const STRING_CHR: &str = "basic_string_chr"; // (w) -> l
pub const STRING_ASC: &str = "basic_string_asc"; // (l) -> w
pub const STRING_FROM_LONG: &str = "basic_string_from_long"; // (l) -> l
pub const STRING_FROM_DOUBLE: &str = "basic_string_from_double"; // (d) -> l
pub const STRING_VAL: &str = "basic_string_val"; // (l) -> d

// Arrays. Bounds arguments always come in pairs; rank-1 calls pass zeros
// for the second dimension.
pub const ARRAY_ALLOC: &str = "basic_array_alloc"; // (w esz, w dims, w tag, l lb1, l ub1, l lb2, l ub2) -> l
pub const ARRAY_ERASE: &str = "basic_array_erase"; // (l)
pub const ARRAY_REDIM: &str = "basic_array_redim"; // (l, w esz, w dims, w tag, l lb1, l ub1, l lb2, l ub2) -> l
pub const ARRAY_REDIM_PRESERVE: &str = "basic_array_redim_preserve"; // (l, w esz, w dims, w tag, l lb1, l ub1, l lb2, l ub2) -> l
pub const ARRAY_CHECK_1: &str = "basic_array_check1"; // (l, l)
pub const ARRAY_CHECK_2: &str = "basic_array_check2"; // (l, l, l)

// Exceptions. The save-state primitive is setjmp itself, called directly
// from generated IL: the saved state must belong to the IL frame, not to a
// C wrapper frame that is gone by the time the restore fires.
pub const EXCEPTION_PUSH: &str = "basic_exception_push"; // (l ctx)
pub const EXCEPTION_POP: &str = "basic_exception_pop"; // ()
pub const SAVE_STATE: &str = "setjmp"; // (l ctx) -> w; 0 initial, code on restore
pub const THROW: &str = "basic_throw"; // (w code, w line) noreturn
pub const RETHROW: &str = "basic_rethrow"; // () noreturn
pub const ERR: &str = "basic_err"; // () -> w
pub const ERL: &str = "basic_erl"; // () -> w

/// Size of the stack slot reserved for one ExceptionContext: a jmp_buf plus
/// runtime metadata. Must stay >= the runtime's struct size.
pub const EXCEPTION_CONTEXT_SIZE: u64 = 512;

// GOSUB return stack (fixed capacity; overflow is fatal in the runtime)
pub const GOSUB_PUSH: &str = "basic_gosub_push"; // (w block id)
pub const GOSUB_POP: &str = "basic_gosub_pop"; // () -> w

// DATA segment
pub const DATA_INIT: &str = "basic_data_init"; // (l seg, w count)
pub const READ_INT: &str = "basic_read_int"; // () -> w
pub const READ_LONG: &str = "basic_read_long"; // () -> l
pub const READ_DOUBLE: &str = "basic_read_double"; // () -> d
pub const READ_STRING: &str = "basic_read_string"; // () -> l
pub const RESTORE: &str = "basic_restore"; // (w index)

// Math
pub const POW: &str = "basic_pow"; // (d, d) -> d
pub const ABS_DOUBLE: &str = "basic_abs_d"; // (d) -> d
pub const ABS_LONG: &str = "basic_abs_l"; // (l) -> l
pub const SQRT: &str = "basic_sqrt"; // (d) -> d
pub const FLOOR: &str = "basic_floor"; // (d) -> d

/// END from inside a procedure: terminate the process.
pub const END: &str = "basic_end"; // () noreturn

/// Error codes the runtime raises; positive integers beyond these are free
/// for user THROW.
pub mod errcode {
    pub const ILLEGAL_FUNCTION_CALL: i32 = 5;
    pub const OVERFLOW: i32 = 6;
    pub const SUBSCRIPT_OUT_OF_RANGE: i32 = 9;
    pub const DIVISION_BY_ZERO: i32 = 11;
    pub const TYPE_MISMATCH: i32 = 13;
    pub const BAD_FILE_NUMBER: i32 = 52;
    pub const FILE_NOT_FOUND: i32 = 53;
    pub const DISK_FULL: i32 = 61;
    pub const INPUT_PAST_END: i32 = 62;
    pub const DISK_NOT_READY: i32 = 71;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_size_offset_is_40() {
        // Regression guard: offset 24 is lowerBound2, not the element size
        assert_eq!(desc::ELEMENT_SIZE, 40);
        assert_ne!(desc::ELEMENT_SIZE, desc::LOWER_BOUND_2);
    }

    #[test]
    fn test_descriptor_layout_is_dense() {
        assert_eq!(desc::DATA_PTR, 0);
        assert_eq!(desc::LOWER_BOUND_1, 8);
        assert_eq!(desc::UPPER_BOUND_1, 16);
        assert_eq!(desc::LOWER_BOUND_2, 24);
        assert_eq!(desc::UPPER_BOUND_2, 32);
        assert_eq!(desc::DIMENSIONS, 48);
        assert_eq!(desc::TYPE_SUFFIX, 56);
    }

    #[test]
    fn test_save_state_is_direct_setjmp() {
        // The primitive must be callable straight from generated IL
        assert_eq!(SAVE_STATE, "setjmp");
    }
}

//! Low-level QBE text emission
//!
//! [`QbeBuilder`] accumulates one function body and mints SSA temporaries and
//! labels. Temp and label counters are monotonic within a function and never
//! reused, which is what keeps every temp single-assignment; the emitter
//! resets the builder per function so output is deterministic.

use std::fmt::Write as _;

use super::CodeGenError;

/// Textual builder for one QBE function body.
#[derive(Debug, Default)]
pub struct QbeBuilder {
    pub buf: String,
    temp_counter: usize,
    label_counter: usize,
}

impl QbeBuilder {
    pub fn new() -> Self {
        QbeBuilder::default()
    }

    /// Mint a fresh SSA temporary (`%t1`, `%t2`, ...).
    pub fn fresh_temp(&mut self) -> String {
        self.temp_counter += 1;
        format!("%t{}", self.temp_counter)
    }

    /// Mint a fresh local label (`@prefix_1`, ...). These are emitter-internal
    /// sub-blocks (dispatch cascades); CFG blocks use `@block_N`.
    pub fn make_label(&mut self, prefix: &str) -> String {
        self.label_counter += 1;
        format!("@{}_{}", prefix, self.label_counter)
    }

    /// One indented instruction line.
    pub fn line(&mut self, text: &str) -> Result<(), CodeGenError> {
        writeln!(&mut self.buf, "\t{}", text)?;
        Ok(())
    }

    /// A block label line (unindented). `name` includes the `@`.
    pub fn label(&mut self, name: &str) -> Result<(), CodeGenError> {
        writeln!(&mut self.buf, "{}", name)?;
        Ok(())
    }

    // =========================================================================
    // Typed helpers
    // =========================================================================

    pub fn copy(&mut self, ty: char, value: &str) -> Result<String, CodeGenError> {
        let t = self.fresh_temp();
        self.line(&format!("{} ={} copy {}", t, ty, value))?;
        Ok(t)
    }

    pub fn binop(&mut self, op: &str, ty: char, a: &str, b: &str) -> Result<String, CodeGenError> {
        let t = self.fresh_temp();
        self.line(&format!("{} ={} {} {}, {}", t, ty, op, a, b))?;
        Ok(t)
    }

    pub fn neg(&mut self, ty: char, value: &str) -> Result<String, CodeGenError> {
        let t = self.fresh_temp();
        self.line(&format!("{} ={} neg {}", t, ty, value))?;
        Ok(t)
    }

    /// Comparison; `op` is the full opcode (`csltw`, `ceqd`, ...). Result is
    /// a raw 0/1 word.
    pub fn cmp(&mut self, op: &str, a: &str, b: &str) -> Result<String, CodeGenError> {
        let t = self.fresh_temp();
        self.line(&format!("{} =w {} {}, {}", t, op, a, b))?;
        Ok(t)
    }

    pub fn load(&mut self, ty: char, addr: &str) -> Result<String, CodeGenError> {
        let t = self.fresh_temp();
        self.line(&format!("{} ={} load{} {}", t, ty, ty, addr))?;
        Ok(t)
    }

    pub fn store(&mut self, ty: char, value: &str, addr: &str) -> Result<(), CodeGenError> {
        self.line(&format!("store{} {}, {}", ty, value, addr))
    }

    /// A conversion instruction (`extsw`, `dtosi`, `swtof`, ...).
    pub fn convert(&mut self, op: &str, to: char, value: &str) -> Result<String, CodeGenError> {
        let t = self.fresh_temp();
        self.line(&format!("{} ={} {} {}", t, to, op, value))?;
        Ok(t)
    }

    /// Stack slot; alignment 4 or 8 or 16.
    pub fn alloc(&mut self, align: u32, size: u64) -> Result<String, CodeGenError> {
        let t = self.fresh_temp();
        self.line(&format!("{} =l alloc{} {}", t, align, size))?;
        Ok(t)
    }

    /// Call with typed arguments; `ret` None for void calls.
    pub fn call(
        &mut self,
        ret: Option<char>,
        name: &str,
        args: &[(char, String)],
    ) -> Result<Option<String>, CodeGenError> {
        let arg_list: Vec<String> = args
            .iter()
            .map(|(ty, value)| format!("{} {}", ty, value))
            .collect();
        match ret {
            Some(ty) => {
                let t = self.fresh_temp();
                self.line(&format!(
                    "{} ={} call ${}({})",
                    t,
                    ty,
                    name,
                    arg_list.join(", ")
                ))?;
                Ok(Some(t))
            }
            None => {
                self.line(&format!("call ${}({})", name, arg_list.join(", ")))?;
                Ok(None)
            }
        }
    }

    // =========================================================================
    // Terminators
    // =========================================================================

    pub fn jmp(&mut self, target: &str) -> Result<(), CodeGenError> {
        self.line(&format!("jmp {}", target))
    }

    pub fn jnz(&mut self, cond: &str, on_true: &str, on_false: &str) -> Result<(), CodeGenError> {
        self.line(&format!("jnz {}, {}, {}", cond, on_true, on_false))
    }

    pub fn ret(&mut self, value: Option<&str>) -> Result<(), CodeGenError> {
        match value {
            Some(v) => self.line(&format!("ret {}", v)),
            None => self.line("ret"),
        }
    }

    /// Terminator after a noreturn runtime call (`basic_throw`, rethrow).
    pub fn hlt(&mut self) -> Result<(), CodeGenError> {
        self.line("hlt")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temps_are_monotonic_and_unique() {
        let mut b = QbeBuilder::new();
        let t1 = b.fresh_temp();
        let t2 = b.fresh_temp();
        assert_ne!(t1, t2);
        assert_eq!(t1, "%t1");
        assert_eq!(t2, "%t2");
    }

    #[test]
    fn test_basic_instructions() {
        let mut b = QbeBuilder::new();
        let v = b.copy('w', "5").unwrap();
        let s = b.binop("add", 'w', &v, "1").unwrap();
        b.store('w', &s, "%slot").unwrap();
        assert!(b.buf.contains("%t1 =w copy 5"));
        assert!(b.buf.contains("%t2 =w add %t1, 1"));
        assert!(b.buf.contains("storew %t2, %slot"));
    }

    #[test]
    fn test_call_forms() {
        let mut b = QbeBuilder::new();
        let r = b
            .call(Some('w'), "basic_err", &[])
            .unwrap()
            .unwrap();
        assert!(b.buf.contains(&format!("{} =w call $basic_err()", r)));
        b.call(None, "basic_print_newline", &[]).unwrap();
        assert!(b.buf.contains("call $basic_print_newline()"));
        b.call(
            None,
            "basic_print_int",
            &[('w', "%t9".to_string())],
        )
        .unwrap();
        assert!(b.buf.contains("call $basic_print_int(w %t9)"));
    }

    #[test]
    fn test_load_store_types() {
        let mut b = QbeBuilder::new();
        b.load('d', "$fp.0").unwrap();
        assert!(b.buf.contains("=d loadd $fp.0"));
        b.store('l', "0", "%slot").unwrap();
        assert!(b.buf.contains("storel 0, %slot"));
    }

    #[test]
    fn test_terminators() {
        let mut b = QbeBuilder::new();
        b.jnz("%c", "@block_1", "@block_2").unwrap();
        b.jmp("@exit").unwrap();
        b.ret(Some("0")).unwrap();
        b.hlt().unwrap();
        let text = &b.buf;
        assert!(text.contains("jnz %c, @block_1, @block_2"));
        assert!(text.contains("jmp @exit"));
        assert!(text.contains("ret 0"));
        assert!(text.contains("hlt"));
    }
}

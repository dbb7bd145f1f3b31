//! Abstract syntax tree for the BQ BASIC dialect
//!
//! The parser produces a [`Program`]: a flat statement sequence for the main
//! body plus one [`Procedure`] per SUB / FUNCTION / DEF FN. Structured
//! constructs own their nested statement lists; classical line-number control
//! flow is expressed through [`JumpTarget`]s resolved by the CFG builder.
//!
//! Statement and expression kinds are closed sum types; both the CFG builder
//! and the emitter dispatch over them with exhaustive matches.

use crate::symbols::DataValue;

/// Source position (1-based physical line / column).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourcePos {
    pub line: u32,
    pub column: u32,
}

impl SourcePos {
    pub fn new(line: u32, column: u32) -> Self {
        SourcePos { line, column }
    }
}

/// A statement together with its position and, when it opens a numbered
/// program line, that BASIC line number (GOTO landing zones key off it).
#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub pos: SourcePos,
    pub basic_line: Option<u32>,
}

impl Stmt {
    pub fn new(kind: StmtKind, pos: SourcePos) -> Self {
        Stmt {
            kind,
            pos,
            basic_line: None,
        }
    }
}

/// Destination of GOTO / GOSUB / RESTORE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JumpTarget {
    Line(u32),
    Label(String),
}

impl std::fmt::Display for JumpTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JumpTarget::Line(n) => write!(f, "{}", n),
            JumpTarget::Label(name) => write!(f, "{}", name),
        }
    }
}

/// Assignable places.
#[derive(Debug, Clone)]
pub enum LValue {
    /// Scalar variable (normalized name, sigil kept)
    Var(String),
    /// Array element
    Elem { name: String, indices: Vec<Expr> },
    /// Record field access, possibly chained
    Field { base: Box<LValue>, field: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    /// `/` — float division
    Div,
    /// `\` — integer division truncating toward zero
    IntDiv,
    Mod,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Xor,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    /// Bitwise complement (`NOT`); truth values are 0 / -1
    Not,
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub pos: SourcePos,
}

impl Expr {
    pub fn new(kind: ExprKind, pos: SourcePos) -> Self {
        Expr { kind, pos }
    }
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    IntLit(i64),
    FloatLit(f64),
    StringLit(String),
    /// Scalar variable or constant reference
    Var(String),
    /// `name(args)` — array indexing, user FUNCTION call, or builtin;
    /// disambiguated against the symbol table at emission time
    Call { name: String, args: Vec<Expr> },
    /// Record field read
    Field { base: Box<Expr>, field: String },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary { op: UnOp, operand: Box<Expr> },
}

/// Separator following a PRINT item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintSep {
    /// `;` — no spacing
    Semicolon,
    /// `,` — advance to the next tab stop
    Comma,
}

#[derive(Debug, Clone)]
pub struct PrintItem {
    pub expr: Expr,
    /// Separator after this item, if one was written
    pub sep: Option<PrintSep>,
}

/// One CASE test within a SELECT CASE arm.
#[derive(Debug, Clone)]
pub enum CaseTest {
    /// `CASE v`
    Value(Expr),
    /// `CASE lo TO hi`
    Range(Expr, Expr),
    /// `CASE IS <op> v`
    Relational(BinOp, Expr),
}

#[derive(Debug, Clone)]
pub struct CaseArm {
    pub tests: Vec<CaseTest>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct CatchClause {
    /// Numeric error codes this clause handles; empty means catch-all
    pub codes: Vec<Expr>,
    pub body: Vec<Stmt>,
    pub pos: SourcePos,
}

/// Pre- or post-condition polarity on DO loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoCond {
    While,
    Until,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    For,
    While,
    Do,
    Select,
    Sub,
    Function,
}

impl std::fmt::Display for ExitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExitKind::For => "FOR",
            ExitKind::While => "WHILE",
            ExitKind::Do => "DO",
            ExitKind::Select => "SELECT",
            ExitKind::Sub => "SUB",
            ExitKind::Function => "FUNCTION",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinueKind {
    For,
    While,
    Do,
}

impl std::fmt::Display for ContinueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContinueKind::For => "FOR",
            ContinueKind::While => "WHILE",
            ContinueKind::Do => "DO",
        };
        write!(f, "{}", s)
    }
}

/// Type annotation as written (`AS INTEGER`, `AS Point`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeName {
    Integer,
    Long,
    Single,
    Double,
    Str,
    User(String),
}

/// One declaration in a DIM statement.
#[derive(Debug, Clone)]
pub struct DimDecl {
    pub name: String,
    pub ty: Option<TypeName>,
    /// (lower, upper) bound expressions; lower `None` means OPTION BASE
    pub bounds: Vec<(Option<Expr>, Expr)>,
    /// `DIM a$()` — dynamic array, allocated by a later REDIM
    pub dynamic: bool,
}

#[derive(Debug, Clone)]
pub enum OptionSetting {
    Base(i64),
    Explicit,
    StringAscii,
    StringUnicode,
    StringDetect,
    Bitwise,
    Logical,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    /// Jump label definition (`name:` at line start)
    Label(String),
    Let { target: LValue, value: Expr },
    Print {
        items: Vec<PrintItem>,
        /// True when the list ends in `;` or `,`: suppress the newline
        no_newline: bool,
    },
    Input {
        prompt: Option<String>,
        targets: Vec<LValue>,
    },
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        elseifs: Vec<(Expr, Vec<Stmt>)>,
        else_body: Option<Vec<Stmt>>,
    },
    Select {
        selector: Expr,
        arms: Vec<CaseArm>,
        else_body: Option<Vec<Stmt>>,
    },
    For {
        var: String,
        start: Expr,
        end: Expr,
        step: Option<Expr>,
        body: Vec<Stmt>,
    },
    While { cond: Expr, body: Vec<Stmt> },
    Repeat { body: Vec<Stmt>, until: Expr },
    Do {
        pre: Option<(DoCond, Expr)>,
        post: Option<(DoCond, Expr)>,
        body: Vec<Stmt>,
    },
    Exit(ExitKind),
    Continue(ContinueKind),
    Goto(JumpTarget),
    Gosub(JumpTarget),
    /// GOSUB return
    Return,
    OnGoto {
        selector: Expr,
        targets: Vec<JumpTarget>,
    },
    OnGosub {
        selector: Expr,
        targets: Vec<JumpTarget>,
    },
    OnCall {
        selector: Expr,
        targets: Vec<String>,
    },
    /// SUB invocation (with or without the CALL keyword)
    Call { name: String, args: Vec<Expr> },
    Try {
        body: Vec<Stmt>,
        catches: Vec<CatchClause>,
        finally: Option<Vec<Stmt>>,
    },
    Throw(Expr),
    Dim(Vec<DimDecl>),
    Redim {
        preserve: bool,
        name: String,
        bounds: Vec<(Option<Expr>, Expr)>,
    },
    Erase(Vec<String>),
    Data(Vec<DataValue>),
    Read(Vec<LValue>),
    Restore(Option<JumpTarget>),
    Swap(LValue, LValue),
    Inc(LValue, Option<Expr>),
    Dec(LValue, Option<Expr>),
    Const { name: String, value: Expr },
    TypeDecl {
        name: String,
        fields: Vec<(String, TypeName)>,
    },
    Option(OptionSetting),
    /// END — terminate the program
    End,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcedureKind {
    Sub,
    Function,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub ty: Option<TypeName>,
    pub by_ref: bool,
}

#[derive(Debug, Clone)]
pub struct Procedure {
    pub name: String,
    pub kind: ProcedureKind,
    pub params: Vec<Param>,
    /// FUNCTION result annotation; `None` falls back to sigil / default
    pub return_type: Option<TypeName>,
    pub body: Vec<Stmt>,
    pub pos: SourcePos,
}

/// A parsed program: main body plus procedure definitions.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub body: Vec<Stmt>,
    pub procedures: Vec<Procedure>,
}

impl Program {
    pub fn find_procedure(&self, name: &str) -> Option<&Procedure> {
        let lower = name.to_ascii_lowercase();
        self.procedures.iter().find(|p| p.name == lower)
    }
}

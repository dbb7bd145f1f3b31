//! Control flow graph data model
//!
//! Blocks live in an arena (`Vec<BasicBlock>` indexed by [`BlockId`]) owned by
//! the per-procedure [`ControlFlowGraph`]; edges refer to blocks by id only,
//! so loops are plain back-edges with no ownership cycles. Blocks hold
//! non-owning references into the parser's AST, which outlives the CFG.
//!
//! Edges are the single source of truth for control flow. Block numbering and
//! the order blocks were allocated in carry no semantic meaning; the emitter
//! derives every terminator from the typed out-edges.

pub mod builder;

pub use builder::build;

use std::collections::HashMap;
use thiserror::Error;

use crate::ast::{Expr, Stmt};

pub type BlockId = usize;

/// Structural errors detected while wiring the graph.
#[derive(Debug, Error)]
pub enum CfgError {
    #[error("line {line}: undefined GOTO/GOSUB target {target}")]
    UndefinedTarget { target: String, line: u32 },

    #[error("line {line}: EXIT {kind} outside of a matching construct")]
    ExitOutside { kind: String, line: u32 },

    #[error("line {line}: CONTINUE {kind} outside of a matching loop")]
    ContinueOutside { kind: String, line: u32 },

    #[error("line {line}: TRY has neither CATCH nor FINALLY")]
    TryWithoutHandlers { line: u32 },

    #[error("line {line}: THROW requires a numeric error code")]
    ThrowNotNumeric { line: u32 },
}

/// Edge classification. `Case(n)` carries the 1-based dispatch position for
/// SELECT CASE arms and ON GOTO / ON GOSUB / ON CALL targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Sequential,
    CondTrue,
    CondFalse,
    Jump,
    Call,
    Return,
    ExceptionDispatch,
    Case(usize),
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CfgEdge {
    pub from: BlockId,
    pub to: BlockId,
    pub kind: EdgeKind,
}

/// What a block carries for emission. Ordinary statements are `Stmt`;
/// the remaining variants are synthetic payloads the builder attaches when it
/// decomposes structured constructs into blocks.
#[derive(Debug, Clone, Copy)]
pub enum BlockItem<'a> {
    /// A source statement, emitted in order
    Stmt(&'a Stmt),
    /// FOR: `var = start`
    ForInit(&'a Stmt),
    /// FOR: bound test; conditional terminator payload
    ForTest(&'a Stmt),
    /// FOR: `var = var + step`
    ForStep(&'a Stmt),
    /// Conditional terminator payload (IF / WHILE / UNTIL / DO)
    Cond(&'a Expr),
    /// Multi-way terminator payload (SELECT CASE / ON GOTO / ON GOSUB / ON CALL)
    Dispatch(&'a Stmt),
    /// Push a GOSUB return id before the jump edge transfers control
    GosubPush { return_block: BlockId },
    /// RETURN: pop a return id and dispatch over the recorded return blocks
    GosubReturn,
    /// ON CALL trampoline body: invoke one SUB
    CallSub(&'a str),
    /// Balance the runtime exception-context stack
    ExceptionPop,
}

/// A maximal straight-line run of statements ending at a control transfer.
#[derive(Debug, Clone, Default)]
pub struct BasicBlock<'a> {
    pub id: BlockId,
    /// Diagnostic label, when the block came from a named construct
    pub label: Option<String>,
    pub items: Vec<BlockItem<'a>>,
    /// Set when the last statement unconditionally transfers control;
    /// a terminated block accepts no further statements and sequential
    /// edges out of it are dropped.
    pub is_terminated: bool,
    pub is_loop_header: bool,
    pub is_try_setup: bool,
    pub is_exception_dispatch: bool,
    pub is_catch: bool,
    pub is_finally: bool,
    /// Index into [`ControlFlowGraph::try_structures`] for exception blocks
    pub try_index: Option<usize>,
    /// Position of this catch clause within its TRY
    pub catch_index: Option<usize>,
}

/// Per-procedure control flow graph.
#[derive(Debug, Default)]
pub struct ControlFlowGraph<'a> {
    pub name: String,
    pub entry: BlockId,
    pub exit: BlockId,
    pub blocks: Vec<BasicBlock<'a>>,
    pub edges: Vec<CfgEdge>,
    pub line_to_block: HashMap<u32, BlockId>,
    pub label_to_block: HashMap<String, BlockId>,
    pub try_structures: Vec<TryCatchBlocks<'a>>,
    /// Landing blocks control returns to after GOSUB / ON GOSUB, in
    /// creation order; the RETURN dispatch compares against these ids.
    pub gosub_return_blocks: Vec<BlockId>,
}

/// The per-TRY record: every block the construct decomposed into, plus the
/// originating statement for the emitter's clause list.
#[derive(Debug, Clone)]
pub struct TryCatchBlocks<'a> {
    pub setup: BlockId,
    pub body_entry: BlockId,
    pub dispatch: BlockId,
    pub catches: Vec<BlockId>,
    pub finally: Option<BlockId>,
    pub exit: BlockId,
    pub stmt: &'a Stmt,
}

impl<'a> ControlFlowGraph<'a> {
    pub fn new(name: impl Into<String>) -> Self {
        let mut graph = ControlFlowGraph {
            name: name.into(),
            ..Default::default()
        };
        graph.entry = graph.new_block(Some("entry"));
        graph.exit = graph.new_block(Some("exit"));
        graph
    }

    pub fn new_block(&mut self, label: Option<&str>) -> BlockId {
        let id = self.blocks.len();
        self.blocks.push(BasicBlock {
            id,
            label: label.map(|s| s.to_string()),
            ..Default::default()
        });
        id
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock<'a> {
        &self.blocks[id]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock<'a> {
        &mut self.blocks[id]
    }

    /// Append an item to a block. Terminated blocks receive no further
    /// statements.
    pub fn push_item(&mut self, id: BlockId, item: BlockItem<'a>) {
        if !self.blocks[id].is_terminated {
            self.blocks[id].items.push(item);
        }
    }

    /// Add a typed edge. A sequential edge out of a terminated block is a
    /// no-op; everything else is recorded as given.
    pub fn add_edge(&mut self, from: BlockId, to: BlockId, kind: EdgeKind) {
        if kind == EdgeKind::Sequential && self.blocks[from].is_terminated {
            return;
        }
        self.edges.push(CfgEdge { from, to, kind });
    }

    pub fn out_edges(&self, id: BlockId) -> Vec<CfgEdge> {
        self.edges.iter().copied().filter(|e| e.from == id).collect()
    }

    pub fn terminate(&mut self, id: BlockId) {
        self.blocks[id].is_terminated = true;
    }

    /// Reachability from the entry block over every edge kind, in BFS
    /// discovery order (deterministic: edges are scanned in insertion order).
    pub fn reachable_order(&self) -> Vec<BlockId> {
        let mut seen = vec![false; self.blocks.len()];
        let mut order = Vec::new();
        let mut queue = std::collections::VecDeque::new();
        seen[self.entry] = true;
        queue.push_back(self.entry);
        while let Some(id) = queue.pop_front() {
            order.push(id);
            for edge in self.edges.iter().filter(|e| e.from == id) {
                if !seen[edge.to] {
                    seen[edge.to] = true;
                    queue.push_back(edge.to);
                }
            }
        }
        order
    }

    pub fn reachable_set(&self) -> Vec<bool> {
        let mut seen = vec![false; self.blocks.len()];
        for id in self.reachable_order() {
            seen[id] = true;
        }
        seen
    }
}

/// The whole program: one graph for the main body plus one per procedure.
#[derive(Debug, Default)]
pub struct ProgramCfg<'a> {
    pub main: ControlFlowGraph<'a>,
    pub procedures: Vec<ControlFlowGraph<'a>>,
    /// Informational notes (unreachable blocks and the like)
    pub warnings: Vec<String>,
}

//! Single-pass recursive CFG construction
//!
//! One entry point processes a statement range and returns the block where
//! the next statement should connect. Enclosing-construct state is threaded
//! as context *parameters* — `LoopContext` / `SelectContext` / `TryContext`
//! records linked through `outer` pointers — never as builder-level mutable
//! stacks. The host call stack is the context stack: when a construct's
//! builder returns, its context is gone.
//!
//! Every construct wires all of its internal edges eagerly before returning,
//! including loop back-edges, so the graph is complete the moment the walk
//! finishes. A jump-target prescan pre-allocates landing blocks for every
//! line number / label named by a GOTO-family statement, which is what lets
//! a jump into the middle of a structured construct find its block.

use std::collections::{HashSet, VecDeque};

use crate::ast::*;
use crate::symbols::SymbolTable;

use super::{
    BlockId, BlockItem, CfgError, ControlFlowGraph, EdgeKind, ProgramCfg, TryCatchBlocks,
};

/// Build the program CFG: one graph for the main body, one per procedure.
pub fn build<'a>(
    program: &'a Program,
    symbols: &'a SymbolTable,
) -> Result<ProgramCfg<'a>, CfgError> {
    let main = build_graph("main", &program.body, GraphScope::Main, symbols)?;
    let mut procedures = Vec::new();
    for proc in &program.procedures {
        let scope = match proc.kind {
            ProcedureKind::Sub => GraphScope::Sub,
            ProcedureKind::Function => GraphScope::Function,
        };
        procedures.push(build_graph(&proc.name, &proc.body, scope, symbols)?);
    }

    let mut warnings = Vec::new();
    for graph in std::iter::once(&main).chain(procedures.iter()) {
        // Exception-dispatch blocks are runtime-reachable roots: whatever
        // hangs off them (catch bodies) is not dead code.
        let mut reachable = graph.reachable_set();
        let mut queue: VecDeque<BlockId> = graph
            .blocks
            .iter()
            .filter(|b| b.is_exception_dispatch)
            .map(|b| b.id)
            .collect();
        for &id in &queue {
            reachable[id] = true;
        }
        while let Some(id) = queue.pop_front() {
            for edge in graph.edges.iter().filter(|e| e.from == id) {
                if !reachable[edge.to] {
                    reachable[edge.to] = true;
                    queue.push_back(edge.to);
                }
            }
        }
        for block in &graph.blocks {
            if !reachable[block.id] && !block.items.is_empty() {
                warnings.push(format!(
                    "{}: block {} is unreachable from the entry",
                    graph.name, block.id
                ));
            }
        }
    }

    Ok(ProgramCfg {
        main,
        procedures,
        warnings,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GraphScope {
    Main,
    Sub,
    Function,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopKind {
    For,
    While,
    /// DO / LOOP and REPEAT / UNTIL both answer to EXIT DO / CONTINUE DO
    Do,
}

#[derive(Clone, Copy)]
struct LoopContext<'c> {
    kind: LoopKind,
    continue_target: BlockId,
    exit: BlockId,
    outer: Option<&'c LoopContext<'c>>,
}

#[derive(Clone, Copy)]
struct SelectContext<'c> {
    exit: BlockId,
    outer: Option<&'c SelectContext<'c>>,
}

#[derive(Clone, Copy)]
struct TryContext<'c> {
    #[allow(dead_code)] // nesting depth is what matters; dispatch is runtime-routed
    dispatch: BlockId,
    outer: Option<&'c TryContext<'c>>,
}

/// The threaded context: one linked stack per construct family.
#[derive(Clone, Copy, Default)]
struct Ctx<'c> {
    loop_: Option<&'c LoopContext<'c>>,
    select: Option<&'c SelectContext<'c>>,
    try_: Option<&'c TryContext<'c>>,
}

struct Builder<'a> {
    graph: ControlFlowGraph<'a>,
    symbols: &'a SymbolTable,
    scope: GraphScope,
    /// Blocks holding a RETURN; wired to every GOSUB landing after the walk
    return_blocks: Vec<BlockId>,
}

fn build_graph<'a>(
    name: &str,
    stmts: &'a [Stmt],
    scope: GraphScope,
    symbols: &'a SymbolTable,
) -> Result<ControlFlowGraph<'a>, CfgError> {
    let mut builder = Builder {
        graph: ControlFlowGraph::new(name),
        symbols,
        scope,
        return_blocks: Vec::new(),
    };
    builder.prescan(stmts)?;

    let entry = builder.graph.entry;
    let last = builder.process_range(stmts, entry, Ctx::default())?;
    let exit = builder.graph.exit;
    builder.graph.add_edge(last, exit, EdgeKind::Sequential);

    // Return edges: every RETURN can transfer to every recorded landing
    let landings = builder.graph.gosub_return_blocks.clone();
    for &ret in &builder.return_blocks {
        for &landing in &landings {
            builder.graph.add_edge(ret, landing, EdgeKind::Return);
        }
    }
    Ok(builder.graph)
}

impl<'a> Builder<'a> {
    // =========================================================================
    // Jump-target prescan
    // =========================================================================

    /// Allocate a landing block for every line number / label that is named
    /// by a GOTO / GOSUB / ON GOTO / ON GOSUB anywhere in this range.
    fn prescan(&mut self, stmts: &'a [Stmt]) -> Result<(), CfgError> {
        let mut targets: Vec<(JumpTarget, u32)> = Vec::new();
        collect_targets(stmts, &mut targets);

        let mut lines = HashSet::new();
        let mut labels = HashSet::new();
        collect_defined(stmts, &mut lines, &mut labels);

        for (target, line) in targets {
            match target {
                JumpTarget::Line(n) => {
                    if !lines.contains(&n) {
                        return Err(CfgError::UndefinedTarget {
                            target: n.to_string(),
                            line,
                        });
                    }
                    if !self.graph.line_to_block.contains_key(&n) {
                        let id = self.graph.new_block(Some(&format!("line_{}", n)));
                        self.graph.line_to_block.insert(n, id);
                    }
                }
                JumpTarget::Label(name) => {
                    if !labels.contains(&name) {
                        return Err(CfgError::UndefinedTarget { target: name, line });
                    }
                    if !self.graph.label_to_block.contains_key(&name) {
                        let id = self.graph.new_block(Some(&format!("label_{}", name)));
                        self.graph.label_to_block.insert(name, id);
                    }
                }
            }
        }
        Ok(())
    }

    fn resolve_target(&self, target: &JumpTarget, line: u32) -> Result<BlockId, CfgError> {
        let found = match target {
            JumpTarget::Line(n) => self.graph.line_to_block.get(n).copied(),
            JumpTarget::Label(name) => self.graph.label_to_block.get(name).copied(),
        };
        found.ok_or_else(|| CfgError::UndefinedTarget {
            target: target.to_string(),
            line,
        })
    }

    // =========================================================================
    // Range processing
    // =========================================================================

    /// Process a statement range starting at `incoming`; returns the block
    /// the range falls out of.
    fn process_range(
        &mut self,
        stmts: &'a [Stmt],
        incoming: BlockId,
        ctx: Ctx<'_>,
    ) -> Result<BlockId, CfgError> {
        let mut current = incoming;
        for stmt in stmts {
            // Landing zone: jumps resolve to this pre-allocated block
            if let Some(line) = stmt.basic_line {
                if let Some(&landing) = self.graph.line_to_block.get(&line) {
                    self.graph.add_edge(current, landing, EdgeKind::Sequential);
                    current = landing;
                }
            }
            if let StmtKind::Label(name) = &stmt.kind {
                if let Some(&landing) = self.graph.label_to_block.get(name) {
                    self.graph.add_edge(current, landing, EdgeKind::Sequential);
                    current = landing;
                }
                continue;
            }
            current = self.process_stmt(stmt, current, ctx)?;
        }
        Ok(current)
    }

    /// After an unconditional transfer, syntactically-following statements
    /// land in a fresh block (unreachable unless something jumps to it).
    fn continuation(&mut self, current: BlockId) -> BlockId {
        if self.graph.block(current).is_terminated {
            self.graph.new_block(None)
        } else {
            current
        }
    }

    fn process_stmt(
        &mut self,
        stmt: &'a Stmt,
        current: BlockId,
        ctx: Ctx<'_>,
    ) -> Result<BlockId, CfgError> {
        let current = self.continuation(current);
        let line = stmt.pos.line;

        match &stmt.kind {
            // Handled during semantic analysis; nothing to emit
            StmtKind::Rem
            | StmtKind::Data(_)
            | StmtKind::Const { .. }
            | StmtKind::TypeDecl { .. }
            | StmtKind::Option(_)
            | StmtKind::Label(_) => Ok(current),

            // Straight-line statements accumulate in the current block
            StmtKind::Let { .. }
            | StmtKind::Print { .. }
            | StmtKind::Input { .. }
            | StmtKind::Call { .. }
            | StmtKind::Read(_)
            | StmtKind::Restore(_)
            | StmtKind::Swap(_, _)
            | StmtKind::Inc(_, _)
            | StmtKind::Dec(_, _)
            | StmtKind::Dim(_)
            | StmtKind::Redim { .. }
            | StmtKind::Erase(_) => {
                self.graph.push_item(current, BlockItem::Stmt(stmt));
                Ok(current)
            }

            StmtKind::If {
                cond,
                then_body,
                elseifs,
                else_body,
            } => self.build_if(stmt, cond, then_body, elseifs, else_body.as_deref(), current, ctx),

            StmtKind::While { cond, body } => self.build_while(cond, body, current, ctx),

            StmtKind::Repeat { body, until } => self.build_post_test(
                body,
                until,
                /* exit_on_true = */ true,
                current,
                ctx,
            ),

            StmtKind::Do { pre, post, body } => match (pre, post) {
                (Some((DoCond::While, cond)), _) => {
                    self.build_pre_test(cond, body, false, current, ctx)
                }
                (Some((DoCond::Until, cond)), _) => {
                    self.build_pre_test(cond, body, true, current, ctx)
                }
                (None, Some((DoCond::While, cond))) => {
                    self.build_post_test(body, cond, false, current, ctx)
                }
                (None, Some((DoCond::Until, cond))) => {
                    self.build_post_test(body, cond, true, current, ctx)
                }
                (None, None) => self.build_infinite_do(body, current, ctx),
            },

            StmtKind::For { body, .. } => self.build_for(stmt, body, current, ctx),

            StmtKind::Select {
                arms, else_body, ..
            } => self.build_select(stmt, arms, else_body.as_deref(), current, ctx),

            StmtKind::Try {
                body,
                catches,
                finally,
            } => self.build_try(stmt, body, catches, finally.as_deref(), current, ctx),

            StmtKind::Goto(target) => {
                let to = self.resolve_target(target, line)?;
                self.graph.add_edge(current, to, EdgeKind::Jump);
                self.graph.terminate(current);
                Ok(self.graph.new_block(None))
            }

            StmtKind::Gosub(target) => {
                let to = self.resolve_target(target, line)?;
                let landing = self.graph.new_block(Some("gosub_return"));
                self.graph.gosub_return_blocks.push(landing);
                self.graph.push_item(
                    current,
                    BlockItem::GosubPush {
                        return_block: landing,
                    },
                );
                self.graph.add_edge(current, to, EdgeKind::Call);
                self.graph.terminate(current);
                Ok(landing)
            }

            StmtKind::Return => {
                self.graph.push_item(current, BlockItem::GosubReturn);
                self.graph.terminate(current);
                self.return_blocks.push(current);
                Ok(self.graph.new_block(None))
            }

            StmtKind::OnGoto { targets, .. } => {
                self.graph.push_item(current, BlockItem::Dispatch(stmt));
                let after = self.graph.new_block(None);
                for (i, target) in targets.iter().enumerate() {
                    let to = self.resolve_target(target, line)?;
                    self.graph.add_edge(current, to, EdgeKind::Case(i + 1));
                }
                self.graph.add_edge(current, after, EdgeKind::Default);
                Ok(after)
            }

            StmtKind::OnGosub { targets, .. } => {
                self.graph.push_item(current, BlockItem::Dispatch(stmt));
                let after = self.graph.new_block(Some("on_gosub_return"));
                self.graph.gosub_return_blocks.push(after);
                for (i, target) in targets.iter().enumerate() {
                    let to = self.resolve_target(target, line)?;
                    let tramp = self.graph.new_block(Some("on_gosub_tramp"));
                    self.graph.push_item(
                        tramp,
                        BlockItem::GosubPush {
                            return_block: after,
                        },
                    );
                    self.graph.add_edge(current, tramp, EdgeKind::Case(i + 1));
                    self.graph.add_edge(tramp, to, EdgeKind::Jump);
                    self.graph.terminate(tramp);
                }
                self.graph.add_edge(current, after, EdgeKind::Default);
                Ok(after)
            }

            StmtKind::OnCall { targets, .. } => {
                self.graph.push_item(current, BlockItem::Dispatch(stmt));
                let after = self.graph.new_block(None);
                for (i, name) in targets.iter().enumerate() {
                    let tramp = self.graph.new_block(Some("on_call_tramp"));
                    self.graph.push_item(tramp, BlockItem::CallSub(name));
                    self.graph.add_edge(current, tramp, EdgeKind::Case(i + 1));
                    self.graph.add_edge(tramp, after, EdgeKind::Sequential);
                }
                self.graph.add_edge(current, after, EdgeKind::Default);
                Ok(after)
            }

            StmtKind::Exit(kind) => {
                let target = self.exit_target(*kind, ctx, line)?;
                self.graph.add_edge(current, target, EdgeKind::Jump);
                self.graph.terminate(current);
                Ok(self.graph.new_block(None))
            }

            StmtKind::Continue(kind) => {
                let target = self.continue_target(*kind, ctx, line)?;
                self.graph.add_edge(current, target, EdgeKind::Jump);
                self.graph.terminate(current);
                Ok(self.graph.new_block(None))
            }

            StmtKind::Throw(expr) => {
                if self.expr_is_string(expr) {
                    return Err(CfgError::ThrowNotNumeric { line });
                }
                self.graph.push_item(current, BlockItem::Stmt(stmt));
                self.graph.terminate(current);
                Ok(self.graph.new_block(None))
            }

            StmtKind::End => {
                if self.scope == GraphScope::Main {
                    let exit = self.graph.exit;
                    self.graph.add_edge(current, exit, EdgeKind::Jump);
                } else {
                    // Inside a procedure END terminates the process
                    self.graph.push_item(current, BlockItem::Stmt(stmt));
                }
                self.graph.terminate(current);
                Ok(self.graph.new_block(None))
            }
        }
    }

    // =========================================================================
    // Structured constructs
    // =========================================================================

    #[allow(clippy::too_many_arguments)]
    fn build_if(
        &mut self,
        _stmt: &'a Stmt,
        cond: &'a Expr,
        then_body: &'a [Stmt],
        elseifs: &'a [(Expr, Vec<Stmt>)],
        else_body: Option<&'a [Stmt]>,
        current: BlockId,
        ctx: Ctx<'_>,
    ) -> Result<BlockId, CfgError> {
        let merge = self.graph.new_block(Some("if_merge"));

        // Condition chain: the incoming block tests the IF condition; each
        // ELSEIF gets its own check block on the false path.
        let mut check = current;
        let mut conds: Vec<(&'a Expr, &'a [Stmt])> = Vec::with_capacity(1 + elseifs.len());
        conds.push((cond, then_body));
        for (c, body) in elseifs {
            conds.push((c, body.as_slice()));
        }

        for i in 0..conds.len() {
            let (c, body) = conds[i];
            self.graph.push_item(check, BlockItem::Cond(c));
            let then_entry = self.graph.new_block(Some("if_then"));
            self.graph.add_edge(check, then_entry, EdgeKind::CondTrue);

            let last = conds.len() - 1 == i;
            let false_target = if !last {
                self.graph.new_block(Some("elseif_check"))
            } else if else_body.is_some() {
                self.graph.new_block(Some("if_else"))
            } else {
                merge
            };
            self.graph.add_edge(check, false_target, EdgeKind::CondFalse);

            let then_exit = self.process_range(body, then_entry, ctx)?;
            self.graph.add_edge(then_exit, merge, EdgeKind::Sequential);

            if last {
                if let Some(else_stmts) = else_body {
                    let else_exit = self.process_range(else_stmts, false_target, ctx)?;
                    self.graph.add_edge(else_exit, merge, EdgeKind::Sequential);
                }
            } else {
                check = false_target;
            }
        }
        Ok(merge)
    }

    fn build_while(
        &mut self,
        cond: &'a Expr,
        body: &'a [Stmt],
        current: BlockId,
        ctx: Ctx<'_>,
    ) -> Result<BlockId, CfgError> {
        let header = self.graph.new_block(Some("while_head"));
        self.graph.block_mut(header).is_loop_header = true;
        self.graph.add_edge(current, header, EdgeKind::Sequential);
        self.graph.push_item(header, BlockItem::Cond(cond));

        let body_entry = self.graph.new_block(Some("while_body"));
        let exit = self.graph.new_block(Some("while_exit"));
        self.graph.add_edge(header, body_entry, EdgeKind::CondTrue);
        self.graph.add_edge(header, exit, EdgeKind::CondFalse);

        let lc = LoopContext {
            kind: LoopKind::While,
            continue_target: header,
            exit,
            outer: ctx.loop_,
        };
        let inner = Ctx {
            loop_: Some(&lc),
            ..ctx
        };
        let body_exit = self.process_range(body, body_entry, inner)?;
        // Back-edge wired immediately, not in a later phase
        self.graph.add_edge(body_exit, header, EdgeKind::Sequential);
        Ok(exit)
    }

    /// DO WHILE / DO UNTIL with the test at the top. `exit_on_true` flips
    /// the edge polarity for UNTIL.
    fn build_pre_test(
        &mut self,
        cond: &'a Expr,
        body: &'a [Stmt],
        exit_on_true: bool,
        current: BlockId,
        ctx: Ctx<'_>,
    ) -> Result<BlockId, CfgError> {
        let header = self.graph.new_block(Some("do_head"));
        self.graph.block_mut(header).is_loop_header = true;
        self.graph.add_edge(current, header, EdgeKind::Sequential);
        self.graph.push_item(header, BlockItem::Cond(cond));

        let body_entry = self.graph.new_block(Some("do_body"));
        let exit = self.graph.new_block(Some("do_exit"));
        if exit_on_true {
            self.graph.add_edge(header, exit, EdgeKind::CondTrue);
            self.graph.add_edge(header, body_entry, EdgeKind::CondFalse);
        } else {
            self.graph.add_edge(header, body_entry, EdgeKind::CondTrue);
            self.graph.add_edge(header, exit, EdgeKind::CondFalse);
        }

        let lc = LoopContext {
            kind: LoopKind::Do,
            continue_target: header,
            exit,
            outer: ctx.loop_,
        };
        let inner = Ctx {
            loop_: Some(&lc),
            ..ctx
        };
        let body_exit = self.process_range(body, body_entry, inner)?;
        self.graph.add_edge(body_exit, header, EdgeKind::Sequential);
        Ok(exit)
    }

    /// REPEAT ... UNTIL and DO ... LOOP WHILE / LOOP UNTIL: body first, test
    /// after. `exit_on_true` is the UNTIL polarity.
    fn build_post_test(
        &mut self,
        body: &'a [Stmt],
        cond: &'a Expr,
        exit_on_true: bool,
        current: BlockId,
        ctx: Ctx<'_>,
    ) -> Result<BlockId, CfgError> {
        let body_entry = self.graph.new_block(Some("repeat_body"));
        self.graph.block_mut(body_entry).is_loop_header = true;
        self.graph.add_edge(current, body_entry, EdgeKind::Sequential);

        let check = self.graph.new_block(Some("repeat_check"));
        let exit = self.graph.new_block(Some("repeat_exit"));

        let lc = LoopContext {
            kind: LoopKind::Do,
            continue_target: check,
            exit,
            outer: ctx.loop_,
        };
        let inner = Ctx {
            loop_: Some(&lc),
            ..ctx
        };
        let body_exit = self.process_range(body, body_entry, inner)?;
        self.graph.add_edge(body_exit, check, EdgeKind::Sequential);

        self.graph.push_item(check, BlockItem::Cond(cond));
        if exit_on_true {
            self.graph.add_edge(check, exit, EdgeKind::CondTrue);
            self.graph.add_edge(check, body_entry, EdgeKind::CondFalse);
        } else {
            self.graph.add_edge(check, body_entry, EdgeKind::CondTrue);
            self.graph.add_edge(check, exit, EdgeKind::CondFalse);
        }
        Ok(exit)
    }

    /// Bare DO ... LOOP: only EXIT DO (or a jump) leaves.
    fn build_infinite_do(
        &mut self,
        body: &'a [Stmt],
        current: BlockId,
        ctx: Ctx<'_>,
    ) -> Result<BlockId, CfgError> {
        let body_entry = self.graph.new_block(Some("do_body"));
        self.graph.block_mut(body_entry).is_loop_header = true;
        self.graph.add_edge(current, body_entry, EdgeKind::Sequential);
        let exit = self.graph.new_block(Some("do_exit"));

        let lc = LoopContext {
            kind: LoopKind::Do,
            continue_target: body_entry,
            exit,
            outer: ctx.loop_,
        };
        let inner = Ctx {
            loop_: Some(&lc),
            ..ctx
        };
        let body_exit = self.process_range(body, body_entry, inner)?;
        self.graph.add_edge(body_exit, body_entry, EdgeKind::Sequential);
        Ok(exit)
    }

    fn build_for(
        &mut self,
        stmt: &'a Stmt,
        body: &'a [Stmt],
        current: BlockId,
        ctx: Ctx<'_>,
    ) -> Result<BlockId, CfgError> {
        let init = self.graph.new_block(Some("for_init"));
        self.graph.add_edge(current, init, EdgeKind::Sequential);
        self.graph.push_item(init, BlockItem::ForInit(stmt));

        let check = self.graph.new_block(Some("for_check"));
        self.graph.block_mut(check).is_loop_header = true;
        self.graph.add_edge(init, check, EdgeKind::Sequential);
        self.graph.push_item(check, BlockItem::ForTest(stmt));

        let body_entry = self.graph.new_block(Some("for_body"));
        let increment = self.graph.new_block(Some("for_step"));
        let exit = self.graph.new_block(Some("for_exit"));
        self.graph.add_edge(check, body_entry, EdgeKind::CondTrue);
        self.graph.add_edge(check, exit, EdgeKind::CondFalse);

        let lc = LoopContext {
            kind: LoopKind::For,
            continue_target: increment,
            exit,
            outer: ctx.loop_,
        };
        let inner = Ctx {
            loop_: Some(&lc),
            ..ctx
        };
        let body_exit = self.process_range(body, body_entry, inner)?;
        self.graph.add_edge(body_exit, increment, EdgeKind::Sequential);

        self.graph.push_item(increment, BlockItem::ForStep(stmt));
        self.graph.add_edge(increment, check, EdgeKind::Sequential);
        Ok(exit)
    }

    fn build_select(
        &mut self,
        stmt: &'a Stmt,
        arms: &'a [CaseArm],
        else_body: Option<&'a [Stmt]>,
        current: BlockId,
        ctx: Ctx<'_>,
    ) -> Result<BlockId, CfgError> {
        let dispatch = self.graph.new_block(Some("select_dispatch"));
        self.graph.add_edge(current, dispatch, EdgeKind::Sequential);
        self.graph.push_item(dispatch, BlockItem::Dispatch(stmt));

        let merge = self.graph.new_block(Some("select_merge"));
        let sc = SelectContext {
            exit: merge,
            outer: ctx.select,
        };
        let inner = Ctx {
            select: Some(&sc),
            ..ctx
        };

        for (i, arm) in arms.iter().enumerate() {
            let entry = self.graph.new_block(Some(&format!("case_{}", i + 1)));
            self.graph.add_edge(dispatch, entry, EdgeKind::Case(i + 1));
            let arm_exit = self.process_range(&arm.body, entry, inner)?;
            // No fall-through between cases
            self.graph.add_edge(arm_exit, merge, EdgeKind::Sequential);
        }

        if let Some(body) = else_body {
            let entry = self.graph.new_block(Some("case_else"));
            self.graph.add_edge(dispatch, entry, EdgeKind::Default);
            let else_exit = self.process_range(body, entry, inner)?;
            self.graph.add_edge(else_exit, merge, EdgeKind::Sequential);
        } else {
            self.graph.add_edge(dispatch, merge, EdgeKind::Default);
        }
        Ok(merge)
    }

    fn build_try(
        &mut self,
        stmt: &'a Stmt,
        body: &'a [Stmt],
        catches: &'a [CatchClause],
        finally: Option<&'a [Stmt]>,
        current: BlockId,
        ctx: Ctx<'_>,
    ) -> Result<BlockId, CfgError> {
        if catches.is_empty() && finally.is_none() {
            return Err(CfgError::TryWithoutHandlers {
                line: stmt.pos.line,
            });
        }

        let try_index = self.graph.try_structures.len();

        let setup = self.graph.new_block(Some("try_setup"));
        self.graph.block_mut(setup).is_try_setup = true;
        self.graph.block_mut(setup).try_index = Some(try_index);
        self.graph.add_edge(current, setup, EdgeKind::Sequential);

        let body_entry = self.graph.new_block(Some("try_body"));
        self.graph.add_edge(setup, body_entry, EdgeKind::Sequential);

        // Reached exclusively through the runtime save-restore mechanism;
        // deliberately no CFG edge from the try body.
        let dispatch = self.graph.new_block(Some("try_dispatch"));
        self.graph.block_mut(dispatch).is_exception_dispatch = true;
        self.graph.block_mut(dispatch).try_index = Some(try_index);

        let exit = self.graph.new_block(Some("try_exit"));
        let finally_block = finally.map(|_| {
            let id = self.graph.new_block(Some("try_finally"));
            self.graph.block_mut(id).is_finally = true;
            id
        });
        let after_body = finally_block.unwrap_or(exit);

        // Reserve the slot so nested TRYs index correctly
        self.graph.try_structures.push(TryCatchBlocks {
            setup,
            body_entry,
            dispatch,
            catches: Vec::new(),
            finally: finally_block,
            exit,
            stmt,
        });

        let tc = TryContext {
            dispatch,
            outer: ctx.try_,
        };
        let inner = Ctx {
            try_: Some(&tc),
            ..ctx
        };
        let body_exit = self.process_range(body, body_entry, inner)?;
        // Normal completion balances the push from the setup block
        self.graph.push_item(body_exit, BlockItem::ExceptionPop);
        self.graph.add_edge(body_exit, after_body, EdgeKind::Sequential);

        // Catch bodies run with this TryContext cleared: a THROW inside a
        // CATCH propagates to the enclosing TRY.
        let mut catch_blocks = Vec::new();
        for (i, clause) in catches.iter().enumerate() {
            let entry = self.graph.new_block(Some(&format!("catch_{}", i + 1)));
            self.graph.block_mut(entry).is_catch = true;
            self.graph.block_mut(entry).try_index = Some(try_index);
            self.graph.block_mut(entry).catch_index = Some(i);
            self.graph.add_edge(dispatch, entry, EdgeKind::Case(i + 1));
            self.graph.push_item(entry, BlockItem::ExceptionPop);
            let catch_exit = self.process_range(&clause.body, entry, ctx)?;
            self.graph.add_edge(catch_exit, after_body, EdgeKind::Sequential);
            catch_blocks.push(entry);
        }
        self.graph.try_structures[try_index].catches = catch_blocks;

        if let (Some(fb), Some(fstmts)) = (finally_block, finally) {
            let finally_exit = self.process_range(fstmts, fb, ctx)?;
            self.graph.add_edge(finally_exit, exit, EdgeKind::Sequential);
        }
        Ok(exit)
    }

    // =========================================================================
    // EXIT / CONTINUE resolution
    // =========================================================================

    /// Nearest enclosing construct of the matching kind, found by walking
    /// the `outer` chain.
    fn exit_target(&self, kind: ExitKind, ctx: Ctx<'_>, line: u32) -> Result<BlockId, CfgError> {
        let wanted = match kind {
            ExitKind::For => Some(LoopKind::For),
            ExitKind::While => Some(LoopKind::While),
            ExitKind::Do => Some(LoopKind::Do),
            ExitKind::Select => None,
            ExitKind::Sub => {
                if self.scope != GraphScope::Sub {
                    return Err(CfgError::ExitOutside {
                        kind: kind.to_string(),
                        line,
                    });
                }
                return Ok(self.graph.exit);
            }
            ExitKind::Function => {
                if self.scope != GraphScope::Function {
                    return Err(CfgError::ExitOutside {
                        kind: kind.to_string(),
                        line,
                    });
                }
                return Ok(self.graph.exit);
            }
        };

        if let Some(wanted) = wanted {
            let mut cursor = ctx.loop_;
            while let Some(lc) = cursor {
                if lc.kind == wanted {
                    return Ok(lc.exit);
                }
                cursor = lc.outer;
            }
        } else {
            if let Some(sc) = ctx.select {
                return Ok(sc.exit);
            }
        }
        Err(CfgError::ExitOutside {
            kind: kind.to_string(),
            line,
        })
    }

    fn continue_target(
        &self,
        kind: ContinueKind,
        ctx: Ctx<'_>,
        line: u32,
    ) -> Result<BlockId, CfgError> {
        let wanted = match kind {
            ContinueKind::For => LoopKind::For,
            ContinueKind::While => LoopKind::While,
            ContinueKind::Do => LoopKind::Do,
        };
        let mut cursor = ctx.loop_;
        while let Some(lc) = cursor {
            if lc.kind == wanted {
                return Ok(lc.continue_target);
            }
            cursor = lc.outer;
        }
        Err(CfgError::ContinueOutside {
            kind: kind.to_string(),
            line,
        })
    }

    /// Shallow string-ness test for the THROW contract; full typing already
    /// happened in semantic analysis.
    fn expr_is_string(&self, expr: &Expr) -> bool {
        match &expr.kind {
            ExprKind::StringLit(_) => true,
            ExprKind::Var(name) => {
                if name.ends_with('$') {
                    return true;
                }
                self.symbols
                    .variables
                    .get(name)
                    .map(|v| v.ty.is_string())
                    .unwrap_or(false)
            }
            ExprKind::Binary { op: BinOp::Add, lhs, .. } => self.expr_is_string(lhs),
            ExprKind::Call { name, .. } => name.ends_with('$'),
            _ => false,
        }
    }
}

fn collect_targets(stmts: &[Stmt], out: &mut Vec<(JumpTarget, u32)>) {
    for stmt in stmts {
        let line = stmt.pos.line;
        match &stmt.kind {
            StmtKind::Goto(t) | StmtKind::Gosub(t) => out.push((t.clone(), line)),
            StmtKind::OnGoto { targets, .. } | StmtKind::OnGosub { targets, .. } => {
                for t in targets {
                    out.push((t.clone(), line));
                }
            }
            StmtKind::If {
                then_body,
                elseifs,
                else_body,
                ..
            } => {
                collect_targets(then_body, out);
                for (_, body) in elseifs {
                    collect_targets(body, out);
                }
                if let Some(body) = else_body {
                    collect_targets(body, out);
                }
            }
            StmtKind::Select {
                arms, else_body, ..
            } => {
                for arm in arms {
                    collect_targets(&arm.body, out);
                }
                if let Some(body) = else_body {
                    collect_targets(body, out);
                }
            }
            StmtKind::For { body, .. }
            | StmtKind::While { body, .. }
            | StmtKind::Repeat { body, .. }
            | StmtKind::Do { body, .. } => collect_targets(body, out),
            StmtKind::Try {
                body,
                catches,
                finally,
            } => {
                collect_targets(body, out);
                for clause in catches {
                    collect_targets(&clause.body, out);
                }
                if let Some(body) = finally {
                    collect_targets(body, out);
                }
            }
            _ => {}
        }
    }
}

fn collect_defined(stmts: &[Stmt], lines: &mut HashSet<u32>, labels: &mut HashSet<String>) {
    for stmt in stmts {
        if let Some(line) = stmt.basic_line {
            lines.insert(line);
        }
        match &stmt.kind {
            StmtKind::Label(name) => {
                labels.insert(name.clone());
            }
            StmtKind::If {
                then_body,
                elseifs,
                else_body,
                ..
            } => {
                collect_defined(then_body, lines, labels);
                for (_, body) in elseifs {
                    collect_defined(body, lines, labels);
                }
                if let Some(body) = else_body {
                    collect_defined(body, lines, labels);
                }
            }
            StmtKind::Select {
                arms, else_body, ..
            } => {
                for arm in arms {
                    collect_defined(&arm.body, lines, labels);
                }
                if let Some(body) = else_body {
                    collect_defined(body, lines, labels);
                }
            }
            StmtKind::For { body, .. }
            | StmtKind::While { body, .. }
            | StmtKind::Repeat { body, .. }
            | StmtKind::Do { body, .. } => collect_defined(body, lines, labels),
            StmtKind::Try {
                body,
                catches,
                finally,
            } => {
                collect_defined(body, lines, labels);
                for clause in catches {
                    collect_defined(&clause.body, lines, labels);
                }
                if let Some(body) = finally {
                    collect_defined(body, lines, labels);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerOptions;
    use crate::parser::Parser;
    use crate::semantics::analyze;

    fn build_program(source: &str) -> (Program, SymbolTable) {
        let program = Parser::new(source).unwrap().parse().unwrap();
        let table = analyze(&program, &CompilerOptions::default()).unwrap();
        (program, table)
    }

    fn edge_exists(g: &ControlFlowGraph<'_>, from: BlockId, to: BlockId, kind: EdgeKind) -> bool {
        g.edges
            .iter()
            .any(|e| e.from == from && e.to == to && e.kind == kind)
    }

    /// P1: every edge endpoint is a valid block id.
    fn assert_edges_well_formed(g: &ControlFlowGraph<'_>) {
        for edge in &g.edges {
            assert!(edge.from < g.blocks.len(), "dangling from in {:?}", edge);
            assert!(edge.to < g.blocks.len(), "dangling to in {:?}", edge);
        }
    }

    /// P4: conditional edges come in true/false pairs to distinct blocks.
    fn assert_conditional_duality(g: &ControlFlowGraph<'_>) {
        for block in &g.blocks {
            let outs = g.out_edges(block.id);
            let trues: Vec<_> = outs
                .iter()
                .filter(|e| e.kind == EdgeKind::CondTrue)
                .collect();
            let falses: Vec<_> = outs
                .iter()
                .filter(|e| e.kind == EdgeKind::CondFalse)
                .collect();
            assert_eq!(
                trues.len(),
                falses.len(),
                "block {} has unpaired conditional edges",
                block.id
            );
            if let (Some(t), Some(f)) = (trues.first(), falses.first()) {
                assert_ne!(t.to, f.to, "block {} true/false edges coincide", block.id);
            }
        }
    }

    /// P2: every reachable block without a THROW reaches the exit block.
    fn assert_exit_reachability(g: &ControlFlowGraph<'_>) {
        let reachable = g.reachable_set();
        // Reverse reachability from the exit
        let mut reaches_exit = vec![false; g.blocks.len()];
        reaches_exit[g.exit] = true;
        let mut changed = true;
        while changed {
            changed = false;
            for edge in &g.edges {
                if reaches_exit[edge.to] && !reaches_exit[edge.from] {
                    reaches_exit[edge.from] = true;
                    changed = true;
                }
            }
        }
        for block in &g.blocks {
            if reachable[block.id] && !block.is_terminated {
                assert!(
                    reaches_exit[block.id],
                    "reachable block {} cannot reach the exit",
                    block.id
                );
            }
        }
    }

    fn check_invariants(g: &ControlFlowGraph<'_>) {
        assert_edges_well_formed(g);
        assert_conditional_duality(g);
        assert_exit_reachability(g);
    }

    #[test]
    fn test_straight_line_program() {
        let (program, table) = build_program("PRINT 1\nPRINT 2");
        let cfg = build(&program, &table).unwrap();
        check_invariants(&cfg.main);
        assert_eq!(cfg.main.block(cfg.main.entry).items.len(), 2);
    }

    #[test]
    fn test_while_back_edge_immediate() {
        let (program, table) = build_program("WHILE x% < 3\nx% = x% + 1\nWEND\nPRINT 1");
        let cfg = build(&program, &table).unwrap();
        let g = &cfg.main;
        check_invariants(g);

        let header = g
            .blocks
            .iter()
            .find(|b| b.is_loop_header)
            .expect("loop header");
        // P5: the body exit loops straight back to the header
        let body = g
            .out_edges(header.id)
            .into_iter()
            .find(|e| e.kind == EdgeKind::CondTrue)
            .unwrap()
            .to;
        assert!(edge_exists(g, body, header.id, EdgeKind::Sequential));
    }

    #[test]
    fn test_for_has_five_block_shape() {
        let (program, table) = build_program("FOR i% = 1 TO 3\nPRINT i%\nNEXT");
        let cfg = build(&program, &table).unwrap();
        let g = &cfg.main;
        check_invariants(g);

        let check = g.blocks.iter().find(|b| b.is_loop_header).unwrap();
        assert!(matches!(check.items.last(), Some(BlockItem::ForTest(_))));
        // increment block flows back into the check
        let increment = g
            .edges
            .iter()
            .find(|e| e.to == check.id && e.kind == EdgeKind::Sequential && {
                matches!(g.block(e.from).items.last(), Some(BlockItem::ForStep(_)))
            })
            .expect("for increment back-edge");
        let _ = increment;
    }

    #[test]
    fn test_repeat_inside_else_terminates() {
        // The historically broken shape: REPEAT nested in an ELSE branch
        let (program, table) = build_program(
            "LET i% = 0\nIF i% = 0 THEN\nPRINT \"then\"\nELSE\nLET x% = 10\nREPEAT\nPRINT x%\nLET x% = x% + 1\nUNTIL x% > 12\nEND IF\nPRINT \"after\"",
        );
        let cfg = build(&program, &table).unwrap();
        let g = &cfg.main;
        check_invariants(g);

        // The repeat body is a loop header whose check has a false back-edge
        let body = g
            .blocks
            .iter()
            .find(|b| b.is_loop_header && b.label.as_deref() == Some("repeat_body"))
            .expect("repeat body");
        let back = g
            .edges
            .iter()
            .any(|e| e.to == body.id && e.kind == EdgeKind::CondFalse);
        assert!(back, "UNTIL false-edge must loop back to the body");
    }

    #[test]
    fn test_goto_landing_zone() {
        let (program, table) = build_program("10 PRINT 1\n20 GOTO 10");
        let cfg = build(&program, &table).unwrap();
        let g = &cfg.main;
        check_invariants(g);
        let landing = g.line_to_block[&10];
        // The GOTO block jumps to the landing
        assert!(g
            .edges
            .iter()
            .any(|e| e.to == landing && e.kind == EdgeKind::Jump));
    }

    #[test]
    fn test_goto_undefined_target() {
        let (program, table) = build_program("GOTO 999");
        let err = build(&program, &table).unwrap_err();
        assert!(matches!(err, CfgError::UndefinedTarget { .. }));
    }

    #[test]
    fn test_goto_into_loop_body() {
        // Jump into the middle of a structured construct
        let (program, table) =
            build_program("GOTO 30\nFOR i% = 1 TO 3\n30 PRINT i%\nNEXT");
        let cfg = build(&program, &table).unwrap();
        assert_edges_well_formed(&cfg.main);
        assert!(cfg.main.line_to_block.contains_key(&30));
    }

    #[test]
    fn test_exit_for_targets_nearest_for() {
        let (program, table) = build_program(
            "FOR i% = 1 TO 3\nWHILE x% < 2\nEXIT FOR\nWEND\nNEXT\nPRINT 1",
        );
        let cfg = build(&program, &table).unwrap();
        let g = &cfg.main;
        check_invariants(g);
        let for_exit = g
            .blocks
            .iter()
            .find(|b| b.label.as_deref() == Some("for_exit"))
            .unwrap();
        // some terminated block jumps straight to the FOR exit
        assert!(g
            .edges
            .iter()
            .any(|e| e.to == for_exit.id && e.kind == EdgeKind::Jump));
    }

    #[test]
    fn test_exit_outside_loop_fails() {
        let (program, table) = build_program("EXIT FOR");
        let err = build(&program, &table).unwrap_err();
        assert!(matches!(err, CfgError::ExitOutside { .. }));
    }

    #[test]
    fn test_select_case_edges() {
        let (program, table) = build_program(
            "SELECT CASE i%\nCASE 1\nPRINT 1\nCASE 2 TO 5\nPRINT 2\nCASE ELSE\nPRINT 3\nEND SELECT",
        );
        let cfg = build(&program, &table).unwrap();
        let g = &cfg.main;
        check_invariants(g);
        let dispatch = g
            .blocks
            .iter()
            .find(|b| b.label.as_deref() == Some("select_dispatch"))
            .unwrap();
        let outs = g.out_edges(dispatch.id);
        assert!(outs.iter().any(|e| e.kind == EdgeKind::Case(1)));
        assert!(outs.iter().any(|e| e.kind == EdgeKind::Case(2)));
        assert!(outs.iter().any(|e| e.kind == EdgeKind::Default));
    }

    #[test]
    fn test_select_without_else_defaults_to_merge() {
        let (program, table) =
            build_program("SELECT CASE i%\nCASE 1\nPRINT 1\nEND SELECT\nPRINT 2");
        let cfg = build(&program, &table).unwrap();
        let g = &cfg.main;
        let dispatch = g
            .blocks
            .iter()
            .find(|b| b.label.as_deref() == Some("select_dispatch"))
            .unwrap();
        let merge = g
            .blocks
            .iter()
            .find(|b| b.label.as_deref() == Some("select_merge"))
            .unwrap();
        assert!(edge_exists(g, dispatch.id, merge.id, EdgeKind::Default));
    }

    #[test]
    fn test_try_structure() {
        let (program, table) = build_program(
            "TRY\nTHROW 11\nCATCH 9, 11\nPRINT 1\nFINALLY\nPRINT 2\nEND TRY\nPRINT 3",
        );
        let cfg = build(&program, &table).unwrap();
        let g = &cfg.main;
        assert_edges_well_formed(g);
        assert_eq!(g.try_structures.len(), 1);
        let t = &g.try_structures[0];
        assert!(g.block(t.setup).is_try_setup);
        assert!(g.block(t.dispatch).is_exception_dispatch);
        assert_eq!(t.catches.len(), 1);
        assert!(g.block(t.catches[0]).is_catch);
        assert!(t.finally.is_some());

        // The dispatch block has no normal-flow predecessor
        assert!(!g.edges.iter().any(|e| e.to == t.dispatch));
        // Dispatch reaches each catch via a case edge
        assert!(edge_exists(g, t.dispatch, t.catches[0], EdgeKind::Case(1)));
        // Finally flows to the post-TRY exit
        assert!(edge_exists(
            g,
            t.finally.unwrap(),
            t.exit,
            EdgeKind::Sequential
        ));
    }

    #[test]
    fn test_try_without_handlers_fails() {
        let (program, table) = build_program("TRY\nPRINT 1\nEND TRY");
        let err = build(&program, &table).unwrap_err();
        assert!(matches!(err, CfgError::TryWithoutHandlers { .. }));
    }

    #[test]
    fn test_gosub_records_return_landing() {
        let (program, table) = build_program("GOSUB 100\nPRINT 2\nEND\n100 PRINT 1\nRETURN");
        let cfg = build(&program, &table).unwrap();
        let g = &cfg.main;
        assert_edges_well_formed(g);
        assert_eq!(g.gosub_return_blocks.len(), 1);
        // RETURN blocks connect back to the landing
        let landing = g.gosub_return_blocks[0];
        assert!(g
            .edges
            .iter()
            .any(|e| e.to == landing && e.kind == EdgeKind::Return));
    }

    #[test]
    fn test_on_gosub_trampolines() {
        let (program, table) =
            build_program("ON x% GOSUB 100, 200\nEND\n100 RETURN\n200 RETURN");
        let cfg = build(&program, &table).unwrap();
        let g = &cfg.main;
        assert_edges_well_formed(g);
        let tramps: Vec<_> = g
            .blocks
            .iter()
            .filter(|b| b.label.as_deref() == Some("on_gosub_tramp"))
            .collect();
        assert_eq!(tramps.len(), 2);
        for tramp in tramps {
            assert!(matches!(
                tramp.items.first(),
                Some(BlockItem::GosubPush { .. })
            ));
        }
    }

    #[test]
    fn test_on_call_fall_through_edge() {
        let (program, table) = build_program(
            "SUB A : PRINT \"a\" : END SUB\nSUB B : PRINT \"b\" : END SUB\nLET c% = 0\nON c% CALL A, B\nPRINT \"done\"",
        );
        let cfg = build(&program, &table).unwrap();
        let g = &cfg.main;
        check_invariants(g);
        let dispatch = g
            .blocks
            .iter()
            .find(|b| matches!(b.items.last(), Some(BlockItem::Dispatch(_))))
            .unwrap();
        // A default edge lets out-of-range selectors fall through
        assert!(g
            .out_edges(dispatch.id)
            .iter()
            .any(|e| e.kind == EdgeKind::Default));
    }

    #[test]
    fn test_unreachable_code_retained_with_warning() {
        let (program, table) = build_program("GOTO 20\nPRINT 1\n20 PRINT 2");
        // PRINT 1 sits in a fresh block nothing jumps to
        let cfg = build(&program, &table).unwrap();
        assert!(!cfg.warnings.is_empty());
    }

    #[test]
    fn test_throw_string_rejected_at_build() {
        // Semantic analysis catches this first in the normal pipeline, so
        // drive the builder directly with a hand-made table.
        let program = Parser::new("THROW \"nope\"").unwrap().parse().unwrap();
        let table = SymbolTable::new();
        let err = build(&program, &table).unwrap_err();
        assert!(matches!(err, CfgError::ThrowNotNumeric { .. }));
    }

    #[test]
    fn test_procedures_get_own_graphs() {
        let (program, table) = build_program(
            "PRINT 1\nSUB Greet\nPRINT \"hi\"\nEND SUB\nFUNCTION Twice(n%) AS INTEGER\nTwice = n% * 2\nEND FUNCTION",
        );
        let cfg = build(&program, &table).unwrap();
        assert_eq!(cfg.procedures.len(), 2);
        assert_eq!(cfg.procedures[0].name, "greet");
        assert_eq!(cfg.procedures[1].name, "twice");
        for g in &cfg.procedures {
            check_invariants(g);
        }
    }

    #[test]
    fn test_terminated_blocks_have_transfer_edges_only() {
        let (program, table) = build_program(
            "10 GOSUB 100\nGOTO 10\nEND\n100 PRINT 1\nRETURN",
        );
        let cfg = build(&program, &table).unwrap();
        for block in &cfg.main.blocks {
            let outs = cfg.main.out_edges(block.id);
            if block.is_terminated {
                // Transfer kinds only: jump, call, return, or nothing (throw)
                assert!(
                    outs.iter().all(|e| matches!(
                        e.kind,
                        EdgeKind::Jump | EdgeKind::Call | EdgeKind::Return
                    )),
                    "terminated block {} has a non-transfer edge",
                    block.id
                );
            } else {
                assert!(
                    outs.iter().all(|e| !matches!(e.kind, EdgeKind::Jump)),
                    "unterminated block {} has a jump edge",
                    block.id
                );
            }
        }
    }

    #[test]
    fn test_on_goto_default_edge_falls_through() {
        let (program, table) = build_program("ON x% GOTO 10, 20\nPRINT 0\n10 PRINT 1\n20 PRINT 2");
        let cfg = build(&program, &table).unwrap();
        let g = &cfg.main;
        assert_edges_well_formed(g);
        let dispatch = g
            .blocks
            .iter()
            .find(|b| matches!(b.items.last(), Some(BlockItem::Dispatch(_))))
            .unwrap();
        let outs = g.out_edges(dispatch.id);
        assert!(outs.iter().any(|e| e.kind == EdgeKind::Case(1)));
        assert!(outs.iter().any(|e| e.kind == EdgeKind::Case(2)));
        // Out-of-range selectors continue with the statement after ON GOTO
        let default = outs
            .iter()
            .find(|e| e.kind == EdgeKind::Default)
            .expect("default edge");
        assert!(!g.block(default.to).is_terminated);
    }

    #[test]
    fn test_deterministic_construction() {
        let source = "FOR i% = 1 TO 3\nIF i% = 2 THEN\nPRINT i%\nEND IF\nNEXT";
        let (p1, t1) = build_program(source);
        let (p2, t2) = build_program(source);
        let a = build(&p1, &t1).unwrap();
        let b = build(&p2, &t2).unwrap();
        assert_eq!(a.main.blocks.len(), b.main.blocks.len());
        assert_eq!(a.main.edges.len(), b.main.edges.len());
        for (x, y) in a.main.edges.iter().zip(b.main.edges.iter()) {
            assert_eq!(x, y);
        }
    }
}

//! The obfuscation fix passes.
//!
//! One [`FixObfuscation`] run drives a single function to a fixed point:
//! every iteration removes spuriously duplicated tail functions, patches
//! indirect jumps routed through pivoted stack slots, and normalizes
//! pop-derived stack-pointer adjustments; whenever anything changed, the
//! host re-lifts the function (which routes patched addresses through the
//! patch store's lift override) and the loop goes again. Once nothing
//! changes, a post-analysis round annotates every indirect branch whose
//! hidden two-way condition the SSA solver can recover.

use std::sync::Arc;
use std::time::Duration;

use crate::background::{CancellationToken, TaskThread};
use crate::il::Op;
use crate::log::*;
use crate::mlil::{MlilFunction, MlilOp};
use crate::patch::{Patch, PatchProgram};
use crate::ssa_trace;
use crate::store::PatchStore;
use crate::view::{
    ArchInfo, HighlightColor, ImageView, LlilFunctionInfo, Terminator, TerminatorDest,
    TerminatorKind,
};

/// Bound on fix-point iterations per function; reaching it means the
/// function keeps changing under us and we stop rather than loop forever.
pub const MAX_PASS_ITERATIONS: usize = 100;

/// How many consecutive stack slots a pivot probe examines.
pub const MAX_PIVOT_SLOTS: usize = 16;

/// Poll interval while waiting for the host's incremental re-analysis. The
/// host exposes no completion callback, only a pending flag.
const REANALYSIS_POLL: Duration = Duration::from_millis(20);

/// Slack around the function's instruction address range before a constant
/// call target counts as a likely disguised call.
const FAR_CALL_SLACK: u64 = 0x1000;

/// Where a fix-pass run currently is.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PassState {
    Pending,
    Analyzing,
    FixedPoint,
    Cancelled,
    PostAnalysis,
    Done,
}

/// How a fix-pass run ended.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PassOutcome {
    /// No sub-pass changed anything in the final iteration
    FixedPoint { iterations: usize, changes: usize },
    /// The cancellation token was set; patches committed so far remain in
    /// the store
    Cancelled,
    /// [`MAX_PASS_ITERATIONS`] iterations all made changes
    IterationLimit,
}

/// One fix-obfuscation run over one function.
pub struct FixObfuscation<'a> {
    view: &'a dyn ImageView,
    store: &'a PatchStore,
    /// Entry address of the function under repair
    function: u64,
    state: PassState,
}

impl<'a> FixObfuscation<'a> {
    pub fn new(view: &'a dyn ImageView, store: &'a PatchStore, function: u64) -> Self {
        Self {
            view,
            store,
            function,
            state: PassState::Pending,
        }
    }

    pub fn state(&self) -> PassState {
        self.state
    }

    fn transition(&mut self, next: PassState) {
        trace!(
            "Pass state";
            "function" => format!("{:#x}", self.function),
            "from" => format!("{:?}", self.state),
            "to" => format!("{:?}", next),
        );
        self.state = next;
    }

    /// Run the pass to completion (or cancellation).
    pub fn run(&mut self, cancel: &CancellationToken) -> PassOutcome {
        self.transition(PassState::Analyzing);

        let mut total_changes = 0;
        let mut iterations = 0;
        let outcome = loop {
            if cancel.is_cancelled() {
                break PassOutcome::Cancelled;
            }
            if iterations == MAX_PASS_ITERATIONS {
                break PassOutcome::IterationLimit;
            }
            iterations += 1;

            let Some(llil) = self.view.low_level_il(self.function) else {
                break PassOutcome::FixedPoint {
                    iterations,
                    changes: total_changes,
                };
            };

            let changes = self.eliminate_tail_duplicates(&llil)
                + self.patch_stack_pivots(&llil)
                + self.normalize_stack_adjustments(&llil);
            debug!(
                "Fix pass iteration";
                "function" => format!("{:#x}", self.function),
                "iteration" => iterations,
                "changes" => changes,
            );
            if changes == 0 {
                break PassOutcome::FixedPoint {
                    iterations,
                    changes: total_changes,
                };
            }
            total_changes += changes;
            self.wait_for_reanalysis();
        };

        let cancelled = outcome == PassOutcome::Cancelled;
        self.transition(if cancelled {
            PassState::Cancelled
        } else {
            PassState::FixedPoint
        });
        self.transition(PassState::PostAnalysis);
        if !cancelled {
            self.label_function();
        }
        self.transition(PassState::Done);

        info!(
            "Fix pass finished";
            "function" => format!("{:#x}", self.function),
            "outcome" => format!("{:?}", outcome),
        );
        outcome
    }

    /// Remove functions the disassembler was tricked into discovering at
    /// tail-call targets that are really continuations of this function.
    fn eliminate_tail_duplicates(&self, llil: &LlilFunctionInfo) -> usize {
        let mut changes = 0;
        for block in &llil.blocks {
            let term = &block.terminator;
            if !matches!(term.kind, TerminatorKind::TailCall | TerminatorKind::Jump) {
                continue;
            }
            let Some(dest) = term.dest_values.single_value() else {
                continue;
            };
            if dest == self.function || !self.view.function_exists(dest) {
                continue;
            }
            if !self.view.function_was_auto_discovered(dest) {
                continue;
            }
            if self
                .view
                .function_callers(dest)
                .iter()
                .any(|&caller| caller != self.function)
            {
                continue;
            }
            info!(
                "Removing duplicated tail function";
                "function" => format!("{:#x}", self.function),
                "duplicate" => format!("{:#x}", dest),
            );
            self.view.remove_function(dest);
            changes += 1;
        }
        changes
    }

    /// Patch terminators whose stack pointer was pivoted so that the
    /// return/jump reads forged targets from consecutive stack slots.
    fn patch_stack_pivots(&self, llil: &LlilFunctionInfo) -> usize {
        let arch = self.view.arch();
        let image = self.view.image();
        let mut changes = 0;
        for block in &llil.blocks {
            let term = &block.terminator;
            if !matches!(
                term.kind,
                TerminatorKind::Ret | TerminatorKind::Jump | TerminatorKind::TailCall
            ) {
                continue;
            }
            let Some(stack_offset) = term.stack_offset else {
                continue;
            };
            if self.store.get_patch(image, term.address).is_some() {
                continue;
            }
            let good_pops = self.count_executable_slots(term, stack_offset, &arch);
            if good_pops == 0 {
                continue;
            }
            debug!(
                "Patching stack-pivoted terminator";
                "function" => format!("{:#x}", self.function),
                "address" => format!("{:#x}", term.address),
                "good_pops" => good_pops,
            );
            let patch = build_pivot_patch(term, stack_offset, good_pops, &arch);
            self.store.add_patch(image, term.address, patch);
            changes += 1;
        }
        changes
    }

    /// Count the leading stack slots, starting at the terminator's known
    /// frame-relative offset, whose every possible content is executable.
    fn count_executable_slots(
        &self,
        term: &Terminator,
        stack_offset: i64,
        arch: &ArchInfo,
    ) -> usize {
        let mut good = 0;
        for slot in 0..MAX_PIVOT_SLOTS {
            let offset = stack_offset + (slot * arch.addr_size) as i64;
            let values = self
                .view
                .stack_contents_at(self.function, term.address, offset);
            let Some(values) = values.concrete_values() else {
                break;
            };
            if values.is_empty() || !values.iter().all(|&v| self.view.is_executable(v)) {
                break;
            }
            good += 1;
        }
        good
    }

    /// Replace pop-derived register assignments that implement a pivot with
    /// explicit recomputations of both registers from the frame.
    fn normalize_stack_adjustments(&self, llil: &LlilFunctionInfo) -> usize {
        let arch = self.view.arch();
        let image = self.view.image();
        let mut changes = 0;
        for site in &llil.pop_sites {
            let (Some(sp_before), Some(sp_after), Some(value_offset)) =
                (site.sp_before, site.sp_after, site.reg_value_offset)
            else {
                continue;
            };
            if arch.is_temp_reg(site.reg) {
                continue;
            }
            if self.store.get_patch(image, site.address).is_some() {
                continue;
            }
            let size = arch.addr_size;
            let mut p = PatchProgram::new();
            // The destination register first, while the stack pointer still
            // has its pre-pop value; then the stack pointer itself.
            p.operand(site.reg as u64);
            p.operand(arch.sp_reg as u64).instruction(Op::Reg, size, 0);
            p.operand((value_offset - sp_before) as u64)
                .instruction(Op::Const, size, 0);
            p.instruction(Op::Add, size, 0);
            p.instruction(Op::SetReg, size, 0);
            p.operand(arch.sp_reg as u64);
            p.operand(arch.sp_reg as u64).instruction(Op::Reg, size, 0);
            p.operand((sp_after - sp_before) as u64)
                .instruction(Op::Const, size, 0);
            p.instruction(Op::Add, size, 0);
            p.instruction(Op::SetReg, size, 0);

            debug!(
                "Normalizing pop-derived stack adjustment";
                "function" => format!("{:#x}", self.function),
                "address" => format!("{:#x}", site.address),
            );
            self.store.add_patch(image, site.address, p.into_patch(site.length));
            changes += 1;
        }
        changes
    }

    fn wait_for_reanalysis(&self) {
        self.view.begin_reanalysis(self.function);
        while self.view.analysis_pending(self.function) {
            std::thread::sleep(REANALYSIS_POLL);
        }
    }

    /// Annotate recovered branch conditions, frame-neutral terminators, and
    /// far calls.
    fn label_function(&self) {
        if let Some(mlil) = self.view.mlil_ssa(self.function) {
            for block in mlil.basic_blocks() {
                if block.len() <= 1 {
                    continue;
                }
                let last = *block.last().unwrap();
                let Some(cm) = ssa_trace::indirect_branch_condition(&mlil, last) else {
                    continue;
                };

                let site_addr = mlil.expr(mlil.instruction(last)).address;
                let cond_addr = mlil.expr(cm.condition).address;
                let branch_addr = mlil.expr(mlil.instruction(cm.branch)).address;

                self.view.set_comment(
                    self.function,
                    site_addr,
                    &format!("cond {} @ {:#x}", cm.branch, cond_addr),
                );
                self.view
                    .set_highlight(self.function, branch_addr, HighlightColor::Red);
                self.view
                    .set_highlight(self.function, cond_addr, HighlightColor::Orange);
                if let Some(addr) = constant_value_site(&mlil, cm.true_val) {
                    self.view
                        .set_highlight(self.function, addr, HighlightColor::Green);
                }
                if let Some(addr) = constant_value_site(&mlil, cm.false_val) {
                    self.view
                        .set_highlight(self.function, addr, HighlightColor::Yellow);
                }
            }
        }

        let Some(llil) = self.view.low_level_il(self.function) else {
            return;
        };
        for block in &llil.blocks {
            let term = &block.terminator;
            // A terminator whose stack pointer is exactly back at its entry
            // value is a candidate real return.
            if matches!(
                term.kind,
                TerminatorKind::Ret | TerminatorKind::Jump | TerminatorKind::TailCall
            ) && term.stack_offset == Some(0)
            {
                self.view
                    .set_highlight(self.function, term.address, HighlightColor::Cyan);
            }
        }
        let (start, end) = llil.address_range;
        for call in &llil.calls {
            let Some(target) = call.target else {
                continue;
            };
            if target < start.saturating_sub(FAR_CALL_SLACK)
                || target > end.saturating_add(FAR_CALL_SLACK)
            {
                self.view
                    .set_highlight(self.function, call.address, HighlightColor::Magenta);
            }
        }
    }
}

/// Build the replacement program for a stack-pivoted terminator: an optional
/// call through the (rebased) original destination, then one
/// pop-into-scratch plus branch-through-scratch pair per qualifying slot.
/// Every pair but the last calls, so control comes back for the next pop;
/// the last leaves for good with a jump.
fn build_pivot_patch(
    term: &Terminator,
    stack_offset: i64,
    good_pops: usize,
    arch: &ArchInfo,
) -> Patch {
    let size = arch.addr_size;
    let mut p = PatchProgram::new();

    match term.dest {
        TerminatorDest::StackLoad { frame_offset } => {
            // The destination is loaded through a constant offset from the
            // stack pointer; the synthesized IR can only name the live stack
            // pointer, so rebase the frame-relative offset onto it.
            let adjusted = frame_offset - stack_offset;
            p.operand(arch.sp_reg as u64).instruction(Op::Reg, size, 0);
            p.operand(adjusted as u64).instruction(Op::Const, size, 0);
            p.instruction(Op::Add, size, 0);
            p.instruction(Op::Load, size, 0);
            p.instruction(Op::Call, size, 0);
        }
        TerminatorDest::Register { reg } => {
            p.operand(reg as u64).instruction(Op::Reg, size, 0);
            p.instruction(Op::Call, size, 0);
        }
        TerminatorDest::Constant { value } => {
            p.operand(value).instruction(Op::ConstPtr, size, 0);
            p.instruction(Op::Call, size, 0);
        }
        TerminatorDest::None | TerminatorDest::Computed => {}
    }

    for slot in 0..good_pops {
        p.operand(arch.scratch_reg as u64);
        p.instruction(Op::Pop, size, 0);
        p.instruction(Op::SetReg, size, 0);
        p.operand(arch.scratch_reg as u64).instruction(Op::Reg, size, 0);
        let branch = if slot + 1 == good_pops {
            Op::Jump
        } else {
            Op::Call
        };
        p.instruction(branch, size, 0);
    }

    p.into_patch(term.length)
}

fn constant_value_site(mlil: &MlilFunction, instr: usize) -> Option<u64> {
    let expr = mlil.instruction(instr);
    let MlilOp::SetVarSsa { src, .. } = mlil.expr(expr).op else {
        return None;
    };
    match mlil.expr(src).op {
        MlilOp::Const { .. } | MlilOp::ConstPtr { .. } => Some(mlil.expr(expr).address),
        _ => None,
    }
}

/// Run a fix-obfuscation pass on a dedicated worker thread.
pub fn spawn_fix_obfuscation(
    view: Arc<dyn ImageView>,
    store: Arc<PatchStore>,
    function: u64,
) -> TaskThread {
    TaskThread::spawn(format!("fix-obfuscation-{:#x}", function), move |token| {
        FixObfuscation::new(view.as_ref(), store.as_ref(), function).run(token);
    })
}

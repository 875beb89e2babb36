//! SSA chain tracing and branch-dependence solving.
//!
//! An indirect jump whose target set has exactly two members is usually a
//! two-way branch the obfuscator rewrote as a conditional move feeding a
//! jump. Recovering the original condition means following SSA pass-through
//! chains back to real computations ([`trace_var`]) and diffing the branch
//! dependence of the two candidate values ([`solve_branch_dependence`]): the
//! branch the two candidates disagree on is the one the obfuscator hid.
//!
//! Absence of the pattern is the common case while scanning, so every
//! function here reports "not found" as `None` rather than an error.

use itertools::Itertools;

use crate::mlil::{BranchDependence, ExprIdx, MlilFunction, MlilOp};
use crate::view::PossibleValueSet;

/// Budget for one chain walk. The SSA graph the host hands back can be
/// cyclic (phi chains) or malformed; a walk that has not reached a real
/// computation by then is reported as unresolved.
pub const TRACE_LIMIT: usize = 100;

/// Follow `expr` while it is exactly a pass-through: a variable read is
/// unwrapped to its defining instruction, and a single-source assignment to
/// its source. The first expression that is anything else (a computation,
/// not a pass-through) is the result.
///
/// Returns `None` when a variable has no definition inside the function
/// (e.g. a parameter, reported by the host as an out-of-range definition
/// index) or when [`TRACE_LIMIT`] steps were not enough.
pub fn trace_var(func: &MlilFunction, expr: ExprIdx) -> Option<ExprIdx> {
    let mut current = expr;
    for _ in 0..TRACE_LIMIT {
        match func.expr(current).op {
            MlilOp::VarSsa { var } => match func.ssa_definition(var) {
                Some(def) if def < func.instruction_count() => {
                    current = func.instruction(def);
                }
                _ => return None,
            },
            MlilOp::SetVarSsa { src, .. } => current = src,
            _ => return Some(current),
        }
    }
    None
}

/// A two-way branch recovered from the branch-dependence diff of two
/// candidate values, with the candidates assigned to its edges.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SolvedBranch {
    /// Instruction index of the controlling two-way branch
    pub branch: usize,
    /// Instruction index of the candidate executed on the true edge
    pub true_val: usize,
    /// Instruction index of the candidate executed on the false edge
    pub false_val: usize,
}

/// Find a controlling branch on which the two candidate instructions' branch
/// dependence disagrees.
///
/// The first diverging branch (in ascending branch-index order) decides the
/// outcome: if it is not a two-way conditional the search is abandoned, no
/// other diverging branches are tried. The left candidate's tag breaks the
/// true/false tie: unless it is false-branch-only, `lhs` takes the true
/// slot.
pub fn solve_branch_dependence(
    func: &MlilFunction,
    lhs: usize,
    rhs: usize,
) -> Option<SolvedBranch> {
    let lhs_deps = func.branch_dependence_of(lhs)?;
    let rhs_deps = func.branch_dependence_of(rhs)?;

    for (&branch, &lhs_dep) in lhs_deps.iter().sorted_by_key(|&(&branch, _)| branch) {
        let Some(&rhs_dep) = rhs_deps.get(&branch) else {
            continue;
        };
        if lhs_dep == rhs_dep {
            continue;
        }

        if branch >= func.instruction_count() {
            return None;
        }
        if !matches!(
            func.expr(func.instruction(branch)).op,
            MlilOp::If { .. }
        ) {
            return None;
        }

        return Some(if lhs_dep != BranchDependence::FalseBranch {
            SolvedBranch {
                branch,
                true_val: lhs,
                false_val: rhs,
            }
        } else {
            SolvedBranch {
                branch,
                true_val: rhs,
                false_val: lhs,
            }
        });
    }
    None
}

/// A fully recovered hidden two-way branch.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ConditionalMove {
    /// Instruction index of the controlling two-way branch
    pub branch: usize,
    /// The branch's condition, traced to a terminal expression
    pub condition: ExprIdx,
    /// Instruction index defining the value selected on the true edge
    pub true_val: usize,
    /// Instruction index defining the value selected on the false edge
    pub false_val: usize,
}

/// Recover the conditional move feeding `expr`, which must be exactly a
/// 2-source phi node whose sources are both simple SSA assignments.
pub fn conditional_move_source(func: &MlilFunction, expr: ExprIdx) -> Option<ConditionalMove> {
    let MlilOp::VarPhi { ref sources, .. } = func.expr(expr).op else {
        return None;
    };
    if sources.len() != 2 {
        return None;
    }

    let mut defs = [0usize; 2];
    for (slot, &var) in defs.iter_mut().zip(sources.iter()) {
        match func.ssa_definition(var) {
            Some(def) if def < func.instruction_count() => *slot = def,
            _ => return None,
        }
    }
    for &def in &defs {
        if !matches!(
            func.expr(func.instruction(def)).op,
            MlilOp::SetVarSsa { .. }
        ) {
            return None;
        }
    }

    let solved = solve_branch_dependence(func, defs[0], defs[1])?;
    let MlilOp::If { condition, .. } = func.expr(func.instruction(solved.branch)).op else {
        return None;
    };
    let condition = trace_var(func, condition)?;

    Some(ConditionalMove {
        branch: solved.branch,
        condition,
        true_val: solved.true_val,
        false_val: solved.false_val,
    })
}

/// Recover the two-way branch hidden behind the indirect jump at instruction
/// `instr`. The jump's destination must have exactly two possible concrete
/// targets; more or fewer means it is not a disguised two-way branch.
pub fn indirect_branch_condition(func: &MlilFunction, instr: usize) -> Option<ConditionalMove> {
    if instr >= func.instruction_count() {
        return None;
    }
    let MlilOp::JumpTo { dest } = func.expr(func.instruction(instr)).op else {
        return None;
    };

    let PossibleValueSet::InSetOfValues(targets) = func.possible_values(dest) else {
        return None;
    };
    if targets.len() != 2 {
        return None;
    }

    let dest = trace_var(func, dest)?;
    conditional_move_source(func, dest)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mlil::SsaVar;

    /// A function holding a pass-through chain of `links` SSA variables
    /// ending in a constant. Returns the function and the expression the
    /// trace starts from.
    fn chain_function(links: u32) -> (MlilFunction, ExprIdx) {
        let mut func = MlilFunction::new();
        let terminal = func.add_expr(MlilOp::Const { value: 0x42 }, 0x1000);
        let mut src = terminal;
        // Build v_links ... v_1 from the inside out; each v_i is defined by
        // an assignment whose source is the previous link.
        for i in (1..=links).rev() {
            let set = func.add_expr(
                MlilOp::SetVarSsa {
                    dest: SsaVar(i),
                    src,
                },
                0x1000 + u64::from(i),
            );
            let def = func.push_instruction(set);
            func.set_ssa_definition(SsaVar(i), def);
            src = func.add_expr(MlilOp::VarSsa { var: SsaVar(i) }, 0x1000 + u64::from(i));
        }
        (func, src)
    }

    #[test]
    fn trace_resolves_through_chain() {
        // 49 links cost 98 unwrap steps plus the terminal check, which is
        // the deepest chain the 100-step budget accommodates.
        let (func, start) = chain_function(49);
        let resolved = trace_var(&func, start).unwrap();
        assert_eq!(func.expr(resolved).op, MlilOp::Const { value: 0x42 });
    }

    #[test]
    fn trace_gives_up_past_budget() {
        let (func, start) = chain_function(50);
        assert_eq!(trace_var(&func, start), None);
    }

    #[test]
    fn trace_terminates_on_cycle() {
        let mut func = MlilFunction::new();
        let v = SsaVar(1);
        let read = func.add_expr(MlilOp::VarSsa { var: v }, 0x1000);
        let set = func.add_expr(MlilOp::SetVarSsa { dest: v, src: read }, 0x1000);
        let def = func.push_instruction(set);
        func.set_ssa_definition(v, def);
        assert_eq!(trace_var(&func, read), None);
    }

    #[test]
    fn trace_fails_without_definition() {
        let mut func = MlilFunction::new();
        let read = func.add_expr(MlilOp::VarSsa { var: SsaVar(1) }, 0x1000);
        // No definition registered at all.
        assert_eq!(trace_var(&func, read), None);

        // A definition index past the instruction list (the host's way of
        // saying "defined outside the function") is just as unresolved.
        func.set_ssa_definition(SsaVar(1), 17);
        assert_eq!(trace_var(&func, read), None);
    }

    /// Two assignments under one `if`, with configurable dependence tags.
    fn diamond(
        lhs_dep: BranchDependence,
        rhs_dep: BranchDependence,
    ) -> (MlilFunction, usize, usize, usize) {
        let mut func = MlilFunction::new();
        let cond = func.add_expr(MlilOp::Const { value: 1 }, 0x1000);
        let br = func.add_expr(
            MlilOp::If {
                condition: cond,
                true_target: 1,
                false_target: 2,
            },
            0x1000,
        );
        let branch = func.push_instruction(br);

        let c1 = func.add_expr(MlilOp::Const { value: 0x10 }, 0x1004);
        let s1 = func.add_expr(MlilOp::SetVarSsa { dest: SsaVar(1), src: c1 }, 0x1004);
        let lhs = func.push_instruction(s1);
        let c2 = func.add_expr(MlilOp::Const { value: 0x20 }, 0x1008);
        let s2 = func.add_expr(MlilOp::SetVarSsa { dest: SsaVar(2), src: c2 }, 0x1008);
        let rhs = func.push_instruction(s2);

        func.set_branch_dependence(lhs, branch, lhs_dep);
        func.set_branch_dependence(rhs, branch, rhs_dep);
        (func, branch, lhs, rhs)
    }

    #[test]
    fn solver_ignores_identical_tags() {
        let (func, _, lhs, rhs) = diamond(BranchDependence::Both, BranchDependence::Both);
        assert_eq!(solve_branch_dependence(&func, lhs, rhs), None);
    }

    #[test]
    fn solver_assigns_slots_by_left_tag() {
        let (func, branch, lhs, rhs) =
            diamond(BranchDependence::TrueBranch, BranchDependence::FalseBranch);
        assert_eq!(
            solve_branch_dependence(&func, lhs, rhs),
            Some(SolvedBranch {
                branch,
                true_val: lhs,
                false_val: rhs,
            })
        );

        // A false-branch-only left candidate swaps the slots.
        let (func, branch, lhs, rhs) =
            diamond(BranchDependence::FalseBranch, BranchDependence::TrueBranch);
        assert_eq!(
            solve_branch_dependence(&func, lhs, rhs),
            Some(SolvedBranch {
                branch,
                true_val: rhs,
                false_val: lhs,
            })
        );
    }

    #[test]
    fn solver_abandons_on_non_conditional_divergence() {
        // The first diverging branch index is a Goto; even though a later
        // diverging branch is a proper If, the search must not retry.
        let mut func = MlilFunction::new();
        let goto = func.add_expr(MlilOp::Goto { target: 9 }, 0x1000);
        let not_a_branch = func.push_instruction(goto);
        let cond = func.add_expr(MlilOp::Const { value: 1 }, 0x1004);
        let br = func.add_expr(
            MlilOp::If {
                condition: cond,
                true_target: 2,
                false_target: 3,
            },
            0x1004,
        );
        let real_branch = func.push_instruction(br);
        let nop1 = func.add_expr(MlilOp::Nop, 0x1008);
        let lhs = func.push_instruction(nop1);
        let nop2 = func.add_expr(MlilOp::Nop, 0x100c);
        let rhs = func.push_instruction(nop2);

        func.set_branch_dependence(lhs, not_a_branch, BranchDependence::TrueBranch);
        func.set_branch_dependence(rhs, not_a_branch, BranchDependence::FalseBranch);
        func.set_branch_dependence(lhs, real_branch, BranchDependence::TrueBranch);
        func.set_branch_dependence(rhs, real_branch, BranchDependence::FalseBranch);

        assert_eq!(solve_branch_dependence(&func, lhs, rhs), None);
    }
}

//! Shared test fixtures: an in-memory metadata store, a fake analysis
//! session, and a canonical obfuscated-function program; plus the end-to-end
//! tests that drive the fix passes over them.

use std::sync::{Mutex, MutexGuard};

use crate::containers::unordered::UnorderedMap;
use crate::mlil::{BranchDependence, BinOpKind, MlilFunction, MlilOp, SsaVar};
use crate::persist::MetadataStore;
use crate::view::{
    ArchInfo, HighlightColor, ImageId, ImageView, LlilFunctionInfo, PossibleValueSet,
};

/// The architecture every fixture uses: 8-byte slots, register 4 as the
/// stack pointer, register 1 as the scratch register, and one lifter
/// temporary.
pub fn test_arch() -> ArchInfo {
    ArchInfo {
        addr_size: 8,
        sp_reg: 4,
        scratch_reg: 1,
        temp_regs: vec![0x80],
    }
}

/// A [`MetadataStore`] over a plain in-memory map.
#[derive(Default)]
pub struct MemMetadata {
    data: Mutex<UnorderedMap<(ImageId, String), String>>,
}

impl MemMetadata {
    pub fn new() -> Self {
        Default::default()
    }
}

impl MetadataStore for MemMetadata {
    fn query(&self, image: ImageId, key: &str) -> Option<String> {
        self.data
            .lock()
            .unwrap()
            .get(&(image, key.to_owned()))
            .cloned()
    }

    fn store(&self, image: ImageId, key: &str, value: &str) {
        self.data
            .lock()
            .unwrap()
            .insert((image, key.to_owned()), value.to_owned());
    }
}

/// One function known to a [`FakeImage`].
#[derive(Default)]
pub struct FakeFunction {
    pub auto_discovered: bool,
    /// Entry addresses of functions referencing this one
    pub callers: Vec<u64>,
    pub llil: LlilFunctionInfo,
    /// Snapshots swapped in (front first) on each re-analysis request,
    /// standing in for the host re-lifting the function
    pub llil_after_reanalysis: Vec<LlilFunctionInfo>,
    pub mlil: Option<MlilFunction>,
    /// `(instruction address, frame-relative offset) -> contents` for the
    /// pivot probe
    pub stack_contents: UnorderedMap<(u64, i64), PossibleValueSet>,
}

/// Mutable state of a [`FakeImage`], exposed directly so tests can arrange
/// scenarios and inspect side effects.
#[derive(Default)]
pub struct FakeImageState {
    pub functions: UnorderedMap<u64, FakeFunction>,
    /// Executable regions as `(start, end)` half-open ranges
    pub executable: Vec<(u64, u64)>,
    pub comments: Vec<(u64, u64, String)>,
    pub highlights: Vec<(u64, u64, HighlightColor)>,
}

impl FakeImageState {
    pub fn add_function(&mut self, entry: u64, auto_discovered: bool) -> &mut FakeFunction {
        self.functions.insert(
            entry,
            FakeFunction {
                auto_discovered,
                ..Default::default()
            },
        );
        self.functions.get_mut(&entry).unwrap()
    }
}

/// An [`ImageView`] over plain data.
pub struct FakeImage {
    image: ImageId,
    arch: ArchInfo,
    state: Mutex<FakeImageState>,
}

impl FakeImage {
    pub fn new(arch: ArchInfo) -> Self {
        Self {
            image: ImageId(1),
            arch,
            state: Mutex::new(FakeImageState::default()),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, FakeImageState> {
        self.state.lock().unwrap()
    }
}

impl ImageView for FakeImage {
    fn image(&self) -> ImageId {
        self.image
    }

    fn name(&self) -> String {
        "fake-image".into()
    }

    fn arch(&self) -> ArchInfo {
        self.arch.clone()
    }

    fn is_executable(&self, addr: u64) -> bool {
        self.state()
            .executable
            .iter()
            .any(|&(start, end)| (start..end).contains(&addr))
    }

    fn function_exists(&self, entry: u64) -> bool {
        self.state().functions.contains_key(&entry)
    }

    fn function_was_auto_discovered(&self, entry: u64) -> bool {
        self.state()
            .functions
            .get(&entry)
            .is_some_and(|f| f.auto_discovered)
    }

    fn function_callers(&self, entry: u64) -> Vec<u64> {
        self.state()
            .functions
            .get(&entry)
            .map(|f| f.callers.clone())
            .unwrap_or_default()
    }

    fn remove_function(&self, entry: u64) {
        self.state().functions.remove(&entry);
    }

    fn low_level_il(&self, entry: u64) -> Option<LlilFunctionInfo> {
        self.state().functions.get(&entry).map(|f| f.llil.clone())
    }

    fn mlil_ssa(&self, entry: u64) -> Option<MlilFunction> {
        self.state()
            .functions
            .get(&entry)
            .and_then(|f| f.mlil.clone())
    }

    fn begin_reanalysis(&self, entry: u64) {
        if let Some(f) = self.state().functions.get_mut(&entry) {
            if !f.llil_after_reanalysis.is_empty() {
                f.llil = f.llil_after_reanalysis.remove(0);
            }
        }
    }

    fn analysis_pending(&self, _entry: u64) -> bool {
        false
    }

    fn stack_contents_at(&self, entry: u64, addr: u64, stack_offset: i64) -> PossibleValueSet {
        self.state()
            .functions
            .get(&entry)
            .and_then(|f| f.stack_contents.get(&(addr, stack_offset)).cloned())
            .unwrap_or(PossibleValueSet::Unknown)
    }

    fn set_comment(&self, entry: u64, addr: u64, comment: &str) {
        self.state().comments.push((entry, addr, comment.into()));
    }

    fn set_highlight(&self, entry: u64, addr: u64, color: HighlightColor) {
        self.state().highlights.push((entry, addr, color));
    }
}

/// The canonical obfuscated two-way branch, in SSA form:
///
/// ```text
/// 0: if (a == b) then 1 else 2      @ 0x1000
/// 1: x#1 = 0x2000                   @ 0x1004   (true edge only)
/// 2: x#2 = 0x3000                   @ 0x1008   (false edge only)
/// 3: x#3 = phi(x#1, x#2)            @ 0x100c
/// 4: jump x#3                       @ 0x1010   (targets {0x2000, 0x3000})
/// ```
pub fn hidden_branch_function() -> MlilFunction {
    let mut func = MlilFunction::new();

    let a = func.add_expr(MlilOp::Const { value: 7 }, 0x1000);
    let b = func.add_expr(MlilOp::Const { value: 9 }, 0x1000);
    let cmp = func.add_expr(
        MlilOp::BinOp {
            kind: BinOpKind::CmpEqual,
            left: a,
            right: b,
        },
        0x1000,
    );
    let vc = SsaVar(0);
    let set_cond = func.add_expr(MlilOp::SetVarSsa { dest: vc, src: cmp }, 0x1000);
    let cond_read = func.add_expr(MlilOp::VarSsa { var: vc }, 0x1000);
    let if_expr = func.add_expr(
        MlilOp::If {
            condition: cond_read,
            true_target: 1,
            false_target: 2,
        },
        0x1000,
    );

    let x1 = SsaVar(1);
    let true_src = func.add_expr(MlilOp::ConstPtr { value: 0x2000 }, 0x1004);
    let set_true = func.add_expr(
        MlilOp::SetVarSsa {
            dest: x1,
            src: true_src,
        },
        0x1004,
    );
    let x2 = SsaVar(2);
    let false_src = func.add_expr(MlilOp::ConstPtr { value: 0x3000 }, 0x1008);
    let set_false = func.add_expr(
        MlilOp::SetVarSsa {
            dest: x2,
            src: false_src,
        },
        0x1008,
    );

    let x3 = SsaVar(3);
    let phi = func.add_expr(
        MlilOp::VarPhi {
            dest: x3,
            sources: vec![x1, x2],
        },
        0x100c,
    );
    let dest_read = func.add_expr(MlilOp::VarSsa { var: x3 }, 0x1010);
    let jump = func.add_expr(MlilOp::JumpTo { dest: dest_read }, 0x1010);

    let i_branch = func.push_instruction(if_expr);
    let i_true = func.push_instruction(set_true);
    let i_false = func.push_instruction(set_false);
    let i_phi = func.push_instruction(phi);
    let i_jump = func.push_instruction(jump);
    // The condition definition sits past the jump only to keep the indexes
    // above stable; the tracer follows the definition map, not layout.
    let i_cond = func.push_instruction(set_cond);

    func.set_ssa_definition(vc, i_cond);
    func.set_ssa_definition(x1, i_true);
    func.set_ssa_definition(x2, i_false);
    func.set_ssa_definition(x3, i_phi);

    func.set_branch_dependence(i_true, i_branch, BranchDependence::TrueBranch);
    func.set_branch_dependence(i_false, i_branch, BranchDependence::FalseBranch);

    func.set_possible_values(
        dest_read,
        PossibleValueSet::InSetOfValues([0x2000, 0x3000].into_iter().collect()),
    );

    func.add_block(vec![i_branch]);
    func.add_block(vec![i_true]);
    func.add_block(vec![i_false]);
    func.add_block(vec![i_phi, i_jump]);

    func
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::background::CancellationToken;
    use crate::passes::{FixObfuscation, PassOutcome};
    use crate::ssa_trace;
    use crate::store::PatchStore;
    use crate::view::{
        CallSite, LlilBlock, Terminator, TerminatorDest, TerminatorKind,
    };
    use std::sync::Arc;

    #[test]
    fn indirect_branch_condition_recovers_hidden_two_way() {
        let func = hidden_branch_function();
        let cm = ssa_trace::indirect_branch_condition(&func, 4).unwrap();
        assert_eq!(cm.branch, 0);
        assert_eq!(cm.true_val, 1);
        assert_eq!(cm.false_val, 2);
        assert!(matches!(
            func.expr(cm.condition).op,
            MlilOp::BinOp {
                kind: BinOpKind::CmpEqual,
                ..
            }
        ));
    }

    #[test]
    fn jump_with_other_target_cardinality_is_not_a_branch() {
        let mut func = hidden_branch_function();
        let MlilOp::JumpTo { dest } = func.expr(func.instruction(4)).op else {
            unreachable!();
        };
        func.set_possible_values(
            dest,
            PossibleValueSet::InSetOfValues([0x2000, 0x3000, 0x4000].into_iter().collect()),
        );
        assert_eq!(ssa_trace::indirect_branch_condition(&func, 4), None);

        func.set_possible_values(dest, PossibleValueSet::ConstantPtr(0x2000));
        assert_eq!(ssa_trace::indirect_branch_condition(&func, 4), None);
    }

    fn tail_call_block(dest: u64) -> LlilBlock {
        LlilBlock {
            terminator: Terminator {
                address: 0x1040,
                length: 5,
                kind: TerminatorKind::TailCall,
                dest: TerminatorDest::Constant { value: dest },
                dest_values: PossibleValueSet::ConstantPtr(dest),
                stack_offset: None,
            },
        }
    }

    fn plain_ret_block() -> LlilBlock {
        LlilBlock {
            terminator: Terminator {
                address: 0x1048,
                length: 1,
                kind: TerminatorKind::Ret,
                dest: TerminatorDest::None,
                dest_values: PossibleValueSet::Unknown,
                stack_offset: None,
            },
        }
    }

    #[test]
    fn spurious_tail_duplicate_converges_in_one_changing_iteration() {
        let image = FakeImage::new(test_arch());
        let entry = 0x1000;
        let duplicate = 0x5000;
        {
            let mut state = image.state();
            let func = state.add_function(entry, false);
            func.llil.blocks.push(tail_call_block(duplicate));
            func.llil.address_range = (0x1000, 0x1050);
            // After re-analysis the tail call has been folded back in.
            func.llil_after_reanalysis.push(LlilFunctionInfo {
                blocks: vec![plain_ret_block()],
                address_range: (0x1000, 0x1050),
                ..Default::default()
            });
            let dup = state.add_function(duplicate, true);
            dup.callers = vec![entry];
        }

        let store = PatchStore::new(Arc::new(MemMetadata::new()));
        let outcome =
            FixObfuscation::new(&image, &store, entry).run(&CancellationToken::new());
        assert_eq!(
            outcome,
            PassOutcome::FixedPoint {
                iterations: 2,
                changes: 1,
            }
        );
        assert!(!image.function_exists(duplicate));

        // Once removed, a second run finds nothing to do.
        let outcome =
            FixObfuscation::new(&image, &store, entry).run(&CancellationToken::new());
        assert_eq!(
            outcome,
            PassOutcome::FixedPoint {
                iterations: 1,
                changes: 0,
            }
        );
    }

    #[test]
    fn user_created_or_shared_targets_survive() {
        for (auto_discovered, callers) in
            [(false, vec![0x1000]), (true, vec![0x1000, 0x7000])]
        {
            let image = FakeImage::new(test_arch());
            let entry = 0x1000;
            let target = 0x5000;
            {
                let mut state = image.state();
                state
                    .add_function(entry, false)
                    .llil
                    .blocks
                    .push(tail_call_block(target));
                let tgt = state.add_function(target, auto_discovered);
                tgt.callers = callers.clone();
            }
            let store = PatchStore::new(Arc::new(MemMetadata::new()));
            FixObfuscation::new(&image, &store, entry).run(&CancellationToken::new());
            assert!(image.function_exists(target));
        }
    }

    #[test]
    fn post_analysis_labels_recovered_branches_and_suspicious_sites() {
        let image = FakeImage::new(test_arch());
        let entry = 0x1000;
        {
            let mut state = image.state();
            let func = state.add_function(entry, false);
            func.mlil = Some(hidden_branch_function());
            func.llil.address_range = (0x1000, 0x1050);
            func.llil.blocks.push(LlilBlock {
                terminator: Terminator {
                    address: 0x1044,
                    length: 1,
                    kind: TerminatorKind::Ret,
                    dest: TerminatorDest::None,
                    dest_values: PossibleValueSet::Unknown,
                    stack_offset: Some(0),
                },
            });
            func.llil.calls.push(CallSite {
                address: 0x1020,
                target: Some(0x99_0000),
            });
            func.llil.calls.push(CallSite {
                address: 0x1024,
                target: Some(0x1010),
            });
        }

        let store = PatchStore::new(Arc::new(MemMetadata::new()));
        let outcome =
            FixObfuscation::new(&image, &store, entry).run(&CancellationToken::new());
        assert_eq!(
            outcome,
            PassOutcome::FixedPoint {
                iterations: 1,
                changes: 0,
            }
        );

        let state = image.state();
        assert_eq!(
            state.comments,
            vec![(entry, 0x1010, "cond 0 @ 0x1000".to_owned())]
        );
        let has = |addr: u64, color: HighlightColor| {
            state
                .highlights
                .iter()
                .any(|&(f, a, c)| f == entry && a == addr && c == color)
        };
        // Branch, condition, and both constant value sites.
        assert!(has(0x1000, HighlightColor::Red));
        assert!(has(0x1000, HighlightColor::Orange));
        assert!(has(0x1004, HighlightColor::Green));
        assert!(has(0x1008, HighlightColor::Yellow));
        // Frame-neutral terminator and the far call; the nearby call is not
        // flagged.
        assert!(has(0x1044, HighlightColor::Cyan));
        assert!(has(0x1020, HighlightColor::Magenta));
        assert!(!state.highlights.iter().any(|&(_, a, _)| a == 0x1024));
    }
}

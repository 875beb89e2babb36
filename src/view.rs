//! The analysis-session boundary: everything the fix passes need to know
//! about (or do to) the binary image under analysis, reduced to one trait.
//!
//! The host disassembler implements [`ImageView`] over its own binary-view
//! object; the crate's test fixtures implement it over plain data. Keeping
//! the boundary a trait (rather than calling the host directly) is what lets
//! the passes and the patch store live outside the host process model.

use crate::containers::unordered::UnorderedSet;
use crate::mlil::MlilFunction;

/// Opaque identity of a binary image (one loaded/analyzed binary). Identity,
/// not content: two loads of the same file are two images.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct ImageId(pub u64);

/// The set of concrete values the host's value-set analysis reports an
/// expression (or memory location) may take. Produced by the host, consumed
/// read-only here.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum PossibleValueSet {
    /// Exactly one constant
    Constant(u64),
    /// Exactly one constant, known to be a pointer
    ConstantPtr(u64),
    /// A small finite set of values
    InSetOfValues(UnorderedSet<u64>),
    /// A bounded table of (input, output) pairs, as recovered from a jump
    /// table
    LookupTable(Vec<(u64, u64)>),
    /// Imported, clobbered, or otherwise unknowable
    Unknown,
}

impl PossibleValueSet {
    /// All concrete values in the set, or `None` when the host could not
    /// bound them.
    pub fn concrete_values(&self) -> Option<Vec<u64>> {
        match self {
            PossibleValueSet::Constant(v) | PossibleValueSet::ConstantPtr(v) => Some(vec![*v]),
            PossibleValueSet::InSetOfValues(vs) => Some(vs.iter().copied().collect()),
            PossibleValueSet::LookupTable(entries) => {
                Some(entries.iter().map(|&(_, out)| out).collect())
            }
            PossibleValueSet::Unknown => None,
        }
    }

    /// The single concrete value, if the set holds exactly one.
    pub fn single_value(&self) -> Option<u64> {
        match self.concrete_values() {
            Some(vs) if vs.len() == 1 => Some(vs[0]),
            _ => None,
        }
    }
}

/// Architecture facts the patch synthesizers need.
#[derive(Clone, Debug)]
pub struct ArchInfo {
    /// Size of a pointer/stack slot in bytes
    pub addr_size: usize,
    /// Register number of the stack pointer
    pub sp_reg: u32,
    /// Register number the synthesized pop sequences may clobber
    pub scratch_reg: u32,
    /// Registers that are temporaries of the lifter rather than real
    /// architectural state
    pub temp_regs: Vec<u32>,
}

impl ArchInfo {
    /// Whether `reg` is a scratch/temporary register that normalization must
    /// not pin to a recomputed value.
    pub fn is_temp_reg(&self, reg: u32) -> bool {
        reg == self.scratch_reg || self.temp_regs.contains(&reg)
    }
}

/// Highlight colors offered by the host UI.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HighlightColor {
    Blue,
    Cyan,
    Green,
    Magenta,
    Orange,
    Red,
    Yellow,
}

/// How a block terminator leaves the function.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TerminatorKind {
    Ret,
    Jump,
    TailCall,
    /// Conditional or fallthrough terminators the passes leave alone
    Other,
}

/// Where a terminator's destination comes from, as far as the host's
/// data-flow analysis could tell.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TerminatorDest {
    /// No separate destination operand (a plain `ret` reads `[sp]`)
    None,
    /// Loaded through a constant frame-relative offset from the stack
    /// pointer
    StackLoad { frame_offset: i64 },
    /// Held directly in a register
    Register { reg: u32 },
    /// A constant address
    Constant { value: u64 },
    /// Computed in some way the synthesizer does not understand
    Computed,
}

/// A block-terminating instruction of the lifted low-level IR, with the
/// host-side analysis facts the passes consume.
#[derive(Clone, Debug)]
pub struct Terminator {
    /// Machine address of the terminator instruction
    pub address: u64,
    /// Byte length of the terminator instruction
    pub length: u64,
    pub kind: TerminatorKind,
    pub dest: TerminatorDest,
    /// Possible concrete destinations, per the host's value-set analysis
    pub dest_values: PossibleValueSet,
    /// The stack pointer at this instruction, relative to the function's
    /// frame on entry, when the host could resolve it
    pub stack_offset: Option<i64>,
}

/// One basic block of the lifted low-level IR. Only the terminator is
/// interesting to the passes.
#[derive(Clone, Debug)]
pub struct LlilBlock {
    pub terminator: Terminator,
}

/// A `pop`-derived register assignment, with the frame-relative stack state
/// around it.
#[derive(Clone, Debug)]
pub struct PopRegSite {
    pub address: u64,
    pub length: u64,
    /// The register popped into
    pub reg: u32,
    /// Frame-relative stack pointer before the pop, if known
    pub sp_before: Option<i64>,
    /// Frame-relative stack pointer after the pop, if known
    pub sp_after: Option<i64>,
    /// The popped register's value after the pop, as a frame-relative
    /// offset, if known (the signature of a pivot through a stack slot)
    pub reg_value_offset: Option<i64>,
}

/// A call instruction and its resolved target, if any.
#[derive(Clone, Copy, Debug)]
pub struct CallSite {
    pub address: u64,
    pub target: Option<u64>,
}

/// A snapshot of the facts the passes need about one function's lifted
/// low-level IR. Re-fetched after every re-analysis round.
#[derive(Clone, Debug, Default)]
pub struct LlilFunctionInfo {
    pub blocks: Vec<LlilBlock>,
    pub pop_sites: Vec<PopRegSite>,
    pub calls: Vec<CallSite>,
    /// The function's estimated instruction address range (lowest, highest)
    pub address_range: (u64, u64),
}

/// The host analysis session for one binary image.
///
/// Functions are identified by entry address. All methods take `&self`; the
/// host serializes its own internal state.
pub trait ImageView: Send + Sync {
    fn image(&self) -> ImageId;

    /// Display name of the image, for log messages
    fn name(&self) -> String;

    fn arch(&self) -> ArchInfo;

    /// Whether `addr` lies inside an executable region of the image
    fn is_executable(&self, addr: u64) -> bool;

    fn function_exists(&self, entry: u64) -> bool;

    /// Whether the function was discovered by analysis rather than created
    /// by the user
    fn function_was_auto_discovered(&self, entry: u64) -> bool;

    /// Entry addresses of every function containing a reference to `entry`
    fn function_callers(&self, entry: u64) -> Vec<u64>;

    /// Remove a (spuriously discovered) function from the function list
    fn remove_function(&self, entry: u64);

    /// The lifted low-level IR facts for the function at `entry`
    fn low_level_il(&self, entry: u64) -> Option<LlilFunctionInfo>;

    /// The SSA-form mid-level IR for the function at `entry`
    fn mlil_ssa(&self, entry: u64) -> Option<MlilFunction>;

    /// Ask the host to re-lift and re-analyze the function
    fn begin_reanalysis(&self, entry: u64);

    /// Whether the host's incremental analysis of the function is still
    /// pending. Polled; the host exposes no completion signal.
    fn analysis_pending(&self, entry: u64) -> bool;

    /// Possible contents of the stack slot at frame-relative `stack_offset`,
    /// observed at the instruction at `addr`
    fn stack_contents_at(&self, entry: u64, addr: u64, stack_offset: i64) -> PossibleValueSet;

    fn set_comment(&self, entry: u64, addr: u64, comment: &str);

    fn set_highlight(&self, entry: u64, addr: u64, color: HighlightColor);
}

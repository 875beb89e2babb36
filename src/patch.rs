//! The patch bytecode: a deferred IR-construction program attached to one
//! address.
//!
//! A [`Patch`] is a linear token sequence interpreted by a small stack
//! machine. Operand tokens push plain values; instruction tokens pop their
//! control values and operands, build one low-level IR expression through the
//! host, and push the resulting handle. Whatever remains on the stack at the
//! end is appended to the current basic block as top-level instructions, in
//! push order, which is how one patch can replace a single misdecoded
//! instruction with a whole sequence (`reg = reg + 1; push reg; call target`).
//!
//! Evaluation validates the entire token program before building anything, so
//! a malformed patch never leaves a half-emitted instruction graph behind.

use crate::il::{ExprId, IlBuilder, Op, MAX_OPERANDS};

/// One element of a patch program.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Token {
    /// A literal value waiting to be consumed
    Operand(u64),
    /// Pop control values and operands, build one expression
    Instruction(Op),
}

/// A deferred IR-construction program for one address.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Patch {
    /// The byte length this patch logically replaces; reported to the host
    /// as the consumed length after a successful evaluation
    pub size: u64,
    pub tokens: Vec<Token>,
}

/// Why a patch program failed to evaluate. All of these are generator bugs
/// (or corrupted stored data), not conditions the fix passes produce; the
/// caller's response is to fall back to default lifting for the address.
#[derive(thiserror::Error, Clone, PartialEq, Eq, Debug)]
pub enum EvalError {
    #[error("missing instruction control values (expected 3, got {got})")]
    MissingControlValues { got: usize },
    #[error("{what} for {op:?} is a built expression, not a literal")]
    NonLiteralControlValue { op: Op, what: &'static str },
    #[error("mismatched operand count for {op:?} (expected {expected}, got {got})")]
    OperandCountMismatch { op: Op, expected: usize, got: u64 },
    #[error("missing operand expressions (expected {expected}, got {got})")]
    MissingOperands { expected: u64, got: usize },
    #[error("leftover stack value {position} is a bare operand ({value:#x})")]
    BareOperand { position: usize, value: u64 },
}

/// A value-stack slot during staging: either a literal pushed by an operand
/// token, or the result of a staged expression build.
#[derive(Clone, Copy)]
enum Slot {
    Literal(u64),
    Staged(usize),
}

/// An operand slot of a staged expression build.
#[derive(Clone, Copy)]
enum StagedOperand {
    Literal(u64),
    Expr(usize),
}

/// One expression build, recorded during validation and replayed against the
/// real builder only once the whole program has checked out.
struct StagedExpr {
    op: Op,
    size: usize,
    flags: u32,
    operands: [StagedOperand; MAX_OPERANDS],
}

impl Patch {
    /// The canonical do-nothing patch covering `size` bytes.
    pub fn nop(size: u64) -> Patch {
        let mut program = PatchProgram::new();
        program.instruction(Op::Nop, 0, 0);
        program.into_patch(size)
    }

    /// Validate the token program without building anything.
    pub fn check(&self) -> Result<(), EvalError> {
        self.stage().map(|_| ())
    }

    /// Interpret the token program against `il`, appending the leftover
    /// stack entries as top-level instructions in push order.
    ///
    /// On error nothing has been appended to `il`; the caller should treat
    /// the address as unpatched. On success the caller reports
    /// [`Patch::size`] as the consumed byte length.
    pub fn evaluate(&self, il: &mut dyn IlBuilder) -> Result<(), EvalError> {
        let (staged, leftovers) = self.stage()?;

        let mut built: Vec<ExprId> = Vec::with_capacity(staged.len());
        for expr in &staged {
            let mut operands = [0u64; MAX_OPERANDS];
            for (slot, staged_op) in operands.iter_mut().zip(expr.operands.iter()) {
                *slot = match *staged_op {
                    StagedOperand::Literal(v) => v,
                    StagedOperand::Expr(idx) => built[idx].0,
                };
            }
            built.push(il.add_expr(expr.op, expr.size, expr.flags, operands));
        }
        for idx in leftovers {
            il.add_instruction(built[idx]);
        }
        Ok(())
    }

    /// Walk the token program once, simulating the value stack and recording
    /// every expression build. Returns the staged builds plus the leftover
    /// stack entries (as staging indexes, in push order).
    fn stage(&self) -> Result<(Vec<StagedExpr>, Vec<usize>), EvalError> {
        let mut stack: Vec<Slot> = Vec::new();
        let mut staged: Vec<StagedExpr> = Vec::new();

        for token in &self.tokens {
            match *token {
                Token::Operand(value) => stack.push(Slot::Literal(value)),
                Token::Instruction(op) => {
                    if stack.len() < 3 {
                        return Err(EvalError::MissingControlValues { got: stack.len() });
                    }
                    // The last three pushes before an instruction token are
                    // operand count, flags, and operation size; they pop in
                    // reverse.
                    let mut control = |what: &'static str| match stack.pop() {
                        Some(Slot::Literal(v)) => Ok(v),
                        Some(Slot::Staged(_)) => {
                            Err(EvalError::NonLiteralControlValue { op, what })
                        }
                        None => unreachable!("stack depth checked above"),
                    };
                    let size = control("operation size")?;
                    let flags = control("flags")?;
                    let count = control("operand count")?;

                    let expected = op.operand_count();
                    if expected as u64 != count {
                        return Err(EvalError::OperandCountMismatch {
                            op,
                            expected,
                            got: count,
                        });
                    }
                    if stack.len() < expected {
                        return Err(EvalError::MissingOperands {
                            expected: count,
                            got: stack.len(),
                        });
                    }

                    let mut operands = [StagedOperand::Literal(0); MAX_OPERANDS];
                    for (slot, popped) in operands
                        .iter_mut()
                        .zip(stack.split_off(stack.len() - expected))
                    {
                        *slot = match popped {
                            Slot::Literal(v) => StagedOperand::Literal(v),
                            Slot::Staged(idx) => StagedOperand::Expr(idx),
                        };
                    }

                    let idx = staged.len();
                    staged.push(StagedExpr {
                        op,
                        size: size as usize,
                        flags: flags as u32,
                        operands,
                    });
                    stack.push(Slot::Staged(idx));
                }
            }
        }

        let mut leftovers = Vec::with_capacity(stack.len());
        for (position, slot) in stack.into_iter().enumerate() {
            match slot {
                Slot::Staged(idx) => leftovers.push(idx),
                Slot::Literal(value) => {
                    // A leftover literal has no consuming instruction; the
                    // generator produced a program that would append a
                    // nonsense handle to the block.
                    return Err(EvalError::BareOperand { position, value });
                }
            }
        }
        Ok((staged, leftovers))
    }
}

/// Builder for patch token programs, written the way the stack machine reads
/// them: push the operands of an expression first, then close it with
/// [`PatchProgram::instruction`], which appends the three control operands
/// and the instruction token itself.
///
/// ```
/// use deobfu::il::Op;
/// use deobfu::patch::PatchProgram;
///
/// let mut p = PatchProgram::new();
/// p.operand(0x11c0).instruction(Op::ConstPtr, 8, 0);
/// p.instruction(Op::Call, 8, 0);
/// let patch = p.into_patch(5);
/// assert!(patch.check().is_ok());
/// ```
#[derive(Default, Debug)]
pub struct PatchProgram {
    tokens: Vec<Token>,
}

impl PatchProgram {
    pub fn new() -> Self {
        Default::default()
    }

    /// Push one literal operand.
    pub fn operand(&mut self, value: u64) -> &mut Self {
        self.tokens.push(Token::Operand(value));
        self
    }

    /// Close an expression: append the operand count (from the static
    /// table), flags, and size operands, then the instruction token. The
    /// expression's operands must already be on the stack.
    pub fn instruction(&mut self, op: Op, size: usize, flags: u32) -> &mut Self {
        self.operand(op.operand_count() as u64);
        self.operand(flags as u64);
        self.operand(size as u64);
        self.tokens.push(Token::Instruction(op));
        self
    }

    pub fn into_patch(self, size: u64) -> Patch {
        Patch {
            size,
            tokens: self.tokens,
        }
    }
}

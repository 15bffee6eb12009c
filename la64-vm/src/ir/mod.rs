//! Intermediate representation produced by the translator.
//!
//! A translation block is an ordered list of `IrOp`s over a small operand
//! model: guest registers, immediates and block-local temporaries. Every
//! guest instruction starts with an `InsnStart` marker so a backend can
//! attribute faults and retired-instruction counts to the right PC.
//!
//! The translator talks to a code generator only through `Backend`
//! (`new_temporary`, `emit`, `finalize_block`). `IrBuilder` is the in-tree
//! backend: it records the ops into an `IrBlock`, which `interp::execute`
//! runs against a `CpuState`.

pub mod interp;

use crate::cpu::Exception;
use crate::helpers::Helper;
use std::fmt;

/// Block-local temporary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Temp(pub u32);

/// Readable operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Gpr(u8),
    /// Raw 64-bit FP register contents
    Fpr(u8),
    /// Condition flag, reads as 0 or 1
    Fcc(u8),
    Imm(u64),
    Temp(Temp),
}

/// Writable location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Place {
    /// Writes to r0 are discarded
    Gpr(u8),
    Fpr(u8),
    /// Stores `value != 0`
    Fcc(u8),
    Temp(Temp),
}

impl From<Place> for Operand {
    fn from(place: Place) -> Self {
        match place {
            Place::Gpr(r) => Operand::Gpr(r),
            Place::Fpr(r) => Operand::Fpr(r),
            Place::Fcc(r) => Operand::Fcc(r),
            Place::Temp(t) => Operand::Temp(t),
        }
    }
}

impl From<Temp> for Operand {
    fn from(temp: Temp) -> Self {
        Operand::Temp(temp)
    }
}

impl From<Temp> for Place {
    fn from(temp: Temp) -> Self {
        Place::Temp(temp)
    }
}

/// Operation width. `W32` works on the low 32 bits of each input and
/// sign-extends the 32-bit result to 64 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    W32,
    W64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Nor,
    Andn,
    Orn,
    /// Shift amount taken modulo the width
    Shl,
    Shr,
    Sar,
    Rotr,
    Mul,
    /// High half of the signed product
    MulHs,
    /// High half of the unsigned product
    MulHu,
    /// Division by zero and MIN / -1 divide by 1 instead
    Div,
    DivU,
    Rem,
    RemU,
    /// `b == 0 ? 0 : a`
    MaskEqz,
    /// `b != 0 ? 0 : a`
    MaskNez,
}

/// Unary bit operations. Under `Width::W32` the whole-value forms act on
/// the low word only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnOp {
    Clz,
    Ctz,
    Clo,
    Cto,
    /// Byte swap within each halfword
    RevbH,
    /// Byte swap within each word
    RevbW,
    Revb,
    /// Halfword swap within each word
    RevhW,
    Revh,
    /// Bit reversal within each byte
    BitrevB,
    Bitrev,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Ge,
    Ltu,
    Geu,
}

impl Cond {
    pub fn eval(self, a: u64, b: u64) -> bool {
        match self {
            Cond::Eq => a == b,
            Cond::Ne => a != b,
            Cond::Lt => (a as i64) < (b as i64),
            Cond::Ge => (a as i64) >= (b as i64),
            Cond::Ltu => a < b,
            Cond::Geu => a >= b,
        }
    }
}

/// Read-modify-write operator of an atomic memory op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RmwOp {
    Swap,
    Add,
    And,
    Or,
    Xor,
    Max,
    Min,
    MaxU,
    MinU,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IrOp {
    /// Start of the guest instruction `insn` at `pc`.
    InsnStart { pc: u64, insn: u32 },
    Mov { dst: Place, src: Operand },
    Binary { op: BinOp, width: Width, dst: Place, a: Operand, b: Operand },
    Unary { op: UnOp, width: Width, dst: Place, src: Operand },
    /// `dst = cond(a, b) as u64`
    SetCond { cond: Cond, dst: Place, a: Operand, b: Operand },
    /// `dst = test != 0 ? if_true : if_false`
    Select { dst: Place, test: Operand, if_true: Operand, if_false: Operand },
    /// Bit field `[lsb, lsb + len)` of `src`, zero- or sign-extended.
    Extract { dst: Place, src: Operand, lsb: u8, len: u8, signed: bool },
    /// `base` with bits `[lsb, lsb + len)` replaced by the low bits of `field`.
    Deposit { dst: Place, base: Operand, field: Operand, lsb: u8, len: u8 },

    /// Guest virtual load of `size` bytes.
    Load { dst: Place, addr: Operand, size: u8, signed: bool },
    /// Guest virtual store of the low `size` bytes of `src`.
    Store { src: Operand, addr: Operand, size: u8 },
    /// LL: load and set the LL bit.
    LoadLinked { dst: Place, addr: Operand, size: u8 },
    /// SC: store if the LL bit is still set; `dst` receives 1 or 0.
    StoreCond { dst: Place, addr: Operand, src: Operand, size: u8 },
    /// AM*: `dst` receives the old memory value.
    AtomicRmw { op: RmwOp, dst: Place, addr: Operand, src: Operand, size: u8 },
    Fence,

    /// Runtime helper; `dst` receives the helper's return value.
    Call { helper: Helper, dst: Option<Place>, args: Vec<Operand> },
    /// Raise `cause` at the current instruction, with an optional BADV.
    Raise { cause: Exception, badv: Option<u64> },
    /// Raise `cause` at the current instruction unless `cond(a, b)` holds.
    Check { cond: Cond, a: Operand, b: Operand, cause: Exception },

    /// Leave the block with a static next PC.
    Goto { target: u64 },
    /// Leave the block with a computed next PC.
    GotoIndirect { target: Operand },
    /// Two-way exit.
    BrCond { cond: Cond, a: Operand, b: Operand, taken: u64, not_taken: u64 },
    /// Leave the block; a helper already set the next PC.
    ExitTb,
}

impl IrOp {
    /// Ends the block.
    pub fn is_exit(&self) -> bool {
        matches!(
            self,
            IrOp::Goto { .. }
                | IrOp::GotoIndirect { .. }
                | IrOp::BrCond { .. }
                | IrOp::ExitTb
                | IrOp::Raise { .. }
        )
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Gpr(r) => write!(f, "r{}", r),
            Operand::Fpr(r) => write!(f, "f{}", r),
            Operand::Fcc(r) => write!(f, "fcc{}", r),
            Operand::Imm(v) => write!(f, "{:#x}", v),
            Operand::Temp(t) => write!(f, "t{}", t.0),
        }
    }
}

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Operand::from(*self).fmt(f)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Backend interface
// ═══════════════════════════════════════════════════════════════════════════

/// Code-generation backend the translator emits into.
///
/// Ops must be executed in emission order.
pub trait Backend {
    type Output;

    fn new_temporary(&mut self) -> Temp;

    fn emit(&mut self, op: IrOp);

    /// Seal the current block and hand back its compiled form.
    fn finalize_block(&mut self) -> Self::Output;
}

/// Recorded translation block.
#[derive(Debug, Clone, PartialEq)]
pub struct IrBlock {
    /// Guest virtual PC of the first instruction
    pub pc: u64,
    /// Physical address of the first instruction
    pub phys_pc: u64,
    /// Mode flags the block was translated under
    pub flags: u32,
    pub ops: Vec<IrOp>,
    pub num_temps: u32,
    /// Guest instructions in the block
    pub icount: u32,
}

impl IrBlock {
    /// Guest bytes covered by the block.
    pub fn byte_len(&self) -> u64 {
        self.icount as u64 * 4
    }

    /// Human-readable listing, one op per line.
    pub fn dump(&self) -> String {
        let mut out = format!(
            "block pc={:#x} phys={:#x} flags={:#x} insns={}\n",
            self.pc, self.phys_pc, self.flags, self.icount
        );
        for op in &self.ops {
            out.push_str(&format!("  {:?}\n", op));
        }
        out
    }
}

/// Backend that records ops into an `IrBlock`.
#[derive(Debug)]
pub struct IrBuilder {
    pc: u64,
    phys_pc: u64,
    flags: u32,
    ops: Vec<IrOp>,
    next_temp: u32,
    icount: u32,
}

impl IrBuilder {
    pub fn new(pc: u64, phys_pc: u64, flags: u32) -> Self {
        Self {
            pc,
            phys_pc,
            flags,
            ops: Vec::new(),
            next_temp: 0,
            icount: 0,
        }
    }

    pub fn ops(&self) -> &[IrOp] {
        &self.ops
    }
}

impl Backend for IrBuilder {
    type Output = IrBlock;

    fn new_temporary(&mut self) -> Temp {
        let temp = Temp(self.next_temp);
        self.next_temp += 1;
        temp
    }

    fn emit(&mut self, op: IrOp) {
        if matches!(op, IrOp::InsnStart { .. }) {
            self.icount += 1;
        }
        self.ops.push(op);
    }

    fn finalize_block(&mut self) -> IrBlock {
        let block = IrBlock {
            pc: self.pc,
            phys_pc: self.phys_pc,
            flags: self.flags,
            ops: std::mem::take(&mut self.ops),
            num_temps: self.next_temp,
            icount: self.icount,
        };
        self.next_temp = 0;
        self.icount = 0;
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_counts_instructions_and_temps() {
        let mut b = IrBuilder::new(0x1000, 0x1000, 0);
        let t0 = b.new_temporary();
        let t1 = b.new_temporary();
        assert_ne!(t0, t1);

        b.emit(IrOp::InsnStart { pc: 0x1000, insn: 0 });
        b.emit(IrOp::Mov { dst: t0.into(), src: Operand::Imm(1) });
        b.emit(IrOp::InsnStart { pc: 0x1004, insn: 0 });
        b.emit(IrOp::Goto { target: 0x1008 });

        let block = b.finalize_block();
        assert_eq!(block.icount, 2);
        assert_eq!(block.num_temps, 2);
        assert_eq!(block.byte_len(), 8);
        assert!(block.ops.last().is_some_and(IrOp::is_exit));
        assert!(block.dump().contains("Goto"));
    }

    #[test]
    fn test_cond_eval_signedness() {
        let minus_one = u64::MAX;
        assert!(Cond::Lt.eval(minus_one, 0));
        assert!(!Cond::Ltu.eval(minus_one, 0));
        assert!(Cond::Geu.eval(minus_one, 0));
        assert!(Cond::Ge.eval(5, 5));
    }

    #[test]
    fn test_operand_display() {
        assert_eq!(Operand::Gpr(4).to_string(), "r4");
        assert_eq!(Place::Temp(Temp(3)).to_string(), "t3");
        assert_eq!(Operand::Imm(16).to_string(), "0x10");
    }
}

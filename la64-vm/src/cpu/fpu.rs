//! Floating-point glue.
//!
//! IEEE arithmetic is done by `rustc_apfloat`; every operation hands back a
//! `StatusAnd` whose status is folded into FCSR0 by `CpuState::fp_fold`.
//! Single-precision values live in the low half of an FPR with the high half
//! set to all ones.

use super::CpuState;
use super::types::Exception;
use rustc_apfloat::ieee::{Double, Single};
use rustc_apfloat::{Float, FloatConvert, Round, Status, StatusAnd};
use std::cmp::Ordering;

// FCSR0 layout
pub const FCSR_ENABLES_SHIFT: u32 = 0;
pub const FCSR_RM_SHIFT: u32 = 8;
pub const FCSR_FLAGS_SHIFT: u32 = 16;
pub const FCSR_CAUSE_SHIFT: u32 = 24;
pub const FCSR_FIELD: u32 = 0x1f;

pub const FP_INEXACT: u32 = 1 << 0;
pub const FP_UNDERFLOW: u32 = 1 << 1;
pub const FP_OVERFLOW: u32 = 1 << 2;
pub const FP_DIV0: u32 = 1 << 3;
pub const FP_INVALID: u32 = 1 << 4;

/// Writable bits of FCSR0..3 as seen through MOVGR2FCSR/MOVFCSR2GR.
pub const FCSR_MASK: [u32; 4] = [0x1f1f_031f, 0x0000_001f, 0x1f1f_0000, 0x0000_0300];

const NANBOX: u64 = 0xffff_ffff_0000_0000;
const DEFAULT_NAN_S: u64 = 0x7fc0_0000;
const DEFAULT_NAN_D: u64 = 0x7ff8_0000_0000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FpFmt {
    S,
    D,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FBinOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
    MaxA,
    MinA,
    Scaleb,
    CopySign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FUnOp {
    Abs,
    Neg,
    Sqrt,
    Recip,
    Rsqrt,
    Logb,
    Rint,
    Mov,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FmaKind {
    MAdd,
    MSub,
    NMAdd,
    NMSub,
}

/// Integer width of FTINT/FFINT operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntWidth {
    W,
    L,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FCvtKind {
    /// fcvt.s.d
    SingleFromDouble,
    /// fcvt.d.s
    DoubleFromSingle,
    /// ffint.{s,d}.{w,l}
    FromInt { to: FpFmt, from: IntWidth },
    /// ftint[rm|rp|rz|rne].{w,l}.{s,d}; `None` uses FCSR0.RM
    ToInt {
        to: IntWidth,
        from: FpFmt,
        round: Option<RoundMode>,
    },
}

/// FCSR0.RM encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoundMode {
    NearestEven,
    Zero,
    Up,
    Down,
}

impl RoundMode {
    pub fn from_fcsr(fcsr0: u32) -> Self {
        match (fcsr0 >> FCSR_RM_SHIFT) & 3 {
            0 => RoundMode::NearestEven,
            1 => RoundMode::Zero,
            2 => RoundMode::Up,
            _ => RoundMode::Down,
        }
    }

    pub fn to_apfloat(self) -> Round {
        match self {
            RoundMode::NearestEven => Round::NearestTiesToEven,
            RoundMode::Zero => Round::TowardZero,
            RoundMode::Up => Round::TowardPositive,
            RoundMode::Down => Round::TowardNegative,
        }
    }
}

pub fn status_to_flags(status: Status) -> u32 {
    let mut flags = 0;
    if status.intersects(Status::INEXACT) {
        flags |= FP_INEXACT;
    }
    if status.intersects(Status::UNDERFLOW) {
        flags |= FP_UNDERFLOW;
    }
    if status.intersects(Status::OVERFLOW) {
        flags |= FP_OVERFLOW;
    }
    if status.intersects(Status::DIV_BY_ZERO) {
        flags |= FP_DIV0;
    }
    if status.intersects(Status::INVALID_OP) {
        flags |= FP_INVALID;
    }
    flags
}

impl CpuState {
    pub fn fp_round(&self) -> RoundMode {
        RoundMode::from_fcsr(self.fcsr0)
    }

    /// Record `status` in FCSR0.Cause. Enabled causes raise FPE and leave
    /// Flags untouched; otherwise the causes accumulate into Flags.
    pub fn fp_fold(&mut self, status: Status) -> Result<(), Exception> {
        let cause = status_to_flags(status);
        self.fcsr0 = (self.fcsr0 & !(FCSR_FIELD << FCSR_CAUSE_SHIFT)) | (cause << FCSR_CAUSE_SHIFT);
        if cause == 0 {
            return Ok(());
        }
        let enables = (self.fcsr0 >> FCSR_ENABLES_SHIFT) & FCSR_FIELD;
        if enables & cause != 0 {
            return Err(Exception::Fpe);
        }
        self.fcsr0 |= cause << FCSR_FLAGS_SHIFT;
        Ok(())
    }

    pub fn read_fcsr(&self, index: usize) -> u32 {
        self.fcsr0 & FCSR_MASK[index & 3]
    }

    pub fn write_fcsr(&mut self, index: usize, value: u32) {
        let mask = FCSR_MASK[index & 3];
        self.fcsr0 = (self.fcsr0 & !mask) | (value & mask);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Format plumbing
// ═══════════════════════════════════════════════════════════════════════════

fn nanbox(bits: u64) -> u64 {
    (bits & 0xffff_ffff) | NANBOX
}

fn unpack<F: Float>(bits: u64) -> F {
    F::from_bits((bits as u128) & ((1u128 << F::BITS) - 1))
}

fn pack<F: Float>(value: F) -> u64 {
    value.to_bits() as u64
}

fn default_nan(fmt: FpFmt) -> u64 {
    match fmt {
        FpFmt::S => DEFAULT_NAN_S,
        FpFmt::D => DEFAULT_NAN_D,
    }
}

/// Canonicalise NaN results and apply the single-precision box.
fn finish<F: Float>(fmt: FpFmt, value: F) -> u64 {
    let bits = if value.is_nan() {
        default_nan(fmt)
    } else {
        pack(value)
    };
    match fmt {
        FpFmt::S => nanbox(bits),
        FpFmt::D => bits,
    }
}

fn sign_bit<F: Float>() -> u64 {
    1u64 << (F::BITS - 1)
}

fn nan_status<F: Float>(a: F, b: F) -> Status {
    if a.is_signaling() || b.is_signaling() {
        Status::INVALID_OP
    } else {
        Status::OK
    }
}

macro_rules! dispatch_fmt {
    ($fmt:expr, $func:ident ( $($arg:expr),* )) => {
        match $fmt {
            FpFmt::S => $func::<Single>(FpFmt::S, $($arg),*),
            FpFmt::D => $func::<Double>(FpFmt::D, $($arg),*),
        }
    };
}

// ═══════════════════════════════════════════════════════════════════════════
// Operations
// ═══════════════════════════════════════════════════════════════════════════

pub fn binary(op: FBinOp, fmt: FpFmt, a: u64, b: u64, rm: RoundMode) -> StatusAnd<u64> {
    dispatch_fmt!(fmt, binary_impl(op, a, b, rm))
}

fn binary_impl<F: Float>(fmt: FpFmt, op: FBinOp, a: u64, b: u64, rm: RoundMode) -> StatusAnd<u64> {
    let round = rm.to_apfloat();
    let (x, y) = (unpack::<F>(a), unpack::<F>(b));
    let result = match op {
        FBinOp::Add => x.add_r(y, round),
        FBinOp::Sub => x.sub_r(y, round),
        FBinOp::Mul => x.mul_r(y, round),
        FBinOp::Div => x.div_r(y, round),
        FBinOp::Max | FBinOp::Min | FBinOp::MaxA | FBinOp::MinA => {
            let status = nan_status(x, y);
            let value = min_max(op, x, y);
            return StatusAnd {
                status,
                value: finish(fmt, value),
            };
        }
        FBinOp::Scaleb => {
            let exp = match fmt {
                FpFmt::S => b as u32 as i32,
                FpFmt::D => (b as i64).clamp(i32::MIN as i64, i32::MAX as i64) as i32,
            };
            let status = if x.is_signaling() {
                Status::INVALID_OP
            } else {
                Status::OK
            };
            StatusAnd {
                status,
                value: x.scalbn_r(exp, round),
            }
        }
        FBinOp::CopySign => {
            let sign = sign_bit::<F>();
            let bits = (pack(x) & !sign) | (pack(y) & sign);
            let bits = match fmt {
                FpFmt::S => nanbox(bits),
                FpFmt::D => bits,
            };
            return StatusAnd {
                status: Status::OK,
                value: bits,
            };
        }
    };
    result.map(|v| finish(fmt, v))
}

/// IEEE 754-2008 maxNum/minNum and their magnitude variants: a quiet NaN
/// operand loses to a number.
fn min_max<F: Float>(op: FBinOp, x: F, y: F) -> F {
    if x.is_nan() {
        return y;
    }
    if y.is_nan() {
        return x;
    }
    let (cx, cy) = match op {
        FBinOp::MaxA | FBinOp::MinA => (x.abs(), y.abs()),
        _ => (x, y),
    };
    let want_max = matches!(op, FBinOp::Max | FBinOp::MaxA);
    match cx.partial_cmp(&cy) {
        Some(Ordering::Greater) => {
            if want_max { x } else { y }
        }
        Some(Ordering::Less) => {
            if want_max { y } else { x }
        }
        _ => {
            // Equal magnitude: prefer +0 for max, -0 for min
            if x.is_negative() == want_max { y } else { x }
        }
    }
}

pub fn unary(op: FUnOp, fmt: FpFmt, a: u64, rm: RoundMode) -> StatusAnd<u64> {
    match (op, fmt) {
        (FUnOp::Sqrt, FpFmt::S) => sqrt_single(a, rm),
        (FUnOp::Sqrt, FpFmt::D) => sqrt_double(a, rm),
        (FUnOp::Rsqrt, _) => {
            let root = unary(FUnOp::Sqrt, fmt, a, rm);
            let recip = unary(FUnOp::Recip, fmt, root.value, rm);
            StatusAnd {
                status: root.status | recip.status,
                value: recip.value,
            }
        }
        _ => dispatch_fmt!(fmt, unary_impl(op, a, rm)),
    }
}

fn unary_impl<F: Float>(fmt: FpFmt, op: FUnOp, a: u64, rm: RoundMode) -> StatusAnd<u64> {
    let x = unpack::<F>(a);
    let boxed = |bits: u64| match fmt {
        FpFmt::S => nanbox(bits),
        FpFmt::D => bits,
    };
    let ok = |value: u64| StatusAnd {
        status: Status::OK,
        value,
    };
    match op {
        FUnOp::Abs => ok(boxed(pack(x) & !sign_bit::<F>())),
        FUnOp::Neg => ok(boxed(pack(x) ^ sign_bit::<F>())),
        FUnOp::Mov => ok(match fmt {
            FpFmt::S => nanbox(a),
            FpFmt::D => a,
        }),
        FUnOp::Recip => {
            let one = F::from_u128(1).value;
            one.div_r(x, rm.to_apfloat()).map(|v| finish(fmt, v))
        }
        FUnOp::Rint => x.round_to_integral(rm.to_apfloat()).map(|v| finish(fmt, v)),
        FUnOp::Logb => {
            if x.is_nan() {
                let status = nan_status(x, x);
                StatusAnd {
                    status,
                    value: boxed(default_nan(fmt)),
                }
            } else if x.is_infinite() {
                ok(boxed(pack(x.abs())))
            } else if x.is_zero() {
                StatusAnd {
                    status: Status::DIV_BY_ZERO,
                    value: boxed(pack(-F::INFINITY)),
                }
            } else {
                F::from_i128(x.ilogb() as i128).map(|v| finish(fmt, v))
            }
        }
        FUnOp::Sqrt | FUnOp::Rsqrt => ok(boxed(default_nan(fmt))),
    }
}

/// Square root on the host, corrected to the requested rounding direction
/// with an exact residual. The host result is correctly rounded to nearest.
fn sqrt_double(a: u64, rm: RoundMode) -> StatusAnd<u64> {
    let x = f64::from_bits(a);
    if let Some(special) = sqrt_special(x.is_nan(), unpack::<Double>(a).is_signaling(), x, FpFmt::D) {
        return special;
    }
    let mut r = x.sqrt();
    let residual = (-r).mul_add(r, x);
    if residual != 0.0 {
        r = adjust_root(r, residual, rm);
    }
    StatusAnd {
        status: if residual != 0.0 { Status::INEXACT } else { Status::OK },
        value: r.to_bits(),
    }
}

fn sqrt_single(a: u64, rm: RoundMode) -> StatusAnd<u64> {
    let x = f32::from_bits(a as u32);
    if let Some(special) = sqrt_special(
        x.is_nan(),
        unpack::<Single>(a).is_signaling(),
        x as f64,
        FpFmt::S,
    ) {
        return special;
    }
    let mut r = (x as f64).sqrt() as f32;
    // Exact in f64: r has 24 significant bits
    let residual = x as f64 - (r as f64) * (r as f64);
    if residual != 0.0 {
        r = match rm {
            RoundMode::NearestEven => r,
            RoundMode::Zero | RoundMode::Down if residual < 0.0 => {
                f32::from_bits(r.to_bits() - 1)
            }
            RoundMode::Up if residual > 0.0 => f32::from_bits(r.to_bits() + 1),
            _ => r,
        };
    }
    StatusAnd {
        status: if residual != 0.0 { Status::INEXACT } else { Status::OK },
        value: nanbox(r.to_bits() as u64),
    }
}

fn adjust_root(r: f64, residual: f64, rm: RoundMode) -> f64 {
    match rm {
        RoundMode::NearestEven => r,
        RoundMode::Zero | RoundMode::Down if residual < 0.0 => f64::from_bits(r.to_bits() - 1),
        RoundMode::Up if residual > 0.0 => f64::from_bits(r.to_bits() + 1),
        _ => r,
    }
}

fn sqrt_special(is_nan: bool, signaling: bool, x: f64, fmt: FpFmt) -> Option<StatusAnd<u64>> {
    let boxed = |bits: u64| match fmt {
        FpFmt::S => nanbox(bits),
        FpFmt::D => bits,
    };
    if is_nan {
        let status = if signaling { Status::INVALID_OP } else { Status::OK };
        return Some(StatusAnd {
            status,
            value: boxed(default_nan(fmt)),
        });
    }
    if x == 0.0 || x == f64::INFINITY {
        let bits = match fmt {
            FpFmt::S => (x as f32).to_bits() as u64,
            FpFmt::D => x.to_bits(),
        };
        return Some(StatusAnd {
            status: Status::OK,
            value: boxed(bits),
        });
    }
    if x < 0.0 {
        return Some(StatusAnd {
            status: Status::INVALID_OP,
            value: boxed(default_nan(fmt)),
        });
    }
    None
}

pub fn mul_add(kind: FmaKind, fmt: FpFmt, a: u64, b: u64, c: u64, rm: RoundMode) -> StatusAnd<u64> {
    dispatch_fmt!(fmt, mul_add_impl(kind, a, b, c, rm))
}

fn mul_add_impl<F: Float>(
    fmt: FpFmt,
    kind: FmaKind,
    a: u64,
    b: u64,
    c: u64,
    rm: RoundMode,
) -> StatusAnd<u64> {
    let (x, y, mut z) = (unpack::<F>(a), unpack::<F>(b), unpack::<F>(c));
    if matches!(kind, FmaKind::MSub | FmaKind::NMSub) && !z.is_nan() {
        z = -z;
    }
    let result = x.mul_add_r(y, z, rm.to_apfloat());
    let negate = matches!(kind, FmaKind::NMAdd | FmaKind::NMSub);
    result.map(|v| {
        let v = if negate && !v.is_nan() { -v } else { v };
        finish(fmt, v)
    })
}

/// Defined FCMP condition encodings.
pub fn fcmp_cond_valid(cond: u8) -> bool {
    matches!(cond, 0x00..=0x11 | 0x14 | 0x15 | 0x18 | 0x19)
}

/// FCMP.cond: bit0 of `cond` selects the signaling form; the remaining bits
/// pick LT / EQ / UN / (GT|LT). Returns `None` for reserved conditions.
pub fn compare(cond: u8, fmt: FpFmt, a: u64, b: u64) -> Option<StatusAnd<bool>> {
    const LT: u8 = 1;
    const EQ: u8 = 2;
    const UN: u8 = 4;
    const NE: u8 = 8;

    if !fcmp_cond_valid(cond) {
        return None;
    }
    let signaling = cond & 1 != 0;
    let flags = cond >> 1;

    let (ordering, any_nan, snan) = match fmt {
        FpFmt::S => {
            let (x, y) = (unpack::<Single>(a), unpack::<Single>(b));
            (x.partial_cmp(&y), x.is_nan() || y.is_nan(), x.is_signaling() || y.is_signaling())
        }
        FpFmt::D => {
            let (x, y) = (unpack::<Double>(a), unpack::<Double>(b));
            (x.partial_cmp(&y), x.is_nan() || y.is_nan(), x.is_signaling() || y.is_signaling())
        }
    };
    let status = if snan || (signaling && any_nan) {
        Status::INVALID_OP
    } else {
        Status::OK
    };
    let value = match ordering {
        None => flags & UN != 0,
        Some(Ordering::Less) => flags & (LT | NE) != 0,
        Some(Ordering::Equal) => flags & EQ != 0,
        Some(Ordering::Greater) => flags & NE != 0,
    };
    Some(StatusAnd { status, value })
}

/// FCLASS result bits.
pub fn classify(fmt: FpFmt, a: u64) -> u64 {
    match fmt {
        FpFmt::S => classify_impl(unpack::<Single>(a)),
        FpFmt::D => classify_impl(unpack::<Double>(a)),
    }
}

fn classify_impl<F: Float>(x: F) -> u64 {
    if x.is_signaling() {
        return 1 << 0;
    }
    if x.is_nan() {
        return 1 << 1;
    }
    let base = if x.is_negative() { 2 } else { 6 };
    let offset = if x.is_infinite() {
        0
    } else if x.is_zero() {
        3
    } else if x.is_denormal() {
        2
    } else {
        1
    };
    1 << (base + offset)
}

pub fn convert(kind: FCvtKind, a: u64, rm: RoundMode) -> StatusAnd<u64> {
    let mut loses_info = false;
    match kind {
        FCvtKind::SingleFromDouble => {
            let x = unpack::<Double>(a);
            let r: StatusAnd<Single> = x.convert_r(rm.to_apfloat(), &mut loses_info);
            r.map(|v| finish(FpFmt::S, v))
        }
        FCvtKind::DoubleFromSingle => {
            let x = unpack::<Single>(a);
            let r: StatusAnd<Double> = x.convert_r(rm.to_apfloat(), &mut loses_info);
            r.map(|v| finish(FpFmt::D, v))
        }
        FCvtKind::FromInt { to, from } => {
            let input = match from {
                IntWidth::W => a as u32 as i32 as i128,
                IntWidth::L => a as i64 as i128,
            };
            match to {
                FpFmt::S => Single::from_i128_r(input, rm.to_apfloat()).map(|v| finish(FpFmt::S, v)),
                FpFmt::D => Double::from_i128_r(input, rm.to_apfloat()).map(|v| finish(FpFmt::D, v)),
            }
        }
        FCvtKind::ToInt { to, from, round } => {
            let rm = round.unwrap_or(rm);
            match from {
                FpFmt::S => to_int(unpack::<Single>(a), to, rm),
                FpFmt::D => to_int(unpack::<Double>(a), to, rm),
            }
        }
    }
}

/// Saturating conversion: NaN gives 0, out-of-range values the bound of
/// matching sign, both with the invalid flag.
fn to_int<F: Float>(x: F, to: IntWidth, rm: RoundMode) -> StatusAnd<u64> {
    let (width, min, max) = match to {
        IntWidth::W => (32, i32::MIN as i128, i32::MAX as i128),
        IntWidth::L => (64, i64::MIN as i128, i64::MAX as i128),
    };
    let pack_int = |v: i128| -> u64 {
        match to {
            IntWidth::W => v as i32 as i64 as u64,
            IntWidth::L => v as i64 as u64,
        }
    };
    if x.is_nan() {
        return StatusAnd {
            status: Status::INVALID_OP,
            value: 0,
        };
    }
    let mut is_exact = false;
    let r = x.to_i128_r(width, rm.to_apfloat(), &mut is_exact);
    if r.status.intersects(Status::INVALID_OP) {
        let bound = if x.is_negative() { min } else { max };
        return StatusAnd {
            status: Status::INVALID_OP,
            value: pack_int(bound),
        };
    }
    let status = if is_exact { Status::OK } else { Status::INEXACT };
    StatusAnd {
        status,
        value: pack_int(r.value.clamp(min, max)),
    }
}

//! # Gw — Modular Arithmetic Engine
//!
//! The contract every exponentiation task is written against: modular
//! square/multiply with a fused mul-by-small-constant slot, a
//! "start next FFT" pipelining hint, and a *careful* variant used at
//! numerically sensitive boundaries and inside all check arithmetic.
//!
//! The production backends for this contract are FFT multipliers (IBDWT
//! style) whose fast path can, very rarely, produce a roundoff error when
//! the number is close to the FFT limit. The engine here reproduces the
//! contract over GMP (`rug::Integer`): both paths are exact, the fast path
//! counts transforms and honors a deterministic fault plan so the
//! error-recovery machinery above it can be exercised, and the careful path
//! is immune to injected faults just as a careful multiplier is immune to
//! fast-path roundoff.
//!
//! ## Options
//!
//! - `MULBYCONST`: fold an extra multiplication by the configured small
//!   constant (at most `maxmulbyconst`) into the operation.
//! - `STARTNEXTFFT`: leave the result in a transform-friendly form. Callers
//!   must not pass it on the final operation of a chain or right before a
//!   value is recorded.

use rug::integer::Order;
use rug::ops::RemRoundingAssign;
use rug::Integer;

use crate::input::InputNum;

/// Fold a multiplication by the configured small constant into the op.
pub const MULBYCONST: u32 = 1 << 0;
/// Result stays in transform form; cheaper to feed into the next op.
pub const STARTNEXTFFT: u32 = 1 << 1;

/// `STARTNEXTFFT` if the condition holds, else no options.
#[inline]
pub fn startnextfft_if(cond: bool) -> u32 {
    if cond {
        STARTNEXTFFT
    } else {
        0
    }
}

/// Errors surfaced by the arithmetic engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GwError {
    /// Setup rejected the modulus (zero, negative, or even when odd required).
    SetupFailed { reason: &'static str },
    /// The mul-by-const slot was asked to hold a constant above the limit.
    ConstTooLarge { value: u32, limit: u32 },
}

impl std::fmt::Display for GwError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GwError::SetupFailed { reason } => write!(f, "arithmetic setup failed: {}", reason),
            GwError::ConstTooLarge { value, limit } => {
                write!(f, "mul-by-const {} exceeds limit {}", value, limit)
            }
        }
    }
}

impl std::error::Error for GwError {}

/// Bits of payload one simulated FFT word carries.
const BITS_PER_WORD: u32 = 18;

/// A residue in the representation the fast path works in, cheap to
/// re-inject without a full conversion from decimal limbs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SerializedGwNum(Vec<u8>);

impl SerializedGwNum {
    pub fn from_integer(x: &Integer) -> Self {
        SerializedGwNum(x.to_digits::<u8>(Order::Lsf))
    }

    pub fn to_integer(&self) -> Integer {
        Integer::from_digits(&self.0, Order::Lsf)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        SerializedGwNum(bytes)
    }
}

/// Deterministic fault plan: flip one bit of the result of the n-th fast
/// operation. Careful operations never fault, matching the roundoff model.
#[derive(Debug, Clone, Copy)]
struct Fault {
    at_op: u64,
    bit: u32,
}

/// Owns the modulus and the simulated transform geometry. At most one task
/// drives a `GwState` at a time; reconfiguration (base bump, FFT resize)
/// means dropping it and calling [`GwState::setup`] again.
pub struct GwState {
    n: Integer,
    fingerprint: u32,
    pub maxmulbyconst: u32,
    mulbyconst: u32,
    fft_len: u64,
    fft_desc: String,
    near_limit: bool,
    ops: u64,
    carefully_count: u32,
    fault: Option<Fault>,
    roundoff_seen: bool,
}

impl GwState {
    /// Configure arithmetic mod the value of `input`.
    pub fn setup(input: &InputNum, maxmulbyconst: u32) -> Result<GwState, GwError> {
        let n = input.value().clone();
        if n <= 1u32 {
            return Err(GwError::SetupFailed {
                reason: "modulus must exceed 1",
            });
        }
        let bits = n.significant_bits() as u64;
        let mut fft_len = 64u64;
        while fft_len * (BITS_PER_WORD as u64) < bits {
            fft_len *= 2;
        }
        let near_limit = bits * 100 >= fft_len * BITS_PER_WORD as u64 * 98;
        Ok(GwState {
            fingerprint: input.fingerprint(),
            fft_desc: format!("FFT({})", fft_len),
            n,
            maxmulbyconst,
            mulbyconst: 1,
            fft_len,
            near_limit,
            ops: 0,
            carefully_count: 0,
            fault: None,
            roundoff_seen: false,
        })
    }

    pub fn n(&self) -> &Integer {
        &self.n
    }

    pub fn fingerprint(&self) -> u32 {
        self.fingerprint
    }

    pub fn fft_len(&self) -> u64 {
        self.fft_len
    }

    pub fn fft_description(&self) -> &str {
        &self.fft_desc
    }

    /// Transform count since setup; two transforms per multiplication.
    pub fn ops(&self) -> u64 {
        self.ops / 2
    }

    /// Whether the modulus sits close enough to the FFT limit that per-op
    /// roundoff checking is worth forcing.
    pub fn near_fft_limit(&self) -> bool {
        self.near_limit
    }

    /// True once any fast operation reported excessive roundoff.
    pub fn pop_roundoff(&mut self) -> bool {
        std::mem::take(&mut self.roundoff_seen)
    }

    /// Set the constant folded in by [`MULBYCONST`].
    pub fn set_mulbyconst(&mut self, c: u32) -> Result<(), GwError> {
        if c > self.maxmulbyconst {
            return Err(GwError::ConstTooLarge {
                value: c,
                limit: self.maxmulbyconst,
            });
        }
        self.mulbyconst = c;
        Ok(())
    }

    /// Route the next `count` fast operations through the careful path.
    /// Used for the first iterations after a cold start or restart.
    pub fn set_carefully_count(&mut self, count: u32) {
        self.carefully_count = count;
    }

    /// Schedule a single-bit corruption of the `at_op`-th fast operation
    /// from now. Drives the recovery paths in tests; a production FFT
    /// backend produces the same effect by roundoff near the limit.
    pub fn inject_fault(&mut self, at_op: u64, bit: u32) {
        self.fault = Some(Fault {
            at_op: self.ops / 2 + at_op,
            bit,
        });
    }

    fn reduce(&self, x: &mut Integer) {
        x.rem_euc_assign(&self.n);
    }

    fn fast_op(&mut self, x: &mut Integer) {
        self.ops += 2;
        if self.carefully_count > 0 {
            self.carefully_count -= 1;
            return;
        }
        if let Some(f) = self.fault {
            if self.ops / 2 > f.at_op {
                self.fault = None;
                self.roundoff_seen = true;
                x.toggle_bit(f.bit % x.significant_bits().max(1));
            }
        }
    }

    /// x = x^2 mod N, fast path. `STARTNEXTFFT` is advisory here; the
    /// callers' discipline around it is what the production backend needs.
    pub fn square(&mut self, x: &mut Integer, options: u32) {
        x.square_mut();
        if options & MULBYCONST != 0 {
            *x *= self.mulbyconst;
        }
        self.reduce(x);
        self.fast_op(x);
    }

    /// d = s * d mod N, fast path.
    pub fn mul(&mut self, s: &Integer, d: &mut Integer, options: u32) {
        *d *= s;
        if options & MULBYCONST != 0 {
            *d *= self.mulbyconst;
        }
        self.reduce(d);
        self.fast_op(d);
    }

    /// x = x^2 mod N on the careful path.
    pub fn square_carefully(&mut self, x: &mut Integer) {
        x.square_mut();
        self.reduce(x);
        self.ops += 2;
    }

    /// d = s * d mod N on the careful path.
    pub fn mul_carefully(&mut self, s: &Integer, d: &mut Integer) {
        *d *= s;
        self.reduce(d);
        self.ops += 2;
    }

    /// a - b mod N on the careful path.
    pub fn sub_carefully(&mut self, a: &Integer, b: &Integer) -> Integer {
        let mut r = Integer::from(a - b);
        self.reduce(&mut r);
        r
    }

    /// Normalize an externally produced value into a residue.
    pub fn norm(&self, x: &mut Integer) {
        self.reduce(x);
    }
}

/// Low 64 bits of a residue, printed as 16 uppercase hex digits. The
/// standard fast fingerprint of a completed computation.
pub fn res64(x: &Integer) -> String {
    let mut low = Integer::from(x.keep_bits_ref(64));
    if low < 0 {
        low += Integer::from(1u8) << 64;
    }
    format!("{:016X}", low.to_u64_wrapping())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::InputNum;

    fn gw_for(s: &str) -> GwState {
        let input = InputNum::parse(s).unwrap();
        GwState::setup(&input, 5).unwrap()
    }

    #[test]
    fn square_matches_reference() {
        let mut gw = gw_for("3*2^20+1");
        let n = gw.n().clone();
        let mut x = Integer::from(1234567u64);
        let expected = Integer::from(&x * &x) % &n;
        gw.square(&mut x, 0);
        assert_eq!(x, expected);
    }

    #[test]
    fn mulbyconst_folds_constant() {
        let mut gw = gw_for("3*2^20+1");
        gw.set_mulbyconst(5).unwrap();
        let n = gw.n().clone();
        let mut x = Integer::from(98765u64);
        let expected = (Integer::from(&x * &x) * 5u32) % &n;
        gw.square(&mut x, MULBYCONST);
        assert_eq!(x, expected);
    }

    #[test]
    fn const_above_limit_rejected() {
        let mut gw = gw_for("3*2^20+1");
        assert!(matches!(
            gw.set_mulbyconst(6),
            Err(GwError::ConstTooLarge { value: 6, limit: 5 })
        ));
    }

    #[test]
    fn careful_path_ignores_fault() {
        let mut gw = gw_for("3*2^20+1");
        let n = gw.n().clone();
        gw.inject_fault(0, 3);
        let mut x = Integer::from(424242u64);
        let expected = Integer::from(&x * &x) % &n;
        gw.square_carefully(&mut x);
        assert_eq!(x, expected);
        assert!(!gw.pop_roundoff());
    }

    #[test]
    fn fast_path_applies_fault_once() {
        let mut gw = gw_for("3*2^20+1");
        let n = gw.n().clone();
        gw.inject_fault(0, 3);
        let mut x = Integer::from(424242u64);
        let expected = Integer::from(&x * &x) % &n;
        gw.square(&mut x, 0);
        assert_ne!(x, expected, "scheduled fault must corrupt the result");
        assert!(gw.pop_roundoff());
        // Next op is clean again.
        let mut y = Integer::from(3333u64);
        let expected = Integer::from(&y * &y) % &n;
        gw.square(&mut y, 0);
        assert_eq!(y, expected);
    }

    #[test]
    fn carefully_count_shields_fast_ops() {
        let mut gw = gw_for("3*2^20+1");
        let n = gw.n().clone();
        gw.inject_fault(0, 3);
        gw.set_carefully_count(30);
        let mut x = Integer::from(424242u64);
        let expected = Integer::from(&x * &x) % &n;
        gw.square(&mut x, 0);
        assert_eq!(x, expected);
    }

    #[test]
    fn serialized_roundtrip() {
        let x = Integer::from(0x1234_5678_9abc_def0u64);
        let s = SerializedGwNum::from_integer(&x);
        assert_eq!(s.to_integer(), x);
    }

    #[test]
    fn res64_formats_low_bits() {
        let x = Integer::from(0xdeadbeefu64);
        assert_eq!(res64(&x), "00000000DEADBEEF");
        let big = (Integer::from(1u8) << 100) + 7u32;
        assert_eq!(res64(&big), "0000000000000007");
    }
}

//! # Exp — Modular Exponentiation Tasks
//!
//! The single-exponent workhorses, differing in performance/safety
//! tradeoffs:
//!
//! - [`FastExp`]: left-to-right binary squaring with the base folded into
//!   the mul-by-const slot. The fastest option when the base is small.
//! - [`SlowExp`]: every operation on the careful path; used when the base
//!   is a full giant, and for sensitivity-critical preludes and tails.
//! - [`SlidingWindowExp`]: windowed exponentiation of a giant base.
//! - [`MultipointExp`]: exponentiation that stops at a strictly increasing
//!   sequence of checkpoints, invoking a recording callback at each one.
//!   Between points it either squares (base 2), raises by `b^Δ` with a
//!   sliding window (smooth base), or walks exponent bits (explicit
//!   exponent).
//! - [`Product`]: folds a vector of giants into one product, carefully.
//!
//! The first 30 iterations after any cold start run on the careful path;
//! FFT pipelining is suppressed on final iterations and right before a
//! value is recorded.

use rug::ops::Pow;
use rug::Integer;

use crate::file::File;
use crate::gw::{self, GwState, SerializedGwNum, MULBYCONST, STARTNEXTFFT};
use crate::state::TaskState;
use crate::task::{Task, TaskBase, TaskContext, TaskError};

/// Iterations run carefully after a cold start or restart.
pub const CAREFUL_PRELUDE: u32 = 30;

/// A checkpoint position inside a multipoint run. `value` marks points
/// stored with full precision (proof points); the rest are index-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Point {
    pub pos: u32,
    pub value: bool,
}

impl Point {
    pub fn new(pos: u32) -> Point {
        Point { pos, value: true }
    }
}

/// Recording callback: `(point_index, iteration, residue) -> durable`,
/// where a `true` return means the value was persisted elsewhere and the
/// task need not rewrite its own checkpoint for it.
pub type OnPoint = Box<dyn FnMut(usize, u32, &Integer) -> bool>;

/// Window width minimizing `2^(W-1) + len·(1 + 1/(W+1))`.
pub fn choose_window(len: u32, w_max: Option<u32>, max_size: Option<u32>) -> u32 {
    let mut w = 1u32;
    loop {
        let within_w = w_max.map_or(true, |m| w < m);
        let within_size = max_size.map_or(true, |m| (1u64 << (w + 1)) <= m as u64);
        let cur = (1u64 << (w - 1)) as f64 + len as f64 * (1.0 + 1.0 / (w as f64 + 1.0));
        let next = (1u64 << w) as f64 + len as f64 * (1.0 + 1.0 / (w as f64 + 2.0));
        if within_w && within_size && cur > next {
            w += 1;
        } else {
            return w;
        }
    }
}

/// x ← x^exp by sliding window of width `w`, precomputing the odd powers
/// `x^1, x^3, …, x^(2^W−1)`.
pub fn sliding_window_pow(gw: &mut GwState, x: &mut Integer, exp: &Integer, w: u32, careful: bool) {
    debug_assert!(*exp >= 1);
    if *exp == 1u32 {
        return;
    }
    let len = exp.significant_bits() - 1;

    let mut table: Vec<Integer> = Vec::with_capacity(1usize << (w - 1));
    table.push(x.clone());
    if w > 1 {
        let mut xsq = x.clone();
        if careful {
            gw.square_carefully(&mut xsq);
        } else {
            gw.square(&mut xsq, STARTNEXTFFT);
        }
        for i in 1..(1usize << (w - 1)) {
            let mut next = table[i - 1].clone();
            if careful {
                gw.mul_carefully(&xsq, &mut next);
            } else {
                gw.mul(&xsq, &mut next, STARTNEXTFFT);
            }
            table.push(next);
        }
    }

    let mut i = len as i64;
    let mut started = false;
    while i >= 0 {
        if !exp.get_bit(i as u32) {
            if careful {
                gw.square_carefully(x);
            } else {
                gw.square(x, gw::startnextfft_if(i > 0));
            }
            i -= 1;
            continue;
        }
        let mut j = (i - w as i64 + 1).max(0);
        while !exp.get_bit(j as u32) {
            j += 1;
        }
        let mut ui = 0usize;
        if !started {
            while i >= j {
                ui = (ui << 1) | exp.get_bit(i as u32) as usize;
                i -= 1;
            }
            *x = table[ui / 2].clone();
            started = true;
            continue;
        }
        while i >= j {
            if careful {
                gw.square_carefully(x);
            } else {
                gw.square(x, STARTNEXTFFT);
            }
            ui = (ui << 1) | exp.get_bit(i as u32) as usize;
            i -= 1;
        }
        if careful {
            gw.mul_carefully(&table[ui / 2], x);
        } else {
            gw.mul(&table[ui / 2], x, gw::startnextfft_if(i >= 0));
        }
    }
}

/// x ← x^exp by plain square-and-multiply against a saved copy of the
/// starting value. The proof folds use this with hash-sized exponents.
pub fn pow_in_place(gw: &mut GwState, exp: &Integer, x: &mut Integer, careful: bool) {
    if *exp <= 1u32 {
        return;
    }
    let x0 = x.clone();
    let len = exp.significant_bits() - 1;
    for bit in (0..len).rev() {
        if careful {
            gw.square_carefully(x);
            if exp.get_bit(bit) {
                gw.mul_carefully(&x0, x);
            }
        } else {
            gw.square(x, STARTNEXTFFT);
            if exp.get_bit(bit) {
                gw.mul(&x0, x, gw::startnextfft_if(bit > 0));
            }
        }
    }
}

fn residue_state(iteration: u32, final_iteration: u32, x: &Integer) -> TaskState {
    if iteration == final_iteration {
        TaskState::Value {
            iteration,
            x: x.clone(),
        }
    } else {
        TaskState::Serialized {
            iteration,
            x: SerializedGwNum::from_integer(x),
        }
    }
}

fn state_residue(state: &TaskState) -> Option<Integer> {
    state.x()
}

// ---- SlowExp ----

/// Careful-path exponentiation of a giant base. `x0^exp`, optionally
/// followed by one multiplication by `tail`.
pub struct SlowExp {
    base: TaskBase,
    exp: Integer,
    x0: Integer,
    tail: Option<Integer>,
}

impl SlowExp {
    pub fn new(exp: Integer) -> SlowExp {
        SlowExp {
            base: TaskBase::new(),
            exp,
            x0: Integer::new(),
            tail: None,
        }
    }

    pub fn with_tail(exp: Integer, tail: Integer) -> SlowExp {
        SlowExp {
            base: TaskBase::new(),
            exp,
            x0: Integer::new(),
            tail: Some(tail),
        }
    }

    pub fn exp(&self) -> &Integer {
        &self.exp
    }

    pub fn init(&mut self, gw: &GwState, file: Option<File>, x0: Integer) {
        self.x0 = x0;
        self.base.iterations =
            self.exp.significant_bits() - 1 + self.tail.is_some() as u32;
        self.base.state = file.as_ref().and_then(|f| f.read_state());
        self.base.file = file;
        if let Some(state) = &self.base.state {
            tracing::info!(
                "restarting at {:.1}%",
                100.0 * state.iteration() as f64 / self.base.iterations.max(1) as f64
            );
        }
    }

    /// The reduced starting value, for drivers that reuse it.
    pub fn take_x0(&mut self) -> Integer {
        std::mem::take(&mut self.x0)
    }

    pub fn result(&self) -> Option<Integer> {
        let state = self.base.state.as_ref()?;
        if state.iteration() != self.base.iterations {
            return None;
        }
        state_residue(state)
    }
}

impl Task for SlowExp {
    fn base(&self) -> &TaskBase {
        &self.base
    }
    fn base_mut(&mut self) -> &mut TaskBase {
        &mut self.base
    }

    fn execute(&mut self, gw: &mut GwState, ctx: &TaskContext) -> Result<(), TaskError> {
        self.base.state_update_period = ctx.muls_per_state_update * 2 / 3;
        let final_iter = self.base.iterations;
        let len = self.exp.significant_bits() - 1;
        let mut x0 = self.x0.clone();
        gw.norm(&mut x0);

        let (mut i, mut x) = match &self.base.state {
            Some(state) => (state.iteration(), state_residue(state).ok_or(TaskError::Abort)?),
            None => (0, x0.clone()),
        };
        if final_iter == 0 && self.base.state.is_none() {
            self.base.state = Some(TaskState::Value { iteration: 0, x });
            return Ok(());
        }

        while i < len {
            gw.square_carefully(&mut x);
            if self.exp.get_bit(len - i - 1) {
                gw.mul_carefully(&x0, &mut x);
            }
            i += 1;
            self.commit_execute(ctx, i, &mut || residue_state(i, final_iter, &x))?;
        }
        if let Some(tail) = self.tail.clone() {
            if i < final_iter {
                gw.mul_carefully(&tail, &mut x);
                i += 1;
                self.commit_execute(ctx, i, &mut || residue_state(i, final_iter, &x))?;
            }
        }
        Ok(())
    }
}

// ---- FastExp ----

/// Fast-path exponentiation of a small base fused into the mul-by-const
/// slot. The base must not exceed the engine's `maxmulbyconst`.
pub struct FastExp {
    base: TaskBase,
    exp: Integer,
    x0: u32,
    tail: Option<Integer>,
}

impl FastExp {
    pub fn new(exp: Integer) -> FastExp {
        FastExp {
            base: TaskBase::new(),
            exp,
            x0: 0,
            tail: None,
        }
    }

    pub fn exp(&self) -> &Integer {
        &self.exp
    }

    pub fn init(
        &mut self,
        gw: &mut GwState,
        file: Option<File>,
        x0: u32,
        tail: Option<Integer>,
    ) -> Result<(), TaskError> {
        gw.set_mulbyconst(x0).map_err(|e| {
            tracing::error!("{}", e);
            TaskError::Abort
        })?;
        self.x0 = x0;
        self.tail = tail;
        self.base.iterations =
            self.exp.significant_bits() - 1 + self.tail.is_some() as u32;
        self.base.state = file.as_ref().and_then(|f| f.read_state());
        self.base.file = file;
        if let Some(state) = &self.base.state {
            tracing::info!(
                "restarting at {:.1}%",
                100.0 * state.iteration() as f64 / self.base.iterations.max(1) as f64
            );
        }
        if gw.near_fft_limit() {
            tracing::info!("max roundoff check enabled");
        }
        Ok(())
    }

    pub fn result(&self) -> Option<Integer> {
        let state = self.base.state.as_ref()?;
        if state.iteration() != self.base.iterations {
            return None;
        }
        state_residue(state)
    }
}

impl Task for FastExp {
    fn base(&self) -> &TaskBase {
        &self.base
    }
    fn base_mut(&mut self) -> &mut TaskBase {
        &mut self.base
    }

    fn execute(&mut self, gw: &mut GwState, ctx: &TaskContext) -> Result<(), TaskError> {
        self.base.state_update_period = ctx.muls_per_state_update;
        let final_iter = self.base.iterations;
        let len = self.exp.significant_bits() - 1;

        let (mut i, mut x) = match &self.base.state {
            Some(state) => (state.iteration(), state_residue(state).ok_or(TaskError::Abort)?),
            None => (0, Integer::from(self.x0)),
        };
        if final_iter == 0 && self.base.state.is_none() {
            self.base.state = Some(TaskState::Value { iteration: 0, x });
            return Ok(());
        }
        if i < CAREFUL_PRELUDE {
            gw.set_carefully_count(CAREFUL_PRELUDE - i);
        }

        while i < len {
            let mut opts = gw::startnextfft_if(!self.base.is_last(i));
            if self.exp.get_bit(len - i - 1) {
                opts |= MULBYCONST;
            }
            gw.square(&mut x, opts);
            i += 1;
            self.commit_execute(ctx, i, &mut || residue_state(i, final_iter, &x))?;
        }
        if let Some(tail) = self.tail.clone() {
            if i < final_iter {
                gw.mul_carefully(&tail, &mut x);
                i += 1;
                self.commit_execute(ctx, i, &mut || residue_state(i, final_iter, &x))?;
            }
        }
        Ok(())
    }
}

// ---- SlidingWindowExp ----

/// Windowed exponentiation of a giant base; one lump iteration.
pub struct SlidingWindowExp {
    base: TaskBase,
    exp: Integer,
    x0: Integer,
    pub w: Option<u32>,
}

impl SlidingWindowExp {
    pub fn new(exp: Integer) -> SlidingWindowExp {
        SlidingWindowExp {
            base: TaskBase::new(),
            exp,
            x0: Integer::new(),
            w: None,
        }
    }

    pub fn init(&mut self, _gw: &GwState, file: Option<File>, x0: Integer) {
        self.x0 = x0;
        self.base.iterations = self.exp.significant_bits() - 1;
        self.base.state = file.as_ref().and_then(|f| f.read_state());
        self.base.file = file;
    }

    pub fn result(&self) -> Option<Integer> {
        let state = self.base.state.as_ref()?;
        if state.iteration() != self.base.iterations {
            return None;
        }
        state_residue(state)
    }
}

impl Task for SlidingWindowExp {
    fn base(&self) -> &TaskBase {
        &self.base
    }
    fn base_mut(&mut self) -> &mut TaskBase {
        &mut self.base
    }

    fn execute(&mut self, gw: &mut GwState, ctx: &TaskContext) -> Result<(), TaskError> {
        let final_iter = self.base.iterations;
        if let Some(state) = &self.base.state {
            if state.iteration() == final_iter {
                return Ok(());
            }
        }
        let mut x = self.x0.clone();
        gw.norm(&mut x);
        if final_iter > 0 {
            let w = self
                .w
                .unwrap_or_else(|| choose_window(self.exp.significant_bits() - 1, Some(5), None));
            gw.set_carefully_count(CAREFUL_PRELUDE);
            sliding_window_pow(gw, &mut x, &self.exp, w, false);
        }
        self.commit_execute(ctx, final_iter, &mut || TaskState::Value {
            iteration: final_iter,
            x: x.clone(),
        })
    }
}

// ---- MultipointExp ----

/// Exponentiation that pauses at a sequence of checkpoints. Smooth mode
/// raises a base `b` one power at a time; explicit mode walks the bits of
/// a full exponent with a small fused base.
pub struct MultipointExp {
    base: TaskBase,
    pub exp: Integer,
    smooth: bool,
    x0: u32,
    pub points: Vec<Point>,
    tail: Option<Integer>,
    pub w: Option<u32>,
    on_point: Option<OnPoint>,
}

impl MultipointExp {
    /// Smooth mode: `exp` is the base `b`; points are powers of `b`.
    pub fn new_smooth(b: Integer, points: Vec<Point>, on_point: Option<OnPoint>) -> MultipointExp {
        MultipointExp {
            base: TaskBase::new(),
            exp: b,
            smooth: true,
            x0: 0,
            points,
            tail: None,
            w: None,
            on_point,
        }
    }

    /// Explicit mode: `exp` is the full exponent, `points` are bit
    /// positions, the base is small and fused into mul-by-const.
    pub fn new_explicit(exp: Integer, points: Vec<Point>, on_point: Option<OnPoint>) -> MultipointExp {
        MultipointExp {
            base: TaskBase::new(),
            exp,
            smooth: false,
            x0: 0,
            points,
            tail: None,
            w: None,
            on_point,
        }
    }

    pub fn smooth(&self) -> bool {
        self.smooth
    }

    pub fn b(&self) -> u32 {
        debug_assert!(self.smooth);
        self.exp.to_u32().unwrap_or(0)
    }

    pub fn init(
        &mut self,
        gw: &mut GwState,
        file: Option<File>,
        x0: u32,
        tail: Option<Integer>,
    ) -> Result<(), TaskError> {
        if !self.smooth {
            gw.set_mulbyconst(x0).map_err(|e| {
                tracing::error!("{}", e);
                TaskError::Abort
            })?;
        }
        self.x0 = x0;
        self.tail = tail;
        self.base.iterations = self.points.last().map_or(0, |p| p.pos)
            + self.tail.is_some() as u32;
        if let Some(state) = file.as_ref().and_then(|f| f.read_state()) {
            self.init_state(state);
        }
        self.base.file = file;
        Ok(())
    }

    pub fn init_state(&mut self, state: TaskState) {
        if state.iteration() > 0 {
            tracing::info!(
                "restarting at {:.1}%",
                100.0 * state.iteration() as f64 / self.base.iterations.max(1) as f64
            );
        }
        self.base.state = Some(state);
    }

    pub fn state(&self) -> Option<&TaskState> {
        self.base.state.as_ref()
    }

    pub fn result(&self) -> Option<Integer> {
        let state = self.base.state.as_ref()?;
        if state.iteration() != self.base.iterations {
            return None;
        }
        state_residue(state)
    }

    fn call_on_point(&mut self, index: usize, pos: u32, x: &Integer) {
        if let Some(cb) = &mut self.on_point {
            if cb(index, pos, x) {
                self.base.state_written = true;
            }
            self.base.last_write = std::time::Instant::now();
        }
    }
}

impl Task for MultipointExp {
    fn base(&self) -> &TaskBase {
        &self.base
    }
    fn base_mut(&mut self) -> &mut TaskBase {
        &mut self.base
    }

    fn execute(&mut self, gw: &mut GwState, ctx: &TaskContext) -> Result<(), TaskError> {
        self.base.state_update_period = ctx.muls_per_state_update;
        let final_iter = self.base.iterations;
        let state = self.base.state.as_ref().ok_or_else(|| {
            tracing::error!("multipoint run has no starting state");
            TaskError::Abort
        })?;
        let mut i = state.iteration();
        let mut x = state_residue(state).ok_or(TaskError::Abort)?;
        let len = if self.smooth {
            0
        } else {
            self.exp.significant_bits() - 1
        };
        if i < CAREFUL_PRELUDE {
            gw.set_carefully_count(CAREFUL_PRELUDE - i);
        }

        let b_is_2 = self.smooth && self.exp == 2u32;
        let mut last_power: Option<(u32, Integer)> = None;
        let points = self.points.clone();
        for (np, point) in points.iter().enumerate() {
            if i >= point.pos {
                continue;
            }
            if self.smooth {
                if b_is_2 {
                    while i < point.pos {
                        let opts = gw::startnextfft_if(
                            !self.base.is_last(i) && i + 1 != point.pos,
                        );
                        gw.square(&mut x, opts);
                        i += 1;
                        self.commit_execute(ctx, i, &mut || residue_state(i, final_iter, &x))?;
                    }
                } else {
                    let delta = point.pos - i;
                    let seg = match &last_power {
                        Some((d, seg)) if *d == delta => seg.clone(),
                        _ => {
                            let seg = self.exp.clone().pow(delta);
                            last_power = Some((delta, seg.clone()));
                            seg
                        }
                    };
                    let w = self.w.unwrap_or_else(|| {
                        choose_window(seg.significant_bits() - 1, Some(5), None)
                    });
                    sliding_window_pow(gw, &mut x, &seg, w, false);
                    i = point.pos;
                    self.commit_execute(ctx, i, &mut || residue_state(i, final_iter, &x))?;
                }
            } else {
                while i < point.pos {
                    let mut opts =
                        gw::startnextfft_if(!self.base.is_last(i) && i + 1 != point.pos);
                    if self.exp.get_bit(len - i - 1) {
                        opts |= MULBYCONST;
                    }
                    gw.square(&mut x, opts);
                    i += 1;
                    self.commit_execute(ctx, i, &mut || residue_state(i, final_iter, &x))?;
                }
            }
            // Make the point durable before recording it.
            if self.base.iteration() != i || self.base.state.is_none() {
                self.base.state = Some(TaskState::Value {
                    iteration: i,
                    x: x.clone(),
                });
            }
            self.call_on_point(np, point.pos, &x);
        }

        if let Some(tail) = self.tail.clone() {
            if i < final_iter {
                gw.mul_carefully(&tail, &mut x);
                i += 1;
                self.commit_execute(ctx, i, &mut || TaskState::Value {
                    iteration: i,
                    x: x.clone(),
                })?;
            }
        }
        Ok(())
    }
}

// ---- Product ----

/// Folds a vector of giants into their product mod N, one careful
/// multiplication per step.
pub struct Product {
    base: TaskBase,
    values: Vec<Integer>,
}

impl Product {
    pub fn new(values: Vec<Integer>) -> Product {
        let mut base = TaskBase::new();
        base.iterations = values.len() as u32;
        Product { base, values }
    }

    pub fn result(&self) -> Option<Integer> {
        let state = self.base.state.as_ref()?;
        if state.iteration() != self.base.iterations {
            return None;
        }
        state_residue(state)
    }
}

impl Task for Product {
    fn base(&self) -> &TaskBase {
        &self.base
    }
    fn base_mut(&mut self) -> &mut TaskBase {
        &mut self.base
    }

    fn execute(&mut self, gw: &mut GwState, ctx: &TaskContext) -> Result<(), TaskError> {
        if self.values.is_empty() {
            return Err(TaskError::Abort);
        }
        let final_iter = self.base.iterations;
        let (mut i, mut p) = match &self.base.state {
            Some(state) => (
                state.iteration(),
                state_residue(state).ok_or(TaskError::Abort)?,
            ),
            None => {
                let mut p = self.values[0].clone();
                gw.norm(&mut p);
                (1, p)
            }
        };
        while i < final_iter {
            let mut v = self.values[i as usize].clone();
            gw.norm(&mut v);
            gw.mul_carefully(&v, &mut p);
            i += 1;
            self.commit_execute(ctx, i, &mut || TaskState::Value {
                iteration: i,
                x: p.clone(),
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::InputNum;
    use crate::task::reset_abort;
    use rug::ops::Pow;

    fn setup(s: &str) -> (InputNum, GwState) {
        reset_abort();
        let input = InputNum::parse(s).unwrap();
        let gw = GwState::setup(&input, 100).unwrap();
        (input, gw)
    }

    fn reference_pow(base: &Integer, exp: &Integer, n: &Integer) -> Integer {
        base.clone().pow_mod(exp, n).unwrap()
    }

    #[test]
    fn fast_exp_computes_power() {
        let (input, mut gw) = setup("3*2^30+1");
        let exp = Integer::from(&*input.value() - 1u32);
        let mut task = FastExp::new(exp.clone());
        task.init(&mut gw, None, 5, None).unwrap();
        task.run(&mut gw, &TaskContext::default()).unwrap();
        let expected = reference_pow(&Integer::from(5u32), &exp, input.value());
        assert_eq!(task.result().unwrap(), expected);
    }

    #[test]
    fn slow_exp_matches_fast_exp() {
        let (input, mut gw) = setup("3*2^30+1");
        let exp = Integer::from(12345678u64);
        let mut fast = FastExp::new(exp.clone());
        fast.init(&mut gw, None, 7, None).unwrap();
        fast.run(&mut gw, &TaskContext::default()).unwrap();

        let mut slow = SlowExp::new(exp.clone());
        slow.init(&gw, None, Integer::from(7u32));
        slow.run(&mut gw, &TaskContext::default()).unwrap();

        assert_eq!(fast.result(), slow.result());
        assert_eq!(
            slow.result().unwrap(),
            reference_pow(&Integer::from(7u32), &exp, input.value())
        );
    }

    #[test]
    fn slow_exp_giant_base() {
        let (input, mut gw) = setup("3*2^40+1");
        let base = Integer::from(0xdeadbeef12345u64);
        let exp = Integer::from(99991u32);
        let mut task = SlowExp::new(exp.clone());
        task.init(&gw, None, base.clone());
        task.run(&mut gw, &TaskContext::default()).unwrap();
        assert_eq!(
            task.result().unwrap(),
            reference_pow(&base, &exp, input.value())
        );
    }

    #[test]
    fn slow_exp_tail_applied() {
        let (input, mut gw) = setup("3*2^30+1");
        let exp = Integer::from(1000u32);
        let tail = Integer::from(17u32);
        let mut task = SlowExp::with_tail(exp.clone(), tail.clone());
        task.init(&gw, None, Integer::from(3u32));
        task.run(&mut gw, &TaskContext::default()).unwrap();
        let expected =
            reference_pow(&Integer::from(3u32), &exp, input.value()) * tail % input.value();
        assert_eq!(task.result().unwrap(), expected);
    }

    #[test]
    fn sliding_window_matches_reference() {
        let (input, mut gw) = setup("3*2^40+1");
        for exp_val in [3u64, 17, 255, 256, 99991, 1 << 20] {
            let exp = Integer::from(exp_val);
            let mut x = Integer::from(123456789u64);
            let expected = reference_pow(&x, &exp, input.value());
            let w = choose_window(exp.significant_bits() - 1, Some(5), None);
            sliding_window_pow(&mut gw, &mut x, &exp, w, false);
            assert_eq!(x, expected, "exp = {}", exp_val);
        }
    }

    #[test]
    fn sliding_window_exp_task() {
        let (input, mut gw) = setup("3*2^40+1");
        let exp = Integer::from(54321u32);
        let x0 = Integer::from(987654321u64);
        let mut task = SlidingWindowExp::new(exp.clone());
        task.init(&gw, None, x0.clone());
        task.run(&mut gw, &TaskContext::default()).unwrap();
        assert_eq!(
            task.result().unwrap(),
            reference_pow(&x0, &exp, input.value())
        );
    }

    #[test]
    fn pow_in_place_matches_reference() {
        let (input, mut gw) = setup("3*2^40+1");
        let mut x = Integer::from(777u32);
        let exp = Integer::from(1009u32);
        let expected = reference_pow(&x, &exp, input.value());
        pow_in_place(&mut gw, &exp, &mut x, true);
        assert_eq!(x, expected);
    }

    #[test]
    fn multipoint_smooth_base2_hits_points() {
        let (input, mut gw) = setup("3*2^64+1");
        let positions = [16u32, 32, 48, 64];
        let recorded: std::rc::Rc<std::cell::RefCell<Vec<(usize, u32, Integer)>>> =
            Default::default();
        let sink = recorded.clone();
        let points: Vec<Point> = positions.iter().map(|&p| Point::new(p)).collect();
        let mut task = MultipointExp::new_smooth(
            Integer::from(2u32),
            points,
            Some(Box::new(move |idx, pos, x| {
                sink.borrow_mut().push((idx, pos, x.clone()));
                false
            })),
        );
        task.init(&mut gw, None, 0, None).unwrap();
        task.init_state(TaskState::Value {
            iteration: 0,
            x: Integer::from(3u32),
        });
        task.run(&mut gw, &TaskContext::default()).unwrap();

        let recorded = recorded.borrow();
        assert_eq!(recorded.len(), 4);
        for (idx, pos, x) in recorded.iter() {
            let expected = reference_pow(
                &Integer::from(3u32),
                &(Integer::from(1u32) << *pos),
                input.value(),
            );
            assert_eq!(x, &expected, "point {} at {}", idx, pos);
        }
    }

    #[test]
    fn multipoint_smooth_general_base() {
        let (input, mut gw) = setup("2*5^120-1");
        let positions = [40u32, 80, 120];
        let points: Vec<Point> = positions.iter().map(|&p| Point::new(p)).collect();
        let mut task = MultipointExp::new_smooth(Integer::from(5u32), points, None);
        task.init(&mut gw, None, 0, None).unwrap();
        task.init_state(TaskState::Value {
            iteration: 0,
            x: Integer::from(3u32),
        });
        task.run(&mut gw, &TaskContext::default()).unwrap();
        let expected = reference_pow(
            &Integer::from(3u32),
            &Integer::from(5u32).pow(120u32),
            input.value(),
        );
        assert_eq!(task.result().unwrap(), expected);
    }

    #[test]
    fn multipoint_explicit_exponent() {
        let (input, mut gw) = setup("3*2^50+1");
        let exp = Integer::from(&*input.value() - 1u32);
        let len = exp.significant_bits() - 1;
        let points = vec![Point::new(len / 2), Point::new(len)];
        let mut task = MultipointExp::new_explicit(exp.clone(), points, None);
        task.init(&mut gw, None, 5, None).unwrap();
        task.init_state(TaskState::Value {
            iteration: 0,
            x: Integer::from(5u32),
        });
        task.run(&mut gw, &TaskContext::default()).unwrap();
        assert_eq!(
            task.result().unwrap(),
            reference_pow(&Integer::from(5u32), &exp, input.value())
        );
    }

    #[test]
    fn multipoint_resumes_from_state() {
        let (_, mut gw) = setup("3*2^64+1");
        let points = vec![Point::new(32), Point::new(64)];
        let mut full = MultipointExp::new_smooth(Integer::from(2u32), points.clone(), None);
        full.init(&mut gw, None, 0, None).unwrap();
        full.init_state(TaskState::Value {
            iteration: 0,
            x: Integer::from(3u32),
        });
        full.run(&mut gw, &TaskContext::default()).unwrap();
        let expected = full.result().unwrap();

        // Restart from the midpoint and land on the same final value.
        let mid = {
            let mut t = MultipointExp::new_smooth(
                Integer::from(2u32),
                vec![Point::new(32)],
                None,
            );
            t.init(&mut gw, None, 0, None).unwrap();
            t.init_state(TaskState::Value {
                iteration: 0,
                x: Integer::from(3u32),
            });
            t.run(&mut gw, &TaskContext::default()).unwrap();
            t.result().unwrap()
        };
        let mut resumed = MultipointExp::new_smooth(Integer::from(2u32), points, None);
        resumed.init(&mut gw, None, 0, None).unwrap();
        resumed.init_state(TaskState::Value {
            iteration: 32,
            x: mid,
        });
        resumed.run(&mut gw, &TaskContext::default()).unwrap();
        assert_eq!(resumed.result().unwrap(), expected);
    }

    #[test]
    fn product_folds_values() {
        let (input, mut gw) = setup("3*2^40+1");
        let values: Vec<Integer> = (2u32..10).map(Integer::from).collect();
        let expected = values
            .iter()
            .fold(Integer::from(1u32), |acc, v| acc * v % input.value());
        let mut task = Product::new(values);
        task.run(&mut gw, &TaskContext::default()).unwrap();
        assert_eq!(task.result().unwrap(), expected);
    }

    #[test]
    fn window_choice_grows_with_length() {
        assert_eq!(choose_window(8, Some(5), None), 2);
        assert!(choose_window(10_000, Some(5), None) >= 4);
        assert!(choose_window(10_000, Some(3), None) <= 3);
    }
}

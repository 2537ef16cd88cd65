//! # Strong — Error-Checked Exponentiation
//!
//! Gerbicz-style verification for the long squaring chains: alongside the
//! running value `X`, an accumulator `D` collects `X` at every `L`-th
//! iteration. At the end of an `L²` block the product identity
//!
//! ```text
//! R · D^(b^L)          = X·D        (smooth base b)
//! R · D^(2^L) · a^s    = X·D        (explicit exponent, base a,
//!                                    s = sum of the block's L-bit windows)
//! ```
//!
//! must hold, with the right side folded carefully. A single bit flip
//! anywhere inside the block breaks the identity with overwhelming
//! probability; on mismatch `X` and `D` are reset to the recovery snapshot
//! `R` and the block re-executes. The overhead is one multiplication every
//! `L` iterations plus one `b^L` exponentiation per block.
//!
//! Two durable records cooperate: the recovery file holds the last verified
//! `R`; the checkpoint file holds the mid-block `(X, D)` pair, valid only
//! while it agrees with the recovery iteration.
//!
//! Robert Gerbicz, "Error-detecting LLR algorithm" (mersenneforum, 2017);
//! Darren Li's generalization to non-smooth exponents
//! (<https://eprint.iacr.org/2023/195>).

use rug::ops::Pow;
use rug::Integer;

use crate::exp::{choose_window, sliding_window_pow, OnPoint, Point, CAREFUL_PRELUDE};
use crate::file::File;
use crate::gw::{self, GwState, SerializedGwNum, MULBYCONST};
use crate::state::TaskState;
use crate::task::{Task, TaskBase, TaskContext, TaskError};

/// Pick `L` maximizing the checked span `iters − iters mod L` under the
/// constraint `L² < 2·iters`.
pub fn gerbicz_params(iters: u32) -> (u32, u32) {
    let mut l = (iters as f64).sqrt() as u32;
    if l == 0 {
        l = 1;
    }
    let mut l2 = iters - iters % l;
    let mut i = l + 1;
    while (i as u64) * (i as u64) < 2 * iters as u64 {
        if l2 < iters - iters % i {
            l = i;
            l2 = iters - iters % i;
        }
        i += 1;
    }
    (l, l2)
}

/// Multipoint exponentiation with the Gerbicz (smooth) or Gerbicz–Li
/// (explicit exponent) strong check interleaved.
pub struct StrongCheckExp {
    base: TaskBase,
    /// Base `b` in smooth mode, the full exponent otherwise.
    exp: Integer,
    smooth: bool,
    x0: u32,
    pub points: Vec<Point>,
    pub l: u32,
    pub l2: u32,
    tail: Option<Integer>,
    pub points_per_check: u32,
    pub w: Option<u32>,
    file_recovery: Option<File>,
    state_recovery: Option<TaskState>,
    recovery_written: bool,
    recovery_op: u32,
    on_point: Option<OnPoint>,
}

impl StrongCheckExp {
    /// Raw constructor; `points` must be strictly increasing.
    pub fn new(
        exp: Integer,
        smooth: bool,
        points: Vec<Point>,
        l: u32,
        l2: u32,
        on_point: Option<OnPoint>,
    ) -> StrongCheckExp {
        StrongCheckExp {
            base: TaskBase::new(),
            exp,
            smooth,
            x0: 0,
            points,
            l,
            l2,
            tail: None,
            points_per_check: 1,
            w: None,
            file_recovery: None,
            state_recovery: None,
            recovery_written: false,
            recovery_op: 0,
            on_point,
        }
    }

    /// Smooth-base checked exponentiation to `b^n`, verified in `count`
    /// segments. Degenerate inputs (`n < count`) fall back to `L = L2 = 1`.
    pub fn gerbicz(
        b: Integer,
        n: u32,
        count: u32,
        on_point: Option<OnPoint>,
        l_override: Option<u32>,
    ) -> StrongCheckExp {
        let (l, l2) = block_geometry(n, count, l_override);
        let points = segment_points(n, count, l2);
        StrongCheckExp::new(b, true, points, l, l2, on_point)
    }

    /// Explicit-exponent checked exponentiation (Gerbicz–Li), verified in
    /// `count` segments of exponent bits.
    pub fn li(exp: Integer, count: u32, l_override: Option<u32>) -> StrongCheckExp {
        let n = exp.significant_bits() - 1;
        let (l, l2) = block_geometry(n, count, l_override);
        let points = segment_points(n, count, l2);
        StrongCheckExp::new(exp, false, points, l, l2, on_point_none())
    }

    pub fn smooth(&self) -> bool {
        self.smooth
    }

    pub fn set_on_point(&mut self, on_point: OnPoint) {
        self.on_point = Some(on_point);
    }

    pub fn init(
        &mut self,
        gw: &mut GwState,
        file: Option<File>,
        file_recovery: Option<File>,
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
        tracing::info!("strong check enabled, L2 = {}*{}", self.l, self.l2 / self.l.max(1));

        self.base.state = file.as_ref().and_then(|f| f.read_state());
        if !matches!(self.base.state, Some(TaskState::StrongCheck { .. })) {
            self.base.state = None;
        }
        self.base.file = file;
        if let Some(recovery) = file_recovery.as_ref().and_then(|f| f.read_state()) {
            self.file_recovery = file_recovery;
            self.recovery_written = true;
            self.accept_recovery(recovery);
        } else {
            self.file_recovery = file_recovery;
        }
        if !self.smooth && self.state_recovery.is_none() {
            self.accept_recovery(TaskState::Value {
                iteration: 0,
                x: Integer::from(x0),
            });
        }
        Ok(())
    }

    /// Install a verified starting state (iteration 0 seed or a resume).
    pub fn init_state(&mut self, state: TaskState) {
        self.recovery_written = false;
        self.accept_recovery(state);
    }

    fn accept_recovery(&mut self, state: TaskState) {
        let recovery_iter = state.iteration();
        if recovery_iter > 0 {
            tracing::info!(
                "restarting at {:.1}%",
                100.0 * recovery_iter as f64 / self.base.iterations.max(1) as f64
            );
        }
        // A mid-block record is only usable if it chains off this exact
        // recovery point.
        let keep = matches!(
            &self.base.state,
            Some(TaskState::StrongCheck { recovery, iteration, .. })
                if *recovery == recovery_iter
                    && *iteration >= recovery_iter
                    && *iteration < recovery_iter + self.l2
        );
        if !keep {
            self.base.state = Some(TaskState::Bare {
                iteration: recovery_iter,
            });
        }
        self.state_recovery = Some(state);
        self.recovery_op = 0;
    }

    pub fn state(&self) -> Option<&TaskState> {
        self.state_recovery.as_ref()
    }

    pub fn result(&self) -> Option<Integer> {
        let state = self.state_recovery.as_ref()?;
        if state.iteration() != self.base.iterations {
            return None;
        }
        state.x()
    }

    /// Estimated multiplications, block checks included.
    pub fn cost(&self) -> f64 {
        let n = self.points.last().map_or(0, |p| p.pos) as f64;
        let l = self.l.max(1) as f64;
        let l2 = self.l2.max(1) as f64;
        if self.smooth && self.exp == 2u32 {
            n + n / l + n / l2 * l
        } else if self.smooth {
            let log2b = (self.exp.to_f64()).log2();
            let w = choose_window((log2b * l) as u32, Some(5), None);
            let per_chunk = (1u64 << (w - 1)) as f64 + log2b * l * (1.0 + 1.0 / (w as f64 + 1.0));
            n / l * per_chunk + (n / l + n / l2) * per_chunk / l
        } else {
            n * 1.5 + n / l + n / l2 * l
        }
    }

    fn next_check_pos(&self, recovery: u32) -> u32 {
        let last = self.points.len() - 1;
        let mut idx = self
            .points
            .iter()
            .position(|p| p.pos > recovery)
            .unwrap_or(last);
        let ppc = self.points_per_check.max(1) as usize;
        idx = idx + (ppc - 1) - (idx + ppc - 1) % ppc;
        self.points[idx.min(last)].pos
    }

    fn call_on_point(&mut self, index: usize, pos: u32, x: &Integer) {
        if let Some(cb) = &mut self.on_point {
            cb(index, pos, x);
            self.base.last_write = std::time::Instant::now();
        }
    }

    /// Sum of the exponent windows covered by the block
    /// `[recovery, recovery + len)`, folded `l` bits at a time.
    fn block_window_sum(&self, recovery: u32, len: u32, l: u32) -> Integer {
        let top = self.exp.significant_bits() - 1;
        let mut s = Integer::new();
        let mut j = l;
        while j <= len {
            let lo = top - recovery - j;
            let width = l.min(len - (j - l));
            let window = Integer::from(&self.exp >> lo)
                .keep_bits(width);
            s += window;
            j += l;
        }
        s
    }
}

fn on_point_none() -> Option<OnPoint> {
    None
}

fn block_geometry(n: u32, count: u32, l_override: Option<u32>) -> (u32, u32) {
    if n < count.max(1) {
        return (1, 1);
    }
    match l_override {
        Some(l) => {
            let mut l2 = n / count;
            l2 -= l2 % l;
            (l, l2.max(l))
        }
        None => gerbicz_params(n / count),
    }
}

fn segment_points(n: u32, count: u32, l2: u32) -> Vec<Point> {
    let mut points = Vec::new();
    let mut i = 0u32;
    while i <= count && l2 * i <= n {
        points.push(Point {
            pos: l2 * i,
            value: l2 * i == n,
        });
        i += 1;
    }
    if points.last().map_or(true, |p| p.pos != n) {
        points.push(Point::new(n));
    }
    points
}

impl Task for StrongCheckExp {
    fn base(&self) -> &TaskBase {
        &self.base
    }
    fn base_mut(&mut self) -> &mut TaskBase {
        &mut self.base
    }

    fn write_state(&mut self) -> Result<(), TaskError> {
        if let (Some(file), Some(recovery)) = (&self.file_recovery, &self.state_recovery) {
            if !self.recovery_written {
                file.write_state(recovery).map_err(|e| {
                    tracing::error!("recovery write failed: {}", e);
                    TaskError::Abort
                })?;
                self.recovery_written = true;
            }
        }
        let base = self.base_mut();
        if let (Some(file), Some(state)) = (&base.file, &base.state) {
            file.write_state(state).map_err(|e| {
                tracing::error!("checkpoint write failed: {}", e);
                TaskError::Abort
            })?;
        }
        base.state_written = true;
        base.last_write = std::time::Instant::now();
        Ok(())
    }

    fn execute(&mut self, gw: &mut GwState, ctx: &TaskContext) -> Result<(), TaskError> {
        let final_pos = self.points.last().map_or(0, |p| p.pos);
        let final_iter = self.base.iterations;
        let b_is_2 = self.smooth && self.exp == 2u32;
        let log2b = if self.smooth {
            self.exp.to_f64().log2().max(1.0)
        } else {
            1.0
        };
        self.base.state_update_period =
            ((ctx.muls_per_state_update as f64 / log2b) as u32).max(1);

        let recovery_state = self.state_recovery.as_ref().ok_or_else(|| {
            tracing::error!("strong check has no recovery state");
            TaskError::Abort
        })?;
        let mut recovery = recovery_state.iteration();
        let mut r = recovery_state.x().ok_or(TaskError::Abort)?;
        gw.norm(&mut r);

        let (mut i, mut x, mut d) = match &self.base.state {
            Some(TaskState::StrongCheck { iteration, x, d, .. }) => {
                (*iteration, x.to_integer(), d.to_integer())
            }
            _ => (recovery, r.clone(), r.clone()),
        };
        if i < CAREFUL_PRELUDE {
            gw.set_carefully_count(CAREFUL_PRELUDE - i);
        }
        let top = if self.smooth {
            0
        } else {
            self.exp.significant_bits() - 1
        };

        while i < final_pos {
            // Block geometry, shrinking L near a close check target.
            let check_target = self.next_check_pos(recovery);
            let mut l = self.l;
            let mut l2 = self.l2;
            while check_target - recovery < l2 && l > 1 {
                l /= 2;
                l2 = l * l;
            }
            if check_target - recovery < l2 {
                l2 = check_target - recovery;
            }
            let block_end = recovery + l2;
            debug_assert!(i < block_end);

            let chunk = if self.smooth && !b_is_2 { l } else { 1 };
            let seg = if self.smooth && !b_is_2 {
                Some(self.exp.clone().pow(l))
            } else {
                None
            };
            let w = self.w.unwrap_or_else(|| {
                choose_window(((log2b * l as f64) as u32).max(1), Some(5), None)
            });

            while i < block_end {
                if b_is_2 {
                    let opts = gw::startnextfft_if(
                        !self.base.is_last(i) && i + 1 != block_end,
                    );
                    gw.square(&mut x, opts);
                } else if self.smooth {
                    sliding_window_pow(gw, &mut x, seg.as_ref().unwrap(), w, false);
                } else {
                    let mut opts =
                        gw::startnextfft_if(!self.base.is_last(i) && i + 1 != block_end);
                    if self.exp.get_bit(top - i - 1) {
                        opts |= MULBYCONST;
                    }
                    gw.square(&mut x, opts);
                }
                i += chunk;

                // Emit value-bearing points that land inside the block.
                if i != block_end {
                    if let Some(np) = self.points.iter().position(|p| p.pos == i) {
                        let point = self.points[np];
                        self.base.state = Some(TaskState::StrongCheck {
                            iteration: i,
                            recovery,
                            x: SerializedGwNum::from_integer(&x),
                            d: SerializedGwNum::from_integer(&d),
                        });
                        self.write_state()?;
                        self.call_on_point(np, point.pos, &x);
                    }
                    if (i - recovery) % l == 0 {
                        gw.mul(&x, &mut d, gw::startnextfft_if(i + l != block_end));
                    }
                }

                let (ci, cr) = (i, recovery);
                self.commit_execute(ctx, ci, &mut || TaskState::StrongCheck {
                    iteration: ci,
                    recovery: cr,
                    x: SerializedGwNum::from_integer(&x),
                    d: SerializedGwNum::from_integer(&d),
                })?;
            }

            // Block-end equality, folded with careful arithmetic.
            tracing::debug!("strong check at {}, L2 = {}*{}", i, l, l2 / l.max(1));
            let mut dn = d.clone();
            gw.mul_carefully(&x, &mut dn);
            let mut t = d.clone();
            if b_is_2 {
                for _ in 0..l {
                    gw.square_carefully(&mut t);
                }
            } else if self.smooth {
                sliding_window_pow(gw, &mut t, seg.as_ref().unwrap(), w, true);
            } else {
                for _ in 0..l {
                    gw.square_carefully(&mut t);
                }
                let s = self.block_window_sum(recovery, l2, l);
                if s > 0 {
                    let a_s = Integer::from(self.x0)
                        .pow_mod(&s, gw.n())
                        .map_err(|_| TaskError::Abort)?;
                    gw.mul_carefully(&a_s, &mut t);
                }
            }
            gw.mul_carefully(&r, &mut t);
            let diff = gw.sub_carefully(&t, &dn);
            if diff != 0u32 || dn == 0u32 {
                tracing::error!(
                    "strong check failed at {:.1}%",
                    100.0 * i as f64 / final_iter.max(1) as f64
                );
                self.base.state = Some(TaskState::Bare { iteration: recovery });
                self.base.restart_op = self.recovery_op;
                return Err(TaskError::Restart);
            }

            // Verified; advance the recovery snapshot.
            r = x.clone();
            d = x.clone();
            recovery = i;
            self.state_recovery = Some(TaskState::Value {
                iteration: i,
                x: r.clone(),
            });
            self.recovery_written = false;
            self.base.state = Some(TaskState::Bare { iteration: i });
            if self.base.last_write.elapsed() >= ctx.disk_write_time
                || i == final_pos
                || ctx.save_requested()
            {
                self.write_state()?;
            }
            self.recovery_op = self.base.restart_op;
            self.base.restart_count = 0;

            if let Some(np) = self.points.iter().position(|p| p.pos == i) {
                let point = self.points[np];
                self.call_on_point(np, point.pos, &r);
            }
        }

        if let Some(tail) = self.tail.clone() {
            if i < final_iter {
                gw.mul_carefully(&tail, &mut r);
                i += 1;
                self.state_recovery = Some(TaskState::Value {
                    iteration: i,
                    x: r.clone(),
                });
                self.recovery_written = false;
                self.base.state = Some(TaskState::Bare { iteration: i });
                self.write_state()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::InputNum;
    use crate::task::reset_abort;

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
    fn gerbicz_params_bound() {
        for iters in [100u32, 1000, 4096, 12345] {
            let (l, l2) = gerbicz_params(iters);
            assert!(l >= 1);
            assert_eq!(l2 % l, 0);
            assert!(l2 <= iters);
            assert!((l as u64) * (l as u64) < 2 * iters as u64 || l == 1);
        }
    }

    #[test]
    fn degenerate_small_n_uses_unit_blocks() {
        let task = StrongCheckExp::gerbicz(Integer::from(2u32), 3, 16, None, None);
        assert_eq!((task.l, task.l2), (1, 1));
    }

    #[test]
    fn smooth_base2_matches_plain_squaring() {
        let (input, mut gw) = setup("3*2^200+1");
        let mut task = StrongCheckExp::gerbicz(Integer::from(2u32), 200, 4, None, None);
        task.init(&mut gw, None, None, 0, None).unwrap();
        task.init_state(TaskState::Value {
            iteration: 0,
            x: Integer::from(3u32),
        });
        task.run(&mut gw, &TaskContext::default()).unwrap();
        let expected = reference_pow(
            &Integer::from(3u32),
            &(Integer::from(1u32) << 200u32),
            input.value(),
        );
        assert_eq!(task.result().unwrap(), expected);
        assert_eq!(task.base().restart_count, 0);
    }

    #[test]
    fn smooth_general_base_matches_reference() {
        let (input, mut gw) = setup("2*5^150-1");
        let mut task = StrongCheckExp::gerbicz(Integer::from(5u32), 150, 4, None, None);
        task.init(&mut gw, None, None, 0, None).unwrap();
        task.init_state(TaskState::Value {
            iteration: 0,
            x: Integer::from(3u32),
        });
        task.run(&mut gw, &TaskContext::default()).unwrap();
        let expected = reference_pow(
            &Integer::from(3u32),
            &Integer::from(5u32).pow(150u32),
            input.value(),
        );
        assert_eq!(task.result().unwrap(), expected);
    }

    #[test]
    fn li_matches_fast_exp() {
        let (input, mut gw) = setup("3*2^300+1");
        let exp = Integer::from(&*input.value() - 1u32);
        let mut task = StrongCheckExp::li(exp.clone(), 4, None);
        task.init(&mut gw, None, None, 5, None).unwrap();
        task.run(&mut gw, &TaskContext::default()).unwrap();
        let expected = reference_pow(&Integer::from(5u32), &exp, input.value());
        assert_eq!(task.result().unwrap(), expected);
    }

    #[test]
    fn li_with_ragged_exponent() {
        // Exponent with no trailing-zero structure exercises the window
        // sum across partial final blocks.
        let (input, mut gw) = setup("960^32+1");
        let exp = Integer::from(&*input.value() - 1u32);
        let mut task = StrongCheckExp::li(exp.clone(), 3, None);
        task.init(&mut gw, None, None, 3, None).unwrap();
        task.run(&mut gw, &TaskContext::default()).unwrap();
        let expected = reference_pow(&Integer::from(3u32), &exp, input.value());
        assert_eq!(task.result().unwrap(), expected);
    }

    #[test]
    fn fault_triggers_rollback_and_recovers() {
        let (input, mut gw) = setup("3*2^200+1");
        gw.inject_fault(80, 7);
        let mut task = StrongCheckExp::gerbicz(Integer::from(2u32), 200, 4, None, None);
        task.init(&mut gw, None, None, 0, None).unwrap();
        task.init_state(TaskState::Value {
            iteration: 0,
            x: Integer::from(3u32),
        });
        task.run(&mut gw, &TaskContext::default()).unwrap();
        assert!(task.base().restart_count > 0, "fault must trigger a restart");
        let expected = reference_pow(
            &Integer::from(3u32),
            &(Integer::from(1u32) << 200u32),
            input.value(),
        );
        assert_eq!(task.result().unwrap(), expected);
    }

    #[test]
    fn li_fault_triggers_rollback_and_recovers() {
        let (input, mut gw) = setup("3*2^300+1");
        gw.inject_fault(150, 11);
        let exp = Integer::from(&*input.value() - 1u32);
        let mut task = StrongCheckExp::li(exp.clone(), 4, None);
        task.init(&mut gw, None, None, 5, None).unwrap();
        task.run(&mut gw, &TaskContext::default()).unwrap();
        assert!(task.base().restart_count > 0);
        let expected = reference_pow(&Integer::from(5u32), &exp, input.value());
        assert_eq!(task.result().unwrap(), expected);
    }

    #[test]
    fn fault_in_first_block_restarts_from_seed() {
        let (input, mut gw) = setup("3*2^200+1");
        gw.inject_fault(35, 5);
        let mut task = StrongCheckExp::gerbicz(Integer::from(2u32), 200, 4, None, None);
        task.init(&mut gw, None, None, 0, None).unwrap();
        task.init_state(TaskState::Value {
            iteration: 0,
            x: Integer::from(3u32),
        });
        task.run(&mut gw, &TaskContext::default()).unwrap();
        assert!(task.base().restart_count > 0);
        let expected = reference_pow(
            &Integer::from(3u32),
            &(Integer::from(1u32) << 200u32),
            input.value(),
        );
        assert_eq!(task.result().unwrap(), expected);
    }

    #[test]
    fn recovery_file_resume_reaches_same_result() {
        let (input, mut gw) = setup("3*2^200+1");
        let dir = tempfile::tempdir().unwrap();
        let file = File::new(dir.path().join("c"), input.fingerprint());
        let recovery = File::new(dir.path().join("r"), input.fingerprint());

        let mut task = StrongCheckExp::gerbicz(Integer::from(2u32), 200, 4, None, None);
        task.init(
            &mut gw,
            Some(file.clone()),
            Some(recovery.clone()),
            0,
            None,
        )
        .unwrap();
        task.init_state(TaskState::Value {
            iteration: 0,
            x: Integer::from(3u32),
        });
        task.run(&mut gw, &TaskContext::default()).unwrap();
        let expected = task.result().unwrap();
        assert!(recovery.exists());

        // A fresh task picks the recovery record up from disk.
        let mut resumed = StrongCheckExp::gerbicz(Integer::from(2u32), 200, 4, None, None);
        resumed
            .init(&mut gw, Some(file), Some(recovery), 0, None)
            .unwrap();
        resumed.run(&mut gw, &TaskContext::default()).unwrap();
        assert_eq!(resumed.result().unwrap(), expected);
    }

    #[test]
    fn points_inside_blocks_are_emitted() {
        let (input, mut gw) = setup("3*2^240+1");
        let recorded: std::rc::Rc<std::cell::RefCell<Vec<(u32, Integer)>>> = Default::default();
        let sink = recorded.clone();
        let mut task = StrongCheckExp::gerbicz(
            Integer::from(2u32),
            240,
            4,
            Some(Box::new(move |_idx, pos, x| {
                sink.borrow_mut().push((pos, x.clone()));
                false
            })),
            None,
        );
        task.init(&mut gw, None, None, 0, None).unwrap();
        task.init_state(TaskState::Value {
            iteration: 0,
            x: Integer::from(3u32),
        });
        task.run(&mut gw, &TaskContext::default()).unwrap();

        let recorded = recorded.borrow();
        assert!(!recorded.is_empty());
        for (pos, x) in recorded.iter() {
            let expected = reference_pow(
                &Integer::from(3u32),
                &(Integer::from(1u32) << *pos),
                input.value(),
            );
            assert_eq!(x, &expected, "point at {}", pos);
        }
    }

    #[test]
    fn tail_applied_after_final_check() {
        let (input, mut gw) = setup("3*2^200+1");
        let tail = Integer::from(25u32);
        let mut task = StrongCheckExp::gerbicz(Integer::from(2u32), 200, 4, None, None);
        task.init(&mut gw, None, None, 0, Some(tail.clone())).unwrap();
        task.init_state(TaskState::Value {
            iteration: 0,
            x: Integer::from(3u32),
        });
        task.run(&mut gw, &TaskContext::default()).unwrap();
        let expected = reference_pow(
            &Integer::from(3u32),
            &(Integer::from(1u32) << 200u32),
            input.value(),
        ) * tail
            % input.value();
        assert_eq!(task.result().unwrap(), expected);
    }
}

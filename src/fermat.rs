//! # Fermat — Fermat / Proth Test Driver
//!
//! Runs `a^(N−1)` (Fermat PRP) or `a^((N−1)/2)` (Proth) with the engine
//! picked by the requested safety level:
//!
//! | proof | strong check | base       | engine                        |
//! |-------|--------------|------------|-------------------------------|
//! | no    | no           | any        | `FastExp`                     |
//! | no    | yes          | 2          | Gerbicz `StrongCheckExp`      |
//! | no    | yes          | other      | Gerbicz–Li `StrongCheckExp`   |
//! | yes   | either       | 2          | multipoint over proof points  |
//! | yes   | either       | other      | explicit-exponent multipoint  |
//!
//! The small exponentiations around the main chain (the `a^k` prefix, the
//! `a^(c−1)` tail, the final `^b` step of a Proth run) ride the careful
//! path. For Proth, the base `a` is the least prime with
//! `jacobi(N, a) = −1`; finding a divisor of `N` on the way is already a
//! verdict.

use std::cell::RefCell;
use std::rc::Rc;

use rug::ops::Pow;
use rug::Integer;

use crate::exp::{FastExp, MultipointExp, OnPoint, Point, SlowExp};
use crate::file::File;
use crate::gw::{self, GwState};
use crate::input::{is_small_prime, InputNum};
use crate::params::Params;
use crate::proof::Proof;
use crate::report;
use crate::state::TaskState;
use crate::strong::{gerbicz_params, StrongCheckExp};
use crate::task::{Task, TaskContext, TaskError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FermatKind {
    Auto,
    Fermat,
    Proth,
    Pocklington,
}

/// Least prime `p` with `jacobi(N, p) = −1` for `N = k·2^n + 1`.
/// A negative return is a divisor of `N` found on the way.
pub fn gen_proth_base(k: &Integer, n: u32) -> i64 {
    if k.significant_bits() <= 32 && n < 3 {
        let kw = k.to_u32().unwrap_or(0);
        if n == 1 && kw == 1 {
            return 2;
        }
        if n == 2 {
            return 2;
        }
        return -1;
    }
    let mut p = 3u64;
    loop {
        if is_small_prime(p) {
            let kmodp = Integer::from(k % Integer::from(p)).to_u64().unwrap();
            if kmodp != 0 {
                let tp = mod_pow_u64(2, n as u64, p);
                let nmodp = (kmodp * tp + 1) % p;
                if nmodp == 0 {
                    return -(p as i64);
                }
                let j = Integer::from(nmodp).jacobi(&Integer::from(p));
                if j == -1 {
                    return p as i64;
                }
            }
        }
        p += 2;
        if p > i64::MAX as u64 {
            return -1;
        }
    }
}

fn mod_pow_u64(base: u64, mut exp: u64, m: u64) -> u64 {
    let m = m as u128;
    let mut acc = 1u128;
    let mut b = base as u128 % m;
    while exp > 0 {
        if exp & 1 == 1 {
            acc = acc * b % m;
        }
        b = b * b % m;
        exp >>= 1;
    }
    acc as u64
}

enum Engine {
    Fast(FastExp),
    Multi(MultipointExp),
    Strong(StrongCheckExp),
}

impl Engine {
    fn run(&mut self, gw: &mut GwState, ctx: &TaskContext) -> Result<(), TaskError> {
        match self {
            Engine::Fast(t) => t.run(gw, ctx),
            Engine::Multi(t) => t.run(gw, ctx),
            Engine::Strong(t) => t.run(gw, ctx),
        }
    }

    fn result(&self) -> Option<Integer> {
        match self {
            Engine::Fast(t) => t.result(),
            Engine::Multi(t) => t.result(),
            Engine::Strong(t) => t.result(),
        }
    }

    fn state_iteration(&self) -> Option<u32> {
        match self {
            Engine::Fast(t) => t.base().state.as_ref().map(|s| s.iteration()),
            Engine::Multi(t) => t.state().map(|s| s.iteration()),
            Engine::Strong(t) => t.state().map(|s| s.iteration()),
        }
    }

    fn state_x(&self) -> Option<Integer> {
        match self {
            Engine::Fast(t) => t.base().state.as_ref().and_then(|s| s.x()),
            Engine::Multi(t) => t.state().and_then(|s| s.x()),
            Engine::Strong(t) => t.state().and_then(|s| s.x()),
        }
    }
}

pub struct Fermat {
    kind: FermatKind,
    a: i64,
    n_eff: u32,
    smooth: bool,
    strong: bool,
    strong_count: u32,
    strong_l: Option<u32>,
    gerbicz_count: Option<u32>,
    sliding_window: Option<u32>,
    xm1: Rc<RefCell<Option<Integer>>>,
    pub res64: String,
    pub prime: bool,
    pub success: bool,
}

impl Fermat {
    pub fn new(kind: FermatKind, input: &InputNum, params: &mut Params) -> Fermat {
        let kind = if matches!(kind, FermatKind::Auto | FermatKind::Proth)
            && input.b() == 2
            && input.c() == 1
        {
            FermatKind::Proth
        } else if kind == FermatKind::Auto {
            FermatKind::Fermat
        } else {
            kind
        };

        let mut a = params.fermat_base.unwrap_or(3) as i64;
        if kind == FermatKind::Proth {
            a = gen_proth_base(&input.k(), input.n());
            if a < 0 {
                report::result(&format!(
                    "{} is not prime, divisible by {}.",
                    input.display_text(),
                    -a
                ));
            }
        }
        if a > 0 {
            params.maxmulbyconst = params.maxmulbyconst.max(a as u32);
        }
        let proth_like = matches!(kind, FermatKind::Proth | FermatKind::Pocklington);
        let n_eff = input.n() - proth_like as u32;
        // Base-2 inputs ride the smooth (squaring) engines; c != 1 becomes
        // a careful tail multiplication outside the chain.
        let smooth = input.b() == 2;

        Fermat {
            kind,
            a,
            n_eff,
            smooth,
            strong: params.check_strong,
            strong_count: params.strong_count.unwrap_or(16),
            strong_l: params.strong_l,
            gerbicz_count: params.gerbicz_count,
            sliding_window: params.sliding_window,
            xm1: Rc::new(RefCell::new(None)),
            res64: String::new(),
            prime: false,
            success: false,
        }
    }

    pub fn kind(&self) -> FermatKind {
        self.kind
    }

    pub fn a(&self) -> i64 {
        self.a
    }

    /// Override the base (Pocklington retries with the next prime).
    pub fn set_a(&mut self, a: i64) {
        self.a = a;
    }

    /// `a^((N−1)/b)` — the residue one `b`-step short of the full chain.
    pub fn xm1(&self) -> Option<Integer> {
        self.xm1.borrow().clone()
    }

    /// Iterations the proof's point schedule spans for this input.
    pub fn proof_iterations(&self, input: &InputNum) -> u32 {
        if self.smooth {
            self.n_eff
        } else {
            self.explicit_exp(input).significant_bits() - 1
        }
    }

    /// The full exponent the explicit path raises `a` to:
    /// `k·b^n_eff + c − 1`.
    fn explicit_exp(&self, input: &InputNum) -> Integer {
        let mut exp = if input.b() == 2 {
            input.k() << self.n_eff
        } else {
            input.k() * input.gb().pow(self.n_eff)
        };
        exp += input.c() - 1;
        exp
    }

    fn proth_like(&self) -> bool {
        matches!(self.kind, FermatKind::Proth | FermatKind::Pocklington)
    }

    fn make_on_point(&self, recorder: Option<crate::proof::PointRecorder>) -> OnPoint {
        let xm1 = self.xm1.clone();
        let capture_pos = if self.proth_like() && self.smooth {
            Some(self.n_eff)
        } else {
            None
        };
        Box::new(move |idx, pos, x| {
            let mut durable = false;
            if let Some(rec) = &recorder {
                durable = rec.record(idx, x);
            }
            if capture_pos == Some(pos) {
                *xm1.borrow_mut() = Some(x.clone());
            }
            durable
        })
    }

    /// Run the test. With a proof, the engine records the proof points and
    /// the save fold runs right after the chain completes.
    pub fn run(
        &mut self,
        input: &InputNum,
        gw: &mut GwState,
        ctx: &TaskContext,
        file_checkpoint: &File,
        file_recovery: &File,
        mut proof: Option<&mut Proof>,
    ) -> Result<(), TaskError> {
        self.success = false;
        self.prime = false;
        self.res64.clear();
        *self.xm1.borrow_mut() = None;
        if self.a < 0 {
            return Ok(());
        }
        let a = self.a as u32;
        let started = std::time::Instant::now();

        match self.kind {
            FermatKind::Proth => tracing::info!(
                "Proth test of {}, a = {}",
                input.display_text(),
                self.a
            ),
            FermatKind::Fermat => tracing::info!(
                "Fermat probabilistic test of {}, a = {}",
                input.display_text(),
                self.a
            ),
            _ => {}
        }

        // The careful tail value: smooth engines compute a^(k·b^n) and the
        // a^(c−1) factor is folded in at the end, inverted for c < 0.
        // Explicit engines carry c−1 in the exponent itself.
        let smooth_engine = self.smooth && (self.strong || proof.is_some());
        let tail = if smooth_engine && input.c() != 1 {
            let c_abs = Integer::from((input.c() - 1).unsigned_abs());
            let mut t = SlowExp::new(c_abs);
            t.init(gw, None, Integer::from(a));
            t.run(gw, ctx)?;
            let mut tail = t.result().ok_or(TaskError::Abort)?;
            if input.c() < 0 {
                tail = tail.invert(gw.n()).map_err(|_| TaskError::Abort)?;
            }
            Some(tail)
        } else {
            None
        };

        if let Some(proof) = proof.as_deref_mut() {
            let iterations = if self.smooth {
                self.n_eff
            } else {
                self.explicit_exp(input).significant_bits() - 1
            };
            proof.calc_points(
                iterations,
                self.smooth && input.c() == 1,
                self.gerbicz_count,
            );
        }

        // Engine selection.
        let recorder = proof.as_deref().map(|p| p.recorder());
        let mut engine = self.build_engine(input, proof.as_deref(), recorder);

        // Init and seed.
        match &mut engine {
            Engine::Fast(t) => {
                t.init(gw, Some(file_checkpoint.clone()), a, tail.clone())?;
            }
            Engine::Multi(t) => {
                t.init(gw, Some(file_checkpoint.clone()), a, tail.clone())?;
            }
            Engine::Strong(t) => {
                t.init(
                    gw,
                    Some(file_checkpoint.clone()),
                    Some(file_recovery.clone()),
                    a,
                    tail.clone(),
                )?;
            }
        }

        // Resume from the furthest durable proof point when it is ahead of
        // the engine's own checkpoint.
        if let Some(proof) = proof.as_deref() {
            let aligned = matches!(engine, Engine::Strong(_));
            if let Some((idx, x)) = proof.furthest_point(aligned) {
                let pos = proof.points()[idx];
                if engine.state_iteration().map_or(true, |i| i < pos) {
                    match &mut engine {
                        Engine::Multi(t) => t.init_state(TaskState::Value { iteration: pos, x }),
                        Engine::Strong(t) => t.init_state(TaskState::Value { iteration: pos, x }),
                        Engine::Fast(_) => {}
                    }
                }
            }
        }

        if self.smooth && !matches!(engine, Engine::Fast(_)) {
            let needs_seed = engine.state_iteration().is_none();
            if needs_seed {
                // a^k prefix on the careful path.
                let ak = if input.k() == 1 {
                    Integer::from(a)
                } else {
                    let mut t = SlowExp::new(input.k());
                    t.init(gw, None, Integer::from(a));
                    t.run(gw, ctx)?;
                    t.result().ok_or(TaskError::Abort)?
                };
                if let Some(proof) = proof.as_deref() {
                    proof.on_point(0, &ak);
                }
                match &mut engine {
                    Engine::Fast(_) => {}
                    Engine::Multi(t) => t.init_state(TaskState::Value { iteration: 0, x: ak }),
                    Engine::Strong(t) => t.init_state(TaskState::Value { iteration: 0, x: ak }),
                }
            } else if self.proth_like() && engine.state_iteration() == Some(self.n_eff) {
                *self.xm1.borrow_mut() = engine.state_x();
            }
        }

        engine.run(gw, ctx)?;
        let mut x_final = engine.result().ok_or(TaskError::Abort)?;

        // Explicit paths stop one b-step short for Proth/Pocklington.
        if self.proth_like() && !smooth_engine {
            *self.xm1.borrow_mut() = Some(x_final.clone());
            let mut t = SlowExp::new(input.gb());
            t.init(gw, None, x_final);
            t.run(gw, ctx)?;
            x_final = t.result().ok_or(TaskError::Abort)?;
        }

        // Verdict.
        let time = started.elapsed().as_secs_f64();
        if self.kind == FermatKind::Proth {
            let xm1 = self.xm1.borrow().clone().ok_or(TaskError::Abort)?;
            let mut xp1 = xm1 + 1u32;
            gw.norm(&mut xp1);
            if xp1 == 0u32 {
                self.success = true;
                self.prime = true;
                report::result(&format!(
                    "{} is prime! Time: {:.1} s.",
                    input.display_text(),
                    time
                ));
            } else {
                self.res64 = gw::res64(&xp1);
                report::result(&format!(
                    "{} is not prime. RES64: {}, time: {:.1} s.",
                    input.display_text(),
                    self.res64,
                    time
                ));
            }
        } else if x_final != 1u32 {
            self.res64 = gw::res64(&x_final);
            report::result(&format!(
                "{} is not prime. RES64: {}, time: {:.1} s.",
                input.display_text(),
                self.res64,
                time
            ));
        }
        if !self.prime && x_final == 1u32 {
            self.success = true;
            if self.kind != FermatKind::Pocklington {
                report::result(&format!(
                    "{} is a probable prime. Time: {:.1} s.",
                    input.display_text(),
                    time
                ));
            }
        }

        if let Some(proof) = proof.as_deref_mut() {
            proof.run_save(input, gw)?;
        }

        file_checkpoint.clear();
        file_recovery.clear();
        Ok(())
    }

    fn build_engine(
        &self,
        input: &InputNum,
        proof: Option<&Proof>,
        recorder: Option<crate::proof::PointRecorder>,
    ) -> Engine {
        match proof {
            None if !self.strong => {
                // Plain fast chain; tail folded by the task itself.
                Engine::Fast(FastExp::new(self.explicit_exp(input)))
            }
            None if self.smooth => {
                let mut t = StrongCheckExp::gerbicz(
                    input.gb(),
                    self.n_eff,
                    self.strong_count,
                    Some(self.make_on_point(None)),
                    self.strong_l,
                );
                if self.proth_like() {
                    t.points.push(Point::new(self.n_eff + 1));
                }
                Engine::Strong(t)
            }
            None => Engine::Strong(StrongCheckExp::li(
                self.explicit_exp(input),
                self.strong_count,
                self.strong_l,
            )),
            Some(proof) => {
                let mut points: Vec<Point> = proof
                    .points()
                    .iter()
                    .map(|&p| Point::new(p))
                    .collect();
                if self.smooth {
                    let n = self.n_eff;
                    if points.last().map_or(true, |p| p.pos != n) {
                        points.push(Point::new(n));
                    }
                    if self.proth_like() {
                        points.push(Point::new(n + 1));
                    }
                }
                let on_point = self.make_on_point(recorder);
                if !self.strong {
                    let mut t = if self.smooth {
                        MultipointExp::new_smooth(input.gb(), points, Some(on_point))
                    } else {
                        MultipointExp::new_explicit(
                            self.explicit_exp(input),
                            points,
                            Some(on_point),
                        )
                    };
                    t.w = self.sliding_window;
                    Engine::Multi(t)
                } else {
                    let ppc = proof.points_per_check();
                    let cpp = proof.checks_per_point();
                    let span = proof.m() * ppc / cpp.max(1);
                    let (l, l2) = match self.strong_l {
                        Some(l) => (l, span - span % l),
                        None => gerbicz_params(span),
                    };
                    let mut t = if self.smooth {
                        StrongCheckExp::new(input.gb(), true, points, l, l2, Some(on_point))
                    } else {
                        StrongCheckExp::new(
                            self.explicit_exp(input),
                            false,
                            points,
                            l,
                            l2,
                            Some(on_point),
                        )
                    };
                    t.points_per_check = ppc;
                    t.w = self.sliding_window;
                    Engine::Strong(t)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::reset_abort;

    fn run_fermat(
        spec: &str,
        kind: FermatKind,
        params: &mut Params,
        proof: Option<&mut Proof>,
    ) -> (Fermat, InputNum) {
        reset_abort();
        let input = InputNum::parse(spec).unwrap();
        let mut fermat = Fermat::new(kind, &input, params);
        let mut gw = GwState::setup(&input, params.maxmulbyconst.max(100)).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let ckpt = File::new(dir.path().join("c"), input.fingerprint());
        let rcvr = File::new(dir.path().join("r"), input.fingerprint());
        fermat
            .run(&input, &mut gw, &TaskContext::default(), &ckpt, &rcvr, proof)
            .unwrap();
        (fermat, input)
    }

    #[test]
    fn proth_base_for_3_2_353() {
        let k = Integer::from(3u32);
        assert_eq!(gen_proth_base(&k, 353), 5);
    }

    #[test]
    fn proth_proves_3_2_353() {
        let (fermat, _) = run_fermat("3*2^353+1", FermatKind::Proth, &mut Params::default(), None);
        assert!(fermat.prime);
        assert!(fermat.success);
    }

    #[test]
    fn proth_with_strong_check() {
        let mut params = Params {
            check_strong: true,
            ..Params::default()
        };
        let (fermat, _) = run_fermat("3*2^353+1", FermatKind::Proth, &mut params, None);
        assert!(fermat.prime);
    }

    #[test]
    fn proth_rejects_composite() {
        // 3*2^349+1 is composite.
        let (fermat, _) = run_fermat("3*2^349+1", FermatKind::Proth, &mut Params::default(), None);
        assert!(!fermat.prime);
        assert!(!fermat.res64.is_empty());
    }

    #[test]
    fn fermat_prp_non_base2() {
        // 2*5^178-1 is prime, so it is a Fermat PRP to base 3.
        let (fermat, _) = run_fermat("2*5^178-1", FermatKind::Fermat, &mut Params::default(), None);
        assert!(fermat.success);
        assert!(!fermat.prime, "PRP alone is not a proof");
    }

    #[test]
    fn fermat_prp_with_li_check() {
        let mut params = Params {
            check_strong: true,
            ..Params::default()
        };
        let (fermat, _) = run_fermat("2*5^178-1", FermatKind::Fermat, &mut params, None);
        assert!(fermat.success);
    }

    #[test]
    fn fermat_rejects_composite_with_res64() {
        let (fermat, _) = run_fermat("2*5^177-1", FermatKind::Fermat, &mut Params::default(), None);
        assert!(!fermat.success);
        assert_eq!(fermat.res64.len(), 16);
    }

    #[test]
    fn strong_and_fast_agree_on_res64() {
        let (plain, _) = run_fermat("3*2^349+1", FermatKind::Proth, &mut Params::default(), None);
        let mut params = Params {
            check_strong: true,
            ..Params::default()
        };
        let (strong, _) = run_fermat("3*2^349+1", FermatKind::Proth, &mut params, None);
        assert_eq!(plain.res64, strong.res64);
    }
}

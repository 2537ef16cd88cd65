//! # Morrison — N+1 Primality Proof Driver
//!
//! For `N = k·b^n − 1`, primality follows from the Lucas analogue of
//! Pocklington: pick `P` with Kronecker `(P² − 4Q | N) ≠ 1`, compute
//! `V_{N+1}(P, Q)` over the factored exponent, and require
//! `gcd(U_{(N+1)/q}, N) = 1` for a factor subset of `b` covering `√b`.
//!
//! With `Q = ±1` the U-conditions reduce to V-chains
//! (<https://eprint.iacr.org/2023/195>, and BLS Theorem 14 for `Q = −1`):
//!
//! - `Q = 1`:  `gcd(U_{(N+1)/q}, N) = gcd(V_{2(N+1)/q} − 2, N)`
//! - `Q = −1`: `gcd(U_{(N+1)/q}, N) = gcd(V_{(N+1)/2q}, N)`, and the
//!   factor 2 is tested for free.
//!
//! `Q = −1` applies when `N ≡ 3 (mod 4)`. A failed residue condition at
//! the `V` level means a different `P` is needed; the chosen `P` persists
//! in a small params file so a restarted run does not repeat the search.
//! The factored multiply rides DAC chains; with the strong check enabled
//! the main chain runs through the Gerbicz–Li UV engine instead.

use rug::ops::Pow;
use rug::Integer;

use crate::exp::Product;
use crate::file::File;
use crate::gw::{self, GwState};
use crate::input::InputNum;
use crate::lucas::{LucasUVMulFast, LucasVMulFast};
use crate::params::Params;
use crate::report;
use crate::state::TaskState;
use crate::task::{Task, TaskContext, TaskError};

pub struct Morrison {
    neg_q: bool,
    p: u32,
    strong: bool,
    /// Indices into `b_factors()` whose gcd condition is verified.
    checked: Vec<usize>,
    factors_str: String,
    pub res64: String,
    pub prime: bool,
    pub success: bool,
}

/// The chain stages shared by the main task and the factor passes.
struct ChainPlan {
    /// (giant, count) multipliers: k (or k/2).
    giants: Vec<(Integer, u32)>,
    /// (prime, count) multipliers from the factorization of b.
    primes: Vec<(u64, u32)>,
}

impl Morrison {
    pub fn new(input: &InputNum, params: &Params) -> Result<Morrison, TaskError> {
        if input.c() != -1 {
            tracing::error!("Morrison test needs k*b^n-1");
            return Err(TaskError::Abort);
        }
        let n_value = input.value();
        // Q = −1 when N ≡ 3 (mod 4).
        let neg_q = n_value.get_bit(0) && n_value.get_bit(1);

        // Factor subset covering √b, largest prime powers first.
        let mut candidates: Vec<(Integer, usize)> = input
            .b_factors()
            .iter()
            .enumerate()
            .map(|(i, &(p, e))| (Integer::from(p).pow(e), i))
            .collect();
        candidates.sort_by(|x, y| y.0.cmp(&x.0));
        let gb = input.gb();
        let mut covered = Integer::from(1u32);
        let mut factors_str = String::new();
        let mut checked = Vec::new();
        for (pe, idx) in candidates {
            if Integer::from(&covered * &covered) >= gb {
                break;
            }
            covered *= pe;
            if !factors_str.is_empty() {
                factors_str.push_str(", ");
            }
            factors_str.push_str(&input.b_factors()[idx].0.to_string());
            checked.push(idx);
        }

        // Least P with Kronecker (P² ∓ 4 | N) ≠ 1.
        let mut p = 3u32;
        while kronecker(p, neg_q, n_value) == 1 {
            p += 1;
        }

        Ok(Morrison {
            neg_q,
            p,
            strong: params.check_strong,
            checked,
            factors_str,
            res64: String::new(),
            prime: false,
            success: false,
        })
    }

    pub fn p(&self) -> u32 {
        self.p
    }

    pub fn neg_q(&self) -> bool {
        self.neg_q
    }

    /// Multiplier stages for `V_{(N+1)} / held-out factors`, with one
    /// power of each checked factor held out and the `Q = ±1`
    /// adjustments applied.
    fn chain_plan(&self, input: &InputNum) -> ChainPlan {
        let mut giants = Vec::new();
        let mut primes: Vec<(u64, u32)> = Vec::new();
        let mut div2 = false;

        // Q = 1 carries one extra doubling (the V_{2m} identities).
        if !self.neg_q {
            primes.push((2, 1));
        }

        let k = input.k();
        if k != 1 {
            if self.neg_q && !k.get_bit(0) {
                div2 = true;
                giants.push((Integer::from(&k >> 1u32), 1));
            } else {
                giants.push((k, 1));
            }
        }

        for (i, &(p, e)) in input.b_factors().iter().enumerate() {
            let mut count = input.n() * e;
            if !div2 && self.neg_q && p == 2 {
                div2 = true;
                count -= 1;
            }
            if self.checked.contains(&i) {
                count -= 1;
            }
            if count > 0 {
                primes.push((p, count));
            }
        }
        debug_assert_eq!(div2, self.neg_q);
        ChainPlan { giants, primes }
    }

    fn build_v_task(&self, plan: &ChainPlan, dacs: &mut Vec<(u64, u64)>) -> LucasVMulFast {
        let mut task = LucasVMulFast::new(self.neg_q);
        for (b, n) in &plan.giants {
            task.mul_giant(b.clone(), *n);
        }
        for &(p, n) in &plan.primes {
            let hint = dacs.iter().find(|&&(q, _)| q == p).map(|&(_, d)| d);
            let d = task.mul_prime(p, n, hint);
            if hint.is_none() {
                dacs.push((p, d));
            }
        }
        task
    }

    /// The full exponent `(N+1) / 2^{div2}` times the `Q = 1` doubling,
    /// divided by the held-out factors — for the UV strong-check engine.
    fn uv_exponent(&self, input: &InputNum) -> Integer {
        let mut exp = input.k() * input.gb().pow(input.n());
        if self.neg_q {
            exp >>= 1;
        } else {
            exp <<= 1;
        }
        for &i in &self.checked {
            exp /= input.b_factors()[i].0;
        }
        exp
    }

    pub fn run(
        &mut self,
        input: &InputNum,
        gw: &mut GwState,
        ctx: &TaskContext,
        file_checkpoint: &File,
        file_params: &File,
    ) -> Result<(), TaskError> {
        let started = std::time::Instant::now();
        // Resume the persisted P from a previous attempt.
        if let Some(TaskState::LucasV { v, .. }) = file_params.read_state() {
            if let Some(p) = v.to_u32() {
                if p >= self.p {
                    self.p = p;
                }
            }
        }

        self.success = false;
        self.prime = false;
        let expected_v = if self.neg_q { 0u32 } else { 2u32 };
        let mut checkpoint: Option<File> = None;
        let mut restart = false;

        while !self.prime {
            if restart {
                self.p += 1;
                while kronecker(self.p, self.neg_q, gw.n()) == 1 {
                    self.p += 1;
                }
                file_params
                    .write_state(&TaskState::LucasV {
                        iteration: 0,
                        index: 0,
                        v: Integer::from(self.p),
                        parity: true,
                    })
                    .map_err(|_| TaskError::Abort)?;
                if let Some(c) = &checkpoint {
                    c.clear();
                }
            }
            restart = true;
            let time = || started.elapsed().as_secs_f64();

            // P itself must be coprime to N, as must the discriminant.
            let disc = Integer::from(4u32 * self.p)
                * (Integer::from(self.p) * self.p - if self.neg_q { -4i32 } else { 4i32 });
            let g = disc.gcd(gw.n());
            if g != 1u32 {
                self.res64 = gw::res64(&g);
                report::result(&format!(
                    "{} is not prime. Factor RES64: {}, time: {:.1} s.",
                    input.display_text(),
                    self.res64,
                    time()
                ));
                return Ok(());
            }

            tracing::info!(
                "Morrison test of {}, P = {}, Q = {}, factors = {{{}}}",
                input.display_text(),
                self.p,
                if self.neg_q { -1 } else { 1 },
                self.factors_str
            );

            let plan = self.chain_plan(input);
            let mut dacs: Vec<(u64, u64)> = Vec::new();
            let ckpt = file_checkpoint.add_child(&self.p.to_string());

            // Main chain: V at the full exponent less the held-out factors.
            let (main_v, main_parity) = if self.strong {
                let mut task = LucasUVMulFast::new(self.uv_exponent(input), 16);
                let recovery = ckpt.add_child("r");
                task.init(gw, Some(ckpt.clone()), Some(recovery), self.p, self.neg_q);
                task.run(gw, ctx)?;
                task.result().ok_or(TaskError::Abort)?
            } else {
                let mut task = self.build_v_task(&plan, &mut dacs);
                task.init(gw, Some(ckpt.clone()), self.p);
                task.run(gw, ctx)?;
                task.result().ok_or(TaskError::Abort)?
            };
            checkpoint = Some(ckpt);

            // Fold the held-out factors back in to reach V_{N+1}.
            let mut v_full = (main_v.clone(), main_parity);
            if !self.checked.is_empty() {
                let mut task = LucasVMulFast::new(self.neg_q);
                for &i in &self.checked {
                    let (q, _) = input.b_factors()[i];
                    let hint = dacs.iter().find(|&&(p, _)| p == q).map(|&(_, d)| d);
                    task.mul_prime(q, 1, hint);
                }
                task.init(gw, None, self.p);
                task.init_state(TaskState::LucasVFast {
                    iteration: 0,
                    index: 0,
                    v: main_v.clone(),
                    parity: main_parity,
                });
                task.run(gw, ctx)?;
                v_full = task.result().ok_or(TaskError::Abort)?;
            }

            if v_full.0 != expected_v {
                // Necessary condition failed; either N is not even a Lucas
                // PRP (composite) or the arithmetic disagrees.
                self.res64 = gw::res64(&v_full.0);
                let mut settled = false;
                if self.neg_q {
                    // For Q = −1, V_{(N+1)/2} != 0 may still be a PRP:
                    // V_{2(N+1)} must come back to 2.
                    let mut task = LucasVMulFast::new(self.neg_q);
                    task.mul_prime(2, 2, None);
                    task.init(gw, None, self.p);
                    task.init_state(TaskState::LucasVFast {
                        iteration: 0,
                        index: 0,
                        v: v_full.0.clone(),
                        parity: v_full.1,
                    });
                    task.run(gw, ctx)?;
                    let (v4, _) = task.result().ok_or(TaskError::Abort)?;
                    if v4 == 2u32 {
                        self.success = true;
                        settled = true;
                        report::result(&format!(
                            "{} is not prime. RES64: {}, time: {:.1} s.",
                            input.display_text(),
                            self.res64,
                            time()
                        ));
                    } else {
                        self.res64 = gw::res64(&v4);
                    }
                }
                if !settled {
                    report::result(&format!(
                        "{} is not a probable prime. Have you run Fermat test first? RES64: {}, time: {:.1} s.",
                        input.display_text(),
                        self.res64,
                        time()
                    ));
                }
                return Ok(());
            }
            self.success = true;

            // Per-factor gcd conditions.
            if !self.checked.is_empty() {
                let mut gs: Vec<Integer> = Vec::new();
                let mut retry = false;
                for &i in &self.checked {
                    let (q, _) = input.b_factors()[i];
                    // V at (N+1)/q: the main chain times every held-out
                    // factor except q.
                    let mut task = LucasVMulFast::new(self.neg_q);
                    for &j in &self.checked {
                        if j != i {
                            let (qj, _) = input.b_factors()[j];
                            let hint = dacs.iter().find(|&&(p, _)| p == qj).map(|&(_, d)| d);
                            task.mul_prime(qj, 1, hint);
                        }
                    }
                    task.init(gw, None, self.p);
                    task.init_state(TaskState::LucasVFast {
                        iteration: 0,
                        index: 0,
                        v: main_v.clone(),
                        parity: main_parity,
                    });
                    task.run(gw, ctx)?;
                    let (vq, vq_parity) = task.result().ok_or(TaskError::Abort)?;
                    if vq == expected_v {
                        // U_{(N+1)/q} ≡ 0: this P proves nothing for q.
                        retry = true;
                        break;
                    }
                    // Double-check: multiplying by q must return to V_{N+1}.
                    let mut check = LucasVMulFast::new(self.neg_q);
                    let hint = dacs.iter().find(|&&(p, _)| p == q).map(|&(_, d)| d);
                    check.mul_prime(q, 1, hint);
                    check.init(gw, None, self.p);
                    check.init_state(TaskState::LucasVFast {
                        iteration: 0,
                        index: 0,
                        v: vq.clone(),
                        parity: vq_parity,
                    });
                    check.run(gw, ctx)?;
                    let (vc, _) = check.result().ok_or(TaskError::Abort)?;
                    if vc != expected_v {
                        tracing::warn!("arithmetic error, restarting");
                        retry = true;
                        break;
                    }
                    let mut g = vq;
                    if !self.neg_q {
                        g -= 2u32;
                        gw.norm(&mut g);
                    }
                    gs.push(g);
                }
                if retry {
                    continue;
                }

                let g = if gs.len() > 1 {
                    let mut task = Product::new(gs);
                    task.run(gw, ctx)?;
                    task.result().ok_or(TaskError::Abort)?
                } else {
                    gs.pop().ok_or(TaskError::Abort)?
                };
                let g = g.gcd(gw.n());
                if g != 1u32 {
                    self.res64 = gw::res64(&g);
                    report::result(&format!(
                        "{} is not prime. Factor RES64: {}, time: {:.1} s.",
                        input.display_text(),
                        self.res64,
                        time()
                    ));
                    return Ok(());
                }
            }
            self.prime = true;
        }

        report::result(&format!(
            "{} is prime! Time: {:.1} s.",
            input.display_text(),
            started.elapsed().as_secs_f64()
        ));
        if let Some(c) = &checkpoint {
            c.clear();
        }
        file_params.clear();
        Ok(())
    }
}

fn kronecker(p: u32, neg_q: bool, n: &Integer) -> i32 {
    let disc = Integer::from(p) * p - if neg_q { -4i32 } else { 4i32 };
    disc.kronecker(n)
}

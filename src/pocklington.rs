//! # Pocklington — N−1 Primality Proof Driver
//!
//! After a Fermat probable-prime pass with base `a`, primality of
//! `N = k·b^n + 1` (with `b^n > k`) follows from Pocklington's theorem if
//! `gcd(a^((N−1)/q) − 1, N) = 1` for every prime `q` of a factor subset
//! covering `√b`. A gcd equal to `N` is inconclusive for that `q`; the
//! test retries with the next prime base (new mul-by-const slot, fresh
//! engine setup, child checkpoint files named after the base). A gcd
//! strictly between 1 and `N` is a factor and `N` is composite.
//!
//! H.C. Pocklington, Proc. Cambridge Phil. Soc. 18 (1914).

use rug::ops::Pow;
use rug::Integer;

use crate::exp::{Product, SlowExp};
use crate::file::File;
use crate::gw::{self, GwState};
use crate::input::{next_prime, InputNum};
use crate::params::Params;
use crate::proof::Proof;
use crate::report;
use crate::fermat::{gen_proth_base, Fermat, FermatKind};
use crate::task::{Task, TaskContext, TaskError};

pub struct Pocklington {
    fermat: Fermat,
    /// Indices into `input.b_factors()` still awaiting a conclusive gcd.
    pending: Vec<usize>,
    pub res64: String,
    pub prime: bool,
}

impl Pocklington {
    pub fn new(input: &InputNum, params: &mut Params) -> Pocklington {
        let mut fermat = Fermat::new(FermatKind::Pocklington, input, params);

        // Pick the largest prime powers of b until their product covers √b.
        let mut factors: Vec<(Integer, usize)> = input
            .b_factors()
            .iter()
            .enumerate()
            .map(|(i, &(p, e))| (Integer::from(p).pow(e), i))
            .collect();
        factors.sort_by(|x, y| y.0.cmp(&x.0));
        let gb = input.gb();
        let mut covered = Integer::from(1u32);
        let mut pending = Vec::new();
        for (pe, idx) in factors {
            if Integer::from(&covered * &covered) >= gb {
                break;
            }
            covered *= pe;
            pending.push(idx);
        }

        // Base-2-expressible inputs get the Proth base of the rewritten
        // form, which keeps the mul-by-const slot tight.
        if let Some((k2, n2)) = input.to_base2() {
            let a = gen_proth_base(&k2, n2);
            fermat.set_a(a);
            if a > 0 {
                params.maxmulbyconst = params.maxmulbyconst.max(a as u32);
            }
        }

        Pocklington {
            fermat,
            pending,
            res64: String::new(),
            prime: false,
        }
    }

    pub fn a(&self) -> i64 {
        self.fermat.a()
    }

    pub fn success(&self) -> bool {
        self.fermat.success
    }

    pub fn run(
        &mut self,
        input: &InputNum,
        gw: &mut GwState,
        ctx: &TaskContext,
        file_checkpoint: &File,
        file_recovery: &File,
        mut proof: Option<&mut Proof>,
    ) -> Result<(), TaskError> {
        let started = std::time::Instant::now();
        let factor_list = |pending: &[usize]| {
            pending
                .iter()
                .map(|&i| input.b_factors()[i].0.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        tracing::info!(
            "Pocklington test of {}, a = {}, factors = {{{}}}",
            input.display_text(),
            self.fermat.a(),
            factor_list(&self.pending)
        );

        self.fermat.run(
            input,
            gw,
            ctx,
            file_checkpoint,
            file_recovery,
            proof.as_deref_mut(),
        )?;

        let mut checkpoint = file_checkpoint.clone();
        let mut recovery = file_recovery.clone();
        let mut gs: Vec<Integer> = Vec::new();
        while !self.pending.is_empty() {
            if !self.fermat.success {
                return Ok(());
            }
            let mut xm1 = self.fermat.xm1().ok_or(TaskError::Abort)?;

            let mut still_pending = Vec::new();
            for &idx in &self.pending {
                let (q, _) = input.b_factors()[idx];
                let exp = input.gb() / q;
                let value = if exp == 1u32 {
                    xm1.clone()
                } else {
                    let mut task = SlowExp::new(exp);
                    task.init(gw, None, xm1.clone());
                    task.run(gw, ctx)?;
                    xm1 = task.take_x0();
                    task.result().ok_or(TaskError::Abort)?
                };
                if value != 1u32 {
                    gs.push(value - 1u32);
                } else {
                    // a^((N−1)/q) ≡ 1: this base proves nothing for q.
                    still_pending.push(idx);
                }
            }
            self.pending = still_pending;

            if !self.pending.is_empty() {
                if proof.is_some() {
                    tracing::error!(
                        "Pocklington test needs to restart, disable proofs to proceed"
                    );
                    return Err(TaskError::Abort);
                }
                // Bump to the next prime base; the engine and its constant
                // slot are rebuilt, and the checkpoints move to child
                // files so the runs cannot be conflated.
                let a = next_prime(self.fermat.a().max(0) as u64);
                tracing::warn!(
                    "restarting Pocklington test of {}, a = {}, factors = {{{}}}",
                    input.display_text(),
                    a,
                    factor_list(&self.pending)
                );
                *gw = GwState::setup(input, gw.maxmulbyconst.max(a as u32))
                    .map_err(|_| TaskError::Abort)?;
                self.fermat.set_a(a as i64);
                checkpoint = file_checkpoint.add_child(&a.to_string());
                recovery = file_recovery.add_child(&a.to_string());
                self.fermat
                    .run(input, gw, ctx, &checkpoint, &recovery, None)?;
            }
        }

        let g = if gs.len() > 1 {
            let mut task = Product::new(std::mem::take(&mut gs));
            task.run(gw, ctx)?;
            task.result().ok_or(TaskError::Abort)?
        } else {
            gs.pop().ok_or(TaskError::Abort)?
        };
        let g = g.gcd(gw.n());
        let time = started.elapsed().as_secs_f64();
        if g == 1u32 {
            self.prime = true;
            report::result(&format!(
                "{} is prime! Time: {:.1} s.",
                input.display_text(),
                time
            ));
        } else {
            self.res64 = gw::res64(&g);
            report::result(&format!(
                "{} is not prime. Factor RES64: {}, time: {:.1} s.",
                input.display_text(),
                self.res64,
                time
            ));
        }

        file_checkpoint.clear();
        file_recovery.clear();
        checkpoint.clear();
        recovery.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::reset_abort;

    fn run_pocklington(spec: &str) -> (Pocklington, InputNum) {
        reset_abort();
        let input = InputNum::parse(spec).unwrap();
        let mut params = Params::default();
        let mut pock = Pocklington::new(&input, &mut params);
        let mut gw = GwState::setup(&input, params.maxmulbyconst.max(1000)).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let ckpt = File::new(dir.path().join("c"), input.fingerprint());
        let rcvr = File::new(dir.path().join("r"), input.fingerprint());
        pock.run(&input, &mut gw, &TaskContext::default(), &ckpt, &rcvr, None)
            .unwrap();
        (pock, input)
    }

    #[test]
    fn proves_generalized_fermat() {
        // 960^128+1 is a generalized Fermat prime.
        let (pock, _) = run_pocklington("960^128+1");
        assert!(pock.prime);
    }

    #[test]
    fn proves_odd_base_prime() {
        // 2*3^54+1 is prime; 3^54 > 2, so Pocklington applies with factor 3.
        let input = InputNum::parse("2*3^54+1").unwrap();
        assert_ne!(
            input.value().is_probably_prime(30),
            rug::integer::IsPrime::No
        );
        let (pock, _) = run_pocklington("2*3^54+1");
        assert!(pock.prime);
    }

    #[test]
    fn rejects_composite() {
        let input = InputNum::parse("2*3^55+1").unwrap();
        assert_eq!(
            input.value().is_probably_prime(30),
            rug::integer::IsPrime::No
        );
        let (pock, _) = run_pocklington("2*3^55+1");
        assert!(!pock.prime);
        assert!(!pock.success());
    }

    #[test]
    fn factor_subset_covers_sqrt_b() {
        let input = InputNum::parse("960^128+1").unwrap();
        let mut params = Params::default();
        let pock = Pocklington::new(&input, &mut params);
        let mut covered = Integer::from(1u32);
        for &i in &pock.pending {
            let (p, e) = input.b_factors()[i];
            covered *= Integer::from(p).pow(e);
        }
        assert!(Integer::from(&covered * &covered) >= input.gb());
    }
}

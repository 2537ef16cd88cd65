//! # Order — Multiplicative Order Computation
//!
//! For a prime `N = k·b^n + 1` with fully factored `N−1`, computes the
//! multiplicative order of a small `a`: each prime power `p^e` dividing
//! `N−1` is eliminated by raising `a` to `(N−1)/p^e` carefully and then
//! stepping back up one `p` at a time, stopping as soon as the residue
//! hits 1. A residue that fails to reach 1 within `e` steps disproves the
//! primality of `N` and aborts the run.

use rug::ops::Pow;
use rug::Integer;

use crate::exp::{FastExp, SlowExp};
use crate::file::File;
use crate::gw::GwState;
use crate::input::InputNum;
use crate::params::Params;
use crate::report;
use crate::strong::StrongCheckExp;
use crate::task::{Task, TaskContext, TaskError};

pub struct Order {
    a: u32,
    strong: bool,
    strong_count: u32,
    /// `ord(a) = ∏ p^e` as computed.
    pub order: Vec<(Integer, u32)>,
}

impl Order {
    pub fn new(a: u32, params: &mut Params) -> Order {
        params.maxmulbyconst = params.maxmulbyconst.max(a);
        Order {
            a,
            strong: params.check_strong,
            strong_count: params.strong_count.unwrap_or(16),
            order: Vec::new(),
        }
    }

    pub fn run(
        &mut self,
        input: &InputNum,
        gw: &mut GwState,
        ctx: &TaskContext,
        file_checkpoint: &File,
        file_recovery: &File,
    ) -> Result<(), TaskError> {
        tracing::info!(
            "computing multiplicative order of {} modulo prime {}",
            self.a,
            input.display_text()
        );
        let factors = input.factors_minus1().map_err(|e| {
            tracing::error!("{}", e);
            TaskError::Abort
        })?;
        let n_minus_1 = Integer::from(gw.n() - 1u32);
        self.order.clear();

        for (fi, (p, e)) in factors.iter().enumerate() {
            // a^((N−1)/p^e), the heavy step; everything after is small.
            let outer = Integer::from(&n_minus_1 / p.clone().pow(*e));
            let mut t = if outer == 1u32 {
                Integer::from(self.a)
            } else if self.strong && outer.significant_bits() > 100 {
                let mut task = StrongCheckExp::li(outer, self.strong_count, None);
                task.init(
                    gw,
                    Some(file_checkpoint.add_child(&fi.to_string())),
                    Some(file_recovery.add_child(&fi.to_string())),
                    self.a,
                    None,
                )?;
                task.run(gw, ctx)?;
                task.result().ok_or(TaskError::Abort)?
            } else {
                let mut task = FastExp::new(outer);
                task.init(gw, Some(file_checkpoint.add_child(&fi.to_string())), self.a, None)?;
                task.run(gw, ctx)?;
                task.result().ok_or(TaskError::Abort)?
            };

            let mut j = 0u32;
            while t != 1u32 {
                if j == *e {
                    tracing::error!("{} is not prime", input.display_text());
                    return Err(TaskError::Abort);
                }
                let mut task = SlowExp::new(p.clone());
                task.init(gw, None, t);
                task.run(gw, ctx)?;
                t = task.result().ok_or(TaskError::Abort)?;
                j += 1;
            }
            if j > 0 {
                self.order.push((p.clone(), j));
            }
        }

        // Render ord(a) and the cofactor it leaves in N−1.
        let mut order_div = Integer::from(1u32);
        let mut text = String::new();
        for (p, e) in &factors {
            let ord_e = self
                .order
                .iter()
                .find(|(q, _)| q == p)
                .map_or(0, |(_, j)| *j);
            if ord_e < *e {
                order_div *= p.clone().pow(e - ord_e);
            }
        }
        for (p, j) in &self.order {
            if !text.is_empty() {
                text.push('*');
            }
            text.push_str(&p.to_string());
            if *j > 1 {
                text.push('^');
                text.push_str(&j.to_string());
            }
        }
        report::result(&format!(
            "ord({}) mod {} = {} = (N-1)/{}.",
            self.a,
            input.display_text(),
            text,
            order_div
        ));

        file_checkpoint.clear();
        file_recovery.clear();
        Ok(())
    }

    /// The computed order as an integer.
    pub fn value(&self) -> Integer {
        let mut v = Integer::from(1u32);
        for (p, e) in &self.order {
            v *= p.clone().pow(*e);
        }
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::reset_abort;

    fn run_order(spec: &str, a: u32) -> Order {
        reset_abort();
        let input = InputNum::parse(spec).unwrap();
        let mut params = Params::default();
        let mut order = Order::new(a, &mut params);
        let mut gw = GwState::setup(&input, params.maxmulbyconst.max(100)).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let ckpt = File::new(dir.path().join("c"), input.fingerprint());
        let rcvr = File::new(dir.path().join("r"), input.fingerprint());
        order
            .run(&input, &mut gw, &TaskContext::default(), &ckpt, &rcvr)
            .unwrap();
        order
    }

    #[test]
    fn order_divides_n_minus_1() {
        // 3*2^18+1 = 786433, the classic NTT prime.
        let input = InputNum::parse("3*2^18+1").unwrap();
        assert_ne!(
            input.value().is_probably_prime(30),
            rug::integer::IsPrime::No
        );
        let order = run_order("3*2^18+1", 5);
        let ord = order.value();
        let n_minus_1 = Integer::from(input.value() - 1u32);
        assert!(n_minus_1.is_divisible(&ord));
        // a^ord ≡ 1 and the order is minimal across p-divisions.
        let a = Integer::from(5u32);
        assert_eq!(
            a.clone().pow_mod(&ord, input.value()).unwrap(),
            1u32,
            "a^ord must be 1"
        );
        for (p, _) in &order.order {
            let reduced = Integer::from(&ord / p);
            assert_ne!(
                a.clone().pow_mod(&reduced, input.value()).unwrap(),
                1u32,
                "order is not minimal at {}",
                p
            );
        }
    }

    #[test]
    fn composite_is_detected() {
        // 3*2^20+1 is composite; the order walk cannot close and the run
        // aborts.
        let input = InputNum::parse("3*2^20+1").unwrap();
        assert_eq!(
            input.value().is_probably_prime(30),
            rug::integer::IsPrime::No
        );
        reset_abort();
        let mut params = Params::default();
        let mut order = Order::new(3, &mut params);
        let mut gw = GwState::setup(&input, 100).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let ckpt = File::new(dir.path().join("c"), input.fingerprint());
        let rcvr = File::new(dir.path().join("r"), input.fingerprint());
        let r = order.run(&input, &mut gw, &TaskContext::default(), &ckpt, &rcvr);
        assert_eq!(r, Err(TaskError::Abort));
    }
}

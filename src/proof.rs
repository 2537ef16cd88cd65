//! # Proof — Pietrzak-Style Certificates
//!
//! A succinct proof that a long squaring chain was computed correctly,
//! verifiable in a tiny fraction of the original work.
//!
//! The prover records `2^t + 1` intermediate points `μ_0 … μ_{2^t}` of the
//! chain `y = μ_count = a^(k·b^(M·2^t))`. **Save** folds them level by
//! level: each level's product `D_i` is raised to a hash-derived prime
//! challenge `h_i` and folded into the running `Y`. **Build** replays the
//! same folds from the product files, producing a compressed certificate
//! `(X, Y)` such that `X^(b^M) = Y` iff the chain was correct. **Cert**
//! performs those `M` squarings and reports the residue.
//!
//! The challenges are Fiat–Shamir: `h_i = make_prime(MD5(fingerprint ‖
//! Y_{i} ‖ D_i))`, so a prover cannot choose points to survive a fold it
//! has not yet seen. The optional security exponent (seeded from
//! `ProofSecuritySeed` and the clock) and the root-of-unity pre-check
//! close the known substitution attacks on unsecured roots of unity.
//!
//! K. Pietrzak, "Simple Verifiable Delay Functions", ITCS 2019.

use md5::{Digest, Md5};
use rug::Integer;

use crate::exp::{pow_in_place, Point, SlowExp};
use crate::file::File;
use crate::gw::{self, GwState};
use crate::input::InputNum;
use crate::state::TaskState;
use crate::strong::StrongCheckExp;
use crate::task::{abort_requested, Task, TaskContext, TaskError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofOp {
    Save,
    Build,
    Cert,
    Root,
}

/// Low 64 bits of `MD5(fingerprint ‖ y ‖ d)`.
fn hash_giants(fingerprint: u32, y: &Integer, d: &Integer) -> u64 {
    let mut hasher = Md5::new();
    hasher.update(fingerprint.to_le_bytes());
    hasher.update(y.to_digits::<u8>(rug::integer::Order::Lsf));
    hasher.update(d.to_digits::<u8>(rug::integer::Order::Lsf));
    let digest = hasher.finalize();
    u64::from_le_bytes(digest[0..8].try_into().unwrap())
}

/// Force the hash into an odd 64-bit-plus value with no prime factor
/// below `limit`, probing upward by 2.
pub fn make_prime(h: u64, limit: u32) -> Integer {
    let mut g = Integer::from(h | 1);
    if h >> 32 == 0 {
        g |= Integer::from(1u64 << 32);
    }
    'probe: loop {
        let mut p = 3u32;
        while p < limit {
            if g.is_divisible_u(p) {
                g += 2u32;
                continue 'probe;
            }
            p += 2;
        }
        return g;
    }
}

/// Value-typed capability handed to the exponentiation task: writes
/// recorded points into the proof's point files without referencing the
/// proof itself.
#[derive(Clone)]
pub struct PointRecorder {
    files: Vec<File>,
    points: Vec<u32>,
    count: u32,
}

impl PointRecorder {
    /// Persist point `index`; returns whether the value is durable.
    pub fn record(&self, index: usize, x: &Integer) -> bool {
        if index > self.count as usize {
            return false;
        }
        let state = TaskState::Value {
            iteration: self.points[index],
            x: x.clone(),
        };
        match self.files[index].write_state(&state) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("proof point write failed: {}", e);
                false
            }
        }
    }
}

pub struct Proof {
    op: ProofOp,
    count: u32,
    m: u32,
    points: Vec<u32>,
    points_per_check: u32,
    checks_per_point: u32,
    file_points: Vec<File>,
    file_products: Vec<File>,
    file_cert: Option<File>,
    res64: String,
    raw_res64: String,
    security_seed: Option<Integer>,
    root_check: bool,
}

impl Proof {
    pub fn new(op: ProofOp, count: u32) -> Result<Proof, TaskError> {
        if matches!(op, ProofOp::Save | ProofOp::Build) && !count.is_power_of_two() {
            tracing::error!("proof count is not a power of 2");
            return Err(TaskError::Abort);
        }
        Ok(Proof {
            op,
            count,
            m: 0,
            points: Vec::new(),
            points_per_check: 1,
            checks_per_point: 1,
            file_points: Vec::new(),
            file_products: Vec::new(),
            file_cert: None,
            res64: String::new(),
            raw_res64: String::new(),
            security_seed: None,
            root_check: true,
        })
    }

    pub fn op(&self) -> ProofOp {
        self.op
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Levels in the halving tree.
    pub fn depth(&self) -> u32 {
        self.count.trailing_zeros()
    }

    /// Iterations per proof segment.
    pub fn m(&self) -> u32 {
        self.m
    }

    pub fn points(&self) -> &[u32] {
        &self.points
    }

    pub fn points_per_check(&self) -> u32 {
        self.points_per_check
    }

    pub fn checks_per_point(&self) -> u32 {
        self.checks_per_point
    }

    pub fn res64(&self) -> &str {
        &self.res64
    }

    pub fn raw_res64(&self) -> &str {
        &self.raw_res64
    }

    pub fn set_security_seed(&mut self, seed: Option<Integer>) {
        self.security_seed = seed;
    }

    pub fn set_root_check(&mut self, enabled: bool) {
        self.root_check = enabled;
    }

    pub fn root_check(&self) -> bool {
        self.root_check
    }

    /// Compute the point schedule. `smooth2` inputs (base 2, `c = 1`) and
    /// everything without check alignment use a bit-reversal schedule so
    /// every level's halving points land on integers; Gerbicz-aligned
    /// general bases space the points `M` apart, `M` a multiple of the
    /// check geometry.
    pub fn calc_points(&mut self, iterations: u32, smooth2: bool, gerbicz_count: Option<u32>) {
        if let Some(gcount) = gerbicz_count {
            if gcount > self.count {
                self.checks_per_point = gcount / self.count.max(1);
            } else if gcount > 0 {
                self.points_per_check = self.count / gcount;
            }
        }
        self.points.clear();
        if !smooth2 && self.points_per_check > 1 {
            let ppc = self.points_per_check;
            let iters = iterations * ppc / self.count;
            let mut l = ppc * (iters as f64).sqrt() as u32;
            if l == 0 {
                l = ppc;
            }
            let mut l2 = iters - iters % l;
            let mut i = l + ppc;
            while (i as u64) * (i as u64) < 2 * (iters as u64) * (ppc as u64) * (ppc as u64) {
                if l2 < iters - iters % i {
                    l = i;
                    l2 = iters - iters % i;
                }
                i += ppc;
            }
            self.m = l2 / ppc;
            self.points.reserve(self.count as usize + 1);
            for i in 0..=self.count {
                self.points.push(i * self.m);
            }
        } else {
            self.points.reserve(self.count as usize + 1);
            self.points.push(0);
            for i in 1..self.count {
                self.m = iterations;
                let mut pos = 0u32;
                let mut j = self.count / 2;
                while j > 0 && (i & (j * 2 - 1)) != 0 {
                    self.m /= 2;
                    if i & j != 0 {
                        pos += self.m;
                    }
                    if iterations & (self.count / j / 2) != 0 {
                        pos += 1;
                    }
                    j >>= 1;
                }
                self.points.push(pos);
            }
            self.points.push(iterations);
        }
    }

    /// Derive the point/product/cert files from a base prefix.
    pub fn init_files(&mut self, base: &File) {
        self.file_points.clear();
        for i in 0..=self.count {
            self.file_points.push(base.add_child(&format!("proof.{}", i)));
        }
        self.file_products.clear();
        let mut i = 0;
        while (1u32 << i) < self.count {
            self.file_products.push(base.add_child(&format!("prod.{}", i)));
            i += 1;
        }
        self.file_cert = Some(base.add_child("cert"));
    }

    pub fn cert_file(&self) -> Option<&File> {
        self.file_cert.as_ref()
    }

    /// Capability for the driving task to persist points as it reaches
    /// them.
    pub fn recorder(&self) -> PointRecorder {
        PointRecorder {
            files: self.file_points.clone(),
            points: self.points.clone(),
            count: self.count,
        }
    }

    /// Write one point directly (the driver records point 0 = `a^k`).
    pub fn on_point(&self, index: usize, x: &Integer) -> bool {
        self.recorder().record(index, x)
    }

    fn read_point(&self, index: usize) -> Result<Integer, TaskError> {
        let file = &self.file_points[index];
        match file.read_state() {
            Some(TaskState::Value { iteration, x }) if iteration == self.points[index] => Ok(x),
            _ => {
                tracing::error!("{} is missing or corrupt", file.path().display());
                Err(TaskError::Abort)
            }
        }
    }

    fn read_product(&self, index: usize) -> Result<Integer, TaskError> {
        let file = &self.file_products[index];
        match file.read_state() {
            Some(TaskState::Product { iteration, x }) if iteration == index as u32 => Ok(x),
            _ => {
                tracing::error!("{} is missing or corrupt", file.path().display());
                Err(TaskError::Abort)
            }
        }
    }

    /// Furthest on-disk point usable to resume the main exponentiation.
    /// Gerbicz runs can only resume at check-aligned points.
    pub fn furthest_point(&self, check_aligned: bool) -> Option<(usize, Integer)> {
        let mut point = self.count as usize;
        loop {
            let mut p = point;
            if check_aligned {
                p -= p % self.points_per_check.max(1) as usize;
            }
            if let Some(TaskState::Value { iteration, x }) = self.file_points[p].read_state() {
                if iteration == self.points[p] {
                    return Some((p, x));
                }
            }
            if p == 0 {
                return None;
            }
            point = p - 1;
        }
    }

    /// Fold the recorded points into per-level products and the raw
    /// certificate `Y_t`. Each product is persisted as it is produced, so
    /// an interrupted save resumes without recomputation.
    pub fn run_save(&mut self, input: &InputNum, gw: &mut GwState) -> Result<(), TaskError> {
        let t = self.depth() as usize;
        tracing::info!("saving {} proof points", self.count);

        let mut y = self.read_point(self.count as usize)?;
        let mut tree: Vec<Integer> = Vec::with_capacity(t);
        let mut h: Vec<Integer> = Vec::with_capacity(t);

        for i in 0..t {
            if abort_requested() {
                return Err(TaskError::Abort);
            }
            let d = match self.file_products[i].read_state() {
                Some(TaskState::Product { iteration, x }) if iteration == i as u32 => x,
                _ => {
                    let d = if i == 0 {
                        self.read_point(self.count as usize / 2)?
                    } else {
                        // Walk the level's leaves; partial folds park in
                        // `tree`, and only the all-ones leaf falls through
                        // with the complete product.
                        let mut d = Integer::new();
                        for j in 0..(1u32 << i) {
                            if abort_requested() {
                                return Err(TaskError::Abort);
                            }
                            let k = (1 + j * 2) << (t - i - 1);
                            let mut dj = self.read_point(k as usize)?;
                            let mut parked = false;
                            for k2 in 1..=i {
                                if j & (1 << (k2 - 1)) == 0 {
                                    while tree.len() <= i - k2 {
                                        tree.push(Integer::new());
                                    }
                                    tree[i - k2] = std::mem::take(&mut dj);
                                    parked = true;
                                    break;
                                }
                                let mut tpow = tree[i - k2].clone();
                                pow_in_place(gw, &h[i - k2], &mut tpow, false);
                                gw.mul(&tpow, &mut dj, gw::STARTNEXTFFT);
                            }
                            if !parked {
                                d = dj;
                            }
                        }
                        d
                    };
                    self.file_products[i]
                        .write_state(&TaskState::Product {
                            iteration: i as u32,
                            x: d.clone(),
                        })
                        .map_err(|_| TaskError::Abort)?;
                    d
                }
            };

            let hi = make_prime(hash_giants(gw.fingerprint(), &y, &d), 1000);
            let mut dh = d;
            pow_in_place(gw, &hi, &mut dh, false);
            gw.mul(&dh, &mut y, 0);
            h.push(hi);
        }

        self.res64 = gw::res64(&y);
        tracing::info!(
            "{} compressed {} points to {} products",
            input.display_text(),
            self.count,
            self.file_products.len()
        );
        tracing::info!("raw certificate RES64: {}", self.res64);
        Ok(())
    }

    /// Replay the folds from disk into the compressed certificate.
    /// `a` is the Fermat base; `r0 = a^k` is validated against point 0.
    ///
    /// When the root-of-unity check is enabled, a chain whose claimed
    /// final residue is neither 1 nor −1 (a composite claim) must survive
    /// [`Proof::run_root`] before any fold happens: a residue forged by a
    /// root-of-unity multiplier collapses to 1 under the check exponent
    /// and the build is rejected.
    pub fn run_build(
        &mut self,
        input: &InputNum,
        gw: &mut GwState,
        ctx: &TaskContext,
        a: u32,
    ) -> Result<(), TaskError> {
        let t = self.depth() as usize;
        tracing::info!("building certificate from {} products", t);

        let r0 = self.read_point(0)?;
        let expected = Integer::from(a)
            .pow_mod(&input.k(), gw.n())
            .map_err(|_| TaskError::Abort)?;
        if r0 != expected {
            tracing::error!("invalid a^k");
            return Err(TaskError::Abort);
        }

        let mut x = r0;
        let mut y = self.read_point(self.count as usize)?;
        if self.root_check() {
            let minus_one = Integer::from(gw.n() - 1u32);
            if y != 1u32 && y != minus_one {
                self.run_root(input, gw, ctx, y.clone())?;
            }
        }
        let mut m = self.points[self.count as usize];
        let gb = input.gb();

        for i in 0..t {
            if abort_requested() {
                return Err(TaskError::Abort);
            }
            let d = self.read_product(i)?;
            let hi = make_prime(hash_giants(gw.fingerprint(), &y, &d), 1000);

            let mut exp = hi.clone();
            if m % 2 != 0 {
                exp *= &gb;
            }
            pow_in_place(gw, &exp, &mut x, true);
            gw.mul_carefully(&d, &mut x);

            let mut dh = d;
            pow_in_place(gw, &hi, &mut dh, true);
            gw.mul_carefully(&dh, &mut y);
            m >>= 1;
        }

        if let Some(seed) = &self.security_seed {
            self.raw_res64 = gw::res64(&y);
            let mut rand = rug::rand::RandState::new();
            let clock = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0);
            let mut seeded = seed.clone();
            seeded <<= 64;
            seeded |= Integer::from(clock);
            rand.seed(&seeded);
            let rnd = Integer::from(Integer::random_bits(64, &mut rand));
            let exp = make_prime(rnd.to_u64_wrapping(), 1_000_000);
            tracing::info!("security exponent applied");
            pow_in_place(gw, &exp, &mut x, true);
            pow_in_place(gw, &exp, &mut y, true);
        }

        if y == 0u32 {
            tracing::error!("invalid proof, the certificate is zero");
            return Err(TaskError::Abort);
        }

        let cert = TaskState::Certificate {
            power: m,
            x,
            a_power: expected,
            a_base: Integer::from(a),
        };
        self.file_cert
            .as_ref()
            .ok_or(TaskError::Abort)?
            .write_state(&cert)
            .map_err(|_| TaskError::Abort)?;

        self.res64 = gw::res64(&y);
        tracing::info!("{} certificate RES64: {}", input.display_text(), self.res64);
        Ok(())
    }

    /// Verify a certificate: `M` iterations of raising to `b` from the
    /// certificate's `X`; the caller compares the residue with the
    /// build's.
    pub fn run_cert(
        &mut self,
        input: &InputNum,
        gw: &mut GwState,
        ctx: &TaskContext,
        file_checkpoint: &File,
        file_recovery: &File,
        strong: bool,
    ) -> Result<(), TaskError> {
        let cert_file = self.file_cert.as_ref().ok_or(TaskError::Abort)?;
        let Some(TaskState::Certificate { power, x, .. }) = cert_file.read_state() else {
            tracing::error!("certificate is missing or corrupt");
            return Err(TaskError::Abort);
        };
        self.m = power;
        tracing::info!(
            "verifying certificate of {}, {} iterations",
            input.display_text(),
            power
        );

        let final_x;
        if strong {
            let mut task = StrongCheckExp::gerbicz(input.gb(), power, 1, None, None);
            task.init(
                gw,
                Some(file_checkpoint.clone()),
                Some(file_recovery.clone()),
                0,
                None,
            )?;
            if task.state().is_none() {
                task.init_state(TaskState::Value { iteration: 0, x });
            }
            task.run(gw, ctx)?;
            final_x = task.result().ok_or(TaskError::Abort)?;
        } else {
            let mut task = crate::exp::MultipointExp::new_smooth(
                input.gb(),
                vec![Point::new(power)],
                None,
            );
            task.init(gw, Some(file_checkpoint.clone()), 0, None)?;
            if task.state().is_none() {
                task.init_state(TaskState::Value { iteration: 0, x });
            }
            task.run(gw, ctx)?;
            final_x = task.result().ok_or(TaskError::Abort)?;
        }

        self.res64 = gw::res64(&final_x);
        file_checkpoint.clear();
        file_recovery.clear();
        Ok(())
    }

    /// Roots-of-unity pre-check: raise `x` to an exponent covering every
    /// small-order subgroup an adversary could hide in; a result of 1
    /// means a forged point and the proof is rejected.
    pub fn run_root(
        &self,
        input: &InputNum,
        gw: &mut GwState,
        ctx: &TaskContext,
        x: Integer,
    ) -> Result<(), TaskError> {
        let exp = root_check_exponent(input, 64);
        let mut task = SlowExp::new(exp);
        task.init(gw, None, x);
        task.run(gw, ctx)?;
        if task.result().map_or(false, |r| r == 1u32) {
            tracing::error!("{} roots of unity check failed", input.display_text());
            return Err(TaskError::Abort);
        }
        Ok(())
    }

    /// Clear every proof artifact (on clean driver completion).
    pub fn clear_files(&self) {
        for f in &self.file_points {
            f.clear();
        }
        for f in &self.file_products {
            f.clear();
        }
        if let Some(f) = &self.file_cert {
            f.clear();
        }
    }
}

/// Exponent for the root-of-unity check: for `c = 1` inputs, `k` times
/// `security` bits of every prime factor of `b`; otherwise the product of
/// the small factors of `N−1`.
fn root_check_exponent(input: &InputNum, security: u32) -> Integer {
    if input.c() == 1 {
        let mut exp = input.k();
        for &(p, _) in input.b_factors() {
            if p == 2 {
                exp <<= security;
            } else {
                let mut bits = 0.0f64;
                let log2p = (p as f64).log2();
                while bits < security as f64 {
                    exp *= p;
                    bits += log2p;
                }
            }
        }
        exp
    } else {
        tracing::info!("factorizing N-1 for roots of unity check");
        let mut exp = Integer::from(1u32);
        for p in input.factorize_minus1(24) {
            exp *= p;
        }
        exp
    }
}

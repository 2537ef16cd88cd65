//! # InputNum — Parsed Test Candidate
//!
//! A candidate in one of the supported shapes: `k*b^n+c` (including the
//! degenerate `b^n+c`), factorial `n!+c`, primorial `n#+c`. Knows its exact
//! value, bit length, display text, a 32-bit fingerprint of the canonical
//! form (used to refuse checkpoint files from unrelated runs), the
//! factorization of `b`, and — on demand — a partial factorization of `N−1`
//! by bounded trial division.
//!
//! Parsing accepts the conventional search-form notation:
//! `3*2^353+1`, `960^128+1`, `2*5^178-1`, `118!+1`, `1627#-1`.

use anyhow::{anyhow, bail, Result};
use md5::{Digest, Md5};
use rayon::prelude::*;
use rug::ops::Pow;
use rug::Integer;

/// Shape of the candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Form {
    /// `k * b^n + c`
    Kbnc { k: Integer, b: u64, n: u32, c: i64 },
    /// `n! + c`
    Factorial { n: u32, c: i64 },
    /// `n# + c` (product of primes up to n)
    Primorial { n: u32, c: i64 },
}

#[derive(Debug, Clone)]
pub struct InputNum {
    form: Form,
    value: Integer,
    text: String,
    b_factors: Vec<(u64, u32)>,
}

impl InputNum {
    pub fn parse(s: &str) -> Result<InputNum> {
        let s = s.trim();
        let (body, c) = split_tail(s)?;

        let form = if let Some(n) = body.strip_suffix('!') {
            Form::Factorial {
                n: n.parse()?,
                c,
            }
        } else if let Some(n) = body.strip_suffix('#') {
            Form::Primorial {
                n: n.parse()?,
                c,
            }
        } else {
            let (k_str, pow_str) = match body.split_once('*') {
                Some((k, p)) => (Some(k), p),
                None => (None, body),
            };
            let (b_str, n_str) = pow_str
                .split_once('^')
                .ok_or_else(|| anyhow!("expected b^n in '{}'", s))?;
            let k = match k_str {
                Some(k) => k.parse::<Integer>().map_err(|e| anyhow!("bad k: {}", e))?,
                None => Integer::from(1u32),
            };
            if k <= 0 {
                bail!("k must be positive in '{}'", s);
            }
            Form::Kbnc {
                k,
                b: b_str.parse()?,
                n: n_str.parse()?,
                c,
            }
        };

        let value = eval(&form)?;
        if value <= 1u32 {
            bail!("'{}' is not greater than 1", s);
        }
        let b_factors = match &form {
            Form::Kbnc { b, .. } => factor_u64(*b),
            // n! and n# have no smooth base; drivers treat b = 1.
            _ => Vec::new(),
        };
        Ok(InputNum {
            form,
            value,
            text: s.to_string(),
            b_factors,
        })
    }

    /// Construct a `k*b^n+c` input directly, bypassing the text parser.
    pub fn new_kbnc(k: Integer, b: u64, n: u32, c: i64) -> Result<InputNum> {
        let text = if k == 1 {
            format!("{}^{}{:+}", b, n, c)
        } else {
            format!("{}*{}^{}{:+}", k, b, n, c)
        };
        InputNum::parse(&text)
    }

    pub fn form(&self) -> &Form {
        &self.form
    }

    pub fn value(&self) -> &Integer {
        &self.value
    }

    pub fn bit_len(&self) -> u32 {
        self.value.significant_bits()
    }

    /// The text the candidate was parsed from; also the display text.
    pub fn display_text(&self) -> &str {
        &self.text
    }

    pub fn k(&self) -> Integer {
        match &self.form {
            Form::Kbnc { k, .. } => k.clone(),
            _ => Integer::from(1u32),
        }
    }

    pub fn b(&self) -> u64 {
        match &self.form {
            Form::Kbnc { b, .. } => *b,
            _ => 1,
        }
    }

    pub fn gb(&self) -> Integer {
        Integer::from(self.b())
    }

    pub fn n(&self) -> u32 {
        match &self.form {
            Form::Kbnc { n, .. } => *n,
            Form::Factorial { n, .. } | Form::Primorial { n, .. } => *n,
        }
    }

    pub fn c(&self) -> i64 {
        match &self.form {
            Form::Kbnc { c, .. } | Form::Factorial { c, .. } | Form::Primorial { c, .. } => *c,
        }
    }

    /// Distinct prime factors of `b` with exponents.
    pub fn b_factors(&self) -> &[(u64, u32)] {
        &self.b_factors
    }

    /// 32-bit fingerprint of the canonical form. Mixed into every
    /// checkpoint file belonging to a run on this candidate.
    pub fn fingerprint(&self) -> u32 {
        let digest = Md5::digest(self.text.as_bytes());
        u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
    }

    /// Whether `b` is a power of two (so the whole input rewrites to
    /// `k'*2^n'+c`).
    pub fn is_base2(&self) -> bool {
        matches!(&self.form, Form::Kbnc { b, .. } if b.is_power_of_two() && *b > 1)
            || self.b() == 2
    }

    /// Rewrite `k*b^n+c` with even `b` as `k2*2^n2+c`, pulling every factor
    /// of two out of `b`. Returns `None` when `b` is odd.
    pub fn to_base2(&self) -> Option<(Integer, u32)> {
        let Form::Kbnc { k, b, n, .. } = &self.form else {
            return None;
        };
        if b % 2 != 0 {
            return None;
        }
        let s = b.trailing_zeros();
        let m = b >> s;
        let k2 = k.clone() * Integer::from(m).pow(*n);
        Some((k2, s * n))
    }

    /// Full factorization of `N−1 = k·b^n` for `c = 1` inputs with `k`
    /// small enough to trial-divide. Used by the order computation.
    pub fn factors_minus1(&self) -> Result<Vec<(Integer, u32)>> {
        let Form::Kbnc { k, b: _, n, c } = &self.form else {
            bail!("N-1 factorization needs the k*b^n+1 shape");
        };
        if *c != 1 {
            bail!("N-1 factorization needs c = 1");
        }
        let k64 = k
            .to_u64()
            .ok_or_else(|| anyhow!("k too large to factor by trial division"))?;
        let mut map: Vec<(u64, u32)> = factor_u64(k64);
        for &(p, e) in &self.b_factors {
            match map.iter_mut().find(|(q, _)| *q == p) {
                Some((_, me)) => *me += e * n,
                None => map.push((p, e * n)),
            }
        }
        map.sort();
        Ok(map
            .into_iter()
            .map(|(p, e)| (Integer::from(p), e))
            .collect())
    }

    /// Trial-divide `N−1` by primes until the factored part carries at
    /// least `security` bits, returning the primes found (with
    /// multiplicity). Feeds the roots-of-unity exponent when `c != 1`.
    pub fn factorize_minus1(&self, security: u32) -> Vec<u64> {
        let mut remaining = Integer::from(&self.value - 1u32);
        let mut found = Vec::new();
        let mut bits = 0.0f64;
        let limit = 1u64 << 20;
        // Batch candidate primes, then peel them off sequentially so
        // multiplicities stay exact.
        let chunk = 4096u64;
        let mut lo = 2u64;
        while bits < security as f64 && lo < limit && remaining > 1u32 {
            let hi = (lo + chunk).min(limit);
            let divisors: Vec<u64> = (lo..hi)
                .into_par_iter()
                .filter(|&p| is_small_prime(p) && remaining.is_divisible_u(p as u32))
                .collect();
            for p in divisors {
                while remaining.is_divisible_u(p as u32) && bits < security as f64 {
                    remaining.div_exact_u_mut(p as u32);
                    found.push(p);
                    bits += (p as f64).log2();
                }
            }
            lo = hi;
        }
        found
    }
}

fn split_tail(s: &str) -> Result<(&str, i64)> {
    // The sign splitting the body from c is the last +/- not part of k.
    let idx = s
        .rfind(['+', '-'])
        .filter(|&i| i > 0)
        .ok_or_else(|| anyhow!("expected trailing +c or -c in '{}'", s))?;
    let c: i64 = s[idx..].parse()?;
    if c == 0 {
        bail!("c must be nonzero in '{}'", s);
    }
    Ok((&s[..idx], c))
}

fn eval(form: &Form) -> Result<Integer> {
    let v = match form {
        Form::Kbnc { k, b, n, c } => {
            if *b < 2 {
                bail!("base must be at least 2");
            }
            let mut v = k.clone() * Integer::from(*b).pow(*n);
            v += *c;
            v
        }
        Form::Factorial { n, c } => {
            let mut v = Integer::from(Integer::factorial(*n));
            v += *c;
            v
        }
        Form::Primorial { n, c } => {
            let mut v = Integer::from(Integer::primorial(*n));
            v += *c;
            v
        }
    };
    Ok(v)
}

/// Distinct prime factors of a small integer, with exponents.
pub fn factor_u64(mut n: u64) -> Vec<(u64, u32)> {
    let mut factors = Vec::new();
    let mut d = 2u64;
    while d * d <= n {
        if n % d == 0 {
            let mut e = 0;
            while n % d == 0 {
                n /= d;
                e += 1;
            }
            factors.push((d, e));
        }
        d += 1;
    }
    if n > 1 {
        factors.push((n, 1));
    }
    factors
}

/// Deterministic primality for 64-bit candidates (trial division; the
/// ranges passed here are small).
pub fn is_small_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    let mut d = 2u64;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 1;
    }
    true
}

/// Iterator over primes in ascending order, starting at 2.
pub fn next_prime(after: u64) -> u64 {
    let mut p = after + 1;
    while !is_small_prime(p) {
        p += 1;
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_proth_form() {
        let input = InputNum::parse("3*2^353+1").unwrap();
        assert_eq!(input.k(), 3);
        assert_eq!(input.b(), 2);
        assert_eq!(input.n(), 353);
        assert_eq!(input.c(), 1);
        let expected = Integer::from(3u32) * Integer::from(2u32).pow(353) + 1u32;
        assert_eq!(*input.value(), expected);
    }

    #[test]
    fn parses_implicit_k() {
        let input = InputNum::parse("960^128+1").unwrap();
        assert_eq!(input.k(), 1);
        assert_eq!(input.b(), 960);
        assert_eq!(input.n(), 128);
        assert_eq!(input.b_factors(), &[(2, 6), (3, 1), (5, 1)]);
    }

    #[test]
    fn parses_riesel_form() {
        let input = InputNum::parse("2*5^178-1").unwrap();
        assert_eq!(input.c(), -1);
        let expected = Integer::from(2u32) * Integer::from(5u32).pow(178) - 1u32;
        assert_eq!(*input.value(), expected);
    }

    #[test]
    fn parses_factorial_and_primorial() {
        let f = InputNum::parse("11!+1").unwrap();
        assert_eq!(*f.value(), Integer::from(Integer::factorial(11)) + 1u32);
        let p = InputNum::parse("13#-1").unwrap();
        assert_eq!(*p.value(), Integer::from(Integer::primorial(13)) - 1u32);
    }

    #[test]
    fn rejects_malformed() {
        assert!(InputNum::parse("").is_err());
        assert!(InputNum::parse("3*2^353").is_err());
        assert!(InputNum::parse("3*2^353+0").is_err());
        assert!(InputNum::parse("0*2^10+1").is_err());
        assert!(InputNum::parse("3*1^10+1").is_err());
    }

    #[test]
    fn fingerprint_distinguishes_inputs() {
        let a = InputNum::parse("3*2^353+1").unwrap();
        let b = InputNum::parse("3*2^354+1").unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), InputNum::parse("3*2^353+1").unwrap().fingerprint());
    }

    #[test]
    fn base2_rewrite() {
        let input = InputNum::parse("960^128+1").unwrap();
        let (k2, n2) = input.to_base2().unwrap();
        // 960 = 2^6 * 15, so 960^128 = 15^128 * 2^768.
        assert_eq!(n2, 768);
        assert_eq!(k2, Integer::from(15u32).pow(128));
        let rebuilt = k2 * Integer::from(2u32).pow(n2) + 1u32;
        assert_eq!(rebuilt, *input.value());
    }

    #[test]
    fn minus1_factors_cover_value() {
        let input = InputNum::parse("3*2^20+1").unwrap();
        let factors = input.factors_minus1().unwrap();
        let mut v = Integer::from(1u32);
        for (p, e) in &factors {
            v *= Integer::from(p.pow(*e));
        }
        assert_eq!(v, Integer::from(&*input.value() - 1u32));
    }

    #[test]
    fn factorize_minus1_finds_small_primes() {
        let input = InputNum::parse("2*5^17-1").unwrap();
        // N-1 = 2*5^17-2 = 2*(5^17-1); plenty of small factors.
        let primes = input.factorize_minus1(24);
        assert!(!primes.is_empty());
        let n_minus_1 = Integer::from(&*input.value() - 1u32);
        for p in &primes {
            assert!(n_minus_1.is_divisible_u(*p as u32) || *p < (1 << 20));
        }
    }

    #[test]
    fn small_prime_helpers() {
        assert!(is_small_prime(2));
        assert!(is_small_prime(997));
        assert!(!is_small_prime(1));
        assert!(!is_small_prime(1000));
        assert_eq!(next_prime(5), 7);
        assert_eq!(next_prime(7), 11);
    }
}

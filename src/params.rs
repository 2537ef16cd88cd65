//! # Params — Tuning Knobs
//!
//! Optional overrides threaded from the CLI into the drivers. Every field
//! has a sensible default; tests and the drivers themselves adjust a few
//! (Pocklington bumps `maxmulbyconst` when it retries with a larger base).

use rug::Integer;

#[derive(Debug, Clone)]
pub struct Params {
    /// Fermat base override (default 3; Proth searches its own).
    pub fermat_base: Option<u32>,
    /// Interleave the Gerbicz / Gerbicz–Li strong check.
    pub check_strong: bool,
    /// Number of strong-check segments (default 16).
    pub strong_count: Option<u32>,
    /// Fixed `L` instead of the computed one.
    pub strong_l: Option<u32>,
    /// Strong checks per proof run (aligns the point schedule).
    pub gerbicz_count: Option<u32>,
    /// Sliding-window width override.
    pub sliding_window: Option<u32>,
    /// Largest constant the engine may fuse into a multiplication.
    pub maxmulbyconst: u32,
    /// Seed for the certificate security exponent; `None` disables it.
    pub proof_security_seed: Option<Integer>,
    /// Roots-of-unity check before building a certificate (default on).
    pub root_of_unity_check: Option<bool>,
}

impl Default for Params {
    fn default() -> Self {
        Params {
            fermat_base: None,
            check_strong: false,
            strong_count: None,
            strong_l: None,
            gerbicz_count: None,
            sliding_window: None,
            maxmulbyconst: 3,
            proof_security_seed: None,
            root_of_unity_check: None,
        }
    }
}

//! # Primeprove CLI
//!
//! One input, one verdict line. The flags select the test and the safety
//! level; checkpoint files land next to the working directory under the
//! given prefix and are cleared on clean completion.

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};
use rug::Integer;

use primeprove::fermat::{Fermat, FermatKind};
use primeprove::file::File;
use primeprove::gw::GwState;
use primeprove::input::InputNum;
use primeprove::morrison::Morrison;
use primeprove::order::Order;
use primeprove::params::Params;
use primeprove::pocklington::Pocklington;
use primeprove::proof::{Proof, ProofOp};
use primeprove::report;
use primeprove::task::{self, TaskContext, TaskError};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TestMode {
    /// Pick Proth / Pocklington / Morrison from the input shape.
    Auto,
    /// Fermat probable-prime test only.
    Fermat,
    /// N−1 proof (k·b^n + 1).
    Pocklington,
    /// N+1 proof (k·b^n − 1).
    Morrison,
    /// Multiplicative order of the base modulo a proven prime.
    Order,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ProofMode {
    Save,
    Build,
    Cert,
}

#[derive(Parser)]
#[command(name = "primeprove", version, about = "Primality prover for k*b^n+c")]
struct Cli {
    /// Number to test: k*b^n+c, b^n+c, n!+c or n#+c.
    number: String,

    /// Which test to run.
    #[arg(long, value_enum, default_value_t = TestMode::Auto)]
    test: TestMode,

    /// Fermat base.
    #[arg(short, long)]
    base: Option<u32>,

    /// Interleave the Gerbicz / Gerbicz–Li strong check.
    #[arg(long)]
    check_strong: bool,

    /// Strong check segment count.
    #[arg(long)]
    strong_count: Option<u32>,

    /// Proof operation and point count, e.g. `--proof save --proof-count 16`.
    #[arg(long, value_enum)]
    proof: Option<ProofMode>,

    /// Number of proof points (power of two).
    #[arg(long, default_value_t = 16)]
    proof_count: u32,

    /// Disable the roots-of-unity check during proof build.
    #[arg(long)]
    no_root_check: bool,

    /// Security seed for the certificate blinding exponent.
    #[arg(long, env = "PROOF_SECURITY_SEED")]
    security_seed: Option<u64>,

    /// Prefix for checkpoint and proof files.
    #[arg(long, default_value = "prst")]
    file_prefix: PathBuf,

    /// Append verdict lines to this file.
    #[arg(long)]
    results: Option<PathBuf>,
}

fn main() {
    report::init_logging();
    let cli = Cli::parse();
    report::set_results_file(cli.results.clone());
    install_signal_handlers();

    match run(&cli) {
        Ok(()) => {}
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let input = InputNum::parse(&cli.number)?;
    let mut params = Params {
        fermat_base: cli.base,
        check_strong: cli.check_strong,
        strong_count: cli.strong_count,
        proof_security_seed: cli.security_seed.map(Integer::from),
        root_of_unity_check: Some(!cli.no_root_check),
        ..Params::default()
    };
    let ctx = TaskContext::default();

    let base = File::new(&cli.file_prefix, input.fingerprint());
    let file_checkpoint = base.add_child("ckpt");
    let file_recovery = base.add_child("rcvr");
    let file_params = base.add_child("morrison");
    let param_sidecar = {
        let mut p = cli.file_prefix.clone().into_os_string();
        p.push(".param");
        PathBuf::from(p)
    };
    let mut progress = primeprove::progress::Progress::new();
    progress.load(&param_sidecar);

    let err = |e: TaskError| anyhow!("{}", e);

    // Proof build/cert operate on existing files and skip the main test.
    match cli.proof {
        Some(ProofMode::Build) => {
            let mut proof = Proof::new(ProofOp::Build, cli.proof_count).map_err(err)?;
            proof.set_security_seed(params.proof_security_seed.clone());
            proof.set_root_check(params.root_of_unity_check.unwrap_or(true));
            let fermat = Fermat::new(fermat_kind(cli.test), &input, &mut params);
            let mut gw = GwState::setup(&input, params.maxmulbyconst)?;
            let iterations = fermat.proof_iterations(&input);
            proof.calc_points(iterations, input.b() == 2 && input.c() == 1, params.gerbicz_count);
            proof.init_files(&base);
            let a = fermat.a();
            if a < 0 {
                return Err(anyhow!("no valid base"));
            }
            proof
                .run_build(&input, &mut gw, &ctx, a as u32)
                .map_err(err)?;
            return Ok(());
        }
        Some(ProofMode::Cert) => {
            let started = std::time::Instant::now();
            let mut proof = Proof::new(ProofOp::Cert, cli.proof_count).map_err(err)?;
            proof.init_files(&base);
            let mut gw = GwState::setup(&input, params.maxmulbyconst)?;
            proof
                .run_cert(
                    &input,
                    &mut gw,
                    &ctx,
                    &file_checkpoint,
                    &file_recovery,
                    input.b() == 2,
                )
                .map_err(err)?;
            report::result(&format!(
                "{} certificate RES64: {}, time: {:.1} s.",
                input.display_text(),
                proof.res64(),
                started.elapsed().as_secs_f64()
            ));
            return Ok(());
        }
        _ => {}
    }

    let mut proof = match cli.proof {
        Some(ProofMode::Save) => {
            let mut p = Proof::new(ProofOp::Save, cli.proof_count).map_err(err)?;
            p.init_files(&base);
            Some(p)
        }
        _ => None,
    };

    let mode = match cli.test {
        TestMode::Auto => {
            if input.c() == -1 {
                TestMode::Morrison
            } else if input.c() == 1 {
                TestMode::Pocklington
            } else {
                TestMode::Fermat
            }
        }
        other => other,
    };

    match mode {
        TestMode::Fermat => {
            let mut fermat = Fermat::new(FermatKind::Fermat, &input, &mut params);
            let mut gw = GwState::setup(&input, params.maxmulbyconst)?;
            fermat
                .run(
                    &input,
                    &mut gw,
                    &ctx,
                    &file_checkpoint,
                    &file_recovery,
                    proof.as_mut(),
                )
                .map_err(err)?;
            progress.report_param("a", fermat.a());
            save_sidecar(&mut progress, &gw, &param_sidecar);
        }
        TestMode::Pocklington => {
            let mut pock = Pocklington::new(&input, &mut params);
            let mut gw = GwState::setup(&input, params.maxmulbyconst)?;
            pock.run(
                &input,
                &mut gw,
                &ctx,
                &file_checkpoint,
                &file_recovery,
                proof.as_mut(),
            )
            .map_err(err)?;
            progress.report_param("a", pock.a());
            save_sidecar(&mut progress, &gw, &param_sidecar);
        }
        TestMode::Morrison => {
            let mut morrison = Morrison::new(&input, &params).map_err(err)?;
            let mut gw = GwState::setup(&input, params.maxmulbyconst)?;
            morrison
                .run(&input, &mut gw, &ctx, &file_checkpoint, &file_params)
                .map_err(err)?;
            progress.report_param("P", morrison.p());
            save_sidecar(&mut progress, &gw, &param_sidecar);
        }
        TestMode::Order => {
            let a = cli.base.unwrap_or(3);
            let mut order = Order::new(a, &mut params);
            let mut gw = GwState::setup(&input, params.maxmulbyconst)?;
            order
                .run(&input, &mut gw, &ctx, &file_checkpoint, &file_recovery)
                .map_err(err)?;
            progress.report_param("a", a);
            save_sidecar(&mut progress, &gw, &param_sidecar);
        }
        TestMode::Auto => unreachable!(),
    }
    Ok(())
}

fn save_sidecar(
    progress: &mut primeprove::progress::Progress,
    gw: &GwState,
    path: &std::path::Path,
) {
    progress.report_param("fft_desc", gw.fft_description());
    progress.report_param("fft_len", gw.fft_len());
    progress.update(1.0, gw.ops());
    progress.save(path);
}

fn fermat_kind(mode: TestMode) -> FermatKind {
    match mode {
        TestMode::Fermat => FermatKind::Fermat,
        TestMode::Pocklington => FermatKind::Pocklington,
        _ => FermatKind::Auto,
    }
}

extern "C" fn on_signal(_sig: libc::c_int) {
    task::request_abort();
}

fn install_signal_handlers() {
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

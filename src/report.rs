//! # Report — Verdict Lines and Logging Setup
//!
//! One line per primality verdict on stdout, mirrored into an optional
//! results file so batch runs keep a durable record. Diagnostics go
//! through `tracing`; verdicts deliberately do not, because they are the
//! program's output, not its logging.

use std::path::PathBuf;
use std::sync::Mutex;

static RESULTS_FILE: Mutex<Option<PathBuf>> = Mutex::new(None);

/// Route a copy of every verdict line into `path`.
pub fn set_results_file(path: Option<PathBuf>) {
    *RESULTS_FILE.lock().unwrap() = path;
}

/// Emit one verdict line.
pub fn result(line: &str) {
    println!("{}", line);
    if let Some(path) = RESULTS_FILE.lock().unwrap().as_ref() {
        use std::io::Write;
        if let Ok(mut f) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
            let _ = writeln!(f, "{}", line);
        }
    }
}

/// Install the tracing subscriber; `RUST_LOG` filters as usual.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_file_receives_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.txt");
        set_results_file(Some(path.clone()));
        result("1*2^10+1 is not prime. RES64: 0000000000000019, time: 0.1 s.");
        result("3*2^353+1 is prime! Time: 0.2 s.");
        set_results_file(None);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("is prime!"));
    }
}

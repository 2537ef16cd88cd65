//! # Progress — Cost-Weighted Multi-Stage Accounting
//!
//! A long test runs as a sequence of stages (main exponentiation, proof
//! save, certificate build, factor passes) with wildly different costs. The
//! schedulers and the human-visible progress bar both want one number, so
//! each stage registers its cost up front and reports a 0..1 fraction while
//! it runs; the total is the cost-weighted combination.
//!
//! A sidecar `*.param` JSON record persists the reported parameters and the
//! cumulative progress/time so a restarted run resumes its progress bar
//! where it left off.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use serde::{Deserialize, Serialize};

pub struct Progress {
    costs: Vec<f64>,
    cur_stage: usize,
    cur_fraction: f64,
    op_count: u64,
    time_started: Instant,
    time_carried: f64,
    params: BTreeMap<String, serde_json::Value>,
}

impl Progress {
    pub fn new() -> Progress {
        Progress {
            costs: Vec::new(),
            cur_stage: 0,
            cur_fraction: 0.0,
            op_count: 0,
            time_started: Instant::now(),
            time_carried: 0.0,
            params: BTreeMap::new(),
        }
    }

    pub fn add_stage(&mut self, cost: f64) {
        self.costs.push(cost.max(0.0));
    }

    pub fn next_stage(&mut self) {
        if self.cur_stage < self.costs.len() {
            self.cur_stage += 1;
        }
        self.cur_fraction = 0.0;
    }

    pub fn cur_stage(&self) -> usize {
        self.cur_stage
    }

    pub fn costs(&self) -> &[f64] {
        &self.costs
    }

    /// Update the current stage's completed fraction and the op counter.
    pub fn update(&mut self, fraction: f64, ops: u64) {
        self.cur_fraction = fraction.clamp(0.0, 1.0);
        self.op_count = ops;
    }

    pub fn cost_total(&self) -> f64 {
        self.costs.iter().sum()
    }

    /// Cost-weighted total progress in 0..1.
    pub fn progress_total(&self) -> f64 {
        let total = self.cost_total();
        if total <= 0.0 {
            return 0.0;
        }
        let done: f64 = self.costs[..self.cur_stage.min(self.costs.len())].iter().sum();
        let cur = if self.cur_stage < self.costs.len() {
            self.costs[self.cur_stage] * self.cur_fraction
        } else {
            0.0
        };
        (done + cur) / total
    }

    /// Wall-clock seconds including time carried over from previous runs.
    pub fn time_total(&self) -> f64 {
        self.time_carried + self.time_started.elapsed().as_secs_f64()
    }

    pub fn report_param(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.params.insert(key.to_string(), value.into());
    }

    /// Persist the sidecar record next to the checkpoint files.
    pub fn save(&self, path: &Path) {
        let record = ParamRecord {
            progress: self.progress_total(),
            time: self.time_total(),
            ops: self.op_count,
            params: self.params.clone(),
        };
        if let Ok(json) = serde_json::to_string_pretty(&record) {
            let _ = std::fs::write(path, json);
        }
    }

    /// Resume progress-bar state from a sidecar record, if one is present
    /// and parses.
    pub fn load(&mut self, path: &Path) {
        let Ok(raw) = std::fs::read_to_string(path) else {
            return;
        };
        let Ok(record) = serde_json::from_str::<ParamRecord>(&raw) else {
            return;
        };
        self.time_carried = record.time;
        self.op_count = record.ops;
        self.params = record.params;
    }
}

impl Default for Progress {
    fn default() -> Self {
        Progress::new()
    }
}

/// The on-disk shape of the `*.param` sidecar.
#[derive(Serialize, Deserialize)]
pub struct ParamRecord {
    pub progress: f64,
    pub time: f64,
    pub ops: u64,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

//! Process and system metrics read from procfs.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Result};
use rand::Rng;
use tracing::debug;

use crate::metric::{Metric, MetricBatch};

/// Name of the counter incremented on every poll.
pub const POLL_COUNT: &str = "PollCount";

/// Name of the uniform random gauge.
pub const RANDOM_VALUE: &str = "RandomValue";

/// Cumulative busy/total jiffies of one CPU line in /proc/stat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

/// Samples metrics into a pending set that the reporter drains.
#[derive(Debug)]
pub struct Sampler {
    proc_root: PathBuf,
    gauges: BTreeMap<String, f64>,
    poll_count: i64,
    prev_cpu: Vec<CpuTimes>,
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler {
    pub fn new() -> Self {
        Self::with_proc_root("/proc")
    }

    /// Reads procfs from `root` instead of `/proc`.
    pub fn with_proc_root(root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: root.into(),
            gauges: BTreeMap::new(),
            poll_count: 0,
            prev_cpu: Vec::new(),
        }
    }

    /// Takes one sample. Sources that cannot be read are skipped.
    ///
    /// Fails only when no procfs source could be read at all.
    pub fn poll(&mut self) -> Result<()> {
        let mut sources = 0;

        match self.read("self/status") {
            Some(text) => {
                sources += 1;
                for (name, value) in parse_status(&text) {
                    self.gauges.insert(name.to_string(), value);
                }
            }
            None => debug!("process status unavailable"),
        }

        match self.read("meminfo") {
            Some(text) => {
                sources += 1;
                for (name, value) in parse_meminfo(&text) {
                    self.gauges.insert(name.to_string(), value);
                }
            }
            None => debug!("meminfo unavailable"),
        }

        match self.read("stat") {
            Some(text) => {
                sources += 1;
                self.record_cpu(&parse_cpu_times(&text));
            }
            None => debug!("cpu stat unavailable"),
        }

        self.gauges
            .insert(RANDOM_VALUE.to_string(), rand::thread_rng().gen::<f64>());
        self.poll_count = self.poll_count.saturating_add(1);

        if sources == 0 {
            bail!("no procfs source readable under {}", self.proc_root.display());
        }

        Ok(())
    }

    /// Returns every latest gauge plus the poll count accumulated since the
    /// previous call, and resets that count.
    pub fn take_batch(&mut self) -> MetricBatch {
        let mut batch: MetricBatch = self
            .gauges
            .iter()
            .map(|(name, value)| Metric::gauge(name.clone(), *value))
            .collect();

        if self.poll_count > 0 {
            batch.push(Metric::counter(POLL_COUNT, self.poll_count));
            self.poll_count = 0;
        }

        batch
    }

    fn read(&self, rel: &str) -> Option<String> {
        fs::read_to_string(self.proc_root.join(rel)).ok()
    }

    fn record_cpu(&mut self, current: &[CpuTimes]) {
        if self.prev_cpu.len() == current.len() {
            for (i, (prev, now)) in self.prev_cpu.iter().zip(current).enumerate() {
                let total = now.total.saturating_sub(prev.total);
                if total == 0 {
                    continue;
                }
                let busy = now.busy.saturating_sub(prev.busy);
                let pct = busy as f64 * 100.0 / total as f64;
                self.gauges.insert(format!("CPUutilization{}", i + 1), pct);
            }
        }
        self.prev_cpu = current.to_vec();
    }
}

fn parse_kb(rest: &str) -> Option<f64> {
    let kb = rest.split_whitespace().next()?.parse::<u64>().ok()?;
    Some(kb.saturating_mul(1024) as f64)
}

fn parse_count(rest: &str) -> Option<f64> {
    rest.trim().parse::<u64>().ok().map(|v| v as f64)
}

/// Extracts process gauges from /proc/self/status.
fn parse_status(text: &str) -> Vec<(&'static str, f64)> {
    let mut out = Vec::new();

    for line in text.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let parsed = match key {
            "VmRSS" => parse_kb(rest).map(|v| ("VmRSS", v)),
            "VmSize" => parse_kb(rest).map(|v| ("VmSize", v)),
            "VmHWM" => parse_kb(rest).map(|v| ("VmHWM", v)),
            "Threads" => parse_count(rest).map(|v| ("Threads", v)),
            "voluntary_ctxt_switches" => parse_count(rest).map(|v| ("VoluntaryCtxSwitches", v)),
            _ => None,
        };
        if let Some(entry) = parsed {
            out.push(entry);
        }
    }

    out
}

/// Extracts system memory gauges from /proc/meminfo.
fn parse_meminfo(text: &str) -> Vec<(&'static str, f64)> {
    let mut out = Vec::new();

    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            if let Some(v) = parse_kb(rest) {
                out.push(("TotalMemory", v));
            }
        } else if let Some(rest) = line.strip_prefix("MemFree:") {
            if let Some(v) = parse_kb(rest) {
                out.push(("FreeMemory", v));
            }
        }
    }

    out
}

/// Parses the per-core `cpuN` lines of /proc/stat, skipping the aggregate.
fn parse_cpu_times(text: &str) -> Vec<CpuTimes> {
    let mut out = Vec::new();

    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let Some(label) = fields.next() else {
            continue;
        };
        let is_core = label
            .strip_prefix("cpu")
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()));
        if !is_core {
            continue;
        }

        let values: Vec<u64> = fields.filter_map(|f| f.parse().ok()).collect();
        let total: u64 = values.iter().sum();
        // idle + iowait
        let idle = values.get(3).copied().unwrap_or(0) + values.get(4).copied().unwrap_or(0);
        out.push(CpuTimes {
            busy: total.saturating_sub(idle),
            total,
        });
    }

    out
}

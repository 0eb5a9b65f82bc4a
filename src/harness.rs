//! Orchestrator: runs each benchmark under counters and writes the report.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::counters::{CounterDescriptor, CounterSet, DeltaSource, MAX_COUNTERS};
use crate::label::{BenchmarkLabel, LabelStyle};
use crate::lifecycle::ProcessController;
use crate::probe::{ProbeChannel, ProbeSource, DEFAULT_PROBE_SHM};
use crate::sampler::{SampleContext, Sampler, TickStats};
use crate::writer::{Sample, SampleWriter};

/// Function column written by batch mode rows.
pub const BATCH_FUNCTION: &str = "-";

/// Runtime options, separated from the CLI parsing concerns.
#[derive(Debug, Clone)]
pub struct Config {
    /// Verbosity level (0 = warn, 1 = info, 2 = debug, 3+ = trace)
    pub verbosity: u8,
    /// CSV file, appended to if it exists
    pub output: PathBuf,
    /// Time between samples
    pub period: Duration,
    /// Count only on this CPU
    pub core: Option<u32>,
    pub descriptors: Vec<CounterDescriptor>,
    /// Shared memory name of the probe record
    pub probe_shm: String,
    /// One row per benchmark instead of periodic sampling
    pub batch: bool,
    /// How benchmark and input columns are derived
    pub label_style: LabelStyle,
    /// Command lines, run one after another
    pub benchmarks: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            verbosity: 0,
            output: PathBuf::from("benchprof.csv"),
            period: Duration::from_micros(100),
            core: None,
            descriptors: CounterDescriptor::defaults(),
            probe_shm: DEFAULT_PROBE_SHM.to_string(),
            batch: false,
            label_style: LabelStyle::default(),
            benchmarks: Vec::new(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.benchmarks.is_empty() {
            bail!("No benchmarks given");
        }
        if let Some(cmd) = self.benchmarks.iter().find(|b| b.trim().is_empty()) {
            bail!("Empty benchmark command line {:?}", cmd);
        }
        if self.descriptors.is_empty() {
            bail!("No perf events configured");
        }
        if self.descriptors.len() > MAX_COUNTERS {
            bail!(
                "{} perf events requested, at most {} can be counted at once",
                self.descriptors.len(),
                MAX_COUNTERS
            );
        }
        if !self.batch && self.period.is_zero() {
            bail!("Sampling period must be greater than zero");
        }
        Ok(())
    }

    pub fn labels(&self) -> Vec<String> {
        self.descriptors.iter().map(|d| d.label.clone()).collect()
    }
}

/// What one benchmark run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchmarkReport {
    pub label: BenchmarkLabel,
    pub pid: libc::pid_t,
    pub elapsed: Option<Duration>,
    pub exit_code: Option<i32>,
    /// Zero in batch mode.
    pub stats: TickStats,
    pub rows: u64,
}

/// Run every benchmark in `config` in order.
pub fn run(config: &Config) -> Result<Vec<BenchmarkReport>> {
    config.validate()?;

    let writer = SampleWriter::open(&config.output, config.labels())?;
    let probe = if config.batch {
        None
    } else {
        let channel = ProbeChannel::open(&config.probe_shm)?;
        tracing::info!("Sampling against probe channel {}", channel.name());
        Some(channel)
    };

    let mut controller =
        ProcessController::new(config.benchmarks.len(), config.label_style.labeler())?;
    let mut reports = Vec::with_capacity(config.benchmarks.len());
    for command_line in &config.benchmarks {
        let report = match &probe {
            Some(probe) => run_sampled(config, &mut controller, probe, &writer, command_line)?,
            None => run_batch(config, &mut controller, &writer, command_line)?,
        };
        log_report(command_line, &report);
        reports.push(report);
    }

    let unknown = controller.table().unknown_children();
    if unknown > 0 {
        tracing::warn!("Reaped {} child process(es) that were not benchmarks", unknown);
    }
    Ok(reports)
}

fn run_sampled(
    config: &Config,
    controller: &mut ProcessController,
    probe: &dyn ProbeSource,
    writer: &SampleWriter,
    command_line: &str,
) -> Result<BenchmarkReport> {
    let slot = controller.launch(command_line)?;
    let pid = controller.table().pid(slot);
    let label = controller.record(slot).label;

    let mut counters = CounterSet::configure(pid, config.core, &config.descriptors)?;
    counters.start()?;

    let stats = {
        let ctx = SampleContext::new(
            &mut counters,
            probe,
            writer,
            &label.name,
            label.input_or_empty(),
            pid,
        );
        let mut sampler = Sampler::arm_every(ctx, config.period)
            .with_context(|| format!("Failed to arm sampler for {}", command_line))?;
        controller.resume(slot)?;
        controller.wait_for_completion();
        sampler.disarm()?;
        sampler.context().stats()
    };
    counters.close();
    controller.confirm_exec(slot)?;

    let record = controller.record(slot);
    Ok(BenchmarkReport {
        label,
        pid,
        elapsed: record.elapsed.map(Duration::from_nanos),
        exit_code: record.exit_code,
        stats,
        rows: stats.rows,
    })
}

fn run_batch(
    config: &Config,
    controller: &mut ProcessController,
    writer: &SampleWriter,
    command_line: &str,
) -> Result<BenchmarkReport> {
    let slot = controller.launch(command_line)?;
    let pid = controller.table().pid(slot);
    let label = controller.record(slot).label;

    let mut counters = CounterSet::configure(pid, config.core, &config.descriptors)?;
    counters.start()?;
    controller.resume(slot)?;
    controller.wait_for_completion();
    counters.stop()?;
    controller.confirm_exec(slot)?;

    let mut deltas = [None; MAX_COUNTERS];
    let n = counters.len();
    let invalid = counters.read_deltas(&mut deltas[..n]);
    if invalid > 0 {
        tracing::warn!("{} invalid counter read(s) for PID {}", invalid, pid);
    }
    writer
        .write_sample(&Sample {
            benchmark: &label.name,
            input: label.input_or_empty(),
            pid,
            function: BATCH_FUNCTION,
            deltas: &deltas[..n],
        })
        .context("Failed to write benchmark row")?;
    counters.close();

    let record = controller.record(slot);
    Ok(BenchmarkReport {
        label,
        pid,
        elapsed: record.elapsed.map(Duration::from_nanos),
        exit_code: record.exit_code,
        stats: TickStats {
            invalid_reads: invalid as u64,
            ..Default::default()
        },
        rows: 1,
    })
}

fn log_report(command_line: &str, report: &BenchmarkReport) {
    if let Some(elapsed) = report.elapsed {
        tracing::info!(
            "{} (PID = {}) finished in {:.6}s",
            command_line,
            report.pid,
            elapsed.as_secs_f64()
        );
    }
    match report.exit_code {
        Some(0) | None => {}
        Some(code) => tracing::warn!("{} exited with code {}", command_line, code),
    }

    let stats = &report.stats;
    tracing::info!(
        "{}: {} ticks, {} rows, {} invalid reads, {} write errors",
        command_line,
        stats.ticks,
        report.rows,
        stats.invalid_reads,
        stats.write_errors
    );
    if report.rows == 0 {
        tracing::info!(
            "No samples for {}: the probe never left its setup state",
            command_line
        );
    }
    if stats.write_errors > 0 {
        tracing::warn!(
            "{} sample rows could not be written for {}",
            stats.write_errors,
            command_line
        );
    }
}

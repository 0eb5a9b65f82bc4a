use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use benchprof::counters::{CounterDescriptor, DEFAULT_EVENTS};
use benchprof::label::LabelStyle;
use benchprof::probe::DEFAULT_PROBE_SHM;
use benchprof::Config;

/// Run benchmarks under perf counters, sampling the counts against the
/// function an external probe reports.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Command {
    /// CSV file to append samples to
    #[arg(short, long)]
    output: PathBuf,
    /// Sampling period in microseconds
    #[arg(short, long, default_value = "100")]
    period: u64,
    /// Only count on this CPU core
    #[arg(short, long)]
    core: Option<u32>,
    /// Use only the first N events
    #[arg(short = 'n', long)]
    event_count: Option<usize>,
    /// Whitespace separated perf events, e.g. "PERF_COUNT_HW_INSTRUCTIONS page-faults r1c4"
    #[arg(short = 'm', long)]
    events: Option<String>,
    /// Shared memory name of the probe record
    #[arg(long, default_value = DEFAULT_PROBE_SHM)]
    probe_shm: String,
    /// Write one row per benchmark instead of sampling
    #[arg(long)]
    batch: bool,
    /// How to name benchmarks and inputs in the report
    #[arg(long, value_enum, default_value_t = LabelStyle::Path)]
    label: LabelStyle,
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Benchmark command lines, each a single quoted string
    #[arg(required = true)]
    benchmarks: Vec<String>,
}

impl Command {
    fn into_config(self) -> Result<Config> {
        let descriptors = match &self.events {
            Some(list) => CounterDescriptor::parse_list(list, self.event_count)?,
            None => {
                CounterDescriptor::parse_list(&DEFAULT_EVENTS.join(" "), self.event_count)?
            }
        };
        if descriptors.is_empty() {
            bail!("No perf events selected");
        }
        Ok(Config {
            verbosity: self.verbose,
            output: self.output,
            period: Duration::from_micros(self.period),
            core: self.core,
            descriptors,
            probe_shm: self.probe_shm,
            batch: self.batch,
            label_style: self.label,
            benchmarks: self.benchmarks,
        })
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let config = Command::parse().into_config()?;
    init_logging(config.verbosity);

    let reports = benchprof::run(&config)?;
    tracing::info!(
        "Ran {} benchmark(s), output in {}",
        reports.len(),
        config.output.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config> {
        let mut argv = vec!["benchprof"];
        argv.extend_from_slice(args);
        Command::try_parse_from(argv)?.into_config()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&["-o", "out.csv", "./bench/bench ../data/sim"]).unwrap();
        assert_eq!(config.period, Duration::from_micros(100));
        assert_eq!(config.descriptors.len(), DEFAULT_EVENTS.len());
        assert_eq!(config.probe_shm, DEFAULT_PROBE_SHM);
        assert_eq!(config.benchmarks, vec!["./bench/bench ../data/sim"]);
        assert_eq!(config.verbosity, 0);
        assert_eq!(config.label_style, LabelStyle::Path);
    }

    #[test]
    fn test_event_selection() {
        let config = parse(&[
            "-o",
            "out.csv",
            "-m",
            "instructions cache-misses r1c4",
            "-n",
            "2",
            "-vv",
            "--batch",
            "--label",
            "command",
            "a",
            "b",
        ])
        .unwrap();
        assert_eq!(config.labels(), vec!["instructions", "cache-misses"]);
        assert_eq!(config.verbosity, 2);
        assert!(config.batch);
        assert_eq!(config.label_style, LabelStyle::Command);
        assert_eq!(config.benchmarks.len(), 2);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(parse(&["-o", "out.csv"]).is_err());
        assert!(parse(&["-o", "out.csv", "-m", "bogus", "a"]).is_err());
        assert!(parse(&["-o", "out.csv", "-n", "9", "a"]).is_err());
        assert!(parse(&["a"]).is_err());
    }
}

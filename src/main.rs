//! Job latency measurements for real-time workloads

#![deny(missing_docs)]

mod harness;
mod priority;
mod workdir;

use self::{
    harness::{HarnessOptions, RunError, RunReport},
    priority::NativeElevator,
};
use clap::{Parser, ValueEnum};
use std::{path::PathBuf, process::ExitCode};
use workload::{Base, CpuLoad, MemoryLoad, Workload};

/// Measure how long each job of a synthetic workload takes to run
///
/// Job durations are written to the log file in nanoseconds, one
/// `<duration>,` line per job.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Number of jobs to run, instead of the workload's own estimate
    #[clap(short = 'j', long)]
    max_jobs: Option<u64>,

    /// Lock memory and run with the highest real-time priority
    #[clap(short = 'r', long)]
    realtime: bool,

    /// Working directory of the workload
    #[clap(short = 'R', long, default_value = "./")]
    root: PathBuf,

    /// Workload config file, relative to the workload root
    #[clap(short = 'C', long, default_value = "config")]
    config: PathBuf,

    /// Timing log output
    #[clap(short = 'L', long, default_value = "timing.csv")]
    log: PathBuf,

    /// Workload to be measured
    #[clap(short = 'w', long, value_enum, default_value_t = WorkloadKind::Sqrwav)]
    workload: WorkloadKind,
}

/// Workloads that can be measured
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum WorkloadKind {
    /// CPU-bound jobs whose length follows a square wave
    Sqrwav,

    /// Memory-bound pointer-chasing jobs
    Membound,

    /// Jobs that do nothing, to measure harness overhead
    Base,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    let options = HarnessOptions {
        max_jobs: args.max_jobs,
        realtime: args.realtime,
        root: args.root,
        config: args.config,
        log: args.log,
    };
    let result = match args.workload {
        WorkloadKind::Sqrwav => run::<CpuLoad>(&options),
        WorkloadKind::Membound => run::<MemoryLoad>(&options),
        WorkloadKind::Base => run::<Base>(&options),
    };
    match result {
        Ok(report) => {
            log::info!(
                "Timed {} of {} planned jobs, log written to {}",
                report.completed_jobs,
                report.planned_jobs,
                report.log_path.display()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("ERROR: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run a workload with the native priority elevator
fn run<W: Workload>(options: &HarnessOptions) -> Result<RunReport, RunError> {
    let mut elevator = NativeElevator::default();
    harness::run::<W>(options, &mut elevator)
}

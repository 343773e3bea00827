//! Timed execution of a workload's jobs

use crate::{
    priority::{Elevation, ProcessPriorityElevator, SchedulingError},
    workdir::{WorkdirError, WorkdirGuard},
};
use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    time::Instant,
};
use thiserror::Error;
use workload::{InitError, JobError, JobStatus, Workload};

/// Number of jobs run when neither the user nor the workload set a limit
pub const DEFAULT_JOB_CAP: u64 = 10_000;

/// Harness configuration
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HarnessOptions {
    /// Number of jobs to run, overriding the workload's estimate
    pub max_jobs: Option<u64>,

    /// Run with locked memory and real-time priority
    pub realtime: bool,

    /// Working directory of the workload
    pub root: PathBuf,

    /// Workload config file, relative to `root`
    pub config: PathBuf,

    /// Timing log output, relative to the original working directory
    pub log: PathBuf,
}

/// Summary of a successful run
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunReport {
    /// Number of jobs that the harness planned to run
    pub planned_jobs: u64,

    /// Number of jobs that were actually run and timed
    pub completed_jobs: u64,

    /// Location of the timing log
    pub log_path: PathBuf,
}

/// Run and time the jobs of workload `W`
///
/// Every resource acquired along the way (working directory change, the
/// workload itself, real-time scheduling) is released on every exit path. If
/// a job fails, the timings of the jobs that came before it are still
/// written to the log.
pub fn run<W: Workload>(
    options: &HarnessOptions,
    elevator: &mut dyn ProcessPriorityElevator,
) -> Result<RunReport, RunError> {
    // Move to the workload root, keeping the log path valid
    let mut workdir = WorkdirGuard::enter(&options.root)?;
    let log_path = workdir.original().join(&options.log);

    // Set up the workload
    let (workload, estimate) = W::init(&options.config).map_err(|source| RunError::Init {
        workload: W::name(),
        source,
    })?;
    let mut workload = InitializedWorkload(Some(workload));
    let planned_jobs = options
        .max_jobs
        .unwrap_or_else(|| estimate.or_cap(DEFAULT_JOB_CAP));
    log::info!(
        "Will run up to {planned_jobs} jobs of workload {} (estimate: {estimate:?})",
        W::name()
    );
    let mut timings = JobTimingLog::with_jobs(planned_jobs)?;

    // Get real-time priority if requested
    let _elevation = if options.realtime {
        Some(Elevation::acquire(elevator)?)
    } else {
        None
    };

    // Run the jobs
    let job_result = timings.record(|| workload.perform_job());
    let completed_jobs = timings.durations().len() as u64;
    if job_result.is_ok() && completed_jobs < planned_jobs {
        log::info!(
            "Workload {} was done after {completed_jobs} of {planned_jobs} jobs",
            W::name()
        );
    }
    let job_result = job_result.map_err(|source| RunError::Job {
        workload: W::name(),
        index: completed_jobs,
        source,
    });

    // Go back to the original working directory and save the log
    let restore_result = workdir.restore().map_err(RunError::from);
    let save_result = timings
        .save(&log_path)
        .map_err(|source| RunError::WriteLog {
            path: log_path.clone(),
            source,
        });
    log::debug!("Recorded {completed_jobs} job timings");

    // Report the first error, if any, and log the others
    let mut errors = [job_result, restore_result, save_result]
        .into_iter()
        .filter_map(Result::err);
    if let Some(first) = errors.next() {
        for other in errors {
            log::error!("{other}");
        }
        return Err(first);
    }
    Ok(RunReport {
        planned_jobs,
        completed_jobs,
        log_path,
    })
}

/// Workload that is uninitialized on drop
struct InitializedWorkload<W: Workload>(Option<W>);
//
impl<W: Workload> InitializedWorkload<W> {
    /// Run the next job
    fn perform_job(&mut self) -> Result<JobStatus, JobError> {
        match &mut self.0 {
            Some(workload) => workload.perform_job(),
            None => Ok(JobStatus::Done),
        }
    }
}
//
impl<W: Workload> Drop for InitializedWorkload<W> {
    fn drop(&mut self) {
        if let Some(workload) = self.0.take() {
            workload.uninit();
            log::debug!("Released workload {}", W::name());
        }
    }
}

/// Pre-allocated record of job durations in nanoseconds
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct JobTimingLog(Vec<u64>);
//
impl JobTimingLog {
    /// Allocate storage for the timings of `jobs` jobs
    pub fn with_jobs(jobs: u64) -> Result<Self, RunError> {
        let alloc_error = || RunError::LogAllocation { jobs };
        let len = usize::try_from(jobs).map_err(|_| alloc_error())?;
        let mut durations = Vec::new();
        durations.try_reserve_exact(len).map_err(|_| alloc_error())?;
        durations.resize(len, 0);
        Ok(Self(durations))
    }

    /// Time successive calls to `job` until every slot is filled
    ///
    /// Stops early if the job reports that it is done or fails. Only the
    /// timings of jobs that did some work are kept, the log is truncated to
    /// that length.
    pub fn record(
        &mut self,
        mut job: impl FnMut() -> Result<JobStatus, JobError>,
    ) -> Result<(), JobError> {
        let mut completed = 0;
        let mut result = Ok(());
        for slot in self.0.iter_mut() {
            let start = Instant::now();
            let status = job();
            let elapsed = start.elapsed();
            match status {
                Ok(JobStatus::Continue) => {
                    *slot = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
                    completed += 1;
                }
                Ok(JobStatus::Done) => break,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        self.0.truncate(completed);
        result
    }

    /// Recorded job durations in nanoseconds
    pub fn durations(&self) -> &[u64] {
        &self.0
    }

    /// Write the log as one `<nanoseconds>,` line per job
    pub fn write(&self, mut output: impl Write) -> io::Result<()> {
        for duration in self.durations() {
            writeln!(output, "{duration},")?;
        }
        output.flush()
    }

    /// Write the log to a file, replacing any previous content
    pub fn save(&self, path: &Path) -> io::Result<()> {
        self.write(BufWriter::new(File::create(path)?))
    }
}

/// Failure to run a workload to completion
#[derive(Debug, Error)]
pub enum RunError {
    /// Failed to move into or out of the workload root
    #[error("failed to manage the working directory ({0})")]
    Workdir(#[from] WorkdirError),

    /// Failed to set up the workload
    #[error("failed to initialize workload {workload} ({source})")]
    Init {
        /// Workload name
        workload: &'static str,

        /// Underlying error
        source: InitError,
    },

    /// The timing log does not fit in memory
    #[error("failed to allocate a timing log for {jobs} jobs")]
    LogAllocation {
        /// Requested number of jobs
        jobs: u64,
    },

    /// Failed to set up real-time execution
    #[error("failed to set up real-time execution ({0})")]
    Scheduling(#[from] SchedulingError),

    /// A job failed
    #[error("workload {workload} failed on job {index} ({source})")]
    Job {
        /// Workload name
        workload: &'static str,

        /// Index of the failing job
        index: u64,

        /// Underlying error
        source: JobError,
    },

    /// Failed to write the timing log
    #[error("failed to write timing log to {} ({source})", path.display())]
    WriteLog {
        /// Timing log location
        path: PathBuf,

        /// Underlying I/O error
        source: io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priority::tests::{Call, MockElevator};
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use std::{
        alloc::{GlobalAlloc, Layout, System},
        cell::{Cell, RefCell},
    };
    use tempfile::TempDir;
    use workload::{
        config::{self, OptionSet},
        ConfigError, JobBudget, JobEstimate,
    };

    /// Workload lifecycle events
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    enum Event {
        Init,
        Uninit,
    }

    thread_local! {
        static EVENTS: RefCell<Vec<Event>> = RefCell::new(Vec::new());
        static ALLOCATIONS: Cell<u64> = const { Cell::new(0) };
    }

    /// System allocator that counts allocations per thread
    struct CountingAllocator;
    //
    unsafe impl GlobalAlloc for CountingAllocator {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            count_allocation();
            System.alloc(layout)
        }

        unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
            count_allocation();
            System.alloc_zeroed(layout)
        }

        unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
            count_allocation();
            System.realloc(ptr, layout, new_size)
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            System.dealloc(ptr, layout)
        }
    }

    #[global_allocator]
    static ALLOCATOR: CountingAllocator = CountingAllocator;

    fn count_allocation() {
        let _ = ALLOCATIONS.try_with(|count| count.set(count.get() + 1));
    }

    fn allocations() -> u64 {
        ALLOCATIONS.with(Cell::get)
    }

    fn push_event(event: Event) {
        EVENTS.with(|events| events.borrow_mut().push(event));
    }

    fn events() -> Vec<Event> {
        EVENTS.with(|events| events.borrow().clone())
    }

    /// Workload whose behavior is set by its config file
    ///
    /// - `-j <jobs>` sets the job budget (default: unbounded)
    /// - `-f <index>` makes the job with that index fail
    /// - `-x` makes initialization fail
    #[derive(Debug)]
    struct Scripted {
        budget: JobBudget,
        fail_at: Option<u64>,
        next_index: u64,
    }
    //
    impl Workload for Scripted {
        fn name() -> &'static str {
            "scripted"
        }

        fn init(config: &Path) -> Result<(Self, JobEstimate), InitError> {
            let mut budget = JobBudget::unbounded();
            let mut fail_at = None;
            for option in config::load(config, OptionSet::new("j:f:x"))? {
                match option.name {
                    'j' => budget = JobBudget::parse('j', option.argument.as_deref())?,
                    'f' => fail_at = Some(option.value()?),
                    'x' => return Err(ConfigError::BadLine("-x".into()).into()),
                    _ => unreachable!(),
                }
            }
            push_event(Event::Init);
            let result = Self {
                budget,
                fail_at,
                next_index: 0,
            };
            Ok((result, budget.estimate()))
        }

        fn perform_job(&mut self) -> Result<JobStatus, JobError> {
            if self.fail_at == Some(self.next_index) {
                return Err(JobError::new("scripted failure"));
            }
            if !self.budget.take() {
                return Ok(JobStatus::Done);
            }
            self.next_index += 1;
            Ok(JobStatus::Continue)
        }

        fn uninit(self) {
            push_event(Event::Uninit);
        }
    }

    /// Scratch directory with a config file for the scripted workload
    struct Fixture {
        dir: TempDir,
    }
    //
    impl Fixture {
        fn new(config: &str) -> Self {
            let dir = tempfile::tempdir().expect("Failed to create scratch directory");
            std::fs::write(dir.path().join("config"), config).unwrap();
            Self { dir }
        }

        fn options(&self, max_jobs: Option<u64>) -> HarnessOptions {
            HarnessOptions {
                max_jobs,
                realtime: false,
                root: PathBuf::from("."),
                config: self.dir.path().join("config"),
                log: self.log_path(),
            }
        }

        fn log_path(&self) -> PathBuf {
            self.dir.path().join("timing.csv")
        }

        fn log_lines(&self) -> Vec<String> {
            std::fs::read_to_string(self.log_path())
                .unwrap()
                .lines()
                .map(String::from)
                .collect()
        }
    }

    fn run_scripted(options: &HarnessOptions) -> Result<RunReport, RunError> {
        run::<Scripted>(options, &mut MockElevator::default())
    }

    fn assert_timing_lines(lines: &[String], expected_len: usize) {
        assert_eq!(lines.len(), expected_len);
        for line in lines {
            let duration = line.strip_suffix(',').expect("Missing trailing comma");
            duration.parse::<u64>().expect("Bad duration");
        }
    }

    #[test]
    fn workload_estimate() {
        let fixture = Fixture::new("-j 3\n");
        let report = run_scripted(&fixture.options(None)).unwrap();
        assert_eq!(
            report,
            RunReport {
                planned_jobs: 3,
                completed_jobs: 3,
                log_path: fixture.log_path(),
            }
        );
        assert_timing_lines(&fixture.log_lines(), 3);
        assert_eq!(events(), [Event::Init, Event::Uninit]);
    }

    #[test]
    fn job_count_override() {
        let fixture = Fixture::new("-j 10\n");
        let report = run_scripted(&fixture.options(Some(4))).unwrap();
        assert_eq!(report.completed_jobs, 4);
        assert_timing_lines(&fixture.log_lines(), 4);
    }

    #[test]
    fn workload_done_early() {
        let fixture = Fixture::new("-j 2\n");
        let report = run_scripted(&fixture.options(Some(5))).unwrap();
        assert_eq!(report.planned_jobs, 5);
        assert_eq!(report.completed_jobs, 2);
        assert_timing_lines(&fixture.log_lines(), 2);
    }

    #[test]
    fn unbounded_workload() {
        let fixture = Fixture::new("");
        let report = run_scripted(&fixture.options(None)).unwrap();
        assert_eq!(report.planned_jobs, DEFAULT_JOB_CAP);
        assert_eq!(report.completed_jobs, DEFAULT_JOB_CAP);
        assert_timing_lines(&fixture.log_lines(), DEFAULT_JOB_CAP as usize);
    }

    #[test]
    fn zero_jobs() {
        let fixture = Fixture::new("-j 5\n");
        let report = run_scripted(&fixture.options(Some(0))).unwrap();
        assert_eq!(report.completed_jobs, 0);
        assert_eq!(std::fs::read(fixture.log_path()).unwrap(), b"");
    }

    #[test]
    fn job_failure() {
        let fixture = Fixture::new("-j 10\n-f 3\n");
        assert_matches!(
            run_scripted(&fixture.options(None)),
            Err(RunError::Job { workload: "scripted", index: 3, .. })
        );
        assert_timing_lines(&fixture.log_lines(), 3);
        assert_eq!(events(), [Event::Init, Event::Uninit]);
    }

    #[test]
    fn init_failure() {
        let fixture = Fixture::new("-x\n");
        assert_matches!(
            run_scripted(&fixture.options(None)),
            Err(RunError::Init {
                workload: "scripted",
                source: InitError::Config(ConfigError::BadLine(_))
            })
        );
        assert!(!fixture.log_path().exists());
        assert!(events().is_empty());
    }

    #[test]
    fn missing_config() {
        let fixture = Fixture::new("");
        let options = HarnessOptions {
            config: fixture.dir.path().join("nonexistent"),
            ..fixture.options(None)
        };
        assert_matches!(
            run_scripted(&options),
            Err(RunError::Init {
                source: InitError::Resource(_),
                ..
            })
        );
    }

    #[test]
    fn missing_root() {
        let fixture = Fixture::new("");
        let options = HarnessOptions {
            root: fixture.dir.path().join("nonexistent"),
            ..fixture.options(None)
        };
        assert_matches!(
            run_scripted(&options),
            Err(RunError::Workdir(WorkdirError::Enter { .. }))
        );
        assert!(events().is_empty());
    }

    #[test]
    fn realtime() {
        let fixture = Fixture::new("-j 2\n");
        let options = HarnessOptions {
            realtime: true,
            ..fixture.options(None)
        };
        let mut elevator = MockElevator::default();
        let report = run::<Scripted>(&options, &mut elevator).unwrap();
        assert_eq!(report.completed_jobs, 2);
        assert_eq!(
            elevator.calls,
            [
                Call::LockMemory,
                Call::ElevatePriority,
                Call::RestorePriority,
                Call::UnlockMemory
            ]
        );
        assert_eq!(events(), [Event::Init, Event::Uninit]);
    }

    #[test]
    fn elevation_failure() {
        let fixture = Fixture::new("-j 2\n");
        let options = HarnessOptions {
            realtime: true,
            ..fixture.options(None)
        };
        let mut elevator = MockElevator {
            fail_elevate: true,
            ..Default::default()
        };
        assert_matches!(
            run::<Scripted>(&options, &mut elevator),
            Err(RunError::Scheduling(SchedulingError::Elevate(_)))
        );
        assert_eq!(
            elevator.calls,
            [Call::LockMemory, Call::ElevatePriority, Call::UnlockMemory]
        );
        assert!(!fixture.log_path().exists());
        assert_eq!(events(), [Event::Init, Event::Uninit]);
    }

    #[test]
    fn unwritable_log() {
        let fixture = Fixture::new("-j 2\n");
        let options = HarnessOptions {
            log: fixture.dir.path().join("nonexistent").join("timing.csv"),
            ..fixture.options(None)
        };
        assert_matches!(
            run_scripted(&options),
            Err(RunError::WriteLog { .. })
        );
        assert_eq!(events(), [Event::Init, Event::Uninit]);
    }

    #[test]
    fn log_format() {
        let mut timings = JobTimingLog::with_jobs(3).unwrap();
        assert_eq!(timings.durations(), [0, 0, 0]);
        let mut remaining = 2;
        timings
            .record(|| {
                if remaining == 0 {
                    return Ok(JobStatus::Done);
                }
                remaining -= 1;
                Ok(JobStatus::Continue)
            })
            .unwrap();
        assert_eq!(timings.durations().len(), 2);

        let mut output = Vec::new();
        JobTimingLog(vec![1, 23, 456]).write(&mut output).unwrap();
        assert_eq!(String::from_utf8(output).unwrap(), "1,\n23,\n456,\n");
    }

    #[test]
    fn recording_does_not_allocate() {
        let mut timings = JobTimingLog::with_jobs(100).unwrap();
        let mut remaining = 60;
        let before = allocations();
        let result = timings.record(|| {
            if remaining == 0 {
                return Ok(JobStatus::Done);
            }
            remaining -= 1;
            Ok(JobStatus::Continue)
        });
        let after = allocations();
        assert_eq!(after - before, 0, "recording allocated memory");
        assert!(result.is_ok());
        assert_eq!(timings.durations().len(), 60);

        let mut timings = JobTimingLog::with_jobs(100).unwrap();
        let before = allocations();
        let result = timings.record(|| Ok(JobStatus::Continue));
        let after = allocations();
        assert_eq!(after - before, 0, "recording allocated memory");
        assert!(result.is_ok());
        assert_eq!(timings.durations().len(), 100);
    }

    #[test]
    fn allocation_counter() {
        let before = allocations();
        let buffer = std::hint::black_box(vec![0u8; 16]);
        assert!(allocations() > before);
        drop(buffer);
    }
}

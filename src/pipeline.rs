use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use clap::ValueEnum;
use tracing::{debug, info, warn};

use crate::error::{PrunError, PrunResult};
use crate::job::{FAN_OUT, JobSpec, intermediate_path};
use crate::merge::MergeInvoker;
use crate::messages::SubJobReport;
use crate::runner;
use crate::tools::ComputeInvoker;

/// What to do when some sub-jobs fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FailurePolicy {
    /// Skip the merge, keep the intermediates, fail the run
    FailFast,
    /// Merge whatever succeeded
    BestEffort,
}

#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub concurrency: usize,
    pub policy: FailurePolicy,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            concurrency: FAN_OUT,
            policy: FailurePolicy::FailFast,
        }
    }
}

#[derive(Debug)]
pub struct RunSummary {
    pub reports: Vec<SubJobReport>,
    pub merged: Vec<PathBuf>,
    pub removed: usize,
    pub compute_elapsed: Duration,
    pub merge_elapsed: Duration,
    pub total_elapsed: Duration,
}

/// Runs the whole job. Elapsed time is reported whether or not it succeeds.
pub fn run_job(
    job: &JobSpec,
    compute: Arc<dyn ComputeInvoker>,
    merger: &dyn MergeInvoker,
    config: &LaunchConfig,
) -> PrunResult<RunSummary> {
    let start = Instant::now();
    let result = run_phases(job, compute, merger, config, start);
    if let Err(e) = &result {
        warn!("Failed after {:.2?}: {e}", start.elapsed());
    }
    result
}

fn run_phases(
    job: &JobSpec,
    compute: Arc<dyn ComputeInvoker>,
    merger: &dyn MergeInvoker,
    config: &LaunchConfig,
    start: Instant,
) -> PrunResult<RunSummary> {
    // Leftovers from an earlier run would pass the output check.
    for stale in job.intermediates().filter(|p| p.exists()) {
        debug!("Removing stale {}", stale.display());
        std::fs::remove_file(&stale).map_err(|e| PrunError::io(&stale, e))?;
    }

    let subs = job.expand();
    info!(
        sub_jobs = subs.len(),
        resolution = job.sub_resolution(),
        concurrency = config.concurrency,
        "Launching {}",
        job.output_path.display()
    );

    let reports = runner::run_all(compute, subs, config.concurrency);
    let compute_elapsed = start.elapsed();
    info!("Compute finished in {compute_elapsed:.2?}");

    let failed: Vec<&SubJobReport> = reports.iter().filter(|r| !r.succeeded()).collect();
    if !failed.is_empty() {
        let indices: Vec<usize> = failed.iter().map(|r| r.index).collect();
        let code = failed[0].exit_code();
        if config.policy == FailurePolicy::FailFast || failed.len() == reports.len() {
            return Err(PrunError::SubJobFailed { indices, code });
        }
        warn!(?indices, "Merging without the failed sub-jobs");
    }

    let merged: Vec<PathBuf> = reports
        .iter()
        .filter(|r| r.succeeded())
        .map(|r| intermediate_path(&job.output_path, r.index))
        .collect();

    let merge_start = Instant::now();
    merger.merge(&merged, &job.output_path)?;
    let merge_elapsed = merge_start.elapsed();
    info!("Merged {} parts in {merge_elapsed:.2?}", merged.len());

    let mut removed = 0;
    if job.keep_intermediates {
        info!("Keeping objs...");
    } else {
        for path in job.intermediates().filter(|p| p.exists()) {
            std::fs::remove_file(&path).map_err(|e| PrunError::io(&path, e))?;
            removed += 1;
        }
        debug!(removed, "Removed intermediates");
    }

    Ok(RunSummary {
        reports,
        merged,
        removed,
        compute_elapsed,
        merge_elapsed,
        total_elapsed: start.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use std::{
        io::{self, Write},
        path::Path,
        sync::Mutex,
    };

    use super::*;
    use crate::grammar::parse_job;
    use crate::job::SubJob;
    use crate::merge::BuiltinMerge;

    /// Writes one triangle per sub-job and records the argument vectors it saw.
    #[derive(Default)]
    struct FakeCompute {
        calls: Mutex<Vec<Vec<String>>>,
        fail: Vec<usize>,
    }

    impl ComputeInvoker for FakeCompute {
        fn run(&self, sub: &SubJob) -> io::Result<Option<i32>> {
            let argv = sub
                .argv()
                .into_iter()
                .map(|a| a.to_string_lossy().into_owned())
                .collect();
            self.calls.lock().unwrap().push(argv);

            std::fs::write(&sub.output, "v 0 0 0\nv 1 0 0\nv 0 1 0\nf 1 2 3\n")?;
            if self.fail.contains(&sub.index) {
                return Ok(Some(2));
            }
            Ok(Some(0))
        }
    }

    fn job_in(dir: &Path, line: &str) -> JobSpec {
        let out = dir.join("out.obj");
        let tokens: Vec<String> = line
            .split_whitespace()
            .map(String::from)
            .chain([out.to_string_lossy().into_owned()])
            .collect();
        parse_job(&tokens).unwrap()
    }

    #[derive(Clone, Default)]
    struct CapturedLog(Arc<Mutex<Vec<u8>>>);

    impl Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLog {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    fn intermediates_on_disk(job: &JobSpec) -> usize {
        job.intermediates().filter(|p| p.exists()).count()
    }

    #[test]
    fn test_portals_run_removes_intermediates() {
        let dir = tempfile::tempdir().unwrap();
        let job = job_in(dir.path(), "sdf.f3d portals.txt 2 2.0 256 1.0 0.5 0 0 0");
        let compute = Arc::new(FakeCompute::default());

        let summary =
            run_job(&job, compute.clone(), &BuiltinMerge, &LaunchConfig::default()).unwrap();

        assert_eq!(summary.reports.len(), 8);
        assert_eq!(summary.merged.len(), 8);
        assert_eq!(summary.removed, 8);
        assert!(job.output_path.is_file());
        assert_eq!(intermediates_on_disk(&job), 0);

        let calls = compute.calls.lock().unwrap();
        assert_eq!(calls.len(), 8);
        for argv in calls.iter() {
            assert_eq!(argv[4], "128");
            assert_eq!(argv.len(), 12);
        }
        let mut suffixes: Vec<_> = calls.iter().map(|a| a[10].clone()).collect();
        suffixes.sort();
        for (i, suffix) in suffixes.iter().enumerate() {
            assert!(suffix.ends_with(&format!("out.obj.{i}.obj")));
        }
    }

    #[test]
    fn test_keep_with_subsection_retains_intermediates() {
        let dir = tempfile::tempdir().unwrap();
        let job = job_in(
            dir.path(),
            "KEEP SUB 3 sdf.f3d versor8 1.5 256 1.0 0.5 0 0 0",
        );
        let compute = Arc::new(FakeCompute::default());

        let summary =
            run_job(&job, compute.clone(), &BuiltinMerge, &LaunchConfig::default()).unwrap();

        assert_eq!(summary.removed, 0);
        assert!(job.output_path.is_file());
        assert_eq!(intermediates_on_disk(&job), 8);

        let mut labels: Vec<_> = compute
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|a| a.last().cloned())
            .collect();
        labels.sort();
        assert_eq!(labels, ["30", "31", "32", "33", "34", "35", "36", "37"]);
    }

    #[test]
    fn test_fail_fast_skips_merge() {
        let dir = tempfile::tempdir().unwrap();
        let job = job_in(dir.path(), "sdf.f3d RANDOM 64 1.0 0.5 0 0 0");
        let compute = Arc::new(FakeCompute {
            fail: vec![6, 2],
            ..Default::default()
        });

        let err = run_job(&job, compute, &BuiltinMerge, &LaunchConfig::default()).unwrap_err();

        match err {
            PrunError::SubJobFailed { indices, code } => {
                assert_eq!(indices, [2, 6]);
                assert_eq!(code, Some(2));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!job.output_path.exists());
        assert_eq!(intermediates_on_disk(&job), 8);
    }

    #[test]
    fn test_best_effort_merges_survivors() {
        let dir = tempfile::tempdir().unwrap();
        let job = job_in(dir.path(), "sdf.f3d RANDOM 64 1.0 0.5 0 0 0");
        let compute = Arc::new(FakeCompute {
            fail: vec![3],
            ..Default::default()
        });
        let config = LaunchConfig {
            policy: FailurePolicy::BestEffort,
            ..Default::default()
        };

        let summary = run_job(&job, compute, &BuiltinMerge, &config).unwrap();

        assert_eq!(summary.merged.len(), 7);
        assert!(!summary.merged.iter().any(|p| p.ends_with("out.obj.3.obj")));
        assert!(job.output_path.is_file());
        // The failed job's partial output goes too.
        assert_eq!(intermediates_on_disk(&job), 0);
    }

    #[test]
    fn test_best_effort_with_nothing_to_merge_fails() {
        let dir = tempfile::tempdir().unwrap();
        let job = job_in(dir.path(), "sdf.f3d RANDOM 64 1.0 0.5 0 0 0");
        let compute = Arc::new(FakeCompute {
            fail: (0..FAN_OUT).collect(),
            ..Default::default()
        });
        let config = LaunchConfig {
            policy: FailurePolicy::BestEffort,
            ..Default::default()
        };

        let err = run_job(&job, compute, &BuiltinMerge, &config).unwrap_err();
        assert!(matches!(err, PrunError::SubJobFailed { .. }));
        assert!(!job.output_path.exists());
    }

    #[test]
    fn test_stale_intermediates_are_not_merged() {
        let dir = tempfile::tempdir().unwrap();
        let job = job_in(dir.path(), "sdf.f3d RANDOM 64 1.0 0.5 0 0 0");
        for path in job.intermediates() {
            std::fs::write(path, "garbage that is not an obj\n").unwrap();
        }

        struct NoOutput;
        impl ComputeInvoker for NoOutput {
            fn run(&self, _: &SubJob) -> io::Result<Option<i32>> {
                Ok(Some(0))
            }
        }

        let err = run_job(&job, Arc::new(NoOutput), &BuiltinMerge, &LaunchConfig::default())
            .unwrap_err();
        assert!(matches!(err, PrunError::SubJobFailed { .. }));
        assert_eq!(intermediates_on_disk(&job), 0);
    }

    #[test]
    fn test_failed_run_still_reports_elapsed_time() {
        let dir = tempfile::tempdir().unwrap();
        let job = job_in(dir.path(), "sdf.f3d RANDOM 64 1.0 0.5 0 0 0");
        let compute = Arc::new(FakeCompute {
            fail: vec![0],
            ..Default::default()
        });

        let log = CapturedLog::default();
        let writer = log.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let result = tracing::subscriber::with_default(subscriber, || {
            run_job(&job, compute, &BuiltinMerge, &LaunchConfig::default())
        });

        assert!(matches!(result, Err(PrunError::SubJobFailed { .. })));
        assert!(log.text().contains("Failed after"));
    }
}

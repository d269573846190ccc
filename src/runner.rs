use std::{
    sync::{Arc, Mutex, mpsc},
    thread,
    time::Instant,
};

use tracing::{debug, info, warn};

use crate::job::SubJob;
use crate::messages::{SubJobOutcome, SubJobReport, SubJobResponse, SubJobTask};
use crate::tools::ComputeInvoker;

fn run_one(compute: &dyn ComputeInvoker, sub: &SubJob) -> SubJobReport {
    let start = Instant::now();
    let outcome = match compute.run(sub) {
        Ok(Some(0)) if sub.output.is_file() => SubJobOutcome::Succeeded,
        Ok(Some(0)) => SubJobOutcome::MissingOutput,
        Ok(code) => SubJobOutcome::Exited(code),
        Err(e) => SubJobOutcome::SpawnFailed(e.to_string()),
    };
    SubJobReport {
        index: sub.index,
        outcome,
        elapsed: start.elapsed(),
    }
}

pub fn sub_job_runner(
    compute: Arc<dyn ComputeInvoker>,
    rx: Arc<Mutex<mpsc::Receiver<SubJobTask>>>,
    tx: mpsc::Sender<SubJobResponse>,
) {
    loop {
        let msg = {
            let Ok(receiver) = rx.lock() else {
                return;
            };
            receiver.recv()
        };
        match msg {
            Ok(SubJobTask::Task(sub)) => {
                debug!(index = sub.index, label = %sub.octree_label, "Starting sub-job");
                let report = run_one(compute.as_ref(), &sub);
                match &report.outcome {
                    SubJobOutcome::Succeeded => {
                        info!(index = report.index, elapsed = ?report.elapsed, "Sub-job done")
                    }
                    outcome => warn!(index = report.index, ?outcome, "Sub-job failed"),
                }
                if tx.send(SubJobResponse::Report(report)).is_err() {
                    return;
                }
            }
            Ok(SubJobTask::Terminate) => {
                debug!("Sub-job runner done");
                let _ = tx.send(SubJobResponse::Terminated);
                return;
            }
            // Every sender is gone, nothing more will arrive.
            Err(_) => return,
        }
    }
}

/// Runs every sub-job with at most `concurrency` in flight and returns once
/// all of them have finished, reports ordered by index.
pub fn run_all(
    compute: Arc<dyn ComputeInvoker>,
    subs: Vec<SubJob>,
    concurrency: usize,
) -> Vec<SubJobReport> {
    let num_workers = concurrency.clamp(1, subs.len().max(1));
    let indices: Vec<usize> = subs.iter().map(|s| s.index).collect();

    let (tx_task, rx_task) = mpsc::channel::<SubJobTask>();
    let receiver_guard_task = Arc::new(Mutex::new(rx_task));
    let (tx_resp, rx_resp) = mpsc::channel::<SubJobResponse>();

    let mut workers = Vec::with_capacity(num_workers);
    for _ in 0..num_workers {
        let compute = compute.clone();
        let receiver = receiver_guard_task.clone();
        let sender = tx_resp.clone();
        workers.push(thread::spawn(move || {
            sub_job_runner(compute, receiver, sender)
        }));
    }
    // Only workers hold senders now, so a dead worker cannot hang the barrier.
    drop(tx_resp);

    for sub in subs {
        // Receivers outlive this loop, sending cannot fail.
        let _ = tx_task.send(SubJobTask::Task(sub));
    }
    for _ in 0..num_workers {
        let _ = tx_task.send(SubJobTask::Terminate);
    }

    let mut reports = Vec::with_capacity(indices.len());
    let mut num_running = num_workers;
    while num_running > 0 {
        match rx_resp.recv() {
            Ok(SubJobResponse::Report(report)) => reports.push(report),
            Ok(SubJobResponse::Terminated) => num_running -= 1,
            Err(_) => break,
        }
    }

    for worker in workers {
        if worker.join().is_err() {
            warn!("Sub-job worker panicked");
        }
    }

    for index in indices {
        if !reports.iter().any(|r| r.index == index) {
            reports.push(SubJobReport {
                index,
                outcome: SubJobOutcome::SpawnFailed("worker exited without reporting".into()),
                elapsed: Default::default(),
            });
        }
    }

    reports.sort_by_key(|r| r.index);
    reports
}

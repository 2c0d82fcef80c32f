// src/jobs/worker.rs

//! Worker pool
//!
//! Each worker polls the job store: claim, execute on the blocking pool,
//! retire. Between polls a worker sleeps for the configured minimum wait plus
//! a random jitter so that several workers do not poll in lockstep.

use super::{JobId, Task};
use crate::error::{Error, Result};
use crate::manager::Context;
use rand::Rng;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A set of background workers sharing one job store
pub struct WorkerPool {
    stop: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers on the current tokio runtime
    pub fn start(ctx: Arc<Context>, count: usize) -> Self {
        let (stop, _) = watch::channel(false);
        let handles = (0..count.max(1))
            .map(|n| tokio::spawn(worker_loop(n, ctx.clone(), stop.subscribe())))
            .collect();
        info!("Started {} workers", count.max(1));
        Self { stop, handles }
    }

    /// Signal every worker and wait for them to finish their current job
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Worker task failed: {}", e);
            }
        }
        info!("Workers stopped");
    }
}

async fn worker_loop(n: usize, ctx: Arc<Context>, mut stop: watch::Receiver<bool>) {
    debug!("Worker {} started", n);
    loop {
        if *stop.borrow() {
            break;
        }

        let job_ctx = ctx.clone();
        match tokio::task::spawn_blocking(move || run_once(&job_ctx)).await {
            Ok(Ok(Some(id))) => debug!("Worker {} finished job {}", n, id),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => error!("Worker {} failed to process a job: {}", n, e),
            Err(e) => error!("Worker {} lost its blocking task: {}", n, e),
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_delay(ctx.config.min_wait(), ctx.config.max_jitter())) => {}
            _ = stop.changed() => break,
        }
    }
    debug!("Worker {} exiting", n);
}

fn poll_delay(min_wait: Duration, max_jitter: Duration) -> Duration {
    let jitter = max_jitter.as_millis() as u64;
    if jitter == 0 {
        return min_wait;
    }
    min_wait + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter))
}

/// Claim and run at most one job, returning its id
///
/// Returns `None` when no job is ready. Errors and panics raised by the job
/// itself are recorded on the job; only job store failures are returned.
pub fn run_once(ctx: &Context) -> Result<Option<JobId>> {
    let job = match ctx.jobs.claim() {
        Ok(job) => job,
        Err(Error::NoJobReady) => return Ok(None),
        Err(e) => return Err(e),
    };

    let task = match Task::from_job(&job) {
        Ok(task) => task,
        Err(e) => {
            warn!("Job {} is not runnable: {}", job.id, e);
            ctx.jobs.retire(job.id, None, Some(&e.to_string()))?;
            return Ok(Some(job.id));
        }
    };

    ctx.jobs.mark_started(job.id)?;
    info!("Running job {}: {}", job.id, task.describe());

    match panic::catch_unwind(AssertUnwindSafe(|| task.execute(ctx))) {
        Ok(Ok(result)) => {
            ctx.jobs.retire(job.id, result.as_ref(), None)?;
            info!("Job {} completed", job.id);
        }
        Ok(Err(e)) => {
            warn!("Job {} failed: {}", job.id, e);
            ctx.jobs.retire(job.id, None, Some(&e.to_string()))?;
        }
        Err(_) => {
            error!("Job {} panicked", job.id);
            ctx.jobs.retire(job.id, None, Some("job panicked"))?;
        }
    }
    Ok(Some(job.id))
}

/// Run jobs on the calling thread until none is ready
pub fn drain(ctx: &Context) -> Result<usize> {
    let mut ran = 0;
    while run_once(ctx)?.is_some() {
        ran += 1;
    }
    Ok(ran)
}

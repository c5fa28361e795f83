use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use futures::future::BoxFuture;
use tracing::{debug, info, warn};

/// Body of a periodic job.
pub type JobFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct Job {
    name: String,
    schedule: CronSchedule,
    run: JobFn,
    next_run: Option<DateTime<Utc>>,
    running: Arc<AtomicBool>,
}

/// Clears a job's running flag when its run ends, including by panic.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// In-process cron scheduler. Jobs are registered at startup and fired by
/// [`run_scheduler_loop`](super::engine::run_scheduler_loop).
#[derive(Default)]
pub struct Scheduler {
    jobs: Vec<Job>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job. `cron_expr` uses the six-field form with seconds.
    pub fn add_job(&mut self, name: &str, cron_expr: &str, run: JobFn) -> Result<()> {
        let schedule = CronSchedule::from_str(cron_expr)
            .map_err(|e| anyhow::anyhow!("Invalid cron expression '{}': {}", cron_expr, e))?;
        let next_run = schedule.after(&Utc::now()).next();
        info!(job = %name, cron = %cron_expr, next_run = ?next_run, "periodic job registered");
        self.jobs.push(Job {
            name: name.to_string(),
            schedule,
            run,
            next_run,
            running: Arc::new(AtomicBool::new(false)),
        });
        Ok(())
    }

    /// Registered jobs with their next fire time.
    pub fn list(&self) -> Vec<(String, Option<DateTime<Utc>>)> {
        self.jobs.iter().map(|j| (j.name.clone(), j.next_run)).collect()
    }

    /// Fire every job due at `now`. A job still running from its previous
    /// fire is skipped. Returns the names of the jobs started.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let mut started = Vec::new();
        for job in &mut self.jobs {
            let Some(due) = job.next_run else { continue };
            if due > now {
                continue;
            }
            job.next_run = job.schedule.after(&now).next();

            if job.running.swap(true, Ordering::AcqRel) {
                warn!(job = %job.name, "previous run still in progress, skipping");
                continue;
            }
            debug!(job = %job.name, "job due");
            let run = job.run.clone();
            let guard = RunningGuard(job.running.clone());
            tokio::spawn(async move {
                let _guard = guard;
                run().await;
            });
            started.push(job.name.clone());
        }
        started
    }
}

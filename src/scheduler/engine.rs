use std::time::Duration;

use chrono::Utc;
use tracing::info;

use crate::scheduler::Scheduler;

/// Main scheduler loop. Checks for due jobs every second until the process
/// exits.
pub async fn run_scheduler_loop(mut scheduler: Scheduler) {
    info!(jobs = scheduler.list().len(), "Scheduler engine started");

    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        scheduler.tick(Utc::now());
    }
}

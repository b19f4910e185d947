//! Autonomous scans that repeat on a fixed interval without any trigger.

use std::sync::Arc;

use ::time::OffsetDateTime;
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::options::ScanOptions;
use crate::pipeline::{self, JobRunner};
use crate::registry::JobRegistry;
use crate::types::ScheduledScan;

/// One loop per scheduled scan; stopped and joined together.
#[derive(Debug)]
pub struct Scheduler {
    stop: CancellationToken,
    loops: JoinSet<()>,
}

impl Scheduler {
    /// Spawn a loop for every definition. Each loop scans once right away
    /// and then once per interval.
    pub fn start<R: JobRunner>(
        scans: Vec<ScheduledScan>,
        runner: Arc<R>,
        registry: JobRegistry,
    ) -> Self {
        let stop = CancellationToken::new();
        let mut loops = JoinSet::new();

        if scans.is_empty() {
            info!("no scheduled scans configured");
        } else {
            info!(count = scans.len(), "starting scheduled scans");
        }

        for scan in scans {
            let options = match ScanOptions::parse(&scan.command_line()) {
                Ok(o) => o,
                Err(e) => {
                    warn!(scan = %scan.name, error = %e, "skipping scheduled scan with invalid options");
                    continue;
                }
            };
            loops.spawn(run_loop(
                scan,
                options,
                runner.clone(),
                registry.clone(),
                stop.clone(),
            ));
        }

        Self { stop, loops }
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Signal every loop and wait for all of them to exit. A scan already in
    /// progress finishes first.
    pub async fn stop(mut self) {
        self.stop.cancel();
        while let Some(res) = self.loops.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "scheduled scan loop ended abnormally");
            }
        }
        info!("all scheduled scans stopped");
    }
}

async fn run_loop<R: JobRunner>(
    scan: ScheduledScan,
    options: ScanOptions,
    runner: Arc<R>,
    registry: JobRegistry,
    stop: CancellationToken,
) {
    info!(
        scan = %scan.name,
        targets = %scan.targets,
        options = %scan.options,
        interval = ?scan.interval,
        "scheduled scan loop started"
    );

    // First tick completes immediately.
    let mut ticker = time::interval(scan.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = ticker.tick() => run_once(&scan, &options, &*runner, &registry).await,
        }
    }

    info!(scan = %scan.name, "scheduled scan loop stopped");
}

async fn run_once<R: JobRunner>(
    scan: &ScheduledScan,
    options: &ScanOptions,
    runner: &R,
    registry: &JobRegistry,
) {
    let jid = synthetic_jid(&scan.name, OffsetDateTime::now_utc());
    let admission = match registry.admit(&jid, &options.to_string()) {
        Ok(a) => a,
        Err(e) => {
            warn!(scan = %scan.name, error = %e, "skipping scheduled run");
            return;
        }
    };
    info!(scan = %scan.name, jid = %jid, "running scheduled scan");
    pipeline::drive(runner, admission, options, "schedule").await;
}

/// Identifier for an autonomous run: `auto_<name>_<unix seconds>`.
pub fn synthetic_jid(name: &str, at: OffsetDateTime) -> String {
    format!("auto_{}_{}", name, at.unix_timestamp())
}

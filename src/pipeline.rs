//! Execute, transform, deliver: the work done for every admitted job.

use std::future::Future;

use tracing::{info, warn};

use crate::error::JobError;
use crate::netdetect::ExternalIpResolver;
use crate::options::ScanOptions;
use crate::registry::Admission;
use crate::report::ReportDelivery;
use crate::scanner::ScanExecutor;
use crate::transform::to_payload;
use crate::types::JobStatus;

/// Outcome of a job that made it all the way to the management service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobSummary {
    pub hosts: usize,
}

/// Something that can carry one job from scan to delivery.
pub trait JobRunner: Send + Sync + 'static {
    fn run_job(
        &self,
        jid: &str,
        options: &ScanOptions,
    ) -> impl Future<Output = Result<JobSummary, JobError>> + Send;
}

/// The production runner: scanner, address lookup and delivery.
#[derive(Debug)]
pub struct Pipeline {
    executor: ScanExecutor,
    resolver: ExternalIpResolver,
    delivery: ReportDelivery,
}

impl Pipeline {
    pub fn new(
        executor: ScanExecutor,
        resolver: ExternalIpResolver,
        delivery: ReportDelivery,
    ) -> Self {
        Self {
            executor,
            resolver,
            delivery,
        }
    }
}

impl JobRunner for Pipeline {
    async fn run_job(&self, jid: &str, options: &ScanOptions) -> Result<JobSummary, JobError> {
        let result = self.executor.run(jid, options).await?;
        let external_ip = self.resolver.resolve().await;
        let payload = to_payload(jid, &external_ip, &result);
        self.delivery.send(&payload).await?;
        Ok(JobSummary {
            hosts: payload.hosts.len(),
        })
    }
}

/// Run an admitted job and record its terminal status.
///
/// Failures end up in the log only. The registry entry is released when
/// `admission` is dropped at the end of this call.
pub async fn drive<R: JobRunner>(
    runner: &R,
    admission: Admission,
    options: &ScanOptions,
    origin: &'static str,
) -> JobStatus {
    let jid = admission.jid().to_string();
    let status = match runner.run_job(&jid, options).await {
        Ok(summary) => {
            info!(jid = %jid, origin, hosts = summary.hosts, "scan job completed");
            JobStatus::Completed
        }
        Err(JobError::Scan(e)) if e.is_parse_error() => {
            warn!(jid = %jid, origin, error = %e, "scan output could not be parsed");
            JobStatus::Failed
        }
        Err(JobError::Scan(e)) => {
            warn!(jid = %jid, origin, error = %e, "scan failed");
            JobStatus::Failed
        }
        Err(JobError::Delivery(e)) => {
            warn!(jid = %jid, origin, error = %e, "failed to report results");
            JobStatus::Failed
        }
    };
    admission.set_status(status);
    status
}

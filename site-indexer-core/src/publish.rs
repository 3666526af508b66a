//! Publishing: submits one publish job for the index items touched by a run and polls it
//! until it succeeds or fails.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::context::{PendingWritesHandle, RunControl};
use crate::contract::{JobState, PublishJobRequest, SiteRepository};
use crate::error::{IndexError, Result};

/// Substring of a failed job message meaning the items still await approval.
pub const APPROVAL_REQUIRED_MARKER: &str = "requires approval";

#[derive(Debug, Clone, PartialEq)]
pub struct PublishReport {
    pub job_id: String,
    pub item_ids: Vec<String>,
}

/// Maps a failed job message to the error surfaced to the caller.
pub fn classify_failure(job_id: &str, message: String) -> IndexError {
    if message.to_lowercase().contains(APPROVAL_REQUIRED_MARKER) {
        IndexError::ApprovalRequired {
            job_id: job_id.to_string(),
            message,
        }
    } else {
        IndexError::PublishFailed {
            job_id: job_id.to_string(),
            message,
        }
    }
}

pub struct PublishCoordinator<'a, R: ?Sized> {
    repo: &'a R,
    control: &'a RunControl,
    poll_interval: Duration,
    timeout: Duration,
}

impl<'a, R> PublishCoordinator<'a, R>
where
    R: SiteRepository + ?Sized,
{
    pub fn new(repo: &'a R, control: &'a RunControl, poll_interval: Duration, timeout: Duration) -> Self {
        PublishCoordinator {
            repo,
            control,
            poll_interval,
            timeout,
        }
    }

    /// Publishes every id in the publish set of `pending` to `channel_id`.
    pub async fn publish(&self, channel_id: &str, pending: &PendingWritesHandle) -> Result<PublishReport> {
        let item_ids = pending.publish_ids();
        let request = PublishJobRequest {
            channel_id: channel_id.to_string(),
            name: format!("index-site-{}", Uuid::new_v4()),
        };
        info!(
            channel_id = %channel_id,
            items = item_ids.len(),
            job_name = %request.name,
            "[PUBLISH] Submitting publish job"
        );

        let job_id = self
            .control
            .guard("publish job submission", async {
                self.repo
                    .submit_publish_job(&request)
                    .await
                    .map_err(|e| IndexError::write("publish job submission", e))
            })
            .await?;
        info!(job_id = %job_id, "[PUBLISH] Publish job submitted, polling status");

        self.wait_for(&job_id).await?;
        info!(job_id = %job_id, items = item_ids.len(), "[PUBLISH] Publish job succeeded");
        Ok(PublishReport { job_id, item_ids })
    }

    /// Polls the job every `poll_interval` until it reaches a terminal state or the timeout.
    pub async fn wait_for(&self, job_id: &str) -> Result<()> {
        let deadline = Some(Instant::now() + self.timeout);
        let what = format!("publish job {job_id}");
        loop {
            let status = self
                .control
                .guard_until(&what, deadline, self.repo.job_status(job_id))
                .await?;
            match status.state() {
                JobState::Success => return Ok(()),
                JobState::Failed(message) => {
                    error!(job_id = %job_id, message = %message, "[PUBLISH] Publish job failed");
                    return Err(classify_failure(job_id, message));
                }
                JobState::Running => {
                    debug!(job_id = %job_id, progress = ?status.progress, "[PUBLISH] Publish job running");
                    self.control
                        .tick(self.poll_interval, deadline)
                        .await
                        .map_err(|e| match e {
                            IndexError::Timeout(_) => IndexError::Timeout(format!(
                                "{what} did not finish within {:?}",
                                self.timeout
                            )),
                            other => other,
                        })?;
                }
            }
        }
    }
}

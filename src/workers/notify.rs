use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{AppError, Result};
use crate::queue::{Job, JobHandler, NotificationRecord, QUEUE_NOTIFY};
use crate::server::AppState;

/// Consumer of the `pr-notify-chat` queue. Delivery is best-effort: the chat
/// provider never gets to fail the job, and a provider outage never reaches
/// the queue's retry machinery.
pub struct NotificationWorker {
    state: Arc<AppState>,
}

impl NotificationWorker {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    async fn process(&self, job: &Job) -> Result<()> {
        let record: NotificationRecord = serde_json::from_value(job.data.clone())
            .map_err(|e| AppError::Internal(format!("Malformed notification payload: {e}")))?;

        let chat = &self.state.config.chat;
        if !chat.enabled || chat.webhook_url.is_empty() {
            tracing::info!(
                pull_request_id = %record.pull_request_id,
                "Chat disabled; acknowledging notification without delivery"
            );
            return Ok(());
        }

        // chat_message_ts is the delivery marker: a PR that already carries
        // one was notified by a concurrent path.
        match self
            .state
            .store
            .pull_requests
            .find_by_id(&record.pull_request_id)
            .await
        {
            Ok(Some(pr)) if pr.chat_message_ts.is_some() => {
                tracing::info!(
                    pull_request_id = %record.pull_request_id,
                    "PR already notified; skipping duplicate"
                );
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    pull_request_id = %record.pull_request_id,
                    error = %e,
                    "Could not check delivery marker; attempting delivery anyway"
                );
            }
        }

        match self.state.chat.deliver(&record).await {
            Ok(ts) => {
                tracing::info!(
                    pull_request_id = %record.pull_request_id,
                    repo = %record.repo_full_name,
                    number = record.number,
                    "Chat notification delivered"
                );
                if let Err(e) = self
                    .state
                    .store
                    .pull_requests
                    .set_chat_message_ts(&record.pull_request_id, &ts)
                    .await
                {
                    tracing::warn!(
                        pull_request_id = %record.pull_request_id,
                        error = %e,
                        "Failed to record delivery marker"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    pull_request_id = %record.pull_request_id,
                    error = %e,
                    "Chat delivery failed; not retrying"
                );
            }
        }

        Ok(())
    }
}

#[async_trait]
impl JobHandler for NotificationWorker {
    fn queue(&self) -> &'static str {
        QUEUE_NOTIFY
    }

    async fn handle(&self, job: &Job) -> Result<()> {
        self.process(job).await
    }
}

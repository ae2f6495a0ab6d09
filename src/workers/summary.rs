use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::analyzer::{analyze, FileChange};
use crate::error::{AppError, Result};
use crate::model::SummaryRequest;
use crate::queue::{
    Job, JobHandler, NotificationRecord, SummaryJobData, JOB_NOTIFICATION, JOB_REGENERATE,
    QUEUE_NOTIFY, QUEUE_SUMMARY,
};
use crate::server::AppState;
use crate::store::pull_requests::{PullRequest, Summary, SummaryStatus};

const MAX_FILES: usize = 100;

/// Consumer of the `pr-summary` queue: runs deterministic analysis, asks the
/// generative model for a summary, and decides whether chat should hear
/// about the PR.
pub struct SummaryWorker {
    state: Arc<AppState>,
}

impl SummaryWorker {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    async fn process(&self, job: &Job) -> Result<()> {
        let data: SummaryJobData = serde_json::from_value(job.data.clone())
            .map_err(|e| AppError::Internal(format!("Malformed summary job payload: {e}")))?;

        let prs = &self.state.store.pull_requests;

        let Some(pr) = prs.find_by_id(&data.pull_request_id).await? else {
            tracing::warn!(
                pull_request_id = %data.pull_request_id,
                "Summary job for missing PR; completing without retry"
            );
            return Err(AppError::NotFound(format!(
                "pull request {}",
                data.pull_request_id
            )));
        };

        // Captured before any writes so we can tell later whether this very
        // attempt flipped the summary to ready.
        let was_ready = pr.summary_status == SummaryStatus::Ready;

        if was_ready && pr.summary.is_some() && job.name != JOB_REGENERATE {
            tracing::info!(
                pull_request_id = %pr.id,
                job = %job.name,
                "Summary already ready; skipping duplicate job"
            );
            return Ok(());
        }

        // Metadata and file list in parallel. A denied credential marks the
        // PR errored before the job fails.
        let (details, files) = match tokio::try_join!(
            self.state
                .platform
                .get_pull_request(data.installation_id, &data.repo_full_name, data.number),
            self.state.platform.list_pr_files(
                data.installation_id,
                &data.repo_full_name,
                data.number,
                MAX_FILES
            ),
        ) {
            Ok(fetched) => fetched,
            Err(e) => {
                if !e.is_retryable() {
                    prs.save_summary_error(&pr.id, &e.to_string()).await?;
                }
                return Err(e);
            }
        };

        let changes: Vec<FileChange> = files
            .iter()
            .map(|f| FileChange {
                filename: f.filename.clone(),
                additions: f.additions,
                deletions: f.deletions,
                patch: f.patch.clone(),
            })
            .collect();

        let analysis = analyze(&changes);
        tracing::info!(
            pull_request_id = %pr.id,
            labels = ?analysis.system_labels,
            risk_flags = ?analysis.risk_flags,
            risk_score = analysis.risk_score,
            additions = analysis.diff_stats.total_additions,
            deletions = analysis.diff_stats.total_deletions,
            files = analysis.diff_stats.changed_files_count,
            "Deterministic analysis computed"
        );

        // Analysis lands regardless of how the model call goes.
        prs.update_analysis(&pr.id, &analysis).await?;

        let request = SummaryRequest {
            details,
            files,
            analysis,
        };

        match self.state.summarizer.summarize(&request).await {
            Ok(output) => {
                let summary = Summary {
                    tldr: output.tldr,
                    risks: output.risks,
                    labels: output.labels,
                    created_at: Utc::now(),
                };
                prs.save_summary_success(&pr.id, &summary).await?;
                tracing::info!(pull_request_id = %pr.id, "Summary ready");
            }
            Err(e) => {
                // The job itself succeeds; the failure lives on the PR and a
                // regenerate can retry it.
                prs.save_summary_error(&pr.id, &e.to_string()).await?;
                tracing::warn!(pull_request_id = %pr.id, error = %e, "Summary generation failed");
            }
        }

        // Reload rather than trusting our in-memory copy, so effects of
        // concurrent writers are observed before the notification decision.
        let Some(reloaded) = prs.find_by_id(&pr.id).await? else {
            return Err(AppError::NotFound(format!("pull request {}", pr.id)));
        };

        self.maybe_notify(&request.details.html_url, was_ready, &reloaded)
            .await;

        Ok(())
    }

    async fn maybe_notify(&self, html_url: &str, was_ready: bool, pr: &PullRequest) {
        let chat = &self.state.config.chat;
        let became_ready_now = !was_ready && pr.summary_status == SummaryStatus::Ready;
        let high_risk = pr.risk_score >= chat.risk_threshold;
        let secrets = pr.risk_flags.iter().any(|f| f == "secrets-suspected");

        let should_notify = chat.enabled && (became_ready_now || high_risk || secrets);
        if !should_notify {
            tracing::debug!(
                pull_request_id = %pr.id,
                became_ready_now,
                high_risk,
                secrets,
                "No chat notification warranted"
            );
            return;
        }

        let dashboard_url = if self.state.config.urls.frontend_base.is_empty() {
            None
        } else {
            Some(format!(
                "{}/prs/{}",
                self.state.config.urls.frontend_base.trim_end_matches('/'),
                pr.id
            ))
        };

        let record = NotificationRecord {
            pull_request_id: pr.id.clone(),
            repo_full_name: pr.repo_full_name.clone(),
            number: pr.number,
            title: pr.title.clone(),
            author: pr.author.clone(),
            tldr: pr
                .summary
                .as_ref()
                .map(|s| s.tldr.clone())
                .unwrap_or_else(|| "Summary unavailable.".to_string()),
            risk_score: pr.risk_score,
            main_risk_flags: pr.risk_flags.clone(),
            system_labels: pr.system_labels.clone(),
            html_url: html_url.to_string(),
            dashboard_url,
        };

        // Enqueue failure must not fail the summary job.
        if let Err(e) = self
            .state
            .queue
            .enqueue(QUEUE_NOTIFY, JOB_NOTIFICATION, &record)
            .await
        {
            tracing::warn!(pull_request_id = %pr.id, error = %e, "Failed to enqueue chat notification");
        }
    }
}

#[async_trait]
impl JobHandler for SummaryWorker {
    fn queue(&self) -> &'static str {
        QUEUE_SUMMARY
    }

    async fn handle(&self, job: &Job) -> Result<()> {
        self.process(job).await
    }
}

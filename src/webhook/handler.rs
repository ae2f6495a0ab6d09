use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};

use crate::queue::{SummaryJobData, JOB_GENERATE, QUEUE_SUMMARY};
use crate::server::AppState;
use crate::store::installations::{AccountType, NewInstallation, NewRepo};
use crate::store::pull_requests::{FileStat, PrStatus, PrUpsert, PullRequest, SummaryStatus};
use crate::sync;
use crate::webhook::events::{
    InstallationEvent, InstallationRepositoriesEvent, PullRequestEvent, PullRequestPayload,
    WebhookEvent,
};
use crate::webhook::signature::verify_signature;

pub async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let event_type = match headers.get("x-event-name").and_then(|v| v.to_str().ok()) {
        Some(et) => et.to_string(),
        None => {
            tracing::warn!("Missing X-Event-Name header");
            return StatusCode::BAD_REQUEST;
        }
    };
    let delivery_id = headers
        .get("x-delivery-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");

    let secret = state.config.webhook_secret();
    if secret.is_empty() {
        tracing::warn!(
            "WEBHOOK SECRET NOT CONFIGURED - accepting unverified payload. \
             Never run this way outside development."
        );
    } else {
        let signature = match headers
            .get("x-hub-signature-256")
            .and_then(|v| v.to_str().ok())
        {
            Some(sig) => sig.to_string(),
            None => {
                tracing::warn!(delivery_id, "Missing X-Hub-Signature-256 header");
                return StatusCode::UNAUTHORIZED;
            }
        };

        if let Err(e) = verify_signature(secret, &body, &signature) {
            tracing::warn!(delivery_id, error = %e, "Webhook signature verification failed");
            return StatusCode::UNAUTHORIZED;
        }
    }

    let event = match WebhookEvent::parse(&event_type, &body) {
        Ok(event) => event,
        Err(e) => {
            tracing::error!(delivery_id, event_type = %event_type, error = %e, "Failed to parse webhook event");
            return StatusCode::BAD_REQUEST;
        }
    };

    tracing::info!(delivery_id, event_type = %event_type, "Received webhook event");

    match event {
        WebhookEvent::Installation(installation_event) => {
            handle_installation_event(&state, installation_event).await
        }
        WebhookEvent::InstallationRepositories(repos_event) => {
            handle_installation_repositories_event(&state, repos_event).await
        }
        WebhookEvent::PullRequest(pr_event) => handle_pull_request_event(&state, pr_event).await,
        WebhookEvent::Ping => {
            tracing::info!("Received ping event");
            StatusCode::OK
        }
        WebhookEvent::Unsupported(event_type) => {
            tracing::debug!(event_type = %event_type, "Ignoring unsupported event");
            StatusCode::OK
        }
    }
}

async fn handle_installation_event(
    state: &Arc<AppState>,
    event: InstallationEvent,
) -> StatusCode {
    let installation_id = event.installation.id;
    let account = &event.installation.account;

    match event.action.as_str() {
        "created" => {
            let account_type = if account.account_type.eq_ignore_ascii_case("organization") {
                AccountType::Organization
            } else {
                AccountType::User
            };

            let new = NewInstallation {
                installation_id,
                account_type,
                account_login: account.login.clone(),
                account_avatar_url: account.avatar_url.clone(),
                repositories: event
                    .repositories
                    .iter()
                    .map(|r| NewRepo {
                        repo_id: r.id.to_string(),
                        repo_full_name: r.full_name.clone(),
                        private: r.private,
                    })
                    .collect(),
            };

            if let Err(e) = state.store.installations.create_if_missing(&new).await {
                tracing::error!(installation_id, error = %e, "Failed to record installation");
                return StatusCode::INTERNAL_SERVER_ERROR;
            }

            match account_type {
                AccountType::Organization => {
                    // Member reconciliation pages the platform API; run it off
                    // the request path so the webhook answers within its window.
                    let state = Arc::clone(state);
                    let org = account.login.clone();
                    tokio::spawn(async move {
                        let outcome = sync::sync_org_members(&state, installation_id, &org).await;
                        tracing::info!(
                            installation_id,
                            updated = outcome.updated,
                            errors = outcome.errors,
                            "Org member sync after install"
                        );
                    });
                }
                AccountType::User => {
                    // Best-effort: link the installing account to a known user.
                    match state.store.users.find_by_username(&account.login).await {
                        Ok(Some(user)) => {
                            if let Err(e) = state
                                .store
                                .users
                                .link_installation(&user.id, installation_id)
                                .await
                            {
                                tracing::warn!(installation_id, error = %e, "Failed to link installing user");
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!(installation_id, error = %e, "User lookup failed during install")
                        }
                    }
                }
            }

            StatusCode::OK
        }
        "deleted" => {
            if let Err(e) = state.store.installations.mark_suspended(installation_id).await {
                tracing::error!(installation_id, error = %e, "Failed to suspend installation");
                return StatusCode::INTERNAL_SERVER_ERROR;
            }
            StatusCode::OK
        }
        other => {
            tracing::debug!(installation_id, action = other, "Ignoring installation action");
            StatusCode::OK
        }
    }
}

async fn handle_installation_repositories_event(
    state: &Arc<AppState>,
    event: InstallationRepositoriesEvent,
) -> StatusCode {
    let installation_id = event.installation.id;

    let result = match event.action.as_str() {
        "added" => {
            let repos: Vec<NewRepo> = event
                .repositories_added
                .iter()
                .map(|r| NewRepo {
                    repo_id: r.id.to_string(),
                    repo_full_name: r.full_name.clone(),
                    private: r.private,
                })
                .collect();
            state
                .store
                .installations
                .add_repositories(installation_id, &repos)
                .await
        }
        "removed" => {
            let repo_ids: Vec<String> = event
                .repositories_removed
                .iter()
                .map(|r| r.id.to_string())
                .collect();
            state
                .store
                .installations
                .remove_repositories(installation_id, &repo_ids)
                .await
        }
        other => {
            tracing::debug!(installation_id, action = other, "Ignoring repositories action");
            return StatusCode::OK;
        }
    };

    if let Err(e) = result {
        tracing::error!(installation_id, error = %e, "Failed to update installation repositories");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::OK
}

fn status_from_payload(payload: &PullRequestPayload) -> PrStatus {
    if payload.merged {
        PrStatus::Merged
    } else {
        match payload.state.as_str() {
            "closed" => PrStatus::Closed,
            _ => PrStatus::Open,
        }
    }
}

async fn handle_pull_request_event(state: &Arc<AppState>, event: PullRequestEvent) -> StatusCode {
    let Some(installation) = event.installation.as_ref() else {
        tracing::warn!(
            repo = %event.repository.full_name,
            "Pull request event without installation; acknowledging"
        );
        return StatusCode::OK;
    };
    let installation_id = installation.id;
    let repo_id = event.repository.id.to_string();
    let repo_full_name = event.repository.full_name.clone();
    let number = event.pull_request.number;

    let result = match event.action.as_str() {
        "opened" => {
            handle_pr_opened(state, installation_id, &repo_id, &repo_full_name, &event).await
        }
        "synchronize" | "edited" => {
            handle_pr_upsert(state, installation_id, &repo_id, &repo_full_name, &event).await
        }
        "closed" => {
            state
                .store
                .pull_requests
                .set_status(&repo_id, number, status_from_payload(&event.pull_request))
                .await
        }
        "reopened" => {
            handle_pr_reopened(state, installation_id, &repo_id, &repo_full_name, &event).await
        }
        other => {
            tracing::debug!(repo = %repo_full_name, number, action = other, "Ignoring pull request action");
            Ok(())
        }
    };

    match result {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            tracing::error!(repo = %repo_full_name, number, error = %e, "Pull request event failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn handle_pr_opened(
    state: &Arc<AppState>,
    installation_id: i64,
    repo_id: &str,
    repo_full_name: &str,
    event: &PullRequestEvent,
) -> crate::error::Result<()> {
    let number = event.pull_request.number;

    // Redelivery of an opened event must not duplicate the PR or its job.
    if state
        .store
        .pull_requests
        .find_by_repo_number(repo_id, number)
        .await?
        .is_some()
    {
        tracing::info!(repo = repo_full_name, number, "PR already known; ignoring redelivered open");
        return Ok(());
    }

    let files = fetch_files_best_effort(state, installation_id, repo_full_name, number).await;
    let user_id = attribute_user(state, installation_id, &event.pull_request.user.login).await;

    let upsert = PrUpsert {
        installation_id,
        repo_id: repo_id.to_string(),
        number,
        user_id,
        repo_full_name: repo_full_name.to_string(),
        title: event.pull_request.title.clone(),
        author: event.pull_request.user.login.clone(),
        branch_from: event.pull_request.head.ref_name.clone(),
        branch_to: event.pull_request.base.ref_name.clone(),
        status: status_from_payload(&event.pull_request),
        files_changed: files,
    };

    let (pr, created) = state.store.pull_requests.upsert(&upsert).await?;
    if created {
        enqueue_summary(state, &pr).await;
    }
    Ok(())
}

async fn handle_pr_upsert(
    state: &Arc<AppState>,
    installation_id: i64,
    repo_id: &str,
    repo_full_name: &str,
    event: &PullRequestEvent,
) -> crate::error::Result<()> {
    let number = event.pull_request.number;
    let existing = state
        .store
        .pull_requests
        .find_by_repo_number(repo_id, number)
        .await?;

    // A failed file fetch must not wipe what an earlier delivery stored.
    let files = match fetch_files(state, installation_id, repo_full_name, number).await {
        Ok(files) => files,
        Err(e) => {
            tracing::warn!(repo = repo_full_name, number, error = %e, "File fetch failed; keeping stored file list");
            existing
                .as_ref()
                .map(|pr| pr.files_changed.clone())
                .unwrap_or_default()
        }
    };

    let user_id = match &existing {
        Some(pr) => pr.user_id.clone(),
        None => attribute_user(state, installation_id, &event.pull_request.user.login).await,
    };

    let upsert = PrUpsert {
        installation_id,
        repo_id: repo_id.to_string(),
        number,
        user_id,
        repo_full_name: repo_full_name.to_string(),
        title: event.pull_request.title.clone(),
        author: event.pull_request.user.login.clone(),
        branch_from: event.pull_request.head.ref_name.clone(),
        branch_to: event.pull_request.base.ref_name.clone(),
        status: status_from_payload(&event.pull_request),
        files_changed: files,
    };

    let (pr, created) = state.store.pull_requests.upsert(&upsert).await?;
    if created || pr.summary_status == SummaryStatus::Pending {
        enqueue_summary(state, &pr).await;
    }
    Ok(())
}

async fn handle_pr_reopened(
    state: &Arc<AppState>,
    installation_id: i64,
    repo_id: &str,
    repo_full_name: &str,
    event: &PullRequestEvent,
) -> crate::error::Result<()> {
    let number = event.pull_request.number;

    // Upsert first so a reopen for a PR we never saw still creates it.
    let upsert = PrUpsert {
        installation_id,
        repo_id: repo_id.to_string(),
        number,
        user_id: attribute_user(state, installation_id, &event.pull_request.user.login).await,
        repo_full_name: repo_full_name.to_string(),
        title: event.pull_request.title.clone(),
        author: event.pull_request.user.login.clone(),
        branch_from: event.pull_request.head.ref_name.clone(),
        branch_to: event.pull_request.base.ref_name.clone(),
        status: PrStatus::Open,
        files_changed: fetch_files_best_effort(state, installation_id, repo_full_name, number).await,
    };
    let (pr, _) = state.store.pull_requests.upsert(&upsert).await?;

    state.store.pull_requests.reopen(repo_id, number).await?;
    enqueue_summary(state, &pr).await;
    Ok(())
}

async fn fetch_files(
    state: &Arc<AppState>,
    installation_id: i64,
    repo_full_name: &str,
    number: i64,
) -> crate::error::Result<Vec<FileStat>> {
    let files = state
        .platform
        .list_pr_files(installation_id, repo_full_name, number, 100)
        .await?;
    Ok(files
        .into_iter()
        .map(|f| FileStat {
            filename: f.filename,
            additions: f.additions,
            deletions: f.deletions,
        })
        .collect())
}

/// File fetch that never blocks the 200 response: failures log and yield an
/// empty list.
async fn fetch_files_best_effort(
    state: &Arc<AppState>,
    installation_id: i64,
    repo_full_name: &str,
    number: i64,
) -> Vec<FileStat> {
    match fetch_files(state, installation_id, repo_full_name, number).await {
        Ok(files) => files,
        Err(e) => {
            tracing::warn!(repo = repo_full_name, number, error = %e, "File fetch failed; continuing with empty list");
            Vec::new()
        }
    }
}

/// Attribute the PR to a known user: sole member of the tenancy first, then
/// an author-by-username match.
async fn attribute_user(
    state: &Arc<AppState>,
    installation_id: i64,
    author: &str,
) -> Option<String> {
    match state.store.users.find_by_installation(installation_id).await {
        Ok(members) if members.len() == 1 => return Some(members[0].id.clone()),
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(installation_id, error = %e, "Member lookup failed during attribution")
        }
    }

    match state.store.users.find_by_username(author).await {
        Ok(Some(user)) => Some(user.id),
        Ok(None) => None,
        Err(e) => {
            tracing::warn!(author, error = %e, "Author lookup failed during attribution");
            None
        }
    }
}

async fn enqueue_summary(state: &Arc<AppState>, pr: &PullRequest) {
    let data = SummaryJobData {
        pull_request_id: pr.id.clone(),
        installation_id: pr.installation_id,
        repo_full_name: pr.repo_full_name.clone(),
        number: pr.number,
    };

    if let Err(e) = state.queue.enqueue(QUEUE_SUMMARY, JOB_GENERATE, &data).await {
        tracing::error!(pull_request_id = %pr.id, error = %e, "Failed to enqueue summary job");
    }
}

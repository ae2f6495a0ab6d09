use std::sync::Arc;

use crate::error::AppError;
use crate::server::AppState;

/// Result of one reconciliation pass. Errors are counted, not fatal.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub updated: usize,
    pub errors: usize,
}

/// Link known users to an organization installation by member login.
///
/// Runs after `installation.created` for organization accounts and
/// opportunistically on login. Falls back to the public member list when the
/// installation is not allowed to read full membership.
pub async fn sync_org_members(
    state: &Arc<AppState>,
    installation_id: i64,
    org: &str,
) -> SyncOutcome {
    let mut outcome = SyncOutcome::default();

    let members = match state.platform.list_org_members(installation_id, org).await {
        Ok(members) => members,
        Err(AppError::CredentialDenied(reason)) => {
            tracing::info!(
                installation_id,
                org,
                reason = %reason,
                "Full member list forbidden; falling back to public members"
            );
            match state
                .platform
                .list_public_org_members(installation_id, org)
                .await
            {
                Ok(members) => members,
                Err(e) => {
                    tracing::warn!(installation_id, org, error = %e, "Public member list failed");
                    outcome.errors += 1;
                    return outcome;
                }
            }
        }
        Err(e) => {
            tracing::warn!(installation_id, org, error = %e, "Member list failed");
            outcome.errors += 1;
            return outcome;
        }
    };

    for member in members {
        match state.store.users.find_by_username(&member.login).await {
            Ok(Some(user)) => {
                match state
                    .store
                    .users
                    .link_installation(&user.id, installation_id)
                    .await
                {
                    Ok(true) => outcome.updated += 1,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(
                            installation_id,
                            member = %member.login,
                            error = %e,
                            "Failed to link member"
                        );
                        outcome.errors += 1;
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(member = %member.login, error = %e, "Member lookup failed");
                outcome.errors += 1;
            }
        }
    }

    outcome
}

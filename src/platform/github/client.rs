use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use octocrab::Octocrab;
use tokio::sync::Mutex;

use crate::config::GitHubConfig;
use crate::error::{AppError, Result};
use crate::platform::types::*;
use crate::platform::Platform;

use super::auth::{generate_app_jwt, load_encoding_key};
use super::mapper;

const MAX_GET_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);
const MAX_MEMBER_PAGES: u32 = 10;

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    refresh_after: DateTime<Utc>,
}

type TokenSlot = Arc<Mutex<Option<CachedToken>>>;

pub struct GitHubPlatform {
    app_id: u64,
    encoding_key: jsonwebtoken::EncodingKey,
    api_timeout: Duration,
    /// Per-installation token slots. The outer lock only guards slot lookup;
    /// the per-slot lock is what coalesces concurrent refreshes for one
    /// installation (single-flight) without serialising unrelated tenants.
    token_cache: Arc<Mutex<HashMap<i64, TokenSlot>>>,
}

impl GitHubPlatform {
    pub fn new(config: &GitHubConfig) -> Result<Self> {
        let encoding_key = load_encoding_key(config)?;

        Ok(Self {
            app_id: config.app_id,
            encoding_key,
            api_timeout: Duration::from_secs(config.api_timeout_secs),
            token_cache: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn build_client(&self, token: String) -> Result<Octocrab> {
        Octocrab::builder()
            .personal_token(token)
            .set_connect_timeout(Some(self.api_timeout))
            .set_read_timeout(Some(self.api_timeout))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build octocrab client: {e}")))
    }

    /// Get an octocrab instance authenticated as an installation.
    async fn installation_client(&self, installation_id: i64) -> Result<Octocrab> {
        let token = self.get_access_token(installation_id).await?;
        self.build_client(token)
    }

    /// An octocrab instance authenticated as the App itself (JWT bearer).
    fn app_client(&self) -> Result<Octocrab> {
        let jwt = generate_app_jwt(self.app_id, &self.encoding_key)?;
        self.build_client(jwt)
    }

    fn parse_repo(repo_full_name: &str) -> Result<(&str, &str)> {
        let parts: Vec<&str> = repo_full_name.splitn(2, '/').collect();
        if parts.len() != 2 {
            return Err(AppError::Internal(format!(
                "Invalid repo name: {repo_full_name}"
            )));
        }
        Ok((parts[0], parts[1]))
    }

    /// Mint a fresh installation token via the App JWT.
    async fn mint_token(&self, installation_id: i64) -> Result<CachedToken> {
        let client = self.app_client()?;

        let url = format!("/app/installations/{installation_id}/access_tokens");
        let response: serde_json::Value = client.post(&url, None::<&()>).await?;

        let token = response["token"]
            .as_str()
            .ok_or_else(|| AppError::CredentialDenied("No token in mint response".to_string()))?
            .to_string();

        let expires_at = response["expires_at"]
            .as_str()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc::now() + chrono::Duration::hours(1));

        // Refresh a minute before expiry, but never trust a token beyond 55
        // minutes regardless of what the platform reports.
        let refresh_after = std::cmp::min(
            expires_at - chrono::Duration::seconds(60),
            Utc::now() + chrono::Duration::minutes(55),
        );

        tracing::debug!(installation_id, "Minted installation token");

        Ok(CachedToken {
            token,
            refresh_after,
        })
    }

    /// GET with capped exponential retry on transient upstream failures.
    /// Only used for idempotent reads.
    async fn get_with_retry<T: serde::de::DeserializeOwned>(
        &self,
        client: &Octocrab,
        url: &str,
    ) -> Result<T> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match client.get::<T, _, ()>(url, None::<&()>).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    // Only transient transport/5xx failures loop; denied
                    // credentials and malformed responses surface at once.
                    let err = AppError::from(e);
                    let transient = matches!(err, AppError::UpstreamTransient(_));
                    if !transient || attempt >= MAX_GET_ATTEMPTS {
                        return Err(err);
                    }
                    let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                    tracing::warn!(url, attempt, delay_ms = delay.as_millis() as u64, "Retrying GET after transient failure");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[async_trait]
impl Platform for GitHubPlatform {
    async fn get_access_token(&self, installation_id: i64) -> Result<String> {
        // Grab (or create) the slot for this installation; the map lock is
        // released before any network I/O.
        let slot = {
            let mut cache = self.token_cache.lock().await;
            Arc::clone(cache.entry(installation_id).or_default())
        };

        // Concurrent requesters for the same installation queue here; the
        // first one through refreshes, the rest observe the fresh entry.
        let mut guard = slot.lock().await;
        if let Some(cached) = guard.as_ref() {
            if Utc::now() < cached.refresh_after {
                return Ok(cached.token.clone());
            }
        }

        let minted = self.mint_token(installation_id).await?;
        let token = minted.token.clone();
        *guard = Some(minted);
        Ok(token)
    }

    async fn get_installation(&self, installation_id: i64) -> Result<InstallationInfo> {
        let client = self.app_client()?;
        let url = format!("/app/installations/{installation_id}");
        let value: serde_json::Value = self.get_with_retry(&client, &url).await?;
        mapper::map_installation(&value)
    }

    async fn list_installation_repos(&self, installation_id: i64) -> Result<Vec<InstallationRepo>> {
        let client = self.installation_client(installation_id).await?;
        let value: serde_json::Value = self
            .get_with_retry(&client, "/installation/repositories?per_page=100")
            .await?;
        Ok(mapper::map_installation_repos(&value))
    }

    async fn get_pull_request(
        &self,
        installation_id: i64,
        repo_full_name: &str,
        number: i64,
    ) -> Result<PrDetails> {
        let client = self.installation_client(installation_id).await?;
        let (owner, repo) = Self::parse_repo(repo_full_name)?;

        let url = format!("/repos/{owner}/{repo}/pulls/{number}");
        let value: serde_json::Value = self.get_with_retry(&client, &url).await?;
        mapper::map_pr_details(&value)
    }

    async fn list_pr_files(
        &self,
        installation_id: i64,
        repo_full_name: &str,
        number: i64,
        limit: usize,
    ) -> Result<Vec<PrFile>> {
        let client = self.installation_client(installation_id).await?;
        let (owner, repo) = Self::parse_repo(repo_full_name)?;

        let per_page = limit.min(100);
        let url = format!("/repos/{owner}/{repo}/pulls/{number}/files?per_page={per_page}");
        let values: Vec<serde_json::Value> = self.get_with_retry(&client, &url).await?;
        Ok(mapper::map_pr_files(&values, limit))
    }

    async fn list_org_members(&self, installation_id: i64, org: &str) -> Result<Vec<OrgMember>> {
        let client = self.installation_client(installation_id).await?;

        let mut members = Vec::new();
        for page in 1..=MAX_MEMBER_PAGES {
            let url = format!("/orgs/{org}/members?per_page=100&page={page}");
            let values: Vec<serde_json::Value> = self.get_with_retry(&client, &url).await?;
            let count = values.len();
            members.extend(mapper::map_org_members(&values));
            if count < 100 {
                break;
            }
        }
        Ok(members)
    }

    async fn list_public_org_members(
        &self,
        installation_id: i64,
        org: &str,
    ) -> Result<Vec<OrgMember>> {
        let client = self.installation_client(installation_id).await?;

        let mut members = Vec::new();
        for page in 1..=MAX_MEMBER_PAGES {
            let url = format!("/orgs/{org}/public_members?per_page=100&page={page}");
            let values: Vec<serde_json::Value> = self.get_with_retry(&client, &url).await?;
            let count = values.len();
            members.extend(mapper::map_org_members(&values));
            if count < 100 {
                break;
            }
        }
        Ok(members)
    }
}

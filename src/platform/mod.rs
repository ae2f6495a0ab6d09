pub mod github;
pub mod types;

use async_trait::async_trait;

use crate::error::Result;
use types::*;

/// Credential broker plus the slice of the platform REST surface the
/// pipeline consumes. Workers depend on this trait so tests can stub the
/// platform entirely.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Get an installation-scoped access token, minting one if the cache has
    /// no fresh entry.
    async fn get_access_token(&self, installation_id: i64) -> Result<String>;

    /// Fetch an installation's account metadata.
    async fn get_installation(&self, installation_id: i64) -> Result<InstallationInfo>;

    /// List all repositories accessible to an installation.
    async fn list_installation_repos(&self, installation_id: i64) -> Result<Vec<InstallationRepo>>;

    /// Fetch a pull request's metadata.
    async fn get_pull_request(
        &self,
        installation_id: i64,
        repo_full_name: &str,
        number: i64,
    ) -> Result<PrDetails>;

    /// List the files changed by a pull request, capped at `limit`.
    async fn list_pr_files(
        &self,
        installation_id: i64,
        repo_full_name: &str,
        number: i64,
        limit: usize,
    ) -> Result<Vec<PrFile>>;

    /// List the members of an organization account.
    async fn list_org_members(&self, installation_id: i64, org: &str) -> Result<Vec<OrgMember>>;

    /// List only the public members of an organization. Fallback when the
    /// installation is not allowed to see the full member list.
    async fn list_public_org_members(
        &self,
        installation_id: i64,
        org: &str,
    ) -> Result<Vec<OrgMember>>;
}

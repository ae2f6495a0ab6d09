use serde::{Deserialize, Serialize};

/// Account that owns an installation.
#[derive(Debug, Clone)]
pub struct InstallationAccount {
    pub login: String,
    /// `User` or `Organization` as reported by the platform.
    pub account_type: String,
    pub avatar_url: String,
}

/// An installation as returned by the platform API.
#[derive(Debug, Clone)]
pub struct InstallationInfo {
    pub id: i64,
    pub account: InstallationAccount,
}

/// A repository accessible via an installation.
#[derive(Debug, Clone)]
pub struct InstallationRepo {
    pub repo_id: String,
    pub full_name: String,
    pub private: bool,
}

/// Pull request metadata fetched for summarisation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrDetails {
    pub number: i64,
    pub title: String,
    pub author: String,
    pub branch_from: String,
    pub branch_to: String,
    pub state: String,
    pub merged: bool,
    pub html_url: String,
}

/// One file in a pull request diff. `patch` feeds secret scanning only and
/// is never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrFile {
    pub filename: String,
    pub additions: u64,
    pub deletions: u64,
    pub patch: Option<String>,
}

/// Member of an organization account.
#[derive(Debug, Clone)]
pub struct OrgMember {
    pub login: String,
}

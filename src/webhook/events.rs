use serde::Deserialize;

/// Top-level webhook event parsed from the payload based on the
/// `X-Event-Name` header.
#[derive(Debug)]
pub enum WebhookEvent {
    Installation(InstallationEvent),
    InstallationRepositories(InstallationRepositoriesEvent),
    PullRequest(PullRequestEvent),
    Ping,
    Unsupported(String),
}

#[derive(Debug, Deserialize)]
pub struct InstallationEvent {
    pub action: String,
    pub installation: InstallationPayload,
    #[serde(default)]
    pub repositories: Vec<RepoPayload>,
}

#[derive(Debug, Deserialize)]
pub struct InstallationRepositoriesEvent {
    pub action: String,
    pub installation: InstallationPayload,
    #[serde(default)]
    pub repositories_added: Vec<RepoPayload>,
    #[serde(default)]
    pub repositories_removed: Vec<RepoPayload>,
}

#[derive(Debug, Deserialize)]
pub struct PullRequestEvent {
    pub action: String,
    pub pull_request: PullRequestPayload,
    pub repository: RepositoryPayload,
    pub installation: Option<InstallationIdPayload>,
}

#[derive(Debug, Deserialize)]
pub struct InstallationPayload {
    pub id: i64,
    pub account: AccountPayload,
}

#[derive(Debug, Deserialize)]
pub struct AccountPayload {
    pub login: String,
    #[serde(rename = "type", default)]
    pub account_type: String,
    #[serde(default)]
    pub avatar_url: String,
}

#[derive(Debug, Deserialize)]
pub struct InstallationIdPayload {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct RepoPayload {
    pub id: i64,
    pub full_name: String,
    #[serde(default)]
    pub private: bool,
}

#[derive(Debug, Deserialize)]
pub struct RepositoryPayload {
    pub id: i64,
    pub full_name: String,
}

#[derive(Debug, Deserialize)]
pub struct PullRequestPayload {
    pub number: i64,
    pub title: String,
    pub user: UserPayload,
    pub head: BranchRef,
    pub base: BranchRef,
    pub state: String,
    #[serde(default)]
    pub merged: bool,
    #[serde(default)]
    pub html_url: String,
}

#[derive(Debug, Deserialize)]
pub struct BranchRef {
    #[serde(rename = "ref")]
    pub ref_name: String,
}

#[derive(Debug, Deserialize)]
pub struct UserPayload {
    pub login: String,
    pub id: i64,
}

impl WebhookEvent {
    pub fn parse(event_type: &str, payload: &[u8]) -> Result<Self, serde_json::Error> {
        match event_type {
            "installation" => {
                let event: InstallationEvent = serde_json::from_slice(payload)?;
                Ok(WebhookEvent::Installation(event))
            }
            "installation_repositories" => {
                let event: InstallationRepositoriesEvent = serde_json::from_slice(payload)?;
                Ok(WebhookEvent::InstallationRepositories(event))
            }
            "pull_request" => {
                let event: PullRequestEvent = serde_json::from_slice(payload)?;
                Ok(WebhookEvent::PullRequest(event))
            }
            "ping" => Ok(WebhookEvent::Ping),
            other => Ok(WebhookEvent::Unsupported(other.to_string())),
        }
    }
}

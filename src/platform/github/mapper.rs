use crate::error::{AppError, Result};
use crate::platform::types::*;

/// Map a raw `/app/installations/{id}` response.
pub fn map_installation(value: &serde_json::Value) -> Result<InstallationInfo> {
    let id = value["id"]
        .as_i64()
        .ok_or_else(|| AppError::UpstreamPermanent("installation without id".to_string()))?;
    let account = &value["account"];

    Ok(InstallationInfo {
        id,
        account: InstallationAccount {
            login: account["login"].as_str().unwrap_or("unknown").to_string(),
            account_type: account["type"].as_str().unwrap_or("User").to_string(),
            avatar_url: account["avatar_url"].as_str().unwrap_or("").to_string(),
        },
    })
}

/// Map a raw `/installation/repositories` response.
pub fn map_installation_repos(value: &serde_json::Value) -> Vec<InstallationRepo> {
    value["repositories"]
        .as_array()
        .map(|repos| {
            repos
                .iter()
                .filter_map(|repo| {
                    let id = repo["id"].as_i64()?;
                    Some(InstallationRepo {
                        repo_id: id.to_string(),
                        full_name: repo["full_name"].as_str()?.to_string(),
                        private: repo["private"].as_bool().unwrap_or(false),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Map a raw pull request object.
pub fn map_pr_details(value: &serde_json::Value) -> Result<PrDetails> {
    let number = value["number"]
        .as_i64()
        .ok_or_else(|| AppError::UpstreamPermanent("pull request without number".to_string()))?;

    Ok(PrDetails {
        number,
        title: value["title"].as_str().unwrap_or("").to_string(),
        author: value["user"]["login"].as_str().unwrap_or("unknown").to_string(),
        branch_from: value["head"]["ref"].as_str().unwrap_or("").to_string(),
        branch_to: value["base"]["ref"].as_str().unwrap_or("").to_string(),
        state: value["state"].as_str().unwrap_or("open").to_string(),
        merged: value["merged"].as_bool().unwrap_or(false),
        html_url: value["html_url"].as_str().unwrap_or("").to_string(),
    })
}

/// Map a raw list-files response, capped at `limit` entries.
pub fn map_pr_files(values: &[serde_json::Value], limit: usize) -> Vec<PrFile> {
    values
        .iter()
        .take(limit)
        .filter_map(|file| {
            Some(PrFile {
                filename: file["filename"].as_str()?.to_string(),
                additions: file["additions"].as_u64().unwrap_or(0),
                deletions: file["deletions"].as_u64().unwrap_or(0),
                patch: file["patch"].as_str().map(|s| s.to_string()),
            })
        })
        .collect()
}

/// Map a raw member list.
pub fn map_org_members(values: &[serde_json::Value]) -> Vec<OrgMember> {
    values
        .iter()
        .filter_map(|member| {
            Some(OrgMember {
                login: member["login"].as_str()?.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn maps_pull_request_fields() {
        let value = json!({
            "number": 7,
            "title": "Fix header parsing",
            "user": {"login": "alice"},
            "head": {"ref": "fix/header"},
            "base": {"ref": "main"},
            "state": "open",
            "merged": false,
            "html_url": "https://github.com/acme/widgets/pull/7"
        });

        let pr = map_pr_details(&value).unwrap();
        assert_eq!(pr.number, 7);
        assert_eq!(pr.author, "alice");
        assert_eq!(pr.branch_from, "fix/header");
        assert_eq!(pr.branch_to, "main");
    }

    #[test]
    fn pr_without_number_is_a_permanent_error() {
        let value = json!({"title": "no number"});
        assert!(map_pr_details(&value).is_err());
    }

    #[test]
    fn maps_files_with_cap() {
        let values: Vec<_> = (0..5)
            .map(|i| {
                json!({
                    "filename": format!("src/file{i}.rs"),
                    "additions": 10,
                    "deletions": 2,
                    "patch": "@@ -1 +1 @@"
                })
            })
            .collect();

        let files = map_pr_files(&values, 3);
        assert_eq!(files.len(), 3);
        assert_eq!(files[0].filename, "src/file0.rs");
        assert_eq!(files[0].patch.as_deref(), Some("@@ -1 +1 @@"));
    }

    #[test]
    fn skips_files_missing_required_fields() {
        let values = vec![json!({"additions": 1}), json!({"filename": "ok.rs"})];
        let files = map_pr_files(&values, 100);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].filename, "ok.rs");
    }

    #[test]
    fn maps_installation_account() {
        let value = json!({
            "id": 77,
            "account": {"login": "acme", "type": "Organization", "avatar_url": "https://a"}
        });
        let installation = map_installation(&value).unwrap();
        assert_eq!(installation.id, 77);
        assert_eq!(installation.account.account_type, "Organization");
    }
}

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::analyzer::Analysis;
use crate::config::ModelConfig;
use crate::error::{AppError, Result};
use crate::platform::types::{PrDetails, PrFile};

const MODEL_API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

const MAX_FILE_SUMMARIES: usize = 20;
const MAX_PATCH_SNIPPETS: usize = 5;
const MAX_SNIPPET_CHARS: usize = 1000;

/// Everything the model needs to summarise one PR.
#[derive(Debug, Clone)]
pub struct SummaryRequest {
    pub details: PrDetails,
    pub files: Vec<PrFile>,
    pub analysis: Analysis,
}

/// The structured summary the model must produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryOutput {
    pub tldr: String,
    #[serde(default)]
    pub risks: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// Seam between the summary worker and the generative model, so tests can
/// stub model behaviour.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, request: &SummaryRequest) -> Result<SummaryOutput>;
}

pub struct GenModelClient {
    client: Client,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl GenModelClient {
    pub fn new(config: &ModelConfig) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();

        Self {
            client,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        }
    }
}

/// Build the user prompt: PR header, capped file summaries, capped patch
/// snippets, and the deterministic analysis presented as ground truth.
pub fn build_prompt(request: &SummaryRequest) -> String {
    let details = &request.details;
    let mut prompt = format!(
        "Pull request #{} \"{}\" by {} ({} -> {}).\n\n",
        details.number, details.title, details.author, details.branch_from, details.branch_to
    );

    prompt.push_str("Changed files:\n");
    for file in request.files.iter().take(MAX_FILE_SUMMARIES) {
        prompt.push_str(&format!(
            "- {} (+{} / -{})\n",
            file.filename, file.additions, file.deletions
        ));
    }
    if request.files.len() > MAX_FILE_SUMMARIES {
        prompt.push_str(&format!(
            "... and {} more files\n",
            request.files.len() - MAX_FILE_SUMMARIES
        ));
    }

    let snippets: Vec<&PrFile> = request
        .files
        .iter()
        .filter(|f| f.patch.is_some())
        .take(MAX_PATCH_SNIPPETS)
        .collect();
    if !snippets.is_empty() {
        prompt.push_str("\nPatch excerpts:\n");
        for file in snippets {
            let patch = file.patch.as_deref().unwrap_or_default();
            let excerpt: String = patch.chars().take(MAX_SNIPPET_CHARS).collect();
            prompt.push_str(&format!("--- {}\n{}\n", file.filename, excerpt));
        }
    }

    prompt.push_str(&format!(
        "\nDeterministic analysis (treat as ground truth):\n\
         labels: {:?}\nrisk flags: {:?}\nrisk score: {}\n\
         diff: +{} / -{} across {} files\n",
        request.analysis.system_labels,
        request.analysis.risk_flags,
        request.analysis.risk_score,
        request.analysis.diff_stats.total_additions,
        request.analysis.diff_stats.total_deletions,
        request.analysis.diff_stats.changed_files_count
    ));

    prompt.push_str(
        "\nSummarise the change for a reviewer: a 1-3 sentence TL;DR, the concrete \
         risks worth calling out, and short topical labels.",
    );

    prompt
}

const SYSTEM_PROMPT: &str = "You are a code-review assistant. You describe pull \
requests factually and concisely. The deterministic analysis you are given is \
ground truth; never contradict it.";

// --- Request/response types for the messages API ---

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    system: String,
    messages: Vec<Message>,
    tools: Vec<ToolDefinition>,
    tool_choice: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ToolDefinition {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text {
        #[allow(dead_code)]
        text: String,
    },
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

const SUMMARY_TOOL: &str = "record_summary";

fn summary_tool_definition() -> ToolDefinition {
    ToolDefinition {
        name: SUMMARY_TOOL.to_string(),
        description: "Record the structured pull request summary.".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "tldr": {"type": "string", "description": "1-3 sentence summary"},
                "risks": {"type": "array", "items": {"type": "string"}},
                "labels": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["tldr", "risks", "labels"]
        }),
    }
}

#[async_trait]
impl Summarizer for GenModelClient {
    async fn summarize(&self, request: &SummaryRequest) -> Result<SummaryOutput> {
        if self.api_key.is_empty() {
            return Err(AppError::ModelFailure(
                "No model API key configured".to_string(),
            ));
        }

        let body = MessagesRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            system: SYSTEM_PROMPT.to_string(),
            messages: vec![Message {
                role: "user".to_string(),
                content: build_prompt(request),
            }],
            tools: vec![summary_tool_definition()],
            // Force the structured tool so the response is always parseable.
            tool_choice: json!({"type": "tool", "name": SUMMARY_TOOL}),
        };

        let response = self
            .client
            .post(MODEL_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::ModelFailure(format!("Model request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::ModelFailure(format!(
                "Model API returned {status}: {body}"
            )));
        }

        let parsed = response
            .json::<MessagesResponse>()
            .await
            .map_err(|e| AppError::ModelFailure(format!("Malformed model response: {e}")))?;

        let output = parsed
            .content
            .into_iter()
            .find_map(|block| match block {
                ContentBlock::ToolUse { name, input } if name == SUMMARY_TOOL => Some(input),
                _ => None,
            })
            .ok_or_else(|| {
                AppError::ModelFailure("Model response missing structured summary".to_string())
            })?;

        let output: SummaryOutput = serde_json::from_value(output)
            .map_err(|e| AppError::ModelFailure(format!("Summary schema violation: {e}")))?;

        if output.tldr.trim().is_empty() {
            return Err(AppError::ModelFailure("Model returned an empty TL;DR".to_string()));
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{analyze, FileChange};

    fn make_request(file_count: usize) -> SummaryRequest {
        let files: Vec<PrFile> = (0..file_count)
            .map(|i| PrFile {
                filename: format!("src/file{i}.rs"),
                additions: 1,
                deletions: 0,
                patch: Some("@@ -1 +1 @@\n-old\n+new".to_string()),
            })
            .collect();
        let changes: Vec<FileChange> = files
            .iter()
            .map(|f| FileChange {
                filename: f.filename.clone(),
                additions: f.additions,
                deletions: f.deletions,
                patch: f.patch.clone(),
            })
            .collect();

        SummaryRequest {
            details: PrDetails {
                number: 7,
                title: "Fix header parsing".to_string(),
                author: "alice".to_string(),
                branch_from: "fix/header".to_string(),
                branch_to: "main".to_string(),
                state: "open".to_string(),
                merged: false,
                html_url: String::new(),
            },
            analysis: analyze(&changes),
            files,
        }
    }

    #[test]
    fn prompt_includes_header_and_analysis() {
        let prompt = build_prompt(&make_request(2));
        assert!(prompt.contains("Pull request #7"));
        assert!(prompt.contains("alice"));
        assert!(prompt.contains("risk score: 0"));
        assert!(prompt.contains("src/file0.rs"));
    }

    #[test]
    fn prompt_caps_file_summaries() {
        let prompt = build_prompt(&make_request(30));
        assert!(prompt.contains("src/file19.rs"));
        assert!(!prompt.contains("- src/file20.rs"));
        assert!(prompt.contains("and 10 more files"));
    }

    #[test]
    fn prompt_caps_patch_snippets() {
        let mut request = make_request(8);
        for file in &mut request.files {
            file.patch = Some("x".repeat(5000));
        }
        let prompt = build_prompt(&request);
        let snippet_count = prompt.matches("--- src/").count();
        assert_eq!(snippet_count, 5);
        // Each excerpt is truncated.
        assert!(!prompt.contains(&"x".repeat(1001)));
    }

    #[test]
    fn summary_output_tolerates_missing_optional_fields() {
        let output: SummaryOutput = serde_json::from_value(json!({"tldr": "Fix."})).unwrap();
        assert_eq!(output.tldr, "Fix.");
        assert!(output.risks.is_empty());
        assert!(output.labels.is_empty());
    }
}

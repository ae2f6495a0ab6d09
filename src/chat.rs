use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::error::{AppError, Result};
use crate::queue::NotificationRecord;

const CHAT_TIMEOUT_SECS: u64 = 10;

/// Seam between the notification worker and the chat provider.
#[async_trait]
pub trait ChatSink: Send + Sync {
    /// Deliver one notification. Returns an opaque provider message id on
    /// success.
    async fn deliver(&self, record: &NotificationRecord) -> Result<String>;
}

fn risk_emoji(score: u8) -> &'static str {
    if score >= 70 {
        ":red_circle:"
    } else if score >= 40 {
        ":large_yellow_circle:"
    } else {
        ":large_green_circle:"
    }
}

/// Build the provider "blocks" payload for a notification.
pub fn build_message(record: &NotificationRecord) -> Value {
    let flags = if record.main_risk_flags.is_empty() {
        "none".to_string()
    } else {
        record.main_risk_flags.join(", ")
    };
    let labels = if record.system_labels.is_empty() {
        "none".to_string()
    } else {
        record.system_labels.join(", ")
    };

    let mut blocks = vec![
        json!({
            "type": "header",
            "text": {
                "type": "plain_text",
                "text": format!("PR #{} · {}", record.number, record.title),
                "emoji": true
            }
        }),
        json!({
            "type": "context",
            "elements": [{
                "type": "mrkdwn",
                "text": format!("*{}* · opened by *{}*", record.repo_full_name, record.author)
            }]
        }),
        json!({"type": "divider"}),
        json!({
            "type": "section",
            "text": {
                "type": "mrkdwn",
                "text": format!(
                    "*Risk Score:* {} {}/100\n*Risk Flags:* {}",
                    risk_emoji(record.risk_score), record.risk_score, flags
                )
            }
        }),
        json!({
            "type": "section",
            "text": {
                "type": "mrkdwn",
                "text": format!("*TL;DR:* {}", record.tldr)
            }
        }),
        json!({
            "type": "context",
            "elements": [{
                "type": "mrkdwn",
                "text": format!("Labels: {labels}")
            }]
        }),
    ];

    let mut buttons = vec![json!({
        "type": "button",
        "text": {"type": "plain_text", "text": "View on GitHub", "emoji": true},
        "url": record.html_url
    })];
    if let Some(dashboard_url) = &record.dashboard_url {
        buttons.push(json!({
            "type": "button",
            "text": {"type": "plain_text", "text": "Open in Dashboard", "emoji": true},
            "url": dashboard_url
        }));
    }
    blocks.push(json!({"type": "actions", "elements": buttons}));

    json!({
        "text": format!("PR #{}: {}", record.number, record.title),
        "blocks": blocks
    })
}

/// Incoming-webhook chat sink.
pub struct ChatWebhook {
    client: Client,
    webhook_url: String,
}

impl ChatWebhook {
    pub fn new(webhook_url: &str) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(CHAT_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();

        Self {
            client,
            webhook_url: webhook_url.to_string(),
        }
    }
}

#[async_trait]
impl ChatSink for ChatWebhook {
    async fn deliver(&self, record: &NotificationRecord) -> Result<String> {
        let payload = build_message(record);

        let response = self
            .client
            .post(&self.webhook_url)
            .header("content-type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| AppError::ChatDelivery(format!("Chat POST failed: {e}")))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        // Incoming webhooks answer 200 with a literal `ok` body; some
        // providers return a message id instead.
        if status.is_success() || body == "ok" {
            let ts = if body.is_empty() || body == "ok" {
                chrono::Utc::now().timestamp_millis().to_string()
            } else {
                body
            };
            Ok(ts)
        } else {
            Err(AppError::ChatDelivery(format!(
                "Chat provider returned {status}: {body}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_record(score: u8, flags: Vec<&str>) -> NotificationRecord {
        NotificationRecord {
            pull_request_id: "abc".to_string(),
            repo_full_name: "acme/widgets".to_string(),
            number: 7,
            title: "Fix header parsing".to_string(),
            author: "alice".to_string(),
            tldr: "Parser fix.".to_string(),
            risk_score: score,
            main_risk_flags: flags.into_iter().map(String::from).collect(),
            system_labels: vec!["backend".to_string()],
            html_url: "https://github.com/acme/widgets/pull/7".to_string(),
            dashboard_url: None,
        }
    }

    fn rendered(message: &Value) -> String {
        message.to_string()
    }

    #[test]
    fn fallback_text_names_the_pr() {
        let message = build_message(&make_record(0, vec![]));
        assert_eq!(message["text"], "PR #7: Fix header parsing");
    }

    #[test]
    fn emoji_follows_risk_thresholds() {
        assert!(rendered(&build_message(&make_record(85, vec![]))).contains(":red_circle:"));
        assert!(rendered(&build_message(&make_record(70, vec![]))).contains(":red_circle:"));
        assert!(
            rendered(&build_message(&make_record(55, vec![]))).contains(":large_yellow_circle:")
        );
        assert!(
            rendered(&build_message(&make_record(39, vec![]))).contains(":large_green_circle:")
        );
    }

    #[test]
    fn flags_render_as_csv_or_none() {
        let message = build_message(&make_record(60, vec!["auth-change", "config-change"]));
        assert!(rendered(&message).contains("auth-change, config-change"));

        let message = build_message(&make_record(0, vec![]));
        assert!(rendered(&message).contains("*Risk Flags:* none"));
    }

    #[test]
    fn dashboard_button_is_optional() {
        let without = build_message(&make_record(0, vec![]));
        assert!(!rendered(&without).contains("Open in Dashboard"));

        let mut record = make_record(0, vec![]);
        record.dashboard_url = Some("https://app.example.com/prs/abc".to_string());
        let with = build_message(&record);
        assert!(rendered(&with).contains("Open in Dashboard"));
        assert!(rendered(&with).contains("https://app.example.com/prs/abc"));
    }

    #[test]
    fn header_block_titles_the_pr() {
        let message = build_message(&make_record(0, vec![]));
        assert_eq!(
            message["blocks"][0]["text"]["text"],
            "PR #7 · Fix header parsing"
        );
    }
}

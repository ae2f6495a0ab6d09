use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Queue fed by the webhook receiver; consumed by the summary worker.
pub const QUEUE_SUMMARY: &str = "pr-summary";
/// Queue fed by the summary worker; consumed by the notification worker.
pub const QUEUE_NOTIFY: &str = "pr-notify-chat";

/// Logical job name for a first-time summary.
pub const JOB_GENERATE: &str = "generate";
/// Logical job name that re-runs a summary even when one is already ready.
pub const JOB_REGENERATE: &str = "regenerate";
/// Logical job name for chat notifications.
pub const JOB_NOTIFICATION: &str = "pr-notification";

pub const DEFAULT_MAX_ATTEMPTS: i64 = 3;

const BACKOFF_BASE_SECS: u64 = 2;

/// A claimed job as handed to a worker.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub name: String,
    pub data: serde_json::Value,
    pub attempts: i64,
    pub max_attempts: i64,
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Payload of `pr-summary` jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryJobData {
    pub pull_request_id: String,
    pub installation_id: i64,
    pub repo_full_name: String,
    pub number: i64,
}

/// Payload of `pr-notify-chat` jobs. Fully materialised by the producer so
/// the notification worker needs no further lookups to build the message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub pull_request_id: String,
    pub repo_full_name: String,
    pub number: i64,
    pub title: String,
    pub author: String,
    pub tldr: String,
    pub risk_score: u8,
    pub main_risk_flags: Vec<String>,
    pub system_labels: Vec<String>,
    pub html_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dashboard_url: Option<String>,
}

/// Exponential retry delay: 2s, 4s, 8s, ... for attempt 1, 2, 3, ...
pub fn backoff_delay(attempts: i64) -> Duration {
    let exponent = attempts.max(1) as u32 - 1;
    Duration::from_secs(BACKOFF_BASE_SECS.saturating_mul(1u64 << exponent.min(16)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn backoff_tolerates_degenerate_attempt_counts() {
        assert_eq!(backoff_delay(0), Duration::from_secs(2));
        assert_eq!(backoff_delay(-5), Duration::from_secs(2));
    }

    #[test]
    fn notification_record_round_trips() {
        let record = NotificationRecord {
            pull_request_id: "abc".to_string(),
            repo_full_name: "acme/widgets".to_string(),
            number: 7,
            title: "Fix header parsing".to_string(),
            author: "alice".to_string(),
            tldr: "Parser fix.".to_string(),
            risk_score: 0,
            main_risk_flags: vec![],
            system_labels: vec!["backend".to_string()],
            html_url: "https://github.com/acme/widgets/pull/7".to_string(),
            dashboard_url: None,
        };
        let json = serde_json::to_value(&record).unwrap();
        let back: NotificationRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.number, 7);
        assert_eq!(back.tldr, "Parser fix.");
    }
}

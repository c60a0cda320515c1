use std::time::Duration;

use serde_json::json;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Distinguishes "nothing to do" from "tried and failed" so callers never
/// have to swallow a blanket error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Sent,
    NotConfigured,
}

#[derive(Debug)]
pub enum NotifyError {
    Http(reqwest::Error),
    Api { description: String },
}

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http(e) => write!(f, "telegram request failed: {e}"),
            Self::Api { description } => write!(f, "telegram api error: {description}"),
        }
    }
}

impl std::error::Error for NotifyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Http(e) => Some(e),
            Self::Api { .. } => None,
        }
    }
}

impl From<reqwest::Error> for NotifyError {
    fn from(value: reqwest::Error) -> Self {
        Self::Http(value)
    }
}

#[derive(Clone)]
pub struct Notifier {
    client: reqwest::Client,
    api_base: String,
}

impl Notifier {
    pub fn new() -> Self {
        Self::with_api_base(TELEGRAM_API_BASE.to_string())
    }

    pub fn with_api_base(api_base: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .expect("build reqwest client");
        Self { client, api_base }
    }

    pub async fn send_message(
        &self,
        bot_token: &str,
        chat_id: &str,
        text: &str,
    ) -> Result<NotifyOutcome, NotifyError> {
        if bot_token.is_empty() || chat_id.is_empty() {
            return Ok(NotifyOutcome::NotConfigured);
        }

        let url = format!("{}/bot{}/sendMessage", self.api_base, bot_token);
        let response = self
            .client
            .post(url)
            .json(&json!({
                "chat_id": chat_id,
                "text": text,
                "parse_mode": "HTML",
            }))
            .send()
            .await?;

        let body: serde_json::Value = response.json().await?;
        if body.get("ok").and_then(|v| v.as_bool()).unwrap_or(false) {
            Ok(NotifyOutcome::Sent)
        } else {
            Err(NotifyError::Api {
                description: body
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown telegram error")
                    .to_string(),
            })
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

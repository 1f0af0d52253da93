//! Outbound notifications: message rendering, the messaging API client, and inter-message
//! rate limiting.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use crate::scorer::MatchResult;

/// Failure to deliver one message. Logged by the caller, never fatal.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The HTTP client could not be built.
    #[error("failed to build messaging client: {0}")]
    Client(#[source] reqwest::Error),
    /// Connection failure or timeout.
    #[error("messaging request failed: {0}")]
    Transport(#[source] reqwest::Error),
    /// The API answered with a non-2xx status.
    #[error("messaging api returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnosis.
        body: String,
    },
    /// The API answered 2xx but did not acknowledge the message.
    #[error("messaging api rejected the message: {0}")]
    Rejected(String),
}

/// Something that delivers one formatted message.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Sends `text`, resolving once the remote side acknowledged it.
    async fn send(&self, text: &str) -> Result<(), DeliveryError>;
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
}

#[derive(Deserialize)]
struct ApiReply {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Bot API notifier posting HTML messages to one chat.
#[derive(Clone)]
pub struct TelegramNotifier {
    client: Client,
    endpoint: String,
    chat_id: String,
}

impl TelegramNotifier {
    /// Builds a client for `{api_base}/bot{token}/sendMessage`.
    pub fn new(
        api_base: &str,
        token: &str,
        chat_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(DeliveryError::Client)?;
        let endpoint = format!(
            "{}/bot{}/sendMessage",
            api_base.trim_end_matches('/'),
            token.trim()
        );
        Ok(Self {
            client,
            endpoint,
            chat_id: chat_id.into(),
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, text: &str) -> Result<(), DeliveryError> {
        let request = SendMessage {
            chat_id: &self.chat_id,
            text,
            parse_mode: "HTML",
            disable_web_page_preview: true,
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(DeliveryError::Transport)?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .unwrap_or_else(|_| "<body unavailable>".to_string());
        if !status.is_success() {
            return Err(DeliveryError::Status {
                status: status.as_u16(),
                body,
            });
        }
        match serde_json::from_str::<ApiReply>(&body) {
            Ok(reply) if reply.ok => Ok(()),
            Ok(reply) => Err(DeliveryError::Rejected(
                reply.description.unwrap_or_else(|| "ok=false".to_string()),
            )),
            Err(_) => Err(DeliveryError::Rejected(body)),
        }
    }
}

/// Notifier used when no messaging credentials are configured: messages only reach the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, text: &str) -> Result<(), DeliveryError> {
        info!(message = text, "notification (no messaging credentials)");
        Ok(())
    }
}

/// Renders the HTML message for one match.
pub fn render_message(result: &MatchResult) -> String {
    let posting = &result.posting;
    let title = if posting.title.is_empty() {
        "Offre"
    } else {
        posting.title.as_str()
    };
    let mut out = format!("<b>{}</b>\n", escape(title));
    let lines = [
        ("🏢", posting.organization.as_deref()),
        ("📍", posting.location.as_deref()),
        ("⭐", posting.experience.as_deref()),
        ("🕒", posting.posted.as_deref()),
        ("📝", posting.detail.as_deref()),
    ];
    for (icon, value) in lines {
        if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
            out.push_str(&format!("{icon} {}\n", escape(value)));
        }
    }
    if !result.hit_terms.is_empty() {
        out.push_str(&format!("🔎 {}\n", escape(&result.hit_terms.join(", "))));
    }
    out.push_str(&format!("🔗 {}\n", escape(&posting.id)));
    out
}

fn escape(text: &str) -> String {
    html_escape::encode_text(text).into_owned()
}

/// Sends messages through a [`Notifier`] with a minimum gap between two sends.
pub struct Dispatcher {
    notifier: Arc<dyn Notifier>,
    min_interval: Duration,
    last_sent: Option<Instant>,
}

impl Dispatcher {
    /// Wraps `notifier`, spacing sends at least `min_interval` apart.
    pub fn new(notifier: Arc<dyn Notifier>, min_interval: Duration) -> Self {
        Self {
            notifier,
            min_interval,
            last_sent: None,
        }
    }

    /// Delivers `text` once the rate limit allows it.
    pub async fn dispatch(&mut self, text: &str) -> Result<(), DeliveryError> {
        if let Some(last) = self.last_sent {
            let ready_at = last + self.min_interval;
            if ready_at > Instant::now() {
                debug!(wait_ms = (ready_at - Instant::now()).as_millis() as u64, "rate limiting message");
                sleep_until(ready_at).await;
            }
        }
        let result = self.notifier.send(text).await;
        self.last_sent = Some(Instant::now());
        result
    }
}

use crate::config::{Channel, ChannelEndpoint};
use crate::error::AlertError;
use crate::model::{truncate_text, MAX_DETAIL_LEN};
use crate::BoxFuture;
use log::{debug, info, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Successful delivery receipt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ack {
    /// Backend-issued id usable as a thread id; webhooks issue none
    pub message_id: Option<String>,
}

/// Trait for message delivery backends
pub trait MessagingBackend: Send + Sync {
    /// Post `text` to a channel, optionally as a reply within a thread
    fn post_message<'a>(
        &'a self,
        channel: &'a Channel,
        text: &'a str,
        thread_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Ack, AlertError>>;
}

#[derive(Debug, Serialize)]
struct PostMessageRequest<'a> {
    channel: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    thread_ts: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    ok: bool,
    ts: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct WebhookRequest<'a> {
    text: &'a str,
}

/// Slack delivery through `chat.postMessage` or incoming webhooks
#[derive(Debug, Clone)]
pub struct SlackBackend {
    client: Client,
    api_base: String,
    bot_token: Option<String>,
}

impl SlackBackend {
    pub fn new(api_base: impl Into<String>, bot_token: Option<String>, timeout: Duration) -> Result<Self, AlertError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AlertError::Delivery(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(client, api_base, bot_token))
    }

    pub fn with_client(client: Client, api_base: impl Into<String>, bot_token: Option<String>) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            bot_token,
        }
    }

    /// Read the bot token from an environment variable
    ///
    /// A missing token only matters for API channels; webhook channels keep
    /// working without it.
    pub fn from_env(api_base: impl Into<String>, bot_token_env: &str, timeout: Duration) -> Result<Self, AlertError> {
        let bot_token = std::env::var(bot_token_env).ok().filter(|t| !t.is_empty());
        if bot_token.is_none() {
            warn!(
                "{} is not set; API channels cannot be delivered to",
                bot_token_env
            );
        }
        Self::new(api_base, bot_token, timeout)
    }

    async fn post_api(
        &self,
        channel_id: &str,
        text: &str,
        thread_id: Option<&str>,
    ) -> Result<Ack, AlertError> {
        let token = self
            .bot_token
            .as_deref()
            .ok_or_else(|| AlertError::Delivery("bot token not configured".to_string()))?;

        let response = self
            .client
            .post(format!("{}/chat.postMessage", self.api_base))
            .bearer_auth(token)
            .json(&PostMessageRequest {
                channel: channel_id,
                text,
                thread_ts: thread_id,
            })
            .send()
            .await
            .map_err(|e| AlertError::Delivery(bounded(e.to_string())))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AlertError::Delivery(format!("HTTP {}", status.as_u16())));
        }

        let body: PostMessageResponse = response
            .json()
            .await
            .map_err(|e| AlertError::Delivery(bounded(format!("unreadable response: {}", e))))?;

        if !body.ok {
            return Err(AlertError::Delivery(format!(
                "API error: {}",
                body.error.as_deref().unwrap_or("unknown")
            )));
        }

        Ok(Ack {
            message_id: body.ts,
        })
    }

    async fn post_webhook(&self, url: &str, text: &str) -> Result<Ack, AlertError> {
        let response = self
            .client
            .post(url)
            .json(&WebhookRequest { text })
            .send()
            .await
            .map_err(|e| AlertError::Delivery(bounded(e.to_string())))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AlertError::Delivery(format!("HTTP {}", status.as_u16())));
        }
        Ok(Ack { message_id: None })
    }
}

impl MessagingBackend for SlackBackend {
    fn post_message<'a>(
        &'a self,
        channel: &'a Channel,
        text: &'a str,
        thread_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Ack, AlertError>> {
        Box::pin(async move {
            debug!("Posting to channel {}", channel.name);
            match &channel.endpoint {
                ChannelEndpoint::Api { channel_id } => self.post_api(channel_id, text, thread_id).await,
                ChannelEndpoint::Webhook { url } => {
                    if thread_id.is_some() {
                        debug!("Webhook channel {} ignores thread id", channel.name);
                    }
                    self.post_webhook(url, text).await
                }
            }
        })
    }
}

/// Dry-run backend that logs messages instead of delivering them
#[derive(Debug, Default)]
pub struct LogBackend {
    sequence: AtomicU64,
}

impl LogBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessagingBackend for LogBackend {
    fn post_message<'a>(
        &'a self,
        channel: &'a Channel,
        text: &'a str,
        thread_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Ack, AlertError>> {
        Box::pin(async move {
            let id = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
            match thread_id {
                Some(thread) => info!("[{} thread {}] {}", channel.name, thread, text),
                None => info!("[{}] {}", channel.name, text),
            }
            Ok(Ack {
                message_id: Some(format!("log-{}", id)),
            })
        })
    }
}

fn bounded(message: String) -> String {
    truncate_text(&message, MAX_DETAIL_LEN)
}

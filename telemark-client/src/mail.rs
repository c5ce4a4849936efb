//! Mail relay client
//!
//! Sends HTML email through an HTTP relay (`POST {base_url}/send`).

use async_trait::async_trait;
use serde::Serialize;
use telemark_core::domain::step::EmailMessage;
use tracing::info;

use crate::Notifier;
use crate::error::{ClientError, Result};

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    from: Option<&'a str>,
    to: &'a [String],
    subject: &'a str,
    html: &'a str,
}

#[derive(Debug, Clone)]
pub struct MailRelayClient {
    base_url: String,
    token: Option<String>,
    from: Option<String>,
    client: reqwest::Client,
}

impl MailRelayClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
            from: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Sender address; the relay's default is used when unset
    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Notifier for MailRelayClient {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        if message.to.is_empty() {
            return Err(ClientError::InvalidRequest(
                "email has no recipients".to_string(),
            ));
        }

        let url = format!("{}/send", self.base_url);
        let mut request = self.client.post(&url).json(&SendRequest {
            from: self.from.as_deref(),
            to: &message.to,
            subject: &message.subject,
            html: &message.html_body,
        });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        info!("Sent '{}' to {}", message.subject, message.to.join(", "));
        Ok(())
    }
}

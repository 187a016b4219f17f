use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

/// A templated email. Rendering happens on the mail service's side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailRequest {
    pub to: String,
    pub template: String,
    pub params: BTreeMap<String, String>,
}

/// Outbound email collaborator. One attempt per call; callers record the outcome.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &EmailRequest) -> Result<()>;
}

/// Posts each email as JSON to a mail-service webhook.
pub struct WebhookMailer {
    client: reqwest::Client,
    url: String,
}

impl WebhookMailer {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building mail client")?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl Mailer for WebhookMailer {
    async fn send(&self, email: &EmailRequest) -> Result<()> {
        self.client
            .post(&self.url)
            .json(email)
            .send()
            .await
            .with_context(|| format!("mail webhook {} unreachable", self.url))?
            .error_for_status()
            .context("mail webhook rejected email")?;
        Ok(())
    }
}

/// Used when no mail service is configured: logs instead of sending.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &EmailRequest) -> Result<()> {
        info!("Email ({}) to {}: {:?}", email.template, email.to, email.params);
        Ok(())
    }
}

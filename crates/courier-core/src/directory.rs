use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use uuid::Uuid;

/// Lookups owned by the account and job services.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Where to send escalation emails. `None` means the user has no address.
    async fn email_address(&self, user_id: Uuid) -> Result<Option<String>>;

    /// Display title for a job id, used only to enrich emails.
    async fn job_title(&self, job_id: &str) -> Result<Option<String>>;
}

/// Directory backed by `GET {base}/users/{id}` and `GET {base}/jobs/{id}`.
pub struct HttpDirectory {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct UserRecord {
    email: Option<String>,
}

#[derive(Deserialize)]
struct JobRecord {
    title: Option<String>,
}

impl HttpDirectory {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("building directory client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn fetch<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<Option<T>> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("directory {} unreachable", url))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let record = response
            .error_for_status()
            .with_context(|| format!("directory lookup {} failed", url))?
            .json::<T>()
            .await
            .context("malformed directory response")?;
        Ok(Some(record))
    }
}

#[async_trait]
impl Directory for HttpDirectory {
    async fn email_address(&self, user_id: Uuid) -> Result<Option<String>> {
        let record: Option<UserRecord> = self.fetch(&format!("/users/{}", user_id)).await?;
        Ok(record.and_then(|r| r.email))
    }

    async fn job_title(&self, job_id: &str) -> Result<Option<String>> {
        let record: Option<JobRecord> = self.fetch(&format!("/jobs/{}", job_id)).await?;
        Ok(record.and_then(|r| r.title))
    }
}

/// In-process directory. Empty by default, which makes every escalation
/// fail softly when no directory service is configured.
#[derive(Default)]
pub struct StaticDirectory {
    emails: HashMap<Uuid, String>,
    jobs: HashMap<String, String>,
}

impl StaticDirectory {
    pub fn with_email(mut self, user_id: Uuid, email: impl Into<String>) -> Self {
        self.emails.insert(user_id, email.into());
        self
    }

    pub fn with_job(mut self, job_id: impl Into<String>, title: impl Into<String>) -> Self {
        self.jobs.insert(job_id.into(), title.into());
        self
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn email_address(&self, user_id: Uuid) -> Result<Option<String>> {
        Ok(self.emails.get(&user_id).cloned())
    }

    async fn job_title(&self, job_id: &str) -> Result<Option<String>> {
        Ok(self.jobs.get(job_id).cloned())
    }
}

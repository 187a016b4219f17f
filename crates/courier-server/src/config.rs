use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};

use courier_core::CourierConfig;

/// Values that ship in sample env files and must never reach production.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub addr: SocketAddr,
    pub mailer_url: Option<String>,
    pub directory_url: Option<String>,
    pub sweep_interval: Duration,
    pub courier: CourierConfig,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let jwt_secret = var("COURIER_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("COURIER_JWT_SECRET is unset or still a placeholder; it must match the account service's secret");
        }

        let host = var("COURIER_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = var("COURIER_PORT")
            .unwrap_or_else(|| "3000".into())
            .parse()
            .context("COURIER_PORT must be a port number")?;
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .context("COURIER_HOST is not a valid address")?;

        let defaults = CourierConfig::default();
        let send_timeout = match var("COURIER_SEND_TIMEOUT_MS") {
            Some(v) => Duration::from_millis(v.parse().context("COURIER_SEND_TIMEOUT_MS must be milliseconds")?),
            None => defaults.send_timeout,
        };
        let announcement_ttl = match var("COURIER_ANNOUNCEMENT_TTL_HOURS") {
            Some(v) => chrono::Duration::hours(v.parse().context("COURIER_ANNOUNCEMENT_TTL_HOURS must be hours")?),
            None => defaults.announcement_ttl,
        };
        let sweep_secs: u64 = var("COURIER_SWEEP_INTERVAL_SECS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(3600); // hourly

        Ok(Self {
            jwt_secret,
            db_path: var("COURIER_DB_PATH").unwrap_or_else(|| "courier.db".into()).into(),
            addr,
            mailer_url: var("COURIER_MAILER_URL").filter(|v| !v.is_empty()),
            directory_url: var("COURIER_DIRECTORY_URL").filter(|v| !v.is_empty()),
            sweep_interval: Duration::from_secs(sweep_secs.max(1)),
            courier: CourierConfig {
                send_timeout,
                announcement_ttl,
            },
        })
    }
}

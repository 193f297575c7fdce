use std::{path::PathBuf, str::FromStr, time::Duration};

use anyhow::Context;
use serde::Deserialize;

use crate::notify::outbox::OutboxConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    pub host: String,
    pub port: u16,
    /// Implicit TLS when true, opportunistic STARTTLS otherwise.
    pub secure: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub enum StorageConfig {
    Local {
        dir: PathBuf,
    },
    S3 {
        endpoint: String,
        bucket: String,
        access_key: String,
        secret_key: String,
        public_url: String,
    },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// Base used for links in emails and paste views.
    pub public_url: String,
    pub data_dir: PathBuf,
    pub jwt: JwtConfig,
    /// `None` means notifications are logged instead of sent.
    pub mail: Option<MailConfig>,
    pub outbox: OutboxConfig,
    pub storage: StorageConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let host = var("APP_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port = match var("PORT").or_else(|| var("APP_PORT")) {
            Some(v) => v
                .trim()
                .parse::<u16>()
                .with_context(|| format!("invalid PORT: {v:?}"))?,
            None => 3000,
        };
        let public_url = var("PUBLIC_URL")
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("http://localhost:{port}"));
        let data_dir = var("DATA_DIR").unwrap_or_else(|| "data".into()).into();

        let jwt = JwtConfig {
            secret: var("JWT_SECRET").context("JWT_SECRET must be set")?,
            issuer: var("JWT_ISSUER").unwrap_or_else(|| "pastebin".into()),
            audience: var("JWT_AUDIENCE").unwrap_or_else(|| "pastebin-users".into()),
        };

        let mail = match var("EMAIL_HOST") {
            Some(host) => {
                let username = var("EMAIL_USER");
                let from = var("EMAIL_FROM")
                    .or_else(|| username.clone())
                    .context("EMAIL_FROM or EMAIL_USER must be set when EMAIL_HOST is")?;
                Some(MailConfig {
                    host,
                    port: parse_or(&var, "EMAIL_PORT", 587)?,
                    secure: var("EMAIL_SECURE").map(|v| v == "true").unwrap_or(false),
                    username,
                    password: var("EMAIL_PASS"),
                    from,
                    timeout_secs: parse_or(&var, "EMAIL_TIMEOUT_SECS", 10)?,
                })
            }
            None => None,
        };

        let defaults = OutboxConfig::default();
        let outbox = OutboxConfig {
            poll_interval: Duration::from_secs(parse_or(
                &var,
                "OUTBOX_POLL_SECS",
                defaults.poll_interval.as_secs(),
            )?),
            max_attempts: parse_or(&var, "OUTBOX_MAX_ATTEMPTS", defaults.max_attempts)?,
            backoff_base: Duration::from_secs(parse_or(
                &var,
                "OUTBOX_BACKOFF_BASE_SECS",
                defaults.backoff_base.as_secs(),
            )?),
            backoff_max: Duration::from_secs(parse_or(
                &var,
                "OUTBOX_BACKOFF_MAX_SECS",
                defaults.backoff_max.as_secs(),
            )?),
            send_timeout: Duration::from_secs(
                mail.as_ref()
                    .map(|m| m.timeout_secs)
                    .unwrap_or(defaults.send_timeout.as_secs()),
            ),
        }
        .normalize();

        let storage = match var("MINIO_ENDPOINT") {
            Some(endpoint) => StorageConfig::S3 {
                public_url: var("MINIO_PUBLIC_URL")
                    .map(|u| u.trim_end_matches('/').to_string())
                    .unwrap_or_else(|| endpoint.trim_end_matches('/').to_string()),
                endpoint,
                bucket: var("MINIO_BUCKET").context("MINIO_BUCKET must be set")?,
                access_key: var("MINIO_ACCESS_KEY").context("MINIO_ACCESS_KEY must be set")?,
                secret_key: var("MINIO_SECRET_KEY").context("MINIO_SECRET_KEY must be set")?,
            },
            None => StorageConfig::Local {
                dir: var("UPLOAD_DIR").unwrap_or_else(|| "uploads".into()).into(),
            },
        };

        Ok(Self {
            host,
            port,
            public_url,
            data_dir,
            jwt,
            mail,
            outbox,
            storage,
        })
    }
}

fn parse_or<T, V>(var: &V, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    V: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(v) => v
            .trim()
            .parse::<T>()
            .with_context(|| format!("invalid {key}: {v:?}")),
        None => Ok(default),
    }
}

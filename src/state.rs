use std::sync::Arc;

use anyhow::Context;

use crate::auth::{repo::UserRepo, tokens::TokenIssuer, CredentialStore};
use crate::config::{AppConfig, StorageConfig};
use crate::notify::outbox::Outbox;
use crate::pastes::repo::PasteStore;
use crate::storage::{BlobStore, LocalStorage, S3Storage};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub credentials: CredentialStore,
    pub pastes: Arc<PasteStore>,
    pub outbox: Arc<Outbox>,
    pub storage: Arc<dyn BlobStore>,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = AppConfig::from_env()?;
        Self::with_config(config).await
    }

    /// Loads every journal before returning; any load failure aborts startup.
    pub async fn with_config(config: AppConfig) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let data = &config.data_dir;

        let pastes = Arc::new(
            PasteStore::open(data.join("pastes.jsonl"))
                .await
                .context("load pastes")?,
        );
        let users = Arc::new(
            UserRepo::open(data.join("users.jsonl"))
                .await
                .context("load users")?,
        );
        let outbox = Arc::new(
            Outbox::open(data.join("outbox.jsonl"), config.outbox)
                .await
                .context("load email outbox")?,
        );

        let storage = match &config.storage {
            StorageConfig::Local { dir } => {
                Arc::new(LocalStorage::new(dir.clone()).await?) as Arc<dyn BlobStore>
            }
            StorageConfig::S3 {
                endpoint,
                bucket,
                access_key,
                secret_key,
                public_url,
            } => Arc::new(
                S3Storage::new(endpoint, bucket, access_key, secret_key, public_url).await?,
            ) as Arc<dyn BlobStore>,
        };

        let credentials = CredentialStore::new(
            users,
            TokenIssuer::new(&config.jwt),
            outbox.clone(),
            &config.public_url,
        );

        Ok(Self {
            config,
            credentials,
            pastes,
            outbox,
            storage,
        })
    }

    /// Fully wired state rooted at `dir`, with local uploads and no mail relay.
    #[cfg(test)]
    pub async fn fake(dir: &std::path::Path) -> Self {
        let config = AppConfig::from_lookup(|key| match key {
            "JWT_SECRET" => Some("test".into()),
            "PUBLIC_URL" => Some("http://localhost:3000".into()),
            "DATA_DIR" => Some(dir.join("data").display().to_string()),
            "UPLOAD_DIR" => Some(dir.join("uploads").display().to_string()),
            _ => None,
        })
        .expect("test config");
        Self::with_config(config).await.expect("test state")
    }
}

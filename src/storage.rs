use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context};
use aws_config::{defaults, BehaviorVersion};
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    config::{Builder as S3ConfigBuilder, Region},
    Client,
};
use aws_smithy_types::byte_stream::ByteStream;
use axum::async_trait;
use bytes::Bytes;
use tokio::{fs, io::AsyncWriteExt};
use tracing::{info, warn};

/// Where uploaded binaries (profile pictures) live.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put_object(&self, key: &str, body: Bytes, content_type: &str) -> anyhow::Result<()>;
    async fn delete_object(&self, key: &str) -> anyhow::Result<()>;
    /// URL clients use to fetch `key`.
    fn object_url(&self, key: &str) -> String;
}

/// S3 or MinIO, path-style addressing.
#[derive(Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
    public_url: String,
}

impl S3Storage {
    pub async fn new(
        endpoint: &str,
        bucket: &str,
        access_key: &str,
        secret_key: &str,
        public_url: &str,
    ) -> anyhow::Result<Self> {
        let shared = defaults(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .credentials_provider(Credentials::new(
                access_key, secret_key, None, None, "static",
            ))
            .endpoint_url(endpoint)
            .load()
            .await;

        let conf = S3ConfigBuilder::from(&shared)
            .endpoint_url(endpoint)
            .force_path_style(true)
            .build();

        info!(%endpoint, %bucket, "s3 blob store");
        Ok(Self {
            client: Client::from_conf(conf),
            bucket: bucket.to_string(),
            public_url: public_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl BlobStore for S3Storage {
    async fn put_object(&self, key: &str, body: Bytes, content_type: &str) -> anyhow::Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .context("s3 put_object")?;
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> anyhow::Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .context("s3 delete_object")?;
        Ok(())
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.public_url, self.bucket, key)
    }
}

/// Files under a local directory, served back by the router at `/uploads`.
pub struct LocalStorage {
    dir: PathBuf,
}

impl LocalStorage {
    pub async fn new(dir: PathBuf) -> anyhow::Result<Self> {
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create upload dir {}", dir.display()))?;
        info!("upload directory: {}", dir.display());
        Ok(Self { dir })
    }

    fn file_path(&self, key: &str) -> anyhow::Result<PathBuf> {
        let rel = Path::new(key);
        if key.is_empty() || !rel.components().all(|c| matches!(c, Component::Normal(_))) {
            bail!("invalid object key {key:?}");
        }
        Ok(self.dir.join(rel))
    }
}

#[async_trait]
impl BlobStore for LocalStorage {
    async fn put_object(&self, key: &str, body: Bytes, _content_type: &str) -> anyhow::Result<()> {
        let path = self.file_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let mut file = fs::File::create(&path)
            .await
            .with_context(|| format!("create {}", path.display()))?;
        file.write_all(&body).await?;
        file.flush().await?;
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> anyhow::Result<()> {
        let path = self.file_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(%key, "object already gone");
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!("/uploads/{key}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_put_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("uploads");
        let store = LocalStorage::new(root.clone()).await.unwrap();

        store
            .put_object("profile_pictures/a.png", Bytes::from_static(b"png"), "image/png")
            .await
            .unwrap();
        let path = root.join("profile_pictures/a.png");
        assert_eq!(std::fs::read(&path).unwrap(), b"png");
        assert_eq!(
            store.object_url("profile_pictures/a.png"),
            "/uploads/profile_pictures/a.png"
        );

        store.delete_object("profile_pictures/a.png").await.unwrap();
        assert!(!path.exists());
        // Deleting twice is fine.
        store.delete_object("profile_pictures/a.png").await.unwrap();
    }

    #[tokio::test]
    async fn local_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStorage::new(dir.path().to_path_buf()).await.unwrap();
        for key in ["../evil", "/etc/passwd", "a/../../b", ""] {
            assert!(
                store.put_object(key, Bytes::new(), "image/png").await.is_err(),
                "{key}"
            );
        }
    }
}

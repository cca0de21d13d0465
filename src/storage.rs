//! Object storage port for uploaded story media.
use crate::config::{StorageBackend, StorageConfig};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `bucket/name` and return a durable public reference.
    async fn upload(
        &self,
        bucket: &str,
        name: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String>;
}

fn public_url(base: &str, bucket: &str, name: &str) -> String {
    format!("{}/{}/{}", base.trim_end_matches('/'), bucket, name)
}

/// Writes objects below a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
    public_base_url: String,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a reference produced by this store back to its file.
    pub fn path_for(&self, reference: &str) -> Option<PathBuf> {
        let base = self.public_base_url.trim_end_matches('/');
        let rest = reference.strip_prefix(base)?.strip_prefix('/')?;
        if rest.split('/').any(|seg| seg == ".." || seg.is_empty()) {
            return None;
        }
        Some(self.root.join(rest))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn upload(
        &self,
        bucket: &str,
        name: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String> {
        let path = self.root.join(bucket).join(name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create media dir: {}", parent.display()))?;
        }
        tokio::fs::write(&path, &bytes)
            .await
            .with_context(|| format!("failed to write media file: {}", path.display()))?;
        debug!(path = %path.display(), content_type, size = bytes.len(), "media stored");
        Ok(public_url(&self.public_base_url, bucket, name))
    }
}

/// Uploads objects to an HTTP object endpoint (`PUT {endpoint}/{bucket}/{name}`).
#[derive(Clone)]
pub struct HttpObjectStore {
    http: Client,
    endpoint: Url,
    token: Option<String>,
    public_base_url: String,
}

impl fmt::Debug for HttpObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpObjectStore")
            .field("endpoint", &self.endpoint)
            .field("public_base_url", &self.public_base_url)
            .finish()
    }
}

impl HttpObjectStore {
    pub fn new(
        endpoint: &str,
        token: Option<String>,
        public_base_url: impl Into<String>,
    ) -> Result<Self> {
        let mut endpoint = Url::parse(endpoint).context("invalid storage endpoint")?;
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }
        let http = Client::builder()
            .user_agent("storyline/0.1")
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            endpoint,
            token,
            public_base_url: public_base_url.into(),
        })
    }

    pub fn build_request(
        &self,
        bucket: &str,
        name: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<reqwest::Request> {
        let url = self
            .endpoint
            .join(&format!("{}/{}", bucket, name))
            .context("invalid object name")?;
        let mut req = self
            .http
            .put(url)
            .header("Content-Type", content_type)
            .body(bytes);
        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }
        req.build().context("failed to build upload request")
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn upload(
        &self,
        bucket: &str,
        name: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String> {
        let request = self.build_request(bucket, name, bytes, content_type)?;
        debug!(url = %request.url(), content_type, "uploading media");
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach object store")?;

        if res.status() == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("received 429 from object store: {}", body));
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("upload failed {}: {}", status, body));
        }
        Ok(public_url(&self.public_base_url, bucket, name))
    }
}

/// Build the configured object store. Local media lives under `{data_dir}/media`.
pub fn from_config(cfg: &StorageConfig, data_dir: &str) -> Result<Arc<dyn ObjectStore>> {
    match cfg.backend {
        StorageBackend::Local => Ok(Arc::new(LocalObjectStore::new(
            Path::new(data_dir).join("media"),
            cfg.public_base_url.clone(),
        ))),
        StorageBackend::Http => {
            let endpoint = cfg
                .endpoint
                .as_deref()
                .ok_or_else(|| anyhow!("storage.endpoint is required for the http backend"))?;
            Ok(Arc::new(HttpObjectStore::new(
                endpoint,
                cfg.token.clone(),
                cfg.public_base_url.clone(),
            )?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn local_store_writes_and_maps_back() {
        let td = tempdir().unwrap();
        let store = LocalObjectStore::new(td.path(), "file:///media/");
        let url = store
            .upload("stories", "7/abc.png", vec![1, 2, 3], "image/png")
            .await
            .unwrap();
        assert_eq!(url, "file:///media/stories/7/abc.png");

        let path = store.path_for(&url).unwrap();
        assert_eq!(std::fs::read(path).unwrap(), vec![1, 2, 3]);
        assert!(store.path_for("https://elsewhere/stories/x.png").is_none());
        assert!(store.path_for("file:///media/../etc/passwd").is_none());
    }

    #[test]
    fn http_request_shape() {
        let store = HttpObjectStore::new(
            "https://objects.example.com/v1",
            Some("secret".into()),
            "https://cdn.example.com",
        )
        .unwrap();
        let req = store
            .build_request("stories", "1/a.mp4", vec![0; 4], "video/mp4")
            .unwrap();
        assert_eq!(req.method(), reqwest::Method::PUT);
        assert_eq!(req.url().as_str(), "https://objects.example.com/v1/stories/1/a.mp4");
        assert_eq!(req.headers()["Authorization"], "Bearer secret");
        assert_eq!(req.headers()["Content-Type"], "video/mp4");
    }
}

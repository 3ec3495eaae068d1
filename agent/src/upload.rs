//! Upload of marked segments to the coordinator's object store.
//!
//! Each capture produces two objects under `{folder}/`: the segment itself
//! and a `<stem>.json` metadata sibling.  Uploads are never retried here;
//! a failure goes back to the agent, which restarts its buffer.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use tracing::{debug, info};

use syncam_common::naming;
use syncam_common::protocol::SegmentMetadata;

/// User-Agent sent with every upload.
const USER_AGENT: &str = "syncam-agent/0.1";

pub trait Uploader: Send + Sync + 'static {
    /// Store `data` as `{folder}/{filename}` plus its metadata sibling.
    fn upload(
        &self,
        folder: &str,
        filename: &str,
        data: Bytes,
        content_type: &str,
        metadata: &SegmentMetadata,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// PUTs objects to `{base}/api/objects/{folder}/{name}`.
pub struct HttpUploader {
    client: reqwest::Client,
    base_url: String,
}

impl HttpUploader {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(120))
            .build()
            .context("Cannot build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn object_url(&self, folder: &str, name: &str) -> String {
        format!("{}/api/objects/{folder}/{name}", self.base_url)
    }

    async fn put(&self, folder: &str, name: &str, body: Bytes, content_type: &str) -> Result<()> {
        let url = self.object_url(folder, name);
        let len = body.len();
        let response = self
            .client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .with_context(|| format!("PUT {url} failed"))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("PUT {url} returned {status}");
        }
        debug!("PUT {url} ({len} bytes) → {status}");
        Ok(())
    }
}

impl Uploader for HttpUploader {
    async fn upload(
        &self,
        folder: &str,
        filename: &str,
        data: Bytes,
        content_type: &str,
        metadata: &SegmentMetadata,
    ) -> Result<()> {
        if !naming::is_safe_component(folder) || !naming::is_safe_component(filename) {
            anyhow::bail!("Refusing to upload to unsafe key {folder}/{filename}");
        }
        let json = serde_json::to_vec_pretty(metadata).context("Cannot encode segment metadata")?;

        self.put(folder, filename, data, content_type).await?;
        self.put(
            folder,
            &naming::metadata_filename(filename),
            Bytes::from(json),
            "application/json",
        )
        .await?;

        info!("Uploaded {folder}/{filename} ({} bytes)", metadata.byte_size);
        Ok(())
    }
}

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use log::info;
use reqwest::Client;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

use crate::config::Config;
use crate::error::DownloadError;
use crate::file_utils;

/// Fallback invoked when the P2P path gives up: pull the file straight from
/// the origin. Its result becomes the job's result.
#[async_trait]
pub trait SourceDownloader: Send + Sync {
    async fn run(&self) -> Result<()>;
}

pub struct HttpSourceDownloader {
    http_client: Client,
    cfg: Arc<Config>,
}

impl HttpSourceDownloader {
    pub fn new(http_client: Client, cfg: Arc<Config>) -> Self {
        Self { http_client, cfg }
    }
}

#[async_trait]
impl SourceDownloader for HttpSourceDownloader {
    async fn run(&self) -> Result<()> {
        info!("downloading directly from source {}", self.cfg.url);

        let mut req = self.http_client.get(&self.cfg.url);
        for header in &self.cfg.headers {
            if let Some((name, value)) = header.split_once(':') {
                req = req.header(name.trim(), value.trim());
            }
        }

        let mut resp = req.send().await.map_err(|e| DownloadError::source(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DownloadError::SourceStatus(status.as_u16()).into());
        }

        let temp = self.cfg.temp_target();
        if let Some(parent) = temp.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = File::create(&temp).await?;
        while let Some(chunk) = resp.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.sync_all().await?;
        drop(file);

        file_utils::move_file(&temp, &self.cfg.target_file).await?;
        if let Some(md5) = &self.cfg.md5 {
            file_utils::verify_md5(&self.cfg.target_file, md5).await?;
        }
        info!("source download finished at {:?}", self.cfg.target_file);
        Ok(())
    }
}

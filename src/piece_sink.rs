use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::mpsc;

use crate::types::{SinkMessage, parse_range};

/// What the sink reports after draining its queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct SinkReport {
    /// True when the client file could not be hardlinked into place and the
    /// payloads were mirrored to the temp target instead.
    pub across_write: bool,
}

/// Consumer of the sink queue: receives piece payloads in arrival order plus
/// the RESET and LAST control tokens, and assembles the output file(s).
#[async_trait]
pub trait PieceSink: Send + Sync {
    async fn run(self: Box<Self>, rx: mpsc::Receiver<SinkMessage>) -> Result<SinkReport>;
}

/// Writes pieces at their range offsets into the service file, with the
/// client file hardlinked to it. When the link cannot be created (data dir on
/// another filesystem than expected) every payload is mirrored to the temp
/// target so finish can still move a complete file into place.
pub struct FileSink {
    client_file_path: PathBuf,
    service_file_path: PathBuf,
    temp_target: PathBuf,
}

impl FileSink {
    pub fn new(client_file_path: PathBuf, service_file_path: PathBuf, temp_target: PathBuf) -> Self {
        Self {
            client_file_path,
            service_file_path,
            temp_target,
        }
    }

    async fn open_service(&self) -> Result<File> {
        if let Some(parent) = self.service_file_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        // Leftovers of an aborted run would corrupt offsets; start clean.
        remove_if_exists(&self.client_file_path).await?;
        remove_if_exists(&self.service_file_path).await?;
        let file = File::create(&self.service_file_path).await?;
        Ok(file)
    }

    async fn open_temp_target(&self) -> Result<File> {
        if let Some(parent) = self.temp_target.parent() {
            fs::create_dir_all(parent).await?;
        }
        remove_if_exists(&self.temp_target).await?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.temp_target)
            .await?;
        Ok(file)
    }
}

#[async_trait]
impl PieceSink for FileSink {
    async fn run(self: Box<Self>, mut rx: mpsc::Receiver<SinkMessage>) -> Result<SinkReport> {
        let mut service = self.open_service().await?;

        let across_write = fs::hard_link(&self.service_file_path, &self.client_file_path)
            .await
            .is_err();
        let mut temp = if across_write {
            warn!(
                "cannot link {:?} to {:?}, mirroring to temp target",
                self.service_file_path, self.client_file_path
            );
            Some(self.open_temp_target().await?)
        } else {
            None
        };

        let mut written: u64 = 0;
        loop {
            // A closed queue means the producer went away; flush what we have.
            let Some(msg) = rx.recv().await else { break };
            match msg {
                SinkMessage::Piece(payload) => {
                    let (offset, _) = parse_range(&payload.range)?;
                    write_at(&mut service, offset, &payload.content).await?;
                    if let Some(temp) = temp.as_mut() {
                        write_at(temp, offset, &payload.content).await?;
                    }
                    written += payload.content.len() as u64;
                    debug!("wrote piece {} ({} bytes total)", payload.range, written);
                }
                SinkMessage::Reset => {
                    info!("piece size changed, truncating partial output");
                    service.set_len(0).await?;
                    service.seek(SeekFrom::Start(0)).await?;
                    if let Some(temp) = temp.as_mut() {
                        temp.set_len(0).await?;
                        temp.seek(SeekFrom::Start(0)).await?;
                    }
                    written = 0;
                }
                SinkMessage::Last => break,
            }
        }

        service.sync_all().await?;
        if let Some(temp) = temp.as_mut() {
            temp.sync_all().await?;
        }
        Ok(SinkReport { across_write })
    }
}

async fn write_at(file: &mut File, offset: u64, content: &[u8]) -> Result<()> {
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(content).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

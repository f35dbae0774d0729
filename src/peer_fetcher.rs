use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, warn};
use reqwest::Client;
use tokio::sync::{Semaphore, mpsc};

use crate::types::{
    Piece, PiecePayload, PieceResult, PieceTask, SinkMessage, TaskStatus, range_length,
};

/// Abstraction for fetching a byte range from an assigned peer.
/// Allows testing fetcher classification without network I/O.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn fetch_piece(&self, task: &PieceTask) -> Result<Bytes>;
}

pub struct HttpPeerTransport {
    http_client: Client,
}

impl HttpPeerTransport {
    pub fn new(http_client: Client) -> Self {
        Self { http_client }
    }
}

#[async_trait]
impl PeerTransport for HttpPeerTransport {
    async fn fetch_piece(&self, task: &PieceTask) -> Result<Bytes> {
        let mut req = self
            .http_client
            .get(&task.url)
            .header(reqwest::header::RANGE, format!("bytes={}", task.range));

        for header in &task.headers {
            if let Some((name, value)) = header.split_once(':') {
                req = req.header(name.trim(), value.trim());
            }
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow::anyhow!(
                "peer {} returned status {} for range {}",
                task.cid,
                status,
                task.range
            ));
        }

        Ok(resp.bytes().await?)
    }
}

/// Downloads one assigned piece range from its peer and reports the outcome:
/// a `Piece` event on the orchestrator queue, and (on success) the payload on
/// the sink queue. Never touches the orchestrator's piece set.
pub struct PeerFetcher {
    task_id: String,
    node: String,
    task: PieceTask,
    transport: Arc<dyn PeerTransport>,
    events: mpsc::UnboundedSender<Piece>,
    sink: mpsc::Sender<SinkMessage>,
    permits: Arc<Semaphore>,
}

impl PeerFetcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_id: String,
        node: String,
        task: PieceTask,
        transport: Arc<dyn PeerTransport>,
        events: mpsc::UnboundedSender<Piece>,
        sink: mpsc::Sender<SinkMessage>,
        permits: Arc<Semaphore>,
    ) -> Self {
        Self {
            task_id,
            node,
            task,
            transport,
            events,
            sink,
            permits,
        }
    }

    pub async fn run(self) {
        // Closed semaphore means the job is shutting down; drop the work.
        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let (result, content) = self.fetch_and_classify().await;
        debug!(
            "piece {} from {}: {:?} ({} bytes)",
            self.task.range,
            self.task.cid,
            result,
            content.len()
        );

        if result == PieceResult::Success {
            // Payload before the completion event, so a FINISH triggered by
            // this event cannot put LAST ahead of the bytes.
            let payload = SinkMessage::Piece(PiecePayload {
                range: self.task.range.clone(),
                content: content.clone(),
            });
            if self.sink.send(payload).await.is_err() {
                return;
            }
        }

        let mut piece = Piece::new(
            self.task_id,
            self.node,
            self.task.cid,
            self.task.range,
            result,
            TaskStatus::Running,
        );
        piece.piece_size = self.task.piece_size;
        piece.content = content;
        let _ = self.events.send(piece);
    }

    async fn fetch_and_classify(&self) -> (PieceResult, Bytes) {
        let content = match self.transport.fetch_piece(&self.task).await {
            Ok(content) => content,
            Err(e) => {
                warn!(
                    "fetch of {} from {} failed: {:#}",
                    self.task.range, self.task.cid, e
                );
                return (PieceResult::Fail, Bytes::new());
            }
        };

        match range_length(&self.task.range) {
            Ok(expected) if content.len() as u64 == expected => {}
            Ok(expected) => {
                warn!(
                    "piece {} from {} has {} bytes, expected {}",
                    self.task.range,
                    self.task.cid,
                    content.len(),
                    expected
                );
                return (PieceResult::Invalid, Bytes::new());
            }
            Err(e) => {
                warn!("piece task carried bad range {}: {:#}", self.task.range, e);
                return (PieceResult::Invalid, Bytes::new());
            }
        }

        if let Some(expected_md5) = &self.task.piece_md5 {
            let actual = format!("{:x}", md5::compute(&content));
            if &actual != expected_md5 {
                warn!(
                    "piece {} from {} md5 mismatch: expected {}, got {}",
                    self.task.range, self.task.cid, expected_md5, actual
                );
                return (PieceResult::Invalid, Bytes::new());
            }
        }

        (PieceResult::Success, content)
    }
}

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;

use crate::types::{PullPieceTaskRequest, PullPieceTaskResponse};

/// Abstraction for supernode task communication.
/// Allows testing the orchestrator loop without making real HTTP requests.
#[async_trait]
pub trait SupernodeApi: Send + Sync {
    /// Report the previous piece outcome and pull the next batch of
    /// assignments from the given supernode.
    async fn pull_piece_task(
        &self,
        node: &str,
        req: &PullPieceTaskRequest,
    ) -> Result<PullPieceTaskResponse>;
}

pub struct HttpSupernodeApi {
    http_client: Client,
}

impl HttpSupernodeApi {
    pub fn new(http_client: Client) -> Self {
        Self { http_client }
    }
}

#[async_trait]
impl SupernodeApi for HttpSupernodeApi {
    async fn pull_piece_task(
        &self,
        node: &str,
        req: &PullPieceTaskRequest,
    ) -> Result<PullPieceTaskResponse> {
        let url = format!("http://{}/peer/piece/task", node);
        let resp = self
            .http_client
            .get(&url)
            .query(&[
                ("srcCid", req.src_cid.clone()),
                ("dstCid", req.dst_cid.clone()),
                ("range", req.range.clone()),
                ("result", req.result.to_string()),
                ("status", req.status.to_string()),
                ("taskId", req.task_id.clone()),
            ])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow::anyhow!(
                "supernode {} returned status {}",
                node,
                status
            ));
        }

        let parsed = resp.json::<PullPieceTaskResponse>().await?;
        Ok(parsed)
    }
}

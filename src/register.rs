use std::net::UdpSocket;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::Client;
use serde::Deserialize;

use crate::config::{Config, codes};
use crate::error::DownloadError;
use crate::types::RegisterResult;

/// Abstraction for supernode registration. Also used mid-download when the
/// orchestrator migrates away from a failing supernode.
#[async_trait]
pub trait SupernodeRegister: Send + Sync {
    async fn register(&self, peer_port: u16) -> Result<RegisterResult>;
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    code: i32,
    #[serde(default)]
    data: Option<RegisterResult>,
}

pub struct HttpRegister {
    http_client: Client,
    cfg: Arc<Config>,
}

impl HttpRegister {
    pub fn new(http_client: Client, cfg: Arc<Config>) -> Self {
        Self { http_client, cfg }
    }

    async fn register_to(&self, node: &str, peer_port: u16) -> Result<RegisterResult> {
        let body = serde_json::json!({
            "cid": self.cfg.cid,
            "ip": local_ip_towards(node),
            "port": peer_port,
            "url": self.cfg.url,
            "md5": self.cfg.md5,
            "headers": self.cfg.headers,
        });

        let url = format!("http://{}/peer/registry", node);
        let resp = self.http_client.post(&url).json(&body).send().await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow::anyhow!("supernode {} returned status {}", node, status));
        }

        let parsed = resp.json::<RegisterResponse>().await?;
        if parsed.code != codes::SUCCESS {
            return Err(anyhow::anyhow!(
                "supernode {} rejected registration with code {}",
                node,
                parsed.code
            ));
        }

        let mut result = parsed
            .data
            .ok_or_else(|| anyhow::anyhow!("registration response carried no data"))?;
        if result.node.is_empty() {
            result.node = node.to_string();
        }
        Ok(result)
    }
}

#[async_trait]
impl SupernodeRegister for HttpRegister {
    async fn register(&self, peer_port: u16) -> Result<RegisterResult> {
        if self.cfg.supernodes.is_empty() {
            return Err(DownloadError::NoSupernode.into());
        }

        let mut last_err = None;
        for node in &self.cfg.supernodes {
            match self.register_to(node, peer_port).await {
                Ok(result) => {
                    debug!(
                        "registered to supernode {} with task {}",
                        result.node, result.task_id
                    );
                    return Ok(result);
                }
                Err(e) => {
                    warn!("registration to {} failed: {:#}", node, e);
                    last_err = Some(e);
                }
            }
        }

        Err(DownloadError::register(format!(
            "all supernodes refused: {:#}",
            last_err.unwrap_or_else(|| anyhow::anyhow!("no attempt made"))
        ))
        .into())
    }
}

/// Local address other peers can reach us at, determined by the route the OS
/// picks towards the supernode. No packet is sent.
fn local_ip_towards(node: &str) -> String {
    let probe = || -> std::io::Result<String> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(node)?;
        Ok(socket.local_addr()?.ip().to_string())
    };
    probe().unwrap_or_else(|_| "127.0.0.1".to_string())
}

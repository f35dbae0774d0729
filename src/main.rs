use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use log::{error, info, warn};

use peerget::bandwidth_limiter::DownloadThrottle;
use peerget::cli::Args;
use peerget::config::Config;
use peerget::orchestrator::P2pDownloader;
use peerget::peer_fetcher::HttpPeerTransport;
use peerget::piece_sink::FileSink;
use peerget::register::{HttpRegister, SupernodeRegister};
use peerget::source_downloader::{HttpSourceDownloader, SourceDownloader};
use peerget::supernode_api::HttpSupernodeApi;

#[tokio::main]
async fn main() {
    pretty_env_logger::init_timed();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("download failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let cfg = Arc::new(Config::from_args(args)?);
    let http_client = reqwest::Client::builder().timeout(cfg.timeout).build()?;

    let register = Arc::new(HttpRegister::new(http_client.clone(), cfg.clone()));
    let source = Arc::new(HttpSourceDownloader::new(http_client.clone(), cfg.clone()));

    // A failed registration leaves no P2P path to try; go straight to source.
    let register_result = match register.register(cfg.peer_port).await {
        Ok(result) => result,
        Err(e) => {
            warn!("registration failed ({:#}), downloading from source", e);
            return source.run().await;
        }
    };
    info!(
        "registered to supernode {} (task {}, piece size {}, file length {})",
        register_result.node,
        register_result.task_id,
        register_result.piece_size,
        register_result.file_length
    );

    let api = Arc::new(HttpSupernodeApi::new(http_client.clone()));
    let transport = Arc::new(HttpPeerTransport::new(http_client));
    let throttle = cfg
        .rate_limit
        .map(DownloadThrottle::new)
        .transpose()?
        .map(Arc::new);
    let sink = Box::new(FileSink::new(
        cfg.client_file_path(),
        cfg.service_file_path(),
        cfg.temp_target(),
    ));

    let mut downloader = P2pDownloader::new(
        cfg,
        register_result,
        api,
        register,
        transport,
        sink,
        source,
        throttle,
    );
    downloader.run().await
}

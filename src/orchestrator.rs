use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use bytes::Bytes;
use log::{debug, error, info, warn};
use rand::Rng;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::bandwidth_limiter::DownloadThrottle;
use crate::config::{Config, codes};
use crate::error::DownloadError;
use crate::file_utils;
use crate::peer_fetcher::{PeerFetcher, PeerTransport};
use crate::piece_sink::{PieceSink, SinkReport};
use crate::register::SupernodeRegister;
use crate::source_downloader::SourceDownloader;
use crate::supernode_api::SupernodeApi;
use crate::types::{
    Piece, PieceResult, PieceTask, PullPieceTaskRequest, PullPieceTaskResponse, RegisterResult,
    SinkMessage, TaskStatus,
};

const EVENT_POLL_TIMEOUT: Duration = Duration::from_secs(2);
const WAIT_SLEEP_MIN_MS: u64 = 600;
const WAIT_SLEEP_MAX_MS: u64 = 2000;
/// Cap on re-registrations within a single pull before giving up.
const MAX_MIGRATIONS_PER_PULL: u32 = 3;
/// Keep at least this many fetches outstanding before asking for more work.
const MERGE_PIPELINE_DEPTH: usize = 2;

/// State of an assigned range. Absent from the map means "not assigned".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeState {
    InFlight,
    Done,
}

/// Why the job is abandoning the P2P path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackSourceReason {
    #[default]
    None,
    SourceError,
    DownloadError,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Progress {
    pub in_flight: usize,
    pub done: usize,
    pub total_bytes: u64,
}

/// Drives one download job: polls the supernode for piece assignments, spawns
/// a fetcher per new range, merges completion events, and feeds the sink.
///
/// The orchestrator is the sole mutator of the piece set, byte counter, and
/// supernode identity; fetchers only ever send events.
pub struct P2pDownloader {
    cfg: Arc<Config>,
    api: Arc<dyn SupernodeApi>,
    register: Arc<dyn SupernodeRegister>,
    transport: Arc<dyn PeerTransport>,
    source: Arc<dyn SourceDownloader>,
    throttle: Option<Arc<DownloadThrottle>>,

    node: String,
    task_id: String,
    // (previous, current); they differ only while a migration with a new
    // piece size awaits its reset.
    piece_size_history: (i32, i32),

    events_tx: mpsc::UnboundedSender<Piece>,
    events_rx: mpsc::UnboundedReceiver<Piece>,
    sink_tx: mpsc::Sender<SinkMessage>,
    sink_rx: Option<mpsc::Receiver<SinkMessage>>,
    sink: Option<Box<dyn PieceSink>>,

    client_file_path: PathBuf,
    service_file_path: PathBuf,

    piece_set: HashMap<String, RangeState>,
    total_bytes: u64,
    back_source_reason: BackSourceReason,
    fetch_permits: Arc<Semaphore>,
}

impl P2pDownloader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Arc<Config>,
        register_result: RegisterResult,
        api: Arc<dyn SupernodeApi>,
        register: Arc<dyn SupernodeRegister>,
        transport: Arc<dyn PeerTransport>,
        sink: Box<dyn PieceSink>,
        source: Arc<dyn SourceDownloader>,
        throttle: Option<Arc<DownloadThrottle>>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (sink_tx, sink_rx) = mpsc::channel(cfg.client_queue_size.max(1));

        let node = register_result.node;
        let task_id = register_result.task_id;
        let piece_size = register_result.piece_size;

        // Seed the queue; the first merge returns it immediately and the
        // loop opens the task with a Start pull.
        let seed = Piece::control(task_id.clone(), node.clone(), TaskStatus::Start);
        let _ = events_tx.send(seed);

        Self {
            client_file_path: cfg.client_file_path(),
            service_file_path: cfg.service_file_path(),
            fetch_permits: Arc::new(Semaphore::new(cfg.max_fetchers.max(1))),
            cfg,
            api,
            register,
            transport,
            source,
            throttle,
            node,
            task_id,
            piece_size_history: (piece_size, piece_size),
            events_tx,
            events_rx,
            sink_tx,
            sink_rx: Some(sink_rx),
            sink: Some(sink),
            piece_set: HashMap::new(),
            total_bytes: 0,
            back_source_reason: BackSourceReason::None,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Piece size currently negotiated with the supernode.
    pub fn piece_size(&self) -> i32 {
        self.piece_size_history.1
    }

    pub fn back_source_reason(&self) -> BackSourceReason {
        self.back_source_reason
    }

    pub fn progress(&self) -> Progress {
        let in_flight = self
            .piece_set
            .values()
            .filter(|s| **s == RangeState::InFlight)
            .count();
        Progress {
            in_flight,
            done: self.piece_set.len() - in_flight,
            total_bytes: self.total_bytes,
        }
    }

    /// Runs the job to completion: success of the P2P path, success of the
    /// back-to-source fallback, or an unrecovered error.
    pub async fn run(&mut self) -> Result<()> {
        let sink = self
            .sink
            .take()
            .ok_or_else(|| anyhow!("downloader already ran"))?;
        let sink_rx = self
            .sink_rx
            .take()
            .ok_or_else(|| anyhow!("downloader already ran"))?;
        let mut sink_task: Option<JoinHandle<Result<SinkReport>>> =
            Some(tokio::spawn(sink.run(sink_rx)));

        let mut latest: Option<Piece> = None;
        loop {
            let (proceed, carried) = self.get_next(latest).await;
            latest = carried;
            if !proceed {
                continue;
            }
            let Some(mut cur) = latest.take() else {
                continue;
            };
            cur.content = Bytes::new();
            debug!(
                "pulling with range={:?} result={:?} status={:?}",
                cur.range, cur.result, cur.status
            );

            match self.pull_piece_task(&mut cur).await {
                Ok(response) => match response.code {
                    codes::TASK_CONTINUE => {
                        if let Err(e) = self.process_piece(&response, &cur).await {
                            error!("processing piece batch failed: {:#}", e);
                            if self.back_source_reason == BackSourceReason::None {
                                self.back_source_reason = BackSourceReason::DownloadError;
                            }
                        }
                    }
                    codes::TASK_FINISH => {
                        self.finish(&mut sink_task).await?;
                        if self.back_source_reason != BackSourceReason::None {
                            return self.fall_back_to_source(&mut sink_task).await;
                        }
                        return Ok(());
                    }
                    code => {
                        warn!("pull piece task answered with code {}", code);
                        if code == codes::TASK_SOURCE_ERROR {
                            self.back_source_reason = BackSourceReason::SourceError;
                        }
                    }
                },
                Err(e) => {
                    error!("p2p download failed: {:#}", e);
                    if self.back_source_reason == BackSourceReason::None {
                        self.back_source_reason = BackSourceReason::DownloadError;
                    }
                }
            }

            if self.back_source_reason != BackSourceReason::None {
                return self.fall_back_to_source(&mut sink_task).await;
            }
        }
    }

    /// Merge point of the three producers. Returns whether to call the
    /// supernode now, and the carried-over latest event.
    async fn get_next(&mut self, latest: Option<Piece>) -> (bool, Option<Piece>) {
        let mut latest = latest;
        let mut need_merge = true;

        match timeout(EVENT_POLL_TIMEOUT, self.events_rx.recv()).await {
            Ok(Some(mut item)) => {
                // A fetcher spawned before a piece-size renegotiation reports
                // against stale geometry; its event must not touch any state.
                if item.piece_size != 0 && item.piece_size != self.piece_size_history.1 {
                    return (false, latest);
                }
                if item.super_node != self.node {
                    item.dst_cid.clear();
                    item.super_node = self.node.clone();
                    item.task_id = self.task_id.clone();
                }
                if !item.range.is_empty() {
                    match self.piece_set.get(&item.range).copied() {
                        None => {
                            warn!("piece range {} is neither running nor success", item.range);
                            return (false, latest);
                        }
                        Some(RangeState::InFlight) => {
                            if matches!(
                                item.result,
                                PieceResult::Success | PieceResult::SemiSuccess
                            ) {
                                self.total_bytes += item.content.len() as u64;
                                self.piece_set.insert(item.range.clone(), RangeState::Done);
                            } else {
                                // Any other outcome abandons the assignment;
                                // the supernode may hand the range out again.
                                self.piece_set.remove(&item.range);
                            }
                        }
                        Some(RangeState::Done) => {}
                    }
                }
                latest = Some(item);
            }
            Ok(None) | Err(_) => {
                warn!("no piece event within {:?}", EVENT_POLL_TIMEOUT);
                need_merge = false;
            }
        }

        let Some(item) = latest.as_ref() else {
            return (false, None);
        };
        if item.result.is_terminal() {
            need_merge = false;
        }

        let running_count = self
            .piece_set
            .values()
            .filter(|s| **s == RangeState::InFlight)
            .count();
        if need_merge && (!self.events_rx.is_empty() || running_count > MERGE_PIPELINE_DEPTH) {
            return (false, latest);
        }
        (true, latest)
    }

    /// Report `item` and pull the next batch, retrying on WAIT and migrating
    /// to a fresh registration when the supernode goes bad.
    async fn pull_piece_task(&mut self, item: &mut Piece) -> Result<PullPieceTaskResponse> {
        let mut migrations: u32 = 0;
        loop {
            let req = PullPieceTaskRequest {
                src_cid: self.cfg.cid.clone(),
                dst_cid: item.dst_cid.clone(),
                range: item.range.clone(),
                result: item.result.code(),
                status: item.status.code(),
                task_id: item.task_id.clone(),
            };

            let mut response = None;
            loop {
                match self.api.pull_piece_task(&item.super_node, &req).await {
                    Ok(res) if res.code == codes::TASK_WAIT => {
                        let ms = rand::thread_rng().gen_range(WAIT_SLEEP_MIN_MS..WAIT_SLEEP_MAX_MS);
                        info!("supernode asked to wait, sleeping {}ms", ms);
                        sleep(Duration::from_millis(ms)).await;
                    }
                    Ok(res) => {
                        response = Some(res);
                        break;
                    }
                    Err(e) => {
                        error!("pull piece task error: {:#}", e);
                        break;
                    }
                }
            }

            let last_code = response.as_ref().map(|r| r.code);
            if let Some(res) = response {
                // SOURCE_ERROR is a verdict, not a bad supernode; it must
                // reach the main loop to trigger the fallback.
                if matches!(
                    res.code,
                    codes::TASK_CONTINUE
                        | codes::TASK_FINISH
                        | codes::TASK_LIMITED
                        | codes::TASK_SOURCE_ERROR
                        | codes::SUCCESS
                ) {
                    return Ok(res);
                }
                warn!("pull piece task failed with code {}, migrating", res.code);
            }

            if migrations >= MAX_MIGRATIONS_PER_PULL {
                return Err(DownloadError::TrackerExhausted {
                    migrations,
                    last_code,
                }
                .into());
            }
            migrations += 1;

            let result = self
                .register
                .register(self.cfg.peer_port)
                .await
                .map_err(|e| DownloadError::register(format!("{:#}", e)))?;
            self.piece_size_history.1 = result.piece_size;
            item.status = TaskStatus::Start;
            item.super_node = result.node;
            item.task_id = result.task_id;
            info!("migrated to supernode {}", item.super_node);
        }
    }

    /// Handle a CONTINUE batch: reset on piece-size change, adopt a migrated
    /// supernode, and start a fetcher per newly assigned range.
    async fn process_piece(
        &mut self,
        response: &PullPieceTaskResponse,
        item: &Piece,
    ) -> Result<()> {
        self.refresh(item).await?;

        let mut has_task = false;
        let mut suc_count = 0;
        for task in response.continue_data()? {
            match self.piece_set.get(&task.range).copied() {
                Some(RangeState::Done) => {
                    suc_count += 1;
                    // Advertise the piece as already held on the next poll.
                    let _ = self.events_tx.send(Piece::new(
                        self.task_id.clone(),
                        self.node.clone(),
                        task.cid.clone(),
                        task.range.clone(),
                        PieceResult::SemiSuccess,
                        TaskStatus::Running,
                    ));
                }
                Some(RangeState::InFlight) => {}
                None => {
                    self.piece_set
                        .insert(task.range.clone(), RangeState::InFlight);
                    self.pull_rate(&task).await;
                    self.spawn_fetcher(task);
                    has_task = true;
                }
            }
        }

        if !has_task {
            warn!("no new piece task in batch, maybe resource shortage");
        }
        if suc_count > 0 {
            info!("{} assigned pieces were already done", suc_count);
        }
        let progress = self.progress();
        debug!(
            "progress: {} done, {} in flight, {} bytes",
            progress.done, progress.in_flight, progress.total_bytes
        );
        Ok(())
    }

    /// Apply pending piece-size and supernode changes before acting on a
    /// batch. The reset must reach the sink before any new payload.
    async fn refresh(&mut self, item: &Piece) -> Result<()> {
        if self.piece_size_history.0 != self.piece_size_history.1 {
            info!(
                "piece size changed from {} to {}, resetting assembly",
                self.piece_size_history.0, self.piece_size_history.1
            );
            self.piece_size_history.0 = self.piece_size_history.1;
            self.sink_tx
                .send(SinkMessage::Reset)
                .await
                .map_err(|_| DownloadError::SinkClosed)?;
            self.piece_set.clear();
            self.total_bytes = 0;
        }
        if self.node != item.super_node {
            self.node = item.super_node.clone();
            self.task_id = item.task_id.clone();
        }
        Ok(())
    }

    /// Rate-limit hook, applied before each fetcher spawn. A no-op unless a
    /// download throttle was configured.
    async fn pull_rate(&self, task: &PieceTask) {
        if let Some(throttle) = &self.throttle {
            throttle.acquire(task.piece_size.max(0) as u64).await;
        }
    }

    fn spawn_fetcher(&self, task: PieceTask) {
        let fetcher = PeerFetcher::new(
            self.task_id.clone(),
            self.node.clone(),
            task,
            Arc::clone(&self.transport),
            self.events_tx.clone(),
            self.sink_tx.clone(),
            Arc::clone(&self.fetch_permits),
        );
        tokio::spawn(fetcher.run());
    }

    /// Drain the sink and land the assembled file at the target.
    async fn finish(&mut self, sink_task: &mut Option<JoinHandle<Result<SinkReport>>>) -> Result<()> {
        self.sink_tx
            .send(SinkMessage::Last)
            .await
            .map_err(|_| DownloadError::SinkClosed)?;
        let handle = sink_task
            .take()
            .ok_or_else(|| anyhow!("sink already joined"))?;
        let report = handle
            .await
            .map_err(|e| DownloadError::sink(e.to_string()))?
            .map_err(|e| DownloadError::sink(format!("{:#}", e)))?;
        info!(
            "writer finished, {} bytes assembled (across_write: {})",
            self.total_bytes, report.across_write
        );

        if self.back_source_reason != BackSourceReason::None {
            return Ok(());
        }

        let src = if report.across_write {
            self.cfg.temp_target()
        } else {
            if tokio::fs::metadata(&self.client_file_path).await.is_err() {
                info!(
                    "client file {:?} missing, relinking from service file",
                    self.client_file_path
                );
                file_utils::link_or_copy(&self.service_file_path, &self.client_file_path).await?;
            }
            self.client_file_path.clone()
        };

        file_utils::move_file(&src, &self.cfg.target_file).await?;
        if let Some(md5) = &self.cfg.md5 {
            file_utils::verify_md5(&self.cfg.target_file, md5).await?;
        }
        info!("download finished at {:?}", self.cfg.target_file);
        Ok(())
    }

    async fn fall_back_to_source(
        &mut self,
        sink_task: &mut Option<JoinHandle<Result<SinkReport>>>,
    ) -> Result<()> {
        info!(
            "abandoning p2p path ({:?}), falling back to source",
            self.back_source_reason
        );
        // Stop pending fetchers and the writer; their partial output is moot.
        self.fetch_permits.close();
        if let Some(task) = sink_task.take() {
            task.abort();
        }
        self.source.run().await
    }
}

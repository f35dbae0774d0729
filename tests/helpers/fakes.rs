use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Notify, mpsc};

use peerget::config::codes;
use peerget::piece_sink::{PieceSink, SinkReport};
use peerget::register::SupernodeRegister;
use peerget::source_downloader::SourceDownloader;
use peerget::supernode_api::SupernodeApi;
use peerget::types::{
    PieceTask, PullPieceTaskRequest, PullPieceTaskResponse, RegisterResult, SinkMessage,
    parse_range,
};

/// Deterministic content for a range, so tests can assert assembled files.
pub fn range_bytes(range: &str) -> Bytes {
    let (start, end) = parse_range(range).unwrap();
    (start..=end).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
}

pub fn piece_task(range: &str, cid: &str, piece_size: i32) -> PieceTask {
    PieceTask {
        range: range.to_string(),
        cid: cid.to_string(),
        piece_size,
        url: format!("http://10.0.0.5:8001/peer/file/{}", cid),
        headers: vec![],
        piece_md5: None,
    }
}

pub fn register_result(node: &str, task_id: &str, piece_size: i32) -> RegisterResult {
    RegisterResult {
        node: node.to_string(),
        task_id: task_id.to_string(),
        piece_size,
        file_length: 1024,
    }
}

/// Scripted supernode: pops one canned response per call and records every
/// request. Runs FINISH when the script is exhausted so tests cannot hang.
pub struct MockSupernodeApi {
    responses: Mutex<VecDeque<Result<PullPieceTaskResponse>>>,
    requests: Mutex<Vec<(String, PullPieceTaskRequest)>>,
}

impl MockSupernodeApi {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn expect_continue(&self, tasks: Vec<PieceTask>) {
        self.responses.lock().unwrap().push_back(Ok(PullPieceTaskResponse {
            code: codes::TASK_CONTINUE,
            data: Some(serde_json::to_value(tasks).unwrap()),
        }));
    }

    pub fn expect_code(&self, code: i32) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Ok(PullPieceTaskResponse { code, data: None }));
    }

    pub fn expect_finish(&self) {
        self.expect_code(codes::TASK_FINISH);
    }

    pub fn expect_error(&self, msg: &str) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Err(anyhow::anyhow!(msg.to_string())));
    }

    pub fn requests(&self) -> Vec<(String, PullPieceTaskRequest)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl SupernodeApi for MockSupernodeApi {
    async fn pull_piece_task(
        &self,
        node: &str,
        req: &PullPieceTaskRequest,
    ) -> Result<PullPieceTaskResponse> {
        self.requests
            .lock()
            .unwrap()
            .push((node.to_string(), req.clone()));
        self.responses.lock().unwrap().pop_front().unwrap_or_else(|| {
            Ok(PullPieceTaskResponse {
                code: codes::TASK_FINISH,
                data: None,
            })
        })
    }
}

/// Scripted registrar for migration tests.
pub struct MockRegister {
    results: Mutex<VecDeque<Result<RegisterResult>>>,
    calls: Mutex<usize>,
}

impl MockRegister {
    pub fn new() -> Self {
        Self {
            results: Mutex::new(VecDeque::new()),
            calls: Mutex::new(0),
        }
    }

    pub fn expect(&self, result: RegisterResult) {
        self.results.lock().unwrap().push_back(Ok(result));
    }

    pub fn expect_failure(&self, msg: &str) {
        self.results
            .lock()
            .unwrap()
            .push_back(Err(anyhow::anyhow!(msg.to_string())));
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl SupernodeRegister for MockRegister {
    async fn register(&self, _peer_port: u16) -> Result<RegisterResult> {
        *self.calls.lock().unwrap() += 1;
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow::anyhow!("no registration scripted")))
    }
}

/// One scripted fetch outcome for a range.
pub enum FetchOutcome {
    /// Serve the deterministic bytes for the range.
    Serve,
    /// Fail with a transport error.
    Refuse,
    /// Serve a body of the wrong length.
    Truncate,
    /// Wait for the notify, then serve.
    Gated(Arc<Notify>),
}

/// Scripted peer transport: per-range outcome queues plus a fetch log.
/// Unscripted ranges are served. Cloneable via Arc by the caller.
pub struct ScriptedPeerTransport {
    outcomes: Mutex<HashMap<String, VecDeque<FetchOutcome>>>,
    fetched: Mutex<Vec<String>>,
}

impl ScriptedPeerTransport {
    pub fn new() -> Self {
        Self {
            outcomes: Mutex::new(HashMap::new()),
            fetched: Mutex::new(Vec::new()),
        }
    }

    pub fn script(&self, range: &str, outcome: FetchOutcome) {
        self.outcomes
            .lock()
            .unwrap()
            .entry(range.to_string())
            .or_default()
            .push_back(outcome);
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn fetch_count(&self, range: &str) -> usize {
        self.fetched
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.as_str() == range)
            .count()
    }
}

#[async_trait]
impl peerget::peer_fetcher::PeerTransport for ScriptedPeerTransport {
    async fn fetch_piece(&self, task: &PieceTask) -> Result<Bytes> {
        self.fetched.lock().unwrap().push(task.range.clone());
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .get_mut(&task.range)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(FetchOutcome::Serve);
        match outcome {
            FetchOutcome::Serve => Ok(range_bytes(&task.range)),
            FetchOutcome::Refuse => Err(anyhow::anyhow!("connection refused")),
            FetchOutcome::Truncate => {
                let bytes = range_bytes(&task.range);
                Ok(bytes.slice(0..bytes.len() / 2))
            }
            FetchOutcome::Gated(notify) => {
                notify.notified().await;
                Ok(range_bytes(&task.range))
            }
        }
    }
}

/// Observable record of sink traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Payload(String),
    Reset,
    Last,
}

/// Sink fake that logs every message and still produces a client file on
/// shutdown, so the orchestrator's finish path has something to move.
pub struct CaptureSink {
    client_file_path: PathBuf,
    log: Arc<Mutex<Vec<SinkEvent>>>,
}

impl CaptureSink {
    pub fn new(client_file_path: PathBuf) -> (Self, Arc<Mutex<Vec<SinkEvent>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                client_file_path,
                log: log.clone(),
            },
            log,
        )
    }
}

#[async_trait]
impl PieceSink for CaptureSink {
    async fn run(self: Box<Self>, mut rx: mpsc::Receiver<SinkMessage>) -> Result<SinkReport> {
        let mut assembled: Vec<u8> = Vec::new();
        loop {
            let Some(msg) = rx.recv().await else { break };
            match msg {
                SinkMessage::Piece(payload) => {
                    let (start, end) = parse_range(&payload.range)?;
                    if assembled.len() < (end + 1) as usize {
                        assembled.resize((end + 1) as usize, 0);
                    }
                    assembled[start as usize..=end as usize].copy_from_slice(&payload.content);
                    self.log
                        .lock()
                        .unwrap()
                        .push(SinkEvent::Payload(payload.range));
                }
                SinkMessage::Reset => {
                    assembled.clear();
                    self.log.lock().unwrap().push(SinkEvent::Reset);
                }
                SinkMessage::Last => {
                    self.log.lock().unwrap().push(SinkEvent::Last);
                    break;
                }
            }
        }
        if let Some(parent) = self.client_file_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.client_file_path, &assembled).await?;
        Ok(SinkReport::default())
    }
}

/// Scripted back-to-source downloader.
pub struct MockSourceDownloader {
    calls: Mutex<usize>,
    failure: Mutex<Option<String>>,
}

impl MockSourceDownloader {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(0),
            failure: Mutex::new(None),
        }
    }

    pub fn expect_failure(&self, msg: &str) {
        *self.failure.lock().unwrap() = Some(msg.to_string());
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl SourceDownloader for MockSourceDownloader {
    async fn run(&self) -> Result<()> {
        *self.calls.lock().unwrap() += 1;
        match self.failure.lock().unwrap().as_ref() {
            Some(msg) => Err(anyhow::anyhow!(msg.clone())),
            None => Ok(()),
        }
    }
}

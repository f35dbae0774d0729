use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::config::codes;
use crate::error::{DownloadError, Result};

/// Outcome of one piece attempt, as reported on the event queue and to the
/// supernode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceResult {
    Running,
    SemiSuccess,
    Success,
    Fail,
    Invalid,
}

impl PieceResult {
    pub fn code(self) -> i32 {
        match self {
            PieceResult::Running => codes::RESULT_RUNNING,
            PieceResult::SemiSuccess => codes::RESULT_SEMI_SUCCESS,
            PieceResult::Success => codes::RESULT_SUCCESS,
            PieceResult::Fail => codes::RESULT_FAIL,
            PieceResult::Invalid => codes::RESULT_INVALID,
        }
    }

    /// Terminal per-piece states force a supernode call instead of merging.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PieceResult::Success | PieceResult::Fail | PieceResult::Invalid
        )
    }
}

/// Task lifecycle phase carried alongside a piece event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Start,
    Running,
    Finish,
}

impl TaskStatus {
    pub fn code(self) -> i32 {
        match self {
            TaskStatus::Start => codes::STATUS_START,
            TaskStatus::Running => codes::STATUS_RUNNING,
            TaskStatus::Finish => codes::STATUS_FINISH,
        }
    }
}

/// One event on the orchestrator queue: the seed, a fetcher completion, or a
/// synthetic re-advertisement of a piece we already hold.
#[derive(Debug, Clone)]
pub struct Piece {
    pub task_id: String,
    pub super_node: String,
    pub dst_cid: String,
    pub range: String,
    pub result: PieceResult,
    pub status: TaskStatus,
    /// Piece size the producer was working with; 0 for control events, which
    /// exempts them from the stale-size filter.
    pub piece_size: i32,
    pub content: Bytes,
}

impl Piece {
    pub fn new(
        task_id: String,
        super_node: String,
        dst_cid: String,
        range: String,
        result: PieceResult,
        status: TaskStatus,
    ) -> Self {
        Self {
            task_id,
            super_node,
            dst_cid,
            range,
            result,
            status,
            piece_size: 0,
            content: Bytes::new(),
        }
    }

    /// Control event without a range, e.g. the seed that opens the task.
    pub fn control(task_id: String, super_node: String, status: TaskStatus) -> Self {
        Self::new(
            task_id,
            super_node,
            String::new(),
            String::new(),
            PieceResult::Invalid,
            status,
        )
    }
}

/// Request body of pull_piece_task: reports the previous piece outcome and
/// asks for the next batch.
#[derive(Debug, Clone, Serialize)]
pub struct PullPieceTaskRequest {
    pub src_cid: String,
    pub dst_cid: String,
    pub range: String,
    pub result: i32,
    pub status: i32,
    pub task_id: String,
}

/// One piece assignment from the supernode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PieceTask {
    pub range: String,
    pub cid: String,
    pub piece_size: i32,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<String>,
    #[serde(default)]
    pub piece_md5: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullPieceTaskResponse {
    pub code: i32,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl PullPieceTaskResponse {
    /// Piece assignments of a CONTINUE response. Absent data is an empty batch.
    pub fn continue_data(&self) -> Result<Vec<PieceTask>> {
        match &self.data {
            None => Ok(Vec::new()),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| DownloadError::MalformedTaskData(e.to_string()).into()),
        }
    }
}

/// Result of registering with a supernode; also produced on migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResult {
    pub node: String,
    pub task_id: String,
    pub piece_size: i32,
    pub file_length: u64,
}

/// Payload handed to the piece sink, ordered by arrival.
#[derive(Debug, Clone)]
pub struct PiecePayload {
    pub range: String,
    pub content: Bytes,
}

/// Messages on the sink queue. Control tokens are ordered with respect to
/// payloads enqueued before them.
#[derive(Debug, Clone)]
pub enum SinkMessage {
    Piece(PiecePayload),
    Reset,
    Last,
}

/// Parses a piece range of the form "start-end" (inclusive byte offsets).
pub fn parse_range(range: &str) -> Result<(u64, u64)> {
    let (start, end) = range
        .split_once('-')
        .ok_or_else(|| DownloadError::invalid_range(range))?;
    let start: u64 = start
        .parse()
        .map_err(|_| DownloadError::invalid_range(range))?;
    let end: u64 = end
        .parse()
        .map_err(|_| DownloadError::invalid_range(range))?;
    if end < start {
        return Err(DownloadError::invalid_range(range).into());
    }
    Ok((start, end))
}

/// Length in bytes of the range, end inclusive.
pub fn range_length(range: &str) -> Result<u64> {
    let (start, end) = parse_range(range)?;
    Ok(end - start + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_valid() {
        assert_eq!(parse_range("0-4194303").unwrap(), (0, 4194303));
        assert_eq!(parse_range("4194304-8388607").unwrap(), (4194304, 8388607));
        assert_eq!(range_length("0-4194303").unwrap(), 4 * 1024 * 1024);
    }

    #[test]
    fn test_parse_range_rejects_garbage() {
        assert!(parse_range("").is_err());
        assert!(parse_range("12").is_err());
        assert!(parse_range("a-b").is_err());
        assert!(parse_range("10-5").is_err());
    }

    #[test]
    fn test_continue_data_absent_is_empty() {
        let res = PullPieceTaskResponse { code: 601, data: None };
        assert!(res.continue_data().unwrap().is_empty());
    }

    #[test]
    fn test_continue_data_parses_tasks() {
        let res: PullPieceTaskResponse = serde_json::from_str(
            r#"{
                "code": 601,
                "data": [
                    {
                        "range": "0-1023",
                        "cid": "peer-1",
                        "piece_size": 1024,
                        "url": "http://10.0.0.5:8001/peer/file/x"
                    }
                ]
            }"#,
        )
        .unwrap();
        let tasks = res.continue_data().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].range, "0-1023");
        assert_eq!(tasks[0].cid, "peer-1");
        assert!(tasks[0].headers.is_empty());
        assert!(tasks[0].piece_md5.is_none());
    }

    #[test]
    fn test_continue_data_rejects_malformed() {
        let res = PullPieceTaskResponse {
            code: 601,
            data: Some(serde_json::json!({"not": "a list"})),
        };
        assert!(res.continue_data().is_err());
    }

    #[test]
    fn test_control_piece_is_terminal() {
        // The seed forces an immediate supernode call on first merge.
        let seed = Piece::control("task".into(), "node".into(), TaskStatus::Start);
        assert!(seed.result.is_terminal());
        assert_eq!(seed.piece_size, 0);
        assert!(seed.range.is_empty());
    }
}

//! Per-node request bookkeeping shared by every role.
//!
//! Responsibilities:
//! - pending/completed request counters behind a single mutex;
//! - publishing counter changes to the shared status board;
//! - the owned-date intersection every delegated call starts with;
//! - health/cancel ack responses.

use std::sync::Mutex;
use std::time::Duration;

use fq_common::ProcessConfig;
use fq_coordination::StatusBoard;
use fq_storage::{chunk_records, FireRecord};
use tokio::sync::mpsc;
use tonic::Status;
use tracing::info;

use crate::grpc::{record_to_proto, v1};

#[derive(Debug, Default)]
struct RequestCounters {
    pending: i64,
    completed: i64,
}

/// State shared by a node's RPC handlers: configuration, status-board
/// handle, and the request counters.
pub struct NodeShared {
    config: ProcessConfig,
    board: StatusBoard,
    counters: Mutex<RequestCounters>,
}

impl NodeShared {
    /// Binds shared state to a loaded configuration and an attached board.
    pub fn new(config: ProcessConfig, board: StatusBoard) -> NodeShared {
        NodeShared {
            config,
            board,
            counters: Mutex::new(RequestCounters::default()),
        }
    }

    /// Node configuration.
    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// Stable process id.
    pub fn process_id(&self) -> &str {
        &self.config.process_id
    }

    /// Worker slots this node serves with (its worker edges, at least one).
    pub fn active_workers(&self) -> i64 {
        self.config.edges_with_relationship("worker").len().max(1) as i64
    }

    /// Current pending-request count.
    pub fn pending(&self) -> i64 {
        self.counters.lock().unwrap_or_else(|p| p.into_inner()).pending
    }

    /// Registers an in-flight request and publishes the new counts.
    ///
    /// Returns the pending count after the increment.
    pub fn begin_request(&self) -> i64 {
        let (pending, completed) = {
            let mut counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
            counters.pending += 1;
            (counters.pending, counters.completed)
        };
        self.publish(pending, completed);
        pending
    }

    /// Retires an in-flight request; `completed` marks a successful finish.
    pub fn finish_request(&self, completed: bool) -> i64 {
        let (pending, completed_count) = {
            let mut counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
            counters.pending -= 1;
            if completed {
                counters.completed += 1;
            }
            (counters.pending, counters.completed)
        };
        self.publish(pending, completed_count);
        pending
    }

    fn publish(&self, pending: i64, completed: i64) {
        // Status is advisory; publish failures are swallowed by the board.
        self.board
            .update_process_status(self.process_id(), pending, self.active_workers(), completed, 0.0);
    }

    /// Shared status board.
    pub fn board(&self) -> &StatusBoard {
        &self.board
    }

    /// Health probe response for this node.
    pub fn health(&self) -> v1::HealthResponse {
        v1::HealthResponse {
            responding_process: self.process_id().to_string(),
            is_healthy: true,
            pending_requests: self.pending() as i32,
            active_workers: self.active_workers() as i32,
        }
    }

    /// Cancellation acknowledgement for this node.
    pub fn cancel_ack(&self, request_id: &str) -> v1::CancelResponse {
        info!(request_id, process = %self.process_id(), "cancel request acknowledged");
        v1::CancelResponse {
            request_id: request_id.to_string(),
            cancelled: true,
            message: "Query cancellation acknowledged".to_string(),
        }
    }
}

/// Owned dates falling inside the query's inclusive `YYYYMMDD` range.
///
/// Lexicographic comparison equals date order for this key format.
pub fn local_dates(owned: &[String], date_start: &str, date_end: &str) -> Vec<String> {
    owned
        .iter()
        .filter(|date| date.as_str() >= date_start && date.as_str() <= date_end)
        .cloned()
        .collect()
}

/// Streams one partition's records as ordered chunks numbered from zero.
///
/// `on_sent(chunk_number, records)` runs after each successful write.
/// Returns the number of chunks written, or `(chunk_number, records)` of
/// the chunk that could not be written because the receiver is gone
/// (treated as a cancelled downstream by callers). `pacing` optionally
/// spaces chunks out; it is advisory throttling, not a correctness property.
pub async fn emit_partition_chunks(
    request_id: &str,
    source_process: &str,
    records: Vec<FireRecord>,
    chunk_size: usize,
    pacing: Option<Duration>,
    tx: &mpsc::Sender<Result<v1::Chunk, Status>>,
    mut on_sent: impl FnMut(i32, usize),
) -> Result<i32, (i32, usize)> {
    let mut chunk_number = 0i32;
    for chunk in chunk_records(records, chunk_size) {
        let records_len = chunk.len();
        let message = v1::Chunk {
            request_id: request_id.to_string(),
            chunk_number,
            total_chunks: -1,
            is_final: false,
            total_records: 0,
            source_process: source_process.to_string(),
            records: chunk.into_iter().map(record_to_proto).collect(),
        };
        if tx.send(Ok(message)).await.is_err() {
            return Err((chunk_number, records_len));
        }
        on_sent(chunk_number, records_len);
        chunk_number += 1;
        if let Some(delay) = pacing {
            tokio::time::sleep(delay).await;
        }
    }
    Ok(chunk_number)
}

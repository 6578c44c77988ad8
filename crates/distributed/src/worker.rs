//! Terminal worker node.
//!
//! Serves `Delegate` only: decodes the embedded query, intersects the
//! requested date range with its owned dates, loads the matching records,
//! and streams them upward as fixed-size chunks. Direct `Query` calls are
//! rejected; workers only ever answer their team leader.

use std::sync::Arc;
use std::time::Duration;

use fq_common::metrics;
use fq_common::ProcessConfig;
use fq_coordination::StatusBoard;
use fq_storage::FireDataLoader;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{info, warn};

use crate::grpc::{
    decode_query, filter_from_query, to_status, v1, ChunkStream, FireQuery,
};
use crate::node::{emit_partition_chunks, local_dates, NodeShared};

/// Advisory spacing between emitted chunks.
const CHUNK_PACING: Duration = Duration::from_millis(10);

/// Chunks buffered ahead of the transport before the producer blocks.
const STREAM_BUFFER: usize = 4;

/// Worker-role service implementation.
pub struct WorkerService {
    shared: Arc<NodeShared>,
    loader: FireDataLoader,
}

impl WorkerService {
    /// Builds the service, binding the partition data source.
    pub fn new(config: ProcessConfig, board: StatusBoard) -> fq_common::Result<WorkerService> {
        let loader = FireDataLoader::new(&config.data_path)?;
        Ok(WorkerService {
            shared: Arc::new(NodeShared::new(config, board)),
            loader,
        })
    }

    /// Shared node state (exposed for tests).
    pub fn shared(&self) -> &Arc<NodeShared> {
        &self.shared
    }
}

#[tonic::async_trait]
impl FireQuery for WorkerService {
    type QueryStream = ChunkStream;

    async fn query(
        &self,
        _request: Request<v1::QueryRequest>,
    ) -> Result<Response<Self::QueryStream>, Status> {
        Err(Status::unimplemented("workers don't accept direct queries"))
    }

    type DelegateStream = ChunkStream;

    async fn delegate(
        &self,
        request: Request<v1::DelegationRequest>,
    ) -> Result<Response<Self::DelegateStream>, Status> {
        let req = request.into_inner();
        let query = decode_query(&req)?;

        info!(
            request_id = %req.request_id,
            from = %req.delegating_process,
            process = %self.shared.process_id(),
            "received delegation"
        );
        metrics::log_event(
            "RECEIVED_DELEGATION",
            &req.request_id,
            self.shared.pending(),
            1,
            -1,
            -1,
            &req.delegating_process,
        );

        self.shared.begin_request();

        let config = self.shared.config();
        let dates = local_dates(
            &config.data_partitioning.owned_dates,
            &query.date_start,
            &query.date_end,
        );
        if dates.is_empty() {
            info!(
                request_id = %req.request_id,
                process = %self.shared.process_id(),
                "no matching dates in partition"
            );
            self.shared.finish_request(true);
            let (_tx, rx) = mpsc::channel(1);
            return Ok(Response::new(Box::pin(ReceiverStream::new(rx))));
        }

        let records = match self.loader.load(&dates, &filter_from_query(&query)) {
            Ok(records) => records,
            Err(e) => {
                self.shared.finish_request(false);
                return Err(to_status(e));
            }
        };
        info!(
            request_id = %req.request_id,
            process = %self.shared.process_id(),
            dates = dates.len(),
            records = records.len(),
            "loaded partition records"
        );
        metrics::log_event(
            "LOADED_RECORDS",
            &req.request_id,
            self.shared.pending(),
            1,
            -1,
            records.len() as i64,
            "loaded by worker",
        );

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let shared = Arc::clone(&self.shared);
        let chunk_size = config.chunk_config.default_chunk_size;
        let request_id = req.request_id.clone();

        tokio::spawn(async move {
            let process_id = shared.process_id().to_string();
            let pending = shared.pending();
            let result = emit_partition_chunks(
                &request_id,
                &process_id,
                records,
                chunk_size,
                Some(CHUNK_PACING),
                &tx,
                |chunk_number, records_len| {
                    metrics::log_event(
                        "WORKER_CHUNK_SENT",
                        &request_id,
                        pending,
                        1,
                        chunk_number as i64,
                        records_len as i64,
                        &process_id,
                    );
                },
            )
            .await;

            match result {
                Ok(chunks) => {
                    info!(request_id = %request_id, process = %process_id, chunks, "delegation complete");
                    shared.finish_request(true);
                }
                Err((chunk_number, records_len)) => {
                    // Upstream reader went away mid-stream; the transport
                    // surfaces cancellation to the caller.
                    warn!(request_id = %request_id, process = %process_id, chunk_number, "failed to write chunk");
                    metrics::log_event(
                        "WORKER_CHUNK_SEND_ERROR",
                        &request_id,
                        shared.pending(),
                        1,
                        chunk_number as i64,
                        records_len as i64,
                        &process_id,
                    );
                    shared.finish_request(false);
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn health_check(
        &self,
        _request: Request<v1::HealthRequest>,
    ) -> Result<Response<v1::HealthResponse>, Status> {
        Ok(Response::new(self.shared.health()))
    }

    async fn cancel_query(
        &self,
        request: Request<v1::CancelRequest>,
    ) -> Result<Response<v1::CancelResponse>, Status> {
        let req = request.into_inner();
        Ok(Response::new(self.shared.cancel_ack(&req.request_id)))
    }
}

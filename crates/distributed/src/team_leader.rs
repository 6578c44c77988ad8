//! Team-leader node.
//!
//! Serves `Delegate` by concatenating two sub-streams onto one upward
//! stream: first the chunks of its own partition, then, sequentially and
//! in configured order, every chunk forwarded from each of its workers.
//! Worker failures are logged and absorbed; an upward write failure stops
//! everything, including workers not yet contacted.

use std::sync::Arc;

use fq_common::{FqError, ProcessConfig};
use fq_coordination::StatusBoard;
use fq_storage::FireDataLoader;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Response, Status};
use tracing::{info, warn};

use crate::grpc::{
    decode_query, encode_query, filter_from_query, to_status, v1, ChunkStream, FireQuery,
    FireQueryClient,
};
use crate::node::{emit_partition_chunks, local_dates, NodeShared};

/// Chunks buffered ahead of the transport before the producer blocks.
const STREAM_BUFFER: usize = 8;

/// Team-leader-role service implementation.
pub struct TeamLeaderService {
    shared: Arc<NodeShared>,
    loader: FireDataLoader,
    workers: Vec<(String, FireQueryClient<Channel>)>,
}

impl TeamLeaderService {
    /// Builds the service and lazy client stubs for every worker edge.
    pub fn new(config: ProcessConfig, board: StatusBoard) -> fq_common::Result<TeamLeaderService> {
        let loader = FireDataLoader::new(&config.data_path)?;
        let mut workers = Vec::new();
        for edge in config.edges_with_relationship("worker") {
            let endpoint = Endpoint::from_shared(format!("http://{}", edge.target()))
                .map_err(|e| FqError::InvalidConfig(format!("bad worker endpoint {}: {e}", edge.target())))?;
            workers.push((edge.to.clone(), FireQueryClient::new(endpoint.connect_lazy())));
            info!(worker = %edge.to, target = %edge.target(), "configured worker edge");
        }
        Ok(TeamLeaderService {
            shared: Arc::new(NodeShared::new(config, board)),
            loader,
            workers,
        })
    }

    /// Shared node state (exposed for tests).
    pub fn shared(&self) -> &Arc<NodeShared> {
        &self.shared
    }
}

/// Forwards one worker's delegated stream onto the upward stream.
///
/// Returns `Ok(forwarded_chunks)` when the worker stream ended (cleanly or
/// with an absorbed error) and `Err(())` when the upward write failed.
async fn forward_worker_stream(
    worker_id: &str,
    mut client: FireQueryClient<Channel>,
    delegation: v1::DelegationRequest,
    tx: &mpsc::Sender<Result<v1::Chunk, Status>>,
) -> Result<u64, ()> {
    let request_id = delegation.request_id.clone();
    let mut stream = match client.delegate(delegation).await {
        Ok(response) => response.into_inner(),
        Err(status) => {
            warn!(worker = %worker_id, request_id = %request_id, status = %status, "worker delegation failed");
            return Ok(0);
        }
    };

    let mut forwarded = 0u64;
    loop {
        match stream.message().await {
            Ok(Some(chunk)) => {
                // Producer identity and numbering pass through untouched;
                // global renumbering happens at the root.
                if tx.send(Ok(chunk)).await.is_err() {
                    return Err(());
                }
                forwarded += 1;
            }
            Ok(None) => return Ok(forwarded),
            Err(status) => {
                warn!(worker = %worker_id, request_id = %request_id, status = %status, "worker stream error");
                return Ok(forwarded);
            }
        }
    }
}

#[tonic::async_trait]
impl FireQuery for TeamLeaderService {
    type QueryStream = ChunkStream;

    async fn query(
        &self,
        _request: Request<v1::QueryRequest>,
    ) -> Result<Response<Self::QueryStream>, Status> {
        Err(Status::unimplemented("team leaders don't accept direct queries"))
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
        self.shared.begin_request();

        let config = self.shared.config();
        let dates = local_dates(
            &config.data_partitioning.owned_dates,
            &query.date_start,
            &query.date_end,
        );
        let records = if dates.is_empty() {
            Vec::new()
        } else {
            match self.loader.load(&dates, &filter_from_query(&query)) {
                Ok(records) => records,
                Err(e) => {
                    self.shared.finish_request(false);
                    return Err(to_status(e));
                }
            }
        };
        info!(
            request_id = %req.request_id,
            process = %self.shared.process_id(),
            dates = dates.len(),
            records = records.len(),
            "loaded local partition"
        );

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let shared = Arc::clone(&self.shared);
        let workers = self.workers.clone();
        let chunk_size = config.chunk_config.default_chunk_size;
        let request_id = req.request_id.clone();
        let original_query = encode_query(&query);

        tokio::spawn(async move {
            let process_id = shared.process_id().to_string();

            // Own partition first; an upward write failure means the caller
            // is gone, so workers are never contacted.
            let local = emit_partition_chunks(
                &request_id,
                &process_id,
                records,
                chunk_size,
                None,
                &tx,
                |_, _| {},
            )
            .await;
            if let Err((chunk_number, _)) = local {
                warn!(request_id = %request_id, process = %process_id, chunk_number, "failed to write local chunk");
                shared.finish_request(false);
                return;
            }

            for (worker_id, client) in workers {
                let delegation = v1::DelegationRequest {
                    request_id: request_id.clone(),
                    delegating_process: process_id.clone(),
                    original_query: original_query.clone(),
                };
                info!(request_id = %request_id, worker = %worker_id, "delegating to worker");
                match forward_worker_stream(&worker_id, client, delegation, &tx).await {
                    Ok(forwarded) => {
                        info!(request_id = %request_id, worker = %worker_id, forwarded, "worker stream drained");
                    }
                    Err(()) => {
                        warn!(request_id = %request_id, process = %process_id, "failed to forward worker chunk");
                        shared.finish_request(false);
                        return;
                    }
                }
            }

            info!(request_id = %request_id, process = %process_id, "delegation complete");
            shared.finish_request(true);
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

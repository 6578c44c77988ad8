//! Root leader: client-facing query surface and the fan-out multiplexer.
//!
//! For each query the leader opens one `Delegate` stream per selected team
//! in parallel. A dedicated reader task per team pulls chunks into a
//! bounded buffer (capacity [`TEAM_BUFFER_CAPACITY`]); a full buffer blocks
//! the reader, which is the backpressure path toward the team leader. One
//! multiplexer task owns the upward stream and scans the buffers round-robin,
//! relaying at most one chunk per team per scan, renumbering chunks into a
//! single dense sequence, and closing with a final sentinel chunk carrying
//! the totals.
//!
//! Cancellation is two-part: a per-query token observed by every reader,
//! plus closing the per-team buffers so a reader blocked on a full buffer
//! wakes immediately. Reader tasks are joined on every exit path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fq_common::{metrics, FqError, ProcessConfig, Team};
use fq_coordination::StatusBoard;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Response, Status};
use tracing::{debug, info, warn};

use crate::grpc::{encode_query, v1, validate_query, ChunkStream, FireQuery, FireQueryClient};
use crate::node::NodeShared;

/// Bounded per-team buffer capacity, in chunks.
pub const TEAM_BUFFER_CAPACITY: usize = 32;

/// Longest the multiplexer waits on a single team per scan.
const SCAN_POLL_WAIT: Duration = Duration::from_millis(2);

/// Sleep between scans when no team yielded a chunk.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Picks the sub-trees a query fans out to.
///
/// Injected into [`LeaderService`] so routing policy can change without
/// touching the multiplexer.
pub trait TeamSelector: Send + Sync {
    /// Teams to delegate to, in scan order.
    fn select(&self, query: &v1::QueryRequest) -> Vec<Team>;
}

/// Shipped policy: every query fans out to both teams, green first.
///
/// The least-loaded reading from the status board is consulted for
/// telemetry only; partitions are disjoint, so both teams must run for a
/// complete answer.
#[derive(Debug, Default)]
pub struct BothTeamsSelector;

impl TeamSelector for BothTeamsSelector {
    fn select(&self, _query: &v1::QueryRequest) -> Vec<Team> {
        vec![Team::Green, Team::Pink]
    }
}

/// One team's leg of an in-flight fan-out.
struct TeamFeed {
    team: Team,
    peer: String,
    rx: mpsc::Receiver<v1::Chunk>,
    reader: Option<JoinHandle<Status>>,
    done: bool,
    relayed_chunks: u64,
}

/// Leader-role service implementation.
pub struct LeaderService {
    shared: Arc<NodeShared>,
    selector: Arc<dyn TeamSelector>,
    team_leaders: HashMap<Team, (String, FireQueryClient<Channel>)>,
}

impl LeaderService {
    /// Builds the service with the shipped both-teams selector.
    pub fn new(config: ProcessConfig, board: StatusBoard) -> fq_common::Result<LeaderService> {
        Self::with_selector(config, board, Arc::new(BothTeamsSelector))
    }

    /// Builds the service with an injected team-selection policy.
    pub fn with_selector(
        config: ProcessConfig,
        board: StatusBoard,
        selector: Arc<dyn TeamSelector>,
    ) -> fq_common::Result<LeaderService> {
        let mut team_leaders = HashMap::new();
        for edge in config.edges_with_relationship("team_leader") {
            let endpoint = Endpoint::from_shared(format!("http://{}", edge.target())).map_err(|e| {
                FqError::InvalidConfig(format!("bad team leader endpoint {}: {e}", edge.target()))
            })?;
            team_leaders.insert(
                edge.team,
                (edge.to.clone(), FireQueryClient::new(endpoint.connect_lazy())),
            );
            info!(team = %edge.team.as_str(), peer = %edge.to, target = %edge.target(), "configured team leader edge");
        }
        Ok(LeaderService {
            shared: Arc::new(NodeShared::new(config, board)),
            selector,
            team_leaders,
        })
    }

    /// Shared node state (exposed for tests).
    pub fn shared(&self) -> &Arc<NodeShared> {
        &self.shared
    }
}

/// Opens one team's `Delegate` stream and pumps it into a bounded buffer.
///
/// The reader's life cycle is opening, reading, draining: it exits on
/// end-of-stream, on a stream error, or as soon as `cancel` fires, and its
/// terminal status is returned through the join handle. Dropping the
/// buffer sender is what marks the feed finished for the multiplexer.
fn spawn_team_reader(
    team: Team,
    peer: String,
    mut client: FireQueryClient<Channel>,
    delegation: v1::DelegationRequest,
    cancel: CancellationToken,
) -> TeamFeed {
    let (tx, rx) = mpsc::channel(TEAM_BUFFER_CAPACITY);
    let reader = tokio::spawn(async move {
        let mut stream = tokio::select! {
            _ = cancel.cancelled() => return Status::cancelled("query cancelled"),
            opened = client.delegate(delegation) => match opened {
                Ok(response) => response.into_inner(),
                Err(status) => return status,
            },
        };

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => return Status::cancelled("query cancelled"),
                message = stream.message() => message,
            };
            match message {
                Ok(Some(chunk)) => {
                    // A full buffer parks the reader here; that stall is the
                    // backpressure toward the team leader.
                    tokio::select! {
                        _ = cancel.cancelled() => return Status::cancelled("query cancelled"),
                        sent = tx.send(chunk) => {
                            if sent.is_err() {
                                return Status::cancelled("query cancelled");
                            }
                        }
                    }
                }
                Ok(None) => return Status::new(Code::Ok, "team stream complete"),
                Err(status) => return status,
            }
        }
    });

    TeamFeed {
        team,
        peer,
        rx,
        reader: Some(reader),
        done: false,
        relayed_chunks: 0,
    }
}

/// The multiplexing loop: one task per query, owner of the upward stream.
async fn run_fanout(
    shared: Arc<NodeShared>,
    request_id: String,
    mut feeds: Vec<TeamFeed>,
    cancel: CancellationToken,
    client_tx: mpsc::Sender<Result<v1::Chunk, Status>>,
) {
    let leader_id = shared.process_id().to_string();
    let mut next_chunk_id: i32 = 0;
    let mut total_records: i64 = 0;
    let mut client_gone = false;
    let mut was_idle = false;

    'mux: while feeds.iter().any(|feed| !feed.done) {
        if client_tx.is_closed() {
            client_gone = true;
            break 'mux;
        }

        // One chunk per team per scan; draining a team here would starve
        // the others.
        let mut yielded = false;
        for feed in feeds.iter_mut() {
            if feed.done {
                continue;
            }
            match tokio::time::timeout(SCAN_POLL_WAIT, feed.rx.recv()).await {
                Ok(Some(chunk)) => {
                    yielded = true;
                    let records_len = chunk.records.len();
                    let source = chunk.source_process.clone();
                    let upward = v1::Chunk {
                        request_id: request_id.clone(),
                        chunk_number: next_chunk_id,
                        total_chunks: -1,
                        is_final: false,
                        total_records: 0,
                        source_process: source.clone(),
                        records: chunk.records,
                    };
                    if client_tx.send(Ok(upward)).await.is_err() {
                        client_gone = true;
                        break 'mux;
                    }
                    metrics::log_event(
                        "CHUNK_RELAY",
                        &request_id,
                        shared.pending(),
                        1,
                        next_chunk_id as i64,
                        records_len as i64,
                        &source,
                    );
                    feed.relayed_chunks += 1;
                    total_records += records_len as i64;
                    next_chunk_id += 1;
                }
                Ok(None) => {
                    feed.done = true;
                    metrics::log_event(
                        "TEAM_FINISH",
                        &request_id,
                        shared.pending(),
                        1,
                        -1,
                        -1,
                        feed.team.as_str(),
                    );
                    debug!(
                        request_id = %request_id,
                        team = %feed.team.as_str(),
                        chunks = feed.relayed_chunks,
                        "team stream finished"
                    );
                }
                Err(_elapsed) => {}
            }
        }

        if !yielded && feeds.iter().any(|feed| !feed.done) {
            if !was_idle {
                metrics::log_event(
                    "NO_DATA_ROUND",
                    &request_id,
                    shared.pending(),
                    1,
                    -1,
                    -1,
                    "all teams idle",
                );
            }
            was_idle = true;
            tokio::time::sleep(IDLE_SLEEP).await;
        } else {
            was_idle = false;
        }
    }

    if client_gone {
        warn!(request_id = %request_id, "client disconnected during streaming");
        metrics::log_event(
            "CLIENT_DISCONNECT",
            &request_id,
            shared.pending(),
            1,
            next_chunk_id as i64,
            -1,
            "client disconnected during streaming",
        );
        cancel.cancel();
    }

    // Unblock readers parked on a full buffer, then join every one of
    // them; the same path runs on success, disconnect, and team failure.
    for feed in feeds.iter_mut() {
        feed.rx.close();
    }
    for feed in feeds.iter_mut() {
        let Some(reader) = feed.reader.take() else {
            continue;
        };
        match reader.await {
            Ok(status) if matches!(status.code(), Code::Ok | Code::Cancelled) => {
                debug!(
                    request_id = %request_id,
                    team = %feed.team.as_str(),
                    code = ?status.code(),
                    "team reader joined"
                );
            }
            Ok(status) => {
                // A failed sub-tree costs its remaining data, nothing more.
                warn!(
                    request_id = %request_id,
                    team = %feed.team.as_str(),
                    peer = %feed.peer,
                    status = %status,
                    "team leader returned error"
                );
            }
            Err(join_error) => {
                warn!(
                    request_id = %request_id,
                    team = %feed.team.as_str(),
                    error = %join_error,
                    "team reader task failed"
                );
            }
        }
    }

    if client_gone {
        shared.finish_request(false);
        return;
    }

    let sentinel = v1::Chunk {
        request_id: request_id.clone(),
        chunk_number: next_chunk_id,
        total_chunks: next_chunk_id + 1,
        is_final: true,
        total_records: total_records as i32,
        source_process: leader_id,
        records: Vec::new(),
    };
    if client_tx.send(Ok(sentinel)).await.is_err() {
        warn!(request_id = %request_id, "client disconnected on final chunk");
        metrics::log_event(
            "CLIENT_DISCONNECT_FINAL",
            &request_id,
            shared.pending(),
            1,
            next_chunk_id as i64,
            total_records,
            "client disconnected on final chunk",
        );
        shared.finish_request(false);
        return;
    }

    metrics::log_event(
        "FINAL_CHUNK",
        &request_id,
        shared.pending(),
        1,
        next_chunk_id as i64,
        total_records,
        "final from leader",
    );
    metrics::log_event(
        "FINISH",
        &request_id,
        shared.pending(),
        1,
        -1,
        total_records,
        "query complete at leader",
    );
    info!(
        request_id = %request_id,
        chunks = next_chunk_id + 1,
        total_records,
        "query complete"
    );
    shared.finish_request(true);
}

#[tonic::async_trait]
impl FireQuery for LeaderService {
    type QueryStream = ChunkStream;

    async fn query(
        &self,
        request: Request<v1::QueryRequest>,
    ) -> Result<Response<Self::QueryStream>, Status> {
        let query = request.into_inner();
        validate_query(&query)?;

        info!(
            request_id = %query.request_id,
            date_start = %query.date_start,
            date_end = %query.date_end,
            pollutant = %query.pollutant_type,
            "received query"
        );

        let pending = self.shared.begin_request();
        metrics::log_event(
            "ENQUEUE",
            &query.request_id,
            pending,
            1,
            -1,
            -1,
            "received at leader",
        );

        // Advisory routing hint; the shipped selector fans out to every
        // team regardless.
        let least_loaded = self.shared.board().least_loaded_team();
        debug!(
            request_id = %query.request_id,
            least_loaded = %least_loaded.as_str(),
            "team load hint"
        );

        let teams = self.selector.select(&query);
        metrics::log_event(
            "START_DELEGATE",
            &query.request_id,
            self.shared.pending(),
            1,
            -1,
            -1,
            "delegating to teams",
        );

        let cancel = CancellationToken::new();
        let mut feeds = Vec::with_capacity(teams.len());
        for team in teams {
            let Some((peer, client)) = self.team_leaders.get(&team) else {
                warn!(team = %team.as_str(), "no team leader configured, skipping team");
                continue;
            };
            let delegation = v1::DelegationRequest {
                request_id: query.request_id.clone(),
                delegating_process: self.shared.process_id().to_string(),
                original_query: encode_query(&query),
            };
            feeds.push(spawn_team_reader(
                team,
                peer.clone(),
                client.clone(),
                delegation,
                cancel.clone(),
            ));
        }

        let (client_tx, client_rx) = mpsc::channel(1);
        tokio::spawn(run_fanout(
            Arc::clone(&self.shared),
            query.request_id,
            feeds,
            cancel,
            client_tx,
        ));

        Ok(Response::new(Box::pin(ReceiverStream::new(client_rx))))
    }

    type DelegateStream = ChunkStream;

    async fn delegate(
        &self,
        _request: Request<v1::DelegationRequest>,
    ) -> Result<Response<Self::DelegateStream>, Status> {
        Err(Status::unimplemented("leader does not accept delegations"))
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

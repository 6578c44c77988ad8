//! Cross-process shared status board.
//!
//! Every node on a host publishes its liveness and queue depth into one
//! JSON snapshot file; the leader reads team totals when picking routing
//! telemetry. Readers may observe a slightly stale snapshot; every value
//! is an advisory hint, never an invariant.
//!
//! The leader creates the board; team leaders and workers attach to it and
//! fail startup when it is absent. Writes are serialized by an in-process
//! mutex and published with an atomic rename so a concurrent reader never
//! sees a torn snapshot.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use fq_common::{FqError, Result, Team};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// File name of the board inside the shared directory.
///
/// The numeric suffix is the rendezvous key all processes agree on, the
/// same way the original deployment agreed on one shared-memory key.
pub const STATUS_BOARD_FILE: &str = "fireq-status-2275.json";

/// Published status of one process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessStatus {
    /// Stable process id (`A`..`F`).
    pub process_id: String,
    /// Whether the process considers itself healthy.
    pub is_healthy: bool,
    /// Requests currently in flight.
    pub pending_requests: i64,
    /// Worker slots the process is serving with.
    pub active_workers: i64,
    /// Requests completed since startup.
    pub completed_requests: i64,
    /// Unix seconds of the last update.
    pub last_update_epoch: u64,
    /// Advisory CPU usage in `0.0..=1.0`.
    pub cpu_usage: f64,
    /// Advisory queue depth (mirrors pending requests).
    pub queue_depth: i64,
}

/// Aggregated status of one team.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamStatus {
    /// Team name.
    pub team: Team,
    /// Sum of members' pending requests.
    pub total_pending_requests: i64,
    /// Sum of members' active workers.
    pub total_active_workers: i64,
    /// Member statuses, one slot per process.
    pub processes: Vec<ProcessStatus>,
}

impl TeamStatus {
    fn new(team: Team) -> TeamStatus {
        TeamStatus {
            team,
            total_pending_requests: 0,
            total_active_workers: 0,
            processes: Vec::new(),
        }
    }

    fn recompute_totals(&mut self) {
        self.total_pending_requests = self.processes.iter().map(|p| p.pending_requests).sum();
        self.total_active_workers = self.processes.iter().map(|p| p.active_workers).sum();
    }
}

/// Whole-board snapshot persisted as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    /// Incremented on every published update.
    pub version: u64,
    /// Cooperative shutdown flag.
    pub shutdown_requested: bool,
    /// Green-team aggregate.
    pub green: TeamStatus,
    /// Pink-team aggregate.
    pub pink: TeamStatus,
    /// Unix seconds of the last global update.
    pub last_global_update: u64,
}

impl SystemStatus {
    fn empty() -> SystemStatus {
        SystemStatus {
            version: 0,
            shutdown_requested: false,
            green: TeamStatus::new(Team::Green),
            pink: TeamStatus::new(Team::Pink),
            last_global_update: epoch_secs(),
        }
    }

    fn team(&self, team: Team) -> &TeamStatus {
        match team {
            Team::Green => &self.green,
            Team::Pink => &self.pink,
        }
    }

    fn team_mut(&mut self, team: Team) -> &mut TeamStatus {
        match team {
            Team::Green => &mut self.green,
            Team::Pink => &mut self.pink,
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Shared advisory status surface backed by one JSON file per host.
#[derive(Debug)]
pub struct StatusBoard {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process. Cross-process
    // writers race at file granularity; last rename wins.
    write_lock: Mutex<()>,
}

impl StatusBoard {
    /// Creates (or resets) the board. Called by the leader at startup.
    pub fn create(dir: impl AsRef<Path>) -> Result<StatusBoard> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let board = StatusBoard {
            path: dir.join(STATUS_BOARD_FILE),
            write_lock: Mutex::new(()),
        };
        board.publish(&SystemStatus::empty())?;
        Ok(board)
    }

    /// Attaches to an existing board. Fails when the leader has not created it.
    pub fn attach(dir: impl AsRef<Path>) -> Result<StatusBoard> {
        let path = dir.as_ref().join(STATUS_BOARD_FILE);
        if !path.is_file() {
            return Err(FqError::Unavailable(format!(
                "status board not found at {} (is the leader running?)",
                path.display()
            )));
        }
        Ok(StatusBoard {
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// Default shared directory for boards on this host.
    pub fn default_dir() -> PathBuf {
        std::env::temp_dir()
    }

    /// Publishes a status update for one process.
    ///
    /// Failures after startup are swallowed with a warning; status is
    /// advisory and must never fail a query.
    pub fn update_process_status(
        &self,
        process_id: &str,
        pending_requests: i64,
        active_workers: i64,
        completed_requests: i64,
        cpu_usage: f64,
    ) {
        let Some(team) = Team::of_process(process_id) else {
            warn!(process_id, "process id maps to no team, dropping status update");
            return;
        };

        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut status = self.snapshot().unwrap_or_else(|_| SystemStatus::empty());

        status.version += 1;
        let now = epoch_secs();
        status.last_global_update = now;

        let members = &mut status.team_mut(team).processes;
        let entry = match members.iter_mut().find(|p| p.process_id == process_id) {
            Some(existing) => existing,
            None => {
                members.push(ProcessStatus {
                    process_id: process_id.to_string(),
                    is_healthy: true,
                    pending_requests: 0,
                    active_workers: 0,
                    completed_requests: 0,
                    last_update_epoch: now,
                    cpu_usage: 0.0,
                    queue_depth: 0,
                });
                members.last_mut().expect("just pushed")
            }
        };
        entry.is_healthy = true;
        entry.pending_requests = pending_requests;
        entry.active_workers = active_workers;
        entry.completed_requests = completed_requests;
        entry.last_update_epoch = now;
        entry.cpu_usage = cpu_usage;
        entry.queue_depth = pending_requests;

        status.team_mut(team).recompute_totals();

        if let Err(e) = self.publish(&status) {
            warn!(error = %e, "failed to publish status update");
        }
    }

    /// Pending-request total for a team. Advisory; may be stale.
    pub fn team_load(&self, team: Team) -> i64 {
        self.snapshot()
            .map(|s| s.team(team).total_pending_requests)
            .unwrap_or(0)
    }

    /// Team with the lowest pending-request total; ties go green.
    pub fn least_loaded_team(&self) -> Team {
        match self.snapshot() {
            Ok(s) if s.green.total_pending_requests > s.pink.total_pending_requests => Team::Pink,
            _ => Team::Green,
        }
    }

    /// Whether a cooperative shutdown has been requested.
    pub fn is_shutdown_requested(&self) -> bool {
        self.snapshot().map(|s| s.shutdown_requested).unwrap_or(false)
    }

    /// Raises the cooperative shutdown flag.
    pub fn request_shutdown(&self) {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut status = self.snapshot().unwrap_or_else(|_| SystemStatus::empty());
        status.shutdown_requested = true;
        status.version += 1;
        if let Err(e) = self.publish(&status) {
            warn!(error = %e, "failed to publish shutdown request");
        }
    }

    /// Reads the latest snapshot.
    pub fn snapshot(&self) -> Result<SystemStatus> {
        let content = std::fs::read_to_string(&self.path)?;
        serde_json::from_str(&content)
            .map_err(|e| FqError::Unavailable(format!("unreadable status board: {e}")))
    }

    fn publish(&self, status: &SystemStatus) -> Result<()> {
        let serialized = serde_json::to_vec_pretty(status)
            .map_err(|e| FqError::Unavailable(format!("status board encode failed: {e}")))?;
        let tmp = self.path.with_extension(format!("tmp.{}", std::process::id()));
        std::fs::write(&tmp, serialized)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_fails_before_create() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            StatusBoard::attach(dir.path()),
            Err(FqError::Unavailable(_))
        ));
    }

    #[test]
    fn create_then_attach_shares_state() {
        let dir = tempfile::tempdir().unwrap();
        let leader_board = StatusBoard::create(dir.path()).unwrap();
        let worker_board = StatusBoard::attach(dir.path()).unwrap();

        worker_board.update_process_status("B", 3, 1, 0, 0.25);
        let snapshot = leader_board.snapshot().unwrap();
        assert_eq!(snapshot.green.total_pending_requests, 3);
        assert_eq!(snapshot.green.processes.len(), 1);
        assert_eq!(snapshot.green.processes[0].process_id, "B");
        assert_eq!(snapshot.green.processes[0].queue_depth, 3);
    }

    #[test]
    fn updates_replace_existing_entries() {
        let dir = tempfile::tempdir().unwrap();
        let board = StatusBoard::create(dir.path()).unwrap();

        board.update_process_status("D", 5, 1, 0, 0.0);
        board.update_process_status("D", 1, 1, 4, 0.0);

        let snapshot = board.snapshot().unwrap();
        assert_eq!(snapshot.pink.processes.len(), 1);
        assert_eq!(snapshot.pink.total_pending_requests, 1);
        assert_eq!(snapshot.pink.processes[0].completed_requests, 4);
    }

    #[test]
    fn least_loaded_team_reads_totals() {
        let dir = tempfile::tempdir().unwrap();
        let board = StatusBoard::create(dir.path()).unwrap();
        assert_eq!(board.least_loaded_team(), Team::Green);

        board.update_process_status("A", 9, 1, 0, 0.0);
        board.update_process_status("D", 2, 1, 0, 0.0);
        assert_eq!(board.least_loaded_team(), Team::Pink);
        assert_eq!(board.team_load(Team::Green), 9);
    }

    #[test]
    fn shutdown_flag_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let board = StatusBoard::create(dir.path()).unwrap();
        assert!(!board.is_shutdown_requested());
        board.request_shutdown();
        assert!(board.is_shutdown_requested());
    }

    #[test]
    fn unknown_process_id_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let board = StatusBoard::create(dir.path()).unwrap();
        board.update_process_status("Z", 1, 1, 0, 0.0);
        let snapshot = board.snapshot().unwrap();
        assert!(snapshot.green.processes.is_empty());
        assert!(snapshot.pink.processes.is_empty());
    }
}

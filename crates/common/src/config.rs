use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FqError, Result};

/// Role a process plays in the static query tree.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Root of the tree; accepts client queries and fans out to teams.
    Leader,
    /// Owns a partition and delegates to the workers of its team.
    TeamLeader,
    /// Terminal node; only serves its own partition.
    Worker,
}

impl Role {
    /// Lowercase name used in log file names and event rows.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Leader => "leader",
            Role::TeamLeader => "team_leader",
            Role::Worker => "worker",
        }
    }
}

/// Static team grouping. The tree has exactly two teams.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Team {
    /// Processes A..C.
    Green,
    /// Processes D..F.
    Pink,
}

impl Team {
    /// Lowercase team name as written in config files and telemetry.
    pub fn as_str(self) -> &'static str {
        match self {
            Team::Green => "green",
            Team::Pink => "pink",
        }
    }

    /// Team owning a given process id (A..C green, D..F pink).
    pub fn of_process(process_id: &str) -> Option<Team> {
        match process_id {
            "A" | "B" | "C" => Some(Team::Green),
            "D" | "E" | "F" => Some(Team::Pink),
            _ => None,
        }
    }
}

impl std::str::FromStr for Team {
    type Err = FqError;

    fn from_str(s: &str) -> Result<Team> {
        match s {
            "green" => Ok(Team::Green),
            "pink" => Ok(Team::Pink),
            other => Err(FqError::InvalidConfig(format!("unknown team: {other}"))),
        }
    }
}

/// Outgoing edge of the static topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    /// Peer process id.
    pub to: String,
    /// Peer host.
    pub host: String,
    /// Peer port.
    pub port: u16,
    /// Relationship of the peer to this node (`team_leader` or `worker`).
    pub relationship: String,
    /// Team the peer belongs to.
    pub team: Team,
}

impl EdgeConfig {
    /// `host:port` dial target for this edge.
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Chunking behavior for streamed record batches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Records per chunk a node emits from its own partition.
    pub default_chunk_size: usize,
    /// Upper bound accepted from client requests.
    pub max_chunk_size: usize,
    /// Lower bound accepted from client requests.
    pub min_chunk_size: usize,
}

/// Date-key partition owned by this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPartitioning {
    /// Partitioning strategy label (informational; only `by_date` is shipped).
    pub strategy: String,
    /// `YYYYMMDD` date keys this node is authoritative for.
    pub owned_dates: Vec<String>,
}

/// Per-process configuration loaded from the positional config-file argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Stable process id (`A`..`F`).
    pub process_id: String,
    /// Tree role of this process.
    pub role: Role,
    /// Listen host.
    pub listen_host: String,
    /// Listen port.
    pub listen_port: u16,
    /// Root directory of the partitioned CSV dataset.
    pub data_path: String,
    /// Team membership; the leader has none.
    #[serde(default, deserialize_with = "empty_team_as_none")]
    pub team: Option<Team>,
    /// Whether this process leads its team.
    #[serde(default)]
    pub is_team_leader: bool,
    /// Outgoing call edges in configured (stable) order.
    #[serde(default)]
    pub edges: Vec<EdgeConfig>,
    /// Owned date partition.
    pub data_partitioning: DataPartitioning,
    /// Chunking behavior.
    pub chunk_config: ChunkConfig,
}

/// Accepts `"green"`, `"pink"`, `""`, or an absent field.
fn empty_team_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<Team>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    match raw.as_deref() {
        None | Some("") => Ok(None),
        Some("green") => Ok(Some(Team::Green)),
        Some("pink") => Ok(Some(Team::Pink)),
        Some(other) => Err(serde::de::Error::custom(format!("unknown team: {other}"))),
    }
}

impl ProcessConfig {
    /// Load and validate a config file, applying the `FIRE_DATA_PATH` override.
    pub fn load(path: impl AsRef<Path>) -> Result<ProcessConfig> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            FqError::InvalidConfig(format!("failed to read config file {}: {e}", path.display()))
        })?;
        let mut config: ProcessConfig = serde_json::from_str(&content)
            .map_err(|e| FqError::InvalidConfig(format!("failed to parse {}: {e}", path.display())))?;

        if let Ok(env_path) = std::env::var("FIRE_DATA_PATH") {
            if !env_path.is_empty() {
                tracing::info!(data_path = %env_path, "using data path from FIRE_DATA_PATH");
                config.data_path = env_path;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Sanity-check invariants a node relies on at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.process_id.is_empty() {
            return Err(FqError::InvalidConfig("process_id must not be empty".to_string()));
        }
        if self.listen_port == 0 {
            return Err(FqError::InvalidConfig("listen_port must be non-zero".to_string()));
        }
        let chunks = &self.chunk_config;
        if chunks.default_chunk_size < 1 || chunks.min_chunk_size < 1 {
            return Err(FqError::InvalidConfig("chunk sizes must be >= 1".to_string()));
        }
        if chunks.max_chunk_size < chunks.min_chunk_size {
            return Err(FqError::InvalidConfig(
                "max_chunk_size must be >= min_chunk_size".to_string(),
            ));
        }
        Ok(())
    }

    /// Socket address this node listens on.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.listen_host, self.listen_port)
            .parse()
            .map_err(|e| FqError::InvalidConfig(format!("bad listen address: {e}")))
    }

    /// Edges with the given relationship, preserving configured order.
    pub fn edges_with_relationship(&self, relationship: &str) -> Vec<&EdgeConfig> {
        self.edges
            .iter()
            .filter(|e| e.relationship == relationship)
            .collect()
    }

    /// The team-leader edge for a team, if configured.
    pub fn team_leader_for(&self, team: Team) -> Option<&EdgeConfig> {
        self.edges
            .iter()
            .find(|e| e.team == team && e.relationship == "team_leader")
    }
}

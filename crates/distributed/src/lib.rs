//! FireQuery node runtimes.
//!
//! Architecture role:
//! - tonic-generated RPC types and client/server glue
//! - per-node request bookkeeping shared by every role
//! - the three service implementations: worker, team leader, and the
//!   fan-out leader (the streaming multiplexer)
//!
//! Key modules:
//! - [`grpc`]
//! - [`node`]
//! - [`worker`]
//! - [`team_leader`]
//! - [`leader`]

pub mod grpc;
pub mod leader;
pub mod node;
pub mod team_leader;
pub mod worker;

pub use leader::{BothTeamsSelector, LeaderService, TeamSelector};
pub use node::NodeShared;
pub use team_leader::TeamLeaderService;
pub use worker::WorkerService;

use fq_common::{metrics, ProcessConfig, Role};
use fq_coordination::StatusBoard;
use fq_distributed::grpc::FireQueryServer;
use fq_distributed::TeamLeaderService;
use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let Some(config_path) = std::env::args().nth(1) else {
        eprintln!("Usage: fq-team-leader <config_file>");
        std::process::exit(1);
    };

    let config = ProcessConfig::load(&config_path)?;
    if config.role != Role::TeamLeader {
        return Err(format!("config role is {:?}, expected team_leader", config.role).into());
    }

    metrics::init_with_dir("logs", &config.process_id, config.role.as_str());

    let board = StatusBoard::attach(StatusBoard::default_dir())?;

    let addr = config.listen_addr()?;
    tracing::info!(
        process = %config.process_id,
        team = config.team.map(|t| t.as_str()).unwrap_or(""),
        listen = %addr,
        owned_dates = config.data_partitioning.owned_dates.len(),
        "team leader starting"
    );

    let service = TeamLeaderService::new(config, board)?;
    Server::builder()
        .add_service(FireQueryServer::new(service))
        .serve(addr)
        .await?;

    metrics::shutdown();
    Ok(())
}

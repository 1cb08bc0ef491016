//! DPGO Node binary
//!
//! Runs a simulated team through one distributed optimization run.

use dpgo_node::{Fleet, NodeConfig};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dpgo_node=info,dpgo=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = NodeConfig::from_env()?;
    info!(
        robots = config.num_robots,
        update_rule = %config.update_rule,
        asynchronous = config.asynchronous,
        max_iterations = config.max_iterations,
        "Starting DPGO node"
    );

    if let Some(dir) = &config.iteration_log {
        std::fs::create_dir_all(dir)?;
    }

    let fleet = Fleet::launch(&config.fleet()?)?;

    tokio::select! {
        finished = fleet.wait_until_terminated(config.run_timeout) => {
            if finished {
                info!("Run finished");
            } else {
                warn!(timeout = ?config.run_timeout, "Run did not finish in time");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
        }
    }

    for coordinator in fleet.shutdown().await? {
        let poses = coordinator.trajectory().map(|t| t.len()).unwrap_or(0);
        info!(
            robot = %coordinator.id(),
            mode = %coordinator.mode(),
            local_iterations = coordinator.local_iteration(),
            objective = ?coordinator.objective(),
            poses,
            "Final state"
        );
    }

    Ok(())
}

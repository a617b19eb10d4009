//! pd-operator - A Kubernetes operator for managing PD clusters.
//!
//! Only the replica holding the leader lease runs the controller. Every
//! replica serves the health and metrics endpoints.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tracing::{error, info, warn};

use pd_operator::health::{HealthState, run_health_server};
use pd_operator::{LeaseConfig, OperatorConfig, run_controller};

/// Grace period for in-flight reconciliations to complete during shutdown
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Health, readiness and metrics endpoint
const HEALTH_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 8080);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pd_operator=info".parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .json()
        .init();

    let config = OperatorConfig::from_env()?;
    let lease = LeaseConfig::from_env();
    info!(
        holder_id = %lease.holder_id,
        lease = %format!("{}/{}", lease.namespace, lease.lease_name),
        watch_namespace = config.watch_namespace.as_deref().unwrap_or("*"),
        "Starting pd-operator"
    );

    let client = Client::try_default().await?;
    let health_state = Arc::new(HealthState::new());

    // Probes answer while this replica is still a follower
    let health_handle = {
        let health_state = health_state.clone();
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, SocketAddr::from(HEALTH_ADDR)).await {
                error!("Health server error: {}", e);
            }
        })
    };

    let lock = lease_lock(client.clone(), &lease);
    tokio::select! {
        () = acquire_leadership(&lock, &lease, &config) => {}
        _ = shutdown_signal() => {
            info!("Received shutdown signal before acquiring leadership");
            return Ok(());
        }
    }

    let renewal_handle = tokio::spawn(renew_leadership(lock, lease.renew_interval));

    let controller_handle = {
        let health_state = health_state.clone();
        tokio::spawn(async move {
            if let Err(e) = run_controller(client, config, Some(health_state)).await {
                error!("Controller failed to start: {}", e);
            }
        })
    };

    tokio::select! {
        result = controller_handle => {
            if let Err(e) = result {
                error!("Controller task panicked: {}", e);
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!("Health server task panicked: {}", e);
            }
        }
        // Renewal only returns by exiting the process, so this is a panic
        Err(e) = renewal_handle => {
            error!("Lease renewal task panicked: {}", e);
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, draining in-flight PD syncs");
            health_state.set_ready(false).await;
            tokio::time::sleep(SHUTDOWN_GRACE_PERIOD).await;
        }
    }

    info!("Operator stopped");
    Ok(())
}

fn lease_lock(client: Client, lease: &LeaseConfig) -> LeaseLock {
    LeaseLock::new(
        client,
        &lease.namespace,
        LeaseLockParams {
            holder_id: lease.holder_id.clone(),
            lease_name: lease.lease_name.clone(),
            lease_ttl: lease.ttl,
        },
    )
}

/// Block until this replica holds the lease.
async fn acquire_leadership(lock: &LeaseLock, lease: &LeaseConfig, config: &OperatorConfig) {
    loop {
        match lock.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {
                info!(
                    holder_id = %lease.holder_id,
                    auto_failover = config.auto_failover,
                    failover_period_secs = config.failover_period.as_secs(),
                    pd_timeout_secs = config.pd_timeout.as_secs(),
                    "Acquired leadership, reconciling PD clusters"
                );
                return;
            }
            Ok(_) => info!(lease = %lease.lease_name, "Another replica leads, waiting"),
            Err(e) => warn!("Failed to acquire lease: {}, retrying", e),
        }
        tokio::time::sleep(lease.renew_interval).await;
    }
}

/// Renew the lease forever, exiting the process once it is lost so the pod
/// restarts and rejoins the election as a follower.
#[allow(clippy::exit)]
async fn renew_leadership(lock: LeaseLock, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        match lock.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {}
            Ok(_) => {
                error!("Lost leadership, shutting down");
                std::process::exit(1);
            }
            Err(e) => {
                error!("Failed to renew lease: {}, shutting down", e);
                std::process::exit(1);
            }
        }
    }
}

/// Wait for SIGTERM or SIGINT.
///
/// Failing to install a handler is fatal.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use slidegate::config::GatewayConfig;
use slidegate::launcher::CommandLauncher;
use slidegate::port_alloc::PortAllocator;
use slidegate::proxy::ProxyGateway;
use slidegate::reaper::IdleReaper;
use slidegate::resolver::{FsProjectResolver, ProjectResolver};
use slidegate::routes;
use slidegate::state::AppState;
use slidegate::supervisor::ProcessSupervisor;

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = GatewayConfig::from_env()?;

    let resolver: Arc<dyn ProjectResolver> = match &config.projects_manifest {
        Some(manifest) => {
            Arc::new(FsProjectResolver::with_manifest(&config.projects_root, manifest).await?)
        }
        None => Arc::new(FsProjectResolver::new(&config.projects_root)),
    };

    let ports = PortAllocator::new(config.port_range.clone(), config.os_probe);
    let launcher = CommandLauncher::new(config.template.clone(), config.public_prefix.clone());
    let supervisor = ProcessSupervisor::new(ports, Arc::new(launcher), config.supervisor());

    IdleReaper::new(supervisor.clone(), config.idle_ttl, config.reap_interval).spawn();

    let gateway = ProxyGateway::new(supervisor.clone(), resolver)?;
    let app = routes::router(AppState::new(gateway), &config.public_prefix);

    let addr = config.listen;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(
        %addr,
        prefix = %config.public_prefix,
        ports = ?config.port_range,
        projects_root = %config.projects_root.display(),
        "slidegate HTTP listening"
    );

    let draining = supervisor.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        tracing::info!("shutdown requested");
        // Dev servers go first so relayed websockets close and the drain ends.
        draining.shutdown_all().await;
    })
    .await?;

    supervisor.shutdown_all().await;
    tracing::info!("slidegate stopped");
    Ok(())
}

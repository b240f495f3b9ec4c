use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use comet::auth::{AllowAll, JwtAuthenticator, StaticWhitelist, Whitelist};
use comet::config::Config;
use comet::discovery::{self, Discovery, HttpDiscovery, Instance, NoopDiscovery};
use comet::gateway::lifecycle::{self, Lifecycle};
use comet::gateway::listener::Listeners;
use comet::gateway::upstream::LogUpstream;
use comet::gateway::{Server, Transport};
use comet::AppState;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing; env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    let listed = StaticWhitelist::new(config.whitelist.iter().cloned());
    let whitelist: Arc<dyn Whitelist> = if listed.is_empty() {
        Arc::new(AllowAll)
    } else {
        tracing::info!(users = listed.len(), "whitelist enabled");
        Arc::new(listed)
    };
    let server = Arc::new(Server::new(
        config.gateway.clone(),
        Arc::new(JwtAuthenticator::new(&config.jwt_secret)),
        whitelist,
        Arc::new(LogUpstream),
    ));
    tracing::info!(
        buckets = server.buckets().len(),
        policy = ?config.gateway.connection_policy,
        "comet configured"
    );

    // Client listeners. A bind or TLS failure aborts startup.
    let listeners = Listeners::bind(&config)
        .await
        .unwrap_or_else(|e| panic!("failed to start client listeners: {e}"));
    let tcp_addr = listeners.local_addr(Transport::Tcp);
    let ws_addr = listeners.local_addr(Transport::WebSocket);
    let wss_addr = listeners.local_addr(Transport::WebSocketTls);
    listeners.spawn(server.clone());

    // Control plane.
    let control = CancellationToken::new();
    let app = comet::routes::router()
        .layer(TraceLayer::new_for_http())
        .with_state(AppState::new(server.clone()));
    let control_listener = tokio::net::TcpListener::bind(config.control_bind)
        .await
        .expect("failed to bind control plane");
    tracing::info!(addr = %config.control_bind, "control plane listening");
    let control_task = {
        let token = control.clone();
        tokio::spawn(async move {
            axum::serve(control_listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
        })
    };

    // Service directory. Without a URL the no-op client keeps the same flow.
    let directory: Arc<dyn Discovery> = match &config.discovery.url {
        Some(url) => Arc::new(HttpDiscovery::new(url)),
        None => {
            tracing::info!("discovery disabled (COMET_DISCOVERY_URL not set)");
            Arc::new(NoopDiscovery)
        }
    };
    let addrs = [("tcp", tcp_addr), ("ws", ws_addr), ("wss", wss_addr)]
        .into_iter()
        .filter_map(|(scheme, addr)| addr.map(|a| format!("{scheme}://{a}")))
        .chain(std::iter::once(format!("http://{}", config.control_bind)))
        .collect();
    let instance = Instance::from_config(&config, addrs);
    directory
        .register(&instance)
        .await
        .unwrap_or_else(|e| panic!("discovery registration failed: {e}"));
    let renewal = CancellationToken::new();
    tokio::spawn(discovery::run(
        server.clone(),
        directory.clone(),
        instance,
        config.discovery.server_tick,
        renewal.clone(),
    ));
    let lifecycle = Lifecycle::new(server.clone(), control.clone()).with_discovery(directory, renewal);

    if let Err(e) = lifecycle::wait_for_signal().await {
        tracing::error!(error = %e, "failed to install signal handlers");
    }
    let report = lifecycle.shutdown().await;
    match control_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "control plane error"),
        Err(e) => tracing::error!(error = %e, "control plane task failed"),
    }
    tracing::info!(drained = report.drained, force_closed = report.force_closed, "comet stopped");
}

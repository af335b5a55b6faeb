use anyhow::Context as _;
use apigate::config::{Cli, GatewayConfig, LogFormat};
use apigate::mounts::MountTable;
use apigate::sessions::SessionManager;
use apigate::transport::{AppState, router};
use apigate_http_tools::safety::OutboundHttpSafety;
use apigate_openapi_tools::{Dispatcher, SpecLoader};
use clap::Parser as _;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let mut config = match &cli.config {
        Some(path) => GatewayConfig::load(path)?,
        None => GatewayConfig::default(),
    };
    cli.apply(&mut config);

    let dispatch = &config.dispatch;
    let safety = OutboundHttpSafety::from(&dispatch.upstream.safety);
    let client = safety
        .build_client(dispatch.upstream.connect_timeout())
        .context("build HTTP client")?;
    let dispatcher = Arc::new(Dispatcher::with_client(
        client.clone(),
        dispatch.upstream.clone(),
    ));
    let mounts = Arc::new(MountTable::new(SpecLoader::new(client, safety)));

    for spec in config.mount_specs()? {
        let namespace = spec.namespace.clone();
        let locator = spec.source.spec.clone();
        if let Err(e) = mounts.mount_spec(spec).await {
            if cli.strict {
                return Err(e).with_context(|| format!("mount '{namespace}' from {locator}"));
            }
            tracing::error!(namespace = %namespace, spec = %locator, error = %e, "failed to mount API; skipping");
        }
    }
    if mounts.list().is_empty() {
        tracing::warn!("no APIs mounted");
    }

    let sessions = Arc::new(SessionManager::new(
        dispatcher,
        dispatch.invocation_deadline(),
        &dispatch.passthrough_headers,
    ));
    let state = Arc::new(AppState {
        mounts,
        sessions: Arc::clone(&sessions),
        server: config.server.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("bind {}", config.server.bind))?;
    tracing::info!(
        bind = %listener.local_addr()?,
        name = %config.server.name,
        "apigate listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutting down");
            sessions.close_all();
        })
        .await
        .context("serve")?;
    Ok(())
}

fn init_tracing(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    match cli.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

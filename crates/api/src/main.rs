use std::sync::Arc;

use anyhow::Context;

use taskforge_infra::config::TaskforgeConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    taskforge_observability::init();

    let config = TaskforgeConfig::from_env().context("loading configuration")?;
    let bind_addr = config.bind_addr.clone();

    let services = Arc::new(taskforge_api::app::services::build_services(config).await?);
    services.start().await?;

    let app = taskforge_api::app::build_app(services.clone());

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    services.shutdown().await;
    Ok(())
}

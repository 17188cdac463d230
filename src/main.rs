use std::net::SocketAddr;
use std::time::Duration;

use assessment_lockdown::{
    config::{get_config, init_config},
    database::pool::select_stores,
    routes, AppState,
};
use chrono::Utc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=info,sqlx=warn"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_config()?;
    let config = get_config()?;
    init_tracing(config.json_logs);

    let stores = select_stores(config).await?;
    let app_state = AppState::new(config.clone(), stores);

    {
        let state = app_state.clone();
        let interval = Duration::from_secs(config.sweep_interval_sec.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match state.lockdown.sweep_stale_sessions(Utc::now()).await {
                    Ok(0) => {}
                    Ok(n) => info!(terminated = n, "Stale lockdown sessions swept"),
                    Err(e) => tracing::error!(error = ?e, "Lockdown sweeper error"),
                }
            }
        });
    }

    let app = routes::build_router(app_state);

    let addr: SocketAddr = config.server_address.parse()?;
    info!("Server listening on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

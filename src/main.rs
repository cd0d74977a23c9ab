use dotenvy::dotenv;
use tracing::info;

use std::net::SocketAddr;
use visiona_billing::infra::{
    app::create_app, reconciliation_worker::run_reconciliation_loop, setup::init_app_state,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let app_state = init_app_state().await?;

    let bind_addr = app_state.config.bind_addr;

    let app = create_app(app_state.clone());

    // Spawn the reconciliation retry worker (after tracing is initialized)
    let billing_use_cases = app_state.billing_use_cases.clone();
    tokio::spawn(async move {
        run_reconciliation_loop(billing_use_cases).await;
    });

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Backend listening at {}", &listener.local_addr()?);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

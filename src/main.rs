use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use unified_pay::{
    config::Config,
    models::order::InMemoryOrders,
    models::user::InMemoryUsers,
    router,
    services::gateway::UnifiedClient,
    storage::InMemoryStore,
    AppState,
};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&config.app.rust_log))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Unified Payment service");

    let gateway = UnifiedClient::from_config(&config.gateway, &config.circuit_breaker)
        .expect("Failed to create gateway HTTP client");

    let (state, expiry) = AppState::build(
        config.clone(),
        Arc::new(InMemoryStore::new()),
        Arc::new(InMemoryOrders::new()),
        Arc::new(InMemoryUsers::new()),
        Arc::new(gateway),
    );

    // Фоновая метла подбирает pending-транзакции, пережившие свой таймер
    let sweep_interval = state.config.transaction.sweep_interval();
    task::spawn(expiry.run_sweeper(sweep_interval));

    let app = router(state.clone());

    let addr: SocketAddr = format!("{}:{}", state.config.app.host, state.config.app.port)
        .parse()
        .expect("Invalid HOST/PORT configuration");
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind listener");
    axum::serve(listener, app.into_make_service())
        .await
        .expect("Server error");
}

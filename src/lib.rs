pub mod config;
pub mod controllers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod storage;

use std::sync::Arc;
use tokio::task;

use models::order::OrderDirectory;
use models::user::UserDirectory;
use services::dispatch::SideEffectDispatcher;
use services::expiry::ExpirationScheduler;
use services::gateway::{CallbackUrls, GatewayApi};
use services::notify::{ChannelNotifier, Notifier};
use services::reconcile::ReconciliationEngine;
use storage::TransactionStore;

// Shared state для всего приложения
pub struct AppState {
    pub config: config::Config,
    pub store: Arc<dyn TransactionStore>,
    pub orders: Arc<dyn OrderDirectory>,
    pub users: Arc<dyn UserDirectory>,
    pub engine: ReconciliationEngine,
}

impl AppState {
    /// Собирает состояние приложения вокруг готовых коллабораторов.
    /// Возвращает также планировщик истечения, чтобы вызывающая сторона
    /// запустила фоновую метлу, и воркер уведомлений.
    pub fn build(
        config: config::Config,
        store: Arc<dyn TransactionStore>,
        orders: Arc<dyn OrderDirectory>,
        users: Arc<dyn UserDirectory>,
        gateway: Arc<dyn GatewayApi>,
    ) -> (Arc<Self>, ExpirationScheduler) {
        let (notifier, notify_rx) = ChannelNotifier::new();
        let notifier: Arc<dyn Notifier> = Arc::new(notifier);

        let dispatcher = Arc::new(SideEffectDispatcher::new(
            store.clone(),
            orders.clone(),
            users.clone(),
            notifier,
        ));
        let expiry = ExpirationScheduler::new(
            store.clone(),
            orders.clone(),
            dispatcher.clone(),
            config.transaction.lifetime(),
        );
        let callbacks = CallbackUrls {
            approve: config.gateway.approve_url.clone(),
            cancel: config.gateway.cancel_url.clone(),
            decline: config.gateway.decline_url.clone(),
        };
        let engine = ReconciliationEngine::new(
            store.clone(),
            orders.clone(),
            gateway,
            dispatcher,
            expiry.clone(),
            config.transaction.currency.clone(),
            callbacks,
            config.app.store_name.clone(),
        );

        task::spawn(services::notify::run_worker(
            store.clone(),
            notify_rx,
            config.app.store_name.clone(),
            config.app.store_url.clone(),
        ));

        let state = Arc::new(AppState { config, store, orders, users, engine });
        (state, expiry)
    }
}

/// Собирает корневой Router приложения. Вынесено из main, чтобы
/// интеграционные тесты поднимали тот же стек.
pub fn router(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route("/health", axum::routing::get(|| async { "OK" }))
        .merge(controllers::routes())
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

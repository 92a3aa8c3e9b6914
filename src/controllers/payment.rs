use axum::{
    extract::{Form, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{
    middleware::AuthUser,
    models::transaction::Transaction,
    services::gateway::GatewayError,
    services::reconcile::{RedirectKind, ReconcileError},
    AppState,
};

// --- Request/Response структуры ---

#[derive(Debug, Deserialize)]
pub struct CreatePaymentRequest {
    pub order_id: i64,
}

#[derive(Serialize)]
pub struct CreatePaymentResponse {
    pub transaction_id: String,
    pub payment_url: String,
}

/// Параметры возврата со страницы шлюза. Имена полей заданы шлюзом.
#[derive(Debug, Deserialize)]
pub struct GatewayReturn {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "orderId")]
    pub order_id: String,
    pub xmlmsg: String,
}

#[derive(Serialize)]
pub struct ApiError {
    success: bool,
    message: String,
}

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

fn to_api_error(status: StatusCode, message: &str) -> (StatusCode, Json<ApiError>) {
    (status, Json(ApiError { success: false, message: message.to_string() }))
}

fn map_reconcile_error(e: ReconcileError) -> (StatusCode, Json<ApiError>) {
    match e {
        ReconcileError::NoTransaction(msg) => to_api_error(StatusCode::NOT_FOUND, msg),
        ReconcileError::OrderNotPayable(msg) => {
            to_api_error(StatusCode::UNPROCESSABLE_ENTITY, msg)
        }
        ReconcileError::Gateway(GatewayError::CircuitOpen) => to_api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "Payment gateway temporarily unavailable. Please try again later.",
        ),
        ReconcileError::Gateway(e) => {
            tracing::error!("Payment gateway error: {:?}", e);
            to_api_error(StatusCode::BAD_GATEWAY, "Payment gateway error. Please try again later.")
        }
        ReconcileError::Store(e) => {
            tracing::error!("Transaction store error: {:?}", e);
            to_api_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
        }
        ReconcileError::Other(e) => {
            tracing::error!("Payment processing error: {:?}", e);
            to_api_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
        }
    }
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/unified_payments", post(create_payment).get(list_payments))
        .route("/unified_payments/approved", post(approved))
        .route("/unified_payments/declined", post(declined))
        .route("/unified_payments/canceled", post(canceled))
        .route("/unified_payments/{transaction_id}/query_gateway", get(query_gateway))
}

// --- HTTP Handlers ---

/// POST /unified_payments
pub async fn create_payment(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<CreatePaymentRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.order_id <= 0 {
        return Err(to_api_error(StatusCode::BAD_REQUEST, "order_id must be positive"));
    }

    let txn = state
        .engine
        .initiate(req.order_id, Some(user.user_id))
        .await
        .map_err(map_reconcile_error)?;

    let payment_url = txn.gateway_url.clone().ok_or_else(|| {
        to_api_error(StatusCode::INTERNAL_SERVER_ERROR, "Gateway returned no payment URL")
    })?;

    Ok((
        StatusCode::CREATED,
        Json(CreatePaymentResponse {
            transaction_id: txn.merchant_transaction_id,
            payment_url,
        }),
    ))
}

/// GET /unified_payments - транзакции текущего покупателя
pub async fn list_payments(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> ApiResult<Json<Vec<Transaction>>> {
    let txns = state.engine.list_for_user(user.user_id).await.map_err(map_reconcile_error)?;
    Ok(Json(txns))
}

/// GET /unified_payments/{transaction_id}/query_gateway
pub async fn query_gateway(
    State(state): State<Arc<AppState>>,
    _user: AuthUser,
    Path(transaction_id): Path<String>,
) -> ApiResult<Json<Transaction>> {
    let txn = state
        .engine
        .query_gateway(&transaction_id)
        .await
        .map_err(map_reconcile_error)?;
    Ok(Json(txn))
}

// Публичные колбеки шлюза. Зовет их сам шлюз, поэтому ни аутентификации,
// ни anti-CSRF проверок здесь нет; транзакция ищется по паре
// (sessionId, orderId), выданной шлюзом.

async fn handle_redirect(
    state: Arc<AppState>,
    kind: RedirectKind,
    form: GatewayReturn,
) -> (StatusCode, String) {
    match state
        .engine
        .on_redirect(kind, &form.session_id, &form.order_id, &form.xmlmsg)
        .await
    {
        Ok(outcome) => (StatusCode::OK, outcome.notice),
        Err(ReconcileError::NoTransaction(msg)) => (StatusCode::NOT_FOUND, msg.to_string()),
        Err(e) => {
            tracing::error!(kind = kind.as_str(), error = %e, "Gateway callback failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal error".to_string())
        }
    }
}

/// POST /unified_payments/approved
pub async fn approved(
    State(state): State<Arc<AppState>>,
    Form(form): Form<GatewayReturn>,
) -> impl IntoResponse {
    handle_redirect(state, RedirectKind::Approved, form).await
}

/// POST /unified_payments/declined
pub async fn declined(
    State(state): State<Arc<AppState>>,
    Form(form): Form<GatewayReturn>,
) -> impl IntoResponse {
    handle_redirect(state, RedirectKind::Declined, form).await
}

/// POST /unified_payments/canceled
pub async fn canceled(
    State(state): State<Arc<AppState>>,
    Form(form): Form<GatewayReturn>,
) -> impl IntoResponse {
    handle_redirect(state, RedirectKind::Canceled, form).await
}

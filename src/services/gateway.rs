//! gateway.rs
//!
//! Клиент платёжного шлюза.
//!
//! Ключевые компоненты:
//! 1.  **CircuitBreaker**: "Автоматический выключатель" вокруг сетевых вызовов.
//!     После серии сбоев запросы к шлюзу временно блокируются, чтобы не
//!     долбить неработающий сервис.
//! 2.  **UnifiedClient**: HTTP-клиент, который собирает XML-запросы CreateOrder
//!     и GetOrderStatus, отправляет их на шлюз и разбирает ответы.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::config::{CircuitBreakerConfig, GatewayConfig};
use crate::services::xml::element_text;

/// Состояния "Автоматического выключателя".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Нормальный режим, запросы разрешены.
    Closed,
    /// Блокировка после серии сбоев.
    Open,
    /// После таймаута разрешен один пробный запрос.
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: std::sync::RwLock<CircuitState>,
    failure_count: AtomicU32,
    /// Секунды от `started` на момент последнего сбоя.
    last_failure_at: AtomicU64,
    started: Instant,
    failure_threshold: u32,
    timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, timeout_seconds: u64) -> Self {
        Self {
            state: std::sync::RwLock::new(CircuitState::Closed),
            failure_count: AtomicU32::new(0),
            last_failure_at: AtomicU64::new(0),
            started: Instant::now(),
            failure_threshold,
            timeout: Duration::from_secs(timeout_seconds),
        }
    }

    fn now_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn can_execute(&self) -> bool {
        let state = *self.state.read().unwrap();
        match state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let since_failure =
                    self.now_seconds().saturating_sub(self.last_failure_at.load(Ordering::Relaxed));
                if since_failure >= self.timeout.as_secs() {
                    *self.state.write().unwrap() = CircuitState::HalfOpen;
                    info!("Circuit breaker transitioning to HalfOpen state");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.write().unwrap();
        match *state {
            CircuitState::HalfOpen => {
                *state = CircuitState::Closed;
                self.failure_count.store(0, Ordering::Relaxed);
                info!("Circuit breaker recovered - transitioning to Closed state");
            }
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::Relaxed);
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let failures = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
        self.last_failure_at.store(self.now_seconds(), Ordering::Relaxed);

        let mut state = self.state.write().unwrap();
        match *state {
            CircuitState::Closed => {
                if failures >= self.failure_threshold {
                    *state = CircuitState::Open;
                    error!(
                        "Circuit breaker OPENED - {} failures reached threshold {}",
                        failures, self.failure_threshold
                    );
                }
            }
            CircuitState::HalfOpen => {
                *state = CircuitState::Open;
                warn!("Circuit breaker test failed - returning to Open state");
            }
            CircuitState::Open => {}
        }
    }

    pub fn get_state(&self) -> CircuitState {
        *self.state.read().unwrap()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("circuit breaker is open - payment gateway temporarily unavailable")]
    CircuitOpen,
    #[error("payment gateway error: {0}")]
    Transport(#[from] reqwest::Error),
    /// Шлюз ответил, но отказал в операции (Status != "00").
    #[error("gateway rejected request with status {0}")]
    Rejected(String),
    #[error("malformed gateway response: {0}")]
    MalformedResponse(String),
}

/// Сессия, открытая шлюзом для страницы оплаты.
#[derive(Debug, Clone)]
pub struct GatewaySession {
    pub order_id: String,
    pub session_id: String,
    pub redirect_url: String,
}

/// URL-ы, на которые шлюз вернет покупателя после оплаты.
#[derive(Debug, Clone)]
pub struct CallbackUrls {
    pub approve: String,
    pub cancel: String,
    pub decline: String,
}

#[async_trait]
pub trait GatewayApi: Send + Sync {
    async fn create_order(
        &self,
        amount: rust_decimal::Decimal,
        currency: &str,
        callbacks: &CallbackUrls,
        description: &str,
    ) -> Result<GatewaySession, GatewayError>;

    /// Текущий статус заказа на стороне шлюза, например "APPROVED".
    async fn get_order_status(
        &self,
        order_id: &str,
        session_id: &str,
    ) -> Result<String, GatewayError>;
}

/// Клиент XML-API шлюза. Все сетевые вызовы защищены Circuit Breaker-ом.
#[derive(Clone)]
pub struct UnifiedClient {
    merchant_id: String,
    base_url: String,
    http_client: reqwest::Client,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl UnifiedClient {
    pub fn from_config(
        gateway: &GatewayConfig,
        breaker: &CircuitBreakerConfig,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            merchant_id: gateway.merchant_id.clone(),
            base_url: gateway.base_url.clone(),
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()?,
            circuit_breaker: Arc::new(CircuitBreaker::new(
                breaker.failure_threshold,
                breaker.timeout_seconds,
            )),
        })
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.get_state()
    }

    /// Отправляет XML-документ на шлюз под контролем Circuit Breaker.
    async fn post_xml(&self, body: String) -> Result<String, GatewayError> {
        if !self.circuit_breaker.can_execute() {
            warn!("Circuit breaker is OPEN - blocking payment gateway request");
            return Err(GatewayError::CircuitOpen);
        }

        let result = async {
            let response = self
                .http_client
                .post(format!("{}/exec", self.base_url))
                .header("Content-Type", "application/xml")
                .body(body)
                .send()
                .await?
                .error_for_status()?;
            response.text().await
        }
        .await;

        match result {
            Ok(text) => {
                self.circuit_breaker.record_success();
                Ok(text)
            }
            Err(e) => {
                error!("Payment gateway request failed: {:?}", e);
                self.circuit_breaker.record_failure();
                Err(GatewayError::Transport(e))
            }
        }
    }

    fn check_status(raw: &str) -> Result<(), GatewayError> {
        match element_text(raw, "Status") {
            Some(s) if s == "00" => Ok(()),
            Some(s) => Err(GatewayError::Rejected(s)),
            None => Err(GatewayError::MalformedResponse("missing Status".to_string())),
        }
    }

    fn require(raw: &str, tag: &str) -> Result<String, GatewayError> {
        element_text(raw, tag)
            .ok_or_else(|| GatewayError::MalformedResponse(format!("missing {}", tag)))
    }
}

fn xml_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

#[async_trait]
impl GatewayApi for UnifiedClient {
    async fn create_order(
        &self,
        amount: rust_decimal::Decimal,
        currency: &str,
        callbacks: &CallbackUrls,
        description: &str,
    ) -> Result<GatewaySession, GatewayError> {
        let body = format!(
            "<TKKPG><Request><Operation>CreateOrder</Operation><Language>EN</Language>\
             <Order><OrderType>Purchase</OrderType><Merchant>{}</Merchant>\
             <Amount>{}</Amount><Currency>{}</Currency><Description>{}</Description>\
             <ApproveURL>{}</ApproveURL><CancelURL>{}</CancelURL><DeclineURL>{}</DeclineURL>\
             </Order></Request></TKKPG>",
            xml_escape(&self.merchant_id),
            amount,
            xml_escape(currency),
            xml_escape(description),
            xml_escape(&callbacks.approve),
            xml_escape(&callbacks.cancel),
            xml_escape(&callbacks.decline),
        );

        let raw = self.post_xml(body).await?;
        Self::check_status(&raw)?;

        let session = GatewaySession {
            order_id: Self::require(&raw, "OrderID")?,
            session_id: Self::require(&raw, "SessionID")?,
            redirect_url: Self::require(&raw, "URL")?,
        };
        info!(
            gateway_order_id = %session.order_id,
            "Gateway order created"
        );
        Ok(session)
    }

    async fn get_order_status(
        &self,
        order_id: &str,
        session_id: &str,
    ) -> Result<String, GatewayError> {
        let body = format!(
            "<TKKPG><Request><Operation>GetOrderStatus</Operation><Language>EN</Language>\
             <Order><Merchant>{}</Merchant><OrderID>{}</OrderID></Order>\
             <SessionID>{}</SessionID></Request></TKKPG>",
            xml_escape(&self.merchant_id),
            xml_escape(order_id),
            xml_escape(session_id),
        );

        let raw = self.post_xml(body).await?;
        Self::check_status(&raw)?;
        Self::require(&raw, "OrderStatus")
    }
}

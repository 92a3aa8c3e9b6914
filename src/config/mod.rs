use serde::Deserialize;
use std::env;
use std::time::Duration;

// Главная структура конфигурации - контейнер для всех настроек
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub gateway: GatewayConfig,
    pub transaction: TransactionConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

// Настройки приложения
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub store_name: String,
    pub store_url: String,
    pub rust_log: String,
}

// Настройки платежного шлюза Unified
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub merchant_id: String,
    pub base_url: String,
    pub approve_url: String,
    pub cancel_url: String,
    pub decline_url: String,
}

// Настройки жизненного цикла транзакции
#[derive(Debug, Clone, Deserialize)]
pub struct TransactionConfig {
    // Окно жизни pending-транзакции в минутах, после которого она истекает
    pub lifetime_minutes: u64,
    pub currency: String,
    // Интервал фоновой проверки зависших транзакций в секундах
    pub sweep_interval_seconds: u64,
}

// Настройки Circuit Breaker
#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub timeout_seconds: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            app: AppConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8000".to_string())
                    .parse()
                    .expect("PORT must be a valid number"),
                store_name: env::var("STORE_NAME").unwrap_or_else(|_| "Unified Store".to_string()),
                store_url: env::var("STORE_URL").unwrap_or_else(|_| "www.unified-store.test".to_string()),
                rust_log: env::var("RUST_LOG")
                    .unwrap_or_else(|_| "unified_pay=debug,tower_http=debug".to_string()),
            },
            gateway: GatewayConfig {
                merchant_id: env::var("MERCHANT_ID").expect("MERCHANT_ID must be set"),
                base_url: env::var("GATEWAY_BASE_URL")
                    .unwrap_or_else(|_| "https://gateway.unified.test".to_string()),
                approve_url: env::var("GATEWAY_APPROVE_URL")
                    .unwrap_or_else(|_| "https://your-domain.com/unified_payments/approved".to_string()),
                cancel_url: env::var("GATEWAY_CANCEL_URL")
                    .unwrap_or_else(|_| "https://your-domain.com/unified_payments/canceled".to_string()),
                decline_url: env::var("GATEWAY_DECLINE_URL")
                    .unwrap_or_else(|_| "https://your-domain.com/unified_payments/declined".to_string()),
            },
            transaction: TransactionConfig {
                lifetime_minutes: env::var("TRANSACTION_LIFETIME_MINUTES")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .expect("TRANSACTION_LIFETIME_MINUTES must be a valid number"),
                currency: env::var("TRANSACTION_CURRENCY").unwrap_or_else(|_| "NGN".to_string()),
                sweep_interval_seconds: env::var("TRANSACTION_SWEEP_INTERVAL_SECONDS")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse()
                    .expect("TRANSACTION_SWEEP_INTERVAL_SECONDS must be a valid number"),
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: env::var("CIRCUIT_BREAKER_FAILURE_THRESHOLD")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .expect("CIRCUIT_BREAKER_FAILURE_THRESHOLD must be a valid number"),
                timeout_seconds: env::var("CIRCUIT_BREAKER_TIMEOUT_SECONDS")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse()
                    .expect("CIRCUIT_BREAKER_TIMEOUT_SECONDS must be a valid number"),
            },
        }
    }

}

impl TransactionConfig {
    pub fn lifetime(&self) -> Duration {
        Duration::from_secs(self.lifetime_minutes * 60)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

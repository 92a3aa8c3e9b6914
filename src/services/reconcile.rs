//! reconcile.rs
//!
//! Движок сверки: единственное место, где отчет шлюза превращается в переход
//! транзакции. Три входа:
//! 1.  **initiate** - открытие заказа на шлюзе и создание pending-транзакции;
//! 2.  **on_redirect** - синхронный возврат покупателя со страницы шлюза
//!     (approved / declined / canceled);
//! 3.  **query_gateway** - явный опрос статуса по нашему локальному id.
//!
//! Все записи идут через commit: CAS-цикл, который фиксирует переход ровно
//! один раз и после фиксации запускает диспетчер эффектов. Сетевой вызов
//! шлюза всегда происходит до первой записи, поэтому неудачный вызов не
//! оставляет транзакцию полузаписанной.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::order::{OrderDirectory, OrderSnapshot};
use crate::models::transaction::{effects_of_save, Transaction, TransactionStatus};
use crate::services::dispatch::SideEffectDispatcher;
use crate::services::expiry::ExpirationScheduler;
use crate::services::gateway::{CallbackUrls, GatewayApi, GatewayError};
use crate::services::xml::GatewayMessage;
use crate::storage::{StoreError, TransactionStore};

// Тексты, которые видит покупатель. Менять только вместе с поддержкой.
pub const NO_TRANSACTION: &str = "No transaction. Please contact our support team.";
pub const NOT_APPROVED_AT_GATEWAY: &str = "Not Approved At Gateway";
pub const PAYMENT_MISMATCH: &str =
    "Payment made was not same as requested to gateway. Please contact administrator for queries.";
pub const EXPIRED_WALLETED: &str = "Payment was successful but transaction has expired. The payment made has been walleted in your account. Please contact administrator to help you further.";
pub const ORDER_ALREADY_PAID: &str = "Order Already Paid Or Completed";
pub const TOTAL_DIFFERS: &str =
    "Payment made is different from order total. Payment made has been walleted to your account.";
pub const COULD_NOT_FIND: &str = "Could not find transaction";
pub const PAYMENT_SUCCESSFUL: &str = "Payment successful";

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("{0}")]
    NoTransaction(&'static str),
    /// Заказ нельзя оплатить картой; текст уходит покупателю как есть.
    #[error("{0}")]
    OrderNotPayable(&'static str),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Какой из трех колбеков шлюза пришел.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectKind {
    Approved,
    Declined,
    Canceled,
}

impl RedirectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedirectKind::Approved => "approved",
            RedirectKind::Declined => "declined",
            RedirectKind::Canceled => "canceled",
        }
    }
}

/// Итог обработки возврата со шлюза: сохраненная транзакция и текст для
/// покупателя. success = платеж в итоге зачтен (возможно, в кошелек).
#[derive(Debug, Clone)]
pub struct RedirectOutcome {
    pub transaction: Transaction,
    pub notice: String,
    pub success: bool,
}

impl GatewayMessage {
    /// Шлюз подтвердил списание в этом документе.
    fn approved(&self) -> bool {
        self.response_status.as_deref() == Some("00")
            || self.order_status.as_deref() == Some("APPROVED")
    }
}

pub struct ReconciliationEngine {
    store: Arc<dyn TransactionStore>,
    orders: Arc<dyn OrderDirectory>,
    gateway: Arc<dyn GatewayApi>,
    dispatcher: Arc<SideEffectDispatcher>,
    expiry: ExpirationScheduler,
    currency: String,
    callbacks: CallbackUrls,
    store_name: String,
}

impl ReconciliationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn TransactionStore>,
        orders: Arc<dyn OrderDirectory>,
        gateway: Arc<dyn GatewayApi>,
        dispatcher: Arc<SideEffectDispatcher>,
        expiry: ExpirationScheduler,
        currency: String,
        callbacks: CallbackUrls,
        store_name: String,
    ) -> Self {
        Self { store, orders, gateway, dispatcher, expiry, currency, callbacks, store_name }
    }

    /// CAS-цикл фиксации: перечитывает запись, применяет мутацию и пишет с
    /// проверкой версии. После успешной записи вычисляет эффекты перехода и
    /// отдает их диспетчеру. Возвращает (до, после).
    async fn commit<F>(
        &self,
        id: Uuid,
        mutate: F,
    ) -> Result<(Transaction, Transaction), ReconcileError>
    where
        F: Fn(&mut Transaction),
    {
        loop {
            let Some(current) = self.store.get(id).await? else {
                return Err(ReconcileError::NoTransaction(COULD_NOT_FIND));
            };
            let prev = current.clone();
            let version = current.version;
            let mut next = current;
            mutate(&mut next);

            match self.store.update(next, version).await {
                Ok(saved) => {
                    let order = match saved.order_id {
                        Some(order_id) => self.orders.get(order_id).await?,
                        None => None,
                    };
                    let effects = effects_of_save(&prev, &saved, order.as_ref());
                    self.dispatcher.run(&saved, &effects, order.as_ref()).await?;
                    return Ok((prev, saved));
                }
                Err(StoreError::Conflict(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Открывает заказ на шлюзе и создает pending-транзакцию. Ранее открытые
    /// pending-попытки по тому же заказу принудительно истекают: у заказа в
    /// любой момент не больше одной живой попытки.
    pub async fn initiate(
        &self,
        order_id: i64,
        user_id: Option<i64>,
    ) -> Result<Transaction, ReconcileError> {
        let order = self
            .orders
            .get(order_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("order {} not found", order_id))?;
        if let Some(reason) = order.reason_if_cant_pay_by_card() {
            return Err(ReconcileError::OrderNotPayable(reason));
        }

        for stale in self.store.find_pending_for_order(order_id).await? {
            info!(
                transaction_id = %stale.id,
                order_id,
                "Superseding previous pending attempt"
            );
            self.expiry
                .expire_now(stale.id)
                .await
                .map_err(ReconcileError::Other)?;
        }

        let description = format!("Purchasing items from {}", self.store_name);
        let session = self
            .gateway
            .create_order(order.total, &self.currency, &self.callbacks, &description)
            .await?;

        self.orders.reserve_stock(order_id).await?;
        if order.state == "payment" {
            self.orders.advance(order_id).await?;
        }

        let mut txn = Transaction::new_pending(
            merchant_transaction_id(order_id),
            order.total,
            self.currency.clone(),
        );
        txn.order_id = Some(order_id);
        txn.user_id = user_id;
        txn.gateway_order_id = Some(session.order_id);
        txn.gateway_session_id = Some(session.session_id);
        txn.gateway_url = Some(session.redirect_url);
        txn.gateway_order_status = Some("CREATED".to_string());

        loop {
            match self.store.insert(txn.clone()).await {
                Ok(()) => break,
                Err(StoreError::DuplicateMerchantId(_)) => {
                    txn.merchant_transaction_id = merchant_transaction_id(order_id);
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.expiry.schedule(txn.id);
        info!(
            transaction_id = %txn.id,
            merchant_transaction_id = %txn.merchant_transaction_id,
            order_id,
            amount = %txn.amount,
            "Pending transaction created"
        );
        Ok(txn)
    }

    /// Возврат покупателя со страницы шлюза. Транзакция ищется по паре
    /// идентификаторов, выданных шлюзом при открытии сессии; параметрам
    /// запроса сверх этого не доверяем.
    pub async fn on_redirect(
        &self,
        kind: RedirectKind,
        session_id: &str,
        gateway_order_id: &str,
        raw_xml: &str,
    ) -> Result<RedirectOutcome, ReconcileError> {
        let txn = self
            .store
            .find_by_gateway(session_id, gateway_order_id)
            .await?
            .ok_or(ReconcileError::NoTransaction(NO_TRANSACTION))?;

        match kind {
            RedirectKind::Approved => self.resolve_approved(&txn, raw_xml).await,
            RedirectKind::Declined | RedirectKind::Canceled => {
                self.resolve_unsuccessful(&txn, kind, raw_xml).await
            }
        }
    }

    async fn resolve_approved(
        &self,
        txn: &Transaction,
        raw_xml: &str,
    ) -> Result<RedirectOutcome, ReconcileError> {
        let msg = GatewayMessage::parse(raw_xml);

        if !msg.approved() {
            // Шлюз не подтвердил списание: сохраняем сырой ответ, статус не трогаем
            let raw = raw_xml.to_string();
            let (_, saved) = self.commit(txn.id, |t| t.apply_gateway_message(&raw)).await?;
            warn!(transaction_id = %saved.id, "Approved callback without gateway approval");
            return Ok(RedirectOutcome {
                transaction: saved,
                notice: NOT_APPROVED_AT_GATEWAY.to_string(),
                success: false,
            });
        }

        if msg.purchase_amount != Some(txn.amount) {
            let raw = raw_xml.to_string();
            let (_, saved) = self
                .commit(txn.id, |t| {
                    t.apply_gateway_message(&raw);
                    if t.pending() {
                        t.status = TransactionStatus::Unsuccessful;
                    }
                })
                .await?;
            warn!(
                transaction_id = %saved.id,
                expected = %txn.amount,
                reported = ?msg.purchase_amount,
                "Gateway-reported amount differs from transaction amount"
            );
            return Ok(RedirectOutcome {
                transaction: saved,
                notice: PAYMENT_MISMATCH.to_string(),
                success: false,
            });
        }

        // Снимок заказа до эффектов: после complete_order заказ станет paid
        let order = match txn.order_id {
            Some(order_id) => self.orders.get(order_id).await?,
            None => None,
        };

        let raw = raw_xml.to_string();
        let (prev, saved) = self
            .commit(txn.id, |t| {
                t.apply_gateway_message(&raw);
                if t.pending() || (t.unsuccessful() && t.order_inventory_released()) {
                    t.status = TransactionStatus::Successful;
                }
            })
            .await?;

        let notice = approval_notice(&prev, order.as_ref());
        if notice != PAYMENT_SUCCESSFUL {
            warn!(transaction_id = %saved.id, notice, "Approved payment needs attention");
        }
        let success = saved.successful();
        Ok(RedirectOutcome { transaction: saved, notice: notice.to_string(), success })
    }

    async fn resolve_unsuccessful(
        &self,
        txn: &Transaction,
        kind: RedirectKind,
        raw_xml: &str,
    ) -> Result<RedirectOutcome, ReconcileError> {
        let raw = raw_xml.to_string();
        let (_, saved) = self
            .commit(txn.id, |t| {
                t.apply_gateway_message(&raw);
                if t.pending() {
                    t.status = TransactionStatus::Unsuccessful;
                }
            })
            .await?;

        let notice = saved
            .response_description
            .clone()
            .unwrap_or_else(|| format!("Payment {} at gateway", kind.as_str()));
        info!(
            transaction_id = %saved.id,
            kind = kind.as_str(),
            "Gateway reported unsuccessful payment"
        );
        Ok(RedirectOutcome { transaction: saved, notice, success: false })
    }

    /// Явный опрос шлюза по нашему локальному идентификатору транзакции.
    /// Идентификаторы сессии берутся только из самой записи.
    pub async fn query_gateway(
        &self,
        merchant_transaction_id: &str,
    ) -> Result<Transaction, ReconcileError> {
        let txn = self
            .store
            .find_by_merchant_id(merchant_transaction_id)
            .await?
            .ok_or(ReconcileError::NoTransaction(COULD_NOT_FIND))?;

        let (gateway_order_id, session_id) = match (&txn.gateway_order_id, &txn.gateway_session_id)
        {
            (Some(o), Some(s)) => (o.clone(), s.clone()),
            _ => {
                return Err(ReconcileError::Other(anyhow::anyhow!(
                    "transaction {} has no gateway session",
                    txn.id
                )))
            }
        };

        let status = self.gateway.get_order_status(&gateway_order_id, &session_id).await?;

        let reported = status.clone();
        let (_, saved) = self
            .commit(txn.id, move |t| {
                t.gateway_order_status = Some(reported.clone());
                if reported == "APPROVED"
                    && (t.pending() || (t.unsuccessful() && t.order_inventory_released()))
                {
                    t.status = TransactionStatus::Successful;
                }
            })
            .await?;
        info!(
            transaction_id = %saved.id,
            gateway_order_status = %status,
            "Gateway status poll applied"
        );
        Ok(saved)
    }

    pub async fn list_for_user(&self, user_id: i64) -> Result<Vec<Transaction>, ReconcileError> {
        Ok(self.store.list_for_user(user_id).await?)
    }
}

/// Локальный корреляционный идентификатор транзакции: отметка времени до
/// миллисекунд, номер заказа и случайный хвост, чтобы повторные попытки в
/// пределах одной миллисекунды не совпадали.
fn merchant_transaction_id(order_id: i64) -> String {
    let tail = Uuid::new_v4().as_u128() % 10_000;
    format!("{}{}{:04}", Utc::now().format("%y%m%d%H%M%S%3f"), order_id, tail)
}

fn approval_notice(prev: &Transaction, order: Option<&OrderSnapshot>) -> &'static str {
    if prev.order_inventory_released() {
        return EXPIRED_WALLETED;
    }
    match order {
        Some(o) if o.paid || o.completed => ORDER_ALREADY_PAID,
        Some(o) if o.total != prev.amount => TOTAL_DIFFERS,
        _ => PAYMENT_SUCCESSFUL,
    }
}

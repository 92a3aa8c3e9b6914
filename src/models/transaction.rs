use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

use crate::models::order::OrderSnapshot;
use crate::services::xml::{self, GatewayMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Successful,
    Unsuccessful,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Successful => "successful",
            TransactionStatus::Unsuccessful => "unsuccessful",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Одна попытка оплатить заказ картой. Запись никогда не удаляется -
/// это постоянный аудиторский след платежа.
#[derive(Debug, Clone, Serialize)]
pub struct Transaction {
    pub id: Uuid,
    pub order_id: Option<i64>,
    pub user_id: Option<i64>,
    // Идентификаторы, выданные шлюзом при открытии заказа. Неизменяемы после присвоения.
    pub gateway_order_id: Option<String>,
    pub gateway_session_id: Option<String>,
    pub gateway_url: Option<String>,
    // Локальный корреляционный id, который шлюз обязан вернуть в своих ответах
    pub merchant_transaction_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub status: TransactionStatus,
    pub gateway_order_status: Option<String>,
    pub response_status: Option<String>,
    pub response_description: Option<String>,
    pub approval_code: Option<String>,
    pub masked_pan: Option<String>,
    pub order_description: Option<String>,
    #[serde(skip)]
    pub xml_response: Option<String>,
    pub expired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub version: u64,
}

impl Transaction {
    pub fn new_pending(merchant_transaction_id: String, amount: Decimal, currency: String) -> Self {
        let now = Utc::now();
        Transaction {
            id: Uuid::new_v4(),
            order_id: None,
            user_id: None,
            gateway_order_id: None,
            gateway_session_id: None,
            gateway_url: None,
            merchant_transaction_id,
            amount,
            currency,
            status: TransactionStatus::Pending,
            gateway_order_status: None,
            response_status: None,
            response_description: None,
            approval_code: None,
            masked_pan: None,
            order_description: None,
            xml_response: None,
            expired_at: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn pending(&self) -> bool {
        self.status == TransactionStatus::Pending
    }

    pub fn successful(&self) -> bool {
        self.status == TransactionStatus::Successful
    }

    pub fn unsuccessful(&self) -> bool {
        self.status == TransactionStatus::Unsuccessful
    }

    /// Инвентарь заказа уже возвращен, если транзакция когда-либо истекала:
    /// expired_at ставится ровно один раз и никогда не сбрасывается.
    pub fn order_inventory_released(&self) -> bool {
        self.expired_at.is_some()
    }

    /// Сохраняет сырой ответ шлюза и, если это документ `<Message>`,
    /// разбирает поля деталей. Поврежденный документ не блокирует переход:
    /// поля просто остаются пустыми.
    pub fn apply_gateway_message(&mut self, raw: &str) {
        self.xml_response = Some(raw.to_string());
        if !xml::is_message(raw) {
            return;
        }
        let msg = GatewayMessage::parse(raw);
        self.masked_pan = msg.masked_pan;
        self.response_description = msg.response_description;
        self.gateway_order_status = msg.order_status;
        self.order_description = msg.order_description;
        self.response_status = msg.response_status;
        self.approval_code = msg.approval_code;
    }
}

/// Побочные эффекты, которые диспетчер обязан выполнить после фиксации
/// перехода, в порядке перечисления.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    NotifyUser,
    CompleteOrder,
    WalletCredit,
    CancelOrder,
    ReleaseInventory,
}

/// Платеж еще применим к заказу: заказ не оплачен другим способом,
/// не завершен, и его итог совпадает с суммой транзакции.
pub fn payment_valid_for_order(txn: &Transaction, order: Option<&OrderSnapshot>) -> bool {
    match order {
        Some(o) => !o.completed && !o.paid && o.total == txn.amount,
        None => false,
    }
}

/// Явная функция перехода: сравнивает сохраненное и новое состояние и
/// возвращает упорядоченный список эффектов. Вызывается обоими путями
/// сверки и планировщиком истечения после успешного CAS-сохранения.
///
/// Повторное сохранение того же статуса не дает перехода и не дает эффектов.
pub fn effects_of_save(
    prev: &Transaction,
    next: &Transaction,
    order: Option<&OrderSnapshot>,
) -> Vec<Effect> {
    let mut effects = Vec::new();

    let left_pending = prev.status == TransactionStatus::Pending
        && next.status != TransactionStatus::Pending;

    if left_pending {
        // Уведомление уходит только на первом переходе из pending
        effects.push(Effect::NotifyUser);
        match next.status {
            TransactionStatus::Successful => {
                if next.order_inventory_released() || !payment_valid_for_order(next, order) {
                    // Заказ ушел без этого платежа - деньги в кошелек, не в заказ
                    effects.push(Effect::WalletCredit);
                } else {
                    effects.push(Effect::CompleteOrder);
                }
            }
            TransactionStatus::Unsuccessful => effects.push(Effect::CancelOrder),
            TransactionStatus::Pending => unreachable!(),
        }
    }

    // Запоздалое подтверждение: транзакция уже истекла как unsuccessful, но
    // шлюз подтвердил списание. Статус переписывается на successful для
    // аудита, деньги уходят в кошелек. Уведомление об исходе уже уходило
    // при истечении, второй раз не шлем.
    let stale_success = prev.status == TransactionStatus::Unsuccessful
        && prev.expired_at.is_some()
        && next.status == TransactionStatus::Successful;
    if stale_success {
        effects.push(Effect::WalletCredit);
    }

    // Ортогональное событие: первый переход expired_at из None
    if prev.expired_at.is_none() && next.expired_at.is_some() {
        effects.push(Effect::ReleaseInventory);
    }

    effects
}

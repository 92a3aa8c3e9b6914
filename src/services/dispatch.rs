//! Выполнение побочных эффектов после фиксации перехода транзакции.
//!
//! Диспетчер получает уже сохраненную транзакцию и список эффектов,
//! вычисленный для одного конкретного перехода. Поскольку переход фиксируется
//! CAS-записью ровно один раз, каждый эффект выполняется не более одного раза
//! на транзакцию.

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use crate::models::order::{OrderDirectory, OrderSnapshot};
use crate::models::transaction::{Effect, Transaction};
use crate::models::user::{UserDirectory, WalletEntry, WalletMode};
use crate::services::notify::Notifier;
use crate::storage::{StoreError, TransactionStore};

pub struct SideEffectDispatcher {
    store: Arc<dyn TransactionStore>,
    orders: Arc<dyn OrderDirectory>,
    users: Arc<dyn UserDirectory>,
    notifier: Arc<dyn Notifier>,
}

impl SideEffectDispatcher {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        orders: Arc<dyn OrderDirectory>,
        users: Arc<dyn UserDirectory>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self { store, orders, users, notifier }
    }

    pub async fn run(
        &self,
        txn: &Transaction,
        effects: &[Effect],
        order: Option<&OrderSnapshot>,
    ) -> Result<()> {
        for effect in effects {
            match effect {
                Effect::NotifyUser => {
                    // Сбой уведомления не должен ломать обработку платежа
                    if let Err(e) = self.notifier.enqueue(txn.id) {
                        warn!(transaction_id = %txn.id, error = %e, "Failed to enqueue notification");
                    }
                }
                Effect::CompleteOrder => self.complete_order(txn, order).await?,
                Effect::WalletCredit => self.wallet_credit(txn, order).await?,
                Effect::CancelOrder => self.cancel_order(txn, order).await?,
                Effect::ReleaseInventory => self.release_inventory(txn, order).await?,
            }
        }
        Ok(())
    }

    async fn complete_order(
        &self,
        txn: &Transaction,
        order: Option<&OrderSnapshot>,
    ) -> Result<()> {
        let Some(order) = order else {
            warn!(transaction_id = %txn.id, "Complete order skipped - no order attached");
            return Ok(());
        };
        self.orders.advance(order.id).await?;
        self.orders.complete_pending_payments(order.id).await?;
        info!(transaction_id = %txn.id, order_id = order.id, "Order completed after payment");
        Ok(())
    }

    async fn cancel_order(&self, txn: &Transaction, order: Option<&OrderSnapshot>) -> Result<()> {
        let Some(order) = order else {
            return Ok(());
        };
        if order.completed {
            // Заказ успели завершить другим платежом, отменять нечего
            info!(transaction_id = %txn.id, order_id = order.id, "Cancel skipped - order already completed");
            return Ok(());
        }
        if !txn.order_inventory_released() {
            self.orders.release_inventory(order.id).await?;
        }
        self.orders.fail_pending_payments(order.id).await?;
        info!(transaction_id = %txn.id, order_id = order.id, "Order canceled after failed payment");
        Ok(())
    }

    async fn release_inventory(
        &self,
        txn: &Transaction,
        order: Option<&OrderSnapshot>,
    ) -> Result<()> {
        let Some(order) = order else {
            return Ok(());
        };
        if order.completed {
            return Ok(());
        }
        self.orders.release_inventory(order.id).await?;
        info!(transaction_id = %txn.id, order_id = order.id, "Inventory released for expired transaction");
        Ok(())
    }

    /// Зачисляет сумму транзакции в кошелек покупателя. Пользователь ищется
    /// по email заказа; если его нет, создается учетная запись без пароля.
    async fn wallet_credit(&self, txn: &Transaction, order: Option<&OrderSnapshot>) -> Result<()> {
        let user = match txn.user_id {
            Some(id) => self.users.get(id).await?,
            None => None,
        };
        let user = match user {
            Some(u) => u,
            None => {
                let Some(order) = order else {
                    warn!(transaction_id = %txn.id, "Wallet credit skipped - no user and no order email");
                    return Ok(());
                };
                match self.users.find_by_email(&order.email).await? {
                    Some(u) => u,
                    None => self.users.create_minimal(&order.email).await?,
                }
            }
        };

        // Привязываем пользователя к транзакции, чтобы она попала в его список
        if txn.user_id != Some(user.id) {
            self.attach_user(txn, user.id).await?;
        }

        let balance = self.users.wallet_total(user.id).await? + txn.amount;
        self.users
            .credit_wallet(
                user.id,
                WalletEntry {
                    amount: txn.amount,
                    balance,
                    reason: format!(
                        "transferred from transaction:{}",
                        txn.merchant_transaction_id
                    ),
                    mode: WalletMode::PaymentRefund,
                },
            )
            .await?;
        info!(
            transaction_id = %txn.id,
            user_id = user.id,
            amount = %txn.amount,
            "Payment amount walleted to user account"
        );
        Ok(())
    }

    async fn attach_user(&self, txn: &Transaction, user_id: i64) -> Result<()> {
        loop {
            let Some(current) = self.store.get(txn.id).await? else {
                return Ok(());
            };
            let version = current.version;
            let mut updated = current;
            updated.user_id = Some(user_id);
            match self.store.update(updated, version).await {
                Ok(_) => return Ok(()),
                Err(StoreError::Conflict(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

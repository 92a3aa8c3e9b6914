//! Истечение pending-транзакций.
//!
//! У покупателя есть фиксированное окно на оплату. По его истечении
//! транзакция принудительно закрывается как неуспешная, а зарезервированный
//! инвентарь возвращается на склад. Одноразовый таймер ставится при создании
//! транзакции; фоновая метла подбирает то, что таймер пропустил (например,
//! после рестарта процесса).

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

use crate::models::order::OrderDirectory;
use crate::models::transaction::{effects_of_save, TransactionStatus};
use crate::services::dispatch::SideEffectDispatcher;
use crate::storage::{StoreError, TransactionStore};

#[derive(Clone)]
pub struct ExpirationScheduler {
    store: Arc<dyn TransactionStore>,
    orders: Arc<dyn OrderDirectory>,
    dispatcher: Arc<SideEffectDispatcher>,
    lifetime: Duration,
}

impl ExpirationScheduler {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        orders: Arc<dyn OrderDirectory>,
        dispatcher: Arc<SideEffectDispatcher>,
        lifetime: Duration,
    ) -> Self {
        Self { store, orders, dispatcher, lifetime }
    }

    /// Ставит одноразовый таймер на истечение транзакции. Если к моменту
    /// срабатывания транзакция уже не pending, таймер ничего не делает.
    pub fn schedule(&self, transaction_id: Uuid) {
        let scheduler = self.clone();
        let lifetime = self.lifetime;
        tokio::spawn(async move {
            tokio::time::sleep(lifetime).await;
            if let Err(e) = scheduler.expire_now(transaction_id).await {
                error!(transaction_id = %transaction_id, error = %e, "Transaction expiry failed");
            }
        });
    }

    /// Принудительно истекает транзакцию. Возвращает true, если именно этот
    /// вызов выполнил переход; повторные вызовы и вызовы по уже закрытым
    /// транзакциям ничего не меняют.
    pub async fn expire_now(&self, transaction_id: Uuid) -> Result<bool> {
        loop {
            let Some(current) = self.store.get(transaction_id).await? else {
                return Ok(false);
            };
            if !current.pending() || current.order_inventory_released() {
                return Ok(false);
            }

            let prev = current.clone();
            let version = current.version;
            let mut next = current;
            next.expired_at = Some(Utc::now());
            next.status = TransactionStatus::Unsuccessful;

            match self.store.update(next, version).await {
                Ok(saved) => {
                    let order = match saved.order_id {
                        Some(id) => self.orders.get(id).await?,
                        None => None,
                    };
                    let effects = effects_of_save(&prev, &saved, order.as_ref());
                    self.dispatcher.run(&saved, &effects, order.as_ref()).await?;
                    info!(
                        transaction_id = %saved.id,
                        merchant_transaction_id = %saved.merchant_transaction_id,
                        "Pending transaction expired"
                    );
                    return Ok(true);
                }
                // Кто-то успел сохранить транзакцию первым, перечитываем
                Err(StoreError::Conflict(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Бесконечный цикл фоновой метлы.
    pub async fn run_sweeper(self, interval: Duration) {
        info!("Expiration sweeper started");
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = self.sweep_once().await {
                error!(error = %e, "Expiration sweep failed");
            }
        }
    }

    /// Один проход метлы: истекает все pending-транзакции старше лайфтайма.
    pub async fn sweep_once(&self) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.lifetime).unwrap_or_else(|_| chrono::Duration::zero());
        let stale = self.store.stale_pending(cutoff).await?;
        let mut expired = 0;
        for txn in stale {
            if self.expire_now(txn.id).await? {
                expired += 1;
            }
        }
        if expired > 0 {
            info!(count = expired, "Expired stale pending transactions");
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::order::InMemoryOrders;
    use crate::models::transaction::Transaction;
    use crate::models::user::InMemoryUsers;
    use crate::services::notify::ChannelNotifier;
    use crate::storage::InMemoryStore;
    use rust_decimal_macros::dec;

    fn scheduler(
        store: Arc<InMemoryStore>,
        orders: InMemoryOrders,
        lifetime: Duration,
    ) -> ExpirationScheduler {
        let (notifier, _rx) = ChannelNotifier::new();
        let dispatcher = Arc::new(SideEffectDispatcher::new(
            store.clone(),
            Arc::new(orders.clone()),
            Arc::new(InMemoryUsers::new()),
            Arc::new(notifier),
        ));
        ExpirationScheduler::new(store, Arc::new(orders), dispatcher, lifetime)
    }

    async fn pending_txn(store: &InMemoryStore, orders: &InMemoryOrders) -> Transaction {
        orders.create(3, "buyer@test.com", dec!(100)).await;
        orders.reserve_stock(3).await.unwrap();
        let mut t =
            Transaction::new_pending("m-3".to_string(), dec!(100), "NGN".to_string());
        t.order_id = Some(3);
        store.insert(t.clone()).await.unwrap();
        t
    }

    #[tokio::test]
    async fn expire_now_releases_inventory_exactly_once() {
        let store = Arc::new(InMemoryStore::new());
        let orders = InMemoryOrders::new();
        let txn = pending_txn(&store, &orders).await;
        let scheduler = scheduler(store.clone(), orders.clone(), Duration::from_secs(300));

        assert!(scheduler.expire_now(txn.id).await.unwrap());

        let saved = store.get(txn.id).await.unwrap().unwrap();
        assert_eq!(saved.status, TransactionStatus::Unsuccessful);
        assert!(saved.expired_at.is_some());
        assert_eq!(orders.releases(3).await, 1);

        // Повторное истечение - no-op
        assert!(!scheduler.expire_now(txn.id).await.unwrap());
        assert_eq!(orders.releases(3).await, 1);
    }

    #[tokio::test]
    async fn expire_now_skips_settled_transaction() {
        let store = Arc::new(InMemoryStore::new());
        let orders = InMemoryOrders::new();
        let txn = pending_txn(&store, &orders).await;
        let scheduler = scheduler(store.clone(), orders.clone(), Duration::from_secs(300));

        let read = store.get(txn.id).await.unwrap().unwrap();
        let version = read.version;
        let mut settled = read;
        settled.status = TransactionStatus::Successful;
        store.update(settled, version).await.unwrap();

        assert!(!scheduler.expire_now(txn.id).await.unwrap());
        assert_eq!(orders.releases(3).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_timer_fires_after_lifetime() {
        let store = Arc::new(InMemoryStore::new());
        let orders = InMemoryOrders::new();
        let txn = pending_txn(&store, &orders).await;
        let scheduler = scheduler(store.clone(), orders.clone(), Duration::from_secs(300));

        scheduler.schedule(txn.id);
        tokio::time::sleep(Duration::from_secs(301)).await;

        let saved = store.get(txn.id).await.unwrap().unwrap();
        assert_eq!(saved.status, TransactionStatus::Unsuccessful);
        assert_eq!(orders.releases(3).await, 1);
    }

    #[tokio::test]
    async fn sweep_expires_only_stale_transactions() {
        let store = Arc::new(InMemoryStore::new());
        let orders = InMemoryOrders::new();
        let txn = pending_txn(&store, &orders).await;
        // Лайфтайм нулевой: любая pending-транзакция уже устарела
        let scheduler = scheduler(store.clone(), orders.clone(), Duration::from_secs(0));

        assert_eq!(scheduler.sweep_once().await.unwrap(), 1);
        let saved = store.get(txn.id).await.unwrap().unwrap();
        assert!(saved.unsuccessful());

        assert_eq!(scheduler.sweep_once().await.unwrap(), 0);
    }
}

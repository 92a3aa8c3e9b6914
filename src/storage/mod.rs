//! Хранилище транзакций.
//!
//! Все записи проходят через оптимистичную блокировку: `update` принимает
//! версию, с которой запись была прочитана, и отклоняет запись, если кто-то
//! успел сохранить ее раньше. Вызывающая сторона перечитывает и повторяет.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::transaction::{Transaction, TransactionStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Версия записи изменилась между чтением и записью.
    #[error("transaction {0} was modified concurrently")]
    Conflict(Uuid),
    #[error("transaction {0} not found")]
    NotFound(Uuid),
    #[error("merchant transaction id {0} already exists")]
    DuplicateMerchantId(String),
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Вставка новой транзакции. merchant_transaction_id уникален.
    async fn insert(&self, txn: Transaction) -> Result<(), StoreError>;
    async fn get(&self, id: Uuid) -> Result<Option<Transaction>, StoreError>;
    async fn find_by_merchant_id(&self, merchant_id: &str)
        -> Result<Option<Transaction>, StoreError>;
    /// Корреляция обратного вызова шлюза: пара (session, order) идентифицирует
    /// транзакцию однозначно.
    async fn find_by_gateway(
        &self,
        session_id: &str,
        order_id: &str,
    ) -> Result<Option<Transaction>, StoreError>;
    async fn find_pending_for_order(&self, order_id: i64)
        -> Result<Vec<Transaction>, StoreError>;
    async fn list_for_user(&self, user_id: i64) -> Result<Vec<Transaction>, StoreError>;
    /// Pending-транзакции, созданные до cutoff и еще не истекшие.
    async fn stale_pending(&self, cutoff: DateTime<Utc>) -> Result<Vec<Transaction>, StoreError>;
    /// CAS-запись: сохраняет `txn`, только если текущая версия в хранилище
    /// равна `expected_version`. Возвращает сохраненную копию с новой версией.
    async fn update(
        &self,
        txn: Transaction,
        expected_version: u64,
    ) -> Result<Transaction, StoreError>;
}

#[derive(Default, Clone)]
pub struct InMemoryStore {
    inner: Arc<RwLock<HashMap<Uuid, Transaction>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionStore for InMemoryStore {
    async fn insert(&self, txn: Transaction) -> Result<(), StoreError> {
        let mut map = self.inner.write().await;
        if map
            .values()
            .any(|t| t.merchant_transaction_id == txn.merchant_transaction_id)
        {
            return Err(StoreError::DuplicateMerchantId(txn.merchant_transaction_id));
        }
        map.insert(txn.id, txn);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Transaction>, StoreError> {
        Ok(self.inner.read().await.get(&id).cloned())
    }

    async fn find_by_merchant_id(
        &self,
        merchant_id: &str,
    ) -> Result<Option<Transaction>, StoreError> {
        let map = self.inner.read().await;
        Ok(map
            .values()
            .find(|t| t.merchant_transaction_id == merchant_id)
            .cloned())
    }

    async fn find_by_gateway(
        &self,
        session_id: &str,
        order_id: &str,
    ) -> Result<Option<Transaction>, StoreError> {
        let map = self.inner.read().await;
        Ok(map
            .values()
            .find(|t| {
                t.gateway_session_id.as_deref() == Some(session_id)
                    && t.gateway_order_id.as_deref() == Some(order_id)
            })
            .cloned())
    }

    async fn find_pending_for_order(
        &self,
        order_id: i64,
    ) -> Result<Vec<Transaction>, StoreError> {
        let map = self.inner.read().await;
        Ok(map
            .values()
            .filter(|t| t.order_id == Some(order_id) && t.status == TransactionStatus::Pending)
            .cloned()
            .collect())
    }

    async fn list_for_user(&self, user_id: i64) -> Result<Vec<Transaction>, StoreError> {
        let map = self.inner.read().await;
        let mut txns: Vec<Transaction> = map
            .values()
            .filter(|t| t.user_id == Some(user_id))
            .cloned()
            .collect();
        txns.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(txns)
    }

    async fn stale_pending(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, StoreError> {
        let map = self.inner.read().await;
        Ok(map
            .values()
            .filter(|t| {
                t.status == TransactionStatus::Pending
                    && t.expired_at.is_none()
                    && t.created_at <= cutoff
            })
            .cloned()
            .collect())
    }

    async fn update(
        &self,
        mut txn: Transaction,
        expected_version: u64,
    ) -> Result<Transaction, StoreError> {
        let mut map = self.inner.write().await;
        let current = map.get(&txn.id).ok_or(StoreError::NotFound(txn.id))?;
        if current.version != expected_version {
            return Err(StoreError::Conflict(txn.id));
        }
        txn.version = expected_version + 1;
        txn.updated_at = Utc::now();
        map.insert(txn.id, txn.clone());
        Ok(txn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn txn(merchant_id: &str) -> Transaction {
        Transaction::new_pending(merchant_id.to_string(), dec!(100), "NGN".to_string())
    }

    #[tokio::test]
    async fn duplicate_merchant_id_is_rejected() {
        let store = InMemoryStore::new();
        store.insert(txn("m-1")).await.unwrap();

        let err = store.insert(txn("m-1")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateMerchantId(_)));
    }

    #[tokio::test]
    async fn update_with_stale_version_conflicts() {
        let store = InMemoryStore::new();
        let t = txn("m-1");
        let id = t.id;
        store.insert(t).await.unwrap();

        let read = store.get(id).await.unwrap().unwrap();
        let mut first = read.clone();
        first.status = TransactionStatus::Successful;
        let saved = store.update(first, read.version).await.unwrap();
        assert_eq!(saved.version, read.version + 1);

        // Запись с той же исходной версией после чужого сохранения
        let mut second = read.clone();
        second.status = TransactionStatus::Unsuccessful;
        let err = store.update(second, read.version).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let current = store.get(id).await.unwrap().unwrap();
        assert_eq!(current.status, TransactionStatus::Successful);
    }

    #[tokio::test]
    async fn find_by_gateway_requires_both_ids() {
        let store = InMemoryStore::new();
        let mut t = txn("m-1");
        t.gateway_session_id = Some("sess-1".to_string());
        t.gateway_order_id = Some("ord-1".to_string());
        store.insert(t).await.unwrap();

        assert!(store.find_by_gateway("sess-1", "ord-1").await.unwrap().is_some());
        assert!(store.find_by_gateway("sess-1", "ord-2").await.unwrap().is_none());
        assert!(store.find_by_gateway("sess-2", "ord-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_pending_skips_terminal_and_already_expired() {
        let store = InMemoryStore::new();
        let cutoff = Utc::now() + Duration::seconds(1);

        let pending = txn("m-1");
        let pending_id = pending.id;
        store.insert(pending).await.unwrap();

        let mut done = txn("m-2");
        done.status = TransactionStatus::Successful;
        store.insert(done).await.unwrap();

        let mut expired = txn("m-3");
        expired.expired_at = Some(Utc::now());
        store.insert(expired).await.unwrap();

        let stale = store.stale_pending(cutoff).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, pending_id);
    }
}

use anyhow::{bail, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Запись в кошельке пользователя. Balance считается на момент зачисления.
#[derive(Debug, Clone, Serialize)]
pub struct WalletEntry {
    pub amount: Decimal,
    pub balance: Decimal,
    pub reason: String,
    pub mode: WalletMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletMode {
    PaymentRefund,
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    /// Пользователи, созданные автоматически при зачислении в кошелек,
    /// не имеют пароля и не могут войти.
    #[serde(skip)]
    pub has_password: bool,
}

/// User accounts and their store-credit wallets, as owned by the host shop.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>>;
    /// Create a login-incapable account to attach a wallet credit to.
    async fn create_minimal(&self, email: &str) -> Result<User>;
    async fn get(&self, user_id: i64) -> Result<Option<User>>;
    async fn wallet_total(&self, user_id: i64) -> Result<Decimal>;
    async fn credit_wallet(&self, user_id: i64, entry: WalletEntry) -> Result<()>;
    async fn authenticate(&self, email: &str, password: &str) -> Result<Option<User>>;
}

#[derive(Debug, Clone)]
struct StoredUser {
    email: String,
    password: Option<String>,
    wallet: Vec<WalletEntry>,
}

#[derive(Default)]
struct UsersInner {
    by_id: HashMap<i64, StoredUser>,
    next_id: i64,
}

#[derive(Default, Clone)]
pub struct InMemoryUsers {
    inner: Arc<RwLock<UsersInner>>,
}

impl InMemoryUsers {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_with_password(&self, email: &str, password: &str) -> User {
        let mut inner = self.inner.write().await;
        inner.next_id += 1;
        let id = inner.next_id;
        inner.by_id.insert(
            id,
            StoredUser {
                email: email.to_string(),
                password: Some(password.to_string()),
                wallet: Vec::new(),
            },
        );
        User { id, email: email.to_string(), has_password: true }
    }

    pub async fn wallet(&self, user_id: i64) -> Vec<WalletEntry> {
        self.inner
            .read()
            .await
            .by_id
            .get(&user_id)
            .map(|u| u.wallet.clone())
            .unwrap_or_default()
    }

    fn to_user(id: i64, stored: &StoredUser) -> User {
        User { id, email: stored.email.clone(), has_password: stored.password.is_some() }
    }
}

#[async_trait]
impl UserDirectory for InMemoryUsers {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_id
            .iter()
            .find(|(_, u)| u.email == email)
            .map(|(id, u)| Self::to_user(*id, u)))
    }

    async fn create_minimal(&self, email: &str) -> Result<User> {
        let mut inner = self.inner.write().await;
        inner.next_id += 1;
        let id = inner.next_id;
        inner.by_id.insert(
            id,
            StoredUser { email: email.to_string(), password: None, wallet: Vec::new() },
        );
        Ok(User { id, email: email.to_string(), has_password: false })
    }

    async fn get(&self, user_id: i64) -> Result<Option<User>> {
        let inner = self.inner.read().await;
        Ok(inner.by_id.get(&user_id).map(|u| Self::to_user(user_id, u)))
    }

    async fn wallet_total(&self, user_id: i64) -> Result<Decimal> {
        let inner = self.inner.read().await;
        match inner.by_id.get(&user_id) {
            // Баланс = balance последней записи, а не сумма amount
            Some(u) => Ok(u.wallet.last().map(|e| e.balance).unwrap_or(Decimal::ZERO)),
            None => bail!("user {} not found", user_id),
        }
    }

    async fn credit_wallet(&self, user_id: i64, entry: WalletEntry) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.by_id.get_mut(&user_id) {
            Some(u) => {
                u.wallet.push(entry);
                Ok(())
            }
            None => bail!("user {} not found", user_id),
        }
    }

    async fn authenticate(&self, email: &str, password: &str) -> Result<Option<User>> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_id
            .iter()
            .find(|(_, u)| u.email == email && u.password.as_deref() == Some(password))
            .map(|(id, u)| Self::to_user(*id, u)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn minimal_user_cannot_authenticate() {
        let users = InMemoryUsers::new();
        let user = users.create_minimal("ghost@test.com").await.unwrap();
        assert!(!user.has_password);
        assert!(users.authenticate("ghost@test.com", "").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn wallet_total_follows_last_balance() {
        let users = InMemoryUsers::new();
        let user = users.create_minimal("buyer@test.com").await.unwrap();
        assert_eq!(users.wallet_total(user.id).await.unwrap(), Decimal::ZERO);

        users
            .credit_wallet(
                user.id,
                WalletEntry {
                    amount: dec!(100),
                    balance: dec!(100),
                    reason: "transferred from transaction:12345678910121".to_string(),
                    mode: WalletMode::PaymentRefund,
                },
            )
            .await
            .unwrap();
        users
            .credit_wallet(
                user.id,
                WalletEntry {
                    amount: dec!(50),
                    balance: dec!(150),
                    reason: "transferred from transaction:12345678910122".to_string(),
                    mode: WalletMode::PaymentRefund,
                },
            )
            .await
            .unwrap();

        assert_eq!(users.wallet_total(user.id).await.unwrap(), dec!(150));
        assert_eq!(users.wallet(user.id).await.len(), 2);
    }

    #[tokio::test]
    async fn authenticate_checks_password() {
        let users = InMemoryUsers::new();
        users.create_with_password("admin@test.com", "secret").await;

        assert!(users.authenticate("admin@test.com", "secret").await.unwrap().is_some());
        assert!(users.authenticate("admin@test.com", "wrong").await.unwrap().is_none());
    }
}

use anyhow::{bail, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Read-only view of an order, as reported by the host shop domain.
#[derive(Debug, Clone, Serialize)]
pub struct OrderSnapshot {
    pub id: i64,
    pub email: String,
    pub state: String,
    pub total: Decimal,
    pub paid: bool,
    pub completed: bool,
    pub insufficient_stock: bool,
    pub inventory_released: bool,
}

impl OrderSnapshot {
    /// Причина, по которой заказ нельзя оплатить картой, если она есть.
    pub fn reason_if_cant_pay_by_card(&self) -> Option<&'static str> {
        if self.total <= Decimal::ZERO {
            Some("Order Total is invalid")
        } else if self.completed {
            Some("Order already completed")
        } else if self.insufficient_stock {
            Some("An item in your cart has become unavailable.")
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentState {
    Pending,
    Complete,
    Failed,
}

/// The slice of the order/checkout domain this crate consumes. The shop owns
/// order workflow and inventory; we only call across this seam.
#[async_trait]
pub trait OrderDirectory: Send + Sync {
    async fn get(&self, order_id: i64) -> Result<Option<OrderSnapshot>>;
    async fn reserve_stock(&self, order_id: i64) -> Result<()>;
    /// Idempotent: an order whose inventory is already back in stock is left alone.
    async fn release_inventory(&self, order_id: i64) -> Result<()>;
    /// Advance the order one checkout step (Spree's `next!`).
    async fn advance(&self, order_id: i64) -> Result<()>;
    async fn complete_pending_payments(&self, order_id: i64) -> Result<()>;
    async fn fail_pending_payments(&self, order_id: i64) -> Result<()>;
}

// Порядок шагов чекаута; advance двигает заказ на один шаг вправо
const CHECKOUT_STEPS: &[&str] = &["cart", "address", "delivery", "payment", "confirm", "complete"];

#[derive(Debug, Clone)]
struct StoredOrder {
    email: String,
    state: String,
    total: Decimal,
    paid: bool,
    insufficient_stock: bool,
    stock_reserved: bool,
    inventory_released: bool,
    releases: u32,
    release_calls: u32,
    payments: Vec<PaymentState>,
}

/// In-memory order directory backing the binary and the test suites.
#[derive(Default, Clone)]
pub struct InMemoryOrders {
    inner: Arc<RwLock<HashMap<i64, StoredOrder>>>,
}

impl InMemoryOrders {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, order_id: i64, email: &str, total: Decimal) {
        let mut orders = self.inner.write().await;
        orders.insert(
            order_id,
            StoredOrder {
                email: email.to_string(),
                state: "payment".to_string(),
                total,
                paid: false,
                insufficient_stock: false,
                stock_reserved: false,
                inventory_released: false,
                releases: 0,
                release_calls: 0,
                payments: vec![PaymentState::Pending],
            },
        );
    }

    pub async fn set_paid(&self, order_id: i64, paid: bool) {
        if let Some(o) = self.inner.write().await.get_mut(&order_id) {
            o.paid = paid;
        }
    }

    pub async fn set_state(&self, order_id: i64, state: &str) {
        if let Some(o) = self.inner.write().await.get_mut(&order_id) {
            o.state = state.to_string();
        }
    }

    pub async fn set_total(&self, order_id: i64, total: Decimal) {
        if let Some(o) = self.inner.write().await.get_mut(&order_id) {
            o.total = total;
        }
    }

    pub async fn set_insufficient_stock(&self, order_id: i64, value: bool) {
        if let Some(o) = self.inner.write().await.get_mut(&order_id) {
            o.insufficient_stock = value;
        }
    }

    pub async fn state(&self, order_id: i64) -> Option<String> {
        self.inner.read().await.get(&order_id).map(|o| o.state.clone())
    }

    pub async fn payment_states(&self, order_id: i64) -> Vec<PaymentState> {
        self.inner
            .read()
            .await
            .get(&order_id)
            .map(|o| o.payments.clone())
            .unwrap_or_default()
    }

    /// Сколько раз инвентарь реально вернулся на склад.
    pub async fn releases(&self, order_id: i64) -> u32 {
        self.inner.read().await.get(&order_id).map(|o| o.releases).unwrap_or(0)
    }

    /// Сколько раз release_inventory вообще вызывался.
    pub async fn release_calls(&self, order_id: i64) -> u32 {
        self.inner
            .read()
            .await
            .get(&order_id)
            .map(|o| o.release_calls)
            .unwrap_or(0)
    }

    pub async fn stock_reserved(&self, order_id: i64) -> bool {
        self.inner
            .read()
            .await
            .get(&order_id)
            .map(|o| o.stock_reserved && !o.inventory_released)
            .unwrap_or(false)
    }

    fn snapshot(order_id: i64, o: &StoredOrder) -> OrderSnapshot {
        OrderSnapshot {
            id: order_id,
            email: o.email.clone(),
            state: o.state.clone(),
            total: o.total,
            paid: o.paid,
            completed: o.state == "complete",
            insufficient_stock: o.insufficient_stock,
            inventory_released: o.inventory_released,
        }
    }
}

#[async_trait]
impl OrderDirectory for InMemoryOrders {
    async fn get(&self, order_id: i64) -> Result<Option<OrderSnapshot>> {
        let orders = self.inner.read().await;
        Ok(orders.get(&order_id).map(|o| Self::snapshot(order_id, o)))
    }

    async fn reserve_stock(&self, order_id: i64) -> Result<()> {
        let mut orders = self.inner.write().await;
        match orders.get_mut(&order_id) {
            Some(o) => {
                o.stock_reserved = true;
                o.inventory_released = false;
                Ok(())
            }
            None => bail!("order {} not found", order_id),
        }
    }

    async fn release_inventory(&self, order_id: i64) -> Result<()> {
        let mut orders = self.inner.write().await;
        match orders.get_mut(&order_id) {
            Some(o) => {
                o.release_calls += 1;
                if o.stock_reserved && !o.inventory_released {
                    o.inventory_released = true;
                    o.releases += 1;
                }
                Ok(())
            }
            None => bail!("order {} not found", order_id),
        }
    }

    async fn advance(&self, order_id: i64) -> Result<()> {
        let mut orders = self.inner.write().await;
        match orders.get_mut(&order_id) {
            Some(o) => {
                let position = CHECKOUT_STEPS.iter().position(|s| *s == o.state);
                if let Some(i) = position {
                    if i + 1 < CHECKOUT_STEPS.len() {
                        o.state = CHECKOUT_STEPS[i + 1].to_string();
                    }
                }
                Ok(())
            }
            None => bail!("order {} not found", order_id),
        }
    }

    async fn complete_pending_payments(&self, order_id: i64) -> Result<()> {
        let mut orders = self.inner.write().await;
        match orders.get_mut(&order_id) {
            Some(o) => {
                for p in o.payments.iter_mut().filter(|p| **p == PaymentState::Pending) {
                    *p = PaymentState::Complete;
                }
                o.paid = true;
                Ok(())
            }
            None => bail!("order {} not found", order_id),
        }
    }

    async fn fail_pending_payments(&self, order_id: i64) -> Result<()> {
        let mut orders = self.inner.write().await;
        match orders.get_mut(&order_id) {
            Some(o) => {
                for p in o.payments.iter_mut().filter(|p| **p == PaymentState::Pending) {
                    *p = PaymentState::Failed;
                }
                Ok(())
            }
            None => bail!("order {} not found", order_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn zero_total_cannot_pay_by_card() {
        let snapshot = OrderSnapshot {
            id: 1,
            email: "a@b.c".to_string(),
            state: "payment".to_string(),
            total: Decimal::ZERO,
            paid: false,
            completed: false,
            insufficient_stock: false,
            inventory_released: false,
        };
        assert_eq!(snapshot.reason_if_cant_pay_by_card(), Some("Order Total is invalid"));
    }

    #[test]
    fn completed_order_cannot_pay_by_card() {
        let snapshot = OrderSnapshot {
            id: 1,
            email: "a@b.c".to_string(),
            state: "complete".to_string(),
            total: dec!(100),
            paid: false,
            completed: true,
            insufficient_stock: false,
            inventory_released: false,
        };
        assert_eq!(snapshot.reason_if_cant_pay_by_card(), Some("Order already completed"));
    }

    #[test]
    fn insufficient_stock_cannot_pay_by_card() {
        let snapshot = OrderSnapshot {
            id: 1,
            email: "a@b.c".to_string(),
            state: "payment".to_string(),
            total: dec!(100),
            paid: false,
            completed: false,
            insufficient_stock: true,
            inventory_released: false,
        };
        assert_eq!(
            snapshot.reason_if_cant_pay_by_card(),
            Some("An item in your cart has become unavailable.")
        );
    }

    #[tokio::test]
    async fn release_inventory_is_idempotent() {
        let orders = InMemoryOrders::new();
        orders.create(7, "a@b.c", dec!(50)).await;
        orders.reserve_stock(7).await.unwrap();

        orders.release_inventory(7).await.unwrap();
        orders.release_inventory(7).await.unwrap();

        assert_eq!(orders.releases(7).await, 1);
        assert_eq!(orders.release_calls(7).await, 2);
    }

    #[tokio::test]
    async fn advance_walks_the_checkout_steps() {
        let orders = InMemoryOrders::new();
        orders.create(7, "a@b.c", dec!(50)).await;
        orders.set_state(7, "confirm").await;

        orders.advance(7).await.unwrap();

        let snapshot = orders.get(7).await.unwrap().unwrap();
        assert_eq!(snapshot.state, "complete");
        assert!(snapshot.completed);
    }

    #[tokio::test]
    async fn payment_state_bookkeeping() {
        let orders = InMemoryOrders::new();
        orders.create(7, "a@b.c", dec!(50)).await;

        orders.complete_pending_payments(7).await.unwrap();
        assert_eq!(orders.payment_states(7).await, vec![PaymentState::Complete]);

        let snapshot = orders.get(7).await.unwrap().unwrap();
        assert!(snapshot.paid);
    }
}

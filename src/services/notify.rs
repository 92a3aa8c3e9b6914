//! Уведомления пользователю об исходе платежа.
//!
//! Диспетчер эффектов только ставит id транзакции в очередь; формирование и
//! отправка письма происходят в фоновом воркере, чтобы не задерживать
//! обработку ответа шлюза.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::storage::TransactionStore;

pub trait Notifier: Send + Sync {
    fn enqueue(&self, transaction_id: Uuid) -> Result<()>;
}

/// Очередь уведомлений на tokio-канале.
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Uuid>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Uuid>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn enqueue(&self, transaction_id: Uuid) -> Result<()> {
        self.tx.send(transaction_id)?;
        Ok(())
    }
}

/// Фоновый воркер: читает очередь и отправляет письма.
pub async fn run_worker(
    store: Arc<dyn TransactionStore>,
    mut rx: mpsc::UnboundedReceiver<Uuid>,
    store_name: String,
    store_url: String,
) {
    info!("Notification worker started");
    while let Some(id) = rx.recv().await {
        match store.get(id).await {
            Ok(Some(txn)) => {
                // Здесь настоящий почтовый транспорт; пока пишем в лог
                info!(
                    transaction_id = %txn.id,
                    status = %txn.status,
                    subject = %format!(
                        "{} - Unified Payment Transaction {} notification",
                        store_name, txn.status
                    ),
                    reply_to = %format!("no-reply@{}", store_url),
                    "Payment status notification sent"
                );
            }
            Ok(None) => warn!(transaction_id = %id, "Notification skipped - transaction missing"),
            Err(e) => warn!(transaction_id = %id, error = %e, "Notification lookup failed"),
        }
    }
    info!("Notification worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_delivers_to_receiver() {
        let (notifier, mut rx) = ChannelNotifier::new();
        let id = Uuid::new_v4();
        notifier.enqueue(id).unwrap();
        assert_eq!(rx.recv().await, Some(id));
    }

    #[tokio::test]
    async fn worker_drains_queue_and_stops_when_senders_drop() {
        let store: Arc<dyn TransactionStore> = Arc::new(crate::storage::InMemoryStore::new());
        let (notifier, rx) = ChannelNotifier::new();
        notifier.enqueue(Uuid::new_v4()).unwrap();
        drop(notifier);

        run_worker(store, rx, "Store".to_string(), "store.test".to_string()).await;
    }
}

pub mod order;
pub mod transaction;
pub mod user;

pub use order::{InMemoryOrders, OrderDirectory, OrderSnapshot, PaymentState};
pub use transaction::{Effect, Transaction, TransactionStatus};
pub use user::{InMemoryUsers, User, UserDirectory, WalletEntry, WalletMode};
